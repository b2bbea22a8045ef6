//! Autoload: react to freshly inserted filament.
//!
//! Inlet new-trigger edges signal the autoload task. The reactor is
//! single-flight and heavily gated: it runs only on an idle machine and
//! only after a quiet period following startup, to swallow boot-time
//! spurious triggers. On fire it unloads every other loading slot and
//! prepares the new one.

use core::cell::Cell;

use crate::host::Host;
use crate::slot::PinKind;
use crate::MmsCore;

pub struct AutoloadState {
    in_progress: Cell<bool>,
    should_break: Cell<bool>,
}

impl AutoloadState {
    pub(crate) fn new() -> Self {
        Self {
            in_progress: Cell::new(false),
            should_break: Cell::new(false),
        }
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.get()
    }

    pub(crate) fn can_request(&self) -> bool {
        true
    }
}

struct ExecutionGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl<H: Host> MmsCore<H> {
    fn autoload_delay_satisfied(&self) -> bool {
        let delay = self.config().autoload.delay.as_micros() as f64 / 1_000_000.0;
        match self.ready_for() {
            Some(elapsed) => elapsed > delay,
            None => false,
        }
    }

    fn autoload_can_execute(&self) -> bool {
        if !self.autoload_delay_satisfied() {
            return false;
        }
        if self.autoload.in_progress.get() {
            return false;
        }

        let checks: [(bool, &str); 7] = [
            (self.drive_is_running(), "drive is running"),
            (self.selector_is_running(), "selector is running"),
            (self.printer_is_shutdown(), "printer is shutdown"),
            (self.printer_is_printing(), "printer is printing"),
            (self.printer_is_paused(), "printer is paused"),
            (self.printer_is_resuming(), "printer is resuming"),
            (self.host().is_busy(), "toolhead is busy"),
        ];
        for (blocked, reason) in checks {
            if blocked {
                debug!("autoload skip: {}", reason);
                return false;
            }
        }
        true
    }

    /// Long-running reactor: drains insertion requests raised by inlet
    /// edges. Spawn on the host executor.
    pub async fn autoload_task(&self) -> ! {
        loop {
            let slot = self.autoload_signal.wait().await;
            self.autoload_execute(slot).await;
        }
    }

    /// Handle one new-filament insertion.
    pub async fn autoload_execute(&self, slot: usize) {
        if !self.autoload_can_execute() {
            return;
        }

        // Only a genuinely fresh insert qualifies
        let Some(inlet) = self.slot(slot).pin(PinKind::Inlet).sensor() else {
            return;
        };
        if !self.sensor(inlet).is_new_triggered() {
            warn!("slot[{}] is not a new insert, autoload skip...", slot);
            return;
        }

        self.autoload.in_progress.set(true);
        self.autoload.should_break.set(false);
        let _execution = ExecutionGuard { flag: &self.autoload.in_progress };
        info!("slot[{}] autoload begin", slot);

        if let Err(_e) = self.unload_loading_slots(Some(slot)).await {
            error!("slot[{}] autoload unload other slots failed", slot);
        }

        if self.autoload.should_break.get() {
            return;
        }

        if self.pin_triggered(slot, PinKind::Inlet) {
            self.mms_prepare(slot).await;
        }
        info!("slot[{}] autoload end", slot);
    }
}
