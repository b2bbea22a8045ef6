//! Print-state observer.
//!
//! A periodic task polls the host print state and converts transitions
//! into progress events. Hooks registered for an event run in
//! registration order on the reactor task; once-shot resume hooks run
//! once and are dropped.

use core::cell::{Cell, RefCell};

use alloc::vec::Vec;

use crate::host::{Host, PrintState};
use crate::MmsCore;

/// Progress of the observed print.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PrintProgress {
    Idle,
    Started,
    Pausing,
    Paused,
    Resuming,
    Resumed,
    Finished,
}

/// Events hooks can attach to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ObserverEvent {
    Started,
    Paused,
    Resumed,
    Finished,
}

/// Actions the observer can schedule. Dispatch happens on the observer
/// task, so hooks may run long operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ObserverHook {
    ActivateBufferMonitor(usize),
    DeactivateBufferMonitor(usize),
    /// Eject all loading slots when the print finishes.
    EjectAll,
    /// Drop the charge bookkeeping when the print finishes.
    ChargeTeardown,
    /// Stamp the swap map with the print filename.
    SwapInitFilename,
    /// Reset the swap map to identity.
    SwapResetMapping,
}

pub struct PrintObserver {
    state: Cell<Option<PrintState>>,
    progress: Cell<PrintProgress>,
    hooks: RefCell<Vec<(ObserverEvent, ObserverHook)>>,
    resume_once: RefCell<Vec<ObserverHook>>,
}

impl PrintObserver {
    pub(crate) fn new(buffer_count: usize) -> Self {
        let mut hooks = Vec::new();
        for buffer in 0..buffer_count {
            hooks.push((ObserverEvent::Resumed, ObserverHook::ActivateBufferMonitor(buffer)));
            hooks.push((ObserverEvent::Paused, ObserverHook::DeactivateBufferMonitor(buffer)));
            hooks.push((ObserverEvent::Finished, ObserverHook::DeactivateBufferMonitor(buffer)));
        }
        hooks.push((ObserverEvent::Finished, ObserverHook::EjectAll));
        hooks.push((ObserverEvent::Finished, ObserverHook::ChargeTeardown));
        hooks.push((ObserverEvent::Started, ObserverHook::SwapInitFilename));
        hooks.push((ObserverEvent::Finished, ObserverHook::SwapResetMapping));

        Self {
            state: Cell::new(None),
            progress: Cell::new(PrintProgress::Idle),
            hooks: RefCell::new(hooks),
            resume_once: RefCell::new(Vec::new()),
        }
    }

    pub fn progress(&self) -> PrintProgress {
        self.progress.get()
    }

    pub(crate) fn is_printing(&self) -> bool {
        self.state.get() == Some(PrintState::Printing)
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.state.get() == Some(PrintState::Paused)
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.state.get() == Some(PrintState::Finished)
    }

    /// Run `hook` once on the next resume.
    pub(crate) fn register_resume_once(&self, hook: ObserverHook) {
        self.resume_once.borrow_mut().push(hook);
    }

    fn hooks_for(&self, event: ObserverEvent) -> Vec<ObserverHook> {
        let mut out: Vec<ObserverHook> = self
            .hooks
            .borrow()
            .iter()
            .filter(|(e, _)| *e == event)
            .map(|(_, h)| *h)
            .collect();
        if event == ObserverEvent::Resumed {
            out.append(&mut self.resume_once.borrow_mut());
        }
        out
    }
}

impl<H: Host> MmsCore<H> {
    /// One poll of the print pipeline. Invoked by [`Self::observer_task`];
    /// exposed for deterministic stepping.
    pub async fn observe_tick(&self) {
        let prev = self.observer.state.get();
        let state = self.print_state();
        self.observer.state.set(Some(state));
        if prev == Some(state) {
            return;
        }

        let progress = if state == PrintState::Printing {
            if self.observer.progress.get() == PrintProgress::Paused {
                PrintProgress::Resumed
            } else {
                PrintProgress::Started
            }
        } else if self.host().pause_pending() {
            PrintProgress::Pausing
        } else if state == PrintState::Paused {
            PrintProgress::Paused
        } else if state == PrintState::Finished {
            PrintProgress::Finished
        } else {
            return;
        };

        self.observer.progress.set(progress);
        info!("print new progress: {:?}", progress);

        let event = match progress {
            PrintProgress::Started => ObserverEvent::Started,
            PrintProgress::Paused => ObserverEvent::Paused,
            PrintProgress::Resumed => ObserverEvent::Resumed,
            PrintProgress::Finished => ObserverEvent::Finished,
            _ => return,
        };
        for hook in self.observer.hooks_for(event) {
            self.run_observer_hook(hook).await;
        }
    }

    async fn run_observer_hook(&self, hook: ObserverHook) {
        match hook {
            ObserverHook::ActivateBufferMonitor(buffer) => self.activate_buffer_monitor(buffer),
            ObserverHook::DeactivateBufferMonitor(buffer) => self.deactivate_buffer_monitor(buffer),
            ObserverHook::EjectAll => {
                let _ = self.mms_eject(true).await;
            }
            ObserverHook::ChargeTeardown => self.charge_teardown(),
            ObserverHook::SwapInitFilename => {
                self.swap.init_mapping_filename(self.host().print_filename());
            }
            ObserverHook::SwapResetMapping => self.swap.reset_mapping(),
        }
    }

    /// Periodic observer loop; spawn on the host executor.
    pub async fn observer_task(&self) -> ! {
        let period = embassy_time::Duration::from_millis(200);
        loop {
            self.host().pause(period).await;
            self.observe_tick().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::host::PrintState;
    use crate::testing::ready_core;

    use super::{ObserverHook, PrintProgress};

    #[test]
    fn progress_follows_state_transitions() {
        let core = ready_core(4);
        assert_eq!(core.observer.progress(), PrintProgress::Idle);

        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        assert_eq!(core.observer.progress(), PrintProgress::Started);
        assert!(core.printer_is_printing());

        core.host().set_print_state(PrintState::Paused);
        block_on(core.observe_tick());
        assert_eq!(core.observer.progress(), PrintProgress::Paused);
        assert!(core.printer_is_paused());

        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        assert_eq!(core.observer.progress(), PrintProgress::Resumed);
    }

    #[test]
    fn unchanged_state_does_not_redispatch() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        let progress = core.observer.progress();
        block_on(core.observe_tick());
        assert_eq!(core.observer.progress(), progress);
    }

    #[test]
    fn pause_resume_toggles_buffer_monitor() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());

        core.host().set_print_state(PrintState::Paused);
        block_on(core.observe_tick());
        assert!(!core.buffer(0).is_activating());

        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        assert!(core.buffer(0).is_activating());
    }

    #[test]
    fn finish_resets_swap_mapping() {
        let core = ready_core(4);
        core.swap.update_mapping_slot_num(0, 3);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        core.host().set_print_state(PrintState::Finished);
        block_on(core.observe_tick());
        assert_eq!(core.swap.mapped_slot(0), Some(0));
    }

    #[test]
    fn resume_once_hooks_fire_once() {
        let core = ready_core(4);
        core.observer
            .register_resume_once(ObserverHook::DeactivateBufferMonitor(0));

        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        core.host().set_print_state(PrintState::Paused);
        block_on(core.observe_tick());
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        // Consumed on the resume
        assert!(core.observer.resume_once.borrow().is_empty());
    }
}
