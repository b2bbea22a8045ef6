//! MMS-initiated print pausing.
//!
//! `mms_pause` is a single-entry gate: it refuses while already paused or
//! while a resume is in flight, latches `paused_by_mms`, remembers the
//! extruder target temperature for the matching resume, and hands over to
//! the host `PAUSE` macro.

use core::cell::Cell;

use crate::host::Host;
use crate::MmsCore;

pub struct PauseState {
    mms_paused: Cell<bool>,
    saved_target_temp: Cell<Option<f64>>,
}

impl PauseState {
    pub(crate) fn new() -> Self {
        Self {
            mms_paused: Cell::new(false),
            saved_target_temp: Cell::new(None),
        }
    }

    pub fn is_mms_paused(&self) -> bool {
        self.mms_paused.get()
    }

    pub(crate) fn set_mms_paused(&self) {
        self.mms_paused.set(true);
    }

    pub(crate) fn free_mms_paused(&self) {
        self.mms_paused.set(false);
    }

    pub(crate) fn save_target_temp(&self, temp: f64) {
        if let Some(old) = self.saved_target_temp.get() {
            warn!("resume target temp {} already saved, covered with {}", old, temp);
        }
        self.saved_target_temp.set(Some(temp));
    }

    pub(crate) fn take_target_temp(&self) -> Option<f64> {
        self.saved_target_temp.take()
    }
}

impl<H: Host> MmsCore<H> {
    /// Pause the print on behalf of the MMS. Returns whether a pause was
    /// actually issued.
    pub async fn mms_pause(&self) -> bool {
        if (self.observer.is_paused() || self.observer.is_finished())
            && !self.resume.is_resuming()
        {
            debug!("mms_pause skip, print is already paused or finished");
            return false;
        }
        if self.pause.is_mms_paused() {
            return false;
        }

        debug!("mms_pause begin");
        self.pause.set_mms_paused();
        self.pause
            .save_target_temp(self.host().extruder_target_temp());
        self.host().run_pause().await;
        debug!("mms_pause finish");
        true
    }

    /// Re-heat the extruder to the temperature saved at pause time. A
    /// hotter-than-saved extruder is left alone.
    pub(crate) async fn restore_target_temp(&self) {
        let Some(target) = self.pause.take_target_temp() else {
            warn!("no saved target temp, restore failed");
            return;
        };
        let current = self.host().extruder_temp();
        if target > current {
            self.host().set_extruder_temperature(target, true).await;
        } else {
            debug!("saved target temp {} not above current {}, restore skip", target, current);
        }
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::host::{PrintState, Toolhead};
    use crate::testing::ready_core;

    #[test]
    fn pause_latches_and_invokes_host_pause() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());

        assert!(block_on(core.mms_pause()));
        assert!(core.pause.is_mms_paused());
        assert_eq!(core.host().pause_calls(), 1);
    }

    #[test]
    fn pause_while_latched_is_a_noop() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());

        assert!(block_on(core.mms_pause()));
        assert!(!block_on(core.mms_pause()));
        assert_eq!(core.host().pause_calls(), 1);
    }

    #[test]
    fn pause_skips_when_already_paused_by_host() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Paused);
        block_on(core.observe_tick());

        assert!(!block_on(core.mms_pause()));
        assert_eq!(core.host().pause_calls(), 0);
    }

    #[test]
    fn saved_target_temp_restores_only_upward() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        block_on(core.mms_pause());

        // Extruder cooled down while paused
        block_on(core.host().set_extruder_temperature(150.0, true));
        block_on(core.restore_target_temp());
        assert_eq!(core.host().extruder_target_temp(), 215.0);
    }
}
