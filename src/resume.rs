//! MMS resume takeover.
//!
//! The host routes its resume path through [`MmsCore::mms_resume`]. A
//! resume of a print the MMS itself paused first replays the registered
//! resume hook (typically the swap invocation that failed); only then is
//! the host's original resume forwarded so the host state machine
//! advances. A failing hook re-latches the pause and re-asserts the
//! paused flag shortly after.

use core::cell::Cell;

use embassy_time::Duration;

use crate::host::Host;
use crate::MmsCore;

/// The scheduled-resume command replayed on the next resume.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum ResumeHook {
    /// Re-run the swap command `T<slot>`.
    Swap { slot: usize },
}

pub struct ResumeState {
    resuming: Cell<bool>,
    hook: Cell<Option<ResumeHook>>,
}

impl ResumeState {
    pub(crate) fn new() -> Self {
        Self {
            resuming: Cell::new(false),
            hook: Cell::new(None),
        }
    }

    pub fn is_resuming(&self) -> bool {
        self.resuming.get()
    }

    pub(crate) fn has_hook(&self) -> bool {
        self.hook.get().is_some()
    }
}

struct ResumingGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for ResumingGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

impl<H: Host> MmsCore<H> {
    /// Register the swap invocation to replay on the next resume.
    pub(crate) fn set_swap_resume(&self, slot: usize) {
        self.resume.hook.set(Some(ResumeHook::Swap { slot }));
        info!("'T{}' is set as the mms resume command", slot);
    }

    /// Replay the registered hook. Missing hook falls through to the
    /// origin resume with a warning.
    async fn resume_mms_swap(&self) -> bool {
        let Some(hook) = self.resume.hook.take() else {
            warn!("no mms resume is set, continue with origin resume");
            return true;
        };

        self.restore_target_temp().await;

        // The hook is cleared before running so a failure inside it can
        // register a fresh pause without being overwritten.
        match hook {
            ResumeHook::Swap { slot } => self.cmd_swap(slot).await,
        }
    }

    /// The resume entry point the host delegates to.
    pub async fn mms_resume(&self) -> bool {
        if self.resume.is_resuming() {
            warn!("mms_resume is resuming, return...");
            return false;
        }

        debug!("mms_resume begin");

        if self.pause.is_mms_paused() {
            let _resuming = ResumingGuard { flag: &self.resume.resuming };
            self.resume.resuming.set(true);

            // Free the paused state early so the replayed swap may run
            self.host().set_paused_flag(false);
            self.pause.free_mms_paused();

            let success = self.resume_mms_swap().await;
            if !success {
                warn!("mms_resume resume failed, resume abort...");
                self.pause.set_mms_paused();
                // Re-assert the host paused flag once the resume path has
                // unwound
                self.host().pause(Duration::from_secs(1)).await;
                self.host().set_paused_flag(true);
                return false;
            }
        }

        debug!("mms_resume wakeup origin resume command");
        self.host().run_resume().await;
        debug!("mms_resume finish");
        true
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::host::PrintState;
    use crate::testing::ready_core;

    #[test]
    fn resume_without_mms_pause_delegates_to_origin() {
        let core = ready_core(4);
        assert!(block_on(core.mms_resume()));
        assert_eq!(core.host().resume_calls(), 1);
    }

    #[test]
    fn resume_clears_latch_and_forwards() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        block_on(core.mms_pause());

        assert!(block_on(core.mms_resume()));
        assert!(!core.pause.is_mms_paused());
        assert_eq!(core.host().resume_calls(), 1);
        assert!(!core.resume.is_resuming());
    }

    #[test]
    fn failed_hook_relatches_pause() {
        let core = ready_core(4);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        block_on(core.mms_pause());

        // Register a swap hook that will fail its safety checks (toolhead
        // not homed)
        core.set_swap_resume(1);
        core.host().set_homed(false);

        assert!(!block_on(core.mms_resume()));
        assert!(core.pause.is_mms_paused());
        assert!(core.host().paused_flag());
        // Origin resume never ran
        assert_eq!(core.host().resume_calls(), 0);
        core.host().set_homed(true);
    }
}
