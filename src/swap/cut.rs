//! Cut phase: drive the toolhead through the cutter lever.

use crate::host::Host;
use crate::MmsCore;

impl<H: Host> MmsCore<H> {
    /// Park at the cutter entry point.
    pub(crate) async fn cut_init(&self) {
        let (x, y) = self.config().cut.cutter_init_point;
        self.host().move_xy(x, y, None, true).await;
    }

    async fn cut_final(&self) {
        let (x, y) = self.config().cut.cutter_final_point;
        self.host()
            .move_xy(x, y, Some(self.config().cut.cut_speed), true)
            .await;
    }

    fn cut_safety_checks(&self, slot: Option<usize>) -> bool {
        if slot.is_none() {
            warn!("current slot is None, return");
            return false;
        }
        if self.swap.cut_running.get() {
            warn!("another cut is running, return");
            return false;
        }
        if !self.host().is_homed() {
            warn!("toolhead is not homed, return");
            return false;
        }
        true
    }

    /// Cut the filament of the currently served slot.
    pub async fn mms_cut(&self) -> bool {
        let slot = self.current_slot();
        if !self.cut_safety_checks(slot) {
            return false;
        }
        if !self.config().cut.enable {
            warn!("cut is disabled");
            return false;
        }
        let slot = slot.unwrap();

        // The extruder is about to move filament the monitor cannot see
        let buffer = self.buffer_of(slot).index();
        self.deactivate_buffer_monitor(buffer);

        info!("slot[{}] cut begin", slot);
        self.swap.cut_running.set(true);
        let _running = CutRunningGuard { core: self };

        self.cut_init().await;
        self.cut_final().await;
        self.cut_init().await;

        info!("slot[{}] cut finish", slot);
        true
    }
}

struct CutRunningGuard<'a, H: Host> {
    core: &'a MmsCore<H>,
}

impl<H: Host> Drop for CutRunningGuard<'_, H> {
    fn drop(&mut self) {
        self.core.swap.cut_running.set(false);
    }
}
