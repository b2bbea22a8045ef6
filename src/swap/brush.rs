//! Brush phase: wipe and peck the nozzle over the brush.

use crate::host::Host;
use crate::MmsCore;

impl<H: Host> MmsCore<H> {
    fn brush_safety_checks(&self) -> bool {
        if self.swap.brush_running.get() {
            warn!("another brush is running, return");
            return false;
        }
        if !self.host().is_homed() {
            warn!("toolhead is not homed, return");
            return false;
        }
        true
    }

    /// Drag the nozzle across the wipe points.
    pub(crate) async fn brush_wipe(&self) -> bool {
        if !self.brush_safety_checks() {
            return false;
        }
        let b = &self.config().brush;
        if b.wipe_points.is_empty() {
            warn!("wipe_points is not available, return");
            return false;
        }

        self.swap.brush_running.set(true);
        let _running = BrushRunningGuard { core: self };

        for _ in 0..b.wipe_times {
            for &(x, y) in &b.wipe_points {
                self.host().move_xy(x, y, Some(b.wipe_speed), false).await;
            }
        }
        self.host().wait_moves().await;
        true
    }

    /// Plunge the nozzle into the brush bristles.
    pub(crate) async fn brush_peck(&self) -> bool {
        if !self.brush_safety_checks() {
            return false;
        }
        let b = &self.config().brush;
        let Some((x, y)) = b.peck_point else {
            warn!("peck_point is not available, return");
            return false;
        };

        self.swap.brush_running.set(true);
        let _running = BrushRunningGuard { core: self };

        self.host().move_xy(x, y, None, true).await;
        let z = self.host().position().z;
        for _ in 0..b.peck_times {
            self.host().move_z(z - b.peck_depth, Some(b.peck_speed), false).await;
            self.host().move_z(z, Some(b.peck_speed), false).await;
        }
        self.host().wait_moves().await;
        true
    }

    /// Wipe then peck inside a fan-cooldown window.
    pub async fn mms_brush(&self) -> bool {
        if let Some(before) = self.config().brush.custom_before.clone() {
            self.host().run_macro(&before).await;
        }

        if !self.config().brush.enable {
            debug!("MMS brush is disabled, skip...");
            return true;
        }
        if !self.brush_safety_checks() {
            return false;
        }

        let b = &self.config().brush;
        let fan = self.fan_cooldown_begin(b.fan_cooldown_speed, b.fan_cooldown_wait).await;
        let success = self.brush_wipe().await && self.brush_peck().await;
        self.fan_cooldown_end(fan);

        if !success {
            warn!("brush failed");
            return false;
        }

        if let Some(after) = self.config().brush.custom_after.clone() {
            self.host().run_macro(&after).await;
        }
        true
    }
}

struct BrushRunningGuard<'a, H: Host> {
    core: &'a MmsCore<H>,
}

impl<H: Host> Drop for BrushRunningGuard<'_, H> {
    fn drop(&mut self) {
        self.core.swap.brush_running.set(false);
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::host::Toolhead;
    use crate::testing::{ready_core, ToolheadOp};

    #[test]
    fn brush_wipes_every_point_each_pass() {
        let core = ready_core(4);
        core.host().clear_toolhead_ops();

        assert!(block_on(core.mms_brush()));

        let wipes = core
            .host()
            .toolhead_ops()
            .iter()
            .filter(|op| matches!(op, ToolheadOp::MoveXY(x, _) if *x == 90.0 || *x == 60.0))
            .count();
        // 2 points x 5 passes
        assert_eq!(wipes, 10);
        assert!(!core.swap.brush_running.get());
    }

    #[test]
    fn brush_restores_fan_speed() {
        let core = ready_core(4);
        core.host().set_fan_speed(0.3);
        assert!(block_on(core.mms_brush()));
        assert_eq!(core.host().fan_speed(), 0.3);
    }

    #[test]
    fn unhomed_toolhead_refuses_brush() {
        let core = ready_core(4);
        core.host().set_homed(false);
        assert!(!block_on(core.mms_brush()));
        core.host().set_homed(true);
    }
}
