//! Purge phase: extrude the color-mixed transition filament onto the tray.
//!
//! The purge volume follows the orphan filament length below the cutter
//! scaled by the purge modifier. The drive feeds the same volume from the
//! buffer side while the extruder purges, so the spring stays near its
//! working point.

use embassy_futures::join::join;

use crate::error::MmsError;
use crate::host::Host;
use crate::MmsCore;

impl<H: Host> MmsCore<H> {
    /// Purge length in mm of extrusion.
    pub(crate) fn purge_distance(&self) -> f64 {
        self.config().purge.orphan_filament_length * self.config().purge.purge_modifier
    }

    /// Park over the purge tray. Y first, to stay clear of the model.
    pub(crate) async fn purge_move_to_tray(&self) {
        let (x, y) = self.config().purge.tray_point;
        self.host().move_y(y, None, true).await;
        self.host().move_x(x, None, true).await;
    }

    /// Knock the purged blob off the tray.
    pub(crate) async fn tray_eject(&self) {
        let (x, y) = self.config().purge.eject_point;
        self.host().move_xy(x, y, None, true).await;
    }

    /// Hold the fan at cooldown speed; returns the speed to restore.
    pub(crate) async fn fan_cooldown_begin(&self, speed: f64, wait: f64) -> f64 {
        let previous = self.host().fan_speed();
        self.host().set_fan_speed(speed);
        self.host().dwell(wait).await;
        previous
    }

    pub(crate) fn fan_cooldown_end(&self, previous: f64) {
        self.host().set_fan_speed(previous);
    }

    /// Relax the buffer and retract a little so less material oozes from
    /// the nozzle.
    pub(crate) async fn apply_retraction_compensation(&self, slot: usize) -> crate::error::Result<()> {
        if !self.pause_swap_buffer(slot).await || !self.buffer_clear(slot).await {
            return Err(self.raise(MmsError::PurgeFailed { slot }));
        }

        let p = &self.config().purge;
        let distance = crate::fmin(
            crate::fabs(p.retraction_compensation),
            self.buffer_of(slot).spring_stroke(),
        );
        self.host().retract(distance, p.retract_speed, true).await;
        debug!("slot[{}] retraction compensation {} mm", slot, distance);
        Ok(())
    }

    /// Alternating retract/extrude pulses that break up a clogged nozzle
    /// tip, with the drive unloading the net retraction alongside.
    pub(crate) async fn pressure_pulse_cleaning(&self, slot: usize) -> crate::error::Result<()> {
        let p = &self.config().purge;
        if !p.pulse_clean_enable {
            return Ok(());
        }

        if !self.pause_swap_buffer(slot).await || !self.buffer_clear(slot).await {
            return Err(self.raise(MmsError::PurgeFailed { slot }));
        }

        let retracted = p.pulse_retract_dist - p.pulse_extrude_dist;
        let total_retracted = retracted * p.pulse_count as f64;
        let unload_dist = total_retracted - self.buffer_of(slot).spring_stroke();
        let unload_speed = p.pulse_speed / 60.0 * 0.5;

        debug!("slot[{}] pressure pulse cleaning begin", slot);
        let unload = self.mms_move(slot, -crate::fabs(unload_dist), Some(unload_speed), Some(unload_speed));
        let pulses = async {
            for _ in 0..p.pulse_count {
                self.host().retract(p.pulse_retract_dist, p.pulse_speed, true).await;
                self.host().dwell(p.pulse_rest_time).await;
                self.host().extrude(p.pulse_extrude_dist, p.pulse_speed, true).await;
                self.host().dwell(p.pulse_rest_time).await;
            }
        };
        join(unload, pulses).await;

        self.wait_selector_and_drive(slot).await;
        debug!(
            "slot[{}] pressure pulse cleaning finish, total retracted {} mm",
            slot, total_retracted
        );
        Ok(())
    }

    /// Full purge: center the buffer, park on the tray, feed and extrude
    /// the purge volume concurrently, then compensate retraction under
    /// the cooling fan.
    async fn standard_purge(&self, slot: usize) -> crate::error::Result<()> {
        debug!("slot[{}] standard purge begin", slot);
        let p = &self.config().purge;

        let purge_distance = self.purge_distance();
        let purge_volume = purge_distance * self.host().extruder_filament_area();
        let buffer = self.buffer_of(slot);
        let deliver_distance =
            purge_volume / buffer.cross_section() - buffer.spring_stroke() * 0.5;

        if !self.pause_swap_buffer(slot).await || !self.buffer_halfway(slot).await {
            return Err(self.raise(MmsError::PurgeFailed { slot }));
        }
        self.purge_move_to_tray().await;
        self.mms_select(slot).await;

        let drive = self.slot(slot).drive_stepper();
        self.stepper(drive).update_focus_slot(Some(slot));
        let feed_speed = p.purge_speed / 60.0;
        join(
            self.manual_move(drive, crate::fabs(deliver_distance), feed_speed, feed_speed),
            self.host().extrude(purge_distance, p.purge_speed, true),
        )
        .await;
        self.wait_drive(slot, None).await;

        let fan = self.fan_cooldown_begin(p.fan_cooldown_speed, p.fan_cooldown_wait).await;
        let result = self.apply_retraction_compensation(slot).await;
        self.fan_cooldown_end(fan);
        result?;

        debug!("slot[{}] standard purge finish", slot);
        Ok(())
    }

    /// Purge-disabled fallback: prime the nozzle with a short concurrent
    /// feed and extrusion.
    async fn apply_nozzle_priming(&self, slot: usize) -> crate::error::Result<()> {
        let p = &self.config().purge;
        debug!("slot[{}] purge with nozzle priming only", slot);

        if !self.pause_swap_buffer(slot).await || !self.buffer_halfway(slot).await {
            return Err(self.raise(MmsError::PurgeFailed { slot }));
        }

        let distance = crate::fabs(p.nozzle_priming_dist);
        let move_speed = p.nozzle_priming_speed / 60.0;
        let move_time = distance / move_speed;

        let drive = self.slot(slot).drive_stepper();
        self.stepper(drive).update_focus_slot(Some(slot));
        join(
            self.manual_move(drive, distance, move_speed, move_speed),
            self.host().extrude(distance, p.nozzle_priming_speed, true),
        )
        .await;

        self.wait_drive(slot, Some(crate::secs(move_time + 5.0))).await;
        Ok(())
    }

    fn purge_safety_checks(&self, slot: Option<usize>) -> Option<usize> {
        let Some(slot) = slot else {
            warn!("current slot is None, return");
            return None;
        };
        if self.swap.purge_running.get() {
            warn!("another purge is running, return");
            return None;
        }
        if !self.host().is_homed() {
            warn!("toolhead is not homed, return");
            return None;
        }
        if !self.host().can_extrude() {
            error!("extruder is not hot enough");
            return None;
        }
        Some(slot)
    }

    /// Purge the currently served slot.
    pub async fn mms_purge(&self) -> bool {
        if let Some(before) = self.config().purge.custom_before.clone() {
            self.host().run_macro(&before).await;
        }

        let Some(slot) = self.purge_safety_checks(self.current_slot()) else {
            return false;
        };

        debug!("slot[{}] purge begin", slot);
        self.swap.purge_running.set(true);
        let success = {
            let _running = PurgeRunningGuard { core: self };
            let result = if self.config().purge.enable {
                self.standard_purge(slot).await
            } else {
                self.apply_nozzle_priming(slot).await
            };
            match result {
                Ok(()) => true,
                Err(MmsError::PurgeFailed { .. }) => {
                    warn!("slot[{}] purge failed", slot);
                    false
                }
                Err(_) => {
                    error!("slot[{}] purge error", slot);
                    false
                }
            }
        };
        if !success {
            return false;
        }

        debug!("slot[{}] purge finish", slot);
        if let Some(after) = self.config().purge.custom_after.clone() {
            self.host().run_macro(&after).await;
        }
        true
    }
}

struct PurgeRunningGuard<'a, H: Host> {
    core: &'a MmsCore<H>,
}

impl<H: Host> Drop for PurgeRunningGuard<'_, H> {
    fn drop(&mut self) {
        self.core.swap.purge_running.set(false);
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::testing::{load_to_gate_state, ready_core, ToolheadOp};

    #[test]
    fn purge_without_current_slot_refuses() {
        let core = ready_core(4);
        assert!(!block_on(core.mms_purge()));
    }

    #[test]
    fn purge_extrudes_the_orphan_volume_on_the_tray() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.stepper(core.slot(0).selector_stepper()).update_focus_slot(Some(0));
        core.host().clear_toolhead_ops();

        assert!(block_on(core.mms_purge()));

        let ops = core.host().toolhead_ops();
        // Tray park happened Y first
        let y = ops.iter().position(|op| matches!(op, ToolheadOp::MoveY(_)));
        let x = ops.iter().position(|op| matches!(op, ToolheadOp::MoveX(_)));
        assert!(y.unwrap() < x.unwrap());
        // 60mm x 2.5 of purge extrusion
        assert!(ops
            .iter()
            .any(|op| matches!(op, ToolheadOp::Extrude(d, _) if (*d - 150.0).abs() < 1e-9)));
        assert!(!core.swap.purge_running.get());
    }

    #[test]
    fn priming_fallback_runs_when_purge_disabled() {
        let mut cfg = crate::testing::test_config(4);
        cfg.purge.enable = false;
        let host = crate::testing::MockHost::new(2);
        let core = alloc::boxed::Box::leak(alloc::boxed::Box::new(crate::MmsCore::new(cfg, host)));
        core.on_ready();
        load_to_gate_state(core, 1);
        core.stepper(core.slot(1).selector_stepper()).update_focus_slot(Some(1));
        core.host().clear_toolhead_ops();

        assert!(block_on(core.mms_purge()));
        let ops = core.host().toolhead_ops();
        assert!(ops
            .iter()
            .any(|op| matches!(op, ToolheadOp::Extrude(d, _) if (*d - 20.0).abs() < 1e-9)));
    }
}
