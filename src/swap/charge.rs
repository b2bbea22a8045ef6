//! Charge phase: feed the fresh filament into the extruder.
//!
//! The careful charge races an endstop-armed drive move against a drip
//! extrusion loop: the drive pushes toward the outlet while the extruder
//! pulls in 1 mm bites. If the extruder grabs the filament the spring
//! never compresses and the outlet stays released; a triggered outlet
//! means the hand-off failed and the bounded standard-charge retry loop
//! takes over.

use embassy_futures::select::select;
use embassy_time::Duration;

use crate::error::MmsError;
use crate::host::{Edge, Host};
use crate::slot::PinKind;
use crate::MmsCore;

impl<H: Host> MmsCore<H> {
    pub(crate) fn charge_teardown(&self) {
        self.swap.charge_running.set(false);
        self.swap.charging_slot.set(None);
    }

    /// Slot last charged successfully.
    pub fn charging_slot(&self) -> Option<usize> {
        self.swap.charging_slot.get()
    }

    fn charge_safety_checks(&self, slot: usize) -> bool {
        if self.swap.charge_running.get() {
            warn!("another charge is running, return");
            return false;
        }
        if !self.host().can_extrude() {
            error!("slot[{}] extruder is not hot enough", slot);
            return false;
        }
        true
    }

    /// Drive toward the outlet endstop while the drip loop runs. Does not
    /// select; the slot is already engaged.
    async fn careful_load(&self, slot: usize, distance: f64) {
        let drive = self.slot(slot).drive_stepper();
        let endstops = self.endstop_pairs(slot, PinKind::Outlet);
        let speed = self.config().charge.extrude_speed / 60.0;

        let _armed = self.arm_fracture_homing(slot);
        self.stepper(drive).update_focus_slot(Some(slot));
        let _ = self
            .manual_home(drive, distance, speed, speed, true, Edge::Triggered, &endstops)
            .await;
    }

    /// Drip the extruder forward until the hand-off resolves one way or
    /// the other.
    async fn careful_extrude(&self, slot: usize, distance_total: f64) {
        let drip = self.config().charge.drip_extrude_distance;
        let speed = self.config().charge.extrude_speed;
        let times = (distance_total / drip) as u32;
        let mut extruded = 0.0;

        for _ in 0..times {
            self.host().extrude(drip, speed, true).await;
            extruded += drip;
            if self.pin_triggered(slot, PinKind::Outlet) {
                break;
            }
            self.host().pause(Duration::from_millis(200)).await;
        }
        debug!("slot[{}] careful extrude done, {} mm", slot, extruded);
    }

    /// Ok(true): filament handed into the extruder. Ok(false): hand-off
    /// failed, worth a standard retry. Err: the buffer could not even be
    /// prepared.
    async fn careful_charge(&self, slot: usize) -> crate::error::Result<bool> {
        debug!("slot[{}] careful charge begin", slot);

        if !self.buffer_clear(slot).await {
            return Err(self.raise(MmsError::ChargeFailed { slot }));
        }

        if self.pin_triggered(slot, PinKind::Outlet) {
            warn!("slot[{}] careful charge failed, outlet is already triggered", slot);
            return Ok(false);
        }

        let total = self.buffer_of(slot).spring_stroke() + self.config().charge.drip_extra_distance;
        debug!("slot[{}] careful charge total distance: {} mm", slot, total);

        let outlet_pin = self.slot(slot).pin(PinKind::Outlet);
        outlet_pin.start_waiting();
        select(
            self.careful_load(slot, total),
            self.careful_extrude(slot, total),
        )
        .await;

        // Break whichever side is still going
        if outlet_pin.is_waiting() {
            self.break_homing(slot, PinKind::Outlet).await;
        }

        let result = !self.pin_triggered(slot, PinKind::Outlet);
        debug!("slot[{}] careful charge finish, result {}", slot, result);
        Ok(result)
    }

    /// Extrude in bounded pulses until the outlet releases.
    async fn extrude_to_release_outlet(&self, slot: usize) -> bool {
        if self.pin_released(slot, PinKind::Outlet) {
            warn!("slot[{}] outlet is already released", slot);
            return false;
        }

        let c = &self.config().charge;
        let mut extruded = 0.0;
        let mut released = false;
        for _ in 0..c.extrude_times {
            self.host().extrude(c.extrude_distance, c.extrude_speed, true).await;
            extruded += c.extrude_distance;
            if self.pin_released(slot, PinKind::Outlet) {
                released = true;
                break;
            }
            self.host().pause(Duration::from_millis(200)).await;
        }

        debug!(
            "slot[{}] outlet is {}, extruded {} mm",
            slot,
            if released { "released" } else { "not released" },
            extruded
        );
        released
    }

    /// Fill the buffer to full compression, then check the extruder can
    /// pull filament off it. A failed attempt retracts and unloads so the
    /// next try starts clean.
    async fn standard_charge(&self, slot: usize) -> crate::error::Result<bool> {
        debug!("slot[{}] standard charge begin", slot);

        if !self.buffer_fill(slot).await {
            return Err(self.raise(MmsError::ChargeFailed { slot }));
        }

        if !self.extrude_to_release_outlet(slot).await {
            let c = &self.config().charge;
            self.host().retract(c.distance_unload, c.extrude_speed, false).await;
            self.unload_to_gate(slot).await?;
            return Ok(false);
        }

        debug!("slot[{}] standard charge finish", slot);
        Ok(true)
    }

    /// Hand-operated careful charge (`MMS_CAREFUL_CHARGE`): the drip
    /// hand-off alone, without the standard-charge fallback.
    pub async fn mms_careful_charge(&self, slot: usize) -> bool {
        if !self.charge_safety_checks(slot) {
            return false;
        }

        if !self.mms_load(slot).await {
            warn!("slot[{}] careful charge load prepare failed", slot);
            return false;
        }

        self.swap.charge_running.set(true);
        let _running = ChargeRunningGuard { core: self };

        if !self.pause_swap_buffer(slot).await {
            return false;
        }
        match self.careful_charge(slot).await {
            Ok(success) => {
                info!(
                    "slot[{}] careful charge {}",
                    slot,
                    if success { "success" } else { "failed" }
                );
                success
            }
            Err(_) => {
                warn!("slot[{}] careful charge failed", slot);
                false
            }
        }
    }

    /// Charge `slot` into the extruder.
    pub async fn mms_charge(&self, slot: usize) -> bool {
        if let Some(before) = self.config().charge.custom_before.clone() {
            self.host().run_macro(&before).await;
        }

        if !self.charge_safety_checks(slot) {
            return false;
        }

        debug!("slot[{}] charge begin", slot);

        // Make sure the outlet (or entry) is reachable before handing off
        if !self.mms_load(slot).await {
            warn!("slot[{}] charge load prepare failed", slot);
            return false;
        }

        let success = {
            self.swap.charge_running.set(true);
            let _running = ChargeRunningGuard { core: self };

            let run = async {
                if !self.pause_swap_buffer(slot).await {
                    return Err(self.raise(MmsError::ChargeFailed { slot }));
                }

                let mut success = self.careful_charge(slot).await?;

                if !success {
                    for i in 0..self.config().retry_times {
                        success = self.standard_charge(slot).await?;
                        if success {
                            break;
                        }
                        info!(
                            "slot[{}] charge retry {}/{} ...",
                            slot,
                            i + 1,
                            self.config().retry_times
                        );
                    }
                    if !success {
                        return Err(self.raise(MmsError::ChargeFailed { slot }));
                    }
                }
                Ok(())
            };

            match run.await {
                Ok(()) => true,
                Err(MmsError::ChargeFailed { .. }) => {
                    warn!("slot[{}] charge failed", slot);
                    false
                }
                Err(_) => {
                    error!("slot[{}] charge error", slot);
                    false
                }
            }
        };

        if !success {
            return false;
        }

        self.swap.charging_slot.set(Some(slot));
        debug!("slot[{}] charge finish", slot);
        if let Some(after) = self.config().charge.custom_after.clone() {
            self.host().run_macro(&after).await;
        }
        true
    }
}

struct ChargeRunningGuard<'a, H: Host> {
    core: &'a MmsCore<H>,
}

impl<H: Host> Drop for ChargeRunningGuard<'_, H> {
    fn drop(&mut self) {
        self.core.swap.charge_running.set(false);
    }
}
