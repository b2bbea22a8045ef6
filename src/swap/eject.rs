//! Eject phase: pull loaded filament out of the toolhead and back behind
//! the gates.
//!
//! When the entry sensor already reads released the filament never made
//! it into the toolhead and a prepare pass is enough. Otherwise the full
//! sequence runs: park, heat, retraction compensation, optional pressure
//! pulses, cut, then a slow drive unload running concurrently with
//! extruder retraction pulses, and a final unload to gate release.

use embassy_futures::join::join;
use embassy_time::Duration;

use crate::error::MmsError;
use crate::host::Host;
use crate::slot::PinKind;
use crate::MmsCore;

impl<H: Host> MmsCore<H> {
    fn filament_still_in_toolhead(&self, slot: usize) -> bool {
        self.entry_is_triggered(slot) || self.pin_triggered(slot, PinKind::Outlet)
    }

    /// Slow drive unload with the extruder pulsing backward alongside.
    /// The retraction loop stops as soon as the drive unload lands.
    async fn eject_unload(&self, slot: usize) -> bool {
        self.wait_selector(slot, None).await;
        self.swap.eject_retract_end.set(false);

        let e = &self.config().eject;
        let unload = async {
            let success = self
                .mms_move(
                    slot,
                    -crate::fabs(e.distance_unload),
                    Some(e.drive_speed),
                    Some(e.drive_accel),
                )
                .await;
            if success {
                self.swap.eject_retract_end.set(true);
            }
            success
        };

        let retract_pulses = async {
            for i in 0..e.retract_times {
                if self.swap.eject_retract_end.get() {
                    debug!("slot[{}] extruder retract finished at round {}", slot, i);
                    return;
                }
                self.host().retract(e.retract_distance, e.retract_speed, true).await;
                self.host().pause(Duration::from_millis(100)).await;
            }
            warn!("slot[{}] extruder retract ran out without a stop signal", slot);
        };

        let (success, ()) = join(unload, retract_pulses).await;
        success
    }

    async fn prepare_only(&self, slot: usize) -> bool {
        debug!("slot[{}] eject with entry released, prepare only", slot);
        self.mms_prepare(slot).await
    }

    async fn heat_to_min_extrude_temp(&self) {
        let min = self.host().min_extrude_temp() + 5.0;
        if self.host().extruder_temp() < min {
            self.host().set_extruder_temperature(min, true).await;
        }
    }

    async fn standard_eject(&self, check_entry: bool) -> crate::error::Result<()> {
        let loading = self.loading_slots();
        if loading.is_empty() {
            debug!("standard eject skip, no loading slots");
            return Ok(());
        }
        debug!("standard eject begin, loading slots: {:?}", loading);

        self.swap.eject_running.set(true);
        let _running = EjectRunningGuard { core: self };

        for &slot in &loading {
            if !self.pause_swap_buffer(slot).await {
                return Err(self.raise(MmsError::EjectFailed { slot }));
            }
        }

        if check_entry && self.entry_is_set(loading[0]) && !self.entry_is_triggered(loading[0]) {
            for &slot in &loading {
                self.prepare_only(slot).await;
            }
        }

        // Re-check: slots the prepare pass handled are no longer loading
        let loading = self.loading_slots();
        if loading.is_empty() {
            debug!("standard eject finish");
            return Ok(());
        }

        if !self.host().is_homed() {
            return Err(self.raise(MmsError::EjectFailed { slot: loading[0] }));
        }

        if self.config().cut.enable {
            self.cut_init().await;
        }
        self.heat_to_min_extrude_temp().await;

        for &slot in &loading {
            self.apply_retraction_compensation(slot).await?;
            self.pressure_pulse_cleaning(slot).await?;
        }

        if self.config().cut.enable && !self.mms_cut().await {
            return Err(self.raise(MmsError::EjectFailed { slot: loading[0] }));
        }

        for &slot in &loading {
            if !self.eject_unload(slot).await {
                return Err(self.raise(MmsError::EjectFailed { slot }));
            }
        }

        // If anything still reads present downstream the exit failed
        for &slot in &loading {
            if self.filament_still_in_toolhead(slot) {
                return Err(self.raise(MmsError::EjectFailed { slot }));
            }
        }

        for &slot in &loading {
            if !self.mms_unload(Some(slot)).await {
                return Err(self.raise(MmsError::EjectFailed { slot }));
            }
        }

        debug!("standard eject finish");
        Ok(())
    }

    /// Eject every loading slot. `check_entry = false` skips the
    /// prepare-only fast path (used by the fracture recovery).
    pub async fn mms_eject(&self, check_entry: bool) -> bool {
        if let Some(before) = self.config().eject.custom_before.clone() {
            self.host().run_macro(&before).await;
        }

        if self.swap.eject_running.get() {
            warn!("another eject is running, return");
            return false;
        }

        match self.standard_eject(check_entry).await {
            Ok(()) => {}
            Err(MmsError::EjectFailed { slot }) => {
                warn!("slot[{}] eject failed", slot);
                return false;
            }
            Err(_) => {
                error!("eject error");
                return false;
            }
        }

        if let Some(after) = self.config().eject.custom_after.clone() {
            self.host().run_macro(&after).await;
        }
        true
    }
}

struct EjectRunningGuard<'a, H: Host> {
    core: &'a MmsCore<H>,
}

impl<H: Host> Drop for EjectRunningGuard<'_, H> {
    fn drop(&mut self) {
        self.core.swap.eject_running.set(false);
    }
}
