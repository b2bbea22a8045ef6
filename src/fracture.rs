//! Filament fracture handling.
//!
//! A fracture is the inlet falling edge during forward motion: the
//! filament snapped upstream of the unit. Two contexts arm the fault. An
//! edge during a forward homing move stops the slot's motion inside the
//! pin callback and schedules the recovery; an edge during a buffer feed
//! is picked up by the buffer's own polled check. Both recoveries run
//! under a paused-monitoring scope so their motion cannot re-trip the
//! fault, and both try to promote a substitute slot before leaving the
//! slot blinking.

use core::cell::Cell;

use alloc::boxed::Box;

use crate::host::{Host, LedEffect};
use crate::slot::PinKind;
use crate::MmsCore;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FractureMode {
    Homing,
    Feeding,
}

pub(crate) struct FractureState {
    pub(crate) enabled: Cell<bool>,
    pending: Cell<Option<(usize, FractureMode)>>,
}

impl FractureState {
    pub(crate) fn new() -> Self {
        Self {
            enabled: Cell::new(true),
            pending: Cell::new(None),
        }
    }

    pub(crate) fn set_pending_feeding(&self, slot: usize) {
        if self.pending.get().is_none() {
            self.pending.set(Some((slot, FractureMode::Feeding)));
        }
    }
}

/// Disables fracture detection for the scope of a recovery.
struct MonitorPauseGuard<'a> {
    flag: &'a Cell<bool>,
    previous: bool,
}

impl<'a> MonitorPauseGuard<'a> {
    fn new(flag: &'a Cell<bool>) -> Self {
        let previous = flag.get();
        flag.set(false);
        Self { flag, previous }
    }
}

impl Drop for MonitorPauseGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(self.previous);
    }
}

impl<H: Host> MmsCore<H> {
    /// Enable or disable fracture detection at runtime.
    pub fn set_fracture_detection(&self, enabled: bool) {
        self.fracture.enabled.set(enabled);
        info!("filament fracture detection enabled: {}", enabled);
    }

    /// Synchronous part of the homing-context fault, run inside the pin
    /// callback: halt the slot's motion now, recover later.
    pub(crate) fn fracture_trip_while_homing(&self, slot: usize) {
        warn!("slot[{}] filament fracture while homing ==X==", slot);

        for kind in PinKind::ALL {
            let pin = self.slot(slot).pin(kind);
            if pin.is_waiting() {
                if let Some(stepper) = pin.stepper() {
                    self.host().break_homing(stepper);
                }
                pin.stop_waiting();
            }
        }
        self.terminate_stepper_moving(slot);

        let buffer = self.buffer_of(slot).index();
        if self.buffer(buffer).is_activating() {
            self.deactivate_buffer_monitor(buffer);
        }

        if self.fracture.pending.get().is_none() {
            self.fracture.pending.set(Some((slot, FractureMode::Homing)));
        }
    }

    /// Run the recovery scheduled by a fracture trip, if any. Invoked
    /// right after the interrupted motion unwinds.
    pub(crate) async fn run_pending_fracture(&self) {
        let Some((slot, mode)) = self.fracture.pending.take() else {
            return;
        };
        match mode {
            FractureMode::Homing => Box::pin(self.fracture_while_homing(slot)).await,
            FractureMode::Feeding => Box::pin(self.fracture_while_feeding(slot)).await,
        }
    }

    async fn fracture_while_homing(&self, slot: usize) {
        // Let the broken dispatch drain and settle the step count
        let drive = self.slot(slot).drive_stepper();
        self.host().pause(self.config().stepper.break_delay).await;
        self.host().teardown_homing(drive);

        if self.printer_is_printing() {
            self.mms_pause().await;
        }

        if !self.wait_toolhead().await {
            error!("slot[{}] wait toolhead idle timeout", slot);
            error!("slot[{}] fracture while homing failed", slot);
            return;
        }

        let entry_triggered = self.entry_is_triggered(slot);
        let gate_triggered = self.pin_triggered(slot, PinKind::Gate);

        let mut can_resume = true;
        {
            let _paused = MonitorPauseGuard::new(&self.fracture.enabled);

            if entry_triggered || gate_triggered {
                // Filament is still engaged downstream
                self.mms_eject(false).await;
            }

            let retreat = async {
                self.move_backward(slot, self.config().fracture.unload_distance, None, None)
                    .await?;
                self.unload_to_release_gate(slot).await
            };
            if retreat.await.is_err() {
                error!("slot[{}] fracture retract failed", slot);
                can_resume = false;
            }
        }

        let mut can_play_led = true;
        if can_resume && self.resume_slot_substitute(slot).await {
            can_play_led = false;
        }
        if can_play_led {
            self.led_activate(slot, LedEffect::Blinking, false);
        }
        debug!("slot[{}] fracture while homing done", slot);
    }

    pub(crate) async fn fracture_while_feeding(&self, slot: usize) {
        warn!("slot[{}] filament fracture while feeding ==X==", slot);

        let buffer = self.buffer_of(slot).index();
        self.deactivate_buffer_monitor(buffer);

        if self.printer_is_printing() {
            if self.mms_pause().await {
                self.set_swap_resume(slot);
            }
        }

        if !self.wait_toolhead().await {
            error!("slot[{}] wait toolhead idle timeout", slot);
            error!("slot[{}] fracture while feeding failed", slot);
            return;
        }

        if !self.config().purge.enable {
            self.led_activate(slot, LedEffect::Blinking, false);
            return;
        }

        let purged = {
            let _paused = MonitorPauseGuard::new(&self.fracture.enabled);
            self.purge_until_entry_release(slot).await
        };
        if purged && self.resume_slot_substitute(slot).await {
            debug!("slot[{}] fracture while feeding done", slot);
            return;
        }

        self.led_activate(slot, LedEffect::Blinking, false);
        debug!("slot[{}] fracture while feeding done", slot);
    }

    /// Push the orphaned filament out of the toolhead: park on the tray,
    /// extrude, brush, until the entry sensor releases or the extrusion
    /// budget runs out.
    async fn purge_until_entry_release(&self, slot: usize) -> bool {
        if !self.entry_is_triggered(slot) {
            return true;
        }

        let speed = self.config().purge.purge_speed;
        let distance = self.purge_distance();
        let mut extruded = 0.0;

        // Make sure the broken slot is not the selected one
        if self.select_another_slot(slot).await.is_err() {
            return false;
        }

        while self.entry_is_triggered(slot) {
            self.purge_move_to_tray().await;
            self.host().extrude(distance, speed, true).await;
            if self.config().brush.enable {
                self.mms_brush().await;
            }

            extruded += distance;
            if extruded >= self.config().fracture.extrude_distance_max {
                warn!(
                    "slot[{}] fracture purge reached the {} mm limit, break",
                    slot,
                    self.config().fracture.extrude_distance_max
                );
                return false;
            }
        }
        true
    }

    /// Promote the configured substitute slot and resume the print.
    async fn resume_slot_substitute(&self, slot: usize) -> bool {
        let Some(substitute) = self.find_available_substitute_slot(slot) else {
            return false;
        };
        self.swap.update_mapping_slot_num(slot, substitute);
        self.mms_resume().await;
        true
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;
    use embedded_hal_1::digital::PinState;

    use crate::host::{LedEffect, PrintState};
    use crate::slot::PinKind;
    use crate::testing::{insert_filament, load_to_gate_state, ready_core, sensor_of};

    #[test]
    fn inlet_release_during_forward_homing_trips_the_fault() {
        let core = ready_core(4);
        load_to_gate_state(core, 2);
        // Substitute chain 2 -> 3, slot 3 has filament
        insert_filament(core, 3);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());

        let drive = core.slot(2).drive_stepper();
        let inlet = sensor_of(core, 2, PinKind::Inlet);
        // Fracture mid-homing: the homing hook releases the inlet
        core.host().set_homing_hook(move |stepper| {
            if stepper == drive {
                core.on_digital_sample(inlet, PinState::Low);
            }
        });

        // Drive forward toward the outlet; the fracture fires inside
        let _ = block_on(core.load_to_outlet(2, None, None, None));
        core.host().clear_homing_hook();

        // Print was paused, and the swap map promoted slot 3 in place of 2
        assert!(core.host().pause_calls() >= 1);
        assert_eq!(core.swap.mapped_slot(2), Some(3));
        // Promotion succeeded: resume was issued, no blinking LED
        assert!(core.host().resume_calls() >= 1);
        assert_ne!(core.slot(2).led_effect(), Some(LedEffect::Blinking));
    }

    #[test]
    fn fracture_without_substitute_leaves_slot_blinking() {
        let core = ready_core(4);
        load_to_gate_state(core, 1);
        // No other slot has filament: the substitute chain dead-ends
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());

        let drive = core.slot(1).drive_stepper();
        let inlet = sensor_of(core, 1, PinKind::Inlet);
        core.host().set_homing_hook(move |stepper| {
            if stepper == drive {
                core.on_digital_sample(inlet, PinState::Low);
            }
        });

        let _ = block_on(core.load_to_outlet(1, None, None, None));
        core.host().clear_homing_hook();

        assert_eq!(core.slot(1).led_effect(), Some(LedEffect::Blinking));
        assert_eq!(core.swap.mapped_slot(1), Some(1));
    }

    #[test]
    fn feeding_fracture_registers_swap_resume_hook() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.host().set_print_state(PrintState::Printing);
        block_on(core.observe_tick());
        core.activate_buffer_monitor(0);

        block_on(core.fracture_while_feeding(0));

        assert!(!core.buffer(0).is_activating());
        assert!(core.host().pause_calls() >= 1);
        // No substitute available (no other inlet): hook stays registered
        assert!(core.resume.has_hook());
        assert_eq!(core.slot(0).led_effect(), Some(LedEffect::Blinking));
    }

    #[test]
    fn disabled_detection_ignores_the_edge() {
        let core = ready_core(4);
        load_to_gate_state(core, 0);
        core.set_fracture_detection(false);

        let drive = core.slot(0).drive_stepper();
        let inlet = sensor_of(core, 0, PinKind::Inlet);
        core.host().set_homing_hook(move |stepper| {
            if stepper == drive {
                core.on_digital_sample(inlet, PinState::Low);
            }
        });

        let _ = block_on(core.load_to_outlet(0, None, None, None));
        core.host().clear_homing_hook();

        assert_eq!(core.host().pause_calls(), 0);
        core.set_fracture_detection(true);
    }
}
