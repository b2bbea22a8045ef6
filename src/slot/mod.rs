//! Slots: one filament feed channel each.
//!
//! A slot bundles the six pins of its path, the ids of the selector and
//! drive steppers it shares with its set siblings, and its LED proxy.
//! Composite predicates (`is_ready`, `is_loading`, `is_fully_loaded`,
//! `is_empty`) live on [`crate::MmsCore`] since they read sensor state.

mod pin;

pub use pin::{PinKind, SlotPin};

use core::cell::Cell;

use alloc::string::String;
use alloc::vec::Vec;

use crate::config::SlotConfig;
use crate::host::{EndstopPair, Host, LedEffect};
use crate::MmsCore;

/// One filament feed channel.
pub struct Slot {
    num: usize,
    set: usize,
    selector_stepper: usize,
    drive_stepper: usize,
    autoload_enable: bool,
    substitute_with: Option<usize>,
    led_effect: Cell<Option<LedEffect>>,
    pins: [SlotPin; 6],
}

impl Slot {
    pub(crate) fn new(
        num: usize,
        set: usize,
        selector_stepper: usize,
        drive_stepper: usize,
        cfg: &SlotConfig,
        sensors: [Option<usize>; 6],
    ) -> Self {
        let [selector, inlet, gate, outlet, entry, buffer_runout] = sensors;
        Self {
            num,
            set,
            selector_stepper,
            drive_stepper,
            autoload_enable: cfg.autoload_enable,
            substitute_with: cfg.substitute_with,
            led_effect: Cell::new(None),
            pins: [
                SlotPin::new(PinKind::Selector, selector, Some(selector_stepper)),
                SlotPin::new(PinKind::Inlet, inlet, Some(drive_stepper)),
                SlotPin::new(PinKind::Gate, gate, Some(drive_stepper)),
                SlotPin::new(PinKind::Outlet, outlet, Some(drive_stepper)),
                SlotPin::new(PinKind::Entry, entry, entry.map(|_| drive_stepper)),
                SlotPin::new(PinKind::BufferRunout, buffer_runout, Some(drive_stepper)),
            ],
        }
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn set(&self) -> usize {
        self.set
    }

    pub(crate) fn selector_stepper(&self) -> usize {
        self.selector_stepper
    }

    pub(crate) fn drive_stepper(&self) -> usize {
        self.drive_stepper
    }

    pub(crate) fn autoload_enabled(&self) -> bool {
        self.autoload_enable
    }

    pub(crate) fn substitute_with(&self) -> Option<usize> {
        self.substitute_with
    }

    pub fn pin(&self, kind: PinKind) -> &SlotPin {
        &self.pins[kind.index()]
    }

    pub(crate) fn pins(&self) -> &[SlotPin; 6] {
        &self.pins
    }

    pub(crate) fn led_effect(&self) -> Option<LedEffect> {
        self.led_effect.get()
    }

    pub(crate) fn set_led_effect(&self, effect: Option<LedEffect>) {
        self.led_effect.set(effect);
    }
}

impl<H: Host> MmsCore<H> {
    /// Endstop pair list used to arm a homing move against `kind`.
    pub(crate) fn endstop_pairs(&self, slot: usize, kind: PinKind) -> Vec<EndstopPair> {
        let pin = self.slot(slot).pin(kind);
        match (pin.sensor(), pin.stepper()) {
            (Some(sensor), Some(stepper)) => alloc::vec![EndstopPair {
                sensor,
                stepper,
                name: String::from(self.sensor(sensor).name()),
            }],
            _ => Vec::new(),
        }
    }

    /// Whether `kind` already shows the wanted state.
    pub(crate) fn check_pin(&self, slot: usize, kind: PinKind, trigger: bool) -> bool {
        if trigger {
            self.pin_triggered(slot, kind)
        } else {
            self.pin_released(slot, kind)
        }
    }

    /// The slot pin currently waiting on a homing move, if any.
    pub(crate) fn waiting_pin(&self, slot: usize) -> Option<PinKind> {
        self.slot(slot)
            .pins()
            .iter()
            .find(|p| p.is_waiting())
            .map(|p| p.kind())
    }

    /// Complete the selector homing move a pin edge just satisfied.
    pub(crate) fn complete_selector_moving(&self, slot: usize) {
        let selector = self.stepper(self.slot(slot).selector_stepper());
        if selector.is_running() {
            selector.complete_manual_home();
        }
    }

    /// Complete the drive homing move a pin edge just satisfied.
    pub(crate) fn complete_drive_moving(&self, slot: usize) {
        let drive = self.stepper(self.slot(slot).drive_stepper());
        if drive.is_running() {
            drive.complete_manual_home();
        }
    }

    /// Mark both steppers of the slot terminated for the current move.
    pub(crate) fn terminate_stepper_moving(&self, slot: usize) {
        let selector = self.stepper(self.slot(slot).selector_stepper());
        if selector.is_running() {
            selector.terminate_manual_home();
        }
        let drive = self.stepper(self.slot(slot).drive_stepper());
        if drive.is_running() {
            drive.terminate_manual_home();
        }
    }

    /// Break an outstanding homing wait on `kind`: fire the host-request
    /// trigger, terminate the steppers, let the step count settle, then
    /// tear down the dispatch. Returns whether a wait was in progress.
    pub(crate) async fn break_homing(&self, slot: usize, kind: PinKind) -> bool {
        let pin = self.slot(slot).pin(kind);
        if !pin.is_waiting() {
            return false;
        }
        let Some(stepper) = pin.stepper() else {
            return false;
        };

        self.host().break_homing(stepper);
        self.terminate_stepper_moving(slot);
        pin.stop_waiting();

        self.host().pause(self.config().stepper.break_delay).await;
        self.host().teardown_homing(stepper);
        true
    }

    /// Find whichever pin is waiting and break it.
    pub(crate) async fn stop_homing(&self, slot: usize) {
        if let Some(kind) = self.waiting_pin(slot) {
            if self.break_homing(slot, kind).await {
                info!("slot[{}] '{}' homing stop", slot, kind.name());
                return;
            }
        }
        warn!("slot[{}] no homing is waiting", slot);
    }
}

#[cfg(test)]
mod tests {
    use embedded_hal_1::digital::PinState;

    use crate::testing::{ready_core, sensor_of};

    use super::PinKind;

    #[test]
    fn predicates_follow_pin_states() {
        let core = ready_core(4);
        let inlet = sensor_of(&core, 0, PinKind::Inlet);
        let gate = sensor_of(&core, 0, PinKind::Gate);
        let outlet = sensor_of(&core, 0, PinKind::Outlet);

        assert!(core.slot_is_empty(0));
        assert!(!core.slot_is_ready(0));

        core.on_digital_sample(inlet, PinState::High);
        assert!(core.slot_is_ready(0));
        assert!(!core.slot_is_loading(0));

        core.on_digital_sample(gate, PinState::High);
        assert!(core.slot_is_loading(0));
        assert!(!core.slot_is_fully_loaded(0));

        core.on_digital_sample(outlet, PinState::High);
        assert!(core.slot_is_fully_loaded(0));
        // fully loaded implies loading implies ready
        assert!(core.slot_is_loading(0));
        assert!(core.slot_is_ready(0));
        assert!(!core.slot_is_empty(0));
    }

    #[test]
    fn shared_outlet_pin_serves_every_slot_of_the_set() {
        let core = ready_core(4);
        let s0 = sensor_of(&core, 0, PinKind::Outlet);
        let s3 = sensor_of(&core, 3, PinKind::Outlet);
        assert_eq!(s0, s3);
    }

    #[test]
    fn edge_completes_waiting_drive_homing() {
        let core = ready_core(4);
        let drive = core.slot(1).drive_stepper();
        core.stepper(drive).begin_move_for_test();

        let pin = core.slot(1).pin(PinKind::Gate);
        let _guard = pin.wait();
        let gate = sensor_of(&core, 1, PinKind::Gate);
        core.on_digital_sample(gate, PinState::High);

        assert!(!pin.is_waiting());
        assert!(core.stepper(drive).move_is_completed(None));
    }

    #[test]
    fn entry_release_only_stops_waiting() {
        let core = ready_core(4);
        let drive = core.slot(0).drive_stepper();
        core.stepper(drive).begin_move_for_test();

        let entry = sensor_of(&core, 0, PinKind::Entry);
        // Entry starts released; trigger it first so a release edge exists
        core.on_digital_sample(entry, PinState::High);
        core.stepper(drive).begin_move_for_test();

        let pin = core.slot(0).pin(PinKind::Entry);
        let _guard = pin.wait();
        core.on_digital_sample(entry, PinState::Low);

        assert!(!pin.is_waiting());
        // The homing move is NOT completed by an entry release
        assert!(!core.stepper(drive).move_is_completed(None));
    }

    #[test]
    fn break_homing_terminates_and_tears_down() {
        let core = ready_core(4);
        let drive = core.slot(2).drive_stepper();
        core.stepper(drive).begin_move_for_test();
        let pin = core.slot(2).pin(PinKind::Outlet);
        pin.start_waiting();

        let broke = embassy_futures::block_on(core.break_homing(2, PinKind::Outlet));
        assert!(broke);
        assert!(!pin.is_waiting());
        assert!(core.stepper(drive).move_is_terminated(None));
        assert_eq!(core.host().homing_breaks(), 1);
        assert_eq!(core.host().homing_teardowns(), 1);
    }

    #[test]
    fn break_homing_without_wait_is_a_noop() {
        let core = ready_core(4);
        let broke = embassy_futures::block_on(core.break_homing(0, PinKind::Gate));
        assert!(!broke);
        assert_eq!(core.host().homing_breaks(), 0);
    }

    #[test]
    fn events_before_ready_are_ignored() {
        let core = crate::testing::fresh_core(4);
        let inlet = crate::testing::sensor_name_of(&core, 0, PinKind::Inlet);
        let idx = core.sensor_index(&inlet).unwrap();
        let drive = core.slot(0).drive_stepper();
        core.stepper(drive).begin_move_for_test();
        let pin = core.slot(0).pin(PinKind::Inlet);
        pin.start_waiting();

        core.on_digital_sample(idx, PinState::High);
        // Dispatch gated on ready: wait flag untouched
        assert!(pin.is_waiting());
    }
}
