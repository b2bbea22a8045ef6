//! Slot pins: the rendezvous between an edge-producing sensor and a
//! stepper running a homing move.
//!
//! A pin's *wait* flag marks exactly one homing move in flight on its
//! bound stepper. Edges arriving while the flag is set complete that move;
//! the host-request break path clears the flag without an edge.

use core::cell::Cell;

/// Logical pin positions of a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PinKind {
    Selector,
    Inlet,
    Gate,
    Outlet,
    Entry,
    BufferRunout,
}

impl PinKind {
    pub const ALL: [PinKind; 6] = [
        PinKind::Selector,
        PinKind::Inlet,
        PinKind::Gate,
        PinKind::Outlet,
        PinKind::Entry,
        PinKind::BufferRunout,
    ];

    pub(crate) fn index(self) -> usize {
        match self {
            PinKind::Selector => 0,
            PinKind::Inlet => 1,
            PinKind::Gate => 2,
            PinKind::Outlet => 3,
            PinKind::Entry => 4,
            PinKind::BufferRunout => 5,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            PinKind::Selector => "selector",
            PinKind::Inlet => "inlet",
            PinKind::Gate => "gate",
            PinKind::Outlet => "outlet",
            PinKind::Entry => "entry",
            PinKind::BufferRunout => "buffer_runout",
        }
    }
}

/// One logical pin of a slot. The `outlet`, `entry` and `buffer_runout`
/// pins of all slots in a set reference the same shared sensor.
pub struct SlotPin {
    kind: PinKind,
    /// Sensor arena index; `None` for an unconfigured entry pin.
    sensor: Option<usize>,
    /// Stepper this pin arms as an endstop.
    stepper: Option<usize>,
    waiting: Cell<bool>,
}

impl SlotPin {
    pub(crate) fn new(kind: PinKind, sensor: Option<usize>, stepper: Option<usize>) -> Self {
        Self {
            kind,
            sensor,
            stepper,
            waiting: Cell::new(false),
        }
    }

    pub fn kind(&self) -> PinKind {
        self.kind
    }

    pub fn sensor(&self) -> Option<usize> {
        self.sensor
    }

    pub(crate) fn stepper(&self) -> Option<usize> {
        self.stepper
    }

    /// Whether the pin has a configured sensor.
    pub fn is_set(&self) -> bool {
        self.sensor.is_some()
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting.get()
    }

    pub(crate) fn start_waiting(&self) {
        self.waiting.set(true);
    }

    pub(crate) fn stop_waiting(&self) {
        self.waiting.set(false);
    }

    /// Scoped wait flag. The flag is cleared on drop, on any exit path.
    pub(crate) fn wait(&self) -> WaitGuard<'_> {
        self.waiting.set(true);
        WaitGuard { flag: &self.waiting }
    }
}

/// Clears a pin's wait flag when dropped.
pub(crate) struct WaitGuard<'a> {
    flag: &'a Cell<bool>,
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.flag.set(false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wait_guard_clears_flag_on_drop() {
        let pin = SlotPin::new(PinKind::Gate, Some(0), Some(1));
        {
            let _guard = pin.wait();
            assert!(pin.is_waiting());
        }
        assert!(!pin.is_waiting());
    }

    #[test]
    fn stop_waiting_inside_scope_sticks_until_guard_drops() {
        let pin = SlotPin::new(PinKind::Outlet, Some(0), Some(1));
        let guard = pin.wait();
        pin.stop_waiting();
        assert!(!pin.is_waiting());
        drop(guard);
        assert!(!pin.is_waiting());
    }

    #[test]
    fn unconfigured_entry_pin_is_not_set(){
        let pin = SlotPin::new(PinKind::Entry, None, None);
        assert!(!pin.is_set());
        assert_eq!(pin.sensor(), None);
    }
}
