//! Error kinds of the MMS core.
//!
//! Every error constructed with a slot immediately activates that slot's
//! blinking LED through [`crate::MmsCore::raise`]. [`MmsError::Terminated`]
//! is not a fault: it is the cooperative-cancel signal and propagates
//! silently to the command boundary, where it maps to a no-op success.

/// MMS operation error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum MmsError {
    /// A homing operation exhausted its retries.
    DeliveryFailed { slot: usize },
    /// The printer is shutdown or otherwise cannot deliver.
    DeliveryPrecondition { slot: usize },
    /// The slot inlet is not triggered.
    DeliveryReady { slot: usize },
    /// Eject phase failed for the slot.
    EjectFailed { slot: usize },
    /// Charge phase failed for the slot.
    ChargeFailed { slot: usize },
    /// Purge phase failed for the slot.
    PurgeFailed { slot: usize },
    /// A move was cooperatively terminated. Silent; not a fault.
    Terminated,
    /// Engine-level motion fault. Non-recoverable.
    Engine,
}

impl MmsError {
    /// Slot the error is charged to, if any.
    pub fn slot(&self) -> Option<usize> {
        match *self {
            MmsError::DeliveryFailed { slot }
            | MmsError::DeliveryPrecondition { slot }
            | MmsError::DeliveryReady { slot }
            | MmsError::EjectFailed { slot }
            | MmsError::ChargeFailed { slot }
            | MmsError::PurgeFailed { slot } => Some(slot),
            MmsError::Terminated | MmsError::Engine => None,
        }
    }

    /// Whether this is the silent cooperative-cancel signal.
    pub fn is_terminated(&self) -> bool {
        matches!(self, MmsError::Terminated)
    }
}

pub type Result<T> = core::result::Result<T, MmsError>;
