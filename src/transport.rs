//! The seam between the acquisition engine and whatever moves bytes.
//!
//! [`crate::usb::UsbTransport`] talks to real hardware,
//! [`crate::simulator::SimulatedDevice`] stands in for it in tests.

use std::time::Duration;

use crate::protocol::Frame;

/// Index of a transfer slot in the scheduler's buffer arena.
pub type SlotId = usize;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransferError {
    #[error("Endpoint stalled")]
    Stall,

    #[error("Device disconnected")]
    Disconnected,

    #[error("Transfer fault")]
    Fault,

    #[error("Transfer was cancelled")]
    Cancelled,

    #[error("USB error: {0}")]
    Usb(String),
}

/// Completion of a read transfer, reported by the transport.
#[derive(Debug)]
pub enum TransferEvent {
    /// The transfer finished, successfully or not. `data` holds the bytes
    /// received and gives the slot's buffer back.
    Completed {
        slot: SlotId,
        data: Vec<u8>,
        status: Result<(), TransferError>,
    },
    /// The transfer was cancelled before it completed.
    CancellationConfirmed { slot: SlotId, data: Vec<u8> },
}

impl TransferEvent {
    pub fn slot(&self) -> SlotId {
        match self {
            TransferEvent::Completed { slot, .. } | TransferEvent::CancellationConfirmed { slot, .. } => {
                *slot
            }
        }
    }
}

pub trait Transport {
    /// Writes a command frame to the device.
    fn send_command(&mut self, frame: &Frame) -> Result<(), TransferError>;

    /// Queues an asynchronous read into `buffer`, filling up to its capacity.
    /// Returns immediately; the result arrives through [`Transport::wait_event`].
    fn submit_read(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), TransferError>;

    /// Asks every outstanding read to stop. Each one still reports back.
    fn cancel_all(&mut self);

    /// Next completion, in the order the transport observed them. `None` when
    /// nothing completed within `timeout`.
    fn wait_event(&mut self, timeout: Duration) -> Option<TransferEvent>;

    /// Reads submitted so far will never be reported: whatever they still
    /// deliver is dropped, so later reads keep their own slot ids.
    fn forget_in_flight(&mut self) {}
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn send_command(&mut self, frame: &Frame) -> Result<(), TransferError> {
        (**self).send_command(frame)
    }

    fn submit_read(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), TransferError> {
        (**self).submit_read(slot, buffer)
    }

    fn cancel_all(&mut self) {
        (**self).cancel_all();
    }

    fn wait_event(&mut self, timeout: Duration) -> Option<TransferEvent> {
        (**self).wait_event(timeout)
    }

    fn forget_in_flight(&mut self) {
        (**self).forget_in_flight();
    }
}
