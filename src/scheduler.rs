//! Pool of outstanding read transfers on the streaming endpoint.
//!
//! Buffers live in an arena indexed by [`SlotId`]. A buffer is either parked
//! in its slot, lent to the transport while the read is in flight, or lent to
//! the decoder between completion and resubmission. It is never in two of
//! those places at once.

use std::collections::TryReserveError;
use std::time::Duration;

use crate::transport::{SlotId, TransferError, TransferEvent, Transport};

pub const TRANSFER_POOL_SIZE: usize = 4;
pub const TRANSFER_BUFFER_SIZE: usize = 16 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResourceError {
    #[error("Failed to allocate {size} byte transfer buffer")]
    BufferAllocation {
        size: usize,
        #[source]
        source: TryReserveError,
    },
}

#[derive(Debug)]
enum Slot {
    Idle(Vec<u8>),
    InFlight,
    /// Buffer is on loan, or was lost to a failed submission.
    Empty,
}

/// A completed transfer, handed back by [`TransferScheduler::complete`].
#[derive(Debug)]
pub enum Delivery {
    Data { slot: SlotId, buffer: Vec<u8> },
    Failed { slot: SlotId, buffer: Vec<u8>, error: TransferError },
    Cancelled { slot: SlotId, buffer: Vec<u8> },
}

#[derive(Debug)]
pub struct TransferScheduler {
    slots: Vec<Slot>,
    outstanding: usize,
    cancel_requested: bool,
}

impl TransferScheduler {
    pub fn new(pool_size: usize, buffer_size: usize) -> Result<Self, ResourceError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(pool_size)
            .map_err(|source| ResourceError::BufferAllocation {
                size: pool_size * std::mem::size_of::<Slot>(),
                source,
            })?;
        for _ in 0..pool_size {
            let mut buffer = Vec::new();
            buffer
                .try_reserve_exact(buffer_size)
                .map_err(|source| ResourceError::BufferAllocation {
                    size: buffer_size,
                    source,
                })?;
            slots.push(Slot::Idle(buffer));
        }
        Ok(Self {
            slots,
            outstanding: 0,
            cancel_requested: false,
        })
    }

    pub fn with_defaults() -> Result<Self, ResourceError> {
        Self::new(TRANSFER_POOL_SIZE, TRANSFER_BUFFER_SIZE)
    }

    pub fn pool_size(&self) -> usize {
        self.slots.len()
    }

    /// Transfers submitted and not yet reported back.
    pub fn outstanding(&self) -> usize {
        self.outstanding
    }

    pub fn cancellation_requested(&self) -> bool {
        self.cancel_requested
    }

    pub fn is_drained(&self) -> bool {
        self.outstanding == 0
    }

    /// Fills the pool: every parked buffer goes to the transport.
    pub fn submit_all<T: Transport + ?Sized>(&mut self, transport: &mut T) -> Result<usize, TransferError> {
        if self.cancel_requested {
            return Ok(0);
        }
        let mut submitted = 0;
        for slot in 0..self.slots.len() {
            if let Slot::Idle(buffer) = std::mem::replace(&mut self.slots[slot], Slot::Empty) {
                self.submit(slot, buffer, transport)?;
                submitted += 1;
            }
        }
        log::debug!("Submitted {} transfers", submitted);
        Ok(submitted)
    }

    fn submit<T: Transport + ?Sized>(
        &mut self,
        slot: SlotId,
        mut buffer: Vec<u8>,
        transport: &mut T,
    ) -> Result<(), TransferError> {
        buffer.clear();
        match transport.submit_read(slot, buffer) {
            Ok(()) => {
                self.slots[slot] = Slot::InFlight;
                self.outstanding += 1;
                Ok(())
            }
            Err(e) => {
                log::error!("Failed to submit transfer {}: {}", slot, e);
                self.slots[slot] = Slot::Empty;
                Err(e)
            }
        }
    }

    /// Accounts for a completion and lends its buffer to the caller, who must
    /// hand it back through [`Self::resubmit`] or [`Self::park`].
    pub fn complete(&mut self, event: TransferEvent) -> Option<Delivery> {
        let slot = event.slot();
        if !matches!(self.slots.get(slot), Some(Slot::InFlight)) {
            log::warn!("Completion for transfer {} which is not in flight", slot);
            return None;
        }
        self.slots[slot] = Slot::Empty;
        self.outstanding -= 1;

        Some(match event {
            TransferEvent::Completed {
                slot,
                data,
                status: Ok(()),
            } => Delivery::Data { slot, buffer: data },
            TransferEvent::Completed {
                slot,
                data,
                status: Err(TransferError::Cancelled),
            }
            | TransferEvent::CancellationConfirmed { slot, data } => Delivery::Cancelled { slot, buffer: data },
            TransferEvent::Completed {
                slot,
                data,
                status: Err(error),
            } => Delivery::Failed {
                slot,
                buffer: data,
                error,
            },
        })
    }

    /// Puts a returned buffer straight back in flight, unless cancellation
    /// has been requested in the meantime.
    pub fn resubmit<T: Transport + ?Sized>(
        &mut self,
        slot: SlotId,
        buffer: Vec<u8>,
        transport: &mut T,
    ) -> Result<(), TransferError> {
        if self.cancel_requested {
            self.park(slot, buffer);
            return Ok(());
        }
        self.submit(slot, buffer, transport)
    }

    pub fn park(&mut self, slot: SlotId, buffer: Vec<u8>) {
        if let Some(entry) = self.slots.get_mut(slot) {
            *entry = Slot::Idle(buffer);
        }
    }

    /// Requests cancellation of everything in flight. Calling it again is a no-op.
    pub fn cancel_all<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        if self.cancel_requested {
            return;
        }
        self.cancel_requested = true;
        log::debug!("Cancelling {} outstanding transfers", self.outstanding);
        if self.outstanding > 0 {
            transport.cancel_all();
        }
    }

    /// Cancels everything in flight and collects the cancellations that are
    /// already in, without waiting. Transfers still out after that are
    /// written off with [`Transport::forget_in_flight`]. Only for unwinding a
    /// start that failed half way.
    pub fn abandon<T: Transport + ?Sized>(&mut self, transport: &mut T) {
        self.cancel_all(transport);
        while self.outstanding > 0 {
            let Some(event) = transport.wait_event(Duration::ZERO) else {
                break;
            };
            if let Some(delivery) = self.complete(event) {
                let (slot, buffer) = match delivery {
                    Delivery::Data { slot, buffer }
                    | Delivery::Failed { slot, buffer, .. }
                    | Delivery::Cancelled { slot, buffer } => (slot, buffer),
                };
                self.park(slot, buffer);
            }
        }
        if self.outstanding > 0 {
            log::warn!("Writing off {} transfers still in flight", self.outstanding);
            transport.forget_in_flight();
            for slot in &mut self.slots {
                if matches!(slot, Slot::InFlight) {
                    *slot = Slot::Empty;
                }
            }
            self.outstanding = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simulator::SimulatedDevice;
    use crate::channels::DeviceModel;

    fn take_event(device: &mut SimulatedDevice) -> TransferEvent {
        device
            .wait_event(Duration::ZERO)
            .expect("simulated device should have an event")
    }

    #[test]
    fn test_submit_all_fills_pool() {
        let mut device = SimulatedDevice::new(DeviceModel::LWLA1016);
        let mut scheduler = TransferScheduler::new(4, 64).unwrap();
        assert_eq!(scheduler.submit_all(&mut device).unwrap(), 4);
        assert_eq!(scheduler.outstanding(), 4);
        assert_eq!(device.pending_reads(), 4);
        // Nothing parked, nothing to submit.
        assert_eq!(scheduler.submit_all(&mut device).unwrap(), 0);
    }

    #[test]
    fn test_completion_lends_buffer_and_resubmit_returns_it() {
        let mut device = SimulatedDevice::new(DeviceModel::LWLA1016);
        device.queue_bytes(&[1, 2, 3]);
        let mut scheduler = TransferScheduler::new(2, 64).unwrap();
        scheduler.submit_all(&mut device).unwrap();

        let delivery = scheduler.complete(take_event(&mut device)).unwrap();
        assert_eq!(scheduler.outstanding(), 1);
        let Delivery::Data { slot, buffer } = delivery else {
            panic!("expected data, got {:?}", delivery);
        };
        assert_eq!(slot, 0);
        assert_eq!(buffer, vec![1, 2, 3]);

        scheduler.resubmit(slot, buffer, &mut device).unwrap();
        assert_eq!(scheduler.outstanding(), 2);
    }

    #[test]
    fn test_cancel_is_idempotent_and_drains() {
        let mut device = SimulatedDevice::new(DeviceModel::LWLA1016);
        let mut scheduler = TransferScheduler::new(3, 64).unwrap();
        scheduler.submit_all(&mut device).unwrap();

        scheduler.cancel_all(&mut device);
        scheduler.cancel_all(&mut device);
        assert_eq!(device.cancel_requests(), 1);
        assert!(scheduler.cancellation_requested());

        for expected_left in [2, 1, 0] {
            assert!(!scheduler.is_drained());
            let delivery = scheduler.complete(take_event(&mut device)).unwrap();
            let Delivery::Cancelled { slot, buffer } = delivery else {
                panic!("expected cancellation, got {:?}", delivery);
            };
            scheduler.resubmit(slot, buffer, &mut device).unwrap();
            assert_eq!(scheduler.outstanding(), expected_left);
        }
        assert!(scheduler.is_drained());
        assert_eq!(device.pending_reads(), 0);
    }

    #[test]
    fn test_unknown_completion_is_ignored() {
        let mut scheduler = TransferScheduler::new(2, 64).unwrap();
        let stray = TransferEvent::CancellationConfirmed {
            slot: 7,
            data: Vec::new(),
        };
        assert!(scheduler.complete(stray).is_none());
        assert_eq!(scheduler.outstanding(), 0);
    }

    #[test]
    fn test_failed_completion() {
        let mut device = SimulatedDevice::new(DeviceModel::LWLA1016);
        device.fail_completion(0, TransferError::Stall);
        let mut scheduler = TransferScheduler::new(1, 64).unwrap();
        scheduler.submit_all(&mut device).unwrap();
        let delivery = scheduler.complete(take_event(&mut device)).unwrap();
        assert!(matches!(
            delivery,
            Delivery::Failed {
                error: TransferError::Stall,
                ..
            }
        ));
    }

    #[test]
    fn test_abandon_after_partial_start() {
        let mut device = SimulatedDevice::new(DeviceModel::LWLA1016);
        device.fail_submission(2);
        let mut scheduler = TransferScheduler::new(4, 64).unwrap();
        assert!(scheduler.submit_all(&mut device).is_err());
        assert_eq!(scheduler.outstanding(), 2);

        scheduler.abandon(&mut device);
        assert!(scheduler.is_drained());
        assert_eq!(device.pending_reads(), 0);
        assert_eq!(device.forgotten_reads(), 0);
    }

    #[test]
    fn test_abandon_does_not_wait_for_slow_cancellations() {
        let mut device = SimulatedDevice::new(DeviceModel::LWLA1016);
        device.hold_cancellations(true);
        let mut scheduler = TransferScheduler::new(4, 64).unwrap();
        scheduler.submit_all(&mut device).unwrap();

        scheduler.abandon(&mut device);
        assert!(scheduler.is_drained());
        assert_eq!(device.forgotten_reads(), 4);
        assert_eq!(device.pending_reads(), 0);
    }
}
