//! An in-memory analyzer for running the engine without hardware.

use std::collections::VecDeque;
use std::time::Duration;

use crate::channels::DeviceModel;
use crate::protocol::{encode_marker, encode_sample_records, Frame, RSP_CAPTURE_DONE, RSP_TRIGGERED};
use crate::transport::{SlotId, TransferError, TransferEvent, Transport};

#[derive(Debug)]
struct PendingRead {
    slot: SlotId,
    buffer: Vec<u8>,
    cancelled: bool,
}

/// Plays back a scripted byte stream through read transfers.
///
/// Reads complete strictly in submission order, each taking as many of the
/// queued stream bytes as its buffer holds. A read with nothing to deliver
/// stays pending, just like on the wire.
#[derive(Debug)]
pub struct SimulatedDevice {
    model: DeviceModel,
    stream: VecDeque<u8>,
    pending: VecDeque<PendingRead>,
    commands: Vec<Frame>,
    failed_commands: usize,
    command_failure: Option<(u16, TransferError)>,
    completion_failure: Option<(usize, TransferError)>,
    submission_failure: Option<usize>,
    hold_cancellations: bool,
    completions: usize,
    submissions: usize,
    cancel_requests: usize,
    forgotten: usize,
}

impl SimulatedDevice {
    pub fn new(model: DeviceModel) -> Self {
        Self {
            model,
            stream: VecDeque::new(),
            pending: VecDeque::new(),
            commands: Vec::new(),
            failed_commands: 0,
            command_failure: None,
            completion_failure: None,
            submission_failure: None,
            hold_cancellations: false,
            completions: 0,
            submissions: 0,
            cancel_requests: 0,
            forgotten: 0,
        }
    }

    pub fn model(&self) -> DeviceModel {
        self.model
    }

    /// Appends raw bytes to what the device will stream.
    pub fn queue_bytes(&mut self, bytes: &[u8]) {
        self.stream.extend(bytes);
    }

    /// Appends sample records, packed the way the device packs them.
    pub fn queue_samples(&mut self, records: &[u64]) {
        let bytes = encode_sample_records(records, self.model.record_width());
        self.queue_bytes(&bytes);
    }

    pub fn queue_trigger(&mut self) {
        self.queue_bytes(&encode_marker(RSP_TRIGGERED));
    }

    pub fn queue_capture_done(&mut self) {
        self.queue_bytes(&encode_marker(RSP_CAPTURE_DONE));
    }

    /// Every command with this opcode fails from now on.
    pub fn fail_command(&mut self, opcode: u16, error: TransferError) {
        self.command_failure = Some((opcode, error));
    }

    /// The `index`-th completion (counting from 0) reports `error`.
    pub fn fail_completion(&mut self, index: usize, error: TransferError) {
        self.completion_failure = Some((index, error));
    }

    /// The `index`-th submission (counting from 0) is refused.
    pub fn fail_submission(&mut self, index: usize) {
        self.submission_failure = Some(index);
    }

    /// Cancelled reads stay pending instead of being confirmed.
    pub fn hold_cancellations(&mut self, hold: bool) {
        self.hold_cancellations = hold;
    }

    pub fn clear_failures(&mut self) {
        self.command_failure = None;
        self.completion_failure = None;
        self.submission_failure = None;
    }

    /// Commands the device accepted, oldest first.
    pub fn commands(&self) -> &[Frame] {
        &self.commands
    }

    pub fn failed_commands(&self) -> usize {
        self.failed_commands
    }

    pub fn pending_reads(&self) -> usize {
        self.pending.len()
    }

    pub fn cancel_requests(&self) -> usize {
        self.cancel_requests
    }

    /// Reads dropped through [`Transport::forget_in_flight`].
    pub fn forgotten_reads(&self) -> usize {
        self.forgotten
    }

    pub fn completions(&self) -> usize {
        self.completions
    }

    pub fn stream_remaining(&self) -> usize {
        self.stream.len()
    }
}

impl Transport for SimulatedDevice {
    fn send_command(&mut self, frame: &Frame) -> Result<(), TransferError> {
        if let Some((opcode, error)) = &self.command_failure {
            if *opcode == frame.opcode() {
                self.failed_commands += 1;
                return Err(error.clone());
            }
        }
        self.commands.push(frame.clone());
        Ok(())
    }

    fn submit_read(&mut self, slot: SlotId, buffer: Vec<u8>) -> Result<(), TransferError> {
        let index = self.submissions;
        self.submissions += 1;
        if self.submission_failure == Some(index) {
            return Err(TransferError::Fault);
        }
        self.pending.push_back(PendingRead {
            slot,
            buffer,
            cancelled: false,
        });
        Ok(())
    }

    fn cancel_all(&mut self) {
        self.cancel_requests += 1;
        for read in &mut self.pending {
            read.cancelled = true;
        }
    }

    fn wait_event(&mut self, _timeout: Duration) -> Option<TransferEvent> {
        let front = self.pending.front()?;
        if front.cancelled && self.hold_cancellations {
            return None;
        }
        let failure = match &self.completion_failure {
            Some((index, error)) if *index == self.completions && !front.cancelled => Some(error.clone()),
            _ => None,
        };
        if !front.cancelled && failure.is_none() && self.stream.is_empty() {
            return None;
        }

        let mut read = self.pending.pop_front()?;
        self.completions += 1;

        if read.cancelled {
            return Some(TransferEvent::CancellationConfirmed {
                slot: read.slot,
                data: read.buffer,
            });
        }
        if let Some(error) = failure {
            return Some(TransferEvent::Completed {
                slot: read.slot,
                data: read.buffer,
                status: Err(error),
            });
        }

        let take = read.buffer.capacity().max(1).min(self.stream.len());
        read.buffer.extend(self.stream.drain(..take));
        Some(TransferEvent::Completed {
            slot: read.slot,
            data: read.buffer,
            status: Ok(()),
        })
    }

    fn forget_in_flight(&mut self) {
        self.forgotten += self.pending.len();
        self.pending.clear();
    }
}
