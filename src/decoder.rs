//! Turns the raw byte stream from completed transfers into samples.
//!
//! Frames do not line up with transfer boundaries, so whatever is left of a
//! partial frame is kept as residue and glued in front of the next buffer.
//! Buffers must therefore be fed in the order they arrived.

use crate::channels::ChannelSet;
use crate::protocol::{decode_response, ProtocolError, Response};

/// Output of one [`SampleDecoder::feed`] call.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Decoded {
    /// Masked samples in chronological order, bit `i` holding channel `i`.
    pub samples: Vec<u64>,
    /// Sample index, counted from the start of the capture, at which a
    /// trigger fired.
    pub triggers: Vec<u64>,
    /// Set on the one call during which the sample limit was hit.
    pub limit_reached: bool,
    pub capture_done: bool,
    /// Set when the stream turned out corrupt. Everything decoded before
    /// the bad frame is still in `samples`, and nothing after it is.
    pub error: Option<ProtocolError>,
}

#[derive(Debug)]
pub struct SampleDecoder {
    record_width: usize,
    channel_mask: ChannelSet,
    sample_limit: u64,
    bytes_pending: Vec<u8>,
    samples_emitted: u64,
    limit_signalled: bool,
}

impl SampleDecoder {
    /// `sample_limit` of 0 means unbounded.
    pub fn new(record_width: usize, channel_mask: ChannelSet, sample_limit: u64) -> Self {
        Self {
            record_width: record_width.max(1),
            channel_mask,
            sample_limit,
            bytes_pending: Vec::new(),
            samples_emitted: 0,
            limit_signalled: false,
        }
    }

    pub fn samples_emitted(&self) -> u64 {
        self.samples_emitted
    }

    pub fn residue(&self) -> &[u8] {
        &self.bytes_pending
    }

    pub fn limit_reached(&self) -> bool {
        self.sample_limit != 0 && self.samples_emitted >= self.sample_limit
    }

    /// Decodes as many whole frames as `bytes` plus the residue contain.
    ///
    /// Stops at the first bad frame, which stays in the residue.
    pub fn feed(&mut self, bytes: &[u8]) -> Decoded {
        let mut pending = std::mem::take(&mut self.bytes_pending);
        let data: &[u8] = if pending.is_empty() {
            bytes
        } else {
            pending.extend_from_slice(bytes);
            &pending
        };

        let mut out = Decoded::default();
        let mut offset = 0;
        while offset < data.len() {
            let response = match decode_response(&data[offset..]) {
                Ok(response) => response,
                Err(ProtocolError::Truncated { .. }) => break,
                Err(e) => {
                    out.error = Some(e);
                    break;
                }
            };
            let response_len = response.wire_len();

            match response {
                Response::Samples(records) => {
                    if let Err(e) = self.push_records(records, &mut out) {
                        out.error = Some(e);
                        break;
                    }
                }
                Response::Triggered => {
                    if !self.limit_reached() {
                        out.triggers.push(self.samples_emitted);
                    }
                }
                Response::CaptureDone => {
                    out.capture_done = true;
                }
            }
            offset += response_len;
        }

        self.bytes_pending = data[offset..].to_vec();
        out
    }

    fn push_records(&mut self, records: &[u8], out: &mut Decoded) -> Result<(), ProtocolError> {
        if records.len() % self.record_width != 0 {
            return Err(ProtocolError::Malformed {
                opcode: crate::protocol::RSP_SAMPLES,
                reason: "payload is not a whole number of sample records",
            });
        }

        let mask = self.channel_mask.bits();
        for record in records.chunks_exact(self.record_width) {
            if self.limit_reached() {
                // Excess from transfers still in flight when the limit hit.
                break;
            }
            let mut raw = [0u8; 8];
            let width = record.len().min(8);
            raw[..width].copy_from_slice(&record[..width]);
            out.samples.push(u64::from_le_bytes(raw) & mask);
            self.samples_emitted += 1;

            if self.limit_reached() && !self.limit_signalled {
                self.limit_signalled = true;
                out.limit_reached = true;
            }
        }
        Ok(())
    }
}
