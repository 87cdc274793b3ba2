//! Command and response frames exchanged with the analyzer.
//!
//! Every frame starts with a four byte header, a little-endian opcode
//! followed by the little-endian payload length. Nothing in here does I/O.

use crate::channels::ChannelSet;

pub const HEADER_LEN: usize = 4;
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

pub const CMD_SET_CLOCK_SOURCE: u16 = 0x0001;
pub const CMD_CONFIGURE_TRIGGERS: u16 = 0x0002;
pub const CMD_ARM: u16 = 0x0003;

pub const RSP_SAMPLES: u16 = 0x8001;
pub const RSP_TRIGGERED: u16 = 0x8002;
pub const RSP_CAPTURE_DONE: u16 = 0x8003;

/// Supported sample rates in Hz, fastest first.
///
/// The hardware can do more than these, the vendor software only ever
/// offers this list.
pub const SAMPLE_RATES: [u64; 20] = [
    125_000_000,
    100_000_000,
    50_000_000,
    20_000_000,
    10_000_000,
    5_000_000,
    2_000_000,
    1_000_000,
    500_000,
    200_000,
    100_000,
    50_000,
    20_000,
    10_000,
    5_000,
    2_000,
    1_000,
    500,
    200,
    100,
];

pub const MAX_SAMPLE_RATE: u64 = SAMPLE_RATES[0];
pub const MIN_SAMPLE_RATE: u64 = SAMPLE_RATES[SAMPLE_RATES.len() - 1];
pub const DEFAULT_SAMPLE_RATE: u64 = MAX_SAMPLE_RATE;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    #[error("Frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    #[error("Malformed frame with opcode {opcode:#06x}: {reason}")]
    Malformed { opcode: u16, reason: &'static str },

    #[error("Unknown response opcode {0:#06x}")]
    UnknownOpcode(u16),

    #[error("Unsupported sample rate {0} Hz")]
    UnsupportedRate(u64),

    #[error("Channel {channel} exceeds the device's {channel_count} channels")]
    ChannelOverflow { channel: usize, channel_count: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum ClockSource {
    /// Loads the shutdown bitstream. Only used when closing down.
    None,
    #[default]
    Internal,
    ExternalRisingEdge,
    ExternalFallingEdge,
}

impl ClockSource {
    pub fn wire_value(self) -> u8 {
        match self {
            ClockSource::None => 0,
            ClockSource::Internal => 1,
            ClockSource::ExternalRisingEdge => 2,
            ClockSource::ExternalFallingEdge => 3,
        }
    }

    pub fn is_external(self) -> bool {
        matches!(
            self,
            ClockSource::ExternalRisingEdge | ClockSource::ExternalFallingEdge
        )
    }
}

/// An encoded command, ready to be written to the command endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Vec<u8>,
}

impl Frame {
    fn new(opcode: u16, payload: &[u8]) -> Self {
        let mut bytes = Vec::with_capacity(HEADER_LEN + payload.len());
        bytes.extend_from_slice(&opcode.to_le_bytes());
        bytes.extend_from_slice(&(payload.len() as u16).to_le_bytes());
        bytes.extend_from_slice(payload);
        Self { bytes }
    }

    pub fn opcode(&self) -> u16 {
        u16::from_le_bytes([self.bytes[0], self.bytes[1]])
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[HEADER_LEN..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

/// Trigger and channel masks as they go over the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TriggerMasks {
    pub channel_mask: ChannelSet,
    pub trigger_mask: ChannelSet,
    pub trigger_edge_mask: ChannelSet,
    pub trigger_values: ChannelSet,
}

pub fn encode_set_clock_source(source: ClockSource) -> Frame {
    Frame::new(CMD_SET_CLOCK_SOURCE, &[source.wire_value()])
}

pub fn encode_configure_triggers(
    masks: &TriggerMasks,
    channel_count: usize,
) -> Result<Frame, ProtocolError> {
    let all = masks.channel_mask.bits()
        | masks.trigger_mask.bits()
        | masks.trigger_edge_mask.bits()
        | masks.trigger_values.bits();
    if let Some(channel) = ChannelSet::from_bits(all).highest() {
        if channel >= channel_count {
            return Err(ProtocolError::ChannelOverflow {
                channel,
                channel_count,
            });
        }
    }

    let mut payload = [0u8; 32];
    for (chunk, mask) in payload.chunks_exact_mut(8).zip([
        masks.channel_mask,
        masks.trigger_mask,
        masks.trigger_edge_mask,
        masks.trigger_values,
    ]) {
        chunk.copy_from_slice(&mask.bits().to_le_bytes());
    }
    Ok(Frame::new(CMD_CONFIGURE_TRIGGERS, &payload))
}

pub fn encode_arm(sample_rate: u64, sample_limit: u64) -> Result<Frame, ProtocolError> {
    validate_sample_rate(sample_rate)?;

    let mut payload = [0u8; 16];
    payload[..8].copy_from_slice(&sample_rate.to_le_bytes());
    payload[8..].copy_from_slice(&sample_limit.to_le_bytes());
    Ok(Frame::new(CMD_ARM, &payload))
}

/// Accepts only exact members of [`SAMPLE_RATES`].
pub fn validate_sample_rate(rate: u64) -> Result<(), ProtocolError> {
    if rate > MAX_SAMPLE_RATE || rate < MIN_SAMPLE_RATE || !SAMPLE_RATES.contains(&rate) {
        return Err(ProtocolError::UnsupportedRate(rate));
    }
    Ok(())
}

/// A frame received on the streaming endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response<'a> {
    /// Packed sample records, oldest first.
    Samples(&'a [u8]),
    Triggered,
    CaptureDone,
}

impl Response<'_> {
    /// Number of stream bytes this frame occupied, header included.
    pub fn wire_len(&self) -> usize {
        match self {
            Response::Samples(data) => HEADER_LEN + data.len(),
            Response::Triggered | Response::CaptureDone => HEADER_LEN,
        }
    }
}

/// Decodes the frame at the start of `bytes`.
///
/// Returns [`ProtocolError::Truncated`] when the frame is not complete yet;
/// the caller keeps the bytes and retries once more have arrived.
pub fn decode_response(bytes: &[u8]) -> Result<Response<'_>, ProtocolError> {
    if bytes.len() < HEADER_LEN {
        return Err(ProtocolError::Truncated {
            needed: HEADER_LEN,
            available: bytes.len(),
        });
    }
    let opcode = u16::from_le_bytes([bytes[0], bytes[1]]);
    let length = u16::from_le_bytes([bytes[2], bytes[3]]) as usize;

    // Reject garbage before asking the caller to wait for more of it.
    match opcode {
        RSP_SAMPLES => {}
        RSP_TRIGGERED | RSP_CAPTURE_DONE if length != 0 => {
            return Err(ProtocolError::Malformed {
                opcode,
                reason: "unexpected payload",
            })
        }
        RSP_TRIGGERED | RSP_CAPTURE_DONE => {}
        other => return Err(ProtocolError::UnknownOpcode(other)),
    }

    let needed = HEADER_LEN + length;
    if bytes.len() < needed {
        return Err(ProtocolError::Truncated {
            needed,
            available: bytes.len(),
        });
    }

    Ok(match opcode {
        RSP_SAMPLES => Response::Samples(&bytes[HEADER_LEN..needed]),
        RSP_TRIGGERED => Response::Triggered,
        _ => Response::CaptureDone,
    })
}

/// Packs sample records into SAMPLES frames, splitting at the payload limit.
pub fn encode_sample_records(records: &[u64], record_width: usize) -> Vec<u8> {
    let per_frame = (MAX_PAYLOAD_LEN / record_width).max(1);
    let mut out = Vec::with_capacity(records.len() * record_width + HEADER_LEN);
    for chunk in records.chunks(per_frame) {
        let mut payload = Vec::with_capacity(chunk.len() * record_width);
        for record in chunk {
            payload.extend_from_slice(&record.to_le_bytes()[..record_width]);
        }
        out.extend_from_slice(Frame::new(RSP_SAMPLES, &payload).as_bytes());
    }
    out
}

pub fn encode_marker(opcode: u16) -> Vec<u8> {
    Frame::new(opcode, &[]).into_bytes()
}
