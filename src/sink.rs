//! Where decoded samples end up.

use std::path::Path;

use polars::prelude::{Column, CsvWriter, DataFrame, NamedFrom, PolarsError, SerWriter, Series};

use crate::channels::{ChannelSet, DeviceModel};
use crate::protocol::ProtocolError;
use crate::transport::TransferError;

const TIME_COLUMN_NAME: &str = "time";

/// Sent once before the first batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamHeader {
    pub model: DeviceModel,
    pub sample_rate: u64,
    pub sample_limit: u64,
    pub channel_mask: ChannelSet,
}

/// Chronological run of samples. Bit `i` of every sample is channel `i`;
/// bits of disabled channels are always clear.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleBatch {
    /// Index of the first sample in this batch since the capture started.
    pub first_index: u64,
    pub channel_mask: ChannelSet,
    pub samples: Vec<u64>,
}

impl SampleBatch {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    /// Levels of one channel, or `None` if it is not part of the capture.
    pub fn channel(&self, channel: usize) -> Option<impl Iterator<Item = bool> + '_> {
        if !self.channel_mask.contains(channel) {
            return None;
        }
        Some(self.samples.iter().map(move |s| s >> channel & 1 == 1))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    Transfer(TransferError),
    Protocol(ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndReason {
    Stopped,
    LimitReached,
    DeviceDone,
    Aborted(AbortReason),
}

/// Sent once, after the stop sequence has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamTrailer {
    pub samples: u64,
    pub end: EndReason,
}

pub trait SampleSink {
    fn header(&mut self, header: &StreamHeader);

    fn samples(&mut self, batch: &SampleBatch);

    /// The trigger fired right before sample `sample_index`.
    fn trigger(&mut self, _sample_index: u64) {}

    fn trailer(&mut self, trailer: &StreamTrailer);
}

impl<S: SampleSink + ?Sized> SampleSink for &mut S {
    fn header(&mut self, header: &StreamHeader) {
        (**self).header(header);
    }

    fn samples(&mut self, batch: &SampleBatch) {
        (**self).samples(batch);
    }

    fn trigger(&mut self, sample_index: u64) {
        (**self).trigger(sample_index);
    }

    fn trailer(&mut self, trailer: &StreamTrailer) {
        (**self).trailer(trailer);
    }
}

/// Keeps a whole capture in memory.
#[derive(Debug, Default)]
pub struct CaptureBuffer {
    pub header: Option<StreamHeader>,
    pub samples: Vec<u64>,
    pub triggers: Vec<u64>,
    pub batches: usize,
    pub trailer: Option<StreamTrailer>,
}

impl CaptureBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.trailer.is_some()
    }

    /// One row per sample: a `time` column in seconds, then one boolean
    /// column per enabled channel named after it.
    pub fn to_dataframe(&self) -> Result<DataFrame, PolarsError> {
        let Some(header) = &self.header else {
            return Ok(DataFrame::empty());
        };

        let period = if header.sample_rate == 0 {
            0.0
        } else {
            1.0 / header.sample_rate as f64
        };
        let time: Vec<f64> = (0..self.samples.len()).map(|i| i as f64 * period).collect();

        let mut columns: Vec<Column> = vec![Series::new(TIME_COLUMN_NAME.into(), time).into()];
        for channel in header.channel_mask.iter() {
            let values: Vec<bool> = self.samples.iter().map(|s| s >> channel & 1 == 1).collect();
            columns.push(Series::new(header.model.channel_name(channel).into(), values).into());
        }
        DataFrame::new(columns)
    }

    pub fn write_csv(&self, path: impl AsRef<Path>) -> Result<(), PolarsError> {
        let mut df = self.to_dataframe()?;
        let mut file = std::fs::File::create(path)?;
        CsvWriter::new(&mut file).include_header(true).finish(&mut df)
    }
}

impl SampleSink for CaptureBuffer {
    fn header(&mut self, header: &StreamHeader) {
        self.header = Some(header.clone());
        self.samples.clear();
        self.triggers.clear();
        self.batches = 0;
        self.trailer = None;
    }

    fn samples(&mut self, batch: &SampleBatch) {
        self.samples.extend_from_slice(&batch.samples);
        self.batches += 1;
    }

    fn trigger(&mut self, sample_index: u64) {
        self.triggers.push(sample_index);
    }

    fn trailer(&mut self, trailer: &StreamTrailer) {
        self.trailer = Some(trailer.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header() -> StreamHeader {
        StreamHeader {
            model: DeviceModel::LWLA1016,
            sample_rate: 1_000,
            sample_limit: 0,
            channel_mask: ChannelSet::from_bits(0b101),
        }
    }

    #[test]
    fn test_batch_channel_view() {
        let batch = SampleBatch {
            first_index: 0,
            channel_mask: ChannelSet::from_bits(0b101),
            samples: vec![0b001, 0b100, 0b101],
        };
        assert_eq!(
            batch.channel(0).unwrap().collect::<Vec<_>>(),
            vec![true, false, true]
        );
        assert!(batch.channel(1).is_none());
    }

    #[test]
    fn test_capture_buffer_dataframe() {
        let mut capture = CaptureBuffer::new();
        capture.header(&header());
        capture.samples(&SampleBatch {
            first_index: 0,
            channel_mask: ChannelSet::from_bits(0b101),
            samples: vec![0b001, 0b100],
        });
        capture.trailer(&StreamTrailer {
            samples: 2,
            end: EndReason::Stopped,
        });
        assert!(capture.is_finished());

        let df = capture.to_dataframe().unwrap();
        assert_eq!(df.height(), 2);
        assert_eq!(df.width(), 3);
        let names: Vec<String> = df
            .get_column_names()
            .iter()
            .map(|n| n.to_string())
            .collect();
        assert_eq!(names, vec!["time", "CH1", "CH3"]);
        let ch3: Vec<bool> = df
            .column("CH3")
            .unwrap()
            .bool()
            .unwrap()
            .into_no_null_iter()
            .collect();
        assert_eq!(ch3, vec![false, true]);
    }

    #[test]
    fn test_empty_capture() {
        assert_eq!(CaptureBuffer::new().to_dataframe().unwrap().height(), 0);
    }
}
