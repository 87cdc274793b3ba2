use crate::channels::ChannelSet;
use crate::protocol::TriggerMasks;

/// Trigger characters the device understands, as reported to frontends.
pub const TRIGGER_TYPES: &str = "01rf";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TriggerConfigError {
    #[error("Only one trigger stage is supported (channel {channel} got {spec:?})")]
    MultipleStages { channel: usize, spec: String },

    #[error("Trigger type '{kind}' is not supported on channel {channel}")]
    UnsupportedType { channel: usize, kind: char },

    #[error("Channel {channel} over the limit of {channel_count}")]
    ChannelOverLimit { channel: usize, channel_count: usize },

    #[error("Edge trigger configured on channels {0:?} without a trigger")]
    EdgeWithoutTrigger(ChannelSet),
}

/// What a single channel has to do for the trigger to fire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMatch {
    Low,
    High,
    Rising,
    Falling,
}

impl TriggerMatch {
    pub fn from_char(channel: usize, kind: char) -> Result<Self, TriggerConfigError> {
        match kind {
            '0' => Ok(TriggerMatch::Low),
            '1' => Ok(TriggerMatch::High),
            'r' => Ok(TriggerMatch::Rising),
            'f' => Ok(TriggerMatch::Falling),
            other => Err(TriggerConfigError::UnsupportedType {
                channel,
                kind: other,
            }),
        }
    }

    pub fn as_char(&self) -> char {
        match self {
            TriggerMatch::Low => '0',
            TriggerMatch::High => '1',
            TriggerMatch::Rising => 'r',
            TriggerMatch::Falling => 'f',
        }
    }

    pub fn is_edge(&self) -> bool {
        matches!(self, TriggerMatch::Rising | TriggerMatch::Falling)
    }

    /// Level to match, or the level an edge ends on.
    pub fn value(&self) -> bool {
        match self {
            TriggerMatch::Low => false,
            TriggerMatch::High => true,
            TriggerMatch::Rising => true,
            // Edge bit set, value bit clear.
            TriggerMatch::Falling => false,
        }
    }
}

/// Parses one channel's trigger string. An empty string means no trigger.
pub fn parse_trigger(channel: usize, spec: &str) -> Result<Option<TriggerMatch>, TriggerConfigError> {
    let mut chars = spec.chars();
    let Some(kind) = chars.next() else {
        return Ok(None);
    };
    if chars.next().is_some() {
        return Err(TriggerConfigError::MultipleStages {
            channel,
            spec: spec.to_string(),
        });
    }
    TriggerMatch::from_char(channel, kind).map(Some)
}

/// Channel enablement and trigger, as handed over by a frontend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelSpec<'a> {
    pub enabled: bool,
    pub trigger: &'a str,
}

impl<'a> ChannelSpec<'a> {
    pub fn new(enabled: bool, trigger: &'a str) -> Self {
        Self { enabled, trigger }
    }
}

/// Builds [`TriggerMasks`] from one [`ChannelSpec`] per channel, in channel order.
pub fn masks_from_specs(
    specs: &[ChannelSpec<'_>],
    channel_count: usize,
) -> Result<TriggerMasks, TriggerConfigError> {
    let mut builder = ChannelTriggerBuilder::new(channel_count);
    for (channel, spec) in specs.iter().enumerate() {
        if channel >= channel_count {
            return Err(TriggerConfigError::ChannelOverLimit {
                channel,
                channel_count,
            });
        }
        if !spec.enabled {
            continue;
        }
        builder = builder.enable(channel);
        if let Some(trigger) = parse_trigger(channel, spec.trigger)? {
            builder = builder.trigger(channel, trigger);
        }
    }
    builder.build()
}

impl TriggerMasks {
    /// Validates raw masks: every bit below `channel_count`, edges only on triggered channels.
    pub fn from_raw(
        channel_mask: u64,
        trigger_mask: u64,
        trigger_edge_mask: u64,
        trigger_values: u64,
        channel_count: usize,
    ) -> Result<Self, TriggerConfigError> {
        let masks = Self {
            channel_mask: ChannelSet::from_bits(channel_mask),
            trigger_mask: ChannelSet::from_bits(trigger_mask),
            trigger_edge_mask: ChannelSet::from_bits(trigger_edge_mask),
            trigger_values: ChannelSet::from_bits(trigger_values),
        };
        masks.validate(channel_count)?;
        Ok(masks)
    }

    pub fn validate(&self, channel_count: usize) -> Result<(), TriggerConfigError> {
        let all = ChannelSet::from_bits(
            self.channel_mask.bits()
                | self.trigger_mask.bits()
                | self.trigger_edge_mask.bits()
                | self.trigger_values.bits(),
        );
        if let Some(channel) = all.highest() {
            if channel >= channel_count {
                return Err(TriggerConfigError::ChannelOverLimit {
                    channel,
                    channel_count,
                });
            }
        }
        if !self.trigger_edge_mask.is_subset(self.trigger_mask) {
            return Err(TriggerConfigError::EdgeWithoutTrigger(ChannelSet::from_bits(
                self.trigger_edge_mask.bits() & !self.trigger_mask.bits(),
            )));
        }
        Ok(())
    }

    /// Per-channel trigger, if that channel is armed.
    pub fn trigger_for(&self, channel: usize) -> Option<TriggerMatch> {
        if !self.trigger_mask.contains(channel) {
            return None;
        }
        let value = self.trigger_values.contains(channel);
        Some(match (self.trigger_edge_mask.contains(channel), value) {
            (false, false) => TriggerMatch::Low,
            (false, true) => TriggerMatch::High,
            (true, true) => TriggerMatch::Rising,
            (true, false) => TriggerMatch::Falling,
        })
    }
}

#[derive(Debug)]
pub struct ChannelTriggerBuilder {
    channel_count: usize,
    enabled: ChannelSet,
    triggers: Vec<(usize, TriggerMatch)>,
}

impl ChannelTriggerBuilder {
    pub fn new(channel_count: usize) -> Self {
        Self {
            channel_count,
            enabled: ChannelSet::empty(),
            triggers: Vec::new(),
        }
    }

    pub fn enable(mut self, channel: usize) -> Self {
        self.enabled.insert(channel);
        self
    }

    pub fn enable_all(mut self) -> Self {
        self.enabled = ChannelSet::first(self.channel_count);
        self
    }

    /// Enables `channel` and arms it with `trigger`, replacing any earlier one.
    pub fn trigger(mut self, channel: usize, trigger: TriggerMatch) -> Self {
        self.enabled.insert(channel);
        self.triggers.retain(|(c, _)| *c != channel);
        self.triggers.push((channel, trigger));
        self
    }

    pub fn build(self) -> Result<TriggerMasks, TriggerConfigError> {
        let mut masks = TriggerMasks {
            channel_mask: self.enabled,
            ..TriggerMasks::default()
        };
        for (channel, trigger) in self.triggers {
            if channel >= self.channel_count {
                return Err(TriggerConfigError::ChannelOverLimit {
                    channel,
                    channel_count: self.channel_count,
                });
            }
            masks.trigger_mask.insert(channel);
            if trigger.is_edge() {
                masks.trigger_edge_mask.insert(channel);
            }
            if trigger.value() {
                masks.trigger_values.insert(channel);
            }
        }
        masks.validate(self.channel_count)?;
        Ok(masks)
    }
}
