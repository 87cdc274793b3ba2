use std::fmt;

/// Highest channel count a [`ChannelSet`] can represent.
pub const MAX_CHANNELS: usize = 64;

/// A set of logic channels, bit `i` standing for channel `i`.
///
/// The bit layout is the one the device uses on the wire, so a set can be
/// copied straight into a command frame.
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct ChannelSet(u64);

impl ChannelSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    /// All channels `0..count`.
    pub fn first(count: usize) -> Self {
        if count >= MAX_CHANNELS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub fn contains(self, channel: usize) -> bool {
        channel < MAX_CHANNELS && self.0 & (1 << channel) != 0
    }

    pub fn insert(&mut self, channel: usize) {
        if channel < MAX_CHANNELS {
            self.0 |= 1 << channel;
        }
    }

    pub fn remove(&mut self, channel: usize) {
        if channel < MAX_CHANNELS {
            self.0 &= !(1 << channel);
        }
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    pub const fn is_subset(self, other: Self) -> bool {
        self.0 & !other.0 == 0
    }

    pub const fn intersection(self, other: Self) -> Self {
        Self(self.0 & other.0)
    }

    /// Index of the highest channel in the set.
    pub fn highest(self) -> Option<usize> {
        if self.0 == 0 {
            None
        } else {
            Some(63 - self.0.leading_zeros() as usize)
        }
    }

    /// Whether every channel in the set is below `count`.
    pub fn fits(self, count: usize) -> bool {
        self.is_subset(Self::first(count))
    }

    /// Channel indices in ascending order.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CHANNELS).filter(move |&i| self.contains(i))
    }
}

impl fmt::Debug for ChannelSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChannelSet({:#x})", self.0)
    }
}

impl FromIterator<usize> for ChannelSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = Self::empty();
        for channel in iter {
            set.insert(channel);
        }
        set
    }
}

/// A hardware variant of the analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceModel {
    pub name: &'static str,
    pub channel_count: usize,
}

impl DeviceModel {
    pub const LWLA1016: Self = Self {
        name: "LWLA1016",
        channel_count: 16,
    };

    pub const LWLA1034: Self = Self {
        name: "LWLA1034",
        channel_count: 34,
    };

    /// Bytes per sample record in the device stream.
    pub fn record_width(&self) -> usize {
        self.channel_count.div_ceil(8)
    }

    pub fn all_channels(&self) -> ChannelSet {
        ChannelSet::first(self.channel_count)
    }

    /// The series numbers its inputs CH1..CHn.
    pub fn channel_name(&self, channel: usize) -> String {
        format!("CH{}", channel + 1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_and_fits() {
        let four = ChannelSet::first(4);
        assert_eq!(four.bits(), 0b1111);
        assert!(ChannelSet::from_bits(0b1000).fits(4));
        assert!(!ChannelSet::from_bits(0b1_0000).fits(4));
        assert_eq!(ChannelSet::first(64).bits(), u64::MAX);
    }

    #[test]
    fn test_insert_remove_iter() {
        let mut set = ChannelSet::empty();
        set.insert(0);
        set.insert(33);
        set.insert(2);
        set.remove(2);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 33]);
        assert_eq!(set.len(), 2);
        assert_eq!(set.highest(), Some(33));
        assert!(set.contains(33));
        assert!(!set.contains(64));
    }

    #[test]
    fn test_subset() {
        let a: ChannelSet = [0, 2].into_iter().collect();
        let b = ChannelSet::from_bits(0b0111);
        assert!(a.is_subset(b));
        assert!(!b.is_subset(a));
        assert!(ChannelSet::empty().is_subset(a));
    }

    #[test]
    fn test_model_layout() {
        assert_eq!(DeviceModel::LWLA1016.record_width(), 2);
        assert_eq!(DeviceModel::LWLA1034.record_width(), 5);
        assert_eq!(DeviceModel::LWLA1034.channel_name(0), "CH1");
        assert_eq!(DeviceModel::LWLA1034.all_channels().len(), 34);
    }
}
