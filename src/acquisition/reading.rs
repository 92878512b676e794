//! Per-poll thermocouple readings.

use serde::Serialize;
use std::collections::BTreeMap;

/// Temperatures of one poll, keyed by channel.
///
/// `None` marks a channel whose read failed or produced an implausible value.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChannelReading {
    values: BTreeMap<u8, Option<f64>>,
}

impl ChannelReading {
    /// Empty reading.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the result for one channel.
    pub fn insert(&mut self, channel: u8, celsius: Option<f64>) {
        self.values.insert(channel, celsius);
    }

    /// Temperature of `channel`; `None` if absent or not read.
    pub fn get(&self, channel: u8) -> Option<f64> {
        self.values.get(&channel).copied().flatten()
    }

    /// Whether `channel` was part of this poll.
    pub fn contains(&self, channel: u8) -> bool {
        self.values.contains_key(&channel)
    }

    /// Channels that were read, ascending.
    pub fn channels(&self) -> impl Iterator<Item = u8> + '_ {
        self.values.keys().copied()
    }

    /// `(channel, value)` pairs, ascending.
    pub fn iter(&self) -> impl Iterator<Item = (u8, Option<f64>)> + '_ {
        self.values.iter().map(|(ch, value)| (*ch, *value))
    }

    /// Number of channels read.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// No channel was read.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Number of channels with a value.
    pub fn valid_count(&self) -> usize {
        self.values.values().filter(|v| v.is_some()).count()
    }

    /// Channels that were read but produced no value.
    pub fn open_channels(&self) -> Vec<u8> {
        self.values
            .iter()
            .filter(|(_, value)| value.is_none())
            .map(|(ch, _)| *ch)
            .collect()
    }

    /// Mean over the listed channels that have a value.
    ///
    /// `None` when none of them does.
    pub fn average(&self, channels: &[u8]) -> Option<f64> {
        let valid: Vec<f64> = channels.iter().filter_map(|ch| self.get(*ch)).collect();
        if valid.is_empty() {
            return None;
        }
        Some(valid.iter().sum::<f64>() / valid.len() as f64)
    }

    /// Overwrite entries with those of `newer`.
    pub fn merge(&mut self, newer: &ChannelReading) {
        self.values.extend(newer.values.iter().map(|(k, v)| (*k, *v)));
    }
}

impl FromIterator<(u8, Option<f64>)> for ChannelReading {
    fn from_iter<I: IntoIterator<Item = (u8, Option<f64>)>>(iter: I) -> Self {
        Self {
            values: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ChannelReading {
        [(0, Some(40.0)), (1, None), (2, Some(36.0)), (3, Some(38.0))]
            .into_iter()
            .collect()
    }

    #[test]
    fn average_uses_only_valid_channels() {
        let reading = sample();
        assert_eq!(reading.average(&[0, 1, 2, 3]), Some(38.0));
        assert_eq!(reading.average(&[0, 2]), Some(38.0));
        assert_eq!(reading.valid_count(), 3);
    }

    #[test]
    fn average_without_valid_channels_is_none() {
        let reading = sample();
        assert_eq!(reading.average(&[1]), None);
        // Channels never read count as absent
        assert_eq!(reading.average(&[6, 7]), None);
        assert_eq!(reading.average(&[]), None);
    }

    #[test]
    fn open_channels_are_reported() {
        assert_eq!(sample().open_channels(), vec![1]);
        assert!(ChannelReading::new().open_channels().is_empty());
    }

    #[test]
    fn merge_replaces_older_values() {
        let mut last = sample();
        let newer: ChannelReading = [(1, Some(35.0)), (2, None)].into_iter().collect();
        last.merge(&newer);
        assert_eq!(last.get(1), Some(35.0));
        assert_eq!(last.get(2), None);
        assert_eq!(last.open_channels(), vec![2]);
    }
}
