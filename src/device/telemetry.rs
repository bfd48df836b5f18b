use std::collections::VecDeque;
use time::UtcOffset;

use crate::device::codec::{format_local, Payload, ReadingKey};
use crate::device::constants::HISTORY_CAPACITY;
use crate::error::DecodeError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimestampEntry {
    pub epoch_seconds: i64,
    pub display: String,
}

/// Application state fed by notifications.
#[derive(Debug, Clone)]
pub struct Telemetry {
    flow_rate: Option<i64>,
    volume: Option<i64>,
    history: VecDeque<TimestampEntry>,
    capacity: usize,
    offset: UtcOffset,
}

impl Telemetry {
    pub fn new(capacity: usize, offset: UtcOffset) -> Self {
        Telemetry {
            flow_rate: None,
            volume: None,
            history: VecDeque::with_capacity(capacity.min(HISTORY_CAPACITY)),
            capacity,
            offset,
        }
    }

    pub fn flow_rate(&self) -> Option<i64> {
        self.flow_rate
    }

    pub fn volume(&self) -> Option<i64> {
        self.volume
    }

    /// The most recent timestamp entries, oldest first.
    pub fn history(&self) -> impl Iterator<Item = &TimestampEntry> {
        self.history.iter()
    }

    pub fn history_len(&self) -> usize {
        self.history.len()
    }

    /// Pairs the history into display rows of two columns.
    pub fn history_rows(&self) -> Vec<(String, String)> {
        let entries: Vec<&TimestampEntry> = self.history.iter().collect();
        entries
            .chunks(2)
            .map(|pair| {
                let left = pair[0].display.clone();
                let right = pair.get(1).map(|entry| entry.display.clone()).unwrap_or_default();
                (left, right)
            })
            .collect()
    }

    pub fn apply(&mut self, payload: &Payload) -> Result<(), DecodeError> {
        match payload {
            Payload::Reading { key: ReadingKey::FlowRate, value } => self.flow_rate = Some(*value),
            Payload::Reading { key: ReadingKey::Volume, value } => self.volume = Some(*value),
            Payload::Timestamp(datetime) => {
                let display = format_local(*datetime, self.offset)?;
                if self.capacity == 0 {
                    return Ok(());
                }
                while self.history.len() >= self.capacity {
                    self.history.pop_front();
                }
                self.history.push_back(TimestampEntry {
                    epoch_seconds: datetime.unix_timestamp(),
                    display,
                });
            },
        }

        Ok(())
    }
}
