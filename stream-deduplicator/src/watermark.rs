//! Global event-time watermark.
//!
//! `W = max(observed event time) - lateness`, starting at negative infinity
//! (`None`) and never moving backwards. The value depends only on event times
//! carried by input rows, never on processing time.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkTracker {
    /// `None` disables advancement entirely
    lateness_ms: Option<i64>,
    current: Option<i64>,
}

impl WatermarkTracker {
    pub fn new(lateness: Option<Duration>) -> Self {
        Self {
            lateness_ms: lateness.map(|l| i64::try_from(l.as_millis()).unwrap_or(i64::MAX)),
            current: None,
        }
    }

    /// Rebuild a tracker from a committed watermark value.
    pub fn restored(lateness: Option<Duration>, current: Option<i64>) -> Self {
        Self {
            current,
            ..Self::new(lateness)
        }
    }

    pub fn current(&self) -> Option<i64> {
        self.current
    }

    pub fn is_enabled(&self) -> bool {
        self.lateness_ms.is_some()
    }

    /// Move the watermark forward using the max event time of a batch.
    /// A batch without event-time-bearing rows leaves it unchanged.
    pub fn advance(&mut self, batch_max_event_time: Option<i64>) -> Option<i64> {
        if let (Some(lateness), Some(max)) = (self.lateness_ms, batch_max_event_time) {
            let candidate = max.saturating_sub(lateness);
            if self.current.map_or(true, |w| candidate > w) {
                self.current = Some(candidate);
            }
        }
        self.current
    }

    /// True iff `event_time < W`.
    pub fn is_late(&self, event_time: i64) -> bool {
        self.current.is_some_and(|w| event_time < w)
    }

    /// True iff state stamped with `bucket` is at or below the watermark and can be evicted.
    pub fn is_expired(&self, bucket: i64) -> bool {
        self.current.is_some_and(|w| bucket <= w)
    }

    /// Max event time over rows that are not late; these are the only rows
    /// allowed to push the watermark.
    pub fn batch_max_event_time<I>(&self, event_times: I) -> Option<i64>
    where
        I: IntoIterator<Item = Option<i64>>,
    {
        event_times
            .into_iter()
            .flatten()
            .filter(|t| !self.is_late(*t))
            .max()
    }
}
