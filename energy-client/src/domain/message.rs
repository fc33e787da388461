use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use super::Reading;

/// The readings produced by one tick.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadingBatch {
    pub timestamp: OffsetDateTime,
    pub readings: Vec<Reading>,
}

impl ReadingBatch {
    pub fn new(timestamp: OffsetDateTime, readings: Vec<Reading>) -> Self {
        Self { timestamp, readings }
    }

    pub fn len(&self) -> usize {
        self.readings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.readings.is_empty()
    }
}

/// Frame pushed from the broadcast endpoint to subscribers.
///
/// ```json
/// { "type": "readings", "data": [ ... ], "timestamp": "2024-03-01T12:00:00Z" }
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StreamMessage {
    Readings {
        data: Vec<Reading>,
        #[serde(with = "time::serde::rfc3339")]
        timestamp: OffsetDateTime,
    },
}

impl From<ReadingBatch> for StreamMessage {
    fn from(batch: ReadingBatch) -> Self {
        Self::Readings {
            data: batch.readings,
            timestamp: batch.timestamp,
        }
    }
}

impl From<StreamMessage> for ReadingBatch {
    fn from(msg: StreamMessage) -> Self {
        match msg {
            StreamMessage::Readings { data, timestamp } => ReadingBatch::new(timestamp, data),
        }
    }
}
