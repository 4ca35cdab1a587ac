//! Assistant adjustments
//!
//! An external assistant may attach key/value signals to a record during the
//! enqueue delay window. They are buffered on the record and merged right
//! before ranking, so a late adjustment never reorders an already-committed
//! pass.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known adjustment keys.
pub const KEY_IMPORTANCE: &str = "importance";
pub const KEY_RANKING_SCORE: &str = "ranking_score";
pub const KEY_GROUP_KEY: &str = "group_key";
pub const KEY_CRITICALITY: &str = "criticality";

/// One key/value signal from an assistant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Adjustment {
    pub signal: String,
    pub value: Value,
}

impl Adjustment {
    pub fn new(signal: impl Into<String>, value: Value) -> Self {
        Self {
            signal: signal.into(),
            value,
        }
    }

    pub fn ranking_score(score: f32) -> Self {
        Self::new(KEY_RANKING_SCORE, serde_json::json!(score))
    }

    pub fn importance(importance: super::Importance) -> Self {
        Self::new(KEY_IMPORTANCE, serde_json::json!(importance))
    }

    pub fn group_key(group_key: impl Into<String>) -> Self {
        Self::new(KEY_GROUP_KEY, Value::String(group_key.into()))
    }

    pub fn criticality(level: i32) -> Self {
        Self::new(KEY_CRITICALITY, serde_json::json!(level))
    }
}
