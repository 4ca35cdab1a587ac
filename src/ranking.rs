//! Ranking engine
//!
//! Produces the total order of the live notification set. Pure apart from
//! writing the derived `is_intercepted` and `sort_key` fields back onto each
//! record. The comparator is fully deterministic (key tiebreak), so ranking
//! the same set twice with an unchanged snapshot yields an unchanged order.
//!
//! Ordering, high to low priority:
//! 1. assistant rank score, descending (zero ties fall through)
//! 2. importance, descending (after per-channel overrides from the snapshot)
//! 3. non-intercepted before intercepted
//! 4. recency: ranking time, or raw post time when the host sorts strictly
//!    by post time
//! 5. key, ascending

use std::cmp::Ordering;

use crate::policy::{PolicyProvider, PolicySnapshot};
use crate::record::{NotificationRecord, RecordKey};

pub struct RankingEngine {
    /// Host configuration: sort strictly by post time instead of the
    /// interruption-reset ranking time.
    sort_by_post_time: bool,
}

impl RankingEngine {
    pub fn new(sort_by_post_time: bool) -> Self {
        Self { sort_by_post_time }
    }

    /// Rank the live set. `records` must be handed over in the previous
    /// ranked order (new records appended last) so that full-tuple ties keep
    /// their prior relative position; the sort is stable.
    pub fn rank(
        &self,
        records: &mut [&mut NotificationRecord],
        policy: &dyn PolicyProvider,
        snapshot: &PolicySnapshot,
    ) -> Vec<RecordKey> {
        // Derived-field pass first: channel importance override, intercept
        // decision, sort key. All derived from the same snapshot. The
        // effective importance is recomputed from the requested baseline so a
        // lifted override stops applying on the next pass.
        for record in records.iter_mut() {
            let override_key = format!("{}:{}", record.key.package, record.channel_id);
            record.importance = snapshot
                .channel_importance
                .get(&override_key)
                .copied()
                .unwrap_or(record.requested_importance);
            record.is_intercepted = policy.should_intercept(record, snapshot);
            record.sort_key = Some(format!(
                "score={:.3} imp={} int={}",
                record.rank_score, record.importance, record.is_intercepted as u8
            ));
        }

        let by_post_time = self.sort_by_post_time;
        records.sort_by(|a, b| Self::compare(a, b, by_post_time));
        records.iter().map(|r| r.key.clone()).collect()
    }

    fn compare(
        a: &NotificationRecord,
        b: &NotificationRecord,
        by_post_time: bool,
    ) -> Ordering {
        b.rank_score
            .total_cmp(&a.rank_score)
            .then_with(|| b.importance.cmp(&a.importance))
            .then_with(|| a.is_intercepted.cmp(&b.is_intercepted))
            .then_with(|| {
                if by_post_time {
                    b.post_time.cmp(&a.post_time)
                } else {
                    b.ranking_time.cmp(&a.ranking_time)
                }
            })
            .then_with(|| a.key.cmp(&b.key))
    }
}
