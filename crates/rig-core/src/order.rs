use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::warn;

use crate::error::OrderError;

/// One append to the entry or promotion record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderRecord {
    pub session_id: u64,
    /// Monotonic offset from the tracker epoch.
    pub offset_ms: u64,
    /// Wall-clock time (epoch ms), used to merge records across processes.
    pub at_ms: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SeverityClass {
    Minor,
    Moderate,
    Severe,
}

impl SeverityClass {
    pub fn of(severity: u64) -> Self {
        match severity {
            0 | 1 => SeverityClass::Minor,
            2 | 3 => SeverityClass::Moderate,
            _ => SeverityClass::Severe,
        }
    }
}

/// A promotion observed at a different position than its entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub session_id: u64,
    pub expected_position: u64,
    pub actual_position: u64,
    pub severity: u64,
    pub class: SeverityClass,
}

impl Violation {
    fn new(session_id: u64, expected_position: u64, actual_position: u64) -> Self {
        let severity = expected_position.abs_diff(actual_position);
        Self {
            session_id,
            expected_position,
            actual_position,
            severity,
            class: SeverityClass::of(severity),
        }
    }
}

/// Result of appending a promotion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromotionCheck {
    pub actual_position: u64,
    pub violation: Option<Violation>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderSnapshot {
    pub entries: Vec<OrderRecord>,
    pub promotions: Vec<OrderRecord>,
    pub violations: Vec<Violation>,
}

impl OrderSnapshot {
    pub fn entry_order(&self) -> Vec<u64> {
        self.entries.iter().map(|r| r.session_id).collect()
    }

    pub fn promotion_order(&self) -> Vec<u64> {
        self.promotions.iter().map(|r| r.session_id).collect()
    }

    /// Promotions so far form a prefix of the entry order.
    pub fn order_maintained(&self) -> bool {
        self.promotions
            .iter()
            .zip(self.entries.iter())
            .all(|(p, e)| p.session_id == e.session_id)
            && self.promotions.len() <= self.entries.len()
    }
}

#[derive(Debug, Default)]
struct OrderState {
    entries: Vec<OrderRecord>,
    /// session id -> 1-based entry position
    entry_positions: HashMap<u64, u64>,
    promotions: Vec<OrderRecord>,
    promoted: HashMap<u64, u64>,
    violations: Vec<Violation>,
}

/// Owns the entry and promotion records and the violation list. Every
/// mutation happens inside one critical section.
#[derive(Debug)]
pub struct OrderTracker {
    epoch: Instant,
    state: Mutex<OrderState>,
}

impl Default for OrderTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl OrderTracker {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
            state: Mutex::new(OrderState::default()),
        }
    }

    fn stamp(&self, session_id: u64, at: Instant) -> OrderRecord {
        OrderRecord {
            session_id,
            offset_ms: at.saturating_duration_since(self.epoch).as_millis() as u64,
            at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }

    /// Appends an entry and returns its 1-based position.
    pub async fn record_entry(&self, session_id: u64) -> Result<u64, OrderError> {
        let mut state = self.state.lock().await;
        let record = self.stamp(session_id, Instant::now());
        Self::append_entry(&mut state, record)
    }

    fn append_entry(state: &mut OrderState, record: OrderRecord) -> Result<u64, OrderError> {
        if state.entry_positions.contains_key(&record.session_id) {
            return Err(OrderError::DuplicateEntry(record.session_id));
        }
        let position = state.entries.len() as u64 + 1;
        state.entry_positions.insert(record.session_id, position);
        state.entries.push(record);
        Ok(position)
    }

    /// Appends a promotion and checks it against the entry position.
    pub async fn record_promotion(&self, session_id: u64) -> Result<PromotionCheck, OrderError> {
        let mut state = self.state.lock().await;
        let record = self.stamp(session_id, Instant::now());
        let check = Self::append_promotion(&mut state, record)?;
        if let Some(v) = &check.violation {
            warn!(
                session_id,
                expected = v.expected_position,
                actual = v.actual_position,
                severity = v.severity,
                "order violation"
            );
        }
        Ok(check)
    }

    fn append_promotion(
        state: &mut OrderState,
        record: OrderRecord,
    ) -> Result<PromotionCheck, OrderError> {
        let session_id = record.session_id;
        let expected = *state
            .entry_positions
            .get(&session_id)
            .ok_or(OrderError::NotEntered(session_id))?;
        if state.promoted.contains_key(&session_id) {
            return Err(OrderError::DuplicatePromotion(session_id));
        }

        state.promotions.push(record);
        let actual = state.promotions.len() as u64;
        state.promoted.insert(session_id, actual);

        let violation = (expected != actual).then(|| Violation::new(session_id, expected, actual));
        if let Some(v) = &violation {
            state.violations.push(v.clone());
        }
        Ok(PromotionCheck {
            actual_position: actual,
            violation,
        })
    }

    pub async fn snapshot(&self) -> OrderSnapshot {
        let state = self.state.lock().await;
        OrderSnapshot {
            entries: state.entries.clone(),
            promotions: state.promotions.clone(),
            violations: state.violations.clone(),
        }
    }

    pub async fn counts(&self) -> (usize, usize) {
        let state = self.state.lock().await;
        (state.entries.len(), state.promotions.len())
    }

    /// Rebuilds a tracker from records gathered by several processes.
    /// Records are ordered by wall-clock time (ties keep input order) and the
    /// same incremental check is replayed over them. Records that break the
    /// tracker's invariants are skipped and returned separately.
    pub fn replay(
        mut entries: Vec<OrderRecord>,
        mut promotions: Vec<OrderRecord>,
    ) -> (OrderSnapshot, Vec<OrderError>) {
        entries.sort_by_key(|r| r.at_ms);
        promotions.sort_by_key(|r| r.at_ms);

        let mut state = OrderState::default();
        let mut rejected = Vec::new();
        for record in entries {
            if let Err(e) = Self::append_entry(&mut state, record) {
                rejected.push(e);
            }
        }
        for record in promotions {
            if let Err(e) = Self::append_promotion(&mut state, record) {
                rejected.push(e);
            }
        }

        (
            OrderSnapshot {
                entries: state.entries,
                promotions: state.promotions,
                violations: state.violations,
            },
            rejected,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_out_of_order_promotions_yield_violations() {
        let tracker = OrderTracker::new();
        for id in [1, 2, 3] {
            tracker.record_entry(id).await.unwrap();
        }

        let c3 = tracker.record_promotion(3).await.unwrap();
        let c1 = tracker.record_promotion(1).await.unwrap();
        let c2 = tracker.record_promotion(2).await.unwrap();

        assert_eq!(c3.violation, Some(Violation::new(3, 3, 1)));
        assert_eq!(c3.violation.as_ref().unwrap().severity, 2);
        assert_eq!(c1.violation, Some(Violation::new(1, 1, 2)));
        assert_eq!(c1.violation.as_ref().unwrap().severity, 1);
        assert_eq!(c2.violation, Some(Violation::new(2, 2, 3)));
        assert_eq!(c2.violation.as_ref().unwrap().severity, 1);

        let snapshot = tracker.snapshot().await;
        assert_eq!(snapshot.violations.len(), 3);
        assert_eq!(snapshot.entry_order(), vec![1, 2, 3]);
        assert_eq!(snapshot.promotion_order(), vec![3, 1, 2]);
        assert!(!snapshot.order_maintained());
    }

    #[tokio::test]
    async fn test_identity_permutation_has_no_violations() {
        let tracker = OrderTracker::new();
        for id in 1..=50 {
            tracker.record_entry(id).await.unwrap();
        }
        for id in 1..=50 {
            let check = tracker.record_promotion(id).await.unwrap();
            assert_eq!(check.actual_position, id);
            assert!(check.violation.is_none());
        }
        let snapshot = tracker.snapshot().await;
        assert!(snapshot.violations.is_empty());
        assert!(snapshot.order_maintained());
    }

    #[tokio::test]
    async fn test_rejects_promotion_without_entry_and_duplicates() {
        let tracker = OrderTracker::new();
        assert_eq!(
            tracker.record_promotion(9).await,
            Err(OrderError::NotEntered(9))
        );
        tracker.record_entry(9).await.unwrap();
        assert_eq!(tracker.record_entry(9).await, Err(OrderError::DuplicateEntry(9)));
        tracker.record_promotion(9).await.unwrap();
        assert_eq!(
            tracker.record_promotion(9).await,
            Err(OrderError::DuplicatePromotion(9))
        );
        assert_eq!(tracker.counts().await, (1, 1));
    }

    #[tokio::test]
    async fn test_concurrent_writers_keep_records_consistent() {
        let tracker = Arc::new(OrderTracker::new());
        for id in 1..=200 {
            tracker.record_entry(id).await.unwrap();
        }

        let mut handles = Vec::new();
        for id in 1..=200u64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record_promotion(id).await.unwrap()
            }));
        }
        let mut positions = Vec::new();
        for h in handles {
            positions.push(h.await.unwrap().actual_position);
        }
        positions.sort_unstable();
        assert_eq!(positions, (1..=200).collect::<Vec<_>>());

        let (entries, promotions) = tracker.counts().await;
        assert!(promotions <= entries);
        let snapshot = tracker.snapshot().await;
        for v in &snapshot.violations {
            assert_eq!(v.severity, v.expected_position.abs_diff(v.actual_position));
            assert_ne!(v.severity, 0);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_stamps_follow_append_order_across_threads() {
        let tracker = Arc::new(OrderTracker::new());

        let mut handles = Vec::new();
        for id in 1..=300u64 {
            let tracker = tracker.clone();
            handles.push(tokio::spawn(async move {
                tracker.record_entry(id).await.unwrap();
                tokio::task::yield_now().await;
                tracker.record_promotion(id).await.unwrap();
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        let live = tracker.snapshot().await;
        for records in [&live.entries, &live.promotions] {
            assert!(records.windows(2).all(|w| w[0].at_ms <= w[1].at_ms));
            assert!(records.windows(2).all(|w| w[0].offset_ms <= w[1].offset_ms));
        }

        // a merge of this single worker must report what the live run reported
        let (replayed, rejected) =
            OrderTracker::replay(live.entries.clone(), live.promotions.clone());
        assert!(rejected.is_empty());
        assert_eq!(replayed.entry_order(), live.entry_order());
        assert_eq!(replayed.promotion_order(), live.promotion_order());
        assert_eq!(replayed.violations, live.violations);
    }

    #[test]
    fn test_severity_classes() {
        assert_eq!(SeverityClass::of(1), SeverityClass::Minor);
        assert_eq!(SeverityClass::of(3), SeverityClass::Moderate);
        assert_eq!(SeverityClass::of(4), SeverityClass::Severe);
    }

    #[test]
    fn test_replay_merges_by_wall_clock() {
        let rec = |session_id, at_ms| OrderRecord {
            session_id,
            offset_ms: 0,
            at_ms,
        };
        // two workers: worker A entered 1 and 3, worker B entered 2
        let entries = vec![rec(1, 100), rec(3, 300), rec(2, 200)];
        let promotions = vec![rec(2, 1_000), rec(1, 1_100), rec(3, 1_200), rec(4, 1_300)];

        let (snapshot, rejected) = OrderTracker::replay(entries, promotions);
        assert_eq!(snapshot.entry_order(), vec![1, 2, 3]);
        assert_eq!(snapshot.promotion_order(), vec![2, 1, 3]);
        assert_eq!(snapshot.violations.len(), 2);
        assert_eq!(rejected, vec![OrderError::NotEntered(4)]);
    }
}
