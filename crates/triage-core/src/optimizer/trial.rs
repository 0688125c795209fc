//! Trial records, the append-only trial log and Best-So-Far tracking

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::cmp::Ordering;
use std::sync::{Arc, Mutex};
use tracing::info;

use super::instruction::FailureExemplar;
use crate::pipeline::PipelineState;

/// Resources spent evaluating one candidate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TrialCost {
    /// Primitive call attempts, retries included
    pub calls: usize,
    pub wallclock_ms: u64,
}

/// One evaluated candidate. Immutable once created.
#[derive(Debug, Clone)]
pub struct TrialRecord {
    pub index: usize,
    pub round: usize,
    pub state: Arc<PipelineState>,
    pub score: f32,
    pub batch_id: String,
    pub cost: TrialCost,
    pub recorded_at: DateTime<Utc>,
    /// Examples (or errors) that fell short of a perfect score
    pub failures: Vec<FailureExemplar>,
}

/// How equal scores are ordered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// Lower call cost wins, then the earlier trial
    #[default]
    CostThenIndex,
    /// The earlier trial wins
    IndexOnly,
}

impl TieBreak {
    /// Whether `candidate` should replace `current`
    pub fn prefers(&self, candidate: &TrialRecord, current: &TrialRecord) -> bool {
        match candidate.score.partial_cmp(&current.score) {
            Some(Ordering::Greater) => true,
            Some(Ordering::Less) | None => false,
            Some(Ordering::Equal) => {
                let by_cost = match self {
                    TieBreak::CostThenIndex => candidate.cost.calls.cmp(&current.cost.calls),
                    TieBreak::IndexOnly => Ordering::Equal,
                };
                by_cost.then(candidate.index.cmp(&current.index)) == Ordering::Less
            }
        }
    }
}

/// Append-only record of every trial in a run
#[derive(Debug, Default)]
pub struct TrialLog {
    records: Mutex<Vec<Arc<TrialRecord>>>,
}

impl TrialLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: Arc<TrialRecord>) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        records.push(record);
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<Arc<TrialRecord>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn round(&self, round: usize) -> Vec<Arc<TrialRecord>> {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|r| r.round == round)
            .cloned()
            .collect()
    }
}

/// Best-So-Far after a trial was offered
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct BestPoint {
    pub after_trial: usize,
    pub best_trial: usize,
    pub best_score: f32,
}

#[derive(Debug, Default)]
struct BestInner {
    best: Option<Arc<TrialRecord>>,
    history: Vec<BestPoint>,
}

/// The highest-scoring trial seen, updated under a lock
#[derive(Debug, Default)]
pub struct BestSoFar {
    tie_break: TieBreak,
    inner: Mutex<BestInner>,
}

impl BestSoFar {
    pub fn new(tie_break: TieBreak) -> Self {
        Self {
            tie_break,
            inner: Mutex::default(),
        }
    }

    /// Compare `record` against the current best and replace it if preferred.
    ///
    /// Returns true when the best changed.
    pub fn offer(&self, record: &Arc<TrialRecord>) -> bool {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let replace = match &inner.best {
            None => true,
            Some(current) => self.tie_break.prefers(record, current),
        };
        if replace {
            if let Some(previous) = &inner.best {
                info!(
                    "New best: trial {} score {:.4} (was trial {} at {:.4})",
                    record.index, record.score, previous.index, previous.score
                );
            }
            inner.best = Some(Arc::clone(record));
        }
        let best = inner.best.as_ref().map(|b| (b.index, b.score));
        if let Some((best_trial, best_score)) = best {
            inner.history.push(BestPoint {
                after_trial: record.index,
                best_trial,
                best_score,
            });
        }
        replace
    }

    pub fn get(&self) -> Option<Arc<TrialRecord>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).best.clone()
    }

    pub fn score(&self) -> Option<f32> {
        self.get().map(|b| b.score)
    }

    pub fn history(&self) -> Vec<BestPoint> {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .history
            .clone()
    }
}

/// Serializable view of a trial for log export
#[derive(Debug, Serialize)]
pub struct TrialLogEntry<'a> {
    pub index: usize,
    pub round: usize,
    pub score: f32,
    pub batch_id: &'a str,
    pub cost: TrialCost,
    pub recorded_at: DateTime<Utc>,
    pub state: &'a PipelineState,
    pub failures: &'a [FailureExemplar],
}

impl<'a> From<&'a TrialRecord> for TrialLogEntry<'a> {
    fn from(record: &'a TrialRecord) -> Self {
        Self {
            index: record.index,
            round: record.round,
            score: record.score,
            batch_id: &record.batch_id,
            cost: record.cost,
            recorded_at: record.recorded_at,
            state: &record.state,
            failures: &record.failures,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(index: usize, score: f32, calls: usize) -> Arc<TrialRecord> {
        Arc::new(TrialRecord {
            index,
            round: 0,
            state: Arc::new(PipelineState::default_support()),
            score,
            batch_id: "validation:42".into(),
            cost: TrialCost {
                calls,
                wallclock_ms: 10,
            },
            recorded_at: Utc::now(),
            failures: Vec::new(),
        })
    }

    #[test]
    fn test_higher_score_wins() {
        let best = BestSoFar::new(TieBreak::default());
        assert!(best.offer(&record(0, 0.5, 10)));
        assert!(best.offer(&record(1, 0.7, 50)));
        assert!(!best.offer(&record(2, 0.6, 1)));
        assert_eq!(best.get().unwrap().index, 1);
    }

    #[test]
    fn test_tie_broken_by_cost_then_index() {
        let best = BestSoFar::new(TieBreak::CostThenIndex);
        best.offer(&record(0, 0.5, 10));
        assert!(best.offer(&record(1, 0.5, 8)));
        assert!(!best.offer(&record(2, 0.5, 8)));
        assert_eq!(best.get().unwrap().index, 1);
    }

    #[test]
    fn test_index_only_tie_break() {
        let best = BestSoFar::new(TieBreak::IndexOnly);
        best.offer(&record(0, 0.5, 10));
        assert!(!best.offer(&record(1, 0.5, 1)));
        assert_eq!(best.get().unwrap().index, 0);
    }

    #[test]
    fn test_nan_never_wins() {
        let best = BestSoFar::new(TieBreak::default());
        best.offer(&record(0, 0.1, 10));
        assert!(!best.offer(&record(1, f32::NAN, 1)));
    }

    #[test]
    fn test_history_is_monotonic() {
        let best = BestSoFar::new(TieBreak::default());
        for (i, score) in [0.3, 0.1, 0.6, 0.2, 0.6, 0.9].into_iter().enumerate() {
            best.offer(&record(i, score, 5));
        }
        let history = best.history();
        assert_eq!(history.len(), 6);
        assert!(history.windows(2).all(|w| w[1].best_score >= w[0].best_score));
        assert_eq!(history.last().unwrap().best_trial, 5);
    }

    #[test]
    fn test_log_appends() {
        let log = TrialLog::new();
        log.append(record(0, 0.1, 1));
        log.append(record(1, 0.2, 1));
        assert_eq!(log.len(), 2);
        assert_eq!(log.snapshot()[1].index, 1);
        assert_eq!(log.round(0).len(), 2);
    }
}
