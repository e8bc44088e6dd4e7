//! Aspen Ledger - append-only audit log of task executions.
//!
//! Every task that reaches a terminal state leaves exactly one record here.
//! Records carry monotonically increasing, gapless sequence numbers and are
//! never mutated or deleted; there is no update operation in the public
//! contract. A failed append is fatal to the kernel rather than retried
//! silently, because an unaudited state transition breaks the audit chain.

#![deny(unsafe_code)]

use aspen_types::{AgentId, MissionId, TaskId};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

// ── Records ──────────────────────────────────────────────────────────

/// Terminal outcome recorded for one task execution
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum RecordedOutcome {
    Succeeded,
    Failed { reason: String },
    Cancelled { reason: String },
}

impl RecordedOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, RecordedOutcome::Succeeded)
    }
}

/// One immutable entry in the audit ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Monotone, gapless position in the ledger; starts at 1
    pub sequence_no: u64,
    pub task_id: TaskId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mission_id: Option<MissionId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<AgentId>,
    /// Payload as it entered the agent
    pub input_snapshot: Value,
    /// Output as it left the agent; partial output on failure when available
    pub output_snapshot: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: RecordedOutcome,
}

/// Everything an append supplies; the store assigns the sequence number
#[derive(Clone, Debug)]
pub struct RecordDraft {
    pub task_id: TaskId,
    pub mission_id: Option<MissionId>,
    pub agent_id: Option<AgentId>,
    pub input_snapshot: Value,
    pub output_snapshot: Value,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: RecordedOutcome,
}

/// Filter for ledger queries; unset fields match everything
#[derive(Clone, Debug, Default)]
pub struct LedgerFilter {
    pub mission_id: Option<MissionId>,
    pub task_id: Option<TaskId>,
    pub agent_id: Option<AgentId>,
}

impl LedgerFilter {
    pub fn for_mission(mission_id: MissionId) -> Self {
        Self {
            mission_id: Some(mission_id),
            ..Self::default()
        }
    }

    pub fn for_task(task_id: TaskId) -> Self {
        Self {
            task_id: Some(task_id),
            ..Self::default()
        }
    }

    pub fn for_agent(agent_id: AgentId) -> Self {
        Self {
            agent_id: Some(agent_id),
            ..Self::default()
        }
    }

    fn matches(&self, record: &LedgerRecord) -> bool {
        if let Some(ref mission) = self.mission_id {
            if record.mission_id.as_ref() != Some(mission) {
                return false;
            }
        }
        if let Some(ref task) = self.task_id {
            if &record.task_id != task {
                return false;
            }
        }
        if let Some(ref agent) = self.agent_id {
            if record.agent_id.as_ref() != Some(agent) {
                return false;
            }
        }
        true
    }
}

// ── Store seam ───────────────────────────────────────────────────────

/// Persistence seam for ledger backends.
///
/// Implementations must make `append` durable before returning and must
/// assign sequence numbers from a single linearization point so the
/// gapless guarantee holds.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Append a record; returns it with its assigned sequence number
    async fn append(&self, draft: RecordDraft) -> Result<LedgerRecord, LedgerError>;

    /// All records in sequence order
    async fn records(&self) -> Result<Vec<LedgerRecord>, LedgerError>;
}

/// In-memory reference store. A single mutex is the linearization point
/// for sequence assignment.
#[derive(Default)]
pub struct InMemoryLedger {
    records: Mutex<Vec<LedgerRecord>>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LedgerStore for InMemoryLedger {
    async fn append(&self, draft: RecordDraft) -> Result<LedgerRecord, LedgerError> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| LedgerError::WriteFailed("ledger mutex poisoned".to_string()))?;

        let record = LedgerRecord {
            sequence_no: records.len() as u64 + 1,
            task_id: draft.task_id,
            mission_id: draft.mission_id,
            agent_id: draft.agent_id,
            input_snapshot: draft.input_snapshot,
            output_snapshot: draft.output_snapshot,
            started_at: draft.started_at,
            ended_at: draft.ended_at,
            outcome: draft.outcome,
        };
        records.push(record.clone());
        Ok(record)
    }

    async fn records(&self) -> Result<Vec<LedgerRecord>, LedgerError> {
        let records = self
            .records
            .lock()
            .map_err(|_| LedgerError::ReadFailed("ledger mutex poisoned".to_string()))?;
        Ok(records.clone())
    }
}

// ── Facade ───────────────────────────────────────────────────────────

/// The execution ledger facade the kernel writes through.
///
/// Wraps a [`LedgerStore`] so the audit surface stays the same whichever
/// backend holds the records.
#[derive(Clone)]
pub struct ExecutionLedger {
    store: Arc<dyn LedgerStore>,
}

impl ExecutionLedger {
    /// Create a ledger backed by the in-memory store
    pub fn in_memory() -> Self {
        Self {
            store: Arc::new(InMemoryLedger::new()),
        }
    }

    /// Create a ledger backed by an explicit store
    pub fn with_store(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Append a record; durable before this returns.
    ///
    /// A `WriteFailed` from here must halt dispatch; the caller never
    /// swallows it.
    pub async fn append(&self, draft: RecordDraft) -> Result<u64, LedgerError> {
        let record = self.store.append(draft).await?;
        tracing::debug!(
            sequence_no = record.sequence_no,
            task_id = %record.task_id,
            outcome = ?record.outcome,
            "Ledger record appended"
        );
        Ok(record.sequence_no)
    }

    /// Records matching the filter, in sequence order
    pub async fn query(&self, filter: LedgerFilter) -> Result<Vec<LedgerRecord>, LedgerError> {
        let records = self.store.records().await?;
        Ok(records
            .into_iter()
            .filter(|record| filter.matches(record))
            .collect())
    }

    /// Records with `sequence_no >= from`, for restartable consumers
    pub async fn records_from(&self, from: u64) -> Result<Vec<LedgerRecord>, LedgerError> {
        let records = self.store.records().await?;
        Ok(records
            .into_iter()
            .filter(|record| record.sequence_no >= from)
            .collect())
    }

    /// Aggregate statistics over recorded outcomes
    pub async fn statistics(&self) -> Result<LedgerStatistics, LedgerError> {
        let records = self.store.records().await?;

        let total_records = records.len();
        let mut by_outcome: HashMap<String, usize> = HashMap::new();
        let mut successful = 0;
        let mut failed = 0;

        for record in records {
            let key = match &record.outcome {
                RecordedOutcome::Succeeded => "succeeded",
                RecordedOutcome::Failed { .. } => "failed",
                RecordedOutcome::Cancelled { .. } => "cancelled",
            };
            *by_outcome.entry(key.to_string()).or_insert(0) += 1;

            if record.outcome.is_success() {
                successful += 1;
            } else {
                failed += 1;
            }
        }

        Ok(LedgerStatistics {
            total_records,
            by_outcome,
            successful,
            failed,
        })
    }
}

/// Statistics about the ledger
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerStatistics {
    pub total_records: usize,
    pub by_outcome: HashMap<String, usize>,
    pub successful: usize,
    pub failed: usize,
}

// ── Errors ───────────────────────────────────────────────────────────

/// Ledger-related errors
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The underlying store could not persist the record. Fatal to the
    /// kernel: dispatch must halt rather than continue unaudited.
    #[error("ledger write failed: {0}")]
    WriteFailed(String),

    #[error("ledger read failed: {0}")]
    ReadFailed(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn draft(task: &str, outcome: RecordedOutcome) -> RecordDraft {
        let now = Utc::now();
        RecordDraft {
            task_id: TaskId::new(task),
            mission_id: None,
            agent_id: Some(AgentId::new("agent-1")),
            input_snapshot: serde_json::json!({"task": task}),
            output_snapshot: Value::Null,
            started_at: now,
            ended_at: now,
            outcome,
        }
    }

    #[tokio::test]
    async fn appends_are_sequenced_from_one() {
        let ledger = ExecutionLedger::in_memory();

        let first = ledger
            .append(draft("t-1", RecordedOutcome::Succeeded))
            .await
            .unwrap();
        let second = ledger
            .append(draft(
                "t-2",
                RecordedOutcome::Failed {
                    reason: "boom".to_string(),
                },
            ))
            .await
            .unwrap();

        assert_eq!(first, 1);
        assert_eq!(second, 2);
    }

    #[tokio::test]
    async fn query_filters_by_task_and_agent() {
        let ledger = ExecutionLedger::in_memory();
        ledger
            .append(draft("t-1", RecordedOutcome::Succeeded))
            .await
            .unwrap();
        ledger
            .append(draft("t-2", RecordedOutcome::Succeeded))
            .await
            .unwrap();

        let by_task = ledger
            .query(LedgerFilter::for_task(TaskId::new("t-2")))
            .await
            .unwrap();
        assert_eq!(by_task.len(), 1);
        assert_eq!(by_task[0].sequence_no, 2);

        let by_agent = ledger
            .query(LedgerFilter::for_agent(AgentId::new("agent-1")))
            .await
            .unwrap();
        assert_eq!(by_agent.len(), 2);

        let by_other = ledger
            .query(LedgerFilter::for_agent(AgentId::new("nobody")))
            .await
            .unwrap();
        assert!(by_other.is_empty());
    }

    #[tokio::test]
    async fn query_by_mission_groups_records() {
        let ledger = ExecutionLedger::in_memory();
        let mission = MissionId::new("m-1");

        let mut with_mission = draft("t-1", RecordedOutcome::Succeeded);
        with_mission.mission_id = Some(mission.clone());
        ledger.append(with_mission).await.unwrap();
        ledger
            .append(draft("t-2", RecordedOutcome::Succeeded))
            .await
            .unwrap();

        let records = ledger
            .query(LedgerFilter::for_mission(mission))
            .await
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].task_id, TaskId::new("t-1"));
    }

    #[tokio::test]
    async fn records_from_supports_restartable_reads() {
        let ledger = ExecutionLedger::in_memory();
        for i in 0..5 {
            ledger
                .append(draft(&format!("t-{i}"), RecordedOutcome::Succeeded))
                .await
                .unwrap();
        }

        let tail = ledger.records_from(4).await.unwrap();
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0].sequence_no, 4);
        assert_eq!(tail[1].sequence_no, 5);
    }

    #[tokio::test]
    async fn statistics_aggregate_outcomes() {
        let ledger = ExecutionLedger::in_memory();
        ledger
            .append(draft("t-1", RecordedOutcome::Succeeded))
            .await
            .unwrap();
        ledger
            .append(draft(
                "t-2",
                RecordedOutcome::Cancelled {
                    reason: "caller".to_string(),
                },
            ))
            .await
            .unwrap();

        let stats = ledger.statistics().await.unwrap();
        assert_eq!(stats.total_records, 2);
        assert_eq!(stats.successful, 1);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.by_outcome.get("cancelled"), Some(&1));
    }

    proptest! {
        #[test]
        fn property_sequence_is_monotone_and_gapless(outcomes in proptest::collection::vec(any::<bool>(), 1..40)) {
            let rt = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .expect("runtime");

            rt.block_on(async move {
                let ledger = ExecutionLedger::in_memory();
                for (i, success) in outcomes.iter().enumerate() {
                    let outcome = if *success {
                        RecordedOutcome::Succeeded
                    } else {
                        RecordedOutcome::Failed { reason: "prop".to_string() }
                    };
                    let seq = ledger
                        .append(draft(&format!("t-{i}"), outcome))
                        .await
                        .expect("append");
                    assert_eq!(seq, i as u64 + 1);
                }

                let records = ledger.records_from(1).await.expect("read");
                for window in records.windows(2) {
                    assert_eq!(window[1].sequence_no, window[0].sequence_no + 1);
                }
            });
        }
    }
}
