// ABOUTME: Bounded ring of terminal outbound failures with partitioned replay
// ABOUTME: Replays serialize per record id through a reservation state machine

use std::collections::hash_map::DefaultHasher;
use std::collections::{HashSet, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use uuid::Uuid;

use switchboard_core::config::DeadLetterConfig;
use switchboard_core::delivery::ErrorCategory;
use switchboard_core::events::names;

use crate::outbound::{DeliveryRequest, DeliveryResult, FailureDisposition, OutboundGateway};
use crate::telemetry::Telemetry;

/// Lifecycle of a record in the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordStatus {
    Active,
    Archived,
}

/// Replay progress for one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplayStatus {
    Never,
    Running,
    Succeeded,
    Failed,
}

#[derive(Debug, Clone)]
pub struct ReplayState {
    pub status: ReplayStatus,
    pub attempts: u32,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_outcome: Option<String>,
}

impl Default for ReplayState {
    fn default() -> Self {
        Self { status: ReplayStatus::Never, attempts: 0, last_attempt_at: None, last_outcome: None }
    }
}

/// A captured terminal outbound failure, preserved for inspection or replay.
#[derive(Debug, Clone)]
pub struct DeadLetterRecord {
    pub id: String,
    pub status: RecordStatus,
    pub category: ErrorCategory,
    pub disposition: FailureDisposition,
    pub reason: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub partition: usize,
    pub request: DeliveryRequest,
    pub diagnostics: serde_json::Value,
    pub replay: ReplayState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// What the outbound gateway hands over when a job dies.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub category: ErrorCategory,
    pub disposition: FailureDisposition,
    pub reason: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub partition: usize,
    pub request: DeliveryRequest,
    pub diagnostics: serde_json::Value,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ReplayOpts {
    /// Replay even a record that already succeeded.
    pub force: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReplayError {
    #[error("record not found")]
    NotFound,
    #[error("replay already running")]
    AlreadyRunning,
    #[error("replay already succeeded")]
    AlreadySucceeded,
    #[error("replay cancelled")]
    Cancelled,
    #[error("replay workers unavailable")]
    WorkerUnavailable,
}

struct ReplayJob {
    record_id: String,
    force: bool,
    respond: oneshot::Sender<Result<DeliveryResult, ReplayError>>,
}

struct Ring {
    records: VecDeque<DeadLetterRecord>,
    cancel_requested: HashSet<String>,
}

/// Bounded FIFO store of dead letters plus the replay worker pool.
pub struct DeadLetterStore {
    config: DeadLetterConfig,
    ring: Mutex<Ring>,
    replay_txs: Mutex<Vec<mpsc::UnboundedSender<ReplayJob>>>,
    telemetry: Telemetry,
}

impl DeadLetterStore {
    pub fn new(config: DeadLetterConfig, telemetry: Telemetry) -> Arc<Self> {
        Arc::new(Self {
            config,
            ring: Mutex::new(Ring { records: VecDeque::new(), cancel_requested: HashSet::new() }),
            replay_txs: Mutex::new(Vec::new()),
            telemetry,
        })
    }

    /// Capture a failure. Oldest records are evicted FIFO at capacity.
    pub async fn capture(&self, capture: CaptureRequest) -> String {
        let now = Utc::now();
        let record = DeadLetterRecord {
            id: Uuid::new_v4().to_string(),
            status: RecordStatus::Active,
            category: capture.category,
            disposition: capture.disposition,
            reason: capture.reason,
            attempt: capture.attempt,
            max_attempts: capture.max_attempts,
            partition: capture.partition,
            request: capture.request,
            diagnostics: capture.diagnostics,
            replay: ReplayState::default(),
            created_at: now,
            updated_at: now,
        };
        let id = record.id.clone();
        {
            let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
            if ring.records.len() >= self.config.capacity.max(1) {
                ring.records.pop_front();
            }
            ring.records.push_back(record);
        }
        self.telemetry.emit_correlated(
            names::DEAD_LETTER_CAPTURED,
            None,
            &id,
            serde_json::json!({"partition": capture.partition, "category": format!("{:?}", capture.category).to_lowercase()}),
        );
        id
    }

    pub fn list(&self) -> Vec<DeadLetterRecord> {
        self.ring
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .records
            .iter()
            .cloned()
            .collect()
    }

    pub fn get(&self, record_id: &str) -> Option<DeadLetterRecord> {
        self.ring
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .records
            .iter()
            .find(|r| r.id == record_id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.ring.lock().unwrap_or_else(|p| p.into_inner()).records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Mark a record archived; archived records survive until purged or
    /// evicted.
    pub fn archive(&self, record_id: &str) -> bool {
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        match ring.records.iter_mut().find(|r| r.id == record_id) {
            Some(record) => {
                record.status = RecordStatus::Archived;
                record.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// Remove records matching `status` older than `older_than`. Returns
    /// the number removed.
    pub fn purge(&self, status: RecordStatus, older_than: Duration) -> usize {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(older_than).unwrap_or_else(|_| chrono::Duration::zero());
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        let before = ring.records.len();
        ring.records.retain(|r| !(r.status == status && r.created_at < cutoff));
        before - ring.records.len()
    }

    /// Request cancellation of a reserved-but-not-dispatched replay.
    pub fn cancel_replay(&self, record_id: &str) {
        let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
        ring.cancel_requested.insert(record_id.to_string());
    }

    /// Start the replay worker pool. Replays of a given record id always
    /// land on the same worker, serializing them.
    pub fn start_replay_workers(self: &Arc<Self>, gateway: Arc<OutboundGateway>) {
        let mut txs = self.replay_txs.lock().unwrap_or_else(|p| p.into_inner());
        if !txs.is_empty() {
            return;
        }
        for _ in 0..self.config.replay_partitions.max(1) {
            let (tx, mut rx) = mpsc::unbounded_channel::<ReplayJob>();
            let store = Arc::clone(self);
            let gateway = Arc::clone(&gateway);
            tokio::spawn(async move {
                while let Some(job) = rx.recv().await {
                    let outcome = store.run_replay(&gateway, &job.record_id, job.force).await;
                    let _ = job.respond.send(outcome);
                }
            });
            txs.push(tx);
        }
    }

    /// Replay a record through the outbound gateway. Waits for the final
    /// delivery outcome.
    pub async fn replay(
        &self,
        record_id: &str,
        opts: ReplayOpts,
    ) -> Result<DeliveryResult, ReplayError> {
        let tx = {
            let txs = self.replay_txs.lock().unwrap_or_else(|p| p.into_inner());
            if txs.is_empty() {
                return Err(ReplayError::WorkerUnavailable);
            }
            let mut hasher = DefaultHasher::new();
            record_id.hash(&mut hasher);
            txs[(hasher.finish() as usize) % txs.len()].clone()
        };
        let (respond, rx) = oneshot::channel();
        tx.send(ReplayJob { record_id: record_id.to_string(), force: opts.force, respond })
            .map_err(|_| ReplayError::WorkerUnavailable)?;
        rx.await.map_err(|_| ReplayError::WorkerUnavailable)?
    }

    /// Reserve, dispatch, record. The reservation rejects concurrent or
    /// already-successful replays unless forced.
    async fn run_replay(
        &self,
        gateway: &OutboundGateway,
        record_id: &str,
        force: bool,
    ) -> Result<DeliveryResult, ReplayError> {
        let request = {
            let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
            let record = ring
                .records
                .iter_mut()
                .find(|r| r.id == record_id)
                .ok_or(ReplayError::NotFound)?;
            match record.replay.status {
                ReplayStatus::Running => return Err(ReplayError::AlreadyRunning),
                ReplayStatus::Succeeded if !force => return Err(ReplayError::AlreadySucceeded),
                _ => {}
            }
            record.replay.status = ReplayStatus::Running;
            record.replay.attempts += 1;
            record.replay.last_attempt_at = Some(Utc::now());
            record.updated_at = Utc::now();
            record.request.clone()
        };

        self.telemetry.emit_correlated(
            names::DEAD_LETTER_REPLAY_ATTEMPT,
            None,
            record_id,
            serde_json::json!({"message_id": request.message_id}),
        );

        // Cancellation window between reservation and dispatch
        let cancelled = {
            let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
            ring.cancel_requested.remove(record_id)
        };
        if cancelled {
            self.finish_replay(record_id, ReplayStatus::Failed, "cancelled");
            return Err(ReplayError::Cancelled);
        }

        let result = gateway.enqueue(request).await;
        match &result {
            Ok(response) => {
                self.finish_replay(
                    record_id,
                    ReplayStatus::Succeeded,
                    &format!("delivered:{}", response.message_id),
                );
            }
            Err(error) => {
                self.finish_replay(record_id, ReplayStatus::Failed, &error.reason.describe());
            }
        }
        Ok(result)
    }

    fn finish_replay(&self, record_id: &str, status: ReplayStatus, outcome: &str) {
        {
            let mut ring = self.ring.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(record) = ring.records.iter_mut().find(|r| r.id == record_id) {
                record.replay.status = status;
                record.replay.last_outcome = Some(outcome.to_string());
                record.updated_at = Utc::now();
            }
        }
        self.telemetry.emit_correlated(
            names::DEAD_LETTER_REPLAY_OUTCOME,
            None,
            record_id,
            serde_json::json!({"status": format!("{status:?}").to_lowercase(), "outcome": outcome}),
        );
    }
}
