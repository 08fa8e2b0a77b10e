// ABOUTME: Concurrent state coordination layered on StateManager
// ABOUTME: Optimistic version checks, conflict resolution, checkpoint/restore, bounded history

use crate::error::StateError;
use crate::manager::StateManager;
use crate::update::StateUpdate;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cap on retained update-history entries per workflow; older entries are
/// dropped as new ones arrive rather than growing without bound.
const MAX_HISTORY_PER_WORKFLOW: usize = 200;

#[derive(Debug, Clone)]
pub struct StateVersion {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    pub updated_by: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictStrategy {
    Merge,
    Overwrite,
    Reject,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    LastWriterWins,
    FirstWriterWins,
}

#[derive(Debug, Clone)]
pub struct ConflictResolution {
    pub strategy: ConflictStrategy,
    pub merge_policy: MergePolicy,
    pub timeout_seconds: u64,
    pub max_retries: u32,
}

impl Default for ConflictResolution {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::Merge,
            merge_policy: MergePolicy::LastWriterWins,
            timeout_seconds: 30,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Clone)]
pub struct BatchUpdate {
    pub updates: Vec<StateUpdate>,
    pub agent_id: Option<String>,
    pub expected_version: Option<u64>,
    pub timeout_seconds: u64,
}

impl BatchUpdate {
    pub fn new(updates: Vec<StateUpdate>) -> Self {
        Self {
            updates,
            agent_id: None,
            expected_version: None,
            timeout_seconds: 10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct UpdateResult {
    pub new_version: u64,
    pub updated_at: DateTime<Utc>,
    pub state: Value,
}

#[derive(Debug, Clone)]
struct HistoryEntry {
    timestamp: DateTime<Utc>,
    agent_id: String,
    paths: Vec<String>,
}

/// Internal accumulator backing [`ConcurrencyStats`]; keeps the running
/// total update time so the average can be recomputed on each poll rather
/// than maintained as a moving average.
#[derive(Debug, Clone, Default)]
struct StatsAccumulator {
    total_updates: u64,
    conflicts_detected: u64,
    conflicts_resolved: u64,
    total_update_time: Duration,
}

/// Update statistics exposed read-only for the monitoring collector to poll.
#[derive(Debug, Clone, Default)]
pub struct ConcurrencyStats {
    pub total_updates: u64,
    pub conflicts_detected: u64,
    pub conflicts_resolved: u64,
    pub average_update_time: Duration,
}

#[derive(Debug, Clone)]
pub struct Checkpoint {
    pub workflow_id: String,
    pub inputs: Map<String, Value>,
    pub computed: Map<String, Value>,
    pub state: Map<String, Value>,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

struct WorkflowConcurrencyState {
    version: StateVersion,
    history: VecDeque<HistoryEntry>,
    pending: Vec<BatchUpdate>,
}

impl WorkflowConcurrencyState {
    fn fresh() -> Self {
        Self {
            version: StateVersion {
                version: 1,
                updated_at: Utc::now(),
                updated_by: None,
            },
            history: VecDeque::new(),
            pending: Vec::new(),
        }
    }
}

/// Wraps a [`StateManager`] with per-workflow optimistic versioning,
/// conflict resolution between overlapping in-flight batches, checkpoint/
/// restore, and update-history bookkeeping. All of it sits above the base
/// manager's own per-workflow lock, so a single call here always observes a
/// consistent base state.
pub struct ConcurrentStateManager {
    base: Arc<StateManager>,
    concurrency: Mutex<HashMap<String, WorkflowConcurrencyState>>,
    conflict_resolution: Mutex<ConflictResolution>,
    stats: Mutex<StatsAccumulator>,
}

impl ConcurrentStateManager {
    pub fn new(base: Arc<StateManager>) -> Self {
        Self {
            base,
            concurrency: Mutex::new(HashMap::new()),
            conflict_resolution: Mutex::new(ConflictResolution::default()),
            stats: Mutex::new(StatsAccumulator::default()),
        }
    }

    pub fn configure_conflict_resolution(&self, resolution: ConflictResolution) {
        *self.conflict_resolution.lock() = resolution;
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let s = self.stats.lock();
        let average_update_time = if s.total_updates > 0 {
            s.total_update_time / s.total_updates as u32
        } else {
            Duration::ZERO
        };
        ConcurrencyStats {
            total_updates: s.total_updates,
            conflicts_detected: s.conflicts_detected,
            conflicts_resolved: s.conflicts_resolved,
            average_update_time,
        }
    }

    fn version_of(&self, workflow_id: &str) -> StateVersion {
        let mut table = self.concurrency.lock();
        table
            .entry(workflow_id.to_string())
            .or_insert_with(WorkflowConcurrencyState::fresh)
            .version
            .clone()
    }

    pub fn read(&self, workflow_id: &str, include_version: bool) -> Result<Value, StateError> {
        let mut view = self.base.read(workflow_id)?;
        if include_version {
            let version = self.version_of(workflow_id);
            if let Value::Object(map) = &mut view {
                map.insert(
                    "__version__".to_string(),
                    serde_json::json!({
                        "version": version.version,
                        "updated_at": version.updated_at,
                        "updated_by": version.updated_by,
                    }),
                );
            }
        }
        Ok(view)
    }

    /// Apply a batch under optimistic version control. Returns
    /// [`StateError::VersionConflict`] if `expected_version` doesn't match
    /// the workflow's current version, resolves any conflict against
    /// still-pending batches per the configured strategy, then delegates to
    /// the base manager and bumps the version on success.
    pub fn update(
        &self,
        workflow_id: &str,
        batch: BatchUpdate,
        global_vars: Option<&mut Map<String, Value>>,
    ) -> Result<UpdateResult, StateError> {
        if let Some(expected) = batch.expected_version {
            let current = self.version_of(workflow_id);
            if current.version != expected {
                warn!(
                    "version conflict on workflow {workflow_id}: expected {expected}, actual {}",
                    current.version
                );
                return Err(StateError::VersionConflict {
                    expected,
                    actual: current.version,
                });
            }
        }

        self.resolve_conflicts(workflow_id, &batch)?;

        let started = Instant::now();
        let state = self.base.update(workflow_id, &batch.updates, global_vars)?;
        let elapsed = started.elapsed();

        let mut table = self.concurrency.lock();
        let entry = table
            .entry(workflow_id.to_string())
            .or_insert_with(WorkflowConcurrencyState::fresh);
        entry.version = StateVersion {
            version: entry.version.version + 1,
            updated_at: Utc::now(),
            updated_by: batch.agent_id.clone(),
        };
        entry.history.push_back(HistoryEntry {
            timestamp: entry.version.updated_at,
            agent_id: batch.agent_id.clone().unwrap_or_else(|| "system".to_string()),
            paths: batch.updates.iter().map(|u| u.path.clone()).collect(),
        });
        while entry.history.len() > MAX_HISTORY_PER_WORKFLOW {
            entry.history.pop_front();
        }
        let new_version = entry.version.clone();
        drop(table);

        let mut stats = self.stats.lock();
        stats.total_updates += 1;
        stats.total_update_time += elapsed;

        Ok(UpdateResult {
            new_version: new_version.version,
            updated_at: new_version.updated_at,
            state,
        })
    }

    /// Check the new batch's paths against any batches still recorded as
    /// pending for this workflow (batches that started but have not yet
    /// completed) and apply the configured resolution strategy. Under this
    /// manager's synchronous call model a batch is only ever "pending" for
    /// the duration of its own `update` call, so in practice this only
    /// fires when a caller explicitly stages work with
    /// [`ConcurrentStateManager::stage_pending`].
    fn resolve_conflicts(&self, workflow_id: &str, batch: &BatchUpdate) -> Result<(), StateError> {
        let new_paths: HashSet<&str> = batch.updates.iter().map(|u| u.path.as_str()).collect();

        let mut table = self.concurrency.lock();
        let entry = table
            .entry(workflow_id.to_string())
            .or_insert_with(WorkflowConcurrencyState::fresh);

        let Some(conflicting_paths) = entry.pending.iter().find_map(|pending| {
            let hit: Vec<String> = pending
                .updates
                .iter()
                .map(|u| u.path.clone())
                .filter(|p| new_paths.contains(p.as_str()))
                .collect();
            (!hit.is_empty()).then_some(hit)
        }) else {
            return Ok(());
        };

        let strategy = self.conflict_resolution.lock().strategy;
        self.stats.lock().conflicts_detected += 1;

        match strategy {
            ConflictStrategy::Reject => {
                debug!("rejecting conflicting batch on workflow {workflow_id}: {conflicting_paths:?}");
                Err(StateError::ConflictRejected(conflicting_paths))
            }
            ConflictStrategy::Merge | ConflictStrategy::Overwrite => {
                entry.pending.retain(|pending| {
                    !pending
                        .updates
                        .iter()
                        .any(|u| new_paths.contains(u.path.as_str()))
                });
                self.stats.lock().conflicts_resolved += 1;
                Ok(())
            }
        }
    }

    /// Register a batch as in-flight so a concurrently-submitted batch that
    /// touches the same paths is detected as conflicting. Callers that apply
    /// updates purely through [`Self::update`] don't need this — it exists
    /// for multi-step batch pipelines that assemble a batch before applying
    /// it.
    pub fn stage_pending(&self, workflow_id: &str, batch: BatchUpdate) {
        let mut table = self.concurrency.lock();
        table
            .entry(workflow_id.to_string())
            .or_insert_with(WorkflowConcurrencyState::fresh)
            .pending
            .push(batch);
    }

    pub fn create_checkpoint(&self, workflow_id: &str) -> Result<Checkpoint, StateError> {
        let view = self.base.read(workflow_id)?;
        let version = self.version_of(workflow_id);
        Ok(Checkpoint {
            workflow_id: workflow_id.to_string(),
            inputs: view["inputs"].as_object().cloned().unwrap_or_default(),
            computed: view["computed"].as_object().cloned().unwrap_or_default(),
            state: view["state"].as_object().cloned().unwrap_or_default(),
            version: version.version,
            created_at: Utc::now(),
        })
    }

    pub fn restore_from_checkpoint(&self, checkpoint: &Checkpoint) -> Result<(), StateError> {
        self.base
            .seed(&checkpoint.workflow_id, checkpoint.inputs.clone(), checkpoint.state.clone());

        let mut table = self.concurrency.lock();
        let entry = table
            .entry(checkpoint.workflow_id.clone())
            .or_insert_with(WorkflowConcurrencyState::fresh);
        entry.history.clear();
        entry.pending.clear();
        entry.version = StateVersion {
            version: checkpoint.version + 1,
            updated_at: Utc::now(),
            updated_by: Some("checkpoint_restore".to_string()),
        };
        Ok(())
    }

    pub fn update_history(&self, workflow_id: &str, limit: usize) -> Vec<(DateTime<Utc>, String, Vec<String>)> {
        let table = self.concurrency.lock();
        let Some(entry) = table.get(workflow_id) else {
            return Vec::new();
        };
        let skip = entry.history.len().saturating_sub(limit);
        entry
            .history
            .iter()
            .skip(skip)
            .map(|h| (h.timestamp, h.agent_id.clone(), h.paths.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use workflow_model::StateSchema;

    fn manager() -> ConcurrentStateManager {
        let base = Arc::new(StateManager::new(StateSchema::default()).unwrap());
        ConcurrentStateManager::new(base)
    }

    #[test]
    fn version_starts_at_one_and_increments() {
        let mgr = manager();
        assert_eq!(mgr.version_of("wf1").version, 1);
        let batch = BatchUpdate::new(vec![StateUpdate::set("state.x", Value::from(1))]);
        let result = mgr.update("wf1", batch, None).unwrap();
        assert_eq!(result.new_version, 2);
    }

    #[test]
    fn mismatched_expected_version_is_rejected() {
        let mgr = manager();
        let mut batch = BatchUpdate::new(vec![StateUpdate::set("state.x", Value::from(1))]);
        batch.expected_version = Some(99);
        let err = mgr.update("wf1", batch, None).unwrap_err();
        assert!(matches!(err, StateError::VersionConflict { .. }));
    }

    #[test]
    fn checkpoint_round_trips_state() {
        let mgr = manager();
        mgr.update(
            "wf1",
            BatchUpdate::new(vec![StateUpdate::set("state.counter", Value::from(5))]),
            None,
        )
        .unwrap();
        let checkpoint = mgr.create_checkpoint("wf1").unwrap();

        mgr.update(
            "wf1",
            BatchUpdate::new(vec![StateUpdate::set("state.counter", Value::from(99))]),
            None,
        )
        .unwrap();

        mgr.restore_from_checkpoint(&checkpoint).unwrap();
        let view = mgr.read("wf1", false).unwrap();
        assert_eq!(view["state"]["counter"], Value::from(5));
    }

    #[test]
    fn stats_track_average_update_time() {
        let mgr = manager();
        assert_eq!(mgr.stats().average_update_time, Duration::ZERO);
        for i in 0..5 {
            mgr.update(
                "wf1",
                BatchUpdate::new(vec![StateUpdate::set("state.i", Value::from(i as u64))]),
                None,
            )
            .unwrap();
        }
        let stats = mgr.stats();
        assert_eq!(stats.total_updates, 5);
        assert!(stats.average_update_time >= Duration::ZERO);
    }

    #[test]
    fn history_is_bounded() {
        let mgr = manager();
        for i in 0..(MAX_HISTORY_PER_WORKFLOW + 10) {
            mgr.update(
                "wf1",
                BatchUpdate::new(vec![StateUpdate::set("state.i", Value::from(i as u64))]),
                None,
            )
            .unwrap();
        }
        let history = mgr.update_history("wf1", MAX_HISTORY_PER_WORKFLOW + 50);
        assert_eq!(history.len(), MAX_HISTORY_PER_WORKFLOW);
    }
}
