//! Run scheduling: cache decisions, bounded parallel execution, and failure
//! propagation.
//!
//! # Execution flow
//!
//! 1. Every selected node starts `pending`. Nodes whose in-run dependencies
//!    are all satisfied enter the ready queue (identifier-sorted).
//! 2. The dispatch loop moves ready nodes to `queued` and spawns one task per
//!    node into a `JoinSet`, never holding more than `workers` tasks. The
//!    bound is structural: nothing is spawned while the set is full.
//! 3. Each task looks the node up in the store. A hit finishes the node as
//!    `cache-hit`. On a miss it takes the key's build lock, looks again (a
//!    concurrent writer may have published), resolves its inputs, moves to
//!    `running`, calls the adapter, and publishes the output.
//! 4. As tasks finish the dispatcher settles the node's terminal status.
//!    Success releases dependents whose dependencies are now all satisfied;
//!    failure skips every transitive dependent. Independent branches go on.
//! 5. Cancellation stops dispatch immediately. In-flight adapters see the
//!    token; nodes that never started end `skipped` (cancelled).
//!
//! There are no automatic retries.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::FutureExt;
use serde::Serialize;
use stepwise_types::artifact::Artifact;
use stepwise_types::error::{StepExecutionError, StoreError};
use stepwise_types::event::RunEvent;
use stepwise_types::fingerprint::Fingerprint;
use stepwise_types::identifier::StepIdentifier;
use stepwise_types::run::{NodeStatus, SkipReason};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::adapter::{AdapterOutput, AdapterSet, DependencyInput, StepInvocation};
use crate::checksum::FingerprintTable;
use crate::event::EventBus;
use crate::graph::{DagNode, DependencyGraph, ExecutorKind, ResolvedSelection};
use crate::run_state::RunState;
use crate::store::ArtifactStore;

// ---------------------------------------------------------------------------
// Options, errors, reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Maximum number of nodes in flight (at least 1).
    pub workers: usize,
    /// Bypass cache lookups for the selection's targets.
    pub force: bool,
    /// Plan only; execute nothing.
    pub dry_run: bool,
    /// Adapter time limit per node.
    pub step_timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            workers: 1,
            force: false,
            dry_run: false,
            step_timeout: None,
        }
    }
}

/// Errors that prevent a run from starting. Per-node failures are not
/// errors; they are recorded in the [`RunReport`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("step {0} is not in the graph")]
    UnknownStep(StepIdentifier),

    #[error("no fingerprint computed for {0}")]
    MissingFingerprint(StepIdentifier),

    #[error("cache lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Final state of one node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub step: StepIdentifier,
    pub fingerprint: Fingerprint,
    pub status: NodeStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub skip_reason: Option<SkipReason>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    /// Payload directory of the node's artifact (hits and successes).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    pub cache_hits: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    /// Nodes in topological order.
    pub nodes: Vec<NodeReport>,
    pub summary: RunSummary,
    pub cancelled: bool,
    pub duration_ms: u64,
    /// Adapter calls made during the run.
    pub adapter_invocations: usize,
    /// Highest number of simultaneously running nodes.
    pub peak_running: usize,
}

impl RunReport {
    /// False iff any node failed.
    pub fn is_success(&self) -> bool {
        self.summary.failed == 0
    }

    pub fn node(&self, step: &StepIdentifier) -> Option<&NodeReport> {
        self.nodes.iter().find(|n| &n.step == step)
    }

    pub fn status(&self, step: &StepIdentifier) -> Option<NodeStatus> {
        self.node(step).map(|n| n.status)
    }

    pub fn failures(&self) -> impl Iterator<Item = &NodeReport> {
        self.nodes.iter().filter(|n| n.status == NodeStatus::Failed)
    }
}

/// What a dry run predicts for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum PlannedAction {
    CacheHit,
    Build,
}

#[derive(Debug, Clone, Serialize)]
pub struct PlanEntry {
    pub step: StepIdentifier,
    pub fingerprint: Fingerprint,
    pub action: PlannedAction,
}

/// Dry-run result: every selected node grouped into dependency waves.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RunPlan {
    pub waves: Vec<Vec<PlanEntry>>,
}

impl RunPlan {
    pub fn entries(&self) -> impl Iterator<Item = &PlanEntry> {
        self.waves.iter().flatten()
    }

    pub fn action(&self, step: &StepIdentifier) -> Option<PlannedAction> {
        self.entries().find(|e| &e.step == step).map(|e| e.action)
    }

    pub fn to_build(&self) -> usize {
        self.entries()
            .filter(|e| e.action == PlannedAction::Build)
            .count()
    }

    pub fn cache_hits(&self) -> usize {
        self.entries()
            .filter(|e| e.action == PlannedAction::CacheHit)
            .count()
    }
}

/// Either a plan (dry run) or the report of an executed run.
#[derive(Debug, Clone)]
pub enum RunOutcome {
    Planned(RunPlan),
    Executed(RunReport),
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Runs a selection of a graph against an artifact store.
///
/// Generic over `S: ArtifactStore` so tests can use an in-memory store.
pub struct Scheduler<S: ArtifactStore> {
    store: Arc<S>,
    adapters: Arc<AdapterSet>,
    events: EventBus,
}

impl<S: ArtifactStore + 'static> Scheduler<S> {
    pub fn new(store: Arc<S>, adapters: Arc<AdapterSet>, events: EventBus) -> Self {
        Self {
            store,
            adapters,
            events,
        }
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Plan or execute, depending on `options.dry_run`.
    pub async fn run(
        &self,
        graph: Arc<DependencyGraph>,
        fingerprints: Arc<FingerprintTable>,
        selection: &ResolvedSelection,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunOutcome, SchedulerError> {
        if options.dry_run {
            let plan = self
                .plan(&graph, &fingerprints, selection, options.force)
                .await?;
            return Ok(RunOutcome::Planned(plan));
        }
        let report = self
            .execute(graph, fingerprints, selection, options, cancel)
            .await?;
        Ok(RunOutcome::Executed(report))
    }

    /// Predict the cache decision for every selected node without executing.
    pub async fn plan(
        &self,
        graph: &DependencyGraph,
        fingerprints: &FingerprintTable,
        selection: &ResolvedSelection,
        force: bool,
    ) -> Result<RunPlan, SchedulerError> {
        validate(graph, fingerprints, selection)?;

        let mut waves = Vec::new();
        for wave in graph.execution_waves(&selection.nodes) {
            let mut entries = Vec::with_capacity(wave.len());
            for step in wave {
                let fingerprint = fingerprint_of(fingerprints, &step)?;
                let stored_input = graph.node(&step).is_some_and(DagNode::is_stored_input);
                let forced = force && !stored_input && selection.targets.contains(&step);
                let action = if !forced && self.store.exists(&step, &fingerprint).await? {
                    PlannedAction::CacheHit
                } else {
                    PlannedAction::Build
                };
                entries.push(PlanEntry {
                    step,
                    fingerprint,
                    action,
                });
            }
            waves.push(entries);
        }

        let plan = RunPlan { waves };
        tracing::info!(
            nodes = selection.nodes.len(),
            to_build = plan.to_build(),
            cache_hits = plan.cache_hits(),
            "run planned"
        );
        Ok(plan)
    }

    /// Execute the selection and report the final status of every node.
    pub async fn execute(
        &self,
        graph: Arc<DependencyGraph>,
        fingerprints: Arc<FingerprintTable>,
        selection: &ResolvedSelection,
        options: &RunOptions,
        cancel: CancellationToken,
    ) -> Result<RunReport, SchedulerError> {
        validate(&graph, &fingerprints, selection)?;

        let started = Instant::now();
        let workers = options.workers.max(1);
        let nodes = &selection.nodes;
        let state = Arc::new(RunState::new(nodes.iter().cloned()));

        let ctx = Arc::new(TaskContext {
            store: Arc::clone(&self.store),
            adapters: Arc::clone(&self.adapters),
            graph: Arc::clone(&graph),
            fingerprints: Arc::clone(&fingerprints),
            state: Arc::clone(&state),
            events: self.events.clone(),
            cancel: cancel.clone(),
            step_timeout: options.step_timeout,
            locations: DashMap::new(),
            invocations: AtomicUsize::new(0),
        });

        // In-run dependencies still outstanding per node.
        let mut waiting: HashMap<StepIdentifier, usize> = nodes
            .iter()
            .map(|id| {
                let count = graph.dependencies(id).filter(|d| nodes.contains(*d)).count();
                (id.clone(), count)
            })
            .collect();
        let mut ready: BTreeSet<StepIdentifier> = waiting
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(id, _)| id.clone())
            .collect();
        let mut records: BTreeMap<StepIdentifier, NodeRecord> = BTreeMap::new();

        tracing::info!(nodes = nodes.len(), workers, force = options.force, "run started");
        self.events.publish(RunEvent::RunStarted {
            nodes: nodes.len(),
            workers,
        });

        let mut join_set: JoinSet<(StepIdentifier, NodeOutcome)> = JoinSet::new();
        loop {
            if !cancel.is_cancelled() {
                while join_set.len() < workers {
                    let Some(step) = ready.pop_first() else {
                        break;
                    };
                    if !state.transition(&step, NodeStatus::Pending, NodeStatus::Queued) {
                        continue;
                    }
                    let fingerprint = fingerprint_of(&fingerprints, &step)?;
                    let force = options.force && selection.targets.contains(&step);
                    let ctx = Arc::clone(&ctx);
                    join_set.spawn(async move {
                        let outcome =
                            AssertUnwindSafe(build_node(ctx, step.clone(), fingerprint, force))
                                .catch_unwind()
                                .await
                                .unwrap_or_else(|_| NodeOutcome::Failed {
                                    error: "step task panicked".to_string(),
                                    duration_ms: None,
                                });
                        (step, outcome)
                    });
                }
            }

            let Some(joined) = join_set.join_next().await else {
                break;
            };
            let (step, outcome) = match joined {
                Ok(done) => done,
                Err(e) => {
                    tracing::error!(error = %e, "step task did not complete");
                    continue;
                }
            };

            match outcome {
                NodeOutcome::CacheHit { location } => {
                    settle(&state, &step, NodeStatus::CacheHit);
                    tracing::info!(step = %step, status = "cache-hit", "step satisfied from cache");
                    self.events.publish(RunEvent::NodeCacheHit {
                        step: step.clone(),
                        fingerprint: fingerprint_of(&fingerprints, &step)?,
                    });
                    ctx.locations.insert(step.clone(), location.clone());
                    records.insert(step.clone(), NodeRecord::done(NodeStatus::CacheHit, location, None));
                    release_dependents(&graph, nodes, &state, &step, &mut waiting, &mut ready);
                }
                NodeOutcome::Succeeded {
                    location,
                    duration_ms,
                } => {
                    settle(&state, &step, NodeStatus::Succeeded);
                    tracing::info!(
                        step = %step,
                        status = "succeeded",
                        elapsed_ms = duration_ms,
                        "step built"
                    );
                    self.events.publish(RunEvent::NodeSucceeded {
                        step: step.clone(),
                        fingerprint: fingerprint_of(&fingerprints, &step)?,
                        duration_ms,
                    });
                    ctx.locations.insert(step.clone(), location.clone());
                    records.insert(
                        step.clone(),
                        NodeRecord::done(NodeStatus::Succeeded, location, Some(duration_ms)),
                    );
                    release_dependents(&graph, nodes, &state, &step, &mut waiting, &mut ready);
                }
                NodeOutcome::Failed { error, duration_ms } => {
                    settle(&state, &step, NodeStatus::Failed);
                    tracing::error!(step = %step, status = "failed", error = %error, "step failed");
                    self.events.publish(RunEvent::NodeFailed {
                        step: step.clone(),
                        error: error.clone(),
                    });
                    records.insert(step.clone(), NodeRecord::failed(error, duration_ms));

                    for dependent in graph.descendants(&step) {
                        if !nodes.contains(&dependent) {
                            continue;
                        }
                        if state.transition(&dependent, NodeStatus::Pending, NodeStatus::Skipped) {
                            ready.remove(&dependent);
                            let reason = SkipReason::UpstreamFailed(step.clone());
                            tracing::warn!(step = %dependent, status = "skipped", reason = %reason, "step skipped");
                            self.events.publish(RunEvent::NodeSkipped {
                                step: dependent.clone(),
                                reason: reason.clone(),
                            });
                            records.insert(dependent, NodeRecord::skipped(reason));
                        }
                    }
                }
                NodeOutcome::Skipped(reason) => {
                    settle(&state, &step, NodeStatus::Skipped);
                    self.events.publish(RunEvent::NodeSkipped {
                        step: step.clone(),
                        reason: reason.clone(),
                    });
                    records.insert(step, NodeRecord::skipped(reason));
                }
            }
        }

        // Whatever never reached a terminal state was cut off by cancellation.
        for step in state.in_status(NodeStatus::Pending) {
            if state.transition(&step, NodeStatus::Pending, NodeStatus::Skipped) {
                self.events.publish(RunEvent::NodeSkipped {
                    step: step.clone(),
                    reason: SkipReason::Cancelled,
                });
                records.insert(step, NodeRecord::skipped(SkipReason::Cancelled));
            }
        }
        for status in [NodeStatus::Queued, NodeStatus::Running] {
            for step in state.in_status(status) {
                settle(&state, &step, NodeStatus::Failed);
                records.insert(
                    step,
                    NodeRecord::failed("step task did not complete".to_string(), None),
                );
            }
        }
        debug_assert!(state.all_terminal(), "run ended with non-terminal nodes");

        let mut summary = RunSummary::default();
        let mut reports = Vec::with_capacity(nodes.len());
        for step in graph.topological_order_of(nodes) {
            let record = records
                .remove(step)
                .unwrap_or_else(|| NodeRecord::skipped(SkipReason::Cancelled));
            match record.status {
                NodeStatus::CacheHit => summary.cache_hits += 1,
                NodeStatus::Succeeded => summary.succeeded += 1,
                NodeStatus::Failed => summary.failed += 1,
                _ => summary.skipped += 1,
            }
            reports.push(NodeReport {
                step: step.clone(),
                fingerprint: fingerprint_of(&fingerprints, step)?,
                status: record.status,
                error: record.error,
                skip_reason: record.skip_reason,
                duration_ms: record.duration_ms,
                location: record.location,
            });
        }

        let duration_ms = started.elapsed().as_millis() as u64;
        let report = RunReport {
            nodes: reports,
            summary,
            cancelled: cancel.is_cancelled(),
            duration_ms,
            adapter_invocations: ctx.invocations.load(Ordering::SeqCst),
            peak_running: state.peak_running(),
        };

        tracing::info!(
            cache_hits = summary.cache_hits,
            succeeded = summary.succeeded,
            failed = summary.failed,
            skipped = summary.skipped,
            cancelled = report.cancelled,
            elapsed_ms = duration_ms,
            "run finished"
        );
        self.events.publish(RunEvent::RunFinished {
            cache_hits: summary.cache_hits,
            succeeded: summary.succeeded,
            failed: summary.failed,
            skipped: summary.skipped,
            duration_ms,
        });
        Ok(report)
    }
}

fn validate(
    graph: &DependencyGraph,
    fingerprints: &FingerprintTable,
    selection: &ResolvedSelection,
) -> Result<(), SchedulerError> {
    for step in &selection.nodes {
        if !graph.contains(step) {
            return Err(SchedulerError::UnknownStep(step.clone()));
        }
        fingerprint_of(fingerprints, step)?;
        for dep in graph.dependencies(step) {
            fingerprint_of(fingerprints, dep)?;
        }
    }
    Ok(())
}

fn fingerprint_of(
    fingerprints: &FingerprintTable,
    step: &StepIdentifier,
) -> Result<Fingerprint, SchedulerError> {
    fingerprints
        .get(step)
        .ok_or_else(|| SchedulerError::MissingFingerprint(step.clone()))
}

/// Move a dispatched node to its terminal status.
fn settle(state: &RunState, step: &StepIdentifier, to: NodeStatus) {
    for from in [NodeStatus::Queued, NodeStatus::Running] {
        if state.transition(step, from, to) {
            return;
        }
    }
}

fn release_dependents(
    graph: &DependencyGraph,
    nodes: &BTreeSet<StepIdentifier>,
    state: &RunState,
    step: &StepIdentifier,
    waiting: &mut HashMap<StepIdentifier, usize>,
    ready: &mut BTreeSet<StepIdentifier>,
) {
    for dependent in graph.dependents(step) {
        if !nodes.contains(dependent) {
            continue;
        }
        if let Some(count) = waiting.get_mut(dependent) {
            *count = count.saturating_sub(1);
            if *count == 0 && state.status(dependent) == Some(NodeStatus::Pending) {
                ready.insert(dependent.clone());
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Per-node task
// ---------------------------------------------------------------------------

struct NodeRecord {
    status: NodeStatus,
    error: Option<String>,
    skip_reason: Option<SkipReason>,
    duration_ms: Option<u64>,
    location: Option<PathBuf>,
}

impl NodeRecord {
    fn done(status: NodeStatus, location: PathBuf, duration_ms: Option<u64>) -> Self {
        Self {
            status,
            error: None,
            skip_reason: None,
            duration_ms,
            location: Some(location),
        }
    }

    fn failed(error: String, duration_ms: Option<u64>) -> Self {
        Self {
            status: NodeStatus::Failed,
            error: Some(error),
            skip_reason: None,
            duration_ms,
            location: None,
        }
    }

    fn skipped(reason: SkipReason) -> Self {
        Self {
            status: NodeStatus::Skipped,
            error: None,
            skip_reason: Some(reason),
            duration_ms: None,
            location: None,
        }
    }
}

enum NodeOutcome {
    CacheHit {
        location: PathBuf,
    },
    Succeeded {
        location: PathBuf,
        duration_ms: u64,
    },
    Failed {
        error: String,
        duration_ms: Option<u64>,
    },
    Skipped(SkipReason),
}

/// Shared by every task of one run.
struct TaskContext<S: ArtifactStore> {
    store: Arc<S>,
    adapters: Arc<AdapterSet>,
    graph: Arc<DependencyGraph>,
    fingerprints: Arc<FingerprintTable>,
    state: Arc<RunState>,
    events: EventBus,
    cancel: CancellationToken,
    step_timeout: Option<Duration>,
    /// Payload locations of nodes finished earlier in this run.
    locations: DashMap<StepIdentifier, PathBuf>,
    invocations: AtomicUsize,
}

impl<S: ArtifactStore> TaskContext<S> {
    /// Fetch a usable artifact. Missing or unreadable entries are misses;
    /// corrupted entries are invalidated first.
    async fn lookup(&self, step: &StepIdentifier, fingerprint: &Fingerprint) -> Option<Artifact> {
        match self.store.fetch(step, fingerprint).await {
            Ok(artifact) => Some(artifact),
            Err(StoreError::NotFound { .. }) => None,
            Err(e @ StoreError::Corruption { .. }) => {
                tracing::warn!(step = %step, error = %e, "cached artifact is corrupted, rebuilding");
                if let Err(e) = self.store.invalidate(step, fingerprint).await {
                    tracing::warn!(step = %step, error = %e, "could not remove corrupted artifact");
                }
                None
            }
            Err(e) => {
                tracing::warn!(step = %step, error = %e, "cache lookup failed, rebuilding");
                None
            }
        }
    }

    async fn resolve_inputs(
        &self,
        step: &StepIdentifier,
    ) -> Result<Vec<DependencyInput>, StepExecutionError> {
        let mut inputs = Vec::new();
        for dep in self.graph.dependencies(step) {
            let fingerprint =
                self.fingerprints
                    .get(dep)
                    .ok_or_else(|| StepExecutionError::MissingInput {
                        step: dep.clone(),
                        reason: "no fingerprint".to_string(),
                    })?;
            let known = self.locations.get(dep).map(|l| l.clone());
            let location = match known {
                Some(location) => location,
                // Dependencies outside the run must already be stored.
                None => {
                    self.store
                        .fetch(dep, &fingerprint)
                        .await
                        .map_err(|e| StepExecutionError::MissingInput {
                            step: dep.clone(),
                            reason: e.to_string(),
                        })?
                        .location
                }
            };
            inputs.push(DependencyInput {
                step: dep.clone(),
                fingerprint,
                location,
            });
        }
        Ok(inputs)
    }

    async fn invoke(
        &self,
        kind: ExecutorKind,
        invocation: &StepInvocation,
    ) -> Result<AdapterOutput, StepExecutionError> {
        let run = async {
            match self.step_timeout {
                Some(limit) => match tokio::time::timeout(limit, self.adapters.execute(kind, invocation)).await {
                    Ok(result) => result,
                    Err(_) => Err(StepExecutionError::Timeout(limit.as_secs())),
                },
                None => self.adapters.execute(kind, invocation).await,
            }
        };
        tokio::select! {
            biased;
            _ = invocation.cancel.cancelled() => Err(StepExecutionError::Cancelled),
            result = run => result,
        }
    }
}

async fn build_node<S: ArtifactStore>(
    ctx: Arc<TaskContext<S>>,
    step: StepIdentifier,
    fingerprint: Fingerprint,
    force: bool,
) -> NodeOutcome {
    if ctx.graph.node(&step).is_some_and(DagNode::is_stored_input) {
        return match ctx.lookup(&step, &fingerprint).await {
            Some(artifact) => NodeOutcome::CacheHit {
                location: artifact.location,
            },
            None => NodeOutcome::Failed {
                error: StepExecutionError::MissingInput {
                    step: step.clone(),
                    reason: "external input is not in the store".to_string(),
                }
                .to_string(),
                duration_ms: None,
            },
        };
    }

    if !force {
        if let Some(artifact) = ctx.lookup(&step, &fingerprint).await {
            return NodeOutcome::CacheHit {
                location: artifact.location,
            };
        }
    }

    let _lock = ctx.store.lock(&step, &fingerprint).await;
    if !force {
        if let Some(artifact) = ctx.lookup(&step, &fingerprint).await {
            tracing::debug!(step = %step, "published by a concurrent writer");
            return NodeOutcome::CacheHit {
                location: artifact.location,
            };
        }
    }
    if ctx.cancel.is_cancelled() {
        return NodeOutcome::Skipped(SkipReason::Cancelled);
    }

    let Some(kind) = ctx.graph.node(&step).map(|n| n.kind) else {
        return NodeOutcome::Failed {
            error: format!("step {step} is not in the graph"),
            duration_ms: None,
        };
    };
    let inputs = match ctx.resolve_inputs(&step).await {
        Ok(inputs) => inputs,
        Err(e) => {
            return NodeOutcome::Failed {
                error: e.to_string(),
                duration_ms: None,
            };
        }
    };
    let dest = match ctx.store.staging_dir(&step, &fingerprint).await {
        Ok(dest) => dest,
        Err(e) => {
            return NodeOutcome::Failed {
                error: StepExecutionError::Store(e).to_string(),
                duration_ms: None,
            };
        }
    };

    ctx.state
        .transition(&step, NodeStatus::Queued, NodeStatus::Running);
    ctx.invocations.fetch_add(1, Ordering::SeqCst);
    ctx.events.publish(RunEvent::NodeStarted {
        step: step.clone(),
        fingerprint,
    });
    tracing::debug!(
        step = %step,
        fingerprint = %fingerprint.short(),
        inputs = inputs.len(),
        "invoking adapter"
    );

    let invocation = StepInvocation {
        step: step.clone(),
        fingerprint,
        inputs,
        dest: dest.clone(),
        cancel: ctx.cancel.child_token(),
    };
    let started = Instant::now();
    let result = ctx.invoke(kind, &invocation).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok(output) => {
            if let Some(detail) = output.detail.as_deref() {
                tracing::debug!(step = %step, detail, "adapter output");
            }
            match ctx.store.publish(&step, &fingerprint, &dest, force).await {
                Ok(artifact) => NodeOutcome::Succeeded {
                    location: artifact.location,
                    duration_ms,
                },
                Err(e) => {
                    ctx.store.discard_staging(&dest).await;
                    NodeOutcome::Failed {
                        error: StepExecutionError::Store(e).to_string(),
                        duration_ms: Some(duration_ms),
                    }
                }
            }
        }
        Err(StepExecutionError::Cancelled) => {
            ctx.store.discard_staging(&dest).await;
            NodeOutcome::Skipped(SkipReason::Cancelled)
        }
        Err(e) => {
            ctx.store.discard_staging(&dest).await;
            NodeOutcome::Failed {
                error: e.to_string(),
                duration_ms: Some(duration_ms),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
