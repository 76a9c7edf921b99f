//! Applying a change set.
//!
//! Every entry runs as its own task. A task waits for the terminal signal
//! of each upstream entry, so creates and updates run strictly after their
//! dependencies and deletes run strictly after the deletes of their
//! recorded dependents. Independent branches proceed concurrently, bounded
//! by a semaphore. A failure marks all transitive dependents skipped;
//! branches that do not depend on the failure run to completion.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tracing::{info_span, Instrument as _};

use opsgraph_core::{
    Action, ChangeSet, EntryReport, EntryStatus, LogicalName, PhysicalId, PropertyValue, Report,
    ResourceGraph, StateRecord,
};
use opsgraph_provider::{CreateResponse, ProviderRegistry, ProviderResult, UpdateResponse};

use crate::interrupt::InterruptState;
use crate::retry::RetryPolicy;
use crate::state::StateStore;

#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    /// Upper bound on concurrently running provider operations.
    pub parallelism: usize,
    pub retry: RetryPolicy,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        ExecutorOptions {
            parallelism: 4,
            retry: RetryPolicy::default(),
        }
    }
}

pub struct Executor {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn StateStore>,
    options: ExecutorOptions,
    interrupt: InterruptState,
}

/// Terminal signal of one entry, as seen by its dependents.
#[derive(Clone)]
enum Signal {
    /// Applied (or already settled); dependents may resolve references
    /// against these outputs.
    Ok(Arc<BTreeMap<String, Value>>),
    Failed,
    Skipped,
    Cancelled,
}

/// Everything one entry task needs, cloned out of the graph and state
/// before spawning.
struct Planned {
    name: LogicalName,
    action: Action,
    type_: String,
    properties: BTreeMap<String, PropertyValue>,
    record: Option<StateRecord>,
    /// Entries whose terminal signal must arrive before this one starts.
    upstream: BTreeSet<LogicalName>,
}

struct TaskCtx {
    registry: Arc<ProviderRegistry>,
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
    semaphore: Arc<Semaphore>,
    interrupt: InterruptState,
}

impl Executor {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        store: Arc<dyn StateStore>,
        options: ExecutorOptions,
        interrupt: InterruptState,
    ) -> Self {
        Executor {
            registry,
            store,
            options,
            interrupt,
        }
    }

    /// Apply `change_set` against the providers and commit the results.
    ///
    /// Node-level errors do not escape: they land in the report, attributed
    /// to their entry. The report enumerates a terminal status for every
    /// entry, even on total failure.
    pub async fn apply(
        &self,
        graph: &ResourceGraph,
        change_set: &ChangeSet,
        state: &BTreeMap<LogicalName, StateRecord>,
    ) -> Report {
        let started_at = Utc::now();
        let planned = plan_entries(graph, change_set, state);

        let mut senders: BTreeMap<LogicalName, watch::Sender<Option<Signal>>> = BTreeMap::new();
        let mut receivers: BTreeMap<LogicalName, watch::Receiver<Option<Signal>>> =
            BTreeMap::new();
        for p in &planned {
            let (tx, rx) = watch::channel(None);
            senders.insert(p.name.clone(), tx);
            receivers.insert(p.name.clone(), rx);
        }

        let ctx = Arc::new(TaskCtx {
            registry: self.registry.clone(),
            store: self.store.clone(),
            retry: self.options.retry.clone(),
            semaphore: Arc::new(Semaphore::new(self.options.parallelism.max(1))),
            interrupt: self.interrupt.clone(),
        });

        let mut handles = Vec::with_capacity(planned.len());
        for p in planned {
            let upstream: Vec<(LogicalName, watch::Receiver<Option<Signal>>)> = p
                .upstream
                .iter()
                .filter_map(|dep| receivers.get(dep).map(|rx| (dep.clone(), rx.clone())))
                .collect();
            let tx = senders
                .remove(&p.name)
                .expect("every planned entry has a channel");
            let span = info_span!("applying entry", resource = %p.name, action = %p.action);
            handles.push(tokio::spawn(
                run_entry(ctx.clone(), p, upstream, tx).instrument(span),
            ));
        }

        let mut entries = Vec::with_capacity(handles.len());
        for handle in handles {
            entries.push(handle.await.expect("entry task panicked"));
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));

        Report {
            outcome: Report::outcome_of(&entries),
            started_at,
            finished_at: Utc::now(),
            entries,
        }
    }
}

/// Resolve each change entry to the data its task needs, including its
/// scheduling dependencies.
fn plan_entries(
    graph: &ResourceGraph,
    change_set: &ChangeSet,
    state: &BTreeMap<LogicalName, StateRecord>,
) -> Vec<Planned> {
    let deleted: BTreeSet<&LogicalName> = change_set
        .iter()
        .filter(|e| e.action == Action::Delete)
        .map(|e| &e.name)
        .collect();

    change_set
        .iter()
        .map(|entry| {
            let record = state.get(&entry.name).cloned();
            match entry.action {
                Action::Delete => {
                    // Reverse dependency order: wait for the deletes of
                    // everything recorded as depending on this resource.
                    let upstream = deleted
                        .iter()
                        .filter(|d| {
                            state
                                .get(**d)
                                .map(|r| r.depends_on.contains(&entry.name))
                                .unwrap_or(false)
                        })
                        .map(|d| (*d).clone())
                        .collect();
                    Planned {
                        name: entry.name.clone(),
                        action: entry.action,
                        type_: record
                            .as_ref()
                            .map(|r| r.type_.clone())
                            .unwrap_or_default(),
                        properties: BTreeMap::new(),
                        record,
                        upstream,
                    }
                }
                _ => {
                    let node = graph
                        .get(&entry.name)
                        .expect("non-delete change entries come from the graph");
                    Planned {
                        name: entry.name.clone(),
                        action: entry.action,
                        type_: node.type_.clone(),
                        properties: node.properties.clone(),
                        record,
                        upstream: node.dependencies(),
                    }
                }
            }
        })
        .collect()
}

async fn run_entry(
    ctx: Arc<TaskCtx>,
    planned: Planned,
    upstream: Vec<(LogicalName, watch::Receiver<Option<Signal>>)>,
    tx: watch::Sender<Option<Signal>>,
) -> EntryReport {
    let mut dep_outputs: BTreeMap<LogicalName, Arc<BTreeMap<String, Value>>> = BTreeMap::new();
    let mut blocked_on: Option<LogicalName> = None;
    let mut upstream_cancelled = false;

    for (dep, mut rx) in upstream {
        let signal = loop {
            let current = rx.borrow().clone();
            if let Some(s) = current {
                break s;
            }
            if rx.changed().await.is_err() {
                // Sender gone without a terminal signal; only happens if the
                // dependency's task panicked.
                break Signal::Failed;
            }
        };
        match signal {
            Signal::Ok(outputs) => {
                dep_outputs.insert(dep, outputs);
            }
            Signal::Failed | Signal::Skipped => {
                blocked_on = Some(dep);
                break;
            }
            Signal::Cancelled => {
                upstream_cancelled = true;
                break;
            }
        }
    }

    let (report, outputs) = if let Some(dep) = blocked_on {
        let report = EntryReport {
            name: planned.name.clone(),
            action: planned.action,
            status: EntryStatus::Skipped,
            error: None,
            blocked_on: Some(dep),
            started_at: None,
            finished_at: None,
        };
        (report, Arc::new(BTreeMap::new()))
    } else if upstream_cancelled || ctx.interrupt.is_interrupted() {
        (cancelled_report(&planned), Arc::new(BTreeMap::new()))
    } else {
        // The permit bounds concurrent provider work; waiting dependents
        // hold no permit.
        let _permit = ctx
            .semaphore
            .acquire()
            .await
            .expect("semaphore never closed");
        if ctx.interrupt.is_interrupted() {
            (cancelled_report(&planned), Arc::new(BTreeMap::new()))
        } else {
            perform(&ctx, &planned, &dep_outputs).await
        }
    };

    let signal = match report.status {
        EntryStatus::Succeeded | EntryStatus::NoOp => Signal::Ok(outputs),
        EntryStatus::Failed => Signal::Failed,
        EntryStatus::Skipped => Signal::Skipped,
        EntryStatus::Cancelled => Signal::Cancelled,
    };
    let _ = tx.send(Some(signal));
    report
}

fn cancelled_report(planned: &Planned) -> EntryReport {
    EntryReport {
        name: planned.name.clone(),
        action: planned.action,
        status: EntryStatus::Cancelled,
        error: None,
        blocked_on: None,
        started_at: None,
        finished_at: None,
    }
}

enum OpOutput {
    Created(CreateResponse),
    Updated(UpdateResponse),
    Deleted,
}

/// Run the provider operation for one entry and commit the result. Returns
/// the report plus the outputs dependents may resolve references against.
async fn perform(
    ctx: &TaskCtx,
    planned: &Planned,
    dep_outputs: &BTreeMap<LogicalName, Arc<BTreeMap<String, Value>>>,
) -> (EntryReport, Arc<BTreeMap<String, Value>>) {
    let mut report = EntryReport {
        name: planned.name.clone(),
        action: planned.action,
        status: EntryStatus::Succeeded,
        error: None,
        blocked_on: None,
        started_at: None,
        finished_at: None,
    };

    if planned.action == Action::NoOp {
        report.status = EntryStatus::NoOp;
        // Settled: the recorded outputs are current.
        let outputs = planned
            .record
            .as_ref()
            .map(|r| r.outputs.clone())
            .unwrap_or_default();
        return (report, Arc::new(outputs));
    }

    report.started_at = Some(Utc::now());
    let result = perform_inner(ctx, planned, dep_outputs).await;
    report.finished_at = Some(Utc::now());

    let outputs = match result {
        Ok(outputs) => outputs,
        Err(e) => {
            tracing::error!(resource = %planned.name, "could not {} resource: {:#}", planned.action, e);
            report.status = EntryStatus::Failed;
            report.error = Some(format!("{:#}", e));
            Arc::new(BTreeMap::new())
        }
    };
    (report, outputs)
}

async fn perform_inner(
    ctx: &TaskCtx,
    planned: &Planned,
    dep_outputs: &BTreeMap<LogicalName, Arc<BTreeMap<String, Value>>>,
) -> anyhow::Result<Arc<BTreeMap<String, Value>>> {
    match planned.action {
        Action::NoOp => Ok(Arc::new(BTreeMap::new())),
        Action::Delete => {
            let record = match &planned.record {
                Some(r) => r,
                // Nothing recorded; nothing to tear down.
                None => return Ok(Arc::new(BTreeMap::new())),
            };
            let adapter = ctx.registry.get(&record.type_)?;
            with_retry(ctx, &planned.name, || async {
                adapter
                    .delete(&record.type_, &record.physical_id)
                    .await
                    .map(|()| OpOutput::Deleted)
            })
            .await?;
            ctx.store.delete(&planned.name).await?;
            tracing::info!(resource = %planned.name, "deleted");
            Ok(Arc::new(BTreeMap::new()))
        }
        Action::Create | Action::Update => {
            let inputs = resolve_properties(planned, dep_outputs)?;
            let adapter = ctx.registry.get(&planned.type_)?;

            let (physical_id, outputs) = match planned.action {
                Action::Create => {
                    let response = with_retry(ctx, &planned.name, || async {
                        adapter.create(&planned.type_, &inputs).await.map(OpOutput::Created)
                    })
                    .await?;
                    match response {
                        OpOutput::Created(r) => (r.physical_id, r.outputs),
                        _ => unreachable!(),
                    }
                }
                Action::Update => {
                    let physical_id: PhysicalId = planned
                        .record
                        .as_ref()
                        .map(|r| r.physical_id.clone())
                        .ok_or_else(|| {
                            anyhow::anyhow!(
                                "resource {} is planned as an update but has no state record",
                                planned.name
                            )
                        })?;
                    let response = with_retry(ctx, &planned.name, || async {
                        adapter
                            .update(&planned.type_, &physical_id, &inputs)
                            .await
                            .map(OpOutput::Updated)
                    })
                    .await?;
                    match response {
                        OpOutput::Updated(r) => (physical_id, r.outputs),
                        _ => unreachable!(),
                    }
                }
                _ => unreachable!(),
            };

            // Commit only after the provider confirmed success.
            let outputs = Arc::new(outputs);
            let record = StateRecord {
                type_: planned.type_.clone(),
                physical_id,
                inputs,
                outputs: (*outputs).clone(),
                depends_on: planned.upstream.clone(),
            };
            ctx.store.commit(&planned.name, record).await?;
            tracing::info!(resource = %planned.name, "{}d", planned.action);
            Ok(outputs)
        }
    }
}

/// Replace references with the outputs their dependencies produced in this
/// run. By the time an entry runs, every dependency has signalled, so a
/// missing output is an error, not something to wait for.
fn resolve_properties(
    planned: &Planned,
    dep_outputs: &BTreeMap<LogicalName, Arc<BTreeMap<String, Value>>>,
) -> anyhow::Result<BTreeMap<String, Value>> {
    let mut resolved = BTreeMap::new();
    for (key, value) in &planned.properties {
        match value.resolve(|r| {
            dep_outputs
                .get(&r.resource)
                .and_then(|outputs| outputs.get(&r.output).cloned())
        }) {
            Some(v) => {
                resolved.insert(key.clone(), v);
            }
            None => {
                let r = value.as_ref_value().expect("only references can be unresolved");
                anyhow::bail!(
                    "property {} of resource {} references {}, which has no such output",
                    key,
                    planned.name,
                    r
                );
            }
        }
    }
    Ok(resolved)
}

/// Retry transient provider errors per policy; anything else propagates
/// immediately.
async fn with_retry<F, Fut>(ctx: &TaskCtx, name: &LogicalName, op: F) -> ProviderResult<OpOutput>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = ProviderResult<OpOutput>>,
{
    let mut attempt = 1u32;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) if e.is_transient() && attempt < ctx.retry.max_attempts => {
                let delay = ctx.retry.delay(attempt);
                tracing::warn!(
                    resource = %name,
                    attempt,
                    "transient provider error: {}; retrying in {:?}",
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::differ::diff;
    use crate::state::MemoryStateStore;
    use async_trait::async_trait;
    use opsgraph_core::{ResourceNode, RunOutcome};
    use opsgraph_provider::{ProviderAdapter, ProviderError};
    use serde_json::json;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Clone, Copy)]
    enum FailMode {
        NonTransient,
        TransientAlways,
        TransientTimes(u32),
    }

    /// Test adapter. Resources carry an `id` property naming themselves so
    /// the adapter can apply per-resource behavior and log call order.
    #[derive(Default)]
    struct ScriptedProvider {
        log: Mutex<Vec<String>>,
        failures: Mutex<BTreeMap<String, FailMode>>,
        counter: AtomicU64,
        /// Block the named resource's create until released.
        gate: Option<Gate>,
        /// Wait here from two resources at once to prove concurrency.
        rendezvous: Option<Arc<tokio::sync::Barrier>>,
    }

    struct Gate {
        id: String,
        started: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl ScriptedProvider {
        fn fail(self, id: &str, mode: FailMode) -> Self {
            self.failures.lock().unwrap().insert(id.to_owned(), mode);
            self
        }

        fn log_of(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }

        fn id_of(properties: &BTreeMap<String, Value>) -> String {
            properties
                .get("id")
                .and_then(|v| v.as_str())
                .unwrap_or("?")
                .to_owned()
        }

        fn check_failure(&self, id: &str) -> ProviderResult<()> {
            let mut failures = self.failures.lock().unwrap();
            match failures.get(id).copied() {
                None => Ok(()),
                Some(FailMode::NonTransient) => {
                    Err(ProviderError::non_transient(format!("{} rejected", id)))
                }
                Some(FailMode::TransientAlways) => {
                    Err(ProviderError::transient(format!("{} throttled", id)))
                }
                Some(FailMode::TransientTimes(n)) => {
                    if n <= 1 {
                        failures.remove(id);
                    } else {
                        failures.insert(id.to_owned(), FailMode::TransientTimes(n - 1));
                    }
                    Err(ProviderError::transient(format!("{} throttled", id)))
                }
            }
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedProvider {
        async fn create(
            &self,
            _type_tag: &str,
            properties: &BTreeMap<String, Value>,
        ) -> ProviderResult<CreateResponse> {
            let id = Self::id_of(properties);
            if let Some(gate) = &self.gate {
                if gate.id == id {
                    gate.started.notify_one();
                    gate.release.notified().await;
                }
            }
            if let Some(barrier) = &self.rendezvous {
                barrier.wait().await;
            }
            self.log.lock().unwrap().push(format!("create {}", id));
            self.check_failure(&id)?;
            let n = self.counter.fetch_add(1, Ordering::Relaxed);
            let mut outputs: BTreeMap<String, Value> = properties.clone();
            outputs.insert("out".to_owned(), json!(format!("{}-out", id)));
            Ok(CreateResponse {
                physical_id: PhysicalId::new(format!("{}-{}", id, n)),
                outputs,
            })
        }

        async fn read(
            &self,
            _type_tag: &str,
            _physical_id: &PhysicalId,
        ) -> ProviderResult<Option<BTreeMap<String, Value>>> {
            Ok(None)
        }

        async fn update(
            &self,
            _type_tag: &str,
            physical_id: &PhysicalId,
            properties: &BTreeMap<String, Value>,
        ) -> ProviderResult<UpdateResponse> {
            let id = Self::id_of(properties);
            self.log.lock().unwrap().push(format!("update {}", id));
            self.check_failure(&id)?;
            let mut outputs: BTreeMap<String, Value> = properties.clone();
            outputs.insert("out".to_owned(), json!(format!("{}-out-{}", id, physical_id)));
            Ok(UpdateResponse { outputs })
        }

        async fn delete(&self, _type_tag: &str, physical_id: &PhysicalId) -> ProviderResult<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("delete {}", physical_id));
            Ok(())
        }
    }

    fn registry(provider: Arc<ScriptedProvider>) -> Arc<ProviderRegistry> {
        let mut r = ProviderRegistry::new();
        r.register("scripted", provider);
        Arc::new(r)
    }

    fn node(name: &str) -> ResourceNode {
        ResourceNode::new(name, "scripted").with_property("id", json!(name))
    }

    fn graph(nodes: Vec<ResourceNode>) -> ResourceGraph {
        let mut g = ResourceGraph::new();
        for n in nodes {
            g.add(n).unwrap();
        }
        g.validate().unwrap();
        g
    }

    fn executor(
        provider: Arc<ScriptedProvider>,
        store: Arc<MemoryStateStore>,
        interrupt: InterruptState,
    ) -> Executor {
        let options = ExecutorOptions {
            parallelism: 4,
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(10),
                max_delay: Duration::from_millis(100),
            },
        };
        Executor::new(registry(provider), store, options, interrupt)
    }

    async fn run(
        g: &ResourceGraph,
        store: Arc<MemoryStateStore>,
        provider: Arc<ScriptedProvider>,
    ) -> Report {
        let state = store.load().await.unwrap();
        let cs = diff(g, &state).unwrap();
        executor(provider, store, InterruptState::new())
            .apply(g, &cs, &state)
            .await
    }

    fn status_of(report: &Report, name: &str) -> EntryStatus {
        report.get(&LogicalName::new(name)).unwrap().status
    }

    #[tokio::test]
    async fn creates_follow_dependency_order() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![node("a"), node("b").with_dependency("a")]);

        let report = run(&g, store.clone(), provider.clone()).await;
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(provider.log_of(), vec!["create a", "create b"]);
        assert_eq!(store.load().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failure_skips_transitive_dependents() {
        let provider =
            Arc::new(ScriptedProvider::default().fail("a", FailMode::NonTransient));
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![
            node("a"),
            node("b").with_dependency("a"),
            node("c").with_dependency("b"),
            node("x"),
        ]);

        let report = run(&g, store.clone(), provider).await;
        assert_eq!(report.outcome, RunOutcome::PartialFailure);
        assert_eq!(status_of(&report, "a"), EntryStatus::Failed);
        assert_eq!(status_of(&report, "b"), EntryStatus::Skipped);
        assert_eq!(status_of(&report, "c"), EntryStatus::Skipped);
        assert_eq!(status_of(&report, "x"), EntryStatus::Succeeded);
        assert_eq!(
            report.get(&LogicalName::new("b")).unwrap().blocked_on,
            Some(LogicalName::new("a"))
        );
        // Nothing committed for the failed branch
        let records = store.load().await.unwrap();
        assert!(!records.contains_key(&LogicalName::new("a")));
        assert!(records.contains_key(&LogicalName::new("x")));
    }

    #[tokio::test]
    async fn independent_branches_run_concurrently() {
        let provider = Arc::new(ScriptedProvider {
            rendezvous: Some(Arc::new(tokio::sync::Barrier::new(2))),
            ..Default::default()
        });
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![node("c"), node("d")]);

        // Each create waits at the barrier, so this only finishes if both
        // run at the same time.
        let report = tokio::time::timeout(
            Duration::from_secs(5),
            run(&g, store, provider),
        )
        .await
        .expect("independent entries did not run concurrently");
        assert_eq!(status_of(&report, "c"), EntryStatus::Succeeded);
        assert_eq!(status_of(&report, "d"), EntryStatus::Succeeded);
    }

    #[tokio::test]
    async fn reapply_is_idempotent() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![node("a"), node("b").with_dependency("a")]);

        run(&g, store.clone(), provider.clone()).await;

        let state = store.load().await.unwrap();
        let cs = diff(&g, &state).unwrap();
        assert!(cs.is_settled());

        let report = executor(provider.clone(), store, InterruptState::new())
            .apply(&g, &cs, &state)
            .await;
        assert_eq!(report.outcome, RunOutcome::Complete);
        assert_eq!(status_of(&report, "a"), EntryStatus::NoOp);
        assert_eq!(status_of(&report, "b"), EntryStatus::NoOp);
        // No further provider calls
        assert_eq!(provider.log_of().len(), 2);
    }

    #[tokio::test]
    async fn create_then_delete_round_trip() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(MemoryStateStore::new());

        let g = graph(vec![node("a")]);
        run(&g, store.clone(), provider.clone()).await;
        assert_eq!(store.load().await.unwrap().len(), 1);

        let empty = graph(vec![]);
        let report = run(&empty, store.clone(), provider).await;
        assert_eq!(status_of(&report, "a"), EntryStatus::Succeeded);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deletes_run_in_reverse_dependency_order() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(MemoryStateStore::new());

        let g = graph(vec![node("a"), node("b").with_dependency("a")]);
        run(&g, store.clone(), provider.clone()).await;

        let empty = graph(vec![]);
        let report = run(&empty, store.clone(), provider.clone()).await;
        assert_eq!(report.outcome, RunOutcome::Complete);

        let log = provider.log_of();
        let deletes: Vec<&String> = log.iter().filter(|l| l.starts_with("delete")).collect();
        assert_eq!(deletes.len(), 2);
        // b's physical id was created second ("b-1"), and must go first.
        assert!(deletes[0].contains("b-"), "unexpected order: {:?}", deletes);
        assert!(deletes[1].contains("a-"), "unexpected order: {:?}", deletes);
    }

    #[tokio::test]
    async fn references_resolve_from_fresh_outputs() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![
            node("a"),
            node("b").with_property("input", PropertyValue::reference("a", "out")),
        ]);

        let report = run(&g, store.clone(), provider).await;
        assert_eq!(report.outcome, RunOutcome::Complete);
        let records = store.load().await.unwrap();
        assert_eq!(
            records[&LogicalName::new("b")].inputs.get("input"),
            Some(&json!("a-out"))
        );
    }

    #[tokio::test]
    async fn reference_to_missing_output_fails_the_entry() {
        let provider = Arc::new(ScriptedProvider::default());
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![
            node("a"),
            node("b").with_property("input", PropertyValue::reference("a", "no_such_output")),
        ]);

        let report = run(&g, store, provider).await;
        assert_eq!(status_of(&report, "a"), EntryStatus::Succeeded);
        assert_eq!(status_of(&report, "b"), EntryStatus::Failed);
        let error = report
            .get(&LogicalName::new("b"))
            .unwrap()
            .error
            .clone()
            .unwrap();
        assert!(error.contains("no_such_output"), "unexpected error: {}", error);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_are_retried_until_success() {
        let provider =
            Arc::new(ScriptedProvider::default().fail("a", FailMode::TransientTimes(2)));
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![node("a")]);

        let report = run(&g, store, provider.clone()).await;
        assert_eq!(status_of(&report, "a"), EntryStatus::Succeeded);
        assert_eq!(provider.log_of().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_errors_exhaust_the_retry_budget() {
        let provider =
            Arc::new(ScriptedProvider::default().fail("a", FailMode::TransientAlways));
        let store = Arc::new(MemoryStateStore::new());
        let g = graph(vec![node("a")]);

        let report = run(&g, store.clone(), provider.clone()).await;
        assert_eq!(status_of(&report, "a"), EntryStatus::Failed);
        // max_attempts, no more
        assert_eq!(provider.log_of().len(), 3);
        assert!(store.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn interrupt_cancels_pending_entries() {
        let started = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        let provider = Arc::new(ScriptedProvider {
            gate: Some(Gate {
                id: "a".to_owned(),
                started: started.clone(),
                release: release.clone(),
            }),
            ..Default::default()
        });
        let store = Arc::new(MemoryStateStore::new());
        let interrupt = InterruptState::new();
        let g = graph(vec![node("a"), node("b").with_dependency("a")]);

        let state = store.load().await.unwrap();
        let cs = diff(&g, &state).unwrap();
        let exec = executor(provider, store, interrupt.clone());
        let apply = tokio::spawn(async move { exec.apply(&g, &cs, &state).await });

        // a is in flight; interrupt, then let it finish.
        started.notified().await;
        interrupt.set_interrupted();
        release.notify_one();

        let report = apply.await.unwrap();
        assert_eq!(report.outcome, RunOutcome::Interrupted);
        assert_eq!(status_of(&report, "a"), EntryStatus::Succeeded);
        assert_eq!(status_of(&report, "b"), EntryStatus::Cancelled);
    }
}
