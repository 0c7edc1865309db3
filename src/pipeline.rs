//! Pipeline declaration, validation, and execution.
//!
//! A [`Pipeline`] is a named, statically declared graph of steps wired
//! through an [`EventBus`]. It is declared with a [`PipelineBuilder`],
//! validated once in [`PipelineBuilder::build`], and can then drive any
//! number of concurrent, fully isolated runs.
//!
//! ```text
//!  caller ──StartProcess──► upload ──Uploaded──┬─► log_action            (ActionLogSaved: end)
//!                                              └─► read ──Readed──► chunk ──Chunked──► index
//!                                                                                        │
//!                                                                              EmbeddingAdded: end
//! ```
//!
//! Each activation of a step function is a tokio task. An emitted event is
//! appended to the record's event log, resolved against the bus, and every
//! bound target is spawned in registration order. A run is `Completed` once
//! no task is left, or `Failed` as soon as one function returns an error.

use crate::error::{PipelineError, Result};
use crate::graph::{Binding, Endpoint, EventBus, StepHandle};
use crate::observer::{notify, RunEvent, RunObserver};
use crate::record::StepRecord;
use crate::step::{Emissions, Event, SharedRecord, Step, StepCall};
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{watch, RwLock};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// Lifecycle of one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunState {
    /// Spawned but the entry event has not been accepted yet.
    Created,
    /// One or more step functions are active.
    Running,
    /// Every dispatch chain ended without error.
    Completed,
    /// A step failed, the entry event was unknown, or the run was cancelled.
    Failed,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Completed | RunState::Failed)
    }
}

/// One resolved emission, as recorded in [`RunOutcome::trace`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    /// Emitting step, `None` for the entry event.
    pub source: Option<String>,
    pub event: String,
    /// Target step names in registration order.
    pub targets: Vec<String>,
}

/// Result of a finished run.
#[derive(Debug)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub pipeline: String,
    pub state: RunState,
    /// The record as the run left it (including partial work on failure).
    pub record: StepRecord,
    /// Every dispatched emission, in dispatch order.
    pub trace: Vec<DispatchRecord>,
    pub error: Option<PipelineError>,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == RunState::Completed
    }

    /// Whether `event` was emitted at any point during the run.
    pub fn emitted(&self, event: &str) -> bool {
        self.trace.iter().any(|d| d.event == event)
    }

    /// Events that resolved to no binding, i.e. where a chain terminated.
    pub fn terminal_events(&self) -> Vec<&str> {
        self.trace
            .iter()
            .filter(|d| d.targets.is_empty())
            .map(|d| d.event.as_str())
            .collect()
    }

    /// Convert into the final record, or the error that failed the run.
    pub fn into_result(self) -> Result<StepRecord> {
        match self.error {
            Some(e) => Err(e),
            None => Ok(self.record),
        }
    }
}

/// Handle to a run started with [`Pipeline::start`].
pub struct RunHandle {
    run_id: Uuid,
    task: JoinHandle<RunOutcome>,
    cancel: watch::Sender<bool>,
    state: watch::Receiver<RunState>,
}

impl RunHandle {
    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Current state of the run.
    pub fn state(&self) -> RunState {
        *self.state.borrow()
    }

    /// Request cancellation. Active step functions are aborted at their next
    /// suspension point and the run ends `Failed` with
    /// [`PipelineError::Cancelled`].
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// Wait for the run to reach `Completed` or `Failed`.
    pub async fn wait(self) -> Result<RunOutcome> {
        self.task
            .await
            .map_err(|e| PipelineError::Other(format!("pipeline run task failed: {e}")))
    }
}

struct Graph {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    bus: EventBus,
    unreachable: Vec<StepHandle>,
    observer: Option<Arc<dyn RunObserver>>,
}

/// A validated, immutable pipeline definition.
///
/// Cheap to clone; clones share the same graph.
#[derive(Clone)]
pub struct Pipeline {
    graph: Arc<Graph>,
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("name", &self.graph.name)
            .field("steps", &self.step_names())
            .field("bindings", &self.graph.bus.bindings().len())
            .field("has_observer", &self.graph.observer.is_some())
            .finish()
    }
}

impl Pipeline {
    /// Start declaring a pipeline.
    pub fn declare(name: impl Into<String>) -> PipelineBuilder {
        PipelineBuilder::new(name)
    }

    pub fn name(&self) -> &str {
        &self.graph.name
    }

    pub fn step_names(&self) -> Vec<&str> {
        self.graph.steps.iter().map(|s| s.name()).collect()
    }

    pub fn step(&self, handle: StepHandle) -> Option<&Arc<dyn Step>> {
        self.graph.steps.get(handle.0)
    }

    pub fn bus(&self) -> &EventBus {
        &self.graph.bus
    }

    pub fn entry_events(&self) -> Vec<&str> {
        self.graph.bus.entry_events()
    }

    /// Steps no entry event can reach. They never run.
    pub fn unreachable_steps(&self) -> Vec<&str> {
        self.graph
            .unreachable
            .iter()
            .map(|h| self.graph.steps[h.0].name())
            .collect()
    }

    /// Spawn a run on the tokio runtime and return a handle to it.
    pub fn start(&self, event: impl Into<Event>, record: StepRecord) -> RunHandle {
        let run_id = Uuid::new_v4();
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(RunState::Created);
        let pipeline = self.clone();
        let event = event.into();
        let task = tokio::spawn(async move {
            pipeline
                .execute(run_id, event, record, cancel_rx, state_tx)
                .await
        });
        RunHandle {
            run_id,
            task,
            cancel: cancel_tx,
            state: state_rx,
        }
    }

    /// Run to completion on the current task.
    pub async fn run(&self, event: impl Into<Event>, record: StepRecord) -> RunOutcome {
        let (_cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, _state_rx) = watch::channel(RunState::Created);
        self.execute(Uuid::new_v4(), event.into(), record, cancel_rx, state_tx)
            .await
    }

    async fn execute(
        &self,
        run_id: Uuid,
        event: Event,
        record: StepRecord,
        mut cancel: watch::Receiver<bool>,
        state: watch::Sender<RunState>,
    ) -> RunOutcome {
        let graph = &self.graph;
        let entries = graph.bus.entries(&event.name);
        let Some(entry) = entries.first().map(|b| (*b).clone()) else {
            tracing::warn!(
                pipeline = %graph.name,
                %run_id,
                event = %event.name,
                "rejected run: not an entry event"
            );
            let _ = state.send(RunState::Failed);
            notify(
                &graph.observer,
                RunEvent::RunEnd {
                    run_id,
                    state: RunState::Failed,
                },
            );
            return RunOutcome {
                run_id,
                pipeline: graph.name.clone(),
                state: RunState::Failed,
                record,
                trace: Vec::new(),
                error: Some(PipelineError::Configuration(format!(
                    "pipeline '{}' has no entry binding for event '{}'",
                    graph.name, event.name
                ))),
            };
        };

        tracing::info!(pipeline = %graph.name, %run_id, event = %event.name, "run started");
        let _ = state.send(RunState::Running);
        notify(
            &graph.observer,
            RunEvent::RunStart {
                run_id,
                pipeline: graph.name.clone(),
                event: event.name.clone(),
            },
        );

        let shared: SharedRecord = Arc::new(RwLock::new(record));
        let mut run = RunCtx {
            run_id,
            record: shared.clone(),
            tasks: JoinSet::new(),
            trace: Vec::new(),
        };
        self.dispatch(&mut run, None, event, vec![entry]).await;

        let mut failure: Option<PipelineError> = None;
        loop {
            let joined = tokio::select! {
                joined = run.tasks.join_next() => joined,
                _ = cancelled(&mut cancel) => {
                    failure = Some(PipelineError::Cancelled);
                    break;
                }
            };
            let Some(joined) = joined else { break };
            let (source, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    failure = Some(PipelineError::Other(format!("step task aborted: {e}")));
                    break;
                }
            };
            match result {
                Ok(emissions) => {
                    for emitted in emissions {
                        let bindings: Vec<Binding> = graph
                            .bus
                            .resolve(source, &emitted.name)
                            .into_iter()
                            .cloned()
                            .collect();
                        self.dispatch(&mut run, Some(source), emitted, bindings)
                            .await;
                    }
                }
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        if failure.is_some() {
            run.tasks.abort_all();
            while run.tasks.join_next().await.is_some() {}
        }
        for step in &graph.steps {
            step.finish_run(run_id);
        }

        let final_state = if failure.is_some() {
            RunState::Failed
        } else {
            RunState::Completed
        };
        match &failure {
            Some(e) => tracing::warn!(pipeline = %graph.name, %run_id, error = %e, "run failed"),
            None => tracing::info!(
                pipeline = %graph.name,
                %run_id,
                dispatches = run.trace.len(),
                "run completed"
            ),
        }

        drop(run.record);
        let record = match Arc::try_unwrap(shared) {
            Ok(lock) => lock.into_inner(),
            Err(shared) => shared.read().await.clone(),
        };
        let _ = state.send(final_state);
        notify(
            &graph.observer,
            RunEvent::RunEnd {
                run_id,
                state: final_state,
            },
        );

        RunOutcome {
            run_id,
            pipeline: graph.name.clone(),
            state: final_state,
            record,
            trace: run.trace,
            error: failure,
        }
    }

    /// Log `event`, then spawn one task per binding in registration order.
    async fn dispatch(
        &self,
        run: &mut RunCtx,
        source: Option<StepHandle>,
        event: Event,
        bindings: Vec<Binding>,
    ) {
        let graph = &self.graph;
        let source_name = source.map(|h| graph.steps[h.0].name().to_string());
        let targets: Vec<String> = bindings
            .iter()
            .map(|b| graph.steps[b.target.0].name().to_string())
            .collect();

        run.record.write().await.push_event(event.name.clone());
        tracing::debug!(
            run_id = %run.run_id,
            source = source_name.as_deref().unwrap_or("<entry>"),
            event = %event.name,
            ?targets,
            "dispatch"
        );
        notify(
            &graph.observer,
            RunEvent::Dispatch {
                run_id: run.run_id,
                source: source_name.clone(),
                event: event.name.clone(),
                targets: targets.clone(),
            },
        );
        run.trace.push(DispatchRecord {
            source: source_name.clone(),
            event: event.name.clone(),
            targets,
        });

        for binding in bindings {
            let step = graph.steps[binding.target.0].clone();
            let mut args = HashMap::new();
            if let Some(ref data) = event.data {
                args.insert(binding.parameter.clone(), data.clone());
            }
            let call = StepCall {
                run_id: run.run_id,
                source: source_name.clone(),
                event: event.name.clone(),
                args,
                record: run.record.clone(),
            };
            let observer = graph.observer.clone();
            let target = binding.target;
            let function = binding.function;
            let run_id = run.run_id;

            run.tasks.spawn(async move {
                notify(
                    &observer,
                    RunEvent::StepStart {
                        run_id,
                        step: step.name().to_string(),
                        function: function.clone(),
                    },
                );
                let result = match AssertUnwindSafe(step.invoke(&function, call))
                    .catch_unwind()
                    .await
                {
                    Ok(result) => result,
                    Err(_) => Err(PipelineError::Other("step function panicked".to_string())),
                };
                let result = result.map_err(|e| e.in_step(step.name(), &function));
                if let Err(ref e) = result {
                    tracing::error!(%run_id, step = step.name(), %function, error = %e, "step failed");
                }
                notify(
                    &observer,
                    RunEvent::StepEnd {
                        run_id,
                        step: step.name().to_string(),
                        function,
                        ok: result.is_ok(),
                    },
                );
                (target, result)
            });
        }
    }
}

/// Mutable state of one in-flight run.
struct RunCtx {
    run_id: Uuid,
    record: SharedRecord,
    tasks: JoinSet<(StepHandle, Result<Emissions>)>,
    trace: Vec<DispatchRecord>,
}

/// Resolves once cancellation is requested; never resolves if the handle
/// that could request it is gone.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    if rx.wait_for(|c| *c).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Declares a pipeline: steps, entry events, and event bindings.
///
/// Wiring mistakes are collected while declaring and reported together by
/// [`build`](Self::build).
///
/// # Example
///
/// ```ignore
/// let mut builder = Pipeline::declare("ingest");
/// let read = builder.add_step(ReadStep::new("read", readers));
/// let chunk = builder.add_step(ChunkStep::new("chunk", splitter, 100));
/// builder.on_entry_event("StartProcess").send_to(read, "read", "document");
/// builder.on_event(read, events::READED).send_to(chunk, "chunk", "document");
/// let pipeline = builder.build()?;
/// ```
pub struct PipelineBuilder {
    name: String,
    steps: Vec<Arc<dyn Step>>,
    bus: EventBus,
    entry_events: Vec<String>,
    errors: Vec<PipelineError>,
    observer: Option<Arc<dyn RunObserver>>,
}

impl PipelineBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            steps: Vec::new(),
            bus: EventBus::new(),
            entry_events: Vec::new(),
            errors: Vec::new(),
            observer: None,
        }
    }

    /// Add a step instance and get its handle.
    pub fn add_step<S: Step + 'static>(&mut self, step: S) -> StepHandle {
        self.add_shared_step(Arc::new(step))
    }

    /// Add an already shared step instance.
    pub fn add_shared_step(&mut self, step: Arc<dyn Step>) -> StepHandle {
        let handle = StepHandle(self.steps.len());
        self.steps.push(step);
        handle
    }

    /// Declare an external entry event and route it.
    pub fn on_entry_event(&mut self, event: impl Into<String>) -> Route<'_> {
        let event = event.into();
        if !self.entry_events.contains(&event) {
            self.entry_events.push(event.clone());
        }
        Route {
            builder: self,
            source: Endpoint::Entry,
            event,
        }
    }

    /// Route an event emitted by `step`.
    pub fn on_event(&mut self, step: StepHandle, event: impl Into<String>) -> Route<'_> {
        if step.0 >= self.steps.len() {
            self.errors.push(PipelineError::Configuration(format!(
                "unknown source step {step}"
            )));
        }
        Route {
            builder: self,
            source: Endpoint::Step(step),
            event: event.into(),
        }
    }

    /// Attach a lifecycle observer to every run of the pipeline.
    pub fn observer(&mut self, observer: Arc<dyn RunObserver>) -> &mut Self {
        self.observer = Some(observer);
        self
    }

    /// Validate the declaration and freeze it into a [`Pipeline`].
    pub fn build(self) -> Result<Pipeline> {
        let mut errors: Vec<String> = self.errors.iter().map(|e| e.to_string()).collect();

        if self.entry_events.is_empty() {
            errors.push("pipeline declares no entry event".to_string());
        }
        for event in &self.entry_events {
            match self.bus.entries(event).len() {
                1 => {}
                0 => errors.push(format!("entry event '{event}' has no binding")),
                n => errors.push(format!(
                    "entry event '{event}' has {n} bindings, expected exactly one"
                )),
            }
        }

        for binding in self.bus.bindings() {
            if let Err(msg) = self.check_binding(binding) {
                errors.push(msg);
            }
        }
        if errors.is_empty() {
            errors.extend(self.fan_out_conflicts());
        }

        if !errors.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "pipeline '{}': {}",
                self.name,
                errors.join("; ")
            )));
        }

        let reachable = self.bus.reachable_from_entries();
        let unreachable: Vec<StepHandle> = (0..self.steps.len())
            .map(StepHandle)
            .filter(|h| !reachable.contains(h))
            .collect();
        for h in &unreachable {
            tracing::warn!(
                pipeline = %self.name,
                step = self.steps[h.0].name(),
                "step is unreachable from every entry event"
            );
        }

        Ok(Pipeline {
            graph: Arc::new(Graph {
                name: self.name,
                steps: self.steps,
                bus: self.bus,
                unreachable,
                observer: self.observer,
            }),
        })
    }

    fn check_binding(&self, binding: &Binding) -> std::result::Result<(), String> {
        let step = self
            .steps
            .get(binding.target.0)
            .ok_or_else(|| format!("binding for '{}' targets unknown step {}", binding.event, binding.target))?;
        let function = step.function(&binding.function).ok_or_else(|| {
            format!(
                "step '{}' has no function '{}' (bound to '{}')",
                step.name(),
                binding.function,
                binding.event
            )
        })?;
        if !function.accepts(&binding.parameter) {
            return Err(format!(
                "function '{}.{}' has no parameter '{}' (accepts {:?})",
                step.name(),
                binding.function,
                binding.parameter,
                function.parameters
            ));
        }
        Ok(())
    }

    /// Fan-out targets of one event may run concurrently on the same record,
    /// so their write sets must be disjoint.
    fn fan_out_conflicts(&self) -> Vec<String> {
        let mut conflicts = Vec::new();
        for group in self.bus.fan_outs() {
            for (i, a) in group.iter().enumerate() {
                for b in &group[i + 1..] {
                    let (Some(fa), Some(fb)) = (self.access_of(a), self.access_of(b)) else {
                        continue;
                    };
                    let overlap = fa.write_conflicts(&fb);
                    if !overlap.is_empty() {
                        conflicts.push(format!(
                            "fan-out of '{}' sends to '{}.{}' and '{}.{}' which both write {:?}",
                            a.event,
                            self.steps[a.target.0].name(),
                            a.function,
                            self.steps[b.target.0].name(),
                            b.function,
                            overlap
                        ));
                    }
                }
            }
        }
        conflicts
    }

    fn access_of(&self, binding: &Binding) -> Option<crate::step::Access> {
        self.steps
            .get(binding.target.0)?
            .function(&binding.function)
            .map(|f| f.access)
    }
}

/// Routes one `(source, event)` to one or more targets.
pub struct Route<'a> {
    builder: &'a mut PipelineBuilder,
    source: Endpoint,
    event: String,
}

impl<'a> Route<'a> {
    /// Bind the event to `function` of `target`, delivering event data to
    /// `parameter`. Chain several calls to fan out.
    pub fn send_to(
        self,
        target: StepHandle,
        function: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Self {
        let result = match self.source {
            Endpoint::Entry => {
                self.builder
                    .bus
                    .bind_entry(self.event.clone(), target, function, parameter)
            }
            Endpoint::Step(source) => {
                self.builder
                    .bus
                    .bind(source, self.event.clone(), target, function, parameter)
            }
        };
        if let Err(e) = result {
            self.builder.errors.push(e);
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::FnObserver;
    use crate::record::DocumentSource;
    use crate::step::{Access, BoxFut, RecordField, StepFunction};
    use std::sync::Mutex;
    use std::time::Duration;

    const CONTENT_WRITER: &[StepFunction] = &[StepFunction {
        name: "run",
        parameters: &["document"],
        access: Access {
            reads: &[],
            writes: &[RecordField::Content],
        },
    }];

    const NO_WRITES: &[StepFunction] = &[StepFunction {
        name: "run",
        parameters: &["document", "payload"],
        access: Access::NONE,
    }];

    /// Emits a fixed list of events, optionally after a delay or failure.
    struct Scripted {
        name: String,
        emits: Vec<&'static str>,
        functions: &'static [StepFunction],
        fail: bool,
        delay: Option<Duration>,
        calls: Arc<Mutex<Vec<String>>>,
    }

    impl Scripted {
        fn new(name: &str, emits: Vec<&'static str>, calls: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.into(),
                emits,
                functions: NO_WRITES,
                fail: false,
                delay: None,
                calls: calls.clone(),
            }
        }

        fn writing_content(mut self) -> Self {
            self.functions = CONTENT_WRITER;
            self
        }

        fn failing(mut self) -> Self {
            self.fail = true;
            self
        }

        fn delayed(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }
    }

    impl Step for Scripted {
        fn kind(&self) -> &'static str {
            "scripted"
        }
        fn name(&self) -> &str {
            &self.name
        }
        fn functions(&self) -> &[StepFunction] {
            self.functions
        }
        fn invoke<'a>(&'a self, _function: &'a str, call: StepCall) -> BoxFut<'a, Result<Emissions>> {
            Box::pin(async move {
                if let Some(delay) = self.delay {
                    tokio::time::sleep(delay).await;
                }
                let arg = call
                    .arg("payload")
                    .map(|v| format!("({v})"))
                    .unwrap_or_default();
                self.calls
                    .lock()
                    .unwrap()
                    .push(format!("{}{}", self.name, arg));
                if self.fail {
                    return Err(PipelineError::Other("scripted failure".into()));
                }
                let mut out = Emissions::none();
                for e in &self.emits {
                    out = out.then(*e);
                }
                Ok(out)
            })
        }
    }

    fn record() -> StepRecord {
        StepRecord::new("conv", "sess", "file", DocumentSource::text("hi")).unwrap()
    }

    fn calls() -> Arc<Mutex<Vec<String>>> {
        Arc::new(Mutex::new(Vec::new()))
    }

    #[test]
    fn test_build_requires_entry_event() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        b.add_step(Scripted::new("a", vec![], &c));
        let err = b.build().unwrap_err();
        assert!(err.is_configuration());
        assert!(err.to_string().contains("no entry event"));
    }

    #[test]
    fn test_build_rejects_entry_without_binding() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        b.add_step(Scripted::new("a", vec![], &c));
        b.on_entry_event("StartProcess");
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("has no binding"));
    }

    #[test]
    fn test_build_rejects_two_entry_bindings() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        let z = b.add_step(Scripted::new("z", vec![], &c));
        b.on_entry_event("StartProcess")
            .send_to(a, "run", "document")
            .send_to(z, "run", "document");
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("expected exactly one"));
    }

    #[test]
    fn test_build_rejects_duplicate_binding() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        let z = b.add_step(Scripted::new("z", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        b.on_event(a, "Done")
            .send_to(z, "run", "document")
            .send_to(z, "run", "document");
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("duplicate binding"));
    }

    #[test]
    fn test_build_rejects_unknown_function_and_parameter() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "walk", "document");
        assert!(b.build().unwrap_err().to_string().contains("no function 'walk'"));

        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "file");
        assert!(b.build().unwrap_err().to_string().contains("no parameter 'file'"));
    }

    #[test]
    fn test_build_rejects_overlapping_fan_out_writes() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec!["Done"], &c));
        let x = b.add_step(Scripted::new("x", vec![], &c).writing_content());
        let y = b.add_step(Scripted::new("y", vec![], &c).writing_content());
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        b.on_event(a, "Done")
            .send_to(x, "run", "document")
            .send_to(y, "run", "document");
        let err = b.build().unwrap_err();
        assert!(err.to_string().contains("both write"));
    }

    #[test]
    fn test_unreachable_steps_reported() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        b.add_step(Scripted::new("orphan", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        let p = b.build().unwrap();
        assert_eq!(p.unreachable_steps(), vec!["orphan"]);
    }

    #[tokio::test]
    async fn test_linear_run_completes() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec!["A"], &c));
        let z = b.add_step(Scripted::new("z", vec!["Z"], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        b.on_event(a, "A").send_to(z, "run", "document");
        let p = b.build().unwrap();

        let outcome = p.run("StartProcess", record()).await;
        assert_eq!(outcome.state, RunState::Completed);
        assert!(outcome.error.is_none());
        assert_eq!(*c.lock().unwrap(), vec!["a", "z"]);
        assert_eq!(outcome.record.event_log(), ["StartProcess", "A", "Z"]);
        assert_eq!(outcome.terminal_events(), vec!["Z"]);
    }

    #[tokio::test]
    async fn test_multiple_emissions_dispatched_in_order() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec!["First", "Second"], &c));
        let x = b.add_step(Scripted::new("x", vec![], &c));
        let y = b.add_step(Scripted::new("y", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        b.on_event(a, "First").send_to(x, "run", "document");
        b.on_event(a, "Second").send_to(y, "run", "document");
        let p = b.build().unwrap();

        let outcome = p.run("StartProcess", record()).await;
        assert!(outcome.is_completed());
        let events: Vec<_> = outcome.trace.iter().map(|d| d.event.as_str()).collect();
        assert_eq!(events, vec!["StartProcess", "First", "Second"]);
        assert_eq!(outcome.trace[1].targets, vec!["x"]);
        assert_eq!(outcome.trace[2].targets, vec!["y"]);
    }

    #[tokio::test]
    async fn test_fan_out_runs_every_target() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec!["Done"], &c));
        let slow = b.add_step(Scripted::new("slow", vec![], &c).delayed(Duration::from_millis(30)));
        let fast = b.add_step(Scripted::new("fast", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        b.on_event(a, "Done")
            .send_to(slow, "run", "document")
            .send_to(fast, "run", "document");
        let p = b.build().unwrap();

        let outcome = p.run("StartProcess", record()).await;
        assert!(outcome.is_completed());
        let seen = c.lock().unwrap().clone();
        assert!(seen.contains(&"slow".to_string()));
        assert!(seen.contains(&"fast".to_string()));
        assert_eq!(outcome.trace[1].targets, vec!["slow", "fast"]);
    }

    #[tokio::test]
    async fn test_event_data_bound_to_parameter() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "payload");
        let p = b.build().unwrap();

        let event = Event::new("StartProcess").with_data(serde_json::json!(7));
        p.run(event, record()).await;
        assert_eq!(*c.lock().unwrap(), vec!["a(7)"]);
    }

    #[tokio::test]
    async fn test_failure_fails_run_with_identity() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec!["A"], &c));
        let bad = b.add_step(Scripted::new("bad", vec!["Never"], &c).failing());
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        b.on_event(a, "A").send_to(bad, "run", "document");
        let p = b.build().unwrap();

        let outcome = p.run("StartProcess", record()).await;
        assert_eq!(outcome.state, RunState::Failed);
        let err = outcome.error.as_ref().unwrap();
        assert_eq!(err.failed_step(), Some("bad"));
        assert!(!outcome.emitted("Never"));
        assert!(outcome.into_result().is_err());
    }

    #[tokio::test]
    async fn test_unknown_entry_event_fails() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        let p = b.build().unwrap();

        let outcome = p.run("Nope", record()).await;
        assert_eq!(outcome.state, RunState::Failed);
        assert!(outcome.error.unwrap().is_configuration());
        assert!(c.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_and_wait() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        let p = b.build().unwrap();

        let handle = p.start("StartProcess", record());
        let run_id = handle.run_id();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.run_id, run_id);
        assert!(outcome.is_completed());
    }

    #[tokio::test]
    async fn test_cancel_fails_run() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec![], &c).delayed(Duration::from_secs(30)));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        let p = b.build().unwrap();

        let handle = p.start("StartProcess", record());
        tokio::time::sleep(Duration::from_millis(20)).await;
        handle.cancel();
        let outcome = handle.wait().await.unwrap();
        assert_eq!(outcome.state, RunState::Failed);
        assert!(matches!(outcome.error, Some(PipelineError::Cancelled)));
    }

    #[tokio::test]
    async fn test_observer_sees_lifecycle() {
        let c = calls();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec!["A"], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        b.observer(Arc::new(FnObserver(move |e: RunEvent| {
            let tag = match e {
                RunEvent::RunStart { .. } => "start",
                RunEvent::StepStart { .. } => "step-start",
                RunEvent::StepEnd { .. } => "step-end",
                RunEvent::Dispatch { .. } => "dispatch",
                RunEvent::RunEnd { .. } => "end",
            };
            sink.lock().unwrap().push(tag);
        })));
        let p = b.build().unwrap();

        p.run("StartProcess", record()).await;
        assert_eq!(
            *seen.lock().unwrap(),
            vec!["start", "dispatch", "step-start", "step-end", "dispatch", "end"]
        );
    }

    #[tokio::test]
    async fn test_concurrent_runs_are_isolated() {
        let c = calls();
        let mut b = Pipeline::declare("p");
        let a = b.add_step(Scripted::new("a", vec!["A"], &c));
        b.on_entry_event("StartProcess").send_to(a, "run", "document");
        let p = b.build().unwrap();

        let r1 = StepRecord::new("c1", "s", "f1", DocumentSource::text("x")).unwrap();
        let r2 = StepRecord::new("c2", "s", "f2", DocumentSource::text("y")).unwrap();
        let (o1, o2) = tokio::join!(p.run("StartProcess", r1), p.run("StartProcess", r2));
        assert_ne!(o1.run_id, o2.run_id);
        assert_eq!(o1.record.file_id(), "f1");
        assert_eq!(o2.record.file_id(), "f2");
        assert_eq!(o1.record.event_log(), ["StartProcess", "A"]);
        assert_eq!(o2.record.event_log(), ["StartProcess", "A"]);
    }
}
