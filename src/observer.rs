//! Run lifecycle hooks.
//!
//! Provides an optional, non-intrusive way to observe pipeline runs. The
//! runner reports when a run starts, when each step function starts and
//! ends, every dispatch of an emitted event, and the terminal state.
//! Implement [`RunObserver`] to receive these for progress tracking, audit,
//! or deterministic assertions in tests. Structured logs go through
//! `tracing` independently of any observer.

use crate::pipeline::RunState;
use std::sync::Arc;
use uuid::Uuid;

/// Lifecycle signals reported during a run.
#[derive(Debug, Clone, PartialEq)]
pub enum RunEvent {
    /// The entry event was accepted and the run is now `Running`.
    RunStart {
        run_id: Uuid,
        pipeline: String,
        event: String,
    },
    /// A step function was activated.
    StepStart {
        run_id: Uuid,
        step: String,
        function: String,
    },
    /// A step function returned.
    StepEnd {
        run_id: Uuid,
        step: String,
        function: String,
        ok: bool,
    },
    /// An event was resolved against the binding table.
    Dispatch {
        run_id: Uuid,
        /// Emitting step, `None` for the entry event.
        source: Option<String>,
        event: String,
        /// Target step names in registration order; empty ends the chain.
        targets: Vec<String>,
    },
    /// The run reached a terminal state.
    RunEnd { run_id: Uuid, state: RunState },
}

/// Handler for run lifecycle events.
///
/// Entirely optional -- pipelines run without an observer. Called from the
/// runner task, so implementations should return quickly.
///
/// # Example
///
/// ```
/// use ingest_pipeline::observer::{RunEvent, RunObserver};
///
/// struct PrintObserver;
///
/// impl RunObserver for PrintObserver {
///     fn on_event(&self, event: RunEvent) {
///         if let RunEvent::Dispatch { event, targets, .. } = event {
///             println!("{event} -> {targets:?}");
///         }
///     }
/// }
/// ```
pub trait RunObserver: Send + Sync {
    fn on_event(&self, event: RunEvent);
}

/// Report an event if an observer is present. No-op otherwise.
pub(crate) fn notify(observer: &Option<Arc<dyn RunObserver>>, event: RunEvent) {
    if let Some(ref o) = observer {
        o.on_event(event);
    }
}

/// A [`RunObserver`] backed by a closure.
///
/// ```
/// use ingest_pipeline::observer::{FnObserver, RunEvent};
/// use std::sync::Arc;
///
/// let observer = Arc::new(FnObserver(|event: RunEvent| {
///     if let RunEvent::RunEnd { state, .. } = event {
///         println!("finished: {state:?}");
///     }
/// }));
/// ```
pub struct FnObserver<F: Fn(RunEvent) + Send + Sync>(pub F);

impl<F: Fn(RunEvent) + Send + Sync> RunObserver for FnObserver<F> {
    fn on_event(&self, event: RunEvent) {
        (self.0)(event);
    }
}
