use super::{unknown_function, DOCUMENT_PARAM};
use crate::error::{PipelineError, Result};
use crate::step::{Access, BoxFut, Emissions, Step, StepCall, StepFunction};
use dashmap::DashMap;
use std::collections::HashSet;
use uuid::Uuid;

const FUNCTIONS: &[StepFunction] = &[StepFunction {
    name: "arrive",
    parameters: &[DOCUMENT_PARAM],
    access: Access::NONE,
}];

/// Join point for parallel branches.
///
/// Bind each predecessor event to `arrive`. Per run, the barrier emits its
/// release event exactly once: when the last of the awaited events arrives.
/// Later arrivals in a released run are ignored. Per-run state is kept until
/// the run ends.
pub struct BarrierStep {
    name: String,
    waits_for: Vec<String>,
    release: String,
    arrivals: DashMap<Uuid, Arrivals>,
}

#[derive(Debug, Default)]
struct Arrivals {
    seen: HashSet<String>,
    released: bool,
}

impl BarrierStep {
    pub fn new<I, S>(name: impl Into<String>, waits_for: I, release: impl Into<String>) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let name = name.into();
        let mut waits_for: Vec<String> = waits_for.into_iter().map(Into::into).collect();
        waits_for.sort();
        waits_for.dedup();
        if waits_for.is_empty() {
            return Err(PipelineError::Configuration(format!(
                "barrier '{name}' must wait for at least one event"
            )));
        }
        Ok(Self {
            name,
            waits_for,
            release: release.into(),
            arrivals: DashMap::new(),
        })
    }

    pub fn release_event(&self) -> &str {
        &self.release
    }

    /// Runs with some arrivals that have not been released yet.
    pub fn pending_runs(&self) -> usize {
        self.arrivals.iter().filter(|a| !a.released).count()
    }

    fn arrive(&self, call: StepCall) -> Result<Emissions> {
        if !self.waits_for.contains(&call.event) {
            tracing::warn!(step = %self.name, event = %call.event, "ignoring arrival of unexpected event");
            return Ok(Emissions::none());
        }
        // check and release under one entry guard
        let mut state = self.arrivals.entry(call.run_id).or_default();
        if state.released {
            tracing::debug!(step = %self.name, event = %call.event, "barrier already released");
            return Ok(Emissions::none());
        }
        state.seen.insert(call.event.clone());
        if state.seen.len() < self.waits_for.len() {
            return Ok(Emissions::none());
        }
        state.released = true;
        drop(state);
        tracing::debug!(step = %self.name, release = %self.release, "barrier released");
        Ok(Emissions::one(self.release.as_str()))
    }
}

impl Step for BarrierStep {
    fn kind(&self) -> &'static str {
        "barrier"
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn functions(&self) -> &[StepFunction] {
        FUNCTIONS
    }

    fn invoke<'a>(&'a self, function: &'a str, call: StepCall) -> BoxFut<'a, Result<Emissions>> {
        Box::pin(async move {
            match function {
                "arrive" => self.arrive(call),
                other => Err(unknown_function(&self.name, other)),
            }
        })
    }

    fn finish_run(&self, run_id: Uuid) {
        self.arrivals.remove(&run_id);
    }
}
