//! Core step trait and the types that flow in and out of a step.
//!
//! Steps are the unit of work in a pipeline. Each step exposes one or more
//! named functions, declared up front in a static [`StepFunction`] table so
//! that the pipeline builder can validate bindings and fan-out write sets
//! before anything runs. A function receives a [`StepCall`] and returns the
//! [`Emissions`] that drive routing to the next steps.

use crate::error::Result;
use crate::record::StepRecord;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A boxed, pinned, Send future -- the return type of [`Step::invoke`].
pub type BoxFut<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The record handle shared by every branch of one run.
pub type SharedRecord = Arc<RwLock<StepRecord>>;

/// A named signal emitted by a step function or raised by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub name: String,
    /// Optional payload delivered to the bound parameter of each target.
    pub data: Option<Value>,
}

impl Event {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<&str> for Event {
    fn from(name: &str) -> Self {
        Event::new(name)
    }
}

/// Fields of a [`StepRecord`] a step function may read or write.
///
/// The event log is not listed: only the runner appends to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RecordField {
    Source,
    Uri,
    Content,
    Chunks,
    Tags,
    Metadata,
}

/// Static read/write sets of one step function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Access {
    pub reads: &'static [RecordField],
    pub writes: &'static [RecordField],
}

impl Access {
    pub const NONE: Access = Access {
        reads: &[],
        writes: &[],
    };

    /// Fields written by both `self` and `other`.
    pub fn write_conflicts(&self, other: &Access) -> Vec<RecordField> {
        self.writes
            .iter()
            .filter(|f| other.writes.contains(f))
            .copied()
            .collect()
    }
}

/// A callable function declared by a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepFunction {
    pub name: &'static str,
    /// Parameter names a binding may deliver event data to.
    pub parameters: &'static [&'static str],
    pub access: Access,
}

impl StepFunction {
    pub fn accepts(&self, parameter: &str) -> bool {
        self.parameters.contains(&parameter)
    }
}

/// Everything a step function receives for one invocation.
#[derive(Clone)]
pub struct StepCall {
    /// Id of the run this invocation belongs to.
    pub run_id: Uuid,
    /// Name of the emitting step, or `None` for the entry event.
    pub source: Option<String>,
    /// Name of the event that triggered this invocation.
    pub event: String,
    /// Event data bound to parameter names.
    pub args: HashMap<String, Value>,
    pub record: SharedRecord,
}

impl StepCall {
    /// Event data bound to `parameter`, if the triggering event carried any.
    pub fn arg(&self, parameter: &str) -> Option<&Value> {
        self.args.get(parameter)
    }
}

impl fmt::Debug for StepCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StepCall")
            .field("run_id", &self.run_id)
            .field("source", &self.source)
            .field("event", &self.event)
            .field("args", &self.args.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Events emitted by one step invocation, dispatched in order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Emissions(Vec<Event>);

impl Emissions {
    /// No events: this branch of the run ends here.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn one(event: impl Into<Event>) -> Self {
        Self(vec![event.into()])
    }

    /// Append another event (builder style).
    pub fn then(mut self, event: impl Into<Event>) -> Self {
        self.0.push(event.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Event> {
        self.0.iter()
    }
}

impl IntoIterator for Emissions {
    type Item = Event;
    type IntoIter = std::vec::IntoIter<Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.into_iter()
    }
}

/// Object-safe trait for pipeline steps.
///
/// Steps are stored as `Arc<dyn Step>` so one declaration can drive any
/// number of concurrent runs. A step must not hold the record lock across
/// an await on a collaborator, and must not swallow collaborator errors:
/// the runner wraps them with the step and function name.
pub trait Step: Send + Sync {
    /// Stable identifier for the step type (e.g. `"read"`, `"index"`).
    fn kind(&self) -> &'static str;

    /// Instance name (for logging, tracing, and error identity).
    fn name(&self) -> &str;

    /// Functions this step exposes to bindings.
    fn functions(&self) -> &[StepFunction];

    /// Execute `function` for one call.
    fn invoke<'a>(&'a self, function: &'a str, call: StepCall) -> BoxFut<'a, Result<Emissions>>;

    /// Look up a declared function by name.
    fn function(&self, name: &str) -> Option<&StepFunction> {
        self.functions().iter().find(|f| f.name == name)
    }

    /// Called once when run `run_id` ends, whatever its outcome. Steps that
    /// keep per-run state drop it here.
    fn finish_run(&self, _run_id: Uuid) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emissions_order() {
        let e = Emissions::one("TagsGenerated").then("Chunked");
        let names: Vec<_> = e.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["TagsGenerated", "Chunked"]);
        assert_eq!(e.len(), 2);
        assert!(Emissions::none().is_empty());
    }

    #[test]
    fn test_write_conflicts() {
        let read = Access {
            reads: &[RecordField::Source],
            writes: &[RecordField::Content],
        };
        let log = Access::NONE;
        let rewrite = Access {
            reads: &[],
            writes: &[RecordField::Content, RecordField::Tags],
        };
        assert!(read.write_conflicts(&log).is_empty());
        assert_eq!(read.write_conflicts(&rewrite), vec![RecordField::Content]);
    }

    #[test]
    fn test_function_accepts_parameter() {
        let f = StepFunction {
            name: "read",
            parameters: &["document"],
            access: Access::NONE,
        };
        assert!(f.accepts("document"));
        assert!(!f.accepts("file"));
    }

    #[test]
    fn test_event_data() {
        let e = Event::new("StartProcess").with_data(serde_json::json!({"k": 1}));
        assert_eq!(e.data.unwrap()["k"], 1);
    }
}
