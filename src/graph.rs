//! Static event-routing table.
//!
//! The [`EventBus`] maps `(source step, event name)` to the ordered list of
//! [`Binding`]s that should run when that event is emitted. Several bindings
//! under one key is how fan-out is expressed. Entry bindings route external
//! events (raised by the caller) into the first step.
//!
//! The table is filled while a pipeline is declared and never changes after
//! [`PipelineBuilder::build`](crate::pipeline::PipelineBuilder::build).

use crate::error::{PipelineError, Result};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;

/// Opaque id of a step inside one pipeline declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StepHandle(pub(crate) usize);

impl StepHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

impl fmt::Display for StepHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where an event comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Raised by the pipeline caller.
    Entry,
    /// Emitted by a step.
    Step(StepHandle),
}

/// A static routing rule: `(source, event) -> (target, function, parameter)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub source: Endpoint,
    pub event: String,
    pub target: StepHandle,
    pub function: String,
    /// Name of the target function parameter receiving the event data.
    pub parameter: String,
}

/// Ordered binding table with lookup by `(source, event)`.
#[derive(Debug, Default, Clone)]
pub struct EventBus {
    bindings: Vec<Binding>,
    index: HashMap<(Endpoint, String), Vec<usize>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a step-to-step routing entry.
    ///
    /// Several entries may share `(source, event)`. Registering the same
    /// `(source, event, target, function)` twice is a configuration error.
    pub fn bind(
        &mut self,
        source: StepHandle,
        event: impl Into<String>,
        target: StepHandle,
        function: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Result<()> {
        self.insert(Binding {
            source: Endpoint::Step(source),
            event: event.into(),
            target,
            function: function.into(),
            parameter: parameter.into(),
        })
    }

    /// Register an entry point for an external event.
    ///
    /// The table accepts several entries for one event so that `build()` can
    /// report the ambiguity; a built pipeline has exactly one per entry event.
    pub fn bind_entry(
        &mut self,
        event: impl Into<String>,
        target: StepHandle,
        function: impl Into<String>,
        parameter: impl Into<String>,
    ) -> Result<()> {
        self.insert(Binding {
            source: Endpoint::Entry,
            event: event.into(),
            target,
            function: function.into(),
            parameter: parameter.into(),
        })
    }

    fn insert(&mut self, binding: Binding) -> Result<()> {
        let key = (binding.source, binding.event.clone());
        let slots = self.index.entry(key).or_default();
        let duplicate = slots.iter().any(|&i| {
            let existing = &self.bindings[i];
            existing.target == binding.target && existing.function == binding.function
        });
        if duplicate {
            return Err(PipelineError::Configuration(format!(
                "duplicate binding: {:?} --{}--> {}.{}",
                binding.source, binding.event, binding.target, binding.function
            )));
        }
        slots.push(self.bindings.len());
        self.bindings.push(binding);
        Ok(())
    }

    /// Bindings for an event emitted by `source`, in registration order.
    pub fn resolve(&self, source: StepHandle, event: &str) -> Vec<&Binding> {
        self.lookup(Endpoint::Step(source), event)
    }

    /// All entry bindings registered for `event`.
    pub fn entries(&self, event: &str) -> Vec<&Binding> {
        self.lookup(Endpoint::Entry, event)
    }

    fn lookup(&self, source: Endpoint, event: &str) -> Vec<&Binding> {
        self.index
            .get(&(source, event.to_string()))
            .map(|slots| slots.iter().map(|&i| &self.bindings[i]).collect())
            .unwrap_or_default()
    }

    /// Distinct entry event names, in first-registration order.
    pub fn entry_events(&self) -> Vec<&str> {
        let mut seen = HashSet::new();
        self.bindings
            .iter()
            .filter(|b| b.source == Endpoint::Entry)
            .map(|b| b.event.as_str())
            .filter(|e| seen.insert(*e))
            .collect()
    }

    /// Every binding, in registration order.
    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// Groups of bindings that share a `(source, event)` key and fan out to
    /// more than one target.
    pub fn fan_outs(&self) -> Vec<Vec<&Binding>> {
        let mut keys: Vec<&Vec<usize>> = self.index.values().filter(|s| s.len() > 1).collect();
        keys.sort_by_key(|slots| slots[0]);
        keys.into_iter()
            .map(|slots| slots.iter().map(|&i| &self.bindings[i]).collect())
            .collect()
    }

    /// Steps reachable from any entry event by following bindings.
    pub fn reachable_from_entries(&self) -> HashSet<StepHandle> {
        let mut reached = HashSet::new();
        let mut queue: VecDeque<StepHandle> = self
            .bindings
            .iter()
            .filter(|b| b.source == Endpoint::Entry)
            .map(|b| b.target)
            .collect();
        while let Some(step) = queue.pop_front() {
            if !reached.insert(step) {
                continue;
            }
            for b in &self.bindings {
                if b.source == Endpoint::Step(step) && !reached.contains(&b.target) {
                    queue.push_back(b.target);
                }
            }
        }
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(i: usize) -> StepHandle {
        StepHandle(i)
    }

    #[test]
    fn test_resolve_keeps_registration_order() {
        let mut bus = EventBus::new();
        bus.bind(h(0), "Uploaded", h(1), "log", "document").unwrap();
        bus.bind(h(0), "Uploaded", h(2), "read", "document").unwrap();

        let targets: Vec<_> = bus.resolve(h(0), "Uploaded").iter().map(|b| b.target).collect();
        assert_eq!(targets, vec![h(1), h(2)]);
    }

    #[test]
    fn test_resolve_unknown_is_empty() {
        let mut bus = EventBus::new();
        bus.bind(h(0), "Uploaded", h(1), "log", "document").unwrap();
        assert!(bus.resolve(h(0), "Readed").is_empty());
        assert!(bus.resolve(h(1), "Uploaded").is_empty());
    }

    #[test]
    fn test_duplicate_binding_rejected() {
        let mut bus = EventBus::new();
        bus.bind(h(0), "Readed", h(1), "chunk", "document").unwrap();
        let err = bus.bind(h(0), "Readed", h(1), "chunk", "other").unwrap_err();
        assert!(err.is_configuration());
    }

    #[test]
    fn test_same_target_different_function_allowed() {
        let mut bus = EventBus::new();
        bus.bind(h(0), "Readed", h(1), "chunk", "document").unwrap();
        bus.bind(h(0), "Readed", h(1), "rechunk", "document").unwrap();
        assert_eq!(bus.resolve(h(0), "Readed").len(), 2);
    }

    #[test]
    fn test_entry_bindings_are_separate_from_step_bindings() {
        let mut bus = EventBus::new();
        bus.bind_entry("StartProcess", h(0), "upload", "document").unwrap();
        bus.bind_entry("StartProcess", h(1), "read", "document").unwrap();
        assert_eq!(bus.entries("StartProcess").len(), 2);
        assert_eq!(bus.entry_events(), vec!["StartProcess"]);
        assert!(bus.entries("Other").is_empty());
    }

    #[test]
    fn test_fan_outs_grouped() {
        let mut bus = EventBus::new();
        bus.bind(h(0), "Uploaded", h(1), "log", "document").unwrap();
        bus.bind(h(0), "Uploaded", h(2), "read", "document").unwrap();
        bus.bind(h(2), "Readed", h(3), "chunk", "document").unwrap();
        let groups = bus.fan_outs();
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].len(), 2);
    }

    #[test]
    fn test_reachability() {
        let mut bus = EventBus::new();
        bus.bind_entry("StartProcess", h(0), "upload", "document").unwrap();
        bus.bind(h(0), "Uploaded", h(1), "read", "document").unwrap();
        bus.bind(h(1), "Readed", h(0), "upload", "document").unwrap();
        bus.bind(h(3), "Orphaned", h(4), "x", "document").unwrap();

        let reached = bus.reachable_from_entries();
        assert!(reached.contains(&h(0)));
        assert!(reached.contains(&h(1)));
        assert!(!reached.contains(&h(3)));
        assert!(!reached.contains(&h(4)));
    }
}
