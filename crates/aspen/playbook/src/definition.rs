//! Playbook definitions: the blueprint for missions.
//!
//! A definition is a step list with dependency edges and conditional
//! transitions. Definitions deserialize from JSON, are validated once into
//! a [`PlaybookGraph`], and are read-only during execution.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PlaybookError;

// ── Identifiers ──────────────────────────────────────────────────────

/// Unique identifier for a playbook definition
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PlaybookId(pub String);

impl PlaybookId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for PlaybookId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique identifier for a step within a playbook
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StepId(pub String);

impl StepId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl std::fmt::Display for StepId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ── Steps and transitions ────────────────────────────────────────────

/// Where control goes after a step resolves
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Transition {
    /// Activate the named step
    Step(StepId),
    /// The mission path ends here
    End,
}

/// One step in a playbook
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StepDefinition {
    pub id: StepId,
    /// Capability the kernel routes the step's task by
    pub capability: aspen_types::CapabilityId,
    /// Payload template; `${param}` placeholders substitute from mission
    /// parameters in string leaves
    pub input_template: Value,
    /// Steps that must reach a terminal state first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<StepId>,
    /// Transition taken on success; `End` when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_success: Option<Transition>,
    /// Recovery transition taken on failure; absent means dependents skip
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_failure: Option<Transition>,
    #[serde(default)]
    pub priority: u32,
    /// Submission budget for retryable failures
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

fn default_max_attempts() -> u32 {
    1
}

impl StepDefinition {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: StepId::new(id),
            capability: aspen_types::CapabilityId::new(capability),
            input_template: Value::Null,
            depends_on: Vec::new(),
            on_success: None,
            on_failure: None,
            priority: 0,
            max_attempts: 1,
        }
    }

    pub fn with_input(mut self, template: Value) -> Self {
        self.input_template = template;
        self
    }

    pub fn with_depends_on(mut self, depends_on: impl IntoIterator<Item = StepId>) -> Self {
        self.depends_on = depends_on.into_iter().collect();
        self
    }

    pub fn with_on_success(mut self, target: impl Into<String>) -> Self {
        self.on_success = Some(Transition::Step(StepId::new(target)));
        self
    }

    pub fn with_on_failure(mut self, target: impl Into<String>) -> Self {
        self.on_failure = Some(Transition::Step(StepId::new(target)));
        self
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    fn failure_target(&self) -> Option<&StepId> {
        match &self.on_failure {
            Some(Transition::Step(id)) => Some(id),
            _ => None,
        }
    }

    fn success_target(&self) -> Option<&StepId> {
        match &self.on_success {
            Some(Transition::Step(id)) => Some(id),
            _ => None,
        }
    }
}

/// A playbook definition: the declarative blueprint for a mission
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PlaybookDefinition {
    pub id: PlaybookId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub steps: Vec<StepDefinition>,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
}

impl PlaybookDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: PlaybookId::generate(),
            name: name.into(),
            description: String::new(),
            steps: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn add_step(mut self, step: StepDefinition) -> Self {
        self.steps.push(step);
        self
    }

    /// Parse a definition from its JSON form
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

// ── Validated graph ──────────────────────────────────────────────────

/// A validated, immutable playbook graph.
///
/// Validation checks step-id uniqueness, reference integrity, and
/// acyclicity; the derived indexes answer readiness queries during
/// execution.
#[derive(Clone, Debug)]
pub struct PlaybookGraph {
    definition: PlaybookDefinition,
    steps: HashMap<StepId, StepDefinition>,
    /// Gating dependencies per step: `depends_on` plus success-edge sources
    effective_deps: HashMap<StepId, HashSet<StepId>>,
    /// Steps reachable only through a failure edge
    conditional: HashSet<StepId>,
    /// Failure-edge sources per conditional step
    failure_sources: HashMap<StepId, HashSet<StepId>>,
}

impl PlaybookGraph {
    /// Validate a definition into an executable graph
    pub fn validate(definition: PlaybookDefinition) -> Result<Self, PlaybookError> {
        if definition.steps.is_empty() {
            return Err(PlaybookError::EmptyPlaybook);
        }

        let mut steps = HashMap::new();
        for step in &definition.steps {
            if steps.insert(step.id.clone(), step.clone()).is_some() {
                return Err(PlaybookError::DuplicateStepId(step.id.clone()));
            }
        }

        // Reference integrity across dependencies and transitions
        for step in &definition.steps {
            for reference in step
                .depends_on
                .iter()
                .chain(step.success_target())
                .chain(step.failure_target())
            {
                if !steps.contains_key(reference) {
                    return Err(PlaybookError::UnknownStepReference(
                        step.id.clone(),
                        reference.clone(),
                    ));
                }
            }
        }

        // Acyclicity over every edge kind
        let mut graph = DiGraph::<&StepId, ()>::new();
        let mut nodes = HashMap::new();
        for step in &definition.steps {
            nodes.insert(step.id.clone(), graph.add_node(&step.id));
        }
        for step in &definition.steps {
            for dep in &step.depends_on {
                graph.add_edge(nodes[dep], nodes[&step.id], ());
            }
            if let Some(target) = step.success_target() {
                graph.add_edge(nodes[&step.id], nodes[target], ());
            }
            if let Some(target) = step.failure_target() {
                graph.add_edge(nodes[&step.id], nodes[target], ());
            }
        }
        if let Err(cycle) = toposort(&graph, None) {
            let step_id = (*graph[cycle.node_id()]).clone();
            return Err(PlaybookError::CycleDetected(step_id));
        }

        // Effective dependencies: explicit depends_on plus success-edge
        // sources, so `a.on_success -> b` gates b even without depends_on.
        let mut effective_deps: HashMap<StepId, HashSet<StepId>> = HashMap::new();
        let mut failure_sources: HashMap<StepId, HashSet<StepId>> = HashMap::new();
        for step in &definition.steps {
            effective_deps
                .entry(step.id.clone())
                .or_default()
                .extend(step.depends_on.iter().cloned());
            if let Some(target) = step.success_target() {
                effective_deps
                    .entry(target.clone())
                    .or_default()
                    .insert(step.id.clone());
            }
            if let Some(target) = step.failure_target() {
                failure_sources
                    .entry(target.clone())
                    .or_default()
                    .insert(step.id.clone());
            }
        }

        // A step reachable only via failure edges runs only when triggered
        let conditional: HashSet<StepId> = failure_sources
            .keys()
            .filter(|id| {
                effective_deps
                    .get(*id)
                    .map(|deps| deps.is_empty())
                    .unwrap_or(true)
            })
            .cloned()
            .collect();

        Ok(Self {
            definition,
            steps,
            effective_deps,
            conditional,
            failure_sources,
        })
    }

    pub fn id(&self) -> &PlaybookId {
        &self.definition.id
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn step(&self, id: &StepId) -> Option<&StepDefinition> {
        self.steps.get(id)
    }

    pub fn step_ids(&self) -> impl Iterator<Item = &StepId> {
        self.definition.steps.iter().map(|step| &step.id)
    }

    pub fn len(&self) -> usize {
        self.definition.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definition.steps.is_empty()
    }

    /// Gating dependencies for a step
    pub fn deps_of<'a>(&'a self, id: &StepId) -> impl Iterator<Item = &'a StepId> + 'a {
        self.effective_deps.get(id).into_iter().flatten()
    }

    /// Whether the step runs only when a failure edge triggers it
    pub fn is_conditional(&self, id: &StepId) -> bool {
        self.conditional.contains(id)
    }

    /// Steps whose failure edge names this step
    pub fn failure_sources_of<'a>(&'a self, id: &StepId) -> impl Iterator<Item = &'a StepId> + 'a {
        self.failure_sources.get(id).into_iter().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn linear_definition() -> PlaybookDefinition {
        PlaybookDefinition::new("release")
            .add_step(StepDefinition::new("plan", "planning"))
            .add_step(
                StepDefinition::new("build", "builds").with_depends_on([StepId::new("plan")]),
            )
            .add_step(
                StepDefinition::new("deploy", "deploys").with_depends_on([StepId::new("build")]),
            )
    }

    #[test]
    fn valid_definition_passes() {
        let graph = PlaybookGraph::validate(linear_definition()).unwrap();
        assert_eq!(graph.len(), 3);
        let deps: Vec<_> = graph.deps_of(&StepId::new("deploy")).collect();
        assert_eq!(deps, vec![&StepId::new("build")]);
    }

    #[test]
    fn empty_definition_is_rejected() {
        let result = PlaybookGraph::validate(PlaybookDefinition::new("empty"));
        assert!(matches!(result, Err(PlaybookError::EmptyPlaybook)));
    }

    #[test]
    fn duplicate_step_ids_are_rejected() {
        let definition = PlaybookDefinition::new("dup")
            .add_step(StepDefinition::new("a", "c"))
            .add_step(StepDefinition::new("a", "c"));
        assert!(matches!(
            PlaybookGraph::validate(definition),
            Err(PlaybookError::DuplicateStepId(_))
        ));
    }

    #[test]
    fn unknown_references_are_rejected() {
        let definition = PlaybookDefinition::new("dangling").add_step(
            StepDefinition::new("a", "c").with_depends_on([StepId::new("ghost")]),
        );
        assert!(matches!(
            PlaybookGraph::validate(definition),
            Err(PlaybookError::UnknownStepReference(_, _))
        ));
    }

    #[test]
    fn cycles_are_rejected() {
        let definition = PlaybookDefinition::new("cyclic")
            .add_step(StepDefinition::new("a", "c").with_depends_on([StepId::new("b")]))
            .add_step(StepDefinition::new("b", "c").with_depends_on([StepId::new("a")]));
        assert!(matches!(
            PlaybookGraph::validate(definition),
            Err(PlaybookError::CycleDetected(_))
        ));
    }

    #[test]
    fn success_edges_gate_their_targets() {
        let definition = PlaybookDefinition::new("chained")
            .add_step(StepDefinition::new("a", "c").with_on_success("b"))
            .add_step(StepDefinition::new("b", "c"));
        let graph = PlaybookGraph::validate(definition).unwrap();
        let deps: Vec<_> = graph.deps_of(&StepId::new("b")).collect();
        assert_eq!(deps, vec![&StepId::new("a")]);
    }

    #[test]
    fn failure_targets_are_conditional() {
        let definition = PlaybookDefinition::new("recovering")
            .add_step(StepDefinition::new("a", "c").with_on_failure("rollback"))
            .add_step(StepDefinition::new("rollback", "c"));
        let graph = PlaybookGraph::validate(definition).unwrap();
        assert!(graph.is_conditional(&StepId::new("rollback")));
        assert!(!graph.is_conditional(&StepId::new("a")));
    }

    #[test]
    fn definitions_load_from_json() {
        let json = r#"{
            "id": "pb-release",
            "name": "Release",
            "steps": [
                {"id": "plan", "capability": "planning", "input_template": {"goal": "${goal}"}},
                {"id": "build", "capability": "builds", "input_template": null,
                 "depends_on": ["plan"], "on_failure": {"step": "notify"}},
                {"id": "notify", "capability": "notifications", "input_template": null}
            ]
        }"#;

        let definition = PlaybookDefinition::from_json(json).unwrap();
        assert_eq!(definition.steps.len(), 3);
        let graph = PlaybookGraph::validate(definition).unwrap();
        assert!(graph.is_conditional(&StepId::new("notify")));
        assert_eq!(
            graph.step(&StepId::new("build")).unwrap().on_failure,
            Some(Transition::Step(StepId::new("notify")))
        );
    }
}
