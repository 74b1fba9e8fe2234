//! Pipeline definitions and loading.
//!
//! Pipelines are defined in YAML as a set of stages forming a DAG. Each
//! stage targets a registered tool (scanner, compliance checker, build or
//! deploy executor) and carries its own policy thresholds and retry policy.
//! Dependencies may name a stage or a parallel group.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::error::{OrchestratorError, OrchestratorResult};
use super::policy::Thresholds;

/// A complete pipeline definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineDefinition {
    /// Pipeline name
    pub name: String,

    /// Human-readable description
    #[serde(default)]
    pub description: String,

    /// Stage timeout used when a stage does not set its own
    #[serde(default = "default_stage_timeout")]
    pub default_timeout_seconds: u64,

    /// Stages, in declaration order
    pub stages: Vec<StageDefinition>,
}

fn default_stage_timeout() -> u64 {
    600
}

impl PipelineDefinition {
    /// Load a pipeline from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read pipeline file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a pipeline from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        serde_yaml::from_str(content).context("Failed to parse pipeline YAML")
    }

    /// Validate names, dependencies, thresholds and acyclicity
    pub fn validate(&self) -> OrchestratorResult<()> {
        let invalid = |msg: String| Err(OrchestratorError::InvalidPipeline(msg));

        if self.name.is_empty() {
            return invalid("pipeline name cannot be empty".to_string());
        }

        if self.stages.is_empty() {
            return invalid("pipeline must have at least one stage".to_string());
        }

        let mut names = HashSet::new();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.name.is_empty() {
                return invalid(format!("stage {} has an empty name", i));
            }
            if !names.insert(stage.name.as_str()) {
                return invalid(format!("duplicate stage name '{}'", stage.name));
            }
            if stage.tool.is_empty() {
                return invalid(format!("stage '{}' has no tool", stage.name));
            }
        }

        for group in self.groups().keys() {
            if names.contains(group) {
                return invalid(format!(
                    "group '{}' collides with a stage of the same name",
                    group
                ));
            }
        }

        for stage in &self.stages {
            for dep in &stage.depends_on {
                if dep == &stage.name {
                    return invalid(format!("stage '{}' depends on itself", stage.name));
                }
                if !names.contains(dep.as_str()) && !self.groups().contains_key(dep.as_str()) {
                    return invalid(format!(
                        "stage '{}' depends on unknown stage or group '{}'",
                        stage.name, dep
                    ));
                }
                if stage.group.as_deref() == Some(dep.as_str()) {
                    return invalid(format!(
                        "stage '{}' depends on its own group '{}'",
                        stage.name, dep
                    ));
                }
            }

            if stage.kind != StageKind::Scan && stage.thresholds.has_finding_limits() {
                return invalid(format!(
                    "stage '{}' is a {} stage but sets finding thresholds",
                    stage.name,
                    stage.kind.as_str()
                ));
            }
        }

        self.execution_order().map(|_| ())
    }

    /// Get a stage by name
    pub fn get_stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    /// Get the index of a stage by name
    pub fn stage_index(&self, name: &str) -> Option<usize> {
        self.stages.iter().position(|s| s.name == name)
    }

    /// Group name -> member stage names
    pub fn groups(&self) -> HashMap<&str, Vec<&str>> {
        let mut groups: HashMap<&str, Vec<&str>> = HashMap::new();
        for stage in &self.stages {
            if let Some(group) = &stage.group {
                groups.entry(group.as_str()).or_default().push(stage.name.as_str());
            }
        }
        groups
    }

    /// Direct predecessors of a stage, with group references expanded
    pub fn dependencies_of<'a>(&'a self, stage: &'a StageDefinition) -> Vec<&'a str> {
        let groups = self.groups();
        let mut deps: Vec<&str> = Vec::new();

        for dep in &stage.depends_on {
            match groups.get(dep.as_str()) {
                Some(members) => deps.extend(members.iter().copied()),
                None => deps.push(dep.as_str()),
            }
        }

        deps.retain(|d| *d != stage.name);
        deps.sort_unstable();
        deps.dedup();
        deps
    }

    /// Topological order, stable with respect to declaration order.
    ///
    /// Fails with `InvalidPipeline` naming the stages involved in a cycle.
    pub fn execution_order(&self) -> OrchestratorResult<Vec<&StageDefinition>> {
        let index: HashMap<&str, usize> = self
            .stages
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut in_degree = vec![0usize; self.stages.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.stages.len()];

        for (i, stage) in self.stages.iter().enumerate() {
            for dep in self.dependencies_of(stage) {
                let d = *index.get(dep).ok_or_else(|| {
                    OrchestratorError::InvalidPipeline(format!(
                        "stage '{}' depends on unknown stage '{}'",
                        stage.name, dep
                    ))
                })?;
                in_degree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut ready: BTreeSet<usize> = (0..self.stages.len())
            .filter(|i| in_degree[*i] == 0)
            .collect();
        let mut order = Vec::with_capacity(self.stages.len());

        while let Some(i) = ready.pop_first() {
            order.push(&self.stages[i]);
            for &next in &dependents[i] {
                in_degree[next] -= 1;
                if in_degree[next] == 0 {
                    ready.insert(next);
                }
            }
        }

        if order.len() != self.stages.len() {
            let cyclic: Vec<&str> = self
                .stages
                .iter()
                .enumerate()
                .filter(|(i, _)| in_degree[*i] > 0)
                .map(|(_, s)| s.name.as_str())
                .collect();
            return Err(OrchestratorError::InvalidPipeline(format!(
                "dependency cycle among stages: {}",
                cyclic.join(", ")
            )));
        }

        Ok(order)
    }

    /// Every stage transitively depending on `name`
    pub fn downstream_of(&self, name: &str) -> BTreeSet<String> {
        let mut downstream = BTreeSet::new();
        let mut frontier = vec![name.to_string()];

        while let Some(current) = frontier.pop() {
            for stage in &self.stages {
                if self.dependencies_of(stage).contains(&current.as_str())
                    && downstream.insert(stage.name.clone())
                {
                    frontier.push(stage.name.clone());
                }
            }
        }

        downstream
    }
}

/// Static configuration of one pipeline stage
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDefinition {
    /// Stage name (unique within pipeline)
    pub name: String,

    /// Tool category the stage invokes
    pub kind: StageKind,

    /// Registered tool name
    pub tool: String,

    /// Parallel group this stage belongs to
    #[serde(default)]
    pub group: Option<String>,

    /// May run concurrently with siblings
    #[serde(default = "default_parallel")]
    pub parallel: bool,

    /// Stage or group names that must pass first
    #[serde(default)]
    pub depends_on: Vec<String>,

    /// Pass/fail policy thresholds
    #[serde(default)]
    pub thresholds: Thresholds,

    /// Whether transient adapter failures are retried
    #[serde(default = "default_retryable")]
    pub retryable: bool,

    /// Retry policy for transient failures
    #[serde(default)]
    pub retry_policy: RetryPolicy,

    /// Override timeout (uses the pipeline default if not set)
    pub timeout_seconds: Option<u64>,
}

fn default_parallel() -> bool {
    true
}
fn default_retryable() -> bool {
    true
}

impl StageDefinition {
    /// Get the effective timeout for this stage
    pub fn timeout(&self, default_seconds: u64) -> Duration {
        Duration::from_secs(self.timeout_seconds.unwrap_or(default_seconds))
    }

    /// Whether another attempt is allowed after `attempt` failed
    pub fn should_retry(&self, attempt: u32) -> bool {
        self.retryable && self.retry_policy.should_retry(attempt)
    }
}

/// Tool category a stage invokes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageKind {
    Scan,
    Compliance,
    Build,
    Deploy,
}

impl StageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StageKind::Scan => "scan",
            StageKind::Compliance => "compliance",
            StageKind::Build => "build",
            StageKind::Deploy => "deploy",
        }
    }
}

/// Retry policy for transient stage failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including first try)
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Initial delay between retries in milliseconds
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,

    /// Maximum delay between retries in milliseconds
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier (delay *= multiplier after each retry)
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
}

fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> u64 {
    1000
}
fn default_max_delay() -> u64 {
    30000
}
fn default_backoff_multiplier() -> f64 {
    2.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            backoff_multiplier: default_backoff_multiplier(),
        }
    }
}

impl RetryPolicy {
    /// Calculate delay for a specific attempt (1-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::from_millis(self.initial_delay_ms);
        }

        let delay = self.initial_delay_ms as f64
            * self.backoff_multiplier.powi((attempt - 1) as i32);

        let capped = delay.min(self.max_delay_ms as f64) as u64;
        Duration::from_millis(capped)
    }

    /// Check if we should retry based on attempt count
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}
