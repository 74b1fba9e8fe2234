//! Adapter interfaces for external systems.
//!
//! Scanners, compliance checkers and build/deploy executors are reached
//! only through the traits below. Each returns a normalized report; tool
//! specific formats are translated inside the adapter, never in the core.

pub mod command;
pub mod notify;

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::error::{OrchestratorError, OrchestratorResult};
use crate::core::pipeline::{PipelineDefinition, StageKind};
use crate::domain::{ComplianceReport, ExecutionReport, ScanReport, ToolResult};

pub use command::CommandAdapter;
pub use notify::{ChannelSink, EventSink, TracingSink, WebhookSink};

/// What a tool is asked to do for one stage attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageRequest {
    pub change_id: Uuid,

    /// Revision under test (commit hash, tag, artifact digest)
    pub revision: String,

    pub stage: String,
    pub tool: String,
    pub kind: StageKind,

    /// 1-based attempt number
    pub attempt: u32,
}

/// Security scanner (SAST, DAST, SCA, container, IaC)
#[async_trait]
pub trait Scanner: Send + Sync {
    fn name(&self) -> &str;

    async fn scan(&self, request: &StageRequest) -> Result<ScanReport>;
}

/// Compliance checker returning a boolean verdict
#[async_trait]
pub trait ComplianceChecker: Send + Sync {
    fn name(&self) -> &str;

    async fn check(&self, request: &StageRequest) -> Result<ComplianceReport>;
}

#[async_trait]
pub trait BuildExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn build(&self, request: &StageRequest) -> Result<ExecutionReport>;
}

#[async_trait]
pub trait DeployExecutor: Send + Sync {
    fn name(&self) -> &str;

    async fn deploy(&self, request: &StageRequest) -> Result<ExecutionReport>;
}

/// A registered tool
#[derive(Clone)]
pub enum Tool {
    Scanner(Arc<dyn Scanner>),
    Compliance(Arc<dyn ComplianceChecker>),
    Build(Arc<dyn BuildExecutor>),
    Deploy(Arc<dyn DeployExecutor>),

    /// Subprocess tool; its output shape is only known after it runs
    Command(Arc<CommandAdapter>),
}

impl Tool {
    /// The stage kind this tool serves
    pub fn category(&self) -> StageKind {
        match self {
            Tool::Scanner(_) => StageKind::Scan,
            Tool::Compliance(_) => StageKind::Compliance,
            Tool::Build(_) => StageKind::Build,
            Tool::Deploy(_) => StageKind::Deploy,
            Tool::Command(c) => c.category(),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Tool::Scanner(t) => t.name(),
            Tool::Compliance(t) => t.name(),
            Tool::Build(t) => t.name(),
            Tool::Deploy(t) => t.name(),
            Tool::Command(t) => t.name(),
        }
    }

    /// Invoke the tool and wrap its report as a `ToolResult`
    pub async fn invoke(&self, request: &StageRequest) -> Result<ToolResult> {
        match self {
            Tool::Scanner(t) => t.scan(request).await.map(ToolResult::Scan),
            Tool::Compliance(t) => t.check(request).await.map(ToolResult::Compliance),
            Tool::Build(t) => t.build(request).await.map(ToolResult::Build),
            Tool::Deploy(t) => t.deploy(request).await.map(ToolResult::Deploy),
            Tool::Command(t) => t.run(request).await,
        }
    }
}

impl std::fmt::Debug for Tool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Tool")
            .field("name", &self.name())
            .field("category", &self.category())
            .finish()
    }
}

/// Tool name → tool
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Tool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, tool: Tool) -> &mut Self {
        self.tools.insert(name.into(), tool);
        self
    }

    pub fn scanner(mut self, name: impl Into<String>, scanner: Arc<dyn Scanner>) -> Self {
        self.register(name, Tool::Scanner(scanner));
        self
    }

    pub fn compliance(mut self, name: impl Into<String>, checker: Arc<dyn ComplianceChecker>) -> Self {
        self.register(name, Tool::Compliance(checker));
        self
    }

    pub fn build(mut self, name: impl Into<String>, executor: Arc<dyn BuildExecutor>) -> Self {
        self.register(name, Tool::Build(executor));
        self
    }

    pub fn deploy(mut self, name: impl Into<String>, executor: Arc<dyn DeployExecutor>) -> Self {
        self.register(name, Tool::Deploy(executor));
        self
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.tools.get(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Every stage's tool must be registered under the stage's kind
    pub fn check_pipeline(&self, pipeline: &PipelineDefinition) -> OrchestratorResult<()> {
        for stage in &pipeline.stages {
            let tool = self.get(&stage.tool).ok_or_else(|| {
                OrchestratorError::InvalidPipeline(format!(
                    "stage '{}' uses unregistered tool '{}'",
                    stage.name, stage.tool
                ))
            })?;

            if tool.category() != stage.kind {
                return Err(OrchestratorError::InvalidPipeline(format!(
                    "stage '{}' is a {} stage but tool '{}' is registered as {}",
                    stage.name,
                    stage.kind.as_str(),
                    stage.tool,
                    tool.category().as_str()
                )));
            }
        }
        Ok(())
    }
}
