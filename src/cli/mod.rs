//! Command-line interface for gatechain.
//!
//! Each subcommand maps to one orchestrator operation. Failures surface as
//! `OrchestratorError`s, which `main` turns into per-error exit codes.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tracing::warn;
use uuid::Uuid;

use crate::adapters::{CommandAdapter, Tool, ToolRegistry, TracingSink, WebhookSink};
use crate::config::{self, ResolvedConfig};
use crate::core::{
    ApprovalOutcome, ApprovalRequest, ApproverRoster, AttestationSigner, KeyRing, Ledger,
    Orchestrator, PipelineDefinition, RiskAcceptance,
};
use crate::domain::{approval_message, override_message, risk_message, Decision, Tier};

/// gatechain - approval-gated, attested pipeline orchestrator
#[derive(Parser, Debug)]
#[command(name = "gatechain")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

/// Signing material for a decision: a precomputed signature or a key file
#[derive(clap::Args, Debug)]
pub struct SignatureArgs {
    /// Hex ed25519 signature over the decision message
    #[arg(long, conflicts_with = "key")]
    pub signature: Option<String>,

    /// Secret key file (hex) to sign the decision message with
    #[arg(long)]
    pub key: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Submit a Change for approval
    Submit {
        /// Revision under review (commit hash, tag, artifact digest)
        revision: String,

        /// Submitter identity
        #[arg(long = "by", env = "GATECHAIN_USER")]
        submitted_by: String,
    },

    /// Record an approval decision for one tier
    Approve {
        change_id: Uuid,

        #[arg(long, value_enum)]
        tier: TierArg,

        #[arg(long, value_enum, default_value = "approve")]
        decision: DecisionArg,

        /// Approver identity (must be in the roster)
        #[arg(long, env = "GATECHAIN_APPROVER")]
        approver: String,

        /// Conditions or rejection reason
        #[arg(long)]
        note: Option<String>,

        #[command(flatten)]
        signing: SignatureArgs,
    },

    /// Execute (or resume) the pipeline of an approved Change
    Run {
        change_id: Uuid,

        /// Wait for approvals before executing
        #[arg(long)]
        wait: bool,
    },

    /// Show approvals, stage statuses and chain verification for a Change
    Status {
        change_id: Uuid,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify the attestation chain of a Change
    Verify {
        change_id: Uuid,

        /// Print every attestation
        #[arg(short, long)]
        verbose: bool,
    },

    /// Abort a Change
    Abort {
        change_id: Uuid,

        #[arg(long, default_value = "aborted by operator")]
        reason: String,
    },

    /// Accept the risk of a policy-failed stage (mission owner)
    AcceptRisk {
        change_id: Uuid,

        #[arg(long)]
        stage: String,

        #[arg(long, env = "GATECHAIN_APPROVER")]
        approver: String,

        /// Justification recorded with the exception
        #[arg(long)]
        note: String,

        #[command(flatten)]
        signing: SignatureArgs,
    },

    /// Reopen a rejected Change (mission owner emergency override)
    Override {
        change_id: Uuid,

        #[arg(long, env = "GATECHAIN_APPROVER")]
        authority: String,

        #[arg(long)]
        reason: String,

        #[command(flatten)]
        signing: SignatureArgs,
    },

    /// List known Changes
    Runs {
        /// Maximum number of runs to show
        #[arg(short, long, default_value = "20")]
        limit: usize,
    },

    /// Generate an ed25519 key pair for an approver
    Keygen {
        /// Where to write the secret key; the public key is written beside it as `.pub`
        #[arg(long)]
        out: PathBuf,
    },

    /// Show resolved configuration (debug)
    Config,
}

/// Approval tier for CLI (maps to Tier)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Peer,
    SecurityGatekeeper,
    MissionOwner,
}

impl From<TierArg> for Tier {
    fn from(t: TierArg) -> Self {
        match t {
            TierArg::Peer => Tier::Peer,
            TierArg::SecurityGatekeeper => Tier::SecurityGatekeeper,
            TierArg::MissionOwner => Tier::MissionOwner,
        }
    }
}

/// Approval decision for CLI (maps to Decision)
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum DecisionArg {
    Approve,
    Reject,
    ConditionallyApprove,
}

impl From<DecisionArg> for Decision {
    fn from(d: DecisionArg) -> Self {
        match d {
            DecisionArg::Approve => Decision::Approve,
            DecisionArg::Reject => Decision::Reject,
            DecisionArg::ConditionallyApprove => Decision::ConditionallyApprove,
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Submit {
                revision,
                submitted_by,
            } => submit(&revision, &submitted_by).await,
            Commands::Approve {
                change_id,
                tier,
                decision,
                approver,
                note,
                signing,
            } => approve(change_id, tier.into(), decision.into(), approver, note, signing).await,
            Commands::Run { change_id, wait } => run(change_id, wait).await,
            Commands::Status { change_id, json } => show_status(change_id, json).await,
            Commands::Verify { change_id, verbose } => verify(change_id, verbose).await,
            Commands::Abort { change_id, reason } => abort(change_id, &reason).await,
            Commands::AcceptRisk {
                change_id,
                stage,
                approver,
                note,
                signing,
            } => accept_risk(change_id, stage, approver, note, signing).await,
            Commands::Override {
                change_id,
                authority,
                reason,
                signing,
            } => emergency_override(change_id, &authority, &reason, signing).await,
            Commands::Runs { limit } => list_runs(limit).await,
            Commands::Keygen { out } => keygen(&out),
            Commands::Config => show_config(),
        }
    }
}

/// Build an orchestrator from the resolved configuration
pub fn build_orchestrator(cfg: &ResolvedConfig) -> Result<Orchestrator> {
    let pipeline = PipelineDefinition::from_file(&cfg.pipeline)?;

    let roster = if cfg.approvers.exists() {
        ApproverRoster::from_file(&cfg.approvers)?
    } else {
        warn!(path = %cfg.approvers.display(), "Approver roster not found; no approver is entitled");
        ApproverRoster::new()
    };

    let mut tools = ToolRegistry::new();
    for (name, tool) in &cfg.tools {
        let adapter = CommandAdapter::from_command_line(name.as_str(), &tool.command, tool.category)
            .with_context(|| format!("Invalid command for tool '{}'", name))?;
        tools.register(name.as_str(), Tool::Command(Arc::new(adapter)));
    }

    let signer = AttestationSigner::load_or_generate(&cfg.signing_key_path())?;
    let keyring = KeyRing::load_dir(&cfg.keys_dir())?;

    let mut builder = Orchestrator::builder(pipeline)
        .ledger(Ledger::new(cfg.changes_dir()))
        .roster(roster)
        .tools(tools)
        .signer(signer)
        .keyring(keyring)
        .sink(Arc::new(TracingSink));

    if let Some(timeout) = cfg.approval_timeout() {
        builder = builder.approval_timeout(timeout);
    }
    if let Some(url) = &cfg.webhook_url {
        builder = builder.sink(Arc::new(WebhookSink::new(url.as_str())));
    }

    Ok(builder.build()?)
}

fn orchestrator() -> Result<Orchestrator> {
    build_orchestrator(config::config()?)
}

/// Resolve a signature from the flags, signing `message` when a key file is given
fn resolve_signature(signing: SignatureArgs, message: &str) -> Result<String> {
    match (signing.signature, signing.key) {
        (Some(signature), _) => Ok(signature),
        (None, Some(path)) => {
            let secret = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read key file: {}", path.display()))?;
            let signer = AttestationSigner::from_hex(&secret)?;
            Ok(signer.sign(message.as_bytes()))
        }
        (None, None) => anyhow::bail!("Provide --signature <hex> or --key <file>"),
    }
}

async fn submit(revision: &str, submitted_by: &str) -> Result<()> {
    let orchestrator = orchestrator()?;
    let run = orchestrator.submit_change(revision, submitted_by).await?;

    println!("{}", run.change.id);
    eprintln!(
        "[Change {} submitted for pipeline '{}'; awaiting peer approval]",
        run.change.revision, run.pipeline
    );
    Ok(())
}

async fn approve(
    change_id: Uuid,
    tier: Tier,
    decision: Decision,
    approver: String,
    note: Option<String>,
    signing: SignatureArgs,
) -> Result<()> {
    let signature = resolve_signature(signing, &approval_message(change_id, tier, decision))?;

    let mut request = ApprovalRequest::new(change_id, tier, decision, approver, signature);
    request.note = note;

    let orchestrator = orchestrator()?;
    match orchestrator.submit_approval(request).await? {
        ApprovalOutcome::Recorded(record) => {
            eprintln!("[{} {} by {}]", record.tier, record.decision, record.approver);
        }
        ApprovalOutcome::AlreadyRecorded(record) => {
            eprintln!(
                "[{} {} by {} was already recorded; nothing appended]",
                record.tier, record.decision, record.approver
            );
        }
    }

    if orchestrator.is_ready_for_execution(change_id).await? {
        eprintln!("[Change {} is ready for execution]", change_id);
    }
    Ok(())
}

async fn run(change_id: Uuid, wait: bool) -> Result<()> {
    let orchestrator = orchestrator()?;

    if wait {
        eprintln!("[Waiting for approvals on {}]", change_id);
        orchestrator.await_approval(change_id).await?;
    }

    let run = orchestrator.run_pipeline(change_id).await?;
    eprintln!("[Change {} {}]", change_id, run.change.state);

    let report = orchestrator.status(change_id).await?;
    println!("{}", report);
    Ok(())
}

async fn show_status(change_id: Uuid, json: bool) -> Result<()> {
    let orchestrator = orchestrator()?;
    let report = orchestrator.status(change_id).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{}", report);
    }
    Ok(())
}

async fn verify(change_id: Uuid, verbose: bool) -> Result<()> {
    let orchestrator = orchestrator()?;
    let verification = orchestrator.verify_chain(change_id).await?;

    if verbose {
        for attestation in orchestrator.attestations(change_id).await? {
            println!(
                "{:>4}  {}  {:<32} {}",
                attestation.index,
                attestation.short_hash(),
                attestation.subject.to_string(),
                attestation.recorded_at.format("%Y-%m-%d %H:%M:%S")
            );
        }
    }

    println!("Chain: {}", verification);
    verification.into_result(change_id)?;
    Ok(())
}

async fn abort(change_id: Uuid, reason: &str) -> Result<()> {
    let orchestrator = orchestrator()?;
    let run = orchestrator.abort(change_id, reason).await?;
    if run.abort_requested.is_some() {
        eprintln!(
            "[Change {} {}; abort requested, the executing process will stop it]",
            change_id, run.change.state
        );
    } else {
        eprintln!("[Change {} {}]", change_id, run.change.state);
    }
    Ok(())
}

async fn accept_risk(
    change_id: Uuid,
    stage: String,
    approver: String,
    note: String,
    signing: SignatureArgs,
) -> Result<()> {
    let signature = resolve_signature(signing, &risk_message(change_id, &stage))?;

    let orchestrator = orchestrator()?;
    let run = orchestrator
        .accept_risk(RiskAcceptance {
            change_id,
            stage: stage.clone(),
            approver,
            note,
            signature,
        })
        .await?;

    eprintln!(
        "[Stage '{}' is {}; resume with `gatechain run {}`]",
        stage,
        run.stage_status(&stage),
        change_id
    );
    Ok(())
}

async fn emergency_override(
    change_id: Uuid,
    authority: &str,
    reason: &str,
    signing: SignatureArgs,
) -> Result<()> {
    let orchestrator = orchestrator()?;

    // The signed message names the rejected tier
    let status = orchestrator.status(change_id).await?;
    let tier = status
        .run
        .pending_rejection()
        .map(|r| r.tier)
        .context("Change has no outstanding rejection to override")?;

    let signature = resolve_signature(signing, &override_message(change_id, tier))?;
    let run = orchestrator
        .emergency_override(change_id, authority, reason, &signature)
        .await?;

    eprintln!("[Change {} reopened: {}]", change_id, run.change.state);
    Ok(())
}

async fn list_runs(limit: usize) -> Result<()> {
    let orchestrator = orchestrator()?;
    let runs = orchestrator.list_runs().await?;

    if runs.is_empty() {
        println!("No changes found");
        return Ok(());
    }

    println!("{:<38} {:<14} {:<18} {:<20}", "CHANGE ID", "REVISION", "STATE", "SUBMITTED");
    println!("{}", "-".repeat(92));

    for run in runs.iter().rev().take(limit) {
        let revision: String = run.change.revision.chars().take(12).collect();
        println!(
            "{:<38} {:<14} {:<18} {:<20}",
            run.change.id,
            revision,
            run.change.state.as_str(),
            run.change.submitted_at.format("%Y-%m-%d %H:%M")
        );
    }

    Ok(())
}

fn keygen(out: &Path) -> Result<()> {
    if out.exists() {
        anyhow::bail!("Refusing to overwrite existing key: {}", out.display());
    }

    let signer = AttestationSigner::load_or_generate(out)?;
    println!("key_id:     {}", signer.key_id());
    println!("public_key: {}", signer.public_hex());
    eprintln!(
        "[Secret key written to {}; add public_key to the approver roster]",
        out.display()
    );
    Ok(())
}

fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("gatechain configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home:       {}", cfg.home.display());
    println!("  Changes:    {}", cfg.changes_dir().display());
    println!("  Keys:       {}", cfg.keys_dir().display());
    println!("  Pipeline:   {}", cfg.pipeline.display());
    println!("  Approvers:  {}", cfg.approvers.display());
    println!();
    match cfg.approval_timeout_hours {
        Some(hours) => println!("Approval timeout: {}h", hours),
        None => println!("Approval timeout: (none)"),
    }
    println!();
    println!("Tools:");
    if cfg.tools.is_empty() {
        println!("  (none configured)");
    } else {
        for (name, tool) in &cfg.tools {
            println!("  {:<20} {:<11} {}", name, tool.category.as_str(), tool.command);
        }
    }
    println!();
    println!(
        "Webhook: {}",
        cfg.webhook_url.as_deref().unwrap_or("(none)")
    );

    Ok(())
}
