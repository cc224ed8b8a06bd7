//! Gatekeeper CLI
//!
//! The `gatekeeper` command inspects a governance configuration offline.
//!
//! ## Commands
//!
//! - `validate`: Parse and validate a configuration, listing warnings
//! - `resolve`: Show which environment a branch deploys to
//! - `authorize`: Check a role's capability on an environment
//! - `decide`: Dry-run a deployment decision against in-memory stores

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use gatekeeper_core::{
    Actor, AuditEntry, AuditFilter, AuthzDecision, BranchResolution, BranchResolver, Capability,
    ConfigWarning, DeploymentRequest, GovernanceConfig, GovernanceDecision, GovernanceEngine,
    LockType, LogNotifier, Role, Stores, CONFIG_ENV,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;

/// Identity used for lock overrides seeded by `decide --lock`.
const DRY_RUN_ADMIN: &str = "gatekeeper-cli";

#[derive(Parser)]
#[command(name = "gatekeeper")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Delivery governance decisions", long_about = None)]
struct Cli {
    /// Path to the governance configuration (TOML)
    #[arg(short, long, global = true, env = CONFIG_ENV, default_value = "gatekeeper.toml")]
    config: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON output and JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Parse and validate the configuration
    Validate,

    /// Resolve a branch to its target environment
    Resolve {
        /// Branch name
        branch: String,

        /// Resolve as a tagged ref
        #[arg(long)]
        tagged: bool,
    },

    /// Check whether a role holds a capability on an environment
    Authorize {
        #[arg(short, long)]
        role: Role,

        #[arg(short, long)]
        environment: String,

        #[arg(short = 'p', long)]
        capability: Capability,
    },

    /// Dry-run a deployment decision
    Decide {
        #[arg(short, long)]
        branch: String,

        #[arg(long)]
        commit: String,

        #[arg(short, long)]
        user: String,

        #[arg(short, long)]
        role: Role,

        /// Release tag, if the ref is tagged
        #[arg(short, long)]
        tag: Option<String>,

        /// Manual lock to apply first, as ENV=TYPE (repeatable)
        #[arg(long = "lock", value_parser = parse_lock_override)]
        locks: Vec<(String, LockType)>,

        /// Evaluate at this instant (RFC 3339) instead of now
        #[arg(long)]
        at: Option<DateTime<Utc>>,

        /// Print the audit entries the decision produced
        #[arg(long)]
        show_audit: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    gatekeeper_core::init_tracing(cli.json, level);

    let config = load_config(&cli.config)?;

    match cli.command {
        Commands::Validate => cmd_validate(&config, cli.json),
        Commands::Resolve { branch, tagged } => cmd_resolve(&config, &branch, tagged, cli.json),
        Commands::Authorize {
            role,
            environment,
            capability,
        } => cmd_authorize(&config, role, &environment, capability, cli.json),
        Commands::Decide {
            branch,
            commit,
            user,
            role,
            tag,
            locks,
            at,
            show_audit,
        } => {
            let mut request = DeploymentRequest::new(branch, commit, user, role);
            if let Some(tag) = tag {
                request = request.with_tag(tag);
            }
            let report = dry_run(config, &request, &locks, at.unwrap_or_else(Utc::now)).await?;
            print_dry_run(&report, show_audit, cli.json)
        }
    }
}

fn load_config(path: &Path) -> Result<GovernanceConfig> {
    GovernanceConfig::load(path)
        .with_context(|| format!("Failed to load configuration from {}", path.display()))
}

fn parse_lock_override(s: &str) -> Result<(String, LockType), String> {
    let (env, lock) = s
        .split_once('=')
        .ok_or_else(|| format!("expected ENV=TYPE, got '{s}'"))?;
    if env.trim().is_empty() {
        return Err(format!("missing environment in '{s}'"));
    }
    let lock: LockType = lock.trim().parse().map_err(|e| format!("{e}"))?;
    Ok((env.trim().to_string(), lock))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Validate the configuration and print its warnings.
fn cmd_validate(config: &GovernanceConfig, json: bool) -> Result<()> {
    let warnings = config.validate().context("Configuration is invalid")?;
    if json {
        let rendered: Vec<String> = warnings.iter().map(ConfigWarning::to_string).collect();
        return print_json(&serde_json::json!({
            "valid": true,
            "branch_rules": config.branch_rules.len(),
            "warnings": rendered,
        }));
    }

    println!("Configuration OK ({} branch rules)", config.branch_rules.len());
    for warning in &warnings {
        println!("  warning: {warning}");
    }
    Ok(())
}

fn cmd_resolve(config: &GovernanceConfig, branch: &str, tagged: bool, json: bool) -> Result<()> {
    let (resolver, _) = BranchResolver::from_rules(config.branch_rules.clone(), config.engine.tie_break)
        .context("Branch rules are invalid")?;
    let resolution = resolver.resolve_ref(branch, tagged);

    match (&resolution, json) {
        (BranchResolution::Matched(m), true) => print_json(&serde_json::json!({
            "branch": branch,
            "environment": m.environment,
            "rule_index": m.rule_index,
            "pattern": m.rule.pattern,
            "specificity": m.specificity.to_string(),
            "rule": m.rule,
        })),
        (BranchResolution::Matched(m), false) => {
            println!(
                "{branch} -> {} (rule #{} '{}', {})",
                m.environment, m.rule_index, m.rule.pattern, m.specificity
            );
            Ok(())
        }
        (BranchResolution::NoMatch, true) => print_json(&serde_json::json!({
            "branch": branch,
            "environment": null,
        })),
        (BranchResolution::NoMatch, false) => {
            println!("{branch} -> no matching rule");
            Ok(())
        }
    }
}

fn cmd_authorize(
    config: &GovernanceConfig,
    role: Role,
    environment: &str,
    capability: Capability,
    json: bool,
) -> Result<()> {
    let decision = config.permissions.authorize(role, environment, capability);
    if json {
        return print_json(&decision);
    }
    match decision {
        AuthzDecision::Allowed => println!("allowed: {role} may {capability} on {environment}"),
        AuthzDecision::Denied { reason_code, reason } => println!("denied ({reason_code}): {reason}"),
    }
    Ok(())
}

/// Result of a dry-run decision.
#[derive(Debug, Serialize)]
struct DryRun {
    decision: GovernanceDecision,
    audit: Vec<AuditEntry>,
}

/// Evaluate one request against fresh in-memory stores.
async fn dry_run(
    config: GovernanceConfig,
    request: &DeploymentRequest,
    locks: &[(String, LockType)],
    now: DateTime<Utc>,
) -> Result<DryRun> {
    let engine = GovernanceEngine::new(config, Stores::in_memory(), Arc::new(LogNotifier))
        .context("Failed to build governance engine")?;

    let admin = Actor::new(DRY_RUN_ADMIN, Role::Admin);
    for (environment, lock_type) in locks {
        engine
            .set_lock(&admin, environment, *lock_type, "dry-run override", None, now)
            .await
            .with_context(|| format!("Failed to apply lock override for {environment}"))?;
    }

    let decision = engine.decide(request, now).await.context("Decision failed")?;
    let mut audit = engine
        .query_audit(AuditFilter::default())
        .collect()
        .await
        .context("Failed to read audit log")?;
    audit.reverse();
    Ok(DryRun { decision, audit })
}

fn print_dry_run(report: &DryRun, show_audit: bool, json: bool) -> Result<()> {
    if json {
        if show_audit {
            return print_json(report);
        }
        return print_json(&report.decision);
    }

    let d = &report.decision;
    println!("Status:      {:?}", d.status);
    println!("Reason:      {}", d.reason_code);
    println!(
        "Environment: {}",
        d.environment.as_deref().unwrap_or("(none)")
    );
    if let Some(id) = &d.approval_request_id {
        println!("Approval:    {id}");
    }
    if show_audit {
        println!();
        for entry in &report.audit {
            println!(
                "{}  {:<24} {:<10} {:?} {}",
                entry.timestamp.to_rfc3339(),
                entry.action,
                entry.user_id,
                entry.result,
                entry.reason_code.as_deref().unwrap_or("-"),
            );
        }
    }
    Ok(())
}
