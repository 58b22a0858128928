use std::io::Read;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use serde_json::{json, Value};
use tau_thread_routing::{
    load_routing_engine_config, start_retry_sweeper_scheduler, DecisionFilter, ExternalIdentity,
    ExternalIdentityType, InMemoryRoutingStore, InboundOutcome, NormalizedMessage, RoutingEngine,
    SystemClock, ThreadStore,
};

use crate::cli::{
    AssignArgs, Cli, CliCommand, DecisionsArgs, IdentityArgs, LinkIdentityArgs, MessageArgs,
    OrganizationArgs, RouteArgs, SweepArgs, ThreadsArgs, VerifyIdentityArgs,
};

const ROUTING_STORE_FILE: &str = "routing-store.json";
const ROUTING_CONFIG_FILE: &str = "routing.toml";

pub(crate) async fn run_cli(cli: Cli) -> Result<()> {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| cli.state_dir.join(ROUTING_CONFIG_FILE));
    let config = load_routing_engine_config(&config_path)?;
    let store = Arc::new(InMemoryRoutingStore::open_snapshot(
        &cli.state_dir.join(ROUTING_STORE_FILE),
    )?);
    tracing::debug!(
        snapshot = ?store.snapshot_path(),
        config = %config_path.display(),
        "routing engine opened"
    );
    let engine = RoutingEngine::new(store.clone(), Arc::new(SystemClock), config);

    let output = match cli.command {
        CliCommand::Route(args) => execute_route(&engine, args).await?,
        CliCommand::CreateThread(args) => execute_create_thread(&engine, args).await?,
        CliCommand::LinkIdentity(args) => execute_link_identity(&engine, args).await?,
        CliCommand::VerifyIdentity(args) => execute_verify_identity(&engine, args).await?,
        CliCommand::Sweep(args) => execute_sweep(&engine, args).await?,
        CliCommand::Decisions(args) => execute_decisions(&engine, args).await?,
        CliCommand::Threads(args) => execute_threads(store.as_ref(), args).await?,
        CliCommand::Unassigned(args) => execute_unassigned(&engine, args).await?,
        CliCommand::Assign(args) => execute_assign(&engine, args).await?,
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn to_json(value: &impl Serialize) -> Result<Value> {
    serde_json::to_value(value).context("failed to render command output")
}

fn read_message(path: &Path) -> Result<NormalizedMessage> {
    let raw = if path == Path::new("-") {
        let mut raw = String::new();
        std::io::stdin()
            .read_to_string(&mut raw)
            .context("failed to read message from stdin")?;
        raw
    } else {
        std::fs::read_to_string(path)
            .with_context(|| format!("failed to read message file {}", path.display()))?
    };
    serde_json::from_str(&raw).with_context(|| {
        format!(
            "failed to parse normalized message from {}",
            display_source(path)
        )
    })
}

fn display_source(path: &Path) -> String {
    if path == Path::new("-") {
        "stdin".to_string()
    } else {
        path.display().to_string()
    }
}

fn parse_identity_type(raw: &str) -> Result<ExternalIdentityType> {
    match ExternalIdentityType::parse(raw) {
        Some(identity_type) => Ok(identity_type),
        None => bail!("unsupported identity type '{raw}'"),
    }
}

async fn execute_route(engine: &RoutingEngine, args: RouteArgs) -> Result<Value> {
    let RouteArgs { message, pipeline } = args;
    let MessageArgs {
        organization,
        message_file,
    } = message;
    let message = read_message(&message_file)?;
    let orchestrator = engine.orchestrator();

    if !pipeline {
        return Ok(
            match orchestrator.route_message(&message, &organization).await? {
                Some(result) => json!({ "outcome": "routed", "result": to_json(&result)? }),
                None => json!({ "outcome": "unresolved", "messageId": message.id }),
            },
        );
    }

    Ok(
        match orchestrator
            .process_inbound_message(&message, &organization)
            .await?
        {
            InboundOutcome::Routed(result) => {
                json!({ "outcome": "routed", "result": to_json(&result)? })
            }
            InboundOutcome::Created(result) => {
                json!({ "outcome": "created", "result": to_json(&result)? })
            }
            InboundOutcome::Pending { record_id, reason } => {
                json!({ "outcome": "pending", "recordId": record_id, "reason": reason })
            }
        },
    )
}

async fn execute_create_thread(engine: &RoutingEngine, args: MessageArgs) -> Result<Value> {
    let message = read_message(&args.message_file)?;
    let result = engine
        .orchestrator()
        .create_thread_for_message(&message, &args.organization)
        .await?;
    to_json(&result)
}

async fn execute_link_identity(engine: &RoutingEngine, args: LinkIdentityArgs) -> Result<Value> {
    let LinkIdentityArgs { identity, verified } = args;
    let IdentityArgs {
        organization,
        user,
        identity_type,
        value,
    } = identity;
    let identity_type = parse_identity_type(&identity_type)?;
    let resolver = engine.resolver();
    let mut link = resolver
        .add_external_identity(
            &user,
            ExternalIdentity::unverified(identity_type, value.clone()),
            &organization,
        )
        .await?;
    if verified {
        link = resolver
            .verify_identity(&user, &organization, identity_type, &value, None)
            .await?;
    }
    to_json(&link)
}

async fn execute_verify_identity(
    engine: &RoutingEngine,
    args: VerifyIdentityArgs,
) -> Result<Value> {
    let VerifyIdentityArgs {
        identity,
        expires_in_hours,
        revoke,
    } = args;
    let identity_type = parse_identity_type(&identity.identity_type)?;
    let resolver = engine.resolver();
    let link = if revoke {
        resolver
            .unverify_identity(
                &identity.user,
                &identity.organization,
                identity_type,
                &identity.value,
            )
            .await?
    } else {
        let expires_in = match expires_in_hours {
            Some(hours) => Some(
                i64::try_from(hours)
                    .ok()
                    .and_then(chrono::Duration::try_hours)
                    .context("--expires-in-hours is too large")?,
            ),
            None => None,
        };
        resolver
            .verify_identity(
                &identity.user,
                &identity.organization,
                identity_type,
                &identity.value,
                expires_in,
            )
            .await?
    };
    to_json(&link)
}

async fn execute_sweep(engine: &RoutingEngine, args: SweepArgs) -> Result<Value> {
    if !args.watch {
        let report = engine.sweeper().sweep_once().await?;
        let expired_verifications = engine.resolver().sweep_expired_verifications().await?;
        return Ok(json!({
            "report": to_json(&report)?,
            "expiredVerifications": expired_verifications,
            "maxRetries": engine.sweeper().policy().max_retries,
        }));
    }

    let interval = args
        .interval_seconds
        .map(std::time::Duration::from_secs)
        .unwrap_or_else(|| engine.config().sweep_interval());
    let mut handle = start_retry_sweeper_scheduler(engine.sweeper().clone(), interval)?;
    eprintln!(
        "retry sweeper running every {}s; press Ctrl-C to stop",
        interval.as_secs()
    );
    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    handle.shutdown().await;
    Ok(json!({ "stopped": true, "intervalSeconds": interval.as_secs() }))
}

async fn execute_decisions(engine: &RoutingEngine, args: DecisionsArgs) -> Result<Value> {
    let DecisionsArgs {
        organization,
        sender,
        thread,
        all_senders,
        limit,
        cursor,
    } = args;
    let filter = match (thread, sender, all_senders, organization) {
        (Some(thread_id), None, false, _) => DecisionFilter::Thread(thread_id),
        (None, Some(sender_identifier), false, organization_id) => DecisionFilter::Sender {
            sender_identifier,
            organization_id,
        },
        (None, None, true, Some(organization_id)) => DecisionFilter::Organization(organization_id),
        _ => bail!("choose exactly one of --thread, --sender, or --all-senders"),
    };
    let page = engine.decisions().query(filter, limit, cursor).await?;
    to_json(&page)
}

async fn execute_threads(store: &InMemoryRoutingStore, args: ThreadsArgs) -> Result<Value> {
    let threads = store
        .recent_threads(&args.organization, args.limit)
        .await?;
    to_json(&threads)
}

async fn execute_unassigned(engine: &RoutingEngine, args: OrganizationArgs) -> Result<Value> {
    let pending = engine
        .manual_assignment()
        .list_unassigned_messages(&args.organization)
        .await?;
    to_json(&pending)
}

async fn execute_assign(engine: &RoutingEngine, args: AssignArgs) -> Result<Value> {
    let record = engine
        .manual_assignment()
        .assign_unassigned_message(&args.pending_id, &args.thread, args.assigned_by.as_deref())
        .await?;
    to_json(&record)
}
