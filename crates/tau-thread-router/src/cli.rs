use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

fn parse_positive_usize(value: &str) -> Result<usize, String> {
    let parsed = value
        .parse::<usize>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_positive_u64(value: &str) -> Result<u64, String> {
    let parsed = value
        .parse::<u64>()
        .map_err(|error| format!("failed to parse integer: {error}"))?;
    if parsed == 0 {
        return Err("value must be greater than 0".to_string());
    }
    Ok(parsed)
}

fn parse_non_empty(value: &str) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err("value must not be empty".to_string());
    }
    Ok(trimmed.to_string())
}

#[derive(Debug, Parser)]
#[command(
    name = "tau-thread-router",
    about = "Route inbound channel messages into organization conversation threads",
    version
)]
pub(crate) struct Cli {
    #[arg(
        long = "state-dir",
        env = "TAU_THREAD_ROUTER_STATE_DIR",
        default_value = ".tau/thread-routing",
        global = true,
        help = "Directory holding the routing store snapshot and default config"
    )]
    pub state_dir: PathBuf,

    #[arg(
        long,
        env = "TAU_THREAD_ROUTER_CONFIG",
        global = true,
        help = "Routing engine TOML config. Defaults to <state-dir>/routing.toml when present"
    )]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: CliCommand,
}

#[derive(Debug, Subcommand)]
pub(crate) enum CliCommand {
    /// Route one normalized message to an existing thread.
    Route(RouteArgs),
    /// Create a thread for a message, minting a user for unknown senders.
    CreateThread(MessageArgs),
    /// Link an external identifier to a user.
    LinkIdentity(LinkIdentityArgs),
    /// Mark a linked identifier verified, or revoke verification.
    VerifyIdentity(VerifyIdentityArgs),
    /// Run the retry sweeper once, or periodically with --watch.
    Sweep(SweepArgs),
    /// Query the routing decision log.
    Decisions(DecisionsArgs),
    /// List recently updated threads of an organization.
    Threads(ThreadsArgs),
    /// List messages waiting for manual assignment.
    Unassigned(OrganizationArgs),
    /// Assign a parked message to a thread.
    Assign(AssignArgs),
}

#[derive(Debug, Args)]
pub(crate) struct OrganizationArgs {
    #[arg(long, value_parser = parse_non_empty, help = "Organization id")]
    pub organization: String,
}

#[derive(Debug, Args)]
pub(crate) struct MessageArgs {
    #[arg(long, value_parser = parse_non_empty, help = "Organization id")]
    pub organization: String,

    #[arg(
        long = "message-file",
        help = "NormalizedMessage JSON file, or '-' to read stdin"
    )]
    pub message_file: PathBuf,
}

#[derive(Debug, Args)]
pub(crate) struct RouteArgs {
    #[command(flatten)]
    pub message: MessageArgs,

    #[arg(
        long,
        help = "Run the full inbound pipeline: create a thread or queue a retry on miss"
    )]
    pub pipeline: bool,
}

#[derive(Debug, Args)]
pub(crate) struct IdentityArgs {
    #[arg(long, value_parser = parse_non_empty, help = "Organization id")]
    pub organization: String,

    #[arg(long, value_parser = parse_non_empty, help = "Internal user id")]
    pub user: String,

    #[arg(
        long = "type",
        value_parser = ["phone", "email", "platform-id"],
        help = "External identity type"
    )]
    pub identity_type: String,

    #[arg(long, value_parser = parse_non_empty, help = "External identifier value")]
    pub value: String,
}

#[derive(Debug, Args)]
pub(crate) struct LinkIdentityArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    #[arg(long, help = "Mark the identity verified on link")]
    pub verified: bool,
}

#[derive(Debug, Args)]
pub(crate) struct VerifyIdentityArgs {
    #[command(flatten)]
    pub identity: IdentityArgs,

    #[arg(
        long = "expires-in-hours",
        value_parser = parse_positive_u64,
        conflicts_with = "revoke",
        help = "Verification lifetime; omitted means no expiry"
    )]
    pub expires_in_hours: Option<u64>,

    #[arg(long, help = "Clear verification instead of setting it")]
    pub revoke: bool,
}

#[derive(Debug, Args)]
pub(crate) struct SweepArgs {
    #[arg(long, help = "Keep sweeping on an interval until interrupted")]
    pub watch: bool,

    #[arg(
        long = "interval-seconds",
        value_parser = parse_positive_u64,
        requires = "watch",
        help = "Override the configured sweep interval"
    )]
    pub interval_seconds: Option<u64>,
}

#[derive(Debug, Args)]
pub(crate) struct DecisionsArgs {
    #[arg(long, value_parser = parse_non_empty, help = "Organization id; scopes --sender queries")]
    pub organization: Option<String>,

    #[arg(
        long,
        value_parser = parse_non_empty,
        conflicts_with = "thread",
        help = "Decisions for one sender identifier"
    )]
    pub sender: Option<String>,

    #[arg(
        long,
        value_parser = parse_non_empty,
        required_unless_present_any = ["sender", "all_senders"],
        help = "Decisions for one thread id"
    )]
    pub thread: Option<String>,

    #[arg(
        long = "all-senders",
        requires = "organization",
        conflicts_with_all = ["sender", "thread"],
        help = "Every decision of --organization"
    )]
    pub all_senders: bool,

    #[arg(long, value_parser = parse_positive_usize, help = "Page size (capped by config)")]
    pub limit: Option<usize>,

    #[arg(long, help = "Continuation cursor from a previous page")]
    pub cursor: Option<String>,
}

#[derive(Debug, Args)]
pub(crate) struct ThreadsArgs {
    #[arg(long, value_parser = parse_non_empty, help = "Organization id")]
    pub organization: String,

    #[arg(
        long,
        default_value_t = 20,
        value_parser = parse_positive_usize,
        help = "Maximum threads to list"
    )]
    pub limit: usize,
}

#[derive(Debug, Args)]
pub(crate) struct AssignArgs {
    #[arg(long = "pending-id", value_parser = parse_non_empty, help = "Unassigned message id")]
    pub pending_id: String,

    #[arg(long, value_parser = parse_non_empty, help = "Target thread id")]
    pub thread: String,

    #[arg(long = "assigned-by", help = "Operator performing the assignment")]
    pub assigned_by: Option<String>,
}
