use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use taskdesk_api::{
    write_structure, DatabaseInspector, MetadataTracker, DEFAULT_INSPECT_TABLES, STRUCTURE_FILE,
};
use taskdesk_history::{SnapshotHistory, DEFAULT_HISTORY_DIR};
use taskdesk_platform::{PlatformClient, PlatformConfig, DEFAULT_SCHEMA, DEFAULT_TIMEOUT_SECS};
use time::OffsetDateTime;
use tracing::info;
use tracing_subscriber::EnvFilter;

const CLI_CONTRACT_VERSION: &str = "cli.v1";

#[derive(Debug, Parser)]
#[command(name = "taskdesk")]
#[command(about = "TaskDesk maintenance tools")]
struct Cli {
    #[arg(long, env = "TASKDESK_PLATFORM_URL", global = true)]
    platform_url: Option<String>,

    #[arg(long, env = "TASKDESK_SERVICE_KEY", hide_env_values = true, global = true)]
    service_key: Option<String>,

    #[arg(long, env = "TASKDESK_SCHEMA", default_value = DEFAULT_SCHEMA, global = true)]
    schema: String,

    #[arg(long, env = "TASKDESK_HISTORY_DIR", default_value = DEFAULT_HISTORY_DIR, global = true)]
    history_dir: PathBuf,

    #[arg(long = "timeout", env = "TASKDESK_HTTP_TIMEOUT_SECS", default_value_t = DEFAULT_TIMEOUT_SECS, global = true)]
    timeout_secs: u64,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    Metadata {
        #[command(subcommand)]
        command: MetadataCommand,
    },
    Db {
        #[command(subcommand)]
        command: DbCommand,
    },
}

#[derive(Debug, Subcommand)]
enum MetadataCommand {
    /// Fetch metadata, save a snapshot, and record changes since the last run.
    Track,
    /// Print recorded changelog entries, newest last.
    Changelog(ChangelogArgs),
    /// List saved snapshot files.
    History,
}

#[derive(Debug, Args)]
struct ChangelogArgs {
    /// Only print the most recent N entries.
    #[arg(long)]
    limit: Option<usize>,
}

#[derive(Debug, Subcommand)]
enum DbCommand {
    /// Profile table contents and write a structure report.
    Inspect(InspectArgs),
}

#[derive(Debug, Args)]
struct InspectArgs {
    #[arg(long = "table", env = "TASKDESK_INSPECT_TABLES", value_delimiter = ',')]
    tables: Vec<String>,
    #[arg(long, default_value = STRUCTURE_FILE)]
    out: PathBuf,
}

impl Cli {
    fn platform_client(&self) -> Result<PlatformClient> {
        let url = self
            .platform_url
            .as_deref()
            .ok_or_else(|| anyhow!("--platform-url (or TASKDESK_PLATFORM_URL) is required"))?;
        let key = self
            .service_key
            .as_deref()
            .ok_or_else(|| anyhow!("--service-key (or TASKDESK_SERVICE_KEY) is required"))?;
        let config = PlatformConfig::new(url, key)
            .context("invalid platform configuration")?
            .with_schema(self.schema.clone())
            .with_timeout_secs(self.timeout_secs);
        Ok(PlatformClient::new(config))
    }

    fn history(&self) -> SnapshotHistory {
        SnapshotHistory::new(&self.history_dir)
    }
}

fn with_contract_version(value: Value) -> Value {
    match value {
        Value::Object(mut object) => {
            object.insert(
                "contract_version".to_string(),
                Value::String(CLI_CONTRACT_VERSION.to_string()),
            );
            Value::Object(object)
        }
        other => serde_json::json!({
            "contract_version": CLI_CONTRACT_VERSION,
            "payload": other
        }),
    }
}

fn emit_json(value: Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(&with_contract_version(value))?);
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    match &cli.command {
        Command::Metadata { command } => run_metadata(&cli, command),
        Command::Db { command } => run_db(&cli, command),
    }
}

fn run_metadata(cli: &Cli, command: &MetadataCommand) -> Result<()> {
    match command {
        MetadataCommand::Track => run_metadata_track(cli),
        MetadataCommand::Changelog(args) => run_metadata_changelog(cli, args),
        MetadataCommand::History => run_metadata_history(cli),
    }
}

fn run_db(cli: &Cli, command: &DbCommand) -> Result<()> {
    match command {
        DbCommand::Inspect(args) => run_db_inspect(cli, args),
    }
}

fn run_metadata_track(cli: &Cli) -> Result<()> {
    let client = cli.platform_client()?;
    info!(platform = %client.config().base_url, schema = %cli.schema, "tracking metadata");
    let tracker = MetadataTracker::new(Arc::new(client), cli.history(), cli.schema.clone());
    let report = tracker.extract_metadata(OffsetDateTime::now_utc())?;
    emit_json(serde_json::to_value(&report).context("failed to serialize extract report")?)
}

fn run_metadata_changelog(cli: &Cli, args: &ChangelogArgs) -> Result<()> {
    let history = cli.history();
    let mut entries = history.load_changelog();
    if let Some(limit) = args.limit {
        let skip = entries.len().saturating_sub(limit);
        entries = entries.split_off(skip);
    }
    emit_json(serde_json::json!({
        "history_dir": history.root().display().to_string(),
        "entries": entries
    }))
}

fn run_metadata_history(cli: &Cli) -> Result<()> {
    let history = cli.history();
    let snapshots = history
        .list_snapshots()?
        .iter()
        .filter_map(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()))
        .collect::<Vec<_>>();
    emit_json(serde_json::json!({
        "history_dir": history.root().display().to_string(),
        "snapshots": snapshots,
        "latest_present": history.latest_path().is_file()
    }))
}

fn run_db_inspect(cli: &Cli, args: &InspectArgs) -> Result<()> {
    let client = cli.platform_client()?;
    let platform_url = client.config().base_url.to_string();
    let tables: Vec<String> = if args.tables.is_empty() {
        DEFAULT_INSPECT_TABLES.iter().map(ToString::to_string).collect()
    } else {
        args.tables.clone()
    };

    let inspector = DatabaseInspector::new(Arc::new(client), platform_url);
    let report = inspector.inspect(&tables, OffsetDateTime::now_utc());
    write_structure(&report.structure, &args.out)?;
    info!(path = %args.out.display(), tables = report.structure.tables.len(), "database structure saved");

    emit_json(serde_json::json!({
        "output_path": args.out.display().to_string(),
        "structure": report.structure,
        "skipped": report.skipped
    }))
}
