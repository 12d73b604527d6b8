//! gqlazy CLI - Compile and fetch lazy GraphQL selections
//!
//! # Usage
//!
//! ```bash
//! # Print the documents compiled from two selection paths
//! gqlazy compile --select 'user(id:1).name' --select 'user(id:1).email'
//!
//! # Fetch them and print the resulting cache snapshot
//! gqlazy fetch --endpoint https://api.example.com/graphql --select 'viewer.login'
//!
//! # Check that a saved snapshot restores cleanly
//! gqlazy snapshot inspect snapshot.json
//!
//! # Write a project config, then print the merged settings
//! gqlazy config init
//! gqlazy config show
//! ```

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use gqlazy_config::{ClientConfig, ConfigLoader, ConfigOverrides, LogFormat};
use gqlazy_core::{
    BuildOptions, Cache, Client, ClientOptions, OperationType, QueryBuilder, ResolveOptions,
    Schema, Selection,
};
use gqlazy_http::HttpFetcher;
use serde_json::json;
use tracing::{info, Level};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::FmtSubscriber;

mod select;

/// gqlazy - Lazy GraphQL client tooling
#[derive(Parser, Debug)]
#[command(name = "gqlazy")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    #[command(flatten)]
    global: GlobalOptions,
}

/// Global options available to all commands
#[derive(Args, Debug, Clone)]
struct GlobalOptions {
    /// Path to configuration file (skips global and local lookup)
    #[arg(long, short = 'c', global = true, env = "GQLAZY_CONFIG")]
    config: Option<PathBuf>,

    /// GraphQL endpoint
    #[arg(long, short = 'e', global = true, env = "GQLAZY_ENDPOINT")]
    endpoint: Option<String>,

    /// Scheduler window in milliseconds
    #[arg(long, global = true)]
    window_ms: Option<u64>,

    /// Disable cache normalization
    #[arg(long, global = true)]
    no_normalization: bool,

    /// Enable verbose output
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    /// Suppress non-essential output
    #[arg(long, short = 'q', global = true)]
    quiet: bool,
}

impl GlobalOptions {
    /// Convert global options to config overrides
    fn to_config_overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            endpoint: self.endpoint.clone(),
            window_ms: self.window_ms,
            normalization: self.no_normalization.then_some(false),
            ..Default::default()
        }
    }

    fn load_config(&self) -> Result<ClientConfig> {
        let overrides = self.to_config_overrides();
        let config = match &self.config {
            Some(path) => {
                let mut config = ConfigLoader::new().load_file(path)?;
                config.apply_overrides(&overrides);
                config.validate()?;
                config
            }
            None => {
                let cwd = std::env::current_dir().context("cannot read current directory")?;
                ConfigLoader::new().load(&cwd, Some(&overrides))?
            }
        };
        Ok(config)
    }
}

/// Selection paths shared by `compile` and `fetch`
#[derive(Args, Debug, Clone)]
struct SelectArgs {
    /// Field path to select, e.g. `user(id:1).friends[0].name` (repeatable)
    #[arg(long, short = 's', required = true)]
    select: Vec<String>,

    /// Operation the paths start from
    #[arg(long, short = 'o', default_value = "query", value_parser = parse_operation)]
    operation: OperationType,

    /// Operation name for the compiled documents
    #[arg(long)]
    operation_name: Option<String>,

    /// JSON schema file used to validate paths and type arguments
    #[arg(long)]
    schema: Option<PathBuf>,
}

fn parse_operation(s: &str) -> Result<OperationType, String> {
    s.parse()
        .map_err(|_| format!("'{}' is not one of query, mutation, subscription", s))
}

impl SelectArgs {
    fn load_schema(&self) -> Result<Option<Schema>> {
        let Some(path) = &self.schema else {
            return Ok(None);
        };
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("cannot read schema {}", path.display()))?;
        Ok(Some(Schema::from_json(&text)?))
    }

    /// Leaf selections for every path under `root`.
    fn selections(&self, root: &Arc<Selection>, schema: Option<&Schema>) -> Result<Vec<Arc<Selection>>> {
        self.select
            .iter()
            .map(|path| {
                let segments = select::parse_path(path)?;
                select::select(root, self.operation, &segments, schema)
            })
            .collect()
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Print the documents compiled from selection paths
    Compile(SelectArgs),

    /// Fetch selection paths and print the cache snapshot
    Fetch(FetchArgs),

    /// Cache snapshot tools
    #[command(subcommand)]
    Snapshot(SnapshotCommand),

    /// Configuration files
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Args, Debug)]
struct FetchArgs {
    #[command(flatten)]
    select: SelectArgs,

    /// Snapshot to restore before fetching
    #[arg(long)]
    restore: Option<PathBuf>,

    /// Write the snapshot to this file instead of stdout
    #[arg(long)]
    snapshot: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum SnapshotCommand {
    /// Validate a snapshot by restoring it and print a summary
    Inspect {
        /// Snapshot file
        file: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    /// Create `.gqlazy/config.toml` in the current directory
    Init,

    /// Print the merged configuration as TOML
    Show,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = cli.global.load_config()?;
    init_logging(&config, &cli.global)?;

    match cli.command {
        Commands::Compile(args) => compile(args, &config),
        Commands::Fetch(args) => fetch(args, &config).await,
        Commands::Snapshot(SnapshotCommand::Inspect { file }) => inspect(&file, &config),
        Commands::Config(ConfigCommand::Init) => {
            let cwd = std::env::current_dir().context("cannot read current directory")?;
            let (path, created) = ConfigLoader::new().init_local(&cwd)?;
            if !created {
                println!("{} already exists", path.display());
            }
            Ok(())
        }
        Commands::Config(ConfigCommand::Show) => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

/// Set up logging from config, with `--verbose` and `--quiet` taking precedence
fn init_logging(config: &ClientConfig, global: &GlobalOptions) -> Result<()> {
    let log_level = if global.quiet {
        Level::ERROR
    } else if global.verbose {
        Level::DEBUG
    } else {
        config.logging.level.parse().unwrap_or(Level::INFO)
    };

    let (writer, ansi) = match &config.logging.file {
        Some(path) => {
            let file = File::create(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            (BoxMakeWriter::new(Mutex::new(file)), false)
        }
        None => (BoxMakeWriter::new(std::io::stderr), true),
    };

    let builder = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(writer)
        .with_ansi(ansi);
    match config.logging.format {
        LogFormat::Text => tracing::subscriber::set_global_default(builder.finish())?,
        LogFormat::Json => tracing::subscriber::set_global_default(builder.json().finish())?,
    }
    Ok(())
}

fn compile(args: SelectArgs, config: &ClientConfig) -> Result<()> {
    let schema = args.load_schema()?;
    let root = Selection::root_with_alias_length(args.operation, config.selection.alias_length);
    let selections = args.selections(&root, schema.as_ref())?;

    let builder = QueryBuilder::new(config.selection.document_cache_size);
    let documents = builder.build(
        &selections,
        &BuildOptions {
            operation_name: args.operation_name.clone(),
        },
    )?;

    for document in documents {
        let output = json!({
            "query": document.query,
            "variables": document.variables,
            "operationName": document.operation_name,
            "hash": document.hash,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
    }
    Ok(())
}

async fn fetch(args: FetchArgs, config: &ClientConfig) -> Result<()> {
    let schema = args.select.load_schema()?;
    let validate = schema.is_some();
    let fetcher = HttpFetcher::new(&config.transport)?;
    info!("Fetching from {}", fetcher.endpoint());

    let client = Client::new(
        schema.unwrap_or_default(),
        Arc::new(fetcher),
        ClientOptions::from(config),
    );
    if let Some(path) = &args.restore {
        client.cache().restore_json(read_json(path)?)?;
    }

    let root = client.root(args.select.operation);
    let schema = validate.then(|| client.schema().as_ref());
    let selections = args.select.selections(root, schema)?;
    let options = ResolveOptions {
        operation_name: args.select.operation_name.clone(),
        ..Default::default()
    };
    client.fetch(selections, &options).await?;

    let snapshot = serde_json::to_string_pretty(&client.cache().to_json())?;
    match &args.snapshot {
        Some(path) => {
            std::fs::write(path, snapshot)
                .with_context(|| format!("cannot write snapshot {}", path.display()))?;
            info!("Snapshot written to {}", path.display());
        }
        None => println!("{}", snapshot),
    }
    Ok(())
}

fn inspect(file: &Path, config: &ClientConfig) -> Result<()> {
    let value = read_json(file)?;
    let version = value.get("version").cloned();
    let cache = Cache::new(ClientOptions::from(config).cache);
    cache
        .restore_json(value)
        .with_context(|| format!("{} is not a valid snapshot", file.display()))?;

    let output = json!({
        "version": version,
        "containers": cache.len(),
        "normalized": cache.normalized_len(),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let text =
        std::fs::read_to_string(path).with_context(|| format!("cannot read {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("{} is not valid JSON", path.display()))
}
