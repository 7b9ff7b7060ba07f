//! mediagraph CLI entry point

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::{generate, Shell};
use mediagraph::{
    commands::{
        cmd_compact, cmd_init, cmd_manifests, cmd_query, cmd_snapshot_build, cmd_status,
        cmd_validate, print_compaction_report, print_manifests, print_query_results,
        print_snapshot, print_status, print_validation, QueryOptions, SnapshotOptions,
    },
    compaction::CompactionOptions,
    config::Config,
    error::{Error, Result},
    progress::LogWriterFactory,
    query::{MetadataFilter, Modality, ScopeFilter, SearchMode},
    registry::{Entity, FileKind},
    storage::Storage,
};
use std::path::PathBuf;
use tracing::error;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "mediagraph")]
#[command(version, about = "Columnar media store with snapshot-based multimodal search", long_about = None)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Output as JSON
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize mediagraph configuration and state
    Init {
        /// Force overwrite existing config
        #[arg(long)]
        force: bool,
    },

    /// Show system status
    Status,

    /// List live manifests
    Manifests {
        /// Only list manifests of this entity (e.g. DocChunk)
        #[arg(long)]
        entity: Option<String>,
    },

    /// Check stored part files of one sub-table against the registry
    Validate {
        /// Entity name (e.g. AudioClip)
        entity: String,

        /// Sub-table kind: core, text, vector or adj_list
        kind: String,
    },

    /// Manage snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotAction,
    },

    /// Query the latest snapshot
    Query {
        /// The search query (may be empty with --image or metadata filters)
        #[arg(default_value = "")]
        query: String,

        /// Maximum number of results
        #[arg(short, long)]
        limit: Option<usize>,

        /// Keyword search instead of semantic search
        #[arg(long, conflicts_with_all = ["hybrid", "image"])]
        keyword: bool,

        /// Fuse semantic and keyword scores
        #[arg(long, conflicts_with = "image")]
        hybrid: bool,

        /// Search with an image file
        #[arg(long)]
        image: Option<PathBuf>,

        /// Restrict to modalities (document, transcript, image, audio, media)
        #[arg(long, value_delimiter = ',')]
        modality: Option<Vec<String>>,

        #[arg(long)]
        tenant: Option<String>,

        #[arg(long)]
        org: Option<String>,

        #[arg(long)]
        site: Option<String>,

        #[arg(long)]
        stream: Option<String>,

        /// MediaAsset media_type filter
        #[arg(long)]
        media_type: Option<String>,

        /// MediaAsset uri prefix filter
        #[arg(long)]
        uri_prefix: Option<String>,
    },

    /// Merge small manifested files
    Compact {
        /// Plan and write audit records only
        #[arg(long)]
        dry_run: bool,

        /// Abort a batch on any row-count mismatch
        #[arg(long)]
        strict: bool,

        /// Skip manifests with missing sub-tables or files
        #[arg(long)]
        skip_missing: bool,

        /// Write every output column as nullable
        #[arg(long)]
        relax_nulls: bool,
    },

    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        #[arg(value_enum)]
        shell: Shell,
    },
}

#[derive(Subcommand)]
enum SnapshotAction {
    /// Build and publish a snapshot from the live manifests
    Build,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        error!("{}", e);
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(LogWriterFactory::default()))
        .with(filter)
        .init();

    if let Commands::Init { force } = cli.command {
        return handle_init(cli.config, force).await;
    }

    if let Commands::Completions { shell } = cli.command {
        let mut cmd = Cli::command();
        generate(shell, &mut cmd, "mediagraph", &mut std::io::stdout());
        return Ok(());
    }

    let config = load_config(cli.config.as_deref())?;
    let storage = Storage::from_config(&config)?;

    match cli.command {
        Commands::Init { .. } | Commands::Completions { .. } => unreachable!(),

        Commands::Status => {
            let status = cmd_status(&config, &storage).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&status)?);
            } else {
                print_status(&status);
            }
        }

        Commands::Manifests { entity } => {
            let entity = entity.as_deref().map(str::parse::<Entity>).transpose()?;
            let manifests = cmd_manifests(&storage, entity).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&manifests)?);
            } else {
                print_manifests(&manifests);
            }
        }

        Commands::Validate { entity, kind } => {
            let entity: Entity = entity.parse()?;
            let kind: FileKind = kind.parse()?;
            let report = cmd_validate(&storage, entity, kind).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_validation(entity, kind, &report);
            }
            report.into_result()?;
        }

        Commands::Snapshot {
            action: SnapshotAction::Build,
        } => {
            let options = SnapshotOptions {
                progress: !cli.json,
            };
            let sidecar = cmd_snapshot_build(&config, &storage, options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&sidecar)?);
            } else {
                print_snapshot(&sidecar);
            }
        }

        Commands::Query {
            query,
            limit,
            keyword,
            hybrid,
            image,
            modality,
            tenant,
            org,
            site,
            stream,
            media_type,
            uri_prefix,
        } => {
            let modalities = modality
                .map(|names| {
                    names
                        .iter()
                        .map(|m| m.parse::<Modality>())
                        .collect::<Result<Vec<_>>>()
                })
                .transpose()?;
            let mode = if keyword {
                Some(SearchMode::Keyword)
            } else if hybrid {
                Some(SearchMode::Hybrid)
            } else {
                None
            };
            let metadata = (media_type.is_some() || uri_prefix.is_some()).then(|| MetadataFilter {
                media_type,
                uri_prefix,
                ..Default::default()
            });

            let options = QueryOptions {
                k: limit,
                mode,
                image,
                modalities,
                scope: ScopeFilter {
                    tenant_id: tenant,
                    org_id: org,
                    site_id: site,
                    stream_id: stream,
                },
                metadata,
            };

            let results = cmd_query(&config, &storage, &query, options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&results)?);
            } else {
                print_query_results(&results);
            }
        }

        Commands::Compact {
            dry_run,
            strict,
            skip_missing,
            relax_nulls,
        } => {
            let options = CompactionOptions {
                dry_run,
                strict,
                skip_missing,
                relax_nulls,
            };
            let report = cmd_compact(&config, &storage, options).await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_compaction_report(&report);
            }
        }
    }

    Ok(())
}

async fn handle_init(config_path: Option<PathBuf>, force: bool) -> Result<()> {
    // A .toml path names the file; anything else names the base directory
    let base_dir = config_path.map(|path| {
        if path.extension().map_or(false, |e| e == "toml") {
            path.parent()
                .map(PathBuf::from)
                .unwrap_or_else(Config::default_base_dir)
        } else {
            path
        }
    });

    let config = cmd_init(base_dir, force).await?;

    println!("✓ mediagraph initialized successfully");
    println!("  Config: {}", config.paths.config_file.display());
    println!("  State database: {}", config.paths.db_file.display());
    println!("\nNext steps:");
    println!("  1. Edit the config file to choose a storage backend");
    println!("  2. Ingest data through the library writer API");
    println!("  3. Build a snapshot: mediagraph snapshot build");

    Ok(())
}

fn load_config(path: Option<&std::path::Path>) -> Result<Config> {
    let config_path = path
        .map(PathBuf::from)
        .unwrap_or_else(Config::default_config_path);

    if !config_path.exists() {
        return Err(Error::Config(format!(
            "Config file not found: {}. Run 'mediagraph init' first.",
            config_path.display()
        )));
    }

    Config::load(&config_path)
}
