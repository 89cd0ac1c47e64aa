//! chamberflow CLI - resumable chamber pipeline runs.

use anyhow::{Context, Result};
use chamberflow::models::GeneralSettings;
use chamberflow::{
    discover_identifiers, CheckpointStore, Collaborators, PipelineDriver, RestartScope, RunConfig,
    RunOption, RunOptions, Stage, StagePlan, StageRecord, ToolsConfig,
};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

#[derive(Parser)]
#[command(name = "chamberflow")]
#[command(version)]
#[command(about = "Checkpointed segmentation and tracking pipeline for mother-machine chambers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the run configuration
    #[arg(short, long, global = true, default_value = "settings.ini")]
    settings: PathBuf,

    /// Path to the tool configuration
    #[arg(short, long, global = true, default_value = "tools.toml")]
    tools: PathBuf,

    /// Checkpoint directory (defaults to the directory of the settings file)
    #[arg(long, global = true)]
    checkpoint_dir: Option<PathBuf>,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Discover identifiers and write a new run configuration
    Init {
        /// Folder holding the raw image files
        #[arg(long)]
        folder: PathBuf,

        /// Extension of the raw image files
        #[arg(long, default_value = "tif")]
        file_type: String,

        /// Identifier prefix, e.g. "Pos" for Pos1, Pos2, ...
        #[arg(long, default_value = "Pos")]
        identifier_name: String,

        /// Channels, phase channel first
        #[arg(long, value_delimiter = ',', required = true)]
        channels: Vec<String>,

        #[arg(long, default_value = "both")]
        run_option: RunOption,

        #[arg(long, default_value_t = 0)]
        start_frame: u32,

        #[arg(long, default_value_t = 10)]
        end_frame: u32,

        /// Overwrite an existing run configuration
        #[arg(long)]
        force: bool,
    },

    /// Run or resume the pipeline
    Run {
        /// Re-run every stage of every identifier
        #[arg(long)]
        restart: bool,

        /// Re-run a single identifier
        #[arg(long, conflicts_with = "restart")]
        restart_identifier: Option<String>,

        /// With --restart-identifier: re-run from this stage onwards
        #[arg(long, requires = "restart_identifier")]
        from_stage: Option<Stage>,

        /// Only fill in the run configuration, then delete the working data
        #[arg(long)]
        config_only: bool,

        /// Hide the progress bar
        #[arg(long)]
        no_progress: bool,

        /// Trust checkpoints even if the identifier's settings changed since
        #[arg(long)]
        no_drift_check: bool,
    },

    /// Show the checkpoint state of every stage
    Status,

    /// Clear all checkpoints of an identifier
    Reset { identifier: String },

    /// Validate both configuration files
    Validate,

    /// Show example tool configuration
    Example,
}

fn setup_logging(verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber).context("Failed to set subscriber")
}

fn print_example_tools() {
    let example = r#"# chamberflow tool configuration

# Root of the model weight folders
model_weights_dir = "model_weights"

[splitter]
command = "midap-split-frames"

[cutters.InteractiveCutout]
command = "midap-cut-chamber"
args = ["--cutout-class", "InteractiveCutout"]

[segmenters.OmniSegmentation]
command = "midap-segment-cells"
args = ["--segmentation-class", "OmniSegmentation"]
weights_subdir = "model_weights_omni"

[trackers.DeltaV2Tracking]
command = "midap-track-cells"
args = ["--tracking-class", "DeltaV2Tracking"]

# Optional analyses; leave out to disable
[analysis.segmentation]
command = "midap-segment-analysis"
"#;
    println!("{example}");
}

/// Checkpoints live next to the run configuration unless told otherwise.
fn checkpoint_dir(explicit: Option<PathBuf>, settings: &Path) -> PathBuf {
    explicit.unwrap_or_else(|| match settings.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    })
}

fn load_settings(path: &Path) -> Result<RunConfig> {
    RunConfig::load(path).with_context(|| format!("Failed to load run configuration from {path:?}"))
}

fn load_tools(path: &Path) -> Result<ToolsConfig> {
    ToolsConfig::from_file(path)
        .with_context(|| format!("Failed to load tool configuration from {path:?}"))
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    setup_logging(cli.verbose)?;
    let checkpoint_dir = checkpoint_dir(cli.checkpoint_dir, &cli.settings);

    match cli.command {
        Commands::Example => print_example_tools(),

        Commands::Init {
            folder,
            file_type,
            identifier_name,
            channels,
            run_option,
            start_frame,
            end_frame,
            force,
        } => {
            let folder = fs::canonicalize(&folder)
                .with_context(|| format!("Data folder {folder:?} does not exist"))?;
            let identifiers = discover_identifiers(&folder, &file_type, &identifier_name)
                .context("Failed to discover identifiers")?;

            let mut config = RunConfig::new(
                &cli.settings,
                &GeneralSettings {
                    data_type: "Family_Machine".to_string(),
                    folder_path: folder,
                    file_type,
                    identifier_name,
                    identifiers: identifiers.clone(),
                },
            );
            for identifier in &identifiers {
                config.set_id_section(identifier);
                config.set(identifier, "RunOption", run_option.as_str());
                config.set(identifier, "Channels", channels.join(","));
                config.set(identifier, "StartFrame", start_frame.to_string());
                config.set(identifier, "EndFrame", end_frame.to_string());
            }

            let path = config
                .to_file(None, force)
                .context("Failed to write run configuration (use --force to overwrite)")?;
            println!("Identifiers: {}", identifiers.join(", "));
            println!("Written:     {}", path.display());
        }

        Commands::Run {
            restart,
            restart_identifier,
            from_stage,
            config_only,
            no_progress,
            no_drift_check,
        } => {
            let mut config = load_settings(&cli.settings)?;
            let tools = load_tools(&cli.tools)?;
            let mut store = CheckpointStore::open(&checkpoint_dir)
                .context("Failed to open checkpoint store")?
                .with_drift_check(!no_drift_check);

            let restart = match (restart, restart_identifier) {
                (true, _) => RestartScope::All,
                (false, Some(identifier)) => RestartScope::Identifier {
                    identifier,
                    from: from_stage,
                },
                (false, None) => RestartScope::None,
            };
            let driver = PipelineDriver::new(
                Collaborators::from_tools(&tools),
                RunOptions {
                    restart,
                    config_only,
                    show_progress: !no_progress,
                },
            );

            let summary = driver.run(&mut config, &mut store).map_err(|e| {
                let hint = if e.is_input_error() {
                    "Input data problem, fix it and run again (completed stages are kept)"
                } else {
                    "Pipeline run failed"
                };
                anyhow::Error::new(e).context(hint)
            })?;

            if summary.config_only {
                println!("\n=== Configuration Complete ===");
                println!("Settings:    {}", config.path().display());
            } else {
                println!("\n=== Run Complete ===");
            }
            println!("Executed:    {}", summary.executed.len());
            println!("Skipped:     {}", summary.skipped.len());
        }

        Commands::Status => {
            let config = load_settings(&cli.settings)?;
            let store = CheckpointStore::open(&checkpoint_dir)
                .context("Failed to open checkpoint store")?;

            for identifier in config.identifiers()? {
                let plan = StagePlan::for_identifier(&config, &identifier)?;
                println!("[{identifier}]");
                for stage in plan.stages() {
                    let pass = if stage.is_init() { "init" } else { "full" };
                    let record = StageRecord::new(identifier.as_str(), stage.clone());
                    match store.entry(&record) {
                        Some(entry) if store.has(&record, &config) => println!(
                            "  {pass}  done     {:<24} {}",
                            stage.to_string(),
                            entry.committed_at.format("%Y-%m-%d %H:%M:%S")
                        ),
                        Some(_) => println!("  {pass}  stale    {stage}"),
                        None => println!("  {pass}  pending  {stage}"),
                    }
                }
            }
        }

        Commands::Reset { identifier } => {
            let mut store = CheckpointStore::open(&checkpoint_dir)
                .context("Failed to open checkpoint store")?;
            let removed = store.clear(&identifier)?;
            println!("Cleared {removed} checkpoint(s) of {identifier}");
        }

        Commands::Validate => {
            let config = load_settings(&cli.settings)?;
            let tools = load_tools(&cli.tools)?;
            let collaborators = Collaborators::from_tools(&tools);
            collaborators
                .validate(&config)
                .context("Run configuration names an unknown strategy")?;

            let identifiers = config.identifiers()?;
            info!("Configuration is valid");
            info!("  Data folder: {}", config.folder_path()?.display());
            info!("  Identifiers: {}", identifiers.len());
            for identifier in &identifiers {
                info!(
                    "  {identifier}: {} over {}",
                    config.run_option(identifier)?,
                    config.get(identifier, "Channels")?
                );
            }
            info!("  Cutters:     {}", collaborators.cutters.names().join(", "));
            info!("  Segmenters:  {}", collaborators.segmenters.names().join(", "));
            info!("  Trackers:    {}", collaborators.trackers.names().join(", "));
        }
    }

    Ok(())
}
