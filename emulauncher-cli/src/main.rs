//! Emulauncher CLI

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use emulauncher_lib::environment::parse_override;
use emulauncher_lib::{
    Config, ContainerConfig, ContainerId, Emulator, EmulatorContainer, EmulatorError,
    LaunchRequest, PerformancePreset, ProcessStatus, ProgressFn, ResetConfirmation,
};
use indicatif::{ProgressBar, ProgressStyle};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "emulauncher")]
#[command(about = "Run x86-64 Windows programs on ARM64 through box64 and Wine")]
#[command(version)]
struct Cli {
    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Configuration file (default: ~/.config/emulauncher/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Data directory holding assets, runtimes and containers
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract the translation layer and runtime if missing or outdated
    Init,

    /// Show the detected GPU family and CPU generation
    Detect,

    /// Print the launch environment
    Env {
        /// Performance preset (maximum_performance, balanced, maximum_stability)
        #[arg(long)]
        preset: Option<PerformancePreset>,

        /// Container whose overrides apply
        #[arg(long)]
        container: Option<ContainerId>,
    },

    /// Manage containers
    #[command(subcommand)]
    Containers(ContainersCommand),

    /// Launch a Windows executable
    Launch {
        /// Container to run in (default: the shared container)
        #[arg(long)]
        container: Option<ContainerId>,

        /// Performance preset
        #[arg(long)]
        preset: Option<PerformancePreset>,

        /// Wait for the program to exit and return its exit code
        #[arg(long)]
        wait: bool,

        /// Absolute path of the executable
        executable: PathBuf,

        /// Arguments passed to the executable
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ContainersCommand {
    /// List containers
    List,

    /// Create a container
    Create {
        /// Container id (a fresh id is generated when omitted)
        #[arg(long)]
        id: Option<ContainerId>,

        /// Environment override KEY=VALUE (repeatable)
        #[arg(long = "env", value_name = "KEY=VALUE")]
        env: Vec<String>,

        /// Skip prefix initialization
        #[arg(long)]
        no_init: bool,
    },

    /// Delete a container and everything in it
    Delete { id: ContainerId },

    /// Wipe and re-initialize a container's prefix
    Reset {
        id: ContainerId,

        /// Confirm that the prefix contents will be lost
        #[arg(long)]
        yes: bool,
    },

    /// Show how much disk space a container uses
    Usage { id: ContainerId },
}

fn progress_bar() -> anyhow::Result<(ProgressBar, ProgressFn)> {
    let bar = ProgressBar::new(1000);
    let style = ProgressStyle::default_bar()
        .template("{msg:40!} {bar:40.cyan/blue} {percent:>3}%")
        .context("Progress bar template error")?;
    bar.set_style(style);

    let sink = bar.clone();
    let progress: ProgressFn = Arc::new(move |fraction: f32, message: &str| {
        sink.set_position((fraction * 1000.0) as u64);
        sink.set_message(message.to_string());
    });
    Ok((bar, progress))
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

fn print_container(container: &EmulatorContainer) {
    println!(
        "{:<24} created {:<12} prefix {:<13} {} override(s)",
        container.id(),
        container.created_at(),
        if container.is_prefix_initialized() {
            "initialized"
        } else {
            "uninitialized"
        },
        container.overrides().len()
    );
}

async fn init(emulator: &Emulator) -> anyhow::Result<()> {
    let (bar, progress) = progress_bar()?;
    let report = emulator.initialize(Some(progress)).await;
    bar.finish_and_clear();
    let report = report?;

    for (name, outcome) in [
        ("translation layer", &report.translation),
        ("runtime", &report.runtime),
    ] {
        if outcome.was_extracted() {
            println!("{}: installed", name);
        } else {
            println!("{}: up to date", name);
        }
    }
    Ok(())
}

async fn containers(emulator: &Emulator, command: ContainersCommand) -> anyhow::Result<()> {
    match command {
        ContainersCommand::List => {
            let containers = emulator.list_containers()?;
            if containers.is_empty() {
                println!("No containers");
            }
            for container in &containers {
                print_container(container);
            }
        }
        ContainersCommand::Create { id, env, no_init } => {
            let overrides = env
                .iter()
                .map(|pair| parse_override(pair))
                .collect::<Result<BTreeMap<_, _>, _>>()?;
            let mut config = match id {
                Some(id) if id.is_shared() => ContainerConfig::default(),
                Some(id) => ContainerConfig::named(id),
                None => ContainerConfig::ad_hoc(),
            }
            .with_overrides(overrides);
            if no_init {
                config = config.without_prefix_init();
            }

            let container = emulator.create_container(config).await?;
            print_container(&container);
        }
        ContainersCommand::Delete { id } => {
            emulator.delete_container(&id).await?;
            println!("Deleted container {}", id);
        }
        ContainersCommand::Reset { id, yes } => {
            if !yes {
                bail!(
                    "Resetting {} deletes everything installed in it; re-run with --yes to confirm",
                    id
                );
            }
            let container = emulator
                .reset_container(&id, ResetConfirmation::user_confirmed())
                .await?;
            print_container(&container);
        }
        ContainersCommand::Usage { id } => {
            let bytes = emulator.disk_usage(&id)?;
            println!("{}\t{}", id, format_size(bytes));
        }
    }
    Ok(())
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let mut config = Config::load(cli.config.as_deref())?;
    if let Some(dir) = cli.data_dir {
        config.set_data_dir(dir);
    }
    config.verbosity = cli.verbose;
    debug!("Configuration: {:?}", config);

    let emulator = Emulator::new(config);

    match cli.command {
        Command::Init => init(&emulator).await?,
        Command::Detect => {
            let capability = emulator.capability();
            println!("gpu: {}", capability.gpu);
            println!("cpu_generation: {}", capability.cpu_generation);
        }
        Command::Env { preset, container } => {
            let preset = preset.unwrap_or(emulator.config().default_preset);
            let container = match container {
                Some(id) => emulator.get_container(&id)?,
                None => emulator
                    .get_container(&ContainerId::shared())
                    .unwrap_or_else(|_| {
                        EmulatorContainer::new(
                            ContainerId::shared(),
                            emulator.layout().containers_dir().join("default"),
                        )
                    }),
            };
            print!("{}", emulator.compose_for(preset, &container));
        }
        Command::Containers(command) => containers(&emulator, command).await?,
        Command::Launch {
            container,
            preset,
            wait,
            executable,
            args,
        } => {
            let executable = if executable.is_absolute() {
                executable
            } else {
                std::env::current_dir()?.join(executable)
            };
            let mut request = LaunchRequest::new(executable).with_args(args);
            if let Some(id) = container {
                request = request.in_container(id);
            }
            if let Some(preset) = preset {
                request = request.with_preset(preset);
            }

            let process = emulator.launch_and_confirm(request).await?;
            info!("Started pid {}", process.pid());
            println!("{}", process.pid());

            if wait {
                loop {
                    if let ProcessStatus::Exited(code) =
                        process.wait_for_exit(Duration::from_secs(3600)).await?
                    {
                        return Ok(code.unwrap_or(1));
                    }
                }
            }
        }
    }
    Ok(0)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "emulauncher={level},emulauncher_lib={level}",
            level = log_level
        ))
    });
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match run(cli).await {
        Ok(code) => process::exit(code),
        Err(e) => {
            match e.downcast_ref::<EmulatorError>() {
                Some(err) => eprintln!("Error [{}]: {}", err.code(), err),
                None => eprintln!("Error: {:#}", e),
            }
            process::exit(1);
        }
    }
}
