use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use vmorch::sequencer::{ConfigurationStep, plan_steps};
use vmorch::{
    CancellationToken, InstanceOptions, InstancePhase, InstanceSpec, OrchestratorOptions,
    ReportMode, Transport, Validator, VmorchError, VmorchRuntime,
};

const HEALTH_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Parser)]
#[command(name = "vmorch", about = "Configure, boot and tear down microVM instances")]
struct Args {
    /// Home directory (default: $VMORCH_HOME or ~/.vmorch)
    #[arg(long, global = true)]
    home: Option<PathBuf>,
    /// Orchestrator options file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    cmd: Cmds,
}

#[derive(Subcommand)]
enum Cmds {
    /// Check an instance spec without touching the host
    Validate {
        spec: PathBuf,
        /// Report every violated field instead of the first
        #[arg(long)]
        collect_all: bool,
        /// Skip kernel, rootfs and drive path probes
        #[arg(long)]
        no_path_check: bool,
    },
    /// Print the configuration requests a spec produces
    Plan { spec: PathBuf },
    /// Launch an instance and keep it running until Ctrl-C
    Launch {
        spec: PathBuf,
        #[arg(long)]
        name: Option<String>,
        /// Control socket of an already running VMM
        #[arg(long, conflicts_with = "tcp")]
        socket: Option<PathBuf>,
        /// TCP address of an already running VMM control surface
        #[arg(long)]
        tcp: Option<String>,
        /// Launch this VMM binary per instance
        #[arg(long)]
        vmm_binary: Option<PathBuf>,
        /// Extra VMM argument (repeatable)
        #[arg(long = "vmm-arg", allow_hyphen_values = true)]
        vmm_args: Vec<String>,
    },
    /// List instances recorded in the audit store
    List,
    /// Print the audit record of one instance as JSON
    Show { instance: String },
    /// Remove a stopped or failed instance
    Remove { instance: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    match args.cmd {
        Cmds::Validate {
            spec,
            collect_all,
            no_path_check,
        } => {
            vmorch::init_stderr_logging();
            let options = load_options(args.home.as_deref(), args.config.as_deref())?;
            cmd_validate(&spec, options, collect_all, no_path_check)
        }
        Cmds::Plan { spec } => {
            vmorch::init_stderr_logging();
            cmd_plan(&spec)
        }
        Cmds::Launch {
            spec,
            name,
            socket,
            tcp,
            vmm_binary,
            vmm_args,
        } => {
            let mut options = load_options(args.home.as_deref(), args.config.as_deref())?;
            if vmm_binary.is_some() {
                options.vmm_binary = vmm_binary;
            }
            options.vmm_args.extend(vmm_args);

            let transport = match (socket, tcp) {
                (Some(path), _) => Some(Transport::unix(path)),
                (None, Some(addr)) => Some(Transport::tcp(addr)),
                (None, None) => None,
            };
            cmd_launch(&spec, options, name, transport).await
        }
        Cmds::List => {
            let runtime = open_runtime(args.home.as_deref(), args.config.as_deref())?;
            cmd_list(&runtime)
        }
        Cmds::Show { instance } => {
            let runtime = open_runtime(args.home.as_deref(), args.config.as_deref())?;
            let record = runtime
                .audit(&instance)?
                .with_context(|| format!("no instance '{}'", instance))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            Ok(())
        }
        Cmds::Remove { instance } => {
            let runtime = open_runtime(args.home.as_deref(), args.config.as_deref())?;
            runtime.remove(&instance)?;
            println!("removed {}", instance);
            Ok(())
        }
    }
}

fn load_options(home: Option<&Path>, config: Option<&Path>) -> Result<OrchestratorOptions> {
    let mut options = match config {
        Some(path) => OrchestratorOptions::from_toml_file(path)?,
        None => OrchestratorOptions::default(),
    };
    if let Some(home) = home {
        options.home_dir = home.to_path_buf();
    }
    if options.home_dir.is_relative() {
        options.home_dir = std::env::current_dir()?.join(&options.home_dir);
    }
    Ok(options)
}

fn open_runtime(home: Option<&Path>, config: Option<&Path>) -> Result<VmorchRuntime> {
    let options = load_options(home, config)?;
    VmorchRuntime::new(options).context("failed to open runtime")
}

fn cmd_validate(
    path: &Path,
    options: OrchestratorOptions,
    collect_all: bool,
    no_path_check: bool,
) -> Result<()> {
    let spec = InstanceSpec::from_file(path)?;

    let mut config = options.validation;
    if collect_all {
        config.report_mode = ReportMode::CollectAll;
    }
    if no_path_check {
        config.check_paths = false;
    }

    match Validator::new(config).validate(&spec) {
        Ok(()) => {
            println!("{}: ok", path.display());
            Ok(())
        }
        Err(VmorchError::ValidationErrors(violations)) => {
            for violation in &violations {
                println!("{}: {}", path.display(), violation);
            }
            bail!("{} invalid field(s)", violations.len())
        }
        Err(e) => Err(e.into()),
    }
}

fn cmd_plan(path: &Path) -> Result<()> {
    let spec = InstanceSpec::from_file(path)?;
    let mut steps = plan_steps(&spec)?;
    steps.push(ConfigurationStep::start()?);

    for (i, step) in steps.iter().enumerate() {
        println!(
            "{:>2}. {:<20} {} {} {}",
            i + 1,
            step.name,
            step.method,
            step.resource,
            step.payload
        );
    }
    Ok(())
}

async fn cmd_launch(
    path: &Path,
    options: OrchestratorOptions,
    name: Option<String>,
    transport: Option<Transport>,
) -> Result<()> {
    let spec = InstanceSpec::from_file(path)?;
    let runtime = VmorchRuntime::new(options).context("failed to open runtime")?;

    let instance = runtime.create(
        spec,
        InstanceOptions {
            name,
            transport,
            control_surface: None,
        },
    )?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        })
    };

    let launched = instance.launch_with_cancel(cancel).await;
    interrupt.abort();
    launched.with_context(|| format!("failed to launch instance {}", instance.id()))?;

    println!("instance {} running ({})", instance.id(), instance.transport());
    for (dev, address) in instance.network().await {
        println!("  {} {}", dev, address);
    }

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(HEALTH_INTERVAL) => {
                if instance.check_health().await? != InstancePhase::Running {
                    bail!(
                        "instance {} failed: {}",
                        instance.id(),
                        instance.state().last_error().unwrap_or("unknown cause")
                    );
                }
            }
        }
    }

    let report = instance.stop().await?;
    println!(
        "instance {} stopped, {} tap device(s) released",
        instance.id(),
        report.released
    );
    for error in &report.release_errors {
        eprintln!("  release failed: {}", error);
    }
    Ok(())
}

fn cmd_list(runtime: &VmorchRuntime) -> Result<()> {
    let infos = runtime.list_info()?;
    if infos.is_empty() {
        println!("no instances");
        return Ok(());
    }

    println!(
        "{:<26}  {:<16}  {:<12}  {:<20}  LAST ERROR",
        "ID", "NAME", "PHASE", "CREATED"
    );
    for info in infos {
        println!(
            "{:<26}  {:<16}  {:<12}  {:<20}  {}",
            info.id,
            info.name.as_deref().unwrap_or("-"),
            info.phase.as_str(),
            info.created_at.format("%Y-%m-%d %H:%M:%S"),
            info.last_error.as_deref().unwrap_or("")
        );
    }
    Ok(())
}
