//! # KnitKit CLI
//!
//! ```bash
//! # List serial ports that look like the machine's board
//! knitkit ports
//!
//! # Run a pattern on the first detected board
//! knitkit run scarf.json
//!
//! # Try a pattern against the built-in simulator
//! knitkit --simulate run scarf.json
//!
//! # Turn to needle 12 over the WiFi bridge, then home
//! knitkit --host 192.168.4.1 move 12
//! knitkit --host 192.168.4.1 home
//! ```

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use knitkit::{
    init_logging, list_ports, load_pattern, CommandResult, Config, ExecutionStatus,
    KnittingController, MachineListener, MachineState, TransportKind, TransportParams,
};
use knitkit_communication::communication::serial::is_candidate_port;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::time::Duration;

const COMMAND_WAIT: Duration = Duration::from_secs(120);

/// KnitKit - circular knitting machine controller
#[derive(Parser, Debug)]
#[command(name = "knitkit")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Config file (JSON or TOML); defaults to the per-user config
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Serial port of the machine
    #[arg(long, global = true, conflicts_with_all = ["host", "simulate"])]
    port: Option<String>,

    /// Host of the WiFi bridge
    #[arg(long, global = true, conflicts_with = "simulate")]
    host: Option<String>,

    /// TCP port of the WiFi bridge
    #[arg(long, global = true)]
    tcp_port: Option<u16>,

    /// Use the in-process simulator instead of hardware
    #[arg(long, global = true)]
    simulate: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List serial ports
    Ports {
        /// Include ports that do not look like a microcontroller
        #[arg(long)]
        all: bool,
    },
    /// Run a pattern file
    Run {
        /// Pattern JSON file
        pattern: PathBuf,
    },
    /// Turn the shortest way to a needle
    Move {
        /// Target needle index
        needle: u32,
    },
    /// Turn back to needle 0
    Home,
    /// Send one raw command line, e.g. `TURN:800:CW`
    Send {
        /// Command line
        command: String,
    },
    /// Print the machine status as JSON
    Status,
    /// Write the default config file
    InitConfig {
        /// Where to write it; defaults to the per-user config path
        path: Option<PathBuf>,
    },
}

fn main() -> anyhow::Result<()> {
    init_logging()?;
    let cli = Cli::parse();

    match &cli.command {
        Commands::Ports { all } => print_ports(*all),
        Commands::InitConfig { path } => {
            let path = match path {
                Some(p) => p.clone(),
                None => knitkit_settings::default_config_path()?,
            };
            Config::default().save_to_file(&path)?;
            println!("Wrote {}", path.display());
            Ok(())
        }
        Commands::Run { pattern } => run_pattern(&cli, pattern),
        Commands::Move { needle } => {
            let controller = connect(&cli)?;
            report(wait_for(controller.move_to_needle(*needle)?)?)?;
            println!("At needle {}", controller.current_needle());
            Ok(())
        }
        Commands::Home => {
            let controller = connect(&cli)?;
            report(wait_for(controller.home()?)?)?;
            println!("At needle {}", controller.current_needle());
            Ok(())
        }
        Commands::Send { command } => {
            let controller = connect(&cli)?;
            report(send(&controller, command)?)
        }
        Commands::Status => {
            let controller = connect(&cli)?;
            report(send(&controller, "STATUS")?)?;
            println!(
                "{}",
                serde_json::to_string_pretty(&controller.status_snapshot())?
            );
            Ok(())
        }
    }
}

fn print_ports(all: bool) -> anyhow::Result<()> {
    let ports = list_ports()?;
    let mut shown = 0;
    for port in ports.iter().filter(|p| all || is_candidate_port(&p.port_name)) {
        println!("{}\t{}", port.port_name, port.description);
        shown += 1;
    }
    if shown == 0 {
        println!("No serial ports found");
    }
    Ok(())
}

fn transport_params(cli: &Cli, config: &Config) -> anyhow::Result<TransportParams> {
    let mut connection = config.connection.clone();
    if cli.simulate {
        connection.transport = TransportKind::Simulated;
    } else if let Some(host) = &cli.host {
        connection.transport = TransportKind::Tcp;
        connection.host = host.clone();
    } else if let Some(port) = &cli.port {
        connection.transport = TransportKind::Serial;
        connection.port = port.clone();
    }
    if let Some(tcp_port) = cli.tcp_port {
        connection.tcp_port = tcp_port;
    }

    if connection.transport == TransportKind::Serial && connection.auto_port() {
        let detected = list_ports()?
            .into_iter()
            .find(|p| is_candidate_port(&p.port_name))
            .context("no serial port found; pass --port, --host or --simulate")?;
        tracing::info!("Auto-detected {}", detected.port_name);
        connection.port = detected.port_name;
    }
    Ok(connection.transport_params())
}

fn connect(cli: &Cli) -> anyhow::Result<KnittingController> {
    let config = Config::load_or_default(cli.config.as_deref())?;
    let params = transport_params(cli, &config)?;
    let controller = KnittingController::new(config.controller_config());
    controller
        .connect(&params)
        .with_context(|| format!("connecting to {}", params.display_target()))?;

    for command in config.machine.setup_commands() {
        report(send(&controller, &command.to_string())?)?;
    }
    Ok(controller)
}

fn send(controller: &KnittingController, command: &str) -> anyhow::Result<CommandResult> {
    let (tx, rx) = mpsc::channel();
    controller.send_raw(
        command,
        Some(Box::new(move |result| {
            let _ = tx.send(result);
        })),
    )?;
    wait_for(rx)
}

fn wait_for(rx: mpsc::Receiver<CommandResult>) -> anyhow::Result<CommandResult> {
    rx.recv_timeout(COMMAND_WAIT)
        .context("no result from the command dispatcher")
}

fn report(result: CommandResult) -> anyhow::Result<()> {
    if !result.is_success() {
        bail!("{}", result.error);
    }
    if !result.response.is_empty() {
        println!("{}", result.response);
    }
    Ok(())
}

struct ProgressPrinter;

impl MachineListener for ProgressPrinter {
    fn on_progress(&self, status: &ExecutionStatus) {
        println!(
            "[{:>5.1}%] {} step {}/{} rep {}/{} eta {}s",
            status.progress_percent(),
            status.pattern_name,
            status.current_step,
            status.total_steps,
            status.current_repetition,
            status.total_repetitions,
            status.estimated_time_remaining.as_secs()
        );
    }

    fn on_error(&self, message: &str) {
        eprintln!("error: {}", message);
    }
}

fn run_pattern(cli: &Cli, path: &Path) -> anyhow::Result<()> {
    let pattern = load_pattern(path).with_context(|| format!("loading {}", path.display()))?;
    let controller = Arc::new(connect(cli)?);
    controller.add_listener(Arc::new(ProgressPrinter));

    let on_interrupt = Arc::clone(&controller);
    std::thread::Builder::new()
        .name("knitkit-signal".to_string())
        .spawn(move || {
            let Ok(runtime) = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            else {
                return;
            };
            if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
                eprintln!("Interrupted, stopping");
                on_interrupt.stop();
            }
        })?;

    controller.execute(pattern)?;
    while !controller.wait_idle(Duration::from_secs(1)) {}

    let status = controller
        .execution_status()
        .context("run finished without a status")?;
    println!(
        "{}: {} of {} needles, {} error(s)",
        status.pattern_name,
        status.needles_completed,
        status.total_needles,
        status.errors.len()
    );
    if controller.state() == MachineState::Error {
        bail!("run aborted");
    }
    controller.disconnect();
    Ok(())
}
