//! dstep - displaced-stepping maintenance console
//!
//! Entry point that handles CLI argument parsing, logger setup and the
//! REPL session.

use clap::Parser;

use dstep::app::{AppState, SessionConfig, DEFAULT_PID};
use dstep::logging;
use dstep::ui::cli::run_cli;

/// dstep: displaced-stepping scratch buffer console
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Binary whose entry point anchors the scratch buffers
    #[arg(short, long)]
    target: Option<String>,

    /// Number of displaced-step buffers
    #[arg(short, long, default_value_t = 1)]
    buffers: usize,

    /// Attach to a running process instead of starting the console
    #[arg(short, long, conflicts_with = "target")]
    pid: Option<u32>,

    /// Instructions to step in the attached process
    #[arg(long, default_value_t = 1, requires = "pid")]
    steps: usize,

    /// Print displaced-stepping debug output
    #[arg(long, default_value_t = false)]
    debug_displaced: bool,

    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

impl From<&Args> for SessionConfig {
    fn from(args: &Args) -> Self {
        Self {
            target: args.target.clone(),
            buffer_count: args.buffers,
            debug_displaced: args.debug_displaced,
            pid: DEFAULT_PID,
        }
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
fn run_live(pid: u32, args: &Args) -> anyhow::Result<()> {
    dstep::app::live::run_live(pid, args.buffers, args.steps)
}

#[cfg(not(all(target_os = "linux", target_arch = "x86_64")))]
fn run_live(_pid: u32, _args: &Args) -> anyhow::Result<()> {
    anyhow::bail!("attaching to live processes is only supported on x86-64 Linux")
}

fn main() -> anyhow::Result<()> {
    // 1. Parse command line arguments
    let args = Args::parse();

    // 2. Initialize logger with verbosity level
    logging::init(args.verbose, args.debug_displaced)?;

    log::info!("dstep initialized");
    log::debug!("Target: {:?}", args.target);
    log::debug!("Buffers: {}", args.buffers);

    // 3. Live process: step it and leave
    if let Some(pid) = args.pid {
        return run_live(pid, &args);
    }

    // 4. Set up the session and hand over to the REPL
    let state = AppState::new(SessionConfig::from(&args))?;
    if let Some(binary) = &state.binary {
        println!(
            "[*] {} ({} {}), entry point {:#x}",
            binary.path, binary.format, binary.machine, binary.entry_point
        );
    }
    println!("[*] dstep v{}", env!("CARGO_PKG_VERSION"));

    run_cli(state)
}
