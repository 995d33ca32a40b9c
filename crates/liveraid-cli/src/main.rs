use std::io::{Write, stdout};
use std::path::PathBuf;
use std::process::exit;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use nix::sys::signal::{SaFlags, SigAction, SigHandler, SigSet, Signal, sigaction};

use liveraid::{Config, Core, Engine, live_rebuild, send_command, write_event};

#[derive(Debug, Parser)]
#[command(name = "liveraid", version, about = "Merged-drive filesystem engine with erasure-coded parity")]
struct Args {
    /// Configuration file
    #[arg(short, long)]
    config: PathBuf,
    #[arg(short, long)]
    verbose: bool,
    #[command(subcommand)]
    cmd: Command,
}

#[derive(Debug, clap::Subcommand)]
enum Command {
    /// Mount the engine and serve the control channel until interrupted
    Run,
    /// Rebuild every file on a drive from parity (live when mounted,
    /// offline otherwise)
    Rebuild { drive: String },
    /// Verify parity against the data drives
    Scrub {
        /// Rewrite mismatching parity blocks
        #[arg(long)]
        repair: bool,
    },
}

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

extern "C" fn on_signal(_: libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

fn main() {
    let args = Args::parse();
    simple_logger::SimpleLogger::new()
        .with_level(if args.verbose {
            log::LevelFilter::Trace
        } else {
            log::LevelFilter::Warn
        })
        .init()
        .unwrap();

    match run(args) {
        Ok(code) => exit(code),
        Err(e) => {
            eprintln!("error: {e:#}");
            exit(1);
        }
    }
}

fn run(args: Args) -> anyhow::Result<i32> {
    let cfg = Config::load(&args.config).context("loading configuration")?;
    match args.cmd {
        Command::Run => cmd_run(cfg),
        Command::Rebuild { drive } => cmd_rebuild(cfg, &drive),
        Command::Scrub { repair } => cmd_scrub(cfg, repair),
    }
}

fn cmd_run(cfg: Config) -> anyhow::Result<i32> {
    let action = SigAction::new(SigHandler::Handler(on_signal), SaFlags::empty(), SigSet::empty());
    unsafe {
        sigaction(Signal::SIGINT, &action).context("installing SIGINT handler")?;
        sigaction(Signal::SIGTERM, &action).context("installing SIGTERM handler")?;
    }

    let engine = Engine::mount(cfg).context("mounting engine")?;
    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }
    engine.shutdown().context("unmounting engine")?;
    Ok(0)
}

fn cmd_rebuild(cfg: Config, drive: &str) -> anyhow::Result<i32> {
    let ctrl = cfg.control_path();
    let mut out = stdout();
    match live_rebuild(&ctrl, drive, &mut out) {
        Ok(code) => return Ok(code),
        Err(e) => log::debug!("no mounted engine at {}: {e}", ctrl.display()),
    }

    let core = Core::open(cfg).context("loading engine state")?;
    let mut write_err = None;
    let report = core.rebuild_drive(drive, &mut |event| {
        if write_err.is_none() {
            if let Err(e) = write_event(&mut out, &event) {
                write_err = Some(e);
            }
        }
    })?;
    if let Some(e) = write_err {
        return Err(e.into());
    }
    writeln!(out, "done {} {} skipped={}", report.rebuilt, report.failed, report.skipped)?;
    Ok(if report.failed > 0 { 1 } else { 0 })
}

fn cmd_scrub(cfg: Config, repair: bool) -> anyhow::Result<i32> {
    let ctrl = cfg.control_path();
    let command = if repair { "scrub repair" } else { "scrub" };
    let mut out = stdout();
    match send_command(&ctrl, command, &mut out) {
        Ok(()) => return Ok(0),
        Err(e) => log::debug!("no mounted engine at {}: {e}", ctrl.display()),
    }

    let core = Core::open(cfg).context("loading engine state")?;
    let report = core.scrub(repair);
    if repair {
        writeln!(
            out,
            "done {} {} fixed={} errors={}",
            report.positions_checked, report.mismatches, report.fixed, report.read_errors
        )?;
    } else {
        writeln!(
            out,
            "done {} {} errors={}",
            report.positions_checked, report.mismatches, report.read_errors
        )?;
    }
    Ok(0)
}
