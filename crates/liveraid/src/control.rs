//! Control channel: a local stream socket next to the content file, one
//! command per connection. Drives the live rebuild and scrub paths while
//! the filesystem is mounted.

use std::fs;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};

use nix::sys::socket::{Shutdown, shutdown};

use crate::rebuild::{self, RebuildEvent};
use crate::state::Core;

pub(crate) struct ControlServer {
    path: PathBuf,
    listener_fd: RawFd,
    handle: Option<JoinHandle<()>>,
}

impl ControlServer {
    pub fn start(core: Arc<Core>, path: PathBuf) -> io::Result<Self> {
        // A stale socket from an unclean shutdown would fail the bind.
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        let listener_fd = listener.as_raw_fd();
        log::debug!("control channel listening on {}", path.display());
        let handle = thread::Builder::new()
            .name("liveraid-ctrl".into())
            .spawn(move || accept_loop(core, listener))?;
        Ok(Self { path, listener_fd, handle: Some(handle) })
    }

    /// `core.running` must already be cleared; unblocks the acceptor and
    /// removes the socket.
    pub fn stop(&mut self) {
        let _ = shutdown(self.listener_fd, Shutdown::Both);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
        let _ = fs::remove_file(&self.path);
    }
}

fn accept_loop(core: Arc<Core>, listener: UnixListener) {
    for conn in listener.incoming() {
        if !core.running.load(Ordering::Relaxed) {
            break;
        }
        match conn {
            Ok(stream) => {
                let core = Arc::clone(&core);
                let _ = thread::Builder::new()
                    .name("liveraid-ctrl-conn".into())
                    .spawn(move || {
                        if let Err(e) = handle_connection(&core, stream) {
                            log::debug!("control connection ended: {e}");
                        }
                    });
            }
            Err(e) => {
                log::warn!("control accept failed: {e}");
                break;
            }
        }
    }
    log::debug!("control channel closed");
}

fn handle_connection(core: &Core, stream: UnixStream) -> io::Result<()> {
    let mut reader = BufReader::new(stream.try_clone()?);
    let mut line = String::new();
    reader.read_line(&mut line)?;
    let mut out = BufWriter::new(stream);

    let cmd = line.trim_end();
    if let Some(drive) = cmd.strip_prefix("rebuild ") {
        serve_rebuild(core, drive.trim(), &mut out)?;
    } else if cmd == "scrub" {
        match core.request_scrub(false) {
            Some(r) => writeln!(
                out,
                "done {} {} errors={}",
                r.positions_checked, r.mismatches, r.read_errors
            )?,
            None => writeln!(out, "error engine is shutting down")?,
        }
    } else if cmd == "scrub repair" {
        match core.request_scrub(true) {
            Some(r) => writeln!(
                out,
                "done {} {} fixed={} errors={}",
                r.positions_checked, r.mismatches, r.fixed, r.read_errors
            )?,
            None => writeln!(out, "error engine is shutting down")?,
        }
    } else {
        writeln!(out, "error unknown command")?;
    }
    out.flush()
}

fn serve_rebuild(core: &Core, drive: &str, out: &mut BufWriter<UnixStream>) -> io::Result<()> {
    let mut write_err = None;
    let result = core.rebuild_drive(drive, &mut |event: RebuildEvent<'_>| {
        if write_err.is_none() {
            if let Err(e) = rebuild::write_event(out, &event).and_then(|_| out.flush()) {
                write_err = Some(e);
            }
        }
    });
    if let Some(e) = write_err {
        return Err(e);
    }
    match result {
        Ok(report) => writeln!(
            out,
            "done {} {} skipped={}",
            report.rebuilt, report.failed, report.skipped
        ),
        Err(e) => writeln!(out, "error {}", e.to_string().replace('\n', " ")),
    }
}

/// One-shot client: sends `command` and copies the reply lines to `out`.
pub fn send_command(ctrl_path: &Path, command: &str, out: &mut dyn Write) -> io::Result<()> {
    let mut stream = UnixStream::connect(ctrl_path)?;
    stream.write_all(command.as_bytes())?;
    stream.write_all(b"\n")?;
    for line in BufReader::new(stream).lines() {
        writeln!(out, "{}", line?)?;
    }
    Ok(())
}
