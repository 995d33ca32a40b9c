//! Drive rebuild: reconstruct every file resident on one drive from parity
//! and write it back to the drive's backing store.
//!
//! The same walk serves both the live path (invoked through the control
//! channel while mounted) and the offline path (standalone process over a
//! [`Core`] with no background threads).

use std::fs::{self, OpenOptions, Permissions};
use std::io::{self, BufRead, BufReader, Write};
use std::os::unix::fs::{FileExt, PermissionsExt};
use std::os::unix::net::UnixStream;
use std::path::Path;

use liveraid_codec::AlignedBlock;
use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::time::TimeSpec;

use crate::error::{Error, Result};
use crate::state::{Core, FileRecord};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RebuildReport {
    pub rebuilt: usize,
    pub failed: usize,
    pub skipped: usize,
}

/// Per-file progress, streamed to the control connection or the terminal.
#[derive(Debug)]
pub enum RebuildEvent<'a> {
    Progress { index: usize, total: usize, vpath: &'a str },
    Rebuilt { vpath: &'a str },
    Busy { vpath: &'a str },
    Failed { vpath: &'a str, reason: String },
}

impl Core {
    /// Rebuilds every file resident on `drive_name`. Busy files
    /// (`open_count > 0`) are skipped and can be rebuilt once closed.
    pub fn rebuild_drive(
        &self,
        drive_name: &str,
        emit: &mut dyn FnMut(RebuildEvent<'_>),
    ) -> Result<RebuildReport> {
        let drive = self
            .drives
            .iter()
            .position(|d| d.name == drive_name)
            .ok_or_else(|| Error::Invalid(format!("unknown drive {drive_name:?}")))?;
        if self.parity.is_none() {
            return Err(Error::Invalid("no parity configured".into()));
        }

        let targets: Vec<String> = {
            let state = self.state.read();
            state
                .files
                .iter()
                .filter(|(_, rec)| rec.drive == drive)
                .map(|(vpath, _)| vpath.clone())
                .collect()
        };
        let total = targets.len();
        log::info!("rebuilding {total} files on drive {drive_name}");

        let mut report = RebuildReport::default();
        for (i, vpath) in targets.iter().enumerate() {
            emit(RebuildEvent::Progress { index: i + 1, total, vpath });
            let snapshot = {
                let state = self.state.read();
                state.find_file(vpath).cloned()
            };
            let Some(rec) = snapshot else {
                // Unlinked while we walked; nothing left to rebuild.
                continue;
            };
            if rec.open_count > 0 {
                emit(RebuildEvent::Busy { vpath });
                report.skipped += 1;
                continue;
            }
            match self.rebuild_file(drive, vpath, &rec) {
                Ok(()) => {
                    emit(RebuildEvent::Rebuilt { vpath });
                    report.rebuilt += 1;
                }
                Err(e) => {
                    log::warn!("rebuild of {vpath} failed: {e}");
                    emit(RebuildEvent::Failed { vpath, reason: e.to_string() });
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    fn rebuild_file(&self, drive: usize, vpath: &str, rec: &FileRecord) -> Result<()> {
        let drive_ref = &self.drives[drive];
        self.ensure_parent_dirs(drive_ref, vpath)?;
        let real = drive_ref.real_path(vpath);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&real)?;

        let block_size = self.cfg.block_size as usize;
        let mut block = AlignedBlock::zeroed(block_size);
        let size = rec.size as u64;
        for b in 0..rec.block_count {
            {
                let state = self.state.read();
                self.decode_file_block(&state, drive, rec.pos_start + b, &mut block)?;
            }
            let offset = b as u64 * block_size as u64;
            // The final block carries only the remainder of the file.
            let take = ((size - offset) as usize).min(block_size);
            file.write_all_at(&block[..take], offset)?;
        }
        file.set_len(size)?;
        drop(file);

        fs::set_permissions(&real, Permissions::from_mode(rec.mode & 0o7777))?;
        if let Err(e) = std::os::unix::fs::chown(&real, Some(rec.uid), Some(rec.gid)) {
            log::warn!("restoring ownership of {vpath} failed: {e}");
        }
        let ts = TimeSpec::new(rec.mtime_sec, rec.mtime_nsec);
        if let Err(e) = utimensat(None, &real, &ts, &ts, UtimensatFlags::FollowSymlink) {
            log::warn!("restoring mtime of {vpath} failed: {e}");
        }
        Ok(())
    }
}

/// Writes one rebuild event in the control-channel line format.
pub fn write_event(out: &mut dyn Write, event: &RebuildEvent<'_>) -> io::Result<()> {
    match event {
        RebuildEvent::Progress { index, total, vpath } => {
            writeln!(out, "progress {index} {total} {vpath}")
        }
        RebuildEvent::Rebuilt { vpath } => writeln!(out, "ok {vpath}"),
        RebuildEvent::Busy { vpath } => writeln!(out, "skip {vpath} busy"),
        RebuildEvent::Failed { vpath, reason } => {
            writeln!(out, "fail {vpath} {}", reason.replace('\n', " "))
        }
    }
}

/// Live rebuild client: streams the engine's progress lines to `out`.
/// Returns the process exit code. A connect error means no engine is
/// mounted; the caller falls back to the offline path.
pub fn live_rebuild(ctrl_path: &Path, drive: &str, out: &mut dyn Write) -> io::Result<i32> {
    let mut stream = UnixStream::connect(ctrl_path)?;
    stream.write_all(format!("rebuild {drive}\n").as_bytes())?;
    let mut failed = 0usize;
    for line in BufReader::new(stream).lines() {
        let line = line?;
        writeln!(out, "{line}")?;
        if line.starts_with("fail ") || line.starts_with("error ") {
            failed += 1;
        }
        if let Some(rest) = line.strip_prefix("done ") {
            if let Some(n) = rest.split_whitespace().nth(1).and_then(|t| t.parse::<usize>().ok())
            {
                failed += n;
            }
        }
    }
    Ok(if failed > 0 { 1 } else { 0 })
}
