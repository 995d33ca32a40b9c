//! Virtual-path operations.
//!
//! Every operation takes the engine lock in read or write mode as noted on
//! the method. The external filesystem layer is expected to translate its
//! callbacks one-to-one into these calls and map [`Error`](crate::Error)
//! through [`errno`](crate::Error::errno).

use std::collections::BTreeMap;
use std::fs::{self, DirBuilder, File, OpenOptions, Permissions};
use std::io;
use std::os::unix::fs::{DirBuilderExt, FileExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use liveraid_codec::AlignedBlock;
use nix::sys::stat::{UtimensatFlags, utimensat};
use nix::sys::time::TimeSpec;

use crate::drive::Drive;
use crate::error::{Error, Result};
use crate::state::{Core, DirRecord, FileRecord, State, SymlinkRecord};

bitflags::bitflags! {
    /// Open intent, already reduced from the POSIX accmode by the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const WRITE = 1;
        const TRUNC = 2;
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RenameFlags: u32 {
        const NOREPLACE = 1;
        const EXCHANGE = 2;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    RegularFile,
    Directory,
    Symlink,
}

/// Synthesized attributes for one virtual path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub kind: FileType,
    pub size: u64,
    /// Full st_mode including the file-type bits.
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileType,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StatFs {
    pub block_size: u64,
    pub blocks: u64,
    pub blocks_free: u64,
    pub blocks_avail: u64,
    pub files: u64,
}

/// An open file. A file on a dead drive still opens read-only when parity
/// is configured; reads then go through parity reconstruction.
#[derive(Debug)]
pub struct FileHandle {
    vpath: String,
    kind: HandleKind,
}

#[derive(Debug)]
enum HandleKind {
    Live { file: File },
    DeadDrive,
}

impl FileHandle {
    pub fn vpath(&self) -> &str {
        &self.vpath
    }

    pub fn is_dead_drive(&self) -> bool {
        matches!(self.kind, HandleKind::DeadDrive)
    }
}

fn now() -> (i64, i64) {
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(d) => (d.as_secs() as i64, d.subsec_nanos() as i64),
        Err(_) => (0, 0),
    }
}

fn blocks_for(size: u64, block_size: u64) -> u32 {
    size.div_ceil(block_size) as u32
}

fn validate_vpath(vpath: &str) -> Result<()> {
    if !vpath.starts_with('/') || vpath.len() < 2 || vpath.ends_with('/') {
        return Err(Error::Invalid(format!("bad virtual path {vpath:?}")));
    }
    Ok(())
}

fn set_path_times(path: &Path, mtime_sec: i64, mtime_nsec: i64) -> io::Result<()> {
    let ts = TimeSpec::new(mtime_sec, mtime_nsec);
    utimensat(None, path, &ts, &ts, UtimensatFlags::FollowSymlink)
        .map_err(|e| io::Error::from_raw_os_error(e as i32))
}

impl Core {
    /// getattr. Read lock.
    pub fn getattr(&self, vpath: &str) -> Result<Attr> {
        let state = self.state.read();
        if vpath != "/" {
            if let Some(rec) = state.find_file(vpath) {
                let real = self.drives[rec.drive].real_path(vpath);
                return Ok(match fs::metadata(&real) {
                    Ok(meta) => Attr {
                        kind: FileType::RegularFile,
                        size: meta.len(),
                        mode: meta.mode(),
                        uid: meta.uid(),
                        gid: meta.gid(),
                        mtime_sec: meta.mtime(),
                        mtime_nsec: meta.mtime_nsec(),
                    },
                    // Dead drive: fall back to the stored metadata.
                    Err(_) => Attr {
                        kind: FileType::RegularFile,
                        size: rec.size as u64,
                        mode: rec.mode,
                        uid: rec.uid,
                        gid: rec.gid,
                        mtime_sec: rec.mtime_sec,
                        mtime_nsec: rec.mtime_nsec,
                    },
                });
            }
            if let Some(rec) = state.symlinks.get(vpath) {
                return Ok(Attr {
                    kind: FileType::Symlink,
                    size: rec.target.len() as u64,
                    mode: libc::S_IFLNK | 0o777,
                    uid: rec.uid,
                    gid: rec.gid,
                    mtime_sec: rec.mtime_sec,
                    mtime_nsec: rec.mtime_nsec,
                });
            }
        }
        if let Some(rec) = state.dirs.get(vpath) {
            return Ok(Attr {
                kind: FileType::Directory,
                size: 0,
                mode: rec.mode,
                uid: rec.uid,
                gid: rec.gid,
                mtime_sec: rec.mtime_sec,
                mtime_nsec: rec.mtime_nsec,
            });
        }
        for drive in &self.drives {
            if let Ok(meta) = fs::metadata(drive.real_path(vpath)) {
                if meta.is_dir() {
                    return Ok(Attr {
                        kind: FileType::Directory,
                        size: 0,
                        mode: meta.mode(),
                        uid: meta.uid(),
                        gid: meta.gid(),
                        mtime_sec: meta.mtime(),
                        mtime_nsec: meta.mtime_nsec(),
                    });
                }
            }
        }
        if vpath == "/" || is_synthetic_dir(&state, vpath) {
            return Ok(Attr {
                kind: FileType::Directory,
                size: 0,
                mode: libc::S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                mtime_sec: 0,
                mtime_nsec: 0,
            });
        }
        Err(Error::NotFound(vpath.to_string()))
    }

    /// open. Takes the write lock to bump `open_count`.
    pub fn open(&self, vpath: &str, flags: OpenFlags) -> Result<FileHandle> {
        validate_vpath(vpath)?;
        let drive = {
            let mut state = self.state.write();
            let rec = state
                .files
                .get_mut(vpath)
                .ok_or_else(|| Error::NotFound(vpath.to_string()))?;
            rec.open_count += 1;
            rec.drive
        };
        let real = self.drives[drive].real_path(vpath);
        let result = OpenOptions::new()
            .read(true)
            .write(flags.contains(OpenFlags::WRITE))
            .open(&real);
        match result {
            Ok(file) => {
                if flags.contains(OpenFlags::TRUNC) {
                    file.set_len(0)?;
                    let mut state = self.state.write();
                    self.release_blocks(&mut state, vpath, 0)?;
                }
                Ok(FileHandle { vpath: vpath.to_string(), kind: HandleKind::Live { file } })
            }
            Err(e) => {
                let dead = matches!(e.kind(), io::ErrorKind::NotFound)
                    || matches!(
                        e.raw_os_error(),
                        Some(libc::EIO) | Some(libc::ENXIO) | Some(libc::ENODEV)
                    );
                if dead && self.parity.is_some() && !flags.contains(OpenFlags::WRITE) {
                    log::debug!("{vpath}: backing store unreadable, serving through parity");
                    Ok(FileHandle { vpath: vpath.to_string(), kind: HandleKind::DeadDrive })
                } else {
                    if let Some(rec) = self.state.write().files.get_mut(vpath) {
                        rec.open_count = rec.open_count.saturating_sub(1);
                    }
                    Err(e.into())
                }
            }
        }
    }

    /// release. Write lock.
    pub fn release(&self, handle: FileHandle) {
        let mut state = self.state.write();
        if let Some(rec) = state.files.get_mut(&handle.vpath) {
            rec.open_count = rec.open_count.saturating_sub(1);
        }
    }

    /// read. Falls back to parity reconstruction on EIO or a dead-drive
    /// handle. Read lock (parity path only).
    pub fn read(&self, handle: &FileHandle, offset: u64, buf: &mut [u8]) -> Result<usize> {
        match &handle.kind {
            HandleKind::Live { file } => match file.read_at(buf, offset) {
                Ok(n) => Ok(n),
                Err(e) if e.raw_os_error() == Some(libc::EIO) => {
                    log::debug!("{}: read error, reconstructing from parity", handle.vpath);
                    self.read_via_parity(&handle.vpath, offset, buf)
                }
                Err(e) => Err(e.into()),
            },
            HandleKind::DeadDrive => self.read_via_parity(&handle.vpath, offset, buf),
        }
    }

    fn read_via_parity(&self, vpath: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let state = self.state.read();
        let rec = state
            .find_file(vpath)
            .ok_or_else(|| Error::NotFound(vpath.to_string()))?;
        let size = rec.size as u64;
        if offset >= size {
            return Ok(0);
        }
        let want = buf.len().min((size - offset) as usize);
        let block_size = self.cfg.block_size as u64;
        let mut block = AlignedBlock::zeroed(block_size as usize);
        let mut done = 0usize;
        while done < want {
            let abs = offset + done as u64;
            let block_index = (abs / block_size) as u32;
            let inner = (abs % block_size) as usize;
            let take = (block_size as usize - inner).min(want - done);
            match self.decode_file_block(&state, rec.drive, rec.pos_start + block_index, &mut block)
            {
                Ok(()) => {
                    buf[done..done + take].copy_from_slice(&block[inner..inner + take]);
                    done += take;
                }
                // Partial success is returned.
                Err(e) => return if done > 0 { Ok(done) } else { Err(e) },
            }
        }
        Ok(done)
    }

    /// write. Rejected on dead-drive handles; takes the write lock for the
    /// position bookkeeping after the data lands in the backing file.
    pub fn write(&self, handle: &FileHandle, offset: u64, data: &[u8]) -> Result<usize> {
        let file = match &handle.kind {
            HandleKind::Live { file } => file,
            HandleKind::DeadDrive => {
                return Err(Error::Io(io::Error::from_raw_os_error(libc::EIO)));
            }
        };
        file.write_all_at(data, offset)?;
        if data.is_empty() {
            return Ok(0);
        }

        let mut state = self.state.write();
        // The record is gone when the file was unlinked while open; the
        // write still succeeded on the (anonymous) backing inode.
        if state.files.get(&handle.vpath).is_none() {
            return Ok(data.len());
        }
        let end = offset + data.len() as u64;
        let block_size = self.cfg.block_size as u64;
        let rec = &state.files[&handle.vpath];
        let new_blocks = blocks_for(end.max(rec.size as u64), block_size);
        if new_blocks > rec.block_count {
            self.grow_allocation(&mut state, &handle.vpath, new_blocks)?;
        }
        let rec = state.files.get_mut(&handle.vpath).unwrap();
        if end > rec.size as u64 {
            rec.size = end as i64;
        }
        let pos_start = rec.pos_start;
        let first = (offset / block_size) as u32;
        let last = ((end - 1) / block_size) as u32;
        self.mark_dirty_range(pos_start + first, last - first + 1);
        Ok(data.len())
    }

    /// Grows a file's position range to `new_blocks`: in place when it abuts
    /// the high-water mark, otherwise a fresh allocation, otherwise
    /// free-and-reallocate. Marks every affected position dirty.
    fn grow_allocation(&self, state: &mut State, vpath: &str, new_blocks: u32) -> Result<()> {
        let rec = &state.files[vpath];
        let (drive, pos_start, old_blocks) = (rec.drive, rec.pos_start, rec.block_count);
        let delta = new_blocks - old_blocks;
        let alloc = &mut state.allocators[drive];

        let new_start = if old_blocks == 0 {
            let start = alloc.alloc(new_blocks)?;
            self.mark_dirty_range(start, new_blocks);
            start
        } else if alloc.try_extend(pos_start + old_blocks, delta) {
            self.mark_dirty_range(pos_start + old_blocks, delta);
            pos_start
        } else {
            alloc.free(pos_start, old_blocks);
            let start = match alloc.alloc(new_blocks) {
                Ok(start) => start,
                Err(e) => {
                    alloc.reserve(pos_start, old_blocks)?;
                    return Err(e);
                }
            };
            // The old range now encodes to zeroes (or to the new resident).
            self.mark_dirty_range(pos_start, old_blocks);
            self.mark_dirty_range(start, new_blocks);
            start
        };

        let rec = state.files.get_mut(vpath).unwrap();
        rec.pos_start = new_start;
        rec.block_count = new_blocks;
        state.rebuild_pos_index(drive);
        Ok(())
    }

    /// Shrinks a file's position range to cover `new_size` bytes, freeing
    /// and dirtying the tail. Table-only; the caller handles the real file.
    fn release_blocks(&self, state: &mut State, vpath: &str, new_size: u64) -> Result<()> {
        let rec = state
            .files
            .get(vpath)
            .ok_or_else(|| Error::NotFound(vpath.to_string()))?;
        let (drive, pos_start, old_blocks) = (rec.drive, rec.pos_start, rec.block_count);
        let new_blocks = blocks_for(new_size, self.cfg.block_size as u64);
        if new_blocks < old_blocks {
            let tail_start = pos_start + new_blocks;
            let tail = old_blocks - new_blocks;
            self.mark_dirty_range(tail_start, tail);
            state.allocators[drive].free(tail_start, tail);
        }
        let rec = state.files.get_mut(vpath).unwrap();
        rec.block_count = rec.block_count.min(new_blocks);
        rec.size = new_size as i64;
        state.rebuild_pos_index(drive);
        Ok(())
    }

    /// create. Write lock for the whole operation.
    pub fn create(&self, vpath: &str, mode: u32) -> Result<FileHandle> {
        validate_vpath(vpath)?;
        let mut state = self.state.write();
        if state.dirs.contains_key(vpath) || state.symlinks.contains_key(vpath) {
            return Err(Error::Exists(vpath.to_string()));
        }
        if state.files.contains_key(vpath) {
            // Existing file: O_TRUNC semantics.
            let drive = state.files[vpath].drive;
            let real = self.drives[drive].real_path(vpath);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .truncate(true)
                .open(&real)?;
            self.release_blocks(&mut state, vpath, 0)?;
            state.files.get_mut(vpath).unwrap().open_count += 1;
            return Ok(FileHandle { vpath: vpath.to_string(), kind: HandleKind::Live { file } });
        }

        let drive_index = state
            .pick_drive(&self.drives, self.cfg.placement)
            .ok_or_else(|| Error::Invalid("no data drives available".into()))?;
        let drive = &self.drives[drive_index];
        self.ensure_parent_dirs(drive, vpath)?;
        let real = drive.real_path(vpath);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode & 0o7777)
            .open(&real)?;
        let meta = file.metadata()?;
        let pos_probe = state.allocators[drive_index].alloc(0)?;
        state.insert_file(
            vpath.to_string(),
            FileRecord {
                drive: drive_index,
                size: 0,
                pos_start: pos_probe,
                block_count: 0,
                mtime_sec: meta.mtime(),
                mtime_nsec: meta.mtime_nsec(),
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                open_count: 1,
            },
        );
        log::debug!("created {vpath} on drive {}", drive.name);
        Ok(FileHandle { vpath: vpath.to_string(), kind: HandleKind::Live { file } })
    }

    /// Creates the missing parent directories of `vpath` on `drive`,
    /// inheriting each component's mode from a sibling drive when one
    /// already has it.
    pub(crate) fn ensure_parent_dirs(&self, drive: &Drive, vpath: &str) -> io::Result<()> {
        let Some(parent_end) = vpath.rfind('/') else {
            return Ok(());
        };
        if parent_end == 0 {
            return Ok(());
        }
        let parent = &vpath[..parent_end];
        let mut partial = String::new();
        for comp in parent[1..].split('/') {
            partial.push('/');
            partial.push_str(comp);
            let real = drive.real_path(&partial);
            if real.is_dir() {
                continue;
            }
            let mode = self
                .drives
                .iter()
                .filter(|d| d.index != drive.index)
                .find_map(|d| fs::metadata(d.real_path(&partial)).ok())
                .filter(|m| m.is_dir())
                .map(|m| m.mode() & 0o7777)
                .unwrap_or(0o755);
            match DirBuilder::new().mode(mode).create(&real) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// unlink. Write lock. Positions are marked dirty before they are
    /// freed so parity re-encodes them as zeroes.
    pub fn unlink(&self, vpath: &str) -> Result<()> {
        let mut state = self.state.write();
        if let Some(rec) = state.remove_file(vpath) {
            self.mark_dirty_range(rec.pos_start, rec.block_count);
            state.allocators[rec.drive].free(rec.pos_start, rec.block_count);
            state.rebuild_pos_index(rec.drive);
            let real = self.drives[rec.drive].real_path(vpath);
            drop(state);
            if let Err(e) = fs::remove_file(&real) {
                // A dead drive cannot serve the removal; the table-side
                // unlink stands.
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("unlink {vpath}: backing removal failed: {e}");
                }
            }
            Ok(())
        } else if state.symlinks.remove(vpath).is_some() {
            Ok(())
        } else if state.dirs.contains_key(vpath) {
            Err(Error::Invalid(format!("{vpath} is a directory")))
        } else {
            Err(Error::NotFound(vpath.to_string()))
        }
    }

    /// rename. Write lock. `RENAME_EXCHANGE` is unsupported.
    pub fn rename(&self, from: &str, to: &str, flags: RenameFlags) -> Result<()> {
        if flags.contains(RenameFlags::EXCHANGE) {
            return Err(Error::Invalid("RENAME_EXCHANGE is not supported".into()));
        }
        validate_vpath(from)?;
        validate_vpath(to)?;
        let mut state = self.state.write();

        if state.files.contains_key(from) {
            return self.rename_file(&mut state, from, to, flags);
        }
        if state.symlinks.contains_key(from) {
            if state.dirs.contains_key(to) {
                return Err(Error::Invalid(format!("{to} is a directory")));
            }
            if flags.contains(RenameFlags::NOREPLACE) && self.target_occupied(&state, to) {
                return Err(Error::Exists(to.to_string()));
            }
            if let Some(old) = state.remove_file(to) {
                self.drop_overwritten_file(&mut state, to, &old, true);
            }
            state.symlinks.remove(to);
            let rec = state.symlinks.remove(from).unwrap();
            state.symlinks.insert(to.to_string(), rec);
            return Ok(());
        }
        if self.is_directory(&state, from) {
            return self.rename_dir(&mut state, from, to, flags);
        }
        Err(Error::NotFound(from.to_string()))
    }

    /// Frees an overwritten destination file's positions (marking them
    /// dirty first) and optionally its backing file.
    fn drop_overwritten_file(
        &self,
        state: &mut State,
        vpath: &str,
        old: &FileRecord,
        unlink_real: bool,
    ) {
        self.mark_dirty_range(old.pos_start, old.block_count);
        state.allocators[old.drive].free(old.pos_start, old.block_count);
        state.rebuild_pos_index(old.drive);
        if unlink_real {
            let real = self.drives[old.drive].real_path(vpath);
            if let Err(e) = fs::remove_file(&real) {
                if e.kind() != io::ErrorKind::NotFound {
                    log::warn!("removing overwritten {vpath}: {e}");
                }
            }
        }
    }

    fn target_occupied(&self, state: &State, vpath: &str) -> bool {
        state.files.contains_key(vpath)
            || state.dirs.contains_key(vpath)
            || state.symlinks.contains_key(vpath)
    }

    fn is_directory(&self, state: &State, vpath: &str) -> bool {
        if state.dirs.contains_key(vpath) {
            return true;
        }
        if self
            .drives
            .iter()
            .any(|d| d.real_path(vpath).is_dir())
        {
            return true;
        }
        is_synthetic_dir(state, vpath)
    }

    fn rename_file(
        &self,
        state: &mut State,
        from: &str,
        to: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        if state.dirs.contains_key(to) {
            return Err(Error::Invalid(format!("{to} is a directory")));
        }
        if flags.contains(RenameFlags::NOREPLACE) && self.target_occupied(state, to) {
            return Err(Error::Exists(to.to_string()));
        }
        let rec = state.remove_file(from).unwrap();
        // Overwriting: drop the destination's state first. On the same
        // drive the rename below replaces the backing file itself.
        if let Some(old) = state.remove_file(to) {
            self.drop_overwritten_file(state, to, &old, old.drive != rec.drive);
        }
        state.symlinks.remove(to);
        let drive = &self.drives[rec.drive];
        let real_from = drive.real_path(from);
        let real_to = drive.real_path(to);
        self.ensure_parent_dirs(drive, to)?;
        if let Err(e) = fs::rename(&real_from, &real_to) {
            state.insert_file(from.to_string(), rec);
            return Err(e.into());
        }
        let drive_index = rec.drive;
        state.insert_file(to.to_string(), rec);
        state.rebuild_pos_index(drive_index);
        Ok(())
    }

    fn rename_dir(
        &self,
        state: &mut State,
        from: &str,
        to: &str,
        flags: RenameFlags,
    ) -> Result<()> {
        if flags.contains(RenameFlags::NOREPLACE) && self.target_occupied(state, to) {
            return Err(Error::Exists(to.to_string()));
        }
        for drive in &self.drives {
            let real_from = drive.real_path(from);
            if !real_from.is_dir() {
                continue;
            }
            self.ensure_parent_dirs(drive, to)?;
            fs::rename(&real_from, drive.real_path(to))?;
        }

        let prefix = format!("{from}/");
        rekey_prefix(&mut state.files, from, to, &prefix);
        rekey_prefix(&mut state.dirs, from, to, &prefix);
        rekey_prefix(&mut state.symlinks, from, to, &prefix);
        state.rebuild_all_indexes();
        Ok(())
    }

    /// mkdir. Write lock.
    pub fn mkdir(&self, vpath: &str, mode: u32) -> Result<()> {
        validate_vpath(vpath)?;
        let mut state = self.state.write();
        if self.target_occupied(&state, vpath) || self.is_directory(&state, vpath) {
            return Err(Error::Exists(vpath.to_string()));
        }
        let drive_index = state
            .pick_drive(&self.drives, self.cfg.placement)
            .ok_or_else(|| Error::Invalid("no data drives available".into()))?;
        let drive = &self.drives[drive_index];
        self.ensure_parent_dirs(drive, vpath)?;
        let real = drive.real_path(vpath);
        DirBuilder::new().mode(mode & 0o7777).create(&real)?;
        let meta = fs::metadata(&real)?;
        state.dirs.insert(
            vpath.to_string(),
            DirRecord {
                mode: meta.mode(),
                uid: meta.uid(),
                gid: meta.gid(),
                mtime_sec: meta.mtime(),
                mtime_nsec: meta.mtime_nsec(),
            },
        );
        Ok(())
    }

    /// rmdir. Write lock. ENOTEMPTY from any drive keeps the entry.
    pub fn rmdir(&self, vpath: &str) -> Result<()> {
        validate_vpath(vpath)?;
        let mut state = self.state.write();
        if !self.is_directory(&state, vpath) {
            return Err(Error::NotFound(vpath.to_string()));
        }
        let prefix = format!("{vpath}/");
        let occupied = state.files.keys().any(|k| k.starts_with(&prefix))
            || state.dirs.keys().any(|k| k.starts_with(&prefix))
            || state.symlinks.keys().any(|k| k.starts_with(&prefix));
        if occupied {
            return Err(Error::NotEmpty(vpath.to_string()));
        }
        for drive in &self.drives {
            let real = drive.real_path(vpath);
            match fs::remove_dir(&real) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) if e.raw_os_error() == Some(libc::ENOTEMPTY) => {
                    return Err(Error::NotEmpty(vpath.to_string()));
                }
                Err(e) => log::warn!("rmdir {vpath} on drive {}: {e}", drive.name),
            }
        }
        state.dirs.remove(vpath);
        Ok(())
    }

    /// truncate. Write lock.
    pub fn truncate(&self, vpath: &str, size: u64) -> Result<()> {
        let mut state = self.state.write();
        let rec = state
            .files
            .get(vpath)
            .ok_or_else(|| Error::NotFound(vpath.to_string()))?;
        let drive = rec.drive;
        let old_blocks = rec.block_count;
        let real = self.drives[drive].real_path(vpath);
        let file = OpenOptions::new().write(true).open(&real)?;
        file.set_len(size)?;

        let new_blocks = blocks_for(size, self.cfg.block_size as u64);
        if new_blocks < old_blocks {
            self.release_blocks(&mut state, vpath, size)?;
        } else if new_blocks > old_blocks {
            self.grow_allocation(&mut state, vpath, new_blocks)?;
            let rec = state.files.get_mut(vpath).unwrap();
            rec.size = size as i64;
        } else {
            let rec = state.files.get_mut(vpath).unwrap();
            rec.size = size as i64;
        }
        Ok(())
    }

    /// chmod. Write lock.
    pub fn chmod(&self, vpath: &str, mode: u32) -> Result<()> {
        let mut state = self.state.write();
        if let Some(rec) = state.files.get_mut(vpath) {
            let real = self.drives[rec.drive].real_path(vpath);
            fs::set_permissions(&real, Permissions::from_mode(mode & 0o7777))?;
            rec.mode = (rec.mode & libc::S_IFMT) | (mode & 0o7777);
            return Ok(());
        }
        if state.symlinks.contains_key(vpath) {
            // Symlink modes are fixed at 0777.
            return Ok(());
        }
        if self.is_directory(&state, vpath) {
            for drive in &self.drives {
                let real = drive.real_path(vpath);
                if real.is_dir() {
                    fs::set_permissions(&real, Permissions::from_mode(mode & 0o7777))?;
                }
            }
            let (sec, nsec) = now();
            state
                .dirs
                .entry(vpath.to_string())
                .and_modify(|rec| rec.mode = libc::S_IFDIR | (mode & 0o7777))
                .or_insert(DirRecord {
                    mode: libc::S_IFDIR | (mode & 0o7777),
                    uid: 0,
                    gid: 0,
                    mtime_sec: sec,
                    mtime_nsec: nsec,
                });
            return Ok(());
        }
        Err(Error::NotFound(vpath.to_string()))
    }

    /// chown. Write lock.
    pub fn chown(&self, vpath: &str, uid: Option<u32>, gid: Option<u32>) -> Result<()> {
        let mut state = self.state.write();
        if let Some(rec) = state.files.get_mut(vpath) {
            let real = self.drives[rec.drive].real_path(vpath);
            std::os::unix::fs::chown(&real, uid, gid)?;
            if let Some(uid) = uid {
                rec.uid = uid;
            }
            if let Some(gid) = gid {
                rec.gid = gid;
            }
            return Ok(());
        }
        if let Some(rec) = state.symlinks.get_mut(vpath) {
            if let Some(uid) = uid {
                rec.uid = uid;
            }
            if let Some(gid) = gid {
                rec.gid = gid;
            }
            return Ok(());
        }
        if self.is_directory(&state, vpath) {
            for drive in &self.drives {
                let real = drive.real_path(vpath);
                if real.is_dir() {
                    std::os::unix::fs::chown(&real, uid, gid)?;
                }
            }
            let (sec, nsec) = now();
            let rec = state.dirs.entry(vpath.to_string()).or_insert(DirRecord {
                mode: libc::S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                mtime_sec: sec,
                mtime_nsec: nsec,
            });
            if let Some(uid) = uid {
                rec.uid = uid;
            }
            if let Some(gid) = gid {
                rec.gid = gid;
            }
            return Ok(());
        }
        Err(Error::NotFound(vpath.to_string()))
    }

    /// utimens. Write lock.
    pub fn utimens(&self, vpath: &str, mtime_sec: i64, mtime_nsec: i64) -> Result<()> {
        let mut state = self.state.write();
        if let Some(rec) = state.files.get_mut(vpath) {
            let real = self.drives[rec.drive].real_path(vpath);
            set_path_times(&real, mtime_sec, mtime_nsec)?;
            rec.mtime_sec = mtime_sec;
            rec.mtime_nsec = mtime_nsec;
            return Ok(());
        }
        if let Some(rec) = state.symlinks.get_mut(vpath) {
            rec.mtime_sec = mtime_sec;
            rec.mtime_nsec = mtime_nsec;
            return Ok(());
        }
        if self.is_directory(&state, vpath) {
            for drive in &self.drives {
                let real = drive.real_path(vpath);
                if real.is_dir() {
                    set_path_times(&real, mtime_sec, mtime_nsec)?;
                }
            }
            let rec = state.dirs.entry(vpath.to_string()).or_insert(DirRecord {
                mode: libc::S_IFDIR | 0o755,
                uid: 0,
                gid: 0,
                mtime_sec,
                mtime_nsec,
            });
            rec.mtime_sec = mtime_sec;
            rec.mtime_nsec = mtime_nsec;
            return Ok(());
        }
        Err(Error::NotFound(vpath.to_string()))
    }

    /// symlink. Write lock. Links exist only in the table.
    pub fn symlink(&self, target: &str, link: &str) -> Result<()> {
        validate_vpath(link)?;
        let mut state = self.state.write();
        if self.target_occupied(&state, link) {
            return Err(Error::Exists(link.to_string()));
        }
        let (sec, nsec) = now();
        state.symlinks.insert(
            link.to_string(),
            SymlinkRecord {
                target: target.to_string(),
                uid: nix::unistd::geteuid().as_raw(),
                gid: nix::unistd::getegid().as_raw(),
                mtime_sec: sec,
                mtime_nsec: nsec,
            },
        );
        Ok(())
    }

    /// readlink. Read lock.
    pub fn readlink(&self, vpath: &str) -> Result<String> {
        let state = self.state.read();
        state
            .symlinks
            .get(vpath)
            .map(|rec| rec.target.clone())
            .ok_or_else(|| Error::NotFound(vpath.to_string()))
    }

    /// readdir. Read lock. Lists tracked entries plus synthetic
    /// intermediate directories.
    pub fn readdir(&self, vpath: &str) -> Result<Vec<DirEntry>> {
        let state = self.state.read();
        if vpath != "/" && !self.is_directory(&state, vpath) {
            return Err(Error::NotFound(vpath.to_string()));
        }
        let prefix = if vpath == "/" { "/".to_string() } else { format!("{vpath}/") };
        let mut names: BTreeMap<String, FileType> = BTreeMap::new();
        let mut collect = |key: &String, kind: FileType| {
            let Some(rest) = key.strip_prefix(&prefix) else {
                return;
            };
            if rest.is_empty() {
                return;
            }
            match rest.find('/') {
                Some(at) => {
                    names.entry(rest[..at].to_string()).or_insert(FileType::Directory);
                }
                None => {
                    names.insert(rest.to_string(), kind);
                }
            }
        };
        for key in state.files.keys() {
            collect(key, FileType::RegularFile);
        }
        for key in state.dirs.keys() {
            collect(key, FileType::Directory);
        }
        for key in state.symlinks.keys() {
            collect(key, FileType::Symlink);
        }
        Ok(names
            .into_iter()
            .map(|(name, kind)| DirEntry { name, kind })
            .collect())
    }

    /// fsync: data first, then parity for the whole file, then wait for the
    /// drain so both are durable when the call returns.
    pub fn fsync(&self, handle: &FileHandle) -> Result<()> {
        let HandleKind::Live { file } = &handle.kind else {
            return Ok(());
        };
        file.sync_data()?;
        let range = {
            let state = self.state.read();
            state
                .find_file(&handle.vpath)
                .map(|rec| (rec.pos_start, rec.block_count))
        };
        if let Some((pos_start, block_count)) = range {
            self.mark_dirty_range(pos_start, block_count);
        }
        self.flush_parity();
        Ok(())
    }

    /// statfs: byte-normalized aggregation over all drives, scaled by the
    /// largest underlying fragment size.
    pub fn statfs(&self) -> Result<StatFs> {
        let mut block_size = 0u64;
        let mut total = 0u64;
        let mut free = 0u64;
        let mut avail = 0u64;
        for drive in &self.drives {
            match drive.space() {
                Ok(space) => {
                    block_size = block_size.max(space.fragment_size);
                    total += space.total_bytes;
                    free += space.free_bytes;
                    avail += space.avail_bytes;
                }
                Err(e) => log::debug!("statfs: drive {} skipped: {e}", drive.name),
            }
        }
        if block_size == 0 {
            block_size = 4096;
        }
        let state = self.state.read();
        Ok(StatFs {
            block_size,
            blocks: total / block_size,
            blocks_free: free / block_size,
            blocks_avail: avail / block_size,
            files: (state.files.len() + state.dirs.len() + state.symlinks.len()) as u64,
        })
    }
}

fn is_synthetic_dir(state: &State, vpath: &str) -> bool {
    let prefix = format!("{vpath}/");
    state.files.keys().any(|k| k.starts_with(&prefix))
        || state.dirs.keys().any(|k| k.starts_with(&prefix))
        || state.symlinks.keys().any(|k| k.starts_with(&prefix))
}

fn rekey_prefix<V>(map: &mut BTreeMap<String, V>, from: &str, to: &str, prefix: &str) {
    let keys: Vec<String> = map
        .keys()
        .filter(|k| k.as_str() == from || k.starts_with(prefix))
        .cloned()
        .collect();
    for key in keys {
        let value = map.remove(&key).unwrap();
        let new_key = format!("{to}{}", &key[from.len()..]);
        map.insert(new_key, value);
    }
}
