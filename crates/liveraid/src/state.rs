//! The state core: every in-memory table the engine owns, guarded by one
//! writer-preferring read-write lock on [`Core`].

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use parking_lot::RwLock;
use rand::Rng;

use crate::alloc::{Extent, PosAllocator};
use crate::config::{Config, Placement};
use crate::content;
use crate::drive::Drive;
use crate::error::Result;
use crate::index::PositionIndex;
use crate::journal::JournalShared;
use crate::parity::ParitySet;

/// A regular file in the virtual namespace. Keyed by vpath in
/// [`State::files`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    pub drive: usize,
    pub size: i64,
    pub pos_start: u32,
    pub block_count: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    /// Outstanding open handles; a busy file is skipped by rebuild.
    pub open_count: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirRecord {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SymlinkRecord {
    pub target: String,
    pub uid: u32,
    pub gid: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
}

/// Everything mutable behind the engine lock.
#[derive(Debug, Default)]
pub struct State {
    pub files: BTreeMap<String, FileRecord>,
    pub dirs: BTreeMap<String, DirRecord>,
    pub symlinks: BTreeMap<String, SymlinkRecord>,
    pub allocators: Vec<PosAllocator>,
    pub indexes: Vec<PositionIndex>,
    round_robin: usize,
}

impl State {
    fn with_drive_count(n: usize) -> Self {
        State {
            allocators: (0..n).map(|_| PosAllocator::new()).collect(),
            indexes: (0..n).map(|_| PositionIndex::default()).collect(),
            ..State::default()
        }
    }

    pub fn insert_file(&mut self, vpath: String, rec: FileRecord) {
        self.files.insert(vpath, rec);
    }

    pub fn find_file(&self, vpath: &str) -> Option<&FileRecord> {
        self.files.get(vpath)
    }

    pub fn remove_file(&mut self, vpath: &str) -> Option<FileRecord> {
        self.files.remove(vpath)
    }

    /// Which file holds data at `(drive, pos)`?
    pub fn find_file_at_pos(&self, drive: usize, pos: u32) -> Option<(&str, &FileRecord)> {
        let entry = self.indexes[drive].lookup(pos)?;
        let rec = self.files.get(&entry.vpath)?;
        Some((entry.vpath.as_str(), rec))
    }

    pub fn rebuild_pos_index(&mut self, drive: usize) {
        let mut index = std::mem::take(&mut self.indexes[drive]);
        index.rebuild(self.files.iter(), drive);
        self.indexes[drive] = index;
    }

    pub fn rebuild_all_indexes(&mut self) {
        for drive in 0..self.indexes.len() {
            self.rebuild_pos_index(drive);
        }
    }

    /// Highest `next_free` across all drives; the scrub upper bound.
    pub fn max_next_free(&self) -> u32 {
        self.allocators.iter().map(|a| a.next_free()).max().unwrap_or(0)
    }

    /// Selects the drive for a new file according to the placement policy.
    pub fn pick_drive(&mut self, drives: &[Drive], placement: Placement) -> Option<usize> {
        if drives.is_empty() {
            return None;
        }
        match placement {
            Placement::RoundRobin => {
                let choice = self.round_robin % drives.len();
                self.round_robin = self.round_robin.wrapping_add(1);
                Some(choice)
            }
            Placement::MostFree => drives
                .iter()
                .map(|d| d.available_bytes().unwrap_or(0))
                .enumerate()
                .max_by_key(|&(_, avail)| avail)
                .map(|(i, _)| i),
            Placement::LeastFree => drives
                .iter()
                .map(|d| d.available_bytes().unwrap_or(0))
                .enumerate()
                .filter(|&(_, avail)| avail > 0)
                .min_by_key(|&(_, avail)| avail)
                .map(|(i, _)| i),
            Placement::ProportionalRandom => {
                let weights: Vec<u64> =
                    drives.iter().map(|d| d.available_bytes().unwrap_or(0)).collect();
                let total: u64 = weights.iter().sum();
                if total == 0 {
                    return Some(0);
                }
                let mut pick = rand::rng().random_range(0..total);
                for (i, w) in weights.iter().enumerate() {
                    if pick < *w {
                        return Some(i);
                    }
                    pick -= *w;
                }
                Some(drives.len() - 1)
            }
        }
    }
}

/// The engine core: configuration, drives, the locked state, the parity
/// handle and the journal. Shared between the operation entry points, the
/// journal drainer and the control channel.
pub struct Core {
    pub(crate) cfg: Config,
    pub(crate) drives: Vec<Drive>,
    pub(crate) state: RwLock<State>,
    pub(crate) parity: Option<ParitySet>,
    pub(crate) journal: JournalShared,
    pub(crate) running: AtomicBool,
}

impl Core {
    /// Loads the content file and opens parity; no background threads are
    /// started, which makes this directly usable for offline rebuild and
    /// scrub.
    pub fn open(cfg: Config) -> Result<Arc<Core>> {
        let drives: Vec<Drive> = cfg
            .drives
            .iter()
            .enumerate()
            .map(|(index, spec)| Drive {
                name: spec.name.clone(),
                dir: spec.dir.clone(),
                index,
            })
            .collect();
        for drive in &drives {
            if !std::path::Path::new(&drive.dir).is_dir() {
                log::warn!("drive {} directory {} is not accessible", drive.name, drive.dir);
            }
        }

        let mut state = State::with_drive_count(drives.len());
        if let Some(snapshot) = content::load(&cfg)? {
            apply_snapshot(&mut state, &cfg, &drives, snapshot);
        }
        state.rebuild_all_indexes();

        let parity = if cfg.parity_paths.is_empty() {
            None
        } else {
            Some(ParitySet::open(
                &cfg.parity_paths,
                drives.len(),
                cfg.block_size as usize,
            )?)
        };

        Ok(Arc::new(Core {
            cfg,
            drives,
            state: RwLock::new(state),
            parity,
            journal: JournalShared::default(),
            running: AtomicBool::new(true),
        }))
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn drives(&self) -> &[Drive] {
        &self.drives
    }

    pub fn parity_levels(&self) -> usize {
        self.parity.as_ref().map_or(0, |p| p.parity_count())
    }

    /// Placement of a file in the parity namespace, for tools and tests.
    pub fn file_extent(&self, vpath: &str) -> Option<(usize, u32, u32)> {
        let state = self.state.read();
        state
            .find_file(vpath)
            .map(|rec| (rec.drive, rec.pos_start, rec.block_count))
    }
}

fn apply_snapshot(state: &mut State, cfg: &Config, drives: &[Drive], snap: content::Snapshot) {
    if let Some(bs) = snap.block_size {
        if bs != cfg.block_size {
            log::warn!(
                "content file was written with blocksize {bs}, configuration says {}",
                cfg.block_size
            );
        }
    }

    let drive_by_name = |name: &str| drives.iter().position(|d| d.name == name);

    for entry in snap.files {
        let Some(drive) = drive_by_name(&entry.drive) else {
            log::warn!("content file references unknown drive {:?}, dropping {}", entry.drive, entry.vpath);
            continue;
        };
        state.files.insert(
            entry.vpath,
            FileRecord {
                drive,
                size: entry.size,
                pos_start: entry.pos_start,
                block_count: entry.block_count,
                mtime_sec: entry.mtime_sec,
                mtime_nsec: entry.mtime_nsec,
                mode: entry.mode,
                uid: entry.uid,
                gid: entry.gid,
                open_count: 0,
            },
        );
    }
    for (vpath, rec) in snap.dirs {
        state.dirs.insert(vpath, rec);
    }
    for (vpath, rec) in snap.symlinks {
        state.symlinks.insert(vpath, rec);
    }

    // Allocator state: prefer the per-drive headers, fall back to deriving
    // the high-water mark from the file records (legacy content files).
    let mut extents: Vec<Vec<Extent>> = vec![Vec::new(); drives.len()];
    for (name, start, count) in snap.drive_free_extents {
        match drive_by_name(&name) {
            Some(d) => extents[d].push(Extent { start, count }),
            None => log::warn!("free extent for unknown drive {name:?} ignored"),
        }
    }
    let mut next_free: Vec<Option<u32>> = vec![None; drives.len()];
    for (name, nf) in snap.drive_next_free {
        match drive_by_name(&name) {
            Some(d) => next_free[d] = Some(nf),
            None => log::warn!("next_free for unknown drive {name:?} ignored"),
        }
    }
    for d in 0..drives.len() {
        let nf = next_free[d].unwrap_or_else(|| {
            state
                .files
                .values()
                .filter(|r| r.drive == d)
                .map(|r| r.pos_start + r.block_count)
                .max()
                .unwrap_or(0)
        });
        state.allocators[d] = PosAllocator::from_parts(nf, std::mem::take(&mut extents[d]));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn drives(n: usize) -> Vec<Drive> {
        (0..n)
            .map(|i| Drive {
                name: format!("d{i}"),
                dir: format!("/nonexistent/d{i}/"),
                index: i,
            })
            .collect()
    }

    #[test]
    fn round_robin_cycles() {
        let drives = drives(3);
        let mut state = State::with_drive_count(3);
        let picks: Vec<_> = (0..6)
            .map(|_| state.pick_drive(&drives, Placement::RoundRobin).unwrap())
            .collect();
        assert_eq!(picks, vec![0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn pick_drive_on_empty_set_is_none() {
        let mut state = State::with_drive_count(0);
        assert_eq!(state.pick_drive(&[], Placement::MostFree), None);
    }

    #[test]
    fn find_file_at_pos_uses_index() {
        let mut state = State::with_drive_count(2);
        state.insert_file(
            "/f".into(),
            FileRecord {
                drive: 1,
                size: 8192,
                pos_start: 3,
                block_count: 2,
                mtime_sec: 0,
                mtime_nsec: 0,
                mode: 0o100644,
                uid: 0,
                gid: 0,
                open_count: 0,
            },
        );
        state.rebuild_pos_index(1);
        assert!(state.find_file_at_pos(0, 3).is_none());
        let (vpath, rec) = state.find_file_at_pos(1, 4).unwrap();
        assert_eq!(vpath, "/f");
        assert_eq!(rec.block_count, 2);
        assert!(state.find_file_at_pos(1, 5).is_none());
    }
}
