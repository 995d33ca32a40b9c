//! LiveRAID storage engine.
//!
//! Merges N data drives into one virtual namespace, places each file whole
//! on a single drive, and maintains up to six levels of Cauchy erasure-coded
//! parity over a shared per-position block namespace. Losing up to `np`
//! drives is recoverable; every surviving drive stays directly readable.
//!
//! [`Engine::mount`] loads the content file, opens the parity set, recovers
//! the crash journal and starts the journal drainer and control channel.
//! The filesystem-facing layer calls the operations on [`Core`], which the
//! engine derefs to.

mod alloc;
mod config;
mod content;
mod control;
mod drive;
mod error;
mod index;
mod journal;
mod ops;
mod parity;
mod rebuild;
mod state;

use std::ops::Deref;
use std::sync::Arc;
use std::sync::atomic::Ordering;

pub use crate::alloc::{Extent, PosAllocator};
pub use crate::config::{Config, DriveSpec, Placement};
pub use crate::drive::Drive;
pub use crate::error::{Error, Result};
pub use crate::journal::{DirtyBitmap, load_bitmap, save_bitmap};
pub use crate::ops::{Attr, DirEntry, FileHandle, FileType, OpenFlags, RenameFlags, StatFs};
pub use crate::parity::ScrubReport;
pub use crate::rebuild::{RebuildEvent, RebuildReport, live_rebuild, write_event};
pub use crate::state::{Core, DirRecord, FileRecord, State, SymlinkRecord};

pub use crate::control::send_command;

use crate::control::ControlServer;
use crate::journal::Journal;

/// A mounted engine: the [`Core`] plus its background threads.
pub struct Engine {
    core: Arc<Core>,
    journal: Journal,
    control: Option<ControlServer>,
    finished: bool,
}

impl Engine {
    /// Brings the engine up: state load, parity open, crash-journal
    /// recovery, journal drainer, control channel.
    pub fn mount(cfg: Config) -> Result<Engine> {
        let core = Core::open(cfg)?;
        core.recover_crash_journal()?;
        let journal = Journal::start(Arc::clone(&core));
        let control = match ControlServer::start(Arc::clone(&core), core.config().control_path())
        {
            Ok(server) => Some(server),
            Err(e) => {
                log::warn!("control channel unavailable: {e}");
                None
            }
        };
        log::info!(
            "mounted: {} drives, {} parity levels, blocksize {}",
            core.drives().len(),
            core.parity_levels(),
            core.config().block_size
        );
        Ok(Engine { core, journal, control, finished: false })
    }

    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Clean unmount: flush parity, stop the background threads, write the
    /// final content snapshot and drop the crash journal.
    pub fn shutdown(mut self) -> Result<()> {
        self.shutdown_inner();
        Ok(())
    }

    fn shutdown_inner(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.core.flush_parity();
        self.core.running.store(false, Ordering::Relaxed);
        self.journal.stop(&self.core);
        if let Some(control) = &mut self.control {
            control.stop();
        }
        self.core.persist();
        self.core.remove_crash_journal();
        log::info!("unmounted");
    }
}

impl Deref for Engine {
    type Target = Core;

    fn deref(&self) -> &Core {
        &self.core
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown_inner();
    }
}
