//! Write-back parity journal.
//!
//! Writes mark the touched parity positions in a dirty bitmap; a background
//! drainer periodically detaches the bitmap and recomputes parity for every
//! set position. The bitmap is also persisted next to the content file so a
//! crash re-drains any position whose parity may be stale.
//!
//! Lock ordering: the state lock is always taken before the bitmap mutex,
//! and the bitmap mutex is never held across I/O.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::parity::{EncodeScratch, ScrubReport};
use crate::state::Core;

const BITMAP_MAGIC: [u8; 4] = *b"LRBM";
/// Upper bound on persisted bitmap words (64M positions); larger counts are
/// treated as corruption.
const MAX_BITMAP_WORDS: usize = 1 << 20;

/// Bit-per-position dirty set. Grows monotonically to cover the highest
/// position ever marked.
#[derive(Debug, Default)]
pub struct DirtyBitmap {
    words: Vec<u64>,
}

impl DirtyBitmap {
    pub fn set(&mut self, pos: u32) {
        self.set_range(pos, 1);
    }

    pub fn set_range(&mut self, start: u32, count: u32) {
        if count == 0 {
            return;
        }
        let end = start as u64 + count as u64;
        let needed = end.div_ceil(64) as usize;
        if self.words.len() < needed {
            self.words.resize(needed, 0);
        }
        let mut pos = start as u64;
        while pos < end {
            let word = (pos / 64) as usize;
            if pos % 64 == 0 && end - pos >= 64 {
                self.words[word] = u64::MAX;
                pos += 64;
            } else {
                self.words[word] |= 1 << (pos % 64);
                pos += 1;
            }
        }
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|&w| w != 0)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn or_words(&mut self, words: &[u64]) {
        if self.words.len() < words.len() {
            self.words.resize(words.len(), 0);
        }
        for (dst, src) in self.words.iter_mut().zip(words.iter()) {
            *dst |= src;
        }
    }

    pub fn words(&self) -> &[u64] {
        &self.words
    }

    /// Set positions in ascending order.
    pub fn positions(&self) -> Vec<u32> {
        let mut out = Vec::with_capacity(self.count());
        for (wi, &word) in self.words.iter().enumerate() {
            let mut w = word;
            while w != 0 {
                let bit = w.trailing_zeros();
                out.push(wi as u32 * 64 + bit);
                w &= w - 1;
            }
        }
        out
    }
}

/// Writes the crash journal: magic, little-endian word count, then the raw
/// words in host byte order (not portable across endianness).
pub fn save_bitmap(path: &Path, words: &[u64]) -> io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(&BITMAP_MAGIC)?;
    file.write_all(&(words.len() as u32).to_le_bytes())?;
    file.write_all(bytemuck::cast_slice(words))?;
    file.sync_all()
}

/// Reads the crash journal back; `None` when absent or corrupt.
pub fn load_bitmap(path: &Path) -> io::Result<Option<Vec<u64>>> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    let mut header = [0u8; 8];
    if file.read_exact(&mut header).is_err() {
        log::warn!("crash journal {} is truncated", path.display());
        return Ok(None);
    }
    if header[0..4] != BITMAP_MAGIC {
        log::warn!("crash journal {} has a bad magic", path.display());
        return Ok(None);
    }
    let count = u32::from_le_bytes(header[4..8].try_into().unwrap()) as usize;
    if count > MAX_BITMAP_WORDS {
        log::warn!("crash journal {} word count {count} exceeds the cap", path.display());
        return Ok(None);
    }
    let mut raw = vec![0u8; count * 8];
    if file.read_exact(&mut raw).is_err() {
        log::warn!("crash journal {} is shorter than its header claims", path.display());
        return Ok(None);
    }
    let mut words = vec![0u64; count];
    bytemuck::cast_slice_mut::<u64, u8>(&mut words).copy_from_slice(&raw);
    Ok(Some(words))
}

/// Journal state shared between the marking side, the drainer and flushers.
#[derive(Default)]
pub struct JournalShared {
    pub(crate) inner: Mutex<JournalState>,
    pub(crate) wake: Condvar,
    pub(crate) drain_complete: Condvar,
    pub(crate) scrub_done: Condvar,
}

#[derive(Default)]
pub struct JournalState {
    pub(crate) bitmap: DirtyBitmap,
    pub(crate) processing: bool,
    pub(crate) scrub_request: Option<bool>,
    pub(crate) scrub_running: bool,
    pub(crate) scrub_report: Option<ScrubReport>,
}

/// Owns the drainer thread.
pub(crate) struct Journal {
    handle: Option<JoinHandle<()>>,
}

impl Journal {
    pub fn start(core: Arc<Core>) -> Self {
        let handle = thread::Builder::new()
            .name("liveraid-drain".into())
            .spawn(move || drainer(core))
            .expect("spawning drainer thread");
        Self { handle: Some(handle) }
    }

    /// `core.running` must already be cleared.
    pub fn stop(&mut self, core: &Core) {
        core.journal.wake.notify_all();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn drainer(core: Arc<Core>) {
    log::debug!("parity drainer started");
    let timeout = core.cfg.drain_interval.min(core.cfg.save_interval.max(Duration::from_millis(1)));
    let mut scratch = core.parity.as_ref().map(|p| {
        EncodeScratch::new(core.drives.len(), p.parity_count(), p.block_size())
    });
    let mut last_save = Instant::now();
    while core.running.load(Ordering::Relaxed) {
        {
            let mut st = core.journal.inner.lock();
            core.journal.wake.wait_for(&mut st, timeout);
        }
        if last_save.elapsed() >= core.cfg.save_interval {
            core.persist();
            last_save = Instant::now();
        }
        core.drain_cycle(scratch.as_mut());
        core.service_scrub_request();
    }
    // Catch anything marked after the final flush.
    core.drain_cycle(scratch.as_mut());
    log::debug!("parity drainer stopped");
}

impl Core {
    /// Marks `[start, start+count)` dirty. Does not signal the drainer: the
    /// periodic snapshot must see the dirty set before it is drained.
    pub fn mark_dirty_range(&self, start: u32, count: u32) {
        if count == 0 || self.parity.is_none() {
            return;
        }
        self.journal.inner.lock().bitmap.set_range(start, count);
    }

    /// Blocks until every marked position has been encoded and the encode
    /// writes have finished. Bitmap-empty alone is not enough: after the
    /// swap the parity writes may still be in flight, hence `processing`.
    pub fn flush_parity(&self) {
        if self.parity.is_none() {
            return;
        }
        let journal = &self.journal;
        let mut st = journal.inner.lock();
        while st.processing || st.bitmap.any() {
            journal.wake.notify_one();
            journal
                .drain_complete
                .wait_for(&mut st, Duration::from_millis(50));
        }
    }

    /// Queues a scrub on the drainer thread and waits for its report.
    /// `None` when the engine is shutting down.
    pub fn request_scrub(&self, repair: bool) -> Option<ScrubReport> {
        let journal = &self.journal;
        let mut st = journal.inner.lock();
        st.scrub_request = Some(repair);
        st.scrub_report = None;
        journal.wake.notify_one();
        loop {
            if let Some(report) = st.scrub_report.take() {
                return Some(report);
            }
            if !self.running.load(Ordering::Relaxed) {
                return None;
            }
            // A concurrent request may have consumed our slot; resubmit.
            if st.scrub_request.is_none() && !st.scrub_running {
                st.scrub_request = Some(repair);
                journal.wake.notify_one();
            }
            journal.scrub_done.wait_for(&mut st, Duration::from_millis(100));
        }
    }

    /// Periodic persistence: content file first, then the dirty bitmap.
    /// Runs strictly before the swap so the on-disk bitmap covers every
    /// position about to be drained.
    pub fn persist(&self) {
        {
            let state = self.state.read();
            if let Err(e) = crate::content::save(&self.cfg, &self.drives, &state) {
                log::warn!("content snapshot failed: {e}");
            }
        }
        if self.parity.is_some() {
            let words = self.journal.inner.lock().bitmap.words().to_vec();
            if let Err(e) = save_bitmap(&self.cfg.bitmap_path(), &words) {
                log::warn!("dirty bitmap snapshot failed: {e}");
            }
        }
    }

    /// Merges a crash journal left by a previous session into the live
    /// bitmap; the next drain cycle re-encodes those positions.
    pub(crate) fn recover_crash_journal(&self) -> io::Result<()> {
        if self.parity.is_none() {
            return Ok(());
        }
        let path = self.cfg.bitmap_path();
        if let Some(words) = load_bitmap(&path)? {
            let mut st = self.journal.inner.lock();
            st.bitmap.or_words(&words);
            let dirty = st.bitmap.count();
            drop(st);
            if dirty > 0 {
                log::info!("crash journal: {dirty} positions queued for re-drain");
            }
        }
        Ok(())
    }

    fn drain_cycle(&self, scratch: Option<&mut EncodeScratch>) {
        let detached = {
            let mut st = self.journal.inner.lock();
            if !st.bitmap.any() {
                return;
            }
            st.processing = true;
            std::mem::take(&mut st.bitmap)
        };
        let positions = detached.positions();
        log::debug!("draining {} dirty positions", positions.len());

        let threads = self.cfg.parity_threads.min(positions.len());
        if threads <= 1 {
            if let Some(scratch) = scratch {
                for &pos in &positions {
                    self.drain_position(pos, scratch);
                }
            }
        } else {
            let chunk = positions.len().div_ceil(threads);
            thread::scope(|scope| {
                for slice in positions.chunks(chunk) {
                    scope.spawn(move || {
                        let parity = self.parity.as_ref().unwrap();
                        let mut scratch = EncodeScratch::new(
                            self.drives.len(),
                            parity.parity_count(),
                            parity.block_size(),
                        );
                        for &pos in slice {
                            self.drain_position(pos, &mut scratch);
                        }
                    });
                }
            });
        }

        let mut st = self.journal.inner.lock();
        st.processing = false;
        self.journal.drain_complete.notify_all();
    }

    /// Parity recompute for one position, under the state lock in read mode.
    /// Write errors are logged and the position is dropped; `scrub repair`
    /// restores consistency later.
    fn drain_position(&self, pos: u32, scratch: &mut EncodeScratch) {
        let state = self.state.read();
        if let Err(e) = self.encode_position(&state, pos, scratch) {
            log::warn!("parity update at position {pos} failed: {e}");
        }
    }

    fn service_scrub_request(&self) {
        let request = {
            let mut st = self.journal.inner.lock();
            let request = st.scrub_request.take();
            st.scrub_running = request.is_some();
            request
        };
        if let Some(repair) = request {
            let report = self.scrub(repair);
            let mut st = self.journal.inner.lock();
            st.scrub_report = Some(report);
            st.scrub_running = false;
            self.journal.scrub_done.notify_all();
        }
    }

    /// Removes the crash journal; part of a clean shutdown, after the final
    /// flush.
    pub(crate) fn remove_crash_journal(&self) {
        let path = self.cfg.bitmap_path();
        if let Err(e) = fs::remove_file(&path) {
            if e.kind() != io::ErrorKind::NotFound {
                log::warn!("removing crash journal {} failed: {e}", path.display());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_range_spans_word_boundaries() {
        let mut bm = DirtyBitmap::default();
        bm.set_range(60, 10);
        assert_eq!(bm.count(), 10);
        assert_eq!(bm.positions(), (60..70).collect::<Vec<u32>>());
    }

    #[test]
    fn set_range_full_words() {
        let mut bm = DirtyBitmap::default();
        bm.set_range(0, 256);
        assert_eq!(bm.count(), 256);
        assert_eq!(bm.words().len(), 4);
        assert!(bm.words().iter().all(|&w| w == u64::MAX));
    }

    #[test]
    fn bitmap_grows_monotonically() {
        let mut bm = DirtyBitmap::default();
        bm.set(1000);
        assert_eq!(bm.words().len(), 16);
        bm.set(0);
        assert_eq!(bm.words().len(), 16);
        assert_eq!(bm.positions(), vec![0, 1000]);
    }

    #[test]
    fn or_words_unions() {
        let mut bm = DirtyBitmap::default();
        bm.set(3);
        bm.or_words(&[0b1, 0b10]);
        assert_eq!(bm.positions(), vec![0, 3, 65]);
    }

    #[test]
    fn bitmap_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("content.bitmap");
        let mut bm = DirtyBitmap::default();
        bm.set_range(5, 3);
        bm.set(130);
        save_bitmap(&path, bm.words()).unwrap();

        let words = load_bitmap(&path).unwrap().unwrap();
        let mut loaded = DirtyBitmap::default();
        loaded.or_words(&words);
        assert_eq!(loaded.positions(), bm.positions());
    }

    #[test]
    fn missing_bitmap_is_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load_bitmap(&dir.path().join("absent")).unwrap().is_none());
    }

    #[test]
    fn corrupt_bitmap_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");

        fs::write(&path, b"XXXX\x01\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00\x00").unwrap();
        assert!(load_bitmap(&path).unwrap().is_none());

        // Word count above the cap.
        let mut data = Vec::new();
        data.extend_from_slice(&BITMAP_MAGIC);
        data.extend_from_slice(&((MAX_BITMAP_WORDS as u32) + 1).to_le_bytes());
        fs::write(&path, &data).unwrap();
        assert!(load_bitmap(&path).unwrap().is_none());

        // Header claims more words than the file holds.
        let mut data = Vec::new();
        data.extend_from_slice(&BITMAP_MAGIC);
        data.extend_from_slice(&4u32.to_le_bytes());
        data.extend_from_slice(&[0u8; 8]);
        fs::write(&path, &data).unwrap();
        assert!(load_bitmap(&path).unwrap().is_none());
    }
}
