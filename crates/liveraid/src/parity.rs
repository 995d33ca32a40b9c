//! Parity files and the engine-side encode/decode/scrub paths.
//!
//! Each parity level is one flat file indexed by position: block `p` lives
//! at byte offset `p * block_size`. Parity files are never truncated; reads
//! past end-of-file yield zeroed blocks and writes extend as needed.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

use liveraid_codec::{AlignedBlock, CauchyCodec};

use crate::error::{Error, Result};
use crate::state::{Core, State};

pub struct ParitySet {
    block_size: usize,
    files: Vec<File>,
    codec: CauchyCodec,
}

impl ParitySet {
    pub fn open(paths: &[PathBuf], nd: usize, block_size: usize) -> Result<Self> {
        let codec = CauchyCodec::new(nd, paths.len())?;
        let mut files = Vec::with_capacity(paths.len());
        for path in paths {
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(path)
                .map_err(|e| {
                    Error::Invalid(format!("cannot open parity file {}: {e}", path.display()))
                })?;
            files.push(file);
        }
        Ok(Self { block_size, files, codec })
    }

    pub fn block_size(&self) -> usize {
        self.block_size
    }

    pub fn parity_count(&self) -> usize {
        self.files.len()
    }

    pub fn codec(&self) -> &CauchyCodec {
        &self.codec
    }

    /// Reads parity block `pos` of `level`, zero-filling past end-of-file.
    pub fn read_block(&self, level: usize, pos: u32, buf: &mut [u8]) -> io::Result<()> {
        buf.fill(0);
        read_zero_padded(&self.files[level], pos as u64 * self.block_size as u64, buf)
    }

    pub fn write_block(&self, level: usize, pos: u32, data: &[u8]) -> io::Result<()> {
        self.files[level].write_all_at(data, pos as u64 * self.block_size as u64)
    }
}

/// Short reads are zero-padded: sparse-file semantics.
fn read_zero_padded(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Outcome of reading one drive's data block at a position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BlockRead {
    /// Block bytes are in the buffer (possibly zero-padded).
    Data,
    /// No file occupies the position; the buffer is zeroed.
    Absent,
    /// A file occupies the position but its backing store is unreadable.
    Failed,
}

/// Per-thread workspace for encode: one block per drive plus one per parity
/// level, all 64-byte aligned.
pub(crate) struct EncodeScratch {
    pub data: Vec<AlignedBlock>,
    pub parity: Vec<AlignedBlock>,
}

impl EncodeScratch {
    pub fn new(nd: usize, np: usize, block_size: usize) -> Self {
        Self {
            data: (0..nd).map(|_| AlignedBlock::zeroed(block_size)).collect(),
            parity: (0..np).map(|_| AlignedBlock::zeroed(block_size)).collect(),
        }
    }
}

/// Counters reported by a scrub or repair pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ScrubReport {
    pub positions_checked: u64,
    pub mismatches: u64,
    pub fixed: u64,
    pub read_errors: u64,
}

impl Core {
    /// Reads drive `drive`'s data block at `pos` into `buf`.
    pub(crate) fn read_data_block(
        &self,
        state: &State,
        drive: usize,
        pos: u32,
        buf: &mut [u8],
    ) -> BlockRead {
        buf.fill(0);
        let Some((vpath, rec)) = state.find_file_at_pos(drive, pos) else {
            return BlockRead::Absent;
        };
        let path = self.drives[drive].real_path(vpath);
        let offset = (pos - rec.pos_start) as u64 * self.cfg.block_size as u64;
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(_) => return BlockRead::Failed,
        };
        match read_zero_padded(&file, offset, buf) {
            Ok(()) => BlockRead::Data,
            Err(_) => BlockRead::Failed,
        }
    }

    /// Recomputes and writes every parity level at `pos`. Unreadable data
    /// blocks contribute zeroes; a later scrub flags the inconsistency.
    pub(crate) fn encode_position(
        &self,
        state: &State,
        pos: u32,
        scratch: &mut EncodeScratch,
    ) -> io::Result<()> {
        let Some(parity) = &self.parity else {
            return Ok(());
        };
        for drive in 0..self.drives.len() {
            if self.read_data_block(state, drive, pos, &mut scratch.data[drive])
                == BlockRead::Failed
            {
                log::debug!(
                    "drive {} unreadable at position {pos}, encoding zeroes",
                    self.drives[drive].name
                );
            }
        }
        let data_refs: Vec<&[u8]> = scratch.data.iter().map(|b| b.as_ref()).collect();
        let mut parity_refs: Vec<&mut [u8]> =
            scratch.parity.iter_mut().map(|b| b.as_mut()).collect();
        parity
            .codec()
            .encode(&data_refs, &mut parity_refs)
            .map_err(io::Error::other)?;
        for (level, block) in scratch.parity.iter().enumerate() {
            parity.write_block(level, pos, block)?;
        }
        Ok(())
    }

    /// Reconstructs drive `target`'s data block at `pos` from the survivors
    /// and parity. The target's own backing store is never consulted.
    pub(crate) fn decode_file_block(
        &self,
        state: &State,
        target: usize,
        pos: u32,
        out: &mut [u8],
    ) -> Result<()> {
        let parity = self
            .parity
            .as_ref()
            .ok_or_else(|| Error::Invalid("no parity configured".into()))?;
        let nd = self.drives.len();
        let np = parity.parity_count();
        let block_size = self.cfg.block_size as usize;

        let mut data: Vec<AlignedBlock> =
            (0..nd).map(|_| AlignedBlock::zeroed(block_size)).collect();
        let mut failed = vec![target];
        for drive in 0..nd {
            if drive == target {
                continue;
            }
            if self.read_data_block(state, drive, pos, &mut data[drive]) == BlockRead::Failed {
                failed.push(drive);
            }
        }
        failed.sort_unstable();
        if failed.len() > np {
            return Err(Error::TooManyFailures { failed: failed.len(), parity: np });
        }

        let k = failed.len();
        let mut parity_blocks: Vec<AlignedBlock> =
            (0..k).map(|_| AlignedBlock::zeroed(block_size)).collect();
        for (level, block) in parity_blocks.iter_mut().enumerate() {
            parity.read_block(level, pos, block)?;
        }

        let data_refs: Vec<&[u8]> = data.iter().map(|b| b.as_ref()).collect();
        let parity_refs: Vec<&[u8]> = parity_blocks.iter().map(|b| b.as_ref()).collect();
        let target_at = failed.iter().position(|&f| f == target).unwrap();
        let mut recon: Vec<AlignedBlock> =
            (0..k).map(|_| AlignedBlock::zeroed(block_size)).collect();
        {
            let mut out_refs: Vec<&mut [u8]> = recon.iter_mut().map(|b| b.as_mut()).collect();
            parity
                .codec()
                .decode(&data_refs, &parity_refs, &failed, &mut out_refs)?;
        }
        out.copy_from_slice(&recon[target_at]);
        Ok(())
    }

    /// Verifies stored parity against recomputed parity for every position
    /// up to the highest allocator high-water mark. In repair mode,
    /// mismatching parity blocks are rewritten.
    pub fn scrub(&self, repair: bool) -> ScrubReport {
        let mut report = ScrubReport::default();
        let Some(parity) = &self.parity else {
            return report;
        };
        let np = parity.parity_count();
        let block_size = self.cfg.block_size as usize;
        let mut scratch = EncodeScratch::new(self.drives.len(), np, block_size);
        let mut stored = AlignedBlock::zeroed(block_size);

        let max_pos = self.state.read().max_next_free();
        log::debug!("scrub over {max_pos} positions, repair={repair}");
        for pos in 0..max_pos {
            let state = self.state.read();
            for drive in 0..self.drives.len() {
                if self.read_data_block(&state, drive, pos, &mut scratch.data[drive])
                    == BlockRead::Failed
                {
                    report.read_errors += 1;
                }
            }
            drop(state);

            let data_refs: Vec<&[u8]> = scratch.data.iter().map(|b| b.as_ref()).collect();
            let mut parity_refs: Vec<&mut [u8]> =
                scratch.parity.iter_mut().map(|b| b.as_mut()).collect();
            if parity.codec().encode(&data_refs, &mut parity_refs).is_err() {
                report.read_errors += 1;
                continue;
            }

            for level in 0..np {
                if let Err(e) = parity.read_block(level, pos, &mut stored) {
                    log::warn!("parity level {level} unreadable at position {pos}: {e}");
                    report.read_errors += 1;
                    continue;
                }
                if stored.as_ref() != scratch.parity[level].as_ref() {
                    report.mismatches += 1;
                    if repair {
                        match parity.write_block(level, pos, &scratch.parity[level]) {
                            Ok(()) => report.fixed += 1,
                            Err(e) => log::warn!(
                                "rewriting parity level {level} at position {pos} failed: {e}"
                            ),
                        }
                    }
                }
            }
            report.positions_checked += 1;
        }
        report
    }
}
