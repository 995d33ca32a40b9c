//! Cauchy-matrix erasure codec over GF(2^8).
//!
//! The codec turns `nd` equally sized data blocks (one per drive, all at the
//! same parity position) into `np` parity blocks, and can reconstruct up to
//! `np` missing data blocks from the survivors plus the first `k` parity
//! blocks. The encode matrix is the Cauchy-1 construction: the first `nd`
//! rows are the identity, so data blocks pass through unchanged and only the
//! trailing `np` rows need product tables.

pub mod gf;

use std::alloc::{self, Layout};
use std::ops::{Deref, DerefMut};
use std::ptr::NonNull;

/// Alignment of [`AlignedBlock`] allocations, chosen to satisfy the widest
/// vector loads the encode kernels may be compiled to use.
pub const BLOCK_ALIGN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("codec geometry {data}+{parity} does not fit GF(2^8)")]
    BadGeometry { data: usize, parity: usize },
    #[error("{failed} blocks failed but only {parity} parity levels exist")]
    TooManyFailures { failed: usize, parity: usize },
    #[error("survivor matrix is singular")]
    SingularMatrix,
    #[error("block length mismatch")]
    BlockLength,
}

/// Heap block with 64-byte alignment.
///
/// `Vec<u8>` only guarantees alignment 1; parity blocks are allocated through
/// this wrapper so every data pointer handed to the encode/decode kernels is
/// 64-byte aligned.
pub struct AlignedBlock {
    ptr: NonNull<u8>,
    len: usize,
}

impl AlignedBlock {
    pub fn zeroed(len: usize) -> Self {
        assert!(len > 0, "zero-length parity block");
        let layout = Layout::from_size_align(len, BLOCK_ALIGN).expect("block layout");
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).unwrap_or_else(|| alloc::handle_alloc_error(layout));
        Self { ptr, len }
    }

    pub fn fill_zero(&mut self) {
        self.as_mut().fill(0);
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl Deref for AlignedBlock {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: ptr covers len bytes for the lifetime of self.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }
}

impl DerefMut for AlignedBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        // SAFETY: ptr covers len bytes and we hold the unique handle.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl AsRef<[u8]> for AlignedBlock {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

impl AsMut<[u8]> for AlignedBlock {
    fn as_mut(&mut self) -> &mut [u8] {
        self
    }
}

impl Drop for AlignedBlock {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.len, BLOCK_ALIGN).expect("block layout");
        // SAFETY: allocated with the identical layout in zeroed().
        unsafe { alloc::dealloc(self.ptr.as_ptr(), layout) };
    }
}

// SAFETY: AlignedBlock is an owning pointer to plain bytes.
unsafe impl Send for AlignedBlock {}
unsafe impl Sync for AlignedBlock {}

/// Encode/decode state for a fixed `(nd, np)` geometry.
pub struct CauchyCodec {
    nd: usize,
    np: usize,
    /// Full `(nd+np) x nd` encode matrix, row-major.
    matrix: Vec<u8>,
    /// Per-coefficient product tables for the `np` parity rows.
    tables: Vec<[u8; 256]>,
}

impl CauchyCodec {
    /// Builds the Cauchy-1 encode matrix and the parity-row product tables.
    ///
    /// Row indices of the Cauchy part and shifted column indices must be
    /// distinct field elements, hence `nd + np <= 256`.
    pub fn new(nd: usize, np: usize) -> Result<Self, CodecError> {
        if nd == 0 || np == 0 || nd + np > 256 {
            return Err(CodecError::BadGeometry { data: nd, parity: np });
        }
        let mut matrix = vec![0u8; (nd + np) * nd];
        for d in 0..nd {
            matrix[d * nd + d] = 1;
        }
        for p in 0..np {
            for j in 0..nd {
                matrix[(nd + p) * nd + j] = gf::inv(p as u8 ^ (np + j) as u8);
            }
        }
        let tables = matrix[nd * nd..].iter().map(|&c| gf::mul_table(c)).collect();
        Ok(Self { nd, np, matrix, tables })
    }

    pub fn data_count(&self) -> usize {
        self.nd
    }

    pub fn parity_count(&self) -> usize {
        self.np
    }

    /// Computes all `np` parity blocks from `nd` data blocks of equal length.
    pub fn encode(&self, data: &[&[u8]], parity: &mut [&mut [u8]]) -> Result<(), CodecError> {
        if data.len() != self.nd || parity.len() != self.np {
            return Err(CodecError::BlockLength);
        }
        let block_len = parity[0].len();
        if data.iter().any(|b| b.len() != block_len)
            || parity.iter().any(|b| b.len() != block_len)
        {
            return Err(CodecError::BlockLength);
        }
        for (p, out) in parity.iter_mut().enumerate() {
            out.fill(0);
            for (d, src) in data.iter().enumerate() {
                let table = &self.tables[p * self.nd + d];
                for (o, &s) in out.iter_mut().zip(src.iter()) {
                    *o ^= table[s as usize];
                }
            }
        }
        Ok(())
    }

    /// Reconstructs the blocks of the failed drives in one pass.
    ///
    /// `data` holds one block per drive; entries at failed indices are
    /// ignored. `parity` holds at least `failed.len()` parity blocks starting
    /// at level 0. `failed` must be sorted and duplicate-free; `out` receives
    /// one reconstructed block per failed index, in the same order.
    pub fn decode(
        &self,
        data: &[&[u8]],
        parity: &[&[u8]],
        failed: &[usize],
        out: &mut [&mut [u8]],
    ) -> Result<(), CodecError> {
        let k = failed.len();
        if k > self.np {
            return Err(CodecError::TooManyFailures { failed: k, parity: self.np });
        }
        if data.len() != self.nd || parity.len() < k || out.len() != k {
            return Err(CodecError::BlockLength);
        }
        if k == 0 {
            return Ok(());
        }
        debug_assert!(failed.windows(2).all(|w| w[0] < w[1]));

        // Survivor matrix: identity rows of the surviving drives, then the
        // first k parity rows, stacked into nd x nd.
        let nd = self.nd;
        let mut survivor = Vec::with_capacity(nd * nd);
        let mut inputs: Vec<&[u8]> = Vec::with_capacity(nd);
        for d in 0..nd {
            if !failed.contains(&d) {
                survivor.extend_from_slice(&self.matrix[d * nd..(d + 1) * nd]);
                inputs.push(data[d]);
            }
        }
        for p in 0..k {
            survivor.extend_from_slice(&self.matrix[(nd + p) * nd..(nd + p + 1) * nd]);
            inputs.push(parity[p]);
        }

        let inverse = invert(&survivor, nd)?;

        let block_len = out[0].len();
        if inputs.iter().any(|b| b.len() != block_len)
            || out.iter().any(|b| b.len() != block_len)
        {
            return Err(CodecError::BlockLength);
        }
        for (fi, &f) in failed.iter().enumerate() {
            let coeffs = &inverse[f * nd..(f + 1) * nd];
            let dst = &mut *out[fi];
            dst.fill(0);
            for (c, src) in coeffs.iter().zip(inputs.iter()) {
                if *c == 0 {
                    continue;
                }
                let table = gf::mul_table(*c);
                for (o, &s) in dst.iter_mut().zip(src.iter()) {
                    *o ^= table[s as usize];
                }
            }
        }
        Ok(())
    }
}

/// Gauss-Jordan inversion of an `n x n` matrix over GF(2^8).
fn invert(m: &[u8], n: usize) -> Result<Vec<u8>, CodecError> {
    let mut aug = vec![0u8; n * 2 * n];
    for r in 0..n {
        aug[r * 2 * n..r * 2 * n + n].copy_from_slice(&m[r * n..(r + 1) * n]);
        aug[r * 2 * n + n + r] = 1;
    }
    let width = 2 * n;
    for col in 0..n {
        let pivot = (col..n)
            .find(|&r| aug[r * width + col] != 0)
            .ok_or(CodecError::SingularMatrix)?;
        if pivot != col {
            for i in 0..width {
                aug.swap(col * width + i, pivot * width + i);
            }
        }
        let scale = gf::inv(aug[col * width + col]);
        for i in 0..width {
            aug[col * width + i] = gf::mul(aug[col * width + i], scale);
        }
        for r in 0..n {
            if r == col {
                continue;
            }
            let factor = aug[r * width + col];
            if factor == 0 {
                continue;
            }
            for i in 0..width {
                let v = gf::mul(factor, aug[col * width + i]);
                aug[r * width + i] ^= v;
            }
        }
    }
    let mut out = vec![0u8; n * n];
    for r in 0..n {
        out[r * n..(r + 1) * n].copy_from_slice(&aug[r * width + n..(r + 1) * width]);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_data(nd: usize, len: usize) -> Vec<Vec<u8>> {
        (0..nd)
            .map(|d| (0..len).map(|i| ((i * 31 + d * 7 + 13) % 251) as u8).collect())
            .collect()
    }

    fn encode_all(codec: &CauchyCodec, data: &[Vec<u8>], len: usize) -> Vec<Vec<u8>> {
        let mut parity = vec![vec![0u8; len]; codec.parity_count()];
        let data_refs: Vec<&[u8]> = data.iter().map(|b| b.as_slice()).collect();
        let mut parity_refs: Vec<&mut [u8]> =
            parity.iter_mut().map(|b| b.as_mut_slice()).collect();
        codec.encode(&data_refs, &mut parity_refs).unwrap();
        parity
    }

    #[test]
    fn geometry_limits() {
        assert!(CauchyCodec::new(0, 2).is_err());
        assert!(CauchyCodec::new(4, 0).is_err());
        assert!(CauchyCodec::new(251, 6).is_err());
        assert!(CauchyCodec::new(250, 6).is_ok());
    }

    #[test]
    fn identity_rows_pass_data_through() {
        let codec = CauchyCodec::new(3, 2).unwrap();
        for d in 0..3 {
            for j in 0..3 {
                let expect = if d == j { 1 } else { 0 };
                assert_eq!(codec.matrix[d * 3 + j], expect);
            }
        }
    }

    #[test]
    fn decode_recovers_every_failure_set() {
        let nd = 5;
        let np = 3;
        let len = 256;
        let codec = CauchyCodec::new(nd, np).unwrap();
        let data = sample_data(nd, len);
        let parity = encode_all(&codec, &data, len);

        // Every subset of drives of size 1..=np must reconstruct exactly.
        let mut subsets: Vec<Vec<usize>> = Vec::new();
        for mask in 1u32..(1 << nd) {
            let set: Vec<usize> = (0..nd).filter(|&d| mask & (1 << d) != 0).collect();
            if set.len() <= np {
                subsets.push(set);
            }
        }
        for failed in subsets {
            let data_refs: Vec<&[u8]> = data.iter().map(|b| b.as_slice()).collect();
            let parity_refs: Vec<&[u8]> = parity.iter().map(|b| b.as_slice()).collect();
            let mut out = vec![vec![0u8; len]; failed.len()];
            let mut out_refs: Vec<&mut [u8]> =
                out.iter_mut().map(|b| b.as_mut_slice()).collect();
            codec
                .decode(&data_refs, &parity_refs, &failed, &mut out_refs)
                .unwrap();
            for (fi, &f) in failed.iter().enumerate() {
                assert_eq!(out[fi], data[f], "failure set {:?}, drive {}", failed, f);
            }
        }
    }

    #[test]
    fn too_many_failures_is_rejected() {
        let codec = CauchyCodec::new(4, 2).unwrap();
        let data = sample_data(4, 64);
        let parity = encode_all(&codec, &data, 64);
        let data_refs: Vec<&[u8]> = data.iter().map(|b| b.as_slice()).collect();
        let parity_refs: Vec<&[u8]> = parity.iter().map(|b| b.as_slice()).collect();
        let mut out = vec![vec![0u8; 64]; 3];
        let mut out_refs: Vec<&mut [u8]> = out.iter_mut().map(|b| b.as_mut_slice()).collect();
        let err = codec
            .decode(&data_refs, &parity_refs, &[0, 1, 2], &mut out_refs)
            .unwrap_err();
        assert!(matches!(err, CodecError::TooManyFailures { failed: 3, parity: 2 }));
    }

    #[test]
    fn aligned_block_alignment_and_zeroing() {
        let block = AlignedBlock::zeroed(4096);
        assert_eq!(block.as_ref().as_ptr() as usize % BLOCK_ALIGN, 0);
        assert!(block.iter().all(|&b| b == 0));
        assert_eq!(block.len(), 4096);
    }

    #[test]
    fn invert_identity() {
        let id = vec![1, 0, 0, 0, 1, 0, 0, 0, 1];
        assert_eq!(invert(&id, 3).unwrap(), id);
    }

    #[test]
    fn invert_rejects_singular() {
        let singular = vec![1, 1, 1, 1];
        assert!(matches!(invert(&singular, 2), Err(CodecError::SingularMatrix)));
    }
}
