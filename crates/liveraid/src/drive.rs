use std::io;
use std::path::{Path, PathBuf};

use nix::sys::statvfs::statvfs;

/// One data drive: a name from the configuration and a backing directory.
#[derive(Debug, Clone)]
pub struct Drive {
    pub name: String,
    /// Backing directory with a trailing separator.
    pub dir: String,
    pub index: usize,
}

impl Drive {
    /// Maps an absolute virtual path onto this drive's backing store.
    pub fn real_path(&self, vpath: &str) -> PathBuf {
        debug_assert!(vpath.starts_with('/'));
        PathBuf::from(format!("{}{}", self.dir, &vpath[1..]))
    }

    /// Bytes available to unprivileged writers on the backing filesystem.
    pub fn available_bytes(&self) -> io::Result<u64> {
        let vfs = statvfs(Path::new(&self.dir))
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        Ok(vfs.blocks_available() as u64 * vfs.fragment_size() as u64)
    }

    /// Total and free bytes plus the fragment size, for statfs aggregation.
    pub fn space(&self) -> io::Result<DriveSpace> {
        let vfs = statvfs(Path::new(&self.dir))
            .map_err(|e| io::Error::from_raw_os_error(e as i32))?;
        let frag = vfs.fragment_size() as u64;
        Ok(DriveSpace {
            fragment_size: frag,
            total_bytes: vfs.blocks() as u64 * frag,
            free_bytes: vfs.blocks_free() as u64 * frag,
            avail_bytes: vfs.blocks_available() as u64 * frag,
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DriveSpace {
    pub fragment_size: u64,
    pub total_bytes: u64,
    pub free_bytes: u64,
    pub avail_bytes: u64,
}
