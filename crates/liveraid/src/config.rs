//! Configuration file parsing.
//!
//! The format is line oriented: `#` starts a comment running to the end of
//! the line, directives are whitespace separated, unknown directives are
//! warnings. See the repository documentation for the directive list.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

pub const DEFAULT_BLOCK_SIZE_KIB: u32 = 256;
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(300);
pub const DEFAULT_DRAIN_INTERVAL: Duration = Duration::from_millis(5000);
pub const MAX_PARITY_LEVELS: usize = 6;
pub const MAX_PARITY_THREADS: usize = 64;

/// Drive-selection policy for newly created files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    MostFree,
    LeastFree,
    ProportionalRandom,
    RoundRobin,
}

#[derive(Debug, Clone)]
pub struct DriveSpec {
    pub name: String,
    /// Absolute directory path, stored with a trailing separator.
    pub dir: String,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub drives: Vec<DriveSpec>,
    pub parity_paths: Vec<PathBuf>,
    pub content_paths: Vec<PathBuf>,
    pub mountpoint: PathBuf,
    /// Block size in bytes.
    pub block_size: u32,
    pub placement: Placement,
    pub parity_threads: usize,
    /// Periodic content/bitmap snapshot interval (`bitmap_interval`).
    pub save_interval: Duration,
    /// Journal drainer wakeup interval.
    pub drain_interval: Duration,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let mut drives = Vec::new();
        let mut parity: Vec<(u32, PathBuf)> = Vec::new();
        let mut content_paths = Vec::new();
        let mut mountpoint = None;
        let mut block_size = DEFAULT_BLOCK_SIZE_KIB * 1024;
        let mut placement = Placement::MostFree;
        let mut parity_threads = 1usize;
        let mut save_interval = DEFAULT_SAVE_INTERVAL;

        for (lineno, raw) in text.lines().enumerate() {
            let line = match raw.find('#') {
                Some(at) => &raw[..at],
                None => raw,
            };
            let mut tokens = line.split_whitespace();
            let Some(directive) = tokens.next() else {
                continue;
            };
            let args: Vec<&str> = tokens.collect();
            match directive {
                "data" => {
                    let &[name, dir] = args.as_slice() else {
                        return Err(bad_line(lineno, "data <name> <dir>"));
                    };
                    let mut dir = dir.to_string();
                    if !dir.ends_with('/') {
                        dir.push('/');
                    }
                    drives.push(DriveSpec { name: name.to_string(), dir });
                }
                "parity" => {
                    let &[level, path] = args.as_slice() else {
                        return Err(bad_line(lineno, "parity <level> <path>"));
                    };
                    let level: u32 = level
                        .parse()
                        .map_err(|_| bad_line(lineno, "parity level must be a number"))?;
                    if level == 0 || level as usize > MAX_PARITY_LEVELS {
                        return Err(bad_line(lineno, "parity level must be 1..6"));
                    }
                    parity.push((level, PathBuf::from(path)));
                }
                "content" => {
                    let &[path] = args.as_slice() else {
                        return Err(bad_line(lineno, "content <path>"));
                    };
                    content_paths.push(PathBuf::from(path));
                }
                "mountpoint" => {
                    let &[path] = args.as_slice() else {
                        return Err(bad_line(lineno, "mountpoint <path>"));
                    };
                    mountpoint = Some(PathBuf::from(path));
                }
                "blocksize" => {
                    let &[kib] = args.as_slice() else {
                        return Err(bad_line(lineno, "blocksize <KiB>"));
                    };
                    let kib: u32 = kib
                        .parse()
                        .map_err(|_| bad_line(lineno, "blocksize must be a number"))?;
                    if kib == 0 || kib > u32::MAX / 1024 {
                        return Err(bad_line(lineno, "blocksize out of range"));
                    }
                    let bytes = kib * 1024;
                    if bytes % 64 != 0 {
                        return Err(bad_line(lineno, "blocksize must be a multiple of 64 bytes"));
                    }
                    block_size = bytes;
                }
                "placement" => {
                    let &[policy] = args.as_slice() else {
                        return Err(bad_line(lineno, "placement <policy>"));
                    };
                    placement = match policy {
                        "mostfree" => Placement::MostFree,
                        "roundrobin" => Placement::RoundRobin,
                        "lfs" => Placement::LeastFree,
                        "pfrd" => Placement::ProportionalRandom,
                        other => {
                            return Err(bad_line(
                                lineno,
                                &format!("unknown placement policy {other:?}"),
                            ));
                        }
                    };
                }
                "parity_threads" => {
                    let &[n] = args.as_slice() else {
                        return Err(bad_line(lineno, "parity_threads <N>"));
                    };
                    let n: usize = n
                        .parse()
                        .map_err(|_| bad_line(lineno, "parity_threads must be a number"))?;
                    if n == 0 || n > MAX_PARITY_THREADS {
                        return Err(bad_line(lineno, "parity_threads must be 1..64"));
                    }
                    parity_threads = n;
                }
                "bitmap_interval" => {
                    let &[secs] = args.as_slice() else {
                        return Err(bad_line(lineno, "bitmap_interval <sec>"));
                    };
                    let secs: u64 = secs
                        .parse()
                        .map_err(|_| bad_line(lineno, "bitmap_interval must be a number"))?;
                    save_interval = Duration::from_secs(secs);
                }
                other => {
                    log::warn!("config line {}: unknown directive {other:?}", lineno + 1);
                }
            }
        }

        if drives.is_empty() {
            return Err(Error::Invalid("at least one data drive is required".into()));
        }
        if content_paths.is_empty() {
            return Err(Error::Invalid("at least one content path is required".into()));
        }
        let Some(mountpoint) = mountpoint else {
            return Err(Error::Invalid("mountpoint is required".into()));
        };

        // Parity levels must be contiguous starting at 1.
        parity.sort_by_key(|(level, _)| *level);
        for (i, (level, _)) in parity.iter().enumerate() {
            if *level as usize != i + 1 {
                return Err(Error::Invalid(format!(
                    "parity levels must be contiguous from 1, found level {level}"
                )));
            }
        }
        let parity_paths = parity.into_iter().map(|(_, p)| p).collect();

        Ok(Config {
            drives,
            parity_paths,
            content_paths,
            mountpoint,
            block_size,
            placement,
            parity_threads,
            save_interval,
            drain_interval: DEFAULT_DRAIN_INTERVAL,
        })
    }

    /// Crash-journal path: first content path plus `.bitmap`.
    pub fn bitmap_path(&self) -> PathBuf {
        path_with_suffix(&self.content_paths[0], ".bitmap")
    }

    /// Control-socket path: first content path plus `.ctrl`.
    pub fn control_path(&self) -> PathBuf {
        path_with_suffix(&self.content_paths[0], ".ctrl")
    }
}

pub(crate) fn path_with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut s = OsString::from(path.as_os_str());
    s.push(suffix);
    PathBuf::from(s)
}

fn bad_line(lineno: usize, msg: &str) -> Error {
    Error::Invalid(format!("config line {}: {msg}", lineno + 1))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
# test configuration
data a /mnt/disk-a
data b /mnt/disk-b/   # trailing separator kept
parity 1 /mnt/parity/level1
parity 2 /mnt/parity/level2
content /var/lib/liveraid/content
content /mnt/disk-a/.content
mountpoint /srv/pool
blocksize 128
placement roundrobin
parity_threads 4
bitmap_interval 60
";

    #[test]
    fn parses_full_config() {
        let cfg = Config::parse(SAMPLE).unwrap();
        assert_eq!(cfg.drives.len(), 2);
        assert_eq!(cfg.drives[0].dir, "/mnt/disk-a/");
        assert_eq!(cfg.drives[1].dir, "/mnt/disk-b/");
        assert_eq!(cfg.parity_paths.len(), 2);
        assert_eq!(cfg.content_paths.len(), 2);
        assert_eq!(cfg.block_size, 128 * 1024);
        assert_eq!(cfg.placement, Placement::RoundRobin);
        assert_eq!(cfg.parity_threads, 4);
        assert_eq!(cfg.save_interval, Duration::from_secs(60));
        assert_eq!(
            cfg.bitmap_path(),
            PathBuf::from("/var/lib/liveraid/content.bitmap")
        );
        assert_eq!(
            cfg.control_path(),
            PathBuf::from("/var/lib/liveraid/content.ctrl")
        );
    }

    #[test]
    fn defaults_apply() {
        let cfg = Config::parse(
            "data a /d/a\ncontent /tmp/c\nmountpoint /mnt\n",
        )
        .unwrap();
        assert_eq!(cfg.block_size, 256 * 1024);
        assert_eq!(cfg.placement, Placement::MostFree);
        assert_eq!(cfg.parity_threads, 1);
        assert!(cfg.parity_paths.is_empty());
        assert_eq!(cfg.save_interval, DEFAULT_SAVE_INTERVAL);
    }

    #[test]
    fn parity_gap_is_rejected() {
        let err = Config::parse(
            "data a /d/a\ncontent /tmp/c\nmountpoint /mnt\nparity 1 /p1\nparity 3 /p3\n",
        )
        .unwrap_err();
        assert!(matches!(err, Error::Invalid(_)));
    }

    #[test]
    fn missing_required_directives() {
        assert!(Config::parse("content /tmp/c\nmountpoint /mnt\n").is_err());
        assert!(Config::parse("data a /d/a\nmountpoint /mnt\n").is_err());
        assert!(Config::parse("data a /d/a\ncontent /tmp/c\n").is_err());
    }

    #[test]
    fn blocksize_validation() {
        assert!(Config::parse("data a /d\ncontent /c\nmountpoint /m\nblocksize 0\n").is_err());
        assert!(
            Config::parse("data a /d\ncontent /c\nmountpoint /m\nblocksize 4194305\n").is_err()
        );
    }

    #[test]
    fn unknown_directive_is_tolerated() {
        let cfg =
            Config::parse("data a /d/a\ncontent /tmp/c\nmountpoint /mnt\nfrobnicate on\n");
        assert!(cfg.is_ok());
    }
}
