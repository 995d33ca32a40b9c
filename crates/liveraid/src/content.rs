//! The content file: an atomic text snapshot of the file, directory and
//! symlink tables plus per-drive allocator state, with a CRC32 footer.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::Path;

use crc::{CRC_32_ISO_HDLC, Crc};

use crate::config::{Config, path_with_suffix};
use crate::drive::Drive;
use crate::state::{DirRecord, State, SymlinkRecord};

const CONTENT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub drive: String,
    pub vpath: String,
    pub size: i64,
    pub pos_start: u32,
    pub block_count: u32,
    pub mtime_sec: i64,
    pub mtime_nsec: i64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
}

/// Parsed content file, still keyed by drive name; the caller resolves
/// names to drive indexes.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub block_size: Option<u32>,
    pub files: Vec<FileEntry>,
    pub dirs: Vec<(String, DirRecord)>,
    pub symlinks: Vec<(String, SymlinkRecord)>,
    pub drive_next_free: Vec<(String, u32)>,
    pub drive_free_extents: Vec<(String, u32, u32)>,
}

/// Renders and writes the snapshot to every configured content path.
/// Succeeds if at least one copy lands.
pub fn save(cfg: &Config, drives: &[Drive], state: &State) -> io::Result<()> {
    let body = render(cfg, drives, state);
    let crc = CONTENT_CRC.checksum(body.as_bytes());
    let footer = format!("# crc32: {crc:08X}\n");

    let mut last_err = None;
    let mut wrote = false;
    for path in &cfg.content_paths {
        match write_atomic(path, &body, &footer) {
            Ok(()) => wrote = true,
            Err(e) => {
                log::warn!("writing content file {} failed: {e}", path.display());
                last_err = Some(e);
            }
        }
    }
    if wrote {
        Ok(())
    } else {
        Err(last_err.unwrap_or_else(|| io::Error::other("no content path configured")))
    }
}

fn render(cfg: &Config, drives: &[Drive], state: &State) -> String {
    let mut out = String::new();
    out.push_str("# liveraid content\n");
    out.push_str("# version: 1\n");
    out.push_str(&format!("# blocksize: {}\n", cfg.block_size));
    for drive in drives {
        let alloc = &state.allocators[drive.index];
        out.push_str(&format!("# drive_next_free: {} {}\n", drive.name, alloc.next_free()));
        for extent in alloc.extents() {
            out.push_str(&format!(
                "# drive_free_extent: {} {} {}\n",
                drive.name, extent.start, extent.count
            ));
        }
    }
    for (vpath, rec) in &state.files {
        out.push_str(&format!(
            "file|{}|{}|{}|{}|{}|{}|{}|{:o}|{}|{}\n",
            drives[rec.drive].name,
            vpath,
            rec.size,
            rec.pos_start,
            rec.block_count,
            rec.mtime_sec,
            rec.mtime_nsec,
            rec.mode,
            rec.uid,
            rec.gid,
        ));
    }
    for (vpath, rec) in &state.dirs {
        out.push_str(&format!(
            "dir|{}|{:o}|{}|{}|{}|{}\n",
            vpath, rec.mode, rec.uid, rec.gid, rec.mtime_sec, rec.mtime_nsec,
        ));
    }
    for (vpath, rec) in &state.symlinks {
        out.push_str(&format!(
            "symlink|{}|{}|{}|{}|{}|{}\n",
            vpath, rec.target, rec.mtime_sec, rec.mtime_nsec, rec.uid, rec.gid,
        ));
    }
    out
}

fn write_atomic(path: &Path, body: &str, footer: &str) -> io::Result<()> {
    let tmp = path_with_suffix(path, ".tmp");
    let mut file = File::create(&tmp)?;
    file.write_all(body.as_bytes())?;
    file.write_all(footer.as_bytes())?;
    file.sync_all()?;
    drop(file);
    fs::rename(&tmp, path)
}

/// Loads the snapshot from the first openable content path. `None` means no
/// content file exists yet, which is the normal first-run state.
pub fn load(cfg: &Config) -> io::Result<Option<Snapshot>> {
    for path in &cfg.content_paths {
        match fs::read_to_string(path) {
            Ok(text) => {
                log::debug!("loading content file {}", path.display());
                return Ok(Some(parse(&text)));
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                log::warn!("content file {} unreadable: {e}", path.display());
                continue;
            }
        }
    }
    Ok(None)
}

pub fn parse(text: &str) -> Snapshot {
    verify_crc(text);

    let mut snap = Snapshot::default();
    for (lineno, line) in text.lines().enumerate() {
        if line.is_empty() {
            continue;
        }
        if let Some(rest) = line.strip_prefix('#') {
            parse_header(rest.trim_start(), &mut snap);
            continue;
        }
        let fields: Vec<&str> = line.split('|').collect();
        let parsed = match fields[0] {
            "file" => parse_file(&fields).map(|f| snap.files.push(f)),
            "dir" => parse_dir(&fields).map(|(v, r)| snap.dirs.push((v, r))),
            "symlink" => parse_symlink(&fields).map(|(v, r)| snap.symlinks.push((v, r))),
            tag => {
                log::warn!("content line {}: unknown record {tag:?}", lineno + 1);
                continue;
            }
        };
        if parsed.is_none() {
            log::warn!("content line {}: malformed record skipped", lineno + 1);
        }
    }
    snap
}

fn verify_crc(text: &str) {
    let Some(at) = text.rfind("# crc32: ") else {
        log::warn!("content file has no crc footer");
        return;
    };
    let body = &text[..at];
    let stored = text[at + "# crc32: ".len()..].trim();
    let Ok(stored) = u32::from_str_radix(stored, 16) else {
        log::warn!("content file crc footer is malformed");
        return;
    };
    let computed = CONTENT_CRC.checksum(body.as_bytes());
    if stored != computed {
        log::warn!("content file crc mismatch: stored {stored:08X}, computed {computed:08X}");
    }
}

fn parse_header(rest: &str, snap: &mut Snapshot) {
    let mut tokens = rest.split_whitespace();
    match tokens.next() {
        Some("blocksize:") => {
            snap.block_size = tokens.next().and_then(|t| t.parse().ok());
        }
        Some("drive_next_free:") => {
            if let (Some(name), Some(Ok(nf))) =
                (tokens.next(), tokens.next().map(|t| t.parse()))
            {
                snap.drive_next_free.push((name.to_string(), nf));
            }
        }
        Some("drive_free_extent:") => {
            if let (Some(name), Some(Ok(start)), Some(Ok(count))) = (
                tokens.next(),
                tokens.next().map(|t| t.parse()),
                tokens.next().map(|t| t.parse()),
            ) {
                snap.drive_free_extents.push((name.to_string(), start, count));
            }
        }
        // Legacy single-namespace headers: superseded by the per-drive
        // records above, the high-water mark is re-derived from the files.
        Some("next_free_pos:") | Some("free_extent:") => {}
        _ => {}
    }
}

fn parse_file(fields: &[&str]) -> Option<FileEntry> {
    if fields.len() != 11 && fields.len() != 8 {
        return None;
    }
    let mut entry = FileEntry {
        drive: fields[1].to_string(),
        vpath: fields[2].to_string(),
        size: fields[3].parse().ok()?,
        pos_start: fields[4].parse().ok()?,
        block_count: fields[5].parse().ok()?,
        mtime_sec: fields[6].parse().ok()?,
        mtime_nsec: fields[7].parse().ok()?,
        mode: 0o100644,
        uid: 0,
        gid: 0,
    };
    if fields.len() == 11 {
        entry.mode = u32::from_str_radix(fields[8], 8).ok()?;
        entry.uid = fields[9].parse().ok()?;
        entry.gid = fields[10].parse().ok()?;
    }
    Some(entry)
}

fn parse_dir(fields: &[&str]) -> Option<(String, DirRecord)> {
    if fields.len() != 7 {
        return None;
    }
    Some((
        fields[1].to_string(),
        DirRecord {
            mode: u32::from_str_radix(fields[2], 8).ok()?,
            uid: fields[3].parse().ok()?,
            gid: fields[4].parse().ok()?,
            mtime_sec: fields[5].parse().ok()?,
            mtime_nsec: fields[6].parse().ok()?,
        },
    ))
}

fn parse_symlink(fields: &[&str]) -> Option<(String, SymlinkRecord)> {
    if fields.len() != 7 {
        return None;
    }
    Some((
        fields[1].to_string(),
        SymlinkRecord {
            target: fields[2].to_string(),
            mtime_sec: fields[3].parse().ok()?,
            mtime_nsec: fields[4].parse().ok()?,
            uid: fields[5].parse().ok()?,
            gid: fields[6].parse().ok()?,
        },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    use crate::alloc::{Extent, PosAllocator};
    use crate::config::Placement;
    use crate::state::FileRecord;
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_fixture() -> (Config, Vec<Drive>, State) {
        let cfg = Config {
            drives: vec![],
            parity_paths: vec![],
            content_paths: vec![PathBuf::from("/tmp/unused")],
            mountpoint: PathBuf::from("/mnt"),
            block_size: 65536,
            placement: Placement::MostFree,
            parity_threads: 1,
            save_interval: Duration::from_secs(300),
            drain_interval: Duration::from_secs(5),
        };
        let drives = vec![
            Drive { name: "a".into(), dir: "/d/a/".into(), index: 0 },
            Drive { name: "b".into(), dir: "/d/b/".into(), index: 1 },
        ];
        let mut state = State::default();
        state.allocators = vec![
            PosAllocator::from_parts(10, vec![Extent { start: 2, count: 3 }]),
            PosAllocator::from_parts(4, vec![]),
        ];
        state.indexes = vec![Default::default(), Default::default()];
        state.files.insert(
            "/docs/report.txt".into(),
            FileRecord {
                drive: 0,
                size: 70000,
                pos_start: 5,
                block_count: 2,
                mtime_sec: 1700000000,
                mtime_nsec: 123456789,
                mode: 0o100644,
                uid: 1000,
                gid: 100,
                open_count: 0,
            },
        );
        state.files.insert(
            "/music/x.flac".into(),
            FileRecord {
                drive: 1,
                size: 65536,
                pos_start: 0,
                block_count: 1,
                mtime_sec: 1600000000,
                mtime_nsec: 0,
                mode: 0o100600,
                uid: 0,
                gid: 0,
                open_count: 3,
            },
        );
        state.dirs.insert(
            "/docs".into(),
            DirRecord { mode: 0o40755, uid: 1000, gid: 100, mtime_sec: 1, mtime_nsec: 2 },
        );
        state.symlinks.insert(
            "/l".into(),
            SymlinkRecord { target: "/t".into(), uid: 1000, gid: 100, mtime_sec: 3, mtime_nsec: 4 },
        );
        (cfg, drives, state)
    }

    #[test]
    fn save_load_round_trip() {
        let (mut cfg, drives, state) = test_fixture();
        let dir = tempfile::tempdir().unwrap();
        cfg.content_paths = vec![dir.path().join("content"), dir.path().join("content.copy")];

        save(&cfg, &drives, &state).unwrap();
        // Both copies are written.
        assert!(cfg.content_paths[1].exists());

        let snap = load(&cfg).unwrap().unwrap();
        assert_eq!(snap.block_size, Some(65536));
        assert_eq!(snap.files.len(), 2);
        let report = snap.files.iter().find(|f| f.vpath == "/docs/report.txt").unwrap();
        assert_eq!(report.drive, "a");
        assert_eq!(report.size, 70000);
        assert_eq!(report.pos_start, 5);
        assert_eq!(report.block_count, 2);
        assert_eq!(report.mode, 0o100644);
        assert_eq!(report.uid, 1000);
        assert_eq!(snap.dirs, vec![(
            "/docs".to_string(),
            DirRecord { mode: 0o40755, uid: 1000, gid: 100, mtime_sec: 1, mtime_nsec: 2 },
        )]);
        assert_eq!(snap.symlinks[0].1.target, "/t");
        assert_eq!(
            snap.drive_next_free,
            vec![("a".to_string(), 10), ("b".to_string(), 4)]
        );
        assert_eq!(snap.drive_free_extents, vec![("a".to_string(), 2, 3)]);
    }

    #[test]
    fn corrupt_crc_still_loads() {
        let (mut cfg, drives, state) = test_fixture();
        let dir = tempfile::tempdir().unwrap();
        cfg.content_paths = vec![dir.path().join("content")];
        save(&cfg, &drives, &state).unwrap();

        let text = fs::read_to_string(&cfg.content_paths[0]).unwrap();
        let at = text.rfind("# crc32: ").unwrap();
        let tampered = format!("{}# crc32: DEADBEEF\n", &text[..at]);
        fs::write(&cfg.content_paths[0], tampered).unwrap();

        let snap = load(&cfg).unwrap().unwrap();
        assert_eq!(snap.files.len(), 2);
    }

    #[test]
    fn legacy_file_record_gets_default_ownership() {
        let snap = parse("file|a|/old.bin|100|0|1|1234|0\n");
        assert_eq!(snap.files.len(), 1);
        assert_eq!(snap.files[0].mode, 0o100644);
        assert_eq!(snap.files[0].uid, 0);
        assert_eq!(snap.files[0].gid, 0);
    }

    #[test]
    fn legacy_global_headers_are_ignored() {
        let snap = parse("# next_free_pos: 99\n# free_extent: 1 2\nfile|a|/f|1|0|1|0|0\n");
        assert!(snap.drive_next_free.is_empty());
        assert_eq!(snap.files.len(), 1);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let snap = parse("file|a|/f|notanumber|0|1|0|0\ngarbage line\nfile|a|/ok|1|0|1|0|0\n");
        assert_eq!(snap.files.len(), 1);
        assert_eq!(snap.files[0].vpath, "/ok");
    }
}
