//! End-to-end engine scenarios over temporary drive directories.

use std::fs;
use std::path::Path;
use std::time::Duration;

use liveraid::{Config, Core, DriveSpec, Engine, FileType, OpenFlags, Placement, RenameFlags};

fn test_config(root: &Path, drives: usize, parity: usize) -> Config {
    let mut drive_specs = Vec::new();
    for i in 0..drives {
        let dir = root.join(format!("drive{i}"));
        fs::create_dir_all(&dir).unwrap();
        drive_specs.push(DriveSpec {
            name: format!("d{i}"),
            dir: format!("{}/", dir.display()),
        });
    }
    let parity_dir = root.join("parity");
    fs::create_dir_all(&parity_dir).unwrap();
    let meta = root.join("meta");
    fs::create_dir_all(&meta).unwrap();
    Config {
        drives: drive_specs,
        parity_paths: (1..=parity).map(|l| parity_dir.join(format!("level{l}"))).collect(),
        content_paths: vec![meta.join("content")],
        mountpoint: root.join("mnt"),
        block_size: 4096,
        placement: Placement::RoundRobin,
        parity_threads: 1,
        save_interval: Duration::from_secs(300),
        drain_interval: Duration::from_millis(50),
    }
}

fn write_file(core: &Core, vpath: &str, data: &[u8]) {
    let fh = core.create(vpath, 0o644).unwrap();
    assert_eq!(core.write(&fh, 0, data).unwrap(), data.len());
    core.release(fh);
}

fn read_file(core: &Core, vpath: &str) -> Vec<u8> {
    let fh = core.open(vpath, OpenFlags::empty()).unwrap();
    let size = core.getattr(vpath).unwrap().size as usize;
    let mut buf = vec![0u8; size];
    let mut done = 0;
    while done < buf.len() {
        let n = core.read(&fh, done as u64, &mut buf[done..]).unwrap();
        if n == 0 {
            break;
        }
        done += n;
    }
    core.release(fh);
    buf.truncate(done);
    buf
}

fn erase_drive_contents(dir: &Path) {
    for entry in fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.is_dir() {
            fs::remove_dir_all(&path).unwrap();
        } else {
            fs::remove_file(&path).unwrap();
        }
    }
}

#[test]
fn two_drive_loss_recovery() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 4, 2);
    let engine = Engine::mount(cfg.clone()).unwrap();

    let bodies: Vec<String> = (1..=8).map(|k| format!("content of file {k}")).collect();
    for (k, body) in bodies.iter().enumerate() {
        write_file(&engine, &format!("/f{}", k + 1), body.as_bytes());
    }
    engine.flush_parity();

    erase_drive_contents(&root.path().join("drive0"));
    erase_drive_contents(&root.path().join("drive1"));

    for (k, body) in bodies.iter().enumerate() {
        let got = read_file(&engine, &format!("/f{}", k + 1));
        assert_eq!(got, body.as_bytes(), "file {}", k + 1);
    }
    engine.shutdown().unwrap();
}

#[test]
fn unlink_reuses_parity_positions() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 1, 1);
    let engine = Engine::mount(cfg).unwrap();

    write_file(&engine, "/a", b"x");
    assert_eq!(engine.file_extent("/a").unwrap(), (0, 0, 1));
    engine.flush_parity();
    engine.unlink("/a").unwrap();

    write_file(&engine, "/b", b"x");
    let (_, pos_start, block_count) = engine.file_extent("/b").unwrap();
    assert_eq!(pos_start, 0, "freed position is reused first-fit");
    assert_eq!(block_count, 1);
    engine.shutdown().unwrap();
}

#[test]
fn symlink_survives_remount() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 2, 0);
    let engine = Engine::mount(cfg.clone()).unwrap();
    write_file(&engine, "/t", b"target data");
    engine.symlink("/t", "/l").unwrap();
    assert_eq!(engine.readlink("/l").unwrap(), "/t");
    let attr = engine.getattr("/l").unwrap();
    assert_eq!(attr.kind, FileType::Symlink);
    assert_eq!(attr.mode & 0o777, 0o777);
    engine.shutdown().unwrap();

    let engine = Engine::mount(cfg).unwrap();
    assert_eq!(engine.readlink("/l").unwrap(), "/t");
    engine.unlink("/l").unwrap();
    assert!(engine.readlink("/l").is_err());
    assert_eq!(read_file(&engine, "/t"), b"target data");
    engine.shutdown().unwrap();
}

#[test]
fn write_grows_and_truncate_shrinks_positions() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 1, 1);
    let bs = cfg.block_size as usize;
    let engine = Engine::mount(cfg).unwrap();

    let fh = engine.create("/grow.bin", 0o644).unwrap();
    engine.write(&fh, 0, &vec![7u8; 3 * bs]).unwrap();
    assert_eq!(engine.file_extent("/grow.bin").unwrap(), (0, 0, 3));
    // Appending while the range abuts the high-water mark grows in place.
    engine.write(&fh, 3 * bs as u64, &vec![8u8; bs]).unwrap();
    assert_eq!(engine.file_extent("/grow.bin").unwrap(), (0, 0, 4));
    engine.release(fh);

    engine.truncate("/grow.bin", bs as u64 + 1).unwrap();
    assert_eq!(engine.file_extent("/grow.bin").unwrap(), (0, 0, 2));
    assert_eq!(engine.getattr("/grow.bin").unwrap().size, bs as u64 + 1);

    // The freed tail is available again.
    write_file(&engine, "/next.bin", &vec![9u8; bs]);
    assert_eq!(engine.file_extent("/next.bin").unwrap().1, 2);
    engine.shutdown().unwrap();
}

#[test]
fn rename_file_and_directory_tree() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 2, 0);
    let engine = Engine::mount(cfg).unwrap();

    engine.mkdir("/docs", 0o755).unwrap();
    write_file(&engine, "/docs/a.txt", b"alpha");
    write_file(&engine, "/docs/deep/b.txt", b"beta");

    engine.rename("/docs/a.txt", "/docs/first.txt", RenameFlags::empty()).unwrap();
    assert_eq!(read_file(&engine, "/docs/first.txt"), b"alpha");
    assert!(engine.getattr("/docs/a.txt").is_err());

    // NOREPLACE refuses an occupied slot.
    write_file(&engine, "/other.txt", b"other");
    let err = engine
        .rename("/other.txt", "/docs/first.txt", RenameFlags::NOREPLACE)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EEXIST);

    // EXCHANGE is not supported.
    let err = engine
        .rename("/other.txt", "/docs/first.txt", RenameFlags::EXCHANGE)
        .unwrap_err();
    assert_eq!(err.errno(), libc::EINVAL);

    // Directory rename rewrites every vpath beneath it.
    engine.rename("/docs", "/papers", RenameFlags::empty()).unwrap();
    assert_eq!(read_file(&engine, "/papers/first.txt"), b"alpha");
    assert_eq!(read_file(&engine, "/papers/deep/b.txt"), b"beta");
    assert!(engine.getattr("/docs").is_err());
    engine.shutdown().unwrap();
}

#[test]
fn readdir_lists_synthetic_and_tracked_entries() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 2, 0);
    let engine = Engine::mount(cfg).unwrap();

    write_file(&engine, "/x/y/file.bin", b"1");
    engine.mkdir("/empty", 0o700).unwrap();
    engine.symlink("/x", "/link").unwrap();

    let names: Vec<(String, FileType)> = engine
        .readdir("/")
        .unwrap()
        .into_iter()
        .map(|e| (e.name, e.kind))
        .collect();
    assert_eq!(
        names,
        vec![
            ("empty".to_string(), FileType::Directory),
            ("link".to_string(), FileType::Symlink),
            ("x".to_string(), FileType::Directory),
        ]
    );

    let inner = engine.readdir("/x/y").unwrap();
    assert_eq!(inner.len(), 1);
    assert_eq!(inner[0].name, "file.bin");
    assert_eq!(inner[0].kind, FileType::RegularFile);

    // The synthetic ancestor reports the default attributes.
    let attr = engine.getattr("/x/y").unwrap();
    assert_eq!(attr.kind, FileType::Directory);
    engine.shutdown().unwrap();
}

#[test]
fn rmdir_semantics() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 2, 0);
    let engine = Engine::mount(cfg).unwrap();

    engine.mkdir("/d", 0o755).unwrap();
    write_file(&engine, "/d/f", b"data");
    let err = engine.rmdir("/d").unwrap_err();
    assert_eq!(err.errno(), libc::ENOTEMPTY);
    assert!(engine.getattr("/d").is_ok());

    engine.unlink("/d/f").unwrap();
    engine.rmdir("/d").unwrap();
    assert!(engine.getattr("/d").is_err());
    engine.shutdown().unwrap();
}

#[test]
fn dead_drive_write_is_rejected_and_metadata_survives() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 2, 1);
    let engine = Engine::mount(cfg).unwrap();

    write_file(&engine, "/victim", b"precious");
    engine.chmod("/victim", 0o600).unwrap();
    engine.flush_parity();
    let drive = engine.file_extent("/victim").unwrap().0;
    erase_drive_contents(&root.path().join(format!("drive{drive}")));

    // Read-only open falls back to parity, write open does not.
    let err = engine.open("/victim", OpenFlags::WRITE).unwrap_err();
    assert_eq!(err.errno(), libc::ENOENT);

    let fh = engine.open("/victim", OpenFlags::empty()).unwrap();
    assert!(fh.is_dead_drive());
    let mut buf = vec![0u8; 8];
    assert_eq!(engine.read(&fh, 0, &mut buf).unwrap(), 8);
    assert_eq!(&buf, b"precious");
    engine.release(fh);

    // getattr synthesizes from stored metadata on a dead drive.
    let attr = engine.getattr("/victim").unwrap();
    assert_eq!(attr.size, 8);
    assert_eq!(attr.mode & 0o7777, 0o600);
    engine.shutdown().unwrap();
}

#[test]
fn content_snapshot_round_trips_allocator_state() {
    let root = tempfile::tempdir().unwrap();
    let cfg = test_config(root.path(), 1, 1);
    let engine = Engine::mount(cfg.clone()).unwrap();
    let bs = cfg.block_size as usize;

    write_file(&engine, "/one", &vec![1u8; 2 * bs]);
    write_file(&engine, "/two", &vec![2u8; bs]);
    write_file(&engine, "/three", &vec![3u8; bs]);
    // Punch a hole in the middle of the position namespace.
    engine.unlink("/two").unwrap();
    let extent_one = engine.file_extent("/one").unwrap();
    assert_eq!(extent_one, (0, 0, 2));
    engine.shutdown().unwrap();

    let engine = Engine::mount(cfg).unwrap();
    assert_eq!(engine.file_extent("/one").unwrap(), extent_one);
    // The hole is still the first fit after remount.
    write_file(&engine, "/four", &vec![4u8; bs]);
    let (_, pos, _) = engine.file_extent("/four").unwrap();
    assert_eq!(pos, 2);
    engine.shutdown().unwrap();
}
