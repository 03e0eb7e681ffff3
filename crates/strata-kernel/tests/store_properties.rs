//! Container-level properties of the store: in-place vs append writes,
//! waste accounting, compaction, and index growth into file data.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use strata_kernel::config::StoreConfig;
use strata_kernel::sync::EventQueue;
use strata_kernel::vfs::Vfs;
use tempfile::TempDir;

/// Open a store with compaction slack and background flushes out of the way.
fn open(container: &Path) -> Arc<Vfs> {
    let mut config = StoreConfig::at(container);
    config.index_reserve = 0;
    config.flush_debounce_ms = 60_000;
    config.compaction_debounce_ms = 60_000;
    let events = Arc::new(EventQueue::new(Duration::ZERO, Duration::from_secs(30)));
    Vfs::open(&config, events, None).expect("open store")
}

/// Length prefix of the on-disk index.
fn header_index_len(container: &Path) -> u64 {
    let bytes = std::fs::read(container).expect("read container");
    let len = u32::from_le_bytes(bytes[..4].try_into().unwrap());
    4 + len as u64
}

/// Every live file's content.
fn snapshot(vfs: &Vfs) -> BTreeMap<String, Vec<u8>> {
    vfs.list_paths()
        .unwrap()
        .into_iter()
        .filter(|p| vfs.stat(p).map(|a| a.is_file()).unwrap_or(false))
        .map(|p| {
            let bytes = vfs.read(&p).unwrap();
            (p, bytes)
        })
        .collect()
}

#[test]
fn test_overwrite_delete_compact_scenario() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("c.bin");
    let vfs = open(&container);

    vfs.write("/a.txt", b"0123456789").unwrap();
    let first = vfs.stats().unwrap();
    assert_eq!(first.wasted, 0);

    vfs.write("/a.txt", b"9876543210").unwrap();
    let same = vfs.stats().unwrap();
    assert_eq!(same.container_len, first.container_len, "same-size write stays in place");
    assert_eq!(same.wasted, 0);

    vfs.write("/a.txt", &[7u8; 20]).unwrap();
    let grown = vfs.stats().unwrap();
    assert_eq!(grown.container_len, first.container_len + 20);
    assert_eq!(grown.wasted, 10);

    vfs.unlink("/a.txt").unwrap();
    let deleted = vfs.stats().unwrap();
    assert_eq!(deleted.wasted, grown.wasted + 20);

    let report = vfs.compact().unwrap();
    assert_eq!(report.live_bytes, 0);
    assert_eq!(report.reclaimed(), report.before - report.after);
    let compacted = vfs.stats().unwrap();
    assert_eq!(compacted.wasted, 0);
    assert_eq!(compacted.container_len, report.after);

    vfs.close_store().unwrap();
    let on_disk = std::fs::metadata(&container).unwrap().len();
    assert_eq!(on_disk, header_index_len(&container), "only header and index remain");
}

#[test]
fn test_compaction_preserves_every_file() {
    let dir = TempDir::new().unwrap();
    let vfs = open(&dir.path().join("c.bin"));
    vfs.mkdir("/d/e", true, None).unwrap();

    // Deterministic mix of creates, resizes, overwrites and deletes.
    let mut seed: u64 = 0x5eed;
    let mut next = || {
        seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (seed >> 33) as usize
    };
    for round in 0..300 {
        let path = match next() % 3 {
            0 => format!("/f{}", next() % 20),
            1 => format!("/d/f{}", next() % 20),
            _ => format!("/d/e/f{}", next() % 20),
        };
        if next() % 5 == 0 {
            let _ = vfs.unlink(&path);
        } else {
            let len = next() % 64;
            let body: Vec<u8> = (0..len).map(|i| (i + round) as u8).collect();
            vfs.write(&path, &body).unwrap();
        }
    }

    let before = snapshot(&vfs);
    assert!(vfs.stats().unwrap().wasted > 0);
    vfs.compact().unwrap();
    assert_eq!(vfs.stats().unwrap().wasted, 0);
    assert_eq!(snapshot(&vfs), before);
    assert!(vfs.stat("/d/e").unwrap().is_dir());
}

#[test]
fn test_index_growth_into_data_compacts_instead() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("c.bin");
    let vfs = open(&container);

    // A tight layout: the first file starts right after the index.
    vfs.compact().unwrap();
    let body: Vec<u8> = (0..4096u32).map(|i| (i % 251) as u8).collect();
    vfs.write("/data.bin", &body).unwrap();
    vfs.flush().unwrap();

    let long = "x".repeat(200);
    for i in 0..64 {
        vfs.mkdir(&format!("/{long}{i}"), false, None).unwrap();
    }
    vfs.write(&format!("/{long}0/tail"), b"tail").unwrap();
    vfs.flush().unwrap();
    assert_eq!(vfs.stats().unwrap().wasted, 0, "flush compacted rather than overlap");
    vfs.close_store().unwrap();
    drop(vfs);

    let reopened = open(&container);
    assert_eq!(reopened.read("/data.bin").unwrap(), body);
    assert_eq!(reopened.read(&format!("/{long}0/tail")).unwrap(), b"tail");
    assert_eq!(reopened.readdir("/").unwrap().len(), 65);
}

#[test]
fn test_index_survives_reopen_after_lazy_flush() {
    let dir = TempDir::new().unwrap();
    let container = dir.path().join("c.bin");
    let mut config = StoreConfig::at(&container);
    config.flush_debounce_ms = 10;
    let events = Arc::new(EventQueue::new(Duration::ZERO, Duration::from_secs(30)));
    let vfs = Vfs::open(&config, events.clone(), None).unwrap();

    vfs.write("/lazy", b"persisted by maintenance").unwrap();
    let start = std::time::Instant::now();
    while vfs.stats().unwrap().index_dirty && start.elapsed() < Duration::from_secs(5) {
        std::thread::sleep(Duration::from_millis(10));
    }
    assert!(!vfs.stats().unwrap().index_dirty);
    vfs.close_store().unwrap();
    drop(vfs);

    let reopened = Vfs::open(&config, events, None).unwrap();
    assert_eq!(reopened.read("/lazy").unwrap(), b"persisted by maintenance");
}
