//! Online compaction tests.

use std::time::Duration;

use haystore::{Needle, StoreConfig, StoreError, Volume};
use pretty_assertions::assert_eq;
use tempfile::TempDir;

fn fast_conf() -> StoreConfig {
    StoreConfig {
        index_merge_delay: Duration::from_millis(20),
        index_merge_write: 4,
        del_batch: 1,
        del_delay: Duration::from_millis(10),
        ..StoreConfig::default()
    }
}

fn open_volume(dir: &TempDir, id: u32) -> Volume {
    Volume::open(
        id,
        dir.path().join(format!("{id}.block")),
        dir.path().join(format!("{id}.idx")),
        fast_conf(),
    )
    .unwrap()
}

fn needle(key: i64, data: &[u8]) -> Needle {
    Needle::new(key, key as i32, data.to_vec()).unwrap()
}

#[test]
fn compaction_drops_dead_records_and_keeps_serving() {
    let dir = TempDir::new().unwrap();
    {
        let volume = open_volume(&dir, 1);
        for k in 1..=6 {
            volume.write(&needle(k, format!("needle-{k}").as_bytes())).unwrap();
        }
        volume.delete(2).unwrap();
        volume.delete(4).unwrap();
        // reopen so the delete flags are guaranteed on disk before the scan
        volume.close().unwrap();
    }
    let volume = open_volume(&dir, 1);
    let size_before = std::fs::metadata(dir.path().join("1.block")).unwrap().len();

    let dst = open_volume(&dir, 2);
    volume.start_compact(&dst).unwrap();

    // traffic while the compaction is pending
    assert!(matches!(
        volume.start_compact(&dst),
        Err(StoreError::VolumeInCompact)
    ));
    volume.delete(5).unwrap();
    volume.write(&needle(7, b"written mid-compaction")).unwrap();
    assert_eq!(volume.read(1, 1).unwrap().data, b"needle-1");

    volume.stop_compact(dst).unwrap();

    // live keys survive, including the tail write
    assert_eq!(volume.read(1, 1).unwrap().data, b"needle-1");
    assert_eq!(volume.read(3, 3).unwrap().data, b"needle-3");
    assert_eq!(volume.read(6, 6).unwrap().data, b"needle-6");
    assert_eq!(volume.read(7, 7).unwrap().data, b"written mid-compaction");

    // pre-compaction deletes were never copied
    assert!(matches!(
        volume.read(2, 2),
        Err(StoreError::NeedleNotExist(2))
    ));
    assert!(matches!(
        volume.read(4, 4),
        Err(StoreError::NeedleNotExist(4))
    ));
    // the mid-compaction delete was replayed
    assert!(matches!(
        volume.read(5, 5),
        Err(StoreError::NeedleDeleted(5))
    ));

    // dead records are gone from the new block
    let size_after = std::fs::metadata(dir.path().join("2.block")).unwrap().len();
    assert!(size_after < size_before);

    // the volume stays fully usable after the swap
    volume.write(&needle(8, b"after compaction")).unwrap();
    assert_eq!(volume.read(8, 8).unwrap().data, b"after compaction");
    volume.delete(8).unwrap();
    volume.close().unwrap();
}

#[test]
fn compacted_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    {
        let volume = open_volume(&dir, 1);
        for k in 1..=4 {
            volume.write(&needle(k, b"compact me")).unwrap();
        }
        volume.delete(1).unwrap();
        volume.close().unwrap();
    }
    {
        let volume = open_volume(&dir, 1);
        let dst = open_volume(&dir, 2);
        volume.start_compact(&dst).unwrap();
        volume.stop_compact(dst).unwrap();
        volume.write(&needle(9, b"post swap")).unwrap();
        volume.close().unwrap();
    }
    // the swapped-in block and index are what reopen sees
    let volume = Volume::open(
        2,
        dir.path().join("2.block"),
        dir.path().join("2.idx"),
        fast_conf(),
    )
    .unwrap();
    assert!(matches!(
        volume.read(1, 1),
        Err(StoreError::NeedleNotExist(1))
    ));
    assert_eq!(volume.read(2, 2).unwrap().data, b"compact me");
    assert_eq!(volume.read(9, 9).unwrap().data, b"post swap");
    volume.close().unwrap();
}

#[test]
fn retired_offsets_stay_with_their_block_across_the_swap() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    for k in 1..=3 {
        volume.write(&needle(k, b"first version")).unwrap();
    }
    let dst = open_volume(&dir, 2);
    volume.start_compact(&dst).unwrap();
    // the overwrite retires an old-block offset while the compaction is
    // pending; the flag flip must land in the old block, never the new one
    volume.write(&needle(2, b"second version")).unwrap();
    volume.delete(3).unwrap();
    volume.stop_compact(dst).unwrap();

    assert_eq!(volume.read(1, 1).unwrap().data, b"first version");
    assert_eq!(volume.read(2, 2).unwrap().data, b"second version");
    assert!(matches!(
        volume.read(3, 3),
        Err(StoreError::NeedleDeleted(3))
    ));
    // let the adopted flusher drain anything still queued
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(volume.read(1, 1).unwrap().data, b"first version");
    assert_eq!(volume.read(2, 2).unwrap().data, b"second version");
    volume.close().unwrap();

    // reopening the swapped-in block proves no stray flag flips landed
    let volume = Volume::open(
        2,
        dir.path().join("2.block"),
        dir.path().join("2.idx"),
        fast_conf(),
    )
    .unwrap();
    assert_eq!(volume.read(1, 1).unwrap().data, b"first version");
    assert_eq!(volume.read(2, 2).unwrap().data, b"second version");
    assert!(matches!(
        volume.read(3, 3),
        Err(StoreError::NeedleDeleted(3))
    ));
    volume.close().unwrap();
}

#[test]
fn stop_without_start_is_an_error() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    let dst = open_volume(&dir, 2);
    assert!(matches!(
        volume.stop_compact(dst),
        Err(StoreError::VolumeNotInCompact)
    ));
    volume.close().unwrap();
}

#[test]
fn failed_compaction_resets_state() {
    let dir = TempDir::new().unwrap();
    let volume = open_volume(&dir, 1);
    volume.write(&needle(1, b"x")).unwrap();
    let dst = open_volume(&dir, 2);
    dst.close().unwrap();
    // writing into a closed destination fails and clears the running flag
    assert!(volume.start_compact(&dst).is_err());
    drop(dst);
    let dst2 = open_volume(&dir, 3);
    volume.start_compact(&dst2).unwrap();
    volume.stop_compact(dst2).unwrap();
    assert_eq!(volume.read(1, 1).unwrap().data, b"x");
    volume.close().unwrap();
}
