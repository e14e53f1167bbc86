//! End-to-end scenarios against a real (tempfile-backed) device, exercising
//! round-trip I/O, snapshot isolation, snapshot merge, sparse writes,
//! rename persistence, slot reuse, and the named boundary behaviors.

use dbs_core::*;

fn make_device(mib: u64) -> tempfile::NamedTempFile {
    let tmp = tempfile::NamedTempFile::new().unwrap();
    tmp.as_file().set_len(mib * 1024 * 1024).unwrap();
    tmp
}

const GIB: u64 = 1024 * 1024 * 1024;

#[test]
fn round_trip_write_read_unmap() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "vol1", GIB, false).unwrap();

    let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
    let pattern = vec![0xA5u8; BLOCK_SIZE as usize];
    vc.write_block(0, &pattern, true).unwrap();

    let mut out = vec![0u8; BLOCK_SIZE as usize];
    vc.read_block(0, &mut out).unwrap();
    assert_eq!(out, pattern);

    vc.unmap_block(0).unwrap();
    vc.read_block(0, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
    vc.close_volume().unwrap();
}

#[test]
fn snapshot_isolation() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "vol1", GIB, false).unwrap();

    let pattern_a5 = vec![0xA5u8; BLOCK_SIZE as usize];
    let initial_snapshot_id;
    {
        let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
        vc.write_block(0, &pattern_a5, true).unwrap();
        initial_snapshot_id = vc.tip_snapshot_id;
        vc.close_volume().unwrap();
    }

    create_snapshot(path, "vol1", false).unwrap();
    {
        let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
        let pattern_5a = vec![0x5Au8; BLOCK_SIZE as usize];
        vc.write_block(0, &pattern_5a, true).unwrap();
        vc.close_volume().unwrap();
    }

    clone_snapshot(path, "clone_of_initial", initial_snapshot_id, false).unwrap();
    let mut vc = VolumeContext::open_volume(path, "clone_of_initial", false).unwrap();
    let mut out = vec![0u8; BLOCK_SIZE as usize];
    vc.read_block(0, &mut out).unwrap();
    assert_eq!(out, pattern_a5);
    vc.close_volume().unwrap();
}

#[test]
fn snapshot_merge_preserves_visible_data() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "vol1", GIB, false).unwrap();

    let pattern_orig = vec![0x11u8; BLOCK_SIZE as usize];
    let pattern_mid = vec![0x22u8; BLOCK_SIZE as usize];
    // block 300 lives in extent 1 (300 >> 8 == 1), a different extent than
    // block 0's (extent 0), so writing it only at the middle snapshot keeps
    // it absent from the initial snapshot's extent map entirely.
    let other_block = 300u64;

    let initial_sid;
    {
        let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
        vc.write_block(0, &pattern_orig, true).unwrap();
        initial_sid = vc.tip_snapshot_id;
        vc.close_volume().unwrap();
    }

    create_snapshot(path, "vol1", false).unwrap();
    let middle_sid;
    {
        let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
        vc.write_block(other_block, &pattern_mid, true).unwrap();
        middle_sid = vc.tip_snapshot_id;
        vc.close_volume().unwrap();
    }

    create_snapshot(path, "vol1", false).unwrap();
    delete_snapshot(path, middle_sid, false).unwrap();

    let mut out = vec![0u8; BLOCK_SIZE as usize];
    {
        let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
        vc.read_block(0, &mut out).unwrap();
        assert_eq!(out, pattern_orig);
        vc.read_block(other_block, &mut out).unwrap();
        assert_eq!(out, pattern_mid);
        vc.close_volume().unwrap();
    }

    clone_snapshot(path, "clone_of_initial", initial_sid, false).unwrap();
    let mut vc = VolumeContext::open_volume(path, "clone_of_initial", false).unwrap();
    vc.read_block(0, &mut out).unwrap();
    assert_eq!(out, pattern_orig);
    vc.read_block(other_block, &mut out).unwrap();
    assert!(out.iter().all(|&b| b == 0));
    vc.close_volume().unwrap();
}

#[test]
fn sparse_write_isolates_neighboring_blocks() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "vol1", 3 * GIB, false).unwrap();

    let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
    let pattern = vec![0x77u8; BLOCK_SIZE as usize];
    let indices: Vec<u64> = vec![0, 3, 43, 53, 92, 100, 103, 992];
    for &i in &indices {
        vc.write_block(i, &pattern, true).unwrap();
    }

    let mut out = vec![0u8; BLOCK_SIZE as usize];
    for &i in &indices {
        vc.read_block(i, &mut out).unwrap();
        assert_eq!(out, pattern, "index {i} should hold the written pattern");
        for neighbor in [i + 1, i.wrapping_sub(1)] {
            if indices.contains(&neighbor) {
                continue;
            }
            vc.read_block(neighbor, &mut out).unwrap();
            assert!(out.iter().all(|&b| b == 0), "index {neighbor} should read zero");
        }
    }
    vc.close_volume().unwrap();
}

#[test]
fn rename_persists_across_reopen() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "a", GIB, false).unwrap();
    rename_volume(path, "a", "b", false).unwrap();

    let volumes = volume_info(path, false).unwrap();
    assert_eq!(volumes.len(), 1);
    assert_eq!(volumes[0].name, "b");
}

#[test]
fn delete_frees_volume_slot_for_reuse() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "vol1", GIB, false).unwrap();
    create_volume(path, "vol2", GIB, false).unwrap();
    create_volume(path, "vol3", GIB, false).unwrap();
    delete_volume(path, "vol2", false).unwrap();
    create_volume(path, "vol2new", GIB, false).unwrap();

    let volumes = volume_info(path, false).unwrap();
    let names: Vec<&str> = volumes.iter().map(|v| v.name.as_str()).collect();
    assert_eq!(names, vec!["vol1", "vol2new", "vol3"]);
}

#[test]
fn creating_257th_volume_fails() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    for i in 0..MAX_VOLUMES {
        create_volume(path, &format!("v{i}"), EXTENT_SIZE, false).unwrap();
    }
    let err = create_volume(path, "one_too_many", EXTENT_SIZE, false).unwrap_err();
    assert!(matches!(err, DbsError::OutOfVolumeSlots(_)));
}

#[test]
fn creating_65536th_snapshot_fails() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "vol1", EXTENT_SIZE, false).unwrap();
    for _ in 0..(MAX_SNAPSHOTS - 1) {
        create_snapshot(path, "vol1", false).unwrap();
    }
    let err = create_snapshot(path, "vol1", false).unwrap_err();
    assert!(matches!(err, DbsError::OutOfSnapshotSlots(_)));
}

#[test]
fn write_past_volume_end_fails_out_of_range() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    create_volume(path, "vol1", EXTENT_SIZE, false).unwrap();

    let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
    let pattern = vec![0u8; BLOCK_SIZE as usize];
    let err = vc.write_block(BLOCKS_PER_EXTENT, &pattern, true).unwrap_err();
    assert!(matches!(err, DbsError::OutOfRange { .. }));
    vc.close_volume().unwrap();
}

#[test]
fn clone_without_enough_space_fails_and_leaves_state_unchanged() {
    let tmp = make_device(100);
    let path = tmp.path();
    init_device(path, false).unwrap();
    let total = device_info(path, false).unwrap().total_device_extents as u64;

    create_volume(path, "vol1", total * EXTENT_SIZE, false).unwrap();
    {
        let mut vc = VolumeContext::open_volume(path, "vol1", false).unwrap();
        let pattern = vec![0x33u8; BLOCK_SIZE as usize];
        for v in 0..(total - 1) {
            vc.write_block(v * BLOCKS_PER_EXTENT, &pattern, true).unwrap();
        }
        vc.close_volume().unwrap();
    }

    create_volume(path, "vol2", EXTENT_SIZE, false).unwrap();
    let vol2_root_sid = {
        let mut vc = VolumeContext::open_volume(path, "vol2", false).unwrap();
        let pattern = vec![0x44u8; BLOCK_SIZE as usize];
        vc.write_block(0, &pattern, true).unwrap();
        let sid = vc.tip_snapshot_id;
        vc.close_volume().unwrap();
        sid
    };

    let before = device_info(path, false).unwrap();
    let err = clone_snapshot(path, "vol2_clone", vol2_root_sid, false).unwrap_err();
    assert!(matches!(err, DbsError::NoSpace));
    let after = device_info(path, false).unwrap();
    assert_eq!(before, after);
}

#[test]
fn opening_uninitialized_device_fails() {
    let tmp = make_device(100);
    let err = device_info(tmp.path(), false).unwrap_err();
    assert!(matches!(err, DbsError::NotInitialized));
}

#[test]
fn vacuum_device_is_not_implemented() {
    let tmp = make_device(100);
    let err = vacuum_device(tmp.path()).unwrap_err();
    assert!(matches!(err, DbsError::NotImplemented(_)));
}
