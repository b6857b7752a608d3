//! End-to-end scenarios over the coordinator (§8): each test seeds a
//! group's live partitions directly through the public page-store/tree
//! API (standing in for a real cache-group context), runs a full
//! `Defragmenter::run`, and checks the on-disk outcome.

use std::sync::Arc;

use partition_defrag::config::{CacheGroupId, INDEX_PARTITION};
use partition_defrag::coordinator::{CacheGroupSpec, Defragmenter};
use partition_defrag::external::{
    InMemoryIndexDefragmenter, InMemoryMaintenanceRegistry, NoIndexing, NoopDbMgr,
};
use partition_defrag::layout::GroupLayout;
use partition_defrag::meta::PartitionMeta;
use partition_defrag::pagestore::{FilePageStore, PageFlag, PageId, PageMemory};
use partition_defrag::partition::PartitionStore;
use partition_defrag::tree::{CacheDataEntry, DataRow};
use partition_defrag::DefragConfig;

const PAGE_SIZE: usize = 512;

fn seed_partition(
    layout: &GroupLayout,
    partition: u32,
    rows: &[(u64, &[u8], &[u8], u64)],
    gaps_blob: Option<&[u8]>,
) {
    layout.ensure_dir().unwrap();
    let store = FilePageStore::create(layout.live_partition(partition), PAGE_SIZE).unwrap();
    let memory = Arc::new(PageMemory::new());
    memory.register_store(partition as u16, Arc::new(store));
    let p = PartitionStore::create(memory.clone(), partition as u16).unwrap();

    for (hash, key, value, expire_time) in rows {
        let mut row = DataRow::new(Some(1), key.to_vec(), value.to_vec(), 1, *expire_time);
        let link = p.free_list.insert_data_row(&mut row).unwrap();
        p.cache_tree
            .put(&CacheDataEntry {
                cache_id: Some(1),
                hash: *hash,
                key: key.to_vec(),
                link,
            })
            .unwrap();
    }
    p.free_list.save_metadata().unwrap();

    let gaps_link = gaps_blob.map(|bytes| {
        let mut row = DataRow::new(Some(u32::MAX), Vec::new(), bytes.to_vec(), 0, 0);
        p.free_list.insert_data_row(&mut row).unwrap()
    });

    let meta = PartitionMeta {
        version: 3,
        partition_state: 0,
        size: rows.len() as u64,
        update_counter: 0,
        global_remove_id: 0,
        counters_page_id: None,
        gaps_link,
        encrypted_page_count: 0,
        encrypted_page_index: 0,
    };
    p.write_meta(&meta).unwrap();
    memory.flush_partition(partition as u16).unwrap();
}

fn run_group(
    dir: &std::path::Path,
    group: CacheGroupId,
    partition_count: u32,
) -> GroupLayout {
    let layout = GroupLayout::new(dir, group);
    let config = DefragConfig::new(dir).with_page_size(PAGE_SIZE);
    let defrag = Defragmenter::new(config);
    let specs = vec![CacheGroupSpec {
        group,
        partition_count,
        encrypted: false,
        inline_cache_id: true,
    }];
    defrag
        .run(
            &NoopDbMgr,
            &InMemoryMaintenanceRegistry,
            &InMemoryIndexDefragmenter,
            &specs,
        )
        .unwrap();
    layout
}

/// E1: a group with empty partitions still completes and is a no-op on
/// the second run.
#[test]
fn e1_empty_group_completes_and_is_idempotent_on_rerun() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 1);
    for n in 0..4 {
        seed_partition(&layout, n, &[], None);
    }

    run_group(dir.path(), 1, 4);
    assert!(layout.group_already_complete());
    for n in 0..4 {
        assert!(layout.live_partition(n).exists());
        assert!(!layout.dfrg_tmp(n).exists());
    }
    assert!(layout.index_final().exists());

    // second run over an already-complete group touches nothing.
    let config = DefragConfig::new(dir.path()).with_page_size(PAGE_SIZE);
    let defrag = Defragmenter::new(config);
    let specs = vec![CacheGroupSpec {
        group: 1,
        partition_count: 4,
        encrypted: false,
        inline_cache_id: true,
    }];
    defrag
        .run(&NoopDbMgr, &InMemoryMaintenanceRegistry, &NoIndexing, &specs)
        .unwrap();
    assert!(layout.group_already_complete());
}

/// E2: a single dense partition's rows all survive in key order with a
/// full link map and matching meta size.
#[test]
fn e2_dense_partition_preserves_rows_in_key_order() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 2);
    let owned: Vec<(u64, String, String)> = (0u64..500)
        .map(|i| (i, format!("k{}", i), format!("v{}", i)))
        .collect();
    let rows: Vec<(u64, &[u8], &[u8], u64)> = owned
        .iter()
        .map(|(h, k, v)| (*h, k.as_bytes(), v.as_bytes(), 0u64))
        .collect();
    seed_partition(&layout, 0, &rows, None);

    run_group(dir.path(), 2, 1);

    let store = FilePageStore::open(layout.live_partition(0), PAGE_SIZE).unwrap();
    let memory = Arc::new(PageMemory::new());
    memory.register_store(0, Arc::new(store));
    let reopened = PartitionStore::open(memory, 0).unwrap();
    assert_eq!(reopened.cache_tree.len(), 500);
    assert_eq!(reopened.read_meta().unwrap().size, 500);

    let mut clock = partition_defrag::checkpoint::YieldClock::new(std::time::Duration::from_millis(150));
    let mut seen = Vec::new();
    reopened
        .cache_tree
        .iterate(&mut clock, |e| { seen.push(e.hash); Ok(true) }, || {})
        .unwrap();
    assert_eq!(seen, (0u64..500).collect::<Vec<_>>());
}

/// E3: every 7th row carries a TTL; the new Pending Entries Tree must
/// hold exactly that many rows.
#[test]
fn e3_ttl_rows_land_in_pending_tree() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 3);
    let owned: Vec<(u64, String, String, u64)> = (0u64..1000)
        .map(|i| {
            let expire = if i % 7 == 0 { 1_700_000_000_000 } else { 0 };
            (i, format!("k{}", i), "v".to_string(), expire)
        })
        .collect();
    let rows: Vec<(u64, &[u8], &[u8], u64)> = owned
        .iter()
        .map(|(h, k, v, e)| (*h, k.as_bytes(), v.as_bytes(), *e))
        .collect();
    seed_partition(&layout, 0, &rows, None);

    run_group(dir.path(), 3, 1);

    let store = FilePageStore::open(layout.live_partition(0), PAGE_SIZE).unwrap();
    let memory = Arc::new(PageMemory::new());
    memory.register_store(0, Arc::new(store));
    let reopened = PartitionStore::open(memory, 0).unwrap();
    let expected = (0u64..1000).filter(|i| i % 7 == 0).count() as u32;
    assert_eq!(reopened.pending_tree.len(), expected);
}

/// E5: a non-empty gaps blob survives defragmentation byte-for-byte,
/// reachable through the new meta's `gaps_link`.
#[test]
fn e5_gaps_link_blob_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 5);
    let blob = vec![7u8; 37];
    seed_partition(&layout, 0, &[(1, b"a", b"va", 0)], Some(&blob));

    run_group(dir.path(), 5, 1);

    let store = FilePageStore::open(layout.live_partition(0), PAGE_SIZE).unwrap();
    let memory = Arc::new(PageMemory::new());
    memory.register_store(0, Arc::new(store));
    let reopened = PartitionStore::open(memory, 0).unwrap();
    let meta = reopened.read_meta().unwrap();
    let gaps_link = meta.gaps_link.expect("gaps link should survive");
    let row = reopened.free_list.get_row(gaps_link).unwrap();
    assert_eq!(row.value, blob);
}

/// E6: crashing after some partitions have been renamed but before the
/// index rebuild still lets a re-run finish and write the marker.
#[test]
fn e6_resumed_run_after_partial_partition_rename_completes() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 6);
    for n in 0..4u32 {
        seed_partition(
            &layout,
            n,
            &[(n as u64, b"k", b"v", 0)],
            None,
        );
    }

    // simulate a crash: rename partitions 0 and 1 as if their pipelines
    // already committed, leave 2 and 3 untouched, and leave no
    // completion marker or index file behind.
    let config = DefragConfig::new(dir.path()).with_page_size(PAGE_SIZE);
    let cp = partition_defrag::checkpoint::CheckpointController::start(config.checkpoint_yield_cadence);
    for n in [0u32, 1] {
        let pipeline = partition_defrag::pipeline::PartitionPipeline {
            group: 6,
            partition: n,
            layout: &layout,
            config: &config,
            cp: cp.clone(),
            encrypted: false,
            inline_cache_id: true,
            metrics: Arc::new(partition_defrag::metrics::NoopMetricsSink),
        };
        let (future, handle) = pipeline.run().unwrap();
        future.wait().unwrap();
        handle.finish().unwrap();
        handle.deregister_link_map();
    }
    cp.stop(true);
    assert!(layout.partition_already_defragmented(0));
    assert!(layout.partition_already_defragmented(1));
    assert!(!layout.group_already_complete());

    // re-run over the whole group: 0 and 1 are skipped by the pipeline
    // skip-check, 2 and 3 get defragmented, then the index/marker/batch
    // rename phases run to completion.
    run_group(dir.path(), 6, 4);

    assert!(layout.group_already_complete());
    for n in 0..4u32 {
        assert!(layout.live_partition(n).exists());
        assert!(!layout.dfrg_final(n).exists());
    }
}

/// A resumed run (§4.4 step 2) still feeds the index rebuilder a Link
/// Map for every partition, keyed by its own partition number — not by
/// its position in the set of partitions this run actually rewrote.
#[test]
fn e6_resumed_run_reopens_link_maps_for_every_partition_by_its_own_number() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 16);
    for n in 0..4u32 {
        seed_partition(&layout, n, &[(n as u64, b"k", b"v", 0)], None);
    }

    let config = DefragConfig::new(dir.path()).with_page_size(PAGE_SIZE);
    let cp = partition_defrag::checkpoint::CheckpointController::start(config.checkpoint_yield_cadence);
    for n in [0u32, 1] {
        let pipeline = partition_defrag::pipeline::PartitionPipeline {
            group: 16,
            partition: n,
            layout: &layout,
            config: &config,
            cp: cp.clone(),
            encrypted: false,
            inline_cache_id: true,
            metrics: Arc::new(partition_defrag::metrics::NoopMetricsSink),
        };
        let (future, handle) = pipeline.run().unwrap();
        future.wait().unwrap();
        handle.finish().unwrap();
        handle.deregister_link_map();
    }
    cp.stop(true);

    run_group(dir.path(), 16, 4);

    let index_store = FilePageStore::open(layout.index_final(), PAGE_SIZE).unwrap();
    let index_memory = Arc::new(PageMemory::new());
    index_memory.register_store(INDEX_PARTITION as u16, Arc::new(index_store));

    let mut seen = Vec::new();
    for idx in 0..4u64 {
        let pid = PageId::new(INDEX_PARTITION as u16, PageFlag::Idx, idx);
        let page = index_memory.pin(pid).unwrap();
        let guard = page.rl();
        let partition = u32::from_be_bytes(guard[0..4].try_into().unwrap());
        let count = u32::from_be_bytes(guard[4..8].try_into().unwrap());
        assert_eq!(count, 1, "partition {} should carry exactly its one row", partition);
        seen.push(partition);
    }
    seen.sort_unstable();
    assert_eq!(seen, vec![0, 1, 2, 3]);
}

/// E7: an out-of-range meta version fails fast with no rename and no
/// marker.
#[test]
fn e7_unsupported_meta_version_fails_without_renaming() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 7);
    layout.ensure_dir().unwrap();

    let store = FilePageStore::create(layout.live_partition(0), PAGE_SIZE).unwrap();
    let memory = Arc::new(PageMemory::new());
    memory.register_store(0, Arc::new(store));
    let p = PartitionStore::create(memory.clone(), 0).unwrap();
    let mut row = DataRow::new(Some(1), b"k".to_vec(), b"v".to_vec(), 1, 0);
    let link = p.free_list.insert_data_row(&mut row).unwrap();
    p.cache_tree
        .put(&CacheDataEntry {
            cache_id: Some(1),
            hash: 1,
            key: b"k".to_vec(),
            link,
        })
        .unwrap();
    p.free_list.save_metadata().unwrap();

    let bad_meta = PartitionMeta {
        version: 4,
        partition_state: 0,
        size: 1,
        update_counter: 0,
        global_remove_id: 0,
        counters_page_id: None,
        gaps_link: None,
        encrypted_page_count: 0,
        encrypted_page_index: 0,
    };
    // write directly, bypassing PartitionMeta::write's own encode so an
    // out-of-range version can actually land on disk.
    let pid = PageId::new(0, PageFlag::Data, partition_defrag::partition::PARTITION_META_IDX);
    let page = memory.pin(pid).unwrap();
    {
        let encoded = bad_meta.encode();
        page.write().unwrap()[0..encoded.len()].copy_from_slice(&encoded);
    }
    memory.flush_partition(0).unwrap();

    let config = DefragConfig::new(dir.path()).with_page_size(PAGE_SIZE);
    let defrag = Defragmenter::new(config);
    let specs = vec![CacheGroupSpec {
        group: 7,
        partition_count: 1,
        encrypted: false,
        inline_cache_id: true,
    }];
    let result = defrag.run(&NoopDbMgr, &InMemoryMaintenanceRegistry, &NoIndexing, &specs);
    assert!(result.is_err());
    assert!(!layout.dfrg_final(0).exists());
    assert!(!layout.group_already_complete());
}

/// A real (non-noop) indexing hook gets a working, registered index
/// page store and its rename lands, visible to the completion marker.
#[test]
fn index_rebuild_gets_a_registered_store_and_commits_the_rename() {
    let dir = tempfile::tempdir().unwrap();
    let layout = GroupLayout::new(dir.path(), 9);
    seed_partition(&layout, 0, &[(1, b"a", b"va", 0)], None);

    run_group(dir.path(), 9, 1);

    assert!(layout.index_final().exists());
    assert!(!layout.index_tmp().exists());
}

#[allow(dead_code)]
fn touch_index_partition_const() -> u32 {
    INDEX_PARTITION
}
