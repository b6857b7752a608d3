//! Partition Meta Page (§3, §4.5): the small fixed-layout page each
//! partition carries alongside its two trees, and the logic for
//! copying one into a freshly-defragmented partition.

use std::sync::Arc;

use crate::error::DefragError;
use crate::pagestore::{PageFlag, PageId, PageMemory};
use crate::tree::{DataRow, FreeList, RowLink};
use crate::types::DefragResult;
use crate::utils::HandyRwLock;

/// Oldest meta layout version this engine still reads (§3: "versions
/// 1–3 supported").
pub const MIN_SUPPORTED_META_VERSION: u8 = 1;
/// Newest meta layout version this engine reads *and writes*.
pub const MAX_SUPPORTED_META_VERSION: u8 = 3;

const GAPS_BLOB_CACHE_ID: u32 = u32::MAX;

/// `{ partitionState, size, updateCounter, globalRemoveId,
/// countersPageId, gapsLink, encryptedPageCount, encryptedPageIndex }`
/// (§3), plus the version tag that gates which fields a given on-disk
/// page actually carries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionMeta {
    pub version: u8,
    pub partition_state: u8,
    pub size: u64,
    pub update_counter: u64,
    pub global_remove_id: u64,
    /// Page id of the shared-group per-cache sizes chain, or `None`.
    pub counters_page_id: Option<u32>,
    /// Link to the update-counter gaps blob, or `None`.
    pub gaps_link: Option<RowLink>,
    pub encrypted_page_count: u32,
    pub encrypted_page_index: u32,
}

const META_LEN: usize = 1 + 1 + 8 + 8 + 8 + 4 + 8 + 4 + 4;

impl PartitionMeta {
    pub fn encode(&self) -> [u8; META_LEN] {
        let mut buf = [0u8; META_LEN];
        let mut off = 0;
        buf[off] = self.version;
        off += 1;
        buf[off] = self.partition_state;
        off += 1;
        buf[off..off + 8].copy_from_slice(&self.size.to_be_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.update_counter.to_be_bytes());
        off += 8;
        buf[off..off + 8].copy_from_slice(&self.global_remove_id.to_be_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.counters_page_id.unwrap_or(0).to_be_bytes());
        off += 4;
        buf[off..off + 8]
            .copy_from_slice(&self.gaps_link.map(|l| l.as_u64()).unwrap_or(0).to_be_bytes());
        off += 8;
        buf[off..off + 4].copy_from_slice(&self.encrypted_page_count.to_be_bytes());
        off += 4;
        buf[off..off + 4].copy_from_slice(&self.encrypted_page_index.to_be_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> DefragResult<Self> {
        if bytes.len() < META_LEN {
            return Err(DefragError::page_io("partition meta page truncated"));
        }
        let mut off = 0;
        let version = bytes[off];
        off += 1;
        let partition_state = bytes[off];
        off += 1;
        let size = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
        let update_counter = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
        let global_remove_id = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
        let counters_raw = u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap());
        off += 4;
        let gaps_raw = u64::from_be_bytes(bytes[off..off + 8].try_into().unwrap());
        off += 8;
        let encrypted_page_count = u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap());
        off += 4;
        let encrypted_page_index = u32::from_be_bytes(bytes[off..off + 4].try_into().unwrap());

        if !(MIN_SUPPORTED_META_VERSION..=MAX_SUPPORTED_META_VERSION).contains(&version) {
            return Err(DefragError::unsupported_meta_version(version));
        }

        Ok(PartitionMeta {
            version,
            partition_state,
            size,
            update_counter,
            global_remove_id,
            counters_page_id: if counters_raw == 0 {
                None
            } else {
                Some(counters_raw)
            },
            gaps_link: if gaps_raw == 0 {
                None
            } else {
                Some(RowLink::from_u64(gaps_raw))
            },
            encrypted_page_count,
            encrypted_page_index,
        })
    }

    pub fn read(memory: &PageMemory, partition: u16, meta_idx: u32) -> DefragResult<Self> {
        let page = memory.pin(PageId::new(partition, PageFlag::Data, meta_idx))?;
        Self::decode(&page.rl())
    }

    pub fn write(&self, memory: &PageMemory, partition: u16, meta_idx: u32) -> DefragResult<()> {
        let page = memory.pin(PageId::new(partition, PageFlag::Data, meta_idx))?;
        let encoded = self.encode();
        page.wl()[0..encoded.len()].copy_from_slice(&encoded);
        Ok(())
    }
}

/// Copy one partition's meta page into the new partition being built
/// (§4.5). `encrypted` reflects whether the owning cache group is
/// encrypted; per the §9 open-question resolution this engine does not
/// silently drop non-zero `encryptedPageCount`/`Index` for an encrypted
/// group — see DESIGN.md.
#[allow(clippy::too_many_arguments)]
pub fn copy_partition_meta(
    old_memory: &PageMemory,
    old_partition: u16,
    old_meta_idx: u32,
    old_free_list: &FreeList,
    new_memory: &Arc<PageMemory>,
    new_partition: u16,
    new_meta_idx: u32,
    new_free_list: &FreeList,
    encrypted: bool,
) -> DefragResult<PartitionMeta> {
    let old_meta = PartitionMeta::read(old_memory, old_partition, old_meta_idx)?;

    if encrypted && (old_meta.encrypted_page_count != 0 || old_meta.encrypted_page_index != 0) {
        return Err(DefragError::encrypted_meta_loss(format!(
            "partition {} carries non-zero encrypted page bookkeeping (count={}, index={}); \
             this engine cannot preserve it across defragmentation",
            old_partition, old_meta.encrypted_page_count, old_meta.encrypted_page_index
        )));
    }

    let mut new_meta = PartitionMeta {
        version: old_meta.version,
        partition_state: old_meta.partition_state,
        size: old_meta.size,
        update_counter: old_meta.update_counter,
        global_remove_id: old_meta.global_remove_id,
        counters_page_id: None,
        gaps_link: None,
        // §9 open question: the source always resets these to 0 on
        // write, even when non-zero; for a non-encrypted group that is
        // harmless (the fields are meaningless), so this engine
        // reproduces that behavior rather than inventing new semantics.
        encrypted_page_count: 0,
        encrypted_page_index: 0,
    };

    if let Some(old_counters_page) = old_meta.counters_page_id {
        let blob = read_counters_blob(old_memory, old_partition, old_counters_page)?;
        let new_page_id = write_counters_blob(new_memory, new_partition, &blob)?;
        new_meta.counters_page_id = Some(new_page_id);
    }

    if let Some(old_gaps_link) = old_meta.gaps_link {
        let gaps_row = old_free_list.get_row(old_gaps_link)?;
        let mut blob_row = DataRow::new(
            Some(GAPS_BLOB_CACHE_ID),
            Vec::new(),
            gaps_row.value,
            0,
            0,
        );
        let new_link = new_free_list.insert_data_row(&mut blob_row)?;
        new_meta.gaps_link = Some(new_link);
    }

    new_meta.write(new_memory, new_partition, new_meta_idx)?;
    Ok(new_meta)
}

/// Reads the shared-group per-cache sizes chain. In this crate's
/// standalone embedding the chain is a single dedicated data page
/// holding a flat `(cacheId: u32, size: u64)*` table; a real embedder's
/// `countersPageId` instead names a page managed by the surrounding
/// cache-group context (§6).
fn read_counters_blob(memory: &PageMemory, partition: u16, page_idx: u32) -> DefragResult<Vec<u8>> {
    let page = memory.pin(PageId::new(partition, PageFlag::Data, page_idx))?;
    Ok(page.rl().clone())
}

fn write_counters_blob(memory: &Arc<PageMemory>, partition: u16, blob: &[u8]) -> DefragResult<u32> {
    let (pid, page) = memory.allocate(partition, PageFlag::Data)?;
    let mut guard = page.wl();
    let n = blob.len().min(guard.len());
    guard[..n].copy_from_slice(&blob[..n]);
    Ok(pid.index())
}
