//! [AMap](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/43d8f556-2c0e-4976-8ec7-84e57f8b1234)
//!
//! One bit per 64-byte slot of the file. The AMap is the only structure
//! rewritten in place: the header's validity flag is cleared for the
//! duration of every transaction so a torn write is detected and the map
//! rebuilt from the block BTree on the next open. PMap, FMap and FPMap
//! pages are maintained write-only for older readers; nothing consults
//! them here.

use std::{
    collections::BTreeMap,
    io::{self, Seek, SeekFrom, Write},
    marker::PhantomData,
};

use tracing::{instrument, warn};

use super::{
    block::block_size,
    block_id::PageId,
    btree::{read_btree_page, BTreePage, BlockInfo, NodeInfo},
    byte_index::ByteIndex,
    header::Header,
    page::*,
    *,
};
use crate::{FileIo, PstFile};

/// File offset of the first AMap page.
pub const FIRST_AMAP_PAGE_OFFSET: u64 = 0x4400;

/// Bytes of file covered by one AMap page (including the page itself).
pub const AMAP_PAGE_INTERVAL: u64 = MAP_BITS_SIZE as u64 * 8 * 64;

/// Soft cap on cached AMap pages; beyond it a flush drops the cache.
pub const PAGE_CACHE_THRESH: usize = 1024;

const SLOT_SIZE: u64 = 64;
const SLOTS_PER_PAGE: u32 = (MAP_BITS_SIZE * 8) as u32;

const PMAP_INTERVAL: u64 = 8;
const FMAP_FIRST_INDEX: u64 = 128;
const FMAP_INTERVAL: u64 = MAP_BITS_SIZE as u64;
const FPMAP_FIRST_INDEX: u64 = 128 * 64;
const FPMAP_INTERVAL: u64 = MAP_BITS_SIZE as u64 * 64;

fn has_pmap_page(index: u64) -> bool {
    index % PMAP_INTERVAL == 0
}

fn has_fmap_page(index: u64) -> bool {
    has_pmap_page(index) && index >= FMAP_FIRST_INDEX && (index - FMAP_FIRST_INDEX) % FMAP_INTERVAL == 0
}

fn has_fpmap_page(index: u64) -> bool {
    has_pmap_page(index)
        && index >= FPMAP_FIRST_INDEX
        && (index - FPMAP_FIRST_INDEX) % FPMAP_INTERVAL == 0
}

/// AMap page slots taken by the page itself plus any legacy map pages
/// that land at the start of the same interval.
fn reserved_pages(index: u64) -> u32 {
    let mut reserved = 1;
    if has_pmap_page(index) {
        reserved += 1;
    }
    if has_fmap_page(index) {
        reserved += 1;
    }
    if has_fpmap_page(index) {
        reserved += 1;
    }
    reserved
}

pub(crate) fn amap_page_offset(index: u64) -> u64 {
    FIRST_AMAP_PAGE_OFFSET + index * AMAP_PAGE_INTERVAL
}

/// What a leaf entry pins in the file during a rebuild walk.
trait MarkedAllocation {
    fn marked_allocation<Pst: PstFile>(&self) -> Option<(u64, u64)>;
}

impl MarkedAllocation for NodeInfo {
    fn marked_allocation<Pst: PstFile>(&self) -> Option<(u64, u64)> {
        None
    }
}

impl MarkedAllocation for BlockInfo {
    fn marked_allocation<Pst: PstFile>(&self) -> Option<(u64, u64)> {
        Some((
            self.index.index(),
            u64::from(block_size(
                self.size + super::block::BlockTrailer::size::<Pst>(),
            )),
        ))
    }
}

struct AmapPageState {
    bits: MapBits,
    dirty: bool,
}

impl AmapPageState {
    fn free_slots(&self) -> u32 {
        self.bits.iter().map(|b| b.count_zeros()).sum()
    }
}

/// The in-memory allocation engine; one per open file, shared by every
/// context and guarded by the file-wide lock.
pub(crate) struct AllocationMap<Pst> {
    pages: BTreeMap<u64, AmapPageState>,
    preferred: Option<u64>,
    _variant: PhantomData<Pst>,
}

impl<Pst: PstFile> AllocationMap<Pst> {
    pub(crate) fn new() -> Self {
        Self {
            pages: BTreeMap::new(),
            preferred: None,
            _variant: PhantomData,
        }
    }

    /// Seed the first AMap page of a file being created: its own slot plus
    /// the coincident PMap page, everything else free.
    pub(crate) fn seed_new_file(&mut self, header: &mut Header<Pst>) {
        let reserved = reserved_pages(0);
        let mut bits: MapBits = [0; MAP_BITS_SIZE];
        for byte in bits.iter_mut().take(reserved as usize) {
            *byte = 0xFF;
        }
        self.pages.insert(0, AmapPageState { bits, dirty: true });
        header
            .root_mut()
            .reset_free_size(AMAP_PAGE_INTERVAL - u64::from(reserved) * PAGE_SIZE as u64);
    }

    fn page_count(header: &Header<Pst>) -> u64 {
        let eof = header.root().file_eof_index().index();
        (eof.saturating_sub(FIRST_AMAP_PAGE_OFFSET)).div_ceil(AMAP_PAGE_INTERVAL)
    }

    fn load_page(
        &mut self,
        f: &mut FileIo,
        header: &Header<Pst>,
        index: u64,
    ) -> io::Result<&mut AmapPageState> {
        if index >= Self::page_count(header) {
            return Err(NdbError::AllocationOutOfBounds(amap_page_offset(index), 0).into());
        }
        if !self.pages.contains_key(&index) {
            f.seek(SeekFrom::Start(amap_page_offset(index)))?;
            let page = AllocationMapPage::<Pst>::read(f)?;
            self.pages.insert(
                index,
                AmapPageState {
                    bits: *page.map_bits(),
                    dirty: false,
                },
            );
        }
        Ok(self
            .pages
            .get_mut(&index)
            .unwrap_or_else(|| unreachable!("page was just inserted")))
    }

    /// Rebuild if the header says the map is not trustworthy, then make
    /// sure the density list exists.
    #[instrument(skip_all)]
    pub(crate) fn begin_transaction(
        &mut self,
        f: &mut FileIo,
        header: &mut Header<Pst>,
    ) -> io::Result<()> {
        if header.root().amap_is_valid() != root::AmapStatus::Valid2 {
            warn!(
                name: "PstAmapRebuild",
                "allocation map marked invalid, rebuilding from the block BTree"
            );
            self.rebuild(f, header)?;
        }
        if self.preferred.is_none() {
            f.seek(SeekFrom::Start(DENSITY_LIST_FILE_OFFSET))?;
            if let Ok(dlist) = DensityListPage::<Pst>::read(f) {
                self.preferred = dlist
                    .entries()
                    .iter()
                    .max_by_key(|entry| entry.free_slots())
                    .map(|entry| u64::from(entry.page()));
            }
        }
        Ok(())
    }

    /// Allocate `size` bytes (rounded up to 64-byte slots). With `align`
    /// the result is 512-byte aligned and exactly eight slots long.
    pub(crate) fn allocate(
        &mut self,
        f: &mut FileIo,
        header: &mut Header<Pst>,
        size: u64,
        align: bool,
    ) -> io::Result<u64> {
        if size == 0 || size > AMAP_PAGE_INTERVAL - PAGE_SIZE as u64 {
            return Err(NdbError::InvalidAllocationSize(size).into());
        }
        let slots = if align {
            (PAGE_SIZE as u64 / SLOT_SIZE) as u32
        } else {
            size.div_ceil(SLOT_SIZE) as u32
        };

        if let Some(index) = self.preferred {
            if index < Self::page_count(header) {
                if let Some(offset) = self.try_allocate_in_page(f, header, index, slots, align)? {
                    header.root_mut().adjust_free_size(-i64::from(slots) * 64);
                    return Ok(offset);
                }
            }
        }

        for index in 0..Self::page_count(header) {
            if let Some(offset) = self.try_allocate_in_page(f, header, index, slots, align)? {
                self.preferred = Some(index);
                header.root_mut().adjust_free_size(-i64::from(slots) * 64);
                return Ok(offset);
            }
        }

        // no room anywhere; grow the file by one interval
        let index = self.grow(f, header)?;
        let offset = self
            .try_allocate_in_page(f, header, index, slots, align)?
            .ok_or(NdbError::InvalidAllocationSize(size))?;
        self.preferred = Some(index);
        header.root_mut().adjust_free_size(-i64::from(slots) * 64);
        Ok(offset)
    }

    fn try_allocate_in_page(
        &mut self,
        f: &mut FileIo,
        header: &Header<Pst>,
        index: u64,
        slots: u32,
        align: bool,
    ) -> io::Result<Option<u64>> {
        let page = self.load_page(f, header, index)?;
        let Some(start) = find_free_run(&page.bits, slots, align) else {
            return Ok(None);
        };
        set_bits(&mut page.bits, start, slots, true);
        page.dirty = true;
        Ok(Some(amap_page_offset(index) + u64::from(start) * SLOT_SIZE))
    }

    /// Clear the covering bits; every one of them must currently be set
    /// and the range must stay inside one AMap page's data area.
    pub(crate) fn free(
        &mut self,
        f: &mut FileIo,
        header: &mut Header<Pst>,
        offset: u64,
        size: u64,
    ) -> io::Result<()> {
        let (index, start, slots) = self.locate(header, offset, size)?;
        let page = self.load_page(f, header, index)?;
        if !check_bits(&page.bits, start, slots) {
            return Err(NdbError::FreeOfUnallocatedRange(offset, size).into());
        }
        set_bits(&mut page.bits, start, slots, false);
        page.dirty = true;
        header.root_mut().adjust_free_size(i64::from(slots) * 64);
        Ok(())
    }

    /// Whether every covered bit is set.
    pub(crate) fn is_allocated(
        &mut self,
        f: &mut FileIo,
        header: &Header<Pst>,
        offset: u64,
        size: u64,
    ) -> io::Result<bool> {
        let (index, start, slots) = self.locate(header, offset, size)?;
        let page = self.load_page(f, header, index)?;
        Ok(check_bits(&page.bits, start, slots))
    }

    fn locate(
        &self,
        header: &Header<Pst>,
        offset: u64,
        size: u64,
    ) -> io::Result<(u64, u32, u32)> {
        if offset < FIRST_AMAP_PAGE_OFFSET
            || offset % SLOT_SIZE != 0
            || offset + size > header.root().file_eof_index().index()
        {
            return Err(NdbError::AllocationOutOfBounds(offset, size).into());
        }
        let index = (offset - FIRST_AMAP_PAGE_OFFSET) / AMAP_PAGE_INTERVAL;
        let within = offset - amap_page_offset(index);
        let start = (within / SLOT_SIZE) as u32;
        let slots = size.div_ceil(SLOT_SIZE) as u32;
        if start < (PAGE_SIZE as u64 / SLOT_SIZE) as u32 {
            // the AMap page itself and any coincident legacy pages are
            // never client-addressable
            return Err(NdbError::AllocationOutOfBounds(offset, size).into());
        }
        if start + slots > SLOTS_PER_PAGE {
            return Err(NdbError::AllocationOutOfBounds(offset, size).into());
        }
        Ok((index, start, slots))
    }

    /// Extend the file by one interval and seed its AMap page (plus any
    /// coincident legacy pages) as allocated.
    fn grow(&mut self, f: &mut FileIo, header: &mut Header<Pst>) -> io::Result<u64> {
        let index = Self::page_count(header);
        let offset = amap_page_offset(index);
        let reserved = reserved_pages(index);

        let mut bits: MapBits = [0; MAP_BITS_SIZE];
        for byte in bits.iter_mut().take(reserved as usize) {
            *byte = 0xFF;
        }
        self.pages.insert(index, AmapPageState { bits, dirty: true });

        let root = header.root_mut();
        root.set_file_eof_index(ByteIndex::new(offset + AMAP_PAGE_INTERVAL));
        root.set_amap_last_index(ByteIndex::new(offset));
        root.adjust_free_size(
            AMAP_PAGE_INTERVAL as i64 - i64::from(reserved) * PAGE_SIZE as i64,
        );

        // zero-fill the new interval so later partial page reads succeed
        f.seek(SeekFrom::Start(offset))?;
        let zeros = vec![0_u8; PAGE_SIZE * 16];
        let mut remaining = AMAP_PAGE_INTERVAL as usize;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len());
            f.write_all(&zeros[..chunk])?;
            remaining -= chunk;
        }

        Ok(index)
    }

    /// Persist every dirty AMap page together with the legacy maps and the
    /// density list, then drop the cache if it overgrew the soft cap.
    pub(crate) fn flush(&mut self, f: &mut FileIo, header: &mut Header<Pst>) -> io::Result<()> {
        let dirty: Vec<u64> = self
            .pages
            .iter()
            .filter(|(_, page)| page.dirty)
            .map(|(index, _)| *index)
            .collect();
        if dirty.is_empty() {
            return Ok(());
        }

        for index in dirty {
            let offset = amap_page_offset(index);
            let page = self
                .pages
                .get_mut(&index)
                .unwrap_or_else(|| unreachable!("dirty page disappeared"));
            let trailer = PageTrailer::new(PageType::AllocationMap, 0, PageId::new(offset), 0);
            let map_page = AllocationMapPage::<Pst>::new(page.bits, trailer)
                .map_err(io::Error::from)?;
            f.seek(SeekFrom::Start(offset))?;
            map_page.write(f)?;
            page.dirty = false;

            self.write_legacy_pages(f, index)?;
        }

        self.write_density_list(f, header)?;

        if self.pages.len() > PAGE_CACHE_THRESH {
            self.pages.clear();
        }

        Ok(())
    }

    /// Forget all in-memory state; the next access re-reads from disk.
    pub(crate) fn abort_transaction(&mut self) {
        self.pages.clear();
        self.preferred = None;
    }

    fn write_legacy_pages(&mut self, f: &mut FileIo, index: u64) -> io::Result<()> {
        let offset = amap_page_offset(index);

        if has_pmap_page(index) {
            let pmap_offset = offset + PAGE_SIZE as u64;
            let trailer = PageTrailer::new(
                PageType::AllocationPageMap,
                0,
                PageId::new(pmap_offset),
                0,
            );
            let page = AllocationPageMapPage::<Pst>::new([0xFF; MAP_BITS_SIZE], trailer)
                .map_err(io::Error::from)?;
            f.seek(SeekFrom::Start(pmap_offset))?;
            page.write(f)?;
        }

        if has_fmap_page(index) {
            let fmap_offset = offset + 2 * PAGE_SIZE as u64;
            let mut bits: MapBits = [0; MAP_BITS_SIZE];
            for (entry, covered) in bits.iter_mut().zip(index..) {
                *entry = match self.pages.get(&covered) {
                    Some(page) => page.free_slots().min(0xFF) as u8,
                    None => 0,
                };
            }
            let trailer = PageTrailer::new(PageType::FreeMap, 0, PageId::new(fmap_offset), 0);
            let page =
                FreeMapPage::<Pst>::new(bits, trailer).map_err(io::Error::from)?;
            f.seek(SeekFrom::Start(fmap_offset))?;
            page.write(f)?;
        }

        if has_fpmap_page(index) {
            let fpmap_offset = offset + 3 * PAGE_SIZE as u64;
            let trailer =
                PageTrailer::new(PageType::FreePageMap, 0, PageId::new(fpmap_offset), 0);
            let page = FreePageMapPage::<Pst>::new([0xFF; MAP_BITS_SIZE], trailer)
                .map_err(io::Error::from)?;
            f.seek(SeekFrom::Start(fpmap_offset))?;
            page.write(f)?;
        }

        Ok(())
    }

    fn write_density_list(
        &mut self,
        f: &mut FileIo,
        header: &mut Header<Pst>,
    ) -> io::Result<()> {
        let mut candidates: Vec<(u64, u32)> = self
            .pages
            .iter()
            .map(|(index, page)| (*index, page.free_slots()))
            .collect();
        candidates.sort_by_key(|(_, free)| std::cmp::Reverse(*free));

        let entries: Vec<DensityListPageEntry> = candidates
            .into_iter()
            .take(DensityListPage::<Pst>::max_entries())
            .filter(|(index, _)| *index <= 0xF_FFFF)
            .filter_map(|(index, free)| {
                DensityListPageEntry::new(index as u32, free.min(0xFFF) as u16).ok()
            })
            .collect();

        let current_page = entries
            .first()
            .map(|entry| entry.page())
            .unwrap_or_default();
        self.preferred = entries.first().map(|entry| u64::from(entry.page()));

        let page_id = header.alloc_pid();
        let signature =
            PageType::DensityList.signature(DENSITY_LIST_FILE_OFFSET, u64::from(page_id));
        let trailer = PageTrailer::new(PageType::DensityList, signature, page_id, 0);
        let dlist = DensityListPage::<Pst>::new(true, current_page, &entries, trailer)
            .map_err(io::Error::from)?;
        f.seek(SeekFrom::Start(DENSITY_LIST_FILE_OFFSET))?;
        dlist.write(f)
    }

    /// [Crash Recovery and AMap Rebuilding](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/d9bcc1fd-c66a-41b3-b6d7-ed09d2a25ced):
    /// zero every page, re-mark every NBT/BBT page and every block from the
    /// BBT leaves, then rewrite the whole map family. Idempotent.
    #[instrument(skip_all)]
    pub(crate) fn rebuild(
        &mut self,
        f: &mut FileIo,
        header: &mut Header<Pst>,
    ) -> io::Result<()> {
        let page_count = Self::page_count(header);
        self.pages.clear();
        self.preferred = None;
        for index in 0..page_count {
            let reserved = reserved_pages(index);
            let mut bits: MapBits = [0; MAP_BITS_SIZE];
            for byte in bits.iter_mut().take(reserved as usize) {
                *byte = 0xFF;
            }
            self.pages.insert(index, AmapPageState { bits, dirty: true });

            if self.pages.len() > PAGE_CACHE_THRESH {
                self.flush(f, header)?;
            }
        }

        let node_btree = header.root().node_btree();
        if node_btree.index().index() != 0 {
            self.mark_btree_pages::<NodeInfo>(f, header, node_btree, PageType::NodeBTree)?;
        }

        let block_btree = header.root().block_btree();
        if block_btree.index().index() != 0 {
            let blocks =
                self.mark_btree_pages::<BlockInfo>(f, header, block_btree, PageType::BlockBTree)?;
            for (offset, size) in blocks {
                self.mark_range(f, header, offset, size)?;
            }
        }

        let free_bytes: u64 = {
            let mut total = 0_u64;
            for index in 0..page_count {
                let page = self.load_page(f, header, index)?;
                total += u64::from(page.free_slots()) * SLOT_SIZE;
            }
            total
        };

        // refresh the header copy of the first free-map window
        for (slot, index) in (0..128_u64).enumerate() {
            let value = match self.pages.get(&index) {
                Some(page) => page.free_slots().min(0xFF) as u8,
                None => 0,
            };
            header.first_free_map()[slot] = value;
        }

        for page in self.pages.values_mut() {
            page.dirty = true;
        }
        self.flush(f, header)?;

        let root = header.root_mut();
        root.reset_free_size(free_bytes);
        root.set_amap_status(root::AmapStatus::Valid2);
        header.update_unique();
        header.flush(f)?;
        f.flush()
    }

    /// Walk one on-disk B-tree marking every page's 512 bytes; returns the
    /// aligned byte ranges of the leaf entries' blocks (empty for the NBT,
    /// whose entries do not locate storage directly).
    fn mark_btree_pages<E>(
        &mut self,
        f: &mut FileIo,
        header: &Header<Pst>,
        page_ref: super::block_ref::PageRef,
        page_type: PageType,
    ) -> io::Result<Vec<(u64, u64)>>
    where
        E: super::btree::BTreeEntryReadWrite<Pst> + MarkedAllocation,
    {
        let mut out = Vec::new();
        let mut stack = vec![page_ref];
        while let Some(page_ref) = stack.pop() {
            let offset = page_ref.index().index();
            self.mark_range(f, header, offset, PAGE_SIZE as u64)?;

            f.seek(SeekFrom::Start(offset))?;
            let page = read_btree_page::<Pst, E>(f, page_type, offset)?;
            match &page {
                BTreePage::Leaf(leaf) => {
                    for entry in leaf.entries.iter() {
                        if let Some((offset, size)) = entry.marked_allocation::<Pst>() {
                            out.push((offset, size));
                        }
                    }
                }
                BTreePage::Nonleaf(nonleaf) => {
                    for slot in nonleaf.entries.iter() {
                        stack.push(slot.page);
                    }
                }
            }
        }
        Ok(out)
    }

    fn mark_range(
        &mut self,
        f: &mut FileIo,
        header: &Header<Pst>,
        offset: u64,
        size: u64,
    ) -> io::Result<()> {
        let index = (offset - FIRST_AMAP_PAGE_OFFSET) / AMAP_PAGE_INTERVAL;
        let start = ((offset - amap_page_offset(index)) / SLOT_SIZE) as u32;
        let slots = size.div_ceil(SLOT_SIZE) as u32;
        let page = self.load_page(f, header, index)?;
        set_bits(&mut page.bits, start, slots, true);
        page.dirty = true;
        Ok(())
    }
}

fn bit_is_set(bits: &MapBits, bit: u32) -> bool {
    bits[(bit / 8) as usize] & (0x80 >> (bit % 8)) != 0
}

fn set_bits(bits: &mut MapBits, start: u32, count: u32, value: bool) {
    for bit in start..start + count {
        let byte = (bit / 8) as usize;
        let mask = 0x80_u8 >> (bit % 8);
        if value {
            bits[byte] |= mask;
        } else {
            bits[byte] &= !mask;
        }
    }
}

fn check_bits(bits: &MapBits, start: u32, count: u32) -> bool {
    (start..start + count).all(|bit| bit_is_set(bits, bit))
}

/// First position of `count` clear bits, optionally aligned to an 8-bit
/// (512-byte) boundary.
fn find_free_run(bits: &MapBits, count: u32, align: bool) -> Option<u32> {
    let step = if align { 8 } else { 1 };
    let mut start = 0_u32;
    while start + count <= SLOTS_PER_PAGE {
        if let Some(used) = (start..start + count).rev().find(|bit| bit_is_set(bits, *bit)) {
            start = (used + 1).div_ceil(step) * step;
        } else {
            return Some(start);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_constants() {
        assert_eq!(AMAP_PAGE_INTERVAL, 253_952);
        assert_eq!(SLOTS_PER_PAGE, 3968);
        assert_eq!(amap_page_offset(0), 0x4400);
        assert_eq!(amap_page_offset(1), 0x4400 + 253_952);
    }

    #[test]
    fn test_legacy_page_schedule() {
        assert!(has_pmap_page(0));
        assert!(has_pmap_page(8));
        assert!(!has_pmap_page(3));
        assert!(!has_fmap_page(0));
        assert!(has_fmap_page(128));
        assert!(has_fmap_page(128 + 496));
        assert!(!has_fpmap_page(128));
        assert!(has_fpmap_page(8192));
        assert_eq!(reserved_pages(0), 2);
        assert_eq!(reserved_pages(1), 1);
        assert_eq!(reserved_pages(128), 3);
    }

    #[test]
    fn test_find_free_run() {
        let mut bits: MapBits = [0; MAP_BITS_SIZE];
        bits[0] = 0xFF;

        assert_eq!(find_free_run(&bits, 4, false), Some(8));
        assert_eq!(find_free_run(&bits, 8, true), Some(8));

        bits[1] = 0x10;
        assert_eq!(find_free_run(&bits, 4, false), Some(12));
        assert_eq!(find_free_run(&bits, 8, true), Some(16));
        assert_eq!(find_free_run(&bits, 3, false), Some(8));
    }

    #[test]
    fn test_find_free_run_exhausted() {
        let bits: MapBits = [0xFF; MAP_BITS_SIZE];
        assert_eq!(find_free_run(&bits, 1, false), None);
    }

    #[test]
    fn test_set_and_check_bits() {
        let mut bits: MapBits = [0; MAP_BITS_SIZE];
        set_bits(&mut bits, 10, 13, true);
        assert!(check_bits(&bits, 10, 13));
        assert!(!check_bits(&bits, 9, 2));
        set_bits(&mut bits, 10, 13, false);
        assert!(!bit_is_set(&bits, 10));
        assert!(!bit_is_set(&bits, 22));
    }
}
