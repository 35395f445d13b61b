//! [BTrees](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/4f0cd8e7-c2d0-4975-90a4-d417cfca77f8)
//!
//! The NBT and BBT as in-memory copy-on-write trees over 512-byte
//! [BTPAGE](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/4f0cd8e7-c2d0-4975-90a4-d417cfca77f8)s.
//! A page reachable from an earlier snapshot is never modified: mutation
//! either recycles a page whose only owner is the mutating tree (stamping
//! it with a fresh page id the first time) or deep-copies it. The `Arc`
//! strong count is the recycle hint.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    collections::BTreeSet,
    fmt::Debug,
    io::{self, Cursor, Read, Write},
    sync::{Arc, OnceLock},
};

use super::{block_id::*, block_ref::*, byte_index::*, node_id::*, page::*, *};
use crate::{crc::compute_crc, PstFile};

/// A leaf record of either tree.
pub trait BTreeEntry: Copy + Debug + Send + Sync + 'static {
    fn key(&self) -> u64;
}

/// Per-variant serialization of a leaf record.
pub trait BTreeEntryReadWrite<Pst: PstFile>: BTreeEntry {
    const ENTRY_SIZE: usize;

    fn read(f: &mut dyn Read) -> io::Result<Self>;
    fn write(&self, f: &mut dyn Write) -> io::Result<()>;
}

/// [NBTENTRY](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/53a4b926-8ac4-45c9-9c6d-8358d951dbcd):
/// node id → (data block, subnode block, parent node).
#[derive(Copy, Clone, Default, Debug)]
pub struct NodeInfo {
    pub node: NodeId,
    pub data: BlockId,
    pub sub_node: BlockId,
    pub parent: NodeId,
}

impl BTreeEntry for NodeInfo {
    fn key(&self) -> u64 {
        u64::from(u32::from(self.node))
    }
}

impl<Pst: PstFile> BTreeEntryReadWrite<Pst> for NodeInfo {
    const ENTRY_SIZE: usize = 4 * Pst::INDEX_SIZE;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        // nid (padded to the index width)
        let node = NodeId::from(Pst::read_index(f)? as u32);
        // bidData
        let data = BlockId::read::<Pst>(f)?;
        // bidSub
        let sub_node = BlockId::read::<Pst>(f)?;
        // nidParent
        let parent = NodeId::read(f)?;
        if Pst::INDEX_SIZE == 8 {
            // dwPadding
            let _ = f.read_u32::<LittleEndian>()?;
        }

        Ok(Self {
            node,
            data,
            sub_node,
            parent,
        })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        Pst::write_index(f, u64::from(u32::from(self.node)))?;
        self.data.write::<Pst>(f)?;
        self.sub_node.write::<Pst>(f)?;
        self.parent.write(f)?;
        if Pst::INDEX_SIZE == 8 {
            f.write_u32::<LittleEndian>(0)?;
        }
        Ok(())
    }
}

/// [BBTENTRY](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/53a4b926-8ac4-45c9-9c6d-8358d951dbcd):
/// block id → (file offset, logical size, reference count).
#[derive(Copy, Clone, Default, Debug)]
pub struct BlockInfo {
    pub block: BlockId,
    pub index: ByteIndex,
    pub size: u16,
    pub ref_count: u16,
}

impl BlockInfo {
    pub fn block_ref(&self) -> BlockRef {
        BlockRef::new(self.block, self.index)
    }
}

impl BTreeEntry for BlockInfo {
    fn key(&self) -> u64 {
        u64::from(self.block)
    }
}

impl<Pst: PstFile> BTreeEntryReadWrite<Pst> for BlockInfo {
    const ENTRY_SIZE: usize = 3 * Pst::INDEX_SIZE;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        // BREF
        let block = BlockId::read::<Pst>(f)?;
        let index = ByteIndex::read::<Pst>(f)?;
        // cb
        let size = f.read_u16::<LittleEndian>()?;
        // cRef
        let ref_count = f.read_u16::<LittleEndian>()?;
        if Pst::INDEX_SIZE == 8 {
            // dwPadding
            let _ = f.read_u32::<LittleEndian>()?;
        }

        Ok(Self {
            block,
            index,
            size,
            ref_count,
        })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        self.block.write::<Pst>(f)?;
        self.index.write::<Pst>(f)?;
        f.write_u16::<LittleEndian>(self.size)?;
        f.write_u16::<LittleEndian>(self.ref_count)?;
        if Pst::INDEX_SIZE == 8 {
            f.write_u32::<LittleEndian>(0)?;
        }
        Ok(())
    }
}

/// Loads pages and hands out fresh page ids during tree mutation; the
/// database context implements this per tree.
pub(crate) trait BTreePageStore<E: BTreeEntry> {
    fn read_page(&mut self, page: PageRef) -> io::Result<BTreePage<E>>;
    fn alloc_pid(&mut self) -> io::Result<PageId>;
}

/// [BTENTRY](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/bc8052a3-f300-4022-be31-f0f408fffca0):
/// a non-leaf slot holding the first key of a child page and its location.
pub struct BTreeChild<E: BTreeEntry> {
    pub(crate) key: u64,
    pub(crate) page: PageRef,
    pub(crate) cached: OnceLock<Arc<BTreePage<E>>>,
}

impl<E: BTreeEntry> Clone for BTreeChild<E> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            page: self.page,
            cached: self.cached.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BTreeLeafPage<E: BTreeEntry> {
    pub(crate) page_id: PageId,
    pub(crate) offset: ByteIndex,
    pub(crate) dirty: bool,
    pub(crate) max_entries: usize,
    pub(crate) entries: Vec<E>,
}

#[derive(Clone)]
pub struct BTreeNonleafPage<E: BTreeEntry> {
    pub(crate) page_id: PageId,
    pub(crate) offset: ByteIndex,
    pub(crate) dirty: bool,
    pub(crate) level: u8,
    pub(crate) max_entries: usize,
    pub(crate) entries: Vec<BTreeChild<E>>,
}

#[derive(Clone)]
pub enum BTreePage<E: BTreeEntry> {
    Leaf(BTreeLeafPage<E>),
    Nonleaf(BTreeNonleafPage<E>),
}

pub(crate) const fn max_nonleaf_entries<Pst: PstFile>() -> usize {
    Pst::BTREE_ENTRIES_SIZE / (3 * Pst::INDEX_SIZE)
}

pub(crate) const fn max_leaf_entries<Pst, E>() -> usize
where
    Pst: PstFile,
    E: BTreeEntryReadWrite<Pst>,
{
    Pst::BTREE_ENTRIES_SIZE / E::ENTRY_SIZE
}

impl<E: BTreeEntry> BTreePage<E> {
    pub(crate) fn empty_leaf(page_id: PageId, max_entries: usize) -> Self {
        Self::Leaf(BTreeLeafPage {
            page_id,
            offset: ByteIndex::default(),
            dirty: true,
            max_entries,
            entries: Vec::new(),
        })
    }

    /// A fresh non-leaf root over a freshly split pair of pages.
    pub(crate) fn new_root(
        page_id: PageId,
        max_entries: usize,
        children: Vec<Arc<BTreePage<E>>>,
    ) -> Self {
        let level = children.first().map(|c| c.level() + 1).unwrap_or(1);
        let entries = children
            .into_iter()
            .map(|child| BTreeChild {
                key: child.first_key().unwrap_or_default(),
                page: PageRef::default(),
                cached: OnceLock::from(child),
            })
            .collect();
        Self::Nonleaf(BTreeNonleafPage {
            page_id,
            offset: ByteIndex::default(),
            dirty: true,
            level,
            max_entries,
            entries,
        })
    }

    pub fn page_id(&self) -> PageId {
        match self {
            Self::Leaf(page) => page.page_id,
            Self::Nonleaf(page) => page.page_id,
        }
    }

    pub fn offset(&self) -> ByteIndex {
        match self {
            Self::Leaf(page) => page.offset,
            Self::Nonleaf(page) => page.offset,
        }
    }

    pub fn dirty(&self) -> bool {
        match self {
            Self::Leaf(page) => page.dirty,
            Self::Nonleaf(page) => page.dirty,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Self::Leaf(_) => 0,
            Self::Nonleaf(page) => page.level,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Leaf(page) => page.entries.is_empty(),
            Self::Nonleaf(page) => page.entries.is_empty(),
        }
    }

    pub fn first_key(&self) -> Option<u64> {
        match self {
            Self::Leaf(page) => page.entries.first().map(|e| e.key()),
            Self::Nonleaf(page) => page.entries.first().map(|c| c.key),
        }
    }

    pub(crate) fn set_offset(&mut self, offset: ByteIndex) {
        match self {
            Self::Leaf(page) => page.offset = offset,
            Self::Nonleaf(page) => page.offset = offset,
        }
    }

    pub(crate) fn clear_dirty(&mut self) {
        match self {
            Self::Leaf(page) => page.dirty = false,
            Self::Nonleaf(page) => page.dirty = false,
        }
    }

    fn touch(&mut self, store: &mut dyn BTreePageStore<E>) -> io::Result<()> {
        let (dirty, page_id, offset) = match self {
            Self::Leaf(page) => (&mut page.dirty, &mut page.page_id, &mut page.offset),
            Self::Nonleaf(page) => (&mut page.dirty, &mut page.page_id, &mut page.offset),
        };
        if !*dirty {
            *dirty = true;
            *page_id = store.alloc_pid()?;
            *offset = ByteIndex::default();
        }
        Ok(())
    }

    fn load_child(
        slot: &BTreeChild<E>,
        store: &mut dyn BTreePageStore<E>,
    ) -> io::Result<Arc<BTreePage<E>>> {
        if let Some(child) = slot.cached.get() {
            return Ok(child.clone());
        }
        let child = Arc::new(store.read_page(slot.page)?);
        let _ = slot.cached.set(child.clone());
        Ok(child)
    }

    fn take_child(
        slot: &mut BTreeChild<E>,
        store: &mut dyn BTreePageStore<E>,
    ) -> io::Result<Arc<BTreePage<E>>> {
        if let Some(child) = slot.cached.take() {
            return Ok(child);
        }
        Ok(Arc::new(store.read_page(slot.page)?))
    }

    /// The index of the child page whose key range covers `key`, or `None`
    /// when `key` sorts before every entry.
    fn child_index(entries: &[BTreeChild<E>], key: u64) -> Option<usize> {
        let pos = entries.partition_point(|c| c.key <= key);
        pos.checked_sub(1)
    }

    pub fn lookup(&self, store: &mut dyn BTreePageStore<E>, key: u64) -> io::Result<Option<E>> {
        match self {
            Self::Leaf(page) => Ok(page
                .entries
                .binary_search_by(|e| e.key().cmp(&key))
                .ok()
                .map(|pos| page.entries[pos])),
            Self::Nonleaf(page) => {
                let Some(pos) = Self::child_index(&page.entries, key) else {
                    return Ok(None);
                };
                let child = Self::load_child(&page.entries[pos], store)?;
                child.lookup(store, key)
            }
        }
    }

    /// Unique-key insert; inserting an existing key overwrites it. On
    /// overflow the rightmost entry is peeled off into a new sibling page,
    /// returned as the second element.
    pub fn insert(
        mut self: Arc<Self>,
        store: &mut dyn BTreePageStore<E>,
        entry: E,
    ) -> io::Result<(Arc<Self>, Option<Arc<Self>>)> {
        let page = Arc::make_mut(&mut self);
        page.touch(store)?;

        let split = match page {
            Self::Leaf(leaf) => {
                match leaf.entries.binary_search_by(|e| e.key().cmp(&entry.key())) {
                    Ok(pos) => {
                        leaf.entries[pos] = entry;
                        None
                    }
                    Err(pos) => {
                        leaf.entries.insert(pos, entry);
                        if leaf.entries.len() > leaf.max_entries {
                            let peeled = leaf.entries.pop().ok_or_else(|| {
                                io::Error::from(NdbError::DatabaseCorrupt("empty page overflow"))
                            })?;
                            Some(Arc::new(Self::Leaf(BTreeLeafPage {
                                page_id: store.alloc_pid()?,
                                offset: ByteIndex::default(),
                                dirty: true,
                                max_entries: leaf.max_entries,
                                entries: vec![peeled],
                            })))
                        } else {
                            None
                        }
                    }
                }
            }
            Self::Nonleaf(nonleaf) => {
                let pos = Self::child_index(&nonleaf.entries, entry.key()).unwrap_or_default();
                let child = Self::take_child(&mut nonleaf.entries[pos], store)?;
                let (child, child_split) = child.insert(store, entry)?;

                let slot = &mut nonleaf.entries[pos];
                slot.key = child.first_key().unwrap_or(slot.key);
                slot.cached = OnceLock::from(child);

                if let Some(sibling) = child_split {
                    let key = sibling.first_key().ok_or_else(|| {
                        io::Error::from(NdbError::DatabaseCorrupt("empty split page"))
                    })?;
                    nonleaf.entries.insert(
                        pos + 1,
                        BTreeChild {
                            key,
                            page: PageRef::default(),
                            cached: OnceLock::from(sibling),
                        },
                    );
                }

                if nonleaf.entries.len() > nonleaf.max_entries {
                    let peeled = nonleaf.entries.pop().ok_or_else(|| {
                        io::Error::from(NdbError::DatabaseCorrupt("empty page overflow"))
                    })?;
                    Some(Arc::new(Self::Nonleaf(BTreeNonleafPage {
                        page_id: store.alloc_pid()?,
                        offset: ByteIndex::default(),
                        dirty: true,
                        level: nonleaf.level,
                        max_entries: nonleaf.max_entries,
                        entries: vec![peeled],
                    })))
                } else {
                    None
                }
            }
        };

        Ok((self, split))
    }

    /// Replace an existing entry; fails with
    /// [`NdbError::BTreeKeyNotFound`] when the key is absent.
    pub fn modify(
        mut self: Arc<Self>,
        store: &mut dyn BTreePageStore<E>,
        entry: E,
    ) -> io::Result<Arc<Self>> {
        let page = Arc::make_mut(&mut self);
        page.touch(store)?;

        match page {
            Self::Leaf(leaf) => {
                let pos = leaf
                    .entries
                    .binary_search_by(|e| e.key().cmp(&entry.key()))
                    .map_err(|_| NdbError::BTreeKeyNotFound(entry.key()))?;
                leaf.entries[pos] = entry;
            }
            Self::Nonleaf(nonleaf) => {
                let pos = Self::child_index(&nonleaf.entries, entry.key())
                    .ok_or(NdbError::BTreeKeyNotFound(entry.key()))?;
                let child = Self::take_child(&mut nonleaf.entries[pos], store)?;
                let child = child.modify(store, entry)?;
                let slot = &mut nonleaf.entries[pos];
                slot.key = child.first_key().unwrap_or(slot.key);
                slot.cached = OnceLock::from(child);
            }
        }

        Ok(self)
    }

    /// Remove an entry; fails with [`NdbError::BTreeKeyNotFound`] when
    /// absent. A page whose last entry is removed dissolves, returning
    /// `None` so the parent (or the tree root holder) drops it.
    pub fn remove(
        mut self: Arc<Self>,
        store: &mut dyn BTreePageStore<E>,
        key: u64,
    ) -> io::Result<Option<Arc<Self>>> {
        let page = Arc::make_mut(&mut self);
        page.touch(store)?;

        match page {
            Self::Leaf(leaf) => {
                let pos = leaf
                    .entries
                    .binary_search_by(|e| e.key().cmp(&key))
                    .map_err(|_| NdbError::BTreeKeyNotFound(key))?;
                leaf.entries.remove(pos);
                if leaf.entries.is_empty() {
                    return Ok(None);
                }
            }
            Self::Nonleaf(nonleaf) => {
                let pos = Self::child_index(&nonleaf.entries, key)
                    .ok_or(NdbError::BTreeKeyNotFound(key))?;
                let child = Self::take_child(&mut nonleaf.entries[pos], store)?;
                match child.remove(store, key)? {
                    Some(child) => {
                        let slot = &mut nonleaf.entries[pos];
                        slot.key = child.first_key().unwrap_or(slot.key);
                        slot.cached = OnceLock::from(child);
                    }
                    None => {
                        nonleaf.entries.remove(pos);
                        if nonleaf.entries.is_empty() {
                            return Ok(None);
                        }
                    }
                }
            }
        }

        Ok(Some(self))
    }

    /// Visit every leaf entry in key order, loading pages on demand.
    pub fn for_each_entry(
        &self,
        store: &mut dyn BTreePageStore<E>,
        visit: &mut dyn FnMut(&E) -> io::Result<()>,
    ) -> io::Result<()> {
        match self {
            Self::Leaf(page) => {
                for entry in page.entries.iter() {
                    visit(entry)?;
                }
            }
            Self::Nonleaf(page) => {
                for slot in page.entries.iter() {
                    let child = Self::load_child(slot, store)?;
                    child.for_each_entry(store, visit)?;
                }
            }
        }
        Ok(())
    }

    /// Page ids reachable from this (possibly partially loaded) tree;
    /// unloaded children contribute the id recorded in their slot.
    pub(crate) fn collect_live_pids(&self, out: &mut BTreeSet<u64>) {
        out.insert(u64::from(self.page_id()));
        if let Self::Nonleaf(page) = self {
            for slot in page.entries.iter() {
                match slot.cached.get() {
                    Some(child) => child.collect_live_pids(out),
                    None => {
                        out.insert(u64::from(slot.page.page()));
                    }
                }
            }
        }
    }
}

/// Read one BTPAGE at the given file offset (the stream must already be
/// positioned there; `offset` is used for signature validation).
pub(crate) fn read_btree_page<Pst, E>(
    f: &mut dyn Read,
    page_type: PageType,
    offset: u64,
) -> io::Result<BTreePage<E>>
where
    Pst: PstFile,
    E: BTreeEntryReadWrite<Pst>,
{
    let payload_size = PAGE_SIZE - PageTrailer::size::<Pst>();
    let mut payload = vec![0_u8; payload_size];
    f.read_exact(&mut payload)?;

    let mut cursor = Cursor::new(&payload[Pst::BTREE_ENTRIES_SIZE..]);

    // cEnt
    let entry_count = usize::from(cursor.read_u8()?);

    // cEntMax
    let _max_entries = cursor.read_u8()?;

    // cbEnt
    let entry_size = cursor.read_u8()?;

    // cLevel
    let level = cursor.read_u8()?;
    if level > 8 {
        return Err(NdbError::InvalidBTreePageLevel(level).into());
    }

    let trailer = PageTrailer::read::<Pst>(f)?;
    if trailer.page_type() != page_type {
        return Err(NdbError::UnexpectedPageType(trailer.page_type()).into());
    }
    trailer.verify_signature(offset)?;

    #[cfg(feature = "full-validation")]
    {
        let crc = compute_crc(0, &payload);
        if crc != trailer.crc() {
            return Err(NdbError::InvalidPageCrc(crc).into());
        }
    }

    if level == 0 {
        if usize::from(entry_size) < E::ENTRY_SIZE
            || entry_count * usize::from(entry_size) > Pst::BTREE_ENTRIES_SIZE
        {
            return Err(NdbError::InvalidBTreeEntrySize(entry_size).into());
        }

        let mut entries = Vec::with_capacity(entry_count);
        for index in 0..entry_count {
            let start = index * usize::from(entry_size);
            let mut cursor = &payload[start..start + usize::from(entry_size)];
            entries.push(E::read(&mut cursor)?);
        }

        // keys must be strictly increasing within a page
        if entries.windows(2).any(|pair| pair[0].key() >= pair[1].key()) {
            return Err(NdbError::DatabaseCorrupt("BTPAGE keys out of order").into());
        }

        Ok(BTreePage::Leaf(BTreeLeafPage {
            page_id: trailer.page_id(),
            offset: ByteIndex::new(offset),
            dirty: false,
            max_entries: max_leaf_entries::<Pst, E>(),
            entries,
        }))
    } else {
        let entry_size = usize::from(entry_size);
        if entry_size < 3 * Pst::INDEX_SIZE || entry_count * entry_size > Pst::BTREE_ENTRIES_SIZE {
            return Err(NdbError::InvalidBTreeEntrySize(entry_size as u8).into());
        }

        let mut entries = Vec::with_capacity(entry_count);
        for index in 0..entry_count {
            let start = index * entry_size;
            let mut cursor = &payload[start..start + entry_size];
            // btkey
            let key = Pst::read_index(&mut cursor)?;
            // BREF
            let page = PageRef::read::<Pst>(&mut cursor)?;
            entries.push(BTreeChild {
                key,
                page,
                cached: OnceLock::new(),
            });
        }

        if entries.windows(2).any(|pair| pair[0].key >= pair[1].key) {
            return Err(NdbError::DatabaseCorrupt("BTPAGE keys out of order").into());
        }

        Ok(BTreePage::Nonleaf(BTreeNonleafPage {
            page_id: trailer.page_id(),
            offset: ByteIndex::new(offset),
            dirty: false,
            level,
            max_entries: max_nonleaf_entries::<Pst>(),
            entries,
        }))
    }
}

/// Serialize one BTPAGE; the page's offset must already reflect where it
/// will land so the trailer signature matches.
pub(crate) fn write_btree_page<Pst, E>(
    page: &BTreePage<E>,
    page_type: PageType,
    f: &mut dyn Write,
) -> io::Result<()>
where
    Pst: PstFile,
    E: BTreeEntryReadWrite<Pst>,
{
    let payload_size = PAGE_SIZE - PageTrailer::size::<Pst>();
    let mut payload = vec![0_u8; payload_size];

    let (entry_count, entry_size) = {
        let mut cursor = Cursor::new(payload.as_mut_slice());
        match page {
            BTreePage::Leaf(leaf) => {
                for entry in leaf.entries.iter() {
                    entry.write(&mut cursor)?;
                }
                (leaf.entries.len(), E::ENTRY_SIZE)
            }
            BTreePage::Nonleaf(nonleaf) => {
                for slot in nonleaf.entries.iter() {
                    Pst::write_index(&mut cursor, slot.key)?;
                    slot.page.write::<Pst>(&mut cursor)?;
                }
                (nonleaf.entries.len(), 3 * Pst::INDEX_SIZE)
            }
        }
    };

    {
        let mut cursor = Cursor::new(&mut payload[Pst::BTREE_ENTRIES_SIZE..]);
        // cEnt
        cursor.write_u8(entry_count as u8)?;
        // cEntMax
        cursor.write_u8((Pst::BTREE_ENTRIES_SIZE / entry_size) as u8)?;
        // cbEnt
        cursor.write_u8(entry_size as u8)?;
        // cLevel
        cursor.write_u8(page.level())?;
        // dwPadding (Unicode only; the ANSI metadata area is 4 bytes)
        if Pst::INDEX_SIZE == 8 {
            cursor.write_u32::<LittleEndian>(0)?;
        }
    }

    let crc = compute_crc(0, &payload);
    f.write_all(&payload)?;

    let offset = u64::from(page.offset());
    let page_id = page.page_id();
    let signature = page_type.signature(offset, u64::from(page_id));
    let trailer = PageTrailer::new(page_type, signature, page_id, crc);
    trailer.write::<Pst>(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Unicode;

    struct TestStore {
        next_pid: u64,
    }

    impl<E: BTreeEntry> BTreePageStore<E> for TestStore {
        fn read_page(&mut self, _page: PageRef) -> io::Result<BTreePage<E>> {
            Err(io::Error::new(
                io::ErrorKind::NotFound,
                "all pages are in memory",
            ))
        }

        fn alloc_pid(&mut self) -> io::Result<PageId> {
            let pid = PageId::new(self.next_pid);
            self.next_pid += 1;
            Ok(pid)
        }
    }

    fn entry(key: u64) -> BlockInfo {
        BlockInfo {
            block: BlockId::from(key),
            index: ByteIndex::new(key * 0x100),
            size: 64,
            ref_count: 2,
        }
    }

    fn new_root(store: &mut TestStore) -> Arc<BTreePage<BlockInfo>> {
        let pid = BTreePageStore::<BlockInfo>::alloc_pid(store).unwrap();
        Arc::new(BTreePage::empty_leaf(
            pid,
            max_leaf_entries::<Unicode, BlockInfo>(),
        ))
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut store = TestStore { next_pid: 1 };
        let mut root = new_root(&mut store);

        for key in [16_u64, 4, 8, 32, 12] {
            let (new_root, split) = root.insert(&mut store, entry(key)).unwrap();
            assert!(split.is_none());
            root = new_root;
        }

        assert_eq!(
            root.lookup(&mut store, 8).unwrap().unwrap().ref_count,
            2
        );
        assert!(root.lookup(&mut store, 9).unwrap().is_none());

        let root = root.remove(&mut store, 8).unwrap().unwrap();
        assert!(root.lookup(&mut store, 8).unwrap().is_none());
    }

    #[test]
    fn test_insert_overwrites_existing_key() {
        let mut store = TestStore { next_pid: 1 };
        let root = new_root(&mut store);

        let (root, _) = root.insert(&mut store, entry(4)).unwrap();
        let mut replacement = entry(4);
        replacement.ref_count = 7;
        let (root, split) = root.insert(&mut store, replacement).unwrap();
        assert!(split.is_none());
        assert_eq!(root.lookup(&mut store, 4).unwrap().unwrap().ref_count, 7);
    }

    #[test]
    fn test_leaf_split_peels_rightmost() {
        let mut store = TestStore { next_pid: 1 };
        let mut root = new_root(&mut store);
        let max = max_leaf_entries::<Unicode, BlockInfo>();

        for key in 0..max as u64 {
            let (new_root, split) = root.insert(&mut store, entry(key)).unwrap();
            assert!(split.is_none());
            root = new_root;
        }

        let (left, right) = root.insert(&mut store, entry(max as u64)).unwrap();
        let right = right.expect("full page must split");

        let BTreePage::Leaf(left_page) = left.as_ref() else {
            panic!("expected leaf");
        };
        let BTreePage::Leaf(right_page) = right.as_ref() else {
            panic!("expected leaf");
        };

        assert_eq!(left_page.entries.len(), max);
        assert_eq!(right_page.entries.len(), 1);
        assert!(left_page.entries.last().unwrap().key() < right_page.entries[0].key());
    }

    #[test]
    fn test_copy_on_write_preserves_snapshot() {
        let mut store = TestStore { next_pid: 1 };
        let mut root = new_root(&mut store);
        for key in [2_u64, 4, 6] {
            root = root.insert(&mut store, entry(key)).unwrap().0;
        }

        let snapshot = root.clone();
        let mutated = root.insert(&mut store, entry(5)).unwrap().0;

        assert!(snapshot.lookup(&mut store, 5).unwrap().is_none());
        assert!(mutated.lookup(&mut store, 5).unwrap().is_some());
        assert_ne!(
            u64::from(snapshot.page_id()),
            u64::from(mutated.page_id())
        );
    }

    #[test]
    fn test_recycled_page_keeps_id_within_transaction() {
        let mut store = TestStore { next_pid: 1 };
        let root = new_root(&mut store);
        let (root, _) = root.insert(&mut store, entry(1)).unwrap();
        let first_mutation_pid = u64::from(root.page_id());
        let (root, _) = root.insert(&mut store, entry(2)).unwrap();
        assert_eq!(u64::from(root.page_id()), first_mutation_pid);
    }

    #[test]
    fn test_remove_last_entry_dissolves_page() {
        let mut store = TestStore { next_pid: 1 };
        let root = new_root(&mut store);
        let (root, _) = root.insert(&mut store, entry(1)).unwrap();
        assert!(root.remove(&mut store, 1).unwrap().is_none());
    }

    #[test]
    fn test_modify_missing_key_fails() {
        let mut store = TestStore { next_pid: 1 };
        let root = new_root(&mut store);
        let (root, _) = root.insert(&mut store, entry(1)).unwrap();
        assert!(root.modify(&mut store, entry(2)).is_err());
    }

    #[test]
    fn test_page_round_trip() {
        let mut store = TestStore { next_pid: 1 };
        let mut root = new_root(&mut store);
        for key in [2_u64, 4, 6] {
            root = root.insert(&mut store, entry(key)).unwrap().0;
        }

        let mut buffer: Vec<u8> = Vec::new();
        write_btree_page::<Unicode, BlockInfo>(&root, PageType::BlockBTree, &mut buffer).unwrap();
        assert_eq!(buffer.len(), PAGE_SIZE);

        let read_back = read_btree_page::<Unicode, BlockInfo>(
            &mut buffer.as_slice(),
            PageType::BlockBTree,
            0,
        )
        .unwrap();
        let BTreePage::Leaf(leaf) = read_back else {
            panic!("expected leaf");
        };
        assert_eq!(leaf.entries.len(), 3);
        assert_eq!(leaf.entries[1].key(), 4);
        assert!(!leaf.dirty);
    }
}
