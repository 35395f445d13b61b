//! [Data Trees](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/d0e6fbaf-00e3-4d4d-bea8-8ab3cdb4fde6)
//!
//! A node's byte stream: external blocks hold the bytes, and up to two
//! levels of [XBLOCK](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5b7a6935-e83d-4917-9f62-6ce3707f09e0)
//! / [XXBLOCK](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/061b6ac4-d1da-468c-b75d-0303a0a8f468)
//! fan them out. Blocks are immutable once queued; mutation retires the old
//! block id and stamps a fresh one, so earlier committed versions stay
//! readable until the commit frees them.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{self, Cursor},
    sync::{Arc, OnceLock},
};

use super::{block::*, block_id::*, *};
use crate::PstFile;

const DATA_TREE_BLOCK_TYPE: u8 = 0x01;
const DATA_TREE_BLOCK_HEADER_SIZE: usize = 8;

/// Children per XBLOCK / XXBLOCK.
pub const fn max_tree_entries<Pst: PstFile>() -> usize {
    (MAX_BLOCK_SIZE as usize - BlockTrailer::size::<Pst>() as usize - DATA_TREE_BLOCK_HEADER_SIZE)
        / Pst::INDEX_SIZE
}

/// Largest byte stream a data tree can address: two extended levels over
/// full external leaves.
pub fn max_tree_size<Pst: PstFile>() -> u64 {
    let fan = max_tree_entries::<Pst>() as u64;
    fan * fan * max_external_size::<Pst>() as u64
}

pub struct DataChild<Pst: PstFile> {
    pub(crate) block: BlockId,
    pub(crate) size: u64,
    pub(crate) cached: OnceLock<Arc<DataTree<Pst>>>,
}

impl<Pst: PstFile> Clone for DataChild<Pst> {
    fn clone(&self) -> Self {
        Self {
            block: self.block,
            size: self.size,
            cached: self.cached.clone(),
        }
    }
}

#[derive(Clone)]
pub struct ExternalDataBlock {
    pub(crate) block: BlockId,
    pub(crate) dirty: bool,
    pub(crate) data: Vec<u8>,
}

#[derive(Clone)]
pub struct ExtendedDataBlock<Pst: PstFile> {
    pub(crate) block: BlockId,
    pub(crate) dirty: bool,
    pub(crate) level: u8,
    pub(crate) children: Vec<DataChild<Pst>>,
}

#[derive(Clone)]
pub enum DataTree<Pst: PstFile> {
    External(ExternalDataBlock),
    Extended(ExtendedDataBlock<Pst>),
}

impl<Pst: PstFile> DataTree<Pst> {
    /// A fresh single-leaf tree over the given bytes.
    pub fn new_leaf(store: &mut dyn BlockStore<Pst>, data: Vec<u8>) -> io::Result<Self> {
        if data.len() > max_external_size::<Pst>() {
            return Err(NdbError::InvalidAllocationSize(data.len() as u64).into());
        }
        Ok(Self::External(ExternalDataBlock {
            block: store.alloc_bid(false)?,
            dirty: true,
            data,
        }))
    }

    /// Materialise the root of a committed tree from its block id.
    pub fn read_from(store: &mut dyn BlockStore<Pst>, block: BlockId) -> io::Result<Self> {
        let payload = store.fetch_block(block)?;
        if !block.is_internal() {
            return Ok(Self::External(ExternalDataBlock {
                block,
                dirty: false,
                data: payload,
            }));
        }

        let mut cursor = Cursor::new(payload.as_slice());
        // bType
        let block_type = cursor.read_u8()?;
        if block_type != DATA_TREE_BLOCK_TYPE {
            return Err(NdbError::InvalidInternalBlockType(block_type).into());
        }
        // cLevel
        let level = cursor.read_u8()?;
        if !(1..=2).contains(&level) {
            return Err(NdbError::InvalidInternalBlockLevel(level).into());
        }
        // cEnt
        let entry_count = cursor.read_u16::<LittleEndian>()?;
        if usize::from(entry_count) > max_tree_entries::<Pst>() {
            return Err(NdbError::InvalidInternalBlockEntryCount(entry_count).into());
        }
        // lcbTotal
        let total_size = u64::from(cursor.read_u32::<LittleEndian>()?);

        let mut children = Vec::with_capacity(usize::from(entry_count));
        for _ in 0..entry_count {
            // rgbid
            let child = BlockId::read::<Pst>(&mut cursor)?;
            let size = if level == 1 {
                if child.is_internal() {
                    return Err(NdbError::UnexpectedInternalBlockId(child).into());
                }
                store.fetch_block_size(child)?
            } else {
                // XXBLOCK children carry their own subtree totals
                let mut child_payload = Cursor::new(store.fetch_block(child)?);
                child_payload.set_position(4);
                u64::from(child_payload.read_u32::<LittleEndian>()?)
            };
            children.push(DataChild {
                block: child,
                size,
                cached: OnceLock::new(),
            });
        }

        let tree = ExtendedDataBlock {
            block,
            dirty: false,
            level,
            children,
        };
        if tree.children.iter().map(|c| c.size).sum::<u64>() != total_size {
            return Err(NdbError::DatabaseCorrupt("XBLOCK lcbTotal mismatch").into());
        }

        Ok(Self::Extended(tree))
    }

    pub fn block_id(&self) -> BlockId {
        match self {
            Self::External(block) => block.block,
            Self::Extended(block) => block.block,
        }
    }

    pub fn dirty(&self) -> bool {
        match self {
            Self::External(block) => block.dirty,
            Self::Extended(block) => block.dirty,
        }
    }

    pub fn level(&self) -> u8 {
        match self {
            Self::External(_) => 0,
            Self::Extended(block) => block.level,
        }
    }

    pub fn total_size(&self) -> u64 {
        match self {
            Self::External(block) => block.data.len() as u64,
            Self::Extended(block) => block.children.iter().map(|c| c.size).sum(),
        }
    }

    fn touch(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        let (dirty, block, is_internal) = match self {
            Self::External(b) => (&mut b.dirty, &mut b.block, false),
            Self::Extended(b) => (&mut b.dirty, &mut b.block, true),
        };
        if !*dirty {
            store.drop_block(*block)?;
            *block = store.alloc_bid(is_internal)?;
            *dirty = true;
        }
        Ok(())
    }

    fn load_child(
        slot: &DataChild<Pst>,
        store: &mut dyn BlockStore<Pst>,
    ) -> io::Result<Arc<DataTree<Pst>>> {
        if let Some(child) = slot.cached.get() {
            return Ok(child.clone());
        }
        let child = Arc::new(Self::read_from(store, slot.block)?);
        let _ = slot.cached.set(child.clone());
        Ok(child)
    }

    fn take_child(
        slot: &mut DataChild<Pst>,
        store: &mut dyn BlockStore<Pst>,
    ) -> io::Result<Arc<DataTree<Pst>>> {
        if let Some(child) = slot.cached.take() {
            return Ok(child);
        }
        Ok(Arc::new(Self::read_from(store, slot.block)?))
    }

    /// Recursively drop the reference counts of a committed subtree.
    pub(crate) fn drop_blocks(store: &mut dyn BlockStore<Pst>, block: BlockId) -> io::Result<()> {
        if block.is_internal() {
            let tree = Self::read_from(store, block)?;
            if let Self::Extended(extended) = tree {
                for child in extended.children.iter() {
                    Self::drop_blocks(store, child.block)?;
                }
            }
        }
        store.drop_block(block)
    }

    /// Read into `buf` starting at `offset`; returns the bytes copied,
    /// short only at end of stream.
    pub fn read(
        &self,
        store: &mut dyn BlockStore<Pst>,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<usize> {
        let total = self.total_size();
        if offset > total {
            return Err(NdbError::DataTreeOutOfRange(offset, buf.len() as u64).into());
        }

        match self {
            Self::External(block) => {
                let start = offset as usize;
                let count = buf.len().min(block.data.len() - start);
                buf[..count].copy_from_slice(&block.data[start..start + count]);
                Ok(count)
            }
            Self::Extended(extended) => {
                let mut copied = 0;
                let mut child_start = 0_u64;
                for slot in extended.children.iter() {
                    let child_end = child_start + slot.size;
                    if copied < buf.len() && offset + (copied as u64) < child_end {
                        let child = Self::load_child(slot, store)?;
                        let inner_offset = offset + copied as u64 - child_start;
                        copied += child.read(store, &mut buf[copied..], inner_offset)?;
                    }
                    child_start = child_end;
                    if copied == buf.len() {
                        break;
                    }
                }
                Ok(copied)
            }
        }
    }

    /// Copy-on-write down the affected path; the range must lie within the
    /// current total size.
    pub fn write(
        mut self: Arc<Self>,
        store: &mut dyn BlockStore<Pst>,
        data: &[u8],
        offset: u64,
    ) -> io::Result<Arc<Self>> {
        if offset + data.len() as u64 > self.total_size() {
            return Err(NdbError::DataTreeOutOfRange(offset, data.len() as u64).into());
        }
        if data.is_empty() {
            return Ok(self);
        }

        let tree = Arc::make_mut(&mut self);
        tree.touch(store)?;

        match tree {
            Self::External(block) => {
                let start = offset as usize;
                block.data[start..start + data.len()].copy_from_slice(data);
            }
            Self::Extended(extended) => {
                let mut written = 0;
                let mut child_start = 0_u64;
                for slot in extended.children.iter_mut() {
                    let child_end = child_start + slot.size;
                    if written < data.len() && offset + (written as u64) < child_end {
                        let inner_offset = offset + written as u64 - child_start;
                        let count = data.len().min((child_end - offset) as usize - written);
                        let child = Self::take_child(slot, store)?;
                        let child = child.write(
                            store,
                            &data[written..written + count],
                            inner_offset,
                        )?;
                        slot.block = child.block_id();
                        slot.cached = OnceLock::from(child);
                        written += count;
                    }
                    child_start = child_end;
                    if written == data.len() {
                        break;
                    }
                }
            }
        }

        Ok(self)
    }

    /// Grow or shrink the stream. Growth zero-fills and promotes the root
    /// across the external → XBLOCK → XXBLOCK levels as capacity demands;
    /// shrinking drops and demotes symmetrically.
    pub fn resize(
        mut self: Arc<Self>,
        store: &mut dyn BlockStore<Pst>,
        new_size: u64,
    ) -> io::Result<Arc<Self>> {
        if new_size > max_tree_size::<Pst>() {
            return Err(NdbError::DataTreeCapacityExceeded(new_size).into());
        }

        let current = self.total_size();
        if new_size == current {
            return Ok(self);
        }

        if new_size < current {
            self.shrink(store, new_size)
        } else {
            self.grow(store, new_size)
        }
    }

    fn capacity(&self) -> u64 {
        match self.level() {
            0 => max_external_size::<Pst>() as u64,
            1 => (max_tree_entries::<Pst>() * max_external_size::<Pst>()) as u64,
            _ => max_tree_size::<Pst>(),
        }
    }

    fn grow(mut self: Arc<Self>, store: &mut dyn BlockStore<Pst>, new_size: u64) -> io::Result<Arc<Self>> {
        // fill the current root to its own capacity, then promote
        let fill = new_size.min(self.capacity());

        let tree = Arc::make_mut(&mut self);
        tree.touch(store)?;

        match tree {
            Self::External(block) => {
                block.data.resize(fill as usize, 0);
            }
            Self::Extended(extended) => {
                let child_capacity = if extended.level == 1 {
                    max_external_size::<Pst>() as u64
                } else {
                    (max_tree_entries::<Pst>() * max_external_size::<Pst>()) as u64
                };

                // top up the last child first
                let have: u64 = extended.children.iter().map(|c| c.size).sum();
                if have < fill {
                    if let Some(slot) = extended.children.last_mut() {
                        if slot.size < child_capacity {
                            let target = child_capacity.min(slot.size + (fill - have));
                            let child = Self::take_child(slot, store)?;
                            let child = child.resize(store, target)?;
                            slot.block = child.block_id();
                            slot.size = child.total_size();
                            slot.cached = OnceLock::from(child);
                        }
                    }
                }

                // append fresh children until the target is covered
                loop {
                    let have = extended.children.iter().map(|c| c.size).sum::<u64>();
                    if have >= fill {
                        break;
                    }
                    let want = (fill - have).min(child_capacity);
                    let child = if extended.level == 1 {
                        Self::External(ExternalDataBlock {
                            block: store.alloc_bid(false)?,
                            dirty: true,
                            data: vec![0; want as usize],
                        })
                    } else {
                        let leaf = Self::External(ExternalDataBlock {
                            block: store.alloc_bid(false)?,
                            dirty: true,
                            data: Vec::new(),
                        });
                        let grown = Arc::new(leaf).resize(store, want)?;
                        Arc::try_unwrap(grown).unwrap_or_else(|arc| (*arc).clone())
                    };
                    extended.children.push(DataChild {
                        block: child.block_id(),
                        size: child.total_size(),
                        cached: OnceLock::from(Arc::new(child)),
                    });
                }
            }
        }

        if new_size <= self.total_size() {
            return Ok(self);
        }

        // promote: the filled root becomes the first child of a taller tree
        let level = self.level() + 1;
        if level > 2 {
            return Err(NdbError::DataTreeCapacityExceeded(new_size).into());
        }
        let first_child = DataChild {
            block: self.block_id(),
            size: self.total_size(),
            cached: OnceLock::from(self),
        };
        let promoted = Arc::new(Self::Extended(ExtendedDataBlock {
            block: store.alloc_bid(true)?,
            dirty: true,
            level,
            children: vec![first_child],
        }));
        promoted.grow(store, new_size)
    }

    fn shrink(mut self: Arc<Self>, store: &mut dyn BlockStore<Pst>, new_size: u64) -> io::Result<Arc<Self>> {
        let tree = Arc::make_mut(&mut self);
        tree.touch(store)?;

        match tree {
            Self::External(block) => {
                block.data.truncate(new_size as usize);
                Ok(self)
            }
            Self::Extended(extended) => {
                // drop whole children past the boundary
                let mut kept = 0_u64;
                let mut keep_count = 0;
                for slot in extended.children.iter() {
                    if kept >= new_size {
                        break;
                    }
                    kept += slot.size;
                    keep_count += 1;
                }
                for slot in extended.children.split_off(keep_count) {
                    match slot.cached.into_inner() {
                        Some(child) if child.dirty() => child.forget(store)?,
                        _ => Self::drop_blocks(store, slot.block)?,
                    }
                }

                // trim the boundary child
                if kept > new_size {
                    let slot = extended
                        .children
                        .last_mut()
                        .ok_or_else(|| io::Error::from(NdbError::DatabaseCorrupt("empty XBLOCK")))?;
                    let target = slot.size - (kept - new_size);
                    let child = Self::take_child(slot, store)?;
                    let child = child.shrink(store, target)?;
                    slot.block = child.block_id();
                    slot.size = child.total_size();
                    slot.cached = OnceLock::from(child);
                }

                // demote when a single child remains
                if extended.children.len() == 1 {
                    let slot = extended.children.remove(0);
                    let child = match slot.cached.into_inner() {
                        Some(child) => child,
                        None => Arc::new(Self::read_from(store, slot.block)?),
                    };
                    // the dissolved root was never persisted under its
                    // fresh id, it is simply forgotten
                    return Ok(child);
                }

                Ok(self)
            }
        }
    }

    /// Release whatever this tree still holds on disk: committed parts
    /// drop their reference counts, uncommitted parts are simply
    /// forgotten.
    pub(crate) fn discard(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if self.dirty() {
            self.forget(store)
        } else {
            Self::drop_blocks(store, self.block_id())
        }
    }

    /// Drop the reference counts of an all-dirty (never committed) subtree
    /// without touching the BBT: there is nothing persisted to release.
    fn forget(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if let Self::Extended(extended) = self {
            for slot in extended.children.iter() {
                match slot.cached.get() {
                    Some(child) if child.dirty() => child.forget(store)?,
                    _ => Self::drop_blocks(store, slot.block)?,
                }
            }
        }
        Ok(())
    }

    /// Number of external leaves; the heap layer addresses them as pages.
    pub fn page_count(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<usize> {
        match self {
            Self::External(_) => Ok(1),
            Self::Extended(extended) => {
                if extended.level == 1 {
                    Ok(extended.children.len())
                } else {
                    let mut count = 0;
                    for slot in extended.children.iter() {
                        count += Self::load_child(slot, store)?.page_count(store)?;
                    }
                    Ok(count)
                }
            }
        }
    }

    /// Bytes of the `index`th external leaf.
    pub fn read_page(
        &self,
        store: &mut dyn BlockStore<Pst>,
        index: usize,
    ) -> io::Result<Vec<u8>> {
        match self {
            Self::External(block) => {
                if index != 0 {
                    return Err(NdbError::DataTreePageOutOfRange(index).into());
                }
                Ok(block.data.clone())
            }
            Self::Extended(extended) => {
                if extended.level == 1 {
                    let slot = extended
                        .children
                        .get(index)
                        .ok_or(NdbError::DataTreePageOutOfRange(index))?;
                    Self::load_child(slot, store)?.read_page(store, 0)
                } else {
                    let mut skipped = 0;
                    for slot in extended.children.iter() {
                        let child = Self::load_child(slot, store)?;
                        let pages = child.page_count(store)?;
                        if index < skipped + pages {
                            return child.read_page(store, index - skipped);
                        }
                        skipped += pages;
                    }
                    Err(NdbError::DataTreePageOutOfRange(index).into())
                }
            }
        }
    }

    /// Replace the `index`th external leaf wholesale; the leaf's size may
    /// change.
    pub fn write_page(
        mut self: Arc<Self>,
        store: &mut dyn BlockStore<Pst>,
        index: usize,
        data: Vec<u8>,
    ) -> io::Result<Arc<Self>> {
        if data.len() > max_external_size::<Pst>() {
            return Err(NdbError::InvalidAllocationSize(data.len() as u64).into());
        }

        let tree = Arc::make_mut(&mut self);
        tree.touch(store)?;

        match tree {
            Self::External(block) => {
                if index != 0 {
                    return Err(NdbError::DataTreePageOutOfRange(index).into());
                }
                block.data = data;
            }
            Self::Extended(extended) => {
                if extended.level == 1 {
                    let slot = extended
                        .children
                        .get_mut(index)
                        .ok_or(NdbError::DataTreePageOutOfRange(index))?;
                    let child = Self::take_child(slot, store)?;
                    let child = child.write_page(store, 0, data)?;
                    slot.block = child.block_id();
                    slot.size = child.total_size();
                    slot.cached = OnceLock::from(child);
                } else {
                    let mut skipped = 0;
                    let mut target = None;
                    for (pos, slot) in extended.children.iter().enumerate() {
                        let pages = Self::load_child(slot, store)?.page_count(store)?;
                        if index < skipped + pages {
                            target = Some((pos, index - skipped));
                            break;
                        }
                        skipped += pages;
                    }
                    let (pos, inner) =
                        target.ok_or(NdbError::DataTreePageOutOfRange(index))?;
                    let slot = &mut extended.children[pos];
                    let child = Self::take_child(slot, store)?;
                    let child = child.write_page(store, inner, data)?;
                    slot.block = child.block_id();
                    slot.size = child.total_size();
                    slot.cached = OnceLock::from(child);
                }
            }
        }

        Ok(self)
    }

    /// Append a fresh external leaf holding `data`, promoting the root as
    /// needed.
    pub fn append_page(
        mut self: Arc<Self>,
        store: &mut dyn BlockStore<Pst>,
        data: Vec<u8>,
    ) -> io::Result<Arc<Self>> {
        if data.len() > max_external_size::<Pst>() {
            return Err(NdbError::InvalidAllocationSize(data.len() as u64).into());
        }

        let fan = max_tree_entries::<Pst>();
        match self.level() {
            0 => {
                let first_child = DataChild {
                    block: self.block_id(),
                    size: self.total_size(),
                    cached: OnceLock::from(self),
                };
                let leaf = ExternalDataBlock {
                    block: store.alloc_bid(false)?,
                    dirty: true,
                    data,
                };
                let second_child = DataChild {
                    block: leaf.block,
                    size: leaf.data.len() as u64,
                    cached: OnceLock::from(Arc::new(Self::External(leaf))),
                };
                Ok(Arc::new(Self::Extended(ExtendedDataBlock {
                    block: store.alloc_bid(true)?,
                    dirty: true,
                    level: 1,
                    children: vec![first_child, second_child],
                })))
            }
            1 => {
                let full = matches!(&*self, Self::Extended(x) if x.children.len() >= fan);
                if full {
                    // promote to an XXBLOCK and push a fresh XBLOCK
                    let first_child = DataChild {
                        block: self.block_id(),
                        size: self.total_size(),
                        cached: OnceLock::from(self),
                    };
                    let promoted = Arc::new(Self::Extended(ExtendedDataBlock {
                        block: store.alloc_bid(true)?,
                        dirty: true,
                        level: 2,
                        children: vec![first_child],
                    }));
                    return promoted.append_page(store, data);
                }

                let tree = Arc::make_mut(&mut self);
                tree.touch(store)?;
                let Self::Extended(extended) = tree else {
                    return Err(NdbError::DatabaseCorrupt("level 1 root must be extended").into());
                };
                let leaf = ExternalDataBlock {
                    block: store.alloc_bid(false)?,
                    dirty: true,
                    data,
                };
                extended.children.push(DataChild {
                    block: leaf.block,
                    size: leaf.data.len() as u64,
                    cached: OnceLock::from(Arc::new(Self::External(leaf))),
                });
                Ok(self)
            }
            _ => {
                let tree = Arc::make_mut(&mut self);
                tree.touch(store)?;
                let Self::Extended(extended) = tree else {
                    return Err(NdbError::DatabaseCorrupt("level 2 root must be extended").into());
                };

                let last_full = match extended.children.last() {
                    Some(slot) => {
                        let child = Self::load_child(slot, store)?;
                        matches!(&*child, Self::Extended(x) if x.children.len() >= fan)
                    }
                    None => true,
                };

                if last_full {
                    if extended.children.len() >= fan {
                        return Err(NdbError::DataTreeCapacityExceeded(
                            self.total_size() + data.len() as u64,
                        )
                        .into());
                    }
                    let leaf = ExternalDataBlock {
                        block: store.alloc_bid(false)?,
                        dirty: true,
                        data,
                    };
                    let leaf_size = leaf.data.len() as u64;
                    let leaf_child = DataChild {
                        block: leaf.block,
                        size: leaf_size,
                        cached: OnceLock::from(Arc::new(Self::External(leaf))),
                    };
                    let xblock = ExtendedDataBlock {
                        block: store.alloc_bid(true)?,
                        dirty: true,
                        level: 1,
                        children: vec![leaf_child],
                    };
                    extended.children.push(DataChild {
                        block: xblock.block,
                        size: leaf_size,
                        cached: OnceLock::from(Arc::new(Self::Extended(xblock))),
                    });
                } else {
                    let slot = extended
                        .children
                        .last_mut()
                        .ok_or_else(|| io::Error::from(NdbError::DatabaseCorrupt("empty XXBLOCK")))?;
                    let child = Self::take_child(slot, store)?;
                    let child = child.append_page(store, data)?;
                    slot.block = child.block_id();
                    slot.size = child.total_size();
                    slot.cached = OnceLock::from(child);
                }
                Ok(self)
            }
        }
    }

    /// Queue every dirty block of `tree` for the next commit, bottom-up,
    /// and clear the dirty flags.
    pub fn save(tree: &mut Arc<Self>, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if !tree.dirty() {
            return Ok(());
        }

        let tree = Arc::make_mut(tree);
        match tree {
            Self::External(block) => {
                store.queue_block(block.block, block.data.clone())?;
                block.dirty = false;
            }
            Self::Extended(extended) => {
                for slot in extended.children.iter_mut() {
                    if let Some(child) = slot.cached.take() {
                        let mut child = child;
                        Self::save(&mut child, store)?;
                        slot.block = child.block_id();
                        slot.size = child.total_size();
                        slot.cached = OnceLock::from(child);
                    }
                }

                let total: u64 = extended.children.iter().map(|c| c.size).sum();
                let total = u32::try_from(total)
                    .map_err(|_| NdbError::DataTreeCapacityExceeded(total))?;

                let mut payload = Vec::with_capacity(
                    DATA_TREE_BLOCK_HEADER_SIZE + extended.children.len() * Pst::INDEX_SIZE,
                );
                // bType
                payload.write_u8(DATA_TREE_BLOCK_TYPE)?;
                // cLevel
                payload.write_u8(extended.level)?;
                // cEnt
                payload.write_u16::<LittleEndian>(extended.children.len() as u16)?;
                // lcbTotal
                payload.write_u32::<LittleEndian>(total)?;
                // rgbid
                for slot in extended.children.iter() {
                    slot.block.write::<Pst>(&mut payload)?;
                }

                store.queue_block(extended.block, payload)?;
                extended.dirty = false;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndb::btree::NodeInfo;
    use crate::ndb::node_id::NodeIdType;
    use crate::ndb::node_id::NodeId;
    use crate::Unicode;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct TestStore {
        next_bid: u64,
        blocks: BTreeMap<u64, Vec<u8>>,
        dropped: Vec<u64>,
    }

    impl BlockStore<Unicode> for TestStore {
        fn fetch_block(&mut self, block: BlockId) -> io::Result<Vec<u8>> {
            self.blocks
                .get(&u64::from(block))
                .cloned()
                .ok_or_else(|| NdbError::BlockNotFound(block).into())
        }

        fn fetch_block_size(&mut self, block: BlockId) -> io::Result<u64> {
            Ok(self.fetch_block(block)?.len() as u64)
        }

        fn alloc_bid(&mut self, is_internal: bool) -> io::Result<BlockId> {
            self.next_bid += 1;
            Ok(BlockId::new(is_internal, self.next_bid).map_err(io::Error::from)?)
        }

        fn alloc_nid(&mut self, id_type: NodeIdType) -> io::Result<NodeId> {
            Ok(NodeId::new(id_type, 0x4000).map_err(io::Error::from)?)
        }

        fn drop_block(&mut self, block: BlockId) -> io::Result<()> {
            self.dropped.push(u64::from(block));
            Ok(())
        }

        fn queue_block(&mut self, block: BlockId, payload: Vec<u8>) -> io::Result<()> {
            self.blocks.insert(u64::from(block), payload);
            Ok(())
        }

        fn update_node(&mut self, _info: NodeInfo) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_leaf_read_write() {
        let mut store = TestStore::default();
        let tree = DataTree::new_leaf(&mut store, b"hello world".to_vec()).unwrap();
        let tree = Arc::new(tree);

        let mut buf = [0_u8; 5];
        assert_eq!(tree.read(&mut store, &mut buf, 6).unwrap(), 5);
        assert_eq!(&buf, b"world");

        let tree = tree.write(&mut store, b"WORLD", 6).unwrap();
        let mut buf = [0_u8; 11];
        tree.read(&mut store, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello WORLD");
    }

    #[test]
    fn test_write_past_end_fails() {
        let mut store = TestStore::default();
        let tree = Arc::new(DataTree::new_leaf(&mut store, vec![0; 8]).unwrap());
        assert!(tree.write(&mut store, b"xx", 7).is_err());
    }

    #[test]
    fn test_grow_promotes_to_xblock() {
        let mut store = TestStore::default();
        let tree = Arc::new(DataTree::new_leaf(&mut store, b"abc".to_vec()).unwrap());

        let target = max_external_size::<Unicode>() as u64 + 10;
        let tree = tree.resize(&mut store, target).unwrap();
        assert_eq!(tree.level(), 1);
        assert_eq!(tree.total_size(), target);

        // original bytes survive the promotion
        let mut buf = [0_u8; 3];
        tree.read(&mut store, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"abc");

        // the zero fill is readable across the leaf boundary
        let mut buf = [7_u8; 16];
        let boundary = max_external_size::<Unicode>() as u64 - 8;
        assert_eq!(tree.read(&mut store, &mut buf, boundary).unwrap(), 16);
        assert_eq!(buf, [0_u8; 16]);
    }

    #[test]
    fn test_shrink_demotes_to_leaf() {
        let mut store = TestStore::default();
        let tree = Arc::new(DataTree::new_leaf(&mut store, vec![9; 100]).unwrap());
        let tree = tree
            .resize(&mut store, max_external_size::<Unicode>() as u64 * 3)
            .unwrap();
        assert_eq!(tree.level(), 1);

        let tree = tree.resize(&mut store, 8).unwrap();
        assert_eq!(tree.level(), 0);
        assert_eq!(tree.total_size(), 8);

        let mut buf = [0_u8; 8];
        tree.read(&mut store, &mut buf, 0).unwrap();
        assert_eq!(buf, [9; 8]);
    }

    #[test]
    fn test_page_ops() {
        let mut store = TestStore::default();
        let tree = Arc::new(DataTree::new_leaf(&mut store, b"page0".to_vec()).unwrap());
        let tree = tree.append_page(&mut store, b"page1".to_vec()).unwrap();
        let tree = tree.append_page(&mut store, b"page2!".to_vec()).unwrap();

        assert_eq!(tree.page_count(&mut store).unwrap(), 3);
        assert_eq!(tree.read_page(&mut store, 1).unwrap(), b"page1");
        assert_eq!(tree.total_size(), 16);

        let tree = tree
            .write_page(&mut store, 1, b"a longer page 1".to_vec())
            .unwrap();
        assert_eq!(tree.read_page(&mut store, 1).unwrap(), b"a longer page 1");
        assert_eq!(tree.read_page(&mut store, 2).unwrap(), b"page2!");
        assert_eq!(tree.total_size(), 26);
    }

    #[test]
    fn test_save_round_trip() {
        let mut store = TestStore::default();
        let tree = Arc::new(DataTree::new_leaf(&mut store, b"page0".to_vec()).unwrap());
        let tree = tree.append_page(&mut store, b"page1".to_vec()).unwrap();
        let mut tree = tree;
        DataTree::save(&mut tree, &mut store).unwrap();
        assert!(!tree.dirty());

        let read_back = DataTree::<Unicode>::read_from(&mut store, tree.block_id()).unwrap();
        assert_eq!(read_back.total_size(), 10);
        assert_eq!(read_back.read_page(&mut store, 1).unwrap(), b"page1");
    }

    #[test]
    fn test_touch_retires_old_block_id() {
        let mut store = TestStore::default();
        let mut tree = Arc::new(DataTree::new_leaf(&mut store, vec![1; 16]).unwrap());
        DataTree::save(&mut tree, &mut store).unwrap();
        let old_bid = u64::from(tree.block_id());

        let tree = tree.write(&mut store, &[2], 0).unwrap();
        assert_ne!(u64::from(tree.block_id()), old_bid);
        assert_eq!(store.dropped, vec![old_bid]);
    }
}
