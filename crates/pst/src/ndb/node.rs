//! [Nodes](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/32ebe8a7-8a4d-4be8-b8a9-a7f2c2ff4aa9)
//!
//! A node pairs a data tree (its byte stream) with a subnode B-tree
//! ([SLBLOCK](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/85c86a90-8aa9-46b4-9f2d-8a0a45c2e12d)s /
//! [SIBLOCK](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/7c2f48a9-6b04-43c6-9c9b-c8dcee4b6a9e)s).
//! Subnodes are nodes whose entire existence is recorded inside another
//! node; they have no NBT entry and their parent id reads as 0.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{self, Cursor},
    sync::{Arc, OnceLock},
};

use super::{block::*, block_id::*, btree::NodeInfo, data_tree::*, node_id::*, *};
use crate::PstFile;

const SUBNODE_BLOCK_TYPE: u8 = 0x02;

const fn subnode_block_header_size<Pst: PstFile>() -> usize {
    // bType, cLevel, cEnt, then dwPadding in the wide format
    if Pst::INDEX_SIZE == 8 {
        8
    } else {
        4
    }
}

/// Entries per subnode leaf block.
pub const fn max_subnode_leaf_entries<Pst: PstFile>() -> usize {
    (MAX_BLOCK_SIZE as usize
        - BlockTrailer::size::<Pst>() as usize
        - subnode_block_header_size::<Pst>())
        / (3 * Pst::INDEX_SIZE)
}

/// Entries per subnode non-leaf block.
pub const fn max_subnode_nonleaf_entries<Pst: PstFile>() -> usize {
    (MAX_BLOCK_SIZE as usize
        - BlockTrailer::size::<Pst>() as usize
        - subnode_block_header_size::<Pst>())
        / (2 * Pst::INDEX_SIZE)
}

/// [SLENTRY](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/85c86a90-8aa9-46b4-9f2d-8a0a45c2e12d):
/// subnode id → (data tree root, nested subnode tree root).
#[derive(Copy, Clone, Default, Debug)]
pub struct SubnodeEntry {
    pub node: NodeId,
    pub data: BlockId,
    pub sub_node: BlockId,
}

pub struct SubnodeChild<Pst: PstFile> {
    key: u32,
    block: BlockId,
    cached: OnceLock<Arc<SubnodeTree<Pst>>>,
}

impl<Pst: PstFile> Clone for SubnodeChild<Pst> {
    fn clone(&self) -> Self {
        Self {
            key: self.key,
            block: self.block,
            cached: self.cached.clone(),
        }
    }
}

#[derive(Clone)]
pub struct SubnodeLeafBlock {
    block: BlockId,
    dirty: bool,
    entries: Vec<SubnodeEntry>,
}

#[derive(Clone)]
pub struct SubnodeNonleafBlock<Pst: PstFile> {
    block: BlockId,
    dirty: bool,
    entries: Vec<SubnodeChild<Pst>>,
}

#[derive(Clone)]
pub enum SubnodeTree<Pst: PstFile> {
    Leaf(SubnodeLeafBlock),
    Nonleaf(SubnodeNonleafBlock<Pst>),
}

impl<Pst: PstFile> SubnodeTree<Pst> {
    pub fn new_empty(store: &mut dyn BlockStore<Pst>) -> io::Result<Self> {
        Ok(Self::Leaf(SubnodeLeafBlock {
            block: store.alloc_bid(true)?,
            dirty: true,
            entries: Vec::new(),
        }))
    }

    pub fn read_from(store: &mut dyn BlockStore<Pst>, block: BlockId) -> io::Result<Self> {
        if !block.is_internal() {
            return Err(NdbError::UnexpectedExternalBlockId(block).into());
        }
        let payload = store.fetch_block(block)?;
        let mut cursor = Cursor::new(payload.as_slice());

        // bType
        let block_type = cursor.read_u8()?;
        if block_type != SUBNODE_BLOCK_TYPE {
            return Err(NdbError::InvalidInternalBlockType(block_type).into());
        }
        // cLevel
        let level = cursor.read_u8()?;
        // cEnt
        let entry_count = cursor.read_u16::<LittleEndian>()?;
        if Pst::INDEX_SIZE == 8 {
            // dwPadding
            let _ = cursor.read_u32::<LittleEndian>()?;
        }

        match level {
            0 => {
                let mut entries = Vec::with_capacity(usize::from(entry_count));
                for _ in 0..entry_count {
                    // nid (padded to the index width)
                    let node = NodeId::from(Pst::read_index(&mut cursor)? as u32);
                    // bidData
                    let data = BlockId::read::<Pst>(&mut cursor)?;
                    // bidSub
                    let sub_node = BlockId::read::<Pst>(&mut cursor)?;
                    entries.push(SubnodeEntry {
                        node,
                        data,
                        sub_node,
                    });
                }
                Ok(Self::Leaf(SubnodeLeafBlock {
                    block,
                    dirty: false,
                    entries,
                }))
            }
            1 => {
                let mut entries = Vec::with_capacity(usize::from(entry_count));
                for _ in 0..entry_count {
                    // nid
                    let key = Pst::read_index(&mut cursor)? as u32;
                    // bid
                    let child = BlockId::read::<Pst>(&mut cursor)?;
                    entries.push(SubnodeChild {
                        key,
                        block: child,
                        cached: OnceLock::new(),
                    });
                }
                Ok(Self::Nonleaf(SubnodeNonleafBlock {
                    block,
                    dirty: false,
                    entries,
                }))
            }
            invalid => Err(NdbError::InvalidInternalBlockLevel(invalid).into()),
        }
    }

    pub fn block_id(&self) -> BlockId {
        match self {
            Self::Leaf(block) => block.block,
            Self::Nonleaf(block) => block.block,
        }
    }

    pub fn dirty(&self) -> bool {
        match self {
            Self::Leaf(block) => block.dirty,
            Self::Nonleaf(block) => block.dirty,
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Self::Leaf(block) => block.entries.is_empty(),
            Self::Nonleaf(block) => block.entries.is_empty(),
        }
    }

    fn touch(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        let (dirty, block) = match self {
            Self::Leaf(b) => (&mut b.dirty, &mut b.block),
            Self::Nonleaf(b) => (&mut b.dirty, &mut b.block),
        };
        if !*dirty {
            store.drop_block(*block)?;
            *block = store.alloc_bid(true)?;
            *dirty = true;
        }
        Ok(())
    }

    fn load_child(
        slot: &SubnodeChild<Pst>,
        store: &mut dyn BlockStore<Pst>,
    ) -> io::Result<Arc<SubnodeTree<Pst>>> {
        if let Some(child) = slot.cached.get() {
            return Ok(child.clone());
        }
        let child = Arc::new(Self::read_from(store, slot.block)?);
        let _ = slot.cached.set(child.clone());
        Ok(child)
    }

    fn take_child(
        slot: &mut SubnodeChild<Pst>,
        store: &mut dyn BlockStore<Pst>,
    ) -> io::Result<Arc<SubnodeTree<Pst>>> {
        if let Some(child) = slot.cached.take() {
            return Ok(child);
        }
        Ok(Arc::new(Self::read_from(store, slot.block)?))
    }

    fn first_key(&self) -> Option<u32> {
        match self {
            Self::Leaf(block) => block.entries.first().map(|e| u32::from(e.node)),
            Self::Nonleaf(block) => block.entries.first().map(|c| c.key),
        }
    }

    fn child_index(entries: &[SubnodeChild<Pst>], key: u32) -> Option<usize> {
        entries.partition_point(|c| c.key <= key).checked_sub(1)
    }

    pub fn lookup(
        &self,
        store: &mut dyn BlockStore<Pst>,
        node: NodeId,
    ) -> io::Result<Option<SubnodeEntry>> {
        let key = u32::from(node);
        match self {
            Self::Leaf(block) => Ok(block
                .entries
                .binary_search_by(|e| u32::from(e.node).cmp(&key))
                .ok()
                .map(|pos| block.entries[pos])),
            Self::Nonleaf(block) => {
                let Some(pos) = Self::child_index(&block.entries, key) else {
                    return Ok(None);
                };
                let child = Self::load_child(&block.entries[pos], store)?;
                child.lookup(store, node)
            }
        }
    }

    /// Upsert; on overflow the rightmost entry moves to a returned sibling.
    pub fn insert(
        mut self: Arc<Self>,
        store: &mut dyn BlockStore<Pst>,
        entry: SubnodeEntry,
    ) -> io::Result<(Arc<Self>, Option<Arc<Self>>)> {
        let tree = Arc::make_mut(&mut self);
        tree.touch(store)?;

        let split = match tree {
            Self::Leaf(leaf) => {
                let key = u32::from(entry.node);
                match leaf
                    .entries
                    .binary_search_by(|e| u32::from(e.node).cmp(&key))
                {
                    Ok(pos) => {
                        leaf.entries[pos] = entry;
                        None
                    }
                    Err(pos) => {
                        leaf.entries.insert(pos, entry);
                        if leaf.entries.len() > max_subnode_leaf_entries::<Pst>() {
                            let peeled = leaf.entries.pop().ok_or_else(|| {
                                io::Error::from(NdbError::DatabaseCorrupt("empty block overflow"))
                            })?;
                            Some(Arc::new(Self::Leaf(SubnodeLeafBlock {
                                block: store.alloc_bid(true)?,
                                dirty: true,
                                entries: vec![peeled],
                            })))
                        } else {
                            None
                        }
                    }
                }
            }
            Self::Nonleaf(nonleaf) => {
                let key = u32::from(entry.node);
                let pos = Self::child_index(&nonleaf.entries, key).unwrap_or_default();
                let child = Self::take_child(&mut nonleaf.entries[pos], store)?;
                let (child, child_split) = child.insert(store, entry)?;

                let slot = &mut nonleaf.entries[pos];
                slot.key = child.first_key().unwrap_or(slot.key);
                slot.block = child.block_id();
                slot.cached = OnceLock::from(child);

                if let Some(sibling) = child_split {
                    let key = sibling.first_key().ok_or_else(|| {
                        io::Error::from(NdbError::DatabaseCorrupt("empty split block"))
                    })?;
                    nonleaf.entries.insert(
                        pos + 1,
                        SubnodeChild {
                            key,
                            block: sibling.block_id(),
                            cached: OnceLock::from(sibling),
                        },
                    );
                }

                if nonleaf.entries.len() > max_subnode_nonleaf_entries::<Pst>() {
                    let peeled = nonleaf.entries.pop().ok_or_else(|| {
                        io::Error::from(NdbError::DatabaseCorrupt("empty block overflow"))
                    })?;
                    Some(Arc::new(Self::Nonleaf(SubnodeNonleafBlock {
                        block: store.alloc_bid(true)?,
                        dirty: true,
                        entries: vec![peeled],
                    })))
                } else {
                    None
                }
            }
        };

        Ok((self, split))
    }

    /// Remove; fails when absent, dissolves when the last entry goes.
    pub fn remove(
        mut self: Arc<Self>,
        store: &mut dyn BlockStore<Pst>,
        node: NodeId,
    ) -> io::Result<Option<Arc<Self>>> {
        let tree = Arc::make_mut(&mut self);
        tree.touch(store)?;

        let key = u32::from(node);
        match tree {
            Self::Leaf(leaf) => {
                let pos = leaf
                    .entries
                    .binary_search_by(|e| u32::from(e.node).cmp(&key))
                    .map_err(|_| NdbError::SubNodeNotFound(node))?;
                leaf.entries.remove(pos);
                if leaf.entries.is_empty() {
                    return Ok(None);
                }
            }
            Self::Nonleaf(nonleaf) => {
                let pos =
                    Self::child_index(&nonleaf.entries, key).ok_or(NdbError::SubNodeNotFound(node))?;
                let child = Self::take_child(&mut nonleaf.entries[pos], store)?;
                match child.remove(store, node)? {
                    Some(child) => {
                        let slot = &mut nonleaf.entries[pos];
                        slot.key = child.first_key().unwrap_or(slot.key);
                        slot.block = child.block_id();
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

    /// Visit every entry in key order.
    pub fn for_each(
        &self,
        store: &mut dyn BlockStore<Pst>,
        visit: &mut dyn FnMut(&SubnodeEntry) -> io::Result<()>,
    ) -> io::Result<()> {
        match self {
            Self::Leaf(block) => {
                for entry in block.entries.iter() {
                    visit(entry)?;
                }
            }
            Self::Nonleaf(block) => {
                for slot in block.entries.iter() {
                    let child = Self::load_child(slot, store)?;
                    child.for_each(store, visit)?;
                }
            }
        }
        Ok(())
    }

    /// Queue the dirty blocks of `tree` for the next commit.
    pub fn save(tree: &mut Arc<Self>, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if !tree.dirty() {
            return Ok(());
        }

        let tree = Arc::make_mut(tree);
        let mut payload = Vec::new();
        match tree {
            Self::Leaf(leaf) => {
                // bType
                payload.write_u8(SUBNODE_BLOCK_TYPE)?;
                // cLevel
                payload.write_u8(0)?;
                // cEnt
                payload.write_u16::<LittleEndian>(leaf.entries.len() as u16)?;
                if Pst::INDEX_SIZE == 8 {
                    // dwPadding
                    payload.write_u32::<LittleEndian>(0)?;
                }
                for entry in leaf.entries.iter() {
                    Pst::write_index(&mut payload, u64::from(u32::from(entry.node)))?;
                    entry.data.write::<Pst>(&mut payload)?;
                    entry.sub_node.write::<Pst>(&mut payload)?;
                }
                store.queue_subnode_block(leaf.block, payload)?;
                leaf.dirty = false;
            }
            Self::Nonleaf(nonleaf) => {
                for slot in nonleaf.entries.iter_mut() {
                    if let Some(child) = slot.cached.take() {
                        let mut child = child;
                        Self::save(&mut child, store)?;
                        slot.block = child.block_id();
                        slot.cached = OnceLock::from(child);
                    }
                }

                // bType
                payload.write_u8(SUBNODE_BLOCK_TYPE)?;
                // cLevel
                payload.write_u8(1)?;
                // cEnt
                payload.write_u16::<LittleEndian>(nonleaf.entries.len() as u16)?;
                if Pst::INDEX_SIZE == 8 {
                    // dwPadding
                    payload.write_u32::<LittleEndian>(0)?;
                }
                for slot in nonleaf.entries.iter() {
                    Pst::write_index(&mut payload, u64::from(slot.key))?;
                    slot.block.write::<Pst>(&mut payload)?;
                }
                store.queue_subnode_block(nonleaf.block, payload)?;
                nonleaf.dirty = false;
            }
        }
        Ok(())
    }

    /// Recursively drop the reference counts of a committed subnode tree,
    /// including every subnode's data tree and nested subnode tree.
    pub(crate) fn drop_tree(store: &mut dyn BlockStore<Pst>, block: BlockId) -> io::Result<()> {
        let tree = Self::read_from(store, block)?;
        match &tree {
            Self::Leaf(leaf) => {
                for entry in leaf.entries.iter() {
                    if !entry.data.is_none() {
                        DataTree::<Pst>::drop_blocks(store, entry.data)?;
                    }
                    if !entry.sub_node.is_none() {
                        Self::drop_tree(store, entry.sub_node)?;
                    }
                }
            }
            Self::Nonleaf(nonleaf) => {
                for slot in nonleaf.entries.iter() {
                    Self::drop_tree(store, slot.block)?;
                }
            }
        }
        store.drop_block(block)
    }
}

/// A node handle: id, parent id, and the two trees. Mutations stay in
/// memory until [`Node::save`] (or [`Node::save_subnode`] for subnodes)
/// queues them on the owning context.
pub struct Node<Pst: PstFile> {
    id: NodeId,
    parent: NodeId,
    data: Option<Arc<DataTree<Pst>>>,
    sub_nodes: Option<Arc<SubnodeTree<Pst>>>,
    dirty: bool,
}

impl<Pst: PstFile> Node<Pst> {
    /// A brand-new node with no content yet.
    pub fn new(id: NodeId, parent: NodeId) -> Self {
        Self {
            id,
            parent,
            data: None,
            sub_nodes: None,
            dirty: true,
        }
    }

    /// Materialise a node from its NBT entry (or a subnode's SLENTRY
    /// converted to one, with parent 0).
    pub fn open(store: &mut dyn BlockStore<Pst>, info: NodeInfo) -> io::Result<Self> {
        let data = if info.data.is_none() {
            None
        } else {
            Some(Arc::new(DataTree::read_from(store, info.data)?))
        };
        let sub_nodes = if info.sub_node.is_none() {
            None
        } else {
            Some(Arc::new(SubnodeTree::read_from(store, info.sub_node)?))
        };
        Ok(Self {
            id: info.node,
            parent: info.parent,
            data,
            sub_nodes,
            dirty: false,
        })
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn parent_id(&self) -> NodeId {
        self.parent
    }

    pub fn set_parent_id(&mut self, parent: NodeId) {
        self.parent = parent;
        self.dirty = true;
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn size(&self) -> u64 {
        self.data.as_ref().map(|tree| tree.total_size()).unwrap_or(0)
    }

    pub fn data_block_id(&self) -> BlockId {
        self.data
            .as_ref()
            .map(|tree| tree.block_id())
            .unwrap_or_default()
    }

    pub fn subnode_block_id(&self) -> BlockId {
        self.sub_nodes
            .as_ref()
            .map(|tree| tree.block_id())
            .unwrap_or_default()
    }

    pub fn read(
        &self,
        store: &mut dyn BlockStore<Pst>,
        buf: &mut [u8],
        offset: u64,
    ) -> io::Result<usize> {
        match self.data.as_ref() {
            Some(tree) => tree.read(store, buf, offset),
            None if offset == 0 => Ok(0),
            None => Err(NdbError::DataTreeOutOfRange(offset, buf.len() as u64).into()),
        }
    }

    pub fn write(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        data: &[u8],
        offset: u64,
    ) -> io::Result<()> {
        let tree = self
            .data
            .take()
            .ok_or(NdbError::DataTreeOutOfRange(offset, data.len() as u64))?;
        self.data = Some(tree.write(store, data, offset)?);
        self.dirty = true;
        Ok(())
    }

    pub fn resize(&mut self, store: &mut dyn BlockStore<Pst>, new_size: u64) -> io::Result<()> {
        self.dirty = true;
        match self.data.take() {
            Some(tree) => {
                if new_size == 0 {
                    tree.discard(store)?;
                } else {
                    self.data = Some(tree.resize(store, new_size)?);
                }
            }
            None => {
                if new_size > 0 {
                    let leaf = Arc::new(DataTree::new_leaf(store, Vec::new())?);
                    self.data = Some(leaf.resize(store, new_size)?);
                }
            }
        }
        Ok(())
    }

    pub fn page_count(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<usize> {
        match self.data.as_ref() {
            Some(tree) => tree.page_count(store),
            None => Ok(0),
        }
    }

    pub fn read_page(&self, store: &mut dyn BlockStore<Pst>, index: usize) -> io::Result<Vec<u8>> {
        match self.data.as_ref() {
            Some(tree) => tree.read_page(store, index),
            None => Err(NdbError::DataTreePageOutOfRange(index).into()),
        }
    }

    pub fn write_page(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        index: usize,
        data: Vec<u8>,
    ) -> io::Result<()> {
        let tree = self
            .data
            .take()
            .ok_or(NdbError::DataTreePageOutOfRange(index))?;
        self.data = Some(tree.write_page(store, index, data)?);
        self.dirty = true;
        Ok(())
    }

    pub fn append_page(&mut self, store: &mut dyn BlockStore<Pst>, data: Vec<u8>) -> io::Result<()> {
        self.data = Some(match self.data.take() {
            Some(tree) => tree.append_page(store, data)?,
            None => Arc::new(DataTree::new_leaf(store, data)?),
        });
        self.dirty = true;
        Ok(())
    }

    /// Snapshot of the subnode entries in id order.
    pub fn subnodes(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<Vec<SubnodeEntry>> {
        let mut entries = Vec::new();
        if let Some(tree) = self.sub_nodes.as_ref() {
            tree.for_each(store, &mut |entry| {
                entries.push(*entry);
                Ok(())
            })?;
        }
        Ok(entries)
    }

    pub fn lookup_subnode(
        &self,
        store: &mut dyn BlockStore<Pst>,
        id: NodeId,
    ) -> io::Result<Node<Pst>> {
        let entry = self
            .sub_nodes
            .as_ref()
            .map(|tree| tree.lookup(store, id))
            .transpose()?
            .flatten()
            .ok_or(NdbError::SubNodeNotFound(id))?;
        Node::open(
            store,
            NodeInfo {
                node: entry.node,
                data: entry.data,
                sub_node: entry.sub_node,
                parent: NodeId::default(),
            },
        )
    }

    pub fn subnode_exists(
        &self,
        store: &mut dyn BlockStore<Pst>,
        id: NodeId,
    ) -> io::Result<bool> {
        Ok(self
            .sub_nodes
            .as_ref()
            .map(|tree| tree.lookup(store, id))
            .transpose()?
            .flatten()
            .is_some())
    }

    /// Register a new (still empty) subnode; fails on a duplicate id.
    pub fn create_subnode(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        id: NodeId,
    ) -> io::Result<Node<Pst>> {
        if self.subnode_exists(store, id)? {
            return Err(NdbError::DuplicateSubNodeId(id).into());
        }
        self.set_subnode_entry(
            store,
            SubnodeEntry {
                node: id,
                data: BlockId::default(),
                sub_node: BlockId::default(),
            },
        )?;
        Ok(Node::new(id, NodeId::default()))
    }

    /// Drop a subnode and everything it owns.
    pub fn delete_subnode(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        id: NodeId,
    ) -> io::Result<()> {
        let tree = self
            .sub_nodes
            .take()
            .ok_or(NdbError::SubNodeNotFound(id))?;
        let entry = tree
            .lookup(store, id)?
            .ok_or(NdbError::SubNodeNotFound(id))?;

        if !entry.data.is_none() {
            DataTree::<Pst>::drop_blocks(store, entry.data)?;
        }
        if !entry.sub_node.is_none() {
            SubnodeTree::<Pst>::drop_tree(store, entry.sub_node)?;
        }

        self.sub_nodes = tree.remove(store, id)?;
        self.dirty = true;
        Ok(())
    }

    /// Insert or update a subnode entry, growing the tree root on split.
    pub(crate) fn set_subnode_entry(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        entry: SubnodeEntry,
    ) -> io::Result<()> {
        let tree = match self.sub_nodes.take() {
            Some(tree) => tree,
            None => Arc::new(SubnodeTree::new_empty(store)?),
        };
        let (tree, split) = tree.insert(store, entry)?;
        self.sub_nodes = Some(match split {
            Some(sibling) => {
                let children = [tree, sibling];
                let entries = children
                    .iter()
                    .map(|child| SubnodeChild {
                        key: child.first_key().unwrap_or_default(),
                        block: child.block_id(),
                        cached: OnceLock::from(child.clone()),
                    })
                    .collect();
                Arc::new(SubnodeTree::Nonleaf(SubnodeNonleafBlock {
                    block: store.alloc_bid(true)?,
                    dirty: true,
                    entries,
                }))
            }
            None => tree,
        });
        self.dirty = true;
        Ok(())
    }

    /// Queue every dirty block of both trees and update the NBT entry.
    /// Only top-level nodes may be saved this way; subnodes go through
    /// [`Node::save_subnode`].
    pub fn save(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.save_trees(store)?;
        store.update_node(NodeInfo {
            node: self.id,
            data: self.data_block_id(),
            sub_node: self.subnode_block_id(),
            parent: self.parent,
        })?;
        self.dirty = false;
        Ok(())
    }

    /// Queue this subnode's trees and record it in the container node; the
    /// container chain still has to be saved by the caller, container
    /// first.
    pub fn save_subnode(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        container: &mut Node<Pst>,
    ) -> io::Result<()> {
        if !self.dirty {
            return Ok(());
        }
        self.save_trees(store)?;
        container.set_subnode_entry(
            store,
            SubnodeEntry {
                node: self.id,
                data: self.data_block_id(),
                sub_node: self.subnode_block_id(),
            },
        )?;
        self.dirty = false;
        Ok(())
    }

    fn save_trees(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if let Some(tree) = self.data.as_mut() {
            DataTree::save(tree, store)?;
        }
        if let Some(tree) = self.sub_nodes.as_mut() {
            SubnodeTree::save(tree, store)?;
        }
        Ok(())
    }

    /// Drop the reference counts of the node's data tree; used on node
    /// deletion.
    pub fn drop_data_blocks(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if let Some(tree) = self.data.take() {
            tree.discard(store)?;
        }
        Ok(())
    }

    /// Drop every subnode's storage and the subnode tree itself.
    pub fn drop_subnodes(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        if let Some(tree) = self.sub_nodes.take() {
            if tree.dirty() {
                // collect the entries first, then walk committed storage
                let mut entries = Vec::new();
                tree.for_each(store, &mut |entry| {
                    entries.push(*entry);
                    Ok(())
                })?;
                for entry in entries {
                    if !entry.data.is_none() {
                        DataTree::<Pst>::drop_blocks(store, entry.data)?;
                    }
                    if !entry.sub_node.is_none() {
                        SubnodeTree::<Pst>::drop_tree(store, entry.sub_node)?;
                    }
                }
            } else {
                SubnodeTree::<Pst>::drop_tree(store, tree.block_id())?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Unicode;
    use std::collections::BTreeMap;

    #[derive(Default)]
    struct TestStore {
        next_bid: u64,
        blocks: BTreeMap<u64, Vec<u8>>,
        nodes: BTreeMap<u32, NodeInfo>,
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

        fn drop_block(&mut self, _block: BlockId) -> io::Result<()> {
            Ok(())
        }

        fn queue_block(&mut self, block: BlockId, payload: Vec<u8>) -> io::Result<()> {
            self.blocks.insert(u64::from(block), payload);
            Ok(())
        }

        fn update_node(&mut self, info: NodeInfo) -> io::Result<()> {
            self.nodes.insert(u32::from(info.node), info);
            Ok(())
        }
    }

    fn nid(index: u32) -> NodeId {
        NodeId::new(NodeIdType::ListsTablesProperties, index).unwrap()
    }

    #[test]
    fn test_node_data_round_trip() {
        let mut store = TestStore::default();
        let mut node = Node::new(nid(1), NodeId::default());
        node.resize(&mut store, 16).unwrap();
        node.write(&mut store, b"0123456789abcdef", 0).unwrap();
        node.save(&mut store).unwrap();

        let info = store.nodes[&u32::from(nid(1))];
        let node = Node::<Unicode>::open(&mut store, info).unwrap();
        let mut buf = [0_u8; 16];
        node.read(&mut store, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"0123456789abcdef");
    }

    #[test]
    fn test_subnode_round_trip() {
        let mut store = TestStore::default();
        let mut node = Node::new(nid(1), NodeId::default());

        let mut subnode = node.create_subnode(&mut store, nid(2)).unwrap();
        subnode.resize(&mut store, 4).unwrap();
        subnode.write(&mut store, b"quux", 0).unwrap();
        subnode.save_subnode(&mut store, &mut node).unwrap();
        node.save(&mut store).unwrap();

        let info = store.nodes[&u32::from(nid(1))];
        let node = Node::<Unicode>::open(&mut store, info).unwrap();
        let subnode = node.lookup_subnode(&mut store, nid(2)).unwrap();
        assert!(subnode.parent_id().is_none());
        let mut buf = [0_u8; 4];
        subnode.read(&mut store, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"quux");
    }

    #[test]
    fn test_create_duplicate_subnode_fails() {
        let mut store = TestStore::default();
        let mut node = Node::<Unicode>::new(nid(1), NodeId::default());
        node.create_subnode(&mut store, nid(2)).unwrap();
        assert!(node.create_subnode(&mut store, nid(2)).is_err());
    }

    #[test]
    fn test_delete_subnode() {
        let mut store = TestStore::default();
        let mut node = Node::<Unicode>::new(nid(1), NodeId::default());
        node.create_subnode(&mut store, nid(2)).unwrap();
        node.create_subnode(&mut store, nid(3)).unwrap();

        node.delete_subnode(&mut store, nid(2)).unwrap();
        assert!(!node.subnode_exists(&mut store, nid(2)).unwrap());
        assert!(node.subnode_exists(&mut store, nid(3)).unwrap());
        assert!(node.delete_subnode(&mut store, nid(2)).is_err());
    }

    #[test]
    fn test_subnodes_iterate_in_order() {
        let mut store = TestStore::default();
        let mut node = Node::<Unicode>::new(nid(1), NodeId::default());
        for index in [5_u32, 2, 9, 4] {
            node.create_subnode(&mut store, nid(index)).unwrap();
        }
        let ids: Vec<u32> = node
            .subnodes(&mut store)
            .unwrap()
            .into_iter()
            .map(|e| e.node.index())
            .collect();
        assert_eq!(ids, vec![2, 4, 5, 9]);
    }
}
