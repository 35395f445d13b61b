//! Database context: the mutable top of the NDB.
//!
//! A context owns in-memory copies of the header, the NBT and BBT roots,
//! the allocation map, and queues of pending block writes. Mutations stay
//! in the context until [`DbContext::commit`], which either rewrites the
//! file bottom-up (root context) or folds the queued updates into the
//! parent context's trees. Child contexts are snapshots: a child whose
//! touched nodes diverged in the parent since the snapshot fails its
//! commit with [`NdbError::NodeSaveConflict`].

use std::{
    collections::{BTreeMap, BTreeSet},
    fs::OpenOptions,
    io::{self, Seek, SeekFrom, Write},
    marker::PhantomData,
    path::Path,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard, OnceLock, Weak,
    },
};

use tracing::{error, instrument};

use super::{
    allocation_map::*,
    block::*,
    block_id::*,
    block_ref::*,
    btree::*,
    byte_index::ByteIndex,
    header::{Header, NdbCryptMethod},
    node::Node,
    node_id::{NodeId, NodeIdType},
    page::*,
    root::{AmapStatus, Root},
    *,
};
use crate::{FileIo, PstFile};

fn poisoned() -> io::Error {
    io::Error::other("database lock poisoned")
}

/// One queued B-tree maintenance action.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum UpdateAction {
    Insert,
    Modify,
    Remove,
}

#[derive(Copy, Clone, Debug)]
pub struct BTreeUpdate<E: BTreeEntry> {
    pub action: UpdateAction,
    pub key: u64,
    pub entry: Option<E>,
}

pub(crate) struct GlobalState<Pst: PstFile> {
    pub(crate) file: FileIo,
    pub(crate) header: Header<Pst>,
    pub(crate) amap: AllocationMap<Pst>,
}

pub(crate) struct CtxState<Pst: PstFile> {
    nbt_root: Arc<BTreePage<NodeInfo>>,
    bbt_root: Arc<BTreePage<BlockInfo>>,
    snapshot_nbt: Arc<BTreePage<NodeInfo>>,
    snapshot_bbt: Arc<BTreePage<BlockInfo>>,
    nbt_updates: Vec<BTreeUpdate<NodeInfo>>,
    bbt_updates: Vec<BTreeUpdate<BlockInfo>>,
    data_queue: BTreeMap<u64, Vec<u8>>,
    subnode_queue: BTreeMap<u64, Vec<u8>>,
    _pst: PhantomData<Pst>,
}

/// Adapter giving the B-tree code page IO and fresh page ids.
pub(crate) struct PageIo<'a, Pst: PstFile, E> {
    global: &'a mut GlobalState<Pst>,
    page_type: PageType,
    _entry: PhantomData<E>,
}

impl<'a, Pst: PstFile, E> PageIo<'a, Pst, E> {
    fn new(global: &'a mut GlobalState<Pst>, page_type: PageType) -> Self {
        Self {
            global,
            page_type,
            _entry: PhantomData,
        }
    }
}

impl<Pst, E> BTreePageStore<E> for PageIo<'_, Pst, E>
where
    Pst: PstFile,
    E: BTreeEntryReadWrite<Pst>,
{
    fn read_page(&mut self, page: PageRef) -> io::Result<BTreePage<E>> {
        let offset = page.index().index();
        self.global.file.seek(SeekFrom::Start(offset))?;
        read_btree_page::<Pst, E>(&mut self.global.file, self.page_type, offset)
    }

    fn alloc_pid(&mut self) -> io::Result<PageId> {
        Ok(self.global.header.alloc_pid())
    }
}

fn take_root<E: BTreeEntry>(slot: &mut Arc<BTreePage<E>>) -> Arc<BTreePage<E>> {
    std::mem::replace(slot, Arc::new(BTreePage::empty_leaf(PageId::new(0), 1)))
}

/// Apply one update to a tree root, growing a fresh non-leaf root on split
/// and replacing a dissolved root with an empty leaf. Insert and modify
/// are both applied as upserts; the distinction matters to conflict
/// detection, not to the tree.
fn apply_update<Pst, E>(
    global: &mut GlobalState<Pst>,
    root_slot: &mut Arc<BTreePage<E>>,
    page_type: PageType,
    update: &BTreeUpdate<E>,
) -> io::Result<()>
where
    Pst: PstFile,
    E: BTreeEntryReadWrite<Pst>,
{
    let mut io = PageIo::new(global, page_type);
    let root = take_root(root_slot);

    let new_root = match (update.action, update.entry) {
        (UpdateAction::Insert, Some(entry)) | (UpdateAction::Modify, Some(entry)) => {
            let (root, split) = root.insert(&mut io, entry)?;
            match split {
                Some(sibling) => {
                    let pid = io.alloc_pid()?;
                    Arc::new(BTreePage::new_root(
                        pid,
                        max_nonleaf_entries::<Pst>(),
                        vec![root, sibling],
                    ))
                }
                None => root,
            }
        }
        (UpdateAction::Remove, _) => match root.remove(&mut io, update.key)? {
            Some(root) => root,
            None => Arc::new(BTreePage::empty_leaf(
                io.alloc_pid()?,
                max_leaf_entries::<Pst, E>(),
            )),
        },
        _ => {
            return Err(NdbError::DatabaseCorrupt("update without an entry").into());
        }
    };

    *root_slot = new_root;
    Ok(())
}

/// Both-locks view used by the node, tree, and LTP layers.
pub(crate) struct StoreAccess<'a, Pst: PstFile> {
    pub(crate) global: &'a mut GlobalState<Pst>,
    pub(crate) state: &'a mut CtxState<Pst>,
}

impl<Pst: PstFile> StoreAccess<'_, Pst> {
    fn lookup_block(&mut self, block: BlockId) -> io::Result<Option<BlockInfo>> {
        let mut io = PageIo::new(&mut *self.global, PageType::BlockBTree);
        self.state.bbt_root.lookup(&mut io, u64::from(block))
    }

    pub(crate) fn lookup_node_info(&mut self, node: NodeId) -> io::Result<Option<NodeInfo>> {
        let mut io = PageIo::new(&mut *self.global, PageType::NodeBTree);
        self.state
            .nbt_root
            .lookup(&mut io, u64::from(u32::from(node)))
    }

    fn snapshot_has_node(&mut self, node: NodeId) -> io::Result<bool> {
        let mut io = PageIo::new(&mut *self.global, PageType::NodeBTree);
        Ok(self
            .state
            .snapshot_nbt
            .lookup(&mut io, u64::from(u32::from(node)))?
            .is_some())
    }

    fn snapshot_has_block(&mut self, block: BlockId) -> io::Result<bool> {
        let mut io = PageIo::new(&mut *self.global, PageType::BlockBTree);
        Ok(self
            .state
            .snapshot_bbt
            .lookup(&mut io, u64::from(block))?
            .is_some())
    }

    fn apply_bbt(&mut self, update: BTreeUpdate<BlockInfo>) -> io::Result<()> {
        apply_update(
            &mut *self.global,
            &mut self.state.bbt_root,
            PageType::BlockBTree,
            &update,
        )?;
        self.state.bbt_updates.push(update);
        Ok(())
    }

    fn apply_nbt(&mut self, update: BTreeUpdate<NodeInfo>) -> io::Result<()> {
        apply_update(
            &mut *self.global,
            &mut self.state.nbt_root,
            PageType::NodeBTree,
            &update,
        )?;
        self.state.nbt_updates.push(update);
        Ok(())
    }

    pub(crate) fn remove_node(&mut self, node: NodeId) -> io::Result<()> {
        let key = u64::from(u32::from(node));
        if self.snapshot_has_node(node)? {
            self.apply_nbt(BTreeUpdate {
                action: UpdateAction::Remove,
                key,
                entry: None,
            })
        } else {
            // created in this transaction; drop it and every queued trace
            apply_update(
                &mut *self.global,
                &mut self.state.nbt_root,
                PageType::NodeBTree,
                &BTreeUpdate::<NodeInfo> {
                    action: UpdateAction::Remove,
                    key,
                    entry: None,
                },
            )?;
            self.state.nbt_updates.retain(|update| update.key != key);
            Ok(())
        }
    }
}

impl<Pst: PstFile> BlockStore<Pst> for StoreAccess<'_, Pst> {
    fn fetch_block(&mut self, block: BlockId) -> io::Result<Vec<u8>> {
        let key = u64::from(block);
        if let Some(payload) = self
            .state
            .data_queue
            .get(&key)
            .or_else(|| self.state.subnode_queue.get(&key))
        {
            return Ok(payload.clone());
        }

        let info = self
            .lookup_block(block)?
            .ok_or(NdbError::BlockNotFound(block))?;
        if info.index.index() == 0 {
            return Err(NdbError::DatabaseCorrupt("queued block left the queue").into());
        }
        read_block_payload::<Pst, _>(
            &mut self.global.file,
            block,
            info.index.index(),
            info.size,
            self.global.header.crypt_method(),
        )
    }

    fn fetch_block_size(&mut self, block: BlockId) -> io::Result<u64> {
        let key = u64::from(block);
        if let Some(payload) = self
            .state
            .data_queue
            .get(&key)
            .or_else(|| self.state.subnode_queue.get(&key))
        {
            return Ok(payload.len() as u64);
        }
        let info = self
            .lookup_block(block)?
            .ok_or(NdbError::BlockNotFound(block))?;
        Ok(u64::from(info.size))
    }

    fn alloc_bid(&mut self, is_internal: bool) -> io::Result<BlockId> {
        Ok(self.global.header.alloc_bid(is_internal)?)
    }

    fn alloc_nid(&mut self, id_type: NodeIdType) -> io::Result<NodeId> {
        Ok(self.global.header.alloc_nid(id_type)?)
    }

    fn drop_block(&mut self, block: BlockId) -> io::Result<()> {
        let Some(info) = self.lookup_block(block)? else {
            // never persisted and never queued; nothing to release
            return Ok(());
        };
        let updated = BlockInfo {
            ref_count: info.ref_count.saturating_sub(1),
            ..info
        };
        let action = if self.snapshot_has_block(block)? {
            UpdateAction::Modify
        } else {
            UpdateAction::Insert
        };
        self.apply_bbt(BTreeUpdate {
            action,
            key: u64::from(block),
            entry: Some(updated),
        })
    }

    fn queue_block(&mut self, block: BlockId, payload: Vec<u8>) -> io::Result<()> {
        self.queue_block_on(block, payload, false)
    }

    fn queue_subnode_block(&mut self, block: BlockId, payload: Vec<u8>) -> io::Result<()> {
        self.queue_block_on(block, payload, true)
    }

    fn update_node(&mut self, info: NodeInfo) -> io::Result<()> {
        let action = if self.snapshot_has_node(info.node)? {
            UpdateAction::Modify
        } else {
            UpdateAction::Insert
        };
        self.apply_nbt(BTreeUpdate {
            action,
            key: info.key(),
            entry: Some(info),
        })
    }
}

impl<Pst: PstFile> StoreAccess<'_, Pst> {
    fn queue_block_on(
        &mut self,
        block: BlockId,
        payload: Vec<u8>,
        subnode: bool,
    ) -> io::Result<()> {
        let size = u16::try_from(payload.len())
            .map_err(|_| NdbError::InvalidBlockSize(MAX_BLOCK_SIZE))?;

        let entry = match self.lookup_block(block)? {
            Some(existing) => BlockInfo {
                size,
                ..existing
            },
            None => BlockInfo {
                block,
                index: ByteIndex::default(),
                size,
                ref_count: 2,
            },
        };
        let action = if self.snapshot_has_block(block)? {
            UpdateAction::Modify
        } else {
            UpdateAction::Insert
        };

        let key = u64::from(block);
        if subnode {
            self.state.subnode_queue.insert(key, payload);
        } else {
            self.state.data_queue.insert(key, payload);
        }
        self.apply_bbt(BTreeUpdate {
            action,
            key,
            entry: Some(entry),
        })
    }
}

/// An open database. The root context talks to the file; child contexts
/// stack on top of it (see [`DbContext::create_context`]).
pub struct DbContext<Pst: PstFile> {
    shared: Arc<Mutex<GlobalState<Pst>>>,
    parent: Option<Arc<DbContext<Pst>>>,
    state: Mutex<CtxState<Pst>>,
    child_contexts: AtomicUsize,
    self_ref: Weak<DbContext<Pst>>,
}

impl<Pst: PstFile> DbContext<Pst> {
    /// Open an existing PST for read/write access. A torn allocation map
    /// is rebuilt before the context becomes usable.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Arc<Self>> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Self::open_from(Box::new(file))
    }

    /// Same as [`DbContext::open`] over any backing store.
    pub fn open_from(mut file: FileIo) -> io::Result<Arc<Self>> {
        let mut header = Header::<Pst>::reload(&mut file)?;
        let mut amap = AllocationMap::new();
        if header.root().amap_is_valid() != AmapStatus::Valid2 {
            amap.rebuild(&mut file, &mut header)?;
        }

        let nbt_root = Arc::new(Self::read_root_page::<NodeInfo>(
            &mut file,
            header.root().node_btree(),
            PageType::NodeBTree,
        )?);
        let bbt_root = Arc::new(Self::read_root_page::<BlockInfo>(
            &mut file,
            header.root().block_btree(),
            PageType::BlockBTree,
        )?);

        Ok(Arc::new_cyclic(|self_ref| Self {
            shared: Arc::new(Mutex::new(GlobalState { file, header, amap })),
            parent: None,
            state: Mutex::new(CtxState {
                snapshot_nbt: nbt_root.clone(),
                snapshot_bbt: bbt_root.clone(),
                nbt_root,
                bbt_root,
                nbt_updates: Vec::new(),
                bbt_updates: Vec::new(),
                data_queue: BTreeMap::new(),
                subnode_queue: BTreeMap::new(),
                _pst: PhantomData,
            }),
            child_contexts: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        }))
    }

    /// Create a brand-new single-interval PST.
    pub fn create(path: impl AsRef<Path>, crypt_method: NdbCryptMethod) -> io::Result<Arc<Self>> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Self::create_from(Box::new(file), crypt_method)
    }

    /// Same as [`DbContext::create`] over any backing store.
    pub fn create_from(mut file: FileIo, crypt_method: NdbCryptMethod) -> io::Result<Arc<Self>> {
        let eof = amap_page_offset(1);
        let root = Root::new(
            ByteIndex::new(eof),
            ByteIndex::new(FIRST_AMAP_PAGE_OFFSET),
            0,
            PageRef::default(),
            PageRef::default(),
            AmapStatus::Invalid,
        );
        let mut header = Header::<Pst>::new(root, crypt_method);

        // zero the header area and the entire first interval
        file.seek(SeekFrom::Start(0))?;
        let zeros = vec![0_u8; PAGE_SIZE * 16];
        let mut remaining = eof as usize;
        while remaining > 0 {
            let chunk = remaining.min(zeros.len());
            file.write_all(&zeros[..chunk])?;
            remaining -= chunk;
        }

        let mut amap = AllocationMap::new();
        amap.seed_new_file(&mut header);

        // empty NBT and BBT roots
        let nbt_offset = amap.allocate(&mut file, &mut header, PAGE_SIZE as u64, true)?;
        let bbt_offset = amap.allocate(&mut file, &mut header, PAGE_SIZE as u64, true)?;
        let nbt_pid = header.alloc_pid();
        let bbt_pid = header.alloc_pid();

        let mut nbt_root =
            BTreePage::<NodeInfo>::empty_leaf(nbt_pid, max_leaf_entries::<Pst, NodeInfo>());
        nbt_root.set_offset(ByteIndex::new(nbt_offset));
        nbt_root.clear_dirty();
        file.seek(SeekFrom::Start(nbt_offset))?;
        write_btree_page::<Pst, NodeInfo>(&nbt_root, PageType::NodeBTree, &mut file)?;

        let mut bbt_root =
            BTreePage::<BlockInfo>::empty_leaf(bbt_pid, max_leaf_entries::<Pst, BlockInfo>());
        bbt_root.set_offset(ByteIndex::new(bbt_offset));
        bbt_root.clear_dirty();
        file.seek(SeekFrom::Start(bbt_offset))?;
        write_btree_page::<Pst, BlockInfo>(&bbt_root, PageType::BlockBTree, &mut file)?;

        {
            let root = header.root_mut();
            root.set_node_btree(PageRef::new(nbt_pid, ByteIndex::new(nbt_offset)));
            root.set_block_btree(PageRef::new(bbt_pid, ByteIndex::new(bbt_offset)));
        }

        amap.flush(&mut file, &mut header)?;
        header.root_mut().set_amap_status(AmapStatus::Valid2);
        header.flush(&mut file)?;
        file.flush()?;

        let nbt_root = Arc::new(nbt_root);
        let bbt_root = Arc::new(bbt_root);
        Ok(Arc::new_cyclic(|self_ref| Self {
            shared: Arc::new(Mutex::new(GlobalState { file, header, amap })),
            parent: None,
            state: Mutex::new(CtxState {
                snapshot_nbt: nbt_root.clone(),
                snapshot_bbt: bbt_root.clone(),
                nbt_root,
                bbt_root,
                nbt_updates: Vec::new(),
                bbt_updates: Vec::new(),
                data_queue: BTreeMap::new(),
                subnode_queue: BTreeMap::new(),
                _pst: PhantomData,
            }),
            child_contexts: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        }))
    }

    fn read_root_page<E>(
        file: &mut FileIo,
        page_ref: PageRef,
        page_type: PageType,
    ) -> io::Result<BTreePage<E>>
    where
        E: BTreeEntryReadWrite<Pst>,
    {
        let offset = page_ref.index().index();
        if offset == 0 {
            return Ok(BTreePage::empty_leaf(
                page_ref.page(),
                max_leaf_entries::<Pst, E>(),
            ));
        }
        file.seek(SeekFrom::Start(offset))?;
        read_btree_page::<Pst, E>(file, page_type, offset)
    }

    fn lock_state(&self) -> io::Result<MutexGuard<'_, CtxState<Pst>>> {
        self.state.lock().map_err(|_| poisoned())
    }

    fn lock_global(&self) -> io::Result<MutexGuard<'_, GlobalState<Pst>>> {
        self.shared.lock().map_err(|_| poisoned())
    }

    /// Run an operation against this context's trees and queues. The
    /// context lock is taken before the file-wide lock, everywhere.
    pub(crate) fn with_store<R>(
        &self,
        op: impl FnOnce(&mut StoreAccess<'_, Pst>) -> io::Result<R>,
    ) -> io::Result<R> {
        let mut state = self.lock_state()?;
        let mut global = self.lock_global()?;
        let mut access = StoreAccess {
            global: &mut global,
            state: &mut state,
        };
        op(&mut access)
    }

    pub fn crypt_method(&self) -> io::Result<NdbCryptMethod> {
        Ok(self.lock_global()?.header.crypt_method())
    }

    /// A copy of the current in-memory ROOT record.
    pub fn root_info(&self) -> io::Result<Root> {
        Ok(self.lock_global()?.header.root().clone())
    }

    pub fn alloc_nid(&self, id_type: NodeIdType) -> io::Result<NodeId> {
        match self.parent.as_ref() {
            // id allocation always happens at the top of the stack
            Some(parent) => parent.alloc_nid(id_type),
            None => Ok(self.lock_global()?.header.alloc_nid(id_type)?),
        }
    }

    pub fn node_exists(&self, node: NodeId) -> io::Result<bool> {
        self.with_store(|store| Ok(store.lookup_node_info(node)?.is_some()))
    }

    pub fn block_exists(&self, block: BlockId) -> io::Result<bool> {
        self.with_store(|store| Ok(store.lookup_block(block)?.is_some()))
    }

    pub fn lookup_node_info(&self, node: NodeId) -> io::Result<NodeInfo> {
        self.with_store(|store| {
            store
                .lookup_node_info(node)?
                .ok_or_else(|| NdbError::NodeNotFound(node).into())
        })
    }

    pub fn lookup_block_info(&self, block: BlockId) -> io::Result<BlockInfo> {
        self.with_store(|store| {
            store
                .lookup_block(block)?
                .ok_or_else(|| NdbError::BlockNotFound(block).into())
        })
    }

    /// Materialise a node and its trees.
    pub fn lookup_node(&self, node: NodeId) -> io::Result<Node<Pst>> {
        self.with_store(|store| {
            let info = store
                .lookup_node_info(node)?
                .ok_or(NdbError::NodeNotFound(node))?;
            Node::open(store, info)
        })
    }

    /// Register a new top-level node; fails on a duplicate id.
    pub fn create_node(&self, node: NodeId, parent: NodeId) -> io::Result<Node<Pst>> {
        self.with_store(|store| {
            if store.lookup_node_info(node)?.is_some() {
                return Err(NdbError::DuplicateNodeId(node).into());
            }
            store.update_node(NodeInfo {
                node,
                data: BlockId::default(),
                sub_node: BlockId::default(),
                parent,
            })?;
            Ok(Node::new(node, parent))
        })
    }

    /// Remove a node and release everything it references.
    pub fn delete_node(&self, node: NodeId) -> io::Result<()> {
        self.with_store(|store| {
            let info = store
                .lookup_node_info(node)?
                .ok_or(NdbError::NodeNotFound(node))?;
            let mut open = Node::open(store, info)?;
            open.drop_data_blocks(store)?;
            open.drop_subnodes(store)?;
            store.remove_node(node)
        })
    }

    /// Queue a node's dirty state for the next commit.
    pub fn save_node(&self, node: &mut Node<Pst>) -> io::Result<()> {
        self.with_store(|store| node.save(store))
    }

    /// Apply a batch of NBT maintenance actions.
    pub fn update_node_btree(&self, updates: &[BTreeUpdate<NodeInfo>]) -> io::Result<()> {
        self.with_store(|store| {
            for update in updates {
                store.apply_nbt(*update)?;
            }
            Ok(())
        })
    }

    /// Apply a batch of BBT maintenance actions.
    pub fn update_block_btree(&self, updates: &[BTreeUpdate<BlockInfo>]) -> io::Result<()> {
        self.with_store(|store| {
            for update in updates {
                store.apply_bbt(*update)?;
            }
            Ok(())
        })
    }

    /// Snapshot this context: the child sees the current trees and commits
    /// back into them, failing if they moved underneath it.
    pub fn create_context(&self) -> io::Result<Arc<Self>> {
        let this = self.self_ref.upgrade().ok_or_else(poisoned)?;
        let state = self.lock_state()?;
        let child = Arc::new_cyclic(|self_ref| Self {
            shared: self.shared.clone(),
            parent: Some(this.clone()),
            state: Mutex::new(CtxState {
                nbt_root: state.nbt_root.clone(),
                bbt_root: state.bbt_root.clone(),
                snapshot_nbt: state.nbt_root.clone(),
                snapshot_bbt: state.bbt_root.clone(),
                nbt_updates: Vec::new(),
                bbt_updates: Vec::new(),
                data_queue: BTreeMap::new(),
                subnode_queue: BTreeMap::new(),
                _pst: PhantomData,
            }),
            child_contexts: AtomicUsize::new(0),
            self_ref: self_ref.clone(),
        });
        drop(state);

        let mut ancestor = Some(this);
        while let Some(ctx) = ancestor {
            ctx.child_contexts.fetch_add(1, Ordering::AcqRel);
            ancestor = ctx.parent.clone();
        }
        Ok(child)
    }

    /// Commit: to disk from the root context, into the parent otherwise.
    pub fn commit(&self) -> io::Result<()> {
        match self.parent.as_ref() {
            Some(parent) => self.commit_to_context(parent),
            None => self.commit_to_disk(),
        }
    }

    /// Throw away everything since the last successful commit (or the
    /// snapshot point, for a child context).
    pub fn discard_changes(&self) -> io::Result<()> {
        let mut state = self.lock_state()?;
        state.nbt_root = state.snapshot_nbt.clone();
        state.bbt_root = state.snapshot_bbt.clone();
        state.nbt_updates.clear();
        state.bbt_updates.clear();
        state.data_queue.clear();
        state.subnode_queue.clear();
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit_to_disk(&self) -> io::Result<()> {
        let mut state = self.lock_state()?;
        let mut global = self.lock_global()?;
        let state = &mut *state;
        let global = &mut *global;

        global.amap.begin_transaction(&mut global.file, &mut global.header)?;

        // clear the validity flag first so a torn commit is detected
        global.header.update_unique();
        global.header.root_mut().set_amap_status(AmapStatus::Invalid);
        global.header.flush(&mut global.file)?;
        global.file.flush()?;

        // release blocks nothing references any more; only safe with no
        // snapshot contexts alive
        if self.child_contexts.load(Ordering::Acquire) == 0 {
            let mut freeable = Vec::new();
            {
                let mut io = PageIo::new(&mut *global, PageType::BlockBTree);
                state.bbt_root.for_each_entry(&mut io, &mut |entry| {
                    if entry.ref_count < 2 {
                        freeable.push(*entry);
                    }
                    Ok(())
                })?;
            }
            for entry in freeable {
                if entry.index.index() != 0 {
                    let disk_size =
                        u64::from(block_size(entry.size + BlockTrailer::size::<Pst>()));
                    global.amap.free(
                        &mut global.file,
                        &mut global.header,
                        entry.index.index(),
                        disk_size,
                    )?;
                }
                let key = entry.key();
                state.data_queue.remove(&key);
                state.subnode_queue.remove(&key);
                apply_update(
                    global,
                    &mut state.bbt_root,
                    PageType::BlockBTree,
                    &BTreeUpdate::<BlockInfo> {
                        action: UpdateAction::Remove,
                        key,
                        entry: None,
                    },
                )?;
            }
        }

        // rewrite the dirty NBT pages bottom-up into fresh allocations
        if state.nbt_root.dirty() {
            let page_ref = global.header.root().node_btree();
            let old_pages =
                collect_disk_pages::<Pst, NodeInfo>(global, page_ref, PageType::NodeBTree)?;
            write_out_pages::<Pst, NodeInfo>(&mut state.nbt_root, global, PageType::NodeBTree)?;
            free_dead_pages(global, &state.nbt_root, &old_pages)?;
            let page_ref = PageRef::new(state.nbt_root.page_id(), state.nbt_root.offset());
            global.header.root_mut().set_node_btree(page_ref);
        }

        // drain the pending block writes; each write settles the BBT
        // entry's final file offset
        let queued: Vec<(u64, Vec<u8>)> = state
            .data_queue
            .iter()
            .chain(state.subnode_queue.iter())
            .map(|(key, payload)| (*key, payload.clone()))
            .collect();
        state.data_queue.clear();
        state.subnode_queue.clear();

        for (key, payload) in queued {
            let block = BlockId::from(key);
            let entry = {
                let mut io = PageIo::new(&mut *global, PageType::BlockBTree);
                state.bbt_root.lookup(&mut io, key)?
            };
            let Some(entry) = entry else {
                continue;
            };
            let disk_size = u64::from(block_size(
                payload.len() as u16 + BlockTrailer::size::<Pst>(),
            ));
            let offset =
                global
                    .amap
                    .allocate(&mut global.file, &mut global.header, disk_size, false)?;
            write_block_payload::<Pst, _>(
                &mut global.file,
                block,
                offset,
                &payload,
                global.header.crypt_method(),
            )?;
            apply_update(
                global,
                &mut state.bbt_root,
                PageType::BlockBTree,
                &BTreeUpdate {
                    action: UpdateAction::Modify,
                    key,
                    entry: Some(BlockInfo {
                        index: ByteIndex::new(offset),
                        ..entry
                    }),
                },
            )?;
        }

        // now the BBT itself
        if state.bbt_root.dirty() {
            let page_ref = global.header.root().block_btree();
            let old_pages =
                collect_disk_pages::<Pst, BlockInfo>(global, page_ref, PageType::BlockBTree)?;
            write_out_pages::<Pst, BlockInfo>(&mut state.bbt_root, global, PageType::BlockBTree)?;
            free_dead_pages(global, &state.bbt_root, &old_pages)?;
            let page_ref = PageRef::new(state.bbt_root.page_id(), state.bbt_root.offset());
            global.header.root_mut().set_block_btree(page_ref);
        }

        // persist the map family, then validate and write the header last
        global.amap.flush(&mut global.file, &mut global.header)?;
        global.header.update_unique();
        global.header.root_mut().set_amap_status(AmapStatus::Valid2);
        global.header.flush(&mut global.file)?;
        global.file.flush()?;

        state.snapshot_nbt = state.nbt_root.clone();
        state.snapshot_bbt = state.bbt_root.clone();
        state.nbt_updates.clear();
        state.bbt_updates.clear();
        Ok(())
    }

    #[instrument(skip_all)]
    fn commit_to_context(&self, parent: &Arc<Self>) -> io::Result<()> {
        let mut state = self.lock_state()?;
        let mut parent_state = parent.state.lock().map_err(|_| poisoned())?;
        let mut global = self.lock_global()?;
        let state = &mut *state;
        let parent_state = &mut *parent_state;
        let global = &mut *global;

        if !Self::is_ok_to_commit(global, state, parent_state)? {
            error!(
                name: "PstNodeSaveConflict",
                "conflicting changes in the parent context, reverting to snapshot"
            );
            state.nbt_root = state.snapshot_nbt.clone();
            state.bbt_root = state.snapshot_bbt.clone();
            state.nbt_updates.clear();
            state.bbt_updates.clear();
            state.data_queue.clear();
            state.subnode_queue.clear();
            return Err(NdbError::NodeSaveConflict.into());
        }

        for update in state.nbt_updates.drain(..) {
            apply_update(global, &mut parent_state.nbt_root, PageType::NodeBTree, &update)?;
            parent_state.nbt_updates.push(update);
        }
        for update in state.bbt_updates.drain(..) {
            apply_update(global, &mut parent_state.bbt_root, PageType::BlockBTree, &update)?;
            parent_state.bbt_updates.push(update);
        }
        parent_state.data_queue.append(&mut state.data_queue);
        parent_state.subnode_queue.append(&mut state.subnode_queue);

        state.snapshot_nbt = state.nbt_root.clone();
        state.snapshot_bbt = state.bbt_root.clone();
        Ok(())
    }

    /// A child may commit only if none of the nodes it touched have moved
    /// in the parent since the snapshot was taken.
    fn is_ok_to_commit(
        global: &mut GlobalState<Pst>,
        state: &mut CtxState<Pst>,
        parent_state: &mut CtxState<Pst>,
    ) -> io::Result<bool> {
        for update in state.nbt_updates.iter() {
            let in_parent = {
                let mut io = PageIo::new(&mut *global, PageType::NodeBTree);
                parent_state.nbt_root.lookup(&mut io, update.key)?
            };
            match update.action {
                UpdateAction::Insert => {
                    if in_parent.is_some() {
                        return Ok(false);
                    }
                }
                UpdateAction::Modify => {
                    let at_snapshot = {
                        let mut io = PageIo::new(&mut *global, PageType::NodeBTree);
                        state.snapshot_nbt.lookup(&mut io, update.key)?
                    };
                    let (Some(theirs), Some(ours)) = (in_parent, at_snapshot) else {
                        return Ok(false);
                    };
                    if u64::from(theirs.data) != u64::from(ours.data)
                        || u64::from(theirs.sub_node) != u64::from(ours.sub_node)
                        || theirs.parent != ours.parent
                    {
                        return Ok(false);
                    }
                }
                UpdateAction::Remove => {
                    if in_parent.is_none() {
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    /// Every node entry, in id order; test and tooling hook.
    pub fn node_infos(&self) -> io::Result<Vec<NodeInfo>> {
        self.with_store(|store| {
            let mut out = Vec::new();
            let mut io = PageIo::new(&mut *store.global, PageType::NodeBTree);
            store.state.nbt_root.for_each_entry(&mut io, &mut |entry| {
                out.push(*entry);
                Ok(())
            })?;
            Ok(out)
        })
    }

    /// Every block entry, in id order; test and tooling hook.
    pub fn block_infos(&self) -> io::Result<Vec<BlockInfo>> {
        self.with_store(|store| {
            let mut out = Vec::new();
            let mut io = PageIo::new(&mut *store.global, PageType::BlockBTree);
            store.state.bbt_root.for_each_entry(&mut io, &mut |entry| {
                out.push(*entry);
                Ok(())
            })?;
            Ok(out)
        })
    }

    /// Whether every 64-byte slot covering the range is allocated.
    pub fn is_allocated(&self, offset: u64, size: u64) -> io::Result<bool> {
        let mut global = self.lock_global()?;
        let global = &mut *global;
        global
            .amap
            .is_allocated(&mut global.file, &global.header, offset, size)
    }
}

impl<Pst: PstFile> Drop for DbContext<Pst> {
    fn drop(&mut self) {
        let mut ancestor = self.parent.clone();
        while let Some(ctx) = ancestor {
            ctx.child_contexts.fetch_sub(1, Ordering::AcqRel);
            ancestor = ctx.parent.clone();
        }
    }
}

/// Collect (page id, offset) of every page in the committed tree.
fn collect_disk_pages<Pst, E>(
    global: &mut GlobalState<Pst>,
    page_ref: PageRef,
    page_type: PageType,
) -> io::Result<Vec<(u64, u64)>>
where
    Pst: PstFile,
    E: BTreeEntryReadWrite<Pst>,
{
    let mut out = Vec::new();
    if page_ref.index().index() == 0 {
        return Ok(out);
    }
    let mut stack = vec![page_ref];
    while let Some(page_ref) = stack.pop() {
        let offset = page_ref.index().index();
        global.file.seek(SeekFrom::Start(offset))?;
        let page = read_btree_page::<Pst, E>(&mut global.file, page_type, offset)?;
        out.push((u64::from(page.page_id()), offset));
        if let BTreePage::Nonleaf(nonleaf) = &page {
            for slot in nonleaf.entries.iter() {
                stack.push(slot.page);
            }
        }
    }
    Ok(out)
}

/// Write the dirty pages of a tree bottom-up, each into a fresh aligned
/// allocation, patching the parents' child references on the way out.
fn write_out_pages<Pst, E>(
    page: &mut Arc<BTreePage<E>>,
    global: &mut GlobalState<Pst>,
    page_type: PageType,
) -> io::Result<()>
where
    Pst: PstFile,
    E: BTreeEntryReadWrite<Pst>,
{
    if !page.dirty() {
        return Ok(());
    }

    let inner = Arc::make_mut(page);
    if let BTreePage::Nonleaf(nonleaf) = inner {
        for slot in nonleaf.entries.iter_mut() {
            if let Some(child) = slot.cached.take() {
                let mut child = child;
                write_out_pages(&mut child, global, page_type)?;
                slot.page = PageRef::new(child.page_id(), child.offset());
                slot.cached = OnceLock::from(child);
            }
        }
    }

    let offset = global
        .amap
        .allocate(&mut global.file, &mut global.header, PAGE_SIZE as u64, true)?;
    inner.set_offset(ByteIndex::new(offset));
    global.file.seek(SeekFrom::Start(offset))?;
    write_btree_page::<Pst, E>(inner, page_type, &mut global.file)?;
    inner.clear_dirty();
    Ok(())
}

/// Free the old versions of pages that are no longer reachable from the
/// freshly written tree.
fn free_dead_pages<Pst, E>(
    global: &mut GlobalState<Pst>,
    root: &Arc<BTreePage<E>>,
    old_pages: &[(u64, u64)],
) -> io::Result<()>
where
    Pst: PstFile,
    E: BTreeEntry,
{
    let mut live = BTreeSet::new();
    root.collect_live_pids(&mut live);
    for (pid, offset) in old_pages {
        if !live.contains(pid) {
            global
                .amap
                .free(&mut global.file, &mut global.header, *offset, PAGE_SIZE as u64)?;
        }
    }
    Ok(())
}
