//! ## [BTree-on-Heap (BTH)](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/2dd1a95a-c8b1-4ac5-87d1-10cb8de64053)
//!
//! A small persistent B-tree whose nodes are heap allocations. The header
//! allocation records key and value widths, the height, and the root heap
//! id; interior nodes map keys to child heap ids, leaves map keys to
//! values. A node that outgrows [`HEAP_MAX_ALLOC_SIZE`] peels its
//! rightmost record into a new sibling, growing a new root when the split
//! reaches the top.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    fmt::Debug,
    io::{self, Read, Write},
    marker::PhantomData,
};

use super::{heap::*, *};
use crate::ndb::block::BlockStore;
use crate::PstFile;

pub trait HeapTreeKey: Copy + Ord + Debug + Send + Sync + 'static {
    const SIZE: u8;

    fn read(f: &mut dyn Read) -> io::Result<Self>;
    fn write(&self, f: &mut dyn Write) -> io::Result<()>;
    fn as_u64(&self) -> u64;
}

impl HeapTreeKey for u16 {
    const SIZE: u8 = 2;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        f.read_u16::<LittleEndian>()
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u16::<LittleEndian>(*self)
    }

    fn as_u64(&self) -> u64 {
        u64::from(*self)
    }
}

impl HeapTreeKey for u32 {
    const SIZE: u8 = 4;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        f.read_u32::<LittleEndian>()
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u32::<LittleEndian>(*self)
    }

    fn as_u64(&self) -> u64 {
        u64::from(*self)
    }
}

pub trait HeapTreeValue: Copy + Debug + Send + Sync + 'static {
    const SIZE: u8;

    fn read(f: &mut dyn Read) -> io::Result<Self>;
    fn write(&self, f: &mut dyn Write) -> io::Result<()>;
}

/// [BTHHEADER](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/8e4ae05c-3c24-4103-b7e5-ffef6f244834)
#[derive(Clone, Copy, Debug)]
pub struct HeapTreeHeader {
    pub key_size: u8,
    pub entry_size: u8,
    pub levels: u8,
    pub root: HeapId,
}

impl HeapTreeHeader {
    pub const SIZE: usize = 8;

    pub fn read(f: &mut dyn Read) -> io::Result<Self> {
        // bType
        let heap_type = HeapNodeType::try_from(f.read_u8()?)?;
        if heap_type != HeapNodeType::Tree {
            return Err(LtpError::InvalidHeapTreeNodeType(heap_type).into());
        }
        // cbKey
        let key_size = f.read_u8()?;
        // cbEnt
        let entry_size = f.read_u8()?;
        // bIdxLevels
        let levels = f.read_u8()?;
        // hidRoot
        let root = HeapId::read(f)?;

        Ok(Self {
            key_size,
            entry_size,
            levels,
            root,
        })
    }

    pub fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u8(HeapNodeType::Tree as u8)?;
        f.write_u8(self.key_size)?;
        f.write_u8(self.entry_size)?;
        f.write_u8(self.levels)?;
        self.root.write(f)
    }
}

enum InsertOutcome<K> {
    Updated { id: HeapId, first_key: K },
    Split { left: (K, HeapId), right: (K, HeapId) },
}

/// A typed view over one BTH; all state lives in the heap.
pub struct HeapTree<K, V> {
    header_id: HeapId,
    _marker: PhantomData<(K, V)>,
}

impl<K: HeapTreeKey, V: HeapTreeValue> HeapTree<K, V> {
    const fn max_leaf_records() -> usize {
        HEAP_MAX_ALLOC_SIZE / (K::SIZE as usize + V::SIZE as usize)
    }

    const fn max_index_records() -> usize {
        HEAP_MAX_ALLOC_SIZE / (K::SIZE as usize + 4)
    }

    /// Allocate an empty tree; the returned header id is what the client
    /// stores (the PC user root, a TC row-index slot).
    pub fn create<Pst: PstFile>(
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
    ) -> io::Result<Self> {
        let header = HeapTreeHeader {
            key_size: K::SIZE,
            entry_size: V::SIZE,
            levels: 0,
            root: HeapId::default(),
        };
        let mut bytes: Vec<u8> = Vec::with_capacity(HeapTreeHeader::SIZE);
        header.write(&mut bytes)?;
        let header_id = heap.allocate(store, bytes.len())?;
        heap.write_item(store, header_id, &bytes, 0)?;
        Ok(Self {
            header_id,
            _marker: PhantomData,
        })
    }

    /// Bind to an existing tree, validating the recorded widths.
    pub fn open<Pst: PstFile>(
        heap: &Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        header_id: HeapId,
    ) -> io::Result<Self> {
        let header = Self::read_header_at(heap, store, header_id)?;
        if header.key_size != K::SIZE {
            return Err(LtpError::InvalidHeapTreeKeySize(header.key_size).into());
        }
        if header.entry_size != V::SIZE {
            return Err(LtpError::InvalidHeapTreeDataSize(header.entry_size).into());
        }
        Ok(Self {
            header_id,
            _marker: PhantomData,
        })
    }

    pub fn header_id(&self) -> HeapId {
        self.header_id
    }

    fn read_header_at<Pst: PstFile>(
        heap: &Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        header_id: HeapId,
    ) -> io::Result<HeapTreeHeader> {
        let bytes = heap.read_item(store, header_id)?;
        HeapTreeHeader::read(&mut bytes.as_slice())
    }

    fn read_header<Pst: PstFile>(
        &self,
        heap: &Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
    ) -> io::Result<HeapTreeHeader> {
        Self::read_header_at(heap, store, self.header_id)
    }

    fn write_header<Pst: PstFile>(
        &self,
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        header: &HeapTreeHeader,
    ) -> io::Result<()> {
        let mut bytes: Vec<u8> = Vec::with_capacity(HeapTreeHeader::SIZE);
        header.write(&mut bytes)?;
        heap.write_item(store, self.header_id, &bytes, 0)
    }

    fn parse_leaf(bytes: &[u8]) -> io::Result<Vec<(K, V)>> {
        let record = K::SIZE as usize + V::SIZE as usize;
        let mut records = Vec::with_capacity(bytes.len() / record);
        let mut cursor = bytes;
        while cursor.len() >= record {
            let key = K::read(&mut cursor)?;
            let value = V::read(&mut cursor)?;
            records.push((key, value));
        }
        Ok(records)
    }

    fn build_leaf(records: &[(K, V)]) -> io::Result<Vec<u8>> {
        let mut bytes =
            Vec::with_capacity(records.len() * (K::SIZE as usize + V::SIZE as usize));
        for (key, value) in records {
            key.write(&mut bytes)?;
            value.write(&mut bytes)?;
        }
        Ok(bytes)
    }

    fn parse_index(bytes: &[u8]) -> io::Result<Vec<(K, HeapId)>> {
        let record = K::SIZE as usize + 4;
        let mut records = Vec::with_capacity(bytes.len() / record);
        let mut cursor = bytes;
        while cursor.len() >= record {
            let key = K::read(&mut cursor)?;
            let child = HeapId::read(&mut cursor)?;
            records.push((key, child));
        }
        Ok(records)
    }

    fn build_index(records: &[(K, HeapId)]) -> io::Result<Vec<u8>> {
        let mut bytes: Vec<u8> = Vec::with_capacity(records.len() * (K::SIZE as usize + 4));
        for (key, child) in records {
            key.write(&mut bytes)?;
            child.write(&mut bytes)?;
        }
        Ok(bytes)
    }

    /// Rewrite a node's bytes, letting the heap move it when the size
    /// changed; returns the surviving heap id.
    fn store_node<Pst: PstFile>(
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        id: HeapId,
        bytes: &[u8],
    ) -> io::Result<HeapId> {
        let id = if heap.item_size(store, id)? == bytes.len() {
            id
        } else {
            heap.reallocate(store, id, bytes.len())?
        };
        heap.write_item(store, id, bytes, 0)?;
        Ok(id)
    }

    pub fn lookup<Pst: PstFile>(
        &self,
        heap: &Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        key: K,
    ) -> io::Result<Option<V>> {
        let header = self.read_header(heap, store)?;
        if header.root.is_none() {
            return Ok(None);
        }

        let mut level = header.levels;
        let mut current = header.root;
        while level > 0 {
            let records = Self::parse_index(&heap.read_item(store, current)?)?;
            let Some(pos) = records.partition_point(|(k, _)| *k <= key).checked_sub(1) else {
                return Ok(None);
            };
            current = records[pos].1;
            level -= 1;
        }

        let records = Self::parse_leaf(&heap.read_item(store, current)?)?;
        Ok(records
            .binary_search_by(|(k, _)| k.cmp(&key))
            .ok()
            .map(|pos| records[pos].1))
    }

    /// Unique-key insert with overwrite-on-duplicate semantics.
    pub fn insert<Pst: PstFile>(
        &self,
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        key: K,
        value: V,
    ) -> io::Result<()> {
        let mut header = self.read_header(heap, store)?;

        if header.root.is_none() {
            let bytes = Self::build_leaf(&[(key, value)])?;
            let root = heap.allocate(store, bytes.len())?;
            heap.write_item(store, root, &bytes, 0)?;
            header.root = root;
            header.levels = 0;
            return self.write_header(heap, store, &header);
        }

        match Self::insert_into(heap, store, header.root, header.levels, key, value)? {
            InsertOutcome::Updated { id, .. } => {
                if id != header.root {
                    header.root = id;
                    self.write_header(heap, store, &header)?;
                }
                Ok(())
            }
            InsertOutcome::Split { left, right } => {
                let bytes = Self::build_index(&[left, right])?;
                let root = heap.allocate(store, bytes.len())?;
                heap.write_item(store, root, &bytes, 0)?;
                header.root = root;
                header.levels += 1;
                self.write_header(heap, store, &header)
            }
        }
    }

    fn insert_into<Pst: PstFile>(
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        node: HeapId,
        level: u8,
        key: K,
        value: V,
    ) -> io::Result<InsertOutcome<K>> {
        if level == 0 {
            let mut records = Self::parse_leaf(&heap.read_item(store, node)?)?;
            match records.binary_search_by(|(k, _)| k.cmp(&key)) {
                Ok(pos) => records[pos] = (key, value),
                Err(pos) => records.insert(pos, (key, value)),
            }

            if records.len() > Self::max_leaf_records() {
                let peeled = records
                    .pop()
                    .ok_or(LtpError::InvalidMultiValuePropertyCount(0))?;
                let right_bytes = Self::build_leaf(&[peeled])?;
                let right = heap.allocate(store, right_bytes.len())?;
                heap.write_item(store, right, &right_bytes, 0)?;

                let left_bytes = Self::build_leaf(&records)?;
                let left = Self::store_node(heap, store, node, &left_bytes)?;
                return Ok(InsertOutcome::Split {
                    left: (records[0].0, left),
                    right: (peeled.0, right),
                });
            }

            let first_key = records[0].0;
            let bytes = Self::build_leaf(&records)?;
            let id = Self::store_node(heap, store, node, &bytes)?;
            Ok(InsertOutcome::Updated { id, first_key })
        } else {
            let mut records = Self::parse_index(&heap.read_item(store, node)?)?;
            let pos = records
                .partition_point(|(k, _)| *k <= key)
                .checked_sub(1)
                .unwrap_or_default();
            let child = records[pos].1;

            match Self::insert_into(heap, store, child, level - 1, key, value)? {
                InsertOutcome::Updated { id, first_key } => {
                    records[pos] = (first_key.min(records[pos].0), id);
                }
                InsertOutcome::Split { left, right } => {
                    records[pos] = left;
                    records.insert(pos + 1, right);
                }
            }

            if records.len() > Self::max_index_records() {
                let peeled = records
                    .pop()
                    .ok_or(LtpError::InvalidMultiValuePropertyCount(0))?;
                let right_bytes = Self::build_index(&[peeled])?;
                let right = heap.allocate(store, right_bytes.len())?;
                heap.write_item(store, right, &right_bytes, 0)?;

                let left_bytes = Self::build_index(&records)?;
                let left = Self::store_node(heap, store, node, &left_bytes)?;
                return Ok(InsertOutcome::Split {
                    left: (records[0].0, left),
                    right: (peeled.0, right),
                });
            }

            let first_key = records[0].0;
            let bytes = Self::build_index(&records)?;
            let id = Self::store_node(heap, store, node, &bytes)?;
            Ok(InsertOutcome::Updated { id, first_key })
        }
    }

    /// Replace an existing record; fails when the key is absent.
    pub fn modify<Pst: PstFile>(
        &self,
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        key: K,
        value: V,
    ) -> io::Result<()> {
        if self.lookup(heap, store, key)?.is_none() {
            return Err(LtpError::HeapTreeKeyNotFound(key.as_u64()).into());
        }
        self.insert(heap, store, key, value)
    }

    /// Remove a record; fails when the key is absent.
    pub fn remove<Pst: PstFile>(
        &self,
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        key: K,
    ) -> io::Result<()> {
        let mut header = self.read_header(heap, store)?;
        if header.root.is_none() {
            return Err(LtpError::HeapTreeKeyNotFound(key.as_u64()).into());
        }

        match Self::remove_from(heap, store, header.root, header.levels, key)? {
            Some((id, _)) => {
                if id != header.root {
                    header.root = id;
                    self.write_header(heap, store, &header)?;
                }
                Ok(())
            }
            None => {
                header.root = HeapId::default();
                header.levels = 0;
                self.write_header(heap, store, &header)
            }
        }
    }

    fn remove_from<Pst: PstFile>(
        heap: &mut Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        node: HeapId,
        level: u8,
        key: K,
    ) -> io::Result<Option<(HeapId, K)>> {
        if level == 0 {
            let mut records = Self::parse_leaf(&heap.read_item(store, node)?)?;
            let pos = records
                .binary_search_by(|(k, _)| k.cmp(&key))
                .map_err(|_| LtpError::HeapTreeKeyNotFound(key.as_u64()))?;
            records.remove(pos);
            if records.is_empty() {
                heap.free_item(store, node)?;
                return Ok(None);
            }
            let bytes = Self::build_leaf(&records)?;
            let id = Self::store_node(heap, store, node, &bytes)?;
            Ok(Some((id, records[0].0)))
        } else {
            let mut records = Self::parse_index(&heap.read_item(store, node)?)?;
            let pos = records
                .partition_point(|(k, _)| *k <= key)
                .checked_sub(1)
                .ok_or(LtpError::HeapTreeKeyNotFound(key.as_u64()))?;
            let child = records[pos].1;

            match Self::remove_from(heap, store, child, level - 1, key)? {
                Some((id, first_key)) => {
                    records[pos] = (first_key, id);
                }
                None => {
                    records.remove(pos);
                }
            }
            if records.is_empty() {
                heap.free_item(store, node)?;
                return Ok(None);
            }
            let bytes = Self::build_index(&records)?;
            let id = Self::store_node(heap, store, node, &bytes)?;
            Ok(Some((id, records[0].0)))
        }
    }

    /// Visit every record in key order.
    pub fn for_each<Pst: PstFile>(
        &self,
        heap: &Heap<Pst>,
        store: &mut dyn BlockStore<Pst>,
        visit: &mut dyn FnMut(K, V) -> io::Result<()>,
    ) -> io::Result<()> {
        let header = self.read_header(heap, store)?;
        if header.root.is_none() {
            return Ok(());
        }

        let mut level = header.levels;
        let mut nodes = vec![header.root];
        while level > 0 {
            let mut next_level = Vec::new();
            for node in nodes {
                for (_, child) in Self::parse_index(&heap.read_item(store, node)?)? {
                    next_level.push(child);
                }
            }
            nodes = next_level;
            level -= 1;
        }

        for node in nodes {
            for (key, value) in Self::parse_leaf(&heap.read_item(store, node)?)? {
                visit(key, value)?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    impl HeapTreeValue for u32 {
        const SIZE: u8 = 4;

        fn read(f: &mut dyn Read) -> io::Result<Self> {
            f.read_u32::<LittleEndian>()
        }

        fn write(&self, f: &mut dyn Write) -> io::Result<()> {
            f.write_u32::<LittleEndian>(*self)
        }
    }

    #[test]
    fn test_header_round_trip() {
        let header = HeapTreeHeader {
            key_size: 2,
            entry_size: 6,
            levels: 1,
            root: HeapId::new(2, 0).unwrap(),
        };
        let mut bytes: Vec<u8> = Vec::new();
        header.write(&mut bytes).unwrap();
        assert_eq!(bytes.len(), HeapTreeHeader::SIZE);

        let read_back = HeapTreeHeader::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(read_back.key_size, 2);
        assert_eq!(read_back.entry_size, 6);
        assert_eq!(read_back.levels, 1);
        assert_eq!(read_back.root, header.root);
    }

    #[test]
    fn test_record_capacity() {
        assert_eq!(HeapTree::<u16, u32>::max_leaf_records(), 3580 / 6);
        assert_eq!(HeapTree::<u32, u32>::max_index_records(), 3580 / 8);
    }
}
