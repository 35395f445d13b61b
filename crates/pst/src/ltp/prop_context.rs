//! ## [Property Context (PC)](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/294c83c6-ff92-42f5-b6b6-876c29fa9737)
//!
//! A BTH keyed by 16-bit property ids whose 6-byte records carry the
//! property type and either the value itself (small fixed types) or a
//! heap-or-node id locating it. Values promote from the heap to a
//! dedicated subnode when they outgrow [`HEAP_MAX_ALLOC_SIZE`], and
//! demote back when rewritten small.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Cursor, Read, Write};

use super::{heap::*, prop_type::*, tree::*, *};
use crate::ndb::{
    block::BlockStore,
    node::Node,
    node_id::{NodeId, NodeIdType},
};
use crate::PstFile;

/// `dwValueHnid`: either a heap id or a subnode id, told apart by the
/// heap-node type bits.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum HeapOrNodeId {
    None,
    Heap(HeapId),
    Node(NodeId),
}

impl From<u32> for HeapOrNodeId {
    fn from(value: u32) -> Self {
        if value == 0 {
            Self::None
        } else if matches!(NodeId::from(value).id_type(), Ok(NodeIdType::HeapNode)) {
            Self::Heap(HeapId::from(value))
        } else {
            Self::Node(NodeId::from(value))
        }
    }
}

impl From<HeapOrNodeId> for u32 {
    fn from(value: HeapOrNodeId) -> Self {
        match value {
            HeapOrNodeId::None => 0,
            HeapOrNodeId::Heap(heap_id) => u32::from(heap_id),
            HeapOrNodeId::Node(node_id) => u32::from(node_id),
        }
    }
}

/// [PC BTH Record](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/7daab6f5-ce65-437e-80d5-1b1be4088bd3)
/// value: `wPropType` + `dwValueHnid`.
#[derive(Copy, Clone, Debug)]
pub struct PropertyRecord {
    pub prop_type: PropertyType,
    pub value: u32,
}

impl HeapTreeValue for PropertyRecord {
    const SIZE: u8 = 6;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        // wPropType
        let prop_type = PropertyType::try_from(f.read_u16::<LittleEndian>()?)?;
        // dwValueHnid
        let value = f.read_u32::<LittleEndian>()?;
        Ok(Self { prop_type, value })
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u16::<LittleEndian>(u16::from(self.prop_type))?;
        f.write_u32::<LittleEndian>(self.value)
    }
}

/// A decoded property value.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    Null,
    Integer16(i16),
    Integer32(i32),
    Floating32(f32),
    Floating64(f64),
    Currency(i64),
    FloatingTime(f64),
    ErrorCode(i32),
    Boolean(bool),
    Integer64(i64),
    String8(Vec<u8>),
    Unicode(String),
    Time(i64),
    Guid([u8; 16]),
    Binary(Vec<u8>),
    MultipleInteger32(Vec<i32>),
    MultipleString8(Vec<Vec<u8>>),
    MultipleUnicode(Vec<String>),
    MultipleBinary(Vec<Vec<u8>>),
}

impl PropertyValue {
    pub fn prop_type(&self) -> PropertyType {
        match self {
            Self::Null => PropertyType::Null,
            Self::Integer16(_) => PropertyType::Integer16,
            Self::Integer32(_) => PropertyType::Integer32,
            Self::Floating32(_) => PropertyType::Floating32,
            Self::Floating64(_) => PropertyType::Floating64,
            Self::Currency(_) => PropertyType::Currency,
            Self::FloatingTime(_) => PropertyType::FloatingTime,
            Self::ErrorCode(_) => PropertyType::ErrorCode,
            Self::Boolean(_) => PropertyType::Boolean,
            Self::Integer64(_) => PropertyType::Integer64,
            Self::String8(_) => PropertyType::String8,
            Self::Unicode(_) => PropertyType::Unicode,
            Self::Time(_) => PropertyType::Time,
            Self::Guid(_) => PropertyType::Guid,
            Self::Binary(_) => PropertyType::Binary,
            Self::MultipleInteger32(_) => PropertyType::MultipleInteger32,
            Self::MultipleString8(_) => PropertyType::MultipleString8,
            Self::MultipleUnicode(_) => PropertyType::MultipleUnicode,
            Self::MultipleBinary(_) => PropertyType::MultipleBinary,
        }
    }

    fn inline_value(&self) -> Option<u32> {
        match self {
            Self::Null => Some(0),
            Self::Integer16(value) => Some(u32::from(*value as u16)),
            Self::Integer32(value) => Some(*value as u32),
            Self::Floating32(value) => Some(value.to_bits()),
            Self::ErrorCode(value) => Some(*value as u32),
            Self::Boolean(value) => Some(u32::from(*value)),
            _ => None,
        }
    }

    fn multi_value_blob(items: Vec<Vec<u8>>) -> io::Result<Vec<u8>> {
        // 4-byte count, then per-item offsets, then the items
        let mut bytes = Vec::new();
        bytes.write_u32::<LittleEndian>(items.len() as u32)?;
        let mut offset = 4 + 4 * items.len() as u32;
        for item in items.iter() {
            bytes.write_u32::<LittleEndian>(offset)?;
            offset += item.len() as u32;
        }
        for item in items.iter() {
            bytes.write_all(item)?;
        }
        Ok(bytes)
    }

    fn split_multi_value_blob(bytes: &[u8]) -> io::Result<Vec<Vec<u8>>> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.read_u32::<LittleEndian>()? as usize;
        if 4 + 4 * count > bytes.len() {
            return Err(LtpError::InvalidMultiValuePropertyCount(count).into());
        }
        let mut offsets = Vec::with_capacity(count + 1);
        for _ in 0..count {
            offsets.push(cursor.read_u32::<LittleEndian>()? as usize);
        }
        offsets.push(bytes.len());

        let mut items = Vec::with_capacity(count);
        for pair in offsets.windows(2) {
            let (start, end) = (pair[0], pair[1]);
            if start > end || end > bytes.len() {
                return Err(LtpError::InvalidMultiValuePropertyOffset(start).into());
            }
            items.push(bytes[start..end].to_vec());
        }
        Ok(items)
    }

    fn encode_wide(text: &str) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(text.len() * 2);
        for unit in text.encode_utf16() {
            bytes.extend_from_slice(&unit.to_le_bytes());
        }
        bytes
    }

    fn decode_wide(bytes: &[u8]) -> String {
        let units: Vec<u16> = bytes
            .chunks_exact(2)
            .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
            .collect();
        String::from_utf16_lossy(&units)
    }

    /// Wide text squeezed into 8-bit code units; the narrow-string policy
    /// keeps the on-disk type when a wide value lands on a narrow
    /// property.
    fn narrow(text: &str) -> Vec<u8> {
        text.encode_utf16().map(|unit| unit as u8).collect()
    }

    /// The variable-length (or fixed 8/16-byte) storage encoding.
    pub(crate) fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut bytes = Vec::new();
        match self {
            Self::Floating64(value) | Self::FloatingTime(value) => {
                bytes.write_f64::<LittleEndian>(*value)?;
            }
            Self::Currency(value) | Self::Integer64(value) | Self::Time(value) => {
                bytes.write_i64::<LittleEndian>(*value)?;
            }
            Self::Guid(value) => bytes.write_all(value)?,
            Self::String8(value) | Self::Binary(value) => bytes.write_all(value)?,
            Self::Unicode(value) => bytes = Self::encode_wide(value),
            Self::MultipleInteger32(values) => {
                let items = values
                    .iter()
                    .map(|value| value.to_le_bytes().to_vec())
                    .collect();
                bytes = Self::multi_value_blob(items)?;
            }
            Self::MultipleString8(values) | Self::MultipleBinary(values) => {
                bytes = Self::multi_value_blob(values.clone())?;
            }
            Self::MultipleUnicode(values) => {
                let items = values.iter().map(|text| Self::encode_wide(text)).collect();
                bytes = Self::multi_value_blob(items)?;
            }
            _ => {
                return Err(
                    LtpError::InvalidVariableLengthPropertyType(self.prop_type()).into(),
                );
            }
        }
        Ok(bytes)
    }

    pub(crate) fn from_bytes(prop_type: PropertyType, bytes: &[u8]) -> io::Result<Self> {
        let mut cursor = Cursor::new(bytes);
        Ok(match prop_type {
            PropertyType::Floating64 => Self::Floating64(cursor.read_f64::<LittleEndian>()?),
            PropertyType::FloatingTime => Self::FloatingTime(cursor.read_f64::<LittleEndian>()?),
            PropertyType::Currency => Self::Currency(cursor.read_i64::<LittleEndian>()?),
            PropertyType::Integer64 => Self::Integer64(cursor.read_i64::<LittleEndian>()?),
            PropertyType::Time => Self::Time(cursor.read_i64::<LittleEndian>()?),
            PropertyType::Guid => {
                let mut guid = [0_u8; 16];
                cursor.read_exact(&mut guid)?;
                Self::Guid(guid)
            }
            PropertyType::String8 => Self::String8(bytes.to_vec()),
            PropertyType::Unicode => Self::Unicode(Self::decode_wide(bytes)),
            PropertyType::Binary => Self::Binary(bytes.to_vec()),
            PropertyType::MultipleInteger32 => {
                let items = Self::split_multi_value_blob(bytes)?;
                let mut values = Vec::with_capacity(items.len());
                for item in items {
                    values.push(i32::from_le_bytes(item.try_into().map_err(|_| {
                        LtpError::InvalidMultiValuePropertyOffset(0)
                    })?));
                }
                Self::MultipleInteger32(values)
            }
            PropertyType::MultipleString8 => {
                Self::MultipleString8(Self::split_multi_value_blob(bytes)?)
            }
            PropertyType::MultipleUnicode => {
                let items = Self::split_multi_value_blob(bytes)?;
                Self::MultipleUnicode(items.iter().map(|b| Self::decode_wide(b)).collect())
            }
            PropertyType::MultipleBinary => {
                Self::MultipleBinary(Self::split_multi_value_blob(bytes)?)
            }
            other => return Err(LtpError::InvalidVariableLengthPropertyType(other).into()),
        })
    }
}

/// A property bag over one node.
pub struct PropertyContext<Pst: PstFile> {
    heap: Heap<Pst>,
    tree: HeapTree<u16, PropertyRecord>,
}

impl<Pst: PstFile> PropertyContext<Pst> {
    /// Lay a fresh property context over an empty node.
    pub fn create(store: &mut dyn BlockStore<Pst>, node: Node<Pst>) -> io::Result<Self> {
        let mut heap = Heap::create(store, node, HeapNodeType::Properties)?;
        let tree = HeapTree::create(&mut heap, store)?;
        heap.set_user_root(store, tree.header_id())?;
        Ok(Self { heap, tree })
    }

    pub fn open(store: &mut dyn BlockStore<Pst>, node: Node<Pst>) -> io::Result<Self> {
        let heap = Heap::open(store, node, HeapNodeType::Properties)?;
        let tree = HeapTree::open(&heap, store, heap.user_root())?;
        Ok(Self { heap, tree })
    }

    pub fn node(&self) -> &Node<Pst> {
        self.heap.node()
    }

    pub fn node_mut(&mut self) -> &mut Node<Pst> {
        self.heap.node_mut()
    }

    /// Queue the backing node's dirty state (top-level nodes).
    pub fn save(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        self.heap.node_mut().save(store)
    }

    /// Queue the backing node as a subnode of `container`.
    pub fn save_subnode(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        container: &mut Node<Pst>,
    ) -> io::Result<()> {
        self.heap.node_mut().save_subnode(store, container)
    }

    /// Every (property id, record) pair in id order.
    pub fn properties(
        &self,
        store: &mut dyn BlockStore<Pst>,
    ) -> io::Result<Vec<(u16, PropertyRecord)>> {
        let mut out = Vec::new();
        self.tree.for_each(&self.heap, store, &mut |key, value| {
            out.push((key, value));
            Ok(())
        })?;
        Ok(out)
    }

    pub fn list_ids(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<Vec<u16>> {
        Ok(self
            .properties(store)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    fn record(&self, store: &mut dyn BlockStore<Pst>, id: u16) -> io::Result<Option<PropertyRecord>> {
        self.tree.lookup(&self.heap, store, id)
    }

    pub fn exists(&self, store: &mut dyn BlockStore<Pst>, id: u16) -> io::Result<bool> {
        Ok(self.record(store, id)?.is_some())
    }

    pub fn prop_type(&self, store: &mut dyn BlockStore<Pst>, id: u16) -> io::Result<PropertyType> {
        Ok(self
            .record(store, id)?
            .ok_or(LtpError::PropertyNotFound(id))?
            .prop_type)
    }

    /// Size in bytes of the stored value.
    pub fn size(&self, store: &mut dyn BlockStore<Pst>, id: u16) -> io::Result<usize> {
        let record = self.record(store, id)?.ok_or(LtpError::PropertyNotFound(id))?;
        if record.prop_type.is_inline() {
            return Ok(usize::from(record.prop_type.cell_size()));
        }
        match HeapOrNodeId::from(record.value) {
            HeapOrNodeId::None => Ok(0),
            HeapOrNodeId::Heap(heap_id) => self.heap.item_size(store, heap_id),
            HeapOrNodeId::Node(node_id) => {
                let subnode = self.heap.node().lookup_subnode(store, node_id)?;
                Ok(subnode.size() as usize)
            }
        }
    }

    fn fetch_variable(
        &self,
        store: &mut dyn BlockStore<Pst>,
        value: u32,
    ) -> io::Result<Vec<u8>> {
        match HeapOrNodeId::from(value) {
            HeapOrNodeId::None => Ok(Vec::new()),
            HeapOrNodeId::Heap(heap_id) => self.heap.read_item(store, heap_id),
            HeapOrNodeId::Node(node_id) => {
                let subnode = self.heap.node().lookup_subnode(store, node_id)?;
                let mut bytes = vec![0_u8; subnode.size() as usize];
                subnode.read(store, &mut bytes, 0)?;
                Ok(bytes)
            }
        }
    }

    pub fn read_prop(
        &self,
        store: &mut dyn BlockStore<Pst>,
        id: u16,
    ) -> io::Result<PropertyValue> {
        let record = self.record(store, id)?.ok_or(LtpError::PropertyNotFound(id))?;
        Ok(match record.prop_type {
            PropertyType::Null => PropertyValue::Null,
            PropertyType::Integer16 => PropertyValue::Integer16(record.value as u16 as i16),
            PropertyType::Integer32 => PropertyValue::Integer32(record.value as i32),
            PropertyType::Floating32 => {
                PropertyValue::Floating32(f32::from_bits(record.value))
            }
            PropertyType::ErrorCode => PropertyValue::ErrorCode(record.value as i32),
            PropertyType::Boolean => PropertyValue::Boolean(record.value & 0xFF != 0),
            other => {
                let bytes = self.fetch_variable(store, record.value)?;
                PropertyValue::from_bytes(other, &bytes)?
            }
        })
    }

    /// The raw stored bytes of a variable-length property, as a positioned
    /// stream.
    pub fn open_stream(
        &self,
        store: &mut dyn BlockStore<Pst>,
        id: u16,
    ) -> io::Result<Cursor<Vec<u8>>> {
        let record = self.record(store, id)?.ok_or(LtpError::PropertyNotFound(id))?;
        if record.prop_type.is_inline() {
            return Err(LtpError::InvalidVariableLengthPropertyType(record.prop_type).into());
        }
        Ok(Cursor::new(self.fetch_variable(store, record.value)?))
    }

    /// Create or overwrite a property, moving the value between inline,
    /// heap and subnode storage as its size demands.
    pub fn write_prop(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        id: u16,
        value: PropertyValue,
    ) -> io::Result<()> {
        let existing = self.record(store, id)?;

        // narrow-string policy: a wide write onto a narrow property keeps
        // the narrow encoding
        let (prop_type, bytes) = match (&value, existing.map(|r| r.prop_type)) {
            (PropertyValue::Unicode(text), Some(PropertyType::String8)) => {
                (PropertyType::String8, Some(PropertyValue::narrow(text)))
            }
            _ => {
                let prop_type = value.prop_type();
                if prop_type.is_inline() {
                    (prop_type, None)
                } else {
                    (prop_type, Some(value.to_bytes()?))
                }
            }
        };

        let old_storage = existing
            .map(|record| {
                if record.prop_type.is_inline() {
                    HeapOrNodeId::None
                } else {
                    HeapOrNodeId::from(record.value)
                }
            })
            .unwrap_or(HeapOrNodeId::None);

        let record_value = match bytes {
            None => {
                self.release_storage(store, old_storage)?;
                value.inline_value().unwrap_or_default()
            }
            // a zero-length value stores the reserved "absent" hnid
            Some(bytes) if bytes.is_empty() => {
                self.release_storage(store, old_storage)?;
                0
            }
            Some(bytes) if bytes.len() <= HEAP_MAX_ALLOC_SIZE => {
                let heap_id = match old_storage {
                    HeapOrNodeId::Heap(old) => {
                        let new = self.heap.reallocate(store, old, bytes.len())?;
                        self.heap.write_item(store, new, &bytes, 0)?;
                        new
                    }
                    other => {
                        self.release_storage(store, other)?;
                        let new = self.heap.allocate(store, bytes.len())?;
                        self.heap.write_item(store, new, &bytes, 0)?;
                        new
                    }
                };
                u32::from(heap_id)
            }
            Some(bytes) => {
                let node_id = match old_storage {
                    HeapOrNodeId::Node(node_id) => {
                        let mut subnode =
                            self.heap.node().lookup_subnode(store, node_id)?;
                        subnode.resize(store, bytes.len() as u64)?;
                        subnode.write(store, &bytes, 0)?;
                        subnode.save_subnode(store, self.heap.node_mut())?;
                        node_id
                    }
                    other => {
                        self.release_storage(store, other)?;
                        let node_id = store.alloc_nid(NodeIdType::ListsTablesProperties)?;
                        let mut subnode =
                            self.heap.node_mut().create_subnode(store, node_id)?;
                        subnode.resize(store, bytes.len() as u64)?;
                        subnode.write(store, &bytes, 0)?;
                        subnode.save_subnode(store, self.heap.node_mut())?;
                        node_id
                    }
                };
                u32::from(node_id)
            }
        };

        self.tree.insert(
            &mut self.heap,
            store,
            id,
            PropertyRecord {
                prop_type,
                value: record_value,
            },
        )
    }

    fn release_storage(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        storage: HeapOrNodeId,
    ) -> io::Result<()> {
        match storage {
            HeapOrNodeId::None => Ok(()),
            HeapOrNodeId::Heap(heap_id) => self.heap.free_item(store, heap_id),
            HeapOrNodeId::Node(node_id) => {
                self.heap.node_mut().delete_subnode(store, node_id)
            }
        }
    }

    /// Remove a property, reclaiming heap or subnode storage.
    pub fn remove_prop(&mut self, store: &mut dyn BlockStore<Pst>, id: u16) -> io::Result<()> {
        let record = self.record(store, id)?.ok_or(LtpError::PropertyNotFound(id))?;
        if !record.prop_type.is_inline() {
            self.release_storage(store, HeapOrNodeId::from(record.value))?;
        }
        self.tree.remove(&mut self.heap, store, id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hnid_disambiguation() {
        assert_eq!(HeapOrNodeId::from(0), HeapOrNodeId::None);

        let heap_id = HeapId::new(1, 0).unwrap();
        assert_eq!(
            HeapOrNodeId::from(u32::from(heap_id)),
            HeapOrNodeId::Heap(heap_id)
        );

        let node_id = NodeId::new(NodeIdType::ListsTablesProperties, 5).unwrap();
        assert_eq!(
            HeapOrNodeId::from(u32::from(node_id)),
            HeapOrNodeId::Node(node_id)
        );
    }

    #[test]
    fn test_multi_value_blob_round_trip() {
        let items = vec![b"one".to_vec(), Vec::new(), b"three".to_vec()];
        let blob = PropertyValue::multi_value_blob(items.clone()).unwrap();
        assert_eq!(&blob[..4], &3_u32.to_le_bytes());
        let split = PropertyValue::split_multi_value_blob(&blob).unwrap();
        assert_eq!(split, items);
    }

    #[test]
    fn test_wide_encoding_round_trip() {
        let text = "MailBox \u{00E9}\u{4E16}";
        let bytes = PropertyValue::encode_wide(text);
        assert_eq!(PropertyValue::decode_wide(&bytes), text);
    }

    #[test]
    fn test_narrow_truncates_code_units() {
        assert_eq!(PropertyValue::narrow("AB\u{0141}"), vec![0x41, 0x42, 0x41]);
    }

    #[test]
    fn test_inline_values() {
        assert_eq!(PropertyValue::Boolean(true).inline_value(), Some(1));
        assert_eq!(
            PropertyValue::Integer16(-2).inline_value(),
            Some(0xFFFE)
        );
        assert_eq!(PropertyValue::Binary(vec![1]).inline_value(), None);
    }

    #[test]
    fn test_fixed_width_round_trip() {
        let value = PropertyValue::Integer64(-123_456_789_000);
        let bytes = value.to_bytes().unwrap();
        assert_eq!(bytes.len(), 8);
        assert_eq!(
            PropertyValue::from_bytes(PropertyType::Integer64, &bytes).unwrap(),
            value
        );

        let value = PropertyValue::Guid(*b"0123456789abcdef");
        let bytes = value.to_bytes().unwrap();
        assert_eq!(bytes.len(), 16);
        assert_eq!(
            PropertyValue::from_bytes(PropertyType::Guid, &bytes).unwrap(),
            value
        );
    }
}
