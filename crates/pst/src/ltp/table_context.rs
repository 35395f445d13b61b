//! ## [Table Context (TC)](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5e48be0d-a75a-4918-a277-50408ff96740)
//!
//! A row/column store over a heap: a TCINFO header describing the fixed
//! row-record layout, a row-index BTH mapping 32-bit row ids to row
//! positions, and a row matrix that lives inline in one heap allocation
//! until it outgrows it and moves to a dedicated subnode of fixed-size
//! row pages.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{self, Cursor, Read, Write},
    marker::PhantomData,
};

use super::{heap::*, prop_context::*, prop_type::*, tree::*, *};
use crate::ndb::{
    block::{max_external_size, BlockStore},
    node::Node,
    node_id::{NodeId, NodeIdType},
};
use crate::PstFile;

/// `PidTagLtpRowId`: the row id column present in every table.
pub const LTP_ROW_ID_PROP_ID: u16 = 0x67F2;

/// `PidTagLtpRowVer`: the row version column written by Outlook; kept when
/// present, not required.
pub const LTP_ROW_VERSION_PROP_ID: u16 = 0x67F3;

pub const fn existence_bitmap_size(column_count: usize) -> usize {
    column_count.div_ceil(8)
}

/// [TCOLDESC](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/3a2f63cf-bb40-4559-910c-e55ec43d9cbb)
#[derive(Clone, Copy, Debug)]
pub struct TableColumnDescriptor {
    prop_type: PropertyType,
    prop_id: u16,
    offset: u16,
    size: u8,
    existence_bit: u8,
}

impl TableColumnDescriptor {
    pub fn prop_type(&self) -> PropertyType {
        self.prop_type
    }

    pub fn prop_id(&self) -> u16 {
        self.prop_id
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    pub fn size(&self) -> u8 {
        self.size
    }

    pub fn existence_bit(&self) -> u8 {
        self.existence_bit
    }

    pub fn read(f: &mut dyn Read) -> io::Result<Self> {
        // tag
        let prop_type = PropertyType::try_from(f.read_u16::<LittleEndian>()?)?;
        let prop_id = f.read_u16::<LittleEndian>()?;
        // ibData
        let offset = f.read_u16::<LittleEndian>()?;
        // cbData
        let size = f.read_u8()?;
        // iBit
        let existence_bit = f.read_u8()?;
        Ok(Self {
            prop_type,
            prop_id,
            offset,
            size,
            existence_bit,
        })
    }

    pub fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u16::<LittleEndian>(u16::from(self.prop_type))?;
        f.write_u16::<LittleEndian>(self.prop_id)?;
        f.write_u16::<LittleEndian>(self.offset)?;
        f.write_u8(self.size)?;
        f.write_u8(self.existence_bit)
    }
}

/// [TCINFO](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/45b3a0c5-d6d6-4e02-aebf-13766ff693f0)
#[derive(Clone, Debug)]
pub struct TableContextInfo {
    end_4byte_values: u16,
    end_2byte_values: u16,
    end_1byte_values: u16,
    end_existence_bitmap: u16,
    row_index: HeapId,
    rows: HeapOrNodeId,
    columns: Vec<TableColumnDescriptor>,
}

impl TableContextInfo {
    /// Compute a layout for a fresh table: 8-byte cells first, then 4-,
    /// 2- and 1-byte cells, then the existence bitmap.
    fn layout(columns: &[(u16, PropertyType)]) -> LtpResult<Self> {
        if columns.len() > 0xFF {
            return Err(LtpError::InvalidTableContextColumnCount(columns.len()));
        }

        let mut descriptors: Vec<TableColumnDescriptor> = Vec::with_capacity(columns.len());
        let mut next_bit = 0_u8;
        for (prop_id, prop_type) in columns {
            descriptors.push(TableColumnDescriptor {
                prop_type: *prop_type,
                prop_id: *prop_id,
                offset: 0,
                size: prop_type.cell_size(),
                existence_bit: next_bit,
            });
            next_bit += 1;
        }

        let mut info = Self {
            end_4byte_values: 0,
            end_2byte_values: 0,
            end_1byte_values: 0,
            end_existence_bitmap: 0,
            row_index: HeapId::default(),
            rows: HeapOrNodeId::None,
            columns: descriptors,
        };
        info.assign_offsets();
        Ok(info)
    }

    /// Re-pack the cell offsets after the column set changed; existence
    /// bits are left alone so persisted rows keep meaning.
    fn assign_offsets(&mut self) {
        let mut offset = 0_u16;
        for width in [8_u8, 4, 2, 1] {
            for column in self.columns.iter_mut().filter(|c| c.size == width) {
                column.offset = offset;
                offset += u16::from(width);
            }
            match width {
                4 => self.end_4byte_values = offset,
                2 => self.end_2byte_values = offset,
                1 => self.end_1byte_values = offset,
                _ => {}
            }
        }
        self.end_existence_bitmap =
            self.end_1byte_values + existence_bitmap_size(self.columns.len()) as u16;
    }

    pub fn columns(&self) -> &[TableColumnDescriptor] {
        &self.columns
    }

    pub fn record_size(&self) -> usize {
        usize::from(self.end_existence_bitmap)
    }

    fn bitmap_range(&self) -> (usize, usize) {
        (
            usize::from(self.end_1byte_values),
            usize::from(self.end_existence_bitmap),
        )
    }

    fn column(&self, prop_id: u16) -> LtpResult<&TableColumnDescriptor> {
        self.columns
            .iter()
            .find(|c| c.prop_id == prop_id)
            .ok_or(LtpError::TableColumnNotFound(prop_id))
    }

    pub fn read(f: &mut dyn Read) -> io::Result<Self> {
        // bType
        let signature = HeapNodeType::try_from(f.read_u8()?)?;
        if signature != HeapNodeType::Table {
            return Err(LtpError::UnexpectedHeapNodeType(signature).into());
        }
        // cCols
        let column_count = usize::from(f.read_u8()?);
        // rgib
        let end_4byte_values = f.read_u16::<LittleEndian>()?;
        let end_2byte_values = f.read_u16::<LittleEndian>()?;
        let end_1byte_values = f.read_u16::<LittleEndian>()?;
        let end_existence_bitmap = f.read_u16::<LittleEndian>()?;
        if end_2byte_values < end_4byte_values
            || end_1byte_values < end_2byte_values
            || end_existence_bitmap < end_1byte_values
        {
            return Err(LtpError::InvalidTableContextOffsets.into());
        }
        // hidRowIndex
        let row_index = HeapId::read(f)?;
        // hnidRows
        let rows = HeapOrNodeId::from(f.read_u32::<LittleEndian>()?);
        // hidIndex (deprecated)
        let _ = f.read_u32::<LittleEndian>()?;
        // rgTCOLDESC
        let mut columns = Vec::with_capacity(column_count);
        for _ in 0..column_count {
            columns.push(TableColumnDescriptor::read(f)?);
        }

        Ok(Self {
            end_4byte_values,
            end_2byte_values,
            end_1byte_values,
            end_existence_bitmap,
            row_index,
            rows,
            columns,
        })
    }

    pub fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u8(HeapNodeType::Table as u8)?;
        f.write_u8(self.columns.len() as u8)?;
        f.write_u16::<LittleEndian>(self.end_4byte_values)?;
        f.write_u16::<LittleEndian>(self.end_2byte_values)?;
        f.write_u16::<LittleEndian>(self.end_1byte_values)?;
        f.write_u16::<LittleEndian>(self.end_existence_bitmap)?;
        self.row_index.write(f)?;
        f.write_u32::<LittleEndian>(u32::from(self.rows))?;
        f.write_u32::<LittleEndian>(0)?;
        for column in self.columns.iter() {
            column.write(f)?;
        }
        Ok(())
    }

    fn to_bytes(&self) -> io::Result<Vec<u8>> {
        let mut bytes: Vec<u8> = Vec::with_capacity(22 + self.columns.len() * 8);
        self.write(&mut bytes)?;
        Ok(bytes)
    }
}

/// Row positions in the row-index BTH: 16-bit in the narrow format,
/// 32-bit in the wide one.
#[derive(Copy, Clone, Debug)]
pub(crate) struct RowIndexValue<Pst>(pub u32, PhantomData<Pst>);

impl<Pst: PstFile> RowIndexValue<Pst> {
    fn new(position: u32) -> Self {
        Self(position, PhantomData)
    }
}

impl<Pst: PstFile> HeapTreeValue for RowIndexValue<Pst> {
    const SIZE: u8 = Pst::ROW_INDEX_VALUE_SIZE;

    fn read(f: &mut dyn Read) -> io::Result<Self> {
        let value = if Self::SIZE == 2 {
            u32::from(f.read_u16::<LittleEndian>()?)
        } else {
            f.read_u32::<LittleEndian>()?
        };
        Ok(Self(value, PhantomData))
    }

    fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        if Self::SIZE == 2 {
            f.write_u16::<LittleEndian>(self.0 as u16)
        } else {
            f.write_u32::<LittleEndian>(self.0)
        }
    }
}

/// A proxy for one row: its id and current position.
#[derive(Copy, Clone, Debug)]
pub struct TableRow {
    pub row_id: u32,
    pub position: usize,
}

/// A table context bound to its backing node.
pub struct TableContext<Pst: PstFile> {
    heap: Heap<Pst>,
    info: TableContextInfo,
    row_index: HeapTree<u32, RowIndexValue<Pst>>,
}

impl<Pst: PstFile> TableContext<Pst> {
    fn rows_per_block(&self) -> usize {
        max_external_size::<Pst>() / self.info.record_size()
    }

    fn max_rows(&self) -> usize {
        if Pst::ROW_INDEX_VALUE_SIZE == 2 {
            usize::from(u16::MAX)
        } else {
            u32::MAX as usize
        }
    }

    /// Lay a fresh table over an empty node. The row-id column is always
    /// included; `columns` adds the client's own.
    pub fn create(
        store: &mut dyn BlockStore<Pst>,
        node: Node<Pst>,
        columns: &[(u16, PropertyType)],
    ) -> io::Result<Self> {
        let mut all_columns = vec![(LTP_ROW_ID_PROP_ID, PropertyType::Integer32)];
        for (prop_id, prop_type) in columns {
            if *prop_id == LTP_ROW_ID_PROP_ID {
                continue;
            }
            if all_columns.iter().any(|(id, _)| id == prop_id) {
                return Err(LtpError::DuplicateTableColumn(*prop_id).into());
            }
            all_columns.push((*prop_id, *prop_type));
        }

        let mut heap = Heap::create(store, node, HeapNodeType::Table)?;
        let row_index = HeapTree::create(&mut heap, store)?;

        let mut info = TableContextInfo::layout(&all_columns).map_err(io::Error::from)?;
        info.row_index = row_index.header_id();

        let bytes = info.to_bytes()?;
        let info_id = heap.allocate(store, bytes.len())?;
        heap.write_item(store, info_id, &bytes, 0)?;
        heap.set_user_root(store, info_id)?;

        Ok(Self {
            heap,
            info,
            row_index,
        })
    }

    pub fn open(store: &mut dyn BlockStore<Pst>, node: Node<Pst>) -> io::Result<Self> {
        let heap = Heap::open(store, node, HeapNodeType::Table)?;
        let bytes = heap.read_item(store, heap.user_root())?;
        let info = TableContextInfo::read(&mut bytes.as_slice())?;
        let row_index = HeapTree::open(&heap, store, info.row_index)?;
        Ok(Self {
            heap,
            info,
            row_index,
        })
    }

    pub fn node(&self) -> &Node<Pst> {
        self.heap.node()
    }

    pub fn node_mut(&mut self) -> &mut Node<Pst> {
        self.heap.node_mut()
    }

    pub fn info(&self) -> &TableContextInfo {
        &self.info
    }

    pub fn save(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        self.heap.node_mut().save(store)
    }

    pub fn save_subnode(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        container: &mut Node<Pst>,
    ) -> io::Result<()> {
        self.heap.node_mut().save_subnode(store, container)
    }

    fn store_info(&mut self, store: &mut dyn BlockStore<Pst>) -> io::Result<()> {
        let bytes = self.info.to_bytes()?;
        let old = self.heap.user_root();
        let id = if self.heap.item_size(store, old)? == bytes.len() {
            old
        } else {
            self.heap.reallocate(store, old, bytes.len())?
        };
        self.heap.write_item(store, id, &bytes, 0)?;
        if id != old {
            self.heap.set_user_root(store, id)?;
        }
        Ok(())
    }

    pub fn row_count(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<usize> {
        let record = self.info.record_size();
        match self.info.rows {
            HeapOrNodeId::None => Ok(0),
            HeapOrNodeId::Heap(heap_id) => Ok(self.heap.item_size(store, heap_id)? / record),
            HeapOrNodeId::Node(node_id) => {
                let subnode = self.heap.node().lookup_subnode(store, node_id)?;
                let mut count = 0;
                for index in 0..subnode.page_count(store)? {
                    count += subnode.read_page(store, index)?.len() / record;
                }
                Ok(count)
            }
        }
    }

    /// Snapshot of the rows (id, position) in row-index order.
    pub fn rows(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<Vec<TableRow>> {
        let mut out = Vec::new();
        self.row_index
            .for_each(&self.heap, store, &mut |row_id, position| {
                out.push(TableRow {
                    row_id,
                    position: position.0 as usize,
                });
                Ok(())
            })?;
        Ok(out)
    }

    /// Position of the row with this id.
    pub fn lookup_row(&self, store: &mut dyn BlockStore<Pst>, row_id: u32) -> io::Result<usize> {
        Ok(self
            .row_index
            .lookup(&self.heap, store, row_id)?
            .ok_or(LtpError::TableRowNotFound(row_id))?
            .0 as usize)
    }

    fn read_row(&self, store: &mut dyn BlockStore<Pst>, position: usize) -> io::Result<Vec<u8>> {
        let record = self.info.record_size();
        match self.info.rows {
            HeapOrNodeId::None => Err(LtpError::TableRowOutOfRange(position).into()),
            HeapOrNodeId::Heap(heap_id) => {
                let matrix = self.heap.read_item(store, heap_id)?;
                let start = position * record;
                if start + record > matrix.len() {
                    return Err(LtpError::TableRowOutOfRange(position).into());
                }
                Ok(matrix[start..start + record].to_vec())
            }
            HeapOrNodeId::Node(node_id) => {
                let subnode = self.heap.node().lookup_subnode(store, node_id)?;
                let per_block = self.rows_per_block();
                let page = position / per_block;
                if page >= subnode.page_count(store)? {
                    return Err(LtpError::TableRowOutOfRange(position).into());
                }
                let bytes = subnode.read_page(store, page)?;
                let start = (position % per_block) * record;
                if start + record > bytes.len() {
                    return Err(LtpError::TableRowOutOfRange(position).into());
                }
                Ok(bytes[start..start + record].to_vec())
            }
        }
    }

    fn write_row(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        position: usize,
        row: &[u8],
    ) -> io::Result<()> {
        let record = self.info.record_size();
        match self.info.rows {
            HeapOrNodeId::None => Err(LtpError::TableRowOutOfRange(position).into()),
            HeapOrNodeId::Heap(heap_id) => {
                self.heap.write_item(store, heap_id, row, position * record)
            }
            HeapOrNodeId::Node(node_id) => {
                let per_block = self.rows_per_block();
                let page = position / per_block;
                let mut subnode = self.heap.node().lookup_subnode(store, node_id)?;
                let mut bytes = subnode.read_page(store, page)?;
                let start = (position % per_block) * record;
                if start + record > bytes.len() {
                    return Err(LtpError::TableRowOutOfRange(position).into());
                }
                bytes[start..start + record].copy_from_slice(row);
                subnode.write_page(store, page, bytes)?;
                subnode.save_subnode(store, self.heap.node_mut())?;
                Ok(())
            }
        }
    }

    /// Every row record, in position order.
    fn read_matrix(&self, store: &mut dyn BlockStore<Pst>) -> io::Result<Vec<Vec<u8>>> {
        let record = self.info.record_size();
        let mut rows = Vec::new();
        match self.info.rows {
            HeapOrNodeId::None => {}
            HeapOrNodeId::Heap(heap_id) => {
                let matrix = self.heap.read_item(store, heap_id)?;
                for chunk in matrix.chunks_exact(record) {
                    rows.push(chunk.to_vec());
                }
            }
            HeapOrNodeId::Node(node_id) => {
                let subnode = self.heap.node().lookup_subnode(store, node_id)?;
                for index in 0..subnode.page_count(store)? {
                    let bytes = subnode.read_page(store, index)?;
                    for chunk in bytes.chunks_exact(record) {
                        rows.push(chunk.to_vec());
                    }
                }
            }
        }
        Ok(rows)
    }

    /// Rewrite the whole matrix, choosing inline or subnode storage by
    /// size and packing subnode row pages to the block capacity.
    fn write_matrix(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        rows: &[Vec<u8>],
    ) -> io::Result<()> {
        let record = self.info.record_size();
        let total = rows.len() * record;

        let mut flat = Vec::with_capacity(total);
        for row in rows {
            flat.extend_from_slice(row);
        }

        if total <= HEAP_MAX_ALLOC_SIZE {
            // inline storage
            let heap_id = match self.info.rows {
                HeapOrNodeId::Heap(old) if total > 0 => {
                    let id = self.heap.reallocate(store, old, total)?;
                    self.heap.write_item(store, id, &flat, 0)?;
                    Some(id)
                }
                HeapOrNodeId::Heap(old) => {
                    self.heap.free_item(store, old)?;
                    None
                }
                HeapOrNodeId::Node(old) => {
                    self.heap.node_mut().delete_subnode(store, old)?;
                    if total > 0 {
                        let id = self.heap.allocate(store, total)?;
                        self.heap.write_item(store, id, &flat, 0)?;
                        Some(id)
                    } else {
                        None
                    }
                }
                HeapOrNodeId::None if total > 0 => {
                    let id = self.heap.allocate(store, total)?;
                    self.heap.write_item(store, id, &flat, 0)?;
                    Some(id)
                }
                HeapOrNodeId::None => None,
            };
            self.info.rows = match heap_id {
                Some(id) => HeapOrNodeId::Heap(id),
                None => HeapOrNodeId::None,
            };
        } else {
            // subnode row pages
            let node_id = match self.info.rows {
                HeapOrNodeId::Node(node_id) => node_id,
                HeapOrNodeId::Heap(old) => {
                    self.heap.free_item(store, old)?;
                    let node_id = store.alloc_nid(NodeIdType::ListsTablesProperties)?;
                    self.heap.node_mut().create_subnode(store, node_id)?;
                    node_id
                }
                HeapOrNodeId::None => {
                    let node_id = store.alloc_nid(NodeIdType::ListsTablesProperties)?;
                    self.heap.node_mut().create_subnode(store, node_id)?;
                    node_id
                }
            };

            let mut subnode = self.heap.node().lookup_subnode(store, node_id)?;
            subnode.resize(store, 0)?;
            let page_bytes = self.rows_per_block() * record;
            for page in flat.chunks(page_bytes) {
                subnode.append_page(store, page.to_vec())?;
            }
            subnode.save_subnode(store, self.heap.node_mut())?;
            self.info.rows = HeapOrNodeId::Node(node_id);
        }

        self.store_info(store)
    }

    fn cell_present(&self, row: &[u8], column: &TableColumnDescriptor) -> bool {
        let (start, _) = self.info.bitmap_range();
        let bit = usize::from(column.existence_bit);
        row[start + bit / 8] & (0x80 >> (bit % 8)) != 0
    }

    fn set_cell_present(&self, row: &mut [u8], column: &TableColumnDescriptor, present: bool) {
        let (start, _) = self.info.bitmap_range();
        let bit = usize::from(column.existence_bit);
        let mask = 0x80 >> (bit % 8);
        if present {
            row[start + bit / 8] |= mask;
        } else {
            row[start + bit / 8] &= !mask;
        }
    }

    fn cell_raw(row: &[u8], column: &TableColumnDescriptor) -> u64 {
        let start = usize::from(column.offset);
        let mut value = 0_u64;
        for (shift, byte) in row[start..start + usize::from(column.size)].iter().enumerate() {
            value |= u64::from(*byte) << (8 * shift);
        }
        value
    }

    fn set_cell_raw(row: &mut [u8], column: &TableColumnDescriptor, value: u64) {
        let start = usize::from(column.offset);
        for (shift, byte) in row[start..start + usize::from(column.size)]
            .iter_mut()
            .enumerate()
        {
            *byte = (value >> (8 * shift)) as u8;
        }
    }

    /// The raw cell value; fails with a "not present" error when the
    /// existence bit is clear.
    pub fn get_cell(
        &self,
        store: &mut dyn BlockStore<Pst>,
        position: usize,
        prop_id: u16,
    ) -> io::Result<u64> {
        let row = self.read_row(store, position)?;
        let column = self.info.column(prop_id).map_err(io::Error::from)?;
        if !self.cell_present(&row, column) {
            return Err(LtpError::TableCellNotPresent.into());
        }
        Ok(Self::cell_raw(&row, column))
    }

    pub fn cell_exists(
        &self,
        store: &mut dyn BlockStore<Pst>,
        position: usize,
        prop_id: u16,
    ) -> io::Result<bool> {
        let row = self.read_row(store, position)?;
        let column = self.info.column(prop_id).map_err(io::Error::from)?;
        Ok(self.cell_present(&row, column))
    }

    /// Decode a cell into a property value, dereferencing variable-length
    /// cells through the heap or subnode they point at.
    pub fn read_cell(
        &self,
        store: &mut dyn BlockStore<Pst>,
        position: usize,
        prop_id: u16,
    ) -> io::Result<PropertyValue> {
        let row = self.read_row(store, position)?;
        let column = self.info.column(prop_id).map_err(io::Error::from)?;
        if !self.cell_present(&row, column) {
            return Err(LtpError::TableCellNotPresent.into());
        }
        let raw = Self::cell_raw(&row, column);

        Ok(match column.prop_type {
            PropertyType::Null => PropertyValue::Null,
            PropertyType::Boolean => PropertyValue::Boolean(raw & 0xFF != 0),
            PropertyType::Integer16 => PropertyValue::Integer16(raw as u16 as i16),
            PropertyType::Integer32 => PropertyValue::Integer32(raw as u32 as i32),
            PropertyType::Floating32 => PropertyValue::Floating32(f32::from_bits(raw as u32)),
            PropertyType::ErrorCode => PropertyValue::ErrorCode(raw as u32 as i32),
            PropertyType::Floating64 => PropertyValue::Floating64(f64::from_bits(raw)),
            PropertyType::FloatingTime => PropertyValue::FloatingTime(f64::from_bits(raw)),
            PropertyType::Currency => PropertyValue::Currency(raw as i64),
            PropertyType::Integer64 => PropertyValue::Integer64(raw as i64),
            PropertyType::Time => PropertyValue::Time(raw as i64),
            other => {
                let bytes = self.fetch_variable(store, raw as u32)?;
                PropertyValue::from_bytes(other, &bytes)?
            }
        })
    }

    fn fetch_variable(&self, store: &mut dyn BlockStore<Pst>, hnid: u32) -> io::Result<Vec<u8>> {
        match HeapOrNodeId::from(hnid) {
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

    /// Store a typed value into a cell, with the same inline / heap /
    /// subnode promotion as the property context.
    pub fn set_cell(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        position: usize,
        prop_id: u16,
        value: PropertyValue,
    ) -> io::Result<()> {
        let column = *self.info.column(prop_id).map_err(io::Error::from)?;
        let mut row = self.read_row(store, position)?;

        let raw = match column.prop_type {
            PropertyType::Null => 0,
            PropertyType::Boolean => match &value {
                PropertyValue::Boolean(b) => u64::from(*b),
                _ => return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into()),
            },
            PropertyType::Integer16 => match &value {
                PropertyValue::Integer16(v) => u64::from(*v as u16),
                _ => return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into()),
            },
            PropertyType::Integer32 => match &value {
                PropertyValue::Integer32(v) => u64::from(*v as u32),
                _ => return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into()),
            },
            PropertyType::Floating32 => match &value {
                PropertyValue::Floating32(v) => u64::from(v.to_bits()),
                _ => return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into()),
            },
            PropertyType::ErrorCode => match &value {
                PropertyValue::ErrorCode(v) => u64::from(*v as u32),
                _ => return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into()),
            },
            PropertyType::Floating64 | PropertyType::FloatingTime => match &value {
                PropertyValue::Floating64(v) | PropertyValue::FloatingTime(v) => v.to_bits(),
                _ => return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into()),
            },
            PropertyType::Currency | PropertyType::Integer64 | PropertyType::Time => {
                match &value {
                    PropertyValue::Currency(v)
                    | PropertyValue::Integer64(v)
                    | PropertyValue::Time(v) => *v as u64,
                    _ => {
                        return Err(
                            LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into()
                        )
                    }
                }
            }
            _ => {
                // variable-length: place the bytes, store the hnid
                if value.prop_type() != column.prop_type {
                    return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into());
                }
                let bytes = value.to_bytes()?;
                let old = if self.cell_present(&row, &column) {
                    HeapOrNodeId::from(Self::cell_raw(&row, &column) as u32)
                } else {
                    HeapOrNodeId::None
                };
                u64::from(self.place_variable(store, old, &bytes)?)
            }
        };

        Self::set_cell_raw(&mut row, &column, raw);
        self.set_cell_present(&mut row, &column, true);
        self.write_row(store, position, &row)
    }

    fn place_variable(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        old: HeapOrNodeId,
        bytes: &[u8],
    ) -> io::Result<u32> {
        if bytes.is_empty() {
            // a zero-length value stores the reserved "absent" hnid
            match old {
                HeapOrNodeId::Heap(heap_id) => self.heap.free_item(store, heap_id)?,
                HeapOrNodeId::Node(node_id) => {
                    self.heap.node_mut().delete_subnode(store, node_id)?
                }
                HeapOrNodeId::None => {}
            }
            return Ok(0);
        }
        if bytes.len() <= HEAP_MAX_ALLOC_SIZE {
            let heap_id = match old {
                HeapOrNodeId::Heap(old_id) => {
                    let id = self.heap.reallocate(store, old_id, bytes.len())?;
                    self.heap.write_item(store, id, bytes, 0)?;
                    id
                }
                other => {
                    if let HeapOrNodeId::Node(node_id) = other {
                        self.heap.node_mut().delete_subnode(store, node_id)?;
                    }
                    let id = self.heap.allocate(store, bytes.len())?;
                    self.heap.write_item(store, id, bytes, 0)?;
                    id
                }
            };
            Ok(u32::from(heap_id))
        } else {
            let node_id = match old {
                HeapOrNodeId::Node(node_id) => node_id,
                other => {
                    if let HeapOrNodeId::Heap(heap_id) = other {
                        self.heap.free_item(store, heap_id)?;
                    }
                    let node_id = store.alloc_nid(NodeIdType::ListsTablesProperties)?;
                    self.heap.node_mut().create_subnode(store, node_id)?;
                    node_id
                }
            };
            let mut subnode = self.heap.node().lookup_subnode(store, node_id)?;
            subnode.resize(store, bytes.len() as u64)?;
            subnode.write(store, bytes, 0)?;
            subnode.save_subnode(store, self.heap.node_mut())?;
            Ok(u32::from(node_id))
        }
    }

    /// Store raw bytes into a variable-length cell, bypassing the typed
    /// encoding.
    pub fn write_cell(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        position: usize,
        prop_id: u16,
        bytes: &[u8],
    ) -> io::Result<()> {
        let column = *self.info.column(prop_id).map_err(io::Error::from)?;
        if column.prop_type.is_inline() || column.size != 4 {
            return Err(LtpError::PropertyTypeMismatch(prop_id, column.prop_type).into());
        }

        let mut row = self.read_row(store, position)?;
        let old = if self.cell_present(&row, &column) {
            HeapOrNodeId::from(Self::cell_raw(&row, &column) as u32)
        } else {
            HeapOrNodeId::None
        };
        let hnid = self.place_variable(store, old, bytes)?;
        Self::set_cell_raw(&mut row, &column, u64::from(hnid));
        self.set_cell_present(&mut row, &column, true);
        self.write_row(store, position, &row)
    }

    /// Clear the existence bit; the cell's storage is not reclaimed.
    pub fn delete_cell(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        position: usize,
        prop_id: u16,
    ) -> io::Result<()> {
        let column = *self.info.column(prop_id).map_err(io::Error::from)?;
        let mut row = self.read_row(store, position)?;
        self.set_cell_present(&mut row, &column, false);
        self.write_row(store, position, &row)
    }

    /// Append a zero-filled row; fails on a duplicate row id.
    pub fn add_row(&mut self, store: &mut dyn BlockStore<Pst>, row_id: u32) -> io::Result<usize> {
        if self.row_index.lookup(&self.heap, store, row_id)?.is_some() {
            return Err(LtpError::DuplicateTableRow(row_id).into());
        }

        let mut rows = self.read_matrix(store)?;
        let position = rows.len();
        if position >= self.max_rows() {
            return Err(LtpError::TableFull.into());
        }

        let mut row = vec![0_u8; self.info.record_size()];
        let row_id_column = *self
            .info
            .column(LTP_ROW_ID_PROP_ID)
            .map_err(io::Error::from)?;
        Self::set_cell_raw(&mut row, &row_id_column, u64::from(row_id));
        self.set_cell_present(&mut row, &row_id_column, true);
        rows.push(row);

        self.write_matrix(store, &rows)?;
        self.row_index.insert(
            &mut self.heap,
            store,
            row_id,
            RowIndexValue::new(position as u32),
        )?;
        Ok(position)
    }

    /// Remove a row; the rows after it move down one position and the row
    /// index is refreshed to match.
    pub fn delete_row(&mut self, store: &mut dyn BlockStore<Pst>, position: usize) -> io::Result<()> {
        let mut rows = self.read_matrix(store)?;
        if position >= rows.len() {
            return Err(LtpError::TableRowOutOfRange(position).into());
        }

        let row_id_column = *self
            .info
            .column(LTP_ROW_ID_PROP_ID)
            .map_err(io::Error::from)?;
        let row_id = Self::cell_raw(&rows[position], &row_id_column) as u32;

        rows.remove(position);
        self.write_matrix(store, &rows)?;
        self.row_index.remove(&mut self.heap, store, row_id)?;

        // shift the index positions of every row past the gap
        let moved: Vec<TableRow> = self
            .rows(store)?
            .into_iter()
            .filter(|row| row.position > position)
            .collect();
        for row in moved {
            self.row_index.insert(
                &mut self.heap,
                store,
                row.row_id,
                RowIndexValue::new(row.position as u32 - 1),
            )?;
        }
        Ok(())
    }

    /// Append a column, widening every stored row record.
    pub fn add_column(
        &mut self,
        store: &mut dyn BlockStore<Pst>,
        prop_id: u16,
        prop_type: PropertyType,
    ) -> io::Result<()> {
        if self.info.column(prop_id).is_ok() {
            return Err(LtpError::DuplicateTableColumn(prop_id).into());
        }
        if self.info.columns.len() >= 0xFF {
            return Err(LtpError::InvalidTableContextColumnCount(self.info.columns.len()).into());
        }

        let old_info = self.info.clone();
        let rows = self.read_matrix(store)?;

        let next_bit = self
            .info
            .columns
            .iter()
            .map(|c| c.existence_bit + 1)
            .max()
            .unwrap_or(0);
        self.info.columns.push(TableColumnDescriptor {
            prop_type,
            prop_id,
            offset: 0,
            size: prop_type.cell_size(),
            existence_bit: next_bit,
        });
        self.info.assign_offsets();

        // re-lay every row into the widened record
        let mut widened = Vec::with_capacity(rows.len());
        for row in rows.iter() {
            let mut new_row = vec![0_u8; self.info.record_size()];
            for column in old_info.columns().iter() {
                let new_column = self.info.column(column.prop_id()).map_err(io::Error::from)?;
                Self::set_cell_raw(&mut new_row, new_column, Self::cell_raw(row, column));
            }
            let (old_start, old_end) = old_info.bitmap_range();
            let (new_start, _) = self.info.bitmap_range();
            let old_bitmap_len = old_end - old_start;
            new_row[new_start..new_start + old_bitmap_len]
                .copy_from_slice(&row[old_start..old_end]);
            widened.push(new_row);
        }

        self.write_matrix(store, &widened)?;
        self.store_info(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_orders_by_width() {
        let info = TableContextInfo::layout(&[
            (LTP_ROW_ID_PROP_ID, PropertyType::Integer32),
            (0x3001, PropertyType::Unicode),
            (0x3602, PropertyType::Integer32),
            (0x0E08, PropertyType::Integer64),
            (0x0057, PropertyType::Boolean),
        ])
        .unwrap();

        // the 8-byte cell comes first, then the three 4-byte cells, then
        // the boolean, then a single bitmap byte
        assert_eq!(info.end_4byte_values, 8 + 12);
        assert_eq!(info.end_2byte_values, 20);
        assert_eq!(info.end_1byte_values, 21);
        assert_eq!(info.end_existence_bitmap, 22);

        let row_id = info.column(LTP_ROW_ID_PROP_ID).unwrap();
        assert_eq!(row_id.offset(), 8);
        assert_eq!(row_id.existence_bit(), 0);
        let int64 = info.column(0x0E08).unwrap();
        assert_eq!(int64.offset(), 0);
    }

    #[test]
    fn test_info_round_trip() {
        let mut info = TableContextInfo::layout(&[
            (LTP_ROW_ID_PROP_ID, PropertyType::Integer32),
            (0x3001, PropertyType::Unicode),
        ])
        .unwrap();
        info.row_index = HeapId::new(2, 0).unwrap();
        info.rows = HeapOrNodeId::Heap(HeapId::new(3, 0).unwrap());

        let bytes = info.to_bytes().unwrap();
        let read_back = TableContextInfo::read(&mut bytes.as_slice()).unwrap();
        assert_eq!(read_back.columns().len(), 2);
        assert_eq!(read_back.record_size(), info.record_size());
        assert_eq!(read_back.row_index, info.row_index);
        assert_eq!(read_back.rows, info.rows);
    }

    #[test]
    fn test_cell_raw_round_trip() {
        let column = TableColumnDescriptor {
            prop_type: PropertyType::Integer64,
            prop_id: 0x0E08,
            offset: 0,
            size: 8,
            existence_bit: 1,
        };
        let mut row = vec![0_u8; 16];
        TableContext::<crate::Unicode>::set_cell_raw(&mut row, &column, 0x1122_3344_5566_7788);
        assert_eq!(
            TableContext::<crate::Unicode>::cell_raw(&row, &column),
            0x1122_3344_5566_7788
        );
        assert_eq!(row[0], 0x88);
    }

    #[test]
    fn test_existence_bitmap_size() {
        assert_eq!(existence_bitmap_size(1), 1);
        assert_eq!(existence_bitmap_size(8), 1);
        assert_eq!(existence_bitmap_size(9), 2);
    }
}
