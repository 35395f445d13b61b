//! ## [Lists, Tables, and Properties (LTP) Layer](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/4c24c7d2-5c5a-4b99-88b2-f4b84cc293ae)

use std::io;
use thiserror::Error;

pub mod heap;
pub mod prop_context;
pub mod prop_type;
pub mod table_context;
pub mod tree;

#[derive(Error, Debug)]
pub enum LtpError {
    #[error("Node Database error: {0}")]
    NodeDatabaseError(#[from] crate::ndb::NdbError),
    #[error("Invalid HID hidIndex: 0x{0:04X}")]
    InvalidHeapIndex(u16),
    #[error("Invalid HID hidType: {0:?}")]
    InvalidNodeType(crate::ndb::node_id::NodeIdType),
    #[error("Invalid HNHDR bSig: 0x{0:02X}")]
    InvalidHeapNodeSignature(u8),
    #[error("Invalid HNHDR bClientSig: 0x{0:02X}")]
    InvalidHeapNodeTypeSignature(u8),
    #[error("Unexpected HNHDR bClientSig: {0:?}")]
    UnexpectedHeapNodeType(heap::HeapNodeType),
    #[error("Heap allocation too large: 0x{0:X}")]
    HeapAllocTooLarge(usize),
    #[error("Heap page is full: {0}")]
    HeapPageOutOfSpace(u16),
    #[error("Heap block index not found: 0x{0:04X}")]
    HeapBlockIndexNotFound(u16),
    #[error("Heap allocation index not found: 0x{0:04X}")]
    HeapAllocIndexNotFound(u16),
    #[error("Heap allocation was freed: 0x{0:04X}")]
    HeapAllocFreed(u16),
    #[error("Invalid HNPAGEMAP rgibAlloc entry: 0x{0:04X}")]
    InvalidHeapPageAllocOffset(u16),
    #[error("Read/write past the end of a heap allocation: offset 0x{0:X}")]
    HeapItemOutOfRange(usize),
    #[error("Invalid BTHHEADER bType: {0:?}")]
    InvalidHeapTreeNodeType(heap::HeapNodeType),
    #[error("Invalid BTHHEADER cbKey: 0x{0:02X}")]
    InvalidHeapTreeKeySize(u8),
    #[error("Invalid BTHHEADER cbEnt: 0x{0:02X}")]
    InvalidHeapTreeDataSize(u8),
    #[error("BTH key not found: 0x{0:X}")]
    HeapTreeKeyNotFound(u64),
    #[error("Invalid PC BTH Record wPropType: 0x{0:04X}")]
    InvalidPropertyType(u16),
    #[error("Property 0x{0:04X} not found")]
    PropertyNotFound(u16),
    #[error("Property 0x{0:04X} has type {1:?}, not the requested one")]
    PropertyTypeMismatch(u16, prop_type::PropertyType),
    #[error("Invalid variable length PC value property type: {0:?}")]
    InvalidVariableLengthPropertyType(prop_type::PropertyType),
    #[error("Invalid multi-value property offset: 0x{0:X}")]
    InvalidMultiValuePropertyOffset(usize),
    #[error("Invalid multi-value property count: 0x{0:X}")]
    InvalidMultiValuePropertyCount(usize),
    #[error("Invalid TCINFO rgib offsets")]
    InvalidTableContextOffsets,
    #[error("Invalid TCOLDESC count: {0}")]
    InvalidTableContextColumnCount(usize),
    #[error("Table column 0x{0:04X} not found")]
    TableColumnNotFound(u16),
    #[error("Duplicate table column 0x{0:04X}")]
    DuplicateTableColumn(u16),
    #[error("Table cell is not present")]
    TableCellNotPresent,
    #[error("Table row 0x{0:08X} not found")]
    TableRowNotFound(u32),
    #[error("Duplicate table row 0x{0:08X}")]
    DuplicateTableRow(u32),
    #[error("Table row position out of range: {0}")]
    TableRowOutOfRange(usize),
    #[error("Table is full")]
    TableFull,
    #[error("Not implemented: {0}")]
    NotImplemented(&'static str),
}

impl From<LtpError> for io::Error {
    fn from(err: LtpError) -> io::Error {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

pub type LtpResult<T> = Result<T, LtpError>;
