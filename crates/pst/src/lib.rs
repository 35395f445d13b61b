//! Read/write core engine for Microsoft Outlook Personal Storage Table
//! ([PST](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/141923d5-15ab-4ef1-a524-6dce75aae546))
//! files.
//!
//! The engine is layered the way the format is: the [`ndb`] module holds
//! the paged store (header, copy-on-write NBT/BBT, allocation map, blocks
//! and nodes), [`ltp`] holds the interpretive overlays (heap-on-node,
//! BTree-on-heap, property and table contexts), and [`messaging`] exposes
//! thin folder/message/attachment façades over them. Both on-disk format
//! variants are supported through the [`PstFile`] parameter; all width
//! selection happens at compile time.

use std::{
    fmt::Debug,
    io::{self, Read, Seek, Write},
};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use thiserror::Error;

pub mod ltp;
pub mod messaging;
pub mod ndb;

mod block_sig;
mod crc;
mod encode;

use ndb::database::DbContext;
use ndb::header::NdbVersion;
use ndb::NdbError;

#[derive(Error, Debug)]
pub enum PstError {
    #[error("I/O error: {0:?}")]
    Io(#[from] io::Error),
    #[error("Node Database error: {0}")]
    NodeDatabaseError(#[from] ndb::NdbError),
    #[error("Lists, Tables and Properties error: {0}")]
    ListsTablesPropertiesError(#[from] ltp::LtpError),
    #[error("Messaging error: {0}")]
    MessagingError(#[from] messaging::MessagingError),
}

pub type PstResult<T> = Result<T, PstError>;

/// The L0 contract: a positioned byte store. Real files and in-memory
/// buffers both qualify; the engine adds no buffering of its own.
pub trait PstIo: Read + Write + Seek + Send {}

impl<T> PstIo for T where T: Read + Write + Seek + Send {}

pub(crate) type FileIo = Box<dyn PstIo>;

/// One on-disk format variant. Everything that depends on the narrow/wide
/// split (id and offset widths, page entry areas, row-index value sizes)
/// hangs off this trait so the engine compiles once per variant and never
/// branches on the format at run time.
pub trait PstFile: Copy + Clone + Default + Debug + Send + Sync + 'static {
    const VERSION: NdbVersion;

    /// Width in bytes of block ids, page ids and byte indexes.
    const INDEX_SIZE: usize;

    /// Bytes available for entries in a BTPAGE.
    const BTREE_ENTRIES_SIZE: usize;

    /// Width of the row positions stored in a table context's row index.
    const ROW_INDEX_VALUE_SIZE: u8;

    fn read_index(f: &mut dyn Read) -> io::Result<u64>;
    fn write_index(f: &mut dyn Write, value: u64) -> io::Result<()>;
}

/// The wide (Unicode) format: 64-bit ids and offsets.
#[derive(Copy, Clone, Default, Debug)]
pub struct Unicode;

impl PstFile for Unicode {
    const VERSION: NdbVersion = NdbVersion::Unicode;
    const INDEX_SIZE: usize = 8;
    const BTREE_ENTRIES_SIZE: usize = 488;
    const ROW_INDEX_VALUE_SIZE: u8 = 4;

    fn read_index(f: &mut dyn Read) -> io::Result<u64> {
        f.read_u64::<LittleEndian>()
    }

    fn write_index(f: &mut dyn Write, value: u64) -> io::Result<()> {
        f.write_u64::<LittleEndian>(value)
    }
}

/// The narrow (ANSI) format: 32-bit ids and offsets.
#[derive(Copy, Clone, Default, Debug)]
pub struct Ansi;

impl PstFile for Ansi {
    const VERSION: NdbVersion = NdbVersion::Ansi;
    const INDEX_SIZE: usize = 4;
    const BTREE_ENTRIES_SIZE: usize = 496;
    const ROW_INDEX_VALUE_SIZE: u8 = 2;

    fn read_index(f: &mut dyn Read) -> io::Result<u64> {
        Ok(u64::from(f.read_u32::<LittleEndian>()?))
    }

    fn write_index(f: &mut dyn Write, value: u64) -> io::Result<()> {
        let value = u32::try_from(value).map_err(|_| NdbError::AnsiIndexOutOfRange(value))?;
        f.write_u32::<LittleEndian>(value)
    }
}

/// An open wide-format PST.
pub type UnicodePstFile = DbContext<Unicode>;

/// An open narrow-format PST.
pub type AnsiPstFile = DbContext<Ansi>;

/// Open a message store, trying the wide format first.
pub fn open_store(
    path: impl AsRef<std::path::Path>,
) -> io::Result<messaging::store::AnyStore> {
    match UnicodePstFile::open(path.as_ref()) {
        Ok(db) => Ok(messaging::store::AnyStore::Unicode(
            messaging::store::Store::read(db)?,
        )),
        Err(_) => {
            let db = AnsiPstFile::open(path.as_ref())?;
            Ok(messaging::store::AnyStore::Ansi(
                messaging::store::Store::read(db)?,
            ))
        }
    }
}

pub use ndb::database::{BTreeUpdate, UpdateAction};

#[cfg(test)]
mod tests;

/// Smallest round-trip smoke checks live next to the modules; the
/// end-to-end scenarios are in [`tests`].
#[cfg(test)]
mod variant_tests {
    use super::*;

    #[test]
    fn test_index_widths() {
        let mut buffer: Vec<u8> = Vec::new();
        Unicode::write_index(&mut buffer, 0x1_0000_0000).unwrap();
        assert_eq!(buffer.len(), 8);

        let mut buffer: Vec<u8> = Vec::new();
        Ansi::write_index(&mut buffer, 0x1234).unwrap();
        assert_eq!(buffer.len(), 4);

        assert!(Ansi::write_index(&mut Vec::<u8>::new(), 0x1_0000_0000).is_err());
    }

    #[test]
    fn test_btree_entry_areas() {
        assert_eq!(Unicode::BTREE_ENTRIES_SIZE, 488);
        assert_eq!(Ansi::BTREE_ENTRIES_SIZE, 496);
    }
}
