//! [ROOT](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/32ce8c94-4757-46c8-a169-3fd21abee584)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use super::{block_ref::*, byte_index::*, *};
use crate::PstFile;

/// `fAMapValid`
///
/// ### See also
/// [Root]
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum AmapStatus {
    /// `INVALID_AMAP`: One or more AMaps in the PST are INVALID
    #[default]
    Invalid = 0x00,
    /// `VALID_AMAP1`: Deprecated. Implementations SHOULD NOT use this value. The AMaps are VALID.
    Valid1 = 0x01,
    /// `VALID_AMAP2`: The AMaps are VALID.
    Valid2 = 0x02,
}

impl TryFrom<u8> for AmapStatus {
    type Error = NdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(AmapStatus::Invalid),
            0x01 => Ok(AmapStatus::Valid1),
            0x02 => Ok(AmapStatus::Valid2),
            _ => Err(NdbError::InvalidAmapStatus(value)),
        }
    }
}

impl From<AmapStatus> for bool {
    fn from(status: AmapStatus) -> bool {
        status != AmapStatus::Invalid
    }
}

/// The root record inside the header: end-of-file offset, allocation-map
/// cursor and free counts, the NBT and BBT root page references, and the
/// AMap validity flag.
#[derive(Clone, Debug)]
pub struct Root {
    file_eof_index: ByteIndex,
    amap_last_index: ByteIndex,
    amap_free_size: u64,
    pmap_free_size: u64,
    node_btree: PageRef,
    block_btree: PageRef,
    amap_is_valid: AmapStatus,

    reserved1: u32,
    reserved2: u8,
    reserved3: u16,
}

impl Root {
    pub fn new(
        file_eof_index: ByteIndex,
        amap_last_index: ByteIndex,
        amap_free_size: u64,
        node_btree: PageRef,
        block_btree: PageRef,
        amap_is_valid: AmapStatus,
    ) -> Self {
        Self {
            file_eof_index,
            amap_last_index,
            amap_free_size,
            pmap_free_size: 0,
            node_btree,
            block_btree,
            amap_is_valid,
            reserved1: 0,
            reserved2: 0,
            reserved3: 0,
        }
    }

    pub fn file_eof_index(&self) -> ByteIndex {
        self.file_eof_index
    }

    pub fn amap_last_index(&self) -> ByteIndex {
        self.amap_last_index
    }

    pub fn amap_free_size(&self) -> u64 {
        self.amap_free_size
    }

    pub fn node_btree(&self) -> PageRef {
        self.node_btree
    }

    pub fn block_btree(&self) -> PageRef {
        self.block_btree
    }

    pub fn amap_is_valid(&self) -> AmapStatus {
        self.amap_is_valid
    }

    pub fn set_amap_status(&mut self, status: AmapStatus) {
        self.amap_is_valid = status;
    }

    pub fn set_node_btree(&mut self, node_btree: PageRef) {
        self.node_btree = node_btree;
    }

    pub fn set_block_btree(&mut self, block_btree: PageRef) {
        self.block_btree = block_btree;
    }

    pub fn set_file_eof_index(&mut self, index: ByteIndex) {
        self.file_eof_index = index;
    }

    pub fn set_amap_last_index(&mut self, index: ByteIndex) {
        self.amap_last_index = index;
    }

    /// Replace the free counters wholesale after an AMap rebuild; the PMap
    /// free count is always reset to 0, it is legacy-only.
    pub fn reset_free_size(&mut self, free_bytes: u64) {
        self.amap_free_size = free_bytes;
        self.pmap_free_size = 0;
    }

    pub fn adjust_free_size(&mut self, delta: i64) {
        self.amap_free_size = self.amap_free_size.wrapping_add_signed(delta);
    }

    pub fn read<Pst: PstFile>(f: &mut dyn Read) -> io::Result<Self> {
        // dwReserved
        let reserved1 = f.read_u32::<LittleEndian>()?;
        // ibFileEof
        let file_eof_index = ByteIndex::read::<Pst>(f)?;
        // ibAMapLast
        let amap_last_index = ByteIndex::read::<Pst>(f)?;
        // cbAMapFree
        let amap_free_size = Pst::read_index(f)?;
        // cbPMapFree
        let pmap_free_size = Pst::read_index(f)?;
        // BREFNBT
        let node_btree = PageRef::read::<Pst>(f)?;
        // BREFBBT
        let block_btree = PageRef::read::<Pst>(f)?;
        // fAMapValid
        let amap_is_valid = AmapStatus::try_from(f.read_u8()?).unwrap_or(AmapStatus::Invalid);
        // bReserved
        let reserved2 = f.read_u8()?;
        // wReserved
        let reserved3 = f.read_u16::<LittleEndian>()?;

        Ok(Self {
            file_eof_index,
            amap_last_index,
            amap_free_size,
            pmap_free_size,
            node_btree,
            block_btree,
            amap_is_valid,
            reserved1,
            reserved2,
            reserved3,
        })
    }

    pub fn write<Pst: PstFile>(&self, f: &mut dyn Write) -> io::Result<()> {
        // dwReserved
        f.write_u32::<LittleEndian>(self.reserved1)?;
        // ibFileEof
        self.file_eof_index.write::<Pst>(f)?;
        // ibAMapLast
        self.amap_last_index.write::<Pst>(f)?;
        // cbAMapFree
        Pst::write_index(f, self.amap_free_size)?;
        // cbPMapFree
        Pst::write_index(f, self.pmap_free_size)?;
        // BREFNBT
        self.node_btree.write::<Pst>(f)?;
        // BREFBBT
        self.block_btree.write::<Pst>(f)?;
        // fAMapValid
        f.write_u8(self.amap_is_valid as u8)?;
        // bReserved
        f.write_u8(self.reserved2)?;
        // wReserved
        f.write_u16::<LittleEndian>(self.reserved3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ansi, Unicode};

    fn sample() -> Root {
        Root::new(
            ByteIndex::new(0x42400),
            ByteIndex::new(0x4400),
            0x1234,
            PageRef::new(0x10.into(), ByteIndex::new(0x4800)),
            PageRef::new(0x11.into(), ByteIndex::new(0x4A00)),
            AmapStatus::Valid2,
        )
    }

    #[test]
    fn test_unicode_round_trip() {
        let root = sample();
        let mut buffer: Vec<u8> = Vec::new();
        root.write::<Unicode>(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 72);

        let read_back = Root::read::<Unicode>(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.file_eof_index(), root.file_eof_index());
        assert_eq!(read_back.amap_free_size(), root.amap_free_size());
        assert_eq!(read_back.amap_is_valid(), AmapStatus::Valid2);
    }

    #[test]
    fn test_ansi_round_trip() {
        let root = sample();
        let mut buffer: Vec<u8> = Vec::new();
        root.write::<Ansi>(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 40);

        let read_back = Root::read::<Ansi>(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.amap_last_index(), root.amap_last_index());
        assert_eq!(
            u64::from(read_back.node_btree().page()),
            u64::from(root.node_btree().page())
        );
    }
}
