//! [HEADER](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/c9876f5a-664b-46a3-9887-ba63f113abf5)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::{
    io::{self, Cursor, Read, Seek, SeekFrom, Write},
    marker::PhantomData,
};

use super::{block_id::*, node_id::*, root::*, *};
use crate::{crc::compute_crc, PstFile};

/// `dwMagic`
///
/// ### See also
/// [Header]
const HEADER_MAGIC: u32 = u32::from_be_bytes(*b"NDB!");

const HEADER_MAGIC_CLIENT: u16 = u16::from_be_bytes(*b"MS");

/// `wVer`
///
/// ### See also
/// [Header]
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum NdbVersion {
    Ansi = 15,
    #[default]
    Unicode = 23,
}

impl TryFrom<u16> for NdbVersion {
    type Error = NdbError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            14..=15 => Ok(NdbVersion::Ansi),
            23 => Ok(NdbVersion::Unicode),
            _ => Err(NdbError::InvalidNdbVersion(value)),
        }
    }
}

const NDB_CLIENT_VERSION: u16 = 19;
const NDB_PLATFORM_CREATE: u8 = 0x01;
const NDB_PLATFORM_ACCESS: u8 = 0x01;
const NDB_SENTINEL: u8 = 0x80;

/// Initial `rgnid[]` counters for a fresh store; raw node-id values whose
/// low 5 bits carry the type the slot allocates for.
const NDB_DEFAULT_NIDS: [u32; 32] = {
    let mut nids = [0_u32; 32];
    let mut slot = 0;
    while slot < 32 {
        nids[slot] = (0x400 << 5) | slot as u32;
        slot += 1;
    }
    nids[3] = (0x4000 << 5) | 0x03;
    nids[4] = (0x10000 << 5) | 0x04;
    nids[8] = (0x8000 << 5) | 0x08;
    nids
};

/// `bCryptMethod`
///
/// ### See also
/// [Header]
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum NdbCryptMethod {
    /// `NDB_CRYPT_NONE`: Data blocks are not encoded
    #[default]
    None = 0x00,
    /// `NDB_CRYPT_PERMUTE`: Encoded with the [Permutation algorithm](crate::encode::permute)
    Permute = 0x01,
    /// `NDB_CRYPT_CYCLIC`: Encoded with the [Cyclic algorithm](crate::encode::cyclic)
    Cyclic = 0x02,
}

impl TryFrom<u8> for NdbCryptMethod {
    type Error = NdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(NdbCryptMethod::None),
            0x01 => Ok(NdbCryptMethod::Permute),
            0x02 => Ok(NdbCryptMethod::Cyclic),
            _ => Err(NdbError::InvalidNdbCryptMethod(value)),
        }
    }
}

/// The file header. One in-memory copy lives in the database context; it is
/// rewritten as the last step of every commit.
#[derive(Clone, Debug)]
pub struct Header<Pst> {
    next_page: PageId,
    next_block: BlockId,
    unique: u32,
    nids: [u32; 32],
    root: Root,
    free_map: [u8; 128],
    free_page_map: [u8; 128],
    crypt_method: NdbCryptMethod,

    reserved1: u32,
    reserved2: u32,
    unused1: u64,
    unused2: u64,
    reserved3: [u8; 36],
    _variant: PhantomData<Pst>,
}

impl<Pst: PstFile> Header<Pst> {
    /// Header for a brand-new store. The id counters start past the
    /// reserved ranges so freshly allocated ids never collide with the
    /// well-known nids.
    pub fn new(root: Root, crypt_method: NdbCryptMethod) -> Self {
        Self {
            next_page: PageId::new(4),
            next_block: BlockId::from(4_u64),
            unique: 0,
            nids: NDB_DEFAULT_NIDS,
            root,
            free_map: [0xFF; 128],
            free_page_map: [0xFF; 128],
            crypt_method,
            reserved1: 0,
            reserved2: 0,
            unused1: 0,
            unused2: 0,
            reserved3: [0; 36],
            _variant: PhantomData,
        }
    }

    pub fn version(&self) -> NdbVersion {
        Pst::VERSION
    }

    pub fn crypt_method(&self) -> NdbCryptMethod {
        self.crypt_method
    }

    pub fn root(&self) -> &Root {
        &self.root
    }

    pub fn root_mut(&mut self) -> &mut Root {
        &mut self.root
    }

    pub fn next_block(&self) -> BlockId {
        self.next_block
    }

    pub fn next_page(&self) -> PageId {
        self.next_page
    }

    /// `dwUnique` is bumped once per write transaction.
    pub fn update_unique(&mut self) {
        self.unique = self.unique.wrapping_add(1);
    }

    /// Draw the next block id from the counter. Raw ids advance by 4 so the
    /// on-disk sequence encodes allocation order regardless of the flag
    /// bits.
    pub fn alloc_bid(&mut self, is_internal: bool) -> NdbResult<BlockId> {
        let index = u64::from(self.next_block) >> 2;
        let bid = BlockId::new(is_internal, index)?;
        self.next_block = BlockId::from(u64::from(self.next_block) + 4);
        Ok(bid)
    }

    /// Draw the next page id; pages count by 1 in their own namespace.
    pub fn alloc_pid(&mut self) -> PageId {
        let pid = self.next_page;
        self.next_page = PageId::new(u64::from(self.next_page) + 1);
        pid
    }

    /// Draw the next node id of the given type from its `rgnid[]` slot.
    pub fn alloc_nid(&mut self, id_type: NodeIdType) -> NdbResult<NodeId> {
        let slot = id_type.counter_slot();
        let index = self.nids[slot] >> 5;
        let nid = NodeId::new(id_type, index)?;
        self.nids[slot] = ((index + 1) << 5) | (self.nids[slot] & 0x1F);
        Ok(nid)
    }

    pub fn first_free_map(&mut self) -> &mut [u8] {
        &mut self.free_map
    }

    pub fn read(f: &mut dyn Read) -> io::Result<Self> {
        match Pst::VERSION {
            NdbVersion::Unicode => Self::read_unicode(f),
            NdbVersion::Ansi => Self::read_ansi(f),
        }
    }

    pub fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        match Pst::VERSION {
            NdbVersion::Unicode => self.write_unicode(f),
            NdbVersion::Ansi => self.write_ansi(f),
        }
    }

    fn read_magic(f: &mut dyn Read) -> io::Result<u32> {
        // dwMagic
        let magic = f.read_u32::<LittleEndian>()?;
        if magic != HEADER_MAGIC {
            return Err(NdbError::InvalidNdbHeaderMagicValue(magic).into());
        }

        // dwCRCPartial
        f.read_u32::<LittleEndian>()
    }

    fn read_client_header(cursor: &mut dyn Read, version: NdbVersion) -> io::Result<(u32, u32)> {
        // wMagicClient
        let magic = cursor.read_u16::<LittleEndian>()?;
        if magic != HEADER_MAGIC_CLIENT {
            return Err(NdbError::InvalidNdbHeaderMagicClientValue(magic).into());
        }

        // wVer
        let read_version = NdbVersion::try_from(cursor.read_u16::<LittleEndian>()?)?;
        if read_version != version {
            return Err(NdbError::WrongPstVersion(read_version as u16).into());
        }

        // wVerClient
        let client_version = cursor.read_u16::<LittleEndian>()?;
        if client_version != NDB_CLIENT_VERSION {
            return Err(NdbError::InvalidNdbHeaderClientVersion(client_version).into());
        }

        // bPlatformCreate, bPlatformAccess: only one value is documented,
        // tolerate what is read back
        let _ = cursor.read_u8()?;
        let _ = cursor.read_u8()?;

        // dwReserved1
        let reserved1 = cursor.read_u32::<LittleEndian>()?;

        // dwReserved2
        let reserved2 = cursor.read_u32::<LittleEndian>()?;

        Ok((reserved1, reserved2))
    }

    fn read_unicode(f: &mut dyn Read) -> io::Result<Self> {
        let crc_partial = Self::read_magic(f)?;

        let mut crc_data = [0_u8; 516];
        f.read_exact(&mut crc_data)?;
        if crc_partial != compute_crc(0, &crc_data[..471]) {
            return Err(NdbError::InvalidNdbHeaderPartialCrc(crc_partial).into());
        }

        // dwCRCFull
        let crc_full = f.read_u32::<LittleEndian>()?;
        if crc_full != compute_crc(0, &crc_data) {
            return Err(NdbError::InvalidNdbHeaderFullCrc(crc_full).into());
        }

        let mut cursor = Cursor::new(crc_data);
        let (reserved1, reserved2) = Self::read_client_header(&mut cursor, NdbVersion::Unicode)?;

        // bidUnused
        let unused1 = cursor.read_u64::<LittleEndian>()?;

        // bidNextP
        let next_page = PageId::read::<Pst>(&mut cursor)?;

        // dwUnique
        let unique = cursor.read_u32::<LittleEndian>()?;

        // rgnid
        let mut nids = [0_u32; 32];
        for nid in nids.iter_mut() {
            *nid = cursor.read_u32::<LittleEndian>()?;
        }

        // qwUnused
        let unused2 = cursor.read_u64::<LittleEndian>()?;

        // root
        let root = Root::read::<Pst>(&mut cursor)?;

        // dwAlign
        let _ = cursor.read_u32::<LittleEndian>()?;

        // rgbFM
        let mut free_map = [0; 128];
        cursor.read_exact(&mut free_map)?;

        // rgbFP
        let mut free_page_map = [0; 128];
        cursor.read_exact(&mut free_page_map)?;

        // bSentinel
        let sentinel = cursor.read_u8()?;
        if sentinel != NDB_SENTINEL {
            return Err(NdbError::InvalidNdbHeaderSentinelValue(sentinel).into());
        }

        // bCryptMethod
        let crypt_method = NdbCryptMethod::try_from(cursor.read_u8()?)?;

        // rgbReserved
        let _ = cursor.read_u16::<LittleEndian>()?;

        // bidNextB
        let next_block = BlockId::read::<Pst>(&mut cursor)?;

        // rgbReserved2, bReserved, rgbReserved3 (total 36 bytes)
        let mut reserved3 = [0_u8; 36];
        f.read_exact(&mut reserved3)?;

        Ok(Self {
            next_page,
            unique,
            nids,
            root,
            free_map,
            free_page_map,
            crypt_method,
            next_block,
            reserved1,
            reserved2,
            unused1,
            unused2,
            reserved3,
            _variant: PhantomData,
        })
    }

    fn write_unicode(&self, f: &mut dyn Write) -> io::Result<()> {
        let mut cursor = Cursor::new([0_u8; 516]);
        // wMagicClient
        cursor.write_u16::<LittleEndian>(HEADER_MAGIC_CLIENT)?;
        // wVer
        cursor.write_u16::<LittleEndian>(NdbVersion::Unicode as u16)?;
        // wVerClient
        cursor.write_u16::<LittleEndian>(NDB_CLIENT_VERSION)?;
        // bPlatformCreate
        cursor.write_u8(NDB_PLATFORM_CREATE)?;
        // bPlatformAccess
        cursor.write_u8(NDB_PLATFORM_ACCESS)?;
        // dwReserved1
        cursor.write_u32::<LittleEndian>(self.reserved1)?;
        // dwReserved2
        cursor.write_u32::<LittleEndian>(self.reserved2)?;
        // bidUnused
        cursor.write_u64::<LittleEndian>(self.unused1)?;
        // bidNextP
        self.next_page.write::<Pst>(&mut cursor)?;
        // dwUnique
        cursor.write_u32::<LittleEndian>(self.unique)?;
        // rgnid
        for nid in self.nids.iter() {
            cursor.write_u32::<LittleEndian>(*nid)?;
        }
        // qwUnused
        cursor.write_u64::<LittleEndian>(self.unused2)?;
        // root
        self.root.write::<Pst>(&mut cursor)?;
        // dwAlign
        cursor.write_u32::<LittleEndian>(0)?;
        // rgbFM
        cursor.write_all(&self.free_map)?;
        // rgbFP
        cursor.write_all(&self.free_page_map)?;
        // bSentinel
        cursor.write_u8(NDB_SENTINEL)?;
        // bCryptMethod
        cursor.write_u8(self.crypt_method as u8)?;
        // rgbReserved
        cursor.write_u16::<LittleEndian>(0)?;
        // bidNextB
        self.next_block.write::<Pst>(&mut cursor)?;

        let crc_data = cursor.into_inner();
        let crc_partial = compute_crc(0, &crc_data[..471]);
        let crc_full = compute_crc(0, &crc_data);

        // dwMagic
        f.write_u32::<LittleEndian>(HEADER_MAGIC)?;
        // dwCRCPartial
        f.write_u32::<LittleEndian>(crc_partial)?;

        f.write_all(&crc_data)?;

        // dwCRCFull
        f.write_u32::<LittleEndian>(crc_full)?;

        // rgbReserved2, bReserved, rgbReserved3 (total 36 bytes)
        f.write_all(&self.reserved3)
    }

    fn read_ansi(f: &mut dyn Read) -> io::Result<Self> {
        let crc_partial = Self::read_magic(f)?;

        let mut crc_data = [0_u8; 504];
        f.read_exact(&mut crc_data)?;
        if crc_partial != compute_crc(0, &crc_data[..471]) {
            return Err(NdbError::InvalidNdbHeaderPartialCrc(crc_partial).into());
        }

        let mut cursor = Cursor::new(crc_data);
        let (reserved1, reserved2) = Self::read_client_header(&mut cursor, NdbVersion::Ansi)?;

        // bidNextB
        let next_block = BlockId::read::<Pst>(&mut cursor)?;

        // bidNextP
        let next_page = PageId::read::<Pst>(&mut cursor)?;

        // dwUnique
        let unique = cursor.read_u32::<LittleEndian>()?;

        // rgnid
        let mut nids = [0_u32; 32];
        for nid in nids.iter_mut() {
            *nid = cursor.read_u32::<LittleEndian>()?;
        }

        // root
        let root = Root::read::<Pst>(&mut cursor)?;

        // rgbFM
        let mut free_map = [0; 128];
        cursor.read_exact(&mut free_map)?;

        // rgbFP
        let mut free_page_map = [0; 128];
        cursor.read_exact(&mut free_page_map)?;

        // bSentinel
        let sentinel = cursor.read_u8()?;
        if sentinel != NDB_SENTINEL {
            return Err(NdbError::InvalidNdbHeaderSentinelValue(sentinel).into());
        }

        // bCryptMethod
        let crypt_method = NdbCryptMethod::try_from(cursor.read_u8()?)?;

        // rgbReserved
        let _ = cursor.read_u16::<LittleEndian>()?;

        // ullReserved, dwReserved (total 12 bytes)
        let mut reserved = [0_u8; 12];
        cursor.read_exact(&mut reserved)?;

        // rgbReserved2, bReserved, rgbReserved3 (total 36 bytes)
        let mut reserved3 = [0_u8; 36];
        cursor.read_exact(&mut reserved3)?;

        Ok(Self {
            next_page,
            unique,
            nids,
            root,
            free_map,
            free_page_map,
            crypt_method,
            next_block,
            reserved1,
            reserved2,
            unused1: 0,
            unused2: 0,
            reserved3,
            _variant: PhantomData,
        })
    }

    fn write_ansi(&self, f: &mut dyn Write) -> io::Result<()> {
        let mut cursor = Cursor::new([0_u8; 504]);
        // wMagicClient
        cursor.write_u16::<LittleEndian>(HEADER_MAGIC_CLIENT)?;
        // wVer
        cursor.write_u16::<LittleEndian>(NdbVersion::Ansi as u16)?;
        // wVerClient
        cursor.write_u16::<LittleEndian>(NDB_CLIENT_VERSION)?;
        // bPlatformCreate
        cursor.write_u8(NDB_PLATFORM_CREATE)?;
        // bPlatformAccess
        cursor.write_u8(NDB_PLATFORM_ACCESS)?;
        // dwReserved1
        cursor.write_u32::<LittleEndian>(self.reserved1)?;
        // dwReserved2
        cursor.write_u32::<LittleEndian>(self.reserved2)?;
        // bidNextB
        self.next_block.write::<Pst>(&mut cursor)?;
        // bidNextP
        self.next_page.write::<Pst>(&mut cursor)?;
        // dwUnique
        cursor.write_u32::<LittleEndian>(self.unique)?;
        // rgnid
        for nid in self.nids.iter() {
            cursor.write_u32::<LittleEndian>(*nid)?;
        }
        // root
        self.root.write::<Pst>(&mut cursor)?;
        // rgbFM
        cursor.write_all(&self.free_map)?;
        // rgbFP
        cursor.write_all(&self.free_page_map)?;
        // bSentinel
        cursor.write_u8(NDB_SENTINEL)?;
        // bCryptMethod
        cursor.write_u8(self.crypt_method as u8)?;
        // rgbReserved
        cursor.write_u16::<LittleEndian>(0)?;
        // ullReserved, dwReserved (total 12 bytes)
        cursor.write_all(&[0_u8; 12])?;
        // rgbReserved2, bReserved, rgbReserved3 (total 36 bytes)
        cursor.write_all(&self.reserved3)?;

        let crc_data = cursor.into_inner();
        let crc_partial = compute_crc(0, &crc_data[..471]);

        // dwMagic
        f.write_u32::<LittleEndian>(HEADER_MAGIC)?;
        // dwCRCPartial
        f.write_u32::<LittleEndian>(crc_partial)?;

        f.write_all(&crc_data)
    }

    /// Read the header back from the start of the file.
    pub fn reload<R: Read + Seek>(f: &mut R) -> io::Result<Self> {
        f.seek(SeekFrom::Start(0))?;
        Self::read(f)
    }

    /// Persist the header at the start of the file.
    pub fn flush<W: Write + Seek>(&self, f: &mut W) -> io::Result<()> {
        f.seek(SeekFrom::Start(0))?;
        self.write(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ndb::{block_ref::PageRef, byte_index::ByteIndex};
    use crate::{Ansi, Unicode};

    #[test]
    fn test_magic_values() {
        assert_eq!(HEADER_MAGIC, 0x4E444221);
        assert_eq!(HEADER_MAGIC_CLIENT, 0x4D53);
    }

    #[test]
    fn test_default_nids_reserve_known_ranges() {
        assert_eq!(NDB_DEFAULT_NIDS[0] >> 5, 0x400);
        assert_eq!(NDB_DEFAULT_NIDS[4] >> 5, 0x10000);
        for (slot, nid) in NDB_DEFAULT_NIDS.iter().enumerate() {
            assert_eq!(nid & 0x1F, slot as u32);
        }
    }

    fn sample_root() -> Root {
        Root::new(
            ByteIndex::new(0x42400),
            ByteIndex::new(0x4400),
            0,
            PageRef::default(),
            PageRef::default(),
            AmapStatus::Valid2,
        )
    }

    #[test]
    fn test_unicode_round_trip() {
        let mut header = Header::<Unicode>::new(sample_root(), NdbCryptMethod::Permute);
        header.update_unique();

        let mut buffer: Vec<u8> = Vec::new();
        header.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 4 + 4 + 516 + 4 + 36);

        let read_back = Header::<Unicode>::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.crypt_method(), NdbCryptMethod::Permute);
        assert_eq!(read_back.unique, 1);
        assert_eq!(
            u64::from(read_back.next_block()),
            u64::from(header.next_block())
        );
    }

    #[test]
    fn test_ansi_round_trip() {
        let header = Header::<Ansi>::new(sample_root(), NdbCryptMethod::None);

        let mut buffer: Vec<u8> = Vec::new();
        header.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), 4 + 4 + 504);

        let read_back = Header::<Ansi>::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.crypt_method(), NdbCryptMethod::None);
    }

    #[test]
    fn test_corrupt_crc_detected() {
        let header = Header::<Unicode>::new(sample_root(), NdbCryptMethod::None);
        let mut buffer: Vec<u8> = Vec::new();
        header.write(&mut buffer).unwrap();
        buffer[100] ^= 0xFF;

        let Err(err) = Header::<Unicode>::read(&mut buffer.as_slice()) else {
            panic!("corrupt header should fail");
        };
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_id_allocation() {
        let mut header = Header::<Unicode>::new(sample_root(), NdbCryptMethod::None);

        let first = header.alloc_bid(false).unwrap();
        let second = header.alloc_bid(true).unwrap();
        assert_eq!(second.index(), first.index() + 1);
        assert!(second.is_internal());

        let first_pid = header.alloc_pid();
        let second_pid = header.alloc_pid();
        assert_eq!(u64::from(second_pid), u64::from(first_pid) + 1);

        let nid = header.alloc_nid(NodeIdType::NormalFolder).unwrap();
        assert_eq!(nid.index(), 0x400);
        let nid = header.alloc_nid(NodeIdType::NormalFolder).unwrap();
        assert_eq!(nid.index(), 0x401);
    }
}
