//! [Pages](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5774b4f2-cdc4-453e-996a-8c8230116930)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use core::mem;
use std::{
    io::{self, Cursor, Read, Write},
    marker::PhantomData,
};

use super::{block_id::*, *};
use crate::{block_sig::compute_sig, crc::compute_crc, PstFile};
use crate::ndb::header::NdbVersion;

/// `ptype`
///
/// ### See also
/// [PageTrailer]
#[repr(u8)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum PageType {
    #[default]
    None = 0x00,
    /// `ptypeBBT`: Block BTree page
    BlockBTree = 0x80,
    /// `ptypeNBT`: Node BTree page
    NodeBTree = 0x81,
    /// `ptypeFMap`: Free Map page
    FreeMap = 0x82,
    /// `ptypePMap`: Allocation Page Map page
    AllocationPageMap = 0x83,
    /// `ptypeAMap`: Allocation Map page
    AllocationMap = 0x84,
    /// `ptypeFPMap`: Free Page Map page
    FreePageMap = 0x85,
    /// `ptypeDL`: Density List page
    DensityList = 0x86,
}

impl TryFrom<u8> for PageType {
    type Error = NdbError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x80 => Ok(PageType::BlockBTree),
            0x81 => Ok(PageType::NodeBTree),
            0x82 => Ok(PageType::FreeMap),
            0x83 => Ok(PageType::AllocationPageMap),
            0x84 => Ok(PageType::AllocationMap),
            0x85 => Ok(PageType::FreePageMap),
            0x86 => Ok(PageType::DensityList),
            _ => Err(NdbError::InvalidPageType(value)),
        }
    }
}

impl PageType {
    /// Only B-tree and density-list pages carry a computed signature; the
    /// allocation-map family persists 0 there.
    pub fn signature(&self, index: u64, page_id: u64) -> u16 {
        match self {
            PageType::BlockBTree | PageType::NodeBTree | PageType::DensityList => {
                compute_sig(index, page_id)
            }
            _ => 0,
        }
    }
}

pub const PAGE_SIZE: usize = 512;

/// [PAGETRAILER](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/f4ccb38a-930a-4db4-98df-a69c195926ba)
#[derive(Copy, Clone, Default, Debug)]
pub struct PageTrailer {
    page_type: PageType,
    signature: u16,
    crc: u32,
    page_id: PageId,
}

impl PageTrailer {
    pub fn new(page_type: PageType, signature: u16, page_id: PageId, crc: u32) -> Self {
        Self {
            page_type,
            signature,
            crc,
            page_id,
        }
    }

    pub fn page_type(&self) -> PageType {
        self.page_type
    }

    pub fn signature(&self) -> u16 {
        self.signature
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn page_id(&self) -> PageId {
        self.page_id
    }

    pub const fn size<Pst: PstFile>() -> usize {
        match Pst::VERSION {
            NdbVersion::Unicode => 16,
            NdbVersion::Ansi => 12,
        }
    }

    pub fn read<Pst: PstFile>(f: &mut dyn Read) -> io::Result<Self> {
        let mut page_type = [0_u8; 2];
        f.read_exact(&mut page_type)?;
        if page_type[0] != page_type[1] {
            return Err(NdbError::MismatchPageTypeRepeat(page_type[0], page_type[1]).into());
        }
        let page_type = PageType::try_from(page_type[0])?;
        let signature = f.read_u16::<LittleEndian>()?;

        // dwCRC and bid swap places between the two variants
        let (crc, page_id) = match Pst::VERSION {
            NdbVersion::Unicode => {
                let crc = f.read_u32::<LittleEndian>()?;
                let page_id = PageId::read::<Pst>(f)?;
                (crc, page_id)
            }
            NdbVersion::Ansi => {
                let page_id = PageId::read::<Pst>(f)?;
                let crc = f.read_u32::<LittleEndian>()?;
                (crc, page_id)
            }
        };

        Ok(Self {
            page_type,
            signature,
            crc,
            page_id,
        })
    }

    pub fn write<Pst: PstFile>(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_all(&[self.page_type as u8; 2])?;
        f.write_u16::<LittleEndian>(self.signature)?;
        match Pst::VERSION {
            NdbVersion::Unicode => {
                f.write_u32::<LittleEndian>(self.crc)?;
                self.page_id.write::<Pst>(f)
            }
            NdbVersion::Ansi => {
                self.page_id.write::<Pst>(f)?;
                f.write_u32::<LittleEndian>(self.crc)
            }
        }
    }

    /// Trailer-signature check performed at the weak validation level.
    pub fn verify_signature(&self, offset: u64) -> NdbResult<()> {
        let expected = self
            .page_type
            .signature(offset, u64::from(self.page_id));
        if self.signature != expected {
            return Err(NdbError::InvalidPageSignature(self.signature));
        }
        Ok(())
    }
}

pub type MapBits = [u8; 496];

pub const MAP_BITS_SIZE: usize = mem::size_of::<MapBits>();

/// One page of the allocation-map family: AMap, and the write-only legacy
/// PMap/FMap/FPMap kinds. 496 map bytes; the ANSI layout pads the payload
/// to 500 bytes, with the padding before the bits on AMap/PMap pages and
/// after them on FMap/FPMap pages.
pub struct MapPage<Pst, const PAGE_TYPE: u8> {
    map_bits: MapBits,
    trailer: PageTrailer,
    _variant: PhantomData<Pst>,
}

impl<Pst: PstFile, const PAGE_TYPE: u8> MapPage<Pst, PAGE_TYPE> {
    pub fn new(map_bits: MapBits, trailer: PageTrailer) -> NdbResult<Self> {
        if trailer.page_type() as u8 != PAGE_TYPE {
            return Err(NdbError::UnexpectedPageType(trailer.page_type()));
        }
        Ok(Self {
            map_bits,
            trailer,
            _variant: PhantomData,
        })
    }

    pub fn map_bits(&self) -> &MapBits {
        &self.map_bits
    }

    pub fn map_bits_mut(&mut self) -> &mut MapBits {
        &mut self.map_bits
    }

    pub fn trailer(&self) -> &PageTrailer {
        &self.trailer
    }

    fn padding_first() -> bool {
        matches!(
            PageType::try_from(PAGE_TYPE),
            Ok(PageType::AllocationMap) | Ok(PageType::AllocationPageMap)
        )
    }

    pub fn read(f: &mut dyn Read) -> io::Result<Self> {
        let payload_size = PAGE_SIZE - PageTrailer::size::<Pst>();
        let mut payload = vec![0_u8; payload_size];
        f.read_exact(&mut payload)?;

        let mut cursor = Cursor::new(payload.as_slice());
        if Pst::VERSION == NdbVersion::Ansi && Self::padding_first() {
            // dwPadding
            let _ = cursor.read_u32::<LittleEndian>()?;
        }
        let mut map_bits = [0_u8; MAP_BITS_SIZE];
        cursor.read_exact(&mut map_bits)?;

        let trailer = PageTrailer::read::<Pst>(f)?;
        if trailer.page_type() as u8 != PAGE_TYPE {
            return Err(NdbError::UnexpectedPageType(trailer.page_type()).into());
        }

        #[cfg(feature = "full-validation")]
        {
            let crc = compute_crc(0, &payload);
            if crc != trailer.crc() {
                return Err(NdbError::InvalidPageCrc(crc).into());
            }
        }

        Ok(Self {
            map_bits,
            trailer,
            _variant: PhantomData,
        })
    }

    pub fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        let payload_size = PAGE_SIZE - PageTrailer::size::<Pst>();
        let mut payload = vec![0_u8; payload_size];
        {
            let mut cursor = Cursor::new(payload.as_mut_slice());
            if Pst::VERSION == NdbVersion::Ansi && Self::padding_first() {
                // dwPadding
                cursor.write_u32::<LittleEndian>(0)?;
            }
            cursor.write_all(&self.map_bits)?;
        }

        let crc = compute_crc(0, &payload);
        f.write_all(&payload)?;

        let trailer = PageTrailer { crc, ..self.trailer };
        trailer.write::<Pst>(f)
    }
}

pub type AllocationMapPage<Pst> = MapPage<Pst, { PageType::AllocationMap as u8 }>;
pub type AllocationPageMapPage<Pst> = MapPage<Pst, { PageType::AllocationPageMap as u8 }>;
pub type FreeMapPage<Pst> = MapPage<Pst, { PageType::FreeMap as u8 }>;
pub type FreePageMapPage<Pst> = MapPage<Pst, { PageType::FreePageMap as u8 }>;

const DENSITY_LIST_ENTRY_PAGE_NUMBER_MASK: u32 = 0x000F_FFFF;

/// [DLISTPAGEENT](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/9d3c45b9-a415-446c-954f-b1b473dbb415)
#[derive(Copy, Clone, Debug)]
pub struct DensityListPageEntry(u32);

impl DensityListPageEntry {
    pub fn new(page: u32, free_slots: u16) -> NdbResult<Self> {
        if page & !DENSITY_LIST_ENTRY_PAGE_NUMBER_MASK != 0 {
            return Err(NdbError::InvalidDensityListEntryPageNumber(page));
        };
        if free_slots & !0x0FFF != 0 {
            return Err(NdbError::InvalidDensityListEntryFreeSlots(free_slots));
        };

        Ok(Self(page | (u32::from(free_slots) << 20)))
    }

    pub fn read(f: &mut dyn Read) -> io::Result<Self> {
        Ok(Self(f.read_u32::<LittleEndian>()?))
    }

    pub fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u32::<LittleEndian>(self.0)
    }

    pub fn page(&self) -> u32 {
        self.0 & DENSITY_LIST_ENTRY_PAGE_NUMBER_MASK
    }

    pub fn free_slots(&self) -> u16 {
        (self.0 >> 20) as u16
    }
}

pub const DENSITY_LIST_FILE_OFFSET: u64 = 0x4200;

const fn density_list_entries_size<Pst: PstFile>() -> usize {
    // bFlags, cEntDList, wPadding, ulCurrentPage, then entries, then 12
    // bytes of tail padding before the trailer
    PAGE_SIZE - PageTrailer::size::<Pst>() - 8 - 12
}

/// [DLISTPAGE](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/5d426b2d-ec10-4614-b768-46813652d5e3)
///
/// Caches the set of emptiest AMap pages so allocation can go straight to
/// one with room instead of scanning from the start of the file.
pub struct DensityListPage<Pst> {
    backfill_complete: bool,
    current_page: u32,
    entries: Vec<DensityListPageEntry>,
    trailer: PageTrailer,
    _variant: PhantomData<Pst>,
}

impl<Pst: PstFile> DensityListPage<Pst> {
    pub fn max_entries() -> usize {
        density_list_entries_size::<Pst>() / mem::size_of::<DensityListPageEntry>()
    }

    pub fn new(
        backfill_complete: bool,
        current_page: u32,
        entries: &[DensityListPageEntry],
        trailer: PageTrailer,
    ) -> NdbResult<Self> {
        if entries.len() > Self::max_entries() {
            return Err(NdbError::InvalidDensityListEntryCount(entries.len()));
        }

        if trailer.page_type() != PageType::DensityList {
            return Err(NdbError::UnexpectedPageType(trailer.page_type()));
        }

        Ok(Self {
            backfill_complete,
            current_page,
            entries: entries.to_vec(),
            trailer,
            _variant: PhantomData,
        })
    }

    pub fn backfill_complete(&self) -> bool {
        self.backfill_complete
    }

    pub fn current_page(&self) -> u32 {
        self.current_page
    }

    pub fn entries(&self) -> &[DensityListPageEntry] {
        &self.entries
    }

    pub fn trailer(&self) -> &PageTrailer {
        &self.trailer
    }

    pub fn read(f: &mut dyn Read) -> io::Result<Self> {
        let payload_size = PAGE_SIZE - PageTrailer::size::<Pst>();
        let mut payload = vec![0_u8; payload_size];
        f.read_exact(&mut payload)?;

        let mut cursor = Cursor::new(payload.as_slice());

        // bFlags
        let backfill_complete = cursor.read_u8()? & 0x01 != 0;

        // cEntDList
        let entry_count = usize::from(cursor.read_u8()?);
        if entry_count > Self::max_entries() {
            return Err(NdbError::InvalidDensityListEntryCount(entry_count).into());
        }

        // wPadding
        let _ = cursor.read_u16::<LittleEndian>()?;

        // ulCurrentPage
        let current_page = cursor.read_u32::<LittleEndian>()?;

        // rgDListPageEnt
        let mut entries = Vec::with_capacity(entry_count);
        for _ in 0..entry_count {
            entries.push(DensityListPageEntry::read(&mut cursor)?);
        }

        let trailer = PageTrailer::read::<Pst>(f)?;
        if trailer.page_type() != PageType::DensityList {
            return Err(NdbError::UnexpectedPageType(trailer.page_type()).into());
        }
        trailer.verify_signature(DENSITY_LIST_FILE_OFFSET)?;

        #[cfg(feature = "full-validation")]
        {
            let crc = compute_crc(0, &payload);
            if crc != trailer.crc() {
                return Err(NdbError::InvalidPageCrc(crc).into());
            }
        }

        Ok(Self {
            backfill_complete,
            current_page,
            entries,
            trailer,
            _variant: PhantomData,
        })
    }

    pub fn write(&self, f: &mut dyn Write) -> io::Result<()> {
        let payload_size = PAGE_SIZE - PageTrailer::size::<Pst>();
        let mut payload = vec![0_u8; payload_size];
        {
            let mut cursor = Cursor::new(payload.as_mut_slice());

            // bFlags
            cursor.write_u8(if self.backfill_complete { 0x01 } else { 0 })?;

            // cEntDList
            cursor.write_u8(self.entries.len() as u8)?;

            // wPadding
            cursor.write_u16::<LittleEndian>(0)?;

            // ulCurrentPage
            cursor.write_u32::<LittleEndian>(self.current_page)?;

            // rgDListPageEnt
            for entry in self.entries.iter() {
                entry.write(&mut cursor)?;
            }
        }

        let crc = compute_crc(0, &payload);
        f.write_all(&payload)?;

        let trailer = PageTrailer { crc, ..self.trailer };
        trailer.write::<Pst>(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ansi, Unicode};

    #[test]
    fn test_page_trailer_round_trip() {
        let trailer = PageTrailer::new(PageType::NodeBTree, 0x1234, PageId::new(0x42), 0xDEAD_BEEF);

        let mut buffer: Vec<u8> = Vec::new();
        trailer.write::<Unicode>(&mut buffer).unwrap();
        assert_eq!(buffer.len(), PageTrailer::size::<Unicode>());
        let read_back = PageTrailer::read::<Unicode>(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.signature(), 0x1234);
        assert_eq!(read_back.crc(), 0xDEAD_BEEF);
        assert_eq!(u64::from(read_back.page_id()), 0x42);

        let mut buffer: Vec<u8> = Vec::new();
        trailer.write::<Ansi>(&mut buffer).unwrap();
        assert_eq!(buffer.len(), PageTrailer::size::<Ansi>());
        let read_back = PageTrailer::read::<Ansi>(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.crc(), 0xDEAD_BEEF);
        assert_eq!(u64::from(read_back.page_id()), 0x42);
    }

    #[test]
    fn test_page_type_repeat_mismatch() {
        let trailer = PageTrailer::new(PageType::AllocationMap, 0, PageId::new(0x4400), 0);
        let mut buffer: Vec<u8> = Vec::new();
        trailer.write::<Unicode>(&mut buffer).unwrap();
        buffer[1] = 0x81;
        assert!(PageTrailer::read::<Unicode>(&mut buffer.as_slice()).is_err());
    }

    #[test]
    fn test_map_page_round_trip() {
        let mut map_bits = [0_u8; MAP_BITS_SIZE];
        map_bits[0] = 0xFF;
        map_bits[42] = 0x80;
        let trailer = PageTrailer::new(PageType::AllocationMap, 0, PageId::new(0x4400), 0);
        let page = AllocationMapPage::<Unicode>::new(map_bits, trailer).unwrap();

        let mut buffer: Vec<u8> = Vec::new();
        page.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), PAGE_SIZE);

        let read_back = AllocationMapPage::<Unicode>::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.map_bits()[0], 0xFF);
        assert_eq!(read_back.map_bits()[42], 0x80);
    }

    #[test]
    fn test_ansi_map_page_size() {
        let map_bits = [0_u8; MAP_BITS_SIZE];
        let trailer = PageTrailer::new(PageType::AllocationMap, 0, PageId::new(0x4400), 0);
        let page = AllocationMapPage::<Ansi>::new(map_bits, trailer).unwrap();

        let mut buffer: Vec<u8> = Vec::new();
        page.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), PAGE_SIZE);
    }

    #[test]
    fn test_density_list_round_trip() {
        let entries = [
            DensityListPageEntry::new(0, 0x100).unwrap(),
            DensityListPageEntry::new(3, 0x7F).unwrap(),
        ];
        let page_id = PageId::new(0x10);
        let signature =
            PageType::DensityList.signature(DENSITY_LIST_FILE_OFFSET, u64::from(page_id));
        let trailer = PageTrailer::new(PageType::DensityList, signature, page_id, 0);
        let page = DensityListPage::<Unicode>::new(false, 3, &entries, trailer).unwrap();

        let mut buffer: Vec<u8> = Vec::new();
        page.write(&mut buffer).unwrap();
        assert_eq!(buffer.len(), PAGE_SIZE);

        let read_back = DensityListPage::<Unicode>::read(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.current_page(), 3);
        assert_eq!(read_back.entries().len(), 2);
        assert_eq!(read_back.entries()[0].free_slots(), 0x100);
        assert_eq!(read_back.entries()[1].page(), 3);
    }

    #[test]
    fn test_density_list_entry_packing() {
        let entry = DensityListPageEntry::new(0xF_FFFF, 0xFFF).unwrap();
        assert_eq!(entry.page(), 0xF_FFFF);
        assert_eq!(entry.free_slots(), 0xFFF);
        assert!(DensityListPageEntry::new(0x10_0000, 0).is_err());
        assert!(DensityListPageEntry::new(0, 0x1000).is_err());
    }
}
