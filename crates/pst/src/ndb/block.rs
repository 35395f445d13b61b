//! [Blocks](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/a9c1981d-d1ea-457c-b39e-dc7fb0eb95d4)

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::{block_id::*, btree::NodeInfo, node_id::NodeId, node_id::NodeIdType, *};
use crate::{
    block_sig::compute_sig,
    crc::compute_crc,
    encode::{cyclic, permute},
    ndb::header::{NdbCryptMethod, NdbVersion},
    PstFile,
};

pub const MAX_BLOCK_SIZE: u16 = 8192;

/// Round a raw size (payload plus trailer) up to the on-disk block size,
/// a 64-byte multiple capped at [`MAX_BLOCK_SIZE`].
pub const fn block_size(size: u16) -> u16 {
    if size >= MAX_BLOCK_SIZE {
        MAX_BLOCK_SIZE
    } else {
        let size = if size < 64 { 64 } else { size };
        let tail = size % 64;
        if tail == 0 {
            size
        } else {
            size - tail + 64
        }
    }
}

/// The largest payload an external (data-bearing) block can hold.
pub const fn max_external_size<Pst: PstFile>() -> usize {
    (MAX_BLOCK_SIZE - BlockTrailer::size::<Pst>()) as usize
}

/// [BLOCKTRAILER](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/a14943ef-70c2-403f-898c-5bc3747117e1)
#[derive(Clone, Copy, Default, Debug)]
pub struct BlockTrailer {
    size: u16,
    signature: u16,
    crc: u32,
    block_id: BlockId,
}

impl BlockTrailer {
    pub fn new(size: u16, signature: u16, crc: u32, block_id: BlockId) -> NdbResult<Self> {
        if size == 0 || size > MAX_BLOCK_SIZE {
            return Err(NdbError::InvalidBlockSize(size));
        }

        Ok(Self {
            size,
            signature,
            crc,
            block_id,
        })
    }

    pub const fn size<Pst: PstFile>() -> u16 {
        match Pst::VERSION {
            NdbVersion::Unicode => 16,
            NdbVersion::Ansi => 12,
        }
    }

    pub fn logical_size(&self) -> u16 {
        self.size
    }

    pub fn signature(&self) -> u16 {
        self.signature
    }

    pub fn crc(&self) -> u32 {
        self.crc
    }

    pub fn block_id(&self) -> BlockId {
        self.block_id
    }

    /// The cyclic method keys off the low 32 bits of the raw block id.
    pub fn cyclic_key(&self) -> u32 {
        u64::from(self.block_id) as u32
    }

    pub fn read<Pst: PstFile>(f: &mut dyn Read) -> io::Result<Self> {
        // cb
        let size = f.read_u16::<LittleEndian>()?;
        if size == 0 {
            return Err(NdbError::InvalidBlockSize(size).into());
        }

        // wSig
        let signature = f.read_u16::<LittleEndian>()?;

        // dwCRC and bid swap places between the two variants
        let (crc, block_id) = match Pst::VERSION {
            NdbVersion::Unicode => {
                let crc = f.read_u32::<LittleEndian>()?;
                let block_id = BlockId::read::<Pst>(f)?;
                (crc, block_id)
            }
            NdbVersion::Ansi => {
                let block_id = BlockId::read::<Pst>(f)?;
                let crc = f.read_u32::<LittleEndian>()?;
                (crc, block_id)
            }
        };

        Ok(Self {
            size,
            signature,
            crc,
            block_id,
        })
    }

    pub fn write<Pst: PstFile>(&self, f: &mut dyn Write) -> io::Result<()> {
        f.write_u16::<LittleEndian>(self.size)?;
        f.write_u16::<LittleEndian>(self.signature)?;
        match Pst::VERSION {
            NdbVersion::Unicode => {
                f.write_u32::<LittleEndian>(self.crc)?;
                self.block_id.write::<Pst>(f)
            }
            NdbVersion::Ansi => {
                self.block_id.write::<Pst>(f)?;
                f.write_u32::<LittleEndian>(self.crc)
            }
        }
    }
}

/// Read one block's decoded payload. The caller supplies the BBT entry
/// values; every trailer field is cross-checked against them.
pub(crate) fn read_block_payload<Pst, F>(
    f: &mut F,
    block_id: BlockId,
    offset: u64,
    logical_size: u16,
    encoding: NdbCryptMethod,
) -> io::Result<Vec<u8>>
where
    Pst: PstFile,
    F: Read + Seek,
{
    f.seek(SeekFrom::Start(offset))?;

    let mut data = vec![0_u8; usize::from(logical_size)];
    f.read_exact(&mut data)?;

    let raw_size = logical_size + BlockTrailer::size::<Pst>();
    let padding = i64::from(block_size(raw_size) - raw_size);
    if padding > 0 {
        f.seek(SeekFrom::Current(padding))?;
    }

    let trailer = BlockTrailer::read::<Pst>(f)?;
    if trailer.logical_size() != logical_size {
        return Err(NdbError::InvalidBlockSize(trailer.logical_size()).into());
    }
    if u64::from(trailer.block_id()) != u64::from(block_id) {
        return Err(NdbError::DatabaseCorrupt("block trailer bid mismatch").into());
    }

    let expected_sig = compute_sig(offset, u64::from(block_id));
    if trailer.signature() != expected_sig {
        return Err(NdbError::InvalidBlockSignature(trailer.signature()).into());
    }

    #[cfg(feature = "full-validation")]
    {
        let crc = compute_crc(0, &data);
        if crc != trailer.crc() {
            return Err(NdbError::InvalidBlockCrc(crc).into());
        }
    }

    if !block_id.is_internal() {
        match encoding {
            NdbCryptMethod::Cyclic => {
                cyclic::decode_block(&mut data, trailer.cyclic_key());
            }
            NdbCryptMethod::Permute => {
                permute::decode_block(&mut data);
            }
            NdbCryptMethod::None => {}
        }
    }

    Ok(data)
}

/// Persist one block at the given offset: encoded payload, zero padding up
/// to the 64-byte-aligned on-disk size, then the trailer.
pub(crate) fn write_block_payload<Pst, F>(
    f: &mut F,
    block_id: BlockId,
    offset: u64,
    payload: &[u8],
    encoding: NdbCryptMethod,
) -> io::Result<()>
where
    Pst: PstFile,
    F: Write + Seek,
{
    let logical_size = u16::try_from(payload.len())
        .map_err(|_| NdbError::InvalidBlockSize(MAX_BLOCK_SIZE))?;
    let mut data = payload.to_vec();

    let signature = compute_sig(offset, u64::from(block_id));
    if !block_id.is_internal() {
        match encoding {
            NdbCryptMethod::Cyclic => {
                cyclic::encode_block(&mut data, u64::from(block_id) as u32);
            }
            NdbCryptMethod::Permute => {
                permute::encode_block(&mut data);
            }
            NdbCryptMethod::None => {}
        }
    }
    let crc = compute_crc(0, &data);
    let trailer = BlockTrailer::new(logical_size, signature, crc, block_id)?;

    f.seek(SeekFrom::Start(offset))?;
    f.write_all(&data)?;

    let raw_size = logical_size + BlockTrailer::size::<Pst>();
    let padding = usize::from(block_size(raw_size) - raw_size);
    if padding > 0 {
        f.write_all(&vec![0_u8; padding])?;
    }

    trailer.write::<Pst>(f)
}

/// Everything the block and node trees need from the database context:
/// block payload access, id allocation, the pending-write queues, and the
/// NBT update hooks used when a node is saved or deleted.
pub(crate) trait BlockStore<Pst: PstFile> {
    /// Decoded payload of a committed or queued block.
    fn fetch_block(&mut self, block: BlockId) -> io::Result<Vec<u8>>;

    /// Logical size without fetching the payload.
    fn fetch_block_size(&mut self, block: BlockId) -> io::Result<u64>;

    fn alloc_bid(&mut self, is_internal: bool) -> io::Result<BlockId>;

    fn alloc_nid(&mut self, id_type: NodeIdType) -> io::Result<NodeId>;

    /// Decrement the block's reference count; space is reclaimed at commit
    /// when the committed count would drop below 2.
    fn drop_block(&mut self, block: BlockId) -> io::Result<()>;

    /// Queue a new data-block version for the next commit and insert its
    /// BBT entry (file offset still unassigned).
    fn queue_block(&mut self, block: BlockId, payload: Vec<u8>) -> io::Result<()>;

    /// Same, on the subnode-block queue.
    fn queue_subnode_block(&mut self, block: BlockId, payload: Vec<u8>) -> io::Result<()> {
        self.queue_block(block, payload)
    }

    /// Insert or update the NBT entry for a saved node.
    fn update_node(&mut self, info: NodeInfo) -> io::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Ansi, Unicode};
    use std::io::Cursor;

    #[test]
    fn test_block_size_alignment() {
        assert_eq!(block_size(1), 64);
        assert_eq!(block_size(64), 64);
        assert_eq!(block_size(65), 128);
        assert_eq!(block_size(8176), 8176);
        assert_eq!(block_size(8300), MAX_BLOCK_SIZE);
    }

    #[test]
    fn test_max_external_size() {
        assert_eq!(max_external_size::<Unicode>(), 8176);
        assert_eq!(max_external_size::<Ansi>(), 8180);
    }

    #[test]
    fn test_trailer_round_trip() {
        let trailer = BlockTrailer::new(0x40, 0xBEEF, 0xCAFE_F00D, BlockId::from(0x24_u64)).unwrap();

        let mut buffer: Vec<u8> = Vec::new();
        trailer.write::<Unicode>(&mut buffer).unwrap();
        assert_eq!(buffer.len() as u16, BlockTrailer::size::<Unicode>());
        let read_back = BlockTrailer::read::<Unicode>(&mut buffer.as_slice()).unwrap();
        assert_eq!(read_back.logical_size(), 0x40);
        assert_eq!(read_back.crc(), 0xCAFE_F00D);

        let mut buffer: Vec<u8> = Vec::new();
        trailer.write::<Ansi>(&mut buffer).unwrap();
        assert_eq!(buffer.len() as u16, BlockTrailer::size::<Ansi>());
        let read_back = BlockTrailer::read::<Ansi>(&mut buffer.as_slice()).unwrap();
        assert_eq!(u64::from(read_back.block_id()), 0x24);
    }

    #[test]
    fn test_block_payload_round_trip() {
        let bid = BlockId::new(false, 0x10).unwrap();
        let payload = b"spam and eggs".to_vec();
        let offset = 0x4800_u64;

        let mut file = Cursor::new(vec![0_u8; 0x5000]);
        write_block_payload::<Unicode, _>(&mut file, bid, offset, &payload, NdbCryptMethod::Permute)
            .unwrap();

        // encoded on disk
        let raw = &file.get_ref()[offset as usize..offset as usize + payload.len()];
        assert_ne!(raw, payload.as_slice());

        let read_back = read_block_payload::<Unicode, _>(
            &mut file,
            bid,
            offset,
            payload.len() as u16,
            NdbCryptMethod::Permute,
        )
        .unwrap();
        assert_eq!(read_back, payload);
    }

    #[test]
    fn test_internal_blocks_are_not_encoded() {
        let bid = BlockId::new(true, 0x11).unwrap();
        let payload = b"\x01\x01\x02\x00plain".to_vec();
        let offset = 0x4840_u64;

        let mut file = Cursor::new(vec![0_u8; 0x5000]);
        write_block_payload::<Unicode, _>(&mut file, bid, offset, &payload, NdbCryptMethod::Cyclic)
            .unwrap();

        let raw = &file.get_ref()[offset as usize..offset as usize + payload.len()];
        assert_eq!(raw, payload.as_slice());
    }

    #[test]
    fn test_wrong_offset_fails_signature() {
        let bid = BlockId::new(false, 0x10).unwrap();
        let payload = vec![7_u8; 32];

        let mut file = Cursor::new(vec![0_u8; 0x5000]);
        write_block_payload::<Unicode, _>(&mut file, bid, 0x4800, &payload, NdbCryptMethod::None)
            .unwrap();

        // copy the block 64 bytes later and read it from there
        let block = file.get_ref()[0x4800..0x4880].to_vec();
        file.get_mut()[0x4840..0x48C0].copy_from_slice(&block);
        let result = read_block_payload::<Unicode, _>(
            &mut file,
            bid,
            0x4840,
            payload.len() as u16,
            NdbCryptMethod::None,
        );
        assert!(result.is_err());
    }
}
