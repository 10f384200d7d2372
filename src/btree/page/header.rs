use crate::io::{read_exact, ByteWriter, Decodeable, Encodeable};

/// Size of the on-disk page header in bytes, 7 little-endian u32 fields.
pub const PAGE_HEADER_SIZE: usize = 28;

pub(crate) const OFF_HDRPAGES: usize = 0;
pub(crate) const OFF_REALPAGES: usize = 4;
pub(crate) const OFF_BYTES: usize = 8;
pub(crate) const OFF_CHECKSUM: usize = 12;
pub(crate) const OFF_OVERFLOW: usize = 16;
pub(crate) const OFF_SIZE: usize = 20;
pub(crate) const OFF_NEXT: usize = 24;

/// First bytes of every tree or freelist page.
///
/// - `hdrpages` - physically contiguous pages at the primary location
/// - `realpages` - total pages owned on disk (primary + overflow)
/// - `bytes` - valid content bytes, header included
/// - `overflow` - first page of the overflow extent, 0 if none
/// - `size` - count of logical records
/// - `next` - right sibling at the same tree level, 0 terminates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub hdrpages: u32,
    pub realpages: u32,
    pub bytes: u32,
    pub checksum: u32,
    pub overflow: u32,
    pub size: u32,
    pub next: u32,
}

impl PageHeader {
    pub fn init(hdrpages: u32, next: u32) -> PageHeader {
        PageHeader {
            hdrpages,
            realpages: hdrpages,
            bytes: PAGE_HEADER_SIZE as u32,
            checksum: 0,
            overflow: 0,
            size: 0,
            next,
        }
    }
}

impl Encodeable for PageHeader {
    fn encode(&self) -> Vec<u8> {
        let mut writer = ByteWriter::new();
        writer.write(&self.hdrpages);
        writer.write(&self.realpages);
        writer.write(&self.bytes);
        writer.write(&self.checksum);
        writer.write(&self.overflow);
        writer.write(&self.size);
        writer.write(&self.next);
        writer.to_bytes()
    }
}

impl Decodeable for PageHeader {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
        let mut next_u32 = || {
            u32::from_le_bytes(read_exact(reader, 4).try_into().unwrap())
        };
        PageHeader {
            hdrpages: next_u32(),
            realpages: next_u32(),
            bytes: next_u32(),
            checksum: next_u32(),
            overflow: next_u32(),
            size: next_u32(),
            next: next_u32(),
        }
    }
}
