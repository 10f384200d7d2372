use std::{
    convert::TryInto,
    fs::{File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use parking_lot::Mutex;

use crate::types::KvResult;

/// The database file. A single mutex serializes every access so the
/// seek + read and seek + write pairs appear atomic to callers.
pub struct DbFile {
    file: Mutex<File>,
    sync: bool,
}

impl DbFile {
    pub fn open<P: AsRef<Path>>(
        path: P,
        create: bool,
        sync: bool,
    ) -> Result<Self, std::io::Error> {
        let file = OpenOptions::new()
            .write(true)
            .read(true)
            .create(create)
            .open(path)?;

        Ok(Self {
            file: Mutex::new(file),
            sync,
        })
    }

    /// Positioned read. A read past the end of file fills the remainder of
    /// the buffer with zeros; the engine never reads a page it has not
    /// previously written, so the zeros are only ever observed by callers
    /// probing a fresh file.
    pub fn read_at(&self, buf: &mut [u8], offset: u64) -> KvResult {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;

        let mut filled = 0;
        while filled < buf.len() {
            let n = file.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        for b in &mut buf[filled..] {
            *b = 0;
        }
        Ok(())
    }

    /// Positioned write. When the database was opened with `sync`, every
    /// write is followed by a data sync.
    pub fn write_at(&self, buf: &[u8], offset: u64) -> KvResult {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(buf)?;
        if self.sync {
            file.sync_data()?;
        }
        Ok(())
    }

    pub fn size(&self) -> Result<u64, crate::error::KvError> {
        let file = self.file.lock();
        Ok(file.metadata()?.len())
    }
}

pub fn read_exact<R: std::io::Read>(reader: &mut R, bytes_count: usize) -> Vec<u8> {
    let mut buffer = vec![0u8; bytes_count];
    reader
        .read_exact(&mut buffer)
        .expect(&format!("io error, expect {}", bytes_count));
    buffer
}

pub struct ByteWriter {
    buf: Vec<u8>,
}

impl ByteWriter {
    pub fn new() -> Self {
        let buf = Vec::new();
        Self { buf }
    }

    pub fn write<T: Encodeable>(&mut self, obj: &T) {
        self.buf.extend_from_slice(obj.encode().as_slice());
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.buf.clone()
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn to_padded_bytes(&self, size: usize) -> Vec<u8> {
        let mut buf = self.buf.clone();

        if buf.len() > size {
            panic!(
                "buffer size is larger than the given size: {} > {}",
                buf.len(),
                size
            );
        }

        buf.resize(size, 0);
        buf
    }
}

pub trait Encodeable {
    fn encode(&self) -> Vec<u8>;
}

pub trait Decodeable {
    fn decode_from<R: std::io::Read>(reader: &mut R) -> Self;
}

macro_rules! impl_serialization {
    (for $($t:ty),+) => {
        $(
            impl Encodeable for $t {
                fn encode(&self) -> Vec<u8> {
                    self.to_le_bytes().to_vec()
                }
            }

            impl Decodeable for $t {
                fn decode_from<R: std::io::Read>(reader: &mut R) -> Self {
                    let bytes = read_exact(reader, size_of::<Self>());
                    Self::from_le_bytes(bytes.try_into().unwrap())
                }
            }
        )*
    }
}

impl_serialization!(for u8, u16, u32, u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_positioned_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let file = DbFile::open(dir.path().join("io.db"), true, false).unwrap();

        file.write_at(b"hello", 0).unwrap();
        file.write_at(b"world", 4096).unwrap();

        let mut buf = [0u8; 5];
        file.read_at(&mut buf, 4096).unwrap();
        assert_eq!(&buf, b"world");

        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf, b"hello");

        assert_eq!(file.size().unwrap(), 4096 + 5);
    }

    #[test]
    fn test_read_past_eof_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let file = DbFile::open(dir.path().join("io.db"), true, false).unwrap();

        file.write_at(b"abc", 0).unwrap();

        let mut buf = [0xffu8; 8];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(&buf[3..], &[0u8; 5]);
    }

    #[test]
    fn test_writer_round_trip() {
        let mut w = ByteWriter::new();
        w.write(&42u32);
        w.write(&7u16);
        assert_eq!(w.size(), 6);

        let mut reader = std::io::Cursor::new(w.to_bytes());
        assert_eq!(u32::decode_from(&mut reader), 42);
        assert_eq!(u16::decode_from(&mut reader), 7);
    }
}
