use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{ByteOrder, LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;

use crate::core::errors::{BrackenError, StorageError};

use super::freelist::{FreeEntry, FreeList};

/// The first `DESC_SECTOR` bytes of the file hold the descriptor; the rest
/// is the body, addressed in fragments of `allocsize` bytes.
pub const DESC_SECTOR: u64 = 512;
/// Sentinel fragment address for unloaded or absent references.
pub const INVALID_ADDR: u32 = u32::MAX;
pub const DEFAULT_ALLOC_SIZE: u32 = 512;

const MAGIC: [u8; 8] = *b"BRKNDB01";
const VERSION: u16 = 1;
// magic + version + allocsize + root addr/size + free-list count
const DESC_FIXED_SIZE: usize = 8 + 2 + 4 + 4 + 4 + 2;
const DESC_CRC_OFF: usize = DESC_SECTOR as usize - 4;
const FREE_ENTRY_SIZE: usize = 4 + 4;
pub(crate) const FREE_LIST_CAPACITY: usize = (DESC_CRC_OFF - DESC_FIXED_SIZE) / FREE_ENTRY_SIZE;

/// A file of fixed-size allocation fragments behind a descriptor sector.
///
/// Fragment address `a` refers to the `allocsize` bytes starting at file
/// offset `DESC_SECTOR + a * allocsize`. All page reads and writes move
/// whole fragments; the descriptor carries the root page reference and the
/// free list, guarded by a crc32.
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    pub path: PathBuf,
    pub allocsize: u32,
    root_addr: u32,
    root_size: u32,
    free: FreeList,
}

impl BlockFile {
    pub fn create<P: AsRef<Path>>(path: P, allocsize: u32) -> Result<Self, BrackenError> {
        if allocsize == 0 || !allocsize.is_power_of_two() {
            return Err(
                StorageError(format!("allocation size {allocsize} is not a power of two")).into(),
            );
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;
        let mut bf = Self {
            file,
            path: path.as_ref().to_path_buf(),
            allocsize,
            root_addr: INVALID_ADDR,
            root_size: 0,
            free: FreeList::new(),
        };
        bf.write_descriptor()?;
        Ok(bf)
    }

    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, BrackenError> {
        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut buf = vec![0u8; DESC_SECTOR as usize];
        file.seek(SeekFrom::Start(0))?;
        file.read_exact(&mut buf)?;

        let mut hasher = Hasher::new();
        hasher.update(&buf[..DESC_CRC_OFF]);
        let stored = LittleEndian::read_u32(&buf[DESC_CRC_OFF..]);
        if hasher.finalize() != stored {
            return Err(StorageError("descriptor sector checksum mismatch".into()).into());
        }

        let mut rdr = std::io::Cursor::new(&buf[..DESC_CRC_OFF]);
        let mut magic = [0u8; 8];
        rdr.read_exact(&mut magic)?;
        if magic != MAGIC {
            return Err(StorageError("bad magic, not a brackendb file".into()).into());
        }
        let version = rdr.read_u16::<LittleEndian>()?;
        if version != VERSION {
            return Err(StorageError(format!("unsupported file version {version}")).into());
        }
        let allocsize = rdr.read_u32::<LittleEndian>()?;
        if allocsize == 0 || !allocsize.is_power_of_two() {
            return Err(
                StorageError(format!("descriptor allocation size {allocsize} is invalid")).into(),
            );
        }
        let root_addr = rdr.read_u32::<LittleEndian>()?;
        let root_size = rdr.read_u32::<LittleEndian>()?;
        let count = rdr.read_u16::<LittleEndian>()? as usize;
        if count > FREE_LIST_CAPACITY {
            return Err(
                StorageError(format!("descriptor free-list count {count} is invalid")).into(),
            );
        }
        let mut free = FreeList::new();
        for _ in 0..count {
            let addr = rdr.read_u32::<LittleEndian>()?;
            let size = rdr.read_u32::<LittleEndian>()?;
            free.push(addr, size);
        }

        Ok(Self {
            file,
            path: path.as_ref().to_path_buf(),
            allocsize,
            root_addr,
            root_size,
            free,
        })
    }

    pub fn file_size(&self) -> Result<u64, BrackenError> {
        Ok(self.file.metadata()?.len())
    }

    pub fn body_size(&self) -> Result<u64, BrackenError> {
        Ok(self.file_size()?.saturating_sub(DESC_SECTOR))
    }

    pub fn total_frags(&self) -> Result<u64, BrackenError> {
        Ok(self.body_size()? / u64::from(self.allocsize))
    }

    fn frag_offset(&self, addr: u32) -> u64 {
        DESC_SECTOR + u64::from(addr) * u64::from(self.allocsize)
    }

    fn check_frag_io(&self, addr: u32, size: u32, what: &str) -> Result<(), BrackenError> {
        if size == 0 || size % self.allocsize != 0 {
            return Err(StorageError(format!(
                "{what} of {size} bytes at addr {addr} is not a whole number of fragments"
            ))
            .into());
        }
        if self.frag_offset(addr) + u64::from(size) > self.file_size()? {
            return Err(StorageError(format!(
                "{what} at addr {addr} references non-existent file pages"
            ))
            .into());
        }
        Ok(())
    }

    /// Synchronously read `size` bytes from fragment `addr`.
    pub fn read_frags(&mut self, addr: u32, size: u32) -> Result<Vec<u8>, BrackenError> {
        self.check_frag_io(addr, size, "read")?;
        let mut buf = vec![0u8; size as usize];
        self.file.seek(SeekFrom::Start(self.frag_offset(addr)))?;
        self.file.read_exact(&mut buf)?;
        Ok(buf)
    }

    pub fn write_frags(&mut self, addr: u32, data: &[u8]) -> Result<(), BrackenError> {
        self.check_frag_io(addr, data.len() as u32, "write")?;
        self.file.seek(SeekFrom::Start(self.frag_offset(addr)))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Extend the body by `size` bytes and return the address of the new
    /// fragments.
    pub fn alloc_frags(&mut self, size: u32) -> Result<u32, BrackenError> {
        if size == 0 || size % self.allocsize != 0 {
            return Err(StorageError(format!(
                "allocation of {size} bytes is not a whole number of fragments"
            ))
            .into());
        }
        let addr = self.total_frags()?;
        if addr > u64::from(u32::MAX - size / self.allocsize) {
            return Err(StorageError("file is full".into()).into());
        }
        let len = self.file_size()?;
        self.file.set_len(len + u64::from(size))?;
        Ok(addr as u32)
    }

    pub fn root_ref(&self) -> (u32, u32) {
        (self.root_addr, self.root_size)
    }

    pub fn set_root_ref(&mut self, addr: u32, size: u32) -> Result<(), BrackenError> {
        self.root_addr = addr;
        self.root_size = size;
        self.write_descriptor()
    }

    pub fn free_list(&self) -> &FreeList {
        &self.free
    }

    pub fn set_free_list(&mut self, free: FreeList) -> Result<(), BrackenError> {
        if free.len() > FREE_LIST_CAPACITY {
            return Err(StorageError(format!(
                "free list of {} entries exceeds descriptor capacity {FREE_LIST_CAPACITY}",
                free.len()
            ))
            .into());
        }
        self.free = free;
        self.write_descriptor()
    }

    pub fn sync_all(&mut self) -> Result<(), BrackenError> {
        self.file.sync_all()?;
        Ok(())
    }

    pub fn close(mut self) -> Result<(), BrackenError> {
        self.sync_all()
    }

    fn write_descriptor(&mut self) -> Result<(), BrackenError> {
        let mut buf = Vec::with_capacity(DESC_SECTOR as usize);
        buf.extend_from_slice(&MAGIC);
        buf.write_u16::<LittleEndian>(VERSION)?;
        buf.write_u32::<LittleEndian>(self.allocsize)?;
        buf.write_u32::<LittleEndian>(self.root_addr)?;
        buf.write_u32::<LittleEndian>(self.root_size)?;
        buf.write_u16::<LittleEndian>(self.free.len() as u16)?;
        for FreeEntry { addr, size } in &self.free {
            buf.write_u32::<LittleEndian>(*addr)?;
            buf.write_u32::<LittleEndian>(*size)?;
        }
        buf.resize(DESC_CRC_OFF, 0);

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;

        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&buf)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::fs::OpenOptions;
    use std::io::{Seek, SeekFrom, Write};

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn create_open_roundtrip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("blocks.bdb");

        let mut bf = BlockFile::create(&path, 512).unwrap();
        let addr = bf.alloc_frags(1024).unwrap();
        assert_eq!(addr, 0);
        bf.set_root_ref(0, 1024).unwrap();
        let mut free = FreeList::new();
        free.push(1, 512);
        bf.set_free_list(free.clone()).unwrap();
        bf.close().unwrap();

        let bf2 = BlockFile::open(&path).unwrap();
        assert_eq!(bf2.allocsize, 512);
        assert_eq!(bf2.root_ref(), (0, 1024));
        assert_eq!(bf2.free_list(), &free);
        assert_eq!(bf2.total_frags().unwrap(), 2);
    }

    #[test]
    fn allocsize_must_be_power_of_two() {
        let tmp = tempdir().unwrap();
        let err = BlockFile::create(tmp.path().join("bad.bdb"), 500).unwrap_err();
        assert!(err.to_string().contains("not a power of two"));
    }

    #[test]
    fn descriptor_corruption_detected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("corrupt.bdb");
        BlockFile::create(&path, 512).unwrap().close().unwrap();

        let mut fh = OpenOptions::new().write(true).open(&path).unwrap();
        fh.seek(SeekFrom::Start(9)).unwrap();
        fh.write_all(&[0xFF]).unwrap();
        drop(fh);

        let err = BlockFile::open(&path).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn read_past_end_rejected() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("short.bdb");
        let mut bf = BlockFile::create(&path, 512).unwrap();
        bf.alloc_frags(512).unwrap();

        let err = bf.read_frags(0, 1024).unwrap_err();
        assert!(err.to_string().contains("non-existent file pages"));

        let err = bf.read_frags(0, 100).unwrap_err();
        assert!(err.to_string().contains("whole number of fragments"));
    }

    #[test]
    fn frag_write_read_roundtrip() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("rw.bdb");
        let mut bf = BlockFile::create(&path, 512).unwrap();

        let a = bf.alloc_frags(512).unwrap();
        let b = bf.alloc_frags(1024).unwrap();
        assert_eq!((a, b), (0, 1));

        bf.write_frags(a, &[7u8; 512]).unwrap();
        bf.write_frags(b, &[9u8; 1024]).unwrap();
        assert_eq!(bf.read_frags(a, 512).unwrap(), vec![7u8; 512]);
        assert_eq!(bf.read_frags(b, 1024).unwrap(), vec![9u8; 1024]);
    }
}
