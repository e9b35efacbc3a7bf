//! IO spaces
//!
//! An IO space is a bit-addressable byte stream identified by a non-zero
//! `int<32>` id and a `scheme://` handler string. The table owns every open
//! space and tracks the current one; the VM passes ids around as plain
//! integer values and never looks inside a handler.
//!
//! Supported schemes:
//! - `mem://NAME` — growable in-memory buffer, write extends.
//! - `file://PATH` — a file on disk, created if opened for writing.
//! - `sub://ID/BASE/SIZE/NAME` — a window into another space; BASE and
//!   SIZE are byte counts in decimal or `0x` hex.
//!
//! Reads and writes below byte granularity go through [`IosTable::read_bits`]
//! and [`IosTable::write_bits`], which pull the covering bytes and use the
//! [`crate::bits`] codec.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use crate::bits::{self, Endian};

/// Open for reading.
pub const IOS_READ: u32 = 1 << 0;
/// Open for writing.
pub const IOS_WRITE: u32 = 1 << 1;

#[derive(Debug)]
pub enum IosError {
    /// Handler string is malformed or names an unsupported scheme.
    BadHandler(String),
    /// No space with this id is open.
    NoSuchSpace(i32),
    /// Access past the end of the space.
    Eof,
    /// Write to a space opened read-only.
    ReadOnly(i32),
    /// Underlying file error.
    Io(std::io::Error),
}

impl fmt::Display for IosError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IosError::BadHandler(h) => write!(f, "bad IO space handler '{}'", h),
            IosError::NoSuchSpace(id) => write!(f, "no IO space with id {}", id),
            IosError::Eof => write!(f, "access past end of IO space"),
            IosError::ReadOnly(id) => write!(f, "IO space {} is read-only", id),
            IosError::Io(e) => write!(f, "IO space error: {}", e),
        }
    }
}

impl std::error::Error for IosError {}

impl From<std::io::Error> for IosError {
    fn from(e: std::io::Error) -> Self {
        IosError::Io(e)
    }
}

/// Byte-stream behaviour of a concrete space.
pub trait IoSpace {
    /// Current size in bytes.
    fn size(&self) -> u64;

    /// Read `buf.len()` bytes starting at `off`.
    fn pread(&mut self, buf: &mut [u8], off: u64) -> Result<(), IosError>;

    /// Write `buf` starting at `off`.
    fn pwrite(&mut self, buf: &[u8], off: u64) -> Result<(), IosError>;

    fn flush(&mut self) -> Result<(), IosError> {
        Ok(())
    }
}

/// Growable in-memory space.
struct MemIos {
    data: Vec<u8>,
}

impl IoSpace for MemIos {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn pread(&mut self, buf: &mut [u8], off: u64) -> Result<(), IosError> {
        let end = off
            .checked_add(buf.len() as u64)
            .ok_or(IosError::Eof)?;
        if end > self.data.len() as u64 {
            return Err(IosError::Eof);
        }
        buf.copy_from_slice(&self.data[off as usize..end as usize]);
        Ok(())
    }

    fn pwrite(&mut self, buf: &[u8], off: u64) -> Result<(), IosError> {
        let end = off
            .checked_add(buf.len() as u64)
            .ok_or(IosError::Eof)? as usize;
        if end > self.data.len() {
            self.data.resize(end, 0);
        }
        self.data[off as usize..end].copy_from_slice(buf);
        Ok(())
    }
}

/// A file on disk.
struct FileIos {
    file: File,
}

impl IoSpace for FileIos {
    fn size(&self) -> u64 {
        self.file.metadata().map(|m| m.len()).unwrap_or(0)
    }

    fn pread(&mut self, buf: &mut [u8], off: u64) -> Result<(), IosError> {
        self.file.seek(SeekFrom::Start(off))?;
        self.file.read_exact(buf).map_err(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                IosError::Eof
            } else {
                IosError::Io(e)
            }
        })
    }

    fn pwrite(&mut self, buf: &[u8], off: u64) -> Result<(), IosError> {
        self.file.seek(SeekFrom::Start(off))?;
        self.file.write_all(buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), IosError> {
        self.file.flush()?;
        Ok(())
    }
}

enum Backing {
    Mem(MemIos),
    File(FileIos),
    /// Window into another space: accesses translate by `base` and are
    /// clipped to `size`, both in bytes.
    Sub { parent: i32, base: u64, size: u64 },
}

struct Space {
    id: i32,
    handler: String,
    flags: u32,
    backing: Backing,
}

/// Registry of open IO spaces.
pub struct IosTable {
    spaces: Vec<Space>,
    next_id: i32,
    cur: Option<i32>,
}

impl IosTable {
    pub fn new() -> Self {
        IosTable {
            spaces: Vec::new(),
            next_id: 1,
            cur: None,
        }
    }

    /// Open a space from a `scheme://` handler. If `set_cur` is given the
    /// new space becomes current. Returns its id.
    pub fn open(&mut self, handler: &str, flags: u32, set_cur: bool) -> Result<i32, IosError> {
        let backing = self.make_backing(handler, flags)?;
        let id = self.next_id;
        self.next_id += 1;
        self.spaces.push(Space {
            id,
            handler: handler.to_string(),
            flags,
            backing,
        });
        if set_cur || self.cur.is_none() {
            self.cur = Some(id);
        }
        Ok(id)
    }

    fn make_backing(&mut self, handler: &str, flags: u32) -> Result<Backing, IosError> {
        if let Some(_name) = handler.strip_prefix("mem://") {
            return Ok(Backing::Mem(MemIos { data: Vec::new() }));
        }
        if let Some(path) = handler.strip_prefix("file://") {
            let file = OpenOptions::new()
                .read(true)
                .write(flags & IOS_WRITE != 0)
                .create(flags & IOS_WRITE != 0)
                .open(path)?;
            return Ok(Backing::File(FileIos { file }));
        }
        if let Some(rest) = handler.strip_prefix("sub://") {
            let mut parts = rest.splitn(4, '/');
            let parent = parts
                .next()
                .and_then(|s| s.parse::<i32>().ok())
                .ok_or_else(|| IosError::BadHandler(handler.to_string()))?;
            let base = parts
                .next()
                .and_then(parse_u64)
                .ok_or_else(|| IosError::BadHandler(handler.to_string()))?;
            let size = parts
                .next()
                .and_then(parse_u64)
                .ok_or_else(|| IosError::BadHandler(handler.to_string()))?;
            // The window must fit in the parent as it exists now.
            let psize = self.size(parent)?;
            if base + size > psize {
                return Err(IosError::Eof);
            }
            return Ok(Backing::Sub { parent, base, size });
        }
        Err(IosError::BadHandler(handler.to_string()))
    }

    pub fn close(&mut self, id: i32) -> Result<(), IosError> {
        let idx = self.index_of(id)?;
        self.spaces.remove(idx);
        if self.cur == Some(id) {
            self.cur = self.spaces.first().map(|s| s.id);
        }
        Ok(())
    }

    /// Id of the current space, if any.
    pub fn cur(&self) -> Option<i32> {
        self.cur
    }

    pub fn set_cur(&mut self, id: i32) -> Result<(), IosError> {
        self.index_of(id)?;
        self.cur = Some(id);
        Ok(())
    }

    /// Find a space by its handler string.
    pub fn search(&self, handler: &str) -> Option<i32> {
        self.spaces
            .iter()
            .find(|s| s.handler == handler)
            .map(|s| s.id)
    }

    pub fn handler(&self, id: i32) -> Result<&str, IosError> {
        let idx = self.index_of(id)?;
        Ok(&self.spaces[idx].handler)
    }

    pub fn exists(&self, id: i32) -> bool {
        self.index_of(id).is_ok()
    }

    /// Size of the space in bytes.
    pub fn size(&mut self, id: i32) -> Result<u64, IosError> {
        let idx = self.index_of(id)?;
        match &mut self.spaces[idx].backing {
            Backing::Mem(m) => Ok(m.size()),
            Backing::File(f) => Ok(f.size()),
            Backing::Sub { size, .. } => Ok(*size),
        }
    }

    pub fn pread(&mut self, id: i32, buf: &mut [u8], off: u64) -> Result<(), IosError> {
        let idx = self.index_of(id)?;
        match &mut self.spaces[idx].backing {
            Backing::Mem(m) => m.pread(buf, off),
            Backing::File(f) => f.pread(buf, off),
            Backing::Sub { parent, base, size } => {
                if off + buf.len() as u64 > *size {
                    return Err(IosError::Eof);
                }
                let (parent, base) = (*parent, *base);
                self.pread(parent, buf, base + off)
            }
        }
    }

    pub fn pwrite(&mut self, id: i32, buf: &[u8], off: u64) -> Result<(), IosError> {
        let idx = self.index_of(id)?;
        if self.spaces[idx].flags & IOS_WRITE == 0 {
            return Err(IosError::ReadOnly(id));
        }
        match &mut self.spaces[idx].backing {
            Backing::Mem(m) => m.pwrite(buf, off),
            Backing::File(f) => f.pwrite(buf, off),
            Backing::Sub { parent, base, size } => {
                if off + buf.len() as u64 > *size {
                    return Err(IosError::Eof);
                }
                let (parent, base) = (*parent, *base);
                self.pwrite(parent, buf, base + off)
            }
        }
    }

    /// Read `nbits` (1..=64) starting at absolute bit offset `bit_off`.
    pub fn read_bits(
        &mut self,
        id: i32,
        bit_off: u64,
        nbits: u32,
        endian: Endian,
    ) -> Result<u64, IosError> {
        let first = bit_off / 8;
        let last = (bit_off + nbits as u64 + 7) / 8;
        let mut buf = vec![0u8; (last - first) as usize];
        self.pread(id, &mut buf, first)?;
        Ok(bits::extract(&buf, bit_off % 8, nbits, endian))
    }

    /// Write the low `nbits` of `value` starting at bit offset `bit_off`,
    /// preserving neighbouring bits.
    pub fn write_bits(
        &mut self,
        id: i32,
        bit_off: u64,
        nbits: u32,
        endian: Endian,
        value: u64,
    ) -> Result<(), IosError> {
        let first = bit_off / 8;
        let last = (bit_off + nbits as u64 + 7) / 8;
        let mut buf = vec![0u8; (last - first) as usize];
        // Unaligned writes need the surrounding bits; a fresh mem space or
        // a write extending the space reads as zeroes.
        if self.pread(id, &mut buf, first).is_err() {
            for b in buf.iter_mut() {
                *b = 0;
            }
        }
        bits::insert(&mut buf, bit_off % 8, nbits, endian, value);
        self.pwrite(id, &buf, first)
    }

    fn index_of(&self, id: i32) -> Result<usize, IosError> {
        self.spaces
            .iter()
            .position(|s| s.id == id)
            .ok_or(IosError::NoSuchSpace(id))
    }
}

impl Default for IosTable {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_u64(s: &str) -> Option<u64> {
    if let Some(hex) = s.strip_prefix("0x") {
        u64::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[test]
    fn test_mem_open_read_write() {
        let mut t = IosTable::new();
        let id = t.open("mem://scratch", IOS_READ | IOS_WRITE, true).unwrap();
        assert_eq!(t.cur(), Some(id));
        assert_eq!(t.handler(id).unwrap(), "mem://scratch");

        t.pwrite(id, &[1, 2, 3], 0).unwrap();
        let mut buf = [0u8; 3];
        t.pread(id, &mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(t.size(id).unwrap(), 3);
    }

    #[test]
    fn test_mem_read_past_end() {
        let mut t = IosTable::new();
        let id = t.open("mem://m", IOS_READ | IOS_WRITE, true).unwrap();
        let mut buf = [0u8; 1];
        assert!(matches!(t.pread(id, &mut buf, 0), Err(IosError::Eof)));
    }

    #[test]
    fn test_read_only_space_rejects_writes() {
        let mut t = IosTable::new();
        let id = t.open("mem://ro", IOS_READ, true).unwrap();
        assert!(matches!(
            t.pwrite(id, &[0], 0),
            Err(IosError::ReadOnly(_))
        ));
    }

    #[test]
    fn test_bad_scheme() {
        let mut t = IosTable::new();
        assert!(matches!(
            t.open("nbd://localhost", IOS_READ, false),
            Err(IosError::BadHandler(_))
        ));
    }

    #[test]
    fn test_search_and_close() {
        let mut t = IosTable::new();
        let a = t.open("mem://a", IOS_READ | IOS_WRITE, true).unwrap();
        let b = t.open("mem://b", IOS_READ | IOS_WRITE, false).unwrap();
        assert_eq!(t.search("mem://b"), Some(b));
        assert_eq!(t.cur(), Some(a));

        t.close(a).unwrap();
        assert_eq!(t.search("mem://a"), None);
        // Current falls back to some remaining space.
        assert_eq!(t.cur(), Some(b));
    }

    #[test]
    fn test_bit_level_roundtrip() {
        let mut t = IosTable::new();
        let id = t.open("mem://bits", IOS_READ | IOS_WRITE, true).unwrap();
        t.pwrite(id, &[0x01, 0x02], 0).unwrap();

        assert_eq!(t.read_bits(id, 0, 8, Endian::Big).unwrap(), 0x01);
        assert_eq!(t.read_bits(id, 8, 8, Endian::Big).unwrap(), 0x02);
        assert_eq!(t.read_bits(id, 0, 16, Endian::Little).unwrap(), 0x0201);

        t.write_bits(id, 4, 4, Endian::Big, 0xf).unwrap();
        let mut buf = [0u8; 1];
        t.pread(id, &mut buf, 0).unwrap();
        assert_eq!(buf[0], 0x0f);
    }

    #[test]
    fn test_sub_window() {
        let mut t = IosTable::new();
        let base = t.open("mem://base", IOS_READ | IOS_WRITE, true).unwrap();
        t.pwrite(base, &[0xaa, 0xbb, 0xcc, 0xdd], 0).unwrap();

        let handler = format!("sub://{}/1/2/win", base);
        let sub = t.open(&handler, IOS_READ | IOS_WRITE, false).unwrap();
        assert_eq!(t.size(sub).unwrap(), 2);

        let mut buf = [0u8; 2];
        t.pread(sub, &mut buf, 0).unwrap();
        assert_eq!(buf, [0xbb, 0xcc]);

        // Writes land in the parent, clipped to the window.
        t.pwrite(sub, &[0x11], 1).unwrap();
        let mut buf = [0u8; 4];
        t.pread(base, &mut buf, 0).unwrap();
        assert_eq!(buf, [0xaa, 0xbb, 0x11, 0xdd]);
        assert!(matches!(t.pwrite(sub, &[0], 2), Err(IosError::Eof)));
    }

    #[test]
    fn test_file_space() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(&[9, 8, 7]).unwrap();
        f.flush().unwrap();

        let handler = format!("file://{}", f.path().display());
        let mut t = IosTable::new();
        let id = t.open(&handler, IOS_READ, true).unwrap();
        assert_eq!(t.size(id).unwrap(), 3);
        let mut buf = [0u8; 2];
        t.pread(id, &mut buf, 1).unwrap();
        assert_eq!(buf, [8, 7]);
    }
}
