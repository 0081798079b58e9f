// DataSource trait: abstraction over random-access byte sources

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{ErrorKind, EvalError};

/// Random-access byte source a template is executed against
pub trait DataSource {
    /// Fill `buf` with the bytes starting at `offset`.
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), EvalError>;

    /// Total size of the data in bytes
    fn size(&self) -> u64;

    /// Read `size` bytes starting at `offset` into a new buffer.
    fn read_bytes(&self, offset: u64, size: u64) -> Result<Vec<u8>, EvalError> {
        let mut buf = vec![0u8; size as usize];
        self.read_into(offset, &mut buf)?;
        Ok(buf)
    }
}

/// Bounds-check `offset..offset+len` against `data` and return the slice.
fn checked_slice(data: &[u8], offset: u64, len: usize) -> Result<&[u8], EvalError> {
    let start = offset as usize;
    match start.checked_add(len) {
        Some(end) if offset <= usize::MAX as u64 && end <= data.len() => Ok(&data[start..end]),
        _ => Err(ErrorKind::ReadOutOfBounds {
            offset,
            size: len as u64,
            len: data.len() as u64,
        }
        .into()),
    }
}

/// DataSource backed by a byte slice
pub struct SliceDataSource<'a> {
    data: &'a [u8],
}

impl<'a> SliceDataSource<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }
}

impl DataSource for SliceDataSource<'_> {
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), EvalError> {
        buf.copy_from_slice(checked_slice(self.data, offset, buf.len())?);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }
}

/// DataSource backed by a read-only memory map of a file
pub struct MmapDataSource {
    map: Option<Mmap>,
}

impl MmapDataSource {
    /// Map the file at `path`. Empty files are represented without a mapping.
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path.as_ref())?;
        if file.metadata()?.len() == 0 {
            return Ok(Self { map: None });
        }
        // SAFETY: the mapping is read-only; concurrent external truncation of
        // the file is outside what the engine can guard against.
        let map = unsafe { Mmap::map(&file)? };
        Ok(Self { map: Some(map) })
    }

    fn bytes(&self) -> &[u8] {
        self.map.as_deref().unwrap_or(&[])
    }
}

impl DataSource for MmapDataSource {
    fn read_into(&self, offset: u64, buf: &mut [u8]) -> Result<(), EvalError> {
        buf.copy_from_slice(checked_slice(self.bytes(), offset, buf.len())?);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.bytes().len() as u64
    }
}
