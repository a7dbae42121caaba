//! Memory-mapped file I/O for weight loading.
//!
//! Model artifacts are mapped read-only; tensor bytes are sliced straight out
//! of the mapped pages and decoded once at load time.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::error::{Result, WeightError};

/// A memory-mapped file handle.
///
/// The mapped region remains valid for the lifetime of this struct.
pub struct MappedFile {
    mmap: Mmap,
}

impl MappedFile {
    /// Map a file into memory.
    ///
    /// The file must not be modified while mapped. Model artifacts are
    /// treated as read-only for the lifetime of the process.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            WeightError::Format(format!("failed to open {}: {e}", path.display()))
        })?;

        // Safety: the mapping is read-only and the artifact is not rewritten while loaded.
        let mmap = unsafe { Mmap::map(&file)? };

        Ok(MappedFile { mmap })
    }

    /// Get the full mapped data as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Get a subslice at the given offset and length.
    pub fn slice(&self, offset: usize, len: usize) -> Result<&[u8]> {
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= self.mmap.len())
            .ok_or_else(|| {
                WeightError::Format(format!(
                    "slice at {offset} of {len} bytes exceeds file size {}",
                    self.mmap.len()
                ))
            })?;
        Ok(&self.mmap[offset..end])
    }

    /// Total file size in bytes.
    pub fn size(&self) -> usize {
        self.mmap.len()
    }
}
