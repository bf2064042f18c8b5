//! Memory-mapped container file
//!
//! The container owns the backing file, its shared mapping, and the cached
//! header. Records are appended after the 64-byte header; the header's
//! logical length marks the end of committed data.
//!
//! Write ordering for every append:
//! 1. Copy the encoded record into the mapping past the logical length
//! 2. Publish the new logical length, sequence, and header checksum
//!
//! A crash between the two leaves the record outside the logical length,
//! so replay never sees it.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use memmap2::MmapMut;
use tracing::{debug, info, warn};

use crate::error::{KvError, KvResult};
use crate::format::{valid_prefix_end, FileHeader, HeaderCheck, FORMAT_VERSION, HEADER_SIZE};
use crate::init::page_size;

/// A container file mapped read-write into this process.
pub struct Container {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
    /// Last header published or observed by this handle
    header: FileHeader,
    /// Size of an empty container; clear truncates back to it
    min_size: u64,
}

impl Container {
    /// Open or create the container at `path`.
    ///
    /// Missing or blank files are bootstrapped with an empty header. A header
    /// with a bad checksum is rebuilt by scanning valid records from the start.
    pub fn open(path: &Path, min_size: u64) -> KvResult<Self> {
        let min_size = round_to_page(min_size.max(HEADER_SIZE as u64));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| KvError::io(path, e, "Failed to open container"))?;

        let len = file
            .metadata()
            .map_err(|e| KvError::io(path, e, "Failed to stat container"))?
            .len();

        let bootstrap = len < HEADER_SIZE as u64;
        if bootstrap {
            if len > 0 {
                warn!(path = %path.display(), len, "container shorter than its header, reinitializing");
            }
            file.set_len(min_size)
                .map_err(|e| KvError::io(path, e, "Failed to size new container"))?;
        } else if len % page_size() != 0 {
            file.set_len(round_to_page(len))
                .map_err(|e| KvError::io(path, e, "Failed to page-align container"))?;
        }

        let mmap = map(&file, path)?;
        let allocated = mmap.len() as u64;
        let mut container = Self {
            path: path.to_path_buf(),
            file,
            mmap,
            header: FileHeader::empty(allocated),
            min_size,
        };

        if bootstrap {
            container.mmap[HEADER_SIZE..].fill(0);
            container.write_header();
            debug!(path = %path.display(), allocated, "bootstrapped empty container");
            return Ok(container);
        }

        match FileHeader::parse(&container.mmap) {
            HeaderCheck::Valid(header) => {
                container.header = header;
                if header.logical_len < HEADER_SIZE as u64 || header.logical_len > allocated {
                    warn!(path = %path.display(), logical = header.logical_len, "logical length out of bounds, rescanning");
                    container.recover_by_scan();
                } else if header.allocated != allocated {
                    container.header.allocated = allocated;
                    container.write_header();
                }
            }
            HeaderCheck::Blank => container.recover_by_scan(),
            HeaderCheck::ChecksumMismatch { expected, actual } => {
                warn!(
                    path = %path.display(),
                    "header checksum mismatch (expected 0x{:08x}, got 0x{:08x}), rescanning",
                    expected, actual
                );
                container.recover_by_scan();
            }
            HeaderCheck::BadMagic(found) => {
                return Err(KvError::CorruptHeader {
                    path: path.to_path_buf(),
                    reason: format!(
                        "magic bytes not found: {:02x}{:02x}{:02x}{:02x}",
                        found[0], found[1], found[2], found[3]
                    ),
                });
            }
            HeaderCheck::Unsupported(found) => {
                return Err(KvError::UnsupportedVersion {
                    path: path.to_path_buf(),
                    found,
                    supported: FORMAT_VERSION,
                });
            }
        }

        Ok(container)
    }

    /// Rebuild the header from whatever records still validate.
    fn recover_by_scan(&mut self) {
        let end = valid_prefix_end(&self.mmap, HEADER_SIZE);
        self.header = FileHeader {
            version: FORMAT_VERSION,
            allocated: self.mmap.len() as u64,
            logical_len: end as u64,
            sequence: self.header.sequence.wrapping_add(1),
            generation: self.header.generation.wrapping_add(1),
        };
        self.write_header();
        info!(path = %self.path.display(), logical = end, "recovered container header by scan");
    }

    fn write_header(&mut self) {
        self.mmap[..HEADER_SIZE].copy_from_slice(&self.header.to_bytes());
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// End of committed records.
    pub fn logical_len(&self) -> u64 {
        self.header.logical_len
    }

    /// Bytes of backing storage currently allocated.
    pub fn allocated_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Size of a freshly cleared container.
    #[cfg(test)]
    fn min_size(&self) -> u64 {
        self.min_size
    }

    /// Committed bytes, header included. Record offsets index into this slice.
    pub fn committed(&self) -> &[u8] {
        &self.mmap[..self.header.logical_len as usize]
    }

    pub fn slice(&self, offset: u64, len: usize) -> &[u8] {
        let start = offset as usize;
        &self.mmap[start..start + len]
    }

    /// Whether `additional` bytes fit without growing.
    pub fn has_room(&self, additional: u64) -> bool {
        self.header.logical_len + additional <= self.allocated_size()
    }

    /// Grow the file so that `additional` more bytes fit past the logical length.
    ///
    /// The new size is the larger of the requirement and the current size times
    /// `growth_factor`, rounded up to a page. Existing bytes never move, so
    /// record offsets held by the index remain valid. Returns whether it grew.
    pub fn ensure_capacity(&mut self, additional: u64, growth_factor: u64) -> KvResult<bool> {
        if self.has_room(additional) {
            return Ok(false);
        }
        let needed = self.header.logical_len + additional;
        let target = round_to_page(needed.max(self.allocated_size().saturating_mul(growth_factor)));
        let before = self.allocated_size();
        self.resize(target)?;
        info!(path = %self.path.display(), from = before, to = target, "grew container");
        Ok(true)
    }

    fn resize(&mut self, new_len: u64) -> KvResult<()> {
        self.file
            .set_len(new_len)
            .map_err(|e| KvError::io(&self.path, e, "Failed to resize container"))?;
        self.mmap = map(&self.file, &self.path)?;
        self.header.allocated = self.mmap.len() as u64;
        self.write_header();
        Ok(())
    }

    /// Append one encoded record and commit it. Returns the record's offset.
    ///
    /// The caller must have reserved room with `ensure_capacity`.
    pub fn append(&mut self, record: &[u8]) -> KvResult<u64> {
        let offset = self.header.logical_len;
        if !self.has_room(record.len() as u64) {
            return Err(KvError::invalid(
                "record",
                format!("{} bytes do not fit at offset {} of {}", record.len(), offset, self.allocated_size()),
            ));
        }

        let start = offset as usize;
        self.mmap[start..start + record.len()].copy_from_slice(record);

        self.header.logical_len += record.len() as u64;
        self.header.sequence = self.header.sequence.wrapping_add(1);
        self.write_header();
        Ok(offset)
    }

    /// Move the logical end back to `len`, dropping everything after it.
    pub fn set_logical_len(&mut self, len: u64) {
        self.header.logical_len = len.clamp(HEADER_SIZE as u64, self.allocated_size());
        self.header.sequence = self.header.sequence.wrapping_add(1);
        self.write_header();
    }

    /// Re-read the header another process may have published.
    pub fn reload_header(&mut self) -> KvResult<()> {
        match FileHeader::parse(&self.mmap) {
            HeaderCheck::Valid(header) => {
                self.header = header;
                Ok(())
            }
            other => Err(KvError::CorruptHeader {
                path: self.path.clone(),
                reason: format!("header changed underneath this handle: {:?}", other),
            }),
        }
    }

    /// Reload the header and remap if another process resized the file.
    ///
    /// Covers growth as well as a sibling's clear, which shrinks the file.
    /// The header lives in the first page, which every mapping covers.
    pub fn remap_if_grown(&mut self) -> KvResult<bool> {
        self.reload_header()?;
        if self.header.allocated == self.allocated_size() {
            return Ok(false);
        }
        let before = self.allocated_size();
        self.mmap = map(&self.file, &self.path)?;
        self.reload_header()?;
        debug!(path = %self.path.display(), from = before, to = self.allocated_size(), "remapped container");
        Ok(true)
    }

    /// Replace all records with `records`, bumping the generation.
    ///
    /// Used by compaction; stale bytes past the new logical end are zeroed.
    pub fn rewrite(&mut self, records: &[u8]) -> KvResult<()> {
        let new_len = (HEADER_SIZE + records.len()) as u64;
        if new_len > self.allocated_size() {
            self.resize(round_to_page(new_len))?;
        }

        let old_len = self.header.logical_len as usize;
        let end = new_len as usize;
        self.mmap[HEADER_SIZE..end].copy_from_slice(records);
        if old_len > end {
            self.mmap[end..old_len].fill(0);
        }

        self.header.logical_len = new_len;
        self.header.sequence = self.header.sequence.wrapping_add(1);
        self.header.generation = self.header.generation.wrapping_add(1);
        self.write_header();
        Ok(())
    }

    /// Drop every record and shrink the file back to its minimum size.
    pub fn truncate_to_header(&mut self) -> KvResult<()> {
        self.file
            .set_len(self.min_size)
            .map_err(|e| KvError::io(&self.path, e, "Failed to truncate container"))?;
        self.mmap = map(&self.file, &self.path)?;
        self.mmap[HEADER_SIZE..].fill(0);

        self.header = FileHeader {
            version: FORMAT_VERSION,
            allocated: self.mmap.len() as u64,
            logical_len: HEADER_SIZE as u64,
            sequence: self.header.sequence.wrapping_add(1),
            generation: self.header.generation.wrapping_add(1),
        };
        self.write_header();
        Ok(())
    }

    /// msync the mapping.
    pub fn flush(&self) -> KvResult<()> {
        self.mmap
            .flush()
            .map_err(|e| KvError::io(&self.path, e, "Failed to flush container"))
    }
}

fn map(file: &File, path: &Path) -> KvResult<MmapMut> {
    // SAFETY: other processes may write the file concurrently. Every access
    // to mapped bytes happens under the coordinator lock, and bounds come
    // from a checksummed header re-read after each lock acquisition.
    unsafe { MmapMut::map_mut(file) }.map_err(|e| KvError::io(path, e, "Failed to map container"))
}

pub(crate) fn round_to_page(len: u64) -> u64 {
    let page = page_size();
    len.div_ceil(page).max(1) * page
}
