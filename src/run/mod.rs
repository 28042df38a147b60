// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

pub mod bloom;
mod iter;
mod page;
mod page_cache;
mod slice;
mod writer;

pub use iter::{RunIterator, SliceStream};
pub use page::{CompressionType, Page};
pub use page_cache::PageCache;
pub use slice::RunSlice;
pub use writer::RunWriter;

use crate::{
    bytes::UserKey,
    coding::{Decode, DecodeError, Encode, EncodeError},
    stmt::Lsn,
    IndexId, RunId, SpaceId,
};
use bloom::BloomFilter;
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Magic bytes of a run index file
pub const INDEX_FILE_MAGIC: &[u8] = b"VNYX";

/// Magic bytes of a run data file
pub const DATA_FILE_MAGIC: &[u8] = b"VNYD";

const FORMAT_VERSION: u8 = 1;

/// Metadata of one page of a run data file
#[derive(Clone, Debug)]
pub struct PageInfo {
    /// File offset of the page frame
    pub offset: u64,

    /// Compressed payload size in bytes
    pub size: u32,

    /// Uncompressed payload size in bytes
    pub unpacked_size: u32,

    /// Number of rows
    pub row_count: u32,

    /// Key of the first row
    pub min_key: UserKey,

    /// Offset of the row index inside the uncompressed payload
    pub row_index_offset: u32,
}

impl Encode for PageInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u64::<BigEndian>(self.offset)?;
        writer.write_u32::<BigEndian>(self.size)?;
        writer.write_u32::<BigEndian>(self.unpacked_size)?;
        writer.write_u32::<BigEndian>(self.row_count)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.min_key.len() as u16)?;
        writer.write_all(&self.min_key)?;

        writer.write_u32::<BigEndian>(self.row_index_offset)?;
        Ok(())
    }
}

impl Decode for PageInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let offset = reader.read_u64::<BigEndian>()?;
        let size = reader.read_u32::<BigEndian>()?;
        let unpacked_size = reader.read_u32::<BigEndian>()?;
        let row_count = reader.read_u32::<BigEndian>()?;

        let key_len = reader.read_u16::<BigEndian>()?;
        let min_key = UserKey::from_reader(reader, key_len.into())?;

        let row_index_offset = reader.read_u32::<BigEndian>()?;

        Ok(Self {
            offset,
            size,
            unpacked_size,
            row_count,
            min_key,
            row_index_offset,
        })
    }
}

/// Metadata of a run, persisted in the index file
#[derive(Clone, Debug)]
pub struct RunInfo {
    pub min_key: UserKey,
    pub max_key: UserKey,
    pub min_lsn: Lsn,
    pub max_lsn: Lsn,
    pub row_count: u64,

    /// Max LSN this run's data covers; everything at or below has been
    /// persisted by the dump that created it.
    pub dump_lsn: Lsn,

    /// Number of dumps the run's data went through. A freshly dumped run has
    /// 1; a compacted run inherits the sum of its inputs.
    pub dump_count: u32,

    pub compression: CompressionType,
    pub bloom: Option<BloomFilter>,
    pub pages: Vec<PageInfo>,
}

impl RunInfo {
    #[must_use]
    pub fn page_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.pages.len() as u32
        }
    }

    /// Total compressed payload bytes across pages.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.pages.iter().map(|p| u64::from(p.size)).sum()
    }
}

impl Encode for RunInfo {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.min_key.len() as u16)?;
        writer.write_all(&self.min_key)?;

        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.max_key.len() as u16)?;
        writer.write_all(&self.max_key)?;

        writer.write_i64::<BigEndian>(self.min_lsn)?;
        writer.write_i64::<BigEndian>(self.max_lsn)?;
        writer.write_u64::<BigEndian>(self.row_count)?;
        writer.write_i64::<BigEndian>(self.dump_lsn)?;
        writer.write_u32::<BigEndian>(self.dump_count)?;
        writer.write_u8(u8::from(self.compression))?;

        match &self.bloom {
            Some(bloom) => {
                writer.write_u8(1)?;
                bloom.encode_into(writer)?;
            }
            None => writer.write_u8(0)?,
        }

        writer.write_u32::<BigEndian>(self.page_count())?;
        for page in &self.pages {
            page.encode_into(writer)?;
        }

        Ok(())
    }
}

impl Decode for RunInfo {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let key_len = reader.read_u16::<BigEndian>()?;
        let min_key = UserKey::from_reader(reader, key_len.into())?;

        let key_len = reader.read_u16::<BigEndian>()?;
        let max_key = UserKey::from_reader(reader, key_len.into())?;

        let min_lsn = reader.read_i64::<BigEndian>()?;
        let max_lsn = reader.read_i64::<BigEndian>()?;
        let row_count = reader.read_u64::<BigEndian>()?;
        let dump_lsn = reader.read_i64::<BigEndian>()?;
        let dump_count = reader.read_u32::<BigEndian>()?;

        let compression = reader.read_u8()?;
        let compression: CompressionType = compression
            .try_into()
            .map_err(|()| DecodeError::InvalidTag(("CompressionType", compression)))?;

        let bloom = if reader.read_u8()? == 1 {
            Some(BloomFilter::decode_from(reader)?)
        } else {
            None
        };

        let page_count = reader.read_u32::<BigEndian>()?;
        let mut pages = Vec::with_capacity(page_count as usize);
        for _ in 0..page_count {
            pages.push(PageInfo::decode_from(reader)?);
        }

        Ok(Self {
            min_key,
            max_key,
            min_lsn,
            max_lsn,
            row_count,
            dump_lsn,
            dump_count,
            compression,
            bloom,
            pages,
        })
    }
}

/// Immutable on-disk sorted file of statements
///
/// Shared ownership through `Arc`: the LSM holds one reference, every slice
/// referencing the run holds another. The files are unlinked only after the
/// metadata log confirmed the drop and the last reference is gone.
pub struct Run {
    pub(crate) id: RunId,
    pub(crate) info: RunInfo,
    data_path: PathBuf,
    index_path: PathBuf,

    /// Attached, not-yet-retired slices referencing this run.
    pub(crate) live_slices: slice::SliceCount,
}

impl Run {
    /// Path of the data file of a run.
    #[must_use]
    pub fn data_path(base: &Path, space_id: SpaceId, index_id: IndexId, run_id: RunId) -> PathBuf {
        base.join(space_id.to_string())
            .join(index_id.to_string())
            .join(format!("{run_id:020}.run"))
    }

    /// Path of the index file of a run.
    #[must_use]
    pub fn index_path(base: &Path, space_id: SpaceId, index_id: IndexId, run_id: RunId) -> PathBuf {
        base.join(space_id.to_string())
            .join(index_id.to_string())
            .join(format!("{run_id:020}.index"))
    }

    #[must_use]
    pub fn new(id: RunId, info: RunInfo, data_path: PathBuf, index_path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            id,
            info,
            data_path,
            index_path,
            live_slices: slice::SliceCount(std::sync::atomic::AtomicUsize::new(0)),
        })
    }

    /// Number of slices currently referencing this run. A published run with
    /// zero live slices is unused and may be dropped.
    #[must_use]
    pub fn live_slice_count(&self) -> usize {
        self.live_slices
            .0
            .load(std::sync::atomic::Ordering::Acquire)
    }

    /// Loads a run by reading and verifying its index file.
    pub fn open(
        base: &Path,
        space_id: SpaceId,
        index_id: IndexId,
        run_id: RunId,
    ) -> crate::Result<Arc<Self>> {
        let index_path = Self::index_path(base, space_id, index_id, run_id);
        let data_path = Self::data_path(base, space_id, index_id, run_id);

        let mut reader = std::io::BufReader::new(std::fs::File::open(&index_path)?);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if magic != INDEX_FILE_MAGIC {
            return Err(DecodeError::InvalidHeader("run index file").into());
        }

        let version = reader.read_u8()?;
        if version != FORMAT_VERSION {
            return Err(DecodeError::InvalidHeader("run format version").into());
        }

        let stored_id = reader.read_i64::<BigEndian>()?;
        if stored_id != run_id {
            return Err(DecodeError::InvalidHeader("run id mismatch").into());
        }

        let info = RunInfo::decode_from(&mut reader)?;

        log::debug!(
            "opened run {run_id} ({} pages, {} rows)",
            info.page_count(),
            info.row_count,
        );

        Ok(Self::new(run_id, info, data_path, index_path))
    }

    #[must_use]
    pub fn id(&self) -> RunId {
        self.id
    }

    #[must_use]
    pub fn info(&self) -> &RunInfo {
        &self.info
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.info.pages.is_empty()
    }

    /// Page metadata by page number.
    #[must_use]
    pub fn page_info(&self, page_no: u32) -> Option<&PageInfo> {
        self.info.pages.get(page_no as usize)
    }

    /// Reads and decodes one page from disk.
    pub fn read_page(&self, page_no: u32) -> crate::Result<Page> {
        let page = self
            .page_info(page_no)
            .ok_or(crate::Error::Decode(DecodeError::InvalidHeader(
                "page out of bounds",
            )))?;

        Page::from_file(&self.data_path, page, self.info.compression)
    }

    /// Removes both files of the run from disk.
    pub fn remove_files(&self) -> crate::Result<()> {
        log::debug!("removing files of run {}", self.id);

        for path in [&self.data_path, &self.index_path] {
            if let Err(e) = std::fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    return Err(e.into());
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for Run {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "Run#{}({} rows, {} pages)",
            self.id,
            self.info.row_count,
            self.info.page_count()
        )
    }
}
