// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::PageInfo;
use crate::{
    coding::{Decode, DecodeError},
    stmt::Statement,
    Error, UserKey,
};
use byteorder::{BigEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::path::Path;
use xxhash_rust::xxh3::xxh3_64;

/// Block compression codec of run pages
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum CompressionType {
    /// No compression
    None,

    /// LZ4 block compression
    #[default]
    Lz4,
}

impl From<CompressionType> for u8 {
    fn from(value: CompressionType) -> Self {
        match value {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
        }
    }
}

impl TryFrom<u8> for CompressionType {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::None),
            1 => Ok(Self::Lz4),
            _ => Err(()),
        }
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}",
            match self {
                Self::None => "none",
                Self::Lz4 => "lz4",
            }
        )
    }
}

/// One decoded page of a run data file
///
/// The payload is the uncompressed page: rows encoded back to back, followed
/// by a dense row index (one `u32` offset per row) permitting row-wise
/// decoding without scanning.
pub struct Page {
    payload: Vec<u8>,
    row_offsets: Vec<u32>,
}

impl Page {
    /// Reads one page frame from the data file, verifies the checksum and
    /// decompresses the payload.
    pub fn from_file(
        path: &Path,
        info: &PageInfo,
        compression: CompressionType,
    ) -> crate::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        file.seek(SeekFrom::Start(info.offset))?;

        let expected_checksum = file.read_u64::<BigEndian>()?;

        let mut compressed = vec![0u8; info.size as usize];
        file.read_exact(&mut compressed)?;

        let got_checksum = xxh3_64(&compressed);
        if got_checksum != expected_checksum {
            return Err(Error::InvalidChecksum((got_checksum, expected_checksum)));
        }

        let payload = match compression {
            CompressionType::None => compressed,
            CompressionType::Lz4 => {
                lz4_flex::decompress(&compressed, info.unpacked_size as usize)
                    .map_err(|_| Error::Decompress)?
            }
        };

        Self::from_payload(payload, info)
    }

    /// Splits a decompressed payload into rows + row index.
    pub fn from_payload(payload: Vec<u8>, info: &PageInfo) -> crate::Result<Self> {
        let index_start = info.row_index_offset as usize;
        let index_len = (info.row_count as usize) * std::mem::size_of::<u32>();

        let index_bytes = payload
            .get(index_start..index_start + index_len)
            .ok_or(Error::Decode(DecodeError::InvalidHeader("page row index")))?;

        let mut row_offsets = Vec::with_capacity(info.row_count as usize);
        let mut cursor = Cursor::new(index_bytes);
        for _ in 0..info.row_count {
            row_offsets.push(cursor.read_u32::<BigEndian>().map_err(DecodeError::from)?);
        }

        Ok(Self {
            payload,
            row_offsets,
        })
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> u32 {
        #[allow(clippy::cast_possible_truncation)]
        {
            self.row_offsets.len() as u32
        }
    }

    /// Memory footprint, used as the page cache weight.
    #[must_use]
    pub fn weight(&self) -> u64 {
        (self.payload.len() + self.row_offsets.len() * std::mem::size_of::<u32>()) as u64
    }

    /// Decodes the row at `row_no`.
    pub fn row(&self, row_no: u32) -> crate::Result<Statement> {
        let offset = *self
            .row_offsets
            .get(row_no as usize)
            .ok_or(Error::Decode(DecodeError::InvalidHeader("row out of bounds")))?
            as usize;

        let bytes = self
            .payload
            .get(offset..)
            .ok_or(Error::Decode(DecodeError::InvalidHeader("row offset")))?;

        Ok(Statement::decode_from(&mut Cursor::new(bytes))?)
    }

    /// Decodes only the key of the row at `row_no`.
    pub fn row_key(&self, row_no: u32) -> crate::Result<UserKey> {
        self.row(row_no).map(|stmt| stmt.key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::coding::Encode;
    use test_log::test;

    fn build_payload(stmts: &[Statement]) -> (Vec<u8>, PageInfo) {
        let mut payload = vec![];
        let mut offsets = vec![];

        for stmt in stmts {
            #[allow(clippy::cast_possible_truncation)]
            offsets.push(payload.len() as u32);
            stmt.encode_into(&mut payload).unwrap();
        }

        #[allow(clippy::cast_possible_truncation)]
        let row_index_offset = payload.len() as u32;
        for offset in &offsets {
            payload.extend_from_slice(&offset.to_be_bytes());
        }

        #[allow(clippy::cast_possible_truncation)]
        let info = PageInfo {
            offset: 0,
            size: 0,
            unpacked_size: payload.len() as u32,
            row_count: stmts.len() as u32,
            min_key: stmts.first().unwrap().key.clone(),
            row_index_offset,
        };

        (payload, info)
    }

    #[test]
    fn page_row_access() {
        let stmts = vec![
            Statement::replace(*b"a", *b"1", 3),
            Statement::replace(*b"a", *b"0", 1),
            Statement::delete(*b"b", 2),
        ];
        let (payload, info) = build_payload(&stmts);
        let page = Page::from_payload(payload, &info).unwrap();

        assert_eq!(3, page.row_count());
        assert_eq!(stmts[0], page.row(0).unwrap());
        assert_eq!(stmts[2], page.row(2).unwrap());
        assert_eq!(&*page.row_key(1).unwrap(), b"a");
        assert!(page.row(3).is_err());
    }
}
