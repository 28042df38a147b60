// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{
    bloom::BloomFilter, CompressionType, PageInfo, RunInfo, DATA_FILE_MAGIC, FORMAT_VERSION,
    INDEX_FILE_MAGIC,
};
use crate::{
    coding::Encode,
    fault::{self, Fault},
    stmt::{Lsn, Statement},
    UserKey,
};
use byteorder::{BigEndian, WriteBytesExt};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use xxhash_rust::xxh3::xxh3_64;

/// Streams sorted statements into the two files of a new run
///
/// Statements must arrive in `(key asc, lsn desc)` order - the write
/// iterator produces exactly that. Rows are packed into pages of roughly
/// `page_size` bytes, each page compressed and checksummed independently.
pub struct RunWriter {
    run_id: crate::RunId,
    data_path: PathBuf,
    index_path: PathBuf,
    data_file: BufWriter<std::fs::File>,

    compression: CompressionType,
    page_size: u32,
    bloom_fpr: Option<f32>,

    offset: u64,
    pages: Vec<PageInfo>,

    page_buf: Vec<u8>,
    row_offsets: Vec<u32>,
    page_min_key: Option<UserKey>,

    key_hashes: Vec<(u64, u64)>,
    last_key: Option<UserKey>,

    row_count: u64,
    min_key: Option<UserKey>,
    max_key: Option<UserKey>,
    min_lsn: Lsn,
    max_lsn: Lsn,
}

impl RunWriter {
    /// Creates the data file (directories included) and positions the writer.
    pub fn new(
        run_id: crate::RunId,
        data_path: PathBuf,
        index_path: PathBuf,
        compression: CompressionType,
        page_size: u32,
        bloom_fpr: Option<f32>,
    ) -> crate::Result<Self> {
        if let Some(parent) = data_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut data_file = BufWriter::new(std::fs::File::create(&data_path)?);
        data_file.write_all(DATA_FILE_MAGIC)?;

        Ok(Self {
            run_id,
            data_path,
            index_path,
            data_file,
            compression,
            page_size,
            bloom_fpr,
            offset: DATA_FILE_MAGIC.len() as u64,
            pages: Vec::new(),
            page_buf: Vec::new(),
            row_offsets: Vec::new(),
            page_min_key: None,
            key_hashes: Vec::new(),
            last_key: None,
            row_count: 0,
            min_key: None,
            max_key: None,
            min_lsn: Lsn::MAX,
            max_lsn: -1,
        })
    }

    /// Appends one statement.
    pub fn push(&mut self, stmt: &Statement) -> crate::Result<()> {
        fault::check(Fault::RunWrite)?;

        debug_assert!(
            self.last_key.as_ref().is_none_or(|last| *last <= stmt.key),
            "rows must arrive in key order"
        );

        if self.page_min_key.is_none() {
            self.page_min_key = Some(stmt.key.clone());
        }
        if self.min_key.is_none() {
            self.min_key = Some(stmt.key.clone());
        }

        #[allow(clippy::cast_possible_truncation)]
        self.row_offsets.push(self.page_buf.len() as u32);
        stmt.encode_into(&mut self.page_buf)?;

        if self.last_key.as_ref() != Some(&stmt.key) {
            if self.bloom_fpr.is_some() {
                self.key_hashes.push(BloomFilter::hash_key(&stmt.key));
            }
            self.last_key = Some(stmt.key.clone());
        }
        self.max_key = Some(stmt.key.clone());

        self.row_count += 1;
        self.min_lsn = self.min_lsn.min(stmt.lsn);
        self.max_lsn = self.max_lsn.max(stmt.lsn);

        if self.page_buf.len() >= self.page_size as usize {
            self.flush_page()?;
        }

        Ok(())
    }

    fn flush_page(&mut self) -> crate::Result<()> {
        if self.row_offsets.is_empty() {
            return Ok(());
        }

        #[allow(clippy::cast_possible_truncation)]
        let row_index_offset = self.page_buf.len() as u32;
        for offset in &self.row_offsets {
            self.page_buf.extend_from_slice(&offset.to_be_bytes());
        }

        #[allow(clippy::cast_possible_truncation)]
        let unpacked_size = self.page_buf.len() as u32;

        let compressed = match self.compression {
            CompressionType::None => std::mem::take(&mut self.page_buf),
            CompressionType::Lz4 => {
                let compressed = lz4_flex::compress(&self.page_buf);
                self.page_buf.clear();
                compressed
            }
        };

        self.data_file
            .write_u64::<BigEndian>(xxh3_64(&compressed))?;
        self.data_file.write_all(&compressed)?;

        #[allow(clippy::expect_used)]
        let min_key = self
            .page_min_key
            .take()
            .expect("non-empty page has a min key");

        #[allow(clippy::cast_possible_truncation)]
        self.pages.push(PageInfo {
            offset: self.offset,
            size: compressed.len() as u32,
            unpacked_size,
            row_count: self.row_offsets.len() as u32,
            min_key,
            row_index_offset,
        });

        self.offset += 8 + compressed.len() as u64;
        self.row_offsets.clear();

        Ok(())
    }

    /// Flushes the tail page and writes the index file.
    ///
    /// Returns `None` if nothing was written: the data file is removed and
    /// no run comes to exist (a compaction can legitimately produce nothing).
    pub fn finish(mut self, dump_lsn: Lsn, dump_count: u32) -> crate::Result<Option<RunInfo>> {
        self.flush_page()?;

        if self.row_count == 0 {
            drop(self.data_file);
            std::fs::remove_file(&self.data_path)?;
            log::debug!("run {} came out empty, discarding", self.run_id);
            return Ok(None);
        }

        self.data_file.flush()?;
        self.data_file.get_ref().sync_all()?;

        let bloom = self.bloom_fpr.map(|fpr| {
            let mut filter = BloomFilter::with_fpr(self.key_hashes.len(), fpr);
            for hash in &self.key_hashes {
                filter.insert_hash(*hash);
            }
            filter
        });

        #[allow(clippy::expect_used)]
        let info = RunInfo {
            min_key: self.min_key.expect("non-empty run has keys"),
            max_key: self.max_key.expect("non-empty run has keys"),
            min_lsn: self.min_lsn,
            max_lsn: self.max_lsn,
            row_count: self.row_count,
            dump_lsn,
            dump_count,
            compression: self.compression,
            bloom,
            pages: self.pages,
        };

        let mut index_file = BufWriter::new(std::fs::File::create(&self.index_path)?);
        index_file.write_all(INDEX_FILE_MAGIC)?;
        index_file.write_u8(FORMAT_VERSION)?;
        index_file.write_i64::<BigEndian>(self.run_id)?;
        info.encode_into(&mut index_file)?;
        index_file.flush()?;
        index_file.get_ref().sync_all()?;

        log::debug!(
            "finished run {}: {} rows in {} pages",
            self.run_id,
            info.row_count,
            info.page_count(),
        );

        Ok(Some(info))
    }
}
