// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

//! Append-only metadata log directing range / run / slice lifecycle
//!
//! Every structural change of an LSM tree - a dump attaching slices, a
//! compaction swapping them, a range split - is appended as one atomic
//! batch. On startup the log is replayed into a recovery context from which
//! the live trees are rebuilt; a trailing batch without its commit marker is
//! discarded.

use crate::{
    bytes::Bytes,
    coding::{Decode, DecodeError, Encode, EncodeError},
    stmt::Lsn,
    Error, HashMap, IndexId, LsmId, RangeId, RunId, SliceId, SpaceId, UserKey,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use xxhash_rust::xxh3::xxh3_64;

const LOG_FILE_NAME: &str = "vylog";
const LOG_MAGIC: &[u8] = b"VNYL";

/// Batch terminator tag.
const TAG_COMMIT: u8 = 0xFF;

/// One record of the metadata log
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LogRecord {
    /// A new LSM tree is being built; directs orphan cleanup if the create
    /// never lands.
    PrepareLsm {
        lsm_id: LsmId,
        space_id: SpaceId,
        index_id: IndexId,
        group_id: u32,
        key_def: Bytes,
    },

    /// The LSM tree is complete.
    CreateLsm {
        lsm_id: LsmId,
        space_id: SpaceId,
        index_id: IndexId,
        create_lsn: Lsn,
    },

    DropLsm {
        lsm_id: LsmId,
        drop_lsn: Lsn,
    },

    /// The tree's on-disk state now covers everything up to `dump_lsn`.
    DumpLsm {
        lsm_id: LsmId,
        dump_lsn: Lsn,
    },

    InsertRange {
        lsm_id: LsmId,
        range_id: RangeId,
        begin: Option<UserKey>,
        end: Option<UserKey>,
    },

    DeleteRange {
        range_id: RangeId,
    },

    /// A run id was allocated; its files may exist and must be cleaned up
    /// unless a `CreateRun` follows.
    PrepareRun {
        lsm_id: LsmId,
        run_id: RunId,
    },

    CreateRun {
        lsm_id: LsmId,
        run_id: RunId,
        dump_lsn: Lsn,
        dump_count: u32,
    },

    /// The run is unused; its files may be removed once the checkpoint at
    /// `gc_lsn` is gone (0 means immediately).
    DropRun {
        run_id: RunId,
        gc_lsn: Lsn,
    },

    InsertSlice {
        range_id: RangeId,
        run_id: RunId,
        slice_id: SliceId,
        begin: Option<UserKey>,
        end: Option<UserKey>,
    },

    DeleteSlice {
        slice_id: SliceId,
    },
}

fn write_opt_key<W: Write>(writer: &mut W, key: Option<&UserKey>) -> Result<(), EncodeError> {
    match key {
        Some(key) => {
            writer.write_u8(1)?;

            #[allow(clippy::cast_possible_truncation)]
            writer.write_u16::<BigEndian>(key.len() as u16)?;
            writer.write_all(key)?;
        }
        None => writer.write_u8(0)?,
    }
    Ok(())
}

fn read_opt_key<R: Read>(reader: &mut R) -> Result<Option<UserKey>, DecodeError> {
    if reader.read_u8()? == 0 {
        return Ok(None);
    }
    let len = reader.read_u16::<BigEndian>()?;
    Ok(Some(UserKey::from_reader(reader, len.into())?))
}

impl Encode for LogRecord {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        match self {
            Self::PrepareLsm {
                lsm_id,
                space_id,
                index_id,
                group_id,
                key_def,
            } => {
                writer.write_u8(0)?;
                writer.write_i64::<BigEndian>(*lsm_id)?;
                writer.write_u32::<BigEndian>(*space_id)?;
                writer.write_u32::<BigEndian>(*index_id)?;
                writer.write_u32::<BigEndian>(*group_id)?;

                #[allow(clippy::cast_possible_truncation)]
                writer.write_u32::<BigEndian>(key_def.len() as u32)?;
                writer.write_all(key_def)?;
            }
            Self::CreateLsm {
                lsm_id,
                space_id,
                index_id,
                create_lsn,
            } => {
                writer.write_u8(1)?;
                writer.write_i64::<BigEndian>(*lsm_id)?;
                writer.write_u32::<BigEndian>(*space_id)?;
                writer.write_u32::<BigEndian>(*index_id)?;
                writer.write_i64::<BigEndian>(*create_lsn)?;
            }
            Self::DropLsm { lsm_id, drop_lsn } => {
                writer.write_u8(2)?;
                writer.write_i64::<BigEndian>(*lsm_id)?;
                writer.write_i64::<BigEndian>(*drop_lsn)?;
            }
            Self::DumpLsm { lsm_id, dump_lsn } => {
                writer.write_u8(3)?;
                writer.write_i64::<BigEndian>(*lsm_id)?;
                writer.write_i64::<BigEndian>(*dump_lsn)?;
            }
            Self::InsertRange {
                lsm_id,
                range_id,
                begin,
                end,
            } => {
                writer.write_u8(4)?;
                writer.write_i64::<BigEndian>(*lsm_id)?;
                writer.write_i64::<BigEndian>(*range_id)?;
                write_opt_key(writer, begin.as_ref())?;
                write_opt_key(writer, end.as_ref())?;
            }
            Self::DeleteRange { range_id } => {
                writer.write_u8(5)?;
                writer.write_i64::<BigEndian>(*range_id)?;
            }
            Self::PrepareRun { lsm_id, run_id } => {
                writer.write_u8(6)?;
                writer.write_i64::<BigEndian>(*lsm_id)?;
                writer.write_i64::<BigEndian>(*run_id)?;
            }
            Self::CreateRun {
                lsm_id,
                run_id,
                dump_lsn,
                dump_count,
            } => {
                writer.write_u8(7)?;
                writer.write_i64::<BigEndian>(*lsm_id)?;
                writer.write_i64::<BigEndian>(*run_id)?;
                writer.write_i64::<BigEndian>(*dump_lsn)?;
                writer.write_u32::<BigEndian>(*dump_count)?;
            }
            Self::DropRun { run_id, gc_lsn } => {
                writer.write_u8(8)?;
                writer.write_i64::<BigEndian>(*run_id)?;
                writer.write_i64::<BigEndian>(*gc_lsn)?;
            }
            Self::InsertSlice {
                range_id,
                run_id,
                slice_id,
                begin,
                end,
            } => {
                writer.write_u8(9)?;
                writer.write_i64::<BigEndian>(*range_id)?;
                writer.write_i64::<BigEndian>(*run_id)?;
                writer.write_i64::<BigEndian>(*slice_id)?;
                write_opt_key(writer, begin.as_ref())?;
                write_opt_key(writer, end.as_ref())?;
            }
            Self::DeleteSlice { slice_id } => {
                writer.write_u8(10)?;
                writer.write_i64::<BigEndian>(*slice_id)?;
            }
        }
        Ok(())
    }
}

impl Decode for LogRecord {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let tag = reader.read_u8()?;
        Ok(match tag {
            0 => {
                let lsm_id = reader.read_i64::<BigEndian>()?;
                let space_id = reader.read_u32::<BigEndian>()?;
                let index_id = reader.read_u32::<BigEndian>()?;
                let group_id = reader.read_u32::<BigEndian>()?;
                let len = reader.read_u32::<BigEndian>()?;
                let key_def = Bytes::from_reader(reader, len as usize)?;
                Self::PrepareLsm {
                    lsm_id,
                    space_id,
                    index_id,
                    group_id,
                    key_def,
                }
            }
            1 => Self::CreateLsm {
                lsm_id: reader.read_i64::<BigEndian>()?,
                space_id: reader.read_u32::<BigEndian>()?,
                index_id: reader.read_u32::<BigEndian>()?,
                create_lsn: reader.read_i64::<BigEndian>()?,
            },
            2 => Self::DropLsm {
                lsm_id: reader.read_i64::<BigEndian>()?,
                drop_lsn: reader.read_i64::<BigEndian>()?,
            },
            3 => Self::DumpLsm {
                lsm_id: reader.read_i64::<BigEndian>()?,
                dump_lsn: reader.read_i64::<BigEndian>()?,
            },
            4 => Self::InsertRange {
                lsm_id: reader.read_i64::<BigEndian>()?,
                range_id: reader.read_i64::<BigEndian>()?,
                begin: read_opt_key(reader)?,
                end: read_opt_key(reader)?,
            },
            5 => Self::DeleteRange {
                range_id: reader.read_i64::<BigEndian>()?,
            },
            6 => Self::PrepareRun {
                lsm_id: reader.read_i64::<BigEndian>()?,
                run_id: reader.read_i64::<BigEndian>()?,
            },
            7 => Self::CreateRun {
                lsm_id: reader.read_i64::<BigEndian>()?,
                run_id: reader.read_i64::<BigEndian>()?,
                dump_lsn: reader.read_i64::<BigEndian>()?,
                dump_count: reader.read_u32::<BigEndian>()?,
            },
            8 => Self::DropRun {
                run_id: reader.read_i64::<BigEndian>()?,
                gc_lsn: reader.read_i64::<BigEndian>()?,
            },
            9 => Self::InsertSlice {
                range_id: reader.read_i64::<BigEndian>()?,
                run_id: reader.read_i64::<BigEndian>()?,
                slice_id: reader.read_i64::<BigEndian>()?,
                begin: read_opt_key(reader)?,
                end: read_opt_key(reader)?,
            },
            10 => Self::DeleteSlice {
                slice_id: reader.read_i64::<BigEndian>()?,
            },
            _ => return Err(DecodeError::InvalidTag(("LogRecord", tag))),
        })
    }
}

/// The metadata log writer
pub struct VyLog {
    path: PathBuf,
    file: Mutex<BufWriter<std::fs::File>>,
}

impl VyLog {
    /// Path of the log file under the environment base directory.
    #[must_use]
    pub fn log_path(base: &Path) -> PathBuf {
        base.join(LOG_FILE_NAME)
    }

    /// Opens the log for appending, creating it (and the base directory)
    /// when missing.
    pub fn open(base: &Path) -> crate::Result<Self> {
        std::fs::create_dir_all(base)?;
        let path = Self::log_path(base);

        let is_new = !path.exists();
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        if is_new {
            file.write_all(LOG_MAGIC)?;
            file.sync_all()?;
        }

        Ok(Self {
            path,
            file: Mutex::new(BufWriter::new(file)),
        })
    }

    /// Appends a batch of records as one atomic transaction.
    #[allow(clippy::expect_used)]
    pub fn commit(&self, records: Vec<LogRecord>) -> crate::Result<()> {
        let mut file = self.file.lock().expect("lock is poisoned");

        for record in &records {
            let payload = record.encode_into_vec();

            #[allow(clippy::cast_possible_truncation)]
            file.write_u32::<BigEndian>(payload.len() as u32)?;
            file.write_u64::<BigEndian>(xxh3_64(&payload))?;
            file.write_all(&payload)?;
        }

        // Commit marker: an empty frame with the commit tag checksum slot.
        file.write_u32::<BigEndian>(0)?;
        file.write_u64::<BigEndian>(u64::from(TAG_COMMIT))?;

        file.flush()?;
        file.get_ref().sync_all()?;

        log::trace!("committed {} metadata records", records.len());
        Ok(())
    }

    /// Appends a single record as its own transaction.
    pub fn append(&self, record: LogRecord) -> crate::Result<()> {
        self.commit(vec![record])
    }

    /// Rewrites the log to contain exactly `snapshot`, atomically replacing
    /// the old file. Used after checkpoint collection to shed dead records.
    #[allow(clippy::expect_used)]
    pub fn rotate(&self, snapshot: Vec<LogRecord>) -> crate::Result<()> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| Error::InvalidMetaLog("log path has no parent".into()))?;

        let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
        tmp.write_all(LOG_MAGIC)?;

        for record in &snapshot {
            let payload = record.encode_into_vec();

            #[allow(clippy::cast_possible_truncation)]
            tmp.write_u32::<BigEndian>(payload.len() as u32)?;
            tmp.write_u64::<BigEndian>(xxh3_64(&payload))?;
            tmp.write_all(&payload)?;
        }
        tmp.write_u32::<BigEndian>(0)?;
        tmp.write_u64::<BigEndian>(u64::from(TAG_COMMIT))?;
        tmp.as_file().sync_all()?;

        let mut file = self.file.lock().expect("lock is poisoned");
        tmp.persist(&self.path)
            .map_err(|e| Error::Io(e.error))?;

        let handle = std::fs::OpenOptions::new().append(true).open(&self.path)?;
        *file = BufWriter::new(handle);

        log::info!("rotated metadata log ({} records)", snapshot.len());
        Ok(())
    }

    /// Replays the log into batches of records, discarding an uncommitted
    /// tail.
    pub fn replay(base: &Path) -> crate::Result<Vec<LogRecord>> {
        let path = Self::log_path(base);
        if !path.exists() {
            return Ok(Vec::new());
        }

        let data = std::fs::read(&path)?;
        let mut reader = &data[..];

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic).map_err(DecodeError::from)?;
        if magic != LOG_MAGIC {
            return Err(Error::InvalidMetaLog("bad log magic".into()));
        }

        let mut committed = Vec::new();
        let mut pending = Vec::new();

        loop {
            let Ok(len) = reader.read_u32::<BigEndian>() else {
                break;
            };
            let Ok(checksum) = reader.read_u64::<BigEndian>() else {
                break;
            };

            if len == 0 && checksum == u64::from(TAG_COMMIT) {
                committed.append(&mut pending);
                continue;
            }

            if reader.len() < len as usize {
                break;
            }

            #[allow(clippy::indexing_slicing)]
            let payload = &reader[..len as usize];
            #[allow(clippy::indexing_slicing)]
            {
                reader = &reader[len as usize..];
            }

            if xxh3_64(payload) != checksum {
                log::warn!("metadata log: bad record checksum, discarding tail");
                break;
            }

            let mut cursor = payload;
            pending.push(LogRecord::decode_from(&mut cursor)?);
        }

        if !pending.is_empty() {
            log::warn!(
                "metadata log: discarding {} uncommitted trailing records",
                pending.len(),
            );
        }

        Ok(committed)
    }
}

// --- Recovery context ---------------------------------------------------

/// State of a run in the recovery context.
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) enum RunState {
    Prepared,
    Created { dump_lsn: Lsn, dump_count: u32 },
    Dropped { gc_lsn: Lsn },
}

#[derive(Clone, Debug)]
pub(crate) struct SliceRecord {
    pub slice_id: SliceId,
    pub run_id: RunId,
    pub begin: Option<UserKey>,
    pub end: Option<UserKey>,
}

#[derive(Clone, Debug)]
pub(crate) struct RangeRecord {
    pub range_id: RangeId,
    pub begin: Option<UserKey>,
    pub end: Option<UserKey>,

    /// In log order; the live stack is the reverse (newest record first).
    pub slices: Vec<SliceRecord>,
}

#[derive(Clone, Debug)]
pub(crate) struct LsmRecord {
    pub lsm_id: LsmId,
    pub space_id: SpaceId,
    pub index_id: IndexId,
    pub group_id: u32,
    pub create_lsn: Option<Lsn>,
    pub drop_lsn: Option<Lsn>,
    pub dump_lsn: Lsn,
    pub ranges: HashMap<RangeId, RangeRecord>,
    pub runs: HashMap<RunId, RunState>,
}

/// Replayed metadata state, keyed by ids
#[derive(Default)]
pub(crate) struct Recovery {
    pub lsms: HashMap<LsmId, LsmRecord>,

    /// Owning LSM of each range.
    range_owner: HashMap<RangeId, LsmId>,

    /// Owning `(lsm, range)` of each slice.
    slice_owner: HashMap<SliceId, (LsmId, RangeId)>,

    pub max_lsm_id: i64,
    pub max_range_id: i64,
    pub max_run_id: i64,
    pub max_slice_id: i64,
}

impl Recovery {
    /// Builds the context from the committed record stream.
    pub fn from_records(records: Vec<LogRecord>) -> crate::Result<Self> {
        let mut ctx = Self::default();
        for record in records {
            ctx.apply(record)?;
        }
        Ok(ctx)
    }

    fn lsm_mut(&mut self, lsm_id: LsmId) -> crate::Result<&mut LsmRecord> {
        self.lsms
            .get_mut(&lsm_id)
            .ok_or_else(|| Error::InvalidMetaLog(format!("unknown lsm {lsm_id}")))
    }

    #[allow(clippy::too_many_lines)]
    fn apply(&mut self, record: LogRecord) -> crate::Result<()> {
        match record {
            LogRecord::PrepareLsm {
                lsm_id,
                space_id,
                index_id,
                group_id,
                key_def: _,
            } => {
                self.max_lsm_id = self.max_lsm_id.max(lsm_id);
                self.lsms.insert(
                    lsm_id,
                    LsmRecord {
                        lsm_id,
                        space_id,
                        index_id,
                        group_id,
                        create_lsn: None,
                        drop_lsn: None,
                        dump_lsn: -1,
                        ranges: HashMap::default(),
                        runs: HashMap::default(),
                    },
                );
            }
            LogRecord::CreateLsm {
                lsm_id,
                space_id,
                index_id,
                create_lsn,
            } => {
                let lsm = self.lsm_mut(lsm_id)?;
                if lsm.space_id != space_id || lsm.index_id != index_id {
                    return Err(Error::InvalidMetaLog(format!(
                        "lsm {lsm_id} created under a different identity"
                    )));
                }
                lsm.create_lsn = Some(create_lsn);
            }
            LogRecord::DropLsm { lsm_id, drop_lsn } => {
                self.lsm_mut(lsm_id)?.drop_lsn = Some(drop_lsn);
            }
            LogRecord::DumpLsm { lsm_id, dump_lsn } => {
                let lsm = self.lsm_mut(lsm_id)?;
                lsm.dump_lsn = lsm.dump_lsn.max(dump_lsn);
            }
            LogRecord::InsertRange {
                lsm_id,
                range_id,
                begin,
                end,
            } => {
                self.max_range_id = self.max_range_id.max(range_id);
                self.lsm_mut(lsm_id)?.ranges.insert(
                    range_id,
                    RangeRecord {
                        range_id,
                        begin,
                        end,
                        slices: Vec::new(),
                    },
                );
                self.range_owner.insert(range_id, lsm_id);
            }
            LogRecord::DeleteRange { range_id } => {
                let lsm_id = self.range_owner.remove(&range_id).ok_or_else(|| {
                    Error::InvalidMetaLog(format!("unknown range {range_id}"))
                })?;
                if let Some(range) = self.lsm_mut(lsm_id)?.ranges.remove(&range_id) {
                    for slice in range.slices {
                        self.slice_owner.remove(&slice.slice_id);
                    }
                }
            }
            LogRecord::PrepareRun { lsm_id, run_id } => {
                self.max_run_id = self.max_run_id.max(run_id);
                self.lsm_mut(lsm_id)?.runs.insert(run_id, RunState::Prepared);
            }
            LogRecord::CreateRun {
                lsm_id,
                run_id,
                dump_lsn,
                dump_count,
            } => {
                self.max_run_id = self.max_run_id.max(run_id);
                self.lsm_mut(lsm_id)?.runs.insert(
                    run_id,
                    RunState::Created {
                        dump_lsn,
                        dump_count,
                    },
                );
            }
            LogRecord::DropRun { run_id, gc_lsn } => {
                let owner = self
                    .lsms
                    .values_mut()
                    .find(|lsm| lsm.runs.contains_key(&run_id));
                match owner {
                    Some(lsm) => {
                        lsm.runs.insert(run_id, RunState::Dropped { gc_lsn });
                    }
                    None => {
                        // A checkpoint rotation can shed the preparation
                        // record of a task that was in flight; its drop is
                        // then a no-op.
                        log::warn!("drop of unknown run {run_id}, ignoring");
                    }
                }
            }
            LogRecord::InsertSlice {
                range_id,
                run_id,
                slice_id,
                begin,
                end,
            } => {
                self.max_slice_id = self.max_slice_id.max(slice_id);
                let lsm_id = *self.range_owner.get(&range_id).ok_or_else(|| {
                    Error::InvalidMetaLog(format!("slice {slice_id} in unknown range {range_id}"))
                })?;

                let lsm = self.lsm_mut(lsm_id)?;
                match lsm.runs.get(&run_id) {
                    Some(RunState::Created { .. }) => {}
                    _ => {
                        return Err(Error::InvalidMetaLog(format!(
                            "slice {slice_id} references missing run {run_id}"
                        )));
                    }
                }

                #[allow(clippy::expect_used)]
                lsm.ranges
                    .get_mut(&range_id)
                    .expect("owner index is consistent")
                    .slices
                    .push(SliceRecord {
                        slice_id,
                        run_id,
                        begin,
                        end,
                    });
                self.slice_owner.insert(slice_id, (lsm_id, range_id));
            }
            LogRecord::DeleteSlice { slice_id } => {
                let (lsm_id, range_id) =
                    self.slice_owner.remove(&slice_id).ok_or_else(|| {
                        Error::InvalidMetaLog(format!("unknown slice {slice_id}"))
                    })?;
                if let Some(range) = self.lsm_mut(lsm_id)?.ranges.get_mut(&range_id) {
                    range.slices.retain(|s| s.slice_id != slice_id);
                }
            }
        }
        Ok(())
    }

    /// Validates that the ranges of one LSM tile the key space exactly.
    pub fn validate_lsm(lsm: &LsmRecord) -> crate::Result<()> {
        let mut ranges: Vec<&RangeRecord> = lsm.ranges.values().collect();
        if ranges.is_empty() {
            return Err(Error::InvalidMetaLog(format!(
                "lsm {}: no ranges recovered",
                lsm.lsm_id
            )));
        }

        ranges.sort_by(|a, b| match (&a.begin, &b.begin) {
            (None, None) => std::cmp::Ordering::Equal,
            (None, Some(_)) => std::cmp::Ordering::Less,
            (Some(_), None) => std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => x.cmp(y),
        });

        #[allow(clippy::expect_used)]
        let first = ranges.first().expect("checked non-empty");
        if first.begin.is_some() {
            return Err(Error::InvalidMetaLog(format!(
                "lsm {}: leftmost range has a finite begin",
                lsm.lsm_id
            )));
        }

        #[allow(clippy::expect_used)]
        let last = ranges.last().expect("checked non-empty");
        if last.end.is_some() {
            return Err(Error::InvalidMetaLog(format!(
                "lsm {}: rightmost range has a finite end",
                lsm.lsm_id
            )));
        }

        for pair in ranges.windows(2) {
            #[allow(clippy::indexing_slicing)]
            let (a, b) = (&pair[0], &pair[1]);
            if a.end != b.begin {
                return Err(Error::InvalidMetaLog(format!(
                    "lsm {}: ranges {} and {} do not tile the key space",
                    lsm.lsm_id, a.range_id, b.range_id
                )));
            }
        }

        for range in &ranges {
            if let (Some(begin), Some(end)) = (&range.begin, &range.end) {
                if begin >= end {
                    return Err(Error::InvalidMetaLog(format!(
                        "lsm {}: range {} is degenerate",
                        lsm.lsm_id, range.range_id
                    )));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn key(i: u32) -> UserKey {
        UserKey::from(i.to_be_bytes())
    }

    fn prepare_create(lsm_id: LsmId) -> Vec<LogRecord> {
        vec![
            LogRecord::PrepareLsm {
                lsm_id,
                space_id: 512,
                index_id: 0,
                group_id: 0,
                key_def: Bytes::empty(),
            },
            LogRecord::CreateLsm {
                lsm_id,
                space_id: 512,
                index_id: 0,
                create_lsn: 1,
            },
            LogRecord::InsertRange {
                lsm_id,
                range_id: 1,
                begin: None,
                end: None,
            },
        ]
    }

    #[test]
    fn vylog_commit_replay_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let vylog = VyLog::open(dir.path()).unwrap();

        vylog.commit(prepare_create(1)).unwrap();
        vylog
            .commit(vec![
                LogRecord::PrepareRun { lsm_id: 1, run_id: 5 },
                LogRecord::CreateRun {
                    lsm_id: 1,
                    run_id: 5,
                    dump_lsn: 10,
                    dump_count: 1,
                },
                LogRecord::InsertSlice {
                    range_id: 1,
                    run_id: 5,
                    slice_id: 7,
                    begin: None,
                    end: Some(key(10)),
                },
            ])
            .unwrap();

        let records = VyLog::replay(dir.path()).unwrap();
        assert_eq!(6, records.len());

        let ctx = Recovery::from_records(records).unwrap();
        let lsm = ctx.lsms.get(&1).unwrap();
        assert_eq!(Some(1), lsm.create_lsn);
        assert_eq!(1, lsm.ranges.len());
        assert_eq!(
            1,
            lsm.ranges.get(&1).unwrap().slices.len(),
        );
        assert_eq!(5, ctx.max_run_id);
        assert_eq!(7, ctx.max_slice_id);
    }

    #[test]
    fn vylog_uncommitted_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        {
            let vylog = VyLog::open(dir.path()).unwrap();
            vylog.commit(prepare_create(1)).unwrap();
        }

        // Append a record frame without a commit marker.
        {
            use std::io::Write;
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(VyLog::log_path(dir.path()))
                .unwrap();
            let payload =
                LogRecord::DeleteRange { range_id: 1 }.encode_into_vec();

            #[allow(clippy::cast_possible_truncation)]
            file.write_all(&(payload.len() as u32).to_be_bytes()).unwrap();
            file.write_all(&xxh3_64(&payload).to_be_bytes()).unwrap();
            file.write_all(&payload).unwrap();
        }

        let records = VyLog::replay(dir.path()).unwrap();
        assert_eq!(3, records.len(), "uncommitted tail must not replay");
    }

    #[test]
    fn recovery_rejects_slice_without_run() {
        let mut records = prepare_create(1);
        records.push(LogRecord::InsertSlice {
            range_id: 1,
            run_id: 99,
            slice_id: 1,
            begin: None,
            end: None,
        });

        assert!(matches!(
            Recovery::from_records(records),
            Err(Error::InvalidMetaLog(_))
        ));
    }

    #[test]
    fn recovery_validates_range_cover() {
        // Gap between 10 and 20.
        let mut records = vec![
            LogRecord::PrepareLsm {
                lsm_id: 1,
                space_id: 512,
                index_id: 0,
                group_id: 0,
                key_def: Bytes::empty(),
            },
            LogRecord::CreateLsm {
                lsm_id: 1,
                space_id: 512,
                index_id: 0,
                create_lsn: 1,
            },
        ];
        records.push(LogRecord::InsertRange {
            lsm_id: 1,
            range_id: 1,
            begin: None,
            end: Some(key(10)),
        });
        records.push(LogRecord::InsertRange {
            lsm_id: 1,
            range_id: 2,
            begin: Some(key(20)),
            end: None,
        });

        let ctx = Recovery::from_records(records).unwrap();
        let lsm = ctx.lsms.get(&1).unwrap();
        assert!(matches!(
            Recovery::validate_lsm(lsm),
            Err(Error::InvalidMetaLog(_))
        ));
    }

    #[test]
    fn vylog_rotate_replaces_contents() {
        let dir = tempfile::tempdir().unwrap();
        let vylog = VyLog::open(dir.path()).unwrap();
        vylog.commit(prepare_create(1)).unwrap();
        vylog.commit(prepare_create(2)).unwrap();

        vylog.rotate(prepare_create(3)).unwrap();

        let records = VyLog::replay(dir.path()).unwrap();
        assert_eq!(3, records.len());

        // And the log stays appendable after rotation.
        vylog
            .append(LogRecord::DumpLsm {
                lsm_id: 3,
                dump_lsn: 5,
            })
            .unwrap();
        assert_eq!(4, VyLog::replay(dir.path()).unwrap().len());
    }
}
