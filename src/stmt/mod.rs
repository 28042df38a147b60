// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

mod upsert;

pub use upsert::{apply_upsert, UpsertOp, UpsertOps};

use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    UserKey, UserValue,
};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use varint_rs::{VarintReader, VarintWriter};

/// Log sequence number - a monotonically increasing commit identifier
///
/// A statement with a higher LSN shadows a statement with the same key and a
/// lower LSN. This enables MVCC. Stale versions are lazily garbage-collected
/// during compaction.
pub type Lsn = i64;

/// Upper bound for LSNs assigned by commits.
///
/// Prepared-but-uncommitted statements carry `MAX_LSN + psn` so they order
/// after every committed statement until the final LSN replaces it.
pub const MAX_LSN: Lsn = i64::MAX / 2;

/// The statement left secondary indexes requiring a deferred purge.
///
/// Set on a REPLACE or DELETE written to a primary index without deleting the
/// overwritten tuple from secondary indexes. Primary-index compaction emits
/// the purge through the deferred DELETE handler.
pub const STMT_DEFERRED_DELETE: u8 = 1 << 0;

/// Number of accumulated UPSERTs for one key that triggers the squash hook.
pub const UPSERT_THRESHOLD: u8 = 128;

/// Statement type
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StmtKind {
    /// First write of a key (no older version exists)
    Insert,

    /// Unconditional write of a key
    Replace,

    /// Tombstone
    Delete,

    /// Update-or-insert; carries an operation list resolved at read or
    /// compaction time against the latest prior version
    Upsert,
}

impl StmtKind {
    /// Returns `true` if a statement of this type ends a key's history
    /// (everything older is shadowed).
    #[must_use]
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Upsert)
    }
}

impl TryFrom<u8> for StmtKind {
    type Error = ();

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Insert),
            1 => Ok(Self::Replace),
            2 => Ok(Self::Delete),
            3 => Ok(Self::Upsert),
            _ => Err(()),
        }
    }
}

impl From<StmtKind> for u8 {
    fn from(value: StmtKind) -> Self {
        match value {
            StmtKind::Insert => 0,
            StmtKind::Replace => 1,
            StmtKind::Delete => 2,
            StmtKind::Upsert => 3,
        }
    }
}

/// A typed, versioned record of one write to one key
///
/// Cloning is cheap: key, value and operation list are shared.
#[derive(Clone, Eq)]
pub struct Statement {
    /// Key bytes, compared bytewise
    pub key: UserKey,

    /// Value bytes; empty for DELETE. For UPSERT this is the value used
    /// when no older version exists.
    pub value: UserValue,

    /// Statement type
    pub kind: StmtKind,

    /// Commit order; `MAX_LSN + psn` while prepared
    pub lsn: Lsn,

    /// Flag bits, see [`STMT_DEFERRED_DELETE`]
    pub flags: u8,

    /// Operation list of an UPSERT
    pub ops: Option<UpsertOps>,

    /// How many UPSERTs have accumulated below this one for the same key
    pub n_upserts: u8,
}

impl Statement {
    /// Creates an INSERT.
    #[must_use]
    pub fn insert<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V, lsn: Lsn) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: StmtKind::Insert,
            lsn,
            flags: 0,
            ops: None,
            n_upserts: 0,
        }
    }

    /// Creates a REPLACE.
    #[must_use]
    pub fn replace<K: Into<UserKey>, V: Into<UserValue>>(key: K, value: V, lsn: Lsn) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: StmtKind::Replace,
            lsn,
            flags: 0,
            ops: None,
            n_upserts: 0,
        }
    }

    /// Creates a DELETE tombstone.
    #[must_use]
    pub fn delete<K: Into<UserKey>>(key: K, lsn: Lsn) -> Self {
        Self {
            key: key.into(),
            value: UserValue::empty(),
            kind: StmtKind::Delete,
            lsn,
            flags: 0,
            ops: None,
            n_upserts: 0,
        }
    }

    /// Creates an UPSERT with a default value and an operation list.
    #[must_use]
    pub fn upsert<K: Into<UserKey>, V: Into<UserValue>>(
        key: K,
        value: V,
        ops: UpsertOps,
        lsn: Lsn,
    ) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            kind: StmtKind::Upsert,
            lsn,
            flags: 0,
            ops: Some(ops),
            n_upserts: 0,
        }
    }

    /// Returns `true` for DELETE.
    #[must_use]
    pub fn is_tombstone(&self) -> bool {
        self.kind == StmtKind::Delete
    }

    /// Returns a copy with a different LSN.
    #[must_use]
    pub fn with_lsn(&self, lsn: Lsn) -> Self {
        let mut copy = self.clone();
        copy.lsn = lsn;
        copy
    }

    /// Returns a copy with a different type.
    #[must_use]
    pub fn with_kind(&self, kind: StmtKind) -> Self {
        let mut copy = self.clone();
        copy.kind = kind;
        copy
    }

    /// Returns a copy with the given flag bits cleared.
    #[must_use]
    pub fn without_flags(&self, flags: u8) -> Self {
        let mut copy = self.clone();
        copy.flags &= !flags;
        copy
    }

    /// Approximate heap footprint, used for quota accounting.
    #[must_use]
    pub fn footprint(&self) -> u64 {
        (self.key.len() + self.value.len() + std::mem::size_of::<Self>()) as u64
    }
}

impl PartialEq for Statement {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.lsn == other.lsn && self.kind == other.kind
    }
}

impl std::fmt::Debug for Statement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{:?}:{}:{}{}",
            self.key,
            self.lsn,
            match self.kind {
                StmtKind::Insert => "I",
                StmtKind::Replace => "R",
                StmtKind::Delete => "D",
                StmtKind::Upsert => "U",
            },
            if self.flags & STMT_DEFERRED_DELETE != 0 {
                "+dd"
            } else {
                ""
            },
        )
    }
}

impl Encode for Statement {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        writer.write_u8(u8::from(self.kind))?;
        writer.write_u8(self.flags)?;
        writer.write_u8(self.n_upserts)?;
        writer.write_i64::<BigEndian>(self.lsn)?;

        // NOTE: Truncation is okay and actually needed
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u16::<BigEndian>(self.key.len() as u16)?;
        writer.write_all(&self.key)?;

        // NOTE: Only write the value for types that carry one
        if self.kind != StmtKind::Delete {
            // NOTE: We know values are limited to 32-bit length
            #[allow(clippy::cast_possible_truncation)]
            writer.write_u32_varint(self.value.len() as u32)?;
            writer.write_all(&self.value)?;
        }

        if self.kind == StmtKind::Upsert {
            match &self.ops {
                Some(ops) => ops.encode_into(writer)?,
                None => writer.write_u32_varint(0)?,
            }
        }

        Ok(())
    }
}

impl Decode for Statement {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let kind = reader.read_u8()?;
        let kind: StmtKind = kind
            .try_into()
            .map_err(|()| DecodeError::InvalidTag(("StmtKind", kind)))?;

        let flags = reader.read_u8()?;
        let n_upserts = reader.read_u8()?;
        let lsn = reader.read_i64::<BigEndian>()?;

        let key_len = reader.read_u16::<BigEndian>()?;
        let key = UserKey::from_reader(reader, key_len.into())?;

        let value = if kind == StmtKind::Delete {
            UserValue::empty()
        } else {
            let value_len = reader.read_u32_varint()?;
            UserValue::from_reader(reader, value_len as usize)?
        };

        let ops = if kind == StmtKind::Upsert {
            Some(UpsertOps::decode_from(reader)?)
        } else {
            None
        };

        Ok(Self {
            key,
            value,
            kind,
            lsn,
            flags,
            ops,
            n_upserts,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use test_log::test;

    #[test]
    fn stmt_roundtrip_replace() {
        let stmt = Statement::replace(*b"abc", *b"def", 42);
        let bytes = stmt.encode_into_vec();
        let decoded = Statement::decode_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(stmt, decoded);
        assert_eq!(&*decoded.value, b"def");
    }

    #[test]
    fn stmt_roundtrip_delete_has_no_value() {
        let stmt = Statement::delete(*b"abc", 7);
        let bytes = stmt.encode_into_vec();
        let decoded = Statement::decode_from(&mut Cursor::new(bytes)).unwrap();
        assert!(decoded.is_tombstone());
        assert!(decoded.value.is_empty());
    }

    #[test]
    fn stmt_roundtrip_upsert() {
        let ops = UpsertOps::from(vec![UpsertOp::Add(5)]);
        let stmt = Statement::upsert(*b"k", 1i64.to_le_bytes(), ops, 3);
        let bytes = stmt.encode_into_vec();
        let decoded = Statement::decode_from(&mut Cursor::new(bytes)).unwrap();
        assert_eq!(StmtKind::Upsert, decoded.kind);
        assert_eq!(1, decoded.ops.unwrap().len());
    }

    #[test]
    fn stmt_flags_survive() {
        let mut stmt = Statement::replace(*b"a", *b"b", 1);
        stmt.flags |= STMT_DEFERRED_DELETE;
        let decoded =
            Statement::decode_from(&mut Cursor::new(stmt.encode_into_vec())).unwrap();
        assert_ne!(0, decoded.flags & STMT_DEFERRED_DELETE);

        let cleared = decoded.without_flags(STMT_DEFERRED_DELETE);
        assert_eq!(0, cleared.flags & STMT_DEFERRED_DELETE);
    }
}
