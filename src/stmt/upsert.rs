// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use super::{Statement, StmtKind};
use crate::{
    coding::{Decode, DecodeError, Encode, EncodeError},
    UserValue,
};
use byteorder::{ReadBytesExt, WriteBytesExt};
use std::io::{Read, Write};
use std::sync::Arc;
use varint_rs::{VarintReader, VarintWriter};

/// One operation of an UPSERT
///
/// `Add` treats the value as an 8-byte little-endian signed integer; applied
/// to anything else it is skipped with a warning, never an error.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum UpsertOp {
    /// Replace the whole value
    Assign(UserValue),

    /// Add to the value interpreted as `i64` (wrapping)
    Add(i64),
}

/// Shared operation list of an UPSERT statement
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UpsertOps(Arc<[UpsertOp]>);

impl UpsertOps {
    /// Number of operations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if there are no operations.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Concatenates two operation lists, older first.
    ///
    /// Used when an UPSERT is applied on top of another UPSERT: the combined
    /// statement must replay the older operations before the newer ones.
    #[must_use]
    pub fn chain(older: &Self, newer: &Self) -> Self {
        let mut ops = Vec::with_capacity(older.len() + newer.len());
        ops.extend_from_slice(&older.0);
        ops.extend_from_slice(&newer.0);
        Self(ops.into())
    }

    /// Applies the operations to a value.
    #[must_use]
    pub fn apply(&self, value: &UserValue) -> UserValue {
        let mut current = value.clone();

        for op in self.0.iter() {
            match op {
                UpsertOp::Assign(v) => current = v.clone(),
                UpsertOp::Add(n) => {
                    let Ok(bytes) = <[u8; 8]>::try_from(&*current) else {
                        log::warn!("skipping integer operation on {}-byte value", current.len());
                        continue;
                    };
                    let sum = i64::from_le_bytes(bytes).wrapping_add(*n);
                    current = UserValue::from(sum.to_le_bytes());
                }
            }
        }

        current
    }

    pub(crate) fn iter(&self) -> std::slice::Iter<'_, UpsertOp> {
        self.0.iter()
    }
}

impl From<Vec<UpsertOp>> for UpsertOps {
    fn from(value: Vec<UpsertOp>) -> Self {
        Self(value.into())
    }
}

/// Applies an UPSERT statement to an older statement of the same key.
///
/// - older REPLACE/INSERT: the operations are applied to its value and a
///   REPLACE is produced;
/// - older UPSERT: a combined UPSERT replaying both operation lists is
///   produced;
/// - older DELETE or none: the UPSERT's own value becomes a REPLACE.
///
/// The result always carries the newer statement's LSN and flags.
///
/// # Panics
///
/// Panics if `newer` is not an UPSERT.
#[must_use]
pub fn apply_upsert(newer: &Statement, older: Option<&Statement>) -> Statement {
    assert_eq!(StmtKind::Upsert, newer.kind, "can only apply an UPSERT");

    let ops = newer.ops.clone().unwrap_or_else(|| UpsertOps::from(vec![]));

    match older {
        Some(older) if older.kind == StmtKind::Upsert => {
            let combined = match &older.ops {
                Some(older_ops) => UpsertOps::chain(older_ops, &ops),
                None => ops,
            };

            Statement {
                key: newer.key.clone(),
                value: older.value.clone(),
                kind: StmtKind::Upsert,
                lsn: newer.lsn,
                flags: newer.flags,
                ops: Some(combined),
                n_upserts: newer.n_upserts,
            }
        }
        Some(older) if !older.is_tombstone() => Statement {
            key: newer.key.clone(),
            value: ops.apply(&older.value),
            kind: StmtKind::Replace,
            lsn: newer.lsn,
            flags: newer.flags,
            ops: None,
            n_upserts: 0,
        },
        _ => Statement {
            key: newer.key.clone(),
            value: newer.value.clone(),
            kind: StmtKind::Replace,
            lsn: newer.lsn,
            flags: newer.flags,
            ops: None,
            n_upserts: 0,
        },
    }
}

impl Encode for UpsertOps {
    fn encode_into<W: Write>(&self, writer: &mut W) -> Result<(), EncodeError> {
        // NOTE: Operation lists stay small, u32 is plenty
        #[allow(clippy::cast_possible_truncation)]
        writer.write_u32_varint(self.0.len() as u32)?;

        for op in self.0.iter() {
            match op {
                UpsertOp::Assign(v) => {
                    writer.write_u8(0)?;

                    #[allow(clippy::cast_possible_truncation)]
                    writer.write_u32_varint(v.len() as u32)?;
                    writer.write_all(v)?;
                }
                UpsertOp::Add(n) => {
                    writer.write_u8(1)?;
                    writer.write_i64_varint(*n)?;
                }
            }
        }

        Ok(())
    }
}

impl Decode for UpsertOps {
    fn decode_from<R: Read>(reader: &mut R) -> Result<Self, DecodeError> {
        let count = reader.read_u32_varint()?;
        let mut ops = Vec::with_capacity(count as usize);

        for _ in 0..count {
            let tag = reader.read_u8()?;
            ops.push(match tag {
                0 => {
                    let len = reader.read_u32_varint()?;
                    UpsertOp::Assign(UserValue::from_reader(reader, len as usize)?)
                }
                1 => UpsertOp::Add(reader.read_i64_varint()?),
                _ => return Err(DecodeError::InvalidTag(("UpsertOp", tag))),
            });
        }

        Ok(Self(ops.into()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use test_log::test;

    fn int(n: i64) -> UserValue {
        UserValue::from(n.to_le_bytes())
    }

    #[test]
    fn upsert_onto_replace() {
        let older = Statement::replace(*b"k", int(0), 1);
        let newer = Statement::upsert(*b"k", int(0), vec![UpsertOp::Add(5)].into(), 2);

        let result = apply_upsert(&newer, Some(&older));
        assert_eq!(StmtKind::Replace, result.kind);
        assert_eq!(int(5), result.value);
        assert_eq!(2, result.lsn);
    }

    #[test]
    fn upsert_onto_upsert_chains_ops() {
        let older = Statement::upsert(*b"k", int(1), vec![UpsertOp::Add(5)].into(), 1);
        let newer = Statement::upsert(*b"k", int(9), vec![UpsertOp::Add(3)].into(), 2);

        let combined = apply_upsert(&newer, Some(&older));
        assert_eq!(StmtKind::Upsert, combined.kind);
        assert_eq!(2, combined.ops.as_ref().unwrap().len());

        // The combined UPSERT must behave like applying both in order.
        let base = Statement::replace(*b"k", int(0), 0);
        let resolved = apply_upsert(&combined, Some(&base));
        assert_eq!(int(8), resolved.value);

        // And on a miss, the OLDER default value wins.
        let resolved = apply_upsert(&combined, None);
        assert_eq!(int(1), resolved.value);
    }

    #[test]
    fn upsert_onto_delete_uses_default() {
        let older = Statement::delete(*b"k", 1);
        let newer = Statement::upsert(*b"k", int(7), vec![UpsertOp::Add(1)].into(), 2);

        let result = apply_upsert(&newer, Some(&older));
        assert_eq!(StmtKind::Replace, result.kind);
        assert_eq!(int(7), result.value);
    }

    #[test]
    fn upsert_onto_nothing_uses_default() {
        let newer = Statement::upsert(*b"k", int(7), vec![UpsertOp::Add(1)].into(), 2);
        let result = apply_upsert(&newer, None);
        assert_eq!(StmtKind::Replace, result.kind);
        assert_eq!(int(7), result.value);
    }

    #[test]
    fn add_on_malformed_value_is_skipped() {
        let older = Statement::replace(*b"k", *b"not-a-number", 1);
        let newer = Statement::upsert(*b"k", int(0), vec![UpsertOp::Add(1)].into(), 2);

        let result = apply_upsert(&newer, Some(&older));
        assert_eq!(&*result.value, b"not-a-number");
    }

    #[test]
    fn assign_then_add() {
        let older = Statement::replace(*b"k", *b"junk", 1);
        let ops: UpsertOps = vec![UpsertOp::Assign(int(10)), UpsertOp::Add(5)].into();
        let newer = Statement::upsert(*b"k", int(0), ops, 2);

        let result = apply_upsert(&newer, Some(&older));
        assert_eq!(int(15), result.value);
    }
}
