// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// Scan type of a read iterator.
///
/// The bitwise and geometric types are classified for direction only; the
/// core scans them like `All` and leaves the filtering to the index-type
/// adapter on top.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum IteratorType {
    /// key == x, ascending
    Eq,

    /// key == x, descending
    Req,

    /// All tuples, ascending
    All,

    /// key < x
    Lt,

    /// key <= x
    Le,

    /// key >= x
    Ge,

    /// key > x
    Gt,

    /// All bits of the key are set in x (opaque to the core)
    BitsAllSet,

    /// Any bit of the key is set in x (opaque to the core)
    BitsAnySet,

    /// No bit of the key is set in x (opaque to the core)
    BitsAllNotSet,

    /// Rectangle overlap (opaque to the core)
    Overlaps,

    /// Nearest neighbor (opaque to the core)
    Neighbor,
}

impl IteratorType {
    /// Scan direction: -1 for descending types, +1 otherwise.
    #[must_use]
    pub fn direction(self) -> i8 {
        match self {
            Self::Req | Self::Lt | Self::Le => -1,
            _ => 1,
        }
    }

    /// Returns `true` for descending types.
    #[must_use]
    pub fn is_reverse(self) -> bool {
        self.direction() < 0
    }

    /// Maps the user-facing type onto the scan primitive the merge sources
    /// understand: `All` becomes `Ge`, `Req` becomes `Le` with an equality
    /// filter applied by the caller, the opaque types scan everything.
    #[must_use]
    pub(crate) fn normalize(self) -> Self {
        match self {
            Self::All
            | Self::BitsAllSet
            | Self::BitsAnySet
            | Self::BitsAllNotSet
            | Self::Overlaps
            | Self::Neighbor => Self::Ge,
            Self::Req => Self::Le,
            other => other,
        }
    }

    /// Empty-key collapse: EQ behaves as GE, LT/GT behave as LE/GE.
    #[must_use]
    pub(crate) fn for_empty_key(self) -> Self {
        match self.normalize() {
            Self::Eq | Self::Gt => Self::Ge,
            Self::Lt => Self::Le,
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn direction() {
        assert_eq!(-1, IteratorType::Req.direction());
        assert_eq!(-1, IteratorType::Lt.direction());
        assert_eq!(-1, IteratorType::Le.direction());
        assert_eq!(1, IteratorType::Eq.direction());
        assert_eq!(1, IteratorType::All.direction());
        assert_eq!(1, IteratorType::BitsAnySet.direction());
    }

    #[test]
    fn empty_key_collapse() {
        assert_eq!(IteratorType::Ge, IteratorType::Eq.for_empty_key());
        assert_eq!(IteratorType::Ge, IteratorType::Gt.for_empty_key());
        assert_eq!(IteratorType::Le, IteratorType::Lt.for_empty_key());
        assert_eq!(IteratorType::Le, IteratorType::Req.for_empty_key());
    }
}
