//! Related-attribute path matching.
//!
//! A relayed event carries the path from its host to whatever changed. A
//! property handle bound to relation attribute `friends` can absorb exactly
//! three shapes incrementally:
//!
//! | path              | meaning                                          |
//! |-------------------|--------------------------------------------------|
//! | `[]`              | the host itself changed                          |
//! | `[friends]`       | a row was linked or unlinked, or a friend changed|
//! | `[friends, &]`    | a row's own fields changed                       |
//!
//! Anything longer is a multi-hop change, and anything starting elsewhere
//! belongs to another attribute. Matching is exact: case and segment order
//! both count.

use crate::store::LINK_SYMBOL;

/// How a related-attribute path relates to a bound relation attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathMatch {
    /// Empty path: the event is about the host itself.
    Root,
    /// `[attribute]`.
    Related,
    /// `[attribute, &]`.
    RelationOwn,
    /// Starts with the attribute but continues past one hop.
    Deep,
    /// Starts with another attribute.
    Mismatch,
}

impl PathMatch {
    /// Shapes a single-hop handle can absorb without re-reading everything.
    pub fn is_incremental(&self) -> bool {
        matches!(self, PathMatch::Related | PathMatch::RelationOwn)
    }
}

/// Classify `path` against the relation `attribute` a handle is bound to.
pub fn match_related_path<S: AsRef<str>>(path: &[S], attribute: &str) -> PathMatch {
    match path {
        [] => PathMatch::Root,
        [first, ..] if first.as_ref() != attribute => PathMatch::Mismatch,
        [_] => PathMatch::Related,
        [_, link] if link.as_ref() == LINK_SYMBOL => PathMatch::RelationOwn,
        _ => PathMatch::Deep,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_hop_shapes() {
        let empty: [&str; 0] = [];
        assert_eq!(match_related_path(&empty, "friends"), PathMatch::Root);
        assert_eq!(match_related_path(&["friends"], "friends"), PathMatch::Related);
        assert_eq!(match_related_path(&["friends", "&"], "friends"), PathMatch::RelationOwn);
        assert!(match_related_path(&["friends", "&"], "friends").is_incremental());
    }

    #[test]
    fn matching_is_exact() {
        assert_eq!(match_related_path(&["Friends"], "friends"), PathMatch::Mismatch);
        assert_eq!(match_related_path(&["&", "friends"], "friends"), PathMatch::Mismatch);
        assert_eq!(match_related_path(&["friends", "posts"], "friends"), PathMatch::Deep);
        assert_eq!(match_related_path(&["friends", "&", "since"], "friends"), PathMatch::Deep);
        assert!(!PathMatch::Deep.is_incremental());
    }
}
