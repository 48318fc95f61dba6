//! Attribute ids.
//!
//! An [`Id`] names something an entity can carry: either a plain id (the
//! index of a component or tag entity) or a relationship pair
//! `(first, second)`. Layout:
//!
//! ```text
//! plain: [flags: 8 | 0: 24 | index: 32]
//! pair:  [flags: 8 | first: 24 | second: 32]   (PAIR flag set)
//! ```
//!
//! Ids never carry entity generations; the store resolves the live
//! generation of an index through the entity index when it needs one.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::entity::EntityId;

/// Pair flag. Set on every relationship pair.
pub const PAIR: u64 = 1 << 63;
/// Toggle flag. `TOGGLE | id` in a table type marks a bitset column for `id`.
pub const TOGGLE: u64 = 1 << 61;
/// All flag bits.
pub const ID_FLAGS_MASK: u64 = 0xFF << 56;
/// Everything except the flag bits.
pub const COMPONENT_MASK: u64 = !ID_FLAGS_MASK;
/// Largest entity index usable as the first element of a pair.
pub const MAX_RELATIONSHIP_INDEX: u32 = (1 << 24) - 1;

// ---------------------------------------------------------------------------
// Id
// ---------------------------------------------------------------------------

/// A component, tag or pair id.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
pub struct Id(u64);

impl Id {
    /// The null id. Never valid in a type.
    pub const NULL: Id = Id(0);

    /// Reconstruct from a raw `u64`.
    #[inline]
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw `u64` representation.
    #[inline]
    pub const fn to_raw(self) -> u64 {
        self.0
    }

    /// Plain id for an entity. The generation is dropped.
    #[inline]
    pub const fn entity(entity: EntityId) -> Self {
        Self(entity.index() as u64)
    }

    /// Plain id for an entity index.
    #[inline]
    pub const fn from_index(index: u32) -> Self {
        Self(index as u64)
    }

    /// Pair `(first, second)`.
    ///
    /// The first index is truncated to 24 bits. Use [`Id::try_pair`] when
    /// the relationship is not known to fit.
    #[inline]
    pub const fn pair(first: EntityId, second: EntityId) -> Self {
        Self::pair_index(first.index(), second.index())
    }

    /// Pair built from raw entity indices. Truncates like [`Id::pair`].
    #[inline]
    pub const fn pair_index(first: u32, second: u32) -> Self {
        Self(PAIR | ((first as u64 & MAX_RELATIONSHIP_INDEX as u64) << 32) | second as u64)
    }

    /// Pair `(first, second)`, or `None` if `first` has no 24-bit index.
    #[inline]
    pub const fn try_pair(first: EntityId, second: EntityId) -> Option<Self> {
        Self::try_pair_index(first.index(), second.index())
    }

    #[inline]
    pub const fn try_pair_index(first: u32, second: u32) -> Option<Self> {
        if first > MAX_RELATIONSHIP_INDEX {
            None
        } else {
            Some(Self::pair_index(first, second))
        }
    }

    /// Whether this id is a relationship pair.
    #[inline]
    pub const fn is_pair(self) -> bool {
        self.0 & PAIR != 0
    }

    /// Whether this id carries the toggle flag.
    #[inline]
    pub const fn is_toggle(self) -> bool {
        self.0 & TOGGLE != 0
    }

    /// The flag bits of this id.
    #[inline]
    pub const fn flags(self) -> u64 {
        self.0 & ID_FLAGS_MASK
    }

    /// This id with all flag bits except `PAIR` removed.
    #[inline]
    pub const fn strip_flags(self) -> Self {
        Self(self.0 & (COMPONENT_MASK | PAIR))
    }

    /// This id with the toggle flag set.
    #[inline]
    pub const fn toggle(self) -> Self {
        Self(self.0 | TOGGLE)
    }

    /// Entity index of the first element. For plain ids, the id itself.
    #[inline]
    pub const fn first(self) -> u32 {
        if self.is_pair() {
            ((self.0 >> 32) as u32) & MAX_RELATIONSHIP_INDEX
        } else {
            self.0 as u32
        }
    }

    /// Entity index of the second element. Zero for plain ids.
    #[inline]
    pub const fn second(self) -> u32 {
        if self.is_pair() {
            self.0 as u32
        } else {
            0
        }
    }

    /// Whether this id contains `*` or `_` anywhere.
    #[inline]
    pub fn is_wildcard(self) -> bool {
        let wildcard = |index: u32| index == builtin::WILDCARD_INDEX || index == builtin::ANY_INDEX;
        if self.is_pair() {
            wildcard(self.first()) || wildcard(self.second())
        } else {
            wildcard(self.first())
        }
    }

    /// Whether this id uses `_` (match at most once).
    #[inline]
    pub fn is_any(self) -> bool {
        if self.is_pair() {
            self.first() == builtin::ANY_INDEX || self.second() == builtin::ANY_INDEX
        } else {
            self.first() == builtin::ANY_INDEX
        }
    }

    /// Structural validity: non-null, no stray bits, no zero pair elements.
    pub fn is_valid(self) -> bool {
        if self.0 == 0 {
            return false;
        }
        if self.is_pair() {
            self.first() != 0 && self.second() != 0
        } else {
            (self.0 & COMPONENT_MASK) >> 32 == 0 && self.first() != 0
        }
    }

    /// Whether `self` (a concrete id) is matched by `pattern`.
    ///
    /// `*` and `_` match any element. A plain `*` matches plain ids only;
    /// `(*, *)` matches every pair.
    pub fn matches(self, pattern: Id) -> bool {
        if self == pattern {
            return true;
        }
        let is_wild =
            |index: u32| index == builtin::WILDCARD_INDEX || index == builtin::ANY_INDEX;
        if pattern.is_pair() != self.is_pair() || self.flags() & !PAIR != pattern.flags() & !PAIR {
            return false;
        }
        if pattern.is_pair() {
            (is_wild(pattern.first()) || pattern.first() == self.first())
                && (is_wild(pattern.second()) || pattern.second() == self.second())
        } else {
            is_wild(pattern.first())
        }
    }
}

impl From<EntityId> for Id {
    #[inline]
    fn from(entity: EntityId) -> Self {
        Id::entity(entity)
    }
}

fn fmt_index(f: &mut fmt::Formatter<'_>, index: u32) -> fmt::Result {
    match index {
        builtin::WILDCARD_INDEX => write!(f, "*"),
        builtin::ANY_INDEX => write!(f, "_"),
        _ => match builtin::name_of(index) {
            Some(name) => write!(f, "{name}"),
            None => write!(f, "#{index}"),
        },
    }
}

impl fmt::Display for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_toggle() {
            write!(f, "TOGGLE|")?;
        }
        if self.is_pair() {
            write!(f, "(")?;
            fmt_index(f, self.first())?;
            write!(f, ",")?;
            fmt_index(f, self.second())?;
            write!(f, ")")
        } else {
            fmt_index(f, self.first())
        }
    }
}

impl fmt::Debug for Id {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Id({self})")
    }
}

// ---------------------------------------------------------------------------
// Builtin entities
// ---------------------------------------------------------------------------

/// Entities that exist in every world.
///
/// Their indices are fixed so that ids built from them are constants.
pub mod builtin {
    use crate::entity::EntityId;

    macro_rules! builtins {
        ($($(#[$doc:meta])* $name:ident = $index:literal, $label:literal;)*) => {
            $(
                $(#[$doc])*
                pub const $name: EntityId = EntityId::new($index, 0);
            )*

            /// Every builtin as `(entity, name)`, in index order.
            pub const ALL: &[(EntityId, &str)] = &[$(($name, $label)),*];
        };
    }

    builtins! {
        /// `*`: matches any id, one result per match.
        WILDCARD = 1, "*";
        /// `_`: matches any id, at most one result.
        ANY = 2, "_";
        /// Marker for the implicit `$this` source.
        THIS = 3, "$this";
        /// Prototype relationship.
        IS_A = 4, "IsA";
        /// Hierarchy relationship.
        CHILD_OF = 5, "ChildOf";
        /// Trait: an entity has at most one target for the relationship.
        EXCLUSIVE = 6, "Exclusive";
        /// Trait: the entity cannot be the target of `IsA`.
        FINAL = 7, "Final";
        /// Trait, used as `(OneOf, X)`: targets must be children of `X`.
        ONE_OF = 8, "OneOf";
        /// Trait: the id may only be used as the first element of a pair.
        RELATIONSHIP = 9, "Relationship";
        /// Trait: the id may only be used as the second element of a pair.
        TARGET = 10, "Target";
        /// Trait: payload lives in a sparse set instead of a table column.
        SPARSE = 11, "Sparse";
        /// Trait: the id never appears in table types.
        DONT_FRAGMENT = 12, "DontFragment";
        /// Trait: the id can be enabled and disabled per entity.
        CAN_TOGGLE = 13, "CanToggle";
        /// Trait: events propagate along the relationship.
        TRAVERSABLE = 14, "Traversable";
        /// Tag: tables are hidden from queries that do not mention it.
        PREFAB = 15, "Prefab";
        /// Tag: tables are hidden from queries that do not mention it.
        DISABLED = 16, "Disabled";
        /// Cleanup relationship `(OnDelete, policy)`.
        ON_DELETE = 17, "OnDelete";
        /// Cleanup relationship `(OnDeleteTarget, policy)`.
        ON_DELETE_TARGET = 18, "OnDeleteTarget";
        /// Cleanup policy: remove the id from all entities.
        REMOVE = 19, "Remove";
        /// Cleanup policy: delete all entities with the id.
        DELETE = 20, "Delete";
        /// Cleanup policy: refuse the delete.
        PANIC = 21, "Panic";
        /// Trait: pairs with this relationship never carry data.
        PAIR_IS_TAG = 22, "PairIsTag";
        /// Tag marking the name component entity.
        NAME = 23, "Name";
    }

    /// Index of [`WILDCARD`].
    pub const WILDCARD_INDEX: u32 = WILDCARD.index();
    /// Index of [`ANY`].
    pub const ANY_INDEX: u32 = ANY.index();
    /// Index of [`THIS`].
    pub const THIS_INDEX: u32 = THIS.index();

    /// First index handed out to user entities.
    pub const FIRST_USER_ENTITY: u32 = 32;

    /// Name of a builtin index, if it is one.
    pub fn name_of(index: u32) -> Option<&'static str> {
        ALL.iter()
            .find(|(entity, _)| entity.index() == index)
            .map(|(_, name)| *name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn e(index: u32) -> EntityId {
        EntityId::new(index, 0)
    }

    #[test]
    fn pair_layout() {
        let p = Id::pair(e(100), e(200));
        assert!(p.is_pair());
        assert_eq!(p.first(), 100);
        assert_eq!(p.second(), 200);
        assert!(p.is_valid());
        assert!(!p.is_wildcard());
    }

    #[test]
    fn plain_id_drops_generation() {
        let a = Id::entity(EntityId::new(40, 3));
        assert_eq!(a, Id::from_index(40));
        assert!(!a.is_pair());
        assert_eq!(a.first(), 40);
        assert_eq!(a.second(), 0);
    }

    #[test]
    fn validity() {
        assert!(!Id::NULL.is_valid());
        assert!(!Id::pair_index(0, 5).is_valid());
        assert!(!Id::pair_index(5, 0).is_valid());
        assert!(!Id::from_raw(1 << 40).is_valid());
        assert!(Id::from_index(64).is_valid());
        assert!(Id::from_index(64).toggle().is_valid());
    }

    #[test]
    fn wildcard_matching() {
        let likes = e(50);
        let bob = e(51);
        let pair = Id::pair(likes, bob);
        assert!(pair.matches(Id::pair(likes, builtin::WILDCARD)));
        assert!(pair.matches(Id::pair(builtin::WILDCARD, bob)));
        assert!(pair.matches(Id::pair(builtin::WILDCARD, builtin::WILDCARD)));
        assert!(pair.matches(Id::pair(builtin::ANY, bob)));
        assert!(!pair.matches(Id::pair(bob, builtin::WILDCARD)));
        assert!(!pair.matches(Id::entity(builtin::WILDCARD)));
        assert!(Id::entity(likes).matches(Id::entity(builtin::WILDCARD)));
        assert!(!Id::entity(likes).toggle().matches(Id::entity(builtin::WILDCARD)));
    }

    #[test]
    fn ordering_puts_pairs_after_plain_ids() {
        let plain = Id::from_index(1_000);
        let pair = Id::pair(e(33), e(34));
        assert!(plain < pair);
    }

    #[test]
    fn display() {
        assert_eq!(Id::pair(builtin::CHILD_OF, builtin::WILDCARD).to_string(), "(ChildOf,*)");
        assert_eq!(Id::from_index(77).to_string(), "#77");
        assert_eq!(Id::from_index(77).toggle().to_string(), "TOGGLE|#77");
    }
}
