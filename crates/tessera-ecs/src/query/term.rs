//! Query input: terms and the query descriptor.
//!
//! A term names an id (`first`, optionally `second` for pairs) and the
//! source that must have it (`$this` unless given). Elements are concrete
//! entities, wildcards or variables:
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! let mut world = World::new();
//! let likes = world.new_entity();
//! // (Likes, $who), !Prefab
//! let desc = QueryDesc::new()
//!     .term(Term::pair(likes, TermRef::var("who")))
//!     .term(Term::new(builtin::PREFAB).oper(Oper::Not));
//! assert_eq!(desc.items().len(), 2);
//! ```

use serde::Serialize;

use crate::entity::EntityId;
use crate::id::{builtin, Id};

/// One element of a term: predicate, target or source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TermRef {
    /// The implicit `$this` variable.
    This,
    /// A concrete entity.
    Entity(EntityId),
    /// A named variable. Names starting with `_` are anonymous.
    Var(String),
    /// `*`: any id, one result per match.
    Wildcard,
    /// `_`: any id, at most one result.
    Any,
}

impl TermRef {
    pub fn var(name: impl Into<String>) -> Self {
        TermRef::Var(name.into())
    }

    /// Element for an entity index taken from an [`Id`].
    fn from_index(index: u32) -> Self {
        match index {
            builtin::WILDCARD_INDEX => TermRef::Wildcard,
            builtin::ANY_INDEX => TermRef::Any,
            builtin::THIS_INDEX => TermRef::This,
            _ => TermRef::Entity(EntityId::new(index, 0)),
        }
    }

    pub(crate) fn var_name(&self) -> Option<&str> {
        match self {
            TermRef::This => Some(THIS_NAME),
            TermRef::Var(name) => Some(name),
            _ => None,
        }
    }
}

impl From<EntityId> for TermRef {
    fn from(entity: EntityId) -> Self {
        match entity.index() {
            builtin::WILDCARD_INDEX => TermRef::Wildcard,
            builtin::ANY_INDEX => TermRef::Any,
            builtin::THIS_INDEX => TermRef::This,
            _ => TermRef::Entity(entity),
        }
    }
}

/// Name of the `$this` variable.
pub const THIS_NAME: &str = "this";

/// How a term combines with the terms around it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum Oper {
    #[default]
    And,
    /// The source must not match.
    Not,
    /// The term is matched if possible; the field reports whether it was.
    Optional,
    /// Chains with the next term: at least one of them must match.
    Or,
}

/// Declared access of a term's field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub enum InOut {
    #[default]
    Default,
    In,
    Out,
    InOut,
    /// The field is matched but its data is never accessed.
    None,
}

/// One predicate of a query.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Term {
    pub first: TermRef,
    pub second: Option<TermRef>,
    pub src: TermRef,
    pub oper: Oper,
    pub inout: InOut,
}

impl Term {
    /// Plain term `first($this)`.
    pub fn new(first: impl Into<TermRef>) -> Self {
        Self {
            first: first.into(),
            second: None,
            src: TermRef::This,
            oper: Oper::And,
            inout: InOut::Default,
        }
    }

    /// Pair term `(first, second)($this)`.
    pub fn pair(first: impl Into<TermRef>, second: impl Into<TermRef>) -> Self {
        Self {
            second: Some(second.into()),
            ..Self::new(first)
        }
    }

    /// Term for an existing id. Wildcard elements become wildcards.
    pub fn id(id: Id) -> Self {
        let first = TermRef::from_index(id.first());
        if id.is_pair() {
            Self::pair(first, TermRef::from_index(id.second()))
        } else {
            Self::new(first)
        }
    }

    pub fn src(mut self, src: impl Into<TermRef>) -> Self {
        self.src = src.into();
        self
    }

    pub fn oper(mut self, oper: Oper) -> Self {
        self.oper = oper;
        self
    }

    pub fn inout(mut self, inout: InOut) -> Self {
        self.inout = inout;
        self
    }

    /// Every variable name the term mentions, source first.
    pub(crate) fn var_names(&self) -> impl Iterator<Item = &str> {
        [Some(&self.src), Some(&self.first), self.second.as_ref()]
            .into_iter()
            .flatten()
            .filter_map(TermRef::var_name)
    }
}

/// A term or a scope marker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum TermItem {
    Term(Term),
    /// Opens a group of terms. A `not` scope matches when its contents
    /// do not.
    ScopeOpen { not: bool },
    ScopeClose,
}

/// Everything needed to build a query.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueryDesc {
    items: Vec<TermItem>,
    cached: bool,
}

impl QueryDesc {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn term(mut self, term: Term) -> Self {
        self.items.push(TermItem::Term(term));
        self
    }

    /// `id($this)`
    pub fn with(self, id: impl Into<Id>) -> Self {
        self.term(Term::id(id.into()))
    }

    /// `(rel, target)($this)`
    pub fn with_pair(self, rel: impl Into<TermRef>, target: impl Into<TermRef>) -> Self {
        self.term(Term::pair(rel, target))
    }

    /// `!id($this)`
    pub fn without(self, id: impl Into<Id>) -> Self {
        self.term(Term::id(id.into()).oper(Oper::Not))
    }

    /// `?id($this)`
    pub fn optional(self, id: impl Into<Id>) -> Self {
        self.term(Term::id(id.into()).oper(Oper::Optional))
    }

    pub fn scope_open(mut self) -> Self {
        self.items.push(TermItem::ScopeOpen { not: false });
        self
    }

    pub fn not_scope_open(mut self) -> Self {
        self.items.push(TermItem::ScopeOpen { not: true });
        self
    }

    pub fn scope_close(mut self) -> Self {
        self.items.push(TermItem::ScopeClose);
        self
    }

    /// Keep a world-maintained cache of matching tables for this query.
    pub fn cached(mut self) -> Self {
        self.cached = true;
        self
    }

    pub fn items(&self) -> &[TermItem] {
        &self.items
    }

    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Terms in input order, scope markers skipped.
    pub fn terms(&self) -> impl Iterator<Item = &Term> {
        self.items.iter().filter_map(|item| match item {
            TermItem::Term(term) => Some(term),
            _ => None,
        })
    }
}

impl From<Vec<Term>> for QueryDesc {
    fn from(terms: Vec<Term>) -> Self {
        Self {
            items: terms.into_iter().map(TermItem::Term).collect(),
            cached: false,
        }
    }
}
