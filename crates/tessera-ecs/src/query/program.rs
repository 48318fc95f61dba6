//! Compiled query representation.
//!
//! A [`QueryProgram`] is plain data: an ordered list of [`QueryOp`]s with
//! explicit `prev`/`next` labels, the variable table and the compiled
//! terms. It holds no iteration state, so one program can be iterated by
//! any number of cursors. Two compilations of the same input produce equal
//! programs.

use std::fmt;

use serde::Serialize;

use crate::entity::EntityId;
use crate::id::Id;
use crate::query::term::{InOut, Oper};

/// Index into [`QueryProgram::vars`].
pub type VarId = u8;

/// Upper bound on terms and variables. Both are tracked in `u64` masks.
pub const MAX_TERMS: usize = 64;
pub const MAX_VARS: usize = 64;

// ---------------------------------------------------------------------------
// Variables
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum VarKind {
    /// Bound to a table range.
    Table,
    /// Bound to a single entity.
    Entity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryVar {
    pub name: String,
    pub kind: VarKind,
    /// Anonymous variables are not reported in results.
    pub anonymous: bool,
    /// For entity variables: the table variable holding the same value.
    pub table_var: Option<VarId>,
}

// ---------------------------------------------------------------------------
// Terms
// ---------------------------------------------------------------------------

/// A resolved pair or id element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TermElem {
    Index(u32),
    Var(VarId),
    Wildcard,
    Any,
}

impl TermElem {
    pub(crate) fn var(self) -> Option<VarId> {
        match self {
            TermElem::Var(var) => Some(var),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TermSrc {
    Var(VarId),
    Fixed(EntityId),
}

/// A term after variable resolution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompiledTerm {
    /// Result field this term reports into. Or chains share one field.
    pub field: u16,
    pub first: TermElem,
    pub second: Option<TermElem>,
    pub src: TermSrc,
    pub oper: Oper,
    pub inout: InOut,
    /// The id with every variable replaced by `*`.
    pub id: Id,
    /// Whether a match can carry a value.
    pub has_data: bool,
    /// The component can be toggled per entity.
    pub toggle: bool,
    /// Values live in a sparse store, not in table columns.
    pub sparse: bool,
    /// The id never appears in table types.
    pub non_fragmenting: bool,
}

impl CompiledTerm {
    pub(crate) fn vars(&self) -> impl Iterator<Item = VarId> + '_ {
        let src = match self.src {
            TermSrc::Var(var) => Some(var),
            TermSrc::Fixed(_) => None,
        };
        src.into_iter()
            .chain(self.first.var())
            .chain(self.second.and_then(TermElem::var))
    }

    /// The term can match more than once on the same source.
    pub(crate) fn is_multi(&self) -> bool {
        self.first == TermElem::Wildcard
            || self.second == Some(TermElem::Wildcard)
            || self.first.var().is_some()
            || self.second.and_then(TermElem::var).is_some()
    }
}

// ---------------------------------------------------------------------------
// Ops
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum QueryOpKind {
    /// Never matches.
    Nothing,
    /// Find or test tables (or entities) with an id.
    And,
    /// `And` that stops after the first match per source.
    AndAny,
    /// Test a single bound entity.
    With,
    /// Every non-empty table.
    All,
    /// Batched table test for several plain terms.
    Triv,
    /// `Triv` that also sets field columns.
    TrivData,
    /// `Triv` where some ids contain `_`.
    TrivWildcard,
    /// Tables from the query cache; the remaining ops filter further.
    Cache,
    CacheData,
    /// The cache answers the whole query.
    IsCache,
    IsCacheData,
    /// Bind an entity variable to each row of its table variable.
    Each,
    Or,
    /// Opens an optional block closed by `End`.
    Optional,
    /// Opens a negated block closed by `End`.
    Not,
    End,
    /// Make an entity-bound `$this` the result range.
    SetThis,
    /// Check that fixed sources are alive.
    SetFixed,
    /// Split the result into runs where every toggled field is enabled.
    Toggle,
    /// Split the result into runs with one enabled state for an optional
    /// toggled field.
    ToggleOption,
    Populate,
    PopulateSelf,
    PopulateSparse,
    Yield,
}

impl QueryOpKind {
    pub fn name(self) -> &'static str {
        match self {
            QueryOpKind::Nothing => "nothing",
            QueryOpKind::And => "and",
            QueryOpKind::AndAny => "and_any",
            QueryOpKind::With => "with",
            QueryOpKind::All => "all",
            QueryOpKind::Triv => "triv",
            QueryOpKind::TrivData => "triv_data",
            QueryOpKind::TrivWildcard => "triv_wildcard",
            QueryOpKind::Cache => "cache",
            QueryOpKind::CacheData => "cache_data",
            QueryOpKind::IsCache => "is_cache",
            QueryOpKind::IsCacheData => "is_cache_data",
            QueryOpKind::Each => "each",
            QueryOpKind::Or => "or",
            QueryOpKind::Optional => "optional",
            QueryOpKind::Not => "not",
            QueryOpKind::End => "end",
            QueryOpKind::SetThis => "set_this",
            QueryOpKind::SetFixed => "set_fixed",
            QueryOpKind::Toggle => "toggle",
            QueryOpKind::ToggleOption => "toggle_option",
            QueryOpKind::Populate => "populate",
            QueryOpKind::PopulateSelf => "populate_self",
            QueryOpKind::PopulateSparse => "populate_sparse",
            QueryOpKind::Yield => "yield",
        }
    }

    /// Ops whose `terms` mask holds fields rather than terms.
    pub(crate) fn masks_fields(self) -> bool {
        matches!(
            self,
            QueryOpKind::Optional
                | QueryOpKind::Not
                | QueryOpKind::Toggle
                | QueryOpKind::ToggleOption
                | QueryOpKind::Populate
                | QueryOpKind::PopulateSelf
                | QueryOpKind::PopulateSparse
        )
    }

    /// Ops that open a block closed by `End`.
    pub(crate) fn opens_block(self) -> bool {
        matches!(self, QueryOpKind::Optional | QueryOpKind::Not)
    }
}

/// One instruction.
///
/// `next` is taken on success, `prev` on failure. Both are op indices; a
/// `prev` of `-1` ends the iteration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryOp {
    pub kind: QueryOpKind,
    /// Term evaluated by single-term ops.
    pub term: Option<u16>,
    /// Terms or fields covered by batched ops, as a bit mask.
    pub terms: u64,
    /// Variable the op reads or enumerates.
    pub src: Option<VarId>,
    /// Variable the op writes, for `Each` and `SetThis`.
    pub dst: Option<VarId>,
    /// Variables already bound when the op runs.
    pub bound: u64,
    pub prev: i16,
    pub next: i16,
    /// Partner of a block op: `End` for openers, the opener for `End`.
    pub other: i16,
}

impl QueryOp {
    pub(crate) fn new(kind: QueryOpKind) -> Self {
        Self {
            kind,
            term: None,
            terms: 0,
            src: None,
            dst: None,
            bound: 0,
            prev: -1,
            next: -1,
            other: -1,
        }
    }

    pub(crate) fn is_bound(&self, var: VarId) -> bool {
        self.bound & (1u64 << var) != 0
    }
}

// ---------------------------------------------------------------------------
// QueryProgram
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryProgram {
    pub ops: Vec<QueryOp>,
    /// `vars[0]` is always `$this`.
    pub vars: Vec<QueryVar>,
    pub terms: Vec<CompiledTerm>,
    pub field_count: usize,
    /// Display form of each field's id pattern.
    pub field_names: Vec<String>,
    /// Prefab tables are matched only when a term mentions `Prefab`.
    pub match_prefab: bool,
    pub match_disabled: bool,
    pub cached: bool,
}

impl QueryProgram {
    /// Variable id for a public name.
    pub fn find_var(&self, name: &str) -> Option<VarId> {
        self.vars
            .iter()
            .position(|v| v.name == name && !v.anonymous && v.kind == VarKind::Entity)
            .map(|i| i as VarId)
    }

    /// Names of the variables reported in results, in variable order.
    pub fn public_vars(&self) -> impl Iterator<Item = &str> {
        self.vars
            .iter()
            .filter(|v| !v.anonymous && v.kind == VarKind::Entity)
            .map(|v| v.name.as_str())
    }

    pub fn op_count(&self) -> usize {
        self.ops.len()
    }

    fn var_str(&self, var: VarId) -> String {
        match self.vars.get(var as usize) {
            Some(v) if v.kind == VarKind::Table => format!("$[{}]", v.name),
            Some(v) => format!("${}", v.name),
            None => format!("$?{var}"),
        }
    }

    fn mask_str(&self, kind: QueryOpKind, mask: u64) -> String {
        let selected = |i: &usize| mask & (1u64 << i) != 0;
        let parts: Vec<&str> = if kind.masks_fields() {
            (0..self.field_count)
                .filter(selected)
                .filter_map(|i| self.field_names.get(i))
                .map(String::as_str)
                .collect()
        } else {
            (0..self.terms.len())
                .filter(selected)
                .filter_map(|i| self.field_names.get(self.terms[i].field as usize))
                .map(String::as_str)
                .collect()
        };
        parts.join(", ")
    }
}

impl fmt::Display for QueryProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, op) in self.ops.iter().enumerate() {
            write!(f, "{i:2}. [{:2}, {:2}] {:<15}", op.prev, op.next, op.kind.name())?;
            if let Some(src) = op.src {
                write!(f, " {}", self.var_str(src))?;
            }
            if let Some(dst) = op.dst {
                write!(f, " -> {}", self.var_str(dst))?;
            }
            if let Some(term) = op.term.and_then(|t| self.terms.get(t as usize)) {
                if let TermSrc::Fixed(entity) = term.src {
                    write!(f, " {entity}")?;
                }
                if let Some(name) = self.field_names.get(term.field as usize) {
                    write!(f, " {name}")?;
                }
            } else if op.terms != 0 {
                write!(f, " {}", self.mask_str(op.kind, op.terms))?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn op_names_are_snake_case() {
        assert_eq!(QueryOpKind::TrivWildcard.name(), "triv_wildcard");
        assert_eq!(QueryOpKind::IsCacheData.name(), "is_cache_data");
        assert!(QueryOpKind::Not.opens_block());
        assert!(!QueryOpKind::End.opens_block());
    }

    #[test]
    fn display_lists_one_line_per_op() {
        let mut nothing = QueryOp::new(QueryOpKind::Nothing);
        nothing.next = 1;
        let program = QueryProgram {
            ops: vec![nothing],
            vars: vec![QueryVar {
                name: "this".to_owned(),
                kind: VarKind::Table,
                anonymous: false,
                table_var: None,
            }],
            terms: Vec::new(),
            field_count: 0,
            field_names: Vec::new(),
            match_prefab: false,
            match_disabled: false,
            cached: false,
        };
        let text = program.to_string();
        assert_eq!(text.lines().count(), 1);
        assert!(text.contains("nothing"));
    }
}
