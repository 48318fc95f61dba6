//! Query execution.
//!
//! A [`QueryCursor`] interprets a [`QueryProgram`]. Each op either succeeds
//! (continue at `next`) or fails (back to `prev` in redo mode, asking the
//! earlier op for its next candidate). `Yield` hands out a result and
//! fails on redo, so the next call to [`Iterator::next`] resumes the search
//! where it left off. Every op enumerates a finite candidate set captured
//! when it is entered, which bounds iteration by the tables and rows that
//! existed when it started.

use std::sync::Arc;

use crate::entity::EntityId;
use crate::id::{builtin, Id};
use crate::query::cache::QueryCache;
use crate::query::program::{
    CompiledTerm, QueryOp, QueryOpKind, QueryProgram, TermElem, TermSrc, VarId, VarKind,
};
use crate::query::Query;
use crate::table::{wildcard_record_key, Table, TableFlags, TableId};
use crate::world::World;
use crate::EcsError;

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

/// Rows `offset..offset + count` of a table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRange {
    pub table: TableId,
    pub offset: usize,
    pub count: usize,
}

#[derive(Debug, Clone, Copy, Default)]
struct VarValue {
    entity: Option<EntityId>,
    range: Option<TableRange>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct FieldState {
    pub(crate) id: Id,
    /// `None` when the value comes from the `$this` rows.
    pub(crate) src: Option<EntityId>,
    pub(crate) set: bool,
    pub(crate) table: Option<TableId>,
    pub(crate) row: usize,
    pub(crate) column: Option<usize>,
    pub(crate) sparse: bool,
}

impl FieldState {
    fn unset(id: Id) -> Self {
        Self {
            id,
            src: None,
            set: false,
            table: None,
            row: 0,
            column: None,
            sparse: false,
        }
    }
}

/// Per-op iteration state.
#[derive(Debug, Clone, Default)]
struct OpCtx {
    tables: Vec<TableId>,
    ids: Vec<Id>,
    pos: usize,
    index: usize,
    alt: usize,
    row: usize,
    range: Option<TableRange>,
    matched: bool,
    emitted: bool,
    written: u64,
}

enum Step {
    Next,
    Fail,
    Jump(usize),
    Back(usize),
    Yield,
}

#[inline]
fn bit(index: usize) -> u64 {
    1u64 << index
}

/// Index of the first entry at or after `from` in `type_ids` matching
/// `pattern`.
fn next_match(table: &Table, pattern: Id, from: usize) -> Option<usize> {
    if !pattern.is_wildcard() {
        return if from == 0 { table.type_index(pattern) } else { None };
    }
    let record = table.record(pattern)?;
    let start = from.max(record.index as usize);
    table.type_ids()[start..]
        .iter()
        .position(|id| id.matches(pattern))
        .map(|i| start + i)
}

// ---------------------------------------------------------------------------
// QueryCursor
// ---------------------------------------------------------------------------

/// Iterator over the results of a query.
pub struct QueryCursor<'w> {
    world: &'w World,
    program: &'w QueryProgram,
    cache: Option<&'w QueryCache>,
    pc: i32,
    redo: bool,
    done: bool,
    ctx: Vec<OpCtx>,
    vars: Vec<VarValue>,
    fields: Vec<FieldState>,
    patterns: Vec<Id>,
    written: u64,
}

impl<'w> QueryCursor<'w> {
    pub(crate) fn new(world: &'w World, program: &'w QueryProgram, cache: Option<&'w QueryCache>) -> Self {
        let mut patterns = vec![Id::NULL; program.field_count];
        for term in program.terms.iter().rev() {
            patterns[term.field as usize] = term.id;
        }
        Self {
            world,
            program,
            cache,
            pc: 0,
            redo: false,
            done: program.ops.is_empty(),
            ctx: vec![OpCtx::default(); program.ops.len()],
            vars: vec![VarValue::default(); program.vars.len()],
            fields: patterns.iter().map(|id| FieldState::unset(*id)).collect(),
            patterns,
            written: 0,
        }
    }

    /// Start over from the first op.
    pub fn reset(&mut self) {
        self.pc = 0;
        self.redo = false;
        self.done = self.program.ops.is_empty();
        self.written = 0;
        self.vars.iter_mut().for_each(|v| *v = VarValue::default());
        for (field, id) in self.fields.iter_mut().zip(&self.patterns) {
            *field = FieldState::unset(*id);
        }
    }

    fn run(&mut self) -> bool {
        if self.done {
            return false;
        }
        loop {
            if self.pc < 0 {
                self.done = true;
                return false;
            }
            let pc = self.pc as usize;
            match self.eval(pc, self.redo) {
                Step::Yield => {
                    self.redo = true;
                    return true;
                }
                step => self.apply(pc, step),
            }
        }
    }

    fn apply(&mut self, pc: usize, step: Step) {
        let op = self.op(pc);
        match step {
            Step::Next => {
                self.pc = i32::from(op.next);
                self.redo = false;
            }
            Step::Fail => {
                self.pc = i32::from(op.prev);
                self.redo = true;
            }
            Step::Jump(to) => {
                self.pc = to as i32;
                self.redo = false;
            }
            Step::Back(to) => {
                self.pc = to as i32;
                self.redo = true;
            }
            Step::Yield => {}
        }
    }

    /// Run the ops in `start..end` until one result reaches `end` or the
    /// search backtracks out of the range.
    fn probe(&mut self, start: usize, end: usize) -> bool {
        let saved = (self.pc, self.redo);
        self.pc = start as i32;
        self.redo = false;
        let found = loop {
            if self.pc == end as i32 {
                break true;
            }
            if self.pc < start as i32 || self.pc > end as i32 {
                break false;
            }
            let pc = self.pc as usize;
            match self.eval(pc, self.redo) {
                Step::Yield => break true,
                step => self.apply(pc, step),
            }
        };
        (self.pc, self.redo) = saved;
        found
    }

    fn eval(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        match op.kind {
            QueryOpKind::Nothing => Step::Fail,
            QueryOpKind::And | QueryOpKind::AndAny => self.eval_and(pc, redo),
            QueryOpKind::With => self.eval_with(pc, redo),
            QueryOpKind::All => self.eval_all(pc, redo),
            QueryOpKind::Triv | QueryOpKind::TrivData | QueryOpKind::TrivWildcard => {
                self.eval_triv(pc, redo)
            }
            QueryOpKind::Cache
            | QueryOpKind::CacheData
            | QueryOpKind::IsCache
            | QueryOpKind::IsCacheData => self.eval_cache(pc, redo),
            QueryOpKind::Each => self.eval_each(pc, redo),
            QueryOpKind::Or => self.eval_or(pc, redo),
            QueryOpKind::Optional => self.eval_optional(pc, redo),
            QueryOpKind::Not => self.eval_not(pc, redo),
            QueryOpKind::End => self.eval_end(pc, redo),
            QueryOpKind::SetThis => self.eval_set_this(pc, redo),
            QueryOpKind::SetFixed => self.eval_set_fixed(pc, redo),
            QueryOpKind::Toggle => self.eval_toggle(pc, redo),
            QueryOpKind::ToggleOption => self.eval_toggle_option(pc, redo),
            QueryOpKind::Populate | QueryOpKind::PopulateSelf | QueryOpKind::PopulateSparse => {
                self.eval_populate(pc, redo)
            }
            QueryOpKind::Yield => {
                if redo {
                    Step::Fail
                } else {
                    Step::Yield
                }
            }
        }
    }

    // -- helpers ------------------------------------------------------------

    fn op(&self, pc: usize) -> &'w QueryOp {
        let program: &'w QueryProgram = self.program;
        &program.ops[pc]
    }

    fn table(&self, table: TableId) -> Option<&'w Table> {
        let world: &'w World = self.world;
        world.table(table)
    }

    fn table_of(&self, entity: EntityId) -> Option<&'w Table> {
        let world: &'w World = self.world;
        world.table_of(entity)
    }

    fn term(&self, op: &QueryOp) -> &'w CompiledTerm {
        let program: &'w QueryProgram = self.program;
        let Some(term) = op.term.and_then(|t| program.terms.get(t as usize)) else {
            crate::ecs_internal!("query op without a term");
        };
        term
    }

    fn visible(&self, table: &Table) -> bool {
        !table.is_empty() && !table.flags().intersects(self.hidden_flags())
    }

    fn elem_index(&self, op: &QueryOp, elem: TermElem) -> u32 {
        match elem {
            TermElem::Index(index) => index,
            TermElem::Any => builtin::ANY_INDEX,
            TermElem::Wildcard => builtin::WILDCARD_INDEX,
            TermElem::Var(var) if op.is_bound(var) => self.vars[var as usize]
                .entity
                .map_or(builtin::WILDCARD_INDEX, EntityId::index),
            TermElem::Var(_) => builtin::WILDCARD_INDEX,
        }
    }

    /// Term id with bound variables substituted.
    fn pattern(&self, op: &QueryOp, term: &CompiledTerm) -> Id {
        let first = self.elem_index(op, term.first);
        match term.second {
            Some(second) => Id::pair_index(first, self.elem_index(op, second)),
            None => Id::from_index(first),
        }
    }

    /// Bind the unbound variables of `term` to the elements of `matched`.
    fn bind_elems(&mut self, op: &QueryOp, term: &CompiledTerm, matched: Id) -> bool {
        let mut bound: Option<(VarId, EntityId)> = None;
        let slots = [(term.first, matched.first()), (term.second.unwrap_or(TermElem::Any), matched.second())];
        for (elem, index) in slots {
            let TermElem::Var(var) = elem else {
                continue;
            };
            if op.is_bound(var) {
                continue;
            }
            let Some(entity) = self.world.get_alive(index) else {
                return false;
            };
            if let Some((prev_var, prev)) = bound {
                if prev_var == var && prev != entity {
                    return false;
                }
            }
            bound = Some((var, entity));
            self.vars[var as usize].entity = Some(entity);
            self.written |= bit(var as usize);
        }
        true
    }

    fn set_field(&mut self, term: &CompiledTerm, id: Id, src: Option<EntityId>) {
        let mut field = FieldState::unset(id);
        field.set = true;
        field.src = src;
        if let Some(entity) = src {
            if let Some(record) = self.world.record(entity) {
                field.table = record.table;
                field.row = record.row as usize;
            }
        }
        self.fields[term.field as usize] = field;
    }

    fn clear_fields(&mut self, mask: u64) {
        for (i, field) in self.fields.iter_mut().enumerate() {
            if mask & bit(i) != 0 {
                *field = FieldState::unset(self.patterns[i]);
            }
        }
    }

    fn candidates(&self, pattern: Id) -> Vec<TableId> {
        self.world
            .components
            .get_by_id(wildcard_record_key(pattern))
            .map(|r| r.cache().tables().to_vec())
            .unwrap_or_default()
    }

    /// Whether field values for an op on `var` belong to the `$this` rows.
    fn is_this(&self, var: Option<VarId>) -> bool {
        match var {
            Some(0) => true,
            Some(v) => self.program.vars[v as usize].table_var == Some(0),
            None => false,
        }
    }

    // -- term ops -----------------------------------------------------------

    fn eval_and(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let term = self.term(op);
        let Some(src) = op.src else {
            return Step::Fail;
        };
        if self.program.vars[src as usize].kind == VarKind::Entity {
            return self.eval_sparse_search(pc, redo);
        }
        let pattern = self.pattern(op, term);
        let any = op.kind == QueryOpKind::AndAny;
        let bound = op.is_bound(src);

        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.tables = if bound {
                self.vars[src as usize].range.map(|r| vec![r.table]).unwrap_or_default()
            } else {
                self.candidates(pattern)
            };
            ctx.pos = 0;
            ctx.index = 0;
        } else if any {
            ctx.pos += 1;
            ctx.index = 0;
        } else {
            ctx.index += 1;
        }

        let step = loop {
            let Some(&table_id) = ctx.tables.get(ctx.pos) else {
                break Step::Fail;
            };
            let Some(table) = self.table(table_id) else {
                ctx.pos += 1;
                ctx.index = 0;
                continue;
            };
            if !bound && !self.visible(table) {
                ctx.pos += 1;
                ctx.index = 0;
                continue;
            }
            let Some(index) = next_match(table, pattern, ctx.index) else {
                ctx.pos += 1;
                ctx.index = 0;
                continue;
            };
            ctx.index = index;
            let matched = table.type_ids()[index];
            if !self.bind_elems(op, term, matched) {
                ctx.index += 1;
                continue;
            }
            if !bound {
                self.vars[src as usize].range = Some(TableRange {
                    table: table_id,
                    offset: 0,
                    count: table.count(),
                });
                self.written |= bit(src as usize);
            }
            let field_src = if self.is_this(Some(src)) {
                None
            } else {
                self.first_entity(src)
            };
            self.set_field(term, matched, field_src);
            break Step::Next;
        };
        self.ctx[pc] = ctx;
        step
    }

    /// Entity at the start of a table variable's range.
    fn first_entity(&self, var: VarId) -> Option<EntityId> {
        let range = self.vars[var as usize].range?;
        self.table(range.table)?.entities().get(range.offset).copied()
    }

    /// Enumerate entities holding a non-fragmenting id.
    fn eval_sparse_search(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let term = self.term(op);
        let Some(src) = op.src else {
            return Step::Fail;
        };
        let pattern = self.pattern(op, term);
        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.ids = self
                .world
                .components
                .non_fragmenting
                .iter()
                .filter_map(|rid| self.world.components.get(*rid))
                .map(|r| r.id())
                .filter(|id| *id == pattern || id.matches(pattern))
                .collect();
            ctx.pos = 0;
            ctx.index = 0;
        } else {
            ctx.index += 1;
        }
        let step = loop {
            let Some(&id) = ctx.ids.get(ctx.pos) else {
                break Step::Fail;
            };
            let store = self
                .world
                .components
                .get_by_id(id)
                .and_then(|r| r.sparse());
            let Some(entity) = store.and_then(|s| s.entities().get(ctx.index).copied()) else {
                ctx.pos += 1;
                ctx.index = 0;
                continue;
            };
            let visible = self
                .world
                .table_of(entity)
                .is_some_and(|t| !t.flags().intersects(self.hidden_flags()));
            if !visible || !self.bind_elems(op, term, id) {
                ctx.index += 1;
                continue;
            }
            self.vars[src as usize].entity = Some(entity);
            self.written |= bit(src as usize);
            let field_src = if self.is_this(Some(src)) { None } else { Some(entity) };
            self.set_field(term, id, field_src);
            break Step::Next;
        };
        self.ctx[pc] = ctx;
        step
    }

    fn hidden_flags(&self) -> TableFlags {
        let mut hidden = TableFlags::empty();
        if !self.program.match_prefab {
            hidden.insert(TableFlags::IS_PREFAB);
        }
        if !self.program.match_disabled {
            hidden.insert(TableFlags::IS_DISABLED);
        }
        hidden
    }

    /// Match a term against one known entity.
    fn eval_with(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let term = self.term(op);
        let entity = match (op.src, term.src) {
            (Some(var), _) => self.vars[var as usize].entity,
            (None, TermSrc::Fixed(entity)) => Some(entity),
            (None, TermSrc::Var(_)) => None,
        };
        let Some(entity) = entity.filter(|e| self.world.is_alive(*e)) else {
            return Step::Fail;
        };
        let pattern = self.pattern(op, term);
        let field_src = if self.is_this(op.src) { None } else { Some(entity) };

        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.index = 0;
            ctx.ids = if term.non_fragmenting {
                self.world.non_fragmenting_matches(entity, pattern)
            } else {
                Vec::new()
            };
        } else if op.kind == QueryOpKind::AndAny || term.id.is_any() {
            self.ctx[pc] = ctx;
            return Step::Fail;
        } else {
            ctx.index += 1;
        }

        let step = loop {
            let matched = if term.non_fragmenting {
                match ctx.ids.get(ctx.index) {
                    Some(id) => *id,
                    None => break Step::Fail,
                }
            } else {
                let Some(table) = self.table_of(entity) else {
                    break Step::Fail;
                };
                let Some(index) = next_match(table, pattern, ctx.index) else {
                    break Step::Fail;
                };
                ctx.index = index;
                table.type_ids()[index]
            };
            if !self.bind_elems(op, term, matched) {
                ctx.index += 1;
                continue;
            }
            self.set_field(term, matched, field_src);
            break Step::Next;
        };
        self.ctx[pc] = ctx;
        step
    }

    fn eval_all(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let src = op.src.unwrap_or(0);
        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.tables = self
                .world
                .tables()
                .filter(|t| self.visible(t))
                .map(Table::id)
                .collect();
            ctx.pos = 0;
        } else {
            ctx.pos += 1;
        }
        let step = match ctx.tables.get(ctx.pos).and_then(|t| self.table(*t)) {
            Some(table) => {
                self.vars[src as usize].range = Some(TableRange {
                    table: table.id(),
                    offset: 0,
                    count: table.count(),
                });
                self.written |= bit(src as usize);
                Step::Next
            }
            None => Step::Fail,
        };
        self.ctx[pc] = ctx;
        step
    }

    fn eval_triv(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let program: &'w QueryProgram = self.program;
        let terms: Vec<&'w CompiledTerm> = (0..program.terms.len())
            .filter(|t| op.terms & bit(*t) != 0)
            .map(|t| &program.terms[t])
            .collect();
        let Some(driver) = terms.first() else {
            return Step::Fail;
        };
        let with_data = op.kind == QueryOpKind::TrivData;

        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.tables = self.candidates(driver.id);
            ctx.pos = 0;
        } else {
            ctx.pos += 1;
        }
        let step = loop {
            let Some(&table_id) = ctx.tables.get(ctx.pos) else {
                break Step::Fail;
            };
            ctx.pos += 1;
            let Some(table) = self.table(table_id) else {
                continue;
            };
            if !self.visible(table) {
                continue;
            }
            let matches: Option<Vec<usize>> = terms
                .iter()
                .map(|t| table.record(t.id).map(|r| r.index as usize))
                .collect();
            let Some(matches) = matches else {
                continue;
            };
            for (term, index) in terms.iter().zip(matches) {
                self.set_field(term, table.type_ids()[index], None);
                if with_data {
                    self.fields[term.field as usize].column = table.column_of_type_index(index);
                    self.fields[term.field as usize].table = Some(table_id);
                }
            }
            self.vars[0].range = Some(TableRange {
                table: table_id,
                offset: 0,
                count: table.count(),
            });
            self.written |= 1;
            ctx.pos -= 1;
            break Step::Next;
        };
        self.ctx[pc] = ctx;
        step
    }

    fn eval_cache(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let Some(cache) = self.cache else {
            return Step::Fail;
        };
        let with_data = matches!(op.kind, QueryOpKind::CacheData | QueryOpKind::IsCacheData);
        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        ctx.pos = if redo { ctx.pos + 1 } else { 0 };
        let step = loop {
            let Some(entry) = cache.entries().get(ctx.pos) else {
                break Step::Fail;
            };
            let Some(table) = self.table(entry.table).filter(|t| !t.is_empty()) else {
                ctx.pos += 1;
                continue;
            };
            for term in self.program.terms.iter().enumerate().filter(|(i, _)| op.terms & bit(*i) != 0) {
                let field = term.1.field as usize;
                let mut state = FieldState::unset(entry.ids[field]);
                state.set = entry.set & bit(field) != 0;
                if with_data && state.set {
                    state.table = Some(entry.table);
                    state.column = entry.columns[field];
                }
                self.fields[field] = state;
            }
            self.vars[0].range = Some(TableRange {
                table: entry.table,
                offset: 0,
                count: table.count(),
            });
            self.written |= 1;
            break Step::Next;
        };
        self.ctx[pc] = ctx;
        step
    }

    fn eval_each(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let (Some(src), Some(dst)) = (op.src, op.dst) else {
            return Step::Fail;
        };
        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.range = self.vars[src as usize].range;
            ctx.row = ctx.range.map_or(0, |r| r.offset);
        } else {
            ctx.row += 1;
        }
        let step = match ctx.range {
            Some(range) if ctx.row < range.offset + range.count => {
                let entity = self
                    .world
                    .table(range.table)
                    .and_then(|t| t.entities().get(ctx.row).copied());
                match entity {
                    Some(entity) => {
                        self.vars[dst as usize].entity = Some(entity);
                        self.written |= bit(dst as usize);
                        self.vars[src as usize].range = Some(TableRange {
                            table: range.table,
                            offset: ctx.row,
                            count: 1,
                        });
                        if !self.is_this(Some(src)) {
                            self.rebind_fields(src, entity, range.table, ctx.row);
                        }
                        Step::Next
                    }
                    None => Step::Fail,
                }
            }
            _ => {
                self.vars[src as usize].range = ctx.range;
                Step::Fail
            }
        };
        self.ctx[pc] = ctx;
        step
    }

    /// Point fields matched on table variable `var` at the row `Each` bound.
    fn rebind_fields(&mut self, var: VarId, entity: EntityId, table: TableId, row: usize) {
        let program: &'w QueryProgram = self.program;
        for term in program.terms.iter().filter(|t| t.src == TermSrc::Var(var)) {
            let field = &mut self.fields[term.field as usize];
            if field.set {
                field.src = Some(entity);
                field.table = Some(table);
                field.row = row;
            }
        }
    }

    fn eval_or(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let program: &'w QueryProgram = self.program;
        let alternatives: Vec<usize> = (0..program.terms.len())
            .filter(|t| op.terms & bit(*t) != 0)
            .collect();
        let Some(&head) = alternatives.first() else {
            return Step::Fail;
        };

        let src = op.src;
        let table_src = src.filter(|v| program.vars[*v as usize].kind == VarKind::Table);
        let searching = table_src.is_some_and(|v| !op.is_bound(v));
        if !searching {
            if redo {
                return Step::Fail;
            }
            let (table, field_src) = match src {
                Some(v) if table_src.is_some() => (
                    self.vars[v as usize].range.and_then(|r| self.table(r.table)),
                    if self.is_this(Some(v)) { None } else { self.first_entity(v) },
                ),
                Some(v) => {
                    let entity = self.vars[v as usize].entity;
                    (
                        entity.and_then(|e| self.table_of(e)),
                        if self.is_this(Some(v)) { None } else { entity },
                    )
                }
                None => match program.terms[head].src {
                    TermSrc::Fixed(e) => (self.table_of(e), Some(e)),
                    TermSrc::Var(_) => (None, None),
                },
            };
            let Some(table) = table else {
                return Step::Fail;
            };
            for &alt in &alternatives {
                let term = &program.terms[alt];
                if let Some(record) = table.record(term.id) {
                    let matched = table.type_ids()[record.index as usize];
                    self.set_field(term, matched, field_src);
                    return Step::Next;
                }
            }
            return Step::Fail;
        }

        let Some(src) = table_src else {
            return Step::Fail;
        };
        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.alt = 0;
            ctx.tables = self.candidates(program.terms[head].id);
            ctx.pos = 0;
        } else {
            ctx.pos += 1;
        }
        let step = loop {
            let Some(&alt) = alternatives.get(ctx.alt) else {
                break Step::Fail;
            };
            let Some(&table_id) = ctx.tables.get(ctx.pos) else {
                ctx.alt += 1;
                ctx.pos = 0;
                ctx.tables = alternatives
                    .get(ctx.alt)
                    .map(|t| self.candidates(program.terms[*t].id))
                    .unwrap_or_default();
                continue;
            };
            let term = &program.terms[alt];
            let Some(table) = self.table(table_id).filter(|t| self.visible(t)) else {
                ctx.pos += 1;
                continue;
            };
            let earlier = alternatives[..ctx.alt]
                .iter()
                .any(|t| table.record(program.terms[*t].id).is_some());
            let record = table.record(term.id);
            let (true, Some(record)) = (!earlier, record) else {
                ctx.pos += 1;
                continue;
            };
            let matched = table.type_ids()[record.index as usize];
            self.vars[src as usize].range = Some(TableRange {
                table: table_id,
                offset: 0,
                count: table.count(),
            });
            self.written |= bit(src as usize);
            let field_src = if self.is_this(Some(src)) { None } else { self.first_entity(src) };
            self.set_field(term, matched, field_src);
            break Step::Next;
        };
        self.ctx[pc] = ctx;
        step
    }

    // -- blocks -------------------------------------------------------------

    fn eval_optional(&mut self, pc: usize, redo: bool) -> Step {
        let op = self.op(pc);
        let (fields, end) = (op.terms, op.other);
        if !redo {
            let written = self.written;
            let ctx = &mut self.ctx[pc];
            ctx.matched = false;
            ctx.emitted = false;
            ctx.written = written;
            self.clear_fields(fields);
            return Step::Next;
        }
        let ctx = &mut self.ctx[pc];
        if ctx.matched || ctx.emitted {
            return Step::Fail;
        }
        ctx.emitted = true;
        self.written = ctx.written;
        self.clear_fields(fields);
        Step::Jump(end as usize + 1)
    }

    fn eval_not(&mut self, pc: usize, redo: bool) -> Step {
        if redo {
            return Step::Fail;
        }
        let op = self.op(pc);
        let (fields, end) = (op.terms, op.other as usize);
        let written = self.written;
        let vars = self.vars.clone();
        let found = self.probe(pc + 1, end);
        self.written = written;
        self.vars = vars;
        self.clear_fields(fields);
        if found {
            Step::Fail
        } else {
            Step::Jump(end + 1)
        }
    }

    fn eval_end(&mut self, pc: usize, redo: bool) -> Step {
        let opener = self.program.ops[pc].other as usize;
        if !redo {
            self.ctx[opener].matched = true;
            return Step::Next;
        }
        if self.ctx[opener].emitted {
            Step::Back(opener)
        } else {
            Step::Fail
        }
    }

    // -- post-pass ops ------------------------------------------------------

    fn eval_set_this(&mut self, pc: usize, redo: bool) -> Step {
        if redo {
            return Step::Fail;
        }
        let op = self.op(pc);
        let entity = op.src.and_then(|v| self.vars[v as usize].entity);
        let Some(record) = entity.and_then(|e| self.world.record(e)) else {
            return Step::Fail;
        };
        let Some(table) = record.table else {
            return Step::Fail;
        };
        self.vars[0].range = Some(TableRange {
            table,
            offset: record.row as usize,
            count: 1,
        });
        self.written |= 1;
        Step::Next
    }

    fn eval_set_fixed(&mut self, pc: usize, redo: bool) -> Step {
        if redo {
            return Step::Fail;
        }
        let op = self.op(pc);
        let alive = self
            .program
            .terms
            .iter()
            .enumerate()
            .filter(|(i, _)| op.terms & bit(*i) != 0)
            .all(|(_, t)| match t.src {
                TermSrc::Fixed(e) => self.world.is_alive(e),
                TermSrc::Var(_) => true,
            });
        if alive {
            Step::Next
        } else {
            Step::Fail
        }
    }

    fn toggle_enabled(&self, table: &Table, fields: u64, row: usize) -> bool {
        self.fields
            .iter()
            .enumerate()
            .filter(|(i, f)| fields & bit(*i) != 0 && f.set)
            .all(|(_, f)| table.bitset(f.id).map_or(true, |bits| bits.get(row)))
    }

    fn eval_toggle(&mut self, pc: usize, redo: bool) -> Step {
        let fields = self.program.ops[pc].terms;
        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.range = self.vars[0].range;
            ctx.row = ctx.range.map_or(0, |r| r.offset);
        }
        let step = match ctx.range.and_then(|r| Some((r, self.table(r.table)?))) {
            Some((range, table)) => {
                let end = range.offset + range.count;
                let mut row = ctx.row;
                while row < end && !self.toggle_enabled(table, fields, row) {
                    row += 1;
                }
                let start = row;
                while row < end && self.toggle_enabled(table, fields, row) {
                    row += 1;
                }
                ctx.row = row;
                if start < end {
                    self.vars[0].range = Some(TableRange {
                        table: range.table,
                        offset: start,
                        count: row - start,
                    });
                    Step::Next
                } else {
                    self.vars[0].range = ctx.range;
                    Step::Fail
                }
            }
            None if !redo => Step::Next,
            None => Step::Fail,
        };
        self.ctx[pc] = ctx;
        step
    }

    fn eval_toggle_option(&mut self, pc: usize, redo: bool) -> Step {
        let fields = self.program.ops[pc].terms;
        let Some(field) = (0..self.fields.len()).find(|i| fields & bit(*i) != 0) else {
            return Step::Fail;
        };
        let mut ctx = std::mem::take(&mut self.ctx[pc]);
        if !redo {
            ctx.matched = self.fields[field].set;
            ctx.range = self.vars[0].range;
            ctx.row = ctx.range.map_or(0, |r| r.offset);
        }
        let step = if !ctx.matched {
            if redo {
                Step::Fail
            } else {
                Step::Next
            }
        } else {
            let id = self.fields[field].id;
            match ctx.range.and_then(|r| Some((r, self.table(r.table)?))) {
                Some((range, table)) if ctx.row < range.offset + range.count => {
                    let end = range.offset + range.count;
                    let enabled = |row: usize| table.bitset(id).map_or(true, |b| b.get(row));
                    let start = ctx.row;
                    let value = enabled(start);
                    let mut row = start + 1;
                    while row < end && enabled(row) == value {
                        row += 1;
                    }
                    ctx.row = row;
                    self.vars[0].range = Some(TableRange {
                        table: range.table,
                        offset: start,
                        count: row - start,
                    });
                    self.fields[field].set = value;
                    Step::Next
                }
                _ => {
                    self.vars[0].range = ctx.range;
                    self.fields[field].set = true;
                    Step::Fail
                }
            }
        };
        self.ctx[pc] = ctx;
        step
    }

    fn eval_populate(&mut self, pc: usize, redo: bool) -> Step {
        if redo {
            return Step::Fail;
        }
        let op = self.op(pc);
        let world: &'w World = self.world;
        let this_table = self.vars[0].range.map(|r| r.table);
        for (i, field) in self.fields.iter_mut().enumerate() {
            if op.terms & bit(i) == 0 || !field.set {
                continue;
            }
            match op.kind {
                QueryOpKind::PopulateSparse => field.sparse = true,
                QueryOpKind::PopulateSelf => {
                    field.table = this_table;
                    field.column = this_table
                        .and_then(|t| world.table(t))
                        .and_then(|t| t.column_index(field.id));
                }
                _ => {
                    field.column = field
                        .table
                        .and_then(|t| world.table(t))
                        .and_then(|t| t.column_index(field.id));
                }
            }
        }
        Step::Next
    }

    fn snapshot(&self) -> QueryMatch<'w> {
        let vars = self
            .vars
            .iter()
            .enumerate()
            .map(|(i, v)| if self.written & bit(i) != 0 { v.entity } else { None })
            .collect();
        QueryMatch {
            world: self.world,
            program: self.program,
            range: self.vars.first().and_then(|v| v.range).filter(|_| self.written & 1 != 0),
            fields: self.fields.clone(),
            vars,
        }
    }
}

impl<'w> Iterator for QueryCursor<'w> {
    type Item = QueryMatch<'w>;

    fn next(&mut self) -> Option<QueryMatch<'w>> {
        if self.run() {
            Some(self.snapshot())
        } else {
            None
        }
    }
}

// ---------------------------------------------------------------------------
// QueryMatch
// ---------------------------------------------------------------------------

/// One result: a run of `$this` rows plus field and variable values.
pub struct QueryMatch<'w> {
    world: &'w World,
    program: &'w QueryProgram,
    range: Option<TableRange>,
    fields: Vec<FieldState>,
    vars: Vec<Option<EntityId>>,
}

impl<'w> QueryMatch<'w> {
    pub fn table(&self) -> Option<&'w Table> {
        self.world.table(self.range?.table)
    }

    pub fn range(&self) -> Option<TableRange> {
        self.range
    }

    /// `$this` entities of this result. Empty when the query has no terms
    /// on `$this`.
    pub fn entities(&self) -> &'w [EntityId] {
        match (self.table(), self.range) {
            (Some(table), Some(r)) => &table.entities()[r.offset..r.offset + r.count],
            _ => &[],
        }
    }

    pub fn count(&self) -> usize {
        self.range.map_or(0, |r| r.count)
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    /// Matched id of a field. For wildcard terms this is the concrete id.
    pub fn id(&self, field: usize) -> Option<Id> {
        self.fields.get(field).map(|f| f.id)
    }

    /// Whether an optional field matched.
    pub fn is_set(&self, field: usize) -> bool {
        self.fields.get(field).is_some_and(|f| f.set)
    }

    /// Entity the field was matched on, `None` for `$this`.
    pub fn src(&self, field: usize) -> Option<EntityId> {
        self.fields.get(field).and_then(|f| f.src)
    }

    /// Value of a public variable.
    pub fn var(&self, name: &str) -> Option<EntityId> {
        let var = self.program.find_var(name)?;
        self.vars.get(var as usize).copied().flatten()
    }

    /// Column slice of a field, aligned with [`entities`](Self::entities).
    /// Fields matched on another entity yield a single value.
    pub fn field<T: 'static>(&self, field: usize) -> Option<&'w [T]> {
        let state = self.fields.get(field).filter(|f| f.set && !f.sparse)?;
        let table = self.world.table(state.table?)?;
        let column = table.column::<T>(state.column?)?;
        match state.src {
            None => {
                let r = self.range?;
                column.get(r.offset..r.offset + r.count)
            }
            Some(_) => column.get(state.row..state.row + 1),
        }
    }

    /// Value of a field for result row `row`. Works for sparse fields.
    pub fn field_at<T: 'static>(&self, field: usize, row: usize) -> Option<&'w T> {
        let state = self.fields.get(field).filter(|f| f.set)?;
        if !state.sparse {
            let values = self.field::<T>(field)?;
            return match state.src {
                None => values.get(row),
                Some(_) => values.first(),
            };
        }
        let entity = match state.src {
            Some(entity) => entity,
            None => *self.entities().get(row)?,
        };
        let world: &'w World = self.world;
        let record = world.components.get_by_id(state.id)?;
        if !record.type_info().is_some_and(|info| info.is::<T>()) {
            return None;
        }
        // SAFETY: the store holds values of the type checked above.
        unsafe { record.sparse()?.get::<T>(entity) }
    }
}

impl std::fmt::Debug for QueryMatch<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryMatch")
            .field("range", &self.range)
            .field("fields", &self.fields.iter().map(|s| s.id).collect::<Vec<_>>())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Mutable iteration
// ---------------------------------------------------------------------------

struct OwnedMatch {
    range: Option<TableRange>,
    fields: Vec<FieldState>,
    vars: Vec<Option<EntityId>>,
}

/// A result handed to [`World::each_mut`]. Structural changes made through
/// [`world_mut`](Self::world_mut) are deferred until the iteration ends.
pub struct MatchMut<'a> {
    world: &'a mut World,
    program: Arc<QueryProgram>,
    range: Option<TableRange>,
    fields: Vec<FieldState>,
    vars: Vec<Option<EntityId>>,
}

impl MatchMut<'_> {
    pub fn entities(&self) -> &[EntityId] {
        match self.range.and_then(|r| Some((r, self.world.table(r.table)?))) {
            Some((r, table)) => &table.entities()[r.offset..r.offset + r.count],
            None => &[],
        }
    }

    pub fn count(&self) -> usize {
        self.range.map_or(0, |r| r.count)
    }

    pub fn id(&self, field: usize) -> Option<Id> {
        self.fields.get(field).map(|f| f.id)
    }

    pub fn is_set(&self, field: usize) -> bool {
        self.fields.get(field).is_some_and(|f| f.set)
    }

    pub fn var(&self, name: &str) -> Option<EntityId> {
        let var = self.program.find_var(name)?;
        self.vars.get(var as usize).copied().flatten()
    }

    fn rows(&self, state: &FieldState) -> Option<(usize, usize)> {
        match state.src {
            None => self.range.map(|r| (r.offset, r.offset + r.count)),
            Some(_) => Some((state.row, state.row + 1)),
        }
    }

    pub fn field<T: 'static>(&self, field: usize) -> Option<&[T]> {
        let state = self.fields.get(field).filter(|f| f.set && !f.sparse)?;
        let (start, end) = self.rows(state)?;
        let table = self.world.table(state.table?)?;
        table.column::<T>(state.column?)?.get(start..end)
    }

    pub fn field_mut<T: 'static>(&mut self, field: usize) -> Option<&mut [T]> {
        let state = *self.fields.get(field).filter(|f| f.set && !f.sparse)?;
        let (start, end) = self.rows(&state)?;
        let table = self.world.tables.get_mut(state.table?)?;
        table.column_mut::<T>(state.column?)?.get_mut(start..end)
    }

    /// Two `$this` fields of the same table, both mutable.
    pub fn fields_mut<A: 'static, B: 'static>(
        &mut self,
        a: usize,
        b: usize,
    ) -> Option<(&mut [A], &mut [B])> {
        let fa = *self.fields.get(a).filter(|f| f.set && !f.sparse && f.src.is_none())?;
        let fb = *self.fields.get(b).filter(|f| f.set && !f.sparse && f.src.is_none())?;
        let range = self.range?;
        let table = self.world.tables.get_mut(range.table)?;
        let (ca, cb) = table.column_pair_mut::<A, B>(fa.column?, fb.column?)?;
        let rows = range.offset..range.offset + range.count;
        Some((ca.get_mut(rows.clone())?, cb.get_mut(rows)?))
    }

    pub fn world(&self) -> &World {
        &*self.world
    }

    /// The world, deferred for the duration of the iteration.
    pub fn world_mut(&mut self) -> &mut World {
        self.world
    }
}

impl World {
    /// Run `f` for every result of `query` with mutable access to field
    /// columns.
    ///
    /// Results are collected before the first callback. The world is
    /// deferred while callbacks run and each result's table is locked, so
    /// structural changes are queued and applied afterwards. Returns the
    /// number of results visited.
    pub fn each_mut<F>(&mut self, query: &Query, mut f: F) -> Result<usize, EcsError>
    where
        F: FnMut(&mut MatchMut<'_>),
    {
        let matches: Vec<OwnedMatch> = query
            .iter(self)
            .map(|m| OwnedMatch {
                range: m.range,
                fields: m.fields,
                vars: m.vars,
            })
            .collect();
        let count = matches.len();
        let program = query.program_arc();

        let mut world = self.defer();
        for m in matches {
            let table = m.range.map(|r| r.table);
            if let Some(t) = table.and_then(|t| world.tables.get_mut(t)) {
                t.lock += 1;
            }
            let mut view = MatchMut {
                world: &mut *world,
                program: Arc::clone(&program),
                range: m.range,
                fields: m.fields,
                vars: m.vars,
            };
            f(&mut view);
            if let Some(t) = table.and_then(|t| world.tables.get_mut(t)) {
                t.lock = t.lock.saturating_sub(1);
            }
        }
        drop(world);
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::term::{Oper, QueryDesc, Term, TermRef};

    #[derive(Debug, Default, Clone, PartialEq)]
    struct Health(u32);

    fn tags(world: &mut World, names: &[&str]) -> Vec<EntityId> {
        names.iter().map(|n| world.new_named(n).unwrap()).collect()
    }

    fn with(world: &mut World, ids: &[EntityId]) -> EntityId {
        let e = world.new_entity();
        for id in ids {
            world.add_id(e, Id::entity(*id)).unwrap();
        }
        e
    }

    fn sorted(mut v: Vec<EntityId>) -> Vec<EntityId> {
        v.sort();
        v
    }

    #[test]
    fn matching_rows_come_in_one_batch() {
        let mut world = World::new();
        let t = tags(&mut world, &["A", "B"]);
        let e1 = with(&mut world, &[t[0], t[1]]);
        let e2 = with(&mut world, &[t[0], t[1]]);
        let _e3 = with(&mut world, &[t[0]]);

        let query = world.query(&QueryDesc::new().with(t[0]).with(t[1])).unwrap();
        let results: Vec<Vec<EntityId>> = query.iter(&world).map(|m| m.entities().to_vec()).collect();
        assert_eq!(results, vec![vec![e1, e2]]);
    }

    #[test]
    fn not_excludes_tables() {
        let mut world = World::new();
        let t = tags(&mut world, &["A", "B"]);
        let _e1 = with(&mut world, &[t[0], t[1]]);
        let e2 = with(&mut world, &[t[0]]);
        let query = world.query(&QueryDesc::new().with(t[0]).without(t[1])).unwrap();
        assert_eq!(query.entities(&world), vec![e2]);
    }

    #[test]
    fn optional_reports_whether_it_matched() {
        let mut world = World::new();
        let t = tags(&mut world, &["A", "B"]);
        let e1 = with(&mut world, &[t[0], t[1]]);
        let e2 = with(&mut world, &[t[0]]);
        let query = world.query(&QueryDesc::new().with(t[0]).optional(t[1])).unwrap();
        let mut seen: Vec<(EntityId, bool)> = Vec::new();
        for m in query.iter(&world) {
            seen.extend(m.entities().iter().map(|e| (*e, m.is_set(1))));
        }
        seen.sort();
        let mut expected = vec![(e1, true), (e2, false)];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn or_chain_yields_each_table_once() {
        let mut world = World::new();
        let t = tags(&mut world, &["A", "B"]);
        let e1 = with(&mut world, &[t[0]]);
        let e3 = with(&mut world, &[t[0], t[1]]);
        let e2 = with(&mut world, &[t[1]]);
        let desc = QueryDesc::new()
            .term(Term::new(t[0]).oper(Oper::Or))
            .term(Term::new(t[1]));
        let query = world.query(&desc).unwrap();
        assert_eq!(query.program().field_count, 1);
        assert_eq!(sorted(query.entities(&world)), sorted(vec![e1, e2, e3]));
    }

    #[test]
    fn variables_bind_each_target() {
        let mut world = World::new();
        let t = tags(&mut world, &["Likes", "Apples", "Pears"]);
        let (likes, apples, pears) = (t[0], t[1], t[2]);
        let e1 = world.new_entity();
        world.add_pair(e1, likes, apples).unwrap();
        let e2 = world.new_entity();
        world.add_pair(e2, likes, pears).unwrap();
        world.add_pair(e2, likes, apples).unwrap();

        let query = world
            .query(&QueryDesc::new().term(Term::pair(likes, TermRef::var("x"))))
            .unwrap();
        let mut seen: Vec<(EntityId, EntityId)> = Vec::new();
        for m in query.iter(&world) {
            let x = m.var("x").unwrap();
            assert_eq!(m.id(0), Some(Id::pair(likes, x)));
            seen.extend(m.entities().iter().map(|e| (*e, x)));
        }
        seen.sort();
        let mut expected = vec![(e1, apples), (e2, apples), (e2, pears)];
        expected.sort();
        assert_eq!(seen, expected);
    }

    #[test]
    fn source_variable_is_tested_on_its_entity() {
        let mut world = World::new();
        let t = tags(&mut world, &["Likes", "Tasty", "Apple", "Pear"]);
        let (likes, tasty, apple, pear) = (t[0], t[1], t[2], t[3]);
        world.add_id(apple, Id::entity(tasty)).unwrap();
        let e1 = world.new_entity();
        world.add_pair(e1, likes, apple).unwrap();
        let e2 = world.new_entity();
        world.add_pair(e2, likes, pear).unwrap();

        let desc = QueryDesc::new()
            .term(Term::pair(likes, TermRef::var("x")))
            .term(Term::new(tasty).src(TermRef::var("x")));
        let query = world.query(&desc).unwrap();
        let results: Vec<(Vec<EntityId>, Option<EntityId>, Option<EntityId>)> = query
            .iter(&world)
            .map(|m| (m.entities().to_vec(), m.var("x"), m.src(1)))
            .collect();
        assert_eq!(results, vec![(vec![e1], Some(apple), Some(apple))]);
    }

    #[test]
    fn fixed_source_gates_every_result() {
        let mut world = World::new();
        let t = tags(&mut world, &["A", "Paused", "Game"]);
        let (a, paused, game) = (t[0], t[1], t[2]);
        let e = with(&mut world, &[a]);
        let desc = QueryDesc::new().with(a).term(Term::new(paused).src(game));
        let query = world.query(&desc).unwrap();
        assert_eq!(query.count(&world), 0);

        world.add_id(game, Id::entity(paused)).unwrap();
        let results: Vec<_> = query.iter(&world).map(|m| (m.entities().to_vec(), m.src(1))).collect();
        assert_eq!(results, vec![(vec![e], Some(game))]);
    }

    #[test]
    fn fields_read_this_and_fixed_source_columns() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        let game = world.new_entity();
        world.set(game, Health(7)).unwrap();
        let e1 = world.new_entity();
        let e2 = world.new_entity();
        world.set(e1, Health(1)).unwrap();
        world.set(e2, Health(2)).unwrap();

        let desc = QueryDesc::new().with(hp).term(Term::new(hp).src(game));
        let query = world.query(&desc).unwrap();
        let mut rows = Vec::new();
        for m in query.iter(&world) {
            let own = m.field::<Health>(0).unwrap();
            let shared = m.field::<Health>(1).unwrap();
            assert_eq!(shared, &[Health(7)]);
            rows.extend(m.entities().iter().copied().zip(own.iter().cloned()));
        }
        rows.sort_by_key(|(e, _)| *e);
        // `game` has Health too, so it matches on `$this` as well.
        let mut expected = vec![(game, Health(7)), (e1, Health(1)), (e2, Health(2))];
        expected.sort_by_key(|(e, _)| *e);
        assert_eq!(rows, expected);
    }

    #[test]
    fn prefabs_are_skipped_unless_mentioned() {
        let mut world = World::new();
        let t = tags(&mut world, &["A"]);
        let base = with(&mut world, &[t[0], builtin::PREFAB]);
        let e = with(&mut world, &[t[0]]);

        let plain = world.query(&QueryDesc::new().with(t[0])).unwrap();
        assert_eq!(plain.entities(&world), vec![e]);
        let prefabs = world
            .query(&QueryDesc::new().with(t[0]).with(builtin::PREFAB))
            .unwrap();
        assert_eq!(prefabs.entities(&world), vec![base]);
    }

    #[test]
    fn disabled_rows_split_results() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        world.add_id(hp, Id::entity(builtin::CAN_TOGGLE)).unwrap();
        let id = Id::entity(hp);
        let entities: Vec<EntityId> = (0..3).map(|_| world.new_entity()).collect();
        for (i, &e) in entities.iter().enumerate() {
            world.set(e, Health(i as u32)).unwrap();
            world.enable_id(e, id, false).unwrap();
        }
        world.enable_id(entities[0], id, true).unwrap();
        world.enable_id(entities[2], id, true).unwrap();

        let query = world.query(&QueryDesc::new().with(hp)).unwrap();
        let runs: Vec<(Vec<EntityId>, Vec<Health>)> = query
            .iter(&world)
            .map(|m| (m.entities().to_vec(), m.field::<Health>(0).unwrap().to_vec()))
            .collect();
        assert_eq!(
            runs,
            vec![
                (vec![entities[0]], vec![Health(0)]),
                (vec![entities[2]], vec![Health(2)]),
            ]
        );
    }

    #[test]
    fn sparse_values_are_read_per_row() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        world.add_id(hp, Id::entity(builtin::SPARSE)).unwrap();
        let e = world.new_entity();
        world.set(e, Health(7)).unwrap();

        let query = world.query(&QueryDesc::new().with(hp)).unwrap();
        let m = query.iter(&world).next().unwrap();
        assert_eq!(m.entities(), &[e]);
        assert!(m.field::<Health>(0).is_none());
        assert_eq!(m.field_at::<Health>(0, 0), Some(&Health(7)));
    }

    #[test]
    fn non_fragmenting_ids_are_found_per_entity() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        world.add_id(hp, Id::entity(builtin::DONT_FRAGMENT)).unwrap();
        let e1 = world.new_entity();
        let _e2 = world.new_entity();
        world.set(e1, Health(3)).unwrap();

        let query = world.query(&QueryDesc::new().with(hp)).unwrap();
        let results: Vec<_> = query
            .iter(&world)
            .map(|m| (m.entities().to_vec(), m.field_at::<Health>(0, 0).cloned()))
            .collect();
        assert_eq!(results, vec![(vec![e1], Some(Health(3)))]);
    }

    #[test]
    fn cursor_reset_starts_over() {
        let mut world = World::new();
        let t = tags(&mut world, &["A"]);
        with(&mut world, &[t[0]]);
        let query = world.query(&QueryDesc::new().with(t[0])).unwrap();
        let mut cursor = query.iter(&world);
        assert!(cursor.next().is_some());
        assert!(cursor.next().is_none());
        cursor.reset();
        assert!(cursor.next().is_some());
    }

    #[test]
    fn each_mut_defers_structural_changes() {
        let mut world = World::new();
        let hp = world.register_component::<Health>("Health");
        let t = tags(&mut world, &["Marked"]);
        let e1 = world.new_entity();
        let e2 = world.new_entity();
        world.set(e1, Health(1)).unwrap();
        world.set(e2, Health(2)).unwrap();

        let query = world.query(&QueryDesc::new().with(hp)).unwrap();
        let visited = world
            .each_mut(&query, |m| {
                if let Some(values) = m.field_mut::<Health>(0) {
                    values.iter_mut().for_each(|h| h.0 *= 10);
                }
                let entities = m.entities().to_vec();
                for e in entities {
                    m.world_mut().add_id(e, Id::entity(t[0])).unwrap();
                }
                assert!(m.world().pending_commands() > 0);
            })
            .unwrap();
        assert_eq!(visited, 1);
        assert_eq!(world.get::<Health>(e1), Some(&Health(10)));
        assert_eq!(world.get::<Health>(e2), Some(&Health(20)));
        assert!(world.has_id(e1, Id::entity(t[0])));
        assert!(world.has_id(e2, Id::entity(t[0])));
    }

    #[test]
    fn not_scope_with_variable() {
        let mut world = World::new();
        let t = tags(&mut world, &["A", "Likes", "Bad", "Kale", "Apple"]);
        let (a, likes, bad, kale, apple) = (t[0], t[1], t[2], t[3], t[4]);
        world.add_id(kale, Id::entity(bad)).unwrap();
        let e1 = with(&mut world, &[a]);
        world.add_pair(e1, likes, kale).unwrap();
        let e2 = with(&mut world, &[a]);
        world.add_pair(e2, likes, apple).unwrap();
        let e3 = with(&mut world, &[a]);

        // A, !{ (Likes, $x), Bad($x) }
        let desc = QueryDesc::new()
            .with(a)
            .not_scope_open()
            .term(Term::pair(likes, TermRef::var("x")))
            .term(Term::new(bad).src(TermRef::var("x")))
            .scope_close();
        let query = world.query(&desc).unwrap();
        assert_eq!(sorted(query.entities(&world)), sorted(vec![e2, e3]));
    }
}
