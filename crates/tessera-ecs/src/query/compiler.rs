//! Query compiler: turns a [`QueryDesc`] into a [`QueryProgram`].
//!
//! Compilation runs in fixed phases:
//!
//! 1. validation and variable discovery,
//! 2. fixed-source terms, evaluated once up front,
//! 3. cacheable terms folded into cache ops (cached queries only),
//! 4. batching of trivial table tests,
//! 5. greedy stable ordering of what is left,
//! 6. the post pass: `Each`, `SetThis`, toggles, populate ops and `Yield`.
//!
//! Variables are allocated in one pass over a provisional symbol table:
//! `$this` is always variable 0 and named variables come before anonymous
//! ones.

use tracing::debug;

use crate::entity::EntityId;
use crate::id::{builtin, Id, MAX_RELATIONSHIP_INDEX};
use crate::query::program::{
    CompiledTerm, QueryOp, QueryOpKind, QueryProgram, QueryVar, TermElem, TermSrc, VarId,
    VarKind, MAX_TERMS, MAX_VARS,
};
use crate::query::term::{InOut, Oper, QueryDesc, Term, TermItem, TermRef, THIS_NAME};
use crate::world::World;
use crate::EcsError;

fn invalid(reason: impl Into<String>) -> EcsError {
    EcsError::InvalidQuery {
        reason: reason.into(),
    }
}

#[inline]
fn bit(index: usize) -> u64 {
    1u64 << index
}

/// Compile `desc` against the current state of `world`.
pub(crate) fn compile(world: &World, desc: &QueryDesc) -> Result<QueryProgram, EcsError> {
    let inputs = validate(desc)?;
    if inputs.is_empty() {
        return Ok(QueryProgram {
            ops: vec![QueryOp::new(QueryOpKind::Nothing)],
            vars: vec![this_var(VarKind::Table)],
            terms: Vec::new(),
            field_count: 0,
            field_names: Vec::new(),
            match_prefab: false,
            match_disabled: false,
            cached: false,
        });
    }

    let mut compiler = Compiler::new(world);
    compiler.discover_vars(&inputs)?;
    compiler.compile_terms(&inputs)?;
    let nodes = build_tree(desc);
    compiler.emit(nodes, desc.is_cached());
    let program = compiler.finish();
    debug!(ops = program.ops.len(), vars = program.vars.len(), "query compiled");
    Ok(program)
}

fn this_var(kind: VarKind) -> QueryVar {
    QueryVar {
        name: THIS_NAME.to_owned(),
        kind,
        anonymous: false,
        table_var: None,
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// A term with the scope context it appeared in.
struct InputTerm<'d> {
    term: &'d Term,
    /// Nested inside any scope.
    scoped: bool,
    /// Inside a negated or optional block.
    in_block: bool,
    /// Index of the first term of the Or chain this term belongs to.
    or_head: Option<usize>,
}

fn validate(desc: &QueryDesc) -> Result<Vec<InputTerm<'_>>, EcsError> {
    let mut inputs: Vec<InputTerm<'_>> = Vec::new();
    // Per open scope: negated, number of items seen.
    let mut scopes: Vec<(bool, usize)> = Vec::new();
    let mut chain: Option<usize> = None;
    let items = desc.items();

    for (pos, item) in items.iter().enumerate() {
        match item {
            TermItem::ScopeOpen { not } => {
                if chain.is_some() {
                    return Err(invalid("an or chain cannot contain a scope"));
                }
                if let Some(parent) = scopes.last_mut() {
                    parent.1 += 1;
                }
                scopes.push((*not, 0));
            }
            TermItem::ScopeClose => {
                if chain.is_some() {
                    return Err(invalid("an or chain must end with a term"));
                }
                match scopes.pop() {
                    Some((_, 0)) => return Err(invalid("empty scope")),
                    Some(_) => {}
                    None => return Err(invalid("scope closed without being opened")),
                }
            }
            TermItem::Term(term) => {
                if matches!(term.src, TermRef::Wildcard | TermRef::Any) {
                    return Err(invalid("a term source cannot be a wildcard"));
                }
                if let Some(parent) = scopes.last_mut() {
                    parent.1 += 1;
                }
                let index = inputs.len();
                if let Some(head) = chain {
                    let first = inputs[head].term;
                    if first.src != term.src {
                        return Err(invalid("terms of an or chain must share a source"));
                    }
                    if matches!(term.oper, Oper::Not | Oper::Optional) {
                        return Err(invalid("an or chain cannot end with a not or optional term"));
                    }
                }
                if (chain.is_some() || term.oper == Oper::Or)
                    && (matches!(term.first, TermRef::Var(_) | TermRef::This)
                        || matches!(term.second, Some(TermRef::Var(_) | TermRef::This)))
                {
                    return Err(invalid("or terms cannot use variables in their id"));
                }
                if term.oper == Oper::Or
                    && !matches!(items.get(pos + 1), Some(TermItem::Term(_)))
                {
                    return Err(invalid("an or chain must end with a term"));
                }
                let in_block = term.oper == Oper::Not
                    || term.oper == Oper::Optional
                    || scopes.iter().any(|(not, _)| *not);
                inputs.push(InputTerm {
                    term,
                    scoped: !scopes.is_empty(),
                    in_block,
                    or_head: chain,
                });
                if term.oper == Oper::Or {
                    chain.get_or_insert(index);
                } else {
                    chain = None;
                }
            }
        }
    }
    if !scopes.is_empty() {
        return Err(invalid("scope opened without being closed"));
    }
    if inputs.len() > MAX_TERMS {
        return Err(invalid(format!("a query can have at most {MAX_TERMS} terms")));
    }
    // The head of a chain refers to itself.
    for (i, input) in inputs.iter_mut().enumerate() {
        if input.or_head.is_none() && input.term.oper == Oper::Or {
            input.or_head = Some(i);
        }
    }
    Ok(inputs)
}

// ---------------------------------------------------------------------------
// Term tree
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum Node {
    Term(usize),
    Or(Vec<usize>),
    Block { kind: QueryOpKind, children: Vec<Node> },
    Scope(Vec<Node>),
}

fn build_tree(desc: &QueryDesc) -> Vec<Node> {
    let mut stack: Vec<(Option<bool>, Vec<Node>)> = vec![(None, Vec::new())];
    let mut chain: Vec<usize> = Vec::new();
    let mut index = 0;
    for item in desc.items() {
        match item {
            TermItem::ScopeOpen { not } => stack.push((Some(*not), Vec::new())),
            TermItem::ScopeClose => {
                if let Some((Some(not), children)) = stack.pop() {
                    let node = if not {
                        Node::Block {
                            kind: QueryOpKind::Not,
                            children,
                        }
                    } else {
                        Node::Scope(children)
                    };
                    if let Some(parent) = stack.last_mut() {
                        parent.1.push(node);
                    }
                }
            }
            TermItem::Term(term) => {
                let i = index;
                index += 1;
                let node = if term.oper == Oper::Or {
                    chain.push(i);
                    continue;
                } else if !chain.is_empty() {
                    chain.push(i);
                    Node::Or(std::mem::take(&mut chain))
                } else {
                    match term.oper {
                        Oper::Not => Node::Block {
                            kind: QueryOpKind::Not,
                            children: vec![Node::Term(i)],
                        },
                        Oper::Optional => Node::Block {
                            kind: QueryOpKind::Optional,
                            children: vec![Node::Term(i)],
                        },
                        _ => Node::Term(i),
                    }
                };
                if let Some(top) = stack.last_mut() {
                    top.1.push(node);
                }
            }
        }
    }
    stack.pop().map(|(_, nodes)| nodes).unwrap_or_default()
}

// ---------------------------------------------------------------------------
// Compiler
// ---------------------------------------------------------------------------

#[derive(Default)]
struct VarUse {
    name: String,
    as_src: bool,
    as_elem: bool,
    anonymous: bool,
}

struct Compiler<'w> {
    world: &'w World,
    vars: Vec<QueryVar>,
    terms: Vec<CompiledTerm>,
    in_block: Vec<bool>,
    field_names: Vec<String>,
    ops: Vec<QueryOp>,
    /// Opener and `End` index of every emitted block.
    blocks: Vec<(usize, usize)>,
    written: u64,
    /// Fields whose columns are set by a batched op.
    populated: u64,
    match_prefab: bool,
    match_disabled: bool,
    cached: bool,
}

impl<'w> Compiler<'w> {
    fn new(world: &'w World) -> Self {
        Self {
            world,
            vars: Vec::new(),
            terms: Vec::new(),
            in_block: Vec::new(),
            field_names: Vec::new(),
            ops: Vec::new(),
            blocks: Vec::new(),
            written: 0,
            populated: 0,
            match_prefab: false,
            match_disabled: false,
            cached: false,
        }
    }

    // -- phase 1: variables -------------------------------------------------

    fn discover_vars(&mut self, inputs: &[InputTerm<'_>]) -> Result<(), EcsError> {
        let mut uses: Vec<VarUse> = Vec::new();
        let mut this_src = false;
        let mut this_elem = false;
        let mut this_sparse_src = false;

        for input in inputs {
            let term = input.term;
            if let Some(name) = term.src.var_name() {
                if name == THIS_NAME {
                    this_src = true;
                    if self.first_has_trait(&term.first, builtin::DONT_FRAGMENT) {
                        this_sparse_src = true;
                    }
                }
            }
            for (position, name) in term.var_names().enumerate() {
                let as_src = position == 0 && term.src.var_name().is_some();
                if name == THIS_NAME {
                    if !as_src {
                        this_elem = true;
                    }
                    continue;
                }
                let slot = match uses.iter().position(|u| u.name == name) {
                    Some(slot) => slot,
                    None => {
                        uses.push(VarUse {
                            name: name.to_owned(),
                            anonymous: name.starts_with('_') || input.scoped,
                            ..VarUse::default()
                        });
                        uses.len() - 1
                    }
                };
                if as_src {
                    uses[slot].as_src = true;
                } else {
                    uses[slot].as_elem = true;
                }
            }
        }

        let this_kind = if this_src || !this_elem {
            VarKind::Table
        } else {
            VarKind::Entity
        };
        self.vars.push(this_var(this_kind));

        let entity_var = |name: &str, anonymous: bool| QueryVar {
            name: name.to_owned(),
            kind: VarKind::Entity,
            anonymous,
            table_var: None,
        };
        for u in uses.iter().filter(|u| !u.anonymous) {
            self.vars.push(entity_var(&u.name, false));
        }
        if this_kind == VarKind::Table && (this_elem || this_sparse_src) {
            let mut var = entity_var(THIS_NAME, true);
            var.table_var = Some(0);
            self.vars.push(var);
        }
        for u in uses.iter().filter(|u| u.anonymous) {
            self.vars.push(entity_var(&u.name, true));
        }
        for u in uses.iter().filter(|u| u.as_src) {
            let table = self.vars.len() as VarId;
            self.vars.push(QueryVar {
                name: u.name.clone(),
                kind: VarKind::Table,
                anonymous: true,
                table_var: None,
            });
            if let Some(entity) = self.entity_var_named(&u.name) {
                self.vars[entity as usize].table_var = Some(table);
            }
        }
        if self.vars.len() > MAX_VARS {
            return Err(invalid(format!("a query can have at most {MAX_VARS} variables")));
        }
        Ok(())
    }

    fn first_has_trait(&self, first: &TermRef, trait_: EntityId) -> bool {
        match first {
            TermRef::Entity(e) => self.world.index_has_id(e.index(), Id::entity(trait_)),
            _ => false,
        }
    }

    fn entity_var_named(&self, name: &str) -> Option<VarId> {
        if name == THIS_NAME {
            return self.entity_form(0);
        }
        self.vars
            .iter()
            .position(|v| v.name == name && v.kind == VarKind::Entity)
            .map(|i| i as VarId)
    }

    /// The variable a source name resolves to: its table form if any.
    fn src_var_named(&self, name: &str) -> Option<VarId> {
        if name == THIS_NAME {
            return Some(0);
        }
        let entity = self.entity_var_named(name)?;
        Some(self.vars[entity as usize].table_var.unwrap_or(entity))
    }

    /// Entity variable holding the same value as `var`.
    fn entity_form(&self, var: VarId) -> Option<VarId> {
        if self.vars[var as usize].kind == VarKind::Entity {
            return Some(var);
        }
        self.vars
            .iter()
            .position(|v| v.table_var == Some(var))
            .map(|i| i as VarId)
    }

    // -- term resolution ----------------------------------------------------

    fn resolve_elem(&self, elem: &TermRef) -> Result<TermElem, EcsError> {
        Ok(match elem {
            TermRef::Wildcard => TermElem::Wildcard,
            TermRef::Any => TermElem::Any,
            TermRef::Entity(e) => {
                if !self.world.is_alive(*e) {
                    return Err(invalid(format!("term refers to dead entity {e}")));
                }
                TermElem::Index(e.index())
            }
            TermRef::This | TermRef::Var(_) => {
                let name = elem.var_name().unwrap_or(THIS_NAME);
                let var = self
                    .entity_var_named(name)
                    .ok_or_else(|| invalid(format!("unresolved variable ${name}")))?;
                TermElem::Var(var)
            }
        })
    }

    fn elem_index(elem: TermElem) -> u32 {
        match elem {
            TermElem::Index(index) => index,
            TermElem::Any => builtin::ANY_INDEX,
            TermElem::Var(_) | TermElem::Wildcard => builtin::WILDCARD_INDEX,
        }
    }

    fn elem_str(&self, elem: TermElem) -> String {
        match elem {
            TermElem::Index(index) => self.world.id_str(Id::from_index(index)),
            TermElem::Var(var) => format!("${}", self.vars[var as usize].name),
            TermElem::Wildcard => "*".to_owned(),
            TermElem::Any => "_".to_owned(),
        }
    }

    fn term_str(&self, term: &CompiledTerm) -> String {
        let first = self.elem_str(term.first);
        let id = match term.second {
            Some(second) => format!("({first},{})", self.elem_str(second)),
            None => first,
        };
        match term.src {
            TermSrc::Var(0) => id,
            TermSrc::Var(var) => format!("{id}(${})", self.vars[var as usize].name),
            TermSrc::Fixed(entity) => format!("{id}({})", self.world.id_str(Id::entity(entity))),
        }
    }

    fn has_data(&self, first: TermElem, second: Option<TermElem>) -> bool {
        let registry = &self.world.registry;
        let TermElem::Index(first) = first else {
            return false;
        };
        let Some(second) = second else {
            return registry.get(first).is_some();
        };
        if self.world.index_has_id(first, Id::entity(builtin::PAIR_IS_TAG)) {
            return false;
        }
        if registry.get(first).is_some() {
            return true;
        }
        match second {
            TermElem::Index(target) => registry.get(target).is_some(),
            // Data only if some existing `(R, T)` takes its type from `T`.
            _ => self
                .world
                .components
                .get_by_id(Id::pair_index(first, builtin::WILDCARD_INDEX))
                .is_some_and(|record| {
                    record
                        .members()
                        .any(|member| self.world.type_info_for_id(member).is_some())
                }),
        }
    }

    fn compile_terms(&mut self, inputs: &[InputTerm<'_>]) -> Result<(), EcsError> {
        let mut field_count: u16 = 0;
        for (i, input) in inputs.iter().enumerate() {
            let term = input.term;
            let first = self.resolve_elem(&term.first)?;
            let second = term.second.as_ref().map(|s| self.resolve_elem(s)).transpose()?;
            if let (TermElem::Index(rel), Some(_)) = (first, second) {
                if rel > MAX_RELATIONSHIP_INDEX {
                    return Err(invalid(format!("relationship index {rel} exceeds 24 bits")));
                }
            }
            let src = match &term.src {
                TermRef::Entity(e) => {
                    if !self.world.is_alive(*e) {
                        return Err(invalid(format!("term source {e} is not alive")));
                    }
                    TermSrc::Fixed(*e)
                }
                other => {
                    let name = other.var_name().unwrap_or(THIS_NAME);
                    let var = self
                        .src_var_named(name)
                        .ok_or_else(|| invalid(format!("unresolved variable ${name}")))?;
                    TermSrc::Var(var)
                }
            };

            let id = match second {
                Some(second) => Id::pair_index(Self::elem_index(first), Self::elem_index(second)),
                None => Id::from_index(Self::elem_index(first)),
            };
            let (toggle, sparse, non_fragmenting) = match first {
                TermElem::Index(index) => {
                    let has = |t: EntityId| self.world.index_has_id(index, Id::entity(t));
                    let non_fragmenting = has(builtin::DONT_FRAGMENT);
                    (
                        has(builtin::CAN_TOGGLE),
                        has(builtin::SPARSE) && !non_fragmenting,
                        non_fragmenting,
                    )
                }
                _ => (false, false, false),
            };
            if non_fragmenting && term.oper == Oper::Or {
                return Err(invalid("non-fragmenting ids cannot be part of an or chain"));
            }
            for index in [Self::elem_index(first), second.map_or(0, Self::elem_index)] {
                self.match_prefab |= index == builtin::PREFAB.index();
                self.match_disabled |= index == builtin::DISABLED.index();
            }

            let field = match input.or_head {
                Some(head) if head != i => self.terms[head].field,
                _ => {
                    field_count += 1;
                    field_count - 1
                }
            };
            let compiled = CompiledTerm {
                field,
                first,
                second,
                src,
                oper: term.oper,
                inout: term.inout,
                id,
                has_data: term.oper != Oper::Not && self.has_data(first, second),
                toggle,
                sparse,
                non_fragmenting,
            };
            let name = self.term_str(&compiled);
            if field as usize == self.field_names.len() {
                self.field_names.push(name);
            } else if let Some(existing) = self.field_names.get_mut(field as usize) {
                existing.push_str(" || ");
                existing.push_str(&name);
            }
            self.terms.push(compiled);
            self.in_block.push(input.in_block);
        }
        Ok(())
    }

    // -- op emission --------------------------------------------------------

    fn is_written(&self, var: VarId) -> bool {
        self.written & bit(var as usize) != 0
    }

    /// Whether the value of `var` is available in any form.
    fn is_known(&self, var: VarId) -> bool {
        if self.is_written(var) {
            return true;
        }
        let v = &self.vars[var as usize];
        if v.table_var.is_some_and(|t| self.is_written(t)) {
            return true;
        }
        self.entity_form(var).is_some_and(|e| self.is_written(e))
    }

    fn push(&mut self, mut op: QueryOp) -> usize {
        op.bound = self.written;
        self.ops.push(op);
        self.ops.len() - 1
    }

    fn push_term_op(&mut self, kind: QueryOpKind, term: usize, src: Option<VarId>) {
        let mut op = QueryOp::new(kind);
        op.term = Some(term as u16);
        op.src = src;
        self.push(op);
        if let Some(src) = src {
            self.written |= bit(src as usize);
        }
        let t = &self.terms[term];
        for var in [t.first.var(), t.second.and_then(TermElem::var)].into_iter().flatten() {
            self.written |= bit(var as usize);
        }
    }

    fn push_each(&mut self, table: VarId, entity: VarId) {
        let mut op = QueryOp::new(QueryOpKind::Each);
        op.src = Some(table);
        op.dst = Some(entity);
        self.push(op);
        self.written |= bit(entity as usize);
    }

    /// Bind the entity form of `var` from its table form if only that one
    /// is known.
    fn ensure_entity(&mut self, var: VarId) {
        if self.is_written(var) {
            return;
        }
        if let Some(table) = self.vars[var as usize].table_var {
            if self.is_written(table) {
                self.push_each(table, var);
            }
        }
    }

    fn emit_term(&mut self, index: usize) {
        let term = self.terms[index].clone();
        for var in [term.first.var(), term.second.and_then(TermElem::var)].into_iter().flatten() {
            self.ensure_entity(var);
        }
        let kind = if term.id.is_any() {
            QueryOpKind::AndAny
        } else {
            QueryOpKind::And
        };
        match term.src {
            TermSrc::Fixed(_) => self.push_term_op(QueryOpKind::With, index, None),
            TermSrc::Var(src) => {
                let entity = self.entity_form(src).filter(|e| *e != src);
                match entity {
                    Some(e) if self.is_written(e) => {
                        self.push_term_op(QueryOpKind::With, index, Some(e))
                    }
                    Some(e) if term.non_fragmenting => {
                        if self.is_written(src) {
                            self.push_each(src, e);
                            self.push_term_op(QueryOpKind::With, index, Some(e));
                        } else {
                            self.push_term_op(kind, index, Some(e));
                        }
                    }
                    _ => self.push_term_op(kind, index, Some(src)),
                }
            }
        }
    }

    fn emit_or(&mut self, chain: &[usize]) {
        let Some(&head) = chain.first() else {
            return;
        };
        let mut op = QueryOp::new(QueryOpKind::Or);
        op.term = Some(head as u16);
        op.terms = chain.iter().fold(0, |mask, t| mask | bit(*t));
        let src = match self.terms[head].src {
            TermSrc::Fixed(_) => None,
            TermSrc::Var(src) => match self.entity_form(src).filter(|e| *e != src) {
                Some(e) if self.is_written(e) => Some(e),
                _ => Some(src),
            },
        };
        op.src = src;
        self.push(op);
        if let Some(src) = src {
            self.written |= bit(src as usize);
        }
    }

    fn collect_fields(&self, nodes: &[Node], mask: &mut u64) {
        for node in nodes {
            match node {
                Node::Term(t) => *mask |= bit(self.terms[*t].field as usize),
                Node::Or(chain) => {
                    for t in chain {
                        *mask |= bit(self.terms[*t].field as usize);
                    }
                }
                Node::Block { children, .. } | Node::Scope(children) => {
                    self.collect_fields(children, mask)
                }
            }
        }
    }

    fn uses_this_src(&self, nodes: &[Node]) -> bool {
        nodes.iter().any(|node| match node {
            Node::Term(t) => self.terms[*t].src == TermSrc::Var(0),
            Node::Or(chain) => chain.iter().any(|t| self.terms[*t].src == TermSrc::Var(0)),
            Node::Block { children, .. } | Node::Scope(children) => self.uses_this_src(children),
        })
    }

    fn emit_block(&mut self, kind: QueryOpKind, children: Vec<Node>) {
        if self.vars[0].kind == VarKind::Table && !self.is_known(0) && self.uses_this_src(&children) {
            let mut all = QueryOp::new(QueryOpKind::All);
            all.src = Some(0);
            self.push(all);
            self.written |= bit(0);
        }
        let mut fields = 0;
        self.collect_fields(&children, &mut fields);
        let saved = self.written;
        let mut opener = QueryOp::new(kind);
        opener.terms = fields;
        let opener = self.push(opener);
        self.emit_seq(children);
        let end = self.push(QueryOp::new(QueryOpKind::End));
        self.ops[opener].other = end as i16;
        self.ops[end].other = opener as i16;
        self.blocks.push((opener, end));
        self.written = saved;
    }

    fn emit_node(&mut self, node: Node) {
        match node {
            Node::Term(t) => self.emit_term(t),
            Node::Or(chain) => self.emit_or(&chain),
            Node::Block { kind, children } => self.emit_block(kind, children),
            Node::Scope(children) => self.emit_seq(children),
        }
    }

    fn term_is_known(&self, term: usize) -> bool {
        self.terms[term].vars().any(|v| self.is_known(v))
    }

    /// Emit an AND chain: the first term with a known variable goes next,
    /// else the first remaining term.
    fn flush_chain(&mut self, chain: &mut Vec<usize>) {
        while !chain.is_empty() {
            let pick = chain
                .iter()
                .position(|t| self.term_is_known(*t))
                .unwrap_or(0);
            let term = chain.remove(pick);
            self.emit_term(term);
        }
    }

    fn emit_seq(&mut self, nodes: Vec<Node>) {
        let mut chain = Vec::new();
        for node in nodes {
            match node {
                Node::Term(t) => chain.push(t),
                other => {
                    self.flush_chain(&mut chain);
                    self.emit_node(other);
                }
            }
        }
        self.flush_chain(&mut chain);
    }

    // -- phases 2 to 5 ------------------------------------------------------

    fn is_fixed_and(&self, node: &Node) -> bool {
        matches!(node, Node::Term(t) if matches!(self.terms[*t].src, TermSrc::Fixed(_)))
    }

    /// A term the cache can evaluate: on `$this`, no variables, at most one
    /// match per table.
    fn cacheable_term(&self, term: usize) -> bool {
        let t = &self.terms[term];
        t.src == TermSrc::Var(0)
            && self.vars[0].kind == VarKind::Table
            && !t.is_multi()
            && !t.non_fragmenting
    }

    fn cacheable(&self, node: &Node) -> bool {
        match node {
            Node::Term(t) => self.cacheable_term(*t),
            Node::Block { children, .. } => {
                matches!(children.as_slice(), [Node::Term(t)] if self.cacheable_term(*t))
            }
            _ => false,
        }
    }

    fn trivial(&self, node: &Node) -> bool {
        matches!(node, Node::Term(t) if self.cacheable_term(*t) && !self.terms[*t].toggle)
    }

    fn node_terms(nodes: &[Node]) -> u64 {
        nodes.iter().fold(0, |mask, node| match node {
            Node::Term(t) => mask | bit(*t),
            Node::Block { children, .. } | Node::Scope(children) => mask | Self::node_terms(children),
            Node::Or(chain) => chain.iter().fold(mask, |m, t| m | bit(*t)),
        })
    }

    fn data_fields(&self, terms: u64) -> u64 {
        (0..self.terms.len())
            .filter(|t| terms & bit(*t) != 0)
            .map(|t| &self.terms[t])
            .filter(|t| t.has_data && t.inout != InOut::None && t.oper != Oper::Not && !t.sparse)
            .fold(0, |mask, t| mask | bit(t.field as usize))
    }

    fn emit(&mut self, nodes: Vec<Node>, cached: bool) {
        // Fixed sources first.
        let (fixed, mut rest): (Vec<Node>, Vec<Node>) =
            nodes.into_iter().partition(|n| self.is_fixed_and(n));
        if !fixed.is_empty() {
            let mut op = QueryOp::new(QueryOpKind::SetFixed);
            op.terms = Self::node_terms(&fixed);
            self.push(op);
            for node in fixed {
                self.emit_node(node);
            }
        }

        // Cache.
        if cached {
            let (cacheable, others): (Vec<Node>, Vec<Node>) =
                rest.into_iter().partition(|n| self.cacheable(n));
            let drives = cacheable.iter().any(|n| matches!(n, Node::Term(_)));
            if drives {
                let terms = Self::node_terms(&cacheable);
                let data = self.data_fields(terms);
                let kind = match (others.is_empty(), data != 0) {
                    (true, true) => QueryOpKind::IsCacheData,
                    (true, false) => QueryOpKind::IsCache,
                    (false, true) => QueryOpKind::CacheData,
                    (false, false) => QueryOpKind::Cache,
                };
                let mut op = QueryOp::new(kind);
                op.terms = terms;
                op.src = Some(0);
                self.push(op);
                self.written |= bit(0);
                self.populated |= data;
                self.cached = true;
                rest = others;
            } else {
                rest = cacheable.into_iter().chain(others).collect();
            }
        }

        // Trivial batch.
        if !self.is_known(0) {
            let count = rest.iter().filter(|n| self.trivial(n)).count();
            if count >= 2 {
                let (trivial, others): (Vec<Node>, Vec<Node>) =
                    rest.into_iter().partition(|n| self.trivial(n));
                let terms = Self::node_terms(&trivial);
                let data = self.data_fields(terms);
                let any = (0..self.terms.len())
                    .filter(|t| terms & bit(*t) != 0)
                    .any(|t| self.terms[t].id.is_any());
                let kind = if any {
                    QueryOpKind::TrivWildcard
                } else if data != 0 {
                    QueryOpKind::TrivData
                } else {
                    QueryOpKind::Triv
                };
                let mut op = QueryOp::new(kind);
                op.terms = terms;
                op.src = Some(0);
                self.push(op);
                self.written |= bit(0);
                if kind == QueryOpKind::TrivData {
                    self.populated |= data;
                }
                rest = others;
            }
        }

        // Leading optional runs wait for the first selective node.
        let leading = rest
            .iter()
            .take_while(|n| matches!(n, Node::Block { kind: QueryOpKind::Optional, .. }))
            .count();
        if leading > 0 && leading < rest.len() {
            let tail = rest.split_off(leading);
            let optional = std::mem::replace(&mut rest, tail);
            rest.extend(optional);
        }
        self.emit_seq(rest);
        self.post_pass();
    }

    // -- phase 6 ------------------------------------------------------------

    fn post_pass(&mut self) {
        // Public entity variables found only in table form.
        for var in 1..self.vars.len() {
            let v = &self.vars[var];
            if v.kind == VarKind::Entity && !v.anonymous {
                self.ensure_entity(var as VarId);
            }
        }

        let this_entity = self.entity_form(0).filter(|e| *e != 0);
        if self.vars[0].kind == VarKind::Entity && self.is_written(0) {
            let mut op = QueryOp::new(QueryOpKind::SetThis);
            op.src = Some(0);
            op.dst = Some(0);
            self.push(op);
        } else if let Some(e) = this_entity.filter(|e| !self.is_written(0) && self.is_written(*e)) {
            let mut op = QueryOp::new(QueryOpKind::SetThis);
            op.src = Some(e);
            op.dst = Some(0);
            self.push(op);
            self.written |= bit(0);
        }

        let on_this = |t: &CompiledTerm| {
            matches!(t.src, TermSrc::Var(v) if v == 0 || Some(v) == this_entity)
        };
        let mut toggle = 0;
        let mut toggle_optional = Vec::new();
        for (i, t) in self.terms.iter().enumerate() {
            if !t.toggle || !on_this(t) || t.oper == Oper::Not {
                continue;
            }
            if t.oper == Oper::Optional {
                toggle_optional.push(t.field);
            } else if !self.in_block[i] {
                toggle |= bit(t.field as usize);
            }
        }
        if toggle != 0 {
            let mut op = QueryOp::new(QueryOpKind::Toggle);
            op.terms = toggle;
            op.src = Some(0);
            self.push(op);
        }
        for field in toggle_optional {
            let mut op = QueryOp::new(QueryOpKind::ToggleOption);
            op.terms = bit(field as usize);
            op.src = Some(0);
            self.push(op);
        }

        let mut populate_self = 0;
        let mut populate = 0;
        let mut populate_sparse = 0;
        for (i, t) in self.terms.iter().enumerate() {
            let negated = t.oper == Oper::Not || (self.in_block[i] && t.oper != Oper::Optional);
            if !t.has_data || t.inout == InOut::None || negated {
                continue;
            }
            let field = bit(t.field as usize);
            if t.sparse || t.non_fragmenting {
                populate_sparse |= field;
            } else if on_this(t) {
                populate_self |= field;
            } else {
                populate |= field;
            }
        }
        populate_self &= !self.populated;
        for (kind, mask) in [
            (QueryOpKind::Populate, populate),
            (QueryOpKind::PopulateSelf, populate_self),
            (QueryOpKind::PopulateSparse, populate_sparse),
        ] {
            if mask != 0 {
                let mut op = QueryOp::new(kind);
                op.terms = mask;
                self.push(op);
            }
        }

        self.push(QueryOp::new(QueryOpKind::Yield));
    }

    fn finish(mut self) -> QueryProgram {
        let len = self.ops.len();
        for (i, op) in self.ops.iter_mut().enumerate() {
            op.prev = i as i16 - 1;
            op.next = if i + 1 < len { i as i16 + 1 } else { -1 };
        }
        for &(opener, end) in &self.blocks {
            if self.ops[opener].kind == QueryOpKind::Not {
                self.ops[opener].next = end as i16 + 1;
                if let Some(after) = self.ops.get_mut(end + 1) {
                    after.prev = opener as i16;
                }
            }
        }
        QueryProgram {
            ops: self.ops,
            vars: self.vars,
            field_count: self.field_names.len(),
            terms: self.terms,
            field_names: self.field_names,
            match_prefab: self.match_prefab,
            match_disabled: self.match_disabled,
            cached: self.cached,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::term::Term;

    fn kinds(program: &QueryProgram) -> Vec<QueryOpKind> {
        program.ops.iter().map(|op| op.kind).collect()
    }

    fn setup() -> (World, EntityId, EntityId, EntityId) {
        let mut world = World::new();
        let a = world.new_named("A").unwrap();
        let b = world.new_named("B").unwrap();
        let c = world.new_named("C").unwrap();
        (world, a, b, c)
    }

    #[test]
    fn empty_query_is_nothing() {
        let world = World::new();
        let program = compile(&world, &QueryDesc::new()).unwrap();
        assert_eq!(kinds(&program), vec![QueryOpKind::Nothing]);
    }

    #[test]
    fn compilation_is_deterministic() {
        let (world, a, b, c) = setup();
        let desc = QueryDesc::new()
            .with(a)
            .term(Term::pair(b, TermRef::var("x")))
            .without(c);
        let first = compile(&world, &desc).unwrap();
        let second = compile(&world, &desc).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
    }

    #[test]
    fn plain_terms_are_batched() {
        let (world, a, b, _) = setup();
        let program = compile(&world, &QueryDesc::new().with(a).with(b)).unwrap();
        assert_eq!(kinds(&program), vec![QueryOpKind::Triv, QueryOpKind::Yield]);
        assert_eq!(program.ops[0].terms, 0b11);
    }

    #[test]
    fn single_term_is_not_batched() {
        let (world, a, _, _) = setup();
        let program = compile(&world, &QueryDesc::new().with(a)).unwrap();
        assert_eq!(kinds(&program), vec![QueryOpKind::And, QueryOpKind::Yield]);
    }

    #[test]
    fn fixed_sources_go_first() {
        let (mut world, a, b, _) = setup();
        let bob = world.new_entity();
        let desc = QueryDesc::new()
            .with(a)
            .term(Term::new(b).src(bob));
        let program = compile(&world, &desc).unwrap();
        assert_eq!(
            kinds(&program),
            vec![QueryOpKind::SetFixed, QueryOpKind::With, QueryOpKind::And, QueryOpKind::Yield]
        );
        assert_eq!(program.ops[1].term, Some(1));
    }

    #[test]
    fn this_is_var_zero_and_named_vars_precede_anonymous() {
        let (world, a, b, _) = setup();
        let desc = QueryDesc::new()
            .term(Term::pair(a, TermRef::var("_hidden")))
            .term(Term::pair(b, TermRef::var("who")));
        let program = compile(&world, &desc).unwrap();
        assert_eq!(program.vars[0].name, "this");
        assert_eq!(program.vars[1].name, "who");
        assert!(!program.vars[1].anonymous);
        assert_eq!(program.vars[2].name, "_hidden");
        assert!(program.vars[2].anonymous);
        assert_eq!(program.public_vars().collect::<Vec<_>>(), vec!["who"]);
    }

    #[test]
    fn vars_first_used_in_scope_are_anonymous() {
        let (world, a, b, _) = setup();
        let desc = QueryDesc::new()
            .with(a)
            .not_scope_open()
            .term(Term::pair(b, TermRef::var("t")))
            .scope_close();
        let program = compile(&world, &desc).unwrap();
        let t = program.vars.iter().find(|v| v.name == "t").unwrap();
        assert!(t.anonymous);
    }

    #[test]
    fn not_block_skips_to_after_end() {
        let (world, a, b, _) = setup();
        let program = compile(&world, &QueryDesc::new().with(a).without(b)).unwrap();
        assert_eq!(
            kinds(&program),
            vec![
                QueryOpKind::And,
                QueryOpKind::Not,
                QueryOpKind::And,
                QueryOpKind::End,
                QueryOpKind::Yield
            ]
        );
        assert_eq!(program.ops[1].next, 4);
        assert_eq!(program.ops[1].other, 3);
        assert_eq!(program.ops[4].prev, 1);
    }

    #[test]
    fn leading_optional_is_moved_back() {
        let (world, a, b, _) = setup();
        let program = compile(&world, &QueryDesc::new().optional(a).with(b)).unwrap();
        assert_eq!(program.ops[0].kind, QueryOpKind::And);
        assert_eq!(program.ops[0].term, Some(1));
        assert_eq!(program.ops[1].kind, QueryOpKind::Optional);
    }

    #[test]
    fn unknown_terms_wait_for_known_ones() {
        let (world, a, b, c) = setup();
        // A, B($x), (C, $x): after A binds $this, (C, $x) is known and
        // runs before B($x), which then tests the bound $x.
        let desc = QueryDesc::new()
            .with(a)
            .term(Term::new(b).src(TermRef::var("x")))
            .term(Term::pair(c, TermRef::var("x")));
        let program = compile(&world, &desc).unwrap();
        let order: Vec<u16> = program.ops.iter().filter_map(|op| op.term).collect();
        assert_eq!(order, vec![0, 2, 1]);
        assert_eq!(program.ops[2].kind, QueryOpKind::With);
    }

    #[test]
    fn table_form_is_expanded_per_row() {
        let (world, a, b, _) = setup();
        let desc = QueryDesc::new()
            .term(Term::new(b).src(TermRef::var("x")))
            .term(Term::pair(a, TermRef::var("x")));
        let program = compile(&world, &desc).unwrap();
        assert_eq!(
            kinds(&program),
            vec![QueryOpKind::And, QueryOpKind::Each, QueryOpKind::And, QueryOpKind::Yield]
        );
    }

    #[test]
    fn variable_target_has_data_only_for_typed_pairs() {
        #[derive(Debug, Default, Clone)]
        struct Amount(u32);

        let (mut world, a, b, _) = setup();
        let tagged = QueryDesc::new().term(Term::pair(a, TermRef::var("x")));
        let program = compile(&world, &tagged).unwrap();
        assert!(!program.terms[0].has_data);
        assert_eq!(kinds(&program), vec![QueryOpKind::And, QueryOpKind::Yield]);

        // (B, Amount) takes its type from the target.
        let amount = world.register_component::<Amount>("Amount");
        let e = world.new_entity();
        world.add_pair(e, b, amount).unwrap();
        let typed = QueryDesc::new().term(Term::pair(b, TermRef::var("x")));
        let program = compile(&world, &typed).unwrap();
        assert!(program.terms[0].has_data);
    }

    #[test]
    fn oversized_relationship_index_is_rejected() {
        let (mut world, a, _, _) = setup();
        let big = EntityId::new(1 << 24, 0);
        world.make_alive(big).unwrap();
        let err = compile(&world, &QueryDesc::new().term(Term::pair(big, a))).unwrap_err();
        assert!(matches!(err, EcsError::InvalidQuery { .. }));
        // As a plain id or a target it is fine.
        compile(&world, &QueryDesc::new().with(big).term(Term::pair(a, big))).unwrap();
    }

    #[test]
    fn cached_query_folds_terms() {
        let (world, a, b, _) = setup();
        let program = compile(&world, &QueryDesc::new().with(a).without(b).cached()).unwrap();
        assert_eq!(kinds(&program), vec![QueryOpKind::IsCache, QueryOpKind::Yield]);
        assert!(program.cached);
    }

    #[test]
    fn rejects_malformed_input() {
        let (world, a, b, _) = setup();
        let unbalanced = QueryDesc::new().scope_open().with(a);
        assert!(matches!(compile(&world, &unbalanced), Err(EcsError::InvalidQuery { .. })));
        let stray = QueryDesc::new().with(a).scope_close();
        assert!(compile(&world, &stray).is_err());
        let empty_scope = QueryDesc::new().with(a).scope_open().scope_close();
        assert!(compile(&world, &empty_scope).is_err());
        let wild_src = QueryDesc::new().term(Term::new(a).src(TermRef::Wildcard));
        assert!(compile(&world, &wild_src).is_err());
        let dangling_or = QueryDesc::new().term(Term::new(a).oper(Oper::Or));
        assert!(compile(&world, &dangling_or).is_err());
        let or_var = QueryDesc::new()
            .term(Term::new(a).oper(Oper::Or))
            .term(Term::pair(b, TermRef::var("x")));
        assert!(compile(&world, &or_var).is_err());
    }

    #[test]
    fn too_many_terms_fail() {
        let (world, a, _, _) = setup();
        let desc = (0..=MAX_TERMS).fold(QueryDesc::new(), |d, _| d.with(a));
        assert!(matches!(compile(&world, &desc), Err(EcsError::InvalidQuery { .. })));
    }

    #[test]
    fn display_names_fields() {
        let (world, a, b, _) = setup();
        let desc = QueryDesc::new().term(Term::pair(a, TermRef::var("x"))).without(b);
        let text = compile(&world, &desc).unwrap().to_string();
        assert!(text.contains("(A,$x)"), "{text}");
        assert!(text.contains("not"), "{text}");
    }
}
