//! Queries: term input, compilation to an op program, and execution.
//!
//! ```
//! use tessera_ecs::prelude::*;
//!
//! let mut world = World::new();
//! let likes = world.new_named("Likes").unwrap();
//! let pizza = world.new_named("Pizza").unwrap();
//! let alice = world.new_named("Alice").unwrap();
//! world.add_pair(alice, likes, pizza).unwrap();
//!
//! let query = world
//!     .query(&QueryDesc::new().term(Term::pair(likes, TermRef::var("food"))))
//!     .unwrap();
//! let found: Vec<_> = query
//!     .iter(&world)
//!     .map(|m| (m.entities().to_vec(), m.var("food")))
//!     .collect();
//! assert_eq!(found, vec![(vec![alice], Some(pizza))]);
//! world.release_query(query);
//! ```

pub mod cache;
pub(crate) mod compiler;
pub mod engine;
pub mod program;
pub mod term;

pub use cache::{CacheEntry, Query, QueryCache};
pub use engine::{MatchMut, QueryCursor, QueryMatch, TableRange};
pub use program::{QueryOp, QueryOpKind, QueryProgram, QueryVar, VarKind};
pub use term::{InOut, Oper, QueryDesc, Term, TermItem, TermRef};
