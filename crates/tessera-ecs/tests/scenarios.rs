//! End-to-end scenarios for the store and the query engine.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tessera_ecs::prelude::*;

#[derive(Debug, Default, Clone, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Marker;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tag(world: &mut World, name: &str) -> Id {
    Id::entity(world.new_named(name).unwrap())
}

// -- storage ---------------------------------------------------------------

#[test]
fn adding_first_tag_creates_single_id_type() {
    init_tracing();
    let mut world = World::new();
    let a = tag(&mut world, "A");
    let e = world.new_entity();
    assert!(world.type_of(e).unwrap().is_empty());
    world.add_id(e, a).unwrap();
    assert_eq!(world.type_of(e).unwrap(), &[a]);
}

#[test]
fn types_stay_sorted_through_add_and_remove() {
    let mut world = World::new();
    let a = tag(&mut world, "A");
    let b = tag(&mut world, "B");
    let e = world.new_entity();
    world.add_id(e, b).unwrap();
    world.add_id(e, a).unwrap();
    assert_eq!(world.type_of(e).unwrap(), &[a, b]);
    world.remove_id(e, a).unwrap();
    assert_eq!(world.type_of(e).unwrap(), &[b]);
}

#[test]
fn same_type_shares_one_table() {
    let mut world = World::new();
    let a = tag(&mut world, "A");
    let b = tag(&mut world, "B");
    let e1 = world.new_entity();
    let e2 = world.new_entity();
    world.add_id(e1, a).unwrap();
    world.add_id(e1, b).unwrap();
    world.add_id(e2, b).unwrap();
    world.add_id(e2, a).unwrap();
    let t1 = world.record(e1).unwrap().table;
    let t2 = world.record(e2).unwrap().table;
    assert!(t1.is_some());
    assert_eq!(t1, t2);
    assert_eq!(world.table(t1.unwrap()).unwrap().count(), 2);
}

#[test]
fn on_add_hook_runs_once_before_queries_see_the_entity() {
    let mut world = World::new();
    let a = world.register_component::<Marker>("A");
    let calls = Arc::new(AtomicUsize::new(0));
    let rows = Arc::new(AtomicUsize::new(0));
    let (calls_hook, rows_hook) = (Arc::clone(&calls), Arc::clone(&rows));
    world
        .set_hooks(
            a,
            TypeHooks::new().on_add(move |it| {
                calls_hook.fetch_add(1, Ordering::SeqCst);
                rows_hook.fetch_add(it.count(), Ordering::SeqCst);
            }),
        )
        .unwrap();
    let query = world.query(&QueryDesc::new().with(a)).unwrap();
    let e = world.new_entity();
    assert_eq!(query.count(&world), 0);
    world.add_id(e, Id::entity(a)).unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(rows.load(Ordering::SeqCst), 1);
    assert_eq!(query.entities(&world), vec![e]);
    world.release_query(query);
}

// -- queries ---------------------------------------------------------------

#[test]
fn two_term_query_yields_shared_table_in_one_batch() {
    let mut world = World::new();
    let a = tag(&mut world, "A");
    let b = tag(&mut world, "B");
    let both: Vec<EntityId> = (0..2)
        .map(|_| {
            let e = world.new_entity();
            world.add_id(e, a).unwrap();
            world.add_id(e, b).unwrap();
            e
        })
        .collect();
    let only_a = world.new_entity();
    world.add_id(only_a, a).unwrap();

    let query = world
        .query(&QueryDesc::new().term(Term::id(a)).term(Term::id(b)))
        .unwrap();
    let batches: Vec<Vec<EntityId>> = query.iter(&world).map(|m| m.entities().to_vec()).collect();
    assert_eq!(batches, vec![both]);
    world.release_query(query);
}

#[test]
fn deleting_an_id_used_by_a_query_is_rejected() {
    let mut world = World::new();
    let a = world.new_named("A").unwrap();
    let e = world.new_entity();
    world.add_id(e, Id::entity(a)).unwrap();
    let query = world.query(&QueryDesc::new().with(a)).unwrap();

    let err = world.delete(a).unwrap_err();
    assert!(matches!(err, EcsError::IdInUseByQuery { .. }));
    // Still usable while the query lives.
    let other = world.new_entity();
    world.add_id(other, Id::entity(a)).unwrap();
    assert_eq!(query.count(&world), 2);

    world.release_query(query);
    world.delete(a).unwrap();
    assert!(!world.is_alive(a));
    assert!(!world.has_id(e, Id::entity(a)));
}

#[test]
fn iteration_updates_component_columns() {
    let mut world = World::new();
    let pos = world.register_component::<Position>("Position");
    let entities: Vec<EntityId> = (0..4).map(|_| world.new_entity()).collect();
    for (i, &e) in entities.iter().enumerate() {
        world.set(e, Position { x: i as f32, y: 0.0 }).unwrap();
    }
    let query = world.query(&QueryDesc::new().with(pos).cached()).unwrap();
    world
        .each_mut(&query, |m| {
            if let Some(values) = m.field_mut::<Position>(0) {
                for p in values {
                    p.y = p.x * 2.0;
                }
            }
        })
        .unwrap();
    for (i, &e) in entities.iter().enumerate() {
        assert_eq!(world.get::<Position>(e).unwrap().y, i as f32 * 2.0);
    }
    world.release_query(query);
}

#[test]
fn child_of_cascade_deletes_children() {
    let mut world = World::new();
    let parent = world.new_entity();
    let child = world.new_entity();
    world.add_pair(child, builtin::CHILD_OF, parent).unwrap();
    assert_eq!(world.parent(child), Some(parent));

    let query = world
        .query(&QueryDesc::new().with_pair(builtin::CHILD_OF, TermRef::var("p")))
        .unwrap();
    let found: Vec<_> = query.iter(&world).map(|m| (m.entities().to_vec(), m.var("p"))).collect();
    assert_eq!(found, vec![(vec![child], Some(parent))]);
    world.release_query(query);

    world.delete(parent).unwrap();
    assert!(!world.is_alive(child));
}

#[test]
fn deferred_changes_apply_in_order() {
    let mut world = World::new();
    let a = tag(&mut world, "A");
    let e = world.new_entity();
    {
        let mut deferred = world.defer();
        deferred.add_id(e, a).unwrap();
        deferred.remove_id(e, a).unwrap();
        deferred.add_id(e, a).unwrap();
        assert!(!deferred.has_id(e, a));
    }
    assert!(world.has_id(e, a));
    assert_eq!(world.last_apply_report().success_count, 3);
}

#[test]
fn config_loads_from_json() {
    let config = WorldConfig::from_json(r#"{ "check_constraints": false }"#).unwrap();
    let world = World::with_config(config);
    assert!(!world.config().check_constraints);
    let stats = world.stats();
    assert_eq!(stats.queries, 0);
}
