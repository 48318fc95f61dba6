//! Store and query benchmarks.
//!
//! - Table moves: adding and removing a tag on populated entities.
//! - Query iteration: uncached and cached two-term queries over a world
//!   fragmented into many tables.
//! - Mutable iteration: `each_mut` updating one column from another.
//!
//! Run with: `cargo bench --bench store_benchmarks`

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use rand::{Rng, SeedableRng};
use rand_pcg::Pcg64;

use tessera_ecs::prelude::*;

// ---------------------------------------------------------------------------
// Benchmark component types
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Clone, PartialEq)]
struct Position {
    x: f32,
    y: f32,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Velocity {
    dx: f32,
    dy: f32,
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

struct Fixture {
    world: World,
    entities: Vec<EntityId>,
    pos: EntityId,
    vel: EntityId,
    tags: Vec<Id>,
}

/// `count` entities with Position and Velocity, each given a random subset
/// of eight tags so the population spreads over many tables.
fn setup(count: usize) -> Fixture {
    let mut rng = Pcg64::seed_from_u64(0x7e55_e7a);
    let mut world = World::new();
    let pos = world.register_component::<Position>("Position");
    let vel = world.register_component::<Velocity>("Velocity");
    let tags: Vec<Id> = (0..8).map(|_| Id::entity(world.new_entity())).collect();

    let mut entities = Vec::with_capacity(count);
    for i in 0..count {
        let e = world.new_entity();
        world.set(e, Position { x: i as f32, y: 0.0 }).unwrap();
        world.set(e, Velocity { dx: 1.0, dy: 0.5 }).unwrap();
        for &tag in &tags {
            if rng.gen_range(0..4) == 0 {
                world.add_id(e, tag).unwrap();
            }
        }
        entities.push(e);
    }
    Fixture {
        world,
        entities,
        pos,
        vel,
        tags,
    }
}

// ---------------------------------------------------------------------------
// Benchmark 1: table moves
// ---------------------------------------------------------------------------

fn bench_add_remove(c: &mut Criterion) {
    let mut group = c.benchmark_group("add_remove_tag");
    for &count in &[100usize, 1_000, 10_000] {
        let mut fx = setup(count);
        let marker = Id::entity(fx.world.new_entity());
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                for &e in &fx.entities {
                    fx.world.add_id(e, marker).unwrap();
                }
                for &e in &fx.entities {
                    fx.world.remove_id(e, marker).unwrap();
                }
                black_box(fx.world.table_count());
            });
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark 2: query iteration
// ---------------------------------------------------------------------------

fn bench_query_iter(c: &mut Criterion) {
    let mut group = c.benchmark_group("query_iter");
    for &count in &[1_000usize, 10_000] {
        for cached in [false, true] {
            let mut fx = setup(count);
            let mut desc = QueryDesc::new().with(fx.pos).with(fx.vel).without(fx.tags[0]);
            if cached {
                desc = desc.cached();
            }
            let query = fx.world.query(&desc).unwrap();
            let label = if cached { "cached" } else { "uncached" };
            group.bench_with_input(BenchmarkId::new(label, count), &count, |b, _| {
                b.iter(|| {
                    let mut sum = 0.0f32;
                    for m in query.iter(&fx.world) {
                        if let Some(p) = m.field::<Position>(0) {
                            sum += p.iter().map(|p| p.x).sum::<f32>();
                        }
                    }
                    black_box(sum)
                });
            });
            fx.world.release_query(query);
        }
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Benchmark 3: mutable iteration
// ---------------------------------------------------------------------------

fn bench_each_mut(c: &mut Criterion) {
    let mut group = c.benchmark_group("each_mut");
    for &count in &[1_000usize, 10_000] {
        let mut fx = setup(count);
        let query = fx
            .world
            .query(&QueryDesc::new().with(fx.pos).with(fx.vel).cached())
            .unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                fx.world
                    .each_mut(&query, |m| {
                        if let Some((p, v)) = m.fields_mut::<Position, Velocity>(0, 1) {
                            for (p, v) in p.iter_mut().zip(v.iter()) {
                                p.x += v.dx;
                                p.y += v.dy;
                            }
                        }
                    })
                    .unwrap()
            });
        });
        fx.world.release_query(query);
    }
    group.finish();
}

criterion_group!(benches, bench_add_remove, bench_query_iter, bench_each_mut);
criterion_main!(benches);
