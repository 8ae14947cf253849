//! Black-box behavior tests driven entirely through `World`'s public
//! surface, covering cross-cutting frame, scheduling, and reference
//! semantics rather than any single module in isolation.

use frame_ecs::component::{ComponentTypeDef, FieldKind};
use frame_ecs::config::WorldConfig;
use frame_ecs::coroutine::{CoroutineScheduler, StepOutcome, YieldPoint};
use frame_ecs::error::WorldError;
use frame_ecs::planner::{Planner, ScheduleDirective, SystemAccess, SystemDecl};
use frame_ecs::refs::RefEntry;
use frame_ecs::system::SystemBuilder;
use frame_ecs::world::World;

fn build_world(defs: Vec<ComponentTypeDef>) -> World {
    World::create(defs, WorldConfig::default()).unwrap()
}

/// A system that reads and writes two component types only mutates
/// entities holding both, not the union.
#[test]
fn increment_intersection_scenario() {
    let mut world = build_world(vec![
        ComponentTypeDef::new("A").field("value", FieldKind::U8),
        ComponentTypeDef::new("C").field("value", FieldKind::U8),
    ]);
    let a = world.component_type_id("A").unwrap();
    let c = world.component_type_id("C").unwrap();

    let e1 = world.create_entity().unwrap();
    world.add(e1, a).unwrap();
    let e2 = world.create_entity().unwrap();
    world.add(e2, a).unwrap();
    let e3 = world.create_entity().unwrap();
    world.add(e3, a).unwrap();
    world.add(e3, c).unwrap();
    let e4 = world.create_entity().unwrap();
    world.add(e4, c).unwrap();

    let entities = vec![e1, e2, e3, e4];
    let sys = SystemBuilder::new("increment_both")
        .reads(a)
        .writes(a)
        .reads(c)
        .writes(c)
        .build(move |world: &mut World| {
            for &e in &entities {
                if world.has(e, a) && world.has(e, c) {
                    let acc = world.write(e, a)?;
                    let v = acc.get_u8(0)?;
                    acc.set_u8(0, v + 1)?;
                    let acc = world.write(e, c)?;
                    let v = acc.get_u8(0)?;
                    acc.set_u8(0, v + 1)?;
                }
            }
            Ok(())
        });
    world.add_system(sys);
    world.execute().unwrap();

    let sum_a: u32 = [e1, e2, e3, e4]
        .iter()
        .filter(|&&e| world.has(e, a))
        .map(|&e| world.read(e, a).unwrap().get_u8(0).unwrap() as u32)
        .sum();
    let sum_c: u32 = [e1, e2, e3, e4]
        .iter()
        .filter(|&&e| world.has(e, c))
        .map(|&e| world.read(e, c).unwrap().get_u8(0).unwrap() as u32)
        .sum();

    assert_eq!(sum_a, 1);
    assert_eq!(sum_c, 1);
}

/// Deleting a target degrades a live forward ref to `None` immediately,
/// while a stale-capable handle still sees the old target until its limbo
/// window elapses.
#[test]
fn deletion_propagation_scenario() {
    let mut world = build_world(vec![
        ComponentTypeDef::new("GlobalDest"),
        ComponentTypeDef::new("Origin").field("target", FieldKind::Ref),
    ]);
    let dest_ty = world.component_type_id("GlobalDest").unwrap();
    let origin_ty = world.component_type_id("Origin").unwrap();

    let d = world.create_entity().unwrap();
    world.add(d, dest_ty).unwrap();
    let o = world.create_entity().unwrap();
    world.add(o, origin_ty).unwrap();
    world.write_ref(o, origin_ty, 0, Some(d)).unwrap();

    world.delete(d).unwrap();

    assert_eq!(world.read_ref(o, origin_ty, 0).unwrap(), None);

    let stale_o = world.hold(o);
    assert_eq!(world.read_ref(stale_o, origin_ty, 0).unwrap(), Some(d));

    world.execute().unwrap();
    world.execute().unwrap();

    assert_eq!(world.read_ref(stale_o, origin_ty, 0).unwrap(), None);
}

/// Groups G1={A}, G2={C}, G3={D} with directives "G1 after G2", "G2
/// beforeWritersOf(Foo)", and "G3 beforeReadersOf(Foo) after G1" compose
/// transitively into the single order C, A, D.
#[test]
fn schedule_transitivity_scenario() {
    let foo = 0usize;

    let mut planner = Planner::new();
    // SystemC (G2): writes Foo, and explicitly orders itself before any
    // other writer of Foo.
    let c = planner.declare(SystemDecl {
        name: "C".into(),
        access: SystemAccess { reads: vec![], writes: vec![foo], main_thread: false },
        directives: vec![ScheduleDirective::BeforeWritersOf(foo)],
    });
    // SystemA (G1): also writes Foo, so C's beforeWritersOf(Foo) directive
    // reaches it, and is independently declared after G2 (C).
    let a = planner.declare(SystemDecl {
        name: "A".into(),
        access: SystemAccess { reads: vec![], writes: vec![foo], main_thread: false },
        directives: vec![ScheduleDirective::After(c)],
    });
    // SystemD (G3): before any reader of Foo (none declared here), and
    // explicitly after G1 (A).
    let d = planner.declare(SystemDecl {
        name: "D".into(),
        access: SystemAccess::default(),
        directives: vec![ScheduleDirective::BeforeReadersOf(foo), ScheduleDirective::After(a)],
    });

    let (graph, _) = planner.plan().unwrap();
    let order = graph.topologically_sorted_vertices().unwrap();
    let rank: std::collections::HashMap<usize, usize> =
        order.iter().enumerate().map(|(i, &v)| (v, i)).collect();

    assert!(rank[&c] < rank[&a]);
    assert!(rank[&a] < rank[&d]);
}

/// An `AfterFrames(n)` yield only resumes once `n` further frames have
/// elapsed, not before.
#[test]
fn coroutine_wait_for_frames_scenario() {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    let counter = Arc::new(AtomicUsize::new(0));
    let mut sched = CoroutineScheduler::new();
    let c = counter.clone();
    let mut waited_once = false;
    sched.spawn(
        None,
        Box::new(move || {
            if !waited_once {
                waited_once = true;
                c.fetch_add(1, Ordering::SeqCst);
                StepOutcome::Yield(YieldPoint::AfterFrames(2))
            } else {
                c.fetch_add(1, Ordering::SeqCst);
                StepOutcome::Done
            }
        }),
    );

    sched.advance_frame(1.0, |_| false).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    sched.advance_frame(1.0, |_| false).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    sched.advance_frame(1.0, |_| false).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 1);

    sched.advance_frame(1.0, |_| false).unwrap();
    assert_eq!(counter.load(Ordering::SeqCst), 2);
}

/// A removed component stays readable through a stale-capable handle for
/// exactly its configured limbo window, then becomes unreadable.
#[test]
fn resurrect_and_finalize_scenario() {
    let config = WorldConfig { limbo_frames: 3, ..WorldConfig::default() };
    let mut world = World::create(
        vec![ComponentTypeDef::new("B").field("value", FieldKind::U8)],
        config,
    )
    .unwrap();
    let b_ty = world.component_type_id("B").unwrap();

    let e = world.create_entity().unwrap();
    world.add(e, b_ty).unwrap();
    {
        let acc = world.write(e, b_ty).unwrap();
        acc.set_u8(0, 2).unwrap();
    }
    world.remove(e, b_ty).unwrap();
    let stale_e = world.hold(e);

    // Removed but still within the limbo window: a stale-capable handle
    // still observes the last value.
    let acc = world.read(stale_e, b_ty).unwrap();
    assert_eq!(acc.get_u8(0).unwrap(), 2);
    drop(acc);

    world.execute().unwrap();
    world.execute().unwrap();
    let acc = world.read(stale_e, b_ty).unwrap();
    assert_eq!(acc.get_u8(0).unwrap(), 2);
    drop(acc);

    // The limbo window has now fully elapsed; even a stale-capable handle
    // no longer observes the row.
    world.execute().unwrap();
    let err = world.read(stale_e, b_ty).unwrap_err();
    assert!(matches!(err, WorldError::StaleComponentRead { .. }));

    // A plain (non-stale) handle never observes a removed component, even
    // mid-limbo.
    let err2 = world.read(e, b_ty).unwrap_err();
    assert!(matches!(err2, WorldError::StaleComponentRead { .. }));
}

/// A back-reference bucket contains its forward ref exactly once, and
/// disappears once the ref is severed.
#[test]
fn refs_inverse_property() {
    let mut world = build_world(vec![
        ComponentTypeDef::new("GlobalDest"),
        ComponentTypeDef::new("Origin").field("target", FieldKind::Ref),
    ]);
    let dest_ty = world.component_type_id("GlobalDest").unwrap();
    let origin_ty = world.component_type_id("Origin").unwrap();

    let d = world.create_entity().unwrap();
    world.add(d, dest_ty).unwrap();
    let o = world.create_entity().unwrap();
    world.add(o, origin_ty).unwrap();
    world.write_ref(o, origin_ty, 0, Some(d)).unwrap();

    let refs = world.back_refs(d, false);
    assert_eq!(refs, vec![RefEntry { source: o, source_type: origin_ty, field: 0 }]);

    world.write_ref(o, origin_ty, 0, None).unwrap();
    assert!(world.back_refs(d, false).is_empty());
}
