use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use g1::{
    Config, GcCause, GcError, GcEvent, Heap, MarkWord, Mutator, ObjectRef, PauseKind, Root,
    RootVisitor, Shape,
};

const MB: usize = 1024 * 1024;
const KB: usize = 1024;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn heap_with(regions: usize, config: Config) -> Arc<Heap> {
    init_logger();
    Heap::new(Config {
        initial_heap_size: regions * MB,
        max_heap_size: regions * MB,
        region_size: Some(MB),
        parallel_gc_threads: 2,
        ..config
    })
    .unwrap()
}

/// Prepends `count` nodes carrying `(i, i * i)` to the list rooted at `head`, with
/// some unreachable garbage between them.
fn build_list(m: &mut Mutator, head: &Root, count: u64) {
    for i in 0..count {
        let node = m.allocate(Shape::plain(1, 2)).unwrap();
        let next = m.get(head);
        m.write_ref(node, 0, next);
        m.write_data(node, 0, i);
        m.write_data(node, 1, i * i);
        m.set_root(head, Some(node));
        if i % 4 == 0 {
            m.allocate(Shape::ref_array(16)).unwrap();
        }
    }
}

fn walk_list(m: &Mutator, head: &Root) -> Vec<(u64, u64)> {
    let mut out = Vec::new();
    let mut cur = m.get(head);
    while let Some(node) = cur {
        out.push((m.read_data(node, 0), m.read_data(node, 1)));
        cur = m.read_ref(node, 0);
    }
    out
}

fn expected_list(count: u64) -> Vec<(u64, u64)> {
    (0..count).rev().map(|i| (i, i * i)).collect()
}

#[test]
fn liveness_is_preserved_across_pauses() {
    let heap = heap_with(
        32,
        Config {
            verify_after_gc: true,
            ..Config::deterministic()
        },
    );
    let mut m = heap.attach_current_thread();
    let head = m.root(None);
    build_list(&mut m, &head, 500);

    for round in 0..3 {
        let summary = m.collect_young();
        assert!(!summary.evacuation_failed);
        assert_eq!(walk_list(&m, &head), expected_list(500), "after young pause {}", round);
    }
    let full = m.collect_full();
    assert_eq!(full.live_objects, 500);
    assert_eq!(walk_list(&m, &head), expected_list(500));

    build_list(&mut m, &head, 100);
    m.collect_young();
    let mut expected = expected_list(100);
    expected.extend(expected_list(500));
    assert_eq!(walk_list(&m, &head), expected);

    assert_eq!(m.verify().objects, 600);

    drop(m);
    heap.shutdown();
}

#[test]
fn eight_region_heap_recycles_dead_young_regions() {
    let heap = heap_with(8, Config::deterministic());
    let mut m = heap.attach_current_thread();
    assert_eq!(heap.young_list_target_length(), 8);

    let object = Shape::with_size_in_bytes(900 * KB);
    for _ in 0..9 {
        m.allocate(object).unwrap();
    }

    assert_eq!(heap.total_collections(), 1);
    let stats = heap.statistics();
    assert_eq!(stats.pauses, 1);
    assert_eq!(stats.evacuation_failures, 0);
    let pause = stats.last_pause.unwrap();
    assert_eq!(pause.cause, GcCause::AllocationFailure);
    assert_eq!(pause.cs_regions, 8);
    assert_eq!(pause.regions_freed, 8);
    assert!(!pause.evacuation_failed);
    assert_eq!(pause.objects_copied, 0);
    assert!(pause.used_after_bytes < heap.region_size());
    // The ninth object lives in a recycled region.
    assert_eq!(heap.young_list_length(), 1);

    drop(m);
    heap.shutdown();
}

#[test]
fn remembered_set_follows_a_moved_source() {
    let heap = heap_with(
        16,
        Config {
            use_survivor_space: false,
            ..Config::deterministic()
        },
    );
    let mut m = heap.attach_current_thread();

    let b = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(b, 0, 42);
    let root_b = m.root(Some(b));
    m.collect_young();
    let b = m.get(&root_b).unwrap();
    assert!(heap.regions().addr_to_region(b.address()).is_old());

    let a = m.allocate(Shape::plain(1, 0)).unwrap();
    let root_a = m.root(Some(a));
    let b = m.get(&root_b).unwrap();
    m.write_ref(a, 0, Some(b));
    let a_region = heap.regions().addr_to_region(a.address()).index();

    let summary = m.collect_young();
    assert_eq!(summary.objects_copied, 1);
    let a_new = m.get(&root_a).unwrap();
    let b_after = m.get(&root_b).unwrap();
    assert_ne!(a_new, a);
    assert_eq!(b_after, b);
    assert_eq!(m.read_ref(a_new, 0), Some(b));
    assert_eq!(m.read_data(b, 0), 42);

    let regions = heap.regions();
    let new_region = regions.addr_to_region(a_new.address());
    assert_ne!(new_region.index(), a_region);
    assert!(new_region.is_old());
    assert_ne!(new_region.index(), regions.addr_to_region(b.address()).index());
    let card = regions.card_index(a_new.slot(0));
    assert!(regions.addr_to_region(b.address()).rem_set().contains_reference(card));

    drop(m);
    heap.shutdown();
}

fn no_copy_space() -> Config {
    Config {
        max_survivor_regions: Some(0),
        max_tenured_regions: Some(0),
        verify_after_gc: true,
        ..Config::deterministic()
    }
}

#[test]
fn objects_that_cannot_be_copied_are_forwarded_to_themselves() {
    let heap = heap_with(16, no_copy_space());
    let mut m = heap.attach_current_thread();

    let mut roots = Vec::new();
    let mut marks = Vec::new();
    for i in 0..3u32 {
        let obj = m.allocate(Shape::plain(1, 1)).unwrap();
        let mark = MarkWord::prototype().with_hash(0x100 + i).with_locked(true);
        obj.set_mark(mark);
        m.write_data(obj, 0, i as u64);
        roots.push(m.root(Some(obj)));
        marks.push(mark);
    }
    for i in 0..2 {
        let from = m.get(&roots[i]).unwrap();
        let to = m.get(&roots[i + 1]);
        m.write_ref(from, 0, to);
    }
    let before: Vec<ObjectRef> = roots.iter().map(|r| m.get(r).unwrap()).collect();

    let summary = m.collect_young();
    assert!(summary.evacuation_failed);
    assert_eq!(summary.self_forwarded, 3);
    assert_eq!(summary.objects_copied, 0);
    assert_eq!(summary.failed_regions, 1);
    assert_eq!(summary.regions_freed, 0);

    let after: Vec<ObjectRef> = roots.iter().map(|r| m.get(r).unwrap()).collect();
    assert_eq!(before, after);
    assert!(heap.regions().addr_to_region(after[0].address()).is_old());

    let mut found = Vec::new();
    m.object_iterate(|obj| found.push((obj, obj.mark())));
    assert_eq!(found.len(), 3);
    for (i, obj) in after.iter().enumerate() {
        let (_, mark) = found.iter().find(|(o, _)| o == obj).unwrap();
        assert_eq!(*mark, marks[i]);
        assert_eq!(m.read_data(*obj, 0), i as u64);
    }
    assert_eq!(m.read_ref(after[0], 0), Some(after[1]));
    assert_eq!(m.read_ref(after[1], 0), Some(after[2]));
    assert_eq!(m.read_ref(after[2], 0), None);
    assert_eq!(heap.statistics().evacuation_failures, 1);

    drop(m);
    heap.shutdown();
}

#[test]
fn failed_objects_keep_references_and_remembered_sets() {
    let heap = heap_with(16, no_copy_space());
    let mut m = heap.attach_current_thread();

    // A full collection is the only way into an old region without copy space.
    let target = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(target, 0, 7);
    let root_target = m.root(Some(target));
    m.collect_full();
    let target = m.get(&root_target).unwrap();
    assert!(heap.regions().addr_to_region(target.address()).is_old());

    let holder = m.allocate(Shape::plain(2, 0)).unwrap();
    let mark = MarkWord::prototype().with_age(3).with_hash(77);
    holder.set_mark(mark);
    let root_holder = m.root(Some(holder));
    let target = m.get(&root_target).unwrap();
    let young = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(young, 0, 9);
    let holder = m.get(&root_holder).unwrap();
    m.write_ref(holder, 0, Some(target));
    m.write_ref(holder, 1, Some(young));

    let summary = m.collect_young();
    assert_eq!(summary.self_forwarded, 2);
    let holder_after = m.get(&root_holder).unwrap();
    assert_eq!(holder_after, holder);
    assert_eq!(holder_after.mark(), mark);
    assert_eq!(m.read_ref(holder_after, 0), Some(target));
    let young_after = m.read_ref(holder_after, 1).unwrap();
    assert_eq!(young_after, young);
    assert_eq!(m.read_data(young_after, 0), 9);

    let regions = heap.regions();
    let card = regions.card_index(holder_after.slot(0));
    assert!(regions.addr_to_region(target.address()).rem_set().contains_reference(card));

    drop(m);
    heap.shutdown();
}

#[test]
fn region_lists_stay_disjoint_under_churn() {
    let heap = heap_with(
        24,
        Config {
            conc_refine: true,
            conc_zero_fill: true,
            conc_zf_max_regions: 4,
            verify_after_gc: true,
            ..Config::deterministic()
        },
    );
    let mut m = heap.attach_current_thread();
    let head = m.root(None);
    for round in 0..6u64 {
        build_list(&mut m, &head, 2000);
        for _ in 0..40 {
            m.allocate(Shape::with_size_in_bytes(64 * KB)).unwrap();
        }
        if round % 2 == 1 {
            m.set_root(&head, None);
        }
        let census = m.verify();
        assert_eq!(
            census.free
                + census.unclean
                + census.young
                + census.survivor
                + census.old
                + census.humongous,
            census.committed,
            "round {}: {:?}",
            round,
            census
        );
    }
    assert!(heap.total_collections() > 0);

    drop(m);
    heap.shutdown();
}

#[test]
fn full_collection_compacts_and_frees_dead_humongous_objects() {
    let heap = heap_with(
        32,
        Config {
            verify_after_gc: true,
            ..Config::deterministic()
        },
    );
    let mut m = heap.attach_current_thread();
    let head = m.root(None);
    build_list(&mut m, &head, 300);
    m.allocate(Shape::with_size_in_bytes(2 * MB + MB / 2)).unwrap();
    let kept = m.allocate(Shape::plain(0, 3 * MB as u32 / 16)).unwrap();
    let last = kept.data_words() - 1;
    m.write_data(kept, last, 0xabcd);
    let kept_root = m.root(Some(kept));
    let kept_address = kept.address();
    let humongous_before = m.verify().humongous;
    assert!(humongous_before >= 5);

    m.collect(GcCause::Explicit);
    let full = heap.statistics().last_full_collection.unwrap();
    assert_eq!(full.cause, GcCause::Explicit);
    assert_eq!(full.humongous_regions_freed, 3);
    assert_eq!(full.live_objects, 301);
    assert!(full.used_after_bytes < full.used_before_bytes);

    let census = m.verify();
    assert_eq!(census.young, 0);
    assert_eq!(census.survivor, 0);
    assert_eq!(census.humongous, humongous_before - 3);
    assert_eq!(walk_list(&m, &head), expected_list(300));
    let kept = m.get(&kept_root).unwrap();
    assert_eq!(kept.address(), kept_address);
    assert_eq!(m.read_data(kept, last), 0xabcd);
    assert_eq!(heap.full_collections(), 1);

    drop(m);
    heap.shutdown();
}

#[test]
fn humongous_objects_are_not_moved_by_pauses() {
    let heap = heap_with(16, Config::deterministic());
    let mut m = heap.attach_current_thread();
    let big = m.allocate(Shape::ref_array(200_000)).unwrap();
    let small = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(small, 0, 5);
    m.write_ref(big, 199_999, Some(small));
    let root = m.root(Some(big));

    m.collect_young();
    let big_after = m.get(&root).unwrap();
    assert_eq!(big_after, big);
    let small_after = m.read_ref(big_after, 199_999).unwrap();
    assert_ne!(small_after, small);
    assert_eq!(m.read_data(small_after, 0), 5);

    m.release(root);
    let full = m.collect_full();
    assert_eq!(full.humongous_regions_freed, 2);
    assert_eq!(m.verify().humongous, 0);

    drop(m);
    heap.shutdown();
}

#[test]
fn exhausted_heap_reports_out_of_memory_and_recovers() {
    let heap = heap_with(4, Config::deterministic());
    let mut m = heap.attach_current_thread();
    let chunk = Shape::with_size_in_bytes(512 * KB);
    let mut roots = Vec::new();
    let err = loop {
        match m.allocate(chunk) {
            Ok(obj) => roots.push(m.root(Some(obj))),
            Err(err) => break err,
        }
        assert!(roots.len() <= 8, "a 4MB heap cannot hold {} chunks", roots.len());
    };
    assert!(matches!(err, GcError::OutOfMemory { requested } if requested == 512 * KB));
    assert!(heap.full_collections() >= 1);

    for root in roots.drain(..) {
        m.release(root);
    }
    m.collect_full();
    assert!(m.allocate(chunk).is_ok());

    drop(m);
    heap.shutdown();
}

#[test]
fn heap_expands_for_live_data_and_shrinks_after_full_collection() {
    init_logger();
    let heap = Heap::new(Config {
        initial_heap_size: 4 * MB,
        max_heap_size: 64 * MB,
        region_size: Some(MB),
        parallel_gc_threads: 2,
        ..Config::deterministic()
    })
    .unwrap();
    let initial = heap.capacity();
    let mut m = heap.attach_current_thread();
    let head = m.root(None);
    build_list(&mut m, &head, 200_000);
    let grown = heap.capacity();
    assert!(grown > initial);
    assert!(heap.statistics().heap_expansions >= 1);
    assert_eq!(walk_list(&m, &head).len(), 200_000);

    m.set_root(&head, None);
    let full = m.collect_full();
    assert!(full.committed_after_bytes < grown);
    assert!(heap.capacity() >= initial);
    assert!(heap.statistics().heap_shrinks >= 1);

    drop(m);
    heap.shutdown();
}

#[test]
fn listeners_and_statistics_see_every_collection() {
    let heap = heap_with(16, Config::deterministic());
    let prologues = Arc::new(AtomicUsize::new(0));
    let epilogues = Arc::new(AtomicUsize::new(0));
    let fulls = Arc::new(AtomicUsize::new(0));
    {
        let prologues = prologues.clone();
        let epilogues = epilogues.clone();
        let fulls = fulls.clone();
        heap.add_listener(Box::new(move |event: &GcEvent| match event {
            GcEvent::PausePrologue { .. } => {
                prologues.fetch_add(1, Ordering::Relaxed);
            }
            GcEvent::PauseEpilogue(_) => {
                epilogues.fetch_add(1, Ordering::Relaxed);
            }
            GcEvent::FullCollection(_) => {
                fulls.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }));
    }
    let mut m = heap.attach_current_thread();
    let head = m.root(None);
    build_list(&mut m, &head, 100);
    m.collect(GcCause::YoungPause);
    m.collect_young();
    m.collect(GcCause::Explicit);

    assert_eq!(prologues.load(Ordering::Relaxed), 2);
    assert_eq!(epilogues.load(Ordering::Relaxed), 2);
    assert_eq!(fulls.load(Ordering::Relaxed), 1);
    let stats = heap.statistics();
    assert_eq!(stats.pauses, 2);
    assert_eq!(stats.young_pauses, 2);
    assert_eq!(stats.full_collections, 1);
    assert!(stats.objects_copied >= 100);
    let report = stats.to_string();
    assert!(report.contains("Full collections: 1"));
    assert!(report.contains("Last pause"));

    drop(m);
    heap.shutdown();
}

#[test]
fn global_roots_and_root_providers_are_updated() {
    let heap = heap_with(16, Config::deterministic());
    let mut m = heap.attach_current_thread();

    let global = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(global, 0, 11);
    let global_root = heap.add_global_root(Some(global));

    let external: Arc<Mutex<Option<ObjectRef>>> = Arc::new(Mutex::new(None));
    let provided = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(provided, 0, 22);
    *external.lock().unwrap() = Some(provided);
    {
        let external = external.clone();
        heap.add_root_provider(Box::new(move |visitor: &mut RootVisitor<'_>| {
            visitor.visit(&mut external.lock().unwrap());
        }));
    }

    m.collect_young();
    let global_after = heap.global_roots().get(&global_root).unwrap();
    assert_ne!(global_after, global);
    assert_eq!(m.read_data(global_after, 0), 11);
    let provided_after = external.lock().unwrap().unwrap();
    assert_ne!(provided_after, provided);
    assert_eq!(m.read_data(provided_after, 0), 22);

    m.collect_full();
    let provided_after = external.lock().unwrap().unwrap();
    assert_eq!(m.read_data(provided_after, 0), 22);

    drop(m);
    heap.shutdown();
}

#[test]
fn popular_objects_move_to_reserved_regions() {
    let heap = heap_with(
        32,
        Config {
            num_popular_regions: 1,
            rs_pop_limit: 16,
            obj_pop_limit: 4,
            verify_after_gc: true,
            ..Config::deterministic()
        },
    );
    let mut m = heap.attach_current_thread();
    let popular = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(popular, 0, 99);
    let popular_root = m.root(Some(popular));
    let holders = m.allocate(Shape::ref_array(300)).unwrap();
    let holders_root = m.root(Some(holders));
    for i in 0..300 {
        let holder = m.allocate(Shape::plain(1, 1022)).unwrap();
        let target = m.get(&popular_root);
        m.write_ref(holder, 0, target);
        let holders = m.get(&holders_root).unwrap();
        m.write_ref(holders, i, Some(holder));
    }
    m.release(popular_root);

    // Compaction leaves the holders spread over several old regions. The next
    // pause refines the redirtied cards, which queues the popular region.
    m.collect_full();
    m.allocate(Shape::plain(0, 1)).unwrap();
    assert_eq!(m.collect_young().kind, PauseKind::Young);
    let summary = m.collect_young();
    assert_eq!(summary.kind, PauseKind::Popular);
    assert_eq!(summary.popular_objects, 1);

    let holders = m.get(&holders_root).unwrap();
    let first = m.read_ref(m.read_ref(holders, 0).unwrap(), 0).unwrap();
    assert!(heap.regions().addr_to_region(first.address()).popular());
    assert_eq!(m.read_data(first, 0), 99);
    for i in 0..300 {
        let holder = m.read_ref(holders, i).unwrap();
        assert_eq!(m.read_ref(holder, 0), Some(first));
    }
    assert_eq!(heap.statistics().popular_pauses, 1);

    drop(m);
    heap.shutdown();
}

#[test]
fn spread_references_raise_the_popularity_limit() {
    let heap = heap_with(
        32,
        Config {
            num_popular_regions: 1,
            rs_pop_limit: 16,
            obj_pop_limit: 4,
            verify_after_gc: true,
            ..Config::deterministic()
        },
    );
    let mut m = heap.attach_current_thread();
    // Every target is referenced once, so no single object is popular.
    let targets = m.allocate(Shape::ref_array(300)).unwrap();
    let targets_root = m.root(Some(targets));
    for i in 0..300 {
        let target = m.allocate(Shape::plain(0, 1)).unwrap();
        m.write_data(target, 0, i as u64);
        let targets = m.get(&targets_root).unwrap();
        m.write_ref(targets, i, Some(target));
    }
    let holders = m.allocate(Shape::ref_array(300)).unwrap();
    let holders_root = m.root(Some(holders));
    for i in 0..300 {
        let holder = m.allocate(Shape::plain(1, 1022)).unwrap();
        let targets = m.get(&targets_root).unwrap();
        let target = m.read_ref(targets, i);
        m.write_ref(holder, 0, target);
        let holders = m.get(&holders_root).unwrap();
        m.write_ref(holders, i, Some(holder));
    }
    m.release(targets_root);
    assert_eq!(heap.rs_pop_limit(), 16);

    m.collect_full();
    m.allocate(Shape::plain(0, 1)).unwrap();
    assert_eq!(m.collect_young().kind, PauseKind::Young);
    let summary = m.collect_young();
    assert_eq!(summary.kind, PauseKind::Popular);
    assert_eq!(summary.popular_objects, 0);
    assert_eq!(heap.rs_pop_limit(), 32);

    // The region was still collected normally.
    let holders = m.get(&holders_root).unwrap();
    for i in 0..300 {
        let holder = m.read_ref(holders, i).unwrap();
        let target = m.read_ref(holder, 0).unwrap();
        assert!(!heap.regions().addr_to_region(target.address()).popular());
        assert_eq!(m.read_data(target, 0), i as u64);
    }

    drop(m);
    heap.shutdown();
}

#[test]
fn pause_with_empty_collection_set_is_abandoned() {
    let heap = heap_with(8, Config::deterministic());
    let mut m = heap.attach_current_thread();
    assert_eq!(heap.total_collections(), 0);

    let summary = m.collect_young();
    assert_eq!(summary.kind, PauseKind::Abandoned);
    assert_eq!(summary.cs_regions, 0);
    assert_eq!(summary.objects_copied, 0);
    assert_eq!(summary.regions_freed, 0);
    assert!(!summary.evacuation_failed);
    assert_eq!(heap.total_collections(), 1);
    let stats = heap.statistics();
    assert_eq!(stats.abandoned_pauses, 1);
    assert_eq!(stats.young_pauses, 0);

    // The next pause with young data collects normally.
    let obj = m.allocate(Shape::plain(0, 1)).unwrap();
    m.write_data(obj, 0, 7);
    let root = m.root(Some(obj));
    let summary = m.collect_young();
    assert_eq!(summary.kind, PauseKind::Young);
    assert_eq!(summary.objects_copied, 1);
    assert_eq!(heap.total_collections(), 2);
    assert_eq!(m.read_data(m.get(&root).unwrap(), 0), 7);

    drop(m);
    heap.shutdown();
}

#[test]
fn large_arrays_are_scanned_in_chunks_by_several_workers() {
    init_logger();
    let heap = Heap::new(Config {
        initial_heap_size: 32 * MB,
        max_heap_size: 32 * MB,
        region_size: Some(MB),
        parallel_gc_threads: 4,
        array_scan_chunk: 50,
        verify_after_gc: true,
        ..Config::deterministic()
    })
    .unwrap();
    let mut m = heap.attach_current_thread();
    let len = 5000;
    let array = m.allocate(Shape::ref_array(len as u32)).unwrap();
    let root = m.root(Some(array));
    for i in 0..len {
        let element = m.allocate(Shape::plain(0, 1)).unwrap();
        m.write_data(element, 0, i as u64);
        let array = m.get(&root).unwrap();
        m.write_ref(array, i, Some(element));
    }

    for round in 0..3 {
        let summary = m.collect_young();
        assert!(!summary.evacuation_failed);
        if round == 0 {
            assert_eq!(summary.objects_copied, len + 1);
        }
        let array = m.get(&root).unwrap();
        for i in 0..len {
            let element = m.read_ref(array, i).unwrap();
            assert_eq!(m.read_data(element, 0), i as u64, "slot {} after pause {}", i, round);
        }
    }

    drop(m);
    heap.shutdown();
}

#[test]
fn concurrent_marking_cycle_completes() {
    let heap = heap_with(
        32,
        Config {
            conc_mark: true,
            use_survivor_space: false,
            ..Config::deterministic()
        },
    );
    let starts = Arc::new(AtomicUsize::new(0));
    let ends = Arc::new(AtomicUsize::new(0));
    {
        let starts = starts.clone();
        let ends = ends.clone();
        heap.add_listener(Box::new(move |event: &GcEvent| match event {
            GcEvent::ConcurrentCycleStart { .. } => {
                starts.fetch_add(1, Ordering::Relaxed);
            }
            GcEvent::ConcurrentCycleEnd { .. } => {
                ends.fetch_add(1, Ordering::Relaxed);
            }
            _ => {}
        }));
    }
    let mut m = heap.attach_current_thread();
    let live = m.root(None);
    let garbage = m.root(None);
    build_list(&mut m, &live, 2000);
    build_list(&mut m, &garbage, 20_000);
    m.collect_young();
    m.set_root(&garbage, None);

    assert!(m.request_concurrent_mark().unwrap());
    assert!(heap.is_marking() || heap.concurrent_cycles_completed() == 1);
    // Mutation while marking goes through the SATB barrier.
    build_list(&mut m, &live, 500);
    assert!(m.wait_for_marking_cycle(Duration::from_secs(120)));
    assert_eq!(heap.concurrent_cycles_completed(), 1);
    assert_eq!(starts.load(Ordering::Relaxed), 1);
    assert_eq!(ends.load(Ordering::Relaxed), 1);

    for _ in 0..4 {
        m.collect_young();
    }
    let mut expected = expected_list(500);
    expected.extend(expected_list(2000));
    assert_eq!(walk_list(&m, &live), expected);
    m.verify();

    drop(m);
    heap.shutdown();
}

#[test]
fn marking_request_fails_when_marking_is_disabled() {
    let heap = heap_with(8, Config::deterministic());
    let mut m = heap.attach_current_thread();
    assert!(matches!(m.request_concurrent_mark(), Err(GcError::Unsupported(_))));
    drop(m);
    heap.shutdown();
}

#[test]
fn mutator_threads_share_the_heap() {
    let heap = heap_with(
        64,
        Config {
            verify_after_gc: true,
            ..Config::default()
        },
    );
    let mut m = heap.attach_current_thread();
    let shared = m.root(None);
    build_list(&mut m, &shared, 1000);

    let handles: Vec<_> = (0..4u64)
        .map(|t| {
            m.spawn_mutator(move |m| {
                let head = m.root(None);
                let mut total = 0;
                for round in 0..10 {
                    build_list(m, &head, 1000);
                    let list = walk_list(m, &head);
                    assert_eq!(list.len(), 1000 * (round + 1));
                    total += list.len();
                    m.poll();
                }
                if t == 0 {
                    m.collect_young();
                }
                total
            })
        })
        .collect();
    let totals: Vec<usize> = m.safe_region(|| handles.into_iter().map(|h| h.join().unwrap()).collect());
    assert_eq!(totals, vec![55_000; 4]);
    assert_eq!(walk_list(&m, &shared), expected_list(1000));
    m.verify();

    drop(m);
    heap.shutdown();
}
