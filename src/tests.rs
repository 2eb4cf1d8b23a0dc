use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::address::Address;
use crate::allocation::GcAllocPurpose;
use crate::card_table::CardTable;
use crate::block_offset_table::BlockOffsetTable;
use crate::config::Config;
use crate::error::GcError;
use crate::globals::{CARD_SIZE, CARD_SIZE_IN_WORDS, HEADER_WORDS, MAX_HEAP_SIZE};
use crate::header::{initialize_object, ForwardingState, MarkWord, ObjectKind, ObjectRef, Shape};
use crate::heap::Heap;
use crate::policy::age_table::AgeTable;
use crate::popular::PopularRegions;
use crate::policy::predictor::SurvRateGroup;
use crate::policy::{PauseRecord, Policy};
use crate::ptr_queue::{PtrQueue, PtrQueueSet};
use crate::region::{ListTag, Region, RegionIndex, RegionKind, RegionSizes, ZeroFillState};
use crate::region_directory::CLEANUP_CLAIM_VALUE;
use crate::region_list::RegionList;
use crate::remset::{RemSetGeometry, RememberedSet};
use crate::statistics::GcEvent;
use crate::tlab::{should_refill, LocalAllocBuffer};
use crate::young_list::YoungList;

const MB: usize = 1024 * 1024;

fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Region descriptors over a made-up address range. Only for tests that never
/// touch region memory.
fn detached_regions(n: usize) -> Vec<Region> {
    let geometry = RemSetGeometry {
        cards_per_region: 8,
        sparse_entries: 2,
        fine_entries: 2,
    };
    (0..n)
        .map(|i| {
            let index = RegionIndex(i as u32);
            Region::new(
                index,
                Address::from_usize(0x1000_0000 + i * 4096),
                512,
                RememberedSet::new(index, geometry),
            )
        })
        .collect()
}

fn small_heap(regions: usize) -> Arc<Heap> {
    Heap::new(Config {
        initial_heap_size: regions * MB,
        max_heap_size: regions * MB,
        region_size: Some(MB),
        parallel_gc_threads: 2,
        ..Config::deterministic()
    })
    .unwrap()
}

#[test]
pub fn test_region_list_push_pop() {
    let regions = detached_regions(4);
    let mut list = RegionList::new(ListTag::Free);
    for i in 0..3 {
        list.push_back(&regions, RegionIndex(i));
    }
    list.push_front(&regions, RegionIndex(3));
    assert_eq!(list.len(), 4);
    assert!(list.check_well_formed(&regions));
    assert_eq!(list.head(), Some(RegionIndex(3)));
    assert_eq!(list.tail(), Some(RegionIndex(2)));
    assert!(regions.iter().all(|r| r.list_tag() == ListTag::Free));

    let removed = list.remove_if(&regions, |r| r.index().0 % 2 == 1);
    assert_eq!(removed, 2);
    assert!(!list.contains(&regions, RegionIndex(1)));
    assert_eq!(regions[1].list_tag(), ListTag::None);
    assert!(list.check_well_formed(&regions));

    assert_eq!(list.pop_front(&regions), Some(RegionIndex(0)));
    assert_eq!(list.pop_front(&regions), Some(RegionIndex(2)));
    assert_eq!(list.pop_front(&regions), None);
    assert!(list.is_empty());
    assert_eq!(list.tail(), None);
}

#[test]
#[should_panic]
pub fn test_region_list_rejects_region_on_two_lists() {
    let regions = detached_regions(2);
    let mut free = RegionList::new(ListTag::Free);
    let mut unclean = RegionList::new(ListTag::Unclean);
    free.push_back(&regions, RegionIndex(0));
    unclean.push_back(&regions, RegionIndex(0));
}

#[test]
pub fn test_young_list_state_machine() {
    init_logger();
    let regions = detached_regions(6);
    let mut surv_rate = SurvRateGroup::new("test", 1.0);
    let mut young = YoungList::new();
    for i in 0..4 {
        young.push_region(&regions, RegionIndex(i), &mut surv_rate);
    }
    assert_eq!(young.length(), 4);
    assert!(young.check_list_well_formed(&regions));
    assert_eq!(regions[0].surv_rate_age(), 0);
    assert_eq!(regions[3].surv_rate_age(), 3);

    // Region 0 is the oldest and sits at the tail.
    assert_eq!(young.mark_scan_only_prefix(&regions, 1), 1);
    assert!(regions[0].is_scan_only());

    let mut popped = Vec::new();
    while let Some(index) = young.pop_region(&regions) {
        popped.push(index.0);
    }
    assert_eq!(popped, vec![3, 2, 1]);
    assert_eq!(young.scan_only_length(), 1);
    assert_eq!(young.young_length(), 0);

    regions[4].set_kind(RegionKind::Survivor);
    young.add_survivor_region(&regions, RegionIndex(4));
    assert_eq!(young.survivor_length(), 1);

    young.reset_auxiliary_lists(&regions, &mut surv_rate);
    let order: Vec<u32> = young.iter(&regions).map(|r| r.index().0).collect();
    assert_eq!(order, vec![4, 0]);
    assert_eq!(regions[0].kind(), RegionKind::Survivor);
    assert!(!regions[0].is_scan_only());
    assert_eq!(young.scan_only_length(), 0);
    assert_eq!(young.survivor_length(), 0);
    assert!(young.check_list_well_formed(&regions));

    let emptied = young.empty_list(&regions);
    assert_eq!(emptied.len(), 2);
    assert!(young.check_list_empty());
    assert!(regions.iter().all(|r| r.list_tag() == ListTag::None));
}

#[test]
pub fn test_iterate_parallel_claims_each_region_once() {
    init_logger();
    let heap = small_heap(16);
    let mut mutator = heap.attach_current_thread();
    // Three regions: one head and two continuations.
    let big = mutator.allocate(Shape::with_size_in_bytes(2 * MB + MB / 2)).unwrap();
    let head = heap.regions.addr_to_region(big.address());
    assert!(head.is_starts_humongous());

    let n = heap.regions.len();
    let visits: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
    let order: Vec<AtomicUsize> = (0..n).map(|_| AtomicUsize::new(0)).collect();
    let clock = AtomicUsize::new(1);
    let workers = 4;
    std::thread::scope(|scope| {
        for worker in 0..workers {
            let heap = &heap;
            let visits = &visits;
            let order = &order;
            let clock = &clock;
            scope.spawn(move || {
                heap.regions.iterate_parallel(worker, workers, 7, |region| {
                    let i = region.index().as_usize();
                    visits[i].fetch_add(1, Ordering::Relaxed);
                    order[i].store(clock.fetch_add(1, Ordering::Relaxed), Ordering::Relaxed);
                });
            });
        }
    });

    for (i, count) in visits.iter().enumerate() {
        assert_eq!(count.load(Ordering::Relaxed), 1, "region {} visited more than once", i);
    }
    // Continuations are processed before their head.
    let head_index = head.index().as_usize();
    let head_time = order[head_index].load(Ordering::Relaxed);
    assert!(order[head_index + 1].load(Ordering::Relaxed) < head_time);
    assert!(order[head_index + 2].load(Ordering::Relaxed) < head_time);

    assert!(heap.regions.check_claim_values(7));
    heap.regions.reset_claim_values();
    assert!(!heap.regions.check_claim_values(7));

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_marking_cleanup_frees_dead_humongous_run_on_workers() {
    init_logger();
    let heap = Heap::new(Config {
        initial_heap_size: 16 * MB,
        max_heap_size: 16 * MB,
        region_size: Some(MB),
        parallel_gc_threads: 4,
        conc_mark: true,
        ..Config::deterministic()
    })
    .unwrap();
    let freed = Arc::new(AtomicUsize::new(0));
    {
        let freed = freed.clone();
        heap.add_listener(Box::new(move |event: &GcEvent| {
            if let GcEvent::ConcurrentCycleEnd { freed_regions, .. } = event {
                freed.fetch_add(*freed_regions, Ordering::Relaxed);
            }
        }));
    }
    let mut mutator = heap.attach_current_thread();
    let big = mutator.allocate(Shape::with_size_in_bytes(2 * MB + MB / 2)).unwrap();
    let head = heap.regions.addr_to_region(big.address()).index();
    let keep = mutator.allocate(Shape::plain(0, 4)).unwrap();
    let keep = mutator.root(Some(keep));

    assert!(mutator.request_concurrent_mark().unwrap());
    assert!(mutator.wait_for_marking_cycle(Duration::from_secs(120)));
    assert!(heap.regions.check_claim_values(CLEANUP_CLAIM_VALUE));

    // Waits for the cleanup to hand the run back.
    mutator.collect_young();
    let deadline = std::time::Instant::now() + Duration::from_secs(30);
    while freed.load(Ordering::Relaxed) < 3 && std::time::Instant::now() < deadline {
        mutator.safe_region(|| std::thread::sleep(Duration::from_millis(1)));
    }
    assert!(freed.load(Ordering::Relaxed) >= 3);
    for i in 0..3 {
        let region = heap.regions.at(RegionIndex(head.0 + i));
        assert!(!region.is_starts_humongous() && !region.is_continues_humongous());
    }
    assert!(mutator.get(&keep).is_some());
    mutator.verify();

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_full_collection_cleans_freed_regions_without_zero_fill_thread() {
    init_logger();
    let heap = small_heap(16);
    let mut mutator = heap.attach_current_thread();
    for _ in 0..20_000 {
        mutator.allocate(Shape::plain(0, 6)).unwrap();
    }
    mutator.allocate(Shape::with_size_in_bytes(2 * MB + MB / 2)).unwrap();
    mutator.collect_young();
    mutator.collect_full();

    assert_eq!(heap.regions.unclean_list_len(), 0);
    assert!(heap.regions.free_list_len() >= 3);
    let free: Vec<_> = heap.regions.iter().filter(|r| r.is_free()).collect();
    assert_eq!(free.len(), heap.regions.free_list_len());
    assert!(free
        .iter()
        .all(|r| r.zero_fill_state() == ZeroFillState::ZeroFilled && r.list_tag() == ListTag::Free));
    assert_eq!(heap.regions.verify_lists(), (free.len(), 0));

    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_popular_queue_drops_regions_below_limit() {
    init_logger();
    let heap = small_heap(8);
    let regions = &heap.regions;
    let index = regions.alloc_free_region_from_lists(false).unwrap();
    let region = regions.at(index);
    region.set_kind(RegionKind::Old);
    let source = regions.all().iter().find(|r| r.index() != index).unwrap();
    let first_card = regions.card_index(source.bottom());
    for card in first_card..first_card + 8 {
        region.rem_set().add_reference(card);
    }
    assert_eq!(region.rem_set().occupied(), 8);

    let popular = PopularRegions::new(1, 4, 2);
    popular.maybe_schedule(region);
    assert!(region.popular_pending());
    assert_eq!(popular.pending(), 1);
    assert_eq!(popular.popular_region_to_evac(regions), Some(index));
    assert!(!region.popular_pending());

    // Queued while popular, then its remembered set shrank.
    popular.maybe_schedule(region);
    region.rem_set().clear();
    assert_eq!(popular.popular_region_to_evac(regions), None);
    assert!(!region.popular_pending());
    assert_eq!(popular.pending(), 0);

    // A raised limit keeps the region off the queue.
    for card in first_card..first_card + 8 {
        region.rem_set().add_reference(card);
    }
    assert_eq!(popular.double_rs_pop_limit(), 8);
    popular.maybe_schedule(region);
    assert_eq!(popular.pending(), 0);
    assert_eq!(popular.double_rs_pop_limit(), 16);

    region.rem_set().clear();
    regions.free_region(index);
    heap.shutdown();
}

#[test]
pub fn test_forwarding_converges_across_threads() {
    init_logger();
    let heap = small_heap(4);
    let mut mutator = heap.attach_current_thread();
    let obj = mutator.allocate(Shape::plain(1, 2)).unwrap();

    let threads = 8;
    let results: Vec<Result<MarkWord, MarkWord>> = std::thread::scope(|scope| {
        let handles: Vec<_> = (0..threads)
            .map(|i| scope.spawn(move || obj.forward_atomic(MarkWord::forwarded_to(1000 + i as u32))))
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let winners = results.iter().filter(|r| r.is_ok()).count();
    assert_eq!(winners, 1);
    let installed = obj.mark();
    for result in results.iter() {
        match result {
            Ok(prev) => assert!(prev.is_prototype()),
            Err(seen) => assert_eq!(*seen, installed),
        }
    }
    let word = match installed.forwarding_state() {
        ForwardingState::ForwardedTo(word) => word,
        other => panic!("unexpected {:?}", other),
    };
    assert!((1000..1000 + threads as u32).contains(&word));
    assert_eq!(obj.forward_atomic(MarkWord::self_forwarded()), Err(installed));

    obj.set_mark(MarkWord::prototype());
    drop(mutator);
    heap.shutdown();
}

#[test]
pub fn test_mark_word_bits() {
    let proto = MarkWord::prototype();
    assert!(proto.is_prototype());
    assert!(!proto.must_be_preserved());
    assert_eq!(proto.forwarding_state(), ForwardingState::NotForwarded);

    let hashed = proto.with_hash(0x1abc).with_locked(true);
    assert!(hashed.must_be_preserved());
    assert_eq!(hashed.hash(), 0x1abc);

    let aged = proto.incr_age().incr_age();
    assert_eq!(aged.age(), 2);
    let mut old = proto.with_age(15);
    old = old.incr_age();
    assert_eq!(old.age(), 15);

    assert_eq!(
        MarkWord::forwarded_to(12345).forwarding_state(),
        ForwardingState::ForwardedTo(12345)
    );
    assert_eq!(
        MarkWord::self_forwarded().forwarding_state(),
        ForwardingState::SelfForwarded
    );
}

#[test]
pub fn test_object_layout() {
    let mut buf = vec![0u64; 64];
    let base = Address::from_ptr(buf.as_mut_ptr());
    let obj = initialize_object(base, Shape::plain(3, 4));
    assert_eq!(obj.kind(), ObjectKind::Plain);
    assert_eq!(obj.ref_count(), 3);
    assert_eq!(obj.size_words(), 10);
    assert_eq!(obj.data_words(), 5);
    assert_eq!(obj.slot(0), base.add_words(HEADER_WORDS));
    obj.write_data(0, 0xdead_beef);
    assert_eq!(obj.read_data(0), 0xdead_beef);

    let array = initialize_object(obj.end(), Shape::ref_array(5));
    assert_eq!(array.kind(), ObjectKind::RefArray);
    assert_eq!(array.slots().count(), 5);
    assert_eq!(ObjectRef::from_raw(0), None);
}

#[test]
pub fn test_card_table_dirty_clean_claim() {
    let base = Address::from_usize(0x4000_0000);
    let table = CardTable::new(base, MB).unwrap();
    assert_eq!(table.num_cards(), MB / CARD_SIZE);

    let addr = base + 3 * CARD_SIZE + 16;
    let card = table.index_for(addr);
    assert_eq!(card, 3);
    assert_eq!(table.addr_for(card), base + 3 * CARD_SIZE);

    assert!(table.mark_dirty(card));
    assert!(!table.mark_dirty(card));
    assert!(table.is_dirty(card));
    assert!(table.clean(card));
    assert!(!table.clean(card));

    assert!(table.claim(card));
    assert!(!table.claim(card));

    table.dirty_range(base + 10 * CARD_SIZE, base + 12 * CARD_SIZE);
    assert!(!table.is_dirty(9));
    assert!(table.is_dirty(10) && table.is_dirty(11));
    assert!(!table.is_dirty(12));
    table.clear_range(base + 10 * CARD_SIZE, base + 11 * CARD_SIZE);
    assert!(!table.is_dirty(10) && table.is_dirty(11));
    table.clear_all();
    assert!(!table.is_dirty(11));
    assert_eq!(table.get(3), CardTable::CARD_CLEAN);
}

#[test]
pub fn test_block_offset_table_finds_object_starts() {
    let words = 4 * CARD_SIZE_IN_WORDS;
    let mut buf = vec![0u64; words];
    let bottom = Address::from_ptr(buf.as_mut_ptr());
    let bot = BlockOffsetTable::new(bottom, words * 8).unwrap();

    let mut objects = Vec::new();
    let mut cur = bottom;
    for data in [6usize, 70, 2, 40, 100, 12].iter().cycle() {
        let shape = Shape::plain(0, *data as u32);
        if cur.add_words(shape.size_words()) > bottom.add_words(words) {
            break;
        }
        let obj = initialize_object(cur, shape);
        bot.alloc_block(obj.address(), obj.end());
        objects.push(obj);
        cur = obj.end();
    }
    assert!(objects.len() > 6);

    for obj in objects.iter() {
        let mut addr = obj.address();
        while addr < obj.end() {
            assert_eq!(bot.object_containing(bottom, addr), *obj);
            addr = addr.add_words(1);
        }
    }
    let card_1 = bottom.add_words(CARD_SIZE_IN_WORDS);
    let covering = objects.iter().find(|obj| obj.end() > card_1).copied().unwrap();
    assert_eq!(bot.block_start_for_card(card_1), covering.address());
}

#[test]
pub fn test_remembered_set_granularities() {
    let geometry = RemSetGeometry {
        cards_per_region: 8,
        sparse_entries: 2,
        fine_entries: 2,
    };
    let rs = RememberedSet::new(RegionIndex(0), geometry);

    // Cards of the owner are never recorded.
    assert!(!rs.add_reference(3));
    assert!(rs.is_empty());

    assert!(rs.add_reference(8));
    assert!(!rs.add_reference(8));
    assert!(rs.add_reference(9));
    assert_eq!(rs.occupied(), 2);
    // Third card of region 1 overflows the sparse entry.
    assert!(rs.add_reference(10));
    assert_eq!(rs.occupied(), 3);
    assert!(rs.contains_reference(8) && rs.contains_reference(9) && rs.contains_reference(10));
    assert!(!rs.contains_reference(11));

    let mut added = vec![8, 9, 10];
    for region in 2..4 {
        for offset in 0..3 {
            let card = region * 8 + offset;
            assert!(rs.add_reference(card));
            added.push(card);
        }
    }
    assert_eq!(rs.coarse_regions(), 1);
    for card in added.iter() {
        assert!(rs.contains_reference(*card), "lost card {}", card);
    }
    assert!(rs.occupied() >= added.len());
    let cards = rs.cards();
    for card in added.iter() {
        assert!(cards.contains(card));
    }
    assert_eq!(
        rs.source_regions(),
        vec![RegionIndex(1), RegionIndex(2), RegionIndex(3)]
    );

    rs.clear();
    assert!(rs.is_empty());
    assert_eq!(rs.coarse_regions(), 0);
    assert!(!rs.contains_reference(8));
}

#[test]
pub fn test_ptr_queue_hands_over_full_buffers() {
    let qset = PtrQueueSet::new("test", 4, 1, true);
    let mut queue = PtrQueue::new();
    for value in 1..=9 {
        queue.enqueue(value, &qset);
    }
    assert_eq!(qset.completed_buffers(), 2);
    assert_eq!(queue.len(), 1);
    assert!(qset.process_completed_buffers());

    queue.flush(&qset);
    assert!(queue.is_empty());
    assert_eq!(qset.completed_buffers(), 3);
    assert_eq!(qset.take_completed_buffer(), Some(vec![1, 2, 3, 4]));
    assert_eq!(qset.abandon_completed_buffers(), 2);
    assert_eq!(qset.take_completed_buffer(), None);
}

#[test]
pub fn test_tlab_allocate_undo_retire() {
    let mut buf = vec![0u64; 64];
    let start = Address::from_ptr(buf.as_mut_ptr());
    let mut tlab = LocalAllocBuffer::new();
    assert!(tlab.allocate(2).is_none());

    tlab.set_buf(start, 32);
    let a = tlab.allocate(10).unwrap();
    let b = tlab.allocate(6).unwrap();
    assert_eq!(a, start);
    assert_eq!(b, start.add_words(10));
    assert!(!tlab.undo_allocation(a, 10));
    assert!(tlab.undo_allocation(b, 6));
    assert_eq!(tlab.free_words(), 22);
    assert!(tlab.allocate(23).is_none());

    initialize_object(a, Shape::plain(0, 8));
    assert_eq!(tlab.retire(), Some((start, start.add_words(32))));
    assert_eq!(tlab.words_wasted(), 22);
    assert_eq!(tlab.words_allocated(), 10);
    assert!(tlab.is_empty_buffer());
    let filler = unsafe { ObjectRef::from_address(start.add_words(10)) };
    assert!(filler.is_filler());
    assert_eq!(filler.size_words(), 22);
    assert_eq!(tlab.retire(), None);
}

#[test]
pub fn test_buffer_waste_rule() {
    assert!(should_refill(9, 100, 10));
    assert!(!should_refill(10, 100, 10));
    assert!(should_refill(49, 100, 50));
    assert!(!should_refill(100, 100, 50));
}

#[test]
pub fn test_region_sizes() {
    let sizes = RegionSizes::setup(64 * MB, Some(MB)).unwrap();
    assert_eq!(sizes.region_count, 64);
    assert_eq!(sizes.region_size_words, MB / 8);
    assert_eq!(sizes.region_size_bytes_shift, 20);
    assert_eq!(sizes.max_tlab_size_words, MB / 64);

    let derived = RegionSizes::setup(8 * 1024 * MB, None).unwrap();
    assert_eq!(derived.region_size_bytes, 4 * MB);
    assert!(RegionSizes::setup(MB / 2, Some(MB)).is_err());
}

#[test]
pub fn test_config_validation() {
    assert!(Config::default().validate().is_ok());
    let bad_region = Config {
        region_size: Some(3 * MB),
        ..Config::default()
    };
    assert!(bad_region.validate().is_err());
    let bad_sizes = Config {
        initial_heap_size: 128 * MB,
        max_heap_size: 64 * MB,
        ..Config::default()
    };
    assert!(bad_sizes.validate().is_err());
    let bad_ratios = Config {
        min_heap_free_ratio: 80,
        max_heap_free_ratio: 20,
        ..Config::default()
    };
    assert!(bad_ratios.validate().is_err());
    let largest = Config {
        initial_heap_size: 64 * MB,
        max_heap_size: MAX_HEAP_SIZE as usize,
        ..Config::default()
    };
    assert!(largest.validate().is_ok());
    let too_large = Config {
        initial_heap_size: 64 * MB,
        max_heap_size: 2 * MAX_HEAP_SIZE as usize,
        ..Config::default()
    };
    assert!(matches!(too_large.validate(), Err(GcError::InvalidConfig(_))));
}

fn test_policy(config: &Config) -> Policy {
    let sizes = RegionSizes::setup(config.max_heap_size, config.region_size).unwrap();
    Policy::new(config, sizes)
}

#[test]
pub fn test_policy_young_target() {
    let config = Config {
        max_heap_size: 64 * MB,
        region_size: Some(MB),
        ..Config::deterministic()
    };
    let mut policy = test_policy(&config);
    // Without samples the young generation takes everything but the reserve.
    policy.calculate_young_list_target_length(20, 20, 0);
    assert_eq!(policy.reserve_regions(), 2);
    assert_eq!(policy.young_list_target_length(), 18);
    assert!(policy.should_do_collection_pause(18));
    assert!(!policy.should_do_collection_pause(17));

    // Never below one region more than what is already young.
    policy.calculate_young_list_target_length(20, 0, 4);
    assert_eq!(policy.young_list_target_length(), 5);

    let fixed = Config {
        young_list_length: Some(3),
        ..config
    };
    let mut policy = test_policy(&fixed);
    policy.calculate_young_list_target_length(20, 20, 0);
    assert_eq!(policy.young_list_target_length(), 3);
}

#[test]
pub fn test_policy_marking_request() {
    let config = Config {
        max_heap_size: 64 * MB,
        region_size: Some(MB),
        conc_mark: true,
        ..Config::deterministic()
    };
    let mut policy = test_policy(&config);
    let record = PauseRecord {
        pause_time_ms: 1.0,
        cs_regions: 1,
        cs_young_regions: 1,
        free_regions: 10,
        young_length: 0,
        old_used_bytes: 0,
        committed_bytes: 16 * MB,
        ..Default::default()
    };
    assert!(!policy.record_collection_pause_end(&record).initiate_conc_mark);
    policy.request_conc_mark();
    assert!(policy.record_collection_pause_end(&record).initiate_conc_mark);
    assert!(policy.in_marking_window());
    policy.request_conc_mark();
    assert!(!policy.record_collection_pause_end(&record).initiate_conc_mark);
    policy.record_concurrent_mark_abort();
    assert!(!policy.in_marking_window());

    let disabled = Config {
        conc_mark: false,
        ..config
    };
    let mut policy = test_policy(&disabled);
    policy.request_conc_mark();
    assert!(!policy.record_collection_pause_end(&record).initiate_conc_mark);
}

#[test]
pub fn test_destination_and_tenuring() {
    let config = Config {
        max_heap_size: 64 * MB,
        region_size: Some(MB),
        max_tenuring_threshold: 4,
        ..Config::deterministic()
    };
    let policy = test_policy(&config);
    assert_eq!(policy.evacuation_destination(true, 0), GcAllocPurpose::Survived);
    assert_eq!(policy.evacuation_destination(true, 4), GcAllocPurpose::Tenured);
    assert_eq!(policy.evacuation_destination(false, 0), GcAllocPurpose::Tenured);

    let no_survivors = Config {
        use_survivor_space: false,
        ..config
    };
    let policy = test_policy(&no_survivors);
    assert_eq!(policy.evacuation_destination(true, 0), GcAllocPurpose::Tenured);

    let mut table = AgeTable::new();
    table.add(1, 100);
    table.add(2, 100);
    table.add(3, 100);
    assert_eq!(table.total(), 300);
    assert_eq!(table.compute_tenuring_threshold(150, 15), 2);
    assert_eq!(table.compute_tenuring_threshold(1000, 15), 15);
    assert_eq!(table.compute_tenuring_threshold(1000, 6), 6);
}
