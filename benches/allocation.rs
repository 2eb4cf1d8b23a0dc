use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion};
use g1::{Config, Heap, Mutator, ObjectRef, Root, Shape};

const MB: usize = 1024 * 1024;

fn bottom_up_tree(m: &mut Mutator, depth: usize) -> Root {
    if depth == 0 {
        let leaf = m.allocate(Shape::plain(2, 0)).unwrap();
        return m.root(Some(leaf));
    }
    let left = bottom_up_tree(m, depth - 1);
    let right = bottom_up_tree(m, depth - 1);
    let node = m.allocate(Shape::plain(2, 0)).unwrap();
    let l = m.get(&left);
    let r = m.get(&right);
    m.write_ref(node, 0, l);
    m.write_ref(node, 1, r);
    m.release(left);
    m.release(right);
    m.root(Some(node))
}

fn item_check(m: &Mutator, node: ObjectRef) -> usize {
    match (m.read_ref(node, 0), m.read_ref(node, 1)) {
        (Some(left), Some(right)) => 1 + item_check(m, left) + item_check(m, right),
        _ => 1,
    }
}

fn new_heap(config: Config) -> std::sync::Arc<Heap> {
    Heap::new(Config {
        initial_heap_size: 32 * MB,
        max_heap_size: 256 * MB,
        region_size: Some(MB),
        ..config
    })
    .unwrap()
}

pub fn bench_trees(c: &mut Criterion) {
    let mut group = c.benchmark_group("binary trees");
    group.sample_size(20);
    for depth in [10usize, 14, 16] {
        for (name, config) in [
            ("deterministic", Config::deterministic()),
            ("concurrent", Config::default()),
        ] {
            let heap = new_heap(config);
            let mut m = heap.attach_current_thread();
            group.bench_function(BenchmarkId::new(name, depth), |b| {
                b.iter(|| {
                    let tree = bottom_up_tree(&mut m, depth);
                    let root = m.get(&tree).unwrap();
                    let count = item_check(&m, root);
                    m.release(tree);
                    assert_eq!(count, (1 << (depth + 1)) - 1);
                })
            });
            drop(m);
            heap.shutdown();
        }
    }
    group.finish();
}

pub fn bench_small_objects(c: &mut Criterion) {
    let heap = new_heap(Config::deterministic());
    let mut m = heap.attach_current_thread();
    c.bench_function("allocate 10k plain objects", |b| {
        b.iter(|| {
            for i in 0..10_000u64 {
                let obj = m.allocate(Shape::plain(1, 2)).unwrap();
                m.write_data(obj, 0, i);
            }
        })
    });
    drop(m);
    heap.shutdown();
}

criterion_group!(benches, bench_trees, bench_small_objects);
criterion_main!(benches);
