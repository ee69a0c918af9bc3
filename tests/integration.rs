use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc, Barrier,
};
use std::thread;

use rand::{thread_rng, Rng};

use memtrack::{baseline, ConfigBuilder, OrderedList, Policy};

const ALL_POLICIES: [Policy; 9] = [
    Policy::Nil,
    Policy::Hazard,
    Policy::Rcu,
    Policy::Qsbr,
    Policy::Interval,
    Policy::RangeNew,
    Policy::He,
    Policy::Oa,
    Policy::Boa,
];

#[test]
fn single_thread_bounded_optimistic() {
    let list: OrderedList<i32> = OrderedList::new(4, Policy::Boa);

    assert!(list.insert(1, 1));
    assert!(list.insert(2, 1));
    assert!(list.insert(0, 1));

    assert_eq!(list.size(), 3);
    assert!(list.find(&0, 1));
    assert!(!list.find(&3, 1));
}

#[test]
fn duplicate_inserts_are_rejected() {
    let list: OrderedList<i32> = OrderedList::new(1, Policy::Boa);

    for key in 0..5 {
        assert!(list.insert(key, 0));
    }
    for key in 0..2 {
        assert!(!list.insert(key, 0));
    }
}

#[test]
fn inserted_keys_are_found() {
    let list: OrderedList<i32> = OrderedList::new(4, Policy::Boa);
    for key in 0..1000 {
        list.insert(key, 0);
    }

    for key in 0..1000 {
        assert!(list.find(&key, 0));
    }
    assert!(!list.find(&1001, 0));
}

#[test]
fn size_tracks_inserts() {
    let list: OrderedList<i32> = OrderedList::new(4, Policy::Boa);
    assert_eq!(list.size(), 0);
    for key in 0..1000 {
        list.insert(key, 0);
        assert_eq!(list.size(), (key + 1) as usize);
    }
}

#[test]
fn delete_roundtrip() {
    let list: OrderedList<i32> = OrderedList::new(4, Policy::Boa);

    for key in 0..1000 {
        assert!(!list.delete(&key, 0));
    }

    for key in 0..1000 {
        list.insert(key, 0);
    }
    for key in 0..1000 {
        assert!(list.delete(&key, 0));
    }
    for key in 1000..2000 {
        list.insert(key, 0);
    }
    for key in 1000..2000 {
        assert!(list.delete(&key, 0));
    }
    assert_eq!(list.size(), 0);
}

#[test]
fn every_policy_single_thread_sweep() {
    for &policy in ALL_POLICIES.iter() {
        let list: OrderedList<u64> = OrderedList::new(2, policy);

        for key in 0..500 {
            assert!(list.insert(key, 0), "{}: insert {}", policy, key);
        }
        for key in 0..500 {
            assert!(list.find(&key, 1), "{}: find {}", policy, key);
        }
        for key in (0..500).step_by(2) {
            assert!(list.delete(&key, 1), "{}: delete {}", policy, key);
        }
        for key in 0..500 {
            assert_eq!(list.find(&key, 0), key % 2 == 1, "{}: find {}", policy, key);
        }
        assert_eq!(list.size(), 250, "{}", policy);
    }
}

#[test]
fn concurrent_insert_delete_of_same_range() {
    // one thread inserts even keys while the other concurrently deletes
    // them; afterwards every reachable key must be one the deleter missed
    let list: Arc<OrderedList<i32>> = Arc::new(OrderedList::new(2, Policy::RangeNew));
    let barrier = Arc::new(Barrier::new(2));
    let inserted = Arc::new(AtomicU64::new(0));
    let deleted = Arc::new(AtomicU64::new(0));

    let inserter = {
        let (list, barrier, inserted) =
            (Arc::clone(&list), Arc::clone(&barrier), Arc::clone(&inserted));
        thread::spawn(move || {
            barrier.wait();
            for key in (0..2000).step_by(2) {
                if list.insert(key, 0) {
                    inserted.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };
    let deleter = {
        let (list, barrier, deleted) =
            (Arc::clone(&list), Arc::clone(&barrier), Arc::clone(&deleted));
        thread::spawn(move || {
            barrier.wait();
            for key in (0..2000).step_by(2) {
                if list.delete(&key, 1) {
                    deleted.fetch_add(1, Ordering::Relaxed);
                }
            }
        })
    };

    inserter.join().unwrap();
    deleter.join().unwrap();

    let inserted = inserted.load(Ordering::Relaxed);
    let deleted = deleted.load(Ordering::Relaxed);
    assert_eq!(inserted, 1000);
    assert_eq!(list.size() as u64, inserted - deleted);

    let survivors = (0..2000).filter(|key| list.find(key, 0)).count() as u64;
    assert_eq!(survivors, inserted - deleted);
}

#[test]
fn concurrent_random_inserts() {
    const THREADS: usize = 16;
    const ITEMS_PER_THREAD: usize = 50;

    let list: Arc<OrderedList<i32>> = Arc::new(OrderedList::new(THREADS, Policy::Boa));
    let failures = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let list = Arc::clone(&list);
            let failures = Arc::clone(&failures);
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..ITEMS_PER_THREAD {
                    let key = rng.gen_range(0, 10_000);
                    if !list.insert(key, tid) {
                        failures.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = (THREADS * ITEMS_PER_THREAD) as u64 - failures.load(Ordering::Relaxed);
    assert_eq!(list.size() as u64, expected);
}

#[test]
fn concurrent_random_deletes() {
    const THREADS: usize = 16;
    const ITEMS_PER_THREAD: usize = 500;
    const PREFILLED: usize = 10_000;

    let list: Arc<OrderedList<i32>> = Arc::new(OrderedList::new(THREADS, Policy::Boa));
    for key in 0..PREFILLED as i32 {
        list.insert(key, 0);
    }
    let successes = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let list = Arc::clone(&list);
            let successes = Arc::clone(&successes);
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..ITEMS_PER_THREAD {
                    let key = rng.gen_range(0, 10_000);
                    if list.delete(&key, tid) {
                        successes.fetch_add(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    let expected = PREFILLED as u64 - successes.load(Ordering::Relaxed);
    assert_eq!(list.size() as u64, expected);
}

#[test]
fn mixed_workload_converges() {
    const THREADS: usize = 16;
    const ITEMS_PER_THREAD: i32 = 1000;

    let list: Arc<OrderedList<i32>> = Arc::new(OrderedList::new(THREADS, Policy::Boa));
    let net = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let list = Arc::clone(&list);
            let net = Arc::clone(&net);
            thread::spawn(move || {
                if tid % 2 == 0 {
                    let start = tid as i32 * ITEMS_PER_THREAD;
                    for key in start..start + ITEMS_PER_THREAD {
                        if list.insert(key, tid) {
                            net.fetch_add(1, Ordering::Relaxed);
                        }
                    }
                } else {
                    for key in 0..ITEMS_PER_THREAD {
                        if list.delete(&key, tid) {
                            net.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(list.size() as u64, net.load(Ordering::Relaxed));
}

#[test]
fn finds_agree_after_concurrent_churn() {
    const THREADS: usize = 16;
    const ITEMS_PER_THREAD: i32 = 1000;

    let list: Arc<OrderedList<i32>> = Arc::new(OrderedList::new(THREADS, Policy::Boa));
    for key in 0..10_000 {
        list.insert(key, (key % 16) as usize);
    }

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let list = Arc::clone(&list);
            thread::spawn(move || {
                let start = tid as i32 * ITEMS_PER_THREAD;
                for key in start..start + ITEMS_PER_THREAD {
                    if key % 2 == 0 {
                        list.insert(key, tid);
                    } else {
                        list.delete(&key, tid);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    for key in 0..16_000 {
        let expected = key % 2 == 0;
        assert_eq!(list.find(&key, (key % 16) as usize), expected, "key {}", key);
    }
}

#[test]
fn mixed_workload_over_every_policy() {
    const THREADS: usize = 8;
    const ITEMS_PER_THREAD: usize = 400;

    for &policy in ALL_POLICIES.iter() {
        let list: Arc<OrderedList<i32>> = Arc::new(OrderedList::new(THREADS, policy));
        let net = Arc::new(AtomicU64::new(0));

        let handles: Vec<_> = (0..THREADS)
            .map(|tid| {
                let list = Arc::clone(&list);
                let net = Arc::clone(&net);
                thread::spawn(move || {
                    let mut rng = thread_rng();
                    for _ in 0..ITEMS_PER_THREAD {
                        let key = rng.gen_range(0, 1_000);
                        if tid % 2 == 0 {
                            if list.insert(key, tid) {
                                net.fetch_add(1, Ordering::Relaxed);
                            }
                        } else if list.delete(&key, tid) {
                            net.fetch_sub(1, Ordering::Relaxed);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(list.size() as u64, net.load(Ordering::Relaxed), "{}", policy);
    }
}

#[test]
fn disabled_collection_keeps_correctness() {
    let config = ConfigBuilder::new().collect(false).build();
    let list: OrderedList<i32> = OrderedList::with_config(2, Policy::Rcu, config);

    for key in 0..1000 {
        assert!(list.insert(key, 0));
    }
    for key in 0..1000 {
        assert!(list.delete(&key, 0));
    }
    assert_eq!(list.size(), 0);

    // retired nodes pile up and the monitor sees a growing backlog
    for key in 0..10 {
        assert!(!list.find(&key, 0));
    }
    assert!(list.report_retired(0) > 0);
}

#[test]
fn report_retired_is_per_thread() {
    let list: OrderedList<i32> = OrderedList::new(4, Policy::RangeNew);
    assert_eq!(list.report_retired(3), 0);
    assert_eq!(list.size(), 0);

    for key in 0..200 {
        list.insert(key, 1);
    }
    for key in 0..200 {
        list.delete(&key, 1);
    }
    for key in 0..200 {
        list.find(&key, 1);
    }

    assert!(list.report_retired(1) > 0);
    assert_eq!(list.report_retired(2), 0);
}

#[test]
fn baseline_single_thread_sweep() {
    let list: baseline::OrderedList<u64> = baseline::OrderedList::new();

    for key in 0..1000 {
        assert!(list.insert(key));
    }
    assert!(!list.insert(0));
    for key in 0..1000 {
        assert!(list.find(&key));
    }
    for key in (0..1000).step_by(2) {
        assert!(list.delete(&key));
    }
    for key in 0..1000 {
        assert_eq!(list.find(&key), key % 2 == 1);
    }
    assert_eq!(list.size(), 500);
}

#[test]
fn baseline_concurrent_churn() {
    const THREADS: usize = 8;

    let list: Arc<baseline::OrderedList<i32>> = Arc::new(baseline::OrderedList::new());
    let net = Arc::new(AtomicU64::new(0));

    let handles: Vec<_> = (0..THREADS)
        .map(|tid| {
            let list = Arc::clone(&list);
            let net = Arc::clone(&net);
            thread::spawn(move || {
                let mut rng = thread_rng();
                for _ in 0..500 {
                    let key = rng.gen_range(0, 1_000);
                    if tid % 2 == 0 {
                        if list.insert(key) {
                            net.fetch_add(1, Ordering::Relaxed);
                        }
                    } else if list.delete(&key) {
                        net.fetch_sub(1, Ordering::Relaxed);
                    }
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(list.size() as u64, net.load(Ordering::Relaxed));
}
