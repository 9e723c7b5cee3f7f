use std::sync::Arc;
use std::thread;

use bytemuck::{Pod, Zeroable};
use tempfile::TempDir;
use warp_map::{FixedLayout, MapConfig, Native, SharedHashMap};

type U64Map = SharedHashMap<u64, u64, Native<u64>, Native<u64>>;

fn u64_map(dir: &TempDir, entries: u64, min_segments: u32) -> U64Map {
    let config = MapConfig::new(dir.path().join("map.dat"))
        .entries(entries)
        .min_segments(min_segments);
    SharedHashMap::open_or_create(&config, Native::new(), Native::new()).unwrap()
}

#[test]
fn disjoint_writers_lose_nothing() {
    let dir = TempDir::new().unwrap();
    let map = Arc::new(u64_map(&dir, 32_000, 16));

    let handles: Vec<_> = (0..8u64)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..2_000u64 {
                    let key = t * 1_000_000 + i;
                    assert_eq!(map.put(&key, &(key * 2)).unwrap(), None);
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }

    assert_eq!(map.exact_size().unwrap(), 16_000);
    for t in 0..8u64 {
        for i in (0..2_000u64).step_by(97) {
            let key = t * 1_000_000 + i;
            assert_eq!(map.get(&key).unwrap(), Some(key * 2));
        }
    }
}

#[test]
fn mixed_operations_keep_per_thread_keys_consistent() {
    let dir = TempDir::new().unwrap();
    let map = Arc::new(u64_map(&dir, 4_096, 8));

    let handles: Vec<_> = (0..6u64)
        .map(|t| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let base = t << 32;
                for round in 0..20u64 {
                    for i in 0..100u64 {
                        map.put(&(base + i), &round).unwrap();
                    }
                    for i in (0..100u64).filter(|i| i % 3 == 0) {
                        assert_eq!(map.remove(&(base + i)).unwrap(), Some(round));
                    }
                    for i in 0..100u64 {
                        let expected = (i % 3 != 0).then_some(round);
                        assert_eq!(map.get(&(base + i)).unwrap(), expected);
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.exact_size().unwrap(), 6 * 66);
}

/// Two halves that writers always keep equal.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
struct Mirrored {
    a: [u64; 8],
    b: [u64; 8],
}

impl FixedLayout for Mirrored {}

impl Mirrored {
    fn filled(v: u64) -> Self {
        Mirrored { a: [v; 8], b: [v; 8] }
    }
}

#[test]
fn readers_never_see_torn_values() {
    let dir = TempDir::new().unwrap();
    let config = MapConfig::new(dir.path().join("torn.dat")).entries(16);
    let map: Arc<SharedHashMap<u64, Mirrored, Native<u64>, Native<Mirrored>>> =
        Arc::new(SharedHashMap::open_or_create(&config, Native::new(), Native::new()).unwrap());
    map.put(&7, &Mirrored::filled(0)).unwrap();

    let writers: Vec<_> = (1..=2u64)
        .map(|w| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..5_000u64 {
                    map.put(&7, &Mirrored::filled(w * 1_000_000 + i)).unwrap();
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let mut scratch = Mirrored::filled(0);
                for _ in 0..5_000 {
                    assert!(map.get_using(&7, &mut scratch).unwrap());
                    assert!(scratch.a.iter().chain(&scratch.b).all(|&x| x == scratch.a[0]));
                }
            })
        })
        .collect();
    for h in writers.into_iter().chain(readers) {
        h.join().unwrap();
    }
}

#[test]
fn put_remove_get_on_one_key_stay_whole() {
    let dir = TempDir::new().unwrap();
    let config = MapConfig::new(dir.path().join("churn.dat")).entries(16);
    let map: Arc<SharedHashMap<u64, Mirrored, Native<u64>, Native<Mirrored>>> =
        Arc::new(SharedHashMap::open_or_create(&config, Native::new(), Native::new()).unwrap());

    let writers: Vec<_> = (1..=2u64)
        .map(|w| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for i in 0..3_000u64 {
                    map.put(&7, &Mirrored::filled(w * 1_000_000 + i)).unwrap();
                }
            })
        })
        .collect();
    let removers: Vec<_> = (0..2)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..3_000 {
                    if let Some(v) = map.remove(&7).unwrap() {
                        assert_eq!(v, Mirrored::filled(v.a[0]));
                    }
                }
            })
        })
        .collect();
    let readers: Vec<_> = (0..2)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                for _ in 0..3_000 {
                    if let Some(v) = map.get(&7).unwrap() {
                        assert_eq!(v, Mirrored::filled(v.a[0]));
                    }
                    assert!(map.exact_size().unwrap() <= 1);
                }
            })
        })
        .collect();
    for h in writers.into_iter().chain(removers).chain(readers) {
        h.join().unwrap();
    }
    assert!(map.exact_size().unwrap() <= 1);
}

#[test]
fn put_if_absent_has_one_winner() {
    let dir = TempDir::new().unwrap();
    let map = Arc::new(u64_map(&dir, 256, 4));

    for key in 0..50u64 {
        let winners: usize = (0..4u64)
            .map(|t| {
                let map = Arc::clone(&map);
                thread::spawn(move || map.put_if_absent(&key, &t).unwrap().is_none() as usize)
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|h| h.join().unwrap())
            .sum();
        assert_eq!(winners, 1, "key {key}");
    }
    assert_eq!(map.size().unwrap(), 50);
}

#[test]
fn atomic_adds_are_not_lost() {
    let dir = TempDir::new().unwrap();
    let map = Arc::new(u64_map(&dir, 16, 1));
    map.put(&1, &0).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let r = map.get_ref(&1).unwrap().unwrap();
                let counter = r.field_u64("value").unwrap();
                for _ in 0..10_000 {
                    counter.add(1).unwrap();
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.get(&1).unwrap(), Some(80_000));
}

#[test]
fn cas_loop_increments_exactly() {
    let dir = TempDir::new().unwrap();
    let map = Arc::new(u64_map(&dir, 16, 1));
    map.put(&9, &0).unwrap();

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let map = Arc::clone(&map);
            thread::spawn(move || {
                let r = map.get_ref(&9).unwrap().unwrap();
                let field = r.field_u64("value").unwrap();
                for _ in 0..2_000 {
                    loop {
                        let cur = field.load().unwrap();
                        if field.compare_and_swap(cur, cur + 1).unwrap() {
                            break;
                        }
                    }
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
    assert_eq!(map.get(&9).unwrap(), Some(8_000));
}

#[test]
fn for_each_runs_alongside_writers() {
    let dir = TempDir::new().unwrap();
    let map = Arc::new(u64_map(&dir, 4_096, 8));
    for i in 0..1_000u64 {
        map.put(&i, &i).unwrap();
    }

    let writer = {
        let map = Arc::clone(&map);
        thread::spawn(move || {
            for i in 1_000..2_000u64 {
                map.put(&i, &i).unwrap();
            }
        })
    };
    let mut seen = 0;
    map.for_each(|k, v| {
        assert_eq!(k, v);
        seen += 1;
    })
    .unwrap();
    writer.join().unwrap();

    // Entries present before the scan started are always visited.
    assert!((1_000..=2_000).contains(&seen));
    assert_eq!(map.exact_size().unwrap(), 2_000);
}
