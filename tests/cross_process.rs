//! Two processes sharing one file. The child is this test binary re-run
//! with an environment variable selecting its role.

use std::env;
use std::path::Path;
use std::process::Command;

use tempfile::TempDir;
use warp_map::{LockPolicy, MapConfig, Native, SharedHashMap, StrCodec};

const ROLE: &str = "WARP_MAP_CHILD_ROLE";
const FILE: &str = "WARP_MAP_CHILD_FILE";

type Map = SharedHashMap<String, u64, StrCodec, Native<u64>>;

fn config(path: &Path) -> MapConfig {
    MapConfig::new(path).entries(1_024).min_segments(4)
}

fn open(path: &Path) -> Map {
    SharedHashMap::open_or_create(&config(path), StrCodec::new(32), Native::new()).unwrap()
}

/// Re-run a single test of this binary as a child with `role`.
fn spawn_child(test: &str, role: &str, path: &Path) -> std::process::Child {
    Command::new(env::current_exe().unwrap())
        .args([test, "--exact", "--nocapture", "--test-threads=1"])
        .env(ROLE, role)
        .env(FILE, path)
        .spawn()
        .unwrap()
}

fn child_role() -> Option<(String, std::path::PathBuf)> {
    let role = env::var(ROLE).ok()?;
    let file = env::var_os(FILE)?;
    Some((role, file.into()))
}

#[test]
fn child_entry_point() {
    let Some((role, path)) = child_role() else {
        return;
    };
    let map = open(&path);
    match role.as_str() {
        "writer" => {
            for i in 0..200u64 {
                map.put(&format!("child-{i}"), &i).unwrap();
            }
        }
        "counter" => {
            let r = map.get_ref(&"shared".to_string()).unwrap().unwrap();
            let counter = r.field_u64("value").unwrap();
            for _ in 0..5_000 {
                counter.add(1).unwrap();
            }
        }
        other => panic!("unknown role {other}"),
    }
    map.close();
}

#[test]
fn entries_written_by_another_process_are_visible() {
    if child_role().is_some() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("shared.dat");
    let map = open(&path);
    map.put(&"parent".to_string(), &1).unwrap();

    let status = spawn_child("child_entry_point", "writer", &path).wait().unwrap();
    assert!(status.success());

    for i in 0..200u64 {
        assert_eq!(map.get(&format!("child-{i}")).unwrap(), Some(i));
    }
    assert_eq!(map.size().unwrap(), 201);
    map.close();

    let fresh = Map::open(&path, StrCodec::new(32), Native::new(), LockPolicy::default()).unwrap();
    assert_eq!(fresh.get(&"child-199".to_string()).unwrap(), Some(199));
    assert_eq!(fresh.get(&"parent".to_string()).unwrap(), Some(1));
}

#[test]
fn atomic_counter_is_shared_between_processes() {
    if child_role().is_some() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("counter.dat");
    let map = open(&path);
    map.put(&"shared".to_string(), &0).unwrap();

    let children: Vec<_> = (0..2)
        .map(|_| spawn_child("child_entry_point", "counter", &path))
        .collect();
    {
        let r = map.get_ref(&"shared".to_string()).unwrap().unwrap();
        let counter = r.field_u64("value").unwrap();
        for _ in 0..5_000 {
            counter.add(1).unwrap();
        }
    }
    for mut child in children {
        assert!(child.wait().unwrap().success());
    }
    assert_eq!(map.get(&"shared".to_string()).unwrap(), Some(15_000));
}

#[test]
fn concurrent_writers_in_two_processes() {
    if child_role().is_some() {
        return;
    }
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("both.dat");
    let map = open(&path);

    let mut child = spawn_child("child_entry_point", "writer", &path);
    for i in 0..200u64 {
        map.put(&format!("parent-{i}"), &i).unwrap();
    }
    assert!(child.wait().unwrap().success());

    assert_eq!(map.exact_size().unwrap(), 400);
    assert_eq!(map.get(&"parent-5".to_string()).unwrap(), Some(5));
    assert_eq!(map.get(&"child-5".to_string()).unwrap(), Some(5));
}
