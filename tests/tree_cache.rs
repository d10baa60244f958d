use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use biomero_importer_core::error::CacheError;
use biomero_importer_core::node::{FilePayload, Node, NodeAddress, NodeSource};
use biomero_importer_core::tree_cache::TreeCache;

fn file(id: i64, name: &str) -> Node {
    Node::file(
        FilePayload {
            remote_id: id,
            name: name.to_string(),
            mimetype: None,
            size: None,
            path: None,
        },
        NodeSource::omero(),
    )
}

fn dataset(id: i64) -> Node {
    Node::dataset(id, format!("dataset {id}"), NodeSource::omero())
}

#[test]
fn new_cache_holds_only_the_root_placeholder() {
    let cache = TreeCache::new();
    assert_eq!(cache.len(), 1);
    let root = cache.get(&NodeAddress::root()).unwrap();
    assert!(root.child_addresses.is_empty());
    assert!(root.is_folder());
}

#[test]
fn install_children_sets_parent_child_list_in_order() {
    let cache = TreeCache::new();
    let root = NodeAddress::root();
    let projects = vec![
        Node::project(2, "second", NodeSource::omero()),
        Node::project(1, "first", NodeSource::omero()),
    ];

    let installed = cache.install_children(&root, projects).unwrap();

    assert_eq!(installed.len(), 2);
    let parent = cache.get(&root).unwrap();
    let order: Vec<&str> = parent.child_addresses.iter().map(|a| a.as_str()).collect();
    assert_eq!(order, ["project-2", "project-1"]);
    assert_eq!(parent.child_count, 2);
    for addr in &parent.child_addresses {
        assert!(cache.contains(addr), "{addr} should resolve");
    }
}

#[test]
fn install_children_under_unknown_parent_is_a_precondition_violation() {
    let cache = TreeCache::new();
    let err = cache
        .install_children(&NodeAddress::from("dataset-10"), vec![file(100, "a.tif")])
        .unwrap_err();
    assert!(matches!(err, CacheError::PreconditionViolation(_)));
    assert!(!cache.contains(&NodeAddress::from("file-100")));
}

#[test]
fn install_children_under_a_leaf_is_rejected() {
    let cache = TreeCache::new();
    let leaf = file(100, "a.tif");
    let leaf_addr = leaf.address.clone();
    cache.put(HashMap::from([(leaf_addr.clone(), leaf)])).unwrap();

    let err = cache.install_children(&leaf_addr, vec![file(101, "b.tif")]);
    assert!(matches!(err, Err(CacheError::PreconditionViolation(_))));
}

#[test]
fn install_children_rejects_a_child_listed_twice() {
    let cache = TreeCache::new();
    let ds = dataset(10);
    let addr = ds.address.clone();
    cache.put(HashMap::from([(addr.clone(), ds)])).unwrap();

    let err = cache.install_children(
        &addr,
        vec![file(100, "a.tif"), file(101, "b.tif"), file(100, "a copy.tif")],
    );

    assert!(matches!(err, Err(CacheError::PreconditionViolation(_))));
    assert!(cache.get(&addr).unwrap().child_addresses.is_empty());
    assert!(cache.get(&NodeAddress::from("file-101")).is_none());
}

#[test]
fn put_replaces_records_wholesale() {
    let cache = TreeCache::new();
    let ds = dataset(10);
    let addr = ds.address.clone();
    cache.put(HashMap::from([(addr.clone(), ds)])).unwrap();
    cache
        .install_children(&addr, vec![file(100, "a.tif"), file(101, "b.tif")])
        .unwrap();

    let fresh = Node::dataset(10, "renamed", NodeSource::omero()).with_child_count(7);
    cache.put(HashMap::from([(addr.clone(), fresh)])).unwrap();

    let stored = cache.get(&addr).unwrap();
    assert_eq!(stored.label, "renamed");
    assert_eq!(stored.child_count, 7);
    assert!(stored.child_addresses.is_empty(), "old child list must not survive");
}

#[test]
fn put_refuses_to_change_a_node_kind() {
    let cache = TreeCache::new();
    let ds = dataset(10);
    let addr = ds.address.clone();
    cache.put(HashMap::from([(addr.clone(), ds)])).unwrap();

    let mut impostor = file(10, "not-a-dataset");
    impostor.address = addr.clone();
    let err = cache.put(HashMap::from([(addr.clone(), impostor)])).unwrap_err();

    assert!(matches!(err, CacheError::PreconditionViolation(_)));
    assert!(cache.get(&addr).unwrap().is_folder());
}

#[test]
fn put_rejects_records_stored_under_another_key() {
    let cache = TreeCache::new();
    let err = cache
        .put(HashMap::from([(NodeAddress::from("dataset-11"), dataset(10))]))
        .unwrap_err();
    assert!(matches!(err, CacheError::PreconditionViolation(_)));
    assert_eq!(cache.len(), 1);
}

#[test]
fn walk_lists_expanded_subtree_depth_first() {
    let cache = TreeCache::new();
    let root = NodeAddress::root();
    cache
        .install_children(&root, vec![Node::project(1, "p", NodeSource::omero())])
        .unwrap();
    cache
        .install_children(&NodeAddress::from("project-1"), vec![dataset(10), dataset(11)])
        .unwrap();
    cache
        .install_children(&NodeAddress::from("dataset-10"), vec![file(100, "a.tif")])
        .unwrap();

    let listing: Vec<(usize, String)> = cache
        .walk(&root)
        .into_iter()
        .map(|(depth, node)| (depth, node.address.to_string()))
        .collect();

    assert_eq!(
        listing,
        vec![
            (0, "root".to_string()),
            (1, "project-1".to_string()),
            (2, "dataset-10".to_string()),
            (3, "file-100".to_string()),
            (2, "dataset-11".to_string()),
        ]
    );
}

#[test]
fn concurrent_readers_never_observe_a_partial_install() {
    let cache = Arc::new(TreeCache::new());
    let ds = dataset(10);
    let parent = ds.address.clone();
    cache.put(HashMap::from([(parent.clone(), ds)])).unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let reader = {
        let cache = cache.clone();
        let parent = parent.clone();
        let done = done.clone();
        std::thread::spawn(move || {
            let mut observations = 0usize;
            loop {
                let node = cache.get(&parent).unwrap();
                assert!(node.child_addresses.is_empty() || node.child_addresses.len() == 5);
                let children = cache.children(&parent).unwrap();
                assert!(children.iter().all(|c| !c.is_folder()));
                // walk resolves under one read lock, so every listed child must be present.
                let listed = cache.walk(&parent);
                let expected = listed[0].1.child_addresses.len();
                assert_eq!(listed.len(), expected + 1, "dangling child reference observed");
                observations += 1;
                if done.load(Ordering::SeqCst) {
                    break observations;
                }
            }
        })
    };

    for round in 0..200_i64 {
        let batch: Vec<Node> = (0..5).map(|i| file(round * 5 + i, "f.tif")).collect();
        cache.install_children(&parent, batch).unwrap();
    }
    done.store(true, Ordering::SeqCst);

    let observations = reader.join().unwrap();
    assert!(observations > 0);
    assert_eq!(cache.get(&parent).unwrap().child_addresses.len(), 5);
}
