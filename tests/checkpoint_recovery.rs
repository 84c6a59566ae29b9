//! Durability scenarios: checkpoint + reopen equals the checkpointed
//! state, abandoned (never-checkpointed) work disappears, and a tiny
//! cache forces the partial-eviction and partial-fetch machinery through
//! its paces.

use std::path::PathBuf;

use tempfile::TempDir;

use burrowdb::{Brt, Env, TreeOptions, TxnView, Xids};

fn small_tree_options() -> TreeOptions {
    TreeOptions {
        nodesize: 4096,
        basement_nodesize: 1024,
        ..TreeOptions::default()
    }
}

fn fixture() -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dict.brw");
    (dir, path)
}

fn key(i: u32) -> Vec<u8> {
    format!("key{i:08}").into_bytes()
}

#[test]
fn checkpoint_then_reopen_restores_everything() {
    let (_dir, path) = fixture();
    {
        let tree = Brt::create(&path, small_tree_options(), Env::new()).unwrap();
        for i in 0..600 {
            tree.insert(&key(i), format!("v{i}").as_bytes(), Xids::root())
                .unwrap();
        }
        for i in (0..600).step_by(3) {
            tree.delete(&key(i), Xids::root()).unwrap();
        }
        tree.close().unwrap();
    }

    let tree = Brt::open(&path, small_tree_options(), Env::new()).unwrap();
    let view = TxnView::wide_open();
    for i in 0..600 {
        let expected = if i % 3 == 0 {
            None
        } else {
            Some(format!("v{i}").into_bytes())
        };
        assert_eq!(tree.lookup(&key(i), &view).unwrap(), expected, "key {i}");
    }

    // The reopened tree keeps working.
    tree.insert(b"after-reopen", b"yes", Xids::root()).unwrap();
    assert_eq!(
        tree.lookup(b"after-reopen", &view).unwrap(),
        Some(b"yes".to_vec())
    );
}

#[test]
fn crash_without_checkpoint_loses_only_uncheckpointed_work() {
    let (_dir, path) = fixture();
    {
        let tree = Brt::create(&path, small_tree_options(), Env::new()).unwrap();
        for i in 0..100 {
            tree.insert(&key(i), b"durable", Xids::root()).unwrap();
        }
        tree.checkpoint().unwrap();

        // Work after the checkpoint is never made durable: the handle is
        // dropped without closing, as a crash would.
        for i in 100..200 {
            tree.insert(&key(i), b"volatile", Xids::root()).unwrap();
        }
        for i in 0..50 {
            tree.delete(&key(i), Xids::root()).unwrap();
        }
    }

    let tree = Brt::open(&path, small_tree_options(), Env::new()).unwrap();
    let view = TxnView::wide_open();
    for i in 0..100 {
        assert_eq!(
            tree.lookup(&key(i), &view).unwrap(),
            Some(b"durable".to_vec()),
            "checkpointed key {i} must survive"
        );
    }
    for i in 100..200 {
        assert_eq!(
            tree.lookup(&key(i), &view).unwrap(),
            None,
            "post-checkpoint key {i} must vanish"
        );
    }
}

#[test]
fn uncommitted_broadcast_update_vanishes_on_crash() {
    fn square_updater(_key: &[u8], old: Option<&[u8]>, _extra: &[u8]) -> Option<Vec<u8>> {
        old.map(|v| {
            let n: i64 = String::from_utf8_lossy(v).parse().unwrap();
            (n * n).to_string().into_bytes()
        })
    }

    let opts = TreeOptions {
        update_cb: Some(square_updater),
        ..small_tree_options()
    };

    let (_dir, path) = fixture();
    {
        let tree = Brt::create(&path, opts.clone(), Env::new()).unwrap();
        for k in 0..100i64 {
            let v = (10 - k).to_string();
            tree.insert(&key(k as u32), v.as_bytes(), Xids::root())
                .unwrap();
        }
        tree.checkpoint().unwrap();

        // A transactional broadcast update that is never committed and
        // never checkpointed: a crash must erase every trace of it.
        tree.update_broadcast(b"", Xids::from_chain(&[77])).unwrap();
        let writer = TxnView::of_txn(Xids::from_chain(&[77]), 77);
        assert_eq!(
            tree.lookup(&key(0), &writer).unwrap(),
            Some(b"100".to_vec()),
            "the writer sees its own squared value"
        );
    }

    let tree = Brt::open(&path, opts, Env::new()).unwrap();
    let view = TxnView::wide_open();
    for k in 0..100i64 {
        let expected = (10 - k).to_string().into_bytes();
        assert_eq!(
            tree.lookup(&key(k as u32), &view).unwrap(),
            Some(expected),
            "key {k} must have its original value after recovery"
        );
    }
}

#[test]
fn repeated_checkpoints_alternate_header_slots() {
    let (_dir, path) = fixture();
    let tree = Brt::create(&path, small_tree_options(), Env::new()).unwrap();

    for round in 0..5u32 {
        tree.insert(
            format!("round{round}").as_bytes(),
            b"present",
            Xids::root(),
        )
        .unwrap();
        tree.checkpoint().unwrap();
    }
    drop(tree);

    let tree = Brt::open(&path, small_tree_options(), Env::new()).unwrap();
    let view = TxnView::wide_open();
    for round in 0..5u32 {
        assert_eq!(
            tree.lookup(format!("round{round}").as_bytes(), &view).unwrap(),
            Some(b"present".to_vec())
        );
    }
}

#[test]
fn tiny_cache_forces_eviction_and_partial_fetch() {
    let opts = TreeOptions {
        nodesize: 4096,
        basement_nodesize: 512,
        // Far too small for the working set: nodes constantly page out,
        // partially evict, and fault back in.
        cache_bytes: 32 * 1024,
        ..TreeOptions::default()
    };
    let (_dir, path) = fixture();
    let tree = Brt::create(&path, opts, Env::new()).unwrap();
    let view = TxnView::wide_open();

    for i in 0..1500 {
        tree.insert(&key(i), format!("value-{i}").as_bytes(), Xids::root())
            .unwrap();
    }
    tree.checkpoint().unwrap();

    // Random-order point reads fault individual basements back in.
    for i in (0..1500).rev().step_by(7) {
        assert_eq!(
            tree.lookup(&key(i), &view).unwrap(),
            Some(format!("value-{i}").into_bytes()),
            "key {i}"
        );
    }

    // A full scan touches every partition of every leaf.
    let mut cursor = tree.cursor(view).unwrap();
    let mut seen = 0;
    let mut entry = cursor.first().unwrap();
    while entry.is_some() {
        seen += 1;
        entry = cursor.next().unwrap();
    }
    assert_eq!(seen, 1500);
}
