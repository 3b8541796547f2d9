//! Integration tests for typed watches.

mod common;

use apistore::error::WATCH_TOO_OLD;
use apistore::meta::ListOptions;
use apistore::selection::labels;
use apistore::{KvBackend, ResponseMeta, StorageError, StorageResult, WatchEvent, WatchStream};
use common::{ctx, item, labeled, new_store, Item};
use futures::StreamExt;
use std::time::Duration;
use tokio::time::timeout;

async fn next(stream: &mut WatchStream<Item>) -> StorageResult<WatchEvent<Item>> {
    timeout(Duration::from_secs(2), stream.next())
        .await
        .expect("watch event in time")
        .expect("stream still open")
}

/// Asserts nothing arrives for a short while.
async fn assert_quiet(stream: &mut WatchStream<Item>) {
    assert!(timeout(Duration::from_millis(100), stream.next()).await.is_err());
}

fn from(resource_version: &str) -> ListOptions {
    ListOptions {
        resource_version: resource_version.to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn test_watch_from_now() {
    let (_backend, store) = new_store();
    let ctx = ctx();
    store.create(&ctx, "/items/old", &item("old", "v"), 0).await.unwrap();

    let mut stream = store.watch(&ctx, "/items", &ListOptions::default(), true).await.unwrap();

    store.create(&ctx, "/items/a", &item("a", "v1"), 0).await.unwrap();
    store
        .guaranteed_update(&ctx, "/items/a", None, false, |current, _| {
            let mut obj = current.expect("object exists");
            obj.value = "v2".to_string();
            Ok((obj, None))
        })
        .await
        .unwrap();
    store.delete(&ctx, "/items/a", None).await.unwrap();

    let WatchEvent::Added(obj) = next(&mut stream).await.unwrap() else {
        panic!("expected Added");
    };
    assert_eq!(obj.metadata.name, "a");
    assert_eq!(obj.metadata.resource_version, "2");

    let WatchEvent::Modified(obj) = next(&mut stream).await.unwrap() else {
        panic!("expected Modified");
    };
    assert_eq!(obj.value, "v2");
    assert_eq!(obj.metadata.resource_version, "3");

    let WatchEvent::Deleted(obj) = next(&mut stream).await.unwrap() else {
        panic!("expected Deleted");
    };
    assert_eq!(obj.value, "v2");
    assert_eq!(obj.metadata.resource_version, "4");
}

#[tokio::test]
async fn test_watch_initial_state() {
    let (_backend, store) = new_store();
    let ctx = ctx();
    store.create(&ctx, "/items/a", &item("a", "v"), 0).await.unwrap();
    store.create(&ctx, "/items/b", &item("b", "v"), 0).await.unwrap();

    let mut stream = store.watch(&ctx, "/items", &from("0"), true).await.unwrap();
    let mut initial = Vec::new();
    for _ in 0..2 {
        match next(&mut stream).await.unwrap() {
            WatchEvent::Added(obj) => initial.push(obj.metadata.name),
            other => panic!("expected Added, got {other:?}"),
        }
    }
    assert_eq!(initial, vec!["a", "b"]);

    store.create(&ctx, "/items/c", &item("c", "v"), 0).await.unwrap();
    let event = next(&mut stream).await.unwrap();
    assert_eq!(event.resource_version(), "3");
}

#[tokio::test]
async fn test_watch_from_revision_replays_history() {
    let (_backend, store) = new_store();
    let ctx = ctx();
    for name in ["a", "b", "c"] {
        store.create(&ctx, &format!("/items/{name}"), &item(name, "v"), 0).await.unwrap();
    }

    let mut stream = store.watch(&ctx, "/items", &from("1"), true).await.unwrap();
    let first = next(&mut stream).await.unwrap();
    let second = next(&mut stream).await.unwrap();
    assert_eq!(first.resource_version(), "2");
    assert_eq!(second.resource_version(), "3");
    assert_quiet(&mut stream).await;
}

#[tokio::test]
async fn test_watch_single_key() {
    let (_backend, store) = new_store();
    let ctx = ctx();
    let mut stream = store.watch(&ctx, "/items/a", &ListOptions::default(), false).await.unwrap();

    store.create(&ctx, "/items/ab", &item("ab", "v"), 0).await.unwrap();
    store.create(&ctx, "/items/a", &item("a", "v"), 0).await.unwrap();

    let WatchEvent::Added(obj) = next(&mut stream).await.unwrap() else {
        panic!("expected Added");
    };
    assert_eq!(obj.metadata.name, "a");
}

#[tokio::test]
async fn test_watch_predicate_transitions() {
    let (_backend, store) = new_store();
    let ctx = ctx();
    let opts = ListOptions {
        label_selector: labels::Selector::parse("env=prod").unwrap(),
        ..Default::default()
    };
    let mut stream = store.watch(&ctx, "/items", &opts, true).await.unwrap();

    let relabel = |env: &'static str| {
        move |current: Option<Item>, _: ResponseMeta| -> StorageResult<(Item, Option<u64>)> {
            let mut obj = current.expect("object exists");
            obj.metadata.labels.insert("env".to_string(), env.to_string());
            Ok((obj, None))
        }
    };

    store
        .create(&ctx, "/items/a", &labeled("a", "v", &[("env", "dev")]), 0)
        .await
        .unwrap();
    store.guaranteed_update(&ctx, "/items/a", None, false, relabel("prod")).await.unwrap();
    store.guaranteed_update(&ctx, "/items/a", None, false, relabel("dev")).await.unwrap();

    // The object entered the selection...
    let WatchEvent::Added(obj) = next(&mut stream).await.unwrap() else {
        panic!("expected Added");
    };
    assert_eq!(obj.metadata.labels["env"], "prod");

    // ...and left it, reported with its last matching state.
    let WatchEvent::Deleted(obj) = next(&mut stream).await.unwrap() else {
        panic!("expected Deleted");
    };
    assert_eq!(obj.metadata.labels["env"], "prod");
    assert_eq!(obj.metadata.resource_version, "3");

    assert_quiet(&mut stream).await;
}

#[tokio::test]
async fn test_watch_compacted_revision() {
    let (backend, store) = new_store();
    let ctx = ctx();
    for name in ["a", "b", "c"] {
        store.create(&ctx, &format!("/items/{name}"), &item(name, "v"), 0).await.unwrap();
    }
    backend.compact(3).await.unwrap();

    let mut stream = store.watch(&ctx, "/items", &from("1"), true).await.unwrap();
    let err = next(&mut stream).await.unwrap_err();
    assert_eq!(err, StorageError::expired(WATCH_TOO_OLD));
}

#[tokio::test]
async fn test_watch_bookmarks() {
    let (backend, store) = new_store();
    let ctx = ctx();
    store.create(&ctx, "/items/a", &item("a", "v"), 0).await.unwrap();

    let opts = ListOptions {
        allow_watch_bookmarks: true,
        ..Default::default()
    };
    let mut stream = store.watch(&ctx, "/items", &opts, true).await.unwrap();
    // Nothing has happened since the watch started at revision 1.
    backend.progress_notify();
    assert_quiet(&mut stream).await;

    store.create(&ctx, "/items/b", &item("b", "v"), 0).await.unwrap();
    assert!(matches!(next(&mut stream).await.unwrap(), WatchEvent::Added(_)));
    backend.progress_notify();

    let event = next(&mut stream).await.unwrap();
    assert_eq!(
        event,
        WatchEvent::Bookmark {
            resource_version: "2".to_string()
        }
    );
    assert!(event.object().is_none());

    // Without bookmarks progress notifications stay invisible.
    let quiet_opts = ListOptions {
        resource_version: "1".to_string(),
        ..Default::default()
    };
    let mut quiet = store.watch(&ctx, "/items", &quiet_opts, true).await.unwrap();
    assert!(matches!(next(&mut quiet).await.unwrap(), WatchEvent::Added(_)));
    backend.progress_notify();
    assert_quiet(&mut quiet).await;
}

#[tokio::test]
async fn test_watch_bookmarks_never_precede_start() {
    let (backend, store) = new_store();
    let ctx = ctx();
    store.create(&ctx, "/items/a", &item("a", "v"), 0).await.unwrap();

    let opts = ListOptions {
        resource_version: "5".to_string(),
        allow_watch_bookmarks: true,
        ..Default::default()
    };
    let mut stream = store.watch(&ctx, "/items", &opts, true).await.unwrap();
    backend.progress_notify();
    assert_quiet(&mut stream).await;

    for name in ["b", "c", "d", "e", "f"] {
        store.create(&ctx, &format!("/items/{name}"), &item(name, "v"), 0).await.unwrap();
    }
    // Only the write at revision 6 lies after the starting point.
    match next(&mut stream).await.unwrap() {
        WatchEvent::Added(obj) => assert_eq!(obj.metadata.name, "f"),
        other => panic!("unexpected event {other:?}"),
    }
    backend.progress_notify();
    assert_eq!(
        next(&mut stream).await.unwrap(),
        WatchEvent::Bookmark {
            resource_version: "6".to_string()
        }
    );
}

#[tokio::test]
async fn test_watch_stop() {
    let (_backend, store) = new_store();
    let ctx = ctx();
    let mut stream = store.watch(&ctx, "/items", &ListOptions::default(), true).await.unwrap();
    store.create(&ctx, "/items/a", &item("a", "v"), 0).await.unwrap();

    stream.stop();
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_watch_ends_with_context() {
    let (_backend, store) = new_store();
    let ctx = ctx();
    let mut stream = store.watch(&ctx, "/items", &ListOptions::default(), true).await.unwrap();

    ctx.cancel();
    let ended = timeout(Duration::from_secs(2), stream.next()).await.expect("stream ends");
    assert!(ended.is_none());
}
