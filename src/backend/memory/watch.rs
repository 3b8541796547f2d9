//! Watcher registry for the in-memory backend.
//!
//! Each committed transaction is fanned out as one `WatchResponse` per
//! interested watcher. Watchers whose receiver has gone away are dropped on the
//! next send.

use super::mvcc::range_contains;
use crate::backend::BackendResult;
use crate::etcdserverpb::{ResponseHeader, WatchResponse};
use crate::mvccpb::{event::EventType, Event};
use dashmap::DashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

pub type WatchSender = mpsc::UnboundedSender<BackendResult<WatchResponse>>;

/// The key range a watcher covers, in etcd `range_end` convention.
#[derive(Clone, Debug, Hash, Eq, PartialEq)]
pub struct WatchRange {
    pub key: Vec<u8>,
    pub range_end: Vec<u8>,
}

impl WatchRange {
    pub fn contains(&self, key: &[u8]) -> bool {
        range_contains(&self.key, &self.range_end, key)
    }
}

struct Watcher {
    range: WatchRange,
    start_revision: i64,
    prev_kv: bool,
    no_put: bool,
    no_delete: bool,
    progress_notify: bool,
    tx: WatchSender,
}

impl Watcher {
    fn wants(&self, event: &Event) -> bool {
        let in_range = event.kv.as_ref().map_or(false, |kv| {
            kv.mod_revision >= self.start_revision && self.range.contains(&kv.key)
        });
        if !in_range {
            return false;
        }
        if event.r#type == EventType::Delete as i32 {
            !self.no_delete
        } else {
            !self.no_put
        }
    }
}

/// Options for a new watcher.
#[derive(Clone, Debug, Default)]
pub struct WatcherOptions {
    /// Events below this revision are never delivered.
    pub start_revision: i64,
    pub prev_kv: bool,
    pub no_put: bool,
    pub no_delete: bool,
    pub progress_notify: bool,
}

pub struct WatchHub {
    watchers: DashMap<i64, Watcher>,
    next_watch_id: AtomicI64,
}

impl Default for WatchHub {
    fn default() -> Self {
        Self::new()
    }
}

fn header(revision: i64) -> Option<ResponseHeader> {
    Some(ResponseHeader {
        revision,
        ..Default::default()
    })
}

impl WatchHub {
    pub fn new() -> Self {
        Self {
            watchers: DashMap::new(),
            next_watch_id: AtomicI64::new(1),
        }
    }

    /// Registers a watcher and returns its ID.
    pub fn register(&self, range: WatchRange, options: WatcherOptions, tx: WatchSender) -> i64 {
        let watch_id = self.next_watch_id.fetch_add(1, Ordering::SeqCst);
        self.watchers.insert(
            watch_id,
            Watcher {
                range,
                start_revision: options.start_revision,
                prev_kv: options.prev_kv,
                no_put: options.no_put,
                no_delete: options.no_delete,
                progress_notify: options.progress_notify,
                tx,
            },
        );
        debug!(watch_id, "Watch created");
        watch_id
    }

    pub fn cancel(&self, watch_id: i64) -> bool {
        let removed = self.watchers.remove(&watch_id).is_some();
        if removed {
            debug!(watch_id, "Watch canceled");
        }
        removed
    }

    /// The response a watcher receives for `events`, if any of them apply.
    fn response_for(
        watch_id: i64,
        watcher: &Watcher,
        events: &[Event],
        revision: i64,
    ) -> Option<WatchResponse> {
        let selected: Vec<Event> = events
            .iter()
            .filter(|e| watcher.wants(e))
            .map(|e| {
                let mut e = e.clone();
                if !watcher.prev_kv {
                    e.prev_kv = None;
                }
                e
            })
            .collect();
        if selected.is_empty() {
            return None;
        }
        Some(WatchResponse {
            header: header(revision),
            watch_id,
            events: selected,
            ..Default::default()
        })
    }

    /// Sends historical events of one revision to a single watcher.
    pub fn replay(&self, watch_id: i64, events: &[Event], revision: i64) {
        let Some(watcher) = self.watchers.get(&watch_id) else {
            return;
        };
        if let Some(resp) = Self::response_for(watch_id, &watcher, events, revision) {
            let _ = watcher.tx.send(Ok(resp));
        }
    }

    /// Fans out one committed revision's events.
    pub fn notify(&self, events: &[Event], revision: i64) {
        if events.is_empty() {
            return;
        }
        let mut closed = Vec::new();
        for entry in self.watchers.iter() {
            let watch_id = *entry.key();
            if let Some(resp) = Self::response_for(watch_id, entry.value(), events, revision) {
                if entry.value().tx.send(Ok(resp)).is_err() {
                    closed.push(watch_id);
                }
            }
        }
        for watch_id in closed {
            self.cancel(watch_id);
        }
    }

    /// Sends an empty progress response to every watcher that asked for one.
    pub fn progress_notify(&self, revision: i64) {
        let mut closed = Vec::new();
        for entry in self.watchers.iter() {
            if !entry.value().progress_notify {
                continue;
            }
            let resp = WatchResponse {
                header: header(revision),
                watch_id: *entry.key(),
                ..Default::default()
            };
            if entry.value().tx.send(Ok(resp)).is_err() {
                closed.push(*entry.key());
            }
        }
        for watch_id in closed {
            self.cancel(watch_id);
        }
    }

    pub fn watcher_count(&self) -> usize {
        self.watchers.len()
    }
}

/// A response telling a watcher its start revision was compacted.
pub fn compacted_response(compact_revision: i64, revision: i64) -> WatchResponse {
    WatchResponse {
        header: header(revision),
        canceled: true,
        compact_revision,
        cancel_reason: crate::backend::COMPACTED_MESSAGE.to_string(),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mvccpb::KeyValue;

    fn put_event(key: &[u8], rev: i64) -> Event {
        Event {
            r#type: EventType::Put as i32,
            kv: Some(KeyValue {
                key: key.to_vec(),
                mod_revision: rev,
                version: 1,
                ..Default::default()
            }),
            prev_kv: Some(KeyValue::default()),
        }
    }

    #[test]
    fn test_watch_range_contains() {
        let range = WatchRange {
            key: b"foo".to_vec(),
            range_end: b"fop".to_vec(),
        };
        assert!(range.contains(b"foo"));
        assert!(range.contains(b"foobar"));
        assert!(!range.contains(b"fop"));
        assert!(!range.contains(b"fon"));
    }

    #[tokio::test]
    async fn test_notify_routes_by_range() {
        let hub = WatchHub::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = hub.register(
            WatchRange {
                key: b"/a/".to_vec(),
                range_end: b"/a0".to_vec(),
            },
            WatcherOptions::default(),
            tx,
        );

        hub.notify(&[put_event(b"/b/x", 1)], 1);
        hub.notify(&[put_event(b"/a/x", 2)], 2);

        let resp = rx.recv().await.unwrap().unwrap();
        assert_eq!(resp.watch_id, id);
        assert_eq!(resp.events.len(), 1);
        assert_eq!(resp.header.unwrap().revision, 2);
        // prev_kv was not requested
        assert!(resp.events[0].prev_kv.is_none());
    }

    #[tokio::test]
    async fn test_closed_watchers_are_dropped() {
        let hub = WatchHub::new();
        let (tx, rx) = mpsc::unbounded_channel();
        hub.register(
            WatchRange {
                key: b"k".to_vec(),
                range_end: Vec::new(),
            },
            WatcherOptions::default(),
            tx,
        );
        drop(rx);

        hub.notify(&[put_event(b"k", 1)], 1);
        assert_eq!(hub.watcher_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_notify_only_when_requested() {
        let hub = WatchHub::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let range = WatchRange {
            key: b"k".to_vec(),
            range_end: Vec::new(),
        };
        hub.register(
            range.clone(),
            WatcherOptions {
                progress_notify: true,
                ..Default::default()
            },
            tx1,
        );
        hub.register(range, WatcherOptions::default(), tx2);

        hub.progress_notify(7);
        let resp = rx1.recv().await.unwrap().unwrap();
        assert!(resp.events.is_empty());
        assert_eq!(resp.header.unwrap().revision, 7);
        assert!(rx2.try_recv().is_err());
    }
}
