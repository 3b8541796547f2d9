//! Typed watch streams.
//!
//! A spawned task reads the backend watch, decodes every event, applies the
//! selection predicate and pushes the result into a bounded channel. The
//! task ends when the caller drops or stops the stream, when the request
//! context ends, or after delivering a terminal error.

use super::errors::interpret_watch_error;
use super::{decode_object, Context};
use crate::backend::{header_revision, WatchResponseStream};
use crate::codec::Codec;
use crate::error::{StorageError, StorageResult, WATCH_TOO_OLD};
use crate::meta::Object;
use crate::mvccpb::{event::EventType, Event};
use crate::selection::SelectionPredicate;
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Capacity of the channel between the watch task and the consumer.
const WATCH_CHANNEL_CAPACITY: usize = 100;

/// A change delivered by [`crate::Store::watch`].
#[derive(Clone, Debug, PartialEq)]
pub enum WatchEvent<T> {
    Added(T),
    Modified(T),
    Deleted(T),
    /// The stream has seen every change up to `resource_version`. Carries no object.
    Bookmark { resource_version: String },
}

impl<T: Object> WatchEvent<T> {
    pub fn object(&self) -> Option<&T> {
        match self {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) | WatchEvent::Deleted(obj) => Some(obj),
            WatchEvent::Bookmark { .. } => None,
        }
    }

    pub fn resource_version(&self) -> &str {
        match self {
            WatchEvent::Bookmark { resource_version } => resource_version,
            _ => self
                .object()
                .map(|obj| obj.meta().resource_version())
                .unwrap_or_default(),
        }
    }
}

/// Consumer side of a watch. Dropping it stops the watch.
pub struct WatchStream<T> {
    inner: ReceiverStream<StorageResult<WatchEvent<T>>>,
    stop: CancellationToken,
}

impl<T> WatchStream<T> {
    /// Stops the watch. Events already buffered are discarded.
    pub fn stop(&mut self) {
        self.stop.cancel();
        self.inner.close();
    }
}

impl<T> Drop for WatchStream<T> {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

impl<T> Stream for WatchStream<T> {
    type Item = StorageResult<WatchEvent<T>>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        if self.stop.is_cancelled() {
            return Poll::Ready(None);
        }
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

pub(crate) struct WatchTask<T> {
    pub key: String,
    pub codec: Arc<dyn Codec<T>>,
    pub predicate: SelectionPredicate<T>,
    /// Events at or above this revision are delivered.
    pub start_revision: i64,
    pub allow_bookmarks: bool,
    pub initial: Vec<WatchEvent<T>>,
}

impl<T: Object> WatchTask<T> {
    /// Spawns the task and returns the consumer stream.
    pub fn spawn(self, ctx: &Context, backend: WatchResponseStream) -> WatchStream<T> {
        let (tx, rx) = mpsc::channel(WATCH_CHANNEL_CAPACITY);
        let stop = ctx.token().child_token();
        let task_ctx = ctx.child();
        let task_stop = stop.clone();

        tokio::spawn(async move {
            tokio::select! {
                _ = task_stop.cancelled() => {}
                _ = task_ctx.done() => {}
                _ = self.run(backend, &tx) => {}
            }
            debug!("Watch task stopped");
        });

        WatchStream {
            inner: ReceiverStream::new(rx),
            stop,
        }
    }

    async fn run(
        &self,
        mut backend: WatchResponseStream,
        tx: &mpsc::Sender<StorageResult<WatchEvent<T>>>,
    ) {
        for event in &self.initial {
            if tx.send(Ok(event.clone())).await.is_err() {
                return;
            }
        }

        loop {
            let resp = match backend.next().await {
                None => {
                    let _ = tx
                        .send(Err(StorageError::unreachable(&self.key, "watch stream closed")))
                        .await;
                    return;
                }
                Some(Err(e)) => {
                    let _ = tx.send(Err(interpret_watch_error(e, &self.key))).await;
                    return;
                }
                Some(Ok(resp)) => resp,
            };

            if resp.canceled {
                let err = if resp.compact_revision > 0 {
                    StorageError::expired(WATCH_TOO_OLD)
                } else {
                    StorageError::unreachable(&self.key, resp.cancel_reason)
                };
                let _ = tx.send(Err(err)).await;
                return;
            }

            if resp.events.is_empty() {
                let revision = header_revision(&resp.header);
                // Never hand out a resume point before where the watch started.
                if self.allow_bookmarks && revision >= self.start_revision {
                    let bookmark = WatchEvent::Bookmark {
                        resource_version: revision.to_string(),
                    };
                    if tx.send(Ok(bookmark)).await.is_err() {
                        return;
                    }
                }
                continue;
            }

            for event in &resp.events {
                let transformed = match self.transform(event) {
                    Ok(Some(ev)) => Ok(ev),
                    Ok(None) => continue,
                    Err(e) => Err(e),
                };
                let failed = transformed.is_err();
                if tx.send(transformed).await.is_err() || failed {
                    return;
                }
            }
        }
    }

    /// Turns a backend event into a typed event, honouring predicate
    /// transitions. Returns `None` when the event is filtered out.
    fn transform(&self, event: &Event) -> StorageResult<Option<WatchEvent<T>>> {
        let Some(kv) = event.kv.as_ref() else {
            return Ok(None);
        };
        if kv.mod_revision < self.start_revision {
            return Ok(None);
        }
        let revision = kv.mod_revision;

        let old = match event.prev_kv.as_ref() {
            Some(prev) if !prev.value.is_empty() => {
                let obj: T = decode_object(self.codec.as_ref(), &prev.value, revision)?;
                let matched = self.predicate.matches(&obj)?;
                Some((obj, matched))
            }
            _ => None,
        };

        if event.r#type == EventType::Delete as i32 {
            return Ok(match old {
                Some((obj, true)) => Some(WatchEvent::Deleted(obj)),
                Some((_, false)) => None,
                None => {
                    warn!(key = %String::from_utf8_lossy(&kv.key), revision, "Delete event without previous value");
                    None
                }
            });
        }

        let current: T = decode_object(self.codec.as_ref(), &kv.value, revision)?;
        let current_matches = self.predicate.matches(&current)?;

        Ok(match (old, current_matches) {
            (None, true) => Some(WatchEvent::Added(current)),
            (None, false) => None,
            (Some((_, true)), true) => Some(WatchEvent::Modified(current)),
            (Some((_, false)), true) => Some(WatchEvent::Added(current)),
            (Some((old, true)), false) => Some(WatchEvent::Deleted(old)),
            (Some((_, false)), false) => None,
        })
    }
}
