//! Revision index for the in-memory backend.
//!
//! Maps every key to its history as a list of generations. A generation starts
//! when the key is created and ends when it is deleted; it records every
//! revision that modified the key in between. This is what allows reads at a
//! past revision and replay of watch history.

use std::collections::BTreeMap;
use tracing::debug;

/// A (main, sub) revision. `main` is the store revision, `sub` orders the
/// writes within one transaction.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Revision {
    pub main: i64,
    pub sub: i64,
}

impl Revision {
    pub fn new(main: i64, sub: i64) -> Self {
        Self { main, sub }
    }
}

#[derive(Clone, Debug)]
struct Generation {
    created: Revision,
    revisions: Vec<Revision>,
    deleted: Option<Revision>,
}

impl Generation {
    fn alive_at(&self, revision: i64) -> bool {
        self.created.main <= revision && self.deleted.map_or(true, |del| del.main > revision)
    }
}

#[derive(Clone, Debug, Default)]
struct KeyHistory {
    generations: Vec<Generation>,
}

impl KeyHistory {
    fn generation_at(&self, revision: i64) -> Option<&Generation> {
        self.generations.iter().find(|g| g.alive_at(revision))
    }

    fn revision_at(&self, revision: i64) -> Option<Revision> {
        self.generation_at(revision)?
            .revisions
            .iter()
            .rfind(|r| r.main <= revision)
            .copied()
    }
}

#[derive(Default)]
pub struct KeyIndex {
    tree: BTreeMap<Vec<u8>, KeyHistory>,
}

impl KeyIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// The revision of `key` visible at `revision`, if the key existed then.
    pub fn get(&self, key: &[u8], revision: i64) -> Option<Revision> {
        self.tree.get(key)?.revision_at(revision)
    }

    /// Records a write. Starts a new generation if the key is absent.
    pub fn put(&mut self, key: &[u8], revision: Revision) {
        let history = self.tree.entry(key.to_vec()).or_default();

        match history.generations.last_mut() {
            Some(current) if current.deleted.is_none() => current.revisions.push(revision),
            _ => history.generations.push(Generation {
                created: revision,
                revisions: vec![revision],
                deleted: None,
            }),
        }

        debug!(key = %String::from_utf8_lossy(key), revision = revision.main, "Index put");
    }

    /// Records a deletion, closing the current generation.
    pub fn tombstone(&mut self, key: &[u8], revision: Revision) {
        if let Some(current) = self
            .tree
            .get_mut(key)
            .and_then(|h| h.generations.last_mut())
        {
            if current.deleted.is_none() {
                current.deleted = Some(revision);
                debug!(key = %String::from_utf8_lossy(key), revision = revision.main, "Index tombstone");
            }
        }
    }

    /// Keys in `[start, end)` alive at `revision`, with their visible revision.
    /// An empty `end` means unbounded.
    pub fn range(&self, start: &[u8], end: &[u8], revision: i64) -> Vec<(Vec<u8>, Revision)> {
        let iter: Box<dyn Iterator<Item = (&Vec<u8>, &KeyHistory)>> = if end.is_empty() {
            Box::new(self.tree.range(start.to_vec()..))
        } else if start >= end {
            Box::new(std::iter::empty())
        } else {
            Box::new(self.tree.range(start.to_vec()..end.to_vec()))
        };

        iter.filter_map(|(key, history)| {
            history
                .revision_at(revision)
                .map(|rev| (key.clone(), rev))
        })
        .collect()
    }

    /// Drops history older than `compact_revision`.
    ///
    /// For each live generation the newest revision at or below the compaction
    /// point is kept, so reads at exactly `compact_revision` still work.
    /// Generations deleted at or before the compaction point are dropped.
    pub fn compact(&mut self, compact_revision: i64) {
        for history in self.tree.values_mut() {
            history
                .generations
                .retain(|g| g.deleted.map_or(true, |d| d.main > compact_revision));

            for gen in &mut history.generations {
                let keep_from = gen
                    .revisions
                    .iter()
                    .rposition(|r| r.main <= compact_revision)
                    .unwrap_or(0);
                gen.revisions.drain(..keep_from);
                if let Some(first) = gen.revisions.first() {
                    gen.created = *first;
                }
            }
        }
        self.tree.retain(|_, h| !h.generations.is_empty());

        debug!(compact_revision, "Index compacted");
    }

    /// True if the index still references `key` at exactly `main`.
    pub fn references(&self, key: &[u8], main: i64) -> bool {
        self.tree.get(key).map_or(false, |h| {
            h.generations.iter().any(|g| {
                g.revisions.iter().any(|r| r.main == main)
                    || g.deleted.map_or(false, |d| d.main == main)
            })
        })
    }

    pub fn count_revisions(&self, key: &[u8]) -> usize {
        self.tree
            .get(key)
            .map(|h| h.generations.iter().map(|g| g.revisions.len()).sum())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.tree.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }
}
