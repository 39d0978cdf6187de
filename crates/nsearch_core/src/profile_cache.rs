/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Result;
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tracing::debug;

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[derive(Debug, Clone, Serialize)]
pub struct ProfileRecord {
    pub pubkey: String,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub picture: Option<String>,
    pub nip05: Option<String>,
    pub fetched_at: u64,
}

impl ProfileRecord {
    pub fn bare(pubkey: &str) -> Self {
        Self {
            pubkey: pubkey.to_string(),
            name: None,
            display_name: None,
            picture: None,
            nip05: None,
            fetched_at: now_secs(),
        }
    }

    /// Best display label, falling back through the metadata fields.
    pub fn label(&self) -> Option<&str> {
        self.display_name
            .as_deref()
            .or(self.name.as_deref())
            .filter(|s| !s.is_empty())
    }
}

/// Cache outcome. `Missing` is the negative marker written after a failed or
/// empty fetch; it keeps the key from being retried for the rest of the
/// session and is a normal, displayable state.
#[derive(Debug, Clone)]
pub enum CacheLookup {
    Found(Arc<ProfileRecord>),
    Missing,
}

impl CacheLookup {
    pub fn record(&self) -> Option<&Arc<ProfileRecord>> {
        match self {
            CacheLookup::Found(record) => Some(record),
            CacheLookup::Missing => None,
        }
    }
}

/// Capability to resolve one author's metadata. Failures are absorbed by the
/// cache, never surfaced to callers.
#[async_trait]
pub trait MetadataLookup: Send + Sync {
    async fn lookup(&self, pubkey: &str) -> Result<Option<ProfileRecord>>;
}

struct Slot {
    entry: CacheLookup,
    last_used: u64,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<String, Slot>,
    inflight: HashMap<String, watch::Receiver<bool>>,
    tick: u64,
}

enum Step {
    Hit(CacheLookup),
    Wait(watch::Receiver<bool>),
    Fetch(watch::Sender<bool>),
}

/// Memoized author-metadata lookups, bounded by a least-recently-used cap.
/// Entries, once written, are never overwritten; concurrent misses on the
/// same key share one underlying fetch.
pub struct ProfileCache {
    capacity: usize,
    lookup: Arc<dyn MetadataLookup>,
    state: Mutex<CacheState>,
}

impl ProfileCache {
    pub fn new(capacity: usize, lookup: Arc<dyn MetadataLookup>) -> Self {
        Self {
            capacity: capacity.max(1),
            lookup,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// Cached record if present without touching the network.
    pub async fn peek(&self, pubkey: &str) -> Option<CacheLookup> {
        let mut state = self.state.lock().await;
        state.tick += 1;
        let tick = state.tick;
        state.entries.get_mut(pubkey).map(|slot| {
            slot.last_used = tick;
            slot.entry.clone()
        })
    }

    pub async fn get(&self, pubkey: &str) -> CacheLookup {
        loop {
            let step = {
                let mut state = self.state.lock().await;
                state.tick += 1;
                let tick = state.tick;
                if let Some(slot) = state.entries.get_mut(pubkey) {
                    slot.last_used = tick;
                    Step::Hit(slot.entry.clone())
                } else if let Some(rx) = state.inflight.get(pubkey) {
                    Step::Wait(rx.clone())
                } else {
                    let (tx, rx) = watch::channel(false);
                    state.inflight.insert(pubkey.to_string(), rx);
                    Step::Fetch(tx)
                }
            };
            match step {
                Step::Hit(entry) => return entry,
                Step::Wait(mut rx) => {
                    // Someone else owns the fetch; wait for it to settle and
                    // re-read the cache.
                    let _ = rx.changed().await;
                }
                Step::Fetch(done) => return self.fetch_and_store(pubkey, done).await,
            }
        }
    }

    /// Resolves a batch with bounded parallelism. Keys already cached or in
    /// flight cost nothing extra.
    pub async fn fetch_many(&self, pubkeys: Vec<String>, window: usize) {
        let window = window.max(1);
        futures_util::stream::iter(pubkeys)
            .for_each_concurrent(window, |pubkey| async move {
                let _ = self.get(&pubkey).await;
            })
            .await;
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn clear(&self) {
        self.state.lock().await.entries.clear();
    }

    async fn fetch_and_store(&self, pubkey: &str, done: watch::Sender<bool>) -> CacheLookup {
        let fetched = match self.lookup.lookup(pubkey).await {
            Ok(Some(record)) => CacheLookup::Found(Arc::new(record)),
            Ok(None) => CacheLookup::Missing,
            Err(e) => {
                debug!(%pubkey, "profile lookup failed: {e:#}");
                CacheLookup::Missing
            }
        };

        let mut state = self.state.lock().await;
        state.inflight.remove(pubkey);
        state.tick += 1;
        let tick = state.tick;
        let entry = state
            .entries
            .entry(pubkey.to_string())
            .or_insert(Slot {
                entry: fetched,
                last_used: tick,
            })
            .entry
            .clone();
        evict_over_capacity(&mut state, self.capacity);
        drop(state);

        let _ = done.send(true);
        entry
    }
}

fn evict_over_capacity(state: &mut CacheState, capacity: usize) {
    while state.entries.len() > capacity {
        let oldest = state
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone());
        match oldest {
            Some(key) => {
                debug!(pubkey = %key, "evicting least-recently-used profile");
                state.entries.remove(&key);
            }
            None => break,
        }
    }
}
