/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use nsearch_protocol::{Event, Filter, KIND_TEXT_NOTE};

use crate::aggregator::{ResultAggregator, SortMode};
use crate::contact_graph::ContactGraph;
use crate::profile_cache::ProfileCache;
use crate::relay_registry::RelayRegistry;
use crate::transport::{CloseHandle, RelayTransport, SubUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SearchPhase {
    Idle,
    Dispatching,
    Streaming,
    Completed,
    Cancelled,
    TimedOut,
    /// No relay was reachable at dispatch time. Distinct from `Completed`
    /// with zero results.
    NoConnectivity,
}

impl SearchPhase {
    pub fn is_live(self) -> bool {
        matches!(self, SearchPhase::Dispatching | SearchPhase::Streaming)
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            SearchPhase::Completed
                | SearchPhase::Cancelled
                | SearchPhase::TimedOut
                | SearchPhase::NoConnectivity
        )
    }
}

#[derive(Debug, Clone)]
pub struct SearchQuery {
    pub text: String,
    pub sort: SortMode,
    pub scope_to_self: bool,
}

/// Live view of a search, republished on every accepted item and once more
/// at settle. Always sorted; truncated to the display cap.
#[derive(Debug, Clone)]
pub struct SearchSnapshot {
    pub generation: u64,
    pub phase: SearchPhase,
    pub query: String,
    pub results: Vec<Arc<Event>>,
}

impl SearchSnapshot {
    fn idle() -> Self {
        Self {
            generation: 0,
            phase: SearchPhase::Idle,
            query: String::new(),
            results: Vec::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SearchSettings {
    /// Absolute deadline from `start()`; partial progress does not extend it.
    pub timeout: Duration,
    pub limit: u32,
    /// Endpoints that must report end-of-stream before the search settles
    /// naturally. `None` means all that opened.
    pub eose_quorum: Option<usize>,
    pub display_cap: usize,
    pub profile_fetch_window: usize,
}

impl Default for SearchSettings {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            limit: 100,
            eose_quorum: None,
            display_cap: 420,
            profile_fetch_window: 20,
        }
    }
}

/// Orchestrates one search at a time: fan-out across the registry's active
/// endpoints, streamed aggregation, cancellation and timeout. Restarting over
/// a live search is the normal path; the generation counter makes anything
/// the superseded fan-out still delivers stale on arrival.
pub struct SearchSession {
    registry: Arc<RelayRegistry>,
    contacts: Arc<ContactGraph>,
    profiles: Arc<ProfileCache>,
    transport: Arc<dyn RelayTransport>,
    settings: SearchSettings,
    generation: Arc<AtomicU64>,
    self_pubkey: Mutex<Option<String>>,
    cancel: Mutex<Option<watch::Sender<bool>>>,
    snapshot_tx: Arc<watch::Sender<SearchSnapshot>>,
}

impl SearchSession {
    pub fn new(
        registry: Arc<RelayRegistry>,
        contacts: Arc<ContactGraph>,
        profiles: Arc<ProfileCache>,
        transport: Arc<dyn RelayTransport>,
        settings: SearchSettings,
    ) -> Self {
        let (snapshot_tx, _) = watch::channel(SearchSnapshot::idle());
        Self {
            registry,
            contacts,
            profiles,
            transport,
            settings,
            generation: Arc::new(AtomicU64::new(0)),
            self_pubkey: Mutex::new(None),
            cancel: Mutex::new(None),
            snapshot_tx: Arc::new(snapshot_tx),
        }
    }

    pub fn set_user(&self, pubkey: Option<String>) {
        *self.self_pubkey.lock().unwrap() = pubkey;
    }

    pub fn subscribe(&self) -> watch::Receiver<SearchSnapshot> {
        self.snapshot_tx.subscribe()
    }

    pub fn current_generation(&self) -> u64 {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn is_searching(&self) -> bool {
        self.snapshot_tx.borrow().phase.is_live()
    }

    /// The latest ranked view without subscribing.
    pub fn current_results(&self) -> Vec<Arc<Event>> {
        self.snapshot_tx.borrow().results.clone()
    }

    /// Starts a search, superseding any search still in flight; callers never
    /// need to `stop()` first. Returns the new generation.
    pub fn start(&self, query: SearchQuery) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        if let Some(prev) = self.cancel.lock().unwrap().replace(cancel_tx) {
            let _ = prev.send(true);
        }

        let text = query.text.trim().to_string();
        if text.is_empty() {
            let _ = self.snapshot_tx.send(SearchSnapshot {
                generation,
                phase: SearchPhase::Idle,
                query: text,
                results: Vec::new(),
            });
            return generation;
        }

        let driver = Driver {
            registry: self.registry.clone(),
            contacts: self.contacts.clone(),
            profiles: self.profiles.clone(),
            transport: self.transport.clone(),
            settings: self.settings.clone(),
            session_generation: self.generation.clone(),
            snapshot_tx: self.snapshot_tx.clone(),
            generation,
            self_pubkey: self.self_pubkey.lock().unwrap().clone(),
            query: SearchQuery { text, ..query },
        };
        info!(generation, query = %driver.query.text, "starting search");
        tokio::spawn(driver.run(cancel_rx));
        generation
    }

    /// Explicit cancellation. Settles the current search immediately with
    /// whatever accumulated; idempotent and safe to call when idle.
    pub fn stop(&self) {
        if let Some(cancel) = self.cancel.lock().unwrap().take() {
            let _ = cancel.send(true);
        }
    }
}

enum FeedMsg {
    Item(Event),
    Ended(String),
}

struct Driver {
    registry: Arc<RelayRegistry>,
    contacts: Arc<ContactGraph>,
    profiles: Arc<ProfileCache>,
    transport: Arc<dyn RelayTransport>,
    settings: SearchSettings,
    session_generation: Arc<AtomicU64>,
    snapshot_tx: Arc<watch::Sender<SearchSnapshot>>,
    generation: u64,
    self_pubkey: Option<String>,
    query: SearchQuery,
}

impl Driver {
    async fn run(self, mut cancel: watch::Receiver<bool>) {
        let mut agg =
            ResultAggregator::new(self.generation, self.query.sort, self.settings.display_cap);

        let endpoints = self.registry.active_endpoints();
        if endpoints.is_empty() {
            warn!(generation = self.generation, "search has no active relays");
            self.publish(&agg, SearchPhase::NoConnectivity);
            return;
        }
        self.publish(&agg, SearchPhase::Dispatching);

        let authors = if self.query.scope_to_self {
            self.self_pubkey.clone().map(|pubkey| vec![pubkey])
        } else {
            None
        };
        let filter = Filter {
            kinds: Some(vec![KIND_TEXT_NOTE]),
            authors,
            search: Some(self.query.text.clone()),
            limit: Some(self.settings.limit),
        };

        // All endpoint streams funnel into one channel consumed here, so the
        // aggregator only ever has a single writer.
        let (feed_tx, mut feed) = mpsc::channel::<FeedMsg>(256);
        let mut closers: Vec<CloseHandle> = Vec::new();
        let mut opened = 0usize;
        for url in &endpoints {
            let handle = match self.transport.open(url, filter.clone()).await {
                Ok(h) => h,
                Err(e) => {
                    warn!(%url, "fan-out open failed: {e:#}");
                    continue;
                }
            };
            opened += 1;
            closers.push(handle.close);
            let mut updates = handle.updates;
            let feed_tx = feed_tx.clone();
            let url = url.clone();
            tokio::spawn(async move {
                loop {
                    match updates.recv().await {
                        Some(SubUpdate::Item(event)) => {
                            if feed_tx.send(FeedMsg::Item(event)).await.is_err() {
                                return;
                            }
                        }
                        Some(SubUpdate::EndOfStream) => {
                            // The stream stays open; late items still count
                            // until the driver settles.
                            if feed_tx.send(FeedMsg::Ended(url.clone())).await.is_err() {
                                return;
                            }
                        }
                        Some(SubUpdate::Failed) | None => {
                            let _ = feed_tx.send(FeedMsg::Ended(url)).await;
                            return;
                        }
                    }
                }
            });
        }
        drop(feed_tx);

        if opened == 0 {
            warn!(generation = self.generation, "no relay accepted the query");
            self.publish(&agg, SearchPhase::NoConnectivity);
            return;
        }
        let quorum = self
            .settings
            .eose_quorum
            .map(|q| q.clamp(1, opened))
            .unwrap_or(opened);

        let deadline = tokio::time::Instant::now() + self.settings.timeout;
        let mut ended: HashSet<String> = HashSet::new();
        let mut phase = SearchPhase::Dispatching;

        let outcome = loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break SearchPhase::TimedOut,
                changed = cancel.changed() => {
                    // A dropped sender means the session replaced us; either
                    // way this generation is done.
                    if changed.is_err() || *cancel.borrow() {
                        break SearchPhase::Cancelled;
                    }
                }
                msg = feed.recv() => {
                    match msg {
                        Some(FeedMsg::Item(event)) => {
                            let current = self.session_generation.load(Ordering::SeqCst);
                            if agg.ingest(event, current) {
                                if phase == SearchPhase::Dispatching {
                                    phase = SearchPhase::Streaming;
                                }
                                self.publish(&agg, phase);
                            }
                        }
                        Some(FeedMsg::Ended(url)) => {
                            ended.insert(url);
                            if ended.len() >= quorum {
                                break SearchPhase::Completed;
                            }
                        }
                        None => break SearchPhase::Completed,
                    }
                }
            }
        };

        for closer in &closers {
            closer.close();
        }

        match outcome {
            SearchPhase::Completed => {
                self.resolve_authors(&agg).await;
                info!(
                    generation = self.generation,
                    results = agg.len(),
                    "search completed"
                );
                self.publish(&agg, SearchPhase::Completed);
            }
            other => {
                info!(
                    generation = self.generation,
                    results = agg.len(),
                    phase = ?other,
                    "search settled early"
                );
                self.publish(&agg, other);
            }
        }
    }

    /// Post-completion pass: warm the profile cache for every author seen, so
    /// consumers can label results without issuing their own fetches.
    async fn resolve_authors(&self, agg: &ResultAggregator) {
        let authors = agg.authors();
        if authors.is_empty() {
            return;
        }
        debug!(
            generation = self.generation,
            count = authors.len(),
            "resolving authors"
        );
        self.profiles
            .fetch_many(authors, self.settings.profile_fetch_window)
            .await;
    }

    fn publish(&self, agg: &ResultAggregator, phase: SearchPhase) {
        // Snapshots from a superseded generation are dropped, never merged
        // into the live one.
        if self.session_generation.load(Ordering::SeqCst) != self.generation {
            return;
        }
        let results = agg.ranked(self.self_pubkey.as_deref(), &self.contacts);
        let _ = self.snapshot_tx.send(SearchSnapshot {
            generation: self.generation,
            phase,
            query: self.query.text.clone(),
            results,
        });
    }
}
