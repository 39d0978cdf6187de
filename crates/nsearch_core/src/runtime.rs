/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::sync::watch;
use tracing::{info, warn};

use nsearch_protocol::{Filter, ProfileMetadata, KIND_METADATA, KIND_RELAY_LIST};

use crate::aggregator::SortMode;
use crate::contact_graph::ContactGraph;
use crate::profile_cache::{CacheLookup, MetadataLookup, ProfileCache, ProfileRecord};
use crate::relay_registry::{RelayEndpoint, RelayRegistry};
use crate::search::{SearchQuery, SearchSession, SearchSettings, SearchSnapshot};
use crate::signer::Signer;
use crate::transport::{fetch_most_recent, RelayTransport, WsTransport};

/// Fallback relay set used until a user-published relay list is adopted.
pub const DEFAULT_RELAYS: &[&str] = &[
    "wss://relay.nostr.band",
    "wss://relay.nostrcheck.me",
    "wss://relay.noswhere.com",
    "wss://bnc.netsec.vip",
    "wss://relay.snort.social",
    "wss://relay.damus.io",
    "wss://relay.primal.net",
];

/// Relays that index profile and relay-list events for most of the network.
pub const OUTBOX_RELAYS: &[&str] = &["wss://purplepag.es", "wss://relay.primal.net"];

fn default_relays() -> Vec<String> {
    DEFAULT_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn default_outbox_relays() -> Vec<String> {
    OUTBOX_RELAYS.iter().map(|s| s.to_string()).collect()
}

fn default_search_timeout_secs() -> u64 {
    10
}

fn default_search_limit() -> u32 {
    100
}

fn default_profile_fetch_window() -> usize {
    20
}

fn default_profile_cache_capacity() -> usize {
    512
}

fn default_display_cap() -> usize {
    420
}

fn default_lookup_timeout_secs() -> u64 {
    5
}

#[derive(Clone, Debug, serde::Deserialize)]
pub struct ClientConfig {
    #[serde(default = "default_relays")]
    pub default_relays: Vec<String>,
    #[serde(default = "default_outbox_relays")]
    pub outbox_relays: Vec<String>,
    #[serde(default = "default_search_timeout_secs")]
    pub search_timeout_secs: u64,
    #[serde(default = "default_search_limit")]
    pub search_limit: u32,
    /// End-of-stream quorum for natural completion; unset means every
    /// endpoint that opened.
    #[serde(default)]
    pub eose_quorum: Option<usize>,
    #[serde(default = "default_profile_fetch_window")]
    pub profile_fetch_window: usize,
    #[serde(default = "default_profile_cache_capacity")]
    pub profile_cache_capacity: usize,
    #[serde(default = "default_display_cap")]
    pub display_cap: usize,
    /// Deadline for one-shot lookups (contact list, relay list, profiles).
    #[serde(default = "default_lookup_timeout_secs")]
    pub lookup_timeout_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_relays: default_relays(),
            outbox_relays: default_outbox_relays(),
            search_timeout_secs: default_search_timeout_secs(),
            search_limit: default_search_limit(),
            eose_quorum: None,
            profile_fetch_window: default_profile_fetch_window(),
            profile_cache_capacity: default_profile_cache_capacity(),
            display_cap: default_display_cap(),
            lookup_timeout_secs: default_lookup_timeout_secs(),
        }
    }
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Resolves kind-0 metadata through the outbox relays first, then whatever
/// the registry is currently using.
struct RelayMetadataLookup {
    transport: Arc<dyn RelayTransport>,
    registry: Arc<RelayRegistry>,
    outbox: Vec<String>,
    timeout: Duration,
}

#[async_trait]
impl MetadataLookup for RelayMetadataLookup {
    async fn lookup(&self, pubkey: &str) -> Result<Option<ProfileRecord>> {
        let mut urls = self.outbox.clone();
        for url in self.registry.active_endpoints() {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        let filter = Filter {
            kinds: Some(vec![KIND_METADATA]),
            authors: Some(vec![pubkey.to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        let Some(event) =
            fetch_most_recent(self.transport.as_ref(), &urls, filter, self.timeout).await
        else {
            return Ok(None);
        };
        // Unparseable content still counts as a profile sighting; the record
        // just carries no fields.
        let meta = ProfileMetadata::from_content(&event.content).unwrap_or_default();
        Ok(Some(ProfileRecord {
            pubkey: pubkey.to_string(),
            name: meta.name,
            display_name: meta.display_name,
            picture: meta.picture,
            nip05: meta.nip05,
            fetched_at: now_secs(),
        }))
    }
}

/// The engine's service handle: one per login lifecycle, constructed
/// explicitly and torn down with `logout`. The registry, profile cache, and
/// contact graph it owns are shared across every search started through it.
pub struct SearchClient {
    cfg: ClientConfig,
    signer: Arc<dyn Signer>,
    transport: Arc<dyn RelayTransport>,
    registry: Arc<RelayRegistry>,
    contacts: Arc<ContactGraph>,
    profiles: Arc<ProfileCache>,
    session: SearchSession,
    user_pubkey: Mutex<Option<String>>,
    raw_relay_list: Mutex<Option<String>>,
}

impl SearchClient {
    /// Production wiring: websocket transport reporting into the registry.
    pub fn with_websockets(cfg: ClientConfig, signer: Arc<dyn Signer>) -> Self {
        let registry = Arc::new(RelayRegistry::new());
        let transport = Arc::new(WsTransport::new(registry.clone()));
        Self::assemble(cfg, signer, registry, transport)
    }

    /// Wiring with a caller-supplied transport (tests, alternative stacks).
    pub fn new(
        cfg: ClientConfig,
        signer: Arc<dyn Signer>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        Self::assemble(cfg, signer, Arc::new(RelayRegistry::new()), transport)
    }

    fn assemble(
        cfg: ClientConfig,
        signer: Arc<dyn Signer>,
        registry: Arc<RelayRegistry>,
        transport: Arc<dyn RelayTransport>,
    ) -> Self {
        registry.bootstrap_defaults(&cfg.default_relays);
        let lookup = Arc::new(RelayMetadataLookup {
            transport: transport.clone(),
            registry: registry.clone(),
            outbox: cfg.outbox_relays.clone(),
            timeout: Duration::from_secs(cfg.lookup_timeout_secs),
        });
        let profiles = Arc::new(ProfileCache::new(cfg.profile_cache_capacity, lookup));
        let contacts = Arc::new(ContactGraph::new());
        let session = SearchSession::new(
            registry.clone(),
            contacts.clone(),
            profiles.clone(),
            transport.clone(),
            SearchSettings {
                timeout: Duration::from_secs(cfg.search_timeout_secs),
                limit: cfg.search_limit,
                eose_quorum: cfg.eose_quorum,
                display_cap: cfg.display_cap,
                profile_fetch_window: cfg.profile_fetch_window,
            },
        );
        Self {
            cfg,
            signer,
            transport,
            registry,
            contacts,
            profiles,
            session,
            user_pubkey: Mutex::new(None),
            raw_relay_list: Mutex::new(None),
        }
    }

    /// Resolves the current user, adopts their published relay list if one
    /// exists, and loads their follow set. Relay-list failures degrade to the
    /// default set; they are never fatal.
    pub async fn login(&self) -> Result<String> {
        let pubkey = self
            .signer
            .pubkey()
            .await
            .context("signer has no current user")?;
        *self.user_pubkey.lock().unwrap() = Some(pubkey.clone());
        self.session.set_user(Some(pubkey.clone()));

        self.adopt_user_relays(&pubkey).await;
        let urls = self.registry.active_endpoints();
        self.contacts
            .load(
                self.transport.as_ref(),
                &urls,
                &pubkey,
                self.lookup_timeout(),
            )
            .await;
        info!(%pubkey, preferred = self.registry.is_preferred(), "login complete");
        Ok(pubkey)
    }

    /// Tears the login down: stops any search, clears the follow set and
    /// profile cache, and falls back to the default relay set.
    pub async fn logout(&self) {
        self.session.stop();
        self.session.set_user(None);
        *self.user_pubkey.lock().unwrap() = None;
        *self.raw_relay_list.lock().unwrap() = None;
        self.contacts.clear();
        self.profiles.clear().await;
        self.registry.bootstrap_defaults(&self.cfg.default_relays);
        info!("logged out");
    }

    pub fn search(&self, query: SearchQuery) -> u64 {
        self.session.start(query)
    }

    pub fn search_with_defaults(&self, text: &str) -> u64 {
        self.session.start(SearchQuery {
            text: text.to_string(),
            sort: SortMode::Recent,
            scope_to_self: false,
        })
    }

    pub fn stop_search(&self) {
        self.session.stop()
    }

    pub async fn get_profile(&self, pubkey: &str) -> CacheLookup {
        self.profiles.get(pubkey).await
    }

    pub fn search_snapshots(&self) -> watch::Receiver<SearchSnapshot> {
        self.session.subscribe()
    }

    pub fn is_searching(&self) -> bool {
        self.session.is_searching()
    }

    pub fn current_results(&self) -> Vec<Arc<nsearch_protocol::Event>> {
        self.session.current_results()
    }

    pub fn relay_statuses(&self) -> Vec<RelayEndpoint> {
        self.registry.snapshot()
    }

    pub fn is_using_preferred_relays(&self) -> bool {
        self.registry.is_preferred()
    }

    /// Raw JSON of the adopted relay-list event, kept for diagnostics.
    pub fn raw_relay_list(&self) -> Option<String> {
        self.raw_relay_list.lock().unwrap().clone()
    }

    pub fn user_pubkey(&self) -> Option<String> {
        self.user_pubkey.lock().unwrap().clone()
    }

    fn lookup_timeout(&self) -> Duration {
        Duration::from_secs(self.cfg.lookup_timeout_secs)
    }

    async fn adopt_user_relays(&self, pubkey: &str) {
        let mut urls = self.cfg.outbox_relays.clone();
        for url in self.registry.active_endpoints() {
            if !urls.contains(&url) {
                urls.push(url);
            }
        }
        let filter = Filter {
            kinds: Some(vec![KIND_RELAY_LIST]),
            authors: Some(vec![pubkey.to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        match fetch_most_recent(self.transport.as_ref(), &urls, filter, self.lookup_timeout())
            .await
        {
            Some(event) => {
                *self.raw_relay_list.lock().unwrap() =
                    serde_json::to_string_pretty(&event).ok();
                let preferred: Vec<String> = event
                    .tag_values("r")
                    .filter(|url| url.starts_with("wss://"))
                    .map(|url| url.to_string())
                    .collect();
                if preferred.is_empty() {
                    warn!("relay list has no usable wss entries, staying on defaults");
                    return;
                }
                info!(count = preferred.len(), "adopting preferred relays");
                self.registry.replace_with_preferred(&preferred);
            }
            None => {
                warn!("no relay list found, staying on defaults");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::search::SearchPhase;
    use crate::signer::StaticSigner;
    use crate::transport::testing::{test_event, ScriptStep, ScriptedTransport};
    use nsearch_protocol::{Event, KIND_CONTACTS};

    fn relay_list(created_at: i64, relays: &[&str]) -> Event {
        Event {
            id: format!("rl-{created_at}"),
            pubkey: "me".to_string(),
            created_at,
            kind: KIND_RELAY_LIST,
            tags: relays
                .iter()
                .map(|url| vec!["r".to_string(), url.to_string()])
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    fn contact_list(created_at: i64, follows: &[&str]) -> Event {
        Event {
            id: format!("cl-{created_at}"),
            pubkey: "me".to_string(),
            created_at,
            kind: KIND_CONTACTS,
            tags: follows
                .iter()
                .map(|pk| vec!["p".to_string(), pk.to_string()])
                .collect(),
            content: String::new(),
            sig: String::new(),
        }
    }

    fn small_config() -> ClientConfig {
        ClientConfig {
            default_relays: vec!["wss://default.example".to_string()],
            outbox_relays: vec!["wss://outbox.example".to_string()],
            lookup_timeout_secs: 2,
            ..Default::default()
        }
    }

    fn client(transport: Arc<ScriptedTransport>) -> SearchClient {
        SearchClient::new(
            small_config(),
            Arc::new(StaticSigner::new("me")),
            transport,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn login_adopts_preferred_relays_and_follows() {
        let transport = Arc::new(ScriptedTransport::new());
        // Relay-list lookup hits the outbox first.
        transport.script(
            "wss://outbox.example",
            vec![
                ScriptStep::Item(relay_list(100, &["wss://mine.example/", "http://ftp.example"])),
                ScriptStep::Eose,
            ],
        );
        // Contact-list lookup then runs against the adopted set.
        transport.script(
            "wss://mine.example",
            vec![
                ScriptStep::Item(contact_list(50, &["alice"])),
                ScriptStep::Eose,
            ],
        );

        let client = client(transport);
        let pubkey = client.login().await.unwrap();
        assert_eq!(pubkey, "me");
        assert!(client.is_using_preferred_relays());
        assert_eq!(
            client
                .relay_statuses()
                .iter()
                .map(|e| e.url.clone())
                .collect::<Vec<_>>(),
            vec!["wss://mine.example".to_string()]
        );
        assert!(client.raw_relay_list().unwrap().contains("rl-100"));
        assert!(client.contacts.contains("alice"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_relay_list_keeps_defaults() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(transport);
        client.login().await.unwrap();
        assert!(!client.is_using_preferred_relays());
        assert_eq!(
            client.registry.active_endpoints(),
            vec!["wss://default.example".to_string()]
        );
        assert!(client.raw_relay_list().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn logout_resets_shared_state() {
        let transport = Arc::new(ScriptedTransport::new());
        transport.script(
            "wss://outbox.example",
            vec![
                ScriptStep::Item(relay_list(100, &["wss://mine.example"])),
                ScriptStep::Eose,
            ],
        );
        transport.script(
            "wss://mine.example",
            vec![
                ScriptStep::Item(contact_list(50, &["alice"])),
                ScriptStep::Eose,
            ],
        );

        let client = client(transport);
        client.login().await.unwrap();
        assert!(client.is_using_preferred_relays());

        client.logout().await;
        assert!(!client.is_using_preferred_relays());
        assert!(client.contacts.is_empty());
        assert!(client.user_pubkey().is_none());
        assert_eq!(client.profiles.len().await, 0);
        assert_eq!(
            client.registry.active_endpoints(),
            vec!["wss://default.example".to_string()]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn end_to_end_search_through_client() {
        let transport = Arc::new(ScriptedTransport::new());
        let client = client(transport.clone());
        client.login().await.unwrap();

        transport.script(
            "wss://default.example",
            vec![
                ScriptStep::Item(test_event("e1", "alice", 100)),
                ScriptStep::Eose,
            ],
        );
        // The completion pass resolves alice through the outbox.
        let mut profile = test_event("p1", "alice", 10);
        profile.kind = KIND_METADATA;
        profile.content = r#"{"name":"alice","display_name":"Alice"}"#.to_string();
        transport.script(
            "wss://outbox.example",
            vec![ScriptStep::Item(profile), ScriptStep::Eose],
        );

        let mut rx = client.search_snapshots();
        let generation = client.search_with_defaults("hello");
        loop {
            {
                let snap = rx.borrow();
                if snap.generation == generation && snap.phase.is_terminal() {
                    assert_eq!(snap.phase, SearchPhase::Completed);
                    assert_eq!(snap.results.len(), 1);
                    break;
                }
            }
            rx.changed().await.unwrap();
        }

        match client.get_profile("alice").await {
            CacheLookup::Found(record) => assert_eq!(record.label(), Some("Alice")),
            CacheLookup::Missing => panic!("profile should be cached by the completion pass"),
        }
    }
}
