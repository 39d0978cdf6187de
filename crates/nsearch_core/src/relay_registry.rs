/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Mutex;

use serde::Serialize;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RelayConnState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RelayEndpoint {
    pub url: String,
    pub state: RelayConnState,
    pub user_preferred: bool,
}

/// Canonical form used as the registry key: trimmed, trailing slashes
/// stripped, scheme and host lowercased. Path case is preserved.
pub fn normalize_relay_url(url: &str) -> String {
    let url = url.trim().trim_end_matches('/');
    let Some((scheme, rest)) = url.split_once("://") else {
        return url.to_string();
    };
    let (host, path) = match rest.split_once('/') {
        Some((host, path)) => (host, Some(path)),
        None => (rest, None),
    };
    let mut out = format!(
        "{}://{}",
        scheme.to_ascii_lowercase(),
        host.to_ascii_lowercase()
    );
    if let Some(path) = path {
        out.push('/');
        out.push_str(path);
    }
    out
}

#[derive(Default)]
struct RegistryInner {
    endpoints: Vec<RelayEndpoint>,
    preferred: bool,
}

/// Tracks the relays a session queries and their connection state. Shared
/// across searches within one login; reset to the default set on logout.
#[derive(Default)]
pub struct RelayRegistry {
    inner: Mutex<RegistryInner>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds (or re-seeds, on logout) the registry with the fallback set.
    pub fn bootstrap_defaults(&self, urls: &[String]) {
        let mut inner = self.inner.lock().unwrap();
        inner.preferred = false;
        inner.endpoints.clear();
        for url in urls {
            let url = normalize_relay_url(url);
            if inner.endpoints.iter().any(|e| e.url == url) {
                continue;
            }
            inner.endpoints.push(RelayEndpoint {
                url,
                state: RelayConnState::Connecting,
                user_preferred: false,
            });
        }
    }

    /// Wholesale replacement with a user-published relay list. Connection
    /// state carries over for URLs already tracked. An empty list keeps the
    /// defaults and clears the preferred flag.
    pub fn replace_with_preferred(&self, urls: &[String]) {
        let mut normalized: Vec<String> = Vec::new();
        for url in urls {
            let url = normalize_relay_url(url);
            if !url.is_empty() && !normalized.contains(&url) {
                normalized.push(url);
            }
        }

        let mut inner = self.inner.lock().unwrap();
        if normalized.is_empty() {
            inner.preferred = false;
            return;
        }
        let old = std::mem::take(&mut inner.endpoints);
        inner.endpoints = normalized
            .into_iter()
            .map(|url| {
                let state = old
                    .iter()
                    .find(|e| e.url == url)
                    .map(|e| e.state)
                    .unwrap_or(RelayConnState::Connecting);
                RelayEndpoint {
                    url,
                    state,
                    user_preferred: true,
                }
            })
            .collect();
        inner.preferred = true;
    }

    /// Updates the state of a known endpoint. Unknown URLs are appended only
    /// while running on the default set; a curated preferred list does not
    /// grow from incidental discovery.
    pub fn update_conn_state(&self, url: &str, state: RelayConnState) {
        let url = normalize_relay_url(url);
        let mut inner = self.inner.lock().unwrap();
        if let Some(endpoint) = inner.endpoints.iter_mut().find(|e| e.url == url) {
            endpoint.state = state;
            return;
        }
        if inner.preferred {
            debug!(%url, "ignoring state update for relay outside the preferred set");
            return;
        }
        inner.endpoints.push(RelayEndpoint {
            url,
            state,
            user_preferred: false,
        });
    }

    /// Current ordered endpoint URLs, the fan-out set for a search.
    pub fn active_endpoints(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .endpoints
            .iter()
            .map(|e| e.url.clone())
            .collect()
    }

    pub fn snapshot(&self) -> Vec<RelayEndpoint> {
        self.inner.lock().unwrap().endpoints.clone()
    }

    pub fn is_preferred(&self) -> bool {
        self.inner.lock().unwrap().preferred
    }
}
