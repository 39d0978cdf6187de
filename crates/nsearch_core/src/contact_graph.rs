/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashSet;
use std::sync::RwLock;
use std::time::Duration;

use tracing::info;

use nsearch_protocol::{Filter, KIND_CONTACTS};

use crate::transport::{fetch_most_recent, RelayTransport};

/// The authenticated user's follow set, loaded once per login from their most
/// recent contact-list event. Ranking input only; never revalidated during a
/// session.
#[derive(Default)]
pub struct ContactGraph {
    follows: RwLock<HashSet<String>>,
}

impl ContactGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetches the newest contact list the user published and extracts the
    /// followed pubkeys from its `p` tags. Having no contact list is a normal
    /// state, not an error.
    pub async fn load(
        &self,
        transport: &dyn RelayTransport,
        urls: &[String],
        user_pubkey: &str,
        timeout: Duration,
    ) {
        let filter = Filter {
            kinds: Some(vec![KIND_CONTACTS]),
            authors: Some(vec![user_pubkey.to_string()]),
            limit: Some(1),
            ..Default::default()
        };
        match fetch_most_recent(transport, urls, filter, timeout).await {
            Some(event) => {
                let follows: HashSet<String> =
                    event.tag_values("p").map(|pk| pk.to_string()).collect();
                info!("loaded {} followed keys", follows.len());
                self.replace(follows);
            }
            None => {
                info!("no contact list found");
                self.clear();
            }
        }
    }

    pub fn replace(&self, follows: HashSet<String>) {
        *self.follows.write().unwrap() = follows;
    }

    pub fn contains(&self, pubkey: &str) -> bool {
        self.follows.read().unwrap().contains(pubkey)
    }

    pub fn len(&self) -> usize {
        self.follows.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.follows.read().unwrap().is_empty()
    }

    pub fn clear(&self) {
        self.follows.write().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::testing::{ScriptStep, ScriptedTransport};
    use nsearch_protocol::Event;

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

    #[tokio::test(start_paused = true)]
    async fn loads_follows_from_newest_contact_list() {
        let transport = ScriptedTransport::new();
        transport.script(
            "wss://a.example",
            vec![
                ScriptStep::Item(contact_list(100, &["stale"])),
                ScriptStep::Eose,
            ],
        );
        transport.script(
            "wss://b.example",
            vec![
                ScriptStep::Item(contact_list(200, &["alice", "bob"])),
                ScriptStep::Eose,
            ],
        );

        let graph = ContactGraph::new();
        graph
            .load(
                &transport,
                &["wss://a.example".to_string(), "wss://b.example".to_string()],
                "me",
                Duration::from_secs(5),
            )
            .await;

        assert_eq!(graph.len(), 2);
        assert!(graph.contains("alice"));
        assert!(!graph.contains("stale"));
    }

    #[tokio::test(start_paused = true)]
    async fn missing_contact_list_yields_empty_set() {
        let transport = ScriptedTransport::new();
        let graph = ContactGraph::new();
        graph.replace(["old".to_string()].into_iter().collect());
        graph
            .load(
                &transport,
                &["wss://a.example".to_string()],
                "me",
                Duration::from_secs(5),
            )
            .await;
        assert!(graph.is_empty());
    }
}
