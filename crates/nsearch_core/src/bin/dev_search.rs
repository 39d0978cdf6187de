/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::Arc;

use nsearch_core::aggregator::SortMode;
use nsearch_core::profile_cache::CacheLookup;
use nsearch_core::runtime::{ClientConfig, SearchClient};
use nsearch_core::search::SearchQuery;
use nsearch_core::signer::StaticSigner;
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("info".parse().unwrap()),
        )
        .init();

    let pubkey = std::env::var("NSEARCH_PUBKEY").unwrap_or_default();
    let text = std::env::var("NSEARCH_QUERY").unwrap_or_else(|_| "nostr".to_string());
    let sort = match std::env::var("NSEARCH_SORT").as_deref() {
        Ok("oldest") => SortMode::Oldest,
        _ => SortMode::Recent,
    };
    let scope_to_self = std::env::var("NSEARCH_ONLY_MINE").as_deref() == Ok("1");

    let mut cfg = ClientConfig::default();
    if let Ok(relays) = std::env::var("NSEARCH_RELAYS") {
        cfg.default_relays = relays
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }

    let client = SearchClient::with_websockets(cfg, Arc::new(StaticSigner::new(pubkey.clone())));
    if !pubkey.is_empty() {
        let user = client.login().await?;
        info!(%user, "logged in");
    }

    let mut snapshots = client.search_snapshots();
    let generation = client.search(SearchQuery {
        text: text.clone(),
        sort,
        scope_to_self,
    });
    info!(%text, generation, "search dispatched");

    loop {
        snapshots.changed().await?;
        let snap = snapshots.borrow().clone();
        if snap.generation != generation {
            continue;
        }
        if !snap.phase.is_terminal() {
            info!(results = snap.results.len(), "streaming");
            continue;
        }
        info!(phase = ?snap.phase, results = snap.results.len(), "search settled");
        for event in &snap.results {
            let author = match client.get_profile(&event.pubkey).await {
                CacheLookup::Found(record) => record
                    .label()
                    .map(|l| l.to_string())
                    .unwrap_or_else(|| short_key(&event.pubkey)),
                CacheLookup::Missing => short_key(&event.pubkey),
            };
            println!("[{}] {}: {}", event.created_at, author, first_line(&event.content));
        }
        break;
    }

    for relay in client.relay_statuses() {
        info!(url = %relay.url, state = ?relay.state, preferred = relay.user_preferred, "relay");
    }
    Ok(())
}

fn short_key(pubkey: &str) -> String {
    if pubkey.len() <= 12 {
        return pubkey.to_string();
    }
    format!("{}...{}", &pubkey[..8], &pubkey[pubkey.len() - 4..])
}

fn first_line(content: &str) -> &str {
    content.lines().next().unwrap_or_default()
}
