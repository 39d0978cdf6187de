/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use nsearch_protocol::Event;

use crate::contact_graph::ContactGraph;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortMode {
    Recent,
    Oldest,
}

/// Working set for one search generation: dedup by event id in arrival
/// order, re-ranked on demand. Owned by the session driver task, so all
/// mutation is single-writer by construction.
pub struct ResultAggregator {
    generation: u64,
    sort: SortMode,
    display_cap: usize,
    seen: HashSet<String>,
    items: Vec<Arc<Event>>,
}

impl ResultAggregator {
    pub fn new(generation: u64, sort: SortMode, display_cap: usize) -> Self {
        Self {
            generation,
            sort,
            display_cap: display_cap.max(1),
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// First-seen wins: a later duplicate of the same id from another relay
    /// is dropped, not merged. Items attributed to any other generation are
    /// dropped unconditionally.
    pub fn ingest(&mut self, event: Event, generation: u64) -> bool {
        if generation != self.generation {
            return false;
        }
        if !self.seen.insert(event.id.clone()) {
            return false;
        }
        self.items.push(Arc::new(event));
        true
    }

    /// Unique author keys in arrival order, for the profile resolution pass.
    pub fn authors(&self) -> Vec<String> {
        let mut seen = HashSet::new();
        self.items
            .iter()
            .filter(|event| seen.insert(event.pubkey.clone()))
            .map(|event| event.pubkey.clone())
            .collect()
    }

    /// Ranked view: self-authored first, then followed authors, then everyone
    /// else; within a tier by `created_at` per the sort mode. The sort is
    /// stable, so exact ties keep arrival order and live updates don't
    /// shuffle. Output is truncated to the display cap; the dedup table keeps
    /// everything.
    pub fn ranked(&self, self_pubkey: Option<&str>, contacts: &ContactGraph) -> Vec<Arc<Event>> {
        let mut out = self.items.clone();
        out.sort_by(|a, b| {
            tier(a, self_pubkey, contacts)
                .cmp(&tier(b, self_pubkey, contacts))
                .then_with(|| match self.sort {
                    SortMode::Recent => b.created_at.cmp(&a.created_at),
                    SortMode::Oldest => a.created_at.cmp(&b.created_at),
                })
        });
        out.truncate(self.display_cap);
        out
    }
}

fn tier(event: &Event, self_pubkey: Option<&str>, contacts: &ContactGraph) -> u8 {
    if self_pubkey.is_some_and(|pk| pk == event.pubkey) {
        return 0;
    }
    if contacts.contains(&event.pubkey) {
        return 1;
    }
    2
}
