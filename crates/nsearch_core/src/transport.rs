/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite;
use tracing::{debug, warn};

use nsearch_protocol::{ClientMessage, Event, Filter, RelayMessage};

use crate::relay_registry::{RelayConnState, RelayRegistry};

/// One update on a relay subscription stream.
#[derive(Debug)]
pub enum SubUpdate {
    Item(Event),
    /// The relay reported end-of-stored-results. The subscription stays open;
    /// items may still trail in until the handle is closed.
    EndOfStream,
    /// The endpoint could not be reached or dropped before end-of-stream.
    Failed,
}

/// Closes the subscription task when flipped or dropped.
pub struct CloseHandle(watch::Sender<bool>);

impl CloseHandle {
    pub fn close(&self) {
        let _ = self.0.send(true);
    }
}

pub struct SubHandle {
    pub updates: mpsc::Receiver<SubUpdate>,
    pub close: CloseHandle,
}

impl SubHandle {
    pub async fn next(&mut self) -> Option<SubUpdate> {
        self.updates.recv().await
    }
}

/// Capability to open a filtered query against one named endpoint and stream
/// back matching items plus an end-of-stream signal. The engine never talks
/// to the network except through this seam.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    async fn open(&self, url: &str, filter: Filter) -> Result<SubHandle>;
}

/// Production transport: one websocket per subscription, torn down with the
/// handle. Connection transitions are reported into the relay registry.
pub struct WsTransport {
    registry: Arc<RelayRegistry>,
    sub_seq: AtomicU64,
}

impl WsTransport {
    pub fn new(registry: Arc<RelayRegistry>) -> Self {
        Self {
            registry,
            sub_seq: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl RelayTransport for WsTransport {
    async fn open(&self, url: &str, filter: Filter) -> Result<SubHandle> {
        let sub_id = format!("nsearch-{}", self.sub_seq.fetch_add(1, Ordering::Relaxed));
        let (update_tx, updates) = mpsc::channel(64);
        let (close_tx, close_rx) = watch::channel(false);
        let registry = self.registry.clone();
        let url = url.to_string();
        tokio::spawn(async move {
            run_subscription(registry, url, sub_id, filter, update_tx, close_rx).await;
        });
        Ok(SubHandle {
            updates,
            close: CloseHandle(close_tx),
        })
    }
}

async fn run_subscription(
    registry: Arc<RelayRegistry>,
    url: String,
    sub_id: String,
    filter: Filter,
    updates: mpsc::Sender<SubUpdate>,
    mut close: watch::Receiver<bool>,
) {
    registry.update_conn_state(&url, RelayConnState::Connecting);
    let (ws, _) = match tokio_tungstenite::connect_async(url.as_str()).await {
        Ok(v) => v,
        Err(e) => {
            warn!(%url, "relay dial failed: {e}");
            registry.update_conn_state(&url, RelayConnState::Failed);
            let _ = updates.send(SubUpdate::Failed).await;
            return;
        }
    };
    registry.update_conn_state(&url, RelayConnState::Connected);
    let (mut ws_tx, mut ws_rx) = ws.split();

    let req = ClientMessage::Req {
        sub_id: sub_id.clone(),
        filter,
    };
    let subscribed = match req.to_json() {
        Ok(json) => ws_tx.send(tungstenite::Message::Text(json)).await.is_ok(),
        Err(e) => {
            warn!(%url, "bad subscribe frame: {e:#}");
            false
        }
    };
    if !subscribed {
        registry.update_conn_state(&url, RelayConnState::Failed);
        let _ = updates.send(SubUpdate::Failed).await;
        return;
    }

    let mut ping = tokio::time::interval(Duration::from_secs(30));
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    let mut saw_eose = false;
    loop {
        tokio::select! {
            changed = close.changed() => {
                if changed.is_err() || *close.borrow() {
                    // Tell the relay before hanging up so it frees the REQ slot.
                    if let Ok(json) = (ClientMessage::Close { sub_id: sub_id.clone() }).to_json() {
                        let _ = ws_tx.send(tungstenite::Message::Text(json)).await;
                    }
                    let _ = ws_tx.send(tungstenite::Message::Close(None)).await;
                    break;
                }
            }
            _ = ping.tick() => {
                if ws_tx.send(tungstenite::Message::Ping(Vec::new())).await.is_err() {
                    if !saw_eose {
                        let _ = updates.send(SubUpdate::Failed).await;
                    }
                    break;
                }
            }
            msg = ws_rx.next() => {
                let Some(Ok(msg)) = msg else {
                    if !saw_eose {
                        let _ = updates.send(SubUpdate::Failed).await;
                    }
                    break;
                };
                let text = match msg {
                    tungstenite::Message::Text(t) => t,
                    tungstenite::Message::Ping(p) => {
                        let _ = ws_tx.send(tungstenite::Message::Pong(p)).await;
                        continue;
                    }
                    tungstenite::Message::Close(_) => {
                        if !saw_eose {
                            let _ = updates.send(SubUpdate::Failed).await;
                        }
                        break;
                    }
                    _ => continue,
                };
                match RelayMessage::parse(&text) {
                    Ok(RelayMessage::Event { sub_id: sid, event }) if sid == sub_id => {
                        if updates.send(SubUpdate::Item(event)).await.is_err() {
                            break;
                        }
                    }
                    Ok(RelayMessage::Eose { sub_id: sid }) if sid == sub_id => {
                        saw_eose = true;
                        if updates.send(SubUpdate::EndOfStream).await.is_err() {
                            break;
                        }
                    }
                    Ok(RelayMessage::Closed { sub_id: sid, message }) if sid == sub_id => {
                        debug!(%url, %message, "relay closed subscription");
                        if !saw_eose {
                            let _ = updates.send(SubUpdate::EndOfStream).await;
                        }
                        break;
                    }
                    Ok(RelayMessage::Notice { message }) => {
                        debug!(%url, %message, "relay notice");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        debug!(%url, "unparsed relay frame: {e:#}");
                    }
                }
            }
        }
    }
    registry.update_conn_state(&url, RelayConnState::Disconnected);
}

enum LookupMsg {
    Item(Event),
    Done,
}

/// Fans a one-shot lookup out to `urls` and returns the newest matching event
/// by `created_at`, or `None` if nothing arrives before every stream ends or
/// the timeout fires. Used for contact-list, relay-list, and profile lookups.
pub async fn fetch_most_recent(
    transport: &dyn RelayTransport,
    urls: &[String],
    filter: Filter,
    timeout: Duration,
) -> Option<Event> {
    let (tx, mut rx) = mpsc::channel::<LookupMsg>(64);
    let mut open = 0usize;
    for url in urls {
        let mut handle = match transport.open(url, filter.clone()).await {
            Ok(h) => h,
            Err(e) => {
                debug!(%url, "lookup open failed: {e:#}");
                continue;
            }
        };
        open += 1;
        let tx = tx.clone();
        tokio::spawn(async move {
            loop {
                match handle.next().await {
                    Some(SubUpdate::Item(event)) => {
                        if tx.send(LookupMsg::Item(event)).await.is_err() {
                            break;
                        }
                    }
                    Some(SubUpdate::EndOfStream) | Some(SubUpdate::Failed) | None => {
                        let _ = tx.send(LookupMsg::Done).await;
                        break;
                    }
                }
            }
            handle.close.close();
        });
    }
    drop(tx);
    if open == 0 {
        return None;
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut best: Option<Event> = None;
    loop {
        let msg = tokio::select! {
            _ = tokio::time::sleep_until(deadline) => break,
            msg = rx.recv() => msg,
        };
        match msg {
            Some(LookupMsg::Item(event)) => {
                if best
                    .as_ref()
                    .map(|b| event.created_at > b.created_at)
                    .unwrap_or(true)
                {
                    best = Some(event);
                }
            }
            Some(LookupMsg::Done) => {
                open -= 1;
                if open == 0 {
                    break;
                }
            }
            None => break,
        }
    }
    best
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::HashMap;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    pub(crate) fn test_event(id: &str, pubkey: &str, created_at: i64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind: nsearch_protocol::KIND_TEXT_NOTE,
            tags: Vec::new(),
            content: format!("note {id}"),
            sig: String::new(),
        }
    }

    #[derive(Debug, Clone)]
    pub(crate) enum ScriptStep {
        Wait(Duration),
        Item(Event),
        Eose,
        Fail,
    }

    /// Scripted in-memory transport. Each `open` against a URL pops the next
    /// script queued for it; with no script the stream ends immediately. A
    /// finished script leaves the subscription open until closed, mirroring a
    /// real relay after EOSE.
    #[derive(Default)]
    pub(crate) struct ScriptedTransport {
        scripts: Mutex<HashMap<String, VecDeque<Vec<ScriptStep>>>>,
        opened: Mutex<Vec<(String, Filter)>>,
    }

    impl ScriptedTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn script(&self, url: &str, steps: Vec<ScriptStep>) {
            self.scripts
                .lock()
                .unwrap()
                .entry(url.to_string())
                .or_default()
                .push_back(steps);
        }

        pub(crate) fn opened(&self) -> Vec<(String, Filter)> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RelayTransport for ScriptedTransport {
        async fn open(&self, url: &str, filter: Filter) -> Result<SubHandle> {
            self.opened
                .lock()
                .unwrap()
                .push((url.to_string(), filter));
            let steps = self
                .scripts
                .lock()
                .unwrap()
                .get_mut(url)
                .and_then(|q| q.pop_front())
                .unwrap_or_else(|| vec![ScriptStep::Eose]);

            let (tx, updates) = mpsc::channel(64);
            let (close_tx, mut close_rx) = watch::channel(false);
            tokio::spawn(async move {
                for step in steps {
                    match step {
                        ScriptStep::Wait(d) => {
                            tokio::select! {
                                _ = tokio::time::sleep(d) => {}
                                _ = close_rx.changed() => return,
                            }
                        }
                        ScriptStep::Item(event) => {
                            if tx.send(SubUpdate::Item(event)).await.is_err() {
                                return;
                            }
                        }
                        ScriptStep::Eose => {
                            if tx.send(SubUpdate::EndOfStream).await.is_err() {
                                return;
                            }
                        }
                        ScriptStep::Fail => {
                            let _ = tx.send(SubUpdate::Failed).await;
                            return;
                        }
                    }
                }
                let _ = close_rx.changed().await;
            });
            Ok(SubHandle {
                updates,
                close: CloseHandle(close_tx),
            })
        }
    }
}
