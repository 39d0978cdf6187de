/*
 * SPDX-FileCopyrightText: 2026 RedHunt07 - NSEARCH Project
 * SPDX-License-Identifier: AGPL-3.0-only
 */

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};

pub const KIND_METADATA: u32 = 0;
pub const KIND_TEXT_NOTE: u32 = 1;
pub const KIND_CONTACTS: u32 = 3;
pub const KIND_RELAY_LIST: u32 = 10002;

/// A signed Nostr event as it appears on the wire (NIP-01). Field names must
/// stay exactly as relays emit them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: i64,
    pub kind: u32,
    #[serde(default)]
    pub tags: Vec<Vec<String>>,
    pub content: String,
    #[serde(default)]
    pub sig: String,
}

impl Event {
    /// Values of tags named `name`, e.g. `tag_values("p")` yields the pubkeys
    /// of a contact list.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |tag| tag.first().map(|n| n == name).unwrap_or(false))
            .filter_map(|tag| tag.get(1).map(|v| v.as_str()))
    }
}

/// Subscription filter. Optional fields are omitted from the serialized form
/// entirely; relays reject or misread explicit nulls. `search` is the NIP-50
/// full-text field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kinds: Option<Vec<u32>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub limit: Option<u32>,
}

/// Client-to-relay frames.
#[derive(Debug, Clone)]
pub enum ClientMessage {
    Req { sub_id: String, filter: Filter },
    Close { sub_id: String },
}

impl ClientMessage {
    pub fn to_json(&self) -> Result<String> {
        let json = match self {
            ClientMessage::Req { sub_id, filter } => serde_json::to_string(&("REQ", sub_id, filter))?,
            ClientMessage::Close { sub_id } => serde_json::to_string(&("CLOSE", sub_id))?,
        };
        Ok(json)
    }
}

/// Relay-to-client frames the engine cares about. Anything else is skipped by
/// the transport.
#[derive(Debug, Clone)]
pub enum RelayMessage {
    Event { sub_id: String, event: Event },
    Eose { sub_id: String },
    Notice { message: String },
    Closed { sub_id: String, message: String },
}

impl RelayMessage {
    pub fn parse(text: &str) -> Result<RelayMessage> {
        let value: serde_json::Value =
            serde_json::from_str(text).context("relay frame is not json")?;
        let arr = value
            .as_array()
            .ok_or_else(|| anyhow!("relay frame is not an array"))?;
        let verb = arr.first().and_then(|v| v.as_str()).unwrap_or("");
        match verb {
            "EVENT" => {
                if arr.len() < 3 {
                    bail!("EVENT frame too short");
                }
                let sub_id = arr[1].as_str().unwrap_or_default().to_string();
                let event: Event =
                    serde_json::from_value(arr[2].clone()).context("bad EVENT payload")?;
                Ok(RelayMessage::Event { sub_id, event })
            }
            "EOSE" => {
                let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                Ok(RelayMessage::Eose {
                    sub_id: sub_id.to_string(),
                })
            }
            "NOTICE" => {
                let message = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                Ok(RelayMessage::Notice {
                    message: message.to_string(),
                })
            }
            "CLOSED" => {
                let sub_id = arr.get(1).and_then(|v| v.as_str()).unwrap_or_default();
                let message = arr.get(2).and_then(|v| v.as_str()).unwrap_or_default();
                Ok(RelayMessage::Closed {
                    sub_id: sub_id.to_string(),
                    message: message.to_string(),
                })
            }
            other => bail!("unknown relay verb: {other}"),
        }
    }
}

/// Body of a kind-0 metadata event's `content` string. Some clients write
/// `displayName`, others `display_name`.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct ProfileMetadata {
    pub name: Option<String>,
    #[serde(alias = "displayName")]
    pub display_name: Option<String>,
    pub picture: Option<String>,
    pub nip05: Option<String>,
}

impl ProfileMetadata {
    pub fn from_content(content: &str) -> Result<ProfileMetadata> {
        Ok(serde_json::from_str(content)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn req_frame_is_exact() {
        let msg = ClientMessage::Req {
            sub_id: "nsearch-1".to_string(),
            filter: Filter {
                kinds: Some(vec![KIND_TEXT_NOTE]),
                search: Some("hello".to_string()),
                limit: Some(100),
                ..Default::default()
            },
        };
        assert_eq!(
            msg.to_json().unwrap(),
            r#"["REQ","nsearch-1",{"kinds":[1],"search":"hello","limit":100}]"#
        );
    }

    #[test]
    fn close_frame_is_exact() {
        let msg = ClientMessage::Close {
            sub_id: "nsearch-1".to_string(),
        };
        assert_eq!(msg.to_json().unwrap(), r#"["CLOSE","nsearch-1"]"#);
    }

    #[test]
    fn parses_event_frame() {
        let text = r#"["EVENT","sub",{"id":"e1","pubkey":"pk","created_at":100,"kind":1,"tags":[["t","nostr"]],"content":"hi","sig":"s"}]"#;
        match RelayMessage::parse(text).unwrap() {
            RelayMessage::Event { sub_id, event } => {
                assert_eq!(sub_id, "sub");
                assert_eq!(event.id, "e1");
                assert_eq!(event.tag_values("t").collect::<Vec<_>>(), vec!["nostr"]);
            }
            other => panic!("expected EVENT, got {other:?}"),
        }
    }

    #[test]
    fn parses_eose_and_closed() {
        assert!(matches!(
            RelayMessage::parse(r#"["EOSE","sub"]"#).unwrap(),
            RelayMessage::Eose { .. }
        ));
        match RelayMessage::parse(r#"["CLOSED","sub","error: too many concurrent REQs"]"#).unwrap()
        {
            RelayMessage::Closed { message, .. } => {
                assert!(message.contains("too many"));
            }
            other => panic!("expected CLOSED, got {other:?}"),
        }
    }

    #[test]
    fn rejects_unknown_verb() {
        assert!(RelayMessage::parse(r#"["AUTH","challenge"]"#).is_err());
        assert!(RelayMessage::parse(r#"{"not":"an array"}"#).is_err());
    }

    #[test]
    fn parses_metadata_content_variants() {
        let meta = ProfileMetadata::from_content(
            r#"{"name":"alice","displayName":"Alice","picture":"https://x/a.png","nip05":"alice@example.com","lud16":"ignored"}"#,
        )
        .unwrap();
        assert_eq!(meta.display_name.as_deref(), Some("Alice"));
        assert_eq!(meta.nip05.as_deref(), Some("alice@example.com"));
    }
}
