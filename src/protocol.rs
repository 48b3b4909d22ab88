//! Wire protocol between the client and the sync server.
//!
//! Every frame is a JSON two-element array `[tag, payload]`. Downstream tags
//! are `connected`, `error`, `pong` and `poke`; upstream tags are `ping` and
//! `push`. Payload field names use the server's camelCase convention.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Protocol version stamped on push envelopes.
pub const PUSH_VERSION: u32 = 1;

/// A state delta produced by the server.
///
/// `base_cookie` must match the replica's current cookie when the poke is
/// applied; `cookie` is the version the patch transitions to. `timestamp` is
/// measured against the originating client's clock when `client_id` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PokeBody {
    pub base_cookie: Option<u64>,
    pub cookie: u64,
    #[serde(rename = "lastMutationID")]
    pub last_mutation_id: u64,
    pub patch: Vec<Value>,
    pub timestamp: i64,
    #[serde(rename = "clientID", default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// A local optimistic mutation, created by the store and never modified
/// afterwards. Ids are strictly increasing per client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: u64,
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub name: String,
    pub args: Value,
    pub timestamp: i64,
}

/// Body of an upstream `push` envelope. Each transmission carries exactly one
/// mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushBody {
    #[serde(rename = "clientID")]
    pub client_id: String,
    pub mutations: Vec<Mutation>,
    pub push_version: u32,
    pub schema_version: String,
    pub timestamp: i64,
}

/// Server-to-client envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Downstream {
    Connected,
    Error(String),
    Pong,
    Poke(Vec<PokeBody>),
}

impl Downstream {
    /// Decodes a downstream frame. A `poke` payload may be a single body or
    /// an array of bodies; both normalize to a sequence.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let (tag, payload): (String, Value) = serde_json::from_str(text)?;
        match tag.as_str() {
            "connected" => Ok(Downstream::Connected),
            "error" => Ok(Downstream::Error(serde_json::from_value(payload)?)),
            "pong" => Ok(Downstream::Pong),
            "poke" => {
                let pokes = if payload.is_array() {
                    serde_json::from_value::<Vec<PokeBody>>(payload)?
                } else {
                    vec![serde_json::from_value::<PokeBody>(payload)?]
                };
                Ok(Downstream::Poke(pokes))
            }
            other => Err(ProtocolError::UnknownTag(other.to_string())),
        }
    }
}

/// Client-to-server envelope.
#[derive(Debug, Clone, PartialEq)]
pub enum Upstream {
    Ping,
    Push(PushBody),
}

impl Upstream {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        let text = match self {
            Upstream::Ping => serde_json::to_string(&("ping", serde_json::json!({})))?,
            Upstream::Push(body) => serde_json::to_string(&("push", body))?,
        };
        Ok(text)
    }
}

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unknown downstream tag: {0}")]
    UnknownTag(String),
    #[error("server error: {0}")]
    Server(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn decodes_connected_and_pong() {
        assert_eq!(
            Downstream::decode(r#"["connected",{}]"#).unwrap(),
            Downstream::Connected
        );
        assert_eq!(Downstream::decode(r#"["pong",{}]"#).unwrap(), Downstream::Pong);
    }

    #[test]
    fn decodes_error_payload() {
        let frame = Downstream::decode(r#"["error","room not found"]"#).unwrap();
        assert_eq!(frame, Downstream::Error("room not found".to_string()));
    }

    #[test]
    fn decodes_single_poke_and_poke_array() {
        let body = json!({
            "baseCookie": null,
            "cookie": 1,
            "lastMutationID": 3,
            "patch": [{"op": "put", "key": "a", "value": 1}],
            "timestamp": 100,
            "clientID": "c1",
        });
        let single = format!(r#"["poke",{body}]"#);
        let frame = Downstream::decode(&single).unwrap();
        let Downstream::Poke(pokes) = frame else {
            panic!("expected poke");
        };
        assert_eq!(pokes.len(), 1);
        assert_eq!(pokes[0].base_cookie, None);
        assert_eq!(pokes[0].cookie, 1);
        assert_eq!(pokes[0].last_mutation_id, 3);
        assert_eq!(pokes[0].client_id.as_deref(), Some("c1"));

        let array = format!(r#"["poke",[{body},{body}]]"#);
        let Downstream::Poke(pokes) = Downstream::decode(&array).unwrap() else {
            panic!("expected poke");
        };
        assert_eq!(pokes.len(), 2);
    }

    #[test]
    fn unknown_tag_is_a_protocol_violation() {
        let err = Downstream::decode(r#"["snapshot",{}]"#).unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownTag(tag) if tag == "snapshot"));
    }

    #[test]
    fn malformed_frames_are_rejected() {
        assert!(Downstream::decode("not json").is_err());
        assert!(Downstream::decode(r#"{"tag":"connected"}"#).is_err());
        assert!(Downstream::decode(r#"["poke","no body"]"#).is_err());
    }

    #[test]
    fn encodes_ping() {
        assert_eq!(Upstream::Ping.encode().unwrap(), r#"["ping",{}]"#);
    }

    #[test]
    fn encodes_push_with_camel_case_fields() {
        let push = Upstream::Push(PushBody {
            client_id: "c1".to_string(),
            mutations: vec![Mutation {
                id: 5,
                client_id: "c1".to_string(),
                name: "increment".to_string(),
                args: json!({"by": 2}),
                timestamp: 42,
            }],
            push_version: PUSH_VERSION,
            schema_version: "1".to_string(),
            timestamp: 42,
        });
        let text = push.encode().unwrap();
        let (tag, payload): (String, Value) = serde_json::from_str(&text).unwrap();
        assert_eq!(tag, "push");
        assert_eq!(payload["clientID"], "c1");
        assert_eq!(payload["pushVersion"], PUSH_VERSION);
        assert_eq!(payload["mutations"][0]["id"], 5);
        assert_eq!(payload["mutations"][0]["name"], "increment");
    }
}
