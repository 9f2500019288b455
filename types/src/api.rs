//! Real-time wire protocol.
//!
//! Every server frame is an [Envelope] encoded as a flat JSON object:
//! `{"id": 12, "type": "bet_placed", "payload": {...}, "timestamp": 1700000000000}`.
//! Sequenced events have `id > 0`; direct replies to one connection carry `id == 0`
//! and are never replayed.

use crate::{round::RoundSnapshot, Multiplier, RoundId, UserId, Wei};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Id carried by frames that are not part of the replayable sequence.
pub const UNSEQUENCED: u64 = 0;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("malformed frame: {0}")]
    Json(#[from] serde_json::Error),
    #[error("frame is not a JSON object")]
    NotAnObject,
    #[error("frame is missing {0}")]
    MissingField(&'static str),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundStarted {
    pub round_id: RoundId,
    pub seed_hash: String,
    pub client_seed: String,
    pub nonce: u64,
    pub betting_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MultiplierUpdate {
    pub round_id: RoundId,
    pub multiplier: Multiplier,
    pub elapsed_ms: u64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundCrashed {
    pub round_id: RoundId,
    pub crash_point: Multiplier,
    pub server_seed: String,
    pub seed_hash: String,
    pub winners: u32,
    pub losers: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BetPlaced {
    pub round_id: RoundId,
    pub player: UserId,
    #[serde(with = "crate::wei")]
    pub amount: Wei,
    pub auto_cashout: Option<Multiplier>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerCashedOut {
    pub round_id: RoundId,
    pub player: UserId,
    pub multiplier: Multiplier,
    #[serde(with = "crate::wei")]
    pub payout: Wei,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncTick {
    pub server_time: u64,
}

/// Outcome of a single client request, sent only to the requesting connection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Reply {
    pub request: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Reply {
    pub fn ok(request: &str) -> Self {
        Self {
            request: request.to_string(),
            ok: true,
            code: None,
            message: None,
        }
    }

    pub fn rejected(request: &str, code: &str, message: String) -> Self {
        Self {
            request: request.to_string(),
            ok: false,
            code: Some(code.to_string()),
            message: Some(message),
        }
    }
}

/// Liveness summary served at `GET /health`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Health {
    pub connections: usize,
    pub last_event_id: u64,
}

/// Server to client events.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Event {
    RoundStarted(RoundStarted),
    MultiplierUpdate(MultiplierUpdate),
    RoundCrashed(RoundCrashed),
    BetPlaced(BetPlaced),
    PlayerCashedOut(PlayerCashedOut),
    SyncTick(SyncTick),
    Snapshot(RoundSnapshot),
    Reply(Reply),
}

/// A sequenced (or direct, see [UNSEQUENCED]) server frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    pub id: u64,
    pub timestamp: u64,
    pub event: Event,
}

impl Envelope {
    pub fn new(id: u64, timestamp: u64, event: Event) -> Self {
        Self {
            id,
            timestamp,
            event,
        }
    }

    pub fn is_sequenced(&self) -> bool {
        self.id != UNSEQUENCED
    }

    /// Encode as a single flat JSON object.
    pub fn encode(&self) -> Result<String, WireError> {
        let mut frame = serde_json::to_value(&self.event)?;
        let object = frame.as_object_mut().ok_or(WireError::NotAnObject)?;
        object.insert("id".into(), Value::from(self.id));
        object.insert("timestamp".into(), Value::from(self.timestamp));
        Ok(frame.to_string())
    }

    pub fn decode(raw: &str) -> Result<Self, WireError> {
        let mut frame: Value = serde_json::from_str(raw)?;
        let object = frame.as_object_mut().ok_or(WireError::NotAnObject)?;
        let id = object
            .remove("id")
            .and_then(|id| id.as_u64())
            .ok_or(WireError::MissingField("id"))?;
        let timestamp = object
            .remove("timestamp")
            .and_then(|timestamp| timestamp.as_u64())
            .ok_or(WireError::MissingField("timestamp"))?;
        let event = serde_json::from_value(frame)?;
        Ok(Self {
            id,
            timestamp,
            event,
        })
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    #[serde(default)]
    pub last_event_id: Option<u64>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceBet {
    #[serde(with = "crate::wei")]
    pub amount: Wei,
    #[serde(default)]
    pub auto_cashout: Option<Multiplier>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashOut {}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Withdraw {
    #[serde(with = "crate::wei")]
    pub amount: Wei,
    pub to: String,
}

/// Client to server messages.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    Hello(Hello),
    PlaceBet(PlaceBet),
    CashOut(CashOut),
    Heartbeat(Heartbeat),
    Withdraw(Withdraw),
}

impl ClientMessage {
    /// Name used in [Reply::request].
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Hello(_) => "hello",
            ClientMessage::PlaceBet(_) => "placeBet",
            ClientMessage::CashOut(_) => "cashOut",
            ClientMessage::Heartbeat(_) => "heartbeat",
            ClientMessage::Withdraw(_) => "withdraw",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_is_flat() {
        let envelope = Envelope::new(
            42,
            1_700_000_000_000,
            Event::PlayerCashedOut(PlayerCashedOut {
                round_id: 3,
                player: "0xabc".into(),
                multiplier: Multiplier(250),
                payout: 2_500_000_000_000_000_000,
            }),
        );
        let encoded = envelope.encode().unwrap();
        let value: Value = serde_json::from_str(&encoded).unwrap();
        assert_eq!(value["id"], 42);
        assert_eq!(value["type"], "player_cashed_out");
        assert_eq!(value["timestamp"], 1_700_000_000_000u64);
        assert_eq!(value["payload"]["multiplier"], 250);
        assert_eq!(value["payload"]["payout"], "2500000000000000000");
        assert_eq!(Envelope::decode(&encoded).unwrap(), envelope);
    }

    #[test]
    fn test_decode_rejects_missing_id() {
        let raw = r#"{"type":"sync_tick","payload":{"serverTime":1},"timestamp":1}"#;
        assert!(matches!(
            Envelope::decode(raw),
            Err(WireError::MissingField("id"))
        ));
    }

    #[test]
    fn test_client_message_names() {
        let hello: ClientMessage =
            serde_json::from_str(r#"{"type":"hello","payload":{"lastEventId":17}}"#).unwrap();
        assert_eq!(
            hello,
            ClientMessage::Hello(Hello {
                last_event_id: Some(17)
            })
        );

        let bet: ClientMessage =
            serde_json::from_str(r#"{"type":"placeBet","payload":{"amount":"1000"}}"#).unwrap();
        assert_eq!(
            bet,
            ClientMessage::PlaceBet(PlaceBet {
                amount: 1000,
                auto_cashout: None
            })
        );

        let cash_out: ClientMessage =
            serde_json::from_str(r#"{"type":"cashOut","payload":{}}"#).unwrap();
        assert_eq!(cash_out.name(), "cashOut");
    }

    #[test]
    fn test_fresh_hello_has_no_cursor() {
        let hello: ClientMessage =
            serde_json::from_str(r#"{"type":"hello","payload":{}}"#).unwrap();
        assert_eq!(hello, ClientMessage::Hello(Hello::default()));
    }
}
