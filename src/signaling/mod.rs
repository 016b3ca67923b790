//! Signaling wire format — JSON messages exchanged with the rendezvous server.

use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};

mod client;
mod server;

pub use client::{SignalEvent, SignalingClient};
pub use server::{signaling_router, SignalingServer};

/// Alphabet for room codes. Uppercase alphanumerics only; joiners may type
/// codes in any case and the server uppercases before lookup.
const ROOM_CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of a room code in characters.
pub const ROOM_CODE_LEN: usize = 6;

/// Draw a fresh room code from the OS CSPRNG.
///
/// ~31 bits of entropy per code. Uniqueness against live rooms is the
/// registry's job; this function only guarantees the alphabet and length.
pub fn generate_room_code() -> String {
    let mut bytes = [0u8; ROOM_CODE_LEN];
    OsRng.fill_bytes(&mut bytes);
    bytes
        .iter()
        .map(|b| ROOM_CODE_ALPHABET[*b as usize % ROOM_CODE_ALPHABET.len()] as char)
        .collect()
}

/// A trickled ICE candidate, relayed opaquely between the two room members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default)]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: Option<u32>,
}

/// Messages a client sends to the signaling server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "create-room")]
    CreateRoom,
    #[serde(rename = "join-room")]
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "leave-room")]
    LeaveRoom,
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(flatten)]
        candidate: IceCandidate,
    },
}

/// Messages the signaling server sends to a client.
///
/// `Offer`, `Answer` and `IceCandidate` reuse the inbound tag strings — a
/// relayed message keeps its `type` discriminator verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connected")]
    Connected {
        #[serde(rename = "clientId")]
        client_id: String,
    },
    #[serde(rename = "room-created")]
    RoomCreated {
        #[serde(rename = "roomId")]
        room_id: String,
    },
    #[serde(rename = "room-joined")]
    RoomJoined {
        #[serde(rename = "roomId")]
        room_id: String,
        #[serde(rename = "isInitiator")]
        is_initiator: bool,
    },
    #[serde(rename = "peer-joined")]
    PeerJoined,
    #[serde(rename = "peer-left")]
    PeerLeft,
    #[serde(rename = "error")]
    Error {
        code: SignalErrorCode,
        message: String,
    },
    #[serde(rename = "offer")]
    Offer { sdp: String },
    #[serde(rename = "answer")]
    Answer { sdp: String },
    #[serde(rename = "ice-candidate")]
    IceCandidate {
        #[serde(flatten)]
        candidate: IceCandidate,
    },
}

/// Terminal error replies. None of these close the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SignalErrorCode {
    AlreadyInRoom,
    RoomNotFound,
    RoomFull,
    NotInRoom,
    NoPeer,
    InvalidJson,
    UnknownMessage,
}

impl SignalErrorCode {
    pub fn message(&self) -> &'static str {
        match self {
            SignalErrorCode::AlreadyInRoom => "client is already in a room",
            SignalErrorCode::RoomNotFound => "no room with that code",
            SignalErrorCode::RoomFull => "room already has two members",
            SignalErrorCode::NotInRoom => "client is not in a room",
            SignalErrorCode::NoPeer => "no peer present in the room",
            SignalErrorCode::InvalidJson => "message is not valid JSON",
            SignalErrorCode::UnknownMessage => "unknown message type",
        }
    }
}

impl ServerMessage {
    pub(crate) fn error(code: SignalErrorCode) -> Self {
        ServerMessage::Error {
            code,
            message: code.message().to_string(),
        }
    }
}

/// Parse one inbound text frame. Distinguishes malformed JSON from a
/// well-formed object of unknown `type` so the reply carries the right code.
pub fn parse_client_message(text: &str) -> Result<ClientMessage, SignalErrorCode> {
    let value: serde_json::Value =
        serde_json::from_str(text).map_err(|_| SignalErrorCode::InvalidJson)?;
    serde_json::from_value(value).map_err(|_| SignalErrorCode::UnknownMessage)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn room_codes_are_uppercase_alphanumeric() {
        for _ in 0..64 {
            let code = generate_room_code();
            assert_eq!(code.len(), ROOM_CODE_LEN);
            assert!(code
                .bytes()
                .all(|b| b.is_ascii_uppercase() || b.is_ascii_digit()));
        }
    }

    #[test]
    fn client_message_tags_round_trip() {
        let msg = ClientMessage::JoinRoom {
            room_id: "AB12CD".into(),
        };
        let text = serde_json::to_string(&msg).expect("serialize");
        assert!(text.contains("\"type\":\"join-room\""));
        assert!(text.contains("\"roomId\":\"AB12CD\""));
        assert_eq!(parse_client_message(&text).expect("parse"), msg);
    }

    #[test]
    fn ice_candidate_uses_webrtc_field_names() {
        let msg = ClientMessage::IceCandidate {
            candidate: IceCandidate {
                candidate: "candidate:1 1 udp 2130706431 192.0.2.1 54321 typ host".into(),
                sdp_mid: Some("0".into()),
                sdp_mline_index: Some(0),
            },
        };
        let text = serde_json::to_string(&msg).expect("serialize");
        assert!(text.contains("\"sdpMid\":\"0\""));
        assert!(text.contains("\"sdpMLineIndex\":0"));
    }

    #[test]
    fn relayed_tags_match_between_directions() {
        let inbound = serde_json::to_value(ClientMessage::Offer { sdp: "v=0".into() })
            .expect("serialize inbound");
        let outbound = serde_json::to_value(ServerMessage::Offer { sdp: "v=0".into() })
            .expect("serialize outbound");
        assert_eq!(inbound.get("type"), outbound.get("type"));
    }

    #[test]
    fn malformed_json_and_unknown_type_are_distinct() {
        assert_eq!(
            parse_client_message("{not json").unwrap_err(),
            SignalErrorCode::InvalidJson
        );
        assert_eq!(
            parse_client_message("{\"type\":\"frobnicate\"}").unwrap_err(),
            SignalErrorCode::UnknownMessage
        );
    }

    #[test]
    fn error_codes_serialize_screaming_snake() {
        let msg = ServerMessage::error(SignalErrorCode::RoomFull);
        let text = serde_json::to_string(&msg).expect("serialize");
        assert!(text.contains("\"code\":\"ROOM_FULL\""));
    }
}
