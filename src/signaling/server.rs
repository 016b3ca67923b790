//! Rendezvous service: maps room codes to at most two client sessions and
//! relays offer/answer/ICE between the occupants.

use std::collections::HashMap;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::Router;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use super::{
    generate_room_code, parse_client_message, ClientMessage, ServerMessage, SignalErrorCode,
};

/// Outbound queue handle for one connected client. Writes never block; the
/// client's socket task drains the queue.
type OutboundTx = mpsc::UnboundedSender<ServerMessage>;

struct ClientEntry {
    tx: OutboundTx,
    current_room: Option<String>,
}

struct Room {
    creator: Uuid,
    members: Vec<Uuid>,
}

#[derive(Default)]
struct Registry {
    clients: HashMap<Uuid, ClientEntry>,
    rooms: HashMap<String, Room>,
}

impl Registry {
    /// The unique other member of `client`'s room, if both are present.
    fn peer_of(&self, client: Uuid) -> Result<Uuid, SignalErrorCode> {
        let room_code = self
            .clients
            .get(&client)
            .and_then(|entry| entry.current_room.as_deref())
            .ok_or(SignalErrorCode::NotInRoom)?;
        let room = self
            .rooms
            .get(room_code)
            .ok_or(SignalErrorCode::NotInRoom)?;
        room.members
            .iter()
            .copied()
            .find(|id| *id != client)
            .ok_or(SignalErrorCode::NoPeer)
    }
}

/// The signaling server state. Cheap to clone; all mutations are serialized
/// behind one lock covering the full read-modify-notify sequence.
#[derive(Clone)]
pub struct SignalingServer {
    registry: Arc<Mutex<Registry>>,
}

/// Build a router serving the signaling protocol on every path.
pub fn signaling_router() -> Router {
    SignalingServer::new().into_router()
}

impl SignalingServer {
    pub fn new() -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry::default())),
        }
    }

    /// A single endpoint accepts all incoming connections; no path
    /// discrimination.
    pub fn into_router(self) -> Router {
        Router::new().fallback(upgrade).with_state(self)
    }

    /// Number of live rooms. Exposed for tests and operational probes.
    pub async fn room_count(&self) -> usize {
        self.registry.lock().await.rooms.len()
    }

    /// Membership count of a room, if it exists.
    pub async fn room_size(&self, code: &str) -> Option<usize> {
        self.registry
            .lock()
            .await
            .rooms
            .get(&code.to_uppercase())
            .map(|room| room.members.len())
    }

    async fn register(&self, client_id: Uuid, tx: OutboundTx) {
        let mut registry = self.registry.lock().await;
        registry.clients.insert(
            client_id,
            ClientEntry {
                tx,
                current_room: None,
            },
        );
    }

    /// Handle one parsed request. Replies and peer notifications are
    /// collected under the lock and flushed after it is released.
    async fn dispatch(&self, client_id: Uuid, message: ClientMessage) {
        let mut sends: Vec<(OutboundTx, ServerMessage)> = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            match message {
                ClientMessage::CreateRoom => {
                    Self::create_room(&mut registry, client_id, &mut sends)
                }
                ClientMessage::JoinRoom { room_id } => {
                    Self::join_room(&mut registry, client_id, &room_id, &mut sends)
                }
                ClientMessage::LeaveRoom => Self::leave_room(&mut registry, client_id, &mut sends),
                ClientMessage::Offer { sdp } => Self::relay(
                    &mut registry,
                    client_id,
                    ServerMessage::Offer { sdp },
                    &mut sends,
                ),
                ClientMessage::Answer { sdp } => Self::relay(
                    &mut registry,
                    client_id,
                    ServerMessage::Answer { sdp },
                    &mut sends,
                ),
                ClientMessage::IceCandidate { candidate } => Self::relay(
                    &mut registry,
                    client_id,
                    ServerMessage::IceCandidate { candidate },
                    &mut sends,
                ),
            }
        }
        for (tx, msg) in sends {
            let _ = tx.send(msg);
        }
    }

    fn create_room(registry: &mut Registry, client_id: Uuid, sends: &mut Vec<(OutboundTx, ServerMessage)>) {
        let entry = match registry.clients.get(&client_id) {
            Some(entry) => entry,
            None => return,
        };
        if entry.current_room.is_some() {
            sends.push((
                entry.tx.clone(),
                ServerMessage::error(SignalErrorCode::AlreadyInRoom),
            ));
            return;
        }
        let mut code = generate_room_code();
        while registry.rooms.contains_key(&code) {
            code = generate_room_code();
        }
        registry.rooms.insert(
            code.clone(),
            Room {
                creator: client_id,
                members: vec![client_id],
            },
        );
        let entry = registry
            .clients
            .get_mut(&client_id)
            .expect("checked above");
        entry.current_room = Some(code.clone());
        info!("client {client_id} created room {code}");
        sends.push((entry.tx.clone(), ServerMessage::RoomCreated { room_id: code }));
    }

    fn join_room(
        registry: &mut Registry,
        client_id: Uuid,
        room_id: &str,
        sends: &mut Vec<(OutboundTx, ServerMessage)>,
    ) {
        let code = room_id.to_uppercase();
        let tx = match registry.clients.get(&client_id) {
            Some(entry) => entry.tx.clone(),
            None => return,
        };
        let reject = |code: SignalErrorCode| (tx.clone(), ServerMessage::error(code));
        if registry.clients[&client_id].current_room.is_some() {
            sends.push(reject(SignalErrorCode::AlreadyInRoom));
            return;
        }
        let room = match registry.rooms.get_mut(&code) {
            Some(room) => room,
            None => {
                sends.push(reject(SignalErrorCode::RoomNotFound));
                return;
            }
        };
        if room.members.len() >= 2 {
            sends.push(reject(SignalErrorCode::RoomFull));
            return;
        }
        room.members.push(client_id);
        let creator = room.members[0];
        registry
            .clients
            .get_mut(&client_id)
            .expect("joiner is registered")
            .current_room = Some(code.clone());
        info!("client {client_id} joined room {code}");
        // room-joined must be enqueued on the joiner before peer-joined goes
        // to the other occupant.
        sends.push((
            tx,
            ServerMessage::RoomJoined {
                room_id: code,
                is_initiator: false,
            },
        ));
        if let Some(peer) = registry.clients.get(&creator) {
            sends.push((peer.tx.clone(), ServerMessage::PeerJoined));
        }
    }

    fn leave_room(
        registry: &mut Registry,
        client_id: Uuid,
        sends: &mut Vec<(OutboundTx, ServerMessage)>,
    ) {
        let code = match registry
            .clients
            .get_mut(&client_id)
            .and_then(|entry| entry.current_room.take())
        {
            Some(code) => code,
            None => return, // idempotent
        };
        let empty = if let Some(room) = registry.rooms.get_mut(&code) {
            room.members.retain(|id| *id != client_id);
            for member in &room.members {
                if let Some(peer) = registry.clients.get(member) {
                    sends.push((peer.tx.clone(), ServerMessage::PeerLeft));
                }
            }
            room.members.is_empty()
        } else {
            false
        };
        if empty {
            registry.rooms.remove(&code);
            info!("room {code} deleted");
        }
        info!("client {client_id} left room {code}");
    }

    fn relay(
        registry: &mut Registry,
        client_id: Uuid,
        message: ServerMessage,
        sends: &mut Vec<(OutboundTx, ServerMessage)>,
    ) {
        let tx = match registry.clients.get(&client_id) {
            Some(entry) => entry.tx.clone(),
            None => return,
        };
        match registry.peer_of(client_id) {
            Ok(peer_id) => {
                if let Some(peer) = registry.clients.get(&peer_id) {
                    debug!("relaying signaling payload from {client_id} to {peer_id}");
                    sends.push((peer.tx.clone(), message));
                }
            }
            Err(code) => sends.push((tx, ServerMessage::error(code))),
        }
    }

    /// Transport close: identical in effect to leave-room, then the client
    /// record is discarded.
    async fn disconnect(&self, client_id: Uuid) {
        let mut sends = Vec::new();
        {
            let mut registry = self.registry.lock().await;
            Self::leave_room(&mut registry, client_id, &mut sends);
            registry.clients.remove(&client_id);
        }
        for (tx, msg) in sends {
            let _ = tx.send(msg);
        }
        info!("client {client_id} disconnected");
    }
}

impl Default for SignalingServer {
    fn default() -> Self {
        Self::new()
    }
}

async fn upgrade(ws: WebSocketUpgrade, State(server): State<SignalingServer>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, server))
}

async fn handle_socket(socket: WebSocket, server: SignalingServer) {
    let client_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();

    server.register(client_id, tx.clone()).await;
    // Exactly once, immediately after accept, ahead of anything else queued.
    let _ = tx.send(ServerMessage::Connected {
        client_id: client_id.to_string(),
    });

    loop {
        tokio::select! {
            biased;
            Some(outbound) = rx.recv() => {
                if send_message(&mut sink, &outbound).await.is_err() {
                    break;
                }
            }
            maybe_msg = stream.next() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => match parse_client_message(&text) {
                        Ok(message) => server.dispatch(client_id, message).await,
                        Err(code) => {
                            warn!("client {client_id} sent unusable frame: {}", code.message());
                            let _ = tx.send(ServerMessage::error(code));
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(Message::Binary(_))) | Some(Ok(Message::Pong(_))) => {}
                }
            }
        }
    }

    server.disconnect(client_id).await;
}

async fn send_message(
    sink: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> Result<(), axum::Error> {
    let text = serde_json::to_string(message).unwrap_or_default();
    sink.send(Message::Text(text)).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(registry: &mut Registry) -> (Uuid, mpsc::UnboundedReceiver<ServerMessage>) {
        let id = Uuid::new_v4();
        let (tx, rx) = mpsc::unbounded_channel();
        registry.clients.insert(
            id,
            ClientEntry {
                tx,
                current_room: None,
            },
        );
        (id, rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerMessage>) -> Vec<ServerMessage> {
        let mut out = Vec::new();
        while let Ok(msg) = rx.try_recv() {
            out.push(msg);
        }
        out
    }

    fn flush(sends: Vec<(OutboundTx, ServerMessage)>) {
        for (tx, msg) in sends {
            let _ = tx.send(msg);
        }
    }

    fn create(registry: &mut Registry, id: Uuid) -> String {
        let mut sends = Vec::new();
        SignalingServer::create_room(registry, id, &mut sends);
        let code = registry.clients[&id]
            .current_room
            .clone()
            .expect("creator joined its own room");
        flush(sends);
        code
    }

    fn join(registry: &mut Registry, id: Uuid, code: &str) {
        let mut sends = Vec::new();
        SignalingServer::join_room(registry, id, code, &mut sends);
        flush(sends);
    }

    #[test]
    fn create_then_join_fills_the_room() {
        let mut registry = Registry::default();
        let (alice, mut alice_rx) = client(&mut registry);
        let (bob, mut bob_rx) = client(&mut registry);

        let code = create(&mut registry, alice);
        assert_eq!(registry.rooms[&code].members, vec![alice]);
        assert_eq!(registry.rooms[&code].creator, alice);

        // mixed-case lookup normalises
        join(&mut registry, bob, &code.to_lowercase());
        assert_eq!(registry.rooms[&code].members, vec![alice, bob]);

        let bob_msgs = drain(&mut bob_rx);
        assert!(matches!(
            bob_msgs.first(),
            Some(ServerMessage::RoomJoined { is_initiator: false, .. })
        ));
        let alice_msgs = drain(&mut alice_rx);
        assert!(alice_msgs.contains(&ServerMessage::PeerJoined));
    }

    #[test]
    fn third_join_is_rejected_without_membership_change() {
        let mut registry = Registry::default();
        let (alice, _arx) = client(&mut registry);
        let (bob, _brx) = client(&mut registry);
        let (carol, mut carol_rx) = client(&mut registry);

        let code = create(&mut registry, alice);
        join(&mut registry, bob, &code);
        join(&mut registry, carol, &code);

        assert_eq!(registry.rooms[&code].members.len(), 2);
        assert!(registry.clients[&carol].current_room.is_none());
        let msgs = drain(&mut carol_rx);
        assert!(matches!(
            msgs.first(),
            Some(ServerMessage::Error {
                code: SignalErrorCode::RoomFull,
                ..
            })
        ));
    }

    #[test]
    fn join_unknown_room_fails() {
        let mut registry = Registry::default();
        let (bob, mut bob_rx) = client(&mut registry);
        join(&mut registry, bob, "ZZZZZZ");
        assert!(matches!(
            drain(&mut bob_rx).first(),
            Some(ServerMessage::Error {
                code: SignalErrorCode::RoomNotFound,
                ..
            })
        ));
    }

    #[test]
    fn second_create_while_in_room_fails() {
        let mut registry = Registry::default();
        let (alice, mut alice_rx) = client(&mut registry);
        create(&mut registry, alice);
        drain(&mut alice_rx);

        let mut sends = Vec::new();
        SignalingServer::create_room(&mut registry, alice, &mut sends);
        flush(sends);
        assert!(matches!(
            drain(&mut alice_rx).first(),
            Some(ServerMessage::Error {
                code: SignalErrorCode::AlreadyInRoom,
                ..
            })
        ));
        assert_eq!(registry.rooms.len(), 1);
    }

    #[test]
    fn relay_without_peer_fails_and_with_peer_delivers() {
        let mut registry = Registry::default();
        let (alice, mut alice_rx) = client(&mut registry);
        let (bob, mut bob_rx) = client(&mut registry);
        let code = create(&mut registry, alice);
        drain(&mut alice_rx);

        let mut sends = Vec::new();
        SignalingServer::relay(
            &mut registry,
            alice,
            ServerMessage::Offer { sdp: "v=0".into() },
            &mut sends,
        );
        flush(sends);
        assert!(matches!(
            drain(&mut alice_rx).first(),
            Some(ServerMessage::Error {
                code: SignalErrorCode::NoPeer,
                ..
            })
        ));

        join(&mut registry, bob, &code);
        drain(&mut bob_rx);
        let mut sends = Vec::new();
        SignalingServer::relay(
            &mut registry,
            alice,
            ServerMessage::Offer { sdp: "v=0".into() },
            &mut sends,
        );
        flush(sends);
        assert_eq!(
            drain(&mut bob_rx),
            vec![ServerMessage::Offer { sdp: "v=0".into() }]
        );
    }

    #[test]
    fn relay_while_roomless_fails() {
        let mut registry = Registry::default();
        let (alice, mut alice_rx) = client(&mut registry);
        let mut sends = Vec::new();
        SignalingServer::relay(
            &mut registry,
            alice,
            ServerMessage::Answer { sdp: "v=0".into() },
            &mut sends,
        );
        flush(sends);
        assert!(matches!(
            drain(&mut alice_rx).first(),
            Some(ServerMessage::Error {
                code: SignalErrorCode::NotInRoom,
                ..
            })
        ));
    }

    #[test]
    fn leave_notifies_peer_and_empty_rooms_are_deleted() {
        let mut registry = Registry::default();
        let (alice, mut alice_rx) = client(&mut registry);
        let (bob, _brx) = client(&mut registry);
        let code = create(&mut registry, alice);
        join(&mut registry, bob, &code);
        drain(&mut alice_rx);

        let mut sends = Vec::new();
        SignalingServer::leave_room(&mut registry, bob, &mut sends);
        flush(sends);
        assert!(drain(&mut alice_rx).contains(&ServerMessage::PeerLeft));
        // Alice is still the sole member; the room survives.
        assert_eq!(registry.rooms[&code].members, vec![alice]);

        let mut sends = Vec::new();
        SignalingServer::leave_room(&mut registry, alice, &mut sends);
        flush(sends);
        assert!(registry.rooms.is_empty());

        // idempotent
        let mut sends = Vec::new();
        SignalingServer::leave_room(&mut registry, alice, &mut sends);
        assert!(sends.is_empty());
    }

    #[test]
    fn no_client_appears_in_two_rooms() {
        let mut registry = Registry::default();
        let (alice, _arx) = client(&mut registry);
        let (bob, mut bob_rx) = client(&mut registry);
        create(&mut registry, alice);
        let second = create(&mut registry, bob);
        drain(&mut bob_rx);

        join(&mut registry, bob, &second);
        assert!(matches!(
            drain(&mut bob_rx).first(),
            Some(ServerMessage::Error {
                code: SignalErrorCode::AlreadyInRoom,
                ..
            })
        ));

        let memberships: usize = registry
            .rooms
            .values()
            .map(|room| room.members.iter().filter(|id| **id == bob).count())
            .sum();
        assert_eq!(memberships, 1);
    }

    #[test]
    fn simultaneous_creates_get_distinct_codes() {
        let mut registry = Registry::default();
        let (alice, _arx) = client(&mut registry);
        let (bob, _brx) = client(&mut registry);
        let first = create(&mut registry, alice);
        let second = create(&mut registry, bob);
        assert_ne!(first, second);
        assert_eq!(registry.rooms.len(), 2);
    }
}
