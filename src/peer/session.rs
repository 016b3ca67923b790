//! Peer session controller: drives the offer/answer/ICE handshake over the
//! signaling link until a data channel is open, then hands the channel off
//! and watches for teardown conditions.

use std::sync::Arc;

use log::{debug, info, warn};
use tokio::sync::mpsc;

use crate::config::IceServer;
use crate::signaling::{
    ClientMessage, IceCandidate, ServerMessage, SignalErrorCode, SignalEvent,
};
use crate::transport::DataChannel;

use super::connection::{
    PeerConnection, PeerConnector, PeerError, PeerTransportState, TransportEvent,
};

/// Connection state of the session, as surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

/// Events surfaced to the application layer.
pub enum SessionEvent {
    /// The signaling server accepted us and assigned an identity.
    SignalingConnected { client_id: String },
    RoomCreated { room_id: String },
    RoomJoined { room_id: String },
    PeerJoined,
    PeerLeft,
    StateChanged(SessionState),
    /// The data channel is open. Ownership of the transfer protocol moves to
    /// the transfer engine from here on.
    ChannelOpen(Arc<dyn DataChannel>),
    SignalError {
        code: SignalErrorCode,
        message: String,
    },
    Error(String),
    Closed,
}

impl std::fmt::Debug for SessionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionEvent::SignalingConnected { client_id } => {
                write!(f, "SignalingConnected({client_id})")
            }
            SessionEvent::RoomCreated { room_id } => write!(f, "RoomCreated({room_id})"),
            SessionEvent::RoomJoined { room_id } => write!(f, "RoomJoined({room_id})"),
            SessionEvent::PeerJoined => f.write_str("PeerJoined"),
            SessionEvent::PeerLeft => f.write_str("PeerLeft"),
            SessionEvent::StateChanged(state) => write!(f, "StateChanged({state:?})"),
            SessionEvent::ChannelOpen(_) => f.write_str("ChannelOpen(..)"),
            SessionEvent::SignalError { code, .. } => write!(f, "SignalError({code:?})"),
            SessionEvent::Error(message) => write!(f, "Error({message})"),
            SessionEvent::Closed => f.write_str("Closed"),
        }
    }
}

#[derive(Debug)]
enum SessionCommand {
    CreateRoom,
    JoinRoom(String),
    LeaveRoom,
    /// Explicit cleanup back to `Idle` after a terminal state.
    Reset,
    Shutdown,
}

/// Cheap handle for steering a running session.
#[derive(Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<SessionCommand>,
}

impl SessionHandle {
    pub fn create_room(&self) {
        let _ = self.commands.send(SessionCommand::CreateRoom);
    }

    pub fn join_room(&self, code: &str) {
        let _ = self
            .commands
            .send(SessionCommand::JoinRoom(code.to_uppercase()));
    }

    pub fn leave_room(&self) {
        let _ = self.commands.send(SessionCommand::LeaveRoom);
    }

    pub fn reset(&self) {
        let _ = self.commands.send(SessionCommand::Reset);
    }

    pub fn shutdown(&self) {
        let _ = self.commands.send(SessionCommand::Shutdown);
    }
}

/// The session controller task.
///
/// All asynchronous inputs — signaling traffic, transport events, application
/// commands — land on this task's select loop, so state transitions are
/// observed in a single serialized order.
pub struct PeerSession {
    signal_tx: mpsc::UnboundedSender<ClientMessage>,
    connector: Arc<dyn PeerConnector>,
    ice_servers: Vec<IceServer>,
    events: mpsc::UnboundedSender<SessionEvent>,

    state: SessionState,
    is_initiator: bool,
    room: Option<String>,
    client_id: Option<String>,
    connection: Option<Arc<dyn PeerConnection>>,
    pending_ice: Vec<IceCandidate>,
    remote_desc_set: bool,
    transport_tx: mpsc::UnboundedSender<TransportEvent>,
}

impl PeerSession {
    /// Spawn the controller. `signal_tx`/`signal_rx` are the two halves of
    /// the signaling link (see [`crate::signaling::SignalingClient`]).
    pub fn spawn(
        signal_tx: mpsc::UnboundedSender<ClientMessage>,
        signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
        connector: Arc<dyn PeerConnector>,
        ice_servers: Vec<IceServer>,
    ) -> (SessionHandle, mpsc::UnboundedReceiver<SessionEvent>) {
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();

        let session = PeerSession {
            signal_tx,
            connector,
            ice_servers,
            events: event_tx,
            state: SessionState::Idle,
            is_initiator: false,
            room: None,
            client_id: None,
            connection: None,
            pending_ice: Vec::new(),
            remote_desc_set: false,
            transport_tx,
        };
        tokio::spawn(session.run(signal_rx, transport_rx, command_rx));

        (
            SessionHandle {
                commands: command_tx,
            },
            event_rx,
        )
    }

    async fn run(
        mut self,
        mut signal_rx: mpsc::UnboundedReceiver<SignalEvent>,
        mut transport_rx: mpsc::UnboundedReceiver<TransportEvent>,
        mut command_rx: mpsc::UnboundedReceiver<SessionCommand>,
    ) {
        loop {
            tokio::select! {
                Some(command) = command_rx.recv() => {
                    if !self.handle_command(command).await {
                        break;
                    }
                }
                Some(event) = signal_rx.recv() => {
                    match event {
                        SignalEvent::Connected { client_id } => {
                            info!("signaling assigned client id {client_id}");
                            self.client_id = Some(client_id.clone());
                            self.emit(SessionEvent::SignalingConnected { client_id });
                        }
                        SignalEvent::Message(message) => self.handle_signal(message).await,
                        SignalEvent::Closed => {
                            self.teardown(SessionState::Disconnected).await;
                            self.emit(SessionEvent::Closed);
                            break;
                        }
                    }
                }
                Some(event) = transport_rx.recv() => {
                    self.handle_transport(event).await;
                }
                else => break,
            }
        }
    }

    /// Returns false when the session should stop.
    async fn handle_command(&mut self, command: SessionCommand) -> bool {
        match command {
            SessionCommand::CreateRoom => self.send_signal(ClientMessage::CreateRoom),
            SessionCommand::JoinRoom(code) => {
                self.send_signal(ClientMessage::JoinRoom { room_id: code })
            }
            SessionCommand::LeaveRoom => {
                self.send_signal(ClientMessage::LeaveRoom);
                self.room = None;
                self.is_initiator = false;
                self.teardown(SessionState::Idle).await;
            }
            SessionCommand::Reset => {
                self.teardown(SessionState::Idle).await;
            }
            SessionCommand::Shutdown => {
                self.teardown(SessionState::Idle).await;
                self.emit(SessionEvent::Closed);
                return false;
            }
        }
        true
    }

    async fn handle_signal(&mut self, message: ServerMessage) {
        match message {
            ServerMessage::Connected { client_id } => {
                // Normally folded into SignalEvent::Connected by the client;
                // accept it here too for completeness.
                self.client_id = Some(client_id.clone());
                self.emit(SessionEvent::SignalingConnected { client_id });
            }
            ServerMessage::RoomCreated { room_id } => {
                self.room = Some(room_id.clone());
                self.is_initiator = true;
                self.emit(SessionEvent::RoomCreated { room_id });
            }
            ServerMessage::RoomJoined {
                room_id,
                is_initiator,
            } => {
                self.room = Some(room_id.clone());
                self.is_initiator = is_initiator;
                self.emit(SessionEvent::RoomJoined { room_id });
            }
            ServerMessage::PeerJoined => {
                self.emit(SessionEvent::PeerJoined);
                if self.is_initiator {
                    if let Err(err) = self.start_as_initiator().await {
                        self.fail_handshake("offer setup failed", err).await;
                    }
                }
            }
            ServerMessage::PeerLeft => {
                info!("peer left the room");
                self.emit(SessionEvent::PeerLeft);
                self.teardown(SessionState::Disconnected).await;
            }
            ServerMessage::Offer { sdp } => {
                if self.is_initiator {
                    warn!("ignoring offer received while acting as initiator");
                    return;
                }
                if let Err(err) = self.accept_offer(&sdp).await {
                    self.fail_handshake("answer setup failed", err).await;
                }
            }
            ServerMessage::Answer { sdp } => {
                if !self.is_initiator {
                    warn!("ignoring answer received while acting as joiner");
                    return;
                }
                if let Err(err) = self.accept_answer(&sdp).await {
                    self.fail_handshake("remote answer rejected", err).await;
                }
            }
            ServerMessage::IceCandidate { candidate } => {
                self.handle_remote_candidate(candidate).await;
            }
            ServerMessage::Error { code, message } => {
                warn!("signaling error {code:?}: {message}");
                self.emit(SessionEvent::SignalError { code, message });
            }
        }
    }

    async fn handle_transport(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::IceCandidate(candidate) => {
                self.send_signal(ClientMessage::IceCandidate { candidate });
            }
            TransportEvent::StateChanged(state) => match state {
                PeerTransportState::Failed => {
                    warn!("peer transport failed");
                    self.teardown(SessionState::Failed).await;
                }
                PeerTransportState::Disconnected => {
                    // Recoverable; the stack retries on its own.
                    warn!("peer transport disconnected, waiting for recovery");
                }
                PeerTransportState::Closed => {
                    if self.connection.is_some() {
                        self.teardown(SessionState::Disconnected).await;
                    }
                }
                other => debug!("peer transport state: {other:?}"),
            },
            TransportEvent::DataChannelOpened(channel) => {
                info!("data channel open");
                self.set_state(SessionState::Connected);
                self.emit(SessionEvent::ChannelOpen(channel));
            }
        }
    }

    /// Initiator path: fresh transport, channel, offer.
    async fn start_as_initiator(&mut self) -> Result<(), PeerError> {
        self.set_state(SessionState::Connecting);
        let connection = self
            .connector
            .create_connection(&self.ice_servers, self.transport_tx.clone())
            .await?;
        connection.create_data_channel("file-transfer").await?;
        let offer = connection.create_offer().await?;
        connection.set_local_description(&offer).await?;
        self.connection = Some(connection);
        self.remote_desc_set = false;
        self.send_signal(ClientMessage::Offer { sdp: offer });
        Ok(())
    }

    /// Joiner path: fresh transport (channel arrives via the open event),
    /// apply the offer, drain buffered candidates, answer.
    async fn accept_offer(&mut self, sdp: &str) -> Result<(), PeerError> {
        self.set_state(SessionState::Connecting);
        let connection = match &self.connection {
            Some(connection) => connection.clone(),
            None => {
                let connection = self
                    .connector
                    .create_connection(&self.ice_servers, self.transport_tx.clone())
                    .await?;
                self.connection = Some(connection.clone());
                connection
            }
        };
        connection.set_remote_description(sdp).await?;
        self.remote_desc_set = true;
        self.drain_pending_ice().await;
        let answer = connection.create_answer().await?;
        connection.set_local_description(&answer).await?;
        self.send_signal(ClientMessage::Answer { sdp: answer });
        Ok(())
    }

    async fn accept_answer(&mut self, sdp: &str) -> Result<(), PeerError> {
        let connection = self
            .connection
            .clone()
            .ok_or_else(|| PeerError::Sdp("answer received without a transport".into()))?;
        connection.set_remote_description(sdp).await?;
        self.remote_desc_set = true;
        self.drain_pending_ice().await;
        Ok(())
    }

    /// Candidates arriving before the remote description are buffered and
    /// drained, in arrival order, right after it is applied.
    async fn handle_remote_candidate(&mut self, candidate: IceCandidate) {
        let connection = match &self.connection {
            Some(connection) if self.remote_desc_set => connection.clone(),
            _ => {
                self.pending_ice.push(candidate);
                return;
            }
        };
        if let Err(err) = connection.add_ice_candidate(&candidate).await {
            warn!("failed to apply remote ICE candidate: {err}");
        }
    }

    async fn drain_pending_ice(&mut self) {
        let connection = match &self.connection {
            Some(connection) => connection.clone(),
            None => return,
        };
        for candidate in std::mem::take(&mut self.pending_ice) {
            if let Err(err) = connection.add_ice_candidate(&candidate).await {
                warn!("failed to apply buffered ICE candidate: {err}");
            }
        }
    }

    async fn fail_handshake(&mut self, context: &str, err: PeerError) {
        warn!("{context}: {err}");
        self.emit(SessionEvent::Error(format!("{context}: {err}")));
        self.teardown(SessionState::Failed).await;
    }

    /// Close the peer transport and discard handshake state. The signaling
    /// link survives.
    async fn teardown(&mut self, next: SessionState) {
        if let Some(connection) = self.connection.take() {
            connection.close().await;
        }
        self.pending_ice.clear();
        self.remote_desc_set = false;
        self.set_state(next);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            debug!("session state {:?} -> {state:?}", self.state);
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn send_signal(&self, message: ClientMessage) {
        if self.signal_tx.send(message).is_err() {
            warn!("signaling link gone, dropping outbound message");
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    struct MockConnector {
        log: Arc<Mutex<Vec<String>>>,
        fail_ice: bool,
        transport_tx: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
    }

    struct MockConnection {
        log: Arc<Mutex<Vec<String>>>,
        fail_ice: bool,
    }

    impl MockConnector {
        fn new(fail_ice: bool) -> Arc<Self> {
            Arc::new(Self {
                log: Arc::new(Mutex::new(Vec::new())),
                fail_ice,
                transport_tx: Arc::new(Mutex::new(None)),
            })
        }

        fn calls(&self) -> Vec<String> {
            self.log.lock().expect("log lock").clone()
        }

        fn push_event(&self, event: TransportEvent) {
            let guard = self.transport_tx.lock().expect("tx lock");
            guard
                .as_ref()
                .expect("connection created")
                .send(event)
                .expect("session alive");
        }
    }

    #[async_trait]
    impl PeerConnector for MockConnector {
        async fn create_connection(
            &self,
            _ice_servers: &[IceServer],
            events: mpsc::UnboundedSender<TransportEvent>,
        ) -> Result<Arc<dyn PeerConnection>, PeerError> {
            *self.transport_tx.lock().expect("tx lock") = Some(events);
            self.log.lock().expect("log lock").push("connect".into());
            Ok(Arc::new(MockConnection {
                log: self.log.clone(),
                fail_ice: self.fail_ice,
            }))
        }
    }

    #[async_trait]
    impl PeerConnection for MockConnection {
        async fn create_offer(&self) -> Result<String, PeerError> {
            self.log.lock().expect("log lock").push("create_offer".into());
            Ok("sdp-offer".into())
        }

        async fn create_answer(&self) -> Result<String, PeerError> {
            self.log.lock().expect("log lock").push("create_answer".into());
            Ok("sdp-answer".into())
        }

        async fn set_local_description(&self, sdp: &str) -> Result<(), PeerError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("set_local:{sdp}"));
            Ok(())
        }

        async fn set_remote_description(&self, sdp: &str) -> Result<(), PeerError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("set_remote:{sdp}"));
            Ok(())
        }

        async fn add_ice_candidate(&self, candidate: &IceCandidate) -> Result<(), PeerError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("add_ice:{}", candidate.candidate));
            if self.fail_ice {
                return Err(PeerError::Ice("mock rejection".into()));
            }
            Ok(())
        }

        async fn create_data_channel(&self, label: &str) -> Result<(), PeerError> {
            self.log
                .lock()
                .expect("log lock")
                .push(format!("create_channel:{label}"));
            Ok(())
        }

        async fn close(&self) {
            self.log.lock().expect("log lock").push("close".into());
        }
    }

    fn candidate(text: &str) -> IceCandidate {
        IceCandidate {
            candidate: text.into(),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
        }
    }

    struct Harness {
        connector: Arc<MockConnector>,
        signal_in: mpsc::UnboundedSender<SignalEvent>,
        signal_out: mpsc::UnboundedReceiver<ClientMessage>,
        events: mpsc::UnboundedReceiver<SessionEvent>,
        handle: SessionHandle,
    }

    fn harness(fail_ice: bool) -> Harness {
        let connector = MockConnector::new(fail_ice);
        let (signal_tx, signal_out) = mpsc::unbounded_channel();
        let (signal_in, signal_rx) = mpsc::unbounded_channel();
        let (handle, events) =
            PeerSession::spawn(signal_tx, signal_rx, connector.clone(), Vec::new());
        Harness {
            connector,
            signal_in,
            signal_out,
            events,
            handle,
        }
    }

    fn feed(harness: &Harness, message: ServerMessage) {
        harness
            .signal_in
            .send(SignalEvent::Message(message))
            .expect("session alive");
    }

    async fn next_event(harness: &mut Harness) -> SessionEvent {
        tokio::time::timeout(std::time::Duration::from_secs(1), harness.events.recv())
            .await
            .expect("event within deadline")
            .expect("session alive")
    }

    #[tokio::test]
    async fn initiator_offers_after_peer_joins() {
        let mut h = harness(false);
        feed(&h, ServerMessage::RoomCreated {
            room_id: "AB12CD".into(),
        });
        feed(&h, ServerMessage::PeerJoined);

        assert!(matches!(next_event(&mut h).await, SessionEvent::RoomCreated { .. }));
        assert!(matches!(next_event(&mut h).await, SessionEvent::PeerJoined));
        assert!(matches!(
            next_event(&mut h).await,
            SessionEvent::StateChanged(SessionState::Connecting)
        ));

        let outbound = h.signal_out.recv().await.expect("offer emitted");
        assert_eq!(outbound, ClientMessage::Offer { sdp: "sdp-offer".into() });
        assert_eq!(
            h.connector.calls(),
            vec![
                "connect",
                "create_channel:file-transfer",
                "create_offer",
                "set_local:sdp-offer",
            ]
        );
    }

    #[tokio::test]
    async fn joiner_buffers_early_candidates_and_answers() {
        let mut h = harness(false);
        feed(&h, ServerMessage::RoomJoined {
            room_id: "AB12CD".into(),
            is_initiator: false,
        });
        // Candidates trickle in before the offer lands.
        feed(&h, ServerMessage::IceCandidate {
            candidate: candidate("early-1"),
        });
        feed(&h, ServerMessage::IceCandidate {
            candidate: candidate("early-2"),
        });
        feed(&h, ServerMessage::Offer { sdp: "sdp-offer".into() });

        let outbound = h.signal_out.recv().await.expect("answer emitted");
        assert_eq!(outbound, ClientMessage::Answer { sdp: "sdp-answer".into() });
        assert_eq!(
            h.connector.calls(),
            vec![
                "connect",
                "set_remote:sdp-offer",
                "add_ice:early-1",
                "add_ice:early-2",
                "create_answer",
                "set_local:sdp-answer",
            ]
        );

        // A candidate after the remote description applies immediately.
        feed(&h, ServerMessage::IceCandidate {
            candidate: candidate("late"),
        });
        while !matches!(next_event(&mut h).await, SessionEvent::RoomJoined { .. }) {}
        for _ in 0..50 {
            if h.connector.calls().contains(&"add_ice:late".to_string()) {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert!(h.connector.calls().contains(&"add_ice:late".to_string()));
    }

    #[tokio::test]
    async fn ice_apply_failure_is_not_fatal() {
        let mut h = harness(true);
        feed(&h, ServerMessage::RoomJoined {
            room_id: "AB12CD".into(),
            is_initiator: false,
        });
        feed(&h, ServerMessage::IceCandidate {
            candidate: candidate("doomed"),
        });
        feed(&h, ServerMessage::Offer { sdp: "sdp-offer".into() });

        // The answer still goes out even though every candidate is rejected.
        let outbound = h.signal_out.recv().await.expect("answer emitted");
        assert_eq!(outbound, ClientMessage::Answer { sdp: "sdp-answer".into() });
        assert!(matches!(next_event(&mut h).await, SessionEvent::RoomJoined { .. }));
    }

    #[tokio::test]
    async fn channel_open_connects_and_peer_left_tears_down() {
        let mut h = harness(false);
        feed(&h, ServerMessage::RoomCreated {
            room_id: "AB12CD".into(),
        });
        feed(&h, ServerMessage::PeerJoined);
        let _ = h.signal_out.recv().await.expect("offer");
        feed(&h, ServerMessage::Answer { sdp: "sdp-answer".into() });

        let (alice, _bob) = crate::transport::memory::channel_pair();
        h.connector
            .push_event(TransportEvent::DataChannelOpened(Arc::new(alice)));

        let mut saw_connected = false;
        let mut saw_channel = false;
        for _ in 0..8 {
            match next_event(&mut h).await {
                SessionEvent::StateChanged(SessionState::Connected) => saw_connected = true,
                SessionEvent::ChannelOpen(_) => saw_channel = true,
                _ => {}
            }
            if saw_connected && saw_channel {
                break;
            }
        }
        assert!(saw_connected && saw_channel);

        feed(&h, ServerMessage::PeerLeft);
        let mut saw_disconnected = false;
        for _ in 0..4 {
            match next_event(&mut h).await {
                SessionEvent::StateChanged(SessionState::Disconnected) => {
                    saw_disconnected = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_disconnected);
        assert!(h.connector.calls().contains(&"close".to_string()));
    }

    #[tokio::test]
    async fn transport_failed_is_terminal() {
        let mut h = harness(false);
        feed(&h, ServerMessage::RoomCreated {
            room_id: "AB12CD".into(),
        });
        feed(&h, ServerMessage::PeerJoined);
        let _ = h.signal_out.recv().await.expect("offer");

        h.connector
            .push_event(TransportEvent::StateChanged(PeerTransportState::Failed));
        let mut saw_failed = false;
        for _ in 0..6 {
            if matches!(
                next_event(&mut h).await,
                SessionEvent::StateChanged(SessionState::Failed)
            ) {
                saw_failed = true;
                break;
            }
        }
        assert!(saw_failed);

        // Explicit cleanup re-enters idle.
        h.handle.reset();
        let mut saw_idle = false;
        for _ in 0..4 {
            if matches!(
                next_event(&mut h).await,
                SessionEvent::StateChanged(SessionState::Idle)
            ) {
                saw_idle = true;
                break;
            }
        }
        assert!(saw_idle);
    }
}
