use crate::connection::{
    ConnectionConfig, ConnectionError, ConnectionManager, DisconnectReason, ReconnectStrategy,
};
use crate::transport::{Transport, UdpTransport};
use log::{debug, info, warn};
use shared::error::{classify, classify_message_only, TypedError};
use shared::protocol::{UnknownProtocol, PROTOCOL_VERSION};
use shared::recovery::{RecoveryConfig, RecoveryContext, RecoveryCoordinator};
use shared::{
    timestamp_millis, ClassificationHint, FilteredView, Packet, PlayerAction, PlayerIndex,
    ProtocolConfig, ProtocolRegistry, SerializationError, Viewer, WireProtocol,
};
use std::net::{AddrParseError, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::interval;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Serialization(#[from] SerializationError),
    #[error(transparent)]
    Protocol(#[from] UnknownProtocol),
    #[error("invalid server address: {0}")]
    Address(#[from] AddrParseError),
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub server_addr: String,
    pub game_id: String,
    /// Seat to claim, or None to spectate
    pub seat: Option<PlayerIndex>,
    /// Pass priority automatically whenever this client holds it
    pub auto_pass: bool,
    pub connection: ConnectionConfig,
    pub protocol: ProtocolConfig,
    pub recovery: RecoveryConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        let connection = ConnectionConfig::default();
        // The reconnect strategy runs the whole backoff schedule inside one
        // recovery session.
        let recovery = RecoveryConfig {
            timeout: connection.reconnect.worst_case_wait() + Duration::from_secs(10),
            ..Default::default()
        };
        Self {
            server_addr: "127.0.0.1:8080".to_string(),
            game_id: "main".to_string(),
            seat: None,
            auto_pass: false,
            connection,
            protocol: ProtocolConfig::default(),
            recovery,
        }
    }
}

pub struct Client<T: Transport + 'static> {
    config: ClientConfig,
    protocol: Arc<WireProtocol>,
    connection: Arc<ConnectionManager<T>>,
    recovery: RecoveryCoordinator,

    client_id: Option<u32>,
    viewer: Option<Viewer>,
    view: Option<FilteredView>,
    next_sequence: u32,
    last_auto_pass: Option<u64>,
    ping_ms: u64,
    closed_by_server: Option<TypedError>,
}

impl Client<UdpTransport> {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let server_addr: SocketAddr = config.server_addr.parse()?;
        Self::with_transport(config, Arc::new(UdpTransport::new(server_addr)))
    }
}

impl<T: Transport + 'static> Client<T> {
    pub fn with_transport(config: ClientConfig, transport: Arc<T>) -> Result<Self, ClientError> {
        let protocol = ProtocolRegistry::new(config.protocol.clone())?.default_protocol();
        let connection = Arc::new(ConnectionManager::new(transport, config.connection.clone()));
        connection
            .listeners()
            .subscribe(|event| debug!("Connection event: {:?}", event));

        let recovery = RecoveryCoordinator::new(config.recovery.clone());
        recovery.register_strategy(Arc::new(ReconnectStrategy::new(Arc::clone(&connection))));

        Ok(Client {
            config,
            protocol,
            connection,
            recovery,
            client_id: None,
            viewer: None,
            view: None,
            next_sequence: 0,
            last_auto_pass: None,
            ping_ms: 0,
            closed_by_server: None,
        })
    }

    pub fn connection(&self) -> &Arc<ConnectionManager<T>> {
        &self.connection
    }

    pub fn client_id(&self) -> Option<u32> {
        self.client_id
    }

    pub fn viewer(&self) -> Option<Viewer> {
        self.viewer
    }

    pub fn view(&self) -> Option<&FilteredView> {
        self.view.as_ref()
    }

    pub fn ping_ms(&self) -> u64 {
        self.ping_ms
    }

    /// Why the server ended the session, if it did.
    pub fn server_fault(&self) -> Option<&TypedError> {
        self.closed_by_server.as_ref()
    }

    async fn send_packet(&self, packet: &Packet) -> Result<(), ClientError> {
        let data = self.protocol.serialize(packet)?;
        self.connection.send(&data).await?;
        Ok(())
    }

    async fn join(&self) -> Result<(), ClientError> {
        self.send_packet(&Packet::Connect {
            protocol_version: PROTOCOL_VERSION.to_string(),
            game_id: self.config.game_id.clone(),
            seat: self.config.seat,
        })
        .await
    }

    pub async fn connect(&mut self) -> Result<(), ClientError> {
        info!("Connecting to server...");
        self.connection.connect().await?;
        self.join().await
    }

    /// Sends an action and returns its sequence number.
    pub async fn submit(&mut self, action: PlayerAction) -> Result<u32, ClientError> {
        self.next_sequence += 1;
        let sequence = self.next_sequence;
        self.send_packet(&Packet::Action { sequence, action }).await?;
        Ok(sequence)
    }

    fn holds_priority(&self) -> bool {
        let (Some(view), Some(seat)) = (&self.view, self.viewer.and_then(|v| v.player_index()))
        else {
            return false;
        };
        !view.game_over
            && view
                .phase
                .as_ref()
                .is_some_and(|phase| phase.priority_player == Some(seat))
    }

    /// Stores a newer view. Views older than the current one are dropped.
    fn apply_view(&mut self, view: FilteredView) -> bool {
        if let Some(current) = &self.view {
            if view.version < current.version {
                debug!(
                    "Ignoring stale view {} (have {})",
                    view.version, current.version
                );
                return false;
            }
        }

        info!(
            "View {}: {} players, {} on the stack{}",
            view.version,
            view.players.len(),
            view.stack.len(),
            if view.game_over { ", game over" } else { "" }
        );
        for player in &view.players {
            debug!(
                "  {} life {} hand {:?}",
                player.name,
                player.life,
                view.hand_size(player.index)
            );
        }
        self.view = Some(view);
        true
    }

    async fn handle_packet(&mut self, packet: Packet) -> Result<(), ClientError> {
        match packet {
            Packet::Connected { client_id, viewer } => {
                info!("Connected! Client ID: {} as {:?}", client_id, viewer);
                self.client_id = Some(client_id);
                self.viewer = Some(viewer);
                self.connection.confirm_session();
            }

            Packet::View { view } => {
                if self.apply_view(view) && self.config.auto_pass && self.holds_priority() {
                    let version = self.view.as_ref().map(|v| v.version);
                    if self.last_auto_pass != version {
                        self.last_auto_pass = version;
                        self.submit(PlayerAction::PassPriority).await?;
                    }
                }
            }

            Packet::ActionResult {
                sequence,
                accepted,
                reason,
            } => {
                if accepted {
                    debug!("Action {} accepted", sequence);
                } else {
                    warn!(
                        "Action {} rejected: {}",
                        sequence,
                        reason.as_deref().unwrap_or("no reason given")
                    );
                }
            }

            Packet::HeartbeatAck { timestamp } => {
                self.ping_ms = timestamp_millis().saturating_sub(timestamp);
                debug!("Ping: {}ms", self.ping_ms);
            }

            Packet::Disconnected { reason } => {
                let fault = classify_message_only(&reason, Some(ClassificationHint::Handshake));
                warn!("Disconnected by server: {} ({:?})", reason, fault.kind);
                self.closed_by_server = Some(fault);
                self.client_id = None;
            }

            _ => {
                warn!("Unexpected packet type");
            }
        }
        Ok(())
    }

    /// Reconnects through the recovery coordinator, rejoins and asks for a
    /// fresh view. Returns false if the session cannot continue.
    async fn recover_connection(&mut self, reason: DisconnectReason) -> Result<bool, ClientError> {
        if !self.connection.should_reconnect(&reason) {
            warn!("Not reconnecting after {}", reason);
            return Ok(false);
        }

        let context = RecoveryContext::from([("reason".to_string(), reason.to_string())]);
        let outcome = self.recovery.recover(reason.to_error(), context).await;
        if !outcome.result.is_success() {
            warn!("Could not recover connection: {}", outcome.result.message());
            return Ok(false);
        }

        self.join().await?;
        let known_version = self.view.as_ref().map_or(0, |view| view.version);
        info!("Requesting resync from version {}", known_version);
        self.send_packet(&Packet::RequestResync { known_version })
            .await?;
        Ok(true)
    }

    /// Turns a lost connection into a recovery attempt. Returns false if the
    /// session is over.
    async fn keep_alive(&mut self, result: Result<(), ClientError>) -> Result<bool, ClientError> {
        match result {
            Ok(()) => Ok(true),
            Err(ClientError::Connection(ConnectionError::Lost(reason))) => {
                self.recover_connection(reason).await
            }
            Err(e) => Err(e),
        }
    }

    async fn process(&mut self, bytes: &[u8]) -> Result<(), ClientError> {
        match self.protocol.deserialize::<Packet>(bytes) {
            Ok(packet) => self.handle_packet(packet).await,
            Err(e) => {
                let fault = classify(&e, Some(ClassificationHint::Serialization));
                warn!("Dropping packet from server: {}", fault);
                Ok(())
            }
        }
    }

    pub async fn run(&mut self) -> Result<(), ClientError> {
        self.closed_by_server = None;
        self.connect().await?;

        let connection = Arc::clone(&self.connection);
        let mut heartbeat = interval(self.config.connection.heartbeat.interval);
        // First tick fires immediately
        heartbeat.tick().await;

        loop {
            let alive = tokio::select! {
                received = connection.receive() => {
                    let handled = match received {
                        Ok(bytes) => self.process(&bytes).await,
                        Err(e) => Err(e.into()),
                    };
                    self.keep_alive(handled).await?
                },

                _ = heartbeat.tick() => {
                    if connection.heartbeat_expired() {
                        warn!("Heartbeat timed out");
                        connection.mark_disconnected(DisconnectReason::HeartbeatTimeout);
                        self.recover_connection(DisconnectReason::HeartbeatTimeout).await?
                    } else {
                        let sent = self
                            .send_packet(&Packet::Heartbeat { timestamp: timestamp_millis() })
                            .await;
                        self.keep_alive(sent).await?
                    }
                },
            };

            if let Some(fault) = &self.closed_by_server {
                let reason = DisconnectReason::ServerClosed(fault.message.clone());
                connection.mark_disconnected(reason);
                break;
            }
            if !alive {
                break;
            }
        }

        self.connection.close().await;
        self.recovery.shutdown();
        info!("Client stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::tests::ScriptedTransport;
    use crate::connection::ConnectionState;
    use shared::state::{Phase, PhaseState};
    use shared::{ErrorCategory, ErrorKind};
    use std::io;

    fn protocol() -> Arc<WireProtocol> {
        ProtocolRegistry::new(ProtocolConfig::default())
            .unwrap()
            .default_protocol()
    }

    fn encode(packet: &Packet) -> Vec<u8> {
        protocol().serialize(packet).unwrap()
    }

    fn sent_packets(transport: &ScriptedTransport) -> Vec<Packet> {
        transport
            .sent
            .lock()
            .iter()
            .map(|bytes| protocol().deserialize(bytes).unwrap())
            .collect()
    }

    fn view(version: u64, priority: Option<usize>) -> FilteredView {
        FilteredView {
            viewer: Viewer::Player(0),
            version,
            players: Vec::new(),
            stack: Vec::new(),
            pending_triggers: 0,
            phase: Some(PhaseState {
                phase: Phase::MainOne,
                turn: 1,
                active_player: 0,
                priority_player: priority,
            }),
            game_over: false,
        }
    }

    fn client(transport: &Arc<ScriptedTransport>, seat: Option<usize>) -> Client<ScriptedTransport> {
        Client::with_transport(
            ClientConfig {
                seat,
                auto_pass: true,
                ..Default::default()
            },
            Arc::clone(transport),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_connect_sends_join_request() {
        let transport = ScriptedTransport::with_connects(&[true]);
        let mut client = client(&transport, Some(1));

        client.connect().await.unwrap();

        assert_eq!(
            sent_packets(&transport),
            vec![Packet::Connect {
                protocol_version: PROTOCOL_VERSION.to_string(),
                game_id: "main".to_string(),
                seat: Some(1),
            }]
        );
    }

    #[tokio::test]
    async fn test_stale_views_are_ignored() {
        let transport = ScriptedTransport::with_connects(&[true]);
        let mut client = client(&transport, Some(0));

        client.handle_packet(Packet::View { view: view(5, None) }).await.unwrap();
        client.handle_packet(Packet::View { view: view(3, None) }).await.unwrap();

        assert_eq!(client.view().map(|v| v.version), Some(5));
    }

    #[tokio::test]
    async fn test_auto_pass_once_per_version() {
        let transport = ScriptedTransport::with_connects(&[true]);
        let mut client = client(&transport, Some(0));
        client.connect().await.unwrap();
        client
            .handle_packet(Packet::Connected {
                client_id: 4,
                viewer: Viewer::Player(0),
            })
            .await
            .unwrap();

        client.handle_packet(Packet::View { view: view(2, Some(0)) }).await.unwrap();
        client.handle_packet(Packet::View { view: view(2, Some(0)) }).await.unwrap();
        client.handle_packet(Packet::View { view: view(3, Some(1)) }).await.unwrap();

        let actions: Vec<Packet> = sent_packets(&transport)
            .into_iter()
            .filter(|packet| matches!(packet, Packet::Action { .. }))
            .collect();
        assert_eq!(
            actions,
            vec![Packet::Action {
                sequence: 1,
                action: PlayerAction::PassPriority
            }]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_rejoins_and_requests_resync() {
        let transport = ScriptedTransport::with_connects(&[true, true]);
        let mut client = client(&transport, Some(0));
        client.connect().await.unwrap();
        client.handle_packet(Packet::View { view: view(9, None) }).await.unwrap();

        client
            .connection()
            .mark_disconnected(DisconnectReason::ConnectionLost);
        assert!(client
            .recover_connection(DisconnectReason::ConnectionLost)
            .await
            .unwrap());

        let packets = sent_packets(&transport);
        assert_eq!(
            &packets[packets.len() - 1],
            &Packet::RequestResync { known_version: 9 }
        );
        assert!(matches!(packets[packets.len() - 2], Packet::Connect { .. }));
        assert!(client.connection().is_connected());
    }

    #[tokio::test]
    async fn test_protocol_error_is_not_recovered() {
        let transport = ScriptedTransport::with_connects(&[true]);
        let mut client = client(&transport, None);
        client.connect().await.unwrap();

        assert!(!client
            .recover_connection(DisconnectReason::ProtocolError)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_run_stops_when_server_closes_session() {
        let transport = ScriptedTransport::with_connects(&[true]);
        {
            let mut inbox = transport.inbox.lock();
            inbox.push_back(Ok(encode(&Packet::Connected {
                client_id: 1,
                viewer: Viewer::Spectator(1),
            })));
            inbox.push_back(Ok(b"not a frame".to_vec()));
            inbox.push_back(Ok(encode(&Packet::Disconnected {
                reason: "server shutting down".to_string(),
            })));
        }
        let mut client = client(&transport, None);

        client.run().await.unwrap();

        assert_eq!(client.connection().state(), ConnectionState::Terminated);
        assert_eq!(client.viewer(), Some(Viewer::Spectator(1)));
        let fault = client.server_fault().unwrap();
        assert_eq!(fault.kind, ErrorKind::Application);
        assert!(!fault.recoverable);
    }

    #[tokio::test]
    async fn test_version_refusal_is_classified_as_protocol_fault() {
        let transport = ScriptedTransport::with_connects(&[true]);
        transport.inbox.lock().push_back(Ok(encode(&Packet::Disconnected {
            reason: "protocol version mismatch: server speaks 1.0, client sent 0.1".to_string(),
        })));
        let mut client = client(&transport, Some(0));

        client.run().await.unwrap();

        let fault = client.server_fault().unwrap();
        assert_eq!(fault.kind, ErrorKind::ProtocolVersionMismatch);
        assert_eq!(fault.category, ErrorCategory::Protocol);
        assert_eq!(client.connection().state(), ConnectionState::Terminated);
        assert_eq!(transport.connect_calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_gives_up_after_exhausting_reconnects() {
        let transport = ScriptedTransport::with_connects(&[true, false, false, false, false, false]);
        transport
            .inbox
            .lock()
            .push_back(Err(io::ErrorKind::ConnectionReset));
        let mut client = client(&transport, Some(0));

        client.run().await.unwrap();

        assert_eq!(client.connection().state(), ConnectionState::Terminated);
        assert_eq!(transport.connect_calls.load(std::sync::atomic::Ordering::SeqCst), 6);
    }
}
