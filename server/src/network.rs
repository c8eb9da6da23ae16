//! Server network layer handling UDP communications and the session loop

use crate::client_manager::{ClientManager, JoinError};
use crate::registry::{GameRegistry, RegistryConfig, SubmitOutcome};
use crate::resync::{ResyncStrategy, GAME_ID_KEY};
use crate::rules::BasicRules;
use log::{debug, error, info, warn};
use shared::error::classify;
use shared::recovery::{RecoveryConfig, RecoveryContext, RecoveryCoordinator};
use shared::{
    ClassificationHint, ErrorKind, GameState, Packet, ProtocolConfig, ProtocolRegistry,
    TypedError, Viewer, WireProtocol, MAX_PACKET_SIZE,
};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::interval;

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// How often changed views are pushed to clients
    pub tick_duration: Duration,
    pub max_clients: usize,
    /// Silence after which a client is dropped. Twice the client heartbeat interval.
    pub client_timeout: Duration,
    pub game_id: String,
    pub players: Vec<String>,
    pub integrity_check_interval: Duration,
    pub protocol: ProtocolConfig,
    pub registry: RegistryConfig,
    pub recovery: RecoveryConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8080".to_string(),
            tick_duration: Duration::from_millis(100),
            max_clients: 16,
            client_timeout: Duration::from_secs(60),
            game_id: "main".to_string(),
            players: vec!["alice".to_string(), "bob".to_string()],
            integrity_check_interval: Duration::from_secs(10),
            protocol: ProtocolConfig::default(),
            registry: RegistryConfig::default(),
            recovery: RecoveryConfig::default(),
        }
    }
}

/// Messages sent from network tasks to main server loop
#[derive(Debug)]
pub enum ServerMessage {
    PacketReceived { packet: Packet, addr: SocketAddr },
    ClientTimeout { client_id: u32 },
    Shutdown,
}

/// Messages sent from the session loop to the network sender
#[derive(Debug)]
pub enum GameMessage {
    SendPacket { packet: Packet, addr: SocketAddr },
}

/// Main server coordinating networking and hosted games
pub struct Server {
    config: ServerConfig,
    socket: Arc<UdpSocket>,
    protocol: Arc<WireProtocol>,
    clients: Arc<RwLock<ClientManager>>,
    registry: Arc<GameRegistry>,
    recovery: Arc<RecoveryCoordinator>,

    // Communication channels
    server_tx: mpsc::UnboundedSender<ServerMessage>,
    server_rx: mpsc::UnboundedReceiver<ServerMessage>,
    game_tx: mpsc::UnboundedSender<GameMessage>,
    game_rx: mpsc::UnboundedReceiver<GameMessage>,
}

impl Server {
    pub async fn new(config: ServerConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let socket = Arc::new(UdpSocket::bind(&config.bind_addr).await?);
        info!("Server listening on {}", socket.local_addr()?);

        let protocols = ProtocolRegistry::new(config.protocol.clone())?;
        let protocol = protocols.default_protocol();
        info!(
            "Using {} protocol version {}",
            protocol.protocol_name(),
            protocol.protocol_version()
        );

        let registry = Arc::new(GameRegistry::new(
            config.registry.clone(),
            Arc::new(BasicRules),
        ));
        registry.start();
        let names: Vec<&str> = config.players.iter().map(String::as_str).collect();
        registry.create_game(&config.game_id, GameState::new(&names))?;

        let recovery = Arc::new(RecoveryCoordinator::new(config.recovery.clone()));
        recovery.register_strategy(Arc::new(ResyncStrategy::new(Arc::clone(&registry))));

        let (server_tx, server_rx) = mpsc::unbounded_channel();
        let (game_tx, game_rx) = mpsc::unbounded_channel();

        Ok(Server {
            clients: Arc::new(RwLock::new(ClientManager::new(
                config.max_clients,
                config.client_timeout,
            ))),
            config,
            socket,
            protocol,
            registry,
            recovery,
            server_tx,
            server_rx,
            game_tx,
            game_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn registry(&self) -> &Arc<GameRegistry> {
        &self.registry
    }

    /// Sender the caller can use to stop [`run`](Self::run).
    pub fn shutdown_sender(&self) -> mpsc::UnboundedSender<ServerMessage> {
        self.server_tx.clone()
    }

    /// Spawns task that continuously listens for incoming packets
    fn spawn_network_receiver(&self) {
        let socket = Arc::clone(&self.socket);
        let protocol = Arc::clone(&self.protocol);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut buffer = vec![0u8; MAX_PACKET_SIZE];

            loop {
                match socket.recv_from(&mut buffer).await {
                    Ok((len, addr)) => match protocol.deserialize::<Packet>(&buffer[..len]) {
                        Ok(packet) => {
                            if let Err(e) =
                                server_tx.send(ServerMessage::PacketReceived { packet, addr })
                            {
                                error!("Failed to send packet to main loop: {}", e);
                                break;
                            }
                        }
                        Err(e) => {
                            let fault = classify(&e, Some(ClassificationHint::Serialization));
                            warn!("Dropping packet from {}: {}", addr, fault);
                        }
                    },
                    Err(e) => {
                        error!("Error receiving packet: {}", e);
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });
    }

    /// Spawns task that processes outgoing packet queue
    fn spawn_network_sender(&mut self) {
        let socket = Arc::clone(&self.socket);
        let protocol = Arc::clone(&self.protocol);
        let mut game_rx = std::mem::replace(&mut self.game_rx, mpsc::unbounded_channel().1);

        tokio::spawn(async move {
            while let Some(GameMessage::SendPacket { packet, addr }) = game_rx.recv().await {
                if let Err(e) = Self::send_packet_impl(&socket, &protocol, &packet, addr).await {
                    error!("Failed to send packet to {}: {}", addr, e);
                }
            }
        });
    }

    /// Spawns task that monitors client timeouts
    fn spawn_timeout_checker(&self) {
        let clients = Arc::clone(&self.clients);
        let server_tx = self.server_tx.clone();

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));

            loop {
                interval.tick().await;

                let timed_out = {
                    let mut clients_guard = clients.write().await;
                    clients_guard.check_timeouts()
                };

                for client_id in timed_out {
                    if let Err(e) = server_tx.send(ServerMessage::ClientTimeout { client_id }) {
                        error!("Failed to send timeout message: {}", e);
                        return;
                    }
                }
            }
        });
    }

    async fn send_packet_impl(
        socket: &UdpSocket,
        protocol: &WireProtocol,
        packet: &Packet,
        addr: SocketAddr,
    ) -> Result<(), Box<dyn std::error::Error>> {
        let data = protocol.serialize(packet)?;
        if data.len() > MAX_PACKET_SIZE {
            warn!("Packet of {} bytes to {} exceeds datagram size", data.len(), addr);
        }
        socket.send_to(&data, addr).await?;
        Ok(())
    }

    fn send_packet(&self, packet: Packet, addr: SocketAddr) {
        if let Err(e) = self.game_tx.send(GameMessage::SendPacket { packet, addr }) {
            error!("Failed to queue packet for sending: {}", e);
        }
    }

    fn reject_connection(&self, reason: String, addr: SocketAddr) {
        info!("Refusing connection from {}: {}", addr, reason);
        self.send_packet(Packet::Disconnected { reason }, addr);
    }

    async fn lookup(&self, addr: SocketAddr) -> Option<(u32, String, Viewer)> {
        let clients = self.clients.read().await;
        let client_id = clients.find_client_by_addr(addr)?;
        clients
            .get(client_id)
            .map(|client| (client.id, client.game_id.clone(), client.viewer))
    }

    async fn send_view(&self, client_id: u32, game_id: &str, viewer: Viewer, addr: SocketAddr) {
        let Some(session) = self.registry.get(game_id) else {
            warn!("Client {} belongs to missing game {}", client_id, game_id);
            return;
        };
        let view = session.view_for(viewer).await;
        let version = view.version;
        self.send_packet(
            Packet::View {
                view: (*view).clone(),
            },
            addr,
        );
        self.clients.write().await.mark_view_sent(client_id, version);
    }

    /// Processes incoming packets
    async fn handle_packet(&self, packet: Packet, addr: SocketAddr) {
        match packet {
            Packet::Connect {
                protocol_version,
                game_id,
                seat,
            } => {
                info!(
                    "Client connecting from {} (protocol {}, game {}, seat {:?})",
                    addr, protocol_version, game_id, seat
                );

                if !self.protocol.supports_version(&protocol_version) {
                    let fault = TypedError::new(
                        ErrorKind::ProtocolVersionMismatch,
                        format!(
                            "protocol version mismatch: server speaks {}, client sent {}",
                            self.protocol.protocol_version(),
                            protocol_version
                        ),
                    );
                    self.reject_connection(fault.message, addr);
                    return;
                }

                let Some(session) = self.registry.get(&game_id) else {
                    self.reject_connection(format!("unknown game {}", game_id), addr);
                    return;
                };
                if let Some(seat) = seat {
                    if seat >= session.player_count().await {
                        self.reject_connection(format!("game has no seat {}", seat), addr);
                        return;
                    }
                }

                // Remove existing connection if present
                let joined = {
                    let mut clients = self.clients.write().await;
                    if let Some(existing_id) = clients.find_client_by_addr(addr) {
                        info!("Removing existing client {} from {}", existing_id, addr);
                        clients.remove_client(&existing_id);
                    }
                    clients.add_client(addr, &game_id, seat)
                };

                match joined {
                    Ok((client_id, viewer)) => {
                        self.send_packet(Packet::Connected { client_id, viewer }, addr);
                        self.send_view(client_id, &game_id, viewer, addr).await;
                    }
                    Err(JoinError::ServerFull) => {
                        self.reject_connection("Server full".to_string(), addr);
                    }
                    Err(JoinError::SeatTaken(seat)) => {
                        self.reject_connection(format!("seat {} is taken", seat), addr);
                    }
                }
            }

            Packet::Action { sequence, action } => {
                let Some((client_id, game_id, viewer)) = self.lookup(addr).await else {
                    warn!("Action from unknown client at {}", addr);
                    return;
                };

                let in_order = self.clients.write().await.record_action(client_id, sequence);
                if !in_order {
                    let fault = TypedError::new(
                        ErrorKind::ProtocolOutOfOrder,
                        format!("action {} from client {} is out of order", sequence, client_id),
                    );
                    warn!("{}", fault);
                    self.send_packet(
                        Packet::ActionResult {
                            sequence,
                            accepted: false,
                            reason: Some(fault.message),
                        },
                        addr,
                    );
                    return;
                }

                let (accepted, reason) =
                    match self.registry.submit_action(&game_id, viewer, &action).await {
                        Ok(SubmitOutcome::Applied { version }) => {
                            debug!(
                                "Applied {:?} from client {} (version {})",
                                action.kind(),
                                client_id,
                                version
                            );
                            (true, None)
                        }
                        Ok(SubmitOutcome::Rejected(reason)) => (false, Some(reason.to_string())),
                        Err(e) => {
                            error!("Failed to apply action from client {}: {}", client_id, e);
                            (false, Some(e.to_string()))
                        }
                    };
                self.send_packet(
                    Packet::ActionResult {
                        sequence,
                        accepted,
                        reason,
                    },
                    addr,
                );
            }

            Packet::RequestResync { known_version } => {
                let Some((client_id, game_id, viewer)) = self.lookup(addr).await else {
                    warn!("Resync request from unknown client at {}", addr);
                    return;
                };
                info!(
                    "Client {} requested resync from version {}",
                    client_id, known_version
                );
                self.clients.write().await.touch(client_id);
                self.send_view(client_id, &game_id, viewer, addr).await;
            }

            Packet::Heartbeat { timestamp } => {
                let known = match self.lookup(addr).await {
                    Some((client_id, _, _)) => self.clients.write().await.touch(client_id),
                    None => false,
                };
                if known {
                    self.send_packet(Packet::HeartbeatAck { timestamp }, addr);
                } else {
                    debug!("Heartbeat from unknown client at {}", addr);
                }
            }

            Packet::Disconnect => {
                let mut clients = self.clients.write().await;
                if let Some(client_id) = clients.find_client_by_addr(addr) {
                    clients.remove_client(&client_id);
                }
            }

            _ => {
                warn!("Unexpected packet type from client at {}", addr);
            }
        }
    }

    /// Sends a fresh view to every client whose last view is out of date
    async fn broadcast_views(&self) {
        for game_id in self.registry.game_ids() {
            let Some(session) = self.registry.get(&game_id) else {
                continue;
            };
            let version = session.authority().version();
            let stale = self.clients.read().await.stale_viewers(&game_id, version);

            for (client_id, addr, viewer) in stale {
                self.send_view(client_id, &game_id, viewer, addr).await;
            }
        }
    }

    /// Runs integrity checks and hands corrupted games to the recovery coordinator
    async fn check_integrity(&self) {
        for game_id in self.registry.game_ids() {
            let Some(session) = self.registry.get(&game_id) else {
                continue;
            };
            if let Err(fault) = session.check_integrity().await {
                error!("{}", fault);
                let context = RecoveryContext::from([(GAME_ID_KEY.to_string(), game_id.clone())]);
                let handle = self.recovery.spawn_recover(fault, context);
                tokio::spawn(async move {
                    match handle.outcome().await {
                        Some(outcome) => info!(
                            "Recovery of game {} finished: {}",
                            game_id,
                            outcome.result.message()
                        ),
                        None => warn!("Recovery of game {} was cancelled", game_id),
                    }
                });
            }
        }
    }

    async fn shutdown(&self) {
        let client_addrs = self.clients.read().await.get_client_addrs();
        let farewell = Packet::Disconnected {
            reason: "server shutting down".to_string(),
        };
        for (client_id, addr) in client_addrs {
            if let Err(e) =
                Self::send_packet_impl(&self.socket, &self.protocol, &farewell, addr).await
            {
                error!("Failed to send to client {}: {}", client_id, e);
            }
        }

        self.registry.shutdown();
        self.recovery.shutdown();
    }

    /// Main server loop coordinating all operations
    pub async fn run(&mut self) -> Result<(), Box<dyn std::error::Error>> {
        self.spawn_network_receiver();
        self.spawn_network_sender();
        self.spawn_timeout_checker();

        let mut tick_interval = interval(self.config.tick_duration);
        let mut integrity_interval = interval(self.config.integrity_check_interval);

        info!("Server started successfully, hosting game {}", self.config.game_id);

        loop {
            tokio::select! {
                message = self.server_rx.recv() => {
                    match message {
                        Some(ServerMessage::PacketReceived { packet, addr }) => {
                            self.handle_packet(packet, addr).await;
                        },
                        Some(ServerMessage::ClientTimeout { client_id }) => {
                            info!("Client {} timed out", client_id);
                        },
                        Some(ServerMessage::Shutdown) | None => {
                            info!("Server shutting down");
                            self.shutdown().await;
                            break;
                        }
                    }
                },

                _ = tick_interval.tick() => {
                    self.broadcast_views().await;
                },

                _ = integrity_interval.tick() => {
                    self.check_integrity().await;
                },
            }
        }

        Ok(())
    }
}
