//! Connected client bookkeeping for the game server
//!
//! This module tracks every client the server talks to:
//! - Connection lifecycle (connect, disconnect, silence timeout)
//! - Which game each client belongs to and which seat, if any, they hold
//! - Action sequence numbers, so replayed or reordered actions are refused
//! - The last view version sent, so unchanged views are not re-sent

use log::info;
use shared::{PlayerIndex, Viewer};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

/// Represents a connected client
#[derive(Debug)]
pub struct Client {
    /// Unique client identifier assigned by the server
    pub id: u32,
    /// Network address for sending responses
    pub addr: SocketAddr,
    pub game_id: String,
    /// Seat or spectator identity used for filtering and validation
    pub viewer: Viewer,
    /// Last time we received any packet from this client
    pub last_seen: Instant,
    /// Highest action sequence number accepted so far
    pub last_action_sequence: u32,
    /// Version of the last view sent, None before the first
    pub last_view_version: Option<u64>,
}

impl Client {
    pub fn new(id: u32, addr: SocketAddr, game_id: &str, viewer: Viewer) -> Self {
        Self {
            id,
            addr,
            game_id: game_id.to_string(),
            viewer,
            last_seen: Instant::now(),
            last_action_sequence: 0,
            last_view_version: None,
        }
    }

    /// Returns true if nothing has been heard from the client within `timeout`
    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JoinError {
    ServerFull,
    SeatTaken(PlayerIndex),
}

/// Manages all connected clients across hosted games
pub struct ClientManager {
    /// Connected clients indexed by their unique ID
    clients: HashMap<u32, Client>,
    /// Next available client ID for new connections
    next_client_id: u32,
    /// Maximum number of concurrent clients allowed
    max_clients: usize,
    /// Silence after which a client is dropped
    timeout: Duration,
}

impl ClientManager {
    pub fn new(max_clients: usize, timeout: Duration) -> Self {
        Self {
            clients: HashMap::new(),
            next_client_id: 1,
            max_clients,
            timeout,
        }
    }

    /// Attempts to add a new client to a game
    ///
    /// A `seat` of None joins as a spectator identified by the client id.
    /// Each seat of a game can be held by one client at a time.
    pub fn add_client(
        &mut self,
        addr: SocketAddr,
        game_id: &str,
        seat: Option<PlayerIndex>,
    ) -> Result<(u32, Viewer), JoinError> {
        if self.clients.len() >= self.max_clients {
            return Err(JoinError::ServerFull);
        }
        if let Some(seat) = seat {
            let taken = self
                .clients
                .values()
                .any(|client| client.game_id == game_id && client.viewer == Viewer::Player(seat));
            if taken {
                return Err(JoinError::SeatTaken(seat));
            }
        }

        let client_id = self.next_client_id;
        self.next_client_id += 1;

        let viewer = seat.map(Viewer::Player).unwrap_or(Viewer::Spectator(client_id));
        info!(
            "Client {} joined game {} as {:?} from {}",
            client_id, game_id, viewer, addr
        );
        self.clients
            .insert(client_id, Client::new(client_id, addr, game_id, viewer));

        Ok((client_id, viewer))
    }

    pub fn remove_client(&mut self, client_id: &u32) -> bool {
        if let Some(client) = self.clients.remove(client_id) {
            info!("Client {} disconnected", client.id);
            true
        } else {
            false
        }
    }

    pub fn get(&self, client_id: u32) -> Option<&Client> {
        self.clients.get(&client_id)
    }

    /// Finds a client ID by their network address
    pub fn find_client_by_addr(&self, addr: SocketAddr) -> Option<u32> {
        self.clients
            .iter()
            .find(|(_, client)| client.addr == addr)
            .map(|(id, _)| *id)
    }

    /// Refreshes the client's activity timestamp
    pub fn touch(&mut self, client_id: u32) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) => {
                client.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Records an action sequence number
    ///
    /// Returns false if the sequence is not newer than the last accepted one,
    /// which means the packet was replayed or arrived out of order.
    pub fn record_action(&mut self, client_id: u32, sequence: u32) -> bool {
        match self.clients.get_mut(&client_id) {
            Some(client) if sequence > client.last_action_sequence => {
                client.last_action_sequence = sequence;
                client.last_seen = Instant::now();
                true
            }
            _ => false,
        }
    }

    pub fn mark_view_sent(&mut self, client_id: u32, version: u64) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_view_version = Some(version);
        }
    }

    /// Forgets the last sent view so the next broadcast sends a fresh one
    pub fn reset_view(&mut self, client_id: u32) {
        if let Some(client) = self.clients.get_mut(&client_id) {
            client.last_view_version = None;
        }
    }

    /// Checks for and removes timed-out clients
    ///
    /// Returns the removed client IDs so other systems can clean up.
    pub fn check_timeouts(&mut self) -> Vec<u32> {
        let timeout = self.timeout;
        let timed_out: Vec<u32> = self
            .clients
            .iter()
            .filter(|(_, client)| client.is_timed_out(timeout))
            .map(|(id, _)| *id)
            .collect();

        for client_id in &timed_out {
            self.remove_client(client_id);
        }

        timed_out
    }

    /// Clients whose last view is older than `version`
    pub fn stale_viewers(&self, game_id: &str, version: u64) -> Vec<(u32, SocketAddr, Viewer)> {
        self.clients
            .values()
            .filter(|client| client.game_id == game_id)
            .filter(|client| client.last_view_version.map_or(true, |sent| sent < version))
            .map(|client| (client.id, client.addr, client.viewer))
            .collect()
    }

    pub fn get_client_addrs(&self) -> Vec<(u32, SocketAddr)> {
        self.clients
            .iter()
            .map(|(id, client)| (*id, client.addr))
            .collect()
    }

    /// Returns the number of currently connected clients
    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }
}
