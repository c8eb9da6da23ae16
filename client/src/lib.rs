//! # Card Game Client Library
//!
//! This library provides the client side of the card game session: it joins a
//! game over UDP, keeps the latest filtered view the server sent, submits
//! actions, and keeps the session alive across transient network failures.
//!
//! ## Architecture Overview
//!
//! The client never holds authoritative state. Everything it knows about the
//! game arrives as a [`FilteredView`](shared::FilteredView) already stripped of
//! information it is not entitled to. The interesting work on this side is
//! keeping the link up.
//!
//! ### Connection Resilience
//! Each drop is classified into a disconnect reason. Network errors, lost
//! connections and heartbeat timeouts trigger an exponential backoff schedule
//! with a bounded number of attempts. User closes and protocol errors do not.
//!
//! ### Resynchronization
//! After the transport comes back the client rejoins its seat and asks the
//! server for a fresh view, since anything sent while it was away is lost.
//!
//! ## Module Organization
//!
//! ### Transport Module (`transport`)
//! - The byte transport trait the connection manager drives
//! - A UDP implementation that rebinds its local port on reconnect
//!
//! ### Connection Module (`connection`)
//! - Connection state machine and observer notifications
//! - Backoff schedule and heartbeat expiry
//! - The reconnect recovery strategy
//!
//! ### Network Module (`network`)
//! - Session loop: join, views, actions, heartbeats
//! - Recovery through the shared recovery coordinator
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use client::network::{Client, ClientConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut client = Client::new(ClientConfig {
//!         server_addr: "127.0.0.1:8080".to_string(),
//!         seat: Some(0),
//!         ..Default::default()
//!     })?;
//!
//!     client.run().await?;
//!     Ok(())
//! }
//! ```

pub mod connection;
pub mod network;
pub mod transport;
