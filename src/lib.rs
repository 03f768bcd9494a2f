//! culvert - a WebSocket VLESS tunnel terminator.
//!
//! Accepts plain-TCP HTTP connections, upgrades WebSocket requests, and
//! terminates VLESS-style tunnels over them: plain TCP proxying, a
//! DNS-over-HTTPS fast path for UDP port 53, and Mux.Cool multiplexed
//! sub-streams. Tunnels authenticate against a dynamically refreshed
//! set of authorized user UUIDs served from a tiered cache.
//!
//! TLS termination is expected to happen in front of this process (a
//! reverse proxy or fronting CDN); outbound HTTPS (DoH, the UUID panel,
//! traffic reporting) is handled here.

pub mod address;
pub mod auth;
pub mod config;
pub mod dns;
pub mod http_client;
pub mod http_server;
pub mod mux;
pub mod outbound;
pub mod stats;
pub mod tunnel;
pub mod util;
pub mod uuid_util;
pub mod vless;
pub mod websocket;
