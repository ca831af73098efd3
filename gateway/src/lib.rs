//! # Gateway Module
//!
//! Bridges an Asterisk-style PBX speaking WebSocket control+media and
//! browser softphones connected over TLS WebSockets.
//!
//! For each inbound PBX leg the gateway resolves a target extension,
//! claims a registered browser session (directly or through a ring
//! group), negotiates ring/answer/hangup and then forwards opaque
//! binary audio frames both ways until either peer terminates.
//!
//! ## Core Components
//!
//! - **registry / session**: one live session per extension, with the
//!   Idle/Ringing/Talking state machine and the serialized browser
//!   writer
//! - **router**: direct-call claim plus the two group strategies
//!   (parallel ring-all with a single winner, sequential hunt)
//! - **bridge**: the full-duplex media pump after a call is claimed
//! - **server**: the two WebSocket listeners and their handlers
//! - **pbx**: the two PBX hello framings and command encoding
//! - **acl / auth / config**: IP allow-lists, bearer-token
//!   verification, static configuration

pub mod acl;
pub mod auth;
pub mod bridge;
pub mod config;
pub mod pbx;
pub mod registry;
pub mod router;
pub mod server;
pub mod session;
