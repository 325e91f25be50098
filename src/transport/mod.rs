//! # Transport Layer
//!
//! Destinations for outbound packets and the receive loops for inbound ones.
//!
//! ## Wire formats
//! - **TCP**: `[u32 LE frame length] [i32 LE type id] [payload]`
//! - **UDP**: `[i32 LE type id] [payload]`, one packet per datagram

pub mod endpoint;
pub mod recipient;

pub use endpoint::{run_tcp_loop, run_udp_loop, LoopExit};
pub use recipient::Recipient;
