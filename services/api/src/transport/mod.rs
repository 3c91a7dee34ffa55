//! Media Transport
//!
//! The browser negotiates over HTTP and then streams audio over a WebSocket:
//!
//! - `sdp`: offer validation and answer construction.
//! - `negotiator`: the [`TransportNegotiator`](vaani_core::transport::TransportNegotiator)
//!   that parks media slots until the socket attaches.
//! - `socket`: the per-call pump between the socket and the pipeline.
//! - `protocol`: JSON control messages carried alongside the audio.

pub mod negotiator;
pub mod protocol;
pub mod sdp;
pub mod socket;

pub use negotiator::WsNegotiator;
pub use socket::run_media_socket;
