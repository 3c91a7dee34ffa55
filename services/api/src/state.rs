//! Shared Application State
//!
//! Created once at startup and handed to every handler.

use crate::{config::Config, transport::WsNegotiator};
use std::sync::Arc;
use vaani_core::SessionManager;

#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    /// Also registered with `sessions`; handlers use it to attach media sockets.
    pub negotiator: Arc<WsNegotiator>,
    pub config: Arc<Config>,
}
