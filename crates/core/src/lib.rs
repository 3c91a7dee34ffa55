//! Session orchestration and pipeline engine for real-time voice dialogue.
//!
//! The [`session::SessionManager`] is the entry point. Everything vendor
//! specific sits behind the traits in [`stage`] and [`transport`].

pub mod audio;
pub mod context;
pub mod floor;
pub mod llm_client;
pub mod mock;
pub mod persistence;
pub mod pipeline;
pub mod sentence;
pub mod session;
pub mod stage;
pub mod tools;
pub mod transport;
pub mod turn;

pub use session::{SessionError, SessionManager, SessionStatus};
pub use turn::{Speaker, Turn};
