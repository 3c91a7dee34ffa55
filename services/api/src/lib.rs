//! Vaani API Library Crate
//!
//! Configuration, persistence, stage adapters, media transport and the HTTP
//! surface of the voice service. The `api` binary is a thin wrapper around
//! this library.

pub mod audio_utils;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod provider;
pub mod router;
pub mod state;
pub mod transport;
