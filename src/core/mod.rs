// src/core/mod.rs

//! The central module containing the core data structures shared by the
//! watcher engine and its admin surface.

pub mod errors;
pub mod protocol;

pub use errors::VigilError;
pub use protocol::RespValue;
