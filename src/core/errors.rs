// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, representing all possible failures within the watcher.
/// Using `thiserror` keeps the definitions clean and gives us automatic `From`
/// implementations where they matter.
#[derive(Error, Debug, Clone)]
pub enum VigilError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Incomplete data in stream")]
    IncompleteData,

    #[error("Syntax error")]
    SyntaxError,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Unknown command '{0}'")]
    UnknownCommand(String),

    #[error("Wrong number of arguments for '{0}' command")]
    WrongArgumentCount(String),

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    // --- Configuration errors: rejected synchronously, no state mutated. ---
    #[error("Duplicate master name '{0}'")]
    DuplicateName(String),

    #[error("Duplicate replica address {0}")]
    DuplicateAddress(String),

    #[error("Duplicate watcher identity {0}")]
    DuplicateIdentity(String),

    #[error("Can't resolve instance hostname '{0}'")]
    UnresolvableHost(String),

    #[error("Invalid port number '{0}'")]
    InvalidPort(String),

    #[error("Invalid value for parameter '{0}'")]
    InvalidParameter(String),

    // --- Admin surface errors, mapped 1:1 onto RESP error replies. ---
    #[error("No such master with that name")]
    NoSuchPrimary,

    #[error("INPROG Failover already in progress")]
    FailoverInProgress,

    #[error("NOGOODSLAVE No suitable replica to promote")]
    NoSuitableReplica,

    #[error("NOQUORUM {0}")]
    InsufficientQuorum(String),
}

impl From<std::io::Error> for VigilError {
    fn from(e: std::io::Error) -> Self {
        VigilError::Io(Arc::new(e))
    }
}
