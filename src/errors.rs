use std::io;

use thiserror::Error;

use crate::entitlement::DenialCode;

#[derive(Error, Debug)]
pub enum ForgeError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),
    #[error("HTTP error: {0}")]
    Http(String),
    /// Error text supplied by the remote service, passed through verbatim.
    #[error("{0}")]
    Remote(String),
    /// The requested bundle does not exist remotely. Not a transport failure.
    #[error("{0}")]
    NotAvailable(String),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Structural archive problem: unreadable, unreconstructable, or empty.
    #[error("Archive error: {0}")]
    Archive(String),
    /// A required external tool is absent from the environment.
    #[error("Missing component: {0}")]
    MissingComponent(String),
    #[error("{}", .0.message())]
    Entitlement(DenialCode),
    #[error("Already applied; remove the existing patch first")]
    AlreadyApplied,
    #[error("Nothing to remove")]
    NothingToRemove,
    #[error("Busy: {0}")]
    Busy(String),
    #[error("Cancelled by user")]
    Cancelled,
    #[error("Config error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, ForgeError>;
