// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::num::{ParseFloatError, ParseIntError};
use thiserror::Error;

/// The main error enum, representing all possible failures within the
/// coordinator. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    ProtocolError(String),

    #[error("Unexpected reply: {0}")]
    UnexpectedReply(String),

    #[error("Sensor key missing or unreadable: {0}")]
    MissingKey(String),

    #[error("Value is not an integer or out of range")]
    NotAnInteger,

    #[error("Value is not a valid float")]
    NotAFloat,

    #[error("Stale target for {0}")]
    StaleTarget(String),

    #[error("Unusable target description: {0}")]
    BadTarget(String),

    #[error("Bad schedule block id: {0}")]
    BadScheduleBlock(String),

    #[error("Bad stream endpoint: {0}")]
    BadEndpoint(String),

    #[error("Implausible PKTSTART for {0}")]
    BadPktstart(String),

    #[error("No active DAQ instances for {0}")]
    NoActiveInstances(String),

    #[error("Bad instance name '{0}', expected host/index")]
    BadInstance(String),

    #[error("Unrecognised message: {0}")]
    UnrecognisedMessage(String),

    #[error("Process control failed: {0}")]
    ControlError(String),

    #[error("Calibration solutions unavailable: {0}")]
    CalUnavailable(String),

    #[error("HTTP client error: {0}")]
    HttpClientError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

// --- From trait implementations for easy error conversion ---

impl From<reqwest::Error> for CoordinatorError {
    fn from(e: reqwest::Error) -> Self {
        CoordinatorError::HttpClientError(e.to_string())
    }
}

impl From<serde_json::Error> for CoordinatorError {
    fn from(e: serde_json::Error) -> Self {
        CoordinatorError::Internal(format!("JSON serialization/deserialization error: {e}"))
    }
}

impl From<ParseIntError> for CoordinatorError {
    fn from(_: ParseIntError) -> Self {
        CoordinatorError::NotAnInteger
    }
}

impl From<ParseFloatError> for CoordinatorError {
    fn from(_: ParseFloatError) -> Self {
        CoordinatorError::NotAFloat
    }
}
