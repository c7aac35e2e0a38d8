//! Error types for the peer mesh

use thiserror::Error;

/// Errors from the relay connection
#[derive(Debug, Error, Clone)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Invalid relay URL: {0}")]
    InvalidUrl(String),
}

/// Errors from a point-to-point peer link
#[derive(Debug, Error)]
pub enum LinkError {
    #[error("WebRTC error: {0}")]
    WebRTC(#[from] webrtc::Error),
    #[error("Missing SDP in {0}")]
    MissingSdp(&'static str),
    #[error("Unexpected description: {0}")]
    UnexpectedDescription(String),
    #[error("Channel not open")]
    ChannelNotOpen,
    #[error("Link closed")]
    Closed,
    #[error("Link setup failed: {0}")]
    Setup(String),
}

/// Errors returned by the coordinator handle
#[derive(Debug, Error, Clone)]
pub enum MeshError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("Coordinator stopped")]
    Stopped,
}
