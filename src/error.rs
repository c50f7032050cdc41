use std::fmt;

use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Result codes surfaced to whoever drives a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    MediaPermissionDenied,
    MediaDeviceNotFound,
    MediaDeviceBusy,
    SignalingUnavailable,
    RoomFull,
    NegotiationTimeout,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match self {
            ErrorCode::MediaPermissionDenied => "MediaPermissionDenied",
            ErrorCode::MediaDeviceNotFound => "MediaDeviceNotFound",
            ErrorCode::MediaDeviceBusy => "MediaDeviceBusy",
            ErrorCode::SignalingUnavailable => "SignalingUnavailable",
            ErrorCode::RoomFull => "RoomFull",
            ErrorCode::NegotiationTimeout => "NegotiationTimeout",
        };
        f.write_str(code)
    }
}

/// Failure class an error belongs to. Decides whether anything retries it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Local and user-actionable, never retried automatically.
    Media,
    /// Transient, retried with bounded backoff.
    Signaling,
    /// Scoped to one peer pair.
    Negotiation,
    /// Immediate and final for this attempt.
    Capacity,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MediaError {
    #[error("microphone permission denied: {0}")]
    PermissionDenied(String),

    #[error("no audio device found: {0}")]
    DeviceNotFound(String),

    #[error("audio device busy: {0}")]
    DeviceBusy(String),
}

impl MediaError {
    pub fn code(&self) -> ErrorCode {
        match self {
            MediaError::PermissionDenied(_) => ErrorCode::MediaPermissionDenied,
            MediaError::DeviceNotFound(_) => ErrorCode::MediaDeviceNotFound,
            MediaError::DeviceBusy(_) => ErrorCode::MediaDeviceBusy,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum SignalingError {
    #[error("signaling server unavailable: {0}")]
    Unavailable(String),

    #[error("signaling channel closed")]
    Closed,

    #[error("join rejected: {0}")]
    Rejected(String),

    #[error("websocket error: {0}")]
    Ws(#[from] WsError),

    #[error("malformed signaling message: {0}")]
    Malformed(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum NegotiationError {
    #[error("negotiation with {peer} timed out")]
    Timeout { peer: String },

    #[error("malformed negotiation payload: {0}")]
    Payload(String),

    #[error("webrtc error: {0}")]
    WebRTC(#[from] WebRTCError),

    #[error("peer transport error: {0}")]
    Transport(String),

    #[error("could not open output sink: {0}")]
    Sink(#[from] MediaError),
}

impl NegotiationError {
    /// Per-pair failures all surface as the pair not coming up in time.
    pub fn code(&self) -> ErrorCode {
        ErrorCode::NegotiationTimeout
    }
}

impl From<serde_json::Error> for NegotiationError {
    fn from(err: serde_json::Error) -> Self {
        NegotiationError::Payload(err.to_string())
    }
}

/// Top-level error as exposed by the connection supervisor.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Media(#[from] MediaError),

    #[error(transparent)]
    Signaling(#[from] SignalingError),

    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("room {0} is full")]
    RoomFull(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Media(_) => ErrorKind::Media,
            Error::Signaling(_) => ErrorKind::Signaling,
            Error::Negotiation(_) => ErrorKind::Negotiation,
            Error::RoomFull(_) => ErrorKind::Capacity,
        }
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Media(e) => e.code(),
            Error::Signaling(_) => ErrorCode::SignalingUnavailable,
            Error::Negotiation(e) => e.code(),
            Error::RoomFull(_) => ErrorCode::RoomFull,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn media_errors_map_to_their_codes() {
        let err = Error::from(MediaError::DeviceBusy("in use".into()));
        assert_eq!(err.kind(), ErrorKind::Media);
        assert_eq!(err.code(), ErrorCode::MediaDeviceBusy);
        assert_eq!(err.to_string(), "audio device busy: in use");
    }

    #[test]
    fn room_full_is_a_capacity_error() {
        let err = Error::RoomFull("algebra-101".into());
        assert_eq!(err.kind(), ErrorKind::Capacity);
        assert_eq!(err.code().to_string(), "RoomFull");
    }

    #[test]
    fn signaling_errors_surface_as_unavailable() {
        let err = Error::from(SignalingError::Closed);
        assert_eq!(err.kind(), ErrorKind::Signaling);
        assert_eq!(err.code(), ErrorCode::SignalingUnavailable);
    }
}
