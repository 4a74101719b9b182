//! Error types
//!
//! Each concern has its own error enum so callers can branch on exactly the
//! failure they care about. [`Error`] wraps all of them for APIs that can fail
//! in more than one way.

use std::fmt;

/// Result alias using the crate-level [`Error`]
pub type Result<T> = std::result::Result<T, Error>;

/// Crate-level error
#[derive(Debug)]
pub enum Error {
    /// Broker connection or channel failure
    Broker(BrokerError),
    /// Message body could not be decoded
    Decode(DecodeError),
    /// Routing key did not yield a valid channel name
    InvalidChannel(InvalidChannelName),
    /// Persistence failure
    Store(StoreError),
    /// Socket-level I/O failure
    Io(std::io::Error),
    /// WebSocket protocol failure
    WebSocket(tokio_tungstenite::tungstenite::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Broker(e) => write!(f, "Broker error: {}", e),
            Error::Decode(e) => write!(f, "Decode error: {}", e),
            Error::InvalidChannel(e) => write!(f, "Invalid channel name: {}", e),
            Error::Store(e) => write!(f, "Store error: {}", e),
            Error::Io(e) => write!(f, "I/O error: {}", e),
            Error::WebSocket(e) => write!(f, "WebSocket error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Broker(e) => Some(e),
            Error::Decode(e) => Some(e),
            Error::InvalidChannel(e) => Some(e),
            Error::Store(e) => Some(e),
            Error::Io(e) => Some(e),
            Error::WebSocket(e) => Some(e),
        }
    }
}

impl From<BrokerError> for Error {
    fn from(e: BrokerError) -> Self {
        Error::Broker(e)
    }
}

impl From<DecodeError> for Error {
    fn from(e: DecodeError) -> Self {
        Error::Decode(e)
    }
}

impl From<InvalidChannelName> for Error {
    fn from(e: InvalidChannelName) -> Self {
        Error::InvalidChannel(e)
    }
}

impl From<StoreError> for Error {
    fn from(e: StoreError) -> Self {
        Error::Store(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(e)
    }
}

/// Broker connection and channel failures
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Could not establish the connection
    Connect(String),
    /// Connection closed (by the broker or the network)
    ConnectionClosed(String),
    /// Channel closed by the broker after a protocol violation
    ChannelClosed(String),
    /// Redeclare with parameters that conflict with the existing entity
    PreconditionFailed(String),
    /// The broker cancelled our consumer
    ConsumerCancelled(String),
    /// Operation issued on a connection or channel that is no longer open
    NotConnected,
}

impl BrokerError {
    /// Whether this failure is scoped to the channel rather than the connection.
    ///
    /// Channel-scoped failures are still escalated to a connection restart by
    /// the supervisor; this only changes how they are reported.
    pub fn is_channel_level(&self) -> bool {
        matches!(
            self,
            BrokerError::ChannelClosed(_)
                | BrokerError::PreconditionFailed(_)
                | BrokerError::ConsumerCancelled(_)
        )
    }
}

impl fmt::Display for BrokerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BrokerError::Connect(reason) => write!(f, "Connect failed: {}", reason),
            BrokerError::ConnectionClosed(reason) => write!(f, "Connection closed: {}", reason),
            BrokerError::ChannelClosed(reason) => write!(f, "Channel closed: {}", reason),
            BrokerError::PreconditionFailed(reason) => {
                write!(f, "Precondition failed: {}", reason)
            }
            BrokerError::ConsumerCancelled(tag) => write!(f, "Consumer cancelled: {}", tag),
            BrokerError::NotConnected => write!(f, "Not connected"),
        }
    }
}

impl std::error::Error for BrokerError {}

/// Routing key rejected by the channel-name rules
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidChannelName {
    /// Routing key has no "." to split channel and entity id on
    MissingSeparator,
    /// Channel path is empty
    Empty,
    /// Channel path contains ".."
    ConsecutiveDots,
    /// Channel path starts or ends with "."
    LeadingOrTrailingDot,
    /// Channel path contains "$" outside the reserved oplog path
    ReservedCharacter,
    /// Channel path starts with the reserved "service." prefix
    ReservedPrefix,
    /// Channel path contains a NUL byte
    NullByte,
    /// Namespace plus channel path is longer than allowed
    TooLong { len: usize, max: usize },
}

impl fmt::Display for InvalidChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidChannelName::MissingSeparator => {
                write!(f, "routing key has no entity id separator")
            }
            InvalidChannelName::Empty => write!(f, "channel names cannot be empty"),
            InvalidChannelName::ConsecutiveDots => write!(f, "channel names cannot contain '..'"),
            InvalidChannelName::LeadingOrTrailingDot => {
                write!(f, "channel names must not start or end with '.'")
            }
            InvalidChannelName::ReservedCharacter => {
                write!(f, "channel names must not contain '$'")
            }
            InvalidChannelName::ReservedPrefix => {
                write!(f, "channel names cannot start with 'service.'")
            }
            InvalidChannelName::NullByte => {
                write!(f, "channel names must not contain the null character")
            }
            InvalidChannelName::TooLong { len, max } => {
                write!(f, "channel name is too long: {} bytes, max is {}", len, max)
            }
        }
    }
}

impl std::error::Error for InvalidChannelName {}

/// Message body is not a UTF-8 JSON document
#[derive(Debug)]
pub struct DecodeError(pub serde_json::Error);

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "body is not valid JSON: {}", self.0)
    }
}

impl std::error::Error for DecodeError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}

/// A single subscriber failed to take a delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// Subscriber is gone (its connection closed)
    Closed,
    /// Subscriber's outbound buffer is full; the delivery is dropped
    Backpressure,
    /// Envelope could not be encoded for this subscriber
    Encode(String),
}

impl fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryError::Closed => write!(f, "Subscriber closed"),
            DeliveryError::Backpressure => write!(f, "Subscriber buffer full"),
            DeliveryError::Encode(reason) => write!(f, "Encode failed: {}", reason),
        }
    }
}

impl std::error::Error for DeliveryError {}

/// Persistence failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store refused the document
    Rejected(String),
    /// The store could not be reached
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Rejected(reason) => write!(f, "Document rejected: {}", reason),
            StoreError::Unavailable(reason) => write!(f, "Store unavailable: {}", reason),
        }
    }
}

impl std::error::Error for StoreError {}

/// Malformed control message from a live client
#[derive(Debug)]
pub struct ControlError(pub serde_json::Error);

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid control message: {}", self.0)
    }
}

impl std::error::Error for ControlError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.0)
    }
}
