//! Channel key resolution
//!
//! A broker routing key encodes both the logical channel and the entity the
//! message is about: everything left of the rightmost "." is the channel path,
//! everything right of it is the entity id.
//!
//! ```text
//! routing key:   orders.eu.42
//!                └──┬────┘ └┬┘
//!              channel   entity id
//! ```
//!
//! The channel path is validated before any subscriber sees the message, so a
//! rejected key means the whole message is dropped.

use crate::error::InvalidChannelName;

/// Namespace the channel path is measured against by default
pub const DEFAULT_NAMESPACE: &str = "test_database";

/// Maximum combined byte length of namespace and channel path
pub const MAX_QUALIFIED_LEN: usize = 121;

/// Diagnostic path that is allowed to contain "$"
pub const RESERVED_OPLOG_PATH: &str = "oplog.$main";

/// Prefix reserved for internal channels
pub const RESERVED_PREFIX: &str = "service.";

/// A routing key split into its channel and entity id
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    /// Channel path (e.g., "orders")
    pub channel: String,
    /// Entity id (e.g., "42")
    pub entity_id: String,
}

impl std::fmt::Display for ChannelKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.channel, self.entity_id)
    }
}

/// Splits and validates routing keys
#[derive(Debug, Clone)]
pub struct ChannelKeyResolver {
    namespace: String,
    max_len: usize,
}

impl ChannelKeyResolver {
    /// Create a resolver measuring channel paths against `namespace`
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            max_len: MAX_QUALIFIED_LEN,
        }
    }

    /// Get the namespace
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    /// Resolve a routing key into `(channel, entity id)`.
    pub fn resolve(&self, routing_key: &str) -> Result<ChannelKey, InvalidChannelName> {
        let (channel, entity_id) = routing_key
            .rsplit_once('.')
            .ok_or(InvalidChannelName::MissingSeparator)?;

        self.validate(channel)?;

        Ok(ChannelKey {
            channel: channel.to_string(),
            entity_id: entity_id.to_string(),
        })
    }

    /// Check a channel path against the naming rules
    pub fn validate(&self, channel: &str) -> Result<(), InvalidChannelName> {
        if channel.is_empty() {
            return Err(InvalidChannelName::Empty);
        }
        if channel.contains("..") {
            return Err(InvalidChannelName::ConsecutiveDots);
        }
        if channel.starts_with('.') || channel.ends_with('.') {
            return Err(InvalidChannelName::LeadingOrTrailingDot);
        }
        if channel.contains('$') && !channel.starts_with(RESERVED_OPLOG_PATH) {
            return Err(InvalidChannelName::ReservedCharacter);
        }
        if channel.starts_with(RESERVED_PREFIX) {
            return Err(InvalidChannelName::ReservedPrefix);
        }
        if channel.contains('\0') {
            return Err(InvalidChannelName::NullByte);
        }

        let len = self.namespace.len() + channel.len();
        if len > self.max_len {
            return Err(InvalidChannelName::TooLong {
                len,
                max: self.max_len,
            });
        }

        Ok(())
    }
}

impl Default for ChannelKeyResolver {
    fn default() -> Self {
        Self::new(DEFAULT_NAMESPACE)
    }
}
