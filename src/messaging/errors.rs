//! # Messaging Error Types
//!
//! Structured error handling for broker operations using thiserror
//! instead of `Box<dyn Error>` patterns.

use thiserror::Error;

/// Broker-level messaging errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MessagingError {
    #[error("Destination not found: {destination}")]
    DestinationNotFound { destination: String },

    #[error("Invalid destination name: {destination}: {reason}")]
    InvalidDestination { destination: String, reason: String },

    #[error("Message serialization error: {message}")]
    MessageSerialization { message: String },

    #[error("Message deserialization error: {message}")]
    MessageDeserialization { message: String },

    #[error("Broker is closed: {provider}")]
    BrokerClosed { provider: String },
}

impl MessagingError {
    pub fn destination_not_found(destination: impl Into<String>) -> Self {
        Self::DestinationNotFound {
            destination: destination.into(),
        }
    }

    pub fn invalid_destination(destination: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidDestination {
            destination: destination.into(),
            reason: reason.into(),
        }
    }

    pub fn message_serialization(message: impl Into<String>) -> Self {
        Self::MessageSerialization {
            message: message.into(),
        }
    }

    pub fn message_deserialization(message: impl Into<String>) -> Self {
        Self::MessageDeserialization {
            message: message.into(),
        }
    }

    pub fn broker_closed(provider: impl Into<String>) -> Self {
        Self::BrokerClosed {
            provider: provider.into(),
        }
    }
}

/// Conversion from serde_json::Error to MessagingError
impl From<serde_json::Error> for MessagingError {
    fn from(err: serde_json::Error) -> Self {
        if err.is_syntax() || err.is_data() || err.is_eof() {
            MessagingError::message_deserialization(err.to_string())
        } else {
            MessagingError::message_serialization(err.to_string())
        }
    }
}

/// Result type alias for messaging operations
pub type MessagingResult<T> = Result<T, MessagingError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messaging_error_creation() {
        let err = MessagingError::destination_not_found("harvester.items");
        assert!(matches!(err, MessagingError::DestinationNotFound { .. }));

        let err = MessagingError::broker_closed("in_memory");
        assert!(err.to_string().contains("in_memory"));
    }

    #[test]
    fn test_error_conversions() {
        let json_err = serde_json::from_str::<serde_json::Value>("{invalid json").unwrap_err();
        let messaging_err: MessagingError = json_err.into();
        assert!(matches!(
            messaging_err,
            MessagingError::MessageDeserialization { .. }
        ));
    }

    #[test]
    fn test_error_display() {
        let err = MessagingError::invalid_destination("", "destination name cannot be empty");
        let display_str = format!("{err}");
        assert!(display_str.contains("Invalid destination name"));
        assert!(display_str.contains("cannot be empty"));
    }
}
