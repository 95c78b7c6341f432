use thiserror::Error;

/// HTTP error classification
#[derive(Error, Debug, Clone, PartialEq)]
pub enum HttpErrorKind {
    #[error("Client error: {message}")]
    Client {
        message: String,
        data: Option<String>,
    },
    #[error("Server error: {message}")]
    Server { message: String },
}

/// Main crate error type
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// HTTP error with status code and classification
    #[error("HTTP error (status {status}): {kind}")]
    Http { status: u16, kind: HttpErrorKind },

    /// Generic request error (connect failure, body read failure)
    #[error("Generic request error: {0}")]
    GenericRequest(String),

    /// JSON parse error
    #[error("Json parse error: {0}")]
    JsonParse(String),

    /// WebSocket connection error
    #[error("Websocket error: {0}")]
    Websocket(String),

    /// WebSocket send error
    #[error("WS send error: {0}")]
    WsSend(String),

    /// Push channel is not connected
    #[error("Push channel not connected")]
    NotConnected,

    /// Acknowledgement for a channel request did not arrive in time
    #[error("Channel request {request_id} timed out after {timeout_ms}ms")]
    AckTimeout { request_id: u64, timeout_ms: u64 },

    /// Listener not found
    #[error("Listener not found")]
    ListenerNotFound,

    /// Push event with an unrecognized name
    #[error("Unknown push event: {0}")]
    UnknownEvent(String),

    /// Push event whose payload did not match the expected shape
    #[error("Malformed payload for {event}: {reason}")]
    MalformedEvent { event: String, reason: String },

    /// Entity not present in the store
    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    /// Server declined an optimistic mutation
    #[error("Mutation on {entity_id} rejected: {reason}")]
    MutationRejected { entity_id: String, reason: String },

    /// Sync context state machine received an event it cannot take
    #[error("Invalid context transition from {from} on {event}")]
    InvalidTransition { from: String, event: String },

    /// Operation on a torn-down context or store
    #[error("Sync context closed")]
    ContextClosed,

    /// Auth token could not be read or written
    #[error("Token store error: {0}")]
    TokenStore(String),

    /// Configuration could not be parsed or is inconsistent
    #[error("Config error: {0}")]
    Config(String),
}

// Convenience constructors for common error patterns
impl Error {
    /// Create an HTTP client error
    pub fn client_error(status: u16, message: String, data: Option<String>) -> Self {
        Error::Http {
            status,
            kind: HttpErrorKind::Client { message, data },
        }
    }

    /// Create an HTTP server error
    pub fn server_error(status: u16, message: String) -> Self {
        Error::Http {
            status,
            kind: HttpErrorKind::Server { message },
        }
    }

    /// Create a JSON parse error
    pub fn json_parse(msg: impl Into<String>) -> Self {
        Error::JsonParse(msg.into())
    }

    /// Create a WebSocket connection error
    pub fn ws_connection(msg: impl Into<String>) -> Self {
        Error::Websocket(msg.into())
    }

    /// Whether the error is a transport-level failure that polling or a
    /// retry can absorb, as opposed to the server declining the request.
    pub fn is_transient(&self) -> bool {
        match self {
            Error::Http {
                kind: HttpErrorKind::Server { .. },
                ..
            } => true,
            Error::Http { .. } => false,
            Error::GenericRequest(_)
            | Error::Websocket(_)
            | Error::WsSend(_)
            | Error::NotConnected
            | Error::AckTimeout { .. } => true,
            _ => false,
        }
    }

    /// Message suitable for showing to the user when a mutation fails.
    pub fn user_message(&self) -> String {
        match self {
            Error::Http {
                kind: HttpErrorKind::Client { message, .. },
                ..
            } => message.clone(),
            Error::MutationRejected { reason, .. } => reason.clone(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(Error::server_error(503, "busy".into()).is_transient());
        assert!(Error::NotConnected.is_transient());
        assert!(!Error::client_error(409, "already shipped".into(), None).is_transient());
        assert!(!Error::ContextClosed.is_transient());
    }

    #[test]
    fn test_user_message_prefers_server_text() {
        let err = Error::client_error(409, "Order already shipped".into(), None);
        assert_eq!(err.user_message(), "Order already shipped");
    }
}
