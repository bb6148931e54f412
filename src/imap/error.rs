use thiserror::Error;

/// Error taxonomy for the IMAP layer. Callers dispatch on the broad class
/// (transient / auth / protocol / capacity) rather than individual variants.
#[derive(Debug, Error, Clone)]
pub enum ImapError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Authentication error: {0}")]
    Auth(String),

    #[error("Operation timed out: {0}")]
    Timeout(String),

    #[error("Mailbox does not exist: {0}")]
    MissingMailbox(String),

    #[error("Server refused connection (capacity): {0}")]
    ServerCapacity(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Server rejected command: {0}")]
    Rejected(String),

    #[error("Session is closed")]
    Closed,

    #[error("Missing data in response: {0}")]
    MissingData(String),
}

impl ImapError {
    /// Network-ish failures that warrant a backoff-and-reconnect, with no
    /// user-visible event.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ImapError::Connection(_)
                | ImapError::Tls(_)
                | ImapError::Timeout(_)
                | ImapError::ServerCapacity(_)
                | ImapError::Closed
        )
    }

    pub fn is_auth(&self) -> bool {
        matches!(self, ImapError::Auth(_))
    }

    /// Malformed server dialogue. Three consecutive strikes fail the folder.
    pub fn is_protocol(&self) -> bool {
        matches!(self, ImapError::Protocol(_) | ImapError::MissingData(_))
    }

    /// Classify a NO response text into the matching variant.
    fn from_server_text(msg: String) -> Self {
        let lower = msg.to_ascii_lowercase();
        if lower.contains("nonexistent") || lower.contains("does not exist") {
            ImapError::MissingMailbox(msg)
        } else if lower.contains("too many") && lower.contains("connection") {
            ImapError::ServerCapacity(msg)
        } else if lower.contains("auth") || lower.contains("login") {
            ImapError::Auth(msg)
        } else {
            ImapError::Rejected(msg)
        }
    }
}

impl From<async_imap::error::Error> for ImapError {
    fn from(err: async_imap::error::Error) -> Self {
        match err {
            async_imap::error::Error::Io(e) => ImapError::Connection(e.to_string()),
            async_imap::error::Error::Parse(e) => ImapError::Protocol(e.to_string()),
            async_imap::error::Error::Validate(e) => ImapError::Protocol(e.to_string()),
            async_imap::error::Error::No(msg) => ImapError::from_server_text(msg),
            async_imap::error::Error::Bad(msg) => ImapError::Rejected(msg),
            async_imap::error::Error::ConnectionLost => ImapError::Closed,
            other => ImapError::Protocol(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ImapError {
    fn from(err: std::io::Error) -> Self {
        ImapError::Connection(err.to_string())
    }
}

impl From<native_tls::Error> for ImapError {
    fn from(err: native_tls::Error) -> Self {
        ImapError::Tls(err.to_string())
    }
}
