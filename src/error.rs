use thiserror::Error;

/// Request-level errors.
///
/// Every variant that can reach a client maps to a stable wire code via
/// [`Error::code`]; the `Display` impl is the human-readable message sent
/// alongside it. Internal failures (I/O, SQL) are logged server-side and
/// reported to clients under the generic crypto code.
#[derive(Error, Debug)]
pub enum Error {
    #[error("user {0} is not allowed to perform this operation")]
    Forbidden(String),

    #[error("invalid or expired session")]
    BadSession,

    #[error("request carries neither login/password nor a session id")]
    MissingAuth,

    #[error("unknown request type {0:?}")]
    UnknownRequest(String),

    #[error("invalid arguments for {0}: {1}")]
    MissingArgs(String, String),

    #[error("cryptographic failure: {0}")]
    Crypto(String),

    #[error("box failure: {0}")]
    CryptoBox(String),

    #[error("unknown group {0}")]
    UnknownGroup(i64),

    #[error("unknown user {0}")]
    UnknownUser(String),

    #[error("group {0} still has other members")]
    GroupHasMembers(i64),

    #[error("no private key available for group {0}")]
    UnknownGroupPrivk(i64),

    #[error("secret {0} not found")]
    SecretNotFound(i64),

    #[error("invalid message: {0}")]
    InvalidMessage(String),

    #[error("cannot open database {0}: {1}")]
    CantOpenDatabase(String, String),

    #[error("bad configuration: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Stable wire code for this error.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Forbidden(_) => "AUTH/FORBIDDEN",
            Error::BadSession => "AUTH/BADSESSION",
            Error::MissingAuth => "AUTH/MISSING",
            Error::UnknownRequest(_) => "REQ/UNKNOWN",
            Error::MissingArgs(..) => "REQ/MISSINGARGS",
            Error::Crypto(_) => "CRYPTO/UNSPECIFIED",
            Error::CryptoBox(_) => "CRYPTO/RBNACL",
            Error::UnknownGroup(_) => "STORE/UNKNOWNGROUP",
            Error::UnknownUser(_) => "STORE/UNKNOWNUSER",
            Error::GroupHasMembers(_) => "STORE/GROUPHASMEMBERS",
            Error::UnknownGroupPrivk(_) => "STORE/UNKNOWNGROUPPRIVK",
            Error::SecretNotFound(_) => "SECRET/NOTFOUND",
            Error::InvalidMessage(_) => "MSG/INVALID",
            Error::CantOpenDatabase(..) => "SQL/CANTOPEN",
            // Internal failures: the client only sees the generic code,
            // the real cause goes to the log.
            Error::Config(_) | Error::Database(_) | Error::Io(_) => "CRYPTO/UNSPECIFIED",
        }
    }

    /// True for failures that should be logged with their cause rather
    /// than shown verbatim to clients.
    pub fn is_internal(&self) -> bool {
        matches!(
            self,
            Error::Crypto(_) | Error::Config(_) | Error::Database(_) | Error::Io(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
