use std::error::Error;
use std::fmt;

pub type ProviderResult<T> = Result<T, ProviderError>;

/// Classification of an adapter failure. Adapters never retry internally;
/// the orchestrator decides whether and how to retry.
#[derive(Debug, Clone)]
pub enum ProviderError {
    Connection(String),
    Auth(String),
    Quota(String),
    UpstreamClient { status: u16, body: String },
    UpstreamServer { status: u16, body: String },
    Other(String),
}

impl ProviderError {
    pub fn is_quota(&self) -> bool {
        matches!(self, ProviderError::Quota(_))
    }
}

impl fmt::Display for ProviderError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProviderError::Connection(msg) => write!(f, "connection error: {msg}"),
            ProviderError::Auth(msg) => write!(f, "authentication error: {msg}"),
            ProviderError::Quota(msg) => write!(f, "quota error: {msg}"),
            ProviderError::UpstreamClient { status, body } => {
                write!(f, "upstream 4xx ({status}): {body}")
            }
            ProviderError::UpstreamServer { status, body } => {
                write!(f, "upstream 5xx ({status}): {body}")
            }
            ProviderError::Other(msg) => write!(f, "{msg}"),
        }
    }
}

impl Error for ProviderError {}
