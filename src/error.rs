use crate::exchange::ExchangeStatus;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Malformed or out-of-policy input. Never retried.
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// Transient failure of the price or explorer API.
    #[error("upstream error: {0}")]
    Upstream(String),

    #[error("price unavailable: {0}")]
    PriceUnavailable(String),

    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("persistence error: {0:#}")]
    Persistence(anyhow::Error),

    #[error("invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: ExchangeStatus,
        to: ExchangeStatus,
    },
}

impl Error {
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Upstream(_) | Error::PriceUnavailable(_))
    }
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<Error>() {
            Ok(typed) => typed,
            Err(other) => Error::Persistence(other),
        }
    }
}

impl From<Error> for tonic::Status {
    fn from(err: Error) -> Self {
        match &err {
            Error::Validation(msg) => tonic::Status::invalid_argument(msg.clone()),
            Error::NotFound(msg) => tonic::Status::not_found(msg.clone()),
            Error::Upstream(_) | Error::PriceUnavailable(_) => {
                tonic::Status::unavailable(err.to_string())
            }
            _ => tonic::Status::internal(err.to_string()),
        }
    }
}
