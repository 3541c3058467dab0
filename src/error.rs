//! Error taxonomy shared by fetches, mutations and session refresh.

use thiserror::Error;

/// Errors surfaced by transports and recorded on cache entries.
///
/// Cloneable so that a single fetch outcome can be handed to every caller
/// that joined the same in-flight request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueryError {
  /// Transport failure (connection refused, timeout, reset...)
  #[error("network error: {0}")]
  Network(String),

  /// Non-2xx response or business-rule rejection
  #[error("server rejected request ({status}): {message}")]
  Server { status: u16, message: String },

  /// The write was based on state the server has since replaced
  #[error("write conflicts with newer server state")]
  StaleWriteConflict,

  /// The refresh token itself is invalid or expired
  #[error("session expired")]
  AuthExpired,

  /// Response body could not be decoded
  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl QueryError {
  /// Construct a server error from a status code and message.
  pub fn server(status: u16, message: impl Into<String>) -> Self {
    Self::Server {
      status,
      message: message.into(),
    }
  }

  /// Whether the error came from the transport rather than the server.
  pub fn is_network(&self) -> bool {
    matches!(self, Self::Network(_))
  }
}

impl From<reqwest::Error> for QueryError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      return Self::Decode(e.to_string());
    }
    match e.status() {
      Some(status) => Self::server(status.as_u16(), e.to_string()),
      None => Self::Network(e.to_string()),
    }
  }
}

impl From<serde_json::Error> for QueryError {
  fn from(e: serde_json::Error) -> Self {
    Self::Decode(e.to_string())
  }
}

pub type QueryResult<T> = Result<T, QueryError>;
