//! Domain types served by the REST backend.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Comment {
  pub id: u64,
  pub body: String,
  pub author: String,
  pub created_at: DateTime<Utc>,
  /// Set on optimistic items that the server has not confirmed yet
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub pending: bool,
}

impl Comment {
  /// Optimistic placeholder for a comment being posted.
  pub fn pending(temp_id: u64, body: impl Into<String>, author: impl Into<String>) -> Self {
    Self {
      id: temp_id,
      body: body.into(),
      author: author.into(),
      created_at: Utc::now(),
      pending: true,
    }
  }
}

/// Body of `POST /comments`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewComment {
  pub body: String,
}
