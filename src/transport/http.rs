//! JSON REST transport over reqwest.
//!
//! Endpoints, relative to the configured base url:
//!
//! | call            | request                       |
//! |-----------------|-------------------------------|
//! | feed page       | `GET comments?cursor=N`       |
//! | post comment    | `POST comments`               |
//! | single resource | `GET {collection}/{id}`       |
//! | login           | `POST auth/login`             |
//! | refresh         | `POST auth/refresh`           |
//! | logout          | `POST auth/logout`            |

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use color_eyre::{eyre::eyre, Result};
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::marker::PhantomData;
use std::time::Duration;
use tracing::debug;
use url::Url;

use super::{MutationTransport, PageFetcher, ResourceFetcher, SessionTransport};
use crate::error::{QueryError, QueryResult};
use crate::model::{Comment, NewComment};
use crate::paginated::Page;
use crate::session::{AuthSession, Credentials, LoginResponse, SessionStore, User};

/// REST client; cheap to clone.
#[derive(Clone)]
pub struct HttpTransport {
  client: reqwest::Client,
  base: Url,
  session: Option<SessionStore>,
}

impl HttpTransport {
  pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
    // Without a trailing slash `join` would replace the last path segment
    let normalized = if base_url.ends_with('/') {
      base_url.to_string()
    } else {
      format!("{}/", base_url)
    };
    let base =
      Url::parse(&normalized).map_err(|e| eyre!("Invalid api url {}: {}", base_url, e))?;

    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create http client: {}", e))?;

    Ok(Self {
      client,
      base,
      session: None,
    })
  }

  /// Send the session's access token as a bearer token on every request.
  pub fn with_session(mut self, session: SessionStore) -> Self {
    self.session = Some(session);
    self
  }

  /// Fetcher for `GET {collection}/{id}`.
  pub fn resource<T>(&self, collection: &str) -> HttpResource<T> {
    HttpResource {
      transport: self.clone(),
      collection: collection.trim_matches('/').to_string(),
      _marker: PhantomData,
    }
  }

  fn url(&self, path: &str) -> QueryResult<Url> {
    self
      .base
      .join(path)
      .map_err(|e| QueryError::Network(format!("invalid url {}: {}", path, e)))
  }

  fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
    match self.session.as_ref().and_then(|s| s.access_token()) {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn get_json<T: DeserializeOwned>(&self, url: Url) -> QueryResult<T> {
    debug!(%url, "GET");
    let response = self.authorized(self.client.get(url)).send().await?;
    parse_response(response).await
  }

  async fn post<B: Serialize + ?Sized>(&self, path: &str, body: &B) -> QueryResult<Response> {
    let url = self.url(path)?;
    debug!(%url, "POST");
    Ok(self.authorized(self.client.post(url)).json(body).send().await?)
  }
}

/// Map a non-2xx response to an error, or decode the body.
async fn parse_response<T: DeserializeOwned>(response: Response) -> QueryResult<T> {
  let status = response.status();
  if status.is_success() {
    return Ok(response.json::<T>().await?);
  }
  let text = response.text().await.unwrap_or_default();
  Err(status_error(status, text))
}

fn status_error(status: StatusCode, body: String) -> QueryError {
  if status == StatusCode::CONFLICT {
    return QueryError::StaleWriteConflict;
  }

  // Prefer the server's own message when the body is `{"message": ...}`
  let message = serde_json::from_str::<ErrorBody>(&body)
    .map(|e| e.message)
    .unwrap_or(body);
  QueryError::server(status.as_u16(), message)
}

#[derive(Deserialize)]
struct ErrorBody {
  message: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FeedPage {
  items: Vec<Comment>,
  next_cursor: Option<u64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TokenResponse {
  access_token: String,
  refresh_token: String,
  /// Seconds from now
  expires_in: i64,
}

impl TokenResponse {
  fn into_session(self) -> AuthSession {
    AuthSession {
      access_token: self.access_token,
      refresh_token: self.refresh_token,
      expires_at: Utc::now() + ChronoDuration::seconds(self.expires_in),
    }
  }
}

#[derive(Deserialize)]
struct LoginBody {
  user: User,
  #[serde(flatten)]
  tokens: TokenResponse,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRequest<'a> {
  refresh_token: &'a str,
}

#[async_trait]
impl PageFetcher<Comment, u64> for HttpTransport {
  async fn fetch_page(&self, cursor: Option<u64>) -> QueryResult<Page<Comment, u64>> {
    let mut url = self.url("comments")?;
    if let Some(cursor) = cursor {
      url
        .query_pairs_mut()
        .append_pair("cursor", &cursor.to_string());
    }

    let page: FeedPage = self.get_json(url).await?;
    Ok(Page {
      items: page.items,
      cursor: page.next_cursor,
    })
  }
}

#[async_trait]
impl MutationTransport<NewComment, Comment> for HttpTransport {
  async fn submit(&self, payload: NewComment) -> QueryResult<Comment> {
    let response = self.post("comments", &payload).await?;
    parse_response(response).await
  }
}

#[async_trait]
impl SessionTransport for HttpTransport {
  async fn login(&self, credentials: &Credentials) -> QueryResult<LoginResponse> {
    let response = self.post("auth/login", credentials).await?;
    let body: LoginBody = parse_response(response).await?;
    Ok(LoginResponse {
      user: body.user,
      tokens: body.tokens.into_session(),
    })
  }

  async fn refresh(&self, refresh_token: &str) -> QueryResult<Option<AuthSession>> {
    let response = self
      .post("auth/refresh", &RefreshRequest { refresh_token })
      .await?;

    if response.status() == StatusCode::UNAUTHORIZED {
      return Ok(None);
    }
    let tokens: TokenResponse = parse_response(response).await?;
    Ok(Some(tokens.into_session()))
  }

  async fn logout(&self, refresh_token: &str) -> QueryResult<()> {
    let response = self
      .post("auth/logout", &RefreshRequest { refresh_token })
      .await?;

    let status = response.status();
    if status.is_success() {
      return Ok(());
    }
    let text = response.text().await.unwrap_or_default();
    Err(status_error(status, text))
  }
}

/// One REST collection addressed by numeric id.
pub struct HttpResource<T> {
  transport: HttpTransport,
  collection: String,
  _marker: PhantomData<fn() -> T>,
}

#[async_trait]
impl<T: DeserializeOwned + Send + 'static> ResourceFetcher<u64, T> for HttpResource<T> {
  async fn fetch_one(&self, id: u64) -> QueryResult<T> {
    let url = self
      .transport
      .url(&format!("{}/{}", self.collection, id))?;
    self.transport.get_json(url).await
  }
}
