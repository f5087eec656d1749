// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Multiplexed HTTP/2 sessions and the pools that grow them per authority.
//!
//! A [`Session`] owns one physical connection and admits requests while the
//! peer's stream limit and the local per-connection ceiling allow. A
//! [`SessionPool`] holds every session for one authority and appends a new
//! one whenever all existing sessions refuse a request.

use std::{fmt, sync::Arc};

use bytes::Bytes;
use futures::future::BoxFuture;
use http::{HeaderMap, Method, StatusCode};

pub mod h2_connector;
pub mod pool;
pub mod session;

pub use self::{
  h2_connector::{H2Connection, H2Connector},
  pool::{SessionPool, SessionPools},
  session::{RequestPermit, Session, DEFAULT_MAX_CONCURRENT_STREAMS},
};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum Scheme {
  Http,
  Https,
}

impl Scheme {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::Http => "http",
      Self::Https => "https",
    }
  }
}

/// Scheme, host, and port identifying one connection target.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Authority {
  scheme: Scheme,
  host: Arc<str>,
  port: u16,
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AuthorityError {
  #[error("Unsupported scheme {0:?}")]
  UnsupportedScheme(String),
  #[error("URL has no host")]
  MissingHost,
}

impl Authority {
  pub fn new(scheme: Scheme, host: impl Into<Arc<str>>, port: u16) -> Self {
    Self {
      scheme,
      host: host.into(),
      port,
    }
  }

  pub fn from_url(url: &url::Url) -> Result<Self, AuthorityError> {
    let scheme = match url.scheme() {
      "http" => Scheme::Http,
      "https" => Scheme::Https,
      other => return Err(AuthorityError::UnsupportedScheme(other.to_owned())),
    };
    let host = url.host_str().ok_or(AuthorityError::MissingHost)?;
    let port = url.port_or_known_default().unwrap_or(match scheme {
      Scheme::Http => 80,
      Scheme::Https => 443,
    });
    Ok(Self::new(scheme, host, port))
  }

  pub fn scheme(&self) -> Scheme {
    self.scheme
  }

  pub fn host(&self) -> &str {
    &self.host
  }

  pub fn port(&self) -> u16 {
    self.port
  }
}

impl fmt::Display for Authority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}://{}:{}", self.scheme.as_str(), self.host, self.port)
  }
}

impl fmt::Debug for Authority {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(self, f)
  }
}

/// A request to be issued over a pooled session.
#[derive(Debug, Clone)]
pub struct PoolRequest {
  pub method: Method,
  /// Path and query, starting with `/`
  pub path: String,
  pub headers: HeaderMap,
  pub body: Option<Bytes>,
}

/// A fully buffered response.
#[derive(Debug, Clone)]
pub struct PoolResponse {
  pub status: StatusCode,
  pub headers: HeaderMap,
  pub body: Bytes,
}

impl PoolResponse {
  pub fn ok(&self) -> bool {
    self.status.is_success()
  }
}

#[derive(thiserror::Error, Debug, Clone)]
pub enum SessionError {
  #[error("Failed to open connection: {0}")]
  Connect(#[source] Arc<std::io::Error>),
  #[error("Invalid TLS server name {0:?}")]
  InvalidServerName(String),
  #[error("TLS configuration error: {0}")]
  Tls(#[source] Arc<rustls::Error>),
  #[error("HTTP/2 error: {0}")]
  Protocol(#[source] Arc<h2::Error>),
  #[error("Malformed request: {0}")]
  InvalidRequest(#[source] Arc<http::Error>),
  /// The connection ended under a request or before it could be used; the
  /// session reconnects on its next allocation, so a retry is reasonable.
  #[error("Connection lost")]
  ConnectionLost,
  #[error("Session closed")]
  Closed,
}

impl SessionError {
  /// Whether the same request may succeed on a fresh connection.
  pub fn is_retryable(&self) -> bool {
    matches!(self, Self::Connect(_) | Self::ConnectionLost)
  }
}

impl From<std::io::Error> for SessionError {
  fn from(error: std::io::Error) -> Self {
    Self::Connect(Arc::new(error))
  }
}

impl From<h2::Error> for SessionError {
  fn from(error: h2::Error) -> Self {
    Self::Protocol(Arc::new(error))
  }
}

impl From<http::Error> for SessionError {
  fn from(error: http::Error) -> Self {
    Self::InvalidRequest(Arc::new(error))
  }
}

/// Resolves when the physical connection terminates, with the reason if it
/// was not a clean close. Must be polled for requests to make progress.
pub type ConnectionDriver = BoxFuture<'static, Result<(), SessionError>>;

/// Opens physical connections for sessions.
pub trait SessionConnector: Send + Sync + 'static {
  type Connection: SessionConnection;

  fn connect(
    &self,
    authority: &Authority,
  ) -> BoxFuture<'static, Result<(Self::Connection, ConnectionDriver), SessionError>>;
}

/// A cheaply cloneable handle for issuing requests over one connection.
pub trait SessionConnection: Clone + Send + Sync + 'static {
  /// Concurrent streams the peer currently permits, if known.
  fn max_concurrent_streams(&self) -> Option<usize>;

  fn send(
    &self,
    authority: &Authority,
    request: PoolRequest,
  ) -> BoxFuture<'static, Result<PoolResponse, SessionError>>;
}


#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn authority_from_url_fills_default_ports() {
    let url = url::Url::parse("https://peer.example/ilp").unwrap();
    let authority = Authority::from_url(&url).unwrap();
    assert_eq!(authority.port(), 443);
    assert_eq!(authority.to_string(), "https://peer.example:443");

    let url = url::Url::parse("http://127.0.0.1:7768/").unwrap();
    let authority = Authority::from_url(&url).unwrap();
    assert_eq!(authority, Authority::new(Scheme::Http, "127.0.0.1", 7768));
  }

  #[test]
  fn lost_connections_are_retryable_but_closed_sessions_are_not() {
    assert!(SessionError::ConnectionLost.is_retryable());
    let refused = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
    assert!(SessionError::from(refused).is_retryable());
    assert!(!SessionError::Closed.is_retryable());
    assert!(!SessionError::InvalidServerName("bad name".into()).is_retryable());
  }

  #[test]
  fn authority_rejects_other_schemes() {
    let url = url::Url::parse("ws://peer.example/").unwrap();
    assert_eq!(
      Authority::from_url(&url),
      Err(AuthorityError::UnsupportedScheme("ws".into()))
    );
  }
}
