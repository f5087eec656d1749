// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Inbound gateway: authenticates the peer and hands packets to the
//! registered handler.

use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use axum::{
  body::Body,
  extract::State,
  http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderMap, HeaderValue, StatusCode,
  },
  response::{IntoResponse, Response},
  Router,
};
use bytes::Bytes;
use http_body_util::LengthLimitError;
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::common::{
  address::is_valid_segment,
  authentication::CredentialProvider,
  handler::HandlerSlot,
  ildcp::{IldcpCache, IldcpError},
  packet::{self, ILDCP_DESTINATION, MAX_ILP_PACKET_LENGTH},
  PEER_NAME_HEADER,
};

const REPLY_CONTENT_TYPE: &str = "application/octet-stream";

/// Failures reported to the peer. Only the status and a fixed message leave
/// the process.
#[derive(thiserror::Error, Debug)]
pub enum GatewayError {
  #[error("invalid authorization")]
  Unauthorized,
  #[error("server is closed")]
  NotConnected,
  #[error("packet too large")]
  PayloadTooLarge,
  #[error("failed to read request body")]
  UnreadableBody(#[source] axum::Error),
  #[error("missing or invalid ILP-Peer-Name header")]
  InvalidPeerName,
  #[error("ILDCP unavailable")]
  Ildcp(#[source] IldcpError),
  #[error("no handler registered")]
  NoHandler,
  #[error("handler failed")]
  Handler(#[source] anyhow::Error),
}

impl GatewayError {
  pub fn status(&self) -> StatusCode {
    match self {
      Self::Unauthorized => StatusCode::UNAUTHORIZED,
      Self::NotConnected | Self::NoHandler => StatusCode::BAD_GATEWAY,
      Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
      Self::UnreadableBody(_) | Self::InvalidPeerName => StatusCode::BAD_REQUEST,
      Self::Ildcp(_) | Self::Handler(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl IntoResponse for GatewayError {
  fn into_response(self) -> Response {
    // Display strings are fixed; sources are logged, never sent
    (self.status(), self.to_string()).into_response()
  }
}

/// Everything a request needs, shared with the owning transport.
pub struct GatewayState {
  pub credentials: Arc<dyn CredentialProvider>,
  pub connected: Arc<AtomicBool>,
  pub multi: bool,
  pub handlers: HandlerSlot,
  pub ildcp: Arc<IldcpCache>,
}

impl std::fmt::Debug for GatewayState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(GatewayState))
      .field("connected", &self.connected.load(Ordering::Relaxed))
      .field("multi", &self.multi)
      .field("handlers", &self.handlers)
      .finish_non_exhaustive()
  }
}

/// Any method on any path is treated as a packet submission.
pub fn router(state: Arc<GatewayState>) -> Router {
  Router::new().fallback(handle_packet).with_state(state)
}

fn presented_credential(headers: &HeaderMap) -> Option<&str> {
  let value = headers.get(AUTHORIZATION)?.to_str().ok()?;
  Some(value.strip_prefix("Bearer ").unwrap_or(value))
}

fn exceeded_length_limit(error: &(dyn std::error::Error + 'static)) -> bool {
  let mut current = Some(error);
  while let Some(error) = current {
    if error.is::<LengthLimitError>() {
      return true;
    }
    current = error.source();
  }
  false
}

async fn read_packet(body: Body) -> Result<Bytes, GatewayError> {
  axum::body::to_bytes(body, MAX_ILP_PACKET_LENGTH)
    .await
    .map_err(|error| {
      if exceeded_length_limit(&error) {
        GatewayError::PayloadTooLarge
      } else {
        GatewayError::UnreadableBody(error)
      }
    })
}

fn reply(packet: Bytes) -> Response {
  (
    [(CONTENT_TYPE, HeaderValue::from_static(REPLY_CONTENT_TYPE))],
    packet,
  )
    .into_response()
}

async fn handle_packet(
  State(state): State<Arc<GatewayState>>,
  headers: HeaderMap,
  body: Body,
) -> Result<Response, GatewayError> {
  let authentic = match presented_credential(&headers) {
    Some(presented) => state.credentials.verify(presented).await,
    None => false,
  };
  if !authentic {
    tracing::debug!("rejected request with invalid authorization");
    return Err(GatewayError::Unauthorized);
  }
  if !state.connected.load(Ordering::SeqCst) {
    return Err(GatewayError::NotConnected);
  }

  let packet = read_packet(body).await?;

  if state.multi && is_ildcp_query(&packet) {
    return answer_ildcp(&state, &headers).await;
  }

  let handler = state.handlers.current().ok_or(GatewayError::NoHandler)?;
  match handler.handle_packet(packet).await {
    Ok(response) => Ok(reply(response)),
    Err(error) => {
      tracing::warn!(error = %error, "packet handler failed");
      Err(GatewayError::Handler(error))
    }
  }
}

/// Packets whose destination cannot be read are passed through to the handler.
fn is_ildcp_query(packet: &[u8]) -> bool {
  matches!(packet::read_destination(packet), Ok(destination) if destination == ILDCP_DESTINATION)
}

async fn answer_ildcp(state: &GatewayState, headers: &HeaderMap) -> Result<Response, GatewayError> {
  let peer_name = headers
    .get(&PEER_NAME_HEADER)
    .and_then(|value| value.to_str().ok())
    .filter(|name| is_valid_segment(name))
    .ok_or(GatewayError::InvalidPeerName)?;
  let record = state
    .ildcp
    .get_or_fetch(&state.handlers)
    .await
    .map_err(|error| {
      tracing::warn!(%error, "failed to fetch ILDCP record for child");
      GatewayError::Ildcp(error)
    })?;
  tracing::debug!(peer = peer_name, "answering ILDCP query");
  Ok(reply(packet::ildcp_response(&record.for_child(peer_name))))
}

/// A running listener; dropping it does not stop the server.
#[derive(Debug)]
pub struct Gateway {
  local_addr: SocketAddr,
  shutdown: CancellationToken,
  task: JoinHandle<()>,
}

impl Gateway {
  /// Binds `addr` and serves `state` until [`Gateway::shutdown`].
  pub async fn listen(addr: SocketAddr, state: Arc<GatewayState>) -> std::io::Result<Gateway> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let app = router(state);
    let task = tokio::spawn(async move {
      let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await;
      match served {
        Ok(()) => tracing::debug!(%local_addr, "listener stopped"),
        Err(error) => tracing::warn!(%local_addr, %error, "listener failed"),
      }
    });
    tracing::info!(%local_addr, "listening for ILP packets");
    Ok(Gateway {
      local_addr,
      shutdown,
      task,
    })
  }

  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stops accepting connections; requests already being served complete.
  pub fn shutdown(&self) {
    self.shutdown.cancel();
  }

  pub fn is_finished(&self) -> bool {
    self.task.is_finished()
  }
}
