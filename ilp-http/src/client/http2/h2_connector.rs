// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! HTTP/2 connections over TCP (prior knowledge) or TLS with ALPN `h2`.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::future::{BoxFuture, FutureExt};
use rustls::pki_types::ServerName;
use tokio::{
  io::{AsyncRead, AsyncWrite},
  net::TcpStream,
};
use tokio_rustls::TlsConnector;

use super::{
  Authority, ConnectionDriver, PoolRequest, PoolResponse, Scheme, SessionConnection,
  SessionConnector, SessionError,
};

trait SessionIo: AsyncRead + AsyncWrite + Send + Unpin + 'static {}
impl<T> SessionIo for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

#[derive(Clone)]
pub struct H2Connector {
  tls: Arc<rustls::ClientConfig>,
}

impl H2Connector {
  pub fn new() -> Result<Self, SessionError> {
    Ok(Self {
      tls: Arc::new(build_tls_config()?),
    })
  }

  pub fn with_tls_config(tls: Arc<rustls::ClientConfig>) -> Self {
    Self { tls }
  }
}

impl std::fmt::Debug for H2Connector {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(H2Connector)).finish_non_exhaustive()
  }
}

/// Native roots, ring provider, ALPN `h2`.
///
/// An empty root store is not fatal: plaintext peers still work, and TLS
/// peers fail at handshake with a verification error.
fn build_tls_config() -> Result<rustls::ClientConfig, SessionError> {
  let mut roots = rustls::RootCertStore::empty();
  let native = rustls_native_certs::load_native_certs();
  for error in &native.errors {
    tracing::debug!("skipped native cert (load error): {error}");
  }
  let (added, ignored) = roots.add_parsable_certificates(native.certs);
  tracing::debug!(added, ignored, "native TLS certificate store loaded");
  if roots.is_empty() {
    tracing::warn!("no native root certificates could be loaded");
  }
  let mut config =
    rustls::ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
      .with_safe_default_protocol_versions()
      .map_err(|error| SessionError::Tls(Arc::new(error)))?
      .with_root_certificates(roots)
      .with_no_client_auth();
  config.alpn_protocols = vec![b"h2".to_vec()];
  Ok(config)
}

/// Transport failures and GOAWAY end the connection itself; anything else is
/// a protocol error on one stream.
fn classify(error: h2::Error) -> SessionError {
  if error.is_io() || error.is_go_away() {
    tracing::debug!(%error, "HTTP/2 connection lost");
    SessionError::ConnectionLost
  } else {
    SessionError::from(error)
  }
}

impl SessionConnector for H2Connector {
  type Connection = H2Connection;

  fn connect(
    &self,
    authority: &Authority,
  ) -> BoxFuture<'static, Result<(Self::Connection, ConnectionDriver), SessionError>> {
    let authority = authority.clone();
    let tls = Arc::clone(&self.tls);
    async move {
      let tcp = TcpStream::connect((authority.host(), authority.port())).await?;
      tcp.set_nodelay(true)?;
      let io: Box<dyn SessionIo> = match authority.scheme() {
        Scheme::Http => Box::new(tcp),
        Scheme::Https => {
          let name = ServerName::try_from(authority.host().to_owned())
            .map_err(|_| SessionError::InvalidServerName(authority.host().to_owned()))?;
          Box::new(TlsConnector::from(tls).connect(name, tcp).await?)
        }
      };
      let (send_request, connection) = h2::client::Builder::new()
        .handshake::<_, Bytes>(io)
        .await?;
      tracing::debug!(%authority, "HTTP/2 handshake complete");
      let driver: ConnectionDriver = async move { connection.await.map_err(classify) }.boxed();
      Ok((H2Connection { send_request }, driver))
    }
    .boxed()
  }
}

#[derive(Clone)]
pub struct H2Connection {
  send_request: h2::client::SendRequest<Bytes>,
}

impl SessionConnection for H2Connection {
  fn max_concurrent_streams(&self) -> Option<usize> {
    Some(self.send_request.current_max_send_streams())
  }

  fn send(
    &self,
    authority: &Authority,
    request: PoolRequest,
  ) -> BoxFuture<'static, Result<PoolResponse, SessionError>> {
    let send_request = self.send_request.clone();
    let uri = format!("{}{}", authority, request.path);
    async move {
      let mut builder = http::Request::builder().method(request.method).uri(uri);
      if let Some(headers) = builder.headers_mut() {
        headers.extend(request.headers);
      }
      let head = builder.body(())?;

      let mut send_request = send_request.ready().await.map_err(classify)?;
      let (response, mut body_stream) = send_request
        .send_request(head, request.body.is_none())
        .map_err(classify)?;
      if let Some(body) = request.body {
        body_stream.send_data(body, true).map_err(classify)?;
      }

      let (parts, mut body) = response.await.map_err(classify)?.into_parts();
      let mut collected = BytesMut::new();
      while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(classify)?;
        body
          .flow_control()
          .release_capacity(chunk.len())
          .map_err(classify)?;
        collected.extend_from_slice(&chunk);
      }
      Ok(PoolResponse {
        status: parts.status,
        headers: parts.headers,
        body: collected.freeze(),
      })
    }
    .boxed()
  }
}
