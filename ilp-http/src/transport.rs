// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! The transport as seen by a routing node: one lifecycle object wrapping the
//! inbound gateway and the outbound sender.

use std::{
  net::SocketAddr,
  sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
  },
};

use bytes::Bytes;
use tokio::sync::Mutex;

use crate::{
  client::{ClientSetupError, OutboundSender, SendError},
  common::{
    authentication::credential_provider,
    config::{ConfigError, TransportConfig},
    handler::{HandlerSlot, MoneyHandler, PacketHandler},
    ildcp::{IldcpCache, IldcpRecord},
  },
  server::{Gateway, GatewayState},
};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
  #[error("Invalid configuration: {0}")]
  Config(
    #[from]
    #[source]
    ConfigError,
  ),
  #[error("Failed to prepare outbound client: {0}")]
  Client(
    #[from]
    #[source]
    ClientSetupError,
  ),
  #[error("Failed to listen on {addr}: {source}")]
  Listen {
    addr: SocketAddr,
    #[source]
    source: std::io::Error,
  },
}

/// Bidirectional ILP-over-HTTP transport.
///
/// Everything cached (the ILDCP record, HTTP/2 sessions) belongs to this
/// instance, so independent transports can share a process.
pub struct HttpTransport {
  config: TransportConfig,
  connected: Arc<AtomicBool>,
  handlers: HandlerSlot,
  ildcp: Arc<IldcpCache>,
  outbound: OutboundSender,
  gateway_state: Arc<GatewayState>,
  // Serializes connect and disconnect, which await the listener bind
  gateway: Mutex<Option<Gateway>>,
}

impl HttpTransport {
  pub fn new(config: TransportConfig) -> Result<Self, TransportError> {
    config.validate()?;
    let incoming_credentials =
      credential_provider(&config.incoming.credentials, config.outgoing.token_lifetime())?;
    let outbound = OutboundSender::new(&config)?;
    let connected = Arc::new(AtomicBool::new(false));
    let handlers = HandlerSlot::default();
    let ildcp = Arc::new(IldcpCache::new(config.ildcp.clone()));
    let gateway_state = Arc::new(GatewayState {
      credentials: incoming_credentials,
      connected: Arc::clone(&connected),
      multi: config.multi,
      handlers: handlers.clone(),
      ildcp: Arc::clone(&ildcp),
    });
    Ok(Self {
      config,
      connected,
      handlers,
      ildcp,
      outbound,
      gateway_state,
      gateway: Mutex::new(None),
    })
  }

  pub fn config(&self) -> &TransportConfig {
    &self.config
  }

  /// Starts the listener. Calling it while connected does nothing.
  pub async fn connect(&self) -> Result<(), TransportError> {
    let mut gateway = self.gateway.lock().await;
    if gateway.is_some() {
      return Ok(());
    }
    let addr = self.config.incoming.listen_addr();
    let listening = Gateway::listen(addr, Arc::clone(&self.gateway_state))
      .await
      .map_err(|source| TransportError::Listen { addr, source })?;
    let local_addr = listening.local_addr();
    *gateway = Some(listening);
    self.connected.store(true, Ordering::SeqCst);
    tracing::info!(%local_addr, multi = self.config.multi, "transport connected");
    Ok(())
  }

  /// Stops the listener and closes every outbound session.
  ///
  /// Inbound requests already past authentication finish; pooled outbound
  /// requests fail with their connection.
  pub async fn disconnect(&self) {
    let mut gateway = self.gateway.lock().await;
    self.connected.store(false, Ordering::SeqCst);
    self.outbound.close_sessions();
    if let Some(gateway) = gateway.take() {
      gateway.shutdown();
      tracing::info!(local_addr = %gateway.local_addr(), "transport disconnected");
    }
  }

  pub fn is_connected(&self) -> bool {
    self.connected.load(Ordering::SeqCst)
  }

  /// Address the listener is bound to, while connected.
  pub async fn local_addr(&self) -> Option<SocketAddr> {
    self.gateway.lock().await.as_ref().map(Gateway::local_addr)
  }

  /// The relay record, if it has been configured or fetched.
  pub fn ildcp_record(&self) -> Option<&IldcpRecord> {
    self.ildcp.cached()
  }

  pub async fn send_data(&self, packet: Bytes) -> Result<Bytes, SendError> {
    if !self.is_connected() {
      return Err(SendError::NotConnected);
    }
    self.outbound.send(packet, &self.ildcp, &self.handlers).await
  }

  pub fn register_data_handler<H: PacketHandler + 'static>(&self, handler: H) {
    self.handlers.register(handler);
  }

  pub fn deregister_data_handler(&self) {
    self.handlers.deregister();
  }

  /// Accepted so routing nodes can wire settlement uniformly; never invoked.
  pub fn register_money_handler<H: MoneyHandler + 'static>(&self, _handler: H) {
    tracing::trace!("money handler ignored; packets only");
  }

  pub fn deregister_money_handler(&self) {}

  /// No value moves over this transport.
  pub async fn send_money(&self, _amount: u64) -> Result<(), SendError> {
    Ok(())
  }
}

impl std::fmt::Debug for HttpTransport {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(HttpTransport))
      .field("connected", &self.is_connected())
      .field("multi", &self.config.multi)
      .field("handlers", &self.handlers)
      .field("outbound", &self.outbound)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::AtomicUsize;

  use axum::{http::StatusCode, Router};
  use serde_json::json;
  use tokio::net::TcpListener;

  use super::*;
  use crate::common::packet;

  fn init_tracing() {
    let _ = tracing_subscriber::fmt()
      .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
      .with_test_writer()
      .try_init();
  }

  fn transport(config: serde_json::Value) -> HttpTransport {
    init_tracing();
    HttpTransport::new(serde_json::from_value(config).unwrap()).unwrap()
  }

  async fn connected_echo(incoming: serde_json::Value, multi: bool) -> (HttpTransport, String) {
    let outgoing = if multi { "http://127.0.0.1:9/%" } else { "http://127.0.0.1:9/" };
    let peer = transport(json!({
      "multi": multi,
      "ildcp": { "clientAddress": "g.relay", "assetScale": 9, "assetCode": "XRP" },
      "incoming": incoming,
      "outgoing": { "url": outgoing, "staticToken": "unused" }
    }));
    peer.register_data_handler(|packet: Bytes| async move { Ok::<_, anyhow::Error>(packet) });
    peer.connect().await.unwrap();
    let url = format!("http://{}", peer.local_addr().await.unwrap());
    (peer, url)
  }

  #[tokio::test]
  async fn round_trips_between_two_transports() {
    let (peer, url) =
      connected_echo(json!({ "port": 0, "bindAddress": "127.0.0.1", "staticToken": "b_in" }), false)
        .await;
    let local = transport(json!({
      "incoming": { "port": 0, "bindAddress": "127.0.0.1", "staticToken": "a_in" },
      "outgoing": { "url": url, "staticToken": "b_in" }
    }));
    local.connect().await.unwrap();

    let reply = local.send_data(Bytes::from_static(b"P")).await.unwrap();
    assert_eq!(&reply[..], b"P");

    local.disconnect().await;
    peer.disconnect().await;
  }

  #[tokio::test]
  async fn round_trips_over_http2_with_signed_tokens() {
    let (peer, url) =
      connected_echo(json!({ "port": 0, "bindAddress": "127.0.0.1", "jwtSecret": "shared" }), false)
        .await;
    let local = transport(json!({
      "incoming": { "port": 0, "bindAddress": "127.0.0.1", "staticToken": "a_in" },
      "outgoing": { "url": url, "jwtSecret": "shared", "http2": true, "maxRequestsPerSession": 3 }
    }));
    local.connect().await.unwrap();

    let replies = futures::future::try_join_all(
      (0..10u8).map(|i| local.send_data(Bytes::from(vec![i; 16]))),
    )
    .await
    .unwrap();
    for (i, reply) in replies.iter().enumerate() {
      assert_eq!(&reply[..], &vec![i as u8; 16][..]);
    }
    peer.disconnect().await;
  }

  #[tokio::test]
  async fn wrong_credentials_surface_as_401() {
    let (_peer, url) =
      connected_echo(json!({ "port": 0, "bindAddress": "127.0.0.1", "staticToken": "b_in" }), false)
        .await;
    let local = transport(json!({
      "incoming": { "port": 0, "bindAddress": "127.0.0.1", "staticToken": "a_in" },
      "outgoing": { "url": url, "staticToken": "guess" }
    }));
    local.connect().await.unwrap();
    assert!(matches!(
      local.send_data(Bytes::from_static(b"P")).await,
      Err(SendError::RemoteError {
        status: StatusCode::UNAUTHORIZED
      })
    ));
  }

  #[tokio::test]
  async fn remote_503_fails_once_without_retry() {
    let hits = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&hits);
    let app = Router::new().fallback(move || {
      let counter = Arc::clone(&counter);
      async move {
        counter.fetch_add(1, Ordering::SeqCst);
        StatusCode::SERVICE_UNAVAILABLE
      }
    });
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

    let local = transport(json!({
      "incoming": { "port": 0, "bindAddress": "127.0.0.1", "staticToken": "a_in" },
      "outgoing": { "url": format!("http://{}", addr), "staticToken": "out" }
    }));
    local.connect().await.unwrap();
    let outcome = local.send_data(Bytes::from_static(b"P")).await;
    assert!(matches!(
      outcome,
      Err(SendError::RemoteError {
        status: StatusCode::SERVICE_UNAVAILABLE
      })
    ));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn child_learns_its_address_from_a_multilateral_relay() {
    let (relay, url) =
      connected_echo(json!({ "port": 0, "bindAddress": "127.0.0.1", "staticToken": "relay_in" }), true)
        .await;
    let child = transport(json!({
      "incoming": { "port": 0, "bindAddress": "127.0.0.1", "staticToken": "child_in" },
      "outgoing": { "url": url, "staticToken": "relay_in", "name": "alice" }
    }));
    child.connect().await.unwrap();

    let response = child
      .send_data(packet::ildcp_request(std::time::SystemTime::now()))
      .await
      .unwrap();
    let record = packet::parse_ildcp_response(&response).unwrap();
    assert_eq!(record.client_address, "g.relay.alice");
    assert_eq!(relay.ildcp_record().unwrap().client_address, "g.relay");
  }

  #[tokio::test]
  async fn lifecycle_is_idempotent() {
    let local = transport(json!({
      "incoming": { "port": 0, "bindAddress": "127.0.0.1", "staticToken": "a_in" },
      "outgoing": { "url": "http://127.0.0.1:9", "staticToken": "out" }
    }));
    assert!(!local.is_connected());
    assert!(matches!(
      local.send_data(Bytes::from_static(b"P")).await,
      Err(SendError::NotConnected)
    ));

    local.connect().await.unwrap();
    let first = local.local_addr().await.unwrap();
    local.connect().await.unwrap();
    assert_eq!(local.local_addr().await, Some(first));
    assert!(local.is_connected());

    local.disconnect().await;
    local.disconnect().await;
    assert!(!local.is_connected());
    assert_eq!(local.local_addr().await, None);

    local.connect().await.unwrap();
    assert!(local.is_connected());
    local.disconnect().await;
  }

  #[tokio::test]
  async fn money_hooks_are_inert() {
    let local = transport(json!({
      "incoming": { "port": 0, "staticToken": "a_in" },
      "outgoing": { "url": "http://127.0.0.1:9", "staticToken": "out" }
    }));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    local.register_money_handler(move |_amount: u64| {
      counter.fetch_add(1, Ordering::SeqCst);
      async move { Ok::<_, anyhow::Error>(()) }
    });
    local.send_money(100).await.unwrap();
    local.deregister_money_handler();
    assert_eq!(calls.load(Ordering::SeqCst), 0);
  }

  #[test]
  fn invalid_configuration_is_refused() {
    let config: TransportConfig = serde_json::from_value(json!({
      "multi": true,
      "incoming": { "port": 0, "staticToken": "a_in" },
      "outgoing": { "url": "http://peer.example/", "staticToken": "out" }
    }))
    .unwrap();
    assert!(matches!(
      HttpTransport::new(config),
      Err(TransportError::Config(ConfigError::InvalidTemplate(_)))
    ));
  }
}
