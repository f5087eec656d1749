// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Outbound sender: posts local packets to the peer over HTTP/1.1 or a
//! pooled HTTP/2 session.

use std::sync::Arc;

use bytes::Bytes;
use http::{
  header::{AUTHORIZATION, CONTENT_TYPE},
  HeaderMap, HeaderValue, Method, StatusCode,
};

use crate::common::{
  address::{routing_segment, AddressError, UrlTemplate},
  authentication::{credential_provider, CredentialError, CredentialProvider},
  config::{ConfigError, TransportConfig},
  handler::HandlerSlot,
  ildcp::{IldcpCache, IldcpError},
  packet::{read_destination, PacketError},
  DESTINATION_HEADER, ILP_CONTENT_TYPE, PEER_NAME_HEADER,
};

pub mod http2;

use self::http2::{Authority, AuthorityError, H2Connector, PoolRequest, SessionError, SessionPools};

#[derive(thiserror::Error, Debug)]
pub enum SendError {
  #[error("Transport is not connected")]
  NotConnected,
  #[error("Peer responded with status {status}")]
  RemoteError { status: StatusCode },
  #[error("Cannot route packet: {0}")]
  InvalidRoutingSegment(
    #[from]
    #[source]
    AddressError,
  ),
  #[error("Packet has no readable destination: {0}")]
  InvalidPacket(
    #[from]
    #[source]
    PacketError,
  ),
  #[error("Relay address unavailable: {0}")]
  Ildcp(
    #[from]
    #[source]
    IldcpError,
  ),
  #[error("Failed to issue credential: {0}")]
  Credential(
    #[from]
    #[source]
    CredentialError,
  ),
  #[error("Issued credential is not a valid header value")]
  InvalidCredential,
  #[error("Destination {0:?} is not a valid header value")]
  InvalidDestination(String),
  #[error("Invalid destination URL {url:?}: {reason}")]
  InvalidUrl { url: String, reason: String },
  #[error("HTTP/2 transport error: {0}")]
  Transport(
    #[from]
    #[source]
    SessionError,
  ),
  #[error("HTTP transport error: {0}")]
  Http(
    #[from]
    #[source]
    reqwest::Error,
  ),
}

#[derive(thiserror::Error, Debug)]
pub enum ClientSetupError {
  #[error(transparent)]
  Config(#[from] ConfigError),
  #[error("Failed to build HTTP client: {0}")]
  Http(
    #[from]
    #[source]
    reqwest::Error,
  ),
  #[error("Failed to prepare HTTP/2 sessions: {0}")]
  Sessions(
    #[from]
    #[source]
    SessionError,
  ),
}

enum Dispatch {
  /// One unpooled request per packet
  Http1(reqwest::Client),
  Http2(SessionPools<H2Connector>),
}

pub struct OutboundSender {
  credentials: Arc<dyn CredentialProvider>,
  template: UrlTemplate,
  peer_name: HeaderValue,
  send_destination: bool,
  dispatch: Dispatch,
}

impl OutboundSender {
  pub fn new(config: &TransportConfig) -> Result<Self, ClientSetupError> {
    let outgoing = &config.outgoing;
    let credentials = credential_provider(&outgoing.credentials, outgoing.token_lifetime())?;
    let template = config.url_template()?;
    let peer_name = config.peer_name();
    let peer_name =
      HeaderValue::from_str(&peer_name).map_err(|_| ConfigError::InvalidPeerName(peer_name))?;
    let dispatch = if outgoing.http2 {
      Dispatch::Http2(SessionPools::new(
        H2Connector::new()?,
        outgoing.max_requests_per_session,
      ))
    } else {
      Dispatch::Http1(
        reqwest::Client::builder()
          .http1_only()
          .pool_max_idle_per_host(0)
          .build()?,
      )
    };
    Ok(Self {
      credentials,
      template,
      peer_name,
      send_destination: outgoing.send_ilp_destination,
      dispatch,
    })
  }

  /// Posts `packet` to the peer and returns the peer's reply bytes.
  ///
  /// In multilateral mode the URL is chosen by the packet's routing segment
  /// below the relay address, fetching that address through `handlers` the
  /// first time it is needed.
  pub async fn send(
    &self,
    packet: Bytes,
    ildcp: &IldcpCache,
    handlers: &HandlerSlot,
  ) -> Result<Bytes, SendError> {
    let token = self.credentials.issue().await?;
    let mut headers = HeaderMap::new();
    headers.insert(
      AUTHORIZATION,
      HeaderValue::from_str(&token).map_err(|_| SendError::InvalidCredential)?,
    );
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(ILP_CONTENT_TYPE));
    headers.insert(PEER_NAME_HEADER, self.peer_name.clone());

    let segmented = matches!(self.template, UrlTemplate::Segmented { .. });
    let destination = if segmented || self.send_destination {
      Some(read_destination(&packet)?)
    } else {
      None
    };
    if let (true, Some(destination)) = (self.send_destination, destination) {
      let value = HeaderValue::from_str(destination)
        .map_err(|_| SendError::InvalidDestination(destination.to_owned()))?;
      headers.insert(DESTINATION_HEADER, value);
    }

    let url = match destination {
      Some(destination) if segmented => {
        let relay = ildcp.get_or_fetch(handlers).await?;
        let segment = routing_segment(&relay.client_address, destination)?;
        self.template.render(segment)
      }
      _ => self.template.base().to_owned(),
    };
    let url = url::Url::parse(&url).map_err(|error| SendError::InvalidUrl {
      url: url.clone(),
      reason: error.to_string(),
    })?;
    tracing::trace!(host = ?url.host_str(), bytes = packet.len(), "sending packet");

    let (status, body) = match &self.dispatch {
      Dispatch::Http2(pools) => {
        let authority = Authority::from_url(&url).map_err(|error: AuthorityError| {
          SendError::InvalidUrl {
            url: url.to_string(),
            reason: error.to_string(),
          }
        })?;
        let response = pools
          .fetch(
            &authority,
            PoolRequest {
              method: Method::POST,
              path: path_and_query(&url),
              headers,
              body: Some(packet),
            },
          )
          .await?;
        (response.status, response.body)
      }
      Dispatch::Http1(client) => {
        let response = client.post(url).headers(headers).body(packet).send().await?;
        let status = response.status();
        (status, response.bytes().await?)
      }
    };

    if !status.is_success() {
      tracing::debug!(%status, "peer refused packet");
      return Err(SendError::RemoteError { status });
    }
    Ok(body)
  }

  /// Closes every pooled session; a later send opens fresh ones.
  pub fn close_sessions(&self) {
    if let Dispatch::Http2(pools) = &self.dispatch {
      pools.close_all();
    }
  }
}

impl std::fmt::Debug for OutboundSender {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(OutboundSender))
      .field("template", &self.template)
      .field("http2", &matches!(self.dispatch, Dispatch::Http2(_)))
      .field("send_destination", &self.send_destination)
      .finish_non_exhaustive()
  }
}

fn path_and_query(url: &url::Url) -> String {
  match url.query() {
    Some(query) => format!("{}?{}", url.path(), query),
    None => url.path().to_owned(),
  }
}
