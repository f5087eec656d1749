// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Transport configuration, as deserialized from JSON

use std::{
  net::{IpAddr, Ipv4Addr, SocketAddr},
  path::Path,
  time::Duration,
};

use serde::{Deserialize, Serialize};

use super::{
  address::{AddressError, UrlTemplate},
  ildcp::IldcpRecord,
};

pub const DEFAULT_TOKEN_EXPIRY_MS: u64 = 30_000;
/// Token `exp` claims count whole seconds
pub const MIN_TOKEN_EXPIRY_MS: u64 = 1_000;
pub const DEFAULT_MULTI_DELIMITER: &str = "%";

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
  #[error("Credential configuration needs a jwtSecret or a staticToken")]
  MissingCredential,
  #[error("Invalid outgoing URL: {0}")]
  InvalidUrl(
    #[from]
    #[source]
    url::ParseError,
  ),
  #[error("Unsupported URL scheme {0:?}; expected http or https")]
  UnsupportedScheme(String),
  #[error("Invalid outgoing URL template: {0}")]
  InvalidTemplate(
    #[from]
    #[source]
    AddressError,
  ),
  #[error("Peer name {0:?} cannot be sent as a header value")]
  InvalidPeerName(String),
  #[error("maxRequestsPerSession must be at least 1")]
  InvalidSessionCeiling,
  #[error("tokenExpiry of {0}ms is shorter than the one-second resolution of token expiry claims")]
  InvalidTokenExpiry(u64),
  #[error("Failed to read configuration file: {0}")]
  Io(
    #[from]
    #[source]
    std::io::Error,
  ),
  #[error("Failed to parse configuration: {0}")]
  Parse(
    #[from]
    #[source]
    serde_json::Error,
  ),
}

/// Secret material for one direction of the transport.
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialConfig {
  #[serde(default, alias = "secret")]
  pub jwt_secret: Option<String>,
  #[serde(default, alias = "secretToken")]
  pub static_token: Option<String>,
}

impl std::fmt::Debug for CredentialConfig {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("CredentialConfig")
      .field("jwt_secret", &self.jwt_secret.as_ref().map(|_| "<redacted>"))
      .field("static_token", &self.static_token.as_ref().map(|_| "<redacted>"))
      .finish()
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingConfig {
  pub port: u16,
  #[serde(default = "default_bind_address")]
  pub bind_address: IpAddr,
  #[serde(flatten)]
  pub credentials: CredentialConfig,
}

impl IncomingConfig {
  pub fn listen_addr(&self) -> SocketAddr {
    SocketAddr::new(self.bind_address, self.port)
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutgoingConfig {
  pub url: String,
  #[serde(flatten)]
  pub credentials: CredentialConfig,
  #[serde(default)]
  pub http2: bool,
  #[serde(default)]
  pub name: Option<String>,
  #[serde(default)]
  pub send_ilp_destination: bool,
  /// Lifetime of signed outgoing tokens, in milliseconds
  #[serde(default)]
  pub token_expiry: Option<u64>,
  #[serde(default)]
  pub max_requests_per_session: Option<usize>,
}

impl OutgoingConfig {
  pub fn token_lifetime(&self) -> Duration {
    Duration::from_millis(self.token_expiry.unwrap_or(DEFAULT_TOKEN_EXPIRY_MS))
  }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportConfig {
  #[serde(default)]
  pub multi: bool,
  #[serde(default)]
  pub multi_delimiter: Option<String>,
  #[serde(default)]
  pub ildcp: Option<IldcpRecord>,
  pub incoming: IncomingConfig,
  pub outgoing: OutgoingConfig,
}

fn default_bind_address() -> IpAddr {
  IpAddr::V4(Ipv4Addr::UNSPECIFIED)
}

impl TransportConfig {
  pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
    Ok(serde_json::from_str(raw)?)
  }

  pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
    let raw = std::fs::read_to_string(path)?;
    Self::from_json(&raw)
  }

  /// Name sent to the peer; the incoming port when none is configured.
  pub fn peer_name(&self) -> String {
    self
      .outgoing
      .name
      .clone()
      .unwrap_or_else(|| self.incoming.port.to_string())
  }

  /// The outgoing URL, checked for scheme and, in multilateral mode, for a
  /// single substitution marker.
  pub fn url_template(&self) -> Result<UrlTemplate, ConfigError> {
    let url = &self.outgoing.url;
    let template = if self.multi {
      let marker = self
        .multi_delimiter
        .as_deref()
        .unwrap_or(DEFAULT_MULTI_DELIMITER);
      let template = UrlTemplate::segmented(url.as_str(), marker)?;
      // Segments may stand in for a host label, a port or a path element
      check_url(&template.render("0"))?;
      template
    } else {
      check_url(url)?;
      UrlTemplate::fixed(url.as_str())
    };
    Ok(template)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    self.url_template()?;
    let name = self.peer_name();
    if http::HeaderValue::from_str(&name).is_err() {
      return Err(ConfigError::InvalidPeerName(name));
    }
    if self.outgoing.max_requests_per_session == Some(0) {
      return Err(ConfigError::InvalidSessionCeiling);
    }
    match self.outgoing.token_expiry {
      Some(expiry) if expiry < MIN_TOKEN_EXPIRY_MS => {
        return Err(ConfigError::InvalidTokenExpiry(expiry));
      }
      _ => {}
    }
    if self.incoming.credentials.jwt_secret.is_none()
      && self.incoming.credentials.static_token.is_none()
    {
      return Err(ConfigError::MissingCredential);
    }
    if self.outgoing.credentials.jwt_secret.is_none()
      && self.outgoing.credentials.static_token.is_none()
    {
      return Err(ConfigError::MissingCredential);
    }
    Ok(())
  }
}

fn check_url(raw: &str) -> Result<url::Url, ConfigError> {
  let url = url::Url::parse(raw)?;
  match url.scheme() {
    "http" | "https" => Ok(url),
    other => Err(ConfigError::UnsupportedScheme(other.to_owned())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parses_original_option_names() {
    let config = TransportConfig::from_json(
      r#"{
        "multi": true,
        "multiDelimiter": "^",
        "incoming": { "port": 7768, "secretToken": "secret_number_three" },
        "outgoing": { "url": "http://localhost:^", "staticToken": "secret_number_four", "http2": true }
      }"#,
    )
    .unwrap();
    assert!(config.multi);
    assert_eq!(
      config.incoming.credentials.static_token.as_deref(),
      Some("secret_number_three")
    );
    assert_eq!(config.peer_name(), "7768");
    assert_eq!(config.outgoing.token_lifetime(), Duration::from_secs(30));
    assert!(config.outgoing.http2);
    config.validate().unwrap();
  }

  #[test]
  fn secret_is_a_jwt_secret() {
    let config = TransportConfig::from_json(
      r#"{
        "incoming": { "port": 1, "secret": "a" },
        "outgoing": { "url": "https://peer.example/ilp", "jwtSecret": "b", "name": "bob", "tokenExpiry": 60000 }
      }"#,
    )
    .unwrap();
    assert_eq!(config.incoming.credentials.jwt_secret.as_deref(), Some("a"));
    assert_eq!(config.peer_name(), "bob");
    assert_eq!(config.outgoing.token_lifetime(), Duration::from_secs(60));
    config.validate().unwrap();
  }

  #[test]
  fn multilateral_template_needs_one_marker() {
    let mut config = TransportConfig::from_json(
      r#"{
        "multi": true,
        "incoming": { "port": 1, "staticToken": "a" },
        "outgoing": { "url": "https://%.peers.example/ilp", "staticToken": "b" }
      }"#,
    )
    .unwrap();
    config.validate().unwrap();
    config.outgoing.url = "https://peers.example/ilp".into();
    assert!(matches!(
      config.validate(),
      Err(ConfigError::InvalidTemplate(_))
    ));
  }

  #[test]
  fn rejects_missing_credentials_and_bad_schemes() {
    let config = TransportConfig::from_json(
      r#"{
        "incoming": { "port": 1 },
        "outgoing": { "url": "http://peer", "staticToken": "b" }
      }"#,
    )
    .unwrap();
    assert!(matches!(config.validate(), Err(ConfigError::MissingCredential)));

    let config = TransportConfig::from_json(
      r#"{
        "incoming": { "port": 1, "staticToken": "a" },
        "outgoing": { "url": "ftp://peer", "staticToken": "b" }
      }"#,
    )
    .unwrap();
    assert!(matches!(
      config.validate(),
      Err(ConfigError::UnsupportedScheme(_))
    ));
  }

  #[test]
  fn rejects_sub_second_token_expiry() {
    let config = |expiry: u64| {
      TransportConfig::from_json(&format!(
        r#"{{
          "incoming": {{ "port": 1, "staticToken": "a" }},
          "outgoing": {{ "url": "http://peer", "jwtSecret": "b", "tokenExpiry": {} }}
        }}"#,
        expiry
      ))
      .unwrap()
    };
    assert!(matches!(
      config(900).validate(),
      Err(ConfigError::InvalidTokenExpiry(900))
    ));
    assert!(config(1000).validate().is_ok());
  }

  #[test]
  fn debug_redacts_secrets() {
    let credentials = CredentialConfig {
      jwt_secret: Some("hunter2".into()),
      static_token: None,
    };
    assert!(!format!("{:?}", credentials).contains("hunter2"));
  }
}
