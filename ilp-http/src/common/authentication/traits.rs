// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;

use super::{JwtAuthentication, StaticTokenAuthentication};
use crate::common::config::{ConfigError, CredentialConfig};

/// Issues credentials for outgoing requests and verifies those presented by a peer.
///
/// Verification never fails with an error; anything that cannot be validated
/// is simply not authentic.
pub trait CredentialProvider: std::fmt::Debug + Send + Sync {
  fn verify<'a>(&'a self, presented: &'a str) -> BoxFuture<'a, bool>;

  fn issue(&self) -> BoxFuture<'_, Result<String, CredentialError>>;
}

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
  #[error("Failed to sign token: {0}")]
  Signing(
    #[from]
    #[source]
    jsonwebtoken::errors::Error,
  ),
  #[error("Signing task failed to rejoin: {0}")]
  Join(
    #[from]
    #[source]
    tokio::task::JoinError,
  ),
}

/// Builds the provider selected by `config`.
///
/// A JWT secret selects signed tokens, with any static token also accepted
/// on verification; a static token alone selects the static strategy.
pub fn credential_provider(
  config: &CredentialConfig,
  lifetime: Duration,
) -> Result<Arc<dyn CredentialProvider>, ConfigError> {
  match (&config.jwt_secret, &config.static_token) {
    (Some(secret), static_token) => {
      let fallback = static_token.as_deref().map(StaticTokenAuthentication::new);
      Ok(Arc::new(JwtAuthentication::new(secret.as_bytes(), lifetime, fallback)))
    }
    (None, Some(token)) => Ok(Arc::new(StaticTokenAuthentication::new(token))),
    (None, None) => Err(ConfigError::MissingCredential),
  }
}
