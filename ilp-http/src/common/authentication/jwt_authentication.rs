// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::{
  sync::Arc,
  time::{Duration, SystemTime, UNIX_EPOCH},
};

use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::{traits::*, StaticTokenAuthentication};

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
  iat: u64,
  exp: u64,
}

struct IssuedToken {
  token: String,
  expires_at: SystemTime,
}

/// HS256 tokens signed with a shared secret and expiring after a fixed lifetime.
///
/// The last issued token is reused until half of its lifetime remains, then
/// replaced. Concurrent callers crossing that point may each sign a token;
/// every one of them is valid, so no lock is taken around signing.
pub struct JwtAuthentication {
  encoding_key: EncodingKey,
  decoding_key: DecodingKey,
  validation: Validation,
  lifetime: Duration,
  fallback: Option<StaticTokenAuthentication>,
  issued: ArcSwapOption<IssuedToken>,
}

impl JwtAuthentication {
  /// `fallback`, when given, is accepted by `verify` in addition to signed tokens.
  pub fn new(
    secret: &[u8],
    lifetime: Duration,
    fallback: Option<StaticTokenAuthentication>,
  ) -> JwtAuthentication {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.leeway = 0;
    JwtAuthentication {
      encoding_key: EncodingKey::from_secret(secret),
      decoding_key: DecodingKey::from_secret(secret),
      validation,
      lifetime,
      fallback,
      issued: ArcSwapOption::empty(),
    }
  }

  pub fn lifetime(&self) -> Duration {
    self.lifetime
  }

  pub(crate) async fn issue_at(&self, now: SystemTime) -> Result<String, CredentialError> {
    if let Some(issued) = self.issued.load_full() {
      if issued.expires_at > now + self.lifetime / 2 {
        return Ok(issued.token.clone());
      }
    }

    let iat = now
      .duration_since(UNIX_EPOCH)
      .unwrap_or_default()
      .as_secs();
    let claims = Claims {
      iat,
      exp: iat + self.lifetime.as_secs(),
    };
    // Reuse is bounded by what the verifier will accept, not by `now`
    let expires_at = UNIX_EPOCH + Duration::from_secs(claims.exp);
    let key = self.encoding_key.clone();
    let token = tokio::task::spawn_blocking(move || {
      jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
    })
    .await??;
    tracing::trace!(iat, "signed new outgoing token");
    self.issued.store(Some(Arc::new(IssuedToken {
      token: token.clone(),
      expires_at,
    })));
    Ok(token)
  }

  fn verify_signed(&self, presented: &str) -> bool {
    match jsonwebtoken::decode::<Claims>(presented, &self.decoding_key, &self.validation) {
      Ok(_) => true,
      Err(error) => {
        tracing::trace!(reason = %error, "token verification failed");
        false
      }
    }
  }
}

impl std::fmt::Debug for JwtAuthentication {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(std::any::type_name::<JwtAuthentication>())
      .field("lifetime", &self.lifetime)
      .field("static_fallback", &self.fallback.is_some())
      .finish_non_exhaustive()
  }
}

impl CredentialProvider for JwtAuthentication {
  fn verify<'a>(&'a self, presented: &'a str) -> BoxFuture<'a, bool> {
    async move {
      if let Some(fallback) = &self.fallback {
        if fallback.matches(presented) {
          return true;
        }
      }
      self.verify_signed(presented)
    }
    .boxed()
  }

  fn issue(&self) -> BoxFuture<'_, Result<String, CredentialError>> {
    self.issue_at(SystemTime::now()).boxed()
  }
}
