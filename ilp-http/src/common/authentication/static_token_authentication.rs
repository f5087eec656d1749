// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use subtle::ConstantTimeEq;

use super::traits::*;

/// A fixed shared secret, sent verbatim and compared in constant time.
#[derive(Clone)]
pub struct StaticTokenAuthentication {
  token: Arc<str>,
}

impl StaticTokenAuthentication {
  pub fn new(token: &str) -> StaticTokenAuthentication {
    StaticTokenAuthentication {
      token: Arc::from(token),
    }
  }

  /// Constant-time comparison; the only early exit is on length mismatch.
  pub fn matches(&self, presented: &str) -> bool {
    let expected = self.token.as_bytes();
    let presented = presented.as_bytes();
    expected.len() == presented.len() && bool::from(expected.ct_eq(presented))
  }
}

impl std::fmt::Debug for StaticTokenAuthentication {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(
      f,
      "({})",
      std::any::type_name::<StaticTokenAuthentication>()
    )
  }
}

impl CredentialProvider for StaticTokenAuthentication {
  fn verify<'a>(&'a self, presented: &'a str) -> BoxFuture<'a, bool> {
    future::ready(self.matches(presented)).boxed()
  }

  fn issue(&self) -> BoxFuture<'_, Result<String, CredentialError>> {
    future::ready(Ok(self.token.to_string())).boxed()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn issues_the_fixed_value() {
    let auth = StaticTokenAuthentication::new("secret_number_four");
    assert_eq!(auth.issue().await.unwrap(), "secret_number_four");
    assert_eq!(auth.issue().await.unwrap(), "secret_number_four");
  }

  #[tokio::test]
  async fn verifies_only_identical_input() {
    let auth = StaticTokenAuthentication::new("correct-token-value");
    assert!(auth.verify("correct-token-value").await);
    assert!(!auth.verify("correct-token-valuf").await);
    assert!(!auth.verify("xorrect-token-value").await);
    assert!(!auth.verify("correct-token-value ").await);
    assert!(!auth.verify("correct-token-valu").await);
    assert!(!auth.verify("").await);
  }

  /// Every single-byte mutation is rejected regardless of its position, and the
  /// comparison always spans the full token length.
  #[test]
  fn mismatch_position_does_not_change_outcome() {
    let expected = "0123456789abcdef";
    let auth = StaticTokenAuthentication::new(expected);
    for position in 0..expected.len() {
      let mut mutated = expected.as_bytes().to_vec();
      mutated[position] = b'#';
      let mutated = String::from_utf8(mutated).unwrap();
      assert_eq!(mutated.len(), expected.len());
      assert!(!auth.matches(&mutated), "mutation at {} accepted", position);
    }
  }

  #[test]
  fn debug_output_hides_the_secret() {
    let auth = StaticTokenAuthentication::new("hunter2");
    assert!(!format!("{:?}", auth).contains("hunter2"));
  }
}
