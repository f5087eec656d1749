// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Multilateral addressing: picking a child's routing segment out of an ILP
//! address and splicing it into the outgoing URL template.

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressError {
  #[error("Invalid address segment {segment:?}")]
  InvalidSegment { segment: String },
  #[error("Destination {destination:?} is not under relay address {relay:?}")]
  OutsideRelay { relay: String, destination: String },
  #[error("URL template must contain the marker {marker:?} exactly once, found {found}")]
  MarkerCount { marker: String, found: usize },
}

/// True when `segment` is non-empty and uses only `[A-Za-z0-9_-]`.
pub fn is_valid_segment(segment: &str) -> bool {
  !segment.is_empty()
    && segment
      .bytes()
      .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

/// The first segment of `destination` below `relay_address`.
///
/// `routing_segment("g.relay", "g.relay.alice.1234")` is `alice`.
pub fn routing_segment<'a>(relay_address: &str, destination: &'a str) -> Result<&'a str, AddressError> {
  let remainder = destination
    .strip_prefix(relay_address)
    .and_then(|rest| rest.strip_prefix('.'))
    .ok_or_else(|| AddressError::OutsideRelay {
      relay: relay_address.to_owned(),
      destination: destination.to_owned(),
    })?;
  let segment = remainder.split('.').next().unwrap_or_default();
  if !is_valid_segment(segment) {
    return Err(AddressError::InvalidSegment {
      segment: segment.to_owned(),
    });
  }
  Ok(segment)
}

/// Destination URL, optionally templated by a routing segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UrlTemplate {
  Static(String),
  Segmented { template: String, marker: String },
}

impl UrlTemplate {
  pub fn fixed(url: impl Into<String>) -> Self {
    Self::Static(url.into())
  }

  pub fn segmented(template: impl Into<String>, marker: impl Into<String>) -> Result<Self, AddressError> {
    let template = template.into();
    let marker = marker.into();
    let found = if marker.is_empty() {
      0
    } else {
      template.matches(marker.as_str()).count()
    };
    if found != 1 {
      return Err(AddressError::MarkerCount { marker, found });
    }
    Ok(Self::Segmented { template, marker })
  }

  /// The URL used when no routing segment applies.
  pub fn base(&self) -> &str {
    match self {
      Self::Static(url) => url,
      Self::Segmented { template, .. } => template,
    }
  }

  /// Renders the URL for `segment`, which must already be validated.
  pub fn render(&self, segment: &str) -> String {
    match self {
      Self::Static(url) => url.clone(),
      Self::Segmented { template, marker } => template.replacen(marker.as_str(), segment, 1),
    }
  }
}
