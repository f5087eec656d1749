// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Dynamic-configuration (ILDCP) record and its per-transport cache

use std::time::{Duration, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use super::{
  handler::HandlerSlot,
  packet::{self, PacketError},
};

const ILDCP_REQUEST_EXPIRY: Duration = Duration::from_secs(60);

/// The relay's own network address and asset details, as assigned by its parent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IldcpRecord {
  pub client_address: String,
  pub asset_scale: u8,
  pub asset_code: String,
}

impl IldcpRecord {
  /// A copy of this record addressed to a child reached through `segment`.
  pub fn for_child(&self, segment: &str) -> IldcpRecord {
    IldcpRecord {
      client_address: format!("{}.{}", self.client_address, segment),
      ..self.clone()
    }
  }
}

#[derive(thiserror::Error, Debug)]
pub enum IldcpError {
  #[error("Data handler must be registered to fetch ILDCP")]
  NoHandler,
  #[error("Data handler failed while fetching ILDCP: {0}")]
  Handler(#[source] anyhow::Error),
  #[error("Invalid ILDCP response: {0}")]
  Packet(
    #[from]
    #[source]
    PacketError,
  ),
}

/// Fetches the record at most once per transport.
///
/// Concurrent first callers wait on the same in-flight fetch; a failed fetch
/// leaves the cache empty so the next caller retries.
#[derive(Debug, Default)]
pub struct IldcpCache {
  record: OnceCell<IldcpRecord>,
}

impl IldcpCache {
  pub fn new(preset: Option<IldcpRecord>) -> Self {
    Self {
      record: OnceCell::new_with(preset),
    }
  }

  pub fn cached(&self) -> Option<&IldcpRecord> {
    self.record.get()
  }

  pub async fn get_or_fetch(&self, handlers: &HandlerSlot) -> Result<&IldcpRecord, IldcpError> {
    self
      .record
      .get_or_try_init(|| async {
        let handler = handlers.current().ok_or(IldcpError::NoHandler)?;
        let request = packet::ildcp_request(SystemTime::now() + ILDCP_REQUEST_EXPIRY);
        tracing::debug!("fetching ILDCP record through data handler");
        let response = handler
          .handle_packet(request)
          .await
          .map_err(IldcpError::Handler)?;
        let record = packet::parse_ildcp_response(&response)?;
        tracing::info!(
          client_address = %record.client_address,
          asset_code = %record.asset_code,
          asset_scale = record.asset_scale,
          "ILDCP record fetched"
        );
        Ok(record)
      })
      .await
  }
}
