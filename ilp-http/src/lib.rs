// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Interledger packets carried over HTTP/1.1 and multiplexed HTTP/2.

pub mod common;

pub mod client;
pub mod server;
pub mod transport;

pub use common::{
  config::{ConfigError, TransportConfig},
  handler::{MoneyHandler, PacketHandler},
  ildcp::IldcpRecord,
};
pub use transport::{HttpTransport, TransportError};
