// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Handlers registered by the routing node that owns a transport

use std::sync::Arc;

use arc_swap::ArcSwapOption;
use bytes::Bytes;
use futures::future::{BoxFuture, Future, FutureExt};

/// Receives raw ILP packets arriving from the peer and produces the raw reply.
#[cfg_attr(test, mockall::automock)]
pub trait PacketHandler: Send + Sync {
  fn handle_packet(&self, packet: Bytes) -> BoxFuture<'static, anyhow::Result<Bytes>>;
}

impl<F, Fut> PacketHandler for F
where
  F: Fn(Bytes) -> Fut + Send + Sync,
  Fut: Future<Output = anyhow::Result<Bytes>> + Send + 'static,
{
  fn handle_packet(&self, packet: Bytes) -> BoxFuture<'static, anyhow::Result<Bytes>> {
    self(packet).boxed()
  }
}

/// Settlement hook; this transport carries packets only and never invokes it.
pub trait MoneyHandler: Send + Sync {
  fn handle_money(&self, amount: u64) -> BoxFuture<'static, anyhow::Result<()>>;
}

impl<F, Fut> MoneyHandler for F
where
  F: Fn(u64) -> Fut + Send + Sync,
  Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
  fn handle_money(&self, amount: u64) -> BoxFuture<'static, anyhow::Result<()>> {
    self(amount).boxed()
  }
}

/// Single registered packet handler, swappable while requests are in flight.
///
/// Requests that already loaded a handler finish with it even if it is
/// replaced or removed meanwhile.
#[derive(Clone, Default)]
pub struct HandlerSlot(Arc<ArcSwapOption<Box<dyn PacketHandler>>>);

impl HandlerSlot {
  pub fn register<H: PacketHandler + 'static>(&self, handler: H) {
    self.0.store(Some(Arc::new(Box::new(handler))));
  }

  pub fn deregister(&self) {
    self.0.store(None);
  }

  pub fn current(&self) -> Option<Arc<Box<dyn PacketHandler>>> {
    self.0.load_full()
  }

  pub fn is_registered(&self) -> bool {
    self.0.load().is_some()
  }
}

impl std::fmt::Debug for HandlerSlot {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("HandlerSlot")
      .field("registered", &self.is_registered())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn swaps_registered_handler() {
    let slot = HandlerSlot::default();
    assert!(slot.current().is_none());

    slot.register(|packet: Bytes| async move { Ok::<_, anyhow::Error>(packet) });
    let first = slot.current().unwrap();

    slot.register(|_packet: Bytes| async move {
      Ok::<_, anyhow::Error>(Bytes::from_static(b"second"))
    });
    // The handler loaded before the swap keeps working
    let echoed = first.handle_packet(Bytes::from_static(b"first")).await.unwrap();
    assert_eq!(&echoed[..], b"first");
    let replaced = slot.current().unwrap();
    assert_eq!(&replaced.handle_packet(Bytes::new()).await.unwrap()[..], b"second");

    slot.deregister();
    assert!(!slot.is_registered());
  }
}
