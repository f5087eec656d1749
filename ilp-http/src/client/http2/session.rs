// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use futures::future::{AbortHandle, Abortable, BoxFuture, FutureExt, Shared};
use tracing::Instrument;

use super::{Authority, SessionConnection, SessionConnector, SessionError};

/// Stream limit assumed before the peer has advertised one.
pub const DEFAULT_MAX_CONCURRENT_STREAMS: usize = (1 << 31) - 1;

type SharedConnect<C> = Shared<BoxFuture<'static, Result<(C, AbortHandle), SessionError>>>;

enum ConnectState<C> {
  Disconnected,
  Connecting {
    generation: u64,
    attempt: SharedConnect<C>,
  },
  Connected {
    generation: u64,
    connection: C,
    driver: AbortHandle,
  },
}

struct SessionState<C> {
  connect: ConnectState<C>,
  /// Incremented for every connection attempt; counters only apply to the
  /// connection of the generation they were taken under.
  generation: u64,
  in_flight: usize,
  served: usize,
  closed: bool,
}

impl<C> SessionState<C> {
  fn connected_generation(&self) -> Option<u64> {
    match &self.connect {
      ConnectState::Connected { generation, .. } => Some(*generation),
      _ => None,
    }
  }

  fn drop_connection(&mut self) {
    if let ConnectState::Connected { driver, .. } = &self.connect {
      driver.abort();
    }
    self.connect = ConnectState::Disconnected;
  }
}

type StateCell<C> = Mutex<SessionState<C>>;

fn lock<C>(state: &StateCell<C>) -> MutexGuard<'_, SessionState<C>> {
  state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One physical connection to an authority, reconnected on demand.
///
/// Locking is brief and never spans network I/O; the connect handshake runs
/// as a shared future that every concurrent caller awaits.
pub struct Session<K: SessionConnector> {
  connector: Arc<K>,
  authority: Authority,
  max_requests: Option<usize>,
  state: Arc<StateCell<K::Connection>>,
}

/// Admission for one request on a [`Session`]; dropping it frees the slot.
pub struct RequestPermit<C> {
  connection: C,
  generation: u64,
  state: Arc<StateCell<C>>,
}

impl<C> RequestPermit<C> {
  pub fn connection(&self) -> &C {
    &self.connection
  }
}

impl<C> Drop for RequestPermit<C> {
  fn drop(&mut self) {
    let mut state = lock(&self.state);
    // A newer connection starts its counters at zero
    if state.connected_generation() == Some(self.generation) {
      state.in_flight = state.in_flight.saturating_sub(1);
    }
  }
}

impl<K: SessionConnector> Session<K> {
  pub fn new(connector: Arc<K>, authority: Authority, max_requests: Option<usize>) -> Self {
    Self {
      connector,
      authority,
      max_requests,
      state: Arc::new(Mutex::new(SessionState {
        connect: ConnectState::Disconnected,
        generation: 0,
        in_flight: 0,
        served: 0,
        closed: false,
      })),
    }
  }

  pub fn authority(&self) -> &Authority {
    &self.authority
  }

  pub fn in_flight(&self) -> usize {
    lock(&self.state).in_flight
  }

  /// Requests admitted since the current connection was established.
  pub fn served(&self) -> usize {
    lock(&self.state).served
  }

  pub fn is_connected(&self) -> bool {
    lock(&self.state).connected_generation().is_some()
  }

  fn at_ceiling(&self, served: usize) -> bool {
    self.max_requests.map_or(false, |max| served >= max)
  }

  /// Admits one request, connecting first if needed.
  ///
  /// Returns `Ok(None)` when the connection is at its stream limit or its
  /// request ceiling; the caller should try another session.
  pub async fn allocate_request(
    &self,
  ) -> Result<Option<RequestPermit<K::Connection>>, SessionError> {
    loop {
      let (generation, attempt) = {
        let mut state = lock(&self.state);
        if state.closed {
          return Err(SessionError::Closed);
        }
        if state.connected_generation().is_some()
          && self.at_ceiling(state.served)
          && state.in_flight == 0
        {
          tracing::debug!(
            authority = %self.authority,
            served = state.served,
            "recycling session at request ceiling"
          );
          state.drop_connection();
          state.served = 0;
        }
        if let ConnectState::Connected {
          generation,
          connection,
          ..
        } = &state.connect
        {
          let generation = *generation;
          let connection = connection.clone();
          let limit = connection
            .max_concurrent_streams()
            .unwrap_or(DEFAULT_MAX_CONCURRENT_STREAMS);
          if state.in_flight >= limit || self.at_ceiling(state.served) {
            tracing::trace!(
              authority = %self.authority,
              in_flight = state.in_flight,
              served = state.served,
              "session has no capacity"
            );
            return Ok(None);
          }
          state.in_flight += 1;
          state.served += 1;
          return Ok(Some(RequestPermit {
            connection,
            generation,
            state: Arc::clone(&self.state),
          }));
        }
        let pending = match &state.connect {
          ConnectState::Connecting {
            generation,
            attempt,
          } => Some((*generation, attempt.clone())),
          _ => None,
        };
        match pending {
          Some(pending) => pending,
          None => {
            state.generation += 1;
            let generation = state.generation;
            let attempt = self.start_connect(generation);
            state.connect = ConnectState::Connecting {
              generation,
              attempt: attempt.clone(),
            };
            (generation, attempt)
          }
        }
      };

      let outcome = attempt.await;

      let mut state = lock(&self.state);
      let current = match &state.connect {
        ConnectState::Connecting { generation: g, .. } if *g == generation => Some(false),
        ConnectState::Connected { generation: g, .. } if *g == generation => Some(true),
        _ => None,
      };
      match outcome {
        Err(error) => {
          if current == Some(false) {
            state.connect = ConnectState::Disconnected;
          }
          return Err(error);
        }
        Ok((_, driver)) if state.closed => {
          driver.abort();
          return Err(SessionError::Closed);
        }
        Ok((connection, driver)) => match current {
          Some(false) => {
            tracing::debug!(authority = %self.authority, generation, "session connected");
            state.connect = ConnectState::Connected {
              generation,
              connection,
              driver,
            };
            state.in_flight = 0;
            state.served = 0;
          }
          // Another waiter already installed this connection
          Some(true) => {}
          // The driver finished before anyone could use the connection
          None => {
            driver.abort();
            tracing::debug!(
              authority = %self.authority,
              generation,
              "connection ended before use"
            );
            return Err(SessionError::ConnectionLost);
          }
        },
      }
    }
  }

  fn start_connect(&self, generation: u64) -> SharedConnect<K::Connection> {
    let connecting = self.connector.connect(&self.authority);
    let state = Arc::downgrade(&self.state);
    let span = tracing::debug_span!("session", authority = %self.authority, generation);
    async move {
      let (connection, driver) = connecting.await?;
      let (abort, registration) = AbortHandle::new_pair();
      tokio::spawn(
        async move {
          match Abortable::new(driver, registration).await {
            Ok(Ok(())) => tracing::debug!("connection closed by peer"),
            Ok(Err(error)) => tracing::warn!(%error, "connection failed"),
            Err(_aborted) => tracing::trace!("connection closed locally"),
          }
          disconnect_if_current(&state, generation);
        }
        .in_current_span(),
      );
      Ok((connection, abort))
    }
    .instrument(span)
    .boxed()
    .shared()
  }

  /// Tears down the connection; later allocations fail with [`SessionError::Closed`].
  pub fn close(&self) {
    let mut state = lock(&self.state);
    if !state.closed {
      tracing::debug!(authority = %self.authority, "closing session");
    }
    state.closed = true;
    state.drop_connection();
  }
}

/// Runs when a connection's driver finishes. The handshake may have resolved
/// without any waiter having installed the connection yet, so a matching
/// `Connecting` generation is reset as well as a matching `Connected` one.
fn disconnect_if_current<C>(state: &Weak<StateCell<C>>, generation: u64) {
  if let Some(state) = state.upgrade() {
    let mut state = lock(&state);
    let current = match &state.connect {
      ConnectState::Connecting { generation: g, .. }
      | ConnectState::Connected { generation: g, .. } => *g == generation,
      ConnectState::Disconnected => false,
    };
    if current {
      state.connect = ConnectState::Disconnected;
    }
  }
}

impl<K: SessionConnector> Drop for Session<K> {
  fn drop(&mut self) {
    lock(&self.state).drop_connection();
  }
}

impl<K: SessionConnector> std::fmt::Debug for Session<K> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let state = lock(&self.state);
    f.debug_struct(stringify!(Session))
      .field("authority", &self.authority)
      .field("connected", &state.connected_generation().is_some())
      .field("in_flight", &state.in_flight)
      .field("served", &state.served)
      .field("closed", &state.closed)
      .finish_non_exhaustive()
  }
}

#[cfg(test)]
mod tests {
  use std::time::Duration;

  use super::{
    super::testing::{authority, Behavior, FakeConnector},
    *,
  };

  fn session(connector: &Arc<FakeConnector>, max_requests: Option<usize>) -> Session<FakeConnector> {
    Session::new(Arc::clone(connector), authority(), max_requests)
  }

  #[tokio::test]
  async fn never_exceeds_stream_limit() {
    let connector = Arc::new(FakeConnector::new(Some(2), Behavior::Echo));
    let session = session(&connector, None);

    let first = session.allocate_request().await.unwrap().unwrap();
    let second = session.allocate_request().await.unwrap().unwrap();
    assert!(session.allocate_request().await.unwrap().is_none());
    assert_eq!(session.in_flight(), 2);

    // Freeing one slot admits exactly one more
    drop(first);
    let third = session.allocate_request().await.unwrap().unwrap();
    assert!(session.allocate_request().await.unwrap().is_none());
    assert_eq!(session.served(), 3);
    assert_eq!(connector.connects(), 1);
    drop((second, third));
    assert_eq!(session.in_flight(), 0);
  }

  #[tokio::test]
  async fn unknown_stream_limit_uses_default() {
    let connector = Arc::new(FakeConnector::new(None, Behavior::Echo));
    let session = session(&connector, None);
    let permits = futures::future::try_join_all((0..64).map(|_| session.allocate_request()))
      .await
      .unwrap();
    assert!(permits.iter().all(Option::is_some));
    assert_eq!(session.in_flight(), 64);
  }

  #[tokio::test]
  async fn reconnects_when_idle_at_ceiling() {
    let connector = Arc::new(FakeConnector::new(Some(10), Behavior::Echo));
    let session = session(&connector, Some(2));

    let a = session.allocate_request().await.unwrap().unwrap();
    assert_eq!(a.connection().id, 1);
    let b = session.allocate_request().await.unwrap().unwrap();
    // At the ceiling with requests still in flight: no capacity, no reconnect
    assert!(session.allocate_request().await.unwrap().is_none());
    drop(a);
    assert!(session.allocate_request().await.unwrap().is_none());
    assert_eq!(connector.connects(), 1);
    drop(b);

    // Idle at the ceiling: the next allocation reconnects
    let c = session.allocate_request().await.unwrap().unwrap();
    assert_eq!(c.connection().id, 2);
    assert_eq!(connector.connects(), 2);
    assert_eq!(session.served(), 1);
  }

  #[tokio::test]
  async fn concurrent_callers_share_one_handshake() {
    let mut connector = FakeConnector::new(Some(100), Behavior::Echo);
    connector.connect_delay = Duration::from_millis(20);
    let connector = Arc::new(connector);
    let session = session(&connector, None);

    let permits = futures::future::try_join_all((0..8).map(|_| session.allocate_request()))
      .await
      .unwrap();
    assert_eq!(connector.connects(), 1);
    assert!(permits.iter().flatten().all(|p| p.connection().id == 1));
    assert_eq!(session.in_flight(), 8);
  }

  #[tokio::test]
  async fn connect_failure_reaches_every_waiter() {
    let mut connector = FakeConnector::new(Some(100), Behavior::Echo);
    connector.connect_delay = Duration::from_millis(20);
    connector.fail_connect = true;
    let connector = Arc::new(connector);
    let session = session(&connector, None);

    let results = futures::future::join_all((0..4).map(|_| session.allocate_request())).await;
    assert!(results
      .iter()
      .all(|r| matches!(r, Err(SessionError::Connect(_)))));
    assert_eq!(connector.connects(), 1);
    assert!(!session.is_connected());

    // The failed attempt is not memoized
    assert!(session.allocate_request().await.is_err());
    assert_eq!(connector.connects(), 2);
  }

  #[tokio::test]
  async fn transport_error_disconnects_and_next_allocation_reconnects() {
    let connector = Arc::new(FakeConnector::new(Some(4), Behavior::Echo));
    let session = session(&connector, None);

    let stale = session.allocate_request().await.unwrap().unwrap();
    assert!(session.is_connected());
    connector.reset_latest();
    tokio::time::timeout(Duration::from_secs(1), async {
      while session.is_connected() {
        tokio::task::yield_now().await;
      }
    })
    .await
    .unwrap();

    let fresh = session.allocate_request().await.unwrap().unwrap();
    assert_eq!(fresh.connection().id, 2);
    assert_eq!(session.in_flight(), 1);
    // A permit from the dead connection does not touch the new counters
    drop(stale);
    assert_eq!(session.in_flight(), 1);
  }

  #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
  async fn connections_that_end_immediately_never_stay_installed() {
    let mut connector = FakeConnector::new(Some(4), Behavior::Echo);
    connector.dead_on_arrival = true;
    let connector = Arc::new(connector);
    let sessions: Vec<_> = (0..200).map(|_| Arc::new(session(&connector, None))).collect();

    let allocations = sessions.iter().map(|session| {
      let session = Arc::clone(session);
      tokio::spawn(async move {
        match session.allocate_request().await {
          Ok(Some(_)) | Err(SessionError::ConnectionLost) => {}
          other => panic!("unexpected allocation outcome: {:?}", other.map(|p| p.is_some())),
        }
      })
    });
    for allocation in futures::future::join_all(allocations).await {
      allocation.unwrap();
    }

    tokio::time::timeout(Duration::from_secs(2), async {
      while sessions.iter().any(|session| session.is_connected()) {
        tokio::time::sleep(Duration::from_millis(1)).await;
      }
    })
    .await
    .expect("a session stayed connected to a finished connection");

    // The next allocation opens a fresh connection rather than reusing the dead one
    let before = connector.connects();
    let _ = sessions[0].allocate_request().await;
    assert_eq!(connector.connects(), before + 1);
  }

  #[tokio::test]
  async fn close_is_idempotent_and_final() {
    let connector = Arc::new(FakeConnector::new(Some(4), Behavior::Echo));
    let session = session(&connector, None);
    let permit = session.allocate_request().await.unwrap().unwrap();
    session.close();
    session.close();
    assert!(!session.is_connected());
    assert!(matches!(
      session.allocate_request().await,
      Err(SessionError::Closed)
    ));
    drop(permit);
  }
}
