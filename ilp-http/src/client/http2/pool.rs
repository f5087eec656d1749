// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;

use super::{
  Authority, PoolRequest, PoolResponse, Session, SessionConnection, SessionConnector, SessionError,
};

struct PoolState<K: SessionConnector> {
  sessions: Vec<Arc<Session<K>>>,
  closed: bool,
}

/// Every session opened to one authority, in creation order.
pub struct SessionPool<K: SessionConnector> {
  connector: Arc<K>,
  authority: Authority,
  max_requests: Option<usize>,
  // Only locked to read or append the list, never across a request
  state: Mutex<PoolState<K>>,
}

impl<K: SessionConnector> SessionPool<K> {
  pub fn new(connector: Arc<K>, authority: Authority, max_requests: Option<usize>) -> Self {
    Self {
      connector,
      authority,
      max_requests,
      state: Mutex::new(PoolState {
        sessions: Vec::new(),
        closed: false,
      }),
    }
  }

  fn lock(&self) -> MutexGuard<'_, PoolState<K>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }

  pub fn authority(&self) -> &Authority {
    &self.authority
  }

  pub fn session_count(&self) -> usize {
    self.lock().sessions.len()
  }

  /// The session at `index`, creating it if the scan has run off the end.
  fn session_at(&self, index: usize) -> Result<Arc<Session<K>>, SessionError> {
    let mut state = self.lock();
    if state.closed {
      return Err(SessionError::Closed);
    }
    if index >= state.sessions.len() {
      state.sessions.push(Arc::new(Session::new(
        Arc::clone(&self.connector),
        self.authority.clone(),
        self.max_requests,
      )));
      tracing::debug!(
        authority = %self.authority,
        sessions = state.sessions.len(),
        "all sessions at capacity; opened another"
      );
      return state
        .sessions
        .last()
        .cloned()
        .ok_or(SessionError::Closed);
    }
    Ok(Arc::clone(&state.sessions[index]))
  }

  /// Issues `request` on the first session with spare capacity.
  ///
  /// The admitted slot is released once the request settles, whether it
  /// succeeded or failed.
  pub async fn fetch(&self, request: PoolRequest) -> Result<PoolResponse, SessionError> {
    let mut index = 0;
    loop {
      let session = self.session_at(index)?;
      match session.allocate_request().await? {
        Some(permit) => {
          let response = permit
            .connection()
            .send(&self.authority, request)
            .await;
          drop(permit);
          if let Err(error) = &response {
            tracing::debug!(authority = %self.authority, %error, "pooled request failed");
          }
          return response;
        }
        None => index += 1,
      }
    }
  }

  /// Closes every session; in-flight requests fail through their connections.
  pub fn close(&self) {
    let sessions = {
      let mut state = self.lock();
      state.closed = true;
      std::mem::take(&mut state.sessions)
    };
    for session in sessions {
      session.close();
    }
  }
}

/// Session pools keyed by authority, created on first use.
pub struct SessionPools<K: SessionConnector> {
  connector: Arc<K>,
  max_requests: Option<usize>,
  pools: DashMap<Authority, Arc<SessionPool<K>>>,
}

impl<K: SessionConnector> SessionPools<K> {
  pub fn new(connector: K, max_requests: Option<usize>) -> Self {
    Self {
      connector: Arc::new(connector),
      max_requests,
      pools: DashMap::new(),
    }
  }

  pub fn pool_for(&self, authority: &Authority) -> Arc<SessionPool<K>> {
    if let Some(pool) = self.pools.get(authority) {
      return Arc::clone(pool.value());
    }
    let pool = self.pools.entry(authority.clone()).or_insert_with(|| {
      Arc::new(SessionPool::new(
        Arc::clone(&self.connector),
        authority.clone(),
        self.max_requests,
      ))
    });
    Arc::clone(pool.value())
  }

  pub async fn fetch(
    &self,
    authority: &Authority,
    request: PoolRequest,
  ) -> Result<PoolResponse, SessionError> {
    self.pool_for(authority).fetch(request).await
  }

  /// Closes and forgets every pool; later fetches start from empty pools.
  pub fn close_all(&self) {
    let authorities: Vec<Authority> = self.pools.iter().map(|entry| entry.key().clone()).collect();
    for authority in authorities {
      if let Some((_, pool)) = self.pools.remove(&authority) {
        pool.close();
      }
    }
  }
}

impl<K: SessionConnector> std::fmt::Debug for SessionPools<K> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct(stringify!(SessionPools))
      .field("pools", &self.pools.len())
      .field("max_requests", &self.max_requests)
      .finish_non_exhaustive()
  }
}
