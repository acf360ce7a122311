//! Connection pool keyed by destination identity.
//!
//! Every destination gets its own `reqwest::Client` so that its trust
//! material (extra CA certificates) is applied to its connections only.
//! Clients are created lazily on first use and shared afterwards; a single
//! async mutex guards the whole cache, so creating a client for one
//! destination briefly blocks lookups for others.
//!
//! The pool key is the URL's string form. Two addressables with the same
//! URL but different CA bundles share one entry, and whichever was written
//! last wins.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use herald_core::Addressable;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

use crate::error::{DispatchError, Result};

/// Process-wide connection reuse tuning.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionArgs {
    /// Upper bound on idle connections kept by one client. Zero means no
    /// limit.
    pub max_idle_conns: usize,
    /// Idle connections kept per host. Zero means no limit.
    pub max_idle_conns_per_host: usize,
}

impl ConnectionArgs {
    /// Idle connections a single client may keep per host.
    ///
    /// Each client talks to one destination, so the total cap also bounds
    /// the per-host cap.
    pub fn idle_per_host(&self) -> Option<usize> {
        match (self.max_idle_conns, self.max_idle_conns_per_host) {
            (0, 0) => None,
            (0, per_host) => Some(per_host),
            (total, 0) => Some(total),
            (total, per_host) => Some(total.min(per_host)),
        }
    }
}

/// A pooled client bound to one destination identity.
///
/// Cheap to clone: clones share the underlying connection pool. A clone
/// held by an in-flight request stays usable after the entry is evicted.
#[derive(Debug, Clone)]
pub struct PooledClient {
    client: reqwest::Client,
    key: Arc<str>,
    generation: u64,
}

impl PooledClient {
    /// The pool key this client was created for.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Creation sequence number; a replaced entry always has a higher one.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Executes a request inside an observability span.
    ///
    /// The span only records the exchange; request and response pass
    /// through unchanged.
    ///
    /// # Errors
    ///
    /// Returns the transport error reqwest reported.
    pub async fn execute(&self, request: reqwest::Request) -> reqwest::Result<reqwest::Response> {
        let span = info_span!(
            "herald_send",
            url = %request.url(),
            method = %request.method(),
            pool_key = %self.key,
        );

        async move {
            let start = Instant::now();
            let result = self.client.execute(request).await;
            match &result {
                Ok(response) => debug!(
                    status = response.status().as_u16(),
                    duration_ms = start.elapsed().as_millis(),
                    "received response"
                ),
                Err(e) => debug!(duration_ms = start.elapsed().as_millis(), "request failed: {e}"),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[derive(Debug, Default)]
struct PoolState {
    clients: HashMap<String, PooledClient>,
    connection_args: Option<ConnectionArgs>,
}

/// Keyed cache of transport clients, one per destination identity.
///
/// Owned by the composition root and shared via `Arc`.
#[derive(Debug, Default)]
pub struct ClientPool {
    state: Mutex<PoolState>,
    user_agent: Option<String>,
    generation: AtomicU64,
}

impl ClientPool {
    /// Creates an empty pool with default transport settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty pool whose clients send the given user agent.
    pub fn with_user_agent(user_agent: impl Into<String>) -> Self {
        Self { user_agent: Some(user_agent.into()), ..Self::default() }
    }

    /// Returns the cached client for the destination, creating it if absent.
    ///
    /// # Errors
    ///
    /// Returns `DispatchError::MissingDestination` if the addressable has no
    /// URL, or `DispatchError::Configuration` if its CA bundle does not
    /// parse.
    pub async fn client_for(&self, addressable: &Addressable) -> Result<PooledClient> {
        let key = addressable.pool_key().ok_or(DispatchError::MissingDestination)?;

        let mut state = self.state.lock().await;
        if let Some(client) = state.clients.get(key) {
            return Ok(client.clone());
        }

        let client = self.create(key, addressable, state.connection_args.as_ref())?;
        state.clients.insert(key.to_string(), client.clone());
        debug!(pool_key = key, "created pooled client");
        Ok(client)
    }

    /// Eagerly creates a client for the destination, replacing any cached
    /// one.
    ///
    /// # Errors
    ///
    /// Same as [`ClientPool::client_for`]. On error the cached entry, if
    /// any, is left in place.
    pub async fn upsert(&self, addressable: &Addressable) -> Result<()> {
        let key = addressable.pool_key().ok_or(DispatchError::MissingDestination)?;

        let mut state = self.state.lock().await;
        let client = self.create(key, addressable, state.connection_args.as_ref())?;
        if state.clients.insert(key.to_string(), client).is_some() {
            debug!(pool_key = key, "replaced pooled client");
        }
        Ok(())
    }

    /// Evicts the cached client for the destination.
    ///
    /// Returns `false` if nothing was cached, including when the addressable
    /// has no URL.
    pub async fn invalidate(&self, addressable: &Addressable) -> bool {
        let Some(key) = addressable.pool_key() else {
            return false;
        };

        let removed = self.state.lock().await.clients.remove(key).is_some();
        if removed {
            debug!(pool_key = key, "evicted pooled client");
        }
        removed
    }

    /// Updates the process-wide connection tuning.
    ///
    /// Identical non-empty tuning is a no-op and returns `false`. Anything
    /// else drops every cached client, which releases their idle
    /// connections once in-flight requests finish, and returns `true`.
    /// Every destination reconnects afterwards, so use sparingly.
    pub async fn reconfigure(&self, args: Option<ConnectionArgs>) -> bool {
        let mut state = self.state.lock().await;
        if matches!((&state.connection_args, &args), (Some(old), Some(new)) if old == new) {
            return false;
        }

        let evicted = state.clients.len();
        state.clients.clear();
        state.connection_args = args;
        debug!(evicted, ?args, "reconfigured connection pool");
        true
    }

    /// Current connection tuning.
    pub async fn connection_args(&self) -> Option<ConnectionArgs> {
        self.state.lock().await.connection_args
    }

    /// Number of cached clients.
    pub async fn len(&self) -> usize {
        self.state.lock().await.clients.len()
    }

    /// Returns true when no client is cached.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    fn create(
        &self,
        key: &str,
        addressable: &Addressable,
        args: Option<&ConnectionArgs>,
    ) -> Result<PooledClient> {
        let client = build_client(addressable, args, self.user_agent.as_deref())?;
        let generation = self.generation.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(PooledClient { client, key: Arc::from(key), generation })
    }
}

/// Builds a transport client: default transport, destination CA certs on
/// top of the system roots, shared tuning.
fn build_client(
    addressable: &Addressable,
    args: Option<&ConnectionArgs>,
    user_agent: Option<&str>,
) -> Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent);
    }

    if let Some(idle) = args.and_then(ConnectionArgs::idle_per_host) {
        builder = builder.pool_max_idle_per_host(idle);
    }

    if let Some(pem) = addressable.ca_certs() {
        let certificates = reqwest::Certificate::from_pem_bundle(pem.as_bytes())
            .map_err(|e| DispatchError::configuration(format!("invalid CA certs for {addressable}: {e}")))?;
        if certificates.is_empty() {
            return Err(DispatchError::configuration(format!(
                "failed to append CA certs from PEM for {addressable}"
            )));
        }
        for certificate in certificates {
            builder = builder.add_root_certificate(certificate);
        }
    }

    builder
        .build()
        .map_err(|e| DispatchError::configuration(format!("failed to build HTTP client: {e}")))
}
