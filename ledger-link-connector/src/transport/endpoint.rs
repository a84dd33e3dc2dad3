//! # Endpoint Selection
//!
//! A graphql network is usually served by several interchangeable endpoints. The
//! [`EndpointSelector`] races a latency probe against all of them and pins the
//! winner until the detection interval elapses.

use crate::{config, error::ConnectionError};
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::{sync::Arc, time::Duration};
use tokio::{sync::Mutex, time::Instant};

const LATENCY_QUERY: &str = "query=%7Binfo%7Bversion%20time%20latency%7D%7D";

/// A resolved graphql endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
}

impl Endpoint {
    /// Expands a configured address into a full graphql URL.
    ///
    /// `gql.example.net` becomes `https://gql.example.net/graphql`, bare local hosts
    /// get plain `http`, explicit schemes are kept untouched.
    pub fn expand(address: &str) -> Self {
        let base = address.trim().trim_end_matches('/');
        let base = base.strip_suffix("/graphql").unwrap_or(base);

        let url = if base.starts_with("http://") || base.starts_with("https://") {
            format!("{base}/graphql")
        } else if is_local_host(base) {
            format!("http://{base}/graphql")
        } else {
            format!("https://{base}/graphql")
        };

        Self { url }
    }
}

fn is_local_host(base: &str) -> bool {
    let host = base.split([':', '/']).next().unwrap_or(base);
    host == "localhost" || host == "127.0.0.1"
}

/// Reports how far behind the chain an endpoint is.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    /// Reported sync latency in milliseconds, `None` if the endpoint did not answer
    /// with a usable value.
    async fn latency(&self, endpoint: &Endpoint) -> Option<u64>;
}

/// Asks the endpoint itself through the `info { latency }` graphql query.
#[derive(Debug, Clone)]
pub struct HttpLatencyProbe {
    client: reqwest::Client,
}

impl HttpLatencyProbe {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl LatencyProbe for HttpLatencyProbe {
    async fn latency(&self, endpoint: &Endpoint) -> Option<u64> {
        let url = format!("{}?{}", endpoint.url, LATENCY_QUERY);
        let response = match self.client.get(&url).send().await {
            Ok(response) => response,
            Err(e) => {
                tracing::debug!(endpoint = %endpoint.url, "Latency probe failed: {}", e);
                return None;
            }
        };

        match response.json::<serde_json::Value>().await {
            Ok(body) => body
                .pointer("/data/info/latency")
                .and_then(|latency| latency.as_u64().or_else(|| latency.as_f64().map(|l| l as u64))),
            Err(e) => {
                tracing::debug!(endpoint = %endpoint.url, "Invalid latency response: {}", e);
                None
            }
        }
    }
}

struct Selection {
    current: Option<Endpoint>,
    /// `None` means the current endpoint is pinned forever.
    refresh_at: Option<Instant>,
}

/// Picks an endpoint whose reported latency is within a ceiling.
///
/// Selection runs under an async mutex, so concurrent callers arriving while a
/// race is in flight wait for its result instead of starting their own.
pub struct EndpointSelector {
    endpoints: Vec<Endpoint>,
    probe: Arc<dyn LatencyProbe>,
    max_latency: u64,
    detection_interval: Duration,
    policy: config::Endpoints,
    selection: Mutex<Selection>,
}

impl EndpointSelector {
    pub fn new(
        endpoints: Vec<Endpoint>,
        probe: Arc<dyn LatencyProbe>,
        max_latency: Duration,
        detection_interval: Duration,
        policy: config::Endpoints,
    ) -> Self {
        // A single endpoint has nothing to race against.
        let selection = match endpoints.as_slice() {
            [single] => Selection {
                current: Some(single.clone()),
                refresh_at: None,
            },
            _ => Selection {
                current: None,
                refresh_at: Some(Instant::now()),
            },
        };

        Self {
            endpoints,
            probe,
            max_latency: max_latency.as_millis() as u64,
            detection_interval,
            policy,
            selection: Mutex::new(selection),
        }
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        &self.endpoints
    }

    /// Returns the cached endpoint or runs a new selection if the cache expired.
    pub async fn select(&self) -> Result<Endpoint, ConnectionError> {
        let mut selection = self.selection.lock().await;

        if let Some(current) = &selection.current {
            let fresh = selection.refresh_at.map_or(true, |at| Instant::now() < at);
            if fresh {
                return Ok(current.clone());
            }
        }

        selection.current = None;
        let endpoint = self.resolve().await?;
        tracing::debug!(endpoint = %endpoint.url, "Selected querying endpoint");

        selection.current = Some(endpoint.clone());
        selection.refresh_at = Some(Instant::now() + self.detection_interval);
        Ok(endpoint)
    }

    /// Expires the cached endpoint so that the next [`select`](Self::select) races again.
    pub async fn force_reselect(&self) {
        let mut selection = self.selection.lock().await;
        if selection.refresh_at.is_some() {
            selection.refresh_at = Some(Instant::now());
        }
    }

    async fn resolve(&self) -> Result<Endpoint, ConnectionError> {
        if self.endpoints.is_empty() {
            return Err(ConnectionError::NoEndpointAvailable);
        }

        for attempt in 0..self.policy.max_attempts {
            if let Some(endpoint) = self.race().await {
                return Ok(endpoint);
            }
            let delay = self.policy.backoff(attempt);
            tracing::warn!(attempt, ?delay, "No endpoint responded, retrying selection");
            tokio::time::sleep(delay).await;
        }

        Err(ConnectionError::NoEndpointAvailable)
    }

    /// One probing round: the first endpoint within the ceiling wins, otherwise the
    /// fastest responder does.
    async fn race(&self) -> Option<Endpoint> {
        let mut probes: FuturesUnordered<_> = self
            .endpoints
            .iter()
            .map(|endpoint| async move { (endpoint, self.probe.latency(endpoint).await) })
            .collect();

        let mut fastest: Option<(&Endpoint, u64)> = None;
        while let Some((endpoint, latency)) = probes.next().await {
            let Some(latency) = latency else {
                continue;
            };
            if latency <= self.max_latency {
                return Some(endpoint.clone());
            }
            if fastest.map_or(true, |(_, best)| latency < best) {
                fastest = Some((endpoint, latency));
            }
        }

        fastest.map(|(endpoint, _)| endpoint.clone())
    }
}
