use crate::{
    config,
    engine::{ResponseHandler, StringSender},
    transport::{
        endpoint::{Endpoint, EndpointSelector, HttpLatencyProbe, LatencyProbe},
        GqlParams,
    },
};
use anyhow::Result;
use reqwest::header::CONTENT_TYPE;
use std::sync::Arc;

/// Sends graphql queries to whichever endpoint the selector currently prefers.
#[derive(Clone)]
pub struct GqlSocket {
    local: bool,
    client: reqwest::Client,
    selector: Arc<EndpointSelector>,
}

impl GqlSocket {
    /// Creates a socket probing endpoints through their own `info` query.
    pub fn new(params: &GqlParams, client: reqwest::Client, policy: config::Endpoints) -> Self {
        let probe = Arc::new(HttpLatencyProbe::new(client.clone()));
        Self::with_probe(params, client, probe, policy)
    }

    pub fn with_probe(
        params: &GqlParams,
        client: reqwest::Client,
        probe: Arc<dyn LatencyProbe>,
        policy: config::Endpoints,
    ) -> Self {
        let endpoints = params.endpoints.iter().map(|e| Endpoint::expand(e)).collect();
        let selector = EndpointSelector::new(
            endpoints,
            probe,
            params.max_latency(),
            params.latency_detection_interval(),
            policy,
        );

        Self {
            local: params.local,
            client,
            selector: Arc::new(selector),
        }
    }

    pub fn selector(&self) -> &EndpointSelector {
        &self.selector
    }

    /// Posts one query and returns the raw response body.
    pub async fn query(&self, data: String) -> Result<String> {
        let endpoint = self.selector.select().await?;
        let response = self
            .client
            .post(&endpoint.url)
            .header(CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await?;
        Ok(response.text().await?)
    }
}

impl StringSender for GqlSocket {
    fn is_local(&self) -> bool {
        self.local
    }

    fn send(&self, data: String, handler: Box<dyn ResponseHandler<String>>, _long_query: bool) {
        let socket = self.clone();
        tokio::spawn(async move {
            match socket.query(data).await {
                Ok(response) => handler.on_receive(response),
                Err(e) => handler.on_error(e),
            }
        });
    }
}
