use crate::{
    engine::{ResponseHandler, StringSender},
    transport::JrpcParams,
};
use anyhow::Result;
use reqwest::header::CONTENT_TYPE;

/// Sends JSON-RPC requests, routing best-effort reads to the alternative endpoint.
#[derive(Debug, Clone)]
pub struct JrpcSocket {
    client: reqwest::Client,
    endpoint: String,
    alternative_endpoint: String,
}

impl JrpcSocket {
    pub fn new(params: &JrpcParams, client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: params.endpoint.clone(),
            alternative_endpoint: params
                .alternative_endpoint
                .clone()
                .unwrap_or_else(|| params.endpoint.clone()),
        }
    }

    /// The URL a request is routed to.
    pub fn route(&self, requires_db: bool) -> &str {
        if requires_db {
            &self.endpoint
        } else {
            &self.alternative_endpoint
        }
    }

    pub async fn request(&self, data: String, requires_db: bool) -> Result<String> {
        let response = self
            .client
            .post(self.route(requires_db))
            .header(CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await?;
        Ok(response.text().await?)
    }
}

impl StringSender for JrpcSocket {
    fn is_local(&self) -> bool {
        false
    }

    fn send(&self, data: String, handler: Box<dyn ResponseHandler<String>>, requires_db: bool) {
        let socket = self.clone();
        tokio::spawn(async move {
            match socket.request(data, requires_db).await {
                Ok(response) => handler.on_receive(response),
                Err(e) => handler.on_error(e),
            }
        });
    }
}
