use crate::{
    engine::{BytesSender, ResponseHandler},
    transport::ProtoParams,
};
use anyhow::Result;
use reqwest::header::CONTENT_TYPE;

/// Sends protobuf-encoded requests produced by the engine.
#[derive(Debug, Clone)]
pub struct ProtoSocket {
    client: reqwest::Client,
    endpoint: String,
}

impl ProtoSocket {
    pub fn new(params: &ProtoParams, client: reqwest::Client) -> Self {
        Self {
            client,
            endpoint: params.endpoint.clone(),
        }
    }

    pub async fn request(&self, data: Vec<u8>) -> Result<Vec<u8>> {
        let response = self
            .client
            .post(&self.endpoint)
            .header(CONTENT_TYPE, "application/x-protobuf")
            .body(data)
            .send()
            .await?;
        Ok(response.bytes().await?.to_vec())
    }
}

impl BytesSender for ProtoSocket {
    fn is_local(&self) -> bool {
        false
    }

    fn send(&self, data: Vec<u8>, handler: Box<dyn ResponseHandler<Vec<u8>>>, _requires_db: bool) {
        let socket = self.clone();
        tokio::spawn(async move {
            match socket.request(data).await {
                Ok(response) => handler.on_receive(response),
                Err(e) => handler.on_error(e),
            }
        });
    }
}
