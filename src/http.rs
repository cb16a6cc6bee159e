// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;

/// A streaming response body
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>;

/// Streamed HTTP response: status, declared length, body chunks.
pub struct StreamedResponse {
    pub status: u16,
    /// Content-Length header value, if the server sent one
    pub content_length: Option<u64>,
    pub body: ByteStream,
}

/// HTTP client seam so the download engine can be tested against mocked
/// transports.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Open a streaming GET for a media resource.
    async fn get_stream(&self, url: &str) -> Result<StreamedResponse, reqwest::Error>;
}

/// Production client over reqwest.
///
/// Connect timeout is bounded; no overall request timeout is set because
/// episode downloads legitimately run for many minutes.
#[derive(Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self { client }
    }

    /// Wrap an externally-configured reqwest client.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl Default for ReqwestClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get_stream(&self, url: &str) -> Result<StreamedResponse, reqwest::Error> {
        let response = self.client.get(url).send().await?;
        let status = response.status().as_u16();
        let content_length = response.content_length();

        let body: ByteStream = Box::pin(response.bytes_stream());

        Ok(StreamedResponse {
            status,
            content_length,
            body,
        })
    }
}
