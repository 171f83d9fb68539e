use async_trait::async_trait;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Deserialize;

use crate::error::{ChatError, Result};
use crate::pipeline::{ChatTransport, OutboundRequest};
use crate::sse::{decode_stream, SseFrame};

/// Talks to a running proxy over HTTP.
#[derive(Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    pub base_url: String,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Deserialize)]
struct CompletionBody {
    response: String,
}

#[derive(Debug, Deserialize)]
struct StatusBody {
    status: String,
}

impl HttpTransport {
    pub fn new(base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client: reqwest::Client::new(), base_url }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Liveness probe against `GET /chat`.
    pub async fn status(&self) -> Result<String> {
        let resp = self.client.get(self.url("/chat")).send().await?;
        let resp = check(resp).await?;
        Ok(resp.json::<StatusBody>().await?.status)
    }

    async fn post(&self, path: &str, req: &OutboundRequest) -> Result<reqwest::Response> {
        let resp = self.client.post(self.url(path)).json(req).send().await?;
        check(resp).await
    }
}

async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let text = resp.text().await.unwrap_or_default();
    let msg = serde_json::from_str::<ErrorBody>(&text).map(|b| b.error).unwrap_or(text);
    if status.is_client_error() {
        Err(ChatError::Validation(format!("{status}: {msg}")))
    } else {
        Err(ChatError::Backend(format!("{status}: {msg}")))
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn open_stream(&self, req: &OutboundRequest) -> Result<BoxStream<'static, Result<SseFrame>>> {
        let resp = self.post("/chat/stream", req).await?;
        Ok(decode_stream(resp.bytes_stream())
            .map(|frame| frame.map_err(ChatError::from))
            .boxed())
    }

    async fn complete(&self, req: &OutboundRequest) -> Result<String> {
        let resp = self.post("/chat", req).await?;
        Ok(resp.json::<CompletionBody>().await?.response)
    }
}
