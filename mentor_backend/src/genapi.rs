//! Gen-API implementation of [`TaskBackend`].
//!
//! Two calls: `POST <submit_url>` queues a chat task, `GET <poll_url>/<id>`
//! reports its status and, once done, the result.

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde_json::Value;
use std::time::Duration;

use crate::config::GenApiConfig;
use crate::task_client::{ClientError, SubmitPayload, TaskBackend};

pub struct GenApiBackend {
    submit_url: String,
    poll_url: String,
    api_key: Option<String>,
    client: Client,
}

impl GenApiBackend {
    pub fn new(submit_url: String, poll_url: String, api_key: Option<String>, client: Client) -> Self {
        Self {
            submit_url,
            poll_url,
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            client,
        }
    }

    pub fn from_config(config: &GenApiConfig, client: Client) -> Self {
        Self::new(
            config.submit_url.clone(),
            config.poll_url.clone(),
            config.api_key.clone(),
            client,
        )
    }

    fn poll_url_for(&self, task_id: &str) -> String {
        format!("{}/{}", self.poll_url.trim_end_matches('/'), task_id)
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

#[async_trait]
impl TaskBackend for GenApiBackend {
    async fn submit(&self, payload: &SubmitPayload, timeout: Duration) -> Result<Value, ClientError> {
        let request = self
            .client
            .post(&self.submit_url)
            .json(payload)
            .timeout(timeout);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;

        decode_body(response).await
    }

    async fn poll(&self, task_id: &str, timeout: Duration) -> Result<Value, ClientError> {
        let url = self.poll_url_for(task_id);
        let request = self.client.get(&url).timeout(timeout);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(transport_error)?;

        decode_body(response).await
    }
}

async fn decode_body(response: Response) -> Result<Value, ClientError> {
    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        tracing::error!("Gen-API HTTP error {}: {}", status, body);
        return Err(ClientError::Transport {
            code: Some(status.as_u16()),
            message: body,
        });
    }

    let text = response.text().await.map_err(transport_error)?;
    serde_json::from_str(&text).map_err(|e| ClientError::Unknown {
        detail: format!("invalid JSON from Gen-API: {}", e),
    })
}

fn transport_error(error: reqwest::Error) -> ClientError {
    ClientError::Transport {
        code: error.status().map(|status| status.as_u16()),
        message: error.to_string(),
    }
}
