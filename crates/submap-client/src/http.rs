//! Shared request plumbing: token auth, error bodies and `next` pagination.

use reqwest::header::AUTHORIZATION;
use reqwest::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::ClientConfig;
use crate::error::ClientError;

/// A page of a listing endpoint.
#[derive(Debug, Deserialize)]
pub(crate) struct Page<T> {
    pub results: Vec<T>,
    #[serde(default)]
    pub next: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct HttpApi {
    config: ClientConfig,
    client: reqwest::Client,
}

impl HttpApi {
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T, ClientError> {
        self.send(self.client.get(self.config.url(path)).query(query))
            .await
    }

    /// Fetch every page of a listing, following `next` links.
    pub async fn get_all<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<Vec<T>, ClientError> {
        let mut page: Page<T> = self.get(path, query).await?;
        let mut results = std::mem::take(&mut page.results);

        while let Some(next) = page.next.take() {
            debug!(url = %next, "following next page");
            page = self.send(self.client.get(&next)).await?;
            results.append(&mut page.results);
        }
        Ok(results)
    }

    pub async fn patch<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.send(self.client.patch(self.config.url(path)).json(body))
            .await
    }

    pub async fn post<B: Serialize + ?Sized, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.send(self.client.post(self.config.url(path)).json(body))
            .await
    }

    async fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T, ClientError> {
        let request = match &self.config.token {
            Some(token) => request.header(AUTHORIZATION, format!("Token {token}")),
            None => request,
        };
        decode(request.send().await?).await
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, ClientError> {
    if response.status().is_success() {
        return response
            .json::<T>()
            .await
            .map_err(|e| ClientError::Decode(e.to_string()));
    }

    let status = response.status();
    let body = response.bytes().await?;
    let message = serde_json::from_slice::<serde_json::Value>(&body)
        .ok()
        .and_then(|value| {
            ["detail", "message", "error"]
                .iter()
                .find_map(|key| value.get(*key).and_then(|v| v.as_str()).map(str::to_string))
        })
        .unwrap_or_else(|| String::from_utf8_lossy(&body).trim().to_string());

    Err(ClientError::Status {
        status: status.as_u16(),
        message,
    })
}
