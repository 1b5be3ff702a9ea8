//! HTTP transport for the upload protocol, talking to `vault-server`.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use vault_common::config::Config;
use vault_common::error::ChannelError;
use vault_common::protocol::{
    AppendAck, AppendRequest, Envelope, FinalizeRequest, HealthResponse, InitiateData,
    InitiateRequest, UploadChannel, UploadRecord,
};

pub struct HttpChannel {
    client: reqwest::Client,
    base_url: String,
    timeout: Duration,
}

impl HttpChannel {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ChannelError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ChannelError::Transport(format!("Cannot create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        })
    }

    pub fn from_config(config: &Config) -> Result<Self, ChannelError> {
        Self::new(&config.server_url, config.call_timeout)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn health(&self) -> Result<HealthResponse, ChannelError> {
        let url = format!("{}/api/health", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| self.transport(e))?;
        if !resp.status().is_success() {
            return Err(ChannelError::Status {
                status: resp.status().as_u16(),
                url,
            });
        }
        resp.json()
            .await
            .map_err(|e| ChannelError::Malformed(e.to_string()))
    }

    pub async fn list_uploads(&self) -> Result<Envelope<Vec<UploadRecord>>, ChannelError> {
        let url = format!("{}/api/uploads", self.base_url);
        let resp = self.client.get(&url).send().await.map_err(|e| self.transport(e))?;
        read_envelope(resp, url).await
    }

    pub async fn delete_upload(&self, id: &str) -> Result<Envelope<UploadRecord>, ChannelError> {
        let url = format!("{}/api/uploads/{id}", self.base_url);
        let resp = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        read_envelope(resp, url).await
    }

    async fn post<B, T>(&self, path: &str, body: &B) -> Result<Envelope<T>, ChannelError>
    where
        B: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let url = format!("{}{path}", self.base_url);
        debug!("POST {url}");
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport(e))?;
        read_envelope(resp, url).await
    }

    fn transport(&self, e: reqwest::Error) -> ChannelError {
        if e.is_timeout() {
            ChannelError::Timeout(self.timeout)
        } else {
            ChannelError::Transport(e.to_string())
        }
    }
}

/// Non-2xx is a transport failure; a 2xx body must be an envelope.
async fn read_envelope<T: DeserializeOwned>(
    resp: reqwest::Response,
    url: String,
) -> Result<Envelope<T>, ChannelError> {
    let status = resp.status();
    if !status.is_success() {
        return Err(ChannelError::Status {
            status: status.as_u16(),
            url,
        });
    }
    resp.json::<Envelope<T>>()
        .await
        .map_err(|e| ChannelError::Malformed(format!("{url}: {e}")))
}

#[async_trait]
impl UploadChannel for HttpChannel {
    async fn initiate(
        &self,
        req: InitiateRequest,
    ) -> Result<Envelope<InitiateData>, ChannelError> {
        self.post("/api/upload/initiate", &req).await
    }

    async fn append(&self, req: AppendRequest) -> Result<Envelope<AppendAck>, ChannelError> {
        self.post("/api/upload/append", &req).await
    }

    async fn finalize(
        &self,
        req: FinalizeRequest,
    ) -> Result<Envelope<UploadRecord>, ChannelError> {
        self.post("/api/upload/finalize", &req).await
    }
}
