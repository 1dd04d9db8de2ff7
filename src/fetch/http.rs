use async_trait::async_trait;
use log::debug;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::fetch::PageSource;

const USER_AGENT: &str = concat!("seihon/", env!("CARGO_PKG_VERSION"));

/// [`PageSource`] backed by a `reqwest` client.
#[derive(Clone, Debug)]
pub struct HttpPageSource {
    client: reqwest::Client,
}

impl HttpPageSource {
    /// Builds a client with a connect timeout. The per-page timeout is enforced
    /// by the fetcher, not here.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { client })
    }

    /// Uses a caller-configured client, e.g. one carrying auth headers.
    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl PageSource for HttpPageSource {
    async fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        debug!("GET {}", url);
        let response = self.client.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(Error::Fetch {
                url: url.to_string(),
                reason: format!("HTTP {}", status),
            });
        }
        Ok(response.bytes().await?.to_vec())
    }
}
