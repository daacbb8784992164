//! ---
//! gridpoll_section: "02-wire-protocol-data-model"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Gridwire protocol codec and device collaborators."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use url::Url;

use crate::Result;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Best-effort side-channel probe that coaxes a silent device into
/// answering the discovery broadcast. Any status code counts as success;
/// failures are logged by the caller, never fatal.
#[async_trait]
pub trait WakeProbe: Send + Sync {
    /// Issue one request and return the HTTP status code.
    async fn probe(&self, url: &Url) -> Result<u16>;
}

/// Plain unauthenticated HTTP GET against the device's web interface.
pub struct HttpWakeProbe {
    client: reqwest::Client,
}

impl HttpWakeProbe {
    /// Build the probe with a short request timeout.
    pub fn new() -> Result<Self> {
        let client = reqwest::Client::builder().timeout(PROBE_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl WakeProbe for HttpWakeProbe {
    async fn probe(&self, url: &Url) -> Result<u16> {
        let response = self.client.get(url.clone()).send().await?;
        Ok(response.status().as_u16())
    }
}
