use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use rpl_core::Component;

use crate::traits::{ContainerRuntime, HealthProbe};

/// HTTP liveness for components with a health URL, container health status
/// for the rest.
pub struct ServiceProbe {
    client: reqwest::blocking::Client,
    urls: BTreeMap<Component, String>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ServiceProbe {
    pub fn new(urls: BTreeMap<Component, String>, runtime: Arc<dyn ContainerRuntime>, timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("build http client")?;
        Ok(Self { client, urls, runtime })
    }
}

impl HealthProbe for ServiceProbe {
    fn probe(&self, component: &Component) -> Result<bool> {
        match self.urls.get(component) {
            Some(url) => {
                let resp = self
                    .client
                    .get(url)
                    .send()
                    .with_context(|| format!("probe {component} at {url}"))?;
                tracing::debug!(component = %component, status = %resp.status(), "http probe");
                Ok(resp.status().is_success())
            }
            None => self.runtime.container_healthy(component),
        }
    }
}
