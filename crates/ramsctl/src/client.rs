//! HTTP client for ramsd.

use anyhow::{anyhow, Result};
use rams_common::teams::TeamView;
use rams_common::{EvacAssignment, HealthResponse, ServiceRequest};
use serde::de::DeserializeOwned;

pub struct RamsdClient {
    base: String,
    http: reqwest::Client,
}

impl RamsdClient {
    pub fn new(addr: &str) -> Self {
        Self {
            base: format!("http://{}", addr),
            http: reqwest::Client::new(),
        }
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = format!("{}{}", self.base, path);
        let response = self.http.get(&url).send().await.map_err(|e| {
            anyhow!(
                "Cannot reach RAMS daemon at {}: {}\n\
                 Is ramsd running?",
                self.base,
                e
            )
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Daemon returned {}: {}", status, body));
        }
        Ok(response.json().await?)
    }

    pub async fn health(&self) -> Result<HealthResponse> {
        self.get("/v1/health").await
    }

    pub async fn service_requests(
        &self,
        status: Option<&str>,
        incident: Option<&str>,
    ) -> Result<Vec<ServiceRequest>> {
        let mut params = Vec::new();
        if let Some(status) = status {
            params.push(format!("status={}", status));
        }
        if let Some(incident) = incident {
            params.push(format!("incident={}", incident));
        }
        let query = if params.is_empty() {
            String::new()
        } else {
            format!("?{}", params.join("&"))
        };
        self.get(&format!("/v1/service-requests{}", query)).await
    }

    pub async fn assignments(&self, status: Option<&str>) -> Result<Vec<EvacAssignment>> {
        let query = match status {
            Some(status) => format!("?status={}", status),
            None => String::new(),
        };
        self.get(&format!("/v1/assignments{}", query)).await
    }

    pub async fn teams(&self) -> Result<Vec<TeamView>> {
        self.get("/v1/teams").await
    }
}
