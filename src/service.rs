//! Calls to peer services.
//!
//! Crawl scripts reach other services by logical name. Instances come from
//! `[services.<name>] instances` and are picked round-robin; a service with
//! no instance fails with [`ServiceError::NoInstance`].

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use thiserror::Error;

use crate::config::ServiceConfig;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("no available instance for service '{0}'")]
    NoInstance(String),

    #[error("unsupported HTTP method '{0}'")]
    Method(String),

    #[error("request to service '{service}' failed: {message}")]
    Request { service: String, message: String },

    #[error("service '{service}' returned HTTP {status}: {body}")]
    Status {
        service: String,
        status: u16,
        body: String,
    },
}

/// Remote invocation of a named service.
#[async_trait]
pub trait ServiceCaller: Send + Sync {
    /// Call `path` on one instance of `service`. `params` become query
    /// parameters and `data` the JSON body. Returns the decoded JSON
    /// response, or the raw text when the body is not JSON.
    async fn do_service(
        &self,
        service: &str,
        path: &str,
        method: &str,
        params: &Map<String, Value>,
        data: Option<&Value>,
    ) -> Result<Value, ServiceError>;
}

struct ServiceEntry {
    instances: Vec<String>,
    timeout: Duration,
    next: AtomicUsize,
}

/// [`ServiceCaller`] over HTTP with round-robin instance selection.
pub struct HttpServiceCaller {
    client: reqwest::Client,
    services: BTreeMap<String, ServiceEntry>,
}

impl HttpServiceCaller {
    pub fn new(services: &BTreeMap<String, ServiceConfig>) -> Self {
        let services = services
            .iter()
            .map(|(name, cfg)| {
                (
                    name.clone(),
                    ServiceEntry {
                        instances: cfg
                            .instances
                            .iter()
                            .map(|i| i.trim_end_matches('/').to_string())
                            .collect(),
                        timeout: Duration::from_secs(cfg.timeout_secs),
                        next: AtomicUsize::new(0),
                    },
                )
            })
            .collect();
        Self {
            client: reqwest::Client::new(),
            services,
        }
    }

    /// Next instance for `service`, or `None` when it has none.
    fn pick(&self, service: &str) -> Option<(&str, Duration)> {
        let entry = self.services.get(service)?;
        if entry.instances.is_empty() {
            return None;
        }
        let idx = entry.next.fetch_add(1, Ordering::Relaxed) % entry.instances.len();
        Some((entry.instances[idx].as_str(), entry.timeout))
    }
}

#[async_trait]
impl ServiceCaller for HttpServiceCaller {
    async fn do_service(
        &self,
        service: &str,
        path: &str,
        method: &str,
        params: &Map<String, Value>,
        data: Option<&Value>,
    ) -> Result<Value, ServiceError> {
        let (base, timeout) = self
            .pick(service)
            .ok_or_else(|| ServiceError::NoInstance(service.to_string()))?;
        let url = format!("{}/{}", base, path.trim_start_matches('/'));

        let method = reqwest::Method::from_bytes(method.to_ascii_uppercase().as_bytes())
            .map_err(|_| ServiceError::Method(method.to_string()))?;

        let query: Vec<(String, String)> = params
            .iter()
            .map(|(k, v)| {
                let text = match v {
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                (k.clone(), text)
            })
            .collect();

        let mut builder = self
            .client
            .request(method, &url)
            .timeout(timeout)
            .query(&query);
        if let Some(body) = data {
            builder = builder.json(body);
        }

        tracing::debug!(service, url = %url, "calling service");
        let request_error = |e: reqwest::Error| ServiceError::Request {
            service: service.to_string(),
            message: e.to_string(),
        };
        let response = builder.send().await.map_err(request_error)?;
        let status = response.status();
        let body = response.text().await.map_err(request_error)?;

        if !status.is_success() {
            return Err(ServiceError::Status {
                service: service.to_string(),
                status: status.as_u16(),
                body,
            });
        }

        Ok(serde_json::from_str(&body).unwrap_or(Value::String(body)))
    }
}
