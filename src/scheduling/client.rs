//! Scheduler client
//!
//! One synchronous HTTP call per query against the external placement
//! service. No retry is attempted here; callers see `Unavailable` for
//! transport failures and `InvalidArgument` for refusals.

use crate::domain::ports::Scheduler;
use crate::domain::volume::{BindingInfo, ScheduleQuery};
use crate::error::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error};

/// Default scheduler endpoint
pub const DEFAULT_SCHEDULER_HOST: &str = "http://local-scheduler-extender:23000";

/// Configuration for the scheduler client
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Base URL of the scheduler
    pub base_url: String,
    /// Request timeout
    pub timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_SCHEDULER_HOST.into(),
            timeout: Duration::from_secs(10),
        }
    }
}

/// [`Scheduler`] backed by the scheduler's HTTP API
pub struct HttpScheduler {
    config: SchedulerConfig,
    client: reqwest::Client,
}

impl HttpScheduler {
    pub fn new(config: SchedulerConfig) -> Result<Arc<Self>> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("building scheduler client: {}", e)))?;
        Ok(Arc::new(Self { config, client }))
    }

    fn url(&self, query: &ScheduleQuery) -> String {
        format!(
            "{}/scheduling/{}/{}",
            self.config.base_url.trim_end_matches('/'),
            urlencoding::encode(&query.namespace),
            urlencoding::encode(&query.claim)
        )
    }
}

#[async_trait]
impl Scheduler for HttpScheduler {
    async fn schedule(&self, query: &ScheduleQuery) -> Result<BindingInfo> {
        let url = self.url(query);
        let params = [
            ("node", query.node.as_deref().unwrap_or("")),
            ("pool", query.pool.as_deref().unwrap_or("")),
            ("volumeType", query.volume_type.as_str()),
        ];
        debug!("Scheduling {}/{} via {} {:?}", query.namespace, query.claim, url, params);

        let response = self
            .client
            .post(&url)
            .query(&params)
            .send()
            .await
            .map_err(|e| Error::unavailable(self.config.base_url.as_str(), e.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| Error::unavailable(self.config.base_url.as_str(), e.to_string()))?;

        if !status.is_success() {
            error!(
                "Scheduler refused {}/{}: {} {}",
                query.namespace, query.claim, status, body
            );
            return Err(Error::InvalidArgument(format!(
                "scheduler returned {} for {}/{}: {}",
                status,
                query.namespace,
                query.claim,
                body.trim()
            )));
        }

        serde_json::from_str(&body).map_err(|e| {
            Error::InvalidArgument(format!(
                "undecodable scheduler response for {}/{}: {}",
                query.namespace, query.claim, e
            ))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use axum::{
        extract::{Path, Query},
        http::StatusCode,
        response::IntoResponse,
        routing::post,
        Json, Router,
    };
    use std::collections::HashMap;

    async fn fake_schedule(
        Path((namespace, claim)): Path<(String, String)>,
        Query(params): Query<HashMap<String, String>>,
    ) -> axum::response::Response {
        match claim.as_str() {
            "refused" => (StatusCode::BAD_REQUEST, "no capacity").into_response(),
            "garbled" => (StatusCode::OK, "not json").into_response(),
            _ => Json(serde_json::json!({
                "node": params.get("node").filter(|n| !n.is_empty()).cloned().unwrap_or_else(|| "node-2".into()),
                "vgName": format!("vg-{}", namespace),
                "device": "",
            }))
            .into_response(),
        }
    }

    async fn serve() -> String {
        let app = Router::new().route("/scheduling/:namespace/:claim", post(fake_schedule));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    fn query(claim: &str, node: Option<&str>) -> ScheduleQuery {
        ScheduleQuery {
            namespace: "default".into(),
            claim: claim.into(),
            volume_type: "LVM".into(),
            node: node.map(String::from),
            pool: None,
        }
    }

    fn scheduler(base_url: String) -> Arc<HttpScheduler> {
        HttpScheduler::new(SchedulerConfig {
            base_url,
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_schedule_binding() {
        let scheduler = scheduler(serve().await);

        let binding = scheduler.schedule(&query("data-0", None)).await.unwrap();
        assert_eq!(binding.node, "node-2");
        assert_eq!(binding.pool.as_deref(), Some("vg-default"));

        let binding = scheduler
            .schedule(&query("data-0", Some("node-7")))
            .await
            .unwrap();
        assert_eq!(binding.node, "node-7");
    }

    #[tokio::test]
    async fn test_refusal_is_invalid_argument() {
        let scheduler = scheduler(serve().await);

        assert_matches!(
            scheduler.schedule(&query("refused", None)).await,
            Err(Error::InvalidArgument(_))
        );
        assert_matches!(
            scheduler.schedule(&query("garbled", None)).await,
            Err(Error::InvalidArgument(_))
        );
    }

    #[tokio::test]
    async fn test_unreachable_is_unavailable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let scheduler = scheduler(format!("http://{}", addr));
        let err = scheduler.schedule(&query("data-0", None)).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
