//! Google Cloud REST client.
//!
//! Implements [`MetricsSource`] over Cloud Monitoring v3 and [`InventorySource`]
//! over Resource Manager v1 and Compute Engine v1. Every call is a single
//! authenticated `GET`; pagination is left to the stream helpers in
//! [`crate::source`].

use crate::config::GcpConfig;
use crate::paging::Page;
use crate::record::{MetricDescriptor, MetricRecord, TimeInterval};
use crate::source::{InventorySource, MetricsSource, Project, SourceError};
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use tracing::{debug, instrument};

/// OAuth2 bearer token used for every request
#[derive(Clone)]
pub struct AccessToken(String);

impl AccessToken {
    pub fn new(token: impl Into<String>) -> Result<Self, SourceError> {
        let token = token.into().trim().to_string();
        if token.is_empty() {
            return Err(SourceError::Credentials("access token is empty".to_string()));
        }
        Ok(Self(token))
    }

    /// Read a token from `path`.
    ///
    /// The file holds either the raw token or a JSON object with an
    /// `access_token` field (the shape returned by the OAuth2 token endpoint).
    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            SourceError::Credentials(format!("unable to read {}: {e}", path.display()))
        })?;

        let trimmed = contents.trim();
        if trimmed.starts_with('{') {
            #[derive(Deserialize)]
            struct TokenFile {
                access_token: String,
            }
            let parsed: TokenFile = serde_json::from_str(trimmed).map_err(|e| {
                SourceError::Credentials(format!("unable to parse {}: {e}", path.display()))
            })?;
            return Self::new(parsed.access_token);
        }

        Self::new(trimmed)
    }

    fn secret(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(***)")
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListMetricDescriptorsResponse {
    #[serde(default)]
    metric_descriptors: Vec<MetricDescriptor>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListTimeSeriesResponse {
    #[serde(default)]
    time_series: Vec<MetricRecord>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListProjectsResponse {
    #[serde(default)]
    projects: Vec<Project>,
    next_page_token: Option<String>,
}

/// Compute aggregated listing: one scoped list per zone
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AggregatedInstancesResponse {
    #[serde(default)]
    items: BTreeMap<String, InstancesScopedList>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InstancesScopedList {
    #[serde(default)]
    instances: Vec<serde_json::Value>,
}

impl From<AggregatedInstancesResponse> for Page<serde_json::Value> {
    fn from(response: AggregatedInstancesResponse) -> Self {
        Page {
            items: response
                .items
                .into_values()
                .flat_map(|scoped| scoped.instances)
                .collect(),
            next_page_token: response.next_page_token,
        }
    }
}

/// Cloud Monitoring, Resource Manager and Compute client
pub struct GoogleCloudClient {
    http: reqwest::Client,
    token: AccessToken,
    config: GcpConfig,
}

impl GoogleCloudClient {
    pub fn new(config: &GcpConfig, token: AccessToken) -> Result<Self, SourceError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;

        Ok(Self {
            http,
            token,
            config: config.clone(),
        })
    }

    async fn get<R: DeserializeOwned>(
        &self,
        api: &'static str,
        url: String,
        query: &[(&str, String)],
    ) -> Result<R, SourceError> {
        debug!(api, url = %url, "GET");

        let response = self
            .http
            .get(&url)
            .bearer_auth(self.token.secret())
            .query(query)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SourceError::Status {
                api,
                status: status.as_u16(),
                body,
            });
        }

        Ok(response.json::<R>().await?)
    }

    fn paging_query(&self, page_token: Option<String>, size_param: &'static str) -> Vec<(&'static str, String)> {
        let mut query = vec![(size_param, self.config.page_size.to_string())];
        if let Some(token) = page_token {
            query.push(("pageToken", token));
        }
        query
    }
}

fn endpoint(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path)
}

fn time_series_filter(metric_type: &str) -> String {
    format!("metric.type=\"{metric_type}\"")
}

fn rfc3339(time: chrono::DateTime<chrono::Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl MetricsSource for GoogleCloudClient {
    #[instrument(skip(self))]
    async fn list_metric_descriptors_page(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> Result<Page<MetricDescriptor>, SourceError> {
        let response: ListMetricDescriptorsResponse = self
            .get(
                "monitoring",
                endpoint(
                    &self.config.monitoring_endpoint,
                    &format!("projects/{project}/metricDescriptors"),
                ),
                &self.paging_query(page_token, "pageSize"),
            )
            .await?;

        Ok(Page {
            items: response.metric_descriptors,
            next_page_token: response.next_page_token,
        })
    }

    #[instrument(skip(self, interval))]
    async fn list_time_series_page(
        &self,
        project: &str,
        metric_type: &str,
        interval: &TimeInterval,
        page_token: Option<String>,
    ) -> Result<Page<MetricRecord>, SourceError> {
        let mut query = vec![
            ("filter", time_series_filter(metric_type)),
            ("interval.startTime", rfc3339(interval.start_time)),
            ("interval.endTime", rfc3339(interval.end_time)),
        ];
        query.extend(self.paging_query(page_token, "pageSize"));

        let response: ListTimeSeriesResponse = self
            .get(
                "monitoring",
                endpoint(
                    &self.config.monitoring_endpoint,
                    &format!("projects/{project}/timeSeries"),
                ),
                &query,
            )
            .await?;

        Ok(Page {
            items: response.time_series,
            next_page_token: response.next_page_token,
        })
    }
}

#[async_trait]
impl InventorySource for GoogleCloudClient {
    #[instrument(skip(self))]
    async fn list_projects_page(
        &self,
        page_token: Option<String>,
    ) -> Result<Page<Project>, SourceError> {
        let response: ListProjectsResponse = self
            .get(
                "resourcemanager",
                endpoint(&self.config.resource_manager_endpoint, "projects"),
                &self.paging_query(page_token, "pageSize"),
            )
            .await?;

        Ok(Page {
            items: response.projects,
            next_page_token: response.next_page_token,
        })
    }

    #[instrument(skip(self))]
    async fn list_running_instances_page(
        &self,
        project: &str,
        page_token: Option<String>,
    ) -> Result<Page<serde_json::Value>, SourceError> {
        let mut query = vec![("filter", "status = \"RUNNING\"".to_string())];
        query.extend(self.paging_query(page_token, "maxResults"));

        let response: AggregatedInstancesResponse = self
            .get(
                "compute",
                endpoint(
                    &self.config.compute_endpoint,
                    &format!("projects/{project}/aggregated/instances"),
                ),
                &query,
            )
            .await?;

        Ok(response.into())
    }
}
