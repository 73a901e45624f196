// InfluxDB history provider implementation
use crate::application::history_provider::HistoryProvider;
use crate::domain::error::FetchError;
use crate::domain::telemetry::Sample;
use crate::infrastructure::config::{prepare_query, InfluxSettings};
use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use std::collections::HashMap;

const RANGE_QUERY: &str = "SELECT \"value\" FROM \"${measurement}\" WHERE \"entity_id\"='${entity}' AND time >= '${start}' AND time <= '${end}'";

// The state the entity was in when the range starts; gives the graph a left edge.
const INITIAL_STATE_QUERY: &str = "SELECT last(\"value\") FROM \"${measurement}\" WHERE \"entity_id\"='${entity}' AND time < '${start}'";

#[derive(Debug, Clone)]
pub struct InfluxHistory {
    client: reqwest::Client,
    host: String,
    token: String,
    database: String,
    retention_policy: String,
    measurement: String,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResponse {
    results: Vec<InfluxQLResult>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLResult {
    #[serde(default)]
    series: Option<Vec<InfluxQLSeries>>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct InfluxQLSeries {
    columns: Vec<String>,
    values: Vec<Vec<serde_json::Value>>,
}

impl InfluxHistory {
    pub fn new(settings: InfluxSettings) -> Self {
        Self {
            client: reqwest::Client::new(),
            host: settings.host.trim_end_matches('/').to_string(),
            token: settings.token,
            database: settings.database,
            retention_policy: settings.retention_policy,
            measurement: settings.measurement,
        }
    }

    fn build_query_url(&self, query: &str) -> String {
        let encoded_query = urlencoding::encode(query);
        format!(
            "{}/query?db={}&rp={}&q={}",
            self.host, self.database, self.retention_policy, encoded_query
        )
    }

    /// One statement for the range, preceded by the initial-state lookup on full fetches
    fn history_statements(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        expect_incremental: bool,
    ) -> String {
        let mut vars = HashMap::new();
        vars.insert("measurement".to_string(), self.measurement.clone());
        vars.insert("entity".to_string(), escape_string_literal(entity_id));
        vars.insert(
            "start".to_string(),
            start.to_rfc3339_opts(SecondsFormat::Millis, true),
        );
        vars.insert(
            "end".to_string(),
            end.to_rfc3339_opts(SecondsFormat::Millis, true),
        );

        let range = prepare_query(RANGE_QUERY, &vars);
        if expect_incremental {
            range
        } else {
            format!("{}; {}", prepare_query(INITIAL_STATE_QUERY, &vars), range)
        }
    }

    async fn execute_query(&self, query: &str) -> Result<InfluxQLResponse, FetchError> {
        let url = self.build_query_url(query);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Token {}", self.token))
            .header("Accept", "application/json")
            .send()
            .await
            .map_err(|e| FetchError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FetchError::Backend {
                status: status.as_u16(),
                body,
            });
        }

        let data = response
            .json::<InfluxQLResponse>()
            .await
            .map_err(|e| FetchError::Decode(e.to_string()))?;

        if let Some(error) = data.results.iter().find_map(|r| r.error.as_ref()) {
            return Err(FetchError::Backend {
                status: status.as_u16(),
                body: error.clone(),
            });
        }

        Ok(data)
    }

    /// Flatten every statement's rows into ascending samples, dropping rows that are not plottable
    fn parse_samples(response: &InfluxQLResponse) -> Vec<Sample> {
        let mut samples = Vec::new();

        for series in response
            .results
            .iter()
            .filter_map(|r| r.series.as_ref())
            .flatten()
        {
            let time_idx = series.columns.iter().position(|c| c == "time").unwrap_or(0);
            let value_idx = series
                .columns
                .iter()
                .position(|c| c == "value" || c == "last")
                .unwrap_or(1);

            for row in &series.values {
                let (Some(time), Some(raw)) = (row.get(time_idx), row.get(value_idx)) else {
                    continue;
                };
                let Some(timestamp) = time
                    .as_str()
                    .and_then(|t| DateTime::parse_from_rfc3339(t).ok())
                else {
                    continue;
                };
                if let Some(sample) = Sample::parse(raw, timestamp.with_timezone(&Utc)) {
                    samples.push(sample);
                }
            }
        }

        samples.sort_by_key(|s| s.timestamp);
        samples
    }
}

/// Escape a value for use inside a single-quoted InfluxQL string; backslashes first
fn escape_string_literal(value: &str) -> String {
    value.replace('\\', "\\\\").replace('\'', "\\'")
}

#[async_trait]
impl HistoryProvider for InfluxHistory {
    async fn fetch_history(
        &self,
        entity_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        expect_incremental: bool,
    ) -> Result<Vec<Sample>, FetchError> {
        let query = self.history_statements(entity_id, start, end, expect_incremental);
        tracing::debug!("Executing history query: {}", query);

        let response = self.execute_query(&query).await?;
        let samples = Self::parse_samples(&response);

        tracing::debug!(
            "Fetched {} samples for {} ({})",
            samples.len(),
            entity_id,
            if expect_incremental { "incremental" } else { "full range" }
        );
        Ok(samples)
    }
}
