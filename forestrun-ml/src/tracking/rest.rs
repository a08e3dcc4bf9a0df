//! REST tracking store speaking the MLflow 2.0 tracking API.

use super::{
    Experiment, Metric, Param, Run, RunData, RunInfo, RunStatus, RunTag, TrackingStore,
};
use crate::error::MlError;
use async_trait::async_trait;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::debug;
use url::Url;

const API_PREFIX: &str = "api/2.0/mlflow/";

/// Tracking store talking to a remote server.
pub struct RestStore {
    client: reqwest::Client,
    base: Url,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    error_code: String,
    #[serde(default)]
    message: String,
}

/// int64 fields arrive as JSON numbers or, from proto-JSON encoders, as strings.
fn de_i64<'de, D: Deserializer<'de>>(d: D) -> Result<i64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Str(String),
    }
    match Raw::deserialize(d)? {
        Raw::Num(n) => Ok(n),
        Raw::Str(s) => s.parse().map_err(serde::de::Error::custom),
    }
}

fn de_opt_i64<'de, D: Deserializer<'de>>(d: D) -> Result<Option<i64>, D::Error> {
    #[derive(Deserialize)]
    struct Wrap(#[serde(deserialize_with = "de_i64")] i64);
    Ok(Option::<Wrap>::deserialize(d)?.map(|w| w.0))
}

#[derive(Debug, Deserialize)]
struct WireExperiment {
    experiment_id: String,
    name: String,
    #[serde(default)]
    artifact_location: String,
}

#[derive(Debug, Deserialize)]
struct WireRunInfo {
    run_id: String,
    experiment_id: String,
    #[serde(default)]
    run_name: String,
    status: RunStatus,
    #[serde(deserialize_with = "de_i64")]
    start_time: i64,
    #[serde(default, deserialize_with = "de_opt_i64")]
    end_time: Option<i64>,
    artifact_uri: String,
}

#[derive(Debug, Deserialize)]
struct WireMetric {
    key: String,
    value: f64,
    #[serde(deserialize_with = "de_i64")]
    timestamp: i64,
    #[serde(default, deserialize_with = "de_i64")]
    step: i64,
}

#[derive(Debug, Deserialize, Serialize)]
struct KeyValue {
    key: String,
    value: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireRunData {
    #[serde(default)]
    metrics: Vec<WireMetric>,
    #[serde(default)]
    params: Vec<KeyValue>,
    #[serde(default)]
    tags: Vec<KeyValue>,
}

#[derive(Debug, Deserialize)]
struct WireRun {
    info: WireRunInfo,
    #[serde(default)]
    data: WireRunData,
}

#[derive(Debug, Deserialize)]
struct RunResponse {
    run: WireRun,
}

impl From<WireRunInfo> for RunInfo {
    fn from(w: WireRunInfo) -> Self {
        Self {
            run_id: w.run_id,
            experiment_id: w.experiment_id,
            run_name: w.run_name,
            status: w.status,
            start_time: w.start_time,
            end_time: w.end_time,
            artifact_uri: w.artifact_uri,
        }
    }
}

impl RestStore {
    pub fn new(base: Url, timeout: Duration) -> Result<Self, MlError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(base, client))
    }

    pub fn with_client(mut base: Url, client: reqwest::Client) -> Self {
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Self { client, base }
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    fn endpoint(&self, path: &str) -> Result<Url, MlError> {
        self.base
            .join(API_PREFIX)
            .and_then(|u| u.join(path))
            .map_err(|e| MlError::tracking(format!("bad endpoint '{path}': {e}")))
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, MlError> {
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            let detail = serde_json::from_str::<ApiError>(&body)
                .map(|e| format!("{}: {}", e.error_code, e.message))
                .unwrap_or(body);
            if status == StatusCode::NOT_FOUND {
                return Err(MlError::not_found(detail));
            }
            return Err(MlError::tracking(format!("server returned {status}: {detail}")));
        }
        if body.trim().is_empty() {
            return Ok(serde_json::from_str("{}")?);
        }
        Ok(serde_json::from_str(&body)?)
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: serde_json::Value,
    ) -> Result<T, MlError> {
        let url = self.endpoint(path)?;
        debug!(%url, "POST");
        let response = self.client.post(url).json(&body).send().await?;
        Self::decode(response).await
    }

    async fn get<T: DeserializeOwned>(&self, path: &str, query: &[(&str, &str)]) -> Result<T, MlError> {
        let url = self.endpoint(path)?;
        debug!(%url, "GET");
        let response = self.client.get(url).query(query).send().await?;
        Self::decode(response).await
    }
}

#[derive(Debug, Deserialize)]
struct Empty {}

#[async_trait]
impl TrackingStore for RestStore {
    fn name(&self) -> &str {
        "rest"
    }

    async fn get_experiment_by_name(&self, name: &str) -> Result<Option<Experiment>, MlError> {
        #[derive(Deserialize)]
        struct Resp {
            experiment: WireExperiment,
        }
        match self
            .get::<Resp>("experiments/get-by-name", &[("experiment_name", name)])
            .await
        {
            Ok(resp) => Ok(Some(Experiment {
                experiment_id: resp.experiment.experiment_id,
                name: resp.experiment.name,
                artifact_location: resp.experiment.artifact_location,
            })),
            Err(MlError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn create_experiment(&self, name: &str) -> Result<String, MlError> {
        #[derive(Deserialize)]
        struct Resp {
            experiment_id: String,
        }
        let resp: Resp = self
            .post("experiments/create", json!({ "name": name }))
            .await?;
        Ok(resp.experiment_id)
    }

    async fn create_run(
        &self,
        experiment_id: &str,
        run_name: &str,
        start_time: i64,
        tags: &[RunTag],
    ) -> Result<RunInfo, MlError> {
        let tags: Vec<KeyValue> = tags
            .iter()
            .map(|t| KeyValue {
                key: t.key.clone(),
                value: t.value.clone(),
            })
            .collect();
        let resp: RunResponse = self
            .post(
                "runs/create",
                json!({
                    "experiment_id": experiment_id,
                    "run_name": run_name,
                    "start_time": start_time,
                    "tags": tags,
                }),
            )
            .await?;
        Ok(resp.run.info.into())
    }

    async fn log_param(&self, run_id: &str, param: &Param) -> Result<(), MlError> {
        let _: Empty = self
            .post(
                "runs/log-parameter",
                json!({ "run_id": run_id, "key": param.key, "value": param.value }),
            )
            .await?;
        Ok(())
    }

    async fn log_metric(&self, run_id: &str, metric: &Metric) -> Result<(), MlError> {
        let _: Empty = self
            .post(
                "runs/log-metric",
                json!({
                    "run_id": run_id,
                    "key": metric.key,
                    "value": metric.value,
                    "timestamp": metric.timestamp,
                    "step": metric.step,
                }),
            )
            .await?;
        Ok(())
    }

    async fn set_tag(&self, run_id: &str, tag: &RunTag) -> Result<(), MlError> {
        let _: Empty = self
            .post(
                "runs/set-tag",
                json!({ "run_id": run_id, "key": tag.key, "value": tag.value }),
            )
            .await?;
        Ok(())
    }

    async fn update_run(
        &self,
        run_id: &str,
        status: RunStatus,
        end_time: Option<i64>,
    ) -> Result<(), MlError> {
        let mut body = json!({ "run_id": run_id, "status": status.as_str() });
        if let Some(end) = end_time {
            body["end_time"] = json!(end);
        }
        let _: serde_json::Value = self.post("runs/update", body).await?;
        Ok(())
    }

    async fn get_run(&self, run_id: &str) -> Result<Run, MlError> {
        let resp: RunResponse = self.get("runs/get", &[("run_id", run_id)]).await?;
        let mut data = RunData::default();
        data.params
            .extend(resp.run.data.params.into_iter().map(|kv| (kv.key, kv.value)));
        data.tags
            .extend(resp.run.data.tags.into_iter().map(|kv| (kv.key, kv.value)));
        for m in resp.run.data.metrics {
            data.metrics.insert(
                m.key.clone(),
                Metric {
                    key: m.key,
                    value: m.value,
                    timestamp: m.timestamp,
                    step: m.step,
                },
            );
        }
        Ok(Run {
            info: resp.run.info.into(),
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_gets_trailing_slash() {
        let store = RestStore::with_client(
            Url::parse("http://host:5000/mlflow").unwrap(),
            reqwest::Client::new(),
        );
        assert_eq!(
            store.endpoint("runs/create").unwrap().as_str(),
            "http://host:5000/mlflow/api/2.0/mlflow/runs/create"
        );
    }

    #[test]
    fn test_run_info_accepts_string_int64() {
        let raw = r#"{
            "run": {
                "info": {
                    "run_id": "abc",
                    "experiment_id": "1",
                    "run_name": "r",
                    "status": "RUNNING",
                    "start_time": "1700000000000",
                    "artifact_uri": "mlflow-artifacts:/1/abc/artifacts"
                },
                "data": {
                    "metrics": [{"key": "rmse", "value": 1.5, "timestamp": 5, "step": "2"}]
                }
            }
        }"#;
        let resp: RunResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(resp.run.info.start_time, 1_700_000_000_000);
        assert_eq!(resp.run.info.end_time, None);
        assert_eq!(resp.run.data.metrics[0].step, 2);
    }
}
