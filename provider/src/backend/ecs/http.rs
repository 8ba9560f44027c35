/*
Copyright 2025 The Skylet Authors.
Licensed under the Apache License, Version 2.0 (the "License");
you may not use this file except in compliance with the License.
You may obtain a copy of the License at
    http://www.apache.org/licenses/LICENSE-2.0
Unless required by applicable law or agreed to in writing, software
distributed under the License is distributed on an "AS IS" BASIS,
WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
See the License for the specific language governing permissions and
limitations under the License.
*/

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;
use url::Url;

use common::ctx::ProviderConfig;
use common::{BackendError, SkyletError};

use super::api::*;
use super::sigv4::Signer;
use crate::backend::{from_reqwest, http_client};

const CONTENT_TYPE: &str = "application/x-amz-json-1.1";

#[derive(Clone, Copy, Debug)]
enum Service {
    Ecs,
    Logs,
}

impl Service {
    fn name(&self) -> &'static str {
        match self {
            Service::Ecs => "ecs",
            Service::Logs => "logs",
        }
    }

    fn target_prefix(&self) -> &'static str {
        match self {
            Service::Ecs => "AmazonEC2ContainerServiceV20141113",
            Service::Logs => "Logs_20140328",
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct AwsErrorBody {
    #[serde(rename = "__type", default)]
    kind: String,
    #[serde(alias = "Message", default)]
    message: String,
}

/// Maps an AWS error response onto the backend error classes.
fn classify(status: StatusCode, body: &str) -> BackendError {
    let err: AwsErrorBody = serde_json::from_str(body).unwrap_or_default();
    // "__type" may carry a namespace, e.g. "com.amazonaws.ecs#ClientException".
    let kind = err.kind.rsplit('#').next().unwrap_or_default();
    let msg = if kind.is_empty() {
        format!("{status}: {body}")
    } else {
        format!("{kind}: {}", err.message)
    };

    match kind {
        "ResourceNotFoundException" => BackendError::NotFound(msg),
        "ThrottlingException"
        | "ServerException"
        | "ServiceUnavailable"
        | "ServiceUnavailableException"
        | "RequestLimitExceeded" => BackendError::Transient(msg),
        "ClientException" | "InvalidParameterException" | "ClusterNotFoundException" => {
            BackendError::Permanent(msg)
        }
        _ if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS => {
            BackendError::Transient(msg)
        }
        _ => BackendError::Permanent(msg),
    }
}

/// The AWS JSON 1.1 protocol over HTTPS, signed with SigV4.
pub struct EcsHttpApi {
    http: reqwest::Client,
    region: String,
    access_key: String,
    secret_key: String,
    session_token: Option<String>,
}

impl EcsHttpApi {
    pub fn new(config: &ProviderConfig) -> Result<Self, SkyletError> {
        let creds = &config.credentials;
        let (Some(access_key), Some(secret_key)) = (&creds.access_key, &creds.secret_key) else {
            return Err(SkyletError::InvalidConfig(
                "AWS_ACCESS_KEY_ID and AWS_SECRET_ACCESS_KEY are required by the ecs backend"
                    .to_string(),
            ));
        };

        Ok(Self {
            http: http_client()?,
            region: config.region.clone(),
            access_key: access_key.clone(),
            secret_key: secret_key.clone(),
            session_token: creds.session_token.clone(),
        })
    }

    fn endpoint(&self, service: Service) -> Result<Url, BackendError> {
        let raw = format!("https://{}.{}.amazonaws.com/", service.name(), self.region);
        Url::parse(&raw).map_err(|e| BackendError::Permanent(format!("invalid endpoint <{raw}>: {e}")))
    }

    async fn call<Req, Resp>(
        &self,
        service: Service,
        action: &str,
        req: &Req,
    ) -> Result<Resp, BackendError>
    where
        Req: Serialize + Sync,
        Resp: DeserializeOwned,
    {
        let url = self.endpoint(service)?;
        let body =
            serde_json::to_vec(req).map_err(|e| BackendError::Permanent(e.to_string()))?;
        let target = format!("{}.{action}", service.target_prefix());

        let mut headers = BTreeMap::from([
            ("content-type".to_string(), CONTENT_TYPE.to_string()),
            (
                "host".to_string(),
                url.host_str().unwrap_or_default().to_string(),
            ),
            ("x-amz-target".to_string(), target.clone()),
        ]);
        let signer = Signer {
            access_key: &self.access_key,
            secret_key: &self.secret_key,
            session_token: self.session_token.as_deref(),
            region: &self.region,
            service: service.name(),
        };
        signer.sign("POST", &url, &mut headers, &body, Utc::now())?;

        tracing::trace!("Call <{target}> on <{url}>");

        let mut builder = self.http.post(url);
        for (k, v) in &headers {
            // reqwest derives the host header from the url.
            if k != "host" {
                builder = builder.header(k.as_str(), v.as_str());
            }
        }

        let resp = builder.body(body).send().await.map_err(from_reqwest)?;
        let status = resp.status();
        let text = resp.text().await.map_err(from_reqwest)?;

        if !status.is_success() {
            return Err(classify(status, &text));
        }

        // Some actions answer with an empty body.
        let text = if text.trim().is_empty() { "{}" } else { &text };
        serde_json::from_str(text)
            .map_err(|e| BackendError::Permanent(format!("invalid <{target}> response: {e}")))
    }
}

#[derive(Deserialize)]
struct Ignored {}

#[async_trait]
impl EcsApi for EcsHttpApi {
    async fn register_task_definition(
        &self,
        req: &RegisterTaskDefinitionRequest,
    ) -> Result<RegisterTaskDefinitionResponse, BackendError> {
        self.call(Service::Ecs, "RegisterTaskDefinition", req).await
    }

    async fn deregister_task_definition(
        &self,
        req: &DeregisterTaskDefinitionRequest,
    ) -> Result<(), BackendError> {
        let _: Ignored = self.call(Service::Ecs, "DeregisterTaskDefinition", req).await?;
        Ok(())
    }

    async fn run_task(&self, req: &RunTaskRequest) -> Result<RunTaskResponse, BackendError> {
        self.call(Service::Ecs, "RunTask", req).await
    }

    async fn stop_task(&self, req: &StopTaskRequest) -> Result<(), BackendError> {
        let _: Ignored = self.call(Service::Ecs, "StopTask", req).await?;
        Ok(())
    }

    async fn describe_tasks(
        &self,
        req: &DescribeTasksRequest,
    ) -> Result<DescribeTasksResponse, BackendError> {
        self.call(Service::Ecs, "DescribeTasks", req).await
    }

    async fn list_tasks(&self, req: &ListTasksRequest) -> Result<ListTasksResponse, BackendError> {
        self.call(Service::Ecs, "ListTasks", req).await
    }

    async fn get_log_events(
        &self,
        req: &GetLogEventsRequest,
    ) -> Result<GetLogEventsResponse, BackendError> {
        self.call(Service::Logs, "GetLogEvents", req).await
    }
}
