//! HTTP gateway implementation of [`CloudClient`]

use std::time::Duration;

use async_trait::async_trait;
use cloud_api::{
    CreateInstanceRequest, CreateInstanceResponse, ErrorResponse, InstanceConfig, InstanceInfo,
    KeyPair, KeyPairInfo, TerminateInstancesRequest, TerminationNotice,
};
use reqwest::{header, Client, Method, RequestBuilder, Response, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{de::DeserializeOwned, Serialize};
use tracing::{debug, error};
use url::Url;

use crate::cloud::filter::EligibilityPolicy;
use crate::cloud::{CloudClient, CloudError};
use crate::errors::ControlError;

/// Talks to the provider gateway over JSON/HTTP
pub struct GatewayClient {
    client: Client,
    base_url: String,
    token: Option<SecretString>,
    project_id: Option<i64>,
    policy: EligibilityPolicy,
}

impl GatewayClient {
    pub fn new(
        base_url: &str,
        token: Option<SecretString>,
        project_id: Option<i64>,
        policy: EligibilityPolicy,
    ) -> Result<Self, ControlError> {
        let parsed = Url::parse(base_url)
            .map_err(|e| ControlError::ConfigError(format!("invalid gateway url {base_url}: {e}")))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(ControlError::ConfigError(format!(
                "unsupported gateway url scheme: {}",
                parsed.scheme()
            )));
        }
        let client = Client::builder().timeout(Duration::from_secs(30)).build()?;

        Ok(Self {
            client,
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            token,
            project_id,
            policy,
        })
    }

    /// Get the base URL
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        debug!("{} {}", method, url);

        let mut request = self.client.request(method, &url);
        if let Some(token) = &self.token {
            request = request.header(
                header::AUTHORIZATION,
                format!("Bearer {}", token.expose_secret()),
            );
        }
        request
    }

    async fn send(request: RequestBuilder) -> Result<Response, CloudError> {
        let response = request
            .send()
            .await
            .map_err(|e| CloudError::Unexpected(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::NOT_FOUND {
            return Err(CloudError::NotFound(body));
        }

        error!("Gateway request failed: {} - {}", status, body);
        Err(match serde_json::from_str::<ErrorResponse>(&body) {
            Ok(err) => CloudError::Provider {
                code: err.code,
                message: err.message,
            },
            Err(_) => CloudError::Provider {
                code: status.as_str().to_string(),
                message: body,
            },
        })
    }

    async fn json<T: DeserializeOwned>(request: RequestBuilder) -> Result<T, CloudError> {
        Self::send(request)
            .await?
            .json()
            .await
            .map_err(|e| CloudError::Unexpected(e.to_string()))
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, CloudError> {
        Self::json(self.request(Method::GET, path)).await
    }

    async fn post<T: DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, CloudError> {
        Self::json(self.request(Method::POST, path).json(body)).await
    }
}

#[async_trait]
impl CloudClient for GatewayClient {
    async fn list_eligible_instance_configs(&self) -> Result<Vec<InstanceConfig>, CloudError> {
        let configs: Vec<InstanceConfig> = self.get("/instance-configs").await?;
        let total = configs.len();
        let eligible = self.policy.filter(configs);
        debug!("{} of {} instance configs are eligible", eligible.len(), total);
        Ok(eligible)
    }

    async fn create_key_pair(&self) -> Result<KeyPair, CloudError> {
        let body = serde_json::json!({ "ProjectId": self.project_id });
        self.post("/key-pairs", &body).await
    }

    async fn delete_key_pair(&self, key_id: &str) -> Result<(), CloudError> {
        let path = format!("/key-pairs/{}", key_id);
        Self::send(self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn describe_key_pair(&self, key_id: &str) -> Result<KeyPairInfo, CloudError> {
        self.get(&format!("/key-pairs/{}", key_id)).await
    }

    async fn create_instance(
        &self,
        config: &InstanceConfig,
        key_id: &str,
    ) -> Result<String, CloudError> {
        let request = CreateInstanceRequest {
            zone: config.zone.clone(),
            instance_type: config.instance_type.clone(),
            key_id: key_id.to_string(),
            project_id: self.project_id,
        };
        let response: CreateInstanceResponse = self.post("/instances", &request).await?;
        Ok(response.instance_id)
    }

    async fn describe_instance(&self, instance_id: &str) -> Result<InstanceInfo, CloudError> {
        self.get(&format!("/instances/{}", instance_id)).await
    }

    async fn describe_instances(&self) -> Result<Vec<InstanceInfo>, CloudError> {
        let mut request = self.request(Method::GET, "/instances");
        if let Some(project_id) = self.project_id {
            request = request.query(&[("project_id", project_id)]);
        }
        Self::json(request).await
    }

    async fn terminate_instances(&self, instance_ids: &[String]) -> Result<(), CloudError> {
        let request = TerminateInstancesRequest {
            instance_ids: instance_ids.to_vec(),
        };
        Self::send(
            self.request(Method::POST, "/instances/terminate")
                .json(&request),
        )
        .await?;
        Ok(())
    }

    async fn check_imminent_termination(&self, instance_id: &str) -> Result<bool, CloudError> {
        let path = format!("/instances/{}/termination-notice", instance_id);
        let notice: TerminationNotice = self.get(&path).await?;
        Ok(notice.imminent)
    }
}
