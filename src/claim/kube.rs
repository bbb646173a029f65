//! Claim store backed by the annotations of one Kubernetes object.
//!
//! The API server offers optimistic concurrency per object through
//! `metadata.resourceVersion`, not per annotation. A conditional write
//! therefore re-reads the object, compares only this host's annotation with
//! the expected claim, and patches with the observed resource version. A
//! 409 caused by some other key changing is retried, so the store keeps
//! per-host compare-and-swap semantics.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, Certificate, Client, StatusCode};
use serde::Deserialize;
use serde_json::json;

use crate::claim::record::Claim;
use crate::claim::store::{CasOutcome, ClaimStore};
use crate::error::{HostwardenError, Result};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
pub const DEFAULT_ANNOTATION_PREFIX: &str = "hostclaim.hostwarden.io";
const MAX_PATCH_ATTEMPTS: usize = 5;

/// Object whose annotations hold the claims, normally the replica set that
/// runs the workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KubeResourceKind {
    ReplicationController,
    ReplicaSet,
    Deployment,
    ConfigMap,
}

impl KubeResourceKind {
    pub fn api_path(&self, namespace: &str, name: &str) -> String {
        match self {
            KubeResourceKind::ReplicationController => format!(
                "/api/v1/namespaces/{}/replicationcontrollers/{}",
                namespace, name
            ),
            KubeResourceKind::ConfigMap => {
                format!("/api/v1/namespaces/{}/configmaps/{}", namespace, name)
            }
            KubeResourceKind::ReplicaSet => format!(
                "/apis/apps/v1/namespaces/{}/replicasets/{}",
                namespace, name
            ),
            KubeResourceKind::Deployment => format!(
                "/apis/apps/v1/namespaces/{}/deployments/{}",
                namespace, name
            ),
        }
    }
}

impl std::str::FromStr for KubeResourceKind {
    type Err = HostwardenError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "rc" | "replicationcontroller" => Ok(KubeResourceKind::ReplicationController),
            "rs" | "replicaset" => Ok(KubeResourceKind::ReplicaSet),
            "deploy" | "deployment" => Ok(KubeResourceKind::Deployment),
            "cm" | "configmap" => Ok(KubeResourceKind::ConfigMap),
            other => Err(HostwardenError::Config(format!(
                "unknown resource kind '{}'",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KubeStoreConfig {
    pub api_server: String,
    pub namespace: String,
    pub kind: KubeResourceKind,
    pub name: String,
    pub annotation_prefix: String,
    /// Bearer token file. `None` sends no credentials.
    pub token_path: Option<PathBuf>,
    /// Extra root certificate (PEM) for the API server.
    pub ca_cert_path: Option<PathBuf>,
    pub request_timeout_ms: u64,
}

impl KubeStoreConfig {
    /// Settings for a worker running inside the cluster under a service
    /// account.
    pub fn in_cluster(kind: KubeResourceKind, name: impl Into<String>) -> Self {
        let sa = PathBuf::from(SERVICE_ACCOUNT_DIR);
        let namespace = std::fs::read_to_string(sa.join("namespace"))
            .map(|ns| ns.trim().to_string())
            .unwrap_or_else(|_| "default".to_string());
        let api_server = match (
            std::env::var("KUBERNETES_SERVICE_HOST"),
            std::env::var("KUBERNETES_SERVICE_PORT"),
        ) {
            (Ok(host), Ok(port)) => format!("https://{}:{}", host, port),
            _ => "https://kubernetes.default.svc".to_string(),
        };
        Self {
            api_server,
            namespace,
            kind,
            name: name.into(),
            annotation_prefix: DEFAULT_ANNOTATION_PREFIX.to_string(),
            token_path: Some(sa.join("token")),
            ca_cert_path: Some(sa.join("ca.crt")),
            request_timeout_ms: 10_000,
        }
    }
}

#[derive(Debug, Deserialize)]
struct KubeObject {
    metadata: ObjectMeta,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ObjectMeta {
    resource_version: String,
    #[serde(default)]
    annotations: HashMap<String, String>,
}

pub struct KubeClaimStore {
    client: Client,
    url: String,
    token: Option<String>,
    prefix: String,
}

impl KubeClaimStore {
    pub async fn connect(config: KubeStoreConfig) -> Result<Self> {
        let token = match &config.token_path {
            Some(path) => Some(
                tokio::fs::read_to_string(path)
                    .await
                    .map_err(|e| {
                        HostwardenError::Config(format!(
                            "failed to read service account token {}: {}",
                            path.display(),
                            e
                        ))
                    })?
                    .trim()
                    .to_string(),
            ),
            None => None,
        };

        let mut builder =
            Client::builder().timeout(Duration::from_millis(config.request_timeout_ms));
        if let Some(path) = &config.ca_cert_path {
            let pem = tokio::fs::read(path).await.map_err(|e| {
                HostwardenError::Config(format!(
                    "failed to read CA certificate {}: {}",
                    path.display(),
                    e
                ))
            })?;
            let cert = Certificate::from_pem(&pem).map_err(|e| {
                HostwardenError::Config(format!("invalid CA certificate: {}", e))
            })?;
            builder = builder.add_root_certificate(cert);
        }

        let url = format!(
            "{}{}",
            config.api_server.trim_end_matches('/'),
            config.kind.api_path(&config.namespace, &config.name)
        );
        tracing::info!(url = %url, prefix = %config.annotation_prefix, "Using Kubernetes claim store");

        Ok(Self {
            client: builder.build()?,
            url,
            token,
            prefix: config.annotation_prefix.trim_end_matches('/').to_string(),
        })
    }

    fn annotation_key(&self, host: &str) -> String {
        format!("{}/{}", self.prefix, host)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn fetch(&self) -> Result<ObjectMeta> {
        let response = self.authorize(self.client.get(&self.url)).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(HostwardenError::Store(format!(
                "GET {} returned {}: {}",
                self.url, status, body
            )));
        }
        Ok(response.json::<KubeObject>().await?.metadata)
    }
}

#[async_trait]
impl ClaimStore for KubeClaimStore {
    async fn read_all(&self) -> Result<HashMap<String, Claim>> {
        let meta = self.fetch().await?;
        let prefix = format!("{}/", self.prefix);
        let mut claims = HashMap::new();
        for (key, text) in &meta.annotations {
            let Some(host) = key.strip_prefix(&prefix) else {
                continue;
            };
            match Claim::from_text(text) {
                Ok(claim) => {
                    claims.insert(host.to_string(), claim);
                }
                Err(e) => {
                    tracing::warn!(annotation = %key, error = %e, "Ignoring malformed claim");
                }
            }
        }
        Ok(claims)
    }

    async fn conditional_write(
        &self,
        host: &str,
        expected: Option<&Claim>,
        new: &Claim,
    ) -> Result<CasOutcome> {
        let key = self.annotation_key(host);
        let value = new.to_text()?;

        for attempt in 1..=MAX_PATCH_ATTEMPTS {
            let meta = self.fetch().await?;
            // `read_all` hides unparseable annotations, so they compare as absent.
            let current = match meta.annotations.get(&key).map(|t| Claim::from_text(t)) {
                None => None,
                Some(Ok(claim)) => Some(claim),
                Some(Err(e)) => {
                    if expected.is_some() {
                        return Ok(CasOutcome::Conflict);
                    }
                    tracing::warn!(annotation = %key, error = %e, "Overwriting malformed claim");
                    None
                }
            };
            if current.as_ref() != expected {
                return Ok(CasOutcome::Conflict);
            }

            let mut annotations = serde_json::Map::new();
            annotations.insert(key.clone(), serde_json::Value::String(value.clone()));
            let patch = json!({
                "metadata": {
                    "resourceVersion": meta.resource_version,
                    "annotations": annotations,
                }
            });
            let response = self
                .authorize(self.client.patch(&self.url))
                .header(header::CONTENT_TYPE, "application/merge-patch+json")
                .body(serde_json::to_vec(&patch)?)
                .send()
                .await?;

            match response.status() {
                s if s.is_success() => return Ok(CasOutcome::Applied),
                StatusCode::CONFLICT => {
                    tracing::debug!(host, attempt, "Object changed concurrently, re-checking claim");
                }
                status => {
                    let body = response.text().await.unwrap_or_default();
                    return Err(HostwardenError::Store(format!(
                        "PATCH {} returned {}: {}",
                        self.url, status, body
                    )));
                }
            }
        }

        Err(HostwardenError::Store(format!(
            "gave up writing claim for {} after {} conflicting updates",
            host, MAX_PATCH_ATTEMPTS
        )))
    }
}
