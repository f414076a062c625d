//! `reqwest`-backed implementation of `ControlPlaneClient`.

use async_trait::async_trait;
use bytes::Bytes;
use runner_core::artifact::{ArtifactDownload, HashKind};
use runner_core::job::{JobStatus, JobUpdateResult, RunnableJob, RuntimeInfo, StepStatus, StepUpdateResult};
use runner_core::secret::Secret;
use runner_core::ResourceId;
use serde::Deserialize;
use tokio::sync::mpsc;

use crate::client::{ArtifactSearchPage, ControlPlaneClient, LogStreamSink};
use crate::error::{ClientError, Result};

pub struct HttpControlPlaneClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpControlPlaneClient {
    pub fn new(base_url: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), path)
    }

    async fn read_error(response: reqwest::Response) -> ClientError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            ClientError::Unauthorized
        } else if status == reqwest::StatusCode::CONFLICT {
            ClientError::Conflict(body)
        } else if status == reqwest::StatusCode::NOT_FOUND {
            ClientError::NotFound(body)
        } else if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            ClientError::Transient(format!("{}: {}", status, body))
        } else {
            ClientError::Api(format!("{}: {}", status, body))
        }
    }

    fn map_transport_error(e: reqwest::Error) -> ClientError {
        if e.is_timeout() || e.is_connect() {
            ClientError::Transient(e.to_string())
        } else {
            ClientError::Api(e.to_string())
        }
    }
}

#[async_trait]
impl ControlPlaneClient for HttpControlPlaneClient {
    async fn ping(&self) -> Result<()> {
        let response = self
            .client
            .get(self.url("/v1/ping"))
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::read_error(response).await)
        }
    }

    async fn send_runtime_info(&self, info: RuntimeInfo) -> Result<()> {
        let response = self
            .client
            .post(self.url("/v1/runtime-info"))
            .json(&info)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::read_error(response).await)
        }
    }

    async fn dequeue(&self) -> Result<Option<RunnableJob>> {
        let response = self
            .client
            .post(self.url("/v1/jobs/dequeue"))
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if response.status() == reqwest::StatusCode::NO_CONTENT {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let job = response
            .json::<RunnableJob>()
            .await
            .map_err(Self::map_transport_error)?;
        Ok(Some(job))
    }

    async fn update_job_status(
        &self,
        job_id: ResourceId,
        status: JobStatus,
        error: Option<String>,
        version_tag: &str,
    ) -> Result<JobUpdateResult> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            status: JobStatus,
            error: Option<String>,
            version_tag: &'a str,
        }
        let response = self
            .client
            .put(self.url(&format!("/v1/jobs/{job_id}/status")))
            .json(&Body {
                status,
                error,
                version_tag,
            })
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response
            .json::<JobUpdateResult>()
            .await
            .map_err(Self::map_transport_error)?)
    }

    async fn update_job_fingerprint(
        &self,
        job_id: ResourceId,
        fingerprint: &str,
        hash_kind: HashKind,
        version_tag: &str,
    ) -> Result<JobUpdateResult> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            fingerprint: &'a str,
            hash_kind: HashKind,
            version_tag: &'a str,
        }
        let response = self
            .client
            .put(self.url(&format!("/v1/jobs/{job_id}/fingerprint")))
            .json(&Body {
                fingerprint,
                hash_kind,
                version_tag,
            })
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response
            .json::<JobUpdateResult>()
            .await
            .map_err(Self::map_transport_error)?)
    }

    async fn update_step_status(
        &self,
        step_id: ResourceId,
        status: StepStatus,
        error: Option<String>,
        version_tag: &str,
    ) -> Result<StepUpdateResult> {
        #[derive(serde::Serialize)]
        struct Body<'a> {
            status: StepStatus,
            error: Option<String>,
            version_tag: &'a str,
        }
        let response = self
            .client
            .put(self.url(&format!("/v1/steps/{step_id}/status")))
            .json(&Body {
                status,
                error,
                version_tag,
            })
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response
            .json::<StepUpdateResult>()
            .await
            .map_err(Self::map_transport_error)?)
    }

    async fn get_secrets_plaintext(&self, repo_id: ResourceId) -> Result<Vec<Secret>> {
        let response = self
            .client
            .get(self.url(&format!("/v1/repos/{repo_id}/secrets")))
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        Ok(response
            .json::<Vec<Secret>>()
            .await
            .map_err(Self::map_transport_error)?)
    }

    async fn create_artifact(
        &self,
        job_id: ResourceId,
        group: &str,
        relative_path: &str,
        body: Bytes,
        md5_hex: Option<&str>,
    ) -> Result<()> {
        let mut request = self
            .client
            .post(self.url(&format!("/v1/jobs/{job_id}/artifacts")))
            .query(&[("group", group), ("path", relative_path)])
            .body(body);
        if let Some(md5) = md5_hex {
            request = request.header("Content-MD5", md5);
        }
        let response = request.send().await.map_err(Self::map_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::read_error(response).await)
        }
    }

    async fn get_artifact_data(&self, artifact_id: ResourceId) -> Result<Bytes> {
        let response = self
            .client
            .get(self.url(&format!("/v1/artifacts/{artifact_id}/data")))
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        response.bytes().await.map_err(Self::map_transport_error)
    }

    async fn search_artifacts(
        &self,
        build_id: ResourceId,
        workflow: &str,
        job: &str,
        group: &str,
        cursor: Option<&str>,
    ) -> Result<ArtifactSearchPage> {
        #[derive(Deserialize)]
        struct Page {
            items: Vec<ArtifactDownload>,
            next_cursor: Option<String>,
        }
        let mut query = vec![
            ("build_id", build_id.to_string()),
            ("workflow", workflow.to_string()),
            ("job", job.to_string()),
            ("group", group.to_string()),
        ];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor.to_string()));
        }
        let response = self
            .client
            .get(self.url("/v1/artifacts/search"))
            .query(&query)
            .send()
            .await
            .map_err(Self::map_transport_error)?;
        if !response.status().is_success() {
            return Err(Self::read_error(response).await);
        }
        let page: Page = response.json().await.map_err(Self::map_transport_error)?;
        Ok(ArtifactSearchPage {
            items: page.items,
            next_cursor: page.next_cursor,
        })
    }

    async fn open_log_write_stream(&self, log_id: ResourceId) -> Result<Box<dyn LogStreamSink>> {
        let (tx, rx) = mpsc::channel::<std::result::Result<Bytes, std::io::Error>>(16);
        let body = reqwest::Body::wrap_stream(tokio_stream::wrappers::ReceiverStream::new(rx));
        let request = self
            .client
            .post(self.url(&format!("/v1/logs/{log_id}/stream")))
            .body(body);
        let handle = tokio::spawn(async move { request.send().await });
        Ok(Box::new(HttpLogStreamSink {
            tx: Some(tx),
            handle: Some(handle),
        }))
    }
}

struct HttpLogStreamSink {
    tx: Option<mpsc::Sender<std::result::Result<Bytes, std::io::Error>>>,
    handle: Option<tokio::task::JoinHandle<std::result::Result<reqwest::Response, reqwest::Error>>>,
}

#[async_trait]
impl LogStreamSink for HttpLogStreamSink {
    async fn write_chunk(&mut self, chunk: Bytes) -> Result<()> {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| ClientError::Api("stream already closed".into()))?;
        tx.send(Ok(chunk))
            .await
            .map_err(|_| ClientError::Transient("log stream receiver dropped".into()))
    }

    async fn finish(mut self: Box<Self>) -> Result<()> {
        self.tx.take();
        let handle = self
            .handle
            .take()
            .ok_or_else(|| ClientError::Api("stream already finished".into()))?;
        let response = handle
            .await
            .map_err(|e| ClientError::Api(e.to_string()))?
            .map_err(HttpControlPlaneClient::map_transport_error)?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(HttpControlPlaneClient::read_error(response).await)
        }
    }
}
