//! HTTP client for the controller API.

use crate::attach::{AttachCodec, AttachFrame};
use crate::error::{ClientError, Result};
use crate::types::{App, Artifact, Formation, NewJob, Release};
use futures_util::{Stream, TryStreamExt};
use reqwest::{header, Response, StatusCode};
use serde::de::DeserializeOwned;
use std::pin::Pin;
use std::time::Duration;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::debug;

/// Media type that asks the controller to stream attach frames back
pub const ATTACH_MEDIA_TYPE: &str = "application/vnd.flynn.attach";

/// Response header carrying the id of a newly created job
pub const JOB_ID_HEADER: &str = "flynn-job-id";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Decoded frames of an attached job, in the order the job produced them
pub type AttachStream = Pin<Box<dyn Stream<Item = Result<AttachFrame>> + Send>>;

/// A running one-off job and its attached output.
pub struct JobAttachment {
    pub job_id: String,
    pub frames: AttachStream,
}

/// Controller API client
#[derive(Clone)]
pub struct ControllerClient {
    http: reqwest::Client,
    base_url: String,
    key: String,
}

impl ControllerClient {
    /// Create a client for the controller at `base_url`, authenticating with `key`.
    ///
    /// No overall request timeout is set: attached jobs stream for as long as
    /// the dump runs.
    pub fn new(base_url: impl Into<String>, key: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()?;

        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: key.into(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str, what: String) -> Result<T> {
        debug!("GET {}", path);
        let resp = self
            .http
            .get(self.url(path))
            .basic_auth("", Some(&self.key))
            .header(header::ACCEPT, "application/json")
            .send()
            .await?;

        let resp = check_status(resp, what).await?;
        let body = resp.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Look up an app by name or id.
    pub async fn get_app(&self, name: &str) -> Result<App> {
        self.get_json(&format!("/apps/{}", name), format!("app {}", name))
            .await
    }

    /// Current release of an app.
    pub async fn get_app_release(&self, app_id: &str) -> Result<Release> {
        self.get_json(
            &format!("/apps/{}/release", app_id),
            format!("release for app {}", app_id),
        )
        .await
    }

    pub async fn get_formation(&self, app_id: &str, release_id: &str) -> Result<Formation> {
        self.get_json(
            &format!("/apps/{}/formations/{}", app_id, release_id),
            format!("formation {}/{}", app_id, release_id),
        )
        .await
    }

    pub async fn get_artifact(&self, artifact_id: &str) -> Result<Artifact> {
        self.get_json(
            &format!("/artifacts/{}", artifact_id),
            format!("artifact {}", artifact_id),
        )
        .await
    }

    /// Create a one-off job and attach to its output.
    ///
    /// The controller holds the response open and streams attach frames until
    /// the job exits, so output produced before this call returns is not lost.
    pub async fn run_job_attached(&self, app_id: &str, job: &NewJob) -> Result<JobAttachment> {
        debug!(app_id, ?job, "Creating attached job");
        let resp = self
            .http
            .post(self.url(&format!("/apps/{}/jobs", app_id)))
            .basic_auth("", Some(&self.key))
            .header(header::ACCEPT, ATTACH_MEDIA_TYPE)
            .json(job)
            .send()
            .await?;

        let resp = check_status(resp, format!("app {}", app_id)).await?;

        let job_id = resp
            .headers()
            .get(JOB_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| ClientError::Protocol(format!("response missing {} header", JOB_ID_HEADER)))?;

        let body = resp.bytes_stream().map_err(std::io::Error::other);
        let frames = FramedRead::new(StreamReader::new(body), AttachCodec);

        Ok(JobAttachment {
            job_id,
            frames: Box::pin(frames),
        })
    }

    /// Ask the controller to stop a job. A job that is already gone is not an error.
    pub async fn stop_job(&self, app_id: &str, job_id: &str) -> Result<()> {
        debug!(app_id, job_id, "Stopping job");
        let resp = self
            .http
            .delete(self.url(&format!("/apps/{}/jobs/{}", app_id, job_id)))
            .basic_auth("", Some(&self.key))
            .send()
            .await?;

        match check_status(resp, format!("job {}", job_id)).await {
            Ok(_) => Ok(()),
            Err(ClientError::NotFound(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

async fn check_status(resp: Response, what: String) -> Result<Response> {
    let status = resp.status();
    if status == StatusCode::NOT_FOUND {
        return Err(ClientError::NotFound(what));
    }
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_else(|_| "Unknown error".to_string());
        return Err(ClientError::Status { status, body });
    }
    Ok(resp)
}
