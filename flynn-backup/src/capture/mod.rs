//! Remote command capture.
//!
//! Runs a one-off job on the cluster and exposes its attached output as a
//! stream of byte chunks. The stream only ends cleanly when the job exits with
//! status 0; every other ending (non-zero exit, remote error, dropped
//! connection) is reported as the stream's last item so a consumer never
//! mistakes truncated output for a complete dump.

use crate::platform::ControlPlane;
use bytes::Bytes;
use controller_client::{AttachFrame, AttachStream, ClientError, NewJob};
use futures_util::Stream;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("failed to start job: {0}")]
    JobStart(#[source] ClientError),

    #[error("job {job_id} exited with status {exit_code}")]
    JobFailed { job_id: String, exit_code: i32 },

    #[error("job {job_id} output interrupted: {reason}")]
    Interrupted { job_id: String, reason: String },
}

impl CaptureError {
    /// Exit status of a job that ran to completion and failed
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CaptureError::JobFailed { exit_code, .. } => Some(*exit_code),
            _ => None,
        }
    }
}

/// Terminal state of a captured job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Running,
    Succeeded,
    Failed(i32),
    Interrupted,
}

pub struct RemoteCommandCapture<'a, C> {
    platform: &'a C,
}

impl<'a, C: ControlPlane> RemoteCommandCapture<'a, C> {
    pub fn new(platform: &'a C) -> Self {
        Self { platform }
    }

    /// Start `job` in `app_id` and attach to its stdout and stderr.
    ///
    /// Log persistence is always disabled: dump output and the job's
    /// environment contain credentials and table data.
    pub async fn run_and_capture(&self, app_id: &str, job: &NewJob) -> Result<CapturedOutput, CaptureError> {
        let job = NewJob {
            disable_log: true,
            ..job.clone()
        };

        let attachment = self
            .platform
            .run_job_attached(app_id, &job)
            .await
            .map_err(CaptureError::JobStart)?;

        info!(app_id, job_id = %attachment.job_id, "Attached to job");
        Ok(CapturedOutput {
            app_id: app_id.to_string(),
            job_id: attachment.job_id,
            frames: attachment.frames,
            status: JobStatus::Running,
            bytes: 0,
        })
    }

    /// Ask the cluster to stop a job whose output is no longer wanted.
    pub async fn stop(&self, output: &CapturedOutput) {
        if output.status() != JobStatus::Running {
            return;
        }
        match self.platform.stop_job(&output.app_id, &output.job_id).await {
            Ok(()) => info!(job_id = %output.job_id, "Stopped job"),
            Err(e) => warn!(job_id = %output.job_id, "Failed to stop job: {}", e),
        }
    }
}

/// Output of a running job. Not restartable: each capture is a fresh job.
pub struct CapturedOutput {
    app_id: String,
    job_id: String,
    frames: AttachStream,
    status: JobStatus,
    bytes: u64,
}

impl CapturedOutput {
    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn status(&self) -> JobStatus {
        self.status
    }

    /// Output bytes yielded so far
    pub fn bytes_captured(&self) -> u64 {
        self.bytes
    }

    fn interrupted(&mut self, reason: String) -> CaptureError {
        self.status = JobStatus::Interrupted;
        warn!(job_id = %self.job_id, "Job output interrupted: {}", reason);
        CaptureError::Interrupted {
            job_id: self.job_id.clone(),
            reason,
        }
    }
}

impl Stream for CapturedOutput {
    type Item = Result<Bytes, CaptureError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        loop {
            if this.status != JobStatus::Running {
                return Poll::Ready(None);
            }

            let frame = ready!(this.frames.as_mut().poll_next(cx));
            match frame {
                Some(Ok(AttachFrame::Stdout(data))) | Some(Ok(AttachFrame::Stderr(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    this.bytes += data.len() as u64;
                    return Poll::Ready(Some(Ok(data)));
                }
                Some(Ok(AttachFrame::Exit(0))) => {
                    this.status = JobStatus::Succeeded;
                    debug!(job_id = %this.job_id, bytes = this.bytes, "Job exited successfully");
                    return Poll::Ready(None);
                }
                Some(Ok(AttachFrame::Exit(code))) => {
                    this.status = JobStatus::Failed(code);
                    warn!(job_id = %this.job_id, "Job exited with status {}", code);
                    return Poll::Ready(Some(Err(CaptureError::JobFailed {
                        job_id: this.job_id.clone(),
                        exit_code: code,
                    })));
                }
                Some(Ok(AttachFrame::Error(msg))) => {
                    return Poll::Ready(Some(Err(this.interrupted(msg))));
                }
                Some(Err(e)) => {
                    return Poll::Ready(Some(Err(this.interrupted(e.to_string()))));
                }
                None => {
                    let reason = "output stream closed before the job exited".to_string();
                    return Poll::Ready(Some(Err(this.interrupted(reason))));
                }
            }
        }
    }
}
