//! The slice of the control plane the backup pipeline depends on.

use controller_client::{App, Artifact, ClientError, ControllerClient, Formation, JobAttachment, NewJob, Release};
use std::future::Future;

pub trait ControlPlane: Send + Sync {
    fn get_app(&self, name: &str) -> impl Future<Output = Result<App, ClientError>> + Send;

    fn get_app_release(&self, app_id: &str) -> impl Future<Output = Result<Release, ClientError>> + Send;

    fn get_formation(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> impl Future<Output = Result<Formation, ClientError>> + Send;

    fn get_artifact(&self, artifact_id: &str) -> impl Future<Output = Result<Artifact, ClientError>> + Send;

    /// Create a one-off job and attach to its output from the start.
    fn run_job_attached(
        &self,
        app_id: &str,
        job: &NewJob,
    ) -> impl Future<Output = Result<JobAttachment, ClientError>> + Send;

    fn stop_job(&self, app_id: &str, job_id: &str) -> impl Future<Output = Result<(), ClientError>> + Send;
}

impl ControlPlane for ControllerClient {
    fn get_app(&self, name: &str) -> impl Future<Output = Result<App, ClientError>> + Send {
        ControllerClient::get_app(self, name)
    }

    fn get_app_release(&self, app_id: &str) -> impl Future<Output = Result<Release, ClientError>> + Send {
        ControllerClient::get_app_release(self, app_id)
    }

    fn get_formation(
        &self,
        app_id: &str,
        release_id: &str,
    ) -> impl Future<Output = Result<Formation, ClientError>> + Send {
        ControllerClient::get_formation(self, app_id, release_id)
    }

    fn get_artifact(&self, artifact_id: &str) -> impl Future<Output = Result<Artifact, ClientError>> + Send {
        ControllerClient::get_artifact(self, artifact_id)
    }

    fn run_job_attached(
        &self,
        app_id: &str,
        job: &NewJob,
    ) -> impl Future<Output = Result<JobAttachment, ClientError>> + Send {
        ControllerClient::run_job_attached(self, app_id, job)
    }

    fn stop_job(&self, app_id: &str, job_id: &str) -> impl Future<Output = Result<(), ClientError>> + Send {
        ControllerClient::stop_job(self, app_id, job_id)
    }
}
