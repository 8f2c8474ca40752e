//! Backup assembler - drives a whole backup run.
//!
//! 1. Resolve every tracked app into an expanded formation. Missing optional
//!    apps are dropped; anything else that fails aborts the run.
//! 2. Write the manifest as the first archive entry.
//! 3. Dump each database whose app is present, one at a time, streaming the
//!    job output into its own entry.
//! 4. Close the archive, whatever happened above.
//!
//! A missing optional app is tolerated but a failed dump never is, even for
//! an optional store.

pub mod manifest;
pub mod targets;

use crate::archive::spool::SpoolOptions;
use crate::archive::{ArchiveWriter, EntryError};
use crate::capture::RemoteCommandCapture;
use crate::platform::ControlPlane;
use crate::utils::errors::{BackupError, DumpError, Result};
use chrono::{DateTime, Utc};
use controller_client::{ClientError, ExpandedFormation};
use manifest::{Manifest, TrackedApp, MANIFEST_ENTRY, TRACKED_APPS};
use std::collections::BTreeMap;
use targets::{DumpTarget, DUMP_TARGETS};
use tokio::io::AsyncWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name of the archive's top-level directory for a backup taken at `at`.
pub fn archive_name(at: DateTime<Utc>) -> String {
    format!("flynn-backup-{}", at.format("%Y-%m-%d_%H%M%S"))
}

/// What to back up and how to buffer it
#[derive(Debug, Clone)]
pub struct BackupOptions {
    pub tracked_apps: Vec<TrackedApp>,
    pub dump_targets: Vec<DumpTarget>,
    pub spool: SpoolOptions,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            tracked_apps: TRACKED_APPS.to_vec(),
            dump_targets: DUMP_TARGETS.to_vec(),
            spool: SpoolOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpState {
    Pending,
    Dumping,
    Dumped { bytes: u64 },
    Failed,
}

#[derive(Debug, Clone)]
pub struct DumpRecord {
    pub target: DumpTarget,
    pub state: DumpState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReport {
    pub name: String,
    pub bytes: u64,
}

/// Backup execution result
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub archive_name: String,
    pub apps: Vec<String>,
    pub entries: Vec<EntryReport>,
    pub dumps: Vec<DumpRecord>,
    pub duration_secs: u64,
}

impl BackupReport {
    pub fn total_bytes(&self) -> u64 {
        self.entries.iter().map(|e| e.bytes).sum()
    }
}

/// Main backup assembler
pub struct BackupAssembler<'a, C> {
    platform: &'a C,
    options: BackupOptions,
    cancel: CancellationToken,
}

impl<'a, C: ControlPlane> BackupAssembler<'a, C> {
    /// Create an assembler (no cancellation support)
    pub fn new(platform: &'a C, options: BackupOptions) -> Self {
        Self::with_cancel(platform, options, CancellationToken::new())
    }

    /// Create an assembler that stops when `cancel` fires
    pub fn with_cancel(platform: &'a C, options: BackupOptions, cancel: CancellationToken) -> Self {
        Self {
            platform,
            options,
            cancel,
        }
    }

    /// Run a full backup into `sink`.
    ///
    /// The archive is closed on every path. When this returns an error the
    /// bytes written to `sink` are not a valid backup and should be discarded.
    pub async fn run<W>(&self, sink: W) -> Result<BackupReport>
    where
        W: AsyncWrite + Unpin,
    {
        let start = std::time::Instant::now();
        let name = archive_name(Utc::now());
        info!("Starting backup {}", name);

        let mut writer = ArchiveWriter::open(name.clone(), sink, self.options.spool.clone())
            .await
            .map_err(BackupError::Open)?;

        let result = self.write_archive(&mut writer).await;
        let closed = writer.close().await;

        match result {
            Ok(mut report) => {
                closed.map_err(BackupError::Finalize)?;
                report.duration_secs = start.elapsed().as_secs();
                info!(
                    "Backup {} complete: {} entries, {} bytes in {}s",
                    report.archive_name,
                    report.entries.len(),
                    report.total_bytes(),
                    report.duration_secs
                );
                Ok(report)
            }
            Err(e) => {
                if let Err(close_err) = closed {
                    warn!("Failed to close aborted archive {}: {}", name, close_err);
                }
                error!("Backup {} failed: {}", name, e);
                Err(e)
            }
        }
    }

    async fn write_archive<W>(&self, writer: &mut ArchiveWriter<W>) -> Result<BackupReport>
    where
        W: AsyncWrite + Unpin,
    {
        let manifest = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(BackupError::Cancelled),
            manifest = self.resolve() => manifest?,
        };

        let mut report = BackupReport {
            archive_name: writer.base_name().to_string(),
            apps: manifest.app_names(),
            entries: Vec::new(),
            dumps: Vec::new(),
            duration_secs: 0,
        };

        let bytes = writer
            .write_structured_entry(MANIFEST_ENTRY, &manifest)
            .await
            .map_err(BackupError::Manifest)?;
        report.entries.push(EntryReport {
            name: MANIFEST_ENTRY.to_string(),
            bytes,
        });

        report.dumps = self
            .dump_plan(&manifest)
            .into_iter()
            .map(|target| DumpRecord {
                target,
                state: DumpState::Pending,
            })
            .collect();

        for record in report.dumps.iter_mut() {
            let target = record.target;
            record.state = DumpState::Dumping;
            info!(store = target.app, entry = target.entry, "Dumping database");

            match self.dump(writer, &manifest, &target).await {
                Ok(bytes) => {
                    record.state = DumpState::Dumped { bytes };
                    info!(store = target.app, bytes, "Dump complete");
                    report.entries.push(EntryReport {
                        name: target.entry.to_string(),
                        bytes,
                    });
                }
                Err(source) => {
                    record.state = DumpState::Failed;
                    return Err(BackupError::Dump {
                        store: target.app.to_string(),
                        source,
                    });
                }
            }
        }

        Ok(report)
    }

    /// Look up every tracked app and build the manifest.
    pub async fn resolve(&self) -> Result<Manifest> {
        let mut apps = BTreeMap::new();

        for tracked in &self.options.tracked_apps {
            let app = match self.platform.get_app(tracked.name).await {
                Ok(app) => app,
                Err(e) if !tracked.required => {
                    debug!("Leaving optional app {} out of the backup: {}", tracked.name, e);
                    continue;
                }
                Err(source) => {
                    return Err(BackupError::RequiredApp {
                        app: tracked.name.to_string(),
                        source,
                    });
                }
            };

            let lookup = |what: &'static str| {
                move |source: ClientError| BackupError::Lookup {
                    app: tracked.name.to_string(),
                    what,
                    source,
                }
            };

            let release = self
                .platform
                .get_app_release(&app.id)
                .await
                .map_err(lookup("release"))?;
            let formation = self
                .platform
                .get_formation(&app.id, &release.id)
                .await
                .map_err(lookup("formation"))?;
            let artifact_id = release.artifact_id.clone().ok_or_else(|| {
                lookup("artifact")(ClientError::NotFound(format!("artifact for release {}", release.id)))
            })?;
            let artifact = self
                .platform
                .get_artifact(&artifact_id)
                .await
                .map_err(lookup("artifact"))?;

            debug!(app = tracked.name, release = %release.id, "Resolved app");
            apps.insert(
                tracked.name.to_string(),
                ExpandedFormation {
                    app,
                    release,
                    artifact,
                    processes: formation.processes,
                },
            );
        }

        Ok(Manifest::new(apps))
    }

    /// Targets to dump, in order: required ones always, optional ones only
    /// when their app made it into the manifest.
    pub fn dump_plan(&self, manifest: &Manifest) -> Vec<DumpTarget> {
        self.options
            .dump_targets
            .iter()
            .filter(|target| {
                let present = manifest.contains(target.app);
                if !present && !target.required {
                    debug!("Skipping {} dump, {} app not present", target.entry, target.app);
                }
                present || target.required
            })
            .copied()
            .collect()
    }

    async fn dump<W>(
        &self,
        writer: &mut ArchiveWriter<W>,
        manifest: &Manifest,
        target: &DumpTarget,
    ) -> std::result::Result<u64, DumpError>
    where
        W: AsyncWrite + Unpin,
    {
        let formation = manifest
            .get(target.app)
            .ok_or_else(|| DumpError::AppMissing(target.app.to_string()))?;
        let job = target.job(&formation.release)?;

        if self.cancel.is_cancelled() {
            return Err(DumpError::Cancelled);
        }

        // Job creation is not raced against the token: once the controller
        // has created the job, its id is needed to stop it.
        let capture = RemoteCommandCapture::new(self.platform);
        let mut output = capture.run_and_capture(&formation.app.id, &job).await?;
        if self.cancel.is_cancelled() {
            warn!(job_id = output.job_id(), "Cancelled while starting dump, stopping job");
            capture.stop(&output).await;
            return Err(DumpError::Cancelled);
        }

        let written = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => None,
            written = writer.write_streamed_entry(target.entry, &mut output) => Some(written),
        };

        match written {
            Some(Ok(bytes)) => Ok(bytes),
            Some(Err(EntryError::Source(e))) => Err(e.into()),
            Some(Err(EntryError::Archive(e))) => {
                capture.stop(&output).await;
                Err(e.into())
            }
            None => {
                warn!(job_id = output.job_id(), "Dump cancelled, stopping job");
                capture.stop(&output).await;
                Err(DumpError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{read_entries, BLOCK_SIZE};
    use crate::capture::CaptureError;
    use crate::platform::fake::{FakeControlPlane, JobScript};
    use controller_client::AttachFrame;
    use std::time::Duration;

    const PG_ENV: &[(&str, &str)] = &[
        ("PGHOST", "leader.postgres.discoverd"),
        ("PGUSER", "flynn"),
        ("PGPASSWORD", "pg-secret"),
    ];

    const MYSQL_ENV: &[(&str, &str)] = &[
        ("MYSQL_HOST", "leader.mariadb.discoverd"),
        ("MYSQL_USER", "flynn"),
        ("MYSQL_PWD", "mysql-secret"),
    ];

    /// postgres required, mariadb optional, discoverd required
    fn small_table() -> BackupOptions {
        BackupOptions {
            tracked_apps: vec![
                TrackedApp::required("postgres"),
                TrackedApp::optional("mariadb"),
                TrackedApp::required("discoverd"),
            ],
            ..BackupOptions::default()
        }
    }

    fn entry_names(out: &[u8]) -> Vec<String> {
        read_entries(out)
            .into_iter()
            .map(|(name, _)| name.split_once('/').unwrap().1.to_string())
            .collect()
    }

    #[test]
    fn test_archive_name() {
        let at = DateTime::parse_from_rfc3339("2024-03-07T09:05:01Z")
            .unwrap()
            .with_timezone(&Utc);
        assert_eq!(archive_name(at), "flynn-backup-2024-03-07_090501");
    }

    #[tokio::test]
    async fn test_optional_app_absent() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("discoverd", &[])
            .with_job("postgres", JobScript::succeeds(b"\x1f\x8bpostgres dump"));
        let assembler = BackupAssembler::new(&platform, small_table());

        let mut out = Vec::new();
        let report = assembler.run(&mut out).await.unwrap();

        assert_eq!(report.apps, vec!["discoverd", "postgres"]);
        assert_eq!(report.dumps.len(), 1);
        assert_eq!(report.dumps[0].state, DumpState::Dumped { bytes: 15 });

        let entries = read_entries(&out);
        assert_eq!(entry_names(&out), vec!["flynn.json", "postgres.sql.gz"]);
        assert!(entries[0].0.starts_with(&report.archive_name));
        assert_eq!(entries[1].1, b"\x1f\x8bpostgres dump");

        let manifest: serde_json::Value = serde_json::from_slice(&entries[0].1).unwrap();
        let apps: Vec<&String> = manifest.as_object().unwrap().keys().collect();
        assert_eq!(apps, vec!["discoverd", "postgres"]);
        assert_eq!(manifest["postgres"]["release"]["env"]["PGHOST"], "leader.postgres.discoverd");
        assert_eq!(manifest["postgres"]["processes"]["postgres"], 1);

        // mariadb was looked up, but no job ran for it
        assert!(platform.lookups.lock().unwrap().contains(&"mariadb".to_string()));
        assert_eq!(platform.jobs.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_optional_app_present() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("mariadb", MYSQL_ENV)
            .with_app("discoverd", &[])
            .with_app("flannel", &[])
            .with_app("controller", &[])
            .with_job("postgres", JobScript::succeeds(b"pg"))
            .with_job("mariadb", JobScript::succeeds(b"my"));
        let assembler = BackupAssembler::new(&platform, BackupOptions::default());

        let mut out = Vec::new();
        let report = assembler.run(&mut out).await.unwrap();

        assert_eq!(report.apps.len(), 5);
        assert_eq!(entry_names(&out), vec!["flynn.json", "postgres.sql.gz", "mysql.sql.gz"]);
        assert_eq!(read_entries(&out)[2].1, b"my");

        let jobs = platform.jobs.lock().unwrap();
        assert_eq!(jobs[0].0, "postgres-id");
        assert_eq!(jobs[1].0, "mariadb-id");
        assert_eq!(jobs[1].1.release_id, "mariadb-release");
        assert_eq!(jobs[1].1.env["MYSQL_PWD"], "mysql-secret");
        assert!(jobs.iter().all(|(_, job)| job.disable_log));
    }

    #[tokio::test]
    async fn test_required_app_missing_writes_no_entries() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("mariadb", MYSQL_ENV);
        let assembler = BackupAssembler::new(&platform, small_table());

        let mut out = Vec::new();
        let err = assembler.run(&mut out).await.unwrap_err();

        assert!(matches!(&err, BackupError::RequiredApp { app, .. } if app == "discoverd"));
        assert_eq!(err.to_string(), "error getting discoverd app details: app discoverd not found");
        assert!(read_entries(&out).is_empty());
        assert!(platform.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_release_lookup_failure_aborts() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("mariadb", MYSQL_ENV)
            .with_app("discoverd", &[])
            .with_failing_release("mariadb");
        let assembler = BackupAssembler::new(&platform, small_table());

        let err = assembler.run(Vec::new()).await.unwrap_err();
        assert!(matches!(
            &err,
            BackupError::Lookup { app, what: "release", .. } if app == "mariadb"
        ));
    }

    #[tokio::test]
    async fn test_failed_dump_aborts_without_entry() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("discoverd", &[])
            .with_job("postgres", JobScript::exits(1, b"truncated"));
        let assembler = BackupAssembler::new(&platform, small_table());

        let mut out = Vec::new();
        let err = assembler.run(&mut out).await.unwrap_err();

        assert_eq!(err.store(), Some("postgres"));
        match err {
            BackupError::Dump {
                source: DumpError::Capture(capture),
                ..
            } => assert_eq!(capture.exit_code(), Some(1)),
            other => panic!("unexpected error: {}", other),
        }
        assert_eq!(entry_names(&out), vec!["flynn.json"]);
    }

    #[tokio::test]
    async fn test_optional_store_dump_failure_still_aborts() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("mariadb", MYSQL_ENV)
            .with_app("discoverd", &[])
            .with_job("postgres", JobScript::succeeds(b"pg"))
            .with_job(
                "mariadb",
                JobScript::Frames(vec![Ok(AttachFrame::Error("host lost".to_string()))]),
            );
        let assembler = BackupAssembler::new(&platform, small_table());

        let mut out = Vec::new();
        let err = assembler.run(&mut out).await.unwrap_err();

        assert_eq!(err.store(), Some("mariadb"));
        assert!(matches!(
            err,
            BackupError::Dump {
                source: DumpError::Capture(CaptureError::Interrupted { .. }),
                ..
            }
        ));
        assert_eq!(entry_names(&out), vec!["flynn.json", "postgres.sql.gz"]);
    }

    #[tokio::test]
    async fn test_missing_connection_setting() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", &[("PGHOST", "leader.postgres.discoverd")])
            .with_app("discoverd", &[]);
        let assembler = BackupAssembler::new(&platform, small_table());

        let err = assembler.run(Vec::new()).await.unwrap_err();
        assert!(matches!(
            err,
            BackupError::Dump {
                source: DumpError::MissingEnv { .. },
                ..
            }
        ));
        assert!(platform.jobs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_stops_running_job() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("discoverd", &[])
            .with_job(
                "postgres",
                JobScript::Hang(vec![AttachFrame::Stdout(bytes::Bytes::from_static(b"slow"))]),
            );
        let cancel = CancellationToken::new();
        let assembler = BackupAssembler::with_cancel(&platform, small_table(), cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let mut out = Vec::new();
        let err = assembler.run(&mut out).await.unwrap_err();

        assert!(matches!(
            err,
            BackupError::Dump {
                source: DumpError::Cancelled,
                ..
            }
        ));
        assert_eq!(*platform.stopped.lock().unwrap(), vec!["job-1".to_string()]);
        // Closed with a trailer, holding only the manifest
        assert_eq!(entry_names(&out), vec!["flynn.json"]);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let platform = FakeControlPlane::new().with_app("postgres", PG_ENV);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let assembler = BackupAssembler::with_cancel(&platform, small_table(), cancel);

        let err = assembler.run(Vec::new()).await.unwrap_err();
        assert!(matches!(err, BackupError::Cancelled));
        assert!(platform.lookups.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_job_start_failure_aborts_without_entry() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("discoverd", &[])
            .with_job("postgres", JobScript::StartFails("no hosts available".to_string()));
        let assembler = BackupAssembler::new(&platform, small_table());

        let mut out = Vec::new();
        let err = assembler.run(&mut out).await.unwrap_err();

        assert!(matches!(
            err,
            BackupError::Dump {
                source: DumpError::Capture(CaptureError::JobStart(_)),
                ..
            }
        ));
        assert_eq!(entry_names(&out), vec!["flynn.json"]);
        assert!(platform.stopped.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_while_job_starts_stops_created_job() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("discoverd", &[])
            .with_start_delay(Duration::from_millis(200))
            .with_job("postgres", JobScript::succeeds(b"pg"));
        let cancel = CancellationToken::new();
        let assembler = BackupAssembler::with_cancel(&platform, small_table(), cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let mut out = Vec::new();
        let err = assembler.run(&mut out).await.unwrap_err();

        assert!(matches!(
            err,
            BackupError::Dump {
                source: DumpError::Cancelled,
                ..
            }
        ));
        assert_eq!(platform.jobs.lock().unwrap().len(), 1);
        assert_eq!(*platform.stopped.lock().unwrap(), vec!["job-1".to_string()]);
        assert_eq!(entry_names(&out), vec!["flynn.json"]);
    }

    /// Sink that never completes the header write of the postgres entry.
    #[derive(Default)]
    struct StallingSink {
        written: Vec<u8>,
    }

    impl AsyncWrite for StallingSink {
        fn poll_write(
            mut self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
            buf: &[u8],
        ) -> std::task::Poll<std::io::Result<usize>> {
            let entry = b"postgres.sql.gz";
            if buf.windows(entry.len()).any(|w| w == entry) {
                return std::task::Poll::Pending;
            }
            self.written.extend_from_slice(buf);
            std::task::Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }

        fn poll_shutdown(
            self: std::pin::Pin<&mut Self>,
            _: &mut std::task::Context<'_>,
        ) -> std::task::Poll<std::io::Result<()>> {
            std::task::Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_cancel_during_entry_write_leaves_no_trailer() {
        let platform = FakeControlPlane::new()
            .with_app("postgres", PG_ENV)
            .with_app("discoverd", &[])
            .with_job("postgres", JobScript::succeeds(b"pg"));
        let cancel = CancellationToken::new();
        let assembler = BackupAssembler::with_cancel(&platform, small_table(), cancel.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let mut sink = StallingSink::default();
        let err = assembler.run(&mut sink).await.unwrap_err();

        assert!(matches!(
            err,
            BackupError::Dump {
                source: DumpError::Cancelled,
                ..
            }
        ));
        // The job had already exited, nothing to stop
        assert!(platform.stopped.lock().unwrap().is_empty());

        // Only the manifest made it out, and the incomplete archive got no trailer
        assert_eq!(sink.written.len() % BLOCK_SIZE, 0);
        assert!(!sink.written.ends_with(&[0u8; BLOCK_SIZE * 2]));
        assert_eq!(entry_names(&sink.written), vec!["flynn.json"]);
    }
}
