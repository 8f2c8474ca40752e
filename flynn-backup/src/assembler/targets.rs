//! Database dump targets and the jobs that produce them.

use crate::utils::errors::DumpError;
use controller_client::{NewJob, Release};
use shell_escape::unix::escape;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Postgres,
    MySql,
}

/// One database exported into the archive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DumpTarget {
    /// Archive entry name
    pub entry: &'static str,
    /// App whose release provides the connection settings
    pub app: &'static str,
    pub kind: DumpKind,
    pub required: bool,
}

/// Dump order. The primary store always comes first.
pub const DUMP_TARGETS: &[DumpTarget] = &[
    DumpTarget {
        entry: "postgres.sql.gz",
        app: "postgres",
        kind: DumpKind::Postgres,
        required: true,
    },
    DumpTarget {
        entry: "mysql.sql.gz",
        app: "mariadb",
        kind: DumpKind::MySql,
        required: false,
    },
];

impl DumpTarget {
    /// Build the one-off job that writes a gzipped dump to stdout.
    pub fn job(&self, release: &Release) -> Result<NewJob, DumpError> {
        let (cmd, env) = match self.kind {
            DumpKind::Postgres => {
                let env = self.env_subset(release, &["PGHOST", "PGUSER", "PGPASSWORD"])?;
                ("pg_dumpall --clean --if-exists | gzip -9".to_string(), env)
            }
            DumpKind::MySql => {
                let host = self.env_value(release, "MYSQL_HOST")?;
                let user = self.env_value(release, "MYSQL_USER")?;
                let env = self.env_subset(release, &["MYSQL_PWD"])?;
                let cmd = format!(
                    "/usr/bin/mysqldump -h {} -u {} --all-databases | gzip -9",
                    escape(host.into()),
                    escape(user.into())
                );
                (cmd, env)
            }
        };

        Ok(NewJob {
            release_id: release.id.clone(),
            entrypoint: vec!["sh".to_string()],
            cmd: vec!["-c".to_string(), cmd],
            env,
            disable_log: true,
        })
    }

    fn env_value<'r>(&self, release: &'r Release, key: &'static str) -> Result<&'r str, DumpError> {
        release
            .env
            .get(key)
            .map(String::as_str)
            .ok_or_else(|| DumpError::MissingEnv {
                app: self.app.to_string(),
                key,
            })
    }

    fn env_subset(&self, release: &Release, keys: &[&'static str]) -> Result<BTreeMap<String, String>, DumpError> {
        keys.iter()
            .map(|&key| Ok((key.to_string(), self.env_value(release, key)?.to_string())))
            .collect()
    }
}
