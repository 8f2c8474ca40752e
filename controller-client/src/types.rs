//! Controller resource types.
//!
//! Only the fields the backup tool reads are typed. Anything else the
//! controller returns is kept in `extra` so a serialized descriptor carries
//! the full record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct App {
    pub id: String,
    pub name: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    #[serde(rename = "release", default, skip_serializing_if = "Option::is_none")]
    pub release_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Release {
    pub id: String,

    /// Artifact the release runs
    #[serde(rename = "artifact", default, skip_serializing_if = "Option::is_none")]
    pub artifact_id: Option<String>,

    /// Release environment (connection settings for the database apps)
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub processes: BTreeMap<String, serde_json::Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub id: String,

    #[serde(rename = "type")]
    pub kind: String,

    pub uri: String,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub meta: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,

    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Formation {
    #[serde(rename = "app")]
    pub app_id: String,

    #[serde(rename = "release")]
    pub release_id: String,

    /// Process type -> instance count
    #[serde(default)]
    pub processes: BTreeMap<String, i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// An app together with everything needed to recreate it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExpandedFormation {
    pub app: App,
    pub release: Release,
    pub artifact: Artifact,
    #[serde(default)]
    pub processes: BTreeMap<String, i32>,
}

/// A one-off job request.
#[derive(Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    #[serde(rename = "release")]
    pub release_id: String,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub entrypoint: Vec<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub cmd: Vec<String>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,

    /// Keep the job's output out of the cluster log aggregator
    #[serde(default)]
    pub disable_log: bool,
}

// Job environments carry database credentials, so only the keys are printed.
impl fmt::Debug for NewJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NewJob")
            .field("release_id", &self.release_id)
            .field("entrypoint", &self.entrypoint)
            .field("cmd", &self.cmd)
            .field("env", &self.env.keys().collect::<Vec<_>>())
            .field("disable_log", &self.disable_log)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_keeps_unknown_fields() {
        let json = r#"{
            "id": "rel-1",
            "artifact": "art-1",
            "env": {"PGHOST": "leader.postgres.discoverd"},
            "processes": {"postgres": {"cmd": ["/bin/start"]}},
            "artifacts": ["art-1"]
        }"#;

        let release: Release = serde_json::from_str(json).unwrap();
        assert_eq!(release.artifact_id.as_deref(), Some("art-1"));
        assert_eq!(release.env["PGHOST"], "leader.postgres.discoverd");
        assert!(release.extra.contains_key("artifacts"));

        let back = serde_json::to_value(&release).unwrap();
        assert_eq!(back["artifacts"][0], "art-1");
        assert_eq!(back["artifact"], "art-1");
    }

    #[test]
    fn test_formation_field_names() {
        let json = r#"{"app": "a1", "release": "r1", "processes": {"web": 3}}"#;
        let formation: Formation = serde_json::from_str(json).unwrap();
        assert_eq!(formation.app_id, "a1");
        assert_eq!(formation.release_id, "r1");
        assert_eq!(formation.processes["web"], 3);
    }

    #[test]
    fn test_release_references_use_controller_keys() {
        let app: App = serde_json::from_str(r#"{"id": "a1", "name": "postgres", "release": "r1"}"#).unwrap();
        assert_eq!(app.release_id.as_deref(), Some("r1"));
        assert!(app.extra.is_empty());

        let job = NewJob {
            release_id: "r1".to_string(),
            entrypoint: Vec::new(),
            cmd: Vec::new(),
            env: BTreeMap::new(),
            disable_log: true,
        };
        let body = serde_json::to_value(&job).unwrap();
        assert_eq!(body["release"], "r1");
        assert!(body.get("release_id").is_none());
    }

    #[test]
    fn test_new_job_debug_hides_env_values() {
        let job = NewJob {
            release_id: "r1".to_string(),
            entrypoint: vec!["sh".to_string()],
            cmd: vec!["-c".to_string(), "true".to_string()],
            env: BTreeMap::from([("PGPASSWORD".to_string(), "hunter2".to_string())]),
            disable_log: true,
        };

        let printed = format!("{:?}", job);
        assert!(printed.contains("PGPASSWORD"));
        assert!(!printed.contains("hunter2"));
    }
}
