//! Cluster manifest: the resolved state of every tracked system app.
//!
//! Serialized as `flynn.json`, the first entry of every backup.

use controller_client::ExpandedFormation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Archive entry name of the manifest
pub const MANIFEST_ENTRY: &str = "flynn.json";

/// A system app the backup records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TrackedApp {
    pub name: &'static str,
    /// A missing required app aborts the backup; a missing optional one is left out
    pub required: bool,
}

impl TrackedApp {
    pub const fn required(name: &'static str) -> Self {
        Self { name, required: true }
    }

    pub const fn optional(name: &'static str) -> Self {
        Self { name, required: false }
    }
}

/// Apps recorded in every backup, in lookup order.
pub const TRACKED_APPS: &[TrackedApp] = &[
    TrackedApp::required("postgres"),
    TrackedApp::optional("mariadb"),
    TrackedApp::required("discoverd"),
    TrackedApp::required("flannel"),
    TrackedApp::required("controller"),
];

/// App name -> expanded formation. Immutable once built.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Manifest {
    apps: BTreeMap<String, ExpandedFormation>,
}

impl Manifest {
    pub fn new(apps: BTreeMap<String, ExpandedFormation>) -> Self {
        Self { apps }
    }

    pub fn get(&self, name: &str) -> Option<&ExpandedFormation> {
        self.apps.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.apps.contains_key(name)
    }

    pub fn app_names(&self) -> Vec<String> {
        self.apps.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }
}
