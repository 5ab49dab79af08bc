use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

fn default_branch() -> String {
    "main".to_string()
}

/// Where in Infrahub the artifacts are looked up.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct InfrahubSource {
    /// Base URL of the Infrahub API (e.g. https://infrahub.example.com).
    #[serde(rename = "infrahubAPIURL")]
    pub infrahub_api_url: String,

    /// Branch to query; defaults to "main".
    #[serde(rename = "targetBranch", default = "default_branch")]
    pub target_branch: String,

    /// Either RFC3339 or relative like "now-2h". Empty means the current date.
    #[serde(rename = "targetDate", default)]
    pub target_date: String,

    /// Name of the artifact definition handled by this sync.
    #[serde(rename = "artefactName")]
    pub artifact_name: String,
}

/// Which cluster and namespace the manifests land in.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
pub struct Destination {
    /// API server URL of the target cluster. Empty or
    /// "https://kubernetes.default.svc" means the local cluster.
    #[serde(default)]
    pub server: String,

    /// Fallback namespace for namespaced objects that carry none.
    #[serde(default)]
    pub namespace: String,

    /// Reconcile on watch events from managed objects instead of the
    /// periodic requeue.
    #[serde(rename = "reconcileOnEvents", default)]
    pub reconcile_on_events: bool,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "infrahub.operators.com",
    version = "v1alpha1",
    kind = "InfrahubSync",
    plural = "infrahubsyncs",
    derive = "PartialEq",
    status = "InfrahubSyncStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.syncState\", \"name\": \"STATE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastSyncTime\", \"name\": \"LAST SYNC\", \"type\": \"date\" }"
)]
pub struct InfrahubSyncSpec {
    pub source: InfrahubSource,

    #[serde(default)]
    pub destination: Destination,
}

/// Status object for the [`InfrahubSync`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct InfrahubSyncStatus {
    /// Checksums of the artifacts projected in the last successful sync.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub checksums: Vec<String>,

    #[serde(rename = "syncState", default)]
    pub sync_state: State,

    /// Message of the last error encountered, if any.
    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Timestamp (RFC3339) of the last completed sync.
    #[serde(rename = "lastSyncTime", skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,

    /// The last reconciled generation.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

#[derive(CustomResource, Serialize, Deserialize, Default, Debug, PartialEq, Clone, JsonSchema)]
#[kube(
    group = "infrahub.operators.com",
    version = "v1alpha1",
    kind = "VidraResource",
    plural = "vidraresources",
    derive = "PartialEq",
    status = "VidraResourceStatus"
)]
#[kube(derive = "Default")]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.deployState\", \"name\": \"STATE\", \"type\": \"string\" }"
)]
#[kube(
    printcolumn = "{\"jsonPath\": \".status.lastSyncTime\", \"name\": \"LAST SYNC\", \"type\": \"date\" }"
)]
pub struct VidraResourceSpec {
    /// The Infrahub source this child was projected from. Used by the sync
    /// controller to tell its own children apart from those of other syncs.
    #[serde(default)]
    pub source: InfrahubSource,

    #[serde(default)]
    pub destination: Destination,

    /// Content checksum of the artifact behind `manifest`.
    #[serde(default)]
    pub checksum: String,

    /// Multi-document YAML/JSON carrying the objects to apply.
    #[serde(default)]
    pub manifest: String,

    #[serde(rename = "reconcileOnEvents", default)]
    pub reconcile_on_events: bool,

    /// Bump field: touched by the watch fabric to wake the controller.
    #[serde(rename = "reconciledAt", skip_serializing_if = "Option::is_none")]
    pub reconciled_at: Option<String>,
}

/// Status object for the [`VidraResource`] resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct VidraResourceStatus {
    /// Objects applied to the destination cluster by this resource.
    #[serde(rename = "managedResources", default, skip_serializing_if = "Vec::is_empty")]
    pub managed_resources: Vec<ManagedResource>,

    #[serde(rename = "deployState", default)]
    pub deploy_state: State,

    #[serde(rename = "lastError", skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Timestamp (RFC3339) of the last completed apply pass.
    #[serde(rename = "lastSyncTime", skip_serializing_if = "Option::is_none")]
    pub last_sync_time: Option<String>,

    /// The last reconciled generation.
    #[serde(rename = "observedGeneration", skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

/// Identity of one object applied to the destination cluster.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Default, JsonSchema)]
pub struct ManagedResource {
    #[serde(rename = "apiVersion")]
    pub api_version: String,

    pub kind: String,

    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

impl ManagedResource {
    /// Unique key of a managed object within one destination cluster.
    pub fn key(&self) -> String {
        format!(
            "{}:{}:{}:{}",
            self.api_version,
            self.kind,
            self.namespace.as_deref().unwrap_or_default(),
            self.name
        )
    }
}

/// A short description of a resource's current reconciliation state.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, JsonSchema, Default)]
pub enum State {
    /// The resource first appeared to the controller.
    #[default]
    Pending,

    Running,

    Succeeded,

    Failed,

    /// A managed object could not be deleted and lingers in the cluster.
    Stale,
}

impl FromStr for State {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(State::Pending),
            "Running" => Ok(State::Running),
            "Succeeded" => Ok(State::Succeeded),
            "Failed" => Ok(State::Failed),
            "Stale" => Ok(State::Stale),
            _ => Err(()),
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            State::Pending => write!(f, "Pending"),
            State::Running => write!(f, "Running"),
            State::Succeeded => write!(f, "Succeeded"),
            State::Failed => write!(f, "Failed"),
            State::Stale => write!(f, "Stale"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            State::Pending,
            State::Running,
            State::Succeeded,
            State::Failed,
            State::Stale,
        ] {
            assert_eq!(state.to_string().parse::<State>(), Ok(state));
        }
        assert!("Unknown".parse::<State>().is_err());
    }

    #[test]
    fn managed_resource_key_includes_all_coordinates() {
        let namespaced = ManagedResource {
            api_version: "apps/v1".into(),
            kind: "Deployment".into(),
            name: "web".into(),
            namespace: Some("prod".into()),
        };
        assert_eq!(namespaced.key(), "apps/v1:Deployment:prod:web");

        let cluster_scoped = ManagedResource {
            api_version: "v1".into(),
            kind: "Namespace".into(),
            name: "test".into(),
            namespace: None,
        };
        assert_eq!(cluster_scoped.key(), "v1:Namespace::test");
    }

    #[test]
    fn sync_spec_defaults_branch_to_main() {
        let spec: InfrahubSyncSpec = serde_json::from_value(serde_json::json!({
            "source": {
                "infrahubAPIURL": "https://infrahub.example.com",
                "artefactName": "cluster-manifests"
            }
        }))
        .unwrap();
        assert_eq!(spec.source.target_branch, "main");
        assert_eq!(spec.source.target_date, "");
        assert!(!spec.destination.reconcile_on_events);
    }

    #[test]
    fn status_fields_use_kubernetes_names() {
        let status = VidraResourceStatus {
            deploy_state: State::Succeeded,
            last_sync_time: Some("2025-01-01T00:00:00Z".into()),
            ..Default::default()
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["deployState"], "Succeeded");
        assert_eq!(value["lastSyncTime"], "2025-01-01T00:00:00Z");
        // Empty collections are left off the wire entirely.
        assert!(value.get("managedResources").is_none());
    }
}
