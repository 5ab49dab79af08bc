use super::{Error, secrets::sorted_by_label};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::Client;
use std::time::Duration;

/// Operator tuning read once at startup from a ConfigMap labelled
/// `app=vidra`. Missing map or unparsable values fall back to defaults.
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// How often a sync is re-run against Infrahub.
    pub requeue_sync_after: Duration,
    /// How often a child's manifests are re-applied.
    pub requeue_resource_after: Duration,
    /// Name of the Infrahub query returning the artifact descriptors.
    pub query_name: String,
    /// Reconcile all children on watch events instead of the periodic requeue.
    pub event_based_reconcile: bool,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        OperatorConfig {
            requeue_sync_after: Duration::from_secs(60),
            requeue_resource_after: Duration::from_secs(600),
            query_name: "ArtifactIDs".to_string(),
            event_based_reconcile: false,
        }
    }
}

impl OperatorConfig {
    pub async fn load(client: Client) -> Result<Self, Error> {
        let maps: Vec<ConfigMap> = sorted_by_label(client, "app", "vidra").await?;
        Ok(Self::from_config_maps(&maps))
    }

    /// Maps arrive newest first; the newest one carrying data wins.
    fn from_config_maps(maps: &[ConfigMap]) -> Self {
        let mut config = Self::default();
        let Some(data) = maps.iter().find_map(|cm| cm.data.as_ref()) else {
            return config;
        };
        if let Some(raw) = data.get("requeueSyncAfter")
            && let Ok(duration) = parse_duration::parse(raw)
        {
            config.requeue_sync_after = duration;
        }
        if let Some(raw) = data.get("requeueResourceAfter")
            && let Ok(duration) = parse_duration::parse(raw)
        {
            config.requeue_resource_after = duration;
        }
        if let Some(name) = data.get("queryName")
            && !name.is_empty()
        {
            config.query_name = name.clone();
        }
        if let Some(raw) = data.get("eventBasedReconcile") {
            config.event_based_reconcile = raw.trim().eq_ignore_ascii_case("true");
        }
        config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::api::ObjectMeta;
    use std::collections::BTreeMap;

    fn config_map(data: &[(&str, &str)]) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("vidra-config".into()),
                ..Default::default()
            },
            data: Some(
                data.iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn defaults_apply_without_a_config_map() {
        let config = OperatorConfig::from_config_maps(&[]);
        assert_eq!(config, OperatorConfig::default());
        assert_eq!(config.requeue_sync_after, Duration::from_secs(60));
        assert_eq!(config.requeue_resource_after, Duration::from_secs(600));
        assert_eq!(config.query_name, "ArtifactIDs");
    }

    #[test]
    fn recognized_keys_override_defaults() {
        let config = OperatorConfig::from_config_maps(&[config_map(&[
            ("requeueSyncAfter", "30s"),
            ("requeueResourceAfter", "5m"),
            ("queryName", "ClusterArtifacts"),
            ("eventBasedReconcile", "true"),
        ])]);
        assert_eq!(config.requeue_sync_after, Duration::from_secs(30));
        assert_eq!(config.requeue_resource_after, Duration::from_secs(300));
        assert_eq!(config.query_name, "ClusterArtifacts");
        assert!(config.event_based_reconcile);
    }

    #[test]
    fn bad_values_keep_defaults() {
        let config = OperatorConfig::from_config_maps(&[config_map(&[
            ("requeueSyncAfter", "soonish"),
            ("eventBasedReconcile", "yes please"),
        ])]);
        assert_eq!(config.requeue_sync_after, Duration::from_secs(60));
        assert!(!config.event_based_reconcile);
    }
}
