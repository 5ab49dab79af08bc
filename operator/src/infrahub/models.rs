use serde::{Deserialize, Serialize};

// API request and response models. The query result mirrors the GraphQL
// edge/node nesting Infrahub responds with; `into_artifacts` flattens it.

#[derive(Serialize)]
pub(super) struct LoginRequest<'a> {
    pub username: &'a str,
    pub password: &'a str,
}

#[derive(Deserialize)]
pub(super) struct LoginResponse {
    pub access_token: String,
}

#[derive(Serialize)]
pub(super) struct QueryPayload<'a> {
    pub variables: QueryVariables<'a>,
}

#[derive(Serialize)]
pub(super) struct QueryVariables<'a> {
    pub artifactname: &'a str,
}

/// One artifact descriptor as used by the sync controller.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: String,
    pub storage_id: String,
    pub checksum: String,
}

#[derive(Deserialize, Default)]
pub(super) struct ArtifactQueryResult {
    #[serde(default)]
    data: ArtifactQueryData,
}

#[derive(Deserialize, Default)]
struct ArtifactQueryData {
    #[serde(rename = "CoreArtifact", default)]
    core_artifact: CoreArtifact,
}

#[derive(Deserialize, Default)]
struct CoreArtifact {
    #[serde(default)]
    edges: Vec<Edge>,
}

#[derive(Deserialize, Default)]
struct Edge {
    #[serde(default)]
    node: Node,
}

#[derive(Deserialize, Default)]
struct Node {
    #[serde(default)]
    id: String,
    #[serde(default)]
    storage_id: NestedId,
    #[serde(default)]
    checksum: NestedValue,
}

#[derive(Deserialize, Default)]
struct NestedId {
    #[serde(default)]
    id: String,
}

#[derive(Deserialize, Default)]
struct NestedValue {
    #[serde(default)]
    value: String,
}

impl ArtifactQueryResult {
    /// An empty edge list is a valid answer, not an error.
    pub(super) fn into_artifacts(self) -> Vec<Artifact> {
        self.data
            .core_artifact
            .edges
            .into_iter()
            .map(|edge| Artifact {
                id: edge.node.id,
                storage_id: edge.node.storage_id.id,
                checksum: edge.node.checksum.value,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flattens_edges_into_artifacts() {
        let raw = serde_json::json!({
            "data": {
                "CoreArtifact": {
                    "edges": [
                        {"node": {
                            "id": "a1",
                            "storage_id": {"id": "s1"},
                            "checksum": {"value": "c1"}
                        }},
                        {"node": {"id": "a2"}}
                    ]
                }
            }
        });
        let result: ArtifactQueryResult = serde_json::from_value(raw).unwrap();
        let artifacts = result.into_artifacts();
        assert_eq!(
            artifacts[0],
            Artifact {
                id: "a1".into(),
                storage_id: "s1".into(),
                checksum: "c1".into()
            }
        );
        // Missing nested fields decay to empty strings instead of failing.
        assert_eq!(artifacts[1].storage_id, "");
    }

    #[test]
    fn missing_sections_mean_no_artifacts() {
        let result: ArtifactQueryResult = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(result.into_artifacts().is_empty());
        let result: ArtifactQueryResult =
            serde_json::from_value(serde_json::json!({"data": {"CoreArtifact": {"edges": []}}}))
                .unwrap();
        assert!(result.into_artifacts().is_empty());
    }
}
