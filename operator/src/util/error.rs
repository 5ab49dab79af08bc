#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Infrahub request failed: {source}")]
    Infrahub {
        #[from]
        source: crate::infrahub::Error,
    },

    #[error("no secret with username and password found for host {0}")]
    MissingCredentials(String),

    #[error("Failed to decode manifest: {0}")]
    Decode(String),

    #[error("no REST mapping for {api_version} {kind}: {message}")]
    Mapping {
        api_version: String,
        kind: String,
        message: String,
    },

    #[error("resource {namespace}/{name} already exists but is not managed by this operator")]
    ResourceNotOwned { namespace: String, name: String },

    #[error("failed to delete managed resource {key}: {message}")]
    StaleDelete { key: String, message: String },

    #[error("Failed to parse DateTime: {source}")]
    Chrono {
        #[from]
        source: chrono::ParseError,
    },

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
}
