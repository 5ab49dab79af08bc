use std::{future::Future, time::Duration};

pub mod config;
pub mod patch;
pub mod secrets;

#[cfg(feature = "metrics")]
pub mod metrics;

pub(crate) mod colors;
pub(crate) mod messages;

mod error;

pub use error::*;

/// Name of the kubernetes resource manager.
pub(crate) const MANAGER_NAME: &str = "vidra-operator";

/// Identity stamped on every object this operator applies.
pub(crate) const OPERATOR_ID: &str = "vidra";

/// Label and annotation key marking an object as operator-managed.
pub(crate) const MANAGED_BY_KEY: &str = "managed-by";

/// Annotation key carrying the comma-separated list of claiming children.
pub(crate) const OWNED_BY_KEY: &str = "owned-by";

/// Finalizer guarding managed-object cleanup on child deletion.
pub(crate) const FINALIZER: &str = "vidraresource.infrahub.operators.com/finalizer";

/// Requeue delay after a failed reconciliation.
pub(crate) const ERROR_REQUEUE: Duration = Duration::from_secs(5);

/// Host part of a URL, without scheme, port or path. Secrets for
/// credentials and kubeconfigs are labelled with this token.
pub(crate) fn host_token(url: &str) -> Result<String, Error> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_owned))
        .ok_or_else(|| Error::UserInput(format!("URL has no host: {url}")))
}

pub(crate) fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339()
}

/// Age of an RFC3339 timestamp field. `None` when unset or unparsable.
pub(crate) fn age_of(timestamp: Option<&str>) -> Option<Duration> {
    let parsed: chrono::DateTime<chrono::Utc> = timestamp?.parse().ok()?;
    (chrono::Utc::now() - parsed).to_std().ok()
}

/// Reruns an API call on 409 Conflict with a short, bounded backoff.
/// Every other outcome is returned as-is on first occurrence.
pub(crate) async fn retry_on_conflict<T, F, Fut>(mut op: F) -> Result<T, kube::Error>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, kube::Error>>,
{
    let mut backoff = Duration::from_millis(100);
    let mut attempts = 0;
    loop {
        match op().await {
            Err(kube::Error::Api(ae)) if ae.code == 409 && attempts < 4 => {
                attempts += 1;
                tokio::time::sleep(backoff).await;
                backoff *= 2;
            }
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_token_strips_scheme_port_and_path() {
        assert_eq!(
            host_token("https://infrahub.example.com:8080/api").unwrap(),
            "infrahub.example.com"
        );
        assert_eq!(
            host_token("http://cluster2.example.com").unwrap(),
            "cluster2.example.com"
        );
        assert!(host_token("not a url").is_err());
    }

    #[test]
    fn age_of_handles_missing_and_bad_values() {
        assert!(age_of(None).is_none());
        assert!(age_of(Some("yesterday-ish")).is_none());
        let recent = chrono::Utc::now().to_rfc3339();
        assert!(age_of(Some(&recent)).unwrap() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn retry_on_conflict_gives_up_after_budget() {
        let mut calls = 0u32;
        let result: Result<(), kube::Error> = retry_on_conflict(|| {
            calls += 1;
            async {
                Err(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".into(),
                    message: "conflict".into(),
                    reason: "Conflict".into(),
                    code: 409,
                }))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 5);
    }

    #[tokio::test]
    async fn retry_on_conflict_passes_other_errors_through() {
        let mut calls = 0u32;
        let result: Result<(), kube::Error> = retry_on_conflict(|| {
            calls += 1;
            async {
                Err(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".into(),
                    message: "nope".into(),
                    reason: "NotFound".into(),
                    code: 404,
                }))
            }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
