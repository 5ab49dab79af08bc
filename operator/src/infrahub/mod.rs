use reqwest::{StatusCode, Url};
use std::time::Duration;
use tokio::time::sleep;

mod models;

pub use models::Artifact;
use models::{ArtifactQueryResult, LoginRequest, LoginResponse, QueryPayload, QueryVariables};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("request to Infrahub failed: {source}")]
    Transport {
        #[from]
        source: reqwest::Error,
    },

    #[error("login failed with status {status}: {body}")]
    Auth { status: StatusCode, body: String },

    #[error("query failed with status {status}: {body}")]
    Query { status: StatusCode, body: String },

    #[error("artifact download failed with status {status}: {body}")]
    Download { status: StatusCode, body: String },

    #[error("targetDate must be RFC3339 or relative like 'now-2h', got: {0}")]
    InvalidTargetDate(String),

    #[error("invalid Infrahub URL: {0}")]
    InvalidUrl(String),
}

const RETRY_ATTEMPTS: u32 = 5;
const INITIAL_BACKOFF: Duration = Duration::from_millis(200);

/// Outbound requests never hang a reconcile for longer than this.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Authenticated access to the Infrahub artifact catalog. All operations
/// are read-only on the Infrahub side and safe to retry.
#[derive(Clone)]
pub struct Client {
    http: reqwest::Client,
}

impl Client {
    pub fn new() -> Result<Self, Error> {
        Ok(Client {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
        })
    }

    /// Exchanges credentials for a bearer token.
    pub async fn login(
        &self,
        api_url: &str,
        username: &str,
        password: &str,
    ) -> Result<String, Error> {
        let url = build_url(api_url, &["api", "auth", "login"], &[])?;
        let payload = LoginRequest { username, password };
        let response = self
            .send_with_retry(|http| http.post(url.clone()).json(&payload))
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Auth { status, body });
        }
        Ok(response.json::<LoginResponse>().await?.access_token)
    }

    /// Runs the named query and returns the artifact descriptors matching
    /// `artifact_name` on the given branch and date.
    pub async fn run_query(
        &self,
        query_name: &str,
        api_url: &str,
        artifact_name: &str,
        branch: &str,
        date: &str,
        token: &str,
    ) -> Result<Vec<Artifact>, Error> {
        let url = build_url(
            api_url,
            &["api", "query", query_name],
            &[("update_group", "false"), ("branch", branch), ("at", date)],
        )?;
        let payload = QueryPayload {
            variables: QueryVariables {
                artifactname: artifact_name,
            },
        };
        let response = self
            .send_with_retry(|http| http.post(url.clone()).bearer_auth(token).json(&payload))
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Query { status, body });
        }
        let result: ArtifactQueryResult = response.json().await?;
        Ok(result.into_artifacts())
    }

    /// Downloads the manifest bundle behind an artifact id.
    pub async fn download_artifact(
        &self,
        api_url: &str,
        artifact_id: &str,
        branch: &str,
        date: &str,
        token: &str,
    ) -> Result<String, Error> {
        let url = build_url(
            api_url,
            &["api", "artifact", artifact_id],
            &[("branch", branch), ("at", date)],
        )?;
        let response = self
            .send_with_retry(|http| http.get(url.clone()).bearer_auth(token))
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Download { status, body });
        }
        Ok(response.text().await?)
    }

    /// Sends a request up to [`RETRY_ATTEMPTS`] times, doubling the backoff
    /// after each failed attempt. A final non-2xx response is handed back
    /// so the caller can attach its operation-specific error kind.
    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, Error>
    where
        F: Fn(&reqwest::Client) -> reqwest::RequestBuilder,
    {
        let mut backoff = INITIAL_BACKOFF;
        let mut attempt = 0;
        loop {
            match build(&self.http).send().await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) if attempt + 1 >= RETRY_ATTEMPTS => return Ok(response),
                Err(err) if attempt + 1 >= RETRY_ATTEMPTS => {
                    return Err(Error::Transport { source: err });
                }
                _ => {}
            }
            attempt += 1;
            sleep(backoff).await;
            backoff *= 2;
        }
    }
}

/// Joins path segments (percent-encoded) onto the API base URL and appends
/// the non-empty query parameters. The `at` parameter is validated before
/// it goes on the wire.
fn build_url(api_url: &str, segments: &[&str], query: &[(&str, &str)]) -> Result<Url, Error> {
    let mut url = Url::parse(api_url).map_err(|_| Error::InvalidUrl(api_url.to_string()))?;
    {
        let mut path = url
            .path_segments_mut()
            .map_err(|_| Error::InvalidUrl(api_url.to_string()))?;
        path.pop_if_empty();
        for segment in segments {
            path.push(segment);
        }
    }
    for (key, value) in query {
        if value.is_empty() {
            continue;
        }
        if *key == "at" {
            validate_target_date(value)?;
        }
        url.query_pairs_mut().append_pair(key, value);
    }
    Ok(url)
}

/// Accepts RFC3339 timestamps or relative offsets like `now-2h`.
pub fn validate_target_date(input: &str) -> Result<(), Error> {
    if chrono::DateTime::parse_from_rfc3339(input).is_ok() {
        return Ok(());
    }
    if let Some(rest) = input.strip_prefix("now")
        && let Some(amount) = rest.strip_prefix(['-', '+'])
        && amount.len() > 1
        && amount[..amount.len() - 1].bytes().all(|b| b.is_ascii_digit())
        && matches!(
            amount.as_bytes()[amount.len() - 1],
            b's' | b'm' | b'h' | b'd' | b'w'
        )
    {
        return Ok(());
    }
    Err(Error::InvalidTargetDate(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn target_date_accepts_rfc3339_and_relative() {
        assert!(validate_target_date("2025-01-01T00:00:00Z").is_ok());
        assert!(validate_target_date("2025-01-01T00:00:00+02:00").is_ok());
        assert!(validate_target_date("now-2h").is_ok());
        assert!(validate_target_date("now+30s").is_ok());
        assert!(validate_target_date("now-10w").is_ok());

        assert!(validate_target_date("yesterday").is_err());
        assert!(validate_target_date("now-2y").is_err());
        assert!(validate_target_date("now-h").is_err());
        assert!(validate_target_date("now2h").is_err());
    }

    #[test]
    fn build_url_escapes_segments_and_skips_empty_query() {
        let url = build_url(
            "https://infrahub.example.com/",
            &["api", "artifact", "id with space"],
            &[("branch", "main"), ("at", "")],
        )
        .unwrap();
        assert_eq!(
            url.as_str(),
            "https://infrahub.example.com/api/artifact/id%20with%20space?branch=main"
        );
    }

    #[test]
    fn build_url_rejects_invalid_dates_before_sending() {
        let err = build_url(
            "https://infrahub.example.com",
            &["api", "query", "ArtifactIDs"],
            &[("at", "not-a-date")],
        )
        .unwrap_err();
        assert!(matches!(err, Error::InvalidTargetDate(_)));
    }

    #[tokio::test]
    async fn login_returns_the_access_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .and(body_json(serde_json::json!({
                "username": "admin",
                "password": "infrahub"
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "tok-123"
                })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new().unwrap();
        let token = client.login(&server.uri(), "admin", "infrahub").await.unwrap();
        assert_eq!(token, "tok-123");
    }

    #[tokio::test]
    async fn login_retries_transient_failures_before_succeeding() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "access_token": "tok-after-retry"
                })),
            )
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new().unwrap();
        let token = client.login(&server.uri(), "admin", "infrahub").await.unwrap();
        assert_eq!(token, "tok-after-retry");
    }

    #[tokio::test]
    async fn login_surfaces_status_and_body_after_retry_budget() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/auth/login"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad credentials"))
            .expect(5)
            .mount(&server)
            .await;

        let client = Client::new().unwrap();
        let err = client
            .login(&server.uri(), "admin", "wrong")
            .await
            .unwrap_err();
        match err {
            Error::Auth { status, body } => {
                assert_eq!(status, StatusCode::UNAUTHORIZED);
                assert_eq!(body, "bad credentials");
            }
            other => panic!("expected Auth error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_query_flattens_the_edge_list() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/query/ArtifactIDs"))
            .and(query_param("update_group", "false"))
            .and(query_param("branch", "main"))
            .and(query_param("at", "now-2h"))
            .and(header("authorization", "Bearer tok"))
            .and(body_json(serde_json::json!({
                "variables": {"artifactname": "cluster-manifests"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"CoreArtifact": {"edges": [
                    {"node": {
                        "id": "a1",
                        "storage_id": {"id": "s1"},
                        "checksum": {"value": "c1"}
                    }}
                ]}}
            })))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new().unwrap();
        let artifacts = client
            .run_query(
                "ArtifactIDs",
                &server.uri(),
                "cluster-manifests",
                "main",
                "now-2h",
                "tok",
            )
            .await
            .unwrap();
        assert_eq!(artifacts.len(), 1);
        assert_eq!(artifacts[0].id, "a1");
        assert_eq!(artifacts[0].checksum, "c1");
    }

    #[tokio::test]
    async fn run_query_treats_no_edges_as_empty_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/query/ArtifactIDs"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"CoreArtifact": {"edges": []}}
            })))
            .mount(&server)
            .await;

        let client = Client::new().unwrap();
        let artifacts = client
            .run_query("ArtifactIDs", &server.uri(), "anything", "main", "", "tok")
            .await
            .unwrap();
        assert!(artifacts.is_empty());
    }

    #[tokio::test]
    async fn download_returns_the_raw_manifest_body() {
        let manifest = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: example\n";
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/artifact/a1"))
            .and(query_param("branch", "main"))
            .and(header("authorization", "Bearer tok"))
            .respond_with(ResponseTemplate::new(200).set_body_string(manifest))
            .expect(1)
            .mount(&server)
            .await;

        let client = Client::new().unwrap();
        let body = client
            .download_artifact(&server.uri(), "a1", "main", "", "tok")
            .await
            .unwrap();
        assert_eq!(body, manifest);
    }
}
