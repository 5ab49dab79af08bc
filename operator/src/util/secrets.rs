use super::{Error, host_token};
use k8s_openapi::api::core::v1::Secret;
use kube::{
    Api, Client, Resource,
    api::ListParams,
    core::NamespaceResourceScope,
};
use serde::de::DeserializeOwned;
use std::fmt::Debug;

/// Lists objects matching `labelKey=labelValue` across all namespaces,
/// newest `creationTimestamp` first. Ties are broken by ascending name so
/// the pick stays deterministic.
pub(crate) async fn sorted_by_label<K>(
    client: Client,
    label_key: &str,
    label_value: &str,
) -> Result<Vec<K>, Error>
where
    K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
    <K as Resource>::DynamicType: Default,
{
    let api: Api<K> = Api::all(client);
    let params = ListParams::default().labels(&format!("{label_key}={label_value}"));
    let mut items = api.list(&params).await?.items;
    items.sort_by(|a, b| {
        let a_created = a.meta().creation_timestamp.as_ref().map(|t| t.0);
        let b_created = b.meta().creation_timestamp.as_ref().map(|t| t.0);
        b_created
            .cmp(&a_created)
            .then_with(|| a.meta().name.cmp(&b.meta().name))
    });
    Ok(items)
}

/// Resolves Infrahub credentials for an endpoint from in-cluster Secrets
/// labelled `infrahub-api-url=<host>`. Rotation works by creating a newer
/// Secret; the old one can be deleted at leisure.
pub(crate) async fn credentials_for(client: Client, api_url: &str) -> Result<(String, String), Error> {
    let host = host_token(api_url)?;
    let secrets: Vec<Secret> = sorted_by_label(client, "infrahub-api-url", &host).await?;
    pick_credentials(&secrets).ok_or(Error::MissingCredentials(host))
}

/// First secret carrying both a `username` and a `password` key wins.
/// Values are trimmed of ASCII whitespace only; anything else is part of
/// the credential.
pub(crate) fn pick_credentials(secrets: &[Secret]) -> Option<(String, String)> {
    secrets.iter().find_map(|secret| {
        let data = secret.data.as_ref()?;
        let username = data.get("username")?;
        let password = data.get("password")?;
        Some((
            trim_ascii(&String::from_utf8_lossy(&username.0)),
            trim_ascii(&String::from_utf8_lossy(&password.0)),
        ))
    })
}

fn trim_ascii(value: &str) -> String {
    value
        .trim_matches(|c: char| c.is_ascii_whitespace())
        .to_string()
}
