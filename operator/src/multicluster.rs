use k8s_openapi::api::core::v1::Secret;
use kube::{
    Client,
    config::{Config, KubeConfigOptions, Kubeconfig},
};
use std::collections::HashMap;
use tokio::sync::Mutex;

use crate::util::{Error, host_token, secrets::sorted_by_label};

/// Destinations that mean "this cluster"; they bypass the cache.
pub(crate) fn is_local_destination(server: &str) -> bool {
    server.is_empty() || server == "https://kubernetes.default.svc"
}

/// Process-wide cache of API clients for remote destination clusters,
/// keyed by server URL. Clients are built once from a Secret-embedded
/// kubeconfig and shared; kube clients are safe for concurrent use.
pub struct ClientCache {
    clients: Mutex<HashMap<String, Client>>,
}

impl ClientCache {
    pub fn new() -> Self {
        ClientCache {
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// Returns a client for `server_url`, building and caching one on a
    /// miss. The kubeconfig comes from the newest Secret labelled
    /// `cluster-kubeconfig=<host>`; the context whose cluster server
    /// mentions the host is selected.
    pub async fn client_for(&self, server_url: &str, local: &Client) -> Result<Client, Error> {
        if is_local_destination(server_url) {
            return Ok(local.clone());
        }

        let mut clients = self.clients.lock().await;
        if let Some(cached) = clients.get(server_url) {
            return Ok(cached.clone());
        }

        let host = host_token(server_url)?;
        let secrets: Vec<Secret> =
            sorted_by_label(local.clone(), "cluster-kubeconfig", &host).await?;
        let raw = secrets
            .iter()
            .find_map(|secret| secret.data.as_ref()?.get("kubeconfig"))
            .ok_or_else(|| Error::UserInput(format!("no kubeconfig secret found for host {host}")))?;

        let text = String::from_utf8_lossy(&raw.0);
        let kubeconfig = Kubeconfig::from_yaml(&text)
            .map_err(|err| Error::UserInput(format!("failed to load kubeconfig for {host}: {err}")))?;
        let context = select_context(&kubeconfig, &host)
            .ok_or_else(|| Error::UserInput(format!("no kubeconfig context matches host {host}")))?;

        let options = KubeConfigOptions {
            context: Some(context),
            cluster: None,
            user: None,
        };
        let config = Config::from_custom_kubeconfig(kubeconfig, &options)
            .await
            .map_err(|err| {
                Error::UserInput(format!("failed to build REST config for {host}: {err}"))
            })?;
        let client = Client::try_from(config)?;

        clients.insert(server_url.to_string(), client.clone());
        Ok(client)
    }
}

/// Picks the context whose cluster entry's server mentions the host token.
fn select_context(kubeconfig: &Kubeconfig, host: &str) -> Option<String> {
    kubeconfig.contexts.iter().find_map(|named| {
        let cluster_name = &named.context.as_ref()?.cluster;
        let cluster = kubeconfig.clusters.iter().find(|c| &c.name == cluster_name)?;
        let server = cluster.cluster.as_ref()?.server.as_ref()?;
        server.contains(host).then(|| named.name.clone())
    })
}
