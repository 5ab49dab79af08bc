use kube::{
    Api, Client, ResourceExt,
    api::{ApiResource, DeleteParams, DynamicObject, PostParams},
    core::{GroupVersionKind, TypeMeta},
    discovery::{self, ApiCapabilities, Scope},
};
use serde::Deserialize;
use std::collections::HashMap;
use vidra_types::*;

use super::owners;
use crate::util::{self, Error, MANAGED_BY_KEY, OPERATOR_ID, OWNED_BY_KEY};

/// Outcome of applying one object. Adoption and skipped divergence
/// surface as warnings on the child without failing the pass.
pub(super) enum Applied {
    Created,
    Updated,
    Unchanged,
    /// The object is also claimed by other children; our claim was added.
    Adopted { other_owners: String },
    /// The object is claimed by others and its content diverged from what
    /// we declare; the overwrite was skipped.
    SkippedDiverged { other_owners: String },
}

/// Splits a multi-document YAML/JSON stream into objects. Every document
/// must carry apiVersion, kind and a name; empty documents are skipped.
pub(super) fn decode_manifest(manifest: &str) -> Result<Vec<DynamicObject>, Error> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(manifest) {
        let value =
            serde_yaml::Value::deserialize(document).map_err(|e| Error::Decode(e.to_string()))?;
        if matches!(value, serde_yaml::Value::Null) {
            continue;
        }
        let object: DynamicObject =
            serde_yaml::from_value(value).map_err(|e| Error::Decode(e.to_string()))?;
        if object.types.is_none() {
            return Err(Error::Decode(
                "document is missing apiVersion or kind".to_string(),
            ));
        }
        if object.name_any().is_empty() {
            return Err(Error::Decode(
                "document is missing metadata.name".to_string(),
            ));
        }
        objects.push(object);
    }
    Ok(objects)
}

/// Resolves kinds against the destination cluster's discovery endpoint,
/// memoized per reconcile pass. Unknown kinds stay unresolved until the
/// matching CRD lands, at which point the next requeue succeeds.
pub(super) struct RestMapper<'a> {
    client: &'a Client,
    cache: HashMap<String, (ApiResource, ApiCapabilities)>,
}

impl<'a> RestMapper<'a> {
    pub(super) fn new(client: &'a Client) -> Self {
        RestMapper {
            client,
            cache: HashMap::new(),
        }
    }

    pub(super) async fn resolve(
        &mut self,
        types: &TypeMeta,
    ) -> Result<(ApiResource, ApiCapabilities), Error> {
        let key = format!("{}/{}", types.api_version, types.kind);
        if let Some(found) = self.cache.get(&key) {
            return Ok(found.clone());
        }
        let (group, version) = match types.api_version.split_once('/') {
            Some((group, version)) => (group, version),
            None => ("", types.api_version.as_str()),
        };
        let gvk = GroupVersionKind::gvk(group, version, &types.kind);
        let (ar, caps) = discovery::pinned_kind(self.client, &gvk)
            .await
            .map_err(|err| Error::Mapping {
                api_version: types.api_version.clone(),
                kind: types.kind.clone(),
                message: err.to_string(),
            })?;
        self.cache.insert(key, (ar.clone(), caps.clone()));
        Ok((ar, caps))
    }
}

/// An Api handle scoped the way the kind demands.
pub(super) fn dynamic_api(
    client: Client,
    ar: &ApiResource,
    caps: &ApiCapabilities,
    namespace: Option<&str>,
) -> Api<DynamicObject> {
    if caps.scope == Scope::Cluster {
        Api::all_with(client, ar)
    } else if let Some(ns) = namespace {
        Api::namespaced_with(client, ns, ar)
    } else {
        Api::default_namespaced_with(client, ar)
    }
}

/// Stamps the ownership markers: the `owned-by` claim, the `managed-by`
/// annotation gating all mutations, and the `managed-by` label the watch
/// fabric filters on.
pub(super) fn mark_managed(object: &mut DynamicObject, owner: &str) {
    let annotations = object.metadata.annotations.get_or_insert_with(Default::default);
    annotations.insert(OWNED_BY_KEY.to_string(), owner.to_string());
    annotations.insert(MANAGED_BY_KEY.to_string(), OPERATOR_ID.to_string());
    let labels = object.metadata.labels.get_or_insert_with(Default::default);
    labels.insert(MANAGED_BY_KEY.to_string(), OPERATOR_ID.to_string());
}

/// The status entry recorded for an applied object.
pub(super) fn managed_entry(object: &DynamicObject) -> ManagedResource {
    let types = object.types.clone().unwrap_or_default();
    ManagedResource {
        api_version: types.api_version,
        kind: types.kind,
        name: object.name_any(),
        namespace: object.namespace(),
    }
}

/// Semantic equality: everything except `metadata`, `status` and
/// `spec.finalizers`. The finalizer strip covers kinds that keep
/// finalizers inside their spec, like Namespace.
pub(super) fn is_semantically_equal(existing: &DynamicObject, desired: &DynamicObject) -> bool {
    existing.types == desired.types && scrubbed(&existing.data) == scrubbed(&desired.data)
}

fn scrubbed(data: &serde_json::Value) -> serde_json::Value {
    let mut data = data.clone();
    if let Some(map) = data.as_object_mut() {
        map.remove("status");
        if let Some(spec) = map.get_mut("spec").and_then(|s| s.as_object_mut()) {
            spec.remove("finalizers");
        }
    }
    data
}

/// Did an earlier pass of this child already manage the object? Used to
/// tell a restore (user stripped our annotations) from a takeover.
fn previously_managed(instance: &VidraResource, object: &DynamicObject) -> bool {
    let key = managed_entry(object).key();
    instance
        .status
        .as_ref()
        .is_some_and(|s| s.managed_resources.iter().any(|m| m.key() == key))
}

/// Creates, updates or adopts one object in the destination cluster.
/// `desired` already carries the ownership markers for `instance`.
pub(super) async fn apply_object(
    api: &Api<DynamicObject>,
    instance: &VidraResource,
    desired: &DynamicObject,
) -> Result<Applied, Error> {
    let name = desired.name_any();
    let Some(existing) = api.get_opt(&name).await? else {
        api.create(&PostParams::default(), desired).await?;
        return Ok(Applied::Created);
    };

    let foreign =
        existing.annotations().get(MANAGED_BY_KEY).map(String::as_str) != Some(OPERATOR_ID);
    if foreign && !previously_managed(instance, desired) {
        // Never take over an object this operator did not create.
        return Err(Error::ResourceNotOwned {
            namespace: desired.namespace().unwrap_or_default(),
            name,
        });
    }

    let owner = instance.name_any();
    let existing_owners = existing
        .annotations()
        .get(OWNED_BY_KEY)
        .cloned()
        .unwrap_or_default();

    if foreign || owners::is_sole_owner(&existing_owners, &owner) {
        // Sole owner, or a restore after someone stripped the markers:
        // converge the object on the declared content.
        if !foreign && is_semantically_equal(&existing, desired) {
            return Ok(Applied::Unchanged);
        }
        replace_preserving_version(api, desired).await?;
        return Ok(Applied::Updated);
    }

    let other_owners = owners::release(&existing_owners, &owner);
    if is_semantically_equal(&existing, desired) {
        // Shared content: join the owner list instead of fighting over it.
        claim_ownership(api, &name, &owner).await?;
        return Ok(Applied::Adopted { other_owners });
    }

    // Content diverged while another child claims the object. Overwriting
    // would make two children fight; leave the current owner's copy.
    Ok(Applied::SkippedDiverged { other_owners })
}

/// Replaces the object with `desired`, carrying over the live
/// `resourceVersion` and re-reading it on every conflict retry.
async fn replace_preserving_version(
    api: &Api<DynamicObject>,
    desired: &DynamicObject,
) -> Result<(), Error> {
    let name = desired.name_any();
    util::retry_on_conflict(|| {
        let api = api.clone();
        let name = name.clone();
        let mut updated = desired.clone();
        async move {
            let current = api.get_opt(&name).await?;
            updated.metadata.resource_version = current.and_then(|c| c.metadata.resource_version);
            api.replace(&name, &PostParams::default(), &updated)
                .await
                .map(|_| ())
        }
    })
    .await?;
    Ok(())
}

/// Adds `owner` to the object's `owned-by` list (and restores the managed
/// markers) against the live object, so concurrent claimants converge.
async fn claim_ownership(api: &Api<DynamicObject>, name: &str, owner: &str) -> Result<(), Error> {
    util::retry_on_conflict(|| {
        let api = api.clone();
        let name = name.to_string();
        let owner = owner.to_string();
        async move {
            let Some(mut current) = api.get_opt(&name).await? else {
                return Ok(());
            };
            let annotations = current.metadata.annotations.get_or_insert_with(Default::default);
            let union = owners::claim(
                annotations.get(OWNED_BY_KEY).map(String::as_str).unwrap_or_default(),
                &owner,
            );
            annotations.insert(OWNED_BY_KEY.to_string(), union);
            annotations.insert(MANAGED_BY_KEY.to_string(), OPERATOR_ID.to_string());
            current
                .metadata
                .labels
                .get_or_insert_with(Default::default)
                .insert(MANAGED_BY_KEY.to_string(), OPERATOR_ID.to_string());
            api.replace(&name, &PostParams::default(), &current)
                .await
                .map(|_| ())
        }
    })
    .await?;
    Ok(())
}

/// Removes `owner` from the object's `owned-by` list without deleting it.
async fn release_ownership(api: &Api<DynamicObject>, name: &str, owner: &str) -> Result<(), Error> {
    util::retry_on_conflict(|| {
        let api = api.clone();
        let name = name.to_string();
        let owner = owner.to_string();
        async move {
            let Some(mut current) = api.get_opt(&name).await? else {
                return Ok(());
            };
            let annotations = current.metadata.annotations.get_or_insert_with(Default::default);
            let remaining = owners::release(
                annotations.get(OWNED_BY_KEY).map(String::as_str).unwrap_or_default(),
                &owner,
            );
            annotations.insert(OWNED_BY_KEY.to_string(), remaining);
            api.replace(&name, &PostParams::default(), &current)
                .await
                .map(|_| ())
        }
    })
    .await?;
    Ok(())
}

/// Deletes or releases one object this child no longer declares.
/// Foreign objects are never touched; shared objects only lose our
/// claim; sole ownership (or an emptied list) means deletion.
pub(super) async fn delete_managed(
    dest: Client,
    mapper: &mut RestMapper<'_>,
    instance: &VidraResource,
    entry: &ManagedResource,
) -> Result<(), Error> {
    let types = TypeMeta {
        api_version: entry.api_version.clone(),
        kind: entry.kind.clone(),
    };
    let (ar, caps) = mapper.resolve(&types).await?;
    let api = dynamic_api(dest, &ar, &caps, entry.namespace.as_deref());

    let Some(existing) = api.get_opt(&entry.name).await? else {
        return Ok(()); // already gone
    };

    if existing.annotations().get(MANAGED_BY_KEY).map(String::as_str) != Some(OPERATOR_ID) {
        return Ok(()); // foreign object - never delete
    }

    let owner = instance.name_any();
    let raw_owners = existing
        .annotations()
        .get(OWNED_BY_KEY)
        .cloned()
        .unwrap_or_default();
    let remaining = owners::release(&raw_owners, &owner);
    if !remaining.is_empty() {
        // Other children still claim the object; only drop our name.
        return release_ownership(&api, &entry.name, &owner).await;
    }

    let result = util::retry_on_conflict(|| {
        let api = api.clone();
        let name = entry.name.clone();
        async move {
            match api.delete(&name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
                Err(err) => Err(err),
            }
        }
    })
    .await;

    result.map_err(|err| Error::StaleDelete {
        key: entry.key(),
        message: err.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(yaml: &str) -> DynamicObject {
        serde_yaml::from_str(yaml).unwrap()
    }

    #[test]
    fn decode_splits_documents_and_skips_empties() {
        let manifest = "\
apiVersion: v1
kind: ConfigMap
metadata:
  name: example
  namespace: default
data:
  k: v
---
---
{\"apiVersion\": \"v1\", \"kind\": \"Namespace\", \"metadata\": {\"name\": \"test\"}}
";
        let objects = decode_manifest(manifest).unwrap();
        assert_eq!(objects.len(), 2);
        assert_eq!(objects[0].name_any(), "example");
        assert_eq!(objects[0].types.as_ref().unwrap().kind, "ConfigMap");
        assert_eq!(objects[1].name_any(), "test");
        assert_eq!(objects[1].types.as_ref().unwrap().kind, "Namespace");
    }

    #[test]
    fn decode_rejects_documents_without_identity() {
        assert!(decode_manifest("data:\n  k: v\n").is_err());
        let missing_name = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        assert!(decode_manifest(missing_name).is_err());
        assert!(decode_manifest(": not yaml: [").is_err());
    }

    #[test]
    fn decode_of_empty_manifest_is_empty() {
        assert!(decode_manifest("").unwrap().is_empty());
        assert!(decode_manifest("---\n---\n").unwrap().is_empty());
    }

    #[test]
    fn equality_ignores_metadata_status_and_spec_finalizers() {
        let desired = parse(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: test\nspec:\n  finalizers: []\n",
        );
        let existing = parse(
            "apiVersion: v1\nkind: Namespace\nmetadata:\n  name: test\n  resourceVersion: '42'\n  annotations:\n    owned-by: other\nspec:\n  finalizers: [kubernetes]\nstatus:\n  phase: Active\n",
        );
        assert!(is_semantically_equal(&existing, &desired));
    }

    #[test]
    fn equality_detects_content_drift() {
        let desired = parse(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: example\ndata:\n  k: v\n",
        );
        let drifted = parse(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: example\ndata:\n  k: changed\n",
        );
        assert!(!is_semantically_equal(&drifted, &desired));

        let other_kind = parse(
            "apiVersion: v1\nkind: Secret\nmetadata:\n  name: example\ndata:\n  k: v\n",
        );
        assert!(!is_semantically_equal(&other_kind, &desired));
    }

    #[test]
    fn mark_managed_stamps_label_and_annotations() {
        let mut object = parse(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: example\ndata:\n  k: v\n",
        );
        mark_managed(&mut object, "a1");
        assert_eq!(object.annotations().get(OWNED_BY_KEY).unwrap(), "a1");
        assert_eq!(object.annotations().get(MANAGED_BY_KEY).unwrap(), OPERATOR_ID);
        assert_eq!(object.labels().get(MANAGED_BY_KEY).unwrap(), OPERATOR_ID);
    }

    #[test]
    fn managed_entry_captures_identity() {
        let object = parse(
            "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: web\n  namespace: prod\n",
        );
        let entry = managed_entry(&object);
        assert_eq!(entry.key(), "apps/v1:Deployment:prod:web");
    }

    #[test]
    fn restore_is_distinguished_from_takeover() {
        let object = parse(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: example\n  namespace: default\n",
        );
        let mut child = VidraResource::new("a1", VidraResourceSpec::default());
        assert!(!previously_managed(&child, &object));

        child.status = Some(VidraResourceStatus {
            managed_resources: vec![ManagedResource {
                api_version: "v1".into(),
                kind: "ConfigMap".into(),
                name: "example".into(),
                namespace: Some("default".into()),
            }],
            ..Default::default()
        });
        assert!(previously_managed(&child, &object));
    }
}
