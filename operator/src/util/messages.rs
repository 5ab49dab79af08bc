/// Warning recorded in `status.lastError` when an applied object turns out
/// to be claimed by another child as well.
pub fn already_managed_warning(owners: &str) -> String {
    format!("Warning: resource is already managed by VidraResource: {owners}")
}

/// Warning recorded when a shared object diverged from what this child
/// declares; the overwrite is skipped in favor of the current owner.
pub fn diverged_owner_warning(owners: &str, key: &str) -> String {
    format!("Warning: skipped update of {key}: content diverged from the copy managed by {owners}")
}
