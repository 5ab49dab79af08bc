//! The `owned-by` annotation on an applied object carries the
//! comma-separated names of every child claiming it. The annotation on
//! the target object is the single source of truth; each child's status
//! list is an index rebuilt every reconcile. All operations here are
//! idempotent so concurrent claimants converge under retry-on-conflict.

/// Splits an annotation value into owner names, dropping padding and
/// empty entries.
pub(crate) fn read(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Adds `owner` to the list unless already present.
pub(crate) fn claim(raw: &str, owner: &str) -> String {
    let mut owners = read(raw);
    if !owners.iter().any(|o| o == owner) {
        owners.push(owner.to_string());
    }
    owners.join(",")
}

/// Removes `owner` from the list. An empty result means the object has
/// no claimant left and is garbage.
pub(crate) fn release(raw: &str, owner: &str) -> String {
    read(raw)
        .into_iter()
        .filter(|o| o != owner)
        .collect::<Vec<_>>()
        .join(",")
}

/// True when `owner` is the only name on the list.
pub(crate) fn is_sole_owner(raw: &str, owner: &str) -> bool {
    let owners = read(raw);
    !owners.is_empty() && owners.iter().all(|o| o == owner)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_trims_and_drops_empties() {
        assert_eq!(read("a, b ,,c"), vec!["a", "b", "c"]);
        assert!(read("").is_empty());
        assert!(read(" , ").is_empty());
    }

    #[test]
    fn claim_is_idempotent() {
        assert_eq!(claim("", "a"), "a");
        assert_eq!(claim("a", "b"), "a,b");
        assert_eq!(claim("a,b", "a"), "a,b");
        assert_eq!(claim(claim("a", "b").as_str(), "b"), "a,b");
    }

    #[test]
    fn release_removes_only_the_named_owner() {
        assert_eq!(release("a,b", "a"), "b");
        assert_eq!(release("a,b", "c"), "a,b");
        assert_eq!(release("a", "a"), "");
        // Duplicate entries are cleared in one pass.
        assert_eq!(release("a,b,a", "a"), "b");
    }

    #[test]
    fn sole_ownership_checks() {
        assert!(is_sole_owner("a", "a"));
        assert!(is_sole_owner("a,a", "a"));
        assert!(!is_sole_owner("a,b", "a"));
        assert!(!is_sole_owner("", "a"));
    }
}
