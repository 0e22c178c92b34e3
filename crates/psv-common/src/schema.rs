//! Plugin API versioning and compatibility.

/// Plugin API version implemented by this host.
///
/// Follows semver: MAJOR.MINOR.PATCH
/// - MAJOR: Breaking changes to the launch contract (environment, signals)
/// - MINOR: Additive changes (new optional environment variables)
/// - PATCH: Bug fixes, documentation
pub const PLUGIN_API_VERSION: &str = "1.0.0";

/// Check if a plugin's declared API version is compatible with the host.
///
/// Accepts an optional leading `^`, `~` or `=` so manifests can use the
/// usual constraint spelling; only the major component is compared.
pub fn is_compatible(version: &str) -> bool {
    let current_major = major_of(PLUGIN_API_VERSION);
    let other = version.trim().trim_start_matches(['^', '~', '=']);
    match (current_major, major_of(other)) {
        (Some(current), Some(other)) => current == other,
        _ => false,
    }
}

fn major_of(version: &str) -> Option<u32> {
    version.split('.').next().and_then(|s| s.parse::<u32>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_major_compatible() {
        assert!(is_compatible("1.0.0"));
        assert!(is_compatible("1.4.2"));
        assert!(is_compatible("^1.2"));
        assert!(is_compatible("1"));
    }

    #[test]
    fn test_different_major_incompatible() {
        assert!(!is_compatible("0.9.0"));
        assert!(!is_compatible("2.0.0"));
        assert!(!is_compatible("latest"));
        assert!(!is_compatible(""));
    }
}
