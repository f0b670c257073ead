//! Version ordering, stability classification and selection.
//!
//! Versions are dot-separated numeric components, optionally followed by a
//! pre-release suffix after `-`. Ordering only looks at the numeric base;
//! among equal bases a stable version outranks a pre-release.

use std::cmp::Ordering;

use crate::repository::{Package, PackageVersion};

const UNSTABLE_MARKERS: &[&str] = &[
    "alpha", "beta", "rc", "preview", "pre", "dev", "nightly", "snapshot",
];

/// Anything carrying a published version string.
pub trait Versioned {
    fn version_str(&self) -> &str;
}

impl Versioned for PackageVersion {
    fn version_str(&self) -> &str {
        &self.version
    }
}

/// Version resolver - pure functions for version comparison and selection.
///
/// All methods are stateless.
pub struct VersionResolver;

impl VersionResolver {
    /// Compare two versions component by component, zero-padding the shorter one.
    ///
    /// A version with a non-numeric component is not a strict version and
    /// sorts below every strict one; two such versions compare as strings.
    pub fn compare_versions(a: &str, b: &str) -> Ordering {
        match (parse_components(a), parse_components(b)) {
            (Some(a), Some(b)) => {
                let len = a.len().max(b.len());
                (0..len)
                    .map(|i| {
                        let x = a.get(i).copied().unwrap_or(0);
                        let y = b.get(i).copied().unwrap_or(0);
                        x.cmp(&y)
                    })
                    .find(|o| o.is_ne())
                    .unwrap_or(Ordering::Equal)
            }
            (Some(_), None) => Ordering::Greater,
            (None, Some(_)) => Ordering::Less,
            (None, None) => a.cmp(b),
        }
    }

    /// A version is stable when it has no pre-release marker and every
    /// component is a non-negative integer.
    pub fn is_stable(version: &str) -> bool {
        let lower = version.to_ascii_lowercase();
        if lower.contains('-') || UNSTABLE_MARKERS.iter().any(|m| lower.contains(m)) {
            return false;
        }
        parse_components(version).is_some()
    }

    /// The version with any `-suffix` (and `+build` metadata) removed.
    pub fn base_version(version: &str) -> &str {
        let end = version.find(['-', '+']).unwrap_or(version.len());
        &version[..end]
    }

    /// Compare base versions, then prefer the stable one.
    pub fn compare_for_selection(a: &str, b: &str) -> Ordering {
        Self::compare_versions(Self::base_version(a), Self::base_version(b))
            .then_with(|| Self::is_stable(a).cmp(&Self::is_stable(b)))
            .then_with(|| Self::compare_prerelease(a, b))
            .then_with(|| a.cmp(b))
    }

    /// Compare the `-suffix` of two versions the way semver orders pre-release
    /// identifiers: numeric identifiers by value and below alphanumeric ones,
    /// and a shorter identifier list below a longer one it prefixes.
    pub fn compare_prerelease(a: &str, b: &str) -> Ordering {
        let mut a = prerelease(a).split('.');
        let mut b = prerelease(b).split('.');
        loop {
            let ordering = match (a.next(), b.next()) {
                (None, None) => return Ordering::Equal,
                (None, Some(_)) => Ordering::Less,
                (Some(_), None) => Ordering::Greater,
                (Some(x), Some(y)) => match (x.parse::<u64>(), y.parse::<u64>()) {
                    (Ok(x), Ok(y)) => x.cmp(&y),
                    (Ok(_), Err(_)) => Ordering::Less,
                    (Err(_), Ok(_)) => Ordering::Greater,
                    (Err(_), Err(_)) => x.cmp(y),
                },
            };
            if ordering.is_ne() {
                return ordering;
            }
        }
    }

    /// Highest version, optionally skipping pre-releases.
    pub fn latest<'a, T, I>(versions: I, include_unstable: bool) -> Option<&'a T>
    where
        T: Versioned + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        versions
            .into_iter()
            .filter(|v| include_unstable || Self::is_stable(v.version_str()))
            .max_by(|a, b| Self::compare_for_selection(a.version_str(), b.version_str()))
    }

    /// Highest version whose base is strictly above `current`'s base.
    pub fn latest_newer<'a, T, I>(
        versions: I,
        current: &str,
        include_unstable: bool,
    ) -> Option<&'a T>
    where
        T: Versioned + 'a,
        I: IntoIterator<Item = &'a T>,
    {
        let current_base = Self::base_version(current);
        Self::latest(
            versions.into_iter().filter(|v| {
                Self::compare_versions(Self::base_version(v.version_str()), current_base)
                    .is_gt()
            }),
            include_unstable,
        )
    }

    pub fn get_latest_version(package: &Package, include_unstable: bool) -> Option<&PackageVersion> {
        Self::latest(package.versions.values(), include_unstable)
    }

    pub fn get_latest_newer_version<'a>(
        package: &'a Package,
        current: &str,
        include_unstable: bool,
    ) -> Option<&'a PackageVersion> {
        Self::latest_newer(package.versions.values(), current, include_unstable)
    }
}

/// Text between the first `-` and any `+build` metadata.
fn prerelease(version: &str) -> &str {
    let Some(start) = version.find('-') else {
        return "";
    };
    let suffix = &version[start + 1..];
    suffix.split('+').next().unwrap_or(suffix)
}

fn parse_components(version: &str) -> Option<Vec<u64>> {
    version
        .split('.')
        .map(|part| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                None
            } else {
                part.parse::<u64>().ok()
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn package(versions: &[&str]) -> Package {
        Package {
            id: "com.example.tool".into(),
            versions: versions
                .iter()
                .map(|v| {
                    (
                        v.to_string(),
                        PackageVersion {
                            name: "com.example.tool".into(),
                            version: v.to_string(),
                            ..Default::default()
                        },
                    )
                })
                .collect::<BTreeMap<_, _>>(),
        }
    }

    fn latest(versions: &[&str], include_unstable: bool) -> Option<String> {
        VersionResolver::get_latest_version(&package(versions), include_unstable)
            .map(|v| v.version.clone())
    }

    fn newer(versions: &[&str], current: &str, include_unstable: bool) -> Option<String> {
        VersionResolver::get_latest_newer_version(&package(versions), current, include_unstable)
            .map(|v| v.version.clone())
    }

    #[test]
    fn test_compare_numeric_components() {
        assert_eq!(
            VersionResolver::compare_versions("1.10.0", "1.9.0"),
            Ordering::Greater
        );
        assert_eq!(
            VersionResolver::compare_versions("1.2", "1.2.0"),
            Ordering::Equal
        );
        assert_eq!(
            VersionResolver::compare_versions("1.2", "1.2.1"),
            Ordering::Less
        );
        assert_eq!(
            VersionResolver::compare_versions("2.0.0", "10.0.0"),
            Ordering::Less
        );
    }

    #[test]
    fn test_compare_unparsable_sorts_below() {
        assert_eq!(
            VersionResolver::compare_versions("latest", "0.0.1"),
            Ordering::Less
        );
        assert_eq!(
            VersionResolver::compare_versions("1.0.0", "1.x"),
            Ordering::Greater
        );
        assert_eq!(VersionResolver::compare_versions("abc", "abd"), Ordering::Less);
    }

    #[test]
    fn test_is_stable() {
        assert!(VersionResolver::is_stable("1.2.3"));
        assert!(VersionResolver::is_stable("10"));
        assert!(!VersionResolver::is_stable("1.2.3-beta.1"));
        assert!(!VersionResolver::is_stable("1.2.3-rc1"));
        assert!(!VersionResolver::is_stable("1.2.3RC1"));
        assert!(!VersionResolver::is_stable("1.2.3.Preview"));
        assert!(!VersionResolver::is_stable("2.0.0-SNAPSHOT"));
        assert!(!VersionResolver::is_stable("1..2"));
        assert!(!VersionResolver::is_stable(""));
    }

    #[test]
    fn test_base_version() {
        assert_eq!(VersionResolver::base_version("1.2.3-beta.1"), "1.2.3");
        assert_eq!(VersionResolver::base_version("1.2.3+build.5"), "1.2.3");
        assert_eq!(VersionResolver::base_version("1.2.3"), "1.2.3");
    }

    #[test]
    fn test_stable_outranks_prerelease_of_same_base() {
        assert_eq!(
            VersionResolver::compare_for_selection("1.2.3", "1.2.3-beta.1"),
            Ordering::Greater
        );
        assert_eq!(latest(&["1.2.3-beta.1", "1.2.3"], true).as_deref(), Some("1.2.3"));
    }

    #[test]
    fn test_prerelease_identifiers_compare_numerically() {
        let cmp = VersionResolver::compare_for_selection;
        assert_eq!(cmp("1.2.3-beta.10", "1.2.3-beta.2"), Ordering::Greater);
        assert_eq!(cmp("1.2.3-beta.2", "1.2.3-beta.2"), Ordering::Equal);
        assert_eq!(cmp("1.2.3-beta", "1.2.3-beta.1"), Ordering::Less);
        assert_eq!(cmp("1.2.3-alpha.5", "1.2.3-beta.1"), Ordering::Less);
        assert_eq!(cmp("1.2.3-rc.1", "1.2.3-1"), Ordering::Greater);

        let published = ["1.2.3-beta.2", "1.2.3-beta.10", "1.2.3-beta.9"];
        let versions: BTreeMap<String, PackageVersion> = published
            .into_iter()
            .map(|v| {
                let version = PackageVersion {
                    version: v.into(),
                    ..Default::default()
                };
                (v.to_string(), version)
            })
            .collect();
        let latest = VersionResolver::latest(versions.values(), true).unwrap();
        assert_eq!(latest.version, "1.2.3-beta.10");
    }

    #[test]
    fn test_get_latest_version_respects_stability() {
        let versions = ["1.0.0", "1.1.0-beta.1"];
        assert_eq!(latest(&versions, false).as_deref(), Some("1.0.0"));
        assert_eq!(latest(&versions, true).as_deref(), Some("1.1.0-beta.1"));
        assert_eq!(latest(&["2.0.0-rc.1"], false), None);
        assert_eq!(latest(&[], true), None);
    }

    #[test]
    fn test_get_latest_version_is_numeric_not_lexicographic() {
        assert_eq!(
            latest(&["1.9.0", "1.10.0", "1.2.0"], false).as_deref(),
            Some("1.10.0")
        );
    }

    #[test]
    fn test_get_latest_newer_version() {
        let versions = ["1.0.0", "1.1.0"];
        assert_eq!(newer(&versions, "1.0.0", false).as_deref(), Some("1.1.0"));
        assert_eq!(newer(&versions, "1.1.0", false), None);
        assert_eq!(newer(&versions, "2.0.0", true), None);
    }

    #[test]
    fn test_get_latest_newer_version_compares_bases() {
        // Same base as the installed pre-release is not an update
        assert_eq!(newer(&["1.1.0"], "1.1.0-beta.2", false), None);
        assert_eq!(
            newer(&["1.1.0", "1.2.0-beta.1"], "1.1.0-beta.2", true).as_deref(),
            Some("1.2.0-beta.1")
        );
    }
}
