//! Package policies checked before any install or removal touches the disk.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::ProjectConfig;
use crate::error::ConstraintViolation;
use crate::manifest::Manifest;

/// Id of the package that installs this tool into a project.
pub const MANAGER_PACKAGE_ID: &str = "com.pkgrepo.manager";

#[derive(Debug, Clone, PartialEq)]
pub struct ConstraintRules {
    protected: BTreeSet<String>,
    exclusive: Vec<(String, String)>,
    requires: BTreeMap<String, String>,
}

impl Default for ConstraintRules {
    fn default() -> Self {
        Self {
            protected: BTreeSet::from([MANAGER_PACKAGE_ID.to_string()]),
            exclusive: Vec::new(),
            requires: BTreeMap::new(),
        }
    }
}

impl ConstraintRules {
    /// Built-in rules extended with the project's declarations.
    ///
    /// Declarations whose base requirements loop back on themselves are rejected.
    pub fn from_project_config(config: &ProjectConfig) -> Result<Self, ConstraintViolation> {
        let mut rules = Self::default();
        for id in &config.protected {
            rules = rules.protect(id);
        }
        for (a, b) in &config.exclusive {
            rules = rules.mutually_exclusive(a, b);
        }
        for (package, base) in &config.requires {
            rules = rules.require(package, base);
        }
        rules.check_requirements()?;
        Ok(rules)
    }

    pub fn protect(mut self, id: &str) -> Self {
        self.protected.insert(id.to_string());
        self
    }

    pub fn mutually_exclusive(mut self, a: &str, b: &str) -> Self {
        self.exclusive.push((a.to_string(), b.to_string()));
        self
    }

    pub fn require(mut self, package: &str, base: &str) -> Self {
        self.requires.insert(package.to_string(), base.to_string());
        self
    }

    pub fn is_protected(&self, id: &str) -> bool {
        self.protected.contains(id)
    }

    /// Partners of `id` in mutual-exclusion declarations.
    fn exclusive_partners<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.exclusive.iter().filter_map(move |(a, b)| {
            if a == id {
                Some(b.as_str())
            } else if b == id {
                Some(a.as_str())
            } else {
                None
            }
        })
    }

    /// Key of the lock that serializes work on `id`.
    ///
    /// Packages linked by mutual exclusion share one key, the smallest id of
    /// the group, so their exclusion checks and installs never interleave.
    pub fn lock_key(&self, id: &str) -> String {
        let mut group = BTreeSet::from([id]);
        let mut pending = vec![id];
        while let Some(current) = pending.pop() {
            for partner in self.exclusive_partners(current) {
                if group.insert(partner) {
                    pending.push(partner);
                }
            }
        }
        group.first().copied().unwrap_or(id).to_string()
    }

    /// Reject base requirements that form a cycle between lock keys.
    ///
    /// An install holds its package's lock while installing the base, so a
    /// cycle here could leave two concurrent installs waiting on each other.
    pub fn check_requirements(&self) -> Result<(), ConstraintViolation> {
        let mut edges: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        for (package, base) in &self.requires {
            let (from, to) = (self.lock_key(package), self.lock_key(base));
            if from != to {
                edges.entry(from).or_default().insert(to);
            }
        }

        let mut finished = BTreeSet::new();
        for start in edges.keys() {
            let mut path = Vec::new();
            if let Some(cycle) = find_cycle(&edges, start, &mut path, &mut finished) {
                return Err(ConstraintViolation::CircularRequirement { packages: cycle });
            }
        }
        Ok(())
    }

    /// Reject installing `id` while one of its exclusive partners is installed.
    pub fn check_install(&self, id: &str, manifest: &Manifest) -> Result<(), ConstraintViolation> {
        match self
            .exclusive_partners(id)
            .find(|partner| manifest.is_installed(partner))
        {
            Some(partner) => Err(ConstraintViolation::MutuallyExclusive {
                package: id.to_string(),
                conflicts_with: partner.to_string(),
            }),
            None => Ok(()),
        }
    }

    /// Base package `id` declares, installed or not.
    pub fn required_base(&self, id: &str) -> Option<&str> {
        self.requires.get(id).map(String::as_str)
    }

    /// Base package that must be installed before `id`.
    pub fn missing_base(&self, id: &str, manifest: &Manifest) -> Option<&str> {
        self.required_base(id)
            .filter(|base| !manifest.is_installed(base))
    }

    /// Reject removing a protected package or one another package depends on.
    pub fn check_remove(&self, id: &str, manifest: &Manifest) -> Result<(), ConstraintViolation> {
        if self.is_protected(id) {
            return Err(ConstraintViolation::Protected {
                package: id.to_string(),
            });
        }
        let dependents = manifest.dependents_of(id);
        if !dependents.is_empty() {
            return Err(ConstraintViolation::RequiredBy {
                package: id.to_string(),
                dependents,
            });
        }
        Ok(())
    }
}

/// Depth-first search from `node`, returning the first cycle found as a closed path.
fn find_cycle(
    edges: &BTreeMap<String, BTreeSet<String>>,
    node: &str,
    path: &mut Vec<String>,
    finished: &mut BTreeSet<String>,
) -> Option<Vec<String>> {
    if finished.contains(node) {
        return None;
    }
    if let Some(start) = path.iter().position(|p| p == node) {
        let mut cycle = path[start..].to_vec();
        cycle.push(node.to_string());
        return Some(cycle);
    }
    path.push(node.to_string());
    for next in edges.get(node).into_iter().flatten() {
        if let Some(cycle) = find_cycle(edges, next, path, finished) {
            return Some(cycle);
        }
    }
    path.pop();
    finished.insert(node.to_string());
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn manifest_with(entries: &[(&str, Vec<&str>)]) -> Manifest {
        let mut manifest = Manifest::default();
        for (id, deps) in entries {
            let deps = deps
                .iter()
                .map(|d| (d.to_string(), "1.0.0".to_string()))
                .collect::<BTreeMap<_, _>>();
            manifest.add_or_update(id, "1.0.0", Some(deps));
        }
        manifest
    }

    #[test]
    fn test_manager_is_protected_by_default() {
        let rules = ConstraintRules::default();
        let manifest = manifest_with(&[(MANAGER_PACKAGE_ID, vec![])]);

        assert_eq!(
            rules.check_remove(MANAGER_PACKAGE_ID, &manifest),
            Err(ConstraintViolation::Protected {
                package: MANAGER_PACKAGE_ID.into()
            })
        );
    }

    #[test]
    fn test_mutual_exclusion_either_direction() {
        let rules = ConstraintRules::default().mutually_exclusive("variant-x", "variant-y");
        let with_y = manifest_with(&[("variant-y", vec![])]);
        let with_x = manifest_with(&[("variant-x", vec![])]);

        assert_eq!(
            rules.check_install("variant-x", &with_y),
            Err(ConstraintViolation::MutuallyExclusive {
                package: "variant-x".into(),
                conflicts_with: "variant-y".into(),
            })
        );
        assert!(rules.check_install("variant-y", &with_x).is_err());
        assert!(rules.check_install("variant-x", &Manifest::default()).is_ok());
        assert!(rules.check_install("unrelated", &with_y).is_ok());
    }

    #[test]
    fn test_guarded_removal_reports_dependents() {
        let rules = ConstraintRules::default();
        let manifest = manifest_with(&[("c", vec![]), ("d", vec!["c"]), ("e", vec!["c"])]);

        assert_eq!(
            rules.check_remove("c", &manifest),
            Err(ConstraintViolation::RequiredBy {
                package: "c".into(),
                dependents: vec!["d".into(), "e".into()],
            })
        );
        assert!(rules.check_remove("d", &manifest).is_ok());
    }

    #[test]
    fn test_missing_base() {
        let rules = ConstraintRules::default().require("addon", "base");

        assert_eq!(rules.missing_base("addon", &Manifest::default()), Some("base"));
        assert_eq!(
            rules.missing_base("addon", &manifest_with(&[("base", vec![])])),
            None
        );
        assert_eq!(rules.required_base("addon"), Some("base"));
        assert_eq!(rules.missing_base("base", &Manifest::default()), None);
    }

    #[test]
    fn test_from_project_config() {
        let config = ProjectConfig {
            protected: vec!["com.core".into()],
            exclusive: vec![("a".into(), "b".into())],
            requires: BTreeMap::from([("addon".into(), "base".into())]),
        };
        let rules = ConstraintRules::from_project_config(&config).unwrap();

        assert!(rules.is_protected("com.core"));
        assert!(rules.is_protected(MANAGER_PACKAGE_ID));
        assert!(rules.check_install("a", &manifest_with(&[("b", vec![])])).is_err());
        assert_eq!(rules.required_base("addon"), Some("base"));
    }

    #[test]
    fn test_exclusive_group_shares_lock_key() {
        let rules = ConstraintRules::default()
            .mutually_exclusive("variant-y", "variant-x")
            .mutually_exclusive("variant-z", "variant-y");

        assert_eq!(rules.lock_key("variant-x"), "variant-x");
        assert_eq!(rules.lock_key("variant-y"), "variant-x");
        assert_eq!(rules.lock_key("variant-z"), "variant-x");
        assert_eq!(rules.lock_key("unrelated"), "unrelated");
    }

    #[test]
    fn test_circular_requirements_are_rejected() {
        let config = ProjectConfig {
            requires: BTreeMap::from([("a".into(), "b".into()), ("b".into(), "a".into())]),
            ..Default::default()
        };
        assert_eq!(
            ConstraintRules::from_project_config(&config),
            Err(ConstraintViolation::CircularRequirement {
                packages: vec!["a".into(), "b".into(), "a".into()],
            })
        );

        // The loop closes through an exclusion group: c shares a's lock
        let through_group = ConstraintRules::default()
            .mutually_exclusive("a", "c")
            .require("a", "b")
            .require("b", "c");
        assert!(matches!(
            through_group.check_requirements(),
            Err(ConstraintViolation::CircularRequirement { .. })
        ));

        let chain = ConstraintRules::default().require("a", "b").require("b", "c");
        assert!(chain.check_requirements().is_ok());
    }
}
