use std::collections::{BTreeSet, HashMap};

use crate::config::AliasGroup;
use crate::model::Ecosystem;

/// Symmetric name equivalences, scoped per ecosystem.
///
/// `openssl`, `libssl3` and `libssl1.1` in one group means a record filed
/// under any of them is a candidate for a package named like any other.
/// Groups sharing a name within an ecosystem are merged.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    groups: Vec<BTreeSet<String>>,
    index: HashMap<(Ecosystem, String), usize>,
}

impl AliasTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_groups(groups: &[AliasGroup]) -> Self {
        let mut table = Self::new();
        for group in groups {
            table.add_group(group.ecosystem, group.names.iter().map(String::as_str));
        }
        table
    }

    pub fn add_group<'a>(&mut self, ecosystem: Ecosystem, names: impl IntoIterator<Item = &'a str>) {
        let members: BTreeSet<String> = names.into_iter().map(normalize).collect();
        if members.len() < 2 {
            return;
        }
        let mut touched: Vec<usize> = members
            .iter()
            .filter_map(|name| self.index.get(&(ecosystem, name.clone())).copied())
            .collect();
        touched.sort_unstable();
        touched.dedup();

        let id = match touched.first() {
            Some(&first) => first,
            None => {
                self.groups.push(BTreeSet::new());
                self.groups.len() - 1
            }
        };
        let mut merged = members;
        for other in &touched {
            merged.append(&mut self.groups[*other]);
        }
        for name in &merged {
            self.index.insert((ecosystem, name.clone()), id);
        }
        self.groups[id] = merged;
    }

    pub fn is_empty(&self) -> bool {
        self.groups.iter().all(BTreeSet::is_empty)
    }

    /// Every other name `name` is known by, in sorted order.
    pub fn aliases_of(&self, ecosystem: Ecosystem, name: &str) -> Vec<String> {
        let name = normalize(name);
        let Some(id) = self.index.get(&(ecosystem, name.clone())) else {
            return Vec::new();
        };
        self.groups[*id]
            .iter()
            .filter(|alias| **alias != name)
            .cloned()
            .collect()
    }
}

pub(crate) fn normalize(name: &str) -> String {
    name.trim().to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aliases_are_symmetric() {
        let mut table = AliasTable::new();
        table.add_group(Ecosystem::Debian, ["openssl", "libssl3", "libssl1.1"]);

        assert_eq!(table.aliases_of(Ecosystem::Debian, "libssl3"), vec!["libssl1.1", "openssl"]);
        assert_eq!(table.aliases_of(Ecosystem::Debian, "OpenSSL"), vec!["libssl1.1", "libssl3"]);
        assert!(table.aliases_of(Ecosystem::Npm, "openssl").is_empty());
        assert!(table.aliases_of(Ecosystem::Debian, "bash").is_empty());
    }

    #[test]
    fn test_overlapping_groups_merge() {
        let table = AliasTable::from_groups(&[
            AliasGroup {
                ecosystem: Ecosystem::Debian,
                names: vec!["zlib".to_string(), "zlib1g".to_string()],
            },
            AliasGroup {
                ecosystem: Ecosystem::Debian,
                names: vec!["zlib1g".to_string(), "zlib1g-dev".to_string()],
            },
        ]);
        assert_eq!(table.aliases_of(Ecosystem::Debian, "zlib1g"), vec!["zlib", "zlib1g-dev"]);
        assert_eq!(table.aliases_of(Ecosystem::Debian, "zlib"), vec!["zlib1g", "zlib1g-dev"]);
        assert_eq!(table.aliases_of(Ecosystem::Debian, "zlib1g-dev"), vec!["zlib", "zlib1g"]);
    }

    #[test]
    fn test_group_bridging_two_groups_merges_both() {
        let mut table = AliasTable::new();
        table.add_group(Ecosystem::Debian, ["openssl", "libssl3"]);
        table.add_group(Ecosystem::Debian, ["libcrypto3", "libcrypto"]);
        table.add_group(Ecosystem::Npm, ["libssl3", "node-libssl"]);
        table.add_group(Ecosystem::Debian, ["libssl3", "libcrypto3"]);

        assert_eq!(
            table.aliases_of(Ecosystem::Debian, "openssl"),
            vec!["libcrypto", "libcrypto3", "libssl3"]
        );
        assert_eq!(table.aliases_of(Ecosystem::Npm, "libssl3"), vec!["node-libssl"]);
    }

    #[test]
    fn test_single_name_group_ignored() {
        let mut table = AliasTable::new();
        table.add_group(Ecosystem::Npm, ["lodash"]);
        assert!(table.is_empty());
    }
}
