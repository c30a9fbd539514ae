//! Sync modules and type classification tables.

use crate::error::ProtocolError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

/// A named group of item types replicated as a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncModule {
    /// Notes, folders, tags and note resources.
    Notes,
    /// Bookmarks and bookmark folders.
    Bookmarks,
    /// Password vault entries and folders.
    Vault,
    /// Diagrams.
    Diagrams,
    /// Todo items.
    Todos,
    /// AI assistant configuration and conversations.
    Ai,
}

impl SyncModule {
    /// Every module, in display order.
    pub const ALL: [SyncModule; 6] = [
        SyncModule::Notes,
        SyncModule::Bookmarks,
        SyncModule::Vault,
        SyncModule::Diagrams,
        SyncModule::Todos,
        SyncModule::Ai,
    ];

    /// Item types belonging to this module.
    pub fn item_types(&self) -> &'static [&'static str] {
        match self {
            SyncModule::Notes => &["note", "folder", "tag", "resource"],
            SyncModule::Bookmarks => &["bookmark", "bookmark_folder"],
            SyncModule::Vault => &["vault_entry", "vault_folder"],
            SyncModule::Diagrams => &["diagram"],
            SyncModule::Todos => &["todo"],
            SyncModule::Ai => &["ai_config", "ai_conversation", "ai_message"],
        }
    }

    /// The module an item type belongs to, if any.
    pub fn for_type(item_type: &str) -> Option<SyncModule> {
        Self::ALL
            .into_iter()
            .find(|module| module.item_types().contains(&item_type))
    }

    /// Lowercase wire name.
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncModule::Notes => "notes",
            SyncModule::Bookmarks => "bookmarks",
            SyncModule::Vault => "vault",
            SyncModule::Diagrams => "diagrams",
            SyncModule::Todos => "todos",
            SyncModule::Ai => "ai",
        }
    }
}

impl fmt::Display for SyncModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SyncModule {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|module| module.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownModule(s.to_string()))
    }
}

/// The set of modules enabled for replication.
///
/// Types that belong to no module are never replicated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ModuleSet(BTreeSet<SyncModule>);

impl ModuleSet {
    /// All modules enabled.
    pub fn all() -> Self {
        Self(SyncModule::ALL.into_iter().collect())
    }

    /// No modules enabled.
    pub fn none() -> Self {
        Self(BTreeSet::new())
    }

    /// Returns true if `module` is enabled.
    pub fn contains(&self, module: SyncModule) -> bool {
        self.0.contains(&module)
    }

    /// Returns true if items of `item_type` are replicated.
    pub fn includes_type(&self, item_type: &str) -> bool {
        SyncModule::for_type(item_type).is_some_and(|module| self.contains(module))
    }

    /// Enables a module.
    pub fn insert(&mut self, module: SyncModule) {
        self.0.insert(module);
    }

    /// Disables a module.
    pub fn remove(&mut self, module: SyncModule) {
        self.0.remove(&module);
    }

    /// Iterates enabled modules in order.
    pub fn iter(&self) -> impl Iterator<Item = SyncModule> + '_ {
        self.0.iter().copied()
    }
}

impl Default for ModuleSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FromIterator<SyncModule> for ModuleSet {
    fn from_iter<I: IntoIterator<Item = SyncModule>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Item types that are always encrypted in transit, regardless of the
/// user's global encryption toggle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SensitiveTypes(HashSet<String>);

impl SensitiveTypes {
    /// An empty table.
    pub fn none() -> Self {
        Self(HashSet::new())
    }

    /// Returns true if `item_type` must always be encrypted.
    pub fn contains(&self, item_type: &str) -> bool {
        self.0.contains(item_type)
    }

    /// Adds a type to the table.
    pub fn insert(&mut self, item_type: impl Into<String>) {
        self.0.insert(item_type.into());
    }
}

impl Default for SensitiveTypes {
    fn default() -> Self {
        ["vault_entry", "vault_folder", "ai_config"]
            .into_iter()
            .collect()
    }
}

impl<S: Into<String>> FromIterator<S> for SensitiveTypes {
    fn from_iter<I: IntoIterator<Item = S>>(iter: I) -> Self {
        Self(iter.into_iter().map(Into::into).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn type_table() {
        assert_eq!(SyncModule::for_type("note"), Some(SyncModule::Notes));
        assert_eq!(SyncModule::for_type("resource"), Some(SyncModule::Notes));
        assert_eq!(SyncModule::for_type("vault_folder"), Some(SyncModule::Vault));
        assert_eq!(SyncModule::for_type("ai_message"), Some(SyncModule::Ai));
        assert_eq!(SyncModule::for_type("unknown"), None);
    }

    #[test]
    fn every_type_has_one_module() {
        let mut seen = HashSet::new();
        for module in SyncModule::ALL {
            for ty in module.item_types() {
                assert!(seen.insert(*ty), "{ty} listed twice");
            }
        }
    }

    #[test]
    fn module_set_filters_types() {
        let set: ModuleSet = [SyncModule::Notes, SyncModule::Todos].into_iter().collect();
        assert!(set.includes_type("note"));
        assert!(set.includes_type("todo"));
        assert!(!set.includes_type("bookmark"));
        assert!(!set.includes_type("mystery"));
        assert!(!ModuleSet::none().includes_type("note"));
    }

    #[test]
    fn module_names_parse() {
        for module in SyncModule::ALL {
            assert_eq!(module.as_str().parse::<SyncModule>().unwrap(), module);
        }
        assert!("photos".parse::<SyncModule>().is_err());
    }

    #[test]
    fn module_set_serializes_as_list() {
        let set: ModuleSet = [SyncModule::Vault, SyncModule::Ai].into_iter().collect();
        assert_eq!(serde_json::to_string(&set).unwrap(), r#"["vault","ai"]"#);
    }

    #[test]
    fn default_sensitive_types() {
        let table = SensitiveTypes::default();
        assert!(table.contains("vault_entry"));
        assert!(table.contains("ai_config"));
        assert!(!table.contains("note"));
        assert!(!SensitiveTypes::none().contains("vault_entry"));
    }
}
