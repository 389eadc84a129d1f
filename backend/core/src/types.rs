use std::borrow::Borrow;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Unique namespace of a loaded extension.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExtensionId(String);

impl ExtensionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ExtensionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ExtensionId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for ExtensionId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl Borrow<str> for ExtensionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ExtensionId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Ordered list of keys addressing a sub-tree of the application state.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatePath(Vec<String>);

impl StatePath {
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parse a dotted path such as `settings.profiles`.
    pub fn parse(dotted: &str) -> Self {
        Self::new(dotted.split('.'))
    }

    pub fn segments(&self) -> &[String] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when `self` equals `other` or addresses one of its ancestors.
    pub fn is_prefix_of(&self, other: &StatePath) -> bool {
        self.0.len() <= other.0.len() && self.0.iter().zip(&other.0).all(|(a, b)| a == b)
    }

    /// Look up the sub-tree at this path, if every segment exists.
    pub fn select<'a>(&self, state: &'a serde_json::Value) -> Option<&'a serde_json::Value> {
        self.0.iter().try_fold(state, |node, key| node.get(key))
    }
}

impl fmt::Display for StatePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("."))
    }
}

/// Which side of the process boundary this runtime instance lives on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessRole {
    /// Owns the authoritative store and runs `once_main` callbacks.
    #[default]
    Host,
    /// A front-end process mirroring host state over the bridge.
    Frontend,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessRole::Host => f.write_str("host"),
            ProcessRole::Frontend => f.write_str("frontend"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_path_prefix() {
        let settings = StatePath::parse("settings");
        let profiles = StatePath::parse("settings.profiles");
        assert!(settings.is_prefix_of(&profiles));
        assert!(profiles.is_prefix_of(&profiles));
        assert!(!profiles.is_prefix_of(&settings));
        assert!(!StatePath::parse("session").is_prefix_of(&profiles));
    }

    #[test]
    fn test_state_path_select() {
        let state = json!({"settings": {"profiles": {"active": "p1"}}});
        let path = StatePath::new(["settings", "profiles"]);
        assert_eq!(path.select(&state), Some(&json!({"active": "p1"})));
        assert_eq!(StatePath::parse("settings.missing").select(&state), None);
        assert_eq!(path.to_string(), "settings.profiles");
    }

    #[test]
    fn test_role_serialization() {
        assert_eq!(serde_json::to_value(ProcessRole::Frontend).unwrap(), json!("frontend"));
        let role: ProcessRole = serde_json::from_value(json!("host")).unwrap();
        assert_eq!(role, ProcessRole::Host);
    }
}
