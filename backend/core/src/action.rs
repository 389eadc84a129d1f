use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A state-mutating action, as dispatched to the store and relayed over the bridge.
///
/// Wire shape: `{ "type": ..., "payload": ..., "meta": { "originId": ..., "fromBridge": ... } }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    #[serde(rename = "type")]
    pub action_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub meta: ActionMeta,
}

/// Provenance attached to an action.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionMeta {
    /// Process instance that first forwarded the action.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_id: Option<String>,
    /// Set on the receiving side; such actions are never forwarded again.
    #[serde(default)]
    pub from_bridge: bool,
}

impl Action {
    pub fn new(action_type: impl Into<String>, payload: Value) -> Self {
        Self {
            action_type: action_type.into(),
            payload,
            meta: ActionMeta::default(),
        }
    }

    pub fn is_from_bridge(&self) -> bool {
        self.meta.from_bridge
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_action_wire_shape() {
        let mut action = Action::new("SET_PROFILE", json!({"id": "p1"}));
        action.meta.origin_id = Some("host-1".into());
        let wire = serde_json::to_value(&action).unwrap();
        assert_eq!(
            wire,
            json!({
                "type": "SET_PROFILE",
                "payload": {"id": "p1"},
                "meta": {"originId": "host-1", "fromBridge": false}
            })
        );
    }

    #[test]
    fn test_action_missing_meta_defaults() {
        let action: Action = serde_json::from_str(r#"{"type":"PING"}"#).unwrap();
        assert_eq!(action.action_type, "PING");
        assert_eq!(action.payload, Value::Null);
        assert!(!action.is_from_bridge());
        assert!(action.meta.origin_id.is_none());
    }
}
