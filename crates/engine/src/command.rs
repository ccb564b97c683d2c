use serde::{Deserialize, Serialize};

/// A request to transition one entity.
///
/// `id` doubles as the causation id of the event the command produces. When a
/// caller omits it on the wire a fresh UUID v4 is generated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    #[serde(default = "new_command_id")]
    pub id: String,
    pub entity_id: String,
    pub entity_type: String,
    #[serde(alias = "type")]
    pub command_type: String,
    #[serde(default = "empty_payload")]
    pub payload: serde_json::Value,
    pub requester: String,
}

fn new_command_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn empty_payload() -> serde_json::Value {
    serde_json::Value::Object(serde_json::Map::new())
}

impl Command {
    pub fn new(entity_type: &str, entity_id: &str, command_type: &str, requester: &str) -> Self {
        Self {
            id: new_command_id(),
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            command_type: command_type.to_string(),
            payload: empty_payload(),
            requester: requester.to_string(),
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// String field of the payload, if present and a string.
    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(|v| v.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn missing_id_and_payload_get_defaults() {
        let cmd: Command = serde_json::from_value(json!({
            "entity_id": "f1",
            "entity_type": "file",
            "type": "delete",
            "requester": "alice"
        }))
        .unwrap();
        assert_eq!(cmd.command_type, "delete");
        assert!(uuid::Uuid::parse_str(&cmd.id).is_ok());
        assert_eq!(cmd.payload, json!({}));
    }

    #[test]
    fn builder_helpers_set_fields() {
        let cmd = Command::new("file", "f1", "log", "bob")
            .with_id("c-7")
            .with_payload(json!({"action": "viewed"}));
        assert_eq!(cmd.id, "c-7");
        assert_eq!(cmd.payload_str("action"), Some("viewed"));
        assert_eq!(cmd.payload_str("detail"), None);
    }
}
