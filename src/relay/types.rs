//! JSON messages exchanged with the relay backend
//!
//! Every message is an object discriminated by `type`. `msgId` is assigned
//! by the backend and echoed back untouched, whatever JSON value it is.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Command pushed by the backend
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum InboundCommand {
    /// Launch the peripheral provisioning subsystem
    #[serde(rename = "start_provisioning")]
    StartProvisioning,

    /// Stop it again
    #[serde(rename = "stop_provisioning")]
    StopProvisioning,

    /// Switch one sprinkler zone on a peripheral
    #[serde(rename = "sprinklerCmd", rename_all = "camelCase")]
    SprinklerCommand {
        lan_name: String,
        zone: u8,
        on: bool,
        key: String,
        msg_id: Value,
    },

    /// Health check a peripheral
    #[serde(rename = "pingEsp", rename_all = "camelCase")]
    PingPeripheral { lan_name: String, msg_id: Value },

    /// Health check this gateway
    #[serde(rename = "pingPi", rename_all = "camelCase")]
    PingSelf { msg_id: Value },
}

impl InboundCommand {
    pub fn parse(text: &str) -> anyhow::Result<Self> {
        serde_json::from_str(text).map_err(|e| anyhow::anyhow!("Invalid command: {}", e))
    }
}

/// Message sent to the backend
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    #[serde(rename = "register", rename_all = "camelCase")]
    Register { homebase_id: String },

    #[serde(rename = "sprinklerAck", rename_all = "camelCase")]
    SprinklerAck { msg_id: Value, success: bool },

    #[serde(rename = "pongEsp", rename_all = "camelCase")]
    PongPeripheral {
        lan_name: String,
        online: bool,
        msg_id: Value,
    },

    #[serde(rename = "pongPi", rename_all = "camelCase")]
    PongSelf { msg_id: Value },
}

impl OutboundMessage {
    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn as_value(msg: &OutboundMessage) -> Value {
        serde_json::from_str(&msg.to_json().unwrap()).unwrap()
    }

    #[test]
    fn test_parse_sprinkler_command() {
        let cmd = InboundCommand::parse(
            r#"{"type":"sprinklerCmd","lanName":"esp32-ab12.local","zone":2,"on":true,"key":"123456","msgId":"m1"}"#,
        )
        .unwrap();

        assert_eq!(
            cmd,
            InboundCommand::SprinklerCommand {
                lan_name: "esp32-ab12.local".to_string(),
                zone: 2,
                on: true,
                key: "123456".to_string(),
                msg_id: json!("m1"),
            }
        );
    }

    #[test]
    fn test_parse_provisioning_commands() {
        assert_eq!(
            InboundCommand::parse(r#"{"type":"start_provisioning"}"#).unwrap(),
            InboundCommand::StartProvisioning
        );
        assert_eq!(
            InboundCommand::parse(r#"{"type":"stop_provisioning"}"#).unwrap(),
            InboundCommand::StopProvisioning
        );
    }

    #[test]
    fn test_msg_id_is_kept_verbatim() {
        let cmd = InboundCommand::parse(r#"{"type":"pingPi","msgId":{"seq":17,"tag":"x"}}"#).unwrap();
        let InboundCommand::PingSelf { msg_id } = cmd else {
            panic!("Expected PingSelf");
        };

        let reply = OutboundMessage::PongSelf { msg_id };
        assert_eq!(
            as_value(&reply),
            json!({"type": "pongPi", "msgId": {"seq": 17, "tag": "x"}})
        );
    }

    #[test]
    fn test_rejects_malformed_commands() {
        assert!(InboundCommand::parse("not json").is_err());
        assert!(InboundCommand::parse(r#"{"type":"reboot"}"#).is_err());
        assert!(InboundCommand::parse(r#"{"lanName":"x","msgId":"m"}"#).is_err());
        // missing msgId
        assert!(InboundCommand::parse(r#"{"type":"pingEsp","lanName":"x"}"#).is_err());
        // zone must be a number
        assert!(InboundCommand::parse(
            r#"{"type":"sprinklerCmd","lanName":"x","zone":"two","on":true,"key":"k","msgId":"m"}"#
        )
        .is_err());
    }

    #[test]
    fn test_outbound_wire_shapes() {
        assert_eq!(
            as_value(&OutboundMessage::Register {
                homebase_id: "hb-1".to_string()
            }),
            json!({"type": "register", "homebaseId": "hb-1"})
        );
        assert_eq!(
            as_value(&OutboundMessage::SprinklerAck {
                msg_id: json!("m1"),
                success: true
            }),
            json!({"type": "sprinklerAck", "msgId": "m1", "success": true})
        );
        assert_eq!(
            as_value(&OutboundMessage::PongPeripheral {
                lan_name: "y".to_string(),
                online: false,
                msg_id: json!("m2")
            }),
            json!({"type": "pongEsp", "lanName": "y", "online": false, "msgId": "m2"})
        );
    }
}
