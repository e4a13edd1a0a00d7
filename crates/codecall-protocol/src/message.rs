//! Messages sent from the child back to the host.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ProtocolError;

/// Call completion message on the data channel (fd 3)
///
/// `present = false` means the requested function does not exist in the
/// target file. That is reported separately from a `null` return value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataMessage {
    pub present: bool,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub val: Value,
}

impl DataMessage {
    pub fn present(val: Value) -> Self {
        Self { present: true, val }
    }

    pub fn missing() -> Self {
        Self {
            present: false,
            val: Value::Null,
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::malformed("data", e))
    }

    /// The returned value, or `None` when the function was missing
    pub fn into_value(self) -> Option<Value> {
        self.present.then_some(self.val)
    }
}

/// Confirmation on the restart channel (fd 4) that control returned to the zygote
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartConfirmation {
    pub exited: bool,
}

impl RestartConfirmation {
    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::malformed("restart", e))
    }
}

/// Child channel a chunk of text arrived on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    Stdout,
    Stderr,
    Data,
    Restart,
}

impl Channel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Channel::Stdout => "stdout",
            Channel::Stderr => "stderr",
            Channel::Data => "data",
            Channel::Restart => "restart",
        }
    }
}

/// One relayed chunk, written as a line on the container's stdout
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub channel: Channel,
    pub text: String,
}

impl Envelope {
    pub fn new(channel: Channel, text: impl Into<String>) -> Self {
        Self {
            channel,
            text: text.into(),
        }
    }

    pub fn to_line(&self) -> Result<String, ProtocolError> {
        encode_line(self)
    }

    pub fn from_line(line: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(line.trim()).map_err(|e| ProtocolError::malformed("envelope", e))
    }
}

fn encode_line<T: Serialize>(msg: &T) -> Result<String, ProtocolError> {
    let mut json = serde_json::to_string(msg).map_err(ProtocolError::Encode)?;
    json.push('\n');
    Ok(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_data_message_present() {
        let msg = DataMessage::from_line(r#"{"present": true, "val": {"params": {"a": 7}}}"#)
            .unwrap();
        assert!(msg.present);
        assert_eq!(msg.into_value(), Some(json!({"params": {"a": 7}})));
    }

    #[test]
    fn test_data_message_present_null_is_not_missing() {
        let msg = DataMessage::from_line(r#"{"present": true, "val": null}"#).unwrap();
        assert_eq!(msg.into_value(), Some(Value::Null));

        let msg = DataMessage::from_line(r#"{"present": true}"#).unwrap();
        assert_eq!(msg.into_value(), Some(Value::Null));
    }

    #[test]
    fn test_data_message_missing() {
        let msg = DataMessage::from_line("{\"present\": false}\n").unwrap();
        assert_eq!(msg, DataMessage::missing());
        assert_eq!(msg.into_value(), None);
        assert_eq!(
            DataMessage::missing().to_line().unwrap(),
            "{\"present\":false}\n"
        );
    }

    #[test]
    fn test_data_message_requires_present_flag() {
        let err = DataMessage::from_line(r#"{"val": 3}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { channel: "data", .. }));

        let err = DataMessage::from_line("not json").unwrap_err();
        assert!(err.to_string().starts_with("malformed data message"));
    }

    #[test]
    fn test_restart_confirmation() {
        let conf = RestartConfirmation::from_line("{\"exited\": true}\n").unwrap();
        assert!(conf.exited);
        assert!(RestartConfirmation::from_line(r#"{"exited": "yes"}"#).is_err());
    }

    #[test]
    fn test_envelope_line() {
        let env = Envelope::new(Channel::Data, "{\"present\":true,\"val\":1}\n");
        let line = env.to_line().unwrap();
        // The payload newline is escaped, so the envelope stays one line
        assert_eq!(line.matches('\n').count(), 1);
        assert!(line.contains(r#""channel":"data""#));
        assert_eq!(Envelope::from_line(&line).unwrap(), env);
    }

    #[test]
    fn test_envelope_rejects_unknown_channel() {
        let err = Envelope::from_line(r#"{"channel":"fd5","text":""}"#).unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed { channel: "envelope", .. }));
    }
}
