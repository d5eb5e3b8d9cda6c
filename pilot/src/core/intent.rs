//! User control intents and the client message frame that carries them.

use serde::{Deserialize, Serialize};

use crate::error::ProtocolError;

/// A classified user intent with its arguments.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "intent", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    StopAgent,
    RestartAgent,
    UpdateGoal { new_goal: String },
    PauseAgent,
    ResumeAgent,
    ReplyToUser { message: String },
}

impl ToolCall {
    pub fn reply(message: impl Into<String>) -> Self {
        ToolCall::ReplyToUser {
            message: message.into(),
        }
    }

    pub fn intent(&self) -> &'static str {
        match self {
            ToolCall::StopAgent => "stop_agent",
            ToolCall::RestartAgent => "restart_agent",
            ToolCall::UpdateGoal { .. } => "update_goal",
            ToolCall::PauseAgent => "pause_agent",
            ToolCall::ResumeAgent => "resume_agent",
            ToolCall::ReplyToUser { .. } => "reply_to_user",
        }
    }
}

/// Frames accepted on the command channel.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    UserMessage { message: String },
}

/// Parse a raw command-channel frame into the user's message text.
pub fn parse_user_message(raw: &str) -> Result<String, ProtocolError> {
    let frame: ClientFrame = serde_json::from_str(raw)
        .map_err(|err| ProtocolError::new(format!("malformed message frame: {err}")))?;
    let ClientFrame::UserMessage { message } = frame;
    let message = message.trim();
    if message.is_empty() {
        return Err(ProtocolError::new("user message is empty"));
    }
    Ok(message.to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn tool_call_wire_shape() {
        let call = ToolCall::UpdateGoal {
            new_goal: "Open settings".into(),
        };
        let value = serde_json::to_value(&call).expect("serialize");
        assert_eq!(
            value,
            json!({"intent": "update_goal", "args": {"new_goal": "Open settings"}})
        );

        let stop: ToolCall =
            serde_json::from_value(json!({"intent": "stop_agent"})).expect("parse");
        assert_eq!(stop, ToolCall::StopAgent);
        assert_eq!(stop.intent(), "stop_agent");
    }

    #[test]
    fn parses_user_message_frame() {
        let message =
            parse_user_message(r#"{"type":"user_message","message":"  stop  "}"#).expect("parse");
        assert_eq!(message, "stop");
    }

    #[test]
    fn rejects_malformed_frames() {
        assert!(parse_user_message("not json").is_err());
        assert!(parse_user_message(r#"{"type":"ping"}"#).is_err());
        assert!(parse_user_message(r#"{"type":"user_message"}"#).is_err());
        assert!(parse_user_message(r#"{"type":"user_message","message":"  "}"#).is_err());
    }
}
