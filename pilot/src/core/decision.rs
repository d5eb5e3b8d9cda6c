//! Action decisions proposed by the decision oracle.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of action the oracle asks for.
///
/// Unknown kinds deserialize as [`ActionKind::Fail`]: an action the agent
/// cannot perform is treated the same as the oracle being unable to decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Tap,
    Type,
    Swipe,
    Click,
    Wait,
    /// The current step is satisfied; move to the next one.
    Done,
    /// The whole goal is satisfied.
    Complete,
    #[serde(other)]
    Fail,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Tap => "tap",
            ActionKind::Type => "type",
            ActionKind::Swipe => "swipe",
            ActionKind::Click => "click",
            ActionKind::Wait => "wait",
            ActionKind::Done => "done",
            ActionKind::Complete => "complete",
            ActionKind::Fail => "fail",
        }
    }

    /// Kinds that are handed to the executor.
    pub fn is_executable(self) -> bool {
        matches!(
            self,
            ActionKind::Tap
                | ActionKind::Type
                | ActionKind::Swipe
                | ActionKind::Click
                | ActionKind::Wait
                | ActionKind::Done
        )
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Element lookup strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorStrategy {
    #[default]
    Id,
    Text,
    AccessibilityId,
    Class,
    #[serde(other)]
    Xpath,
}

/// UI element selector.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selector {
    #[serde(rename = "type", default)]
    pub strategy: SelectorStrategy,
    #[serde(default)]
    pub value: String,
}

impl Selector {
    pub fn new(strategy: SelectorStrategy, value: impl Into<String>) -> Self {
        Self {
            strategy,
            value: value.into(),
        }
    }

    pub fn id(value: impl Into<String>) -> Self {
        Self::new(SelectorStrategy::Id, value)
    }
}

/// Screen coordinates in screenshot pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Coordinates {
    pub x: i32,
    pub y: i32,
}

impl Coordinates {
    pub fn new(x: i32, y: i32) -> Self {
        Self { x, y }
    }
}

/// One proposed action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionDecision {
    #[serde(rename = "action")]
    pub kind: ActionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub selector: Option<Selector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub coordinates: Option<Coordinates>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub params: Map<String, Value>,
    #[serde(default)]
    pub reason: String,
}

impl ActionDecision {
    pub fn new(kind: ActionKind, reason: impl Into<String>) -> Self {
        Self {
            kind,
            selector: None,
            coordinates: None,
            text: None,
            params: Map::new(),
            reason: reason.into(),
        }
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_coordinates(mut self, x: i32, y: i32) -> Self {
        self.coordinates = Some(Coordinates::new(x, y));
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    /// Selector with a non-blank value, if any.
    pub fn target_selector(&self) -> Option<&Selector> {
        self.selector
            .as_ref()
            .filter(|selector| !selector.value.trim().is_empty())
    }

    /// Literal tap point: `coordinates`, else `params.x`/`params.y`.
    pub fn target_point(&self) -> Option<Coordinates> {
        self.coordinates.or_else(|| {
            Some(Coordinates::new(self.param_i32("x")?, self.param_i32("y")?))
        })
    }

    /// Text to type: `text`, else `params.text`.
    pub fn typed_text(&self) -> Option<&str> {
        self.text
            .as_deref()
            .or_else(|| self.params.get("text").and_then(Value::as_str))
    }

    pub fn param_i32(&self, key: &str) -> Option<i32> {
        let value = self.params.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|v| v.round() as i64))
            .and_then(|v| i32::try_from(v).ok())
    }

    pub fn param_f64(&self, key: &str) -> Option<f64> {
        self.params.get(key)?.as_f64()
    }

    /// Structured detail recorded in history alongside the action name.
    pub fn history_params(&self) -> Option<Value> {
        let mut detail = self.params.clone();
        if let Some(selector) = &self.selector
            && let Ok(value) = serde_json::to_value(selector)
        {
            detail.insert("selector".to_string(), value);
        }
        if let Some(point) = self.coordinates {
            detail.insert("x".to_string(), point.x.into());
            detail.insert("y".to_string(), point.y.into());
        }
        if let Some(text) = &self.text {
            detail.insert("text".to_string(), text.clone().into());
        }
        if detail.is_empty() {
            None
        } else {
            Some(Value::Object(detail))
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parses_oracle_payload() {
        let raw = json!({
            "action": "click",
            "selector": {"type": "id", "value": "com.app:id/login"},
            "coordinates": {"x": 701, "y": 1533},
            "reason": "Found login button"
        });
        let decision: ActionDecision = serde_json::from_value(raw).expect("parse");
        assert_eq!(decision.kind, ActionKind::Click);
        assert_eq!(
            decision.target_selector(),
            Some(&Selector::id("com.app:id/login"))
        );
        assert_eq!(decision.target_point(), Some(Coordinates::new(701, 1533)));
    }

    /// Anything the agent cannot act on is read as `fail`.
    #[test]
    fn unknown_kind_is_fail() {
        let decision: ActionDecision =
            serde_json::from_value(json!({"action": "dance"})).expect("parse");
        assert_eq!(decision.kind, ActionKind::Fail);
        assert!(decision.reason.is_empty());
    }

    #[test]
    fn selector_type_defaults_to_id_and_unknown_to_xpath() {
        let defaulted: Selector = serde_json::from_value(json!({"value": "a"})).expect("parse");
        assert_eq!(defaulted.strategy, SelectorStrategy::Id);
        let unknown: Selector =
            serde_json::from_value(json!({"type": "css", "value": "a"})).expect("parse");
        assert_eq!(unknown.strategy, SelectorStrategy::Xpath);
    }

    #[test]
    fn blank_selector_is_not_a_target() {
        let decision =
            ActionDecision::new(ActionKind::Tap, "").with_selector(Selector::id("   "));
        assert!(decision.target_selector().is_none());
    }

    #[test]
    fn point_falls_back_to_params() {
        let decision = ActionDecision::new(ActionKind::Tap, "")
            .with_param("x", 10)
            .with_param("y", 20.4);
        assert_eq!(decision.target_point(), Some(Coordinates::new(10, 20)));

        let partial = ActionDecision::new(ActionKind::Tap, "").with_param("x", 10);
        assert_eq!(partial.target_point(), None);
    }

    #[test]
    fn typed_text_prefers_top_level_field() {
        let decision = ActionDecision::new(ActionKind::Type, "")
            .with_text("user@test.com")
            .with_param("text", "ignored");
        assert_eq!(decision.typed_text(), Some("user@test.com"));

        let from_params = ActionDecision::new(ActionKind::Type, "").with_param("text", "1234");
        assert_eq!(from_params.typed_text(), Some("1234"));
    }

    #[test]
    fn executable_kinds() {
        assert!(ActionKind::Wait.is_executable());
        assert!(ActionKind::Done.is_executable());
        assert!(!ActionKind::Complete.is_executable());
        assert!(!ActionKind::Fail.is_executable());
    }
}
