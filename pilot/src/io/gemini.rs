//! Gemini `generateContent` client implementing [`DecisionOracle`].

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};

use crate::core::decision::ActionDecision;
use crate::core::history::HistoryEntry;
use crate::core::intent::ToolCall;
use crate::core::status::RunStatus;
use crate::error::OracleError;
use crate::io::config::OracleConfig;
use crate::io::oracle::{DecisionOracle, Verdict};

/// Fallback reply when the model answers intent classification with nothing.
const UNCLEAR_REPLY: &str = "I'm not sure what you mean.";

/// Strip a fenced code block around a model reply, if any.
pub fn extract_json_block(text: &str) -> &str {
    let text = text.trim();
    let body = if let Some((_, rest)) = text.split_once("```json") {
        rest
    } else if let Some((_, rest)) = text.split_once("```") {
        rest
    } else {
        return text;
    };
    body.split_once("```").map_or(body, |(inner, _)| inner).trim()
}

/// First `limit` characters of `text`.
pub fn truncate_chars(text: &str, limit: usize) -> &str {
    match text.char_indices().nth(limit) {
        Some((end, _)) => &text[..end],
        None => text,
    }
}

fn parse_json<T: for<'de> Deserialize<'de>>(text: &str) -> Result<T, OracleError> {
    serde_json::from_str(extract_json_block(text))
        .map_err(|err| OracleError::Malformed(format!("{err}: {}", truncate_chars(text, 200))))
}

pub fn parse_plan(text: &str) -> Result<Vec<String>, OracleError> {
    let steps: Vec<String> = parse_json(text)?;
    let steps: Vec<String> = steps
        .into_iter()
        .map(|step| step.trim().to_string())
        .filter(|step| !step.is_empty())
        .collect();
    if steps.is_empty() {
        return Err(OracleError::Empty);
    }
    Ok(steps)
}

pub fn parse_verdict(text: &str) -> Result<Verdict, OracleError> {
    #[derive(Deserialize)]
    struct Raw {
        status: String,
        #[serde(default)]
        reason: String,
    }
    let raw: Raw = parse_json(text)?;
    Ok(Verdict {
        completed: raw.status.eq_ignore_ascii_case("completed"),
        reason: raw.reason,
    })
}

/// Map a model function call onto a [`ToolCall`].
pub fn tool_call_from_function(name: &str, args: &Value) -> Result<ToolCall, OracleError> {
    let mut frame = json!({ "intent": name });
    if args.as_object().is_some_and(|args| !args.is_empty()) {
        frame["args"] = args.clone();
    }
    serde_json::from_value(frame)
        .map_err(|err| OracleError::Malformed(format!("function call '{name}': {err}")))
}

fn intent_tools() -> Value {
    let no_args = |name: &str, description: &str| json!({ "name": name, "description": description });
    let one_arg = |name: &str, description: &str, arg: &str, arg_description: &str| {
        json!({
            "name": name,
            "description": description,
            "parameters": {
                "type": "OBJECT",
                "properties": { arg: { "type": "STRING", "description": arg_description } },
                "required": [arg],
            }
        })
    };
    json!([{
        "function_declarations": [
            no_args("stop_agent", "Stop the current agent execution and clean up. Use when the user wants to abort or stop."),
            no_args("restart_agent", "Restart the current task from the beginning. Use when the user says 'try again' or 'restart'."),
            one_arg("update_goal", "Replace the agent's goal and restart with it.", "new_goal", "The updated task description from the user."),
            no_args("pause_agent", "Pause the agent without ending the run."),
            no_args("resume_agent", "Resume a paused agent."),
            one_arg("reply_to_user", "Answer general questions or chitchat in natural language.", "message", "The response message to the user."),
        ]
    }])
}

fn history_lines(history: &[HistoryEntry]) -> String {
    history
        .iter()
        .map(|entry| serde_json::to_string(entry).unwrap_or_default())
        .collect::<Vec<_>>()
        .join("\n")
}

fn image_part(png: &[u8]) -> Value {
    json!({ "inline_data": { "mime_type": "image/png", "data": STANDARD.encode(png) } })
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

#[derive(Debug, Deserialize)]
struct Content {
    #[serde(default)]
    parts: Vec<Part>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    text: Option<String>,
    function_call: Option<FunctionCall>,
}

#[derive(Debug, Deserialize)]
struct FunctionCall {
    name: String,
    #[serde(default)]
    args: Value,
}

impl GenerateResponse {
    fn parts(&self) -> &[Part] {
        self.candidates
            .first()
            .and_then(|candidate| candidate.content.as_ref())
            .map(|content| content.parts.as_slice())
            .unwrap_or_default()
    }

    fn text(&self) -> String {
        self.parts()
            .iter()
            .filter_map(|part| part.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }

    fn function_call(&self) -> Option<&FunctionCall> {
        self.parts().iter().find_map(|part| part.function_call.as_ref())
    }
}

pub struct GeminiOracle {
    client: Client,
    config: OracleConfig,
    api_key: Option<String>,
}

impl GeminiOracle {
    /// Build a client. A missing or blank key makes every call `Unavailable`.
    pub fn new(config: OracleConfig, api_key: Option<String>) -> Result<Self, OracleError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()?;
        let api_key = api_key.filter(|key| !key.trim().is_empty());
        if api_key.is_none() {
            warn!(env = %config.api_key_env, "oracle API key not set");
        }
        Ok(Self {
            client,
            config,
            api_key,
        })
    }

    /// Read the key from the environment variable named in `config`.
    pub fn from_env(config: OracleConfig) -> Result<Self, OracleError> {
        let key = std::env::var(&config.api_key_env).ok();
        Self::new(config, key)
    }

    async fn generate(&self, body: Value) -> Result<GenerateResponse, OracleError> {
        let key = self
            .api_key
            .as_deref()
            .ok_or_else(|| OracleError::Unavailable(format!("{} is not set", self.config.api_key_env)))?;
        let url = format!(
            "{}/models/{}:generateContent",
            self.config.endpoint.trim_end_matches('/'),
            self.config.model
        );
        let response = self
            .client
            .post(url)
            .header("x-goog-api-key", key)
            .json(&body)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(OracleError::Status {
                status: status.as_u16(),
                message: truncate_chars(&message, 500).to_string(),
            });
        }
        response
            .json()
            .await
            .map_err(|err| OracleError::Malformed(err.to_string()))
    }

    async fn generate_text(&self, parts: Vec<Value>) -> Result<String, OracleError> {
        let response = self
            .generate(json!({ "contents": [{ "role": "user", "parts": parts }] }))
            .await?;
        let text = response.text();
        if text.trim().is_empty() {
            return Err(OracleError::Empty);
        }
        Ok(text)
    }
}

#[async_trait]
impl DecisionOracle for GeminiOracle {
    #[instrument(skip_all, fields(model = %self.config.model))]
    async fn plan(&self, goal: &str) -> Result<Vec<String>, OracleError> {
        let prompt = format!(
            "You are a mobile automation planner.\n\
             Break the user's goal into a sequence of granular, verifiable steps.\n\
             Goal: {goal}\n\n\
             Return a JSON array of strings, one per step.\n\
             Example: [\"Tap the email field\", \"Type 'user@test.com'\", \"Tap Login\"]"
        );
        let text = self.generate_text(vec![json!({ "text": prompt })]).await?;
        let plan = parse_plan(&text)?;
        debug!(steps = plan.len(), "plan parsed");
        Ok(plan)
    }

    #[instrument(skip_all, fields(model = %self.config.model))]
    async fn analyze(
        &self,
        screenshot: &[u8],
        ui_tree: &str,
        step: &str,
        history: &[HistoryEntry],
    ) -> Result<ActionDecision, OracleError> {
        let tree = truncate_chars(ui_tree, self.config.ui_tree_char_limit);
        let prompt = format!(
            "Extract selectors directly from the UI hierarchy below. Never invent resource ids.\n\n\
             Current task: {step}\n\n\
             Recent history:\n{history}\n\n\
             UI hierarchy XML:\n{tree}\n\n\
             Instructions:\n\
             1. Find the element that matches the task.\n\
             2. Use its exact resource-id, text or content-desc.\n\
             3. Always include fallback coordinates: the center of its bounds=\"[x1,y1][x2,y2]\".\n\
             Selector types: \"id\", \"text\", \"accessibility_id\", \"class\", \"xpath\".\n\n\
             Return JSON:\n\
             {{\"action\": \"click|tap|type|swipe|wait|done|complete|fail\", \
             \"selector\": {{\"type\": \"id\", \"value\": \"...\"}}, \
             \"text\": \"text to type\", \
             \"coordinates\": {{\"x\": 500, \"y\": 1500}}, \
             \"params\": {{\"start_x\": 0, \"start_y\": 0, \"end_x\": 0, \"end_y\": 0, \"duration_ms\": 500, \"duration\": 2}}, \
             \"reason\": \"...\"}}\n\
             Use \"done\" when the current task is already satisfied, \
             \"complete\" when the whole goal is achieved and \"fail\" when no action can help.",
            history = history_lines(history),
        );
        let text = self
            .generate_text(vec![json!({ "text": prompt }), image_part(screenshot)])
            .await?;
        parse_json(&text)
    }

    #[instrument(skip_all, fields(model = %self.config.model))]
    async fn verify(&self, screenshot: &[u8], step: &str) -> Result<Verdict, OracleError> {
        let prompt = format!(
            "You are a mobile testing verifier.\n\
             Current task: {step}\n\n\
             Is the current task already completed on this screen?\n\
             Return JSON: {{\"status\": \"completed\" | \"not_completed\", \"reason\": \"...\"}}"
        );
        let text = self
            .generate_text(vec![json!({ "text": prompt }), image_part(screenshot)])
            .await?;
        parse_verdict(&text)
    }

    #[instrument(skip_all, fields(model = %self.config.model, status = %status))]
    async fn classify_intent(
        &self,
        message: &str,
        history: &[HistoryEntry],
        status: RunStatus,
    ) -> Result<ToolCall, OracleError> {
        let instruction = format!(
            "You supervise a mobile test agent.\n\
             Current agent status: {status}\n\
             Recent history:\n{history}\n\n\
             The user may want to stop, pause, resume or restart the agent, change its goal, \
             or just talk. Call the matching tool. To change the goal always use update_goal.",
            history = history_lines(history),
        );
        let response = self
            .generate(json!({
                "system_instruction": { "parts": [{ "text": instruction }] },
                "contents": [{ "role": "user", "parts": [{ "text": message }] }],
                "tools": intent_tools(),
            }))
            .await?;
        if let Some(call) = response.function_call() {
            return tool_call_from_function(&call.name, &call.args);
        }
        let text = response.text();
        let text = text.trim();
        Ok(ToolCall::reply(if text.is_empty() { UNCLEAR_REPLY } else { text }))
    }
}
