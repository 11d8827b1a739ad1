pub mod calculator;
pub mod calendar;
pub mod notes_reader;

pub use calculator::Calculator;
pub use calendar::{CalendarAddTool, CalendarEditTool, CalendarListTool};
pub use notes_reader::NotesTool;

use serde_json::{json, Value};
use std::sync::Arc;

use crate::calendar::CalendarError;

#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    UnknownTool(String),
    #[error("Invalid arguments: {0}")]
    InvalidArguments(String),
    #[error("Could not evaluate expression: {0}")]
    Evaluation(String),
    #[error("Calendar is not configured")]
    CalendarNotConfigured,
    #[error(transparent)]
    Calendar(#[from] CalendarError),
    #[error("Tool failed: {0}")]
    Failed(String),
}

/// Tool trait for functions the agent may call.
///
/// Object-safe so the agent can dispatch by name over `dyn Tool`.
#[async_trait::async_trait]
pub trait Tool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;

    /// JSON schema of the arguments object.
    fn parameters(&self) -> Value;

    async fn run(&self, args: Value) -> Result<String, ToolError>;

    /// Function declaration in the chat completions `tools` format.
    fn schema(&self) -> Value {
        json!({
            "type": "function",
            "function": {
                "name": self.name(),
                "description": self.description(),
                "parameters": self.parameters(),
            }
        })
    }
}

/// The set of tools available to one agent.
#[derive(Clone, Default)]
pub struct Toolbox {
    tools: Vec<Arc<dyn Tool>>,
}

impl Toolbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, tool: impl Tool + 'static) -> Self {
        self.tools.push(Arc::new(tool));
        self
    }

    pub fn names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn schemas(&self) -> Vec<Value> {
        self.tools.iter().map(|t| t.schema()).collect()
    }

    /// Run the named tool with the model's raw argument string.
    pub async fn dispatch(&self, name: &str, raw_args: &str) -> Result<String, ToolError> {
        let tool = self
            .tools
            .iter()
            .find(|t| t.name() == name)
            .ok_or_else(|| ToolError::UnknownTool(name.to_string()))?;

        log::info!("Toolbox: calling {}", name);
        tool.run(parse_arguments(raw_args)).await
    }
}

/// Empty input is an empty object; anything that is not JSON is passed as a string.
pub fn parse_arguments(raw: &str) -> Value {
    let raw = raw.trim();
    if raw.is_empty() {
        return json!({});
    }
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Deserialize tool arguments, treating a missing object as `{}`.
pub(crate) fn from_args<T: serde::de::DeserializeOwned>(args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { json!({}) } else { args };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calendar::CalendarClient;
    use crate::google_auth::{Credentials, OAuthToken, TokenSource};

    fn full_toolbox() -> Toolbox {
        let token = OAuthToken {
            access_token: "ya29.test".into(),
            refresh_token: None,
            expires_at: None,
            scopes: Vec::new(),
        };
        let source = TokenSource::new(Credentials::OAuth { token, client: None }, reqwest::Client::new());
        let calendar = Arc::new(CalendarClient::new(Arc::new(source), reqwest::Client::new()));

        Toolbox::new()
            .with(Calculator::new())
            .with(NotesTool::new("/tmp/notes".into(), 5))
            .with(CalendarListTool::new(Some(calendar.clone())))
            .with(CalendarAddTool::new(Some(calendar.clone())))
            .with(CalendarEditTool::new(Some(calendar)))
    }

    #[test]
    fn test_tool_schemas_are_well_formed() {
        let toolbox = full_toolbox();
        assert_eq!(
            toolbox.names(),
            vec!["calculator", "notes", "calendar", "calendar_add_event", "calendar_edit_event"]
        );

        for schema in toolbox.schemas() {
            assert_eq!(schema["type"], "function");
            let function = &schema["function"];
            let name = function["name"].as_str().unwrap();
            assert!(!name.is_empty());
            assert!(!function["description"].as_str().unwrap().is_empty());

            let params = &function["parameters"];
            assert_eq!(params["type"], "object", "{} parameters", name);
            let properties = params["properties"].as_object().unwrap();
            if let Some(required) = params.get("required") {
                for field in required.as_array().unwrap() {
                    let field = field.as_str().unwrap();
                    assert!(properties.contains_key(field), "{} requires unknown {}", name, field);
                }
            }
        }
    }

    #[test]
    fn test_parse_arguments() {
        assert_eq!(parse_arguments(""), json!({}));
        assert_eq!(parse_arguments("{\"count\": 2}"), json!({"count": 2}));
        assert_eq!(parse_arguments("2 + 2"), json!("2 + 2"));
    }

    #[tokio::test]
    async fn test_dispatch() {
        let toolbox = Toolbox::new().with(Calculator::new());
        let out = toolbox.dispatch("calculator", r#"{"expression": "6*7"}"#).await.unwrap();
        assert_eq!(out, "42");

        let err = toolbox.dispatch("weather", "{}").await.unwrap_err();
        assert!(matches!(err, ToolError::UnknownTool(name) if name == "weather"));
    }

    #[tokio::test]
    async fn test_calendar_tools_without_client() {
        let tool = CalendarListTool::new(None);
        let err = tool.run(json!({})).await.unwrap_err();
        assert_eq!(err.to_string(), "Calendar is not configured");
    }
}
