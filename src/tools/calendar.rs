use serde_json::{json, Value};
use std::sync::Arc;

use super::{from_args, Tool, ToolError};
use crate::calendar::{AddEventPayload, CalendarClient, EditEventPayload};

fn require(client: &Option<Arc<CalendarClient>>) -> Result<&CalendarClient, ToolError> {
    client.as_deref().ok_or(ToolError::CalendarNotConfigured)
}

/// Lists upcoming events.
pub struct CalendarListTool {
    client: Option<Arc<CalendarClient>>,
    description: String,
}

impl CalendarListTool {
    pub fn new(client: Option<Arc<CalendarClient>>) -> Self {
        let window = match &client {
            Some(client) => format!("the next {} hours", client.lookahead_hours()),
            None => "the coming days".to_string(),
        };
        let description = format!(
            "List the user's upcoming Google Calendar events for {}, including each event's id.",
            window
        );
        Self { client, description }
    }
}

#[async_trait::async_trait]
impl Tool for CalendarListTool {
    fn name(&self) -> &str {
        "calendar"
    }

    fn description(&self) -> &str {
        &self.description
    }

    fn parameters(&self) -> Value {
        json!({ "type": "object", "properties": {}, "required": [] })
    }

    async fn run(&self, _args: Value) -> Result<String, ToolError> {
        Ok(require(&self.client)?.list_upcoming().await?)
    }
}

/// Creates an event.
pub struct CalendarAddTool {
    client: Option<Arc<CalendarClient>>,
}

impl CalendarAddTool {
    pub fn new(client: Option<Arc<CalendarClient>>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for CalendarAddTool {
    fn name(&self) -> &str {
        "calendar_add_event"
    }

    fn description(&self) -> &str {
        "Add a new event to Google Calendar. Provide summary, start_time (RFC3339, or YYYY-MM-DD \
         for all-day events), optional end_time or duration_minutes, description, location, and time_zone."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "summary": { "type": "string" },
                "start_time": { "type": "string" },
                "end_time": { "type": "string" },
                "duration_minutes": { "type": "integer" },
                "description": { "type": "string" },
                "location": { "type": "string" },
                "time_zone": { "type": "string", "description": "IANA name, e.g. Europe/Rome" }
            },
            "required": ["summary", "start_time"]
        })
    }

    async fn run(&self, args: Value) -> Result<String, ToolError> {
        let client = require(&self.client)?;
        let payload: AddEventPayload = from_args(args)?;
        Ok(client.add_event(payload).await?)
    }
}

/// Edits an existing event by id.
pub struct CalendarEditTool {
    client: Option<Arc<CalendarClient>>,
}

impl CalendarEditTool {
    pub fn new(client: Option<Arc<CalendarClient>>) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Tool for CalendarEditTool {
    fn name(&self) -> &str {
        "calendar_edit_event"
    }

    fn description(&self) -> &str {
        "Edit an existing Google Calendar event. Provide event_id and any fields to update \
         (summary, description, start_time, end_time, duration_minutes, time_zone, location)."
    }

    fn parameters(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "event_id": { "type": "string" },
                "summary": { "type": "string" },
                "description": { "type": "string" },
                "start_time": { "type": "string" },
                "end_time": { "type": "string" },
                "duration_minutes": { "type": "integer" },
                "time_zone": { "type": "string" },
                "location": { "type": "string" }
            },
            "required": ["event_id"]
        })
    }

    async fn run(&self, args: Value) -> Result<String, ToolError> {
        let client = require(&self.client)?;
        let payload: EditEventPayload = from_args(args)?;
        Ok(client.edit_event(payload).await?)
    }
}
