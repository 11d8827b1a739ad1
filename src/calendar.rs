use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;

use crate::google_auth::TokenSource;

pub const GOOGLE_CALENDAR_API: &str = "https://www.googleapis.com/calendar/v3";

#[derive(Debug, thiserror::Error)]
pub enum CalendarError {
    #[error("{0}")]
    InvalidPayload(String),
    #[error("{0}")]
    InvalidTime(String),
    #[error("Calendar authentication failed: {0}")]
    Auth(String),
    #[error("Unable to read credentials file {path}: {message}")]
    Credentials { path: String, message: String },
    #[error("{context}: calendar API returned {status}: {message}")]
    Api {
        context: &'static str,
        status: StatusCode,
        message: String,
    },
    #[error("Calendar request failed: {0}")]
    Http(#[from] reqwest::Error),
}

/// A parsed start or end time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTime {
    AllDay(NaiveDate),
    /// Carries an explicit UTC offset.
    Zoned(DateTime<FixedOffset>),
    /// Wall-clock time, interpreted in the event's time zone.
    Floating(NaiveDateTime),
}

impl EventTime {
    pub fn is_all_day(&self) -> bool {
        matches!(self, EventTime::AllDay(_))
    }

    /// `None` when the result leaves chrono's representable range.
    fn checked_plus(self, duration: Duration) -> Option<Self> {
        match self {
            EventTime::AllDay(d) => d.checked_add_signed(duration).map(EventTime::AllDay),
            EventTime::Zoned(dt) => dt.checked_add_signed(duration).map(EventTime::Zoned),
            EventTime::Floating(dt) => dt.checked_add_signed(duration).map(EventTime::Floating),
        }
    }

    fn local(&self) -> NaiveDateTime {
        match self {
            EventTime::AllDay(d) => d.and_time(NaiveTime::MIN),
            EventTime::Zoned(dt) => dt.naive_local(),
            EventTime::Floating(dt) => *dt,
        }
    }

    /// Whether `self` is strictly after `other`. Mixed zoned/floating times compare by wall clock.
    pub fn is_after(&self, other: &EventTime) -> bool {
        match (self, other) {
            (EventTime::Zoned(a), EventTime::Zoned(b)) => a > b,
            _ => self.local() > other.local(),
        }
    }

    /// The `start`/`end` object of a Calendar API event.
    pub fn to_block(&self, time_zone: Option<&str>) -> Value {
        let mut block = match self {
            EventTime::AllDay(d) => return json!({ "date": d.format("%Y-%m-%d").to_string() }),
            EventTime::Zoned(dt) => json!({ "dateTime": dt.to_rfc3339() }),
            EventTime::Floating(dt) => json!({ "dateTime": dt.format("%Y-%m-%dT%H:%M:%S").to_string() }),
        };
        if let Some(tz) = time_zone {
            block["timeZone"] = json!(tz);
        }
        block
    }
}

const LENIENT_FORMATS: &[&str] = &["%Y-%m-%d %H:%M", "%Y-%m-%dT%H:%M", "%Y-%m-%dT%H:%M:%S"];

/// Parse RFC3339, a bare date (all-day), or a few lenient local formats.
pub fn parse_event_time(value: &str) -> Result<EventTime, CalendarError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(CalendarError::InvalidTime("time value is empty".into()));
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(value) {
        return Ok(EventTime::Zoned(dt));
    }
    if let Ok(date) = NaiveDate::parse_from_str(value, "%Y-%m-%d") {
        return Ok(EventTime::AllDay(date));
    }
    LENIENT_FORMATS
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(value, fmt).ok())
        .map(EventTime::Floating)
        .ok_or_else(|| {
            CalendarError::InvalidTime(
                "Could not parse time; use RFC3339 or YYYY-MM-DD for all-day events.".into(),
            )
        })
}

/// End time from an explicit value, a duration, or the defaults (one day / one hour).
pub fn compute_end(
    start: EventTime,
    end: Option<&str>,
    duration_minutes: Option<i64>,
) -> Result<EventTime, CalendarError> {
    if let Some(end) = end.filter(|e| !e.trim().is_empty()) {
        let parsed = parse_event_time(end)?;
        if parsed.is_all_day() != start.is_all_day() {
            return Err(CalendarError::InvalidTime(
                "start_time and end_time must both be date-only or both include time".into(),
            ));
        }
        return Ok(parsed);
    }

    let duration = match (start, duration_minutes) {
        (EventTime::AllDay(_), _) => Duration::try_days(1),
        (_, Some(minutes)) if minutes > 0 => Duration::try_minutes(minutes),
        _ => Duration::try_hours(1),
    };
    duration
        .and_then(|d| start.checked_plus(d))
        .ok_or_else(|| CalendarError::InvalidTime("duration out of range".into()))
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventDateTime {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_zone: Option<String>,
}

impl EventDateTime {
    pub fn display(&self) -> Option<&str> {
        self.date_time.as_deref().or(self.date.as_deref())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attendee {
    pub email: Option<String>,
    pub display_name: Option<String>,
}

impl Attendee {
    fn label(&self) -> Option<&str> {
        self.display_name.as_deref().or(self.email.as_deref())
    }
}

/// A provider event, as much of it as this service reads.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CalendarEvent {
    pub id: String,
    #[serde(rename = "summary")]
    pub title: Option<String>,
    pub description: Option<String>,
    pub location: Option<String>,
    #[serde(default)]
    pub start: EventDateTime,
    #[serde(default)]
    pub end: EventDateTime,
    #[serde(default)]
    pub attendees: Vec<Attendee>,
    pub html_link: Option<String>,
}

impl CalendarEvent {
    fn list_line(&self) -> String {
        let mut line = format!(
            "{} – {} (id: {})",
            self.start.display().unwrap_or("unknown"),
            self.title.as_deref().unwrap_or("Untitled"),
            self.id
        );
        let people: Vec<&str> = self.attendees.iter().filter_map(Attendee::label).collect();
        if !people.is_empty() {
            line.push_str(&format!(" with {}", people.join(", ")));
        }
        line
    }

    fn confirmation(&self, verb: &str) -> String {
        let message = format!(
            "{} calendar event \"{}\" ({} → {}).",
            verb,
            self.title.as_deref().unwrap_or(""),
            self.start.display().unwrap_or(""),
            self.end.display().unwrap_or("")
        );
        match &self.html_link {
            Some(link) => format!("{} Link: {}", message, link),
            None => message,
        }
    }
}

#[derive(Debug, Deserialize)]
struct EventList {
    #[serde(default)]
    items: Vec<CalendarEvent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddEventPayload {
    pub summary: String,
    pub start_time: String,
    pub end_time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub description: Option<String>,
    pub location: Option<String>,
    pub time_zone: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EditEventPayload {
    pub event_id: String,
    pub summary: Option<String>,
    pub description: Option<String>,
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub duration_minutes: Option<i64>,
    pub time_zone: Option<String>,
    pub location: Option<String>,
}

/// Google Calendar events API, scoped to one calendar.
pub struct CalendarClient {
    tokens: Arc<TokenSource>,
    http: reqwest::Client,
    api_base: String,
    calendar_id: String,
    lookahead: Duration,
    default_time_zone: Option<String>,
}

impl CalendarClient {
    pub fn new(tokens: Arc<TokenSource>, http: reqwest::Client) -> Self {
        Self {
            tokens,
            http,
            api_base: GOOGLE_CALENDAR_API.to_string(),
            calendar_id: "primary".to_string(),
            lookahead: Duration::hours(72),
            default_time_zone: None,
        }
    }

    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    pub fn lookahead_hours(&self) -> i64 {
        self.lookahead.num_hours()
    }

    pub fn with_calendar_id(mut self, calendar_id: impl Into<String>) -> Self {
        self.calendar_id = calendar_id.into();
        self
    }

    pub fn with_lookahead_hours(mut self, hours: i64) -> Self {
        self.lookahead = Duration::try_hours(hours.max(1)).unwrap_or(self.lookahead);
        self
    }

    pub fn with_default_time_zone(mut self, time_zone: Option<String>) -> Self {
        self.default_time_zone = time_zone;
        self
    }

    /// `{api_base}/calendars/{calendar_id}/events[/{event_id}]`, with segments escaped.
    fn events_url(&self, event_id: Option<&str>) -> Result<Url, CalendarError> {
        let mut url = Url::parse(&self.api_base)
            .map_err(|e| CalendarError::InvalidPayload(format!("invalid calendar API base: {}", e)))?;
        {
            let mut segments = url
                .path_segments_mut()
                .map_err(|_| CalendarError::InvalidPayload("calendar API base cannot be a base URL".into()))?;
            segments.pop_if_empty().extend(["calendars", self.calendar_id.as_str(), "events"]);
            if let Some(id) = event_id {
                segments.push(id);
            }
        }
        Ok(url)
    }

    async fn send(&self, request: reqwest::RequestBuilder, context: &'static str) -> Result<Value, CalendarError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<Value>(&body)
                .ok()
                .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
                .unwrap_or(body);
            log::warn!("Calendar: {} failed with {}", context, status);
            return Err(CalendarError::Api { context, status, message });
        }

        Ok(response.json().await?)
    }

    pub async fn upcoming_events(&self) -> Result<Vec<CalendarEvent>, CalendarError> {
        let now = Utc::now();
        let until = now
            .checked_add_signed(self.lookahead)
            .ok_or_else(|| CalendarError::InvalidPayload("lookahead window out of range".into()))?;
        let request = self.http.get(self.events_url(None)?).query(&[
            ("timeMin", now.to_rfc3339()),
            ("timeMax", until.to_rfc3339()),
            ("singleEvents", "true".to_string()),
            ("orderBy", "startTime".to_string()),
        ]);

        let value = self.send(request, "Unable to list events").await?;
        let list: EventList = serde_json::from_value(value)
            .map_err(|e| CalendarError::InvalidPayload(format!("unexpected events response: {}", e)))?;
        log::info!("Calendar: {} upcoming events", list.items.len());
        Ok(list.items)
    }

    pub async fn list_upcoming(&self) -> Result<String, CalendarError> {
        let events = self.upcoming_events().await?;
        if events.is_empty() {
            return Ok("No upcoming events found.".to_string());
        }
        Ok(events.iter().map(CalendarEvent::list_line).collect::<Vec<_>>().join("\n"))
    }

    /// Request body for a new event; fails on unparseable or inverted times.
    pub fn build_insert_body(&self, payload: &AddEventPayload) -> Result<Value, CalendarError> {
        let start = parse_event_time(&payload.start_time)?;
        let end = compute_end(start, payload.end_time.as_deref(), payload.duration_minutes)?;
        if !end.is_after(&start) {
            return Err(CalendarError::InvalidTime("end_time must be after start_time".into()));
        }

        let tz = payload.time_zone.as_deref().or(self.default_time_zone.as_deref());
        Ok(json!({
            "summary": payload.summary,
            "description": payload.description,
            "location": payload.location,
            "start": start.to_block(tz),
            "end": end.to_block(tz),
        }))
    }

    pub async fn add_event(&self, payload: AddEventPayload) -> Result<String, CalendarError> {
        let body = self.build_insert_body(&payload)?;
        let request = self.http.post(self.events_url(None)?).json(&body);
        let created = self.send(request, "Unable to create event").await?;
        let event = parse_event(created)?;
        log::info!("Calendar: created event {}", event.id);
        Ok(event.confirmation("Created"))
    }

    /// Merge an edit over the stored event into a full update body.
    pub fn build_update_body(
        &self,
        existing: &CalendarEvent,
        payload: &EditEventPayload,
    ) -> Result<Value, CalendarError> {
        let tz = payload
            .time_zone
            .as_deref()
            .or(existing.start.time_zone.as_deref())
            .or(existing.end.time_zone.as_deref())
            .or(self.default_time_zone.as_deref());

        let start_raw = payload
            .start_time
            .as_deref()
            .or(existing.start.display())
            .ok_or_else(|| CalendarError::InvalidTime("Event has no start time; provide start_time".into()))?;
        let start = parse_event_time(start_raw)?;

        // A new duration replaces the stored end; otherwise the stored end is kept.
        let end_raw = match (&payload.end_time, payload.duration_minutes) {
            (Some(end), _) => Some(end.as_str()),
            (None, Some(minutes)) if minutes > 0 => None,
            (None, _) => existing.end.display(),
        };
        let end = compute_end(start, end_raw, payload.duration_minutes)?;
        if end.is_all_day() != start.is_all_day() {
            return Err(CalendarError::InvalidTime(
                "start_time and end_time must both be date-only or both include time".into(),
            ));
        }
        if !end.is_after(&start) {
            return Err(CalendarError::InvalidTime("end_time must be after start_time".into()));
        }

        Ok(json!({
            "summary": payload.summary.as_ref().or(existing.title.as_ref()),
            "description": payload.description.as_ref().or(existing.description.as_ref()),
            "location": payload.location.as_ref().or(existing.location.as_ref()),
            "start": start.to_block(tz),
            "end": end.to_block(tz),
        }))
    }

    pub async fn get_event(&self, event_id: &str) -> Result<CalendarEvent, CalendarError> {
        let request = self.http.get(self.events_url(Some(event_id))?);
        parse_event(self.send(request, "Unable to fetch event").await?)
    }

    pub async fn edit_event(&self, payload: EditEventPayload) -> Result<String, CalendarError> {
        let existing = self.get_event(&payload.event_id).await?;
        let body = self.build_update_body(&existing, &payload)?;

        let request = self.http.put(self.events_url(Some(&payload.event_id))?).json(&body);
        let saved = parse_event(self.send(request, "Unable to update event").await?)?;
        log::info!("Calendar: updated event {}", saved.id);
        Ok(saved.confirmation("Updated"))
    }
}

fn parse_event(value: Value) -> Result<CalendarEvent, CalendarError> {
    serde_json::from_value(value)
        .map_err(|e| CalendarError::InvalidPayload(format!("unexpected event response: {}", e)))
}
