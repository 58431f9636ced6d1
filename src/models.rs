use serde::{Deserialize, Deserializer, Serialize};

pub const DEFAULT_COURSE_NAME: &str = "Course";
pub const DEFAULT_COURSE_CODE: &str = "COURSE-101";
pub const SELECTED_COURSE_NAME: &str = "Selected Events";
pub const SELECTED_COURSE_CODE: &str = "SELECTED";

/// Named collection of events, as extracted by the model or posted by a client.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Schedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub course_code: Option<String>,
    #[serde(default)]
    pub events: Vec<Event>,
}

impl Schedule {
    pub fn course_name(&self) -> &str {
        self.course_name.as_deref().unwrap_or(DEFAULT_COURSE_NAME)
    }

    pub fn course_code(&self) -> &str {
        self.course_code.as_deref().unwrap_or(DEFAULT_COURSE_CODE)
    }
}

/// One calendar entry. Timestamps stay textual until rendering so that
/// offset-less wall-clock times are never reinterpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    #[serde(default = "default_title", deserialize_with = "title_or_default")]
    pub title: String,
    pub start_time: String,
    pub end_time: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub location: String,
    #[serde(default, deserialize_with = "string_or_empty")]
    pub description: String,
    #[serde(default)]
    pub recurrence: Recurrence,
    #[serde(default, deserialize_with = "days_or_empty")]
    pub days: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
}

fn default_title() -> String {
    "Event".to_string()
}

fn title_or_default<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_else(default_title))
}

fn string_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

fn days_or_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    Ok(Option::<Vec<String>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Repetition of an event. Anything other than `daily`/`weekly` on the wire
/// (`""`, `"once"`, null) means no repetition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Option<String>", into = "String")]
pub enum Recurrence {
    #[default]
    None,
    Daily,
    Weekly,
}

impl From<Option<String>> for Recurrence {
    fn from(value: Option<String>) -> Self {
        match value.as_deref().map(str::trim) {
            Some(v) if v.eq_ignore_ascii_case("weekly") => Recurrence::Weekly,
            Some(v) if v.eq_ignore_ascii_case("daily") => Recurrence::Daily,
            _ => Recurrence::None,
        }
    }
}

impl From<Recurrence> for String {
    fn from(value: Recurrence) -> Self {
        match value {
            Recurrence::None => String::new(),
            Recurrence::Daily => "daily".to_string(),
            Recurrence::Weekly => "weekly".to_string(),
        }
    }
}

/// Body of `/generate/generate-ics-selected`.
#[derive(Debug, Deserialize)]
pub struct SelectedEventsRequest {
    pub course_name: Option<String>,
    pub course_code: Option<String>,
    #[serde(default)]
    pub selected_events: Vec<Event>,
}

impl SelectedEventsRequest {
    pub fn into_schedule(self) -> Schedule {
        Schedule {
            course_name: Some(
                self.course_name
                    .unwrap_or_else(|| SELECTED_COURSE_NAME.to_string()),
            ),
            course_code: Some(
                self.course_code
                    .unwrap_or_else(|| SELECTED_COURSE_CODE.to_string()),
            ),
            events: self.selected_events,
        }
    }
}

/// Form fields posted to the chat endpoints.
#[derive(Debug, Deserialize)]
pub struct ChatForm {
    pub message: String,
    pub conversation_history: Option<String>,
}

/// One prior turn as the frontend sends it.
#[derive(Debug, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub text: String,
    #[serde(default, rename = "isUser")]
    pub is_user: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatAction {
    Chat,
    GenerateIcs,
}

/// Reply returned by the non-streaming chat endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatReply {
    pub action: ChatAction,
    pub response: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ics_data: Option<Schedule>,
}

impl ChatReply {
    pub fn chat(response: impl Into<String>) -> Self {
        Self {
            action: ChatAction::Chat,
            response: response.into(),
            ics_data: None,
        }
    }
}

/// SSE payloads of `/generate/chat-stream`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ChatFrame {
    Chunk { chunk: String },
    IcsData { ics_data: Schedule },
    Done { done: bool },
    Error { error: String },
}

impl ChatFrame {
    pub fn chunk(text: impl Into<String>) -> Self {
        ChatFrame::Chunk { chunk: text.into() }
    }

    pub fn done() -> Self {
        ChatFrame::Done { done: true }
    }

    pub fn error(message: impl Into<String>) -> Self {
        ChatFrame::Error {
            error: message.into(),
        }
    }
}

/// SSE payloads of `/pdf/analyze-stream`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AnalysisFrame {
    Analyzing { message: String },
    Streaming { chunk: String },
    Complete { data: Schedule },
    Error { message: String },
}

/// API root response
#[derive(Debug, Serialize)]
pub struct WelcomeResponse {
    pub message: String,
    pub version: String,
}
