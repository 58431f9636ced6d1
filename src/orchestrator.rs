//! Per-request drivers tying the LLM client to the extractor and parsers.

use std::collections::VecDeque;
use std::sync::{Arc, LazyLock};

use chrono::{DateTime, FixedOffset, Local};
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use regex::Regex;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{AppError, SAMPLE_LEN};
use crate::extractor::{FieldExtractor, StreamBuffer};
use crate::llm::{LlmClient, TokenStream, UserContent};
use crate::models::{AnalysisFrame, ChatAction, ChatFrame, ChatReply, HistoryEntry, Schedule};
use crate::prompts;

static JSON_SPAN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)\{.*\}").expect("JSON span pattern is a valid regex"));

const CHAT_FALLBACK_REPLY: &str =
    "I apologize, but I encountered an issue processing your request. Please try again.";

fn now() -> DateTime<FixedOffset> {
    Local::now().fixed_offset()
}

/// Flattens prior turns plus the new message into one transcript.
/// Malformed history is ignored.
pub fn conversation_context(history: Option<&str>, message: &str) -> String {
    let mut context = String::new();
    if let Some(raw) = history.filter(|h| !h.trim().is_empty()) {
        match serde_json::from_str::<Vec<HistoryEntry>>(raw) {
            Ok(entries) => {
                for entry in entries {
                    let role = if entry.is_user { "User" } else { "Assistant" };
                    context.push_str(&format!("{role}: {}\n", entry.text));
                }
            }
            Err(err) => debug!(error = %err, "ignoring malformed conversation history"),
        }
    }
    context.push_str(&format!("User: {message}\n"));
    context
}

/// Parses model output that should be a JSON object, tolerating prose
/// around it: the span from the first `{` to the last `}` wins.
pub fn parse_model_json<T: DeserializeOwned>(raw: &str) -> Result<T, AppError> {
    let Some(span) = JSON_SPAN.find(raw) else {
        warn!(
            sample = %raw.chars().take(SAMPLE_LEN).collect::<String>(),
            "model output contains no JSON object"
        );
        return Err(AppError::malformed_output(raw));
    };

    serde_json::from_str(span.as_str()).map_err(|err| {
        warn!(
            error = %err,
            sample = %raw.chars().take(SAMPLE_LEN).collect::<String>(),
            "model returned invalid JSON"
        );
        AppError::malformed_output(raw)
    })
}

/// Normalizes a non-streamed chat reply. Only `response` and `ics_data`
/// reach the client; non-JSON output becomes a plain chat message.
pub fn normalize_chat_reply(raw: &str) -> ChatReply {
    let parsed: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(_) => return ChatReply::chat(raw),
    };

    let response = match parsed.get("response").and_then(Value::as_str) {
        Some(text) if !text.is_empty() => text.to_string(),
        _ => return ChatReply::chat(CHAT_FALLBACK_REPLY),
    };

    let mut reply = ChatReply::chat(response);
    if parsed.get("action").and_then(Value::as_str) == Some("generate_ics") {
        let ics_data = parsed
            .get("ics_data")
            .filter(|data| data.as_object().is_some_and(|obj| !obj.is_empty()));
        if let Some(data) = ics_data {
            match serde_json::from_value::<Schedule>(data.clone()) {
                Ok(schedule) => {
                    reply.action = ChatAction::GenerateIcs;
                    reply.ics_data = Some(schedule);
                }
                Err(err) => warn!(error = %err, "dropping ics_data that is not a schedule"),
            }
        }
    }
    reply
}

struct ChatStreamState {
    tokens: TokenStream,
    extractor: FieldExtractor,
    pending: VecDeque<ChatFrame>,
    finished: bool,
    request_id: Uuid,
}

/// Turns raw model tokens into chat frames: live `chunk`s of the
/// `response` field, then `ics_data` (if any) and `done`.
///
/// A transport error yields one `error` frame and ends the stream without
/// finalization.
pub fn chat_frames(tokens: TokenStream, request_id: Uuid) -> BoxStream<'static, ChatFrame> {
    let state = ChatStreamState {
        tokens,
        extractor: FieldExtractor::for_response(),
        pending: VecDeque::new(),
        finished: false,
        request_id,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Some((frame, state));
            }
            if state.finished {
                return None;
            }
            match state.tokens.next().await {
                Some(Ok(fragment)) => {
                    let chunks = state.extractor.feed(&fragment);
                    state.pending.extend(chunks.into_iter().map(ChatFrame::chunk));
                }
                Some(Err(err)) => {
                    warn!(request_id = %state.request_id, error = %err, "chat stream aborted");
                    state.pending.push_back(ChatFrame::error(err.to_string()));
                    state.finished = true;
                }
                None => {
                    if let Some(schedule) = state.extractor.finalize() {
                        info!(
                            request_id = %state.request_id,
                            events = schedule.events.len(),
                            "chat stream produced calendar data"
                        );
                        state.pending.push_back(ChatFrame::IcsData { ics_data: schedule });
                    }
                    debug!(
                        request_id = %state.request_id,
                        chars = state.extractor.buffer().len(),
                        extractor = ?state.extractor.state(),
                        "chat stream complete"
                    );
                    state.pending.push_back(ChatFrame::done());
                    state.finished = true;
                }
            }
        }
    })
    .boxed()
}

struct AnalysisStreamState {
    tokens: TokenStream,
    buffer: StreamBuffer,
    finished: bool,
}

/// Relays raw model tokens as `streaming` frames and closes with the
/// parsed schedule, or an `error` frame if it does not parse.
pub fn analysis_frames(tokens: TokenStream) -> BoxStream<'static, AnalysisFrame> {
    let state = AnalysisStreamState {
        tokens,
        buffer: StreamBuffer::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        if state.finished {
            return None;
        }
        let frame = match state.tokens.next().await {
            Some(Ok(fragment)) => {
                state.buffer.push(&fragment);
                AnalysisFrame::Streaming { chunk: fragment }
            }
            Some(Err(err)) => {
                state.finished = true;
                AnalysisFrame::Error {
                    message: format!("Error analyzing PDF: {err}"),
                }
            }
            None => {
                state.finished = true;
                if state.buffer.is_empty() {
                    warn!("analysis stream ended without any model output");
                }
                match parse_model_json::<Schedule>(state.buffer.as_str()) {
                    Ok(data) => AnalysisFrame::Complete { data },
                    Err(err) => AnalysisFrame::Error {
                        message: err.to_string(),
                    },
                }
            }
        };
        Some((frame, state))
    })
    .boxed()
}

/// Schedule assistant chat, one-shot and streamed.
#[derive(Clone)]
pub struct ChatOrchestrator {
    llm: Arc<dyn LlmClient>,
}

impl ChatOrchestrator {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn reply(&self, message: &str, history: Option<&str>) -> Result<ChatReply, AppError> {
        let context = conversation_context(history, message);
        let raw = self
            .llm
            .complete(&prompts::chat_system_prompt(now()), UserContent::Text(context))
            .await?;
        Ok(normalize_chat_reply(&raw))
    }

    pub fn reply_stream(&self, message: &str, history: Option<&str>) -> BoxStream<'static, ChatFrame> {
        let llm = Arc::clone(&self.llm);
        let context = conversation_context(history, message);
        let system_prompt = prompts::chat_system_prompt(now());
        let request_id = Uuid::new_v4();
        info!(%request_id, "starting chat stream");

        stream::once(async move { llm.stream(&system_prompt, &context).await })
            .flat_map(move |opened| match opened {
                Ok(tokens) => chat_frames(tokens, request_id),
                Err(err) => {
                    warn!(%request_id, error = %err, "could not open chat stream");
                    stream::iter([ChatFrame::error(err.to_string())]).boxed()
                }
            })
            .boxed()
    }
}

/// Syllabus extraction from images and PDF text.
#[derive(Clone)]
pub struct SyllabusAnalyzer {
    llm: Arc<dyn LlmClient>,
}

impl SyllabusAnalyzer {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self { llm }
    }

    pub async fn analyze_image(&self, image_url: String) -> Result<Schedule, AppError> {
        let raw = self
            .llm
            .complete(
                &prompts::syllabus_image_prompt(now()),
                UserContent::Vision {
                    prompt: prompts::SYLLABUS_IMAGE_USER_PROMPT.to_string(),
                    image_url,
                },
            )
            .await?;
        debug!(chars = raw.len(), "vision reply received");
        parse_model_json(&raw)
    }

    pub async fn analyze_pdf_text(&self, text: String) -> Result<Schedule, AppError> {
        let raw = self
            .llm
            .complete(&prompts::pdf_exam_prompt(now()), UserContent::Text(text))
            .await?;
        parse_model_json(&raw)
    }

    pub fn analyze_pdf_text_stream(&self, text: String) -> BoxStream<'static, AnalysisFrame> {
        let llm = Arc::clone(&self.llm);
        let system_prompt = prompts::pdf_exam_prompt(now());
        let opening = AnalysisFrame::Analyzing {
            message: "Analyzing PDF content...".to_string(),
        };

        let analysis = stream::once(async move { llm.stream(&system_prompt, &text).await })
            .flat_map(|opened| match opened {
                Ok(tokens) => analysis_frames(tokens),
                Err(err) => stream::iter([AnalysisFrame::Error {
                    message: format!("Error analyzing PDF: {err}"),
                }])
                .boxed(),
            });

        stream::iter([opening]).chain(analysis).boxed()
    }
}


#[cfg(test)]
mod tests {
    use super::testing::StubLlm;
    use super::*;

    const ICS_REPLY: &[&str] = &[
        r#"{"action": "generate_ics", "resp"#,
        r#"onse": "Added \"Dentist\" "#,
        r#"on Sep 12.", "ics_data": {"course_name": "Custom Schedule", "course_code": "CUSTOM", "#,
        r#""events": [{"title": "Dentist", "start_time": "2025-09-12T15:00:00", "end_time": "2025-09-12T16:00:00"}]}}"#,
    ];

    #[tokio::test]
    async fn test_chat_stream_emits_chunks_then_ics_then_done() {
        let orchestrator = ChatOrchestrator::new(Arc::new(StubLlm::streaming(ICS_REPLY)));
        let frames: Vec<ChatFrame> = orchestrator.reply_stream("book it", None).collect().await;

        let text: String = frames
            .iter()
            .filter_map(|f| match f {
                ChatFrame::Chunk { chunk } => Some(chunk.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, r#"Added \"Dentist\" on Sep 12."#);

        let tail = &frames[frames.len() - 2..];
        match &tail[0] {
            ChatFrame::IcsData { ics_data } => {
                assert_eq!(ics_data.course_code.as_deref(), Some("CUSTOM"));
                assert_eq!(ics_data.events[0].title, "Dentist");
            }
            other => panic!("expected ics_data frame, got {other:?}"),
        }
        assert_eq!(tail[1], ChatFrame::done());
    }

    #[tokio::test]
    async fn test_chat_stream_plain_text_has_no_chunks() {
        let llm = StubLlm::streaming(&["Sorry, ", "I can't help."]);
        let frames: Vec<ChatFrame> = ChatOrchestrator::new(Arc::new(llm))
            .reply_stream("hi", None)
            .collect()
            .await;
        assert_eq!(frames, vec![ChatFrame::done()]);
    }

    #[tokio::test]
    async fn test_chat_stream_transport_error_keeps_partial_text() {
        let mut llm = StubLlm::streaming(ICS_REPLY);
        llm.fail_after = Some(2);
        let frames: Vec<ChatFrame> = ChatOrchestrator::new(Arc::new(llm))
            .reply_stream("book it", None)
            .collect()
            .await;

        assert_eq!(
            frames,
            vec![
                ChatFrame::chunk(r#"Added \"Dentist\" "#),
                ChatFrame::error("LLM stream interrupted: connection reset"),
            ]
        );
    }

    #[tokio::test]
    async fn test_chat_stream_open_failure() {
        let llm = StubLlm {
            refuse: true,
            ..StubLlm::default()
        };
        let frames: Vec<ChatFrame> = ChatOrchestrator::new(Arc::new(llm))
            .reply_stream("hi", None)
            .collect()
            .await;
        assert_eq!(frames.len(), 1);
        assert!(matches!(frames[0], ChatFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_chat_reply_uses_history_and_now() {
        let llm = Arc::new(StubLlm::replying(r#"{"action": "chat", "response": "Noted."}"#));
        let orchestrator = ChatOrchestrator::new(llm.clone());
        let history = r#"[{"text": "hello", "isUser": true}, {"text": "Hi!", "isUser": false}]"#;

        let reply = orchestrator.reply("move my exam", Some(history)).await.unwrap();
        assert_eq!(reply, ChatReply::chat("Noted."));

        let seen = llm.seen.lock().unwrap();
        let (system_prompt, user) = &seen[0];
        assert!(system_prompt.contains("Current datetime"));
        assert_eq!(user, "User: hello\nAssistant: Hi!\nUser: move my exam\n");
    }

    #[test]
    fn test_conversation_context_ignores_bad_history() {
        assert_eq!(conversation_context(Some("{oops"), "hi"), "User: hi\n");
        assert_eq!(conversation_context(None, "hi"), "User: hi\n");
    }

    #[test]
    fn test_normalize_chat_reply() {
        assert_eq!(normalize_chat_reply("just text"), ChatReply::chat("just text"));
        assert_eq!(
            normalize_chat_reply(r#"{"action": "chat"}"#),
            ChatReply::chat(CHAT_FALLBACK_REPLY)
        );

        let reply = normalize_chat_reply(
            r#"{"action": "generate_ics", "response": "Here you go", "ics_data": {"events": [{"title": "Quiz", "start_time": "2025-10-01T09:00:00", "end_time": "2025-10-01T10:00:00"}]}}"#,
        );
        assert_eq!(reply.action, ChatAction::GenerateIcs);
        assert_eq!(reply.ics_data.unwrap().events.len(), 1);

        let without_data =
            normalize_chat_reply(r#"{"action": "generate_ics", "response": "Hmm", "ics_data": {}}"#);
        assert_eq!(without_data, ChatReply::chat("Hmm"));
    }

    #[test]
    fn test_parse_model_json_tolerates_prose() {
        let raw = "Here is the schedule:\n```json\n{\"course_name\": \"Physics\", \"events\": []}\n```";
        let schedule: Schedule = parse_model_json(raw).unwrap();
        assert_eq!(schedule.course_name(), "Physics");
    }

    #[test]
    fn test_parse_model_json_failure_carries_sample() {
        let raw = format!("no json here {}", "x".repeat(400));
        match parse_model_json::<Schedule>(&raw) {
            Err(AppError::MalformedModelOutput { sample }) => {
                assert_eq!(sample.chars().count(), SAMPLE_LEN);
                assert!(sample.starts_with("no json here"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pdf_stream_frames() {
        let llm = StubLlm::streaming(&[r#"{"course_name": "Chem", "#, r#""events": []}"#]);
        let frames: Vec<AnalysisFrame> = SyllabusAnalyzer::new(Arc::new(llm))
            .analyze_pdf_text_stream("syllabus text".to_string())
            .collect()
            .await;

        assert_eq!(frames.len(), 4);
        assert!(matches!(frames[0], AnalysisFrame::Analyzing { .. }));
        assert_eq!(
            frames[1],
            AnalysisFrame::Streaming {
                chunk: r#"{"course_name": "Chem", "#.to_string()
            }
        );
        match &frames[3] {
            AnalysisFrame::Complete { data } => assert_eq!(data.course_name(), "Chem"),
            other => panic!("expected complete frame, got {other:?}"),
        }
    }

    #[test]
    fn test_parse_model_json_without_closing_brace() {
        let raw = r#"} reversed { "course_name": "Bio""#;
        assert!(matches!(
            parse_model_json::<Schedule>(raw),
            Err(AppError::MalformedModelOutput { .. })
        ));
    }

    #[tokio::test]
    async fn test_pdf_stream_without_output() {
        let llm = StubLlm::streaming(&[]);
        let frames: Vec<AnalysisFrame> = SyllabusAnalyzer::new(Arc::new(llm))
            .analyze_pdf_text_stream("syllabus text".to_string())
            .collect()
            .await;
        assert_eq!(frames.len(), 2);
        assert!(matches!(frames[0], AnalysisFrame::Analyzing { .. }));
        assert!(matches!(frames[1], AnalysisFrame::Error { .. }));
    }

    #[tokio::test]
    async fn test_pdf_stream_invalid_json() {
        let llm = StubLlm::streaming(&["I could not find any exams."]);
        let frames: Vec<AnalysisFrame> = SyllabusAnalyzer::new(Arc::new(llm))
            .analyze_pdf_text_stream("syllabus text".to_string())
            .collect()
            .await;
        match frames.last() {
            Some(AnalysisFrame::Error { message }) => {
                assert!(message.starts_with("AI returned invalid JSON format."));
            }
            other => panic!("expected error frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_analyze_image_sends_data_url() {
        let llm = Arc::new(StubLlm::replying(r#"{"course_code": "ART-1", "events": []}"#));
        let schedule = SyllabusAnalyzer::new(llm.clone())
            .analyze_image("data:image/png;base64,AAAA".to_string())
            .await
            .unwrap();
        assert_eq!(schedule.course_code(), "ART-1");
        let seen = llm.seen.lock().unwrap();
        assert!(seen[0].1.ends_with("data:image/png;base64,AAAA"));
    }
}
