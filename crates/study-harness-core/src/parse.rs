//! Strict decoding of AI responses into [`StudyArtifact`]s.
//!
//! The response must be a JSON object matching the schema the prompt asked
//! for (a bare top-level array of items is also accepted). Markdown code
//! fences are stripped first because models add them despite instructions.
//! Unknown fields are ignored, but every required field must be present and
//! semantically valid: a single bad item rejects the whole response so the
//! orchestrator can ask for a correction.

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

use crate::error::ParseError;
use crate::models::{ArtifactBody, ArtifactType, SegmentSpan, StudyArtifact};

/// Request-level facts stamped onto every parsed artifact.
#[derive(Debug, Clone)]
pub struct ParseContext<'a> {
    pub request_id: &'a str,
    pub source_document_id: &'a str,
    pub span: SegmentSpan,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedArtifacts {
    pub artifacts: Vec<StudyArtifact>,
    /// Topic title, when the model provided one.
    pub topic: Option<String>,
}

#[derive(Deserialize)]
struct RawFlashcard {
    #[serde(alias = "term")]
    front: String,
    #[serde(alias = "definition")]
    back: String,
}

#[derive(Deserialize)]
struct RawAnswer {
    #[serde(rename = "answerText", alias = "answer_text", alias = "text")]
    answer_text: String,
    #[serde(rename = "isCorrect", alias = "is_correct", default)]
    is_correct: bool,
}

#[derive(Deserialize)]
struct RawQuizItem {
    #[serde(alias = "questionText", alias = "question_text")]
    question: String,
    #[serde(default, alias = "options")]
    choices: Option<Vec<String>>,
    #[serde(default, rename = "correctIndex", alias = "correct_index")]
    correct_index: Option<i64>,
    /// Legacy shape: answers carry their own correctness flag.
    #[serde(default)]
    answers: Option<Vec<RawAnswer>>,
    #[serde(default)]
    explanation: Option<String>,
}

#[derive(Deserialize)]
struct RawSection {
    #[serde(alias = "title")]
    heading: String,
    #[serde(alias = "content", alias = "text")]
    body: String,
}

/// Remove a surrounding ```` ``` ```` / ```` ```json ```` fence, if present.
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    // Skip the info string ("json", "JSON", ...), which may share the line
    // with the payload.
    let info_end = rest
        .find(|c: char| !c.is_ascii_alphabetic())
        .unwrap_or(rest.len());
    let rest = rest[info_end..].trim_start();
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

/// Decode `raw` as artifacts of `artifact_type`.
pub fn parse(
    raw: &str,
    artifact_type: ArtifactType,
    ctx: &ParseContext<'_>,
) -> Result<ParsedArtifacts, ParseError> {
    let body = strip_code_fences(raw);
    let value: Value =
        serde_json::from_str(body).map_err(|e| ParseError::NotWellFormed(e.to_string()))?;

    let keys: &[&str] = match artifact_type {
        ArtifactType::Flashcards => &["flashcards", "cards"],
        ArtifactType::Quiz => &["questions", "quiz"],
        ArtifactType::Summary => &["sections", "summary"],
    };
    let (items, topic) = locate_items(&value, keys)?;
    if items.is_empty() {
        return Err(ParseError::EmptyResult);
    }

    let mut bodies = Vec::with_capacity(items.len());
    for (idx, item) in items.iter().enumerate() {
        let body = match artifact_type {
            ArtifactType::Flashcards => decode_flashcard(item),
            ArtifactType::Quiz => decode_quiz_item(item),
            ArtifactType::Summary => decode_section(item),
        }
        .map_err(|msg| ParseError::SchemaMismatch(format!("item {}: {}", idx, msg)))?;
        bodies.push(body);
    }

    let artifacts = bodies
        .into_iter()
        .map(|body| {
            StudyArtifact::new(
                ctx.request_id,
                ctx.source_document_id,
                ctx.span,
                ctx.created_at,
                body,
            )
        })
        .collect();

    Ok(ParsedArtifacts { artifacts, topic })
}

fn locate_items<'v>(
    value: &'v Value,
    keys: &[&str],
) -> Result<(&'v [Value], Option<String>), ParseError> {
    match value {
        Value::Array(items) => Ok((items, None)),
        Value::Object(map) => {
            let topic = map
                .get("topic")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .map(str::to_string);
            let Some((key, found)) = keys.iter().find_map(|k| map.get(*k).map(|v| (*k, v))) else {
                return Err(ParseError::SchemaMismatch(format!(
                    "missing '{}' array",
                    keys[0]
                )));
            };
            match found {
                Value::Array(items) => Ok((items, topic)),
                _ => Err(ParseError::SchemaMismatch(format!(
                    "'{}' must be an array",
                    key
                ))),
            }
        }
        _ => Err(ParseError::SchemaMismatch(
            "top-level value must be an object or array".to_string(),
        )),
    }
}

fn required(field: &str, value: String) -> Result<String, String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        Err(format!("'{}' must not be empty", field))
    } else {
        Ok(trimmed.to_string())
    }
}

fn decode_flashcard(item: &Value) -> Result<ArtifactBody, String> {
    let raw: RawFlashcard = RawFlashcard::deserialize(item).map_err(|e| e.to_string())?;
    Ok(ArtifactBody::Flashcard {
        front: required("front", raw.front)?,
        back: required("back", raw.back)?,
    })
}

fn decode_section(item: &Value) -> Result<ArtifactBody, String> {
    let raw: RawSection = RawSection::deserialize(item).map_err(|e| e.to_string())?;
    Ok(ArtifactBody::SummaryBlock {
        heading: required("heading", raw.heading)?,
        body: required("body", raw.body)?,
    })
}

fn decode_quiz_item(item: &Value) -> Result<ArtifactBody, String> {
    let raw: RawQuizItem = RawQuizItem::deserialize(item).map_err(|e| e.to_string())?;
    let question = required("question", raw.question)?;

    let (choices, index) = match (raw.choices, raw.answers) {
        (Some(choices), _) => {
            let index = raw
                .correct_index
                .ok_or_else(|| "missing field `correctIndex`".to_string())?;
            (choices, index)
        }
        (None, Some(answers)) => {
            let correct: Vec<usize> = answers
                .iter()
                .enumerate()
                .filter(|(_, a)| a.is_correct)
                .map(|(i, _)| i)
                .collect();
            if correct.len() != 1 {
                return Err(format!(
                    "expected exactly one correct answer, found {}",
                    correct.len()
                ));
            }
            let choices = answers.into_iter().map(|a| a.answer_text).collect();
            (choices, correct[0] as i64)
        }
        (None, None) => return Err("missing field `choices`".to_string()),
    };

    if choices.len() < 2 {
        return Err(format!("expected at least 2 choices, found {}", choices.len()));
    }
    let choices = choices
        .into_iter()
        .map(|c| required("choices", c))
        .collect::<Result<Vec<_>, _>>()?;
    if index < 0 || index as usize >= choices.len() {
        return Err(format!(
            "correctIndex {} is out of range for {} choices",
            index,
            choices.len()
        ));
    }

    let explanation = raw
        .explanation
        .map(|e| e.trim().to_string())
        .filter(|e| !e.is_empty());

    Ok(ArtifactBody::QuizItem {
        question,
        choices,
        correct_index: index as usize,
        explanation,
    })
}
