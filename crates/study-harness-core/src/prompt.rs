//! Prompt construction.
//!
//! A prompt is the instruction header (task, output schema, rules) followed
//! by as many chunks as fit in the token budget. Chunks that do not fit are
//! reported in [`AiPrompt::dropped_chunk_ids`] and the prompt is marked
//! truncated; the orchestrator sends them in a follow-up batch.
//!
//! A regeneration prompt re-masters an existing quiz instead: the prior
//! questions are embedded as JSON in place of source text.

use serde_json::json;
use sha2::{Digest, Sha256};

use crate::models::{AiPrompt, ArtifactBody, ArtifactType, GenerationOptions, StudyArtifact, TextSegment};
use crate::normalize::estimate_tokens;

const FLASHCARD_SCHEMA: &str = r#"{
  "flashcards": [
    { "front": "question or term (string, non-empty)", "back": "answer or definition (string, non-empty)" }
  ]
}"#;

const QUIZ_SCHEMA: &str = r#"{
  "topic": "short topic title, at most 5 words (string)",
  "questions": [
    {
      "question": "question text (string, non-empty)",
      "choices": ["option A", "option B", "option C", "option D"],
      "correctIndex": 0,
      "explanation": "why the correct option is right (string)"
    }
  ]
}"#;

const SUMMARY_SCHEMA: &str = r#"{
  "topic": "short topic title, at most 5 words (string)",
  "sections": [
    { "heading": "section heading (string, non-empty)", "body": "summary paragraph (string, non-empty)" }
  ]
}"#;

/// Renders bounded, schema-constrained prompts.
#[derive(Debug, Clone, Copy)]
pub struct PromptBuilder {
    token_budget: usize,
}

impl PromptBuilder {
    pub fn new(token_budget: usize) -> Self {
        Self { token_budget }
    }

    pub fn token_budget(&self) -> usize {
        self.token_budget
    }

    /// Build the prompt for the first batch of `chunks`.
    pub fn build(
        &self,
        request_id: &str,
        chunks: &[TextSegment],
        artifact_type: ArtifactType,
        options: &GenerationOptions,
    ) -> AiPrompt {
        let header = render_header(artifact_type, options, None);
        self.assemble(request_id, header, chunks, false)
    }

    /// Build the stricter prompt sent after a response failed validation.
    pub fn build_correction(
        &self,
        request_id: &str,
        chunks: &[TextSegment],
        artifact_type: ArtifactType,
        options: &GenerationOptions,
        validation_error: &str,
    ) -> AiPrompt {
        let header = render_header(artifact_type, options, Some(validation_error));
        self.assemble(request_id, header, chunks, true)
    }

    /// Build a prompt asking for a new quiz on the concepts of `prior`
    /// quiz items. Items that do not fit the budget are dropped from the
    /// tail; the first is always sent.
    pub fn build_regeneration(
        &self,
        request_id: &str,
        prior: &[StudyArtifact],
        topic: Option<&str>,
        options: &GenerationOptions,
        validation_error: Option<&str>,
    ) -> AiPrompt {
        let mut rendered = render_regeneration_header(topic, options, validation_error);
        rendered.push_str("\nINPUT QUESTIONS JSON:\n[\n");
        let mut used = estimate_tokens(&rendered) + 1;

        let items: Vec<String> = prior.iter().filter_map(render_prior_question).collect();
        let mut included = 0;
        for item in &items {
            let cost = estimate_tokens(item) + 1;
            if included > 0 && used + cost > self.token_budget {
                break;
            }
            if included > 0 {
                rendered.push_str(",\n");
            }
            rendered.push_str("  ");
            rendered.push_str(item);
            used += cost;
            included += 1;
        }
        rendered.push_str("\n]\n");

        AiPrompt {
            prompt_id: prompt_id(request_id, &rendered),
            request_id: request_id.to_string(),
            rendered_text: rendered,
            token_budget: self.token_budget,
            truncated: included < items.len(),
            included_chunk_ids: Vec::new(),
            dropped_chunk_ids: Vec::new(),
            correction: validation_error.is_some(),
        }
    }

    fn assemble(
        &self,
        request_id: &str,
        header: String,
        chunks: &[TextSegment],
        correction: bool,
    ) -> AiPrompt {
        let mut rendered = header;
        rendered.push_str("\nSOURCE TEXT:\n");
        let mut used = estimate_tokens(&rendered);

        let mut included = Vec::new();
        let mut dropped = Vec::new();
        for chunk in chunks {
            let block = render_chunk(chunk);
            let cost = estimate_tokens(&block);
            // The first chunk is always sent so every batch makes progress.
            if dropped.is_empty() && (included.is_empty() || used + cost <= self.token_budget) {
                rendered.push_str(&block);
                used += cost;
                included.push(chunk.segment_id.clone());
            } else {
                dropped.push(chunk.segment_id.clone());
            }
        }

        AiPrompt {
            prompt_id: prompt_id(request_id, &rendered),
            request_id: request_id.to_string(),
            rendered_text: rendered,
            token_budget: self.token_budget,
            truncated: !dropped.is_empty(),
            included_chunk_ids: included,
            dropped_chunk_ids: dropped,
            correction,
        }
    }
}

fn prompt_id(request_id: &str, rendered: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    hasher.update([0u8]);
    hasher.update(rendered.as_bytes());
    let mut id = format!("{:x}", hasher.finalize());
    id.truncate(16);
    id
}

fn correction_preamble(validation_error: Option<&str>) -> String {
    let mut out = String::new();
    if let Some(err) = validation_error {
        out.push_str("Your previous response was rejected because it did not match the required format.\n");
        out.push_str(&format!("Validation error: {}\n", err));
        out.push_str("Try again. This time return ONLY the JSON object, exactly as specified.\n\n");
    }
    out
}

fn render_header(
    artifact_type: ArtifactType,
    options: &GenerationOptions,
    validation_error: Option<&str>,
) -> String {
    let mut out = correction_preamble(validation_error);

    let difficulty = options.difficulty.as_str();
    let (task, schema) = match artifact_type {
        ArtifactType::Flashcards => (
            format!(
                "Create {} flashcards at {} difficulty from the source text. \
                 Each card tests one fact or concept found in the text.",
                options.item_count, difficulty
            ),
            FLASHCARD_SCHEMA,
        ),
        ArtifactType::Quiz => (
            format!(
                "Create {} multiple-choice quiz questions at {} difficulty from the source text. \
                 Each question has exactly 4 choices and exactly one correct answer; \
                 correctIndex is the 0-based index of the correct choice.",
                options.item_count, difficulty
            ),
            QUIZ_SCHEMA,
        ),
        ArtifactType::Summary => (
            format!(
                "Summarize the source text as at most {} sections at {} reading level. \
                 Each section has a heading and a short paragraph.",
                options.item_count, difficulty
            ),
            SUMMARY_SCHEMA,
        ),
    };

    out.push_str("You are generating study material for a student.\n");
    out.push_str("TASK: ");
    out.push_str(&task);
    out.push_str("\n\nOUTPUT SCHEMA:\n");
    out.push_str(schema);
    out.push_str("\n\nRULES:\n");
    out.push_str("- Respond with ONLY valid JSON matching the schema above.\n");
    out.push_str("- Do not wrap the JSON in markdown code fences and do not add any commentary.\n");
    out.push_str("- Use only facts stated in the source text.\n");
    out.push_str("- Every string field must be non-empty.\n");
    out
}

fn render_regeneration_header(
    topic: Option<&str>,
    options: &GenerationOptions,
    validation_error: Option<&str>,
) -> String {
    let mut out = correction_preamble(validation_error);
    out.push_str("You are re-mastering a quiz for a student. You are given the questions of an earlier quiz.\n");
    out.push_str(&format!(
        "TASK: Create a NEW quiz of {} multiple-choice questions at {} difficulty, based strictly on \
         the concepts covered by the input questions. Each question has exactly 4 choices and exactly \
         one correct answer; correctIndex is the 0-based index of the correct choice.",
        options.item_count,
        options.difficulty.as_str()
    ));
    out.push_str("\n\nOUTPUT SCHEMA:\n");
    out.push_str(QUIZ_SCHEMA);
    out.push_str("\n\nRULES:\n");
    out.push_str("- Respond with ONLY valid JSON matching the schema above.\n");
    out.push_str("- Do not wrap the JSON in markdown code fences and do not add any commentary.\n");
    out.push_str("- Do not copy the input questions. Rephrase them, turn them into scenarios, or ask about the same concept from a different angle.\n");
    out.push_str("- Do not introduce topics the input questions do not cover.\n");
    match topic {
        Some(topic) => out.push_str(&format!("- Keep the topic title \"{}\".\n", topic)),
        None => out.push_str("- Keep the topic title of the input questions.\n"),
    }
    out.push_str("- Every string field must be non-empty.\n");
    out
}

/// A prior quiz item in the output schema's shape; other artifacts are skipped.
fn render_prior_question(artifact: &StudyArtifact) -> Option<String> {
    match &artifact.body {
        ArtifactBody::QuizItem {
            question,
            choices,
            correct_index,
            explanation,
        } => Some(
            json!({
                "question": question,
                "choices": choices,
                "correctIndex": correct_index,
                "explanation": explanation.as_deref().unwrap_or(""),
            })
            .to_string(),
        ),
        _ => None,
    }
}

fn render_chunk(chunk: &TextSegment) -> String {
    let note = if chunk.provenance.low_confidence {
        " (low OCR confidence)"
    } else {
        ""
    };
    format!(
        "\n[chunk {} | {}{}]\n{}\n",
        chunk.ordinal, chunk.provenance.locator, note, chunk.text
    )
}
