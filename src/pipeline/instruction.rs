use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::pipeline::llm::{
    ChatCompletionError, ChatCompletionRequest, ChatMessage, SharedChatCompletion,
};
use crate::pipeline::{EditAction, EditInstruction, ParsedInstructionSet};

const ENHANCE_SYSTEM_DIRECTIVE: &str = "You rewrite image edit requests. Keep the requested edit \
exactly the same (same action, same objects) but make the wording richer: add concrete, \
photorealistic visual detail about materials, lighting and surroundings for anything being added. \
Answer with the rewritten request only, in one or two sentences, without quotes or commentary.";

const EXTRACT_SYSTEM_DIRECTIVE: &str = "You convert image edit requests into JSON. \
Output one JSON object per line and nothing else: no prose, no markdown, no code fences. \
Each object has exactly these keys: \
\"action\" (\"remove\" or \"replace\"), \
\"object\" (the thing currently in the image), \
\"target\" (the new thing for \"replace\", null for \"remove\"). \
Emit one line per edit, in the order the edits are requested. \
Never mention an object that does not appear in the request.\n\
Examples:\n\
remove tiger\n{\"action\":\"remove\",\"object\":\"tiger\",\"target\":null}\n\
replace car with bus\n{\"action\":\"replace\",\"object\":\"car\",\"target\":\"bus\"}";

#[derive(Debug, Error)]
pub enum InterpreterError {
    #[error("prompt enhancement failed: {0}")]
    Enhance(#[source] ChatCompletionError),
    #[error("instruction extraction failed: {0}")]
    Extract(#[source] ChatCompletionError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterOptions {
    pub enhance_model: String,
    pub extract_model: String,
    pub enhance_temperature: f32,
    pub enhance_max_tokens: u32,
    pub extract_max_tokens: u32,
}

impl Default for InterpreterOptions {
    fn default() -> Self {
        Self {
            enhance_model: String::from("llama-3.1-8b-instant"),
            extract_model: String::from("llama-3.1-8b-instant"),
            enhance_temperature: 0.7,
            enhance_max_tokens: 512,
            extract_max_tokens: 256,
        }
    }
}

/// Turns free text into structured edits via the language model.
///
/// Extraction always decodes at temperature 0 so the same text yields the
/// same instructions; enhancement uses the configured (higher) temperature.
#[derive(Clone)]
pub struct InstructionInterpreter {
    llm: SharedChatCompletion,
    options: InterpreterOptions,
}

impl InstructionInterpreter {
    pub fn new(llm: SharedChatCompletion, options: InterpreterOptions) -> Self {
        Self { llm, options }
    }

    pub fn enhance_prompt(&self, raw: &str) -> Result<String, InterpreterError> {
        let request = ChatCompletionRequest {
            model: self.options.enhance_model.clone(),
            messages: vec![
                ChatMessage::system(ENHANCE_SYSTEM_DIRECTIVE),
                ChatMessage::user(raw),
            ],
            temperature: self.options.enhance_temperature,
            max_tokens: self.options.enhance_max_tokens,
            top_p: 1.0,
            stream: false,
        };
        let enhanced = self
            .llm
            .complete(&request)
            .map_err(InterpreterError::Enhance)?
            .trim()
            .to_string();
        info!(raw, enhanced = enhanced.as_str(), "enhanced edit prompt");
        Ok(enhanced)
    }

    pub fn parse_instructions(&self, text: &str) -> Result<ParsedInstructionSet, InterpreterError> {
        let request = ChatCompletionRequest {
            model: self.options.extract_model.clone(),
            messages: vec![
                ChatMessage::system(EXTRACT_SYSTEM_DIRECTIVE),
                ChatMessage::user(text),
            ],
            temperature: 0.0,
            max_tokens: self.options.extract_max_tokens,
            top_p: 1.0,
            stream: false,
        };
        let response = self
            .llm
            .complete(&request)
            .map_err(InterpreterError::Extract)?;
        debug!(response = response.as_str(), "instruction extraction response");
        let parsed = extract_instruction_lines(response.as_str());
        info!(count = parsed.len(), "parsed edit instructions");
        Ok(parsed)
    }
}

#[derive(Debug, Deserialize)]
struct WireInstruction {
    #[serde(default)]
    action: Option<String>,
    #[serde(default)]
    object: Option<String>,
    #[serde(default)]
    target: Option<String>,
}

/// Lenient line scanner over model output. Only lines starting with `{` are
/// candidates; candidates that are not valid JSON, or that do not describe a
/// complete edit, are dropped. Order is preserved.
pub fn extract_instruction_lines(response: &str) -> ParsedInstructionSet {
    let mut out = Vec::new();
    for line in response.lines() {
        let candidate = line.trim();
        if !candidate.starts_with('{') {
            continue;
        }
        let wire = match serde_json::from_str::<WireInstruction>(candidate) {
            Ok(wire) => wire,
            Err(error) => {
                debug!(line = candidate, %error, "dropping non-JSON candidate line");
                continue;
            }
        };
        match instruction_from_wire(wire) {
            Some(instruction) => out.push(instruction),
            None => warn!(line = candidate, "dropping incomplete edit instruction"),
        }
    }
    out
}

fn instruction_from_wire(wire: WireInstruction) -> Option<EditInstruction> {
    let action = EditAction::parse(wire.action.as_deref()?)?;
    let object = non_empty(wire.object)?;
    match action {
        EditAction::Remove => Some(EditInstruction::remove(object)),
        EditAction::Replace => Some(EditInstruction::replace(object, non_empty(wire.target)?)),
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty() && !v.eq_ignore_ascii_case("null"))
}
