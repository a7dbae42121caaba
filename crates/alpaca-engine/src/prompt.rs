//! Caller prompts and the instruction template they are wrapped in.
//!
//! The template format:
//! ```text
//! Below is an instruction that describes a task. Write a response that appropriately completes the request.
//!
//! ### Instruction:
//!
//! <caller text>
//!
//! ### Response:
//! ```

use crate::ValidationError;

/// Text placed before the caller's instruction.
pub const ALPACA_PREFIX: &str = "Below is an instruction that describes a task. \
Write a response that appropriately completes the request.\n\n\
### Instruction:\n\n";

/// Text placed after the caller's instruction.
pub const ALPACA_SUFFIX: &str = "\n\n### Response:";

const PLACEHOLDER: &str = "{instruction}";

/// Non-empty caller-supplied text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt(String);

impl Prompt {
    /// Wrap caller text. Whitespace-only text counts as empty.
    pub fn new(text: impl Into<String>) -> Result<Self, ValidationError> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(ValidationError::EmptyPrompt);
        }
        Ok(Self(text))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<str> for Prompt {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Fixed text around the caller's prompt.
///
/// Rendering is a single split at the first placeholder, so the caller's
/// text is inserted verbatim and never re-scanned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PromptTemplate {
    prefix: String,
    suffix: String,
}

impl PromptTemplate {
    /// Build a template from text containing `{instruction}` exactly once.
    pub fn new(template: &str) -> Result<Self, ValidationError> {
        let (prefix, suffix) =
            template
                .split_once(PLACEHOLDER)
                .ok_or(ValidationError::OutOfRange {
                    field: "template",
                    value: template.to_string(),
                    expected: "text containing {instruction}",
                })?;
        if suffix.contains(PLACEHOLDER) {
            return Err(ValidationError::OutOfRange {
                field: "template",
                value: template.to_string(),
                expected: "exactly one {instruction}",
            });
        }
        Ok(Self {
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
        })
    }

    /// The instruction-following template the answer endpoint uses.
    pub fn alpaca() -> Self {
        Self {
            prefix: ALPACA_PREFIX.to_string(),
            suffix: ALPACA_SUFFIX.to_string(),
        }
    }

    pub fn render(&self, prompt: &Prompt) -> String {
        let mut out =
            String::with_capacity(self.prefix.len() + prompt.len() + self.suffix.len());
        out.push_str(&self.prefix);
        out.push_str(prompt.as_str());
        out.push_str(&self.suffix);
        out
    }
}

impl Default for PromptTemplate {
    fn default() -> Self {
        Self::alpaca()
    }
}
