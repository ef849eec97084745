use crate::models::extraction::ExtractionOutput;

/// Marker the default instructions ask the agent to print after the JSON.
pub const SUCCESS_MARKER: &str = "JSON EXTRACTED SUCCESSFULLY";

/// Structural validation of a settled agent buffer.
///
/// Agents wrap their JSON in prose, code fences and trailing markers. The
/// validator finds the object carrying `required_key`, parses it, and checks
/// the key holds an array. The contents of that array are not interpreted.
#[derive(Debug, Clone)]
pub struct OutputValidator {
    required_key: String,
}

impl OutputValidator {
    pub fn new(required_key: impl Into<String>) -> Self {
        Self {
            required_key: required_key.into(),
        }
    }

    pub fn required_key(&self) -> &str {
        &self.required_key
    }

    pub fn validate(&self, buffer: &str) -> Result<ExtractionOutput, OutputError> {
        let cleaned = strip_fences(&buffer.replace(SUCCESS_MARKER, ""));
        let quoted_key = format!("\"{}\"", self.required_key);

        // Prose may quote the key before the object itself; the last
        // candidate's error is reported when none of them parse.
        let mut last_err = OutputError::MissingKey(self.required_key.clone());
        for (key_pos, _) in cleaned.match_indices(&quoted_key) {
            match self.parse_around(&cleaned, key_pos) {
                Ok(output) => return Ok(output),
                Err(e) => last_err = e,
            }
        }
        Err(last_err)
    }

    fn parse_around(&self, text: &str, key_pos: usize) -> Result<ExtractionOutput, OutputError> {
        // Nearest opening brace before the key whose object encloses it.
        let mut search_end = key_pos;
        let object = loop {
            let start = text[..search_end].rfind('{').ok_or(OutputError::NoObject)?;
            match matching_brace(text, start) {
                Some(end) if end > key_pos => break &text[start..=end],
                _ => search_end = start,
            }
            if search_end == 0 {
                return Err(OutputError::Unbalanced);
            }
        };

        let payload: serde_json::Value = serde_json::from_str(object)?;
        let tables = payload
            .get(&self.required_key)
            .ok_or_else(|| OutputError::MissingKey(self.required_key.clone()))?
            .as_array()
            .ok_or_else(|| OutputError::NotAnArray(self.required_key.clone()))?;

        let row_count = tables
            .iter()
            .filter_map(|t| t.get("table_data").and_then(|rows| rows.as_array()))
            .map(Vec::len)
            .sum();

        Ok(ExtractionOutput {
            table_count: tables.len(),
            row_count,
            payload,
        })
    }
}

/// Drop Markdown code fence lines.
fn strip_fences(text: &str) -> String {
    text.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
}

impl Default for OutputValidator {
    fn default() -> Self {
        Self::new("extracted_tables")
    }
}

/// Index of the `}` closing the object that opens at `start`, skipping braces
/// inside JSON strings.
fn matching_brace(text: &str, start: usize) -> Option<usize> {
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, ch) in text[start..].char_indices() {
        if in_string {
            match ch {
                _ if escaped => escaped = false,
                '\\' => escaped = true,
                '"' => in_string = false,
                _ => {}
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            '{' => depth += 1,
            '}' => {
                depth = depth.checked_sub(1)?;
                if depth == 0 {
                    return Some(start + offset);
                }
            }
            _ => {}
        }
    }
    None
}

#[derive(Debug, thiserror::Error)]
pub enum OutputError {
    #[error("Output does not mention \"{0}\"")]
    MissingKey(String),

    #[error("No JSON object found around the result key")]
    NoObject,

    #[error("Result object has unbalanced braces (output truncated?)")]
    Unbalanced,

    #[error("Result object is not valid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("\"{0}\" is not an array")]
    NotAnArray(String),
}
