use std::path::Path;

use crate::services::output::SUCCESS_MARKER;

/// Instructions sent with every submission unless `INSTRUCTIONS_FILE` is set.
pub fn default_instructions() -> String {
    format!(
        r#"You convert the tables in the attached document into JSON.

Respond with a single JSON object of this shape:

{{
  "extracted_tables": [
    {{
      "table_index": 0,
      "page": 1,
      "table_data": [
        {{"<header 1>": "<value>", "<header 2>": "<value>"}}
      ]
    }}
  ]
}}

Rules:
- Column names come from the first row of the table that has text in it.
  Never invent column names.
- One object per data row, keyed by column name.
- Keep numbers as strings. Drop currency symbols and thousands separators
  and use "." as the decimal separator.
- Empty cells become null.
- If a cell holds several lines that line up with several lines in its
  neighbours, emit one row per line.

When the JSON is complete, finish with this line on its own:

{SUCCESS_MARKER}"#
    )
}

/// Read instructions from `path`, or fall back to the built-in text.
pub async fn load(path: Option<&Path>) -> std::io::Result<String> {
    match path {
        Some(path) => {
            let text = tokio::fs::read_to_string(path).await?;
            tracing::info!(path = %path.display(), bytes = text.len(), "Loaded agent instructions");
            Ok(text)
        }
        None => Ok(default_instructions()),
    }
}
