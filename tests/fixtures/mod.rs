//! Sample agent replies for the scripted agent and the live test.
#![allow(dead_code)]

/// A reply shaped like a real agent's: prose, a fenced JSON block and the
/// trailing completion marker.
pub fn agent_reply(input_ref: &str) -> String {
    format!(
        concat!(
            "I found two tables in {input}.\n",
            "```json\n",
            "{{\n",
            "  \"extracted_tables\": [\n",
            "    {{\"table_index\": 0, \"page\": 3, \"table_data\": [\n",
            "      {{\"Item\": \"70-Impostos\", \"Valor 2023\": \"1234.56\"}},\n",
            "      {{\"Item\": \"71-Taxas {{x}}\", \"Valor 2023\": null}}\n",
            "    ]}},\n",
            "    {{\"table_index\": 1, \"page\": 4, \"table_data\": [\n",
            "      {{\"Item\": \"Total\", \"Valor 2023\": \"9.9%\"}}\n",
            "    ]}}\n",
            "  ]\n",
            "}}\n",
            "```\n",
            "JSON EXTRACTED SUCCESSFULLY\n",
        ),
        input = input_ref
    )
}

/// Tables and rows in [`agent_reply`].
pub const REPLY_TABLES: usize = 2;
pub const REPLY_ROWS: usize = 3;

/// A reply without any result object.
pub const REFUSAL_REPLY: &str =
    "I'm sorry, the document appears to be empty. No tables could be extracted.";

/// A reply cut off mid-object.
pub const TRUNCATED_REPLY: &str =
    "{\"extracted_tables\": [{\"table_index\": 0, \"page\": 1, \"table_data\": [{\"a\": \"1\"}";

/// Small document for the live agent test.
pub const LIVE_DOCUMENT: &str = r#"Quarterly budget

| Item       | 2023    | 2022    |
|------------|---------|---------|
| Salaries   | 1.200,00 € | 1.100,00 € |
| Equipment  | 300,50 €   | 410,00 €   |
"#;
