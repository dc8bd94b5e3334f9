//! Agent I/O contract
//!
//! The instruction sent to the agent ends with an output contract asking it
//! to print one JSON result between two sentinel lines. `ResultScanner`
//! finds that block in output that arrives in arbitrary fragments.

use memento_core::task::{Task, TaskResult};

/// Line opening the result block
pub const RESULT_START: &str = "<<<MEMENTO_RESULT_START>>>";
/// Line closing the result block
pub const RESULT_END: &str = "<<<MEMENTO_RESULT_END>>>";

/// Build the full instruction text for a task
pub fn build_instruction(task: &Task) -> String {
    let mut out = String::new();
    out.push_str("# Task\n\n");
    out.push_str(task.description.trim());
    out.push_str("\n\n");

    if !task.memory_context.is_empty() {
        out.push_str("## Memory context\n\n");
        for (label, content) in &task.memory_context {
            out.push_str(&format!("### {}\n\n{}\n\n", label, content.trim_end()));
        }
    }

    out.push_str("## Output contract\n\n");
    out.push_str(
        "When you are finished, print exactly one result block: the start line, \
         a single JSON object, and the end line, each on its own line.\n\n",
    );
    out.push_str(RESULT_START);
    out.push('\n');
    out.push_str(
        r#"{"status": "success" | "failed", "summary": "one line", "details": "what was done", "errors": ["..."], "memoryUpdates": {"core": {"current.md": "full replacement content"}}}"#,
    );
    out.push('\n');
    out.push_str(RESULT_END);
    out.push('\n');
    out
}

/// What a call to [`ResultScanner::push`] found
#[derive(Debug, Clone, PartialEq)]
pub enum ScanOutcome {
    /// No complete block yet
    Incomplete,
    /// A well-formed block was parsed
    Parsed(TaskResult),
    /// A complete block was found but its payload did not parse
    Malformed(String),
}

/// Incremental scanner over the cumulative agent output
#[derive(Debug, Default)]
pub struct ResultScanner {
    buffer: String,
    /// Everything before this offset has been searched already
    cursor: usize,
    result: Option<TaskResult>,
    last_error: Option<String>,
}

impl ResultScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a fragment and look for complete blocks
    pub fn push(&mut self, fragment: &str) -> ScanOutcome {
        if self.result.is_some() {
            return ScanOutcome::Incomplete;
        }
        self.buffer.push_str(fragment);

        let mut malformed = None;
        while let Some(payload) = self.next_block() {
            match parse_payload(&payload) {
                Ok(result) => {
                    self.result = Some(result.clone());
                    return ScanOutcome::Parsed(result);
                }
                Err(err) => {
                    self.last_error = Some(err.clone());
                    malformed = Some(err);
                }
            }
        }

        match malformed {
            Some(err) => ScanOutcome::Malformed(err),
            None => ScanOutcome::Incomplete,
        }
    }

    pub fn result(&self) -> Option<&TaskResult> {
        self.result.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn into_parts(self) -> (Option<TaskResult>, Option<String>) {
        (self.result, self.last_error)
    }

    /// Extract the next complete block after the cursor, advancing past it
    fn next_block(&mut self) -> Option<String> {
        let Some(start) = self.buffer[self.cursor..].find(RESULT_START).map(|i| i + self.cursor)
        else {
            // Keep a tail long enough to hold a start marker split across fragments
            self.cursor = floor_char_boundary(
                &self.buffer,
                self.buffer.len().saturating_sub(RESULT_START.len()),
            )
            .max(self.cursor);
            return None;
        };

        let body_from = start + RESULT_START.len();
        let Some(end) = self.buffer[body_from..].find(RESULT_END).map(|i| i + body_from) else {
            self.cursor = start;
            return None;
        };

        // A restarted block supersedes an unterminated one before it
        let body_from = self.buffer[body_from..end]
            .rfind(RESULT_START)
            .map(|i| body_from + i + RESULT_START.len())
            .unwrap_or(body_from);

        let payload = self.buffer[body_from..end].to_string();
        self.cursor = end + RESULT_END.len();
        Some(payload)
    }
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    while index > 0 && !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Parse the text between the sentinels, tolerating a markdown code fence
fn parse_payload(payload: &str) -> std::result::Result<TaskResult, String> {
    let mut body = payload.trim();
    if let Some(rest) = body.strip_prefix("```") {
        body = rest.trim_start_matches(|c: char| c.is_ascii_alphanumeric());
        body = body.strip_suffix("```").unwrap_or(body);
        body = body.trim();
    }
    if body.is_empty() {
        return Err("empty result block".to_string());
    }
    serde_json::from_str::<TaskResult>(body).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use memento_core::task::{MemoryContext, ResultStatus};

    fn block(json: &str) -> String {
        format!("{}\n{}\n{}\n", RESULT_START, json, RESULT_END)
    }

    const OK: &str = r##"{"status":"success","summary":"did it","memoryUpdates":{"core":{"current.md":"# Now"}}}"##;

    #[test]
    fn test_parses_single_fragment() {
        let mut scanner = ResultScanner::new();
        let outcome = scanner.push(&format!("thinking...\n{}bye\n", block(OK)));
        match outcome {
            ScanOutcome::Parsed(result) => {
                assert_eq!(result.status, ResultStatus::Success);
                assert_eq!(result.memory_updates["core"]["current.md"], "# Now");
            }
            other => panic!("Expected Parsed, got {:?}", other),
        }
    }

    #[test]
    fn test_sentinels_split_across_fragments() {
        let text = format!("preamble {}", block(OK));
        let split_start = text.find(RESULT_START).unwrap() + 5;
        let split_end = text.find(RESULT_END).unwrap() + 7;

        let mut scanner = ResultScanner::new();
        assert_eq!(scanner.push(&text[..split_start]), ScanOutcome::Incomplete);
        assert_eq!(scanner.push(&text[split_start..split_end]), ScanOutcome::Incomplete);
        assert!(matches!(scanner.push(&text[split_end..]), ScanOutcome::Parsed(_)));
        assert_eq!(scanner.result().unwrap().summary, "did it");
    }

    #[test]
    fn test_byte_at_a_time() {
        let text = block(OK);
        let mut scanner = ResultScanner::new();
        let mut parsed = false;
        for ch in text.chars() {
            if let ScanOutcome::Parsed(_) = scanner.push(&ch.to_string()) {
                parsed = true;
            }
        }
        assert!(parsed);
    }

    #[test]
    fn test_malformed_then_valid_block() {
        let mut scanner = ResultScanner::new();
        let outcome = scanner.push(&block("{not json"));
        assert!(matches!(outcome, ScanOutcome::Malformed(_)));
        assert!(scanner.last_error().is_some());

        let outcome = scanner.push(&block(OK));
        assert!(matches!(outcome, ScanOutcome::Parsed(_)));
    }

    #[test]
    fn test_code_fence_is_tolerated() {
        let mut scanner = ResultScanner::new();
        let fenced = format!("```json\n{}\n```", OK);
        assert!(matches!(scanner.push(&block(&fenced)), ScanOutcome::Parsed(_)));
    }

    #[test]
    fn test_first_valid_block_wins() {
        let mut scanner = ResultScanner::new();
        scanner.push(&block(OK));
        scanner.push(&block(r#"{"status":"failed","summary":"second"}"#));
        assert_eq!(scanner.result().unwrap().summary, "did it");
    }

    #[test]
    fn test_unterminated_block_restarted() {
        let mut scanner = ResultScanner::new();
        let text = format!("{}\n{{\"status\":\n{}", RESULT_START, block(OK));
        assert!(matches!(scanner.push(&text), ScanOutcome::Parsed(_)));
    }

    #[test]
    fn test_instruction_contains_context_and_contract() {
        let context = MemoryContext::from([
            ("next.md".to_string(), "# Next".to_string()),
            ("current.md".to_string(), "# Current".to_string()),
        ]);
        let task = Task::new("Refactor the parser", context);
        let instruction = build_instruction(&task);

        assert!(instruction.starts_with("# Task\n\nRefactor the parser"));
        let current = instruction.find("### current.md").unwrap();
        let next = instruction.find("### next.md").unwrap();
        assert!(current < next);
        assert!(instruction.contains(RESULT_START));
        assert!(instruction.contains(RESULT_END));
    }
}
