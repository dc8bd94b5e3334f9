//! Translate interactive session output into typed signals
//!
//! The session is free text, so this is the only place that knows the
//! directive syntax. Everything downstream works on [`SessionSignal`].

use regex::Regex;

use crate::error::Result;

/// Literal directive asking for pending memory updates to be applied
pub const MEMORY_DIRECTIVE: &str = "/memory update";

/// A request detected in the session output
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionSignal {
    MemoryUpdate,
    CreateTask { description: String },
}

/// Line-oriented detector over raw output chunks
#[derive(Debug)]
pub struct SignalTranslator {
    partial: Vec<u8>,
    task_pattern: Regex,
    ansi_pattern: Regex,
}

impl SignalTranslator {
    pub fn new() -> Result<Self> {
        Ok(Self {
            partial: Vec::new(),
            task_pattern: Regex::new(r"TASK:\s*(.+)")?,
            ansi_pattern: Regex::new(r"\x1b\[[0-9;?]*[A-Za-z]")?,
        })
    }

    /// Feed a chunk of output; signals are returned for complete lines only
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SessionSignal> {
        self.partial.extend_from_slice(chunk);

        let mut signals = Vec::new();
        while let Some(newline) = self.partial.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.partial.drain(..=newline).collect();
            self.translate_line(&String::from_utf8_lossy(&line), &mut signals);
        }
        signals
    }

    /// Flush a trailing line that never got its newline
    pub fn finish(&mut self) -> Vec<SessionSignal> {
        let mut signals = Vec::new();
        if !self.partial.is_empty() {
            let line = std::mem::take(&mut self.partial);
            self.translate_line(&String::from_utf8_lossy(&line), &mut signals);
        }
        signals
    }

    fn translate_line(&self, raw: &str, signals: &mut Vec<SessionSignal>) {
        let line = self.ansi_pattern.replace_all(raw, "");
        let line = line.trim_end_matches(['\r', '\n']);

        if line.contains(MEMORY_DIRECTIVE) {
            signals.push(SessionSignal::MemoryUpdate);
        }

        if let Some(captures) = self.task_pattern.captures(line) {
            let description = captures[1].trim();
            if !description.is_empty() {
                signals.push(SessionSignal::CreateTask {
                    description: description.to_string(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(description: &str) -> SessionSignal {
        SessionSignal::CreateTask {
            description: description.to_string(),
        }
    }

    #[test]
    fn test_task_directive() {
        let mut translator = SignalTranslator::new().unwrap();
        let signals = translator.push(b"Sure.\nTASK: write the release notes \n");
        assert_eq!(signals, vec![task("write the release notes")]);
    }

    #[test]
    fn test_directive_split_across_chunks() {
        let mut translator = SignalTranslator::new().unwrap();
        assert!(translator.push(b"TA").is_empty());
        assert!(translator.push(b"SK: fix the").is_empty());
        assert_eq!(translator.push(b" build\r\n"), vec![task("fix the build")]);
    }

    #[test]
    fn test_memory_directive_and_ansi_codes() {
        let mut translator = SignalTranslator::new().unwrap();
        let signals = translator.push(b"\x1b[1m/memory update\x1b[0m\n\x1b[32mTASK:\x1b[0m lint\n");
        assert_eq!(signals, vec![SessionSignal::MemoryUpdate, task("lint")]);
    }

    #[test]
    fn test_empty_description_is_ignored() {
        let mut translator = SignalTranslator::new().unwrap();
        assert!(translator.push(b"TASK:   \n").is_empty());
    }

    #[test]
    fn test_finish_flushes_partial_line() {
        let mut translator = SignalTranslator::new().unwrap();
        assert!(translator.push("TASK: résumé".as_bytes()).is_empty());
        assert_eq!(translator.finish(), vec![task("résumé")]);
        assert!(translator.finish().is_empty());
    }
}
