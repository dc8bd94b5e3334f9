//! Event and outcome types for agent execution

use std::time::Duration;

use serde::{Deserialize, Serialize};

use memento_core::task::TaskResult;

/// Output stream type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Events emitted by the output readers of a running agent
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A fragment of output. Stdout fragments have arbitrary boundaries,
    /// stderr is delivered line by line.
    Output {
        stream: OutputStream,
        content: String,
    },

    /// The stream reached end of file
    StreamClosed { stream: OutputStream },
}

/// Everything observed while supervising one agent invocation
#[derive(Debug, Clone, Default)]
pub struct AgentOutcome {
    /// Exit code, `None` when killed or terminated by a signal
    pub exit_code: Option<i32>,
    /// First well-formed result block
    pub result: Option<TaskResult>,
    /// Last parse error seen on a malformed block
    pub parse_error: Option<String>,
    pub timed_out: bool,
    pub cancelled: bool,
    pub elapsed: Duration,
}

impl AgentOutcome {
    /// Collapse the observations into the terminal task result.
    ///
    /// Success needs both a zero exit code and a parsed result block;
    /// every other combination becomes a failure carrying the cause.
    pub fn into_task_result(self, deadline: Duration) -> TaskResult {
        if self.timed_out {
            return TaskResult::timeout(deadline, "executor");
        }
        if self.cancelled {
            return TaskResult::failure(
                "Execution cancelled",
                "The executor was asked to stop before the agent finished",
            )
            .with_error("cancelled");
        }

        let exit = match self.exit_code {
            Some(code) => format!("exit code {}", code),
            None => "termination by signal".to_string(),
        };

        match (self.exit_code, self.result) {
            (Some(0), Some(result)) => result,
            (_, Some(result)) => {
                let mut failed = TaskResult::failure(
                    format!("Agent failed with {}", exit),
                    format!("Agent reported: {}", result.summary),
                )
                .with_error(format!("agent_exit: {}", exit));
                failed.errors.extend(result.errors);
                failed
            }
            (_, None) => {
                let (summary, error) = match self.parse_error {
                    Some(err) => ("Agent result block was malformed", format!("parse_error: {}", err)),
                    None => ("Agent produced no result block", "no_result".to_string()),
                };
                TaskResult::failure(summary, format!("Agent finished with {}", exit))
                    .with_error(error)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memento_core::task::ResultStatus;

    const DEADLINE: Duration = Duration::from_secs(300);

    #[test]
    fn test_success_needs_zero_exit_and_result() {
        let outcome = AgentOutcome {
            exit_code: Some(0),
            result: Some(TaskResult::success("done")),
            ..Default::default()
        };
        let result = outcome.into_task_result(DEADLINE);
        assert!(result.is_success());
        assert_eq!(result.summary, "done");
    }

    #[test]
    fn test_nonzero_exit_with_result_fails() {
        let outcome = AgentOutcome {
            exit_code: Some(3),
            result: Some(TaskResult::success("looked fine")),
            ..Default::default()
        };
        let result = outcome.into_task_result(DEADLINE);
        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.summary.contains("exit code 3"));
        assert!(result.details.contains("looked fine"));
    }

    #[test]
    fn test_zero_exit_without_result_fails() {
        let outcome = AgentOutcome {
            exit_code: Some(0),
            parse_error: Some("expected value".to_string()),
            ..Default::default()
        };
        let result = outcome.into_task_result(DEADLINE);
        assert_eq!(result.status, ResultStatus::Failed);
        assert!(result.errors[0].starts_with("parse_error"));
    }

    #[test]
    fn test_timeout_wins_over_everything() {
        let outcome = AgentOutcome {
            exit_code: None,
            result: Some(TaskResult::success("too late")),
            timed_out: true,
            ..Default::default()
        };
        let result = outcome.into_task_result(Duration::from_millis(500));
        assert!(result.is_timeout());
        assert!(result.summary.contains("500 ms"));
    }
}
