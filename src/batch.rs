//! # Batch Runner
//!
//! Replays the benchmark driver across a script of configurations sharing
//! one control connection. Each non-comment line merges its options over
//! the command-line defaults (the line wins) and yields one result per
//! repetition; a failing line is reported and does not stop later lines.

use crate::config::TestConfig;
use crate::control::ControlConnection;
use crate::driver::BenchmarkDriver;
use crate::payload::PayloadCache;
use crate::protocol::parse_list;
use crate::provider::ProviderRegistry;
use crate::report::ResultRecord;
use anyhow::Result;
use tracing::{info, warn};

/// One attempted run from a script line
#[derive(Debug)]
pub struct BatchOutcome {
    /// 1-based line number in the script
    pub line_no: usize,
    /// 1-based repetition index for that line
    pub attempt: u32,
    pub result: Result<ResultRecord, String>,
}

impl BatchOutcome {
    /// Short label for reporting, e.g. `line 7` or `line 7 (run 2)`
    pub fn label(&self) -> String {
        if self.attempt > 1 {
            format!("line {} (run {})", self.line_no, self.attempt)
        } else {
            format!("line {}", self.line_no)
        }
    }
}

/// A parsed script line: merged configuration plus its repeat count
type ParsedLine = (usize, Result<(TestConfig, u32), String>);

/// Parse every significant script line against a base configuration
///
/// Lines beginning with `#` and empty lines are skipped. A line that fails
/// to parse is carried as an error so the caller can report it in place.
pub fn parse_script(script: &str, base: &TestConfig) -> Vec<ParsedLine> {
    let mut lines = Vec::new();
    for (index, raw) in script.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let line_no = index + 1;
        let parsed = parse_list(line)
            .map_err(|e| e.to_string())
            .and_then(|tokens| {
                let mut config = base.clone();
                let repeat = config.apply_overrides(&tokens).map_err(|e| format!("{:#}", e))?;
                Ok((config, repeat))
            });
        lines.push((line_no, parsed));
    }
    lines
}

/// Replays configurations over one shared control connection
pub struct BatchRunner {
    base: TestConfig,
}

impl BatchRunner {
    pub fn new(base: TestConfig) -> Self {
        Self { base }
    }

    /// Execute every significant line of the script, one outcome per
    /// repetition; later lines run regardless of earlier failures
    pub async fn run_script(
        &self,
        script: &str,
        control: &mut ControlConnection,
        providers: &ProviderRegistry,
        payloads: &mut PayloadCache,
    ) -> Vec<BatchOutcome> {
        let mut outcomes = Vec::new();

        for (line_no, parsed) in parse_script(script, &self.base) {
            let (config, repeat) = match parsed {
                Ok(merged) => merged,
                Err(error) => {
                    warn!("script line {}: {}", line_no, error);
                    outcomes.push(BatchOutcome { line_no, attempt: 1, result: Err(error) });
                    continue;
                }
            };

            // Repetitions reuse the merged configuration without re-parsing
            for attempt in 1..=repeat {
                info!("script line {} run {}/{}", line_no, attempt, repeat);
                let mut driver = BenchmarkDriver::new(control, providers, payloads);
                let result = driver
                    .run(&config)
                    .await
                    .map_err(|e| format!("{:#}", e));
                if let Err(ref error) = result {
                    warn!("script line {} run {} failed: {}", line_no, attempt, error);
                }
                outcomes.push(BatchOutcome { line_no, attempt, result });
            }
        }
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{TransferLimit, TransferMode};

    #[test]
    fn test_parse_script_skips_comments_and_blanks() {
        let script = "\
# throughput sweep
-writesize 1024 -writecount 10

   # indented comment
-writesize 2048 -writecount 10
";
        let lines = parse_script(script, &TestConfig::default());
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].0, 2);
        assert_eq!(lines[1].0, 5);
    }

    #[test]
    fn test_parse_script_merges_over_base() {
        let mut base = TestConfig::default();
        base.options.set("-buffering", "none");

        let lines = parse_script("-writesize 8192 -writecount 5 -buffering full", &base);
        let (config, repeat) = lines[0].1.as_ref().unwrap();
        assert_eq!(repeat, &1);
        assert_eq!(config.io.write_size, 8192);
        assert_eq!(config.limit, TransferLimit::Count(5));
        // The line wins over the command-line default
        assert_eq!(config.options.get("-buffering"), Some("full"));
    }

    #[test]
    fn test_parse_script_carries_bad_lines_as_errors() {
        let script = "-writesize oops\n-writesize 1024 -writecount 1\n";
        let lines = parse_script(script, &TestConfig::default());
        assert_eq!(lines.len(), 2);
        assert!(lines[0].1.is_err());
        assert!(lines[1].1.is_ok());
    }

    #[test]
    fn test_parse_script_repeat_and_mode() {
        let lines = parse_script("-writecount 3 -nonblocking 1 -repeat 4", &TestConfig::default());
        let (config, repeat) = lines[0].1.as_ref().unwrap();
        assert_eq!(repeat, &4);
        assert_eq!(config.mode, TransferMode::EventDriven);
    }

    #[test]
    fn test_outcome_labels() {
        let single = BatchOutcome { line_no: 7, attempt: 1, result: Err("x".to_string()) };
        assert_eq!(single.label(), "line 7");
        let repeated = BatchOutcome { line_no: 7, attempt: 2, result: Err("x".to_string()) };
        assert_eq!(repeated.label(), "line 7 (run 2)");
    }
}
