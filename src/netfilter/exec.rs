// Command executor for the packet-filter tool. Every invocation is
// serialized through one process-wide lock: iptables is not safe for
// concurrent table mutation, and other subsystems (namespace and bridge
// setup) share the same tables. The lock is held per command, not per
// ruleset, to keep contention low.

use crate::netfilter::error::{NetfilterError, NetfilterResult};
use std::process::Command;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

/// Fixed pause between retries of a failed tool invocation.
pub const RETRY_PAUSE: Duration = Duration::from_millis(250);
/// Attempts per command before the error escalates.
pub const RETRY_ATTEMPTS: u32 = 3;

fn table_lock() -> &'static Mutex<()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
}

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    /// Combined stdout + stderr, the tool reports errors on both.
    pub output: String,
    pub exit_code: Option<i32>,
}

/// Seam between the engine and the external tool. Production uses
/// [`SystemRunner`]; tests substitute a recording double to observe
/// command ordering.
pub trait CommandRunner: Send + Sync {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput>;
}

pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[String]) -> std::io::Result<CommandOutput> {
        let _guard = table_lock().lock().unwrap_or_else(|e| e.into_inner());

        let out = Command::new(program).args(args).output()?;
        let mut output = String::from_utf8_lossy(&out.stdout).to_string();
        output.push_str(&String::from_utf8_lossy(&out.stderr));

        Ok(CommandOutput {
            success: out.status.success(),
            output,
            exit_code: out.status.code(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolErrorClass {
    /// Rule already present, already absent, or namespace raced away
    /// during teardown. Treated as success.
    Idempotent,
    /// Another process holds the table lock. Worth retrying in place.
    Transient,
    Fatal,
}

/// Single point of contact with the tool's human-readable diagnostics.
/// The tool is not idempotent by default; the engine makes it so by
/// absorbing these specific messages.
pub fn classify_tool_error(output: &str, _exit_code: Option<i32>) -> ToolErrorClass {
    const IDEMPOTENT: &[&str] = &[
        "matching rule exist",
        "No chain/target/match by that name",
        "File exists",
        "Cannot open network namespace",
    ];
    const TRANSIENT: &[&str] = &[
        "holding the xtables lock",
        "Resource temporarily unavailable",
    ];

    for needle in IDEMPOTENT {
        if output.contains(needle) {
            return ToolErrorClass::Idempotent;
        }
    }
    for needle in TRANSIENT {
        if output.contains(needle) {
            return ToolErrorClass::Transient;
        }
    }
    ToolErrorClass::Fatal
}

#[derive(Clone)]
pub struct Executor {
    runner: Arc<dyn CommandRunner>,
}

impl Executor {
    pub fn system() -> Self {
        Self {
            runner: Arc::new(SystemRunner),
        }
    }

    pub fn with_runner(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// One invocation, idempotency messages absorbed. Returns combined
    /// output on success.
    pub fn run_once(&self, program: &str, args: &[String]) -> NetfilterResult<String> {
        let out = self.runner.run(program, args)?;
        if !out.success
            && classify_tool_error(&out.output, out.exit_code) != ToolErrorClass::Idempotent
        {
            return Err(NetfilterError::Command {
                cmd: format!("{} {}", program, args.join(" ")),
                output: out.output,
            });
        }
        Ok(out.output)
    }

    /// Retrying invocation used for every table mutation. `advisory`
    /// commands (accept-rule installs) are downgraded to a logged error
    /// once retries are exhausted: a best-effort accept that failed to
    /// install is not worth aborting reconciliation over.
    pub fn run_retry(
        &self,
        program: &str,
        args: &[String],
        advisory: bool,
    ) -> NetfilterResult<()> {
        let mut last_output = String::new();

        for attempt in 0..RETRY_ATTEMPTS {
            let result = self.runner.run(program, args);

            let output = match result {
                Ok(out) => {
                    if out.success {
                        return Ok(());
                    }
                    if classify_tool_error(&out.output, out.exit_code)
                        == ToolErrorClass::Idempotent
                    {
                        return Ok(());
                    }
                    out.output
                }
                Err(e) => e.to_string(),
            };

            last_output = output;
            if attempt + 1 < RETRY_ATTEMPTS {
                std::thread::sleep(RETRY_PAUSE);
            }
        }

        if advisory {
            tracing::error!(
                command = %format!("{} {}", program, args.join(" ")),
                output = %last_output,
                "netfilter: Ignoring failed accept rule"
            );
            return Ok(());
        }

        tracing::warn!(
            command = %format!("{} {}", program, args.join(" ")),
            output = %last_output,
            "netfilter: Failed to run command"
        );
        Err(NetfilterError::Command {
            cmd: format!("{} {}", program, args.join(" ")),
            output: last_output,
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::RecordingRunner;
    use super::*;

    #[test]
    fn test_classify_tool_error() {
        assert_eq!(
            classify_tool_error(
                "iptables: Bad rule (does a matching rule exist in that chain?)",
                Some(1)
            ),
            ToolErrorClass::Idempotent
        );
        assert_eq!(
            classify_tool_error("ip6tables: No chain/target/match by that name.", Some(1)),
            ToolErrorClass::Idempotent
        );
        assert_eq!(
            classify_tool_error("Cannot open network namespace \"n4a3f\": No such file", Some(1)),
            ToolErrorClass::Idempotent
        );
        assert_eq!(
            classify_tool_error(
                "Another app is currently holding the xtables lock.",
                Some(4)
            ),
            ToolErrorClass::Transient
        );
        assert_eq!(
            classify_tool_error("iptables v1.8.9: unknown option \"--bogus\"", Some(2)),
            ToolErrorClass::Fatal
        );
    }

    #[test]
    fn test_retry_exhaustion_is_fatal_for_critical_commands() {
        let runner = RecordingRunner::new();
        runner.fail_matching("DROP");
        let exec = Executor::with_runner(runner.clone());

        let args: Vec<String> = ["-A", "FORWARD", "-j", "DROP"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let err = exec.run_retry("iptables", &args, false);
        assert!(err.is_err());
        assert_eq!(runner.lines().len(), RETRY_ATTEMPTS as usize);
    }

    #[test]
    fn test_advisory_failure_is_absorbed() {
        let runner = RecordingRunner::new();
        runner.fail_matching("ACCEPT");
        let exec = Executor::with_runner(runner.clone());

        let args: Vec<String> = ["-A", "FORWARD", "-j", "ACCEPT"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(exec.run_retry("iptables", &args, true).is_ok());
    }

    #[test]
    fn test_successful_command_runs_once() {
        let runner = RecordingRunner::new();
        let exec = Executor::with_runner(runner.clone());
        let args: Vec<String> = ["-A", "FORWARD", "-j", "DROP"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        assert!(exec.run_retry("iptables", &args, false).is_ok());
        assert_eq!(runner.lines().len(), 1);
    }
}
