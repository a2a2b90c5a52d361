use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use crossbeam::channel::bounded;
use crossbeam::select;
use log::debug;
use rustix::process::{kill_process, Pid, Signal};

use crate::cancel::JobContext;
use crate::errors::{AgentError, Result};

/// Port for running external commands. The only path the core has to
/// `ip`, `sysctl`, `hostname` and friends.
pub trait CommandExecutor: Send + Sync {
    fn execute_with_timeout(
        &self,
        ctx: &JobContext,
        timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> Result<Vec<u8>>;
}

/// Executes real system commands without a shell, with a hard timeout.
pub struct RealCommandExecutor;

impl RealCommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl Default for RealCommandExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl CommandExecutor for RealCommandExecutor {
    fn execute_with_timeout(
        &self,
        ctx: &JobContext,
        timeout: Duration,
        command: &str,
        args: &[&str],
    ) -> Result<Vec<u8>> {
        ctx.check()?;

        if !is_safe_command(command) {
            return Err(AgentError::validation(format!(
                "unsafe command rejected: {}",
                command
            )));
        }
        for arg in args {
            if !is_safe_arg(arg) {
                return Err(AgentError::validation("unsafe argument rejected"));
            }
        }

        let effective = ctx.clamp(timeout);

        let child = Command::new(command)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                AgentError::system(format!(
                    "unable to run {} {}",
                    command,
                    mask_args(args).join(" ")
                ))
                .with_cause(e)
            })?;

        let pid = child.id();
        let (tx, rx) = bounded(1);
        thread::spawn(move || {
            let _ = tx.send(child.wait_with_output());
        });

        let outcome = select! {
            recv(rx) -> result => Some(result),
            recv(ctx.cancel_token().receiver()) -> _ => None,
            default(effective) => {
                debug!("command {} timed out after {:?}, killing pid {}", command, effective, pid);
                kill_child(pid);
                return Err(AgentError::timeout(format!(
                    "command execution timeout: {} {} (timeout: {:?})",
                    command,
                    mask_args(args).join(" "),
                    effective,
                )));
            }
        };

        let result = match outcome {
            Some(result) => result,
            None => {
                kill_child(pid);
                return Err(AgentError::cancelled());
            }
        };

        let output = result
            .map_err(|_| AgentError::system("command result channel closed"))?
            .map_err(|e| {
                AgentError::system(format!(
                    "command execution failed: {} {}",
                    command,
                    mask_args(args).join(" ")
                ))
                .with_cause(e)
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(AgentError::system(format!(
                "command execution failed: {} {}",
                command,
                mask_args(args).join(" ")
            ))
            .with_cause(format!(
                "exit status {}, stderr: {}",
                output.status.code().unwrap_or(-1),
                stderr.trim()
            )));
        }

        Ok(output.stdout)
    }
}

fn kill_child(pid: u32) {
    if let Some(pid) = Pid::from_raw(pid as i32) {
        let _ = kill_process(pid, Signal::Kill);
    }
}

// The binary name must not contain whitespace or shell metacharacters.
// We never go through a shell but this cuts the injection surface anyway.
fn is_safe_command(command: &str) -> bool {
    if command.is_empty() {
        return false;
    }
    !command
        .chars()
        .any(|c| matches!(c, ' ' | ';' | '|' | '&' | '>' | '<' | '`' | '$' | '\n' | '\r' | '\t'))
}

fn is_safe_arg(arg: &str) -> bool {
    !arg.chars().any(|c| matches!(c, '`' | '$' | '\n' | '\r'))
}

const SECRET_MARKERS: [&str; 6] = ["pass", "token", "secret", "key", "cred", "authorization"];

fn looks_like_secret_key(value: &str) -> bool {
    let lower = value.to_ascii_lowercase();
    SECRET_MARKERS.iter().any(|m| lower.contains(m))
}

/// Masks secret-looking arguments and the positional value following a
/// secret-looking key. Used for every error message that echoes args.
fn mask_args(args: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(args.len());
    for (i, arg) in args.iter().enumerate() {
        let masked = if looks_like_secret_key(arg) {
            "***"
        } else if i > 0 && looks_like_secret_key(args[i - 1]) {
            "***"
        } else {
            arg
        };
        out.push(masked.to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::cancel::CancelToken;
    use crate::errors::ErrorKind;

    fn ctx() -> JobContext {
        JobContext::unbounded(CancelToken::new())
    }

    #[test]
    fn test_is_safe_command() {
        struct Case<'a> {
            command: &'a str,
            safe: bool,
        }
        let cases = [
            Case { command: "ip", safe: true },
            Case { command: "/usr/sbin/ip", safe: true },
            Case { command: "", safe: false },
            Case { command: "ip link", safe: false },
            Case { command: "ip;reboot", safe: false },
            Case { command: "ip|cat", safe: false },
            Case { command: "ip&", safe: false },
            Case { command: "ip>out", safe: false },
            Case { command: "ip<in", safe: false },
            Case { command: "ip`id`", safe: false },
            Case { command: "ip$HOME", safe: false },
            Case { command: "ip\nreboot", safe: false },
            Case { command: "ip\tlink", safe: false },
        ];
        for case in cases {
            assert_eq!(is_safe_command(case.command), case.safe, "{:?}", case.command);
        }
    }

    #[test]
    fn test_is_safe_arg() {
        struct Case<'a> {
            arg: &'a str,
            safe: bool,
        }
        let cases = [
            Case { arg: "link", safe: true },
            Case { arg: "10.0.0.2/24", safe: true },
            Case { arg: "with space", safe: true },
            Case { arg: "$(id)", safe: false },
            Case { arg: "`id`", safe: false },
            Case { arg: "a\nb", safe: false },
        ];
        for case in cases {
            assert_eq!(is_safe_arg(case.arg), case.safe, "{:?}", case.arg);
        }
    }

    #[test]
    fn test_mask_args() {
        let masked = mask_args(&["--password", "hunter2", "dev", "eth0"]);
        assert_eq!(masked, vec!["***", "***", "dev", "eth0"]);

        let masked = mask_args(&["token=abc", "plain"]);
        assert_eq!(masked, vec!["***", "plain"]);
    }

    #[test]
    fn test_unsafe_command_rejected_before_spawn() {
        let exec = RealCommandExecutor::new();
        let err = exec
            .execute_with_timeout(&ctx(), Duration::from_secs(1), "ip;id", &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
    }

    #[test]
    fn test_execute_captures_stdout() {
        let exec = RealCommandExecutor::new();
        let out = exec
            .execute_with_timeout(&ctx(), Duration::from_secs(5), "echo", &["hello"])
            .unwrap();
        assert_eq!(String::from_utf8_lossy(&out).trim(), "hello");
    }

    #[test]
    fn test_execute_nonzero_exit_is_system_error() {
        let exec = RealCommandExecutor::new();
        let err = exec
            .execute_with_timeout(&ctx(), Duration::from_secs(5), "false", &[])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::System);
    }

    #[test]
    fn test_execute_timeout_kind() {
        let exec = RealCommandExecutor::new();
        let err = exec
            .execute_with_timeout(&ctx(), Duration::from_millis(50), "sleep", &["5"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }

    #[test]
    fn test_secret_masked_in_error_message() {
        let exec = RealCommandExecutor::new();
        let err = exec
            .execute_with_timeout(
                &ctx(),
                Duration::from_secs(5),
                "false",
                &["--password", "hunter2"],
            )
            .unwrap_err();
        let message = err.to_string();
        assert!(!message.contains("hunter2"), "{}", message);
        assert!(message.contains("***"), "{}", message);
    }

    #[test]
    fn test_deadline_clamps_command_timeout() {
        let exec = RealCommandExecutor::new();
        let short = JobContext::with_timeout(CancelToken::new(), Duration::from_millis(50));
        let err = exec
            .execute_with_timeout(&short, Duration::from_secs(30), "sleep", &["5"])
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
    }
}
