//! Packet-filter policy: command synthesis, capability probing, execution.
//!
//! - `ruleset`: pure builders for the iptables command lines
//! - `probe`: root / binary / comment-match / init-script detection
//! - `engine`: [`PolicyEngine`], the reconciliation entry point
//! - `bypass`: [`BypassScheduler`], the captive-portal countdown
//!
//! Commands are executed by a [`PrivilegedExecutor`]; the shipped
//! [`ShellExecutor`] runs them through a privilege wrapper such as `su -c`.

pub mod bypass;
pub mod engine;
pub mod probe;
pub mod ruleset;

use std::process::{Command, Stdio};

use anyhow::{Context, Result};

pub use bypass::{BypassEvent, BypassScheduler, BypassWindow};
pub use engine::PolicyEngine;

/// Runs an ordered list of shell-level commands with elevated privilege.
///
/// Every command is run, in order, even after a failure; the returned vector
/// holds one exit code per command.
pub trait PrivilegedExecutor: Send + Sync {
    fn execute(&self, commands: &[String]) -> Result<Vec<i32>>;
}

/// Executor that spawns each command through a privilege wrapper.
pub struct ShellExecutor {
    wrapper: Vec<String>,
}

impl ShellExecutor {
    /// `wrapper` is prepended to every command; the command line itself is
    /// passed as the wrapper's last argument (`su -c "<line>"`). An empty
    /// wrapper runs the line through `sh -c`.
    pub fn new(wrapper: Vec<String>) -> Self {
        Self { wrapper }
    }

    fn command_for(&self, line: &str) -> Command {
        let mut cmd = match self.wrapper.split_first() {
            Some((program, args)) => {
                let mut cmd = Command::new(program);
                cmd.args(args);
                cmd
            }
            None => {
                let mut cmd = Command::new("sh");
                cmd.arg("-c");
                cmd
            }
        };
        cmd.arg(line).stdin(Stdio::null()).stdout(Stdio::null());
        cmd
    }
}

impl PrivilegedExecutor for ShellExecutor {
    fn execute(&self, commands: &[String]) -> Result<Vec<i32>> {
        let mut codes = Vec::with_capacity(commands.len());
        for line in commands {
            let output = self
                .command_for(line)
                .stderr(Stdio::piped())
                .output()
                .with_context(|| format!("failed to spawn privileged command `{line}`"))?;
            // A signal-terminated command has no code; report it as a failure.
            let code = output.status.code().unwrap_or(-1);
            if code != 0 {
                tracing::debug!(
                    "`{line}` exited with {code}: {}",
                    String::from_utf8_lossy(&output.stderr).trim()
                );
            }
            codes.push(code);
        }
        Ok(codes)
    }
}
