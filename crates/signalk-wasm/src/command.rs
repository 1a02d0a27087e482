//! Allow-listed command execution for log retrieval.
//!
//! Commands are matched against a fixed set of patterns and run directly
//! (no shell) with a timeout. Output is read as it is produced and only the
//! last `output_limit` bytes of each stream are held, the most recent log
//! lines.

use std::collections::VecDeque;
use std::process::Stdio;
use std::time::Duration;

use regex::Regex;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::PluginError;

/// Patterns accepted by [`CommandPolicy::log_retrieval`].
pub const LOG_COMMAND_PATTERNS: &[&str] = &[
    r"^journalctl(\s+(-u\s+[A-Za-z0-9@._-]+|-n\s+\d{1,5}|--no-pager|-o\s+(short|short-iso|json|cat)))*$",
    r"^tail\s+-n\s+\d{1,5}\s+/var/log/[A-Za-z0-9._/-]+$",
    r"^cat\s+/var/log/[A-Za-z0-9._/-]+$",
];

#[derive(Debug, Clone)]
pub struct CommandPolicy {
    patterns: Vec<Regex>,
    timeout: Duration,
    output_limit: usize,
}

impl CommandPolicy {
    pub fn new(
        patterns: &[&str],
        timeout: Duration,
        output_limit: usize,
    ) -> Result<Self, PluginError> {
        let patterns = patterns
            .iter()
            .map(|p| Regex::new(p))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| PluginError::Sandbox(format!("invalid command pattern: {e}")))?;
        Ok(Self {
            patterns,
            timeout,
            output_limit,
        })
    }

    /// The standard policy: journal and `/var/log` reads only.
    pub fn log_retrieval(timeout: Duration, output_limit: usize) -> Result<Self, PluginError> {
        Self::new(LOG_COMMAND_PATTERNS, timeout, output_limit)
    }

    pub fn is_allowed(&self, command: &str) -> bool {
        let command = command.trim();
        !command.contains("..") && self.patterns.iter().any(|p| p.is_match(command))
    }

    /// Run an allowed command and return its (possibly truncated) output.
    pub async fn run(&self, command: &str) -> Result<String, PluginError> {
        if !self.is_allowed(command) {
            return Err(PluginError::CommandNotAllowed(command.to_string()));
        }
        let argv: Vec<&str> = command.split_whitespace().collect();
        let Some((program, args)) = argv.split_first() else {
            return Err(PluginError::CommandNotAllowed(command.to_string()));
        };

        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let limit = self.output_limit;
        let collect = async {
            tokio::try_join!(read_tail(stdout, limit), read_tail(stderr, limit), child.wait())
        };
        let (stdout, stderr, status) = tokio::time::timeout(self.timeout, collect)
            .await
            .map_err(|_| {
                PluginError::Sandbox(format!(
                    "command timed out after {}ms: {command}",
                    self.timeout.as_millis()
                ))
            })??;

        let text = if stdout.is_empty() && !status.success() {
            String::from_utf8_lossy(&stderr).into_owned()
        } else {
            String::from_utf8_lossy(&stdout).into_owned()
        };
        Ok(keep_tail(text, self.output_limit))
    }
}

/// Read `reader` to the end, holding at most its last `limit` bytes.
async fn read_tail<R>(reader: Option<R>, limit: usize) -> std::io::Result<Vec<u8>>
where
    R: AsyncRead + Unpin,
{
    let Some(mut reader) = reader else {
        return Ok(Vec::new());
    };
    let mut tail = VecDeque::with_capacity(limit.min(64 * 1024));
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        tail.extend(&chunk[..n]);
        let excess = tail.len().saturating_sub(limit);
        tail.drain(..excess);
    }
    Ok(tail.into())
}

/// Drop the head of `text` so at most `limit` bytes remain.
fn keep_tail(text: String, limit: usize) -> String {
    if text.len() <= limit {
        return text;
    }
    let mut start = text.len() - limit;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}
