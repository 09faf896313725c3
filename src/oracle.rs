//! The external rewriting oracle, treated as a black box:
//! `rewrite(prompt) -> source text | failure sentinel`.
//!
//! Two adapters: Ollama over HTTP (stdlib TcpStream, no HTTP client dep) and
//! an arbitrary external command (prompt on stdin, reply on stdout). Replies
//! pass through sanitation (fenced-block extraction, prompt-echo stripping)
//! before the validator ever sees them.

use anyhow::{bail, Context, Result};
use lazy_static::lazy_static;
use regex::Regex;
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::process::{Command, Stdio};
use std::time::Duration;

/// Replies beginning with this marker are oracle failures, not code.
pub const FAILURE_SENTINEL: &str = "[ERROR]";

pub trait Oracle {
    /// One rewrite attempt. Transport errors surface as `Err`; in-band
    /// failures surface as a sentinel-prefixed reply.
    fn rewrite(&self, prompt: &str) -> Result<String>;

    fn name(&self) -> &'static str;
}

// ── Reply handling ─────────────────────────────────────────────────────────────

/// Interpret a raw reply: `None` for empty or sentinel-marked output,
/// otherwise the sanitized candidate code.
pub fn interpret_reply(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.starts_with(FAILURE_SENTINEL) {
        return None;
    }
    let code = sanitize_reply(trimmed);
    if code.trim().is_empty() {
        None
    } else {
        Some(code)
    }
}

/// Extract the first fenced code block if present; otherwise strip any echoed
/// prose before the first line that looks like Python code.
pub fn sanitize_reply(raw: &str) -> String {
    lazy_static! {
        static ref FENCE: Regex =
            Regex::new(r"(?s)```(?:python)?[ \t]*\n?(.*?)```").expect("valid fence regex");
    }
    if let Some(caps) = FENCE.captures(raw) {
        return caps[1].trim_end().trim_start_matches('\n').to_string();
    }

    const CODE_STARTS: &[&str] = &["import ", "from ", "def ", "async def ", "class ", "@"];
    for (i, line) in raw.lines().enumerate() {
        let t = line.trim_start();
        if CODE_STARTS.iter().any(|p| t.starts_with(p)) {
            return raw.lines().skip(i).collect::<Vec<_>>().join("\n");
        }
    }
    raw.to_string()
}

// ── Ollama adapter ─────────────────────────────────────────────────────────────

pub struct OllamaOracle {
    /// e.g. "localhost:11434"
    pub host: String,
    pub model: String,
    pub timeout_ms: u64,
}

impl Oracle for OllamaOracle {
    fn rewrite(&self, prompt: &str) -> Result<String> {
        let payload = serde_json::json!({
            "model": self.model,
            "prompt": prompt,
            "stream": false,
        });
        let body = serde_json::to_string(&payload)?;
        let raw = http_post(&self.host, "/api/generate", &body, self.timeout_ms)?;

        #[derive(Deserialize)]
        struct GenerateResp {
            response: Option<String>,
        }
        let outer: GenerateResp =
            serde_json::from_str(&raw).context("malformed Ollama response")?;
        Ok(outer.response.unwrap_or_default())
    }

    fn name(&self) -> &'static str {
        "ollama"
    }
}

/// Minimal sync HTTP/1.1 POST using stdlib TcpStream.
fn http_post(host: &str, path: &str, body: &str, timeout_ms: u64) -> Result<String> {
    let timeout = Duration::from_millis(timeout_ms);
    let addr = host
        .to_socket_addrs()
        .with_context(|| format!("invalid oracle host: {host}"))?
        .next()
        .with_context(|| format!("oracle host resolves to nothing: {host}"))?;
    let mut stream = TcpStream::connect_timeout(&addr, timeout)?;
    stream.set_read_timeout(Some(timeout))?;
    stream.set_write_timeout(Some(timeout))?;

    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n{body}",
        len = body.len(),
    );
    stream.write_all(request.as_bytes())?;

    let mut response = String::new();
    stream.read_to_string(&mut response)?;

    if let Some(pos) = response.find("\r\n\r\n") {
        Ok(response[pos + 4..].to_string())
    } else {
        bail!("malformed HTTP response from oracle (no header separator)")
    }
}

// ── External command adapter ───────────────────────────────────────────────────

/// Runs a shell command with the prompt on stdin and reads the reply from
/// stdout. A non-zero exit becomes an in-band sentinel failure so the caller
/// treats it like any other oracle refusal.
pub struct CommandOracle {
    pub command: String,
}

impl Oracle for CommandOracle {
    fn rewrite(&self, prompt: &str) -> Result<String> {
        let mut child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .with_context(|| format!("failed to spawn oracle command: {}", self.command))?;

        child
            .stdin
            .take()
            .context("oracle command has no stdin")?
            .write_all(prompt.as_bytes())?;

        let out = child.wait_with_output()?;
        if !out.status.success() {
            return Ok(format!(
                "{FAILURE_SENTINEL} oracle command exited with {}",
                out.status
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interpret_empty_reply_is_failure() {
        assert_eq!(interpret_reply(""), None);
        assert_eq!(interpret_reply("   \n  "), None);
    }

    #[test]
    fn test_interpret_sentinel_reply_is_failure() {
        assert_eq!(interpret_reply("[ERROR] model unavailable"), None);
    }

    #[test]
    fn test_interpret_code_reply() {
        let code = interpret_reply("def f():\n    return 1").unwrap();
        assert!(code.starts_with("def f():"));
    }

    #[test]
    fn test_sanitize_extracts_fenced_block() {
        let raw = "Here is the improved code:\n```python\ndef f():\n    return 1\n```\nHope it helps!";
        assert_eq!(sanitize_reply(raw), "def f():\n    return 1");
    }

    #[test]
    fn test_sanitize_strips_prose_before_code() {
        let raw = "Sure! The refactored version:\ndef f():\n    return 1";
        assert_eq!(sanitize_reply(raw), "def f():\n    return 1");
    }

    #[test]
    fn test_sanitize_passthrough_plain_code() {
        let raw = "import os\nprint(os.getcwd())";
        assert_eq!(sanitize_reply(raw), raw);
    }

    #[test]
    fn test_command_oracle_returns_stdout() {
        let oracle = CommandOracle {
            command: "cat >/dev/null; printf 'def f():\\n    pass\\n'".to_string(),
        };
        let reply = oracle.rewrite("anything").unwrap();
        assert_eq!(reply, "def f():\n    pass\n");
    }

    #[test]
    fn test_command_oracle_failure_becomes_sentinel() {
        let oracle = CommandOracle {
            command: "cat >/dev/null; exit 3".to_string(),
        };
        let reply = oracle.rewrite("anything").unwrap();
        assert!(reply.starts_with(FAILURE_SENTINEL));
        assert_eq!(interpret_reply(&reply), None);
    }

    #[test]
    fn test_ollama_unreachable_is_transport_error() {
        let oracle = OllamaOracle {
            host: "127.0.0.1:19999".to_string(), // not running
            model: "any".to_string(),
            timeout_ms: 100,
        };
        assert!(oracle.rewrite("prompt").is_err());
    }
}
