//! Clipboard copy by piping into the platform clipboard tool

use crate::error::{Error, Result};
use std::io::{ErrorKind, Write};
use std::process::{Command, Stdio};
use tracing::debug;

/// Clipboard tools in order of preference
const TOOLS: &[(&str, &[&str])] = &[
    ("pbcopy", &[]),
    ("wl-copy", &[]),
    ("xclip", &["-selection", "clipboard"]),
    ("xsel", &["--clipboard", "--input"]),
];

/// Copy `value` to the system clipboard using the first tool that is installed
pub fn copy(value: &str) -> Result<()> {
    copy_with(TOOLS, value)
}

fn copy_with(tools: &[(&str, &[&str])], value: &str) -> Result<()> {
    for (program, args) in tools {
        let mut child = match Command::new(program)
            .args(*args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
        {
            Ok(child) => child,
            Err(e) if e.kind() == ErrorKind::NotFound => continue,
            Err(e) => return Err(Error::Clipboard(format!("{}: {}", program, e))),
        };

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(value.as_bytes())
                .map_err(|e| Error::Clipboard(format!("{}: {}", program, e)))?;
        }

        let status = child
            .wait()
            .map_err(|e| Error::Clipboard(format!("{}: {}", program, e)))?;
        if !status.success() {
            return Err(Error::Clipboard(format!("{} exited with {}", program, status)));
        }

        debug!(tool = %program, "copied value to clipboard");
        return Ok(());
    }

    Err(Error::Clipboard(
        "no clipboard tool found (install pbcopy, wl-copy, xclip or xsel)".to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_tool_available() {
        let err = copy_with(&[("lockbox-no-such-clipboard", &[])], "v").unwrap_err();
        assert!(matches!(err, Error::Clipboard(msg) if msg.contains("no clipboard tool")));
    }

    #[test]
    fn test_first_installed_tool_wins() {
        // `cat` drains stdin and succeeds
        copy_with(&[("lockbox-no-such-clipboard", &[]), ("cat", &[])], "v").unwrap();
    }

    #[test]
    fn test_failing_tool_is_reported() {
        let err = copy_with(&[("false", &[])], "v").unwrap_err();
        assert!(matches!(err, Error::Clipboard(msg) if msg.starts_with("false")));
    }
}
