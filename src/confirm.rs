//! Operator confirmation.

use std::io::{BufRead, IsTerminal, Write};

use anyhow::{bail, Result};

/// Warning shown before any destructive run.
pub const RECOVERY_PROMPT: &str = "\
This program should only be used to recover from specific consensus
HA related problems. Casual use is strongly discouraged.
Irreversible damage may be caused to a controller deployment through
improper use of this tool.

Aside from limited cases, this program should not be run while
controller machine agents are running.

Ok to proceed?";

/// Ask `question` on `output` and read a y/n answer from `input`.
///
/// Anything other than `y` or `yes` (case-insensitive), including EOF, is a
/// no.
pub fn prompt_yn<R: BufRead, W: Write>(question: &str, input: &mut R, output: &mut W) -> Result<bool> {
    write!(output, "{question} [y/n] ")?;
    output.flush()?;

    let mut answer = String::new();
    if input.read_line(&mut answer)? == 0 {
        return Ok(false);
    }
    Ok(matches!(
        answer.trim().to_lowercase().as_str(),
        "y" | "yes"
    ))
}

/// Guard: prompt on the terminal unless `yes` was passed.
///
/// In non-interactive (piped) mode `--yes` is required.
pub fn confirm(yes: bool, question: &str) -> Result<bool> {
    if yes {
        return Ok(true);
    }

    let stdin = std::io::stdin();
    if !stdin.is_terminal() {
        bail!("Non-interactive mode: use --yes to confirm recovery without a prompt.");
    }

    let mut input = stdin.lock();
    prompt_yn(question, &mut input, &mut std::io::stdout())
}
