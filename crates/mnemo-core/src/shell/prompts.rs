//! Signatures of programs waiting for interactive input.

use std::sync::LazyLock;

use regex::RegexSet;

static PROMPT_SIGNATURES: LazyLock<Option<RegexSet>> = LazyLock::new(|| {
    RegexSet::new([
        r"(?i)pass(?:word|phrase)[^\n:]*:\s*$",
        r"(?i)\(y/n\)",
        r"(?i)\[y/n\]",
        r"(?i)\(yes/no(?:/\[fingerprint\])?\)",
        r"(?i)press any key",
        r"(?i)are you sure",
        r"(?i)do you want to continue",
        r"--More--",
        r"^\(END\)\s*$",
    ])
    .map_err(|err| tracing::error!(%err, "invalid prompt signatures"))
    .ok()
});

/// Longest trailing line inspected; prompts are short.
const MAX_PROMPT_LINE: usize = 512;

/// Returns the trailing unterminated line if it looks like an input prompt.
pub fn detect(output: &[u8]) -> Option<String> {
    let start = output
        .iter()
        .rposition(|&b| b == b'\n')
        .map_or(0, |pos| pos + 1);
    let line = &output[start..];
    if line.is_empty() || line.len() > MAX_PROMPT_LINE {
        return None;
    }
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim_start_matches('\r');
    if trimmed.trim().is_empty() {
        return None;
    }
    let signatures = PROMPT_SIGNATURES.as_ref()?;
    signatures
        .is_match(trimmed)
        .then(|| trimmed.to_string())
}
