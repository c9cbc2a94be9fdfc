//! Refuses commands that could damage the host outside the sandbox.

use std::sync::LazyLock;

use regex::Regex;

/// Matches the start of a simple command: line start, after a separator,
/// or inside a subshell / command substitution.
const CMD: &str = r"(?:^|[;&|(\n`]|\$\()\s*";

static PATTERNS: LazyLock<Vec<(Regex, &'static str)>> = LazyLock::new(|| {
    let raw: [(String, &'static str); 9] = [
        (
            r"\brm\s+(?:-\w+\s+)*-\w*[rR]\w*\s+(?:-\w+\s+)*/\*?(?:\s|;|&|\||$)".to_string(),
            "recursive removal of /",
        ),
        (
            r"\bdd\b[^;&|\n]*\bif=/dev/(?:zero|u?random)\b".to_string(),
            "dd from /dev/zero or /dev/random",
        ),
        (r"\bmkfs(?:\.\w+)?\b".to_string(), "filesystem creation"),
        (
            r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:".to_string(),
            "fork bomb",
        ),
        (format!(r"{CMD}sudo\b"), "privilege escalation (sudo)"),
        (format!(r"{CMD}su(?:\s|$)"), "privilege escalation (su)"),
        (
            r"\bchmod\s+(?:-\w+\s+)*0?777\s+/(?:\s|$)".to_string(),
            "chmod 777 on /",
        ),
        (
            format!(r"{CMD}(?:shutdown|reboot|halt|poweroff)\b"),
            "system power control",
        ),
        (
            r"\bkill\s+-(?:9|KILL|SIGKILL)\s+-?\d+".to_string(),
            "kill -9 of a process id",
        ),
    ];
    raw.into_iter()
        .filter_map(|(pattern, reason)| match Regex::new(&pattern) {
            Ok(re) => Some((re, reason)),
            Err(err) => {
                tracing::error!(%pattern, %err, "invalid guard pattern");
                None
            }
        })
        .collect()
});

/// Returns the reason a command is refused, or `None` if it may run.
pub fn check(command: &str) -> Option<&'static str> {
    PATTERNS
        .iter()
        .find(|(re, _)| re.is_match(command))
        .map(|(_, reason)| *reason)
}
