//! Prompt file helpers.

/// System prompt template (`MiniJinja`), rendered every round.
pub const SYSTEM_PROMPT_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/system_prompt.md"
));

/// Guideline written at bootstrap when the sandbox has none.
pub const DEFAULT_GUIDELINE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/default_guideline.md"
));

/// Working memory written at bootstrap when the sandbox has none.
pub const DEFAULT_MEMORY: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/default_memory.md"
));

/// Reminder appended to tool results once too many calls are unsynced.
pub const SYNC_REMINDER_TEMPLATE: &str = include_str!(concat!(
    env!("CARGO_MANIFEST_DIR"),
    "/prompts/sync_reminder.md"
));
