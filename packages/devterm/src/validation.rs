//! Checks on user-supplied names, paths and descriptions.

use std::path::{Component, Path};

use crate::error::TerminalError;

const MAX_NAME_CHARS: usize = 100;
const MAX_DESCRIPTION_CHARS: usize = 500;

/// Shells a terminal may run.
pub const ALLOWED_SHELLS: [&str; 8] = [
    "/bin/bash",
    "/bin/sh",
    "/bin/zsh",
    "/bin/fish",
    "/usr/bin/bash",
    "/usr/bin/sh",
    "/usr/bin/zsh",
    "/usr/bin/fish",
];

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_')
}

fn check_name(raw: &str) -> Result<String, String> {
    let name = raw.trim();
    if name.is_empty() {
        return Err("cannot be empty".to_string());
    }
    if name.chars().count() > MAX_NAME_CHARS || !name.chars().all(is_name_char) {
        return Err(format!(
            "can only contain letters, numbers, spaces, dashes, and underscores (max {MAX_NAME_CHARS} characters)"
        ));
    }
    Ok(name.to_string())
}

/// Returns the trimmed title.
pub fn validate_title(raw: &str) -> Result<String, TerminalError> {
    check_name(raw).map_err(|reason| TerminalError::InvalidTitle(format!("title {reason}")))
}

/// Returns the trimmed workspace name.
pub fn validate_workspace_name(raw: &str) -> Result<String, TerminalError> {
    check_name(raw).map_err(|reason| TerminalError::InvalidInput(format!("name {reason}")))
}

/// Drops control characters other than newline and tab, then trims.
pub fn sanitize_description(raw: &str) -> Result<String, TerminalError> {
    let cleaned: String = raw
        .chars()
        .filter(|c| !c.is_control() || matches!(c, '\n' | '\t'))
        .collect();
    let cleaned = cleaned.trim();
    if cleaned.chars().count() > MAX_DESCRIPTION_CHARS {
        return Err(TerminalError::InvalidInput(format!(
            "description cannot exceed {MAX_DESCRIPTION_CHARS} characters"
        )));
    }
    Ok(cleaned.to_string())
}

/// Absolute, without `..` segments.
pub fn validate_path(field: &str, raw: &str) -> Result<(), TerminalError> {
    let path = Path::new(raw);
    if !path.is_absolute() {
        return Err(TerminalError::InvalidInput(format!(
            "{field} must be an absolute path"
        )));
    }
    if path.components().any(|c| c == Component::ParentDir) {
        return Err(TerminalError::InvalidInput(format!(
            "{field} cannot contain '..'"
        )));
    }
    Ok(())
}

/// A path check plus membership in [`ALLOWED_SHELLS`].
pub fn validate_shell(raw: &str) -> Result<(), TerminalError> {
    validate_path("shell", raw)?;
    if !ALLOWED_SHELLS.contains(&raw) {
        return Err(TerminalError::InvalidInput(format!(
            "shell must be one of: {}",
            ALLOWED_SHELLS.join(", ")
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn title_is_trimmed() {
        assert_eq!(validate_title("  Work  ").unwrap(), "Work");
        assert_eq!(validate_title("build_2-final").unwrap(), "build_2-final");
    }

    #[test]
    fn title_rejects_empty_and_symbols() {
        assert!(matches!(validate_title("   "), Err(TerminalError::InvalidTitle(_))));
        assert!(validate_title("rm -rf /").is_err());
        assert!(validate_title("<script>").is_err());
        assert!(validate_title("caf\u{e9}").is_err());
    }

    #[test]
    fn title_length_limit() {
        assert!(validate_title(&"a".repeat(100)).is_ok());
        assert!(validate_title(&"a".repeat(101)).is_err());
    }

    #[test]
    fn description_strips_control_chars() {
        let cleaned = sanitize_description(" line one\n\x07line two\t ").unwrap();
        assert_eq!(cleaned, "line one\nline two");
        assert!(sanitize_description(&"x".repeat(501)).is_err());
        assert_eq!(sanitize_description("").unwrap(), "");
    }

    #[test]
    fn paths_must_be_absolute_without_parent_segments() {
        assert!(validate_path("shell", "/bin/bash").is_ok());
        assert!(validate_path("shell", "bash").is_err());
        assert!(validate_path("working_dir", "/home/dev/../root").is_err());
    }

    #[test]
    fn shell_must_be_listed() {
        assert!(validate_shell("/bin/bash").is_ok());
        assert!(validate_shell("/usr/bin/fish").is_ok());
        assert!(validate_shell("/usr/local/bin/nu").is_err());
        assert!(validate_shell("bash").is_err());
        assert!(matches!(
            validate_shell("/bin/true $(touch /tmp/marker)"),
            Err(TerminalError::InvalidInput(_))
        ));
        assert!(validate_shell("/bin/bash; id").is_err());
    }
}
