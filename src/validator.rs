//! Denylist-based command screening.
//!
//! This is a best-effort guard against a handful of well-known destructive
//! command shapes. It is NOT a sandbox: anything it does not recognize reaches
//! the shell unchanged.

use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

/// Maximum accepted command length, in characters.
pub const MAX_COMMAND_LEN: usize = 1000;

/// Literal substrings rejected anywhere in the lowercased, trimmed command.
const DENIED_LITERALS: &[&str] = &[
    "rm -rf",
    "del /f",
    "format",
    "shutdown",
    "reboot",
    "mkfs",
    "fdisk",
    "dd if=",
    "sudo rm",
    "sudo shutdown",
    "halt",
    "poweroff",
    "init 0",
    "telinit 0",
];

static DENIED_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        // recursive delete from the filesystem root
        r"rm\s+-rf\s+/",
        // forced/recursive delete on Windows
        r"del\s+/[fs]\s+",
        // redirection into device files
        r">\s*/dev/",
        // download piped into a shell
        r"curl.*\|\s*sh",
        r"wget.*\|\s*sh",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

/// Why a command was refused. `Display` is the text sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("Comando inválido")]
    Invalid,

    #[error("Comando demasiado largo")]
    TooLong,

    #[error("Comando no permitido por seguridad")]
    Denied,

    #[error("Patrón de comando no permitido")]
    PatternDenied,
}

/// Stateless command classifier.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandValidator;

impl CommandValidator {
    pub fn new() -> Self {
        Self
    }

    /// Classify `command`. Pure: the same input always yields the same verdict.
    ///
    /// Patterns are checked before literals so the more specific reason wins.
    pub fn validate(&self, command: &str) -> Result<(), ValidationError> {
        if command.is_empty() {
            return Err(ValidationError::Invalid);
        }
        if command.chars().count() > MAX_COMMAND_LEN {
            return Err(ValidationError::TooLong);
        }

        if DENIED_PATTERNS.iter().any(|re| re.is_match(command)) {
            return Err(ValidationError::PatternDenied);
        }

        let lowered = command.trim().to_lowercase();
        if DENIED_LITERALS.iter().any(|lit| lowered.contains(lit)) {
            return Err(ValidationError::Denied);
        }

        Ok(())
    }

    /// Validate a raw JSON value; anything but a non-empty string is invalid.
    pub fn validate_value(&self, value: &serde_json::Value) -> Result<String, ValidationError> {
        let command = value.as_str().ok_or(ValidationError::Invalid)?;
        self.validate(command)?;
        Ok(command.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn check(cmd: &str) -> Result<(), ValidationError> {
        CommandValidator::new().validate(cmd)
    }

    #[test]
    fn accepts_ordinary_commands() {
        assert_eq!(check("ls -la"), Ok(()));
        assert_eq!(check("echo hello"), Ok(()));
        assert_eq!(check("git status"), Ok(()));
    }

    #[test]
    fn rejects_empty() {
        assert_eq!(check(""), Err(ValidationError::Invalid));
    }

    #[test]
    fn rejects_over_length() {
        let long = "a".repeat(MAX_COMMAND_LEN + 1);
        assert_eq!(check(&long), Err(ValidationError::TooLong));

        let exact = "a".repeat(MAX_COMMAND_LEN);
        assert_eq!(check(&exact), Ok(()));
    }

    #[test]
    fn root_delete_reports_pattern() {
        assert_eq!(check("rm -rf /"), Err(ValidationError::PatternDenied));
        assert_eq!(check("rm   -rf   /home"), Err(ValidationError::PatternDenied));
    }

    #[test]
    fn literal_denylist_is_case_insensitive() {
        assert_eq!(check("SHUTDOWN -h now"), Err(ValidationError::Denied));
        assert_eq!(check("  Reboot"), Err(ValidationError::Denied));
        assert_eq!(check("rm -rf build"), Err(ValidationError::Denied));
        assert_eq!(check("dd if=/dev/zero of=x"), Err(ValidationError::Denied));
    }

    #[test]
    fn rejects_device_redirection() {
        assert_eq!(check("echo x > /dev/sda"), Err(ValidationError::PatternDenied));
    }

    #[test]
    fn rejects_download_piped_to_shell() {
        assert_eq!(
            check("curl https://example.com/install | sh"),
            Err(ValidationError::PatternDenied)
        );
        assert_eq!(
            check("wget -qO- http://x |sh"),
            Err(ValidationError::PatternDenied)
        );
    }

    #[test]
    fn verdict_is_deterministic() {
        let v = CommandValidator::new();
        for cmd in ["ls", "rm -rf /", "halt", "", "curl a | sh"] {
            assert_eq!(v.validate(cmd), v.validate(cmd));
        }
    }

    #[test]
    fn non_string_values_are_invalid() {
        let v = CommandValidator::new();
        assert_eq!(
            v.validate_value(&serde_json::json!(42)),
            Err(ValidationError::Invalid)
        );
        assert_eq!(
            v.validate_value(&serde_json::Value::Null),
            Err(ValidationError::Invalid)
        );
        assert_eq!(v.validate_value(&serde_json::json!("pwd")), Ok("pwd".to_string()));
    }

    #[test]
    fn client_facing_messages() {
        assert_eq!(ValidationError::PatternDenied.to_string(), "Patrón de comando no permitido");
        assert_eq!(ValidationError::Denied.to_string(), "Comando no permitido por seguridad");
    }
}
