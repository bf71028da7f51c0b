use thiserror::Error;

/// Top-level error type for the Tambourine client.
///
/// Subsystem crates define their own error types that wrap this one via
/// `#[from]`, so the `?` operator works across crate boundaries.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum TambourineError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Identity error: {0}")]
    Identity(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Audio error: {0}")]
    Audio(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Invalid value for {field}: {message}")]
    InvalidSetting { field: String, message: String },

    #[error("Hotkey {hotkey} conflicts with the {conflicts_with} hotkey")]
    HotkeyConflict {
        hotkey: String,
        conflicts_with: String,
    },

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl From<toml::de::Error> for TambourineError {
    fn from(err: toml::de::Error) -> Self {
        TambourineError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for TambourineError {
    fn from(err: toml::ser::Error) -> Self {
        TambourineError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for TambourineError {
    fn from(err: serde_json::Error) -> Self {
        TambourineError::Serialization(err.to_string())
    }
}

/// A specialized `Result` type for Tambourine operations.
pub type Result<T> = std::result::Result<T, TambourineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TambourineError::Config("missing field".to_string());
        assert_eq!(err.to_string(), "Configuration error: missing field");
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TambourineError = io_err.into();
        assert!(matches!(err, TambourineError::Io(_)));
        assert!(err.to_string().contains("file not found"));
    }

    #[test]
    fn test_error_display_all_variants() {
        let cases: Vec<(TambourineError, &str)> = vec![
            (
                TambourineError::Storage("disk full".to_string()),
                "Storage error: disk full",
            ),
            (
                TambourineError::Identity("registration refused".to_string()),
                "Identity error: registration refused",
            ),
            (
                TambourineError::Transport("ice failed".to_string()),
                "Transport error: ice failed",
            ),
            (
                TambourineError::Protocol("unknown frame".to_string()),
                "Protocol error: unknown frame",
            ),
            (
                TambourineError::Audio("no device".to_string()),
                "Audio error: no device",
            ),
            (
                TambourineError::InvalidSetting {
                    field: "stt_timeout_seconds".to_string(),
                    message: "must be between 0.1 and 10.0".to_string(),
                },
                "Invalid value for stt_timeout_seconds: must be between 0.1 and 10.0",
            ),
            (
                TambourineError::HotkeyConflict {
                    hotkey: "ctrl+alt+Space".to_string(),
                    conflicts_with: "hold".to_string(),
                },
                "Hotkey ctrl+alt+Space conflicts with the hold hotkey",
            ),
            (TambourineError::ShuttingDown, "Shutdown in progress"),
        ];

        for (error, expected) in cases {
            assert_eq!(error.to_string(), expected);
        }
    }

    #[test]
    fn test_error_from_toml_de() {
        let err: std::result::Result<toml::Value, _> = toml::from_str("invalid = [[[");
        let err: TambourineError = err.unwrap_err().into();
        assert!(matches!(err, TambourineError::Config(_)));
    }

    #[test]
    fn test_error_from_serde_json() {
        let err: std::result::Result<serde_json::Value, _> = serde_json::from_str("{ nope }");
        let err: TambourineError = err.unwrap_err().into();
        assert!(matches!(err, TambourineError::Serialization(_)));
    }

    #[test]
    fn test_result_type_with_question_mark() {
        fn inner() -> Result<String> {
            let io_result: std::result::Result<i32, std::io::Error> = Ok(42);
            let value = io_result?;
            Ok(value.to_string())
        }

        assert_eq!(inner().unwrap(), "42");
    }
}
