//! Errors raised while wiring the runtime: configuration, host capabilities
//! and the global tracing subscriber.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// A configuration value failed validation.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// A feature is enabled but the host did not provide the bridge it needs.
    #[error("{capability} is required but unavailable: {message}")]
    CapabilityMissing {
        capability: &'static str,
        message: String,
    },

    /// The tracing subscriber could not be installed.
    #[error("Logging setup failed: {0}")]
    LoggingInit(String),
}

impl Error {
    pub fn capability_missing(capability: &'static str, message: impl Into<String>) -> Self {
        Error::CapabilityMissing {
            capability,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capability_missing_names_the_bridge() {
        let err = Error::capability_missing("HttpClient", "inject one or disable remote sources");
        assert_eq!(
            err.to_string(),
            "HttpClient is required but unavailable: inject one or disable remote sources"
        );
        assert!(matches!(
            err,
            Error::CapabilityMissing {
                capability: "HttpClient",
                ..
            }
        ));
    }

    #[test]
    fn test_messages_name_the_failing_stage() {
        let err = Error::LoggingInit("a global subscriber is already set".into());
        assert!(err.to_string().starts_with("Logging setup failed"));
        let err = Error::Config("event_buffer_size must be > 0".into());
        assert!(err.to_string().starts_with("Invalid configuration"));
    }
}
