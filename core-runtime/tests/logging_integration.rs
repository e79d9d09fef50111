//! Integration tests for the logging system

use bridge_traits::log::LogLevel;
use core_runtime::logging::{
    init_logging, redact_if_sensitive, redact_url, strip_path, LogFormat, LoggingConfig,
};

#[test]
fn test_config_chaining() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Warn)
        .with_spans(false)
        .with_target(false)
        .with_thread_info(true);

    assert_eq!(config.format, LogFormat::Compact);
    assert_eq!(config.level, LogLevel::Warn);
    assert!(!config.enable_spans);
    assert!(!config.display_target);
    assert!(config.display_thread_info);
}

#[test]
fn test_format_selection() {
    #[cfg(debug_assertions)]
    assert_eq!(LoggingConfig::default().format, LogFormat::Pretty);

    #[cfg(not(debug_assertions))]
    assert_eq!(LoggingConfig::default().format, LogFormat::Json);
}

#[test]
fn test_redaction_credentials() {
    assert_eq!(redact_if_sensitive("authorization", "Bearer abc"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("sig_signature", "deadbeef"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("track_id", "12345"), "12345");
    assert_eq!(redact_if_sensitive("title", "Song Name"), "Song Name");
}

#[test]
fn test_redact_url() {
    assert_eq!(
        redact_url("https://cdn.example.com/audio.webm?sig=abc&expire=1"),
        "https://cdn.example.com/audio.webm?[REDACTED]"
    );
    assert_eq!(
        redact_url("https://cdn.example.com/audio.webm#t=10"),
        "https://cdn.example.com/audio.webm?[REDACTED]"
    );
    assert_eq!(
        redact_url("https://cdn.example.com/audio.webm"),
        "https://cdn.example.com/audio.webm"
    );
}

#[test]
fn test_path_stripping() {
    assert_eq!(strip_path("/home/user/music/song.flac"), "song.flac");
    assert_eq!(strip_path("C:\\Users\\John\\Music\\song.mp3"), "song.mp3");
    assert_eq!(strip_path("filename.ogg"), "filename.ogg");
    assert_eq!(strip_path("/var/log/"), "");
    assert_eq!(strip_path(""), "");
}

#[test]
fn test_second_initialization_fails() {
    let config = LoggingConfig::default()
        .with_format(LogFormat::Compact)
        .with_level(LogLevel::Error);

    // The first call may already have been made by another test binary
    // thread; either way the second one must fail.
    let _ = init_logging(config.clone());
    assert!(matches!(
        init_logging(config),
        Err(core_runtime::Error::LoggingInit(_))
    ));
}
