use std::path::PathBuf;

use task_logger::config::{
    Config, ENV_CHECKPOINT_ON_ENTRY, ENV_LOG_LEVEL, ENV_LOG_PATH, ENV_OTEL_ENDPOINT,
    ENV_SUPPRESS_ERRORS,
};

const ALL_VARS: [&str; 5] = [
    ENV_LOG_PATH,
    ENV_SUPPRESS_ERRORS,
    ENV_CHECKPOINT_ON_ENTRY,
    ENV_OTEL_ENDPOINT,
    ENV_LOG_LEVEL,
];

fn clear_env() {
    for name in ALL_VARS {
        unsafe { std::env::remove_var(name) };
    }
}

// Environment is process-global, so every env scenario runs in this one test.
#[test]
fn config_from_env_and_file() {
    clear_env();

    let config = Config::from_env().unwrap();
    assert_eq!(config, Config::default());
    assert_eq!(config.log_path, PathBuf::from("default-log.json"));
    assert!(config.suppress_errors);

    unsafe {
        std::env::set_var(ENV_LOG_PATH, "/tmp/batch-log.json");
        std::env::set_var(ENV_SUPPRESS_ERRORS, "no");
        std::env::set_var(ENV_OTEL_ENDPOINT, "");
    }
    let config = Config::from_env().unwrap();
    assert_eq!(config.log_path, PathBuf::from("/tmp/batch-log.json"));
    assert!(!config.suppress_errors);
    assert_eq!(config.otel_endpoint, None);

    // Environment wins over the file.
    let dir = tempfile::tempdir().unwrap();
    let file = dir.path().join("task-logger.toml");
    std::fs::write(
        &file,
        "log_path = \"from-file.json\"\ncheckpoint_on_entry = false\nlog_level = \"debug\"\n",
    )
    .unwrap();
    let config = Config::load(Some(file.as_path())).unwrap();
    assert_eq!(config.log_path, PathBuf::from("/tmp/batch-log.json"));
    assert!(!config.checkpoint_on_entry);
    assert_eq!(config.log_level, "debug");

    unsafe { std::env::set_var(ENV_CHECKPOINT_ON_ENTRY, "sometimes") };
    assert!(Config::from_env().is_err());

    clear_env();
}

#[test]
fn load_fails_for_missing_file() {
    let dir = tempfile::tempdir().unwrap();
    let result = Config::load(Some(dir.path().join("absent.toml").as_path()));
    assert!(matches!(result, Err(task_logger::Error::Io(_))));
}
