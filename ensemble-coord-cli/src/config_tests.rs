//! Configuration tests for layered file and environment loading

#[cfg(test)]
mod tests {
    use super::super::config::{Config, LogFormat, DEFAULT_STORAGE_ROOT};
    use serial_test::serial;
    use std::env;
    use std::io::Write;
    use std::path::PathBuf;

    fn with_env_var<F: FnOnce()>(key: &str, value: &str, test: F) {
        let original = env::var(key);
        env::set_var(key, value);
        test();
        match original {
            Ok(val) => env::set_var(key, val),
            Err(_) => env::remove_var(key),
        }
    }

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert_eq!(config.storage.root, PathBuf::from(DEFAULT_STORAGE_ROOT));
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
        assert!(config.logging.log_dir().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    #[serial]
    fn test_load_without_sources_uses_defaults() {
        let config = Config::load().expect("Should load config successfully");
        assert_eq!(config.coordination.heartbeat_timeout_seconds, 60);
        assert_eq!(config.coordination.clock_skew_tolerance_seconds, 5);
    }

    #[test]
    #[serial]
    fn test_environment_variable_override() {
        with_env_var(
            "ENSEMBLE_COORD_COORDINATION__HEARTBEAT_TIMEOUT_SECONDS",
            "90",
            || {
                with_env_var("ENSEMBLE_COORD_STORAGE__ROOT", "/tmp/shared-store", || {
                    let config = Config::load().expect("Should load config successfully");
                    assert_eq!(config.coordination.heartbeat_timeout_seconds, 90);
                    assert_eq!(config.storage.root, PathBuf::from("/tmp/shared-store"));
                    assert_eq!(config.coordination.heartbeat_interval_seconds, 10);
                });
            },
        );
    }

    #[test]
    #[serial]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            r#"
[storage]
root = "/srv/agents"

[coordination]
heartbeat_interval_seconds = 5
heartbeat_timeout_seconds = 20
max_pending_items = 100

[logging]
level = "debug"
format = "json"
"#
        )
        .unwrap();

        let config = Config::load_from_file(file.path()).unwrap();
        assert_eq!(config.storage.root, PathBuf::from("/srv/agents"));
        assert_eq!(config.coordination.heartbeat_interval_seconds, 5);
        assert_eq!(config.coordination.max_pending_items, Some(100));
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(config.coordination.default_priority, 5);
    }

    #[test]
    #[serial]
    fn test_invalid_settings_are_rejected() {
        let mut file = tempfile::Builder::new()
            .suffix(".toml")
            .tempfile()
            .unwrap();
        writeln!(
            file,
            "[coordination]\nheartbeat_interval_seconds = 40\nheartbeat_timeout_seconds = 60"
        )
        .unwrap();

        assert!(Config::load_from_file(file.path()).is_err());
    }

    #[test]
    fn test_log_dir_falls_back_to_data_dir() {
        let mut config = Config::default();
        config.logging.file = true;
        if let Some(data_dir) = dirs::data_local_dir() {
            assert_eq!(
                config.logging.log_dir(),
                Some(data_dir.join("ensemble-coord").join("logs"))
            );
        }

        config.logging.file_dir = Some(PathBuf::from("/var/log/agents"));
        assert_eq!(config.logging.log_dir(), Some(PathBuf::from("/var/log/agents")));
    }
}
