//! Tests for configuration loading and validation

#[cfg(test)]
mod tests {
    use super::super::*;
    use crate::errors::ConfigError;
    use std::io::Write;
    use std::path::PathBuf;
    use std::time::Duration;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_document_yields_defaults() {
        let config = ConfigLoader::from_str("").unwrap();
        assert_eq!(config.server.bind_addr, "127.0.0.1:8080");
        assert_eq!(config.execution.max_concurrent_processes, 50);
        assert_eq!(config.execution.acquire_timeout(), Duration::from_secs(3));
        assert_eq!(config.artifacts.cache_duration(), Duration::from_secs(60));
        assert_eq!(config.sandbox.cgroup.period_us, 100_000);
        assert!(!config.sandbox.cgroup.enabled);
    }

    #[test]
    fn test_partial_sections_keep_other_defaults() {
        let yaml = r#"
execution:
  run_timeout_secs: 5
compiler:
  program: kddp
  args: [kompiliere]
"#;
        let config = ConfigLoader::from_str(yaml).unwrap();
        assert_eq!(config.execution.run_timeout(), Duration::from_secs(5));
        assert_eq!(config.execution.max_concurrent_processes, 50);
        assert_eq!(config.compiler.program, "kddp");
        assert_eq!(config.compiler.args, vec!["kompiliere".to_string()]);
        assert_eq!(config.compiler.link_flags, vec!["-static".to_string()]);
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let yaml = "execution:\n  max_concurrent_processes: 0\n";
        let err = ConfigLoader::from_str(yaml).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_cpu_percent_out_of_range_rejected_only_when_enabled() {
        let disabled = "sandbox:\n  cgroup:\n    cpu_limit_percent: 250\n";
        assert!(ConfigLoader::from_str(disabled).is_ok());

        let enabled = "sandbox:\n  cgroup:\n    enabled: true\n    cpu_limit_percent: 250\n";
        assert!(matches!(
            ConfigLoader::from_str(enabled),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_bad_bind_address_rejected() {
        let yaml = "server:\n  bind_addr: not-an-address\n";
        assert!(matches!(
            ConfigLoader::from_str(yaml),
            Err(ConfigError::Invalid(_))
        ));
    }

    #[test]
    fn test_malformed_yaml_is_parse_error() {
        let yaml = "execution: [unclosed";
        assert!(matches!(
            ConfigLoader::from_str(yaml),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            "artifacts:\n  scratch_dir: /tmp/sandpit-test\n  cache_duration_secs: 5"
        )
        .unwrap();

        let config = load_config(file.path()).await.unwrap();
        assert_eq!(
            config.artifacts.scratch_dir,
            PathBuf::from("/tmp/sandpit-test")
        );
        assert_eq!(config.artifacts.cache_duration_secs, 5);
    }

    #[tokio::test]
    async fn test_missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::from_file_or_default(dir.path().join("absent.yaml"))
            .await
            .unwrap();
        assert_eq!(config.logging.level, "info");

        let err = ConfigLoader::from_file(dir.path().join("absent.yaml"))
            .await
            .unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
