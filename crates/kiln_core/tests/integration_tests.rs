use kiln_core::{BuilderConfig, CommandResult, ConfigError, ObjectId, ObjectUrl, ResultStatus};
use std::path::PathBuf;

#[test]
fn test_empty_toml_gives_defaults() {
    let config = BuilderConfig::from_toml("").unwrap();
    assert_eq!(config.build_path, PathBuf::from(".kiln"));
    assert_eq!(config.index_name, "index");
    assert_eq!(config.thread_count, None);
}

#[test]
fn test_single_thread_config() {
    let toml = r#"
build_path = "build"
thread_count = 1
"#;

    let config = BuilderConfig::from_toml(toml).unwrap();
    assert_eq!(config.effective_thread_count(), 1);
    assert_eq!(config.index_name, "index");
}

#[test]
fn test_zero_threads_rejected() {
    let result = BuilderConfig::from_toml("thread_count = 0");

    if let Err(ConfigError::Invalid(msg)) = result {
        assert!(msg.contains("thread_count"));
    } else {
        panic!("Expected Invalid error");
    }
}

#[test]
fn test_wrong_field_type_fails() {
    assert!(matches!(
        BuilderConfig::from_toml("thread_count = \"many\""),
        Err(ConfigError::TomlError(_))
    ));
}

#[test]
fn test_missing_file_is_io_error() {
    let path = std::env::temp_dir().join("kiln_core_missing_config/Kiln.toml");
    assert!(matches!(
        BuilderConfig::from_file(&path),
        Err(ConfigError::IoError(_))
    ));
}

#[test]
fn test_cached_result_shape_is_stable() {
    // Results written by one build are read back by the next one
    let json = r#"{
        "status": "Successful",
        "output_objects": {
            "content:textures/grass": "0101010101010101010101010101010101010101010101010101010101010101"
        },
        "input_dependency_versions": {
            "file:assets/grass.png": "0202020202020202020202020202020202020202020202020202020202020202"
        }
    }"#;

    let result: CommandResult = serde_json::from_str(json).unwrap();
    assert_eq!(result.status, ResultStatus::Successful);
    assert_eq!(
        result.output_objects[&ObjectUrl::content("textures/grass")],
        ObjectId::from_bytes([1; 32])
    );
    assert!(result.depends_on_path("assets/grass.png"));
    assert!(result.tags.is_empty());
    assert!(result.log.is_empty());
}
