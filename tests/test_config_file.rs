//! Tests for the shipped config/default.toml

use std::fs;
use std::path::Path;

use valormm::config;

#[test]
fn test_default_config_file_exists() {
    let path = "config/default.toml";
    assert!(fs::metadata(path).is_ok(), "default.toml config file missing");
}

#[test]
fn test_default_config_file_loads() {
    let cfg = config::load_from(Path::new("config/default.toml"), None, None).unwrap();
    assert_eq!(cfg.server.bind, "127.0.0.1:8000");
    assert_eq!(cfg.vlm.backend, "dummy");
    assert_eq!(cfg.defaults.model_id, "Qwen/Qwen2-VL-2B-Instruct");
    assert!(cfg.vlm.openai.routes.is_empty());
    assert_eq!(cfg.pdf.max_pages, None);
}

#[test]
fn test_default_config_matches_builtin_defaults() {
    let file = config::load_from(Path::new("config/default.toml"), None, None).unwrap();
    let builtin = config::Config::test_default();
    assert_eq!(file.defaults, builtin.defaults);
    assert_eq!(file.server.cors_origins, builtin.server.cors_origins);
    assert_eq!(file.pdf.dpi, builtin.pdf.dpi);
}
