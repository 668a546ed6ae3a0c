//! Configuration file loading and engine construction from config

use bitesized::config::Config;
use bitesized::engine::memory::InMemoryStore;
use bitesized::{Bitesized, Granularity};
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_save_and_load_round_trip() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("bitesized.toml");
    let path = path.to_str().unwrap();

    let mut config = Config::default();
    config.engine.key_prefix = "analytics".to_string();
    config.engine.intervals = vec![Granularity::Day, Granularity::Week, Granularity::All];
    config.engine.scratch_ttl_secs = 0;
    config.redis.url = "redis://cache.internal:6380/2".to_string();
    config.save_to_file(path).unwrap();

    let loaded = Config::from_file(path).unwrap();
    assert_eq!(loaded.engine.key_prefix, "analytics");
    assert_eq!(
        loaded.engine.intervals,
        vec![Granularity::Day, Granularity::Week, Granularity::All]
    );
    assert_eq!(loaded.engine.scratch_ttl(), None);
    assert_eq!(loaded.redis.url, "redis://cache.internal:6380/2");
    assert!(loaded.validate().is_ok());
}

#[test]
fn test_minimal_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("minimal.toml");
    std::fs::write(
        &path,
        r#"
        [redis]
        command_timeout_ms = 250
        "#,
    )
    .unwrap();

    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    assert_eq!(
        config.redis.to_redis_config().command_timeout,
        Duration::from_millis(250)
    );
    assert_eq!(config.engine.intervals.len(), 5);
    assert_eq!(config.logging.level, "info");
}

#[test]
fn test_missing_and_malformed_files() {
    let temp_dir = TempDir::new().unwrap();

    let missing = temp_dir.path().join("nope.toml");
    let err = Config::from_file(missing.to_str().unwrap()).unwrap_err();
    assert!(err.contains("Failed to read"));

    let malformed = temp_dir.path().join("bad.toml");
    std::fs::write(&malformed, "[engine\nkey_prefix = ").unwrap();
    let err = Config::from_file(malformed.to_str().unwrap()).unwrap_err();
    assert!(err.contains("Failed to parse"));
}

#[tokio::test]
async fn test_engine_from_loaded_config() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("engine.toml");
    std::fs::write(
        &path,
        r#"
        [engine]
        key_prefix = "shop"
        intervals = ["day", "month"]
        "#,
    )
    .unwrap();

    let config = Config::from_file(path.to_str().unwrap()).unwrap();
    let engine = Bitesized::builder()
        .with_store(InMemoryStore::new())
        .with_config(&config.engine)
        .unwrap()
        .build()
        .unwrap();

    let now = chrono::Utc::now();
    engine.track("purchase", "alice", now).await.unwrap();

    assert_eq!(engine.count("purchase", now, Granularity::Month).await.unwrap(), 1);
    // Not tracked, so nothing was written there
    assert_eq!(engine.count("purchase", now, Granularity::Week).await.unwrap(), 0);
    assert!(engine
        .event_key("purchase", now, Granularity::Day)
        .unwrap()
        .starts_with("shop:event:purchase:day:"));
}
