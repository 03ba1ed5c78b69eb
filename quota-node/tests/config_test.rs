//! Node config parsing integration tests

use quota_engine::{AccessLevel, EngineConfig, ResourceConfig};

const EXAMPLE: &str = include_str!("../quota-node.example.toml");

#[test]
fn test_example_config_parses() {
    let config: toml::Value = toml::from_str(EXAMPLE).expect("valid TOML");

    let node = config.get("node").expect("node section");
    assert_eq!(node.get("id").unwrap().as_str().unwrap(), "allocation-east-1");

    let resources = config.get("resources").unwrap().as_array().unwrap();
    assert_eq!(resources.len(), 2);
}

#[test]
fn test_example_resources_are_valid() {
    let config: toml::Value = toml::from_str(EXAMPLE).unwrap();
    let resources: Vec<ResourceConfig> = config
        .get("resources")
        .unwrap()
        .clone()
        .try_into()
        .expect("resource configs");

    for resource in &resources {
        resource.validate().expect("valid resource");
    }

    let gpu = &resources[0];
    assert_eq!(gpu.reserved_capacity(), 4);
    assert_eq!(gpu.general_capacity(), 12);
    assert_eq!(gpu.max_session_secs, Some(14_400));
    assert_eq!(gpu.queue_timeout_secs, 3600);

    let lab = &resources[1];
    assert_eq!(lab.required_access_level, AccessLevel::Member);
    assert_eq!(lab.period_secs, 86_400);
}

#[test]
fn test_engine_section_overrides_defaults() {
    let config: toml::Value = toml::from_str(EXAMPLE).unwrap();
    let engine: EngineConfig = config.get("engine").unwrap().clone().try_into().unwrap();

    assert_eq!(engine.maintenance.interval_secs, 30);
    assert_eq!(engine.hoarding.cooldown_secs, 21_600);
    // Untouched sections keep their defaults
    assert_eq!(engine.queue.default_session_secs, 1800);
    assert_eq!(engine.scoring, EngineConfig::default().scoring);
}

#[test]
fn test_engine_yaml_matches_toml() {
    let yaml = "maintenance:\n  interval_secs: 30\nhoarding:\n  cooldown_secs: 21600\n";
    let engine = EngineConfig::from_yaml(yaml).unwrap();
    assert_eq!(engine.maintenance.interval_secs, 30);
    assert_eq!(engine.hoarding.cooldown_secs, 21_600);
}
