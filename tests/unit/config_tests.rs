use std::time::Duration;

use forcequit::models::process::{Classification, HostProcessRecord};
use forcequit::config::{GlobalConfig, MAX_WAIT_SECONDS};
use forcequit::AppError;

fn sample_toml() -> &'static str {
    r#"
[classification]
protected = ["launchd", "re:^kernel"]
unknown = ["helper*"]
unknown_without_owner = true

[timeouts]
grace_seconds = 5
force_seconds = 1
launch_seconds = 20
hook_seconds = 3
force_spacing_millis = 250

[registry]
reconcile_seconds = 7
subscriber_queue = 64

[governor]
sample_millis = 500
warning_bytes = 1000
emergency_bytes = 2000

[restart]
history_capacity = 4
capable = ["/usr/bin/editor", "com.example.app"]
"#
}

#[test]
fn parses_full_config() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(config.timeouts.grace_seconds, 5);
    assert_eq!(config.registry.subscriber_queue, 64);
    assert_eq!(config.governor.warning_bytes, 1000);
    assert_eq!(config.restart.capable.len(), 2);
    assert!(config.classification.unknown_without_owner);
}

#[test]
fn empty_config_uses_defaults() {
    let config = GlobalConfig::from_toml_str("").expect("empty config parses");
    assert_eq!(config, GlobalConfig::default());

    let termination = config.termination_settings();
    assert_eq!(termination.grace_period, Duration::from_secs(10));
    assert_eq!(termination.force_timeout, Duration::from_secs(2));
    assert_eq!(termination.force_spacing, Duration::from_millis(100));

    let registry = config.registry_settings();
    assert_eq!(registry.base_interval, Duration::from_secs(5));
    assert_eq!(registry.subscriber_queue, 256);

    let governor = config.governor_settings();
    assert_eq!(governor.sample_interval, Duration::from_secs(2));
    assert_eq!(governor.warning_bytes, 256 * 1024 * 1024);
    assert_eq!(governor.emergency_bytes, 512 * 1024 * 1024);

    let restart = config.restart_settings();
    assert_eq!(restart.launch_timeout, Duration::from_secs(10));
    assert_eq!(restart.hook_timeout, Duration::from_secs(10));
    assert_eq!(restart.history_capacity, 32);
    assert!(restart.capable.is_empty());
}

#[test]
fn settings_resolve_durations() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");

    assert_eq!(
        config.termination_settings().force_spacing,
        Duration::from_millis(250)
    );
    assert_eq!(
        config.registry_settings().base_interval,
        Duration::from_secs(7)
    );
    assert_eq!(
        config.governor_settings().sample_interval,
        Duration::from_millis(500)
    );
    let restart = config.restart_settings();
    assert_eq!(restart.launch_timeout, Duration::from_secs(20));
    assert!(restart.capable.contains("com.example.app"));
}

#[test]
fn classification_table_builds_rule() {
    let config = GlobalConfig::from_toml_str(sample_toml()).expect("config parses");
    let rule = config.classification.build_rule().expect("rule builds");

    let classify = |pid, name: &str, owner: Option<&str>| {
        rule.classify(&HostProcessRecord::new(pid, name, owner.map(str::to_owned)))
    };
    assert_eq!(classify(4_200_000, "kernel_task", Some("x")), Classification::Protected);
    assert_eq!(classify(4_200_001, "helper-agent", Some("x")), Classification::Unknown);
    assert_eq!(classify(4_200_002, "worker", None), Classification::Unknown);
    assert_eq!(classify(4_200_003, "worker", Some("x")), Classification::Terminable);
}

#[test]
fn default_rule_protects_self_and_init() {
    let rule = GlobalConfig::default()
        .classification
        .build_rule()
        .expect("default rule builds");

    let own = HostProcessRecord::new(std::process::id(), "forcequit-test", None);
    assert_eq!(rule.classify(&own), Classification::Protected);
    let init = HostProcessRecord::new(1, "init", None);
    assert_eq!(rule.classify(&init), Classification::Protected);
    let finder = HostProcessRecord::new(4242, "Finder", None);
    assert_eq!(rule.classify(&finder), Classification::Protected);
}

#[test]
fn protect_self_can_be_disabled() {
    let config = GlobalConfig::from_toml_str(
        r#"
[classification]
protected = []
protect_self = false
"#,
    )
    .expect("config parses");
    let rule = config.classification.build_rule().expect("rule builds");
    let init = HostProcessRecord::new(1, "init", None);
    assert_eq!(rule.classify(&init), Classification::Terminable);
}

#[test]
fn zero_grace_is_rejected() {
    let result = GlobalConfig::from_toml_str("[timeouts]\ngrace_seconds = 0\n");
    assert!(
        matches!(result, Err(AppError::Config(ref msg)) if msg.contains("grace_seconds")),
        "got {result:?}"
    );
}

#[test]
fn oversized_waits_are_rejected() {
    for raw in [
        "[timeouts]\ngrace_seconds = 9223372036854775807\n",
        "[timeouts]\nforce_seconds = 86401\n",
        "[registry]\nreconcile_seconds = 9999999999\n",
        "[governor]\nsample_millis = 3600001\n",
        "[timeouts]\nforce_spacing_millis = 3600001\n",
    ] {
        let result = GlobalConfig::from_toml_str(raw);
        assert!(matches!(result, Err(AppError::Config(_))), "{raw:?} gave {result:?}");
    }

    let at_cap = format!("[timeouts]\ngrace_seconds = {MAX_WAIT_SECONDS}\n");
    assert!(GlobalConfig::from_toml_str(&at_cap).is_ok());
}

#[test]
fn force_spacing_below_minimum_is_rejected() {
    let result = GlobalConfig::from_toml_str("[timeouts]\nforce_spacing_millis = 50\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn warning_must_be_below_emergency() {
    let result = GlobalConfig::from_toml_str(
        "[governor]\nwarning_bytes = 2000\nemergency_bytes = 2000\n",
    );
    assert!(
        matches!(result, Err(AppError::Config(ref msg)) if msg.contains("warning_bytes")),
        "got {result:?}"
    );
}

#[test]
fn zero_capacities_are_rejected() {
    assert!(GlobalConfig::from_toml_str("[registry]\nsubscriber_queue = 0\n").is_err());
    assert!(GlobalConfig::from_toml_str("[restart]\nhistory_capacity = 0\n").is_err());
}

#[test]
fn invalid_pattern_is_rejected() {
    let result = GlobalConfig::from_toml_str("[classification]\nprotected = [\"re:[\"]\n");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn malformed_toml_is_config_error() {
    let result = GlobalConfig::from_toml_str("[timeouts\n");
    assert!(
        matches!(result, Err(AppError::Config(ref msg)) if msg.starts_with("invalid config")),
        "got {result:?}"
    );
}

#[test]
fn load_from_missing_path_fails() {
    let result = GlobalConfig::load_from_path("/nonexistent/forcequit.toml");
    assert!(matches!(result, Err(AppError::Config(_))));
}
