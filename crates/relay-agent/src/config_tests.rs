use super::*;

fn base_config() -> Config {
    Config::parse_from([
        "relay-agent",
        "--name",
        "alice",
        "--socket",
        "/tmp/relay.sock",
    ])
}

#[test]
fn defaults_validate_cleanly() {
    base_config().validate().unwrap();
}

#[test]
fn rejects_reserved_broadcast_name() {
    let mut cfg = base_config();
    cfg.name = "*".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn rejects_out_of_range_idle_threshold() {
    let mut cfg = base_config();
    cfg.idle_threshold = 1.5;
    assert!(cfg.validate().is_err());
}

#[test]
fn rejects_unknown_log_format() {
    let mut cfg = base_config();
    cfg.log_format = "xml".into();
    assert!(cfg.validate().is_err());
}

#[test]
fn session_name_is_prefixed() {
    let cfg = base_config();
    assert_eq!(cfg.session_name(), "relay-alice");
}

#[test]
fn cli_args_splits_on_whitespace() {
    let mut cfg = base_config();
    cfg.cli_args = "--flag value".into();
    assert_eq!(cfg.cli_args(), vec!["--flag".to_string(), "value".to_string()]);
}
