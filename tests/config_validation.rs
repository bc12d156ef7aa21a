use std::collections::HashMap;
use tempfile::TempDir;

use meshgram::config::{Config, ConfigError};
use meshgram::mesh::MessageKind;

const FULL: &str = r#"
[source]
host = "mqtt.meshtastic.local"
port = 1884
username = "bridge"
password = "secret"
topic = "msh/EU_868/2/json/#"
qos = 1
reconnect_backoff_seconds = [1, 5]

[telegram]
bot_token = "123456:ABC"
group_chat_id = -1001234567890
allowed_user_ids = [111, 222]

[grouping]
quiet_period_ms = 2000
max_window_ms = 10000
flush_kinds = ["position"]

[formatting]
show_time = true

[node_cache]
file = "cache/nodes.json"

[[proxy_targets]]
name = "archive"
host = "archive.local"
topic_prefix = "fwd/"
qos = 1

[[proxy_targets]]
name = "lab"
host = "lab.local"
port = 8883
enabled = false
"#;

#[tokio::test]
async fn load_full_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    std::fs::write(&path, FULL).unwrap();

    let cfg = Config::load(path.to_str().unwrap()).await.unwrap();
    cfg.validate().unwrap();

    assert_eq!(cfg.source.host, "mqtt.meshtastic.local");
    assert_eq!(cfg.source.port, 1884);
    assert_eq!(cfg.source.qos, 1);
    assert_eq!(cfg.telegram.group_chat_id, Some(-1001234567890));
    assert_eq!(cfg.telegram.allowed_user_ids, vec![111, 222]);
    assert!(cfg.telegram.node_updates);
    assert_eq!(
        cfg.grouping.parsed_flush_kinds().unwrap(),
        vec![MessageKind::Position]
    );
    assert!(cfg.formatting.show_time);
    assert!(cfg.formatting.show_signal);
    assert_eq!(cfg.node_cache.file.as_deref(), Some("cache/nodes.json"));

    assert_eq!(cfg.proxy_targets.len(), 2);
    let archive = &cfg.proxy_targets[0];
    assert_eq!(archive.port, 1883);
    assert!(archive.enabled);
    assert_eq!(archive.client_id(), "meshgram-archive");
    assert_eq!(archive.reconnect_backoff_seconds, vec![1, 2, 5, 10, 30]);
    assert!(!cfg.proxy_targets[1].enabled);
}

#[tokio::test]
async fn missing_file_is_an_error() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("nope.toml");
    assert!(Config::load(path.to_str().unwrap()).await.is_err());
}

#[tokio::test]
async fn create_default_writes_loadable_file_once() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");
    let path = path.to_str().unwrap();

    Config::create_default(path).await.unwrap();
    let cfg = Config::load(path).await.unwrap();
    assert!(matches!(cfg.validate(), Err(ConfigError::MissingBotToken)));

    std::fs::write(path, "# edited by hand\n").unwrap();
    assert!(Config::create_default(path).await.is_err());
    assert_eq!(std::fs::read_to_string(path).unwrap(), "# edited by hand\n");
}

#[test]
fn environment_overrides_file_values() {
    let mut cfg = Config::from_toml(FULL).unwrap();
    let env: HashMap<&str, &str> = [
        ("TELEGRAM_BOT_TOKEN", "999:ENV"),
        ("TELEGRAM_ALLOWED_USER_IDS", "5, 6"),
        ("MQTT_SOURCE_PORT", "1999"),
        ("MQTT_SOURCE_HOST", "   "),
    ]
    .into_iter()
    .collect();
    cfg.apply_overrides(|var| env.get(var).map(|v| v.to_string()))
        .unwrap();

    assert_eq!(cfg.telegram.bot_token, "999:ENV");
    assert_eq!(cfg.telegram.allowed_user_ids, vec![5, 6]);
    assert_eq!(cfg.source.port, 1999);
    // blank values leave the file value in place
    assert_eq!(cfg.source.host, "mqtt.meshtastic.local");
    assert_eq!(cfg.telegram.group_chat_id, Some(-1001234567890));
}

#[test]
fn bad_environment_values_are_reported() {
    let mut cfg = Config::from_toml(FULL).unwrap();
    let err = cfg
        .apply_overrides(|var| (var == "MQTT_SOURCE_PORT").then(|| "http".to_string()))
        .unwrap_err();
    assert!(matches!(
        err,
        ConfigError::InvalidEnv {
            var: "MQTT_SOURCE_PORT",
            ..
        }
    ));
}

fn with_extra(extra: &str) -> Config {
    Config::from_toml(&format!("{}\n{}", FULL, extra)).unwrap()
}

#[test]
fn invalid_proxy_targets_are_rejected() {
    let dup = with_extra("[[proxy_targets]]\nname = \"archive\"\nhost = \"x\"\n");
    assert!(matches!(
        dup.validate(),
        Err(ConfigError::DuplicateProxyTarget(n)) if n == "archive"
    ));

    let unnamed = with_extra("[[proxy_targets]]\nname = \" \"\nhost = \"x\"\n");
    assert!(matches!(
        unnamed.validate(),
        Err(ConfigError::UnnamedProxyTarget)
    ));

    let wildcard = with_extra("[[proxy_targets]]\nname = \"w\"\nhost = \"x\"\ntopic_prefix = \"fwd/#\"\n");
    assert!(matches!(wildcard.validate(), Err(ConfigError::Invalid { .. })));

    let qos = with_extra("[[proxy_targets]]\nname = \"q\"\nhost = \"x\"\nqos = 3\n");
    let err = qos.validate().unwrap_err();
    assert!(err.to_string().contains("proxy_targets[q].qos"), "{}", err);

    let backoff =
        with_extra("[[proxy_targets]]\nname = \"b\"\nhost = \"x\"\nreconnect_backoff_seconds = [0]\n");
    assert!(matches!(
        backoff.validate(),
        Err(ConfigError::InvalidBackoff { .. })
    ));
}

#[test]
fn inconsistent_grouping_is_rejected() {
    let mut cfg = Config::from_toml(FULL).unwrap();
    cfg.grouping.max_window_ms = 500;
    assert!(matches!(cfg.validate(), Err(ConfigError::Grouping(_))));

    let mut cfg = Config::from_toml(FULL).unwrap();
    cfg.grouping.flush_kinds = vec!["weather".into()];
    assert!(matches!(
        cfg.validate(),
        Err(ConfigError::UnknownFlushKind(k)) if k == "weather"
    ));
}

#[test]
fn source_client_id_defaults_to_per_process_id() {
    let cfg = Config::from_toml(FULL).unwrap();
    assert_eq!(cfg.source.client_id, None);
    let id = cfg.source.client_id();
    assert_eq!(id, format!("meshgram-{}", std::process::id()));
    assert_ne!(id, cfg.proxy_targets[0].client_id());

    let mut source = cfg.source.clone();
    source.client_id = Some("  ".into());
    assert!(source.client_id().starts_with("meshgram-"));
    source.client_id = Some("home-bridge".into());
    assert_eq!(source.client_id(), "home-bridge");

    // the generated default is not written back to disk
    let written = toml::to_string_pretty(&Config::default()).unwrap();
    assert!(!written.contains("client_id"), "{}", written);
}

#[test]
fn bad_source_settings_are_rejected() {
    let mut cfg = Config::from_toml(FULL).unwrap();
    cfg.source.topic = "msh/#/json".into();
    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));

    let mut cfg = Config::from_toml(FULL).unwrap();
    cfg.source.host = String::new();
    assert!(matches!(cfg.validate(), Err(ConfigError::Invalid { .. })));
}
