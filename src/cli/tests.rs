use super::*;
use crate::mcp::oauth::tokens::{FileTokenStore, OAuthTokens, TokenStore};
use std::fs;
use tempfile::TempDir;

const CONFIG: &str = r#"
[permissions.consumers.guests]
allow = ["read-only"]

[permissions.consumers.ops]
type = "default-allow"

[[tool_groups]]
name = "read-only"
[tool_groups.services]
echo-service = ["echo"]

[[target_servers]]
name = "Echo Service"
type = "stdio"
command = "echo-mcp"

[[target_servers]]
name = "linear"
type = "sse"
url = "https://mcp.linear.app/sse"
"#;

fn parse_args(argv: &[&str]) -> Args {
    Args::try_parse_from(argv)
        .unwrap_or_else(|err| panic!("argv={argv:?} should parse successfully: {err}"))
}

fn write_config(dir: &TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join("config.toml");
    fs::write(&path, contents).expect("config written");
    path
}

#[test]
fn serve_is_the_default_command() {
    let args = parse_args(&["gatehouse"]);
    assert_eq!(args.command, None);
    assert_eq!(args.config, None);
    assert_eq!(args.log_level, None);
}

#[test]
fn global_flags_parse_after_subcommands() {
    let args = parse_args(&[
        "gatehouse",
        "check-config",
        "--config",
        "/tmp/gatehouse.toml",
        "--log-level",
        "debug",
    ]);
    assert_eq!(args.command, Some(Commands::CheckConfig));
    assert_eq!(args.config, Some(PathBuf::from("/tmp/gatehouse.toml")));
    assert_eq!(args.log_level.as_deref(), Some("debug"));
}

#[test]
fn tokens_clear_takes_a_server_name() {
    let args = parse_args(&["gatehouse", "tokens", "clear", "linear"]);
    assert_eq!(
        args.command,
        Some(Commands::Tokens {
            command: TokensCommands::Clear {
                server: "linear".to_string()
            }
        })
    );
    assert!(Args::try_parse_from(["gatehouse", "tokens", "clear"]).is_err());
}

#[test]
fn rust_log_overrides_the_log_level_flag() {
    assert_eq!(log_filter(Some("gatehouse=trace"), Some("warn")), "gatehouse=trace");
    assert_eq!(log_filter(None, Some("warn")), "warn");
    assert_eq!(log_filter(Some("  "), Some("warn")), "warn");
    assert_eq!(log_filter(None, None), "info");
}

#[test]
fn check_config_summarizes_a_valid_file() {
    let dir = TempDir::new().unwrap();
    let path = write_config(&dir, CONFIG);

    let summary = check_config(&path).expect("config is valid");
    assert!(summary.contains("Consumers (2):"));
    assert!(summary.contains("  guests\n"));
    assert!(summary.contains("  read-only -> echo-service\n"));
    assert!(summary.contains("  echo-service (stdio)\n"));
    assert!(summary.contains("  linear (sse)\n"));
}

#[test]
fn check_config_rejects_undefined_tool_groups() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[permissions.consumers.guests]
allow = ["missing-group"]
"#,
    );

    let err = check_config(&path).unwrap_err();
    assert!(matches!(err, ConfigError::UnknownToolGroup { .. }), "{err}");
}

#[test]
fn check_config_rejects_duplicate_servers() {
    let dir = TempDir::new().unwrap();
    let path = write_config(
        &dir,
        r#"
[[target_servers]]
name = "echo"
type = "stdio"
command = "a"

[[target_servers]]
name = "ECHO"
type = "stdio"
command = "b"
"#,
    );

    assert!(matches!(
        check_config(&path),
        Err(ConfigError::DuplicateTargetServer { .. })
    ));
}

#[test]
fn clear_tokens_removes_the_stored_file() {
    let dir = TempDir::new().unwrap();
    let tokens_dir = dir.path().join("tokens");
    let store = FileTokenStore::new(tokens_dir.clone());
    store
        .save("linear", &OAuthTokens::bearer("secret"))
        .expect("tokens saved");

    let mut config = GatewayConfig::default();
    config.oauth.tokens_dir = Some(tokens_dir);

    assert!(clear_tokens(&config, "Linear").unwrap());
    assert_eq!(store.load("linear").unwrap(), None);
    assert!(!clear_tokens(&config, "linear").unwrap());
}
