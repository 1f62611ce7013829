use std::collections::HashMap;
use std::io::Write;
use std::net::SocketAddr;

use cgi_bridge::bridge::mux::MultiplexerChoice;
use cgi_bridge::config::ServerConfig;
use cgi_bridge::{AppError, BridgeConfig};

fn sample_toml() -> &'static str {
    r#"
command = "/usr/bin/perl /usr/share/gitweb/gitweb.cgi"
merge_stderr = true
multiplexer = "buffered"
buffer_size = 4096
max_header_line = 8192

[env]
GITWEB_CONFIG = "/etc/gitweb.conf"
GIT_PROJECT_ROOT = "/srv/git"

[server]
bind = "0.0.0.0:8080"
server_name = "git.example.com"
script_name = "/gitweb"
"#
}

#[test]
fn parses_full_config() {
    let config = BridgeConfig::from_toml_str(sample_toml()).expect("valid config");

    assert_eq!(config.command, "/usr/bin/perl /usr/share/gitweb/gitweb.cgi");
    assert!(config.merge_stderr);
    assert_eq!(config.multiplexer, MultiplexerChoice::Buffered);
    assert_eq!(config.buffer_size, 4096);
    assert_eq!(config.max_header_line, 8192);
    assert_eq!(
        config.server,
        ServerConfig {
            bind: "0.0.0.0:8080".parse::<SocketAddr>().expect("addr"),
            server_name: "git.example.com".into(),
            script_name: "/gitweb".into(),
        }
    );

    let overrides = config.overrides().expect("string overrides");
    let expected: HashMap<String, String> = [
        ("GITWEB_CONFIG", "/etc/gitweb.conf"),
        ("GIT_PROJECT_ROOT", "/srv/git"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_owned(), v.to_owned()))
    .collect();
    assert_eq!(overrides, expected);
}

#[test]
fn minimal_config_uses_defaults() {
    let config = BridgeConfig::from_toml_str("command = \"/bin/cat\"").expect("valid config");

    assert!(!config.merge_stderr);
    assert_eq!(config.multiplexer, MultiplexerChoice::Auto);
    assert_eq!(config.buffer_size, 65_536);
    assert_eq!(config.max_header_line, 1_048_576);
    assert!(config.env.is_empty());
    assert_eq!(config.server, ServerConfig::default());
    assert_eq!(config.server.bind.port(), 8000);
}

#[test]
fn missing_command_is_rejected() {
    let result = BridgeConfig::from_toml_str("merge_stderr = true");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn blank_command_is_rejected() {
    let err = BridgeConfig::from_toml_str("command = \"   \"").expect_err("blank command");
    assert_eq!(err.to_string(), "config: command must not be empty");
}

#[test]
fn zero_buffer_size_is_rejected() {
    let result = BridgeConfig::from_toml_str("command = \"/bin/cat\"\nbuffer_size = 0");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("buffer_size")));
}

#[test]
fn zero_header_limit_is_rejected() {
    let result = BridgeConfig::from_toml_str("command = \"/bin/cat\"\nmax_header_line = 0");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("max_header_line")));
}

#[test]
fn unknown_multiplexer_is_rejected() {
    let result = BridgeConfig::from_toml_str("command = \"/bin/cat\"\nmultiplexer = \"threads\"");
    assert!(matches!(result, Err(AppError::Config(_))));
}

#[test]
fn non_string_env_value_is_rejected() {
    let result = BridgeConfig::from_toml_str("command = \"/bin/cat\"\n[env]\nDEBUG = true");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.contains("DEBUG")));
}

#[test]
fn loads_from_file() {
    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(sample_toml().as_bytes()).expect("write config");

    let config = BridgeConfig::load_from_path(file.path()).expect("valid config file");

    assert_eq!(config.server.script_name, "/gitweb");
}

#[test]
fn missing_file_is_a_config_error() {
    let result = BridgeConfig::load_from_path("/nonexistent/cgi-bridge.toml");
    assert!(matches!(result, Err(AppError::Config(msg)) if msg.starts_with("failed to read config")));
}
