//! CGI environment mapping.
//!
//! The child never sees the bridge's own environment. It receives only the
//! CGI meta-variables listed in [`CGI_VARS`], every `HTTP_*` variable of the
//! request, and the configured overrides, which are applied last.

use std::collections::HashMap;

use crate::{AppError, Result};

/// CGI meta-variables copied from the request into the child's environment.
pub const CGI_VARS: &[&str] = &[
    "SERVER_SOFTWARE",
    "SERVER_NAME",
    "GATEWAY_INTERFACE",
    "SERVER_PROTOCOL",
    "SERVER_PORT",
    "REQUEST_METHOD",
    "PATH_INFO",
    "PATH_TRANSLATED",
    "SCRIPT_NAME",
    "QUERY_STRING",
    "REMOTE_HOST",
    "REMOTE_ADDR",
    "AUTH_TYPE",
    "REMOTE_USER",
    "REMOTE_IDENT",
    "CONTENT_TYPE",
    "CONTENT_LENGTH",
];

/// Prefix of request header variables passed through untouched.
pub const HTTP_PREFIX: &str = "HTTP_";

/// Whether `key` may be copied from the request into the child environment.
#[must_use]
pub fn is_passthrough(key: &str) -> bool {
    key.starts_with(HTTP_PREFIX) || CGI_VARS.contains(&key)
}

/// Build the child environment for one request.
#[must_use]
pub fn map_environment(
    environ: &HashMap<String, String>,
    overrides: &HashMap<String, String>,
) -> HashMap<String, String> {
    let mut mapped: HashMap<String, String> = environ
        .iter()
        .filter(|(key, _)| is_passthrough(key))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    mapped.extend(
        overrides
            .iter()
            .map(|(key, value)| (key.clone(), value.clone())),
    );
    mapped
}

/// Flatten a TOML table of overrides into a string map.
///
/// # Errors
///
/// Returns `AppError::Config` naming the first key whose value is not a
/// string (nested tables, arrays, numbers, booleans, datetimes).
pub fn overrides_from_table(table: &toml::Table) -> Result<HashMap<String, String>> {
    table
        .iter()
        .map(|(key, value)| match value {
            toml::Value::String(text) => Ok((key.clone(), text.clone())),
            other => Err(AppError::Config(format!(
                "env override `{key}` must be a string, found {}",
                other.type_str()
            ))),
        })
        .collect()
}
