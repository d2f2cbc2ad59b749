use std::sync::LazyLock;

use regex_lite::Regex;

use super::{AppConfig, ConfigError, StorageBackend};

static RUNTIME_ARN_PATTERN: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^arn:aws[a-z-]*:bedrock-agentcore:[a-z0-9-]+:[0-9]{12}:runtime/[A-Za-z0-9_-]+$")
        .ok()
});

/// Validate the full application config, returning an error if any rule is violated.
///
/// # Errors
///
/// Returns [`ConfigError::Validation`] when any configuration invariant is violated.
pub fn validate_config(config: &AppConfig) -> Result<(), ConfigError> {
    validate_server_config(config)?;
    validate_runtime(config)?;
    validate_guardrail(config)?;
    validate_storage(config)?;
    validate_auth(config)?;
    validate_log_level(config)?;
    Ok(())
}

fn validation_err(msg: impl Into<String>) -> ConfigError {
    ConfigError::Validation(msg.into())
}

fn validate_server_config(config: &AppConfig) -> Result<(), ConfigError> {
    let server = &config.server;
    if server.body_limit_bytes == 0 {
        return Err(validation_err(
            "server.body_limit_bytes must be greater than 0",
        ));
    }
    if let Some(worker_threads) = server.runtime_worker_threads {
        if worker_threads == 0 {
            return Err(validation_err(
                "server.runtime_worker_threads must be greater than 0 when set",
            ));
        }
    }
    Ok(())
}

fn validate_runtime(config: &AppConfig) -> Result<(), ConfigError> {
    let runtime = &config.runtime;
    let arn = runtime.arn.trim();
    if arn.is_empty() {
        return Err(validation_err("runtime.arn cannot be empty"));
    }
    let arn_ok = RUNTIME_ARN_PATTERN
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(arn));
    if !arn_ok {
        return Err(validation_err(format!(
            "runtime.arn '{arn}' is not an agent runtime ARN"
        )));
    }
    if runtime.region.trim().is_empty() {
        return Err(validation_err("runtime.region cannot be empty"));
    }
    if let Some(endpoint) = runtime.endpoint.as_deref() {
        let parsed = url::Url::parse(endpoint.trim()).map_err(|err| {
            validation_err(format!("runtime.endpoint is not a valid URL: {err}"))
        })?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(validation_err(
                "runtime.endpoint must use http:// or https://",
            ));
        }
    }
    if let Some(qualifier) = runtime.qualifier.as_deref() {
        if qualifier.trim().is_empty() {
            return Err(validation_err(
                "runtime.qualifier cannot be empty when set",
            ));
        }
    }
    if runtime.connect_timeout_secs == 0 {
        return Err(validation_err(
            "runtime.connect_timeout_secs must be greater than 0",
        ));
    }
    if runtime.pool_max_idle_per_host == 0 {
        return Err(validation_err(
            "runtime.pool_max_idle_per_host must be greater than 0",
        ));
    }
    if runtime.default_model_id.trim().is_empty() {
        return Err(validation_err("runtime.default_model_id cannot be empty"));
    }
    Ok(())
}

fn validate_guardrail(config: &AppConfig) -> Result<(), ConfigError> {
    let guardrail = &config.guardrail;
    let id = guardrail.id.as_deref().map(str::trim);
    if id == Some("") {
        return Err(validation_err("guardrail.id cannot be empty when set"));
    }
    if guardrail.version.is_some() && id.is_none() {
        return Err(validation_err(
            "guardrail.version requires guardrail.id",
        ));
    }
    Ok(())
}

fn validate_storage(config: &AppConfig) -> Result<(), ConfigError> {
    let storage = &config.storage;
    if storage.backend == StorageBackend::File && storage.data_dir.is_none() {
        return Err(validation_err(
            "storage.data_dir is required for the file backend",
        ));
    }
    for (field, table) in [
        ("usage_table", &storage.usage_table),
        ("guardrail_table", &storage.guardrail_table),
        ("feedback_table", &storage.feedback_table),
    ] {
        if table.trim().is_empty() {
            return Err(validation_err(format!("storage.{field} cannot be empty")));
        }
        if !table
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
        {
            return Err(validation_err(format!(
                "storage.{field} may only contain letters, digits, '-', '_' and '.'"
            )));
        }
    }
    if storage.usage_table == storage.guardrail_table
        || storage.usage_table == storage.feedback_table
        || storage.guardrail_table == storage.feedback_table
    {
        return Err(validation_err(
            "storage.usage_table, storage.guardrail_table and storage.feedback_table must differ",
        ));
    }
    Ok(())
}

fn validate_auth(config: &AppConfig) -> Result<(), ConfigError> {
    let auth = &config.auth;
    for (field, name) in [
        ("user_id_header", &auth.user_id_header),
        ("user_email_header", &auth.user_email_header),
    ] {
        if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
            return Err(validation_err(format!(
                "auth.{field} '{name}' is not a valid header name"
            )));
        }
    }
    if auth.dev_mode && auth.dev_user_id.trim().is_empty() {
        return Err(validation_err(
            "auth.dev_user_id cannot be empty when dev_mode is enabled",
        ));
    }
    Ok(())
}

fn validate_log_level(config: &AppConfig) -> Result<(), ConfigError> {
    let valid_levels = ["DEBUG", "INFO", "WARNING", "ERROR", "CRITICAL", "DISABLED"];
    if !valid_levels.contains(&config.features.log_level.to_uppercase().as_str()) {
        return Err(validation_err(format!(
            "log_level must be one of {valid_levels:?}"
        )));
    }
    Ok(())
}
