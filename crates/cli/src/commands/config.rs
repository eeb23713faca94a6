use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use reimburse_core::config::{AppConfig, CurrencyProvider, LoadOptions};
use toml::Value;

struct ConfigField {
    key_path: &'static str,
    env_keys: &'static [&'static str],
    value: String,
}

pub fn run() -> String {
    let config = match AppConfig::load(LoadOptions::default()) {
        Ok(config) => config,
        Err(error) => return format!("config validation failed: {error}"),
    };

    let config_file_path = detect_config_path();
    let config_file_doc = load_config_file_doc(config_file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for field in effective_fields(&config) {
        let source = field_source(
            field.key_path,
            field.env_keys,
            config_file_doc.as_ref(),
            config_file_path.as_deref(),
        );
        lines.push(render_line(field.key_path, &field.value, source));
    }

    lines.join("\n")
}

fn effective_fields(config: &AppConfig) -> Vec<ConfigField> {
    let provider = match config.currency.provider {
        CurrencyProvider::Static => "static",
        CurrencyProvider::Http => "http",
    };
    let api_key = if config.currency.api_key.is_some() { "<redacted>" } else { "<unset>" };

    vec![
        ConfigField {
            key_path: "database.url",
            env_keys: &["REIMBURSE_DATABASE_URL"],
            value: config.database.url.clone(),
        },
        ConfigField {
            key_path: "database.max_connections",
            env_keys: &["REIMBURSE_DATABASE_MAX_CONNECTIONS"],
            value: config.database.max_connections.to_string(),
        },
        ConfigField {
            key_path: "database.timeout_secs",
            env_keys: &["REIMBURSE_DATABASE_TIMEOUT_SECS"],
            value: config.database.timeout_secs.to_string(),
        },
        ConfigField {
            key_path: "currency.provider",
            env_keys: &["REIMBURSE_CURRENCY_PROVIDER"],
            value: provider.to_string(),
        },
        ConfigField {
            key_path: "currency.base_url",
            env_keys: &["REIMBURSE_CURRENCY_BASE_URL"],
            value: config.currency.base_url.clone(),
        },
        ConfigField {
            key_path: "currency.api_key",
            env_keys: &["REIMBURSE_CURRENCY_API_KEY"],
            value: api_key.to_string(),
        },
        ConfigField {
            key_path: "currency.timeout_secs",
            env_keys: &["REIMBURSE_CURRENCY_TIMEOUT_SECS"],
            value: config.currency.timeout_secs.to_string(),
        },
        ConfigField {
            key_path: "server.bind_address",
            env_keys: &["REIMBURSE_SERVER_BIND_ADDRESS"],
            value: config.server.bind_address.clone(),
        },
        ConfigField {
            key_path: "server.port",
            env_keys: &["REIMBURSE_SERVER_PORT"],
            value: config.server.port.to_string(),
        },
        ConfigField {
            key_path: "server.graceful_shutdown_secs",
            env_keys: &["REIMBURSE_SERVER_GRACEFUL_SHUTDOWN_SECS"],
            value: config.server.graceful_shutdown_secs.to_string(),
        },
        ConfigField {
            key_path: "logging.level",
            env_keys: &["REIMBURSE_LOGGING_LEVEL", "REIMBURSE_LOG_LEVEL"],
            value: config.logging.level.clone(),
        },
        ConfigField {
            key_path: "logging.format",
            env_keys: &["REIMBURSE_LOGGING_FORMAT", "REIMBURSE_LOG_FORMAT"],
            value: format!("{:?}", config.logging.format).to_ascii_lowercase(),
        },
    ]
}

fn detect_config_path() -> Option<PathBuf> {
    [PathBuf::from("reimburse.toml"), PathBuf::from("config/reimburse.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

fn field_source(
    key_path: &str,
    env_keys: &[&str],
    config_file_doc: Option<&Value>,
    config_file_path: Option<&Path>,
) -> String {
    if let Some(env_key) = env_keys.iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = config_file_doc {
        if contains_path(doc, key_path) {
            let file_path = config_file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

fn render_line(key: &str, value: &str, source: String) -> String {
    format!("- {key} = {value} (source: {source})")
}

#[cfg(test)]
mod tests {
    use toml::Value;

    use super::{contains_path, field_source};

    #[test]
    fn nested_key_paths_are_found_in_file() {
        let doc: Value = "[currency]\nprovider = \"http\"\n".parse().expect("toml");

        assert!(contains_path(&doc, "currency.provider"));
        assert!(!contains_path(&doc, "currency.api_key"));
        assert!(!contains_path(&doc, "server.port"));
    }

    #[test]
    fn file_source_is_reported_when_env_is_absent() {
        let doc: Value = "[server]\nport = 9000\n".parse().expect("toml");

        let source = field_source(
            "server.port",
            &["REIMBURSE_TEST_UNSET_PORT_KEY"],
            Some(&doc),
            Some(std::path::Path::new("reimburse.toml")),
        );
        assert_eq!(source, "file (reimburse.toml)");

        let fallback = field_source("server.bind_address", &[], Some(&doc), None);
        assert_eq!(fallback, "default");
    }
}
