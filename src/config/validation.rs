//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate addresses, URLs and header/label names
//! - Check cross-section requirements (certificate strategy needs mTLS)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: GatewayConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::net::SocketAddr;

use axum::http::HeaderName;
use thiserror::Error;
use url::Url;

use crate::config::schema::{GatewayConfig, TenantStrategy};

/// One semantic problem in the settings file.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{field}: {message}")]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

pub fn validate_config(config: &GatewayConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if config.listener.max_connections == 0 {
        errors.push(ValidationError::new("listener.max_connections", "must be positive"));
    }
    if config.listener.max_body_size == 0 {
        errors.push(ValidationError::new("listener.max_body_size", "must be positive"));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.cert_path.is_empty() || tls.key_path.is_empty() {
            errors.push(ValidationError::new(
                "listener.tls",
                "cert_path and key_path are required",
            ));
        }
    }

    let mutual_tls = config
        .listener
        .tls
        .as_ref()
        .is_some_and(|tls| tls.client_ca_path.is_some());
    if config.tenant.strategy == TenantStrategy::Certificate && !mutual_tls {
        errors.push(ValidationError::new(
            "tenant.strategy",
            "certificate strategy requires listener.tls.client_ca_path",
        ));
    }
    if config.tenant.label.is_empty() || !is_label_name(&config.tenant.label) {
        errors.push(ValidationError::new(
            "tenant.label",
            format!("'{}' is not a valid label name", config.tenant.label),
        ));
    }
    if config.tenant.strategy == TenantStrategy::Path && config.tenant.path_param.is_empty() {
        errors.push(ValidationError::new("tenant.path_param", "must not be empty"));
    }
    check_header(&mut errors, "tenant.header", &config.tenant.header);
    check_header(&mut errors, "remote_write.tenant_header", &config.remote_write.tenant_header);

    for (field, target) in [
        ("upstreams.query", &config.upstreams.query),
        ("upstreams.rules", &config.upstreams.rules),
        ("upstreams.remote_write", &config.upstreams.remote_write),
    ] {
        if let Some(url) = target {
            check_url(&mut errors, field, url);
        }
    }

    if config.remote_write.max_concurrent_fanouts == 0 {
        errors.push(ValidationError::new(
            "remote_write.max_concurrent_fanouts",
            "must be positive",
        ));
    }

    let mut names = HashSet::new();
    for (i, dest) in config.remote_write.external.iter().enumerate() {
        let field = format!("remote_write.external[{i}]");
        if dest.name.is_empty() {
            errors.push(ValidationError::new(&field, "name must not be empty"));
        } else if !names.insert(dest.name.as_str()) {
            errors.push(ValidationError::new(
                &field,
                format!("duplicate destination name '{}'", dest.name),
            ));
        }
        check_url(&mut errors, &format!("{field}.url"), &dest.url);
        if dest.remote_timeout.is_zero() {
            errors.push(ValidationError::new(&field, "remote_timeout must be positive"));
        }
        if dest.basic_auth.is_some() && dest.bearer_token.is_some() {
            errors.push(ValidationError::new(
                &field,
                "at most one of basic_auth and bearer_token may be set",
            ));
        }
        for name in dest.headers.keys() {
            check_header(&mut errors, &format!("{field}.headers"), name);
        }
    }

    if config.admission.enabled {
        if config.admission.config_file.as_os_str().is_empty() {
            errors.push(ValidationError::new("admission.config_file", "required when enabled"));
        }
        if config.admission.poll_interval.is_zero() {
            errors.push(ValidationError::new("admission.poll_interval", "must be positive"));
        }
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be positive"));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn check_url(errors: &mut Vec<ValidationError>, field: &str, raw: &str) {
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.has_host() => {}
        Ok(_) => errors.push(ValidationError::new(field, format!("'{raw}' must be an http(s) URL"))),
        Err(e) => errors.push(ValidationError::new(field, format!("'{raw}': {e}"))),
    }
}

fn check_header(errors: &mut Vec<ValidationError>, field: &str, name: &str) {
    if HeaderName::from_bytes(name.as_bytes()).is_err() {
        errors.push(ValidationError::new(field, format!("'{name}' is not a valid header name")));
    }
}

/// `[a-zA-Z_][a-zA-Z0-9_]*`
fn is_label_name(name: &str) -> bool {
    let mut chars = name.chars();
    matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
        && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{ExternalRemoteWriteConfig, TlsConfig};
    use std::time::Duration;

    #[test]
    fn defaults_are_valid() {
        assert!(validate_config(&GatewayConfig::default()).is_ok());
    }

    #[test]
    fn collects_every_error() {
        let mut config = GatewayConfig::default();
        config.listener.bind_address = "nowhere".into();
        config.tenant.label = "1bad".into();
        config.upstreams.query = Some("ftp://query".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<&str> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"listener.bind_address"));
        assert!(fields.contains(&"tenant.label"));
        assert!(fields.contains(&"upstreams.query"));
    }

    #[test]
    fn certificate_strategy_requires_client_ca() {
        let mut config = GatewayConfig::default();
        config.tenant.strategy = TenantStrategy::Certificate;
        config.listener.tls = Some(TlsConfig {
            cert_path: "server.pem".into(),
            key_path: "server-key.pem".into(),
            client_ca_path: None,
        });
        assert!(validate_config(&config).is_err());

        config.listener.tls.as_mut().unwrap().client_ca_path = Some("ca.pem".into());
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn external_destinations_need_unique_names() {
        let dest = ExternalRemoteWriteConfig {
            name: "mirror".into(),
            url: "https://mirror/api/v1/write".into(),
            headers: Default::default(),
            remote_timeout: Duration::from_secs(1),
            basic_auth: None,
            bearer_token: None,
            tls_config: Default::default(),
        };
        let mut config = GatewayConfig::default();
        config.remote_write.external = vec![dest.clone(), dest];

        let errors = validate_config(&config).unwrap_err();
        assert!(errors.iter().any(|e| e.message.contains("duplicate")));
    }

    #[test]
    fn fanout_limit_must_be_positive() {
        let mut config = GatewayConfig::default();
        config.remote_write.max_concurrent_fanouts = 0;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "remote_write.max_concurrent_fanouts");
    }

    #[test]
    fn admission_requires_file() {
        let mut config = GatewayConfig::default();
        config.admission.enabled = true;
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors[0].field, "admission.config_file");
    }
}
