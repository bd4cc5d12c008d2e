//! Configuration validation.

use crate::config::schema::ProxyConfig;

/// A single validation failure.
#[derive(Debug)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Validate a loaded configuration. Collects all failures instead of
/// stopping at the first.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<std::net::SocketAddr>().is_err() {
        errors.push(ValidationError {
            field: "listener.bind_address".into(),
            message: format!("not a socket address: {}", config.listener.bind_address),
        });
    }

    if config.upstream.timeout_secs == 0 {
        errors.push(ValidationError {
            field: "upstream.timeout_secs".into(),
            message: "must be positive".into(),
        });
    }

    for (i, plan) in config.plans.iter().enumerate() {
        if plan.rpm == 0 {
            errors.push(ValidationError {
                field: format!("plans[{}].rpm", i),
                message: "must be positive".into(),
            });
        }
        if plan.id.is_empty() {
            errors.push(ValidationError {
                field: format!("plans[{}].id", i),
                message: "must not be empty".into(),
            });
        }
    }

    if config.usage.max_batch_size == 0 {
        errors.push(ValidationError {
            field: "usage.max_batch_size".into(),
            message: "must be positive".into(),
        });
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
