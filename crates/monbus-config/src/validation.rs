//! Configuration validation

use crate::schema::RawConfig;
use monbus_util::{FRAME_HEADER_SIZE, MAX_READ_BUFFER_SIZE};
use thiserror::Error;

/// Validation error
#[derive(Debug, Clone, Error)]
pub enum ValidationError {
    #[error("Invalid service name '{name}': {message}")]
    InvalidServiceName { name: String, message: String },

    #[error("Read buffer size {0} is smaller than a frame header")]
    BufferTooSmall(usize),

    #[error("Read buffer size {size} exceeds the maximum of {max}")]
    BufferTooLarge { size: usize, max: usize },

    #[error("Bypass percentage {0} must be between 1 and 100")]
    InvalidBypassPercent(u8),

    #[error("Socket mode {0:o} has bits outside 0o777")]
    InvalidSocketMode(u32),
}

/// Check a service name for use in a socket file name
pub fn validate_service_name(name: &str) -> Result<(), ValidationError> {
    let message = if name.is_empty() {
        "service name cannot be empty"
    } else if name.contains('/') || name.contains('\0') {
        "service name cannot contain '/' or NUL"
    } else {
        return Ok(());
    };

    Err(ValidationError::InvalidServiceName {
        name: name.to_string(),
        message: message.into(),
    })
}

/// Validate a raw configuration
pub fn validate_config(config: &RawConfig) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    if let Err(e) = validate_service_name(&config.bus.service_name) {
        errors.push(e);
    }

    if let Some(mode) = config.bus.socket_mode {
        if mode & !0o777 != 0 {
            errors.push(ValidationError::InvalidSocketMode(mode));
        }
    }

    if let Some(size) = config.limits.read_buffer_size {
        if size < FRAME_HEADER_SIZE {
            errors.push(ValidationError::BufferTooSmall(size));
        } else if size > MAX_READ_BUFFER_SIZE {
            errors.push(ValidationError::BufferTooLarge {
                size,
                max: MAX_READ_BUFFER_SIZE,
            });
        }
    }

    if let Some(percent) = config.limits.bypass_percent {
        if percent == 0 || percent > 100 {
            errors.push(ValidationError::InvalidBypassPercent(percent));
        }
    }

    errors
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{RawBusConfig, RawLimits};

    fn raw(service_name: &str) -> RawConfig {
        RawConfig {
            config_version: 1,
            bus: RawBusConfig {
                service_name: service_name.into(),
                ..Default::default()
            },
            limits: RawLimits::default(),
        }
    }

    #[test]
    fn valid_config_has_no_errors() {
        assert!(validate_config(&raw("preprocessing")).is_empty());
    }

    #[test]
    fn slash_in_service_name() {
        let errors = validate_config(&raw("../escape"));
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], ValidationError::InvalidServiceName { .. }));
    }

    #[test]
    fn bypass_percent_bounds() {
        let mut config = raw("svc");
        config.limits.bypass_percent = Some(0);
        assert!(matches!(
            validate_config(&config)[..],
            [ValidationError::InvalidBypassPercent(0)]
        ));

        config.limits.bypass_percent = Some(101);
        assert_eq!(validate_config(&config).len(), 1);

        config.limits.bypass_percent = Some(100);
        assert!(validate_config(&config).is_empty());
    }

    #[test]
    fn socket_mode_bits() {
        let mut config = raw("svc");
        config.bus.socket_mode = Some(0o4660);
        assert!(matches!(
            validate_config(&config)[..],
            [ValidationError::InvalidSocketMode(_)]
        ));
    }

    #[test]
    fn read_buffer_size_bounds() {
        let mut config = raw("svc");
        config.limits.read_buffer_size = Some(4);
        assert!(matches!(
            validate_config(&config)[..],
            [ValidationError::BufferTooSmall(4)]
        ));

        config.limits.read_buffer_size = Some(usize::MAX);
        assert!(matches!(
            validate_config(&config)[..],
            [ValidationError::BufferTooLarge { .. }]
        ));

        config.limits.read_buffer_size = Some(MAX_READ_BUFFER_SIZE);
        assert!(validate_config(&config).is_empty());
    }
}
