use thiserror::Error;

use crate::bridge::BridgeError;
use crate::bus::pcm::PcmError;
use crate::registry::RegistryError;

/// Exit code for a clean stop
pub const EXIT_OK: u8 = 0;
/// Exit code for runtime I/O failures (the supervisor may restart)
pub const EXIT_RUNTIME: u8 = 1;
/// Exit code for an alias with no registered mapping
pub const EXIT_UNKNOWN_ALIAS: u8 = 2;
/// Exit code for malformed configuration
pub const EXIT_CONFIG: u8 = 3;
/// Exit code for missing audio hardware
pub const EXIT_FATAL: u8 = 4;

/// How an error should be handled by whoever observes it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Unfixable without an operator editing configuration; never retried
    Configuration,
    /// Retried with backoff inside the bridge
    Transient,
    /// Resolved only by the supervisor's conflict scan
    Contention,
    /// Needs physical intervention; aborts startup
    Fatal,
    /// Runtime I/O failure surfaced to the supervisor
    Runtime,
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Unknown alias: {0} has no registered mapping")]
    UnknownAlias(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Device busy [{device}]: {reason}")]
    DeviceBusy { device: String, reason: String },

    #[error("Device contention [{device}]: held by pid {pid}")]
    Contention { device: String, pid: i32 },

    #[error("Platform error: {0}")]
    Platform(String),

    #[error("Bluetooth error: {0}")]
    Bluetooth(String),

    #[error("Audio error: {0}")]
    AudioError(String),

    #[error("Bridge error: {0}")]
    Bridge(#[from] BridgeError),

    #[error("Supervisor error: {0}")]
    Supervisor(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl AppError {
    /// Classify the error for retry decisions
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::UnknownAlias(_) | Self::Config(_) => ErrorCategory::Configuration,
            Self::DeviceBusy { .. } => ErrorCategory::Transient,
            Self::Contention { .. } => ErrorCategory::Contention,
            Self::Platform(_) => ErrorCategory::Fatal,
            Self::Bridge(e) => e.category(),
            _ => ErrorCategory::Runtime,
        }
    }

    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            Self::UnknownAlias(_) => EXIT_UNKNOWN_ALIAS,
            Self::Bridge(e) => e.exit_code(),
            _ => self.category().exit_code(),
        }
    }
}

impl ErrorCategory {
    /// Exit code for errors of this category
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Configuration => EXIT_CONFIG,
            Self::Fatal => EXIT_FATAL,
            _ => EXIT_RUNTIME,
        }
    }
}

/// Exit code for an error that reached a binary's top level
pub fn exit_code_of(err: &anyhow::Error) -> u8 {
    if let Some(e) = err.downcast_ref::<AppError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<BridgeError>() {
        e.exit_code()
    } else if let Some(e) = err.downcast_ref::<RegistryError>() {
        match e {
            RegistryError::UnknownAlias(_) => EXIT_UNKNOWN_ALIAS,
            e if e.is_configuration() => EXIT_CONFIG,
            _ => EXIT_RUNTIME,
        }
    } else {
        EXIT_RUNTIME
    }
}

impl From<RegistryError> for AppError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownAlias(alias) => Self::UnknownAlias(alias),
            RegistryError::InvalidAlias(_) | RegistryError::Malformed { .. } => {
                Self::Config(e.to_string())
            }
            RegistryError::Io(io) => Self::Io(io),
            RegistryError::Claim(msg) => Self::Internal(msg),
        }
    }
}

impl From<PcmError> for AppError {
    fn from(e: PcmError) -> Self {
        match e {
            PcmError::Busy(device) => Self::DeviceBusy {
                device,
                reason: "device or resource busy".to_string(),
            },
            other => Self::AudioError(other.to_string()),
        }
    }
}

/// Result type alias
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_alias_exit_code() {
        let err = AppError::from(RegistryError::UnknownAlias("BT_X".into()));
        assert_eq!(err.exit_code(), EXIT_UNKNOWN_ALIAS);
        assert_eq!(err.category(), ErrorCategory::Configuration);
    }

    #[test]
    fn test_malformed_mapping_is_config_error() {
        let err = AppError::from(RegistryError::Malformed {
            input: "nonsense".into(),
            reason: "unrecognized target".into(),
        });
        assert_eq!(err.exit_code(), EXIT_CONFIG);
    }

    #[test]
    fn test_exit_code_through_anyhow_context() {
        let err = anyhow::Error::from(BridgeError::Registry(RegistryError::UnknownAlias(
            "DAC".into(),
        )))
        .context("preparing output bridge");
        assert_eq!(exit_code_of(&err), EXIT_UNKNOWN_ALIAS);

        let err = anyhow::Error::from(AppError::Platform("no loopback".into()));
        assert_eq!(exit_code_of(&err), EXIT_FATAL);
        assert_eq!(exit_code_of(&anyhow::anyhow!("boom")), EXIT_RUNTIME);
    }

    #[test]
    fn test_runtime_and_fatal_codes() {
        assert_eq!(AppError::AudioError("x".into()).exit_code(), EXIT_RUNTIME);
        assert_eq!(AppError::Platform("no cards".into()).exit_code(), EXIT_FATAL);
        let busy = AppError::from(PcmError::Busy("hw:0,0".into()));
        assert_eq!(busy.category(), ErrorCategory::Transient);
    }
}
