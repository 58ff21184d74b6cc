//! Error types for code injection and configuration

use thiserror::Error;

use crate::asm::AsmError;

/// Errors from the assemble/allocate/write/execute pipeline
#[derive(Debug, Error)]
pub enum InjectError {
    #[error("not attached to a process")]
    NotAttached,

    #[error("assembly failed: {0}")]
    Assembly(#[from] AsmError),

    #[error("could not allocate {size} bytes near 0x{near:X}")]
    AllocationFailed { size: usize, near: usize },

    #[error("code is {code_len} bytes but the patch site at 0x{address:X} is only {site_len}")]
    PatchSiteTooSmall {
        address: usize,
        site_len: usize,
        code_len: usize,
    },

    #[error("padded code is {actual} bytes, expected {expected}")]
    PatchLengthMismatch { expected: usize, actual: usize },

    #[error("failed to write {len} bytes at 0x{address:X}")]
    WriteFailed { address: usize, len: usize },

    #[error("failed to execute code at 0x{address:X}")]
    ExecuteFailed { address: usize },
}

/// Errors from loading a [`crate::HookConfig`]
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid TOML: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inject_error_messages() {
        let err = InjectError::PatchSiteTooSmall {
            address: 0x140001000,
            site_len: 5,
            code_len: 7,
        };
        assert_eq!(
            err.to_string(),
            "code is 7 bytes but the patch site at 0x140001000 is only 5"
        );

        let err = InjectError::AllocationFailed {
            size: 0x20,
            near: 0x140000000,
        };
        assert_eq!(err.to_string(), "could not allocate 32 bytes near 0x140000000");
    }

    #[test]
    fn test_assembly_error_conversion() {
        let err: InjectError = AsmError::syntax("unbalanced brackets").at(2, "mov eax, [rbx").into();
        assert!(matches!(err, InjectError::Assembly(_)));
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_config_error_from_json() {
        let err: ConfigError = serde_json::from_str::<u32>("nope").unwrap_err().into();
        assert!(err.to_string().starts_with("invalid JSON"));
    }
}
