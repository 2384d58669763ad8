//! Error types for the registry orchestrator

use thiserror::Error;

use crate::constants::ModeType;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// HTTP request to a node agent failed
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML (de)serialization error
    #[error("YAML error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// PEM/DER data could not be decoded
    #[error("PKI decode error: {0}")]
    PkiDecode(String),

    /// Private key does not belong to the certificate
    #[error("PKI mismatch: {0}")]
    PkiMismatch(String),

    /// Certificate does not chain to the expected CA
    #[error("PKI chain error: {0}")]
    PkiChain(String),

    /// Certificate or key generation failed
    #[error("PKI generation error: {0}")]
    PkiGenerate(String),

    /// The mode requires a parameter block that was not supplied
    #[error("missing {block} parameters for mode {mode}")]
    MissingModeParams { block: &'static str, mode: ModeType },

    #[error("transition from {from} to {to} is not supported")]
    TransitionNotSupported { from: ModeType, to: ModeType },

    /// A path in the values store is absent
    #[error("value not exist: {0}")]
    InputValueNotExist(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("UserOperation error: {0}")]
    UserOperation(String),
}

impl Error {
    /// Whether the reconcile should be retried quickly
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::HttpError(_) | Error::InputValueNotExist(_)
        )
    }

    /// True for errors produced while decoding or validating PKI material
    pub fn is_pki(&self) -> bool {
        matches!(
            self,
            Error::PkiDecode(_) | Error::PkiMismatch(_) | Error::PkiChain(_)
        )
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transition_error_names_both_modes() {
        let err = Error::TransitionNotSupported {
            from: ModeType::Local,
            to: ModeType::Proxy,
        };
        assert_eq!(
            err.to_string(),
            "transition from Local to Proxy is not supported"
        );
        assert!(!err.is_retriable());
    }

    #[test]
    fn missing_mode_params_message() {
        let err = Error::MissingModeParams {
            block: "direct",
            mode: ModeType::Direct,
        };
        assert_eq!(err.to_string(), "missing direct parameters for mode Direct");
    }

    #[test]
    fn pki_errors_are_classified() {
        assert!(Error::PkiChain("x".into()).is_pki());
        assert!(Error::PkiDecode("x".into()).is_pki());
        assert!(!Error::ConfigError("x".into()).is_pki());
    }
}
