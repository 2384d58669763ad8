//! Custom resources consumed and served by the orchestrator

pub mod module_config;
pub mod types;
pub mod user_operation;

pub use module_config::{
    DetachedSettings, ImagesOverride, ModuleConfig, ModuleConfigSpec, RegistrySettings,
    UpstreamSettings,
};
pub use types::Condition;
pub use user_operation::{
    LockSpec, ResetPasswordSpec, UserOperation, UserOperationPhase, UserOperationSpec,
    UserOperationStatus, UserOperationType,
};
