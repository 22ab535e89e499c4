//! Process exit codes, kept distinct: mount/store-binding errors produce
//! non-zero exit codes distinct from credential errors and from
//! transient remote errors.

pub const OK: i32 = 0;
pub const GENERIC: i32 = 1;
pub const CONFIG_INVALID: i32 = 10;
pub const MOUNT_UNAVAILABLE: i32 = 11;
pub const STORE_BINDING_MISMATCH: i32 = 12;
pub const CREDENTIAL_MISSING: i32 = 13;
pub const TRANSIENT_REMOTE: i32 = 14;

/// Maps a top-level [`anyhow::Error`] to one of the exit codes above by
/// inspecting the wrapped source error: everything not absorbed by the
/// FSM/Orchestrator surfaces here.
pub fn code_for(err: &anyhow::Error) -> i32 {
    if let Some(core_err) = err.downcast_ref::<shelfsync_core::CoreError>() {
        return match core_err {
            shelfsync_core::CoreError::MountUnavailable(_) => MOUNT_UNAVAILABLE,
            shelfsync_core::CoreError::StoreBindingMismatch { .. } => STORE_BINDING_MISMATCH,
            _ if core_err.is_transient() => TRANSIENT_REMOTE,
            _ => GENERIC,
        };
    }
    if let Some(config_err) = err.downcast_ref::<shelfsync_config::ConfigError>() {
        return match config_err {
            shelfsync_config::ConfigError::CredentialMissing { .. } | shelfsync_config::ConfigError::Keyring { .. } => CREDENTIAL_MISSING,
            _ => CONFIG_INVALID,
        };
    }
    GENERIC
}
