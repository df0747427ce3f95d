//! Tests for error types

use sliver_agent::core::{AccountError, CoreSchedError, LedgerError};

#[test]
fn test_invalid_record_error() {
    let err = LedgerError::InvalidRecord {
        key: "pl_alpha".to_string(),
        reason: "name is empty".to_string(),
    };
    assert_eq!(format!("{}", err), "invalid record `pl_alpha`: name is empty");
}

#[test]
fn test_unknown_sliver_error() {
    let err = LedgerError::UnknownSliver("pl_ghost".to_string());
    assert_eq!(format!("{}", err), "unknown sliver: pl_ghost");
}

#[test]
fn test_account_error_is_transparent() {
    let err: LedgerError = AccountError::Missing("pl_alpha".to_string()).into();
    assert_eq!(format!("{}", err), "account `pl_alpha` does not exist");
}

#[test]
fn test_backend_error() {
    let err = AccountError::Backend {
        name: "pl_alpha".to_string(),
        op: "configure",
        reason: "disk full".to_string(),
    };
    assert_eq!(format!("{}", err), "configure failed for `pl_alpha`: disk full");
}

#[test]
fn test_unmanaged_shell_error() {
    let err = AccountError::UnmanagedShell {
        name: "root".to_string(),
        shell: "/bin/zsh".to_string(),
    };
    assert_eq!(format!("{}", err), "account `root` has unmanaged shell `/bin/zsh`");
}

#[test]
fn test_malformed_list_error() {
    let err = CoreSchedError::MalformedList("3-1".to_string());
    assert_eq!(format!("{}", err), "malformed cpu list `3-1`");
}
