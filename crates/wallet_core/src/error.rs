use shared::domain::ProviderKind;
use thiserror::Error;

/// User-facing connection failures. `Display` is the message shown to the
/// user and stored in `ConnectionState::Error`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("No wallet extension found. Please install Leather, Xverse, or Hiro wallet.")]
    NoProviderInstalled,
    #[error(
        "Please disable other wallet extensions and keep only {} enabled, then try again.",
        .requested.label()
    )]
    ProviderMismatch {
        requested: ProviderKind,
        active: ProviderKind,
    },
    #[error("Could not extract Stacks address from wallet response")]
    AddressExtractionFailed,
    #[error("Please create or import an account in your wallet first, then try connecting again.")]
    AccountNotConfigured,
    #[error("Please unlock your wallet extension and try again.")]
    WalletLocked,
    #[error("Connection cancelled. Click \"Connect Wallet\" to try again.")]
    UserCancelled,
    #[error("{0}")]
    ProtocolError(String),
    #[error("{0}")]
    Unclassified(String),
    #[error("A wallet connection is already in progress.")]
    ConcurrentConnectAttempt,
    #[error("Please connect your wallet first before using WalletConnect")]
    NotYetConnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureClass {
    AccountNotConfigured,
    WalletLocked,
    UserCancelled,
}

/// Checked in order against the lower-cased provider message; first hit wins.
const FAILURE_PATTERNS: &[(FailureClass, &[&str])] = &[
    (
        FailureClass::AccountNotConfigured,
        &["failed to get selected account", "no account", "account not found"],
    ),
    (FailureClass::WalletLocked, &["locked", "unlock"]),
    (
        FailureClass::UserCancelled,
        &["user rejected", "user denied", "user cancelled"],
    ),
];

/// Maps a raw provider failure message onto the closed error taxonomy.
///
/// Providers do not share typed errors, so this is the one place that knows
/// their message formats. Unmatched messages are preserved verbatim.
pub fn classify_provider_failure(message: &str) -> ConnectError {
    let lower = message.to_ascii_lowercase();
    let class = FAILURE_PATTERNS
        .iter()
        .find(|(_, needles)| needles.iter().any(|needle| lower.contains(needle)))
        .map(|(class, _)| *class);

    match class {
        Some(FailureClass::AccountNotConfigured) => ConnectError::AccountNotConfigured,
        Some(FailureClass::WalletLocked) => ConnectError::WalletLocked,
        Some(FailureClass::UserCancelled) => ConnectError::UserCancelled,
        None => ConnectError::Unclassified(message.to_string()),
    }
}

/// Classifies a provider error using its whole context chain, so wrapping a
/// provider message with context never hides its class.
pub fn classify_provider_error(err: &anyhow::Error) -> ConnectError {
    classify_provider_failure(&format!("{err:#}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_missing_account_messages() {
        for message in [
            "Failed to get selected account",
            "No account available in wallet",
            "Account not found",
        ] {
            assert_eq!(
                classify_provider_failure(message),
                ConnectError::AccountNotConfigured,
                "{message}"
            );
        }
    }

    #[test]
    fn classifies_locked_wallet() {
        assert_eq!(
            classify_provider_failure("Wallet is LOCKED"),
            ConnectError::WalletLocked
        );
        assert_eq!(
            classify_provider_failure("please unlock the extension"),
            ConnectError::WalletLocked
        );
    }

    #[test]
    fn classifies_user_cancellation() {
        for message in ["User rejected request", "User denied access", "user cancelled"] {
            assert_eq!(
                classify_provider_failure(message),
                ConnectError::UserCancelled,
                "{message}"
            );
        }
    }

    #[test]
    fn account_patterns_take_precedence_over_lock_patterns() {
        assert_eq!(
            classify_provider_failure("no account: wallet locked"),
            ConnectError::AccountNotConfigured
        );
    }

    #[test]
    fn unmatched_message_is_preserved_verbatim() {
        let err = classify_provider_failure("RPC endpoint returned 502 Bad Gateway");
        assert_eq!(
            err,
            ConnectError::Unclassified("RPC endpoint returned 502 Bad Gateway".into())
        );
        assert_eq!(err.to_string(), "RPC endpoint returned 502 Bad Gateway");
    }

    #[test]
    fn classification_sees_through_error_context() {
        let err = anyhow::anyhow!("User rejected the request").context("leather connect");
        assert_eq!(classify_provider_error(&err), ConnectError::UserCancelled);

        let err = anyhow::anyhow!("Wallet is locked")
            .context("xverse getAddresses")
            .context("provider call");
        assert_eq!(classify_provider_error(&err), ConnectError::WalletLocked);
    }

    #[test]
    fn unmatched_error_chain_is_kept_whole() {
        let err = anyhow::anyhow!("502 Bad Gateway").context("leather connect");
        assert_eq!(
            classify_provider_error(&err),
            ConnectError::Unclassified("leather connect: 502 Bad Gateway".into())
        );
    }

    #[test]
    fn mismatch_message_names_requested_wallet() {
        let err = ConnectError::ProviderMismatch {
            requested: ProviderKind::Leather,
            active: ProviderKind::Xverse,
        };
        assert_eq!(
            err.to_string(),
            "Please disable other wallet extensions and keep only Leather Wallet enabled, then try again."
        );
    }
}
