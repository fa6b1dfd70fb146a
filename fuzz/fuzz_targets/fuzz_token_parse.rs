//! Fuzz target for admission token validation.
//!
//! Arbitrary token strings and node names must be rejected cleanly, never
//! panic, and never validate without the hub's signing key.

#![no_main]

use cloudhub::credentials::CredentialManager;
use cloudhub::config::CredentialConfig;
use cloudhub::secret_store::MemorySecretStore;
use libfuzzer_sys::fuzz_target;
use std::sync::{Arc, OnceLock};

fn manager() -> &'static CredentialManager {
    static MANAGER: OnceLock<CredentialManager> = OnceLock::new();
    MANAGER.get_or_init(|| {
        let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
        let mgr = CredentialManager::new(CredentialConfig::default(), Arc::new(MemorySecretStore::new()));
        rt.block_on(mgr.ensure_certificates()).unwrap();
        mgr
    })
}

fuzz_target!(|data: (&str, Option<&str>, u64)| {
    let (token, claimed, now) = data;
    assert!(manager().validate_token_at(token, claimed, now).is_err());
});
