//! Tenant secret handling.
//!
//! Secrets are envelope-encrypted: the value is sealed under a per-secret
//! DEK, the DEK under a versioned KEK. Decryption happens on demand when a
//! request carries `{{name}}` placeholders; plaintext values are never
//! cached, only decrypted DEKs (short TTL).

pub mod envelope;
pub mod vault;

pub use envelope::EnvelopeError;
pub use vault::{EnvKekSource, KekSource, SecretVault, StaticKekSource};
