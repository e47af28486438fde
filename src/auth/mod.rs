//! Authentication credential resolution
//!
//! Resolves login credentials from flags, files, and interactive prompts
//! into an ordered bundle of candidate SSH auth methods. Vault-encrypted
//! secrets are decrypted transparently.

mod resolver;

pub use resolver::{AuthOptions, AuthResolver, BastionOptions};

use std::path::PathBuf;

/// One candidate authentication method. Per host, methods are attempted in
/// bundle order and the first accepted method wins.
#[derive(Debug, Clone)]
pub enum AuthMethod {
    /// Keyboard-style password auth
    Password(String),
    /// Public key auth from an identity file
    PublicKey {
        keyfile: PathBuf,
        passphrase: Option<String>,
    },
    /// Key signing delegated to a reachable ssh-agent
    Agent,
}

/// Resolved credentials for one side of the connection (target or bastion).
#[derive(Debug, Clone)]
pub struct AuthBundle {
    /// Login user name
    pub user: String,
    /// Login password, if known. Also fed to sudo on the remote side.
    pub password: Option<String>,
    /// Candidate methods in attempt order
    pub methods: Vec<AuthMethod>,
}

impl AuthBundle {
    /// True when the bundle carries at least one usable method
    pub fn is_usable(&self) -> bool {
        !self.methods.is_empty()
    }
}
