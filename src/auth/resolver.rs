//! Credential resolution rules
//!
//! Password priority: interactive prompt (when asked for) beats the flag
//! value, which beats the password file. Any resolved secret that turns out
//! to be a vault envelope is decrypted with the vault passphrase, obtained
//! from the vault password file or a single interactive prompt.

use crate::auth::{AuthBundle, AuthMethod};
use crate::error::{IoResultExt, Result, RunnerError};
use crate::vault;
use std::cell::OnceCell;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Prompt callback: label in, echo-off secret out.
pub type PromptFn = Box<dyn Fn(&str) -> Result<String>>;

/// Raw credential inputs for one side of the connection, as handed over by
/// the configuration layer.
#[derive(Debug, Clone, Default)]
pub struct AuthOptions {
    /// Login user; falls back to the `USER` environment variable
    pub user: Option<String>,
    /// Password given on the command line
    pub password: Option<String>,
    /// Force an interactive password prompt
    pub ask_pass: bool,
    /// File holding the password (trailing whitespace trimmed)
    pub password_file: Option<PathBuf>,
    /// Private key files for public key auth
    pub identity_files: Vec<PathBuf>,
    /// Passphrase for protected identity files
    pub passphrase: Option<String>,
    /// ssh-agent socket path, normally from `SSH_AUTH_SOCK`
    pub agent_socket: Option<PathBuf>,
    /// File holding the vault passphrase
    pub vault_pass_file: Option<PathBuf>,
}

impl AuthOptions {
    /// Field-by-field fallback: unset fields take the target-side value.
    /// Used to derive the bastion credential set.
    pub fn or_fallback(mut self, target: &AuthOptions) -> AuthOptions {
        if self.user.is_none() {
            self.user = target.user.clone();
        }
        if self.password.is_none() && self.password_file.is_none() && !self.ask_pass {
            self.password = target.password.clone();
            self.password_file = target.password_file.clone();
        }
        if self.identity_files.is_empty() {
            self.identity_files = target.identity_files.clone();
        }
        if self.passphrase.is_none() {
            self.passphrase = target.passphrase.clone();
        }
        if self.agent_socket.is_none() {
            self.agent_socket = target.agent_socket.clone();
        }
        if self.vault_pass_file.is_none() {
            self.vault_pass_file = target.vault_pass_file.clone();
        }
        self
    }
}

/// Bastion endpoint plus its credential inputs
#[derive(Debug, Clone)]
pub struct BastionOptions {
    /// Bastion host name or address
    pub host: String,
    /// Bastion SSH port
    pub port: u16,
    /// Bastion-side credential inputs; unset fields fall back to the
    /// target-side values
    pub auth: AuthOptions,
}

/// Turns [`AuthOptions`] into an ordered [`AuthBundle`].
pub struct AuthResolver {
    sudo: bool,
    prompt: PromptFn,
    vault_passphrase: OnceCell<String>,
}

impl AuthResolver {
    /// Create a resolver; `sudo` controls whether a missing password
    /// triggers the interactive fallback prompt.
    pub fn new(sudo: bool) -> Self {
        Self {
            sudo,
            prompt: Box::new(|label| {
                rpassword::prompt_password(label)
                    .map_err(|e| RunnerError::config(format!("cannot read prompt: {e}")))
            }),
            vault_passphrase: OnceCell::new(),
        }
    }

    /// Replace the terminal prompt, for embedding and tests.
    pub fn with_prompt(mut self, prompt: impl Fn(&str) -> Result<String> + 'static) -> Self {
        self.prompt = Box::new(prompt);
        self
    }

    /// Resolve the target-side bundle per the ordering rule: password first
    /// (if known), then identity files, then agent. An interactive password
    /// is appended at the end when nothing was gathered, or when sudo is on
    /// and no password is known yet.
    pub fn resolve(&self, options: &AuthOptions) -> Result<AuthBundle> {
        let user = match &options.user {
            Some(user) if !user.is_empty() => user.clone(),
            _ => std::env::var("USER")
                .map_err(|_| RunnerError::config("no login user given and USER is unset"))?,
        };

        let mut password = self.resolve_password(options, &user)?;
        let passphrase = match &options.passphrase {
            Some(value) => Some(self.unseal(value, options)?),
            None => None,
        };

        let mut methods = Vec::new();
        if let Some(password) = &password {
            methods.push(AuthMethod::Password(password.clone()));
        }

        for keyfile in &options.identity_files {
            let keyfile = expand_tilde(keyfile);
            if !keyfile.is_file() {
                debug!("skipping missing identity file {}", keyfile.display());
                continue;
            }
            methods.push(AuthMethod::PublicKey {
                keyfile,
                passphrase: passphrase.clone(),
            });
        }

        if let Some(socket) = &options.agent_socket {
            if agent_reachable(socket) {
                methods.push(AuthMethod::Agent);
            } else {
                warn!("ssh-agent socket {} is not dialable", socket.display());
            }
        }

        if methods.is_empty() || (self.sudo && password.is_none()) {
            let entered = (self.prompt)(&format!("Password for {user}: "))?;
            password = Some(entered.clone());
            methods.push(AuthMethod::Password(entered));
        }

        Ok(AuthBundle {
            user,
            password,
            methods,
        })
    }

    /// Resolve the bastion-side bundle. Unset bastion credentials default to
    /// the target-side inputs, resolved explicitly rather than aliased.
    pub fn resolve_bastion(
        &self,
        bastion: &BastionOptions,
        target: &AuthOptions,
    ) -> Result<AuthBundle> {
        let merged = bastion.auth.clone().or_fallback(target);
        self.resolve(&merged)
    }

    fn resolve_password(&self, options: &AuthOptions, user: &str) -> Result<Option<String>> {
        let raw = if options.ask_pass {
            Some((self.prompt)(&format!("Password for {user}: "))?)
        } else if let Some(password) = &options.password {
            Some(password.clone())
        } else if let Some(path) = &options.password_file {
            let contents = std::fs::read_to_string(path).with_path(path)?;
            Some(contents.trim_end().to_string())
        } else {
            None
        };

        match raw {
            Some(value) => Ok(Some(self.unseal(&value, options)?)),
            None => Ok(None),
        }
    }

    /// Decrypt a value when it is a vault envelope; pass it through otherwise.
    fn unseal(&self, value: &str, options: &AuthOptions) -> Result<String> {
        if !vault::is_ciphertext(value) {
            return Ok(value.to_string());
        }
        let passphrase = self.vault_passphrase(options)?;
        vault::decode(value, passphrase)
    }

    /// Vault passphrase from the vault password file, else a one-time prompt.
    fn vault_passphrase(&self, options: &AuthOptions) -> Result<&str> {
        if let Some(cached) = self.vault_passphrase.get() {
            return Ok(cached);
        }

        let passphrase = match &options.vault_pass_file {
            Some(path) => std::fs::read_to_string(path)
                .with_path(path)?
                .trim_end()
                .to_string(),
            None => (self.prompt)("Vault passphrase: ")?,
        };
        let _ = self.vault_passphrase.set(passphrase);
        Ok(self
            .vault_passphrase
            .get()
            .expect("vault passphrase just cached"))
    }
}

/// Expand a leading `~/` against `HOME`.
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Ok(home) = std::env::var("HOME") {
            return PathBuf::from(home).join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(unix)]
fn agent_reachable(socket: &Path) -> bool {
    std::os::unix::net::UnixStream::connect(socket).is_ok()
}

#[cfg(not(unix))]
fn agent_reachable(_socket: &Path) -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn no_prompt() -> impl Fn(&str) -> Result<String> {
        |_label: &str| panic!("prompt must not fire")
    }

    fn options_with_user() -> AuthOptions {
        AuthOptions {
            user: Some("deploy".to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn test_flag_password_comes_first() {
        let mut options = options_with_user();
        options.password = Some("s3cret".to_string());

        let bundle = AuthResolver::new(false)
            .with_prompt(no_prompt())
            .resolve(&options)
            .unwrap();

        assert_eq!(bundle.user, "deploy");
        assert_eq!(bundle.password.as_deref(), Some("s3cret"));
        assert!(matches!(&bundle.methods[0], AuthMethod::Password(p) if p == "s3cret"));
    }

    #[test]
    fn test_ask_pass_beats_flag() {
        let mut options = options_with_user();
        options.password = Some("from-flag".to_string());
        options.ask_pass = true;

        let bundle = AuthResolver::new(false)
            .with_prompt(|_| Ok("from-prompt".to_string()))
            .resolve(&options)
            .unwrap();

        assert_eq!(bundle.password.as_deref(), Some("from-prompt"));
    }

    #[test]
    fn test_password_file_is_trimmed() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "s3cret  \n").unwrap();

        let mut options = options_with_user();
        options.password_file = Some(file.path().to_path_buf());

        let bundle = AuthResolver::new(false)
            .with_prompt(no_prompt())
            .resolve(&options)
            .unwrap();
        assert_eq!(bundle.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_vault_password_file_is_unsealed() {
        let envelope = crate::vault::encode("s3cret", "vault-pass").unwrap();
        let mut password_file = NamedTempFile::new().unwrap();
        write!(password_file, "{envelope}").unwrap();
        let mut vault_file = NamedTempFile::new().unwrap();
        write!(vault_file, "vault-pass\n").unwrap();

        let mut options = options_with_user();
        options.password_file = Some(password_file.path().to_path_buf());
        options.vault_pass_file = Some(vault_file.path().to_path_buf());

        let bundle = AuthResolver::new(false)
            .with_prompt(no_prompt())
            .resolve(&options)
            .unwrap();
        assert_eq!(bundle.password.as_deref(), Some("s3cret"));
    }

    #[test]
    fn test_empty_bundle_prompts_for_password() {
        let options = options_with_user();

        let bundle = AuthResolver::new(false)
            .with_prompt(|_| Ok("typed".to_string()))
            .resolve(&options)
            .unwrap();

        assert_eq!(bundle.methods.len(), 1);
        assert!(matches!(&bundle.methods[0], AuthMethod::Password(p) if p == "typed"));
    }

    #[test]
    fn test_sudo_without_password_appends_prompted_password() {
        let mut options = options_with_user();
        let keyfile = NamedTempFile::new().unwrap();
        options.identity_files = vec![keyfile.path().to_path_buf()];

        let bundle = AuthResolver::new(true)
            .with_prompt(|_| Ok("sudo-pass".to_string()))
            .resolve(&options)
            .unwrap();

        // Key method stays first; the prompted password lands at the end.
        assert!(matches!(&bundle.methods[0], AuthMethod::PublicKey { .. }));
        assert!(matches!(
            bundle.methods.last().unwrap(),
            AuthMethod::Password(p) if p == "sudo-pass"
        ));
        assert_eq!(bundle.password.as_deref(), Some("sudo-pass"));
    }

    #[test]
    fn test_missing_identity_file_is_skipped() {
        let mut options = options_with_user();
        options.password = Some("x".to_string());
        options.identity_files = vec![PathBuf::from("/nonexistent/id_rsa")];

        let bundle = AuthResolver::new(false)
            .with_prompt(no_prompt())
            .resolve(&options)
            .unwrap();
        assert_eq!(bundle.methods.len(), 1);
    }

    #[test]
    fn test_bastion_fallback_is_field_by_field() {
        let mut target = options_with_user();
        target.password = Some("target-pass".to_string());
        target.passphrase = Some("key-pass".to_string());

        let bastion = BastionOptions {
            host: "jump.example.com".to_string(),
            port: 22,
            auth: AuthOptions {
                user: Some("jumper".to_string()),
                ..Default::default()
            },
        };

        let bundle = AuthResolver::new(false)
            .with_prompt(no_prompt())
            .resolve_bastion(&bastion, &target)
            .unwrap();

        assert_eq!(bundle.user, "jumper");
        assert_eq!(bundle.password.as_deref(), Some("target-pass"));
    }
}
