//! Passphrase-based secret envelope
//!
//! Encrypts short secrets at rest (login passwords, key passphrases) into a
//! self-identifying text envelope interoperable with the Ansible Vault 1.1
//! AES256 format: a magic header line followed by a hex body carrying
//! `salt || hmac || ciphertext`.
//!
//! Key schedule: PBKDF2-HMAC-SHA256 over the passphrase and a random salt,
//! yielding the AES-256-CTR cipher key, the HMAC-SHA256 key, and the IV.
//! The HMAC is verified before decryption; a mismatch means the passphrase
//! is wrong or the envelope is corrupt.

use crate::error::{Result, RunnerError};
use aes::cipher::{KeyIvInit, StreamCipher};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::Sha256;

type Aes256Ctr = ctr::Ctr128BE<aes::Aes256>;
type HmacSha256 = Hmac<Sha256>;

/// Magic prefix every envelope starts with
pub const HEADER_PREFIX: &str = "$ANSIBLE_VAULT;";

/// Header emitted on encode
const HEADER: &str = "$ANSIBLE_VAULT;1.1;AES256";

/// PBKDF2 iteration count fixed by the envelope format
const KDF_ROUNDS: u32 = 10_000;

/// Random salt length in bytes
const SALT_LEN: usize = 32;

/// AES block size; PKCS#7 pad unit
const BLOCK_LEN: usize = 16;

/// Envelope body lines are wrapped at this width
const WRAP_WIDTH: usize = 80;

/// Derived key material split into cipher key, HMAC key, and IV
struct KeySchedule {
    cipher_key: [u8; 32],
    hmac_key: [u8; 32],
    iv: [u8; 16],
}

fn derive_keys(passphrase: &str, salt: &[u8]) -> KeySchedule {
    let mut derived = [0u8; 80];
    pbkdf2::pbkdf2_hmac::<Sha256>(passphrase.as_bytes(), salt, KDF_ROUNDS, &mut derived);

    let mut schedule = KeySchedule {
        cipher_key: [0u8; 32],
        hmac_key: [0u8; 32],
        iv: [0u8; 16],
    };
    schedule.cipher_key.copy_from_slice(&derived[..32]);
    schedule.hmac_key.copy_from_slice(&derived[32..64]);
    schedule.iv.copy_from_slice(&derived[64..80]);
    schedule
}

/// Check whether a string is a vault envelope. Callers must test this before
/// re-encrypting a value to avoid double-wrapping.
pub fn is_ciphertext(text: &str) -> bool {
    text.trim_start().starts_with(HEADER_PREFIX)
}

/// Encrypt a secret under a passphrase into an envelope string.
pub fn encode(plaintext: &str, passphrase: &str) -> Result<String> {
    if passphrase.is_empty() {
        return Err(RunnerError::Vault("empty vault passphrase".to_string()));
    }

    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);
    let keys = derive_keys(passphrase, &salt);

    // PKCS#7 pad, then AES-256-CTR in place.
    let mut buf = plaintext.as_bytes().to_vec();
    let pad = BLOCK_LEN - buf.len() % BLOCK_LEN;
    buf.extend(std::iter::repeat(pad as u8).take(pad));
    let mut cipher = Aes256Ctr::new(&keys.cipher_key.into(), &keys.iv.into());
    cipher.apply_keystream(&mut buf);

    let mut mac = HmacSha256::new_from_slice(&keys.hmac_key)
        .map_err(|e| RunnerError::Vault(e.to_string()))?;
    mac.update(&buf);
    let tag = mac.finalize().into_bytes();

    let inner = format!("{}\n{}\n{}", hex::encode(salt), hex::encode(tag), hex::encode(&buf));
    let body = hex::encode(inner.as_bytes());

    let mut out = String::with_capacity(HEADER.len() + body.len() + body.len() / WRAP_WIDTH + 2);
    out.push_str(HEADER);
    for chunk in body.as_bytes().chunks(WRAP_WIDTH) {
        out.push('\n');
        // body is hex, always valid UTF-8
        out.push_str(std::str::from_utf8(chunk).expect("hex output is ASCII"));
    }
    out.push('\n');
    Ok(out)
}

/// Decrypt an envelope string with a passphrase, returning the secret.
pub fn decode(ciphertext: &str, passphrase: &str) -> Result<String> {
    let trimmed = ciphertext.trim();
    let (header, body) = trimmed
        .split_once('\n')
        .ok_or_else(|| RunnerError::Vault("envelope has no body".to_string()))?;

    let mut fields = header.trim().split(';');
    let magic = fields.next().unwrap_or_default();
    let version = fields.next().unwrap_or_default();
    let cipher_id = fields.next().unwrap_or_default();
    if magic != "$ANSIBLE_VAULT" {
        return Err(RunnerError::Vault("missing envelope header".to_string()));
    }
    if !matches!(version, "1.1" | "1.2") || cipher_id != "AES256" {
        return Err(RunnerError::Vault(format!(
            "unsupported envelope {version};{cipher_id}"
        )));
    }

    let body: String = body.split_whitespace().collect();
    let inner = hex::decode(&body).map_err(|e| RunnerError::Vault(format!("bad body hex: {e}")))?;
    let inner =
        String::from_utf8(inner).map_err(|_| RunnerError::Vault("bad body encoding".to_string()))?;

    let mut parts = inner.split('\n');
    let salt = decode_field(parts.next(), "salt")?;
    let tag = decode_field(parts.next(), "hmac")?;
    let mut data = decode_field(parts.next(), "ciphertext")?;

    let keys = derive_keys(passphrase, &salt);

    let mut mac = HmacSha256::new_from_slice(&keys.hmac_key)
        .map_err(|e| RunnerError::Vault(e.to_string()))?;
    mac.update(&data);
    // Constant-time comparison via the Mac trait.
    if mac.verify_slice(&tag).is_err() {
        return Err(RunnerError::Vault(
            "wrong passphrase or corrupt envelope".to_string(),
        ));
    }

    let mut cipher = Aes256Ctr::new(&keys.cipher_key.into(), &keys.iv.into());
    cipher.apply_keystream(&mut data);

    let pad = *data
        .last()
        .ok_or_else(|| RunnerError::Vault("empty ciphertext".to_string()))? as usize;
    if pad == 0 || pad > BLOCK_LEN || pad > data.len() {
        return Err(RunnerError::Vault("bad padding".to_string()));
    }
    data.truncate(data.len() - pad);

    String::from_utf8(data).map_err(|_| RunnerError::Vault("secret is not UTF-8".to_string()))
}

fn decode_field(field: Option<&str>, name: &str) -> Result<Vec<u8>> {
    let field = field.ok_or_else(|| RunnerError::Vault(format!("missing {name} field")))?;
    hex::decode(field.trim()).map_err(|e| RunnerError::Vault(format!("bad {name} hex: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use proptest::prelude::*;

    #[test]
    fn test_round_trip() {
        let envelope = encode("hunter2", "vault-pass").unwrap();
        assert!(is_ciphertext(&envelope));
        assert_eq!(decode(&envelope, "vault-pass").unwrap(), "hunter2");
    }

    #[test]
    fn test_wrong_passphrase_fails() {
        let envelope = encode("hunter2", "vault-pass").unwrap();
        let err = decode(&envelope, "not-the-pass").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Vault);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert!(encode("secret", "").is_err());
    }

    #[test]
    fn test_is_ciphertext_detection() {
        assert!(is_ciphertext("$ANSIBLE_VAULT;1.1;AES256\n3132...\n"));
        assert!(is_ciphertext("  $ANSIBLE_VAULT;1.2;AES256\nabcd"));
        assert!(!is_ciphertext("hunter2"));
        assert!(!is_ciphertext(""));
    }

    #[test]
    fn test_envelope_shape() {
        let envelope = encode("secret", "k").unwrap();
        let mut lines = envelope.lines();
        assert_eq!(lines.next(), Some("$ANSIBLE_VAULT;1.1;AES256"));
        for line in lines {
            assert!(line.len() <= WRAP_WIDTH);
            assert!(line.bytes().all(|b| b.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn test_corrupt_body_fails() {
        let envelope = encode("secret", "k").unwrap();
        let mut corrupted: Vec<String> = envelope.lines().map(str::to_string).collect();
        let last = corrupted.len() - 1;
        // Flip one hex digit in the ciphertext region.
        let flipped: String = corrupted[last]
            .chars()
            .enumerate()
            .map(|(i, c)| if i == 0 { if c == '0' { '1' } else { '0' } } else { c })
            .collect();
        corrupted[last] = flipped;
        assert!(decode(&corrupted.join("\n"), "k").is_err());
    }

    #[test]
    fn test_unsupported_version_rejected() {
        let err = decode("$ANSIBLE_VAULT;9.9;AES256\nabcd", "k").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Vault);
    }

    proptest! {
        /// decode(encode(p, k), k) = p for arbitrary printable secrets.
        #[test]
        fn prop_round_trip(secret in "[ -~]{0,64}", pass in "[a-zA-Z0-9]{1,16}") {
            let envelope = encode(&secret, &pass).unwrap();
            prop_assert_eq!(decode(&envelope, &pass).unwrap(), secret);
        }
    }
}
