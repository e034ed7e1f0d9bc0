//! Content hashing and symmetric encryption of formula archives.
//!
//! Encrypted files are laid out as `nonce (12 bytes) || ciphertext+tag` using
//! AES-256-GCM. Keys travel as standard base64 of 32 raw bytes.

use std::io::Read;
use std::path::Path;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use anyhow::Context;
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};

const NONCE_LEN: usize = 12;
const KEY_LEN: usize = 32;

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}

/// Hash a file without loading it into memory.
pub fn sha256_file(path: &Path) -> anyhow::Result<String> {
    let mut file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 65536];
    loop {
        let n = file
            .read(&mut buf)
            .with_context(|| format!("reading {}", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fresh random key, base64-encoded.
pub fn generate_key() -> String {
    let mut key = [0u8; KEY_LEN];
    rand::rngs::OsRng.fill_bytes(&mut key);
    base64::engine::general_purpose::STANDARD.encode(key)
}

fn cipher_from_key(key_b64: &str) -> anyhow::Result<Aes256Gcm> {
    let raw = base64::engine::general_purpose::STANDARD
        .decode(key_b64.trim())
        .context("decryption key is not valid base64")?;
    if raw.len() != KEY_LEN {
        anyhow::bail!("bad key len: expected {KEY_LEN} bytes, got {}", raw.len());
    }
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&raw)))
}

pub fn encrypt_bytes(key_b64: &str, plaintext: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = cipher_from_key(key_b64)?;
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    let sealed = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| anyhow::anyhow!("encryption failed"))?;
    let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&sealed);
    Ok(out)
}

pub fn decrypt_bytes(key_b64: &str, data: &[u8]) -> anyhow::Result<Vec<u8>> {
    let cipher = cipher_from_key(key_b64)?;
    if data.len() < NONCE_LEN {
        anyhow::bail!("encrypted payload truncated ({} bytes)", data.len());
    }
    let (nonce, sealed) = data.split_at(NONCE_LEN);
    cipher
        .decrypt(Nonce::from_slice(nonce), sealed)
        .map_err(|_| anyhow::anyhow!("authentication failed: wrong key or corrupted archive"))
}

pub fn encrypt_file(key_b64: &str, src: &Path, dest: &Path) -> anyhow::Result<()> {
    let plain = std::fs::read(src).with_context(|| format!("reading {}", src.display()))?;
    let sealed = encrypt_bytes(key_b64, &plain)?;
    std::fs::write(dest, sealed).with_context(|| format!("writing {}", dest.display()))
}

/// Decrypt `src` into `dest`. Nothing is written unless authentication succeeds.
pub fn decrypt_file(key_b64: &str, src: &Path, dest: &Path) -> anyhow::Result<()> {
    let sealed = std::fs::read(src).with_context(|| format!("reading {}", src.display()))?;
    let plain = decrypt_bytes(key_b64, &sealed)?;
    std::fs::write(dest, plain).with_context(|| format!("writing {}", dest.display()))
}
