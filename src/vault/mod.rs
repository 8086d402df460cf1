//! `vault` — encrypted-at-rest credential store.
//!
//! Secrets are encrypted per-entry with ChaCha20-Poly1305 under a key derived
//! from the user's master password via Argon2id. Decrypted plaintext exists
//! only inside a [`SecretHandle`], whose backing buffer is zeroed on drop.
//! `wipe()` blocks until every outstanding handle has dropped, then zeroes the
//! master key — a wipe racing an in-flight `get` always wins.
//!
//! The vault file never contains plaintext: a JSON header (KDF parameters,
//! salt, password-check block) followed by named `{nonce, ciphertext}`
//! entries, written atomically with owner-only permissions.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};

use argon2::{Algorithm, Argon2, Params, Version};
use chacha20poly1305::aead::{Aead, KeyInit};
use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
use chrono::{DateTime, Utc};
use rand_core::{OsRng, RngCore};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;
use zeroize::Zeroizing;

const VAULT_VERSION: u32 = 1;
const KEY_SIZE: usize = 32;
const NONCE_SIZE: usize = 12;
const SALT_SIZE: usize = 32;

/// Fixed sentinel encrypted into the header so `unlock` can tell a wrong
/// password apart from a corrupted file.
const PASSWORD_CHECK: &[u8] = b"warden-vault-check-v1";

// ─── Errors ───────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum VaultError {
    /// Master password not yet supplied.
    #[error("vault is locked")]
    Locked,

    /// Wrong password or corrupted ciphertext. Never falls back to plaintext.
    #[error("vault decryption failed (wrong password or corrupted ciphertext)")]
    DecryptionFailed,

    #[error("secret '{0}' not found in vault")]
    NotFound(String),

    #[error("vault already exists at {0}")]
    AlreadyInitialized(String),

    #[error("vault not found at {0}")]
    NotInitialized(String),

    #[error("vault file is corrupted: {0}")]
    Corrupted(String),

    #[error("key derivation failed: {0}")]
    Kdf(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

// ─── File format ──────────────────────────────────────────────────────────────

/// Argon2id cost parameters stored in the vault header so old vaults keep
/// decrypting after defaults change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KdfParams {
    /// Memory cost in KiB.
    pub m_cost: u32,
    pub t_cost: u32,
    pub p_cost: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        // 64 MiB, 3 passes — interactive-unlock territory on commodity hardware.
        Self {
            m_cost: 64 * 1024,
            t_cost: 3,
            p_cost: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredEntry {
    /// Hex-encoded 12-byte nonce, unique per encryption.
    nonce: String,
    /// Hex-encoded ciphertext with the Poly1305 tag appended.
    ciphertext: String,
    created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct VaultFile {
    version: u32,
    kdf: KdfParams,
    /// Hex-encoded KDF salt.
    salt: String,
    /// Password-check block: `PASSWORD_CHECK` encrypted under the master key.
    check: StoredEntry,
    entries: BTreeMap<String, StoredEntry>,
}

// ─── Secret handles ───────────────────────────────────────────────────────────

/// Counts outstanding [`SecretHandle`]s so `wipe()` can wait for them.
#[derive(Default)]
struct HandleTracker {
    count: Mutex<usize>,
    released: Condvar,
}

/// Scoped view of one decrypted secret.
///
/// The backing buffer is zeroed when the handle drops; the plaintext must not
/// be copied into longer-lived storage.
pub struct SecretHandle {
    bytes: Zeroizing<Vec<u8>>,
    tracker: Arc<HandleTracker>,
}

impl SecretHandle {
    pub fn expose(&self) -> &[u8] {
        &self.bytes
    }

    /// UTF-8 view, for secrets that are textual (API keys, tokens).
    pub fn expose_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl Drop for SecretHandle {
    fn drop(&mut self) {
        let mut count = lock_unpoisoned(&self.tracker.count);
        *count = count.saturating_sub(1);
        self.tracker.released.notify_all();
    }
}

impl std::fmt::Debug for SecretHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never render the plaintext, even in debug output.
        write!(f, "SecretHandle({} bytes)", self.bytes.len())
    }
}

// ─── Vault ────────────────────────────────────────────────────────────────────

/// Summary state for the doctor report.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum VaultStatus {
    Uninitialized,
    Locked,
    Unlocked { entries: usize },
}

struct VaultState {
    key: Option<Zeroizing<[u8; KEY_SIZE]>>,
    file: Option<VaultFile>,
}

/// Encrypted credential store. See the module docs for the security model.
pub struct SecretsVault {
    path: PathBuf,
    kdf: KdfParams,
    state: Mutex<VaultState>,
    tracker: Arc<HandleTracker>,
}

impl SecretsVault {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_kdf(path, KdfParams::default())
    }

    /// Construct with explicit KDF costs. Tests use cheap parameters; the
    /// header always records what was actually used.
    pub fn with_kdf(path: impl Into<PathBuf>, kdf: KdfParams) -> Self {
        Self {
            path: path.into(),
            kdf,
            state: Mutex::new(VaultState {
                key: None,
                file: None,
            }),
            tracker: Arc::new(HandleTracker::default()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_initialized(&self) -> bool {
        self.path.exists()
    }

    pub fn is_locked(&self) -> bool {
        lock_unpoisoned(&self.state).key.is_none()
    }

    pub fn status(&self) -> VaultStatus {
        if !self.is_initialized() {
            return VaultStatus::Uninitialized;
        }
        let state = lock_unpoisoned(&self.state);
        match (&state.key, &state.file) {
            (Some(_), Some(file)) => VaultStatus::Unlocked {
                entries: file.entries.len(),
            },
            _ => VaultStatus::Locked,
        }
    }

    /// Create a new vault file protected by `master_password`.
    pub fn initialize(&self, master_password: &str) -> Result<(), VaultError> {
        if self.path.exists() {
            return Err(VaultError::AlreadyInitialized(
                self.path.display().to_string(),
            ));
        }

        let mut salt = [0u8; SALT_SIZE];
        OsRng.fill_bytes(&mut salt);
        let key = derive_key(master_password, &salt, &self.kdf)?;
        let check = encrypt_entry(&key, PASSWORD_CHECK)?;

        let file = VaultFile {
            version: VAULT_VERSION,
            kdf: self.kdf.clone(),
            salt: hex::encode(salt),
            check,
            entries: BTreeMap::new(),
        };

        let mut state = lock_unpoisoned(&self.state);
        write_vault_file(&self.path, &file)?;
        state.key = Some(key);
        state.file = Some(file);

        info!(path = %self.path.display(), "vault_initialized");
        Ok(())
    }

    /// Unlock an existing vault. The password-check block distinguishes a
    /// wrong password (`DecryptionFailed`) from a damaged file (`Corrupted`).
    pub fn unlock(&self, master_password: &str) -> Result<(), VaultError> {
        if !self.path.exists() {
            return Err(VaultError::NotInitialized(self.path.display().to_string()));
        }

        let raw = std::fs::read_to_string(&self.path)?;
        let file: VaultFile =
            serde_json::from_str(&raw).map_err(|e| VaultError::Corrupted(e.to_string()))?;
        if file.version != VAULT_VERSION {
            return Err(VaultError::Corrupted(format!(
                "unsupported vault version {}",
                file.version
            )));
        }

        let salt = decode_hex(&file.salt, "salt")?;
        let key = derive_key(master_password, &salt, &file.kdf)?;

        // Authenticated decrypt of the check block proves the password.
        decrypt_entry(&key, &file.check)?;

        let entries = file.entries.len();
        let mut state = lock_unpoisoned(&self.state);
        state.key = Some(key);
        state.file = Some(file);

        info!(entries, "vault_unlocked");
        Ok(())
    }

    /// Encrypt and persist a secret. The plaintext is not retained in memory.
    pub fn put(&self, name: &str, plaintext: &[u8]) -> Result<(), VaultError> {
        let mut state = lock_unpoisoned(&self.state);
        let key = state.key.as_ref().ok_or(VaultError::Locked)?;
        let entry = encrypt_entry(key, plaintext)?;

        let file = state.file.as_mut().ok_or(VaultError::Locked)?;
        file.entries.insert(name.to_string(), entry);
        write_vault_file(&self.path, file)?;

        // Only the name is ever logged.
        info!(name, "secret_stored");
        Ok(())
    }

    /// Decrypt one secret into a scoped handle.
    pub fn get(&self, name: &str) -> Result<SecretHandle, VaultError> {
        let state = lock_unpoisoned(&self.state);
        let key = state.key.as_ref().ok_or(VaultError::Locked)?;
        let file = state.file.as_ref().ok_or(VaultError::Locked)?;
        let entry = file
            .entries
            .get(name)
            .ok_or_else(|| VaultError::NotFound(name.to_string()))?;

        let plaintext = decrypt_entry(key, entry)?;

        // Register the handle before releasing the state lock so a concurrent
        // wipe() cannot observe a zero count while this handle is live.
        *lock_unpoisoned(&self.tracker.count) += 1;
        Ok(SecretHandle {
            bytes: plaintext,
            tracker: Arc::clone(&self.tracker),
        })
    }

    /// Remove a secret. Returns whether it existed.
    pub fn delete(&self, name: &str) -> Result<bool, VaultError> {
        let mut state = lock_unpoisoned(&self.state);
        if state.key.is_none() {
            return Err(VaultError::Locked);
        }
        let file = state.file.as_mut().ok_or(VaultError::Locked)?;
        let existed = file.entries.remove(name).is_some();
        if existed {
            write_vault_file(&self.path, file)?;
            info!(name, "secret_deleted");
        }
        Ok(existed)
    }

    /// Names of stored secrets (never values).
    pub fn list(&self) -> Result<Vec<String>, VaultError> {
        let state = lock_unpoisoned(&self.state);
        if state.key.is_none() {
            return Err(VaultError::Locked);
        }
        let file = state.file.as_ref().ok_or(VaultError::Locked)?;
        Ok(file.entries.keys().cloned().collect())
    }

    /// Zero the master key and lock the vault.
    ///
    /// Blocks until every outstanding [`SecretHandle`] has dropped, so a wipe
    /// racing an in-flight `get` always wins. Idempotent: wiping an already
    /// locked vault is a no-op that leaves it locked.
    pub fn wipe(&self) {
        // Holding the state lock stops new `get` calls from minting handles
        // while we wait for the existing ones to drain.
        let mut state = lock_unpoisoned(&self.state);
        let mut count = lock_unpoisoned(&self.tracker.count);
        while *count > 0 {
            count = self
                .tracker
                .released
                .wait(count)
                .unwrap_or_else(|e| e.into_inner());
        }
        drop(count);

        // Zeroizing zeroes the key bytes as it drops.
        state.key = None;
        state.file = None;
        info!("vault_wiped");
    }
}

// ─── Crypto helpers ───────────────────────────────────────────────────────────

fn derive_key(
    password: &str,
    salt: &[u8],
    kdf: &KdfParams,
) -> Result<Zeroizing<[u8; KEY_SIZE]>, VaultError> {
    let params = Params::new(kdf.m_cost, kdf.t_cost, kdf.p_cost, Some(KEY_SIZE))
        .map_err(|e| VaultError::Kdf(e.to_string()))?;
    let argon = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);

    let mut key = Zeroizing::new([0u8; KEY_SIZE]);
    argon
        .hash_password_into(password.as_bytes(), salt, &mut key[..])
        .map_err(|e| VaultError::Kdf(e.to_string()))?;
    Ok(key)
}

fn encrypt_entry(key: &Zeroizing<[u8; KEY_SIZE]>, plaintext: &[u8]) -> Result<StoredEntry, VaultError> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let mut nonce = [0u8; NONCE_SIZE];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| VaultError::Corrupted("AEAD encryption failed".to_string()))?;

    Ok(StoredEntry {
        nonce: hex::encode(nonce),
        ciphertext: hex::encode(ciphertext),
        created_at: Utc::now(),
    })
}

fn decrypt_entry(
    key: &Zeroizing<[u8; KEY_SIZE]>,
    entry: &StoredEntry,
) -> Result<Zeroizing<Vec<u8>>, VaultError> {
    let nonce = decode_hex(&entry.nonce, "nonce")?;
    if nonce.len() != NONCE_SIZE {
        return Err(VaultError::Corrupted("bad nonce length".to_string()));
    }
    let ciphertext = decode_hex(&entry.ciphertext, "ciphertext")?;

    let cipher = ChaCha20Poly1305::new(Key::from_slice(&key[..]));
    let plaintext = cipher
        .decrypt(Nonce::from_slice(&nonce), ciphertext.as_slice())
        .map_err(|_| VaultError::DecryptionFailed)?;
    Ok(Zeroizing::new(plaintext))
}

fn decode_hex(value: &str, field: &str) -> Result<Vec<u8>, VaultError> {
    hex::decode(value).map_err(|_| VaultError::Corrupted(format!("bad hex in {field}")))
}

// ─── Persistence ──────────────────────────────────────────────────────────────

/// Atomic write: temp file in the same directory, then rename over the target.
fn write_vault_file(path: &Path, file: &VaultFile) -> Result<(), VaultError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let serialized = serde_json::to_string_pretty(file)
        .map_err(|e| VaultError::Corrupted(e.to_string()))?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, serialized)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }

    std::fs::rename(&tmp, path)?;
    Ok(())
}

fn lock_unpoisoned<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}
