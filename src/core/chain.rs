//! Tamper-evident attestation chain.
//!
//! Each Change owns a single linear chain:
//!
//! ```text
//! hash[i]      = SHA-256(previous_hash[i] || canonical_json(body[i]))
//! signature[i] = ed25519_sign(orchestrator_key, hash[i])
//! ```
//!
//! `previous_hash[0]` is `GENESIS_HASH` (32 zero bytes, hex encoded).
//! Canonical JSON is serde_json output with object keys sorted
//! recursively. Each append reads the ledger's head and writes the new link
//! under the ledger's exclusive file lock, so concurrent stage completions
//! land in completion order and the chain never forks, even with several
//! processes writing.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use parking_lot::Mutex;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::domain::{Attestation, AttestationPayload, Subject};

use super::clock::Clock;
use super::error::{OrchestratorError, OrchestratorResult};
use super::ledger::Ledger;

/// Seed used in place of `previous_hash` for the first link of every chain
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// Key id: first 16 hex chars of SHA-256 over the public key
pub fn key_id(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// Parse a hex ed25519 signature; `None` if it is not 64 bytes of hex
pub fn parse_signature(signature_hex: &str) -> Option<Signature> {
    let bytes = hex::decode(signature_hex.trim()).ok()?;
    let bytes: [u8; 64] = bytes.try_into().ok()?;
    Some(Signature::from_bytes(&bytes))
}

/// Verify a hex signature over a message
pub fn verify_hex(key: &VerifyingKey, message: &[u8], signature_hex: &str) -> bool {
    match parse_signature(signature_hex) {
        Some(signature) => key.verify(message, &signature).is_ok(),
        None => false,
    }
}

/// Parse a hex ed25519 public key
pub fn parse_verifying_key(key_hex: &str) -> Result<VerifyingKey> {
    let bytes = hex::decode(key_hex.trim()).context("Public key is not valid hex")?;
    let bytes: [u8; 32] = bytes
        .try_into()
        .map_err(|_| anyhow::anyhow!("Public key must be 32 bytes"))?;
    VerifyingKey::from_bytes(&bytes).context("Invalid ed25519 public key")
}

/// Signing identity of the orchestrator (or of an approver, client side)
pub struct AttestationSigner {
    key: SigningKey,
    key_id: String,
}

impl AttestationSigner {
    /// Generate a fresh random key
    pub fn generate() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    pub fn from_signing_key(key: SigningKey) -> Self {
        let key_id = key_id(&key.verifying_key());
        Self { key, key_id }
    }

    /// Load a secret key from hex
    pub fn from_hex(secret_hex: &str) -> Result<Self> {
        let bytes = hex::decode(secret_hex.trim()).context("Signing key is not valid hex")?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| anyhow::anyhow!("Signing key must be 32 bytes"))?;
        Ok(Self::from_signing_key(SigningKey::from_bytes(&bytes)))
    }

    /// Load the key at `path`, generating and persisting one if absent.
    ///
    /// The public half is written next to it as `<path>.pub`.
    pub fn load_or_generate(path: &Path) -> Result<Self> {
        if path.exists() {
            let secret = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read signing key: {}", path.display()))?;
            return Self::from_hex(&secret);
        }

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create key directory: {}", parent.display()))?;
        }

        let signer = Self::generate();
        std::fs::write(path, signer.secret_hex())
            .with_context(|| format!("Failed to write signing key: {}", path.display()))?;
        let pub_path = path.with_extension("pub");
        std::fs::write(&pub_path, signer.public_hex())
            .with_context(|| format!("Failed to write public key: {}", pub_path.display()))?;

        debug!(key_id = %signer.key_id, "Generated signing key");
        Ok(signer)
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.key.verifying_key()
    }

    pub fn public_hex(&self) -> String {
        hex::encode(self.key.verifying_key().as_bytes())
    }

    pub fn secret_hex(&self) -> String {
        hex::encode(self.key.to_bytes())
    }

    /// Sign a message, returning the signature as hex
    pub fn sign(&self, message: &[u8]) -> String {
        hex::encode(self.key.sign(message).to_bytes())
    }
}

/// Trusted public keys by key id
#[derive(Debug, Clone, Default)]
pub struct KeyRing {
    keys: HashMap<String, VerifyingKey>,
}

impl KeyRing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a key, returning its id
    pub fn insert(&mut self, key: VerifyingKey) -> String {
        let id = key_id(&key);
        self.keys.insert(id.clone(), key);
        id
    }

    pub fn get(&self, key_id: &str) -> Option<&VerifyingKey> {
        self.keys.get(key_id)
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// Load every `*.pub` file (hex public key) in a directory
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut ring = Self::new();
        if !dir.exists() {
            return Ok(ring);
        }

        for entry in std::fs::read_dir(dir)
            .with_context(|| format!("Failed to read key directory: {}", dir.display()))?
        {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("pub") {
                continue;
            }
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("Failed to read public key: {}", path.display()))?;
            match parse_verifying_key(&content) {
                Ok(key) => {
                    ring.insert(key);
                }
                Err(e) => warn!(path = %path.display(), error = %e, "Skipping unreadable public key"),
            }
        }

        Ok(ring)
    }
}

#[derive(Serialize)]
struct CanonicalBody<'a> {
    index: u64,
    change_id: &'a Uuid,
    subject: &'a Subject,
    payload: &'a AttestationPayload,
    signer_key_id: &'a str,
    recorded_at: &'a DateTime<Utc>,
}

/// Recursively sort object keys so the encoding is independent of field order
fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(String, Value)> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(
                entries
                    .into_iter()
                    .map(|(k, v)| (k, sort_keys(v)))
                    .collect(),
            )
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

/// Canonical bytes of everything an attestation's hash covers except the link
pub fn canonical_body(attestation: &Attestation) -> Result<Vec<u8>> {
    let body = CanonicalBody {
        index: attestation.index,
        change_id: &attestation.change_id,
        subject: &attestation.subject,
        payload: &attestation.payload,
        signer_key_id: &attestation.signer_key_id,
        recorded_at: &attestation.recorded_at,
    };
    let value = serde_json::to_value(&body).context("Failed to encode attestation body")?;
    serde_json::to_vec(&sort_keys(value)).context("Failed to serialize attestation body")
}

/// `SHA-256(previous_hash || canonical_body)`, hex encoded
pub fn compute_hash(attestation: &Attestation) -> Result<String> {
    let previous = hex::decode(&attestation.previous_hash).context("Previous hash is not valid hex")?;
    let mut hasher = Sha256::new();
    hasher.update(&previous);
    hasher.update(canonical_body(attestation)?);
    Ok(hex::encode(hasher.finalize()))
}

/// Result of verifying a chain end to end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainVerification {
    pub valid: bool,

    /// Number of links examined
    pub length: u64,

    /// First index at which the chain diverges
    pub broken_at: Option<u64>,

    pub reason: Option<String>,

    /// Hash of the last valid link
    pub head: Option<String>,
}

impl ChainVerification {
    fn broken(index: u64, length: u64, reason: impl Into<String>, head: Option<String>) -> Self {
        Self {
            valid: false,
            length,
            broken_at: Some(index),
            reason: Some(reason.into()),
            head,
        }
    }

    /// Convert a broken result into `ChainVerificationFailure`
    pub fn into_result(self, change_id: Uuid) -> OrchestratorResult<Self> {
        match self.broken_at {
            Some(index) => Err(OrchestratorError::ChainVerificationFailure {
                change_id,
                index,
                reason: self.reason.unwrap_or_default(),
            }),
            None => Ok(self),
        }
    }
}

impl std::fmt::Display for ChainVerification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.valid, self.broken_at) {
            (true, _) => write!(f, "valid ({} attestations)", self.length),
            (false, Some(i)) => write!(
                f,
                "BROKEN at index {}: {}",
                i,
                self.reason.as_deref().unwrap_or("unknown")
            ),
            (false, None) => f.write_str("BROKEN"),
        }
    }
}

/// Verify a sequence of links for one change against a key ring
pub fn verify_attestations(
    change_id: Uuid,
    attestations: &[Attestation],
    keyring: &KeyRing,
) -> ChainVerification {
    let length = attestations.len() as u64;
    let mut expected_previous = GENESIS_HASH.to_string();
    let mut head: Option<String> = None;

    for (i, attestation) in attestations.iter().enumerate() {
        let i = i as u64;
        let broken = |reason: String| ChainVerification::broken(i, length, reason, head.clone());

        if attestation.index != i {
            return broken(format!("expected index {}, found {}", i, attestation.index));
        }
        if attestation.change_id != change_id {
            return broken(format!("link belongs to change {}", attestation.change_id));
        }
        if attestation.previous_hash != expected_previous {
            return broken("previous hash does not match the preceding link".to_string());
        }
        if attestation.subject != attestation.payload.subject() {
            return broken("subject does not match payload".to_string());
        }

        match compute_hash(attestation) {
            Ok(hash) if hash == attestation.hash => {}
            Ok(_) => return broken("hash mismatch: content was modified".to_string()),
            Err(e) => return broken(format!("hash could not be recomputed: {}", e)),
        }

        let Some(key) = keyring.get(&attestation.signer_key_id) else {
            return broken(format!("unknown signer key '{}'", attestation.signer_key_id));
        };
        let hash_bytes = match hex::decode(&attestation.hash) {
            Ok(bytes) => bytes,
            Err(_) => return broken("hash is not valid hex".to_string()),
        };
        if !verify_hex(key, &hash_bytes, &attestation.signature) {
            return broken("signature does not verify".to_string());
        }

        expected_previous = attestation.hash.clone();
        head = Some(attestation.hash.clone());
    }

    ChainVerification {
        valid: true,
        length,
        broken_at: None,
        reason: None,
        head,
    }
}

/// Per-Change chains with single-writer append discipline
pub struct AttestationChain {
    signer: Arc<AttestationSigner>,
    keyring: KeyRing,
    ledger: Ledger,
    clock: Arc<dyn Clock>,

    /// Queues this process's appends before they contend for the file lock
    writers: Mutex<HashMap<Uuid, Arc<tokio::sync::Mutex<()>>>>,
}

impl AttestationChain {
    /// Create a chain service. The signer's key is always trusted.
    pub fn new(
        signer: Arc<AttestationSigner>,
        mut keyring: KeyRing,
        ledger: Ledger,
        clock: Arc<dyn Clock>,
    ) -> Self {
        keyring.insert(signer.verifying_key());
        Self {
            signer,
            keyring,
            ledger,
            clock,
            writers: Mutex::new(HashMap::new()),
        }
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn keyring(&self) -> &KeyRing {
        &self.keyring
    }

    pub fn signer_key_id(&self) -> &str {
        self.signer.key_id()
    }

    fn writer(&self, change_id: Uuid) -> Arc<tokio::sync::Mutex<()>> {
        self.writers.lock().entry(change_id).or_default().clone()
    }

    /// Append a new link: hash, sign and persist it after the ledger's
    /// current head, all under the ledger lock
    pub async fn append(
        &self,
        change_id: Uuid,
        payload: AttestationPayload,
    ) -> OrchestratorResult<Attestation> {
        let writer = self.writer(change_id);
        let _queued = writer.lock().await;

        let signer = self.signer.clone();
        let clock = self.clock.clone();

        let attestation = self
            .ledger
            .append_next(change_id, move |tail| {
                let mut attestation = Attestation {
                    index: tail.length,
                    change_id,
                    subject: payload.subject(),
                    payload,
                    signer_key_id: signer.key_id().to_string(),
                    recorded_at: clock.now(),
                    previous_hash: tail
                        .head
                        .clone()
                        .unwrap_or_else(|| GENESIS_HASH.to_string()),
                    hash: String::new(),
                    signature: String::new(),
                };
                attestation.hash = compute_hash(&attestation)?;
                let hash_bytes =
                    hex::decode(&attestation.hash).context("Computed hash is not hex")?;
                attestation.signature = signer.sign(&hash_bytes);
                Ok(attestation)
            })
            .await?;

        debug!(
            %change_id,
            index = attestation.index,
            subject = %attestation.subject,
            hash = attestation.short_hash(),
            "Attestation appended"
        );

        Ok(attestation)
    }

    /// Links for a change, in append order, as currently persisted
    pub async fn attestations(&self, change_id: Uuid) -> OrchestratorResult<Vec<Attestation>> {
        Ok(self.ledger.replay(change_id).await?)
    }

    /// Verify the persisted chain for a change, reading it back from the ledger
    pub async fn verify(&self, change_id: Uuid) -> OrchestratorResult<ChainVerification> {
        let contents = self.ledger.read(change_id).await?;
        let mut verification = verify_attestations(change_id, &contents.links, &self.keyring);

        if let Some((line, error)) = contents.corrupt_at {
            if verification.valid || verification.broken_at.map_or(false, |b| b > line) {
                verification = ChainVerification::broken(
                    line,
                    contents.links.len() as u64 + 1,
                    format!("ledger line could not be decoded: {}", error),
                    verification.head.clone(),
                );
            }
        }

        if !verification.valid {
            warn!(%change_id, result = %verification, "Attestation chain verification failed");
        }

        Ok(verification)
    }
}
