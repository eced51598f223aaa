//! Peer session keys and payload encryption
//!
//! Each peer pair runs two independent AES-128 session keys, one per
//! direction. Our key is wrapped with the peer's RSA public key and signed
//! with our RSA private key; the wrapped blob is announced in full once and
//! afterwards referenced only by its CRC32.
//!
//! Payloads are deflated, zero-padded to the block size and encrypted with
//! AES-128 chained block by block from a random per-packet IV.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use ring::rand::{SecureRandom, SystemRandom};
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, Pkcs1v15Sign, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};

use crate::wire::MAX_PACKET_SIZE;

/// AES block and key size
pub const BLOCK_LEN: usize = 16;

/// Session key
pub type SessionKey = [u8; BLOCK_LEN];

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// Key file missing or unreadable
    MissingKey(String),
    /// Signature over the wrapped key does not verify
    BadSignature,
    /// Unwrapped key has the wrong size or RSA decryption failed
    BadKey,
    /// Ciphertext is not a whole number of blocks
    BadLength(usize),
    /// Deflate or inflate failed
    Compression(String),
    /// RSA operation failed
    Rsa(String),
    /// System random source failed
    Rng,
}

impl fmt::Display for CryptoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CryptoError::MissingKey(name) => write!(f, "key '{}' not available", name),
            CryptoError::BadSignature => write!(f, "signature verification failed"),
            CryptoError::BadKey => write!(f, "unable to unwrap session key"),
            CryptoError::BadLength(len) => write!(f, "ciphertext length {} is not block aligned", len),
            CryptoError::Compression(msg) => write!(f, "compression error: {}", msg),
            CryptoError::Rsa(msg) => write!(f, "RSA error: {}", msg),
            CryptoError::Rng => write!(f, "random source unavailable"),
        }
    }
}

impl std::error::Error for CryptoError {}

// ============================================================================
// Primitives
// ============================================================================

fn fill_random(buf: &mut [u8]) -> Result<(), CryptoError> {
    SystemRandom::new().fill(buf).map_err(|_| CryptoError::Rng)
}

/// Fresh random session key
pub fn generate_session_key() -> Result<SessionKey, CryptoError> {
    let mut key = [0u8; BLOCK_LEN];
    fill_random(&mut key)?;
    Ok(key)
}

/// Fresh random IV
pub fn random_iv() -> Result<[u8; BLOCK_LEN], CryptoError> {
    let mut iv = [0u8; BLOCK_LEN];
    fill_random(&mut iv)?;
    Ok(iv)
}

/// Encrypt whole blocks, chaining each plaintext block with the previous
/// ciphertext block (the IV for the first one).
pub fn encrypt_block(plain: &[u8], key: &SessionKey, iv: &[u8; BLOCK_LEN]) -> Result<Vec<u8>, CryptoError> {
    if plain.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::BadLength(plain.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(plain.len());
    let mut prev = *iv;
    for chunk in plain.chunks(BLOCK_LEN) {
        let mut block = GenericArray::clone_from_slice(chunk);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        cipher.encrypt_block(&mut block);
        prev.copy_from_slice(&block);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Reverse of [`encrypt_block`]
pub fn decrypt_block(data: &[u8], key: &SessionKey, iv: &[u8; BLOCK_LEN]) -> Result<Vec<u8>, CryptoError> {
    if data.len() % BLOCK_LEN != 0 {
        return Err(CryptoError::BadLength(data.len()));
    }
    let cipher = Aes128::new(GenericArray::from_slice(key));
    let mut out = Vec::with_capacity(data.len());
    let mut prev = *iv;
    for chunk in data.chunks(BLOCK_LEN) {
        let mut block = GenericArray::clone_from_slice(chunk);
        cipher.decrypt_block(&mut block);
        for (b, p) in block.iter_mut().zip(prev.iter()) {
            *b ^= p;
        }
        prev.copy_from_slice(chunk);
        out.extend_from_slice(&block);
    }
    Ok(out)
}

/// Deflate, pad and encrypt a payload under a random IV
pub fn seal(payload: &[u8], key: &SessionKey) -> Result<([u8; BLOCK_LEN], Vec<u8>), CryptoError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(payload)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    let mut compressed = encoder
        .finish()
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    let padded = compressed.len().div_ceil(BLOCK_LEN) * BLOCK_LEN;
    compressed.resize(padded.max(BLOCK_LEN), 0);
    let iv = random_iv()?;
    let data = encrypt_block(&compressed, key, &iv)?;
    Ok((iv, data))
}

/// Decrypt and inflate a payload produced by [`seal`]. Zero padding after
/// the end of the deflate stream is ignored; output larger than a packet
/// is refused.
pub fn open(iv: &[u8; BLOCK_LEN], data: &[u8], key: &SessionKey) -> Result<Vec<u8>, CryptoError> {
    let compressed = decrypt_block(data, key, iv)?;
    let decoder = ZlibDecoder::new(compressed.as_slice());
    let mut out = Vec::new();
    decoder
        .take(MAX_PACKET_SIZE as u64 + 1)
        .read_to_end(&mut out)
        .map_err(|e| CryptoError::Compression(e.to_string()))?;
    if out.len() > MAX_PACKET_SIZE {
        return Err(CryptoError::Compression(format!(
            "inflated payload exceeds {} bytes",
            MAX_PACKET_SIZE
        )));
    }
    Ok(out)
}

/// RSA-wrapped session key as carried by SHAREDKEY + SIGNATURE
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WrappedKey {
    pub ciphertext: Vec<u8>,
    pub signature: Vec<u8>,
}

impl WrappedKey {
    /// Fingerprint announced in KEYCRC32
    pub fn crc32(&self) -> u32 {
        crc32fast::hash(&self.ciphertext)
    }
}

/// Wrap `key` for the peer and sign the result with our private key
pub fn wrap_key_for_peer(
    key: &SessionKey,
    peer_public: &RsaPublicKey,
    our_private: &RsaPrivateKey,
) -> Result<WrappedKey, CryptoError> {
    let mut rng = rand::thread_rng();
    let ciphertext = peer_public
        .encrypt(&mut rng, Oaep::new::<Sha256>(), key)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    let digest = Sha256::digest(&ciphertext);
    let signature = our_private
        .sign(Pkcs1v15Sign::new::<Sha256>(), &digest)
        .map_err(|e| CryptoError::Rsa(e.to_string()))?;
    Ok(WrappedKey { ciphertext, signature })
}

/// Verify the peer's signature and unwrap its session key with our private key
pub fn verify_and_unwrap(
    wrapped: &WrappedKey,
    peer_public: &RsaPublicKey,
    our_private: &RsaPrivateKey,
) -> Result<SessionKey, CryptoError> {
    if wrapped.signature.len() != peer_public.size() || wrapped.ciphertext.len() != our_private.size() {
        return Err(CryptoError::BadKey);
    }
    let digest = Sha256::digest(&wrapped.ciphertext);
    peer_public
        .verify(Pkcs1v15Sign::new::<Sha256>(), &digest, &wrapped.signature)
        .map_err(|_| CryptoError::BadSignature)?;
    let plain = our_private
        .decrypt(Oaep::new::<Sha256>(), &wrapped.ciphertext)
        .map_err(|_| CryptoError::BadKey)?;
    if plain.len() != BLOCK_LEN {
        return Err(CryptoError::BadKey);
    }
    let mut key = [0u8; BLOCK_LEN];
    key.copy_from_slice(&plain);
    Ok(key)
}

// ============================================================================
// Key files
// ============================================================================

/// RSA keys loaded from a key directory.
///
/// Public keys live in `<dir>/<name>.pub`, private keys in `<dir>/<name>.key`,
/// both PEM (PKCS#8 or PKCS#1).
#[derive(Debug, Default)]
pub struct KeyRing {
    dir: PathBuf,
    public: HashMap<String, RsaPublicKey>,
    private: HashMap<String, RsaPrivateKey>,
}

impl KeyRing {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            public: HashMap::new(),
            private: HashMap::new(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Public key by name, loaded on first use
    pub fn public_key(&mut self, name: &str) -> Result<RsaPublicKey, CryptoError> {
        if let Some(key) = self.public.get(name) {
            return Ok(key.clone());
        }
        let path = self.dir.join(format!("{}.pub", name));
        let pem = std::fs::read_to_string(&path)
            .map_err(|_| CryptoError::MissingKey(path.display().to_string()))?;
        let key = RsaPublicKey::from_public_key_pem(&pem)
            .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        self.public.insert(name.to_string(), key.clone());
        Ok(key)
    }

    /// Private key by name, loaded on first use
    pub fn private_key(&mut self, name: &str) -> Result<RsaPrivateKey, CryptoError> {
        if let Some(key) = self.private.get(name) {
            return Ok(key.clone());
        }
        let path = self.dir.join(format!("{}.key", name));
        let pem = std::fs::read_to_string(&path)
            .map_err(|_| CryptoError::MissingKey(path.display().to_string()))?;
        let key = RsaPrivateKey::from_pkcs8_pem(&pem)
            .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
            .map_err(|e| CryptoError::Rsa(e.to_string()))?;
        self.private.insert(name.to_string(), key.clone());
        Ok(key)
    }

    /// Forget loaded keys so a reload picks up replaced files
    pub fn clear(&mut self) {
        self.public.clear();
        self.private.clear();
    }
}

// ============================================================================
// Per-peer session state
// ============================================================================

/// Our outbound session key toward one peer
#[derive(Debug, Clone)]
pub struct LocalKey {
    pub key: SessionKey,
    pub wrapped: WrappedKey,
    pub crc32: u32,
    pub expires: Instant,
}

/// The peer's session key, as last accepted from it
#[derive(Debug, Clone)]
pub struct RemoteKey {
    pub key: SessionKey,
    pub wrapped: WrappedKey,
    pub crc32: u32,
}

/// Session key material shared by all transactions with one peer
#[derive(Debug, Clone, Default)]
pub struct CryptoSession {
    pub us: Option<LocalKey>,
    pub them: Option<RemoteKey>,
}

impl CryptoSession {
    /// Current outbound key, regenerated and re-wrapped when expired.
    ///
    /// Returns the key and whether a new one was generated, in which case
    /// the peer must receive the full wrapped blob again.
    pub fn update_key(
        &mut self,
        peer_public: &RsaPublicKey,
        our_private: &RsaPrivateKey,
        ttl: Duration,
        now: Instant,
    ) -> Result<(LocalKey, bool), CryptoError> {
        if let Some(current) = &self.us {
            if current.expires > now {
                return Ok((current.clone(), false));
            }
        }
        let key = generate_session_key()?;
        let wrapped = wrap_key_for_peer(&key, peer_public, our_private)?;
        let local = LocalKey {
            key,
            crc32: wrapped.crc32(),
            wrapped,
            expires: now + ttl,
        };
        log::debug!("Generated new session key (crc {:08x})", local.crc32);
        self.us = Some(local.clone());
        Ok((local, true))
    }

    /// Accept the peer's key announcement.
    ///
    /// A KEYCRC32 matching the key we already hold, or a blob identical to
    /// the last one, is accepted without RSA work. Otherwise the full blob
    /// is verified against the peer's public key and unwrapped.
    pub fn check_key(
        &mut self,
        wrapped: Option<WrappedKey>,
        crc32: Option<u32>,
        peer_public: &RsaPublicKey,
        our_private: &RsaPrivateKey,
    ) -> Result<SessionKey, CryptoError> {
        if let (Some(them), Some(crc)) = (&self.them, crc32) {
            if them.crc32 == crc {
                return Ok(them.key);
            }
        }
        let wrapped = wrapped.ok_or(CryptoError::BadKey)?;
        if let Some(them) = &self.them {
            if them.wrapped == wrapped {
                return Ok(them.key);
            }
        }
        let key = verify_and_unwrap(&wrapped, peer_public, our_private)?;
        log::debug!("Accepted new peer session key (crc {:08x})", wrapped.crc32());
        self.them = Some(RemoteKey {
            key,
            crc32: wrapped.crc32(),
            wrapped,
        });
        Ok(key)
    }

    /// Forget all key material
    pub fn reset(&mut self) {
        self.us = None;
        self.them = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 1024).unwrap();
        let public = RsaPublicKey::from(&private);
        (private, public)
    }

    #[test]
    fn test_block_round_trip() {
        let key = generate_session_key().unwrap();
        let iv = random_iv().unwrap();
        for blocks in 1..5 {
            let plain: Vec<u8> = (0..blocks * BLOCK_LEN).map(|i| i as u8).collect();
            let ct = encrypt_block(&plain, &key, &iv).unwrap();
            assert_eq!(ct.len(), plain.len());
            assert_ne!(ct, plain);
            assert_eq!(decrypt_block(&ct, &key, &iv).unwrap(), plain);
        }
    }

    #[test]
    fn test_chaining_hides_repeated_blocks() {
        let key = [7u8; BLOCK_LEN];
        let iv = [0u8; BLOCK_LEN];
        let plain = [0x41u8; 2 * BLOCK_LEN];
        let ct = encrypt_block(&plain, &key, &iv).unwrap();
        assert_ne!(ct[..BLOCK_LEN], ct[BLOCK_LEN..]);
    }

    #[test]
    fn test_unaligned_rejected() {
        let key = [1u8; BLOCK_LEN];
        let iv = [0u8; BLOCK_LEN];
        assert_eq!(encrypt_block(&[0u8; 15], &key, &iv), Err(CryptoError::BadLength(15)));
        assert_eq!(decrypt_block(&[0u8; 17], &key, &iv), Err(CryptoError::BadLength(17)));
    }

    #[test]
    fn test_seal_open() {
        let key = generate_session_key().unwrap();
        for len in [0usize, 1, 15, 16, 17, 300, 2000] {
            let payload: Vec<u8> = (0..len).map(|i| (i * 31) as u8).collect();
            let (iv, data) = seal(&payload, &key).unwrap();
            assert_eq!(data.len() % BLOCK_LEN, 0);
            assert_eq!(open(&iv, &data, &key).unwrap(), payload);
        }
    }

    #[test]
    fn test_open_with_wrong_key_fails() {
        let key = generate_session_key().unwrap();
        let (iv, data) = seal(b"hello dundi", &key).unwrap();
        let other = [0x55u8; BLOCK_LEN];
        assert!(open(&iv, &data, &other).map(|p| p != b"hello dundi").unwrap_or(true));
    }

    #[test]
    fn test_open_refuses_oversized_payload() {
        let key = generate_session_key().unwrap();
        let (iv, data) = seal(&vec![0u8; 100_000], &key).unwrap();
        assert!(data.len() < MAX_PACKET_SIZE);
        assert!(matches!(open(&iv, &data, &key), Err(CryptoError::Compression(_))));

        let (iv, data) = seal(&vec![0u8; MAX_PACKET_SIZE], &key).unwrap();
        assert_eq!(open(&iv, &data, &key).unwrap().len(), MAX_PACKET_SIZE);
    }

    #[test]
    fn test_wrap_and_unwrap() {
        let (a_priv, a_pub) = keypair();
        let (b_priv, b_pub) = keypair();
        let key = generate_session_key().unwrap();

        let wrapped = wrap_key_for_peer(&key, &b_pub, &a_priv).unwrap();
        assert_eq!(wrapped.ciphertext.len(), 128);
        assert_eq!(wrapped.signature.len(), 128);
        assert_eq!(verify_and_unwrap(&wrapped, &a_pub, &b_priv).unwrap(), key);

        // Signed by the wrong party
        assert_eq!(
            verify_and_unwrap(&wrapped, &b_pub, &b_priv),
            Err(CryptoError::BadSignature)
        );
    }

    #[test]
    fn test_session_fast_path() {
        let (a_priv, a_pub) = keypair();
        let (b_priv, b_pub) = keypair();
        let now = Instant::now();

        let mut a_side = CryptoSession::default();
        let (local, fresh) = a_side
            .update_key(&b_pub, &a_priv, Duration::from_secs(3600), now)
            .unwrap();
        assert!(fresh);
        let (again, fresh) = a_side
            .update_key(&b_pub, &a_priv, Duration::from_secs(3600), now)
            .unwrap();
        assert!(!fresh);
        assert_eq!(again.key, local.key);

        let mut b_side = CryptoSession::default();
        // CRC alone is not enough before the full key was seen
        assert!(b_side.check_key(None, Some(local.crc32), &a_pub, &b_priv).is_err());
        let key = b_side
            .check_key(Some(local.wrapped.clone()), Some(local.crc32), &a_pub, &b_priv)
            .unwrap();
        assert_eq!(key, local.key);
        // Now the CRC short-circuits
        assert_eq!(b_side.check_key(None, Some(local.crc32), &a_pub, &b_priv).unwrap(), key);
    }

    #[test]
    fn test_expired_key_regenerated() {
        let (a_priv, _) = keypair();
        let (_, b_pub) = keypair();
        let now = Instant::now();
        let mut session = CryptoSession::default();
        let (first, _) = session.update_key(&b_pub, &a_priv, Duration::from_secs(1), now).unwrap();
        let (second, fresh) = session
            .update_key(&b_pub, &a_priv, Duration::from_secs(1), now + Duration::from_secs(2))
            .unwrap();
        assert!(fresh);
        assert_ne!(first.crc32, second.crc32);
    }

    #[test]
    fn test_keyring_loads_pem() {
        use rsa::pkcs8::{EncodePrivateKey, EncodePublicKey, LineEnding};
        let dir = tempfile::tempdir().unwrap();
        let (private, public) = keypair();
        std::fs::write(
            dir.path().join("node.key"),
            private.to_pkcs8_pem(LineEnding::LF).unwrap().as_bytes(),
        )
        .unwrap();
        std::fs::write(
            dir.path().join("node.pub"),
            public.to_public_key_pem(LineEnding::LF).unwrap(),
        )
        .unwrap();

        let mut ring = KeyRing::new(dir.path());
        assert_eq!(ring.public_key("node").unwrap(), public);
        assert!(ring.private_key("node").is_ok());
        assert!(matches!(ring.public_key("missing"), Err(CryptoError::MissingKey(_))));
    }
}
