//! AEAD cipher core for the Shadowsocks stream layer.
//!
//! Key schedule: `master = KDF(password)` (EVP_BytesToKey, iterated
//! MD5 — bit-compatible with every other Shadowsocks implementation),
//! then per connection `subkey = HKDF-SHA1(master, salt, "ss-subkey")`.
//! Each direction seals/opens with a counter nonce, all-zero initial,
//! incremented as a little-endian unsigned integer after every
//! operation.

use aes::{Aes128, Aes192, Aes256};
use aes_gcm::aead::generic_array::typenum::U12;
use aes_gcm::aead::Aead;
use aes_gcm::{AesGcm, KeyInit, Nonce};
use chacha20poly1305::ChaCha20Poly1305;
use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::{Error, Result};

type Aes128Gcm = AesGcm<Aes128, U12>;
type Aes192Gcm = AesGcm<Aes192, U12>;
type Aes256Gcm = AesGcm<Aes256, U12>;

/// AEAD tag length; all supported methods use 16 bytes.
pub const TAG_SIZE: usize = 16;

/// AEAD nonce length; all supported methods use 12 bytes.
pub const NONCE_SIZE: usize = 12;

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// Supported AEAD methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Aes128Gcm,
    Aes192Gcm,
    Aes256Gcm,
    ChaCha20Poly1305,
}

impl Method {
    /// Resolve a method name; an empty name selects the default.
    pub fn from_name(name: &str) -> Result<Method> {
        match name {
            "" | "aes-128-gcm" => Ok(Method::Aes128Gcm),
            "aes-192-gcm" => Ok(Method::Aes192Gcm),
            "aes-256-gcm" => Ok(Method::Aes256Gcm),
            "chacha20-ietf-poly1305" => Ok(Method::ChaCha20Poly1305),
            other => Err(Error::unsupported(format!(
                "unsupported encryption method: {}",
                other
            ))),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Method::Aes128Gcm => "aes-128-gcm",
            Method::Aes192Gcm => "aes-192-gcm",
            Method::Aes256Gcm => "aes-256-gcm",
            Method::ChaCha20Poly1305 => "chacha20-ietf-poly1305",
        }
    }

    /// Key size in bytes; also the salt size on the wire.
    pub fn key_size(&self) -> usize {
        match self {
            Method::Aes128Gcm => 16,
            Method::Aes192Gcm => 24,
            Method::Aes256Gcm | Method::ChaCha20Poly1305 => 32,
        }
    }
}

/// EVP_BytesToKey-equivalent password-to-key derivation: iterative MD5
/// of `prev || password`, concatenated until `key_len` bytes exist.
pub fn kdf(password: &str, key_len: usize) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::with_capacity(key_len + 16);
    let mut prev: Vec<u8> = Vec::new();
    while out.len() < key_len {
        let mut h = Md5::new();
        h.update(&prev);
        h.update(password.as_bytes());
        prev = h.finalize().to_vec();
        out.extend_from_slice(&prev);
    }
    out.truncate(key_len);
    out
}

fn hkdf_sha1(master: &[u8], salt: &[u8], out: &mut [u8]) -> Result<()> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master);
    hk.expand(SUBKEY_INFO, out)
        .map_err(|_| Error::crypto("hkdf-sha1 expand failed"))
}

#[allow(clippy::large_enum_variant)]
enum AeadImpl {
    Aes128(Aes128Gcm),
    Aes192(Aes192Gcm),
    Aes256(Aes256Gcm),
    ChaCha(ChaCha20Poly1305),
}

impl AeadImpl {
    fn new(method: Method, key: &[u8]) -> AeadImpl {
        match method {
            Method::Aes128Gcm => AeadImpl::Aes128(Aes128Gcm::new(key.into())),
            Method::Aes192Gcm => AeadImpl::Aes192(Aes192Gcm::new(key.into())),
            Method::Aes256Gcm => AeadImpl::Aes256(Aes256Gcm::new(key.into())),
            Method::ChaCha20Poly1305 => AeadImpl::ChaCha(ChaCha20Poly1305::new(key.into())),
        }
    }

    fn seal(&self, nonce: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let out = match self {
            AeadImpl::Aes128(c) => c.encrypt(nonce, plaintext),
            AeadImpl::Aes192(c) => c.encrypt(nonce, plaintext),
            AeadImpl::Aes256(c) => c.encrypt(nonce, plaintext),
            AeadImpl::ChaCha(c) => c.encrypt(nonce, plaintext),
        };
        out.map_err(|_| Error::crypto("aead seal failed"))
    }

    fn open(&self, nonce: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>> {
        let nonce = Nonce::from_slice(nonce);
        let out = match self {
            AeadImpl::Aes128(c) => c.decrypt(nonce, ciphertext),
            AeadImpl::Aes192(c) => c.decrypt(nonce, ciphertext),
            AeadImpl::Aes256(c) => c.decrypt(nonce, ciphertext),
            AeadImpl::ChaCha(c) => c.decrypt(nonce, ciphertext),
        };
        out.map_err(|_| Error::crypto("aead open failed"))
    }
}

/// One direction of an AEAD connection: a subkey-bound cipher plus a
/// monotonically incremented counter nonce. Once created the nonce
/// only advances; it is never reset.
pub struct AeadState {
    aead: AeadImpl,
    nonce: [u8; NONCE_SIZE],
}

impl AeadState {
    fn new(method: Method, subkey: &[u8]) -> AeadState {
        AeadState {
            aead: AeadImpl::new(method, subkey),
            nonce: [0u8; NONCE_SIZE],
        }
    }

    /// Encrypt `plaintext` (tag appended) and advance the nonce.
    pub fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let out = self.aead.seal(&self.nonce, plaintext)?;
        increment(&mut self.nonce);
        Ok(out)
    }

    /// Decrypt `ciphertext || tag` and advance the nonce. A failed
    /// open is fatal for the connection; the nonce still advances so
    /// state never rewinds.
    pub fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let out = self.aead.open(&self.nonce, ciphertext);
        increment(&mut self.nonce);
        out
    }

    /// Current nonce as a little-endian counter value.
    pub fn nonce_value(&self) -> u128 {
        let mut v: u128 = 0;
        for (i, b) in self.nonce.iter().enumerate() {
            v |= (*b as u128) << (8 * i);
        }
        v
    }
}

/// Increment a little-endian unsigned integer, wrapping on overflow.
fn increment(nonce: &mut [u8]) {
    for b in nonce.iter_mut() {
        *b = b.wrapping_add(1);
        if *b != 0 {
            return;
        }
    }
}

/// Master key + method. Cloning shares only the method and master key;
/// every connection derives fresh per-direction state from its salt.
#[derive(Clone)]
pub struct Cipher {
    method: Method,
    key: Vec<u8>,
}

impl Cipher {
    pub fn new(method: Method, password: &str) -> Result<Cipher> {
        if password.is_empty() {
            return Err(Error::config("empty password"));
        }
        let key = kdf(password, method.key_size());
        Ok(Cipher { method, key })
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// Salt length on the wire equals the key size.
    pub fn salt_size(&self) -> usize {
        self.method.key_size()
    }

    /// Bind one direction to a salt.
    pub fn state(&self, salt: &[u8]) -> Result<AeadState> {
        let mut subkey = vec![0u8; self.method.key_size()];
        hkdf_sha1(&self.key, salt, &mut subkey)?;
        Ok(AeadState::new(self.method, &subkey))
    }
}
