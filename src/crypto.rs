//! Cryptographic engine for the engine wire protocol
//!
//! Wraps the RSA and AES primitives the assertion engine protocol relies on:
//! PKCS#1 v1.5 SHA-256 signatures, RSA-OAEP envelope encryption and AES-CBC
//! symmetric decryption. Keys are treated as opaque PEM strings; base64
//! encoding and decoding of wire payloads happens at the call sites, never
//! in here.

use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private, Public};
use openssl::rsa::{Padding, Rsa};
use openssl::sign::{Signer, Verifier};
use openssl::symm::{Cipher, Crypter, Mode};
use rand::RngCore;
use thiserror::Error;

/// AES block size in bytes; IVs are normalized to this width
pub const AES_BLOCK_SIZE: usize = 16;

/// Errors raised by cryptographic operations. Malformed keys or ciphertext
/// always fail closed; no operation returns partial plaintext.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Sign(String),
    #[error("signature verification failed: {0}")]
    Verify(String),
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
}

/// RSA sign/verify/encrypt/decrypt plus AES-CBC decryption.
///
/// The private key (and optional passphrase) is supplied once at
/// construction; public keys are supplied per call because the engine
/// rotates its key and callers cache it with a TTL.
pub struct CryptoEngine {
    private_key: PKey<Private>,
    private_rsa: Rsa<Private>,
}

impl CryptoEngine {
    /// Build an engine around a PEM-encoded RSA private key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the PEM cannot be parsed or the
    /// passphrase is wrong.
    pub fn new(private_key_pem: &str, passphrase: Option<&str>) -> Result<Self, CryptoError> {
        let rsa = match passphrase {
            Some(pass) => {
                Rsa::private_key_from_pem_passphrase(private_key_pem.as_bytes(), pass.as_bytes())
            }
            None => Rsa::private_key_from_pem(private_key_pem.as_bytes()),
        }
        .map_err(|e| CryptoError::InvalidKey(format!("private key: {e}")))?;

        let private_key = PKey::from_rsa(rsa.clone())
            .map_err(|e| CryptoError::InvalidKey(format!("private key: {e}")))?;

        Ok(Self {
            private_key,
            private_rsa: rsa,
        })
    }

    /// Create an RSA PKCS#1 v1.5 SHA-256 signature over `data`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Sign` if the signer cannot be constructed.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut signer = Signer::new(MessageDigest::sha256(), &self.private_key)
            .map_err(|e| CryptoError::Sign(e.to_string()))?;
        signer
            .update(data)
            .map_err(|e| CryptoError::Sign(e.to_string()))?;
        signer
            .sign_to_vec()
            .map_err(|e| CryptoError::Sign(e.to_string()))
    }

    /// Verify an RSA PKCS#1 v1.5 SHA-256 signature against a PEM public key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` for unparseable keys. A signature
    /// that simply does not match yields `Ok(false)`, not an error.
    pub fn verify(
        &self,
        signature: &[u8],
        data: &[u8],
        public_key_pem: &str,
    ) -> Result<bool, CryptoError> {
        let key = parse_public_key(public_key_pem)?;
        let mut verifier = Verifier::new(MessageDigest::sha256(), &key)
            .map_err(|e| CryptoError::Verify(e.to_string()))?;
        verifier
            .update(data)
            .map_err(|e| CryptoError::Verify(e.to_string()))?;
        Ok(verifier.verify(signature).unwrap_or(false))
    }

    /// RSA-OAEP encrypt `data` for the holder of `public_key_pem`.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Encrypt` when the payload exceeds the modulus
    /// capacity or the key is unusable.
    pub fn encrypt_asymmetric(
        &self,
        data: &[u8],
        public_key_pem: &str,
    ) -> Result<Vec<u8>, CryptoError> {
        let key = parse_public_key(public_key_pem)?;
        let rsa = key
            .rsa()
            .map_err(|e| CryptoError::InvalidKey(e.to_string()))?;
        let mut buf = vec![0u8; rsa.size() as usize];
        let written = rsa
            .public_encrypt(data, &mut buf, Padding::PKCS1_OAEP)
            .map_err(|e| CryptoError::Encrypt(e.to_string()))?;
        buf.truncate(written);
        Ok(buf)
    }

    /// RSA-OAEP decrypt `data` with the engine's own private key.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decrypt` on malformed ciphertext.
    pub fn decrypt_asymmetric(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut buf = vec![0u8; self.private_rsa.size() as usize];
        let written = self
            .private_rsa
            .private_decrypt(data, &mut buf, Padding::PKCS1_OAEP)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        buf.truncate(written);
        Ok(buf)
    }

    /// AES-CBC decrypt without padding, trimming trailing NUL/whitespace fill.
    ///
    /// This matches the engine's white-label envelope format: the plaintext
    /// is space-padded to a block boundary rather than PKCS#7 padded. The
    /// cipher width is chosen from the key length (16/24/32 bytes).
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decrypt` for bad key lengths or ciphertext that
    /// is not a whole number of blocks.
    pub fn decrypt_symmetric(
        &self,
        data: &[u8],
        key: &[u8],
        iv: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let cipher = cipher_for_key(key)?;
        let iv = normalize_iv(iv);
        let mut crypter = Crypter::new(cipher, Mode::Decrypt, key, Some(&iv))
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        crypter.pad(false);

        let mut out = vec![0u8; data.len() + cipher.block_size()];
        let mut written = crypter
            .update(data, &mut out)
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        written += crypter
            .finalize(&mut out[written..])
            .map_err(|e| CryptoError::Decrypt(e.to_string()))?;
        out.truncate(written);

        while matches!(out.last(), Some(0 | b' ' | b'\t' | b'\r' | b'\n')) {
            out.pop();
        }
        Ok(out)
    }
}

/// AES-CBC encrypt with PKCS#7 padding. Used by the configuration secret
/// codec, which stores padded ciphertext.
///
/// # Errors
///
/// Returns `CryptoError::Encrypt` on bad key lengths.
pub fn encrypt_aes_cbc(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for_key(key).map_err(remap_to_encrypt)?;
    let iv = normalize_iv(iv);
    openssl::symm::encrypt(cipher, key, Some(&iv), data)
        .map_err(|e| CryptoError::Encrypt(e.to_string()))
}

/// AES-CBC decrypt with PKCS#7 padding, counterpart of [`encrypt_aes_cbc`].
///
/// # Errors
///
/// Returns `CryptoError::Decrypt` on bad key lengths, truncated ciphertext
/// or invalid padding.
pub fn decrypt_aes_cbc(data: &[u8], key: &[u8], iv: &[u8]) -> Result<Vec<u8>, CryptoError> {
    let cipher = cipher_for_key(key)?;
    let iv = normalize_iv(iv);
    openssl::symm::decrypt(cipher, key, Some(&iv), data)
        .map_err(|e| CryptoError::Decrypt(e.to_string()))
}

/// Generate a cryptographically secure alphanumeric identifier.
///
/// Used for SAML AuthnRequest IDs and test nonces. Prefixed with an
/// underscore so the value is always a valid XML NCName.
#[must_use]
pub fn generate_xml_id() -> String {
    let mut bytes = [0u8; 20];
    rand::rng().fill_bytes(&mut bytes);
    let mut id = String::with_capacity(41);
    id.push('_');
    for b in bytes {
        id.push_str(&format!("{b:02x}"));
    }
    id
}

/// Parse a public key that may arrive as a full PEM block or as a bare
/// base64 body (the engine's ping response omits the armor on some paths).
fn parse_public_key(pem: &str) -> Result<PKey<Public>, CryptoError> {
    let armored = if pem.contains("-----BEGIN") {
        pem.to_string()
    } else {
        format!(
            "-----BEGIN PUBLIC KEY-----\n{}\n-----END PUBLIC KEY-----\n",
            pem.trim()
        )
    };
    PKey::public_key_from_pem(armored.as_bytes())
        .map_err(|e| CryptoError::InvalidKey(format!("public key: {e}")))
}

fn cipher_for_key(key: &[u8]) -> Result<Cipher, CryptoError> {
    match key.len() {
        16 => Ok(Cipher::aes_128_cbc()),
        24 => Ok(Cipher::aes_192_cbc()),
        32 => Ok(Cipher::aes_256_cbc()),
        n => Err(CryptoError::Decrypt(format!(
            "unsupported AES key length: {n} bytes"
        ))),
    }
}

fn remap_to_encrypt(err: CryptoError) -> CryptoError {
    match err {
        CryptoError::Decrypt(msg) => CryptoError::Encrypt(msg),
        other => other,
    }
}

/// Truncate or zero-pad an IV to the AES block size, mirroring the lenient
/// IV handling of the original configuration store.
#[must_use]
pub fn normalize_iv(iv: &[u8]) -> [u8; AES_BLOCK_SIZE] {
    let mut out = [0u8; AES_BLOCK_SIZE];
    let take = iv.len().min(AES_BLOCK_SIZE);
    out[..take].copy_from_slice(&iv[..take]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_engine() -> (CryptoEngine, String) {
        let rsa = Rsa::generate(2048).unwrap();
        let private_pem = String::from_utf8(rsa.private_key_to_pem().unwrap()).unwrap();
        let public_pem = String::from_utf8(rsa.public_key_to_pem().unwrap()).unwrap();
        (CryptoEngine::new(&private_pem, None).unwrap(), public_pem)
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let (engine, public_pem) = test_engine();
        let signature = engine.sign(b"payload").unwrap();
        assert!(engine.verify(&signature, b"payload", &public_pem).unwrap());
        assert!(!engine.verify(&signature, b"tampered", &public_pem).unwrap());
    }

    #[test]
    fn asymmetric_round_trip() {
        let (engine, public_pem) = test_engine();
        let ciphertext = engine
            .encrypt_asymmetric(b"secret message", &public_pem)
            .unwrap();
        let plaintext = engine.decrypt_asymmetric(&ciphertext).unwrap();
        assert_eq!(plaintext, b"secret message");
    }

    #[test]
    fn decrypt_asymmetric_rejects_garbage() {
        let (engine, _) = test_engine();
        assert!(engine.decrypt_asymmetric(b"not a ciphertext").is_err());
    }

    #[test]
    fn symmetric_unpadded_trims_fill() {
        let (engine, _) = test_engine();
        let key = [7u8; 32];
        let iv = [9u8; 16];
        // Space-pad the plaintext to a block boundary as the engine does
        let plaintext = b"{\"qrcode\":\"x\"}  ";
        let cipher = Cipher::aes_256_cbc();
        let mut crypter = Crypter::new(cipher, Mode::Encrypt, &key, Some(&iv)).unwrap();
        crypter.pad(false);
        let mut data = vec![0u8; plaintext.len() + cipher.block_size()];
        let mut n = crypter.update(plaintext, &mut data).unwrap();
        n += crypter.finalize(&mut data[n..]).unwrap();
        data.truncate(n);

        let decrypted = engine.decrypt_symmetric(&data, &key, &iv).unwrap();
        assert_eq!(decrypted, b"{\"qrcode\":\"x\"}");
    }

    #[test]
    fn padded_aes_round_trip() {
        let key = [1u8; 16];
        let iv = b"short-iv";
        let ciphertext = encrypt_aes_cbc(b"private key material", &key, iv).unwrap();
        let plaintext = decrypt_aes_cbc(&ciphertext, &key, iv).unwrap();
        assert_eq!(plaintext, b"private key material");
    }

    #[test]
    fn bad_key_length_fails_closed() {
        let key = [1u8; 10];
        assert!(decrypt_aes_cbc(b"whatever", &key, b"iv").is_err());
    }

    #[test]
    fn public_key_accepts_bare_body() {
        let (engine, public_pem) = test_engine();
        let body: String = public_pem
            .lines()
            .filter(|l| !l.starts_with("-----"))
            .collect::<Vec<_>>()
            .join("\n");
        let signature = engine.sign(b"data").unwrap();
        assert!(engine.verify(&signature, b"data", &body).unwrap());
    }

    #[test]
    fn xml_ids_are_unique_and_ncname_safe() {
        let a = generate_xml_id();
        let b = generate_xml_id();
        assert_ne!(a, b);
        assert!(a.starts_with('_'));
        assert_eq!(a.len(), 41);
    }
}
