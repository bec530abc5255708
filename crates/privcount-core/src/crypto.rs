//! Key management and hybrid encryption for blinding shares.
//!
//! Each DC-to-SK share travels via the tally server, which must never learn
//! any share. Shares are encoded (compact JSON, then base64), encrypted with
//! a fresh Fernet key, and the Fernet key is RSA-OAEP-encrypted to the share
//! keeper's public key with SHA-256 as both the OAEP and MGF1 hash.
//!
//! Symmetric keys and decrypted plaintext are zeroized on every exit path.

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use fernet::Fernet;
use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs8::{
    DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding,
};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use crate::error::{Error, Result};

/// RSA modulus size for share keeper keypairs.
pub const RSA_KEY_BITS: usize = 4096;

/// Generate a new RSA keypair and write it to `path` as PKCS#8 PEM.
pub fn generate_keypair(path: &Path) -> Result<()> {
    generate_keypair_with_bits(path, RSA_KEY_BITS)
}

/// Keypair generation with an explicit modulus size (tests use small keys).
pub fn generate_keypair_with_bits(path: &Path, bits: usize) -> Result<()> {
    let private_key = RsaPrivateKey::new(&mut OsRng, bits)?;
    let pem = private_key.to_pkcs8_pem(LineEnding::LF)?;
    std::fs::write(path, pem.as_bytes())?;
    Ok(())
}

/// Load a private key from a PKCS#8 PEM file.
pub fn load_private_key_file(path: &Path) -> Result<RsaPrivateKey> {
    let pem = Zeroizing::new(std::fs::read_to_string(path)?);
    Ok(RsaPrivateKey::from_pkcs8_pem(&pem)?)
}

/// Load a public key from a PEM string.
pub fn load_public_key_pem(pem: &str) -> Result<RsaPublicKey> {
    Ok(RsaPublicKey::from_public_key_pem(pem)?)
}

/// The PEM encoding of a public key, as transmitted in START payloads.
pub fn public_key_pem(key: &RsaPublicKey) -> Result<String> {
    Ok(key.to_public_key_pem(LineEnding::LF)?)
}

/// The SHA-256 hex digest of a public key's DER encoding.
///
/// Share keeper identities are these digests: data collectors authorize SKs
/// by digest, never by transport identity.
pub fn public_key_digest(key: &RsaPublicKey) -> Result<String> {
    let der = key.to_public_key_der()?;
    let mut hasher = Sha256::new();
    hasher.update(der.as_bytes());
    Ok(hex::encode(hasher.finalize()))
}

/// The digest of the public half of a private key file.
pub fn private_key_file_digest(path: &Path) -> Result<String> {
    let key = load_private_key_file(path)?;
    public_key_digest(&key.to_public_key())
}

/// Encode a serializable structure for encryption: compact JSON (no
/// meaningless separator bytes), then base64.
pub fn encode_data<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)?;
    Ok(BASE64.encode(json.as_bytes()))
}

/// Inverse of [`encode_data`].
pub fn decode_data<T: DeserializeOwned>(encoded: &str) -> Result<T> {
    let json = BASE64
        .decode(encoded.trim())
        .map_err(|e| Error::Crypto(format!("base64 decode failed: {e}")))?;
    Ok(serde_json::from_slice(&json)?)
}

/// A hybrid-encrypted record: the Fernet ciphertext plus the RSA-OAEP
/// encrypted Fernet key. Opaque to the tally server relaying it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EncryptedPayload {
    pub pk_encrypted_secret_key: String,
    pub sym_encrypted_data: String,
}

/// Hybrid-encrypt a structure to `pub_key`.
pub fn encrypt<T: Serialize>(pub_key: &RsaPublicKey, value: &T) -> Result<EncryptedPayload> {
    let encoded = encode_data(value)?;
    let secret_key = Zeroizing::new(Fernet::generate_key());
    let fernet = Fernet::new(&secret_key)
        .ok_or_else(|| Error::Crypto("generated Fernet key was rejected".into()))?;
    let sym_encrypted_data = fernet.encrypt(encoded.as_bytes());
    let pk_ciphertext = pub_key.encrypt(&mut OsRng, Oaep::new::<Sha256>(), secret_key.as_bytes())?;
    Ok(EncryptedPayload {
        pk_encrypted_secret_key: BASE64.encode(pk_ciphertext),
        sym_encrypted_data,
    })
}

/// Hybrid-decrypt a record produced by [`encrypt`].
pub fn decrypt<T: DeserializeOwned>(
    priv_key: &RsaPrivateKey,
    payload: &EncryptedPayload,
) -> Result<T> {
    let pk_ciphertext = BASE64
        .decode(&payload.pk_encrypted_secret_key)
        .map_err(|e| Error::Crypto(format!("base64 decode of key ciphertext failed: {e}")))?;
    let secret_key = Zeroizing::new(priv_key.decrypt(Oaep::new::<Sha256>(), &pk_ciphertext)?);
    let secret_key_str = std::str::from_utf8(&secret_key)
        .map_err(|_| Error::Crypto("decrypted symmetric key is not UTF-8".into()))?;
    let fernet = Fernet::new(secret_key_str)
        .ok_or_else(|| Error::Crypto("decrypted symmetric key was rejected".into()))?;
    let plaintext = Zeroizing::new(
        fernet
            .decrypt(&payload.sym_encrypted_data)
            .map_err(|_| Error::Crypto("symmetric decryption failed".into()))?,
    );
    let encoded = std::str::from_utf8(&plaintext)
        .map_err(|_| Error::Crypto("decrypted payload is not UTF-8".into()))?;
    decode_data(encoded)
}

/// Load the shared secret used to authenticate TS-client channels, creating
/// it with fresh CSPRNG bytes if the file does not exist.
pub fn load_or_create_secret(path: &Path) -> Result<String> {
    if path.exists() {
        let secret = std::fs::read_to_string(path)?;
        let secret = secret.trim().to_string();
        if secret.is_empty() {
            return Err(Error::Crypto(format!(
                "secret handshake file {} is empty",
                path.display()
            )));
        }
        return Ok(secret);
    }
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    let secret = hex::encode(bytes);
    std::fs::write(path, &secret)?;
    Ok(secret)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn test_keypair() -> RsaPrivateKey {
        // small keys keep the test fast; production uses RSA_KEY_BITS
        RsaPrivateKey::new(&mut OsRng, 1024).expect("keygen")
    }

    #[test]
    fn encode_decode_round_trip() {
        let value = json!({"a": [1, 2, 3], "b": {"c": "d"}});
        let encoded = encode_data(&value).expect("encode");
        let decoded: serde_json::Value = decode_data(&encoded).expect("decode");
        assert_eq!(decoded, value);
    }

    #[test]
    fn encode_is_compact() {
        let value = json!({"a": 1, "b": 2});
        let encoded = encode_data(&value).expect("encode");
        let json = String::from_utf8(BASE64.decode(&encoded).expect("base64")).expect("utf8");
        assert!(!json.contains(' '));
    }

    #[test]
    fn hybrid_round_trip() {
        let priv_key = test_keypair();
        let pub_key = priv_key.to_public_key();
        let value = json!({"secret": {"bins": [[0.0, 512.0, 12345]]}});
        let payload = encrypt(&pub_key, &value).expect("encrypt");
        let decrypted: serde_json::Value = decrypt(&priv_key, &payload).expect("decrypt");
        assert_eq!(decrypted, value);
    }

    #[test]
    fn decrypt_with_wrong_key_fails() {
        let priv_key = test_keypair();
        let other_key = test_keypair();
        let payload = encrypt(&priv_key.to_public_key(), &json!({"x": 1})).expect("encrypt");
        let result: Result<serde_json::Value> = decrypt(&other_key, &payload);
        assert!(result.is_err());
    }

    #[test]
    fn tampered_ciphertext_fails() {
        let priv_key = test_keypair();
        let mut payload = encrypt(&priv_key.to_public_key(), &json!({"x": 1})).expect("encrypt");
        let mut tampered = payload.sym_encrypted_data.clone().into_bytes();
        let last = tampered.len() - 5;
        tampered[last] = if tampered[last] == b'A' { b'B' } else { b'A' };
        payload.sym_encrypted_data = String::from_utf8(tampered).expect("ascii");
        let result: Result<serde_json::Value> = decrypt(&priv_key, &payload);
        assert!(result.is_err());
    }

    #[test]
    fn digests_identify_keys() {
        let a = test_keypair().to_public_key();
        let b = test_keypair().to_public_key();
        let da = public_key_digest(&a).expect("digest");
        let db = public_key_digest(&b).expect("digest");
        assert_eq!(da.len(), 64);
        assert_ne!(da, db);
        assert_eq!(da, public_key_digest(&a).expect("digest"));
    }

    #[test]
    fn pem_round_trip() {
        let key = test_keypair().to_public_key();
        let pem = public_key_pem(&key).expect("pem");
        let back = load_public_key_pem(&pem).expect("parse");
        assert_eq!(key, back);
    }

    #[test]
    fn secret_file_is_created_and_stable() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("secret_handshake");
        let first = load_or_create_secret(&path).expect("create");
        let second = load_or_create_secret(&path).expect("load");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);
    }
}
