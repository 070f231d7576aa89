/**
 * CREDENTIAL ENCRYPTION - SSH passwords at rest
 *
 * ROLE : seal/open node secrets stored in the node table.
 * FORMAT : base64( nonce[12] || ciphertext || tag[16] ), AES-256-GCM,
 * key = SHA-256 of the configured key material.
 */

use base64::{engine::general_purpose::STANDARD, Engine as _};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, NONCE_LEN};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::{Digest, Sha256};

#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    #[error("no encryption key configured")]
    InvalidKey,
    #[error("malformed sealed value")]
    Malformed,
    #[error("decryption failed")]
    Decrypt,
}

pub struct SecretBox {
    key: LessSafeKey,
    rng: SystemRandom,
}

impl std::fmt::Debug for SecretBox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SecretBox(..)")
    }
}

impl SecretBox {
    pub fn from_key_material(material: &str) -> Result<Self, CryptoError> {
        if material.is_empty() {
            return Err(CryptoError::InvalidKey);
        }
        let digest = Sha256::digest(material.as_bytes());
        let unbound = UnboundKey::new(&AES_256_GCM, &digest).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self {
            key: LessSafeKey::new(unbound),
            rng: SystemRandom::new(),
        })
    }

    /// Read the key material from the named env var
    pub fn from_env(var: &str) -> Result<Self, CryptoError> {
        let material = std::env::var(var).map_err(|_| CryptoError::InvalidKey)?;
        Self::from_key_material(material.trim())
    }

    pub fn seal(&self, plaintext: &str) -> Result<String, CryptoError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        self.rng.fill(&mut nonce_bytes).map_err(|_| CryptoError::InvalidKey)?;

        let mut in_out = plaintext.as_bytes().to_vec();
        self.key
            .seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce_bytes), Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Decrypt)?;

        let mut sealed = nonce_bytes.to_vec();
        sealed.extend_from_slice(&in_out);
        Ok(STANDARD.encode(sealed))
    }

    pub fn open(&self, sealed: &str) -> Result<String, CryptoError> {
        let raw = STANDARD.decode(sealed.trim()).map_err(|_| CryptoError::Malformed)?;
        if raw.len() < NONCE_LEN + AES_256_GCM.tag_len() {
            return Err(CryptoError::Malformed);
        }

        let (nonce_bytes, ciphertext) = raw.split_at(NONCE_LEN);
        let nonce = Nonce::try_assume_unique_for_key(nonce_bytes).map_err(|_| CryptoError::Malformed)?;
        let mut in_out = ciphertext.to_vec();
        let plain = self
            .key
            .open_in_place(nonce, Aad::empty(), &mut in_out)
            .map_err(|_| CryptoError::Decrypt)?;

        String::from_utf8(plain.to_vec()).map_err(|_| CryptoError::Malformed)
    }
}
