//! Authentication service
//!
//! Implements the salted-RSA login handshake: the dispatcher hands out the
//! node's public key and a per-session salt, the client sends
//! `RSA(salt ‖ password)`, and this service decrypts, strips the salt and
//! verifies the password against the store.
//!
//! The private key is loaded (or generated) once at startup and cached for
//! the life of the process.

use std::path::Path;

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use password_hash::{rand_core::OsRng, SaltString};
use rsa::pkcs1::DecodeRsaPrivateKey;
use rsa::pkcs8::{DecodePrivateKey, EncodePrivateKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use tracing::info;

use cpx_agent_core::types::Agent;

use crate::database::Store;
use crate::error::{EngineError, Result};

/// RSA public key parts handed to clients, hex encoded.
#[derive(Debug, Clone, serde::Serialize)]
pub struct PubKey {
    #[serde(rename = "E")]
    pub e: String,
    #[serde(rename = "N")]
    pub n: String,
}

pub struct AuthService {
    key: RsaPrivateKey,
    argon2: Argon2<'static>,
    store: Store,
}

impl AuthService {
    /// Load the private key from `key_path`, generating and persisting a
    /// fresh one when the file does not exist yet.
    pub fn new(store: Store, key_path: &Path) -> Result<Self> {
        let key = if key_path.exists() {
            let pem = std::fs::read_to_string(key_path)
                .map_err(|e| EngineError::Config(format!("cannot read {}: {e}", key_path.display())))?;
            RsaPrivateKey::from_pkcs8_pem(&pem)
                .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
                .map_err(|e| EngineError::Config(format!("invalid RSA key {}: {e}", key_path.display())))?
        } else {
            info!("no RSA key at {}, generating one", key_path.display());
            let mut rng = rand::thread_rng();
            let key = RsaPrivateKey::new(&mut rng, 2048)
                .map_err(|e| EngineError::Config(format!("RSA key generation failed: {e}")))?;
            let pem = key
                .to_pkcs8_pem(LineEnding::LF)
                .map_err(|e| EngineError::Config(format!("RSA key encoding failed: {e}")))?;
            std::fs::write(key_path, pem.as_bytes())
                .map_err(|e| EngineError::Config(format!("cannot write {}: {e}", key_path.display())))?;
            key
        };

        Ok(Self {
            key,
            argon2: Argon2::default(),
            store,
        })
    }

    /// Public key parts for the `get_salt` reply.
    pub fn public_key(&self) -> PubKey {
        let public = RsaPublicKey::from(&self.key);
        PubKey {
            e: hex::encode(public.e().to_bytes_be()),
            n: hex::encode(public.n().to_bytes_be()),
        }
    }

    /// Decrypt a hex-encoded PKCS#1 v1.5 ciphertext into a UTF-8 string.
    pub fn decrypt(&self, cipher_hex: &str) -> Result<String> {
        let cipher = hex::decode(cipher_hex.trim())
            .map_err(|e| EngineError::Decrypt(format!("bad hex: {e}")))?;
        let plain = self
            .key
            .decrypt(Pkcs1v15Encrypt, &cipher)
            .map_err(|e| EngineError::Decrypt(e.to_string()))?;
        String::from_utf8(plain).map_err(|e| EngineError::Decrypt(e.to_string()))
    }

    /// Run the full login handshake: decrypt, check the salt prefix,
    /// verify the password against the store.
    pub async fn login(&self, username: &str, cipher_hex: &str, salt: &str) -> Result<Agent> {
        let plain = self.decrypt(cipher_hex)?;

        let password = plain.strip_prefix(salt).ok_or(EngineError::NoSalt)?;

        self.authenticate(username, password).await
    }

    /// Verify a plain password against the stored hash.
    pub async fn authenticate(&self, username: &str, password: &str) -> Result<Agent> {
        let agent = self
            .store
            .get_agent(username)
            .await
            .map_err(EngineError::Internal)?
            .ok_or(EngineError::InvalidCredentials)?;

        let parsed = PasswordHash::new(&agent.password_hash)
            .map_err(|_| EngineError::InvalidCredentials)?;
        self.argon2
            .verify_password(password.as_bytes(), &parsed)
            .map_err(|_| EngineError::InvalidCredentials)?;

        Ok(agent)
    }

    /// Hash a password for storage.
    pub fn hash_password(&self, password: &str) -> Result<String> {
        let salt = SaltString::generate(&mut OsRng);
        Ok(self
            .argon2
            .hash_password(password.as_bytes(), &salt)
            .map_err(|e| EngineError::Config(format!("failed to hash password: {e}")))?
            .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cpx_agent_core::types::{AgentId, RingPath, SecurityLevel};

    const TEST_KEY: &str = include_str!("../tests_support/test_key.pem");

    async fn test_service() -> AuthService {
        let dir = std::env::temp_dir().join(format!("cpx-auth-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let key_path = dir.join("key");
        std::fs::write(&key_path, TEST_KEY).unwrap();
        let store = Store::new_in_memory().await.unwrap();
        AuthService::new(store, &key_path).unwrap()
    }

    fn encrypt_for(service: &AuthService, plain: &str) -> String {
        let pubkey = service.public_key();
        let n = rsa::BigUint::from_bytes_be(&hex::decode(pubkey.n).unwrap());
        let e = rsa::BigUint::from_bytes_be(&hex::decode(pubkey.e).unwrap());
        let key = RsaPublicKey::new(n, e).unwrap();
        let mut rng = rand::thread_rng();
        hex::encode(key.encrypt(&mut rng, Pkcs1v15Encrypt, plain.as_bytes()).unwrap())
    }

    #[tokio::test]
    async fn decrypt_round_trip() {
        let service = test_service().await;
        let cipher = encrypt_for(&service, "12345678secret");
        assert_eq!(service.decrypt(&cipher).unwrap(), "12345678secret");
    }

    #[tokio::test]
    async fn login_rejects_wrong_salt() {
        let service = test_service().await;
        let cipher = encrypt_for(&service, "99999999secret");
        let err = service.login("alice", &cipher, "12345678").await.unwrap_err();
        assert!(matches!(err, EngineError::NoSalt));
    }

    #[tokio::test]
    async fn login_rejects_garbage_ciphertext() {
        let service = test_service().await;
        let err = service.login("alice", "zz-not-hex", "12345678").await.unwrap_err();
        assert!(matches!(err, EngineError::Decrypt(_)));
    }

    #[tokio::test]
    async fn login_verifies_password() {
        let service = test_service().await;
        let hash = service.hash_password("secret").unwrap();
        service
            .store
            .upsert_agent(&Agent {
                id: AgentId("alice".to_string()),
                login: "alice".to_string(),
                profile: "default".to_string(),
                skills: vec![],
                security: SecurityLevel::Agent,
                ring_path: RingPath::Inband,
                password_hash: hash,
            })
            .await
            .unwrap();

        let cipher = encrypt_for(&service, "12345678secret");
        let agent = service.login("alice", &cipher, "12345678").await.unwrap();
        assert_eq!(agent.login, "alice");

        let cipher = encrypt_for(&service, "12345678wrong");
        let err = service.login("alice", &cipher, "12345678").await.unwrap_err();
        assert!(matches!(err, EngineError::InvalidCredentials));
    }
}
