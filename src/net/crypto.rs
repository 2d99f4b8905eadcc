//! Session encryption and the key-exchange handshake.
//!
//! The handshake runs before any application frame: the client ships an
//! ephemeral RSA public key (obfuscated with a fixed transform so the DER
//! blob is not trivially sniffable), the broker answers with a fresh random
//! AES-256-GCM session key wrapped under that public key, and the
//! connect-acknowledgment repeats the wrapped key so both sides can confirm
//! they converged on one secret. Any decrypt failure aborts the connection
//! before application data is accepted.
//!
//! Cipher state is established once per connection and read-only afterward.

use rand::rngs::OsRng;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPublicKey, EncodeRsaPublicKey};
use rsa::{Pkcs1v15Encrypt, RsaPrivateKey, RsaPublicKey};
use thiserror::Error;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};

/// AES-GCM nonce length prepended to every sealed payload.
pub const NONCE_LEN: usize = 12;

/// Session key length (AES-256).
pub const SESSION_KEY_LEN: usize = 32;

/// RSA modulus size for the ephemeral handshake keypair.
pub const HANDSHAKE_KEY_BITS: usize = 2048;

// Fixed pad for the key-exchange obfuscation transform. XOR is involutory,
// so the same function applies and removes it.
const OBFUSCATION_PAD: [u8; 16] = [
    0x9d, 0x3a, 0x61, 0xe7, 0x48, 0xc5, 0x2f, 0xb0, 0x76, 0x1b, 0xd4, 0x8e, 0x53, 0xaa, 0x07, 0xc2,
];

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("handshake public key is not valid DER: {0}")]
    KeyParse(String),
    #[error("failed to wrap session key: {0}")]
    Wrap(String),
    #[error("failed to unwrap session key: {0}")]
    Unwrap(String),
    #[error("unwrapped session key has wrong length {0}")]
    KeyLength(usize),
    #[error("session key confirmation mismatch")]
    Confirmation,
    #[error("payload decryption failed")]
    Decrypt,
}

/// Apply (or remove) the fixed obfuscation transform.
pub fn obfuscate(data: &mut [u8]) {
    for (index, byte) in data.iter_mut().enumerate() {
        *byte ^= OBFUSCATION_PAD[index % OBFUSCATION_PAD.len()];
    }
}

/// Symmetric cipher for one connection's payloads.
///
/// Sealed form is `nonce || ciphertext+tag` with a fresh random nonce per
/// frame. The key never changes after construction.
pub struct SessionCipher {
    cipher: Aes256Gcm,
    key: [u8; SESSION_KEY_LEN],
}

impl SessionCipher {
    pub fn new(key: [u8; SESSION_KEY_LEN]) -> Self {
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key)),
            key,
        }
    }

    /// Generate a cipher around a fresh random key.
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self::new(key)
    }

    pub fn key(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.key
    }

    pub fn encrypt(&self, plain: &[u8]) -> Vec<u8> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), plain)
            .expect("AES-GCM encryption is infallible for in-memory buffers");
        let mut out = Vec::with_capacity(NONCE_LEN + sealed.len());
        out.extend_from_slice(&nonce);
        out.extend(sealed);
        out
    }

    pub fn decrypt(&self, sealed: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if sealed.len() < NONCE_LEN {
            return Err(HandshakeError::Decrypt);
        }
        let (nonce, body) = sealed.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| HandshakeError::Decrypt)
    }
}

impl std::fmt::Debug for SessionCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCipher").finish_non_exhaustive()
    }
}

/// Client half of the key exchange.
pub struct ClientKeyExchange {
    private: RsaPrivateKey,
}

impl ClientKeyExchange {
    /// Generate the ephemeral keypair and produce the obfuscated hello
    /// payload carrying the public key.
    pub fn begin() -> Result<(Self, Vec<u8>), HandshakeError> {
        Self::begin_with_bits(HANDSHAKE_KEY_BITS)
    }

    pub(crate) fn begin_with_bits(bits: usize) -> Result<(Self, Vec<u8>), HandshakeError> {
        let private = RsaPrivateKey::new(&mut OsRng, bits)
            .map_err(|err| HandshakeError::Wrap(err.to_string()))?;
        let der = RsaPublicKey::from(&private)
            .to_pkcs1_der()
            .map_err(|err| HandshakeError::KeyParse(err.to_string()))?;
        let mut hello = der.as_bytes().to_vec();
        obfuscate(&mut hello);
        Ok((Self { private }, hello))
    }

    /// Recover the session key from the broker's obfuscated reply.
    pub fn finish(&self, reply: &[u8]) -> Result<SessionCipher, HandshakeError> {
        let mut wrapped = reply.to_vec();
        obfuscate(&mut wrapped);
        let key = self.unwrap_key(&wrapped)?;
        Ok(SessionCipher::new(key))
    }

    /// Unwrap the RSA-wrapped key repeated in the connect-acknowledgment and
    /// check it matches the established session key.
    pub fn confirm(
        &self,
        cipher: &SessionCipher,
        wrapped: &[u8],
    ) -> Result<(), HandshakeError> {
        let key = self.unwrap_key(wrapped)?;
        if &key != cipher.key() {
            return Err(HandshakeError::Confirmation);
        }
        Ok(())
    }

    fn unwrap_key(&self, wrapped: &[u8]) -> Result<[u8; SESSION_KEY_LEN], HandshakeError> {
        let plain = self
            .private
            .decrypt(Pkcs1v15Encrypt, wrapped)
            .map_err(|err| HandshakeError::Unwrap(err.to_string()))?;
        <[u8; SESSION_KEY_LEN]>::try_from(plain.as_slice())
            .map_err(|_| HandshakeError::KeyLength(plain.len()))
    }
}

/// Broker half of the key exchange, retained on the session until the
/// connect-acknowledgment has been sent.
pub struct BrokerKeyExchange {
    client_public: RsaPublicKey,
    cipher: SessionCipher,
}

impl BrokerKeyExchange {
    /// Accept the client hello: deobfuscate, parse the public key, generate a
    /// fresh session key and produce the obfuscated wrapped-key reply.
    pub fn accept(hello: &[u8]) -> Result<(Self, Vec<u8>), HandshakeError> {
        let mut der = hello.to_vec();
        obfuscate(&mut der);
        let client_public = RsaPublicKey::from_pkcs1_der(&der)
            .map_err(|err| HandshakeError::KeyParse(err.to_string()))?;
        let cipher = SessionCipher::generate();
        let mut reply = wrap_key(&client_public, cipher.key())?;
        obfuscate(&mut reply);
        Ok((
            Self {
                client_public,
                cipher,
            },
            reply,
        ))
    }

    /// Wrap the session key again for the connect-acknowledgment payload.
    pub fn wrapped_session_key(&self) -> Result<Vec<u8>, HandshakeError> {
        wrap_key(&self.client_public, self.cipher.key())
    }

    pub fn into_cipher(self) -> SessionCipher {
        self.cipher
    }

    pub fn cipher(&self) -> &SessionCipher {
        &self.cipher
    }
}

fn wrap_key(
    public: &RsaPublicKey,
    key: &[u8; SESSION_KEY_LEN],
) -> Result<Vec<u8>, HandshakeError> {
    public
        .encrypt(&mut OsRng, Pkcs1v15Encrypt, key)
        .map_err(|err| HandshakeError::Wrap(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    // Smaller modulus keeps keygen fast in tests; the wire shapes are
    // identical.
    const TEST_BITS: usize = 1024;

    #[test]
    fn obfuscation_is_involutory() {
        let mut data = b"some key material".to_vec();
        let original = data.clone();
        obfuscate(&mut data);
        assert_ne!(data, original);
        obfuscate(&mut data);
        assert_eq!(data, original);
    }

    #[test]
    fn cipher_round_trips() {
        let cipher = SessionCipher::generate();
        let sealed = cipher.encrypt(b"payload bytes");
        assert_ne!(sealed, b"payload bytes");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), b"payload bytes");
    }

    #[test]
    fn cipher_rejects_tampering() {
        let cipher = SessionCipher::generate();
        let mut sealed = cipher.encrypt(b"payload");
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(
            cipher.decrypt(&sealed),
            Err(HandshakeError::Decrypt)
        ));
    }

    #[test]
    fn handshake_converges_on_identical_keys() {
        let (client, hello) = ClientKeyExchange::begin_with_bits(TEST_BITS).unwrap();
        let (broker, reply) = BrokerKeyExchange::accept(&hello).unwrap();
        let client_cipher = client.finish(&reply).unwrap();
        assert_eq!(client_cipher.key(), broker.cipher().key());

        // Both directions decrypt each other's frames.
        let broker_cipher = broker.into_cipher();
        let sealed = client_cipher.encrypt(b"up");
        assert_eq!(broker_cipher.decrypt(&sealed).unwrap(), b"up");
        let sealed = broker_cipher.encrypt(b"down");
        assert_eq!(client_cipher.decrypt(&sealed).unwrap(), b"down");
    }

    #[test]
    fn connack_confirmation_checks_key_equality() {
        let (client, hello) = ClientKeyExchange::begin_with_bits(TEST_BITS).unwrap();
        let (broker, reply) = BrokerKeyExchange::accept(&hello).unwrap();
        let cipher = client.finish(&reply).unwrap();
        let wrapped = broker.wrapped_session_key().unwrap();
        client.confirm(&cipher, &wrapped).unwrap();

        let other = SessionCipher::generate();
        assert!(client.confirm(&other, &wrapped).is_err());
    }

    #[test]
    fn corrupted_hello_aborts() {
        let (_, mut hello) = ClientKeyExchange::begin_with_bits(TEST_BITS).unwrap();
        hello[0] ^= 0xFF;
        assert!(BrokerKeyExchange::accept(&hello).is_err());
    }

    #[test]
    fn corrupted_reply_aborts() {
        let (client, hello) = ClientKeyExchange::begin_with_bits(TEST_BITS).unwrap();
        let (_, mut reply) = BrokerKeyExchange::accept(&hello).unwrap();
        reply[4] ^= 0xFF;
        assert!(client.finish(&reply).is_err());
    }
}
