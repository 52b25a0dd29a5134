//! SCRAM-SHA-256 authentication implementation.
//!
//! Implements RFC 5802 (SCRAM) and RFC 7677 (SCRAM-SHA-256) for PostgreSQL,
//! without channel binding.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use hmac::{Hmac, Mac};
use rand::Rng;
use sha2::{Digest, Sha256};
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// SASL mechanism name announced by the server.
pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// SCRAM-SHA-256 client state machine.
pub struct ScramClient {
    username: String,
    password: String,
    client_nonce: String,
    /// Set once the server-first-message has been processed
    auth_message: Option<String>,
    salted_password: Option<[u8; 32]>,
}

impl ScramClient {
    /// Create a new SCRAM client with a random nonce.
    pub fn new(username: &str, password: &str) -> Self {
        // 18 random bytes, base64 encoded to 24 chars
        let nonce_bytes: [u8; 18] = rand::thread_rng().gen();
        Self::with_nonce(username, password, BASE64.encode(nonce_bytes))
    }

    fn with_nonce(username: &str, password: &str, client_nonce: String) -> Self {
        Self {
            username: username.to_string(),
            password: password.to_string(),
            client_nonce,
            auth_message: None,
            salted_password: None,
        }
    }

    fn client_first_bare(&self) -> String {
        format!("n={},r={}", sasl_name(&self.username), self.client_nonce)
    }

    /// Generate the initial client message (client-first-message).
    ///
    /// Format: `n,,n=<username>,r=<client-nonce>`
    pub fn client_first_message(&self) -> Vec<u8> {
        // GS2 header "n,,": no channel binding, no authzid
        format!("n,,{}", self.client_first_bare()).into_bytes()
    }

    /// Process the server's first message and generate the client's final message.
    ///
    /// Server message format: `r=<nonce>,s=<salt>,i=<iterations>`
    pub fn process_server_first(&mut self, server_msg: &[u8]) -> Result<Vec<u8>, ScramError> {
        let server_first =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            if let Some(value) = part.strip_prefix("r=") {
                nonce = Some(value);
            } else if let Some(value) = part.strip_prefix("s=") {
                salt = Some(BASE64.decode(value).map_err(|_| ScramError::InvalidSalt)?);
            } else if let Some(value) = part.strip_prefix("i=") {
                iterations = Some(
                    value
                        .parse::<u32>()
                        .map_err(|_| ScramError::InvalidIterations)?,
                );
            }
        }

        let combined_nonce = nonce.ok_or(ScramError::MissingNonce)?;
        let salt = salt.ok_or(ScramError::MissingSalt)?;
        let iterations = iterations.ok_or(ScramError::MissingIterations)?;

        // The server must extend our nonce, not replace it
        if !combined_nonce.starts_with(&self.client_nonce) || combined_nonce == self.client_nonce {
            return Err(ScramError::NonceVerificationFailed);
        }

        let salted_password = hi(&self.password, &salt, iterations)?;
        let client_key = hmac_sha256(&salted_password, b"Client Key")?;
        let stored_key = sha256(&client_key);

        let client_final_without_proof = format!("c=biws,r={}", combined_nonce);
        let auth_message = format!(
            "{},{},{}",
            self.client_first_bare(),
            server_first,
            client_final_without_proof
        );

        let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes())?;
        let client_proof = xor_bytes(&client_key, &client_signature);

        self.auth_message = Some(auth_message);
        self.salted_password = Some(salted_password);

        Ok(format!(
            "{},p={}",
            client_final_without_proof,
            BASE64.encode(client_proof)
        )
        .into_bytes())
    }

    /// Verify the server's final message (server signature).
    ///
    /// Server message format: `v=<verifier>` or `e=<error>`
    pub fn verify_server_final(&self, server_msg: &[u8]) -> Result<(), ScramError> {
        let server_str =
            std::str::from_utf8(server_msg).map_err(|_| ScramError::InvalidServerMessage)?;

        if let Some(reason) = server_str.strip_prefix("e=") {
            return Err(ScramError::ServerError(reason.to_string()));
        }

        let verifier_b64 = server_str
            .strip_prefix("v=")
            .ok_or(ScramError::InvalidServerSignature)?;
        let server_signature = BASE64
            .decode(verifier_b64.trim_end())
            .map_err(|_| ScramError::InvalidServerSignature)?;

        let salted_password = self.salted_password.ok_or(ScramError::InvalidState)?;
        let auth_message = self.auth_message.as_ref().ok_or(ScramError::InvalidState)?;

        let server_key = hmac_sha256(&salted_password, b"Server Key")?;
        let expected_signature = hmac_sha256(&server_key, auth_message.as_bytes())?;

        if server_signature != expected_signature {
            return Err(ScramError::ServerSignatureVerificationFailed);
        }

        Ok(())
    }
}

/// SCRAM authentication errors.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScramError {
    #[error("Invalid server message")]
    InvalidServerMessage,
    #[error("Invalid salt encoding")]
    InvalidSalt,
    #[error("Invalid iteration count")]
    InvalidIterations,
    #[error("Missing nonce in server message")]
    MissingNonce,
    #[error("Missing salt in server message")]
    MissingSalt,
    #[error("Missing iterations in server message")]
    MissingIterations,
    #[error("Server nonce verification failed")]
    NonceVerificationFailed,
    #[error("Invalid server signature")]
    InvalidServerSignature,
    #[error("Server signature verification failed")]
    ServerSignatureVerificationFailed,
    #[error("Server rejected authentication: {0}")]
    ServerError(String),
    #[error("Invalid SCRAM state")]
    InvalidState,
    #[error("Key derivation failed")]
    KeyDerivation,
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Hi() function - PBKDF2 with HMAC-SHA-256
fn hi(password: &str, salt: &[u8], iterations: u32) -> Result<[u8; 32], ScramError> {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2::<HmacSha256>(password.as_bytes(), salt, iterations, &mut output)
        .map_err(|_| ScramError::KeyDerivation)?;
    Ok(output)
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<[u8; 32], ScramError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| ScramError::KeyDerivation)?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().into())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    Sha256::digest(data).into()
}

fn xor_bytes(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut result = [0u8; 32];
    for (out, (x, y)) in result.iter_mut().zip(a.iter().zip(b)) {
        *out = x ^ y;
    }
    result
}

/// Escape a username for the `n=` attribute (RFC 5802 saslname).
///
/// The server ignores this name in favour of the startup user, so no
/// SASLprep normalization is applied.
fn sasl_name(s: &str) -> String {
    s.replace('=', "=3D").replace(',', "=2C")
}
