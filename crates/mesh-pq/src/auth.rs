//! Password authentication: cleartext, MD5 and SCRAM-SHA-256.
//!
//! SCRAM is split into explicit steps ([`ScramState`]) so the connection
//! state machine can resume it across non-blocking reads.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use hmac::{Hmac, Mac};
use md5::{Digest, Md5};
use pbkdf2::pbkdf2_hmac;
use rand::Rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Compute MD5 password hash.
/// Formula: "md5" + hex(md5(hex(md5(password + username)) + salt_4_bytes))
pub fn compute_md5_password(user: &str, password: &str, salt: &[u8]) -> String {
    // Step 1: md5(password + username)
    let inner = md5_hex(&[password.as_bytes(), user.as_bytes()]);

    // Step 2: md5(inner_hex + salt)
    let outer = md5_hex(&[inner.as_bytes(), salt]);

    format!("md5{}", outer)
}

/// Pre-encrypt a password the way `ALTER ROLE ... PASSWORD` accepts it:
/// `"md5"` followed by the hex digest of password‖user.
pub fn encrypt_password(password: &str, user: &str) -> String {
    format!("md5{}", md5_hex(&[password.as_bytes(), user.as_bytes()]))
}

fn md5_hex(parts: &[&[u8]]) -> String {
    let mut hasher = Md5::new();
    for part in parts {
        hasher.update(part);
    }
    format!("{:x}", hasher.finalize())
}

/// Compute HMAC-SHA-256.
fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// Compute SHA-256 hash.
fn sha256(data: &[u8]) -> Vec<u8> {
    use sha2::Digest as _;
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().to_vec()
}

// ── SCRAM-SHA-256 ──────────────────────────────────────────────────────

/// Client side of one SCRAM-SHA-256 exchange.
#[derive(Debug)]
pub enum ScramState {
    /// client-first sent, waiting for AuthenticationSASLContinue.
    SentFirst { nonce: String },
    /// client-final sent, waiting for AuthenticationSASLFinal.
    SentFinal { server_signature: Vec<u8> },
}

impl ScramState {
    /// Generate the client-first-message. Returns the state to keep and the
    /// message to send in SASLInitialResponse.
    ///
    /// Uses empty `n=` (no username in SASL) because PostgreSQL already knows
    /// the username from the StartupMessage. This matches libpq behavior and
    /// keeps the client-first-bare used in the AuthMessage consistent with
    /// what the server sees.
    pub fn start() -> (ScramState, String) {
        let nonce: String = rand::rng()
            .sample_iter(&rand::distr::Alphanumeric)
            .take(24)
            .map(char::from)
            .collect();
        let message = format!("n,,n=,r={}", nonce);
        (ScramState::SentFirst { nonce }, message)
    }

    /// Handle AuthenticationSASLContinue and produce the client-final-message.
    pub fn continue_with(&mut self, password: &str, server_first: &str) -> Result<String, String> {
        let nonce = match self {
            ScramState::SentFirst { nonce } => nonce.clone(),
            ScramState::SentFinal { .. } => {
                return Err("unexpected SCRAM continue message".to_string())
            }
        };
        let (client_final, server_signature) = scram_client_final(password, &nonce, server_first)?;
        *self = ScramState::SentFinal { server_signature };
        Ok(client_final)
    }

    /// Verify AuthenticationSASLFinal against the expected server signature.
    pub fn finish(&self, server_final: &str) -> Result<(), String> {
        let expected = match self {
            ScramState::SentFinal { server_signature } => server_signature,
            ScramState::SentFirst { .. } => {
                return Err("unexpected SCRAM final message".to_string())
            }
        };
        if let Some(err) = server_final.strip_prefix("e=") {
            return Err(format!("SCRAM authentication failed: {}", err));
        }
        let verifier = server_final
            .strip_prefix("v=")
            .ok_or_else(|| "malformed SCRAM final message".to_string())?;
        let signature = BASE64
            .decode(verifier.trim_end())
            .map_err(|_| "malformed SCRAM server signature".to_string())?;
        if &signature != expected {
            return Err("incorrect server signature".to_string());
        }
        Ok(())
    }
}

/// Process SCRAM-SHA-256 client-final-message.
/// Returns (client_final_message, expected_server_signature).
fn scram_client_final(
    password: &str,
    client_nonce: &str,
    server_first: &str,
) -> Result<(String, Vec<u8>), String> {
    // Parse server-first-message: r=<nonce>,s=<salt>,i=<iterations>
    let mut server_nonce = "";
    let mut salt_b64 = "";
    let mut iterations = 0u32;
    for part in server_first.split(',') {
        if let Some(v) = part.strip_prefix("r=") {
            server_nonce = v;
        }
        if let Some(v) = part.strip_prefix("s=") {
            salt_b64 = v;
        }
        if let Some(v) = part.strip_prefix("i=") {
            iterations = v.parse().map_err(|_| "bad iteration count".to_string())?;
        }
    }

    // Verify server nonce starts with client nonce
    if !server_nonce.starts_with(client_nonce) || server_nonce.len() == client_nonce.len() {
        return Err("server nonce mismatch".to_string());
    }
    if iterations == 0 {
        return Err("bad iteration count".to_string());
    }

    let salt = BASE64
        .decode(salt_b64)
        .map_err(|_| "bad salt encoding".to_string())?;

    // SaltedPassword = PBKDF2(password, salt, iterations, SHA-256)
    let mut salted_password = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut salted_password);

    // ClientKey = HMAC(SaltedPassword, "Client Key")
    let client_key = hmac_sha256(&salted_password, b"Client Key");
    // StoredKey = SHA-256(ClientKey)
    let stored_key = sha256(&client_key);

    // "biws" = base64("n,,") for no channel binding
    let client_final_without_proof = format!("c=biws,r={}", server_nonce);
    let client_first_bare = format!("n=,r={}", client_nonce);
    let auth_message = format!(
        "{},{},{}",
        client_first_bare, server_first, client_final_without_proof
    );

    // ClientSignature = HMAC(StoredKey, AuthMessage)
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    // ClientProof = ClientKey XOR ClientSignature
    let proof: Vec<u8> = client_key
        .iter()
        .zip(client_signature.iter())
        .map(|(a, b)| a ^ b)
        .collect();

    // ServerSignature = HMAC(HMAC(SaltedPassword, "Server Key"), AuthMessage)
    let server_key = hmac_sha256(&salted_password, b"Server Key");
    let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());

    let client_final = format!("{},p={}", client_final_without_proof, BASE64.encode(&proof));
    Ok((client_final, server_signature))
}

/// Server half of SCRAM, used by the in-process fake backend to check
/// the client's proof and produce a matching server-final message.
#[cfg(any(test, feature = "test-utils"))]
pub(crate) fn scram_server_final(
    password: &str,
    salt: &[u8],
    iterations: u32,
    client_first_bare: &str,
    server_first: &str,
    client_final: &str,
) -> Result<String, String> {
    let (without_proof, proof_b64) = client_final
        .rsplit_once(",p=")
        .ok_or_else(|| "missing proof".to_string())?;
    let proof = BASE64.decode(proof_b64).map_err(|_| "bad proof".to_string())?;

    let mut salted_password = [0u8; 32];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut salted_password);
    let client_key = hmac_sha256(&salted_password, b"Client Key");
    let stored_key = sha256(&client_key);
    let auth_message = format!("{},{},{}", client_first_bare, server_first, without_proof);
    let client_signature = hmac_sha256(&stored_key, auth_message.as_bytes());
    let recovered: Vec<u8> = proof
        .iter()
        .zip(client_signature.iter())
        .map(|(a, b)| a ^ b)
        .collect();
    if sha256(&recovered) != stored_key {
        return Err("password authentication failed".to_string());
    }
    let server_key = hmac_sha256(&salted_password, b"Server Key");
    let server_signature = hmac_sha256(&server_key, auth_message.as_bytes());
    Ok(format!("v={}", BASE64.encode(server_signature)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_md5_password() {
        // md5(md5("secret" + "alice") hex + salt)
        let hashed = compute_md5_password("alice", "secret", &[1, 2, 3, 4]);
        assert!(hashed.starts_with("md5"));
        assert_eq!(hashed.len(), 35);
        assert_eq!(hashed, compute_md5_password("alice", "secret", &[1, 2, 3, 4]));
        assert_ne!(hashed, compute_md5_password("alice", "secret", &[4, 3, 2, 1]));
    }

    #[test]
    fn test_encrypt_password_known_value() {
        // md5("foo" || "bar") = 3858f62230ac3c915f300c664312c63f
        assert_eq!(
            encrypt_password("foo", "bar"),
            "md53858f62230ac3c915f300c664312c63f"
        );
    }

    #[test]
    fn test_scram_exchange_against_server_half() {
        let (mut state, first) = ScramState::start();
        let client_first_bare = first.strip_prefix("n,,").unwrap().to_string();
        let nonce = client_first_bare.strip_prefix("n=,r=").unwrap();

        let salt = b"saltsalt";
        let server_first = format!("r={}SERVER,s={},i=4096", nonce, BASE64.encode(salt));
        let client_final = state.continue_with("pencil", &server_first).unwrap();
        let server_final = scram_server_final(
            "pencil",
            salt,
            4096,
            &client_first_bare,
            &server_first,
            &client_final,
        )
        .unwrap();
        state.finish(&server_final).unwrap();
    }

    #[test]
    fn test_scram_wrong_password_detected_by_server() {
        let (mut state, first) = ScramState::start();
        let client_first_bare = first.strip_prefix("n,,").unwrap().to_string();
        let nonce = client_first_bare.strip_prefix("n=,r=").unwrap();
        let server_first = format!("r={}X,s={},i=4096", nonce, BASE64.encode(b"salt"));
        let client_final = state.continue_with("wrong", &server_first).unwrap();
        assert!(scram_server_final(
            "right",
            b"salt",
            4096,
            &client_first_bare,
            &server_first,
            &client_final
        )
        .is_err());
    }

    #[test]
    fn test_scram_rejects_foreign_nonce() {
        let (mut state, _) = ScramState::start();
        let err = state
            .continue_with("pw", "r=somebodyelse,s=c2FsdA==,i=4096")
            .unwrap_err();
        assert_eq!(err, "server nonce mismatch");
    }

    #[test]
    fn test_scram_bad_server_signature() {
        let (mut state, first) = ScramState::start();
        let nonce = first.strip_prefix("n,,n=,r=").unwrap().to_string();
        let server_first = format!("r={}Z,s=c2FsdA==,i=4096", nonce);
        state.continue_with("pw", &server_first).unwrap();
        assert!(state.finish("v=AAAA").is_err());
        assert!(state.finish("e=invalid-proof").is_err());
    }
}
