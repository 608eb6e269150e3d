//! SCRAM-SHA-256(-PLUS) authentication engine.
//!
//! Implements the client side of RFC 5802 / RFC 7677, including
//! `tls-server-end-point` channel binding (RFC 5929).
use std::{borrow::Cow, fmt};

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha2::{Digest, Sha256};

type HmacSha256 = Hmac<Sha256>;

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";
const SCRAM_SHA_256_PLUS: &str = "SCRAM-SHA-256-PLUS";

/// length of the raw client nonce, before base64
const NONCE_LENGTH: usize = 18;

/// An error from the SCRAM exchange.
pub struct SaslError {
    reason: Cow<'static, str>,
}

impl SaslError {
    fn new(reason: impl Into<Cow<'static, str>>) -> Self {
        Self { reason: reason.into() }
    }
}

impl std::error::Error for SaslError { }

impl fmt::Display for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SASL authentication failed: {}", self.reason)
    }
}

impl fmt::Debug for SaslError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "\"{self}\"")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mechanism {
    Sha256,
    Sha256Plus,
}

impl Mechanism {
    pub(crate) fn as_str(&self) -> &'static str {
        match self {
            Self::Sha256 => SCRAM_SHA_256,
            Self::Sha256Plus => SCRAM_SHA_256_PLUS,
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Phase {
    InitialSent,
    ResponseSent,
    Finished,
}

/// State of one SCRAM exchange. Single-use, discarded after
/// [`finalize`][ScramSession::finalize].
pub(crate) struct ScramSession {
    mechanism: Mechanism,
    tls: bool,
    cert: Option<Vec<u8>>,
    client_nonce: String,
    phase: Phase,
    server_signature: Option<String>,
    /// the most recent outgoing payload
    response: String,
}

impl ScramSession {
    /// Select a mechanism from the server's offer and build the
    /// client-first message.
    ///
    /// `SCRAM-SHA-256-PLUS` is preferred, but only when channel binding
    /// is enabled and the TLS peer certificate is at hand.
    pub(crate) fn start(
        offered: &[String],
        tls: bool,
        cert: Option<Vec<u8>>,
        channel_binding: bool,
    ) -> Result<Self, SaslError> {
        let mut nonce = [0u8; NONCE_LENGTH];
        rand::thread_rng().fill_bytes(&mut nonce);
        Self::start_with_nonce(offered, tls, cert, channel_binding, BASE64.encode(nonce))
    }

    pub(crate) fn start_with_nonce(
        offered: &[String],
        tls: bool,
        cert: Option<Vec<u8>>,
        channel_binding: bool,
        client_nonce: String,
    ) -> Result<Self, SaslError> {
        let can_bind = channel_binding && tls && cert.is_some();

        let mechanism = if can_bind && offered.iter().any(|m| m == SCRAM_SHA_256_PLUS) {
            Mechanism::Sha256Plus
        } else if offered.iter().any(|m| m == SCRAM_SHA_256) {
            Mechanism::Sha256
        } else {
            return Err(SaslError::new("only SCRAM-SHA-256(-PLUS) supported"));
        };

        let gs2_header = match mechanism {
            Mechanism::Sha256Plus => "p=tls-server-end-point",
            // `y` tells the server we could bind, but it did not offer PLUS
            Mechanism::Sha256 if tls => "y",
            Mechanism::Sha256 => "n",
        };

        let response = format!("{gs2_header},,n=*,r={client_nonce}");

        Ok(Self {
            mechanism,
            tls,
            cert,
            client_nonce,
            phase: Phase::InitialSent,
            server_signature: None,
            response,
        })
    }

    pub(crate) fn mechanism(&self) -> Mechanism {
        self.mechanism
    }

    /// The payload to send next.
    pub(crate) fn response(&self) -> &str {
        &self.response
    }

    /// Digest the server-first message and build the client-final
    /// response carrying the proof.
    pub(crate) fn continue_session(
        &mut self,
        password: &str,
        server_first: &str,
    ) -> Result<(), SaslError> {
        if self.phase != Phase::InitialSent {
            return Err(SaslError::new("unexpected server-first message"));
        }

        let sv = ServerFirst::parse(server_first)?;

        // the server nonce must strictly extend ours
        if !sv.nonce.starts_with(&self.client_nonce) || sv.nonce.len() <= self.client_nonce.len() {
            return Err(SaslError::new("server nonce does not extend the client nonce"));
        }

        let channel = match self.mechanism {
            Mechanism::Sha256Plus => {
                let cert = self.cert.as_deref().expect("PLUS selected without certificate");
                let mut cbind = b"p=tls-server-end-point,,".to_vec();
                cbind.extend_from_slice(&tls_server_end_point(cert)?);
                BASE64.encode(cbind)
            }
            // base64 of "y,," and "n,," respectively
            Mechanism::Sha256 if self.tls => String::from("eSws"),
            Mechanism::Sha256 => String::from("biws"),
        };

        let password = stringprep::saslprep(password)
            .map_err(|_| SaslError::new("prohibited character in password"))?;

        let salt = BASE64
            .decode(sv.salt)
            .map_err(|_| SaslError::new("malformed salt"))?;

        let client_first_bare = format!("n=*,r={}", self.client_nonce);
        let client_final_without_proof = format!("c={channel},r={}", sv.nonce);
        let auth_message =
            format!("{client_first_bare},{server_first},{client_final_without_proof}");

        let salted_password = hi(password.as_bytes(), &salt, sv.iterations);

        let client_key = hmac(&salted_password, b"Client Key");
        let stored_key = Sha256::digest(client_key);
        let client_signature = hmac(&stored_key, auth_message.as_bytes());
        let client_proof = xor(&client_key, &client_signature);

        let server_key = hmac(&salted_password, b"Server Key");
        let server_signature = hmac(&server_key, auth_message.as_bytes());

        self.server_signature = Some(BASE64.encode(server_signature));
        self.response = format!(
            "{client_final_without_proof},p={}",
            BASE64.encode(client_proof),
        );
        self.phase = Phase::ResponseSent;

        Ok(())
    }

    /// Verify the server-final message against the expected signature.
    pub(crate) fn finalize(&mut self, server_final: &str) -> Result<(), SaslError> {
        if self.phase != Phase::ResponseSent {
            return Err(SaslError::new("unexpected server-final message"));
        }

        for part in server_final.split(',') {
            if let Some(reason) = part.strip_prefix("e=") {
                return Err(SaslError::new(reason.to_owned()));
            }
            if let Some(verifier) = part.strip_prefix("v=") {
                if !is_base64(verifier) {
                    return Err(SaslError::new("malformed server signature"));
                }
                if Some(verifier) != self.server_signature.as_deref() {
                    return Err(SaslError::new("server signature mismatch"));
                }
                self.phase = Phase::Finished;
                return Ok(());
            }
        }

        Err(SaslError::new("server-final carries no signature"))
    }
}

struct ServerFirst<'a> {
    nonce: &'a str,
    salt: &'a str,
    iterations: u32,
}

impl<'a> ServerFirst<'a> {
    /// Parse the comma-separated `name=value` attributes, requiring
    /// `r` (nonce), `s` (salt) and `i` (iteration count).
    fn parse(server_first: &'a str) -> Result<Self, SaslError> {
        let mut nonce = None;
        let mut salt = None;
        let mut iterations = None;

        for part in server_first.split(',') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            match name {
                "r" => nonce = Some(value),
                "s" => salt = Some(value),
                "i" => iterations = Some(value),
                _ => {}
            }
        }

        let nonce = nonce
            .filter(|n| n.bytes().all(|b| (0x21..=0x7e).contains(&b) && b != b','))
            .filter(|n| !n.is_empty())
            .ok_or_else(|| SaslError::new("malformed nonce in server-first"))?;

        let salt = salt
            .filter(|s| is_base64(s))
            .ok_or_else(|| SaslError::new("malformed salt in server-first"))?;

        let iterations = iterations
            .filter(|i| !i.starts_with('0') && i.bytes().all(|b| b.is_ascii_digit()))
            .and_then(|i| i.parse().ok())
            .filter(|i| *i > 0)
            .ok_or_else(|| SaslError::new("malformed iteration count in server-first"))?;

        Ok(Self { nonce, salt, iterations })
    }
}

/// `Hi(str, salt, i)`, which is PBKDF2 with HMAC-SHA-256.
fn hi(password: &[u8], salt: &[u8], iterations: u32) -> [u8; 32] {
    let mut output = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password, salt, iterations, &mut output);
    output
}

fn hmac(key: &[u8], data: &[u8]) -> [u8; 32] {
    let mut mac = HmacSha256::new_from_slice(key).expect("HMAC can take key of any size");
    mac.update(data);
    mac.finalize().into_bytes().into()
}

fn xor(a: &[u8; 32], b: &[u8; 32]) -> [u8; 32] {
    let mut out = *a;
    for (out, b) in out.iter_mut().zip(b) {
        *out ^= b;
    }
    out
}

/// Canonical base64: 4-byte groups from the standard alphabet with at
/// most two trailing `=`.
fn is_base64(s: &str) -> bool {
    let bytes = s.as_bytes();
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return false;
    }
    let pad = bytes.iter().rev().take_while(|b| **b == b'=').count();
    if pad > 2 {
        return false;
    }
    bytes[..bytes.len() - pad]
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'/'))
}

/// `tls-server-end-point` hash of the peer certificate.
///
/// The hash is the one from the certificate's signature algorithm,
/// except that MD5 and SHA-1 are replaced by SHA-256. This follows the
/// PostgreSQL server's reading of RFC 5929; do not change it without
/// coordinating with the server contract.
fn tls_server_end_point(der: &[u8]) -> Result<Vec<u8>, SaslError> {
    use openssl::{hash::MessageDigest, nid::Nid, x509::X509};

    let cert =
        X509::from_der(der).map_err(|_| SaslError::new("malformed peer certificate"))?;

    let digest_nid = cert
        .signature_algorithm()
        .object()
        .nid()
        .signature_algorithms()
        .map(|algs| algs.digest)
        .ok_or_else(|| SaslError::new("unknown certificate signature algorithm"))?;

    let digest = if digest_nid == Nid::MD5 || digest_nid == Nid::SHA1 {
        MessageDigest::sha256()
    } else {
        MessageDigest::from_nid(digest_nid)
            .ok_or_else(|| SaslError::new("unsupported certificate hash"))?
    };

    let hash = openssl::hash::hash(digest, der)
        .map_err(|_| SaslError::new("failed to hash peer certificate"))?;

    Ok(hash.to_vec())
}
