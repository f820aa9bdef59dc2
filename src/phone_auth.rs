//! Phone Authentication
//!
//! Verifies the credentials a phone presents when its device row demands
//! certificate authentication: the MIC chain against the configured trust
//! anchors, the signatures over the device name and certificate, and the
//! optional SUDI attestation block.
//!
//! RSA signatures are checked manually: the phone's formatter emits a
//! PKCS#1 v1.5 envelope around the bare digest with no DigestInfo prefix,
//! so a library verifier rejects them. We recover the message
//! representative with `s^e mod n` and compare the trailing digest bytes.

use std::path::PathBuf;

use anyhow::{Context, Result};
use openssl::bn::{BigNum, BigNumContext};
use openssl::hash::{hash, MessageDigest};
use openssl::pkey::{HasPublic, Id, PKeyRef};
use openssl::sign::Verifier;
use openssl::x509::X509;

use crate::error::{AuthFailure, SessionError, SessionResult};

/// Wire codes for hash algorithms inside SHA2_SIGNED_DATA and SUDI.
const HASH_SHA512: u8 = 3;

/// SUDI segment tags.
const SUDI_SEGMENT_CERT: u8 = 0;
const SUDI_SEGMENT_SHA1: u8 = 1;
const SUDI_SEGMENT_SHA512: u8 = 3;

fn bad(reason: impl Into<String>) -> SessionError {
    SessionError::Auth(AuthFailure::BadCredentials(reason.into()))
}

/// Ordered trust anchors: the CAPF issuer certificate first, then any
/// explicitly configured verify certificates.
pub struct TrustAnchors {
    anchors: Vec<X509>,
}

impl TrustAnchors {
    pub fn load(issuer_certificate: X509, verify_paths: &[PathBuf]) -> Result<Self> {
        let mut anchors = vec![issuer_certificate];
        for path in verify_paths {
            let pem = std::fs::read(path)
                .with_context(|| format!("failed to read verify certificate {}", path.display()))?;
            let cert = X509::from_pem(&pem)
                .with_context(|| format!("failed to parse verify certificate {}", path.display()))?;
            anchors.push(cert);
        }
        Ok(TrustAnchors { anchors })
    }

    /// First anchor whose Subject matches the candidate's Issuer and whose
    /// key validates the candidate's signature. No revocation or
    /// name-constraint checks.
    fn find_issuer(&self, candidate: &X509) -> SessionResult<Option<&X509>> {
        for anchor in &self.anchors {
            let subject_matches = anchor
                .subject_name()
                .try_cmp(candidate.issuer_name())?
                .is_eq();
            let anchor_pubkey = anchor.public_key()?;
            if subject_matches && candidate.verify(&anchor_pubkey)? {
                return Ok(Some(anchor));
            }
        }
        Ok(None)
    }

    pub fn verify_chain(&self, candidate: &X509) -> SessionResult<()> {
        match self.find_issuer(candidate)? {
            Some(_) => Ok(()),
            None => Err(bad("Unknown certificate issuer")),
        }
    }
}

/// Credentials from an AUTH_RESPONSE in certificate mode.
pub struct CertificateCredentials<'a> {
    pub device_name: &'a str,
    pub certificate_der: &'a [u8],
    pub signed_data: &'a [u8],
    pub sha2_signed_data: &'a [u8],
    pub sudi_data: Option<&'a [u8]>,
    pub session_id: u32,
}

/// Run the full certificate-mode check. Any failure maps to a specific
/// auth reason; the session reports INVALID_ELEMENT to the peer.
pub fn verify_phone(anchors: &TrustAnchors, creds: &CertificateCredentials<'_>) -> SessionResult<()> {
    let phone_cert = X509::from_der(creds.certificate_der)
        .map_err(|_| bad("Malformed phone certificate"))?;
    anchors.verify_chain(&phone_cert)?;

    // device_name || 0x00 || cert DER
    let mut auth_data = Vec::with_capacity(creds.device_name.len() + 1 + creds.certificate_der.len());
    auth_data.extend_from_slice(creds.device_name.as_bytes());
    auth_data.push(0);
    auth_data.extend_from_slice(creds.certificate_der);

    let phone_key = phone_cert.public_key()?;
    if !verify_signature(&phone_key, MessageDigest::sha1(), &auth_data, creds.signed_data)? {
        return Err(bad("Invalid SHA-1 signature"));
    }

    let sha2_signature = parse_sha2_envelope(creds.sha2_signed_data)?;
    if !verify_signature(&phone_key, MessageDigest::sha512(), &auth_data, sha2_signature)? {
        return Err(bad("Invalid SHA-512 signature"));
    }

    if let Some(sudi) = creds.sudi_data {
        verify_sudi(anchors, sudi, creds.session_id)?;
    }

    Ok(())
}

/// SHA2_SIGNED_DATA payload: `hash_algo (u8) | len (u16) | signature`.
fn parse_sha2_envelope(payload: &[u8]) -> SessionResult<&[u8]> {
    if payload.len() < 3 {
        return Err(bad("Truncated SHA2 signed data"));
    }
    if payload[0] != HASH_SHA512 {
        return Err(bad("Invalid SHA2 hash-algorithm"));
    }
    let len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
    let signature = &payload[3..];
    if signature.len() != len {
        return Err(bad("SHA2 signed data length mismatch"));
    }
    Ok(signature)
}

/// Dispatch on the phone key type: manual PKCS#1 v1.5 for RSA, standard
/// ECDSA otherwise.
fn verify_signature<T: HasPublic>(
    key: &PKeyRef<T>,
    md: MessageDigest,
    data: &[u8],
    signature: &[u8],
) -> SessionResult<bool> {
    match key.id() {
        Id::RSA => {
            let digest = hash(md, data)?;
            raw_rsa_verify(key, &digest, signature)
        }
        Id::EC => {
            let mut verifier = Verifier::new(md, key)?;
            verifier.update(data)?;
            Ok(verifier.verify(signature).unwrap_or(false))
        }
        _ => Err(bad("Unsupported phone key type")),
    }
}

/// Recover `s^e mod n` and compare the trailing `hashlen` bytes against the
/// digest, ignoring the padding prefix the phone emits.
fn raw_rsa_verify<T: HasPublic>(
    key: &PKeyRef<T>,
    digest: &[u8],
    signature: &[u8],
) -> SessionResult<bool> {
    let rsa = key.rsa()?;
    let modulus_len = rsa.size() as usize;
    if signature.is_empty() || signature.len() > modulus_len {
        return Ok(false);
    }

    let s = BigNum::from_slice(signature)?;
    if s.ucmp(rsa.n()) != std::cmp::Ordering::Less {
        return Ok(false);
    }

    let mut recovered = BigNum::new()?;
    let mut ctx = BigNumContext::new()?;
    recovered.mod_exp(&s, rsa.e(), rsa.n(), &mut ctx)?;
    let em = recovered.to_vec_padded(modulus_len as i32)?;

    if em.len() < digest.len() {
        return Ok(false);
    }
    Ok(&em[em.len() - digest.len()..] == digest)
}

struct SudiBlock {
    cert_der: Vec<u8>,
    signed_sha1: Vec<u8>,
    signed_sha512: Vec<u8>,
}

/// SUDI_DATA payload: three length-tagged segments,
/// `00|len|cert`, `01|len|signed_sha1`, `03|len|signed_sha512`.
fn parse_sudi(payload: &[u8]) -> SessionResult<SudiBlock> {
    let mut cert_der = None;
    let mut signed_sha1 = None;
    let mut signed_sha512 = None;

    let mut rest = payload;
    while !rest.is_empty() {
        if rest.len() < 3 {
            return Err(bad("Truncated SUDI segment header"));
        }
        let tag = rest[0];
        let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
        rest = &rest[3..];
        if rest.len() < len {
            return Err(bad("Truncated SUDI segment"));
        }
        let bytes = rest[..len].to_vec();
        rest = &rest[len..];
        match tag {
            SUDI_SEGMENT_CERT => cert_der = Some(bytes),
            SUDI_SEGMENT_SHA1 => signed_sha1 = Some(bytes),
            SUDI_SEGMENT_SHA512 => signed_sha512 = Some(bytes),
            _ => return Err(bad(format!("Unknown SUDI segment {}", tag))),
        }
    }

    match (cert_der, signed_sha1, signed_sha512) {
        (Some(cert_der), Some(signed_sha1), Some(signed_sha512)) => Ok(SudiBlock {
            cert_der,
            signed_sha1,
            signed_sha512,
        }),
        _ => Err(bad("Incomplete SUDI data")),
    }
}

fn verify_sudi(anchors: &TrustAnchors, payload: &[u8], session_id: u32) -> SessionResult<()> {
    let block = parse_sudi(payload)?;
    let sudi_cert = X509::from_der(&block.cert_der).map_err(|_| bad("Malformed SUDI certificate"))?;
    anchors.verify_chain(&sudi_cert)?;

    let sudi_key = sudi_cert.public_key()?;
    if sudi_key.id() != Id::RSA {
        // Only RSA SUDI keys carry the raw-signature attestation.
        return Ok(());
    }

    // session_id is little-endian here, matching the origin host byte order.
    let mut auth_data = Vec::with_capacity(4 + block.cert_der.len());
    auth_data.extend_from_slice(&session_id.to_le_bytes());
    auth_data.extend_from_slice(&block.cert_der);

    let sha1_digest = hash(MessageDigest::sha1(), &auth_data)?;
    if !raw_rsa_verify(&sudi_key, &sha1_digest, &block.signed_sha1)? {
        return Err(bad("Invalid SUDI SHA-1 signature"));
    }
    let sha512_digest = hash(MessageDigest::sha512(), &auth_data)?;
    if !raw_rsa_verify(&sudi_key, &sha512_digest, &block.signed_sha512)? {
        return Err(bad("Invalid SUDI SHA-512 signature"));
    }
    Ok(())
}
