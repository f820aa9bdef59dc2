//! TVS Session Engine
//!
//! Single-shot trust queries: one VERIFY_REQUEST in, one VERIFY_RESPONSE
//! out. The phone presents a certificate and its device name; we answer
//! from the trust store keyed by the certificate's SHA-256 fingerprint.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::OnceLock;

use regex::Regex;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use crate::configs::TvsConfig;
use crate::error::{SessionError, SessionResult};
use crate::store::Store;
use crate::tlv::{status, tvs_tag, TvsCommand, TvsFrame};

/// Full device-name syntax, after the 1-byte device-type prefix is
/// stripped.
const DEVICE_NAME_PATTERN: &str = "^CP-[0-9]{4}-SEP[0-9A-F]{12}$";

fn device_name_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DEVICE_NAME_PATTERN).expect("device name pattern"))
}

/// Process-wide TVS state: just the store location.
pub struct TvsContext {
    pub database: PathBuf,
}

impl TvsContext {
    pub fn new(config: &TvsConfig) -> Self {
        TvsContext {
            database: config.database.clone(),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum VerifyOutcome {
    Valid { roles: Vec<u8>, ttl: u32 },
    Invalid,
}

/// Read the one request, answer it, done.
pub fn run_session<S: Read + Write>(ctx: &TvsContext, stream: &mut S) -> SessionResult<VerifyOutcome> {
    let request = TvsFrame::read_from(stream)?;
    if request.command != TvsCommand::VerifyRequest {
        return Err(SessionError::Protocol(format!(
            "unexpected command {}",
            request.command.code()
        )));
    }
    let session_id = request.session_id;

    let device_name = parse_device_name(&request)?;
    let (_, certificate_der) = request
        .elements
        .get_certificate(tvs_tag::CERTIFICATE)?
        .ok_or_else(|| SessionError::protocol("VERIFY_REQUEST missing CERTIFICATE"))?;

    let fingerprint = hex::encode(Sha256::digest(&certificate_der));
    debug!(device = %device_name, %fingerprint, "verify request");

    let db = Store::open(&ctx.database)?;
    let record = db.get_trust_record(&fingerprint)?;

    let mut response = TvsFrame::new(TvsCommand::VerifyResponse, session_id);
    let outcome = match record {
        Some(record) => {
            let roles: Vec<u8> = record.roles.iter().map(|r| r.code()).collect();
            response.elements.put_u8(tvs_tag::STATUS, status::VALID);
            response.elements.put_bytes(tvs_tag::ROLES, roles.clone());
            response.elements.put_u32(tvs_tag::TTL, record.ttl);
            VerifyOutcome::Valid {
                roles,
                ttl: record.ttl,
            }
        }
        None => {
            response.elements.put_u8(tvs_tag::STATUS, status::INVALID);
            VerifyOutcome::Invalid
        }
    };
    response.write_to(stream)?;
    Ok(outcome)
}

/// DEVICE_NAME carries a 1-byte device-type prefix, then the UTF-8 name.
fn parse_device_name(request: &TvsFrame) -> SessionResult<String> {
    let payload = request
        .elements
        .get_bytes(tvs_tag::DEVICE_NAME)
        .ok_or_else(|| SessionError::protocol("VERIFY_REQUEST missing DEVICE_NAME"))?;
    if payload.len() < 2 {
        return Err(SessionError::protocol("DEVICE_NAME too short"));
    }
    let name_bytes = &payload[1..];
    let name_bytes = match name_bytes.split_last() {
        Some((0, rest)) => rest,
        _ => name_bytes,
    };
    let name = std::str::from_utf8(name_bytes)
        .map_err(|_| SessionError::protocol("DEVICE_NAME is not valid UTF-8"))?;
    if !device_name_regex().is_match(name) {
        return Err(SessionError::Protocol(format!(
            "malformed device name {:?}",
            name
        )));
    }
    Ok(name.to_string())
}

/// Worker root, mirroring the CAPF side: log, never propagate.
pub fn handle_connection<S: Read + Write>(ctx: &TvsContext, mut stream: S, peer: &str) {
    let span = tracing::info_span!("session", %peer);
    let _entered = span.enter();

    match run_session(ctx, &mut stream) {
        Ok(VerifyOutcome::Valid { ref roles, ttl }) => {
            info!(?roles, ttl, "certificate trusted")
        }
        Ok(VerifyOutcome::Invalid) => info!("certificate not in trust store"),
        Err(SessionError::Io(err)) => debug!("connection dropped: {}", err),
        Err(err) => warn!("{}", err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::init_trust_schema;
    use crate::test_support::{self_signed_cert, test_rsa_keypair};
    use crate::tlv::cert_type;
    use std::os::unix::net::UnixStream;
    use std::sync::Arc;
    use std::time::Duration;

    const DEVICE: &str = "CP-7841-SEP0011AABBCCDD";

    fn fixture() -> (tempfile::TempDir, Arc<TvsContext>, Vec<u8>) {
        let dir = tempfile::tempdir().unwrap();
        let database = dir.path().join("tvs.sqlite3");
        let store = Store::open(&database).unwrap();
        init_trust_schema(store.raw());

        let key = test_rsa_keypair(1024);
        let cert = self_signed_cert("CUCM Publisher", &key);
        let der = cert.to_der().unwrap();

        (dir, Arc::new(TvsContext { database }), der)
    }

    fn seed_trust(ctx: &TvsContext, der: &[u8], roles: &str, ttl: u32) {
        let fingerprint = hex::encode(Sha256::digest(der));
        let store = Store::open(&ctx.database).unwrap();
        store
            .raw()
            .execute(
                "INSERT INTO certificates (certificate_hash, roles, ttl) VALUES (?1, ?2, ?3)",
                rusqlite::params![fingerprint, roles, ttl],
            )
            .unwrap();
    }

    fn verify_request(session_id: u32, device: &str, der: &[u8]) -> TvsFrame {
        let mut frame = TvsFrame::new(TvsCommand::VerifyRequest, session_id);
        let mut name = vec![1u8]; // device-type prefix
        name.extend_from_slice(device.as_bytes());
        name.push(0);
        frame.elements.put_bytes(tvs_tag::DEVICE_NAME, name);
        frame
            .elements
            .put_certificate(tvs_tag::CERTIFICATE, cert_type::LSC, der)
            .unwrap();
        frame
    }

    fn pair() -> (UnixStream, UnixStream) {
        let (a, b) = UnixStream::pair().unwrap();
        for s in [&a, &b] {
            s.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        }
        (a, b)
    }

    #[test]
    fn known_certificate_is_valid() {
        let (_dir, ctx, der) = fixture();
        seed_trust(&ctx, &der, "CCM,TFTP", 3600);

        let (mut client, mut server) = pair();
        let server_ctx = ctx.clone();
        let handle = std::thread::spawn(move || run_session(&server_ctx, &mut server));

        verify_request(0xABCD, DEVICE, &der).write_to(&mut client).unwrap();
        let response = TvsFrame::read_from(&mut client).unwrap();

        assert_eq!(response.command, TvsCommand::VerifyResponse);
        assert_eq!(response.session_id, 0xABCD);
        assert_eq!(response.elements.get_u8(tvs_tag::STATUS).unwrap(), Some(status::VALID));
        assert_eq!(response.elements.get_bytes(tvs_tag::ROLES), Some(&[1u8, 3][..]));
        assert_eq!(response.elements.get_u32(tvs_tag::TTL).unwrap(), Some(3600));

        assert_eq!(
            handle.join().unwrap().unwrap(),
            VerifyOutcome::Valid {
                roles: vec![1, 3],
                ttl: 3600
            }
        );
    }

    #[test]
    fn unknown_certificate_is_invalid() {
        let (_dir, ctx, der) = fixture();

        let (mut client, mut server) = pair();
        let server_ctx = ctx.clone();
        let handle = std::thread::spawn(move || run_session(&server_ctx, &mut server));

        verify_request(7, DEVICE, &der).write_to(&mut client).unwrap();
        let response = TvsFrame::read_from(&mut client).unwrap();

        assert_eq!(response.elements.get_u8(tvs_tag::STATUS).unwrap(), Some(status::INVALID));
        assert!(!response.elements.contains(tvs_tag::ROLES));
        assert!(!response.elements.contains(tvs_tag::TTL));
        assert_eq!(handle.join().unwrap().unwrap(), VerifyOutcome::Invalid);
    }

    #[test]
    fn malformed_device_name_fails_session() {
        let (_dir, ctx, der) = fixture();

        let (mut client, mut server) = pair();
        let server_ctx = ctx.clone();
        let handle = std::thread::spawn(move || run_session(&server_ctx, &mut server));

        verify_request(1, "SEP0011AABBCCDD", &der)
            .write_to(&mut client)
            .unwrap();

        match handle.join().unwrap() {
            Err(SessionError::Protocol(msg)) => assert!(msg.contains("device name")),
            other => panic!("expected protocol error, got {:?}", other),
        }
    }

    #[test]
    fn wrong_command_fails_session() {
        let (_dir, ctx, _der) = fixture();

        let (mut client, mut server) = pair();
        let server_ctx = ctx.clone();
        let handle = std::thread::spawn(move || run_session(&server_ctx, &mut server));

        TvsFrame::new(TvsCommand::VerifyResponse, 1)
            .write_to(&mut client)
            .unwrap();

        assert!(matches!(
            handle.join().unwrap(),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn device_name_pattern() {
        let re = device_name_regex();
        assert!(re.is_match("CP-8845-SEP001122334455"));
        assert!(!re.is_match("CP-88-SEP001122334455"));
        assert!(!re.is_match("CP-8845-SEP00112233445G"));
        assert!(!re.is_match("cp-8845-SEP001122334455"));
    }
}
