//! CAPF Session Engine
//!
//! Runs the per-connection enrollment state machine: authenticate the
//! phone, dispatch on the operation scheduled in its device row, then close
//! with an END_SESSION. The engine is generic over the transport so the
//! listener hands it a TLS stream and tests drive it over a socket pair.
//!
//! Within a session the engine and the phone strictly alternate: no second
//! command goes out before the response to the prior one is read, with the
//! single exception of REQUEST_IN_PROGRESS heartbeats during keygen.

use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use anyhow::Result;
use openssl::x509::X509;
use secrecy::ExposeSecret;
use tracing::{debug, error, info, warn};

use crate::configs::CapfConfig;
use crate::error::{AuthFailure, SessionError, SessionResult};
use crate::issuer::{self, issue_device_certificate, IssuerMaterial};
use crate::phone_auth::{verify_phone, CertificateCredentials, TrustAnchors};
use crate::store::{self, AuthMode, DeviceRecord, KeySpec, Operation, Store};
use crate::tlv::{
    auth_type, capf_tag, cert_type, key_type, reason, CapfCommand, CapfFrame, CAPF_VERSION,
};

/// Process-wide state shared read-only across CAPF workers. Only the
/// session-id counter mutates, atomically.
pub struct CapfContext {
    pub issuer: IssuerMaterial,
    pub anchors: TrustAnchors,
    pub database: PathBuf,
    pub certificates_dir: PathBuf,
    pub validity_days: u32,
    session_counter: AtomicU32,
}

impl CapfContext {
    pub fn new(config: &CapfConfig) -> Result<Self> {
        let issuer = IssuerMaterial::load(&config.issuer_certificate)?;
        let anchors = TrustAnchors::load(issuer.certificate.clone(), &config.verify_certificates)?;
        Ok(CapfContext {
            issuer,
            anchors,
            database: config.database.clone(),
            certificates_dir: config.certificates_dir(),
            validity_days: config.validity_days,
            session_counter: AtomicU32::new(0),
        })
    }

    #[cfg(test)]
    pub fn for_tests(
        issuer: IssuerMaterial,
        anchors: TrustAnchors,
        database: PathBuf,
        certificates_dir: PathBuf,
    ) -> Self {
        CapfContext {
            issuer,
            anchors,
            database,
            certificates_dir,
            validity_days: 365,
            session_counter: AtomicU32::new(0),
        }
    }

    /// Next session id. Wraps at 2^32; ids stay unique within a run.
    fn next_session_id(&self) -> u32 {
        self.session_counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1)
    }
}

/// How a session ended, for the teardown log line.
#[derive(Debug, PartialEq, Eq)]
pub enum SessionOutcome {
    NoAction,
    Installed,
    Fetched { updated: bool },
    Deleted { cleared: bool },
    UnknownDevice(String),
    Refused(String),
}

impl std::fmt::Display for SessionOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOutcome::NoAction => write!(f, "no scheduled operation"),
            SessionOutcome::Installed => write!(f, "certificate installed"),
            SessionOutcome::Fetched { updated: true } => write!(f, "certificate fetched"),
            SessionOutcome::Fetched { updated: false } => write!(f, "fetch returned nothing"),
            SessionOutcome::Deleted { cleared: true } => write!(f, "certificate deleted"),
            SessionOutcome::Deleted { cleared: false } => write!(f, "delete not confirmed"),
            SessionOutcome::UnknownDevice(name) => write!(f, "unknown device {}", name),
            SessionOutcome::Refused(why) => write!(f, "refused: {}", why),
        }
    }
}

pub struct CapfSession<'a, S> {
    stream: &'a mut S,
    ctx: &'a CapfContext,
    session_id: u32,
}

impl<'a, S: Read + Write> CapfSession<'a, S> {
    pub fn new(ctx: &'a CapfContext, stream: &'a mut S) -> Self {
        CapfSession {
            stream,
            ctx,
            session_id: 0,
        }
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// Drive the session to completion.
    pub fn run(&mut self) -> SessionResult<SessionOutcome> {
        self.session_id = self.ctx.next_session_id();

        let mut auth_request = CapfFrame::new(CapfCommand::AuthRequest, self.session_id);
        auth_request.elements.put_u8(capf_tag::VERSION, CAPF_VERSION);
        auth_request.elements.put_u8(capf_tag::AUTH_TYPE, auth_type::NONE);
        auth_request.write_to(self.stream)?;

        let response = self.read_response(CapfCommand::AuthResponse, false)?;

        match response.elements.get_u8(capf_tag::VERSION)? {
            Some(CAPF_VERSION) => {}
            other => {
                self.end_session(reason::INVALID_ELEMENT)?;
                return Ok(SessionOutcome::Refused(format!(
                    "protocol version mismatch: {:?}",
                    other
                )));
            }
        }

        let device_name = response
            .elements
            .get_string(capf_tag::DEVICE_NAME)?
            .ok_or_else(|| SessionError::protocol("AUTH_RESPONSE missing DEVICE_NAME"))?;
        debug!(device = %device_name, "authenticating");

        let db = Store::open(&self.ctx.database)?;
        let device = match db.get_device(&device_name)? {
            Some(device) => device,
            None => {
                self.end_session(reason::UNKNOWN_DEVICE)?;
                return Ok(SessionOutcome::UnknownDevice(device_name));
            }
        };

        if let Err(refusal) = self.check_credentials(&device, &response) {
            self.end_session(reason::INVALID_ELEMENT)?;
            return Ok(SessionOutcome::Refused(refusal));
        }

        match device.operation {
            Operation::None => {
                self.end_session(reason::NO_ACTION)?;
                Ok(SessionOutcome::NoAction)
            }
            Operation::Install => self.install(&db, &device),
            Operation::Fetch => self.fetch(&db, &device),
            Operation::Delete => self.delete(&db, &device),
        }
    }

    /// Match the presented credentials against the device row's mode.
    /// Returns the refusal reason on mismatch; crypto/store trouble escapes
    /// as a session error.
    fn check_credentials(
        &self,
        device: &DeviceRecord,
        response: &CapfFrame,
    ) -> Result<(), String> {
        match device.auth_mode {
            AuthMode::None => Ok(()),
            AuthMode::Password => {
                let presented = response
                    .elements
                    .get_string(capf_tag::PASSWORD)
                    .map_err(|e| e.to_string())?;
                let expected = device.password.as_ref();
                match (presented, expected) {
                    (Some(p), Some(stored)) if p == *stored.expose_secret() => Ok(()),
                    _ => Err("password mismatch".to_string()),
                }
            }
            AuthMode::Certificate => {
                let certificate = response
                    .elements
                    .get_certificate(capf_tag::CERTIFICATE)
                    .map_err(|e| e.to_string())?;
                let signed_data = response.elements.get_bytes(capf_tag::SIGNED_DATA);
                let sha2_signed_data = response.elements.get_bytes(capf_tag::SHA2_SIGNED_DATA);
                let (certificate_der, signed_data, sha2_signed_data) =
                    match (certificate, signed_data, sha2_signed_data) {
                        (Some((_, der)), Some(signed), Some(sha2)) => (der, signed, sha2),
                        _ => return Err("missing certificate credentials".to_string()),
                    };

                let creds = CertificateCredentials {
                    device_name: &device.device_name,
                    certificate_der: &certificate_der,
                    signed_data,
                    sha2_signed_data,
                    sudi_data: response.elements.get_bytes(capf_tag::SUDI_DATA),
                    session_id: self.session_id,
                };
                match verify_phone(&self.ctx.anchors, &creds) {
                    Ok(()) => Ok(()),
                    Err(SessionError::Auth(AuthFailure::BadCredentials(why))) => Err(why),
                    Err(other) => Err(other.to_string()),
                }
            }
        }
    }

    fn install(&mut self, db: &Store, device: &DeviceRecord) -> SessionResult<SessionOutcome> {
        let key_spec = device.key_spec.ok_or_else(|| {
            SessionError::Store(store::corrupt(
                "key_size/curve",
                "no key material scheduled for install".to_string(),
            ))
        })?;

        let mut request = CapfFrame::new(CapfCommand::KeyGenRequest, self.session_id);
        match key_spec {
            KeySpec::Rsa(bits) => {
                request.elements.put_u8(capf_tag::KEY_TYPE, key_type::RSA);
                request.elements.put_u16(capf_tag::KEY_SIZE, bits);
            }
            KeySpec::Ec(curve) => {
                request.elements.put_u8(capf_tag::KEY_TYPE, key_type::EC);
                request.elements.put_u8(capf_tag::CURVE, curve.code());
            }
        }
        request.write_to(self.stream)?;
        info!(device = %device.device_name, ?key_spec, "key generation requested");

        // Keygen can take the phone a while; heartbeats are tolerated for
        // both key types.
        let response = self.read_response(CapfCommand::KeyGenResponse, true)?;
        let spki = match response.elements.get_bytes(capf_tag::PUBLIC_KEY) {
            Some(spki) => spki,
            None => {
                warn!(device = %device.device_name, "KEY_GEN_RESPONSE carried no public key");
                self.end_session(reason::INVALID_ELEMENT)?;
                return Ok(SessionOutcome::Refused("no public key in keygen response".into()));
            }
        };

        let issued = issue_device_certificate(
            &self.ctx.issuer,
            &device.device_name,
            spki,
            self.ctx.validity_days,
        )?;
        let pem = issued.certificate.to_pem()?;
        let pem_text = String::from_utf8(pem.clone())
            .map_err(|_| SessionError::protocol("issued PEM is not valid UTF-8"))?;

        db.update_device_issued(
            &device.device_name,
            &issued.serial_hex,
            &pem_text,
            &issued.not_valid_before,
            &issued.not_valid_after,
        )?;
        issuer::write_pem_atomic(&self.ctx.certificates_dir, &device.device_name, &pem)?;
        info!(
            device = %device.device_name,
            serial = %issued.serial_hex,
            "certificate issued"
        );

        let mut store_request = CapfFrame::new(CapfCommand::StoreCertRequest, self.session_id);
        store_request.elements.put_certificate(
            capf_tag::CERTIFICATE,
            cert_type::LSC,
            &issued.certificate.to_der()?,
        )?;
        store_request.write_to(self.stream)?;

        // The phone's store result does not change ours; the row is already
        // updated.
        let response = self.read_response(CapfCommand::StoreCertResponse, false)?;
        debug!(
            store_reason = ?response.elements.get_u8(capf_tag::REASON)?,
            "store certificate acknowledged"
        );

        self.end_session(reason::UPDATE_CERTIFICATE)?;
        Ok(SessionOutcome::Installed)
    }

    fn fetch(&mut self, db: &Store, device: &DeviceRecord) -> SessionResult<SessionOutcome> {
        CapfFrame::new(CapfCommand::FetchCertRequest, self.session_id).write_to(self.stream)?;
        let response = self.read_response(CapfCommand::FetchCertResponse, false)?;

        let fetch_reason = response.elements.get_u8(capf_tag::REASON)?;
        let certificate = response.elements.get_certificate(capf_tag::CERTIFICATE)?;
        let updated = match (fetch_reason, certificate) {
            (Some(reason::UPDATE_CERTIFICATE), Some((_, der))) => {
                let cert = X509::from_der(&der)
                    .map_err(|_| SessionError::protocol("unparseable certificate in FETCH_CERT_RESPONSE"))?;
                let (serial_hex, not_before, not_after) = issuer::certificate_metadata(&cert)?;
                let pem = cert.to_pem()?;
                let pem_text = String::from_utf8(pem.clone())
                    .map_err(|_| SessionError::protocol("fetched PEM is not valid UTF-8"))?;
                db.update_device_issued(
                    &device.device_name,
                    &serial_hex,
                    &pem_text,
                    &not_before,
                    &not_after,
                )?;
                issuer::write_pem_atomic(&self.ctx.certificates_dir, &device.device_name, &pem)?;
                info!(device = %device.device_name, serial = %serial_hex, "certificate fetched");
                true
            }
            _ => {
                debug!(device = %device.device_name, ?fetch_reason, "phone returned no certificate");
                false
            }
        };

        self.end_session(reason::NO_ACTION)?;
        Ok(SessionOutcome::Fetched { updated })
    }

    fn delete(&mut self, db: &Store, device: &DeviceRecord) -> SessionResult<SessionOutcome> {
        CapfFrame::new(CapfCommand::DeleteCertRequest, self.session_id).write_to(self.stream)?;
        let response = self.read_response(CapfCommand::DeleteCertResponse, false)?;

        let cleared = match response.elements.get_u8(capf_tag::REASON)? {
            Some(reason::UPDATE_CERTIFICATE) => {
                db.clear_device_certificate(&device.device_name)?;
                issuer::remove_pem(&self.ctx.certificates_dir, &device.device_name)?;
                info!(device = %device.device_name, "certificate deleted");
                true
            }
            other => {
                debug!(device = %device.device_name, ?other, "phone did not confirm delete");
                false
            }
        };

        self.end_session(reason::UPDATE_CERTIFICATE)?;
        Ok(SessionOutcome::Deleted { cleared })
    }

    /// Read the peer's next frame, enforcing the session id and the
    /// expected command. Heartbeats are consumed when allowed.
    fn read_response(
        &mut self,
        expected: CapfCommand,
        allow_in_progress: bool,
    ) -> SessionResult<CapfFrame> {
        loop {
            let frame = CapfFrame::read_from(self.stream)?;
            if frame.session_id != self.session_id {
                return Err(SessionError::Protocol(format!(
                    "session id mismatch: peer sent {}, expected {}",
                    frame.session_id, self.session_id
                )));
            }
            if frame.command == expected {
                return Ok(frame);
            }
            if allow_in_progress && frame.command == CapfCommand::RequestInProgress {
                debug!("request in progress");
                continue;
            }
            return Err(SessionError::Protocol(format!(
                "unexpected command {} while waiting for {}",
                frame.command.code(),
                expected.code()
            )));
        }
    }

    fn end_session(&mut self, reason_code: u8) -> SessionResult<()> {
        let mut frame = CapfFrame::new(CapfCommand::EndSession, self.session_id);
        frame.elements.put_u8(capf_tag::REASON, reason_code);
        frame.write_to(self.stream)
    }
}

/// Worker root: run one session and fold every failure into logging and a
/// best-effort END_SESSION. Nothing propagates past here.
pub fn handle_connection<S: Read + Write>(ctx: &CapfContext, mut stream: S, peer: &str) {
    let span = tracing::info_span!("session", %peer);
    let _entered = span.enter();

    let (result, session_id) = {
        let mut session = CapfSession::new(ctx, &mut stream);
        let result = session.run();
        (result, session.session_id())
    };
    match result {
        Ok(outcome) => info!(session_id, "session finished: {}", outcome),
        Err(err) => match &err {
            SessionError::Protocol(_) => {
                warn!(session_id, "{}", err);
                let mut frame = CapfFrame::new(CapfCommand::EndSession, session_id);
                frame.elements.put_u8(capf_tag::REASON, reason::INVALID_ELEMENT);
                let _ = frame.write_to(&mut stream);
            }
            SessionError::Io(_) => debug!(session_id, "{}", err),
            _ => error!(session_id, "{}", err),
        },
    }
}
