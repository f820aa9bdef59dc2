//! TLV Wire Codec
//!
//! Shared framing for the CAPF and TVS protocols. Both speak big-endian
//! binary frames: a fixed header (8 bytes for CAPF, 10 for TVS) followed by
//! a body of tagged elements, each `tag (u8) | length (u16) | payload`.
//!
//! ```text
//! CAPF:  protocol_id=85 | command | session_id (u32) | body_length (u16)
//! TVS:   protocol_id=87 | version=1 | command | reserved=0 | session_id (u32) | body_length (u16)
//! ```
//!
//! String payloads carry a trailing NUL on the wire; the decoder strips it.
//! The CERTIFICATE element wraps its DER payload in a 5-byte inner header
//! carrying the certificate type.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use crate::error::{SessionError, SessionResult};

pub const CAPF_PROTOCOL_ID: u8 = 85;
pub const TVS_PROTOCOL_ID: u8 = 87;
pub const TVS_PROTOCOL_VERSION: u8 = 1;

/// CAPF application protocol version carried in AUTH_REQUEST/AUTH_RESPONSE.
pub const CAPF_VERSION: u8 = 3;

const CAPF_HEADER_LEN: usize = 8;
const TVS_HEADER_LEN: usize = 10;
const CERT_INNER_HEADER_LEN: usize = 5;

// ================= Commands =================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapfCommand {
    AuthRequest,
    AuthResponse,
    KeyGenRequest,
    KeyGenResponse,
    StoreCertRequest,
    StoreCertResponse,
    FetchCertRequest,
    FetchCertResponse,
    DeleteCertRequest,
    DeleteCertResponse,
    EndSession,
    RequestInProgress,
}

impl CapfCommand {
    pub fn code(self) -> u8 {
        match self {
            CapfCommand::AuthRequest => 1,
            CapfCommand::AuthResponse => 2,
            CapfCommand::KeyGenRequest => 3,
            CapfCommand::KeyGenResponse => 4,
            CapfCommand::StoreCertRequest => 5,
            CapfCommand::StoreCertResponse => 6,
            CapfCommand::FetchCertRequest => 7,
            CapfCommand::FetchCertResponse => 8,
            CapfCommand::DeleteCertRequest => 9,
            CapfCommand::DeleteCertResponse => 10,
            CapfCommand::EndSession => 11,
            CapfCommand::RequestInProgress => 12,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => CapfCommand::AuthRequest,
            2 => CapfCommand::AuthResponse,
            3 => CapfCommand::KeyGenRequest,
            4 => CapfCommand::KeyGenResponse,
            5 => CapfCommand::StoreCertRequest,
            6 => CapfCommand::StoreCertResponse,
            7 => CapfCommand::FetchCertRequest,
            8 => CapfCommand::FetchCertResponse,
            9 => CapfCommand::DeleteCertRequest,
            10 => CapfCommand::DeleteCertResponse,
            11 => CapfCommand::EndSession,
            12 => CapfCommand::RequestInProgress,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TvsCommand {
    VerifyRequest,
    VerifyResponse,
}

impl TvsCommand {
    pub fn code(self) -> u8 {
        match self {
            TvsCommand::VerifyRequest => 1,
            TvsCommand::VerifyResponse => 2,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            1 => TvsCommand::VerifyRequest,
            2 => TvsCommand::VerifyResponse,
            _ => return None,
        })
    }
}

// ================= Element tags =================

/// CAPF element tag codes.
pub mod capf_tag {
    pub const REASON: u8 = 1;
    pub const VERSION: u8 = 2;
    pub const AUTH_TYPE: u8 = 3;
    pub const DEVICE_NAME: u8 = 4;
    pub const PASSWORD: u8 = 5;
    pub const CERTIFICATE: u8 = 6;
    pub const PUBLIC_KEY: u8 = 7;
    pub const KEY_TYPE: u8 = 8;
    pub const KEY_SIZE: u8 = 9;
    pub const CURVE: u8 = 10;
    pub const SIGNED_DATA: u8 = 11;
    pub const SHA2_SIGNED_DATA: u8 = 12;
    pub const SUDI_DATA: u8 = 13;
}

/// CAPF response reason codes.
pub mod reason {
    pub const NO_ACTION: u8 = 0;
    pub const UPDATE_CERTIFICATE: u8 = 1;
    pub const INVALID_ELEMENT: u8 = 7;
    pub const UNKNOWN_DEVICE: u8 = 9;
}

/// AUTH_TYPE element values.
pub mod auth_type {
    pub const NONE: u8 = 0;
    pub const PASSWORD: u8 = 1;
}

/// Certificate types carried in the CERTIFICATE inner header.
pub mod cert_type {
    pub const LSC: u8 = 1;
    pub const MIC: u8 = 2;
}

/// KEY_TYPE element values.
pub mod key_type {
    pub const RSA: u8 = 0;
    pub const EC: u8 = 1;
}

/// STATUS element values in VERIFY_RESPONSE.
pub mod status {
    pub const INVALID: u8 = 0;
    pub const VALID: u8 = 1;
}

/// TVS element tag codes.
pub mod tvs_tag {
    pub const DEVICE_NAME: u8 = 1;
    pub const CERTIFICATE: u8 = 2;
    pub const STATUS: u8 = 7;
    pub const ROLES: u8 = 8;
    pub const TTL: u8 = 9;
}

fn capf_tag_known(tag: u8) -> bool {
    (capf_tag::REASON..=capf_tag::SUDI_DATA).contains(&tag)
}

fn tvs_tag_known(tag: u8) -> bool {
    matches!(
        tag,
        tvs_tag::DEVICE_NAME | tvs_tag::CERTIFICATE | tvs_tag::STATUS | tvs_tag::ROLES | tvs_tag::TTL
    )
}

// ================= Element map =================

/// Body of a frame: elements keyed by tag code.
///
/// Duplicate tags on receive overwrite (last wins). Typed accessors check
/// payload shape and turn mismatches into protocol errors.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ElementMap {
    entries: BTreeMap<u8, Vec<u8>>,
}

impl ElementMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, tag: u8) -> bool {
        self.entries.contains_key(&tag)
    }

    pub fn put_bytes(&mut self, tag: u8, payload: Vec<u8>) {
        self.entries.insert(tag, payload);
    }

    pub fn put_u8(&mut self, tag: u8, value: u8) {
        self.put_bytes(tag, vec![value]);
    }

    pub fn put_u16(&mut self, tag: u8, value: u16) {
        self.put_bytes(tag, value.to_be_bytes().to_vec());
    }

    pub fn put_u32(&mut self, tag: u8, value: u32) {
        self.put_bytes(tag, value.to_be_bytes().to_vec());
    }

    /// Store a string payload. The trailing NUL goes on the wire.
    pub fn put_string(&mut self, tag: u8, value: &str) {
        let mut payload = Vec::with_capacity(value.len() + 1);
        payload.extend_from_slice(value.as_bytes());
        payload.push(0);
        self.put_bytes(tag, payload);
    }

    /// Store a DER certificate behind the 5-byte inner header
    /// `01 | innerLen (u16) | 00 | cert_type`, innerLen = len(cert) + 2.
    pub fn put_certificate(&mut self, tag: u8, cert_type: u8, der: &[u8]) -> SessionResult<()> {
        let inner_len = der.len() + 2;
        if inner_len > u16::MAX as usize {
            return Err(SessionError::protocol("certificate payload too large"));
        }
        let mut payload = Vec::with_capacity(CERT_INNER_HEADER_LEN + der.len());
        payload.push(1);
        payload.extend_from_slice(&(inner_len as u16).to_be_bytes());
        payload.push(0);
        payload.push(cert_type);
        payload.extend_from_slice(der);
        self.put_bytes(tag, payload);
        Ok(())
    }

    pub fn get_bytes(&self, tag: u8) -> Option<&[u8]> {
        self.entries.get(&tag).map(|v| v.as_slice())
    }

    pub fn get_u8(&self, tag: u8) -> SessionResult<Option<u8>> {
        match self.entries.get(&tag) {
            None => Ok(None),
            Some(payload) if payload.len() == 1 => Ok(Some(payload[0])),
            Some(payload) => Err(SessionError::Protocol(format!(
                "element {} has length {}, expected 1",
                tag,
                payload.len()
            ))),
        }
    }

    pub fn get_u16(&self, tag: u8) -> SessionResult<Option<u16>> {
        match self.entries.get(&tag) {
            None => Ok(None),
            Some(payload) if payload.len() == 2 => {
                Ok(Some(u16::from_be_bytes([payload[0], payload[1]])))
            }
            Some(payload) => Err(SessionError::Protocol(format!(
                "element {} has length {}, expected 2",
                tag,
                payload.len()
            ))),
        }
    }

    pub fn get_u32(&self, tag: u8) -> SessionResult<Option<u32>> {
        match self.entries.get(&tag) {
            None => Ok(None),
            Some(payload) if payload.len() == 4 => Ok(Some(u32::from_be_bytes([
                payload[0], payload[1], payload[2], payload[3],
            ]))),
            Some(payload) => Err(SessionError::Protocol(format!(
                "element {} has length {}, expected 4",
                tag,
                payload.len()
            ))),
        }
    }

    /// Decode a NUL-terminated UTF-8 string payload.
    pub fn get_string(&self, tag: u8) -> SessionResult<Option<String>> {
        let payload = match self.entries.get(&tag) {
            None => return Ok(None),
            Some(payload) => payload,
        };
        let stripped = match payload.split_last() {
            Some((0, rest)) => rest,
            _ => {
                return Err(SessionError::Protocol(format!(
                    "string element {} is not NUL-terminated",
                    tag
                )))
            }
        };
        let text = std::str::from_utf8(stripped)
            .map_err(|_| SessionError::Protocol(format!("element {} is not valid UTF-8", tag)))?;
        Ok(Some(text.to_string()))
    }

    /// Decode a wrapped certificate payload, returning `(cert_type, der)`.
    pub fn get_certificate(&self, tag: u8) -> SessionResult<Option<(u8, Vec<u8>)>> {
        let payload = match self.entries.get(&tag) {
            None => return Ok(None),
            Some(payload) => payload,
        };
        if payload.len() < CERT_INNER_HEADER_LEN {
            return Err(SessionError::Protocol(format!(
                "certificate element {} shorter than its inner header",
                tag
            )));
        }
        let inner_len = u16::from_be_bytes([payload[1], payload[2]]) as usize;
        let der = &payload[CERT_INNER_HEADER_LEN..];
        if payload[0] != 1 || inner_len != der.len() + 2 {
            return Err(SessionError::Protocol(format!(
                "certificate element {} has a malformed inner header",
                tag
            )));
        }
        let cert_type = payload[4];
        Ok(Some((cert_type, der.to_vec())))
    }

    fn encode_into(&self, buf: &mut Vec<u8>) {
        for (tag, payload) in &self.entries {
            buf.push(*tag);
            buf.extend_from_slice(&(payload.len() as u16).to_be_bytes());
            buf.extend_from_slice(payload);
        }
    }

    fn body_len(&self) -> SessionResult<u16> {
        let mut total = 0usize;
        for payload in self.entries.values() {
            if payload.len() > u16::MAX as usize {
                return Err(SessionError::protocol("element payload exceeds u16 length"));
            }
            total += 3 + payload.len();
        }
        u16::try_from(total).map_err(|_| SessionError::protocol("frame body exceeds u16 length"))
    }

    fn decode(body: &[u8], tag_known: fn(u8) -> bool) -> SessionResult<Self> {
        let mut entries = BTreeMap::new();
        let mut rest = body;
        while !rest.is_empty() {
            if rest.len() < 3 {
                return Err(SessionError::protocol("truncated element header"));
            }
            let tag = rest[0];
            let len = u16::from_be_bytes([rest[1], rest[2]]) as usize;
            rest = &rest[3..];
            if rest.len() < len {
                return Err(SessionError::Protocol(format!(
                    "element {} claims {} bytes, {} remain",
                    tag,
                    len,
                    rest.len()
                )));
            }
            if !tag_known(tag) {
                return Err(SessionError::Protocol(format!("unknown element tag {}", tag)));
            }
            // Last occurrence wins.
            entries.insert(tag, rest[..len].to_vec());
            rest = &rest[len..];
        }
        Ok(ElementMap { entries })
    }
}

// ================= Frames =================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapfFrame {
    pub command: CapfCommand,
    pub session_id: u32,
    pub elements: ElementMap,
}

impl CapfFrame {
    pub fn new(command: CapfCommand, session_id: u32) -> Self {
        Self {
            command,
            session_id,
            elements: ElementMap::new(),
        }
    }

    pub fn encode(&self) -> SessionResult<Vec<u8>> {
        let body_len = self.elements.body_len()?;
        let mut buf = Vec::with_capacity(CAPF_HEADER_LEN + body_len as usize);
        buf.push(CAPF_PROTOCOL_ID);
        buf.push(self.command.code());
        buf.extend_from_slice(&self.session_id.to_be_bytes());
        buf.extend_from_slice(&body_len.to_be_bytes());
        self.elements.encode_into(&mut buf);
        Ok(buf)
    }

    /// Transmit the frame in a single write. Phones drop the connection if
    /// a frame arrives split across kernel write calls.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> SessionResult<()> {
        let buf = self.encode()?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> SessionResult<Self> {
        let mut header = [0u8; CAPF_HEADER_LEN];
        reader.read_exact(&mut header)?;
        if header[0] != CAPF_PROTOCOL_ID {
            return Err(SessionError::Protocol(format!(
                "unexpected protocol id {}",
                header[0]
            )));
        }
        let command = CapfCommand::from_code(header[1])
            .ok_or_else(|| SessionError::Protocol(format!("unknown command {}", header[1])))?;
        let session_id = u32::from_be_bytes([header[2], header[3], header[4], header[5]]);
        let body_len = u16::from_be_bytes([header[6], header[7]]) as usize;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        Ok(CapfFrame {
            command,
            session_id,
            elements: ElementMap::decode(&body, capf_tag_known)?,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TvsFrame {
    pub command: TvsCommand,
    pub session_id: u32,
    pub elements: ElementMap,
}

impl TvsFrame {
    pub fn new(command: TvsCommand, session_id: u32) -> Self {
        Self {
            command,
            session_id,
            elements: ElementMap::new(),
        }
    }

    pub fn encode(&self) -> SessionResult<Vec<u8>> {
        let body_len = self.elements.body_len()?;
        let mut buf = Vec::with_capacity(TVS_HEADER_LEN + body_len as usize);
        buf.push(TVS_PROTOCOL_ID);
        buf.push(TVS_PROTOCOL_VERSION);
        buf.push(self.command.code());
        buf.push(0); // reserved
        buf.extend_from_slice(&self.session_id.to_be_bytes());
        buf.extend_from_slice(&body_len.to_be_bytes());
        self.elements.encode_into(&mut buf);
        Ok(buf)
    }

    /// Single atomic write, same constraint as CAPF frames.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> SessionResult<()> {
        let buf = self.encode()?;
        writer.write_all(&buf)?;
        writer.flush()?;
        Ok(())
    }

    pub fn read_from<R: Read>(reader: &mut R) -> SessionResult<Self> {
        let mut header = [0u8; TVS_HEADER_LEN];
        reader.read_exact(&mut header)?;
        if header[0] != TVS_PROTOCOL_ID {
            return Err(SessionError::Protocol(format!(
                "unexpected protocol id {}",
                header[0]
            )));
        }
        if header[1] != TVS_PROTOCOL_VERSION {
            return Err(SessionError::Protocol(format!(
                "unsupported protocol version {}",
                header[1]
            )));
        }
        let command = TvsCommand::from_code(header[2])
            .ok_or_else(|| SessionError::Protocol(format!("unknown command {}", header[2])))?;
        let session_id = u32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let body_len = u16::from_be_bytes([header[8], header[9]]) as usize;
        let mut body = vec![0u8; body_len];
        reader.read_exact(&mut body)?;
        Ok(TvsFrame {
            command,
            session_id,
            elements: ElementMap::decode(&body, tvs_tag_known)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn capf_frame_roundtrip() {
        let mut frame = CapfFrame::new(CapfCommand::AuthResponse, 7);
        frame.elements.put_u8(capf_tag::VERSION, CAPF_VERSION);
        frame.elements.put_string(capf_tag::DEVICE_NAME, "SEP0011AABBCCDD");
        frame.elements.put_u16(capf_tag::KEY_SIZE, 2048);
        frame.elements.put_bytes(capf_tag::SIGNED_DATA, vec![1, 2, 3]);

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], CAPF_PROTOCOL_ID);
        assert_eq!(encoded[1], CapfCommand::AuthResponse.code());

        let decoded = CapfFrame::read_from(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn string_nul_on_wire_absent_decoded() {
        let mut frame = CapfFrame::new(CapfCommand::AuthResponse, 1);
        frame.elements.put_string(capf_tag::DEVICE_NAME, "SEP000000000001");
        let encoded = frame.encode().unwrap();
        // tag + len + 15 chars + NUL
        let payload_start = CAPF_HEADER_LEN + 3;
        assert_eq!(encoded[payload_start + 15], 0);

        let decoded = CapfFrame::read_from(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(
            decoded.elements.get_string(capf_tag::DEVICE_NAME).unwrap(),
            Some("SEP000000000001".to_string())
        );
    }

    #[test]
    fn unterminated_string_rejected() {
        let mut elements = ElementMap::new();
        elements.put_bytes(capf_tag::DEVICE_NAME, b"SEP000000000001".to_vec());
        assert!(matches!(
            elements.get_string(capf_tag::DEVICE_NAME),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn certificate_inner_header() {
        let der = vec![0x30, 0x82, 0x01, 0x00];
        let mut elements = ElementMap::new();
        elements.put_certificate(capf_tag::CERTIFICATE, 1, &der).unwrap();

        let raw = elements.get_bytes(capf_tag::CERTIFICATE).unwrap();
        assert_eq!(&raw[..5], &[1, 0, 6, 0, 1]);

        let (cert_type, decoded) = elements.get_certificate(capf_tag::CERTIFICATE).unwrap().unwrap();
        assert_eq!(cert_type, 1);
        assert_eq!(decoded, der);
    }

    #[test]
    fn malformed_certificate_header_rejected() {
        let mut elements = ElementMap::new();
        elements.put_bytes(capf_tag::CERTIFICATE, vec![2, 0, 6, 0, 1, 0x30]);
        assert!(elements.get_certificate(capf_tag::CERTIFICATE).is_err());
    }

    #[test]
    fn duplicate_tag_last_wins() {
        let mut body = Vec::new();
        body.extend_from_slice(&[capf_tag::REASON, 0, 1, 0]);
        body.extend_from_slice(&[capf_tag::REASON, 0, 1, 9]);
        let elements = ElementMap::decode(&body, capf_tag_known).unwrap();
        assert_eq!(elements.get_u8(capf_tag::REASON).unwrap(), Some(9));
    }

    #[test]
    fn unknown_tag_rejected() {
        let body = [200u8, 0, 1, 0];
        assert!(matches!(
            ElementMap::decode(&body, capf_tag_known),
            Err(SessionError::Protocol(_))
        ));
    }

    #[test]
    fn truncated_body_rejected() {
        let body = [capf_tag::REASON, 0, 4, 1];
        assert!(ElementMap::decode(&body, capf_tag_known).is_err());
    }

    #[test]
    fn bad_protocol_id_rejected() {
        let frame = CapfFrame::new(CapfCommand::EndSession, 1).encode().unwrap();
        let mut bytes = frame.clone();
        bytes[0] = 0x42;
        assert!(CapfFrame::read_from(&mut Cursor::new(&bytes)).is_err());
    }

    #[test]
    fn tvs_frame_roundtrip() {
        let mut frame = TvsFrame::new(TvsCommand::VerifyResponse, 0xDEADBEEF);
        frame.elements.put_u8(tvs_tag::STATUS, 1);
        frame.elements.put_bytes(tvs_tag::ROLES, vec![1, 3]);
        frame.elements.put_u32(tvs_tag::TTL, 3600);

        let encoded = frame.encode().unwrap();
        assert_eq!(encoded[0], TVS_PROTOCOL_ID);
        assert_eq!(encoded[1], TVS_PROTOCOL_VERSION);
        assert_eq!(encoded[3], 0);

        let decoded = TvsFrame::read_from(&mut Cursor::new(&encoded)).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(decoded.session_id, 0xDEADBEEF);
    }

    #[test]
    fn tvs_version_mismatch_rejected() {
        let mut encoded = TvsFrame::new(TvsCommand::VerifyRequest, 1).encode().unwrap();
        encoded[1] = 2;
        assert!(TvsFrame::read_from(&mut Cursor::new(&encoded)).is_err());
    }

    #[test]
    fn heartbeat_has_empty_body() {
        let frame = CapfFrame::new(CapfCommand::RequestInProgress, 3);
        let encoded = frame.encode().unwrap();
        assert_eq!(encoded.len(), CAPF_HEADER_LEN);
        let decoded = CapfFrame::read_from(&mut Cursor::new(&encoded)).unwrap();
        assert!(decoded.elements.is_empty());
    }
}
