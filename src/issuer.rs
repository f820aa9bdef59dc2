//! Certificate Issuer
//!
//! Builds and signs the phone leaf certificate (LSC) off the operator CA.
//! The phone supplies its public key during keygen; everything else comes
//! from the issuer material and the configured validity.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::x509::extension::{
    BasicConstraints, ExtendedKeyUsage, KeyUsage, SubjectAlternativeName,
};
use openssl::x509::{X509Name, X509};

use crate::error::SessionResult;
use crate::store::utc_timestamp;

const X509_VERSION_3: i32 = 2; // X509 version 3 is represented by 2
const SERIAL_BITS: i32 = 128;

/// OID for the IPsec End System extended key usage carried on issued certs.
const EKU_IPSEC_END_SYSTEM: &str = "1.3.6.1.5.5.7.3.5";

/// Subject attributes copied verbatim from the issuer certificate.
const COPIED_SUBJECT_NIDS: [Nid; 5] = [
    Nid::ORGANIZATIONNAME,
    Nid::ORGANIZATIONALUNITNAME,
    Nid::LOCALITYNAME,
    Nid::STATEORPROVINCENAME,
    Nid::COUNTRYNAME,
];

/// Operator CA certificate and private key, loaded once at startup and
/// shared read-only across sessions.
pub struct IssuerMaterial {
    pub certificate: X509,
    pub private_key: PKey<Private>,
}

impl IssuerMaterial {
    /// Load from a single PEM file carrying both the certificate and the
    /// private key, in either order.
    pub fn load(path: &Path) -> Result<Self> {
        let pem = std::fs::read(path)
            .with_context(|| format!("failed to read issuer bundle {}", path.display()))?;
        let certificate = X509::from_pem(&pem)
            .with_context(|| format!("no certificate in issuer bundle {}", path.display()))?;
        let private_key = PKey::private_key_from_pem(&pem)
            .with_context(|| format!("no private key in issuer bundle {}", path.display()))?;
        Ok(IssuerMaterial {
            certificate,
            private_key,
        })
    }
}

/// A signed leaf plus the metadata persisted alongside it.
pub struct IssuedCertificate {
    pub certificate: X509,
    pub serial_hex: String,
    pub not_valid_before: String,
    pub not_valid_after: String,
}

/// Issue a leaf certificate for `device_name` over the phone's public key
/// (DER SubjectPublicKeyInfo).
pub fn issue_device_certificate(
    issuer: &IssuerMaterial,
    device_name: &str,
    public_key_der: &[u8],
    validity_days: u32,
) -> SessionResult<IssuedCertificate> {
    let public_key = PKey::public_key_from_der(public_key_der)?;

    let mut builder = X509::builder()?;
    builder.set_version(X509_VERSION_3)?;

    // Random 128-bit serial, positive big-endian.
    let mut serial = BigNum::new()?;
    serial.rand(SERIAL_BITS, MsbOption::MAYBE_ZERO, false)?;
    let serial_hex = hex::encode(serial.to_vec());
    let serial_asn1 = serial.to_asn1_integer()?;
    builder.set_serial_number(&serial_asn1)?;

    // CN is the device name; any O/OU/L/ST/C on the issuer's Subject are
    // carried over in their order of occurrence.
    let mut name_builder = X509Name::builder()?;
    name_builder.append_entry_by_nid(Nid::COMMONNAME, device_name)?;
    for entry in issuer.certificate.subject_name().entries() {
        let nid = entry.object().nid();
        if COPIED_SUBJECT_NIDS.contains(&nid) {
            if let Ok(value) = entry.data().as_utf8() {
                name_builder.append_entry_by_nid(nid, &value)?;
            }
        }
    }
    builder.set_subject_name(&name_builder.build())?;

    // The leaf carries the issuer certificate's Issuer DN, not its Subject.
    // Deployed devices expect exactly this chain shape.
    builder.set_issuer_name(issuer.certificate.issuer_name())?;

    let now = chrono::Utc::now().timestamp();
    let not_after_unix = now + i64::from(validity_days) * 86_400;
    let not_before = Asn1Time::from_unix(now)?;
    let not_after = Asn1Time::from_unix(not_after_unix)?;
    builder.set_not_before(&not_before)?;
    builder.set_not_after(&not_after)?;

    builder.set_pubkey(&public_key)?;

    builder.append_extension(BasicConstraints::new().critical().build()?)?;
    builder.append_extension(
        KeyUsage::new()
            .critical()
            .digital_signature()
            .key_encipherment()
            .build()?,
    )?;
    builder.append_extension(
        ExtendedKeyUsage::new()
            .server_auth()
            .client_auth()
            .other(EKU_IPSEC_END_SYSTEM)
            .build()?,
    )?;
    let san = SubjectAlternativeName::new()
        .uri(device_name)
        .build(&builder.x509v3_context(Some(&issuer.certificate), None))?;
    builder.append_extension(san)?;

    builder.sign(&issuer.private_key, MessageDigest::sha256())?;

    Ok(IssuedCertificate {
        certificate: builder.build(),
        serial_hex,
        not_valid_before: utc_timestamp(now),
        not_valid_after: utc_timestamp(not_after_unix),
    })
}

/// Serial and validity metadata of an existing certificate, in store form.
pub fn certificate_metadata(cert: &X509) -> SessionResult<(String, String, String)> {
    let serial_hex = hex::encode(cert.serial_number().to_bn()?.to_vec());
    let not_before = utc_timestamp(asn1_to_unix(cert.not_before())?);
    let not_after = utc_timestamp(asn1_to_unix(cert.not_after())?);
    Ok((serial_hex, not_before, not_after))
}

fn asn1_to_unix(time: &Asn1TimeRef) -> SessionResult<i64> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch.diff(time)?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

pub fn pem_path(certificates_dir: &Path, device_name: &str) -> PathBuf {
    certificates_dir.join(format!("{}.pem", device_name))
}

/// Write the issued PEM next to the store, atomically: temp file in the
/// same directory, then rename.
pub fn write_pem_atomic(
    certificates_dir: &Path,
    device_name: &str,
    pem: &[u8],
) -> std::io::Result<PathBuf> {
    let target = pem_path(certificates_dir, device_name);
    let temp = certificates_dir.join(format!(".{}.pem.tmp", device_name));
    std::fs::write(&temp, pem)?;
    std::fs::rename(&temp, &target)?;
    Ok(target)
}

/// Unlink the issued PEM. Returns whether a file was removed.
pub fn remove_pem(certificates_dir: &Path, device_name: &str) -> std::io::Result<bool> {
    match std::fs::remove_file(pem_path(certificates_dir, device_name)) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
