//! Shared fixtures for module tests: throwaway CAs, phone keys and
//! certificates, and the phone-side signature formats.

use openssl::asn1::Asn1Time;
use openssl::bn::{BigNum, BigNumContext, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::sign::Signer;
use openssl::x509::extension::BasicConstraints;
use openssl::x509::{X509Name, X509};

use crate::issuer::IssuerMaterial;

/// Self-signed operator CA with CN, O, OU and C subject attributes.
pub fn test_issuer(cn: &str) -> IssuerMaterial {
    let rsa = Rsa::generate(2048).unwrap();
    let key = PKey::from_rsa(rsa).unwrap();

    let mut name_builder = X509Name::builder().unwrap();
    name_builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    name_builder
        .append_entry_by_nid(Nid::ORGANIZATIONNAME, "Test Telephony")
        .unwrap();
    name_builder
        .append_entry_by_nid(Nid::ORGANIZATIONALUNITNAME, "Lab")
        .unwrap();
    name_builder.append_entry_by_nid(Nid::COUNTRYNAME, "US").unwrap();
    let name = name_builder.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(3650).unwrap())
        .unwrap();
    builder.set_pubkey(&key).unwrap();
    builder
        .append_extension(BasicConstraints::new().critical().ca().build().unwrap())
        .unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();

    IssuerMaterial {
        certificate: builder.build(),
        private_key: key,
    }
}

pub fn test_rsa_keypair(bits: u32) -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(bits).unwrap()).unwrap()
}

pub fn test_ec_keypair(curve: Nid) -> PKey<Private> {
    let group = EcGroup::from_curve_name(curve).unwrap();
    PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap()
}

/// DER SubjectPublicKeyInfo for a fresh RSA key, as a phone would send it.
pub fn test_rsa_spki(bits: u32) -> Vec<u8> {
    test_rsa_keypair(bits).public_key_to_der().unwrap()
}

/// A device certificate (MIC stand-in) for `device_name`, signed by `ca`.
pub fn sign_device_cert(ca: &IssuerMaterial, device_name: &str, key: &PKey<Private>) -> X509 {
    let mut name_builder = X509Name::builder().unwrap();
    name_builder
        .append_entry_by_nid(Nid::COMMONNAME, device_name)
        .unwrap();
    let name = name_builder.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder
        .set_issuer_name(ca.certificate.subject_name())
        .unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.set_pubkey(key).unwrap();
    builder.sign(&ca.private_key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// A self-signed certificate chaining to nothing we trust.
pub fn self_signed_cert(cn: &str, key: &PKey<Private>) -> X509 {
    let mut name_builder = X509Name::builder().unwrap();
    name_builder.append_entry_by_nid(Nid::COMMONNAME, cn).unwrap();
    let name = name_builder.build();

    let mut builder = X509::builder().unwrap();
    builder.set_version(2).unwrap();
    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    builder
        .set_serial_number(&serial.to_asn1_integer().unwrap())
        .unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder
        .set_not_before(&Asn1Time::days_from_now(0).unwrap())
        .unwrap();
    builder
        .set_not_after(&Asn1Time::days_from_now(365).unwrap())
        .unwrap();
    builder.set_pubkey(key).unwrap();
    builder.sign(key, MessageDigest::sha256()).unwrap();
    builder.build()
}

/// Produce a signature the way the phone's RSA formatter does: a PKCS#1
/// v1.5 envelope around the bare digest, no DigestInfo prefix.
pub fn raw_rsa_sign(key: &PKey<Private>, digest: &[u8]) -> Vec<u8> {
    let rsa = key.rsa().unwrap();
    let n_len = rsa.size() as usize;
    assert!(digest.len() + 11 <= n_len);

    let mut em = vec![0xFF; n_len];
    em[0] = 0x00;
    em[1] = 0x01;
    em[n_len - digest.len() - 1] = 0x00;
    em[n_len - digest.len()..].copy_from_slice(digest);

    let m = BigNum::from_slice(&em).unwrap();
    let mut s = BigNum::new().unwrap();
    let mut ctx = BigNumContext::new().unwrap();
    s.mod_exp(&m, rsa.d(), rsa.n(), &mut ctx).unwrap();
    s.to_vec_padded(n_len as i32).unwrap()
}

/// Standard ECDSA signature over `data` with the given digest.
pub fn ecdsa_sign(key: &PKey<Private>, md: MessageDigest, data: &[u8]) -> Vec<u8> {
    let mut signer = Signer::new(md, key).unwrap();
    signer.update(data).unwrap();
    signer.sign_to_vec().unwrap()
}

/// Wire form of the SHA2_SIGNED_DATA element payload.
pub fn sha2_signed_data(hash_algo: u8, signature: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(3 + signature.len());
    out.push(hash_algo);
    out.extend_from_slice(&(signature.len() as u16).to_be_bytes());
    out.extend_from_slice(signature);
    out
}

/// Wire form of the SUDI_DATA element payload: three length-tagged segments.
pub fn sudi_data(cert_der: &[u8], signed_sha1: &[u8], signed_sha512: &[u8]) -> Vec<u8> {
    let mut out = Vec::new();
    for (tag, bytes) in [(0u8, cert_der), (1, signed_sha1), (3, signed_sha512)] {
        out.push(tag);
        out.extend_from_slice(&(bytes.len() as u16).to_be_bytes());
        out.extend_from_slice(bytes);
    }
    out
}
