//! Store Adapter
//!
//! Thin persistence layer over the SQLite databases managed by the external
//! admin tool. The server only reads rows and UPDATEs existing ones; it
//! never creates or deletes them. Each session opens its own connection and
//! keeps transactions to single record-level statements.

use std::path::Path;

use rusqlite::{params, Connection, OptionalExtension};
use secrecy::SecretString;

/// TTL bounds enforced at the admin boundary; rows outside are refused here
/// as corrupt.
const TTL_MIN: u32 = 1;
const TTL_MAX: u32 = 2_592_000;

/// Scheduled enrollment operation on a device row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Install,
    Fetch,
    Delete,
    None,
}

impl Operation {
    fn from_column(text: &str) -> Option<Self> {
        Some(match text {
            "install" => Operation::Install,
            "fetch" => Operation::Fetch,
            "delete" => Operation::Delete,
            "none" => Operation::None,
            _ => return None,
        })
    }
}

/// How the phone must authenticate inside the application protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    None,
    Password,
    Certificate,
}

impl AuthMode {
    fn from_column(text: &str) -> Option<Self> {
        Some(match text {
            "none" => AuthMode::None,
            "password" => AuthMode::Password,
            "certificate" => AuthMode::Certificate,
            _ => return None,
        })
    }
}

/// Supported EC curves for issued keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Curve {
    Secp256r1,
    Secp384r1,
    Secp521r1,
}

impl Curve {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "secp256r1" => Curve::Secp256r1,
            "secp384r1" => Curve::Secp384r1,
            "secp521r1" => Curve::Secp521r1,
            _ => return None,
        })
    }

    /// Wire code carried in the CURVE element.
    pub fn code(self) -> u8 {
        match self {
            Curve::Secp256r1 => 0,
            Curve::Secp384r1 => 1,
            Curve::Secp521r1 => 2,
        }
    }
}

/// Key material the phone is asked to generate on install.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpec {
    Rsa(u16),
    Ec(Curve),
}

const RSA_KEY_SIZES: [u16; 5] = [512, 1024, 2048, 3072, 4096];

/// One device row from the CAPF store.
#[derive(Debug)]
pub struct DeviceRecord {
    pub device_name: String,
    pub operation: Operation,
    pub auth_mode: AuthMode,
    pub password: Option<SecretString>,
    pub key_spec: Option<KeySpec>,
    pub certificate_pem: Option<String>,
    pub serial_number: Option<String>,
}

/// TVS roles in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sast,
    Ccm,
    CcmTftp,
    Tftp,
    Capf,
    AppServer,
    Tvs,
}

impl Role {
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "SAST" => Role::Sast,
            "CCM" => Role::Ccm,
            "CCM+TFTP" => Role::CcmTftp,
            "TFTP" => Role::Tftp,
            "CAPF" => Role::Capf,
            "APP-SERVER" => Role::AppServer,
            "TVS" => Role::Tvs,
            _ => return None,
        })
    }

    /// Wire code packed into the ROLES element.
    pub fn code(self) -> u8 {
        match self {
            Role::Sast => 0,
            Role::Ccm => 1,
            Role::CcmTftp => 2,
            Role::Tftp => 3,
            Role::Capf => 4,
            Role::AppServer => 7,
            Role::Tvs => 21,
        }
    }
}

/// One trust row from the TVS store.
#[derive(Debug)]
pub struct TrustRecord {
    pub roles: Vec<Role>,
    pub ttl: u32,
}

/// A row violating a store invariant, surfaced as a conversion failure so
/// it stays inside the store error taxonomy.
pub(crate) fn corrupt(column: &str, detail: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        format!("{}: {}", column, detail).into(),
    )
}

/// Per-session handle onto one SQLite database file.
pub struct Store {
    conn: Connection,
}

impl Store {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        let conn = Connection::open(path)?;
        // The admin tool may be writing concurrently.
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        Ok(Store { conn })
    }

    /// Look up a CAPF device row by name.
    pub fn get_device(&self, device_name: &str) -> rusqlite::Result<Option<DeviceRecord>> {
        self.conn
            .query_row(
                "SELECT device_name, operation, authentication, password, \
                        key_size, curve, certificate, serial_number \
                 FROM devices WHERE device_name = ?1",
                params![device_name],
                |row| {
                    let operation_text: String = row.get(1)?;
                    let auth_text: String = row.get(2)?;
                    let password: Option<String> = row.get(3)?;
                    let key_size: Option<i64> = row.get(4)?;
                    let curve: Option<String> = row.get(5)?;

                    let operation = Operation::from_column(&operation_text).ok_or_else(|| {
                        corrupt("operation", format!("unrecognized value {:?}", operation_text))
                    })?;
                    let auth_mode = AuthMode::from_column(&auth_text).ok_or_else(|| {
                        corrupt("authentication", format!("unrecognized value {:?}", auth_text))
                    })?;
                    let key_spec = match (key_size, curve) {
                        (Some(bits), None) => {
                            let accepted =
                                u16::try_from(bits).ok().filter(|b| RSA_KEY_SIZES.contains(b));
                            Some(KeySpec::Rsa(accepted.ok_or_else(|| {
                                corrupt("key_size", format!("unsupported RSA key size {}", bits))
                            })?))
                        }
                        (None, Some(name)) => Some(KeySpec::Ec(Curve::from_name(&name).ok_or_else(
                            || corrupt("curve", format!("unrecognized curve {:?}", name)),
                        )?)),
                        (None, None) => None,
                        (Some(_), Some(_)) => {
                            return Err(corrupt(
                                "key_size/curve",
                                "both set; they are mutually exclusive".to_string(),
                            ))
                        }
                    };

                    Ok(DeviceRecord {
                        device_name: row.get(0)?,
                        operation,
                        auth_mode,
                        password: password.map(SecretString::new),
                        key_spec,
                        certificate_pem: row.get(6)?,
                        serial_number: row.get(7)?,
                    })
                },
            )
            .optional()
    }

    /// Record a freshly issued or fetched certificate and reset the
    /// scheduled operation.
    pub fn update_device_issued(
        &self,
        device_name: &str,
        serial_hex: &str,
        certificate_pem: &str,
        not_valid_before: &str,
        not_valid_after: &str,
    ) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE devices SET certificate = ?2, serial_number = ?3, \
                    not_valid_before = ?4, not_valid_after = ?5, operation = 'none' \
             WHERE device_name = ?1",
            params![
                device_name,
                certificate_pem,
                serial_hex,
                not_valid_before,
                not_valid_after
            ],
        )?;
        Ok(())
    }

    /// Clear the certificate columns after a delete. Explicit NULLs, not a
    /// row DELETE.
    pub fn clear_device_certificate(&self, device_name: &str) -> rusqlite::Result<()> {
        self.conn.execute(
            "UPDATE devices SET certificate = NULL, serial_number = NULL, \
                    not_valid_before = NULL, not_valid_after = NULL, operation = 'none' \
             WHERE device_name = ?1",
            params![device_name],
        )?;
        Ok(())
    }

    /// Direct connection access for tests seeding rows the way the admin
    /// tool would.
    #[cfg(test)]
    pub(crate) fn raw(&self) -> &Connection {
        &self.conn
    }

    /// Look up a TVS trust row by SHA-256 fingerprint (hex lowercase).
    pub fn get_trust_record(&self, fingerprint_hex: &str) -> rusqlite::Result<Option<TrustRecord>> {
        self.conn
            .query_row(
                "SELECT roles, ttl FROM certificates WHERE certificate_hash = ?1",
                params![fingerprint_hex],
                |row| {
                    let roles_csv: String = row.get(0)?;
                    let ttl: i64 = row.get(1)?;

                    let mut roles = Vec::new();
                    for name in roles_csv.split(',').map(str::trim).filter(|s| !s.is_empty()) {
                        roles.push(Role::from_name(name).ok_or_else(|| {
                            corrupt("roles", format!("unrecognized role {:?}", name))
                        })?);
                    }
                    let ttl = u32::try_from(ttl)
                        .ok()
                        .filter(|t| (TTL_MIN..=TTL_MAX).contains(t))
                        .ok_or_else(|| corrupt("ttl", format!("out of range: {}", ttl)))?;

                    Ok(TrustRecord { roles, ttl })
                },
            )
            .optional()
    }
}

/// Format a Unix timestamp the way the store expects: `YYYY-MM-DD HH:MM:SS`
/// in UTC.
pub fn utc_timestamp(unix_secs: i64) -> String {
    chrono::DateTime::from_timestamp(unix_secs, 0)
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_default()
}

/// Schema used by the external admin tool; recreated here for tests only.
#[cfg(test)]
pub fn init_device_schema(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE devices (
            device_name TEXT PRIMARY KEY,
            operation TEXT NOT NULL DEFAULT 'none',
            authentication TEXT NOT NULL DEFAULT 'none',
            password TEXT,
            key_size INTEGER,
            curve TEXT,
            certificate TEXT,
            serial_number TEXT,
            not_valid_before TEXT,
            not_valid_after TEXT
        )",
    )
    .unwrap();
}

#[cfg(test)]
pub fn init_trust_schema(conn: &Connection) {
    conn.execute_batch(
        "CREATE TABLE certificates (
            certificate_hash TEXT PRIMARY KEY,
            serial_number TEXT,
            subject_name TEXT,
            issuer_name TEXT,
            certificate TEXT,
            roles TEXT,
            ttl INTEGER
        )",
    )
    .unwrap();
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::ExposeSecret;

    fn open_device_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("capf.sqlite3");
        let store = Store::open(&path).unwrap();
        init_device_schema(&store.conn);
        (dir, store)
    }

    fn open_trust_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tvs.sqlite3");
        let store = Store::open(&path).unwrap();
        init_trust_schema(&store.conn);
        (dir, store)
    }

    #[test]
    fn get_device_install_rsa() {
        let (_dir, store) = open_device_store();
        store
            .conn
            .execute(
                "INSERT INTO devices (device_name, operation, authentication, key_size) \
                 VALUES ('SEP000000000001', 'install', 'none', 2048)",
                [],
            )
            .unwrap();

        let record = store.get_device("SEP000000000001").unwrap().unwrap();
        assert_eq!(record.operation, Operation::Install);
        assert_eq!(record.auth_mode, AuthMode::None);
        assert_eq!(record.key_spec, Some(KeySpec::Rsa(2048)));
        assert!(record.certificate_pem.is_none());
    }

    #[test]
    fn get_device_password_and_curve() {
        let (_dir, store) = open_device_store();
        store
            .conn
            .execute(
                "INSERT INTO devices (device_name, operation, authentication, password, curve) \
                 VALUES ('SEP000000000002', 'install', 'password', '1234', 'secp384r1')",
                [],
            )
            .unwrap();

        let record = store.get_device("SEP000000000002").unwrap().unwrap();
        assert_eq!(record.auth_mode, AuthMode::Password);
        assert_eq!(record.password.as_ref().unwrap().expose_secret(), "1234");
        assert_eq!(record.key_spec, Some(KeySpec::Ec(Curve::Secp384r1)));
    }

    #[test]
    fn get_device_missing() {
        let (_dir, store) = open_device_store();
        assert!(store.get_device("SEP000000000099").unwrap().is_none());
    }

    #[test]
    fn rejected_key_size() {
        let (_dir, store) = open_device_store();
        store
            .conn
            .execute(
                "INSERT INTO devices (device_name, operation, key_size) \
                 VALUES ('SEP000000000003', 'install', 2047)",
                [],
            )
            .unwrap();
        assert!(store.get_device("SEP000000000003").is_err());
    }

    #[test]
    fn exclusive_key_material() {
        let (_dir, store) = open_device_store();
        store
            .conn
            .execute(
                "INSERT INTO devices (device_name, operation, key_size, curve) \
                 VALUES ('SEP000000000004', 'install', 2048, 'secp256r1')",
                [],
            )
            .unwrap();
        assert!(store.get_device("SEP000000000004").is_err());
    }

    #[test]
    fn update_and_clear_roundtrip() {
        let (_dir, store) = open_device_store();
        store
            .conn
            .execute(
                "INSERT INTO devices (device_name, operation, key_size) \
                 VALUES ('SEP000000000005', 'install', 1024)",
                [],
            )
            .unwrap();

        store
            .update_device_issued(
                "SEP000000000005",
                "0abc",
                "-----BEGIN CERTIFICATE-----",
                "2026-08-02 00:00:00",
                "2027-08-02 00:00:00",
            )
            .unwrap();
        // key material stays as scheduled; operation resets
        let record = store.get_device("SEP000000000005").unwrap().unwrap();
        assert_eq!(record.operation, Operation::None);
        assert_eq!(record.serial_number.as_deref(), Some("0abc"));
        assert!(record.certificate_pem.is_some());

        store.clear_device_certificate("SEP000000000005").unwrap();
        let record = store.get_device("SEP000000000005").unwrap().unwrap();
        assert!(record.certificate_pem.is_none());
        assert!(record.serial_number.is_none());
    }

    #[test]
    fn trust_record_lookup() {
        let (_dir, store) = open_trust_store();
        store
            .conn
            .execute(
                "INSERT INTO certificates (certificate_hash, roles, ttl) \
                 VALUES ('aa00', 'CCM,TFTP', 3600)",
                [],
            )
            .unwrap();

        let record = store.get_trust_record("aa00").unwrap().unwrap();
        assert_eq!(record.roles, vec![Role::Ccm, Role::Tftp]);
        assert_eq!(record.ttl, 3600);
        assert!(store.get_trust_record("bb11").unwrap().is_none());
    }

    #[test]
    fn trust_record_ttl_bounds() {
        let (_dir, store) = open_trust_store();
        store
            .conn
            .execute(
                "INSERT INTO certificates (certificate_hash, roles, ttl) \
                 VALUES ('cc22', 'SAST', 0)",
                [],
            )
            .unwrap();
        assert!(store.get_trust_record("cc22").is_err());
    }

    #[test]
    fn role_codes() {
        assert_eq!(Role::Sast.code(), 0);
        assert_eq!(Role::CcmTftp.code(), 2);
        assert_eq!(Role::AppServer.code(), 7);
        assert_eq!(Role::Tvs.code(), 21);
        assert_eq!(Role::from_name("CCM+TFTP"), Some(Role::CcmTftp));
        assert!(Role::from_name("XYZ").is_none());
    }

    #[test]
    fn timestamp_format() {
        assert_eq!(utc_timestamp(0), "1970-01-01 00:00:00");
        assert_eq!(utc_timestamp(1_754_092_800), "2025-08-02 00:00:00");
    }
}
