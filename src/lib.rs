//! phonecert - Certificate Services for IP Phones
//!
//! Two TLS daemons built on a shared core:
//!
//! - **CAPF** (`capfd`, port 3804): certificate enrollment. Phones connect,
//!   authenticate, and are provisioned according to the operation scheduled
//!   in their device row: install a freshly issued certificate, hand an
//!   existing one back to the server, delete it, or nothing.
//! - **TVS** (`tvsd`, port 2445): trust verification. Phones present a
//!   certificate and ask whether it is known, which roles it is trusted
//!   for, and for how long.
//!
//! Both protocols are framed binary TLV inside TLS ([`tlv`]). Transport
//! security stops at the handshake; phone authentication happens inside
//! the application protocol ([`phone_auth`]), including the manual PKCS#1
//! v1.5 check the phone firmware requires. Certificates are issued off an
//! operator-supplied CA ([`issuer`]) and device/trust records live in
//! SQLite databases owned by the external admin tool ([`store`]).
//!
//! # Concurrency
//!
//! One blocking worker thread per connection; the main thread owns the
//! accept loop and signal handling ([`listener`]). Sessions share only the
//! immutable server context and an atomic session-id counter.

pub mod capf_session;
pub mod configs;
pub mod error;
pub mod issuer;
pub mod listener;
pub mod logging;
pub mod phone_auth;
pub mod store;
pub mod tlv;
pub mod tvs_session;

#[cfg(test)]
mod test_support;
