//! Trust-on-first-use verification of server certificates.

use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, BufWriter},
    net::IpAddr,
    path::{Path, PathBuf},
    sync::Mutex,
};

use log::{debug, warn};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// The result of a TOFU verification.
#[derive(Debug, PartialEq, Eq)]
pub enum TofuResult {
    /// The host is known and the certificate matches.
    Match,
    /// The host is known but the certificate does not match.
    Mismatch,
    /// The host is not known yet.
    New,
}

/// The TOFU store could not be loaded or saved.
#[derive(Debug, Error)]
pub enum TofuError {
    /// The store path does not end in `.json`.
    #[error("TOFU store path must end with .json: {0}")]
    InvalidPath(PathBuf),
    /// Reading or writing the file failed.
    #[error("TOFU store I/O error: {0}")]
    Io(#[from] io::Error),
    /// The file is not a valid store.
    #[error("TOFU store is corrupt: {0}")]
    Json(#[from] serde_json::Error),
}

/// A trust-on-first-use (TOFU) store for hostnames and their certificate fingerprints.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct TofuStore {
    #[serde(skip)]
    path: PathBuf,
    known_hosts: HashMap<String, String>, // hostname -> fingerprint
}

impl TofuStore {
    /// Open a TOFU store, loading it from `path` if the file already exists.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, TofuError> {
        let path = path.into();
        if path.extension().is_none_or(|extension| extension != "json") {
            return Err(TofuError::InvalidPath(path));
        }

        if !path.try_exists()? {
            return Ok(Self { path, known_hosts: HashMap::new() });
        }

        let reader = BufReader::new(File::open(&path)?);
        let mut store: TofuStore = serde_json::from_reader(reader)?;
        store.path = path;

        Ok(store)
    }

    /// Where the store is saved.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The remembered fingerprint for `hostname`.
    pub fn fingerprint(&self, hostname: &str) -> Option<&str> {
        self.known_hosts.get(hostname).map(String::as_str)
    }

    /// Save the TOFU store to its file.
    fn save_to_disk(&self) -> Result<(), TofuError> {
        let writer = BufWriter::new(File::create(&self.path)?);
        serde_json::to_writer_pretty(writer, &self)?;

        Ok(())
    }

    /// Compare a certificate fingerprint with the one remembered for
    /// `hostname`, without learning anything. [`TofuResult::New`] means the
    /// host is unknown.
    pub fn check_host(&self, hostname: &str, claimed_fingerprint: &str) -> TofuResult {
        match self.known_hosts.get(hostname) {
            Some(fingerprint) if fingerprint == claimed_fingerprint => TofuResult::Match,
            Some(_) => TofuResult::Mismatch,
            None => TofuResult::New,
        }
    }

    /// Remember `fingerprint` for `hostname` and save the store.
    pub fn learn_host(&mut self, hostname: &str, fingerprint: &str) -> Result<(), TofuError> {
        self.known_hosts.insert(hostname.to_string(), fingerprint.to_string());
        self.save_to_disk()
    }

    /// Verify the fingerprint of the received certificate against the known
    /// fingerprint for the hostname, learning and saving it if the host is
    /// unknown.
    pub fn verify_or_learn_host(&mut self, hostname: &str, claimed_fingerprint: &str) -> Result<TofuResult, TofuError> {
        let result = self.check_host(hostname, claimed_fingerprint);
        if result == TofuResult::New {
            self.learn_host(hostname, claimed_fingerprint)?;
        }

        Ok(result)
    }
}

/// The hex SHA-256 fingerprint of a DER certificate.
pub fn fingerprint(certificate: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(certificate.as_ref()))
}

/// A TOFU `ServerCertVerifier` for TLS connections.
///
/// An unknown host is only learned once the server has proven, by signing
/// the handshake, that it holds the key for the certificate it presented.
#[derive(Debug)]
pub(crate) struct TofuVerifier {
    store: Mutex<TofuStore>,
    pending: Mutex<Vec<(String, String)>>, // (fingerprint, hostname) awaiting a handshake signature
    algorithms: WebPkiSupportedAlgorithms,
}

impl TofuVerifier {
    pub(crate) fn new(store: TofuStore, algorithms: WebPkiSupportedAlgorithms) -> Self {
        Self { store: Mutex::new(store), pending: Mutex::new(Vec::new()), algorithms }
    }

    /// Take the hosts waiting on `cert` off the pending list, learning them
    /// if the handshake signature checked out.
    fn settle_pending(&self, cert: &CertificateDer<'_>, signed: bool) -> Result<(), rustls::Error> {
        let fingerprint = fingerprint(cert);
        let hostnames: Vec<String> = {
            let mut pending = self.pending.lock().map_err(|_| rejected())?;
            let (matching, rest): (Vec<_>, Vec<_>) = pending.drain(..).partition(|(candidate, _)| *candidate == fingerprint);
            *pending = rest;
            matching.into_iter().map(|(_, hostname)| hostname).collect()
        };
        if !signed || hostnames.is_empty() {
            return Ok(());
        }

        let mut store = self.store.lock().map_err(|_| rejected())?;
        for hostname in hostnames {
            // Another handshake may have learned the host in the meantime.
            match store.check_host(&hostname, &fingerprint) {
                TofuResult::Match => {}
                TofuResult::Mismatch => {
                    warn!("certificate for {hostname} changed to {fingerprint}");
                    return Err(rejected());
                }
                TofuResult::New => {
                    store.learn_host(&hostname, &fingerprint).map_err(|e| {
                        warn!("could not remember certificate for {hostname}: {e}");
                        rejected()
                    })?;
                    debug!("learned certificate {fingerprint} for {hostname}");
                }
            }
        }

        Ok(())
    }
}

fn rejected() -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
}

impl ServerCertVerifier for TofuVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let hostname = match server_name {
            ServerName::DnsName(dns_name) => dns_name.as_ref().to_string(),
            ServerName::IpAddress(ip) => IpAddr::from(*ip).to_string(),
            _ => return Err(rustls::Error::InvalidCertificate(rustls::CertificateError::NotValidForName)),
        };
        let fingerprint = fingerprint(end_entity);

        let store = self.store.lock().map_err(|_| rejected())?;
        match store.check_host(&hostname, &fingerprint) {
            TofuResult::Match => Ok(ServerCertVerified::assertion()),
            TofuResult::New => {
                self.pending.lock().map_err(|_| rejected())?.push((fingerprint, hostname));
                Ok(ServerCertVerified::assertion())
            }
            TofuResult::Mismatch => {
                warn!("certificate for {hostname} changed to {fingerprint}");
                Err(rejected())
            }
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let valid = verify_tls12_signature(message, cert, dss, &self.algorithms);
        self.settle_pending(cert, valid.is_ok())?;
        valid
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        let valid = verify_tls13_signature(message, cert, dss, &self.algorithms);
        self.settle_pending(cert, valid.is_ok())?;
        valid
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_json_path() {
        assert!(matches!(TofuStore::open("known_hosts.txt"), Err(TofuError::InvalidPath(_))));
    }

    #[test]
    fn learns_then_matches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");

        let mut store = TofuStore::open(&path).unwrap();
        assert_eq!(store.verify_or_learn_host("example.org", "aa").unwrap(), TofuResult::New);
        assert_eq!(store.verify_or_learn_host("example.org", "aa").unwrap(), TofuResult::Match);
        assert_eq!(store.verify_or_learn_host("example.org", "bb").unwrap(), TofuResult::Mismatch);

        let reloaded = TofuStore::open(&path).unwrap();
        assert_eq!(reloaded.fingerprint("example.org"), Some("aa"));
        assert_eq!(reloaded.path(), path.as_path());
    }

    #[test]
    fn check_does_not_learn() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");

        let store = TofuStore::open(&path).unwrap();
        assert_eq!(store.check_host("example.org", "aa"), TofuResult::New);
        assert_eq!(store.fingerprint("example.org"), None);
        assert!(!path.exists());
    }

    #[test]
    fn unknown_host_waits_for_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");
        let certificate = crate::tls::load_certificates(
            PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("testdata").join("cert.pem"),
        )
        .unwrap()
        .remove(0);

        let algorithms = crate::tls::default_provider().signature_verification_algorithms;
        let verifier = TofuVerifier::new(TofuStore::open(&path).unwrap(), algorithms);
        let server_name = ServerName::try_from("localhost").unwrap();
        assert!(verifier.verify_server_cert(&certificate, &[], &server_name, &[], UnixTime::now()).is_ok());

        assert_eq!(verifier.store.lock().unwrap().fingerprint("localhost"), None);
        assert_eq!(verifier.pending.lock().unwrap().len(), 1);
        assert!(!path.exists());

        verifier.settle_pending(&certificate, true).unwrap();
        let expected = fingerprint(&certificate);
        assert_eq!(verifier.store.lock().unwrap().fingerprint("localhost"), Some(expected.as_str()));
        assert!(verifier.pending.lock().unwrap().is_empty());
        assert_eq!(TofuStore::open(&path).unwrap().fingerprint("localhost"), Some(expected.as_str()));
    }

    #[test]
    fn failed_signature_forgets_pending_host() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");
        let certificate = CertificateDer::from(vec![1, 2, 3]);

        let algorithms = crate::tls::default_provider().signature_verification_algorithms;
        let verifier = TofuVerifier::new(TofuStore::open(&path).unwrap(), algorithms);
        let server_name = ServerName::try_from("localhost").unwrap();
        verifier.verify_server_cert(&certificate, &[], &server_name, &[], UnixTime::now()).unwrap();

        verifier.settle_pending(&certificate, false).unwrap();
        assert!(verifier.pending.lock().unwrap().is_empty());
        assert_eq!(verifier.store.lock().unwrap().fingerprint("localhost"), None);
        assert!(!path.exists());
    }

    #[test]
    fn corrupt_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("known_hosts.json");
        std::fs::write(&path, "not json").unwrap();

        assert!(matches!(TofuStore::open(&path), Err(TofuError::Json(_))));
    }

    #[test]
    fn fingerprint_is_hex_sha256() {
        let certificate = CertificateDer::from(vec![1, 2, 3]);
        let hex = fingerprint(&certificate);
        assert_eq!(hex.len(), 64);
        assert!(hex.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
