/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
TLS configuration for secure transports, using [`rustls`](https://crates.io/crates/rustls).
 */

use crate::error::{MqttifyError, MqttifyResult};

use log::*;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::sync::Arc;

/// Opaque, cheaply cloneable TLS client configuration
#[derive(Clone)]
pub struct TlsOptions {
    pub(crate) config: Arc<rustls::ClientConfig>,
}

impl fmt::Debug for TlsOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TlsOptions {{ alpn_protocols: {} }}", self.config.alpn_protocols.len())
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
enum TlsMode {
    #[default]
    Standard,
    Mtls,
}

/// Builder for [`TlsOptions`].  Without an explicit root CA the platform's native roots are
/// trusted.
#[derive(Default)]
pub struct TlsOptionsBuilder {
    mode: TlsMode,
    root_ca_bytes: Option<Vec<u8>>,
    certificate_bytes: Option<Vec<u8>>,
    private_key_bytes: Option<Vec<u8>>,
    alpn: Option<Vec<u8>>,
}

impl TlsOptionsBuilder {

    /// Creates a builder for server-authenticated TLS
    pub fn new() -> Self {
        TlsOptionsBuilder::default()
    }

    /// Creates a builder for mutual TLS with a PEM certificate and private key read from disk
    pub fn new_with_mtls_from_path(certificate_path: &str, private_key_path: &str) -> MqttifyResult<Self> {
        let certificate_bytes = load_file(certificate_path)?;
        let private_key_bytes = load_file(private_key_path)?;

        Ok(TlsOptionsBuilder::new_with_mtls_from_memory(&certificate_bytes, &private_key_bytes))
    }

    /// Creates a builder for mutual TLS with an in-memory PEM certificate and private key
    pub fn new_with_mtls_from_memory(certificate_bytes: &[u8], private_key_bytes: &[u8]) -> Self {
        TlsOptionsBuilder {
            mode: TlsMode::Mtls,
            certificate_bytes: Some(certificate_bytes.to_vec()),
            private_key_bytes: Some(private_key_bytes.to_vec()),
            ..Default::default()
        }
    }

    /// Trusts the PEM certificates in a file instead of the native roots
    pub fn with_root_ca_from_path(&mut self, root_ca_path: &str) -> MqttifyResult<&mut Self> {
        self.root_ca_bytes = Some(load_file(root_ca_path)?);
        Ok(self)
    }

    /// Trusts in-memory PEM certificates instead of the native roots
    pub fn with_root_ca_from_memory(&mut self, root_ca_bytes: &[u8]) -> &mut Self {
        self.root_ca_bytes = Some(root_ca_bytes.to_vec());
        self
    }

    /// Requests a single ALPN protocol during the handshake
    pub fn with_alpn(&mut self, alpn: &[u8]) -> &mut Self {
        self.alpn = Some(alpn.to_vec());
        self
    }

    /// Builds the TLS configuration
    pub fn build(&self) -> MqttifyResult<TlsOptions> {
        let root_cert_store = build_root_ca_store(self.root_ca_bytes.as_deref())?;

        let mut config =
            match self.mode {
                TlsMode::Standard => {
                    rustls::ClientConfig::builder()
                        .with_root_certificates(root_cert_store)
                        .with_no_client_auth()
                }
                TlsMode::Mtls => {
                    let certs = build_certs(self.certificate_bytes.as_deref().unwrap_or_default())?;
                    let private_key = build_private_key(self.private_key_bytes.as_deref().unwrap_or_default())?;
                    rustls::ClientConfig::builder()
                        .with_root_certificates(root_cert_store)
                        .with_client_auth_cert(certs, private_key)?
                }
            };

        config.alpn_protocols = Vec::new();
        if let Some(alpn) = &self.alpn {
            config.alpn_protocols.push(alpn.clone());
        }

        Ok(TlsOptions {
            config: Arc::new(config),
        })
    }
}

fn load_file(filename: &str) -> MqttifyResult<Vec<u8>> {
    let mut bytes = Vec::new();
    let mut file = File::open(filename)?;
    file.read_to_end(&mut bytes)?;

    Ok(bytes)
}

fn build_root_ca_store(root_ca_bytes: Option<&[u8]>) -> MqttifyResult<rustls::RootCertStore> {
    let mut root_cert_store = rustls::RootCertStore::empty();

    if let Some(root_ca_bytes) = root_ca_bytes {
        for cert in build_certs(root_ca_bytes)? {
            root_cert_store.add(cert)?;
        }
    } else {
        let system_certs = rustls_native_certs::load_native_certs()?;
        let (added, ignored) = root_cert_store.add_parsable_certificates(system_certs);
        debug!("build_root_ca_store - loaded {} native root certificates, ignored {}", added, ignored);
    }

    if root_cert_store.is_empty() {
        return Err(MqttifyError::new_tls_error("no trusted root certificates available"));
    }

    Ok(root_cert_store)
}

fn build_certs(certificate_bytes: &[u8]) -> MqttifyResult<Vec<CertificateDer<'static>>> {
    let mut reader = std::io::BufReader::new(certificate_bytes);

    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(MqttifyError::new_tls_error("no certificates found in pem data"));
    }

    Ok(certs)
}

fn build_private_key(key_bytes: &[u8]) -> MqttifyResult<PrivateKeyDer<'static>> {
    let mut reader = std::io::BufReader::new(key_bytes);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => { return Ok(key.into()); }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => { return Ok(key.into()); }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => { return Ok(key.into()); }
            Ok(Some(_)) => {}
            Ok(None) => { return Err(MqttifyError::new_tls_error("no valid private keys found")); }
            Err(err) => { return Err(MqttifyError::new_tls_error(err)); }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn garbage_root_ca_rejected() {
        let result = TlsOptionsBuilder::new()
            .with_root_ca_from_memory("not a certificate".as_bytes())
            .build();

        assert_matches!(result, Err(MqttifyError::TlsError(_)));
    }

    #[test]
    fn mtls_without_private_key_rejected() {
        assert_matches!(build_private_key("-----BEGIN NOTHING-----".as_bytes()), Err(MqttifyError::TlsError(_)));
        assert_matches!(build_private_key(&[]), Err(MqttifyError::TlsError(_)));
    }

    #[test]
    fn missing_files_surface_io_errors() {
        assert_matches!(TlsOptionsBuilder::new_with_mtls_from_path("/nonexistent/cert.pem", "/nonexistent/key.pem"), Err(MqttifyError::StdIoError(_)));
        assert_matches!(TlsOptionsBuilder::new().with_root_ca_from_path("/nonexistent/ca.pem").map(|_| ()), Err(MqttifyError::StdIoError(_)));
    }
}
