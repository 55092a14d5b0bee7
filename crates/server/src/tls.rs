//! TLS termination.
//!
//! Certificate material is loaded and checked before any socket is bound,
//! so a bad path or unreadable key fails startup with a clear message
//! instead of failing the first handshake.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use anyhow::{bail, Context};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::TlsAcceptor;

use pagi_protocol::TlsInfo;

use crate::config::{TlsSettings, TlsVersion};

/// Fail-fast check that every configured file exists and is readable.
pub fn validate_materials(settings: &TlsSettings) -> anyhow::Result<()> {
    for (label, path) in [
        ("certificate", Some(&settings.cert_path)),
        ("private key", Some(&settings.key_path)),
        ("client CA bundle", settings.ca_path.as_ref()),
    ] {
        let Some(path) = path else { continue };
        File::open(path)
            .with_context(|| format!("cannot read TLS {label} at {}", path.display()))?;
    }
    if settings.require_client_cert && settings.ca_path.is_none() {
        bail!("client certificate verification requires a CA bundle (ca_path)");
    }
    Ok(())
}

fn load_certs(settings: &TlsSettings) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let mut reader = BufReader::new(
        File::open(&settings.cert_path)
            .with_context(|| format!("opening {}", settings.cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("parsing certificates in {}", settings.cert_path.display()))?;
    if certs.is_empty() {
        bail!("no certificates found in {}", settings.cert_path.display());
    }
    Ok(certs)
}

fn load_key(settings: &TlsSettings) -> anyhow::Result<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(
        File::open(&settings.key_path)
            .with_context(|| format!("opening {}", settings.key_path.display()))?,
    );
    rustls_pemfile::private_key(&mut reader)
        .with_context(|| format!("parsing private key in {}", settings.key_path.display()))?
        .with_context(|| format!("no private key found in {}", settings.key_path.display()))
}

fn load_client_roots(settings: &TlsSettings) -> anyhow::Result<RootCertStore> {
    let path = settings
        .ca_path
        .as_ref()
        .expect("checked by validate_materials");
    let mut reader =
        BufReader::new(File::open(path).with_context(|| format!("opening {}", path.display()))?);
    let mut roots = RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut reader) {
        roots
            .add(cert.with_context(|| format!("parsing CA certificate in {}", path.display()))?)
            .context("adding CA certificate to the trust store")?;
    }
    if roots.is_empty() {
        bail!("no CA certificates found in {}", path.display());
    }
    Ok(roots)
}

/// Assemble the acceptor. ALPN advertises `h2, http/1.1` when HTTP/2 is
/// enabled, `http/1.1` alone otherwise.
pub fn acceptor(settings: &TlsSettings, enable_h2: bool) -> anyhow::Result<TlsAcceptor> {
    let versions: &[&rustls::SupportedProtocolVersion] = match settings.min_version {
        TlsVersion::Tls12 => &[&rustls::version::TLS13, &rustls::version::TLS12],
        TlsVersion::Tls13 => &[&rustls::version::TLS13],
    };

    let builder = rustls::ServerConfig::builder_with_protocol_versions(versions);
    let builder = if settings.require_client_cert {
        let roots = load_client_roots(settings)?;
        let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
            .build()
            .context("building the client certificate verifier")?;
        builder.with_client_cert_verifier(verifier)
    } else {
        builder.with_no_client_auth()
    };

    let mut config = builder
        .with_single_cert(load_certs(settings)?, load_key(settings)?)
        .context("assembling the TLS server configuration")?;

    config.alpn_protocols = if enable_h2 {
        vec![b"h2".to_vec(), b"http/1.1".to_vec()]
    } else {
        vec![b"http/1.1".to_vec()]
    };

    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Extract session properties from a completed handshake for the scope.
pub fn session_info(conn: &rustls::ServerConnection) -> TlsInfo {
    TlsInfo {
        protocol: conn
            .protocol_version()
            .map(|v| format!("{v:?}"))
            .unwrap_or_else(|| "unknown".to_string()),
        cipher: conn
            .negotiated_cipher_suite()
            .map(|s| format!("{:?}", s.suite()))
            .unwrap_or_else(|| "unknown".to_string()),
        alpn: conn
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned()),
        sni_hostname: conn.server_name().map(str::to_string),
        client_cert_verified: conn.peer_certificates().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TlsSettings;

    #[test]
    fn missing_certificate_fails_fast() {
        let settings = TlsSettings::new("/nonexistent/cert.pem", "/nonexistent/key.pem");
        let err = validate_materials(&settings).unwrap_err();
        assert!(err.to_string().contains("certificate"));
    }

    #[test]
    fn client_verification_requires_ca() {
        let dir = std::env::temp_dir();
        let cert = dir.join("pagi-test-cert.pem");
        let key = dir.join("pagi-test-key.pem");
        std::fs::write(&cert, "x").unwrap();
        std::fs::write(&key, "x").unwrap();
        let settings = TlsSettings {
            require_client_cert: true,
            ..TlsSettings::new(&cert, &key)
        };
        let err = validate_materials(&settings).unwrap_err();
        assert!(err.to_string().contains("CA bundle"));
    }
}
