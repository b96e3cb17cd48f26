//! Raw `tokio_postgres` connections for the COPY channel.
//!
//! sqlx pools cannot drive `COPY ... FROM STDIN`, so the bulk loader opens its
//! own client here and negotiates TLS the same way libpq would for `sslmode`.

use anyhow::{anyhow, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, RootCertStore};
use rustls_native_certs::load_native_certs;
use std::sync::Arc;
use tokio_postgres::{Client, NoTls};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{info, warn};
use webpki_roots::TLS_SERVER_ROOTS;

/// Postgres `sslmode=require` means "encrypt" but does not mandate verifying
/// that the server cert chains to a trusted CA.
#[derive(Debug)]
struct SslModeRequireVerifier {
    inner: Arc<dyn ServerCertVerifier>,
}

impl ServerCertVerifier for SslModeRequireVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

fn sslmode_from_querystring(url: &str) -> Option<String> {
    url.split_once('?').and_then(|(_, qs)| {
        qs.split('&').find_map(|kv| match kv.split_once('=') {
            Some((k, v)) if k.eq_ignore_ascii_case("sslmode") => Some(v.to_lowercase()),
            _ => None,
        })
    })
}

fn is_local(url: &str) -> bool {
    url.contains("localhost") || url.contains("127.0.0.1") || url.contains("://0.0.0.0")
}

/// Resolve the effective sslmode; precedence: querystring > PG_SSLMODE env > host heuristic.
pub(crate) fn effective_sslmode(url: &str) -> String {
    if let Some(mode) = sslmode_from_querystring(url) {
        return mode;
    }
    if let Some(mode) = crate::util::env::env_opt("PG_SSLMODE") {
        return mode.to_lowercase();
    }
    if is_local(url) {
        "prefer".to_string()
    } else {
        "require".to_string()
    }
}

async fn connect_tls(url: &str, sslmode: &str) -> Result<Client> {
    let mut roots = RootCertStore::empty();
    let native = load_native_certs();
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    roots.extend(TLS_SERVER_ROOTS.iter().cloned());

    let config = if matches!(sslmode, "verify-ca" | "verify-full") {
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    } else {
        let inner: Arc<dyn ServerCertVerifier> =
            WebPkiServerVerifier::builder(roots.into()).build()?;
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SslModeRequireVerifier { inner }))
            .with_no_client_auth()
    };
    let tls = MakeRustlsConnect::new(config);
    let (client, conn) = tokio_postgres::connect(url, tls).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::error!(error = %e, "postgres copy connection error");
        }
    });
    Ok(client)
}

async fn connect_notls(url: &str) -> Result<Client> {
    let (client, conn) = tokio_postgres::connect(url, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = conn.await {
            tracing::error!(error = %e, "postgres copy connection error");
        }
    });
    Ok(client)
}

/// Connect to Postgres using TLS by default, but honor sslmode overrides.
///
/// - `disable` uses plaintext.
/// - `prefer` tries TLS first and falls back to plaintext on local hosts.
/// - anything else requires TLS.
pub async fn connect_postgres_auto(url: &str) -> Result<Client> {
    let sslmode = effective_sslmode(url);
    let client = match sslmode.as_str() {
        "disable" => connect_notls(url).await?,
        "prefer" => match connect_tls(url, &sslmode).await {
            Ok(c) => c,
            Err(e) if is_local(url) => {
                warn!(error = %e, "TLS failed in prefer mode on local host; falling back to plaintext");
                connect_notls(url).await?
            }
            Err(e) => return Err(anyhow!("TLS connection failed (sslmode=prefer, non-local): {e}")),
        },
        _ => connect_tls(url, &sslmode).await?,
    };
    info!(sslmode = %sslmode, "copy connection established");
    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn querystring_sslmode_wins() {
        assert_eq!(
            effective_sslmode("postgres://u@db.example.com/forum?sslmode=disable"),
            "disable"
        );
        assert_eq!(
            sslmode_from_querystring("postgres://u@h/db?application_name=x&SSLMODE=Verify-Full"),
            Some("verify-full".to_string())
        );
    }
}
