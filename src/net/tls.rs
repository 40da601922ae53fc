//! TLS configuration and certificate loading.

use std::path::Path;

use axum_server::tls_rustls::RustlsConfig;

use crate::config::SslConfig;

/// Load the rustls configuration for a site's certificate and key.
pub async fn load_tls_config(ssl: &SslConfig) -> Result<RustlsConfig, std::io::Error> {
    let cert_path = Path::new(&ssl.certificate);
    let key_path = Path::new(&ssl.key);

    if !cert_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("certificate file not found: {}", cert_path.display()),
        ));
    }
    if !key_path.exists() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("private key file not found: {}", key_path.display()),
        ));
    }

    RustlsConfig::from_pem_file(cert_path, key_path).await
}
