use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_rustls::{
    TlsConnector,
    client::TlsStream,
    rustls::{
        ClientConfig, RootCertStore,
        pki_types::{CertificateDer, ServerName, pem::PemObject},
    },
};

use crate::{Error, ErrorKind, Ssl, TurnSocketOptions};

/// Client configuration trusting the authorities of the certificate chain
/// file.
pub fn client_config(ssl: &Ssl) -> Result<Arc<ClientConfig>, Error> {
    let mut roots = RootCertStore::empty();
    for cert in CertificateDer::pem_file_iter(&ssl.certificate_chain).map_err(|e| {
        log::error!("tls load certificate chain failed: path={}, err={e}", ssl.certificate_chain);

        Error::Kind(ErrorKind::Tls)
    })? {
        let cert = cert.map_err(|_| Error::Kind(ErrorKind::Tls))?;
        roots.add(cert).map_err(|_| Error::Kind(ErrorKind::Tls))?;
    }

    Ok(Arc::new(
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth(),
    ))
}

pub fn server_name(ssl: &Ssl, host: &str) -> Result<ServerName<'static>, Error> {
    ServerName::try_from(ssl.server_name.as_deref().unwrap_or(host).to_string())
        .map_err(|_| Error::Kind(ErrorKind::Tls))
}

pub async fn handshake(
    options: &TurnSocketOptions,
    host: &str,
    stream: TcpStream,
) -> Result<TlsStream<TcpStream>, Error> {
    let ssl = options.ssl.as_ref().ok_or(Error::Kind(ErrorKind::Tls))?;
    let connector = TlsConnector::from(client_config(ssl)?);

    connector
        .connect(server_name(ssl, host)?, stream)
        .await
        .map_err(|e| {
            log::warn!("tls handshake failed: host={host}, err={e}");

            Error::Kind(ErrorKind::Tls)
        })
}
