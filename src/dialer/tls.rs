//! TLS variant of the racing dialer.

use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
};

use rustls::{pki_types::ServerName, ClientConfig};
use tokio::net::TcpStream;
use tokio_rustls::{client::TlsStream, TlsConnector};
use tokio_util::sync::CancellationToken;

use super::{Dialer, Error, Transport};

impl<T: Transport + 'static> Dialer<T> {
    /// Dials `host` by racing TLS handshakes across `ips`.
    ///
    /// Identical to [`Dialer::dial`] except that an attempt only counts as
    /// successful once the TLS handshake over its transport connection
    /// completes; a connected transport whose handshake fails is a failed
    /// attempt ([`Error::Handshake`]). Losing handshakes and their
    /// connections are closed under the same rules as the plain race.
    ///
    /// `host` doubles as the TLS server name.
    pub async fn dial_tls(
        &self,
        cancel: CancellationToken,
        host: &str,
        port: u16,
        ips: &[IpAddr],
        tls_config: Arc<ClientConfig>,
    ) -> Result<TlsStream<TcpStream>, Error> {
        if ips.is_empty() {
            return Err(Error::NoAddresses);
        }

        let server_name = ServerName::try_from(host.to_string())
            .map_err(|_| Error::InvalidServerName(host.to_string()))?;
        let connector = TlsConnector::from(tls_config);

        let transport = Arc::clone(&self.transport);
        let make = move |ip: IpAddr| {
            let transport = Arc::clone(&transport);
            let connector = connector.clone();
            let server_name = server_name.clone();
            async move {
                let addr = SocketAddr::new(ip, port);
                let stream = transport
                    .connect(addr)
                    .await
                    .map_err(|source| Error::Connect { addr, source })?;
                connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|source| Error::Handshake { addr, source })
            }
        };
        self.run(cancel, host, ips, make).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Config, Metrics, TcpTransport};
    use std::time::Duration;
    use tokio::{io::AsyncWriteExt, net::TcpListener};

    fn tls_config() -> Arc<ClientConfig> {
        Arc::new(
            ClientConfig::builder()
                .with_root_certificates(rustls::RootCertStore::empty())
                .with_no_client_auth(),
        )
    }

    fn test_dialer(metrics: Option<Arc<Metrics>>) -> Dialer {
        let config = Config {
            enabled: true,
            connection_delay: Duration::from_millis(100),
            metrics_enabled: metrics.is_some(),
            ..Config::default()
        };
        let transport = TcpTransport {
            connect_timeout: Some(Duration::from_secs(5)),
        };
        Dialer::new(transport, config, metrics)
    }

    #[tokio::test]
    async fn empty_address_list_is_rejected() {
        let err = test_dialer(None)
            .dial_tls(CancellationToken::new(), "example.com", 443, &[], tls_config())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::NoAddresses));
    }

    #[tokio::test]
    async fn unusable_server_name_is_rejected() {
        let ips: [IpAddr; 1] = ["127.0.0.1".parse().unwrap()];
        let err = test_dialer(None)
            .dial_tls(
                CancellationToken::new(),
                "not a hostname",
                443,
                &ips,
                tls_config(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidServerName(_)));
    }

    #[tokio::test]
    async fn failed_handshake_is_a_failed_attempt() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            // Speak something that is not TLS and hang up.
            if let Ok((mut sock, _)) = listener.accept().await {
                let _ = sock.write_all(b"220 definitely not tls\r\n").await;
            }
        });

        let metrics = Arc::new(Metrics::new(true, false, None));
        let err = test_dialer(Some(Arc::clone(&metrics)))
            .dial_tls(
                CancellationToken::new(),
                "example.com",
                addr.port(),
                &[addr.ip()],
                tls_config(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Handshake { .. }));

        metrics.with_connection_attempts(|attempts| {
            assert_eq!(attempts.len(), 1);
            assert!(!attempts[0].success);
            assert!(!attempts[0].winner);
        });
    }
}
