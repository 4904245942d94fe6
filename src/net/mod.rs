use std::{
    net::{SocketAddr, UdpSocket},
    sync::Arc,
    time::{Duration, SystemTime},
};

use quinn::default_runtime;
use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, PrivateKey, ServerName,
};
use tracing::debug;

use crate::{error::NetError, task::WorkerAddr};

pub mod link;
pub mod transport;
pub mod wire;

pub use transport::{Inbound, Transport};
pub use wire::{Channel, Envelope, Message, MessageType};

/// Name every endpoint's certificate is issued for. Peers are addressed by
/// socket address, so the name only has to be consistent.
const SERVER_NAME: &str = "localhost";

/// Frames larger than this are treated as a protocol violation.
pub const MAX_FRAME_LEN: u32 = 256 * 1024 * 1024;

/// Creates a QUIC endpoint bound to `bind` that both accepts and initiates
/// connections. Must be called from within a tokio runtime.
pub fn endpoint(bind: SocketAddr, keep_alive: Duration) -> Result<quinn::Endpoint, NetError> {
    let socket = UdpSocket::bind(bind)?;
    let runtime = default_runtime().ok_or(NetError::NoRuntime)?;

    let (client_tls, server_tls) = tls_config()?;

    // shared transport configuration for the server and client sides
    // this is the default config with the BBR congestion controller enabled
    let mut transport_config = quinn::TransportConfig::default();
    let bbr_config = quinn::congestion::BbrConfig::default();
    transport_config.congestion_controller_factory(Arc::new(bbr_config));
    transport_config.keep_alive_interval(Some(keep_alive));
    let transport_config = Arc::new(transport_config);

    let mut server_config = quinn::ServerConfig::with_crypto(Arc::new(server_tls));
    server_config.transport_config(transport_config.clone());

    let mut client_config = quinn::ClientConfig::new(Arc::new(client_tls));
    client_config.transport_config(transport_config);

    let config = quinn::EndpointConfig::default();
    let mut ep = quinn::Endpoint::new(config, Some(server_config), socket, runtime)?;
    ep.set_default_client_config(client_config);
    debug!(local = %ep.local_addr()?, "endpoint bound");
    Ok(ep)
}

/// Resolves `addr` and connects to it, giving up after `timeout`.
pub async fn dial(
    ep: &quinn::Endpoint,
    addr: &str,
    timeout: Duration,
) -> Result<quinn::Connection, NetError> {
    let attempt = async {
        let remote = tokio::net::lookup_host(addr)
            .await?
            .next()
            .ok_or_else(|| NetError::Resolve(addr.to_owned()))?;
        let conn = ep.connect(remote, SERVER_NAME)?.await?;
        Ok::<_, NetError>(conn)
    };
    match tokio::time::timeout(timeout, attempt).await {
        Ok(result) => result,
        Err(_) => Err(NetError::BrokerUnreachable(addr.to_owned())),
    }
}

/// The address peers should use to reach an endpoint bound at `local`.
pub fn advertised_addr(local: SocketAddr, host: Option<&str>) -> WorkerAddr {
    match host {
        Some(host) => WorkerAddr(format!("{}:{}", host, local.port())),
        None => WorkerAddr(local.to_string()),
    }
}

/// A fresh self-signed certificate per endpoint. Clients accept any server
/// certificate: the cluster is assumed to run on a trusted network.
fn tls_config() -> Result<(rustls::ClientConfig, rustls::ServerConfig), NetError> {
    let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_owned()])?;
    let key = PrivateKey(cert.serialize_private_key_der());
    let cert = Certificate(cert.serialize_der()?);

    let client_config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(SkipServerVerification))
        .with_no_client_auth();

    let server_config = rustls::ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(vec![cert], key)?;

    Ok((client_config, server_config))
}

struct SkipServerVerification;

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn advertised_addr_prefers_configured_host() {
        let local: SocketAddr = "0.0.0.0:7000".parse().unwrap();
        assert_eq!(advertised_addr(local, None).as_str(), "0.0.0.0:7000");
        assert_eq!(
            advertised_addr(local, Some("node-3")).as_str(),
            "node-3:7000"
        );
    }

    #[tokio::test]
    async fn endpoints_connect_over_loopback() {
        let loopback = SocketAddr::from(([127, 0, 0, 1], 0));
        let server = endpoint(loopback, Duration::from_secs(1)).unwrap();
        let client = endpoint(loopback, Duration::from_secs(1)).unwrap();
        let addr = server.local_addr().unwrap().to_string();

        let accept = tokio::spawn(async move {
            let conn = server.accept().await.unwrap().await.unwrap();
            conn.remote_address()
        });
        let conn = dial(&client, &addr, Duration::from_secs(5)).await.unwrap();
        assert_eq!(accept.await.unwrap(), client.local_addr().unwrap());
        conn.close(0u32.into(), b"done");
    }
}
