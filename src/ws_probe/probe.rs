use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_native_tls::{TlsConnector as TokioTlsConnector, TlsStream};
use tokio_tungstenite::{WebSocketStream, client_async, tungstenite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use trust_dns_resolver::TokioAsyncResolver;
use x509_parser::parse_x509_certificate;

use super::prelude::*;
use super::report;

/// Writes the probe-level fields when dropped, so they are set on every exit
/// path, including the probe future being dropped mid-handshake.
struct Finalizer<'a> {
    result: &'a mut ProbeResult,
    probe_start: Instant,
}

impl<'a> Finalizer<'a> {
    fn start(result: &'a mut ProbeResult) -> Self {
        let probe_start = Instant::now();
        result.reset();
        Self {
            result,
            probe_start,
        }
    }
}

impl Drop for Finalizer<'_> {
    fn drop(&mut self) {
        self.result.probe_duration_seconds = self.probe_start.elapsed().as_secs_f64();
        self.result.probe_success = self.result.connection_established;
    }
}

enum Connection {
    Plain(WebSocketStream<TcpStream>),
    Tls(WebSocketStream<TlsStream<TcpStream>>),
}

impl Connection {
    async fn close(self) -> Result<(), tungstenite::Error> {
        match self {
            Connection::Plain(mut ws) => ws.close(None).await,
            Connection::Tls(mut ws) => ws.close(None).await,
        }
    }
}

/// The probe engine.
///
/// Holds the DNS resolver and TLS connector shared by all probes. Neither
/// carries per-probe state: the resolver is built without a cache.
#[derive(Clone)]
pub struct Prober {
    resolver: TokioAsyncResolver,
    connector: TokioTlsConnector,
}

impl Prober {
    pub fn new(resolver: TokioAsyncResolver, connector: TokioTlsConnector) -> Self {
        Self {
            resolver,
            connector,
        }
    }

    /// Probes `target` once and records the outcome in `result`.
    ///
    /// `result` is reset before anything else happens. `deadline` bounds DNS,
    /// TCP, TLS and the upgrade together; `cancel` aborts the attempt early and
    /// is treated like a timeout. Every failure is logged and folded into the
    /// returned `false`.
    pub async fn probe(
        &self,
        target: &str,
        deadline: Duration,
        cancel: &CancellationToken,
        result: &mut ProbeResult,
    ) -> bool {
        let run = Finalizer::start(result);

        if let Err(err) = self.attempt(target, deadline, cancel, &mut *run.result).await {
            if err.is_invalid_target() {
                info!(target_url = target, error = %report(&err), "rejected probe target");
            } else {
                warn!(target_url = target, error = %report(&err), "probe failed");
            }
            run.result.failure = Some(err.reason());
        }

        drop(run);
        result.connection_established
    }

    async fn attempt(
        &self,
        raw: &str,
        deadline: Duration,
        cancel: &CancellationToken,
        result: &mut ProbeResult,
    ) -> Result<(), ProbeError> {
        let target = ProbeTarget::parse(raw)?;

        if cancel.is_cancelled() {
            return Err(ProbeError::Cancelled);
        }
        if deadline.is_zero() {
            return Err(ProbeError::Timeout(deadline));
        }

        debug!(target_url = %target, ?deadline, "connecting");
        let connect_start = Instant::now();

        let connection = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(ProbeError::Cancelled),
            outcome = tokio::time::timeout(deadline, self.handshake(&target, result)) => {
                outcome.unwrap_or_else(|_| Err(ProbeError::Timeout(deadline)))
            }
        }?;

        let elapsed = connect_start.elapsed();
        result.connection_duration_seconds = elapsed.as_secs_f64();
        result.connection_established = true;
        debug!(
            target_url = %target,
            elapsed_ms = elapsed.as_millis() as u64,
            "connected"
        );

        // Success is decided at handshake completion; teardown only gets what
        // is left of the deadline and its errors are not reported.
        match tokio::time::timeout(deadline.saturating_sub(elapsed), connection.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => debug!(target_url = %target, error = %err, "close failed"),
            Err(_) => debug!(target_url = %target, "close timed out"),
        }

        Ok(())
    }

    async fn handshake(
        &self,
        target: &ProbeTarget,
        result: &mut ProbeResult,
    ) -> Result<Connection, ProbeError> {
        let addrs = self.resolve(target, result).await?;
        let stream = connect_any(target.host(), &addrs).await?;

        if !target.is_secure() {
            let ws = upgrade(target, stream, result).await?;
            return Ok(Connection::Plain(ws));
        }

        let stream = self
            .connector
            .connect(target.host(), stream)
            .await
            .map_err(|source| ProbeError::Tls {
                host: target.host().to_string(),
                source,
            })?;
        result.tls = true;
        result.cert_expiry_seconds = peer_cert_expiry(&stream);

        let ws = upgrade(target, stream, result).await?;
        Ok(Connection::Tls(ws))
    }

    async fn resolve(
        &self,
        target: &ProbeTarget,
        result: &mut ProbeResult,
    ) -> Result<Vec<SocketAddr>, ProbeError> {
        if let Some(ip) = target.ip() {
            return Ok(vec![SocketAddr::new(ip, target.port())]);
        }

        let host = target.host();
        let start = Instant::now();
        let lookup = self.resolver.lookup_ip(host).await;
        result.dns_lookup_seconds = Some(start.elapsed().as_secs_f64());

        let addrs: Vec<SocketAddr> = lookup
            .map_err(|source| ProbeError::Resolve {
                host: host.to_string(),
                source,
            })?
            .iter()
            .map(|ip| SocketAddr::new(ip, target.port()))
            .collect();

        if addrs.is_empty() {
            return Err(ProbeError::NoAddress {
                host: host.to_string(),
            });
        }
        Ok(addrs)
    }
}

/// Connects to the first address in `addrs` that accepts, in order.
/// The error of the last attempt is returned when none does.
async fn connect_any(host: &str, addrs: &[SocketAddr]) -> Result<TcpStream, ProbeError> {
    let mut last_err = None;
    for &addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(source) => {
                debug!(host, %addr, error = %source, "connect failed, trying next address");
                last_err = Some(ProbeError::Connect { addr, source });
            }
        }
    }
    Err(last_err.unwrap_or_else(|| ProbeError::NoAddress {
        host: host.to_string(),
    }))
}

async fn upgrade<S>(
    target: &ProbeTarget,
    stream: S,
    result: &mut ProbeResult,
) -> Result<WebSocketStream<S>, ProbeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match client_async(target.as_str(), stream).await {
        Ok((ws, response)) => {
            result.status_code = Some(response.status().as_u16());
            Ok(ws)
        }
        Err(tungstenite::Error::Http(response)) => {
            let status = response.status().as_u16();
            result.status_code = Some(status);
            Err(ProbeError::Rejected { status })
        }
        Err(err) => Err(ProbeError::Handshake(Box::new(err))),
    }
}

fn peer_cert_expiry(stream: &TlsStream<TcpStream>) -> Option<f64> {
    let cert = stream.get_ref().peer_certificate().ok().flatten()?;
    let der = cert.to_der().ok()?;
    let (_, parsed) = parse_x509_certificate(&der).ok()?;
    Some(parsed.validity().not_after.timestamp() as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{setup_resolver, setup_tls_connector};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn test_prober() -> Prober {
        prober_with_tls(false)
    }

    fn prober_with_tls(insecure_skip_verify: bool) -> Prober {
        let resolver = setup_resolver(&[]);
        let connector =
            setup_tls_connector(insecure_skip_verify).expect("Failed to build TLS connector");
        Prober::new(resolver, connector)
    }

    /// A throwaway certificate for `localhost`, valid for 30 days.
    fn self_signed_identity() -> native_tls::Identity {
        use openssl::asn1::Asn1Time;
        use openssl::bn::{BigNum, MsbOption};
        use openssl::hash::MessageDigest;
        use openssl::pkey::PKey;
        use openssl::rsa::Rsa;
        use openssl::x509::extension::SubjectAlternativeName;
        use openssl::x509::{X509, X509NameBuilder};

        let key = PKey::from_rsa(Rsa::generate(2048).unwrap()).unwrap();

        let mut name = X509NameBuilder::new().unwrap();
        name.append_entry_by_text("CN", "localhost").unwrap();
        let name = name.build();

        let mut serial = BigNum::new().unwrap();
        serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

        let mut builder = X509::builder().unwrap();
        builder.set_version(2).unwrap();
        builder
            .set_serial_number(&serial.to_asn1_integer().unwrap())
            .unwrap();
        builder.set_subject_name(&name).unwrap();
        builder.set_issuer_name(&name).unwrap();
        builder.set_pubkey(&key).unwrap();
        builder
            .set_not_before(&Asn1Time::days_from_now(0).unwrap())
            .unwrap();
        builder
            .set_not_after(&Asn1Time::days_from_now(30).unwrap())
            .unwrap();
        let san = SubjectAlternativeName::new()
            .dns("localhost")
            .build(&builder.x509v3_context(None, None))
            .unwrap();
        builder.append_extension(san).unwrap();
        builder.sign(&key, MessageDigest::sha256()).unwrap();
        let cert = builder.build();

        native_tls::Identity::from_pkcs8(
            &cert.to_pem().unwrap(),
            &key.private_key_to_pem_pkcs8().unwrap(),
        )
        .unwrap()
    }

    /// A `wss` server presenting a self-signed certificate for `localhost`.
    async fn spawn_tls_ws_server() -> SocketAddr {
        let acceptor = native_tls::TlsAcceptor::new(self_signed_identity()).unwrap();
        let acceptor = tokio_native_tls::TlsAcceptor::from(acceptor);
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let Ok(stream) = acceptor.accept(stream).await else {
                        return;
                    };
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        drop(ws);
                    }
                });
            }
        });
        addr
    }

    async fn spawn_ws_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    if let Ok(ws) = tokio_tungstenite::accept_async(stream).await {
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        drop(ws);
                    }
                });
            }
        });
        addr
    }

    /// Accepts TCP connections and never answers the upgrade request.
    async fn spawn_silent_server() -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });
        addr
    }

    async fn spawn_rejecting_server(status_line: &'static str) -> SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            while let Ok((mut stream, _)) = listener.accept().await {
                tokio::spawn(async move {
                    let mut buf = [0u8; 4096];
                    let _ = stream.read(&mut buf).await;
                    let response = format!(
                        "HTTP/1.1 {status_line}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
                    );
                    let _ = stream.write_all(response.as_bytes()).await;
                    let _ = stream.shutdown().await;
                });
            }
        });
        addr
    }

    #[tokio::test]
    async fn test_probe_successful_handshake() {
        let addr = spawn_ws_server().await;
        let prober = test_prober();
        let mut result = ProbeResult::new();

        let ok = prober
            .probe(
                &format!("ws://{addr}/"),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(ok);
        assert!(result.connection_established);
        assert!(result.probe_success);
        assert!(result.connection_duration_seconds > 0.0);
        assert!(result.probe_duration_seconds > 0.0);
        assert!(result.probe_duration_seconds >= result.connection_duration_seconds);
        assert_eq!(result.status_code, Some(101));
        assert!(!result.tls);
        assert_eq!(result.dns_lookup_seconds, None);
        assert_eq!(result.failure, None);
    }

    #[tokio::test]
    async fn test_probe_defaults_missing_scheme_to_ws() {
        let addr = spawn_ws_server().await;
        let mut result = ProbeResult::new();

        let ok = test_prober()
            .probe(
                &format!("{addr}/"),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(ok);
        assert!(result.probe_success);
    }

    #[tokio::test]
    async fn test_probe_rejects_other_schemes_without_connecting() {
        let mut result = ProbeResult::new();

        let ok = test_prober()
            .probe(
                "http://127.0.0.1:1/",
                Duration::from_secs(1),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(!ok);
        assert!(!result.probe_success);
        assert!(!result.connection_established);
        assert_eq!(result.connection_duration_seconds, 0.0);
        assert_eq!(result.status_code, None);
        assert_eq!(result.failure, Some(FailureReason::DisallowedScheme));
    }

    #[tokio::test]
    async fn test_probe_malformed_targets() {
        let prober = test_prober();
        for target in ["://bad", "", "ws://", "invalid://url"] {
            let mut result = ProbeResult::new();
            let ok = prober
                .probe(
                    target,
                    Duration::from_secs(1),
                    &CancellationToken::new(),
                    &mut result,
                )
                .await;
            assert!(!ok, "{target:?} should fail");
            assert!(!result.probe_success);
            assert!(result.failure.is_some());
        }
    }

    #[tokio::test]
    async fn test_probe_already_cancelled() {
        let addr = spawn_ws_server().await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut result = ProbeResult::new();

        let start = Instant::now();
        let ok = test_prober()
            .probe(
                &format!("ws://{addr}/"),
                Duration::from_secs(5),
                &cancel,
                &mut result,
            )
            .await;

        assert!(!ok);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(result.failure, Some(FailureReason::Cancelled));
        assert_eq!(result.status_code, None);
    }

    #[tokio::test]
    async fn test_failed_probe_after_success_drops_stale_values() {
        let addr = spawn_ws_server().await;
        let prober = test_prober();
        let cancel = CancellationToken::new();
        let mut result = ProbeResult::new();

        assert!(
            prober
                .probe(&format!("ws://{addr}/"), Duration::from_secs(1), &cancel, &mut result)
                .await
        );
        assert!(result.connection_established);

        assert!(
            !prober
                .probe("invalid://url", Duration::from_secs(1), &cancel, &mut result)
                .await
        );
        assert!(!result.connection_established);
        assert!(!result.probe_success);
        assert_eq!(result.connection_duration_seconds, 0.0);
        assert_eq!(result.status_code, None);
    }

    #[tokio::test]
    async fn test_probe_records_rejected_upgrade() {
        let addr = spawn_rejecting_server("403 Forbidden").await;
        let mut result = ProbeResult::new();

        let ok = test_prober()
            .probe(
                &format!("ws://{addr}/"),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(!ok);
        assert_eq!(result.status_code, Some(403));
        assert_eq!(result.failure, Some(FailureReason::Connection));
        assert_eq!(result.connection_duration_seconds, 0.0);
    }

    #[tokio::test]
    async fn test_probe_connection_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let mut result = ProbeResult::new();

        let ok = test_prober()
            .probe(
                &format!("ws://{addr}/"),
                Duration::from_secs(1),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(!ok);
        assert_eq!(result.failure, Some(FailureReason::Connection));
    }

    #[tokio::test]
    async fn test_probe_times_out_on_silent_server() {
        let addr = spawn_silent_server().await;
        let mut result = ProbeResult::new();

        let start = Instant::now();
        let ok = test_prober()
            .probe(
                &format!("ws://{addr}/"),
                Duration::from_millis(100),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(!ok);
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(result.failure, Some(FailureReason::Timeout));
        assert!(result.probe_duration_seconds >= 0.1);
    }

    #[tokio::test]
    async fn test_probe_cancelled_mid_handshake() {
        let addr = spawn_silent_server().await;
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            trigger.cancel();
        });
        let mut result = ProbeResult::new();

        let start = Instant::now();
        let ok = test_prober()
            .probe(
                &format!("ws://{addr}/"),
                Duration::from_secs(10),
                &cancel,
                &mut result,
            )
            .await;

        assert!(!ok);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(result.failure, Some(FailureReason::Cancelled));
        assert!(!result.connection_established);
    }

    #[tokio::test]
    async fn test_dropped_probe_still_finalizes() {
        let addr = spawn_silent_server().await;
        let prober = test_prober();
        let mut result = ProbeResult {
            probe_success: true,
            connection_established: true,
            ..ProbeResult::default()
        };

        let target = format!("ws://{addr}/");
        let cancel = CancellationToken::new();
        let outer = tokio::time::timeout(
            Duration::from_millis(50),
            prober.probe(&target, Duration::from_secs(10), &cancel, &mut result),
        )
        .await;

        assert!(outer.is_err());
        assert!(!result.probe_success);
        assert!(!result.connection_established);
        assert!(result.probe_duration_seconds > 0.0);
    }

    #[tokio::test]
    async fn test_zero_deadline_fails_immediately() {
        let addr = spawn_ws_server().await;
        let mut result = ProbeResult::new();

        let ok = test_prober()
            .probe(
                &format!("ws://{addr}/"),
                Duration::ZERO,
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(!ok);
        assert_eq!(result.failure, Some(FailureReason::Timeout));
    }

    #[tokio::test]
    async fn test_secure_handshake_records_tls_details() {
        let addr = spawn_tls_ws_server().await;
        let mut result = ProbeResult::new();

        let ok = prober_with_tls(true)
            .probe(
                &format!("wss://localhost:{}/", addr.port()),
                Duration::from_secs(5),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(ok, "{result:?}");
        assert!(result.tls);
        assert_eq!(result.status_code, Some(101));
        assert!(result.dns_lookup_seconds.is_some());
        let expiry = result.cert_expiry_seconds.expect("certificate expiry");
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs_f64();
        assert!(expiry > now);

        let body = crate::metrics::render_probe_result(&result).unwrap();
        assert!(body.contains("probe_websocket_ssl 1"), "{body}");
        assert!(body.contains("probe_ssl_earliest_cert_expiry"), "{body}");
    }

    #[tokio::test]
    async fn test_secure_handshake_rejects_untrusted_certificate() {
        let addr = spawn_tls_ws_server().await;
        let mut result = ProbeResult::new();

        let ok = prober_with_tls(false)
            .probe(
                &format!("wss://localhost:{}/", addr.port()),
                Duration::from_secs(5),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(!ok);
        assert!(!result.tls);
        assert_eq!(result.cert_expiry_seconds, None);
        assert_eq!(result.status_code, None);
        assert_eq!(result.failure, Some(FailureReason::Connection));
    }

    #[tokio::test]
    async fn test_host_name_target_records_dns_lookup() {
        let addr = spawn_ws_server().await;
        let mut result = ProbeResult::new();

        let ok = test_prober()
            .probe(
                &format!("ws://localhost:{}/", addr.port()),
                Duration::from_secs(5),
                &CancellationToken::new(),
                &mut result,
            )
            .await;

        assert!(ok, "{result:?}");
        assert!(result.dns_lookup_seconds.is_some());
        assert_eq!(result.status_code, Some(101));
    }

    #[tokio::test]
    async fn test_connect_any_skips_dead_addresses() {
        let live = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let live_addr = live.local_addr().unwrap();
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let stream = connect_any("localhost", &[dead_addr, live_addr])
            .await
            .expect("second address accepts");
        assert_eq!(stream.peer_addr().unwrap(), live_addr);

        let err = connect_any("localhost", &[dead_addr]).await.unwrap_err();
        assert!(matches!(err, ProbeError::Connect { addr, .. } if addr == dead_addr));

        let err = connect_any("localhost", &[]).await.unwrap_err();
        assert!(matches!(err, ProbeError::NoAddress { .. }));
    }
}
