//! Integration tests for slinger-capture

use slinger_capture::{
  CapturedEntry, CertificateAuthority, CertificateManager, MitmConfig, MitmProxy,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::{TlsAcceptor, TlsConnector};

const PAGE: &str = "<html><head><title>東京</title></head><body>ok</body></html>";

fn proxy_config(dir: &tempfile::TempDir, domains: &[&str]) -> MitmConfig {
  let mut config = MitmConfig {
    ca_storage_path: dir.path().join("ca"),
    listen_addr: "127.0.0.1:0".to_string(),
    upstream_insecure: true,
    shutdown_grace: 2,
    ..Default::default()
  };
  config.capture.domains = domains.iter().map(|d| d.to_string()).collect();
  config.capture.output_path = dir.path().join("capture.json");
  config
}

struct RunningProxy {
  addr: SocketAddr,
  proxy: Arc<MitmProxy>,
  stop: oneshot::Sender<()>,
  task: JoinHandle<slinger_capture::Result<slinger_capture::ExportReport>>,
}

async fn start_proxy(config: MitmConfig) -> RunningProxy {
  let proxy = Arc::new(MitmProxy::new(config).await.unwrap());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (stop, stopped) = oneshot::channel::<()>();
  let serving = proxy.clone();
  let task = tokio::spawn(async move {
    serving
      .serve(listener, async {
        let _ = stopped.await;
      })
      .await
  });
  RunningProxy {
    addr,
    proxy,
    stop,
    task,
  }
}

fn html_response() -> Vec<u8> {
  format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n{}",
    PAGE.len(),
    PAGE
  )
  .into_bytes()
}

async fn read_request_head<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
  let mut head = Vec::new();
  let mut byte = [0u8; 1];
  while !head.ends_with(b"\r\n\r\n") {
    if stream.read(&mut byte).await.unwrap() == 0 {
      break;
    }
    head.push(byte[0]);
  }
  head
}

/// TLS origin for `localhost` answering one request, then waiting for close
async fn start_tls_origin() -> SocketAddr {
  let (cert_pem, key_pem) = CertificateAuthority::generate_pem().unwrap();
  let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
  let entry = ca.issue_leaf("localhost", time::Duration::days(1)).unwrap();
  let acceptor = TlsAcceptor::from(entry.server_config());
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  tokio::spawn(async move {
    let (tcp, _) = listener.accept().await.unwrap();
    let mut tls = acceptor.accept(tcp).await.unwrap();
    read_request_head(&mut tls).await;
    tls.write_all(&html_response()).await.unwrap();
    tls.flush().await.unwrap();
    let mut rest = Vec::new();
    let _ = tls.read_to_end(&mut rest).await;
  });
  addr
}

fn client_tls(ca_pem: &str) -> TlsConnector {
  let mut roots = RootCertStore::empty();
  for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
    roots.add(cert.unwrap()).unwrap();
  }
  let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
  let config = ClientConfig::builder_with_provider(provider)
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  TlsConnector::from(Arc::new(config))
}

async fn open_tunnel(proxy: SocketAddr, authority: &str) -> TcpStream {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let connect = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", authority);
  stream.write_all(connect.as_bytes()).await.unwrap();
  let reply = read_request_head(&mut stream).await;
  assert!(
    reply.starts_with(b"HTTP/1.1 200 Connection Established"),
    "unexpected CONNECT reply: {}",
    String::from_utf8_lossy(&reply)
  );
  stream
}

#[tokio::test]
async fn test_ca_generation() {
  let dir = tempfile::tempdir().unwrap();
  let config = MitmConfig {
    ca_storage_path: dir.path().join("ca"),
    ..Default::default()
  };
  let manager = CertificateManager::from_config(&config).await.unwrap();
  assert!(manager.ca_cert_pem().contains("BEGIN CERTIFICATE"), "Invalid PEM format");
  let ca_path = manager.ca_cert_path().unwrap();
  assert!(ca_path.exists(), "CA certificate file not created");

  // the stored root is reused on the next start
  let again = CertificateManager::from_config(&config).await.unwrap();
  assert_eq!(manager.ca_cert_pem(), again.ca_cert_pem());
}

#[tokio::test]
async fn test_server_cert_caching() {
  let (cert_pem, key_pem) = CertificateAuthority::generate_pem().unwrap();
  let ca = CertificateAuthority::from_pem(&cert_pem, &key_pem).unwrap();
  let manager = CertificateManager::new(ca, time::Duration::days(30));

  let first = manager.issue_leaf_certificate("www.cityheaven.net").await.unwrap();
  let second = manager.issue_leaf_certificate("WWW.CityHeaven.net").await.unwrap();
  assert!(Arc::ptr_eq(&first, &second), "leaf was not cached");
  assert_eq!(first.cert_chain().len(), 2, "Expected leaf + root chain");
  assert_eq!(manager.issued_count(), 1);
}

#[tokio::test]
async fn test_connect_tunnel_is_intercepted_and_recorded() {
  let dir = tempfile::tempdir().unwrap();
  let origin = start_tls_origin().await;
  let running = start_proxy(proxy_config(&dir, &["localhost"])).await;

  let authority = format!("localhost:{}", origin.port());
  let tunnel = open_tunnel(running.addr, &authority).await;
  let connector = client_tls(running.proxy.ca_cert_pem());
  let server_name = ServerName::try_from("localhost").unwrap();
  let mut tls = connector.connect(server_name, tunnel).await.unwrap();

  let request = format!("GET /page?q=1 HTTP/1.1\r\nHost: {}\r\n\r\n", authority);
  tls.write_all(request.as_bytes()).await.unwrap();
  let expected = html_response();
  let mut received = vec![0u8; expected.len()];
  tls.read_exact(&mut received).await.unwrap();
  assert_eq!(received, expected, "response was altered in transit");
  drop(tls);

  running.stop.send(()).unwrap();
  let report = running.task.await.unwrap().unwrap();
  assert_eq!(report.count, 1);

  let text = std::fs::read_to_string(dir.path().join("capture.json")).unwrap();
  let entries: Vec<CapturedEntry> = serde_json::from_str(&text).unwrap();
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].method, "GET");
  assert_eq!(entries[0].url, format!("https://{}/page?q=1", authority));
  assert_eq!(entries[0].response.status, 200);
  assert_eq!(entries[0].response.body, PAGE);
  assert_eq!(
    entries[0].response.headers.get("content-type"),
    Some("text/html; charset=utf-8")
  );
}

#[tokio::test]
async fn test_unreachable_origin_gets_bad_gateway() {
  let dir = tempfile::tempdir().unwrap();
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = closed.local_addr().unwrap().port();
  drop(closed);
  let running = start_proxy(proxy_config(&dir, &["localhost"])).await;

  let tunnel = open_tunnel(running.addr, &format!("localhost:{}", port)).await;
  let connector = client_tls(running.proxy.ca_cert_pem());
  let server_name = ServerName::try_from("localhost").unwrap();
  let mut tls = connector.connect(server_name, tunnel).await.unwrap();
  let mut response = Vec::new();
  let _ = tls.read_to_end(&mut response).await;
  assert!(
    response.starts_with(b"HTTP/1.1 502 Bad Gateway"),
    "unexpected response: {}",
    String::from_utf8_lossy(&response)
  );

  running.stop.send(()).unwrap();
  let report = running.task.await.unwrap().unwrap();
  assert_eq!(report.count, 0);
}

#[tokio::test]
async fn test_plain_http_is_forwarded_and_recorded() {
  let dir = tempfile::tempdir().unwrap();
  let origin = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let origin_addr = origin.local_addr().unwrap();
  let origin_task = tokio::spawn(async move {
    let (mut stream, _) = origin.accept().await.unwrap();
    let head = read_request_head(&mut stream).await;
    stream.write_all(&html_response()).await.unwrap();
    head
  });
  let running = start_proxy(proxy_config(&dir, &["127.0.0.1"])).await;

  let mut client = TcpStream::connect(running.addr).await.unwrap();
  let request = format!("GET http://{0}/list HTTP/1.1\r\nHost: {0}\r\n\r\n", origin_addr);
  client.write_all(request.as_bytes()).await.unwrap();
  let expected = html_response();
  let mut received = vec![0u8; expected.len()];
  client.read_exact(&mut received).await.unwrap();
  assert_eq!(received, expected);
  drop(client);

  // the origin saw the request exactly as the client sent it
  assert_eq!(origin_task.await.unwrap(), request.into_bytes());

  running.stop.send(()).unwrap();
  running.task.await.unwrap().unwrap();
  let entries: Vec<CapturedEntry> =
    serde_json::from_str(&std::fs::read_to_string(dir.path().join("capture.json")).unwrap())
      .unwrap();
  assert_eq!(entries.len(), 1);
  assert_eq!(entries[0].url, format!("http://{}/list", origin_addr));
}

fn text_response(body: &str) -> Vec<u8> {
  format!(
    "HTTP/1.1 200 OK\r\nContent-Type: text/html\r\nContent-Length: {}\r\n\r\n{}",
    body.len(),
    body
  )
  .into_bytes()
}

/// Plain origin answering one request with `body`, keeping the connection
async fn start_plain_origin(body: &'static str) -> (SocketAddr, oneshot::Receiver<Vec<u8>>) {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let addr = listener.local_addr().unwrap();
  let (seen, head) = oneshot::channel();
  tokio::spawn(async move {
    let (mut stream, _) = listener.accept().await.unwrap();
    let request = read_request_head(&mut stream).await;
    stream.write_all(&text_response(body)).await.unwrap();
    let _ = seen.send(request);
    let mut rest = Vec::new();
    let _ = stream.read_to_end(&mut rest).await;
  });
  (addr, head)
}

#[tokio::test]
async fn test_keep_alive_requests_reach_their_own_origins() {
  let dir = tempfile::tempdir().unwrap();
  let (first, first_seen) = start_plain_origin("AAAA").await;
  let (second, second_seen) = start_plain_origin("BBBB").await;
  let running = start_proxy(proxy_config(&dir, &["127.0.0.1"])).await;

  let mut client = TcpStream::connect(running.addr).await.unwrap();
  for (origin, body) in [(first, "AAAA"), (second, "BBBB")] {
    let request = format!("GET http://{0}/page HTTP/1.1\r\nHost: {0}\r\n\r\n", origin);
    client.write_all(request.as_bytes()).await.unwrap();
    let expected = text_response(body);
    let mut received = vec![0u8; expected.len()];
    client.read_exact(&mut received).await.unwrap();
    assert_eq!(
      String::from_utf8_lossy(&received),
      String::from_utf8_lossy(&expected),
      "wrong origin answered the request for {}",
      origin
    );
  }
  drop(client);

  let first_head = String::from_utf8(first_seen.await.unwrap()).unwrap();
  let second_head = String::from_utf8(second_seen.await.unwrap()).unwrap();
  assert!(first_head.starts_with(&format!("GET http://{}/page ", first)));
  assert!(second_head.starts_with(&format!("GET http://{}/page ", second)));

  running.stop.send(()).unwrap();
  let report = running.task.await.unwrap().unwrap();
  assert_eq!(report.count, 2);
  let entries: Vec<CapturedEntry> =
    serde_json::from_str(&std::fs::read_to_string(&report.path).unwrap()).unwrap();
  let mut urls: Vec<_> = entries.iter().map(|e| (e.url.clone(), e.response.body.clone())).collect();
  urls.sort();
  let mut expected = vec![
    (format!("http://{}/page", first), "AAAA".to_string()),
    (format!("http://{}/page", second), "BBBB".to_string()),
  ];
  expected.sort();
  assert_eq!(urls, expected);
}

#[tokio::test]
async fn test_direct_tls_is_routed_by_sni() {
  let dir = tempfile::tempdir().unwrap();
  let origin = start_tls_origin().await;
  let mut config = proxy_config(&dir, &["localhost"]);
  config.transparent_tls_port = origin.port();
  let running = start_proxy(config).await;

  // No CONNECT: the ClientHello goes straight to the proxy port
  let stream = TcpStream::connect(running.addr).await.unwrap();
  let connector = client_tls(running.proxy.ca_cert_pem());
  let server_name = ServerName::try_from("localhost").unwrap();
  let mut tls = connector.connect(server_name, stream).await.unwrap();

  let authority = format!("localhost:{}", origin.port());
  let request = format!("GET /sni HTTP/1.1\r\nHost: {}\r\n\r\n", authority);
  tls.write_all(request.as_bytes()).await.unwrap();
  let expected = html_response();
  let mut received = vec![0u8; expected.len()];
  tls.read_exact(&mut received).await.unwrap();
  assert_eq!(received, expected);
  drop(tls);

  running.stop.send(()).unwrap();
  let report = running.task.await.unwrap().unwrap();
  assert_eq!(report.count, 1);
  let entries: Vec<CapturedEntry> =
    serde_json::from_str(&std::fs::read_to_string(&report.path).unwrap()).unwrap();
  assert_eq!(entries[0].url, format!("https://{}/sni", authority));
  assert_eq!(entries[0].response.body, PAGE);
}

#[tokio::test]
async fn test_empty_session_exports_empty_array() {
  let dir = tempfile::tempdir().unwrap();
  let running = start_proxy(proxy_config(&dir, &["cityheaven.net"])).await;
  running.stop.send(()).unwrap();
  let report = running.task.await.unwrap().unwrap();
  assert_eq!(report.count, 0);
  assert_eq!(report.path, dir.path().join("capture.json"));
  let text = std::fs::read_to_string(&report.path).unwrap();
  assert_eq!(text.trim(), "[]");
}
