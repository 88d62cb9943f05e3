//! Integration tests for transport behaviour: deadlines and proxying.

mod support;

use std::time::{Duration, Instant};

use support::init_tracing;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use wiremock::matchers::{body_bytes, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};
use xhttp_client::{
    Client, ClientError, HttpTimeout, ProxyConfig, Request, RequestBody, TransportError,
};

/// A ten-byte body that trickles out one byte every 100ms.
fn trickle_body() -> RequestBody {
    let (mut writer, reader) = tokio::io::duplex(16);
    tokio::spawn(async move {
        for byte in b"0123456789" {
            tokio::time::sleep(Duration::from_millis(100)).await;
            writer.write_all(&[*byte]).await.unwrap();
        }
    });
    RequestBody::limited(reader, 10)
}

fn timeouts(read_write: Duration, header: Duration) -> HttpTimeout {
    HttpTimeout {
        connect_timeout: Duration::from_secs(5),
        read_write_timeout: read_write,
        header_timeout: header,
        long_timeout: Duration::from_secs(60),
        idle_conn_timeout: Duration::from_secs(30),
    }
}

#[tokio::test]
async fn test_header_timeout_is_a_transport_error() {
    init_tracing();
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let client = Client::builder(server.uri())
        .http_timeout(timeouts(Duration::from_secs(30), Duration::from_millis(300)))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = client.send(Request::get("/slow"), None).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(err.is_timeout(), "{err}");
    assert!(matches!(
        err,
        ClientError::Transport {
            source: TransportError::HeaderTimeout(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_slow_upload_is_not_bounded_by_header_timeout() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/up"))
        .and(body_bytes(b"0123456789".to_vec()))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let client = Client::builder(server.uri())
        .enable_md5(false)
        .http_timeout(timeouts(Duration::from_secs(5), Duration::from_millis(500)))
        .build()
        .unwrap();

    let started = Instant::now();
    let response = client
        .send(Request::put("/up").body(trickle_body()), None)
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert!(started.elapsed() >= Duration::from_millis(900));
}

#[tokio::test]
async fn test_header_timeout_applies_after_upload_completes() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let client = Client::builder(server.uri())
        .enable_md5(false)
        .http_timeout(timeouts(Duration::from_secs(5), Duration::from_millis(500)))
        .build()
        .unwrap();

    let err = client
        .send(Request::put("/up").body(trickle_body()), None)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport {
            source: TransportError::HeaderTimeout(_),
            ..
        }
    ));
}

#[tokio::test]
async fn test_requests_run_as_spawned_tasks() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(200))
        .expect(3)
        .mount(&server)
        .await;

    let client = Client::builder(server.uri()).build().unwrap();
    let bodies = [
        RequestBody::from("in memory"),
        RequestBody::reader(&b"unknown length"[..]),
        trickle_body(),
    ];
    let tasks: Vec<_> = bodies
        .into_iter()
        .map(|body| {
            let client = client.clone();
            tokio::spawn(async move { client.send(Request::put("/up").body(body), None).await })
        })
        .collect();
    for task in tasks {
        assert_eq!(task.await.unwrap().unwrap().status(), 200);
    }
}

#[tokio::test]
async fn test_read_deadline_fails_silent_server() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
        .mount(&server)
        .await;

    let client = Client::builder(server.uri())
        .http_timeout(timeouts(Duration::from_millis(300), Duration::from_secs(30)))
        .build()
        .unwrap();

    let started = Instant::now();
    let err = client.send(Request::get("/slow"), None).await.unwrap_err();
    assert!(started.elapsed() < Duration::from_secs(3));
    assert!(err.is_transport(), "{err}");
    assert!(err.is_timeout(), "{err}");
}

#[tokio::test]
async fn test_plain_http_proxy_receives_absolute_form_and_credentials() {
    let proxy = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/thing"))
        .and(header("proxy-authorization", "Basic dTpw"))
        .and(header("host", "service.invalid"))
        .respond_with(ResponseTemplate::new(200).set_body_string("via proxy"))
        .expect(1)
        .mount(&proxy)
        .await;

    let client = Client::builder("http://service.invalid")
        .proxy(ProxyConfig::new(proxy.uri()).with_auth("u", "p"))
        .build()
        .unwrap();
    let mut response = client.send(Request::get("/thing"), None).await.unwrap();
    assert_eq!(response.body_text().await.unwrap(), "via proxy");
}

#[tokio::test]
async fn test_https_through_proxy_opens_connect_tunnel() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let proxy = tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 2048];
        let mut received = Vec::new();
        while !received.ends_with(b"\r\n\r\n") {
            let n = socket.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            received.extend_from_slice(&buf[..n]);
        }
        // Refuse the tunnel; the request itself must fail cleanly.
        socket
            .write_all(b"HTTP/1.1 403 Forbidden\r\n\r\n")
            .await
            .unwrap();
        String::from_utf8(received).unwrap()
    });

    let client = Client::builder("https://secure.example.com")
        .proxy(ProxyConfig::new(addr.to_string()).with_auth("u", "p"))
        .build()
        .unwrap();
    let err = client.send(Request::get("/"), None).await.unwrap_err();
    assert!(err.is_transport(), "{err}");

    let connect = proxy.await.unwrap();
    assert!(connect.starts_with("CONNECT secure.example.com:443 HTTP/1.1\r\n"));
    assert!(connect.contains("Proxy-Authorization: Basic dTpw\r\n"));
}

#[tokio::test]
async fn test_invalid_proxy_is_rejected_at_build() {
    let err = Client::builder("http://127.0.0.1:1")
        .proxy(ProxyConfig::new("socks5://127.0.0.1:1080"))
        .build()
        .unwrap_err();
    assert!(matches!(err, ClientError::InvalidProxy { .. }), "{err}");
}

#[tokio::test]
async fn test_sequential_requests_share_one_client() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200).set_body_string("x"))
        .expect(3)
        .mount(&server)
        .await;

    let client = Client::builder(server.uri()).build().unwrap();
    for _ in 0..3 {
        let mut response = client.send(Request::get("/"), None).await.unwrap();
        response.bytes().await.unwrap();
    }
}
