//! A web tunnel served by a real client behind the plain HTTP listener

use gank_client::{ClientConfig, TunnelClient, TunnelStatus};
use gank_control::{ServerConfig, TunnelServer};
use gank_server_https::HttpServer;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn local_web_service() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut socket, _) = listener.accept().await.unwrap();
            tokio::spawn(async move {
                let mut head = Vec::new();
                let mut buf = [0u8; 1024];
                while !head.windows(4).any(|w| w == b"\r\n\r\n") {
                    let n = socket.read(&mut buf).await.unwrap();
                    if n == 0 {
                        return;
                    }
                    head.extend_from_slice(&buf[..n]);
                }
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello")
                    .await
                    .unwrap();
            });
        }
    });
    port
}

#[tokio::test]
async fn test_web_tunnel_through_http_listener() {
    let server = TunnelServer::new(ServerConfig {
        bind_ip: IpAddr::V4(Ipv4Addr::LOCALHOST),
        tunnel_port: 0,
        http_port: Some(0),
        ..Default::default()
    });
    let state = server.state();
    let control = server.bind().await.unwrap();
    let control_addr = control.local_addr().unwrap();
    tokio::spawn(async move { server.run(control).await });

    let web_listener = HttpServer::bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let web_addr: SocketAddr = web_listener.local_addr().unwrap();
    let http = Arc::new(HttpServer::plain(state));
    tokio::spawn(async move { http.run(web_listener).await });

    let local_port = local_web_service().await;
    let client = TunnelClient::new(ClientConfig::web(
        control_addr.to_string(),
        local_port,
        "blog",
        None,
    ))
    .start()
    .unwrap();

    let mut status = client.status("blog").unwrap();
    tokio::time::timeout(
        Duration::from_secs(5),
        status.wait_for(|s| matches!(s, TunnelStatus::Ready(_))),
    )
    .await
    .unwrap()
    .unwrap();

    let mut browser = TcpStream::connect(web_addr).await.unwrap();
    browser
        .write_all(b"GET / HTTP/1.1\r\nHost: blog.gank007.com\r\n\r\n")
        .await
        .unwrap();
    let mut response = Vec::new();
    tokio::time::timeout(Duration::from_secs(5), browser.read_to_end(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.starts_with(b"HTTP/1.1 200 OK"));
    assert!(response.ends_with(b"hello"));
}
