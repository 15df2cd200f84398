use std::{
    io::{Read as _, Write as _},
    net::SocketAddr,
};

use custom_metrics::{ServerError, server::ServerBuilder};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::TcpStream,
};

/// Bind a server on an ephemeral port and serve it in the background.
async fn spawn_server(builder: ServerBuilder) -> SocketAddr {
    let server = builder.with_address("127.0.0.1:0").bind().await.unwrap();
    let addr = server.local_addr();
    let _ = tokio::spawn(server.serve());
    addr
}

/// Send a single HTTP/1.1 request and return the status code and body.
async fn request(addr: SocketAddr, method: &str, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    let req = format!("{method} {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).await.unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    let status = head.split(' ').nth(1).unwrap().parse().unwrap();
    (status, body.to_owned())
}

async fn get(addr: SocketAddr, path: &str) -> (u16, String) {
    request(addr, "GET", path).await
}

/// Blocking version of [`get`], for tests that run outside a Tokio runtime.
fn blocking_get(addr: SocketAddr, path: &str) -> (u16, String) {
    let mut stream = std::net::TcpStream::connect(addr).unwrap();
    let req = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
    stream.write_all(req.as_bytes()).unwrap();

    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    let (head, body) = response.split_once("\r\n\r\n").unwrap();
    let status = head.split(' ').nth(1).unwrap().parse().unwrap();
    (status, body.to_owned())
}

/// Reserve a free local port by binding to port 0 and releasing it.
fn free_addr() -> SocketAddr {
    std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap()
}

#[tokio::test]
async fn greeting() {
    let addr = spawn_server(ServerBuilder::new()).await;

    assert_eq!(get(addr, "/").await, (200, "Hello World!".to_owned()));
    get(addr, "/set/40").await;
    assert_eq!(get(addr, "/").await, (200, "Hello World!".to_owned()));
}

#[tokio::test]
async fn counter_lifecycle() {
    let addr = spawn_server(ServerBuilder::new()).await;

    assert_eq!(get(addr, "/get").await, (200, "0".to_owned()));
    assert_eq!(get(addr, "/add").await, (200, "1".to_owned()));
    assert_eq!(get(addr, "/add").await, (200, "2".to_owned()));
    assert_eq!(get(addr, "/remove").await, (200, "1".to_owned()));
    assert_eq!(get(addr, "/set/5").await, (200, "5".to_owned()));
    assert_eq!(get(addr, "/get").await, (200, "5".to_owned()));
    assert_eq!(get(addr, "/set/-3").await, (200, "-3".to_owned()));
}

#[tokio::test]
async fn malformed_value_is_rejected() {
    let addr = spawn_server(ServerBuilder::new()).await;
    get(addr, "/set/8").await;

    let (status, body) = get(addr, "/set/abc").await;
    assert_eq!(status, 400);
    assert!(body.contains("The value 'abc' is not valid."));

    // Still serving, value unchanged.
    assert_eq!(get(addr, "/get").await, (200, "8".to_owned()));
}

#[tokio::test]
async fn unknown_routes_and_methods() {
    let addr = spawn_server(ServerBuilder::new()).await;

    assert_eq!(get(addr, "/nothing-here").await.0, 404);
    assert_eq!(request(addr, "POST", "/add").await.0, 405);
    assert_eq!(get(addr, "/get").await, (200, "0".to_owned()));
}

#[tokio::test]
async fn concurrent_requests_are_not_lost() {
    let addr = spawn_server(ServerBuilder::new()).await;

    let tasks: Vec<_> = (0..50)
        .map(|i| {
            let path = if i % 5 == 0 { "/remove" } else { "/add" };
            tokio::spawn(async move { get(addr, path).await })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap().0, 200);
    }

    // 40 adds, 10 removes.
    assert_eq!(get(addr, "/get").await, (200, "30".to_owned()));
}

#[tokio::test]
async fn scrape_endpoint() {
    let addr = spawn_server(ServerBuilder::new().with_path("/internal/metrics/")).await;
    get(addr, "/set/21").await;

    let (status, body) = get(addr, "/internal/metrics").await;
    assert_eq!(status, 200);
    assert!(body.contains("# HELP my_app_num_requests Number of requests."));
    assert!(body.contains("# TYPE my_app_num_requests gauge"));
    assert!(body.contains("my_app_num_requests 21"));

    assert_eq!(get(addr, "/metrics").await.0, 404);
}

#[tokio::test]
async fn scrape_endpoint_with_namespace() {
    let addr = spawn_server(ServerBuilder::new().with_namespace("sample")).await;
    get(addr, "/add").await;

    let (status, body) = get(addr, "/metrics").await;
    assert_eq!(status, 200);
    assert!(body.contains("sample_my_app_num_requests 1"));
}

#[tokio::test]
async fn invalid_configuration() {
    let err = ServerBuilder::new().with_path("/add").install().unwrap_err();
    assert!(matches!(err, ServerError::InvalidPath(path) if path == "/add"));

    let err = ServerBuilder::new().with_address("localhost").install().unwrap_err();
    assert!(matches!(err, ServerError::InvalidAddress(..)));
}

#[test]
fn install_without_runtime() {
    let addr = free_addr();
    ServerBuilder::new().with_address(addr.to_string()).install().unwrap();

    // Served from a dedicated thread with its own runtime.
    assert_eq!(blocking_get(addr, "/add"), (200, "1".to_owned()));
    assert_eq!(blocking_get(addr, "/get"), (200, "1".to_owned()));
}

#[tokio::test]
async fn install_on_current_runtime() {
    let addr = free_addr();
    ServerBuilder::new().with_address(addr.to_string()).install().unwrap();

    assert_eq!(get(addr, "/add").await, (200, "1".to_owned()));
    assert_eq!(get(addr, "/set/%2D5").await, (200, "-5".to_owned()));
}
