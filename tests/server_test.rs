//! tus Server Integration Tests
//!
//! Runs the server on an ephemeral port and speaks the protocol over HTTP:
//! - Health check and routing errors
//! - Full resumable upload with an interrupted client
//! - Method override for restricted clients
//! - Concatenation over the wire
//! - Bodies above the maximum upload size

use reqwest::{Client, Method, StatusCode};
use std::net::SocketAddr;
use std::sync::Arc;
use tempfile::TempDir;
use tus_server::{FileStore, ProtocolHandler, TusServer, UploadRegistry};

const OFFSET_OCTET_STREAM: &str = "application/offset+octet-stream";

struct TestServer {
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    _dir: TempDir,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with_max(1024 * 1024).await
    }

    async fn start_with_max(max_size: u64) -> Self {
        let dir = TempDir::new().expect("temp dir");
        let store = FileStore::open(dir.path()).await.expect("open store");
        let handler = ProtocolHandler::new(
            Arc::new(UploadRegistry::new()),
            Arc::new(store),
            "/files",
            max_size,
        );
        let server = TusServer::new("127.0.0.1:0", handler)
            .await
            .expect("Failed to create server");
        let addr = server.local_addr();

        let handle = tokio::spawn(async move {
            let _ = server.run().await;
        });

        Self {
            addr,
            handle,
            _dir: dir,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn header(response: &reqwest::Response, name: &str) -> Option<String> {
    response
        .headers()
        .get(name)
        .map(|v| v.to_str().unwrap().to_string())
}

async fn create(client: &Client, server: &TestServer, extra: &[(&str, &str)]) -> String {
    let mut request = client
        .post(server.url("/files"))
        .header("Tus-Resumable", "1.0.0");
    for (name, value) in extra {
        request = request.header(*name, *value);
    }
    let response = request.send().await.unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    header(&response, "location").expect("Location header")
}

#[tokio::test]
async fn test_health_check() {
    let server = TestServer::start().await;
    let response = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[tokio::test]
async fn test_routing_errors() {
    let server = TestServer::start().await;
    let client = Client::new();

    let response = client.post(server.url("/elsewhere")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(header(&response, "tus-resumable").as_deref(), Some("1.0.0"));

    let response = client.delete(server.url("/files/abc")).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(header(&response, "tus-resumable").as_deref(), Some("1.0.0"));
}

#[tokio::test]
async fn test_options_discovery() {
    let server = TestServer::start().await;
    let response = Client::new()
        .request(Method::OPTIONS, server.url("/files"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "tus-version").as_deref(), Some("1.0.0"));
    assert_eq!(header(&response, "tus-max-size").as_deref(), Some("1048576"));
    assert!(header(&response, "tus-extension").unwrap().contains("concatenation"));
}

#[tokio::test]
async fn test_resumable_upload_flow() {
    let server = TestServer::start().await;
    let client = Client::new();
    let content = b"0123456789abcdefghij";

    let location = create(&client, &server, &[("Upload-Length", "20")]).await;
    assert!(location.starts_with("/files/"));
    let url = server.url(&location);

    // First half
    let response = client
        .patch(&url)
        .header("Tus-Resumable", "1.0.0")
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", "0")
        .body(content[..10].to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset").as_deref(), Some("10"));

    // The client lost track of its progress and asks the server
    let response = client
        .head(&url)
        .header("Tus-Resumable", "1.0.0")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(header(&response, "upload-offset").as_deref(), Some("10"));
    assert_eq!(header(&response, "upload-length").as_deref(), Some("20"));
    assert_eq!(header(&response, "cache-control").as_deref(), Some("no-store"));

    // A stale offset is refused
    let response = client
        .patch(&url)
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", "5")
        .body(content[5..].to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    // Resume at the confirmed offset
    let response = client
        .patch(&url)
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", "10")
        .body(content[10..].to_vec())
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset").as_deref(), Some("20"));

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.bytes().await.unwrap().as_ref(), content);
}

#[tokio::test]
async fn test_chunked_upload_of_random_data() {
    let server = TestServer::start().await;
    let client = Client::new();
    let content: Vec<u8> = (0..64 * 1024).map(|_| rand::random::<u8>()).collect();

    let length = content.len().to_string();
    let location = create(&client, &server, &[("Upload-Length", length.as_str())]).await;
    let url = server.url(&location);

    let mut offset: usize = 0;
    for chunk in content.chunks(10_000) {
        let response = client
            .patch(&url)
            .header("Content-Type", OFFSET_OCTET_STREAM)
            .header("Upload-Offset", offset.to_string())
            .body(chunk.to_vec())
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        offset += chunk.len();
        assert_eq!(header(&response, "upload-offset"), Some(offset.to_string()));
    }

    let response = client.get(&url).send().await.unwrap();
    assert_eq!(response.bytes().await.unwrap().as_ref(), content.as_slice());
}

#[tokio::test]
async fn test_oversize_body_rejected() {
    let server = TestServer::start_with_max(16).await;
    let client = Client::new();

    let location = create(&client, &server, &[("Upload-Defer-Length", "1")]).await;
    let url = server.url(&location);

    let response = client
        .patch(&url)
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", "0")
        .body(vec![b'x'; 64])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(header(&response, "tus-resumable").as_deref(), Some("1.0.0"));

    let response = client.head(&url).send().await.unwrap();
    assert_eq!(header(&response, "upload-offset").as_deref(), Some("0"));
}

#[tokio::test]
async fn test_method_override() {
    let server = TestServer::start().await;
    let client = Client::new();

    let location = create(&client, &server, &[("Upload-Length", "3")]).await;

    let response = client
        .post(server.url(&location))
        .header("X-HTTP-Method-Override", "PATCH")
        .header("Content-Type", OFFSET_OCTET_STREAM)
        .header("Upload-Offset", "0")
        .body("abc")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);
    assert_eq!(header(&response, "upload-offset").as_deref(), Some("3"));
}

#[tokio::test]
async fn test_concatenation_over_http() {
    let server = TestServer::start().await;
    let client = Client::new();

    let mut parts = Vec::new();
    for chunk in ["hello ", "tus"] {
        let length = chunk.len().to_string();
        let location = create(
            &client,
            &server,
            &[("Upload-Length", length.as_str()), ("Upload-Concat", "partial")],
        )
        .await;
        let response = client
            .patch(server.url(&location))
            .header("Content-Type", OFFSET_OCTET_STREAM)
            .header("Upload-Offset", "0")
            .body(chunk)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        parts.push(location);
    }

    let concat = format!("final;{}", parts.join(" "));
    let location = create(&client, &server, &[("Upload-Concat", concat.as_str())]).await;

    let response = client.head(server.url(&location)).send().await.unwrap();
    assert_eq!(header(&response, "upload-offset").as_deref(), Some("9"));
    assert_eq!(header(&response, "upload-concat"), Some(concat));

    let response = client.get(server.url(&location)).send().await.unwrap();
    assert_eq!(response.text().await.unwrap(), "hello tus");
}

#[tokio::test]
async fn test_metadata_round_trip() {
    let server = TestServer::start().await;
    let client = Client::new();

    let location = create(
        &client,
        &server,
        &[("Upload-Length", "1"), ("Upload-Metadata", "filename bm90ZXMudHh0")],
    )
    .await;

    let response = client.head(server.url(&location)).send().await.unwrap();
    assert_eq!(
        header(&response, "upload-metadata").as_deref(),
        Some("filename bm90ZXMudHh0")
    );
}
