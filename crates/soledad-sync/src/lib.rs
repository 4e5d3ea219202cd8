//! Blob Manager and Synchronizer: the two components that drive a client's
//! local encrypted blob store into agreement with the remote server
//! (spec §4.4, §4.5).

#![deny(unsafe_code)]

mod blob_manager;
mod config;
mod locks;
mod synchronizer;

pub use blob_manager::BlobManager;
pub use config::SyncConfig;
pub use synchronizer::Synchronizer;

#[cfg(test)]
mod tests {
    use std::collections::{HashMap, HashSet};
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    use soledad_codec::MasterSecret;
    use soledad_core::SyncStatus;
    use soledad_http::HttpTransport;
    use soledad_local_store::LocalStore;

    use super::*;

    #[derive(Default)]
    struct MockState {
        blobs: HashMap<String, Vec<u8>>,
        tombstones: HashSet<String>,
    }

    type Backing = Arc<Mutex<MockState>>;

    /// A minimal in-memory blob server: GET/PUT/DELETE on `/blobs/<id>`,
    /// LIST on `/blobs` (and, with `?deleted=true`, the tombstone listing).
    /// Good enough to drive `BlobManager`/`Synchronizer` end to end without
    /// a real object-storage backend. Returns the listening address and a
    /// shared counter of accepted connections, so tests can assert exactly
    /// how many requests were made (e.g. that `get()` never re-contacts the
    /// server for a blob already present locally).
    fn spawn_mock_server(store: Backing, connections: usize) -> (std::net::SocketAddr, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let request_count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&request_count);

        std::thread::spawn(move || {
            for stream in listener.incoming().take(connections) {
                let mut stream = match stream {
                    Ok(s) => s,
                    Err(_) => break,
                };
                counter.fetch_add(1, Ordering::SeqCst);
                let mut buf = [0u8; 8192];
                let n = match stream.read(&mut buf) {
                    Ok(0) | Err(_) => continue,
                    Ok(n) => n,
                };
                let request = String::from_utf8_lossy(&buf[..n]).to_string();
                let mut lines = request.lines();
                let request_line = lines.next().unwrap_or_default().to_string();
                let mut parts = request_line.split_whitespace();
                let method = parts.next().unwrap_or_default().to_string();
                let path = parts.next().unwrap_or_default().to_string();

                let range_header = lines
                    .by_ref()
                    .take_while(|l| !l.is_empty())
                    .find_map(|l| l.strip_prefix("Range: ").map(str::to_string));

                let body_start = request.find("\r\n\r\n").map(|i| i + 4).unwrap_or(request.len());
                let body = request.as_bytes()[body_start.min(request.len())..].to_vec();

                let response = handle_request(&store, &method, &path, body, range_header.as_deref());
                let _ = stream.write_all(&response);
            }
        });

        (addr, request_count)
    }

    fn handle_request(store: &Backing, method: &str, path: &str, body: Vec<u8>, range: Option<&str>) -> Vec<u8> {
        let (path_only, query) = match path.split_once('?') {
            Some((p, q)) => (p, q),
            None => (path, ""),
        };
        let deleted_query = query.split('&').any(|kv| kv == "deleted=true");
        let mut state = store.lock().unwrap();

        if path_only == "/blobs" && method == "GET" {
            let ids: Vec<&str> = if deleted_query {
                state.tombstones.iter().map(String::as_str).collect()
            } else {
                state.blobs.keys().map(String::as_str).collect()
            };
            let json = serde_json::to_vec(&ids).unwrap();
            return http_response(200, &json);
        }

        let blob_id = path_only.trim_start_matches("/blobs/").to_string();
        match method {
            "PUT" => {
                state.blobs.insert(blob_id.clone(), body);
                state.tombstones.remove(&blob_id);
                http_response(200, b"")
            }
            "GET" => match state.blobs.get(&blob_id) {
                Some(bytes) => match range {
                    Some(range) => http_response_for_range(bytes, range),
                    None => http_response_with_tag(200, bytes, "mock-tag"),
                },
                None => http_response(404, b""),
            },
            "DELETE" => {
                if state.blobs.remove(&blob_id).is_some() {
                    state.tombstones.insert(blob_id);
                    http_response(200, b"")
                } else {
                    http_response(404, b"")
                }
            }
            _ => http_response(404, b""),
        }
    }

    fn http_response(status: u16, body: &[u8]) -> Vec<u8> {
        let reason = match status {
            200 => "OK",
            404 => "Not Found",
            _ => "Error",
        };
        let headers = format!(
            "HTTP/1.1 {status} {reason}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let mut out = headers.into_bytes();
        out.extend_from_slice(body);
        out
    }

    fn http_response_with_tag(status: u16, body: &[u8], tag: &str) -> Vec<u8> {
        let reason = match status {
            200 => "OK",
            404 => "Not Found",
            _ => "Error",
        };
        let headers = format!(
            "HTTP/1.1 {status} {reason}\r\nTag: {tag}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        );
        let mut out = headers.into_bytes();
        out.extend_from_slice(body);
        out
    }

    /// Serve a `Range: bytes=<start>-` request (spec §6/S8): `206` with
    /// `Content-Range` for a satisfiable start, `416` with
    /// `Content-Range: bytes */<total>` otherwise.
    fn http_response_for_range(bytes: &[u8], range: &str) -> Vec<u8> {
        let total = bytes.len();
        let start = range.trim_start_matches("bytes=").split('-').next().and_then(|s| s.parse::<usize>().ok());

        match start {
            Some(start) if start < total => {
                let slice = &bytes[start..];
                let end = total - 1;
                let headers = format!(
                    "HTTP/1.1 206 Partial Content\r\nContent-Range: bytes {start}-{end}/{total}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
                    slice.len()
                );
                let mut out = headers.into_bytes();
                out.extend_from_slice(slice);
                out
            }
            _ => format!(
                "HTTP/1.1 416 Range Not Satisfiable\r\nContent-Range: bytes */{total}\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
            )
            .into_bytes(),
        }
    }

    fn manager(addr: std::net::SocketAddr, dir: &std::path::Path) -> BlobManager {
        let local = Arc::new(LocalStore::open(dir).unwrap());
        let http = Arc::new(HttpTransport::new(format!("http://{addr}")));
        let secret = MasterSecret::new([3u8; 96]);
        BlobManager::new(local, http, secret, "", &SyncConfig::default())
    }

    #[tokio::test]
    async fn put_then_get_round_trips_through_a_mock_server() {
        let backing: Backing = Arc::new(Mutex::new(MockState::default()));
        let (addr, requests) = spawn_mock_server(backing, 1);
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(addr, dir.path());

        mgr.put("doc1", b"hello world", false).await.unwrap();
        assert_eq!(mgr.local_sync_status("doc1").unwrap(), SyncStatus::Synced);

        let fetched = mgr.get("doc1").await.unwrap();
        assert_eq!(fetched, b"hello world");
        assert_eq!(
            requests.load(Ordering::SeqCst),
            1,
            "get() must not re-contact the server when the blob already exists locally"
        );
    }

    #[tokio::test]
    async fn duplicate_put_raises_blob_already_exists() {
        let backing: Backing = Arc::new(Mutex::new(MockState::default()));
        let (addr, _requests) = spawn_mock_server(backing, 1);
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(addr, dir.path());

        mgr.put("doc1", b"first", false).await.unwrap();
        let err = mgr.put("doc1", b"second", false).await.unwrap_err();
        assert!(matches!(err, soledad_core::SoledadError::BlobAlreadyExists(_)));
    }

    #[tokio::test]
    async fn local_only_put_never_contacts_the_server() {
        // Bind then immediately drop the listener: any connection attempt
        // fails, so this test fails loudly if `put(local_only = true)` ever
        // tries to upload.
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(addr, dir.path());

        mgr.put("local-doc", b"just for me", true).await.unwrap();
        assert_eq!(mgr.local_sync_status("local-doc").unwrap(), SyncStatus::LocalOnly);
    }

    #[tokio::test]
    async fn fetch_range_returns_the_tail_of_the_blob() {
        let backing: Backing = Arc::new(Mutex::new(MockState::default()));
        backing.lock().unwrap().blobs.insert("ranged".to_string(), b"0123456789".to_vec());
        let (addr, _requests) = spawn_mock_server(backing, 1);
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(addr, dir.path());

        let chunk = mgr.fetch_range("ranged", 5).await.unwrap();
        assert_eq!(chunk, b"56789");
    }

    #[tokio::test]
    async fn fetch_range_past_the_end_is_unsatisfiable() {
        let backing: Backing = Arc::new(Mutex::new(MockState::default()));
        backing.lock().unwrap().blobs.insert("ranged".to_string(), b"0123456789".to_vec());
        let (addr, _requests) = spawn_mock_server(backing, 1);
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(addr, dir.path());

        let err = mgr.fetch_range("ranged", 50).await.unwrap_err();
        assert!(matches!(err, soledad_core::SoledadError::Server(_)));
    }

    #[tokio::test]
    async fn delete_propagates_not_found_from_server() {
        let backing: Backing = Arc::new(Mutex::new(MockState::default()));
        let (addr, _requests) = spawn_mock_server(backing, 1);
        let dir = tempfile::tempdir().unwrap();
        let mgr = manager(addr, dir.path());

        let err = mgr.delete("missing").await.unwrap_err();
        assert!(matches!(err, soledad_core::SoledadError::BlobNotFound(_)));
    }

    #[tokio::test]
    async fn apply_deletions_from_server_removes_tombstoned_blobs_locally() {
        let backing: Backing = Arc::new(Mutex::new(MockState::default()));
        let (addr, _requests) = spawn_mock_server(Arc::clone(&backing), 2);
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(addr, dir.path()));

        mgr.put("gone", b"bye", false).await.unwrap();
        backing.lock().unwrap().tombstones.insert("gone".to_string());

        let sync = Synchronizer::new(Arc::clone(&mgr), &SyncConfig::default());
        sync.apply_deletions_from_server().await.unwrap();

        assert!(!mgr.local_list().unwrap().contains(&"gone".to_string()));
    }

    #[tokio::test]
    async fn synchronizer_pulls_blobs_the_server_already_has() {
        let backing: Backing = Arc::new(Mutex::new(MockState::default()));
        {
            let mut state = backing.lock().unwrap();
            let secret = MasterSecret::new([3u8; 96]);
            let wire = soledad_codec::encrypt("remote-doc", soledad_core::FIXED_REV, &secret, b"from server").unwrap();
            state.blobs.insert("remote-doc".to_string(), wire);
        }
        let (addr, _requests) = spawn_mock_server(backing, 3);
        let dir = tempfile::tempdir().unwrap();
        let mgr = Arc::new(manager(addr, dir.path()));
        let sync = Synchronizer::new(Arc::clone(&mgr), &SyncConfig::default());

        sync.sync().await.unwrap();

        assert_eq!(mgr.local_sync_status("remote-doc").unwrap(), SyncStatus::Synced);
        assert_eq!(sync.metrics().snapshot().1, 1, "one download should have been recorded");
    }
}
