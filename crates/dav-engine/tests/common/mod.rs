//! Shared harness for dav-engine integration tests.
//!
//! Provides an engine over a [`MemoryStore`] and a small in-process HTTP
//! server that speaks just enough WebDAV (PUT, MKCOL, DELETE) to act as the
//! remote side of cross-server transfers.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dav_engine::store::{
    ByteStream, Collection, Document, DocumentSink, MemoryStore, Metadata, Resource, Store,
};
use dav_engine::{
    ActiveLock, DavHandler, DavPath, EngineConfig, HttpTransport, LockRequest, LockResult,
    RemoteConfig, StoreResult,
};
use futures::{StreamExt, stream};
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use url::Url;

static TRACING: Once = Once::new();

/// Install a test subscriber once; filter with `RUST_LOG`.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// Parse a path, panicking on invalid input.
pub fn p(s: &str) -> DavPath {
    DavPath::parse(s).unwrap()
}

/// A request body with the given content, split into `parts` chunks.
pub fn body(content: &[u8], parts: usize) -> dav_engine::store::ByteStream {
    let chunk = content.len().div_ceil(parts.max(1)).max(1);
    let chunks: Vec<std::io::Result<Bytes>> = content
        .chunks(chunk)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks).boxed()
}

/// An engine over an in-memory store.
pub struct TestEngine {
    /// Direct access to the store for setup and assertions.
    pub store: MemoryStore,
    /// The handler under test.
    pub handler: Arc<DavHandler>,
}

impl TestEngine {
    /// Engine with the default configuration.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// Engine with a custom configuration.
    pub fn with_config(config: EngineConfig) -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let handler = DavHandler::builder(Arc::new(store.clone()))
            .config(config)
            .build()
            .expect("valid test config");
        Self {
            store,
            handler: Arc::new(handler),
        }
    }

    /// Engine that can transfer to remote servers over HTTP.
    pub fn with_remote() -> Self {
        init_tracing();
        let store = MemoryStore::new();
        let transport = HttpTransport::new(&RemoteConfig::default()).expect("http client");
        let handler = DavHandler::builder(Arc::new(store.clone()))
            .transport(Arc::new(transport))
            .local_origin(Url::parse("http://localhost:8080/").unwrap())
            .build()
            .expect("valid test config");
        Self {
            store,
            handler: Arc::new(handler),
        }
    }

    /// Engine whose document reads cancel `cancel` as the second chunk is
    /// read. Reads are split into 4-byte chunks.
    pub fn cancelling_reads(cancel: CancellationToken, remote: bool) -> Self {
        init_tracing();
        let store = MemoryStore::with_chunk_size(4);
        let gated = CancellingStore {
            inner: store.clone(),
            cancel,
        };
        let mut builder = DavHandler::builder(Arc::new(gated));
        if remote {
            let transport = HttpTransport::new(&RemoteConfig::default()).expect("http client");
            builder = builder.transport(Arc::new(transport));
        }
        Self {
            store,
            handler: Arc::new(builder.build().expect("valid test config")),
        }
    }

    /// Lock `path` exclusively (depth infinity), panicking on conflict.
    pub async fn lock(&self, path: &str) -> ActiveLock {
        match self.handler.lock(LockRequest::exclusive(p(path))).await {
            Ok(response) => match response.result {
                LockResult::Granted(lock) => lock,
                LockResult::Conflict(blocker) => {
                    panic!("lock on {path} blocked by {}", blocker.token)
                }
            },
            Err(e) => panic!("lock on {path} failed: {e}"),
        }
    }

    /// Content of the document at `path` as UTF-8.
    pub fn text(&self, path: &str) -> Option<String> {
        self.store
            .read(path)
            .map(|b| String::from_utf8_lossy(&b).into_owned())
    }
}

/// [`MemoryStore`] that cancels a token once a read stream is past its
/// first chunk.
struct CancellingStore {
    inner: MemoryStore,
    cancel: CancellationToken,
}

#[async_trait]
impl Store for CancellingStore {
    fn root(&self) -> Collection {
        self.inner.root()
    }

    async fn child(&self, parent: &Collection, name: &str) -> StoreResult<Option<Resource>> {
        self.inner.child(parent, name).await
    }

    async fn list_children(&self, collection: &Collection) -> StoreResult<Vec<Resource>> {
        self.inner.list_children(collection).await
    }

    async fn metadata(&self, resource: &Resource) -> StoreResult<Metadata> {
        self.inner.metadata(resource).await
    }

    async fn open_read(&self, document: &Document) -> StoreResult<ByteStream> {
        let cancel = self.cancel.clone();
        let stream = self.inner.open_read(document).await?;
        Ok(stream
            .enumerate()
            .map(move |(index, chunk)| {
                if index == 1 {
                    cancel.cancel();
                }
                chunk
            })
            .boxed())
    }

    async fn open_write(&self, document: &Document) -> StoreResult<Box<dyn DocumentSink>> {
        self.inner.open_write(document).await
    }

    async fn create_document(&self, parent: &Collection, name: &str) -> StoreResult<Document> {
        self.inner.create_document(parent, name).await
    }

    async fn create_collection(&self, parent: &Collection, name: &str) -> StoreResult<Collection> {
        self.inner.create_collection(parent, name).await
    }

    async fn delete(&self, resource: &Resource) -> StoreResult<()> {
        self.inner.delete(resource).await
    }
}

/// Something stored on the remote test server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEntry {
    Document(Bytes),
    Collection,
}

#[derive(Debug, Default)]
struct RemoteState {
    entries: BTreeMap<String, RemoteEntry>,
    requests: Vec<(Method, String)>,
    failures: HashMap<String, StatusCode>,
}

/// In-process remote WebDAV server.
pub struct RemoteServer {
    pub addr: SocketAddr,
    state: Arc<Mutex<RemoteState>>,
    shutdown: CancellationToken,
}

impl RemoteServer {
    /// Bind to an ephemeral port and start serving.
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = Arc::new(Mutex::new(RemoteState::default()));
        let shutdown = CancellationToken::new();

        let accept_state = Arc::clone(&state);
        let token = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = token.cancelled() => break,
                    accepted = listener.accept() => {
                        let Ok((stream, _)) = accepted else { continue };
                        let state = Arc::clone(&accept_state);
                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle(Arc::clone(&state), req));
                            let _ = hyper::server::conn::http1::Builder::new()
                                .serve_connection(TokioIo::new(stream), service)
                                .await;
                        });
                    }
                }
            }
        });

        Self {
            addr,
            state,
            shutdown,
        }
    }

    /// Absolute URL of `path` on this server.
    pub fn url(&self, path: &str) -> Url {
        Url::parse(&format!("http://{}{path}", self.addr)).unwrap()
    }

    /// Store a document directly.
    pub fn seed_document(&self, path: &str, content: &'static [u8]) {
        self.state
            .lock()
            .entries
            .insert(path.to_string(), RemoteEntry::Document(Bytes::from_static(content)));
    }

    /// Create a collection directly.
    pub fn seed_collection(&self, path: &str) {
        self.state
            .lock()
            .entries
            .insert(path.to_string(), RemoteEntry::Collection);
    }

    /// Answer every request for `path` with `status`.
    pub fn fail(&self, path: &str, status: StatusCode) {
        self.state.lock().failures.insert(path.to_string(), status);
    }

    /// What is stored at `path`.
    pub fn entry(&self, path: &str) -> Option<RemoteEntry> {
        self.state.lock().entries.get(path).cloned()
    }

    /// Content of the document at `path`.
    pub fn document(&self, path: &str) -> Option<Bytes> {
        match self.entry(path) {
            Some(RemoteEntry::Document(content)) => Some(content),
            _ => None,
        }
    }

    /// Requests received so far, as `(method, path)`.
    pub fn requests(&self) -> Vec<(String, String)> {
        self.state
            .lock()
            .requests
            .iter()
            .map(|(m, p)| (m.to_string(), p.clone()))
            .collect()
    }
}

impl Drop for RemoteServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

fn reply(status: StatusCode) -> Result<Response<Full<Bytes>>, Infallible> {
    let mut response = Response::new(Full::new(Bytes::new()));
    *response.status_mut() = status;
    Ok(response)
}

fn parent_of(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

async fn handle(
    state: Arc<Mutex<RemoteState>>,
    req: Request<Incoming>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let method = req.method().clone();
    let path = req.uri().path().trim_end_matches('/').to_string();
    let path = if path.is_empty() { "/".to_string() } else { path };
    let if_none_match = req.headers().contains_key("if-none-match");

    let content = match req.into_body().collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(_) => return reply(StatusCode::BAD_REQUEST),
    };

    let mut state = state.lock();
    state.requests.push((method.clone(), path.clone()));
    if let Some(status) = state.failures.get(&path) {
        return reply(*status);
    }

    let parent = parent_of(&path);
    let parent_exists =
        parent == "/" || state.entries.get(parent) == Some(&RemoteEntry::Collection);

    match method.as_str() {
        "PUT" => match state.entries.get(&path) {
            Some(RemoteEntry::Collection) => reply(StatusCode::METHOD_NOT_ALLOWED),
            Some(RemoteEntry::Document(_)) if if_none_match => {
                reply(StatusCode::PRECONDITION_FAILED)
            }
            Some(RemoteEntry::Document(_)) => {
                state.entries.insert(path, RemoteEntry::Document(content));
                reply(StatusCode::NO_CONTENT)
            }
            None if !parent_exists => reply(StatusCode::CONFLICT),
            None => {
                state.entries.insert(path, RemoteEntry::Document(content));
                reply(StatusCode::CREATED)
            }
        },
        "MKCOL" => {
            if path == "/" || state.entries.contains_key(&path) {
                reply(StatusCode::METHOD_NOT_ALLOWED)
            } else if !parent_exists {
                reply(StatusCode::CONFLICT)
            } else {
                state.entries.insert(path, RemoteEntry::Collection);
                reply(StatusCode::CREATED)
            }
        }
        "DELETE" => {
            if state.entries.remove(&path).is_none() {
                return reply(StatusCode::NOT_FOUND);
            }
            let prefix = format!("{path}/");
            state.entries.retain(|k, _| !k.starts_with(&prefix));
            reply(StatusCode::NO_CONTENT)
        }
        _ => reply(StatusCode::NOT_IMPLEMENTED),
    }
}
