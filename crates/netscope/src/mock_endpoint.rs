//! Local mock endpoint.
//!
//! Literal-response mock rules still need something real to dial, so the
//! engine stages the response here under the transaction id and hands the
//! adapter this endpoint's URL. Every dial of a staged id gets the same
//! answer, so library retries behave normally. Unknown ids get 404.

use crate::model::TransactionId;
use crate::resolver::MockResponse;
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use url::Url;

const MOCK_PATH_PREFIX: &str = "/__netscope/mock/";

type Staged = Arc<RwLock<HashMap<TransactionId, MockResponse>>>;

pub struct MockEndpoint {
    addr: SocketAddr,
    base: Url,
    staged: Staged,
    shutdown_tx: broadcast::Sender<()>,
}

impl MockEndpoint {
    /// Bind `host:port` (port 0 picks an ephemeral port) and start serving.
    /// Must be called inside a tokio runtime.
    pub async fn start(host: &str, port: u16) -> io::Result<Arc<Self>> {
        let listener = TcpListener::bind((host, port)).await?;
        let addr = listener.local_addr()?;
        let base = Url::parse(&format!("http://{addr}/"))
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

        let staged: Staged = Arc::new(RwLock::new(HashMap::new()));
        let (shutdown_tx, _) = broadcast::channel(1);
        let mut shutdown_rx = shutdown_tx.subscribe();
        let serving = Arc::clone(&staged);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => {
                        match result {
                            Ok((stream, _)) => {
                                let staged = Arc::clone(&serving);
                                tokio::spawn(async move {
                                    let io = TokioIo::new(stream);
                                    let service = service_fn(move |req| {
                                        let staged = Arc::clone(&staged);
                                        async move { Ok::<_, Infallible>(serve(req, &staged)) }
                                    });
                                    if let Err(e) = http1::Builder::new()
                                        .serve_connection(io, service)
                                        .await
                                    {
                                        debug!("Mock endpoint connection error: {}", e);
                                    }
                                });
                            }
                            Err(e) => {
                                error!("Mock endpoint accept error on {}: {}", addr, e);
                            }
                        }
                    }
                    _ = shutdown_rx.recv() => {
                        info!("Mock endpoint on {} shutting down", addr);
                        break;
                    }
                }
            }
        });

        info!("Mock endpoint listening on {}", addr);
        Ok(Arc::new(Self {
            addr,
            base,
            staged,
            shutdown_tx,
        }))
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Stage `response` for `id` and return the URL that serves it.
    pub fn stage(&self, id: TransactionId, response: MockResponse) -> Url {
        self.staged.write().insert(id, response);
        self.url_for(id)
    }

    pub fn url_for(&self, id: TransactionId) -> Url {
        let mut url = self.base.clone();
        url.set_path(&format!("{MOCK_PATH_PREFIX}{id}"));
        url
    }

    /// Drop the staged response for `id`. Returns whether one existed.
    pub fn release(&self, id: TransactionId) -> bool {
        self.staged.write().remove(&id).is_some()
    }

    pub fn is_staged(&self, id: TransactionId) -> bool {
        self.staged.read().contains_key(&id)
    }

    pub fn staged_count(&self) -> usize {
        self.staged.read().len()
    }

    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }
}

impl Drop for MockEndpoint {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn serve(req: Request<Incoming>, staged: &Staged) -> Response<Full<Bytes>> {
    let id = req
        .uri()
        .path()
        .strip_prefix(MOCK_PATH_PREFIX)
        .and_then(|rest| rest.parse::<TransactionId>().ok());

    let Some(id) = id else {
        return plain(StatusCode::NOT_FOUND, "not a mock path");
    };
    let Some(mock) = staged.read().get(&id).cloned() else {
        debug!("No staged mock response for transaction {}", id);
        return plain(StatusCode::NOT_FOUND, "no staged response");
    };

    // Validated when the rule was compiled
    let (status, headers) = match mock.to_parts() {
        Ok(parts) => parts,
        Err(e) => {
            warn!("Staged mock response for {} is unusable: {}", id, e);
            return plain(StatusCode::INTERNAL_SERVER_ERROR, "unusable mock response");
        }
    };

    let mut response = Response::new(Full::new(mock.body));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

fn plain(status: StatusCode, message: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(message.as_bytes())));
    *response.status_mut() = status;
    response
}
