//! Local HTTP fixture for tests: serves fixed routes and counts requests per path.

use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex},
    time::Duration,
};

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{StatusCode, Uri},
    response::{IntoResponse, Response},
};
use reqwest::Client;

#[derive(Debug, Clone)]
pub enum Route {
    Body(Vec<u8>),
    Status(StatusCode),
    /// Chunked body without a `content-length`
    Chunked(Vec<Vec<u8>>),
    /// Sends one chunk, then drops the connection
    BrokenStream,
    /// Never answers
    Stall,
}

impl Route {
    pub fn body(bytes: impl Into<Vec<u8>>) -> Self {
        Self::Body(bytes.into())
    }

    pub fn status(code: u16) -> Self {
        Self::Status(StatusCode::from_u16(code).unwrap())
    }
}

#[derive(Default)]
struct ServerState {
    routes: Mutex<HashMap<String, Route>>,
    hits: Mutex<HashMap<String, usize>>,
}

pub struct TestServer {
    base: String,
    state: Arc<ServerState>,
}

impl TestServer {
    pub async fn spawn<I, P>(routes: I) -> Self
    where
        I: IntoIterator<Item = (P, Route)>,
        P: Into<String>,
    {
        let state = Arc::new(ServerState {
            routes: Mutex::new(routes.into_iter().map(|(p, r)| (p.into(), r)).collect()),
            hits: Mutex::default(),
        });

        let app = Router::new().fallback(serve).with_state(state.clone());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base: format!("http://{addr}"),
            state,
        }
    }

    /// Add or replace a route on the running server
    pub fn route(&self, path: impl Into<String>, route: Route) {
        self.state.routes.lock().unwrap().insert(path.into(), route);
    }

    pub fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    pub fn hits(&self, path: &str) -> usize {
        self.state
            .hits
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(0)
    }

    pub fn total_hits(&self) -> usize {
        self.state.hits.lock().unwrap().values().sum()
    }
}

async fn serve(State(state): State<Arc<ServerState>>, uri: Uri) -> Response {
    let path = uri.path().to_string();
    *state.hits.lock().unwrap().entry(path.clone()).or_default() += 1;

    let route = state.routes.lock().unwrap().get(&path).cloned();
    match route {
        Some(Route::Body(bytes)) => (StatusCode::OK, bytes).into_response(),
        Some(Route::Status(code)) => code.into_response(),
        Some(Route::Chunked(chunks)) => {
            let chunks = chunks.into_iter().map(|c| Ok::<_, io::Error>(Bytes::from(c)));
            Response::new(Body::from_stream(futures_util::stream::iter(chunks)))
        }
        Some(Route::BrokenStream) => {
            let chunks: Vec<io::Result<Bytes>> = vec![
                Ok(Bytes::from_static(b"partial")),
                Err(io::Error::other("connection dropped")),
            ];
            Response::new(Body::from_stream(futures_util::stream::iter(chunks)))
        }
        Some(Route::Stall) => {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            StatusCode::OK.into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// Client that never goes through a proxy picked up from the environment
pub fn test_client() -> Client {
    Client::builder().no_proxy().build().unwrap()
}
