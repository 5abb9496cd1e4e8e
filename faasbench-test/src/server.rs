//! Exposes an in-process stand-in for a deployed function.
//!
//! ```
//! use std::time::Duration;
//!
//! use faasbench_test::server::{FunctionServer, Reply};
//!
//! #[tokio::main]
//! async fn main() {
//!    let server = FunctionServer::new([Reply::ok().delayed(Duration::from_millis(50))]).await;
//!    let url = server.url("/hello");
//!    // probe the URL in tests...
//! }
//! ```

use std::collections::VecDeque;
use std::net::{SocketAddr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::Router;
use axum::extract::State;

pub use axum::http::StatusCode;

/// A scripted response of the [`FunctionServer`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Reply {
    /// Status code of the response.
    pub status: StatusCode,
    /// Time spent before responding.
    pub delay: Duration,
}

impl Reply {
    /// An immediate `200 OK`.
    pub fn ok() -> Self {
        Self::status(StatusCode::OK)
    }

    /// An immediate response with the given status.
    pub fn status(status: StatusCode) -> Self {
        Self {
            status,
            delay: Duration::ZERO,
        }
    }

    /// Delays this reply by `delay`.
    pub fn delayed(self, delay: Duration) -> Self {
        Self { delay, ..self }
    }
}

#[derive(Debug)]
struct Script {
    replies: Mutex<VecDeque<Reply>>,
    requests: AtomicUsize,
}

/// An in-process HTTP server replaying scripted replies.
///
/// Every request on any path consumes the next [`Reply`]. Once the script is exhausted, the
/// server answers with an immediate `200 OK`. It listens on a random available port on
/// localhost and shuts down when dropped.
#[derive(Debug)]
pub struct FunctionServer {
    handle: tokio::task::JoinHandle<()>,
    socket: SocketAddr,
    script: Arc<Script>,
}

impl FunctionServer {
    /// Starts a server replaying `replies` in order.
    pub async fn new(replies: impl IntoIterator<Item = Reply>) -> Self {
        let addr = SocketAddr::from(([127, 0, 0, 1], 0));
        let listener = TcpListener::bind(addr).unwrap();
        listener.set_nonblocking(true).unwrap();
        let socket = listener.local_addr().unwrap();

        let script = Arc::new(Script {
            replies: Mutex::new(replies.into_iter().collect()),
            requests: AtomicUsize::new(0),
        });

        let app = Router::new().fallback(respond).with_state(Arc::clone(&script));

        let handle = tokio::spawn(async move {
            let listener = tokio::net::TcpListener::from_std(listener).unwrap();
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            handle,
            socket,
            script,
        }
    }

    /// Returns a full URL pointing to the given path.
    ///
    /// This URL uses `localhost` as hostname.
    pub fn url(&self, path: &str) -> String {
        let path = path.trim_start_matches('/');
        format!("http://localhost:{}/{}", self.socket.port(), path)
    }

    /// Returns the number of requests received so far.
    pub fn requests(&self) -> usize {
        self.script.requests.load(Ordering::SeqCst)
    }
}

impl Drop for FunctionServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn respond(State(script): State<Arc<Script>>) -> (StatusCode, &'static str) {
    script.requests.fetch_add(1, Ordering::SeqCst);
    let reply = script
        .replies
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(Reply::ok);

    if !reply.delay.is_zero() {
        tokio::time::sleep(reply.delay).await;
    }

    (reply.status, "hello")
}
