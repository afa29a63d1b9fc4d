//! In-memory transport for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use crate::transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};

type Scripted = Result<HttpResponse, TransportError>;

/// Replays a fixed list of replies in order; the last one repeats forever.
/// Every request it receives is recorded.
pub struct ScriptedTransport {
    script: Mutex<Vec<Scripted>>,
    requests: Mutex<Vec<HttpRequest>>,
    calls: AtomicUsize,
}

impl ScriptedTransport {
    pub fn new(script: Vec<Scripted>) -> Self {
        assert!(!script.is_empty(), "script needs at least one reply");
        Self {
            script: Mutex::new(script),
            requests: Mutex::new(Vec::new()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn repeating(reply: Scripted) -> Self {
        Self::new(vec![reply])
    }

    pub fn ok(status: u16, body: serde_json::Value) -> Self {
        Self::repeating(Ok(HttpResponse::new(status, body.to_string())))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Body of the most recent request, parsed as JSON.
    pub fn last_body(&self) -> serde_json::Value {
        let requests = self.requests.lock().unwrap();
        let last = requests.last().expect("no request was sent");
        serde_json::from_slice(&last.body).unwrap()
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn post(&self, request: &HttpRequest) -> Result<HttpResponse, TransportError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let mut script = self.script.lock().unwrap();
        if script.len() > 1 {
            script.remove(0)
        } else {
            script[0].clone()
        }
    }
}
