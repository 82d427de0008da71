#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use darun_core::{
    ClientCredentials, Endpoints, HttpRequest, HttpResponse, HttpTransport, Method,
    RemoteAuthenticator, RetryPolicy, TokenCache, TransportError, TransportErrorKind,
};
use serde_json::Value;

pub const BASE_URL: &str = "https://aps.test";
pub const REGION: &str = "us-east";

pub fn endpoints() -> Endpoints {
    Endpoints::new(BASE_URL, REGION)
}

/// Fast retry policy: three attempts, 100ms apart.
pub fn quick_retry() -> RetryPolicy {
    RetryPolicy::default().with_base_delay(Duration::from_millis(100))
}

#[derive(Clone)]
pub struct Reply {
    outcome: Result<HttpResponse, TransportError>,
    delay: Duration,
}

impl Reply {
    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

pub fn json(status: u16, body: Value) -> Reply {
    Reply {
        outcome: Ok(HttpResponse::new(status, body.to_string())),
        delay: Duration::ZERO,
    }
}

pub fn bytes(status: u16, body: &[u8]) -> Reply {
    Reply {
        outcome: Ok(HttpResponse::new(status, body.to_vec())),
        delay: Duration::ZERO,
    }
}

pub fn connect_error() -> Reply {
    Reply {
        outcome: Err(TransportError::new(
            TransportErrorKind::Connect,
            "connection refused",
        )),
        delay: Duration::ZERO,
    }
}

pub fn timeout_error() -> Reply {
    Reply {
        outcome: Err(TransportError::new(
            TransportErrorKind::Timeout,
            "operation timed out",
        )),
        delay: Duration::ZERO,
    }
}

pub fn token_reply(token: &str, expires_in: u64) -> Reply {
    json(
        200,
        serde_json::json!({
            "access_token": token,
            "token_type": "Bearer",
            "expires_in": expires_in,
        }),
    )
}

pub fn status_reply(id: &str, state: &str, arguments: Value) -> Reply {
    json(
        200,
        serde_json::json!({
            "id": id,
            "status": state,
            "reportUrl": format!("https://reports.test/{id}.txt"),
            "arguments": arguments,
        }),
    )
}

struct Route {
    method: Method,
    prefix: String,
    replies: VecDeque<Reply>,
}

/// Answers requests from per-route reply queues. The last reply of a route repeats
/// once the queue drains; unmatched requests fail as connection errors.
#[derive(Default)]
pub struct ScriptedTransport {
    routes: Mutex<Vec<Route>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl ScriptedTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn on(&self, method: Method, prefix: impl Into<String>, replies: Vec<Reply>) {
        self.routes.lock().unwrap().push(Route {
            method,
            prefix: prefix.into(),
            replies: replies.into(),
        });
    }

    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, method: Method, prefix: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|request| request.method == method && request.url.starts_with(prefix))
            .count()
    }

    fn next_reply(&self, request: &HttpRequest) -> Option<Reply> {
        let mut routes = self.routes.lock().unwrap();
        let route = routes
            .iter_mut()
            .filter(|route| route.method == request.method && request.url.starts_with(&route.prefix))
            .max_by_key(|route| route.prefix.len())?;
        if route.replies.len() > 1 {
            route.replies.pop_front()
        } else {
            route.replies.front().cloned()
        }
    }
}

#[async_trait]
impl HttpTransport for ScriptedTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        let reply = self.next_reply(&request);
        match reply {
            Some(reply) => {
                if !reply.delay.is_zero() {
                    tokio::time::sleep(reply.delay).await;
                }
                reply.outcome
            }
            None => Err(TransportError::new(
                TransportErrorKind::Connect,
                format!("no route for {} {}", request.method, request.url),
            )),
        }
    }
}

pub fn token_cache(transport: &Arc<ScriptedTransport>) -> Arc<TokenCache> {
    let authenticator = RemoteAuthenticator::new(
        transport.clone(),
        endpoints().token_url(),
        ClientCredentials::new("client-id", "client-secret"),
    )
    .with_retry(quick_retry());
    Arc::new(TokenCache::new(authenticator))
}
