//! The read-only health/metrics surface. A local HTTP server that never
//! mutates controller state — `/health`, `/ready`, and `/metrics` are the
//! core paths; `/metrics/prometheus` is an additive fourth path carrying
//! the same counters in Prometheus text exposition format for an external
//! scraper.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::{body::Incoming, service::service_fn, Method, Request, Response, StatusCode};
use hyper_util::{
    rt::{TokioExecutor, TokioIo},
    server::conn::auto,
};
use serde::Serialize;
use tokio::{net::TcpListener, pin, task::JoinSet};
use tracing::{debug, error, info};

use crate::counters::Counters;
use crate::registry::Registry;
use crate::signals::Phase;
use crate::tracker::Tracker;

/// Errors produced by [`Observer`].
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct State {
    registry: Registry,
    tracker: Tracker,
    counters: Arc<Counters>,
    prometheus: Option<Arc<metrics_exporter_prometheus::PrometheusHandle>>,
}

#[derive(Serialize)]
struct HealthBody {
    status: &'static str,
    timestamp: u64,
}

#[derive(Serialize)]
struct ReadyBody {
    ready: bool,
    workers: usize,
}

#[derive(Serialize)]
struct MetricsBody<'a> {
    node: &'a crate::counters::CountersSnapshot,
    registry: &'a crate::registry::RegistrySnapshot,
    requests: &'a crate::tracker::TrackerSnapshot,
}

#[derive(Serialize)]
struct ErrorBody {
    error: &'static str,
}

fn full(bytes: Vec<u8>) -> BoxBody<Bytes, hyper::Error> {
    Full::new(Bytes::from(bytes))
        .map_err(|never| match never {})
        .boxed()
}

fn json_response(
    status: StatusCode,
    body: &impl Serialize,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let mut resp = Response::new(full(bytes));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        hyper::header::CONTENT_TYPE,
        hyper::header::HeaderValue::from_static("application/json"),
    );
    resp
}

fn epoch_seconds() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

async fn srv(
    req: Request<Incoming>,
    state: State,
) -> Result<Response<BoxBody<Bytes, hyper::Error>>, std::convert::Infallible> {
    let response = match (req.method(), req.uri().path()) {
        (&Method::GET, "/health") => json_response(
            StatusCode::OK,
            &HealthBody {
                status: "healthy",
                timestamp: epoch_seconds(),
            },
        ),
        (&Method::GET, "/ready") => {
            let snapshot = state.registry.snapshot();
            let ready = snapshot.healthy_workers >= 1;
            json_response(
                if ready {
                    StatusCode::OK
                } else {
                    StatusCode::SERVICE_UNAVAILABLE
                },
                &ReadyBody {
                    ready,
                    workers: snapshot.healthy_workers,
                },
            )
        }
        (&Method::GET, "/metrics") => {
            let node = state.counters.snapshot();
            let registry = state.registry.snapshot();
            let requests = state.tracker.snapshot();
            json_response(
                StatusCode::OK,
                &MetricsBody {
                    node: &node,
                    registry: &registry,
                    requests: &requests,
                },
            )
        }
        (&Method::GET, "/metrics/prometheus") => match &state.prometheus {
            Some(handle) => {
                let mut resp = Response::new(full(handle.render().into_bytes()));
                resp.headers_mut().insert(
                    hyper::header::CONTENT_TYPE,
                    hyper::header::HeaderValue::from_static("text/plain; version=0.0.4"),
                );
                resp
            }
            None => json_response(
                StatusCode::NOT_FOUND,
                &ErrorBody {
                    error: "Not found",
                },
            ),
        },
        _ => json_response(StatusCode::NOT_FOUND, &ErrorBody { error: "Not found" }),
    };
    Ok(response)
}

/// The observability server. Reads registry/tracker/counters; never
/// mutates them.
pub struct Observer {
    addr: SocketAddr,
    shutdown: Phase,
    state: State,
}

impl Observer {
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        registry: Registry,
        tracker: Tracker,
        counters: Arc<Counters>,
        prometheus: Option<Arc<metrics_exporter_prometheus::PrometheusHandle>>,
        shutdown: Phase,
    ) -> Self {
        Self {
            addr,
            shutdown,
            state: State {
                registry,
                tracker,
                counters,
                prometheus,
            },
        }
    }

    /// Run the observability server until shutdown is signalled. Binding
    /// happens here rather than in [`Observer::new`] so the caller can
    /// treat construction as infallible and only await bind failures once
    /// the task is polled; callers that need the bind failure to be fatal
    /// at startup should use [`Observer::bind`] instead.
    pub async fn run(mut self) -> Result<(), Error> {
        let listener = TcpListener::bind(self.addr).await?;
        self.serve(listener).await
    }

    /// Bind the observability listener now, surfacing any failure to the
    /// caller immediately, and return a task that serves it until shutdown.
    /// Used by `main` so a taken health port is a fatal startup error like
    /// the client and worker UDP binds, rather than a silently failed
    /// background task.
    pub async fn bind(self) -> Result<impl std::future::Future<Output = Result<(), Error>>, Error> {
        let listener = TcpListener::bind(self.addr).await?;
        Ok(async move { self.serve(listener).await })
    }

    async fn serve(mut self, listener: TcpListener) -> Result<(), Error> {
        info!(addr = %self.addr, "observability surface listening");
        let mut join_set = JoinSet::new();

        let shutdown = self.shutdown.recv();
        pin!(shutdown);
        loop {
            tokio::select! {
                () = &mut shutdown => {
                    info!("observability surface shutting down");
                    break;
                }
                incoming = listener.accept() => {
                    let (stream, addr) = match incoming {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!("accept error: {e}");
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    join_set.spawn(async move {
                        debug!("accepted health-surface connection from {addr}");
                        let builder = auto::Builder::new(TokioExecutor::new());
                        let serve = builder.serve_connection(
                            TokioIo::new(stream),
                            service_fn(move |req| srv(req, state.clone())),
                        );
                        if let Err(e) = serve.await {
                            error!("error serving health surface connection: {e}");
                        }
                    });
                }
            }
        }

        drop(listener);
        while join_set.join_next().await.is_some() {}
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn epoch_seconds_is_nonzero() {
        assert!(epoch_seconds() > 0);
    }

    #[tokio::test]
    async fn observer_serves_health_and_ready() {
        let registry = Registry::new(Duration::from_secs(30));
        let tracker = Tracker::new(Duration::from_secs(60), 10);
        let counters = Arc::new(Counters::new());
        let (shutdown, phase) = crate::signals::Shutdown::new();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let observer = Observer::new(addr, registry.clone(), tracker, counters, None, phase);
        let handle = tokio::spawn(observer.run());

        // Give the server a moment to bind before we connect.
        tokio::time::sleep(Duration::from_millis(50)).await;

        let body = reqwest_like_get(addr, "/ready").await;
        assert!(body.contains("\"ready\":false"));

        shutdown.signal();
        let _ = handle.await;
    }

    // Minimal hand-rolled HTTP GET so this test doesn't need a client
    // dependency just to hit our own server.
    async fn reqwest_like_get(addr: SocketAddr, path: &str) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut buf = Vec::new();
        stream.read_to_end(&mut buf).await.unwrap();
        String::from_utf8_lossy(&buf).into_owned()
    }
}
