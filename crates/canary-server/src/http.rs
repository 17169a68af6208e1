//! HTTP endpoints: liveness, readiness, Prometheus metrics and consuming status.

use std::convert::Infallible;
use std::sync::Arc;

use bytes::Bytes;
use canary_core::{MetricsRegistry, ShutdownListener, StatusSampler};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, error, info, warn};

/// HTTP body type for responses
type Body = http_body_util::Full<Bytes>;

const JSON: &str = "application/json";
const TEXT: &str = "text/plain; charset=utf-8";

/// Serves the canary endpoints until shutdown.
pub struct HttpServer {
    metrics: Arc<MetricsRegistry>,
    sampler: Arc<StatusSampler>,
}

impl HttpServer {
    /// Creates a server over the shared registry and sampler.
    pub fn new(metrics: Arc<MetricsRegistry>, sampler: Arc<StatusSampler>) -> Self {
        Self { metrics, sampler }
    }

    /// Serves connections accepted on `listener` until `shutdown` fires.
    ///
    /// Connections already accepted are left to finish on their own.
    pub async fn serve(self, listener: TcpListener, mut shutdown: ShutdownListener) -> std::io::Result<()> {
        info!(addr = %listener.local_addr()?, "http server listening");

        loop {
            let (stream, peer) = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "failed to accept http connection");
                        continue;
                    }
                },
            };

            let metrics = Arc::clone(&self.metrics);
            let sampler = Arc::clone(&self.sampler);
            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let response = route(req.method(), req.uri().path(), &metrics, &sampler);
                    async move { Ok::<_, Infallible>(response) }
                });

                if let Err(e) = http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await
                {
                    debug!(%peer, error = %e, "http connection ended with error");
                }
            });
        }

        info!("http server stopped");
        Ok(())
    }
}

/// Maps a request to its response.
pub fn route(
    method: &Method,
    path: &str,
    metrics: &MetricsRegistry,
    sampler: &StatusSampler,
) -> Response<Body> {
    let known = matches!(path, "/liveness" | "/readiness" | "/metrics" | "/status");
    if !known {
        return respond(StatusCode::NOT_FOUND, TEXT, "Not Found");
    }
    if *method != Method::GET {
        let mut response = respond(StatusCode::METHOD_NOT_ALLOWED, TEXT, "Method Not Allowed");
        response.headers_mut().insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    match path {
        "/liveness" | "/readiness" => respond(StatusCode::OK, JSON, r#"{"status":"ok"}"#),
        "/metrics" => match metrics.scrape_to_string() {
            Ok(text) => respond_with(StatusCode::OK, &metrics.content_type(), text),
            Err(e) => {
                error!(error = %e, "failed to render metrics");
                respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT, "metrics unavailable")
            }
        },
        _ => match serde_json::to_string(&sampler.report()) {
            Ok(json) => respond_with(StatusCode::OK, JSON, json),
            Err(e) => {
                error!(error = %e, "failed to render status");
                respond(StatusCode::INTERNAL_SERVER_ERROR, TEXT, "status unavailable")
            }
        },
    }
}

fn respond(status: StatusCode, content_type: &'static str, body: &'static str) -> Response<Body> {
    let mut response = Response::new(Body::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(content_type));
    response
}

fn respond_with(status: StatusCode, content_type: &str, body: String) -> Response<Body> {
    let mut response = Response::new(Body::new(Bytes::from(body)));
    *response.status_mut() = status;
    if let Ok(value) = HeaderValue::from_str(content_type) {
        response.headers_mut().insert(CONTENT_TYPE, value);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use canary_core::counters::MessageCounters;
    use canary_core::metrics::names;
    use canary_core::ShutdownSignal;
    use http_body_util::BodyExt;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn fixtures() -> (MetricsRegistry, StatusSampler, Arc<MessageCounters>) {
        let counters = Arc::new(MessageCounters::new());
        let sampler = StatusSampler::new(
            Duration::from_millis(300_000),
            Duration::from_millis(30_000),
            Arc::clone(&counters),
        );
        (MetricsRegistry::new(), sampler, counters)
    }

    async fn body_string(response: Response<Body>) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn test_probes_return_ok() {
        let (metrics, sampler, _) = fixtures();
        for path in ["/liveness", "/readiness"] {
            let response = route(&Method::GET, path, &metrics, &sampler);
            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()[CONTENT_TYPE], JSON);
            assert_eq!(body_string(response).await, r#"{"status":"ok"}"#);
        }
    }

    #[tokio::test]
    async fn test_status_without_samples() {
        let (metrics, sampler, _) = fixtures();
        let response = route(&Method::GET, "/status", &metrics, &sampler);
        assert_eq!(response.status(), StatusCode::OK);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["Consuming"]["TimeWindow"], 0);
        assert_eq!(json["Consuming"]["Percentage"], -1.0);
    }

    #[tokio::test]
    async fn test_status_half_consumed() {
        let (metrics, sampler, counters) = fixtures();
        sampler.sample();
        counters.increment_produced();
        counters.increment_produced();
        counters.increment_consumed();
        sampler.sample();

        let response = route(&Method::GET, "/status", &metrics, &sampler);
        let json: serde_json::Value = serde_json::from_str(&body_string(response).await).unwrap();
        assert_eq!(json["Consuming"]["TimeWindow"], 60_000);
        assert_eq!(json["Consuming"]["Percentage"], 50.0);
    }

    #[tokio::test]
    async fn test_metrics_exposition() {
        let (metrics, sampler, _) = fixtures();
        metrics
            .counter(names::RECORDS_PRODUCED, &[("clientid", "c"), ("partition", "0")])
            .increment_by(3);

        let response = route(&Method::GET, "/metrics", &metrics, &sampler);
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_string(response).await;
        assert!(body.contains(r#"strimzi_canary_records_produced_total{clientid="c",partition="0"} 3"#));
    }

    #[test]
    fn test_unknown_path_and_method() {
        let (metrics, sampler, _) = fixtures();
        assert_eq!(
            route(&Method::GET, "/nope", &metrics, &sampler).status(),
            StatusCode::NOT_FOUND
        );
        let response = route(&Method::POST, "/status", &metrics, &sampler);
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
        assert_eq!(response.headers()[ALLOW], "GET");
    }

    #[tokio::test]
    async fn test_serves_over_tcp_until_shutdown() {
        let (metrics, sampler, _) = fixtures();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let signal = ShutdownSignal::new();
        let server = HttpServer::new(Arc::new(metrics), Arc::new(sampler));
        let handle = tokio::spawn(server.serve(listener, signal.listener()));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(b"GET /liveness HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut raw = String::new();
        stream.read_to_string(&mut raw).await.unwrap();
        assert!(raw.starts_with("HTTP/1.1 200 OK"));
        assert!(raw.ends_with(r#"{"status":"ok"}"#));

        signal.trigger();
        handle.await.unwrap().unwrap();
    }
}
