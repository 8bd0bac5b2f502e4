#![allow(dead_code)]

use std::net::SocketAddr;
use std::time::Duration;

use axum::Router;
use axum::routing::get;
use specular_gate::Server;
use specular_gate::http::HttpService;
use tokio::net::TcpListener;

pub type LayerFn = Box<dyn Fn(HttpService) -> HttpService + Send + Sync>;

/// Adapter so a boxed closure can be handed to `ServerBuilder::http_layer`.
pub struct BoxedLayer(pub LayerFn);

impl tower::Layer<HttpService> for BoxedLayer {
    type Service = HttpService;
    fn layer(&self, inner: HttpService) -> HttpService {
        (self.0)(inner)
    }
}

/// Serve `app` on an ephemeral port.
pub async fn start_app(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

/// An upstream answering `GET /` with a fixed body.
pub async fn start_upstream(body: &'static str) -> SocketAddr {
    start_app(Router::new().route("/", get(move || async move { body }))).await
}

/// Run a server forwarding to `upstream` with `layers`, first entry outermost.
pub async fn start_server(upstream: SocketAddr, layers: Vec<LayerFn>) -> SocketAddr {
    let mut builder = Server::builder().upstream(format!("http://{upstream}"));
    for layer in layers {
        builder = builder.http_layer(BoxedLayer(layer));
    }
    serve(builder.build().unwrap()).await
}

/// Serve an already built server on an ephemeral port.
pub async fn serve(server: Server) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        server
            .serve(listener, std::future::pending())
            .await
            .unwrap();
    });
    addr
}

/// Poll `condition` every 10ms until it holds, failing after 5s.
pub async fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
