pub mod config;
pub mod http;
pub mod middleware;
pub mod pool;
mod task;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use ::http::{Request, Response, StatusCode};
use hyper::body::Incoming;
use hyper_util::rt::TokioIo;
use tokio::net::{TcpListener, TcpStream, ToSocketAddrs};
use tower::{Service, ServiceExt};

use crate::http::{Body, BoxError, ErrorBody, HttpService, UpstreamService, json_response};
use crate::pool::{ConnectionPool, PoolConfig};

type LayerFn = Box<dyn Fn(HttpService) -> HttpService + Send + Sync>;
type ServiceFactory = Box<dyn Fn() -> HttpService + Send + Sync>;

enum App {
    Upstream(String),
    Factory(ServiceFactory),
}

/// Builder for [`Server`].
///
/// Layers wrap the application in the order they are added: the first
/// layer sees every request first.
pub struct ServerBuilder {
    layers: Vec<LayerFn>,
    app: Option<App>,
    pool: PoolConfig,
}

impl ServerBuilder {
    /// Add a tower layer around the application.
    pub fn http_layer<L>(mut self, layer: L) -> Self
    where
        L: tower::Layer<HttpService> + Send + Sync + 'static,
        L::Service: tower::Service<Request<Body>, Response = Response<Body>, Error = BoxError>
            + Send
            + 'static,
        <L::Service as tower::Service<Request<Body>>>::Future: Send,
    {
        self.layers
            .push(Box::new(move |inner| tower::util::BoxService::new(layer.layer(inner))));
        self
    }

    /// Forward requests to an `http://host:port` API server.
    pub fn upstream(mut self, url: impl Into<String>) -> Self {
        self.app = Some(App::Upstream(url.into()));
        self
    }

    /// Serve requests with a service built by `factory`, once per connection.
    pub fn service<F>(mut self, factory: F) -> Self
    where
        F: Fn() -> HttpService + Send + Sync + 'static,
    {
        self.app = Some(App::Factory(Box::new(factory)));
        self
    }

    /// Idle connection limits for the upstream pool.
    pub fn pool(mut self, config: PoolConfig) -> Self {
        self.pool = config;
        self
    }

    pub fn build(self) -> anyhow::Result<Server> {
        let app: ServiceFactory = match self.app {
            Some(App::Upstream(url)) => {
                let upstream = UpstreamService::new(&url, ConnectionPool::new(self.pool))?;
                Box::new(move || tower::util::BoxService::new(upstream.clone()))
            }
            Some(App::Factory(factory)) => factory,
            None => anyhow::bail!("no upstream or service configured"),
        };
        Ok(Server {
            inner: Arc::new(ServerInner {
                layers: self.layers,
                app,
            }),
        })
    }
}

struct ServerInner {
    layers: Vec<LayerFn>,
    app: ServiceFactory,
}

/// HTTP/1.1 front server running requests through the configured layers.
///
/// # Examples
///
/// ```rust,no_run
/// use specular_gate::Server;
/// use specular_gate::middleware::{RequestLimiter, RequestLimiterConfig};
///
/// # async fn run() -> anyhow::Result<()> {
/// let server = Server::builder()
///     .http_layer(RequestLimiter::new(RequestLimiterConfig::default())?)
///     .upstream("http://127.0.0.1:3000")
///     .build()?;
/// server
///     .listen_with_shutdown("127.0.0.1:8080", async {
///         tokio::signal::ctrl_c().await.ok();
///     })
///     .await
/// # }
/// ```
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn builder() -> ServerBuilder {
        ServerBuilder {
            layers: Vec::new(),
            app: None,
            pool: PoolConfig::default(),
        }
    }

    /// Bind `addr` and serve until the process exits.
    pub async fn listen(&self, addr: impl ToSocketAddrs) -> anyhow::Result<()> {
        self.listen_with_shutdown(addr, std::future::pending()).await
    }

    /// Bind `addr` and serve until `shutdown` resolves.
    pub async fn listen_with_shutdown(
        &self,
        addr: impl ToSocketAddrs,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        let listener = TcpListener::bind(addr).await?;
        tracing::info!(addr = %listener.local_addr()?, "listening");
        self.serve(listener, shutdown).await
    }

    /// Accept connections from an already bound listener until `shutdown`
    /// resolves. Connections in flight keep running.
    pub async fn serve(
        &self,
        listener: TcpListener,
        shutdown: impl Future<Output = ()>,
    ) -> anyhow::Result<()> {
        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(conn) => conn,
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let server = self.clone();
                    tokio::spawn(async move {
                        if let Err(e) = server.handle_connection(stream, peer).await {
                            tracing::debug!(%peer, error = %e, "connection error");
                        }
                    });
                }
                _ = &mut shutdown => {
                    tracing::info!("shutting down");
                    return Ok(());
                }
            }
        }
    }

    /// Serve one client connection.
    pub async fn handle_connection(
        &self,
        stream: TcpStream,
        peer: SocketAddr,
    ) -> anyhow::Result<()> {
        let service = Arc::new(tokio::sync::Mutex::new(self.stack()));
        let handler = hyper::service::service_fn(move |req: Request<Incoming>| {
            let service = service.clone();
            async move {
                let req = req.map(crate::http::incoming_to_body);
                let method = req.method().clone();
                let path = req.uri().path().to_string();
                let fut = {
                    let mut svc = service.lock().await;
                    match svc.ready().await {
                        Ok(svc) => svc.call(req),
                        Err(e) => return Ok::<_, BoxError>(bad_gateway(peer, &e)),
                    }
                };
                match fut.await {
                    Ok(resp) => {
                        tracing::debug!(%peer, %method, %path, status = resp.status().as_u16(), "served");
                        Ok(resp)
                    }
                    Err(e) => Ok(bad_gateway(peer, &e)),
                }
            }
        });

        let conn: std::pin::Pin<Box<dyn Future<Output = Result<(), hyper::Error>> + Send>> =
            Box::pin(
                hyper::server::conn::http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), handler),
            );
        conn.await?;
        Ok(())
    }

    fn stack(&self) -> HttpService {
        let mut service = (self.inner.app)();
        for layer in self.inner.layers.iter().rev() {
            service = layer(service);
        }
        service
    }
}

fn bad_gateway(peer: SocketAddr, error: &BoxError) -> Response<Body> {
    tracing::warn!(%peer, error = %error, "request failed");
    json_response(
        StatusCode::BAD_GATEWAY,
        &ErrorBody {
            error: "bad_gateway",
            message: error.to_string(),
        },
    )
}
