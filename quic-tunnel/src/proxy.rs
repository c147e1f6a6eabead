//! Local HTTP proxy in front of the tunnel
//!
//! `CONNECT host:port` requests get a raw tunnel stream spliced onto the
//! upgraded client connection. Absolute-form requests
//! (`GET http://host/path`) are replayed over a tunnel stream in origin-form
//! and the response is streamed back. Every request has to pass
//! [`crate::auth::verify`] first.

use http_body_util::BodyExt;

pub type ProxyBody = http_body_util::combinators::BoxBody<bytes::Bytes, hyper::Error>;

pub struct Proxy<C: crate::Connector = crate::QuicConnector> {
    manager: crate::ConnectionManager<C>,
    remote_addr: String,
    credentials: crate::auth::Credentials,
}

impl<C: crate::Connector> Proxy<C> {
    pub fn new(
        manager: crate::ConnectionManager<C>,
        remote_addr: impl Into<String>,
        credentials: crate::auth::Credentials,
    ) -> Self {
        Self {
            manager,
            remote_addr: remote_addr.into(),
            credentials,
        }
    }

    async fn serve_connection(
        self: std::sync::Arc<Self>,
        tcp: tokio::net::TcpStream,
        peer: std::net::SocketAddr,
    ) {
        let service = hyper::service::service_fn(move |req| {
            let proxy = self.clone();
            async move { proxy.handle(req).await }
        });

        if let Err(e) = hyper::server::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .serve_connection(hyper_util::rt::TokioIo::new(tcp), service)
            .with_upgrades()
            .await
        {
            tracing::debug!("Proxy connection from {peer} ended: {e}");
        }
    }

    async fn handle(
        &self,
        mut req: http::Request<hyper::body::Incoming>,
    ) -> Result<http::Response<ProxyBody>, hyper::Error> {
        if !crate::auth::verify(req.headers_mut(), &self.credentials) {
            tracing::warn!("Proxy auth failed for {} {}", req.method(), req.uri());
            return Ok(crate::auth::not_found().map(|body| {
                body.map_err(|never| match never {}).boxed()
            }));
        }

        if req.method() == http::Method::CONNECT {
            self.connect(req).await
        } else {
            self.forward(req).await
        }
    }

    async fn connect(
        &self,
        req: http::Request<hyper::body::Incoming>,
    ) -> Result<http::Response<ProxyBody>, hyper::Error> {
        let Some(target) = req.uri().authority().map(|authority| {
            match authority.port_u16() {
                Some(_) => authority.to_string(),
                None => format!("{}:443", authority.host()),
            }
        }) else {
            return Ok(status(http::StatusCode::BAD_REQUEST));
        };

        let mut stream = match self.manager.dial(&self.remote_addr, &target).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("CONNECT {target} failed: {e}");
                return Ok(status(http::StatusCode::BAD_GATEWAY));
            }
        };

        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut upgraded = hyper_util::rt::TokioIo::new(upgraded);
                    match tokio::io::copy_bidirectional(&mut upgraded, &mut stream).await {
                        Ok((sent, received)) => tracing::info!(
                            "CONNECT {target} finished: {sent} bytes sent, {received} bytes received"
                        ),
                        Err(e) => tracing::debug!("CONNECT {target} ended: {e}"),
                    }
                }
                Err(e) => tracing::error!("Upgrade for CONNECT {target} failed: {e}"),
            }
        });

        Ok(http::Response::new(empty()))
    }

    async fn forward(
        &self,
        mut req: http::Request<hyper::body::Incoming>,
    ) -> Result<http::Response<ProxyBody>, hyper::Error> {
        let Some(host) = req.uri().host() else {
            tracing::warn!("Request without host: {} {}", req.method(), req.uri());
            return Ok(status(http::StatusCode::BAD_REQUEST));
        };
        // https origins are only reachable through CONNECT
        if req.uri().scheme() != Some(&http::uri::Scheme::HTTP) {
            tracing::warn!("Refusing to forward {} {} as plain HTTP", req.method(), req.uri());
            return Ok(status(http::StatusCode::BAD_REQUEST));
        }
        let target = format!("{host}:{}", req.uri().port_u16().unwrap_or(80));

        let stream = match self.manager.dial(&self.remote_addr, &target).await {
            Ok(stream) => stream,
            Err(e) => {
                tracing::error!("{} {} failed: {e}", req.method(), req.uri());
                return Ok(status(http::StatusCode::BAD_GATEWAY));
            }
        };

        let (mut sender, connection) = match hyper::client::conn::http1::Builder::new()
            .preserve_header_case(true)
            .title_case_headers(true)
            .handshake(hyper_util::rt::TokioIo::new(stream))
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                tracing::error!("HTTP handshake over tunnel to {target} failed: {e}");
                return Ok(status(http::StatusCode::BAD_GATEWAY));
            }
        };
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                tracing::debug!("Tunnel HTTP connection closed: {e}");
            }
        });

        let origin_form = req
            .uri()
            .path_and_query()
            .map_or("/", |path| path.as_str())
            .parse::<http::Uri>();
        match origin_form {
            Ok(uri) => *req.uri_mut() = uri,
            Err(e) => {
                tracing::warn!("Cannot rewrite {}: {e}", req.uri());
                return Ok(status(http::StatusCode::BAD_REQUEST));
            }
        }
        req.headers_mut().remove("proxy-connection");

        tracing::info!("{} {target}{}", req.method(), req.uri());
        match sender.send_request(req).await {
            Ok(response) => Ok(response.map(|body| body.boxed())),
            Err(e) => {
                tracing::error!("Request to {target} failed: {e}");
                Ok(status(http::StatusCode::BAD_GATEWAY))
            }
        }
    }
}

/// Serve proxy clients from `listener` until `shutdown` fires.
pub async fn run<C: crate::Connector>(
    listener: tokio::net::TcpListener,
    proxy: std::sync::Arc<Proxy<C>>,
    shutdown: tokio_util::sync::CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                tracing::info!("Shutting down proxy");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    tokio::spawn(proxy.clone().serve_connection(tcp, peer));
                }
                Err(e) => tracing::error!("Failed to accept proxy connection: {e}"),
            },
        }
    }
}

fn empty() -> ProxyBody {
    http_body_util::Empty::<bytes::Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn status(code: http::StatusCode) -> http::Response<ProxyBody> {
    let mut response = http::Response::new(empty());
    *response.status_mut() = code;
    response
}
