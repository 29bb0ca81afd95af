//! MITM proxy server.
//!
//! Ties the pieces together: the root CA and certificate cache terminate TLS,
//! the [`GatewayHandler`] feeds every request to the current router.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use hudsucker::rustls::crypto::aws_lc_rs::default_provider;
use hudsucker::Proxy;
use tokio::net::TcpListener;
use tokio::sync::broadcast;

use wayproxy_core::{GatewayConfig, ProxyOptions};
use wayproxy_storage::ArchiveStore;

use crate::ca::CaManager;
use crate::cert_cache::CertificateCache;
use crate::error::{ProxyError, Result};
use crate::handler::GatewayHandler;
use crate::router::{FrontEndRouter, RouterSlot};
use crate::upstream::UpstreamClient;

/// Gateway proxy server, ready to start.
pub struct ProxyServer {
    addr: SocketAddr,
    certs: CertificateCache,
    store: Arc<dyn ArchiveStore>,
    upstream: UpstreamClient,
    routers: RouterSlot,
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("addr", &self.addr)
            .field("certs", &self.certs)
            .field("router", &self.routers.current())
            .finish_non_exhaustive()
    }
}

impl ProxyServer {
    /// Prepares a server from the gateway configuration.
    ///
    /// Loads (or generates) the root CA and builds the router, so a broken
    /// root or invalid options fail here rather than on the first request.
    pub fn new(config: &GatewayConfig, store: Arc<dyn ArchiveStore>) -> Result<Self> {
        config.validate()?;

        let ca = CaManager::from_options(&config.proxy);
        let root = ca.ensure_root()?;
        let certs = CertificateCache::new(Arc::new(root), config.proxy.cert_cache_dir())?;

        let upstream = UpstreamClient::new(&config.upstream)?;
        let router = FrontEndRouter::new(config.proxy.clone(), store.clone(), upstream.clone())?;

        Ok(Self {
            addr: config.listen.addr(),
            certs,
            store,
            upstream,
            routers: RouterSlot::new(router),
        })
    }

    /// Sets the listen address.
    pub fn with_addr(mut self, addr: SocketAddr) -> Self {
        self.addr = addr;
        self
    }

    /// Returns the address the proxy is configured to listen on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the root certificate, PEM encoded, for client trust stores.
    pub fn ca_cert_pem(&self) -> &str {
        self.certs.root().cert_pem()
    }

    /// Runs the proxy until `shutdown` resolves, then closes the recorder.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let handle = self.start().await?;
        shutdown.await;
        handle.stop().await
    }

    /// Binds the listen address and serves in the background.
    ///
    /// Returns a handle that can be used to stop the server.
    pub async fn start(self) -> Result<ProxyHandle> {
        let listener = TcpListener::bind(self.addr).await?;
        let addr = listener.local_addr()?;

        let (shutdown_tx, _) = broadcast::channel::<()>(1);
        let mut shutdown_rx = shutdown_tx.subscribe();

        let proxy = Proxy::builder()
            .with_listener(listener)
            .with_ca(self.certs.clone())
            .with_rustls_connector(default_provider())
            .with_http_handler(GatewayHandler::new(self.routers.clone()))
            .build()
            .map_err(|e| ProxyError::Proxy(e.to_string()))?;

        let route = self.routers.current().route().clone();
        tracing::info!("Starting proxy on {} serving {}", addr, route);
        tracing::info!(
            "Root CA {:?} (fingerprint {})",
            self.certs.root().name(),
            self.certs.root().short_fingerprint()
        );

        let handle = tokio::spawn(async move {
            tokio::select! {
                result = proxy.start() => {
                    if let Err(e) = result {
                        tracing::error!("Proxy error: {}", e);
                    }
                }
                _ = shutdown_rx.recv() => {
                    tracing::info!("Proxy shutdown signal received");
                }
            };
        });

        Ok(ProxyHandle {
            shutdown_tx,
            addr,
            handle,
            certs: self.certs,
            store: self.store,
            upstream: self.upstream,
            routers: self.routers,
        })
    }
}

/// Handle for controlling a running proxy server.
pub struct ProxyHandle {
    shutdown_tx: broadcast::Sender<()>,
    addr: SocketAddr,
    handle: tokio::task::JoinHandle<()>,
    certs: CertificateCache,
    store: Arc<dyn ArchiveStore>,
    upstream: UpstreamClient,
    routers: RouterSlot,
}

impl ProxyHandle {
    /// Returns the address the proxy is listening on.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Returns the root certificate, PEM encoded.
    pub fn ca_cert_pem(&self) -> &str {
        self.certs.root().cert_pem()
    }

    /// Returns the certificate cache.
    pub fn certificates(&self) -> &CertificateCache {
        &self.certs
    }

    /// Returns the router currently serving requests.
    pub fn router(&self) -> Arc<FrontEndRouter> {
        self.routers.current()
    }

    /// Rebuilds the router with new options.
    ///
    /// Requests already in flight finish on the old router; its recorder is
    /// closed once they are done with it.
    pub async fn reconfigure(&self, options: ProxyOptions) -> Result<()> {
        let router = FrontEndRouter::new(options, self.store.clone(), self.upstream.clone())?;
        let previous = self.routers.replace(router);
        close_recorder(&previous).await
    }

    /// Signals the proxy to shut down.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Shuts down the proxy, waits for it to finish and closes the recorder.
    pub async fn stop(self) -> Result<()> {
        self.shutdown();
        if let Err(e) = self.handle.await {
            tracing::error!("Proxy task failed: {}", e);
        }

        let result = close_recorder(&self.routers.current()).await;
        tracing::info!("Proxy server stopped");
        result
    }
}

async fn close_recorder(router: &FrontEndRouter) -> Result<()> {
    match router.recorder() {
        Some(recorder) => recorder.close().await.map_err(ProxyError::from),
        None => Ok(()),
    }
}
