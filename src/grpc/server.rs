use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::transport::server::Router;
use tonic::transport::Server;

use crate::config::DispatcherConfig;
use crate::error::Result;
use crate::grpc::resource_service::ResourceRpc;
use crate::proto::resource_service_server::ResourceServiceServer;
use crate::tls::TlsIdentity;
use crate::worker::Dispatcher;

/// Serves one dispatcher until the shutdown token fires.
pub struct ResourceServer {
    config: DispatcherConfig,
    dispatcher: Arc<Dispatcher>,
}

impl ResourceServer {
    pub fn new(config: DispatcherConfig, dispatcher: Arc<Dispatcher>) -> Self {
        Self { config, dispatcher }
    }

    async fn router(&self) -> Result<Router> {
        let mut builder = Server::builder();
        match TlsIdentity::from_config(&self.config.tls).await? {
            Some(tls) => {
                tracing::info!("mTLS enabled for resource server");
                builder = builder.tls_config(tls.server_tls_config())?;
            }
            None => tracing::warn!("Resource server running without TLS"),
        }
        Ok(builder.add_service(ResourceServiceServer::new(ResourceRpc::new(
            self.dispatcher.clone(),
        ))))
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let addr = self.config.listen_addr;
        let router = self.router().await?;
        tracing::info!(addr = %addr, "Starting resource server");
        router
            .serve_with_shutdown(addr, async move { shutdown.cancelled().await })
            .await?;
        tracing::info!("Resource server stopped");
        Ok(())
    }

    /// Serve on an already bound listener, e.g. an ephemeral test port.
    pub async fn run_with_listener(
        self,
        listener: TcpListener,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let router = self.router().await?;
        router
            .serve_with_incoming_shutdown(TcpListenerStream::new(listener), async move {
                shutdown.cancelled().await
            })
            .await?;
        Ok(())
    }
}
