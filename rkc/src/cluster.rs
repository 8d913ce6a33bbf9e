use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use libsession::{Session, SessionError, StorageRoute};
use libstorage::{
    ClusterDirectory, LocationCache, MetaService, NodeStorage, NodeStorageConfig,
    StorageApiCache, TunnelState, create_router,
};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::Config;
use crate::server;
use crate::sessions::LocalSessionService;

struct Tunnel {
    base_url: String,
    stop: oneshot::Sender<()>,
    task: JoinHandle<Result<()>>,
}

/// Supervisor, worker storages and the storage tunnel in one process.
pub struct LocalCluster {
    config: Config,
    nodes: Vec<Arc<NodeStorage>>,
    storage: Arc<StorageApiCache>,
    meta: Arc<MetaService>,
    sessions: Arc<LocalSessionService>,
    tunnel: Option<Tunnel>,
}

impl LocalCluster {
    pub fn new(config: &Config) -> Result<Self> {
        if config.nodes.is_empty() {
            anyhow::bail!("a local cluster needs at least one node");
        }
        let nodes: Vec<Arc<NodeStorage>> = config
            .nodes
            .iter()
            .map(|name| {
                let node_config = NodeStorageConfig {
                    disk_root: config.storage.disk_root.as_ref().map(|root| root.join(name)),
                };
                Arc::new(NodeStorage::new(name.clone(), node_config))
            })
            .collect();
        let directory = Arc::new(ClusterDirectory::new(nodes.iter().cloned()));
        let storage = Arc::new(StorageApiCache::new(
            directory,
            config.storage.handle_cache_capacity,
        ));
        let meta = Arc::new(MetaService::new());
        let sessions = Arc::new(LocalSessionService::new(
            nodes.clone(),
            meta.clone(),
            storage.clone(),
        ));
        info!("Local cluster up with nodes {:?}", config.nodes);
        Ok(Self {
            config: config.clone(),
            nodes,
            storage,
            meta,
            sessions,
            tunnel: None,
        })
    }

    pub fn nodes(&self) -> &[Arc<NodeStorage>] {
        &self.nodes
    }

    pub fn meta(&self) -> &Arc<MetaService> {
        &self.meta
    }

    pub fn session_service(&self) -> Arc<LocalSessionService> {
        self.sessions.clone()
    }

    /// Router of the storage tunnel, backed by this cluster's nodes.
    pub fn tunnel_router(&self) -> Router {
        let state = Arc::new(TunnelState {
            meta: self.meta.clone(),
            storage: self.storage.clone(),
            locations: LocationCache::new(
                self.config.meta_cache.capacity,
                self.config.location_ttl(),
            ),
        });
        create_router(state)
    }

    /// Binds the configured address and serves the tunnel in the background.
    /// Returns the tunnel's base url.
    pub async fn start_tunnel(&mut self) -> Result<String> {
        if let Some(tunnel) = &self.tunnel {
            return Ok(tunnel.base_url.clone());
        }
        let listener = TcpListener::bind(&self.config.addr)
            .await
            .with_context(|| format!("failed to bind {}", self.config.addr))?;
        let base_url = format!("http://{}", listener.local_addr()?);
        let (stop, stopped) = oneshot::channel();
        let router = self.tunnel_router();
        let task = tokio::spawn(async move {
            server::serve(listener, router, async move {
                let _ = stopped.await;
            })
            .await
        });
        self.tunnel = Some(Tunnel {
            base_url: base_url.clone(),
            stop,
            task,
        });
        Ok(base_url)
    }

    /// Session reading chunks straight from the nodes.
    pub async fn session(&self, session_id: Option<String>) -> Result<Session, SessionError> {
        Session::init(
            self.sessions.clone(),
            StorageRoute::Direct(self.storage.clone()),
            self.config.session_config(),
            session_id,
        )
        .await
    }

    /// Session reading chunks through the tunnel; starts it if needed.
    pub async fn web_session(&mut self, session_id: Option<String>) -> Result<Session> {
        let base_url = self.start_tunnel().await?;
        let session = Session::init(
            self.sessions.clone(),
            StorageRoute::web(base_url),
            self.config.session_config(),
            session_id,
        )
        .await?;
        Ok(session)
    }

    /// Deletes every session, then stops the tunnel.
    pub async fn shutdown(self) -> Result<()> {
        self.sessions.shutdown().await;
        if let Some(tunnel) = self.tunnel {
            let _ = tunnel.stop.send(());
            match tunnel.task.await {
                Ok(result) => result?,
                Err(e) => warn!("Tunnel task ended abnormally: {}", e),
            }
        }
        info!("Local cluster stopped");
        Ok(())
    }
}
