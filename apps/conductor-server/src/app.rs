//! Application wiring: configuration, backends, engine

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use conductor_core::{AppConfig, LockBackendKind, StoreBackendKind};
use conductor_infra::{
    FileStateStore, HttpAgentClient, HttpApprovalClient, HttpClientConfig, HttpDecisionClient,
    RedisConfig, RedisLockBackend, RedisStateStore, WebhookConfig, WebhookNotifier,
};
use conductor_workflow::{
    spawn_dispatcher, EngineConfig, EventSink, InMemoryLockBackend, InMemoryStateStore,
    LockBackend, NotificationHook, ResourceLockManager, StateStore, TemplateStore, TracingHook,
    WorkflowEngine,
};

use crate::cli::Args;
use crate::server::Server;

const DEFAULT_DATA_DIR: &str = "data";

/// Main application
pub struct App {
    config: AppConfig,
    engine: WorkflowEngine,
    dispatcher: JoinHandle<()>,
}

impl App {
    pub async fn build(args: Args) -> Result<Self> {
        args.validate().context("Invalid command line arguments")?;

        let mut config = AppConfig::load_from_file(&args.config.to_string_lossy())
            .with_context(|| format!("Failed to load configuration from {}", args.config.display()))?;
        if let Some(port) = args.port {
            config.server.port = port;
        }
        if let Some(dir) = &args.templates {
            config.templates.dir = Some(dir.clone());
        }

        let templates = load_templates(&config)?;
        let store = build_store(&config).await?;
        let locks = build_locks(&config).await?;

        let (events, rx) = EventSink::channel(config.engine.event_buffer);
        let dispatcher = spawn_dispatcher(rx, build_hooks(&config)?);

        let mut builder = WorkflowEngine::builder()
            .templates(templates)
            .store(store)
            .locks(locks)
            .events(events)
            .config(EngineConfig::from(&config.engine));

        let clients = &config.clients;
        if let Some(url) = &clients.agent_url {
            let client = HttpAgentClient::new(HttpClientConfig::from_settings(url, clients))
                .context("Failed to build agent client")?;
            builder = builder.agent_client(Arc::new(client));
        } else {
            warn!("No agent service configured; agent steps will fail");
        }
        if let Some(url) = &clients.decision_url {
            let client = HttpDecisionClient::new(HttpClientConfig::from_settings(url, clients))
                .context("Failed to build decision client")?;
            builder = builder.decision_client(Arc::new(client));
        }
        if let Some(url) = &clients.approval_url {
            let client = HttpApprovalClient::new(HttpClientConfig::from_settings(url, clients))
                .context("Failed to build approval client")?;
            builder = builder.approval_client(Arc::new(client));
        }

        let engine = builder.build();

        if args.no_recover {
            info!("Skipping run recovery");
        } else {
            let recovered = engine.recover().await.context("Failed to recover runs")?;
            info!(recovered, "Recovered unfinished runs");
        }

        Ok(Self {
            config,
            engine,
            dispatcher,
        })
    }

    pub async fn run(self) -> Result<()> {
        let server = Server::new(self.config.server.clone(), self.engine.clone());
        server.run().await?;

        // Dropping the engine closes the event channel
        drop(self.engine);
        if tokio::time::timeout(std::time::Duration::from_secs(5), self.dispatcher)
            .await
            .is_err()
        {
            warn!("Event dispatcher did not drain in time");
        }
        Ok(())
    }
}

fn load_templates(config: &AppConfig) -> Result<Arc<TemplateStore>> {
    let templates = TemplateStore::new();
    match &config.templates.dir {
        Some(dir) => {
            templates
                .load_dir(dir)
                .with_context(|| format!("Failed to load templates from {}", dir.display()))?;
        }
        None => warn!("No template directory configured"),
    }
    Ok(Arc::new(templates))
}

async fn build_store(config: &AppConfig) -> Result<Arc<dyn StateStore>> {
    let settings = &config.store;
    let store: Arc<dyn StateStore> = match settings.backend {
        StoreBackendKind::Memory => {
            warn!("Using in-memory state store; runs will not survive a restart");
            Arc::new(InMemoryStateStore::new())
        }
        StoreBackendKind::File => {
            let path = settings
                .path
                .clone()
                .unwrap_or_else(|| DEFAULT_DATA_DIR.into());
            Arc::new(
                FileStateStore::new(path)
                    .await
                    .context("Failed to open file state store")?,
            )
        }
        StoreBackendKind::Redis => {
            let url = settings
                .redis_url
                .clone()
                .context("store.redis_url is required for the redis backend")?;
            let redis = RedisConfig::new(url).with_key_prefix(settings.key_prefix.clone());
            Arc::new(
                RedisStateStore::new(redis)
                    .await
                    .context("Failed to connect redis state store")?,
            )
        }
    };
    info!(backend = ?settings.backend, "State store ready");
    Ok(store)
}

async fn build_locks(config: &AppConfig) -> Result<Arc<ResourceLockManager>> {
    let settings = &config.locks;
    let backend: Arc<dyn LockBackend> = match settings.backend {
        LockBackendKind::Memory => Arc::new(InMemoryLockBackend::new()),
        LockBackendKind::Redis => {
            let url = settings
                .redis_url
                .clone()
                .or_else(|| config.store.redis_url.clone())
                .context("locks.redis_url is required for the redis backend")?;
            let redis = RedisConfig::new(url).with_key_prefix(config.store.key_prefix.clone());
            Arc::new(
                RedisLockBackend::new(redis)
                    .await
                    .context("Failed to connect redis lease backend")?,
            )
        }
    };
    info!(backend = ?settings.backend, "Lease backend ready");
    Ok(Arc::new(ResourceLockManager::new(
        backend,
        settings.poll_interval(),
        settings.default_ttl(),
    )))
}

fn build_hooks(config: &AppConfig) -> Result<Vec<Arc<dyn NotificationHook>>> {
    let mut hooks: Vec<Arc<dyn NotificationHook>> = vec![Arc::new(TracingHook)];
    if let Some(webhook) = WebhookConfig::from_settings(&config.notifications) {
        info!(url = %webhook.url, "Webhook notifications enabled");
        hooks.push(Arc::new(
            WebhookNotifier::new(webhook).context("Failed to build webhook notifier")?,
        ));
    }
    Ok(hooks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_file_store_from_config() {
        let dir = TempDir::new().unwrap();
        let mut config = AppConfig::default();
        config.store.backend = StoreBackendKind::File;
        config.store.path = Some(dir.path().to_path_buf());

        let store = build_store(&config).await.unwrap();
        assert!(store.list_runs(None).await.unwrap().is_empty());
        assert!(dir.path().join("runs").is_dir());
    }

    #[tokio::test]
    async fn test_redis_store_requires_url() {
        let mut config = AppConfig::default();
        config.store.backend = StoreBackendKind::Redis;
        assert!(build_store(&config).await.is_err());
    }

    #[test]
    fn test_templates_loaded_from_dir() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            dir.path().join("hello.yaml"),
            "name: hello\nsteps:\n  - id: greet\n    kind: agent_call\n    agent: greeter\n",
        )
        .unwrap();

        let mut config = AppConfig::default();
        config.templates.dir = Some(dir.path().to_path_buf());
        let templates = load_templates(&config).unwrap();
        assert!(templates.get("hello").is_ok());
    }

    #[test]
    fn test_webhook_hook_is_optional() {
        let mut config = AppConfig::default();
        assert_eq!(build_hooks(&config).unwrap().len(), 1);

        config.notifications.webhook_url = Some("http://127.0.0.1:9/hooks".to_string());
        assert_eq!(build_hooks(&config).unwrap().len(), 2);
    }
}
