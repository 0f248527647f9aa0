//! Running every environment side by side.
//!
//! Each environment is supervised on its own: when its listener fails it is
//! restarted (up to a limit) or reported and left down, and the remaining
//! environments keep serving either way.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::credentials::CredentialContext;
use crate::observe::SharedSink;
use crate::proxy::{Connector, ProxyHandler};
use crate::server::listener::EnvironmentServer;

/// What to do when an environment's listener fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Supervision {
    /// Restarts allowed before the environment is given up. Zero means
    /// report the failure and leave the environment down.
    pub max_restarts: u32,
    /// Delay before each restart.
    pub backoff: Duration,
}

impl Default for Supervision {
    fn default() -> Self {
        Self {
            max_restarts: 0,
            backoff: Duration::from_secs(1),
        }
    }
}

/// How an environment ended.
#[derive(Debug)]
pub struct EnvironmentExit {
    pub environment: String,
    pub restarts: u32,
    /// `None` if the listener stopped cleanly.
    pub error: Option<anyhow::Error>,
}

/// A unit of work the group keeps running for one environment.
///
/// `run` is called again for every restart, so an implementation must be
/// able to start over after returning an error.
#[async_trait]
pub trait Service: Send + 'static {
    fn environment(&self) -> &str;

    fn local_addr(&self) -> Option<SocketAddr> {
        None
    }

    async fn run(&mut self) -> anyhow::Result<()>;
}

/// An environment listener that is rebound on the same address when it is
/// restarted.
pub struct RestartableListener {
    environment: String,
    addr: Option<SocketAddr>,
    handler: Arc<ProxyHandler>,
    bound: Option<EnvironmentServer>,
}

impl From<EnvironmentServer> for RestartableListener {
    fn from(server: EnvironmentServer) -> Self {
        Self {
            environment: server.environment().to_string(),
            addr: server.local_addr().ok(),
            handler: server.handler(),
            bound: Some(server),
        }
    }
}

#[async_trait]
impl Service for RestartableListener {
    fn environment(&self) -> &str {
        &self.environment
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    async fn run(&mut self) -> anyhow::Result<()> {
        let server = match self.bound.take() {
            Some(server) => server,
            None => {
                let addr = self
                    .addr
                    .ok_or_else(|| anyhow::anyhow!("listener address unknown"))?;
                EnvironmentServer::bind(addr, self.handler.clone()).await?
            }
        };
        server.serve().await
    }
}

pub struct ServerGroup {
    services: Vec<Box<dyn Service>>,
    supervision: Supervision,
}

impl ServerGroup {
    pub fn new(servers: Vec<EnvironmentServer>, supervision: Supervision) -> Self {
        let services = servers
            .into_iter()
            .map(|server| Box::new(RestartableListener::from(server)) as Box<dyn Service>)
            .collect();
        Self::from_services(services, supervision)
    }

    pub fn from_services(services: Vec<Box<dyn Service>>, supervision: Supervision) -> Self {
        Self {
            services,
            supervision,
        }
    }

    /// Binds a listener for every configured environment.
    ///
    /// Binding happens for all environments before any of them serves, so a
    /// port that cannot be bound aborts startup with nothing running.
    pub async fn bind(
        config: &Config,
        context: Arc<CredentialContext>,
        connector: Arc<dyn Connector>,
        sink: SharedSink,
    ) -> anyhow::Result<Self> {
        let mut servers = Vec::with_capacity(config.environments.len());

        for env in &config.environments {
            let handler = Arc::new(ProxyHandler::new(
                env,
                context.clone(),
                connector.clone(),
                sink.clone(),
            ));
            servers.push(EnvironmentServer::bind(env.listen_addr(config.bind), handler).await?);
        }

        Ok(Self::new(
            servers,
            Supervision {
                max_restarts: config.max_restarts,
                backoff: config.restart_backoff,
            },
        ))
    }

    /// Bound address of each environment, in configuration order.
    pub fn addresses(&self) -> Vec<(String, SocketAddr)> {
        self.services
            .iter()
            .filter_map(|s| Some((s.environment().to_string(), s.local_addr()?)))
            .collect()
    }

    /// Serves every environment concurrently and returns once all of them
    /// have exited.
    pub async fn run(self) -> Vec<EnvironmentExit> {
        let policy = self.supervision;
        let mut tasks = JoinSet::new();
        for mut service in self.services {
            tasks.spawn(async move { supervise(service.as_mut(), policy).await });
        }

        let mut exits = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(exit) => {
                    match &exit.error {
                        Some(e) => error!(
                            environment = %exit.environment,
                            restarts = exit.restarts,
                            "Environment stopped: {:#}",
                            e
                        ),
                        None => info!(environment = %exit.environment, "Environment stopped"),
                    }
                    exits.push(exit);
                }
                Err(e) => error!(error = %e, "Environment task aborted"),
            }
        }

        info!("Proxy has stopped");
        exits
    }
}

/// Runs `service` until it stops cleanly or has failed `policy.max_restarts + 1`
/// times.
pub async fn supervise<S>(service: &mut S, policy: Supervision) -> EnvironmentExit
where
    S: Service + ?Sized,
{
    let environment = service.environment().to_string();
    let mut restarts = 0;

    loop {
        let error = match service.run().await {
            Ok(()) => {
                return EnvironmentExit {
                    environment,
                    restarts,
                    error: None,
                };
            }
            Err(e) => e,
        };

        if restarts >= policy.max_restarts {
            return EnvironmentExit {
                environment,
                restarts,
                error: Some(error),
            };
        }

        restarts += 1;
        warn!(
            environment = %environment,
            restart = restarts,
            max_restarts = policy.max_restarts,
            "Environment listener failed, restarting: {:#}",
            error
        );
        tokio::time::sleep(policy.backoff).await;
    }
}
