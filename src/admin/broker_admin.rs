use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info};

use super::configuration::AdminSettings;
use super::{BrokerRpc, QueueInfo, RabbitStatus, RpcError, RpcValue};

const DEFAULT_VHOST: &str = "/";

/// How often the broker status is polled while waiting for a state change.
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Error returned by [`BrokerAdmin`].
#[derive(thiserror::Error, Debug)]
pub enum AdminError {
    /// The broker node is up, but we are not allowed to talk to it.
    #[error(
        "Could not authorise connection to the broker node. This can happen if the broker is \
         running as a different user and the cookie does not match"
    )]
    Auth(#[source] anyhow::Error),
    #[error("Remote call to the broker node failed")]
    Rpc(#[source] anyhow::Error),
    #[error("{module}:{function} failed on the broker node: {reason}")]
    Remote {
        module: String,
        function: String,
        reason: String,
    },
    #[error("The broker did not reach the {state} state before the timeout")]
    Timeout { state: &'static str },
    #[error("The broker node is not running")]
    NodeNotRunning,
    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

impl From<RpcError> for AdminError {
    fn from(err: RpcError) -> Self {
        match err {
            RpcError::Auth(e) => Self::Auth(e),
            RpcError::Call(e) => Self::Rpc(e),
        }
    }
}

/// Administers a RabbitMq node through a [`BrokerRpc`] collaborator.
///
/// Operations that change the state of the broker (starting or stopping the application,
/// stopping the node) wait for the broker to reach the expected state, for at most
/// [`AdminSettings::startup_timeout`]. A broker that does not get there in time is stopped and
/// the operation fails with [`AdminError::Timeout`]: there is no retry.
#[derive(Clone)]
pub struct BrokerAdmin {
    rpc: Arc<dyn BrokerRpc>,
    settings: Arc<AdminSettings>,
}

impl BrokerAdmin {
    pub fn new(rpc: Arc<dyn BrokerRpc>, settings: AdminSettings) -> Self {
        Self {
            rpc,
            settings: Arc::new(settings),
        }
    }

    pub fn settings(&self) -> &AdminSettings {
        &self.settings
    }

    /// Queues declared in `vhost`.
    pub async fn list_queues(&self, vhost: &str) -> Result<Vec<QueueInfo>, AdminError> {
        let reply = self
            .execute("rabbit_amqqueue", "info_all", &[arg(vhost)])
            .await?;
        Ok(reply
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(QueueInfo::from_reply)
            .collect())
    }

    pub async fn add_user(&self, username: &str, password: &str) -> Result<(), AdminError> {
        self.execute(
            "rabbit_auth_backend_internal",
            "add_user",
            &[arg(username), arg(password)],
        )
        .await
        .map(drop)
    }

    pub async fn delete_user(&self, username: &str) -> Result<(), AdminError> {
        self.execute("rabbit_auth_backend_internal", "delete_user", &[arg(username)])
            .await
            .map(drop)
    }

    pub async fn change_user_password(
        &self,
        username: &str,
        new_password: &str,
    ) -> Result<(), AdminError> {
        self.execute(
            "rabbit_auth_backend_internal",
            "change_password",
            &[arg(username), arg(new_password)],
        )
        .await
        .map(drop)
    }

    pub async fn list_users(&self) -> Result<Vec<String>, AdminError> {
        let reply = self
            .execute("rabbit_auth_backend_internal", "list_users", &[])
            .await?;
        // Older brokers return plain names, newer ones `[{user, Name}, {tags, Tags}]`.
        Ok(reply
            .as_list()
            .unwrap_or_default()
            .iter()
            .filter_map(|user| match user.property("user") {
                Some(name) => name.as_text(),
                None => user.as_text(),
            })
            .collect())
    }

    pub async fn add_vhost(&self, vhost: &str) -> Result<(), AdminError> {
        self.execute("rabbit_vhost", "add", &[arg(vhost)])
            .await
            .map(drop)
    }

    pub async fn delete_vhost(&self, vhost: &str) -> Result<(), AdminError> {
        self.execute("rabbit_vhost", "delete", &[arg(vhost)])
            .await
            .map(drop)
    }

    /// Grant `username` permissions on `vhost` (the default vhost if `None`).
    pub async fn set_permissions(
        &self,
        username: &str,
        configure: &str,
        read: &str,
        write: &str,
        vhost: Option<&str>,
    ) -> Result<(), AdminError> {
        let vhost = vhost.unwrap_or(DEFAULT_VHOST);
        self.execute(
            "rabbit_auth_backend_internal",
            "set_permissions",
            &[arg(username), arg(vhost), arg(configure), arg(read), arg(write)],
        )
        .await
        .map(drop)
    }

    pub async fn clear_permissions(
        &self,
        username: &str,
        vhost: Option<&str>,
    ) -> Result<(), AdminError> {
        let vhost = vhost.unwrap_or(DEFAULT_VHOST);
        self.execute(
            "rabbit_auth_backend_internal",
            "clear_permissions",
            &[arg(username), arg(vhost)],
        )
        .await
        .map(drop)
    }

    /// Start the RabbitMq application on a node that is already running, then wait for it
    /// to be ready.
    pub async fn start_broker_application(&self) -> Result<(), AdminError> {
        let status = self.status().await?;
        if status.is_ready() {
            info!("Rabbit application already running");
            return Ok(());
        }
        if !status.is_alive() {
            info!("Rabbit process not running");
            return Err(AdminError::NodeNotRunning);
        }
        info!("Starting Rabbit application");
        self.execute("rabbit", "start", &[]).await?;
        if self.wait_for_state(RabbitStatus::is_ready, "ready").await? {
            Ok(())
        } else {
            Err(AdminError::Timeout { state: "ready" })
        }
    }

    /// Stop the RabbitMq application, leaving the Erlang node running.
    pub async fn stop_broker_application(&self) -> Result<(), AdminError> {
        info!("Stopping Rabbit application");
        self.execute("rabbit", "stop", &[]).await?;
        if self.wait_for_state(|status| !status.is_ready(), "unready").await? {
            Ok(())
        } else {
            Err(AdminError::Timeout { state: "unready" })
        }
    }

    /// Stop and halt the Erlang node. It will have to be restarted by other means.
    pub async fn stop_node(&self) -> Result<(), AdminError> {
        info!("Stopping RabbitMq node");
        if let Err(e) = self.execute("rabbit", "stop_and_halt", &[]).await {
            error!("Failed to send stop signal: {:?}", e);
        }
        let stopped = |status: &RabbitStatus| !status.is_ready() && !status.is_running();
        if self.poll_for_state(stopped, "stopped").await? {
            Ok(())
        } else {
            Err(AdminError::Timeout { state: "stopped" })
        }
    }

    /// Remove the node from its cluster and wipe its data (users, vhosts, persistent messages).
    pub async fn reset_node(&self) -> Result<(), AdminError> {
        self.execute("rabbit_mnesia", "reset", &[]).await.map(drop)
    }

    /// Like [`reset_node`](Self::reset_node), regardless of the cluster state. Last resort.
    pub async fn force_reset_node(&self) -> Result<(), AdminError> {
        self.execute("rabbit_mnesia", "force_reset", &[])
            .await
            .map(drop)
    }

    /// The current status of the node.
    ///
    /// A node that cannot be reached reads as a node that is not running; only authorisation
    /// failures and configuration errors are surfaced.
    pub async fn status(&self) -> Result<RabbitStatus, AdminError> {
        let replies = async {
            let rabbit = self.execute("rabbit", "status", &[]).await?;
            let mnesia = self.execute("rabbit_mnesia", "status", &[]).await?;
            Ok::<_, AdminError>((rabbit, mnesia))
        };
        match replies.await {
            Ok((rabbit, mnesia)) => Ok(RabbitStatus::from_replies(&rabbit, &mnesia)),
            Err(e @ (AdminError::Auth(_) | AdminError::Configuration(_))) => Err(e),
            Err(e) => {
                debug!("Status not available, assuming the broker is not running: {:?}", e);
                Ok(RabbitStatus::default())
            }
        }
    }

    /// Wait until `predicate` holds for the broker status.
    ///
    /// The status is polled on a background task, bounded by the startup timeout. If the state
    /// is not reached in time the polling task is cancelled, the node is stopped and `false`
    /// is returned. Always `true` when waiting is disabled.
    pub async fn wait_for_state<F>(&self, predicate: F, state: &str) -> Result<bool, AdminError>
    where
        F: Fn(&RabbitStatus) -> bool + Send + Sync + 'static,
    {
        if self.poll_for_state(predicate, state).await? {
            return Ok(true);
        }
        error!("Rabbit broker not in {state} state after timeout. Stopping process.");
        if let Err(e) = self.stop_node().await {
            error!("Failed to stop the broker node: {:?}", e);
        }
        Ok(false)
    }

    async fn poll_for_state<F>(&self, predicate: F, state: &str) -> Result<bool, AdminError>
    where
        F: Fn(&RabbitStatus) -> bool + Send + Sync + 'static,
    {
        let Some(timeout) = self.settings.startup_timeout() else {
            return Ok(true);
        };
        let status = self.status().await?;
        if predicate(&status) {
            info!("Broker already in state: {state}");
            return Ok(true);
        }

        info!("Waiting for broker to enter state: {state}");
        let admin = self.clone();
        let mut poll = tokio::spawn(async move {
            loop {
                tokio::time::sleep(POLL_INTERVAL).await;
                let status = admin.status().await?;
                debug!("Waiting for state, current status: {status}");
                if predicate(&status) {
                    return Ok::<_, AdminError>(status);
                }
            }
        });
        match tokio::time::timeout(timeout, &mut poll).await {
            Ok(Ok(Ok(status))) => {
                info!("Finished waiting for broker to enter state: {state}");
                debug!("Status: {status}");
                Ok(true)
            }
            Ok(Ok(Err(e))) => Err(e),
            Ok(Err(e)) => {
                error!("Error occurred waiting for the broker state: {:?}", e);
                Ok(false)
            }
            Err(_) => {
                poll.abort();
                Ok(false)
            }
        }
    }

    /// All remote calls go through here: applies the module adapter and turns
    /// `{badrpc, _}` / `{error, _}` replies into errors.
    async fn execute(
        &self,
        module: &str,
        function: &str,
        args: &[Vec<u8>],
    ) -> Result<RpcValue, AdminError> {
        let (module, function) = self.adapt(module, function)?;
        let reply = self.rpc.execute_rpc(&module, &function, args).await?;
        if let Some(reason) = reply.error_reason() {
            return Err(AdminError::Remote {
                module,
                function,
                reason: format!("{reason:?}"),
            });
        }
        Ok(reply)
    }

    fn adapt(&self, module: &str, function: &str) -> Result<(String, String), AdminError> {
        let key = format!("{module}%{function}");
        match self.settings.module_adapter.get(&key) {
            None => Ok((module.to_owned(), function.to_owned())),
            Some(adapter) => match adapter.split_once('%') {
                Some((module, function)) if !module.is_empty() && !function.is_empty() => {
                    Ok((module.to_owned(), function.to_owned()))
                }
                _ => Err(AdminError::Configuration(format!(
                    "The module adapter should map 'module%function' to 'module%function'. \
                     [{adapter}] cannot be parsed to a module, function pair."
                ))),
            },
        }
    }
}

/// String arguments travel as UTF-8 binaries.
fn arg(value: &str) -> Vec<u8> {
    value.as_bytes().to_vec()
}
