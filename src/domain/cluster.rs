use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use log::{error, info, warn};
use rand::Rng;
use tokio::sync::RwLock;

use crate::{
    config::ClusterConfig,
    error::{ClusterError, Error, Result},
};

use super::{
    event::OutputWriter,
    model::{ContainerSpec, ManagerRecord, Task, TaskState},
    port::{ClusterConnector, ClusterHandle, ClusterStorage},
};

pub const TASK_WAIT_TIMEOUT: Duration = Duration::from_secs(300);
const TASK_POLL_INTERVAL: Duration = Duration::from_millis(100);
pub const CONTAINER_CHECK_INTERVAL: Duration = Duration::from_secs(20);
pub const PULL_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);

/// Entry point to the swarm: knows the managers and picks a live one.
pub struct Cluster {
    connector: Arc<dyn ClusterConnector + Send + Sync>,
    storage: Arc<dyn ClusterStorage + Send + Sync>,
    config: ClusterConfig,
    managers: RwLock<Option<ManagerRecord>>,
}

impl Cluster {
    pub fn new(
        connector: Arc<dyn ClusterConnector + Send + Sync>,
        storage: Arc<dyn ClusterStorage + Send + Sync>,
        config: ClusterConfig,
    ) -> Self {
        Self {
            connector,
            storage,
            config,
            managers: RwLock::new(None),
        }
    }

    /// Known managers, from cache, then store, then configuration seed.
    pub async fn managers(&self) -> Result<ManagerRecord> {
        if let Some(record) = self.managers.read().await.as_ref() {
            return Ok(record.clone());
        }
        let record = match self.storage.load_managers().await? {
            Some(record) => record,
            None => {
                let seed = ManagerRecord {
                    addresses: self.config.managers.clone(),
                    tls: self.config.tls.clone(),
                };
                if !seed.addresses.is_empty() {
                    self.storage.save_managers(&seed).await?;
                }
                seed
            }
        };
        *self.managers.write().await = Some(record.clone());
        Ok(record)
    }

    pub async fn set_managers(&self, record: ManagerRecord) -> Result<()> {
        self.storage.save_managers(&record).await?;
        *self.managers.write().await = Some(record);
        Ok(())
    }

    /// Pings up to `max-manager-tries` managers round robin from a random
    /// start and returns the first live one.
    pub async fn choose_manager(&self) -> Result<ClusterHandle> {
        let record = self.managers().await?;
        if record.addresses.is_empty() {
            return Err(Error::NoManagers);
        }
        let start = rand::thread_rng().gen_range(0..record.addresses.len());
        self.try_managers(&record, start).await
    }

    async fn try_managers(&self, record: &ManagerRecord, start: usize) -> Result<ClusterHandle> {
        let count = record.addresses.len();
        let dial_timeout = Duration::from_secs(self.config.dial_timeout);
        let mut last_error = Error::NoManagers;
        for attempt in 0..self.config.max_manager_tries.max(1) {
            let address = &record.addresses[(start + attempt) % count];
            let client = match self
                .connector
                .connect(address, record.tls.as_ref(), dial_timeout)
                .await
            {
                Ok(client) => client,
                Err(err) => {
                    warn!("Can't connect to manager {}: {}", address, err);
                    last_error = err.into();
                    continue;
                }
            };
            match client.ping().await {
                Ok(()) => {
                    if attempt > 0 {
                        self.refresh_managers(&client, record).await;
                    }
                    return Ok(client);
                }
                Err(err) => {
                    warn!("Manager {} is not responding: {}", address, err);
                    last_error = err.into();
                }
            }
        }
        Err(last_error)
    }

    async fn refresh_managers(&self, client: &ClusterHandle, current: &ManagerRecord) {
        let nodes = match client.list_managers().await {
            Ok(nodes) => nodes,
            Err(err) => {
                error!("Can't list managers from {}: {}", client.address(), err);
                return;
            }
        };
        let addresses: Vec<String> = nodes
            .into_iter()
            .map(|node| node.addr)
            .filter(|addr| !addr.is_empty())
            .collect();
        if addresses.is_empty() || addresses == current.addresses {
            return;
        }
        info!("Updating known managers to {:?}", addresses);
        let record = ManagerRecord {
            addresses,
            tls: current.tls.clone(),
        };
        if let Err(err) = self.set_managers(record).await {
            error!("Can't persist managers: {}", err);
        }
    }
}

/// Polls the tasks of a service until all of them reached their desired
/// state or one of `wanted`. Failed or rejected tasks abort the wait.
pub async fn wait_for_tasks(
    client: &ClusterHandle,
    service_id: &str,
    wanted: &[TaskState],
    timeout: Duration,
) -> Result<Vec<Task>> {
    let deadline = Instant::now() + timeout;
    let filters = HashMap::from([("service".to_string(), vec![service_id.to_string()])]);
    loop {
        let tasks = client.list_tasks(filters.clone()).await?;
        let mut in_state = 0;
        for task in &tasks {
            if wanted.contains(&task.state) {
                in_state += 1;
                continue;
            }
            if task.state == task.desired_state {
                in_state += 1;
            }
            if matches!(task.state, TaskState::Failed | TaskState::Rejected) {
                return Err(Error::InvalidTaskState {
                    service: service_id.to_string(),
                    status: task.status_message(),
                });
            }
        }
        if !tasks.is_empty() && in_state == tasks.len() {
            return Ok(tasks);
        }
        if Instant::now() >= deadline {
            return Err(Error::Timeout(format!(
                "task for service {service_id:?} to be ready"
            )));
        }
        tokio::time::sleep(TASK_POLL_INTERVAL).await;
    }
}

/// Creates a container, pulling its image once when the node lacks it.
pub async fn create_container_pulling(
    client: &ClusterHandle,
    spec: &ContainerSpec,
    out: &(dyn OutputWriter + Send + Sync),
) -> Result<String> {
    match client.create_container(spec).await {
        Err(ClusterError::NoSuchImage(image)) => {
            info!("Image {} missing on {}, pulling", image, client.address());
            client
                .pull_image(&spec.image, out, PULL_INACTIVITY_TIMEOUT)
                .await?;
            Ok(client.create_container(spec).await?)
        }
        created => Ok(created?),
    }
}

/// Attaches to a started container and waits for its exit code. The
/// container is inspected every `check_every`; if it already stopped the
/// observed exit code is returned even when attach never returned.
pub async fn safe_attach_wait(
    client: &ClusterHandle,
    container_id: &str,
    out: &(dyn OutputWriter + Send + Sync),
    check_every: Duration,
) -> Result<i64> {
    let attach_and_wait = async {
        client.attach_container(container_id, out).await?;
        client.wait_container(container_id).await
    };
    tokio::pin!(attach_and_wait);
    let mut ticker = tokio::time::interval(check_every);
    ticker.tick().await;
    loop {
        tokio::select! {
            exit = &mut attach_and_wait => return Ok(exit?),
            _ = ticker.tick() => {
                let info = client.inspect_container(container_id).await?;
                if !info.running {
                    return Ok(info.exit_code);
                }
            }
        }
    }
}
