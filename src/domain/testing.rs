//! In-memory swarm used by the domain tests.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Notify;

use crate::{
    config::{RegistryAuth, TlsConfig},
    error::ClusterError,
};

use super::{
    event::OutputWriter,
    model::{
        ContainerInfo, ContainerSpec, ImageInfo, Node, Service, ServiceSpec, Task, TaskState,
    },
    port::{ClusterClient, ClusterConnector, ClusterHandle},
};

#[derive(Clone, Debug, Default)]
pub struct FakeContainer {
    pub spec: ContainerSpec,
    pub started: bool,
    pub removed: bool,
    pub uploads: Vec<(String, Bytes)>,
}

#[derive(Default)]
struct State {
    calls: Vec<String>,
    dead: HashSet<String>,
    failures: HashSet<String>,
    managers: Vec<Node>,
    services: BTreeMap<String, Service>,
    task_state: Option<TaskState>,
    containers: BTreeMap<String, FakeContainer>,
    next_container: u64,
    exit_code: i64,
    hang_attach: bool,
    hold_upload: bool,
    outputs: Vec<(String, String)>,
    missing_images: HashSet<String>,
    image_info: HashMap<String, ImageInfo>,
    downloads: HashMap<String, Bytes>,
    push_failures: u32,
    pushed: Vec<String>,
    tagged: Vec<String>,
    removed_images: Vec<String>,
    open_clients: usize,
}

#[derive(Default)]
struct Gate {
    reached: Notify,
    release: Notify,
}

/// Clones share one state, so clients handed out by `connect` see every
/// change the test makes.
#[derive(Clone, Default)]
pub struct FakeCluster {
    state: Arc<Mutex<State>>,
    gate: Arc<Gate>,
}

impl FakeCluster {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn client(self: &Arc<Self>) -> ClusterHandle {
        Arc::new(FakeClient {
            cluster: self.as_ref().clone(),
            address: "http://fake-manager:2375".to_string(),
            dialed: false,
        })
    }

    fn with<T>(&self, f: impl FnOnce(&mut State) -> T) -> T {
        f(&mut self.state.lock().unwrap())
    }

    pub fn kill(&self, address: &str) {
        self.with(|s| s.dead.insert(address.to_string()));
    }

    /// Makes `op` fail, for every target or for `op:target` only.
    pub fn fail(&self, op: &str) {
        self.with(|s| s.failures.insert(op.to_string()));
    }

    pub fn set_managers(&self, nodes: Vec<Node>) {
        self.with(|s| s.managers = nodes);
    }

    pub fn set_task_state(&self, state: TaskState) {
        self.with(|s| s.task_state = Some(state));
    }

    pub fn set_exit_code(&self, code: i64) {
        self.with(|s| s.exit_code = code);
    }

    pub fn hang_attach(&self) {
        self.with(|s| s.hang_attach = true);
    }

    /// Parks the next archive upload until `release_upload` is called.
    pub fn hold_upload(&self) {
        self.with(|s| s.hold_upload = true);
    }

    pub async fn upload_reached(&self) {
        self.gate.reached.notified().await;
    }

    pub fn release_upload(&self) {
        self.gate.release.notify_one();
    }

    /// Containers whose command contains `pattern` print `output`.
    pub fn set_output(&self, pattern: &str, output: &str) {
        self.with(|s| s.outputs.push((pattern.to_string(), output.to_string())));
    }

    pub fn missing_image(&self, image: &str) {
        self.with(|s| s.missing_images.insert(image.to_string()));
    }

    pub fn set_image_info(&self, image: &str, info: ImageInfo) {
        self.with(|s| s.image_info.insert(image.to_string(), info));
    }

    pub fn set_download(&self, path: &str, content: &[u8]) {
        self.with(|s| {
            s.downloads
                .insert(path.to_string(), Bytes::copy_from_slice(content))
        });
    }

    pub fn fail_pushes(&self, times: u32) {
        self.with(|s| s.push_failures = times);
    }

    pub fn add_service(&self, spec: ServiceSpec) {
        self.with(|s| {
            s.services.insert(
                spec.name.clone(),
                Service {
                    id: spec.name.clone(),
                    version: 1,
                    spec,
                },
            )
        });
    }

    pub fn calls(&self) -> Vec<String> {
        self.with(|s| s.calls.clone())
    }

    pub fn services(&self) -> BTreeMap<String, Service> {
        self.with(|s| s.services.clone())
    }

    pub fn containers(&self) -> BTreeMap<String, FakeContainer> {
        self.with(|s| s.containers.clone())
    }

    pub fn pushed(&self) -> Vec<String> {
        self.with(|s| s.pushed.clone())
    }

    pub fn tagged(&self) -> Vec<String> {
        self.with(|s| s.tagged.clone())
    }

    /// Clients handed out by `connect` and not dropped yet.
    pub fn open_clients(&self) -> usize {
        self.with(|s| s.open_clients)
    }

    pub fn removed_images(&self) -> Vec<String> {
        self.with(|s| s.removed_images.clone())
    }

    fn record(&self, op: &str, target: &str) -> Result<(), ClusterError> {
        self.with(|s| {
            s.calls.push(format!("{op} {target}"));
            if s.failures.contains(op) || s.failures.contains(&format!("{op}:{target}")) {
                Err(ClusterError::Api(anyhow!("fake failure in {op} {target}")))
            } else {
                Ok(())
            }
        })
    }
}

#[async_trait]
impl ClusterConnector for FakeCluster {
    async fn connect(
        &self,
        address: &str,
        _tls: Option<&TlsConfig>,
        _dial_timeout: Duration,
    ) -> Result<ClusterHandle, ClusterError> {
        self.record("connect", address)?;
        self.with(|s| s.open_clients += 1);
        Ok(Arc::new(FakeClient {
            cluster: self.clone(),
            address: address.to_string(),
            dialed: true,
        }))
    }
}

pub struct FakeClient {
    cluster: FakeCluster,
    address: String,
    dialed: bool,
}

impl Drop for FakeClient {
    fn drop(&mut self) {
        if self.dialed {
            self.cluster.with(|s| s.open_clients -= 1);
        }
    }
}

#[async_trait]
impl ClusterClient for FakeClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<(), ClusterError> {
        self.cluster.record("ping", &self.address)?;
        if self.cluster.with(|s| s.dead.contains(&self.address)) {
            return Err(ClusterError::Api(anyhow!("connection refused")));
        }
        Ok(())
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<Service, ClusterError> {
        self.cluster.record("create_service", &spec.name)?;
        let service = Service {
            id: spec.name.clone(),
            version: 1,
            spec: spec.clone(),
        };
        self.cluster.with(|s| {
            if s.services.contains_key(&spec.name) {
                return Err(ClusterError::Api(anyhow!("name conflicts: {}", spec.name)));
            }
            s.services.insert(spec.name.clone(), service.clone());
            Ok(service)
        })
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), ClusterError> {
        self.cluster.record("update_service", id)?;
        self.cluster.with(|s| {
            let service = s
                .services
                .get_mut(id)
                .ok_or_else(|| ClusterError::NoSuchService(id.to_string()))?;
            if service.version != version {
                return Err(ClusterError::Api(anyhow!("update out of sequence")));
            }
            service.version += 1;
            service.spec = spec.clone();
            Ok(())
        })
    }

    async fn inspect_service(&self, id: &str) -> Result<Service, ClusterError> {
        self.cluster.record("inspect_service", id)?;
        self.cluster.with(|s| {
            s.services
                .get(id)
                .cloned()
                .ok_or_else(|| ClusterError::NoSuchService(id.to_string()))
        })
    }

    async fn remove_service(&self, id: &str) -> Result<(), ClusterError> {
        self.cluster.record("remove_service", id)?;
        self.cluster.with(|s| {
            s.services
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| ClusterError::NoSuchService(id.to_string()))
        })
    }

    async fn list_tasks(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<Task>, ClusterError> {
        let wanted = filters.get("service").cloned().unwrap_or_default();
        self.cluster.with(|s| {
            let state = s.task_state.unwrap_or(TaskState::Running);
            Ok(s.services
                .values()
                .filter(|service| wanted.is_empty() || wanted.contains(&service.id))
                .flat_map(|service| {
                    (0..service.spec.replicas).map(move |slot| Task {
                        id: format!("{}.{}", service.id, slot),
                        service_id: service.id.clone(),
                        node_id: "node1".to_string(),
                        state,
                        desired_state: TaskState::Running,
                        message: "started".to_string(),
                        err: String::new(),
                        container_id: Some(format!("{}-{}", service.id, slot)),
                        exit_code: None,
                    })
                })
                .collect())
        })
    }

    async fn inspect_node(&self, id: &str) -> Result<Node, ClusterError> {
        self.cluster.with(|s| {
            s.managers
                .iter()
                .find(|node| node.id == id)
                .cloned()
                .ok_or_else(|| ClusterError::NoSuchNode(id.to_string()))
        })
    }

    async fn list_managers(&self) -> Result<Vec<Node>, ClusterError> {
        self.cluster.record("list_managers", &self.address)?;
        Ok(self.cluster.with(|s| s.managers.clone()))
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ClusterError> {
        self.cluster.record("create_container", &spec.image)?;
        self.cluster.with(|s| {
            if s.missing_images.contains(&spec.image) {
                return Err(ClusterError::NoSuchImage(spec.image.clone()));
            }
            s.next_container += 1;
            let id = format!("container{}", s.next_container);
            s.containers.insert(
                id.clone(),
                FakeContainer {
                    spec: spec.clone(),
                    ..Default::default()
                },
            );
            Ok(id)
        })
    }

    async fn start_container(&self, id: &str) -> Result<(), ClusterError> {
        self.cluster.record("start_container", id)?;
        self.cluster.with(|s| {
            let container = s
                .containers
                .get_mut(id)
                .ok_or_else(|| ClusterError::NoSuchContainer(id.to_string()))?;
            container.started = true;
            Ok(())
        })
    }

    async fn attach_container(
        &self,
        id: &str,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<(), ClusterError> {
        self.cluster.record("attach_container", id)?;
        let (hang, output) = self.cluster.with(|s| {
            let command = s
                .containers
                .get(id)
                .map(|c| {
                    let mut parts = c.spec.entrypoint.clone().unwrap_or_default();
                    parts.extend(c.spec.cmd.clone());
                    parts.join(" ")
                })
                .unwrap_or_default();
            let output: String = s
                .outputs
                .iter()
                .filter(|(pattern, _)| command.contains(pattern.as_str()))
                .map(|(_, output)| output.clone())
                .collect();
            (s.hang_attach, output)
        });
        if hang {
            futures::future::pending::<()>().await;
        }
        out.write(&output);
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ClusterError> {
        self.cluster.record("wait_container", id)?;
        Ok(self.cluster.with(|s| s.exit_code))
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, ClusterError> {
        self.cluster.with(|s| {
            s.containers
                .get(id)
                .map(|_| ContainerInfo {
                    id: id.to_string(),
                    running: false,
                    exit_code: s.exit_code,
                })
                .ok_or_else(|| ClusterError::NoSuchContainer(id.to_string()))
        })
    }

    async fn commit_container(
        &self,
        id: &str,
        repository: &str,
        tag: &str,
    ) -> Result<String, ClusterError> {
        self.cluster.record("commit_container", id)?;
        Ok(format!("sha256:{repository}:{tag}"))
    }

    async fn remove_container(&self, id: &str) -> Result<(), ClusterError> {
        self.cluster.record("remove_container", id)?;
        self.cluster.with(|s| {
            let container = s
                .containers
                .get_mut(id)
                .ok_or_else(|| ClusterError::NoSuchContainer(id.to_string()))?;
            container.removed = true;
            Ok(())
        })
    }

    async fn pull_image(
        &self,
        image: &str,
        out: &(dyn OutputWriter + Send + Sync),
        _inactivity: Duration,
    ) -> Result<(), ClusterError> {
        self.cluster.record("pull_image", image)?;
        self.cluster.with(|s| s.missing_images.remove(image));
        out.line(&format!("Pulled {image}"));
        Ok(())
    }

    async fn push_image(
        &self,
        repository: &str,
        tag: &str,
        _auth: Option<&RegistryAuth>,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<(), ClusterError> {
        let image = format!("{repository}:{tag}");
        self.cluster.record("push_image", &image)?;
        self.cluster.with(|s| {
            if s.push_failures > 0 {
                s.push_failures -= 1;
                return Err(ClusterError::Api(anyhow!("registry unavailable")));
            }
            s.pushed.push(image);
            Ok(())
        })?;
        out.line("Pushed");
        Ok(())
    }

    async fn tag_image(&self, source: &str, repository: &str, tag: &str) -> Result<(), ClusterError> {
        self.cluster.record("tag_image", source)?;
        self.cluster
            .with(|s| s.tagged.push(format!("{repository}:{tag}")));
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, ClusterError> {
        self.cluster.record("inspect_image", image)?;
        Ok(self
            .cluster
            .with(|s| s.image_info.get(image).cloned().unwrap_or_default()))
    }

    async fn remove_image(&self, image: &str) -> Result<(), ClusterError> {
        self.cluster.record("remove_image", image)?;
        self.cluster
            .with(|s| s.removed_images.push(image.to_string()));
        Ok(())
    }

    async fn download_from_container(&self, id: &str, path: &str) -> Result<Bytes, ClusterError> {
        self.cluster.record("download_from_container", id)?;
        self.cluster.with(|s| {
            s.downloads
                .get(path)
                .cloned()
                .ok_or_else(|| ClusterError::Api(anyhow!("no such file {path}")))
        })
    }

    async fn upload_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), ClusterError> {
        self.cluster.record("upload_to_container", id)?;
        if self.cluster.with(|s| std::mem::take(&mut s.hold_upload)) {
            self.cluster.gate.reached.notify_one();
            self.cluster.gate.release.notified().await;
        }
        self.cluster.with(|s| {
            let container = s
                .containers
                .get_mut(id)
                .ok_or_else(|| ClusterError::NoSuchContainer(id.to_string()))?;
            container.uploads.push((path.to_string(), archive));
            Ok(())
        })
    }
}
