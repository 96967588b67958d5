use std::{collections::HashMap, path::Path, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use bollard::{
    auth::DockerCredentials,
    container::{
        AttachContainerOptions, AttachContainerResults, Config, CreateContainerOptions,
        DownloadFromContainerOptions, LogOutput, RemoveContainerOptions, StartContainerOptions,
        UploadToContainerOptions, WaitContainerOptions,
    },
    errors::Error as DockerError,
    image::{
        CommitContainerOptions, CreateImageOptions, PushImageOptions, RemoveImageOptions,
        TagImageOptions,
    },
    models::{
        EndpointPortConfig, EndpointSpec, EndpointSpecModeEnum, HealthConfig as DockerHealthConfig,
        Mount as DockerMount, MountTypeEnum, NetworkAttachmentConfig, ServiceSpec as SwarmSpec,
        ServiceSpecMode, ServiceSpecModeReplicated, TaskSpec, TaskSpecContainerSpec,
        TaskSpecLogDriver, TaskSpecPlacement, TaskSpecRestartPolicy,
        TaskSpecRestartPolicyConditionEnum,
    },
    node::ListNodesOptions,
    service::{InspectServiceOptions, UpdateServiceOptions},
    task::ListTasksOptions,
    Docker, API_DEFAULT_VERSION,
};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt, TryStreamExt};
use itertools::Itertools;
use log::{debug, info};
use map_macro::hash_map;

use crate::{
    config::{RegistryAuth, TlsConfig},
    domain::{
        event::OutputWriter,
        model::{
            ContainerInfo, ContainerSpec, HealthConfig, ImageInfo, Mount, Node, RestartCondition,
            Service, ServiceSpec, Task, TaskState,
        },
        port::{ClusterClient, ClusterConnector, ClusterHandle},
    },
    error::ClusterError,
};

/// Per request timeout, streams are bounded by their own inactivity rules.
const REQUEST_TIMEOUT: u64 = 120;

fn api(err: DockerError) -> ClusterError {
    ClusterError::Api(err.into())
}

fn is_not_found(err: &DockerError) -> bool {
    matches!(
        err,
        DockerError::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

fn credentials(auth: Option<&RegistryAuth>) -> Option<DockerCredentials> {
    auth.filter(|auth| !auth.is_empty())
        .map(|auth| DockerCredentials {
            username: Some(auth.username.clone()),
            password: Some(auth.password.clone()),
            email: Some(auth.email.clone()),
            ..Default::default()
        })
}

/// Keeps scheme and port of `current`, swapping in the host of `node_addr`.
fn manager_address(current: &str, node_addr: &str) -> Option<String> {
    let host = node_addr.rsplit_once(':').map_or(node_addr, |(host, _)| host);
    if host.is_empty() {
        return None;
    }
    let (scheme, rest) = current.split_once("://").unwrap_or(("tcp", current));
    let port = rest
        .trim_end_matches('/')
        .rsplit_once(':')
        .map(|(_, port)| port)
        .unwrap_or("2375");
    Some(format!("{scheme}://{host}:{port}"))
}

fn to_swarm_spec(spec: &ServiceSpec) -> SwarmSpec {
    let labels: HashMap<String, String> = spec.labels.clone().into_iter().collect();
    let health_check = spec.health_check.as_ref().map(|check| DockerHealthConfig {
        test: Some(check.test.clone()),
        interval: Some(check.interval.as_nanos() as i64),
        timeout: Some(check.timeout.as_nanos() as i64),
        retries: Some(i64::from(check.retries)),
        ..Default::default()
    });
    let mounts = spec
        .mounts
        .iter()
        .map(|mount| DockerMount {
            source: Some(mount.source.clone()),
            target: Some(mount.target.clone()),
            read_only: Some(mount.read_only),
            typ: Some(MountTypeEnum::BIND),
            ..Default::default()
        })
        .collect();
    SwarmSpec {
        name: Some(spec.name.clone()),
        labels: Some(labels.clone()),
        task_template: Some(TaskSpec {
            container_spec: Some(TaskSpecContainerSpec {
                image: Some(spec.image.clone()),
                labels: Some(labels),
                command: Some(spec.command.clone()),
                env: Some(spec.env.clone()),
                user: spec.user.clone(),
                mounts: Some(mounts),
                health_check,
                ..Default::default()
            }),
            restart_policy: Some(TaskSpecRestartPolicy {
                condition: Some(match spec.restart_condition {
                    RestartCondition::Any => TaskSpecRestartPolicyConditionEnum::ANY,
                    RestartCondition::None => TaskSpecRestartPolicyConditionEnum::NONE,
                }),
                ..Default::default()
            }),
            placement: Some(TaskSpecPlacement {
                constraints: Some(spec.constraints.clone()),
                ..Default::default()
            }),
            networks: Some(
                spec.networks
                    .iter()
                    .map(|network| NetworkAttachmentConfig {
                        target: Some(network.clone()),
                        ..Default::default()
                    })
                    .collect(),
            ),
            log_driver: spec.log_driver.as_ref().map(|driver| TaskSpecLogDriver {
                name: Some(driver.clone()),
                ..Default::default()
            }),
            ..Default::default()
        }),
        mode: Some(ServiceSpecMode {
            replicated: Some(ServiceSpecModeReplicated {
                replicas: Some(spec.replicas as i64),
            }),
            ..Default::default()
        }),
        endpoint_spec: spec.endpoint_port.map(|port| EndpointSpec {
            mode: Some(EndpointSpecModeEnum::VIP),
            ports: Some(vec![EndpointPortConfig {
                target_port: Some(i64::from(port)),
                ..Default::default()
            }]),
        }),
        ..Default::default()
    }
}

fn from_swarm_spec(spec: SwarmSpec) -> ServiceSpec {
    let task = spec.task_template.unwrap_or_default();
    let container = task.container_spec.unwrap_or_default();
    let nanos = |value: Option<i64>| Duration::from_nanos(value.unwrap_or(0).max(0) as u64);
    ServiceSpec {
        name: spec.name.unwrap_or_default(),
        image: container.image.unwrap_or_default(),
        command: container.command.unwrap_or_default(),
        env: container.env.unwrap_or_default(),
        labels: spec.labels.unwrap_or_default().into_iter().collect(),
        replicas: spec
            .mode
            .and_then(|mode| mode.replicated)
            .and_then(|replicated| replicated.replicas)
            .unwrap_or(0)
            .max(0) as u64,
        constraints: task
            .placement
            .and_then(|placement| placement.constraints)
            .unwrap_or_default(),
        health_check: container.health_check.map(|check| HealthConfig {
            test: check.test.unwrap_or_default(),
            interval: nanos(check.interval),
            timeout: nanos(check.timeout),
            retries: check.retries.unwrap_or(0).max(0) as u32,
        }),
        endpoint_port: spec
            .endpoint_spec
            .and_then(|endpoint| endpoint.ports)
            .and_then(|ports| ports.into_iter().next())
            .and_then(|port| port.target_port)
            .and_then(|port| u16::try_from(port).ok()),
        networks: task
            .networks
            .unwrap_or_default()
            .into_iter()
            .filter_map(|network| network.target)
            .collect(),
        mounts: container
            .mounts
            .unwrap_or_default()
            .into_iter()
            .map(|mount| Mount {
                source: mount.source.unwrap_or_default(),
                target: mount.target.unwrap_or_default(),
                read_only: mount.read_only.unwrap_or(false),
            })
            .collect(),
        restart_condition: match task.restart_policy.and_then(|policy| policy.condition) {
            Some(TaskSpecRestartPolicyConditionEnum::NONE) => RestartCondition::None,
            _ => RestartCondition::Any,
        },
        log_driver: task.log_driver.and_then(|driver| driver.name),
        user: container.user,
    }
}

fn task_state<S: ToString>(state: Option<S>) -> TaskState {
    state
        .and_then(|state| TaskState::parse(&state.to_string()))
        .unwrap_or(TaskState::New)
}

/// Consumes a progress stream, failing when it stays silent for `inactivity`.
async fn follow_progress<S, T>(
    stream: S,
    inactivity: Option<Duration>,
    mut on_item: impl FnMut(T) -> Result<(), ClusterError>,
) -> Result<(), ClusterError>
where
    S: Stream<Item = Result<T, DockerError>>,
{
    let mut stream = Box::pin(stream);
    loop {
        let next = match inactivity {
            Some(limit) => tokio::time::timeout(limit, stream.next())
                .await
                .map_err(|_| ClusterError::Inactivity(limit))?,
            None => stream.next().await,
        };
        match next {
            Some(item) => on_item(item.map_err(api)?)?,
            None => return Ok(()),
        }
    }
}

/// Cluster client bound to one swarm manager.
pub struct DockerClient {
    docker: Docker,
    address: String,
}

impl DockerClient {
    pub fn new(docker: Docker, address: &str) -> Self {
        Self {
            docker,
            address: address.to_string(),
        }
    }
}

#[async_trait]
impl ClusterClient for DockerClient {
    fn address(&self) -> &str {
        &self.address
    }

    async fn ping(&self) -> Result<(), ClusterError> {
        self.docker.ping().await.map(|_| ()).map_err(api)
    }

    async fn create_service(&self, spec: &ServiceSpec) -> Result<Service, ClusterError> {
        let created = self
            .docker
            .create_service(to_swarm_spec(spec), None)
            .await
            .map_err(api)?;
        let id = created
            .id
            .ok_or_else(|| ClusterError::Api(anyhow!("service {} created without id", spec.name)))?;
        info!("Service {} created with id {}", spec.name, id);
        self.inspect_service(&id).await
    }

    async fn update_service(
        &self,
        id: &str,
        version: u64,
        spec: &ServiceSpec,
    ) -> Result<(), ClusterError> {
        self.docker
            .update_service(
                id,
                to_swarm_spec(spec),
                UpdateServiceOptions {
                    version,
                    ..Default::default()
                },
                None,
            )
            .await
            .map(|_| ())
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchService(id.to_string()),
                false => api(err),
            })
    }

    async fn inspect_service(&self, id: &str) -> Result<Service, ClusterError> {
        let service = self
            .docker
            .inspect_service(id, None::<InspectServiceOptions>)
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchService(id.to_string()),
                false => api(err),
            })?;
        Ok(Service {
            id: service.id.unwrap_or_else(|| id.to_string()),
            version: service
                .version
                .and_then(|version| version.index)
                .unwrap_or(0),
            spec: from_swarm_spec(service.spec.unwrap_or_default()),
        })
    }

    async fn remove_service(&self, id: &str) -> Result<(), ClusterError> {
        self.docker
            .delete_service(id)
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchService(id.to_string()),
                false => api(err),
            })
    }

    async fn list_tasks(
        &self,
        filters: HashMap<String, Vec<String>>,
    ) -> Result<Vec<Task>, ClusterError> {
        let tasks = self
            .docker
            .list_tasks(Some(ListTasksOptions { filters }))
            .await
            .map_err(api)?;
        Ok(tasks
            .into_iter()
            .map(|task| {
                let status = task.status.unwrap_or_default();
                let container = status.container_status.unwrap_or_default();
                Task {
                    id: task.id.unwrap_or_default(),
                    service_id: task.service_id.unwrap_or_default(),
                    node_id: task.node_id.unwrap_or_default(),
                    state: task_state(status.state),
                    desired_state: task_state(task.desired_state),
                    message: status.message.unwrap_or_default(),
                    err: status.err.unwrap_or_default(),
                    container_id: container.container_id,
                    exit_code: container.exit_code,
                }
            })
            .collect())
    }

    async fn inspect_node(&self, id: &str) -> Result<Node, ClusterError> {
        let node = self
            .docker
            .inspect_node(id)
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchNode(id.to_string()),
                false => api(err),
            })?;
        let spec = node.spec.unwrap_or_default();
        let manager = node.manager_status.is_some();
        let addr = node
            .manager_status
            .and_then(|status| status.addr)
            .or(node.status.and_then(|status| status.addr))
            .unwrap_or_default();
        Ok(Node {
            id: node.id.unwrap_or_else(|| id.to_string()),
            addr,
            manager,
            labels: spec.labels.unwrap_or_default().into_iter().collect(),
        })
    }

    async fn list_managers(&self) -> Result<Vec<Node>, ClusterError> {
        let nodes = self
            .docker
            .list_nodes(Some(ListNodesOptions {
                filters: hash_map! { "role" => vec!["manager"] },
            }))
            .await
            .map_err(api)?;
        Ok(nodes
            .into_iter()
            .filter_map(|node| {
                let node_addr = node.manager_status.and_then(|status| status.addr)?;
                Some(Node {
                    id: node.id.unwrap_or_default(),
                    addr: manager_address(&self.address, &node_addr)?,
                    manager: true,
                    labels: node
                        .spec
                        .and_then(|spec| spec.labels)
                        .unwrap_or_default()
                        .into_iter()
                        .collect(),
                })
            })
            .unique_by(|node| node.addr.clone())
            .collect())
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String, ClusterError> {
        let config = Config {
            image: Some(spec.image.clone()),
            cmd: Some(spec.cmd.clone()),
            entrypoint: spec.entrypoint.clone(),
            env: Some(spec.env.clone()),
            user: spec.user.clone(),
            labels: Some(spec.labels.clone().into_iter().collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let options = spec.name.as_ref().map(|name| CreateContainerOptions {
            name: name.clone(),
            platform: None,
        });
        self.docker
            .create_container(options, config)
            .await
            .map(|created| created.id)
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchImage(spec.image.clone()),
                false => api(err),
            })
    }

    async fn start_container(&self, id: &str) -> Result<(), ClusterError> {
        self.docker
            .start_container(id, None::<StartContainerOptions<String>>)
            .await
            .map_err(api)
    }

    async fn attach_container(
        &self,
        id: &str,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<(), ClusterError> {
        let AttachContainerResults { mut output, .. } = self
            .docker
            .attach_container(
                id,
                Some(AttachContainerOptions::<String> {
                    stdout: Some(true),
                    stderr: Some(true),
                    stream: Some(true),
                    logs: Some(true),
                    ..Default::default()
                }),
            )
            .await
            .map_err(api)?;
        while let Some(chunk) = output.next().await {
            match chunk.map_err(api)? {
                LogOutput::StdOut { message }
                | LogOutput::StdErr { message }
                | LogOutput::Console { message } => out.write(&String::from_utf8_lossy(&message)),
                LogOutput::StdIn { .. } => {}
            }
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> Result<i64, ClusterError> {
        let mut responses = Box::pin(
            self.docker
                .wait_container(id, None::<WaitContainerOptions<String>>),
        );
        match responses.next().await {
            Some(Ok(response)) => Ok(response.status_code),
            Some(Err(DockerError::DockerContainerWaitError { code, .. })) => Ok(code),
            Some(Err(err)) => Err(api(err)),
            None => Err(ClusterError::Api(anyhow!("no wait response for container {id}"))),
        }
    }

    async fn inspect_container(&self, id: &str) -> Result<ContainerInfo, ClusterError> {
        let container = self
            .docker
            .inspect_container(id, None::<bollard::query_parameters::InspectContainerOptions>)
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchContainer(id.to_string()),
                false => api(err),
            })?;
        let state = container.state.unwrap_or_default();
        Ok(ContainerInfo {
            id: container.id.unwrap_or_else(|| id.to_string()),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code.unwrap_or(0),
        })
    }

    async fn commit_container(
        &self,
        id: &str,
        repository: &str,
        tag: &str,
    ) -> Result<String, ClusterError> {
        self.docker
            .commit_container(
                CommitContainerOptions {
                    container: id,
                    repo: repository,
                    tag,
                    pause: true,
                    ..Default::default()
                },
                Config::<String>::default(),
            )
            .await
            .map_err(api)?;
        let image = self
            .docker
            .inspect_image(&format!("{repository}:{tag}"))
            .await
            .map_err(api)?;
        Ok(image.id.unwrap_or_default())
    }

    async fn remove_container(&self, id: &str) -> Result<(), ClusterError> {
        self.docker
            .remove_container(
                id,
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchContainer(id.to_string()),
                false => api(err),
            })
    }

    async fn pull_image(
        &self,
        image: &str,
        out: &(dyn OutputWriter + Send + Sync),
        inactivity: Duration,
    ) -> Result<(), ClusterError> {
        info!("Pull image {} on {}", image, self.address);
        let stream = self.docker.create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        );
        follow_progress(stream, Some(inactivity), |info| {
            if let Some(err) = info.error {
                return Err(ClusterError::Api(anyhow!("pulling {image}: {err}")));
            }
            if let Some(status) = info.status {
                out.line(&status);
            }
            Ok(())
        })
        .await
    }

    async fn push_image(
        &self,
        repository: &str,
        tag: &str,
        auth: Option<&RegistryAuth>,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<(), ClusterError> {
        debug!("Push image {}:{} from {}", repository, tag, self.address);
        let stream = self.docker.push_image(
            repository,
            Some(PushImageOptions { tag }),
            credentials(auth),
        );
        follow_progress(stream, None, |info| {
            if let Some(err) = info.error {
                return Err(ClusterError::Api(anyhow!("pushing {repository}:{tag}: {err}")));
            }
            if let Some(status) = info.status {
                out.line(&status);
            }
            Ok(())
        })
        .await
    }

    async fn tag_image(
        &self,
        source: &str,
        repository: &str,
        tag: &str,
    ) -> Result<(), ClusterError> {
        self.docker
            .tag_image(
                source,
                Some(TagImageOptions {
                    repo: repository,
                    tag,
                }),
            )
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchImage(source.to_string()),
                false => api(err),
            })
    }

    async fn remove_image(&self, image: &str) -> Result<(), ClusterError> {
        let removed = self
            .docker
            .remove_image(
                image,
                Some(RemoveImageOptions {
                    force: true,
                    ..Default::default()
                }),
                None,
            )
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchImage(image.to_string()),
                false => api(err),
            })?;
        debug!("Removed image {}: {} layers", image, removed.len());
        Ok(())
    }

    async fn inspect_image(&self, image: &str) -> Result<ImageInfo, ClusterError> {
        let inspected = self
            .docker
            .inspect_image(image)
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchImage(image.to_string()),
                false => api(err),
            })?;
        let config = inspected.config.unwrap_or_default();
        Ok(ImageInfo {
            exposed_ports: config
                .exposed_ports
                .map(|ports| ports.into_keys().sorted().collect())
                .unwrap_or_default(),
            entrypoint: config.entrypoint.unwrap_or_default(),
            cmd: config.cmd.unwrap_or_default(),
        })
    }

    async fn download_from_container(&self, id: &str, path: &str) -> Result<Bytes, ClusterError> {
        let chunks: Vec<Bytes> = self
            .docker
            .download_from_container(id, Some(DownloadFromContainerOptions { path }))
            .try_collect()
            .await
            .map_err(|err| match is_not_found(&err) {
                true => ClusterError::NoSuchContainer(id.to_string()),
                false => api(err),
            })?;
        let mut tar = BytesMut::new();
        for chunk in chunks {
            tar.extend_from_slice(&chunk);
        }
        Ok(tar.freeze())
    }

    async fn upload_to_container(
        &self,
        id: &str,
        path: &str,
        archive: Bytes,
    ) -> Result<(), ClusterError> {
        self.docker
            .upload_to_container(
                id,
                Some(UploadToContainerOptions {
                    path,
                    ..Default::default()
                }),
                bollard::body_full(archive),
            )
            .await
            .map_err(api)
    }
}

/// Opens bollard clients against manager endpoints, with TLS when the
/// manager record carries certificates. Every call builds a new `Docker`
/// with its own connection pool, released when the operation drops it.
#[derive(Default)]
pub struct DockerConnector;

#[async_trait]
impl ClusterConnector for DockerConnector {
    async fn connect(
        &self,
        address: &str,
        tls: Option<&TlsConfig>,
        dial_timeout: Duration,
    ) -> Result<ClusterHandle, ClusterError> {
        let docker = match tls {
            Some(tls) => Docker::connect_with_ssl(
                address,
                Path::new(&tls.key),
                Path::new(&tls.cert),
                Path::new(&tls.ca),
                REQUEST_TIMEOUT,
                API_DEFAULT_VERSION,
            ),
            None => Docker::connect_with_http(address, REQUEST_TIMEOUT, API_DEFAULT_VERSION),
        }
        .map_err(api)?;
        tokio::time::timeout(dial_timeout, docker.ping())
            .await
            .map_err(|_| ClusterError::Api(anyhow!("timeout dialing {address}")))?
            .map_err(api)?;
        Ok(Arc::new(DockerClient::new(docker, address)))
    }
}
