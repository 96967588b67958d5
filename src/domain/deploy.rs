use std::{collections::BTreeMap, sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{error, info};

use crate::{
    config::DockerConfig,
    error::{ClusterError, Error, Result},
};

use super::{
    cluster::{wait_for_tasks, TASK_WAIT_TIMEOUT},
    event::{DeployEvent, OutputWriter},
    image::ImageService,
    model::{App, ImageMetadata, Service, ServiceSpec, TaskState, WEB_PROCESS_NAME},
    pipeline::{Action, BoxedAction, Pipeline},
    port::ClusterHandle,
    service::{labels_for_service, service_name, ProcessState, SpecBuilder},
};

pub struct DeployContext {
    pub app: App,
    pub client: ClusterHandle,
    pub event: Arc<DeployEvent>,
    pub image: String,
    pub metadata: ImageMetadata,
    pub processes: BTreeMap<String, Vec<String>>,
    pub web_process: String,
    pub states: BTreeMap<String, ProcessState>,
    pub to_deploy: Vec<String>,
    pub to_remove: Vec<String>,
    pub record_image: bool,
}

/// Service as it was before this deploy touched it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Upserted {
    pub process: String,
    pub previous: Option<Service>,
}

pub type Upserts = Vec<Upserted>;

struct Upserter {
    specs: SpecBuilder,
    healthcheck_max_time: Duration,
}

impl Upserter {
    async fn upsert(&self, ctx: &DeployContext, process: &str) -> Result<Upserted> {
        let name = service_name(&ctx.app.name, process);
        let previous = match ctx.client.inspect_service(&name).await {
            Ok(service) => Some(service),
            Err(ClusterError::NoSuchService(_)) => None,
            Err(err) => return Err(err.into()),
        };
        let mut state = ctx.states.get(process).copied().unwrap_or_default();
        if previous.is_none() && state == ProcessState::default() {
            state = ProcessState::start();
        }
        let labels = labels_for_service(&ctx.app, process, previous.as_ref(), state)?;
        let spec = self.specs.process_spec(
            &ctx.app,
            process,
            &ctx.image,
            &ctx.metadata,
            &ctx.processes,
            &ctx.web_process,
            &labels,
        )?;
        ctx.event
            .line(&format!(" ---> Updating process {process:?} to {} units", spec.replicas));
        let service_id = match &previous {
            None => ctx.client.create_service(&spec).await?.id,
            Some(old) => {
                ctx.client
                    .update_service(&old.id, old.version, &spec)
                    .await?;
                old.id.clone()
            }
        };
        let upserted = Upserted {
            process: process.to_string(),
            previous,
        };
        if spec.replicas > 0 {
            if let Err(err) = wait_for_tasks(
                &ctx.client,
                &service_id,
                &[TaskState::Running],
                self.convergence_timeout(&spec),
            )
            .await
            {
                self.rollback(ctx, &upserted).await;
                return Err(err);
            }
        }
        Ok(upserted)
    }

    fn convergence_timeout(&self, spec: &ServiceSpec) -> Duration {
        if spec.health_check.is_some() {
            TASK_WAIT_TIMEOUT.max(self.healthcheck_max_time)
        } else {
            TASK_WAIT_TIMEOUT
        }
    }

    /// Restores the service to its previous spec, or removes it when this
    /// deploy created it. Failures are logged.
    async fn rollback(&self, ctx: &DeployContext, upserted: &Upserted) {
        let name = service_name(&ctx.app.name, &upserted.process);
        let result = match &upserted.previous {
            None => ctx.client.remove_service(&name).await,
            Some(previous) => match ctx.client.inspect_service(&name).await {
                Ok(current) => {
                    ctx.client
                        .update_service(&current.id, current.version, &previous.spec)
                        .await
                }
                Err(err) => Err(err),
            },
        };
        if let Err(err) = result {
            error!("Error rolling back service {}: {}", name, err);
        }
    }

    async fn rollback_all(&self, ctx: &DeployContext, upserts: &[Upserted]) {
        for upserted in upserts.iter().rev() {
            self.rollback(ctx, upserted).await;
        }
    }
}

struct UpdateServices {
    upserter: Arc<Upserter>,
}

#[async_trait]
impl Action<DeployContext, Upserts> for UpdateServices {
    fn name(&self) -> &'static str {
        "update-services"
    }

    async fn forward(&self, ctx: &DeployContext, _: Option<&Upserts>) -> Result<Upserts> {
        let mut done = Vec::with_capacity(ctx.to_deploy.len());
        for process in &ctx.to_deploy {
            match self.upserter.upsert(ctx, process).await {
                Ok(upserted) => done.push(upserted),
                Err(err) => {
                    ctx.event.line(&format!(
                        "\n**** ROLLING BACK AFTER FAILURE ****\n ---> {err} <---"
                    ));
                    self.upserter.rollback_all(ctx, &done).await;
                    return Err(err);
                }
            }
        }
        Ok(done)
    }

    async fn backward(&self, ctx: &DeployContext, result: &Upserts) {
        self.upserter.rollback_all(ctx, result).await;
    }
}

struct UpdateImageInDb {
    images: Arc<ImageService>,
}

#[async_trait]
impl Action<DeployContext, Upserts> for UpdateImageInDb {
    fn name(&self) -> &'static str {
        "update-image-in-db"
    }

    async fn forward(&self, ctx: &DeployContext, previous: Option<&Upserts>) -> Result<Upserts> {
        if ctx.record_image {
            self.images
                .append_app_image_name(&ctx.app.name, &ctx.image)
                .await?;
            let evicted = self.images.trim_app_images(&ctx.app.name).await?;
            if !evicted.is_empty() {
                info!("Evicted images of {}: {:?}", ctx.app.name, evicted);
            }
        }
        Ok(previous.cloned().unwrap_or_default())
    }
}

struct RemoveOldServices;

#[async_trait]
impl Action<DeployContext, Upserts> for RemoveOldServices {
    fn name(&self) -> &'static str {
        "remove-old-services"
    }

    async fn forward(&self, ctx: &DeployContext, previous: Option<&Upserts>) -> Result<Upserts> {
        for process in &ctx.to_remove {
            let name = service_name(&ctx.app.name, process);
            match ctx.client.remove_service(&name).await {
                Ok(()) => ctx
                    .event
                    .line(&format!(" ---> Removed process {process:?}")),
                Err(err) => error!("Error removing old service {}: {}", name, err),
            }
        }
        Ok(previous.cloned().unwrap_or_default())
    }
}

struct ImageProcesses {
    metadata: ImageMetadata,
    /// Legacy images already resolved to a `web` process.
    processes: BTreeMap<String, Vec<String>>,
    web_process: String,
}

/// Converges app services on the cluster to a given image.
pub struct Deployer {
    images: Arc<ImageService>,
    upserter: Arc<Upserter>,
    run_cmd: String,
}

impl Deployer {
    pub fn new(images: Arc<ImageService>, config: &DockerConfig, host: &str) -> Self {
        Self {
            images,
            upserter: Arc::new(Upserter {
                specs: SpecBuilder::new(host),
                healthcheck_max_time: Duration::from_secs(config.healthcheck.max_time),
            }),
            run_cmd: config.run_cmd.bin.clone(),
        }
    }

    async fn processes_of(&self, image: &str) -> Result<ImageProcesses> {
        let metadata = self.images.get_image_custom_data(image).await?;
        if metadata.is_legacy() {
            return Ok(ImageProcesses {
                metadata,
                processes: BTreeMap::from([(
                    WEB_PROCESS_NAME.to_string(),
                    vec![self.run_cmd.clone()],
                )]),
                web_process: WEB_PROCESS_NAME.to_string(),
            });
        }
        Ok(ImageProcesses {
            processes: metadata.processes.clone(),
            web_process: self.images.get_image_web_process_name(image).await?,
            metadata,
        })
    }

    async fn run(&self, ctx: DeployContext) -> Result<()> {
        let actions: Vec<BoxedAction<DeployContext, Upserts>> = vec![
            Box::new(UpdateServices {
                upserter: self.upserter.clone(),
            }),
            Box::new(UpdateImageInDb {
                images: self.images.clone(),
            }),
            Box::new(RemoveOldServices),
        ];
        Pipeline::new(actions)
            .with_event(ctx.event.clone())
            .execute(&ctx)
            .await
            .map(|_| ())
    }

    /// Deploys every process of `image`, drops processes the current image
    /// had and `image` lacks, then records `image` as current.
    pub async fn deploy(
        &self,
        app: &App,
        client: ClusterHandle,
        event: Arc<DeployEvent>,
        image: &str,
    ) -> Result<()> {
        let ImageProcesses {
            metadata,
            processes,
            web_process,
        } = self.processes_of(image).await?;
        let current = match self.images.current_image_name(&app.name).await {
            Ok(current) => Some(self.processes_of(&current).await?.processes),
            Err(Error::NoImages(_)) => None,
            Err(err) => return Err(err),
        };
        let to_deploy: Vec<String> = processes.keys().cloned().collect();
        let to_remove: Vec<String> = current
            .map(|current| {
                current
                    .into_keys()
                    .filter(|process| !processes.contains_key(process))
                    .collect()
            })
            .unwrap_or_default();
        event.line(&format!("\n---- Updating units [{}] ----", to_deploy.join(", ")));
        self.run(DeployContext {
            app: app.clone(),
            client,
            event,
            image: image.to_string(),
            metadata,
            processes,
            web_process,
            states: BTreeMap::new(),
            to_deploy,
            to_remove,
            record_image: true,
        })
        .await
    }

    /// Applies `state` to one process, or to every process of the current
    /// image when `process` is empty.
    pub async fn change_state(
        &self,
        app: &App,
        client: ClusterHandle,
        event: Arc<DeployEvent>,
        process: &str,
        state: ProcessState,
    ) -> Result<()> {
        let image = self.images.current_image_name(&app.name).await?;
        let ImageProcesses {
            metadata,
            processes,
            web_process,
        } = self.processes_of(&image).await?;
        let to_deploy: Vec<String> = if process.is_empty() {
            processes.keys().cloned().collect()
        } else if processes.contains_key(process) {
            vec![process.to_string()]
        } else {
            return Err(Error::InvalidProcess(format!(
                "no command declared in Procfile for process {process:?}"
            )));
        };
        let states = to_deploy
            .iter()
            .map(|process| (process.clone(), state))
            .collect();
        self.run(DeployContext {
            app: app.clone(),
            client,
            event,
            image,
            metadata,
            processes,
            web_process,
            states,
            to_deploy,
            to_remove: vec![],
            record_image: false,
        })
        .await
    }

    /// Adds (positive) or removes (negative) units of one process.
    pub async fn change_units(
        &self,
        app: &App,
        client: ClusterHandle,
        event: Arc<DeployEvent>,
        units: i64,
        process: &str,
    ) -> Result<()> {
        if app.deploys == 0 {
            return Err(Error::InvalidUnitChange(
                "units can only be modified after the first deploy",
            ));
        }
        if units == 0 {
            return Err(Error::InvalidUnitChange("cannot change 0 units"));
        }
        self.change_state(app, client, event, process, ProcessState::increment(units))
            .await
    }

    /// Runs `cmds` once in a throwaway service of the current image.
    pub async fn run_isolated(
        &self,
        app: &App,
        client: &ClusterHandle,
        cmds: &[String],
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<()> {
        let image = self.images.current_image_name(&app.name).await?;
        let spec = self.upserter.specs.isolated_run_spec(app, &image, cmds);
        match client.remove_service(&spec.name).await {
            Ok(()) | Err(ClusterError::NoSuchService(_)) => {}
            Err(err) => return Err(err.into()),
        }
        out.line(&format!("---- Running {:?} in {image:?} ----", cmds.join(" ")));
        let service = client.create_service(&spec).await?;
        let finished = wait_for_tasks(
            client,
            &service.id,
            &[TaskState::Complete, TaskState::Shutdown],
            TASK_WAIT_TIMEOUT,
        )
        .await;
        if let Err(err) = client.remove_service(&service.id).await {
            error!("Error removing isolated run service {}: {}", service.id, err);
        }
        let failed = finished?
            .into_iter()
            .filter_map(|task| task.exit_code)
            .find(|code| *code != 0);
        match failed {
            Some(code) => Err(Error::ExitStatus(code)),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        domain::{
            event::Discard,
            model::{CustomData, Healthcheck},
            service::LabelSet,
            testing::FakeCluster,
        },
        infra::memory::MemoryStore,
    };

    struct Fixture {
        fake: Arc<FakeCluster>,
        images: Arc<ImageService>,
        deployer: Deployer,
    }

    fn fixture() -> Fixture {
        let config = DockerConfig::default();
        let images = Arc::new(ImageService::new(
            Arc::new(MemoryStore::default()),
            config.clone(),
        ));
        Fixture {
            fake: FakeCluster::new(),
            deployer: Deployer::new(images.clone(), &config, "http://tsuru.io"),
            images,
        }
    }

    fn app() -> App {
        App {
            deploys: 1,
            pool: "pool1".to_string(),
            ..App::new("myapp", "python")
        }
    }

    async fn save_image(images: &ImageService, image: &str, procfile: &str) {
        images
            .save_image_custom_data(
                image,
                CustomData {
                    procfile: Some(procfile.to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
    }

    fn event() -> Arc<DeployEvent> {
        Arc::new(DeployEvent::new("myapp"))
    }

    fn replicas(fake: &FakeCluster, name: &str) -> Option<u64> {
        LabelSet::from_labels(&fake.services()[name].spec.labels).replicas()
    }

    #[tokio::test]
    async fn first_deploy_creates_every_process() {
        let f = fixture();
        save_image(&f.images, "tsuru/app-myapp:v1", "web: python web.py\nworker: celery\n").await;
        f.deployer
            .deploy(&app(), f.fake.client(), event(), "tsuru/app-myapp:v1")
            .await
            .unwrap();
        let services = f.fake.services();
        assert_eq!(
            services.keys().collect::<Vec<_>>(),
            vec!["myapp-web", "myapp-worker"]
        );
        assert_eq!(services["myapp-web"].spec.replicas, 1);
        assert_eq!(services["myapp-web"].spec.image, "tsuru/app-myapp:v1");
        assert_eq!(
            f.fake
                .calls()
                .iter()
                .filter(|call| call.starts_with("create_service"))
                .collect::<Vec<_>>(),
            vec!["create_service myapp-web", "create_service myapp-worker"]
        );
        assert_eq!(
            f.images.current_image_name("myapp").await.unwrap(),
            "tsuru/app-myapp:v1"
        );
    }

    #[tokio::test]
    async fn redeploy_keeps_units_and_drops_removed_processes() {
        let f = fixture();
        save_image(&f.images, "tsuru/app-myapp:v1", "web: python web.py\nworker: celery\n").await;
        save_image(&f.images, "tsuru/app-myapp:v2", "web: python web.py\n").await;
        f.deployer
            .deploy(&app(), f.fake.client(), event(), "tsuru/app-myapp:v1")
            .await
            .unwrap();
        f.deployer
            .change_units(&app(), f.fake.client(), event(), 2, "web")
            .await
            .unwrap();
        f.deployer
            .deploy(&app(), f.fake.client(), event(), "tsuru/app-myapp:v2")
            .await
            .unwrap();
        let services = f.fake.services();
        assert!(!services.contains_key("myapp-worker"));
        assert_eq!(services["myapp-web"].spec.replicas, 3);
        assert_eq!(services["myapp-web"].spec.image, "tsuru/app-myapp:v2");
        assert_eq!(
            f.images.list_app_images("myapp").await.unwrap(),
            vec!["tsuru/app-myapp:v1", "tsuru/app-myapp:v2"]
        );
    }

    #[tokio::test]
    async fn failed_upsert_rolls_back_previous_processes() {
        let f = fixture();
        save_image(&f.images, "tsuru/app-myapp:v1", "web: python web.py\nworker: celery\n").await;
        save_image(
            &f.images,
            "tsuru/app-myapp:v2",
            "clock: python clock.py\nweb: python web.py\nworker: celery\n",
        )
        .await;
        f.deployer
            .deploy(&app(), f.fake.client(), event(), "tsuru/app-myapp:v1")
            .await
            .unwrap();
        f.fake.fail("update_service:myapp-worker");
        let event = event();
        let err = f
            .deployer
            .deploy(&app(), f.fake.client(), event.clone(), "tsuru/app-myapp:v2")
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("update-services: "));
        let services = f.fake.services();
        assert!(!services.contains_key("myapp-clock"));
        assert_eq!(services["myapp-web"].spec.image, "tsuru/app-myapp:v1");
        assert_eq!(services["myapp-worker"].spec.image, "tsuru/app-myapp:v1");
        assert_eq!(
            f.images.list_app_images("myapp").await.unwrap(),
            vec!["tsuru/app-myapp:v1"]
        );
        assert!(event
            .transcript()
            .contains("**** ROLLING BACK AFTER FAILURE ****"));
    }

    #[tokio::test]
    async fn rejected_tasks_remove_new_service() {
        let f = fixture();
        save_image(&f.images, "tsuru/app-myapp:v1", "web: python web.py\n").await;
        f.fake.set_task_state(TaskState::Rejected);
        let err = f
            .deployer
            .deploy(&app(), f.fake.client(), event(), "tsuru/app-myapp:v1")
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::InvalidTaskState { .. }));
        assert!(f.fake.services().is_empty());
        assert!(matches!(
            f.images.current_image_name("myapp").await,
            Err(Error::NoImages(_))
        ));
    }

    #[tokio::test]
    async fn legacy_image_runs_start_binary_as_web() {
        let f = fixture();
        f.deployer
            .deploy(&app(), f.fake.client(), event(), "tsuru/app-myapp:v1")
            .await
            .unwrap();
        let web = &f.fake.services()["myapp-web"];
        assert!(web.spec.command[2].ends_with("exec /var/lib/tsuru/start"));
        assert!(web.spec.env.contains(&"PORT=8888".to_string()));
    }

    #[tokio::test]
    async fn unit_operations() {
        let f = fixture();
        save_image(&f.images, "tsuru/app-myapp:v1", "web: python web.py\nworker: celery\n").await;
        f.deployer
            .deploy(&app(), f.fake.client(), event(), "tsuru/app-myapp:v1")
            .await
            .unwrap();

        let err = f
            .deployer
            .change_units(&app(), f.fake.client(), event(), -2, "web")
            .await
            .unwrap_err();
        assert!(matches!(err.root(), Error::InvalidUnits));

        f.deployer
            .change_state(&app(), f.fake.client(), event(), "", ProcessState::stop())
            .await
            .unwrap();
        assert_eq!(replicas(&f.fake, "myapp-web"), Some(0));
        assert_eq!(f.fake.services()["myapp-worker"].spec.replicas, 0);

        f.deployer
            .change_state(&app(), f.fake.client(), event(), "web", ProcessState::start())
            .await
            .unwrap();
        assert_eq!(replicas(&f.fake, "myapp-web"), Some(1));
        assert_eq!(replicas(&f.fake, "myapp-worker"), Some(0));

        f.deployer
            .change_state(&app(), f.fake.client(), event(), "web", ProcessState::restart())
            .await
            .unwrap();
        let labels = LabelSet::from_labels(&f.fake.services()["myapp-web"].spec.labels);
        assert_eq!(labels.restarts(), 1);

        let err = f
            .deployer
            .change_state(&app(), f.fake.client(), event(), "clock", ProcessState::start())
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no command declared in Procfile for process \"clock\""
        );
    }

    #[tokio::test]
    async fn units_need_a_deploy_and_a_count() {
        let f = fixture();
        let fresh = App::new("myapp", "python");
        let err = f
            .deployer
            .change_units(&fresh, f.fake.client(), event(), 1, "web")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "units can only be modified after the first deploy"
        );
        let err = f
            .deployer
            .change_units(&app(), f.fake.client(), event(), 0, "web")
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot change 0 units");
    }

    #[tokio::test]
    async fn isolated_run_replaces_stale_service_and_cleans_up() {
        let f = fixture();
        save_image(&f.images, "tsuru/app-myapp:v1", "web: python web.py\n").await;
        f.images
            .append_app_image_name("myapp", "tsuru/app-myapp:v1")
            .await
            .unwrap();
        f.fake.add_service(ServiceSpec {
            name: "myapp-isolated-run".to_string(),
            ..Default::default()
        });
        f.deployer
            .run_isolated(
                &app(),
                &f.fake.client(),
                &["python".to_string(), "manage.py".to_string()],
                &Discard,
            )
            .await
            .unwrap();
        assert!(f.fake.services().is_empty());
        assert!(f
            .fake
            .calls()
            .contains(&"create_service myapp-isolated-run".to_string()));
        assert_eq!(
            f.fake
                .calls()
                .iter()
                .filter(|call| *call == "remove_service myapp-isolated-run")
                .count(),
            2
        );
    }

    #[test]
    fn health_checked_processes_wait_longer() {
        let upserter = Upserter {
            specs: SpecBuilder::new("http://tsuru.io"),
            healthcheck_max_time: Duration::from_secs(600),
        };
        let mut spec = ServiceSpec::default();
        assert_eq!(upserter.convergence_timeout(&spec), TASK_WAIT_TIMEOUT);
        spec.health_check = crate::domain::service::health_config(
            &CustomData {
                healthcheck: Some(Healthcheck {
                    path: Some("/".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            8888,
        );
        assert_eq!(
            upserter.convergence_timeout(&spec),
            Duration::from_secs(600)
        );
    }
}
