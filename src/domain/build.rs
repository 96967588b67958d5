use std::{collections::BTreeMap, sync::Arc, time::Duration};

use anyhow::anyhow;
use async_trait::async_trait;
use bytes::Bytes;
use log::{error, info, warn};

use crate::{
    config::DockerConfig,
    error::{Error, Result},
};

use super::{
    archive::{ARCHIVE_DIR, ARCHIVE_NAME},
    cluster::{create_container_pulling, safe_attach_wait, CONTAINER_CHECK_INTERVAL, PULL_INACTIVITY_TIMEOUT},
    event::{Buffer, DeployEvent, OutputWriter},
    image::{split_image_name, ImageService},
    model::{App, ContainerSpec, CustomData, ProcessCommand, WEB_PROCESS_NAME},
    pipeline::{Action, BoxedAction, Pipeline},
    port::ClusterHandle,
    service::{env_for_app, LabelSet},
};

pub const UNIT_AGENT: &str = "tsuru_unit_agent";
const PUSH_RETRY_PAUSE: Duration = Duration::from_secs(1);
const PROCFILE_NAMES: [&str; 1] = ["Procfile"];
const TSURU_YAML_NAMES: [&str; 4] = ["tsuru.yml", "tsuru.yaml", "app.yml", "app.yaml"];
const APP_DIRS: [&str; 3] = ["/home/application/current", "/app/user", "/"];

/// Pushes images to the configured registry, retrying failed attempts.
pub struct Registry {
    config: DockerConfig,
    retry_pause: Duration,
}

impl Registry {
    pub fn new(config: DockerConfig) -> Self {
        Self {
            config,
            retry_pause: PUSH_RETRY_PAUSE,
        }
    }

    #[cfg(test)]
    pub fn with_retry_pause(mut self, pause: Duration) -> Self {
        self.retry_pause = pause;
        self
    }

    /// No-op without a registry. A cancellation seen between attempts stops
    /// the retries.
    pub async fn push(
        &self,
        client: &ClusterHandle,
        image: &str,
        event: &DeployEvent,
    ) -> Result<()> {
        if self.config.registry.is_empty() {
            return Ok(());
        }
        let (repository, tag) = split_image_name(image);
        let auth = (!self.config.registry_auth.is_empty()).then_some(&self.config.registry_auth);
        let tries = self.config.max_push_tries();
        let mut attempt = 1;
        loop {
            match client.push_image(&repository, &tag, auth, event).await {
                Ok(()) => return Ok(()),
                Err(err) if attempt < tries => {
                    warn!("Push of {} failed (attempt {}/{}): {}", image, attempt, tries, err);
                    event.line(&format!(
                        "Could not send image, trying again. Original error: {err}"
                    ));
                    tokio::time::sleep(self.retry_pause).await;
                    if event.ack_cancel() {
                        return Err(Error::DeployCanceled);
                    }
                    attempt += 1;
                }
                Err(err) => {
                    return Err(Error::PushExhausted {
                        image: image.to_string(),
                        source: err,
                    })
                }
            }
        }
    }
}

pub struct BuildContext {
    pub app: App,
    pub client: ClusterHandle,
    pub event: Arc<DeployEvent>,
    pub archive: Bytes,
    pub builder_image: String,
    pub container: ContainerSpec,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct BuildState {
    pub container_id: String,
    pub image: Option<String>,
}

fn previous_state(previous: Option<&BuildState>) -> Result<BuildState> {
    previous
        .cloned()
        .ok_or_else(|| Error::Other(anyhow!("build step started without a container")))
}

struct CreateContainer;

#[async_trait]
impl Action<BuildContext, BuildState> for CreateContainer {
    fn name(&self) -> &'static str {
        "create-build-container"
    }

    async fn forward(&self, ctx: &BuildContext, _: Option<&BuildState>) -> Result<BuildState> {
        let container_id =
            create_container_pulling(&ctx.client, &ctx.container, &*ctx.event).await?;
        Ok(BuildState {
            container_id,
            image: None,
        })
    }

    async fn backward(&self, ctx: &BuildContext, result: &BuildState) {
        if let Err(err) = ctx.client.remove_container(&result.container_id).await {
            error!("Can't remove build container {}: {}", result.container_id, err);
        }
    }
}

struct UploadArchive;

#[async_trait]
impl Action<BuildContext, BuildState> for UploadArchive {
    fn name(&self) -> &'static str {
        "upload-archive"
    }

    async fn forward(&self, ctx: &BuildContext, previous: Option<&BuildState>) -> Result<BuildState> {
        let state = previous_state(previous)?;
        ctx.client
            .upload_to_container(&state.container_id, ARCHIVE_DIR, ctx.archive.clone())
            .await?;
        Ok(state)
    }
}

struct RunDeployCmd;

#[async_trait]
impl Action<BuildContext, BuildState> for RunDeployCmd {
    fn name(&self) -> &'static str {
        "run-deploy-cmd"
    }

    async fn forward(&self, ctx: &BuildContext, previous: Option<&BuildState>) -> Result<BuildState> {
        let state = previous_state(previous)?;
        ctx.client.start_container(&state.container_id).await?;
        let exit = safe_attach_wait(
            &ctx.client,
            &state.container_id,
            &*ctx.event,
            CONTAINER_CHECK_INTERVAL,
        )
        .await?;
        if exit != 0 {
            return Err(Error::ExitStatus(exit));
        }
        Ok(state)
    }
}

struct CommitImage;

#[async_trait]
impl Action<BuildContext, BuildState> for CommitImage {
    fn name(&self) -> &'static str {
        "commit-image"
    }

    async fn forward(&self, ctx: &BuildContext, previous: Option<&BuildState>) -> Result<BuildState> {
        let mut state = previous_state(previous)?;
        let (repository, tag) = split_image_name(&ctx.builder_image);
        let id = ctx
            .client
            .commit_container(&state.container_id, &repository, &tag)
            .await?;
        info!("Committed {} as {}", ctx.builder_image, id);
        ctx.event
            .line(&format!(" ---> Image {:?} committed", ctx.builder_image));
        state.image = Some(ctx.builder_image.clone());
        Ok(state)
    }

    async fn backward(&self, ctx: &BuildContext, result: &BuildState) {
        let Some(image) = &result.image else {
            return;
        };
        if let Err(err) = ctx.client.remove_image(image).await {
            error!("Can't remove committed image {}: {}", image, err);
        }
    }
}

struct PushImage {
    registry: Arc<Registry>,
}

#[async_trait]
impl Action<BuildContext, BuildState> for PushImage {
    fn name(&self) -> &'static str {
        "push-image"
    }

    async fn forward(&self, ctx: &BuildContext, previous: Option<&BuildState>) -> Result<BuildState> {
        let state = previous_state(previous)?;
        self.registry
            .push(&ctx.client, &ctx.builder_image, &ctx.event)
            .await?;
        Ok(state)
    }
}

struct RecordHistory {
    images: Arc<ImageService>,
}

#[async_trait]
impl Action<BuildContext, BuildState> for RecordHistory {
    fn name(&self) -> &'static str {
        "record-builder-history"
    }

    async fn forward(&self, ctx: &BuildContext, previous: Option<&BuildState>) -> Result<BuildState> {
        let state = previous_state(previous)?;
        self.images
            .append_app_builder_image_name(&ctx.app.name, &ctx.builder_image)
            .await?;
        let evicted = self.images.trim_app_builder_images(&ctx.app.name).await?;
        if !evicted.is_empty() {
            info!("Evicted builder images of {}: {:?}", ctx.app.name, evicted);
        }
        Ok(state)
    }
}

/// Parses a `tsuru.yaml` document. Blank input yields empty custom data.
pub fn parse_tsuru_yaml(raw: &str) -> Result<CustomData> {
    if raw.trim().is_empty() {
        return Ok(CustomData::default());
    }
    let value: serde_json::Value = config::Config::builder()
        .add_source(config::File::from_str(raw, config::FileFormat::Yaml))
        .build()
        .and_then(|parsed| parsed.try_deserialize())
        .map_err(|err| Error::Other(anyhow!("invalid tsuru.yaml: {err}")))?;
    serde_json::from_value(value).map_err(|err| Error::Other(anyhow!("invalid tsuru.yaml: {err}")))
}

fn cat_cmd(names: &[&str]) -> String {
    let cats: Vec<String> = names
        .iter()
        .flat_map(|name| {
            APP_DIRS
                .iter()
                .map(move |dir| format!("cat {}/{}", dir.trim_end_matches('/'), name))
        })
        .collect();
    format!("({} || true) 2>/dev/null", cats.join(" || "))
}

/// Runs builds and turns builder or external images into deployable app images.
pub struct Builder {
    images: Arc<ImageService>,
    registry: Arc<Registry>,
    config: DockerConfig,
    host: String,
}

impl Builder {
    pub fn new(
        images: Arc<ImageService>,
        registry: Arc<Registry>,
        config: DockerConfig,
        host: &str,
    ) -> Self {
        Self {
            images,
            registry,
            config,
            host: host.to_string(),
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Platform image on first deploy, every `max-layers` deploys, or when
    /// the app asked for a platform update. The current app image otherwise.
    pub async fn base_image(&self, app: &App) -> Result<String> {
        let flatten = app.deploys == 0
            || app.update_platform
            || app.deploys % self.config.max_layers() == 0;
        if !flatten {
            match self.images.current_image_name(&app.name).await {
                Ok(image) => return Ok(image),
                Err(Error::NoImages(_)) => {}
                Err(err) => return Err(err),
            }
        }
        self.images.platform_current_image(&app.platform).await
    }

    pub fn deploy_cmds(&self, app: &App, archive_url: &str) -> Vec<String> {
        let deploy = format!("{} archive {}", self.config.deploy_cmd, archive_url);
        vec![
            "/bin/sh".to_string(),
            "-lc".to_string(),
            format!(
                "{UNIT_AGENT} {} {} {} \"{deploy}\" deploy",
                self.host, app.token, app.name
            ),
        ]
    }

    /// Builds `archive` on top of the base image and returns the pushed
    /// builder image.
    pub async fn build(
        &self,
        app: &App,
        client: ClusterHandle,
        archive: Bytes,
        event: Arc<DeployEvent>,
    ) -> Result<String> {
        let base_image = self.base_image(app).await?;
        let builder_image = self.images.new_build_image_name(&app.name).await?;
        event.line("---- Building application image ----");
        event.line(&format!(" ---> Using base image {base_image:?}"));
        let mut labels = LabelSet::for_process(app, "");
        labels.set_deploy();
        labels.set_build_image(&builder_image);
        let container = ContainerSpec {
            image: base_image,
            cmd: self.deploy_cmds(app, &format!("file://{ARCHIVE_DIR}/{ARCHIVE_NAME}")),
            env: env_for_app(app, &self.host, None),
            user: Some(self.config.container_user()),
            labels: labels.to_labels(),
            ..Default::default()
        };
        let ctx = BuildContext {
            app: app.clone(),
            client,
            event: event.clone(),
            archive,
            builder_image,
            container,
        };
        let actions: Vec<BoxedAction<BuildContext, BuildState>> = vec![
            Box::new(CreateContainer),
            Box::new(UploadArchive),
            Box::new(RunDeployCmd),
            Box::new(CommitImage),
            Box::new(PushImage {
                registry: self.registry.clone(),
            }),
            Box::new(RecordHistory {
                images: self.images.clone(),
            }),
        ];
        let state = Pipeline::new(actions).with_event(event).execute(&ctx).await?;
        if let Err(err) = ctx.client.remove_container(&state.container_id).await {
            error!("Can't remove build container {}: {}", state.container_id, err);
        }
        Ok(ctx.builder_image)
    }

    /// Runs `cmd` in a throwaway container of `image` and returns its output.
    async fn run_in_image(
        &self,
        client: &ClusterHandle,
        image: &str,
        cmd: String,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<(String, i64)> {
        let spec = ContainerSpec {
            image: image.to_string(),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            cmd: vec![cmd],
            user: Some(self.config.container_user()),
            ..Default::default()
        };
        let id = create_container_pulling(client, &spec, out).await?;
        let buffer = Buffer::default();
        let result = async {
            client.start_container(&id).await?;
            safe_attach_wait(client, &id, &buffer, CONTAINER_CHECK_INTERVAL).await
        }
        .await;
        if let Err(err) = client.remove_container(&id).await {
            error!("Can't remove container {}: {}", id, err);
        }
        Ok((buffer.contents(), result?))
    }

    async fn run_build_hooks(
        &self,
        client: &ClusterHandle,
        source: &str,
        target: &str,
        hooks: &[String],
        event: &DeployEvent,
    ) -> Result<()> {
        event.line("---- Running build hooks ----");
        for hook in hooks {
            event.line(&format!(" ---> Running {hook:?}"));
        }
        let spec = ContainerSpec {
            image: source.to_string(),
            entrypoint: Some(vec!["/bin/sh".to_string(), "-c".to_string()]),
            cmd: vec![hooks.join(" && ")],
            user: Some(self.config.container_user()),
            ..Default::default()
        };
        let id = create_container_pulling(client, &spec, event).await?;
        let result = async {
            client.start_container(&id).await?;
            let exit = safe_attach_wait(client, &id, event, CONTAINER_CHECK_INTERVAL).await?;
            if exit != 0 {
                return Err(Error::ExitStatus(exit));
            }
            let (repository, tag) = split_image_name(target);
            client.commit_container(&id, &repository, &tag).await?;
            Ok::<(), Error>(())
        }
        .await;
        if let Err(err) = client.remove_container(&id).await {
            error!("Can't remove build hook container {}: {}", id, err);
        }
        result
    }

    /// Mints the next app image from `source`, records its processes and
    /// custom data, then tags and pushes it.
    pub async fn prepare_image(
        &self,
        app: &App,
        client: &ClusterHandle,
        source: &str,
        event: &DeployEvent,
        run_hooks: bool,
    ) -> Result<String> {
        let new_image = self.images.new_app_image_name(&app.name).await?;

        event.line("---- Getting process from image ----");
        let (procfile, _) = self
            .run_in_image(client, source, cat_cmd(&PROCFILE_NAMES), event)
            .await?;
        event.line("---- Getting tsuru.yaml from image ----");
        let (yaml, _) = self
            .run_in_image(client, source, cat_cmd(&TSURU_YAML_NAMES), event)
            .await?;
        let mut data = parse_tsuru_yaml(&yaml)?;

        event.line(&format!("---- Inspecting image {source:?} ----"));
        let info = client.inspect_image(source).await?;
        if info.exposed_ports.len() > 1 {
            return Err(Error::TooManyPorts);
        }
        if !info.exposed_ports.is_empty() {
            data.exposed_ports = Some(info.exposed_ports.clone());
        }
        if !procfile.trim().is_empty() {
            data.procfile = Some(procfile);
        } else {
            let command: Vec<String> = info
                .entrypoint
                .iter()
                .chain(info.cmd.iter())
                .cloned()
                .collect();
            if !command.is_empty() {
                event.line("  ---> Procfile not found, using entrypoint and cmd");
                data.processes = Some(BTreeMap::from([(
                    WEB_PROCESS_NAME.to_string(),
                    ProcessCommand::List(command),
                )]));
            }
        }

        let hooks = data
            .hooks
            .as_ref()
            .map(|hooks| hooks.build.clone())
            .unwrap_or_default();
        self.images.save_image_custom_data(&new_image, data).await?;
        let metadata = self.images.get_image_custom_data(&new_image).await?;
        for (process, command) in &metadata.processes {
            event.line(&format!(
                "  ---> Process {process:?} found with commands: {command:?}"
            ));
        }

        if run_hooks && !hooks.is_empty() {
            self.run_build_hooks(client, source, &new_image, &hooks, event)
                .await?;
        } else {
            let (repository, tag) = split_image_name(&new_image);
            client.tag_image(source, &repository, &tag).await?;
        }
        if !self.config.registry.is_empty() {
            event.line(&format!("---- Pushing image {new_image:?} to tsuru ----"));
        }
        self.registry.push(client, &new_image, event).await?;
        Ok(new_image)
    }

    /// Pulls an externally built image and prepares it for deploy.
    pub async fn import_image(
        &self,
        app: &App,
        client: &ClusterHandle,
        image: &str,
        event: &DeployEvent,
    ) -> Result<String> {
        event.line(&format!("---- Pulling image {image:?} ----"));
        client
            .pull_image(image, event, PULL_INACTIVITY_TIMEOUT)
            .await?;
        self.prepare_image(app, client, image, event, true).await
    }
}
