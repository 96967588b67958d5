use std::{collections::BTreeMap, time::Duration};

use crate::error::{Error, Result};

use super::model::{
    App, CustomData, HealthConfig, ImageMetadata, RestartCondition, Service, ServiceSpec,
    WEB_PROCESS_DEFAULT_PORT,
};

pub const LABEL_PREFIX: &str = "tsuru.";
pub const PROVISIONER_NAME: &str = "swarm";

const LABEL_SERVICE: &str = "service";
const LABEL_APP_NAME: &str = "app.name";
const LABEL_APP_PROCESS: &str = "app.process";
const LABEL_APP_PLATFORM: &str = "app.platform";
const LABEL_APP_REPLICAS: &str = "app.process.replicas";
const LABEL_BUILD_IMAGE: &str = "service.buildImage";
const LABEL_DEPLOY: &str = "service.deploy";
const LABEL_ISOLATED_RUN: &str = "service.isolatedRun";
const LABEL_RESTART: &str = "service.restart";
const LABEL_STOPPED: &str = "service.stopped";
const LABEL_ROUTER_NAME: &str = "router.name";
const LABEL_ROUTER_TYPE: &str = "router.type";
const LABEL_POOL: &str = "node.pool";
const LABEL_PROVISIONER: &str = "node.provisioner";

const APP_CURRENT_DIR: &str = "/home/application/current";
const HEALTHCHECK_INTERVAL: Duration = Duration::from_secs(3);
const HEALTHCHECK_DEFAULT_TIMEOUT: u64 = 60;

/// `tsuru.` prefixed labels carried by every app service. They are the
/// source of truth for replica counts and service to app lookups.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LabelSet {
    labels: BTreeMap<String, String>,
}

impl LabelSet {
    pub fn for_process(app: &App, process: &str) -> Self {
        let mut set = Self::default();
        set.set(LABEL_SERVICE, "true");
        set.set(LABEL_APP_NAME, &app.name);
        set.set(LABEL_APP_PROCESS, process);
        set.set(LABEL_APP_PLATFORM, &app.platform);
        set.set(LABEL_ROUTER_NAME, &app.router);
        set.set(LABEL_ROUTER_TYPE, &app.router_type);
        set.set(LABEL_POOL, &app.pool);
        set.set(LABEL_PROVISIONER, PROVISIONER_NAME);
        set.set(LABEL_BUILD_IMAGE, "");
        set.set(LABEL_DEPLOY, "false");
        set.set(LABEL_RESTART, "0");
        set
    }

    /// Reads back the labels of an existing service.
    pub fn from_labels(labels: &BTreeMap<String, String>) -> Self {
        Self {
            labels: labels.clone(),
        }
    }

    fn set(&mut self, key: &str, value: &str) {
        self.labels
            .insert(format!("{LABEL_PREFIX}{key}"), value.to_string());
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.labels
            .get(&format!("{LABEL_PREFIX}{key}"))
            .map(String::as_str)
    }

    pub fn app_name(&self) -> Option<&str> {
        self.get(LABEL_APP_NAME)
    }

    pub fn process(&self) -> Option<&str> {
        self.get(LABEL_APP_PROCESS)
    }

    pub fn replicas(&self) -> Option<u64> {
        self.get(LABEL_APP_REPLICAS)?.parse().ok()
    }

    pub fn set_replicas(&mut self, replicas: u64) {
        self.set(LABEL_APP_REPLICAS, &replicas.to_string());
    }

    pub fn restarts(&self) -> u64 {
        self.get(LABEL_RESTART)
            .and_then(|value| value.parse().ok())
            .unwrap_or(0)
    }

    pub fn set_restarts(&mut self, restarts: u64) {
        self.set(LABEL_RESTART, &restarts.to_string());
    }

    pub fn is_stopped(&self) -> bool {
        self.get(LABEL_STOPPED) == Some("true")
    }

    pub fn set_stopped(&mut self, stopped: bool) {
        if stopped {
            self.set(LABEL_STOPPED, "true");
        } else {
            self.labels.remove(&format!("{LABEL_PREFIX}{LABEL_STOPPED}"));
        }
    }

    pub fn set_build_image(&mut self, image: &str) {
        self.set(LABEL_BUILD_IMAGE, image);
    }

    pub fn set_deploy(&mut self) {
        self.set(LABEL_DEPLOY, "true");
    }

    pub fn set_isolated_run(&mut self) {
        self.set(LABEL_ISOLATED_RUN, "true");
    }

    pub fn to_labels(&self) -> BTreeMap<String, String> {
        self.labels.clone()
    }
}

/// What a deploy or unit operation does to one process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ProcessState {
    pub start: bool,
    pub stop: bool,
    pub restart: bool,
    pub increment: i64,
}

impl ProcessState {
    pub fn start() -> Self {
        Self {
            start: true,
            ..Default::default()
        }
    }

    pub fn stop() -> Self {
        Self {
            stop: true,
            ..Default::default()
        }
    }

    pub fn restart() -> Self {
        Self {
            restart: true,
            ..Default::default()
        }
    }

    pub fn increment(units: i64) -> Self {
        Self {
            increment: units,
            ..Default::default()
        }
    }
}

/// Labels for the next version of a process service, carrying replica count,
/// restart counter and stopped flag over from `old`.
pub fn labels_for_service(
    app: &App,
    process: &str,
    old: Option<&Service>,
    state: ProcessState,
) -> Result<LabelSet> {
    let mut labels = LabelSet::for_process(app, process);
    let (mut replicas, mut restarts, mut stopped) = match old {
        Some(old) => {
            let old_labels = LabelSet::from_labels(&old.spec.labels);
            (
                old_labels.replicas().unwrap_or(old.spec.replicas) as i64,
                old_labels.restarts(),
                old_labels.is_stopped(),
            )
        }
        None => (0, 0, false),
    };
    if state.increment != 0 {
        replicas += state.increment;
        if replicas < 0 {
            return Err(Error::InvalidUnits);
        }
    }
    if state.start || state.restart {
        if replicas == 0 {
            replicas = 1;
        }
        stopped = false;
    }
    if state.stop {
        replicas = 0;
        stopped = true;
    }
    if state.restart {
        restarts += 1;
    }
    labels.set_replicas(replicas as u64);
    labels.set_restarts(restarts);
    labels.set_stopped(stopped);
    Ok(labels)
}

/// Resolves the command a process container runs. An empty `process` is
/// accepted when the image declares exactly one process.
pub fn lean_container_cmds(
    process: &str,
    processes: &BTreeMap<String, Vec<String>>,
    data: &CustomData,
    extra: &[String],
) -> Result<(Vec<String>, String)> {
    let process = if process.is_empty() {
        match processes.keys().collect::<Vec<_>>().as_slice() {
            [only] => only.to_string(),
            _ => {
                return Err(Error::InvalidProcess(
                    "no process name specified and more than one declared in Procfile"
                        .to_string(),
                ))
            }
        }
    } else {
        process.to_string()
    };
    let command = processes
        .get(&process)
        .filter(|command| !command.is_empty())
        .ok_or_else(|| {
            Error::InvalidProcess(format!(
                "no command declared in Procfile for process {process:?}"
            ))
        })?;
    let mut before: Vec<&str> = extra.iter().map(String::as_str).collect();
    before.extend(data.restart_before_hooks().iter().map(String::as_str));
    let mut before = before.join(" && ");
    if !before.is_empty() {
        before.push_str(" && ");
    }
    let prefix = format!("[ -d {APP_CURRENT_DIR} ] && cd {APP_CURRENT_DIR}; {before}");
    let cmds = match command.as_slice() {
        [single] => vec![
            "/bin/sh".to_string(),
            "-lc".to_string(),
            format!("{prefix}exec {single}"),
        ],
        tokens => {
            let mut cmds = vec![
                "/bin/sh".to_string(),
                "-lc".to_string(),
                format!("{prefix}exec $0 \"$@\""),
            ];
            cmds.extend(tokens.iter().cloned());
            cmds
        }
    };
    Ok((cmds, process))
}

/// Translates the image health check and restart-after hooks into a
/// container health check. `None` when neither is set.
pub fn health_config(data: &CustomData, port: u16) -> Option<HealthConfig> {
    let check = data.healthcheck.clone().unwrap_or_default();
    let after = data.restart_after_hooks();
    let mut command = String::new();
    if let Some(path) = check.path.as_deref().filter(|path| !path.is_empty()) {
        let method = check
            .method
            .as_deref()
            .filter(|method| !method.is_empty())
            .unwrap_or("GET")
            .to_uppercase();
        let scheme = check
            .scheme
            .as_deref()
            .filter(|scheme| !scheme.is_empty())
            .unwrap_or("http");
        let path = path.trim_start_matches('/');
        command = match check.match_pattern.as_deref().filter(|m| !m.is_empty()) {
            Some(pattern) => format!(
                "curl -k -X{method} -fsSL {scheme}://localhost:{port}/{path} | egrep \"{}\"",
                pattern.replace('"', "\\\"")
            ),
            None => format!(
                "curl -k -X{method} -fsSL {scheme}://localhost:{port}/{path} -o/dev/null -w '%{{http_code}}' | grep {}",
                check.status.unwrap_or(200)
            ),
        };
    }
    if !after.is_empty() {
        let hooks = format!(
            "if [ ! -f /tmp/restartafterok ]; then {} && touch /tmp/restartafterok; fi",
            after.join(" && ")
        );
        command = if command.is_empty() {
            hooks
        } else {
            format!("{command} && {hooks}")
        };
    }
    if command.is_empty() {
        return None;
    }
    Some(HealthConfig {
        test: vec!["CMD-SHELL".to_string(), command],
        interval: HEALTHCHECK_INTERVAL,
        timeout: Duration::from_secs(
            check
                .timeout_seconds
                .filter(|timeout| *timeout > 0)
                .unwrap_or(HEALTHCHECK_DEFAULT_TIMEOUT),
        ),
        retries: check.allowed_failures.unwrap_or(0) + 1,
    })
}

pub fn service_name(app: &str, process: &str) -> String {
    format!("{app}-{process}")
}

pub fn network_name(app: &str) -> String {
    format!("app-{app}-overlay")
}

fn pool_constraint(pool: &str) -> String {
    format!("node.labels.{LABEL_PREFIX}pool == {pool}")
}

/// Environment of an app container. Build containers only see the app
/// variables and the API host.
pub fn env_for_app(app: &App, host: &str, process: Option<(&str, bool)>) -> Vec<String> {
    let mut env: Vec<String> = app
        .env
        .iter()
        .map(|(name, value)| format!("{name}={value}"))
        .collect();
    if let Some((process, _)) = process {
        env.push(format!("TSURU_PROCESSNAME={process}"));
    }
    env.push(format!("TSURU_HOST={host}"));
    if let Some((_, true)) = process {
        env.push(format!("PORT={WEB_PROCESS_DEFAULT_PORT}"));
        env.push(format!("port={WEB_PROCESS_DEFAULT_PORT}"));
    }
    env
}

/// Builds cluster service specs for app processes.
#[derive(Clone, Debug)]
pub struct SpecBuilder {
    host: String,
}

impl SpecBuilder {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Unit agent registration run before the process starts.
    pub fn register_cmd(&self, app: &App) -> String {
        let mut host = self.host.clone();
        if !host.starts_with("http") {
            host = format!("http://{host}");
        }
        if !host.ends_with('/') {
            host.push('/');
        }
        format!(
            "curl -sSL -m15 -XPOST -d\"hostname=$(hostname)\" -o/dev/null -H\"Content-Type:application/x-www-form-urlencoded\" -H\"Authorization:bearer {}\" {}apps/{}/units/register || true",
            app.token, host, app.name
        )
    }

    pub fn process_spec(
        &self,
        app: &App,
        process: &str,
        image: &str,
        metadata: &ImageMetadata,
        processes: &BTreeMap<String, Vec<String>>,
        web_process: &str,
        labels: &LabelSet,
    ) -> Result<ServiceSpec> {
        let extra = [self.register_cmd(app)];
        let (command, process) =
            lean_container_cmds(process, processes, &metadata.custom_data, &extra)?;
        let is_web = process == web_process;
        Ok(ServiceSpec {
            name: service_name(&app.name, &process),
            image: image.to_string(),
            command,
            env: env_for_app(app, &self.host, Some((&process, is_web))),
            labels: labels.to_labels(),
            replicas: labels.replicas().unwrap_or(0),
            constraints: vec![pool_constraint(&app.pool)],
            health_check: is_web
                .then(|| health_config(&metadata.custom_data, WEB_PROCESS_DEFAULT_PORT))
                .flatten(),
            endpoint_port: is_web.then_some(WEB_PROCESS_DEFAULT_PORT),
            networks: vec![network_name(&app.name)],
            mounts: app.volumes.clone(),
            restart_condition: RestartCondition::Any,
            log_driver: None,
            user: None,
        })
    }

    /// One-shot service running `cmds` once with the app environment.
    pub fn isolated_run_spec(&self, app: &App, image: &str, cmds: &[String]) -> ServiceSpec {
        let mut labels = LabelSet::for_process(app, "");
        labels.set_isolated_run();
        labels.set_replicas(1);
        ServiceSpec {
            name: format!("{}isolated-run", service_name(&app.name, "")),
            image: image.to_string(),
            command: vec![
                "/bin/sh".to_string(),
                "-lc".to_string(),
                format!(
                    "[ -d {APP_CURRENT_DIR} ] && cd {APP_CURRENT_DIR}; {}",
                    cmds.join(" ")
                ),
            ],
            env: env_for_app(app, &self.host, Some(("", false))),
            labels: labels.to_labels(),
            replicas: 1,
            constraints: vec![pool_constraint(&app.pool)],
            mounts: app.volumes.clone(),
            restart_condition: RestartCondition::None,
            ..Default::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::model::{Healthcheck, Hooks, RestartHooks};

    fn app() -> App {
        App {
            pool: "pool1".to_string(),
            token: "abc".to_string(),
            env: BTreeMap::from([("DATABASE".to_string(), "db1".to_string())]),
            ..App::new("myapp", "python")
        }
    }

    fn processes(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<String>> {
        entries
            .iter()
            .map(|(name, cmd)| {
                (
                    name.to_string(),
                    cmd.iter().map(|token| token.to_string()).collect(),
                )
            })
            .collect()
    }

    #[test]
    fn single_command_is_exec_wrapped() {
        let (cmds, process) = lean_container_cmds(
            "web",
            &processes(&[("web", &["python web.py"])]),
            &CustomData::default(),
            &[],
        )
        .unwrap();
        assert_eq!(process, "web");
        assert_eq!(
            cmds,
            vec![
                "/bin/sh",
                "-lc",
                "[ -d /home/application/current ] && cd /home/application/current; exec python web.py"
            ]
        );
    }

    #[test]
    fn restart_before_hooks_run_first() {
        let data = CustomData {
            hooks: Some(Hooks {
                restart: RestartHooks {
                    before: vec!["cmd1".to_string(), "cmd2".to_string()],
                    after: vec![],
                },
                build: vec![],
            }),
            ..Default::default()
        };
        let (cmds, _) =
            lean_container_cmds("web", &processes(&[("web", &["python web.py"])]), &data, &[])
                .unwrap();
        assert_eq!(
            cmds[2],
            "[ -d /home/application/current ] && cd /home/application/current; cmd1 && cmd2 && exec python web.py"
        );
    }

    #[test]
    fn token_list_is_passed_as_arguments() {
        let (cmds, process) = lean_container_cmds(
            "",
            &processes(&[("web", &["python", "web.py"])]),
            &CustomData::default(),
            &[],
        )
        .unwrap();
        assert_eq!(process, "web");
        assert_eq!(
            cmds,
            vec![
                "/bin/sh",
                "-lc",
                "[ -d /home/application/current ] && cd /home/application/current; exec $0 \"$@\"",
                "python",
                "web.py"
            ]
        );
    }

    #[test]
    fn ambiguous_or_unknown_process_is_rejected() {
        let two = processes(&[("web", &["python web.py"]), ("worker", &["python worker.py"])]);
        let err = lean_container_cmds("", &two, &CustomData::default(), &[]).unwrap_err();
        assert_eq!(
            err.to_string(),
            "no process name specified and more than one declared in Procfile"
        );
        let err = lean_container_cmds(
            "worker",
            &processes(&[("web", &["python web.py"])]),
            &CustomData::default(),
            &[],
        )
        .unwrap_err();
        assert_eq!(
            err.to_string(),
            "no command declared in Procfile for process \"worker\""
        );
    }

    #[test]
    fn register_cmd_normalizes_host() {
        let builder = SpecBuilder::new("tsuruhost");
        let mut app = app();
        app.token = String::new();
        let (cmds, _) = lean_container_cmds(
            "web",
            &processes(&[("web", &["python myapp.py"])]),
            &CustomData::default(),
            &[builder.register_cmd(&app)],
        )
        .unwrap();
        assert_eq!(
            cmds[2],
            "[ -d /home/application/current ] && cd /home/application/current; curl -sSL -m15 -XPOST -d\"hostname=$(hostname)\" -o/dev/null -H\"Content-Type:application/x-www-form-urlencoded\" -H\"Authorization:bearer \" http://tsuruhost/apps/myapp/units/register || true && exec python myapp.py"
        );
    }

    #[test]
    fn health_check_with_status() {
        let data = CustomData {
            healthcheck: Some(Healthcheck {
                path: Some("/hc".to_string()),
                allowed_failures: Some(2),
                ..Default::default()
            }),
            ..Default::default()
        };
        let config = health_config(&data, 8888).unwrap();
        assert_eq!(
            config.test,
            vec![
                "CMD-SHELL",
                "curl -k -XGET -fsSL http://localhost:8888/hc -o/dev/null -w '%{http_code}' | grep 200"
            ]
        );
        assert_eq!(config.retries, 3);
        assert_eq!(config.interval, Duration::from_secs(3));
        assert_eq!(config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn health_check_with_match_and_after_hooks() {
        let data = CustomData {
            healthcheck: Some(Healthcheck {
                path: Some("status".to_string()),
                method: Some("post".to_string()),
                scheme: Some("https".to_string()),
                match_pattern: Some("WORKING".to_string()),
                timeout_seconds: Some(10),
                ..Default::default()
            }),
            hooks: Some(Hooks {
                restart: RestartHooks {
                    before: vec![],
                    after: vec!["warmup".to_string()],
                },
                build: vec![],
            }),
            ..Default::default()
        };
        let config = health_config(&data, 8888).unwrap();
        assert_eq!(
            config.test[1],
            "curl -k -XPOST -fsSL https://localhost:8888/status | egrep \"WORKING\" && if [ ! -f /tmp/restartafterok ]; then warmup && touch /tmp/restartafterok; fi"
        );
        assert_eq!(config.timeout, Duration::from_secs(10));
        assert_eq!(config.retries, 1);
    }

    #[test]
    fn no_health_check_without_path_or_hooks() {
        assert!(health_config(&CustomData::default(), 8888).is_none());
    }

    #[test]
    fn replicas_follow_process_state() {
        let app = app();
        let labels = labels_for_service(&app, "web", None, ProcessState::start()).unwrap();
        assert_eq!(labels.replicas(), Some(1));
        let old = Service {
            spec: ServiceSpec {
                labels: labels.to_labels(),
                replicas: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        let more = labels_for_service(&app, "web", Some(&old), ProcessState::increment(2)).unwrap();
        assert_eq!(more.replicas(), Some(3));
        assert!(matches!(
            labels_for_service(&app, "web", Some(&old), ProcessState::increment(-2)),
            Err(Error::InvalidUnits)
        ));

        let stopped = labels_for_service(&app, "web", Some(&old), ProcessState::stop()).unwrap();
        assert_eq!(stopped.replicas(), Some(0));
        assert!(stopped.is_stopped());

        let old = Service {
            spec: ServiceSpec {
                labels: stopped.to_labels(),
                ..Default::default()
            },
            ..Default::default()
        };
        let restarted =
            labels_for_service(&app, "web", Some(&old), ProcessState::restart()).unwrap();
        assert_eq!(restarted.replicas(), Some(1));
        assert_eq!(restarted.restarts(), 1);
        assert!(!restarted.is_stopped());
    }

    #[test]
    fn web_process_spec() {
        let app = app();
        let metadata = ImageMetadata {
            processes: processes(&[("web", &["python web.py"]), ("worker", &["celery"])]),
            custom_data: CustomData {
                healthcheck: Some(Healthcheck {
                    path: Some("/health".to_string()),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..ImageMetadata::named("tsuru/app-myapp:v1")
        };
        let labels = labels_for_service(&app, "web", None, ProcessState::start()).unwrap();
        let spec = SpecBuilder::new("http://tsuru.io")
            .process_spec(
                &app,
                "web",
                "tsuru/app-myapp:v1",
                &metadata,
                &metadata.processes,
                "web",
                &labels,
            )
            .unwrap();
        assert_eq!(spec.name, "myapp-web");
        assert_eq!(spec.replicas, 1);
        assert_eq!(spec.networks, vec!["app-myapp-overlay"]);
        assert_eq!(spec.constraints, vec!["node.labels.tsuru.pool == pool1"]);
        assert_eq!(
            spec.env,
            vec![
                "DATABASE=db1",
                "TSURU_PROCESSNAME=web",
                "TSURU_HOST=http://tsuru.io",
                "PORT=8888",
                "port=8888"
            ]
        );
        assert_eq!(spec.labels["tsuru.app.name"], "myapp");
        assert_eq!(spec.labels["tsuru.node.provisioner"], "swarm");
        assert_eq!(spec.endpoint_port, Some(8888));
        assert!(spec.health_check.is_some());

        let worker = SpecBuilder::new("http://tsuru.io")
            .process_spec(
                &app,
                "worker",
                "tsuru/app-myapp:v1",
                &metadata,
                &metadata.processes,
                "web",
                &labels_for_service(&app, "worker", None, ProcessState::start()).unwrap(),
            )
            .unwrap();
        assert!(!worker.env.iter().any(|env| env.starts_with("PORT=")));
        assert_eq!(worker.endpoint_port, None);
        assert_eq!(worker.health_check, None);
    }

    #[test]
    fn no_endpoint_without_web_process() {
        let app = app();
        let metadata = ImageMetadata {
            processes: processes(&[("worker", &["celery"]), ("beat", &["celery beat"])]),
            ..ImageMetadata::named("tsuru/app-myapp:v1")
        };
        let builder = SpecBuilder::new("http://tsuru.io");
        for process in ["beat", "worker"] {
            let spec = builder
                .process_spec(
                    &app,
                    process,
                    "tsuru/app-myapp:v1",
                    &metadata,
                    &metadata.processes,
                    "web",
                    &labels_for_service(&app, process, None, ProcessState::start()).unwrap(),
                )
                .unwrap();
            assert_eq!(spec.endpoint_port, None);
            assert!(!spec.env.iter().any(|env| env.starts_with("PORT=")));
        }
    }
}
