use anyhow::{Context, Error};
use config::{Config, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub host: String,
    pub listen: String,
    pub database: DatabaseConfig,
    pub docker: DockerConfig,
    pub cluster: ClusterConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost:8080".to_string(),
            listen: "0.0.0.0:8080".to_string(),
            database: DatabaseConfig::default(),
            docker: DockerConfig::default(),
            cluster: ClusterConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageDriver {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct DatabaseConfig {
    pub driver: StorageDriver,
    pub url: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            driver: StorageDriver::Sqlite,
            url: "sqlite:tsuru.db?mode=rwc".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct DockerConfig {
    pub registry: String,
    #[serde(alias = "repository_namespace")]
    pub repository_namespace: String,
    pub collection: String,
    #[serde(alias = "image_history_size")]
    pub image_history_size: usize,
    #[serde(alias = "max_layers")]
    pub max_layers: u64,
    #[serde(alias = "registry_max_try")]
    pub registry_max_try: u32,
    #[serde(alias = "registry_auth")]
    pub registry_auth: RegistryAuth,
    pub user: String,
    pub ssh: SshConfig,
    pub uid: i64,
    pub healthcheck: HealthcheckConfig,
    #[serde(alias = "deploy_cmd")]
    pub deploy_cmd: String,
    #[serde(alias = "run_cmd")]
    pub run_cmd: RunCmdConfig,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            registry: String::new(),
            repository_namespace: "tsuru".to_string(),
            collection: "docker".to_string(),
            image_history_size: 10,
            max_layers: 10,
            registry_max_try: 3,
            registry_auth: RegistryAuth::default(),
            user: String::new(),
            ssh: SshConfig::default(),
            uid: 1000,
            healthcheck: HealthcheckConfig::default(),
            deploy_cmd: "/var/lib/tsuru/deploy".to_string(),
            run_cmd: RunCmdConfig::default(),
        }
    }
}

impl DockerConfig {
    /// Username and optional uid build and run containers execute as.
    pub fn user_for_container(&self) -> (String, Option<i64>) {
        let username = if !self.user.is_empty() {
            self.user.clone()
        } else if !self.ssh.user.is_empty() {
            self.ssh.user.clone()
        } else {
            "ubuntu".to_string()
        };
        let uid = (self.uid >= 0).then_some(self.uid);
        (username, uid)
    }

    /// Value for a container's `User` field.
    pub fn container_user(&self) -> String {
        match self.user_for_container() {
            (_, Some(uid)) => uid.to_string(),
            (username, None) => username,
        }
    }

    pub fn history_size(&self) -> usize {
        if self.image_history_size == 0 {
            10
        } else {
            self.image_history_size
        }
    }

    pub fn max_layers(&self) -> u64 {
        if self.max_layers == 0 {
            10
        } else {
            self.max_layers
        }
    }

    pub fn max_push_tries(&self) -> u32 {
        if self.registry_max_try == 0 {
            3
        } else {
            self.registry_max_try
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RegistryAuth {
    pub email: String,
    pub username: String,
    pub password: String,
}

impl RegistryAuth {
    pub fn is_empty(&self) -> bool {
        self.username.is_empty() && self.password.is_empty()
    }
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SshConfig {
    pub user: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct HealthcheckConfig {
    #[serde(alias = "max_time")]
    pub max_time: u64,
}

impl Default for HealthcheckConfig {
    fn default() -> Self {
        Self { max_time: 120 }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RunCmdConfig {
    pub bin: String,
}

impl Default for RunCmdConfig {
    fn default() -> Self {
        Self {
            bin: "/var/lib/tsuru/start".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, rename_all = "kebab-case")]
pub struct ClusterConfig {
    pub managers: Vec<String>,
    pub tls: Option<TlsConfig>,
    #[serde(alias = "dial_timeout")]
    pub dial_timeout: u64,
    #[serde(alias = "max_manager_tries")]
    pub max_manager_tries: usize,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            managers: vec![],
            tls: None,
            dial_timeout: 5,
            max_manager_tries: 3,
        }
    }
}

/// Paths to the PEM files used to reach TLS protected cluster managers.
#[derive(Debug, Clone, Default, Deserialize, serde::Serialize, PartialEq, Eq)]
pub struct TlsConfig {
    pub ca: String,
    pub cert: String,
    pub key: String,
}

pub fn load_config() -> Result<AppConfig, Error> {
    let path = std::env::var("TSURU_CONFIG").unwrap_or_else(|_| "tsuru.yaml".to_string());
    load_config_from(&path)
}

pub fn load_config_from(path: &str) -> Result<AppConfig, Error> {
    let config = Config::builder()
        .add_source(File::with_name(path).required(false))
        .add_source(Environment::with_prefix("tsuru").separator("__"))
        .build()
        .context("Can't load configuration")?;

    config
        .try_deserialize()
        .context("Can't deserialize AppConfig from loaded configuration")
}
