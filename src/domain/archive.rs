use std::time::Duration;

use bytes::Bytes;
use log::{error, info};

use crate::error::{Error, Result};

use super::{
    cluster::create_container_pulling,
    event::OutputWriter,
    image::ImageService,
    model::{App, ContainerSpec},
    port::ClusterHandle,
};

pub const ARCHIVE_DIR: &str = "/home/application";
pub const ARCHIVE_NAME: &str = "archive.tar.gz";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(300);

/// Where the code of a deploy comes from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ArchiveSource {
    Upload(Bytes),
    Url(String),
    /// Reuse the archive stored in the current app image.
    Rebuild,
    /// Skip the build and redeploy the current builder image.
    Redeploy,
}

/// Raw deploy inputs as received from a caller. Exactly one of them must be set.
#[derive(Clone, Debug, Default)]
pub struct ArchiveRequest {
    pub file: Option<Bytes>,
    pub file_size: u64,
    pub url: Option<String>,
    pub rebuild: bool,
    pub redeploy: bool,
}

impl ArchiveRequest {
    pub fn source(self) -> Result<ArchiveSource> {
        let mut sources = Vec::with_capacity(1);
        if let Some(file) = self.file.filter(|file| !file.is_empty()) {
            if self.file_size > 0 {
                sources.push(ArchiveSource::Upload(file));
            }
        }
        if let Some(url) = self.url.filter(|url| !url.is_empty()) {
            sources.push(ArchiveSource::Url(url));
        }
        if self.rebuild {
            sources.push(ArchiveSource::Rebuild);
        }
        if self.redeploy {
            sources.push(ArchiveSource::Redeploy);
        }
        match sources.len() {
            1 => sources.pop().ok_or(Error::NoValidFiles),
            _ => Err(Error::NoValidFiles),
        }
    }
}

/// What the build step receives.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Archive {
    /// Tar stream holding `archive.tar.gz`, uploaded into [`ARCHIVE_DIR`].
    Tar(Bytes),
    /// Already built image, the build is skipped.
    BuilderImage(String),
}

/// Wraps `data` in a single-entry tar named `name`.
pub fn deploy_tar(name: &str, data: &[u8]) -> Result<Bytes> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    let mut tar = tar::Builder::new(Vec::with_capacity(data.len() + 1024));
    tar.append_data(&mut header, name, data)?;
    Ok(Bytes::from(tar.into_inner()?))
}

pub struct ArchiveFetcher {
    http: reqwest::Client,
}

impl ArchiveFetcher {
    pub fn new() -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(DOWNLOAD_TIMEOUT)
            .build()?;
        Ok(Self { http })
    }

    pub async fn download(&self, url: &str) -> Result<Bytes> {
        let body = self
            .http
            .get(url)
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        if body.is_empty() {
            return Err(Error::EmptyArchive);
        }
        Ok(body)
    }

    pub async fn acquire(
        &self,
        source: ArchiveSource,
        app: &App,
        images: &ImageService,
        client: &ClusterHandle,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<Archive> {
        match source {
            ArchiveSource::Upload(data) => Ok(Archive::Tar(deploy_tar(ARCHIVE_NAME, &data)?)),
            ArchiveSource::Url(url) => {
                out.line(&format!(" ---> Downloading archive from {url}"));
                let data = self.download(&url).await?;
                Ok(Archive::Tar(deploy_tar(ARCHIVE_NAME, &data)?))
            }
            ArchiveSource::Rebuild => {
                let image = images.current_image_name(&app.name).await?;
                out.line(&format!(" ---> Reusing archive from image {image:?}"));
                let data = self.from_image(client, app, &image, out).await?;
                Ok(Archive::Tar(data))
            }
            ArchiveSource::Redeploy => Ok(Archive::BuilderImage(
                images.current_builder_image_name(&app.name).await?,
            )),
        }
    }

    /// Copies the stored archive out of a throwaway container of `image`.
    async fn from_image(
        &self,
        client: &ClusterHandle,
        app: &App,
        image: &str,
        out: &(dyn OutputWriter + Send + Sync),
    ) -> Result<Bytes> {
        let spec = ContainerSpec {
            image: image.to_string(),
            cmd: vec!["/bin/true".to_string()],
            ..Default::default()
        };
        let id = create_container_pulling(client, &spec, out)
            .await
            .map_err(|err| {
                error!("Can't create container from {}: {}", image, err);
                Error::ImageNotFound(app.name.clone())
            })?;
        let path = format!("{ARCHIVE_DIR}/{ARCHIVE_NAME}");
        let downloaded = client.download_from_container(&id, &path).await;
        if let Err(err) = client.remove_container(&id).await {
            error!("Can't remove container {}: {}", id, err);
        }
        let data = downloaded.map_err(|err| {
            error!("Can't download {} from {}: {}", path, image, err);
            Error::ImageNotFound(app.name.clone())
        })?;
        info!("Archive of {} recovered from {}", app.name, image);
        if data.is_empty() {
            return Err(Error::EmptyArchive);
        }
        Ok(data)
    }
}
