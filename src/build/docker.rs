//! Image builds against the local Docker daemon

use super::update::BuildUpdateWriter;
use super::{image_name, BuildError, ImageBuilder};
use crate::project::Service;
use async_trait::async_trait;
use bollard::image::BuildImageOptions;
use bollard::Docker;
use bytes::Bytes;
use futures_util::stream::StreamExt;
use ignore::{overrides::OverrideBuilder, WalkBuilder};
use std::io;
use std::path::{Path, PathBuf};
use tracing::debug;

fn context_error(e: impl ToString) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Packages `base_dir` as a tar build context.
///
/// Files matching any of `ignore` (gitignore-style globs) are left out. The
/// Dockerfile is always included so the daemon can find it.
pub fn archive_context(base_dir: &Path, dockerfile: &Path, ignore: &[String]) -> io::Result<Vec<u8>> {
    let mut overrides = OverrideBuilder::new(base_dir);
    for pattern in ignore {
        overrides
            .add(&format!("!{}", pattern))
            .map_err(context_error)?;
    }
    let overrides = overrides.build().map_err(context_error)?;

    let mut archive = tar::Builder::new(Vec::new());
    let mut has_dockerfile = false;

    for entry in WalkBuilder::new(base_dir)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .ignore(false)
        .parents(false)
        .overrides(overrides)
        .build()
    {
        let entry = entry.map_err(context_error)?;
        if !entry.file_type().is_some_and(|t| t.is_file()) {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(base_dir).map_err(context_error)?;
        if relative == dockerfile {
            has_dockerfile = true;
        }
        archive.append_path_with_name(path, relative)?;
    }

    if !has_dockerfile {
        archive.append_path_with_name(base_dir.join(dockerfile), dockerfile)?;
    }

    archive.into_inner()
}

/// Dockerfile path as seen from inside the build context
fn dockerfile_in_context(base_dir: &Path, dockerfile: &Path) -> PathBuf {
    dockerfile
        .strip_prefix(base_dir)
        .unwrap_or(dockerfile)
        .to_path_buf()
}

/// Builds service images with the Docker engine API
pub struct DockerImageBuilder {
    docker: Docker,
}

impl DockerImageBuilder {
    pub fn connect() -> Result<Self, bollard::errors::Error> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    pub fn with_client(docker: Docker) -> Self {
        Self { docker }
    }

    /// Engine API version reported by the daemon; fails if it cannot be reached
    pub async fn daemon_version(&self) -> Result<String, bollard::errors::Error> {
        let version = self.docker.version().await?;
        let api_version = version.api_version.unwrap_or_else(|| "unknown".to_string());
        debug!(api_version = %api_version, "Docker daemon reachable");
        Ok(api_version)
    }
}

#[async_trait]
impl ImageBuilder for DockerImageBuilder {
    async fn build(
        &self,
        project_name: &str,
        service: &Service,
        output: BuildUpdateWriter,
    ) -> Result<String, BuildError> {
        let context = service.build_context();
        let tag = image_name(project_name, service.name());
        let dockerfile = dockerfile_in_context(&context.base_dir, &context.dockerfile);

        let base_dir = context.base_dir.clone();
        let archive_dockerfile = dockerfile.clone();
        let ignore = context.ignore.clone();
        let archive = tokio::task::spawn_blocking(move || {
            archive_context(&base_dir, &archive_dockerfile, &ignore)
        })
        .await
        .map_err(context_error)
        .and_then(|r| r)
        .map_err(|source| BuildError::Context {
            service: service.name().to_string(),
            source,
        })?;

        debug!(
            service = %service.name(),
            image = %tag,
            context_bytes = archive.len(),
            "Sending build context to Docker"
        );

        let options = BuildImageOptions {
            dockerfile: dockerfile.to_string_lossy().replace('\\', "/"),
            t: tag.clone(),
            buildargs: context.args.clone(),
            rm: true,
            ..Default::default()
        };

        let mut stream = self
            .docker
            .build_image(options, None, Some(Bytes::from(archive)));

        while let Some(item) = stream.next().await {
            let info = item.map_err(|source| BuildError::Docker {
                service: service.name().to_string(),
                source,
            })?;

            if let Some(message) = info.error {
                return Err(BuildError::Daemon {
                    service: service.name().to_string(),
                    message,
                });
            }
            if let Some(line) = info.stream {
                output.write_lines(&line);
            }
        }

        Ok(tag)
    }
}
