//! `build`: build a producer image and push it to ECR.
//!
//! Docker and git are driven as external processes. Every failure of either
//! is fatal.
use std::{path::PathBuf, process::Stdio};

use anyhow::{bail, Context};
use chrono::{DateTime, Utc};
use tokio::{io::AsyncWriteExt, process::Command};

use crate::{
    aws::{
        ecr::{registry_login, Repository},
        ssm::Parameter,
        AwsContext,
    },
    config::Config,
    names::{Names, Service},
    remote::Remote,
    HasDependencies, Resource, Result, Store,
};

use super::{execute, Session};

/// A tag derived from the current time, `%Y%m%d%H%M%S` in UTC.
pub fn timestamp_tag(now: DateTime<Utc>) -> String {
    now.format("%Y%m%d%H%M%S").to_string()
}

async fn git_short_head() -> Option<String> {
    let output = Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .await
        .ok()?;
    if !output.status.success() {
        return None;
    }
    let head = String::from_utf8_lossy(&output.stdout).trim().to_owned();
    (!head.is_empty()).then_some(head)
}

/// The tag to push: `explicit`, else the short git commit, else a timestamp.
pub async fn resolve_tag(explicit: Option<String>) -> String {
    if let Some(tag) = explicit {
        return tag;
    }
    match git_short_head().await {
        Some(head) => head,
        None => {
            log::warn!("not in a git checkout, tagging with the current time");
            timestamp_tag(Utc::now())
        }
    }
}

async fn docker(args: &[&str]) -> anyhow::Result<()> {
    log::debug!("docker {}", args.join(" "));
    let output = Command::new("docker")
        .args(args)
        .output()
        .await
        .context("Failed to run docker - is it installed and on the PATH?")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("docker {} failed: {}", args[0], stderr.trim());
    }
    Ok(())
}

async fn docker_login(username: &str, password: &str, endpoint: &str) -> anyhow::Result<()> {
    let mut child = Command::new("docker")
        .args(["login", "--username", username, "--password-stdin", endpoint])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .context("Failed to run docker login")?;
    let mut stdin = child.stdin.take().context("docker login has no stdin")?;
    stdin
        .write_all(password.as_bytes())
        .await
        .context("Failed to pass the registry password to docker")?;
    drop(stdin);
    let output = child
        .wait_with_output()
        .await
        .context("Failed to wait for docker login")?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!("docker login to {endpoint} failed: {}", stderr.trim());
    }
    Ok(())
}

/// A producer image pushed as `<repository>:<tag>` and `<repository>:latest`.
///
/// Images are never read back, so every ensure builds and pushes.
#[derive(Clone, Debug)]
pub struct Image {
    pub service: Service,
    pub repository_uri: Remote<String>,
    pub tag: String,
    pub dockerfile: PathBuf,
    pub build_context: PathBuf,
}

impl HasDependencies for Image {
    fn dependencies(&self) -> crate::Dependencies {
        self.repository_uri.dependencies()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ImageOutput {
    /// Fully qualified reference of the pushed tag.
    pub uri: String,
}

impl Resource for Image {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = ImageOutput;

    async fn read(&self, _aws: &AwsContext) -> Result<Option<ImageOutput>, Self::Error> {
        Ok(None)
    }

    async fn create(&self, aws: &AwsContext) -> Result<ImageOutput, Self::Error> {
        let repository = self.repository_uri.get()?;
        let uri = format!("{repository}:{}", self.tag);
        let latest = format!("{repository}:latest");
        let build_arg = format!("SERVICE={}", self.service);
        let dockerfile = self.dockerfile.display().to_string();
        let context = self.build_context.display().to_string();

        log::info!("  building {uri}");
        docker(&[
            "build",
            "--file",
            &dockerfile,
            "--build-arg",
            &build_arg,
            "--tag",
            &uri,
            &context,
        ])
        .await?;
        docker(&["tag", &uri, &latest]).await?;

        let login = registry_login(aws).await?;
        docker_login(&login.username, &login.password, &login.endpoint).await?;

        for reference in [&uri, &latest] {
            log::info!("  pushing {reference}");
            docker(&["push", reference]).await?;
        }
        Ok(ImageOutput { uri })
    }
}

/// Declare the repository, the image and the parameter publishing its URI.
///
/// Returns the URI the image will be pushed as.
pub fn declare(
    store: &mut Store<AwsContext>,
    config: &Config,
    names: &Names,
    service: Service,
    tag: String,
) -> Result<Remote<String>> {
    let repository = store.resource(
        format!("{service}-repository"),
        Repository {
            name: names.repository(service),
        },
    )?;
    let image = store.resource(
        format!("{service}-image"),
        Image {
            service,
            repository_uri: repository.remote(|r| r.uri.clone()),
            tag,
            dockerfile: config.dockerfile.clone(),
            build_context: config.build_context.clone(),
        },
    )?;
    store.resource(
        format!("{service}-image-parameter"),
        Parameter {
            name: names.image_parameter(service),
            value: image.remote(|i| i.uri.clone()),
        },
    )?;
    Ok(image.remote(|i| i.uri.clone()))
}

/// Build and push `service`'s image.
///
/// Returns the pushed image reference, or `None` on a dry run.
pub async fn publish(
    session: &Session,
    service: Service,
    tag: Option<String>,
) -> Result<Option<String>> {
    let tag = resolve_tag(tag).await;
    log::info!("publishing {service} image with tag '{tag}'");
    let mut store = session.store();
    let uri = declare(&mut store, &session.config, &session.names, service, tag)?;
    execute("build", &mut store, session.dry_run).await?;
    if session.dry_run {
        return Ok(None);
    }
    Ok(Some(uri.get()?))
}

#[cfg(test)]
mod test {
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{aws::offline_context, names::Environment};

    #[test]
    fn timestamp_tags_sort_chronologically() {
        let earlier = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 1).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 11, 20, 17, 45, 30).unwrap();
        assert_eq!("20240309070501", timestamp_tag(earlier));
        assert_eq!("20241120174530", timestamp_tag(later));
        assert!(timestamp_tag(earlier) < timestamp_tag(later));
    }

    #[test]
    fn dockerfile_builds_on_a_current_toolchain() {
        let dockerfile = include_str!("../../../../Dockerfile");
        let build_stage = dockerfile
            .lines()
            .find(|line| line.starts_with("FROM ") && line.ends_with(" AS build"))
            .unwrap();
        assert_eq!("FROM rust:1-slim AS build", build_stage);
        assert!(dockerfile.contains("COPY Cargo.toml Cargo.lock* ./"));
        assert!(dockerfile.contains("--locked"));
        assert!(dockerfile.contains("ARG SERVICE"));
    }

    #[tokio::test]
    async fn explicit_tag_wins() {
        assert_eq!("v1.2.3", resolve_tag(Some("v1.2.3".to_owned())).await);
    }

    #[test]
    fn image_is_pushed_after_the_repository_exists() {
        let mut store = Store::new(offline_context());
        let uri = declare(
            &mut store,
            &Config::default(),
            &Names::new("data-pipeline", Environment::Dev),
            Service::Web,
            "abc1234".to_owned(),
        )
        .unwrap();
        let plan = store.plan().unwrap();
        let ids = plan.actions.iter().map(|a| a.id.as_str()).collect::<Vec<_>>();
        assert_eq!(
            vec!["web-repository", "web-image", "web-image-parameter"],
            ids
        );
        assert!(matches!(
            uri.get(),
            Err(crate::Error::RemoteUnresolved { .. })
        ));
    }
}
