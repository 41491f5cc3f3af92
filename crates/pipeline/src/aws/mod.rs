//! Pipeline resources on AWS.
//!
//! Every resource here uses [`AwsContext`] as its provider and
//! `anyhow::Error` as its error type.

use std::sync::Arc;

use anyhow::Context;
use aws_config::{BehaviorVersion, Region, SdkConfig};
pub use aws_sdk_sts::error::ProvideErrorMetadata;

pub mod ec2;
pub mod ecr;
pub mod ecs;
pub mod firehose;
pub mod iam;
pub mod logs;
pub mod s3;
pub mod ssm;

/// Shared AWS configuration for creating service clients.
///
/// Holds the loaded SDK config along with the resolved region and the
/// account id of the caller.
#[derive(Clone)]
pub struct AwsContext {
    config: Arc<SdkConfig>,
    region: String,
    account: String,
}

impl AwsContext {
    /// Load AWS configuration and resolve the caller's identity.
    ///
    /// `region` overrides the region found in the environment and config
    /// files.
    ///
    /// ## Errors
    /// Errs if no region is configured anywhere, or if the credentials can't
    /// be used to call STS.
    pub async fn load(region: Option<&str>) -> anyhow::Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = region {
            loader = loader.region(Region::new(region.to_owned()));
        }
        let config = loader.load().await;

        let identity = aws_sdk_sts::Client::new(&config)
            .get_caller_identity()
            .send()
            .await
            .context("Failed to get AWS caller identity - check credentials")?;
        let account = identity
            .account()
            .context("No account ID returned from STS GetCallerIdentity")?
            .to_owned();

        let aws = Self::new(config, account)?;
        log::info!("using AWS account {} in {}", aws.account, aws.region);
        Ok(aws)
    }

    /// Wrap an already loaded config for the given account.
    ///
    /// ## Errors
    /// Errs if the config has no region.
    pub fn new(config: SdkConfig, account: impl Into<String>) -> anyhow::Result<Self> {
        let region = config
            .region()
            .map(|r| r.to_string())
            .context("No AWS region configured - pass --region or set AWS_REGION")?;
        Ok(Self {
            config: Arc::new(config),
            region,
            account: account.into(),
        })
    }

    /// Get the underlying SDK config for direct client construction.
    pub fn sdk_config(&self) -> &SdkConfig {
        &self.config
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// The 12-digit id of the account the credentials belong to.
    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn s3_client(&self) -> aws_sdk_s3::Client {
        aws_sdk_s3::Client::new(self.sdk_config())
    }

    pub fn iam_client(&self) -> aws_sdk_iam::Client {
        aws_sdk_iam::Client::new(self.sdk_config())
    }

    pub fn firehose_client(&self) -> aws_sdk_firehose::Client {
        aws_sdk_firehose::Client::new(self.sdk_config())
    }

    pub fn ecs_client(&self) -> aws_sdk_ecs::Client {
        aws_sdk_ecs::Client::new(self.sdk_config())
    }

    pub fn ec2_client(&self) -> aws_sdk_ec2::Client {
        aws_sdk_ec2::Client::new(self.sdk_config())
    }

    pub fn logs_client(&self) -> aws_sdk_cloudwatchlogs::Client {
        aws_sdk_cloudwatchlogs::Client::new(self.sdk_config())
    }

    pub fn ssm_client(&self) -> aws_sdk_ssm::Client {
        aws_sdk_ssm::Client::new(self.sdk_config())
    }

    pub fn ecr_client(&self) -> aws_sdk_ecr::Client {
        aws_sdk_ecr::Client::new(self.sdk_config())
    }
}

impl std::fmt::Debug for AwsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwsContext")
            .field("region", &self.region)
            .field("account", &self.account)
            .finish_non_exhaustive()
    }
}

/// Whether an SDK error carries one of the given error codes.
pub(crate) fn has_code(error: &impl ProvideErrorMetadata, codes: &[&str]) -> bool {
    error.code().is_some_and(|code| codes.contains(&code))
}

/// Wrap an SDK error so its code and message show up in the error chain.
///
/// SDK errors only display as "service error", which says nothing about
/// what went wrong.
pub(crate) fn coded<E>(error: E) -> anyhow::Error
where
    E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
{
    let summary = format!(
        "{}: {}",
        error.code().unwrap_or("Unknown"),
        error.message().unwrap_or("no message")
    );
    anyhow::Error::new(error).context(summary)
}

/// Whether any error in the chain mentions `code`.
pub(crate) fn chain_mentions(error: &anyhow::Error, code: &str) -> bool {
    error.chain().any(|cause| cause.to_string().contains(code))
}

/// A context for building plans without credentials or network access.
#[cfg(test)]
pub(crate) fn offline_context() -> AwsContext {
    let config = SdkConfig::builder()
        .behavior_version(BehaviorVersion::latest())
        .region(Region::new("eu-west-1"))
        .build();
    AwsContext::new(config, "123456789012").expect("region is set")
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn context_requires_a_region() {
        let config = SdkConfig::builder()
            .behavior_version(BehaviorVersion::latest())
            .build();
        assert!(AwsContext::new(config, "123456789012").is_err());
        let aws = offline_context();
        assert_eq!("eu-west-1", aws.region());
        assert_eq!("123456789012", aws.account());
    }

    #[test]
    fn chain_mentions_finds_wrapped_codes() {
        let error = anyhow::anyhow!("DependencyViolation: resource sg-1 has a dependent object")
            .context("Failed to delete security group");
        assert!(chain_mentions(&error, "DependencyViolation"));
        assert!(!chain_mentions(&error, "NoSuchEntity"));
    }
}
