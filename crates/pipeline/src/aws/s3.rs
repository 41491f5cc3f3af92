//! S3 storage for delivered records.
use anyhow::Context;
use aws_sdk_s3::types::{
    BucketLifecycleConfiguration, BucketLocationConstraint, CreateBucketConfiguration,
    ExpirationStatus, LifecycleExpiration, LifecycleRule, PublicAccessBlockConfiguration,
    Transition, TransitionStorageClass,
};

use super::{coded, AwsContext};
use crate::{HasDependencies, Resource};

/// Every delivery stream writes below this prefix.
pub const RAW_PREFIX: &str = "raw/";

/// The pipeline's data bucket.
///
/// Created private, with one lifecycle rule that archives and then expires
/// everything under [`RAW_PREFIX`].
#[derive(Clone, Debug, PartialEq)]
pub struct Bucket {
    pub name: String,
    pub archive_after_days: i32,
    pub expire_after_days: i32,
}

impl HasDependencies for Bucket {}

#[derive(Clone, Debug, PartialEq)]
pub struct BucketOutput {
    pub name: String,
    pub arn: String,
}

impl Bucket {
    /// A definition that can only be used to read or destroy a bucket.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            archive_after_days: 0,
            expire_after_days: 0,
        }
    }

    fn output(&self) -> BucketOutput {
        BucketOutput {
            name: self.name.clone(),
            arn: format!("arn:aws:s3:::{}", self.name),
        }
    }

    #[allow(deprecated)]
    fn lifecycle_rule(&self) -> anyhow::Result<LifecycleRule> {
        LifecycleRule::builder()
            .id("archive-then-expire-raw")
            .prefix(RAW_PREFIX)
            .status(ExpirationStatus::Enabled)
            .transitions(
                Transition::builder()
                    .days(self.archive_after_days)
                    .storage_class(TransitionStorageClass::Glacier)
                    .build(),
            )
            .expiration(
                LifecycleExpiration::builder()
                    .days(self.expire_after_days)
                    .build(),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build lifecycle rule: {e}"))
    }

    /// Delete every object in the bucket.
    pub async fn empty(&self, aws: &AwsContext) -> anyhow::Result<usize> {
        let client = aws.s3_client();
        let mut deleted = 0;
        let mut continuation_token = None;
        loop {
            let mut request = client.list_objects_v2().bucket(&self.name);
            if let Some(token) = &continuation_token {
                request = request.continuation_token(token);
            }
            let response = request
                .send()
                .await
                .map_err(coded)
                .context("Failed to list objects")?;

            for object in response.contents() {
                if let Some(key) = object.key() {
                    log::debug!("  deleting s3://{}/{key}", self.name);
                    client
                        .delete_object()
                        .bucket(&self.name)
                        .key(key)
                        .send()
                        .await
                        .map_err(coded)
                        .with_context(|| format!("Failed to delete object '{key}'"))?;
                    deleted += 1;
                }
            }

            if response.is_truncated() == Some(true) {
                continuation_token = response.next_continuation_token().map(|s| s.to_owned());
            } else {
                break;
            }
        }
        Ok(deleted)
    }
}

impl Resource for Bucket {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = BucketOutput;

    async fn read(&self, aws: &AwsContext) -> Result<Option<BucketOutput>, Self::Error> {
        match aws.s3_client().head_bucket().bucket(&self.name).send().await {
            Ok(_) => Ok(Some(self.output())),
            Err(e) if e.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(e) => Err(coded(e)).context("Failed to look up bucket"),
        }
    }

    async fn create(&self, aws: &AwsContext) -> Result<BucketOutput, Self::Error> {
        let client = aws.s3_client();
        let mut request = client.create_bucket().bucket(&self.name);
        // us-east-1 is the default location and rejects an explicit constraint
        if aws.region() != "us-east-1" {
            request = request.create_bucket_configuration(
                CreateBucketConfiguration::builder()
                    .location_constraint(BucketLocationConstraint::from(aws.region()))
                    .build(),
            );
        }
        request
            .send()
            .await
            .map_err(coded)
            .context("Failed to create bucket")?;
        log::info!("  created bucket {}", self.name);

        client
            .put_public_access_block()
            .bucket(&self.name)
            .public_access_block_configuration(
                PublicAccessBlockConfiguration::builder()
                    .block_public_acls(true)
                    .ignore_public_acls(true)
                    .block_public_policy(true)
                    .restrict_public_buckets(true)
                    .build(),
            )
            .send()
            .await
            .map_err(coded)
            .context("Failed to block public access")?;

        client
            .put_bucket_lifecycle_configuration()
            .bucket(&self.name)
            .lifecycle_configuration(
                BucketLifecycleConfiguration::builder()
                    .rules(self.lifecycle_rule()?)
                    .build()
                    .map_err(|e| anyhow::anyhow!("Failed to build lifecycle configuration: {e}"))?,
            )
            .send()
            .await
            .map_err(coded)
            .context("Failed to set lifecycle configuration")?;
        log::info!(
            "  {RAW_PREFIX} archived after {} days, expired after {} days",
            self.archive_after_days,
            self.expire_after_days
        );

        Ok(self.output())
    }

    async fn delete(&self, aws: &AwsContext, _previous: &BucketOutput) -> Result<(), Self::Error> {
        let deleted = self.empty(aws).await?;
        log::info!("  deleted {deleted} object(s) from {}", self.name);
        aws.s3_client()
            .delete_bucket()
            .bucket(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to delete bucket")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lifecycle_rule_targets_raw_prefix() {
        let bucket = Bucket {
            name: "data-pipeline-dev-123456789012".to_owned(),
            archive_after_days: 90,
            expire_after_days: 365,
        };
        let rule = bucket.lifecycle_rule().unwrap();
        #[allow(deprecated)]
        let prefix = rule.prefix();
        assert_eq!(Some("raw/"), prefix);
        assert_eq!(&ExpirationStatus::Enabled, rule.status());
        assert_eq!(Some(90), rule.transitions()[0].days());
        assert_eq!(
            Some(365),
            rule.expiration().and_then(|expiration| expiration.days())
        );
        assert_eq!(
            "arn:aws:s3:::data-pipeline-dev-123456789012",
            bucket.output().arn
        );
    }
}
