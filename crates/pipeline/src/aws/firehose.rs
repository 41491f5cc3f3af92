//! Firehose delivery streams.
use anyhow::Context;
use aws_sdk_firehose::types::{
    BufferingHints, CloudWatchLoggingOptions, CompressionFormat, DeliveryStreamStatus,
    DeliveryStreamType, ExtendedS3DestinationConfiguration,
};

use super::{chain_mentions, coded, has_code, AwsContext};
use crate::{
    names::Service,
    remote::Remote,
    wait::{retry_while, wait_until, WaitConfig},
    Dependencies, HasDependencies, Resource,
};

/// A DirectPut stream delivering one service's records into the bucket
/// under `raw/<service>/`, GZIP compressed.
#[derive(Clone, Debug)]
pub struct DeliveryStream {
    pub name: String,
    pub service: Service,
    pub bucket_arn: Remote<String>,
    pub role_arn: Remote<String>,
    pub log_group: Remote<String>,
    pub buffer_size_mb: i32,
    pub buffer_interval_secs: i32,
    pub wait: WaitConfig,
}

impl HasDependencies for DeliveryStream {
    fn dependencies(&self) -> Dependencies {
        self.bucket_arn
            .dependencies()
            .merge(self.role_arn.dependencies())
            .merge(self.log_group.dependencies())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct DeliveryStreamOutput {
    pub name: String,
    pub arn: String,
}

/// Stream Firehose writes delivery errors to. It must exist in the log group.
pub const DELIVERY_LOG_STREAM: &str = "DestinationDelivery";

/// Key prefix a service's records are delivered under.
pub fn delivery_prefix(service: Service) -> String {
    format!("{}{service}/", super::s3::RAW_PREFIX)
}

/// Key prefix for records Firehose failed to deliver.
pub fn error_prefix(service: Service) -> String {
    format!("errors/{service}/")
}

impl DeliveryStream {
    /// A definition that can only be used to read or destroy a stream.
    pub fn named(name: impl Into<String>, service: Service, wait: WaitConfig) -> Self {
        Self {
            name: name.into(),
            service,
            bucket_arn: Remote::unresolved("bucket"),
            role_arn: Remote::unresolved("firehose-role"),
            log_group: Remote::unresolved("firehose-log-group"),
            buffer_size_mb: 0,
            buffer_interval_secs: 0,
            wait,
        }
    }

    async fn status(
        &self,
        aws: &AwsContext,
    ) -> anyhow::Result<Option<(String, DeliveryStreamStatus)>> {
        match aws
            .firehose_client()
            .describe_delivery_stream()
            .delivery_stream_name(&self.name)
            .send()
            .await
        {
            Ok(out) => {
                let description = out
                    .delivery_stream_description
                    .context("no delivery stream description")?;
                Ok(Some((
                    description.delivery_stream_arn().to_owned(),
                    description.delivery_stream_status().clone(),
                )))
            }
            Err(e) if has_code(&e, &["ResourceNotFoundException"]) => Ok(None),
            Err(e) => Err(coded(e)).context("Failed to describe delivery stream"),
        }
    }

    fn destination(&self) -> anyhow::Result<ExtendedS3DestinationConfiguration> {
        ExtendedS3DestinationConfiguration::builder()
            .role_arn(self.role_arn.get()?)
            .bucket_arn(self.bucket_arn.get()?)
            .prefix(delivery_prefix(self.service))
            .error_output_prefix(error_prefix(self.service))
            .compression_format(CompressionFormat::Gzip)
            .buffering_hints(
                BufferingHints::builder()
                    .size_in_mbs(self.buffer_size_mb)
                    .interval_in_seconds(self.buffer_interval_secs)
                    .build(),
            )
            .cloud_watch_logging_options(
                CloudWatchLoggingOptions::builder()
                    .enabled(true)
                    .log_group_name(self.log_group.get()?)
                    .log_stream_name(DELIVERY_LOG_STREAM)
                    .build(),
            )
            .build()
            .map_err(|e| anyhow::anyhow!("Failed to build S3 destination: {e}"))
    }
}

impl Resource for DeliveryStream {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = DeliveryStreamOutput;

    async fn read(&self, aws: &AwsContext) -> Result<Option<DeliveryStreamOutput>, Self::Error> {
        Ok(self.status(aws).await?.map(|(arn, _)| DeliveryStreamOutput {
            name: self.name.clone(),
            arn,
        }))
    }

    async fn create(&self, aws: &AwsContext) -> Result<DeliveryStreamOutput, Self::Error> {
        let client = aws.firehose_client();
        let destination = self.destination()?;
        // A role created moments ago can't be assumed by Firehose right away.
        retry_while(
            self.wait,
            &self.name,
            || async {
                client
                    .create_delivery_stream()
                    .delivery_stream_name(&self.name)
                    .delivery_stream_type(DeliveryStreamType::DirectPut)
                    .extended_s3_destination_configuration(destination.clone())
                    .send()
                    .await
                    .map_err(coded)
            },
            |e| chain_mentions(e, "InvalidArgumentException") && chain_mentions(e, "assume"),
        )
        .await
        .context("Failed to create delivery stream")?;
        log::info!("  created delivery stream {}", self.name);

        wait_until(self.wait, &self.name, || async {
            Ok(matches!(
                self.status(aws).await?,
                Some((_, DeliveryStreamStatus::Active))
            ))
        })
        .await?;

        self.read(aws)
            .await?
            .context("delivery stream vanished after creation")
    }

    async fn delete(
        &self,
        aws: &AwsContext,
        _previous: &DeliveryStreamOutput,
    ) -> Result<(), Self::Error> {
        aws.firehose_client()
            .delete_delivery_stream()
            .delivery_stream_name(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to delete delivery stream")?;
        wait_until(self.wait, &self.name, || async {
            Ok(self.status(aws).await?.is_none())
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn prefixes() {
        assert_eq!("raw/crm/", delivery_prefix(Service::Crm));
        assert_eq!("errors/web/", error_prefix(Service::Web));
    }
}
