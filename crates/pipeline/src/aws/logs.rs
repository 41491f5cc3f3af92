//! CloudWatch log groups.
use anyhow::Context;

use super::{coded, AwsContext};
use crate::{HasDependencies, Resource};

/// A log group with retention, and the streams writers expect to exist.
#[derive(Clone, Debug, PartialEq)]
pub struct LogGroup {
    pub name: String,
    pub retention_days: i32,
    pub streams: Vec<String>,
}

impl HasDependencies for LogGroup {}

#[derive(Clone, Debug, PartialEq)]
pub struct LogGroupOutput {
    pub name: String,
    pub retention_days: Option<i32>,
}

impl LogGroup {
    /// A definition that can only be used to read or destroy a log group.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            retention_days: 0,
            streams: vec![],
        }
    }
}

impl Resource for LogGroup {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = LogGroupOutput;

    async fn read(&self, aws: &AwsContext) -> Result<Option<LogGroupOutput>, Self::Error> {
        let out = aws
            .logs_client()
            .describe_log_groups()
            .log_group_name_prefix(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to describe log groups")?;
        Ok(out
            .log_groups()
            .iter()
            .find(|group| group.log_group_name() == Some(self.name.as_str()))
            .map(|group| LogGroupOutput {
                name: self.name.clone(),
                retention_days: group.retention_in_days(),
            }))
    }

    async fn create(&self, aws: &AwsContext) -> Result<LogGroupOutput, Self::Error> {
        let client = aws.logs_client();
        client
            .create_log_group()
            .log_group_name(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to create log group")?;
        client
            .put_retention_policy()
            .log_group_name(&self.name)
            .retention_in_days(self.retention_days)
            .send()
            .await
            .map_err(coded)
            .context("Failed to set log retention")?;
        for stream in &self.streams {
            client
                .create_log_stream()
                .log_group_name(&self.name)
                .log_stream_name(stream)
                .send()
                .await
                .map_err(coded)
                .with_context(|| format!("Failed to create log stream {stream}"))?;
        }
        log::info!(
            "  created log group {} with {} day retention",
            self.name,
            self.retention_days
        );
        Ok(LogGroupOutput {
            name: self.name.clone(),
            retention_days: Some(self.retention_days),
        })
    }

    async fn delete(&self, aws: &AwsContext, _previous: &LogGroupOutput) -> Result<(), Self::Error> {
        aws.logs_client()
            .delete_log_group()
            .log_group_name(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to delete log group")?;
        Ok(())
    }
}
