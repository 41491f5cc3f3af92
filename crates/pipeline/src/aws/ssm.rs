//! Parameter store entries publishing resource identifiers.
use anyhow::Context;
use aws_sdk_ssm::types::ParameterType;

use super::{coded, has_code, AwsContext};
use crate::{remote::Remote, HasDependencies, Resource};

/// A string parameter holding the identifier of another resource.
///
/// The value is written on every ensure; the last writer wins.
#[derive(Clone, Debug)]
pub struct Parameter {
    pub name: String,
    pub value: Remote<String>,
}

impl HasDependencies for Parameter {
    fn dependencies(&self) -> crate::Dependencies {
        self.value.dependencies()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ParameterOutput {
    pub name: String,
    pub value: String,
}

impl Parameter {
    /// A definition that can only be used to read or destroy a parameter.
    pub fn named(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            value: Remote::unresolved(name.clone()),
            name,
        }
    }

    async fn put(&self, aws: &AwsContext) -> anyhow::Result<ParameterOutput> {
        let value = self.value.get()?;
        aws.ssm_client()
            .put_parameter()
            .name(&self.name)
            .value(&value)
            .r#type(ParameterType::String)
            .overwrite(true)
            .send()
            .await
            .map_err(coded)
            .with_context(|| format!("Failed to put parameter '{}'", self.name))?;
        log::info!("  {} = {value}", self.name);
        Ok(ParameterOutput {
            name: self.name.clone(),
            value,
        })
    }
}

/// Read a parameter's value, `None` when it does not exist.
pub async fn get_parameter_value(aws: &AwsContext, name: &str) -> anyhow::Result<Option<String>> {
    match aws.ssm_client().get_parameter().name(name).send().await {
        Ok(out) => Ok(out.parameter.and_then(|p| p.value)),
        Err(e) if has_code(&e, &["ParameterNotFound"]) => Ok(None),
        Err(e) => Err(coded(e)).with_context(|| format!("Failed to get parameter '{name}'")),
    }
}

/// Read a parameter that a previous `infra` run must have written.
pub async fn require_parameter_value(aws: &AwsContext, name: &str) -> anyhow::Result<String> {
    get_parameter_value(aws, name).await?.with_context(|| {
        format!("Parameter '{name}' does not exist - run `pipeline infra` for this environment first")
    })
}

impl Resource for Parameter {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = ParameterOutput;

    const UPDATE_EXISTING: bool = true;

    async fn read(&self, aws: &AwsContext) -> Result<Option<ParameterOutput>, Self::Error> {
        Ok(get_parameter_value(aws, &self.name)
            .await?
            .map(|value| ParameterOutput {
                name: self.name.clone(),
                value,
            }))
    }

    async fn create(&self, aws: &AwsContext) -> Result<ParameterOutput, Self::Error> {
        self.put(aws).await
    }

    async fn update(
        &self,
        aws: &AwsContext,
        _previous: &ParameterOutput,
    ) -> Result<ParameterOutput, Self::Error> {
        self.put(aws).await
    }

    async fn delete(
        &self,
        aws: &AwsContext,
        _previous: &ParameterOutput,
    ) -> Result<(), Self::Error> {
        aws.ssm_client()
            .delete_parameter()
            .name(&self.name)
            .send()
            .await
            .map_err(coded)
            .with_context(|| format!("Failed to delete parameter '{}'", self.name))?;
        Ok(())
    }
}
