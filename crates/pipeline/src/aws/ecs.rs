//! ECS cluster, task definitions and Fargate services.
use std::collections::HashMap;

use anyhow::Context;
use aws_sdk_ecs::types::{
    AssignPublicIp, AwsVpcConfiguration, Compatibility, ContainerDefinition, HealthCheck,
    KeyValuePair, LaunchType, LogConfiguration, LogDriver, NetworkConfiguration, NetworkMode,
    PortMapping, TransportProtocol,
};

use super::{chain_mentions, coded, has_code, AwsContext};
use crate::{
    remote::Remote,
    template::{ContainerDocument, TaskDefinitionDocument},
    wait::{retry_while, wait_until, WaitConfig},
    Dependencies, HasDependencies, Resource,
};

const ACTIVE: &str = "ACTIVE";
const INACTIVE: &str = "INACTIVE";

/// Whether a service with this status is fully deleted. `DRAINING` services
/// still count against their cluster.
fn service_is_gone(status: Option<&str>) -> bool {
    matches!(status, None | Some(INACTIVE))
}

#[derive(Clone, Debug, PartialEq)]
pub struct Cluster {
    pub name: String,
    pub wait: WaitConfig,
}

impl HasDependencies for Cluster {}

#[derive(Clone, Debug, PartialEq)]
pub struct ClusterOutput {
    pub name: String,
    pub arn: String,
}

impl Resource for Cluster {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = ClusterOutput;

    /// Clusters that were deleted linger as `INACTIVE` and count as absent.
    async fn read(&self, aws: &AwsContext) -> Result<Option<ClusterOutput>, Self::Error> {
        let out = aws
            .ecs_client()
            .describe_clusters()
            .clusters(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to describe clusters")?;
        Ok(out
            .clusters()
            .iter()
            .find(|cluster| cluster.status() == Some(ACTIVE))
            .and_then(|cluster| cluster.cluster_arn())
            .map(|arn| ClusterOutput {
                name: self.name.clone(),
                arn: arn.to_owned(),
            }))
    }

    async fn create(&self, aws: &AwsContext) -> Result<ClusterOutput, Self::Error> {
        aws.ecs_client()
            .create_cluster()
            .cluster_name(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to create cluster")?;
        log::info!("  created cluster {}, waiting until active", self.name);
        wait_until(self.wait, &self.name, || async {
            Ok(self.read(aws).await?.is_some())
        })
        .await?;
        self.read(aws)
            .await?
            .context("cluster vanished after creation")
    }

    async fn delete(&self, aws: &AwsContext, _previous: &ClusterOutput) -> Result<(), Self::Error> {
        let client = aws.ecs_client();
        retry_while(
            self.wait,
            &self.name,
            || async {
                client
                    .delete_cluster()
                    .cluster(&self.name)
                    .send()
                    .await
                    .map_err(coded)
            },
            |e| chain_mentions(e, "ClusterContainsServicesException"),
        )
        .await
        .context("Failed to delete cluster")?;
        wait_until(self.wait, &self.name, || async {
            Ok(self.read(aws).await?.is_none())
        })
        .await
    }
}

/// A task definition revision.
///
/// Reading always reports the revision as absent, so every ensure
/// registers a new revision.
#[derive(Clone, Debug, PartialEq)]
pub struct TaskDefinition {
    pub document: TaskDefinitionDocument,
}

impl HasDependencies for TaskDefinition {}

#[derive(Clone, Debug, PartialEq)]
pub struct TaskDefinitionOutput {
    pub family: String,
    pub revision: i32,
    pub arn: String,
}

fn container_definition(container: &ContainerDocument) -> anyhow::Result<ContainerDefinition> {
    let mut builder = ContainerDefinition::builder()
        .name(&container.name)
        .image(&container.image)
        .essential(container.essential);
    for mapping in container.port_mappings.iter() {
        builder = builder.port_mappings(
            PortMapping::builder()
                .container_port(mapping.container_port)
                .protocol(TransportProtocol::from(mapping.protocol.as_str()))
                .build(),
        );
    }
    for kv in container.environment.iter() {
        builder = builder.environment(
            KeyValuePair::builder()
                .name(&kv.name)
                .value(&kv.value)
                .build(),
        );
    }
    if let Some(logs) = container.log_configuration.as_ref() {
        builder = builder.log_configuration(
            LogConfiguration::builder()
                .log_driver(LogDriver::from(logs.log_driver.as_str()))
                .set_options(Some(
                    logs.options
                        .iter()
                        .map(|(k, v)| (k.clone(), v.clone()))
                        .collect::<HashMap<_, _>>(),
                ))
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build log configuration: {e}"))?,
        );
    }
    if let Some(health) = container.health_check.as_ref() {
        builder = builder.health_check(
            HealthCheck::builder()
                .set_command(Some(health.command.clone()))
                .set_interval(health.interval)
                .set_timeout(health.timeout)
                .set_retries(health.retries)
                .set_start_period(health.start_period)
                .build()
                .map_err(|e| anyhow::anyhow!("Failed to build health check: {e}"))?,
        );
    }
    Ok(builder.build())
}

impl Resource for TaskDefinition {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = TaskDefinitionOutput;

    async fn read(&self, _aws: &AwsContext) -> Result<Option<TaskDefinitionOutput>, Self::Error> {
        Ok(None)
    }

    async fn create(&self, aws: &AwsContext) -> Result<TaskDefinitionOutput, Self::Error> {
        let doc = &self.document;
        let mut request = aws
            .ecs_client()
            .register_task_definition()
            .family(&doc.family)
            .network_mode(NetworkMode::from(doc.network_mode.as_str()))
            .cpu(&doc.cpu)
            .memory(&doc.memory)
            .execution_role_arn(&doc.execution_role_arn)
            .task_role_arn(&doc.task_role_arn);
        for compatibility in doc.requires_compatibilities.iter() {
            request = request.requires_compatibilities(Compatibility::from(compatibility.as_str()));
        }
        for container in doc.container_definitions.iter() {
            request = request.container_definitions(container_definition(container)?);
        }
        let registered = request
            .send()
            .await
            .map_err(coded)
            .context("Failed to register task definition")?
            .task_definition
            .context("no task definition")?;
        let output = TaskDefinitionOutput {
            family: doc.family.clone(),
            revision: registered.revision(),
            arn: registered
                .task_definition_arn()
                .context("task definition without an ARN")?
                .to_owned(),
        };
        log::info!("  registered {}:{}", output.family, output.revision);
        Ok(output)
    }
}

/// A Fargate service running one producer.
///
/// Existing services are updated to the given task definition with a forced
/// redeployment.
#[derive(Clone, Debug)]
pub struct Service {
    pub name: String,
    pub cluster: String,
    pub task_definition_arn: Remote<String>,
    pub subnets: Remote<Vec<String>>,
    pub security_group_id: String,
    pub desired_count: i32,
    pub wait: WaitConfig,
}

impl HasDependencies for Service {
    fn dependencies(&self) -> Dependencies {
        self.task_definition_arn
            .dependencies()
            .merge(self.subnets.dependencies())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct ServiceOutput {
    pub name: String,
    pub arn: String,
    pub task_definition: String,
    pub desired_count: i32,
    pub running_count: i32,
    pub deployments: usize,
}

impl ServiceOutput {
    /// A single deployment with every desired task running.
    pub fn is_stable(&self) -> bool {
        self.deployments == 1 && self.running_count == self.desired_count
    }
}

impl Service {
    /// A definition that can only be used to read or destroy a service.
    pub fn named(name: impl Into<String>, cluster: impl Into<String>, wait: WaitConfig) -> Self {
        let name = name.into();
        Self {
            task_definition_arn: Remote::unresolved(format!("{name}-task-definition")),
            subnets: Remote::unresolved("default-subnets"),
            name,
            cluster: cluster.into(),
            security_group_id: String::new(),
            desired_count: 0,
            wait,
        }
    }

    /// The raw status of the service, `None` when ECS doesn't know it.
    async fn status(&self, aws: &AwsContext) -> anyhow::Result<Option<String>> {
        let out = match aws
            .ecs_client()
            .describe_services()
            .cluster(&self.cluster)
            .services(&self.name)
            .send()
            .await
        {
            Ok(out) => out,
            Err(e) if has_code(&e, &["ClusterNotFoundException"]) => return Ok(None),
            Err(e) => return Err(coded(e)).context("Failed to describe services"),
        };
        Ok(out
            .services()
            .iter()
            .find(|service| service.service_name() == Some(self.name.as_str()))
            .and_then(|service| service.status())
            .map(str::to_owned))
    }

    async fn wait_stable(&self, aws: &AwsContext) -> anyhow::Result<ServiceOutput> {
        log::info!("  waiting for {} to become stable", self.name);
        wait_until(self.wait, &self.name, || async {
            Ok(self
                .read(aws)
                .await?
                .is_some_and(|service| service.is_stable()))
        })
        .await?;
        self.read(aws).await?.context("service vanished")
    }
}

impl Resource for Service {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = ServiceOutput;

    const UPDATE_EXISTING: bool = true;

    /// Services that were deleted linger as `DRAINING` or `INACTIVE` and count
    /// as absent.
    async fn read(&self, aws: &AwsContext) -> Result<Option<ServiceOutput>, Self::Error> {
        let out = match aws
            .ecs_client()
            .describe_services()
            .cluster(&self.cluster)
            .services(&self.name)
            .send()
            .await
        {
            Ok(out) => out,
            Err(e) if has_code(&e, &["ClusterNotFoundException"]) => return Ok(None),
            Err(e) => return Err(coded(e)).context("Failed to describe services"),
        };
        Ok(out
            .services()
            .iter()
            .find(|service| service.status() == Some(ACTIVE))
            .map(|service| ServiceOutput {
                name: self.name.clone(),
                arn: service.service_arn().unwrap_or_default().to_owned(),
                task_definition: service.task_definition().unwrap_or_default().to_owned(),
                desired_count: service.desired_count(),
                running_count: service.running_count(),
                deployments: service.deployments().len(),
            }))
    }

    async fn create(&self, aws: &AwsContext) -> Result<ServiceOutput, Self::Error> {
        let task_definition = self.task_definition_arn.get()?;
        let network = NetworkConfiguration::builder()
            .awsvpc_configuration(
                AwsVpcConfiguration::builder()
                    .set_subnets(Some(self.subnets.get()?))
                    .security_groups(&self.security_group_id)
                    .assign_public_ip(AssignPublicIp::Enabled)
                    .build()
                    .map_err(|e| anyhow::anyhow!("Failed to build VPC configuration: {e}"))?,
            )
            .build();
        aws.ecs_client()
            .create_service()
            .cluster(&self.cluster)
            .service_name(&self.name)
            .task_definition(&task_definition)
            .desired_count(self.desired_count)
            .launch_type(LaunchType::Fargate)
            .network_configuration(network)
            .send()
            .await
            .map_err(coded)
            .context("Failed to create service")?;
        log::info!("  created service {} running {task_definition}", self.name);
        self.wait_stable(aws).await
    }

    async fn update(
        &self,
        aws: &AwsContext,
        previous: &ServiceOutput,
    ) -> Result<ServiceOutput, Self::Error> {
        let task_definition = self.task_definition_arn.get()?;
        aws.ecs_client()
            .update_service()
            .cluster(&self.cluster)
            .service(&self.name)
            .task_definition(&task_definition)
            .force_new_deployment(true)
            .send()
            .await
            .map_err(coded)
            .context("Failed to update service")?;
        log::info!(
            "  updated service {} from {} to {task_definition}",
            self.name,
            previous.task_definition
        );
        self.wait_stable(aws).await
    }

    async fn delete(&self, aws: &AwsContext, _previous: &ServiceOutput) -> Result<(), Self::Error> {
        let client = aws.ecs_client();
        client
            .update_service()
            .cluster(&self.cluster)
            .service(&self.name)
            .desired_count(0)
            .send()
            .await
            .map_err(coded)
            .context("Failed to scale service down")?;
        self.wait_stable(aws).await?;

        client
            .delete_service()
            .cluster(&self.cluster)
            .service(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to delete service")?;
        log::info!("  waiting for {} to become inactive", self.name);
        wait_until(self.wait, &self.name, || async {
            Ok(service_is_gone(self.status(aws).await?.as_deref()))
        })
        .await
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn output(desired_count: i32, running_count: i32, deployments: usize) -> ServiceOutput {
        ServiceOutput {
            name: "crm-service-dev".to_owned(),
            arn: "arn".to_owned(),
            task_definition: "td".to_owned(),
            desired_count,
            running_count,
            deployments,
        }
    }

    #[test]
    fn stability() {
        assert!(output(1, 1, 1).is_stable());
        assert!(output(0, 0, 1).is_stable());
        assert!(!output(1, 0, 1).is_stable());
        assert!(!output(1, 1, 2).is_stable());
    }

    #[test]
    fn draining_services_are_not_gone() {
        assert!(!service_is_gone(Some("ACTIVE")));
        assert!(!service_is_gone(Some("DRAINING")));
        assert!(service_is_gone(Some("INACTIVE")));
        assert!(service_is_gone(None));
    }

    #[test]
    fn container_definitions_carry_the_template() {
        let doc: TaskDefinitionDocument = crate::template::render(
            "web.json",
            include_str!("../../../../task-definitions/web.json"),
            &crate::template::TemplateVars {
                account: "123456789012".to_owned(),
                environment: "staging".to_owned(),
                image_uri: "repo:tag".to_owned(),
                region: "eu-west-1".to_owned(),
                project: "data-pipeline".to_owned(),
                container_port: 8080,
            },
        )
        .unwrap();
        let container = container_definition(&doc.container_definitions[0]).unwrap();
        assert_eq!(Some("repo:tag"), container.image());
        assert_eq!(Some(8080), container.port_mappings()[0].container_port());
        assert_eq!(7, container.environment().len());
        let logs = container.log_configuration().unwrap();
        assert_eq!(&LogDriver::Awslogs, logs.log_driver());
        assert_eq!(
            Some(&"/ecs/data-pipeline/staging/web".to_owned()),
            logs.options().and_then(|options| options.get("awslogs-group"))
        );
        assert_eq!(Some(60), container.health_check().unwrap().start_period());
    }
}
