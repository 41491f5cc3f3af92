//! Networking the producer tasks run in.
//!
//! Tasks run in the account's default VPC. The VPC and its subnets are only
//! ever looked up; the security group is managed.
use anyhow::Context;
use aws_sdk_ec2::types::{Filter, IpPermission, IpRange};

use super::{chain_mentions, coded, AwsContext};
use crate::{
    remote::Remote,
    wait::{retry_while, WaitConfig},
    Dependencies, HasDependencies, Resource,
};

/// The default VPC of the region.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DefaultVpc;

impl HasDependencies for DefaultVpc {}

#[derive(Clone, Debug, PartialEq)]
pub struct VpcOutput {
    pub vpc_id: String,
    pub cidr: String,
}

impl Resource for DefaultVpc {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = VpcOutput;

    async fn read(&self, aws: &AwsContext) -> Result<Option<VpcOutput>, Self::Error> {
        let vpcs = aws
            .ec2_client()
            .describe_vpcs()
            .filters(Filter::builder().name("isDefault").values("true").build())
            .send()
            .await
            .map_err(coded)
            .context("Failed to describe VPCs")?;
        let vpc = vpcs.vpcs().first().with_context(|| {
            format!(
                "No default VPC found in {} - create one with `aws ec2 create-default-vpc`",
                aws.region()
            )
        })?;
        Ok(Some(VpcOutput {
            vpc_id: vpc.vpc_id().context("VPC without an id")?.to_owned(),
            cidr: vpc.cidr_block().context("VPC without a CIDR block")?.to_owned(),
        }))
    }
}

/// The first two default subnets of a VPC, ordered by availability zone.
#[derive(Clone, Debug)]
pub struct DefaultSubnets {
    pub vpc_id: Remote<String>,
}

impl HasDependencies for DefaultSubnets {
    fn dependencies(&self) -> Dependencies {
        self.vpc_id.dependencies()
    }
}

impl Resource for DefaultSubnets {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = Vec<String>;

    async fn read(&self, aws: &AwsContext) -> Result<Option<Vec<String>>, Self::Error> {
        let vpc_id = self.vpc_id.get()?;
        let out = aws
            .ec2_client()
            .describe_subnets()
            .filters(Filter::builder().name("vpc-id").values(&vpc_id).build())
            .filters(
                Filter::builder()
                    .name("default-for-az")
                    .values("true")
                    .build(),
            )
            .send()
            .await
            .map_err(coded)
            .context("Failed to describe subnets")?;
        let mut subnets = out
            .subnets()
            .iter()
            .filter_map(|subnet| {
                Some((
                    subnet.availability_zone()?.to_owned(),
                    subnet.subnet_id()?.to_owned(),
                ))
            })
            .collect::<Vec<_>>();
        subnets.sort();
        let subnets = subnets
            .into_iter()
            .map(|(_, id)| id)
            .take(2)
            .collect::<Vec<_>>();
        anyhow::ensure!(!subnets.is_empty(), "VPC {vpc_id} has no default subnets");
        Ok(Some(subnets))
    }
}

/// Allows the container port in from inside the VPC.
#[derive(Clone, Debug)]
pub struct SecurityGroup {
    pub name: String,
    pub description: String,
    pub vpc_id: Remote<String>,
    pub ingress_cidr: Remote<String>,
    pub port: i32,
    pub wait: WaitConfig,
}

impl HasDependencies for SecurityGroup {
    fn dependencies(&self) -> Dependencies {
        self.vpc_id
            .dependencies()
            .merge(self.ingress_cidr.dependencies())
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct SecurityGroupOutput {
    pub group_id: String,
}

impl SecurityGroup {
    /// A definition that can only be used to read or destroy a group.
    pub fn named(name: impl Into<String>, wait: WaitConfig) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            vpc_id: Remote::unresolved("default-vpc"),
            ingress_cidr: Remote::unresolved("default-vpc"),
            port: 0,
            wait,
        }
    }
}

impl Resource for SecurityGroup {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = SecurityGroupOutput;

    async fn read(&self, aws: &AwsContext) -> Result<Option<SecurityGroupOutput>, Self::Error> {
        let mut request = aws
            .ec2_client()
            .describe_security_groups()
            .filters(Filter::builder().name("group-name").values(&self.name).build());
        // Without a resolved VPC (teardown) the name alone identifies the group.
        if let Ok(vpc_id) = self.vpc_id.get() {
            request = request.filters(Filter::builder().name("vpc-id").values(vpc_id).build());
        }
        let out = request
            .send()
            .await
            .map_err(coded)
            .context("Failed to describe security groups")?;
        Ok(out
            .security_groups()
            .first()
            .and_then(|group| group.group_id())
            .map(|group_id| SecurityGroupOutput {
                group_id: group_id.to_owned(),
            }))
    }

    async fn create(&self, aws: &AwsContext) -> Result<SecurityGroupOutput, Self::Error> {
        let client = aws.ec2_client();
        let group_id = client
            .create_security_group()
            .group_name(&self.name)
            .description(&self.description)
            .vpc_id(self.vpc_id.get()?)
            .send()
            .await
            .map_err(coded)
            .context("Failed to create security group")?
            .group_id()
            .context("No security group ID in response")?
            .to_owned();
        log::info!("  created security group {group_id}");

        let cidr = self.ingress_cidr.get()?;
        client
            .authorize_security_group_ingress()
            .group_id(&group_id)
            .ip_permissions(
                IpPermission::builder()
                    .ip_protocol("tcp")
                    .from_port(self.port)
                    .to_port(self.port)
                    .ip_ranges(
                        IpRange::builder()
                            .cidr_ip(&cidr)
                            .description("producer health checks")
                            .build(),
                    )
                    .build(),
            )
            .send()
            .await
            .map_err(coded)
            .context("Failed to add ingress rule to security group")?;
        log::info!("  allowed tcp/{} from {cidr}", self.port);

        Ok(SecurityGroupOutput { group_id })
    }

    async fn delete(
        &self,
        aws: &AwsContext,
        previous: &SecurityGroupOutput,
    ) -> Result<(), Self::Error> {
        let client = aws.ec2_client();
        // Network interfaces of stopped tasks take a while to detach.
        retry_while(
            self.wait,
            &self.name,
            || async {
                client
                    .delete_security_group()
                    .group_id(&previous.group_id)
                    .send()
                    .await
                    .map_err(coded)
            },
            |e| chain_mentions(e, "DependencyViolation"),
        )
        .await
        .context("Failed to delete security group")?;
        Ok(())
    }
}
