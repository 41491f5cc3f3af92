//! IAM roles for Firehose delivery and ECS tasks.
use anyhow::Context;

use super::{coded, has_code, AwsContext};
use crate::{remote::Remote, Dependencies, HasDependencies, Resource};

pub const FIREHOSE_PRINCIPAL: &str = "firehose.amazonaws.com";
pub const ECS_TASKS_PRINCIPAL: &str = "ecs-tasks.amazonaws.com";

pub const ECS_TASK_EXECUTION_POLICY: &str =
    "arn:aws:iam::aws:policy/service-role/AmazonECSTaskExecutionRolePolicy";

/// The trust policy allowing `service` to assume a role.
pub fn trust_policy(service: &str) -> serde_json::Value {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Principal": { "Service": service },
                "Action": "sts:AssumeRole"
            }
        ]
    })
}

/// Lets Firehose write into the bucket and report delivery errors.
pub fn firehose_delivery_policy(bucket_arn: &str) -> serde_json::Value {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": [
                    "s3:AbortMultipartUpload",
                    "s3:GetBucketLocation",
                    "s3:GetObject",
                    "s3:ListBucket",
                    "s3:ListBucketMultipartUploads",
                    "s3:PutObject"
                ],
                "Resource": [bucket_arn, format!("{bucket_arn}/*")]
            },
            {
                "Effect": "Allow",
                "Action": ["logs:PutLogEvents"],
                "Resource": "*"
            }
        ]
    })
}

/// Lets producer tasks put records into their delivery streams.
pub fn producer_task_policy(stream_arns: &[String]) -> serde_json::Value {
    serde_json::json!({
        "Version": "2012-10-17",
        "Statement": [
            {
                "Effect": "Allow",
                "Action": ["firehose:PutRecord", "firehose:PutRecordBatch"],
                "Resource": stream_arns
            }
        ]
    })
}

/// A policy embedded in a role.
#[derive(Clone, Debug)]
pub struct InlinePolicy {
    pub name: String,
    pub document: Remote<serde_json::Value>,
}

impl HasDependencies for InlinePolicy {
    fn dependencies(&self) -> Dependencies {
        self.document.dependencies()
    }
}

/// An IAM role assumable by one service principal.
#[derive(Clone, Debug)]
pub struct Role {
    pub name: String,
    pub service_principal: String,
    pub managed_policy_arns: Vec<String>,
    pub inline_policies: Vec<InlinePolicy>,
}

impl HasDependencies for Role {
    fn dependencies(&self) -> Dependencies {
        self.inline_policies.dependencies()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct RoleOutput {
    pub name: String,
    pub arn: String,
}

impl Role {
    /// A definition that can only be used to read or destroy a role.
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            service_principal: String::new(),
            managed_policy_arns: vec![],
            inline_policies: vec![],
        }
    }

    async fn detach_all(&self, client: &aws_sdk_iam::Client) -> anyhow::Result<()> {
        let attached = client
            .list_attached_role_policies()
            .role_name(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to list attached policies")?;
        for policy in attached.attached_policies() {
            if let Some(arn) = policy.policy_arn() {
                log::info!("  detaching {arn}");
                client
                    .detach_role_policy()
                    .role_name(&self.name)
                    .policy_arn(arn)
                    .send()
                    .await
                    .map_err(coded)
                    .with_context(|| format!("Failed to detach policy '{arn}'"))?;
            }
        }

        let inline = client
            .list_role_policies()
            .role_name(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to list inline policies")?;
        for policy_name in inline.policy_names() {
            log::info!("  deleting inline policy {policy_name}");
            client
                .delete_role_policy()
                .role_name(&self.name)
                .policy_name(policy_name)
                .send()
                .await
                .map_err(coded)
                .with_context(|| format!("Failed to delete inline policy '{policy_name}'"))?;
        }
        Ok(())
    }
}

impl Resource for Role {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = RoleOutput;

    async fn read(&self, aws: &AwsContext) -> Result<Option<RoleOutput>, Self::Error> {
        match aws.iam_client().get_role().role_name(&self.name).send().await {
            Ok(out) => {
                let role = out.role.context("no role")?;
                Ok(Some(RoleOutput {
                    name: self.name.clone(),
                    arn: role.arn,
                }))
            }
            Err(e) if has_code(&e, &["NoSuchEntity"]) => Ok(None),
            Err(e) => Err(coded(e)).context("Failed to look up role"),
        }
    }

    async fn create(&self, aws: &AwsContext) -> Result<RoleOutput, Self::Error> {
        let client = aws.iam_client();
        let role = client
            .create_role()
            .role_name(&self.name)
            .assume_role_policy_document(trust_policy(&self.service_principal).to_string())
            .send()
            .await
            .map_err(coded)
            .context("Failed to create IAM role")?
            .role
            .context("no role")?;
        log::info!("  created role {}", self.name);

        for arn in self.managed_policy_arns.iter() {
            client
                .attach_role_policy()
                .role_name(&self.name)
                .policy_arn(arn)
                .send()
                .await
                .map_err(coded)
                .with_context(|| format!("Failed to attach policy '{arn}'"))?;
            log::info!("  attached {arn}");
        }

        for policy in self.inline_policies.iter() {
            let document = policy.document.get()?;
            client
                .put_role_policy()
                .role_name(&self.name)
                .policy_name(&policy.name)
                .policy_document(document.to_string())
                .send()
                .await
                .map_err(coded)
                .with_context(|| format!("Failed to put inline policy '{}'", policy.name))?;
            log::info!("  put inline policy {}", policy.name);
        }

        Ok(RoleOutput {
            name: self.name.clone(),
            arn: role.arn,
        })
    }

    async fn delete(&self, aws: &AwsContext, _previous: &RoleOutput) -> Result<(), Self::Error> {
        let client = aws.iam_client();
        self.detach_all(&client).await?;
        client
            .delete_role()
            .role_name(&self.name)
            .send()
            .await
            .map_err(coded)
            .context("Failed to delete role")?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn policies_name_their_resources() {
        let trust = trust_policy(FIREHOSE_PRINCIPAL);
        assert_eq!(
            "firehose.amazonaws.com",
            trust["Statement"][0]["Principal"]["Service"]
        );

        let delivery = firehose_delivery_policy("arn:aws:s3:::bucket");
        assert_eq!(
            serde_json::json!(["arn:aws:s3:::bucket", "arn:aws:s3:::bucket/*"]),
            delivery["Statement"][0]["Resource"]
        );

        let task = producer_task_policy(&["arn:a".to_owned(), "arn:b".to_owned()]);
        assert_eq!(
            serde_json::json!(["arn:a", "arn:b"]),
            task["Statement"][0]["Resource"]
        );
    }

    #[test]
    fn inline_policy_documents_are_dependencies() {
        let role = Role {
            inline_policies: vec![InlinePolicy {
                name: "delivery".to_owned(),
                document: Remote::unresolved("bucket"),
            }],
            ..Role::named("role")
        };
        let deps: Vec<String> = role.dependencies().into_iter().collect();
        assert_eq!(vec!["bucket".to_owned()], deps);
    }
}
