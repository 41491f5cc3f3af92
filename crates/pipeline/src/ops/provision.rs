//! `infra`: ensure the shared infrastructure of one environment.
use crate::{
    aws::{
        ec2::{DefaultVpc, SecurityGroup},
        ecs::Cluster,
        firehose::{self, DeliveryStream},
        iam::{self, InlinePolicy, Role},
        logs::LogGroup,
        s3::Bucket,
        ssm::Parameter,
        AwsContext,
    },
    config::Config,
    names::{Names, Service},
    Applied, Result, Store,
};

use super::{execute, Session};

/// The log group a service's delivery stream reports errors to, with the
/// stream Firehose writes into.
pub fn firehose_log_group(config: &Config, names: &Names, service: Service) -> LogGroup {
    LogGroup {
        name: names.firehose_log_group(service),
        retention_days: config.logs.retention_days,
        streams: vec![firehose::DELIVERY_LOG_STREAM.to_owned()],
    }
}

/// Declare the bucket, roles, streams, cluster, security group and log
/// groups, with a parameter publishing each identifier the deployer needs.
pub fn declare(store: &mut Store<AwsContext>, config: &Config, names: &Names) -> Result<()> {
    let account = store.provider().account().to_owned();
    let wait = config.wait_config();

    let bucket = store.resource(
        "bucket",
        Bucket {
            name: names.bucket(&account),
            archive_after_days: config.storage.archive_after_days,
            expire_after_days: config.storage.expire_after_days,
        },
    )?;
    store.resource(
        "bucket-parameter",
        Parameter {
            name: names.bucket_parameter(),
            value: bucket.remote(|b| b.name.clone()),
        },
    )?;

    let firehose_role = store.resource(
        "firehose-role",
        Role {
            name: names.firehose_role(),
            service_principal: iam::FIREHOSE_PRINCIPAL.to_owned(),
            managed_policy_arns: vec![],
            inline_policies: vec![InlinePolicy {
                name: "firehose-delivery".to_owned(),
                document: bucket.remote(|b| iam::firehose_delivery_policy(&b.arn)),
            }],
        },
    )?;

    let mut put_policies = vec![];
    for service in Service::ALL {
        let log_group = store.resource(
            format!("{service}-firehose-log-group"),
            firehose_log_group(config, names, service),
        )?;
        let stream = store.resource(
            format!("{service}-stream"),
            DeliveryStream {
                name: names.stream(service),
                service,
                bucket_arn: bucket.remote(|b| b.arn.clone()),
                role_arn: firehose_role.remote(|r| r.arn.clone()),
                log_group: log_group.remote(|g| g.name.clone()),
                buffer_size_mb: config.firehose.buffer_size_mb,
                buffer_interval_secs: config.firehose.buffer_interval_secs,
                wait,
            },
        )?;
        store.resource(
            format!("{service}-stream-parameter"),
            Parameter {
                name: names.stream_parameter(service),
                value: stream.remote(|s| s.name.clone()),
            },
        )?;
        put_policies.push(InlinePolicy {
            name: format!("firehose-put-{service}"),
            document: stream.remote(|s| iam::producer_task_policy(&[s.arn.clone()])),
        });
    }

    store.resource(
        "execution-role",
        Role {
            name: names.execution_role(),
            service_principal: iam::ECS_TASKS_PRINCIPAL.to_owned(),
            managed_policy_arns: vec![iam::ECS_TASK_EXECUTION_POLICY.to_owned()],
            inline_policies: vec![],
        },
    )?;
    store.resource(
        "task-role",
        Role {
            name: names.task_role(),
            service_principal: iam::ECS_TASKS_PRINCIPAL.to_owned(),
            managed_policy_arns: vec![],
            inline_policies: put_policies,
        },
    )?;

    let cluster = store.resource(
        "cluster",
        Cluster {
            name: names.cluster(),
            wait,
        },
    )?;
    store.resource(
        "cluster-parameter",
        Parameter {
            name: names.cluster_parameter(),
            value: cluster.remote(|c| c.name.clone()),
        },
    )?;

    let vpc = store.lookup("default-vpc", DefaultVpc)?;
    let security_group = store.resource(
        "security-group",
        SecurityGroup {
            name: names.security_group(),
            description: format!(
                "{} {} producer tasks",
                names.project, names.environment
            ),
            vpc_id: vpc.remote(|v| v.vpc_id.clone()),
            ingress_cidr: vpc.remote(|v| v.cidr.clone()),
            port: i32::from(config.container_port),
            wait,
        },
    )?;
    store.resource(
        "security-group-parameter",
        Parameter {
            name: names.security_group_parameter(),
            value: security_group.remote(|sg| sg.group_id.clone()),
        },
    )?;

    for service in Service::ALL {
        store.resource(
            format!("{service}-log-group"),
            LogGroup {
                name: names.service_log_group(service),
                retention_days: config.logs.retention_days,
                streams: vec![],
            },
        )?;
    }

    Ok(())
}

/// Ensure every piece of shared infrastructure exists.
pub async fn provision(session: &Session) -> Result<Vec<Applied>> {
    log::info!(
        "provisioning {} {} in {}",
        session.names.project,
        session.names.environment,
        session.aws.region()
    );
    let mut store = session.store();
    declare(&mut store, &session.config, &session.names)?;
    execute("infra", &mut store, session.dry_run).await
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{aws::offline_context, names::Environment, Action};

    fn offline_store() -> Store<AwsContext> {
        Store::new(offline_context())
    }

    fn position(ids: &[&str], id: &str) -> usize {
        ids.iter()
            .position(|i| *i == id)
            .unwrap_or_else(|| panic!("'{id}' is not planned"))
    }

    #[test]
    fn plans_every_resource_after_its_dependencies() {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut store = offline_store();
        declare(
            &mut store,
            &Config::default(),
            &Names::new("data-pipeline", Environment::Dev),
        )
        .unwrap();
        let plan = store.plan().unwrap();
        let ids = plan.actions.iter().map(|a| a.id.as_str()).collect::<Vec<_>>();
        assert_eq!(18, ids.len());

        for (before, after) in [
            ("bucket", "bucket-parameter"),
            ("bucket", "firehose-role"),
            ("firehose-role", "crm-stream"),
            ("firehose-role", "web-stream"),
            ("crm-firehose-log-group", "crm-stream"),
            ("crm-stream", "crm-stream-parameter"),
            ("crm-stream", "task-role"),
            ("web-stream", "task-role"),
            ("cluster", "cluster-parameter"),
            ("default-vpc", "security-group"),
            ("security-group", "security-group-parameter"),
        ] {
            assert!(
                position(&ids, before) < position(&ids, after),
                "{before} should run before {after}: {ids:?}"
            );
        }

        let lookups = plan
            .actions
            .iter()
            .filter(|a| a.action == Action::Lookup)
            .map(|a| a.id.as_str())
            .collect::<Vec<_>>();
        assert_eq!(vec!["default-vpc"], lookups);
    }

    #[test]
    fn firehose_log_groups_carry_the_delivery_stream() {
        let config = Config::default();
        let names = Names::new("data-pipeline", Environment::Dev);
        let group = firehose_log_group(&config, &names, Service::Web);
        assert_eq!("/aws/kinesisfirehose/web-stream-dev", group.name);
        assert_eq!(14, group.retention_days);
        assert_eq!(vec!["DestinationDelivery".to_owned()], group.streams);
    }

    #[test]
    fn declaring_twice_into_one_store_is_rejected() {
        let mut store = offline_store();
        let config = Config::default();
        let names = Names::new("data-pipeline", Environment::Prod);
        declare(&mut store, &config, &names).unwrap();
        let err = declare(&mut store, &config, &names).unwrap_err();
        assert!(matches!(err, crate::Error::Duplicate { .. }), "{err}");
    }
}
