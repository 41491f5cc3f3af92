//! `cleanup`: remove everything `infra`, `build` and `deploy` created.
//!
//! Teardown runs in fixed phases. Within the services phase the ECS services
//! go first, then the security group their tasks used, then the cluster.
//! A failure stops the teardown and leaves later phases untouched.
use crate::{
    aws::{
        ec2::SecurityGroup,
        ecs::{self, Cluster},
        firehose::DeliveryStream,
        iam::Role,
        logs::LogGroup,
        s3::Bucket,
        ssm::Parameter,
        AwsContext,
    },
    names::Service,
    Applied, Result, Store,
};

use super::{execute, Session};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    Services,
    Streams,
    Roles,
    LogGroups,
    Storage,
    Parameters,
}

impl core::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Phase::Services => "services",
            Phase::Streams => "streams",
            Phase::Roles => "roles",
            Phase::LogGroups => "log groups",
            Phase::Storage => "storage",
            Phase::Parameters => "parameters",
        })
    }
}

/// The phases to run, in order. Storage is skipped when preserving data.
pub fn phases(preserve_data: bool) -> Vec<Phase> {
    [
        Phase::Services,
        Phase::Streams,
        Phase::Roles,
        Phase::LogGroups,
        Phase::Storage,
        Phase::Parameters,
    ]
    .into_iter()
    .filter(|phase| !(preserve_data && *phase == Phase::Storage))
    .collect()
}

/// Stores of destroy declarations for one phase, to be applied in order.
pub fn stages(session: &Session, phase: Phase) -> Result<Vec<Store<AwsContext>>> {
    let names = &session.names;
    let wait = session.config.wait_config();
    let mut store = session.store();
    let stages = match phase {
        Phase::Services => {
            for service in Service::ALL {
                store.destroy(
                    format!("{service}-service"),
                    ecs::Service::named(names.ecs_service(service), names.cluster(), wait),
                )?;
            }
            let mut security_group = session.store();
            security_group.destroy(
                "security-group",
                SecurityGroup::named(names.security_group(), wait),
            )?;
            let mut cluster = session.store();
            cluster.destroy(
                "cluster",
                Cluster {
                    name: names.cluster(),
                    wait,
                },
            )?;
            vec![store, security_group, cluster]
        }
        Phase::Streams => {
            for service in Service::ALL {
                store.destroy(
                    format!("{service}-stream"),
                    DeliveryStream::named(names.stream(service), service, wait),
                )?;
            }
            vec![store]
        }
        Phase::Roles => {
            store.destroy("firehose-role", Role::named(names.firehose_role()))?;
            store.destroy("execution-role", Role::named(names.execution_role()))?;
            store.destroy("task-role", Role::named(names.task_role()))?;
            vec![store]
        }
        Phase::LogGroups => {
            for service in Service::ALL {
                store.destroy(
                    format!("{service}-log-group"),
                    LogGroup::named(names.service_log_group(service)),
                )?;
                store.destroy(
                    format!("{service}-firehose-log-group"),
                    LogGroup::named(names.firehose_log_group(service)),
                )?;
            }
            vec![store]
        }
        Phase::Storage => {
            store.destroy(
                "bucket",
                Bucket::named(names.bucket(session.aws.account())),
            )?;
            vec![store]
        }
        Phase::Parameters => {
            for key in names.all_parameters() {
                store.destroy(key.clone(), Parameter::named(key))?;
            }
            vec![store]
        }
    };
    Ok(stages)
}

/// Destroy the environment phase by phase.
pub async fn teardown(session: &Session, preserve_data: bool) -> Result<Vec<Applied>> {
    if preserve_data {
        log::info!(
            "preserving bucket {}",
            session.names.bucket(session.aws.account())
        );
    }
    let mut applied = vec![];
    for phase in phases(preserve_data) {
        log::info!("cleaning up {phase}");
        for mut store in stages(session, phase)? {
            let title = format!("cleanup {phase}");
            applied.extend(execute(&title, &mut store, session.dry_run).await?);
        }
    }
    Ok(applied)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        aws::offline_context,
        config::Config,
        names::{Environment, Names},
        Action,
    };

    fn session() -> Session {
        Session {
            aws: offline_context(),
            config: Config::default(),
            names: Names::new("data-pipeline", Environment::Dev),
            dry_run: true,
        }
    }

    fn planned_ids(session: &Session, phase: Phase) -> Vec<Vec<String>> {
        stages(session, phase)
            .unwrap()
            .into_iter()
            .map(|mut store| {
                let plan = store.plan().unwrap();
                assert!(plan.actions.iter().all(|a| a.action == Action::Destroy));
                plan.actions.into_iter().map(|a| a.id).collect()
            })
            .collect()
    }

    #[test]
    fn preserving_data_skips_storage() {
        assert_eq!(
            vec![
                Phase::Services,
                Phase::Streams,
                Phase::Roles,
                Phase::LogGroups,
                Phase::Parameters,
            ],
            phases(true)
        );
        let all = phases(false);
        assert_eq!(6, all.len());
        assert_eq!(Some(&Phase::Storage), all.get(4));
    }

    #[test]
    fn services_go_before_the_security_group_and_cluster() {
        let stages = planned_ids(&session(), Phase::Services);
        assert_eq!(3, stages.len());
        let mut services = stages[0].clone();
        services.sort();
        assert_eq!(vec!["crm-service", "web-service"], services);
        assert_eq!(vec!["security-group"], stages[1]);
        assert_eq!(vec!["cluster"], stages[2]);
    }

    #[test]
    fn storage_destroys_the_account_bucket() {
        assert_eq!(
            vec![vec!["bucket".to_owned()]],
            planned_ids(&session(), Phase::Storage)
        );
    }

    #[test]
    fn every_published_parameter_is_removed() {
        let session = session();
        let stages = planned_ids(&session, Phase::Parameters);
        let mut removed = stages.concat();
        removed.sort();
        let mut expected = session.names.all_parameters();
        expected.sort();
        assert_eq!(expected, removed);
    }

    #[tokio::test]
    async fn dry_run_touches_nothing() {
        let applied = teardown(&session(), false).await.unwrap();
        assert!(applied.is_empty());
    }
}
