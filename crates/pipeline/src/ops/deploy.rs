//! `deploy`: register a task-definition revision and roll it out.
use crate::{
    aws::{
        ec2::{DefaultSubnets, DefaultVpc},
        ecs::{self, TaskDefinition},
        ssm::{get_parameter_value, require_parameter_value},
        AwsContext,
    },
    names::{Names, Service},
    template::{self, TaskDefinitionDocument, TemplateVars},
    wait::WaitConfig,
    Applied, Result, Store,
};

use super::{execute, Session};

/// Where a service runs, as published by `infra`.
#[derive(Clone, Debug, PartialEq)]
pub struct Placement {
    pub cluster: String,
    pub security_group_id: String,
}

/// The image a deploy uses when none was pushed through `build`.
pub fn latest_image_uri(aws: &AwsContext, names: &Names, service: Service) -> String {
    format!(
        "{}.dkr.ecr.{}.amazonaws.com/{}:latest",
        aws.account(),
        aws.region(),
        names.repository(service)
    )
}

/// The override, else the last image `build` published, else `:latest`.
pub async fn resolve_image(
    aws: &AwsContext,
    names: &Names,
    service: Service,
    image: Option<String>,
) -> Result<String> {
    if let Some(image) = image {
        return Ok(image);
    }
    let published = get_parameter_value(aws, &names.image_parameter(service)).await?;
    Ok(published.unwrap_or_else(|| latest_image_uri(aws, names, service)))
}

/// Declare a new task-definition revision and the service running it.
pub fn declare(
    store: &mut Store<AwsContext>,
    names: &Names,
    service: Service,
    document: TaskDefinitionDocument,
    placement: Placement,
    wait: WaitConfig,
) -> Result<()> {
    let task_definition =
        store.resource(format!("{service}-task-definition"), TaskDefinition { document })?;
    let vpc = store.lookup("default-vpc", DefaultVpc)?;
    let subnets = store.lookup(
        "default-subnets",
        DefaultSubnets {
            vpc_id: vpc.remote(|v| v.vpc_id.clone()),
        },
    )?;
    store.resource(
        format!("{service}-service"),
        ecs::Service {
            name: names.ecs_service(service),
            cluster: placement.cluster,
            task_definition_arn: task_definition.remote(|td| td.arn.clone()),
            subnets: subnets.remote(|s| s.clone()),
            security_group_id: placement.security_group_id,
            desired_count: 1,
            wait,
        },
    )?;
    Ok(())
}

/// Deploy `service`, creating its ECS service on first use.
///
/// Blocks until the service is stable.
pub async fn deploy(
    session: &Session,
    service: Service,
    image: Option<String>,
) -> Result<Vec<Applied>> {
    let Session {
        aws,
        config,
        names,
        dry_run,
    } = session;

    let placement = Placement {
        cluster: require_parameter_value(aws, &names.cluster_parameter()).await?,
        security_group_id: require_parameter_value(aws, &names.security_group_parameter())
            .await?,
    };
    let image_uri = resolve_image(aws, names, service, image).await?;
    log::info!("deploying {image_uri} to {}", placement.cluster);

    let vars = TemplateVars {
        account: aws.account().to_owned(),
        environment: names.environment.to_string(),
        image_uri,
        region: aws.region().to_owned(),
        project: names.project.clone(),
        container_port: config.container_port,
    };
    let document = template::render_file(config.template_path(service), &vars).await?;

    let mut store = session.store();
    declare(
        &mut store,
        names,
        service,
        document,
        placement,
        config.wait_config(),
    )?;
    execute("deploy", &mut store, *dry_run).await
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{aws::offline_context, names::Environment, Action};

    fn document() -> TaskDefinitionDocument {
        template::render(
            "crm.json",
            include_str!("../../../../task-definitions/crm.json"),
            &TemplateVars {
                account: "123456789012".to_owned(),
                environment: "dev".to_owned(),
                image_uri: "repo:tag".to_owned(),
                region: "eu-west-1".to_owned(),
                project: "data-pipeline".to_owned(),
                container_port: 8080,
            },
        )
        .unwrap()
    }

    #[test]
    fn falls_back_to_the_latest_tag() {
        let names = Names::new("data-pipeline", Environment::Staging);
        assert_eq!(
            "123456789012.dkr.ecr.eu-west-1.amazonaws.com/data-pipeline/web:latest",
            latest_image_uri(&offline_context(), &names, Service::Web)
        );
    }

    #[tokio::test]
    async fn explicit_image_skips_the_parameter_store() {
        let names = Names::new("data-pipeline", Environment::Dev);
        let image = resolve_image(
            &offline_context(),
            &names,
            Service::Crm,
            Some("registry/crm:v2".to_owned()),
        )
        .await
        .unwrap();
        assert_eq!("registry/crm:v2", image);
    }

    #[test]
    fn service_waits_for_its_task_definition_and_subnets() {
        let mut store = Store::new(offline_context());
        declare(
            &mut store,
            &Names::new("data-pipeline", Environment::Dev),
            Service::Crm,
            document(),
            Placement {
                cluster: "data-pipeline-dev".to_owned(),
                security_group_id: "sg-0123".to_owned(),
            },
            WaitConfig::default(),
        )
        .unwrap();
        let plan = store.plan().unwrap();
        let planned = plan
            .actions
            .iter()
            .map(|a| (a.id.as_str(), a.action))
            .collect::<Vec<_>>();
        assert_eq!(4, planned.len());
        assert_eq!(("crm-service", Action::Ensure), planned[3]);
        let subnets = planned
            .iter()
            .position(|(id, _)| *id == "default-subnets")
            .unwrap();
        let vpc = planned
            .iter()
            .position(|(id, _)| *id == "default-vpc")
            .unwrap();
        assert!(vpc < subnets);
        assert_eq!(Action::Lookup, planned[subnets].1);
    }
}
