//! Deterministic resource names.
//!
//! Every AWS resource the pipeline manages is found again by name, so these
//! functions are the only source of identity across runs.

use snafu::prelude::*;

#[derive(Debug, Snafu, PartialEq)]
#[snafu(display("Unknown {kind} '{value}', expected one of: {expected}"))]
pub struct ParseNameError {
    kind: &'static str,
    value: String,
    expected: &'static str,
}

/// Deployment environment.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Environment {
    #[default]
    Dev,
    Staging,
    Prod,
}

impl Environment {
    pub const ALL: [Environment; 3] = [Environment::Dev, Environment::Staging, Environment::Prod];

    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Dev => "dev",
            Environment::Staging => "staging",
            Environment::Prod => "prod",
        }
    }
}

impl core::fmt::Display for Environment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Environment {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Environment::ALL
            .into_iter()
            .find(|env| env.as_str() == s)
            .context(ParseNameSnafu {
                kind: "environment",
                value: s,
                expected: "dev, staging, prod",
            })
    }
}

/// One of the two producer services.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Service {
    Crm,
    Web,
}

impl Service {
    pub const ALL: [Service; 2] = [Service::Crm, Service::Web];

    pub fn as_str(&self) -> &'static str {
        match self {
            Service::Crm => "crm",
            Service::Web => "web",
        }
    }

    /// File name of the service's task-definition template.
    pub fn template_file(&self) -> String {
        format!("{self}.json")
    }
}

impl core::fmt::Display for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Service {
    type Err = ParseNameError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Service::ALL
            .into_iter()
            .find(|service| service.as_str() == s)
            .context(ParseNameSnafu {
                kind: "service",
                value: s,
                expected: "crm, web",
            })
    }
}

/// Names of everything deployed for one project and environment.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Names {
    pub project: String,
    pub environment: Environment,
}

impl Names {
    pub fn new(project: impl Into<String>, environment: Environment) -> Self {
        Self {
            project: project.into(),
            environment,
        }
    }

    /// Bucket names are global, so the account id keeps them unique.
    pub fn bucket(&self, account: &str) -> String {
        format!("{}-{}-{account}", self.project, self.environment)
    }

    pub fn cluster(&self) -> String {
        format!("{}-{}", self.project, self.environment)
    }

    pub fn security_group(&self) -> String {
        format!("{}-{}-sg", self.project, self.environment)
    }

    pub fn stream(&self, service: Service) -> String {
        format!("{service}-stream-{}", self.environment)
    }

    pub fn firehose_role(&self) -> String {
        format!("{}-firehose-role-{}", self.project, self.environment)
    }

    pub fn execution_role(&self) -> String {
        format!("{}-ecs-execution-role-{}", self.project, self.environment)
    }

    pub fn task_role(&self) -> String {
        format!("{}-ecs-task-role-{}", self.project, self.environment)
    }

    pub fn service_log_group(&self, service: Service) -> String {
        format!("/ecs/{}/{}/{service}", self.project, self.environment)
    }

    pub fn firehose_log_group(&self, service: Service) -> String {
        format!("/aws/kinesisfirehose/{}", self.stream(service))
    }

    pub fn ecs_service(&self, service: Service) -> String {
        format!("{service}-service-{}", self.environment)
    }

    pub fn repository(&self, service: Service) -> String {
        format!("{}/{service}", self.project)
    }

    /// Key of a parameter-store entry, `/<project>/<environment>/<resource>`.
    pub fn parameter(&self, resource: &str) -> String {
        format!("/{}/{}/{resource}", self.project, self.environment)
    }

    pub fn bucket_parameter(&self) -> String {
        self.parameter("bucket-name")
    }

    pub fn cluster_parameter(&self) -> String {
        self.parameter("cluster-name")
    }

    pub fn security_group_parameter(&self) -> String {
        self.parameter("security-group-id")
    }

    pub fn stream_parameter(&self, service: Service) -> String {
        self.parameter(&format!("{service}-stream-name"))
    }

    pub fn image_parameter(&self, service: Service) -> String {
        self.parameter(&format!("{service}-image-uri"))
    }

    /// Every parameter key that provisioning or image publishing writes.
    pub fn all_parameters(&self) -> Vec<String> {
        let mut keys = vec![
            self.bucket_parameter(),
            self.cluster_parameter(),
            self.security_group_parameter(),
        ];
        for service in Service::ALL {
            keys.push(self.stream_parameter(service));
        }
        for service in Service::ALL {
            keys.push(self.image_parameter(service));
        }
        keys
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn names_follow_the_naming_table() {
        let names = Names::new("data-pipeline", Environment::Dev);
        assert_eq!("data-pipeline-dev-123456789012", names.bucket("123456789012"));
        assert_eq!("data-pipeline-dev", names.cluster());
        assert_eq!("data-pipeline-dev-sg", names.security_group());
        assert_eq!("crm-stream-dev", names.stream(Service::Crm));
        assert_eq!("data-pipeline-firehose-role-dev", names.firehose_role());
        assert_eq!(
            "data-pipeline-ecs-execution-role-dev",
            names.execution_role()
        );
        assert_eq!("data-pipeline-ecs-task-role-dev", names.task_role());
        assert_eq!(
            "/ecs/data-pipeline/dev/web",
            names.service_log_group(Service::Web)
        );
        assert_eq!(
            "/aws/kinesisfirehose/web-stream-dev",
            names.firehose_log_group(Service::Web)
        );
        assert_eq!("crm-service-dev", names.ecs_service(Service::Crm));
        assert_eq!("data-pipeline/web", names.repository(Service::Web));
    }

    #[test]
    fn parameter_keys() {
        let names = Names::new("data-pipeline", Environment::Prod);
        assert_eq!(
            vec![
                "/data-pipeline/prod/bucket-name",
                "/data-pipeline/prod/cluster-name",
                "/data-pipeline/prod/security-group-id",
                "/data-pipeline/prod/crm-stream-name",
                "/data-pipeline/prod/web-stream-name",
                "/data-pipeline/prod/crm-image-uri",
                "/data-pipeline/prod/web-image-uri",
            ],
            names.all_parameters()
        );
    }

    #[test]
    fn parse_service_and_environment() {
        assert_eq!(Ok(Service::Web), "web".parse());
        assert_eq!(Ok(Environment::Staging), "staging".parse());
        let err = "billing".parse::<Service>().unwrap_err();
        assert_eq!(
            "Unknown service 'billing', expected one of: crm, web",
            err.to_string()
        );
        assert!("production".parse::<Environment>().is_err());
        assert_eq!(Environment::Dev, Environment::default());
    }
}
