//! Task-definition templates.
//!
//! Templates are ECS task-definition JSON documents with `{placeholder}`
//! markers. A rendered template must not contain any marker, known or not.

use std::{collections::BTreeMap, path::Path};

use snafu::prelude::*;

use crate::{
    Error, ParseTemplateSnafu, ReadTemplateSnafu, UnresolvedPlaceholderSnafu,
};

/// Values substituted into a template.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TemplateVars {
    pub account: String,
    pub environment: String,
    pub image_uri: String,
    pub region: String,
    pub project: String,
    /// Port the producer serves `/health` on, the one the security group opens.
    pub container_port: u16,
}

impl TemplateVars {
    fn pairs(&self) -> [(&'static str, String); 6] {
        [
            ("account", self.account.clone()),
            ("environment", self.environment.clone()),
            ("image_uri", self.image_uri.clone()),
            ("region", self.region.clone()),
            ("project", self.project.clone()),
            ("container_port", self.container_port.to_string()),
        ]
    }
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinitionDocument {
    pub family: String,
    pub network_mode: String,
    pub requires_compatibilities: Vec<String>,
    pub cpu: String,
    pub memory: String,
    pub execution_role_arn: String,
    pub task_role_arn: String,
    pub container_definitions: Vec<ContainerDocument>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDocument {
    pub name: String,
    pub image: String,
    #[serde(default = "default_essential")]
    pub essential: bool,
    #[serde(default)]
    pub port_mappings: Vec<PortMappingDocument>,
    #[serde(default)]
    pub environment: Vec<KeyValueDocument>,
    pub log_configuration: Option<LogConfigurationDocument>,
    pub health_check: Option<HealthCheckDocument>,
}

fn default_essential() -> bool {
    true
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMappingDocument {
    pub container_port: i32,
    #[serde(default = "default_protocol")]
    pub protocol: String,
}

fn default_protocol() -> String {
    "tcp".to_owned()
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct KeyValueDocument {
    pub name: String,
    pub value: String,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfigurationDocument {
    pub log_driver: String,
    #[serde(default)]
    pub options: BTreeMap<String, String>,
}

#[derive(Clone, Debug, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckDocument {
    pub command: Vec<String>,
    pub interval: Option<i32>,
    pub timeout: Option<i32>,
    pub retries: Option<i32>,
    pub start_period: Option<i32>,
}

/// Returns every `{placeholder}` marker left in `text`, in order of
/// appearance and without duplicates.
pub fn unresolved_placeholders(text: &str) -> Vec<String> {
    let mut found: Vec<String> = vec![];
    let mut rest = text;
    while let Some(start) = rest.find('{') {
        rest = &rest[start + 1..];
        let name_len = rest
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(rest.len());
        if name_len > 0 && rest[name_len..].starts_with('}') {
            let name = format!("{{{}}}", &rest[..name_len]);
            if !found.contains(&name) {
                found.push(name);
            }
        }
    }
    found
}

/// Substitute `vars` into `template`.
///
/// ## Errors
/// Errs if any `{placeholder}` remains after substitution.
pub fn substitute(
    template_name: &str,
    template: &str,
    vars: &TemplateVars,
) -> Result<String, Error> {
    let rendered = vars
        .pairs()
        .into_iter()
        .fold(template.to_owned(), |text, (key, value)| {
            text.replace(&format!("{{{key}}}"), &value)
        });
    let placeholders = unresolved_placeholders(&rendered);
    snafu::ensure!(
        placeholders.is_empty(),
        UnresolvedPlaceholderSnafu {
            template: template_name,
            placeholders,
        }
    );
    Ok(rendered)
}

/// Render a template into a task definition document.
pub fn render(
    template_name: &str,
    template: &str,
    vars: &TemplateVars,
) -> Result<TaskDefinitionDocument, Error> {
    let rendered = substitute(template_name, template, vars)?;
    serde_json::from_str(&rendered).context(ParseTemplateSnafu {
        template: template_name,
    })
}

/// Read and render the template at `path`.
pub async fn render_file(
    path: impl AsRef<Path>,
    vars: &TemplateVars,
) -> Result<TaskDefinitionDocument, Error> {
    let path = path.as_ref();
    let template = tokio::fs::read_to_string(path)
        .await
        .context(ReadTemplateSnafu { path })?;
    render(&path.display().to_string(), &template, vars)
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    fn vars() -> TemplateVars {
        TemplateVars {
            account: "123456789012".to_owned(),
            environment: "dev".to_owned(),
            image_uri: "123456789012.dkr.ecr.eu-west-1.amazonaws.com/data-pipeline/crm:abc1234"
                .to_owned(),
            region: "eu-west-1".to_owned(),
            project: "data-pipeline".to_owned(),
            container_port: 8080,
        }
    }

    #[test]
    fn finds_placeholders_but_not_json_objects() {
        assert_eq!(
            vec!["{account}".to_owned(), "{image_uri}".to_owned()],
            unresolved_placeholders(
                r#"{"a": "{account}", "b": {"c": "{image_uri}-{account}"}, "d": "{ x }"}"#
            )
        );
        assert!(unresolved_placeholders("{}").is_empty());
    }

    #[test]
    fn misspelled_placeholders_are_reported() {
        let err = substitute(
            "web.json",
            r#"{"image": "{imageUri}", "name": "{image-uri}", "port": {port2}}"#,
            &vars(),
        )
        .unwrap_err();
        match err {
            Error::UnresolvedPlaceholder { placeholders, .. } => assert_eq!(
                vec![
                    "{imageUri}".to_owned(),
                    "{image-uri}".to_owned(),
                    "{port2}".to_owned()
                ],
                placeholders
            ),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_placeholder_fails_before_parsing() {
        let err = substitute(
            "crm.json",
            r#"{"family": "{environment}", "owner": "{team}"}"#,
            &vars(),
        )
        .unwrap_err();
        match err {
            Error::UnresolvedPlaceholder {
                template,
                placeholders,
            } => {
                assert_eq!("crm.json", template);
                assert_eq!(vec!["{team}".to_owned()], placeholders);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn renders_the_crm_template() {
        let doc = render(
            "crm.json",
            include_str!("../../../task-definitions/crm.json"),
            &vars(),
        )
        .unwrap();
        assert_eq!("crm-producer-dev", doc.family);
        assert_eq!("awsvpc", doc.network_mode);
        assert_eq!(vec!["FARGATE".to_owned()], doc.requires_compatibilities);
        assert_eq!(
            "arn:aws:iam::123456789012:role/data-pipeline-ecs-execution-role-dev",
            doc.execution_role_arn
        );

        let container = &doc.container_definitions[0];
        assert_eq!(vars().image_uri, container.image);
        assert_eq!(8080, container.port_mappings[0].container_port);
        let env: BTreeMap<_, _> = container
            .environment
            .iter()
            .map(|kv| (kv.name.as_str(), kv.value.as_str()))
            .collect();
        assert_eq!(Some(&"crm-stream-dev"), env.get("STREAM_NAME"));
        assert_eq!(
            Some(&"data-pipeline-dev-123456789012"),
            env.get("BUCKET_NAME")
        );
        assert_eq!(Some(&"eu-west-1"), env.get("AWS_DEFAULT_REGION"));
        assert_eq!(Some(&"crm"), env.get("SERVICE"));

        let logs = container.log_configuration.as_ref().unwrap();
        assert_eq!("awslogs", logs.log_driver);
        assert_eq!(
            Some(&"/ecs/data-pipeline/dev/crm".to_owned()),
            logs.options.get("awslogs-group")
        );
        let health = container.health_check.as_ref().unwrap();
        assert!(health.command[1].contains("/health"));
    }

    #[test]
    fn renders_the_web_template() {
        let doc = render(
            "web.json",
            include_str!("../../../task-definitions/web.json"),
            &vars(),
        )
        .unwrap();
        assert_eq!("web-producer-dev", doc.family);
        assert_eq!("web-producer", doc.container_definitions[0].name);
    }

    #[test]
    fn container_port_reaches_mapping_health_check_and_environment() {
        for (name, template) in [
            ("crm.json", include_str!("../../../task-definitions/crm.json")),
            ("web.json", include_str!("../../../task-definitions/web.json")),
        ] {
            let doc = render(
                name,
                template,
                &TemplateVars {
                    container_port: 9090,
                    ..vars()
                },
            )
            .unwrap();
            let container = &doc.container_definitions[0];
            assert_eq!(9090, container.port_mappings[0].container_port, "{name}");
            let health_port = container
                .environment
                .iter()
                .find(|kv| kv.name == "HEALTH_PORT")
                .map(|kv| kv.value.as_str());
            assert_eq!(Some("9090"), health_port, "{name}");
            let health = container.health_check.as_ref().unwrap();
            assert!(
                health.command[1].contains("localhost:9090/health"),
                "{name}: {:?}",
                health.command
            );
        }
    }
}
