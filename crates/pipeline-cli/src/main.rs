//! `pipeline`: provision, build, deploy and clean up the data pipeline
//! producers.
//!
//! ```sh
//! pipeline infra staging
//! pipeline build crm staging
//! pipeline deploy crm staging
//! pipeline --dry-run cleanup staging true
//! ```
use std::{io::Write, path::PathBuf, process::ExitCode};

use clap::{Parser, Subcommand};
use colored::Colorize;
use pipeline::{
    aws::AwsContext,
    config::{Config, DEFAULT_CONFIG_FILE},
    names::{Environment, Names, Service},
    ops::{deploy, image, provision, teardown, Session},
    Applied, Outcome,
};

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Cli {
    /// Sets the verbosity level
    #[clap(short, action = clap::ArgAction::Count)]
    verbosity: u8,

    /// Path to the pipeline config file. Defaults apply when it is missing.
    #[clap(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// AWS region, overriding the config file.
    #[clap(long, env = "AWS_REGION")]
    region: Option<String>,

    /// Print what would be done without changing anything.
    #[clap(long)]
    dry_run: bool,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Ensure the bucket, streams, roles, cluster and network exist.
    Infra {
        #[clap(default_value = "dev")]
        environment: Environment,
    },
    /// Build a producer image and push it to ECR.
    Build {
        service: Service,
        #[clap(default_value = "dev")]
        environment: Environment,
        /// Image tag. Defaults to the short git commit.
        #[clap(long)]
        tag: Option<String>,
    },
    /// Register a new task definition and roll it out.
    Deploy {
        service: Service,
        #[clap(default_value = "dev")]
        environment: Environment,
        /// Image to deploy. Defaults to the last image built.
        #[clap(long)]
        image: Option<String>,
    },
    /// Tear down everything, keeping the bucket when `preserve_data` is true.
    Cleanup {
        #[clap(default_value = "dev")]
        environment: Environment,
        #[clap(default_value_t = false, action = clap::ArgAction::Set)]
        preserve_data: bool,
    },
}

impl Command {
    fn environment(&self) -> Environment {
        match self {
            Command::Infra { environment }
            | Command::Build { environment, .. }
            | Command::Deploy { environment, .. }
            | Command::Cleanup { environment, .. } => *environment,
        }
    }
}

fn init_logging(verbosity: u8) {
    let level = match verbosity {
        0 => log::LevelFilter::Info,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::default()
        .filter_level(log::LevelFilter::Warn)
        .filter_module("pipeline", level)
        .parse_default_env()
        .target(env_logger::Target::Stdout)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{}] [{}] {}",
                chrono::Utc::now().to_rfc3339(),
                record.level(),
                record.args()
            )
        })
        .init();
}

fn print_summary(applied: &[Applied]) {
    for Applied { id, outcome } in applied {
        let outcome_str = outcome.to_string();
        let outcome_str = match outcome {
            Outcome::Created => outcome_str.green(),
            Outcome::Updated => outcome_str.yellow(),
            Outcome::Destroyed => outcome_str.red(),
            Outcome::Loaded | Outcome::Read | Outcome::Absent => outcome_str.dimmed(),
        };
        println!("  {id}: {outcome_str}");
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = Config::load(&cli.config).await?;
    let region = cli.region.or_else(|| config.region.clone());
    let environment = cli.command.environment();
    let aws = AwsContext::load(region.as_deref()).await?;
    let session = Session {
        aws,
        names: Names::new(config.project.clone(), environment),
        config,
        dry_run: cli.dry_run,
    };

    match cli.command {
        Command::Infra { .. } => {
            let applied = provision::provision(&session).await?;
            print_summary(&applied);
        }
        Command::Build { service, tag, .. } => {
            if let Some(uri) = image::publish(&session, service, tag).await? {
                println!("{uri}");
            }
        }
        Command::Deploy { service, image, .. } => {
            let applied = deploy::deploy(&session, service, image).await?;
            print_summary(&applied);
        }
        Command::Cleanup { preserve_data, .. } => {
            let applied = teardown::teardown(&session, preserve_data).await?;
            print_summary(&applied);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbosity);
    log::debug!("{cli:?}");

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e:?}");
            ExitCode::FAILURE
        }
    }
}

#[cfg(test)]
mod test {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn environment_defaults_to_dev() {
        let cli = Cli::try_parse_from(["pipeline", "infra"]).unwrap();
        assert_eq!(
            Command::Infra {
                environment: Environment::Dev
            },
            cli.command
        );
        assert_eq!(PathBuf::from("pipeline.toml"), cli.config);
        assert!(!cli.dry_run);
    }

    #[test]
    fn parses_deploy() {
        let cli = Cli::try_parse_from([
            "pipeline",
            "--dry-run",
            "deploy",
            "web",
            "prod",
            "--image",
            "repo/web:abc1234",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(
            Command::Deploy {
                service: Service::Web,
                environment: Environment::Prod,
                image: Some("repo/web:abc1234".to_owned()),
            },
            cli.command
        );
    }

    #[test]
    fn rejects_unknown_services_and_environments() {
        assert!(Cli::try_parse_from(["pipeline", "deploy", "billing"]).is_err());
        assert!(Cli::try_parse_from(["pipeline", "build", "crm", "qa"]).is_err());
        assert!(Cli::try_parse_from(["pipeline", "deploy"]).is_err());
    }

    #[test]
    fn cleanup_preserves_data_only_when_asked() {
        let cli = Cli::try_parse_from(["pipeline", "cleanup", "staging"]).unwrap();
        assert_eq!(
            Command::Cleanup {
                environment: Environment::Staging,
                preserve_data: false,
            },
            cli.command
        );
        let cli = Cli::try_parse_from(["pipeline", "cleanup", "staging", "true"]).unwrap();
        assert_eq!(
            Command::Cleanup {
                environment: Environment::Staging,
                preserve_data: true,
            },
            cli.command
        );
    }

    #[test]
    fn build_takes_an_optional_tag() {
        let cli = Cli::try_parse_from(["pipeline", "build", "crm", "--tag", "v3"]).unwrap();
        assert_eq!(Environment::Dev, cli.command.environment());
        assert_eq!(
            Command::Build {
                service: Service::Crm,
                environment: Environment::Dev,
                tag: Some("v3".to_owned()),
            },
            cli.command
        );
    }
}
