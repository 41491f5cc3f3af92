//! ECR repositories holding the producer images.
use anyhow::Context;
use aws_sdk_ecr::types::ImageScanningConfiguration;

use super::{coded, has_code, AwsContext};
use crate::{HasDependencies, Resource};

/// An image repository, scanning every pushed image.
#[derive(Clone, Debug, PartialEq)]
pub struct Repository {
    pub name: String,
}

impl HasDependencies for Repository {}

#[derive(Clone, Debug, PartialEq)]
pub struct RepositoryOutput {
    pub name: String,
    pub uri: String,
}

impl Resource for Repository {
    type Provider = AwsContext;
    type Error = anyhow::Error;
    type Output = RepositoryOutput;

    async fn read(&self, aws: &AwsContext) -> Result<Option<RepositoryOutput>, Self::Error> {
        match aws
            .ecr_client()
            .describe_repositories()
            .repository_names(&self.name)
            .send()
            .await
        {
            Ok(out) => Ok(out
                .repositories()
                .first()
                .and_then(|repo| repo.repository_uri())
                .map(|uri| RepositoryOutput {
                    name: self.name.clone(),
                    uri: uri.to_owned(),
                })),
            Err(e) if has_code(&e, &["RepositoryNotFoundException"]) => Ok(None),
            Err(e) => Err(coded(e)).context("Failed to describe repository"),
        }
    }

    async fn create(&self, aws: &AwsContext) -> Result<RepositoryOutput, Self::Error> {
        let repo = aws
            .ecr_client()
            .create_repository()
            .repository_name(&self.name)
            .image_scanning_configuration(
                ImageScanningConfiguration::builder()
                    .scan_on_push(true)
                    .build(),
            )
            .send()
            .await
            .map_err(coded)
            .context("Failed to create repository")?
            .repository
            .context("no repository")?;
        let uri = repo
            .repository_uri()
            .context("repository without a URI")?
            .to_owned();
        log::info!("  created repository {uri}");
        Ok(RepositoryOutput {
            name: self.name.clone(),
            uri,
        })
    }
}

/// Credentials for `docker login` against the account's registry.
#[derive(Clone, PartialEq)]
pub struct RegistryLogin {
    pub username: String,
    pub password: String,
    /// Registry endpoint, e.g. `https://<account>.dkr.ecr.<region>.amazonaws.com`.
    pub endpoint: String,
}

impl std::fmt::Debug for RegistryLogin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegistryLogin")
            .field("username", &self.username)
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

/// Decode an ECR authorization token, which is base64 of `<user>:<password>`.
pub fn decode_authorization_token(
    token: &str,
    endpoint: impl Into<String>,
) -> anyhow::Result<RegistryLogin> {
    let decoded = data_encoding::BASE64
        .decode(token.as_bytes())
        .context("authorization token is not base64")?;
    let decoded = String::from_utf8(decoded).context("authorization token is not utf8")?;
    let (username, password) = decoded
        .split_once(':')
        .context("authorization token is not of the form user:password")?;
    Ok(RegistryLogin {
        username: username.to_owned(),
        password: password.to_owned(),
        endpoint: endpoint.into(),
    })
}

/// Fetch a fresh login for the account's registry.
pub async fn registry_login(aws: &AwsContext) -> anyhow::Result<RegistryLogin> {
    let out = aws
        .ecr_client()
        .get_authorization_token()
        .send()
        .await
        .map_err(coded)
        .context("Failed to get ECR authorization token")?;
    let data = out
        .authorization_data()
        .first()
        .context("no authorization data")?;
    decode_authorization_token(
        data.authorization_token().context("no authorization token")?,
        data.proxy_endpoint().context("no proxy endpoint")?,
    )
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn decodes_authorization_token() {
        let token = data_encoding::BASE64.encode(b"AWS:s3cr3t:with:colons");
        let login = decode_authorization_token(
            &token,
            "https://123456789012.dkr.ecr.eu-west-1.amazonaws.com",
        )
        .unwrap();
        assert_eq!("AWS", login.username);
        assert_eq!("s3cr3t:with:colons", login.password);
        assert!(!format!("{login:?}").contains("s3cr3t"));
    }

    #[test]
    fn rejects_garbage_tokens() {
        assert!(decode_authorization_token("not base64!", "https://x").is_err());
        let token = data_encoding::BASE64.encode(b"no-separator");
        assert!(decode_authorization_token(&token, "https://x").is_err());
    }
}
