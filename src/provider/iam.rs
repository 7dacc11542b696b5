//! AWS SDK implementation of [`IamApi`]

use async_trait::async_trait;
use aws_sdk_iam::error::DisplayErrorContext;

use super::{strip_scheme, CreateProviderRequest, IamApi, OidcProviderRecord};
use crate::{Error, Result};

/// OIDC provider operations backed by the IAM API
#[derive(Clone, Debug)]
pub struct AwsIamApi {
    client: aws_sdk_iam::Client,
}

impl AwsIamApi {
    /// Create a new AwsIamApi from shared SDK configuration
    pub fn new(sdk_config: &aws_config::SdkConfig) -> Self {
        Self {
            client: aws_sdk_iam::Client::new(sdk_config),
        }
    }

    /// Wrap an existing IAM client
    pub fn from_client(client: aws_sdk_iam::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl IamApi for AwsIamApi {
    async fn create_oidc_provider(&self, request: &CreateProviderRequest) -> Result<String> {
        let output = self
            .client
            .create_open_id_connect_provider()
            .url(&request.url)
            .set_client_id_list(Some(request.client_ids.clone()))
            .set_thumbprint_list(Some(request.thumbprints.clone()))
            .send()
            .await
            .map_err(|e| {
                let duplicate = e
                    .as_service_error()
                    .is_some_and(|se| se.is_entity_already_exists_exception());
                if duplicate {
                    Error::ProviderExists {
                        url: strip_scheme(&request.url).to_string(),
                    }
                } else {
                    Error::remote(
                        "iam",
                        "CreateOpenIDConnectProvider",
                        DisplayErrorContext(&e).to_string(),
                    )
                }
            })?;

        output
            .open_id_connect_provider_arn()
            .map(str::to_string)
            .ok_or_else(|| {
                Error::remote(
                    "iam",
                    "CreateOpenIDConnectProvider",
                    "response carried no provider ARN",
                )
            })
    }

    async fn list_oidc_providers(&self) -> Result<Vec<String>> {
        let output = self
            .client
            .list_open_id_connect_providers()
            .send()
            .await
            .map_err(|e| {
                Error::remote(
                    "iam",
                    "ListOpenIDConnectProviders",
                    DisplayErrorContext(&e).to_string(),
                )
            })?;

        Ok(output
            .open_id_connect_provider_list()
            .iter()
            .filter_map(|entry| entry.arn().map(str::to_string))
            .collect())
    }

    async fn get_oidc_provider(&self, arn: &str) -> Result<OidcProviderRecord> {
        let output = self
            .client
            .get_open_id_connect_provider()
            .open_id_connect_provider_arn(arn)
            .send()
            .await
            .map_err(|e| {
                Error::remote(
                    "iam",
                    "GetOpenIDConnectProvider",
                    DisplayErrorContext(&e).to_string(),
                )
            })?;

        Ok(OidcProviderRecord {
            arn: arn.to_string(),
            url: output.url().unwrap_or_default().to_string(),
            client_ids: output.client_id_list().to_vec(),
            thumbprints: output.thumbprint_list().to_vec(),
        })
    }

    async fn delete_oidc_provider(&self, arn: &str) -> Result<()> {
        self.client
            .delete_open_id_connect_provider()
            .open_id_connect_provider_arn(arn)
            .send()
            .await
            .map_err(|e| {
                Error::remote(
                    "iam",
                    "DeleteOpenIDConnectProvider",
                    DisplayErrorContext(&e).to_string(),
                )
            })?;
        Ok(())
    }
}
