//! IAM OIDC identity provider registration
//!
//! The [`Registrar`] creates a provider for an active cluster's issuer and, on
//! cluster deletion, finds the provider whose URL matches the issuer and
//! removes it.
//!
//! IAM stores provider URLs without a scheme (`oidc.example.com/id/1`) while
//! EKS reports issuers with one (`https://oidc.example.com/id/1`), so URLs
//! are compared after stripping the `https://` prefix.

mod iam;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use crate::thumbprint::Thumbprint;
use crate::{Error, Result};

pub use iam::AwsIamApi;

/// Audience every cluster provider trusts: the AWS security token service
pub const STS_AUDIENCE: &str = "sts.amazonaws.com";

/// Parameters of a create-provider call
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CreateProviderRequest {
    /// Issuer URL
    pub url: String,
    /// Allowed client IDs (audiences)
    pub client_ids: Vec<String>,
    /// Root certificate thumbprints
    pub thumbprints: Vec<String>,
}

/// An IAM OIDC provider as returned by get-provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcProviderRecord {
    /// Provider ARN
    pub arn: String,
    /// Provider URL as stored by IAM (no scheme)
    pub url: String,
    /// Allowed client IDs
    #[serde(default)]
    pub client_ids: Vec<String>,
    /// Root certificate thumbprints
    #[serde(default)]
    pub thumbprints: Vec<String>,
}

/// Handle of a registered provider
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderHandle {
    /// Provider ARN, absent when IAM rejected the create as a duplicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arn: Option<String>,
    /// Issuer URL the provider trusts
    pub url: String,
    /// Whether this call created the provider
    pub created: bool,
}

/// Result of a deregistration
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum DeregisterOutcome {
    /// The matching provider was deleted
    Removed {
        /// ARN of the deleted provider
        arn: String,
    },
    /// No provider matched the issuer
    NotFound,
}

/// Trait abstracting the IAM OIDC provider operations
///
/// Allows mocking IAM in tests while using the AWS SDK in production.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IamApi: Send + Sync {
    /// Create a provider, returning its ARN
    ///
    /// Returns [`Error::ProviderExists`] when IAM rejects the URL as a duplicate.
    async fn create_oidc_provider(&self, request: &CreateProviderRequest) -> Result<String>;

    /// List the ARNs of all providers in the account
    async fn list_oidc_providers(&self) -> Result<Vec<String>>;

    /// Fetch the detail record of a provider
    async fn get_oidc_provider(&self, arn: &str) -> Result<OidcProviderRecord>;

    /// Delete a provider
    async fn delete_oidc_provider(&self, arn: &str) -> Result<()>;
}

/// Strip the `https://` scheme prefix from a URL
pub fn strip_scheme(url: &str) -> &str {
    url.strip_prefix("https://").unwrap_or(url)
}

/// Whether an IAM provider URL refers to the given issuer
pub fn provider_matches_issuer(provider_url: &str, issuer: &str) -> bool {
    strip_scheme(provider_url) == strip_scheme(issuer)
}

/// Registers and removes OIDC providers for cluster issuers
#[derive(Clone)]
pub struct Registrar {
    iam: Arc<dyn IamApi>,
    client_id: String,
}

impl Registrar {
    /// Create a registrar trusting the STS audience
    pub fn new(iam: Arc<dyn IamApi>) -> Self {
        Self::with_client_id(iam, STS_AUDIENCE)
    }

    /// Create a registrar trusting a custom audience
    pub fn with_client_id(iam: Arc<dyn IamApi>, client_id: impl Into<String>) -> Self {
        Self {
            iam,
            client_id: client_id.into(),
        }
    }

    /// Register `issuer` as an OIDC provider pinned to `thumbprint`
    ///
    /// Does not look for an existing provider first. A duplicate rejection from
    /// IAM is treated as success so re-running the workflow is harmless.
    pub async fn register(&self, issuer: &str, thumbprint: &Thumbprint) -> Result<ProviderHandle> {
        info!(issuer = %issuer, "Adding issuer as OpenID Connect provider");

        let request = CreateProviderRequest {
            url: issuer.to_string(),
            client_ids: vec![self.client_id.clone()],
            thumbprints: vec![thumbprint.to_string()],
        };

        match self.iam.create_oidc_provider(&request).await {
            Ok(arn) => {
                info!(issuer = %issuer, arn = %arn, "OpenID Connect provider created");
                Ok(ProviderHandle {
                    arn: Some(arn),
                    url: issuer.to_string(),
                    created: true,
                })
            }
            Err(Error::ProviderExists { .. }) => {
                warn!(issuer = %issuer, "OpenID Connect provider already exists");
                Ok(ProviderHandle {
                    arn: None,
                    url: issuer.to_string(),
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }

    /// Find the provider registered for `issuer`, if any
    ///
    /// Scans every provider in list order; the first match wins.
    pub async fn find(&self, issuer: &str) -> Result<Option<OidcProviderRecord>> {
        for arn in self.iam.list_oidc_providers().await? {
            let provider = self.iam.get_oidc_provider(&arn).await?;
            debug!(arn = %provider.arn, url = %provider.url, "Inspecting OpenID Connect provider");
            if provider_matches_issuer(&provider.url, issuer) {
                return Ok(Some(provider));
            }
        }
        Ok(None)
    }

    /// Remove the provider registered for `issuer`
    ///
    /// A missing provider is not an error: creation may never have completed.
    pub async fn deregister(&self, issuer: &str) -> Result<DeregisterOutcome> {
        let Some(provider) = self.find(issuer).await? else {
            info!(issuer = %issuer, "OpenID Connect provider not found");
            return Ok(DeregisterOutcome::NotFound);
        };

        info!(issuer = %issuer, arn = %provider.arn, "Removing OpenID Connect provider");
        self.iam.delete_oidc_provider(&provider.arn).await?;
        Ok(DeregisterOutcome::Removed { arn: provider.arn })
    }
}
