//! eks-idp - IAM OIDC identity providers for EKS clusters
//!
//! Reacts to EKS cluster lifecycle audit events:
//!
//! - On cluster creation, a provisioning workflow polls the cluster until it
//!   is active, resolves the root CA thumbprint of its OIDC issuer and
//!   registers the issuer as an IAM OIDC identity provider.
//! - On cluster deletion, the provider whose URL matches the cluster's issuer
//!   is removed.
//!
//! # Modules
//!
//! - [`events`] - Audit event parsing and routing keys
//! - [`handler`] - Event handlers (dispatcher, deletion, inline provisioning, local runs)
//! - [`workflow`] - Readiness + registration workflow and execution engines
//! - [`cluster`] - EKS describe-cluster abstraction and readiness checks
//! - [`thumbprint`] - OIDC discovery and TLS root certificate fingerprinting
//! - [`provider`] - IAM OIDC provider registration and removal
//! - [`retry`] - Retry policy for polling steps
//! - [`config`] - Command-line and environment configuration
//! - [`telemetry`] - Logging initialization
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cluster;
pub mod config;
pub mod error;
pub mod events;
pub mod handler;
pub mod provider;
pub mod retry;
pub mod telemetry;
pub mod thumbprint;
pub mod workflow;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
