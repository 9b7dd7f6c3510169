//! Chart Broker
//!
//! The broker implements the Open Service Broker verbs by installing Helm charts into a cluster
//! and handing out connection credentials for the deployed workloads:
//!
//! - The catalog is derived from a chart repository index: each chart becomes a service and each
//!   distinct application version of the chart becomes a plan.
//! - Provisioning creates a per-instance record, installs the chart selected by the plan, and
//!   labels the release's Services and Secrets with the instance ID.
//! - Binding discovers the labeled resources, flattens the release's secrets and, for known
//!   service types, normalizes them into a credential object (URI, host, port, user, password,
//!   database).
//! - Deprovisioning uninstalls the release and removes the record.
//!
//! ```text
//! [ OSB verb ] -> [ Broker ] -> [ RecordStore ]
//!                    |  \-----> [ ChartRepository / ChartDeployer ]
//!                    \--------> [ ResourceStore ] -> [ Provider ]
//! ```
//!
//! Long-running verbs may complete asynchronously. In that case the broker writes an in-progress
//! operation to the instance record, runs the work in a background task, and records its
//! terminal state for callers polling the last operation.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod broker;
pub mod catalog;
pub mod charts;
pub mod credentials;
mod error;
pub mod operation;
pub mod params;
pub mod record;
pub mod resources;
pub mod store;


pub use self::{
    broker::{BindRequest, BindResponse, Broker, Config, ProvisionRequest},
    catalog::{CatalogService, ChartIndex, ChartVersion, Plan},
    charts::{ChartDeployer, ChartRepository, Release},
    credentials::{Credentials, Provider, ProviderError, Providers},
    error::{Error, CONCURRENCY_ERROR},
    params::Params,
    record::{BindingPayload, InstanceRecord, LastOperation, OperationState, ReleaseRef},
    resources::{ResourceKind, ResourceRef, ResourceStore},
    store::{RecordStore, StoreError},
};

/// Labels Services and Secrets of a release with the ID of the instance that owns them.
pub const INSTANCE_LABEL: &str = "chart-broker.io/instance";
