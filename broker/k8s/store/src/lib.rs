//! Kubernetes-backed implementations of the broker's storage seams.
//!
//! Instance records live in ConfigMaps in the broker's own namespace. Release resources are read
//! and labeled through the API server directly.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod records;
mod resources;

pub use self::{records::ConfigMapRecords, resources::KubeResources};

use chart_broker_k8s_api as k8s;
use std::time::Duration;

const FIELD_MANAGER: &str = "chart-broker";

/// Bounds a write to the API server, when a timeout is configured.
async fn bounded<T>(
    timeout: Option<Duration>,
    write: impl std::future::Future<Output = Result<T, k8s::Error>>,
) -> anyhow::Result<Result<T, k8s::Error>> {
    match timeout {
        Some(timeout) => tokio::time::timeout(timeout, write)
            .await
            .map_err(|_| anyhow::anyhow!("write timed out after {}ms", timeout.as_millis())),
        None => Ok(write.await),
    }
}

fn is_status(error: &k8s::Error, code: u16) -> bool {
    matches!(error, k8s::Error::Api(rsp) if rsp.code == code)
}
