//! A chart repository and deployer backed by the `helm` CLI.
//!
//! The repository index is fetched with `helm repo add`/`helm repo update` and read from helm's
//! repository cache. Releases are installed with `helm install --output json`, whose manifest
//! lists the Services and Secrets the release created.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cli;
pub mod index;
pub mod manifest;

pub use self::cli::{release_name, Helm};
