#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use chart_broker_core as core;
pub use chart_broker_helm as helm;
pub use chart_broker_k8s_api as k8s;
pub use chart_broker_k8s_store as store;

mod args;
mod metrics;
mod osb;
mod settings;

pub use self::{args::Args, metrics::OsbMetrics, osb::Osb, settings::Settings};
