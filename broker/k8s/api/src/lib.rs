#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod cluster;
pub mod labels;

pub use self::labels::Selector;
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{ConfigMap, Secret, Service, ServicePort, ServiceSpec},
    },
    ByteString, NamespaceResourceScope,
};
pub use kube::{
    api::{Api, DeleteParams, ListParams, ObjectMeta, Patch, PatchParams, PostParams, ResourceExt},
    Client, Error, Resource,
};
