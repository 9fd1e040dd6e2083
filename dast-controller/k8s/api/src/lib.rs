#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod dast;
pub mod ingress;

pub use self::dast::{Analyzer, BackingService, Dast, DastSpec, DastStatus, ZapProxy};
pub use k8s_openapi::api::{
    self,
    apps::v1::Deployment,
    batch::v1::Job,
    core::v1::{Secret, Service},
};
pub use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
pub use kube::{
    api::{Api, ObjectMeta, PostParams},
    Resource, ResourceExt,
};
