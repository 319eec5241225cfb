#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub mod labels;

pub use self::labels::{Labels, Selector, SelectorError};
pub use k8s_openapi::{
    api::{
        self,
        core::v1::{Namespace, NamespaceSpec, NamespaceStatus},
        rbac::v1::{ClusterRole, ClusterRoleBinding, Role, RoleBinding},
    },
    apimachinery::pkg::apis::meta::v1::ListMeta,
    List,
};
pub use kube::{
    api::{Api, ObjectMeta, ResourceExt},
    Client, Error, Resource,
};

pub type NamespaceList = List<Namespace>;
