#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

pub use project_cache_core as core;
pub use project_cache_k8s_api as k8s;
pub use project_cache_k8s_index as index;

mod args;
mod projects;
mod review;

pub use self::{args::Args, projects::Projects, review::AccessReviewer};
