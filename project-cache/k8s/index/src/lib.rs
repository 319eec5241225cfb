//! Namespace visibility cache
//!
//! The cache answers "which namespaces may this user see?" without calling out to the API server
//! on every request. It watches the following cluster resources:
//!
//! - `ClusterRole` and `ClusterRoleBinding` objects affect every namespace. Their identities are
//!   folded into a single hash that is only recomputed when the store reports a change.
//! - `Role` and `RoleBinding` objects affect only their own namespace.
//! - `Namespace` objects determine which access records exist and are filtered by label
//!   selectors when listing.
//!
//! Each namespace's access record is tagged with the hash of the RBAC state it was computed from.
//! A synchronization recomputes the hashes and asks the `Reviewer` only about namespaces whose
//! hash moved:
//!
//! ```text
//! [ ClusterRole(Binding) ] -> [ global hash ] -+
//!                                              +-> [ namespace hash ] -> [ Reviewer ] -> [ users/groups ]
//! [ Role(Binding) in ns  ] -> [ local hash  ] -+
//! ```
//!
//! The reactive wrapper feeds resource events through a rate-limited work queue so that changes
//! are picked up without waiting for the next periodic synchronization.

#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

mod cache;
mod global;
mod metrics;
mod namespace;
mod queue;
mod rbac;
mod reactive;
mod scope;
mod subjects;


pub use self::{
    cache::{AccessRecord, AuthorizationCache, SyncOutcome},
    global::{GlobalRbacCache, HashError},
    metrics::{CacheMetrics, QueueMetrics},
    namespace::{NamespaceIndex, SharedNamespaceIndex},
    queue::{RateLimiter, WorkQueue},
    rbac::{RbacIndex, SharedRbacIndex},
    reactive::{ChangeKey, ChangeKeyed, Reactive, ReactiveAuthorizationCache, ReactiveConfig},
    scope::{visible_namespaces, Visible},
};
