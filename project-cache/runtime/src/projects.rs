//! Serves the namespaces visible to the requesting user.
//!
//! Requests are expected to arrive through an authenticating front proxy that identifies the user
//! with `X-Remote-*` headers.

use crate::{
    core::{AuthorizationCache, UserInfo},
    k8s::{Selector, SelectorError},
};
use futures::future;
use hyper::{http, Request, Response};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Status;
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, trace, warn};
use url::form_urlencoded;

const USER_HEADER: &str = "x-remote-user";
const GROUP_HEADER: &str = "x-remote-group";
const SCOPES_HEADER: &str = "x-remote-extra-scopes.authorization.openshift.io";
const LABEL_SELECTOR_PARAM: &str = "labelSelector";

#[derive(Clone)]
pub struct Projects {
    cache: Arc<dyn AuthorizationCache>,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to encode json response: {0}")]
    Json(#[from] serde_json::Error),
}

type Body = http_body_util::Full<bytes::Bytes>;

// === impl Projects ===

impl<B> tower::Service<Request<B>> for Projects {
    type Response = Response<Body>;
    type Error = Error;
    type Future = future::Ready<Result<Response<Body>, Error>>;

    fn poll_ready(
        &mut self,
        _cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<std::result::Result<(), Self::Error>> {
        std::task::Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<B>) -> Self::Future {
        trace!(method = %req.method(), uri = %req.uri());
        let (parts, _) = req.into_parts();
        let rsp = self.handle(&parts).map(|rsp| {
            if parts.method == http::Method::HEAD {
                // Same headers as GET, without the body.
                return rsp.map(|_| Body::default());
            }
            rsp
        });
        future::ready(rsp)
    }
}

impl Projects {
    pub fn new(cache: Arc<dyn AuthorizationCache>) -> Self {
        Self { cache }
    }

    fn handle(&self, req: &http::request::Parts) -> Result<Response<Body>, Error> {
        if req.uri.path() != "/projects" {
            return status_response(
                http::StatusCode::NOT_FOUND,
                "NotFound",
                format!("{} not found", req.uri.path()),
            );
        }

        if req.method != http::Method::GET && req.method != http::Method::HEAD {
            return status_response(
                http::StatusCode::METHOD_NOT_ALLOWED,
                "MethodNotAllowed",
                format!("{} is not supported", req.method),
            );
        }

        if !self.cache.ready_for_access() {
            return status_response(
                http::StatusCode::SERVICE_UNAVAILABLE,
                "ServiceUnavailable",
                "the project cache is not yet ready",
            );
        }

        let Some(user) = user_info(&req.headers) else {
            return status_response(
                http::StatusCode::UNAUTHORIZED,
                "Unauthorized",
                "no user was identified by the request",
            );
        };

        let selector = match label_selector(req.uri.query()) {
            Ok(selector) => selector,
            Err(error) => {
                debug!(%error, "Invalid label selector");
                return status_response(
                    http::StatusCode::BAD_REQUEST,
                    "BadRequest",
                    format!("invalid label selector: {error}"),
                );
            }
        };

        match self.cache.list(&user, &selector) {
            Ok(list) => {
                debug!(user = %user.name, projects = list.items.len(), "Listed projects");
                json_response(http::StatusCode::OK, &list)
            }
            Err(error) => {
                warn!(user = %user.name, %error, "Failed to list projects");
                status_response(
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "InternalError",
                    error.to_string(),
                )
            }
        }
    }
}

fn user_info(headers: &http::HeaderMap) -> Option<UserInfo> {
    let name = headers.get(USER_HEADER)?.to_str().ok()?;
    if name.is_empty() {
        return None;
    }

    let values = |header: &str| {
        headers
            .get_all(header)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect::<Vec<_>>()
    };

    let user = UserInfo::new(name).with_groups(values(GROUP_HEADER));
    let scopes = values(SCOPES_HEADER);
    if scopes.is_empty() {
        return Some(user);
    }
    Some(user.with_scopes(scopes))
}

fn label_selector(query: Option<&str>) -> Result<Selector, SelectorError> {
    let selector = query.and_then(|q| {
        form_urlencoded::parse(q.as_bytes())
            .find(|(k, _)| k == LABEL_SELECTOR_PARAM)
            .map(|(_, v)| v.into_owned())
    });
    match selector {
        Some(selector) => selector.parse(),
        None => Ok(Selector::everything()),
    }
}

fn status_response(
    code: http::StatusCode,
    reason: &str,
    message: impl Into<String>,
) -> Result<Response<Body>, Error> {
    let status = Status {
        code: Some(code.as_u16().into()),
        message: Some(message.into()),
        reason: Some(reason.to_string()),
        status: Some("Failure".to_string()),
        ..Default::default()
    };
    json_response(code, &status)
}

fn json_response<T: Serialize>(code: http::StatusCode, body: &T) -> Result<Response<Body>, Error> {
    let bytes = serde_json::to_vec(body)?;
    Ok(Response::builder()
        .status(code)
        .header(http::header::CONTENT_TYPE, "application/json")
        .body(Body::from(bytes))
        .expect("project list response must be valid"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        core::{CacheWatcher, Lister, RbacLister},
        index::RbacIndex,
        k8s::{self, Labels, NamespaceList, ObjectMeta},
    };
    use http_body_util::BodyExt;
    use pretty_assertions::assert_eq;
    use rstest::rstest;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        time::Duration,
    };
    use tower::Service;

    /// Lists a fixed set of namespaces, recording who asked.
    #[derive(Default)]
    struct FakeCache {
        ready: AtomicBool,
        users: Mutex<Vec<UserInfo>>,
        namespaces: Vec<k8s::Namespace>,
    }

    impl Lister for FakeCache {
        fn list(&self, user: &UserInfo, selector: &Selector) -> anyhow::Result<NamespaceList> {
            self.users.lock().unwrap().push(user.clone());
            let items = self
                .namespaces
                .iter()
                .filter(|ns| selector.matches(&Labels::from(ns.metadata.labels.clone())))
                .cloned()
                .collect();
            Ok(NamespaceList {
                items,
                metadata: Default::default(),
            })
        }
    }

    #[async_trait::async_trait]
    impl AuthorizationCache for FakeCache {
        async fn run(self: Arc<Self>, _: Duration, _: drain::Watch) {}

        fn ready_for_access(&self) -> bool {
            self.ready.load(Ordering::SeqCst)
        }

        fn add_watcher(&self, _: Arc<dyn CacheWatcher>) {}

        fn remove_watcher(&self, _: &Arc<dyn CacheWatcher>) {}

        fn cluster_role_lister(&self) -> Arc<dyn RbacLister> {
            RbacIndex::shared()
        }
    }

    fn mk_namespace(name: &str, labels: &[(&str, &str)]) -> k8s::Namespace {
        k8s::Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn mk_projects(ready: bool) -> (Arc<FakeCache>, Projects) {
        let cache = Arc::new(FakeCache {
            ready: AtomicBool::new(ready),
            namespaces: vec![
                mk_namespace("foo", &[("env", "prod")]),
                mk_namespace("bar", &[("env", "dev")]),
            ],
            ..Default::default()
        });
        (cache.clone(), Projects::new(cache))
    }

    async fn body_json(rsp: Response<Body>) -> serde_json::Value {
        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn lists_projects_for_the_remote_user() {
        let (cache, mut projects) = mk_projects(true);
        let req = Request::get("/projects?labelSelector=env%3Dprod")
            .header("X-Remote-User", "alice")
            .header("X-Remote-Group", "eng")
            .header("X-Remote-Group", "ops")
            .header(
                "X-Remote-Extra-Scopes.authorization.openshift.io",
                "role:view:foo",
            )
            .body(())
            .unwrap();

        let rsp = projects.call(req).await.unwrap();
        assert_eq!(rsp.status(), http::StatusCode::OK);
        assert_eq!(
            rsp.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let body = body_json(rsp).await;
        assert_eq!(body["kind"], "NamespaceList");
        let names = body["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|ns| ns["metadata"]["name"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, ["foo"]);

        let users = cache.users.lock().unwrap();
        assert_eq!(
            *users,
            [UserInfo::new("alice")
                .with_groups(["eng", "ops"])
                .with_scopes(["role:view:foo"])]
        );
    }

    #[tokio::test]
    async fn lists_everything_without_a_selector() {
        let (cache, mut projects) = mk_projects(true);
        let req = Request::get("/projects")
            .header("X-Remote-User", "bob")
            .body(())
            .unwrap();

        let rsp = projects.call(req).await.unwrap();
        assert_eq!(rsp.status(), http::StatusCode::OK);
        assert_eq!(body_json(rsp).await["items"].as_array().unwrap().len(), 2);
        assert_eq!(*cache.users.lock().unwrap(), [UserInfo::new("bob")]);
    }

    #[tokio::test]
    async fn head_requests_have_no_body() {
        let (cache, mut projects) = mk_projects(true);
        let req = Request::head("/projects")
            .header("X-Remote-User", "bob")
            .body(())
            .unwrap();

        let rsp = projects.call(req).await.unwrap();
        assert_eq!(rsp.status(), http::StatusCode::OK);
        assert_eq!(
            rsp.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/json"
        );
        let bytes = rsp.into_body().collect().await.unwrap().to_bytes();
        assert!(bytes.is_empty());
        assert_eq!(*cache.users.lock().unwrap(), [UserInfo::new("bob")]);
    }

    #[rstest]
    #[case::unknown_path(true, "GET", "/namespaces", Some("alice"), http::StatusCode::NOT_FOUND)]
    #[case::bad_method(true, "POST", "/projects", Some("alice"), http::StatusCode::METHOD_NOT_ALLOWED)]
    #[case::not_ready(false, "GET", "/projects", Some("alice"), http::StatusCode::SERVICE_UNAVAILABLE)]
    #[case::anonymous(true, "GET", "/projects", None, http::StatusCode::UNAUTHORIZED)]
    #[case::empty_user(true, "GET", "/projects", Some(""), http::StatusCode::UNAUTHORIZED)]
    #[case::bad_selector(
        true,
        "GET",
        "/projects?labelSelector=env%20in%20(prod",
        Some("alice"),
        http::StatusCode::BAD_REQUEST
    )]
    #[tokio::test]
    async fn rejects_requests(
        #[case] ready: bool,
        #[case] method: &str,
        #[case] uri: &str,
        #[case] user: Option<&str>,
        #[case] expected: http::StatusCode,
    ) {
        let (cache, mut projects) = mk_projects(ready);
        let mut req = Request::builder().method(method).uri(uri);
        if let Some(user) = user {
            req = req.header("X-Remote-User", user);
        }

        let rsp = projects.call(req.body(()).unwrap()).await.unwrap();
        assert_eq!(rsp.status(), expected);
        let body = body_json(rsp).await;
        assert_eq!(body["kind"], "Status");
        assert_eq!(body["code"], expected.as_u16());
        assert!(cache.users.lock().unwrap().is_empty());
    }
}
