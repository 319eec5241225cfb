use crate::core::{Review, Reviewer};
use anyhow::{Context, Result};
use hyper::http;
use serde::{Deserialize, Serialize};

const API_GROUP: &str = "authorization.openshift.io";
const API_VERSION: &str = "authorization.openshift.io/v1";

/// Asks the API server which subjects may `get` a namespace.
#[derive(Clone)]
pub struct AccessReviewer {
    client: kube::Client,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LocalResourceAccessReview<'a> {
    kind: &'static str,
    api_version: &'static str,
    namespace: &'a str,
    verb: &'static str,
    #[serde(rename = "resourceAPIGroup")]
    resource_api_group: &'static str,
    resource: &'static str,
    resource_name: &'a str,
}

#[derive(Debug, Default, Deserialize)]
struct ResourceAccessReviewResponse {
    #[serde(default)]
    users: Option<Vec<String>>,

    #[serde(default)]
    groups: Option<Vec<String>>,

    // The API spells this field without the second "a".
    #[serde(default, rename = "evalutionError")]
    evaluation_error: String,
}

// === impl AccessReviewer ===

impl AccessReviewer {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait::async_trait]
impl Reviewer for AccessReviewer {
    async fn review(&self, namespace: &str) -> Result<Review> {
        let req = review_request(namespace)?;
        let rsp = self
            .client
            .request::<ResourceAccessReviewResponse>(req)
            .await
            .with_context(|| format!("failed to review access to namespace {namespace}"))?;
        tracing::trace!(%namespace, ?rsp, "Reviewed");
        Ok(rsp.into())
    }
}

fn review_request(namespace: &str) -> Result<http::Request<Vec<u8>>> {
    let body = serde_json::to_vec(&LocalResourceAccessReview {
        kind: "LocalResourceAccessReview",
        api_version: API_VERSION,
        namespace,
        verb: "get",
        resource_api_group: "",
        resource: "namespaces",
        resource_name: namespace,
    })?;
    let req = http::Request::post(format!(
        "/apis/{API_GROUP}/v1/namespaces/{namespace}/localresourceaccessreviews"
    ))
    .header(http::header::CONTENT_TYPE, "application/json")
    .body(body)?;
    Ok(req)
}

impl From<ResourceAccessReviewResponse> for Review {
    fn from(rsp: ResourceAccessReviewResponse) -> Self {
        Review::new(
            rsp.users.unwrap_or_default(),
            rsp.groups.unwrap_or_default(),
        )
        .with_evaluation_error(rsp.evaluation_error)
    }
}
