use anyhow::Result;

/// The subjects that may access a namespace, as reported by a [`Reviewer`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Review {
    users: Vec<String>,
    groups: Vec<String>,
    evaluation_error: Option<String>,
}

/// Answers "who can access this namespace right now".
///
/// Implementations typically call out to the API server, so reviews may be slow.
#[async_trait::async_trait]
pub trait Reviewer: Send + Sync {
    async fn review(&self, namespace: &str) -> Result<Review>;
}

// === impl Review ===

impl Review {
    pub fn new(
        users: impl IntoIterator<Item = impl Into<String>>,
        groups: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            users: users.into_iter().map(Into::into).collect(),
            groups: groups.into_iter().map(Into::into).collect(),
            evaluation_error: None,
        }
    }

    /// Records a partial evaluation failure. Empty messages are ignored.
    pub fn with_evaluation_error(mut self, error: impl Into<String>) -> Self {
        let error = error.into();
        self.evaluation_error = if error.is_empty() { None } else { Some(error) };
        self
    }

    pub fn users(&self) -> &[String] {
        &self.users
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn evaluation_error(&self) -> Option<&str> {
        self.evaluation_error.as_deref()
    }
}
