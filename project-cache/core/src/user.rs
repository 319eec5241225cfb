use std::collections::BTreeMap;

/// The user extra key under which scopes are carried.
pub const SCOPES_EXTRA_KEY: &str = "scopes.authorization.openshift.io";

/// Describes an authenticated user.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct UserInfo {
    pub name: String,
    pub uid: String,
    pub groups: Vec<String>,
    pub extra: BTreeMap<String, Vec<String>>,
}

// === impl UserInfo ===

impl UserInfo {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_groups(mut self, groups: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.groups = groups.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_scopes(mut self, scopes: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.extra.insert(
            SCOPES_EXTRA_KEY.to_string(),
            scopes.into_iter().map(Into::into).collect(),
        );
        self
    }

    pub fn scopes(&self) -> &[String] {
        self.extra
            .get(SCOPES_EXTRA_KEY)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }
}
