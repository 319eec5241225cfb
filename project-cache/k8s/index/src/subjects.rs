use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use project_cache_core::UserInfo;
use std::collections::BTreeSet;

/// Inverted indices from subjects to the namespaces they may see.
#[derive(Debug, Default)]
pub(crate) struct SubjectIndex {
    users: HashMap<String, HashSet<String>>,
    groups: HashMap<String, HashSet<String>>,
}

// === impl SubjectIndex ===

impl SubjectIndex {
    pub(crate) fn insert(
        &mut self,
        namespace: &str,
        users: &HashSet<String>,
        groups: &HashSet<String>,
    ) {
        for user in users {
            self.users
                .entry(user.clone())
                .or_default()
                .insert(namespace.to_string());
        }
        for group in groups {
            self.groups
                .entry(group.clone())
                .or_default()
                .insert(namespace.to_string());
        }
    }

    pub(crate) fn remove(
        &mut self,
        namespace: &str,
        users: &HashSet<String>,
        groups: &HashSet<String>,
    ) {
        for user in users {
            remove_from(&mut self.users, user, namespace);
        }
        for group in groups {
            remove_from(&mut self.groups, group, namespace);
        }
    }

    /// Removes a namespace from every subject, dropping subjects that no longer see anything.
    pub(crate) fn scrub(&mut self, namespace: &str) {
        for index in [&mut self.users, &mut self.groups] {
            index.retain(|_, namespaces| {
                namespaces.remove(namespace);
                !namespaces.is_empty()
            });
        }
    }

    /// Returns the namespaces visible to a user directly or through any of its groups.
    pub(crate) fn visible(&self, user: &UserInfo) -> BTreeSet<String> {
        let mut namespaces = BTreeSet::new();
        if let Some(nss) = self.users.get(&user.name) {
            namespaces.extend(nss.iter().cloned());
        }
        for group in &user.groups {
            if let Some(nss) = self.groups.get(group) {
                namespaces.extend(nss.iter().cloned());
            }
        }
        namespaces
    }

    pub(crate) fn users_len(&self) -> usize {
        self.users.len()
    }

    pub(crate) fn groups_len(&self) -> usize {
        self.groups.len()
    }

    #[cfg(test)]
    pub(crate) fn references(&self, namespace: &str) -> bool {
        self.users
            .values()
            .chain(self.groups.values())
            .any(|nss| nss.contains(namespace))
    }
}

fn remove_from(index: &mut HashMap<String, HashSet<String>>, subject: &str, namespace: &str) {
    if let Some(namespaces) = index.get_mut(subject) {
        namespaces.remove(namespace);
        if namespaces.is_empty() {
            index.remove(subject);
        }
    }
}
