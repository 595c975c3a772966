//! Lease registration record

use serde::{Deserialize, Serialize};

/// Description of a service registered with the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    /// Display name, also the routing key on the relay
    pub name: String,
    /// Application protocols served on relayed connections (e.g. "http/1.1")
    pub protocols: Vec<String>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub owner: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Hide the lease from public listings
    #[serde(default)]
    pub hide: bool,
}

impl Lease {
    pub fn new<I, S>(name: impl Into<String>, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            protocols: protocols.into_iter().map(Into::into).collect(),
            description: String::new(),
            owner: String::new(),
            tags: Vec::new(),
            hide: false,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = owner.into();
        self
    }

    /// Set the tags. Entries are trimmed; blanks and duplicates are dropped.
    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.tags.clear();
        for tag in tags {
            let tag = tag.as_ref().trim();
            if !tag.is_empty() && !self.tags.iter().any(|t| t == tag) {
                self.tags.push(tag.to_string());
            }
        }
        self
    }

    pub fn with_hide(mut self, hide: bool) -> Self {
        self.hide = hide;
        self
    }
}
