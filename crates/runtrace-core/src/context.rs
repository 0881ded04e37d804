//! Tags and metadata: bound/call-time configuration and the context resolved
//! for each run when it starts.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Tags, metadata and an optional display name attached to a unit, either
/// bound to it ahead of time or supplied by the caller for one invocation.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Overrides the unit's own name in emitted events.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_name: Option<String>,
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        push_unique(&mut self.tags, tag.into());
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for tag in tags {
            push_unique(&mut self.tags, tag.into());
        }
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn named(mut self, run_name: impl Into<String>) -> Self {
        self.run_name = Some(run_name.into());
        self
    }

    /// Layers `overlay` on top of `self`: tags are unioned, metadata keys from
    /// `overlay` win, and its run name replaces ours when set.
    pub fn merge(&self, overlay: &RunConfig) -> RunConfig {
        let mut merged = self.clone();
        for tag in &overlay.tags {
            push_unique(&mut merged.tags, tag.clone());
        }
        merged
            .metadata
            .extend(overlay.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        if overlay.run_name.is_some() {
            merged.run_name.clone_from(&overlay.run_name);
        }
        merged
    }
}

fn push_unique(tags: &mut Vec<String>, tag: String) {
    if !tags.contains(&tag) {
        tags.push(tag);
    }
}

/// Tags and metadata in effect for one run, fixed when the run starts.
///
/// Always a superset of the parent's context: parent tags come first, then the
/// run's own tags not already present; own metadata values override the
/// parent's on key collision.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedContext {
    tags: Vec<String>,
    metadata: BTreeMap<String, Value>,
}

impl ResolvedContext {
    /// Context of a run with no parent.
    pub fn root(own: &RunConfig) -> Self {
        Self::default().inherit(own)
    }

    /// Context of a child run started under `self`.
    pub fn inherit(&self, own: &RunConfig) -> Self {
        let mut tags = self.tags.clone();
        for tag in &own.tags {
            push_unique(&mut tags, tag.clone());
        }
        let mut metadata = self.metadata.clone();
        metadata.extend(own.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        Self { tags, metadata }
    }

    pub fn tags(&self) -> &[String] {
        &self.tags
    }

    pub fn metadata(&self) -> &BTreeMap<String, Value> {
        &self.metadata
    }
}
