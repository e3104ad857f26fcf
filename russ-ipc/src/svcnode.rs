// Copyright 2021-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The service dispatch tree. Built once at server init and read-only
//! while serving; children are kept sorted by name.

use std::sync::Arc;

use crate::error::{Error, Result};
use crate::server::Session;

/// Handler invoked for requests dispatched to a node. Shared across the
/// serving tasks, so it must be `Send + Sync`.
pub type Handler = Arc<dyn Fn(&mut Session) -> Result<()> + Send + Sync>;

pub struct SvcNode {
    name: String,
    handler: Option<Handler>,
    autoanswer: bool,
    virtual_: bool,
    wildcard: bool,
    children: Vec<SvcNode>,
}

impl std::fmt::Debug for SvcNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SvcNode")
            .field("name", &self.name)
            .field("handler", &self.handler.as_ref().map(|_| "<handler>"))
            .field("autoanswer", &self.autoanswer)
            .field("virtual_", &self.virtual_)
            .field("wildcard", &self.wildcard)
            .field("children", &self.children)
            .finish()
    }
}

impl SvcNode {
    /// New node. Defaults: autoanswer on, not virtual, not wildcard.
    pub fn new(name: &str, handler: Option<Handler>) -> SvcNode {
        SvcNode {
            name: name.to_string(),
            handler,
            autoanswer: true,
            virtual_: false,
            wildcard: false,
            children: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn handler(&self) -> Option<&Handler> {
        self.handler.as_ref()
    }

    pub fn autoanswer(&self) -> bool {
        self.autoanswer
    }

    pub fn is_virtual(&self) -> bool {
        self.virtual_
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard
    }

    pub fn set_handler(&mut self, handler: Option<Handler>) -> &mut Self {
        self.handler = handler;
        self
    }

    pub fn set_autoanswer(&mut self, value: bool) -> &mut Self {
        self.autoanswer = value;
        self
    }

    /// A virtual node's handler claims the entire remaining sub-path.
    pub fn set_virtual(&mut self, value: bool) -> &mut Self {
        self.virtual_ = value;
        self
    }

    /// A wildcard node matches any single path component.
    pub fn set_wildcard(&mut self, value: bool) -> &mut Self {
        self.wildcard = value;
        self
    }

    /// Insert a child, keeping children sorted by name. Fails on a
    /// duplicate name without mutating the tree.
    pub fn add(&mut self, name: &str, handler: Option<Handler>) -> Result<&mut SvcNode> {
        match self.children.binary_search_by(|c| c.name.as_str().cmp(name)) {
            Ok(_) => Err(Error::bad_args(format!("duplicate service name: {name}"))),
            Err(at) => {
                self.children.insert(at, SvcNode::new(name, handler));
                Ok(&mut self.children[at])
            }
        }
    }

    /// Child names in sorted order, for `list` answers.
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.iter().map(|c| c.name.as_str())
    }

    pub fn has_children(&self) -> bool {
        !self.children.is_empty()
    }

    /// Descend the tree matching each slash-delimited component. An exact
    /// child wins over a wildcard sibling; a virtual node short-circuits
    /// with the remaining path left to its handler. Matched segments are
    /// accumulated (slash-separated) while descending, bounded by
    /// `mpath_cap`; overflow fails the search.
    pub fn find(&self, path: &str, mpath_cap: usize) -> Option<(&SvcNode, String)> {
        let mut mpath = String::new();
        let node = self.find_inner(path.trim_start_matches('/'), &mut mpath, mpath_cap)?;
        Some((node, mpath))
    }

    fn find_inner<'a>(&'a self, path: &str, mpath: &mut String, cap: usize) -> Option<&'a SvcNode> {
        if self.virtual_ || path.is_empty() {
            return Some(self);
        }
        let (comp, rest) = match path.split_once('/') {
            Some((c, r)) => (c, r),
            None => (path, ""),
        };

        let mut chosen: Option<&SvcNode> = None;
        for child in &self.children {
            if child.wildcard {
                continue;
            }
            match child.name.as_str().cmp(comp) {
                std::cmp::Ordering::Equal => {
                    chosen = Some(child);
                    break;
                }
                // sorted children: once past the probe, no exact match left
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Less => {}
            }
        }
        // wildcards are consulted only when no exact match succeeds
        let chosen = chosen.or_else(|| self.children.iter().find(|c| c.wildcard))?;

        if rest.is_empty() {
            return Some(chosen);
        }
        if mpath.len() + 1 + chosen.name.len() > cap {
            return None;
        }
        mpath.push('/');
        mpath.push_str(&chosen.name);
        chosen.find_inner(rest, mpath, cap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tree() -> SvcNode {
        let mut root = SvcNode::new("", None);
        root.add("bar", None).unwrap();
        root.add("foo", None).unwrap();
        let n = root.add("*", None).unwrap();
        n.set_wildcard(true);
        root
    }

    #[test]
    fn test_children_stay_sorted() {
        let root = tree();
        let names: Vec<&str> = root.child_names().collect();
        assert_eq!(names, vec!["*", "bar", "foo"]);
    }

    #[test]
    fn test_duplicate_add_fails_without_mutation() {
        let mut root = tree();
        root.add("foo", None).unwrap_err();
        assert_eq!(root.child_names().count(), 3);
    }

    #[test]
    fn test_exact_match_beats_wildcard() {
        let root = tree();
        let (node, _) = root.find("/foo", 4096).unwrap();
        assert_eq!(node.name(), "foo");
    }

    #[test]
    fn test_wildcard_matches_any_single_component() {
        let root = tree();
        let (node, _) = root.find("/quux", 4096).unwrap();
        assert_eq!(node.name(), "*");
    }

    #[test]
    fn test_no_match_without_wildcard() {
        let mut root = SvcNode::new("", None);
        root.add("a", None).unwrap();
        assert!(root.find("/b", 4096).is_none());
    }

    #[test]
    fn test_virtual_short_circuits() {
        let mut root = SvcNode::new("", None);
        let v = root.add("v", None).unwrap();
        v.set_virtual(true);
        v.add("unreachable", None).unwrap();
        let (node, mpath) = root.find("/v/deep/below", 4096).unwrap();
        assert_eq!(node.name(), "v");
        assert_eq!(mpath, "/v");
    }

    #[test]
    fn test_matched_path_accumulates_while_descending() {
        let mut root = SvcNode::new("", None);
        root.add("a", None).unwrap().add("b", None).unwrap().add("c", None).unwrap();
        let (node, mpath) = root.find("/a/b/c", 4096).unwrap();
        assert_eq!(node.name(), "c");
        // the final component is not part of the descent prefix
        assert_eq!(mpath, "/a/b");
    }

    #[test]
    fn test_matched_path_capacity_overflow_fails() {
        let mut root = SvcNode::new("", None);
        root.add("longname", None).unwrap().add("x", None).unwrap();
        assert!(root.find("/longname/x", 4).is_none());
    }

    #[test]
    fn test_empty_path_matches_root() {
        let root = tree();
        let (node, mpath) = root.find("/", 4096).unwrap();
        assert_eq!(node.name(), "");
        assert_eq!(mpath, "");
    }
}
