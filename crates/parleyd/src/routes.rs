//! Route tree: finds the handler for an event inside a session.
//!
//! A [`RouteTree`] is an ordered list of [`RouteNode`]s. Dispatch walks the
//! enabled ordinary nodes in order, then the enabled fallback nodes; the
//! first node whose matcher accepts the event runs its handler. A handler
//! that returns `false` declines the event and the walk continues.
//!
//! Nodes may carry a group name so related routes can be enabled,
//! disabled or removed together without changing the list order.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use parley_core::{Event, EventKind};
use regex::Regex;
use tracing::trace;

use crate::session::SessionContext;

/// Async route handler over session state `S`.
///
/// Resolves to `true` if it consumed the event.
pub type RouteHandler<S> = Arc<
    dyn for<'a> Fn(&'a mut S, &'a mut SessionContext, &'a Event) -> BoxFuture<'a, bool>
        + Send
        + Sync,
>;

/// Event test for [`Matcher::Predicate`].
pub type EventPredicate = Arc<dyn Fn(&Event) -> bool + Send + Sync>;

// ============================================================================
// Matchers
// ============================================================================

/// Match criteria of one route node.
///
/// Two matchers are equal only if they are the same variant with the same
/// criteria. Content patterns compare by source text, predicates by name.
#[derive(Clone)]
pub enum Matcher {
    /// Bare command names, without the leading `/`.
    Command(BTreeSet<String>),
    /// Regular expression searched in the event text.
    Content(Regex),
    /// Event kinds.
    Kind(BTreeSet<EventKind>),
    /// Named custom test.
    Predicate { name: String, test: EventPredicate },
    /// Matches everything; tried after all ordinary nodes.
    Fallback,
}

impl Matcher {
    pub fn matches(&self, event: &Event) -> bool {
        match self {
            Self::Command(names) => {
                command_name(event.text()).is_some_and(|name| names.contains(name))
            }
            Self::Content(pattern) => event.text.as_deref().is_some_and(|t| pattern.is_match(t)),
            Self::Kind(kinds) => kinds.contains(&event.kind),
            Self::Predicate { test, .. } => test(event),
            Self::Fallback => true,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::Fallback)
    }
}

impl PartialEq for Matcher {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Command(a), Self::Command(b)) => a == b,
            (Self::Content(a), Self::Content(b)) => a.as_str() == b.as_str(),
            (Self::Kind(a), Self::Kind(b)) => a == b,
            (Self::Predicate { name: a, .. }, Self::Predicate { name: b, .. }) => a == b,
            (Self::Fallback, Self::Fallback) => true,
            _ => false,
        }
    }
}

impl Eq for Matcher {}

impl fmt::Debug for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Command(names) => f.debug_tuple("Command").field(names).finish(),
            Self::Content(pattern) => f.debug_tuple("Content").field(&pattern.as_str()).finish(),
            Self::Kind(kinds) => f.debug_tuple("Kind").field(kinds).finish(),
            Self::Predicate { name, .. } => f.debug_struct("Predicate").field("name", name).finish(),
            Self::Fallback => write!(f, "Fallback"),
        }
    }
}

/// Extracts the first command in `text`, e.g. `"start"` from
/// `"hey /start@my_bot now"`.
///
/// The `@bot` suffix is dropped. Returns `None` if no token starts with
/// `/` followed by at least one character.
pub fn command_name(text: &str) -> Option<&str> {
    text.split_whitespace()
        .filter_map(|token| token.strip_prefix('/'))
        .map(|body| body.split('@').next().unwrap_or(body))
        .find(|name| !name.is_empty())
}

// ============================================================================
// Nodes
// ============================================================================

/// One route: matcher, handler, enabled flag and optional group.
pub struct RouteNode<S> {
    matcher: Matcher,
    handler: RouteHandler<S>,
    enabled: bool,
    group: Option<String>,
}

impl<S> Clone for RouteNode<S> {
    fn clone(&self) -> Self {
        Self {
            matcher: self.matcher.clone(),
            handler: Arc::clone(&self.handler),
            enabled: self.enabled,
            group: self.group.clone(),
        }
    }
}

impl<S> RouteNode<S> {
    /// Creates an enabled, ungrouped node.
    pub fn new<F>(matcher: Matcher, handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut SessionContext, &'a Event) -> BoxFuture<'a, bool>
            + Send
            + Sync
            + 'static,
    {
        Self {
            matcher,
            handler: Arc::new(handler),
            enabled: true,
            group: None,
        }
    }

    /// Matches any of the given command names.
    pub fn command<I, N, F>(names: I, handler: F) -> Self
    where
        I: IntoIterator<Item = N>,
        N: Into<String>,
        F: for<'a> Fn(&'a mut S, &'a mut SessionContext, &'a Event) -> BoxFuture<'a, bool>
            + Send
            + Sync
            + 'static,
    {
        let names = names.into_iter().map(Into::into).collect();
        Self::new(Matcher::Command(names), handler)
    }

    /// Matches event text against a regular expression.
    pub fn content<F>(pattern: &str, handler: F) -> Result<Self, regex::Error>
    where
        F: for<'a> Fn(&'a mut S, &'a mut SessionContext, &'a Event) -> BoxFuture<'a, bool>
            + Send
            + Sync
            + 'static,
    {
        Ok(Self::new(Matcher::Content(Regex::new(pattern)?), handler))
    }

    /// Matches any of the given event kinds.
    pub fn kind<I, F>(kinds: I, handler: F) -> Self
    where
        I: IntoIterator<Item = EventKind>,
        F: for<'a> Fn(&'a mut S, &'a mut SessionContext, &'a Event) -> BoxFuture<'a, bool>
            + Send
            + Sync
            + 'static,
    {
        Self::new(Matcher::Kind(kinds.into_iter().collect()), handler)
    }

    /// Matches events accepted by a named predicate.
    pub fn predicate<P, F>(name: impl Into<String>, test: P, handler: F) -> Self
    where
        P: Fn(&Event) -> bool + Send + Sync + 'static,
        F: for<'a> Fn(&'a mut S, &'a mut SessionContext, &'a Event) -> BoxFuture<'a, bool>
            + Send
            + Sync
            + 'static,
    {
        Self::new(
            Matcher::Predicate {
                name: name.into(),
                test: Arc::new(test),
            },
            handler,
        )
    }

    /// Catch-all node.
    pub fn fallback<F>(handler: F) -> Self
    where
        F: for<'a> Fn(&'a mut S, &'a mut SessionContext, &'a Event) -> BoxFuture<'a, bool>
            + Send
            + Sync
            + 'static,
    {
        Self::new(Matcher::Fallback, handler)
    }

    #[must_use]
    pub fn in_group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    #[must_use]
    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn matcher(&self) -> &Matcher {
        &self.matcher
    }

    pub fn group(&self) -> Option<&str> {
        self.group.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }
}

impl<S> fmt::Debug for RouteNode<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RouteNode")
            .field("matcher", &self.matcher)
            .field("enabled", &self.enabled)
            .field("group", &self.group)
            .finish()
    }
}

// ============================================================================
// Tree
// ============================================================================

/// A deferred change to a session's route tree, requested from inside a
/// handler and applied once the current dispatch has finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteEdit {
    EnableGroup(String),
    DisableGroup(String),
    RemoveGroup(String),
}

/// Ordered route list. First match wins.
pub struct RouteTree<S> {
    nodes: Vec<RouteNode<S>>,
}

impl<S> RouteTree<S> {
    pub fn new() -> Self {
        Self { nodes: Vec::new() }
    }

    /// Appends a node, builder style.
    #[must_use]
    pub fn with(mut self, node: RouteNode<S>) -> Self {
        self.nodes.push(node);
        self
    }

    pub fn push(&mut self, node: RouteNode<S>) {
        self.nodes.push(node);
    }

    /// Removes every node whose matcher equals `matcher`.
    pub fn remove(&mut self, matcher: &Matcher) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.matcher != *matcher);
        before - self.nodes.len()
    }

    pub fn contains(&self, matcher: &Matcher) -> bool {
        self.nodes.iter().any(|node| node.matcher == *matcher)
    }

    /// Enables every node in `group`. Returns how many nodes it touched.
    pub fn enable_group(&mut self, group: &str) -> usize {
        self.set_group_enabled(group, true)
    }

    /// Disables every node in `group`. Returns how many nodes it touched.
    pub fn disable_group(&mut self, group: &str) -> usize {
        self.set_group_enabled(group, false)
    }

    /// Removes every node in `group`.
    pub fn remove_group(&mut self, group: &str) -> usize {
        let before = self.nodes.len();
        self.nodes.retain(|node| node.group() != Some(group));
        before - self.nodes.len()
    }

    pub fn apply(&mut self, edit: &RouteEdit) -> usize {
        match edit {
            RouteEdit::EnableGroup(group) => self.enable_group(group),
            RouteEdit::DisableGroup(group) => self.disable_group(group),
            RouteEdit::RemoveGroup(group) => self.remove_group(group),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn nodes(&self) -> &[RouteNode<S>] {
        &self.nodes
    }

    fn set_group_enabled(&mut self, group: &str, enabled: bool) -> usize {
        let mut touched = 0;
        for node in self.nodes.iter_mut().filter(|n| n.group() == Some(group)) {
            node.enabled = enabled;
            touched += 1;
        }
        touched
    }
}

impl<S: Send> RouteTree<S> {
    /// Offers `event` to the tree. Returns true if a handler consumed it.
    pub async fn dispatch(&self, state: &mut S, ctx: &mut SessionContext, event: &Event) -> bool {
        let ordinary = self
            .nodes
            .iter()
            .filter(|node| node.enabled && !node.matcher.is_fallback());
        let fallbacks = self
            .nodes
            .iter()
            .filter(|node| node.enabled && node.matcher.is_fallback());

        for node in ordinary.chain(fallbacks) {
            if !node.matcher.matches(event) {
                continue;
            }
            if (node.handler)(state, ctx, event).await {
                return true;
            }
            trace!(matcher = ?node.matcher, "Route declined event");
        }
        false
    }
}

impl<S> Default for RouteTree<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> fmt::Debug for RouteTree<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(&self.nodes).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::context::testing::detached_context;
    use futures::FutureExt;

    #[derive(Default)]
    struct Trace {
        hits: Vec<&'static str>,
    }

    fn record(matcher: Matcher, label: &'static str, consume: bool) -> RouteNode<Trace> {
        RouteNode::<Trace>::new(matcher, move |state, _ctx, _event| {
            state.hits.push(label);
            async move { consume }.boxed()
        })
    }

    fn commands(names: &[&str]) -> Matcher {
        Matcher::Command(names.iter().map(|n| n.to_string()).collect())
    }

    #[test]
    fn test_command_name_extraction() {
        assert_eq!(command_name("/start"), Some("start"));
        assert_eq!(command_name("/start@my_bot arg"), Some("start"));
        assert_eq!(command_name("hey /help now"), Some("help"));
        assert_eq!(command_name("/ /echo"), Some("echo"));
        assert_eq!(command_name("no command"), None);
        assert_eq!(command_name(""), None);
    }

    #[test]
    fn test_command_matching_is_case_sensitive() {
        let matcher = commands(&["start"]);
        assert!(matcher.matches(&Event::message(1, 1, "/start@bot")));
        assert!(!matcher.matches(&Event::message(1, 1, "/Start")));
        assert!(!matcher.matches(&Event::message(1, 1, "start")));
    }

    #[test]
    fn test_matcher_equality_uses_criteria() {
        assert_eq!(commands(&["a", "b"]), commands(&["b", "a"]));
        assert_ne!(commands(&["a"]), commands(&["b"]));
        assert_eq!(
            Matcher::Content(Regex::new("^hi").unwrap()),
            Matcher::Content(Regex::new("^hi").unwrap())
        );
        assert_ne!(
            Matcher::Content(Regex::new("^hi").unwrap()),
            Matcher::Content(Regex::new("^ho").unwrap())
        );
        assert_ne!(
            Matcher::Kind([EventKind::Message].into_iter().collect()),
            commands(&["message"])
        );
        let p = |name: &str| Matcher::Predicate {
            name: name.to_string(),
            test: Arc::new(|_: &Event| true),
        };
        assert_eq!(p("x"), p("x"));
        assert_ne!(p("x"), p("y"));
        assert_eq!(Matcher::Fallback, Matcher::Fallback);
    }

    #[tokio::test]
    async fn test_declined_command_falls_through_to_catch_all() {
        let tree = RouteTree::new()
            .with(record(commands(&["start"]), "start", false))
            .with(record(Matcher::Fallback, "fallback", true));
        let (mut ctx, _guard) = detached_context();
        let mut state = Trace::default();

        let consumed = tree
            .dispatch(&mut state, &mut ctx, &Event::message(1, 1, "/start"))
            .await;
        assert!(consumed);
        assert_eq!(state.hits, vec!["start", "fallback"]);
    }

    #[tokio::test]
    async fn test_first_match_wins_and_fallback_runs_last() {
        let tree = RouteTree::new()
            .with(record(Matcher::Fallback, "fallback", true))
            .with(record(Matcher::Kind([EventKind::Message].into_iter().collect()), "kind", true))
            .with(record(commands(&["start"]), "start", true));
        let (mut ctx, _guard) = detached_context();
        let mut state = Trace::default();

        assert!(
            tree.dispatch(&mut state, &mut ctx, &Event::message(1, 1, "/start"))
                .await
        );
        assert_eq!(state.hits, vec!["kind"]);

        state.hits.clear();
        assert!(
            tree.dispatch(&mut state, &mut ctx, &Event::new(EventKind::ChatMember))
                .await
        );
        assert_eq!(state.hits, vec!["fallback"]);
    }

    #[tokio::test]
    async fn test_nothing_consumes() {
        let tree = RouteTree::new().with(record(commands(&["start"]), "start", false));
        let (mut ctx, _guard) = detached_context();
        let mut state = Trace::default();

        assert!(
            !tree
                .dispatch(&mut state, &mut ctx, &Event::message(1, 1, "hello"))
                .await
        );
        assert!(state.hits.is_empty());
    }

    #[tokio::test]
    async fn test_groups_toggle_and_remove() {
        let mut tree = RouteTree::new()
            .with(record(commands(&["buy"]), "buy", true).in_group("shop"))
            .with(record(commands(&["sell"]), "sell", true).in_group("shop"))
            .with(record(Matcher::Fallback, "fallback", true));
        let (mut ctx, _guard) = detached_context();
        let mut state = Trace::default();

        assert_eq!(tree.disable_group("shop"), 2);
        tree.dispatch(&mut state, &mut ctx, &Event::message(1, 1, "/buy"))
            .await;
        assert_eq!(state.hits, vec!["fallback"]);

        assert_eq!(tree.apply(&RouteEdit::EnableGroup("shop".into())), 2);
        state.hits.clear();
        tree.dispatch(&mut state, &mut ctx, &Event::message(1, 1, "/sell"))
            .await;
        assert_eq!(state.hits, vec!["sell"]);

        assert_eq!(tree.remove_group("shop"), 2);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree.remove_group("shop"), 0);
    }

    #[tokio::test]
    async fn test_content_and_predicate_nodes() {
        let tree = RouteTree::new()
            .with(
                RouteNode::<Trace>::content(r"(?i)\bhello\b", |s, _c, _e| {
                    s.hits.push("hello");
                    async { true }.boxed()
                })
                .unwrap(),
            )
            .with(RouteNode::<Trace>::predicate(
                "from_admin",
                |e: &Event| e.user_id == Some(1),
                |s, _c, _e| {
                    s.hits.push("admin");
                    async { true }.boxed()
                },
            ));
        let (mut ctx, _guard) = detached_context();
        let mut state = Trace::default();

        tree.dispatch(&mut state, &mut ctx, &Event::message(5, 9, "Hello there"))
            .await;
        tree.dispatch(&mut state, &mut ctx, &Event::message(5, 1, "status"))
            .await;
        assert_eq!(state.hits, vec!["hello", "admin"]);
    }

    #[test]
    fn test_remove_by_matcher() {
        let mut tree = RouteTree::new()
            .with(record(commands(&["a"]), "a", true))
            .with(record(commands(&["b"]), "b", true))
            .with(record(commands(&["a"]), "a2", true));

        assert!(tree.contains(&commands(&["a"])));
        assert_eq!(tree.remove(&commands(&["a"])), 2);
        assert_eq!(tree.len(), 1);
        assert!(!tree.contains(&commands(&["a"])));
        assert!(RouteNode::<Trace>::content("(", |_, _, _| async { true }.boxed()).is_err());
    }
}
