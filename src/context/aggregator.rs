//! Context aggregator: keyword search over the latest fleet snapshot.
//!
//! Each snapshot replaces the working copy wholesale and the three indexes
//! (tools, resources, prompts) are rebuilt from scratch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::task::JoinHandle;

use crate::fleet::{
    CapabilityItem, CapabilityKind, EventBus, FleetContextSnapshot, FleetEvent, Prompt, Resource,
    Tool,
};

use super::index::KeywordIndex;
use super::tokenizer::tokenize;

/// Result limit when neither the query nor the aggregator sets one.
pub const DEFAULT_SEARCH_LIMIT: usize = 50;

const EXACT_NAME_SCORE: u32 = 100;
const NAME_CONTAINS_SCORE: u32 = 50;
const DESCRIPTION_SCORE: u32 = 20;
const URI_SCORE: u32 = 10;
const SHORT_NAME_BONUS: u32 = 5;
const SHORT_NAME_LEN: usize = 20;

// ─── Query / Results ─────────────────────────────────────────────────────────

/// A keyword search.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContextQuery {
    pub query: String,
    /// Families to search; all three when `None`.
    pub kinds: Option<Vec<CapabilityKind>>,
    /// Restrict to one owner.
    pub provider_id: Option<String>,
    pub limit: Option<usize>,
}

impl ContextQuery {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            ..Self::default()
        }
    }

    pub fn kinds(mut self, kinds: impl IntoIterator<Item = CapabilityKind>) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = Some(provider_id.into());
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub item: CapabilityItem,
    pub score: u32,
}

/// Aggregate counts over the working snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextSummary {
    pub total_tools: usize,
    pub available_tools: usize,
    pub total_resources: usize,
    pub available_resources: usize,
    pub total_prompts: usize,
    pub available_prompts: usize,
    pub connected_providers: usize,
    pub total_providers: usize,
    pub last_updated: DateTime<Utc>,
}

/// Items one provider contributes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProviderContext {
    pub tools: Vec<Tool>,
    pub resources: Vec<Resource>,
    pub prompts: Vec<Prompt>,
}

// ─── Aggregator ──────────────────────────────────────────────────────────────

struct Indexed {
    snapshot: Arc<FleetContextSnapshot>,
    tools: KeywordIndex,
    resources: KeywordIndex,
    prompts: KeywordIndex,
}

impl Indexed {
    fn build(snapshot: Arc<FleetContextSnapshot>) -> Self {
        let tools = KeywordIndex::build(snapshot.tools.iter().cloned().map(CapabilityItem::Tool).collect());
        let resources = KeywordIndex::build(
            snapshot
                .resources
                .iter()
                .cloned()
                .map(CapabilityItem::Resource)
                .collect(),
        );
        let prompts =
            KeywordIndex::build(snapshot.prompts.iter().cloned().map(CapabilityItem::Prompt).collect());
        Self {
            snapshot,
            tools,
            resources,
            prompts,
        }
    }

    fn index(&self, kind: CapabilityKind) -> &KeywordIndex {
        match kind {
            CapabilityKind::Tool => &self.tools,
            CapabilityKind::Resource => &self.resources,
            CapabilityKind::Prompt => &self.prompts,
        }
    }
}

/// Searchable view of fleet capabilities. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ContextAggregator {
    inner: Arc<AggregatorInner>,
}

struct AggregatorInner {
    state: RwLock<Arc<Indexed>>,
    default_limit: usize,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for AggregatorInner {
    fn drop(&mut self) {
        if let Some(handle) = self
            .listener
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            handle.abort();
        }
    }
}

impl Default for ContextAggregator {
    fn default() -> Self {
        Self::new(DEFAULT_SEARCH_LIMIT)
    }
}

impl ContextAggregator {
    /// An empty aggregator; `default_limit` applies to queries without a limit.
    pub fn new(default_limit: usize) -> Self {
        Self {
            inner: Arc::new(AggregatorInner {
                state: RwLock::new(Arc::new(Indexed::build(Arc::new(
                    FleetContextSnapshot::empty(),
                )))),
                default_limit,
                listener: Mutex::new(None),
            }),
        }
    }

    fn current(&self) -> Arc<Indexed> {
        self.inner
            .state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Replace the working snapshot and rebuild every index.
    pub fn update_context(&self, snapshot: Arc<FleetContextSnapshot>) {
        let indexed = Arc::new(Indexed::build(snapshot));
        tracing::debug!(
            tools = indexed.tools.item_count(),
            resources = indexed.resources.item_count(),
            prompts = indexed.prompts.item_count(),
            tokens = indexed.tools.token_count()
                + indexed.resources.token_count()
                + indexed.prompts.token_count(),
            "context index rebuilt"
        );
        *self
            .inner
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner) = indexed;
    }

    /// The working snapshot.
    pub fn snapshot(&self) -> Arc<FleetContextSnapshot> {
        Arc::clone(&self.current().snapshot)
    }

    // ── Search ───────────────────────────────────────────────────────────────

    /// Ranked keyword search. An item's score is the best score any query
    /// token gives it; ties are ordered by name. A name equal to the whole
    /// trimmed query counts as an exact match for every token.
    pub fn search(&self, query: &ContextQuery) -> Vec<SearchResult> {
        let tokens = tokenize(&query.query);
        if tokens.is_empty() {
            return Vec::new();
        }
        let whole = query.query.trim().to_lowercase();
        let state = self.current();
        let kinds = query
            .kinds
            .clone()
            .unwrap_or_else(|| CapabilityKind::ALL.to_vec());
        let limit = query.limit.unwrap_or(self.inner.default_limit);

        let mut best: HashMap<(CapabilityKind, &str, &str), (u32, &CapabilityItem)> = HashMap::new();
        for &kind in &kinds {
            let index = state.index(kind);
            for token in &tokens {
                for item in index.lookup(token) {
                    if query
                        .provider_id
                        .as_deref()
                        .is_some_and(|owner| owner != item.provider_id())
                    {
                        continue;
                    }
                    let score = score_item(item, token, &whole);
                    let key = (kind, item.provider_id(), item.identity_key());
                    let entry = best.entry(key).or_insert((score, item));
                    if score > entry.0 {
                        *entry = (score, item);
                    }
                }
            }
        }

        let mut results: Vec<SearchResult> = best
            .into_values()
            .map(|(score, item)| SearchResult {
                item: item.clone(),
                score,
            })
            .collect();
        results.sort_by(|a, b| {
            b.score
                .cmp(&a.score)
                .then_with(|| a.item.name().cmp(b.item.name()))
                .then_with(|| a.item.provider_id().cmp(b.item.provider_id()))
                .then_with(|| a.item.kind().cmp(&b.item.kind()))
                .then_with(|| a.item.identity_key().cmp(b.item.identity_key()))
        });
        results.truncate(limit);
        results
    }

    // ── Views ────────────────────────────────────────────────────────────────

    pub fn all_tools(&self) -> Vec<Tool> {
        self.snapshot().tools.clone()
    }

    pub fn all_resources(&self) -> Vec<Resource> {
        self.snapshot().resources.clone()
    }

    pub fn all_prompts(&self) -> Vec<Prompt> {
        self.snapshot().prompts.clone()
    }

    /// Tools whose owner is Running.
    pub fn available_tools(&self) -> Vec<Tool> {
        let snapshot = self.snapshot();
        available(&snapshot, &snapshot.tools, |t| &t.provider_id)
    }

    pub fn available_resources(&self) -> Vec<Resource> {
        let snapshot = self.snapshot();
        available(&snapshot, &snapshot.resources, |r| &r.provider_id)
    }

    pub fn available_prompts(&self) -> Vec<Prompt> {
        let snapshot = self.snapshot();
        available(&snapshot, &snapshot.prompts, |p| &p.provider_id)
    }

    /// Everything one provider contributes.
    pub fn provider_context(&self, provider_id: &str) -> ProviderContext {
        let snapshot = self.snapshot();
        ProviderContext {
            tools: owned_by(&snapshot.tools, provider_id, |t| &t.provider_id),
            resources: owned_by(&snapshot.resources, provider_id, |r| &r.provider_id),
            prompts: owned_by(&snapshot.prompts, provider_id, |p| &p.provider_id),
        }
    }

    /// Per-provider breakdown, keyed by provider id.
    pub fn context_by_provider(&self) -> BTreeMap<String, ProviderContext> {
        let snapshot = self.snapshot();
        let mut breakdown: BTreeMap<String, ProviderContext> = snapshot
            .providers
            .iter()
            .map(|p| (p.id.clone(), ProviderContext::default()))
            .collect();
        for tool in &snapshot.tools {
            breakdown.entry(tool.provider_id.clone()).or_default().tools.push(tool.clone());
        }
        for resource in &snapshot.resources {
            breakdown
                .entry(resource.provider_id.clone())
                .or_default()
                .resources
                .push(resource.clone());
        }
        for prompt in &snapshot.prompts {
            breakdown
                .entry(prompt.provider_id.clone())
                .or_default()
                .prompts
                .push(prompt.clone());
        }
        breakdown
    }

    pub fn find_tool(&self, provider_id: &str, name: &str) -> Option<Tool> {
        self.snapshot()
            .tools
            .iter()
            .find(|t| t.provider_id == provider_id && t.name == name)
            .cloned()
    }

    /// Counts only; never touches the indexes.
    pub fn get_context_summary(&self) -> ContextSummary {
        let snapshot = self.snapshot();
        let running = |owner: &str| snapshot.is_running(owner);
        ContextSummary {
            total_tools: snapshot.tools.len(),
            available_tools: snapshot.tools.iter().filter(|t| running(&t.provider_id)).count(),
            total_resources: snapshot.resources.len(),
            available_resources: snapshot
                .resources
                .iter()
                .filter(|r| running(&r.provider_id))
                .count(),
            total_prompts: snapshot.prompts.len(),
            available_prompts: snapshot
                .prompts
                .iter()
                .filter(|p| running(&p.provider_id))
                .count(),
            connected_providers: snapshot.providers.iter().filter(|p| p.is_running()).count(),
            total_providers: snapshot.providers.len(),
            last_updated: snapshot.timestamp,
        }
    }

    // ── Bus ──────────────────────────────────────────────────────────────────

    /// Apply every context-updated snapshot published on `bus`.
    /// Replaces any previous attachment.
    pub fn attach(&self, bus: &EventBus) {
        let mut rx = bus.subscribe();
        let weak = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let FleetEvent::ContextUpdated(snapshot) = event.as_ref() else {
                    continue;
                };
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                ContextAggregator { inner }.update_context(Arc::clone(snapshot));
            }
        });
        let previous = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Stop listening to the bus.
    pub fn detach(&self) {
        let handle = self
            .inner
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            handle.abort();
        }
    }
}

fn score_item(item: &CapabilityItem, token: &str, whole: &str) -> u32 {
    let name = item.name().to_lowercase();
    let mut score = if name == token || name == whole {
        EXACT_NAME_SCORE
    } else if name.contains(token) {
        NAME_CONTAINS_SCORE
    } else {
        0
    };
    if item
        .description()
        .is_some_and(|d| d.to_lowercase().contains(token))
    {
        score += DESCRIPTION_SCORE;
    }
    if let CapabilityItem::Resource(resource) = item {
        if resource.uri.to_lowercase().contains(token) {
            score += URI_SCORE;
        }
    }
    if item.name().chars().count() < SHORT_NAME_LEN {
        score += SHORT_NAME_BONUS;
    }
    score
}

fn available<T: Clone>(
    snapshot: &FleetContextSnapshot,
    items: &[T],
    owner: impl Fn(&T) -> &String,
) -> Vec<T> {
    items
        .iter()
        .filter(|item| snapshot.is_running(owner(*item)))
        .cloned()
        .collect()
}

fn owned_by<T: Clone>(items: &[T], provider_id: &str, owner: impl Fn(&T) -> &String) -> Vec<T> {
    items
        .iter()
        .filter(|item| owner(*item).as_str() == provider_id)
        .cloned()
        .collect()
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{ProviderState, ProviderStatus};
    use crate::testing::wait_until;

    fn tool(name: &str, owner: &str, description: &str) -> Tool {
        Tool {
            name: name.into(),
            description: description.into(),
            input_schema: serde_json::json!({"type": "object"}),
            provider_id: owner.into(),
        }
    }

    fn resource(uri: &str, name: &str, owner: &str) -> Resource {
        Resource {
            uri: uri.into(),
            name: name.into(),
            description: None,
            mime_type: Some("text/plain".into()),
            provider_id: owner.into(),
        }
    }

    fn prompt(name: &str, owner: &str, description: &str) -> Prompt {
        Prompt {
            name: name.into(),
            description: Some(description.into()),
            arguments: Vec::new(),
            provider_id: owner.into(),
        }
    }

    fn status(id: &str, state: ProviderState) -> ProviderStatus {
        let mut status = ProviderStatus::new(id);
        status.state = state;
        status
    }

    fn aggregator_with(
        providers: Vec<ProviderStatus>,
        tools: Vec<Tool>,
        resources: Vec<Resource>,
        prompts: Vec<Prompt>,
    ) -> ContextAggregator {
        let aggregator = ContextAggregator::default();
        aggregator.update_context(Arc::new(FleetContextSnapshot::new(
            providers, tools, resources, prompts,
        )));
        aggregator
    }

    #[test]
    fn test_tool_name_outranks_resource_uri() {
        let aggregator = aggregator_with(
            vec![status("git", ProviderState::Running)],
            vec![tool("git-status", "git", "Show the working tree status")],
            vec![resource("file://./git-log.txt", "Repository history", "git")],
            vec![],
        );

        let results = aggregator.search(&ContextQuery::new("git"));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].item.name(), "git-status");
        assert_eq!(results[0].score, NAME_CONTAINS_SCORE + SHORT_NAME_BONUS);
        assert_eq!(results[1].item.kind(), CapabilityKind::Resource);
        assert_eq!(results[1].score, URI_SCORE + SHORT_NAME_BONUS);
    }

    #[test]
    fn test_exact_name_and_description_scores() {
        let aggregator = aggregator_with(
            vec![],
            vec![
                tool("search", "web", "Search the web"),
                tool("lookup", "web", "Find a search result by id"),
            ],
            vec![],
            vec![],
        );
        let results = aggregator.search(&ContextQuery::new("search"));
        assert_eq!(results[0].item.name(), "search");
        assert_eq!(
            results[0].score,
            EXACT_NAME_SCORE + DESCRIPTION_SCORE + SHORT_NAME_BONUS
        );
        assert_eq!(results[1].score, DESCRIPTION_SCORE + SHORT_NAME_BONUS);
    }

    #[test]
    fn test_whole_query_matches_hyphenated_name_exactly() {
        let aggregator = aggregator_with(
            vec![],
            vec![
                tool("git-status", "git", "Show the working tree"),
                tool("git-log", "git", "Show commit history"),
            ],
            vec![],
            vec![],
        );
        let results = aggregator.search(&ContextQuery::new("  Git-Status "));
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].item.name(), "git-status");
        assert_eq!(results[0].score, EXACT_NAME_SCORE + SHORT_NAME_BONUS);
        assert_eq!(results[1].item.name(), "git-log");
        assert_eq!(results[1].score, NAME_CONTAINS_SCORE + SHORT_NAME_BONUS);
    }

    #[test]
    fn test_same_tool_under_two_owners() {
        let aggregator = aggregator_with(
            vec![],
            vec![
                tool("search", "web", "Search the web"),
                tool("search", "docs", "Search the docs"),
            ],
            vec![],
            vec![],
        );
        let results =
            aggregator.search(&ContextQuery::new("search").kinds([CapabilityKind::Tool]));
        assert_eq!(results.len(), 2);
        let owners: Vec<&str> = results.iter().map(|r| r.item.provider_id()).collect();
        assert_eq!(owners, vec!["docs", "web"]);
    }

    #[test]
    fn test_item_keeps_best_token_score() {
        let aggregator = aggregator_with(
            vec![],
            vec![tool("deploy", "ops", "Deploy a release to staging")],
            vec![],
            vec![],
        );
        let results = aggregator.search(&ContextQuery::new("release deploy"));
        assert_eq!(results.len(), 1);
        assert_eq!(
            results[0].score,
            EXACT_NAME_SCORE + DESCRIPTION_SCORE + SHORT_NAME_BONUS
        );
    }

    #[test]
    fn test_filters_and_limit() {
        let tools: Vec<Tool> = (0..10)
            .map(|i| tool(&format!("file-tool-{i}"), if i % 2 == 0 { "a" } else { "b" }, "Works on a file"))
            .collect();
        let aggregator = aggregator_with(
            vec![],
            tools,
            vec![],
            vec![prompt("file-summary", "a", "Summarize a file")],
        );

        assert_eq!(aggregator.search(&ContextQuery::new("file")).len(), 11);
        assert_eq!(aggregator.search(&ContextQuery::new("file").limit(3)).len(), 3);
        let only_b = aggregator.search(&ContextQuery::new("file").provider("b"));
        assert_eq!(only_b.len(), 5);
        assert!(only_b.iter().all(|r| r.item.provider_id() == "b"));
        let prompts = aggregator.search(&ContextQuery::new("file").kinds([CapabilityKind::Prompt]));
        assert_eq!(prompts.len(), 1);
        assert!(aggregator.search(&ContextQuery::new("the a")).is_empty());
    }

    #[test]
    fn test_default_limit_applies() {
        let aggregator = ContextAggregator::new(2);
        aggregator.update_context(Arc::new(FleetContextSnapshot::new(
            vec![],
            (0..5).map(|i| tool(&format!("echo{i}"), "fs", "Echo input")).collect(),
            vec![],
            vec![],
        )));
        assert_eq!(aggregator.search(&ContextQuery::new("echo")).len(), 2);
    }

    #[test]
    fn test_update_replaces_index() {
        let aggregator = aggregator_with(vec![], vec![tool("alpha", "fs", "")], vec![], vec![]);
        assert_eq!(aggregator.search(&ContextQuery::new("alpha")).len(), 1);
        aggregator.update_context(Arc::new(FleetContextSnapshot::new(
            vec![],
            vec![tool("beta", "fs", "")],
            vec![],
            vec![],
        )));
        assert!(aggregator.search(&ContextQuery::new("alpha")).is_empty());
        assert_eq!(aggregator.search(&ContextQuery::new("beta")).len(), 1);
    }

    #[test]
    fn test_available_views_and_summary() {
        let aggregator = aggregator_with(
            vec![status("fs", ProviderState::Running), status("git", ProviderState::Crashed)],
            vec![tool("read", "fs", "Read a file"), tool("log", "git", "Show history")],
            vec![resource("file:///readme", "readme", "fs")],
            vec![prompt("commit", "git", "Write a commit message")],
        );

        let available: Vec<String> = aggregator.available_tools().into_iter().map(|t| t.name).collect();
        assert_eq!(available, vec!["read"]);
        assert_eq!(aggregator.available_resources().len(), 1);
        assert!(aggregator.available_prompts().is_empty());

        let summary = aggregator.get_context_summary();
        assert_eq!(summary.total_tools, 2);
        assert_eq!(summary.available_tools, 1);
        assert_eq!(summary.total_prompts, 1);
        assert_eq!(summary.available_prompts, 0);
        assert_eq!(summary.connected_providers, 1);
        assert_eq!(summary.total_providers, 2);

        let by_provider = aggregator.context_by_provider();
        assert_eq!(by_provider["git"].prompts.len(), 1);
        assert_eq!(by_provider["fs"].resources.len(), 1);
        assert_eq!(aggregator.provider_context("fs").tools.len(), 1);

        assert!(aggregator.find_tool("git", "log").is_some());
        assert!(aggregator.find_tool("fs", "log").is_none());
    }

    #[tokio::test]
    async fn test_attach_applies_published_snapshots() {
        let bus = EventBus::new();
        let aggregator = ContextAggregator::default();
        aggregator.attach(&bus);

        bus.publish(FleetEvent::ContextUpdated(Arc::new(FleetContextSnapshot::new(
            vec![status("fs", ProviderState::Running)],
            vec![tool("read", "fs", "Read a file")],
            vec![],
            vec![],
        ))));
        assert!(wait_until(|| aggregator.all_tools().len() == 1).await);
        aggregator.detach();
    }
}
