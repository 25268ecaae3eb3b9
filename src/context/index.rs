//! Inverted keyword index over one capability family.

use std::collections::HashMap;

use crate::fleet::CapabilityItem;

use super::tokenizer::tokenize_fields;

/// Maps each token to the positions of the items containing it.
#[derive(Debug, Clone, Default)]
pub struct KeywordIndex {
    items: Vec<CapabilityItem>,
    postings: HashMap<String, Vec<usize>>,
}

impl KeywordIndex {
    /// Build an index over `items` from scratch.
    pub fn build(items: Vec<CapabilityItem>) -> Self {
        let mut postings: HashMap<String, Vec<usize>> = HashMap::new();
        for (position, item) in items.iter().enumerate() {
            for token in item_tokens(item) {
                postings.entry(token).or_default().push(position);
            }
        }
        Self { items, postings }
    }

    /// Items containing `token`.
    pub fn lookup<'a>(&'a self, token: &str) -> impl Iterator<Item = &'a CapabilityItem> + 'a {
        self.postings
            .get(token)
            .into_iter()
            .flatten()
            .filter_map(|&position| self.items.get(position))
    }

    pub fn token_count(&self) -> usize {
        self.postings.len()
    }

    pub fn item_count(&self) -> usize {
        self.items.len()
    }
}

/// Name and description, plus the uri for resources.
fn item_tokens(item: &CapabilityItem) -> Vec<String> {
    let mut fields = vec![item.name()];
    if let Some(description) = item.description() {
        fields.push(description);
    }
    if let CapabilityItem::Resource(resource) = item {
        fields.push(&resource.uri);
    }
    tokenize_fields(fields)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fleet::{Resource, Tool};

    #[test]
    fn test_lookup_by_token() {
        let index = KeywordIndex::build(vec![
            CapabilityItem::Tool(Tool {
                name: "git-status".into(),
                description: "Show the working tree status".into(),
                input_schema: serde_json::Value::Null,
                provider_id: "git".into(),
            }),
            CapabilityItem::Resource(Resource {
                uri: "file://./git-log.txt".into(),
                name: "Repository history".into(),
                description: None,
                mime_type: None,
                provider_id: "git".into(),
            }),
        ]);

        assert_eq!(index.item_count(), 2);
        assert_eq!(index.lookup("git").count(), 2);
        assert_eq!(index.lookup("history").count(), 1);
        assert_eq!(index.lookup("tree").next().unwrap().name(), "git-status");
        assert_eq!(index.lookup("missing").count(), 0);
        assert!(index.token_count() > 5);
    }
}
