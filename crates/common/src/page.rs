//! Token-based pagination shared by the collaborator interfaces

use serde::{Deserialize, Serialize};
use std::future::Future;

use crate::error::Result;

/// One page of a paginated collaborator listing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<T> {
    pub items: Vec<T>,

    /// Token for the next page, `None` on the last page
    #[serde(skip_serializing_if = "Option::is_none")]
    pub next_token: Option<String>,
}

impl<T> Page<T> {
    /// A single, final page
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_token: None,
        }
    }
}

/// Drain a paginated call into a single vector
pub async fn collect_all<T, F, Fut>(mut fetch: F) -> Result<Vec<T>>
where
    F: FnMut(Option<String>) -> Fut,
    Fut: Future<Output = Result<Page<T>>>,
{
    let mut items = Vec::new();
    let mut token = None;

    loop {
        let page = fetch(token.take()).await?;
        items.extend(page.items);

        match page.next_token {
            Some(next) => token = Some(next),
            None => break,
        }
    }

    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_collect_all_follows_tokens() {
        let pages = vec![
            Page {
                items: vec![1, 2],
                next_token: Some("a".to_string()),
            },
            Page {
                items: vec![3],
                next_token: Some("b".to_string()),
            },
            Page::last(vec![4]),
        ];

        let mut seen_tokens = Vec::new();
        let items = collect_all(|token| {
            seen_tokens.push(token.clone());
            let index = match token.as_deref() {
                None => 0,
                Some("a") => 1,
                _ => 2,
            };
            let page = pages[index].clone();
            async move { Ok(page) }
        })
        .await
        .unwrap();

        assert_eq!(items, vec![1, 2, 3, 4]);
        assert_eq!(
            seen_tokens,
            vec![None, Some("a".to_string()), Some("b".to_string())]
        );
    }
}
