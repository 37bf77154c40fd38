//! Pagination strategies for REST and SaaS sources
//!
//! Pages are requested one at a time; each round trip is awaited before the
//! next is issued. Offset and page-number loops stop only on a short or empty
//! page, so a result set that is an exact multiple of the page size costs one
//! extra (empty) request.

use crate::batch::Record;
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tracing::debug;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaginationStrategy {
    #[default]
    None,
    OffsetLimit,
    Cursor,
    PageNumber,
}

impl PaginationStrategy {
    pub fn parse(raw: &str) -> Result<Self> {
        match raw.trim().to_lowercase().as_str() {
            "" | "none" => Ok(PaginationStrategy::None),
            "offset" | "offset_limit" | "offset/limit" => Ok(PaginationStrategy::OffsetLimit),
            "cursor" => Ok(PaginationStrategy::Cursor),
            "page" | "page_number" => Ok(PaginationStrategy::PageNumber),
            other => Err(SyncError::Configuration(format!(
                "Unknown pagination strategy '{}'",
                other
            ))),
        }
    }
}

/// What the paginator asks the source for next
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum PageRequest {
    Single,
    Offset { offset: u64, limit: u64 },
    Cursor { token: Option<String>, limit: u64 },
    PageNumber { page: u64, page_size: u64 },
}

/// One page as returned by the source
#[derive(Clone, Debug, Default)]
pub struct Page {
    pub records: Vec<Record>,
    /// Continuation token (opaque string, or a follow-up path for SaaS APIs)
    pub next_token: Option<String>,
}

impl Page {
    pub fn new(records: Vec<Record>, next_token: Option<String>) -> Self {
        Self { records, next_token }
    }
}

#[derive(Clone, Debug, Default)]
pub struct PaginatedResult {
    pub records: Vec<Record>,
    pub pages: usize,
}

#[derive(Clone, Debug, PartialEq)]
pub struct Paginator {
    strategy: PaginationStrategy,
    page_size: u64,
}

impl Paginator {
    pub fn new(strategy: PaginationStrategy, page_size: u64) -> Result<Self> {
        if page_size == 0 && strategy != PaginationStrategy::None {
            return Err(SyncError::Configuration("page_size must be positive".to_string()));
        }
        Ok(Self { strategy, page_size })
    }

    pub fn strategy(&self) -> PaginationStrategy {
        self.strategy
    }

    pub fn page_size(&self) -> u64 {
        self.page_size
    }

    /// Drive `fetch` until the strategy's termination rule fires
    pub async fn collect<F, Fut>(&self, mut fetch: F) -> Result<PaginatedResult>
    where
        F: FnMut(PageRequest) -> Fut,
        Fut: Future<Output = Result<Page>>,
    {
        let mut result = PaginatedResult::default();

        match self.strategy {
            PaginationStrategy::None => {
                let page = fetch(PageRequest::Single).await?;
                result.pages = 1;
                result.records = page.records;
            }
            PaginationStrategy::OffsetLimit => {
                let mut offset = 0u64;
                loop {
                    let page = fetch(PageRequest::Offset {
                        offset,
                        limit: self.page_size,
                    })
                    .await?;
                    if !self.absorb_sized_page(&mut result, page) {
                        break;
                    }
                    offset += self.page_size;
                }
            }
            PaginationStrategy::PageNumber => {
                let mut page_number = 1u64;
                loop {
                    let page = fetch(PageRequest::PageNumber {
                        page: page_number,
                        page_size: self.page_size,
                    })
                    .await?;
                    if !self.absorb_sized_page(&mut result, page) {
                        break;
                    }
                    page_number += 1;
                }
            }
            PaginationStrategy::Cursor => {
                let mut token: Option<String> = None;
                loop {
                    let page = fetch(PageRequest::Cursor {
                        token: token.clone(),
                        limit: self.page_size,
                    })
                    .await?;
                    result.pages += 1;
                    if page.records.is_empty() {
                        break;
                    }
                    result.records.extend(page.records);
                    match page.next_token {
                        None => break,
                        Some(next) if token.as_deref() == Some(next.as_str()) => {
                            return Err(SyncError::Validation(format!(
                                "Source repeated continuation token '{}'",
                                next
                            )));
                        }
                        Some(next) => token = Some(next),
                    }
                }
            }
        }

        debug!(
            "Pagination ({:?}) finished: {} records over {} pages",
            self.strategy,
            result.records.len(),
            result.pages
        );
        Ok(result)
    }

    /// Append a sized page; returns whether another page should be requested
    fn absorb_sized_page(&self, result: &mut PaginatedResult, page: Page) -> bool {
        let count = page.records.len() as u64;
        result.pages += 1;
        result.records.extend(page.records);
        count > 0 && count >= self.page_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn records(n: usize, start: usize) -> Vec<Record> {
        (start..start + n)
            .map(|i| json!({ "id": i }).as_object().cloned().unwrap())
            .collect()
    }

    /// Serves pages of the given sizes in order and logs every request
    fn scripted(
        sizes: Vec<usize>,
    ) -> (
        Arc<Mutex<Vec<PageRequest>>>,
        impl FnMut(PageRequest) -> std::future::Ready<Result<Page>>,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = log.clone();
        let mut served = 0usize;
        let mut start = 0usize;
        let fetch = move |req: PageRequest| {
            log_clone.lock().unwrap().push(req);
            let size = sizes.get(served).copied().unwrap_or(0);
            served += 1;
            let page_records = records(size, start);
            start += size;
            let token = (served < sizes.len()).then(|| format!("tok{}", served));
            std::future::ready(Ok(Page::new(page_records, token)))
        };
        (log, fetch)
    }

    #[tokio::test]
    async fn test_none_issues_single_request() {
        let (log, fetch) = scripted(vec![5, 5]);
        let paginator = Paginator::new(PaginationStrategy::None, 5).unwrap();
        let result = paginator.collect(fetch).await.unwrap();
        assert_eq!(result.records.len(), 5);
        assert_eq!(log.lock().unwrap().as_slice(), &[PageRequest::Single]);
    }

    #[tokio::test]
    async fn test_offset_stops_on_short_page() {
        let (log, fetch) = scripted(vec![10, 10, 3]);
        let paginator = Paginator::new(PaginationStrategy::OffsetLimit, 10).unwrap();
        let result = paginator.collect(fetch).await.unwrap();
        assert_eq!(result.records.len(), 23);
        assert_eq!(result.pages, 3);
        let log = log.lock().unwrap();
        assert_eq!(log[2], PageRequest::Offset { offset: 20, limit: 10 });
    }

    #[tokio::test]
    async fn test_exact_page_size_requests_one_more_page() {
        let (log, fetch) = scripted(vec![10, 10]);
        let paginator = Paginator::new(PaginationStrategy::PageNumber, 10).unwrap();
        let result = paginator.collect(fetch).await.unwrap();
        assert_eq!(result.records.len(), 20);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], PageRequest::PageNumber { page: 1, page_size: 10 });
        assert_eq!(log[2], PageRequest::PageNumber { page: 3, page_size: 10 });
    }

    #[tokio::test]
    async fn test_cursor_follows_tokens_until_null() {
        let (log, fetch) = scripted(vec![4, 4, 2]);
        let paginator = Paginator::new(PaginationStrategy::Cursor, 4).unwrap();
        let result = paginator.collect(fetch).await.unwrap();
        assert_eq!(result.records.len(), 10);
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 3);
        assert_eq!(log[0], PageRequest::Cursor { token: None, limit: 4 });
        assert_eq!(log[2], PageRequest::Cursor { token: Some("tok2".into()), limit: 4 });
    }

    #[tokio::test]
    async fn test_cursor_stops_on_empty_page_even_with_token() {
        let (log, fetch) = scripted(vec![3, 0, 5]);
        let paginator = Paginator::new(PaginationStrategy::Cursor, 3).unwrap();
        let result = paginator.collect(fetch).await.unwrap();
        assert_eq!(result.records.len(), 3);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_repeated_token_is_rejected() {
        let paginator = Paginator::new(PaginationStrategy::Cursor, 2).unwrap();
        let err = paginator
            .collect(|_req| async { Ok(Page::new(records(2, 0), Some("same".into()))) })
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation(_)));
    }

    #[test]
    fn test_strategy_parsing() {
        assert_eq!(PaginationStrategy::parse("offset").unwrap(), PaginationStrategy::OffsetLimit);
        assert_eq!(PaginationStrategy::parse("page_number").unwrap(), PaginationStrategy::PageNumber);
        assert!(PaginationStrategy::parse("link_header").is_err());
        assert!(Paginator::new(PaginationStrategy::OffsetLimit, 0).is_err());
    }
}
