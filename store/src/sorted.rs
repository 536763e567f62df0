//! Single-number-per-client store with ranked range queries.

use std::sync::Arc;

use tokio_stream::Stream;

use crate::backend::{PageCursor, RangeQuery, SortedBackend, SortedPage};
use crate::error::StoreError;
use crate::retry::{self, RetryPolicy};
use crate::schema;

pub use crate::backend::SortedEntry;

/// Largest page a range query may request.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Façade over a backend's sorted key space for one named store.
///
/// Stateless per client: every call is a retry-wrapped backend round trip.
pub struct SortedStore<B> {
    name: String,
    backend: Arc<B>,
    policy: RetryPolicy,
    min: i64,
    max: i64,
}

impl<B: SortedBackend> SortedStore<B> {
    /// `min`/`max` are the inclusive bounds used when a range query omits
    /// them.
    pub fn new(
        name: impl Into<String>,
        backend: Arc<B>,
        policy: RetryPolicy,
        min: i64,
        max: i64,
    ) -> Self {
        Self {
            name: name.into(),
            backend,
            policy,
            min,
            max,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current value for `key`; `0` when nothing was ever stored.
    pub async fn get(&self, key: &str) -> Result<i64, StoreError> {
        let context = format!("sorted get {}/{}", self.name, key);
        let (backend, store) = (&*self.backend, self.name.as_str());
        let value = retry::execute(&self.policy, &context, move || {
            backend.get_value(store, key)
        })
        .await?;
        Ok(value.unwrap_or(0))
    }

    pub async fn set(&self, key: &str, value: i64) -> Result<(), StoreError> {
        let context = format!("sorted set {}/{}", self.name, key);
        let (backend, store) = (&*self.backend, self.name.as_str());
        retry::execute(&self.policy, &context, move || {
            backend.set_value(store, key, value)
        })
        .await?;
        tracing::debug!(store = %self.name, key, value, "Sorted value stored");
        Ok(())
    }

    /// Validate an untyped value before storing it. Non-integers never reach
    /// the backend.
    pub async fn set_json(&self, key: &str, value: &serde_json::Value) -> Result<(), StoreError> {
        let value = schema::number_from_json(value)?;
        self.set(key, value).await
    }

    /// Entries ordered by value, paged. The first page is fetched before this
    /// returns, so an unreachable backend is reported here.
    pub async fn sorted_range(
        &self,
        ascending: bool,
        page_size: u32,
        min: Option<i64>,
        max: Option<i64>,
    ) -> Result<SortedPages<B>, StoreError> {
        if page_size == 0 || page_size > MAX_PAGE_SIZE {
            return Err(StoreError::usage(format!(
                "page size must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, page_size
            )));
        }
        let query = RangeQuery {
            ascending,
            page_size,
            min: min.unwrap_or(self.min),
            max: max.unwrap_or(self.max),
        };
        if query.min > query.max {
            return Err(StoreError::usage(format!(
                "range minimum {} exceeds maximum {}",
                query.min, query.max
            )));
        }

        let mut pages = SortedPages {
            store: self.name.clone(),
            backend: self.backend.clone(),
            policy: self.policy,
            query,
            current: Vec::new(),
            next: Some(PageCursor::default()),
        };
        pages.advance().await?;
        Ok(pages)
    }
}

/// Cursor over a sorted range, one backend round trip per page.
pub struct SortedPages<B> {
    store: String,
    backend: Arc<B>,
    policy: RetryPolicy,
    query: RangeQuery,
    current: Vec<SortedEntry>,
    next: Option<PageCursor>,
}

impl<B: SortedBackend> SortedPages<B> {
    pub fn current_page(&self) -> &[SortedEntry] {
        &self.current
    }

    pub fn is_finished(&self) -> bool {
        self.next.is_none()
    }

    /// Fetch the next page into [`current_page`](Self::current_page).
    /// Returns `false` once the range is exhausted; the current page is then
    /// left untouched.
    pub async fn advance(&mut self) -> Result<bool, StoreError> {
        let Some(cursor) = self.next else {
            return Ok(false);
        };
        let context = format!("sorted range {}", self.store);
        let (backend, store, query) = (&*self.backend, self.store.as_str(), &self.query);
        let SortedPage { entries, next } = retry::execute(&self.policy, &context, move || {
            backend.sorted_page(store, query, cursor)
        })
        .await?;
        self.current = entries;
        self.next = next;
        Ok(true)
    }

    /// Every remaining entry starting with the current page, fetching later
    /// pages as the stream is polled.
    pub fn into_stream(mut self) -> impl Stream<Item = Result<SortedEntry, StoreError>> + Send {
        async_stream::stream! {
            loop {
                for entry in std::mem::take(&mut self.current) {
                    yield Ok(entry);
                }
                match self.advance().await {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

impl<B> std::fmt::Debug for SortedPages<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SortedPages")
            .field("store", &self.store)
            .field("query", &self.query)
            .field("current", &self.current)
            .field("finished", &self.next.is_none())
            .finish()
    }
}
