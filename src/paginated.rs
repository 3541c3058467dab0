//! Cursor-paginated resources accumulated under a single cache key.

use futures::future::FutureExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use crate::cache::{CacheKey, CacheStore, Merge};
use crate::error::QueryResult;
use crate::transport::PageFetcher;

/// One fetched page. `cursor` points at the page after this one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page<Item, C> {
  pub items: Vec<Item>,
  pub cursor: Option<C>,
}

/// All pages loaded so far for one key, in fetch order.
///
/// `page_params[i]` is the cursor that was used to fetch `pages[i]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaginatedValue<Item, C> {
  pub pages: Vec<Page<Item, C>>,
  pub page_params: Vec<Option<C>>,
  /// The only page holds optimistic items; nothing was fetched yet
  #[serde(default, skip_serializing_if = "std::ops::Not::not")]
  pub placeholder: bool,
}

impl<Item, C> Default for PaginatedValue<Item, C> {
  fn default() -> Self {
    Self {
      pages: Vec::new(),
      page_params: Vec::new(),
      placeholder: false,
    }
  }
}

impl<Item: Clone, C: Clone> PaginatedValue<Item, C> {
  /// True until a fetched page without a next cursor has been loaded.
  pub fn has_next_page(&self) -> bool {
    if self.placeholder {
      return true;
    }
    self
      .pages
      .last()
      .map(|page| page.cursor.is_some())
      .unwrap_or(true)
  }

  /// Cursor of the last loaded page.
  pub fn next_cursor(&self) -> Option<&C> {
    if self.placeholder {
      return None;
    }
    self.pages.last().and_then(|page| page.cursor.as_ref())
  }

  /// Number of pages that came from the server.
  pub fn fetched_pages(&self) -> usize {
    if self.placeholder {
      0
    } else {
      self.pages.len()
    }
  }

  /// Append a page fetched with `param`. A placeholder page is replaced.
  pub fn appended(mut self, param: Option<C>, page: Page<Item, C>) -> Self {
    if self.placeholder {
      self = Self::default();
    }
    self.page_params.push(param);
    self.pages.push(page);
    self
  }

  /// Copy with `item` at the head of the first page; other pages untouched.
  ///
  /// With nothing loaded, the copy holds a single one-item placeholder page
  /// that the first fetched page replaces.
  pub fn prepend(&self, item: Item) -> Self {
    let mut value = self.clone();
    match value.pages.first_mut() {
      Some(first) => first.items.insert(0, item),
      None => {
        value.pages.push(Page {
          items: vec![item],
          cursor: None,
        });
        value.page_params.push(None);
        value.placeholder = true;
      }
    }
    value
  }

  /// All items across pages, in page order.
  pub fn items(&self) -> impl Iterator<Item = &Item> {
    self.pages.iter().flat_map(|page| page.items.iter())
  }

  pub fn len(&self) -> usize {
    self.pages.iter().map(|page| page.items.len()).sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Pages of one collection, fetched on demand into a [`CacheStore`].
pub struct PaginatedResource<Item, C> {
  store: CacheStore<PaginatedValue<Item, C>>,
  key: CacheKey,
  fetcher: Arc<dyn PageFetcher<Item, C>>,
  initial_cursor: Option<C>,
}

impl<Item, C> PaginatedResource<Item, C>
where
  Item: Clone + Send + Sync + 'static,
  C: Clone + Send + Sync + 'static,
{
  pub fn new(
    store: CacheStore<PaginatedValue<Item, C>>,
    key: CacheKey,
    fetcher: Arc<dyn PageFetcher<Item, C>>,
  ) -> Self {
    Self {
      store,
      key,
      fetcher,
      initial_cursor: None,
    }
  }

  /// Cursor used for the first page (default `None`).
  pub fn with_initial_cursor(mut self, cursor: C) -> Self {
    self.initial_cursor = Some(cursor);
    self
  }

  pub fn key(&self) -> &CacheKey {
    &self.key
  }

  /// Pages loaded so far.
  pub fn value(&self) -> PaginatedValue<Item, C> {
    self.store.value(&self.key).unwrap_or_default()
  }

  pub fn has_next_page(&self) -> bool {
    self
      .store
      .value(&self.key)
      .map(|value| value.has_next_page())
      .unwrap_or(true)
  }

  pub fn is_fetching(&self) -> bool {
    self.store.is_fetching(&self.key)
  }

  /// Fetch the page after the last loaded one and append it.
  ///
  /// No-op returning the current pages when there is no next page or a
  /// fetch for this key is already in flight.
  pub async fn fetch_next(&self) -> QueryResult<PaginatedValue<Item, C>> {
    let fetcher = Arc::clone(&self.fetcher);
    let initial = self.initial_cursor.clone();

    let flight = self.store.try_launch(&self.key, move |entry| {
      let cursor = match &entry.value {
        Some(value) if value.fetched_pages() > 0 => Some(value.next_cursor()?.clone()),
        _ => initial,
      };

      Some(
        async move {
          let result = fetcher.fetch_page(cursor.clone()).await;
          result.map(|page| {
            Box::new(move |current: Option<&PaginatedValue<Item, C>>| {
              current.cloned().unwrap_or_default().appended(cursor, page)
            }) as Merge<PaginatedValue<Item, C>>
          })
        }
        .boxed(),
      )
    });

    match flight {
      Some(flight) => flight.await,
      None => {
        debug!(key = %self.key, "fetch_next skipped");
        Ok(self.value())
      }
    }
  }

  /// Replace all loaded pages with a fresh first page.
  ///
  /// Loaded pages stay visible until the new page lands.
  pub async fn refetch(&self) -> QueryResult<PaginatedValue<Item, C>> {
    let fetcher = Arc::clone(&self.fetcher);
    let initial = self.initial_cursor.clone();

    let flight = self.store.try_launch(&self.key, move |_| {
      Some(
        async move {
          let result = fetcher.fetch_page(initial.clone()).await;
          result.map(|page| {
            Box::new(move |_: Option<&PaginatedValue<Item, C>>| {
              PaginatedValue::default().appended(initial, page)
            }) as Merge<PaginatedValue<Item, C>>
          })
        }
        .boxed(),
      )
    });

    match flight {
      Some(flight) => flight.await,
      None => Ok(self.value()),
    }
  }
}
