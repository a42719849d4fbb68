//! Lazy, paged replay of a single instance's log.
//!
//! [`event_stream`] turns a `SearchQuery` into a `Stream` of events fetched
//! page by page with the `position_after` cursor, so a projection can catch
//! up over a long log without holding it in memory.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use eventstore_events::Event;

use crate::event_store::{EventStoreError, Order, Querier, SearchQuery};

pub const DEFAULT_PAGE_SIZE: u32 = 500;

/// Stream the events matching `query` in ascending position order.
///
/// The query must target exactly one instance (positions are per instance)
/// and be ascending. Its `limit`, if any, caps the total number of events
/// yielded. Dropping the stream stops fetching.
pub fn event_stream<'a, Q>(
    querier: &'a Q,
    query: SearchQuery,
    page_size: u32,
) -> BoxStream<'a, Result<Event, EventStoreError>>
where
    Q: Querier + ?Sized,
{
    let pager = match Pager::new(query, page_size) {
        Ok(pager) => pager,
        Err(e) => return stream::once(async move { Err(e) }).boxed(),
    };

    stream::try_unfold(pager, move |mut pager| async move {
        let Some(page_query) = pager.next_query() else {
            return Ok(None);
        };
        let page = querier.filter(&page_query).await?;
        pager.advance(&page, page_query.limit);
        let items = stream::iter(page.into_iter().map(Ok::<Event, EventStoreError>));
        Ok::<_, EventStoreError>(Some((items, pager)))
    })
    .try_flatten()
    .boxed()
}

#[derive(Debug)]
struct Pager {
    query: SearchQuery,
    page_size: u32,
    remaining: Option<u32>,
    exhausted: bool,
}

impl Pager {
    fn new(query: SearchQuery, page_size: u32) -> Result<Self, EventStoreError> {
        if query.instance_ids.len() != 1 {
            return Err(EventStoreError::InvalidQuery(
                "event stream must target exactly one instance".to_string(),
            ));
        }
        if query.order != Order::Asc {
            return Err(EventStoreError::InvalidQuery(
                "event stream only supports ascending order".to_string(),
            ));
        }
        if page_size == 0 {
            return Err(EventStoreError::InvalidQuery("page size must be positive".to_string()));
        }
        Ok(Self {
            remaining: query.limit,
            query,
            page_size,
            exhausted: false,
        })
    }

    fn next_query(&self) -> Option<SearchQuery> {
        if self.exhausted || self.remaining == Some(0) {
            return None;
        }
        let mut query = self.query.clone();
        query.limit = Some(self.remaining.map_or(self.page_size, |r| r.min(self.page_size)));
        Some(query)
    }

    fn advance(&mut self, page: &[Event], requested: Option<u32>) {
        let fetched = page.len() as u32;
        if requested.is_some_and(|limit| fetched < limit) {
            self.exhausted = true;
        }
        if let Some(last) = page.last() {
            self.query.position_after = Some(last.position);
        } else {
            self.exhausted = true;
        }
        if let Some(remaining) = self.remaining.as_mut() {
            *remaining = remaining.saturating_sub(fetched);
        }
    }
}
