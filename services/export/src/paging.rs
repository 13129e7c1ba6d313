//! Lazy, forward-only sequences over paginated remote listings.
//!
//! Every remote listing used by the exporter (metric descriptors, time series,
//! projects, running instances, bucket objects) is served a page at a time.
//! [`paginate`] turns a page-fetch function into a `Stream` that only requests
//! the next page once the consumer has drained the previous one. The stream
//! ending (`None`) is the end-of-sequence signal; errors are always delivered
//! as `Some(Err(_))` and are never confused with exhaustion.

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use std::future::Future;

/// One page of a remote listing
#[derive(Debug, Clone, PartialEq)]
pub struct Page<T> {
    /// Items on this page (may be empty even when more pages follow)
    pub items: Vec<T>,
    /// Token for the following page; `None` or empty means this was the last page
    pub next_page_token: Option<String>,
}

impl<T> Page<T> {
    /// A final page with no continuation
    pub fn last(items: Vec<T>) -> Self {
        Self {
            items,
            next_page_token: None,
        }
    }
}

enum Cursor {
    Start,
    Next(String),
    Done,
}

/// Build a lazy stream of items from a page-fetch function.
///
/// `fetch` is called with `None` for the first page and with the previous
/// page's token afterwards. The stream is not restartable.
pub fn paginate<'a, T, E, F, Fut>(fetch: F) -> BoxStream<'a, Result<T, E>>
where
    T: Send + 'a,
    E: Send + 'a,
    F: FnMut(Option<String>) -> Fut + Send + 'a,
    Fut: Future<Output = Result<Page<T>, E>> + Send + 'a,
{
    stream::try_unfold((Cursor::Start, fetch), |(cursor, mut fetch)| async move {
        let token = match cursor {
            Cursor::Start => None,
            Cursor::Next(token) => Some(token),
            Cursor::Done => return Ok::<_, E>(None),
        };

        let page = fetch(token).await?;
        let next = match page.next_page_token {
            Some(token) if !token.is_empty() => Cursor::Next(token),
            _ => Cursor::Done,
        };

        Ok::<_, E>(Some((page.items, (next, fetch))))
    })
    .map_ok(|items| stream::iter(items.into_iter().map(Ok::<T, E>)))
    .try_flatten()
    .boxed()
}
