//! Drives paged fetches to exhaustion or to an incremental cutoff.

use crate::Result;
use chrono::{DateTime, Utc};
use core::future::Future;
use ohno::bail;

const LOG_TARGET: &str = " paginator";

/// Continuation state handed to each page fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageParams {
    /// One-based page number.
    pub page: u32,

    /// Continuation token returned by the previous page, if the api uses tokens.
    pub cursor: Option<String>,
}

impl Default for PageParams {
    fn default() -> Self {
        Self { page: 1, cursor: None }
    }
}

/// What a page fetch reports about the rest of the collection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageInfo {
    pub has_next_page: bool,

    /// Token for the next page; `None` for page-number based apis.
    pub next_cursor: Option<String>,

    /// Total number of items in the collection, when the api reports it.
    pub total: Option<u64>,

    /// Set by cutoff-mode fetches once the page contained an item no newer than the cutoff.
    pub reached_cutoff: bool,
}

impl PageInfo {
    /// A final page.
    #[must_use]
    pub fn last() -> Self {
        Self::default()
    }

    /// A page followed by another page addressed by number.
    #[must_use]
    pub fn more() -> Self {
        Self {
            has_next_page: true,
            ..Self::default()
        }
    }

    /// A page followed by another page addressed by `cursor`.
    #[must_use]
    pub fn more_after(cursor: impl Into<String>) -> Self {
        Self {
            has_next_page: true,
            next_cursor: Some(cursor.into()),
            ..Self::default()
        }
    }

    #[must_use]
    pub const fn with_total(mut self, total: u64) -> Self {
        self.total = Some(total);
        self
    }
}

/// Whether an item last updated at `updated_at` was already processed by a previous run.
#[must_use]
pub fn is_at_or_before_cutoff(updated_at: DateTime<Utc>, cutoff: Option<DateTime<Utc>>) -> bool {
    cutoff.is_some_and(|c| updated_at <= c)
}

/// Fetch every page of a collection.
///
/// The first error aborts paging; no further fetches are made.
pub async fn paginate<F, Fut>(mut fetch: F) -> Result<()>
where
    F: FnMut(PageParams) -> Fut,
    Fut: Future<Output = Result<PageInfo>>,
{
    let mut params = PageParams::default();
    loop {
        let info = fetch(params.clone()).await?;
        match next_params(params, info)? {
            Some(next) => params = next,
            None => return Ok(()),
        }
    }
}

/// Fetch pages of a recency-ordered collection until one reaches `cutoff`.
///
/// The fetch function receives the cutoff and reports through
/// [`PageInfo::reached_cutoff`] when its page contained an item no newer than it. A
/// `None` cutoff fetches everything.
pub async fn paginate_newer_than<F, Fut>(cutoff: Option<DateTime<Utc>>, mut fetch: F) -> Result<()>
where
    F: FnMut(PageParams, Option<DateTime<Utc>>) -> Fut,
    Fut: Future<Output = Result<PageInfo>>,
{
    let mut params = PageParams::default();
    loop {
        let info = fetch(params.clone(), cutoff).await?;
        if info.reached_cutoff {
            log::debug!(target: LOG_TARGET, "Reached incremental cutoff on page {}", params.page);
            return Ok(());
        }

        match next_params(params, info)? {
            Some(next) => params = next,
            None => return Ok(()),
        }
    }
}

fn next_params(current: PageParams, info: PageInfo) -> Result<Option<PageParams>> {
    if !info.has_next_page {
        return Ok(None);
    }

    let cursor = match (current.cursor, info.next_cursor) {
        (Some(prev), Some(next)) if prev == next => {
            bail!("page {} reports more pages but repeats continuation token '{next}'", current.page)
        }
        (Some(_), None) => bail!("page {} reports more pages but returned no continuation token", current.page),
        (_, next) => next,
    };

    Ok(Some(PageParams {
        page: current.page + 1,
        cursor,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use ohno::app_err;

    #[tokio::test]
    async fn test_pages_until_exhausted() {
        let mut seen = Vec::new();
        paginate(|params| {
            seen.push(params.page);
            let page = params.page;
            async move { Ok(if page < 3 { PageInfo::more() } else { PageInfo::last() }) }
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_passes_continuation_tokens() {
        let mut seen = Vec::new();
        paginate(|params| {
            seen.push(params.cursor.clone());
            let page = params.page;
            async move {
                Ok(match page {
                    1 => PageInfo::more_after("a"),
                    2 => PageInfo::more_after("b"),
                    _ => PageInfo::last(),
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(seen, vec![None, Some("a".to_string()), Some("b".to_string())]);
    }

    #[tokio::test]
    async fn test_first_error_aborts() {
        let mut calls = 0;
        let result = paginate(|params| {
            calls += 1;
            let page = params.page;
            async move {
                if page == 2 {
                    Err(app_err!("boom"))
                } else {
                    Ok(PageInfo::more())
                }
            }
        })
        .await;

        let _ = result.unwrap_err();
        assert_eq!(calls, 2);
    }

    #[tokio::test]
    async fn test_missing_token_is_an_error() {
        let result = paginate(|params| {
            let page = params.page;
            async move { Ok(if page == 1 { PageInfo::more_after("a") } else { PageInfo::more() }) }
        })
        .await;

        assert!(result.unwrap_err().to_string().contains("no continuation token"));
    }

    #[tokio::test]
    async fn test_repeated_token_is_an_error() {
        let result = paginate(|_| async { Ok(PageInfo::more_after("same")) }).await;
        assert!(result.unwrap_err().to_string().contains("repeats"));
    }

    #[tokio::test]
    async fn test_stops_at_cutoff() {
        let cutoff = Utc.with_ymd_and_hms(2020, 1, 10, 0, 0, 0).unwrap();
        let mut calls = 0;
        paginate_newer_than(Some(cutoff), |params, c| {
            calls += 1;
            assert_eq!(c, Some(cutoff));
            let page = params.page;
            async move {
                Ok(PageInfo {
                    reached_cutoff: page == 2,
                    ..PageInfo::more()
                })
            }
        })
        .await
        .unwrap();

        assert_eq!(calls, 2);
    }

    #[test]
    fn test_cutoff_comparison() {
        let cutoff = Utc.with_ymd_and_hms(2020, 1, 10, 0, 0, 0).unwrap();
        assert!(is_at_or_before_cutoff(cutoff, Some(cutoff)));
        assert!(!is_at_or_before_cutoff(cutoff + chrono::Duration::days(1), Some(cutoff)));
        assert!(!is_at_or_before_cutoff(cutoff, None));
    }
}
