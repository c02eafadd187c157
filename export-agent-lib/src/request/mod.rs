//! Outbound request handling for integrations
//!
//! Every call an integration makes to its provider goes through a [`RetryClient`]: a
//! [`Throttler`] bounds concurrency, a periodic quota probe pauses before the quota runs
//! out, and throttling or transient failures are retried under separate caps. The
//! [`HttpApi`] client classifies JSON api responses for it, and the paginator walks
//! multi-page collections, optionally stopping at an incremental cutoff.

mod http_api;
mod paginator;
mod retry;
mod throttler;

pub use http_api::{HttpApi, RateLimitInfo, classify, rate_limit_from_headers};
pub use paginator::{PageInfo, PageParams, is_at_or_before_cutoff, paginate, paginate_newer_than};
pub use retry::{ApiResult, QuotaStatus, RetryClient, RetryPolicy, ThrottleHint};
pub use throttler::{Pause, Throttler};
