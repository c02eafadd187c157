//! Incremental export machinery shared by all integrations
//!
//! A run opens [`Session`]s through a [`SessionManager`]; each session streams one entity
//! type into `uploads/` and keeps the cursor that lets the next run skip unchanged data.
//! Cursors live in a [`LastProcessedStore`]. Dependent collections are exported with a
//! [`FanOut`] pipeline, of which [`export_pull_requests_for_repo`] is the main user.

mod fanout;
mod model;
mod pull_requests;
mod session;
mod store;

pub use fanout::{ErrorSink, FanOut, FanOutResult, Page, Publisher, SideOutput, StageInput};
pub use model::{PullRequest, PullRequestComment, PullRequestCommit, PullRequestReview, Repo, User, entity};
pub use pull_requests::{PullRequestSource, export_pull_requests_for_repo};
pub use session::{Cursor, ParentRef, RECORDS_EXTENSION, SUMMARY_EXTENSION, Session, SessionManager, SessionSummary, UserSender};
pub use store::LastProcessedStore;
