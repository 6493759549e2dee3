//! Correlation identifier generation.
//!
//! Three kinds of identifiers flow through a transaction:
//!
//! - **Session**: caller supplied, or generated with [`generate_x_tid`] from the
//!   topic/scenario name when the caller did not send one.
//! - **Init invoke**: the root correlation id of a transaction, `x-tid:` followed by
//!   a UUIDv7 so ids sort by creation time ([`init_invoke`]).
//! - **Invoke**: one id per outbound call, paired between the request and the
//!   response events of that call ([`generate_x_tid`]).
//!
//! All functions here are free of shared state.

use chrono::{DateTime, Utc};
use rand::Rng;
use rand::distributions::Alphanumeric;
use uuid::Uuid;

/// Total length of an id produced by [`generate_x_tid`].
pub const X_TID_LENGTH: usize = 22;

/// Maximum number of node-name characters kept in an x-tid prefix.
const NODE_PREFIX_LENGTH: usize = 5;

/// Prefix shared by all transaction-level correlation ids.
pub const X_TID_PREFIX: &str = "x-tid:";

/// Generate a per-call invoke id for `node`.
///
/// Layout: the first five characters of `node`, a `-`, the current date as
/// `yyMMdd`, then random alphanumerics up to [`X_TID_LENGTH`] characters.
///
/// # Examples
///
/// ```
/// use correlate_core::id::{generate_x_tid, X_TID_LENGTH};
///
/// let id = generate_x_tid("send_mail");
/// assert!(id.starts_with("send_-"));
/// assert_eq!(id.len(), X_TID_LENGTH);
/// ```
#[must_use]
pub fn generate_x_tid(node: &str) -> String {
    generate_x_tid_at(node, Utc::now())
}

/// Same as [`generate_x_tid`] with an explicit timestamp.
#[must_use]
pub fn generate_x_tid_at(node: &str, now: DateTime<Utc>) -> String {
    let prefix: String = node.chars().take(NODE_PREFIX_LENGTH).collect();
    let mut x_tid = format!("{prefix}-{}", now.format("%y%m%d"));

    let remaining = X_TID_LENGTH.saturating_sub(x_tid.len());
    x_tid.extend(
        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(remaining)
            .map(char::from),
    );
    x_tid
}

/// Generate the root correlation id of a transaction: `x-tid:<uuidv7>`.
#[must_use]
pub fn init_invoke() -> String {
    format!("{X_TID_PREFIX}{}", Uuid::now_v7())
}

/// Correlation id assigned to one consumed message:
/// `x-tid:<uuidv7>:<generation>`, where `generation` is the consumer-group
/// generation the message was delivered under.
#[must_use]
pub fn message_x_tid(generation: i32) -> String {
    format!("{X_TID_PREFIX}{}:{generation}", Uuid::now_v7())
}

/// Fallback init invoke used when a caller passes an empty one:
/// `<app>_<yyyyMMddHHmmss>`.
#[must_use]
pub fn default_init_invoke(app_name: &str, now: DateTime<Utc>) -> String {
    format!("{app_name}_{}", now.format("%Y%m%d%H%M%S"))
}

/// Generate a session id for callers that supplied none (a UUIDv7).
#[must_use]
pub fn new_session() -> String {
    Uuid::now_v7().to_string()
}
