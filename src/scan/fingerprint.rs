//! Activity-event fingerprints.
//!
//! A fingerprint identifies one upstream activity event for deduplication.
//! It is the SHA-256 of the event's identifying fields joined by `-`, with
//! absent fields contributing the literal `null`. Fingerprints are only ever
//! compared for equality and stored in the processed-events set; they are
//! never rendered to users.

use hex::encode as hex_encode;
use sha2::{Digest, Sha256};

use crate::types::Owner;

/// Computes the fingerprint of one activity event.
///
/// `kind_token` is the stable token of the event kind: the numeric ordinal
/// for activity-feed kinds, the kind string itself for issue-feed events.
pub fn event_fingerprint(
    kind_token: &str,
    owner: &Owner,
    repo_name: &str,
    issue_number: i64,
    created_at_millis: i64,
    actor_login: Option<&str>,
) -> String {
    let input = format!(
        "{}-{}-{}-{}-{}-{}-{}",
        kind_token,
        owner.org_name().unwrap_or("null"),
        owner.user_name().unwrap_or("null"),
        repo_name,
        issue_number,
        created_at_millis,
        actor_login.unwrap_or("null"),
    );

    let mut hasher = Sha256::new();
    hasher.update(input.as_bytes());
    hex_encode(hasher.finalize())
}
