//! Request anomaly filtering.
//!
//! Stateless pattern checks applied to every request before routing reaches
//! business logic. Two disjoint, data-driven lists: a block list of
//! sensitive-resource fragments answered with not-found, and a flag list of
//! attack signatures that is only logged. The check itself is synchronous;
//! the durable security event is written from a spawned task.

pub mod rate_limit;

use std::net::SocketAddr;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::http::header::USER_AGENT;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use sea_orm::ActiveValue::{NotSet, Set};
use sea_orm::{DatabaseConnection, EntityTrait};
use tracing::{error, warn};

use crate::entities::security_event;
use crate::http::HttpError;
use crate::state::AppState;

/// Sensitive-resource fragments. Matching requests never reach a handler.
pub const BLOCKED_PATH_FRAGMENTS: &[&str] = &[
    "/.env",
    ".env",
    "/env",
    "/.git",
    ".git",
    "/config",
    "/.ssh",
    ".ssh",
    "/backup",
    "/.htaccess",
    ".htaccess",
    "/web.config",
    "/.npmrc",
    "/.dockerenv",
    "/dockerfile",
    "/docker-compose",
    "/.aws",
    "/.azure",
];

/// Attack signatures worth recording but not blocking on their own.
pub const FLAGGED_PATTERNS: &[&str] = &[
    "/admin",
    "/wp-admin",
    "/phpmyadmin",
    "/shell",
    "/cmd",
    "/exec",
    "/../",
    "/etc/passwd",
    "select",
    "union",
    "drop",
    "insert",
    "<script>",
    "eval(",
    "base64_decode",
    "system(",
    "exec(",
    "/cgi-bin",
    "/xmlrpc",
    "/wp-login",
    "/administrator",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Clean,
    /// Matched the flag list; request proceeds, match is recorded.
    Flagged(&'static str),
    /// Matched the block list; request is answered with not-found.
    Blocked(&'static str),
}

/// Check a request target (path + query) against both lists, block list
/// first.
pub fn inspect_target(target: &str) -> FilterVerdict {
    let lowered = target.to_lowercase();
    for fragment in BLOCKED_PATH_FRAGMENTS {
        if lowered.contains(fragment) {
            return FilterVerdict::Blocked(fragment);
        }
    }
    for pattern in FLAGGED_PATTERNS {
        if lowered.contains(pattern) {
            return FilterVerdict::Flagged(pattern);
        }
    }
    FilterVerdict::Clean
}

/// Axum middleware wrapping the whole router.
pub async fn filter_request(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let target = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let user_agent = request
        .headers()
        .get(USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string());
    let ip_address = addr.ip().to_string();

    match inspect_target(&target) {
        FilterVerdict::Clean => next.run(request).await,
        FilterVerdict::Flagged(pattern) => {
            warn!("Suspicious pattern {pattern} in {target} from {ip_address}");
            spawn_record_event(
                state.database.clone(),
                ip_address,
                target,
                pattern,
                user_agent,
                false,
            );
            next.run(request).await
        }
        FilterVerdict::Blocked(pattern) => {
            error!("Blocked access to {target} from {ip_address} (pattern {pattern})");
            spawn_record_event(
                state.database.clone(),
                ip_address,
                target,
                pattern,
                user_agent,
                true,
            );
            // Not-found rather than forbidden, to avoid confirming the
            // resource exists.
            HttpError::new(StatusCode::NOT_FOUND, "Not Found".to_string()).into_response()
        }
    }
}

fn spawn_record_event(
    database: DatabaseConnection,
    ip_address: String,
    endpoint: String,
    pattern: &'static str,
    user_agent: Option<String>,
    blocked: bool,
) {
    tokio::spawn(async move {
        let event = security_event::ActiveModel {
            id: NotSet,
            ip_address: Set(truncated(&ip_address, 45)),
            endpoint: Set(truncated(&endpoint, 512)),
            pattern: Set(pattern.to_string()),
            user_agent: Set(user_agent.map(|ua| truncated(&ua, 512))),
            blocked: Set(blocked),
            created_at: Set(Utc::now().fixed_offset()),
        };
        if let Err(err) = security_event::Entity::insert(event).exec(&database).await {
            error!("Failed to record security event: {err}");
        }
    });
}

fn truncated(value: &str, max_chars: usize) -> String {
    value.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sensitive_paths_are_blocked() {
        assert_eq!(inspect_target("/.env"), FilterVerdict::Blocked("/.env"));
        assert_eq!(inspect_target("/app/.git/HEAD"), FilterVerdict::Blocked("/.git"));
        assert_eq!(
            inspect_target("/backup/db.sql"),
            FilterVerdict::Blocked("/backup")
        );
        assert_eq!(
            inspect_target("/Dockerfile"),
            FilterVerdict::Blocked("/dockerfile")
        );
    }

    #[test]
    fn test_attack_signatures_are_flagged_not_blocked() {
        assert_eq!(
            inspect_target("/wp-admin/setup.php"),
            FilterVerdict::Flagged("/wp-admin")
        );
        assert_eq!(
            inspect_target("/search?q=union+all"),
            FilterVerdict::Flagged("union")
        );
        assert_eq!(
            inspect_target("/a/../../etc/passwd"),
            FilterVerdict::Flagged("/../")
        );
    }

    #[test]
    fn test_block_list_takes_precedence() {
        assert_eq!(
            inspect_target("/wp-admin/.env"),
            FilterVerdict::Blocked("/.env")
        );
    }

    #[test]
    fn test_service_routes_are_clean() {
        assert_eq!(inspect_target("/health"), FilterVerdict::Clean);
        assert_eq!(inspect_target("/api/purchase"), FilterVerdict::Clean);
        assert_eq!(inspect_target("/api/check_user"), FilterVerdict::Clean);
        assert_eq!(inspect_target("/user/purchases/42"), FilterVerdict::Clean);
        assert_eq!(
            inspect_target("/tonconnect-manifest.json"),
            FilterVerdict::Clean
        );
    }

    #[test]
    fn test_matching_is_case_insensitive() {
        assert_eq!(inspect_target("/.ENV"), FilterVerdict::Blocked("/.env"));
        assert_eq!(
            inspect_target("/q?stmt=SELECT%20*"),
            FilterVerdict::Flagged("select")
        );
    }
}
