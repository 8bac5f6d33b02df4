use super::deterministic_id;
use std::net::IpAddr;
use tracing::debug;
use uuid::Uuid;

/// Clustering key for a session described by selector, user and address.
///
/// Falls back to a random id when none of the parts is known.
pub fn clustering_id(session_selector: &str, user_id: &str, ip: Option<IpAddr>) -> String {
    let ip = ip.map(|ip| ip.to_string()).unwrap_or_default();
    if session_selector.is_empty() && user_id.is_empty() && ip.is_empty() {
        debug!("no session identification available, using random clustering id");
        return random_clustering_id();
    }
    deterministic_id(&[session_selector, "#", user_id, "#", &ip])
}

/// Clustering key unique to a single record
pub fn random_clustering_id() -> String {
    deterministic_id(&[&Uuid::new_v4().to_string()])
}
