use crate::buffer::{HistoryStore, SessionState};
use crate::record::{InputRecord, ServiceInput};
use chrono::Duration;
use tracing::debug;

/// Collapses the events of a user session into one record.
///
/// A session closes once a later record arrives more than the idle
/// timeout after the session's last event. The first record of the
/// session is then emitted with its cluster size set.
#[derive(Debug)]
pub struct ClusteringAnalyzer {
    app_type: String,
    idle_timeout: Duration,
}

impl ClusteringAnalyzer {
    pub fn new(app_type: &str, idle_timeout_secs: u64) -> Self {
        Self {
            app_type: app_type.to_string(),
            idle_timeout: Duration::seconds(idle_timeout_secs as i64),
        }
    }

    pub fn preprocess(&self, rec: InputRecord, history: &mut dyn HistoryStore) -> Vec<InputRecord> {
        let now = rec.time();
        let mut state = history.take_state();

        let expired: Vec<String> = state
            .sessions
            .iter()
            .filter(|(_, s)| now - s.last_seen > self.idle_timeout)
            .map(|(key, _)| key.clone())
            .collect();
        let mut finished: Vec<InputRecord> = expired
            .into_iter()
            .filter_map(|key| state.sessions.remove(&key))
            .map(|session| {
                let mut out = session.record;
                out.set_cluster_size(session.size);
                out
            })
            .collect();
        finished.sort_by_key(|r| r.time());

        let key = rec.clustering_client_id();
        match state.sessions.get_mut(&key) {
            Some(session) => {
                if now > session.last_seen {
                    session.last_seen = now;
                }
                session.size += 1;
            }
            None => {
                state.sessions.insert(
                    key,
                    SessionState {
                        first_seen: now,
                        last_seen: now,
                        size: 1,
                        record: rec,
                    },
                );
            }
        }
        if !finished.is_empty() {
            debug!(
                app_type = %self.app_type,
                closed = finished.len(),
                open = state.sessions.len(),
                "Closed clustered sessions"
            );
        }
        history.set_state(state);
        finished
    }
}
