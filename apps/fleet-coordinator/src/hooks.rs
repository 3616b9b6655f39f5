//! Seams to the collaborators outside the coordinator core: capability
//! negotiation at handshake time and persistence of finished sessions.

use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tracing::info;

use crate::session::SessionOutcome;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Negotiation {
    /// Admit the node with the given (possibly narrowed) capability set.
    Accept(BTreeSet<String>),
    Reject(String),
}

#[async_trait]
pub trait CapabilityNegotiator: Send + Sync {
    async fn negotiate(&self, node_id: &str, declared: &BTreeSet<String>) -> Negotiation;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAll;

#[async_trait]
impl CapabilityNegotiator for AcceptAll {
    async fn negotiate(&self, _node_id: &str, declared: &BTreeSet<String>) -> Negotiation {
        Negotiation::Accept(declared.clone())
    }
}

/// Admits only nodes declaring every capability in the set.
#[derive(Debug, Default, Clone)]
pub struct RequiredCapabilities {
    required: BTreeSet<String>,
}

impl RequiredCapabilities {
    pub fn new<I, S>(required: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            required: required.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl CapabilityNegotiator for RequiredCapabilities {
    async fn negotiate(&self, _node_id: &str, declared: &BTreeSet<String>) -> Negotiation {
        let missing: Vec<&str> = self
            .required
            .difference(declared)
            .map(String::as_str)
            .collect();
        if missing.is_empty() {
            Negotiation::Accept(declared.clone())
        } else {
            Negotiation::Reject(format!("missing capabilities: {}", missing.join(", ")))
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("persistence io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode session outcome: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("persistence backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait PersistenceHook: Send + Sync {
    /// Called once per session on reaching `Finalized` or `Aborted`.
    async fn session_closed(&self, outcome: &SessionOutcome) -> Result<(), PersistenceError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPersistence;

#[async_trait]
impl PersistenceHook for NoopPersistence {
    async fn session_closed(&self, _outcome: &SessionOutcome) -> Result<(), PersistenceError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryPersistence {
    outcomes: parking_lot::Mutex<Vec<SessionOutcome>>,
}

impl InMemoryPersistence {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn outcomes(&self) -> Vec<SessionOutcome> {
        self.outcomes.lock().clone()
    }
}

#[async_trait]
impl PersistenceHook for InMemoryPersistence {
    async fn session_closed(&self, outcome: &SessionOutcome) -> Result<(), PersistenceError> {
        self.outcomes.lock().push(outcome.clone());
        Ok(())
    }
}

/// Writes each outcome to `<dir>/<session_id>.json`.
#[derive(Debug, Clone)]
pub struct JsonDirectoryPersistence {
    dir: PathBuf,
}

impl JsonDirectoryPersistence {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for(&self, outcome: &SessionOutcome) -> PathBuf {
        self.dir.join(format!("{}.json", outcome.session_id))
    }
}

#[async_trait]
impl PersistenceHook for JsonDirectoryPersistence {
    async fn session_closed(&self, outcome: &SessionOutcome) -> Result<(), PersistenceError> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let body = serde_json::to_vec_pretty(outcome)?;
        let path = self.path_for(outcome);
        let staging = path.with_extension("json.tmp");
        tokio::fs::write(&staging, body).await?;
        tokio::fs::rename(&staging, &path).await?;
        info!(
            target = "fleet::persistence",
            session_id = %outcome.session_id,
            path = %path.display(),
            "session outcome written"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Session, SessionState};
    use uuid::Uuid;

    fn caps(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn required_capabilities_name_what_is_missing() {
        let negotiator = RequiredCapabilities::new(["imu", "video"]);
        assert_eq!(
            negotiator.negotiate("cam-1", &caps(&["imu", "video", "gps"])).await,
            Negotiation::Accept(caps(&["gps", "imu", "video"]))
        );
        assert_eq!(
            negotiator.negotiate("cam-2", &caps(&["imu"])).await,
            Negotiation::Reject("missing capabilities: video".into())
        );
    }

    #[test_timeout::tokio_timeout_test(10)]
    async fn json_directory_writes_one_file_per_session() {
        let dir = std::env::temp_dir().join(format!("fleet-outcomes-{}", Uuid::new_v4()));
        let hook = JsonDirectoryPersistence::new(&dir);

        let mut session = Session::new(Uuid::new_v4(), caps(&["cam-1"]), Vec::new(), 0, None);
        session.transition(SessionState::Arming).expect("arming");
        session.transition(SessionState::Aborted).expect("aborted");
        let outcome = session.outcome();
        hook.session_closed(&outcome).await.expect("persist");

        let raw = tokio::fs::read(hook.path_for(&outcome)).await.expect("read back");
        let value: serde_json::Value = serde_json::from_slice(&raw).expect("json");
        assert_eq!(value["final_state"], "aborted");
        assert_eq!(value["session_id"], outcome.session_id.to_string());
        let _ = tokio::fs::remove_dir_all(&dir).await;
    }
}
