//! Recording session lifecycle.
//!
//! ```text
//! Idle ─▶ Arming ─▶ Recording ─▶ Stopping ─▶ Finalized
//!           │           │            │
//!           └───────────┴────────────┴─────▶ Aborted
//! ```
//!
//! Participants are fixed when arming begins. Nodes that drop out later are
//! recorded as lost rather than removed, so the outcome always accounts for
//! every node that was asked to record.

mod coordinator;

use std::collections::{BTreeMap, BTreeSet};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{FailureReason, NodeFailure};

pub use coordinator::{SessionHandle, SessionSettings, spawn_coordinator};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    Arming,
    Recording,
    Stopping,
    Finalized,
    Aborted,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::Arming => "arming",
            SessionState::Recording => "recording",
            SessionState::Stopping => "stopping",
            SessionState::Finalized => "finalized",
            SessionState::Aborted => "aborted",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Finalized | SessionState::Aborted)
    }

    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Idle, Arming)
                | (Arming, Recording)
                | (Arming, Aborted)
                | (Recording, Stopping)
                | (Recording, Aborted)
                | (Stopping, Finalized)
                | (Stopping, Aborted)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal session transition {from:?} -> {to:?}")]
pub struct InvalidTransition {
    pub from: SessionState,
    pub to: SessionState,
}

/// Per-node progress through the session's commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AckState {
    Pending,
    Armed,
    Started,
    Stopped,
    Lost,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StopRecord {
    pub acked_at_us: i64,
    /// Node-local time of the last captured sample.
    pub final_local_us: Option<i64>,
    /// `final_local_us` mapped onto the coordinator timeline.
    pub final_coordinator_us: Option<i64>,
    pub offset_us: Option<i64>,
    pub drift_ppm: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LostRecord {
    #[serde(flatten)]
    pub reason: FailureReason,
    pub during: SessionState,
    /// Progress the node had acknowledged before it was lost.
    pub last_ack: AckState,
    pub at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeAck {
    pub state: AckState,
    pub armed_at_us: Option<i64>,
    /// Node-local instant the node was told to start at.
    pub local_start_us: Option<i64>,
    pub started_ack_us: Option<i64>,
    pub stop: Option<StopRecord>,
    pub lost: Option<LostRecord>,
}

impl NodeAck {
    fn pending() -> Self {
        Self {
            state: AckState::Pending,
            armed_at_us: None,
            local_start_us: None,
            started_ack_us: None,
            stop: None,
            lost: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopCause {
    Requested,
    DurationElapsed,
    InsufficientLiveNodes,
    ArmingFailed,
    AbortRequested,
    Shutdown,
}

impl StopCause {
    pub fn as_str(self) -> &'static str {
        match self {
            StopCause::Requested => "requested",
            StopCause::DurationElapsed => "duration_elapsed",
            StopCause::InsufficientLiveNodes => "insufficient_live_nodes",
            StopCause::ArmingFailed => "arming_failed",
            StopCause::AbortRequested => "abort_requested",
            StopCause::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArmRequest {
    pub nodes: Vec<String>,
    /// Stop automatically this long after the scheduled start.
    #[serde(default, rename = "duration_ms", with = "opt_millis")]
    pub duration: Option<Duration>,
}

impl ArmRequest {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            nodes: nodes.into_iter().map(Into::into).collect(),
            duration: None,
        }
    }

    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration = Some(duration);
        self
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArmReport {
    pub session_id: Uuid,
    pub participants: Vec<String>,
    pub rejected: Vec<NodeFailure>,
    /// Coordinator time every participant starts capturing.
    pub start_at_us: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub session_id: Uuid,
    pub state: SessionState,
    pub participating_nodes: BTreeSet<String>,
    /// Requested nodes that were not ready when arming began.
    pub rejected: Vec<NodeFailure>,
    pub created_at_ms: u64,
    pub created_at_us: i64,
    pub started_at_us: Option<i64>,
    pub stopped_at_us: Option<i64>,
    pub duration_ms: Option<u64>,
    pub stop_cause: Option<StopCause>,
    pub per_node_ack: BTreeMap<String, NodeAck>,
}

pub type SessionSnapshot = Session;

impl Session {
    pub fn new(
        session_id: Uuid,
        participants: BTreeSet<String>,
        rejected: Vec<NodeFailure>,
        created_at_us: i64,
        duration: Option<Duration>,
    ) -> Self {
        let per_node_ack = participants
            .iter()
            .map(|node| (node.clone(), NodeAck::pending()))
            .collect();
        Self {
            session_id,
            state: SessionState::Idle,
            participating_nodes: participants,
            rejected,
            created_at_ms: now_millis(),
            created_at_us,
            started_at_us: None,
            stopped_at_us: None,
            duration_ms: duration.map(|d| d.as_millis() as u64),
            stop_cause: None,
            per_node_ack,
        }
    }

    /// Moves to `next`, returning the previous state.
    pub fn transition(&mut self, next: SessionState) -> Result<SessionState, InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                from: self.state,
                to: next,
            });
        }
        Ok(std::mem::replace(&mut self.state, next))
    }

    pub fn ack_state(&self, node_id: &str) -> Option<AckState> {
        self.per_node_ack.get(node_id).map(|ack| ack.state)
    }

    pub fn record_armed(&mut self, node_id: &str, at_us: i64) -> bool {
        match self.per_node_ack.get_mut(node_id) {
            Some(ack) if ack.state == AckState::Pending => {
                ack.state = AckState::Armed;
                ack.armed_at_us = Some(at_us);
                true
            }
            _ => false,
        }
    }

    pub fn record_local_start(&mut self, node_id: &str, local_start_us: i64) {
        if let Some(ack) = self.per_node_ack.get_mut(node_id) {
            ack.local_start_us = Some(local_start_us);
        }
    }

    pub fn record_started(&mut self, node_id: &str, at_us: i64) -> bool {
        match self.per_node_ack.get_mut(node_id) {
            Some(ack) if ack.state == AckState::Armed => {
                ack.state = AckState::Started;
                ack.started_ack_us = Some(at_us);
                true
            }
            _ => false,
        }
    }

    pub fn record_stopped(&mut self, node_id: &str, record: StopRecord) -> bool {
        match self.per_node_ack.get_mut(node_id) {
            Some(ack) if matches!(ack.state, AckState::Armed | AckState::Started) => {
                ack.state = AckState::Stopped;
                ack.stop = Some(record);
                true
            }
            _ => false,
        }
    }

    /// Records `node_id` as lost. Nodes that already stopped cleanly, or were
    /// already lost, are left alone.
    pub fn mark_lost(&mut self, node_id: &str, reason: FailureReason, at_us: i64) -> bool {
        let during = self.state;
        match self.per_node_ack.get_mut(node_id) {
            Some(ack) if !matches!(ack.state, AckState::Stopped | AckState::Lost) => {
                let last_ack = std::mem::replace(&mut ack.state, AckState::Lost);
                ack.lost = Some(LostRecord {
                    reason,
                    during,
                    last_ack,
                    at_us,
                });
                true
            }
            _ => false,
        }
    }

    pub fn is_participant(&self, node_id: &str) -> bool {
        self.participating_nodes.contains(node_id)
    }

    /// Participants not yet lost.
    pub fn live_nodes(&self) -> impl Iterator<Item = &str> {
        self.per_node_ack
            .iter()
            .filter(|(_, ack)| ack.state != AckState::Lost)
            .map(|(node, _)| node.as_str())
    }

    /// Lost participants that may still be armed or capturing.
    pub fn lost_while_capturing(&self) -> Vec<String> {
        self.per_node_ack
            .iter()
            .filter(|(_, ack)| {
                ack.lost
                    .as_ref()
                    .is_some_and(|lost| matches!(lost.last_ack, AckState::Armed | AckState::Started))
            })
            .map(|(node, _)| node.clone())
            .collect()
    }

    /// Live participants that have not reached `state`.
    pub fn awaiting(&self, state: AckState) -> Vec<String> {
        self.per_node_ack
            .iter()
            .filter(|(_, ack)| ack.state != AckState::Lost && ack.state < state)
            .map(|(node, _)| node.clone())
            .collect()
    }

    pub fn failures(&self) -> Vec<NodeFailure> {
        self.per_node_ack
            .iter()
            .filter_map(|(node, ack)| {
                ack.lost
                    .as_ref()
                    .map(|lost| NodeFailure::new(node.clone(), lost.reason.clone()))
            })
            .collect()
    }

    pub fn outcome(&self) -> SessionOutcome {
        let clean_nodes = self
            .per_node_ack
            .iter()
            .filter(|(_, ack)| ack.state == AckState::Stopped)
            .map(|(node, _)| node.clone())
            .collect();
        SessionOutcome {
            session_id: self.session_id,
            final_state: self.state,
            stop_cause: self.stop_cause,
            created_at_ms: self.created_at_ms,
            started_at_us: self.started_at_us,
            stopped_at_us: self.stopped_at_us,
            clean_nodes,
            lost_nodes: self.failures(),
            rejected: self.rejected.clone(),
            nodes: self.per_node_ack.clone(),
        }
    }
}

/// Final record of a session, handed to persistence.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionOutcome {
    pub session_id: Uuid,
    pub final_state: SessionState,
    pub stop_cause: Option<StopCause>,
    pub created_at_ms: u64,
    pub started_at_us: Option<i64>,
    pub stopped_at_us: Option<i64>,
    pub clean_nodes: Vec<String>,
    pub lost_nodes: Vec<NodeFailure>,
    pub rejected: Vec<NodeFailure>,
    pub nodes: BTreeMap<String, NodeAck>,
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionState;

    fn session(nodes: &[&str]) -> Session {
        Session::new(
            Uuid::new_v4(),
            nodes.iter().map(|n| n.to_string()).collect(),
            Vec::new(),
            0,
            None,
        )
    }

    #[test_timeout::timeout]
    fn only_documented_transitions_are_allowed() {
        use SessionState::*;
        let all = [Idle, Arming, Recording, Stopping, Finalized, Aborted];
        let allowed: Vec<(SessionState, SessionState)> = all
            .iter()
            .flat_map(|from| all.iter().map(move |to| (*from, *to)))
            .filter(|(from, to)| from.can_transition_to(*to))
            .collect();
        assert_eq!(
            allowed,
            vec![
                (Idle, Arming),
                (Arming, Recording),
                (Arming, Aborted),
                (Recording, Stopping),
                (Recording, Aborted),
                (Stopping, Finalized),
                (Stopping, Aborted),
            ]
        );
        for terminal in [Finalized, Aborted] {
            assert!(terminal.is_terminal());
            assert!(all.iter().all(|to| !terminal.can_transition_to(*to)));
        }
    }

    #[test_timeout::timeout]
    fn transition_reports_previous_state() {
        let mut s = session(&["a"]);
        assert_eq!(s.transition(SessionState::Arming), Ok(SessionState::Idle));
        assert_eq!(
            s.transition(SessionState::Finalized),
            Err(InvalidTransition {
                from: SessionState::Arming,
                to: SessionState::Finalized
            })
        );
        assert_eq!(s.state, SessionState::Arming);
    }

    #[test_timeout::timeout]
    fn lost_nodes_stay_in_the_session() {
        let mut s = session(&["a", "b", "c"]);
        s.transition(SessionState::Arming).expect("arming");
        for node in ["a", "b", "c"] {
            assert!(s.record_armed(node, 10));
        }
        s.transition(SessionState::Recording).expect("recording");
        assert!(s.mark_lost(
            "b",
            FailureReason::Lost {
                state: ConnectionState::Disconnected
            },
            20
        ));
        assert!(!s.mark_lost("b", FailureReason::Timeout, 30));

        assert_eq!(s.participating_nodes.len(), 3);
        assert_eq!(s.live_nodes().collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(s.awaiting(AckState::Stopped), vec!["a".to_string(), "c".to_string()]);
        let lost = s.per_node_ack["b"].lost.as_ref().expect("lost record");
        assert_eq!(lost.during, SessionState::Recording);
        assert_eq!(lost.last_ack, AckState::Armed);
        assert_eq!(s.lost_while_capturing(), vec!["b".to_string()]);

        s.transition(SessionState::Stopping).expect("stopping");
        for node in ["a", "c"] {
            assert!(s.record_stopped(
                node,
                StopRecord {
                    acked_at_us: 40,
                    final_local_us: Some(39),
                    final_coordinator_us: Some(39),
                    offset_us: Some(0),
                    drift_ppm: Some(0.0),
                }
            ));
        }
        assert!(!s.mark_lost("a", FailureReason::Timeout, 50));
        s.transition(SessionState::Finalized).expect("finalized");

        let outcome = s.outcome();
        assert_eq!(outcome.clean_nodes, vec!["a".to_string(), "c".to_string()]);
        assert_eq!(outcome.lost_nodes.len(), 1);
        assert_eq!(outcome.lost_nodes[0].node_id, "b");
        assert_eq!(outcome.final_state, SessionState::Finalized);
    }

    #[test_timeout::timeout]
    fn arm_request_reads_duration_in_millis() {
        let request: ArmRequest =
            serde_json::from_str(r#"{"nodes":["a","b"],"duration_ms":1500}"#).expect("parse");
        assert_eq!(request, ArmRequest::new(["a", "b"]).with_duration(Duration::from_millis(1500)));
        let bare: ArmRequest = serde_json::from_str(r#"{"nodes":["a"]}"#).expect("parse");
        assert_eq!(bare.duration, None);
    }
}
