use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;

/// Steps of a resize. The replace-migrate sub-machine runs from `LaunchReplacement` to `UpdateDns`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResizeStep {
    Inspecting,
    NoOpSameProfile,
    InPlaceResize,
    StopOriginal,
    LaunchReplacement,
    ConfirmCapacity,
    QuiesceReplacement,
    RetireOriginalMarketRequest,
    DetachFromOriginal,
    TerminateOriginal,
    AttachToReplacement,
    StartReplacement,
    UpdateDns,
    Done,
}

impl ResizeStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResizeStep::Inspecting => "inspecting",
            ResizeStep::NoOpSameProfile => "no_op_same_profile",
            ResizeStep::InPlaceResize => "in_place_resize",
            ResizeStep::StopOriginal => "stop_original",
            ResizeStep::LaunchReplacement => "launch_replacement",
            ResizeStep::ConfirmCapacity => "confirm_capacity",
            ResizeStep::QuiesceReplacement => "quiesce_replacement",
            ResizeStep::RetireOriginalMarketRequest => "retire_original_market_request",
            ResizeStep::DetachFromOriginal => "detach_from_original",
            ResizeStep::TerminateOriginal => "terminate_original",
            ResizeStep::AttachToReplacement => "attach_to_replacement",
            ResizeStep::StartReplacement => "start_replacement",
            ResizeStep::UpdateDns => "update_dns",
            ResizeStep::Done => "done",
        }
    }

    /// Whether this step may modify the original resource, its market request or its volumes.
    /// Only reachable once the replacement has been confirmed running.
    pub fn touches_original(&self) -> bool {
        *self >= ResizeStep::RetireOriginalMarketRequest && *self != ResizeStep::Done
    }
}

impl fmt::Display for ResizeStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Transition {
    pub from: ResizeStep,
    pub to: ResizeStep,
    pub reason: String,
    pub at: DateTime<Utc>,
}

/// Current step plus every transition taken so far.
#[derive(Debug, Clone, Serialize)]
pub struct StateHistory {
    subject: String,
    current: ResizeStep,
    transitions: Vec<Transition>,
}

impl StateHistory {
    pub fn new(subject: &str) -> Self {
        Self {
            subject: subject.to_string(),
            current: ResizeStep::Inspecting,
            transitions: Vec::new(),
        }
    }

    pub fn current(&self) -> ResizeStep {
        self.current
    }

    pub fn transition(&mut self, to: ResizeStep, reason: &str) {
        let from = self.current;
        tracing::info!(
            "🔄 [state_machine] {}: {} -> {} ({})",
            self.subject,
            from,
            to,
            reason
        );
        self.transitions.push(Transition {
            from,
            to,
            reason: reason.to_string(),
            at: Utc::now(),
        });
        self.current = to;
    }

    pub fn steps(&self) -> Vec<ResizeStep> {
        self.transitions.iter().map(|t| t.to).collect()
    }

    pub fn into_transitions(self) -> Vec<Transition> {
        self.transitions
    }
}

/// What a replace-migrate has done so far. Carried by `MigrationAborted` for manual
/// reconciliation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationProgress {
    pub original_id: String,
    pub replacement_id: Option<String>,
    pub cancelled_market_request: Option<String>,
    pub detached_volumes: Vec<String>,
    pub original_terminated: bool,
    pub attached_volumes: Vec<String>,
}

impl MigrationProgress {
    pub fn new(original_id: &str) -> Self {
        Self {
            original_id: original_id.to_string(),
            ..Default::default()
        }
    }

    /// True while nothing has been done to the original, its market request or its volumes.
    pub fn original_untouched(&self) -> bool {
        self.cancelled_market_request.is_none()
            && self.detached_volumes.is_empty()
            && !self.original_terminated
    }
}

impl fmt::Display for MigrationProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "original={} replacement={} cancelled_request={} detached={:?} original_terminated={} attached={:?}",
            self.original_id,
            self.replacement_id.as_deref().unwrap_or("-"),
            self.cancelled_market_request.as_deref().unwrap_or("-"),
            self.detached_volumes,
            self.original_terminated,
            self.attached_volumes
        )
    }
}
