//! Rescaling Controller — drives the per-job resource state machine.
//!
//! ```text
//! WaitingResources ──start──▶ Running ──scale──▶ EvaluatingScale
//!        ▲                                            │
//!        └──────────────── restarted() ◀──────────────┘
//! ```
//!
//! Any phase may end in `Failed` when the wait timeout elapses below the
//! minimum required slots. Every evaluation takes `now` explicitly, and
//! evaluating the same view at the same time twice gives the same answer.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use ebb_core::{AdaptiveSchedulerConfig, VertexId};
use ebb_resources::ResourceView;

use crate::decision::*;

#[derive(Debug, Clone, PartialEq)]
pub enum RescalePhase {
    WaitingResources {
        since: Instant,
        /// Plan to start with once enough slots are available.
        target: ParallelismPlan,
        /// Armed stabilization timer: deadline and the slot count it was armed at.
        stabilization: Option<(Instant, u32)>,
    },
    Running {
        since: Instant,
    },
    EvaluatingScale {
        request: ScaleRequest,
    },
    Failed {
        reason: String,
    },
}

impl RescalePhase {
    pub fn name(&self) -> &'static str {
        match self {
            Self::WaitingResources { .. } => "waiting_resources",
            Self::Running { .. } => "running",
            Self::EvaluatingScale { .. } => "evaluating_scale",
            Self::Failed { .. } => "failed",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RescalingController {
    config: AdaptiveSchedulerConfig,
    phase: RescalePhase,
    requirements: BTreeMap<VertexId, VertexRequirement>,
    /// Parallelism of the tracked vertices as currently deployed.
    current: ParallelismPlan,
    view: ResourceView,
    /// View when Running was entered; stands in for a decision record's view
    /// until the first scaling decision.
    running_view: ResourceView,
    last_decision: Option<ScalingDecisionRecord>,
}

impl RescalingController {
    /// A controller for a freshly submitted job, waiting for resources.
    pub fn new(
        config: &AdaptiveSchedulerConfig,
        requirements: BTreeMap<VertexId, VertexRequirement>,
        now: Instant,
    ) -> Self {
        let target = requirements
            .iter()
            .map(|(id, req)| (id.clone(), req.desired))
            .collect();
        info!(
            vertices = requirements.len(),
            wait_timeout = %config.resource_wait_timeout,
            "waiting for resources"
        );
        Self {
            config: config.clone(),
            phase: RescalePhase::WaitingResources {
                since: now,
                target,
                stabilization: None,
            },
            requirements,
            current: ParallelismPlan::new(),
            view: ResourceView::empty(),
            running_view: ResourceView::empty(),
            last_decision: None,
        }
    }

    pub fn phase(&self) -> &RescalePhase {
        &self.phase
    }

    pub fn current_plan(&self) -> &ParallelismPlan {
        &self.current
    }

    pub fn last_decision(&self) -> Option<&ScalingDecisionRecord> {
        self.last_decision.as_ref()
    }

    pub fn view(&self) -> &ResourceView {
        &self.view
    }

    /// Slots needed before anything can run: the largest vertex minimum.
    pub fn required_slots(&self) -> u32 {
        self.requirements.values().map(|r| r.min).max().unwrap_or(0)
    }

    /// How long until a timer armed in WaitingResources fires, if any.
    pub fn next_deadline(&self, now: Instant) -> Option<Duration> {
        let RescalePhase::WaitingResources {
            since,
            stabilization,
            ..
        } = &self.phase
        else {
            return None;
        };
        let wait = self
            .config
            .resource_wait_timeout
            .duration()
            .map(|t| (*since + t).saturating_duration_since(now));
        let stabilize = stabilization.map(|(deadline, _)| deadline.saturating_duration_since(now));
        match (wait, stabilize) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    // ── Tracked vertices ───────────────────────────────────────────

    /// Start tracking a vertex deployed with `parallelism`.
    pub fn track_vertex(&mut self, vertex: &str, requirement: VertexRequirement, parallelism: u32) {
        self.requirements.insert(vertex.to_string(), requirement);
        self.current.insert(vertex.to_string(), parallelism);
    }

    /// Stop tracking a finished vertex, including in a pending plan.
    pub fn untrack_vertex(&mut self, vertex: &str) {
        self.requirements.remove(vertex);
        self.current.remove(vertex);
        match &mut self.phase {
            RescalePhase::EvaluatingScale { request } => {
                request.plan.remove(vertex);
            }
            RescalePhase::WaitingResources { target, .. } => {
                target.remove(vertex);
            }
            _ => {}
        }
    }

    // ── Inputs ─────────────────────────────────────────────────────

    /// A new Resource View arrived.
    pub fn on_resource_changed(&mut self, view: ResourceView, now: Instant) -> RescaleAction {
        debug!(slots = view.slot_count(), phase = self.phase.name(), "resource view changed");
        self.view = view;
        self.evaluate(now)
    }

    /// Timer-driven re-evaluation against the last known view.
    pub fn poll(&mut self, now: Instant) -> RescaleAction {
        self.evaluate(now)
    }

    /// The restart for the pending scale request completed; wait for the
    /// resources of the requested plan.
    pub fn restarted(&mut self, now: Instant) -> RescaleAction {
        let RescalePhase::EvaluatingScale { request } = &self.phase else {
            warn!(phase = self.phase.name(), "restart acknowledged without a pending scale request");
            return RescaleAction::Idle;
        };
        let mut target = self.current.clone();
        target.extend(request.plan.iter().map(|(v, p)| (v.clone(), *p)));
        info!(reason = %request.reason, "job restarted, waiting for resources");
        self.phase = RescalePhase::WaitingResources {
            since: now,
            target,
            stabilization: None,
        };
        self.evaluate(now)
    }

    // ── Evaluation ─────────────────────────────────────────────────

    fn evaluate(&mut self, now: Instant) -> RescaleAction {
        match self.phase.clone() {
            RescalePhase::WaitingResources {
                since,
                target,
                stabilization,
            } => self.evaluate_waiting(now, since, target, stabilization),
            RescalePhase::Running { since } => self.evaluate_running(now, since),
            RescalePhase::EvaluatingScale { .. } | RescalePhase::Failed { .. } => {
                RescaleAction::Idle
            }
        }
    }

    fn evaluate_waiting(
        &mut self,
        now: Instant,
        since: Instant,
        target: ParallelismPlan,
        stabilization: Option<(Instant, u32)>,
    ) -> RescaleAction {
        let slots = self.view.slot_count();
        let target_slots = target.values().copied().max().unwrap_or(0);
        if slots >= target_slots {
            return self.start(target, false, now);
        }

        let required = self.required_slots();
        let sufficient = slots >= required;

        if let Some(timeout) = self.config.resource_wait_timeout.duration() {
            if now.saturating_duration_since(since) >= timeout {
                if sufficient {
                    let plan = self.reduced(&target, slots);
                    return self.start(plan, true, now);
                }
                let reason = format!(
                    "resource wait timeout elapsed with {slots} of {required} required slots"
                );
                warn!(available = slots, required, "insufficient resources");
                self.phase = RescalePhase::Failed { reason };
                return RescaleAction::Insufficient {
                    available: slots,
                    required,
                };
            }
        }

        let stabilization_timeout = self.config.resource_stabilization_timeout;
        let stabilization = match stabilization {
            _ if !sufficient => None,
            Some((deadline, armed_at)) if slots <= armed_at => {
                if now >= deadline {
                    let plan = self.reduced(&target, slots);
                    return self.start(plan, true, now);
                }
                Some((deadline, armed_at))
            }
            _ => {
                debug!(slots, timeout = ?stabilization_timeout, "stabilization timer armed");
                Some((now + stabilization_timeout, slots))
            }
        };
        self.phase = RescalePhase::WaitingResources {
            since,
            target,
            stabilization,
        };
        RescaleAction::Idle
    }

    fn evaluate_running(&mut self, now: Instant, since: Instant) -> RescaleAction {
        let slots = self.view.slot_count();
        let mut increase = false;
        let mut decrease = false;
        let mut changes = ParallelismPlan::new();
        for (vertex, current) in &self.current {
            let Some(req) = self.requirements.get(vertex).filter(|r| r.elastic) else {
                continue;
            };
            let achievable = req.achievable(slots);
            if achievable == *current {
                continue;
            }
            if achievable < *current {
                decrease = true;
            } else if achievable - current >= self.config.min_parallelism_increase {
                increase = true;
            }
            changes.insert(vertex.clone(), achievable);
        }
        if changes.is_empty() {
            return RescaleAction::Idle;
        }

        let last_at = self.last_decision.as_ref().map(|d| d.decided_at);
        let since_last = |reference: Instant| now.saturating_duration_since(reference);

        if increase || decrease {
            let interval_ok =
                last_at.is_none_or(|at| since_last(at) >= self.config.scaling_interval_min);
            if interval_ok {
                let reason = if increase {
                    ScaleReason::Increase
                } else {
                    ScaleReason::Decrease
                };
                return self.request(changes, reason, now);
            }
            debug!(
                remaining = ?last_at.map(|at| self.config.scaling_interval_min.saturating_sub(since_last(at))),
                "scale deferred by scaling-interval.min"
            );
        }

        if let Some(max) = self.config.scaling_interval_max {
            let reference = last_at.unwrap_or(since);
            let reference_view = self
                .last_decision
                .as_ref()
                .map(|d| &d.view)
                .unwrap_or(&self.running_view);
            if since_last(reference) >= max && *reference_view != self.view {
                return self.request(changes, ScaleReason::Forced, now);
            }
        }
        RescaleAction::Idle
    }

    // ── Transitions ────────────────────────────────────────────────

    fn reduced(&self, target: &ParallelismPlan, slots: u32) -> ParallelismPlan {
        target
            .iter()
            .map(|(vertex, p)| {
                let parallelism = match self.requirements.get(vertex) {
                    Some(req) if req.elastic => (*p).min(slots).max(req.min),
                    _ => *p,
                };
                (vertex.clone(), parallelism)
            })
            .collect()
    }

    fn start(&mut self, plan: ParallelismPlan, reduced: bool, now: Instant) -> RescaleAction {
        info!(
            slots = self.view.slot_count(),
            reduced,
            vertices = plan.len(),
            "resources acquired, running"
        );
        self.current = plan.clone();
        self.running_view = self.view.clone();
        self.phase = RescalePhase::Running { since: now };
        RescaleAction::Start { plan, reduced }
    }

    fn request(&mut self, plan: ParallelismPlan, reason: ScaleReason, now: Instant) -> RescaleAction {
        for (vertex, to) in &plan {
            info!(
                %vertex,
                from = self.current.get(vertex).copied().unwrap_or(0),
                to,
                %reason,
                "scale requested"
            );
        }
        let request = ScaleRequest {
            plan: plan.clone(),
            reason,
            issued_at: now,
        };
        self.last_decision = Some(ScalingDecisionRecord {
            plan,
            decided_at: now,
            view: self.view.clone(),
        });
        self.phase = RescalePhase::EvaluatingScale {
            request: request.clone(),
        };
        RescaleAction::Scale(request)
    }
}
