//! Frame-synced cooperative coroutines: units of logic that suspend at a
//! yield point and resume on a later frame instead of running to
//! completion.
//!
//! Each coroutine is polled at most once per frame through a plain enum
//! state machine (`Suspended`/`Finished`/`Cancelled`) rather than a native
//! `async` task, so parent/child cancellation and `AfterFrames` countdowns
//! stay simple mutable state instead of futures plumbing.

use std::fmt;

use crate::component::ComponentTypeId;
use crate::entity::EntityIndex;
use crate::error::{WorldError, WorldResult};

/// Ties a coroutine's lifetime to an entity (`scope(e)`), optionally further
/// narrowed to one of that entity's components
/// (`cancelIfComponentMissing(T)`). Carried as plain indices rather than
/// `Entity`/`World` types so the scheduler stays usable without a `World` in
/// scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoroutineScope {
    pub entity_index: EntityIndex,
    pub required_component: Option<ComponentTypeId>,
}

/// The points at which a coroutine body may suspend itself.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum YieldPoint {
    /// Resume on the very next frame.
    NextFrame,
    /// Resume after `frames` further frames have elapsed.
    AfterFrames(u32),
    /// Resume once at least `seconds` of wall-clock time have elapsed,
    /// measured in accumulated per-frame `dt`.
    AfterSeconds(f64),
    /// Resume once the named condition becomes true, re-polled every frame.
    UntilCondition,
    /// Resume once a sibling coroutine finishes.
    UntilCoroutineFinishes(CoroutineId),
    /// Never resumes on its own; only `cancel` can end it.
    Indefinite,
}

/// The ways a running coroutine can be cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelTrigger {
    /// Cancelled from outside via `CoroutineScheduler::cancel`.
    Explicit,
    /// The coroutine body cancelled itself at its current yield point.
    SelfCancelled,
    /// A registered `cancelIf` guard predicate evaluated true.
    GuardTriggered,
    /// The entity the coroutine is scoped to (`scope(e)`) was deleted.
    OwningEntityDeleted,
    /// A component the coroutine declared itself dependent on
    /// (`cancelIfComponentMissing(T)`) was removed from its scope entity.
    OwningComponentRemoved,
    ParentCancelled,
    WorldTerminated,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CoroutineState {
    Suspended(YieldPoint),
    Finished,
    Cancelled(CancelTrigger),
}

pub type CoroutineId = usize;

/// What a coroutine body returns from one step: either it yields at a point,
/// it is done, or it cancels itself.
pub enum StepOutcome {
    Yield(YieldPoint),
    Done,
    /// The body has decided to cancel itself at this yield point.
    Cancel,
}

/// A single step function. Advancing a coroutine re-invokes this closure;
/// the closure itself is responsible for remembering where it left off
/// (typically via captured mutable state).
pub type StepFn = Box<dyn FnMut() -> StepOutcome + Send>;

/// A host-supplied guard re-evaluated every frame a coroutine is suspended;
/// returning `true` cancels the coroutine before it is given a chance to
/// resume (`cancelIf`).
pub type GuardFn = Box<dyn Fn() -> bool + Send>;

struct Instance {
    parent: Option<CoroutineId>,
    step: StepFn,
    state: CoroutineState,
    frames_remaining: u32,
    seconds_remaining: f64,
    cancel_if: Option<GuardFn>,
    scope: Option<CoroutineScope>,
}

/// Owns every live coroutine in a world and drives one step of each per
/// frame.
#[derive(Default)]
pub struct CoroutineScheduler {
    instances: Vec<Option<Instance>>,
}

impl CoroutineScheduler {
    pub fn new() -> Self {
        CoroutineScheduler::default()
    }

    pub fn spawn(&mut self, parent: Option<CoroutineId>, step: StepFn) -> CoroutineId {
        self.spawn_scoped(parent, step, None, None)
    }

    /// Spawns a coroutine tied to `scope` (`scope(e)`/`cancelIfComponentMissing`)
    /// and/or a `cancel_if` guard, either of which may be `None`.
    pub fn spawn_scoped(
        &mut self,
        parent: Option<CoroutineId>,
        step: StepFn,
        scope: Option<CoroutineScope>,
        cancel_if: Option<GuardFn>,
    ) -> CoroutineId {
        self.instances.push(Some(Instance {
            parent,
            step,
            state: CoroutineState::Suspended(YieldPoint::NextFrame),
            frames_remaining: 0,
            seconds_remaining: 0.0,
            cancel_if,
            scope,
        }));
        self.instances.len() - 1
    }

    pub fn state(&self, id: CoroutineId) -> Option<CoroutineState> {
        self.instances.get(id).and_then(|i| i.as_ref()).map(|i| i.state)
    }

    pub fn cancel(&mut self, id: CoroutineId, trigger: CancelTrigger) {
        if let Some(Some(inst)) = self.instances.get_mut(id) {
            if !matches!(inst.state, CoroutineState::Finished | CoroutineState::Cancelled(_)) {
                inst.state = CoroutineState::Cancelled(trigger);
            }
        }
        self.propagate_cancel(id, trigger);
    }

    /// Cancels every live coroutine scoped to `entity_index` with
    /// `OwningEntityDeleted`, for `World::delete` to call.
    pub fn cancel_scope_entity(&mut self, entity_index: EntityIndex) {
        let matching: Vec<CoroutineId> = self
            .instances
            .iter()
            .enumerate()
            .filter_map(|(i, inst)| match inst {
                Some(inst) if inst.scope.map(|s| s.entity_index) == Some(entity_index) => Some(i),
                _ => None,
            })
            .collect();
        for id in matching {
            self.cancel(id, CancelTrigger::OwningEntityDeleted);
        }
    }

    /// Cancels every live coroutine scoped to `entity_index` that also
    /// requires `type_id` with `OwningComponentRemoved`, for
    /// `World::remove` to call.
    pub fn cancel_scope_component(&mut self, entity_index: EntityIndex, type_id: ComponentTypeId) {
        let matching: Vec<CoroutineId> = self
            .instances
            .iter()
            .enumerate()
            .filter_map(|(i, inst)| match inst {
                Some(inst)
                    if inst.scope
                        == Some(CoroutineScope {
                            entity_index,
                            required_component: Some(type_id),
                        }) =>
                {
                    Some(i)
                }
                _ => None,
            })
            .collect();
        for id in matching {
            self.cancel(id, CancelTrigger::OwningComponentRemoved);
        }
    }

    /// Cancels every direct and transitive child of `id`.
    fn propagate_cancel(&mut self, id: CoroutineId, trigger: CancelTrigger) {
        let children: Vec<CoroutineId> = self
            .instances
            .iter()
            .enumerate()
            .filter_map(|(i, inst)| match inst {
                Some(inst) if inst.parent == Some(id) => Some(i),
                _ => None,
            })
            .collect();
        for child in children {
            if let Some(Some(inst)) = self.instances.get_mut(child) {
                if !matches!(inst.state, CoroutineState::Finished | CoroutineState::Cancelled(_)) {
                    inst.state = CoroutineState::Cancelled(CancelTrigger::ParentCancelled);
                }
            }
            self.propagate_cancel(child, trigger);
        }
    }

    /// Steps every coroutine that is ready to resume this frame. Coroutines
    /// suspended on `AfterFrames`/`AfterSeconds`/`UntilCoroutineFinishes`/
    /// `UntilCondition` whose condition has not yet been met are left
    /// untouched; the caller supplies `condition_met` to evaluate
    /// host-defined `UntilCondition` waits and `dt` (seconds elapsed this
    /// frame) to drive `AfterSeconds` countdowns. A `cancel_if` guard is
    /// re-evaluated before readiness on every suspended coroutine that
    /// carries one.
    pub fn advance_frame(&mut self, dt: f64, condition_met: impl Fn(CoroutineId) -> bool) -> WorldResult<()> {
        for i in 0..self.instances.len() {
            if let Some(Some(inst)) = self.instances.get(i) {
                let guarded = matches!(inst.state, CoroutineState::Suspended(_))
                    && inst.cancel_if.as_ref().map(|g| g()).unwrap_or(false);
                if guarded {
                    self.cancel(i, CancelTrigger::GuardTriggered);
                    continue;
                }
            }

            let ready = match self.instances[i].as_ref().map(|inst| inst.state) {
                Some(CoroutineState::Suspended(YieldPoint::NextFrame)) => true,
                Some(CoroutineState::Suspended(YieldPoint::AfterFrames(_))) => {
                    if let Some(Some(inst)) = self.instances.get_mut(i) {
                        if inst.frames_remaining == 0 {
                            true
                        } else {
                            inst.frames_remaining -= 1;
                            false
                        }
                    } else {
                        false
                    }
                }
                Some(CoroutineState::Suspended(YieldPoint::AfterSeconds(_))) => {
                    if let Some(Some(inst)) = self.instances.get_mut(i) {
                        inst.seconds_remaining -= dt;
                        inst.seconds_remaining <= 0.0
                    } else {
                        false
                    }
                }
                Some(CoroutineState::Suspended(YieldPoint::UntilCondition)) => condition_met(i),
                Some(CoroutineState::Suspended(YieldPoint::UntilCoroutineFinishes(other))) => {
                    matches!(self.state(other), Some(CoroutineState::Finished) | None)
                }
                Some(CoroutineState::Suspended(YieldPoint::Indefinite)) => false,
                _ => false,
            };

            if !ready {
                continue;
            }

            let outcome = {
                let inst = self.instances[i].as_mut().ok_or_else(|| WorldError::internal("coroutine slot vanished"))?;
                (inst.step)()
            };

            let inst = self.instances[i].as_mut().ok_or_else(|| WorldError::internal("coroutine slot vanished"))?;
            let self_cancelled = matches!(outcome, StepOutcome::Cancel);
            match outcome {
                StepOutcome::Yield(YieldPoint::AfterFrames(n)) => {
                    inst.frames_remaining = n;
                    inst.state = CoroutineState::Suspended(YieldPoint::AfterFrames(n));
                }
                StepOutcome::Yield(YieldPoint::AfterSeconds(s)) => {
                    inst.seconds_remaining = s;
                    inst.state = CoroutineState::Suspended(YieldPoint::AfterSeconds(s));
                }
                StepOutcome::Yield(point) => inst.state = CoroutineState::Suspended(point),
                StepOutcome::Done => inst.state = CoroutineState::Finished,
                StepOutcome::Cancel => inst.state = CoroutineState::Cancelled(CancelTrigger::SelfCancelled),
            }
            if self_cancelled {
                self.propagate_cancel(i, CancelTrigger::SelfCancelled);
            }
        }
        Ok(())
    }

    pub fn is_alive(&self, id: CoroutineId) -> bool {
        matches!(self.state(id), Some(CoroutineState::Suspended(_)))
    }
}

impl fmt::Debug for CoroutineScheduler {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("CoroutineScheduler")
            .field("count", &self.instances.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn runs_to_completion_across_frames() {
        let mut sched = CoroutineScheduler::new();
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let id = sched.spawn(
            None,
            Box::new(move || {
                let n = c.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    StepOutcome::Yield(YieldPoint::NextFrame)
                } else {
                    StepOutcome::Done
                }
            }),
        );

        for _ in 0..3 {
            sched.advance_frame(1.0, |_| false).unwrap();
        }
        assert_eq!(sched.state(id), Some(CoroutineState::Finished));
        assert_eq!(counter.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn cancelling_parent_cancels_child() {
        let mut sched = CoroutineScheduler::new();
        let parent = sched.spawn(None, Box::new(|| StepOutcome::Yield(YieldPoint::Indefinite)));
        let child = sched.spawn(Some(parent), Box::new(|| StepOutcome::Yield(YieldPoint::Indefinite)));

        sched.cancel(parent, CancelTrigger::Explicit);
        assert_eq!(sched.state(parent), Some(CoroutineState::Cancelled(CancelTrigger::Explicit)));
        assert_eq!(sched.state(child), Some(CoroutineState::Cancelled(CancelTrigger::ParentCancelled)));
    }

    #[test]
    fn after_frames_waits_before_resuming() {
        let mut sched = CoroutineScheduler::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let c = calls.clone();
        sched.spawn(
            None,
            Box::new(move || {
                c.fetch_add(1, Ordering::SeqCst);
                StepOutcome::Yield(YieldPoint::AfterFrames(2))
            }),
        );

        sched.advance_frame(1.0, |_| false).unwrap();
        sched.advance_frame(1.0, |_| false).unwrap();
        sched.advance_frame(1.0, |_| false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        sched.advance_frame(1.0, |_| false).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }
}
