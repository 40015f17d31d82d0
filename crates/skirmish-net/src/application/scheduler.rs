//! Recurring work at fixed intervals, independent of the frame rate.
//!
//! The simulation ticks at whatever rate the machine manages; broadcasts and
//! clock-sync polls should not.  An [`ActionScheduler`] accumulates the tick
//! time per action and fires each callback once its interval has elapsed,
//! then resets that action's accumulator.
//!
//! Callbacks receive the caller's context as `&mut C`.  The coordinator keeps
//! its scheduler next to (not inside) the state the callbacks mutate, so both
//! can be borrowed at once.

use std::time::Duration;

use tracing::trace;

/// A recurring callback.
pub type Action<C> = Box<dyn FnMut(&mut C)>;

/// Handle returned by [`ActionScheduler::add_action`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ActionId(usize);

struct ScheduledAction<C> {
    name: &'static str,
    interval: Duration,
    elapsed: Duration,
    callback: Action<C>,
}

/// Fixed-interval callback runner.
pub struct ActionScheduler<C> {
    actions: Vec<ScheduledAction<C>>,
}

impl<C> ActionScheduler<C> {
    pub fn new() -> Self {
        Self {
            actions: Vec::new(),
        }
    }

    /// Registers `callback` to run every `interval`.
    pub fn add_action(
        &mut self,
        name: &'static str,
        interval: Duration,
        callback: impl FnMut(&mut C) + 'static,
    ) -> ActionId {
        self.actions.push(ScheduledAction {
            name,
            interval,
            elapsed: Duration::ZERO,
            callback: Box::new(callback),
        });
        ActionId(self.actions.len() - 1)
    }

    /// Changes the interval of an existing action.  Unknown ids are ignored.
    pub fn set_interval(&mut self, id: ActionId, interval: Duration) {
        if let Some(action) = self.actions.get_mut(id.0) {
            action.interval = interval;
        }
    }

    /// Adds `dt` to every accumulator and fires the actions that are due, in
    /// registration order.  Returns how many fired.
    pub fn run_due_actions(&mut self, dt: Duration, ctx: &mut C) -> usize {
        let mut fired = 0;
        for action in &mut self.actions {
            action.elapsed += dt;
            if action.elapsed >= action.interval {
                action.elapsed = Duration::ZERO;
                trace!(action = action.name, "scheduled action due");
                (action.callback)(ctx);
                fired += 1;
            }
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

impl<C> Default for ActionScheduler<C> {
    fn default() -> Self {
        Self::new()
    }
}
