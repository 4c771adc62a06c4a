//! Used to define a state machine.

use std::fmt::Debug;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

/// How often a running stage looks at the shutdown signal.
const SIGNAL_POLL: Duration = Duration::from_millis(100);

/// What the scheduler should do once a pass has finished successfully.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Directive {
    /// Nothing to do until the object changes again.
    Done,
    /// Run another pass right away.
    Requeue,
    /// Run another pass after the given delay.
    RequeueAfter(Duration),
}

impl Default for Directive {
    fn default() -> Self {
        Self::Done
    }
}

/// Represents result of stage execution and which stage to run next.
#[derive(Debug)]
pub enum Transition<S, E> {
    /// Run another stage.
    Next(S),
    /// Stop the pass and report the directive to the scheduler.
    Stop(Directive),
    /// Stop the pass with an error.
    Fail {
        /// The error that ended the pass.
        error: E,
        /// Whether the scheduler should retry the object with backoff.
        requeue: bool,
    },
}

impl<S, E> Transition<S, E> {
    /// Switch to `stage`.
    pub fn next(stage: S) -> Self {
        Transition::Next(stage)
    }

    /// Stop without asking for another pass.
    pub fn done() -> Self {
        Transition::Stop(Directive::Done)
    }

    /// Stop and ask for another pass after `after`.
    pub fn requeue_after(after: Duration) -> Self {
        Transition::Stop(Directive::RequeueAfter(after))
    }

    /// Stop with an error the scheduler should retry.
    pub fn fail_and_requeue(error: E) -> Self {
        Transition::Fail {
            error,
            requeue: true,
        }
    }

    /// Stop with an error the scheduler must not retry.
    pub fn fail_no_requeue(error: E) -> Self {
        Transition::Fail {
            error,
            requeue: false,
        }
    }
}

/// Why a pass ended without producing a [`Directive`].
#[derive(Debug)]
pub enum Stopped<S, E> {
    /// A stage failed.
    Failed {
        /// The error returned by the stage.
        error: E,
        /// Whether the scheduler should retry.
        requeue: bool,
    },
    /// A stage returned an edge that is missing from the transition table.
    IllegalTransition {
        /// The stage that produced the edge.
        from: S,
        /// The requested next stage.
        to: S,
    },
    /// The shutdown signal was raised.
    Interrupted {
        /// The stage that was cancelled or would have run next.
        pending: S,
    },
    /// The step budget for one pass was used up.
    Exhausted {
        /// The stage that would have run next.
        last: S,
    },
}

#[async_trait::async_trait]
/// A set of stages sharing one per-pass state.
///
/// `&self` is the runtime handle (clients, configuration); it is shared and
/// must not carry anything specific to one pass. Everything a pass learns
/// lives in `State`, which the engine lends to exactly one stage at a time.
pub trait StateMachine: Sync {
    /// Identifies a stage.
    type Stage: Copy + Debug + PartialEq + Send + Sync + 'static;
    /// The per-pass state handed to every stage.
    type State: Send;
    /// The error a stage can fail with.
    type Error: Debug + Send;

    /// Run one stage.
    async fn step(
        &self,
        stage: Self::Stage,
        state: &mut Self::State,
    ) -> Transition<Self::Stage, Self::Error>;

    /// Whether `from -> to` is an edge of the state graph.
    fn permits(&self, _from: Self::Stage, _to: Self::Stage) -> bool {
        true
    }
}

/// Iteratively evaluate the state machine until a stage stops the pass.
///
/// At most `budget` stages run. The `signal` flag is checked before each
/// stage and polled while one runs. A stage still running when it is raised
/// is dropped at its next await point.
pub async fn run_to_completion<M: StateMachine>(
    machine: &M,
    initial: M::Stage,
    state: &mut M::State,
    budget: usize,
    signal: Option<&Arc<AtomicBool>>,
) -> Result<Directive, Stopped<M::Stage, M::Error>> {
    let mut stage = initial;

    for _ in 0..budget {
        if let Some(signal) = signal {
            // Relaxed is enough, the flag only ever flips to true.
            if signal.load(Ordering::Relaxed) {
                warn!(?stage, "Shutdown signal raised, abandoning pass");
                return Err(Stopped::Interrupted { pending: stage });
            }
        }

        debug!(?stage, "Entering stage");
        let transition = match signal {
            Some(signal) => tokio::select! {
                transition = machine.step(stage, state) => transition,
                _ = raised(signal) => {
                    warn!(?stage, "Shutdown signal raised, cancelling stage");
                    return Err(Stopped::Interrupted { pending: stage });
                }
            },
            None => machine.step(stage, state).await,
        };
        match transition {
            Transition::Next(next) => {
                if !machine.permits(stage, next) {
                    error!(from = ?stage, to = ?next, "Stage requested an illegal transition");
                    return Err(Stopped::IllegalTransition {
                        from: stage,
                        to: next,
                    });
                }
                trace!(from = ?stage, to = ?next, "Transitioning");
                stage = next;
            }
            Transition::Stop(directive) => {
                debug!(?stage, ?directive, "State machine exited without error");
                return Ok(directive);
            }
            Transition::Fail { error, requeue } => {
                error!(?stage, ?error, requeue, "State machine exited with error");
                return Err(Stopped::Failed { error, requeue });
            }
        }
    }

    warn!(?stage, budget, "Step budget exhausted");
    Err(Stopped::Exhausted { last: stage })
}

async fn raised(signal: &AtomicBool) {
    while !signal.load(Ordering::Relaxed) {
        tokio::time::sleep(SIGNAL_POLL).await;
    }
}
