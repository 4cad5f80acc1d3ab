//! The phase driver.
//!
//! One call to [`drive`] takes a fresh [`CommandContext`] from `pending` to
//! exactly one terminal state:
//!
//! ```text
//! pending ─open_transaction─▶ transaction_open ─validate_inputs─▶ inputs_validated
//!   ─load_records─▶ records_loaded ─validate_records─▶ records_validated
//!   ─validate─▶ validated ─execute─▶ executed ─commit_transaction─▶ transaction_committed
//!   ─succeed─▶ succeeded
//!
//! any phase ─halt─▶ rollback ─fail─▶ failed
//! any phase ─fault or panic─▶ rollback ─error─▶ errored
//! ```
//!
//! Each phase runs its `before` chain, then the phase body wrapped by its
//! `around` chain, then its `after` chain. The state only moves to the
//! phase's target once all three finished without a halt.

use std::panic::AssertUnwindSafe;

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, error, info_span, warn, Instrument};

use crate::callback::{execute_around_chain, CallbackKind, CallbackRegistry, Failure, PhaseBody};
use crate::context::{CommandContext, ErrorMode, ExecutionPath};
use crate::core::{Command, CorrelationId, Interrupt, RawInputs, Step};
use crate::engine::Engine;
use crate::error::{CommandError, RatchetError};
use crate::outcome::Outcome;
use crate::state::{LifecycleState, Phase, Transition};
use crate::transaction::{TransactionError, TransactionScope, TransactionStatus};

/// The result of one run, with the state it ended in.
#[derive(Debug)]
pub struct RunReport<T> {
    pub outcome: Outcome<T>,
    pub state: LifecycleState,
    pub correlation_id: CorrelationId,
}

/// Drive one run of `C` to a terminal state.
pub(crate) async fn drive<C: Command>(
    engine: Engine<C::Deps>,
    raw_inputs: RawInputs,
    scope: TransactionScope,
    path: ExecutionPath,
    correlation_id: CorrelationId,
) -> RunReport<C::Output> {
    let span = info_span!(
        "command",
        command = C::NAME,
        cid = %correlation_id,
        depth = path.depth()
    );

    async move {
        let Some(command) = engine.registry().command::<C>() else {
            warn!("command is not registered");
            let error = CommandError::from(RatchetError::CommandNotRegistered {
                name: C::NAME.to_string(),
            });
            return RunReport {
                outcome: Outcome::Failure(error.into()),
                state: LifecycleState::Pending,
                correlation_id,
            };
        };

        let driver = Driver {
            definition: command.definition.as_ref(),
            callbacks: command.callbacks.as_ref(),
            capture_panics: engine.config().capture_panics,
        };
        let mut ctx = CommandContext::new(engine.clone(), raw_inputs, scope, path, correlation_id);

        for phase in Phase::ALL {
            match driver.guarded_phase(&mut ctx, phase).await {
                Ok(()) => {}
                // Committed writes are final; the run can only succeed now.
                Err(interrupt) if ctx.scope.status() == TransactionStatus::Committed => {
                    warn!(%phase, %interrupt, "interrupt after commit ignored");
                    ctx.set_state(phase.to_state());
                }
                Err(Interrupt::Halt(_)) => return driver.fail(ctx).await,
                Err(Interrupt::Fault(fault)) => return driver.fault(ctx, fault).await,
            }
        }
        driver.succeed(ctx).await
    }
    .instrument(span)
    .await
}

/// Extract a human-readable message from a panic payload.
fn extract_panic_message(panic_info: &Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic_info.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic_info.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Halt on collected errors. Neither execute nor commit runs over them.
fn refuse_collected<C: Command>(ctx: &mut CommandContext<C>) -> Step<()> {
    if ctx.errors().has_errors() {
        return Err(ctx.halt_collected());
    }
    Ok(())
}

fn transaction_error(err: TransactionError) -> CommandError {
    CommandError::from_categorized(&err).with_context("reason", err.to_string())
}

// =============================================================================
// Phase bodies
// =============================================================================

/// The definition's own work for one phase; the innermost step of the
/// phase's around chain.
struct DefinitionBody<'a, C> {
    definition: &'a C,
    phase: Phase,
}

#[async_trait]
impl<'a, C: Command> PhaseBody<C> for DefinitionBody<'a, C> {
    async fn run(&self, ctx: &mut CommandContext<C>) -> Step<Option<C::Output>> {
        match self.phase {
            Phase::OpenTransaction => {
                let opened = ctx.scope.open().await;
                if let Err(err) = opened {
                    return Err(ctx.halt(transaction_error(err)));
                }
                Ok(None)
            }
            Phase::ValidateInputs => match self.definition.validate_inputs(ctx.raw_inputs()) {
                Ok(inputs) => {
                    ctx.set_inputs(inputs);
                    Ok(None)
                }
                Err(errors) if errors.is_empty() => Err(ctx.halt(CommandError::data(
                    "invalid_inputs",
                    "inputs were rejected",
                ))),
                Err(errors) => {
                    for error in errors {
                        ctx.collect(error);
                    }
                    Err(ctx.halt_collected())
                }
            },
            Phase::LoadRecords => self.definition.load_records(ctx).await.map(|()| None),
            Phase::ValidateRecords => self.definition.validate_records(ctx).await.map(|()| None),
            Phase::Validate => self.definition.validate(ctx).await.map(|()| None),
            Phase::Execute => self.definition.execute(ctx).await.map(Some),
            Phase::CommitTransaction => {
                refuse_collected(ctx)?;
                let committed = ctx.scope.commit().await;
                if let Err(err) = committed {
                    return Err(ctx.halt(transaction_error(err)));
                }
                if ctx.scope.status() == TransactionStatus::Committed {
                    ctx.freeze();
                }
                Ok(None)
            }
        }
    }
}

// =============================================================================
// Driver
// =============================================================================

struct Driver<'a, C: Command> {
    definition: &'a C,
    callbacks: &'a CallbackRegistry<C>,
    capture_panics: bool,
}

impl<'a, C: Command> Driver<'a, C> {
    async fn guarded_phase(&self, ctx: &mut CommandContext<C>, phase: Phase) -> Step<()> {
        if !self.capture_panics {
            return self.phase(ctx, phase).await;
        }
        match AssertUnwindSafe(self.phase(ctx, phase)).catch_unwind().await {
            Ok(result) => result,
            Err(panic_info) => {
                let panic_msg = extract_panic_message(&panic_info);
                error!(%phase, panic = %panic_msg, "phase panicked");
                Err(Interrupt::Fault(anyhow::anyhow!(
                    "{phase} panicked: {panic_msg}"
                )))
            }
        }
    }

    async fn phase(&self, ctx: &mut CommandContext<C>, phase: Phase) -> Step<()> {
        let (from, to, transition) = (phase.from_state(), phase.to_state(), phase.transition());

        let gated = matches!(phase, Phase::Execute | Phase::CommitTransaction);
        if gated {
            refuse_collected(ctx)?;
        }

        let before = self.callbacks.resolve(CallbackKind::Before, from, to, transition);
        for callback in before.iter() {
            callback.invoke(ctx).await;
            if ctx.is_halted() {
                return Err(ctx.halt_collected());
            }
        }
        if gated {
            refuse_collected(ctx)?;
        }

        let arounds = self.callbacks.resolve(CallbackKind::Around, from, to, transition);
        let body = DefinitionBody {
            definition: self.definition,
            phase,
        };
        let output = execute_around_chain(&arounds, &body, ctx).await?;
        if ctx.is_halted() {
            return Err(ctx.halt_collected());
        }

        if phase == Phase::Execute {
            refuse_collected(ctx)?;
            match output {
                Some(result) => ctx.set_result(result),
                None => {
                    return Err(Interrupt::Fault(anyhow::anyhow!(
                        "execute phase produced no value"
                    )))
                }
            }
        }

        let after = self.callbacks.resolve(CallbackKind::After, from, to, transition);
        for callback in after.iter() {
            callback.invoke(ctx).await;
            if ctx.is_halted() {
                return Err(ctx.halt_collected());
            }
        }
        if phase == Phase::Execute {
            refuse_collected(ctx)?;
        }

        ctx.set_state(to);
        debug!(%from, %to, %transition, "transition");
        Ok(())
    }

    async fn succeed(&self, mut ctx: CommandContext<C>) -> RunReport<C::Output> {
        if ctx.errors().has_errors() {
            // Collected after commit by a scope that never committed.
            let _ = ctx.halt_collected();
            return self.fail(ctx).await;
        }
        let Some(result) = ctx.take_result() else {
            let fault = anyhow::anyhow!("run committed without a result");
            return self.fault(ctx, fault).await;
        };
        let from = ctx.state();
        ctx.finish(LifecycleState::Succeeded);
        self.terminal(&mut ctx, from, LifecycleState::Succeeded, Transition::Succeed)
            .await;
        debug!("command succeeded");

        RunReport {
            outcome: Outcome::Success(result),
            state: LifecycleState::Succeeded,
            correlation_id: ctx.correlation_id(),
        }
    }

    async fn fail(&self, ctx: CommandContext<C>) -> RunReport<C::Output> {
        warn!(
            state = %ctx.state(),
            errors = ctx.errors().len(),
            "command halted"
        );
        self.abort(ctx, LifecycleState::Failed, Transition::Fail, Failure::Halted)
            .await
    }

    async fn fault(&self, mut ctx: CommandContext<C>, fault: anyhow::Error) -> RunReport<C::Output> {
        error!(state = %ctx.state(), error = %format!("{fault:#}"), "command faulted");
        ctx.add_error(CommandError::internal(&fault), ErrorMode::Collect);
        let failure = Failure::Faulted {
            message: format!("{fault:#}"),
        };
        self.abort(ctx, LifecycleState::Errored, Transition::Error, failure)
            .await
    }

    /// Roll back, notify error callbacks, then enter `terminal`.
    async fn abort(
        &self,
        mut ctx: CommandContext<C>,
        terminal: LifecycleState,
        transition: Transition,
        failure: Failure,
    ) -> RunReport<C::Output> {
        let from = ctx.state();

        let rolled_back = ctx.scope.rollback().await;
        if let Err(err) = rolled_back {
            error!(error = %err, "rollback failed");
            ctx.add_error(transaction_error(err), ErrorMode::Collect);
        }

        let handlers = self.callbacks.resolve(CallbackKind::Error, from, terminal, transition);
        for handler in handlers.iter() {
            let notified = AssertUnwindSafe(handler.invoke_error(&mut ctx, &failure))
                .catch_unwind()
                .await;
            if let Err(panic_info) = notified {
                error!(
                    panic = %extract_panic_message(&panic_info),
                    "error callback panicked, ignored"
                );
            }
        }

        ctx.finish(terminal);
        self.terminal(&mut ctx, from, terminal, transition).await;

        RunReport {
            outcome: Outcome::Failure(ctx.take_errors()),
            state: terminal,
            correlation_id: ctx.correlation_id(),
        }
    }

    /// Run `after` callbacks on the terminal transition. The collection is
    /// frozen by now; a panic here is logged and ignored.
    async fn terminal(
        &self,
        ctx: &mut CommandContext<C>,
        from: LifecycleState,
        to: LifecycleState,
        transition: Transition,
    ) {
        let after = self.callbacks.resolve(CallbackKind::After, from, to, transition);
        for callback in after.iter() {
            let invoked = AssertUnwindSafe(callback.invoke(ctx)).catch_unwind().await;
            if let Err(panic_info) = invoked {
                error!(
                    %transition,
                    panic = %extract_panic_message(&panic_info),
                    "terminal callback panicked, ignored"
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callback::CallbackCondition;
    use crate::testing::{CallLog, InMemoryBackend};
    use serde_json::{json, Value};
    use std::sync::Arc;

    struct Recorder {
        log: CallLog,
    }

    struct Traced;

    #[async_trait]
    impl Command for Traced {
        const NAME: &'static str = "traced";
        type Deps = Recorder;
        type Inputs = Value;
        type Output = u8;

        fn define_callbacks(&self, callbacks: &mut CallbackRegistry<Self>) {
            for phase in Phase::ALL {
                let transition = phase.transition();
                callbacks
                    .before(CallbackCondition::on(transition), 0, move |ctx| {
                        ctx.deps().log.push(format!("before {transition}"));
                    })
                    .after(CallbackCondition::on(transition), 0, move |ctx| {
                        ctx.deps().log.push(format!("after {transition}"));
                    });
            }
            callbacks.after(CallbackCondition::on(Transition::Succeed), 0, |ctx| {
                ctx.deps().log.push(format!("terminal {}", ctx.state()));
            });
        }

        async fn execute(&self, ctx: &mut CommandContext<Self>) -> Step<u8> {
            ctx.deps().log.push("execute");
            Ok(7)
        }
    }

    struct Exploding;

    #[async_trait]
    impl Command for Exploding {
        const NAME: &'static str = "exploding";
        type Deps = Recorder;
        type Inputs = Value;
        type Output = u8;

        async fn execute(&self, _ctx: &mut CommandContext<Self>) -> Step<u8> {
            panic!("boom");
        }
    }

    struct Faulty;

    #[async_trait]
    impl Command for Faulty {
        const NAME: &'static str = "faulty";
        type Deps = Recorder;
        type Inputs = Value;
        type Output = u8;

        async fn load_records(&self, _ctx: &mut CommandContext<Self>) -> Step<()> {
            Err(anyhow::anyhow!("connection reset").into())
        }

        async fn execute(&self, _ctx: &mut CommandContext<Self>) -> Step<u8> {
            Ok(0)
        }
    }

    fn engine(log: &CallLog, backend: &InMemoryBackend) -> Engine<Recorder> {
        Engine::builder(Recorder { log: log.clone() })
            .with_backend(Arc::new(backend.clone()))
            .register(Traced)
            .register(Exploding)
            .register(Faulty)
            .build()
    }

    #[tokio::test]
    async fn test_phases_run_in_order() {
        let log = CallLog::new();
        let backend = InMemoryBackend::new();
        let report = engine(&log, &backend)
            .run_detailed::<Traced>(json!({}))
            .await;

        assert_eq!(report.state, LifecycleState::Succeeded);
        assert_eq!(report.outcome.unwrap(), 7);

        let mut expected = Vec::new();
        for phase in Phase::ALL {
            expected.push(format!("before {}", phase.transition()));
            if phase == Phase::Execute {
                expected.push("execute".to_string());
            }
            expected.push(format!("after {}", phase.transition()));
        }
        expected.push("terminal succeeded".to_string());
        assert_eq!(log.entries(), expected);

        assert_eq!(backend.begins(), 1);
        assert_eq!(backend.commits(), 1);
        assert_eq!(backend.rollbacks(), 0);
    }

    #[tokio::test]
    async fn test_panic_becomes_internal_error() {
        let log = CallLog::new();
        let backend = InMemoryBackend::new();
        let report = engine(&log, &backend)
            .run_detailed::<Exploding>(json!({}))
            .await;

        assert_eq!(report.state, LifecycleState::Errored);
        let errors = report.outcome.unwrap_failure();
        assert_eq!(errors.len(), 1);
        let error = errors.first().unwrap();
        assert_eq!(error.symbol(), "internal_error");
        assert!(error.cause().unwrap().message().contains("boom"));
        assert_eq!(backend.commits(), 0);
        assert_eq!(backend.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_anyhow_fault_becomes_internal_error() {
        let log = CallLog::new();
        let backend = InMemoryBackend::new();
        let report = engine(&log, &backend).run_detailed::<Faulty>(json!({})).await;

        assert_eq!(report.state, LifecycleState::Errored);
        crate::assert_failed_with!(report.outcome, "internal_error");
        assert_eq!(backend.rollbacks(), 1);
    }

    #[tokio::test]
    async fn test_commit_failure_fails_and_rolls_back() {
        let log = CallLog::new();
        let backend = InMemoryBackend::new();
        backend.fail_next_commit();
        let report = engine(&log, &backend).run_detailed::<Traced>(json!({})).await;

        assert_eq!(report.state, LifecycleState::Failed);
        crate::assert_failed_with!(report.outcome, "transaction_commit_failed");
        assert_eq!(backend.commits(), 0);
        assert_eq!(backend.rollbacks(), 1);
        assert!(!log.entries().contains(&"terminal succeeded".to_string()));
    }

    #[test]
    fn test_extract_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("static");
        assert_eq!(extract_panic_message(&payload), "static");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("owned"));
        assert_eq!(extract_panic_message(&payload), "owned");
        let payload: Box<dyn std::any::Any + Send> = Box::new(3);
        assert_eq!(extract_panic_message(&payload), "unknown panic");
    }
}
