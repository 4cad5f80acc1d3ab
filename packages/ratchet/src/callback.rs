//! Lifecycle callbacks: registration, chain resolution and around nesting.
//!
//! # Kinds
//!
//! | Kind     | Runs                          | Sees result? | Can halt? |
//! |----------|-------------------------------|--------------|-----------|
//! | Before   | before the phase body         | ❌           | ✅        |
//! | Around   | wrapping the phase body       | ✅           | ✅        |
//! | After    | after the phase body          | ❌           | ✅        |
//! | Error    | once, when the run fails      | ❌           | ❌        |
//!
//! # Ordering
//!
//! Callbacks for one `(from, to, transition)` triple run by ascending
//! priority, ties in registration order. Around callbacks nest as a stack:
//! for A (priority 1) and B (priority 2) the order is
//! `A-pre, B-pre, body, B-post, A-post`.
//!
//! # Chain Cache
//!
//! [`CallbackRegistry::resolve`] is pure, so its result is memoized per
//! `(kind, from, to, transition)` in a `DashMap`. Registration takes
//! `&mut self` and clears the cache; once the registry is shared behind the
//! engine it is never written again, so concurrent runs only ever race on
//! inserting the same value.
//!
//! # Example
//!
//! ```ignore
//! fn define_callbacks(&self, callbacks: &mut CallbackRegistry<Self>) {
//!     callbacks
//!         .before(CallbackCondition::on(Transition::Execute), 10, |ctx| {
//!             tracing::info!(cid = %ctx.correlation_id(), "about to transfer");
//!         })
//!         .around(CallbackCondition::on(Transition::Execute), 0, Timing)
//!         .on_error(CallbackCondition::any(), 0, |ctx, failure| {
//!             tracing::warn!(?failure, errors = ctx.errors().len(), "transfer failed");
//!         });
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::future::BoxFuture;

use crate::context::CommandContext;
use crate::core::{Command, Step};
use crate::error::RatchetError;
use crate::state::{LifecycleState, Transition};

/// The four callback kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CallbackKind {
    Before,
    After,
    Around,
    Error,
}

impl fmt::Display for CallbackKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CallbackKind::Before => "before",
            CallbackKind::After => "after",
            CallbackKind::Around => "around",
            CallbackKind::Error => "error",
        };
        f.write_str(s)
    }
}

/// Filter on a transition. Unset fields match anything.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct CallbackCondition {
    from: Option<LifecycleState>,
    to: Option<LifecycleState>,
    transition: Option<Transition>,
}

impl CallbackCondition {
    /// Matches every transition.
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches one named transition, whatever its states.
    pub fn on(transition: Transition) -> Self {
        Self::any().transition(transition)
    }

    pub fn from(mut self, state: LifecycleState) -> Self {
        self.from = Some(state);
        self
    }

    pub fn to(mut self, state: LifecycleState) -> Self {
        self.to = Some(state);
        self
    }

    pub fn transition(mut self, transition: Transition) -> Self {
        self.transition = Some(transition);
        self
    }

    pub fn matches(&self, from: LifecycleState, to: LifecycleState, transition: Transition) -> bool {
        self.from.map_or(true, |s| s == from)
            && self.to.map_or(true, |s| s == to)
            && self.transition.map_or(true, |t| t == transition)
    }
}

/// Why a run is failing, as seen by error callbacks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Failure {
    /// A halting error (or collected errors) stopped the run.
    Halted,
    /// An unexpected fault; already recorded as `system/internal_error`.
    Faulted { message: String },
}

// =============================================================================
// Hooks
// =============================================================================

/// An awaitable `before`/`after` callback.
#[async_trait]
pub trait AsyncHook<C: Command>: Send + Sync + 'static {
    async fn call(&self, ctx: &mut CommandContext<C>);
}

/// An awaitable error callback. Runs after rollback, before the terminal
/// state is entered.
#[async_trait]
pub trait AsyncErrorHook<C: Command>: Send + Sync + 'static {
    async fn call(&self, ctx: &mut CommandContext<C>, failure: &Failure);
}

/// A callback wrapping a phase body.
///
/// The implementation decides whether and when to call `next.run(ctx)`, and
/// may transform what it returns. The value is `Some(output)` only for the
/// execute phase.
///
/// # Example
///
/// ```ignore
/// struct Timing;
///
/// #[async_trait]
/// impl Around<Transfer> for Timing {
///     async fn around(
///         &self,
///         ctx: &mut CommandContext<Transfer>,
///         next: Next<'_, Transfer>,
///     ) -> Step<Option<Receipt>> {
///         let started = Instant::now();
///         let result = next.run(ctx).await;
///         tracing::debug!(elapsed = ?started.elapsed(), "transfer body");
///         result
///     }
/// }
/// ```
#[async_trait]
pub trait Around<C: Command>: Send + Sync + 'static {
    async fn around(&self, ctx: &mut CommandContext<C>, next: Next<'_, C>)
        -> Step<Option<C::Output>>;
}

/// The innermost step an around chain wraps.
#[async_trait]
pub trait PhaseBody<C: Command>: Send + Sync {
    async fn run(&self, ctx: &mut CommandContext<C>) -> Step<Option<C::Output>>;
}

pub type SyncHook<C> = Arc<dyn Fn(&mut CommandContext<C>) + Send + Sync>;
pub type ErrorHook<C> = Arc<dyn Fn(&mut CommandContext<C>, &Failure) + Send + Sync>;

/// A callback body.
pub enum Hook<C: Command> {
    Sync(SyncHook<C>),
    Async(Arc<dyn AsyncHook<C>>),
    Around(Arc<dyn Around<C>>),
    Error(ErrorHook<C>),
    AsyncError(Arc<dyn AsyncErrorHook<C>>),
}

impl<C: Command> Hook<C> {
    fn label(&self) -> &'static str {
        match self {
            Hook::Sync(_) => "sync",
            Hook::Async(_) => "async",
            Hook::Around(_) => "around",
            Hook::Error(_) => "error",
            Hook::AsyncError(_) => "async_error",
        }
    }

    fn serves(&self, kind: CallbackKind) -> bool {
        match self {
            Hook::Sync(_) | Hook::Async(_) => {
                matches!(kind, CallbackKind::Before | CallbackKind::After)
            }
            Hook::Around(_) => kind == CallbackKind::Around,
            Hook::Error(_) | Hook::AsyncError(_) => kind == CallbackKind::Error,
        }
    }
}

impl<C: Command> Clone for Hook<C> {
    fn clone(&self) -> Self {
        match self {
            Hook::Sync(f) => Hook::Sync(f.clone()),
            Hook::Async(h) => Hook::Async(h.clone()),
            Hook::Around(a) => Hook::Around(a.clone()),
            Hook::Error(f) => Hook::Error(f.clone()),
            Hook::AsyncError(h) => Hook::AsyncError(h.clone()),
        }
    }
}

struct AroundFn<F>(F);

#[async_trait]
impl<C, F> Around<C> for AroundFn<F>
where
    C: Command,
    F: for<'a> Fn(&'a mut CommandContext<C>, Next<'a, C>) -> BoxFuture<'a, Step<Option<C::Output>>>
        + Send
        + Sync
        + 'static,
{
    async fn around(
        &self,
        ctx: &mut CommandContext<C>,
        next: Next<'_, C>,
    ) -> Step<Option<C::Output>> {
        (self.0)(ctx, next).await
    }
}

// =============================================================================
// Registered Callback
// =============================================================================

/// A callback with its kind, condition and ordering data.
pub struct RegisteredCallback<C: Command> {
    kind: CallbackKind,
    condition: CallbackCondition,
    priority: i32,
    sequence: usize,
    hook: Hook<C>,
}

impl<C: Command> RegisteredCallback<C> {
    pub fn kind(&self) -> CallbackKind {
        self.kind
    }

    pub fn condition(&self) -> &CallbackCondition {
        &self.condition
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    /// Registration order within the registry.
    pub fn sequence(&self) -> usize {
        self.sequence
    }

    /// Run a `before`/`after` hook.
    pub(crate) async fn invoke(&self, ctx: &mut CommandContext<C>) {
        match &self.hook {
            Hook::Sync(f) => f(ctx),
            Hook::Async(hook) => hook.call(ctx).await,
            Hook::Around(_) | Hook::Error(_) | Hook::AsyncError(_) => {}
        }
    }

    /// Run an error hook.
    pub(crate) async fn invoke_error(&self, ctx: &mut CommandContext<C>, failure: &Failure) {
        match &self.hook {
            Hook::Error(f) => f(ctx, failure),
            Hook::AsyncError(hook) => hook.call(ctx, failure).await,
            _ => {}
        }
    }
}

impl<C: Command> fmt::Debug for RegisteredCallback<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredCallback")
            .field("kind", &self.kind)
            .field("condition", &self.condition)
            .field("priority", &self.priority)
            .field("sequence", &self.sequence)
            .field("hook", &self.hook.label())
            .finish()
    }
}

/// A resolved, ordered list of callbacks.
pub type Chain<C> = Arc<[Arc<RegisteredCallback<C>>]>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ChainKey {
    kind: CallbackKind,
    from: LifecycleState,
    to: LifecycleState,
    transition: Transition,
}

// =============================================================================
// Around Nesting
// =============================================================================

/// The rest of an around chain, ending in the phase body.
pub struct Next<'a, C: Command> {
    arounds: &'a [Arc<RegisteredCallback<C>>],
    body: &'a dyn PhaseBody<C>,
}

impl<'a, C: Command> Next<'a, C> {
    /// Proceed into the next around callback, or the body if none is left.
    pub async fn run(self, ctx: &mut CommandContext<C>) -> Step<Option<C::Output>> {
        let mut rest = self.arounds;
        while let Some((first, tail)) = rest.split_first() {
            if let Hook::Around(around) = &first.hook {
                let next = Next {
                    arounds: tail,
                    body: self.body,
                };
                return around.around(ctx, next).await;
            }
            rest = tail;
        }
        self.body.run(ctx).await
    }
}

/// Run `body` wrapped by every around callback in `chain`, first outermost.
pub async fn execute_around_chain<C: Command>(
    chain: &[Arc<RegisteredCallback<C>>],
    body: &dyn PhaseBody<C>,
    ctx: &mut CommandContext<C>,
) -> Step<Option<C::Output>> {
    Next {
        arounds: chain,
        body,
    }
    .run(ctx)
    .await
}

// =============================================================================
// Callback Registry
// =============================================================================

/// Callbacks registered for one command type.
pub struct CallbackRegistry<C: Command> {
    callbacks: Vec<Arc<RegisteredCallback<C>>>,
    cache: DashMap<ChainKey, Chain<C>>,
    caching: bool,
}

impl<C: Command> CallbackRegistry<C> {
    pub fn new() -> Self {
        Self {
            callbacks: Vec::new(),
            cache: DashMap::new(),
            caching: true,
        }
    }

    /// Append a callback.
    ///
    /// Returns an error if `hook` cannot serve `kind` (an around hook
    /// registered as `before`, for example).
    pub fn register(
        &mut self,
        kind: CallbackKind,
        hook: Hook<C>,
        condition: CallbackCondition,
        priority: i32,
    ) -> Result<&mut Self, RatchetError> {
        if !hook.serves(kind) {
            return Err(RatchetError::CallbackKindMismatch {
                kind,
                hook: hook.label(),
            });
        }
        self.push(kind, hook, condition, priority);
        Ok(self)
    }

    fn push(&mut self, kind: CallbackKind, hook: Hook<C>, condition: CallbackCondition, priority: i32) {
        let sequence = self.callbacks.len();
        self.callbacks.push(Arc::new(RegisteredCallback {
            kind,
            condition,
            priority,
            sequence,
            hook,
        }));
        self.cache.clear();
    }

    pub fn before(
        &mut self,
        condition: CallbackCondition,
        priority: i32,
        f: impl Fn(&mut CommandContext<C>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(CallbackKind::Before, Hook::Sync(Arc::new(f)), condition, priority);
        self
    }

    pub fn before_async(
        &mut self,
        condition: CallbackCondition,
        priority: i32,
        hook: impl AsyncHook<C>,
    ) -> &mut Self {
        self.push(CallbackKind::Before, Hook::Async(Arc::new(hook)), condition, priority);
        self
    }

    pub fn after(
        &mut self,
        condition: CallbackCondition,
        priority: i32,
        f: impl Fn(&mut CommandContext<C>) + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(CallbackKind::After, Hook::Sync(Arc::new(f)), condition, priority);
        self
    }

    pub fn after_async(
        &mut self,
        condition: CallbackCondition,
        priority: i32,
        hook: impl AsyncHook<C>,
    ) -> &mut Self {
        self.push(CallbackKind::After, Hook::Async(Arc::new(hook)), condition, priority);
        self
    }

    pub fn around(
        &mut self,
        condition: CallbackCondition,
        priority: i32,
        around: impl Around<C>,
    ) -> &mut Self {
        self.push(CallbackKind::Around, Hook::Around(Arc::new(around)), condition, priority);
        self
    }

    /// Register a closure as an around callback.
    ///
    /// ```ignore
    /// callbacks.around_fn(CallbackCondition::on(Transition::Execute), 0, |ctx, next| {
    ///     Box::pin(async move {
    ///         let result = next.run(ctx).await;
    ///         result.map(|out| out.map(|receipt| receipt.with_note("audited")))
    ///     })
    /// });
    /// ```
    pub fn around_fn<F>(&mut self, condition: CallbackCondition, priority: i32, f: F) -> &mut Self
    where
        F: for<'a> Fn(&'a mut CommandContext<C>, Next<'a, C>) -> BoxFuture<'a, Step<Option<C::Output>>>
            + Send
            + Sync
            + 'static,
    {
        self.around(condition, priority, AroundFn(f))
    }

    pub fn on_error(
        &mut self,
        condition: CallbackCondition,
        priority: i32,
        f: impl Fn(&mut CommandContext<C>, &Failure) + Send + Sync + 'static,
    ) -> &mut Self {
        self.push(CallbackKind::Error, Hook::Error(Arc::new(f)), condition, priority);
        self
    }

    pub fn on_error_async(
        &mut self,
        condition: CallbackCondition,
        priority: i32,
        hook: impl AsyncErrorHook<C>,
    ) -> &mut Self {
        self.push(CallbackKind::Error, Hook::AsyncError(Arc::new(hook)), condition, priority);
        self
    }

    /// Callbacks of `kind` matching the triple, by (priority, registration).
    pub fn resolve(
        &self,
        kind: CallbackKind,
        from: LifecycleState,
        to: LifecycleState,
        transition: Transition,
    ) -> Chain<C> {
        let key = ChainKey {
            kind,
            from,
            to,
            transition,
        };
        if !self.caching {
            return self.compile(key);
        }
        if let Some(chain) = self.cache.get(&key) {
            return chain.clone();
        }
        // Losing this race only means computing the same chain twice.
        let chain = self.compile(key);
        self.cache.insert(key, chain.clone());
        chain
    }

    fn compile(&self, key: ChainKey) -> Chain<C> {
        let mut matching: Vec<_> = self
            .callbacks
            .iter()
            .filter(|cb| cb.kind == key.kind && cb.condition.matches(key.from, key.to, key.transition))
            .cloned()
            .collect();
        matching.sort_by_key(|cb| (cb.priority, cb.sequence));
        Arc::from(matching)
    }

    pub(crate) fn set_caching(&mut self, enabled: bool) {
        self.caching = enabled;
        self.cache.clear();
    }

    /// Number of memoized chains.
    pub fn cached_chains(&self) -> usize {
        self.cache.len()
    }

    pub fn len(&self) -> usize {
        self.callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callbacks.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredCallback<C>> {
        self.callbacks.iter().map(|cb| cb.as_ref())
    }
}

impl<C: Command> Default for CallbackRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Command> fmt::Debug for CallbackRegistry<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("command", &C::NAME)
            .field("callbacks", &self.callbacks.len())
            .field("cached_chains", &self.cache.len())
            .finish()
    }
}
