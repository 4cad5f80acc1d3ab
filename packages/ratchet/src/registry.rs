//! Command registry.
//!
//! Commands are registered once, at engine build time, and looked up either
//! by type (`engine.run::<C>`) or by identity (`engine.run_named`). A
//! command's callbacks are collected from `define_callbacks` at registration
//! and never change afterwards.

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde_json::Value;

use crate::callback::CallbackRegistry;
use crate::core::{Command, RawInputs};
use crate::engine::Engine;
use crate::error::{CommandError, RatchetError};
use crate::mapper::MapperRegistry;
use crate::outcome::Outcome;
use crate::subcommand::DomainGraph;

/// A command definition with its resolved callbacks.
pub struct RegisteredCommand<C: Command> {
    pub(crate) definition: Arc<C>,
    pub(crate) callbacks: Arc<CallbackRegistry<C>>,
}

impl<C: Command> RegisteredCommand<C> {
    pub(crate) fn new(definition: C, mut callbacks: CallbackRegistry<C>) -> Self {
        definition.define_callbacks(&mut callbacks);
        Self {
            definition: Arc::new(definition),
            callbacks: Arc::new(callbacks),
        }
    }

    pub fn definition(&self) -> &C {
        &self.definition
    }

    pub fn callbacks(&self) -> &CallbackRegistry<C> {
        &self.callbacks
    }
}

/// Descriptive data about a registered command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandMetadata {
    pub name: &'static str,
    pub domain: Option<&'static str>,
    pub type_name: &'static str,
    pub callback_count: usize,
}

type NamedRunner<D> =
    Arc<dyn Fn(Engine<D>, RawInputs) -> BoxFuture<'static, Outcome<Value>> + Send + Sync>;

struct CommandEntry<D> {
    metadata: CommandMetadata,
    command: Arc<dyn Any + Send + Sync>,
    runner: NamedRunner<D>,
}

/// Every command, domain dependency and mapper an engine knows.
pub struct CommandRegistry<D> {
    by_type: HashMap<TypeId, CommandEntry<D>>,
    by_name: HashMap<&'static str, TypeId>,
    pub(crate) domains: DomainGraph,
    pub(crate) mappers: MapperRegistry,
}

impl<D: Send + Sync + 'static> CommandRegistry<D> {
    pub(crate) fn new() -> Self {
        Self {
            by_type: HashMap::new(),
            by_name: HashMap::new(),
            domains: DomainGraph::new(),
            mappers: MapperRegistry::new(),
        }
    }

    pub(crate) fn insert<C>(&mut self, command: RegisteredCommand<C>) -> Result<(), RatchetError>
    where
        C: Command<Deps = D>,
    {
        let type_id = TypeId::of::<C>();
        if self.by_type.contains_key(&type_id) || self.by_name.contains_key(C::NAME) {
            return Err(RatchetError::DuplicateCommand { name: C::NAME });
        }

        let metadata = CommandMetadata {
            name: C::NAME,
            domain: C::DOMAIN,
            type_name: type_name::<C>(),
            callback_count: command.callbacks.len(),
        };
        let runner: NamedRunner<D> = Arc::new(
            |engine: Engine<D>, raw: RawInputs| -> BoxFuture<'static, Outcome<Value>> {
                Box::pin(async move {
                    match engine.run::<C>(raw).await {
                        Outcome::Success(output) => match serde_json::to_value(output) {
                            Ok(value) => Outcome::Success(value),
                            Err(e) => Outcome::Failure(
                                CommandError::system("output_not_serializable", e.to_string())
                                    .into(),
                            ),
                        },
                        Outcome::Failure(errors) => Outcome::Failure(errors),
                    }
                })
            },
        );

        self.by_name.insert(C::NAME, type_id);
        self.by_type.insert(
            type_id,
            CommandEntry {
                metadata,
                command: Arc::new(command),
                runner,
            },
        );
        Ok(())
    }

    /// The registration for `C`, if any.
    pub fn command<C>(&self) -> Option<Arc<RegisteredCommand<C>>>
    where
        C: Command<Deps = D>,
    {
        let entry = self.by_type.get(&TypeId::of::<C>())?;
        entry.command.clone().downcast::<RegisteredCommand<C>>().ok()
    }

    pub(crate) fn runner(&self, name: &str) -> Option<NamedRunner<D>> {
        let type_id = self.by_name.get(name)?;
        self.by_type.get(type_id).map(|entry| entry.runner.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    pub fn metadata(&self, name: &str) -> Option<&CommandMetadata> {
        let type_id = self.by_name.get(name)?;
        self.by_type.get(type_id).map(|entry| &entry.metadata)
    }

    /// Registered identities, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.by_name.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn domains(&self) -> &DomainGraph {
        &self.domains
    }

    pub fn mappers(&self) -> &MapperRegistry {
        &self.mappers
    }

    pub fn len(&self) -> usize {
        self.by_type.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_type.is_empty()
    }
}

impl<D> fmt::Debug for CommandRegistry<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.by_name.keys().collect();
        names.sort_unstable();
        f.debug_struct("CommandRegistry")
            .field("commands", &names)
            .field("domains", &self.domains)
            .field("mappers", &self.mappers)
            .finish()
    }
}
