//! Domain mappers for mapped subcommands.
//!
//! A mapper is a pure conversion between the value shape of one domain and
//! another. Mappers are keyed by their `(Source, Target)` type pair; a mapped
//! subcommand call needs one mapper for its inputs and one for its output.
//!
//! ```ignore
//! struct CartToOrderLines;
//!
//! impl DomainMapper for CartToOrderLines {
//!     type Source = Cart;
//!     type Target = OrderLinesInputs;
//!
//!     fn map(&self, cart: Cart) -> Result<OrderLinesInputs, CommandError> {
//!         Ok(OrderLinesInputs { lines: cart.items.into_iter().map(Into::into).collect() })
//!     }
//! }
//! ```

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{CommandError, RatchetError};

/// Pure conversion from `Source` to `Target`.
pub trait DomainMapper: Send + Sync + 'static {
    type Source: Send + 'static;
    type Target: Send + 'static;

    fn map(&self, source: Self::Source) -> Result<Self::Target, CommandError>;
}

/// Type-erased form a mapper is stored as.
pub type MapperFn<A, B> = Arc<dyn Fn(A) -> Result<B, CommandError> + Send + Sync>;

struct MapperEntry {
    mapper: Arc<dyn Any + Send + Sync>,
    source_type: &'static str,
    target_type: &'static str,
}

/// Mappers keyed by `(TypeId::of::<Source>(), TypeId::of::<Target>())`.
#[derive(Default)]
pub struct MapperRegistry {
    mappers: HashMap<(TypeId, TypeId), MapperEntry>,
}

impl MapperRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<M: DomainMapper>(&mut self, mapper: M) -> Result<(), RatchetError> {
        self.register_fn(move |source: M::Source| mapper.map(source))
    }

    /// Register a closure as the mapper from `A` to `B`.
    pub fn register_fn<A, B, F>(&mut self, f: F) -> Result<(), RatchetError>
    where
        A: Send + 'static,
        B: Send + 'static,
        F: Fn(A) -> Result<B, CommandError> + Send + Sync + 'static,
    {
        let key = (TypeId::of::<A>(), TypeId::of::<B>());
        if self.mappers.contains_key(&key) {
            return Err(RatchetError::DuplicateMapper {
                source_type: type_name::<A>(),
                target_type: type_name::<B>(),
            });
        }
        let mapper: MapperFn<A, B> = Arc::new(f);
        self.mappers.insert(
            key,
            MapperEntry {
                mapper: Arc::new(mapper),
                source_type: type_name::<A>(),
                target_type: type_name::<B>(),
            },
        );
        Ok(())
    }

    pub fn get<A: 'static, B: 'static>(&self) -> Option<MapperFn<A, B>> {
        self.mappers
            .get(&(TypeId::of::<A>(), TypeId::of::<B>()))
            .and_then(|entry| entry.mapper.downcast_ref::<MapperFn<A, B>>())
            .cloned()
    }

    pub fn contains<A: 'static, B: 'static>(&self) -> bool {
        self.mappers
            .contains_key(&(TypeId::of::<A>(), TypeId::of::<B>()))
    }

    /// Map `source` with the registered `A -> B` mapper.
    ///
    /// A missing mapper is a `system/mapper_not_found` error, never a
    /// pass-through.
    pub fn map<A: 'static, B: 'static>(&self, source: A) -> Result<B, CommandError> {
        let mapper = self.get::<A, B>().ok_or_else(|| {
            CommandError::from(RatchetError::MapperNotFound {
                source_type: type_name::<A>(),
                target_type: type_name::<B>(),
            })
        })?;
        mapper(source)
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }
}

impl fmt::Debug for MapperRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut pairs: Vec<_> = self
            .mappers
            .values()
            .map(|e| format!("{} -> {}", e.source_type, e.target_type))
            .collect();
        pairs.sort();
        f.debug_struct("MapperRegistry")
            .field("mappers", &pairs)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;

    #[derive(Debug, PartialEq)]
    struct Cents(i64);

    struct DollarsToCents;

    impl DomainMapper for DollarsToCents {
        type Source = f64;
        type Target = Cents;

        fn map(&self, dollars: f64) -> Result<Cents, CommandError> {
            if dollars < 0.0 {
                return Err(CommandError::domain("negative_amount", "amount must be positive"));
            }
            Ok(Cents((dollars * 100.0).round() as i64))
        }
    }

    #[test]
    fn test_map_with_registered_mapper() {
        let mut registry = MapperRegistry::new();
        registry.register(DollarsToCents).unwrap();

        assert_eq!(registry.map::<f64, Cents>(12.5).unwrap(), Cents(1250));
        let err = registry.map::<f64, Cents>(-1.0).unwrap_err();
        assert_eq!(err.symbol(), "negative_amount");
    }

    #[test]
    fn test_missing_mapper_is_system_error() {
        let registry = MapperRegistry::new();
        let err = registry.map::<f64, Cents>(1.0).unwrap_err();
        assert_eq!(err.category(), ErrorCategory::System);
        assert_eq!(err.symbol(), "mapper_not_found");
        assert_eq!(err.context()["source_type"], "f64");
    }

    #[test]
    fn test_duplicate_mapper_rejected() {
        let mut registry = MapperRegistry::new();
        registry.register(DollarsToCents).unwrap();
        let err = registry
            .register_fn(|d: f64| Ok(Cents(d as i64)))
            .unwrap_err();
        assert!(matches!(err, RatchetError::DuplicateMapper { .. }));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_pairs_are_directional() {
        let mut registry = MapperRegistry::new();
        registry
            .register_fn(|n: u32| Ok(n.to_string()))
            .unwrap();
        assert!(registry.contains::<u32, String>());
        assert!(!registry.contains::<String, u32>());
    }
}
