use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// A heterogeneous, type-keyed map shared by reference.
///
/// One value per type: keys are the stored type itself, so lookups are
/// statically typed and collisions are impossible. Values must be `Clone`
/// to be read out; store an `Arc<T>` for anything expensive.
#[derive(Clone, Default)]
struct TypeBag {
    inner: Arc<RwLock<HashMap<TypeId, Box<dyn Any + Send + Sync>>>>,
}

impl TypeBag {
    fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.inner
            .write()
            .unwrap()
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner
            .read()
            .unwrap()
            .get(&TypeId::of::<T>())
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    fn remove<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.inner
            .write()
            .unwrap()
            .remove(&TypeId::of::<T>())
            .and_then(|old| old.downcast::<T>().ok())
            .map(|boxed| *boxed)
    }

    fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.inner.read().unwrap().contains_key(&TypeId::of::<T>())
    }

    fn len(&self) -> usize {
        self.inner.read().unwrap().len()
    }
}

/// Process-wide shared state, created once by the lifespan manager and
/// handed by reference into every non-lifespan scope.
///
/// Cloning the handle shares the underlying map; there is exactly one map
/// per process. Handlers that suspend between a read and a write must
/// assume another handler ran in between; the lock guards memory safety,
/// not transaction semantics.
#[derive(Clone, Default)]
pub struct State {
    bag: TypeBag,
}

impl State {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a value, returning the previous one of the same type.
    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.bag.insert(value)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.bag.get::<T>()
    }

    pub fn remove<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.bag.remove::<T>()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.bag.contains::<T>()
    }

    pub fn len(&self) -> usize {
        self.bag.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State").field("len", &self.len()).finish()
    }
}

/// Per-request bag for middleware ↔ handler communication.
///
/// Same shape as [`State`] but scoped to one request: each request scope
/// gets a fresh stash, and it is dropped with the scope.
#[derive(Clone, Default)]
pub struct Stash {
    bag: TypeBag,
}

impl Stash {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<T: Clone + Send + Sync + 'static>(&self, value: T) -> Option<T> {
        self.bag.insert(value)
    }

    pub fn get<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.bag.get::<T>()
    }

    pub fn remove<T: Clone + Send + Sync + 'static>(&self) -> Option<T> {
        self.bag.remove::<T>()
    }

    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.bag.contains::<T>()
    }
}

impl fmt::Debug for Stash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stash").field("len", &self.bag.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Clone, Debug, PartialEq)]
    struct Pool(&'static str);

    #[derive(Clone, Debug, PartialEq)]
    struct RequestId(u64);

    #[test]
    fn state_is_shared_by_reference() {
        let state = State::new();
        let alias = state.clone();
        state.insert(Pool("primary"));
        assert_eq!(alias.get::<Pool>(), Some(Pool("primary")));
        assert!(alias.contains::<Pool>());
        assert_eq!(state.len(), 1);
    }

    #[test]
    fn insert_returns_previous_value() {
        let state = State::new();
        assert_eq!(state.insert(RequestId(1)), None);
        assert_eq!(state.insert(RequestId(2)), Some(RequestId(1)));
        assert_eq!(state.remove::<RequestId>(), Some(RequestId(2)));
        assert!(state.is_empty());
    }

    #[test]
    fn stash_is_independent_per_instance() {
        let a = Stash::new();
        let b = Stash::new();
        a.insert(RequestId(7));
        assert!(b.get::<RequestId>().is_none());
        assert_eq!(a.get::<RequestId>(), Some(RequestId(7)));
    }
}
