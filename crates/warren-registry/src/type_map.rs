//! Per-registry component type id assignment.
//!
//! Each registry instance assigns [`ComponentTypeId`]s densely from zero in
//! first-reference order. The mapping is an insertion-ordered map under a
//! read-mostly lock: once a type has its id, lookups never take the write
//! lock again. Distinct registry instances maintain independent id spaces.

use std::any::TypeId;
use std::sync::RwLock;

use indexmap::IndexMap;
use warren_core::ComponentTypeId;

/// Thread-safe `TypeId → ComponentTypeId` assignment table.
#[derive(Default)]
pub struct TypeRegistry {
    map: RwLock<IndexMap<TypeId, ComponentTypeId>>,
}

impl TypeRegistry {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// The id for `T`, assigning the next dense id on first reference.
    pub fn id_of<T: 'static>(&self) -> ComponentTypeId {
        let key = TypeId::of::<T>();
        {
            let map = self.map.read().unwrap();
            if let Some(&id) = map.get(&key) {
                return id;
            }
        }
        let mut map = self.map.write().unwrap();
        let next = ComponentTypeId(map.len() as u16);
        *map.entry(key).or_insert(next)
    }

    /// The id for `T`, if it has been referenced before.
    pub fn get<T: 'static>(&self) -> Option<ComponentTypeId> {
        self.map.read().unwrap().get(&TypeId::of::<T>()).copied()
    }

    /// Number of types referenced so far.
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// Whether no type has been referenced yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_dense_in_reference_order() {
        let types = TypeRegistry::new();
        assert_eq!(types.id_of::<u32>(), ComponentTypeId(0));
        assert_eq!(types.id_of::<f64>(), ComponentTypeId(1));
        assert_eq!(types.id_of::<String>(), ComponentTypeId(2));
        // Stable on re-reference.
        assert_eq!(types.id_of::<f64>(), ComponentTypeId(1));
        assert_eq!(types.len(), 3);
    }

    #[test]
    fn instances_have_independent_id_spaces() {
        let a = TypeRegistry::new();
        let b = TypeRegistry::new();
        a.id_of::<u32>();
        assert_eq!(a.id_of::<f64>(), ComponentTypeId(1));
        assert_eq!(b.id_of::<f64>(), ComponentTypeId(0));
    }

    #[test]
    fn get_does_not_assign() {
        let types = TypeRegistry::new();
        assert_eq!(types.get::<u32>(), None);
        types.id_of::<u32>();
        assert_eq!(types.get::<u32>(), Some(ComponentTypeId(0)));
    }

    #[test]
    fn concurrent_assignment_is_consistent() {
        use std::sync::Arc;
        let types = Arc::new(TypeRegistry::new());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let types = Arc::clone(&types);
                std::thread::spawn(move || {
                    (
                        types.id_of::<u32>(),
                        types.id_of::<f64>(),
                        types.id_of::<i16>(),
                    )
                })
            })
            .collect();
        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for r in &results {
            assert_eq!(*r, results[0], "every thread sees the same ids");
        }
        assert_eq!(types.len(), 3);
    }
}
