//! Type-indexed form registry.
//!
//! Owns every form in the session. Ids are allocated from a single counter
//! starting past the reserved singleton range. Lookups are type-checked;
//! deletion respects retention pins; `visit` iterates under the shared lock
//! and upgrades to the writer lock only when a visitor asks for deletion.

use crate::{
    AnyForm, Form, FormCell, FormError, FormFlags, FormId, FormRef, Result, reserved,
};
use core_codec::record::RecordBody;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::{debug, warn};

/// Decision returned by a [`FormRegistry::visit`] visitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VisitDecision {
    Continue,
    Delete,
}

/// Factory that builds a form cell from a record body during load. The
/// payload starts with `[id:u64][flags:u32]`, written by the registry.
pub type FormFactory = Arc<
    dyn Fn(&RecordBody, &core_codec::record::StringTable) -> Result<Arc<dyn AnyForm>>
        + Send
        + Sync,
>;

#[derive(Default)]
struct FormMap {
    forms: HashMap<FormId, Arc<dyn AnyForm>>,
    /// Singleton tag -> id, so `create` can return the existing instance.
    singletons: HashMap<i32, FormId>,
}

/// Process-wide registry of all persistent objects.
pub struct FormRegistry {
    map: RwLock<FormMap>,
    factories: RwLock<HashMap<i32, FormFactory>>,
    next_id: AtomicU64,
    guid: RwLock<(u64, u64)>,
}

impl FormRegistry {
    pub fn new(guid: (u64, u64)) -> Self {
        Self {
            map: RwLock::new(FormMap::default()),
            factories: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(reserved::FIRST_DYNAMIC),
            guid: RwLock::new(guid),
        }
    }

    pub fn guid(&self) -> (u64, u64) {
        *self.guid.read().expect("guid lock poisoned")
    }

    pub(crate) fn set_guid(&self, guid: (u64, u64)) {
        *self.guid.write().expect("guid lock poisoned") = guid;
    }

    pub fn next_id_hint(&self) -> u64 {
        self.next_id.load(Ordering::Acquire)
    }

    pub(crate) fn set_next_id(&self, next: u64) {
        self.next_id.store(next.max(reserved::FIRST_DYNAMIC), Ordering::Release);
    }

    /// Registers the load factory for a form type. Called once per type at
    /// startup, before any load.
    pub fn register_factory<T: Form>(&self) {
        let factory: FormFactory = Arc::new(|body, strings| {
            let mut reader = body.reader();
            let id = reader.read_u64()?;
            let flags = FormFlags::from_bits_truncate(reader.read_u32()?);
            let value = T::read_data(body.version, &mut reader, strings)?;
            let cell: Arc<dyn AnyForm> = FormCell::with_flags(id, value, flags);
            Ok(cell)
        });
        self.factories
            .write()
            .expect("factory lock poisoned")
            .insert(T::type_tag(), factory);
    }

    pub(crate) fn factory_for(&self, type_tag: i32) -> Option<FormFactory> {
        self.factories
            .read()
            .expect("factory lock poisoned")
            .get(&type_tag)
            .cloned()
    }

    /// Atomically allocates the next id and inserts a new form built by
    /// `ctor`. For singleton types an existing instance is returned instead.
    pub fn create<T: Form>(&self, ctor: impl FnOnce(FormId) -> T) -> FormRef<T> {
        if let Some(singleton) = T::singleton_id() {
            if let Ok(existing) = self.lookup::<T>(singleton) {
                return existing;
            }
            let cell = FormCell::new(singleton, ctor(singleton));
            let mut map = self.map.write().expect("registry lock poisoned");
            // Racing creators may have inserted in between; the map wins.
            if let Some(form) = map.forms.get(&singleton) {
                if let Ok(typed) = downcast::<T>(form.clone(), singleton) {
                    return typed;
                }
            }
            let erased: Arc<dyn AnyForm> = cell.clone();
            map.forms.insert(singleton, erased);
            map.singletons.insert(T::type_tag(), singleton);
            return cell;
        }

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let cell = FormCell::new(id, ctor(id));
        let erased: Arc<dyn AnyForm> = cell.clone();
        self.map
            .write()
            .expect("registry lock poisoned")
            .forms
            .insert(id, erased);
        cell
    }

    /// Inserts a fully-built cell under its own id. Load path only; a second
    /// record with the same id is a serialization error.
    pub(crate) fn insert_loaded(&self, form: Arc<dyn AnyForm>) -> Result<()> {
        let id = form.id();
        let tag = form.type_tag();
        let mut map = self.map.write().expect("registry lock poisoned");
        if map.forms.contains_key(&id) {
            return Err(FormError::Serialization(format!(
                "form {id} instantiated twice"
            )));
        }
        if id < reserved::FIRST_DYNAMIC {
            map.singletons.insert(tag, id);
        }
        map.forms.insert(id, form);
        Ok(())
    }

    pub fn lookup<T: Form>(&self, id: FormId) -> Result<FormRef<T>> {
        let form = {
            let map = self.map.read().expect("registry lock poisoned");
            map.forms.get(&id).cloned()
        };
        let form = form.ok_or(FormError::NotFound(id))?;
        if form.type_tag() != T::type_tag() {
            return Err(FormError::WrongType {
                id,
                expected: T::type_tag(),
                actual: form.type_tag(),
            });
        }
        downcast::<T>(form, id)
    }

    /// Looks up the singleton of a type, wherever it was registered.
    pub fn singleton<T: Form>(&self) -> Result<FormRef<T>> {
        let id = match T::singleton_id() {
            Some(id) => id,
            None => {
                let map = self.map.read().expect("registry lock poisoned");
                *map.singletons
                    .get(&T::type_tag())
                    .ok_or(FormError::NotFound(0))?
            }
        };
        self.lookup::<T>(id)
    }

    /// Marks the form `Deleted` and removes it from the map. Retained forms
    /// cannot be deleted; the attempt is a logged no-op.
    pub fn delete(&self, id: FormId) {
        let mut map = self.map.write().expect("registry lock poisoned");
        let Some(form) = map.forms.get(&id) else {
            return;
        };
        if form.meta().is_pinned() {
            warn!(target: "forms.registry", id, "delete_skipped_retained");
            return;
        }
        form.meta().set_flag(FormFlags::DELETED);
        map.forms.remove(&id);
    }

    /// Iterates all forms under the shared lock. Visitors returning
    /// [`VisitDecision::Delete`] cause a second pass under the writer lock.
    pub fn visit(&self, mut visitor: impl FnMut(&Arc<dyn AnyForm>) -> VisitDecision) {
        let mut doomed = Vec::new();
        {
            let map = self.map.read().expect("registry lock poisoned");
            for (id, form) in map.forms.iter() {
                if visitor(form) == VisitDecision::Delete {
                    doomed.push(*id);
                }
            }
        }
        if doomed.is_empty() {
            return;
        }
        let mut map = self.map.write().expect("registry lock poisoned");
        for id in doomed {
            if let Some(form) = map.forms.get(&id) {
                if form.meta().is_pinned() {
                    warn!(target: "forms.registry", id, "delete_skipped_retained");
                    continue;
                }
                form.meta().set_flag(FormFlags::DELETED);
                map.forms.remove(&id);
            }
        }
    }

    /// Evicts every unpinned form the predicate selects. Returns the number
    /// of forms removed; a second sweep with no intervening activity removes
    /// nothing.
    pub fn sweep(&self, mut eligible: impl FnMut(&Arc<dyn AnyForm>) -> bool) -> usize {
        let mut removed = 0;
        let mut map = self.map.write().expect("registry lock poisoned");
        map.forms.retain(|id, form| {
            if form.meta().is_pinned() || !eligible(form) {
                return true;
            }
            form.meta().set_flag(FormFlags::DELETED);
            debug!(target: "forms.registry", id, "swept");
            removed += 1;
            false
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.map.read().expect("registry lock poisoned").forms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Snapshot of all forms, ordered by id so saves are deterministic.
    pub(crate) fn snapshot_sorted(&self) -> Vec<Arc<dyn AnyForm>> {
        let map = self.map.read().expect("registry lock poisoned");
        let mut forms: Vec<_> = map.forms.values().cloned().collect();
        forms.sort_by_key(|f| f.id());
        forms
    }
}

fn downcast<T: Form>(form: Arc<dyn AnyForm>, id: FormId) -> Result<FormRef<T>> {
    let expected = form.type_tag();
    form.as_any()
        .downcast::<FormCell<T>>()
        .map_err(|_| FormError::WrongType {
            id,
            expected: T::type_tag(),
            actual: expected,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RetainGuard;
    use core_codec::buffer::{ByteReader, ByteWriter};
    use core_codec::record::StringTable;

    #[derive(Debug, Default, PartialEq)]
    struct Marker {
        value: u64,
    }

    impl Form for Marker {
        fn type_tag() -> i32 {
            0x4D41524B // "MARK"
        }

        fn version() -> i32 {
            2
        }

        fn write_data(
            &self,
            out: &mut ByteWriter<Vec<u8>>,
            _strings: &mut StringTable,
        ) -> core_codec::Result<()> {
            out.write_u64(self.value)
        }

        fn read_data(
            _version: i32,
            input: &mut ByteReader<&[u8]>,
            _strings: &StringTable,
        ) -> Result<Self> {
            Ok(Self {
                value: input.read_u64()?,
            })
        }
    }

    #[derive(Debug, Default)]
    struct Lone;

    impl Form for Lone {
        fn type_tag() -> i32 {
            0x4C4F4E45 // "LONE"
        }

        fn version() -> i32 {
            2
        }

        fn singleton_id() -> Option<FormId> {
            Some(reserved::SESSION_DATA)
        }

        fn write_data(
            &self,
            _out: &mut ByteWriter<Vec<u8>>,
            _strings: &mut StringTable,
        ) -> core_codec::Result<()> {
            Ok(())
        }

        fn read_data(
            _version: i32,
            _input: &mut ByteReader<&[u8]>,
            _strings: &StringTable,
        ) -> Result<Self> {
            Ok(Self)
        }
    }

    fn registry() -> FormRegistry {
        FormRegistry::new((1, 2))
    }

    #[test]
    fn create_allocates_monotonic_ids() {
        let reg = registry();
        let a = reg.create(|_| Marker { value: 1 });
        let b = reg.create(|_| Marker { value: 2 });
        assert_eq!(a.id(), reserved::FIRST_DYNAMIC);
        assert_eq!(b.id(), reserved::FIRST_DYNAMIC + 1);
    }

    #[test]
    fn lookup_checks_type() {
        let reg = registry();
        let form = reg.create(|_| Marker { value: 7 });
        assert_eq!(reg.lookup::<Marker>(form.id()).unwrap().read().value, 7);
        assert!(matches!(
            reg.lookup::<Lone>(form.id()),
            Err(FormError::WrongType { .. })
        ));
        assert!(matches!(
            reg.lookup::<Marker>(999_999),
            Err(FormError::NotFound(_))
        ));
    }

    #[test]
    fn singleton_create_returns_existing() {
        let reg = registry();
        let first = reg.create(|_| Lone);
        let second = reg.create(|_| Lone);
        assert_eq!(first.id(), reserved::SESSION_DATA);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn delete_respects_retention() {
        let reg = registry();
        let form = reg.create(|_| Marker { value: 3 });
        let id = form.id();
        {
            let _pin = RetainGuard::pin(&form);
            reg.delete(id);
            assert!(reg.lookup::<Marker>(id).is_ok(), "pinned form must survive");
        }
        reg.delete(id);
        assert!(matches!(
            reg.lookup::<Marker>(id),
            Err(FormError::NotFound(_))
        ));
        assert!(form.meta().has_flag(FormFlags::DELETED));
    }

    #[test]
    fn visit_delete_upgrades_to_writer() {
        let reg = registry();
        let keep = reg.create(|_| Marker { value: 0 });
        let drop_me = reg.create(|_| Marker { value: 1 });
        reg.visit(|form| {
            if form.id() == drop_me.id() {
                VisitDecision::Delete
            } else {
                VisitDecision::Continue
            }
        });
        assert!(reg.lookup::<Marker>(keep.id()).is_ok());
        assert!(reg.lookup::<Marker>(drop_me.id()).is_err());
    }

    #[test]
    fn sweep_is_idempotent() {
        let reg = registry();
        for i in 0..10 {
            reg.create(|_| Marker { value: i });
        }
        let pinned = reg.create(|_| Marker { value: 99 });
        let _pin = RetainGuard::pin(&pinned);

        let first = reg.sweep(|f| f.type_tag() == Marker::type_tag());
        assert_eq!(first, 10);
        let second = reg.sweep(|f| f.type_tag() == Marker::type_tag());
        assert_eq!(second, 0, "sweep must be idempotent at quiescence");
        assert!(reg.lookup::<Marker>(pinned.id()).is_ok());
    }
}
