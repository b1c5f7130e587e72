//! Two-phase load resolver.
//!
//! Carries the registry through the init phases of a load and owns the two
//! deferred-work queues: plain tasks run after late-init of all forms, late
//! tasks run after that and observe a fully reconstructed graph (this is
//! where cyclic references are stitched together). The `current` label names
//! the form being initialized so errors can be attributed.

use crate::registry::FormRegistry;
use crate::{Form, FormId, FormRef, Result};
use std::collections::VecDeque;
use std::sync::Mutex;
use tracing::warn;

type ResolverTask = Box<dyn FnOnce(&LoadResolver) + Send>;

pub struct LoadResolver<'a> {
    registry: &'a FormRegistry,
    tasks: Mutex<VecDeque<ResolverTask>>,
    late_tasks: Mutex<VecDeque<ResolverTask>>,
    current: Mutex<String>,
}

impl<'a> LoadResolver<'a> {
    pub fn new(registry: &'a FormRegistry) -> Self {
        Self {
            registry,
            tasks: Mutex::new(VecDeque::new()),
            late_tasks: Mutex::new(VecDeque::new()),
            current: Mutex::new(String::new()),
        }
    }

    pub fn registry(&self) -> &FormRegistry {
        self.registry
    }

    /// Resolves an id-reference. Missing or mistyped targets are logged
    /// against the current label and surface as `None`.
    pub fn resolve_form<T: Form>(&self, id: FormId) -> Option<FormRef<T>> {
        if id == 0 {
            return None;
        }
        match self.registry.lookup::<T>(id) {
            Ok(form) => Some(form),
            Err(err) => {
                warn!(
                    target: "forms.load",
                    id,
                    current = self.current().as_str(),
                    %err,
                    "unresolved_reference"
                );
                None
            }
        }
    }

    pub fn add_task(&self, task: impl FnOnce(&LoadResolver) + Send + 'static) {
        self.tasks
            .lock()
            .expect("resolver queue poisoned")
            .push_back(Box::new(task));
    }

    /// Late tasks observe fully-initialized forms.
    pub fn add_late_task(&self, task: impl FnOnce(&LoadResolver) + Send + 'static) {
        self.late_tasks
            .lock()
            .expect("resolver queue poisoned")
            .push_back(Box::new(task));
    }

    pub fn set_current(&self, label: impl Into<String>) {
        *self.current.lock().expect("resolver label poisoned") = label.into();
    }

    pub fn current(&self) -> String {
        self.current.lock().expect("resolver label poisoned").clone()
    }

    /// Drains the task queue, then the late-task queue. Tasks may enqueue
    /// further tasks of either kind while running.
    pub fn drain(&self) -> Result<()> {
        loop {
            let task = self
                .tasks
                .lock()
                .expect("resolver queue poisoned")
                .pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
        loop {
            let task = self
                .late_tasks
                .lock()
                .expect("resolver queue poisoned")
                .pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FormError;
    use core_codec::buffer::{ByteReader, ByteWriter};
    use core_codec::record::StringTable;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct Probe;

    impl Form for Probe {
        fn type_tag() -> i32 {
            0x50524F42
        }

        fn version() -> i32 {
            2
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
        ) -> std::result::Result<Self, FormError> {
            Ok(Self)
        }
    }

    #[test]
    fn resolve_missing_is_none() {
        let registry = FormRegistry::new((0, 0));
        let resolver = LoadResolver::new(&registry);
        assert!(resolver.resolve_form::<Probe>(12345).is_none());
        assert!(resolver.resolve_form::<Probe>(0).is_none());
    }

    #[test]
    fn tasks_run_before_late_tasks_and_may_requeue() {
        let registry = FormRegistry::new((0, 0));
        let resolver = LoadResolver::new(&registry);
        let order = Arc::new(Mutex::new(Vec::new()));
        let count = Arc::new(AtomicUsize::new(0));

        let o = order.clone();
        resolver.add_late_task(move |_| o.lock().unwrap().push("late"));
        let o = order.clone();
        let c = count.clone();
        resolver.add_task(move |r| {
            o.lock().unwrap().push("early");
            let o2 = o.clone();
            let c2 = c.clone();
            r.add_task(move |_| {
                o2.lock().unwrap().push("requeued");
                c2.fetch_add(1, Ordering::SeqCst);
            });
        });

        resolver.drain().unwrap();
        assert_eq!(*order.lock().unwrap(), vec!["early", "requeued", "late"]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
