//! Persistent object graph: forms, flags, the registry, and save/load.
//!
//! Every domain object the engine keeps across sessions is a *form*: it has
//! a stable 64-bit id, a type tag, a flag bitset, and a versioned binary
//! representation. Forms never hold pointers to each other; cross-form
//! references are ids resolved through the [`registry::FormRegistry`]. That
//! keeps the graph cycle-safe and lets a save snapshot it wholesale.
//!
//! Retention works on a counter, not a flag: any holder that borrows a form
//! beyond one task invocation takes a [`RetainGuard`]; the memory sweep only
//! evicts forms whose counter is zero. The legacy `DO_NOT_FREE` bit is kept
//! in the persisted flag set as a snapshot of "was pinned at save time".

pub mod registry;
pub mod resolver;
pub mod save;

pub use registry::{FormRegistry, VisitDecision};
pub use resolver::LoadResolver;
pub use save::{
    LoadOutcome, MIN_SUPPORTED_SAVE_VERSION, NoHooks, SAVE_VERSION, SaveContext, SaveHeader,
    SaveHooks, load, save,
};

use bitflags::bitflags;
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_codec::CodecError;
use std::any::Any;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

/// Stable identifier of a form, unique within one session.
pub type FormId = u64;

/// Reserved ids of the singleton forms.
pub mod reserved {
    use super::FormId;

    pub const SETTINGS: FormId = 1;
    pub const TASK_SCHEDULER: FormId = 2;
    pub const EXECUTION_HANDLER: FormId = 3;
    pub const ORACLE: FormId = 4;
    pub const GENERATOR: FormId = 5;
    pub const GRAMMAR: FormId = 6;
    pub const EXCLUSION_TREE: FormId = 7;
    pub const SESSION: FormId = 8;
    pub const SESSION_DATA: FormId = 9;

    /// First id handed out to non-singleton forms.
    pub const FIRST_DYNAMIC: FormId = 100;
}

bitflags! {
    /// Per-form flag bitset. Persisted verbatim.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FormFlags: u32 {
        const DO_NOT_FREE = 1 << 0;
        const DELETED = 1 << 1;
        const DUPLICATE = 1 << 2;
        const GENERATED_DELTA_DEBUGGING = 1 << 3;
        const GENERATED_GRAMMAR_PARENT = 1 << 4;
        const GENERATED_GRAMMAR_PARENT_BACKTRACK = 1 << 5;
        const DELTA_DEBUGGED = 1 << 6;
    }
}

/// Errors of the form layer, covering registry operations and save/load.
#[derive(Debug, Error)]
pub enum FormError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("save file version {0:#x} is not supported")]
    UnsupportedVersion(i32),
    #[error("save file was not produced by this session (guid mismatch)")]
    WrongGuid,
    #[error("unknown record type {0:#x}")]
    UnsupportedRecord(i32),
    #[error("form {0} not found")]
    NotFound(FormId),
    #[error("form {id} has type {actual:#x}, expected {expected:#x}")]
    WrongType { id: FormId, expected: i32, actual: i32 },
    #[error("form {0} is retained and cannot be deleted")]
    Pinned(FormId),
}

impl From<CodecError> for FormError {
    fn from(err: CodecError) -> Self {
        match err {
            CodecError::Io(e) => FormError::Io(e),
            CodecError::UnsupportedRecord(tag) => FormError::UnsupportedRecord(tag),
            other => FormError::Serialization(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, FormError>;

/// Serializable, two-phase-loadable domain object.
///
/// `read_data` fills the form from its record payload, leaving cross-form
/// references as raw ids (the payload fields double as the load scratch).
/// `initialize_early` resolves the form's own id references against the
/// registry; `initialize_late` re-runs side-effecting reconstruction that
/// needs every form early-initialized (index rebuilds, trie re-entry).
pub trait Form: Send + Sync + 'static {
    fn type_tag() -> i32
    where
        Self: Sized;

    /// Record payload version this type currently writes.
    fn version() -> i32
    where
        Self: Sized;

    /// Reserved id for singleton types.
    fn singleton_id() -> Option<FormId>
    where
        Self: Sized,
    {
        None
    }

    fn write_data(&self, out: &mut ByteWriter<Vec<u8>>, strings: &mut StringTable)
        -> core_codec::Result<()>;

    fn read_data(
        version: i32,
        input: &mut ByteReader<&[u8]>,
        strings: &StringTable,
    ) -> Result<Self>
    where
        Self: Sized;

    fn initialize_early(&mut self, _resolver: &LoadResolver) -> Result<()> {
        Ok(())
    }

    fn initialize_late(&mut self, _resolver: &LoadResolver) -> Result<()> {
        Ok(())
    }
}

/// Runtime metadata shared by every form cell: flags, retention counter and
/// the changed taint.
#[derive(Debug)]
pub struct FormMeta {
    flags: AtomicU32,
    retain: AtomicU32,
    changed: AtomicBool,
}

impl FormMeta {
    fn new(flags: FormFlags) -> Self {
        Self {
            flags: AtomicU32::new(flags.bits()),
            retain: AtomicU32::new(0),
            changed: AtomicBool::new(false),
        }
    }

    pub fn flags(&self) -> FormFlags {
        FormFlags::from_bits_truncate(self.flags.load(Ordering::Acquire))
    }

    pub fn set_flag(&self, flag: FormFlags) {
        self.flags.fetch_or(flag.bits(), Ordering::AcqRel);
    }

    pub fn clear_flag(&self, flag: FormFlags) {
        self.flags.fetch_and(!flag.bits(), Ordering::AcqRel);
    }

    pub fn has_flag(&self, flag: FormFlags) -> bool {
        self.flags().contains(flag)
    }

    pub fn retain_count(&self) -> u32 {
        self.retain.load(Ordering::Acquire)
    }

    /// A form is pinned while any retain guard is alive.
    pub fn is_pinned(&self) -> bool {
        self.retain_count() > 0
    }

    pub fn mark_changed(&self) {
        self.changed.store(true, Ordering::Release);
    }

    pub fn clear_changed(&self) {
        self.changed.store(false, Ordering::Release);
    }

    pub fn is_changed(&self) -> bool {
        self.changed.load(Ordering::Acquire)
    }
}

/// One registered form: metadata plus the locked payload.
pub struct FormCell<T> {
    id: FormId,
    meta: FormMeta,
    data: RwLock<T>,
}

impl<T: Form> FormCell<T> {
    pub fn new(id: FormId, value: T) -> Arc<Self> {
        Arc::new(Self {
            id,
            meta: FormMeta::new(FormFlags::empty()),
            data: RwLock::new(value),
        })
    }

    fn with_flags(id: FormId, value: T, flags: FormFlags) -> Arc<Self> {
        Arc::new(Self {
            id,
            meta: FormMeta::new(flags),
            data: RwLock::new(value),
        })
    }

    pub fn id(&self) -> FormId {
        self.id
    }

    pub fn meta(&self) -> &FormMeta {
        &self.meta
    }

    pub fn read(&self) -> RwLockReadGuard<'_, T> {
        self.data.read().expect("form lock poisoned")
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, T> {
        self.meta.mark_changed();
        self.data.write().expect("form lock poisoned")
    }
}

/// Shared handle to a typed form.
pub type FormRef<T> = Arc<FormCell<T>>;

/// Type-erased view the registry stores and the save path iterates.
pub trait AnyForm: Send + Sync {
    fn id(&self) -> FormId;
    fn type_tag(&self) -> i32;
    fn meta(&self) -> &FormMeta;
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
    fn write_record(
        &self,
        out: &mut ByteWriter<&mut dyn std::io::Write>,
        strings: &mut StringTable,
    ) -> core_codec::Result<()>;
    fn run_initialize_early(&self, resolver: &LoadResolver) -> Result<()>;
    fn run_initialize_late(&self, resolver: &LoadResolver) -> Result<()>;
}

impl<T: Form> AnyForm for FormCell<T> {
    fn id(&self) -> FormId {
        self.id
    }

    fn type_tag(&self) -> i32 {
        T::type_tag()
    }

    fn meta(&self) -> &FormMeta {
        &self.meta
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn write_record(
        &self,
        out: &mut ByteWriter<&mut dyn std::io::Write>,
        strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        let data = self.read();
        // Snapshot the pin state into the legacy flag before persisting.
        let mut flags = self.meta.flags();
        flags.set(FormFlags::DO_NOT_FREE, self.meta.is_pinned());
        core_codec::record::write_record(out, T::type_tag(), T::version(), |body| {
            body.write_u64(self.id)?;
            body.write_u32(flags.bits())?;
            data.write_data(body, strings)
        })
    }

    fn run_initialize_early(&self, resolver: &LoadResolver) -> Result<()> {
        self.data
            .write()
            .expect("form lock poisoned")
            .initialize_early(resolver)
    }

    fn run_initialize_late(&self, resolver: &LoadResolver) -> Result<()> {
        self.data
            .write()
            .expect("form lock poisoned")
            .initialize_late(resolver)
    }
}

/// RAII retention pin. While alive, the pinned form cannot be deleted or
/// swept.
pub struct RetainGuard {
    meta: Arc<dyn AnyForm>,
}

impl RetainGuard {
    pub fn new(form: Arc<dyn AnyForm>) -> Self {
        form.meta().retain.fetch_add(1, Ordering::AcqRel);
        Self { meta: form }
    }

    pub fn pin<T: Form>(form: &FormRef<T>) -> Self {
        Self::new(form.clone())
    }

    pub fn form_id(&self) -> FormId {
        self.meta.id()
    }
}

impl Drop for RetainGuard {
    fn drop(&mut self) {
        self.meta.meta().retain.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for RetainGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetainGuard")
            .field("form", &self.meta.id())
            .finish()
    }
}
