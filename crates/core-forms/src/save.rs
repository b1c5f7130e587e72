//! Save/load orchestration.
//!
//! File layout (all header words uncompressed, little-endian):
//!
//! ```text
//! [version:i32][guid1:u64][guid2:u64]
//! [next_id:u64][global_tasks:u8][global_exec:u8][runtime_ns:i64]
//! [compression_level:i32][compression_extreme:u8]
//! -- bytes below here pass through the LZMA adapter when level != -1 --
//! [has_pending_cb:u8][256-byte padded callback region]
//! [record_count:u64]
//! { record* }        first record is always the STRH string table
//! ```
//!
//! Form records intern their tokens while serializing, so the stream is
//! buffered in memory first and the finished intern table is emitted ahead
//! of it. Records are ordered by form id, which makes two saves of the same
//! quiescent state byte-identical.

use crate::registry::FormRegistry;
use crate::resolver::LoadResolver;
use crate::{FormError, Result};
use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::lzma::{CompressionSettings, StreamReader, StreamWriter};
use core_codec::record::{self, StringTable, TYPE_STRING_TABLE};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

/// Save format version this build writes.
pub const SAVE_VERSION: i32 = 0x2;

/// Oldest readable format. 0x1 predates the score-loss layout and is
/// rejected.
pub const MIN_SUPPORTED_SAVE_VERSION: i32 = 0x2;

/// Size of the padded pending-callback region.
const PENDING_CALLBACK_REGION: usize = 256;

/// Fixed header fields round-tripped through a save file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SaveHeader {
    pub version: i32,
    pub guid: (u64, u64),
    pub next_id: u64,
    pub global_tasks: bool,
    pub global_exec: bool,
    pub runtime: Duration,
}

/// Freeze/thaw hooks around the snapshot. The scheduler and execution
/// handler register here so no task runs while records are written.
pub trait SaveHooks {
    fn freeze(&self) {}
    fn thaw(&self) {}
}

/// Hook-less save, used by tests and tools.
pub struct NoHooks;

impl SaveHooks for NoHooks {}

/// Per-save parameters supplied by the session.
pub struct SaveContext {
    pub global_tasks: bool,
    pub global_exec: bool,
    pub runtime: Duration,
    pub compression: CompressionSettings,
    /// Pre-serialized pending callback, at most 248 bytes.
    pub pending_callback: Option<Vec<u8>>,
}

/// Everything a load hands back besides the populated registry.
pub struct LoadOutcome {
    pub header: SaveHeader,
    pub compression: CompressionSettings,
    pub pending_callback: Option<Vec<u8>>,
    /// Records dropped because their reader ran past the framed size.
    pub discarded_records: usize,
}

/// Writes the whole form graph to `path`. The hooks are frozen for the
/// duration and thawed on success and failure alike.
pub fn save(
    registry: &FormRegistry,
    path: &Path,
    ctx: &SaveContext,
    hooks: &dyn SaveHooks,
) -> Result<()> {
    hooks.freeze();
    let result = save_inner(registry, path, ctx);
    hooks.thaw();
    if let Err(err) = &result {
        warn!(target: "forms.save", path = %path.display(), %err, "save_failed");
    }
    result
}

fn save_inner(registry: &FormRegistry, path: &Path, ctx: &SaveContext) -> Result<()> {
    let file = File::create(path)?;
    let mut plain = ByteWriter::new(BufWriter::new(file));

    let guid = registry.guid();
    plain.write_i32(SAVE_VERSION)?;
    plain.write_u64(guid.0)?;
    plain.write_u64(guid.1)?;
    plain.write_u64(registry.next_id_hint())?;
    plain.write_u8(u8::from(ctx.global_tasks))?;
    plain.write_u8(u8::from(ctx.global_exec))?;
    plain.write_i64(
        i64::try_from(ctx.runtime.as_nanos()).unwrap_or(i64::MAX),
    )?;
    plain.write_i32(ctx.compression.level)?;
    plain.write_u8(u8::from(ctx.compression.extreme))?;
    plain.flush()?;

    let mut sink = plain.into_inner();
    let mut compressed = ByteWriter::new(StreamWriter::new(&mut sink, ctx.compression)?);

    // Pending callback region: presence byte plus a fixed padded block.
    match &ctx.pending_callback {
        Some(bytes) => {
            if bytes.len() + 8 > PENDING_CALLBACK_REGION {
                return Err(FormError::Serialization(format!(
                    "pending callback of {} bytes exceeds the padded region",
                    bytes.len()
                )));
            }
            compressed.write_u8(1)?;
            compressed.write_u64(bytes.len() as u64)?;
            compressed.write_bytes(bytes)?;
            compressed.write_bytes(&vec![0u8; PENDING_CALLBACK_REGION - 8 - bytes.len()])?;
        }
        None => {
            compressed.write_u8(0)?;
            compressed.write_bytes(&[0u8; PENDING_CALLBACK_REGION])?;
        }
    }

    // Serialize every form into a side buffer first so the intern table is
    // complete before it is emitted.
    let forms = registry.snapshot_sorted();
    let mut strings = StringTable::new();
    let mut record_bytes: Vec<u8> = Vec::new();
    for form in &forms {
        let sink: &mut dyn Write = &mut record_bytes;
        let mut out = ByteWriter::new(sink);
        form.write_record(&mut out, &mut strings)?;
        form.meta().clear_changed();
    }

    compressed.write_u64(forms.len() as u64 + 1)?;
    strings.write_record(&mut compressed)?;
    compressed.write_bytes(&record_bytes)?;
    compressed.flush()?;
    let writer = compressed.into_inner();
    writer.finish()?;
    sink.flush()?;

    info!(
        target: "forms.save",
        path = %path.display(),
        forms = forms.len(),
        strings = strings.len(),
        "save_complete"
    );
    Ok(())
}

/// Reads a save file into `registry`, running the two init phases and the
/// resolver queues. `expected_guid` is checked when resuming an existing
/// session; a fresh load accepts any guid and adopts it.
pub fn load(
    registry: &FormRegistry,
    path: &Path,
    expected_guid: Option<(u64, u64)>,
) -> Result<LoadOutcome> {
    let file = File::open(path)?;
    let mut plain = ByteReader::new(file);

    // Phase A: fixed header and compression settings.
    let version = plain.read_i32()?;
    if !(MIN_SUPPORTED_SAVE_VERSION..=SAVE_VERSION).contains(&version) {
        return Err(FormError::UnsupportedVersion(version));
    }
    let guid = (plain.read_u64()?, plain.read_u64()?);
    if let Some(expected) = expected_guid {
        if expected != guid {
            return Err(FormError::WrongGuid);
        }
    }
    let next_id = plain.read_u64()?;
    let global_tasks = plain.read_u8()? != 0;
    let global_exec = plain.read_u8()? != 0;
    let runtime_ns = plain.read_i64()?;
    let compression = CompressionSettings {
        level: plain.read_i32()?,
        extreme: plain.read_u8()? != 0,
        threads: 1,
    };

    let file = plain.into_inner();
    let mut input = ByteReader::new(StreamReader::new(file, compression)?);

    let pending_callback = {
        let has = input.read_u8()? != 0;
        let region = input.read_bytes(PENDING_CALLBACK_REGION)?;
        if has {
            let mut r = ByteReader::new(region.as_slice());
            let len = r.read_u64()? as usize;
            if len > PENDING_CALLBACK_REGION - 8 {
                return Err(FormError::Serialization(
                    "pending callback length exceeds its region".into(),
                ));
            }
            Some(r.read_bytes(len)?)
        } else {
            None
        }
    };

    // Phase B: stream records. The first must be the string table.
    let record_count = input.read_u64()?;
    if record_count == 0 {
        return Err(FormError::Serialization("empty record stream".into()));
    }
    let first = record::read_record(&mut input)?;
    if first.type_tag != TYPE_STRING_TABLE {
        return Err(FormError::Serialization(
            "first record is not the string table".into(),
        ));
    }
    let strings = StringTable::from_record(&first)?;

    let mut discarded = 0usize;
    for _ in 1..record_count {
        let body = record::read_record(&mut input)?;
        let Some(factory) = registry.factory_for(body.type_tag) else {
            return Err(FormError::UnsupportedRecord(body.type_tag));
        };
        match factory(&body, &strings).and_then(|form| registry.insert_loaded(form)) {
            Ok(()) => {}
            Err(FormError::Serialization(reason)) => {
                warn!(
                    target: "forms.load",
                    type_tag = body.type_tag,
                    reason = reason.as_str(),
                    "record_discarded"
                );
                discarded += 1;
            }
            Err(other) => return Err(other),
        }
    }

    registry.set_next_id(next_id);
    registry.set_guid(guid);

    // Phases C-E: early init, late init, resolver queues.
    let resolver = LoadResolver::new(registry);
    for form in registry.snapshot_sorted() {
        resolver.set_current(format!("early:{}:{:#x}", form.id(), form.type_tag()));
        form.run_initialize_early(&resolver)?;
    }
    for form in registry.snapshot_sorted() {
        resolver.set_current(format!("late:{}:{:#x}", form.id(), form.type_tag()));
        form.run_initialize_late(&resolver)?;
    }
    resolver.set_current("resolver-queues");
    resolver.drain()?;

    info!(
        target: "forms.load",
        path = %path.display(),
        forms = registry.len(),
        discarded,
        "load_complete"
    );

    Ok(LoadOutcome {
        header: SaveHeader {
            version,
            guid,
            next_id,
            global_tasks,
            global_exec,
            runtime: Duration::from_nanos(runtime_ns.max(0) as u64),
        },
        compression,
        pending_callback,
        discarded_records: discarded,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Form, FormFlags, RetainGuard};
    use core_codec::buffer::{ByteReader, ByteWriter};
    use tempfile::tempdir;

    #[derive(Debug, Default, PartialEq)]
    struct Blob {
        tokens: Vec<String>,
        score: f64,
    }

    impl Form for Blob {
        fn type_tag() -> i32 {
            0x424C4F42 // "BLOB"
        }

        fn version() -> i32 {
            2
        }

        fn write_data(
            &self,
            out: &mut ByteWriter<Vec<u8>>,
            strings: &mut StringTable,
        ) -> core_codec::Result<()> {
            strings.write_sequence(out, &self.tokens)?;
            out.write_f64(self.score)
        }

        fn read_data(
            _version: i32,
            input: &mut ByteReader<&[u8]>,
            strings: &StringTable,
        ) -> Result<Self> {
            Ok(Self {
                tokens: strings.read_sequence(input)?,
                score: input.read_f64()?,
            })
        }
    }

    fn seeded_registry() -> FormRegistry {
        let registry = FormRegistry::new((7, 9));
        registry.register_factory::<Blob>();
        registry
    }

    fn ctx(compression: CompressionSettings) -> SaveContext {
        SaveContext {
            global_tasks: false,
            global_exec: true,
            runtime: Duration::from_secs(42),
            compression,
            pending_callback: None,
        }
    }

    #[test]
    fn save_load_round_trip_plain_and_compressed() {
        for compression in [
            CompressionSettings::disabled(),
            CompressionSettings::default(),
        ] {
            let dir = tempdir().unwrap();
            let path = dir.path().join("session.save");

            let registry = seeded_registry();
            let a = registry.create(|_| Blob {
                tokens: vec!["a".into(), "b".into(), "a".into()],
                score: 1.5,
            });
            let b = registry.create(|_| Blob {
                tokens: vec!["b".into(), "c".into()],
                score: -2.0,
            });
            save(&registry, &path, &ctx(compression), &NoHooks).unwrap();

            let loaded = seeded_registry();
            let outcome = load(&loaded, &path, None).unwrap();
            assert_eq!(outcome.header.version, SAVE_VERSION);
            assert_eq!(outcome.header.guid, (7, 9));
            assert_eq!(outcome.header.runtime, Duration::from_secs(42));
            assert_eq!(outcome.discarded_records, 0);
            assert_eq!(loaded.guid(), (7, 9));

            let la = loaded.lookup::<Blob>(a.id()).unwrap();
            let lb = loaded.lookup::<Blob>(b.id()).unwrap();
            assert_eq!(*la.read(), *a.read());
            assert_eq!(*lb.read(), *b.read());
            // Fresh dynamic ids continue past the loaded ones.
            let c = loaded.create(|_| Blob::default());
            assert!(c.id() > b.id());
        }
    }

    #[test]
    fn pinned_flag_is_snapshotted() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.save");

        let registry = seeded_registry();
        let form = registry.create(|_| Blob::default());
        let _pin = RetainGuard::pin(&form);
        save(
            &registry,
            &path,
            &ctx(CompressionSettings::disabled()),
            &NoHooks,
        )
        .unwrap();

        let loaded = seeded_registry();
        load(&loaded, &path, None).unwrap();
        let cell = loaded.lookup::<Blob>(form.id()).unwrap();
        assert!(cell.meta().has_flag(FormFlags::DO_NOT_FREE));
        assert_eq!(cell.meta().retain_count(), 0, "pins are not reloaded");
    }

    #[test]
    fn pending_callback_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.save");

        let registry = seeded_registry();
        registry.create(|_| Blob::default());
        let mut context = ctx(CompressionSettings::disabled());
        context.pending_callback = Some(vec![1, 2, 3, 4, 5]);
        save(&registry, &path, &context, &NoHooks).unwrap();

        let loaded = seeded_registry();
        let outcome = load(&loaded, &path, None).unwrap();
        assert_eq!(outcome.pending_callback, Some(vec![1, 2, 3, 4, 5]));
    }

    #[test]
    fn guid_mismatch_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.save");

        let registry = seeded_registry();
        registry.create(|_| Blob::default());
        save(
            &registry,
            &path,
            &ctx(CompressionSettings::disabled()),
            &NoHooks,
        )
        .unwrap();

        let loaded = seeded_registry();
        assert!(matches!(
            load(&loaded, &path, Some((1, 1))),
            Err(FormError::WrongGuid)
        ));
    }

    #[test]
    fn old_version_is_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.save");
        let mut w = ByteWriter::new(std::fs::File::create(&path).unwrap());
        w.write_i32(0x1).unwrap();
        w.write_u64(0).unwrap();
        w.write_u64(0).unwrap();
        w.flush().unwrap();

        let loaded = seeded_registry();
        assert!(matches!(
            load(&loaded, &path, None),
            Err(FormError::UnsupportedVersion(0x1))
        ));
    }

    #[test]
    fn unknown_record_type_aborts() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("session.save");

        let registry = seeded_registry();
        registry.create(|_| Blob::default());
        save(
            &registry,
            &path,
            &ctx(CompressionSettings::disabled()),
            &NoHooks,
        )
        .unwrap();

        let loaded = FormRegistry::new((0, 0)); // no factories registered
        assert!(matches!(
            load(&loaded, &path, None),
            Err(FormError::UnsupportedRecord(_))
        ));
    }

    #[test]
    fn save_determinism() {
        let dir = tempdir().unwrap();
        let path_a = dir.path().join("a.save");
        let path_b = dir.path().join("b.save");

        let registry = seeded_registry();
        for i in 0..20 {
            registry.create(|_| Blob {
                tokens: vec![format!("tok{}", i % 5), "shared".into()],
                score: i as f64,
            });
        }
        let context = ctx(CompressionSettings::disabled());
        save(&registry, &path_a, &context, &NoHooks).unwrap();
        save(&registry, &path_b, &context, &NoHooks).unwrap();

        let a = std::fs::read(&path_a).unwrap();
        let b = std::fs::read(&path_b).unwrap();
        assert_eq!(a, b, "two saves of the same quiescent state must match");
    }
}
