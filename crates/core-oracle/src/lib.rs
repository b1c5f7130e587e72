//! Oracle adapter: per-worker embedded Lua contexts.
//!
//! The oracle form carries the PUT description and three script bodies.
//! Each scheduler worker registers a Lua state of its own at thread start;
//! the three public operations always run on the calling worker's state and
//! fail with [`OracleError::NoContext`] when the thread never registered.
//!
//! Script contract: the bodies define the global functions
//! `GetCmdArgs(test, replay) -> string`, `GetScriptArgs(test) -> string`
//! and `Oracle(test) -> verdict [, primary, secondary, primary_tbl,
//! secondary_tbl]`, with verdict 0 = Passing, 1 = Failing, 2 = Unfinished,
//! 3 = Undefined. `test` is a read-only table of the finished run.

use core_codec::buffer::{ByteReader, ByteWriter};
use core_codec::record::StringTable;
use core_exec::{ExitReason, Test};
use core_forms::{Form, FormId, reserved};
use core_inputs::OracleVerdict;
use mlua::{Lua, Table, Value};
use std::cell::RefCell;
use thiserror::Error;
use tracing::{debug, warn};

pub const TYPE_ORACLE: i32 = i32::from_be_bytes(*b"ORCL");

#[derive(Debug, Error)]
pub enum OracleError {
    /// The calling worker has no registered scripting context.
    #[error("worker thread has no oracle context")]
    NoContext,
    #[error("oracle script error: {0}")]
    Script(String),
}

impl From<mlua::Error> for OracleError {
    fn from(err: mlua::Error) -> Self {
        OracleError::Script(err.to_string())
    }
}

/// Kind of program under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PutType {
    #[default]
    Undefined,
    /// Interpreter + script: the script path is prepended to the
    /// command-line arguments.
    Script,
    /// Binary reading the sequence from stdin.
    StdinDump,
}

impl PutType {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => PutType::Script,
            2 => PutType::StdinDump,
            _ => PutType::Undefined,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            PutType::Undefined => 0,
            PutType::Script => 1,
            PutType::StdinDump => 2,
        }
    }
}

/// Everything the oracle evaluation hands back for one test.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OracleEvaluation {
    pub verdict: OracleVerdict,
    pub primary: f64,
    pub secondary: f64,
    pub primary_individual: Vec<f64>,
    pub secondary_individual: Vec<f64>,
}

/// Persistent oracle configuration: PUT identity plus the script bodies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Oracle {
    pub put_type: PutType,
    pub put_path: String,
    pub cmd_script: String,
    pub cmd_replay_script: String,
    pub script_args_script: String,
    pub oracle_script: String,
}

thread_local! {
    static CONTEXT: RefCell<Option<Lua>> = const { RefCell::new(None) };
}

impl Oracle {
    /// Creates this worker's Lua state and loads the script bodies into it.
    /// Returns false when the thread was already registered.
    pub fn register_thread(&self) -> Result<bool, OracleError> {
        CONTEXT.with(|slot| {
            let mut slot = slot.borrow_mut();
            if slot.is_some() {
                debug!(target: "oracle", "thread_already_registered");
                return Ok(false);
            }
            let lua = Lua::new();
            for (name, body) in [
                ("cmd", self.cmd_script.as_str()),
                ("cmd_replay", self.cmd_replay_script.as_str()),
                ("script_args", self.script_args_script.as_str()),
                ("oracle", self.oracle_script.as_str()),
            ] {
                if body.is_empty() {
                    continue;
                }
                lua.load(body)
                    .set_name(name)
                    .exec()
                    .map_err(OracleError::from)?;
            }
            *slot = Some(lua);
            debug!(target: "oracle", "thread_registered");
            Ok(true)
        })
    }

    /// Drops this worker's Lua state.
    pub fn unregister_thread() {
        CONTEXT.with(|slot| {
            if slot.borrow_mut().take().is_some() {
                debug!(target: "oracle", "thread_unregistered");
            }
        });
    }

    pub fn thread_registered() -> bool {
        CONTEXT.with(|slot| slot.borrow().is_some())
    }

    fn with_context<R>(
        &self,
        f: impl FnOnce(&Lua) -> Result<R, OracleError>,
    ) -> Result<R, OracleError> {
        CONTEXT.with(|slot| {
            let slot = slot.borrow();
            let lua = slot.as_ref().ok_or(OracleError::NoContext)?;
            f(lua)
        })
    }

    fn test_table<'a>(lua: &'a Lua, test: &Test) -> Result<Table<'a>, OracleError> {
        let table = lua.create_table()?;
        table.set("identifier", test.identifier)?;
        table.set("exitcode", test.exit_code)?;
        table.set("output", test.output_lossy())?;
        table.set("runtime_ms", test.runtime().as_millis() as u64)?;
        table.set("delivered", test.delivered)?;
        let sequence = lua.create_table()?;
        for (i, token) in test.sequence.iter().enumerate() {
            sequence.set(i + 1, token.as_str())?;
        }
        table.set("sequence", sequence)?;
        table.set("natural", test.exit_reasons.contains(ExitReason::NATURAL))?;
        table.set("last_input", test.exit_reasons.contains(ExitReason::LAST_INPUT))?;
        table.set("terminated", test.exit_reasons.contains(ExitReason::TERMINATED))?;
        table.set("timeout", test.exit_reasons.contains(ExitReason::TIMEOUT))?;
        table.set(
            "fragment_timeout",
            test.exit_reasons.contains(ExitReason::FRAGMENT_TIMEOUT),
        )?;
        table.set("memory", test.exit_reasons.contains(ExitReason::MEMORY))?;
        table.set("pipe", test.exit_reasons.contains(ExitReason::PIPE))?;
        table.set("init_error", test.exit_reasons.contains(ExitReason::INIT_ERROR))?;
        Ok(table)
    }

    /// Runs `GetCmdArgs(test, replay)` on the calling worker's context.
    pub fn get_cmd_args(&self, test: &Test, replay: bool) -> Result<String, OracleError> {
        self.with_context(|lua| {
            let table = Self::test_table(lua, test)?;
            let func: mlua::Function = lua
                .globals()
                .get("GetCmdArgs")
                .map_err(|_| OracleError::Script("GetCmdArgs is not defined".into()))?;
            Ok(func.call::<_, String>((table, replay))?)
        })
    }

    /// Runs `GetScriptArgs(test)`; only meaningful for `PutType::Script`.
    pub fn get_script_args(&self, test: &Test) -> Result<String, OracleError> {
        self.with_context(|lua| {
            let table = Self::test_table(lua, test)?;
            let func: mlua::Function = lua
                .globals()
                .get("GetScriptArgs")
                .map_err(|_| OracleError::Script("GetScriptArgs is not defined".into()))?;
            Ok(func.call::<_, String>(table)?)
        })
    }

    /// Runs the oracle function over a finished test. Only the four
    /// script-assignable verdicts can come back; anything else maps to
    /// Undefined with a warning.
    pub fn evaluate(&self, test: &Test) -> Result<OracleEvaluation, OracleError> {
        self.with_context(|lua| {
            let table = Self::test_table(lua, test)?;
            let func: mlua::Function = lua
                .globals()
                .get("Oracle")
                .map_err(|_| OracleError::Script("Oracle is not defined".into()))?;
            let results = func.call::<_, mlua::MultiValue>(table)?;
            let mut iter = results.into_iter();

            let verdict = match iter.next() {
                Some(Value::Integer(v)) => verdict_from_script(v),
                Some(Value::Number(v)) => verdict_from_script(v as i64),
                other => {
                    warn!(target: "oracle", ?other, "verdict_not_numeric");
                    OracleVerdict::Undefined
                }
            };
            let primary = number_or_zero(iter.next());
            let secondary = number_or_zero(iter.next());
            let primary_individual = number_list(iter.next());
            let secondary_individual = number_list(iter.next());

            Ok(OracleEvaluation {
                verdict,
                primary,
                secondary,
                primary_individual,
                secondary_individual,
            })
        })
    }
}

fn verdict_from_script(v: i64) -> OracleVerdict {
    match v {
        0 => OracleVerdict::Passing,
        1 => OracleVerdict::Failing,
        2 => OracleVerdict::Unfinished,
        3 => OracleVerdict::Undefined,
        other => {
            warn!(target: "oracle", verdict = other, "verdict_out_of_range");
            OracleVerdict::Undefined
        }
    }
}

fn number_or_zero(value: Option<Value>) -> f64 {
    match value {
        Some(Value::Number(n)) => n,
        Some(Value::Integer(n)) => n as f64,
        _ => 0.0,
    }
}

fn number_list(value: Option<Value>) -> Vec<f64> {
    let Some(Value::Table(table)) = value else {
        return Vec::new();
    };
    let mut out = Vec::new();
    for item in table.sequence_values::<f64>() {
        match item {
            Ok(v) => out.push(v),
            Err(_) => break,
        }
    }
    out
}

impl Form for Oracle {
    fn type_tag() -> i32 {
        TYPE_ORACLE
    }

    fn version() -> i32 {
        2
    }

    fn singleton_id() -> Option<FormId> {
        Some(reserved::ORACLE)
    }

    fn write_data(
        &self,
        out: &mut ByteWriter<Vec<u8>>,
        _strings: &mut StringTable,
    ) -> core_codec::Result<()> {
        out.write_u8(self.put_type.as_u8())?;
        out.write_string(&self.put_path)?;
        out.write_string(&self.cmd_script)?;
        out.write_string(&self.cmd_replay_script)?;
        out.write_string(&self.script_args_script)?;
        out.write_string(&self.oracle_script)
    }

    fn read_data(
        _version: i32,
        input: &mut ByteReader<&[u8]>,
        _strings: &StringTable,
    ) -> core_forms::Result<Self> {
        Ok(Self {
            put_type: PutType::from_u8(input.read_u8()?),
            put_path: input.read_string()?,
            cmd_script: input.read_string()?,
            cmd_replay_script: input.read_string()?,
            script_args_script: input.read_string()?,
            oracle_script: input.read_string()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core_exec::TestCommand;

    fn finished_test(output: &str, exit_code: i32) -> Test {
        let mut test = Test::new(
            9,
            0,
            None,
            vec!["a".into(), "b".into()],
            TestCommand::default(),
            false,
        );
        test.output = output.as_bytes().to_vec();
        test.exit_code = exit_code;
        test.exit_reasons |= ExitReason::NATURAL;
        test
    }

    fn oracle_with(oracle_script: &str) -> Oracle {
        Oracle {
            put_type: PutType::StdinDump,
            put_path: "/bin/cat".into(),
            cmd_script: "function GetCmdArgs(test, replay)\n  if replay then return \"-r\" end\n  return \"\"\nend".into(),
            cmd_replay_script: String::new(),
            script_args_script: "function GetScriptArgs(test)\n  return \"--seq \" .. #test.sequence\nend".into(),
            oracle_script: oracle_script.into(),
        }
    }

    #[test]
    fn no_context_errors() {
        let oracle = oracle_with("function Oracle(test) return 0 end");
        Oracle::unregister_thread();
        let test = finished_test("", 0);
        assert!(matches!(
            oracle.evaluate(&test),
            Err(OracleError::NoContext)
        ));
        assert!(matches!(
            oracle.get_cmd_args(&test, false),
            Err(OracleError::NoContext)
        ));
    }

    #[test]
    fn evaluate_returns_verdict_and_scores() {
        let oracle = oracle_with(
            "function Oracle(test)\n  if test.exitcode ~= 0 then return 1, 10.0, 2.0, {1.0, 9.0} end\n  return 0\nend",
        );
        Oracle::unregister_thread();
        assert!(oracle.register_thread().unwrap());
        assert!(!oracle.register_thread().unwrap(), "second register is a no-op");

        let passing = oracle.evaluate(&finished_test("ok", 0)).unwrap();
        assert_eq!(passing.verdict, OracleVerdict::Passing);
        assert_eq!(passing.primary, 0.0);

        let failing = oracle.evaluate(&finished_test("boom", 1)).unwrap();
        assert_eq!(failing.verdict, OracleVerdict::Failing);
        assert_eq!(failing.primary, 10.0);
        assert_eq!(failing.secondary, 2.0);
        assert_eq!(failing.primary_individual, vec![1.0, 9.0]);

        Oracle::unregister_thread();
        assert!(!Oracle::thread_registered());
    }

    #[test]
    fn cmd_and_script_args() {
        let oracle = oracle_with("function Oracle(test) return 0 end");
        Oracle::unregister_thread();
        oracle.register_thread().unwrap();

        let test = finished_test("", 0);
        assert_eq!(oracle.get_cmd_args(&test, false).unwrap(), "");
        assert_eq!(oracle.get_cmd_args(&test, true).unwrap(), "-r");
        assert_eq!(oracle.get_script_args(&test).unwrap(), "--seq 2");
        Oracle::unregister_thread();
    }

    #[test]
    fn out_of_range_verdict_maps_to_undefined() {
        let oracle = oracle_with("function Oracle(test) return 17 end");
        Oracle::unregister_thread();
        oracle.register_thread().unwrap();
        let eval = oracle.evaluate(&finished_test("", 0)).unwrap();
        assert_eq!(eval.verdict, OracleVerdict::Undefined);
        Oracle::unregister_thread();
    }

    #[test]
    fn record_round_trip() {
        let oracle = oracle_with("function Oracle(test) return 0 end");
        let mut strings = StringTable::new();
        let mut out = ByteWriter::new(Vec::new());
        oracle.write_data(&mut out, &mut strings).unwrap();
        let bytes = out.into_inner();
        let mut reader = ByteReader::new(bytes.as_slice());
        let decoded = Oracle::read_data(2, &mut reader, &strings).unwrap();
        assert_eq!(decoded, oracle);
    }
}
