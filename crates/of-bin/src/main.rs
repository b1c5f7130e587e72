//! Oxifuzz entrypoint.
use anyhow::Result;
use clap::Parser;
use core_session::{EndReason, Session, SessionError, Settings};
use std::path::{Path, PathBuf};
use std::sync::Once;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;

/// Exit code for oracle/grammar misconfiguration.
const EXIT_STARTUP_ERROR: i32 = 2;

/// CLI arguments.
#[derive(Parser, Debug)]
#[command(name = "oxifuzz", version, about = "Grammar-based fuzzing and test-case minimization")]
struct Args {
    /// Settings file (default: ./oxifuzz.toml).
    #[arg(short = 'c', long = "conf")]
    pub conf: Option<PathBuf>,
    /// Load the named save and resume the session.
    #[arg(short = 'l', long = "load")]
    pub load: Option<String>,
    /// Save number to load; latest when omitted.
    #[arg(long = "number")]
    pub number: Option<u64>,
    /// Print the statistics of the named save and exit.
    #[arg(short = 'p', long = "print-stats")]
    pub print_stats: Option<String>,
    /// Validate the configuration and print sample inputs, no execution.
    #[arg(long = "dry")]
    pub dry: bool,
    /// Resolve the replay command line for one whitespace-separated input.
    #[arg(long = "dry-i")]
    pub dry_input: Option<String>,
}

struct AppStartup {
    log_guard: Option<WorkerGuard>,
}

impl AppStartup {
    fn new() -> Self {
        Self { log_guard: None }
    }

    fn configure_logging(&mut self) {
        let file_appender = tracing_appender::rolling::never(Path::new("."), "oxifuzz.log");
        let (nb_writer, guard) = tracing_appender::non_blocking(file_appender);
        match tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_writer(nb_writer)
            .with_ansi(false)
            .try_init()
        {
            Ok(_) => {
                self.log_guard = Some(guard);
            }
            Err(_err) => {
                // Global tracing subscriber already installed; drop guard so
                // the writer shuts down.
            }
        }
    }

    fn install_panic_hook() {
        static HOOK: Once = Once::new();
        HOOK.call_once(|| {
            let default_panic = std::panic::take_hook();
            std::panic::set_hook(Box::new(move |panic_info| {
                tracing::error!(target: "runtime.panic", ?panic_info, "panic");
                default_panic(panic_info);
            }));
        });
    }
}

fn settings_path(args: &Args) -> PathBuf {
    args.conf
        .clone()
        .unwrap_or_else(|| PathBuf::from("oxifuzz.toml"))
}

/// Locates the save file for `-l`/`-p`: explicit number or the latest.
fn resolve_save(settings: &Settings, name: &str, number: Option<u64>) -> Result<PathBuf, String> {
    let mut named = settings.clone();
    named.saves.save_name = name.to_owned();
    let number = match number {
        Some(number) => number,
        None => named
            .latest_save_number()
            .ok_or_else(|| format!("no saves named '{name}' under {}", named.saves.save_path.display()))?,
    };
    let path = named.save_file(number);
    if !path.is_file() {
        return Err(format!("save file {} does not exist", path.display()));
    }
    Ok(path)
}

fn print_stats(settings: &Settings, name: &str, number: Option<u64>) -> i32 {
    let path = match resolve_save(settings, name, number) {
        Ok(path) => path,
        Err(message) => {
            eprintln!("{message}");
            return 1;
        }
    };
    match Session::stats_from_save(&path) {
        Ok(stats) => {
            println!(
                "{}",
                serde_json::to_string_pretty(&stats).unwrap_or_else(|_| "{}".into())
            );
            0
        }
        Err(err) => {
            eprintln!("failed to read {}: {err}", path.display());
            1
        }
    }
}

/// `--dry`: validate the configuration and show what would be generated.
fn dry_run(settings: &Settings) -> i32 {
    let grammar_source = &settings.put.grammar;
    let grammar = core_session::Grammar::parse(&read_source(grammar_source));
    if !grammar.is_usable() {
        eprintln!("grammar has no tokens");
        return EXIT_STARTUP_ERROR;
    }
    let mut generator = core_session::Generator::default();
    println!("grammar: {} tokens, length {}..={}", grammar.alphabet.len(), grammar.min_len, grammar.max_len);
    for i in 0..5 {
        if let Some((tokens, _tree)) = generator.generate(&grammar, 0, 0) {
            println!("sample {}: {}", i + 1, tokens.join(" "));
        }
    }
    0
}

/// `--dry-i`: resolve the replay command line for a concrete input.
fn dry_replay(settings: &Settings, raw: &str) -> i32 {
    let tokens: Vec<String> = raw.split_whitespace().map(str::to_owned).collect();
    if tokens.is_empty() {
        eprintln!("empty input");
        return 1;
    }
    let oracle = core_oracle::Oracle {
        put_type: core_oracle::PutType::StdinDump,
        put_path: settings.put.path.clone(),
        cmd_script: read_source(&settings.put.lua_cmd_script),
        cmd_replay_script: read_source(&settings.put.lua_cmd_script_replay),
        script_args_script: read_source(&settings.put.lua_script_args_script),
        oracle_script: read_source(&settings.put.lua_oracle_script),
    };
    if let Err(err) = oracle.register_thread() {
        eprintln!("oracle scripts failed to load: {err}");
        return EXIT_STARTUP_ERROR;
    }
    let test = core_exec::Test::new(0, 0, None, tokens.clone(), Default::default(), false);
    let result = match oracle.get_cmd_args(&test, true) {
        Ok(args) => {
            println!("put: {}", settings.put.path);
            println!("args: {args}");
            println!("stdin: {}", tokens.join("\\n"));
            0
        }
        Err(err) => {
            eprintln!("cmd-args script failed: {err}");
            1
        }
    };
    core_oracle::Oracle::unregister_thread();
    result
}

fn read_source(value: &str) -> String {
    let path = Path::new(value);
    if path.is_file() {
        std::fs::read_to_string(path).unwrap_or_else(|_| value.to_owned())
    } else {
        value.to_owned()
    }
}

fn run_session(session: Session) -> i32 {
    info!(target: "runtime", "session_running");
    let reason = session.wait();
    let save = session.ctx().settings.saves.enable_saves;
    session.stop(save);
    info!(target: "runtime", reason = ?reason, "session_ended");
    reason.exit_code()
}

fn main() -> Result<()> {
    let mut startup = AppStartup::new();
    startup.configure_logging();
    AppStartup::install_panic_hook();
    info!(target: "runtime", "startup");

    let args = Args::parse();
    let settings = Settings::load_from(&settings_path(&args));

    let code = if let Some(name) = args.print_stats.as_deref() {
        print_stats(&settings, name, args.number)
    } else if args.dry {
        dry_run(&settings)
    } else if let Some(raw) = args.dry_input.as_deref() {
        dry_replay(&settings, raw)
    } else if let Some(name) = args.load.as_deref() {
        match resolve_save(&settings, name, args.number) {
            Ok(path) => match Session::start_loaded(&path) {
                Ok(session) => run_session(session),
                Err(err) => {
                    error!(target: "runtime", %err, "load_failed");
                    eprintln!("failed to load session: {err}");
                    exit_code_for(&err)
                }
            },
            Err(message) => {
                eprintln!("{message}");
                1
            }
        }
    } else {
        match Session::start(settings) {
            Ok(session) => run_session(session),
            Err(err) => {
                error!(target: "runtime", %err, "startup_failed");
                eprintln!("failed to start session: {err}");
                exit_code_for(&err)
            }
        }
    };

    if code != 0 {
        warn!(target: "runtime", code, "exiting_nonzero");
    }
    drop(startup);
    std::process::exit(code);
}

fn exit_code_for(err: &SessionError) -> i32 {
    match err {
        SessionError::Startup(_) => EXIT_STARTUP_ERROR,
        SessionError::ConvergenceFailure => EndReason::ConvergenceFailure.exit_code(),
        SessionError::OutOfMemory => EndReason::OutOfMemory.exit_code(),
        _ => 1,
    }
}
