//! One supervised PUT run.
//!
//! A `Test` owns the child process, its stdin pipe, and a reader thread
//! that drains stdout+stderr into a channel so the supervisory loop can
//! poll without blocking. Exit circumstances accumulate in a bitset; a test
//! always completes through its callback, whatever went wrong.

use bitflags::bitflags;
use core_forms::{FormId, RetainGuard};
use crossbeam_channel::{Receiver, TryRecvError, unbounded};
use std::io::{Read, Write};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

bitflags! {
    /// Why (and how) a test left the running state. Several bits may be
    /// set: a timeout also terminates, a repeat follows an init error.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ExitReason: u64 {
        const NATURAL = 1 << 0;
        /// Every fragment was delivered and acknowledged.
        const LAST_INPUT = 1 << 1;
        const TERMINATED = 1 << 2;
        const TIMEOUT = 1 << 3;
        const FRAGMENT_TIMEOUT = 1 << 4;
        const MEMORY = 1 << 5;
        const PIPE = 1 << 6;
        const INIT_ERROR = 1 << 10;
        /// Candidate must be rerun (stale derivation at completion).
        const REPEAT = 1 << 11;
    }
}

/// Command line resolved for one test before submission.
#[derive(Debug, Clone, Default)]
pub struct TestCommand {
    pub program: String,
    pub args: Vec<String>,
}

/// Lifecycle phase of a test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Initialized,
    Running,
    Done,
}

pub struct Test {
    pub identifier: u64,
    pub input_id: FormId,
    /// Keeps the input alive while the test is in flight.
    pub pin: Option<RetainGuard>,
    /// Tokens to deliver, newline-terminated on the wire.
    pub sequence: Vec<String>,
    pub command: TestCommand,
    pub fragment_mode: bool,
    pub state: TestState,
    /// Index of the next fragment to write.
    next_fragment: usize,
    /// Fragments actually delivered to the PUT.
    pub delivered: usize,
    pub reaction_times: Vec<Duration>,
    pub started: Option<Instant>,
    pub ended: Option<Instant>,
    last_write: Option<Instant>,
    /// Bytes read since the last write; any arrival acknowledges the
    /// outstanding fragment.
    acked_since_write: bool,
    child: Option<Child>,
    stdin: Option<ChildStdin>,
    output_rx: Option<Receiver<Vec<u8>>>,
    pub output: Vec<u8>,
    pub exit_code: i32,
    pub exit_reasons: ExitReason,
    valid: bool,
}

impl Test {
    pub fn new(
        identifier: u64,
        input_id: FormId,
        pin: Option<RetainGuard>,
        sequence: Vec<String>,
        command: TestCommand,
        fragment_mode: bool,
    ) -> Self {
        Self {
            identifier,
            input_id,
            pin,
            sequence,
            command,
            fragment_mode,
            state: TestState::Initialized,
            next_fragment: 0,
            delivered: 0,
            reaction_times: Vec::new(),
            started: None,
            ended: None,
            last_write: None,
            acked_since_write: false,
            child: None,
            stdin: None,
            output_rx: None,
            output: Vec::new(),
            exit_code: -1,
            exit_reasons: ExitReason::empty(),
            valid: true,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    /// Spawns the PUT with piped stdio and starts the output reader.
    pub fn spawn(&mut self) -> std::io::Result<()> {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let (tx, rx) = unbounded::<Vec<u8>>();

        // One reader thread per stream; both feed the same channel so the
        // polling loop sees combined output without blocking.
        for stream in [stdout.map(boxed_read), stderr.map(boxed_read)]
            .into_iter()
            .flatten()
        {
            let tx = tx.clone();
            std::thread::Builder::new()
                .name(format!("put-reader-{}", self.identifier))
                .spawn(move || {
                    let mut stream = stream;
                    let mut buf = [0u8; 4096];
                    loop {
                        match stream.read(&mut buf) {
                            Ok(0) | Err(_) => break,
                            Ok(n) => {
                                if tx.send(buf[..n].to_vec()).is_err() {
                                    break;
                                }
                            }
                        }
                    }
                })
                .expect("failed to spawn reader thread");
        }

        self.child = Some(child);
        self.stdin = stdin;
        self.output_rx = Some(rx);
        self.started = Some(Instant::now());
        self.state = TestState::Running;
        trace!(target: "exec.test", id = self.identifier, "spawned");
        Ok(())
    }

    /// Drains whatever output arrived since the last poll. Any bytes count
    /// as acknowledgment of the outstanding fragment.
    pub fn drain_output(&mut self) -> usize {
        let Some(rx) = &self.output_rx else {
            return 0;
        };
        let mut received = 0usize;
        loop {
            match rx.try_recv() {
                Ok(chunk) => {
                    received += chunk.len();
                    self.output.extend_from_slice(&chunk);
                }
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        if received > 0 {
            if let Some(at) = self.last_write {
                if !self.acked_since_write {
                    self.reaction_times.push(at.elapsed());
                }
            }
            self.acked_since_write = true;
        }
        received
    }

    /// True once every fragment was written and the last one acknowledged.
    pub fn all_delivered(&self) -> bool {
        self.next_fragment >= self.sequence.len()
            && (self.acked_since_write || self.sequence.is_empty())
    }

    /// Whether the outstanding fragment has been acknowledged, so the next
    /// may be written.
    pub fn fragment_acknowledged(&self) -> bool {
        self.last_write.is_none() || self.acked_since_write
    }

    pub fn time_since_write(&self) -> Option<Duration> {
        self.last_write.map(|at| at.elapsed())
    }

    pub fn runtime(&self) -> Duration {
        match (self.started, self.ended) {
            (Some(start), Some(end)) => end.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    /// Writes the next fragment. Returns false when nothing remains.
    pub fn write_next(&mut self) -> std::io::Result<bool> {
        if self.next_fragment >= self.sequence.len() {
            return Ok(false);
        }
        let token = self.sequence[self.next_fragment].clone();
        self.write_piece(&token)?;
        self.next_fragment += 1;
        self.delivered = self.next_fragment;
        Ok(true)
    }

    /// Writes the whole sequence at once (whole-input mode).
    pub fn write_all(&mut self) -> std::io::Result<()> {
        while self.next_fragment < self.sequence.len() {
            let token = self.sequence[self.next_fragment].clone();
            self.write_piece(&token)?;
            self.next_fragment += 1;
        }
        self.delivered = self.next_fragment;
        // Whole-input mode does not wait for acknowledgments.
        self.stdin = None;
        Ok(())
    }

    fn write_piece(&mut self, token: &str) -> std::io::Result<()> {
        let Some(stdin) = self.stdin.as_mut() else {
            return Err(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "stdin already closed",
            ));
        };
        stdin.write_all(token.as_bytes())?;
        stdin.write_all(b"\n")?;
        stdin.flush()?;
        self.last_write = Some(Instant::now());
        self.acked_since_write = false;
        Ok(())
    }

    /// Polls process exit without blocking.
    pub fn try_exit(&mut self) -> Option<i32> {
        let child = self.child.as_mut()?;
        match child.try_wait() {
            Ok(Some(status)) => {
                self.exit_code = status.code().unwrap_or(-1);
                Some(self.exit_code)
            }
            Ok(None) => None,
            Err(err) => {
                warn!(target: "exec.test", id = self.identifier, ?err, "wait_failed");
                None
            }
        }
    }

    /// Resident set size of the PUT in bytes, 0 when unknown.
    pub fn memory_consumption(&self) -> u64 {
        #[cfg(target_os = "linux")]
        {
            let Some(child) = &self.child else { return 0 };
            let path = format!("/proc/{}/statm", child.id());
            let Ok(contents) = std::fs::read_to_string(path) else {
                return 0;
            };
            let mut fields = contents.split_whitespace();
            let _virtual = fields.next();
            fields
                .next()
                .and_then(|pages| pages.parse::<u64>().ok())
                .map(|pages| pages * 4096)
                .unwrap_or(0)
        }
        #[cfg(not(target_os = "linux"))]
        {
            0
        }
    }

    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            if child.kill().is_ok() {
                self.exit_reasons |= ExitReason::TERMINATED;
            }
            let _ = child.wait();
        }
        self.stdin = None;
    }

    /// Closes pipes, reaps the child, records the end time. After this the
    /// test only carries results.
    pub fn invalidate(&mut self) {
        if !self.valid {
            return;
        }
        self.stdin = None;
        if let Some(mut child) = self.child.take() {
            // Reap if still around; kill() has already waited otherwise.
            if child.try_wait().ok().flatten().is_none() {
                let _ = child.kill();
                let _ = child.wait();
            }
        }
        // Final drain so late output is not lost.
        if let Some(rx) = self.output_rx.take() {
            while let Ok(chunk) = rx.try_recv() {
                self.output.extend_from_slice(&chunk);
            }
        }
        self.ended = Some(Instant::now());
        self.state = TestState::Done;
        self.valid = false;
        debug!(
            target: "exec.test",
            id = self.identifier,
            reasons = ?self.exit_reasons,
            exit_code = self.exit_code,
            delivered = self.delivered,
            "invalidated"
        );
    }

    pub fn output_lossy(&self) -> String {
        String::from_utf8_lossy(&self.output).into_owned()
    }
}

fn boxed_read(r: impl Read + Send + 'static) -> Box<dyn Read + Send> {
    Box::new(r)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seq(tokens: &[&str]) -> Vec<String> {
        tokens.iter().map(|s| s.to_string()).collect()
    }

    fn sh(script: &str) -> TestCommand {
        TestCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), script.into()],
        }
    }

    #[test]
    fn whole_input_echo() {
        let mut test = Test::new(1, 0, None, seq(&["hello", "world"]), sh("cat"), false);
        test.spawn().unwrap();
        test.write_all().unwrap();

        let deadline = Instant::now() + Duration::from_secs(5);
        while test.try_exit().is_none() {
            assert!(Instant::now() < deadline, "cat did not exit");
            std::thread::sleep(Duration::from_millis(10));
        }
        test.drain_output();
        test.invalidate();
        assert_eq!(test.output_lossy(), "hello\nworld\n");
        assert_eq!(test.exit_code, 0);
        assert!(!test.is_valid());
    }

    #[test]
    fn fragment_acknowledgment_cycle() {
        let mut test = Test::new(2, 0, None, seq(&["a", "b"]), sh("cat"), true);
        test.spawn().unwrap();

        assert!(test.fragment_acknowledged(), "nothing written yet");
        assert!(test.write_next().unwrap());
        assert!(!test.fragment_acknowledged());

        let deadline = Instant::now() + Duration::from_secs(5);
        while !test.fragment_acknowledged() {
            assert!(Instant::now() < deadline, "no echo from cat");
            std::thread::sleep(Duration::from_millis(10));
            test.drain_output();
        }
        assert_eq!(test.reaction_times.len(), 1);

        assert!(test.write_next().unwrap());
        assert!(!test.write_next().unwrap(), "sequence exhausted");
        test.kill();
        test.invalidate();
        assert!(test.exit_reasons.contains(ExitReason::TERMINATED));
    }

    #[test]
    fn spawn_failure_surfaces() {
        let mut test = Test::new(
            3,
            0,
            None,
            seq(&["x"]),
            TestCommand {
                program: "/nonexistent/put-binary".into(),
                args: vec![],
            },
            false,
        );
        assert!(test.spawn().is_err());
    }

    #[test]
    fn memory_consumption_reads_positive_on_linux() {
        let mut test = Test::new(4, 0, None, vec![], sh("sleep 5"), false);
        test.spawn().unwrap();
        std::thread::sleep(Duration::from_millis(100));
        if cfg!(target_os = "linux") {
            assert!(test.memory_consumption() > 0);
        }
        test.kill();
        test.invalidate();
    }
}
