//! Call-stack capture for traced events
//!
//! Three strategies, selected by configuration:
//!
//! | selection                        | strategy         | cargo feature     |
//! |----------------------------------|------------------|-------------------|
//! | `0`, `off`, `none`, `disabled`   | Disabled         | always            |
//! | `1`, `native`, `unwind`          | NativeUnwind     | `native-unwind`   |
//! | `2`, `helper`, `external`        | ExternalHelper   | `external-helper` |
//!
//! An unrecognized selection, or one whose feature was not compiled in, is
//! reported once and capture degrades to zero frames. Capture never fails
//! its caller.
//!
//! # Native Unwind
//!
//! ```text
//! backtrace::capture::Backtrace::new              ┐
//! estela::stack_capture::native_frames            │ tracer frames, always dropped
//! estela::stack_capture::StackCapture::frames     │
//! estela::session::Session::unwind                │
//! estela::session::Session::record_copy           ┘
//! app::hip_shim::hipMemcpy                        ← skip_frames drops these
//! #0 0x000055d0c3a1f2b0 in hipMemcpy() in app::copy at src/main.rs:42
//!    └─ renumbered from #0, API name spliced after the first address
//! ```
//!
//! Tracer frames are recognized by symbol name, so they are only dropped
//! when the binary keeps its symbols. The capture chain is `#[inline(never)]`
//! so each of those functions keeps a frame of its own.
//!
//! # External Helper
//!
//! A helper process is launched lazily, once per process id, with the pid as
//! its only argument. It answers `ready` when initialized; each `trace`
//! request is answered with one frame per line and a blank line. If launch
//! fails, capture for that pid stays at zero frames.

use parking_lot::Mutex;
use std::fmt;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::str::FromStr;
use thiserror::Error;
use tracing::{debug, warn};

/// Capture errors (all degrade to zero frames)
#[derive(Error, Debug)]
pub enum CaptureError {
    #[error("Stack frames requested through unrecognized selection {0:?}; expected 0 (off), 1 (native) or 2 (helper)")]
    Unrecognized(String),

    #[error("Stack frames through {0} requested but support was not compiled in")]
    Unsupported(CaptureStrategy),

    #[error("No stack helper command configured")]
    NoHelperCommand,

    #[error("Stack helper initialization failed for pid {pid}: {reason}")]
    HelperInit { pid: i32, reason: String },

    #[error("Stack helper request failed: {0}")]
    HelperTrace(String),
}

/// Stack capture strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStrategy {
    Disabled,
    NativeUnwind,
    ExternalHelper,
}

impl CaptureStrategy {
    /// Whether this build carries support for the strategy
    pub fn is_supported(self) -> bool {
        match self {
            CaptureStrategy::Disabled => true,
            CaptureStrategy::NativeUnwind => cfg!(feature = "native-unwind"),
            CaptureStrategy::ExternalHelper => cfg!(feature = "external-helper"),
        }
    }

    /// Parse a selection and check it is supported
    pub fn resolve(selection: &str) -> Result<Self, CaptureError> {
        let strategy: Self = selection.parse()?;
        if strategy.is_supported() {
            Ok(strategy)
        } else {
            Err(CaptureError::Unsupported(strategy))
        }
    }
}

impl FromStr for CaptureStrategy {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "0" | "off" | "none" | "disabled" => Ok(CaptureStrategy::Disabled),
            "1" | "native" | "unwind" => Ok(CaptureStrategy::NativeUnwind),
            "2" | "helper" | "external" => Ok(CaptureStrategy::ExternalHelper),
            _ => Err(CaptureError::Unrecognized(s.to_string())),
        }
    }
}

impl fmt::Display for CaptureStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CaptureStrategy::Disabled => "disabled",
            CaptureStrategy::NativeUnwind => "native-unwind",
            CaptureStrategy::ExternalHelper => "external-helper",
        };
        f.write_str(name)
    }
}

/// Out-of-process stack resolver
pub trait FrameHelper: Send {
    /// One trace, innermost frame first
    fn traces(&mut self) -> Result<Vec<String>, CaptureError>;
}

/// Launches a helper for a process id
pub type HelperLauncher =
    Box<dyn Fn(i32) -> Result<Box<dyn FrameHelper>, CaptureError> + Send + Sync>;

/// Helper speaking the line protocol over a child's stdin/stdout
pub struct CommandHelper {
    child: Child,
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

impl CommandHelper {
    /// Spawn `program <pid>` and wait for its `ready` line
    pub fn spawn(program: &Path, pid: i32) -> Result<Self, CaptureError> {
        let init = |reason: String| CaptureError::HelperInit { pid, reason };

        let mut child = Command::new(program)
            .arg(pid.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| init(format!("{}: {}", program.display(), e)))?;

        let stdin = child.stdin.take().ok_or_else(|| init("no stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| init("no stdout".to_string()))?;
        let mut helper = Self {
            child,
            stdin,
            stdout: BufReader::new(stdout),
        };

        let mut line = String::new();
        helper
            .stdout
            .read_line(&mut line)
            .map_err(|e| init(e.to_string()))?;
        if line.trim() != "ready" {
            return Err(init(format!("unexpected handshake {:?}", line.trim())));
        }

        Ok(helper)
    }
}

impl FrameHelper for CommandHelper {
    fn traces(&mut self) -> Result<Vec<String>, CaptureError> {
        let io = |e: std::io::Error| CaptureError::HelperTrace(e.to_string());

        writeln!(self.stdin, "trace").map_err(io)?;
        self.stdin.flush().map_err(io)?;

        let mut frames = Vec::new();
        loop {
            let mut line = String::new();
            if self.stdout.read_line(&mut line).map_err(io)? == 0 {
                break;
            }
            let frame = line.trim_end_matches(['\r', '\n']);
            if frame.is_empty() {
                break;
            }
            frames.push(frame.to_string());
        }
        Ok(frames)
    }
}

impl Drop for CommandHelper {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

/// Launcher spawning `program` through [`CommandHelper`]
pub fn command_launcher(program: Option<PathBuf>) -> HelperLauncher {
    Box::new(move |pid: i32| match &program {
        Some(program) => {
            CommandHelper::spawn(program, pid).map(|h| Box::new(h) as Box<dyn FrameHelper>)
        }
        None => Err(CaptureError::NoHelperCommand),
    })
}

enum HelperState {
    Ready(Box<dyn FrameHelper>),
    Failed,
}

struct HelperSlot {
    launcher: HelperLauncher,
    /// Helper for the pid it was launched for
    state: Mutex<Option<(i32, HelperState)>>,
}

impl HelperSlot {
    fn frames(&self) -> Vec<String> {
        let pid = nix::unistd::getpid().as_raw();
        let mut slot = self.state.lock();

        if !matches!(&*slot, Some((owner, _)) if *owner == pid) {
            debug!(pid, "initializing stack helper");
            let state = match (self.launcher)(pid) {
                Ok(helper) => HelperState::Ready(helper),
                Err(e) => {
                    warn!(pid, error = %e, "stack helper unavailable; capturing no frames");
                    HelperState::Failed
                }
            };
            *slot = Some((pid, state));
        }

        match &mut *slot {
            Some((_, HelperState::Ready(helper))) => match helper.traces() {
                Ok(frames) => frames,
                Err(e) => {
                    warn!(pid, error = %e, "stack helper request failed");
                    Vec::new()
                }
            },
            _ => Vec::new(),
        }
    }
}

enum Mode {
    Disabled,
    Native { skip: usize },
    Helper(HelperSlot),
}

/// Configured stack capture
pub struct StackCapture {
    mode: Mode,
    requested: String,
}

impl StackCapture {
    /// No capture
    pub fn disabled() -> Self {
        Self {
            mode: Mode::Disabled,
            requested: "0".to_string(),
        }
    }

    /// Build from a selection string
    ///
    /// Unrecognized or unsupported selections are logged here, once, and
    /// produce a capture that yields no frames.
    pub fn new(selection: &str, skip_frames: usize, launcher: HelperLauncher) -> Self {
        let mode = match CaptureStrategy::resolve(selection) {
            Ok(CaptureStrategy::Disabled) => Mode::Disabled,
            Ok(CaptureStrategy::NativeUnwind) => Mode::Native { skip: skip_frames },
            Ok(CaptureStrategy::ExternalHelper) => Mode::Helper(HelperSlot {
                launcher,
                state: Mutex::new(None),
            }),
            Err(e) => {
                warn!(error = %e, "stack capture disabled");
                Mode::Disabled
            }
        };

        Self {
            mode,
            requested: selection.to_string(),
        }
    }

    /// The strategy in effect after degradation
    pub fn strategy(&self) -> CaptureStrategy {
        match self.mode {
            Mode::Disabled => CaptureStrategy::Disabled,
            Mode::Native { .. } => CaptureStrategy::NativeUnwind,
            Mode::Helper(_) => CaptureStrategy::ExternalHelper,
        }
    }

    /// The selection as configured
    pub fn requested(&self) -> &str {
        &self.requested
    }

    pub fn is_enabled(&self) -> bool {
        !matches!(self.mode, Mode::Disabled)
    }

    /// Capture the current stack as frame text, innermost first
    ///
    /// Depth 0 is the caller of the tracer entry point, after `skip_frames`.
    #[inline(never)]
    pub fn frames(&self, api: &str) -> Vec<String> {
        match &self.mode {
            Mode::Disabled => Vec::new(),
            Mode::Native { skip } => {
                let mut frames = native_frames(*skip);
                if let Some(first) = frames.first_mut() {
                    *first = splice_api(first, api);
                }
                frames
            }
            Mode::Helper(slot) => slot.frames(),
        }
    }
}

impl fmt::Debug for StackCapture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StackCapture")
            .field("strategy", &self.strategy())
            .field("requested", &self.requested)
            .finish()
    }
}

/// Insert `in <api>()` after the address token of a frame line
pub fn splice_api(line: &str, api: &str) -> String {
    let address_end = line
        .find(' ')
        .and_then(|start| line[start + 1..].find(' ').map(|end| start + 1 + end))
        .unwrap_or(line.len());
    format!("{} in {}(){}", &line[..address_end], api, &line[address_end..])
}

/// Functions between the instrumented call site and the unwinder
const TRACER_FRAMES: &[&str] = &[
    "estela::session::Session::record_copy",
    "estela::session::Session::unwind",
    "estela::stack_capture::StackCapture::frames",
    "estela::stack_capture::native_frames",
];

/// Whether a demangled symbol (without hash) is one of the tracer frames
fn is_tracer_symbol(name: &str) -> bool {
    TRACER_FRAMES.contains(&name)
}

#[cfg(feature = "native-unwind")]
#[inline(never)]
fn native_frames(skip: usize) -> Vec<String> {
    let trace = backtrace::Backtrace::new();
    let frames = trace.frames();

    // Unwinder frames sit above the tracer frames, so everything up to the
    // outermost tracer frame goes.
    let first_caller = frames
        .iter()
        .rposition(|frame| {
            frame.symbols().iter().any(|symbol| {
                symbol
                    .name()
                    .is_some_and(|name| is_tracer_symbol(&format!("{:#}", name)))
            })
        })
        .map_or(0, |outermost| outermost + 1);

    frames
        .iter()
        .skip(first_caller + skip)
        .enumerate()
        .map(|(depth, frame)| format_frame(depth, frame))
        .collect()
}

#[cfg(not(feature = "native-unwind"))]
fn native_frames(_skip: usize) -> Vec<String> {
    Vec::new()
}

#[cfg(feature = "native-unwind")]
fn format_frame(depth: usize, frame: &backtrace::BacktraceFrame) -> String {
    let mut line = format!("#{} {:#018x}", depth, frame.ip() as usize);
    if let Some(symbol) = frame.symbols().first() {
        if let Some(name) = symbol.name() {
            line.push_str(&format!(" in {}", name));
        }
        if let Some(file) = symbol.filename() {
            match symbol.lineno() {
                Some(lineno) => line.push_str(&format!(" at {}:{}", file.display(), lineno)),
                None => line.push_str(&format!(" at {}", file.display())),
            }
        }
    }
    line
}
