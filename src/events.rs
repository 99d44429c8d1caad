//! Events exchanged with the client over the session transport.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::state::Mode;

/// Where a session's outgoing events are delivered.
pub type EventSink = mpsc::Sender<ServerEvent>;
pub type EventStream = mpsc::Receiver<ServerEvent>;

/// Bounded queue between a session and its connection.
///
/// PTY output waits for room in this queue, so a client that stops reading
/// throttles its program instead of growing the server's memory.
pub fn event_channel(capacity: usize) -> (EventSink, EventStream) {
    mpsc::channel(capacity.max(1))
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartRequest {
    pub code: String,
    pub language: String,
    pub compiler: String,
    #[serde(default)]
    pub optimization_level: Option<String>,
    #[serde(default)]
    pub cols: Option<u16>,
    #[serde(default)]
    pub rows: Option<u16>,
}

/// Messages sent by the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    StartCompile(StartRequest),
    StartDebug(StartRequest),
    StartLeakCheck(StartRequest),
    StartSyscallTrace(StartRequest),
    Input { data: String },
    Resize { cols: u16, rows: u16 },
    Cleanup,
    DebugCommand { text: String },
}

impl ClientEvent {
    pub fn start(mode: Mode, request: StartRequest) -> Self {
        match mode {
            Mode::Compile => ClientEvent::StartCompile(request),
            Mode::Debug => ClientEvent::StartDebug(request),
            Mode::LeakCheck => ClientEvent::StartLeakCheck(request),
            Mode::SyscallTrace => ClientEvent::StartSyscallTrace(request),
        }
    }
}

/// Messages produced for the client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerEvent {
    SessionCreated {
        id: String,
    },
    Compiling,
    CompileError {
        #[serde(rename = "diagnosticText")]
        diagnostic: String,
    },
    CompileSuccess,
    DebugStart {
        message: String,
    },
    LeakCheckRunning,
    TraceStart {
        message: String,
    },
    Output {
        data: String,
    },
    DebugResponse {
        data: String,
    },
    Exit {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        #[serde(rename = "isReportPending")]
        is_report_pending: bool,
    },
    LeakCheckReport {
        #[serde(rename = "reportText")]
        report: String,
    },
    TraceReport {
        #[serde(rename = "reportText")]
        report: String,
    },
    Error {
        message: String,
    },
}

impl ServerEvent {
    pub fn error(message: impl Into<String>) -> Self {
        ServerEvent::Error {
            message: message.into(),
        }
    }

    /// The notification sent once the run process for `mode` is up.
    pub fn started(mode: Mode) -> Self {
        match mode {
            Mode::Compile => ServerEvent::CompileSuccess,
            Mode::Debug => ServerEvent::DebugStart {
                message: "Debugger started. Type gdb commands, e.g. 'break main' then 'run'."
                    .to_string(),
            },
            Mode::LeakCheck => ServerEvent::LeakCheckRunning,
            Mode::SyscallTrace => ServerEvent::TraceStart {
                message: "Program running under strace; the report follows exit.".to_string(),
            },
        }
    }

    /// Wrap a chunk of PTY text in the channel used by `mode`.
    pub fn pty_text(mode: Mode, data: String) -> Self {
        match mode {
            Mode::Debug => ServerEvent::DebugResponse { data },
            _ => ServerEvent::Output { data },
        }
    }

    pub fn report(mode: Mode, report: String) -> Option<Self> {
        match mode {
            Mode::LeakCheck => Some(ServerEvent::LeakCheckReport { report }),
            Mode::SyscallTrace => Some(ServerEvent::TraceReport { report }),
            Mode::Compile | Mode::Debug => None,
        }
    }
}

/// Incremental UTF-8 decoding of PTY output.
///
/// A multi-byte sequence split across reads is held back until the rest
/// arrives. Invalid bytes become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::new();
        loop {
            match std::str::from_utf8(&self.pending) {
                Ok(text) => {
                    out.push_str(text);
                    self.pending.clear();
                    break;
                }
                Err(e) => {
                    let valid = e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[..valid]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            self.pending.drain(..valid + bad);
                        }
                        None => {
                            self.pending.drain(..valid);
                            break;
                        }
                    }
                }
            }
        }
        out
    }

    /// Flush whatever is still held back.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }
}
