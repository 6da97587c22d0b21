//! Request routing between the socket manager and an execution engine.
//!
//! A [`Kernel`] registers itself on the shell and control channels. Every
//! request runs inside a busy/idle bracket; `execute_request` additionally
//! captures the engine's stdout and stderr into `stream` messages and binds
//! its stdin to the frontend.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use kernel_streams::{
    CaptureCallback, DelegatingReader, DelegatingWriter, OutputStream, SharedInput,
    StreamSubstitutionManager,
};
use kernel_wire::{
    ChannelName, CommInfoReply, CompleteReply, DecodeError, DisplayData, Envelope, ErrorOutput,
    ErrorReply, ExecuteInput, ExecuteReply, ExecuteRequest, ExecuteResult, Header, HistoryReply,
    InspectReply, InterruptReply, IsCompleteReply, IsCompleteStatus, KernelInfoReply,
    LanguageInfo, MessageContent, MimeBundle, ReplyStatus, Session, ShutdownReply, StreamName,
    PROTOCOL_VERSION,
};
use log::{debug, error, info, warn};
use serde_json::Map;

use crate::socket::KernelSocket;
use crate::socket_manager::SocketManager;
use crate::status::KernelStatus;
use crate::stdin::{BrokeredInput, StdinBroker};

/// An error raised by user code, reported to the frontend as `error`.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{ename}: {evalue}")]
pub struct ExecutionError {
    pub ename: String,
    pub evalue: String,
    pub traceback: Vec<String>,
}

impl ExecutionError {
    pub fn new(ename: impl Into<String>, evalue: impl Into<String>) -> Self {
        Self {
            ename: ename.into(),
            evalue: evalue.into(),
            traceback: Vec::new(),
        }
    }

    pub fn with_traceback(mut self, traceback: Vec<String>) -> Self {
        self.traceback = traceback;
        self
    }

    fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let evalue = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "execution panicked".to_string()
        };
        Self::new("Panic", evalue)
    }

    fn to_output(&self) -> ErrorOutput {
        ErrorOutput {
            ename: self.ename.clone(),
            evalue: self.evalue.clone(),
            traceback: self.traceback.clone(),
        }
    }

    fn to_execute_reply(&self, execution_count: u64) -> ExecuteReply {
        ExecuteReply {
            status: ReplyStatus::Error,
            execution_count,
            payload: Vec::new(),
            user_expressions: Map::new(),
            ename: Some(self.ename.clone()),
            evalue: Some(self.evalue.clone()),
            traceback: Some(self.traceback.clone()),
        }
    }
}

/// The language runtime a kernel drives.
///
/// Only `language_info` and `execute` are required; the introspection hooks
/// answer with empty results by default.
pub trait ExecutionEngine: Send + Sync {
    fn language_info(&self) -> LanguageInfo;

    fn implementation(&self) -> String {
        "kerneld".to_string()
    }

    fn implementation_version(&self) -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn banner(&self) -> String {
        String::new()
    }

    /// Run `code`. Output written to the context's streams is published as it
    /// is captured; the returned bundle becomes the `execute_result`.
    fn execute(
        &self,
        code: &str,
        ctx: &ExecutionContext<'_>,
    ) -> Result<Option<MimeBundle>, ExecutionError>;

    fn complete(&self, _code: &str, cursor_pos: usize) -> CompleteReply {
        CompleteReply {
            status: ReplyStatus::Ok,
            matches: Vec::new(),
            cursor_start: cursor_pos,
            cursor_end: cursor_pos,
            metadata: Map::new(),
        }
    }

    fn inspect(&self, _code: &str, _cursor_pos: usize, _detail_level: u8) -> Option<MimeBundle> {
        None
    }

    fn is_complete(&self, _code: &str) -> IsCompleteReply {
        IsCompleteReply {
            status: IsCompleteStatus::Unknown,
            indent: String::new(),
        }
    }

    /// Called from the control channel while an execution may be running.
    fn interrupt(&self) {}
}

/// What an engine sees of the request it is executing.
pub struct ExecutionContext<'a> {
    kernel: &'a Kernel,
    request: &'a Envelope,
    execution_count: u64,
    allow_stdin: bool,
}

impl ExecutionContext<'_> {
    pub fn execution_count(&self) -> u64 {
        self.execution_count
    }

    pub fn request(&self) -> &Envelope {
        self.request
    }

    pub fn stdout(&self) -> DelegatingWriter {
        self.kernel.streams.stdout()
    }

    pub fn stderr(&self) -> DelegatingWriter {
        self.kernel.streams.stderr()
    }

    pub fn stdin(&self) -> DelegatingReader {
        self.kernel.streams.stdin()
    }

    /// Publish `data` as `display_data`, after any output written so far.
    pub fn display(&self, data: MimeBundle) {
        for stream in [self.stdout(), self.stderr()] {
            if let Err(e) = OutputStream::flush(&stream) {
                debug!("[kernel] Flush before display failed: {e}");
            }
        }
        self.kernel.publish(
            MessageContent::DisplayData(DisplayData {
                data,
                ..DisplayData::default()
            }),
            &self.request.header,
        );
    }

    /// Prompt the frontend for a line of input.
    pub fn input(&self, prompt: &str, password: bool) -> io::Result<String> {
        if !self.allow_stdin {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "the frontend does not accept input requests",
            ));
        }
        self.kernel
            .stdin
            .request_input(&self.request.header, prompt, password)
    }
}

pub struct Kernel {
    manager: Arc<SocketManager>,
    engine: Arc<dyn ExecutionEngine>,
    streams: StreamSubstitutionManager,
    session: Session,
    status: KernelStatus,
    stdin: Arc<StdinBroker>,
    execution_count: AtomicU64,
}

impl Kernel {
    /// Build a kernel and register it on `manager`'s channels.
    pub fn new(
        manager: Arc<SocketManager>,
        engine: Arc<dyn ExecutionEngine>,
        streams: StreamSubstitutionManager,
    ) -> Arc<Self> {
        let session = Session::new("kernel");
        let kernel = Arc::new(Self {
            status: KernelStatus::new(manager.iopub().clone(), session.clone()),
            stdin: StdinBroker::new(manager.stdin().clone(), session.clone()),
            manager,
            engine,
            streams,
            session,
            execution_count: AtomicU64::new(0),
        });

        for channel in [ChannelName::Shell, ChannelName::Control] {
            let weak = Arc::downgrade(&kernel);
            kernel
                .manager
                .socket(channel)
                .on_message(Arc::new(move |request: &Envelope| {
                    if let Some(kernel) = weak.upgrade() {
                        kernel.handle(channel, request);
                    }
                }));
        }

        let weak: Weak<Self> = Arc::downgrade(&kernel);
        kernel
            .manager
            .on_decode_error(Arc::new(move |channel: ChannelName, e: &DecodeError| {
                if let Some(kernel) = weak.upgrade() {
                    kernel.report_decode_error(channel, e);
                }
            }));

        kernel
    }

    pub fn manager(&self) -> &Arc<SocketManager> {
        &self.manager
    }

    pub fn status(&self) -> &KernelStatus {
        &self.status
    }

    pub fn execution_count(&self) -> u64 {
        self.execution_count.load(Ordering::Acquire)
    }

    pub fn broadcast_starting(&self) {
        self.status.broadcast_starting();
    }

    fn handle(&self, channel: ChannelName, request: &Envelope) {
        debug!(
            "[kernel] {} {} on {channel}",
            request.msg_type(),
            request.header.msg_id
        );
        self.status.do_wrapped_in_busy_idle(&request.header, || {
            if let Some(content) = self.reply_content(channel, request) {
                self.send(self.manager.socket(channel), content, &request.header);
            }
        });

        if let MessageContent::ShutdownRequest(shutdown) = &request.content {
            info!(
                "[kernel] Shutdown requested (restart: {})",
                shutdown.restart
            );
            self.manager.close();
        }
    }

    fn reply_content(&self, channel: ChannelName, request: &Envelope) -> Option<MessageContent> {
        let reply = match &request.content {
            MessageContent::KernelInfoRequest(_) => {
                MessageContent::KernelInfoReply(self.kernel_info())
            }
            MessageContent::ExecuteRequest(execute) if channel == ChannelName::Shell => {
                MessageContent::ExecuteReply(self.execute(request, execute))
            }
            MessageContent::CompleteRequest(r) => {
                MessageContent::CompleteReply(self.engine.complete(&r.code, r.cursor_pos))
            }
            MessageContent::InspectRequest(r) => {
                let data = self.engine.inspect(&r.code, r.cursor_pos, r.detail_level);
                MessageContent::InspectReply(InspectReply {
                    status: ReplyStatus::Ok,
                    found: data.is_some(),
                    data: data.unwrap_or_default(),
                    metadata: Map::new(),
                })
            }
            MessageContent::IsCompleteRequest(r) => {
                MessageContent::IsCompleteReply(self.engine.is_complete(&r.code))
            }
            MessageContent::HistoryRequest(_) => MessageContent::HistoryReply(HistoryReply {
                status: ReplyStatus::Ok,
                history: Vec::new(),
            }),
            MessageContent::CommInfoRequest(_) => MessageContent::CommInfoReply(CommInfoReply {
                status: ReplyStatus::Ok,
                comms: Map::new(),
            }),
            MessageContent::InterruptRequest(_) if channel == ChannelName::Control => {
                self.engine.interrupt();
                MessageContent::InterruptReply(InterruptReply {
                    status: ReplyStatus::Ok,
                })
            }
            MessageContent::ShutdownRequest(r) => MessageContent::ShutdownReply(ShutdownReply {
                status: ReplyStatus::Ok,
                restart: r.restart,
            }),
            MessageContent::CommOpen(_)
            | MessageContent::CommMsg(_)
            | MessageContent::CommClose(_) => {
                debug!("[kernel] No comm targets, ignoring {}", request.msg_type());
                return None;
            }
            _ => {
                warn!(
                    "[kernel] Unexpected {} on {channel}",
                    request.msg_type()
                );
                return None;
            }
        };
        Some(reply)
    }

    fn kernel_info(&self) -> KernelInfoReply {
        KernelInfoReply {
            status: ReplyStatus::Ok,
            protocol_version: PROTOCOL_VERSION.to_string(),
            implementation: self.engine.implementation(),
            implementation_version: self.engine.implementation_version(),
            language_info: self.engine.language_info(),
            banner: self.engine.banner(),
            help_links: Vec::new(),
            debugger: false,
        }
    }

    fn execute(&self, request: &Envelope, execute: &ExecuteRequest) -> ExecuteReply {
        let execution_count = if execute.silent || !execute.store_history {
            self.execution_count()
        } else {
            self.execution_count.fetch_add(1, Ordering::AcqRel) + 1
        };

        if !execute.silent {
            self.publish(
                MessageContent::ExecuteInput(ExecuteInput {
                    code: execute.code.clone(),
                    execution_count,
                }),
                &request.header,
            );
        }

        let ctx = ExecutionContext {
            kernel: self,
            request,
            execution_count,
            allow_stdin: execute.allow_stdin,
        };
        let run = || {
            panic::catch_unwind(AssertUnwindSafe(|| self.engine.execute(&execute.code, &ctx)))
        };

        let config = self.streams.output_config().clone();
        let captured = self.streams.capture_output(
            &config,
            self.stream_publisher(StreamName::Stdout, &request.header),
            self.stream_publisher(StreamName::Stderr, &request.header),
            || {
                if execute.allow_stdin {
                    let input: SharedInput = Arc::new(BrokeredInput::new(
                        self.stdin.clone(),
                        request.header.clone(),
                    ));
                    self.streams.with_input(input, run)
                } else {
                    Ok(run())
                }
            },
        );

        let outcome = match captured.and_then(|inner| inner) {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(payload)) => {
                let e = ExecutionError::from_panic(payload);
                error!("[kernel] Execution {} panicked: {}", request.header.msg_id, e.evalue);
                Err(e)
            }
            Err(e) => Err(ExecutionError::new("SubstitutionError", e.to_string())),
        };

        match outcome {
            Ok(data) => {
                if let Some(data) = data.filter(|_| !execute.silent) {
                    self.publish(
                        MessageContent::ExecuteResult(ExecuteResult {
                            execution_count,
                            data,
                            metadata: Map::new(),
                        }),
                        &request.header,
                    );
                }
                ExecuteReply {
                    status: ReplyStatus::Ok,
                    execution_count,
                    payload: Vec::new(),
                    user_expressions: Map::new(),
                    ename: None,
                    evalue: None,
                    traceback: None,
                }
            }
            Err(e) => {
                self.publish(MessageContent::Error(e.to_output()), &request.header);
                e.to_execute_reply(execution_count)
            }
        }
    }

    /// Publishes captured text as `stream` messages for one request.
    fn stream_publisher(&self, name: StreamName, parent: &Header) -> CaptureCallback {
        let iopub = self.manager.iopub().clone();
        let session = self.session.clone();
        let parent = parent.clone();
        Arc::new(move |text: &str| {
            let message = session.message(MessageContent::stream(name, text), Some(&parent));
            if let Err(e) = iopub.send(&message) {
                debug!("[kernel] Dropped {name:?} output: {e}");
            }
        })
    }

    /// Answer a request that kept a readable header but could not be decoded.
    ///
    /// Shell and control requests get the usual busy/idle bracket around an
    /// iopub `error` and an error reply on their own channel. On other
    /// channels only the iopub `error` goes out.
    fn report_decode_error(&self, channel: ChannelName, e: &DecodeError) {
        let Some(header) = e.salvaged_header() else {
            return;
        };
        let ename = match e {
            DecodeError::UnknownMessageType { .. } => "UnknownMessageType",
            _ => "InvalidContent",
        };
        let error = ExecutionError::new(ename, e.to_string())
            .with_traceback(vec![format!("{channel}: {}", header.msg_type)]);

        if !matches!(channel, ChannelName::Shell | ChannelName::Control) {
            self.publish(MessageContent::Error(error.to_output()), header);
            return;
        }
        self.status.do_wrapped_in_busy_idle(header, || {
            self.publish(MessageContent::Error(error.to_output()), header);
            let reply = self.error_reply(header, &error);
            self.send(self.manager.socket(channel), reply, header);
        });
    }

    /// The reply to `request` reporting `error`: an `execute_reply` keeps its
    /// execution count, any other `*_request` gets its `*_reply` tag, and
    /// anything else gets a plain `error`.
    fn error_reply(&self, request: &Header, error: &ExecutionError) -> MessageContent {
        if request.msg_type == "execute_request" {
            return MessageContent::ExecuteReply(error.to_execute_reply(self.execution_count()));
        }
        match ErrorReply::reply_type_for(&request.msg_type) {
            Some(reply_type) => MessageContent::ErrorReply(ErrorReply {
                traceback: error.traceback.clone(),
                ..ErrorReply::new(reply_type, &error.ename, &error.evalue)
            }),
            None => MessageContent::Error(error.to_output()),
        }
    }

    fn publish(&self, content: MessageContent, parent: &Header) {
        self.send(self.manager.iopub(), content, parent);
    }

    fn send(&self, socket: &KernelSocket, content: MessageContent, parent: &Header) {
        let message = self.session.message(content, Some(parent));
        if let Err(e) = socket.send(&message) {
            warn!(
                "[kernel] Failed to send {} on {}: {e}",
                message.msg_type(),
                socket.name()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::socket::tests::RecordingTransport;
    use kernel_streams::{BufferOutput, CaptureConfig, NoInput, OutputConfig, SubstitutionMode};
    use kernel_wire::{ExecutionState, KernelInfoRequest, ShutdownRequest};
    use serde_json::json;
    use std::io::Write;
    use std::thread::{self, JoinHandle};
    use std::time::{Duration, Instant};

    /// Prints its code, fails on "fail", panics on "panic", and asks for input
    /// on "input".
    struct ScriptEngine;

    impl ExecutionEngine for ScriptEngine {
        fn language_info(&self) -> LanguageInfo {
            LanguageInfo {
                name: "script".into(),
                version: "1.0".into(),
                mimetype: "text/plain".into(),
                file_extension: ".txt".into(),
                pygments_lexer: None,
                codemirror_mode: None,
            }
        }

        fn execute(
            &self,
            code: &str,
            ctx: &ExecutionContext<'_>,
        ) -> Result<Option<MimeBundle>, ExecutionError> {
            match code {
                "fail" => {
                    writeln!(ctx.stderr(), "about to fail").unwrap();
                    Err(ExecutionError::new("ValueError", "bad value"))
                }
                "panic" => panic!("engine bug"),
                "input" => {
                    let name = ctx.input("name? ", false).unwrap();
                    writeln!(ctx.stdout(), "hi {name}").unwrap();
                    Ok(None)
                }
                "display" => {
                    write!(ctx.stdout(), "before").unwrap();
                    let mut data = MimeBundle::new();
                    data.insert("text/plain".into(), json!("shown"));
                    ctx.display(data);
                    Ok(None)
                }
                _ => {
                    writeln!(ctx.stdout(), "{code}").unwrap();
                    let mut data = MimeBundle::new();
                    data.insert("text/plain".into(), json!(ctx.execution_count()));
                    Ok(Some(data))
                }
            }
        }
    }

    struct Harness {
        transport: Arc<RecordingTransport>,
        manager: Arc<SocketManager>,
        kernel: Arc<Kernel>,
        real_stdout: Arc<BufferOutput>,
        listener: Option<JoinHandle<()>>,
        client: Session,
    }

    impl Harness {
        fn new() -> Self {
            let transport = RecordingTransport::new();
            let manager = SocketManager::new(transport.clone(), QueueConfig::default());
            let real_stdout = Arc::new(BufferOutput::new("real stdout"));
            let streams = StreamSubstitutionManager::with_defaults(
                SubstitutionMode::NonBlocking,
                OutputConfig::new(CaptureConfig {
                    buffer_time_limit: Duration::from_secs(3600),
                    ..CaptureConfig::default()
                }),
                real_stdout.clone(),
                Arc::new(BufferOutput::new("real stderr")),
                Arc::new(NoInput),
            );
            let kernel = Kernel::new(manager.clone(), Arc::new(ScriptEngine), streams);
            let listener = {
                let manager = manager.clone();
                Some(thread::spawn(move || manager.listen().unwrap()))
            };
            Self {
                transport,
                manager,
                kernel,
                real_stdout,
                listener,
                client: Session::new("client"),
            }
        }

        fn request(&self, channel: ChannelName, content: MessageContent) -> Envelope {
            let request = self.client.message(content, None);
            self.transport.inject(channel, &request);
            request
        }

        fn execute(&self, code: &str) -> Envelope {
            self.request(
                ChannelName::Shell,
                MessageContent::ExecuteRequest(ExecuteRequest::new(code)),
            )
        }

        /// Every iopub message for `request`, once its idle status is out.
        fn iopub_for(&self, request: &Envelope) -> Vec<Envelope> {
            let deadline = Instant::now() + Duration::from_secs(5);
            loop {
                let messages: Vec<Envelope> = self
                    .transport
                    .sent_messages(ChannelName::Iopub)
                    .into_iter()
                    .filter(|m| m.parent_msg_id() == Some(request.header.msg_id.as_str()))
                    .collect();
                let idle = messages.iter().any(|m| {
                    matches!(
                        &m.content,
                        MessageContent::Status(s) if s.execution_state == ExecutionState::Idle
                    )
                });
                if idle {
                    return messages;
                }
                assert!(Instant::now() < deadline, "no idle for {}", request.msg_type());
                thread::sleep(Duration::from_millis(5));
            }
        }

        /// Send `content` with its `content` field replaced, and optionally
        /// its `msg_type`, so that it fails to decode on the kernel side.
        fn request_with_bad_content(
            &self,
            channel: ChannelName,
            content: MessageContent,
            msg_type: Option<&str>,
            raw: serde_json::Value,
        ) -> Envelope {
            let mut request = self.client.message(content, None);
            let frame = self.transport.encode(channel, &request);
            if let Some(msg_type) = msg_type {
                request.header.msg_type = msg_type.into();
            }
            let mut value: serde_json::Value = serde_json::from_slice(&frame[1..]).unwrap();
            value["content"] = raw;
            value["header"]["msg_type"] = json!(request.header.msg_type);
            let mut bytes = vec![0u8];
            bytes.extend(serde_json::to_vec(&value).unwrap());
            self.transport.inject_frame(channel, bytes::Bytes::from(bytes));
            request
        }

        fn reply_to(&self, channel: ChannelName, request: &Envelope) -> Envelope {
            self.iopub_for(request);
            self.transport
                .sent_messages(channel)
                .into_iter()
                .find(|m| m.parent_msg_id() == Some(request.header.msg_id.as_str()))
                .unwrap()
        }
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.manager.close();
            if let Some(listener) = self.listener.take() {
                let _ = listener.join();
            }
        }
    }

    fn types(messages: &[Envelope]) -> Vec<&str> {
        messages.iter().map(|m| m.msg_type()).collect()
    }

    #[test]
    fn test_execute_publishes_in_order() {
        let harness = Harness::new();
        let request = harness.execute("hello");

        let iopub = harness.iopub_for(&request);
        assert_eq!(
            types(&iopub),
            vec!["status", "execute_input", "stream", "execute_result", "status"]
        );
        match &iopub[2].content {
            MessageContent::Stream(s) => {
                assert_eq!(s.name, StreamName::Stdout);
                assert_eq!(s.text, "hello\n");
            }
            other => panic!("unexpected {}", other.msg_type()),
        }
        assert_eq!(harness.real_stdout.text(), "hello\n");

        let reply = harness.reply_to(ChannelName::Shell, &request);
        match reply.content {
            MessageContent::ExecuteReply(r) => {
                assert_eq!(r.status, ReplyStatus::Ok);
                assert_eq!(r.execution_count, 1);
            }
            other => panic!("unexpected {}", other.msg_type()),
        }
    }

    #[test]
    fn test_silent_execution_does_not_count() {
        let harness = Harness::new();
        let mut silent = ExecuteRequest::new("quiet");
        silent.silent = true;
        let request = harness.request(ChannelName::Shell, MessageContent::ExecuteRequest(silent));

        let iopub = harness.iopub_for(&request);
        assert_eq!(types(&iopub), vec!["status", "stream", "status"]);
        assert_eq!(harness.kernel.execution_count(), 0);
    }

    #[test]
    fn test_errors_and_panics_become_error_replies() {
        let harness = Harness::new();
        for (code, ename) in [("fail", "ValueError"), ("panic", "Panic")] {
            let request = harness.execute(code);
            let iopub = harness.iopub_for(&request);
            let error = iopub
                .iter()
                .find_map(|m| match &m.content {
                    MessageContent::Error(e) => Some(e.clone()),
                    _ => None,
                })
                .unwrap();
            assert_eq!(error.ename, ename);

            match harness.reply_to(ChannelName::Shell, &request).content {
                MessageContent::ExecuteReply(r) => {
                    assert_eq!(r.status, ReplyStatus::Error);
                    assert_eq!(r.ename.as_deref(), Some(ename));
                }
                other => panic!("unexpected {}", other.msg_type()),
            }
        }

        // The kernel keeps serving after a panicking execution.
        let request = harness.execute("still alive");
        assert_eq!(harness.iopub_for(&request).len(), 5);
    }

    #[test]
    fn test_display_follows_earlier_output() {
        let harness = Harness::new();
        let request = harness.execute("display");
        let iopub = harness.iopub_for(&request);
        assert_eq!(
            types(&iopub),
            vec!["status", "execute_input", "stream", "display_data", "status"]
        );
    }

    #[test]
    fn test_input_round_trip() {
        let harness = Harness::new();
        let request = harness.execute("input");

        let deadline = Instant::now() + Duration::from_secs(5);
        let input_request = loop {
            if let Some(r) = harness.transport.sent_messages(ChannelName::Stdin).pop() {
                break r;
            }
            assert!(Instant::now() < deadline);
            thread::sleep(Duration::from_millis(5));
        };
        assert_eq!(input_request.parent_header.as_ref(), Some(&request.header));

        let reply = harness.client.reply(
            &input_request,
            MessageContent::InputReply(kernel_wire::InputReply {
                value: "Ada".into(),
            }),
        );
        harness.transport.inject(ChannelName::Stdin, &reply);

        let iopub = harness.iopub_for(&request);
        let text: String = iopub
            .iter()
            .filter_map(|m| match &m.content {
                MessageContent::Stream(s) => Some(s.text.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hi Ada\n");
    }

    #[test]
    fn test_kernel_info_on_control() {
        let harness = Harness::new();
        let request = harness.request(
            ChannelName::Control,
            MessageContent::KernelInfoRequest(KernelInfoRequest {}),
        );
        match harness.reply_to(ChannelName::Control, &request).content {
            MessageContent::KernelInfoReply(info) => {
                assert_eq!(info.protocol_version, PROTOCOL_VERSION);
                assert_eq!(info.language_info.name, "script");
                assert_eq!(info.implementation, "kerneld");
            }
            other => panic!("unexpected {}", other.msg_type()),
        }
    }

    #[test]
    fn test_shutdown_closes_manager() {
        let mut harness = Harness::new();
        let request = harness.request(
            ChannelName::Control,
            MessageContent::ShutdownRequest(ShutdownRequest { restart: false }),
        );
        if let Some(listener) = harness.listener.take() {
            listener.join().unwrap();
        }
        assert!(harness.manager.is_closed());

        let replies = harness.transport.sent_messages(ChannelName::Control);
        assert_eq!(replies.len(), 1);
        assert_eq!(replies[0].parent_msg_id(), Some(request.header.msg_id.as_str()));
        assert_eq!(replies[0].msg_type(), "shutdown_reply");
    }

    #[test]
    fn test_undecodable_requests_get_error_replies() {
        let harness = Harness::new();

        let execute = harness.request_with_bad_content(
            ChannelName::Shell,
            MessageContent::ExecuteRequest(ExecuteRequest::new("x")),
            None,
            json!({"code": 5}),
        );
        assert_eq!(types(&harness.iopub_for(&execute)), vec!["status", "error", "status"]);
        match harness.reply_to(ChannelName::Shell, &execute).content {
            MessageContent::ExecuteReply(r) => {
                assert_eq!(r.status, ReplyStatus::Error);
                assert_eq!(r.ename.as_deref(), Some("InvalidContent"));
            }
            other => panic!("unexpected {}", other.msg_type()),
        }

        let unknown = harness.request_with_bad_content(
            ChannelName::Control,
            MessageContent::KernelInfoRequest(KernelInfoRequest {}),
            Some("debug_request"),
            json!({}),
        );
        let reply = harness.reply_to(ChannelName::Control, &unknown);
        assert_eq!(reply.msg_type(), "debug_reply");
        match reply.content {
            MessageContent::ErrorReply(r) => {
                assert_eq!(r.status, ReplyStatus::Error);
                assert_eq!(r.ename, "UnknownMessageType");
                assert_eq!(r.traceback, vec!["control: debug_request".to_string()]);
            }
            other => panic!("unexpected {}", other.msg_type()),
        }

        // The shell keeps working.
        let after = harness.execute("after");
        match harness.reply_to(ChannelName::Shell, &after).content {
            MessageContent::ExecuteReply(r) => assert_eq!(r.status, ReplyStatus::Ok),
            other => panic!("unexpected {}", other.msg_type()),
        }
    }
}
