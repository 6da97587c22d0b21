//! Input requests to the frontend over the stdin channel.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use kernel_streams::InputStream;
use kernel_wire::{Envelope, Header, InputRequest, MessageContent, Session};
use log::{debug, warn};

use crate::socket::KernelSocket;

/// How often a waiting request re-checks whether the kernel shut down.
const REPLY_POLL: Duration = Duration::from_millis(100);

/// Sends `input_request`s and hands each matching `input_reply` back to the
/// thread waiting for it.
pub struct StdinBroker {
    socket: Arc<KernelSocket>,
    session: Session,
    pending: Mutex<HashMap<String, Sender<String>>>,
}

impl StdinBroker {
    pub fn new(socket: Arc<KernelSocket>, session: Session) -> Arc<Self> {
        let broker = Arc::new(Self {
            socket,
            session,
            pending: Mutex::new(HashMap::new()),
        });
        let weak = Arc::downgrade(&broker);
        broker.socket.on_message(Arc::new(move |message: &Envelope| {
            if let Some(broker) = weak.upgrade() {
                broker.handle_reply(message);
            }
        }));
        broker
    }

    fn handle_reply(&self, message: &Envelope) {
        let MessageContent::InputReply(reply) = &message.content else {
            debug!("[stdin] Ignoring {}", message.msg_type());
            return;
        };
        let waiter = message.parent_msg_id().and_then(|id| {
            self.pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(id)
        });
        match waiter {
            Some(waiter) => {
                let _ = waiter.send(reply.value.clone());
            }
            None => warn!("[stdin] input_reply matches no pending request"),
        }
    }

    /// Ask the frontend for a line of input on behalf of `parent` and block
    /// until it answers or the kernel closes.
    pub fn request_input(
        &self,
        parent: &Header,
        prompt: &str,
        password: bool,
    ) -> io::Result<String> {
        let request = self.session.message(
            MessageContent::InputRequest(InputRequest {
                prompt: prompt.to_string(),
                password,
            }),
            Some(parent),
        );
        let id = request.header.msg_id.clone();
        let (tx, rx) = bounded(1);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id.clone(), tx);

        let result = self.await_reply(&request, &rx);
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&id);
        result
    }

    fn await_reply(
        &self,
        request: &Envelope,
        replies: &crossbeam_channel::Receiver<String>,
    ) -> io::Result<String> {
        self.socket
            .send(request)
            .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, e))?;
        loop {
            match replies.recv_timeout(REPLY_POLL) {
                Ok(value) => return Ok(value),
                Err(RecvTimeoutError::Timeout) if !self.socket.is_closed() => continue,
                Err(_) => {
                    return Err(io::Error::new(
                        io::ErrorKind::UnexpectedEof,
                        "stdin channel closed while waiting for input",
                    ))
                }
            }
        }
    }
}

/// stdin for one execution: each exhausted line is refilled by an
/// `input_request` to the frontend.
pub struct BrokeredInput {
    broker: Arc<StdinBroker>,
    parent: Header,
    line: Mutex<VecDeque<u8>>,
}

impl BrokeredInput {
    pub fn new(broker: Arc<StdinBroker>, parent: Header) -> Self {
        Self {
            broker,
            parent,
            line: Mutex::new(VecDeque::new()),
        }
    }
}

impl InputStream for BrokeredInput {
    fn read_bytes(&self, buf: &mut [u8]) -> io::Result<usize> {
        let mut line = self.line.lock().unwrap_or_else(PoisonError::into_inner);
        if line.is_empty() && !buf.is_empty() {
            let value = self.broker.request_input(&self.parent, "", false)?;
            line.extend(value.bytes());
            line.push_back(b'\n');
        }
        line.read(buf)
    }

    fn describe(&self) -> String {
        format!("stdin for {}", self.parent.msg_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::socket::tests::RecordingTransport;
    use kernel_wire::{ChannelName, ExecuteRequest, InputReply};
    use std::thread;
    use std::time::Instant;

    fn setup() -> (Arc<RecordingTransport>, Arc<KernelSocket>, Arc<StdinBroker>) {
        let transport = RecordingTransport::new();
        let socket = Arc::new(KernelSocket::new(
            ChannelName::Stdin,
            transport.clone(),
            QueueConfig::default(),
        ));
        let broker = StdinBroker::new(socket.clone(), Session::new("kernel"));
        (transport, socket, broker)
    }

    fn wait_for_request(transport: &RecordingTransport) -> Envelope {
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(request) = transport.sent_messages(ChannelName::Stdin).pop() {
                return request;
            }
            assert!(Instant::now() < deadline, "no input_request sent");
            thread::sleep(Duration::from_millis(5));
        }
    }

    fn reply(
        transport: &RecordingTransport,
        socket: &KernelSocket,
        request: &Envelope,
        value: &str,
    ) {
        let reply = Session::new("client").reply(
            request,
            MessageContent::InputReply(InputReply {
                value: value.to_string(),
            }),
        );
        socket
            .receive(transport.encode(ChannelName::Stdin, &reply))
            .unwrap();
    }

    fn execute_header() -> Header {
        Session::new("client")
            .message(
                MessageContent::ExecuteRequest(ExecuteRequest::new("input()")),
                None,
            )
            .header
    }

    #[test]
    fn test_request_input_returns_reply() {
        let (transport, socket, broker) = setup();
        let parent = execute_header();

        let waiter = {
            let broker = broker.clone();
            let parent = parent.clone();
            thread::spawn(move || broker.request_input(&parent, "Name: ", false))
        };
        let request = wait_for_request(&transport);
        assert_eq!(request.parent_header.as_ref(), Some(&parent));
        match &request.content {
            MessageContent::InputRequest(r) => assert_eq!(r.prompt, "Name: "),
            other => panic!("unexpected {}", other.msg_type()),
        }

        reply(&transport, &socket, &request, "Ada");
        assert_eq!(waiter.join().unwrap().unwrap(), "Ada");
    }

    #[test]
    fn test_close_unblocks_waiter() {
        let (transport, socket, broker) = setup();
        let waiter = {
            let broker = broker.clone();
            thread::spawn(move || broker.request_input(&execute_header(), "", true))
        };
        wait_for_request(&transport);
        socket.close();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_brokered_input_reads_lines() {
        let (transport, socket, broker) = setup();
        let input = Arc::new(BrokeredInput::new(broker, execute_header()));

        let reader = {
            let input = input.clone();
            thread::spawn(move || {
                let mut buf = [0u8; 64];
                let n = input.read_bytes(&mut buf).unwrap();
                String::from_utf8(buf[..n].to_vec()).unwrap()
            })
        };
        let request = wait_for_request(&transport);
        reply(&transport, &socket, &request, "42");
        assert_eq!(reader.join().unwrap(), "42\n");
    }
}
