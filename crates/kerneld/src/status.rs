//! The busy/idle bracket around request processing.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use kernel_wire::{ExecutionState, Header, MessageContent, Session};
use log::{debug, warn};

use crate::socket::KernelSocket;

/// Publishes kernel status on iopub.
///
/// Every bracket publishes its own busy and idle, both parented to the
/// request it wraps. Brackets from different channels can overlap (an
/// interrupt on control while shell executes), so a frontend sees
/// `busy(a) busy(b) idle(b) idle(a)`. Idle for one request says nothing about
/// the others; [`KernelStatus::state`] stays Busy until the last bracket
/// closes.
pub struct KernelStatus {
    depth: AtomicUsize,
    iopub: Arc<KernelSocket>,
    session: Session,
}

/// Publishes idle when dropped, so the idle status goes out on unwind too.
struct IdleOnDrop<'a> {
    status: &'a KernelStatus,
    parent: &'a Header,
}

impl Drop for IdleOnDrop<'_> {
    fn drop(&mut self) {
        self.status.depth.fetch_sub(1, Ordering::AcqRel);
        self.status.publish(ExecutionState::Idle, Some(self.parent));
    }
}

impl KernelStatus {
    pub fn new(iopub: Arc<KernelSocket>, session: Session) -> Self {
        Self {
            depth: AtomicUsize::new(0),
            iopub,
            session,
        }
    }

    pub fn state(&self) -> ExecutionState {
        if self.depth.load(Ordering::Acquire) == 0 {
            ExecutionState::Idle
        } else {
            ExecutionState::Busy
        }
    }

    /// Run `action` between a busy and an idle status whose parent is
    /// `request`.
    pub fn do_wrapped_in_busy_idle<R>(&self, request: &Header, action: impl FnOnce() -> R) -> R {
        let open = self.depth.fetch_add(1, Ordering::AcqRel);
        if open > 0 {
            debug!(
                "[status] {} {} overlaps {open} open bracket(s)",
                request.msg_type, request.msg_id
            );
        }
        self.publish(ExecutionState::Busy, Some(request));
        let _idle = IdleOnDrop {
            status: self,
            parent: request,
        };
        action()
    }

    /// The unsolicited `starting` status a kernel sends once it is reachable.
    pub fn broadcast_starting(&self) {
        self.publish(ExecutionState::Starting, None);
    }

    fn publish(&self, state: ExecutionState, parent: Option<&Header>) {
        let message = self
            .session
            .message(MessageContent::status(state), parent);
        if let Err(e) = self.iopub.send(&message) {
            warn!("[status] Failed to publish {state:?}: {e}");
        }
    }
}
