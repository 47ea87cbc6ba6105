//! Circular-buffer message pipes.
//!
//! A [`Pipe`] is a fixed-capacity byte region carrying either fixed-size or
//! variable-size messages.  It is both the general IPC primitive of the
//! kernel and the transport underneath event notification.
//!
//! Variable-size messages are stored with a leading machine-word length
//! prefix plus trailing alignment padding, so every message starts
//! word-aligned; prefix, body, and padding all wrap independently across the
//! buffer edge.  The capacity is truncated at creation to a multiple of the
//! message size (fixed mode) or of the machine word (variable mode), so a
//! partial trailing message can never be placed.
//!
//! # Suspension
//!
//! Callers that cannot proceed may suspend.  Each suspended caller is a
//! descriptor in one of three lists: ordinary senders, urgent senders
//! ([`Pipe::send_to_front`]), or receivers.  FIFO pipes keep arrival order;
//! priority pipes insert after all equal-or-higher-priority entries (lower
//! numeric value is more urgent), so equals stay in arrival order.  The
//! urgent list is always served before ordinary senders *and* before queued
//! messages.  A timed-out or reset waiter is unlinked from whichever list
//! holds it and reported with a distinct error, leaving the pipe state
//! exactly as if it had never suspended.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;
use tokio::time::timeout_at;

use crate::error::{KernelError, Result};
use crate::signal::Wait;

/// Machine word size; the unit of variable-message framing and alignment.
const WORD: usize = std::mem::size_of::<usize>();

/// Round `n` up to the next multiple of [`WORD`].
fn aligned(n: usize) -> usize {
    n.div_ceil(WORD) * WORD
}

/// Message-size policy fixed at pipe creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagePolicy {
    /// Every message is exactly this many bytes.
    Fixed(usize),
    /// Messages are 1..=`max` bytes, framed with a length word.
    Variable { max: usize },
}

/// Ordering discipline for suspended callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SuspendOrder {
    /// Arrival order.
    Fifo,
    /// Caller-priority order; stable among equal priorities.
    Priority,
}

/// Point-in-time snapshot of a pipe's counters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipeInfo {
    pub name: String,
    pub capacity: usize,
    pub available: usize,
    pub messages: usize,
    pub waiting_tasks: usize,
}

// ---------------------------------------------------------------------------
// Waiter descriptors
// ---------------------------------------------------------------------------

struct SenderWaiter {
    token: u64,
    priority: u8,
    msg: Vec<u8>,
    tx: oneshot::Sender<Result<()>>,
}

struct ReceiverWaiter {
    token: u64,
    priority: u8,
    tx: oneshot::Sender<Result<Vec<u8>>>,
}

fn insert_sender(list: &mut Vec<SenderWaiter>, waiter: SenderWaiter, order: SuspendOrder) {
    match order {
        SuspendOrder::Fifo => list.push(waiter),
        SuspendOrder::Priority => {
            let pos = list
                .iter()
                .position(|w| w.priority > waiter.priority)
                .unwrap_or(list.len());
            list.insert(pos, waiter);
        }
    }
}

fn insert_receiver(list: &mut Vec<ReceiverWaiter>, waiter: ReceiverWaiter, order: SuspendOrder) {
    match order {
        SuspendOrder::Fifo => list.push(waiter),
        SuspendOrder::Priority => {
            let pos = list
                .iter()
                .position(|w| w.priority > waiter.priority)
                .unwrap_or(list.len());
            list.insert(pos, waiter);
        }
    }
}

// ---------------------------------------------------------------------------
// Pipe state
// ---------------------------------------------------------------------------

struct PipeState {
    /// The circular byte region; `buf.len()` is the (truncated) capacity.
    buf: Vec<u8>,
    read: usize,
    write: usize,
    available: usize,
    messages: usize,
    fixed: bool,
    msg_size: usize,
    senders: Vec<SenderWaiter>,
    urgent: Vec<SenderWaiter>,
    receivers: Vec<ReceiverWaiter>,
    waiting_tasks: usize,
    deleted: bool,
    next_token: u64,
}

impl PipeState {
    fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Per-message framing overhead for a message of `size` bytes.
    fn overhead(&self, size: usize) -> usize {
        if self.fixed {
            0
        } else {
            WORD + aligned(size) - size
        }
    }

    fn token(&mut self) -> u64 {
        self.next_token += 1;
        self.next_token
    }

    /// Copy a message in at the write cursor, handling the length word,
    /// wraparound on every component, and alignment padding.
    fn push_message(&mut self, msg: &[u8]) {
        let size = msg.len();
        let cap = self.capacity();
        let mut w = self.write;

        if self.fixed {
            // Capacity is a multiple of the message size, so the copy never
            // straddles the edge.
            self.buf[w..w + size].copy_from_slice(msg);
            w += size;
            if w >= cap {
                w = 0;
            }
        } else {
            self.buf[w..w + WORD].copy_from_slice(&size.to_ne_bytes());
            w += WORD;
            if w >= cap {
                w = 0;
            }
            self.available -= WORD;

            let tail = cap - w;
            if tail >= size {
                self.buf[w..w + size].copy_from_slice(msg);
                w += size;
            } else {
                self.buf[w..].copy_from_slice(&msg[..tail]);
                self.buf[..size - tail].copy_from_slice(&msg[tail..]);
                w = size - tail;
            }
            if w >= cap {
                w = 0;
            }

            let pad = aligned(size) - size;
            if pad > 0 {
                let tail = cap - w;
                if tail <= pad {
                    w = pad - tail;
                } else {
                    w += pad;
                }
                self.available -= pad;
            }
        }

        self.write = w;
        self.available -= size;
        self.messages += 1;
    }

    /// Copy the oldest message out at the read cursor; exact mirror of
    /// [`PipeState::push_message`].
    fn pop_message(&mut self) -> Vec<u8> {
        let cap = self.capacity();
        let mut r = self.read;

        let msg = if self.fixed {
            let size = self.msg_size;
            let msg = self.buf[r..r + size].to_vec();
            r += size;
            if r >= cap {
                r = 0;
            }
            self.available += size;
            msg
        } else {
            let mut word = [0u8; WORD];
            word.copy_from_slice(&self.buf[r..r + WORD]);
            let size = usize::from_ne_bytes(word);
            r += WORD;
            if r >= cap {
                r = 0;
            }
            self.available += WORD;

            let mut msg = vec![0u8; size];
            let tail = cap - r;
            if tail >= size {
                msg.copy_from_slice(&self.buf[r..r + size]);
                r += size;
            } else {
                msg[..tail].copy_from_slice(&self.buf[r..]);
                msg[tail..].copy_from_slice(&self.buf[..size - tail]);
                r = size - tail;
            }
            if r >= cap {
                r = 0;
            }

            let pad = aligned(size) - size;
            if pad > 0 {
                let tail = cap - r;
                if tail <= pad {
                    r = pad - tail;
                } else {
                    r += pad;
                }
                self.available += pad;
            }
            self.available += size;
            msg
        };

        self.read = r;
        self.messages -= 1;
        msg
    }

    /// Lay a message down *before* the current read cursor so it is received
    /// ahead of everything already queued.  The cursor steps backward by the
    /// whole framed block (prefix + body + padding), which keeps alignment
    /// because both the block and the capacity are multiples of the unit.
    fn push_front_message(&mut self, msg: &[u8]) {
        let size = msg.len();
        let cap = self.capacity();
        let need = if self.fixed {
            size
        } else {
            WORD + aligned(size)
        };

        let start = if self.read >= need {
            self.read - need
        } else {
            cap - (need - self.read)
        };
        self.read = start;

        let mut w = start;
        if self.fixed {
            self.buf[w..w + size].copy_from_slice(msg);
        } else {
            self.buf[w..w + WORD].copy_from_slice(&size.to_ne_bytes());
            w += WORD;
            if w >= cap {
                w = 0;
            }
            let tail = cap - w;
            if tail >= size {
                self.buf[w..w + size].copy_from_slice(msg);
            } else {
                self.buf[w..].copy_from_slice(&msg[..tail]);
                self.buf[..size - tail].copy_from_slice(&msg[tail..]);
            }
        }

        self.available -= need;
        self.messages += 1;
    }

    /// Move as many suspended ordinary senders as now fit into the buffer,
    /// in list order, waking each.  Stops at the first that does not fit.
    fn release_senders(&mut self) {
        loop {
            let need = match self.senders.first() {
                Some(head) => head.msg.len() + self.overhead(head.msg.len()),
                None => break,
            };
            if need > self.available {
                break;
            }
            let waiter = self.senders.remove(0);
            self.push_message(&waiter.msg);
            self.waiting_tasks -= 1;
            let _ = waiter.tx.send(Ok(()));
        }
    }

    /// Unlink a suspended caller from whichever list holds it.  Used by the
    /// timeout/cancellation path.
    fn unlink(&mut self, token: u64) -> bool {
        if let Some(i) = self.senders.iter().position(|w| w.token == token) {
            self.senders.remove(i);
        } else if let Some(i) = self.urgent.iter().position(|w| w.token == token) {
            self.urgent.remove(i);
        } else if let Some(i) = self.receivers.iter().position(|w| w.token == token) {
            self.receivers.remove(i);
        } else {
            return false;
        }
        self.waiting_tasks -= 1;
        true
    }

    /// Wake every suspended caller with `err`.
    fn flush_waiters(&mut self, err: KernelError) {
        for w in self.urgent.drain(..) {
            let _ = w.tx.send(Err(err.clone()));
        }
        for w in self.senders.drain(..) {
            let _ = w.tx.send(Err(err.clone()));
        }
        for w in self.receivers.drain(..) {
            let _ = w.tx.send(Err(err.clone()));
        }
        self.waiting_tasks = 0;
    }
}

// ---------------------------------------------------------------------------
// Pipe
// ---------------------------------------------------------------------------

struct PipeInner {
    name: String,
    order: SuspendOrder,
    state: Mutex<PipeState>,
}

/// A circular-buffer message queue.
///
/// Cheaply cloneable (`Arc`-backed) and `Send + Sync`; clones refer to the
/// same underlying pipe.
#[derive(Clone)]
pub struct Pipe {
    inner: Arc<PipeInner>,
}

impl Pipe {
    /// Create a pipe with `capacity` bytes of buffer.
    ///
    /// The capacity is truncated down to a multiple of the fixed message
    /// size, or of the machine word for variable pipes; at least one maximum
    /// size message (plus framing) must fit.
    pub fn new(
        name: impl Into<String>,
        capacity: usize,
        policy: MessagePolicy,
        order: SuspendOrder,
    ) -> Result<Pipe> {
        let name = name.into();
        let (fixed, msg_size) = match policy {
            MessagePolicy::Fixed(n) => (true, n),
            MessagePolicy::Variable { max } => (false, max),
        };

        if capacity == 0 || msg_size == 0 {
            return Err(KernelError::invalid("pipe and message sizes must be nonzero"));
        }
        let overhead = if fixed { 0 } else { WORD + aligned(msg_size) - msg_size };
        if msg_size + overhead > capacity {
            return Err(KernelError::invalid(
                "pipe capacity cannot hold one maximum-size message",
            ));
        }

        let capacity = if fixed {
            (capacity / msg_size) * msg_size
        } else {
            (capacity / WORD) * WORD
        };

        tracing::debug!(pipe = %name, capacity, msg_size, fixed, ?order, "pipe created");

        Ok(Pipe {
            inner: Arc::new(PipeInner {
                name,
                order,
                state: Mutex::new(PipeState {
                    buf: vec![0; capacity],
                    read: 0,
                    write: 0,
                    available: capacity,
                    messages: 0,
                    fixed,
                    msg_size,
                    senders: Vec::new(),
                    urgent: Vec::new(),
                    receivers: Vec::new(),
                    waiting_tasks: 0,
                    deleted: false,
                    next_token: 0,
                }),
            }),
        })
    }

    fn state(&self) -> MutexGuard<'_, PipeState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn check_message(&self, msg: &[u8]) -> Result<()> {
        let st = self.state();
        if msg.is_empty() {
            return Err(KernelError::invalid("message must not be empty"));
        }
        if st.fixed && msg.len() != st.msg_size {
            return Err(KernelError::invalid(format!(
                "fixed-size pipe requires exactly {} bytes",
                st.msg_size
            )));
        }
        if !st.fixed && msg.len() > st.msg_size {
            return Err(KernelError::invalid(format!(
                "message exceeds maximum of {} bytes",
                st.msg_size
            )));
        }
        Ok(())
    }

    /// Send a message.
    ///
    /// If a receiver is waiting on an empty pipe the message is handed
    /// straight to it without touching the buffer.  Without room, the caller
    /// suspends according to `wait` (priority is used only by
    /// priority-ordered pipes; lower is more urgent) or fails with
    /// [`KernelError::PipeFull`].
    pub async fn send(&self, msg: &[u8], wait: Wait, priority: u8) -> Result<()> {
        self.check_message(msg)?;
        let (rx, token) = {
            let mut st = self.state();
            if st.deleted {
                return Err(KernelError::PipeDeleted);
            }

            let mut need = msg.len() + st.overhead(msg.len());

            // Variable-length fairness: while senders are already suspended
            // and messages are queued, a newcomer must not slip its bytes in
            // ahead of them, unless this is a priority pipe and the caller
            // outranks the head waiter.
            if !st.fixed && !st.senders.is_empty() && st.messages > 0 {
                let head_priority = st.senders[0].priority;
                let forced = match self.inner.order {
                    SuspendOrder::Fifo => true,
                    SuspendOrder::Priority => {
                        matches!(wait, Wait::No) || head_priority <= priority
                    }
                };
                if forced {
                    need = st.available + 1;
                }
            }

            if st.available < need {
                if let Wait::No = wait {
                    return Err(KernelError::PipeFull);
                }
                let (tx, rx) = oneshot::channel();
                let token = st.token();
                insert_sender(
                    &mut st.senders,
                    SenderWaiter {
                        token,
                        priority,
                        msg: msg.to_vec(),
                        tx,
                    },
                    self.inner.order,
                );
                st.waiting_tasks += 1;
                (rx, token)
            } else if st.messages == 0 && !st.receivers.is_empty() {
                let waiter = st.receivers.remove(0);
                st.waiting_tasks -= 1;
                let _ = waiter.tx.send(Ok(msg.to_vec()));
                return Ok(());
            } else {
                st.push_message(msg);
                return Ok(());
            }
        };
        self.suspend(rx, token, wait).await
    }

    /// Send a message to every receiver currently waiting on an empty pipe.
    ///
    /// Behaves exactly like [`Pipe::send`] when no receiver is waiting.
    pub async fn broadcast(&self, msg: &[u8], wait: Wait, priority: u8) -> Result<()> {
        self.check_message(msg)?;
        let (rx, token) = {
            let mut st = self.state();
            if st.deleted {
                return Err(KernelError::PipeDeleted);
            }

            let mut need = msg.len() + st.overhead(msg.len());
            if !st.fixed && !st.senders.is_empty() && st.messages > 0 {
                let head_priority = st.senders[0].priority;
                let forced = match self.inner.order {
                    SuspendOrder::Fifo => true,
                    SuspendOrder::Priority => {
                        matches!(wait, Wait::No) || head_priority <= priority
                    }
                };
                if forced {
                    need = st.available + 1;
                }
            }

            if st.available < need {
                if let Wait::No = wait {
                    return Err(KernelError::PipeFull);
                }
                let (tx, rx) = oneshot::channel();
                let token = st.token();
                insert_sender(
                    &mut st.senders,
                    SenderWaiter {
                        token,
                        priority,
                        msg: msg.to_vec(),
                        tx,
                    },
                    self.inner.order,
                );
                st.waiting_tasks += 1;
                (rx, token)
            } else if st.messages == 0 && !st.receivers.is_empty() {
                st.waiting_tasks -= st.receivers.len();
                for waiter in st.receivers.drain(..) {
                    let _ = waiter.tx.send(Ok(msg.to_vec()));
                }
                return Ok(());
            } else {
                st.push_message(msg);
                return Ok(());
            }
        };
        self.suspend(rx, token, wait).await
    }

    /// Send a message ahead of everything already queued.
    ///
    /// With room, the message is written backward from the read cursor.
    /// Without room, a blocking caller joins the urgent list, which
    /// receivers serve before queued messages and before ordinary senders.
    pub async fn send_to_front(&self, msg: &[u8], wait: Wait, priority: u8) -> Result<()> {
        self.check_message(msg)?;
        let (rx, token) = {
            let mut st = self.state();
            if st.deleted {
                return Err(KernelError::PipeDeleted);
            }

            let need = msg.len() + st.overhead(msg.len());
            if st.available < need {
                if let Wait::No = wait {
                    return Err(KernelError::PipeFull);
                }
                let (tx, rx) = oneshot::channel();
                let token = st.token();
                insert_sender(
                    &mut st.urgent,
                    SenderWaiter {
                        token,
                        priority,
                        msg: msg.to_vec(),
                        tx,
                    },
                    self.inner.order,
                );
                st.waiting_tasks += 1;
                (rx, token)
            } else if st.messages == 0 && !st.receivers.is_empty() {
                let waiter = st.receivers.remove(0);
                st.waiting_tasks -= 1;
                let _ = waiter.tx.send(Ok(msg.to_vec()));
                return Ok(());
            } else {
                st.push_front_message(msg);
                return Ok(());
            }
        };
        self.suspend(rx, token, wait).await
    }

    /// Receive the logically oldest message.
    ///
    /// Urgent suspended senders are served first, then queued messages, then
    /// the caller suspends (or fails with [`KernelError::PipeEmpty`]).
    /// After draining a queued message, as many suspended ordinary senders
    /// as now fit are moved into the buffer and woken.
    pub async fn receive(&self, wait: Wait, priority: u8) -> Result<Vec<u8>> {
        let (rx, token) = {
            let mut st = self.state();
            if st.deleted {
                return Err(KernelError::PipeDeleted);
            }

            if !st.urgent.is_empty() {
                let waiter = st.urgent.remove(0);
                st.waiting_tasks -= 1;
                let msg = waiter.msg;
                let _ = waiter.tx.send(Ok(()));
                return Ok(msg);
            }

            if st.messages > 0 {
                let msg = st.pop_message();
                st.release_senders();
                return Ok(msg);
            }

            if let Wait::No = wait {
                return Err(KernelError::PipeEmpty);
            }
            let (tx, rx) = oneshot::channel();
            let token = st.token();
            insert_receiver(
                &mut st.receivers,
                ReceiverWaiter { token, priority, tx },
                self.inner.order,
            );
            st.waiting_tasks += 1;
            (rx, token)
        };
        self.suspend(rx, token, wait).await
    }

    /// Discard all queued content and wake every suspended caller with
    /// [`KernelError::PipeReset`].  The pipe remains usable.
    pub fn reset(&self) -> Result<()> {
        let mut st = self.state();
        if st.deleted {
            return Err(KernelError::PipeDeleted);
        }
        tracing::debug!(pipe = %self.inner.name, "pipe reset");
        st.flush_waiters(KernelError::PipeReset);
        st.read = 0;
        st.write = 0;
        st.available = st.capacity();
        st.messages = 0;
        Ok(())
    }

    /// Permanently invalidate the pipe, waking every suspended caller with
    /// [`KernelError::PipeDeleted`].  Later operations fail the same way.
    pub fn delete(&self) -> Result<()> {
        let mut st = self.state();
        if st.deleted {
            return Err(KernelError::PipeDeleted);
        }
        tracing::debug!(pipe = %self.inner.name, "pipe deleted");
        st.deleted = true;
        st.flush_waiters(KernelError::PipeDeleted);
        st.messages = 0;
        Ok(())
    }

    /// Snapshot the pipe's counters.
    pub fn info(&self) -> PipeInfo {
        let st = self.state();
        PipeInfo {
            name: self.inner.name.clone(),
            capacity: st.capacity(),
            available: st.available,
            messages: st.messages,
            waiting_tasks: st.waiting_tasks,
        }
    }

    /// The pipe's name, as given at creation.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether two handles refer to the same underlying pipe.
    pub fn same_pipe(&self, other: &Pipe) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Await the outcome of a suspended operation, unlinking the descriptor
    /// on timeout.  Satisfiers complete the channel while holding the state
    /// lock, so "absent from every list" implies the outcome is available.
    async fn suspend<T>(
        &self,
        mut rx: oneshot::Receiver<Result<T>>,
        token: u64,
        wait: Wait,
    ) -> Result<T> {
        match wait {
            Wait::No => Err(KernelError::Timeout),
            Wait::Forever => match (&mut rx).await {
                Ok(outcome) => outcome,
                Err(_) => Err(KernelError::PipeDeleted),
            },
            Wait::For(_) => {
                let deadline = wait.deadline().unwrap_or_else(tokio::time::Instant::now);
                match timeout_at(deadline, &mut rx).await {
                    Ok(Ok(outcome)) => outcome,
                    Ok(Err(_)) => Err(KernelError::PipeDeleted),
                    Err(_) => {
                        let mut st = self.state();
                        if st.unlink(token) {
                            return Err(KernelError::Timeout);
                        }
                        drop(st);
                        match rx.try_recv() {
                            Ok(outcome) => outcome,
                            Err(_) => Err(KernelError::Timeout),
                        }
                    }
                }
            }
        }
    }
}

impl fmt::Debug for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let info = self.info();
        f.debug_struct("Pipe")
            .field("name", &info.name)
            .field("capacity", &info.capacity)
            .field("available", &info.available)
            .field("messages", &info.messages)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn fixed_pipe(capacity: usize, msg: usize) -> Pipe {
        Pipe::new("test", capacity, MessagePolicy::Fixed(msg), SuspendOrder::Fifo)
            .expect("create pipe")
    }

    fn variable_pipe(capacity: usize, max: usize) -> Pipe {
        Pipe::new(
            "test",
            capacity,
            MessagePolicy::Variable { max },
            SuspendOrder::Fifo,
        )
        .expect("create pipe")
    }

    #[tokio::test]
    async fn fixed_round_trip_preserves_fifo_order() {
        let pipe = fixed_pipe(32, 8);
        for i in 0..4u8 {
            pipe.send(&[i; 8], Wait::No, 0).await.expect("send");
        }
        for i in 0..4u8 {
            let msg = pipe.receive(Wait::No, 0).await.expect("receive");
            assert_eq!(msg, vec![i; 8]);
        }
        assert_eq!(pipe.receive(Wait::No, 0).await, Err(KernelError::PipeEmpty));
    }

    #[tokio::test]
    async fn fifth_fixed_message_reports_full() {
        // Capacity 32, fixed size 8: exactly four messages fit.
        let pipe = fixed_pipe(32, 8);
        for i in 0..4u8 {
            pipe.send(&[i; 8], Wait::No, 0).await.expect("send");
        }
        assert_eq!(
            pipe.send(&[9; 8], Wait::No, 0).await,
            Err(KernelError::PipeFull)
        );
    }

    #[tokio::test]
    async fn capacity_is_truncated_to_policy_unit() {
        let pipe = fixed_pipe(30, 8);
        assert_eq!(pipe.info().capacity, 24);

        let pipe = variable_pipe(WORD * 4 - 1, WORD);
        assert_eq!(pipe.info().capacity, WORD * 3);
    }

    #[tokio::test]
    async fn creation_rejects_impossible_sizes() {
        assert!(Pipe::new("p", 0, MessagePolicy::Fixed(8), SuspendOrder::Fifo).is_err());
        assert!(Pipe::new("p", 32, MessagePolicy::Fixed(0), SuspendOrder::Fifo).is_err());
        // One maximum message plus framing must fit.
        assert!(
            Pipe::new(
                "p",
                WORD,
                MessagePolicy::Variable { max: WORD },
                SuspendOrder::Fifo
            )
            .is_err()
        );
        assert!(Pipe::new("p", 4, MessagePolicy::Fixed(8), SuspendOrder::Fifo).is_err());
    }

    #[tokio::test]
    async fn message_size_policy_is_enforced() {
        let pipe = fixed_pipe(32, 8);
        assert!(pipe.send(&[1; 7], Wait::No, 0).await.is_err());
        assert!(pipe.send(&[], Wait::No, 0).await.is_err());

        let pipe = variable_pipe(64, 16);
        assert!(pipe.send(&[1; 17], Wait::No, 0).await.is_err());
        assert!(pipe.send(&[1; 16], Wait::No, 0).await.is_ok());
    }

    #[tokio::test]
    async fn variable_message_wraps_mid_body() {
        // Five words of capacity.  The first message advances the cursors so
        // the second one's body must straddle the buffer edge.
        let cap = WORD * 5;
        let pipe = variable_pipe(cap, WORD * 2);

        let first: Vec<u8> = (0..(WORD as u8 + 2)).collect();
        pipe.send(&first, Wait::No, 0).await.expect("first send");
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("first recv"), first);

        let second: Vec<u8> = (100..(100 + WORD as u8 + 2)).collect();
        pipe.send(&second, Wait::No, 0).await.expect("wrapped send");
        assert_eq!(
            pipe.receive(Wait::No, 0).await.expect("wrapped recv"),
            second
        );
    }

    #[tokio::test]
    async fn available_matches_capacity_minus_queued_overhead() {
        let pipe = variable_pipe(WORD * 16, WORD * 4);
        let cap = pipe.info().capacity;

        let sizes = [1usize, WORD, WORD + 3, 2 * WORD];
        let mut queued = 0usize;
        for (i, &size) in sizes.iter().enumerate() {
            pipe.send(&vec![i as u8; size], Wait::No, 0)
                .await
                .expect("send");
            queued += WORD + aligned(size);
            assert_eq!(pipe.info().available, cap - queued);
        }
        for &size in &sizes {
            pipe.receive(Wait::No, 0).await.expect("receive");
            queued -= WORD + aligned(size);
            assert_eq!(pipe.info().available, cap - queued);
        }
        assert_eq!(pipe.info().available, cap);
    }

    #[tokio::test]
    async fn send_to_front_precedes_queued_messages() {
        let pipe = fixed_pipe(32, 4);
        pipe.send(b"aaaa", Wait::No, 0).await.expect("send a");
        pipe.send(b"bbbb", Wait::No, 0).await.expect("send b");
        pipe.send_to_front(b"uuuu", Wait::No, 0)
            .await
            .expect("urgent");

        assert_eq!(pipe.receive(Wait::No, 0).await.expect("1"), b"uuuu");
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("2"), b"aaaa");
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("3"), b"bbbb");
    }

    #[tokio::test]
    async fn send_to_front_wraps_backward_in_variable_mode() {
        let pipe = variable_pipe(WORD * 6, WORD * 2);
        let filler = vec![7u8; WORD];
        pipe.send(&filler, Wait::No, 0).await.expect("filler");
        pipe.receive(Wait::No, 0).await.expect("drain filler");

        // Read cursor now sits mid-buffer; the urgent block steps backward
        // across it, and an over-the-edge step wraps.
        pipe.send(&[1u8; 3], Wait::No, 0).await.expect("ordinary");
        pipe.send_to_front(&[2u8; 5], Wait::No, 0)
            .await
            .expect("urgent 1");
        pipe.send_to_front(&[3u8; 4], Wait::No, 0)
            .await
            .expect("urgent 2");

        assert_eq!(pipe.receive(Wait::No, 0).await.expect("1"), vec![3u8; 4]);
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("2"), vec![2u8; 5]);
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("3"), vec![1u8; 3]);
        assert_eq!(pipe.info().available, pipe.info().capacity);
    }

    #[tokio::test]
    async fn handoff_to_waiting_receiver_skips_buffer() {
        let pipe = fixed_pipe(16, 4);
        let rx = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.receive(Wait::Forever, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipe.info().waiting_tasks, 1);

        pipe.send(b"ping", Wait::No, 0).await.expect("send");
        assert_eq!(rx.await.expect("join").expect("receive"), b"ping");
        // The message went straight across; nothing was buffered.
        assert_eq!(pipe.info().messages, 0);
        assert_eq!(pipe.info().available, pipe.info().capacity);
    }

    #[tokio::test]
    async fn broadcast_satisfies_every_waiting_receiver() {
        let pipe = fixed_pipe(16, 4);
        let mut receivers = Vec::new();
        for _ in 0..3 {
            let pipe = pipe.clone();
            receivers.push(tokio::spawn(
                async move { pipe.receive(Wait::Forever, 0).await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipe.info().waiting_tasks, 3);

        pipe.broadcast(b"wake", Wait::No, 0).await.expect("broadcast");
        for rx in receivers {
            assert_eq!(rx.await.expect("join").expect("receive"), b"wake");
        }
        assert_eq!(pipe.info().messages, 0);
    }

    #[tokio::test]
    async fn broadcast_without_waiters_queues_once() {
        let pipe = fixed_pipe(16, 4);
        pipe.broadcast(b"solo", Wait::No, 0).await.expect("broadcast");
        assert_eq!(pipe.info().messages, 1);
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("receive"), b"solo");
    }

    #[tokio::test]
    async fn receive_releases_as_many_senders_as_fit() {
        // One-message pipe; three senders block behind it.
        let pipe = fixed_pipe(8, 8);
        pipe.send(&[0; 8], Wait::No, 0).await.expect("fill");

        let mut blocked = Vec::new();
        for i in 1..=3u8 {
            let pipe = pipe.clone();
            blocked.push(tokio::spawn(async move {
                pipe.send(&[i; 8], Wait::Forever, 0).await
            }));
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(pipe.info().waiting_tasks, 3);

        // Each receive frees exactly one slot, releasing exactly one sender.
        for expect in 0..=3u8 {
            let msg = pipe.receive(Wait::No, 0).await.expect("receive");
            assert_eq!(msg, vec![expect; 8]);
        }
        for handle in blocked {
            handle.await.expect("join").expect("blocked send");
        }
        assert_eq!(pipe.info().waiting_tasks, 0);
    }

    #[tokio::test]
    async fn priority_senders_release_in_priority_order() {
        let pipe = Pipe::new(
            "prio",
            8,
            MessagePolicy::Fixed(8),
            SuspendOrder::Priority,
        )
        .expect("create");
        pipe.send(&[0; 8], Wait::No, 0).await.expect("fill");

        // Arrival order: priority 5, then 1, then 5 again.
        for (byte, priority) in [(1u8, 5u8), (2, 1), (3, 5)] {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.send(&[byte; 8], Wait::Forever, priority).await });
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        pipe.receive(Wait::No, 0).await.expect("drain fill");
        // Priority 1 jumped the queue; the equal-priority pair kept arrival
        // order.
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("a"), vec![2; 8]);
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("b"), vec![1; 8]);
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("c"), vec![3; 8]);
    }

    #[tokio::test]
    async fn urgent_waiters_are_served_before_queued_messages() {
        let pipe = fixed_pipe(8, 8);
        pipe.send(&[0; 8], Wait::No, 0).await.expect("fill");

        let urgent = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.send_to_front(&[9; 8], Wait::Forever, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        // The urgent waiter outranks the already-queued message.
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("1"), vec![9; 8]);
        urgent.await.expect("join").expect("urgent send");
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("2"), vec![0; 8]);
    }

    #[tokio::test]
    async fn variable_sender_cannot_jump_suspended_queue() {
        // Room exists for the small message, but a larger sender is already
        // suspended behind queued data, so the newcomer must not slip ahead.
        let cap = WORD * 8;
        let max = WORD * 4;
        let pipe = variable_pipe(cap, max);

        let big = vec![1u8; max - 3];
        pipe.send(&big, Wait::No, 0).await.expect("first big");

        let blocked = {
            let pipe = pipe.clone();
            let big = big.clone();
            tokio::spawn(async move { pipe.send(&big, Wait::Forever, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(pipe.info().waiting_tasks, 1);

        let small = [7u8; 2];
        assert!(pipe.info().available >= WORD + aligned(small.len()));
        assert_eq!(
            pipe.send(&small, Wait::No, 0).await,
            Err(KernelError::PipeFull)
        );

        // Draining the first message releases the suspended sender; only
        // then does the small message get in.
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("drain"), big);
        blocked.await.expect("join").expect("blocked send");
        pipe.send(&small, Wait::No, 0).await.expect("small send");
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("big 2"), big);
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("small"), small);
    }

    #[tokio::test]
    async fn reset_wakes_all_waiters_with_reset_error() {
        let pipe = fixed_pipe(8, 8);
        let mut waiters = Vec::new();
        for _ in 0..2 {
            let pipe = pipe.clone();
            waiters.push(tokio::spawn(
                async move { pipe.receive(Wait::Forever, 0).await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        pipe.reset().expect("reset");
        for handle in waiters {
            assert_eq!(handle.await.expect("join"), Err(KernelError::PipeReset));
        }
        let info = pipe.info();
        assert_eq!(info.messages, 0);
        assert_eq!(info.available, info.capacity);
        assert_eq!(info.waiting_tasks, 0);

        // The pipe stays usable after a reset.
        pipe.send(&[1; 8], Wait::No, 0).await.expect("send");
        assert_eq!(pipe.receive(Wait::No, 0).await.expect("receive"), vec![1; 8]);
    }

    #[tokio::test]
    async fn delete_wakes_waiters_and_poisons_the_pipe() {
        let pipe = fixed_pipe(8, 8);
        pipe.send(&[0; 8], Wait::No, 0).await.expect("fill");

        let blocked = {
            let pipe = pipe.clone();
            tokio::spawn(async move { pipe.send(&[1; 8], Wait::Forever, 0).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        pipe.delete().expect("delete");
        assert_eq!(blocked.await.expect("join"), Err(KernelError::PipeDeleted));
        assert_eq!(
            pipe.send(&[2; 8], Wait::No, 0).await,
            Err(KernelError::PipeDeleted)
        );
        assert_eq!(
            pipe.receive(Wait::No, 0).await,
            Err(KernelError::PipeDeleted)
        );
        assert_eq!(pipe.delete(), Err(KernelError::PipeDeleted));
    }

    #[tokio::test]
    async fn timed_out_waiter_is_unlinked() {
        let pipe = fixed_pipe(8, 8);
        let result = pipe
            .receive(Wait::For(Duration::from_millis(20)), 0)
            .await;
        assert_eq!(result, Err(KernelError::Timeout));
        assert_eq!(pipe.info().waiting_tasks, 0);

        pipe.send(&[0; 8], Wait::No, 0).await.expect("fill");
        let result = pipe
            .send(&[1; 8], Wait::For(Duration::from_millis(20)), 0)
            .await;
        assert_eq!(result, Err(KernelError::Timeout));
        assert_eq!(pipe.info().waiting_tasks, 0);
    }

    #[tokio::test]
    async fn bounded_wait_succeeds_when_satisfied_in_time() {
        let pipe = fixed_pipe(8, 8);
        let receiver = {
            let pipe = pipe.clone();
            tokio::spawn(async move {
                pipe.receive(Wait::For(Duration::from_secs(5)), 0).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        pipe.send(&[3; 8], Wait::No, 0).await.expect("send");
        assert_eq!(receiver.await.expect("join").expect("receive"), vec![3; 8]);
    }
}
