//! Peer link runtime: shared state, reader and writer tasks.

use std::cell::{Cell, RefCell};
use std::collections::BTreeMap;
use std::rc::{Rc, Weak};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::futures::Notified;
use tokio::sync::{Notify, mpsc, oneshot};
use tokio::task::JoinHandle;

use super::state::{Effects, LinkFailure, Open, PeerState, ProtocolViolation};
use crate::wire::{Frame, FrameReader, encode_payload};
use crate::{
    ConnectionId, EndPointAddress, Event, EventError, EventErrorKind, Reliability, SendError,
    TaskProvider,
};

/// Links of one endpoint, keyed by remote address.
pub(crate) type PeerTable = BTreeMap<EndPointAddress, Rc<Peer>>;

/// Completion of one queued write: `Err` carries the I/O failure.
pub(crate) type WriteAck = oneshot::Receiver<Result<(), String>>;

/// Resolves when the remote acknowledges a new connection. A dropped sender
/// means the connection or its link went away first.
pub(crate) type AcceptAck = oneshot::Receiver<()>;

/// One unit of work for the writer task.
pub(crate) struct Outbound {
    bytes: Vec<u8>,
    done: Option<oneshot::Sender<Result<(), String>>>,
    shutdown: bool,
}

/// Result of [`Peer::open_outgoing`].
pub(crate) enum Opening {
    /// Registered; `accepted` resolves once the remote acknowledged it.
    Allocated {
        /// Link-local id of the new connection.
        id: u32,
        /// Remote acknowledgement.
        accepted: AcceptAck,
    },
    /// Wait for the link to change state, then try again.
    Wait,
    /// The link is closed; create a new one.
    Retry,
    /// The link failed.
    Failed(LinkFailure),
}

#[derive(Default)]
struct LinkTasks {
    dial: Option<JoinHandle<()>>,
    reader: Option<JoinHandle<()>>,
    writer: Option<JoinHandle<()>>,
}

struct PeerInner {
    state: PeerState,
    writer: Option<mpsc::UnboundedSender<Outbound>>,
    tasks: LinkTasks,
    /// Outgoing connections waiting for `AcceptedConnection`.
    pending_accepts: BTreeMap<u32, oneshot::Sender<()>>,
}

/// One link (heavyweight connection) from a local endpoint to a remote one.
///
/// A `Peer` lives exactly as long as its socket. Once `Closed` or `Invalid`
/// it is removed from the endpoint's table and never reused; the next
/// `connect` to the same remote builds a new instance with fresh counters.
pub(crate) struct Peer {
    local: EndPointAddress,
    remote: EndPointAddress,
    /// Sequence number within the local endpoint, used for event ids.
    seq: u32,
    /// The remote's sequence number for this link, learned in the handshake.
    remote_seq: Cell<Option<u32>>,
    max_message_size: usize,
    inner: RefCell<PeerInner>,
    /// Signalled after every state transition.
    changed: Notify,
    events: mpsc::UnboundedSender<Event>,
    table: Weak<RefCell<PeerTable>>,
}

impl Peer {
    /// A link in `Init`.
    pub(crate) fn new(
        local: EndPointAddress,
        remote: EndPointAddress,
        seq: u32,
        max_message_size: usize,
        events: mpsc::UnboundedSender<Event>,
        table: Weak<RefCell<PeerTable>>,
    ) -> Rc<Self> {
        Rc::new(Self {
            local,
            remote,
            seq,
            remote_seq: Cell::new(None),
            max_message_size,
            inner: RefCell::new(PeerInner {
                state: PeerState::Init,
                writer: None,
                tasks: LinkTasks::default(),
                pending_accepts: BTreeMap::new(),
            }),
            changed: Notify::new(),
            events,
            table,
        })
    }

    pub(crate) fn remote(&self) -> &EndPointAddress {
        &self.remote
    }

    pub(crate) fn seq(&self) -> u32 {
        self.seq
    }

    pub(crate) fn remote_seq(&self) -> Option<u32> {
        self.remote_seq.get()
    }

    pub(crate) fn state_name(&self) -> &'static str {
        self.inner.borrow().state.name()
    }

    pub(crate) fn is_init(&self) -> bool {
        matches!(self.inner.borrow().state, PeerState::Init)
    }

    pub(crate) fn is_closing(&self) -> bool {
        matches!(self.inner.borrow().state, PeerState::Closing(_))
    }

    /// `Valid` or `Closing`.
    pub(crate) fn is_live(&self) -> bool {
        self.inner.borrow().state.book().is_some()
    }

    /// Future resolving at the next state transition.
    ///
    /// Create it before inspecting the state so no transition is missed.
    pub(crate) fn changed(&self) -> Notified<'_> {
        self.changed.notified()
    }

    /// Wait until the link leaves `Init`.
    pub(crate) async fn wait_while_init(&self) {
        loop {
            let changed = self.changed();
            if !self.is_init() {
                return;
            }
            changed.await;
        }
    }

    pub(crate) fn track_dial(&self, handle: JoinHandle<()>) {
        self.inner.borrow_mut().tasks.dial = Some(handle);
    }

    /// `Init → Valid`; frames queued from now on go to `writer`.
    /// `remote_seq` is the remote's sequence number for the same link.
    pub(crate) fn activate(
        &self,
        writer: mpsc::UnboundedSender<Outbound>,
        remote_seq: u32,
    ) -> bool {
        let activated = {
            let mut inner = self.inner.borrow_mut();
            let activated = inner.state.activate();
            if activated {
                inner.writer = Some(writer);
                self.remote_seq.set(Some(remote_seq));
            }
            activated
        };
        if activated {
            tracing::debug!(
                "Peer::activate {} -> {} link #{} (remote #{})",
                self.local,
                self.remote,
                self.seq,
                remote_seq
            );
            self.changed.notify_waiters();
        }
        activated
    }

    /// Allocate an outgoing connection and queue its `CreatedConnection`.
    pub(crate) fn open_outgoing(&self) -> Opening {
        let mut inner = self.inner.borrow_mut();
        match inner.state.open_outgoing() {
            Open::Allocated(id) => {
                let (done, accepted) = oneshot::channel();
                inner.pending_accepts.insert(id, done);
                push(&mut inner, Frame::CreatedConnection(id).encode(), None, false);
                tracing::trace!("Peer::open_outgoing {} -> {} id={}", self.local, self.remote, id);
                Opening::Allocated { id, accepted }
            }
            Open::Wait => Opening::Wait,
            Open::Retry => Opening::Retry,
            Open::Failed(failure) => Opening::Failed(failure),
        }
    }

    /// Queue one message on outgoing connection `id`.
    pub(crate) fn send(&self, id: u32, chunks: &[&[u8]]) -> Result<WriteAck, SendError> {
        let size: usize = chunks.iter().map(|chunk| chunk.len()).sum();
        let too_large = SendError::MessageTooLarge {
            size,
            max: self.max_message_size,
        };
        if size > self.max_message_size {
            return Err(too_large);
        }

        let mut inner = self.inner.borrow_mut();
        inner.state.check_outgoing(id)?;
        let bytes = encode_payload(id, chunks, self.max_message_size).map_err(|_| too_large)?;
        let (done, ack) = oneshot::channel();
        push(&mut inner, bytes, Some(done), false);
        Ok(ack)
    }

    /// Whether outgoing connection `id` may still be used.
    pub(crate) fn check_outgoing(&self, id: u32) -> Result<(), SendError> {
        self.inner.borrow().state.check_outgoing(id)
    }

    /// Close outgoing connection `id`.
    pub(crate) fn close_outgoing(&self, id: u32) {
        let effects = {
            let mut inner = self.inner.borrow_mut();
            let effects = inner.state.close_outgoing(id);
            inner.pending_accepts.remove(&id);
            push_frames(&mut inner, &effects);
            effects
        };
        self.finish_transition(effects);
    }

    /// Close every outgoing connection on this link.
    pub(crate) fn close_all_outgoing(&self) {
        let effects = {
            let mut inner = self.inner.borrow_mut();
            let effects = inner.state.close_all_outgoing();
            inner.pending_accepts.clear();
            push_frames(&mut inner, &effects);
            effects
        };
        self.finish_transition(effects);
    }

    /// Apply one decoded frame. Returns whether the reader keeps going.
    pub(crate) fn on_frame(&self, frame: Frame) -> Result<bool, ProtocolViolation> {
        tracing::trace!("Peer::on_frame {} <- {} {:?}", self.local, self.remote, frame.kind());
        let effects = {
            let mut inner = self.inner.borrow_mut();
            let effects = inner.state.on_frame(frame)?;
            push_frames(&mut inner, &effects);
            effects
        };
        let finished = effects.finished;
        self.finish_transition(effects);
        Ok(!finished && self.is_live())
    }

    /// Emit events, notify waiters and drop the link from the table if the
    /// transition ended it.
    fn finish_transition(&self, effects: Effects) {
        let Effects {
            opened,
            accepted,
            closed,
            received,
            finished,
            ..
        } = effects;

        if let Some(id) = accepted {
            let waiter = self.inner.borrow_mut().pending_accepts.remove(&id);
            if let Some(waiter) = waiter {
                let _ = waiter.send(());
            }
        }

        if let Some(id) = opened {
            self.emit(Event::ConnectionOpened {
                id: ConnectionId::new(self.seq, id),
                reliability: Reliability::ReliableOrdered,
                remote: self.remote.clone(),
            });
        }
        if let Some((id, payload)) = received {
            self.emit(Event::Received {
                id: ConnectionId::new(self.seq, id),
                payload,
            });
        }
        for id in closed {
            self.emit(Event::ConnectionClosed(ConnectionId::new(self.seq, id)));
        }

        if finished {
            tracing::debug!("Peer: link {} -> {} #{} closed", self.local, self.remote, self.seq);
            self.detach();
        }
        self.changed.notify_waiters();
    }

    fn emit(&self, event: Event) {
        // The endpoint may already be gone; nobody is left to tell.
        let _ = self.events.send(event);
    }

    /// Remove this instance from the endpoint's table, if it is still there.
    pub(crate) fn detach(&self) {
        let Some(table) = self.table.upgrade() else {
            return;
        };
        let mut table = table.borrow_mut();
        let is_self = table
            .get(&self.remote)
            .is_some_and(|peer| std::ptr::eq(peer.as_ref(), self));
        if is_self {
            table.remove(&self.remote);
        }
    }

    /// Move to `Invalid`: report lost connections, wake waiters, stop tasks.
    pub(crate) fn fail(&self, failure: LinkFailure) {
        let (incoming, tasks) = {
            let mut inner = self.inner.borrow_mut();
            if matches!(inner.state, PeerState::Closed | PeerState::Invalid(_)) {
                return;
            }
            let previous = inner.state.name();
            let incoming = inner.state.invalidate(failure.clone());
            inner.writer = None;
            inner.pending_accepts.clear();
            tracing::warn!(
                "Peer::fail {} -> {} #{} ({}): {}",
                self.local,
                self.remote,
                self.seq,
                previous,
                failure
            );
            (incoming, std::mem::take(&mut inner.tasks))
        };

        if let Some(incoming) = incoming {
            for id in incoming {
                self.emit(Event::ConnectionClosed(ConnectionId::new(self.seq, id)));
            }
            self.emit(Event::ConnectionError(EventError {
                kind: EventErrorKind::ConnectionLost(self.remote.clone()),
                detail: failure.to_string(),
            }));
        }

        self.detach();
        self.changed.notify_waiters();
        for handle in [tasks.dial, tasks.reader, tasks.writer].into_iter().flatten() {
            handle.abort();
        }
    }

    /// Endpoint shutdown: close outgoing connections on the wire, announce
    /// the socket is going away and stop reading. Queued frames still flush.
    pub(crate) fn shutdown(&self) {
        let (dial, reader) = {
            let mut inner = self.inner.borrow_mut();
            let effects = inner.state.shutdown();
            push_frames(&mut inner, &effects);
            inner.writer = None;
            inner.pending_accepts.clear();
            (inner.tasks.dial.take(), inner.tasks.reader.take())
        };
        tracing::debug!("Peer::shutdown {} -> {} #{}", self.local, self.remote, self.seq);
        self.detach();
        self.changed.notify_waiters();
        for handle in [dial, reader].into_iter().flatten() {
            handle.abort();
        }
    }

    /// Drop a `Closing` link without events, because the remote dialed a
    /// replacement.
    pub(crate) fn retire(&self) {
        let (dial, reader) = {
            let mut inner = self.inner.borrow_mut();
            inner.state = PeerState::Closed;
            inner.writer = None;
            inner.pending_accepts.clear();
            (inner.tasks.dial.take(), inner.tasks.reader.take())
        };
        tracing::debug!("Peer::retire {} -> {} #{}", self.local, self.remote, self.seq);
        self.detach();
        self.changed.notify_waiters();
        for handle in [dial, reader].into_iter().flatten() {
            handle.abort();
        }
    }

    /// Best description of why the link cannot carry a new connection.
    pub(crate) fn failure(&self) -> LinkFailure {
        match &self.inner.borrow().state {
            PeerState::Invalid(failure) => failure.clone(),
            other => LinkFailure::Lost(format!("link is {}", other.name())),
        }
    }
}

/// Queue `bytes` for the writer. A missing writer drops `done`, which the
/// waiting side reads as a broken link.
fn push(
    inner: &mut PeerInner,
    bytes: Vec<u8>,
    done: Option<oneshot::Sender<Result<(), String>>>,
    shutdown: bool,
) {
    if let Some(writer) = &inner.writer {
        let _ = writer.send(Outbound {
            bytes,
            done,
            shutdown,
        });
    }
    if shutdown {
        inner.writer = None;
    }
}

fn push_frames(inner: &mut PeerInner, effects: &Effects) {
    let count = effects.frames.len();
    for (position, frame) in effects.frames.iter().enumerate() {
        let last = position + 1 == count;
        push(inner, frame.encode(), None, last && effects.shutdown);
    }
    if count == 0 && effects.shutdown {
        push(inner, Vec::new(), None, true);
    }
}

/// Split `stream` and run the link's writer and reader over it.
pub(crate) fn start_link<T, S>(
    task: &T,
    peer: &Rc<Peer>,
    stream: S,
    outbound: mpsc::UnboundedReceiver<Outbound>,
    read_buffer_size: usize,
) where
    T: TaskProvider,
    S: AsyncRead + AsyncWrite + Unpin + 'static,
{
    let (read_half, write_half) = tokio::io::split(stream);
    let writer = task.spawn_task(
        "link_writer",
        run_writer(Rc::downgrade(peer), write_half, outbound),
    );
    let reader = if peer.is_live() {
        Some(task.spawn_task(
            "link_reader",
            run_reader(peer.clone(), read_half, read_buffer_size),
        ))
    } else {
        None
    };

    let mut inner = peer.inner.borrow_mut();
    inner.tasks.writer = Some(writer);
    inner.tasks.reader = reader;
}

/// Exclusive owner of the write half: writes queued frames in order.
async fn run_writer<W>(
    peer: Weak<Peer>,
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(item) = outbound.recv().await {
        let result = async {
            if !item.bytes.is_empty() {
                writer.write_all(&item.bytes).await?;
            }
            writer.flush().await
        }
        .await;

        match result {
            Ok(()) => {
                if let Some(done) = item.done {
                    let _ = done.send(Ok(()));
                }
                if item.shutdown {
                    let _ = writer.shutdown().await;
                    return;
                }
            }
            Err(e) => {
                let detail = format!("write failed: {}", e);
                if let Some(done) = item.done {
                    let _ = done.send(Err(detail.clone()));
                }
                if let Some(peer) = peer.upgrade() {
                    peer.fail(LinkFailure::Lost(detail));
                }
                return;
            }
        }
    }
    let _ = writer.shutdown().await;
}

/// Reads the socket, reassembles frames and feeds them to the link.
async fn run_reader<R>(peer: Rc<Peer>, mut reader: R, read_buffer_size: usize)
where
    R: AsyncRead + Unpin,
{
    let mut frames = FrameReader::new(peer.max_message_size, read_buffer_size);
    let mut chunk = vec![0u8; read_buffer_size.max(1)];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                peer.fail(LinkFailure::Lost("connection closed by remote".to_string()));
                return;
            }
            Ok(n) => n,
            Err(e) => {
                peer.fail(LinkFailure::Lost(format!("read failed: {}", e)));
                return;
            }
        };
        frames.extend(&chunk[..n]);

        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => match peer.on_frame(frame) {
                    Ok(true) => {}
                    Ok(false) => return,
                    Err(violation) => {
                        tracing::warn!("link_reader {}: {}", peer.remote, violation);
                        peer.fail(LinkFailure::Lost(violation.to_string()));
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("link_reader {}: wire format error: {}", peer.remote, e);
                    peer.fail(LinkFailure::Lost(format!("protocol violation: {}", e)));
                    return;
                }
            }
        }
    }
}
