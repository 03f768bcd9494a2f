// Mux session engine: one per tunnel classified as Mux. Owns the
// sub-connection table, the residue buffer for partial frames, the
// outbound frame queue toward the WebSocket, and the per-session
// accounting the dispatcher drains at close.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::io::AsyncReadExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Notify;
use tokio::task::AbortHandle;

use crate::address::NetLocation;
use crate::dns::DohClient;
use crate::mux::frame::{self, MuxFrame, MuxNetwork, MuxStatus};
use crate::mux::write_queue::WriteQueue;
use crate::outbound;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Parse-loop guard against malformed streams that never advance.
const MAX_FRAMES_PER_CHUNK: usize = 1000;

/// Bound on the recently-ended set; it halves itself on overflow.
const ENDED_SESSIONS_CAP: usize = 256;

/// Read buffer for remote-to-client pipes; also bounds Keep payloads.
const PIPE_BUF_SIZE: usize = 8192;

/// Recently ended or rejected sub-ids, kept to swallow late frames and
/// break the End-pong feedback loop. Insertion-ordered so overflow can
/// drop the oldest half.
struct EndedSessions {
    order: VecDeque<u16>,
    set: FxHashSet<u16>,
}

impl EndedSessions {
    fn new() -> Self {
        Self {
            order: VecDeque::new(),
            set: FxHashSet::default(),
        }
    }

    fn insert(&mut self, id: u16) {
        if !self.set.insert(id) {
            return;
        }
        self.order.push_back(id);
        if self.order.len() > ENDED_SESSIONS_CAP {
            for _ in 0..self.order.len() / 2 {
                if let Some(old) = self.order.pop_front() {
                    self.set.remove(&old);
                }
            }
        }
    }

    fn remove(&mut self, id: u16) {
        if self.set.remove(&id) {
            self.order.retain(|&x| x != id);
        }
    }

    fn contains(&self, id: u16) -> bool {
        self.set.contains(&id)
    }

    fn clear(&mut self) {
        self.order.clear();
        self.set.clear();
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.set.len()
    }
}

struct SubConn {
    location: NetLocation,
    network: MuxNetwork,
    ready: bool,
    closed: bool,
    pending: Vec<Vec<u8>>,
    /// Exclusive writer, acquired once at connect and held for the life
    /// of the sub-connection.
    writer: Option<Arc<tokio::sync::Mutex<OwnedWriteHalf>>>,
    pipe: Option<AbortHandle>,
    created_at: Instant,
}

impl SubConn {
    fn new(location: NetLocation, network: MuxNetwork) -> Self {
        Self {
            location,
            network,
            ready: false,
            closed: false,
            pending: Vec::new(),
            writer: None,
            pipe: None,
            created_at: Instant::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub total_tcp: u32,
    pub total_udp: u32,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub active: usize,
    pub limit_reached: bool,
}

struct MuxState {
    conns: FxHashMap<u16, SubConn>,
    ended: EndedSessions,
    residue: Vec<u8>,
    total_tcp: u32,
    total_udp: u32,
    bytes_received: u64,
    bytes_sent: u64,
    limit_reached: bool,
    last_activity: Instant,
    closed: bool,
}

pub struct MuxSession {
    state: Mutex<MuxState>,
    queue: Mutex<WriteQueue>,
    queue_notify: Notify,
    doh: DohClient,
    max_subrequests: u32,
}

impl MuxSession {
    /// `response_prefix` is prepended to the first frame sent toward the
    /// client, per the tunnel greeting contract.
    pub fn new(response_prefix: Vec<u8>, doh: DohClient, max_subrequests: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MuxState {
                conns: FxHashMap::default(),
                ended: EndedSessions::new(),
                residue: Vec::new(),
                total_tcp: 0,
                total_udp: 0,
                bytes_received: 0,
                bytes_sent: 0,
                limit_reached: false,
                last_activity: Instant::now(),
                closed: false,
            }),
            queue: Mutex::new(WriteQueue::new(response_prefix)),
            queue_notify: Notify::new(),
            doh,
            max_subrequests,
        })
    }

    /// Feed one inbound chunk from the tunnel. Parses as many complete
    /// frames as the residue plus this chunk hold and dispatches each;
    /// the unconsumed tail becomes the new residue.
    pub async fn feed(self: &Arc<Self>, chunk: &[u8]) -> std::io::Result<()> {
        let carried: Option<Vec<u8>> = {
            let mut state = self.state.lock();
            state.bytes_received += chunk.len() as u64;
            state.last_activity = Instant::now();
            if state.residue.is_empty() {
                None
            } else {
                let mut buf = std::mem::take(&mut state.residue);
                buf.extend_from_slice(chunk);
                Some(buf)
            }
        };
        // Fast path: no residue, parse straight out of the chunk.
        let buf: &[u8] = carried.as_deref().unwrap_or(chunk);

        let mut offset = 0;
        let mut iterations = 0;
        while offset < buf.len() {
            iterations += 1;
            if iterations > MAX_FRAMES_PER_CHUNK {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    "mux frame iteration cap exceeded",
                ));
            }
            match frame::parse_frame(&buf[offset..])? {
                Some(parsed) => {
                    let frame_len = parsed.frame_len;
                    if frame_len == 0 {
                        return Err(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "mux frame did not advance",
                        ));
                    }
                    self.handle_frame(parsed).await;
                    offset += frame_len;
                }
                None => break,
            }
        }

        let tail = &buf[offset..];
        let mut state = self.state.lock();
        state.residue.clear();
        state.residue.extend_from_slice(tail);
        Ok(())
    }

    async fn handle_frame(self: &Arc<Self>, frame: MuxFrame<'_>) {
        match frame.status {
            MuxStatus::New => self.handle_new(frame),
            MuxStatus::Keep => self.handle_keep(frame).await,
            MuxStatus::End => self.handle_end(frame).await,
            MuxStatus::KeepAlive => {
                self.state.lock().last_activity = Instant::now();
            }
        }
    }

    fn handle_new(self: &Arc<Self>, frame: MuxFrame<'_>) {
        let id = frame.id;
        let (Some(network), Some(location)) = (frame.network, frame.target) else {
            debug!("mux new({}) without target, ignoring", id);
            return;
        };
        let initial_data = frame.data.map(|d| d.to_vec());

        {
            let mut state = self.state.lock();
            // Ids are reused; a New supersedes any remembered End.
            state.ended.remove(id);

            if state.conns.contains_key(&id) {
                debug!("mux new({}) for an active sub, dropping", id);
                return;
            }

            match network {
                MuxNetwork::Tcp => {
                    if state.limit_reached || state.total_tcp >= self.max_subrequests {
                        state.limit_reached = true;
                        state.ended.insert(id);
                        drop(state);
                        debug!("mux new({}) rejected: sub-request budget reached", id);
                        self.enqueue_frame(frame::encode_end(id));
                        return;
                    }
                    state.total_tcp += 1;
                    let mut sub = SubConn::new(location.clone(), network);
                    if let Some(data) = initial_data {
                        sub.pending.push(data);
                    }
                    state.conns.insert(id, sub);
                }
                MuxNetwork::Udp => {
                    if location.port() != 53 {
                        state.ended.insert(id);
                        drop(state);
                        debug!("mux new({}) rejected: UDP only supports DNS", id);
                        self.enqueue_frame(frame::encode_end(id));
                        return;
                    }
                    state.total_udp += 1;
                    let mut sub = SubConn::new(location, network);
                    // DNS subs have no socket to open.
                    sub.ready = true;
                    state.conns.insert(id, sub);
                    drop(state);
                    if let Some(data) = initial_data {
                        self.spawn_dns_query(id, data);
                    }
                    return;
                }
            }
        }

        let session = self.clone();
        tokio::spawn(async move {
            session.connect_sub(id, location).await;
        });
    }

    async fn handle_keep(self: &Arc<Self>, frame: MuxFrame<'_>) {
        let id = frame.id;
        enum Action {
            Drop,
            Stranger,
            EndStranger,
            Dns(Vec<u8>),
            Write(Arc<tokio::sync::Mutex<OwnedWriteHalf>>, Vec<u8>),
        }

        let action = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            let looked_up = match state.conns.get_mut(&id) {
                None => Action::Stranger,
                Some(sub) if sub.closed => Action::Drop,
                Some(sub) => match sub.network {
                    MuxNetwork::Udp => match frame.data {
                        Some(data) if !data.is_empty() => Action::Dns(data.to_vec()),
                        _ => Action::Drop,
                    },
                    MuxNetwork::Tcp => match frame.data.filter(|d| !d.is_empty()) {
                        None => Action::Drop,
                        Some(data) if !sub.ready => {
                            sub.pending.push(data.to_vec());
                            Action::Drop
                        }
                        Some(data) => match sub.writer.clone() {
                            Some(writer) => Action::Write(writer, data.to_vec()),
                            None => Action::Drop,
                        },
                    },
                },
            };
            match looked_up {
                // One End per stranger id, then silence until a New(id)
                // resurrects it.
                Action::Stranger => {
                    if state.ended.contains(id) {
                        Action::Drop
                    } else {
                        state.ended.insert(id);
                        Action::EndStranger
                    }
                }
                other => other,
            }
        };

        match action {
            Action::Drop | Action::Stranger => {}
            Action::EndStranger => {
                self.enqueue_frame(frame::encode_end(id));
            }
            Action::Dns(query) => self.spawn_dns_query(id, query),
            Action::Write(writer, data) => {
                let mut guard = writer.lock().await;
                if let Err(e) = outbound::write_chunked(&mut *guard, &data).await {
                    drop(guard);
                    debug!("mux sub {} write failed: {}", id, e);
                    self.close_sub(id, true);
                }
            }
        }
    }

    async fn handle_end(self: &Arc<Self>, frame: MuxFrame<'_>) {
        let id = frame.id;
        let trailing = frame.data.filter(|d| !d.is_empty()).map(|d| d.to_vec());

        let removed = {
            let mut state = self.state.lock();
            state.last_activity = Instant::now();
            let removed = state.conns.remove(&id);
            state.ended.insert(id);
            removed
        };

        let Some(mut sub) = removed else {
            return;
        };
        sub.closed = true;
        if let Some(handle) = sub.pipe.take() {
            handle.abort();
        }
        // Flush any payload the client attached to its End before the
        // socket drops.
        if let (Some(data), Some(writer)) = (trailing, sub.writer.take()) {
            let mut guard = writer.lock().await;
            let _ = outbound::write_chunked(&mut *guard, &data).await;
        }
    }

    async fn connect_sub(self: Arc<Self>, id: u16, location: NetLocation) {
        let stream = match tokio::time::timeout(CONNECT_TIMEOUT, outbound::connect(&location)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                debug!("mux sub {} connect to {} failed: {}", id, location, e);
                self.fail_sub(id);
                return;
            }
            Err(_) => {
                debug!("mux sub {} connect to {} timed out", id, location);
                self.fail_sub(id);
                return;
            }
        };

        let (read_half, write_half) = stream.into_split();
        let writer = Arc::new(tokio::sync::Mutex::new(write_half));

        // Hold the writer while flipping `ready` and draining the queue,
        // so a Keep that observes ready=true serializes behind the
        // pending flush.
        let mut guard = writer.clone().lock_owned().await;
        let pending = {
            let mut state = self.state.lock();
            let Some(sub) = state.conns.get_mut(&id) else {
                // Ended while connecting; the socket drops here.
                return;
            };
            sub.writer = Some(writer);
            sub.ready = true;
            std::mem::take(&mut sub.pending)
        };

        for data in pending {
            if let Err(e) = outbound::write_chunked(&mut *guard, &data).await {
                drop(guard);
                debug!("mux sub {} initial write failed: {}", id, e);
                self.close_sub(id, true);
                return;
            }
        }
        drop(guard);

        let session = self.clone();
        let handle = tokio::spawn(async move {
            session.pipe_remote(id, read_half).await;
        });

        let mut state = self.state.lock();
        match state.conns.get_mut(&id) {
            Some(sub) if !sub.closed => {
                sub.pipe = Some(handle.abort_handle());
            }
            _ => handle.abort(),
        }
    }

    /// Remote-to-client pipe for one TCP sub: every read becomes a Keep
    /// frame; EOF or error emits a single End.
    async fn pipe_remote(self: Arc<Self>, id: u16, mut read_half: OwnedReadHalf) {
        let mut buf = crate::util::allocate_vec(PIPE_BUF_SIZE);
        loop {
            match read_half.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    if !self.enqueue_frame(frame::encode_keep(id, &buf[..n])) {
                        warn!("mux sub {} dropped {} downstream bytes (queue full)", id, n);
                    }
                    self.state.lock().last_activity = Instant::now();
                }
                Err(e) => {
                    debug!("mux sub {} upstream read failed: {}", id, e);
                    break;
                }
            }
        }
        self.close_sub(id, true);
    }

    /// Connect failure: End toward the client, nothing to tear down.
    fn fail_sub(&self, id: u16) {
        {
            let mut state = self.state.lock();
            state.conns.remove(&id);
            state.ended.insert(id);
        }
        self.enqueue_frame(frame::encode_end(id));
    }

    fn close_sub(&self, id: u16, send_end: bool) {
        let removed = {
            let mut state = self.state.lock();
            let removed = state.conns.remove(&id);
            if removed.is_some() {
                state.ended.insert(id);
            }
            removed
        };
        let Some(mut sub) = removed else {
            return;
        };
        debug!(
            "mux sub {} to {} closed after {:?}",
            id,
            sub.location,
            sub.created_at.elapsed()
        );
        sub.closed = true;
        if let Some(handle) = sub.pipe.take() {
            handle.abort();
        }
        if send_end {
            self.enqueue_frame(frame::encode_end(id));
        }
    }

    fn spawn_dns_query(self: &Arc<Self>, id: u16, query: Vec<u8>) {
        let session = self.clone();
        tokio::spawn(async move {
            match session.doh.query(&query).await {
                Ok(response) if !response.is_empty() => {
                    if !session.enqueue_frame(frame::encode_keep(id, &response)) {
                        warn!("mux sub {} dropped DNS response (queue full)", id);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    debug!("mux sub {} DNS query failed: {}", id, e);
                }
            }
        });
    }

    /// Queue an outbound frame toward the client. Returns false when the
    /// queue refused it (back-pressure); the frame is dropped.
    pub fn enqueue_frame(&self, frame: Vec<u8>) -> bool {
        let len = frame.len() as u64;
        let pushed = self.queue.lock().push(frame);
        if pushed {
            self.state.lock().bytes_sent += len;
            self.queue_notify.notify_one();
        }
        pushed
    }

    /// Next frame to send on the WebSocket, response prefix already
    /// applied. Returns None once the session is closed; frames still
    /// queued at close are dropped.
    pub async fn next_frame(&self) -> Option<Vec<u8>> {
        loop {
            let notified = self.queue_notify.notified();
            {
                if self.state.lock().closed {
                    return None;
                }
                if let Some(frame) = self.queue.lock().pop() {
                    return Some(frame);
                }
            }
            notified.await;
        }
    }

    /// Tear down every sub-connection and mark the session closed.
    /// Idempotent.
    pub fn close(&self) {
        let subs: Vec<SubConn> = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
            state.ended.clear();
            state.residue.clear();
            state.conns.drain().map(|(_, sub)| sub).collect()
        };
        for mut sub in subs {
            if let Some(handle) = sub.pipe.take() {
                handle.abort();
            }
        }
        self.queue_notify.notify_one();
    }

    pub fn is_idle(&self, threshold: Duration) -> bool {
        let state = self.state.lock();
        state.conns.is_empty() && state.last_activity.elapsed() > threshold
    }

    pub fn stats(&self) -> SessionStats {
        let state = self.state.lock();
        SessionStats {
            total_tcp: state.total_tcp,
            total_udp: state.total_udp,
            bytes_sent: state.bytes_sent,
            bytes_received: state.bytes_received,
            active: state.conns.len(),
            limit_reached: state.limit_reached,
        }
    }

    #[cfg(test)]
    fn ended_len(&self) -> usize {
        self.state.lock().ended.len()
    }
}
