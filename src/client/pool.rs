use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use compact_str::CompactString;
use event_listener::Event as Notify;
use tokio::time::Instant;

use super::{Connection, KillSwitch};
use crate::parser::headers::ResponseHead;
use crate::sink::ErrorSink;
use crate::transport::Connector;
use crate::{Error, PoolConfig};


/// Bounds a caller places on the connection it acquires.
///
/// A connection keeps the strictest bounds ever requested for it.
#[derive(Debug, Clone, Copy, Default)]
#[non_exhaustive]
pub struct AcquireOptions {
    /// The connection is closed instead of being reused after this instant.
    pub use_till: Option<Instant>,
    /// The connection carries at most this many more requests, including
    /// the current one.
    pub use_n_times: Option<u32>,
}

impl AcquireOptions {
    /// Creates [`AcquireOptions`] with the given bounds.
    #[must_use]
    pub fn new(use_till: Option<Instant>, use_n_times: Option<u32>) -> Self {
        Self { use_till, use_n_times }
    }
}


/// Reuse bounds that stay with a connection.
#[derive(Debug, Clone, Copy)]
struct Limits {
    use_till: Option<Instant>,
    /// Remaining requests after the current one.
    uses_left: Option<u32>,
}

impl Limits {
    fn tighten(&mut self, opts: AcquireOptions) {
        self.use_till = min_opt(self.use_till, opts.use_till);
        self.uses_left = min_opt(self.uses_left, opts.use_n_times);
    }
}

fn min_opt<T: Ord>(a: Option<T>, b: Option<T>) -> Option<T> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

#[derive(Debug)]
struct Idle {
    conn: Connection,
    limits: Limits,
    /// When the connection became idle.
    since: Instant,
    idle_till: Instant,
}

impl Idle {
    fn is_expired(&self, now: Instant) -> bool {
        now >= self.idle_till || self.limits.use_till.is_some_and(|t| now >= t)
    }
}

#[derive(Debug)]
struct Busy {
    dest: Arc<str>,
    request_till: Instant,
    kill: Arc<KillSwitch>,
}

#[derive(Debug, Default)]
struct State {
    max_conns: usize,
    /// Admitted callers, with or without a connection yet.
    busy: usize,
    busy_conns: HashMap<u64, Busy>,
    idle: HashMap<Arc<str>, VecDeque<Idle>>,
    /// Tickets of waiting callers, in arrival order.
    queue: VecDeque<u64>,
    next_id: u64,
    sweeping: bool,
}

impl State {
    fn idle_count(&self) -> usize {
        self.idle.values().map(VecDeque::len).sum()
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// Removes the oldest idle connections while the pool is over capacity.
    fn evict(&mut self, closed: &mut Vec<Idle>) {
        while self.busy + self.idle_count() > self.max_conns {
            let oldest = self.idle.iter()
                .filter_map(|(dest, conns)| Some((dest, conns.front()?.since)))
                .min_by_key(|&(_, since)| since)
                .map(|(dest, _)| dest.clone());
            let Some(idle) = oldest.and_then(|d| self.idle.get_mut(&d)?.pop_front()) else { break };
            closed.push(idle);
        }
        self.idle.retain(|_, conns| !conns.is_empty());
    }
}


#[derive(Debug)]
struct Shared {
    config: PoolConfig,
    state: Mutex<State>,
    /// Notified whenever an admission slot frees up.
    slot_freed: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Waits in line for an admission slot.
    async fn admit(self: &Arc<Self>) -> Admission {
        let mut ticket = Ticket { shared: self, id: 0, admitted: false };
        {
            let mut state = self.lock();
            ticket.id = state.next_id();
            state.queue.push_back(ticket.id);
        }

        loop {
            let listener = {
                let mut state = self.lock();
                if state.queue.front() == Some(&ticket.id) && state.busy < state.max_conns {
                    state.queue.pop_front();
                    state.busy += 1;
                    ticket.admitted = true;
                    if !state.queue.is_empty() && state.busy < state.max_conns {
                        self.slot_freed.notify(usize::MAX);
                    }
                    return Admission { shared: self.clone(), armed: true };
                }
                self.slot_freed.listen()
            };
            listener.await;
        }
    }

    /// Pops the most recently used idle connection to `dest`, discarding
    /// expired ones.
    fn take_idle(&self, dest: &str, now: Instant) -> Option<Idle> {
        let mut expired = Vec::new();
        let found = {
            let mut state = self.lock();
            let conns = state.idle.get_mut(dest)?;
            let found = loop {
                match conns.pop_back() {
                    Some(idle) if idle.is_expired(now) => expired.push(idle),
                    other => break other,
                }
            };
            if conns.is_empty() {
                state.idle.remove(dest);
            }
            found
        };
        if !expired.is_empty() {
            tracing::debug!(dest, count = expired.len(), "expired idle connections closed");
        }
        found
    }

    fn ensure_sweep(self: &Arc<Self>, state: &mut State) {
        if state.sweeping {
            return;
        }
        state.sweeping = true;
        tokio::spawn(sweep(Arc::downgrade(self), self.config.sweep_interval));
    }

    /// Closes expired connections and kills timed out requests. Returns
    /// whether any connections are left to watch.
    fn sweep_once(&self, now: Instant) -> bool {
        let mut closed = Vec::new();
        let mut state = self.lock();
        for (dest, conns) in &mut state.idle {
            let before = conns.len();
            conns.retain(|idle| !idle.is_expired(now));
            if conns.len() < before {
                tracing::debug!(dest = &**dest, count = before - conns.len(), "expired idle connections closed");
            }
        }
        for busy in state.busy_conns.values() {
            if now >= busy.request_till && !busy.kill.is_killed() {
                tracing::warn!(dest = &*busy.dest, "FastCGI request timed out");
                busy.kill.kill();
            }
        }
        state.evict(&mut closed);

        let tracked = state.busy > 0 || !state.idle.is_empty();
        if !tracked {
            state.sweeping = false;
        }
        drop(state);
        if !closed.is_empty() {
            tracing::debug!(count = closed.len(), "idle connections evicted");
        }
        tracked
    }

    fn release(&self, id: u64, dest: &str, conn: Connection, limits: Limits, want_close: bool) {
        let now = Instant::now();
        let mut state = self.lock();
        state.busy_conns.remove(&id);
        state.busy = state.busy.saturating_sub(1);

        let reason = if want_close {
            Some("closed by owner")
        } else if !conn.is_reusable() {
            Some("not reusable")
        } else if limits.uses_left == Some(0) {
            Some("use count exhausted")
        } else if limits.use_till.is_some_and(|t| now >= t) {
            Some("expired")
        } else {
            None
        };

        match reason {
            Some(reason) => tracing::debug!(dest, reason, "connection closed"),
            None => {
                let idle_till = now + self.config.keep_alive_timeout;
                let idle = Idle { conn, limits, since: now, idle_till };
                state.idle.entry(dest.into()).or_default().push_back(idle);
            },
        }
        drop(state);
        self.slot_freed.notify(usize::MAX);
    }
}

async fn sweep(shared: Weak<Shared>, period: std::time::Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else { return };
        if !shared.sweep_once(Instant::now()) {
            return;
        }
    }
}


/// A caller's position in the admission queue. Leaves the queue when
/// dropped before admission.
struct Ticket<'a> {
    shared: &'a Shared,
    id: u64,
    admitted: bool,
}

impl Drop for Ticket<'_> {
    fn drop(&mut self) {
        if !self.admitted {
            self.shared.lock().queue.retain(|&t| t != self.id);
            self.shared.slot_freed.notify(usize::MAX);
        }
    }
}

/// An admission slot. Freed when dropped while armed.
struct Admission {
    shared: Arc<Shared>,
    armed: bool,
}

impl Drop for Admission {
    fn drop(&mut self) {
        if self.armed {
            let mut state = self.shared.lock();
            state.busy = state.busy.saturating_sub(1);
            drop(state);
            self.shared.slot_freed.notify(usize::MAX);
        }
    }
}


/// A pool of client connections, keyed by destination.
///
/// At most `PoolConfig::max_conns` connections are in use at a time. Callers
/// beyond this limit wait in line. Idle connections are reused until they
/// expire after `PoolConfig::keep_alive_timeout`. A background task closes
/// expired connections and fails requests running longer than
/// `PoolConfig::request_timeout` with [`Error::RequestTimeout`]. It only runs
/// while the pool tracks any connections.
pub struct Pool<C: Connector> {
    shared: Arc<Shared>,
    connector: Arc<C>,
    sink: Arc<dyn ErrorSink>,
}

impl<C: Connector> Pool<C> {
    /// Creates an empty [`Pool`] opening connections through `connector`.
    /// Stderr output of all requests is reported to `sink`.
    #[must_use]
    pub fn new(config: PoolConfig, connector: C, sink: Arc<dyn ErrorSink>) -> Self {
        let state = State { max_conns: config.max_conns, ..State::default() };
        let shared = Arc::new(Shared { config, state: Mutex::new(state), slot_freed: Notify::new() });
        Self { shared, connector: Arc::new(connector), sink }
    }

    /// Returns the [`Connector`] of this pool.
    #[inline]
    #[must_use]
    pub fn connector(&self) -> &C {
        &self.connector
    }

    /// Returns the number of idle connections.
    #[must_use]
    pub fn idle_connections(&self) -> usize {
        self.shared.lock().idle_count()
    }

    /// Returns the number of connections in use.
    #[must_use]
    pub fn busy_connections(&self) -> usize {
        self.shared.lock().busy
    }

    /// Returns the number of callers waiting for a connection.
    #[must_use]
    pub fn waiting(&self) -> usize {
        self.shared.lock().queue.len()
    }

    /// Changes the maximum number of connections. Idle connections beyond
    /// the new limit are closed, oldest first.
    pub fn set_max_conns(&self, max_conns: usize) {
        let mut closed = Vec::new();
        let mut state = self.shared.lock();
        state.max_conns = max_conns;
        state.evict(&mut closed);
        drop(state);
        if !closed.is_empty() {
            tracing::debug!(count = closed.len(), max_conns, "idle connections evicted");
        }
        self.shared.slot_freed.notify(usize::MAX);
    }

    /// Acquires a connection to `dest`, reusing an idle one if possible.
    ///
    /// Waits in line while all connections are in use.
    ///
    /// # Errors
    /// Fails with [`Error::ConnectTimeout`] if a new connection could not be
    /// established in time. Connect errors are forwarded.
    pub async fn acquire(&self, dest: &str, opts: AcquireOptions) -> Result<Lease, Error> {
        let mut admission = self.shared.admit().await;
        let now = Instant::now();

        let (conn, mut limits) = match self.shared.take_idle(dest, now) {
            Some(idle) => (idle.conn, idle.limits),
            None => {
                let conn = self.connect(dest).await?;
                (conn, Limits { use_till: None, uses_left: self.shared.config.keep_alive_max })
            },
        };
        limits.tighten(opts);
        limits.uses_left = limits.uses_left.map(|n| n.saturating_sub(1));

        let request_till = Instant::now() + self.shared.config.request_timeout;
        let dest: Arc<str> = dest.into();
        let busy = Busy { dest: dest.clone(), request_till, kill: conn.kill.clone() };
        let id = {
            let mut state = self.shared.lock();
            let id = state.next_id();
            state.busy_conns.insert(id, busy);
            self.shared.ensure_sweep(&mut state);
            id
        };
        admission.armed = false;

        let reused = conn.uses() > 0;
        Ok(Lease { shared: self.shared.clone(), id, dest, conn: Some(conn), limits, reused, want_close: false })
    }

    async fn connect(&self, dest: &str) -> Result<Connection, Error> {
        let timeout = self.shared.config.connect_timeout;
        // Dropping the connect future on timeout closes any socket it opened
        match tokio::time::timeout(timeout, self.connector.connect(dest)).await {
            Ok(Ok((reader, writer))) => {
                tracing::debug!(dest, "connection established");
                Ok(Connection::new(&self.shared.config, reader, writer, self.sink.clone()))
            },
            Ok(Err(e)) => {
                tracing::debug!(dest, error = %e, "connecting failed");
                Err(e.into())
            },
            Err(_) => {
                tracing::debug!(dest, ?timeout, "connecting timed out");
                Err(Error::ConnectTimeout)
            },
        }
    }
}

impl<C: Connector> Clone for Pool<C> {
    fn clone(&self) -> Self {
        Self { shared: self.shared.clone(), connector: self.connector.clone(), sink: self.sink.clone() }
    }
}

impl<C: Connector> fmt::Debug for Pool<C> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Pool")
            .field("max_conns", &state.max_conns)
            .field("busy", &state.busy)
            .field("idle", &state.idle_count())
            .field("waiting", &state.queue.len())
            .finish_non_exhaustive()
    }
}


/// A connection acquired from a [`Pool`].
///
/// Dropping the [`Lease`] returns the connection to the pool, which keeps it
/// for reuse if its last response was read completely.
pub struct Lease {
    shared: Arc<Shared>,
    id: u64,
    dest: Arc<str>,
    conn: Option<Connection>,
    limits: Limits,
    reused: bool,
    want_close: bool,
}

impl Lease {
    /// Returns the destination of this connection.
    #[inline]
    #[must_use]
    pub fn dest(&self) -> &str {
        &self.dest
    }

    /// Tests whether the connection carried requests before this lease.
    #[inline]
    #[must_use]
    pub fn is_reused(&self) -> bool {
        self.reused
    }

    /// Closes the connection instead of returning it to the pool.
    pub fn close(&mut self) {
        self.want_close = true;
    }

    fn conn(&mut self) -> Result<&mut Connection, Error> {
        self.conn.as_mut().ok_or(Error::Terminated)
    }

    /// Returns the EndRequest body of the current response once it ended.
    #[must_use]
    pub fn end(&self) -> Option<crate::protocol::body::EndRequest> {
        self.conn.as_ref().and_then(Connection::end)
    }

    /// See `Connection::write_request`.
    ///
    /// # Errors
    /// See `Connection::write_request`.
    pub async fn write_request<N, V, B>(
        &mut self, params: impl IntoIterator<Item = (N, V)>, body: B, keep_conn: bool,
    ) -> Result<u16, Error>
    where
        N: AsRef<[u8]>,
        V: AsRef<[u8]>,
        B: futures_util::AsyncRead + Unpin,
    {
        self.conn()?.write_request(params, body, keep_conn).await
    }

    /// See `Connection::read_head`.
    ///
    /// # Errors
    /// See `Connection::read_head`.
    pub async fn read_head(&mut self) -> Result<ResponseHead, Error> {
        self.conn()?.read_head().await
    }

    /// See `Connection::read_body`.
    ///
    /// # Errors
    /// See `Connection::read_head`.
    pub async fn read_body(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        self.conn()?.read_body(buf).await
    }

    /// See `Connection::get_values`.
    ///
    /// # Errors
    /// See `Connection::get_values`.
    pub async fn get_values(&mut self, names: &[&str]) -> Result<HashMap<CompactString, CompactString>, Error> {
        self.conn()?.get_values(names).await
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if let Some(conn) = self.conn.take() {
            self.shared.release(self.id, &self.dest, conn, self.limits, self.want_close);
        }
    }
}

impl fmt::Debug for Lease {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Lease")
            .field("dest", &self.dest)
            .field("conn", &self.conn)
            .field("reused", &self.reused)
            .finish_non_exhaustive()
    }
}
