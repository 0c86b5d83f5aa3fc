//! Admission control for inbound connections.
//!
//! [`AdmissionGate`] owns the raw TCP listener and hands out
//! [`AdmittedConnection`]s only while a capacity slot is available. Every
//! admitted connection holds one slot and gives it back exactly once, when it
//! is closed or dropped. On shutdown the gate stops admitting and
//! [`AdmissionGate::wait`] lets the caller join until the last admitted
//! connection is gone.
use std::{
    fmt,
    future::Future,
    io,
    net::SocketAddr,
    pin::Pin,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicUsize, Ordering},
    },
    task::{Context, Poll},
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf},
    net::{TcpListener, TcpStream, ToSocketAddrs},
    sync::{Notify, OwnedSemaphorePermit, Semaphore},
    time::timeout,
};
use tokio_util::sync::CancellationToken;

/// Errors produced on the accept path of the gate.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum GateError {
    /// The gate has been closed; no further connections are admitted.
    #[error("listener closed")]
    ListenerClosed,

    /// No capacity slot became free within the configured accept timeout.
    #[error("admission denied: no capacity slot freed within {0:?}")]
    AdmissionDenied(Duration),

    /// The underlying listener reported an I/O error.
    #[error("accept failed: {0}")]
    Accept(#[from] io::Error),

    /// Shutting down an admitted connection failed.
    #[error("close failed: {0}")]
    Close(io::Error),
}

/// Observability hook invoked for accept and close failures.
pub type ErrorCallback = Arc<dyn Fn(&GateError) + Send + Sync>;

/// Construction parameters for [`AdmissionGate`].
#[derive(Clone)]
pub struct AdmissionGateConfig {
    /// Maximum number of simultaneously open admitted connections.
    pub limit: usize,
    /// How long `accept` may wait for a free slot before denying admission.
    /// `None` waits indefinitely.
    pub accept_timeout: Option<Duration>,
    pub error_callback: Option<ErrorCallback>,
}

impl AdmissionGateConfig {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            accept_timeout: None,
            error_callback: None,
        }
    }

    pub fn with_accept_timeout(mut self, accept_timeout: Duration) -> Self {
        self.accept_timeout = Some(accept_timeout);
        self
    }

    pub fn with_error_callback(
        mut self,
        callback: impl Fn(&GateError) + Send + Sync + 'static,
    ) -> Self {
        self.error_callback = Some(Arc::new(callback));
        self
    }
}

impl fmt::Debug for AdmissionGateConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGateConfig")
            .field("limit", &self.limit)
            .field("accept_timeout", &self.accept_timeout)
            .field("error_callback", &self.error_callback.is_some())
            .finish()
    }
}

/// The raw listener a gate admits connections from.
///
/// `accept` takes `&self` so a pending accept can be raced against close.
pub trait AcceptSource: Send + Sync + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    fn accept(&self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl AcceptSource for TcpListener {
    type Io = TcpStream;

    fn accept(&self) -> impl Future<Output = io::Result<(TcpStream, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Slot bookkeeping shared between the gate and its connections.
struct GateState {
    slots: Arc<Semaphore>,
    in_use: AtomicUsize,
    drained: Notify,
    error_callback: Option<ErrorCallback>,
}

impl GateState {
    fn report(&self, err: &GateError) {
        if let Some(callback) = &self.error_callback {
            callback(err);
        }
    }
}

/// A capacity-limited listener.
///
/// The gate is the only place `accept` is ever called on the wrapped
/// listener. At no point are more than `limit` admitted connections open.
pub struct AdmissionGate<L: AcceptSource = TcpListener> {
    listener: Mutex<Option<Arc<L>>>,
    local_addr: SocketAddr,
    limit: usize,
    accept_timeout: Option<Duration>,
    closing: CancellationToken,
    state: Arc<GateState>,
}

impl AdmissionGate<TcpListener> {
    /// Bind a TCP listener on `addr` and wrap it in a gate.
    pub async fn bind(addr: impl ToSocketAddrs, config: AdmissionGateConfig) -> io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Self::new(listener, config)
    }
}

impl<L: AcceptSource> AdmissionGate<L> {
    /// Wrap an already bound listener. The gate takes exclusive ownership.
    pub fn new(listener: L, config: AdmissionGateConfig) -> io::Result<Self> {
        let local_addr = listener.local_addr()?;

        tracing::info!(
            address = %local_addr,
            limit = config.limit,
            accept_timeout = ?config.accept_timeout,
            "Admission gate listening"
        );

        Ok(Self {
            listener: Mutex::new(Some(Arc::new(listener))),
            local_addr,
            limit: config.limit,
            accept_timeout: config.accept_timeout,
            closing: CancellationToken::new(),
            state: Arc::new(GateState {
                slots: Arc::new(Semaphore::new(config.limit)),
                in_use: AtomicUsize::new(0),
                drained: Notify::new(),
                error_callback: config.error_callback,
            }),
        })
    }

    /// Admit the next inbound connection.
    ///
    /// Waits for a capacity slot first and only then for the raw listener.
    /// The slot counts as in use from the moment it is reserved, so a
    /// concurrent [`AdmissionGate::wait`] cannot return underneath a pending
    /// accept. Every error path hands the slot back before returning.
    pub async fn accept(&self) -> Result<AdmittedConnection<L::Io>, GateError> {
        if self.closing.is_cancelled() {
            return Err(GateError::ListenerClosed);
        }

        let permit = self.acquire_slot().await?;
        let slot = SlotGuard::reserve(permit, &self.state);

        let Some(listener) = self.current_listener() else {
            return Err(GateError::ListenerClosed);
        };

        let accepted = tokio::select! {
            biased;
            _ = self.closing.cancelled() => return Err(GateError::ListenerClosed),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer_addr)) => {
                // A connection that raced with close() is refused rather than
                // admitted. The slot is already counted and this check takes
                // the lock close() takes, so wait() cannot miss it.
                if self.current_listener().is_none() {
                    return Err(GateError::ListenerClosed);
                }

                tracing::debug!(
                    peer_addr = %peer_addr,
                    in_use = self.in_use(),
                    limit = self.limit,
                    "Connection admitted"
                );

                Ok(AdmittedConnection {
                    stream,
                    peer_addr,
                    slot,
                    closed: false,
                })
            }
            Err(e) => {
                drop(slot);
                let err = GateError::Accept(e);
                tracing::warn!(error = %err, "Raw accept failed, slot released");
                self.state.report(&err);
                Err(err)
            }
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, GateError> {
        let acquire = self.state.slots.clone().acquire_owned();

        let acquired = match self.accept_timeout {
            Some(limit) => tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Err(GateError::ListenerClosed),
                acquired = timeout(limit, acquire) => match acquired {
                    Ok(acquired) => acquired,
                    Err(_) => {
                        let err = GateError::AdmissionDenied(limit);
                        tracing::warn!(
                            limit = self.limit,
                            waited = ?limit,
                            "Admission denied: gate at capacity"
                        );
                        self.state.report(&err);
                        return Err(err);
                    }
                },
            },
            None => tokio::select! {
                biased;
                _ = self.closing.cancelled() => return Err(GateError::ListenerClosed),
                acquired = acquire => acquired,
            },
        };

        // The semaphore is only ever closed by `close`.
        acquired.map_err(|_| GateError::ListenerClosed)
    }

    fn current_listener(&self) -> Option<Arc<L>> {
        self.listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Stop admitting and drop the raw listener.
    ///
    /// Idempotent. Connections that are already open are left alone; use
    /// [`AdmissionGate::wait`] to join them.
    pub fn close(&self) {
        if self.closing.is_cancelled() {
            return;
        }

        self.closing.cancel();
        self.state.slots.close();
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(listener);

        tracing::info!(
            address = %self.local_addr,
            in_use = self.in_use(),
            "Admission gate closed"
        );
    }

    /// Wait until every admitted connection has been closed.
    pub async fn wait(&self) {
        loop {
            let drained = self.state.drained.notified();
            tokio::pin!(drained);
            // Register before checking so a release in between is not missed.
            drained.as_mut().enable();

            if self.in_use() == 0 {
                tracing::debug!("Admission gate drained");
                return;
            }

            drained.await;
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closing.is_cancelled()
    }

    /// Slots currently held: admitted connections that have not been closed
    /// yet, plus the slot of an accept that is waiting on the raw listener.
    pub fn in_use(&self) -> usize {
        self.state.in_use.load(Ordering::SeqCst)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }
}

impl<L: AcceptSource> fmt::Debug for AdmissionGate<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmissionGate")
            .field("local_addr", &self.local_addr)
            .field("limit", &self.limit)
            .field("in_use", &self.in_use())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One capacity slot held by an admitted connection.
struct SlotGuard {
    permit: Option<OwnedSemaphorePermit>,
    state: Arc<GateState>,
}

impl SlotGuard {
    /// Count `permit` as in use until the guard is released.
    fn reserve(permit: OwnedSemaphorePermit, state: &Arc<GateState>) -> Self {
        state.in_use.fetch_add(1, Ordering::SeqCst);
        Self {
            permit: Some(permit),
            state: state.clone(),
        }
    }

    /// Give the slot back. Only the first call has any effect.
    fn release(&mut self) {
        let Some(permit) = self.permit.take() else {
            return;
        };

        // Decrement before the permit returns so a new admission can never
        // push the counter past the limit.
        let previous = self.state.in_use.fetch_sub(1, Ordering::SeqCst);
        drop(permit);

        tracing::debug!(in_use = previous - 1, "Connection slot released");

        if previous == 1 {
            self.state.drained.notify_waiters();
        }
    }
}

impl Drop for SlotGuard {
    fn drop(&mut self) {
        self.release();
    }
}

/// A connection admitted through an [`AdmissionGate`].
///
/// Reads and writes go straight to the wrapped stream. The capacity slot is
/// returned on [`AdmittedConnection::close`] or on drop, whichever happens
/// first.
pub struct AdmittedConnection<S = TcpStream> {
    stream: S,
    peer_addr: SocketAddr,
    slot: SlotGuard,
    closed: bool,
}

impl<S: AsyncWrite + Unpin> AdmittedConnection<S> {
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Shut down the write side and release the slot.
    ///
    /// Repeated calls are no-ops. The slot is released even when the
    /// shutdown itself fails; the failure goes to the gate's error callback
    /// and is returned.
    pub async fn close(&mut self) -> Result<(), GateError> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;

        let shutdown = self.stream.shutdown().await;
        self.slot.release();

        shutdown.map_err(|e| {
            let err = GateError::Close(e);
            self.slot.state.report(&err);
            err
        })
    }
}

impl<S> fmt::Debug for AdmittedConnection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdmittedConnection")
            .field("peer_addr", &self.peer_addr)
            .field("closed", &self.closed)
            .finish()
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for AdmittedConnection<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for AdmittedConnection<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.get_mut().stream).poll_shutdown(cx)
    }

    fn poll_write_vectored(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.get_mut().stream).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.stream.is_write_vectored()
    }
}
