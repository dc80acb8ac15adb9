use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, PoisonError,
    },
    time::Duration,
};

use futures::future::{self, BoxFuture, FutureExt};
use shared::{
    domain::ResourceId,
    protocol::{DispatchOptions, Response},
};
use tokio::{runtime::Handle, sync::oneshot, task::JoinHandle};
use tracing::{debug, info, warn};

pub mod config;
pub mod error;
pub mod transport;

pub use config::{load_settings, load_settings_from, DispatcherSettings};
pub use error::{DispatchError, TransportError};
pub use tokio_util::sync::CancellationToken;
pub use transport::{HttpTransport, Transport, TransportRequest};

pub type DispatchResult = Result<Option<Response>, DispatchError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchPhase {
    Idle,
    Pending,
    InFlight,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub issued: u64,
    pub dispatched: u64,
    /// Includes released calls.
    pub superseded: u64,
    pub failed: u64,
}

#[derive(Default)]
struct Counters {
    issued: AtomicU64,
    dispatched: AtomicU64,
    superseded: AtomicU64,
    failed: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> DispatchStats {
        DispatchStats {
            issued: self.issued.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            superseded: self.superseded.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

struct PendingCall {
    seq: u64,
    resource: ResourceId,
    cancel: CancellationToken,
    fired: Arc<AtomicBool>,
    timer: JoinHandle<()>,
}

impl PendingCall {
    fn phase(&self) -> DispatchPhase {
        if self.fired.load(Ordering::SeqCst) {
            DispatchPhase::InFlight
        } else {
            DispatchPhase::Pending
        }
    }

    // The token is signaled before `fired` is read, so a timer that fires
    // concurrently still sees the cancellation and never reaches the transport.
    fn revoke(self) {
        self.cancel.cancel();
        if !self.fired.load(Ordering::SeqCst) {
            self.timer.abort();
        }
    }
}

#[derive(Default)]
struct Slot {
    next_seq: u64,
    current: Option<PendingCall>,
}

#[derive(Default)]
struct DispatcherState {
    slot: Mutex<Slot>,
    counters: Counters,
}

impl DispatcherState {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn settle(&self, seq: u64) -> bool {
        let mut slot = self.slot();
        let owns_slot = slot.current.as_ref().is_some_and(|call| call.seq == seq);
        if owns_slot {
            slot.current = None;
        }
        owns_slot
    }
}

struct ScheduledCall {
    seq: u64,
    request: TransportRequest,
    cancel: CancellationToken,
    fired: Arc<AtomicBool>,
    quiet_interval: Duration,
    transport: Arc<dyn Transport>,
    state: Arc<DispatcherState>,
    reply: oneshot::Sender<DispatchResult>,
}

/// Trailing-edge debouncer holding at most one scheduled or in-flight call.
/// `Ok(None)` from `dispatch` means the call was superseded or released.
pub struct DebouncedDispatcher {
    transport: Arc<dyn Transport>,
    quiet_interval: Duration,
    state: Arc<DispatcherState>,
}

impl DebouncedDispatcher {
    pub fn new(transport: Arc<dyn Transport>, settings: DispatcherSettings) -> Self {
        Self {
            transport,
            quiet_interval: settings.quiet_interval(),
            state: Arc::new(DispatcherState::default()),
        }
    }

    pub fn with_http(
        server_url: &str,
        settings: DispatcherSettings,
    ) -> Result<Self, TransportError> {
        let transport = HttpTransport::with_base_url(server_url)?;
        Ok(Self::new(Arc::new(transport), settings))
    }

    pub fn quiet_interval(&self) -> Duration {
        self.quiet_interval
    }

    // Scheduling happens here, not on first poll; dropping the future does
    // not cancel the call.
    pub fn dispatch(
        &self,
        resource: &str,
        options: DispatchOptions,
    ) -> BoxFuture<'static, DispatchResult> {
        let resource = match ResourceId::parse(resource) {
            Ok(resource) => resource,
            Err(err) => return future::ready(Err(err.into())).boxed(),
        };
        let Ok(runtime) = Handle::try_current() else {
            return future::ready(Err(DispatchError::NoRuntime)).boxed();
        };
        Counters::bump(&self.state.counters.issued);

        let cancel = CancellationToken::new();
        let fired = Arc::new(AtomicBool::new(false));
        let (reply, outcome) = oneshot::channel();

        let mut slot = self.state.slot();
        if let Some(previous) = slot.current.take() {
            info!(
                "dispatch: superseded seq={} resource={} phase={:?}",
                previous.seq,
                previous.resource,
                previous.phase()
            );
            Counters::bump(&self.state.counters.superseded);
            previous.revoke();
        }
        slot.next_seq += 1;
        let seq = slot.next_seq;
        let timer = runtime.spawn(run_scheduled(ScheduledCall {
            seq,
            request: TransportRequest {
                resource: resource.clone(),
                options,
            },
            cancel: cancel.clone(),
            fired: fired.clone(),
            quiet_interval: self.quiet_interval,
            transport: self.transport.clone(),
            state: self.state.clone(),
            reply,
        }));
        slot.current = Some(PendingCall {
            seq,
            resource: resource.clone(),
            cancel: cancel.clone(),
            fired,
            timer,
        });
        drop(slot);

        debug!(
            "dispatch: scheduled seq={seq} resource={resource} delay_ms={}",
            self.quiet_interval.as_millis()
        );

        let state = self.state.clone();
        async move {
            match outcome.await {
                Ok(result) => result,
                // Aborted before the timer fired.
                Err(_) if cancel.is_cancelled() => Ok(None),
                Err(_) => {
                    // The task died without replying (transport panic or
                    // runtime shutdown); free the slot it still holds.
                    if state.settle(seq) {
                        Counters::bump(&state.counters.failed);
                    }
                    warn!("dispatch: scheduled call vanished seq={seq} resource={resource}");
                    Err(DispatchError::Abandoned {
                        resource: resource.to_string(),
                    })
                }
            }
        }
        .boxed()
    }

    pub fn release(&self) {
        let mut slot = self.state.slot();
        if let Some(call) = slot.current.take() {
            info!(
                "dispatch: released seq={} resource={} phase={:?}",
                call.seq,
                call.resource,
                call.phase()
            );
            Counters::bump(&self.state.counters.superseded);
            call.revoke();
        }
    }

    pub fn phase(&self) -> DispatchPhase {
        self.state
            .slot()
            .current
            .as_ref()
            .map_or(DispatchPhase::Idle, PendingCall::phase)
    }

    pub fn stats(&self) -> DispatchStats {
        self.state.counters.snapshot()
    }
}

impl Drop for DebouncedDispatcher {
    fn drop(&mut self) {
        self.release();
    }
}

async fn run_scheduled(call: ScheduledCall) {
    let ScheduledCall {
        seq,
        request,
        cancel,
        fired,
        quiet_interval,
        transport,
        state,
        reply,
    } = call;

    tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            let _ = reply.send(Ok(None));
            return;
        }
        _ = tokio::time::sleep(quiet_interval) => {}
    }

    fired.store(true, Ordering::SeqCst);
    if cancel.is_cancelled() {
        debug!("dispatch: timer fired after cancellation seq={seq}");
        let _ = reply.send(Ok(None));
        return;
    }

    let resource = request.resource.clone();
    debug!("dispatch: sending seq={seq} resource={resource}");
    Counters::bump(&state.counters.dispatched);
    let result = transport.send(request, cancel).await;

    let outcome = if state.settle(seq) {
        match result {
            Ok(response) => {
                debug!(
                    "dispatch: settled seq={seq} resource={resource} status={}",
                    response.status
                );
                Ok(Some(response))
            }
            Err(err) => {
                warn!("dispatch: transport failed seq={seq} resource={resource}: {err}");
                Counters::bump(&state.counters.failed);
                Err(err.into())
            }
        }
    } else {
        debug!("dispatch: dropping stale result seq={seq} resource={resource}");
        Ok(None)
    };
    let _ = reply.send(outcome);
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
