//! Serial execution context
//!
//! Every AVCTP operation, L2CAP notification and security result runs on one
//! worker thread that owns the `AvctCore`. API calls post a closure and wait
//! for its answer on a one-shot channel; transport notifications are posted
//! without waiting.
//!
//! Security results are one-shot and must never be lost to a full queue.
//! From other threads they wait for queue space; from the worker itself
//! they go on an overflow list that is drained after the current task.

use log::{debug, error, info, warn};
use std::cell::Cell;
use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::{AvctConfig, DispatcherConfig};
use crate::core::{AvctCore, TransportEvent};
use crate::error::{AvctError, AvctResult};
use crate::l2cap::{L2capEvent, L2capService};
use crate::security::SecurityService;
use crate::types::{BdAddr, CommandResponse, ConnectParams, ConnectionId, Role};

type Job = Box<dyn FnOnce(&mut AvctCore) + Send + 'static>;

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

/// Work item for the AVCTP thread
pub(crate) enum Task {
    Run(Job),
    Transport(TransportEvent),
    Shutdown,
}

/// Handle used by collaborators to post notifications to the AVCTP thread
#[derive(Clone)]
pub struct EventSender {
    tx: SyncSender<Task>,
    overflow: Arc<Mutex<VecDeque<TransportEvent>>>,
}

impl EventSender {
    pub(crate) fn new(tx: SyncSender<Task>) -> Self {
        Self {
            tx,
            overflow: Arc::default(),
        }
    }

    fn overflow(&self) -> MutexGuard<'_, VecDeque<TransportEvent>> {
        self.overflow.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn post(&self, task: Task) -> AvctResult<()> {
        self.tx.try_send(task).map_err(|e| match e {
            TrySendError::Full(_) => AvctError::NoResources("task queue slot"),
            TrySendError::Disconnected(_) => AvctError::Shutdown,
        })
    }

    /// Queue a completion that has no other way of being retried
    pub(crate) fn post_completion(&self, event: TransportEvent) -> AvctResult<()> {
        if ON_WORKER.with(Cell::get) {
            self.overflow().push_back(event);
            return Ok(());
        }
        self.tx
            .send(Task::Transport(event))
            .map_err(|_| AvctError::Shutdown)
    }

    /// Next completion queued by the worker on itself
    pub(crate) fn take_overflow(&self) -> Option<TransportEvent> {
        self.overflow().pop_front()
    }

    /// Queue an L2CAP notification
    pub fn post_l2cap(&self, event: L2capEvent) -> AvctResult<()> {
        self.post(Task::Transport(TransportEvent::L2cap(event)))
    }
}

/// A running AVCTP instance
///
/// Dropping it stops the worker thread.
pub struct Avctp {
    sender: EventSender,
    timeout: Duration,
    worker: Option<JoinHandle<()>>,
}

impl Avctp {
    /// Spawn the AVCTP thread
    pub fn start(
        l2cap: Arc<dyn L2capService>,
        security: Arc<dyn SecurityService>,
        config: DispatcherConfig,
    ) -> AvctResult<Self> {
        config.validate()?;

        let (tx, rx) = mpsc::sync_channel(config.queue_capacity);
        let sender = EventSender::new(tx);
        let core = AvctCore::new(l2cap, security, sender.clone());

        let worker = thread::Builder::new()
            .name(config.thread_name.clone())
            .spawn(move || run(core, rx))
            .map_err(|e| AvctError::Spawn(e.to_string()))?;

        info!("AVCTP thread '{}' started", config.thread_name);
        Ok(Self {
            sender,
            timeout: config.call_timeout,
            worker: Some(worker),
        })
    }

    /// Run `f` on the AVCTP thread and wait for its answer
    fn call<R, F>(&self, f: F) -> AvctResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut AvctCore) -> AvctResult<R> + Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        self.sender.post(Task::Run(Box::new(move |core: &mut AvctCore| {
            // The caller may have timed out and gone
            let _ = reply_tx.send(f(core));
        })))?;

        match reply_rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => {
                warn!("AVCTP call did not complete within {:?}", self.timeout);
                Err(AvctError::Timeout)
            }
            Err(RecvTimeoutError::Disconnected) => Err(AvctError::Shutdown),
        }
    }

    pub fn register(&self, config: AvctConfig) -> AvctResult<()> {
        self.call(move |core| core.register(config))
    }

    pub fn deregister(&self) -> AvctResult<()> {
        self.call(|core| core.deregister())
    }

    /// Open a logical connection; returns its handle
    ///
    /// Acceptors ignore `peer` and bind to whichever device connects first.
    pub fn connect(&self, params: ConnectParams, peer: BdAddr) -> AvctResult<ConnectionId> {
        self.call(move |core| core.connect(params, peer))
    }

    pub fn disconnect(&self, id: ConnectionId) -> AvctResult<()> {
        self.call(move |core| core.disconnect(id))
    }

    pub fn send_message(
        &self,
        id: ConnectionId,
        label: u8,
        cr: CommandResponse,
        payload: &[u8],
    ) -> AvctResult<()> {
        let payload = payload.to_vec();
        self.call(move |core| core.send_message(id, label, cr, payload))
    }

    pub fn peer_mtu(&self, id: ConnectionId) -> AvctResult<u16> {
        self.call(move |core| core.peer_mtu(id))
    }

    pub fn browsing_connect(&self, id: ConnectionId, role: Role) -> AvctResult<()> {
        self.call(move |core| core.browsing_connect(id, role))
    }

    pub fn browsing_disconnect(&self, id: ConnectionId) -> AvctResult<()> {
        self.call(move |core| core.browsing_disconnect(id))
    }

    pub fn browsing_send_message(
        &self,
        id: ConnectionId,
        label: u8,
        cr: CommandResponse,
        payload: &[u8],
    ) -> AvctResult<()> {
        let payload = payload.to_vec();
        self.call(move |core| core.browsing_send_message(id, label, cr, payload))
    }

    pub fn browsing_peer_mtu(&self, id: ConnectionId) -> AvctResult<u16> {
        self.call(move |core| core.browsing_peer_mtu(id))
    }

    /// Sender to hand to the L2CAP layer
    pub fn event_sender(&self) -> EventSender {
        self.sender.clone()
    }

    pub fn post_l2cap(&self, event: L2capEvent) -> AvctResult<()> {
        self.sender.post_l2cap(event)
    }
}

impl Drop for Avctp {
    fn drop(&mut self) {
        let Some(worker) = self.worker.take() else {
            return;
        };
        if self.sender.tx.send(Task::Shutdown).is_err() {
            debug!("AVCTP thread already gone");
        }
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            error!("AVCTP thread panicked during shutdown");
        }
    }
}

fn run(mut core: AvctCore, rx: Receiver<Task>) {
    ON_WORKER.with(|flag| flag.set(true));
    let sender = core.event_sender();

    while let Ok(task) = rx.recv() {
        let outcome = match task {
            Task::Shutdown => break,
            Task::Run(job) => panic::catch_unwind(AssertUnwindSafe(|| job(&mut core))),
            Task::Transport(event) => {
                panic::catch_unwind(AssertUnwindSafe(|| core.handle_event(event)))
            }
        };
        if outcome.is_err() {
            error!("AVCTP task panicked; continuing with the next task");
        }

        while let Some(event) = sender.take_overflow() {
            if panic::catch_unwind(AssertUnwindSafe(|| core.handle_event(event))).is_err() {
                error!("AVCTP completion panicked; continuing with the next task");
            }
        }
    }
    info!("AVCTP thread stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::AVCTP_PSM;
    use crate::error::ResultCode;
    use crate::security::{SecurityCallback, SecurityRequest};
    use crate::types::{ChannelEvent, ChannelEventKind, ChannelId, LocalRole};
    use std::time::Instant;

    #[derive(Default)]
    struct NullL2cap {
        registered: Mutex<Vec<u16>>,
    }

    impl L2capService for NullL2cap {
        fn register_service(&self, psm: u16, _events: EventSender) -> AvctResult<()> {
            self.registered.lock().unwrap().push(psm);
            Ok(())
        }
        fn deregister_service(&self, psm: u16) {
            self.registered.lock().unwrap().retain(|p| *p != psm);
        }
        fn connect_req(&self, _peer: &BdAddr, _psm: u16) -> AvctResult<ChannelId> {
            Ok(0x40)
        }
        fn connect_rsp(&self, _lcid: ChannelId, _identifier: u8, _result: u16) -> AvctResult<()> {
            Ok(())
        }
        fn config_req(&self, _lcid: ChannelId, _mtu: u16) -> AvctResult<()> {
            Ok(())
        }
        fn config_rsp(&self, _lcid: ChannelId, _identifier: u8, _result: u16) -> AvctResult<()> {
            Ok(())
        }
        fn disconnect_req(&self, _lcid: ChannelId) -> AvctResult<()> {
            Ok(())
        }
        fn disconnect_rsp(&self, _lcid: ChannelId, _identifier: u8) -> AvctResult<()> {
            Ok(())
        }
        fn send_data(&self, _lcid: ChannelId, _data: Vec<u8>) -> AvctResult<()> {
            Ok(())
        }
    }

    /// Completes every check on the calling thread after an optional delay
    struct InstantSecurity {
        delay: Duration,
        result: u16,
    }

    impl SecurityService for InstantSecurity {
        fn request_security(&self, _request: SecurityRequest, on_result: SecurityCallback) -> AvctResult<()> {
            thread::sleep(self.delay);
            on_result(self.result);
            Ok(())
        }
    }

    fn start(delay: Duration, timeout: Duration) -> (Avctp, Arc<NullL2cap>) {
        let l2cap = Arc::new(NullL2cap::default());
        let security = Arc::new(InstantSecurity { delay, result: 0 });
        let avctp = Avctp::start(
            l2cap.clone(),
            security,
            DispatcherConfig::default().with_timeout(timeout),
        )
        .unwrap();
        (avctp, l2cap)
    }

    fn params(pid: u16, role: Role, events: Arc<Mutex<Vec<ChannelEvent>>>) -> ConnectParams {
        ConnectParams::new(
            pid,
            role,
            move |event| {
                events.lock().unwrap().push(event);
                Ok(())
            },
            |_message| Ok(()),
        )
    }

    #[test]
    fn test_calls_run_on_worker() {
        let (avctp, l2cap) = start(Duration::ZERO, Duration::from_secs(2));

        assert_eq!(
            avctp.connect(params(0x110E, Role::Acceptor, Arc::default()), BdAddr::ANY),
            Err(AvctError::NotRegistered)
        );
        avctp
            .register(AvctConfig::new(672, 1008, LocalRole::Target))
            .unwrap();
        assert!(l2cap.registered.lock().unwrap().contains(&AVCTP_PSM));

        let id = avctp
            .connect(params(0x110E, Role::Acceptor, Arc::default()), BdAddr::ANY)
            .unwrap();
        assert_eq!(id, 0);
        assert_eq!(avctp.peer_mtu(id), Err(AvctError::ChannelNotOpen));
        avctp.disconnect(id).unwrap();
        avctp.deregister().unwrap();
        assert!(l2cap.registered.lock().unwrap().is_empty());
    }

    #[test]
    fn test_l2cap_events_reach_core() {
        let (avctp, _l2cap) = start(Duration::ZERO, Duration::from_secs(2));
        avctp.register(AvctConfig::default()).unwrap();

        let peer = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let id = avctp
            .connect(params(0x110E, Role::Initiator, events.clone()), peer)
            .unwrap();

        // Security completed inline and the connect request went out on 0x40
        for event in [
            L2capEvent::ConnectRsp { lcid: 0x40, result: 0 },
            L2capEvent::ConfigReq { lcid: 0x40, identifier: 1, mtu: 512 },
            L2capEvent::ConfigRsp { lcid: 0x40, result: 0 },
        ] {
            avctp.post_l2cap(event).unwrap();
        }

        // Calls are serialized behind the posted events
        assert_eq!(avctp.peer_mtu(id), Ok(512));
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChannelEventKind::ConnectConfirm);
        assert!(events[0].result.is_success());
    }

    #[test]
    fn test_connect_times_out_behind_slow_security() {
        let l2cap = Arc::new(NullL2cap::default());
        let security = Arc::new(InstantSecurity {
            delay: Duration::from_millis(400),
            result: 0,
        });
        let avctp = Avctp::start(
            l2cap,
            security,
            DispatcherConfig::default().with_timeout(Duration::from_millis(50)),
        )
        .unwrap();

        // The registration call may itself race the short timeout
        let _ = avctp.register(AvctConfig::default());
        thread::sleep(Duration::from_millis(100));

        let peer = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let result = avctp.connect(params(0x110E, Role::Initiator, Arc::default()), peer);
        assert_eq!(result, Err(AvctError::Timeout));
    }

    #[test]
    fn test_worker_survives_panicking_task() {
        let (avctp, _l2cap) = start(Duration::ZERO, Duration::from_millis(500));

        let result = avctp.call(|_core| -> AvctResult<()> { panic!("boom") });
        assert_eq!(result, Err(AvctError::Shutdown));

        avctp.register(AvctConfig::default()).unwrap();
    }

    #[test]
    fn test_security_result_kept_when_queue_is_full() {
        let security = Arc::new(InstantSecurity {
            delay: Duration::ZERO,
            result: 0x0005,
        });
        let avctp = Avctp::start(
            Arc::new(NullL2cap::default()),
            security,
            DispatcherConfig::default().with_queue_capacity(1),
        )
        .unwrap();
        avctp.register(AvctConfig::default()).unwrap();

        let peer = BdAddr::new([1, 2, 3, 4, 5, 6]);
        let events = Arc::new(Mutex::new(Vec::new()));
        let connect_params = params(0x110E, Role::Initiator, events.clone());
        let filler = avctp.event_sender();
        // Take the only queue slot before security answers on the worker
        avctp
            .call(move |core| {
                filler.post_l2cap(L2capEvent::DisconnectRsp { lcid: 0x99 })?;
                core.connect(connect_params, peer)
            })
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(2);
        while events.lock().unwrap().is_empty() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let events = events.lock().unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, ChannelEventKind::ConnectConfirm);
        assert_eq!(events[0].result, ResultCode::SecurityFailed);
        assert_eq!(events[0].detail, 0x0005);
    }

    #[test]
    fn test_completion_from_other_thread_waits_for_space() {
        let (tx, rx) = mpsc::sync_channel(1);
        let sender = EventSender::new(tx);
        sender
            .post_l2cap(L2capEvent::DisconnectRsp { lcid: 0x40 })
            .unwrap();
        assert_eq!(
            sender.post_l2cap(L2capEvent::DisconnectRsp { lcid: 0x41 }),
            Err(AvctError::NoResources("task queue slot"))
        );

        let completer = sender.clone();
        let handle = thread::spawn(move || {
            completer.post_completion(TransportEvent::L2cap(L2capEvent::DisconnectRsp { lcid: 0x42 }))
        });

        assert!(matches!(
            rx.recv(),
            Ok(Task::Transport(TransportEvent::L2cap(L2capEvent::DisconnectRsp { lcid: 0x40 })))
        ));
        assert!(matches!(
            rx.recv_timeout(Duration::from_secs(2)),
            Ok(Task::Transport(TransportEvent::L2cap(L2capEvent::DisconnectRsp { lcid: 0x42 })))
        ));
        assert_eq!(handle.join().unwrap(), Ok(()));
    }
}
