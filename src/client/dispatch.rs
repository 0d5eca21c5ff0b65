use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};
use crate::message::{Envelope, Event, ProfileId};
use crate::message::adapter::AdapterCallbacks;
use crate::message::hid_device::HidDeviceCallbacks;
use crate::message::spp::SppCallbacks;
use crate::registry::CallbackRegistry;

/// A profile's callback implementation, as handed to
///  [Session::register_callback](crate::client::Session::register_callback)
#[derive(Clone)]
pub enum CallbackTable {
    Adapter(Arc<dyn AdapterCallbacks>),
    Spp(Arc<dyn SppCallbacks>),
    HidDevice(Arc<dyn HidDeviceCallbacks>),
}

impl CallbackTable {
    pub fn profile(&self) -> ProfileId {
        match self {
            CallbackTable::Adapter(_) => ProfileId::Adapter,
            CallbackTable::Spp(_) => ProfileId::Spp,
            CallbackTable::HidDevice(_) => ProfileId::HidDevice,
        }
    }
}

/// Holds a profile's registry while the session has registered interest in the profile
pub(crate) struct RegistrySlot<C: ?Sized> {
    /// serializes creation and teardown of the registry, including the peer round trip
    pub lifecycle: tokio::sync::Mutex<()>,
    current: Mutex<Option<Arc<CallbackRegistry<C>>>>,
}

impl<C: ?Sized> RegistrySlot<C> {
    fn new() -> RegistrySlot<C> {
        RegistrySlot {
            lifecycle: Default::default(),
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<Option<Arc<CallbackRegistry<C>>>> {
        self.current.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn get(&self) -> Option<Arc<CallbackRegistry<C>>> {
        self.lock().clone()
    }

    pub fn install(&self, registry: Arc<CallbackRegistry<C>>) {
        *self.lock() = Some(registry);
    }

    pub fn take(&self) -> Option<Arc<CallbackRegistry<C>>> {
        self.lock().take()
    }

    fn clear(&self) {
        if let Some(registry) = self.take() {
            registry.clear();
        }
    }
}

/// The session's registries, one slot per profile with events
pub(crate) struct ProfileRegistries {
    pub adapter: RegistrySlot<dyn AdapterCallbacks>,
    pub spp: RegistrySlot<dyn SppCallbacks>,
    pub hid_device: RegistrySlot<dyn HidDeviceCallbacks>,
}

impl ProfileRegistries {
    pub fn new() -> ProfileRegistries {
        ProfileRegistries {
            adapter: RegistrySlot::new(),
            spp: RegistrySlot::new(),
            hid_device: RegistrySlot::new(),
        }
    }

    pub fn clear_all(&self) {
        self.adapter.clear();
        self.spp.clear();
        self.hid_device.clear();
    }

    pub fn num_registered(&self, profile: ProfileId) -> usize {
        match profile {
            ProfileId::Manager => 0,
            ProfileId::Adapter => self.adapter.get().map(|r| r.len()).unwrap_or(0),
            ProfileId::Spp => self.spp.get().map(|r| r.len()).unwrap_or(0),
            ProfileId::HidDevice => self.hid_device.get().map(|r| r.len()).unwrap_or(0),
        }
    }
}

/// Decodes event envelopes and fans them out to the matching profile's registry. Delivery is
///  best effort: an event that does not decode, or for which nobody is registered, is dropped.
pub(crate) struct EventDispatcher {
    registries: Arc<ProfileRegistries>,
}

impl EventDispatcher {
    pub fn new(registries: Arc<ProfileRegistries>) -> EventDispatcher {
        EventDispatcher { registries }
    }

    /// returns the number of callbacks that were invoked
    pub fn dispatch(&self, envelope: &Envelope) -> usize {
        let event = match Event::from_envelope(envelope) {
            Ok(event) => event,
            Err(e) => {
                warn!("dropping undecodable event {:?}: {}", envelope.code, e);
                return 0;
            }
        };
        trace!("dispatching {:?}", event);

        let num_invoked = match &event {
            Event::Adapter(e) => self.registries.adapter.get()
                .map(|r| r.for_each(|cb| e.notify(cb)))
                .unwrap_or(0),
            Event::Spp(e) => self.registries.spp.get()
                .map(|r| r.for_each(|cb| e.notify(cb)))
                .unwrap_or(0),
            Event::HidDevice(e) => self.registries.hid_device.get()
                .map(|r| r.for_each(|cb| e.notify(cb)))
                .unwrap_or(0),
        };
        if num_invoked == 0 {
            debug!("no callbacks registered for {:?}", envelope.code);
        }
        num_invoked
    }
}

/// Dispatches events on a fixed number of background tasks, so the receive loop never waits
///  for callbacks
pub(crate) struct WorkerPool {
    tx: mpsc::UnboundedSender<Envelope>,
    workers: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new(num_workers: usize, dispatcher: Arc<EventDispatcher>) -> WorkerPool {
        let (tx, rx) = mpsc::unbounded_channel::<Envelope>();
        let rx = Arc::new(tokio::sync::Mutex::new(rx));

        let workers = (0..num_workers)
            .map(|_| {
                let rx = rx.clone();
                let dispatcher = dispatcher.clone();
                tokio::spawn(async move {
                    loop {
                        let next = rx.lock().await.recv().await;
                        match next {
                            Some(envelope) => { dispatcher.dispatch(&envelope); }
                            None => break,
                        }
                    }
                })
            })
            .collect();

        WorkerPool { tx, workers }
    }

    fn deliver(&self, envelope: Envelope) {
        if self.tx.send(envelope).is_err() {
            debug!("worker pool is shut down - dropping event");
        }
    }

    fn shutdown(&self) {
        for w in &self.workers {
            w.abort();
        }
    }
}

/// FIFO of events waiting for dispatch on an application-owned loop
pub(crate) struct AsyncEventQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

struct QueueState {
    queue: VecDeque<Envelope>,
    closed: bool,
}

impl AsyncEventQueue {
    pub fn new() -> AsyncEventQueue {
        AsyncEventQueue {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                closed: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<QueueState> {
        self.state.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, envelope: Envelope) -> bool {
        {
            let mut state = self.lock();
            if state.closed {
                return false;
            }
            state.queue.push_back(envelope);
        }
        self.notify.notify_one();
        true
    }

    pub fn pop(&self) -> Option<Envelope> {
        self.lock().queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.lock().queue.len()
    }

    /// Close the queue, dropping all events that were not dispatched yet. Returns the number
    ///  of dropped events.
    pub fn close(&self) -> usize {
        let dropped = {
            let mut state = self.lock();
            state.closed = true;
            let dropped = state.queue.len();
            state.queue.clear();
            dropped
        };
        self.notify.notify_waiters();
        self.notify.notify_one();
        dropped
    }

    /// Wait until there is at least one event. Returns `false` once the queue is closed.
    pub async fn wait(&self) -> bool {
        loop {
            {
                let state = self.lock();
                if state.closed {
                    return false;
                }
                if !state.queue.is_empty() {
                    return true;
                }
            }
            // notify_one stores a permit if nobody waits yet, so a push between the check
            //  and here is not lost
            self.notify.notified().await;
        }
    }
}

/// Handle for dispatching a session's events on the application's own loop, for sessions
///  configured with [EventDelivery::ExternalLoop](crate::config::EventDelivery). Callbacks run
///  on whichever task calls [ExternalEventLoop::dispatch_pending] or [ExternalEventLoop::run].
#[derive(Clone)]
pub struct ExternalEventLoop {
    queue: Arc<AsyncEventQueue>,
    dispatcher: Arc<EventDispatcher>,
}

impl ExternalEventLoop {
    /// Wait until events are queued. Returns `false` when the session was shut down.
    pub async fn wait(&self) -> bool {
        self.queue.wait().await
    }

    /// Dispatch the events that are queued right now, in arrival order, and return their
    ///  number. Events arriving during dispatch are left for the next call.
    pub fn dispatch_pending(&self) -> usize {
        let num_queued = self.queue.len();
        let mut num_dispatched = 0;
        while num_dispatched < num_queued {
            match self.queue.pop() {
                Some(envelope) => {
                    self.dispatcher.dispatch(&envelope);
                    num_dispatched += 1;
                }
                None => break,
            }
        }
        num_dispatched
    }

    pub fn num_pending(&self) -> usize {
        self.queue.len()
    }

    /// Dispatch events as they arrive until the session is shut down
    pub async fn run(&self) {
        while self.wait().await {
            self.dispatch_pending();
        }
        debug!("event loop finished");
    }
}

pub(crate) enum EventRouter {
    Pool(WorkerPool),
    External(ExternalEventLoop),
}

impl EventRouter {
    pub fn worker_pool(num_workers: usize, dispatcher: Arc<EventDispatcher>) -> EventRouter {
        EventRouter::Pool(WorkerPool::new(num_workers, dispatcher))
    }

    pub fn external(dispatcher: Arc<EventDispatcher>) -> EventRouter {
        EventRouter::External(ExternalEventLoop {
            queue: Arc::new(AsyncEventQueue::new()),
            dispatcher,
        })
    }

    /// Hand an event envelope off without waiting for its dispatch
    pub fn deliver(&self, envelope: Envelope) {
        match self {
            EventRouter::Pool(pool) => pool.deliver(envelope),
            EventRouter::External(external) => {
                if !external.queue.push(envelope) {
                    debug!("event queue is closed - dropping event");
                }
            }
        }
    }

    pub fn external_loop(&self) -> Option<ExternalEventLoop> {
        match self {
            EventRouter::Pool(_) => None,
            EventRouter::External(external) => Some(external.clone()),
        }
    }

    pub fn shutdown(&self) {
        match self {
            EventRouter::Pool(pool) => pool.shutdown(),
            EventRouter::External(external) => {
                let dropped = external.queue.close();
                if dropped > 0 {
                    debug!("dropped {} undispatched events", dropped);
                }
            }
        }
    }
}
