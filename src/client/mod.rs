//! The client side of the IPC core: a [Session] is one connection to the service process.
//!
//! A session has exactly one command in flight at any time: [Session::send_and_wait] holds the
//!  session's command lock from writing the command until its reply arrived, and concurrent
//!  callers queue on that lock in arrival order. Replies are not tagged with request ids, so
//!  this is what guarantees that each caller gets its own reply. It also means that a callback
//!  issuing a command on its own session waits for any command currently in flight.
//!
//! Events are read by the same receive loop and handed off to a worker pool or an
//!  [ExternalEventLoop] without blocking the socket.

use std::sync::{Arc, Mutex};
use anyhow::bail;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use crate::config::{EventDelivery, IpcConfig};
use crate::message::{CodeClass, Command, Envelope, MessageCode, ProfileId, ResultShape};
use crate::message::adapter::AdapterCommand;
use crate::message::hid_device::HidDeviceCommand;
use crate::message::spp::SppCommand;
use crate::message::types::SppPortType;
use crate::registry::{CallbackRegistry, Cookie};
use crate::status::{BtStatus, IpcError};
use crate::transport;
use crate::transport::framing::{read_envelope, write_envelope, FrameAccumulator};
use crate::transport::TransportAddr;
use dispatch::{EventDispatcher, EventRouter, ProfileRegistries, RegistrySlot};
use pending::{PendingCommandSlot, ReplyReceiver};

pub mod dispatch;
pub mod pending;
pub mod profiles;

pub use dispatch::{CallbackTable, ExternalEventLoop};

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
}

type Writer = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the session handle and its receive loop
struct SessionShared {
    state: watch::Sender<SessionState>,
    pending: PendingCommandSlot,
    registries: Arc<ProfileRegistries>,
    router: EventRouter,
}

impl SessionShared {
    /// The terminal transition: fail the command in flight and every later one with
    ///  `reason`, stop event delivery
    fn shut_down(&self, reason: IpcError) {
        let was_connected = self.state.send_replace(SessionState::Disconnected) != SessionState::Disconnected;
        if was_connected {
            info!("session shut down: {}", reason);
        }
        self.pending.close(reason);
        self.router.shutdown();
    }
}

struct SessionInner {
    config: IpcConfig,
    peer: String,
    shared: Arc<SessionShared>,
    /// the round-trip lock, which also owns the write half of the connection
    writer: tokio::sync::Mutex<Option<Writer>>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for SessionInner {
    fn drop(&mut self) {
        let task = self.receive_task.get_mut()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.shut_down(IpcError::TransportDown("session dropped".to_string()));
    }
}

/// Shuts the session down if a command write is cancelled half-way, since the peer would
///  misinterpret everything after the partial envelope
struct WriteGuard<'a> {
    shared: &'a SessionShared,
    armed: bool,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.shared.shut_down(IpcError::TransportDown("command write was cancelled".to_string()));
        }
    }
}

/// A client connection to the Bluetooth service. Cloning is cheap and yields another handle to
///  the same connection.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    /// Connect to the service, retrying according to the configured
    ///  [ReconnectPolicy](crate::transport::reconnect::ReconnectPolicy), and start the
    ///  receive loop
    pub async fn init(config: IpcConfig, addr: &TransportAddr) -> anyhow::Result<Session> {
        config.validate()?;
        let (state, _) = watch::channel(SessionState::Connecting);

        let config_ref = &config;
        let stream = config.reconnect.connect(|attempt| {
            debug!("connecting to {:?}, attempt {}", addr, attempt);
            transport::connect(addr, config_ref)
        }).await?;
        info!("connected to {}", stream.peer);

        let registries = Arc::new(ProfileRegistries::new());
        let dispatcher = Arc::new(EventDispatcher::new(registries.clone()));
        let router = match config.event_delivery {
            EventDelivery::WorkerPool { workers } => EventRouter::worker_pool(workers, dispatcher),
            EventDelivery::ExternalLoop => EventRouter::external(dispatcher),
        };

        let shared = Arc::new(SessionShared {
            state,
            pending: PendingCommandSlot::new(),
            registries,
            router,
        });
        shared.state.send_replace(SessionState::Connected);

        let receive_task = tokio::spawn(receive_loop(stream.reader, stream.peer.clone(), shared.clone()));

        Ok(Session {
            inner: Arc::new(SessionInner {
                config,
                peer: stream.peer,
                shared,
                writer: tokio::sync::Mutex::new(Some(stream.writer)),
                receive_task: Mutex::new(Some(receive_task)),
            }),
        })
    }

    pub fn state(&self) -> SessionState {
        *self.inner.shared.state.borrow()
    }

    pub fn peer(&self) -> &str {
        &self.inner.peer
    }

    pub fn config(&self) -> &IpcConfig {
        &self.inner.config
    }

    /// Wait until the session is disconnected, e.g. because the peer closed the connection
    pub async fn disconnected(&self) {
        let mut rx = self.inner.shared.state.subscribe();
        let _ = rx.wait_for(|s| *s == SessionState::Disconnected).await;
    }

    /// The handle for dispatching events if the session was configured with
    ///  [EventDelivery::ExternalLoop]
    pub fn external_event_loop(&self) -> Option<ExternalEventLoop> {
        self.inner.shared.router.external_loop()
    }

    /// Send a command envelope with the given code and wait for its reply.
    ///
    /// Fails with [IpcError::TransportDown] if the connection is (or goes) down, and with
    ///  [IpcError::Timeout] if a command timeout is configured and exceeded. The reply to a
    ///  timed-out command is discarded when it arrives.
    pub async fn send_and_wait(&self, code: MessageCode, mut envelope: Envelope) -> anyhow::Result<Envelope> {
        match code.classify()? {
            CodeClass::Command(_) => {}
            CodeClass::Event(_) => bail!("{:?} is an event code and can not be sent as a command", code),
        }
        envelope.code = code;

        let shared = &self.inner.shared;
        let mut writer = self.inner.writer.lock().await;
        let rx = shared.pending.arm(code)?;

        let w = match writer.as_mut() {
            Some(w) => w,
            None => {
                shared.pending.disarm();
                return Err(IpcError::TransportDown("session is shut down".to_string()).into());
            }
        };

        let mut guard = WriteGuard { shared, armed: true };
        let written = write_envelope(w.as_mut(), &envelope).await;
        guard.armed = false;
        if let Err(e) = written {
            shared.pending.disarm();
            let reason = IpcError::find(&e)
                .cloned()
                .unwrap_or_else(|| IpcError::TransportDown(e.to_string()));
            shared.shut_down(reason);
            return Err(e);
        }

        let result = self.wait_for_reply(code, rx).await;
        drop(writer);
        result
    }

    async fn wait_for_reply(&self, code: MessageCode, mut rx: ReplyReceiver) -> anyhow::Result<Envelope> {
        let received = match self.inner.config.command_timeout {
            None => rx.await.ok(),
            Some(timeout) => match tokio::time::timeout(timeout, &mut rx).await {
                Ok(received) => received.ok(),
                Err(_) => {
                    if self.inner.shared.pending.abandon() {
                        warn!("no reply for {:?} after {:?}", code, timeout);
                        return Err(IpcError::Timeout(timeout).into());
                    }
                    // the reply arrived just as the timeout fired
                    rx.try_recv().ok()
                }
            },
        };

        match received {
            Some(Ok(reply)) => Ok(reply),
            Some(Err(e)) => Err(e.into()),
            None => Err(IpcError::TransportDown("session shut down".to_string()).into()),
        }
    }

    /// Send a typed command, returning the raw reply envelope
    pub async fn call(&self, command: &Command) -> anyhow::Result<Envelope> {
        self.send_and_wait(command.code(), command.to_envelope()?).await
    }

    /// Register callbacks for a profile's events with the default registration command.
    ///
    /// The first registration for a profile creates the session's registry for it and tells
    ///  the peer to start sending events; if the peer declines, the registration is rolled back.
    ///  Further registrations are local only, up to the registry's capacity.
    pub async fn register_callback(&self, callbacks: CallbackTable) -> anyhow::Result<Cookie> {
        let command = match callbacks.profile() {
            ProfileId::Adapter => AdapterCommand::RegisterCallback.into(),
            ProfileId::Spp => SppCommand::RegisterApp { name: None, port_type: SppPortType::Tty }.into(),
            ProfileId::HidDevice => HidDeviceCommand::RegisterCallback.into(),
            ProfileId::Manager => bail!("the manager profile has no callbacks"),
        };
        self.register_callback_with(callbacks, command).await
    }

    /// Register callbacks, using `register_command` to subscribe with the peer if this is the
    ///  profile's first registration
    pub async fn register_callback_with(&self, callbacks: CallbackTable, register_command: Command) -> anyhow::Result<Cookie> {
        let registries = &self.inner.shared.registries;
        match callbacks {
            CallbackTable::Adapter(cb) => self.register_in(&registries.adapter, ProfileId::Adapter, cb, register_command).await,
            CallbackTable::Spp(cb) => self.register_in(&registries.spp, ProfileId::Spp, cb, register_command).await,
            CallbackTable::HidDevice(cb) => self.register_in(&registries.hid_device, ProfileId::HidDevice, cb, register_command).await,
        }
    }

    async fn register_in<C: ?Sized>(&self, slot: &RegistrySlot<C>, profile: ProfileId, callbacks: Arc<C>, register_command: Command) -> anyhow::Result<Cookie> {
        let _lifecycle = slot.lifecycle.lock().await;

        if let Some(registry) = slot.get() {
            let cookie = registry.register(callbacks)?;
            debug!("added {:?} callbacks {:?}", profile, cookie);
            return Ok(cookie);
        }

        // the registry is installed before the peer is asked for events, so that events
        //  sent right after the peer's reply find it
        let registry = Arc::new(CallbackRegistry::new(self.inner.config.registry_capacity(profile))?);
        let cookie = registry.register(callbacks)?;
        slot.install(registry.clone());

        let acknowledged = match self.call(&register_command).await {
            Ok(reply) => registration_status(&register_command, &reply).check(),
            Err(e) => Err(e),
        };
        match acknowledged {
            Ok(()) => {
                debug!("registered {:?} callbacks {:?} with the peer", profile, cookie);
                Ok(cookie)
            }
            Err(e) => {
                warn!("peer rejected {:?} callback registration: {}", profile, e);
                slot.take();
                registry.clear();
                Err(e)
            }
        }
    }

    /// Remove a registration. Returns `false` if the cookie is not registered for the profile.
    ///
    /// Removing a profile's last registration closes its registry and tells the peer to stop
    ///  sending events; failure to reach the peer is logged, the local unregistration stands.
    pub async fn unregister_callback(&self, profile: ProfileId, cookie: Cookie) -> bool {
        let registries = &self.inner.shared.registries;
        match profile {
            ProfileId::Adapter => self.unregister_in(&registries.adapter, profile, cookie, AdapterCommand::UnregisterCallback.into()).await,
            ProfileId::Spp => self.unregister_in(&registries.spp, profile, cookie, SppCommand::UnregisterApp.into()).await,
            ProfileId::HidDevice => self.unregister_in(&registries.hid_device, profile, cookie, HidDeviceCommand::UnregisterCallback.into()).await,
            ProfileId::Manager => false,
        }
    }

    async fn unregister_in<C: ?Sized>(&self, slot: &RegistrySlot<C>, profile: ProfileId, cookie: Cookie, unregister_command: Command) -> bool {
        let _lifecycle = slot.lifecycle.lock().await;

        let registry = match slot.get() {
            Some(registry) => registry,
            None => return false,
        };
        if !registry.unregister(cookie) {
            return false;
        }

        if registry.close_if_empty() {
            slot.take();
            let acknowledged = match self.call(&unregister_command).await {
                Ok(reply) => registration_status(&unregister_command, &reply).check(),
                Err(e) => Err(e),
            };
            match acknowledged {
                Ok(()) => debug!("unregistered {:?} callbacks with the peer", profile),
                Err(e) => warn!("peer did not acknowledge {:?} callback unregistration: {}", profile, e),
            }
        }
        true
    }

    /// number of callbacks currently registered for a profile
    pub fn num_callbacks(&self, profile: ProfileId) -> usize {
        self.inner.shared.registries.num_registered(profile)
    }

    /// Tear the session down: stop the receive loop, fail pending and queued commands, drop
    ///  undispatched events and all callback registrations, and close the connection
    pub async fn deinit(&self) {
        info!("deinit session to {}", self.inner.peer);
        let task = self.inner.receive_task.lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(task) = task {
            task.abort();
        }

        self.inner.shared.shut_down(IpcError::TransportDown("session deinitialized".to_string()));
        self.inner.shared.registries.clear_all();

        let writer = self.inner.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!("error closing connection: {}", e);
            }
        }
    }
}

/// Whether the peer accepted a (un)registration command
fn registration_status(command: &Command, reply: &Envelope) -> BtStatus {
    match command.result_shape() {
        ResultShape::Status => reply.result.status(),
        ResultShape::Value => {
            if reply.result.as_u64() == 0 {
                BtStatus::Fail
            }
            else {
                BtStatus::Success
            }
        }
    }
}

#[tracing::instrument(name = "session", skip(reader, shared))]
async fn receive_loop(mut reader: Box<dyn AsyncRead + Send + Unpin>, peer: String, shared: Arc<SessionShared>) {
    let mut acc = FrameAccumulator::new();
    let reason = loop {
        match read_envelope(reader.as_mut(), &mut acc).await {
            Ok(Some(envelope)) => {
                match envelope.code.classify() {
                    Ok(CodeClass::Command(_)) => shared.pending.complete(envelope),
                    Ok(CodeClass::Event(_)) => shared.router.deliver(envelope),
                    Err(e) => {
                        error!("protocol error, closing session: {}", e);
                        break e;
                    }
                }
            }
            Ok(None) => {
                break IpcError::TransportDown("peer closed the connection".to_string());
            }
            Err(e) => {
                break IpcError::find(&e)
                    .cloned()
                    .unwrap_or_else(|| IpcError::TransportDown(e.to_string()));
            }
        }
    };
    shared.shut_down(reason);
}


#[cfg(test)]
mod tests {
    use std::time::Duration;
    use super::*;
    use crate::message::adapter::{AdapterCallbacks, AdapterEvent};
    use crate::message::manager::ManagerCommand;
    use crate::message::types::{AdapterState, BtAddress};
    use crate::message::{AdapterCommandCode, AdapterEventCode, Event, ManagerCommandCode, ResultWord, SppCommandCode};
    use crate::test_util::{session_with_fake_peer, test_config, unique_local_addr, FakePeer, RecordingAdapterCallbacks, RecordingSppCallbacks, TEST_TIMEOUT};
    use rstest::rstest;

    fn success() -> ResultWord {
        ResultWord::from_status(BtStatus::Success)
    }

    fn state_event(state: AdapterState) -> Envelope {
        Event::from(AdapterEvent::AdapterStateChanged { state }).to_envelope().unwrap()
    }

    async fn register_adapter(session: &Session, peer: &mut FakePeer, callbacks: Arc<dyn AdapterCallbacks>) -> Cookie {
        let s = session.clone();
        let registering = tokio::spawn(async move { s.adapter().register_callbacks(callbacks).await });
        let command = peer.serve_one(success()).await;
        assert_eq!(command.code, MessageCode::from(AdapterCommandCode::RegisterCallback));
        registering.await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_round_trip() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;
        assert_eq!(session.state(), SessionState::Connected);

        let s = session.clone();
        let getting = tokio::spawn(async move { s.adapter().get_state().await });
        let command = peer.recv().await;
        assert_eq!(command.code, MessageCode::from(AdapterCommandCode::GetState));
        peer.reply_filled_in(&command, AdapterCommand::GetState { state: AdapterState::On }.into()).await;
        assert_eq!(getting.await.unwrap().unwrap(), AdapterState::On);
    }

    #[tokio::test]
    async fn test_concurrent_commands_are_serialized() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let callers = (1..=5u32)
            .map(|pid| {
                let s = session.clone();
                tokio::spawn(async move {
                    (pid, s.manager().get_instance(pid, "ap").await.unwrap())
                })
            })
            .collect::<Vec<_>>();

        for _ in 0..5 {
            let command = peer.recv().await;
            // nothing else may be in flight until this one is answered
            assert!(peer.try_recv_within(Duration::from_millis(30)).await.is_none());

            let pid = match Command::from_envelope(&command).unwrap() {
                Command::Manager(ManagerCommand::GetInstance { pid, .. }) => pid,
                other => panic!("unexpected command {:?}", other),
            };
            peer.reply(&command, ResultWord::from_u64(1000 + pid as u64)).await;
        }

        for caller in callers {
            let (pid, handle) = caller.await.unwrap();
            assert_eq!(handle, Some(1000 + pid as u64));
        }
    }

    #[rstest]
    #[case::valid(ResultWord::from_u64(7), Some(7))]
    #[case::largest(ResultWord::from_u64(u32::MAX as u64), Some(u32::MAX))]
    #[case::failed(ResultWord::from_u64(0), None)]
    #[case::out_of_range(ResultWord::from_u64(u32::MAX as u64 + 1), None)]
    #[tokio::test]
    async fn test_create_instance_app_id(#[case] result: ResultWord, #[case] expected: Option<u32>) {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let s = session.clone();
        let creating = tokio::spawn(async move { s.manager().create_instance(1, 2, 0, "ap").await });
        peer.serve_one(result).await;
        assert_eq!(creating.await.unwrap().ok(), expected);
    }

    #[tokio::test]
    async fn test_timeout_discards_late_reply() {
        let mut config = test_config();
        config.command_timeout = Some(Duration::from_millis(100));
        let (session, mut peer) = session_with_fake_peer(config).await;

        let s = session.clone();
        let enabling = tokio::spawn(async move { s.adapter().enable().await });
        let enable = peer.recv().await;
        let err = enabling.await.unwrap().unwrap_err();
        assert_eq!(IpcError::find(&err), Some(&IpcError::Timeout(Duration::from_millis(100))));
        assert_eq!(session.state(), SessionState::Connected);

        let s = session.clone();
        let getting = tokio::spawn(async move { s.adapter().get_state().await });
        let get_state = peer.recv().await;
        peer.reply(&enable, success()).await;
        peer.reply_filled_in(&get_state, AdapterCommand::GetState { state: AdapterState::TurningOff }.into()).await;
        assert_eq!(getting.await.unwrap().unwrap(), AdapterState::TurningOff);
    }

    #[tokio::test]
    async fn test_reply_with_other_code() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let s = session.clone();
        let enabling = tokio::spawn(async move { s.adapter().enable().await });
        peer.recv().await;
        peer.send(&Envelope::new(AdapterCommandCode::Disable)).await;

        let err = enabling.await.unwrap().unwrap_err();
        assert_eq!(IpcError::find(&err), Some(&IpcError::UnexpectedCode {
            expected: AdapterCommandCode::Enable.into(),
            actual: AdapterCommandCode::Disable.into(),
        }));
    }

    #[tokio::test]
    async fn test_peer_closing_fails_command_in_flight() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let s = session.clone();
        let enabling = tokio::spawn(async move { s.adapter().enable().await });
        peer.recv().await;
        peer.close().await;

        let err = enabling.await.unwrap().unwrap_err();
        assert!(matches!(IpcError::find(&err), Some(IpcError::TransportDown(_))));
        tokio::time::timeout(TEST_TIMEOUT, session.disconnected()).await.unwrap();
        assert_eq!(session.state(), SessionState::Disconnected);

        let err = session.adapter().disable().await.unwrap_err();
        assert!(matches!(IpcError::find(&err), Some(IpcError::TransportDown(_))));
    }

    #[tokio::test]
    async fn test_unknown_code_shuts_session_down() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        peer.send(&Envelope::new(MessageCode(200))).await;
        tokio::time::timeout(TEST_TIMEOUT, session.disconnected()).await.unwrap();

        let err = session.adapter().enable().await.unwrap_err();
        assert_eq!(IpcError::find(&err), Some(&IpcError::UnknownCode(MessageCode(200))));
    }

    #[tokio::test]
    async fn test_event_code_can_not_be_sent() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let code = MessageCode::from(AdapterEventCode::OnAdapterStateChanged);
        assert!(session.send_and_wait(code, Envelope::new(code)).await.is_err());
        assert!(session.send_and_wait(MessageCode(36), Envelope::new(MessageCode(36))).await.is_err());
        assert!(peer.try_recv_within(Duration::from_millis(30)).await.is_none());
    }

    #[tokio::test]
    async fn test_events_reach_registered_callbacks() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;
        let callbacks = Arc::new(RecordingAdapterCallbacks::default());
        register_adapter(&session, &mut peer, callbacks.clone()).await;
        assert_eq!(session.num_callbacks(ProfileId::Adapter), 1);

        peer.send(&state_event(AdapterState::TurningOn)).await;
        peer.send(&Event::from(AdapterEvent::PairRequest { addr: BtAddress([5; 6]) }).to_envelope().unwrap()).await;
        peer.send(&state_event(AdapterState::On)).await;

        assert_eq!(callbacks.wait_for_states(2, TEST_TIMEOUT).await, vec![AdapterState::TurningOn, AdapterState::On]);
        assert_eq!(callbacks.pair_requests(), vec![BtAddress([5; 6])]);
    }

    #[tokio::test]
    async fn test_undecodable_event_is_dropped() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;
        let callbacks = Arc::new(RecordingAdapterCallbacks::default());
        register_adapter(&session, &mut peer, callbacks.clone()).await;

        let mut broken = state_event(AdapterState::On);
        broken.payload[0] = 77;
        peer.send(&broken).await;
        peer.send(&state_event(AdapterState::Off)).await;

        assert_eq!(callbacks.wait_for_states(1, TEST_TIMEOUT).await, vec![AdapterState::Off]);
        assert_eq!(session.state(), SessionState::Connected);
    }

    #[tokio::test]
    async fn test_rejected_registration_is_rolled_back() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let s = session.clone();
        let registering = tokio::spawn(async move {
            s.adapter().register_callbacks(Arc::new(RecordingAdapterCallbacks::default())).await
        });
        peer.serve_one(ResultWord::from_status(BtStatus::NotReady)).await;
        let err = registering.await.unwrap().unwrap_err();
        assert_eq!(IpcError::status_of(&err), BtStatus::NotReady);
        assert_eq!(session.num_callbacks(ProfileId::Adapter), 0);

        // the next registration asks the peer again
        register_adapter(&session, &mut peer, Arc::new(RecordingAdapterCallbacks::default())).await;
        assert_eq!(session.num_callbacks(ProfileId::Adapter), 1);
    }

    #[tokio::test]
    async fn test_only_first_and_last_registration_reach_the_peer() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;
        let a = Arc::new(RecordingAdapterCallbacks::default());
        let b = Arc::new(RecordingAdapterCallbacks::default());

        let cookie_a = register_adapter(&session, &mut peer, a.clone()).await;
        let cookie_b = session.adapter().register_callbacks(b.clone()).await.unwrap();
        assert!(peer.try_recv_within(Duration::from_millis(30)).await.is_none());
        assert_eq!(session.num_callbacks(ProfileId::Adapter), 2);

        peer.send(&state_event(AdapterState::BleOn)).await;
        a.wait_for_states(1, TEST_TIMEOUT).await;
        b.wait_for_states(1, TEST_TIMEOUT).await;

        assert!(session.adapter().unregister_callbacks(cookie_a).await);
        assert!(!session.adapter().unregister_callbacks(cookie_a).await);
        assert!(peer.try_recv_within(Duration::from_millis(30)).await.is_none());

        let s = session.clone();
        let unregistering = tokio::spawn(async move { s.adapter().unregister_callbacks(cookie_b).await });
        let command = peer.serve_one(success()).await;
        assert_eq!(command.code, MessageCode::from(AdapterCommandCode::UnregisterCallback));
        assert!(unregistering.await.unwrap());
        assert_eq!(session.num_callbacks(ProfileId::Adapter), 0);
    }

    #[tokio::test]
    async fn test_registration_limits() {
        let mut config = test_config();
        config.max_register_num = 2;
        let (session, mut peer) = session_with_fake_peer(config).await;

        let a = Arc::new(RecordingAdapterCallbacks::default());
        register_adapter(&session, &mut peer, a.clone()).await;

        let err = session.adapter().register_callbacks(a.clone()).await.unwrap_err();
        assert_eq!(IpcError::find(&err), Some(&IpcError::AlreadyRegistered));

        session.adapter().register_callbacks(Arc::new(RecordingAdapterCallbacks::default())).await.unwrap();
        let err = session.adapter().register_callbacks(Arc::new(RecordingAdapterCallbacks::default())).await.unwrap_err();
        assert_eq!(IpcError::find(&err), Some(&IpcError::RegistryFull { capacity: 2 }));
    }

    #[tokio::test]
    async fn test_spp_allows_one_app() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let s = session.clone();
        let registering = tokio::spawn(async move {
            s.spp().register_app(Arc::new(RecordingSppCallbacks::default())).await
        });
        let command = peer.serve_one(ResultWord::from_u64(3)).await;
        assert_eq!(command.code, MessageCode::from(SppCommandCode::RegisterApp));
        registering.await.unwrap().unwrap();

        let err = session.spp().register_app(Arc::new(RecordingSppCallbacks::default())).await.unwrap_err();
        assert_eq!(IpcError::find(&err), Some(&IpcError::RegistryFull { capacity: 1 }));
        assert!(peer.try_recv_within(Duration::from_millis(30)).await.is_none());
    }

    #[tokio::test]
    async fn test_external_event_loop() {
        let mut config = test_config();
        config.event_delivery = EventDelivery::ExternalLoop;
        let (session, mut peer) = session_with_fake_peer(config).await;
        let events = session.external_event_loop().unwrap();

        let callbacks = Arc::new(RecordingAdapterCallbacks::default());
        register_adapter(&session, &mut peer, callbacks.clone()).await;

        peer.send(&state_event(AdapterState::TurningOn)).await;
        peer.send(&state_event(AdapterState::On)).await;

        let mut dispatched = 0;
        while dispatched < 2 {
            assert!(tokio::time::timeout(TEST_TIMEOUT, events.wait()).await.unwrap());
            dispatched += events.dispatch_pending();
        }
        assert_eq!(callbacks.states(), vec![AdapterState::TurningOn, AdapterState::On]);

        session.deinit().await;
        assert!(!events.wait().await);
    }

    #[tokio::test]
    async fn test_worker_pool_session_has_no_external_loop() {
        let (session, _peer) = session_with_fake_peer(test_config()).await;
        assert!(session.external_event_loop().is_none());
    }

    #[tokio::test]
    async fn test_deinit() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;
        register_adapter(&session, &mut peer, Arc::new(RecordingAdapterCallbacks::default())).await;

        let s = session.clone();
        let enabling = tokio::spawn(async move { s.adapter().enable().await });
        peer.recv().await;

        session.deinit().await;
        let err = enabling.await.unwrap().unwrap_err();
        assert!(matches!(IpcError::find(&err), Some(IpcError::TransportDown(_))));
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.num_callbacks(ProfileId::Adapter), 0);

        peer.expect_closed().await;
        assert!(session.manager().stop_service(1, 2).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_gives_up_after_max_attempts() {
        let (addr, config) = unique_local_addr();
        let err = Session::init(config, &addr).await.err().unwrap();
        assert_eq!(IpcError::find(&err), Some(&IpcError::ConnectFailed { attempts: 3 }));
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let (addr, mut config) = unique_local_addr();
        config.event_delivery = EventDelivery::WorkerPool { workers: 0 };
        assert!(Session::init(config, &addr).await.is_err());
    }

    #[tokio::test]
    async fn test_raw_send_and_wait() {
        let (session, mut peer) = session_with_fake_peer(test_config()).await;

        let s = session.clone();
        let sending = tokio::spawn(async move {
            // the code argument wins over the envelope's
            s.send_and_wait(ManagerCommandCode::StopService.into(), Envelope::new(ManagerCommandCode::StartService)).await
        });
        let command = peer.serve_one(success()).await;
        assert_eq!(command.code, MessageCode::from(ManagerCommandCode::StopService));
        assert_eq!(sending.await.unwrap().unwrap().code, MessageCode::from(ManagerCommandCode::StopService));
    }
}
