//! Utilities for testing code built on the IPC core: recording callback implementations, a
//!  scripted service, and a fake peer that plays the service side of a single session byte by
//!  byte. They are used for testing this crate itself, but they are exported for application
//!  testing as well, which is why this is regular (non-#[cfg(test)]) code.

use std::fmt::Debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use crate::client::Session;
use crate::config::IpcConfig;
use crate::message::adapter::AdapterCallbacks;
use crate::message::hid_device::HidDeviceCallbacks;
use crate::message::spp::SppCallbacks;
use crate::message::types::{AdapterState, BtAddress, DiscoveryState, HidAppState, ProfileConnectionState};
use crate::message::{Command, Envelope, ResultWord};
use crate::server::{ClientId, CommandReply, ProfileService};
use crate::status::BtStatus;
use crate::transport::framing::{read_envelope, write_envelope, FrameAccumulator};
use crate::transport::reconnect::ReconnectPolicy;
use crate::transport::{IpcListener, TransportAddr};

/// How long the helpers wait for something that is expected to happen
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A config with short reconnect delays and a command timeout, so that a broken test fails
///  instead of hanging
pub fn test_config() -> IpcConfig {
    let mut config = IpcConfig::new();
    config.reconnect = ReconnectPolicy {
        max_attempts: 3,
        base_delay: Duration::from_millis(10),
    };
    config.command_timeout = Some(TEST_TIMEOUT);
    config
}

static NEXT_SOCKET_NUMBER: AtomicU64 = AtomicU64::new(1);

/// A local address that no other test (in this or a concurrently running process) uses, and a
///  [test_config] with a socket directory for it
pub fn unique_local_addr() -> (TransportAddr, IpcConfig) {
    let dir = std::env::temp_dir().join(format!("btipc-{}", std::process::id()));
    if let Err(e) = std::fs::create_dir_all(&dir) {
        panic!("could not create socket directory {}: {}", dir.display(), e);
    }

    let mut config = test_config();
    config.local_socket_dir = dir;
    let name = format!("test-{}", NEXT_SOCKET_NUMBER.fetch_add(1, Ordering::Relaxed));
    (TransportAddr::local(name), config)
}

/// Collects values reported to a callback, and lets tests wait for them
pub struct EventRecorder<E> {
    events: Mutex<Vec<E>>,
    notify: Notify,
}

impl<E> Default for EventRecorder<E> {
    fn default() -> Self {
        EventRecorder {
            events: Mutex::new(Vec::new()),
            notify: Notify::new(),
        }
    }
}

impl<E: Clone + Debug> EventRecorder<E> {
    fn lock(&self) -> MutexGuard<Vec<E>> {
        self.events.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn record(&self, event: E) {
        self.lock().push(event);
        self.notify.notify_waiters();
    }

    pub fn events(&self) -> Vec<E> {
        self.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until at least `n` events were recorded, and return all of them. Panics after
    ///  `timeout`.
    pub async fn wait_for(&self, n: usize, timeout: Duration) -> Vec<E> {
        let waited = tokio::time::timeout(timeout, async {
            loop {
                let notified = self.notify.notified();
                tokio::pin!(notified);
                // registered before the check, so a record in between is not missed
                notified.as_mut().enable();
                if self.len() >= n {
                    return;
                }
                notified.await;
            }
        }).await;

        if waited.is_err() {
            panic!("expected {} events within {:?}, got {:?}", n, timeout, self.events());
        }
        self.events()
    }
}

#[derive(Default)]
pub struct RecordingAdapterCallbacks {
    pub adapter_states: EventRecorder<AdapterState>,
    pub discovery_states: EventRecorder<DiscoveryState>,
    pub device_names: EventRecorder<String>,
    pub pair_requests: EventRecorder<BtAddress>,
}

impl RecordingAdapterCallbacks {
    pub fn states(&self) -> Vec<AdapterState> {
        self.adapter_states.events()
    }

    pub fn pair_requests(&self) -> Vec<BtAddress> {
        self.pair_requests.events()
    }

    pub async fn wait_for_states(&self, n: usize, timeout: Duration) -> Vec<AdapterState> {
        self.adapter_states.wait_for(n, timeout).await
    }
}

impl AdapterCallbacks for RecordingAdapterCallbacks {
    fn on_adapter_state_changed(&self, state: AdapterState) {
        self.adapter_states.record(state);
    }

    fn on_discovery_state_changed(&self, state: DiscoveryState) {
        self.discovery_states.record(state);
    }

    fn on_device_name_changed(&self, name: &str) {
        self.device_names.record(name.to_string());
    }

    fn on_pair_request(&self, addr: &BtAddress) {
        self.pair_requests.record(*addr);
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub struct PtyOpened {
    pub addr: BtAddress,
    pub scn: u16,
    pub port: u16,
    pub name: String,
}

#[derive(Default)]
pub struct RecordingSppCallbacks {
    pub pty_opened: EventRecorder<PtyOpened>,
    pub connection_states: EventRecorder<(BtAddress, u16, ProfileConnectionState)>,
}

impl SppCallbacks for RecordingSppCallbacks {
    fn on_pty_open(&self, addr: &BtAddress, scn: u16, port: u16, name: &str) {
        self.pty_opened.record(PtyOpened {
            addr: *addr,
            scn,
            port,
            name: name.to_string(),
        });
    }

    fn on_connection_state(&self, addr: &BtAddress, _scn: u16, port: u16, state: ProfileConnectionState) {
        self.connection_states.record((*addr, port, state));
    }
}

#[derive(Default)]
pub struct RecordingHidDeviceCallbacks {
    pub app_states: EventRecorder<HidAppState>,
    pub connection_states: EventRecorder<(BtAddress, ProfileConnectionState)>,
    pub reports: EventRecorder<(BtAddress, u8, Vec<u8>)>,
    pub virtual_unplugs: EventRecorder<BtAddress>,
}

impl HidDeviceCallbacks for RecordingHidDeviceCallbacks {
    fn on_app_state(&self, state: HidAppState) {
        self.app_states.record(state);
    }

    fn on_connection_state(&self, addr: &BtAddress, _le_hid: bool, state: ProfileConnectionState) {
        self.connection_states.record((*addr, state));
    }

    fn on_receive_report(&self, addr: &BtAddress, report_type: u8, data: &[u8]) {
        self.reports.record((*addr, report_type, data.to_vec()));
    }

    fn on_virtual_unplug(&self, addr: &BtAddress) {
        self.virtual_unplugs.record(*addr);
    }
}

type CommandHandler = Box<dyn Fn(ClientId, Command) -> CommandReply + Send + Sync>;

/// A [ProfileService] that answers commands with a closure and records what it saw
pub struct ScriptedService {
    handler: CommandHandler,
    commands: Mutex<Vec<Command>>,
    closed_clients: Mutex<Vec<ClientId>>,
}

impl ScriptedService {
    pub fn new(handler: impl Fn(ClientId, Command) -> CommandReply + Send + Sync + 'static) -> ScriptedService {
        ScriptedService {
            handler: Box::new(handler),
            commands: Default::default(),
            closed_clients: Default::default(),
        }
    }

    pub fn commands(&self) -> Vec<Command> {
        self.commands.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn closed_clients(&self) -> Vec<ClientId> {
        self.closed_clients.lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl ProfileService for ScriptedService {
    async fn on_command(&self, client: ClientId, command: Command) -> CommandReply {
        self.commands.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(command.clone());
        (self.handler)(client, command)
    }

    async fn on_client_closed(&self, client: ClientId) {
        self.closed_clients.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(client);
    }
}

/// The service end of a single session's connection, driven by the test envelope by envelope
pub struct FakePeer {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
    acc: FrameAccumulator,
}

impl FakePeer {
    /// The next envelope from the session. Panics if there is none within [TEST_TIMEOUT].
    pub async fn recv(&mut self) -> Envelope {
        match self.try_recv_within(TEST_TIMEOUT).await {
            Some(envelope) => envelope,
            None => panic!("no envelope from the session within {:?}", TEST_TIMEOUT),
        }
    }

    /// `None` if the session sent nothing within `timeout`
    pub async fn try_recv_within(&mut self, timeout: Duration) -> Option<Envelope> {
        match tokio::time::timeout(timeout, read_envelope(self.reader.as_mut(), &mut self.acc)).await {
            Err(_) => None,
            Ok(Ok(Some(envelope))) => Some(envelope),
            Ok(Ok(None)) => panic!("session closed the connection"),
            Ok(Err(e)) => panic!("reading from the session failed: {}", e),
        }
    }

    /// Wait for the session to close the connection
    pub async fn expect_closed(&mut self) {
        match tokio::time::timeout(TEST_TIMEOUT, read_envelope(self.reader.as_mut(), &mut self.acc)).await {
            Ok(Ok(None)) | Ok(Err(_)) => {}
            Ok(Ok(Some(envelope))) => panic!("expected the connection to be closed, received {:?}", envelope),
            Err(_) => panic!("session did not close the connection within {:?}", TEST_TIMEOUT),
        }
    }

    pub async fn send(&mut self, envelope: &Envelope) {
        if let Err(e) = write_envelope(self.writer.as_mut(), envelope).await {
            panic!("writing to the session failed: {}", e);
        }
    }

    /// Reply to a command, echoing its code and payload
    pub async fn reply(&mut self, command: &Envelope, result: ResultWord) {
        let mut reply = command.clone();
        reply.result = result;
        self.send(&reply).await;
    }

    /// Reply successfully to a command with `filled_in` as the reply payload, the way a service
    ///  returns data
    pub async fn reply_filled_in(&mut self, command: &Envelope, filled_in: Command) {
        let mut reply = match filled_in.to_envelope() {
            Ok(reply) => reply,
            Err(e) => panic!("could not encode {:?}: {}", filled_in, e),
        };
        assert_eq!(reply.code, command.code, "reply payload for a different command");
        reply.result = ResultWord::from_status(BtStatus::Success);
        self.send(&reply).await;
    }

    /// Receive the next command and reply to it
    pub async fn serve_one(&mut self, result: ResultWord) -> Envelope {
        let command = self.recv().await;
        self.reply(&command, result).await;
        command
    }

    /// Close the connection from the service side
    pub async fn close(mut self) {
        let _ = self.writer.shutdown().await;
    }
}

/// A session connected to a [FakePeer] over loopback TCP
pub async fn session_with_fake_peer(config: IpcConfig) -> (Session, FakePeer) {
    let listener = match IpcListener::bind(&TransportAddr::Inet { port: 0 }, &config).await {
        Ok(listener) => listener,
        Err(e) => panic!("could not bind: {}", e),
    };
    let addr = match listener.local_addr() {
        Ok(addr) => addr,
        Err(e) => panic!("no local address: {}", e),
    };

    let (session, stream) = tokio::join!(Session::init(config, &addr), listener.accept());
    match (session, stream) {
        (Ok(session), Ok(stream)) => {
            let peer = FakePeer {
                reader: stream.reader,
                writer: stream.writer,
                acc: FrameAccumulator::new(),
            };
            (session, peer)
        }
        (Err(e), _) | (_, Err(e)) => panic!("could not set up session: {}", e),
    }
}
