//! The service side of the IPC core: accepts client connections, dispatches their commands to
//!  the registered [ProfileService]s, and pushes events to subscribed clients.
//!
//! Commands of one connection are handled strictly in order, and the reply is queued before the
//!  next command is read. Events pushed while a command is handled are queued ahead of its reply.

use std::collections::hash_map::Entry;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use anyhow::bail;
use rustc_hash::FxHashMap;
use tokio::sync::{mpsc, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use crate::config::IpcConfig;
use crate::message::{Command, Envelope, Event, ProfileId, Registration};
use crate::registry::CallbackRegistry;
use crate::status::BtStatus;
use crate::transport::{IpcListener, IpcStream, TransportAddr};
use connection::{run_connection, ClientSink};

pub mod connection;
pub mod service;

pub use connection::EventSink;
pub use service::{ClientId, CommandReply, ProfileService};

pub(crate) struct ServerInner {
    config: IpcConfig,
    services: RwLock<FxHashMap<ProfileId, Arc<dyn ProfileService>>>,
    /// clients that registered for a profile's events, keyed by profile
    subscribers: FxHashMap<ProfileId, CallbackRegistry<dyn EventSink, ClientId>>,
    connections: Mutex<FxHashMap<ClientId, Arc<ClientSink>>>,
    next_client_id: AtomicU64,
}

/// The service process's end of the IPC core. Cloning is cheap and yields another handle to the
///  same server.
#[derive(Clone)]
pub struct Server {
    inner: Arc<ServerInner>,
}

impl Server {
    pub fn new(config: IpcConfig) -> anyhow::Result<Server> {
        config.validate()?;

        let mut subscribers = FxHashMap::default();
        for profile in ProfileId::ALL {
            if !profile.event_range().is_empty() {
                subscribers.insert(profile, CallbackRegistry::new(config.server_max_clients)?);
            }
        }

        Ok(Server {
            inner: Arc::new(ServerInner {
                config,
                services: Default::default(),
                subscribers,
                connections: Default::default(),
                next_client_id: AtomicU64::new(1),
            }),
        })
    }

    pub fn config(&self) -> &IpcConfig {
        &self.inner.config
    }

    /// Install the implementation of a profile's commands. Each profile can have one service.
    pub async fn register_service(&self, profile: ProfileId, service: Arc<dyn ProfileService>) -> anyhow::Result<()> {
        match self.inner.services.write().await.entry(profile) {
            Entry::Occupied(_) => bail!("a service for {:?} is already registered", profile),
            Entry::Vacant(e) => {
                debug!("registered service for {:?}", profile);
                e.insert(service);
            }
        }
        Ok(())
    }

    pub async fn bind(&self, addr: &TransportAddr) -> anyhow::Result<IpcListener> {
        IpcListener::bind(addr, &self.inner.config).await
    }

    /// Accept connections and serve each on its own task. Runs until the future is dropped; a
    ///  failing accept is logged and retried after a pause.
    pub async fn serve(&self, listener: IpcListener) {
        let listener = &listener;
        accept_loop(move || listener.accept(), |stream| self.admit(stream)).await
    }

    /// Start serving an accepted connection, or close it right away if the server is full
    fn admit(&self, stream: IpcStream) {
        let client = ClientId(self.inner.next_client_id.fetch_add(1, Ordering::Relaxed));
        match self.inner.reserve_connection(client) {
            Some((sink, rx)) => {
                tokio::spawn(run_connection(self.inner.clone(), client, sink, rx, stream));
            }
            None => {
                warn!("refusing connection from {}: {} clients connected already", stream.peer, self.inner.config.server_max_clients);
            }
        }
    }

    /// Bind to `addr` and serve on a background task. Returns the address clients connect to,
    ///  which differs from `addr` for an INET address with port 0.
    pub async fn start(&self, addr: &TransportAddr) -> anyhow::Result<(TransportAddr, JoinHandle<()>)> {
        let listener = self.bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!("serving on {:?}", local_addr);

        let server = self.clone();
        let handle = tokio::spawn(async move {
            server.serve(listener).await
        });
        Ok((local_addr, handle))
    }

    /// Send an event to the clients subscribed to its profile, or only to `target` if that is
    ///  given. Returns the number of clients the event was queued for.
    pub fn push_event(&self, event: &Event, target: Option<ClientId>) -> anyhow::Result<usize> {
        let envelope = event.to_envelope()?;
        let subscribers = match self.inner.subscribers.get(&event.profile()) {
            Some(subscribers) => subscribers,
            None => bail!("{:?} has no events", event.profile()),
        };

        let mut num_sent = 0;
        subscribers.for_each_remote(|client, sink| {
            let selected = match (target, client) {
                (None, _) => true,
                (Some(target), Some(client)) => target == *client,
                (Some(_), None) => false,
            };
            if selected && sink.send_event(&envelope) {
                num_sent += 1;
            }
        });
        debug!("pushed {:?} to {} clients", event.code(), num_sent);
        Ok(num_sent)
    }

    pub fn connected_clients(&self) -> Vec<ClientId> {
        let mut result = self.inner.lock_connections()
            .keys()
            .copied()
            .collect::<Vec<_>>();
        result.sort();
        result
    }

    pub fn is_subscribed(&self, profile: ProfileId, client: ClientId) -> bool {
        self.inner.subscribers.get(&profile)
            .map(|s| s.contains_remote(&client))
            .unwrap_or(false)
    }

    pub fn num_subscribers(&self, profile: ProfileId) -> usize {
        self.inner.subscribers.get(&profile)
            .map(|s| s.len())
            .unwrap_or(0)
    }
}

impl ServerInner {
    fn lock_connections(&self) -> MutexGuard<FxHashMap<ClientId, Arc<ClientSink>>> {
        self.connections.lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    /// Take one of the `server_max_clients` slots for a new connection, returning the
    ///  connection's sink and the receiving end of its writer queue. The slot is taken before
    ///  the connection's task runs, so connections accepted back to back are counted.
    fn reserve_connection(&self, client: ClientId) -> Option<(Arc<ClientSink>, mpsc::UnboundedReceiver<Envelope>)> {
        let mut connections = self.lock_connections();
        if connections.len() >= self.config.server_max_clients {
            return None;
        }
        let (sink, rx) = ClientSink::channel();
        connections.insert(client, sink.clone());
        Some((sink, rx))
    }

    /// Forget everything about a client whose connection is gone, then tell the services
    async fn remove_connection(&self, client: ClientId) {
        self.lock_connections().remove(&client);
        for (profile, subscribers) in &self.subscribers {
            if subscribers.unregister_remote(&client).is_some() {
                debug!("removed {:?} subscription of {:?}", profile, client);
            }
        }

        let services = self.services.read().await
            .values()
            .cloned()
            .collect::<Vec<_>>();
        for service in services {
            service.on_client_closed(client).await;
        }
        info!("{:?} disconnected", client);
    }

    /// Handle one command envelope and build its reply. The reply carries the command's code,
    ///  and its payload echoes the command unless the service filled in results.
    async fn handle_command(&self, client: ClientId, sink: &Arc<ClientSink>, envelope: Envelope) -> Envelope {
        let mut reply = envelope;

        let command = match Command::from_envelope(&reply) {
            Ok(command) => command,
            Err(e) => {
                warn!("invalid command {:?}: {}", reply.code, e);
                reply.result = CommandReply::reject_code(reply.code, BtStatus::ParmInvalid).result;
                return reply;
            }
        };
        debug!("received {:?}", command);

        let service = self.services.read().await
            .get(&command.profile())
            .cloned();
        let command_reply = match service {
            None => {
                debug!("no service for {:?}", command.profile());
                CommandReply::reject(&command, BtStatus::Unsupported)
            }
            Some(service) => match command.registration() {
                None => service.on_command(client, command.clone()).await,
                Some(Registration::Register) => self.subscribe(client, sink, &command, service.as_ref()).await,
                Some(Registration::Unregister) => self.unsubscribe(client, &command, service.as_ref()).await,
            },
        };

        reply.result = command_reply.result;
        if let Some(filled_in) = command_reply.payload {
            match filled_in.to_envelope() {
                Ok(filled_in) if filled_in.code == reply.code => reply.payload = filled_in.payload,
                Ok(filled_in) => {
                    error!("service replied to {:?} with {:?}", reply.code, filled_in.code);
                    reply.result = CommandReply::reject(&command, BtStatus::Fail).result;
                }
                Err(e) => {
                    error!("could not encode reply to {:?}: {}", reply.code, e);
                    reply.result = CommandReply::reject(&command, BtStatus::Fail).result;
                }
            }
        }
        reply
    }

    async fn subscribe(&self, client: ClientId, sink: &Arc<ClientSink>, command: &Command, service: &dyn ProfileService) -> CommandReply {
        let subscribers = match self.subscribers.get(&command.profile()) {
            Some(subscribers) => subscribers,
            None => return service.on_command(client, command.clone()).await,
        };
        if subscribers.contains_remote(&client) {
            debug!("{:?} is already subscribed to {:?}", client, command.profile());
            return CommandReply::reject(command, BtStatus::Busy);
        }

        let reply = service.on_command(client, command.clone()).await;
        if !reply.is_success_for(command) {
            return reply;
        }
        // subscribed before the reply is queued, so no event after the reply is missed
        match subscribers.register_remote(client, sink.clone()) {
            Ok(_) => {
                debug!("{:?} subscribed to {:?}", client, command.profile());
                reply
            }
            Err(e) => {
                warn!("could not subscribe {:?} to {:?}: {}", client, command.profile(), e);
                CommandReply::reject(command, e.status())
            }
        }
    }

    async fn unsubscribe(&self, client: ClientId, command: &Command, service: &dyn ProfileService) -> CommandReply {
        let subscribers = match self.subscribers.get(&command.profile()) {
            Some(subscribers) => subscribers,
            None => return service.on_command(client, command.clone()).await,
        };
        if !subscribers.contains_remote(&client) {
            debug!("{:?} is not subscribed to {:?}", client, command.profile());
            return CommandReply::reject(command, BtStatus::NotFound);
        }

        let reply = service.on_command(client, command.clone()).await;
        subscribers.unregister_remote(&client);
        debug!("{:?} unsubscribed from {:?}", client, command.profile());
        reply
    }
}


/// Pause after a failed accept, e.g. while the process is out of file descriptors
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Call `accept` forever, handing every accepted connection to `on_accepted`
async fn accept_loop<T, F, Fut>(mut accept: F, mut on_accepted: impl FnMut(T))
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<T>>,
{
    loop {
        match accept().await {
            Ok(stream) => on_accepted(stream),
            Err(e) => {
                warn!("accepting a connection failed, retrying in {:?}: {}", ACCEPT_RETRY_DELAY, e);
                sleep(ACCEPT_RETRY_DELAY).await;
            }
        }
    }
}
