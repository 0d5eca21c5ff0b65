use std::path::PathBuf;
use std::time::Duration;
use anyhow::bail;
use crate::message::ProfileId;
use crate::transport::reconnect::ReconnectPolicy;

#[derive(Debug, Clone)]
pub struct IpcConfig {
    /// Directory holding the Unix domain sockets for [TransportAddr::Local](crate::transport::TransportAddr)
    ///  addresses, which are named `bt:<name>` inside it
    pub local_socket_dir: PathBuf,

    pub reconnect: ReconnectPolicy,

    /// Upper bound for waiting on a command's reply. `None` waits forever, which means that a
    ///  hanging service process hangs the caller.
    pub command_timeout: Option<Duration>,

    pub event_delivery: EventDelivery,

    /// Maximum number of callback registrations per multi-subscriber profile and session.
    ///  Singleton profiles (SPP, HID device) always have a capacity of 1.
    pub max_register_num: usize,

    /// Connections beyond this number are closed right after they are accepted
    pub server_max_clients: usize,
}

/// How a session hands received events to the callback registries
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum EventDelivery {
    /// Dispatch on a pool of background tasks. With more than one worker, events of a session
    ///  may be dispatched out of order.
    WorkerPool { workers: usize },
    /// Queue events until the application dispatches them from its own loop, see
    ///  [ExternalEventLoop](crate::client::dispatch::ExternalEventLoop)
    ExternalLoop,
}

impl IpcConfig {
    pub fn new() -> IpcConfig {
        IpcConfig {
            local_socket_dir: std::env::temp_dir(),
            reconnect: ReconnectPolicy::new(),
            command_timeout: Some(Duration::from_secs(10)),
            event_delivery: EventDelivery::WorkerPool { workers: 1 },
            max_register_num: 4,
            server_max_clients: 10,
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.reconnect.validate()?;
        if self.command_timeout == Some(Duration::ZERO) {
            bail!("command timeout must be positive");
        }
        if let EventDelivery::WorkerPool { workers: 0 } = self.event_delivery {
            bail!("worker pool needs at least one worker");
        }
        if self.max_register_num == 0 {
            bail!("max_register_num must be at least 1");
        }
        if self.server_max_clients == 0 {
            bail!("server_max_clients must be at least 1");
        }
        Ok(())
    }

    pub fn registry_capacity(&self, profile: ProfileId) -> usize {
        match profile {
            ProfileId::Manager | ProfileId::Adapter => self.max_register_num,
            ProfileId::Spp | ProfileId::HidDevice => 1,
        }
    }
}

impl Default for IpcConfig {
    fn default() -> Self {
        IpcConfig::new()
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_defaults_are_valid() {
        IpcConfig::new().validate().unwrap();
    }

    #[rstest]
    #[case::zero_timeout(|c: &mut IpcConfig| c.command_timeout = Some(Duration::ZERO))]
    #[case::no_workers(|c: &mut IpcConfig| c.event_delivery = EventDelivery::WorkerPool { workers: 0 })]
    #[case::no_registrations(|c: &mut IpcConfig| c.max_register_num = 0)]
    #[case::no_clients(|c: &mut IpcConfig| c.server_max_clients = 0)]
    #[case::no_attempts(|c: &mut IpcConfig| c.reconnect.max_attempts = 0)]
    fn test_invalid(#[case] modify: fn(&mut IpcConfig)) {
        let mut config = IpcConfig::new();
        modify(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unbounded_wait_is_valid() {
        let mut config = IpcConfig::new();
        config.command_timeout = None;
        config.event_delivery = EventDelivery::ExternalLoop;
        config.validate().unwrap();
    }

    #[test]
    fn test_registry_capacity() {
        let mut config = IpcConfig::new();
        config.max_register_num = 3;
        assert_eq!(config.registry_capacity(ProfileId::Adapter), 3);
        assert_eq!(config.registry_capacity(ProfileId::Spp), 1);
        assert_eq!(config.registry_capacity(ProfileId::HidDevice), 1);
    }
}
