//! Typed client APIs per profile, thin wrappers that build a [Command], send it through the
//!  session and decode the reply. A non-success status from the peer is reported as
//!  [IpcError::Status].

use std::sync::Arc;
use anyhow::anyhow;
use crate::client::{CallbackTable, Session};
use crate::message::{Command, Envelope, ProfileId};
use crate::message::adapter::{AdapterCallbacks, AdapterCommand};
use crate::message::hid_device::{HidDeviceCallbacks, HidDeviceCommand};
use crate::message::manager::ManagerCommand;
use crate::message::spp::{SppCallbacks, SppCommand};
use crate::message::types::{AdapterState, BtAddress, BtUuid, SppPortType};
use crate::registry::Cookie;
use crate::status::{BtStatus, IpcError};

impl Session {
    pub fn manager(&self) -> ManagerClient<'_> {
        ManagerClient { session: self }
    }

    pub fn adapter(&self) -> AdapterClient<'_> {
        AdapterClient { session: self }
    }

    pub fn spp(&self) -> SppClient<'_> {
        SppClient { session: self }
    }

    pub fn hid_device(&self) -> HidDeviceClient<'_> {
        HidDeviceClient { session: self }
    }

    async fn call_checked(&self, command: impl Into<Command>) -> anyhow::Result<Envelope> {
        let reply = self.call(&command.into()).await?;
        reply.result.status().check()?;
        Ok(reply)
    }

    async fn call_for_value(&self, command: impl Into<Command>) -> anyhow::Result<u64> {
        let reply = self.call(&command.into()).await?;
        Ok(reply.result.as_u64())
    }

    /// Send the command and decode the reply payload, into which the peer filled its results
    async fn call_in_place(&self, command: impl Into<Command>) -> anyhow::Result<Command> {
        let reply = self.call_checked(command).await?;
        Command::from_envelope(&reply)
    }
}

fn unexpected_reply(reply: Command) -> anyhow::Error {
    anyhow!("reply does not match its command: {:?}", reply)
}

pub struct ManagerClient<'a> {
    session: &'a Session,
}

impl ManagerClient<'_> {
    /// Returns the app id the service assigned to the new instance
    pub async fn create_instance(&self, handle: u64, pid: u32, kind: u32, cpu_name: &str) -> anyhow::Result<u32> {
        let app_id = self.session.call_for_value(ManagerCommand::CreateInstance {
            handle,
            pid,
            kind,
            cpu_name: cpu_name.to_string(),
        }).await?;
        match app_id {
            0 => Err(IpcError::Status(BtStatus::Fail).into()),
            app_id => u32::try_from(app_id)
                .map_err(|_| anyhow!("app id {} is out of range", app_id)),
        }
    }

    pub async fn delete_instance(&self, app_id: u32) -> anyhow::Result<()> {
        self.session.call_checked(ManagerCommand::DeleteInstance { app_id }).await?;
        Ok(())
    }

    /// The handle registered for the process, if any
    pub async fn get_instance(&self, pid: u32, cpu_name: &str) -> anyhow::Result<Option<u64>> {
        let handle = self.session.call_for_value(ManagerCommand::GetInstance {
            pid,
            cpu_name: cpu_name.to_string(),
        }).await?;
        Ok(if handle == 0 { None } else { Some(handle) })
    }

    pub async fn start_service(&self, app_id: u32, service_id: u8) -> anyhow::Result<()> {
        self.session.call_checked(ManagerCommand::StartService { app_id, service_id }).await?;
        Ok(())
    }

    pub async fn stop_service(&self, app_id: u32, service_id: u8) -> anyhow::Result<()> {
        self.session.call_checked(ManagerCommand::StopService { app_id, service_id }).await?;
        Ok(())
    }
}

pub struct AdapterClient<'a> {
    session: &'a Session,
}

impl AdapterClient<'_> {
    pub async fn register_callbacks(&self, callbacks: Arc<dyn AdapterCallbacks>) -> anyhow::Result<Cookie> {
        self.session.register_callback(CallbackTable::Adapter(callbacks)).await
    }

    pub async fn unregister_callbacks(&self, cookie: Cookie) -> bool {
        self.session.unregister_callback(ProfileId::Adapter, cookie).await
    }

    pub async fn enable(&self) -> anyhow::Result<()> {
        self.session.call_checked(AdapterCommand::Enable).await?;
        Ok(())
    }

    pub async fn disable(&self) -> anyhow::Result<()> {
        self.session.call_checked(AdapterCommand::Disable).await?;
        Ok(())
    }

    pub async fn get_state(&self) -> anyhow::Result<AdapterState> {
        match self.session.call_in_place(AdapterCommand::GetState { state: AdapterState::Off }).await? {
            Command::Adapter(AdapterCommand::GetState { state }) => Ok(state),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn set_name(&self, name: &str) -> anyhow::Result<()> {
        self.session.call_checked(AdapterCommand::SetName { name: name.to_string() }).await?;
        Ok(())
    }

    pub async fn get_name(&self) -> anyhow::Result<String> {
        match self.session.call_in_place(AdapterCommand::GetName { name: String::new() }).await? {
            Command::Adapter(AdapterCommand::GetName { name }) => Ok(name),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn get_address(&self) -> anyhow::Result<BtAddress> {
        match self.session.call_in_place(AdapterCommand::GetAddress { addr: BtAddress::default() }).await? {
            Command::Adapter(AdapterCommand::GetAddress { addr }) => Ok(addr),
            other => Err(unexpected_reply(other)),
        }
    }
}

pub struct SppClient<'a> {
    session: &'a Session,
}

impl SppClient<'_> {
    pub async fn register_app(&self, callbacks: Arc<dyn SppCallbacks>) -> anyhow::Result<Cookie> {
        self.register_app_ext(None, SppPortType::Tty, callbacks).await
    }

    /// SPP allows a single app per session; registering a second one fails with
    ///  [IpcError::RegistryFull]
    pub async fn register_app_ext(&self, name: Option<&str>, port_type: SppPortType, callbacks: Arc<dyn SppCallbacks>) -> anyhow::Result<Cookie> {
        let command = SppCommand::register_app(name, port_type);
        self.session.register_callback_with(CallbackTable::Spp(callbacks), command.into()).await
    }

    pub async fn unregister_app(&self, cookie: Cookie) -> bool {
        self.session.unregister_callback(ProfileId::Spp, cookie).await
    }

    pub async fn server_start(&self, scn: u16, uuid: BtUuid, max_connection: u8) -> anyhow::Result<()> {
        self.session.call_checked(SppCommand::ServerStart { scn, uuid, max_connection }).await?;
        Ok(())
    }

    pub async fn server_stop(&self, scn: u16) -> anyhow::Result<()> {
        self.session.call_checked(SppCommand::ServerStop { scn }).await?;
        Ok(())
    }

    /// Returns the port of the new connection
    pub async fn connect(&self, addr: BtAddress, scn: i16, uuid: BtUuid) -> anyhow::Result<u16> {
        match self.session.call_in_place(SppCommand::Connect { addr, scn, uuid, port: 0 }).await? {
            Command::Spp(SppCommand::Connect { port, .. }) => Ok(port),
            other => Err(unexpected_reply(other)),
        }
    }

    pub async fn disconnect(&self, addr: BtAddress, port: u16) -> anyhow::Result<()> {
        self.session.call_checked(SppCommand::Disconnect { addr, port }).await?;
        Ok(())
    }
}

pub struct HidDeviceClient<'a> {
    session: &'a Session,
}

impl HidDeviceClient<'_> {
    pub async fn register_callbacks(&self, callbacks: Arc<dyn HidDeviceCallbacks>) -> anyhow::Result<Cookie> {
        self.session.register_callback(CallbackTable::HidDevice(callbacks)).await
    }

    pub async fn unregister_callbacks(&self, cookie: Cookie) -> bool {
        self.session.unregister_callback(ProfileId::HidDevice, cookie).await
    }

    pub async fn register_app(&self, sdp: &[u8], le_hid: bool) -> anyhow::Result<()> {
        self.session.call_checked(HidDeviceCommand::RegisterApp { sdp: sdp.to_vec(), le_hid }).await?;
        Ok(())
    }

    pub async fn unregister_app(&self) -> anyhow::Result<()> {
        self.session.call_checked(HidDeviceCommand::UnregisterApp).await?;
        Ok(())
    }

    pub async fn connect(&self, addr: BtAddress) -> anyhow::Result<()> {
        self.session.call_checked(HidDeviceCommand::Connect { addr }).await?;
        Ok(())
    }

    pub async fn disconnect(&self, addr: BtAddress) -> anyhow::Result<()> {
        self.session.call_checked(HidDeviceCommand::Disconnect { addr }).await?;
        Ok(())
    }

    pub async fn send_report(&self, addr: BtAddress, id: u8, data: &[u8]) -> anyhow::Result<()> {
        self.session.call_checked(HidDeviceCommand::SendReport { addr, id, data: data.to_vec() }).await?;
        Ok(())
    }

    pub async fn virtual_unplug(&self, addr: BtAddress) -> anyhow::Result<()> {
        self.session.call_checked(HidDeviceCommand::VirtualUnplug { addr }).await?;
        Ok(())
    }
}
