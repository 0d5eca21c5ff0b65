use bytes::{Buf, BufMut};
use crate::message::{AdapterCommandCode, AdapterEventCode, MessageCode};
use crate::message::types::{try_read_enum, AdapterState, BtAddress, DiscoveryState, NAME_FIELD_LEN};
use crate::util::buf_ext::{BufExt, BufMutExt};

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AdapterCommand {
    RegisterCallback,
    UnregisterCallback,
    Enable,
    Disable,
    /// reply: the state is filled into the payload
    GetState { state: AdapterState },
    SetName { name: String },
    /// reply: the name is filled into the payload
    GetName { name: String },
    /// reply: the address is filled into the payload
    GetAddress { addr: BtAddress },
}

impl AdapterCommand {
    pub fn code(&self) -> AdapterCommandCode {
        match self {
            AdapterCommand::RegisterCallback => AdapterCommandCode::RegisterCallback,
            AdapterCommand::UnregisterCallback => AdapterCommandCode::UnregisterCallback,
            AdapterCommand::Enable => AdapterCommandCode::Enable,
            AdapterCommand::Disable => AdapterCommandCode::Disable,
            AdapterCommand::GetState { .. } => AdapterCommandCode::GetState,
            AdapterCommand::SetName { .. } => AdapterCommandCode::SetName,
            AdapterCommand::GetName { .. } => AdapterCommandCode::GetName,
            AdapterCommand::GetAddress { .. } => AdapterCommandCode::GetAddress,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            AdapterCommand::RegisterCallback |
            AdapterCommand::UnregisterCallback |
            AdapterCommand::Enable |
            AdapterCommand::Disable => {}
            AdapterCommand::GetState { state } => buf.put_u8((*state).into()),
            AdapterCommand::SetName { name } |
            AdapterCommand::GetName { name } => {
                buf.put_fixed_str(name, NAME_FIELD_LEN)?;
            }
            AdapterCommand::GetAddress { addr } => addr.ser(buf),
        }
        Ok(())
    }

    pub fn try_deser(code: MessageCode, buf: &mut impl Buf) -> anyhow::Result<AdapterCommand> {
        let result = match AdapterCommandCode::try_from(code)? {
            AdapterCommandCode::RegisterCallback => AdapterCommand::RegisterCallback,
            AdapterCommandCode::UnregisterCallback => AdapterCommand::UnregisterCallback,
            AdapterCommandCode::Enable => AdapterCommand::Enable,
            AdapterCommandCode::Disable => AdapterCommand::Disable,
            AdapterCommandCode::GetState => AdapterCommand::GetState { state: try_read_enum(buf)? },
            AdapterCommandCode::SetName => AdapterCommand::SetName { name: buf.try_read_fixed_str(NAME_FIELD_LEN)? },
            AdapterCommandCode::GetName => AdapterCommand::GetName { name: buf.try_read_fixed_str(NAME_FIELD_LEN)? },
            AdapterCommandCode::GetAddress => AdapterCommand::GetAddress { addr: BtAddress::try_deser(buf)? },
        };
        Ok(result)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum AdapterEvent {
    AdapterStateChanged { state: AdapterState },
    DiscoveryStateChanged { state: DiscoveryState },
    DeviceNameChanged { name: String },
    PairRequest { addr: BtAddress },
}

impl AdapterEvent {
    pub fn code(&self) -> AdapterEventCode {
        match self {
            AdapterEvent::AdapterStateChanged { .. } => AdapterEventCode::OnAdapterStateChanged,
            AdapterEvent::DiscoveryStateChanged { .. } => AdapterEventCode::OnDiscoveryStateChanged,
            AdapterEvent::DeviceNameChanged { .. } => AdapterEventCode::OnDeviceNameChanged,
            AdapterEvent::PairRequest { .. } => AdapterEventCode::OnPairRequest,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            AdapterEvent::AdapterStateChanged { state } => buf.put_u8((*state).into()),
            AdapterEvent::DiscoveryStateChanged { state } => buf.put_u8((*state).into()),
            AdapterEvent::DeviceNameChanged { name } => buf.put_fixed_str(name, NAME_FIELD_LEN)?,
            AdapterEvent::PairRequest { addr } => addr.ser(buf),
        }
        Ok(())
    }

    pub fn try_deser(code: MessageCode, buf: &mut impl Buf) -> anyhow::Result<AdapterEvent> {
        let result = match AdapterEventCode::try_from(code)? {
            AdapterEventCode::OnAdapterStateChanged => AdapterEvent::AdapterStateChanged { state: try_read_enum(buf)? },
            AdapterEventCode::OnDiscoveryStateChanged => AdapterEvent::DiscoveryStateChanged { state: try_read_enum(buf)? },
            AdapterEventCode::OnDeviceNameChanged => AdapterEvent::DeviceNameChanged { name: buf.try_read_fixed_str(NAME_FIELD_LEN)? },
            AdapterEventCode::OnPairRequest => AdapterEvent::PairRequest { addr: BtAddress::try_deser(buf)? },
        };
        Ok(result)
    }

    pub fn notify(&self, callbacks: &dyn AdapterCallbacks) {
        match self {
            AdapterEvent::AdapterStateChanged { state } => callbacks.on_adapter_state_changed(*state),
            AdapterEvent::DiscoveryStateChanged { state } => callbacks.on_discovery_state_changed(*state),
            AdapterEvent::DeviceNameChanged { name } => callbacks.on_device_name_changed(name),
            AdapterEvent::PairRequest { addr } => callbacks.on_pair_request(addr),
        }
    }
}

/// Adapter event listener. Every method defaults to a no-op, so implementations only
///  override the events they care about.
pub trait AdapterCallbacks: Send + Sync {
    fn on_adapter_state_changed(&self, _state: AdapterState) {}
    fn on_discovery_state_changed(&self, _state: DiscoveryState) {}
    fn on_device_name_changed(&self, _name: &str) {}
    fn on_pair_request(&self, _addr: &BtAddress) {}
}
