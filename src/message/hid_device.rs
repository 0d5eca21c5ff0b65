use anyhow::bail;
use bytes::{Buf, BufMut};
use crate::message::{HidDeviceCommandCode, HidDeviceEventCode, MessageCode};
use crate::message::types::{try_read_enum, BtAddress, HidAppState, ProfileConnectionState};
use crate::util::buf_ext::{BufExt, BufMutExt};

pub const MAX_SDP_LEN: usize = 255;
pub const MAX_REPORT_LEN: usize = 256;

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HidDeviceCommand {
    RegisterCallback,
    UnregisterCallback,
    RegisterApp { sdp: Vec<u8>, le_hid: bool },
    UnregisterApp,
    Connect { addr: BtAddress },
    Disconnect { addr: BtAddress },
    SendReport { addr: BtAddress, id: u8, data: Vec<u8> },
    VirtualUnplug { addr: BtAddress },
}

impl HidDeviceCommand {
    pub fn code(&self) -> HidDeviceCommandCode {
        match self {
            HidDeviceCommand::RegisterCallback => HidDeviceCommandCode::RegisterCallback,
            HidDeviceCommand::UnregisterCallback => HidDeviceCommandCode::UnregisterCallback,
            HidDeviceCommand::RegisterApp { .. } => HidDeviceCommandCode::RegisterApp,
            HidDeviceCommand::UnregisterApp => HidDeviceCommandCode::UnregisterApp,
            HidDeviceCommand::Connect { .. } => HidDeviceCommandCode::Connect,
            HidDeviceCommand::Disconnect { .. } => HidDeviceCommandCode::Disconnect,
            HidDeviceCommand::SendReport { .. } => HidDeviceCommandCode::SendReport,
            HidDeviceCommand::VirtualUnplug { .. } => HidDeviceCommandCode::VirtualUnplug,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            HidDeviceCommand::RegisterCallback |
            HidDeviceCommand::UnregisterCallback |
            HidDeviceCommand::UnregisterApp => {}
            HidDeviceCommand::RegisterApp { sdp, le_hid } => {
                if sdp.len() > MAX_SDP_LEN {
                    bail!("SDP record of {} bytes exceeds {} bytes", sdp.len(), MAX_SDP_LEN);
                }
                buf.put_u8(sdp.len() as u8);
                buf.put_slice(sdp);
                buf.put_bytes(0, MAX_SDP_LEN - sdp.len());
                buf.put_bool(*le_hid);
            }
            HidDeviceCommand::Connect { addr } |
            HidDeviceCommand::Disconnect { addr } |
            HidDeviceCommand::VirtualUnplug { addr } => addr.ser(buf),
            HidDeviceCommand::SendReport { addr, id, data } => {
                if data.len() > MAX_REPORT_LEN {
                    bail!("report of {} bytes exceeds {} bytes", data.len(), MAX_REPORT_LEN);
                }
                addr.ser(buf);
                buf.put_u8(*id);
                buf.put_u8(0);
                buf.put_u32_le(data.len() as u32);
                buf.put_slice(data);
            }
        }
        Ok(())
    }

    pub fn try_deser(code: MessageCode, buf: &mut impl Buf) -> anyhow::Result<HidDeviceCommand> {
        let result = match HidDeviceCommandCode::try_from(code)? {
            HidDeviceCommandCode::RegisterCallback => HidDeviceCommand::RegisterCallback,
            HidDeviceCommandCode::UnregisterCallback => HidDeviceCommand::UnregisterCallback,
            HidDeviceCommandCode::RegisterApp => {
                let len = buf.try_read_u8()? as usize;
                let raw: [u8; MAX_SDP_LEN] = buf.try_read_array()?;
                let le_hid = buf.try_read_bool()?;
                HidDeviceCommand::RegisterApp { sdp: raw[..len].to_vec(), le_hid }
            }
            HidDeviceCommandCode::UnregisterApp => HidDeviceCommand::UnregisterApp,
            HidDeviceCommandCode::Connect => HidDeviceCommand::Connect { addr: BtAddress::try_deser(buf)? },
            HidDeviceCommandCode::Disconnect => HidDeviceCommand::Disconnect { addr: BtAddress::try_deser(buf)? },
            HidDeviceCommandCode::SendReport => {
                let addr = BtAddress::try_deser(buf)?;
                let id = buf.try_read_u8()?;
                buf.try_skip(1)?;
                let len = buf.try_read_u32_le()? as usize;
                if len > MAX_REPORT_LEN {
                    bail!("report size {} exceeds {} bytes", len, MAX_REPORT_LEN);
                }
                if buf.remaining() < len {
                    bail!("buffer underflow");
                }
                let data = buf.copy_to_bytes(len).to_vec();
                HidDeviceCommand::SendReport { addr, id, data }
            }
            HidDeviceCommandCode::VirtualUnplug => HidDeviceCommand::VirtualUnplug { addr: BtAddress::try_deser(buf)? },
        };
        Ok(result)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum HidDeviceEvent {
    AppState { state: HidAppState },
    ConnectionState { addr: BtAddress, le_hid: bool, state: ProfileConnectionState },
    ReceiveReport { addr: BtAddress, report_type: u8, data: Vec<u8> },
    VirtualUnplug { addr: BtAddress },
}

impl HidDeviceEvent {
    pub fn code(&self) -> HidDeviceEventCode {
        match self {
            HidDeviceEvent::AppState { .. } => HidDeviceEventCode::AppState,
            HidDeviceEvent::ConnectionState { .. } => HidDeviceEventCode::ConnectionState,
            HidDeviceEvent::ReceiveReport { .. } => HidDeviceEventCode::OnReceiveReport,
            HidDeviceEvent::VirtualUnplug { .. } => HidDeviceEventCode::OnVirtualUnplug,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            HidDeviceEvent::AppState { state } => buf.put_u8((*state).into()),
            HidDeviceEvent::ConnectionState { addr, le_hid, state } => {
                addr.ser(buf);
                buf.put_bool(*le_hid);
                buf.put_u8((*state).into());
            }
            HidDeviceEvent::ReceiveReport { addr, report_type, data } => {
                if data.len() > MAX_REPORT_LEN {
                    bail!("report of {} bytes exceeds {} bytes", data.len(), MAX_REPORT_LEN);
                }
                addr.ser(buf);
                buf.put_u8(*report_type);
                buf.put_u8(0);
                buf.put_u16_le(data.len() as u16);
                buf.put_slice(data);
            }
            HidDeviceEvent::VirtualUnplug { addr } => addr.ser(buf),
        }
        Ok(())
    }

    pub fn try_deser(code: MessageCode, buf: &mut impl Buf) -> anyhow::Result<HidDeviceEvent> {
        let result = match HidDeviceEventCode::try_from(code)? {
            HidDeviceEventCode::AppState => HidDeviceEvent::AppState { state: try_read_enum(buf)? },
            HidDeviceEventCode::ConnectionState => {
                let addr = BtAddress::try_deser(buf)?;
                let le_hid = buf.try_read_bool()?;
                let state = try_read_enum(buf)?;
                HidDeviceEvent::ConnectionState { addr, le_hid, state }
            }
            HidDeviceEventCode::OnReceiveReport => {
                let addr = BtAddress::try_deser(buf)?;
                let report_type = buf.try_read_u8()?;
                buf.try_skip(1)?;
                let len = buf.try_read_u16_le()? as usize;
                if len > MAX_REPORT_LEN || buf.remaining() < len {
                    bail!("invalid report size {}", len);
                }
                let data = buf.copy_to_bytes(len).to_vec();
                HidDeviceEvent::ReceiveReport { addr, report_type, data }
            }
            HidDeviceEventCode::OnVirtualUnplug => HidDeviceEvent::VirtualUnplug { addr: BtAddress::try_deser(buf)? },
        };
        Ok(result)
    }

    pub fn notify(&self, callbacks: &dyn HidDeviceCallbacks) {
        match self {
            HidDeviceEvent::AppState { state } => callbacks.on_app_state(*state),
            HidDeviceEvent::ConnectionState { addr, le_hid, state } => callbacks.on_connection_state(addr, *le_hid, *state),
            HidDeviceEvent::ReceiveReport { addr, report_type, data } => callbacks.on_receive_report(addr, *report_type, data),
            HidDeviceEvent::VirtualUnplug { addr } => callbacks.on_virtual_unplug(addr),
        }
    }
}

pub trait HidDeviceCallbacks: Send + Sync {
    fn on_app_state(&self, _state: HidAppState) {}
    fn on_connection_state(&self, _addr: &BtAddress, _le_hid: bool, _state: ProfileConnectionState) {}
    fn on_receive_report(&self, _addr: &BtAddress, _report_type: u8, _data: &[u8]) {}
    fn on_virtual_unplug(&self, _addr: &BtAddress) {}
}
