use bytes::{Buf, BufMut};
use crate::message::{MessageCode, ResultShape, SppCommandCode, SppEventCode};
use crate::message::types::{try_read_enum, BtAddress, BtUuid, ProfileConnectionState, SppPortType, NAME_FIELD_LEN};
use crate::util::buf_ext::{BufExt, BufMutExt};

/// SPP is a singleton profile per connection: the service side keeps the app handle for the
///  connection, so it does not travel in the payloads.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SppCommand {
    /// reply: a non-zero app handle as a value, `0` on failure. The wire marks an absent name
    ///  by its length 0, so an empty name arrives as `None`.
    RegisterApp { name: Option<String>, port_type: SppPortType },
    UnregisterApp,
    ServerStart { scn: u16, uuid: BtUuid, max_connection: u8 },
    ServerStop { scn: u16 },
    /// reply: the port is filled into the payload
    Connect { addr: BtAddress, scn: i16, uuid: BtUuid, port: u16 },
    Disconnect { addr: BtAddress, port: u16 },
}

impl SppCommandCode {
    pub fn result_shape(self) -> ResultShape {
        match self {
            SppCommandCode::RegisterApp => ResultShape::Value,
            _ => ResultShape::Status,
        }
    }
}

impl SppCommand {
    /// [SppCommand::RegisterApp] with an empty name treated as no name
    pub fn register_app(name: Option<&str>, port_type: SppPortType) -> SppCommand {
        SppCommand::RegisterApp {
            name: name.filter(|n| !n.is_empty()).map(|n| n.to_string()),
            port_type,
        }
    }

    pub fn code(&self) -> SppCommandCode {
        match self {
            SppCommand::RegisterApp { .. } => SppCommandCode::RegisterApp,
            SppCommand::UnregisterApp => SppCommandCode::UnregisterApp,
            SppCommand::ServerStart { .. } => SppCommandCode::ServerStart,
            SppCommand::ServerStop { .. } => SppCommandCode::ServerStop,
            SppCommand::Connect { .. } => SppCommandCode::Connect,
            SppCommand::Disconnect { .. } => SppCommandCode::Disconnect,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            SppCommand::RegisterApp { name, port_type } => {
                let name = name.as_deref().unwrap_or("");
                buf.put_u32_le(name.len() as u32);
                buf.put_fixed_str(name, NAME_FIELD_LEN)?;
                buf.put_u8((*port_type).into());
            }
            SppCommand::UnregisterApp => {}
            SppCommand::ServerStart { scn, uuid, max_connection } => {
                uuid.ser(buf);
                buf.put_u16_le(*scn);
                buf.put_u8(*max_connection);
            }
            SppCommand::ServerStop { scn } => {
                buf.put_u16_le(*scn);
            }
            SppCommand::Connect { addr, scn, uuid, port } => {
                addr.ser(buf);
                buf.put_i16_le(*scn);
                uuid.ser(buf);
                buf.put_u16_le(*port);
            }
            SppCommand::Disconnect { addr, port } => {
                addr.ser(buf);
                buf.put_u16_le(*port);
            }
        }
        Ok(())
    }

    pub fn try_deser(code: MessageCode, buf: &mut impl Buf) -> anyhow::Result<SppCommand> {
        let result = match SppCommandCode::try_from(code)? {
            SppCommandCode::RegisterApp => {
                let name_len = buf.try_read_u32_le()?;
                let name = buf.try_read_fixed_str(NAME_FIELD_LEN)?;
                let port_type = try_read_enum(buf)?;
                SppCommand::RegisterApp {
                    name: if name_len == 0 { None } else { Some(name) },
                    port_type,
                }
            }
            SppCommandCode::UnregisterApp => SppCommand::UnregisterApp,
            SppCommandCode::ServerStart => {
                let uuid = BtUuid::try_deser(buf)?;
                let scn = buf.try_read_u16_le()?;
                let max_connection = buf.try_read_u8()?;
                SppCommand::ServerStart { scn, uuid, max_connection }
            }
            SppCommandCode::ServerStop => SppCommand::ServerStop { scn: buf.try_read_u16_le()? },
            SppCommandCode::Connect => {
                let addr = BtAddress::try_deser(buf)?;
                let scn = buf.try_read_i16_le()?;
                let uuid = BtUuid::try_deser(buf)?;
                let port = buf.try_read_u16_le()?;
                SppCommand::Connect { addr, scn, uuid, port }
            }
            SppCommandCode::Disconnect => {
                let addr = BtAddress::try_deser(buf)?;
                let port = buf.try_read_u16_le()?;
                SppCommand::Disconnect { addr, port }
            }
        };
        Ok(result)
    }
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum SppEvent {
    PtyOpen { addr: BtAddress, scn: u16, port: u16, name: String },
    ConnectionState { addr: BtAddress, scn: u16, port: u16, state: ProfileConnectionState },
}

impl SppEvent {
    pub fn code(&self) -> SppEventCode {
        match self {
            SppEvent::PtyOpen { .. } => SppEventCode::PtyOpen,
            SppEvent::ConnectionState { .. } => SppEventCode::ConnectionState,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            SppEvent::PtyOpen { addr, scn, port, name } => {
                addr.ser(buf);
                buf.put_u16_le(*scn);
                buf.put_u16_le(*port);
                buf.put_fixed_str(name, NAME_FIELD_LEN)?;
            }
            SppEvent::ConnectionState { addr, scn, port, state } => {
                addr.ser(buf);
                buf.put_u16_le(*scn);
                buf.put_u16_le(*port);
                buf.put_u8((*state).into());
            }
        }
        Ok(())
    }

    pub fn try_deser(code: MessageCode, buf: &mut impl Buf) -> anyhow::Result<SppEvent> {
        let result = match SppEventCode::try_from(code)? {
            SppEventCode::PtyOpen => {
                let addr = BtAddress::try_deser(buf)?;
                let scn = buf.try_read_u16_le()?;
                let port = buf.try_read_u16_le()?;
                let name = buf.try_read_fixed_str(NAME_FIELD_LEN)?;
                SppEvent::PtyOpen { addr, scn, port, name }
            }
            SppEventCode::ConnectionState => {
                let addr = BtAddress::try_deser(buf)?;
                let scn = buf.try_read_u16_le()?;
                let port = buf.try_read_u16_le()?;
                let state = try_read_enum(buf)?;
                SppEvent::ConnectionState { addr, scn, port, state }
            }
        };
        Ok(result)
    }

    pub fn notify(&self, callbacks: &dyn SppCallbacks) {
        match self {
            SppEvent::PtyOpen { addr, scn, port, name } => callbacks.on_pty_open(addr, *scn, *port, name),
            SppEvent::ConnectionState { addr, scn, port, state } => callbacks.on_connection_state(addr, *scn, *port, *state),
        }
    }
}

pub trait SppCallbacks: Send + Sync {
    fn on_pty_open(&self, _addr: &BtAddress, _scn: u16, _port: u16, _name: &str) {}
    fn on_connection_state(&self, _addr: &BtAddress, _scn: u16, _port: u16, _state: ProfileConnectionState) {}
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::packet::{assert_command_round_trip, assert_event_round_trip, Command};
    use crate::message::Envelope;
    use rstest::rstest;

    fn addr() -> BtAddress {
        BtAddress([0x00, 0x1b, 0xdc, 0x0f, 0xa0, 0x09])
    }

    fn sample_command(code: SppCommandCode) -> SppCommand {
        match code {
            SppCommandCode::RegisterApp => SppCommand::register_app(Some("console"), SppPortType::RpmsgUart),
            SppCommandCode::UnregisterApp => SppCommand::UnregisterApp,
            SppCommandCode::ServerStart => SppCommand::ServerStart { scn: 5, uuid: BtUuid::from_u16(0x1101), max_connection: 2 },
            SppCommandCode::ServerStop => SppCommand::ServerStop { scn: 5 },
            SppCommandCode::Connect => SppCommand::Connect { addr: addr(), scn: -1, uuid: BtUuid::from_u16(0x1101), port: 0 },
            SppCommandCode::Disconnect => SppCommand::Disconnect { addr: addr(), port: 12 },
        }
    }

    fn sample_event(code: SppEventCode) -> SppEvent {
        match code {
            SppEventCode::PtyOpen => SppEvent::PtyOpen { addr: addr(), scn: 5, port: 12, name: "/dev/pts/3".to_string() },
            SppEventCode::ConnectionState => SppEvent::ConnectionState { addr: addr(), scn: 5, port: 12, state: ProfileConnectionState::Disconnecting },
        }
    }

    #[test]
    fn test_every_command_through_envelope() {
        for &code in SppCommandCode::ALL {
            let command = sample_command(code);
            assert_eq!(command.code(), code);
            assert_command_round_trip(command.into());
        }
    }

    #[test]
    fn test_every_event_through_envelope() {
        for &code in SppEventCode::ALL {
            let event = sample_event(code);
            assert_eq!(event.code(), code);
            assert_event_round_trip(event.into());
        }
    }

    #[rstest]
    #[case::absent(None, None)]
    #[case::empty(Some(""), None)]
    #[case::named(Some("console"), Some("console"))]
    fn test_register_app_name(#[case] name: Option<&str>, #[case] expected: Option<&str>) {
        let command = SppCommand::register_app(name, SppPortType::Tty);
        assert_eq!(command, SppCommand::RegisterApp { name: expected.map(|n| n.to_string()), port_type: SppPortType::Tty });
        assert_command_round_trip(command.into());
    }

    #[test]
    fn test_empty_name_arrives_as_none() {
        let sent = Command::from(SppCommand::RegisterApp { name: Some(String::new()), port_type: SppPortType::Tty });
        let received = Command::from_envelope(&sent.to_envelope().unwrap()).unwrap();
        assert_eq!(received, SppCommand::RegisterApp { name: None, port_type: SppPortType::Tty }.into());
    }

    #[test]
    fn test_connect_layout() {
        let envelope = Command::from(sample_command(SppCommandCode::Connect)).to_envelope().unwrap();
        let expected = Envelope::with_payload(SppCommandCode::Connect, &[
            &addr().0[..],
            &(-1i16).to_le_bytes()[..],
            &BtUuid::from_u16(0x1101).0[..],
            &0u16.to_le_bytes()[..],
        ].concat()).unwrap();
        assert_eq!(envelope, expected);
    }
}
