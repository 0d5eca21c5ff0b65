use anyhow::bail;
use crate::message::{CodeClass, Envelope, ManagerCommandCode, MessageCode, ProfileId, SppCommandCode, PAYLOAD_SIZE};
use crate::message::adapter::{AdapterCommand, AdapterEvent};
use crate::message::hid_device::{HidDeviceCommand, HidDeviceEvent};
use crate::message::manager::ManagerCommand;
use crate::message::spp::{SppCommand, SppEvent};

/// How a command's reply uses the envelope's `result` union
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum ResultShape {
    /// a [BtStatus](crate::status::BtStatus) byte
    Status,
    /// a numeric value (handle, id) where `0` doubles as 'failed'
    Value,
}

impl ResultShape {
    /// The shape depends on the command code alone, so it is known for a reply even if the
    ///  command's payload does not decode. Anything that is not a command has a status.
    pub fn of(code: MessageCode) -> ResultShape {
        match code.classify() {
            Ok(CodeClass::Command(ProfileId::Manager)) => ManagerCommandCode::try_from(code)
                .map(|c| c.result_shape())
                .unwrap_or(ResultShape::Status),
            Ok(CodeClass::Command(ProfileId::Spp)) => SppCommandCode::try_from(code)
                .map(|c| c.result_shape())
                .unwrap_or(ResultShape::Status),
            _ => ResultShape::Status,
        }
    }
}

/// Commands that subscribe or unsubscribe a connection to a profile's events
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum Registration {
    Register,
    Unregister,
}

/// A command (or its reply) decoded from the command range of the code space
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Command {
    Manager(ManagerCommand),
    Adapter(AdapterCommand),
    Spp(SppCommand),
    HidDevice(HidDeviceCommand),
}

impl Command {
    pub fn profile(&self) -> ProfileId {
        match self {
            Command::Manager(_) => ProfileId::Manager,
            Command::Adapter(_) => ProfileId::Adapter,
            Command::Spp(_) => ProfileId::Spp,
            Command::HidDevice(_) => ProfileId::HidDevice,
        }
    }

    pub fn code(&self) -> MessageCode {
        match self {
            Command::Manager(c) => c.code().into(),
            Command::Adapter(c) => c.code().into(),
            Command::Spp(c) => c.code().into(),
            Command::HidDevice(c) => c.code().into(),
        }
    }

    pub fn result_shape(&self) -> ResultShape {
        match self {
            Command::Manager(c) => c.code().result_shape(),
            Command::Spp(c) => c.code().result_shape(),
            Command::Adapter(_) | Command::HidDevice(_) => ResultShape::Status,
        }
    }

    pub fn registration(&self) -> Option<Registration> {
        match self {
            Command::Adapter(AdapterCommand::RegisterCallback) => Some(Registration::Register),
            Command::Adapter(AdapterCommand::UnregisterCallback) => Some(Registration::Unregister),
            Command::Spp(SppCommand::RegisterApp { .. }) => Some(Registration::Register),
            Command::Spp(SppCommand::UnregisterApp) => Some(Registration::Unregister),
            Command::HidDevice(HidDeviceCommand::RegisterCallback) => Some(Registration::Register),
            Command::HidDevice(HidDeviceCommand::UnregisterCallback) => Some(Registration::Unregister),
            _ => None,
        }
    }

    pub fn to_envelope(&self) -> anyhow::Result<Envelope> {
        let mut buf = Vec::with_capacity(PAYLOAD_SIZE);
        match self {
            Command::Manager(c) => c.ser(&mut buf)?,
            Command::Adapter(c) => c.ser(&mut buf)?,
            Command::Spp(c) => c.ser(&mut buf)?,
            Command::HidDevice(c) => c.ser(&mut buf)?,
        }
        Envelope::with_payload(self.code(), &buf)
    }

    /// Decode the payload arm selected by the envelope's code. Event codes and codes outside
    ///  every range are rejected, never decoded with some other arm's layout.
    pub fn from_envelope(envelope: &Envelope) -> anyhow::Result<Command> {
        let code = envelope.code;
        let mut buf: &[u8] = &envelope.payload;

        let result = match code.classify()? {
            CodeClass::Command(ProfileId::Manager) => Command::Manager(ManagerCommand::try_deser(code, &mut buf)?),
            CodeClass::Command(ProfileId::Adapter) => Command::Adapter(AdapterCommand::try_deser(code, &mut buf)?),
            CodeClass::Command(ProfileId::Spp) => Command::Spp(SppCommand::try_deser(code, &mut buf)?),
            CodeClass::Command(ProfileId::HidDevice) => Command::HidDevice(HidDeviceCommand::try_deser(code, &mut buf)?),
            CodeClass::Event(_) => bail!("{:?} is an event code, not a command", code),
        };
        Ok(result)
    }
}

impl From<ManagerCommand> for Command {
    fn from(value: ManagerCommand) -> Command {
        Command::Manager(value)
    }
}
impl From<AdapterCommand> for Command {
    fn from(value: AdapterCommand) -> Command {
        Command::Adapter(value)
    }
}
impl From<SppCommand> for Command {
    fn from(value: SppCommand) -> Command {
        Command::Spp(value)
    }
}
impl From<HidDeviceCommand> for Command {
    fn from(value: HidDeviceCommand) -> Command {
        Command::HidDevice(value)
    }
}

/// An asynchronous notification decoded from the event range of the code space
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Event {
    Adapter(AdapterEvent),
    Spp(SppEvent),
    HidDevice(HidDeviceEvent),
}

impl Event {
    pub fn profile(&self) -> ProfileId {
        match self {
            Event::Adapter(_) => ProfileId::Adapter,
            Event::Spp(_) => ProfileId::Spp,
            Event::HidDevice(_) => ProfileId::HidDevice,
        }
    }

    pub fn code(&self) -> MessageCode {
        match self {
            Event::Adapter(e) => e.code().into(),
            Event::Spp(e) => e.code().into(),
            Event::HidDevice(e) => e.code().into(),
        }
    }

    pub fn to_envelope(&self) -> anyhow::Result<Envelope> {
        let mut buf = Vec::with_capacity(PAYLOAD_SIZE);
        match self {
            Event::Adapter(e) => e.ser(&mut buf)?,
            Event::Spp(e) => e.ser(&mut buf)?,
            Event::HidDevice(e) => e.ser(&mut buf)?,
        }
        Envelope::with_payload(self.code(), &buf)
    }

    pub fn from_envelope(envelope: &Envelope) -> anyhow::Result<Event> {
        let code = envelope.code;
        let mut buf: &[u8] = &envelope.payload;

        let result = match code.classify()? {
            CodeClass::Event(ProfileId::Adapter) => Event::Adapter(AdapterEvent::try_deser(code, &mut buf)?),
            CodeClass::Event(ProfileId::Spp) => Event::Spp(SppEvent::try_deser(code, &mut buf)?),
            CodeClass::Event(ProfileId::HidDevice) => Event::HidDevice(HidDeviceEvent::try_deser(code, &mut buf)?),
            CodeClass::Event(ProfileId::Manager) => bail!("the manager profile has no events"),
            CodeClass::Command(_) => bail!("{:?} is a command code, not an event", code),
        };
        Ok(result)
    }
}

impl From<AdapterEvent> for Event {
    fn from(value: AdapterEvent) -> Event {
        Event::Adapter(value)
    }
}
impl From<SppEvent> for Event {
    fn from(value: SppEvent) -> Event {
        Event::Spp(value)
    }
}
impl From<HidDeviceEvent> for Event {
    fn from(value: HidDeviceEvent) -> Event {
        Event::HidDevice(value)
    }
}


/// Send `command` through the envelope's byte form and back, checking that neither the decoded
///  command nor the re-encoded bytes change
#[cfg(test)]
pub(crate) fn assert_command_round_trip(command: Command) {
    let envelope = command.to_envelope().unwrap();
    assert_eq!(envelope.code, command.code());
    let bytes = envelope.to_bytes();

    let decoded = Command::from_envelope(&Envelope::from_bytes(&bytes)).unwrap();
    assert_eq!(decoded, command);
    assert_eq!(decoded.to_envelope().unwrap().to_bytes(), bytes, "{:?}", command);
}

#[cfg(test)]
pub(crate) fn assert_event_round_trip(event: Event) {
    let envelope = event.to_envelope().unwrap();
    assert_eq!(envelope.code, event.code());
    let bytes = envelope.to_bytes();

    let decoded = Event::from_envelope(&Envelope::from_bytes(&bytes)).unwrap();
    assert_eq!(decoded, event);
    assert_eq!(decoded.to_envelope().unwrap().to_bytes(), bytes, "{:?}", event);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::types::*;
    use crate::message::AdapterCommandCode;
    use crate::status::IpcError;
    use rstest::rstest;

    fn addr() -> BtAddress {
        BtAddress([1, 2, 3, 4, 5, 6])
    }

    #[rstest]
    #[case::create_instance(ManagerCommand::CreateInstance { handle: 0x1122334455667788, pid: 17, kind: 1, cpu_name: "ap".to_string() }.into())]
    #[case::start_service(ManagerCommand::StartService { app_id: 3, service_id: 9 }.into())]
    #[case::adapter_register(AdapterCommand::RegisterCallback.into())]
    #[case::set_name(AdapterCommand::SetName { name: "my-phone".to_string() }.into())]
    #[case::get_address(AdapterCommand::GetAddress { addr: addr() }.into())]
    #[case::spp_register_named(SppCommand::RegisterApp { name: Some("console".to_string()), port_type: SppPortType::RpmsgUart }.into())]
    #[case::spp_register_anonymous(SppCommand::RegisterApp { name: None, port_type: SppPortType::Tty }.into())]
    #[case::spp_connect(SppCommand::Connect { addr: addr(), scn: -1, uuid: BtUuid::from_u16(0x1101), port: 0 }.into())]
    #[case::hid_register_app(HidDeviceCommand::RegisterApp { sdp: vec![0x35, 0x10, 0x09], le_hid: true }.into())]
    #[case::hid_full_report(HidDeviceCommand::SendReport { addr: addr(), id: 2, data: vec![0xab; 256] }.into())]
    #[case::hid_empty_report(HidDeviceCommand::SendReport { addr: addr(), id: 0, data: vec![] }.into())]
    fn test_command_edge_cases_through_envelope(#[case] command: Command) {
        assert_command_round_trip(command);
    }

    #[rstest]
    #[case::adapter_state(AdapterEvent::AdapterStateChanged { state: AdapterState::TurningOn }.into())]
    #[case::device_name(AdapterEvent::DeviceNameChanged { name: "x".to_string() }.into())]
    #[case::pty_open(SppEvent::PtyOpen { addr: addr(), scn: 3, port: 12, name: "/dev/pts/3".to_string() }.into())]
    #[case::hid_report(HidDeviceEvent::ReceiveReport { addr: addr(), report_type: 1, data: vec![1, 2, 3] }.into())]
    fn test_event_edge_cases_through_envelope(#[case] event: Event) {
        assert_event_round_trip(event);
    }

    #[test]
    fn test_class_mismatch_is_rejected() {
        let event = Event::from(AdapterEvent::PairRequest { addr: addr() }).to_envelope().unwrap();
        assert!(Command::from_envelope(&event).is_err());

        let command = Command::from(AdapterCommand::Enable).to_envelope().unwrap();
        assert!(Event::from_envelope(&command).is_err());
    }

    #[test]
    fn test_unknown_code_is_rejected() {
        let envelope = Envelope::new(MessageCode(17));
        let err = Command::from_envelope(&envelope).unwrap_err();
        assert_eq!(err.downcast_ref::<IpcError>(), Some(&IpcError::UnknownCode(MessageCode(17))));
    }

    #[test]
    fn test_invalid_payload_is_rejected() {
        let mut envelope = Envelope::new(MessageCode(41));
        envelope.payload[0] = 200;
        assert!(Event::from_envelope(&envelope).is_err());
    }

    #[test]
    fn test_oversize_payload() {
        let command = Command::from(HidDeviceCommand::SendReport { addr: addr(), id: 2, data: vec![0; 257] });
        assert!(command.to_envelope().is_err());

        let command = Command::from(AdapterCommand::SetName { name: "n".repeat(64) });
        assert!(command.to_envelope().is_err());
    }

    #[rstest]
    #[case::create_instance(ManagerCommandCode::CreateInstance.into(), ResultShape::Value)]
    #[case::get_instance(ManagerCommandCode::GetInstance.into(), ResultShape::Value)]
    #[case::delete_instance(ManagerCommandCode::DeleteInstance.into(), ResultShape::Status)]
    #[case::adapter_get_state(AdapterCommandCode::GetState.into(), ResultShape::Status)]
    #[case::spp_register(SppCommandCode::RegisterApp.into(), ResultShape::Value)]
    #[case::spp_connect(SppCommandCode::Connect.into(), ResultShape::Status)]
    #[case::event(MessageCode(41), ResultShape::Status)]
    #[case::unknown(MessageCode(4711), ResultShape::Status)]
    fn test_result_shape_by_code(#[case] code: MessageCode, #[case] expected: ResultShape) {
        assert_eq!(ResultShape::of(code), expected);
    }

    #[test]
    fn test_result_shape_of_command_matches_its_code() {
        let create = Command::from(ManagerCommand::CreateInstance { handle: 1, pid: 2, kind: 0, cpu_name: String::new() });
        assert_eq!(create.result_shape(), ResultShape::Value);
        let register = Command::from(SppCommand::RegisterApp { name: None, port_type: SppPortType::Tty });
        assert_eq!(register.result_shape(), ResultShape::Value);
        let get_state = Command::from(AdapterCommand::GetState { state: AdapterState::Off });
        assert_eq!(get_state.result_shape(), ResultShape::Status);
    }

    #[test]
    fn test_registration() {
        assert_eq!(Command::from(AdapterCommand::RegisterCallback).registration(), Some(Registration::Register));
        assert_eq!(Command::from(SppCommand::UnregisterApp).registration(), Some(Registration::Unregister));
        assert_eq!(Command::from(AdapterCommand::GetState { state: AdapterState::Off }).registration(), None);
        assert_eq!(Command::from(AdapterCommand::GetState { state: AdapterState::Off }).code(), MessageCode::from(AdapterCommandCode::GetState));
    }
}
