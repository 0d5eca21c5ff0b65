use bytes::{Buf, BufMut};
use crate::message::{ManagerCommandCode, MessageCode, ResultShape};
use crate::message::types::NAME_FIELD_LEN;
use crate::util::buf_ext::{BufExt, BufMutExt};

/// Instance bookkeeping on the service side. The manager has no events.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum ManagerCommand {
    /// reply: the new app id as a value, `0` on failure
    CreateInstance { handle: u64, pid: u32, kind: u32, cpu_name: String },
    DeleteInstance { app_id: u32 },
    /// reply: the handle registered for `(pid, cpu_name)` as a value, `0` if there is none
    GetInstance { pid: u32, cpu_name: String },
    StartService { app_id: u32, service_id: u8 },
    StopService { app_id: u32, service_id: u8 },
}

impl ManagerCommandCode {
    pub fn result_shape(self) -> ResultShape {
        match self {
            ManagerCommandCode::CreateInstance | ManagerCommandCode::GetInstance => ResultShape::Value,
            _ => ResultShape::Status,
        }
    }
}

impl ManagerCommand {
    pub fn code(&self) -> ManagerCommandCode {
        match self {
            ManagerCommand::CreateInstance { .. } => ManagerCommandCode::CreateInstance,
            ManagerCommand::DeleteInstance { .. } => ManagerCommandCode::DeleteInstance,
            ManagerCommand::GetInstance { .. } => ManagerCommandCode::GetInstance,
            ManagerCommand::StartService { .. } => ManagerCommandCode::StartService,
            ManagerCommand::StopService { .. } => ManagerCommandCode::StopService,
        }
    }

    pub fn ser(&self, buf: &mut impl BufMut) -> anyhow::Result<()> {
        match self {
            ManagerCommand::CreateInstance { handle, pid, kind, cpu_name } => {
                buf.put_u64_le(*handle);
                buf.put_u32_le(*pid);
                buf.put_u32_le(*kind);
                buf.put_fixed_str(cpu_name, NAME_FIELD_LEN)?;
            }
            ManagerCommand::DeleteInstance { app_id } => {
                buf.put_u32_le(*app_id);
            }
            ManagerCommand::GetInstance { pid, cpu_name } => {
                buf.put_u32_le(*pid);
                buf.put_fixed_str(cpu_name, NAME_FIELD_LEN)?;
            }
            ManagerCommand::StartService { app_id, service_id } |
            ManagerCommand::StopService { app_id, service_id } => {
                buf.put_u32_le(*app_id);
                buf.put_u8(*service_id);
                buf.put_bytes(0, 3);
            }
        }
        Ok(())
    }

    pub fn try_deser(code: MessageCode, buf: &mut impl Buf) -> anyhow::Result<ManagerCommand> {
        let result = match ManagerCommandCode::try_from(code)? {
            ManagerCommandCode::CreateInstance => ManagerCommand::CreateInstance {
                handle: buf.try_read_u64_le()?,
                pid: buf.try_read_u32_le()?,
                kind: buf.try_read_u32_le()?,
                cpu_name: buf.try_read_fixed_str(NAME_FIELD_LEN)?,
            },
            ManagerCommandCode::DeleteInstance => ManagerCommand::DeleteInstance {
                app_id: buf.try_read_u32_le()?,
            },
            ManagerCommandCode::GetInstance => ManagerCommand::GetInstance {
                pid: buf.try_read_u32_le()?,
                cpu_name: buf.try_read_fixed_str(NAME_FIELD_LEN)?,
            },
            ManagerCommandCode::StartService => {
                let app_id = buf.try_read_u32_le()?;
                let service_id = buf.try_read_u8()?;
                ManagerCommand::StartService { app_id, service_id }
            }
            ManagerCommandCode::StopService => {
                let app_id = buf.try_read_u32_le()?;
                let service_id = buf.try_read_u8()?;
                ManagerCommand::StopService { app_id, service_id }
            }
        };
        Ok(result)
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::packet::assert_command_round_trip;

    fn sample_command(code: ManagerCommandCode) -> ManagerCommand {
        match code {
            ManagerCommandCode::CreateInstance => ManagerCommand::CreateInstance { handle: 0x1122334455667788, pid: 4711, kind: 2, cpu_name: "audio".to_string() },
            ManagerCommandCode::DeleteInstance => ManagerCommand::DeleteInstance { app_id: 9 },
            ManagerCommandCode::GetInstance => ManagerCommand::GetInstance { pid: 4711, cpu_name: "ap".to_string() },
            ManagerCommandCode::StartService => ManagerCommand::StartService { app_id: 9, service_id: 3 },
            ManagerCommandCode::StopService => ManagerCommand::StopService { app_id: 9, service_id: 4 },
        }
    }

    #[test]
    fn test_every_command_through_envelope() {
        for &code in ManagerCommandCode::ALL {
            let command = sample_command(code);
            assert_eq!(command.code(), code);
            assert_command_round_trip(command.into());
        }
    }

    #[test]
    fn test_create_instance_layout() {
        let mut buf = Vec::new();
        sample_command(ManagerCommandCode::CreateInstance).ser(&mut buf).unwrap();
        assert_eq!(buf.len(), 8 + 4 + 4 + NAME_FIELD_LEN);
        assert_eq!(&buf[..8], &0x1122334455667788u64.to_le_bytes());
        assert_eq!(&buf[8..12], &4711u32.to_le_bytes());
        assert_eq!(&buf[12..16], &2u32.to_le_bytes());
        assert_eq!(&buf[16..22], b"audio\0");
    }

    #[test]
    fn test_result_shape() {
        for &code in ManagerCommandCode::ALL {
            let expected = match code {
                ManagerCommandCode::CreateInstance | ManagerCommandCode::GetInstance => ResultShape::Value,
                _ => ResultShape::Status,
            };
            assert_eq!(code.result_shape(), expected, "{:?}", code);
        }
    }
}
