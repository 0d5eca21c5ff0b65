use std::fmt::{Display, Formatter};
use std::time::Duration;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::message::MessageCode;

/// Status byte as reported by the Bluetooth service. The extended range starts at
///  `WakelockError + 0x20`.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum BtStatus {
    Success = 0,
    Fail = 1,
    NotReady = 2,
    NoMem = 3,
    Busy = 4,
    Done = 5,
    Unsupported = 6,
    ParmInvalid = 7,
    Unhandled = 8,
    AuthFailure = 9,
    RmtDevDown = 10,
    AuthRejected = 11,
    JniEnvironmentError = 12,
    JniThreadAttachError = 13,
    WakelockError = 14,

    ErrorButUnknown = 47,
    NotFound = 48,
    DeviceNotFound = 49,
    ServiceNotFound = 50,
    NoResources = 51,
    IpcError = 52,
    PageTimeout = 53,
    RmtDevTerminate = 54,
    LocalTerminated = 55,
}

impl BtStatus {
    /// Status bytes this side does not know are reported as `ErrorButUnknown` rather than
    ///  rejected: a newer service may report finer-grained failures.
    pub fn from_wire(raw: u8) -> BtStatus {
        BtStatus::try_from(raw)
            .unwrap_or(BtStatus::ErrorButUnknown)
    }

    pub fn is_success(&self) -> bool {
        *self == BtStatus::Success
    }

    /// turn a peer-reported status into a `Result`, wrapping failures as [IpcError::Status]
    pub fn check(self) -> anyhow::Result<()> {
        if self.is_success() {
            Ok(())
        }
        else {
            Err(IpcError::Status(self).into())
        }
    }
}

/// Failure categories a caller of the IPC layer may want to tell apart. They travel inside
///  `anyhow::Error` and can be recovered with `downcast_ref::<IpcError>()`.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum IpcError {
    /// the reconnect budget was exhausted before a connection was established
    ConnectFailed { attempts: u32 },
    /// the connection was lost or shut down; the session is unusable afterwards
    TransportDown(String),
    /// no reply arrived within the configured command timeout
    Timeout(Duration),
    /// a code outside every known command and event range
    UnknownCode(MessageCode),
    /// a reply arrived, but for a different command than the one in flight
    UnexpectedCode { expected: MessageCode, actual: MessageCode },
    RegistryFull { capacity: usize },
    AlreadyRegistered,
    /// the registry's last subscriber left, and it does not accept new registrations
    RegistryClosed,
    /// the peer answered with a non-success status
    Status(BtStatus),
}

impl IpcError {
    /// the status an API surface reports for this failure
    pub fn status(&self) -> BtStatus {
        match self {
            IpcError::ConnectFailed { .. } => BtStatus::IpcError,
            IpcError::TransportDown(_) => BtStatus::IpcError,
            IpcError::Timeout(_) => BtStatus::IpcError,
            IpcError::UnknownCode(_) => BtStatus::IpcError,
            IpcError::UnexpectedCode { .. } => BtStatus::IpcError,
            IpcError::RegistryFull { .. } => BtStatus::NoResources,
            IpcError::AlreadyRegistered => BtStatus::Busy,
            IpcError::RegistryClosed => BtStatus::NotReady,
            IpcError::Status(s) => *s,
        }
    }

    /// Find the [IpcError] in an `anyhow` error chain, if there is one
    pub fn find(e: &anyhow::Error) -> Option<&IpcError> {
        e.chain()
            .find_map(|c| c.downcast_ref::<IpcError>())
    }

    /// Map any error to the status an API surface reports: errors without an [IpcError] in
    ///  their chain are plain failures.
    pub fn status_of(e: &anyhow::Error) -> BtStatus {
        IpcError::find(e)
            .map(|e| e.status())
            .unwrap_or(BtStatus::Fail)
    }
}

impl Display for IpcError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            IpcError::ConnectFailed { attempts } => write!(f, "could not connect after {} attempts", attempts),
            IpcError::TransportDown(reason) => write!(f, "transport down: {}", reason),
            IpcError::Timeout(d) => write!(f, "no reply after {:?}", d),
            IpcError::UnknownCode(code) => write!(f, "unknown message code {:?}", code),
            IpcError::UnexpectedCode { expected, actual } => write!(f, "expected reply for {:?}, got {:?}", expected, actual),
            IpcError::RegistryFull { capacity } => write!(f, "callback registry is full (capacity {})", capacity),
            IpcError::AlreadyRegistered => write!(f, "callbacks are already registered"),
            IpcError::RegistryClosed => write!(f, "callback registry is closed"),
            IpcError::Status(s) => write!(f, "peer returned {:?}", s),
        }
    }
}

impl std::error::Error for IpcError {}


#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;
    use rstest::rstest;

    #[rstest]
    #[case::success(0, BtStatus::Success)]
    #[case::busy(4, BtStatus::Busy)]
    #[case::wakelock(14, BtStatus::WakelockError)]
    #[case::gap_below_extended(15, BtStatus::ErrorButUnknown)]
    #[case::gap_just_below_extended(46, BtStatus::ErrorButUnknown)]
    #[case::not_found(48, BtStatus::NotFound)]
    #[case::ipc_error(52, BtStatus::IpcError)]
    #[case::local_terminated(55, BtStatus::LocalTerminated)]
    #[case::beyond(200, BtStatus::ErrorButUnknown)]
    fn test_status_from_wire(#[case] raw: u8, #[case] expected: BtStatus) {
        assert_eq!(BtStatus::from_wire(raw), expected);
    }

    #[test]
    fn test_extended_range_offset() {
        assert_eq!(u8::from(BtStatus::WakelockError) + 0x20 + 1, u8::from(BtStatus::ErrorButUnknown));
    }

    #[test]
    fn test_check() {
        assert!(BtStatus::Success.check().is_ok());

        let err = BtStatus::Busy.check().unwrap_err();
        assert_eq!(IpcError::find(&err), Some(&IpcError::Status(BtStatus::Busy)));
    }

    #[rstest]
    #[case::timeout(IpcError::Timeout(Duration::from_secs(1)), BtStatus::IpcError)]
    #[case::down(IpcError::TransportDown("closed".to_string()), BtStatus::IpcError)]
    #[case::full(IpcError::RegistryFull { capacity: 1 }, BtStatus::NoResources)]
    #[case::dup(IpcError::AlreadyRegistered, BtStatus::Busy)]
    #[case::peer(IpcError::Status(BtStatus::AuthRejected), BtStatus::AuthRejected)]
    fn test_error_status(#[case] error: IpcError, #[case] expected: BtStatus) {
        assert_eq!(error.status(), expected);
    }

    #[test]
    fn test_status_of_context_chain() {
        let err: anyhow::Result<()> = Err(IpcError::Timeout(Duration::from_millis(5)).into());
        let err = err.context("get state").unwrap_err();
        assert_eq!(IpcError::status_of(&err), BtStatus::IpcError);

        let plain = anyhow::anyhow!("something else");
        assert_eq!(IpcError::status_of(&plain), BtStatus::Fail);
    }
}
