use std::fmt::{Debug, Formatter};
use num_enum::{IntoPrimitive, TryFromPrimitive};
use crate::status::IpcError;

/// The code of an [Envelope](crate::message::Envelope). Its numeric range alone determines
///  whether a packet is a command (or its reply) or an event, and which profile it belongs to.
#[derive(Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct MessageCode(pub u32);

impl MessageCode {
    pub fn classify(self) -> Result<CodeClass, IpcError> {
        for ranges in PROFILE_RANGES.iter() {
            if ranges.commands.contains(self) {
                return Ok(CodeClass::Command(ranges.profile));
            }
            if ranges.events.contains(self) {
                return Ok(CodeClass::Event(ranges.profile));
            }
        }
        Err(IpcError::UnknownCode(self))
    }

    fn name(self) -> Option<&'static str> {
        match self.classify().ok()? {
            CodeClass::Command(ProfileId::Manager) => ManagerCommandCode::try_from(self.0).ok().map(|c| c.name()),
            CodeClass::Command(ProfileId::Adapter) => AdapterCommandCode::try_from(self.0).ok().map(|c| c.name()),
            CodeClass::Command(ProfileId::Spp) => SppCommandCode::try_from(self.0).ok().map(|c| c.name()),
            CodeClass::Command(ProfileId::HidDevice) => HidDeviceCommandCode::try_from(self.0).ok().map(|c| c.name()),
            CodeClass::Event(ProfileId::Manager) => None,
            CodeClass::Event(ProfileId::Adapter) => AdapterEventCode::try_from(self.0).ok().map(|c| c.name()),
            CodeClass::Event(ProfileId::Spp) => SppEventCode::try_from(self.0).ok().map(|c| c.name()),
            CodeClass::Event(ProfileId::HidDevice) => HidDeviceEventCode::try_from(self.0).ok().map(|c| c.name()),
        }
    }
}

impl Debug for MessageCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.name() {
            Some(name) => write!(f, "{}({})", name, self.0),
            None => write!(f, "MessageCode({})", self.0),
        }
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash)]
pub enum CodeClass {
    Command(ProfileId),
    Event(ProfileId),
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum ProfileId {
    Manager,
    Adapter,
    Spp,
    HidDevice,
}

impl ProfileId {
    pub const ALL: [ProfileId; 4] = [ProfileId::Manager, ProfileId::Adapter, ProfileId::Spp, ProfileId::HidDevice];

    fn ranges(self) -> &'static ProfileRanges {
        match self {
            ProfileId::Manager => &PROFILE_RANGES[0],
            ProfileId::Adapter => &PROFILE_RANGES[1],
            ProfileId::Spp => &PROFILE_RANGES[2],
            ProfileId::HidDevice => &PROFILE_RANGES[3],
        }
    }

    pub fn command_range(self) -> CodeRange {
        self.ranges().commands
    }

    pub fn event_range(self) -> CodeRange {
        self.ranges().events
    }
}

/// A profile's code range, delimited by its `START` and `END` sentinels. The sentinels
///  themselves are not valid codes.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub struct CodeRange {
    pub start: u32,
    pub end: u32,
}

impl CodeRange {
    pub fn contains(&self, code: MessageCode) -> bool {
        self.start < code.0 && code.0 < self.end
    }

    /// `true` for a range without any codes between its sentinels
    pub fn is_empty(&self) -> bool {
        self.end <= self.start + 1
    }
}

pub const MESSAGE_START: u32 = 0;
pub const MESSAGE_END: u32 = 36;
pub const CALLBACK_START: u32 = 37;
pub const CALLBACK_END: u32 = 56;

struct ProfileRanges {
    profile: ProfileId,
    commands: CodeRange,
    events: CodeRange,
}

const PROFILE_RANGES: [ProfileRanges; 4] = [
    ProfileRanges { profile: ProfileId::Manager,   commands: CodeRange { start: 1,  end: 7 },  events: CodeRange { start: 38, end: 39 } },
    ProfileRanges { profile: ProfileId::Adapter,   commands: CodeRange { start: 8,  end: 17 }, events: CodeRange { start: 40, end: 45 } },
    ProfileRanges { profile: ProfileId::Spp,       commands: CodeRange { start: 18, end: 25 }, events: CodeRange { start: 46, end: 49 } },
    ProfileRanges { profile: ProfileId::HidDevice, commands: CodeRange { start: 26, end: 35 }, events: CodeRange { start: 50, end: 55 } },
];


macro_rules! code_enum {
    ($name:ident { $($variant:ident = $value:literal),* $(,)? }) => {
        #[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
        #[repr(u32)]
        pub enum $name {
            $($variant = $value),*
        }

        impl $name {
            #[allow(dead_code)]
            pub const ALL: &'static [$name] = &[$($name::$variant),*];

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => stringify!($variant)),*
                }
            }
        }

        impl From<$name> for MessageCode {
            fn from(value: $name) -> MessageCode {
                MessageCode(value.into())
            }
        }

        impl TryFrom<MessageCode> for $name {
            type Error = IpcError;

            fn try_from(code: MessageCode) -> Result<$name, IpcError> {
                <$name as TryFromPrimitive>::try_from_primitive(code.0)
                    .map_err(|_| IpcError::UnknownCode(code))
            }
        }
    }
}

code_enum!(ManagerCommandCode {
    CreateInstance = 2,
    DeleteInstance = 3,
    GetInstance = 4,
    StartService = 5,
    StopService = 6,
});

code_enum!(AdapterCommandCode {
    RegisterCallback = 9,
    UnregisterCallback = 10,
    Enable = 11,
    Disable = 12,
    GetState = 13,
    SetName = 14,
    GetName = 15,
    GetAddress = 16,
});

code_enum!(SppCommandCode {
    RegisterApp = 19,
    UnregisterApp = 20,
    ServerStart = 21,
    ServerStop = 22,
    Connect = 23,
    Disconnect = 24,
});

code_enum!(HidDeviceCommandCode {
    RegisterCallback = 27,
    UnregisterCallback = 28,
    RegisterApp = 29,
    UnregisterApp = 30,
    Connect = 31,
    Disconnect = 32,
    SendReport = 33,
    VirtualUnplug = 34,
});

code_enum!(AdapterEventCode {
    OnAdapterStateChanged = 41,
    OnDiscoveryStateChanged = 42,
    OnDeviceNameChanged = 43,
    OnPairRequest = 44,
});

code_enum!(SppEventCode {
    PtyOpen = 47,
    ConnectionState = 48,
});

code_enum!(HidDeviceEventCode {
    AppState = 51,
    ConnectionState = 52,
    OnReceiveReport = 53,
    OnVirtualUnplug = 54,
});
