//! Protocol status and alarm codes.
//!
//! Status codes answer each received line (`ok` / `error:<n>`). Alarm codes
//! report runtime critical events (`ALARM:<n>`) and lock the machine until
//! reset. Both sets of numeric values are part of the wire protocol and must
//! not change.

/// Per-line execution status, reported as `ok` or `error:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Status {
    Ok = 0,
    /// Line starts with something other than a letter or `$`.
    ExpectedCommandLetter = 1,
    /// A numeric word value could not be parsed.
    BadNumberFormat = 2,
    /// `$` command not recognized or malformed.
    InvalidStatement = 3,
    /// Negative value for a setting that requires positive.
    NegativeValue = 4,
    /// Homing requested while the homing setting is disabled.
    SettingDisabled = 5,
    /// Step pulse time below the supported minimum.
    SettingStepPulseMin = 6,
    /// Non-volatile read failed; defaults were restored.
    SettingReadFail = 7,
    /// Command requires the machine idle (or idle/alarm).
    IdleError = 8,
    /// G-code lines locked out while in alarm or jog.
    SystemGcLock = 9,
    /// Soft limits require homing to be enabled.
    SoftLimitError = 10,
    /// Line exceeded the input buffer.
    Overflow = 11,
    /// Requested rate beyond the supported step frequency.
    MaxStepRateExceeded = 12,
    /// Jog target exceeds machine travel.
    TravelExceeded = 15,
    /// Malformed `$J=` jog line.
    InvalidJogCommand = 16,
    /// G-code word starts with an unsupported letter.
    UnsupportedCommand = 20,
    /// Two commands from the same modal group on one line.
    ModalGroupViolation = 21,
    /// Feed-requiring motion with no feed rate set.
    UndefinedFeedRate = 22,
    /// Integer-valued word carries a fraction.
    CommandValueNotInteger = 23,
    /// A word was repeated on the line.
    WordRepeated = 25,
    /// Motion command with no axis words.
    NoAxisWords = 26,
    /// Line number out of range.
    InvalidLineNumber = 27,
    /// Command is missing a required value word.
    ValueWordMissing = 28,
    /// Work coordinate system beyond G59.
    UnsupportedCoordSys = 29,
    /// Axis words present that the commands on the line do not use.
    UnusedWords = 31,
    /// Arc without offsets or radius in the active plane.
    NoOffsetsInPlane = 32,
    /// Arc target geometry unreachable.
    InvalidTarget = 33,
    /// Arc radius definition cannot produce the target.
    ArcRadiusError = 34,
}

impl Status {
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    /// Short operator-facing text for the `[MSG:…]` line ahead of the error.
    pub const fn message(self) -> &'static str {
        match self {
            Self::Ok => "",
            Self::ExpectedCommandLetter => "expected letter",
            Self::BadNumberFormat => "bad number",
            Self::InvalidStatement => "$UNK",
            Self::NegativeValue => "-#",
            Self::SettingDisabled => "setting disabled",
            Self::SettingStepPulseMin => "pulse<3us",
            Self::SettingReadFail => "MEMinit",
            Self::IdleError => "not idle",
            Self::SystemGcLock => "locked",
            Self::SoftLimitError => "homing required",
            Self::Overflow => "line too long",
            Self::MaxStepRateExceeded => "step rate",
            Self::TravelExceeded => "jogLIM",
            Self::InvalidJogCommand => "jogINV",
            Self::UnsupportedCommand => "G-code bad",
            Self::ModalGroupViolation => "G-code conflict",
            Self::UndefinedFeedRate => "G-code F?",
            Self::CommandValueNotInteger => "G-code int",
            Self::WordRepeated => "G-code word repeat",
            Self::NoAxisWords => "G-code missing axis",
            Self::InvalidLineNumber => "G-code Ln",
            Self::ValueWordMissing => "G-code missing value",
            Self::UnsupportedCoordSys => "G-code G59",
            Self::UnusedWords => "G-code unused word",
            Self::NoOffsetsInPlane => "G-code missing IJ|R",
            Self::InvalidTarget => "G-code targ",
            Self::ArcRadiusError => "G-code R",
        }
    }
}

/// Critical runtime events, reported as `ALARM:<n>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Alarm {
    /// A limit switch tripped during normal operation.
    HardLimit = 1,
    /// A commanded target was outside the machine envelope.
    SoftLimit = 2,
    /// Reset issued while motion was in progress. Position lost.
    AbortCycle = 3,
    /// Probe was already tripped at probe-cycle start.
    ProbeFailInitial = 4,
    /// Probe traveled the full distance without contact.
    ProbeFailContact = 5,
    /// Reset issued during homing.
    HomingFailReset = 6,
    /// Limit switch still engaged after pull-off.
    HomingFailPulloff = 7,
    /// Limit switch not found within the search distance.
    HomingFailApproach = 8,
}

impl Alarm {
    #[inline]
    pub const fn code(self) -> u8 {
        self as u8
    }

    #[inline]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::HardLimit),
            2 => Some(Self::SoftLimit),
            3 => Some(Self::AbortCycle),
            4 => Some(Self::ProbeFailInitial),
            5 => Some(Self::ProbeFailContact),
            6 => Some(Self::HomingFailReset),
            7 => Some(Self::HomingFailPulloff),
            8 => Some(Self::HomingFailApproach),
            _ => None,
        }
    }

    /// Short operator-facing description for the `[MSG:…]` line.
    pub const fn message(self) -> &'static str {
        match self {
            Self::HardLimit => "Hard limit",
            Self::SoftLimit => "Soft limit",
            Self::AbortCycle => "Reset while in motion",
            Self::ProbeFailInitial => "Probe fail: initial state",
            Self::ProbeFailContact => "Probe fail: no contact",
            Self::HomingFailReset => "Homing fail: reset",
            Self::HomingFailPulloff => "Homing fail: pull-off",
            Self::HomingFailApproach => "Homing fail: switch not found",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alarm_roundtrip() {
        for v in 1..=8u8 {
            let alarm = Alarm::from_u8(v).unwrap();
            assert_eq!(alarm.code(), v);
        }
        assert!(Alarm::from_u8(0).is_none());
        assert!(Alarm::from_u8(9).is_none());
    }

    #[test]
    fn status_codes_are_wire_values() {
        assert_eq!(Status::Ok.code(), 0);
        assert_eq!(Status::IdleError.code(), 8);
        assert_eq!(Status::SystemGcLock.code(), 9);
        assert_eq!(Status::Overflow.code(), 11);
        assert_eq!(Status::InvalidJogCommand.code(), 16);
        assert_eq!(Status::ArcRadiusError.code(), 34);
    }
}
