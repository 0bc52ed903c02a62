//! Olife wallbox register map and codec
//!
//! Pure conversion between raw 16-bit holding registers and typed values.
//! Nothing in here performs I/O. Decoding is total: every raw word yields a
//! value, and codes the map does not know are kept verbatim as `Unknown`.
//!
//! The station exposes three fixed blocks. The connector state and wattmeter
//! blocks exist once per connector; connector A (present on every station)
//! lives in the upper bank at +100, connector B in the lower bank.

use crate::error::{HeliosError, Result};
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fmt;

/// Physical charging socket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Connector {
    A,
    B,
}

impl Connector {
    pub const ALL: [Connector; 2] = [Connector::A, Connector::B];

    fn bank_offset(self) -> u16 {
        match self {
            Connector::A => 100,
            Connector::B => 0,
        }
    }
}

impl fmt::Display for Connector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Connector::A => write!(f, "A"),
            Connector::B => write!(f, "B"),
        }
    }
}

impl From<crate::config::ConnectorSelect> for Connector {
    fn from(value: crate::config::ConnectorSelect) -> Self {
        match value {
            crate::config::ConnectorSelect::A => Connector::A,
            crate::config::ConnectorSelect::B => Connector::B,
        }
    }
}

/// Fixed register blocks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum Block {
    ConnectorState,
    Wattmeter,
    GlobalConfig,
}

impl Block {
    /// Number of words read for the block
    pub const fn len(self) -> u16 {
        match self {
            Block::ConnectorState => 9,
            Block::Wattmeter => 14,
            Block::GlobalConfig => 9,
        }
    }

    pub const fn is_per_connector(self) -> bool {
        !matches!(self, Block::GlobalConfig)
    }

    /// First absolute address of the block
    pub fn base(self, connector: Option<Connector>) -> u16 {
        let bank = connector.map_or(0, Connector::bank_offset);
        match self {
            Block::ConnectorState => 2000 + bank,
            Block::Wattmeter => 4000 + bank,
            Block::GlobalConfig => 5000,
        }
    }
}

/// Offsets within the connector state block
pub mod status {
    pub const ERROR_CODE: u16 = 0;
    pub const VERIFY_USER: u16 = 1;
    pub const CHARGING_MODE: u16 = 2;
    pub const CONTROL_PILOT: u16 = 3;
    pub const EV_STATE: u16 = 4;
    pub const CHARGING_ENABLE: u16 = 5;
    pub const CURRENT_LIMIT: u16 = 6;
    pub const CHARGE_CURRENT: u16 = 7;
    pub const CABLE_LIMIT: u16 = 8;
}

/// Offsets within the wattmeter block
pub mod wattmeter {
    pub const VOLTAGE_L1: u16 = 0;
    pub const CURRENT_L1: u16 = 3;
    pub const SESSION_ENERGY: u16 = 6;
    pub const TOTAL_ENERGY: u16 = 8;
    pub const POWER_L1: u16 = 10;
    pub const TOTAL_POWER: u16 = 13;
}

/// Offsets within the global config block
pub mod global {
    pub const FIRMWARE_VERSION: u16 = 0;
    pub const SERIAL_NUMBER: u16 = 1;
    pub const AUTOMATIC: u16 = 3;
    pub const MAX_STATION_CURRENT: u16 = 6;
    pub const LED_BRIGHTNESS: u16 = 8;
}

/// Block, connector and offset of a single register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct RegisterAddress {
    block: Block,
    connector: Option<Connector>,
    offset: u16,
}

impl RegisterAddress {
    /// Address inside a per-connector block
    pub fn connector(connector: Connector, block: Block, offset: u16) -> Self {
        let connector = block.is_per_connector().then_some(connector);
        Self {
            block,
            connector,
            offset,
        }
    }

    /// Address inside the station-wide block
    pub fn global(offset: u16) -> Self {
        Self {
            block: Block::GlobalConfig,
            connector: None,
            offset,
        }
    }

    pub fn block(&self) -> Block {
        self.block
    }

    pub fn connector_id(&self) -> Option<Connector> {
        self.connector
    }

    pub fn offset(&self) -> u16 {
        self.offset
    }

    /// Absolute Modbus holding register address
    pub fn absolute(&self) -> u16 {
        self.block.base(self.connector) + self.offset
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.connector {
            Some(c) => write!(f, "{}[{:?}+{}]", c, self.block, self.offset),
            None => write!(f, "{:?}+{}", self.block, self.offset),
        }
    }
}

/// Vehicle-facing state reported by the station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EvState {
    CableUnplugged,
    CablePlugged,
    UserAuthenticated,
    Charging,
    CarSuspended,
    CurrentBelowSixAmps,
    NoAuthentication,
    Error,
    Unknown(u16),
}

impl EvState {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::CableUnplugged,
            2 => Self::CablePlugged,
            3 => Self::UserAuthenticated,
            4 => Self::Charging,
            5 => Self::CarSuspended,
            6 => Self::CurrentBelowSixAmps,
            7 => Self::NoAuthentication,
            90 => Self::Error,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::CableUnplugged => 1,
            Self::CablePlugged => 2,
            Self::UserAuthenticated => 3,
            Self::Charging => 4,
            Self::CarSuspended => 5,
            Self::CurrentBelowSixAmps => 6,
            Self::NoAuthentication => 7,
            Self::Error => 90,
            Self::Unknown(code) => code,
        }
    }

    /// A car is connected and may accept a new current limit
    pub fn is_chargeable(self) -> bool {
        matches!(
            self,
            Self::CablePlugged
                | Self::UserAuthenticated
                | Self::Charging
                | Self::CarSuspended
                | Self::CurrentBelowSixAmps
        )
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::CableUnplugged => "Cable Unplugged",
            Self::CablePlugged => "Cable Plugged",
            Self::UserAuthenticated => "User Authenticated",
            Self::Charging => "Charging",
            Self::CarSuspended => "Car Suspended",
            Self::CurrentBelowSixAmps => "Current Below 6A",
            Self::NoAuthentication => "No Authentication",
            Self::Error => "Error",
            Self::Unknown(_) => "Unknown",
        }
    }
}

/// IEC 61851 control pilot state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ControlPilot {
    A,
    B,
    C,
    D,
    E,
    F,
    Unknown(u16),
}

impl ControlPilot {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            1 => Self::A,
            2 => Self::B,
            3 => Self::C,
            4 => Self::D,
            5 => Self::E,
            6 => Self::F,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::A => 1,
            Self::B => 2,
            Self::C => 3,
            Self::D => 4,
            Self::E => 5,
            Self::F => 6,
            Self::Unknown(code) => code,
        }
    }
}

/// Station charging strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ChargingMode {
    Fast,
    Solar,
    Spot,
    Off,
    Unknown(u16),
}

impl ChargingMode {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Fast,
            1 => Self::Solar,
            2 => Self::Spot,
            3 => Self::Off,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::Fast => 0,
            Self::Solar => 1,
            Self::Spot => 2,
            Self::Off => 3,
            Self::Unknown(code) => code,
        }
    }

    /// Parse the lowercase names used in configuration and commands
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "fast" => Some(Self::Fast),
            "solar" => Some(Self::Solar),
            "spot" => Some(Self::Spot),
            "off" => Some(Self::Off),
            _ => None,
        }
    }
}

/// Two-state register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Switch {
    Off,
    On,
    Unknown(u16),
}

impl Switch {
    pub fn from_raw(raw: u16) -> Self {
        match raw {
            0 => Self::Off,
            1 => Self::On,
            other => Self::Unknown(other),
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::Off => 0,
            Self::On => 1,
            Self::Unknown(code) => code,
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, Self::On)
    }
}

impl From<bool> for Switch {
    fn from(value: bool) -> Self {
        if value { Self::On } else { Self::Off }
    }
}

/// Named fault bits of the error code register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorFlag {
    RcdFault,
    ControlPilotError,
    Overcurrent,
    Overvoltage,
    Undervoltage,
    Overtemperature,
    EmergencyStop,
    LockFault,
}

impl ErrorFlag {
    pub const ALL: [ErrorFlag; 8] = [
        ErrorFlag::RcdFault,
        ErrorFlag::ControlPilotError,
        ErrorFlag::Overcurrent,
        ErrorFlag::Overvoltage,
        ErrorFlag::Undervoltage,
        ErrorFlag::Overtemperature,
        ErrorFlag::EmergencyStop,
        ErrorFlag::LockFault,
    ];

    pub const fn mask(self) -> u16 {
        1 << (self as u16)
    }
}

/// Error bitfield; bits without a name are kept in the remainder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct ErrorFlags {
    raw: u16,
}

impl ErrorFlags {
    const KNOWN_MASK: u16 = 0x00FF;

    pub fn from_raw(raw: u16) -> Self {
        Self { raw }
    }

    pub fn raw(self) -> u16 {
        self.raw
    }

    pub fn contains(self, flag: ErrorFlag) -> bool {
        self.raw & flag.mask() != 0
    }

    /// Named flags that are set
    pub fn active(self) -> Vec<ErrorFlag> {
        ErrorFlag::ALL
            .iter()
            .copied()
            .filter(|f| self.contains(*f))
            .collect()
    }

    /// Set bits the map has no name for
    pub fn remainder(self) -> u16 {
        self.raw & !Self::KNOWN_MASK
    }

    pub fn is_clear(self) -> bool {
        self.raw == 0
    }
}

/// Enumerated state of any kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StateValue {
    Ev(EvState),
    Pilot(ControlPilot),
    Mode(ChargingMode),
    Switch(Switch),
}

impl StateValue {
    fn decode(kind: StateKind, raw: u16) -> Self {
        match kind {
            StateKind::EvState => Self::Ev(EvState::from_raw(raw)),
            StateKind::ControlPilot => Self::Pilot(ControlPilot::from_raw(raw)),
            StateKind::ChargingMode => Self::Mode(ChargingMode::from_raw(raw)),
            StateKind::Switch => Self::Switch(Switch::from_raw(raw)),
        }
    }

    fn kind(self) -> StateKind {
        match self {
            Self::Ev(_) => StateKind::EvState,
            Self::Pilot(_) => StateKind::ControlPilot,
            Self::Mode(_) => StateKind::ChargingMode,
            Self::Switch(_) => StateKind::Switch,
        }
    }

    pub fn raw(self) -> u16 {
        match self {
            Self::Ev(s) => s.raw(),
            Self::Pilot(s) => s.raw(),
            Self::Mode(s) => s.raw(),
            Self::Switch(s) => s.raw(),
        }
    }

    /// True when the raw code had no known meaning
    pub fn is_unknown(self) -> bool {
        matches!(
            self,
            Self::Ev(EvState::Unknown(_))
                | Self::Pilot(ControlPilot::Unknown(_))
                | Self::Mode(ChargingMode::Unknown(_))
                | Self::Switch(Switch::Unknown(_))
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    EvState,
    ControlPilot,
    ChargingMode,
    Switch,
}

/// Wire encoding of a register
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterKind {
    Raw,
    /// One word, value = raw / 10^decimals
    Unsigned { decimals: u8 },
    /// Two words big-endian, value = raw / 10^decimals
    Unsigned32 { decimals: u8 },
    /// One two's-complement word, value = raw / 10^decimals
    Signed { decimals: u8 },
    State(StateKind),
    ErrorBits,
}

impl RegisterKind {
    pub const fn words(self) -> u16 {
        match self {
            RegisterKind::Unsigned32 { .. } => 2,
            _ => 1,
        }
    }
}

/// Decoded register content
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RegisterValue {
    Raw(u16),
    Unsigned { raw: u32, decimals: u8 },
    Signed { raw: i32, decimals: u8 },
    State(StateValue),
    Bits(ErrorFlags),
}

impl RegisterValue {
    /// Numeric value with the scale applied
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            RegisterValue::Raw(raw) => Some(f64::from(raw)),
            RegisterValue::Unsigned { raw, decimals } => Some(scale(f64::from(raw), decimals)),
            RegisterValue::Signed { raw, decimals } => Some(scale(f64::from(raw), decimals)),
            RegisterValue::State(_) | RegisterValue::Bits(_) => None,
        }
    }

    pub fn as_state(&self) -> Option<StateValue> {
        match *self {
            RegisterValue::State(s) => Some(s),
            _ => None,
        }
    }

    /// Build an unscaled unsigned value, e.g. amps or a brightness level
    pub fn unsigned(raw: u32) -> Self {
        RegisterValue::Unsigned { raw, decimals: 0 }
    }
}

fn scale(value: f64, decimals: u8) -> f64 {
    value / 10f64.powi(i32::from(decimals))
}

/// One entry of the register table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDef {
    pub name: &'static str,
    pub block: Block,
    pub offset: u16,
    pub kind: RegisterKind,
    pub writable: bool,
    /// Inclusive raw range accepted by `encode`
    pub range: Option<(u32, u32)>,
}

impl RegisterDef {
    const fn read(name: &'static str, block: Block, offset: u16, kind: RegisterKind) -> Self {
        Self {
            name,
            block,
            offset,
            kind,
            writable: false,
            range: None,
        }
    }

    const fn write(
        name: &'static str,
        block: Block,
        offset: u16,
        kind: RegisterKind,
        min: u32,
        max: u32,
    ) -> Self {
        Self {
            name,
            block,
            offset,
            kind,
            writable: true,
            range: Some((min, max)),
        }
    }
}

const AMPS: RegisterKind = RegisterKind::Unsigned { decimals: 0 };
const TENTHS: RegisterKind = RegisterKind::Unsigned { decimals: 1 };
const WATT_HOURS: RegisterKind = RegisterKind::Unsigned32 { decimals: 0 };
const WATTS: RegisterKind = RegisterKind::Signed { decimals: 0 };
const SWITCH: RegisterKind = RegisterKind::State(StateKind::Switch);

const STANDARD_TABLE: &[RegisterDef] = &[
    // Connector state
    RegisterDef::read("error_code", Block::ConnectorState, status::ERROR_CODE, RegisterKind::ErrorBits),
    RegisterDef::write("verify_user", Block::ConnectorState, status::VERIFY_USER, SWITCH, 0, 1),
    RegisterDef::write(
        "charging_mode",
        Block::ConnectorState,
        status::CHARGING_MODE,
        RegisterKind::State(StateKind::ChargingMode),
        0,
        3,
    ),
    RegisterDef::read(
        "control_pilot",
        Block::ConnectorState,
        status::CONTROL_PILOT,
        RegisterKind::State(StateKind::ControlPilot),
    ),
    RegisterDef::read(
        "ev_state",
        Block::ConnectorState,
        status::EV_STATE,
        RegisterKind::State(StateKind::EvState),
    ),
    RegisterDef::write("charging_enable", Block::ConnectorState, status::CHARGING_ENABLE, SWITCH, 0, 1),
    RegisterDef::write("current_limit", Block::ConnectorState, status::CURRENT_LIMIT, AMPS, 0, 32),
    RegisterDef::read("charge_current", Block::ConnectorState, status::CHARGE_CURRENT, TENTHS),
    RegisterDef::read("cable_limit", Block::ConnectorState, status::CABLE_LIMIT, AMPS),
    // Wattmeter
    RegisterDef::read("voltage_l1", Block::Wattmeter, 0, TENTHS),
    RegisterDef::read("voltage_l2", Block::Wattmeter, 1, TENTHS),
    RegisterDef::read("voltage_l3", Block::Wattmeter, 2, TENTHS),
    RegisterDef::read("current_l1", Block::Wattmeter, 3, TENTHS),
    RegisterDef::read("current_l2", Block::Wattmeter, 4, TENTHS),
    RegisterDef::read("current_l3", Block::Wattmeter, 5, TENTHS),
    RegisterDef::read("session_energy", Block::Wattmeter, wattmeter::SESSION_ENERGY, WATT_HOURS),
    RegisterDef::read("total_energy", Block::Wattmeter, wattmeter::TOTAL_ENERGY, WATT_HOURS),
    RegisterDef::read("power_l1", Block::Wattmeter, 10, WATTS),
    RegisterDef::read("power_l2", Block::Wattmeter, 11, WATTS),
    RegisterDef::read("power_l3", Block::Wattmeter, 12, WATTS),
    RegisterDef::read("total_power", Block::Wattmeter, wattmeter::TOTAL_POWER, WATTS),
    // Global config
    RegisterDef::read("firmware_version", Block::GlobalConfig, global::FIRMWARE_VERSION, RegisterKind::Raw),
    RegisterDef::read(
        "serial_number",
        Block::GlobalConfig,
        global::SERIAL_NUMBER,
        RegisterKind::Unsigned32 { decimals: 0 },
    ),
    RegisterDef::read("automatic", Block::GlobalConfig, global::AUTOMATIC, SWITCH),
    RegisterDef::read("reserved_4", Block::GlobalConfig, 4, RegisterKind::Raw),
    RegisterDef::read("reserved_5", Block::GlobalConfig, 5, RegisterKind::Raw),
    RegisterDef::read("max_station_current", Block::GlobalConfig, global::MAX_STATION_CURRENT, AMPS),
    RegisterDef::read("reserved_7", Block::GlobalConfig, 7, RegisterKind::Raw),
    RegisterDef::write(
        "led_brightness",
        Block::GlobalConfig,
        global::LED_BRIGHTNESS,
        AMPS,
        0,
        1000,
    ),
];

/// Validated lookup table from (block, offset) to register definition
#[derive(Debug, Clone)]
pub struct RegisterMap {
    defs: BTreeMap<(Block, u16), RegisterDef>,
}

impl RegisterMap {
    /// The fixed Olife map
    pub fn standard() -> Result<Self> {
        Self::from_defs(STANDARD_TABLE.to_vec())
    }

    /// Build a map, rejecting overlapping or out-of-block entries
    pub fn from_defs(defs: Vec<RegisterDef>) -> Result<Self> {
        let mut occupied: HashSet<(Block, u16)> = HashSet::new();
        let mut names: HashSet<&'static str> = HashSet::new();
        let mut table = BTreeMap::new();

        for def in defs {
            if !names.insert(def.name) {
                return Err(HeliosError::config(format!(
                    "Register map: duplicate name '{}'",
                    def.name
                )));
            }
            let end = match def.offset.checked_add(def.kind.words()) {
                Some(end) if end <= def.block.len() => end,
                _ => {
                    return Err(HeliosError::config(format!(
                        "Register map: '{}' exceeds {:?} block",
                        def.name, def.block
                    )));
                }
            };
            if def.writable && def.range.is_none() {
                return Err(HeliosError::config(format!(
                    "Register map: writable '{}' has no range",
                    def.name
                )));
            }
            for word in def.offset..end {
                if !occupied.insert((def.block, word)) {
                    return Err(HeliosError::config(format!(
                        "Register map: '{}' overlaps word {} of {:?}",
                        def.name, word, def.block
                    )));
                }
            }
            table.insert((def.block, def.offset), def);
        }

        Ok(Self { defs: table })
    }

    pub fn get(&self, block: Block, offset: u16) -> Option<&RegisterDef> {
        self.defs.get(&(block, offset))
    }

    /// Definition for an address, or a validation error
    pub fn resolve(&self, address: &RegisterAddress) -> Result<&RegisterDef> {
        self.get(address.block(), address.offset()).ok_or_else(|| {
            HeliosError::validation(
                "register",
                format!("No register defined at {}", address),
            )
        })
    }

    /// Definitions of one block in offset order
    pub fn block_defs(&self, block: Block) -> impl Iterator<Item = &RegisterDef> {
        self.defs
            .range((block, 0)..=(block, u16::MAX))
            .map(|(_, def)| def)
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisterDef> {
        self.defs.values()
    }

    /// Slice a block read into named values
    pub fn decode_block(&self, block: Block, words: &[u16]) -> DecodedBlock {
        let values = self
            .block_defs(block)
            .map(|def| {
                let start = usize::from(def.offset);
                let end = (start + usize::from(def.kind.words())).min(words.len());
                let slice = words.get(start..end).unwrap_or(&[]);
                (def.offset, decode(def, slice))
            })
            .collect();
        DecodedBlock { block, values }
    }
}

/// Values of one block keyed by offset
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub block: Block,
    values: BTreeMap<u16, RegisterValue>,
}

impl DecodedBlock {
    pub fn get(&self, offset: u16) -> Option<RegisterValue> {
        self.values.get(&offset).copied()
    }

    pub fn f64(&self, offset: u16) -> f64 {
        self.get(offset).and_then(|v| v.as_f64()).unwrap_or(0.0)
    }

    pub fn raw_u32(&self, offset: u16) -> u32 {
        match self.get(offset) {
            Some(RegisterValue::Unsigned { raw, .. }) => raw,
            Some(RegisterValue::Raw(raw)) => u32::from(raw),
            _ => 0,
        }
    }

    pub fn state(&self, offset: u16) -> Option<StateValue> {
        self.get(offset).and_then(|v| v.as_state())
    }

    pub fn ev_state(&self) -> EvState {
        match self.state(status::EV_STATE) {
            Some(StateValue::Ev(s)) => s,
            _ => EvState::Unknown(0),
        }
    }

    pub fn switch(&self, offset: u16) -> Switch {
        match self.state(offset) {
            Some(StateValue::Switch(s)) => s,
            _ => Switch::Unknown(0),
        }
    }

    pub fn error_flags(&self) -> ErrorFlags {
        match self.get(status::ERROR_CODE) {
            Some(RegisterValue::Bits(flags)) => flags,
            _ => ErrorFlags::default(),
        }
    }

    /// Values whose raw code had no known meaning
    pub fn anomalies(&self) -> Vec<(u16, RegisterValue)> {
        self.values
            .iter()
            .filter(|(_, v)| match v {
                RegisterValue::State(s) => s.is_unknown(),
                RegisterValue::Bits(b) => b.remainder() != 0,
                _ => false,
            })
            .map(|(o, v)| (*o, *v))
            .collect()
    }
}

/// Decode raw words for one register. Never fails.
pub fn decode(def: &RegisterDef, words: &[u16]) -> RegisterValue {
    let Some(&first) = words.first() else {
        return RegisterValue::Raw(0);
    };
    match def.kind {
        RegisterKind::Raw => RegisterValue::Raw(first),
        RegisterKind::Unsigned { decimals } => RegisterValue::Unsigned {
            raw: u32::from(first),
            decimals,
        },
        RegisterKind::Unsigned32 { decimals } => match decode_u32(words) {
            Some(raw) => RegisterValue::Unsigned { raw, decimals },
            None => RegisterValue::Raw(first),
        },
        RegisterKind::Signed { decimals } => RegisterValue::Signed {
            raw: i32::from(first as i16),
            decimals,
        },
        RegisterKind::State(kind) => RegisterValue::State(StateValue::decode(kind, first)),
        RegisterKind::ErrorBits => RegisterValue::Bits(ErrorFlags::from_raw(first)),
    }
}

/// Encode a typed value for one register
pub fn encode(def: &RegisterDef, value: &RegisterValue) -> Result<Vec<u16>> {
    let mismatch = || {
        HeliosError::validation(
            def.name,
            format!("Value {:?} does not fit register kind {:?}", value, def.kind),
        )
    };

    let words = match (def.kind, *value) {
        (RegisterKind::Raw, RegisterValue::Raw(raw)) => {
            check_range(def, u32::from(raw))?;
            vec![raw]
        }
        (RegisterKind::Unsigned { decimals }, RegisterValue::Unsigned { raw, decimals: d })
            if d == decimals =>
        {
            check_range(def, raw)?;
            let word = u16::try_from(raw).map_err(|_| mismatch())?;
            vec![word]
        }
        (RegisterKind::Unsigned32 { decimals }, RegisterValue::Unsigned { raw, decimals: d })
            if d == decimals =>
        {
            check_range(def, raw)?;
            encode_u32(raw).to_vec()
        }
        (RegisterKind::Signed { decimals }, RegisterValue::Signed { raw, decimals: d })
            if d == decimals =>
        {
            let word = i16::try_from(raw).map_err(|_| mismatch())?;
            vec![word as u16]
        }
        (RegisterKind::State(kind), RegisterValue::State(state)) if state.kind() == kind => {
            check_range(def, u32::from(state.raw()))?;
            vec![state.raw()]
        }
        (RegisterKind::ErrorBits, RegisterValue::Bits(flags)) => vec![flags.raw()],
        _ => return Err(mismatch()),
    };
    Ok(words)
}

fn check_range(def: &RegisterDef, raw: u32) -> Result<()> {
    if let Some((min, max)) = def.range
        && !(min..=max).contains(&raw)
    {
        return Err(HeliosError::validation(
            def.name,
            format!("Value {} outside {}..={}", raw, min, max),
        ));
    }
    Ok(())
}

/// Decode a big-endian 32-bit value from two registers
pub fn decode_u32(words: &[u16]) -> Option<u32> {
    match words {
        [hi, lo, ..] => Some((u32::from(*hi) << 16) | u32::from(*lo)),
        _ => None,
    }
}

/// Encode a 32-bit value to two registers (big-endian)
pub fn encode_u32(value: u32) -> [u16; 2] {
    [(value >> 16) as u16, (value & 0xFFFF) as u16]
}

/// Whole amps to the current-limit register value
pub fn amps_to_raw(amps: f64) -> u32 {
    if amps.is_finite() && amps > 0.0 {
        amps.round().min(f64::from(u16::MAX)) as u32
    } else {
        0
    }
}

/// `major.minor` from the packed firmware word
pub fn firmware_string(word: u16) -> String {
    format!("{}.{}", word >> 8, word & 0xFF)
}
