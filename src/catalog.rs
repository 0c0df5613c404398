//! Static register catalog for the Marstek Venus battery.
//!
//! Every logical value the device exposes is one [`RegisterDef`] carrying an
//! address layout per hardware generation. V1 and V2 units share the original
//! register map; V3 units moved and reshaped a handful of values. The layout
//! column holds its own [`Encoding`], so a value that is a 32-bit pair on one
//! generation and a plain 16-bit word on another states both facts explicitly
//! instead of deriving them from a shared word count.
//!
//! The table is resolved once at startup into an [`ActiveCatalog`] for the
//! configured [`DeviceVersion`]; decode, encode and scheduling never branch
//! on the version again after that.

use std::collections::HashMap;

use strum_macros::{EnumCount as EnumCountMacro, EnumIter};

use crate::error::CatalogError;
use crate::value::Duration;

/// Device generations selectable at configuration time, matching the
/// versions offered during setup. The choice is fixed for the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter)]
pub enum DeviceVersion {
    /// First-generation Venus firmware.
    V1,
    /// Second-generation firmware, same register map as V1.
    V2,
    /// Third-generation firmware with the reworked map.
    V3,
}

impl DeviceVersion {
    fn uses_gen3_map(self) -> bool {
        matches!(self, DeviceVersion::V3)
    }
}

/// Polling cadence classes. Intervals are user-overridable per tier; these
/// are the defaults the device setup ships with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIter, EnumCountMacro)]
pub enum Tier {
    /// Live battery/AC telemetry.
    High,
    /// Status, temperatures, energy counters.
    Medium,
    /// Control setpoints and link diagnostics.
    Low,
    /// Identity values that only change on firmware updates.
    VeryLow,
}

impl Tier {
    pub fn default_interval(self) -> Duration {
        match self {
            Tier::High => Duration::secs(5),
            Tier::Medium => Duration::secs(30),
            Tier::Low => Duration::secs(60),
            Tier::VeryLow => Duration::secs(600),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl AccessMode {
    pub fn readable(self) -> bool {
        !matches!(self, AccessMode::WriteOnly)
    }

    pub fn writable(self) -> bool {
        !matches!(self, AccessMode::ReadOnly)
    }
}

/// One named bit of a status block. Bit 0 is the least significant bit of
/// the first word; bit 16 is the least significant bit of the second.
#[derive(Debug, Clone, Copy)]
pub struct BitFlag {
    pub bit: u8,
    pub name: &'static str,
}

/// How raw words map to a typed value. Multi-word integers are big-endian:
/// high word first, two's-complement for the signed kinds.
#[derive(Debug, Clone, Copy)]
pub enum Encoding {
    U16,
    I16,
    U32,
    I32,
    /// Two ASCII bytes per word, high byte first, NUL padded.
    Ascii { words: u8 },
    /// Flat bit sequence over `words * 16` bits with a bit-to-name map.
    Bitfield {
        words: u8,
        map: &'static [BitFlag],
    },
}

impl Encoding {
    pub fn words(&self) -> u16 {
        match self {
            Encoding::U16 | Encoding::I16 => 1,
            Encoding::U32 | Encoding::I32 => 2,
            Encoding::Ascii { words } | Encoding::Bitfield { words, .. } => *words as u16,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            Encoding::U16 | Encoding::I16 | Encoding::U32 | Encoding::I32
        )
    }
}

/// Address and wire shape of a register on one hardware generation.
#[derive(Debug, Clone, Copy)]
pub struct Layout {
    pub address: u16,
    pub encoding: Encoding,
}

const fn lay(address: u16, encoding: Encoding) -> Option<Layout> {
    Some(Layout { address, encoding })
}

/// Valid range and step for a writable value, in engineering units.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ValueRange {
    pub min: f64,
    pub max: f64,
    pub step: f64,
}

impl ValueRange {
    const STEP_TOLERANCE: f64 = 1e-6;

    pub const fn new(min: f64, max: f64, step: f64) -> Self {
        Self { min, max, step }
    }

    /// Whether `v` lies within the range and on the step grid.
    pub fn admits(&self, v: f64) -> bool {
        if v < self.min - Self::STEP_TOLERANCE || v > self.max + Self::STEP_TOLERANCE {
            return false;
        }
        let steps = (v - self.min) / self.step;
        (steps - steps.round()).abs() < Self::STEP_TOLERANCE
    }
}

/// One logical value of the Venus register map.
#[derive(Debug)]
pub struct RegisterDef {
    pub name: &'static str,
    /// Engineering unit after scaling, empty for unitless values.
    pub unit: &'static str,
    pub access: AccessMode,
    pub tier: Tier,
    /// Multiplier applied to the raw integer. Fractional scales express
    /// fixed-point registers; a negative scale flips sign conventions such
    /// as RSSI magnitudes that stand for negative dBm.
    pub scale: f64,
    /// Polled whenever any consumer of a dependent computation is active,
    /// even if no consumer reads this value directly.
    pub dependency: bool,
    pub bounds: Option<ValueRange>,
    /// Layout on V1/V2 units, if the value exists there.
    pub gen12: Option<Layout>,
    /// Layout on V3 units, if the value exists there.
    pub gen3: Option<Layout>,
}

impl RegisterDef {
    pub fn layout(&self, version: DeviceVersion) -> Option<Layout> {
        if version.uses_gen3_map() {
            self.gen3
        } else {
            self.gen12
        }
    }
}

/// Alarm block bit map (register 35100, two words).
pub static ALARM_BITS: &[BitFlag] = &[
    BitFlag { bit: 0, name: "pll abnormal restart" },
    BitFlag { bit: 1, name: "overtemperature" },
    BitFlag { bit: 2, name: "low temperature" },
    BitFlag { bit: 3, name: "overcurrent" },
    BitFlag { bit: 4, name: "cell overvoltage" },
    BitFlag { bit: 5, name: "cell undervoltage" },
    BitFlag { bit: 6, name: "bms communication loss" },
    BitFlag { bit: 7, name: "grid overvoltage" },
    BitFlag { bit: 8, name: "grid undervoltage" },
    BitFlag { bit: 9, name: "grid overfrequency" },
    BitFlag { bit: 10, name: "grid underfrequency" },
];

/// Fault block bit map (register 35110, two words).
pub static FAULT_BITS: &[BitFlag] = &[
    BitFlag { bit: 0, name: "grid configuration fault" },
    BitFlag { bit: 1, name: "battery voltage abnormal" },
    BitFlag { bit: 2, name: "battery cell failure" },
    BitFlag { bit: 3, name: "inverter hardware fault" },
    BitFlag { bit: 4, name: "bms communication fault" },
    BitFlag { bit: 5, name: "eeprom fault" },
    BitFlag { bit: 6, name: "fan fault" },
    BitFlag { bit: 7, name: "relay fault" },
];

use AccessMode::{ReadOnly as R, ReadWrite as RW, WriteOnly as W};
use Encoding::{I16, I32, U16, U32};

/// The Venus register table.
///
/// Raw-unit notes follow the protocol document: voltages in centivolts,
/// currents in centiamps, energies in units of 10 Wh, temperatures in
/// deci-degrees. The forcible charge/discharge setpoints only take effect
/// while RS485 control mode is enabled.
pub static REGISTERS: &[RegisterDef] = &[
    // Identity block.
    RegisterDef {
        name: "device_name",
        unit: "",
        access: R,
        tier: Tier::VeryLow,
        scale: 1.0,
        dependency: false,
        bounds: None,
        gen12: lay(31000, Encoding::Ascii { words: 10 }),
        gen3: lay(31000, Encoding::Ascii { words: 10 }),
    },
    RegisterDef {
        // Raw 151 reads as v1.51.
        name: "firmware_version",
        unit: "",
        access: R,
        tier: Tier::VeryLow,
        scale: 0.01,
        dependency: false,
        bounds: None,
        gen12: lay(31200, U16),
        gen3: lay(31200, U16),
    },
    RegisterDef {
        // Nameplate capacity in units of 10 Wh; input to the stored energy
        // estimate.
        name: "rated_capacity",
        unit: "kWh",
        access: R,
        tier: Tier::VeryLow,
        scale: 0.01,
        dependency: true,
        bounds: None,
        gen12: lay(31300, U16),
        gen3: lay(31300, U16),
    },
    // Wi-Fi diagnostics. The device reports RSSI magnitude; the negative
    // scale restores the dBm sign convention.
    RegisterDef {
        name: "wifi_rssi",
        unit: "dBm",
        access: R,
        tier: Tier::Low,
        scale: -1.0,
        dependency: false,
        bounds: None,
        gen12: lay(30300, U16),
        gen3: lay(30300, U16),
    },
    // Battery telemetry block.
    RegisterDef {
        name: "battery_voltage",
        unit: "V",
        access: R,
        tier: Tier::High,
        scale: 0.01,
        dependency: false,
        bounds: None,
        gen12: lay(32100, U16),
        gen3: lay(32100, U16),
    },
    RegisterDef {
        // Positive while charging. This is the register the setup probe
        // reads to confirm the unit id answers.
        name: "battery_current",
        unit: "A",
        access: R,
        tier: Tier::High,
        scale: 0.01,
        dependency: false,
        bounds: None,
        gen12: lay(32101, I16),
        gen3: lay(32101, I16),
    },
    RegisterDef {
        // V1/V2 report a signed 32-bit watt pair; V3 moved the value and
        // narrowed it to one signed word.
        name: "battery_power",
        unit: "W",
        access: R,
        tier: Tier::High,
        scale: 1.0,
        dependency: false,
        bounds: None,
        gen12: lay(32102, I32),
        gen3: lay(32200, I16),
    },
    RegisterDef {
        // 0 idle, 1 charging, 2 discharging.
        name: "battery_state",
        unit: "",
        access: R,
        tier: Tier::Medium,
        scale: 1.0,
        dependency: false,
        bounds: None,
        gen12: lay(32104, U16),
        gen3: lay(32104, U16),
    },
    RegisterDef {
        name: "soc",
        unit: "%",
        access: R,
        tier: Tier::High,
        scale: 1.0,
        dependency: true,
        bounds: None,
        gen12: lay(32105, U16),
        gen3: lay(32105, U16),
    },
    RegisterDef {
        name: "cycle_count",
        unit: "",
        access: R,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: None,
        gen12: lay(32110, U16),
        gen3: lay(32110, U16),
    },
    // AC side block.
    RegisterDef {
        name: "ac_voltage",
        unit: "V",
        access: R,
        tier: Tier::Medium,
        scale: 0.1,
        dependency: false,
        bounds: None,
        gen12: lay(33000, U16),
        gen3: lay(33000, U16),
    },
    RegisterDef {
        name: "ac_current",
        unit: "A",
        access: R,
        tier: Tier::Medium,
        scale: 0.01,
        dependency: false,
        bounds: None,
        gen12: lay(33001, I16),
        gen3: lay(33001, I16),
    },
    RegisterDef {
        // Positive while importing from the grid.
        name: "ac_power",
        unit: "W",
        access: R,
        tier: Tier::High,
        scale: 1.0,
        dependency: false,
        bounds: None,
        gen12: lay(33002, I32),
        gen3: lay(33002, I32),
    },
    // Energy counters, inputs to the efficiency metrics.
    RegisterDef {
        name: "total_charged_energy",
        unit: "kWh",
        access: R,
        tier: Tier::Medium,
        scale: 0.01,
        dependency: true,
        bounds: None,
        gen12: lay(34000, U32),
        gen3: lay(34000, U32),
    },
    RegisterDef {
        name: "total_discharged_energy",
        unit: "kWh",
        access: R,
        tier: Tier::Medium,
        scale: 0.01,
        dependency: true,
        bounds: None,
        gen12: lay(34002, U32),
        gen3: lay(34002, U32),
    },
    RegisterDef {
        name: "total_ac_input_energy",
        unit: "kWh",
        access: R,
        tier: Tier::Medium,
        scale: 0.01,
        dependency: true,
        bounds: None,
        gen12: lay(34004, U32),
        gen3: lay(34004, U32),
    },
    RegisterDef {
        name: "total_ac_output_energy",
        unit: "kWh",
        access: R,
        tier: Tier::Medium,
        scale: 0.01,
        dependency: true,
        bounds: None,
        gen12: lay(34006, U32),
        gen3: lay(34006, U32),
    },
    // Monthly counters only exist on the V3 map.
    RegisterDef {
        name: "monthly_charged_energy",
        unit: "kWh",
        access: R,
        tier: Tier::Medium,
        scale: 0.01,
        dependency: true,
        bounds: None,
        gen12: None,
        gen3: lay(34100, U32),
    },
    RegisterDef {
        name: "monthly_discharged_energy",
        unit: "kWh",
        access: R,
        tier: Tier::Medium,
        scale: 0.01,
        dependency: true,
        bounds: None,
        gen12: None,
        gen3: lay(34102, U32),
    },
    // Temperatures.
    RegisterDef {
        name: "internal_temperature",
        unit: "°C",
        access: R,
        tier: Tier::Medium,
        scale: 0.1,
        dependency: false,
        bounds: None,
        gen12: lay(35000, I16),
        gen3: lay(35000, I16),
    },
    RegisterDef {
        name: "max_cell_temperature",
        unit: "°C",
        access: R,
        tier: Tier::Medium,
        scale: 0.1,
        dependency: false,
        bounds: None,
        gen12: lay(35001, I16),
        gen3: lay(35001, I16),
    },
    // Status blocks.
    RegisterDef {
        name: "alarm_status",
        unit: "",
        access: R,
        tier: Tier::Medium,
        scale: 1.0,
        dependency: false,
        bounds: None,
        gen12: lay(35100, Encoding::Bitfield { words: 2, map: ALARM_BITS }),
        gen3: lay(35100, Encoding::Bitfield { words: 2, map: ALARM_BITS }),
    },
    RegisterDef {
        name: "fault_status",
        unit: "",
        access: R,
        tier: Tier::Medium,
        scale: 1.0,
        dependency: false,
        bounds: None,
        gen12: lay(35110, Encoding::Bitfield { words: 2, map: FAULT_BITS }),
        gen3: lay(35110, Encoding::Bitfield { words: 2, map: FAULT_BITS }),
    },
    // Control block. Forcible setpoints require rs485_control_mode = 1.
    RegisterDef {
        name: "rs485_control_mode",
        unit: "",
        access: RW,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: Some(ValueRange::new(0.0, 1.0, 1.0)),
        gen12: lay(42000, U16),
        gen3: lay(42000, U16),
    },
    RegisterDef {
        // 0 stop, 1 charge, 2 discharge.
        name: "forcible_mode",
        unit: "",
        access: RW,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: Some(ValueRange::new(0.0, 2.0, 1.0)),
        gen12: lay(42010, U16),
        gen3: lay(42010, U16),
    },
    RegisterDef {
        name: "forcible_charge_power",
        unit: "W",
        access: RW,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: Some(ValueRange::new(0.0, 2500.0, 1.0)),
        gen12: lay(42020, U16),
        gen3: lay(42020, U16),
    },
    RegisterDef {
        name: "forcible_discharge_power",
        unit: "W",
        access: RW,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: Some(ValueRange::new(0.0, 2500.0, 1.0)),
        gen12: lay(42021, U16),
        gen3: lay(42021, U16),
    },
    RegisterDef {
        // Write 1 to acknowledge latched alarms.
        name: "clear_alarm",
        unit: "",
        access: W,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: Some(ValueRange::new(0.0, 1.0, 1.0)),
        gen12: lay(42100, U16),
        gen3: lay(42100, U16),
    },
    RegisterDef {
        // 0 manual, 1 anti-feed, 2 trade mode.
        name: "user_work_mode",
        unit: "",
        access: RW,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: Some(ValueRange::new(0.0, 2.0, 1.0)),
        gen12: lay(43000, U16),
        gen3: lay(43000, U16),
    },
    RegisterDef {
        name: "charge_cutoff_soc",
        unit: "%",
        access: RW,
        tier: Tier::Low,
        scale: 0.1,
        dependency: false,
        bounds: Some(ValueRange::new(80.0, 100.0, 0.1)),
        gen12: lay(44000, U16),
        gen3: lay(44000, U16),
    },
    RegisterDef {
        name: "discharge_cutoff_soc",
        unit: "%",
        access: RW,
        tier: Tier::Low,
        scale: 0.1,
        dependency: false,
        bounds: Some(ValueRange::new(12.0, 30.0, 0.1)),
        gen12: lay(44001, U16),
        gen3: lay(44001, U16),
    },
    // Backup output switch, V3 hardware only.
    RegisterDef {
        name: "backup_function",
        unit: "",
        access: RW,
        tier: Tier::Low,
        scale: 1.0,
        dependency: false,
        bounds: Some(ValueRange::new(0.0, 1.0, 1.0)),
        gen12: None,
        gen3: lay(44100, U16),
    },
];

/// A register definition with the active generation's layout applied.
#[derive(Debug, Clone, Copy)]
pub struct ActiveRegister {
    pub def: &'static RegisterDef,
    pub address: u16,
    pub encoding: Encoding,
}

impl ActiveRegister {
    pub fn name(&self) -> &'static str {
        self.def.name
    }

    pub fn words(&self) -> u16 {
        self.encoding.words()
    }

    pub fn end(&self) -> u16 {
        self.address + self.words()
    }
}

/// The flat catalog for one device generation, ordered by address.
pub struct ActiveCatalog {
    version: DeviceVersion,
    regs: Vec<ActiveRegister>,
    by_name: HashMap<&'static str, usize>,
}

impl ActiveCatalog {
    /// Select the layout column for `version`, drop absent definitions and
    /// validate the result. Validation failures are startup-fatal.
    pub fn resolve(version: DeviceVersion) -> Result<Self, CatalogError> {
        let mut regs: Vec<ActiveRegister> = REGISTERS
            .iter()
            .filter_map(|def| {
                def.layout(version).map(|l| ActiveRegister {
                    def,
                    address: l.address,
                    encoding: l.encoding,
                })
            })
            .collect();
        regs.sort_by_key(|r| r.address);

        let mut by_name = HashMap::with_capacity(regs.len());
        for (i, reg) in regs.iter().enumerate() {
            if by_name.insert(reg.name(), i).is_some() {
                return Err(CatalogError::DuplicateName(reg.name()));
            }
            validate_register(reg)?;
        }
        for pair in regs.windows(2) {
            if pair[1].address < pair[0].end() {
                return Err(CatalogError::AddressOverlap(
                    pair[0].name(),
                    pair[1].name(),
                ));
            }
        }

        Ok(Self {
            version,
            regs,
            by_name,
        })
    }

    pub fn version(&self) -> DeviceVersion {
        self.version
    }

    pub fn len(&self) -> usize {
        self.regs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Registers in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = &ActiveRegister> {
        self.regs.iter()
    }

    pub fn get(&self, name: &str) -> Option<&ActiveRegister> {
        self.by_name.get(name).map(|&i| &self.regs[i])
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn by_index(&self, index: usize) -> &ActiveRegister {
        &self.regs[index]
    }
}

fn validate_register(reg: &ActiveRegister) -> Result<(), CatalogError> {
    if reg.words() == 0 {
        return Err(CatalogError::ZeroWidth(reg.name()));
    }
    if reg.def.scale == 0.0 {
        return Err(CatalogError::ZeroScale(reg.name()));
    }
    if reg.def.access.writable() && reg.def.bounds.is_none() {
        return Err(CatalogError::MissingBounds(reg.name()));
    }
    if let Encoding::Bitfield { words, map } = reg.encoding {
        let width = words as u16 * 16;
        if map.iter().any(|b| b.bit as u16 >= width) {
            return Err(CatalogError::BitOutOfRange(reg.name()));
        }
    }
    Ok(())
}
