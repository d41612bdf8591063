//! ZBM register map and the table-driven field decoder.
//!
//! Every acquisition read is a composite command: one ReadHoldingRegisters
//! request whose response decodes into several logical fields. The tables
//! below declare offset, width, signedness and scale per field; decoding is
//! a plain walk over the table, no dispatch.

/// Device-identifier register, also the scanner's probe target.
pub const REG_DEVICE_ID: u16 = 0x9010;
/// Primary measurements block, six registers.
pub const REG_MEASUREMENTS: u16 = 0x9011;
/// Serial number, 32 bits, high word first.
pub const REG_SERIAL: u16 = 0x9018;
/// Firmware version pair.
pub const REG_FIRMWARE_VERSION: u16 = 0x901A;
/// Device state / operational mode / state of health block.
pub const REG_STATUS: u16 = 0x9021;
/// Alarm bitfields: warning word, active word.
pub const REG_ALARMS: u16 = 0x9024;
/// Slave address; written to renumber a device.
pub const REG_DEVICE_ADDRESS: u16 = 0x9030;
/// Operational mode command register.
pub const REG_OPERATIONAL_MODE: u16 = 0x9031;
/// Clear-status-flags command register.
pub const REG_CLEAR_STATUS_FLAGS: u16 = 0x9032;
/// Delayed self-maintenance request register.
pub const REG_DELAYED_SELF_MAINTENANCE: u16 = 0x9033;
/// Immediate self-maintenance request register.
pub const REG_IMMEDIATE_SELF_MAINTENANCE: u16 = 0x9034;

/// Width and signedness of a decoded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    U16,
    S16,
    /// Two registers, first transmitted register is the high word.
    U32,
    S32,
}

/// Logical destination of a decoded field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldId {
    Soc,
    ConsumedAmphours,
    BatteryVoltage,
    BatteryCurrent,
    BatteryTemperature,
    AirTemperature,
    DeviceState,
    OperationalMode,
    StateOfHealth,
    WarningFlags,
    ActiveAlarmFlags,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldDescriptor {
    pub offset: usize,
    pub kind: FieldKind,
    /// Divisor applied to the raw value; 1.0 keeps the field integral.
    pub scale: f64,
    pub id: FieldId,
}

#[derive(Debug, Clone, Copy)]
pub struct CompositeCommand {
    pub start_register: u16,
    pub count: u16,
    /// Acquisition-cycle interval; 0 runs every cycle.
    pub interval: u8,
    pub fields: &'static [FieldDescriptor],
}

/// The acquisition schedule for a ZBM node.
pub static ZBM_COMMANDS: &[CompositeCommand] = &[
    CompositeCommand {
        start_register: REG_MEASUREMENTS,
        count: 6,
        interval: 0,
        fields: &[
            FieldDescriptor { offset: 0, kind: FieldKind::U16, scale: 100.0, id: FieldId::Soc },
            FieldDescriptor { offset: 1, kind: FieldKind::U16, scale: 1.0, id: FieldId::ConsumedAmphours },
            FieldDescriptor { offset: 2, kind: FieldKind::U16, scale: 10.0, id: FieldId::BatteryVoltage },
            FieldDescriptor { offset: 3, kind: FieldKind::S16, scale: 10.0, id: FieldId::BatteryCurrent },
            FieldDescriptor { offset: 4, kind: FieldKind::S16, scale: 10.0, id: FieldId::BatteryTemperature },
            FieldDescriptor { offset: 5, kind: FieldKind::S16, scale: 10.0, id: FieldId::AirTemperature },
        ],
    },
    CompositeCommand {
        start_register: REG_STATUS,
        count: 3,
        interval: 0,
        fields: &[
            FieldDescriptor { offset: 0, kind: FieldKind::U16, scale: 1.0, id: FieldId::DeviceState },
            FieldDescriptor { offset: 1, kind: FieldKind::U16, scale: 1.0, id: FieldId::OperationalMode },
            FieldDescriptor { offset: 2, kind: FieldKind::U16, scale: 100.0, id: FieldId::StateOfHealth },
        ],
    },
    CompositeCommand {
        start_register: REG_ALARMS,
        count: 2,
        interval: 0,
        fields: &[
            FieldDescriptor { offset: 0, kind: FieldKind::U16, scale: 1.0, id: FieldId::WarningFlags },
            FieldDescriptor { offset: 1, kind: FieldKind::U16, scale: 1.0, id: FieldId::ActiveAlarmFlags },
        ],
    },
];

/// A decoded field value: integral when the declared scale is 1, scaled real
/// otherwise.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TypedValue {
    Int(i64),
    Real(f64),
}

impl TypedValue {
    pub fn as_f64(&self) -> f64 {
        match self {
            TypedValue::Int(v) => *v as f64,
            TypedValue::Real(v) => *v,
        }
    }
}

/// Decode the registers of one composite response per its field table.
/// Fields whose registers are missing from a short response are skipped.
pub fn decode_fields<'a>(
    command: &'a CompositeCommand,
    registers: &[u16],
) -> Vec<(&'a FieldDescriptor, TypedValue)> {
    let mut decoded = Vec::with_capacity(command.fields.len());
    for field in command.fields {
        let raw: i64 = match field.kind {
            FieldKind::U16 => match registers.get(field.offset) {
                Some(&word) => word as i64,
                None => continue,
            },
            FieldKind::S16 => match registers.get(field.offset) {
                Some(&word) => word as i16 as i64,
                None => continue,
            },
            FieldKind::U32 | FieldKind::S32 => {
                let (Some(&high), Some(&low)) =
                    (registers.get(field.offset), registers.get(field.offset + 1))
                else {
                    continue;
                };
                let word = ((high as u32) << 16) | low as u32;
                if field.kind == FieldKind::S32 {
                    word as i32 as i64
                } else {
                    word as i64
                }
            }
        };
        let value = if field.scale == 1.0 {
            TypedValue::Int(raw)
        } else {
            TypedValue::Real(raw as f64 / field.scale)
        };
        decoded.push((field, value));
    }
    decoded
}

/// Join a serial-number register pair into its printed form.
pub fn serial_from_registers(registers: &[u16]) -> Option<String> {
    let (high, low) = (registers.first()?, registers.get(1)?);
    Some((((*high as u32) << 16) | *low as u32).to_string())
}
