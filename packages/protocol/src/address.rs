use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use strum::Display;

use crate::error::AddressError;

/// Wire protocol an address belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Protocol {
    S7,
    Modbus,
}

/// Modbus data table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ModbusTable {
    Coil,
    Discrete,
    Holding,
    Input,
}

impl ModbusTable {
    /// Whether the table holds 16-bit words (and therefore accepts a bit offset).
    pub fn is_word(self) -> bool {
        matches!(self, ModbusTable::Holding | ModbusTable::Input)
    }

    pub fn is_writable(self) -> bool {
        matches!(self, ModbusTable::Coil | ModbusTable::Holding)
    }
}

impl TryFrom<&str> for ModbusTable {
    type Error = AddressError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        if value.eq_ignore_ascii_case("coil") || value.eq_ignore_ascii_case("coils") {
            Ok(Self::Coil)
        } else if value.eq_ignore_ascii_case("discrete")
            || value.eq_ignore_ascii_case("discretes")
            || value.eq_ignore_ascii_case("discrete_input")
            || value.eq_ignore_ascii_case("discrete_inputs")
        {
            Ok(Self::Discrete)
        } else if value.eq_ignore_ascii_case("holding") || value.eq_ignore_ascii_case("holdings") {
            Ok(Self::Holding)
        } else if value.eq_ignore_ascii_case("input") || value.eq_ignore_ascii_case("inputs") {
            Ok(Self::Input)
        } else {
            Err(AddressError::UnknownTable(value.to_string()))
        }
    }
}

/// Highest byte offset an S7 item address can reach (24-bit bit address).
pub const S7_MAX_BYTE: u32 = 0x1F_FFFF;

/// Siemens S7 data-block address (`DB<n>.DBX<byte>.<bit>` or `DB<n>.DBB<byte>`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct S7Address {
    pub db: u16,
    pub byte: u32,
    pub bit: Option<u8>,
}

impl S7Address {
    /// Start offset in bits, as used by the S7 `Read Var`/`Write Var` item address.
    ///
    /// `None` when the byte lies beyond [`S7_MAX_BYTE`].
    pub fn bit_offset(&self) -> Option<u32> {
        if self.byte > S7_MAX_BYTE {
            return None;
        }
        self.byte
            .checked_mul(8)?
            .checked_add(u32::from(self.bit.unwrap_or(0)))
    }
}

impl fmt::Display for S7Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "DB{}.DBX{}.{}", self.db, self.byte, bit),
            None => write!(f, "DB{}.DBB{}", self.db, self.byte),
        }
    }
}

/// Modbus register address (`coil:12`, `holding:40.3`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModbusAddress {
    pub table: ModbusTable,
    pub register: u16,
    pub bit: Option<u8>,
}

impl fmt::Display for ModbusAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.bit {
            Some(bit) => write!(f, "{}:{}.{}", self.table, self.register, bit),
            None => write!(f, "{}:{}", self.table, self.register),
        }
    }
}

/// Locator of one logical signal on a PLC.
///
/// Addresses are immutable once parsed and serialize as their textual form,
/// so configuration files carry strings like `"DB100.DBX0.1"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum RegisterAddress {
    S7(S7Address),
    Modbus(ModbusAddress),
}

impl RegisterAddress {
    pub fn protocol(&self) -> Protocol {
        match self {
            RegisterAddress::S7(_) => Protocol::S7,
            RegisterAddress::Modbus(_) => Protocol::Modbus,
        }
    }

    /// Byte offset for S7, register number for Modbus.
    pub fn offset(&self) -> u32 {
        match self {
            RegisterAddress::S7(a) => a.byte,
            RegisterAddress::Modbus(a) => u32::from(a.register),
        }
    }

    pub fn bit(&self) -> Option<u8> {
        match self {
            RegisterAddress::S7(a) => a.bit,
            RegisterAddress::Modbus(a) => a.bit,
        }
    }
}

impl fmt::Display for RegisterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RegisterAddress::S7(a) => a.fmt(f),
            RegisterAddress::Modbus(a) => a.fmt(f),
        }
    }
}

impl FromStr for RegisterAddress {
    type Err = AddressError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let text = s.trim();
        if text.is_empty() {
            return Err(AddressError::Empty);
        }
        if let Some((table, rest)) = text.split_once(':') {
            return parse_modbus(text, table, rest).map(RegisterAddress::Modbus);
        }
        if text.len() > 2 && text.get(..2).is_some_and(|p| p.eq_ignore_ascii_case("db")) {
            return parse_s7(text).map(RegisterAddress::S7);
        }
        Err(AddressError::Syntax(text.to_string()))
    }
}

impl TryFrom<String> for RegisterAddress {
    type Error = AddressError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<RegisterAddress> for String {
    fn from(value: RegisterAddress) -> Self {
        value.to_string()
    }
}

fn parse_number<T: FromStr>(text: &str, whole: &str) -> Result<T, AddressError> {
    text.trim()
        .parse::<T>()
        .map_err(|_| AddressError::Syntax(whole.to_string()))
}

fn check_bit(whole: &str, bit: u8, max: u8) -> Result<u8, AddressError> {
    if bit > max {
        return Err(AddressError::BitRange {
            address: whole.to_string(),
            bit,
            max,
        });
    }
    Ok(bit)
}

fn parse_s7(text: &str) -> Result<S7Address, AddressError> {
    let mut parts = text[2..].split('.');
    let db = parse_number::<u16>(parts.next().unwrap_or_default(), text)?;
    let area = parts
        .next()
        .ok_or_else(|| AddressError::Syntax(text.to_string()))?;
    let bit_part = parts.next();
    if parts.next().is_some() {
        return Err(AddressError::Syntax(text.to_string()));
    }

    // Accept DBX/DBB prefixes as well as the bare `DB1.10.3` shorthand.
    let upper = area.to_ascii_uppercase();
    let (byte_text, expects_bit) = if let Some(rest) = upper.strip_prefix("DBX") {
        (rest.to_string(), Some(true))
    } else if let Some(rest) = upper.strip_prefix("DBB") {
        (rest.to_string(), Some(false))
    } else {
        (upper, None)
    };
    let byte = parse_number::<u32>(&byte_text, text)?;
    if byte > S7_MAX_BYTE {
        return Err(AddressError::ByteRange {
            address: text.to_string(),
            byte,
            max: S7_MAX_BYTE,
        });
    }

    let bit = match (expects_bit, bit_part) {
        (Some(true), None) | (Some(false), Some(_)) => {
            return Err(AddressError::Syntax(text.to_string()))
        }
        (_, Some(b)) => Some(check_bit(text, parse_number::<u8>(b, text)?, 7)?),
        (_, None) => None,
    };

    Ok(S7Address { db, byte, bit })
}

fn parse_modbus(whole: &str, table: &str, rest: &str) -> Result<ModbusAddress, AddressError> {
    let table = ModbusTable::try_from(table.trim())?;
    let (register, bit) = match rest.split_once('.') {
        Some((reg, bit)) => (reg, Some(parse_number::<u8>(bit, whole)?)),
        None => (rest, None),
    };
    let register = parse_number::<u16>(register, whole)?;
    let bit = match bit {
        Some(_) if !table.is_word() => return Err(AddressError::BitNotAllowed(table.to_string())),
        Some(b) => Some(check_bit(whole, b, 15)?),
        None => None,
    };
    Ok(ModbusAddress {
        table,
        register,
        bit,
    })
}
