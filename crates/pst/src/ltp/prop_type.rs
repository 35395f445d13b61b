//! ## [Data Types](https://learn.microsoft.com/en-us/openspecs/office_file_formats/ms-pst/1d61ee78-4466-4141-8276-f45153484619)

use super::*;

/// [Property Data Types](https://learn.microsoft.com/en-us/openspecs/exchange_server_protocols/MS-OXCDATA/0c77892e-288e-435a-9c49-be1c20c7afdb)
#[repr(u16)]
#[derive(Copy, Clone, PartialEq, Eq, Default, Debug)]
pub enum PropertyType {
    /// `PtypNull`: None: This property is a placeholder.
    #[default]
    Null = 0x0001,
    /// `PtypInteger16`: 2 bytes; a 16-bit integer
    Integer16 = 0x0002,
    /// `PtypInteger32`: 4 bytes; a 32-bit integer
    Integer32 = 0x0003,
    /// `PtypFloating32`: 4 bytes; a 32-bit floating-point number
    Floating32 = 0x0004,
    /// `PtypFloating64`: 8 bytes; a 64-bit floating-point number
    Floating64 = 0x0005,
    /// `PtypCurrency`: 8 bytes; a 64-bit signed, scaled integer
    /// representation of a decimal currency value
    Currency = 0x0006,
    /// `PtypFloatingTime`: 8 bytes; days since December 30, 1899, with the
    /// fraction of a day in the fractional part
    FloatingTime = 0x0007,
    /// `PtypErrorCode`: 4 bytes; a 32-bit error code
    ErrorCode = 0x000A,
    /// `PtypBoolean`: 1 byte; restricted to 1 or 0
    Boolean = 0x000B,
    /// `PtypInteger64`: 8 bytes; a 64-bit integer
    Integer64 = 0x0014,
    /// `PtypString8`: Variable size; multibyte characters in an externally
    /// specified encoding
    String8 = 0x001E,
    /// `PtypString`: Variable size; UTF-16LE
    Unicode = 0x001F,
    /// `PtypTime`: 8 bytes; 100-nanosecond intervals since January 1, 1601
    Time = 0x0040,
    /// `PtypGuid`: 16 bytes; little-endian Data1/2/3
    Guid = 0x0048,
    /// `PtypBinary`: Variable size
    Binary = 0x0102,

    /// `PtypMultipleInteger32`
    MultipleInteger32 = 0x1003,
    /// `PtypMultipleString8`
    MultipleString8 = 0x101E,
    /// `PtypMultipleString`
    MultipleUnicode = 0x101F,
    /// `PtypMultipleBinary`
    MultipleBinary = 0x1102,
}

impl TryFrom<u16> for PropertyType {
    type Error = LtpError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0x0001 => Ok(Self::Null),
            0x0002 => Ok(Self::Integer16),
            0x0003 => Ok(Self::Integer32),
            0x0004 => Ok(Self::Floating32),
            0x0005 => Ok(Self::Floating64),
            0x0006 => Ok(Self::Currency),
            0x0007 => Ok(Self::FloatingTime),
            0x000A => Ok(Self::ErrorCode),
            0x000B => Ok(Self::Boolean),
            0x0014 => Ok(Self::Integer64),
            0x001E => Ok(Self::String8),
            0x001F => Ok(Self::Unicode),
            0x0040 => Ok(Self::Time),
            0x0048 => Ok(Self::Guid),
            0x0102 => Ok(Self::Binary),
            0x1003 => Ok(Self::MultipleInteger32),
            0x101E => Ok(Self::MultipleString8),
            0x101F => Ok(Self::MultipleUnicode),
            0x1102 => Ok(Self::MultipleBinary),
            invalid => Err(LtpError::InvalidPropertyType(invalid)),
        }
    }
}

impl From<PropertyType> for u16 {
    fn from(value: PropertyType) -> Self {
        value as u16
    }
}

impl PropertyType {
    /// Whether the value is stored directly in the 4-byte record slot.
    pub fn is_inline(&self) -> bool {
        matches!(
            self,
            Self::Null
                | Self::Integer16
                | Self::Integer32
                | Self::Floating32
                | Self::ErrorCode
                | Self::Boolean
        )
    }

    /// The width of a table-context cell of this type.
    pub fn cell_size(&self) -> u8 {
        match self {
            Self::Boolean => 1,
            Self::Integer16 => 2,
            Self::Floating64 | Self::Currency | Self::FloatingTime | Self::Integer64
            | Self::Time => 8,
            _ => 4,
        }
    }
}
