//! String enum tables.
//!
//! Host APIs speak in strings (`"validation"`, `"uint32"`); the guest speaks in
//! small integers. A table fixes the order once and both directions index into
//! it. The value one past the last index is the "unrecognised" sentinel.

use std::fmt;

/// A string enum with a fixed table order.
///
/// Implemented by [`host_enum!`](crate::host_enum); the discriminant of each
/// variant equals its table index.
pub trait HostEnum: Copy + Eq + fmt::Debug + 'static {
    /// Host-side name of the enum, e.g. `GPUErrorFilter`.
    const NAME: &'static str;
    const VARIANTS: &'static [Self];
    const STRINGS: &'static [&'static str];

    fn as_str(self) -> &'static str;
    fn index(self) -> u32;

    fn from_index(index: u32) -> Option<Self> {
        Self::VARIANTS.get(index as usize).copied()
    }

    fn from_host_str(value: &str) -> Option<Self> {
        Self::VARIANTS.iter().copied().find(|v| v.as_str() == value)
    }

    /// Index of `value`, or the sentinel for strings outside the table.
    fn index_of(value: &str) -> u32 {
        Self::from_host_str(value).map_or(Self::sentinel(), Self::index)
    }

    fn sentinel() -> u32 {
        Self::VARIANTS.len() as u32
    }

    fn table() -> EnumTable {
        EnumTable::new(Self::NAME, Self::STRINGS)
    }
}

/// Type-erased enum table, carried by marshaling signatures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnumTable {
    name: &'static str,
    values: &'static [&'static str],
}

impl EnumTable {
    pub const fn new(name: &'static str, values: &'static [&'static str]) -> Self {
        Self { name, values }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn sentinel(&self) -> u32 {
        self.values.len() as u32
    }

    pub fn index_of(&self, value: &str) -> u32 {
        self.values
            .iter()
            .position(|&v| v == value)
            .map_or(self.sentinel(), |i| i as u32)
    }

    pub fn get(&self, index: u32) -> Option<&'static str> {
        self.values.get(index as usize).copied()
    }
}

/// Declare a string enum whose discriminants follow its table order.
///
/// ```
/// polyglot_hostapi::host_enum! {
///     pub enum Filter as "Filter" {
///         Validation => "validation",
///         Internal => "internal",
///     }
/// }
/// use polyglot_hostapi::HostEnum;
/// assert_eq!(Filter::index_of("internal"), 1);
/// assert_eq!(Filter::index_of("nope"), Filter::sentinel());
/// ```
#[macro_export]
macro_rules! host_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident as $host:literal {
            $( $(#[$vmeta:meta])* $variant:ident => $value:literal ),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        $vis enum $name {
            $( $(#[$vmeta])* $variant ),+
        }

        impl $crate::enums::HostEnum for $name {
            const NAME: &'static str = $host;
            const VARIANTS: &'static [Self] = &[$($name::$variant),+];
            const STRINGS: &'static [&'static str] = &[$($value),+];

            fn as_str(self) -> &'static str {
                match self {
                    $($name::$variant => $value),+
                }
            }

            fn index(self) -> u32 {
                self as u32
            }
        }

        const _: () = {
            let variants: &[$name] = &[$($name::$variant),+];
            let mut i = 0;
            while i < variants.len() {
                assert!(variants[i] as u32 == i as u32, "discriminants must follow table order");
                i += 1;
            }
        };
    };
}

host_enum! {
    /// Severity of a shader compilation message.
    pub enum CompilationMessageType as "GPUCompilationMessageType" {
        Error => "error",
        Warning => "warning",
        Info => "info",
    }
}

host_enum! {
    /// Why a device was lost.
    pub enum DeviceLostReason as "GPUDeviceLostReason" {
        Unknown => "unknown",
        Destroyed => "destroyed",
    }
}

host_enum! {
    /// Error scope filter.
    pub enum ErrorFilter as "GPUErrorFilter" {
        Validation => "validation",
        OutOfMemory => "out-of-memory",
        Internal => "internal",
    }
}

host_enum! {
    pub enum IndexFormat as "GPUIndexFormat" {
        Uint16 => "uint16",
        Uint32 => "uint32",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_by_index() {
        for &filter in ErrorFilter::VARIANTS {
            assert_eq!(ErrorFilter::from_index(filter.index()), Some(filter));
            assert_eq!(ErrorFilter::from_host_str(filter.as_str()), Some(filter));
        }
        assert_eq!(ErrorFilter::OutOfMemory.index(), 1);
        assert_eq!(ErrorFilter::OutOfMemory.as_str(), "out-of-memory");
    }

    #[test]
    fn test_unknown_string_maps_to_sentinel() {
        assert_eq!(DeviceLostReason::index_of("destroyed"), 1);
        assert_eq!(DeviceLostReason::index_of("exploded"), 2);
        assert_eq!(DeviceLostReason::sentinel(), 2);
        assert_eq!(DeviceLostReason::from_index(2), None);
    }

    #[test]
    fn test_table_matches_enum() {
        let table = CompilationMessageType::table();
        assert_eq!(table.name(), "GPUCompilationMessageType");
        assert_eq!(table.len(), 3);
        assert_eq!(table.index_of("warning"), CompilationMessageType::Warning.index());
        assert_eq!(table.index_of("Warning"), table.sentinel());
        assert_eq!(table.get(2), Some("info"));
        assert_eq!(table.get(3), None);
    }

    #[test]
    fn test_index_format() {
        assert_eq!(IndexFormat::index_of("uint32"), 1);
        assert_eq!(IndexFormat::table().sentinel(), 2);
    }
}
