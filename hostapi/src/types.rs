//! Marshaling signatures for imported host functions.
//!
//! A [`Signature`] describes how each guest-side parameter is turned into a
//! host value and how the host result goes back. The bridge derives the wasm
//! function type from it, so one description drives both the import shape and
//! the conversion code.

use crate::enums::EnumTable;

/// Core wasm value types used at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WasmType {
    I32,
    F64,
}

/// How one guest argument becomes a host value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
    /// Borrowed handle; the table slot is left alone.
    Ref,
    /// Owned handle; the slot is freed after the read.
    Owned,
    /// Borrowed handle where 0 means "absent" (`undefined`).
    OptRef,
    I32,
    U32,
    F64,
    /// `0` or `1`.
    Bool,
    /// `(ptr, len)` UTF-8 text, decoded strictly.
    Str,
    /// `(ptr, len)` byte slice, copied into a `Uint8Array`.
    Bytes,
    /// `(ptr, len)` slice of u32 words, copied into a `Uint32Array`.
    Words32,
    /// Table index, converted to the table's string.
    Enum(EnumTable),
}

impl Param {
    /// Wasm parameters consumed by this argument.
    pub fn wasm_types(&self) -> &'static [WasmType] {
        match self {
            Param::F64 => &[WasmType::F64],
            Param::Str | Param::Bytes | Param::Words32 => &[WasmType::I32, WasmType::I32],
            _ => &[WasmType::I32],
        }
    }
}

/// How the host result goes back to the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ret {
    Unit,
    /// New handle to the result.
    Ref,
    /// New handle, or 0 when the result is `undefined` or `null`.
    OptRef,
    I32,
    U32,
    F64,
    Bool,
    /// Index into the table, sentinel for unknown strings.
    Enum(EnumTable),
    /// String written to guest memory; the guest passes a return pointer
    /// (leading parameter) that receives `(ptr, len)`.
    Str,
}

impl Ret {
    /// Wasm results produced.
    pub fn wasm_results(&self) -> &'static [WasmType] {
        match self {
            Ret::Unit | Ret::Str => &[],
            Ret::F64 => &[WasmType::F64],
            _ => &[WasmType::I32],
        }
    }

    /// Extra leading wasm parameters (the return pointer).
    pub fn leading_params(&self) -> &'static [WasmType] {
        match self {
            Ret::Str => &[WasmType::I32],
            _ => &[],
        }
    }
}

/// Full marshaling description of one import.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub params: Vec<Param>,
    pub ret: Ret,
}

impl Signature {
    pub fn new(params: impl Into<Vec<Param>>, ret: Ret) -> Self {
        Self {
            params: params.into(),
            ret,
        }
    }

    /// Wasm parameter list, including any return pointer.
    pub fn wasm_params(&self) -> Vec<WasmType> {
        let mut out = self.ret.leading_params().to_vec();
        for param in &self.params {
            out.extend_from_slice(param.wasm_types());
        }
        out
    }

    pub fn wasm_results(&self) -> Vec<WasmType> {
        self.ret.wasm_results().to_vec()
    }
}
