//! Guest module validation, before any instance is created.
//!
//! Checks:
//!
//! 1. `memory` export present
//! 2. Support exports, when present, have the bridge ABI signatures
//! 3. No WASI imports, and every import is a function
//! 4. Imports come only from `wbg` or from modules the embedder provides,
//!    and every `wbg` import names a known intrinsic

use std::collections::BTreeSet;

use wasmtime::{ExternType, Module, ValType};

use crate::error::BridgeError;
use crate::linker::{INTRINSICS, MODULE};
use crate::thunk::Imports;

fn is_i32(vt: &ValType) -> bool {
    matches!(vt, ValType::I32)
}

/// Support export: (name, i32 param count, i32 result count).
const SUPPORT_EXPORTS: &[(&str, usize, usize)] = &[
    ("__wbindgen_malloc", 2, 1),
    ("__wbindgen_realloc", 4, 1),
    ("__wbindgen_free", 3, 0),
    ("__wbindgen_exn_store", 1, 0),
    ("__wbindgen_start", 0, 0),
];

const FUNCTION_TABLE: &str = "__indirect_function_table";

/// Validate the module's own shape.
pub fn validate_module(module: &Module) -> Result<(), BridgeError> {
    validate_exports(module)?;
    validate_import_kinds(module)?;
    Ok(())
}

fn validate_exports(module: &Module) -> Result<(), BridgeError> {
    let has_memory = module
        .exports()
        .any(|e| e.name() == "memory" && matches!(e.ty(), ExternType::Memory(_)));
    if !has_memory {
        return Err(BridgeError::ValidationError("module must export 'memory'".into()));
    }

    for &(name, expected_params, expected_results) in SUPPORT_EXPORTS {
        let Some(export) = module.exports().find(|e| e.name() == name) else {
            continue;
        };
        let func_ty = match export.ty() {
            ExternType::Func(ft) => ft,
            _ => {
                return Err(BridgeError::ValidationError(format!(
                    "export '{}' must be a function",
                    name
                )));
            }
        };

        let params: Vec<ValType> = func_ty.params().collect();
        let results: Vec<ValType> = func_ty.results().collect();

        if params.len() != expected_params || !params.iter().all(is_i32) {
            return Err(BridgeError::ValidationError(format!(
                "export '{}' has wrong param signature: expected {} i32 params, got {} params",
                name,
                expected_params,
                params.len()
            )));
        }
        if results.len() != expected_results || !results.iter().all(is_i32) {
            return Err(BridgeError::ValidationError(format!(
                "export '{}' has wrong result signature: expected {} i32 results, got {} results",
                name,
                expected_results,
                results.len()
            )));
        }
    }

    if let Some(export) = module.exports().find(|e| e.name() == FUNCTION_TABLE) {
        if !matches!(export.ty(), ExternType::Table(_)) {
            return Err(BridgeError::ValidationError(format!(
                "export '{}' must be a table",
                FUNCTION_TABLE
            )));
        }
    }

    Ok(())
}

fn validate_import_kinds(module: &Module) -> Result<(), BridgeError> {
    for import in module.imports() {
        let module_name = import.module();

        if module_name.starts_with("wasi") {
            return Err(BridgeError::ValidationError(format!(
                "WASI import not allowed: {}::{}",
                module_name,
                import.name()
            )));
        }

        if !matches!(import.ty(), ExternType::Func(_)) {
            return Err(BridgeError::ValidationError(format!(
                "non-function import not allowed: {}::{}",
                module_name,
                import.name()
            )));
        }
    }
    Ok(())
}

/// Check the module's imports against what an instance will provide.
pub fn validate_imports(module: &Module, imports: &Imports) -> Result<(), BridgeError> {
    let mut allowed: BTreeSet<String> = imports.modules();
    allowed.insert(MODULE.to_string());

    for import in module.imports() {
        let module_name = import.module();
        if !allowed.contains(module_name) {
            return Err(BridgeError::ValidationError(format!(
                "import from unknown module '{}': {}",
                module_name,
                import.name()
            )));
        }
        if module_name == MODULE && !INTRINSICS.contains(&import.name()) {
            return Err(BridgeError::ValidationError(format!(
                "unknown intrinsic {}::{}",
                module_name,
                import.name()
            )));
        }
        if module_name != MODULE && !imports.contains(module_name, import.name()) {
            return Err(BridgeError::ValidationError(format!(
                "import {}::{} is not provided",
                module_name,
                import.name()
            )));
        }
    }
    Ok(())
}
