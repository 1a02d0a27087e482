//! Guest calling conventions.
//!
//! Two conventions exist in the wild:
//!
//! - **Wrapped bindings** (AssemblyScript): strings are managed objects in
//!   guest memory, UTF-16LE with their byte length stored at `ptr - 4`. The
//!   host allocates them with `__new(size, STRING_ID)` and pins them while a
//!   call is in flight.
//! - **Buffer passing** (Rust, Go, C): the host asks the guest to `allocate`
//!   an input buffer and an output buffer, calls the export with
//!   `(ptr, len, out_ptr, out_max)` and reads back the returned length, then
//!   `deallocate`s both.
//!
//! The convention is detected once at load time and recorded on the
//! instance. Everything above this module talks in terms of [`GuestCall`]
//! and [`GuestValue`] only.

use serde::Serialize;
use wasmtime::{AsContext, Func, Instance, Memory, Store, Val, ValType};

use crate::error::{PluginError, Result};
use crate::memory;
use crate::sandbox::guest_fault;

/// Runtime class id of `String` in AssemblyScript's managed heap.
pub const AS_STRING_CLASS_ID: i32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CallingConvention {
    WrappedBindings,
    BufferPassing,
}

impl CallingConvention {
    /// Pick the convention from the module's export names.
    pub fn detect(has_export: impl Fn(&str) -> bool) -> Option<Self> {
        if has_export("__new") {
            Some(CallingConvention::WrappedBindings)
        } else if has_export("allocate") && has_export("deallocate") {
            Some(CallingConvention::BufferPassing)
        } else {
            None
        }
    }
}

/// What the caller expects back from an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// An `i32` status code (0 is success by convention).
    Status,
    /// A string, usually JSON.
    Text,
}

#[derive(Debug, Clone)]
pub struct GuestCall {
    pub export: String,
    pub input: Option<String>,
    pub shape: CallShape,
}

impl GuestCall {
    pub fn text(export: impl Into<String>, input: Option<String>) -> Self {
        Self {
            export: export.into(),
            input,
            shape: CallShape::Text,
        }
    }

    pub fn status(export: impl Into<String>, input: Option<String>) -> Self {
        Self {
            export: export.into(),
            input,
            shape: CallShape::Status,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GuestValue {
    Status(i32),
    Text(Option<String>),
}

impl GuestValue {
    pub fn into_text(self) -> Option<String> {
        match self {
            GuestValue::Text(text) => text,
            GuestValue::Status(_) => None,
        }
    }

    pub fn status(&self) -> Option<i32> {
        match self {
            GuestValue::Status(code) => Some(*code),
            GuestValue::Text(_) => None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Allocation {
    Buffer { ptr: u32, size: u32 },
    Pinned { ptr: u32 },
}

/// An export call with its arguments already lowered into guest memory.
///
/// The same arguments are reused when a suspended call is replayed.
#[derive(Debug)]
pub struct PreparedCall {
    pub(crate) func: Func,
    pub(crate) export: String,
    pub(crate) args: Vec<Val>,
    result_count: usize,
    convention: CallingConvention,
    shape: CallShape,
    output: Option<(u32, u32)>,
    allocations: Vec<Allocation>,
}

impl PreparedCall {
    pub(crate) fn result_slots(&self) -> Vec<Val> {
        vec![Val::I32(0); self.result_count]
    }
}

fn exported_memory<T>(store: &mut Store<T>, instance: &Instance) -> Result<Memory> {
    instance
        .get_memory(&mut *store, "memory")
        .ok_or_else(|| PluginError::Protocol("module does not export its memory".into()))
}

/// Call a helper export and return its results.
pub(crate) fn call_export<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    name: &str,
    args: &[Val],
) -> Result<Vec<Val>> {
    let func = instance
        .get_func(&mut *store, name)
        .ok_or_else(|| PluginError::Protocol(format!("missing helper export '{name}'")))?;
    let mut results = vec![Val::I32(0); func.ty(&*store).results().len()];
    func.call(&mut *store, args, &mut results)
        .map_err(|e| guest_fault(plugin, e))?;
    Ok(results)
}

fn call_i32<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    name: &str,
    args: &[Val],
) -> Result<i32> {
    call_export(store, instance, plugin, name, args)?
        .first()
        .and_then(Val::i32)
        .ok_or_else(|| PluginError::Protocol(format!("'{name}' did not return an i32")))
}

fn guest_alloc<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    size: u32,
) -> Result<u32> {
    let ptr = call_i32(store, instance, plugin, "allocate", &[Val::I32(size as i32)])?;
    if ptr == 0 {
        return Err(PluginError::Protocol(format!(
            "guest allocator returned null for {size} bytes"
        )));
    }
    Ok(ptr as u32)
}

/// Allocate a long-lived raw region that the guest never frees.
pub(crate) fn allocate_region<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    convention: CallingConvention,
    size: u32,
) -> Result<u32> {
    match convention {
        CallingConvention::BufferPassing => guest_alloc(store, instance, plugin, size),
        CallingConvention::WrappedBindings => {
            // class id 1 is ArrayBuffer
            let ptr = call_i32(store, instance, plugin, "__new", &[Val::I32(size as i32), Val::I32(1)])?;
            if instance.get_func(&mut *store, "__pin").is_some() {
                call_export(store, instance, plugin, "__pin", &[Val::I32(ptr)])?;
            }
            Ok(ptr as u32)
        }
    }
}

fn encode_utf16(value: &str) -> Vec<u8> {
    value.encode_utf16().flat_map(u16::to_le_bytes).collect()
}

fn decode_utf16(bytes: &[u8]) -> Result<String> {
    if bytes.len() % 2 != 0 {
        return Err(PluginError::Protocol(format!(
            "managed string has odd byte length {}",
            bytes.len()
        )));
    }
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    String::from_utf16(&units)
        .map_err(|e| PluginError::Protocol(format!("managed string is not UTF-16: {e}")))
}

/// Read an AssemblyScript string object at `ptr`.
pub(crate) fn read_managed_string(
    store: impl AsContext,
    memory: &Memory,
    ptr: u32,
) -> Result<String> {
    let header = ptr.checked_sub(4).ok_or(PluginError::MemoryAccess {
        ptr: u64::from(ptr),
        len: 4,
        size: memory.data_size(&store) as u64,
    })?;
    let byte_len = memory::read_u32(&store, memory, header)?;
    let bytes = memory::read_binary(&store, memory, ptr, byte_len)?;
    decode_utf16(&bytes)
}

/// Allocate and fill a managed string, pinning it if the runtime supports it.
fn lower_managed_string<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    value: &str,
    allocations: &mut Vec<Allocation>,
) -> Result<u32> {
    let bytes = encode_utf16(value);
    let size = bytes.len() as u32;
    let ptr = call_i32(
        store,
        instance,
        plugin,
        "__new",
        &[Val::I32(size as i32), Val::I32(AS_STRING_CLASS_ID)],
    )? as u32;
    if instance.get_func(&mut *store, "__pin").is_some() {
        call_export(store, instance, plugin, "__pin", &[Val::I32(ptr as i32)])?;
        allocations.push(Allocation::Pinned { ptr });
    }
    let memory = exported_memory(store, instance)?;
    memory::write_binary(&mut *store, &memory, &bytes, ptr, size)?;
    Ok(ptr)
}

fn lower_buffer<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    value: &str,
    allocations: &mut Vec<Allocation>,
) -> Result<(u32, u32)> {
    let bytes = value.as_bytes();
    let len = bytes.len() as u32;
    let size = len.max(1);
    let ptr = guest_alloc(store, instance, plugin, size)?;
    allocations.push(Allocation::Buffer { ptr, size });
    let memory = exported_memory(store, instance)?;
    memory::write_binary(&mut *store, &memory, bytes, ptr, len)?;
    Ok((ptr, len))
}

/// Resolve `call.export` and lower its input according to `convention`.
///
/// The export's parameter list decides whether the input is passed at all,
/// so a status export declared as `()` simply ignores it.
pub(crate) fn prepare<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    convention: CallingConvention,
    call: &GuestCall,
    out_size: u32,
) -> Result<PreparedCall> {
    let func = instance
        .get_func(&mut *store, &call.export)
        .ok_or_else(|| PluginError::HandlerNotImplemented(call.export.clone()))?;
    let ty = func.ty(&*store);
    let params: Vec<ValType> = ty.params().collect();
    let results: Vec<ValType> = ty.results().collect();

    let all_i32 = params
        .iter()
        .chain(results.iter())
        .all(|t| matches!(t, ValType::I32));
    let results_ok = match call.shape {
        CallShape::Text => results.len() == 1,
        CallShape::Status => results.len() <= 1,
    };
    if !all_i32 || !results_ok {
        return Err(PluginError::Protocol(format!(
            "export '{}' has signature {:?} -> {:?}, which is not a {:?} export",
            call.export, params, results, call.shape
        )));
    }

    let mut prepared = PreparedCall {
        func,
        export: call.export.clone(),
        args: Vec::with_capacity(params.len()),
        result_count: results.len(),
        convention,
        shape: call.shape,
        output: None,
        allocations: Vec::new(),
    };
    let input = call.input.as_deref().unwrap_or("");

    let lowered = (|| -> Result<()> {
        match (convention, call.shape, params.len()) {
            (CallingConvention::BufferPassing, CallShape::Status, 2) => {
                let (ptr, len) =
                    lower_buffer(store, instance, plugin, input, &mut prepared.allocations)?;
                prepared.args = vec![Val::I32(ptr as i32), Val::I32(len as i32)];
            }
            (CallingConvention::BufferPassing, CallShape::Text, 4) => {
                let (ptr, len) =
                    lower_buffer(store, instance, plugin, input, &mut prepared.allocations)?;
                let out = guest_alloc(store, instance, plugin, out_size)?;
                prepared.allocations.push(Allocation::Buffer {
                    ptr: out,
                    size: out_size,
                });
                prepared.output = Some((out, out_size));
                prepared.args = vec![
                    Val::I32(ptr as i32),
                    Val::I32(len as i32),
                    Val::I32(out as i32),
                    Val::I32(out_size as i32),
                ];
            }
            (CallingConvention::BufferPassing, CallShape::Text, 2) => {
                let out = guest_alloc(store, instance, plugin, out_size)?;
                prepared.allocations.push(Allocation::Buffer {
                    ptr: out,
                    size: out_size,
                });
                prepared.output = Some((out, out_size));
                prepared.args = vec![Val::I32(out as i32), Val::I32(out_size as i32)];
            }
            (CallingConvention::WrappedBindings, _, 1) => {
                let ptr = lower_managed_string(
                    store,
                    instance,
                    plugin,
                    input,
                    &mut prepared.allocations,
                )?;
                prepared.args = vec![Val::I32(ptr as i32)];
            }
            (_, CallShape::Status, 0) | (CallingConvention::WrappedBindings, CallShape::Text, 0) => {}
            (convention, shape, n) => {
                return Err(PluginError::Protocol(format!(
                    "export '{}' takes {n} parameters, not valid for a {shape:?} export under {convention:?}",
                    call.export
                )));
            }
        }
        Ok(())
    })();

    if let Err(e) = lowered {
        release(store, instance, plugin, &prepared);
        return Err(e);
    }
    Ok(prepared)
}

/// Decode the final return of a prepared call.
pub(crate) fn lift<T>(
    store: &mut Store<T>,
    instance: &Instance,
    prepared: &PreparedCall,
    results: &[Val],
) -> Result<GuestValue> {
    let raw = results.first().and_then(Val::i32);
    if prepared.shape == CallShape::Status {
        return Ok(GuestValue::Status(raw.unwrap_or(0)));
    }
    let raw = raw.ok_or_else(|| {
        PluginError::Protocol(format!("export '{}' returned no value", prepared.export))
    })?;

    let memory = exported_memory(store, instance)?;
    match prepared.convention {
        CallingConvention::BufferPassing => {
            let Some((out, max)) = prepared.output else {
                return Err(PluginError::Protocol(format!(
                    "export '{}' has no output buffer",
                    prepared.export
                )));
            };
            if raw <= 0 {
                return Ok(GuestValue::Text(None));
            }
            let len = raw as u32;
            if len > max {
                return Err(PluginError::Protocol(format!(
                    "export '{}' reported {len} bytes for a {max} byte buffer",
                    prepared.export
                )));
            }
            let text = memory::read_utf8(&*store, &memory, out, len)?;
            Ok(GuestValue::Text(Some(text)))
        }
        CallingConvention::WrappedBindings => {
            if raw == 0 {
                return Ok(GuestValue::Text(None));
            }
            let text = read_managed_string(&*store, &memory, raw as u32)?;
            Ok(GuestValue::Text(Some(text)))
        }
    }
}

/// Give every buffer of a prepared call back to the guest.
///
/// Failures are logged; the call result has already been decided.
pub(crate) fn release<T>(
    store: &mut Store<T>,
    instance: &Instance,
    plugin: &str,
    prepared: &PreparedCall,
) {
    for allocation in &prepared.allocations {
        let outcome = match *allocation {
            Allocation::Buffer { ptr, size } => call_export(
                store,
                instance,
                plugin,
                "deallocate",
                &[Val::I32(ptr as i32), Val::I32(size as i32)],
            ),
            Allocation::Pinned { ptr } => {
                if instance.get_func(&mut *store, "__unpin").is_none() {
                    continue;
                }
                call_export(store, instance, plugin, "__unpin", &[Val::I32(ptr as i32)])
            }
        };
        if let Err(e) = outcome {
            tracing::warn!(plugin = %plugin, export = %prepared.export, "failed to release guest buffer: {e}");
        }
    }
}
