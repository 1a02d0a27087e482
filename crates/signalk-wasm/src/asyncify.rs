//! Suspend/resume bridge for guests built with Binaryen's asyncify pass.
//!
//! A host binding that must wait on real I/O starts the operation, then asks
//! the guest to unwind its stack. The call returns to the host with the guest
//! in the unwinding state; the host waits for the operation, asks the guest
//! to rewind, and calls the *same* export again with the same arguments. The
//! replay reaches the same binding, which now hands back the result.
//!
//! The continuation that receives the operation's outcome is installed by
//! [`AsyncBridge::arm`] before the export is invoked. A binding can only
//! suspend by taking that continuation, so an operation that completes before
//! the guest has finished unwinding is never lost, and a second suspension
//! within the same logical call has nothing left to take.

use tokio::sync::oneshot;
use wasmtime::{AsContextMut, Caller, Instance, Store, Val};

use crate::error::{PluginError, Result};
use crate::host_functions::HostState;
use crate::memory;

/// Size of the region the guest's asyncify runtime saves its stack into.
pub const ASYNCIFY_DATA_SIZE: u32 = 16 * 1024;

/// Values returned by the guest's `asyncify_get_state` export.
pub const GUEST_STATE_NORMAL: i32 = 0;
pub const GUEST_STATE_UNWINDING: i32 = 1;
pub const GUEST_STATE_REWINDING: i32 = 2;

pub const ASYNCIFY_EXPORTS: [&str; 5] = [
    "asyncify_start_unwind",
    "asyncify_stop_unwind",
    "asyncify_start_rewind",
    "asyncify_stop_rewind",
    "asyncify_get_state",
];

/// Result of the host operation a suspended call waits on.
pub type AsyncOutcome = std::result::Result<Vec<u8>, String>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AsyncifyState {
    Normal,
    Unwound,
    Rewound,
}

/// Per-instance suspension state.
#[derive(Debug)]
pub struct AsyncBridge {
    state: AsyncifyState,
    continuation: Option<oneshot::Sender<AsyncOutcome>>,
    resumed: Option<AsyncOutcome>,
    data_ptr: Option<u32>,
    violation: Option<String>,
}

impl Default for AsyncBridge {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncBridge {
    pub fn new() -> Self {
        Self {
            state: AsyncifyState::Normal,
            continuation: None,
            resumed: None,
            data_ptr: None,
            violation: None,
        }
    }

    pub fn state(&self) -> AsyncifyState {
        self.state
    }

    pub fn data_ptr(&self) -> Option<u32> {
        self.data_ptr
    }

    pub(crate) fn set_data_region(&mut self, ptr: u32) {
        self.data_ptr = Some(ptr);
    }

    /// Install the continuation for the next call.
    ///
    /// Must be called before the export is invoked.
    pub fn arm(&mut self) -> Result<oneshot::Receiver<AsyncOutcome>> {
        if self.state != AsyncifyState::Normal || self.continuation.is_some() {
            return Err(PluginError::Protocol(format!(
                "cannot arm suspension: bridge is {:?} with a pending continuation: {}",
                self.state,
                self.continuation.is_some()
            )));
        }
        let (tx, rx) = oneshot::channel();
        self.continuation = Some(tx);
        Ok(rx)
    }

    /// Drop an unused continuation once a call has returned normally.
    pub fn disarm(&mut self) {
        self.continuation = None;
    }

    /// Whether a suspension is outstanding for this instance.
    pub fn is_pending(&self) -> bool {
        self.state != AsyncifyState::Normal
    }

    fn take_continuation(&mut self) -> Option<oneshot::Sender<AsyncOutcome>> {
        self.continuation.take()
    }

    pub(crate) fn mark_rewound(&mut self, outcome: AsyncOutcome) -> Result<()> {
        if self.state != AsyncifyState::Unwound {
            return Err(PluginError::Protocol(format!(
                "cannot resume from state {:?}",
                self.state
            )));
        }
        self.resumed = Some(outcome);
        self.state = AsyncifyState::Rewound;
        Ok(())
    }

    fn record_violation(&mut self, message: String) {
        self.violation.get_or_insert(message);
    }

    pub(crate) fn take_violation(&mut self) -> Option<String> {
        self.violation.take()
    }

    /// Forget everything about the current call.
    pub fn clear(&mut self) {
        self.state = AsyncifyState::Normal;
        self.continuation = None;
        self.resumed = None;
        self.violation = None;
    }
}

/// What a suspending binding should do after consulting the bridge.
#[derive(Debug)]
pub(crate) enum Resumption {
    /// The guest is unwinding; the binding's return value is ignored.
    Suspended,
    /// The replayed call reached the binding again with this result.
    Resumed(AsyncOutcome),
}

fn caller_call(caller: &mut Caller<'_, HostState>, name: &str, args: &[Val]) -> Result<()> {
    let func = caller
        .get_export(name)
        .and_then(|e| e.into_func())
        .ok_or_else(|| PluginError::Protocol(format!("missing asyncify export '{name}'")))?;
    let mut results = vec![Val::I32(0); func.ty(&*caller).results().len()];
    func.call(&mut *caller, args, &mut results)
        .map_err(|e| PluginError::Protocol(format!("'{name}' failed: {e}")))
}

/// Write the `[start, end]` header Binaryen expects at the data region.
fn reset_data_region(mut store: impl AsContextMut, memory: &wasmtime::Memory, ptr: u32) -> Result<()> {
    let start = ptr + 8;
    let end = ptr + ASYNCIFY_DATA_SIZE;
    let mut header = [0u8; 8];
    header[..4].copy_from_slice(&start.to_le_bytes());
    header[4..].copy_from_slice(&end.to_le_bytes());
    memory::write_binary(&mut store, memory, &header, ptr, 8)?;
    Ok(())
}

/// Suspend the guest around `start`, or hand back the result on replay.
///
/// `start` receives the continuation and must arrange for it to be completed
/// from a host task; it runs only on the first pass.
pub(crate) fn suspend_or_resume<F>(
    caller: &mut Caller<'_, HostState>,
    start: F,
) -> Result<Resumption>
where
    F: FnOnce(oneshot::Sender<AsyncOutcome>),
{
    match caller.data().bridge.state {
        AsyncifyState::Rewound => {
            caller_call(caller, "asyncify_stop_rewind", &[])?;
            let bridge = &mut caller.data_mut().bridge;
            bridge.state = AsyncifyState::Normal;
            let outcome = bridge
                .resumed
                .take()
                .unwrap_or_else(|| Err("resumed without a result".into()));
            Ok(Resumption::Resumed(outcome))
        }
        AsyncifyState::Unwound => {
            let message = "suspending binding reached while already unwound".to_string();
            caller.data_mut().bridge.record_violation(message.clone());
            Err(PluginError::Protocol(message))
        }
        AsyncifyState::Normal => {
            if !caller.data().ctx.exports.asyncify {
                return Err(PluginError::Protocol(
                    "module was not built with asyncify support".into(),
                ));
            }
            let Some(data_ptr) = caller.data().bridge.data_ptr else {
                return Err(PluginError::Protocol("asyncify data region not allocated".into()));
            };
            let Some(continuation) = caller.data_mut().bridge.take_continuation() else {
                let message = "a suspension is already pending for this call".to_string();
                caller.data_mut().bridge.record_violation(message.clone());
                return Err(PluginError::Protocol(message));
            };

            let memory = caller
                .get_export("memory")
                .and_then(|e| e.into_memory())
                .ok_or_else(|| PluginError::Protocol("module does not export its memory".into()))?;
            reset_data_region(&mut *caller, &memory, data_ptr)?;

            start(continuation);
            caller_call(caller, "asyncify_start_unwind", &[Val::I32(data_ptr as i32)])?;
            caller.data_mut().bridge.state = AsyncifyState::Unwound;
            Ok(Resumption::Suspended)
        }
    }
}

/// Read the guest's own view of its asyncify state.
pub(crate) fn guest_state(store: &mut Store<HostState>, instance: &Instance) -> Result<i32> {
    let func = instance
        .get_typed_func::<(), i32>(&mut *store, "asyncify_get_state")
        .map_err(|e| PluginError::Protocol(format!("asyncify_get_state: {e}")))?;
    func.call(&mut *store, ())
        .map_err(|e| PluginError::Protocol(format!("asyncify_get_state failed: {e}")))
}

pub(crate) fn stop_unwind(store: &mut Store<HostState>, instance: &Instance) -> Result<()> {
    let func = instance
        .get_typed_func::<(), ()>(&mut *store, "asyncify_stop_unwind")
        .map_err(|e| PluginError::Protocol(format!("asyncify_stop_unwind: {e}")))?;
    func.call(&mut *store, ())
        .map_err(|e| PluginError::Protocol(format!("asyncify_stop_unwind failed: {e}")))
}

pub(crate) fn start_rewind(store: &mut Store<HostState>, instance: &Instance) -> Result<()> {
    let ptr = store
        .data()
        .bridge
        .data_ptr
        .ok_or_else(|| PluginError::Protocol("asyncify data region not allocated".into()))?;
    let func = instance
        .get_typed_func::<i32, ()>(&mut *store, "asyncify_start_rewind")
        .map_err(|e| PluginError::Protocol(format!("asyncify_start_rewind: {e}")))?;
    func.call(&mut *store, ptr as i32)
        .map_err(|e| PluginError::Protocol(format!("asyncify_start_rewind failed: {e}")))
}
