//! Native seam between the queue and a MUSA implementation.
//!
//! [`MusaDriver`] binds the vendor runtime and driver libraries at load time;
//! [`HostDriver`] emulates streams and events on host threads so the queue can
//! run anywhere.

use std::ffi::c_void;

use crate::device::DeviceProperties;
use crate::error::NativeResult;

mod host;
mod musa;

pub use host::{HostCall, HostDriver, HostDriverStats, LaunchRecord, StallGuard};
pub use musa::{is_available as musa_available, musa_driver, MusaDriver};

macro_rules! native_handle {
    ($name:ident) => {
        /// Opaque native handle. Stored as an address so handles stay `Send + Sync`.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name(usize);

        impl $name {
            pub const fn from_raw(raw: usize) -> Self {
                Self(raw)
            }

            pub const fn raw(self) -> usize {
                self.0
            }
        }
    };
}

native_handle!(StreamHandle);
native_handle!(EventHandle);
native_handle!(ModuleHandle);
native_handle!(FunctionHandle);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    Ready,
    NotReady,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyKind {
    HostToDevice,
    DeviceToHost,
    DeviceToDevice,
}

/// Layout of one side of a pitched 3-D copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PitchedLayout {
    pub pitch: usize,
    pub xsize: usize,
    pub ysize: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyShape {
    Linear {
        bytes: usize,
    },
    Pitched2d {
        dst_pitch: usize,
        src_pitch: usize,
        width_bytes: usize,
        height: usize,
    },
    Pitched3d {
        dst: PitchedLayout,
        src: PitchedLayout,
        width_bytes: usize,
        height: usize,
        depth: usize,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CopyRequest {
    pub dst: usize,
    pub src: usize,
    pub kind: CopyKind,
    pub shape: CopyShape,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrefetchTarget {
    Host,
    Device(i32),
}

/// Launch geometry in native x/y/z order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Dim3 {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl Dim3 {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    pub const fn linear(x: u32) -> Self {
        Self { x, y: 1, z: 1 }
    }
}

/// Invoked exactly once on a driver thread when the stream reaches the callback.
pub type HostCallback = Box<dyn FnOnce(NativeResult<()>) + Send + 'static>;

pub trait Driver: Send + Sync {
    fn name(&self) -> &str;

    fn device_count(&self) -> NativeResult<i32>;
    fn device_properties(&self, device: i32) -> NativeResult<DeviceProperties>;
    /// Makes `device` current for the calling thread.
    fn activate_device(&self, device: i32) -> NativeResult<()>;

    fn create_stream(&self, priority: i32) -> NativeResult<StreamHandle>;
    fn destroy_stream(&self, stream: StreamHandle) -> NativeResult<()>;
    fn synchronize_stream(&self, stream: StreamHandle) -> NativeResult<()>;
    fn query_stream(&self, stream: StreamHandle) -> NativeResult<Readiness>;
    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> NativeResult<()>;
    fn stream_add_callback(&self, stream: StreamHandle, callback: HostCallback) -> NativeResult<()>;

    fn create_event(&self) -> NativeResult<EventHandle>;
    fn destroy_event(&self, event: EventHandle) -> NativeResult<()>;
    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> NativeResult<()>;
    fn query_event(&self, event: EventHandle) -> NativeResult<Readiness>;
    /// Milliseconds between two completed events; negative when `end` precedes `start`.
    fn event_elapsed_ms(&self, start: EventHandle, end: EventHandle) -> NativeResult<f32>;

    /// # Safety
    /// Both address ranges described by `request` must stay valid until the
    /// stream reaches the copy.
    unsafe fn memcpy_async(&self, request: &CopyRequest, stream: StreamHandle) -> NativeResult<()>;
    /// # Safety
    /// `dst..dst + bytes` must stay valid until the stream reaches the fill.
    unsafe fn memset_async(&self, dst: usize, value: u8, bytes: usize, stream: StreamHandle) -> NativeResult<()>;
    fn supports_prefetch(&self) -> bool;
    fn prefetch_async(&self, ptr: usize, bytes: usize, target: PrefetchTarget, stream: StreamHandle) -> NativeResult<()>;

    fn load_module(&self, image: &[u8]) -> NativeResult<ModuleHandle>;
    fn unload_module(&self, module: ModuleHandle) -> NativeResult<()>;
    fn get_function(&self, module: ModuleHandle, symbol: &str) -> NativeResult<FunctionHandle>;
    /// # Safety
    /// Every entry of `args` must point at an argument value matching the
    /// kernel's parameter list.
    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: StreamHandle,
        args: &mut [*mut c_void],
    ) -> NativeResult<()>;
}
