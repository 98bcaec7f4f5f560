use std::ffi::{c_char, c_void, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::{Arc, OnceLock};

use libloading::Library;

use super::{
    CopyKind, CopyRequest, CopyShape, Dim3, Driver, EventHandle, FunctionHandle, HostCallback,
    ModuleHandle, PrefetchTarget, Readiness, StreamHandle,
};
use crate::config::RuntimeConfig;
use crate::device::DeviceProperties;
use crate::error::{NativeError, NativeResult, RuntimeError, RuntimeResult};

type MusaError = i32;
type MuResult = i32;
type MuDevice = i32;
type MusaStream = *mut c_void;
type MusaEvent = *mut c_void;
type MuModule = *mut c_void;
type MuFunction = *mut c_void;

const MUSA_SUCCESS: MusaError = 0;
const MUSA_ERROR_NOT_READY: MusaError = 600;
const MU_SUCCESS: MuResult = 0;

const MUSA_STREAM_NON_BLOCKING: u32 = 0x01;
const MUSA_CPU_DEVICE_ID: i32 = -1;
const MUSA_DEV_ATTR_COMPUTE_CAPABILITY_MAJOR: i32 = 75;
const MUSA_DEV_ATTR_COMPUTE_CAPABILITY_MINOR: i32 = 76;

const MUSA_MEMCPY_HOST_TO_DEVICE: i32 = 1;
const MUSA_MEMCPY_DEVICE_TO_HOST: i32 = 2;
const MUSA_MEMCPY_DEVICE_TO_DEVICE: i32 = 3;

#[repr(C)]
#[derive(Clone, Copy)]
struct MusaPos {
    x: usize,
    y: usize,
    z: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MusaPitchedPtr {
    ptr: *mut c_void,
    pitch: usize,
    xsize: usize,
    ysize: usize,
}

#[repr(C)]
#[derive(Clone, Copy)]
struct MusaExtent {
    width: usize,
    height: usize,
    depth: usize,
}

#[repr(C)]
struct MusaMemcpy3DParms {
    src_array: *mut c_void,
    src_pos: MusaPos,
    src_ptr: MusaPitchedPtr,
    dst_array: *mut c_void,
    dst_pos: MusaPos,
    dst_ptr: MusaPitchedPtr,
    extent: MusaExtent,
    kind: i32,
}

type MusaStreamCallback = extern "C" fn(stream: MusaStream, status: MusaError, user_data: *mut c_void);

type MusaGetDeviceCountFn = unsafe extern "C" fn(count: *mut i32) -> MusaError;
type MusaSetDeviceFn = unsafe extern "C" fn(device: i32) -> MusaError;
type MusaDeviceGetAttributeFn = unsafe extern "C" fn(value: *mut i32, attr: i32, device: i32) -> MusaError;
type MusaStreamCreateWithPriorityFn =
    unsafe extern "C" fn(stream: *mut MusaStream, flags: u32, priority: i32) -> MusaError;
type MusaStreamDestroyFn = unsafe extern "C" fn(stream: MusaStream) -> MusaError;
type MusaStreamSynchronizeFn = unsafe extern "C" fn(stream: MusaStream) -> MusaError;
type MusaStreamQueryFn = unsafe extern "C" fn(stream: MusaStream) -> MusaError;
type MusaStreamWaitEventFn =
    unsafe extern "C" fn(stream: MusaStream, event: MusaEvent, flags: u32) -> MusaError;
type MusaStreamAddCallbackFn = unsafe extern "C" fn(
    stream: MusaStream,
    callback: MusaStreamCallback,
    user_data: *mut c_void,
    flags: u32,
) -> MusaError;
type MusaEventCreateFn = unsafe extern "C" fn(event: *mut MusaEvent) -> MusaError;
type MusaEventDestroyFn = unsafe extern "C" fn(event: MusaEvent) -> MusaError;
type MusaEventRecordFn = unsafe extern "C" fn(event: MusaEvent, stream: MusaStream) -> MusaError;
type MusaEventQueryFn = unsafe extern "C" fn(event: MusaEvent) -> MusaError;
type MusaEventElapsedTimeFn =
    unsafe extern "C" fn(ms: *mut f32, start: MusaEvent, end: MusaEvent) -> MusaError;
type MusaMemcpyAsyncFn = unsafe extern "C" fn(
    dst: *mut c_void,
    src: *const c_void,
    count: usize,
    kind: i32,
    stream: MusaStream,
) -> MusaError;
type MusaMemcpy2DAsyncFn = unsafe extern "C" fn(
    dst: *mut c_void,
    dpitch: usize,
    src: *const c_void,
    spitch: usize,
    width: usize,
    height: usize,
    kind: i32,
    stream: MusaStream,
) -> MusaError;
type MusaMemcpy3DAsyncFn =
    unsafe extern "C" fn(params: *const MusaMemcpy3DParms, stream: MusaStream) -> MusaError;
type MusaMemsetAsyncFn =
    unsafe extern "C" fn(dst: *mut c_void, value: i32, count: usize, stream: MusaStream) -> MusaError;
type MusaMemPrefetchAsyncFn = unsafe extern "C" fn(
    ptr: *const c_void,
    count: usize,
    dst_device: i32,
    stream: MusaStream,
) -> MusaError;

type MuInitFn = unsafe extern "C" fn(flags: u32) -> MuResult;
type MuDeviceGetFn = unsafe extern "C" fn(device: *mut MuDevice, ordinal: i32) -> MuResult;
type MuDeviceGetNameFn = unsafe extern "C" fn(name: *mut c_char, len: i32, device: MuDevice) -> MuResult;
type MuModuleLoadDataFn = unsafe extern "C" fn(module: *mut MuModule, image: *const c_void) -> MuResult;
type MuModuleUnloadFn = unsafe extern "C" fn(module: MuModule) -> MuResult;
type MuModuleGetFunctionFn =
    unsafe extern "C" fn(func: *mut MuFunction, module: MuModule, name: *const c_char) -> MuResult;
type MuLaunchKernelFn = unsafe extern "C" fn(
    f: MuFunction,
    grid_dim_x: u32,
    grid_dim_y: u32,
    grid_dim_z: u32,
    block_dim_x: u32,
    block_dim_y: u32,
    block_dim_z: u32,
    shared_mem_bytes: u32,
    stream: MusaStream,
    kernel_params: *mut *mut c_void,
    extra: *mut *mut c_void,
) -> MuResult;

struct RuntimeFns {
    get_device_count: MusaGetDeviceCountFn,
    set_device: MusaSetDeviceFn,
    device_get_attribute: MusaDeviceGetAttributeFn,
    stream_create_with_priority: MusaStreamCreateWithPriorityFn,
    stream_destroy: MusaStreamDestroyFn,
    stream_synchronize: MusaStreamSynchronizeFn,
    stream_query: MusaStreamQueryFn,
    stream_wait_event: MusaStreamWaitEventFn,
    stream_add_callback: MusaStreamAddCallbackFn,
    event_create: MusaEventCreateFn,
    event_destroy: MusaEventDestroyFn,
    event_record: MusaEventRecordFn,
    event_query: MusaEventQueryFn,
    event_elapsed_time: MusaEventElapsedTimeFn,
    memcpy_async: MusaMemcpyAsyncFn,
    memcpy_2d_async: MusaMemcpy2DAsyncFn,
    memcpy_3d_async: MusaMemcpy3DAsyncFn,
    memset_async: MusaMemsetAsyncFn,
    mem_prefetch_async: MusaMemPrefetchAsyncFn,
}

struct DriverFns {
    device_get: MuDeviceGetFn,
    device_get_name: MuDeviceGetNameFn,
    module_load_data: MuModuleLoadDataFn,
    module_unload: MuModuleUnloadFn,
    module_get_function: MuModuleGetFunctionFn,
    launch_kernel: MuLaunchKernelFn,
}

/// MUSA runtime (`libmusart`) and driver (`libmusa`) bound at load time.
pub struct MusaDriver {
    _runtime_lib: Library,
    _driver_lib: Library,
    rt: RuntimeFns,
    mu: DriverFns,
}

static MUSA_DRIVER: OnceLock<Result<Arc<MusaDriver>, String>> = OnceLock::new();

pub fn is_available() -> bool {
    musa_driver().is_ok()
}

/// Process-wide driver configured from the `MUSART_*` environment.
pub fn musa_driver() -> RuntimeResult<Arc<MusaDriver>> {
    let init = MUSA_DRIVER.get_or_init(|| match MusaDriver::load(&RuntimeConfig::from_env()) {
        Ok(driver) => Ok(Arc::new(driver)),
        Err(err) => Err(err.to_string()),
    });
    match init {
        Ok(driver) => Ok(Arc::clone(driver)),
        Err(msg) => Err(RuntimeError::configuration(format!("MUSA driver unavailable: {msg}"))),
    }
}

impl MusaDriver {
    pub fn load(config: &RuntimeConfig) -> RuntimeResult<Self> {
        let runtime_lib = load_library(
            config.runtime_library.as_deref(),
            &["libmusart.so", "libmusart.so.1", "musart.dll"],
        )?;
        let driver_lib = load_library(
            config.driver_library.as_deref(),
            &["libmusa.so.1", "libmusa.so", "musa.dll"],
        )?;

        let rt = RuntimeFns {
            get_device_count: load_symbol(&runtime_lib, b"musaGetDeviceCount\0")?,
            set_device: load_symbol(&runtime_lib, b"musaSetDevice\0")?,
            device_get_attribute: load_symbol(&runtime_lib, b"musaDeviceGetAttribute\0")?,
            stream_create_with_priority: load_symbol(&runtime_lib, b"musaStreamCreateWithPriority\0")?,
            stream_destroy: load_symbol(&runtime_lib, b"musaStreamDestroy\0")?,
            stream_synchronize: load_symbol(&runtime_lib, b"musaStreamSynchronize\0")?,
            stream_query: load_symbol(&runtime_lib, b"musaStreamQuery\0")?,
            stream_wait_event: load_symbol(&runtime_lib, b"musaStreamWaitEvent\0")?,
            stream_add_callback: load_symbol(&runtime_lib, b"musaStreamAddCallback\0")?,
            event_create: load_symbol(&runtime_lib, b"musaEventCreate\0")?,
            event_destroy: load_symbol(&runtime_lib, b"musaEventDestroy\0")?,
            event_record: load_symbol(&runtime_lib, b"musaEventRecord\0")?,
            event_query: load_symbol(&runtime_lib, b"musaEventQuery\0")?,
            event_elapsed_time: load_symbol(&runtime_lib, b"musaEventElapsedTime\0")?,
            memcpy_async: load_symbol(&runtime_lib, b"musaMemcpyAsync\0")?,
            memcpy_2d_async: load_symbol(&runtime_lib, b"musaMemcpy2DAsync\0")?,
            memcpy_3d_async: load_symbol(&runtime_lib, b"musaMemcpy3DAsync\0")?,
            memset_async: load_symbol(&runtime_lib, b"musaMemsetAsync\0")?,
            mem_prefetch_async: load_symbol(&runtime_lib, b"musaMemPrefetchAsync\0")?,
        };
        let mu_init: MuInitFn = load_symbol(&driver_lib, b"muInit\0")?;
        let mu = DriverFns {
            device_get: load_symbol(&driver_lib, b"muDeviceGet\0")?,
            device_get_name: load_symbol(&driver_lib, b"muDeviceGetName\0")?,
            module_load_data: load_symbol(&driver_lib, b"muModuleLoadData\0")?,
            module_unload: load_symbol(&driver_lib, b"muModuleUnload\0")?,
            module_get_function: load_symbol(&driver_lib, b"muModuleGetFunction\0")?,
            launch_kernel: load_symbol(&driver_lib, b"muLaunchKernel\0")?,
        };

        // SAFETY: muInit takes no pointers and must precede every other driver API call.
        check_mu(unsafe { mu_init(0) }, "muInit").map_err(|err| {
            RuntimeError::native(crate::error::ErrorKind::Configuration, "MUSA driver init failed", err)
        })?;
        log::debug!("MUSA runtime and driver libraries loaded");

        Ok(Self {
            _runtime_lib: runtime_lib,
            _driver_lib: driver_lib,
            rt,
            mu,
        })
    }
}

extern "C" fn stream_callback_trampoline(_stream: MusaStream, status: MusaError, user_data: *mut c_void) {
    // SAFETY: user_data came from Box::into_raw in stream_add_callback and is reclaimed exactly once here.
    let callback = unsafe { Box::from_raw(user_data as *mut HostCallback) };
    let outcome = check_musa(status, "musaStreamAddCallback");
    if panic::catch_unwind(AssertUnwindSafe(move || callback(outcome))).is_err() {
        log::error!("MUSA stream callback panicked");
    }
}

impl Driver for MusaDriver {
    fn name(&self) -> &str {
        "musa"
    }

    fn device_count(&self) -> NativeResult<i32> {
        let mut count = 0;
        // SAFETY: count is a valid out pointer.
        check_musa(unsafe { (self.rt.get_device_count)(&mut count) }, "musaGetDeviceCount")?;
        Ok(count)
    }

    fn device_properties(&self, device: i32) -> NativeResult<DeviceProperties> {
        let mut major = 0;
        let mut minor = 0;
        let mut mu_device: MuDevice = 0;
        let mut name = [0 as c_char; 256];
        // SAFETY: all out pointers are valid for the duration of each call.
        unsafe {
            check_musa(
                (self.rt.device_get_attribute)(&mut major, MUSA_DEV_ATTR_COMPUTE_CAPABILITY_MAJOR, device),
                "musaDeviceGetAttribute",
            )?;
            check_musa(
                (self.rt.device_get_attribute)(&mut minor, MUSA_DEV_ATTR_COMPUTE_CAPABILITY_MINOR, device),
                "musaDeviceGetAttribute",
            )?;
            check_mu((self.mu.device_get)(&mut mu_device, device), "muDeviceGet")?;
            check_mu(
                (self.mu.device_get_name)(name.as_mut_ptr(), name.len() as i32, mu_device),
                "muDeviceGetName",
            )?;
        }
        let name: Vec<u8> = name
            .iter()
            .take_while(|&&c| c != 0)
            .map(|&c| c as u8)
            .collect();
        Ok(DeviceProperties::new(
            String::from_utf8_lossy(&name),
            format!("mp_{major}{minor}"),
            (major * 10 + minor) as u32,
        ))
    }

    fn activate_device(&self, device: i32) -> NativeResult<()> {
        // SAFETY: plain value argument.
        check_musa(unsafe { (self.rt.set_device)(device) }, "musaSetDevice")
    }

    fn create_stream(&self, priority: i32) -> NativeResult<StreamHandle> {
        let mut stream: MusaStream = std::ptr::null_mut();
        // SAFETY: stream is a valid out pointer.
        check_musa(
            unsafe { (self.rt.stream_create_with_priority)(&mut stream, MUSA_STREAM_NON_BLOCKING, priority) },
            "musaStreamCreateWithPriority",
        )?;
        Ok(StreamHandle::from_raw(stream as usize))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> NativeResult<()> {
        // SAFETY: stream was created by this driver and is destroyed once by its owner.
        check_musa(unsafe { (self.rt.stream_destroy)(stream_ptr(stream)) }, "musaStreamDestroy")
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> NativeResult<()> {
        // SAFETY: stream handle originates from create_stream.
        check_musa(unsafe { (self.rt.stream_synchronize)(stream_ptr(stream)) }, "musaStreamSynchronize")
    }

    fn query_stream(&self, stream: StreamHandle) -> NativeResult<Readiness> {
        // SAFETY: stream handle originates from create_stream.
        readiness(unsafe { (self.rt.stream_query)(stream_ptr(stream)) }, "musaStreamQuery")
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> NativeResult<()> {
        // SAFETY: both handles originate from this driver.
        check_musa(
            unsafe { (self.rt.stream_wait_event)(stream_ptr(stream), event_ptr(event), 0) },
            "musaStreamWaitEvent",
        )
    }

    fn stream_add_callback(&self, stream: StreamHandle, callback: HostCallback) -> NativeResult<()> {
        let user_data = Box::into_raw(Box::new(callback)) as *mut c_void;
        // SAFETY: the trampoline reclaims user_data exactly once when the stream reaches it.
        let code = unsafe {
            (self.rt.stream_add_callback)(stream_ptr(stream), stream_callback_trampoline, user_data, 0)
        };
        if code != MUSA_SUCCESS {
            // SAFETY: registration failed, so the trampoline will never see user_data.
            drop(unsafe { Box::from_raw(user_data as *mut HostCallback) });
        }
        check_musa(code, "musaStreamAddCallback")
    }

    fn create_event(&self) -> NativeResult<EventHandle> {
        let mut event: MusaEvent = std::ptr::null_mut();
        // SAFETY: event is a valid out pointer.
        check_musa(unsafe { (self.rt.event_create)(&mut event) }, "musaEventCreate")?;
        Ok(EventHandle::from_raw(event as usize))
    }

    fn destroy_event(&self, event: EventHandle) -> NativeResult<()> {
        // SAFETY: event was created by this driver and is destroyed once by its owner.
        check_musa(unsafe { (self.rt.event_destroy)(event_ptr(event)) }, "musaEventDestroy")
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> NativeResult<()> {
        // SAFETY: both handles originate from this driver.
        check_musa(
            unsafe { (self.rt.event_record)(event_ptr(event), stream_ptr(stream)) },
            "musaEventRecord",
        )
    }

    fn query_event(&self, event: EventHandle) -> NativeResult<Readiness> {
        // SAFETY: event handle originates from create_event.
        readiness(unsafe { (self.rt.event_query)(event_ptr(event)) }, "musaEventQuery")
    }

    fn event_elapsed_ms(&self, start: EventHandle, end: EventHandle) -> NativeResult<f32> {
        let mut ms = 0.0f32;
        // SAFETY: ms is a valid out pointer; both events originate from this driver.
        check_musa(
            unsafe { (self.rt.event_elapsed_time)(&mut ms, event_ptr(start), event_ptr(end)) },
            "musaEventElapsedTime",
        )?;
        Ok(ms)
    }

    unsafe fn memcpy_async(&self, request: &CopyRequest, stream: StreamHandle) -> NativeResult<()> {
        let kind = copy_kind(request.kind);
        let dst = request.dst as *mut c_void;
        let src = request.src as *const c_void;
        match request.shape {
            CopyShape::Linear { bytes } => check_musa(
                (self.rt.memcpy_async)(dst, src, bytes, kind, stream_ptr(stream)),
                "musaMemcpyAsync",
            ),
            CopyShape::Pitched2d {
                dst_pitch,
                src_pitch,
                width_bytes,
                height,
            } => check_musa(
                (self.rt.memcpy_2d_async)(
                    dst,
                    dst_pitch,
                    src,
                    src_pitch,
                    width_bytes,
                    height,
                    kind,
                    stream_ptr(stream),
                ),
                "musaMemcpy2DAsync",
            ),
            CopyShape::Pitched3d {
                dst: dst_layout,
                src: src_layout,
                width_bytes,
                height,
                depth,
            } => {
                let origin = MusaPos { x: 0, y: 0, z: 0 };
                let params = MusaMemcpy3DParms {
                    src_array: std::ptr::null_mut(),
                    src_pos: origin,
                    src_ptr: MusaPitchedPtr {
                        ptr: src as *mut c_void,
                        pitch: src_layout.pitch,
                        xsize: src_layout.xsize,
                        ysize: src_layout.ysize,
                    },
                    dst_array: std::ptr::null_mut(),
                    dst_pos: origin,
                    dst_ptr: MusaPitchedPtr {
                        ptr: dst,
                        pitch: dst_layout.pitch,
                        xsize: dst_layout.xsize,
                        ysize: dst_layout.ysize,
                    },
                    extent: MusaExtent {
                        width: width_bytes,
                        height,
                        depth,
                    },
                    kind,
                };
                check_musa(
                    (self.rt.memcpy_3d_async)(&params, stream_ptr(stream)),
                    "musaMemcpy3DAsync",
                )
            }
        }
    }

    unsafe fn memset_async(&self, dst: usize, value: u8, bytes: usize, stream: StreamHandle) -> NativeResult<()> {
        check_musa(
            (self.rt.memset_async)(dst as *mut c_void, i32::from(value), bytes, stream_ptr(stream)),
            "musaMemsetAsync",
        )
    }

    fn supports_prefetch(&self) -> bool {
        !cfg!(windows)
    }

    fn prefetch_async(&self, ptr: usize, bytes: usize, target: PrefetchTarget, stream: StreamHandle) -> NativeResult<()> {
        let device = match target {
            PrefetchTarget::Host => MUSA_CPU_DEVICE_ID,
            PrefetchTarget::Device(device) => device,
        };
        // SAFETY: prefetch is advisory; an invalid range is reported as an error code.
        check_musa(
            unsafe { (self.rt.mem_prefetch_async)(ptr as *const c_void, bytes, device, stream_ptr(stream)) },
            "musaMemPrefetchAsync",
        )
    }

    fn load_module(&self, image: &[u8]) -> NativeResult<ModuleHandle> {
        // Text images must be NUL-terminated for the loader.
        let owned;
        let data = if image.last() == Some(&0) {
            image
        } else {
            let mut terminated = image.to_vec();
            terminated.push(0);
            owned = terminated;
            owned.as_slice()
        };
        let mut module: MuModule = std::ptr::null_mut();
        // SAFETY: module is a valid out pointer and data outlives the call.
        check_mu(
            unsafe { (self.mu.module_load_data)(&mut module, data.as_ptr() as *const c_void) },
            "muModuleLoadData",
        )?;
        Ok(ModuleHandle::from_raw(module as usize))
    }

    fn unload_module(&self, module: ModuleHandle) -> NativeResult<()> {
        // SAFETY: module was loaded by this driver and is unloaded once by its owner.
        check_mu(unsafe { (self.mu.module_unload)(module.raw() as MuModule) }, "muModuleUnload")
    }

    fn get_function(&self, module: ModuleHandle, symbol: &str) -> NativeResult<FunctionHandle> {
        let name = CString::new(symbol).map_err(|_| NativeError::new("MU", "muModuleGetFunction", 1))?;
        let mut function: MuFunction = std::ptr::null_mut();
        // SAFETY: function is a valid out pointer and name is NUL-terminated.
        check_mu(
            unsafe { (self.mu.module_get_function)(&mut function, module.raw() as MuModule, name.as_ptr()) },
            "muModuleGetFunction",
        )?;
        Ok(FunctionHandle::from_raw(function as usize))
    }

    unsafe fn launch_kernel(
        &self,
        function: FunctionHandle,
        grid: Dim3,
        block: Dim3,
        shared_mem_bytes: u32,
        stream: StreamHandle,
        args: &mut [*mut c_void],
    ) -> NativeResult<()> {
        check_mu(
            (self.mu.launch_kernel)(
                function.raw() as MuFunction,
                grid.x,
                grid.y,
                grid.z,
                block.x,
                block.y,
                block.z,
                shared_mem_bytes,
                stream_ptr(stream),
                args.as_mut_ptr(),
                std::ptr::null_mut(),
            ),
            "muLaunchKernel",
        )
    }
}

fn stream_ptr(stream: StreamHandle) -> MusaStream {
    stream.raw() as MusaStream
}

fn event_ptr(event: EventHandle) -> MusaEvent {
    event.raw() as MusaEvent
}

fn copy_kind(kind: CopyKind) -> i32 {
    match kind {
        CopyKind::HostToDevice => MUSA_MEMCPY_HOST_TO_DEVICE,
        CopyKind::DeviceToHost => MUSA_MEMCPY_DEVICE_TO_HOST,
        CopyKind::DeviceToDevice => MUSA_MEMCPY_DEVICE_TO_DEVICE,
    }
}

fn load_library(explicit: Option<&Path>, candidates: &[&str]) -> RuntimeResult<Library> {
    if let Some(path) = explicit {
        // SAFETY: loading the library only; no symbols are invoked at this stage.
        return unsafe { Library::new(path) }.map_err(|err| {
            RuntimeError::configuration(format!("failed to load {}: {err}", path.display()))
        });
    }
    for candidate in candidates {
        // SAFETY: loading the library only; no symbols are invoked at this stage.
        if let Ok(lib) = unsafe { Library::new(candidate) } {
            return Ok(lib);
        }
    }
    Err(RuntimeError::configuration(format!(
        "failed to load MUSA library (tried {})",
        candidates.join(", ")
    )))
}

fn load_symbol<T: Copy>(lib: &Library, name: &'static [u8]) -> RuntimeResult<T> {
    // SAFETY: caller provides the symbol type declared by the MUSA headers.
    let sym = unsafe { lib.get::<T>(name) }.map_err(|err| {
        RuntimeError::configuration(format!(
            "failed to resolve MUSA symbol {}: {err}",
            String::from_utf8_lossy(name.strip_suffix(b"\0").unwrap_or(name))
        ))
    })?;
    Ok(*sym)
}

fn check_musa(code: MusaError, call: &'static str) -> NativeResult<()> {
    if code == MUSA_SUCCESS {
        Ok(())
    } else {
        Err(NativeError::new("MUSA", call, code))
    }
}

fn check_mu(code: MuResult, call: &'static str) -> NativeResult<()> {
    if code == MU_SUCCESS {
        Ok(())
    } else {
        Err(NativeError::new("MU", call, code))
    }
}

fn readiness(code: MusaError, call: &'static str) -> NativeResult<Readiness> {
    match code {
        MUSA_SUCCESS => Ok(Readiness::Ready),
        MUSA_ERROR_NOT_READY => Ok(Readiness::NotReady),
        other => Err(NativeError::new("MUSA", call, other)),
    }
}
