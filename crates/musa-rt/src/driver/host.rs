use std::collections::HashMap;
use std::ffi::c_void;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam_channel::{unbounded, Receiver, Sender};

use super::{
    CopyRequest, CopyShape, Dim3, Driver, EventHandle, FunctionHandle, HostCallback, ModuleHandle,
    PrefetchTarget, Readiness, StreamHandle,
};
use crate::code_object::exported_kernel_names;
use crate::device::DeviceProperties;
use crate::error::{NativeError, NativeResult};

const HOST_API: &str = "HOST";
const ERROR_INVALID_VALUE: i32 = 1;
const ERROR_INVALID_DEVICE: i32 = 101;
const ERROR_INVALID_IMAGE: i32 = 200;
const ERROR_INVALID_HANDLE: i32 = 400;
const ERROR_NOT_FOUND: i32 = 500;
const ERROR_NOT_READY: i32 = 600;

/// Driver entry points that accept an injected failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostCall {
    ActivateDevice,
    CreateStream,
    SynchronizeStream,
    QueryStream,
    StreamWaitEvent,
    AddCallback,
    /// Status delivered to the next registered callback.
    CallbackStatus,
    CreateEvent,
    RecordEvent,
    QueryEvent,
    ElapsedTime,
    Memcpy,
    Memset,
    Prefetch,
    LoadModule,
    GetFunction,
    LaunchKernel,
}

impl HostCall {
    fn symbol(self) -> &'static str {
        match self {
            HostCall::ActivateDevice => "hostSetDevice",
            HostCall::CreateStream => "hostStreamCreate",
            HostCall::SynchronizeStream => "hostStreamSynchronize",
            HostCall::QueryStream => "hostStreamQuery",
            HostCall::StreamWaitEvent => "hostStreamWaitEvent",
            HostCall::AddCallback => "hostStreamAddCallback",
            HostCall::CallbackStatus => "hostStreamCallback",
            HostCall::CreateEvent => "hostEventCreate",
            HostCall::RecordEvent => "hostEventRecord",
            HostCall::QueryEvent => "hostEventQuery",
            HostCall::ElapsedTime => "hostEventElapsedTime",
            HostCall::Memcpy => "hostMemcpyAsync",
            HostCall::Memset => "hostMemsetAsync",
            HostCall::Prefetch => "hostMemPrefetchAsync",
            HostCall::LoadModule => "hostModuleLoadData",
            HostCall::GetFunction => "hostModuleGetFunction",
            HostCall::LaunchKernel => "hostLaunchKernel",
        }
    }

    fn error(self, code: i32) -> NativeError {
        NativeError::new(HOST_API, self.symbol(), code)
    }
}

/// A kernel launch as observed by the emulated stream, in execution order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRecord {
    pub stream: StreamHandle,
    pub symbol: String,
    pub grid: Dim3,
    pub block: Dim3,
    pub shared_mem_bytes: u32,
    pub arg_count: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HostDriverStats {
    pub device_activations: usize,
    pub streams_created: usize,
    pub events_created: usize,
    pub events_destroyed: usize,
    pub modules_loaded: usize,
    pub modules_unloaded: usize,
    pub callbacks_registered: usize,
    pub prefetches: usize,
}

#[derive(Default)]
struct Counters {
    device_activations: AtomicUsize,
    streams_created: AtomicUsize,
    events_created: AtomicUsize,
    events_destroyed: AtomicUsize,
    modules_loaded: AtomicUsize,
    modules_unloaded: AtomicUsize,
    callbacks_registered: AtomicUsize,
    prefetches: AtomicUsize,
}

fn bump(counter: &AtomicUsize) {
    counter.fetch_add(1, Ordering::Relaxed);
}

/// Keeps a stream blocked until dropped.
pub struct StallGuard {
    _release: Sender<()>,
}

#[derive(Default)]
struct EventState {
    recorded: u64,
    completed: u64,
    completed_at: Option<Instant>,
}

#[derive(Default)]
struct HostEvent {
    state: Mutex<EventState>,
    reached: Condvar,
}

impl HostEvent {
    fn complete(&self, generation: u64) {
        let mut state = self.state.lock().expect("host event poisoned");
        if generation > state.completed {
            state.completed = generation;
            state.completed_at = Some(Instant::now());
        }
        self.reached.notify_all();
    }

    fn wait_for(&self, generation: u64) {
        let mut state = self.state.lock().expect("host event poisoned");
        while state.completed < generation {
            state = self.reached.wait(state).expect("host event poisoned");
        }
    }
}

#[derive(Default)]
struct Progress {
    submitted: u64,
    completed: u64,
}

#[derive(Default)]
struct StreamProgress {
    counts: Mutex<Progress>,
    drained: Condvar,
}

impl StreamProgress {
    fn submit(&self) {
        self.counts.lock().expect("stream progress poisoned").submitted += 1;
    }

    fn finish_one(&self) {
        let mut counts = self.counts.lock().expect("stream progress poisoned");
        counts.completed += 1;
        self.drained.notify_all();
    }

    fn is_idle(&self) -> bool {
        let counts = self.counts.lock().expect("stream progress poisoned");
        counts.completed == counts.submitted
    }

    fn wait_idle(&self) {
        let mut counts = self.counts.lock().expect("stream progress poisoned");
        while counts.completed < counts.submitted {
            counts = self.drained.wait(counts).expect("stream progress poisoned");
        }
    }
}

enum StreamCommand {
    Copy(CopyRequest),
    Fill { dst: usize, value: u8, bytes: usize },
    Record { event: Arc<HostEvent>, generation: u64 },
    Wait { event: Arc<HostEvent>, generation: u64 },
    Callback { callback: HostCallback, status: NativeResult<()> },
    Launch(LaunchRecord),
    Stall(Receiver<()>),
}

struct HostStream {
    sender: Sender<StreamCommand>,
    progress: Arc<StreamProgress>,
    worker: Option<JoinHandle<()>>,
}

impl HostStream {
    fn shut_down(self) {
        let HostStream { sender, worker, .. } = self;
        // The worker drains what was already queued and exits once the channel closes.
        drop(sender);
        if let Some(worker) = worker {
            if worker.thread().id() == thread::current().id() {
                return;
            }
            if worker.join().is_err() {
                log::error!("host stream worker panicked");
            }
        }
    }
}

/// Emulates the MUSA stream model on host threads.
///
/// Each stream owns a worker thread that executes commands in submission
/// order. Device pointers are plain host pointers, so copies and fills touch
/// real memory. Kernel launches are recorded but not executed.
pub struct HostDriver {
    devices: Vec<DeviceProperties>,
    prefetch_supported: bool,
    streams: Mutex<HashMap<usize, HostStream>>,
    events: Mutex<HashMap<usize, Arc<HostEvent>>>,
    modules: Mutex<HashMap<usize, Vec<String>>>,
    functions: Mutex<HashMap<usize, String>>,
    launches: Arc<Mutex<Vec<LaunchRecord>>>,
    faults: Mutex<HashMap<HostCall, i32>>,
    next_handle: AtomicUsize,
    counters: Counters,
}

impl Default for HostDriver {
    fn default() -> Self {
        Self::new()
    }
}

impl HostDriver {
    pub fn new() -> Self {
        Self::with_devices(vec![DeviceProperties::new("MUSA host emulator", "mp_21", 21)])
    }

    pub fn with_devices(devices: Vec<DeviceProperties>) -> Self {
        Self {
            devices,
            prefetch_supported: true,
            streams: Mutex::new(HashMap::new()),
            events: Mutex::new(HashMap::new()),
            modules: Mutex::new(HashMap::new()),
            functions: Mutex::new(HashMap::new()),
            launches: Arc::new(Mutex::new(Vec::new())),
            faults: Mutex::new(HashMap::new()),
            next_handle: AtomicUsize::new(1),
            counters: Counters::default(),
        }
    }

    pub fn without_prefetch(mut self) -> Self {
        self.prefetch_supported = false;
        self
    }

    /// Makes the next call to `call` fail with `code`.
    pub fn fail_next(&self, call: HostCall, code: i32) {
        self.faults
            .lock()
            .expect("host faults poisoned")
            .insert(call, code);
    }

    /// Blocks `stream` until the returned guard is dropped.
    pub fn stall(&self, stream: StreamHandle) -> NativeResult<StallGuard> {
        let (release, blocked) = crossbeam_channel::bounded(0);
        self.enqueue(HostCall::SynchronizeStream, stream, StreamCommand::Stall(blocked))?;
        Ok(StallGuard { _release: release })
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().expect("launch log poisoned").clone()
    }

    pub fn live_events(&self) -> usize {
        self.events.lock().expect("host events poisoned").len()
    }

    pub fn live_streams(&self) -> usize {
        self.streams.lock().expect("host streams poisoned").len()
    }

    pub fn stats(&self) -> HostDriverStats {
        let c = &self.counters;
        HostDriverStats {
            device_activations: c.device_activations.load(Ordering::Relaxed),
            streams_created: c.streams_created.load(Ordering::Relaxed),
            events_created: c.events_created.load(Ordering::Relaxed),
            events_destroyed: c.events_destroyed.load(Ordering::Relaxed),
            modules_loaded: c.modules_loaded.load(Ordering::Relaxed),
            modules_unloaded: c.modules_unloaded.load(Ordering::Relaxed),
            callbacks_registered: c.callbacks_registered.load(Ordering::Relaxed),
            prefetches: c.prefetches.load(Ordering::Relaxed),
        }
    }

    fn check(&self, call: HostCall) -> NativeResult<()> {
        match self.faults.lock().expect("host faults poisoned").remove(&call) {
            Some(code) => Err(call.error(code)),
            None => Ok(()),
        }
    }

    fn allocate_handle(&self) -> usize {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn stream_parts(
        &self,
        call: HostCall,
        stream: StreamHandle,
    ) -> NativeResult<(Sender<StreamCommand>, Arc<StreamProgress>)> {
        let streams = self.streams.lock().expect("host streams poisoned");
        let entry = streams
            .get(&stream.raw())
            .ok_or_else(|| call.error(ERROR_INVALID_HANDLE))?;
        Ok((entry.sender.clone(), Arc::clone(&entry.progress)))
    }

    fn event(&self, call: HostCall, event: EventHandle) -> NativeResult<Arc<HostEvent>> {
        self.events
            .lock()
            .expect("host events poisoned")
            .get(&event.raw())
            .cloned()
            .ok_or_else(|| call.error(ERROR_INVALID_HANDLE))
    }

    fn enqueue(&self, call: HostCall, stream: StreamHandle, command: StreamCommand) -> NativeResult<()> {
        let (sender, progress) = self.stream_parts(call, stream)?;
        progress.submit();
        if sender.send(command).is_err() {
            progress.finish_one();
            return Err(call.error(ERROR_INVALID_HANDLE));
        }
        Ok(())
    }
}

impl Drop for HostDriver {
    fn drop(&mut self) {
        let streams: Vec<HostStream> = self
            .streams
            .get_mut()
            .map(|streams| streams.drain().map(|(_, s)| s).collect())
            .unwrap_or_default();
        for stream in streams {
            stream.shut_down();
        }
    }
}

fn run_stream(
    commands: Receiver<StreamCommand>,
    progress: Arc<StreamProgress>,
    launches: Arc<Mutex<Vec<LaunchRecord>>>,
) {
    for command in commands.iter() {
        match command {
            // SAFETY: the submitter guaranteed both ranges stay valid until the stream reaches this copy.
            StreamCommand::Copy(request) => unsafe { execute_copy(&request) },
            // SAFETY: same contract as copies, for the destination range only.
            StreamCommand::Fill { dst, value, bytes } => unsafe {
                std::ptr::write_bytes(dst as *mut u8, value, bytes)
            },
            StreamCommand::Record { event, generation } => event.complete(generation),
            StreamCommand::Wait { event, generation } => event.wait_for(generation),
            StreamCommand::Callback { callback, status } => {
                if panic::catch_unwind(AssertUnwindSafe(move || callback(status))).is_err() {
                    log::error!("host stream callback panicked");
                }
            }
            StreamCommand::Launch(record) => {
                launches.lock().expect("launch log poisoned").push(record);
            }
            StreamCommand::Stall(blocked) => {
                let _ = blocked.recv();
            }
        }
        progress.finish_one();
    }
}

unsafe fn execute_copy(request: &CopyRequest) {
    let src = request.src as *const u8;
    let dst = request.dst as *mut u8;
    match request.shape {
        CopyShape::Linear { bytes } => std::ptr::copy(src, dst, bytes),
        CopyShape::Pitched2d {
            dst_pitch,
            src_pitch,
            width_bytes,
            height,
        } => {
            for row in 0..height {
                std::ptr::copy(src.add(row * src_pitch), dst.add(row * dst_pitch), width_bytes);
            }
        }
        CopyShape::Pitched3d {
            dst: dst_layout,
            src: src_layout,
            width_bytes,
            height,
            depth,
        } => {
            for slice in 0..depth {
                for row in 0..height {
                    let src_offset = (slice * src_layout.ysize + row) * src_layout.pitch;
                    let dst_offset = (slice * dst_layout.ysize + row) * dst_layout.pitch;
                    std::ptr::copy(src.add(src_offset), dst.add(dst_offset), width_bytes);
                }
            }
        }
    }
}

impl Driver for HostDriver {
    fn name(&self) -> &str {
        "host"
    }

    fn device_count(&self) -> NativeResult<i32> {
        Ok(self.devices.len() as i32)
    }

    fn device_properties(&self, device: i32) -> NativeResult<DeviceProperties> {
        usize::try_from(device)
            .ok()
            .and_then(|idx| self.devices.get(idx))
            .cloned()
            .ok_or_else(|| HostCall::ActivateDevice.error(ERROR_INVALID_DEVICE))
    }

    fn activate_device(&self, device: i32) -> NativeResult<()> {
        self.check(HostCall::ActivateDevice)?;
        if device < 0 || device as usize >= self.devices.len() {
            return Err(HostCall::ActivateDevice.error(ERROR_INVALID_DEVICE));
        }
        bump(&self.counters.device_activations);
        Ok(())
    }

    fn create_stream(&self, priority: i32) -> NativeResult<StreamHandle> {
        self.check(HostCall::CreateStream)?;
        let id = self.allocate_handle();
        let (sender, commands) = unbounded();
        let progress = Arc::new(StreamProgress::default());
        let worker_progress = Arc::clone(&progress);
        let launches = Arc::clone(&self.launches);
        let worker = thread::Builder::new()
            .name(format!("musa-rt-host-stream-{id}"))
            .spawn(move || run_stream(commands, worker_progress, launches))
            .map_err(|_| HostCall::CreateStream.error(ERROR_INVALID_VALUE))?;
        log::trace!("host stream {id} created with priority {priority}");
        self.streams.lock().expect("host streams poisoned").insert(
            id,
            HostStream {
                sender,
                progress,
                worker: Some(worker),
            },
        );
        bump(&self.counters.streams_created);
        Ok(StreamHandle::from_raw(id))
    }

    fn destroy_stream(&self, stream: StreamHandle) -> NativeResult<()> {
        let removed = self
            .streams
            .lock()
            .expect("host streams poisoned")
            .remove(&stream.raw());
        match removed {
            Some(stream) => {
                stream.shut_down();
                Ok(())
            }
            None => Err(NativeError::new(HOST_API, "hostStreamDestroy", ERROR_INVALID_HANDLE)),
        }
    }

    fn synchronize_stream(&self, stream: StreamHandle) -> NativeResult<()> {
        self.check(HostCall::SynchronizeStream)?;
        let (_, progress) = self.stream_parts(HostCall::SynchronizeStream, stream)?;
        progress.wait_idle();
        Ok(())
    }

    fn query_stream(&self, stream: StreamHandle) -> NativeResult<Readiness> {
        self.check(HostCall::QueryStream)?;
        let (_, progress) = self.stream_parts(HostCall::QueryStream, stream)?;
        Ok(if progress.is_idle() {
            Readiness::Ready
        } else {
            Readiness::NotReady
        })
    }

    fn stream_wait_event(&self, stream: StreamHandle, event: EventHandle) -> NativeResult<()> {
        self.check(HostCall::StreamWaitEvent)?;
        let event = self.event(HostCall::StreamWaitEvent, event)?;
        let generation = event.state.lock().expect("host event poisoned").recorded;
        self.enqueue(
            HostCall::StreamWaitEvent,
            stream,
            StreamCommand::Wait { event, generation },
        )
    }

    fn stream_add_callback(&self, stream: StreamHandle, callback: HostCallback) -> NativeResult<()> {
        self.check(HostCall::AddCallback)?;
        let status = self.check(HostCall::CallbackStatus);
        self.enqueue(
            HostCall::AddCallback,
            stream,
            StreamCommand::Callback { callback, status },
        )?;
        bump(&self.counters.callbacks_registered);
        Ok(())
    }

    fn create_event(&self) -> NativeResult<EventHandle> {
        self.check(HostCall::CreateEvent)?;
        let id = self.allocate_handle();
        self.events
            .lock()
            .expect("host events poisoned")
            .insert(id, Arc::new(HostEvent::default()));
        bump(&self.counters.events_created);
        Ok(EventHandle::from_raw(id))
    }

    fn destroy_event(&self, event: EventHandle) -> NativeResult<()> {
        self.events
            .lock()
            .expect("host events poisoned")
            .remove(&event.raw())
            .ok_or_else(|| NativeError::new(HOST_API, "hostEventDestroy", ERROR_INVALID_HANDLE))?;
        bump(&self.counters.events_destroyed);
        Ok(())
    }

    fn record_event(&self, event: EventHandle, stream: StreamHandle) -> NativeResult<()> {
        self.check(HostCall::RecordEvent)?;
        let event = self.event(HostCall::RecordEvent, event)?;
        // Validate the stream before bumping the generation so a failed record leaves the event untouched.
        self.stream_parts(HostCall::RecordEvent, stream)?;
        let generation = {
            let mut state = event.state.lock().expect("host event poisoned");
            state.recorded += 1;
            state.recorded
        };
        self.enqueue(
            HostCall::RecordEvent,
            stream,
            StreamCommand::Record { event, generation },
        )
    }

    fn query_event(&self, event: EventHandle) -> NativeResult<Readiness> {
        self.check(HostCall::QueryEvent)?;
        let event = self.event(HostCall::QueryEvent, event)?;
        let state = event.state.lock().expect("host event poisoned");
        Ok(if state.completed >= state.recorded {
            Readiness::Ready
        } else {
            Readiness::NotReady
        })
    }

    fn event_elapsed_ms(&self, start: EventHandle, end: EventHandle) -> NativeResult<f32> {
        self.check(HostCall::ElapsedTime)?;
        let completed_at = |handle| -> NativeResult<Instant> {
            let event = self.event(HostCall::ElapsedTime, handle)?;
            let state = event.state.lock().expect("host event poisoned");
            match state.completed_at {
                Some(at) if state.completed >= state.recorded => Ok(at),
                _ => Err(HostCall::ElapsedTime.error(ERROR_NOT_READY)),
            }
        };
        let start = completed_at(start)?;
        let end = completed_at(end)?;
        let ms = match end.checked_duration_since(start) {
            Some(forward) => forward.as_secs_f64() * 1e3,
            None => -(start.duration_since(end).as_secs_f64() * 1e3),
        };
        Ok(ms as f32)
    }

    unsafe fn memcpy_async(&self, request: &CopyRequest, stream: StreamHandle) -> NativeResult<()> {
        self.check(HostCall::Memcpy)?;
        self.enqueue(HostCall::Memcpy, stream, StreamCommand::Copy(*request))
    }

    unsafe fn memset_async(&self, dst: usize, value: u8, bytes: usize, stream: StreamHandle) -> NativeResult<()> {
        self.check(HostCall::Memset)?;
        self.enqueue(HostCall::Memset, stream, StreamCommand::Fill { dst, value, bytes })
    }

    fn supports_prefetch(&self) -> bool {
        self.prefetch_supported
    }

    fn prefetch_async(&self, _ptr: usize, _bytes: usize, target: PrefetchTarget, stream: StreamHandle) -> NativeResult<()> {
        self.check(HostCall::Prefetch)?;
        if let PrefetchTarget::Device(device) = target {
            if device < 0 || device as usize >= self.devices.len() {
                return Err(HostCall::Prefetch.error(ERROR_INVALID_DEVICE));
            }
        }
        self.stream_parts(HostCall::Prefetch, stream)?;
        bump(&self.counters.prefetches);
        Ok(())
    }

    fn load_module(&self, image: &[u8]) -> NativeResult<ModuleHandle> {
        self.check(HostCall::LoadModule)?;
        let symbols = exported_kernel_names(image);
        if symbols.is_empty() {
            return Err(HostCall::LoadModule.error(ERROR_INVALID_IMAGE));
        }
        let id = self.allocate_handle();
        self.modules
            .lock()
            .expect("host modules poisoned")
            .insert(id, symbols);
        bump(&self.counters.modules_loaded);
        Ok(ModuleHandle::from_raw(id))
    }

    fn unload_module(&self, module: ModuleHandle) -> NativeResult<()> {
        self.modules
            .lock()
            .expect("host modules poisoned")
            .remove(&module.raw())
            .ok_or_else(|| NativeError::new(HOST_API, "hostModuleUnload", ERROR_INVALID_HANDLE))?;
        bump(&self.counters.modules_unloaded);
        Ok(())
    }

    fn get_function(&self, module: ModuleHandle, symbol: &str) -> NativeResult<FunctionHandle> {
        self.check(HostCall::GetFunction)?;
        let found = {
            let modules = self.modules.lock().expect("host modules poisoned");
            let symbols = modules
                .get(&module.raw())
                .ok_or_else(|| HostCall::GetFunction.error(ERROR_INVALID_HANDLE))?;
            symbols.iter().any(|s| s == symbol)
        };
        if !found {
            return Err(HostCall::GetFunction.error(ERROR_NOT_FOUND));
        }
        let id = self.allocate_handle();
        self.functions
            .lock()
            .expect("host functions poisoned")
            .insert(id, symbol.to_string());
        Ok(FunctionHandle::from_raw(id))
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
        self.check(HostCall::LaunchKernel)?;
        let symbol = self
            .functions
            .lock()
            .expect("host functions poisoned")
            .get(&function.raw())
            .cloned()
            .ok_or_else(|| HostCall::LaunchKernel.error(ERROR_INVALID_HANDLE))?;
        let record = LaunchRecord {
            stream,
            symbol,
            grid,
            block,
            shared_mem_bytes,
            arg_count: args.len(),
        };
        self.enqueue(HostCall::LaunchKernel, stream, StreamCommand::Launch(record))
    }
}
