//! In-order execution queue on one MUSA stream.

use std::ffi::c_void;
use std::sync::Arc;
use std::time::SystemTime;

use crate::adaptivity::{select_target, KernelAdaptivityEngine};
use crate::arg_mapper::ArgumentMapper;
use crate::backend::MusaBackend;
use crate::code_object::{CodeObject, CodeObjectSource};
use crate::device::{ApiPlatform, BackendId, DeviceId, HardwarePlatform};
use crate::driver::{
    CopyKind, CopyRequest, CopyShape, Driver, PitchedLayout, PrefetchTarget, Readiness, StreamHandle,
};
use crate::error::{ErrorKind, NativeResult, RuntimeError, RuntimeResult};
use crate::event::CompletionEvent;
use crate::event_pool::EventPool;
use crate::hcf::HcfObjectId;
use crate::instrumentation::{InstrumentationGuard, TimingReference};
use crate::jit::TranslationRequest;
use crate::kernel::{KernelLaunch, KernelOperation, LaunchCapabilities, MultipassInvoker, SscpInvoker};
use crate::kernel_config::{build_option, BaseConfigParameter, CompilationFlow, KernelConfiguration};
use crate::node::{NodeCompletion, TaskNode};
use crate::operations::{MemcpyOperation, MemsetOperation, PrefetchOperation};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueStatus {
    Complete,
    Pending,
}

/// Submits operations in order onto a non-blocking stream of one device.
pub struct MusaQueue {
    backend: Arc<MusaBackend>,
    device: DeviceId,
    stream: StreamHandle,
    event_pool: Arc<EventPool>,
    timing_reference: Arc<TimingReference>,
}

impl MusaQueue {
    pub(crate) fn new(backend: Arc<MusaBackend>, ordinal: i32, priority: i32) -> RuntimeResult<Self> {
        let device = DeviceId::musa(ordinal);
        let driver = Arc::clone(backend.driver());
        driver.activate_device(ordinal).map_err(|err| {
            RuntimeError::native(ErrorKind::Allocation, "queue: couldn't activate device", err)
        })?;
        let stream = driver.create_stream(priority).map_err(|err| {
            RuntimeError::native(ErrorKind::Allocation, "queue: couldn't construct native stream", err)
        })?;
        let event_pool = backend.event_pool(ordinal);

        let reference = record_on(driver.as_ref(), &event_pool, device, stream).and_then(|event| {
            driver.synchronize_stream(stream).map_err(|err| {
                RuntimeError::native(
                    ErrorKind::Synchronization,
                    "queue: couldn't synchronize timing reference",
                    err,
                )
            })?;
            Ok(event)
        });
        let reference = match reference {
            Ok(event) => event,
            Err(err) => {
                if let Err(destroy) = driver.destroy_stream(stream) {
                    log::warn!("queue: couldn't destroy stream after failed construction: {destroy}");
                }
                return Err(err);
            }
        };
        let timing_reference = Arc::new(TimingReference::new(Arc::new(reference), SystemTime::now()));

        log::debug!("queue on device {ordinal} created with priority {priority}");
        Ok(Self {
            backend,
            device,
            stream,
            event_pool,
            timing_reference,
        })
    }

    pub fn device(&self) -> DeviceId {
        self.device
    }

    pub fn native_stream(&self) -> StreamHandle {
        self.stream
    }

    pub fn timing_reference(&self) -> &Arc<TimingReference> {
        &self.timing_reference
    }

    pub fn backend(&self) -> &Arc<MusaBackend> {
        &self.backend
    }

    fn driver(&self) -> &dyn Driver {
        self.backend.driver().as_ref()
    }

    fn activate_device(&self, kind: ErrorKind) -> RuntimeResult<()> {
        self.driver()
            .activate_device(self.device.ordinal())
            .map_err(|err| RuntimeError::native(kind, "queue: couldn't activate device", err))
    }

    /// Records a new event at the current end of the stream.
    pub fn record_event(&self) -> RuntimeResult<CompletionEvent> {
        self.activate_device(ErrorKind::Synchronization)?;
        record_on(self.driver(), &self.event_pool, self.device, self.stream)
    }

    /// Like [`record_event`](Self::record_event), but failures are registered
    /// with the error sink and yield `None`.
    pub fn insert_event(&self) -> Option<Arc<CompletionEvent>> {
        match self.record_event() {
            Ok(event) => Some(Arc::new(event)),
            Err(err) => {
                self.backend.error_sink().register(err);
                None
            }
        }
    }

    /// Records an event and attaches it to `node` as its completion marker.
    pub fn mark_completion(&self, node: &TaskNode) -> RuntimeResult<Arc<CompletionEvent>> {
        let event = Arc::new(self.record_event()?);
        node.set_event(event.clone());
        Ok(event)
    }

    pub fn submit_memcpy(&self, op: &MemcpyOperation, node: Option<&TaskNode>) -> RuntimeResult<()> {
        let request = copy_request(op);
        self.activate_device(ErrorKind::Transfer)?;
        let _instrumentation = InstrumentationGuard::new(self, op.instrumentations(), node);
        // SAFETY: MemoryLocation::new obliges callers to keep both windows valid until the copy ran.
        unsafe { self.driver().memcpy_async(&request, self.stream) }.map_err(|err| {
            RuntimeError::native(ErrorKind::Transfer, "queue: couldn't submit memcpy", err)
        })
    }

    pub fn submit_memset(&self, op: &MemsetOperation, node: Option<&TaskNode>) -> RuntimeResult<()> {
        self.activate_device(ErrorKind::Transfer)?;
        let _instrumentation = InstrumentationGuard::new(self, op.instrumentations(), node);
        // SAFETY: MemsetOperation::new obliges callers to keep the range valid until the fill ran.
        unsafe {
            self.driver()
                .memset_async(op.address(), op.pattern(), op.num_bytes(), self.stream)
        }
        .map_err(|err| RuntimeError::native(ErrorKind::Transfer, "queue: couldn't submit memset", err))
    }

    /// Prefetch is a hint; platforms without support accept it as a no-op.
    pub fn submit_prefetch(&self, op: &PrefetchOperation, node: Option<&TaskNode>) -> RuntimeResult<()> {
        if !self.driver().supports_prefetch() {
            log::warn!("queue: ignoring prefetch hint, not supported on this platform");
            return Ok(());
        }
        self.activate_device(ErrorKind::Transfer)?;
        let target = if op.target().is_host() {
            PrefetchTarget::Host
        } else {
            PrefetchTarget::Device(self.device.ordinal())
        };
        let _instrumentation = InstrumentationGuard::new(self, op.instrumentations(), node);
        self.driver()
            .prefetch_async(op.address(), op.num_bytes(), target, self.stream)
            .map_err(|err| {
                RuntimeError::native(ErrorKind::Transfer, "queue: couldn't submit prefetch", err)
            })
    }

    pub fn submit_kernel(&self, op: &KernelOperation, node: Option<&TaskNode>) -> RuntimeResult<()> {
        let launcher = op
            .launchers()
            .find(BackendId::Musa)
            .ok_or_else(|| RuntimeError::launch("queue: could not obtain backend kernel launcher"))?;
        let caps = LaunchCapabilities::new().with_multipass(self).with_sscp(self);
        let _instrumentation = InstrumentationGuard::new(self, op.instrumentations(), node);
        launcher.invoke(&caps, op, node)
    }

    /// Makes later work on this queue wait until `node`'s event completed.
    pub fn submit_queue_wait_for(&self, node: &TaskNode) -> RuntimeResult<()> {
        let event = node.event().ok_or_else(|| {
            RuntimeError::synchronization("queue: node to wait for has no completion event")
        })?;
        assert_eq!(
            event.backend(),
            BackendId::Musa,
            "queue: cannot wait on an event of another backend"
        );
        let Some(event) = event.as_any().downcast_ref::<CompletionEvent>() else {
            panic!("queue: MUSA node event is not a completion event");
        };
        self.activate_device(ErrorKind::Synchronization)?;
        self.driver()
            .stream_wait_event(self.stream, event.native_handle())
            .map_err(|err| {
                RuntimeError::native(
                    ErrorKind::Synchronization,
                    "queue: couldn't submit stream wait for event",
                    err,
                )
            })
    }

    /// Signals `node` from a host callback once the stream reaches this point.
    ///
    /// The callback owns a reference to the node and releases it exactly once,
    /// whether the device reports success or failure. Device errors are
    /// registered with the error sink and delivered to the node.
    pub fn submit_external_wait_for(&self, node: &Arc<TaskNode>) -> RuntimeResult<()> {
        let handoff = NodeCompletion::new(Arc::clone(node));
        let sink = Arc::clone(self.backend.error_sink());
        let callback = Box::new(move |status: NativeResult<()>| match status {
            Ok(()) => handoff.complete(Ok(())),
            Err(native) => {
                let err = RuntimeError::native(
                    ErrorKind::Synchronization,
                    "queue callback: MUSA returned error code",
                    native,
                );
                sink.register(err.clone());
                handoff.complete(Err(err));
            }
        });
        self.activate_device(ErrorKind::Synchronization)?;
        self.driver()
            .stream_add_callback(self.stream, callback)
            .map_err(|err| {
                RuntimeError::native(
                    ErrorKind::Synchronization,
                    "queue: couldn't submit stream callback",
                    err,
                )
            })
    }

    /// Blocks until everything submitted so far has executed.
    pub fn wait(&self) -> RuntimeResult<()> {
        self.activate_device(ErrorKind::Synchronization)?;
        self.driver().synchronize_stream(self.stream).map_err(|err| {
            RuntimeError::native(ErrorKind::Synchronization, "queue: couldn't wait for stream", err)
        })
    }

    pub fn query_status(&self) -> RuntimeResult<QueueStatus> {
        self.activate_device(ErrorKind::Synchronization)?;
        match self.driver().query_stream(self.stream) {
            Ok(Readiness::Ready) => Ok(QueueStatus::Complete),
            Ok(Readiness::NotReady) => Ok(QueueStatus::Pending),
            Err(err) => Err(RuntimeError::native(
                ErrorKind::Synchronization,
                "queue: couldn't query stream status",
                err,
            )),
        }
    }

    fn launch_from_code_object(
        &self,
        object: &CodeObject,
        kernel: &str,
        launch: &KernelLaunch,
        args: &mut [*mut c_void],
    ) -> RuntimeResult<()> {
        self.activate_device(ErrorKind::Launch)?;
        let function = self.driver().get_function(object.module(), kernel).map_err(|err| {
            RuntimeError::native(
                ErrorKind::Launch,
                format!("queue: could not extract kernel {kernel} from module"),
                err,
            )
        })?;
        // SAFETY: KernelLaunch::new obliges callers to keep every argument valid through submission.
        unsafe {
            self.driver().launch_kernel(
                function,
                launch.num_groups(),
                launch.group_size(),
                launch.local_mem_bytes(),
                self.stream,
                args,
            )
        }
        .map_err(|err| {
            RuntimeError::native(
                ErrorKind::Launch,
                format!("queue: could not submit kernel {kernel}"),
                err,
            )
        })
    }
}

impl MultipassInvoker for MusaQueue {
    fn submit_multipass_kernel(
        &self,
        _op: &KernelOperation,
        _node: Option<&TaskNode>,
        hcf_object: HcfObjectId,
        backend_kernel_name: &str,
        launch: &KernelLaunch,
    ) -> RuntimeResult<()> {
        let ordinal = self.device.ordinal();
        let hcf = self.backend.registry().get(hcf_object).ok_or_else(|| {
            RuntimeError::configuration(format!("could not access requested HCF object {hcf_object}"))
        })?;
        let props = self.backend.device_properties(ordinal)?;
        let target = select_target(hcf.targets(), &props.arch).ok_or_else(|| {
            RuntimeError::configuration(format!(
                "HCF object {hcf_object} has no multipass target compatible with {}",
                props.arch
            ))
        })?;
        let target_arch = target.target_arch().to_string();

        let mut config = KernelConfiguration::new();
        config.append_base_configuration(BaseConfigParameter::BackendId, BackendId::Musa);
        config.append_base_configuration(
            BaseConfigParameter::CompilationFlow,
            CompilationFlow::ExplicitMultipass,
        );
        config.append_base_configuration(BaseConfigParameter::HcfObjectId, hcf_object);
        config.append_base_configuration(BaseConfigParameter::TargetArch, &target_arch);
        let code_object_id = config
            .generate_id()
            .extend(BaseConfigParameter::RuntimeDevice, ordinal);

        let object = self.backend.kernel_cache().get_or_construct(code_object_id, || {
            let image = target.binary().ok_or_else(|| {
                RuntimeError::configuration(format!(
                    "multipass target {} of HCF object {hcf_object} carries no device image",
                    target.name
                ))
            })?;
            CodeObject::load(
                Arc::clone(self.backend.driver()),
                ordinal,
                image,
                Vec::new(),
                CodeObjectSource {
                    flow: CompilationFlow::ExplicitMultipass,
                    hcf_object,
                    target_arch: target_arch.clone(),
                    config_id: code_object_id,
                },
            )
        })?;

        let full_name = object
            .find_kernel_by_fragment(backend_kernel_name)
            .ok_or_else(|| {
                RuntimeError::launch(format!(
                    "could not discover full kernel name from partial backend kernel name {backend_kernel_name}"
                ))
            })?;
        let mut args = launch.arg_pointers();
        self.launch_from_code_object(&object, full_name, launch, &mut args)
    }
}

impl SscpInvoker for MusaQueue {
    fn submit_sscp_kernel(
        &self,
        _op: &KernelOperation,
        _node: Option<&TaskNode>,
        hcf_object: HcfObjectId,
        kernel_name: &str,
        launch: &KernelLaunch,
        initial: &KernelConfiguration,
    ) -> RuntimeResult<()> {
        let ordinal = self.device.ordinal();
        let registry = self.backend.registry();
        let info = registry.kernel_info(hcf_object, kernel_name).ok_or_else(|| {
            RuntimeError::configuration(format!(
                "could not obtain kernel info for kernel {kernel_name} in HCF object {hcf_object}"
            ))
        })?;
        let mut args = ArgumentMapper::map(&info, launch)?;

        let hcf = registry.get(hcf_object).ok_or_else(|| {
            RuntimeError::configuration(format!("could not access requested HCF object {hcf_object}"))
        })?;
        let props = self.backend.device_properties(ordinal)?;
        let engine = KernelAdaptivityEngine::new(
            hcf_object,
            kernel_name,
            &info,
            launch,
            self.backend.config().adaptivity_level,
        );
        let selection = engine.select_image_and_kernels(&hcf, &props.arch)?;
        let ir = selection.image.binary().ok_or_else(|| {
            RuntimeError::configuration(format!(
                "image {} of HCF object {hcf_object} carries no IR",
                selection.image.name
            ))
        })?;

        let mut config = initial.clone();
        config.append_base_configuration(BaseConfigParameter::BackendId, BackendId::Musa);
        config.append_base_configuration(BaseConfigParameter::CompilationFlow, CompilationFlow::Sscp);
        config.append_base_configuration(BaseConfigParameter::HcfObjectId, hcf_object);
        config.append_base_configuration(BaseConfigParameter::TargetArch, &props.arch);
        for flag in &info.compilation_flags {
            config.set_build_flag(flag.clone());
        }
        for (key, value) in &info.compilation_options {
            config.set_build_option(key.clone(), value);
        }
        config.set_build_option(build_option::MUSA_TARGET_DEVICE, props.compute_capability);
        config.set_build_option(build_option::SOURCE_IMAGE, &selection.image.name);

        let binary_id = engine.finalize_binary_configuration(&selection, &mut config);
        let code_object_id = binary_id.extend(BaseConfigParameter::RuntimeDevice, ordinal);

        let translator = self.backend.translator();
        let object = self.backend.kernel_cache().get_or_construct_jit(
            code_object_id,
            binary_id,
            || {
                translator.translate(&TranslationRequest {
                    image_name: &selection.image.name,
                    ir,
                    kernels: &selection.kernels,
                    target_arch: &props.arch,
                    compute_capability: props.compute_capability,
                    config_id: binary_id,
                    config: &config,
                })
            },
            |image| {
                CodeObject::load(
                    Arc::clone(self.backend.driver()),
                    ordinal,
                    image,
                    selection.kernels.clone(),
                    CodeObjectSource {
                        flow: CompilationFlow::Sscp,
                        hcf_object,
                        target_arch: props.arch.clone(),
                        config_id: code_object_id,
                    },
                )
            },
        )?;

        self.launch_from_code_object(&object, kernel_name, launch, args.as_mut_slice())
    }
}

impl Drop for MusaQueue {
    fn drop(&mut self) {
        let driver = self.backend.driver();
        let destroyed = driver
            .activate_device(self.device.ordinal())
            .and_then(|()| driver.destroy_stream(self.stream));
        if let Err(err) = destroyed {
            self.backend.error_sink().register(RuntimeError::native(
                ErrorKind::Synchronization,
                "queue: couldn't destroy stream",
                err,
            ));
        }
    }
}

fn record_on(
    driver: &dyn Driver,
    pool: &Arc<EventPool>,
    device: DeviceId,
    stream: StreamHandle,
) -> RuntimeResult<CompletionEvent> {
    let handle = pool.obtain()?;
    // Wrapping first returns the handle to the pool if recording fails.
    let event = CompletionEvent::new(handle, device, pool);
    driver.record_event(handle, stream).map_err(|err| {
        RuntimeError::native(ErrorKind::Synchronization, "queue: couldn't record event", err)
    })?;
    Ok(event)
}

fn copy_kind(source: DeviceId, dest: DeviceId) -> CopyKind {
    let (src, dst) = (source.backend(), dest.backend());
    if src.sw_platform == ApiPlatform::Musa {
        if dst.sw_platform == ApiPlatform::Musa {
            assert_eq!(
                src.hw_platform, dst.hw_platform,
                "attempted device to device copy between devices of different hardware platforms"
            );
            CopyKind::DeviceToDevice
        } else if dst.hw_platform == HardwarePlatform::Cpu {
            CopyKind::DeviceToHost
        } else {
            panic!("could not infer copy direction from {source} to {dest}");
        }
    } else if src.hw_platform == HardwarePlatform::Cpu && dst.sw_platform == ApiPlatform::Musa {
        CopyKind::HostToDevice
    } else {
        panic!("could not infer copy direction from {source} to {dest}");
    }
}

fn copy_request(op: &MemcpyOperation) -> CopyRequest {
    let kind = copy_kind(op.source().device(), op.dest().device());
    let range = op.transferred_range();
    let src = op.source();
    let dst = op.dest();
    let elem = src.element_size();
    let layout = |shape: crate::operations::Range3, elem: usize| PitchedLayout {
        pitch: shape[2] * elem,
        xsize: shape[2],
        ysize: shape[1],
    };

    let shape = match op.transfer_dimensionality() {
        1 => CopyShape::Linear {
            bytes: op.num_transferred_bytes(),
        },
        2 => CopyShape::Pitched2d {
            dst_pitch: dst.allocation_shape()[2] * dst.element_size(),
            src_pitch: src.allocation_shape()[2] * elem,
            width_bytes: range[2] * elem,
            height: range[1],
        },
        _ => CopyShape::Pitched3d {
            dst: layout(dst.allocation_shape(), dst.element_size()),
            src: layout(src.allocation_shape(), elem),
            width_bytes: range[2] * elem,
            height: range[1],
            depth: range[0],
        },
    };

    CopyRequest {
        dst: dst.access_address(),
        src: src.access_address(),
        kind,
        shape,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::BackendDescriptor;
    use crate::operations::{MemoryLocation, Range3};

    fn loc(device: DeviceId, shape: Range3, offset: Range3) -> MemoryLocation {
        unsafe { MemoryLocation::new(device, 0x10_000 as *mut c_void, shape, offset, 4) }
    }

    #[test]
    fn copy_direction_follows_platforms() {
        assert_eq!(copy_kind(DeviceId::host(), DeviceId::musa(0)), CopyKind::HostToDevice);
        assert_eq!(copy_kind(DeviceId::musa(0), DeviceId::host()), CopyKind::DeviceToHost);
        assert_eq!(copy_kind(DeviceId::musa(0), DeviceId::musa(1)), CopyKind::DeviceToDevice);
    }

    #[test]
    #[should_panic(expected = "different hardware platforms")]
    fn cross_platform_device_copy_is_rejected() {
        let foreign = DeviceId::new(
            BackendDescriptor {
                hw_platform: HardwarePlatform::Nvidia,
                sw_platform: ApiPlatform::Musa,
            },
            0,
        );
        copy_kind(DeviceId::musa(0), foreign);
    }

    #[test]
    fn pitched_requests_use_allocation_rows() {
        let shape = Range3::new(2, 4, 8);
        let op = MemcpyOperation::new(
            loc(DeviceId::host(), shape, Range3::new(0, 1, 2)),
            loc(DeviceId::musa(0), shape, Range3::zero()),
            Range3::new(1, 2, 3),
        );
        let request = copy_request(&op);
        assert_eq!(request.kind, CopyKind::HostToDevice);
        assert_eq!(request.src, 0x10_000 + (8 + 2) * 4);
        assert_eq!(
            request.shape,
            CopyShape::Pitched2d {
                dst_pitch: 32,
                src_pitch: 32,
                width_bytes: 12,
                height: 2,
            }
        );

        let op3 = MemcpyOperation::new(
            loc(DeviceId::musa(0), shape, Range3::zero()),
            loc(DeviceId::host(), shape, Range3::zero()),
            Range3::new(2, 2, 8),
        );
        match copy_request(&op3).shape {
            CopyShape::Pitched3d { src, width_bytes, height, depth, .. } => {
                assert_eq!(src, PitchedLayout { pitch: 32, xsize: 8, ysize: 4 });
                assert_eq!((width_bytes, height, depth), (32, 2, 2));
            }
            other => panic!("expected 3-D copy, got {other:?}"),
        }
    }
}
