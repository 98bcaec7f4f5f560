use std::ffi::c_void;

use crate::error::{RuntimeError, RuntimeResult};
use crate::hcf::HcfKernelInfo;
use crate::kernel::KernelLaunch;

/// Kernel parameters after mapping caller arguments onto the compiled
/// kernel's parameter list.
#[derive(Debug)]
pub struct MappedArguments {
    pointers: Vec<*mut c_void>,
}

impl MappedArguments {
    pub fn len(&self) -> usize {
        self.pointers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pointers.is_empty()
    }

    pub fn as_mut_slice(&mut self) -> &mut [*mut c_void] {
        &mut self.pointers
    }

    pub fn addresses(&self) -> Vec<usize> {
        self.pointers.iter().map(|&p| p as usize).collect()
    }
}

pub struct ArgumentMapper;

impl ArgumentMapper {
    /// Each compiled parameter reads `byte_size` bytes at `byte_offset` inside
    /// caller argument `original_index`; the window must fit that argument.
    pub fn map(info: &HcfKernelInfo, launch: &KernelLaunch) -> RuntimeResult<MappedArguments> {
        let args = launch.arg_addresses();
        let sizes = launch.arg_sizes();
        if args.len() != sizes.len() {
            return Err(RuntimeError::argument_mapping(format!(
                "{} arguments but {} argument sizes",
                args.len(),
                sizes.len()
            )));
        }

        let mut pointers = Vec::with_capacity(info.parameters.len());
        for (position, param) in info.parameters.iter().enumerate() {
            let index = param.original_index;
            let (&base, &size) = args.get(index).zip(sizes.get(index)).ok_or_else(|| {
                RuntimeError::argument_mapping(format!(
                    "parameter {position} refers to argument {index}, but only {} were passed",
                    args.len()
                ))
            })?;
            let end = param.byte_offset.checked_add(param.byte_size);
            if end.map_or(true, |end| end > size) {
                return Err(RuntimeError::argument_mapping(format!(
                    "parameter {position} reads bytes {}..+{} of argument {index}, which is {size} bytes",
                    param.byte_offset, param.byte_size
                )));
            }
            pointers.push((base + param.byte_offset) as *mut c_void);
        }
        Ok(MappedArguments { pointers })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hcf::KernelParameter;
    use crate::kernel::Dim3;

    fn launch(args: &[*mut c_void], sizes: &[usize]) -> KernelLaunch {
        unsafe { KernelLaunch::new(Dim3::linear(1), Dim3::linear(64), 0, args, sizes) }
    }

    fn param(original_index: usize, byte_offset: usize, byte_size: usize) -> KernelParameter {
        KernelParameter {
            original_index,
            byte_offset,
            byte_size,
        }
    }

    #[test]
    fn maps_windows_into_caller_arguments() {
        let mut a = [0u8; 16];
        let mut b = 0u64;
        let args = [a.as_mut_ptr() as *mut c_void, &mut b as *mut u64 as *mut c_void];
        let info = HcfKernelInfo {
            parameters: vec![param(0, 0, 8), param(0, 8, 8), param(1, 0, 8)],
            ..HcfKernelInfo::default()
        };
        let mapped = ArgumentMapper::map(&info, &launch(&args, &[16, 8])).unwrap();
        let base = a.as_ptr() as usize;
        assert_eq!(mapped.addresses(), vec![base, base + 8, &b as *const u64 as usize]);
    }

    #[test]
    fn out_of_range_window_fails() {
        let mut a = 0u32;
        let args = [&mut a as *mut u32 as *mut c_void];
        let info = HcfKernelInfo {
            parameters: vec![param(0, 2, 4)],
            ..HcfKernelInfo::default()
        };
        let err = ArgumentMapper::map(&info, &launch(&args, &[4])).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::ArgumentMapping);
    }

    #[test]
    fn missing_argument_fails() {
        let info = HcfKernelInfo {
            parameters: vec![param(1, 0, 4)],
            ..HcfKernelInfo::default()
        };
        assert!(ArgumentMapper::map(&info, &launch(&[], &[])).is_err());
    }
}
