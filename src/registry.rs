//! Device resource registry
//!
//! Owns, per bound device, a scratch region and one stream per concurrency
//! slot. The dispatcher addresses devices only through slots:
//!
//! ```text
//! N = devices × streams_per_device
//!
//! slot i  ->  binding  i % devices
//!             stream   i / devices
//!             scratch  base + (i / devices) * slot_bytes
//! ```
//!
//! Scratch is either supplied by the caller (External, never freed here) or
//! allocated from a share of each device's free memory (Internal, freed on
//! shutdown). Initialization failures are returned as errors after releasing
//! whatever was already created.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::runtime::{DevicePtr, DeviceRuntime};

/// Slot regions start on this byte boundary
pub const SCRATCH_ALIGN: usize = 256;

/// Caller-owned device buffer used as scratch
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExternalScratch {
    /// Device address of the buffer
    pub ptr: DevicePtr,
    /// Usable size in bytes
    pub bytes: usize,
}

/// Arguments of [`DeviceRegistry::initialize`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InitOptions {
    /// Device indices to bind, in slot order
    pub devices: Vec<usize>,
    /// One external buffer per entry of `devices`; `None` allocates internally
    pub external: Option<Vec<ExternalScratch>>,
    /// Streams (slots) per device
    pub streams_per_device: usize,
}

impl InitOptions {
    /// Bind `devices` with internally allocated scratch and one stream each
    pub fn new(devices: impl Into<Vec<usize>>) -> Self {
        Self {
            devices: devices.into(),
            external: None,
            streams_per_device: 1,
        }
    }

    /// Use caller-owned scratch buffers
    pub fn with_external(mut self, buffers: impl Into<Vec<ExternalScratch>>) -> Self {
        self.external = Some(buffers.into());
        self
    }

    /// Set the number of streams per device
    pub fn with_streams_per_device(mut self, streams: usize) -> Self {
        self.streams_per_device = streams;
        self
    }
}

/// Ownership of the scratch memory
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum MemoryMode {
    /// Supplied by the caller; never freed by the registry
    External,
    /// Allocated by the registry; freed on shutdown
    Internal,
}

/// One bound device
#[derive(Debug)]
pub struct DeviceBinding<S> {
    device: usize,
    scratch_base: DevicePtr,
    /// Bookkeeping capacity used by fit checks
    scratch_bytes: usize,
    /// Size actually allocated (Internal mode)
    allocated_bytes: usize,
    streams: Vec<S>,
}

impl<S> DeviceBinding<S> {
    /// Device index
    #[inline]
    pub fn device(&self) -> usize {
        self.device
    }

    /// Base address of the scratch region
    #[inline]
    pub fn scratch_base(&self) -> DevicePtr {
        self.scratch_base
    }

    /// Scratch capacity in bytes
    #[inline]
    pub fn scratch_bytes(&self) -> usize {
        self.scratch_bytes
    }

    /// Streams of this device, one per slot
    #[inline]
    pub fn streams(&self) -> &[S] {
        &self.streams
    }

    fn slot_bytes(&self, streams_per_device: usize) -> usize {
        let share = self.scratch_bytes / streams_per_device.max(1);
        if share >= SCRATCH_ALIGN {
            share / SCRATCH_ALIGN * SCRATCH_ALIGN
        } else {
            share
        }
    }
}

/// One (device, stream) pair with its scratch region
#[derive(Debug)]
pub struct Slot<'a, S> {
    /// Slot index
    pub index: usize,
    /// Device index
    pub device: usize,
    /// Stream the slot's work is ordered on
    pub stream: &'a S,
    /// Base address of the slot's scratch region
    pub scratch: DevicePtr,
    /// Size of the slot's scratch region in bytes
    pub capacity: usize,
}

/// Device bindings and lifecycle of one dispatch context
pub struct DeviceRegistry<R: DeviceRuntime> {
    bindings: Vec<DeviceBinding<R::Stream>>,
    mode: Option<MemoryMode>,
    streams_per_device: usize,
}

impl<R: DeviceRuntime> std::fmt::Debug for DeviceRegistry<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let devices: Vec<usize> = self.bindings.iter().map(|b| b.device).collect();
        f.debug_struct("DeviceRegistry")
            .field("devices", &devices)
            .field("mode", &self.mode)
            .field("streams_per_device", &self.streams_per_device)
            .finish()
    }
}

impl<R: DeviceRuntime> Default for DeviceRegistry<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: DeviceRuntime> DeviceRegistry<R> {
    /// An uninitialized registry
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
            mode: None,
            streams_per_device: 1,
        }
    }

    /// Bind the devices in `options`.
    ///
    /// No-op if already initialized. Internal scratch is sized from
    /// `config` (`scratch_bytes`, else `memory_fraction` of free memory).
    pub fn initialize(&mut self, runtime: &R, options: &InitOptions, config: &Config) -> Result<()> {
        if self.is_initialized() {
            tracing::debug!("device registry already initialized");
            return Ok(());
        }
        if options.devices.is_empty() {
            return Err(Error::invalid_argument("devices", "no device requested"));
        }
        if options.streams_per_device == 0 {
            return Err(Error::invalid_argument(
                "streams_per_device",
                "at least one stream per device is required",
            ));
        }

        let available = runtime.device_count()?;
        if available == 0 {
            return Err(Error::NoDevices);
        }
        if options.devices.len() > available {
            return Err(Error::TooManyDevices {
                requested: options.devices.len(),
                available,
            });
        }
        if let Some(&index) = options.devices.iter().find(|&&d| d >= available) {
            return Err(Error::InvalidDevice { index, available });
        }
        if let Some(external) = &options.external {
            if external.len() != options.devices.len() {
                return Err(Error::invalid_argument(
                    "external",
                    format!(
                        "{} buffers given for {} devices",
                        external.len(),
                        options.devices.len()
                    ),
                ));
            }
        }

        let mode = if options.external.is_some() {
            MemoryMode::External
        } else {
            MemoryMode::Internal
        };

        let mut bindings = Vec::with_capacity(options.devices.len());
        for (i, &device) in options.devices.iter().enumerate() {
            let external = options.external.as_ref().map(|buffers| buffers[i]);
            match Self::bind(runtime, device, options.streams_per_device, external, config) {
                Ok(binding) => bindings.push(binding),
                Err(e) => {
                    Self::release(runtime, bindings, mode);
                    return Err(e);
                }
            }
        }

        if let Err(e) = runtime.bind_device(options.devices[0]) {
            Self::release(runtime, bindings, mode);
            return Err(e);
        }

        tracing::debug!(
            runtime = runtime.name(),
            devices = ?options.devices,
            streams_per_device = options.streams_per_device,
            ?mode,
            "device registry initialized"
        );
        self.bindings = bindings;
        self.mode = Some(mode);
        self.streams_per_device = options.streams_per_device;
        Ok(())
    }

    /// Bind device 0 (or every visible device with `multi_device`) using
    /// internally allocated scratch
    pub fn self_initialize(&mut self, runtime: &R, config: &Config) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }
        let available = runtime.device_count()?;
        if available == 0 {
            return Err(Error::NoDevices);
        }
        let devices: Vec<usize> = if config.multi_device {
            (0..available).collect()
        } else {
            vec![0]
        };
        let options = InitOptions::new(devices).with_streams_per_device(config.streams_per_device);
        self.initialize(runtime, &options, config)
    }

    fn bind(
        runtime: &R,
        device: usize,
        streams_per_device: usize,
        external: Option<ExternalScratch>,
        config: &Config,
    ) -> Result<DeviceBinding<R::Stream>> {
        runtime.bind_device(device)?;

        let mut streams = Vec::with_capacity(streams_per_device);
        for _ in 0..streams_per_device {
            match runtime.create_stream(device) {
                Ok(stream) => streams.push(stream),
                Err(e) => {
                    streams.into_iter().for_each(|s| runtime.destroy_stream(s));
                    return Err(e);
                }
            }
        }

        let scratch = match external {
            Some(buffer) => Ok((buffer.ptr, buffer.bytes, 0)),
            None => Self::allocate_scratch(runtime, device, config),
        };
        match scratch {
            Ok((scratch_base, scratch_bytes, allocated_bytes)) => Ok(DeviceBinding {
                device,
                scratch_base,
                scratch_bytes,
                allocated_bytes,
                streams,
            }),
            Err(e) => {
                streams.into_iter().for_each(|s| runtime.destroy_stream(s));
                Err(e)
            }
        }
    }

    fn allocate_scratch(
        runtime: &R,
        device: usize,
        config: &Config,
    ) -> Result<(DevicePtr, usize, usize)> {
        let bytes = match config.scratch_bytes {
            Some(bytes) => bytes,
            None => {
                let (free, total) = runtime.memory_info(device)?;
                let bytes = (free as f64 * config.memory_fraction) as usize;
                tracing::debug!(
                    device,
                    free,
                    total,
                    fraction = config.memory_fraction,
                    bytes,
                    "sizing scratch from free memory"
                );
                bytes
            }
        };
        let bytes = bytes / SCRATCH_ALIGN * SCRATCH_ALIGN;
        if bytes == 0 {
            return Err(Error::OutOfMemory { device, size: 0 });
        }
        let base = runtime.allocate(device, bytes)?;
        Ok((base, bytes, bytes))
    }

    fn release(runtime: &R, bindings: Vec<DeviceBinding<R::Stream>>, mode: MemoryMode) {
        for binding in bindings {
            for stream in binding.streams {
                runtime.destroy_stream(stream);
            }
            if mode == MemoryMode::Internal {
                runtime.deallocate(binding.device, binding.scratch_base, binding.allocated_bytes);
            }
        }
    }

    /// Release streams and (Internal mode) scratch. No-op when uninitialized.
    pub fn shutdown(&mut self, runtime: &R) {
        let Some(mode) = self.mode.take() else {
            return;
        };
        let bindings = std::mem::take(&mut self.bindings);
        tracing::debug!(devices = bindings.len(), ?mode, "device registry shut down");
        Self::release(runtime, bindings, mode);
        self.streams_per_device = 1;
    }

    /// Override the scratch capacity used by fit checks for `device`.
    ///
    /// Bookkeeping only: no memory is moved or resized.
    pub fn set_scratch_capacity(&mut self, device: usize, bytes: usize) -> Result<()> {
        if !self.is_initialized() {
            return Err(Error::NotInitialized);
        }
        let available = self.bindings.len();
        let binding = self
            .bindings
            .iter_mut()
            .find(|b| b.device == device)
            .ok_or(Error::InvalidDevice {
                index: device,
                available,
            })?;
        binding.scratch_bytes = bytes;
        Ok(())
    }

    /// Returns true between a successful initialize and shutdown
    #[inline]
    pub fn is_initialized(&self) -> bool {
        self.mode.is_some()
    }

    /// Returns true if the scratch memory is owned by the registry
    #[inline]
    pub fn is_internally_allocated(&self) -> bool {
        self.mode == Some(MemoryMode::Internal)
    }

    /// Returns true if the scratch memory was supplied by the caller
    #[inline]
    pub fn is_externally_allocated(&self) -> bool {
        self.mode == Some(MemoryMode::External)
    }

    /// Ownership of the scratch memory, if initialized
    #[inline]
    pub fn memory_mode(&self) -> Option<MemoryMode> {
        self.mode
    }

    /// Number of bound devices
    #[inline]
    pub fn device_count(&self) -> usize {
        self.bindings.len()
    }

    /// Streams per device
    #[inline]
    pub fn streams_per_device(&self) -> usize {
        self.streams_per_device
    }

    /// Bound devices in slot order
    #[inline]
    pub fn bindings(&self) -> &[DeviceBinding<R::Stream>] {
        &self.bindings
    }

    /// Total number of slots
    #[inline]
    pub fn slot_count(&self) -> usize {
        self.bindings.len() * self.streams_per_device
    }

    /// Slot `index`, if it exists
    pub fn slot(&self, index: usize) -> Option<Slot<'_, R::Stream>> {
        let devices = self.bindings.len();
        if index >= self.slot_count() {
            return None;
        }
        let binding = &self.bindings[index % devices];
        let lane = index / devices;
        let capacity = binding.slot_bytes(self.streams_per_device);
        Some(Slot {
            index,
            device: binding.device,
            stream: &binding.streams[lane],
            scratch: binding.scratch_base + (lane * capacity) as DevicePtr,
            capacity,
        })
    }

    /// All slots in index order
    pub fn slots(&self) -> impl Iterator<Item = Slot<'_, R::Stream>> {
        (0..self.slot_count()).filter_map(|i| self.slot(i))
    }

    /// Smallest slot scratch capacity in bytes (0 when uninitialized)
    pub fn min_slot_capacity(&self) -> usize {
        self.bindings
            .iter()
            .map(|b| b.slot_bytes(self.streams_per_device))
            .min()
            .unwrap_or(0)
    }

    /// Scratch capacity summed over all devices
    pub fn total_capacity(&self) -> usize {
        self.bindings.iter().map(|b| b.scratch_bytes).sum()
    }
}

impl<R: DeviceRuntime> Drop for DeviceRegistry<R> {
    fn drop(&mut self) {
        if self.is_initialized() {
            tracing::warn!(
                devices = self.bindings.len(),
                "device registry dropped without shutdown; device resources leak"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::sim::{FaultSite, SimRuntime};

    const MIB: usize = 1 << 20;

    #[test]
    fn test_initialize_internal_and_shutdown() {
        let rt = SimRuntime::new(2, 10 * MIB);
        let mut reg = DeviceRegistry::<SimRuntime>::new();
        reg.initialize(&rt, &InitOptions::new([0, 1]), &Config::default())
            .unwrap();
        assert!(reg.is_initialized());
        assert!(reg.is_internally_allocated());
        assert_eq!(reg.device_count(), 2);
        assert_eq!(reg.slot_count(), 2);
        // 80% of 10 MiB, rounded to the scratch alignment
        assert_eq!(reg.bindings()[0].scratch_bytes(), 8 * MIB / 256 * 256);
        assert_eq!(rt.live_allocations(0), 1);
        assert_eq!(rt.current_device(), 0);

        reg.shutdown(&rt);
        assert!(!reg.is_initialized());
        assert_eq!(rt.live_allocations(0), 0);
        assert_eq!(rt.live_allocations(1), 0);
        assert_eq!(rt.stats().streams_destroyed, 2);
    }

    #[test]
    fn test_lifecycle_is_idempotent() {
        let rt = SimRuntime::new(1, MIB);
        let mut reg = DeviceRegistry::<SimRuntime>::new();
        let config = Config::default().with_scratch_bytes(64 * 1024);
        reg.initialize(&rt, &InitOptions::new([0]), &config).unwrap();
        reg.initialize(&rt, &InitOptions::new([0]), &config).unwrap();
        assert_eq!(rt.live_allocations(0), 1);
        assert_eq!(rt.stats().streams_created, 1);

        reg.shutdown(&rt);
        reg.shutdown(&rt);
        assert_eq!(rt.live_allocations(0), 0);
        assert_eq!(rt.stats().streams_destroyed, 1);
    }

    #[test]
    fn test_fatal_initialization_errors() {
        let config = Config::default();
        let mut reg = DeviceRegistry::<SimRuntime>::new();

        let none = SimRuntime::new(0, MIB);
        let err = reg.initialize(&none, &InitOptions::new([0]), &config).unwrap_err();
        assert!(matches!(err, Error::NoDevices));
        assert!(matches!(
            reg.self_initialize(&none, &config),
            Err(Error::NoDevices)
        ));

        let two = SimRuntime::new(2, MIB);
        let err = reg
            .initialize(&two, &InitOptions::new([0, 1, 0]), &config)
            .unwrap_err();
        assert!(matches!(
            err,
            Error::TooManyDevices {
                requested: 3,
                available: 2
            }
        ));
        let err = reg.initialize(&two, &InitOptions::new([5]), &config).unwrap_err();
        assert!(matches!(err, Error::InvalidDevice { index: 5, .. }));
        assert!(err.is_fatal());
        assert!(!reg.is_initialized());
    }

    #[test]
    fn test_failed_initialization_releases_resources() {
        let rt = SimRuntime::new(2, MIB);
        rt.inject_fault(1, FaultSite::Allocate);
        let mut reg = DeviceRegistry::<SimRuntime>::new();
        let err = reg
            .initialize(&rt, &InitOptions::new([0, 1]), &Config::default())
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!reg.is_initialized());
        assert_eq!(rt.live_allocations(0), 0);
        let stats = rt.stats();
        assert_eq!(stats.streams_created, stats.streams_destroyed);
    }

    #[test]
    fn test_external_scratch_is_not_freed() {
        let rt = SimRuntime::new(1, MIB);
        let buffer = rt.allocate(0, 4096).unwrap();
        let mut reg = DeviceRegistry::<SimRuntime>::new();
        let options = InitOptions::new([0])
            .with_external([ExternalScratch {
                ptr: buffer,
                bytes: 4096,
            }])
            .with_streams_per_device(2);
        reg.initialize(&rt, &options, &Config::default()).unwrap();
        assert!(reg.is_externally_allocated());
        assert_eq!(reg.slot_count(), 2);
        let s1 = reg.slot(1).unwrap();
        assert_eq!(s1.scratch, buffer + 2048);
        assert_eq!(s1.capacity, 2048);

        reg.shutdown(&rt);
        assert_eq!(rt.live_allocations(0), 1);
        rt.deallocate(0, buffer, 4096);
    }

    #[test]
    fn test_slot_mapping_round_robins_devices() {
        let rt = SimRuntime::new(2, MIB);
        let mut reg = DeviceRegistry::<SimRuntime>::new();
        let options = InitOptions::new([1, 0]).with_streams_per_device(2);
        let config = Config::default().with_scratch_bytes(8192);
        reg.initialize(&rt, &options, &config).unwrap();

        let slots: Vec<_> = reg.slots().map(|s| (s.index, s.device)).collect();
        assert_eq!(slots, vec![(0, 1), (1, 0), (2, 1), (3, 0)]);
        let (s0, s2) = (reg.slot(0).unwrap(), reg.slot(2).unwrap());
        assert_eq!(s2.scratch - s0.scratch, 4096);
        assert!(reg.slot(4).is_none());
        // the first listed device is current after setup
        assert_eq!(rt.current_device(), 1);
        assert_eq!(reg.min_slot_capacity(), 4096);
        assert_eq!(reg.total_capacity(), 16384);
        reg.shutdown(&rt);
    }

    #[test]
    fn test_set_scratch_capacity_is_bookkeeping_only() {
        let rt = SimRuntime::new(1, MIB);
        let mut reg = DeviceRegistry::<SimRuntime>::new();
        assert!(matches!(
            reg.set_scratch_capacity(0, 1024),
            Err(Error::NotInitialized)
        ));
        let config = Config::default().with_scratch_bytes(65536);
        reg.initialize(&rt, &InitOptions::new([0]), &config).unwrap();
        reg.set_scratch_capacity(0, 1024).unwrap();
        assert_eq!(reg.min_slot_capacity(), 1024);
        assert_eq!(rt.memory_info(0).unwrap().0, MIB - 65536);
        assert!(matches!(
            reg.set_scratch_capacity(3, 1024),
            Err(Error::InvalidDevice { index: 3, .. })
        ));
        reg.shutdown(&rt);
        assert_eq!(rt.live_allocations(0), 0);
    }

    #[test]
    fn test_self_initialize_multi_device() {
        let rt = SimRuntime::new(3, MIB);
        let mut reg = DeviceRegistry::<SimRuntime>::new();
        reg.self_initialize(&rt, &Config::default()).unwrap();
        assert_eq!(reg.device_count(), 1);
        reg.shutdown(&rt);

        let config = Config::default()
            .with_multi_device(true)
            .with_streams_per_device(2);
        reg.self_initialize(&rt, &config).unwrap();
        assert_eq!(reg.device_count(), 3);
        assert_eq!(reg.slot_count(), 6);
        reg.shutdown(&rt);
    }
}
