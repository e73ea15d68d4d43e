//! ProcessRegistry: slot allocation and recycling over one shared segment

use super::handle::ProcessHandle;
use super::layout::{
    check_name, ControlBlock, Layout, ParamBlock, ParamRef, PsdBlock, PsdRef, MAX_PROCESS_NAME,
    NO_OFFSET,
};
use super::summary::UsageSummary;
use super::{age_of, now_ms};
use crate::config::{ProcessStateConfig, DEFAULT_SEGMENT_ID};
use crate::error::{ProcStateError, ProcStateResult, Resource};
use crate::memory::{SegmentGuard, SharedSegment};
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Minimum interval between two low-capacity warnings of one registry
const CAPACITY_WARNING_INTERVAL: Duration = Duration::from_secs(60);

/// Snapshot of one registered process, read under one lock
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProcessInfo {
    pub name: String,
    pub pid: i32,
    pub flags: i32,
    /// Index of the psd block
    pub slot: usize,
    pub start_time_ms: i64,
    pub last_heartbeat_ms: i64,
    pub parameter_count: usize,
    pub timed_out: bool,
}

impl ProcessInfo {
    pub fn heartbeat_age(&self) -> Duration {
        age_of(self.last_heartbeat_ms)
    }

    pub fn uptime(&self) -> Duration {
        age_of(self.start_time_ms)
    }
}

/// Locked view of the registry blocks
pub(crate) struct RegistryGuard<'a> {
    guard: SegmentGuard<'a>,
    layout: Layout,
}

impl<'a> RegistryGuard<'a> {
    pub(crate) fn new(guard: SegmentGuard<'a>, layout: Layout) -> Self {
        Self { guard, layout }
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn segment_size(&self) -> usize {
        self.guard.segment().size()
    }

    pub(crate) fn psd(&self, index: usize) -> PsdRef<'_> {
        debug_assert!(index < self.layout.max_psd_blocks);
        let offset = self.layout.psd_offset(index);
        // SAFETY: the offset lies inside the payload (layout validated against
        // the segment size) and the lock is held for the lifetime of &self
        unsafe {
            PsdRef::new(
                self.guard.as_ptr().add(offset as usize) as *mut PsdBlock,
                offset,
            )
        }
    }

    pub(crate) fn param(&self, index: usize) -> ParamRef<'_> {
        debug_assert!(index < self.layout.max_param_blocks);
        let offset = self.layout.param_offset(index);
        // SAFETY: as in psd()
        unsafe {
            ParamRef::new(
                self.guard.as_ptr().add(offset as usize) as *mut ParamBlock,
                offset,
            )
        }
    }

    pub(crate) fn psd_at(&self, offset: i32) -> ProcStateResult<PsdRef<'_>> {
        self.layout
            .psd_index(offset)
            .map(|i| self.psd(i))
            .ok_or_else(|| ProcStateError::Corrupted(format!("invalid psd offset {}", offset)))
    }

    pub(crate) fn param_at(&self, offset: i32) -> ProcStateResult<ParamRef<'_>> {
        self.layout
            .param_index(offset)
            .map(|i| self.param(i))
            .ok_or_else(|| ProcStateError::Corrupted(format!("invalid parameter offset {}", offset)))
    }

    pub(crate) fn psds(&self) -> impl Iterator<Item = PsdRef<'_>> + '_ {
        (0..self.layout.max_psd_blocks).map(move |i| self.psd(i))
    }

    pub(crate) fn params(&self) -> impl Iterator<Item = ParamRef<'_>> + '_ {
        (0..self.layout.max_param_blocks).map(move |i| self.param(i))
    }

    pub(crate) fn find_psd(&self, name: &str) -> Option<PsdRef<'_>> {
        self.psds().find(|psd| psd.used() && psd.name_is(name))
    }

    fn find_free_psd(&self) -> Option<PsdRef<'_>> {
        self.psds().find(|psd| !psd.used())
    }

    fn find_free_param(&self) -> Option<ParamRef<'_>> {
        self.params().find(|param| !param.used())
    }

    /// Parameter blocks chained to `psd`, in insertion order.
    ///
    /// A link pointing at its own block, outside the pool, or a chain longer
    /// than the pool is reported as corruption instead of being followed.
    pub(crate) fn chain(&self, psd: PsdRef<'_>) -> ProcStateResult<Vec<ParamRef<'_>>> {
        let mut chain = Vec::new();
        let mut offset = psd.first_parameter();
        while offset != NO_OFFSET {
            let param = self.param_at(offset).map_err(|_| {
                let err = ProcStateError::Corrupted(format!(
                    "parameter chain of '{}' points to invalid offset {}",
                    psd.name(),
                    offset
                ));
                log::error!("{}", err);
                err
            })?;

            let next = param.next_parameter();
            if next == offset {
                let err = ProcStateError::Corrupted(format!(
                    "parameter block {} ('{}') of '{}' links to itself",
                    offset,
                    param.name(),
                    psd.name()
                ));
                log::error!("{}", err);
                return Err(err);
            }

            chain.push(param);
            if chain.len() > self.layout.max_param_blocks {
                let err = ProcStateError::Corrupted(format!(
                    "parameter chain of '{}' contains a cycle",
                    psd.name()
                ));
                log::error!("{}", err);
                return Err(err);
            }
            offset = next;
        }
        Ok(chain)
    }

    pub(crate) fn find_param(
        &self,
        psd: PsdRef<'_>,
        key: &str,
    ) -> ProcStateResult<Option<ParamRef<'_>>> {
        let found = self.chain(psd)?.into_iter().find(|p| p.name_is(key));
        if found.is_none() {
            log::trace!(
                "parameter '{}' not found for '{}' (first={}, last={})",
                key,
                psd.name(),
                psd.first_parameter(),
                psd.last_parameter()
            );
        }
        Ok(found)
    }

    /// Overwrite `key` in place or append a new block to the chain, then
    /// refresh the heartbeat. `value` must already be length checked.
    pub(crate) fn set_param(&self, psd: PsdRef<'_>, key: &str, value: &[u8]) -> ProcStateResult<()> {
        match self.find_param(psd, key)? {
            Some(param) => param.set_value(value),
            None => {
                let Some(param) = self.find_free_param() else {
                    log::error!(
                        "could not create parameter block for '{}' of '{}', no space left in shm segment",
                        key,
                        psd.name()
                    );
                    return Err(ProcStateError::CapacityExhausted {
                        resource: Resource::ParameterSlot,
                        detail: format!(
                            "all {} parameter blocks in use, cannot add '{}' to '{}'",
                            self.layout.max_param_blocks,
                            key,
                            psd.name()
                        ),
                    });
                };

                param.set_name(key);
                param.set_value(value);
                param.set_next_parameter(NO_OFFSET);
                param.set_used(true);

                let last = psd.last_parameter();
                if psd.first_parameter() == NO_OFFSET || last == NO_OFFSET {
                    psd.set_first_parameter(param.offset());
                } else {
                    self.param_at(last)?.set_next_parameter(param.offset());
                }
                psd.set_last_parameter(param.offset());
            }
        }
        psd.set_heartbeat_ms(now_ms());
        Ok(())
    }

    /// Release every parameter block of `psd`. Returns the number released.
    pub(crate) fn clear_chain(&self, psd: PsdRef<'_>) -> ProcStateResult<usize> {
        let chain = self.chain(psd)?;
        for param in &chain {
            param.clear();
        }
        psd.set_first_parameter(NO_OFFSET);
        psd.set_last_parameter(NO_OFFSET);
        Ok(chain.len())
    }

    pub(crate) fn info(&self, psd: PsdRef<'_>, psd_timeout: Option<Duration>) -> ProcStateResult<ProcessInfo> {
        let last_heartbeat_ms = psd.heartbeat_ms();
        Ok(ProcessInfo {
            name: psd.name(),
            pid: psd.pid(),
            flags: psd.flags(),
            slot: self.layout.psd_index(psd.offset()).unwrap_or_default(),
            start_time_ms: psd.start_time_ms(),
            last_heartbeat_ms,
            parameter_count: self.chain(psd)?.len(),
            timed_out: psd_timeout.is_some_and(|t| age_of(last_heartbeat_ms) > t),
        })
    }

    fn read_control(&self) -> ControlBlock {
        // SAFETY: the payload starts with the control block; the size check in
        // Layout::compute guarantees it fits
        unsafe { std::ptr::read_unaligned(self.guard.as_ptr() as *const ControlBlock) }
    }

    /// Lay out a fresh payload: control block plus empty psd/param pools.
    fn format(&self) {
        // SAFETY: see read_control
        unsafe {
            std::ptr::write_unaligned(
                self.guard.as_ptr() as *mut ControlBlock,
                self.layout.to_control(),
            )
        };
        for psd in self.psds() {
            psd.clear();
        }
        for param in self.params() {
            param.clear();
        }
    }
}

/// State shared by a registry and all handles created from it
pub(crate) struct RegistryShared {
    segment: SharedSegment,
    layout: Layout,
    read_only: bool,
    psd_timeout: Option<Duration>,
    own: Mutex<Option<(String, i32)>>,
    last_capacity_warning: Mutex<Option<Instant>>,
}

impl RegistryShared {
    pub(crate) fn lock(&self) -> ProcStateResult<RegistryGuard<'_>> {
        Ok(RegistryGuard::new(self.segment.locked()?, self.layout))
    }

    pub(crate) fn layout(&self) -> &Layout {
        &self.layout
    }

    pub(crate) fn psd_timeout(&self) -> Option<Duration> {
        self.psd_timeout
    }

    pub(crate) fn ensure_writable(&self, op: &str) -> ProcStateResult<()> {
        if self.read_only {
            return Err(ProcStateError::ReadOnly(format!(
                "{} not allowed on read-only registry {}",
                op,
                self.segment.key()
            )));
        }
        Ok(())
    }

    /// Heartbeat word of the psd block at `offset`, accessible without the lock
    pub(crate) fn heartbeat_word(&self, offset: i32) -> ProcStateResult<&AtomicI64> {
        if self.layout.psd_index(offset).is_none() {
            return Err(ProcStateError::Corrupted(format!("invalid psd offset {}", offset)));
        }
        // SAFETY: offset is a validated psd offset inside the attached payload;
        // only the atomic heartbeat field is touched through this view
        let psd = unsafe {
            PsdRef::new(
                self.segment.as_ptr().add(offset as usize) as *mut PsdBlock,
                offset,
            )
        };
        Ok(psd.heartbeat())
    }

    pub(crate) fn forget_own(&self, offset: i32) {
        let mut own = self.own.lock();
        if matches!(&*own, Some((_, o)) if *o == offset) {
            *own = None;
        }
    }

    fn summary(&self, short: bool) -> ProcStateResult<UsageSummary> {
        let summary = {
            let guard = self.lock()?;
            UsageSummary::collect(&guard, self.psd_timeout, short)
        };
        self.warn_low_capacity(&summary);
        Ok(summary)
    }

    fn warn_low_capacity(&self, summary: &UsageSummary) {
        let warnings = summary.capacity_warnings();
        if warnings.is_empty() {
            return;
        }

        let mut last = self.last_capacity_warning.lock();
        if last.is_some_and(|t| t.elapsed() < CAPACITY_WARNING_INTERVAL) {
            return;
        }
        *last = Some(Instant::now());
        for warning in warnings {
            log::error!("({}) {}", self.segment.key(), warning);
        }
    }
}

/// Registry of process descriptors in one shared segment
///
/// Cloning is cheap; all clones share the same attachment. The segment is
/// detached (and destroyed if this was the last attacher) when the last
/// clone and the last handle are dropped.
#[derive(Clone)]
pub struct ProcessRegistry {
    shared: Arc<RegistryShared>,
}

impl ProcessRegistry {
    /// Open or create `segment_id` with explicit pool sizes.
    ///
    /// `max_param_blocks == 0` gives all space behind the psd array to parameters.
    pub fn new(
        segment_id: &str,
        max_psd_blocks: usize,
        max_param_blocks: usize,
        size_bytes: usize,
        read_only: bool,
    ) -> ProcStateResult<Self> {
        let builder = Self::builder()
            .segment_id(segment_id)
            .max_psd_blocks(max_psd_blocks)
            .shm_size(size_bytes)
            .read_only(read_only);
        let builder = if max_param_blocks > 0 {
            builder.max_param_blocks(max_param_blocks)
        } else {
            builder
        };
        builder.build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Open the registry described by `config` under the default segment id.
    pub fn from_config(config: ProcessStateConfig) -> ProcStateResult<Self> {
        Self::builder().config(config).build()
    }

    /// Register this process as `name`.
    ///
    /// An existing entry with the same name (a previous incarnation, possibly
    /// crashed) is recycled in place with an empty parameter chain. Running
    /// out of psd blocks is fatal, see [`ProcStateError::is_fatal`].
    pub fn register_self(&self, name: &str, pid: i32, flags: i32) -> ProcStateResult<ProcessHandle> {
        self.shared.ensure_writable("register")?;
        check_name("process", name, MAX_PROCESS_NAME)?;

        let offset = {
            let guard = self.shared.lock()?;
            let slot = match guard.find_psd(name) {
                Some(psd) => {
                    let released = guard.clear_chain(psd)?;
                    log::info!(
                        "recycling existing psd block of '{}' (pid {}), cleared {} parameters",
                        name,
                        psd.pid(),
                        released
                    );
                    Some(psd)
                }
                None => guard.find_free_psd(),
            };

            slot.map(|psd| {
                let now = now_ms();
                psd.set_name(name);
                psd.set_pid(pid);
                psd.set_flags(flags);
                psd.set_start_time_ms(now);
                psd.set_heartbeat_ms(now);
                psd.set_first_parameter(NO_OFFSET);
                psd.set_last_parameter(NO_OFFSET);
                psd.set_used(true);
                psd.offset()
            })
        };

        // summaries take the lock themselves
        let Some(offset) = offset else {
            let summary = self.usage_summary(false).unwrap_or_default();
            log::info!("SHM usage summary:\n{}", summary);
            let err = ProcStateError::CapacityExhausted {
                resource: Resource::ProcessSlot,
                detail: format!(
                    "failed to find a free psd block for '{}' ({} in use)",
                    name,
                    self.shared.layout().max_psd_blocks
                ),
            };
            log::error!("{}", err);
            return Err(err);
        };

        if let Ok(summary) = self.usage_summary(true) {
            log::info!("registered '{}' (pid {}), SHM usage summary:\n{}", name, pid, summary);
        }

        *self.shared.own.lock() = Some((name.to_string(), offset));
        Ok(ProcessHandle::bound(self.shared.clone(), name.to_string(), offset))
    }

    /// Handle for a process that may not exist yet or may move to another
    /// slot after a restart; its target is resolved by name on every access.
    pub fn handle_for(&self, name: &str) -> ProcStateResult<ProcessHandle> {
        check_name("process", name, MAX_PROCESS_NAME)?;
        Ok(ProcessHandle::by_name(self.shared.clone(), name.to_string()))
    }

    /// Handle of the process registered through this registry, if any
    pub fn own_handle(&self) -> Option<ProcessHandle> {
        self.shared
            .own
            .lock()
            .clone()
            .map(|(name, offset)| ProcessHandle::bound(self.shared.clone(), name, offset))
    }

    /// Names of all registered processes
    pub fn list_processes(&self) -> ProcStateResult<Vec<String>> {
        let guard = self.shared.lock()?;
        let names = guard.psds().filter(|p| p.used()).map(|p| p.name()).collect();
        Ok(names)
    }

    pub fn process_info(&self, name: &str) -> ProcStateResult<Option<ProcessInfo>> {
        let guard = self.shared.lock()?;
        let info = guard
            .find_psd(name)
            .map(|psd| guard.info(psd, self.shared.psd_timeout()))
            .transpose()?;
        Ok(info)
    }

    pub fn process_infos(&self) -> ProcStateResult<Vec<ProcessInfo>> {
        let guard = self.shared.lock()?;
        let infos = guard
            .psds()
            .filter(|p| p.used())
            .map(|psd| guard.info(psd, self.shared.psd_timeout()))
            .collect::<ProcStateResult<Vec<_>>>()?;
        Ok(infos)
    }

    /// Whether the heartbeat of `info` is older than the configured timeout
    pub fn is_timed_out(&self, info: &ProcessInfo) -> bool {
        self.shared
            .psd_timeout()
            .is_some_and(|t| info.heartbeat_age() > t)
    }

    /// Rendered usage summary, see [`UsageSummary`]
    pub fn usage_summary(&self, short: bool) -> ProcStateResult<String> {
        Ok(self.shared.summary(short)?.to_string())
    }

    pub fn usage(&self) -> ProcStateResult<UsageSummary> {
        self.shared.summary(false)
    }

    pub fn psd_timeout(&self) -> Option<Duration> {
        self.shared.psd_timeout()
    }

    pub fn layout(&self) -> Layout {
        *self.shared.layout()
    }

    pub fn is_read_only(&self) -> bool {
        self.shared.read_only
    }

    pub fn segment(&self) -> &SharedSegment {
        &self.shared.segment
    }

    /// Detach like a crashed process: registered entries stay as they are and
    /// the segment is not destroyed, even if this was the last attacher.
    ///
    /// Fails (and detaches normally) while other clones or handles of this
    /// registry are still alive.
    pub fn detach_without_cleanup(self) -> ProcStateResult<()> {
        match Arc::try_unwrap(self.shared) {
            Ok(shared) => {
                log::debug!("({}) detaching without cleanup", shared.segment.key());
                shared.segment.detach_without_cleanup();
                Ok(())
            }
            Err(shared) => Err(ProcStateError::InvalidInput(format!(
                "registry {} still has {} other users",
                shared.segment.key(),
                Arc::strong_count(&shared) - 1
            ))),
        }
    }
}

impl std::fmt::Debug for ProcessRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessRegistry")
            .field("segment", &self.shared.segment)
            .field("layout", &self.shared.layout)
            .field("read_only", &self.shared.read_only)
            .finish()
    }
}

/// Builder for [`ProcessRegistry`]
#[derive(Debug, Clone)]
pub struct RegistryBuilder {
    segment_id: String,
    config: ProcessStateConfig,
    max_param_blocks: Option<usize>,
    read_only: bool,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self {
            segment_id: DEFAULT_SEGMENT_ID.to_string(),
            config: ProcessStateConfig::default(),
            max_param_blocks: None,
            read_only: false,
        }
    }
}

impl RegistryBuilder {
    pub fn segment_id(mut self, segment_id: impl Into<String>) -> Self {
        self.segment_id = segment_id.into();
        self
    }

    pub fn config(mut self, config: ProcessStateConfig) -> Self {
        self.config = config;
        self
    }

    pub fn shm_size(mut self, size: usize) -> Self {
        self.config.shm_size = size;
        self
    }

    pub fn max_psd_blocks(mut self, blocks: usize) -> Self {
        self.config.max_psd_blocks = blocks;
        self
    }

    /// Fixed parameter pool size; defaults to whatever fits behind the psd array
    pub fn max_param_blocks(mut self, blocks: usize) -> Self {
        self.max_param_blocks = Some(blocks);
        self
    }

    pub fn psd_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.psd_timeout_secs = timeout.map(|t| t.as_secs()).unwrap_or(0);
        self
    }

    pub fn application_name(mut self, app: impl Into<String>) -> Self {
        self.config.application_name = Some(app.into());
        self
    }

    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn build(self) -> ProcStateResult<ProcessRegistry> {
        self.config.validate()?;
        let wanted = Layout::compute(
            self.config.shm_size,
            self.config.max_psd_blocks,
            self.max_param_blocks,
        )?;

        let segment = SharedSegment::open_or_create(
            &self.segment_id,
            self.config.shm_size,
            self.config.application_name.as_deref(),
        )?;

        let layout = {
            let guard = RegistryGuard::new(segment.locked()?, wanted);
            if segment.is_initialized() {
                let layout = Layout::from_control(&guard.read_control(), segment.size())?;
                if layout != wanted {
                    log::warn!(
                        "({}) using existing layout {:?} instead of configured {:?}",
                        segment.key(),
                        layout,
                        wanted
                    );
                }
                layout
            } else {
                guard.format();
                segment.set_initialized();
                log::debug!(
                    "({}) initialized registry: {} psd blocks, {} param blocks",
                    segment.key(),
                    wanted.max_psd_blocks,
                    wanted.max_param_blocks
                );
                wanted
            }
        };

        Ok(ProcessRegistry {
            shared: Arc::new(RegistryShared {
                segment,
                layout,
                read_only: self.read_only,
                psd_timeout: self.config.psd_timeout(),
                own: Mutex::new(None),
                last_capacity_warning: Mutex::new(None),
            }),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_app(prefix: &str) -> String {
        format!(
            "{}_{}_{}",
            prefix,
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap()
                .as_nanos()
        )
    }

    fn small_registry(app: &str) -> ProcessRegistry {
        ProcessRegistry::builder()
            .application_name(app)
            .segment_id("unit")
            .shm_size(64 * 1024)
            .max_psd_blocks(8)
            .max_param_blocks(16)
            .build()
            .unwrap()
    }

    #[test]
    fn fresh_registry_is_empty() {
        let reg = small_registry(&unique_app("reg_empty"));
        assert!(reg.list_processes().unwrap().is_empty());
        assert!(reg.segment().is_initialized());
        assert_eq!(reg.layout().max_param_blocks, 16);
        assert!(reg.own_handle().is_none());
    }

    #[test]
    fn second_attacher_adopts_existing_layout() {
        let app = unique_app("reg_adopt");
        let first = small_registry(&app);
        let second = ProcessRegistry::builder()
            .application_name(&app)
            .segment_id("unit")
            .shm_size(64 * 1024)
            .max_psd_blocks(8)
            .build()
            .unwrap();
        assert_eq!(second.layout(), first.layout());
    }

    #[test]
    fn register_exhausts_psd_pool() {
        let reg = small_registry(&unique_app("reg_full"));
        for i in 0..8 {
            reg.register_self(&format!("proc{}", i), 100 + i, 0).unwrap();
        }
        let err = reg.register_self("one_too_many", 1, 0).unwrap_err();
        assert!(matches!(
            err,
            ProcStateError::CapacityExhausted {
                resource: Resource::ProcessSlot,
                ..
            }
        ));
        assert!(err.is_fatal());
        // recycling still works when full
        reg.register_self("proc3", 7, 0).unwrap();
    }

    #[test]
    fn overlong_name_rejected() {
        let reg = small_registry(&unique_app("reg_name"));
        let err = reg.register_self(&"n".repeat(51), 1, 0).unwrap_err();
        assert!(matches!(err, ProcStateError::InvalidInput(_)));
        assert!(reg.handle_for(&"n".repeat(51)).is_err());
    }

    #[test]
    fn read_only_refuses_registration() {
        let app = unique_app("reg_ro");
        let _writer = small_registry(&app);
        let reader = ProcessRegistry::builder()
            .application_name(&app)
            .segment_id("unit")
            .shm_size(64 * 1024)
            .max_psd_blocks(8)
            .read_only(true)
            .build()
            .unwrap();
        assert!(matches!(
            reader.register_self("x", 1, 0),
            Err(ProcStateError::ReadOnly(_))
        ));
    }

    #[test]
    fn process_info_snapshot() {
        let reg = small_registry(&unique_app("reg_info"));
        let handle = reg.register_self("tracker", 4242, 3).unwrap();
        handle.set_parameter("a", b"1").unwrap();
        handle.set_parameter("b", b"2").unwrap();

        let info = reg.process_info("tracker").unwrap().unwrap();
        assert_eq!(info.pid, 4242);
        assert_eq!(info.flags, 3);
        assert_eq!(info.parameter_count, 2);
        assert!(!info.timed_out);
        assert!(!reg.is_timed_out(&info));
        assert!(info.heartbeat_age() < Duration::from_secs(5));

        assert!(reg.process_info("nobody").unwrap().is_none());
        assert_eq!(reg.process_infos().unwrap().len(), 1);
        assert_eq!(reg.own_handle().unwrap().name(), "tracker");
    }

    #[test]
    fn chain_corruption_detected() {
        let reg = small_registry(&unique_app("reg_corrupt"));
        let handle = reg.register_self("victim", 1, 0).unwrap();
        handle.set_parameter("k", b"v").unwrap();

        {
            let guard = reg.shared.lock().unwrap();
            let psd = guard.find_psd("victim").unwrap();
            let param = guard.param_at(psd.first_parameter()).unwrap();
            param.set_next_parameter(param.offset());
        }

        let err = handle.list_parameters().unwrap_err();
        assert!(matches!(err, ProcStateError::Corrupted(_)));
        assert!(err.is_fatal());
    }
}
