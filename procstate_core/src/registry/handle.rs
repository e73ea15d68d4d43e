//! ProcessHandle: parameter access for one registered process

use super::layout::{check_name, PsdRef, MAX_PARAM_LENGTH, MAX_PARAM_NAME, NO_OFFSET};
use super::registry::{RegistryGuard, RegistryShared};
use super::{age_of, ms_to_system_time, now_ms, value};
use crate::error::{ProcStateError, ProcStateResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

/// How a handle finds its psd block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Binding {
    /// Created by registration; stays on this block for its lifetime
    Slot(i32),
    /// Resolved by name on every access
    ByName,
}

/// View of one process descriptor and its parameter chain
///
/// Handles returned by [`ProcessRegistry::register_self`] are bound to the
/// block allocated for this process. Handles from
/// [`ProcessRegistry::handle_for`] look their process up by name on every
/// call, so they follow a process across restarts and report
/// [`is_valid`](Self::is_valid) `false` while it is not registered.
///
/// [`ProcessRegistry::register_self`]: super::ProcessRegistry::register_self
/// [`ProcessRegistry::handle_for`]: super::ProcessRegistry::handle_for
#[derive(Clone)]
pub struct ProcessHandle {
    shared: Arc<RegistryShared>,
    name: String,
    binding: Binding,
}

impl ProcessHandle {
    pub(crate) fn bound(shared: Arc<RegistryShared>, name: String, offset: i32) -> Self {
        Self {
            shared,
            name,
            binding: Binding::Slot(offset),
        }
    }

    pub(crate) fn by_name(shared: Arc<RegistryShared>, name: String) -> Self {
        Self {
            shared,
            name,
            binding: Binding::ByName,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this handle is bound to a fixed block
    pub fn is_bound(&self) -> bool {
        matches!(self.binding, Binding::Slot(_))
    }

    fn resolve<'g>(&self, guard: &'g RegistryGuard<'_>) -> ProcStateResult<Option<PsdRef<'g>>> {
        match self.binding {
            Binding::Slot(offset) => {
                let psd = guard.psd_at(offset)?;
                Ok(psd.used().then_some(psd))
            }
            Binding::ByName => Ok(guard.find_psd(&self.name)),
        }
    }

    fn resolve_or_err<'g>(&self, guard: &'g RegistryGuard<'_>) -> ProcStateResult<PsdRef<'g>> {
        self.resolve(guard)?
            .ok_or_else(|| ProcStateError::NotFound(self.name.clone()))
    }

    fn check_value(key: &str, value: &[u8]) -> ProcStateResult<()> {
        check_name("parameter", key, MAX_PARAM_NAME)?;
        if value.len() > MAX_PARAM_LENGTH {
            log::error!(
                "parameter '{}' value exceeds data limit of {} bytes ({} bytes)",
                key,
                MAX_PARAM_LENGTH,
                value.len()
            );
            return Err(ProcStateError::ValueTooLarge {
                key: key.to_string(),
                len: value.len(),
                max: MAX_PARAM_LENGTH,
            });
        }
        Ok(())
    }

    /// Store `value` under `key`, overwriting in place if the key exists.
    ///
    /// Values over [`MAX_PARAM_LENGTH`] bytes are rejected with
    /// [`ProcStateError::ValueTooLarge`] before anything is written.
    pub fn set_parameter(&self, key: &str, value: &[u8]) -> ProcStateResult<()> {
        self.shared.ensure_writable("set_parameter")?;
        Self::check_value(key, value)?;

        let guard = self.shared.lock()?;
        let psd = self.resolve_or_err(&guard)?;
        guard.set_param(psd, key, value)
    }

    /// Value of `key`, `None` if the process has no such parameter.
    pub fn get_parameter(&self, key: &str) -> ProcStateResult<Option<Vec<u8>>> {
        let guard = self.shared.lock()?;
        let psd = self.resolve_or_err(&guard)?;
        let value = guard.find_param(psd, key)?.map(|p| p.value()).transpose()?;
        Ok(value)
    }

    /// Replace the value of `key` and return the previous one, both under
    /// one lock hold. An absent key is created and `None` returned.
    pub fn get_and_set_parameter_atomic(
        &self,
        key: &str,
        new_value: &[u8],
    ) -> ProcStateResult<Option<Vec<u8>>> {
        self.shared.ensure_writable("get_and_set_parameter_atomic")?;
        Self::check_value(key, new_value)?;

        let guard = self.shared.lock()?;
        let psd = self.resolve_or_err(&guard)?;
        let old = guard.find_param(psd, key)?.map(|p| p.value()).transpose()?;
        guard.set_param(psd, key, new_value)?;
        Ok(old)
    }

    pub fn has_parameter(&self, key: &str) -> ProcStateResult<bool> {
        let guard = self.shared.lock()?;
        let psd = self.resolve_or_err(&guard)?;
        let found = guard.find_param(psd, key)?.is_some();
        Ok(found)
    }

    /// Parameter names in insertion order
    pub fn list_parameters(&self) -> ProcStateResult<Vec<String>> {
        let guard = self.shared.lock()?;
        let psd = self.resolve_or_err(&guard)?;
        let names = guard
            .chain(psd)?
            .into_iter()
            .filter(|p| p.used())
            .map(|p| p.name())
            .filter(|n| !n.is_empty())
            .collect();
        Ok(names)
    }

    /// Whether the handle currently resolves to a registered process
    pub fn is_valid(&self) -> bool {
        match self.shared.lock() {
            Ok(guard) => matches!(self.resolve(&guard), Ok(Some(_))),
            Err(e) => {
                log::warn!("({}) validity check failed: {}", self.name, e);
                false
            }
        }
    }

    /// Index of the psd block currently backing this handle
    pub fn slot(&self) -> Option<usize> {
        let guard = self.shared.lock().ok()?;
        let offset = self.resolve(&guard).ok()??.offset();
        self.shared.layout().psd_index(offset)
    }

    fn heartbeat_ms(&self) -> ProcStateResult<i64> {
        match self.binding {
            // atomic word, no lock needed
            Binding::Slot(offset) => Ok(self.shared.heartbeat_word(offset)?.load(Ordering::Acquire)),
            Binding::ByName => {
                let guard = self.shared.lock()?;
                let ms = self.resolve_or_err(&guard)?.heartbeat_ms();
                Ok(ms)
            }
        }
    }

    /// Time of the last heartbeat
    pub fn heartbeat(&self) -> ProcStateResult<SystemTime> {
        self.heartbeat_ms().map(ms_to_system_time)
    }

    pub fn heartbeat_age(&self) -> ProcStateResult<Duration> {
        self.heartbeat_ms().map(age_of)
    }

    /// Refresh the heartbeat without touching any parameter
    pub fn touch(&self) -> ProcStateResult<()> {
        self.shared.ensure_writable("touch")?;
        match self.binding {
            Binding::Slot(offset) => {
                self.shared
                    .heartbeat_word(offset)?
                    .store(now_ms(), Ordering::Release);
                Ok(())
            }
            Binding::ByName => {
                let guard = self.shared.lock()?;
                self.resolve_or_err(&guard)?.set_heartbeat_ms(now_ms());
                Ok(())
            }
        }
    }

    /// Registration time of the process
    pub fn start_time(&self) -> ProcStateResult<SystemTime> {
        let guard = self.shared.lock()?;
        let ms = self.resolve_or_err(&guard)?.start_time_ms();
        Ok(ms_to_system_time(ms))
    }

    pub fn pid(&self) -> ProcStateResult<i32> {
        let guard = self.shared.lock()?;
        let pid = self.resolve_or_err(&guard)?.pid();
        Ok(pid)
    }

    pub fn flags(&self) -> ProcStateResult<i32> {
        let guard = self.shared.lock()?;
        let flags = self.resolve_or_err(&guard)?.flags();
        Ok(flags)
    }

    pub fn set_flags(&self, flags: i32) -> ProcStateResult<()> {
        self.shared.ensure_writable("set_flags")?;
        let guard = self.shared.lock()?;
        let psd = self.resolve_or_err(&guard)?;
        psd.set_flags(flags);
        psd.set_heartbeat_ms(now_ms());
        Ok(())
    }

    /// Release the descriptor block and its parameters on clean shutdown.
    ///
    /// A process that exits without this leaves its entry for the next
    /// registration under the same name to recycle.
    pub fn unregister(self) -> ProcStateResult<()> {
        self.shared.ensure_writable("unregister")?;
        let offset = {
            let guard = self.shared.lock()?;
            let psd = self.resolve_or_err(&guard)?;
            let released = guard.clear_chain(psd)?;
            psd.clear();
            log::info!("unregistered '{}', released {} parameters", self.name, released);
            psd.offset()
        };
        self.shared.forget_own(offset);
        Ok(())
    }

    /// Store a serializable value under `key`.
    pub fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> ProcStateResult<()> {
        self.set_parameter(key, &value::encode(key, value)?)
    }

    /// Read and decode `key`.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> ProcStateResult<Option<T>> {
        self.get_parameter(key)?
            .map(|bytes| value::decode(&bytes))
            .transpose()
    }

    /// Typed [`get_and_set_parameter_atomic`](Self::get_and_set_parameter_atomic).
    pub fn get_and_set<T: Serialize + DeserializeOwned>(
        &self,
        key: &str,
        value: &T,
    ) -> ProcStateResult<Option<T>> {
        let bytes = value::encode(key, value)?;
        self.get_and_set_parameter_atomic(key, &bytes)?
            .map(|old| value::decode(&old))
            .transpose()
    }
}

impl std::fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let offset = match self.binding {
            Binding::Slot(offset) => offset,
            Binding::ByName => NO_OFFSET,
        };
        f.debug_struct("ProcessHandle")
            .field("name", &self.name)
            .field("offset", &offset)
            .finish()
    }
}
