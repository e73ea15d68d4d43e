//! Binary layout of the registry payload
//!
//! ```text
//! payload (offsets relative to the payload start)
//! +--------------+---------------------------+-------------------------------+
//! | ControlBlock | PsdBlock x max_psd_blocks | ParamBlock x max_param_blocks |
//! +--------------+---------------------------+-------------------------------+
//! 0              start_psd                   start_param
//! ```
//!
//! Blocks reference each other by payload offset only, never by address,
//! because every process maps the segment at a different address. The
//! records are `repr(C)` with explicit padding so every build agrees on them.

use crate::error::{ProcStateError, ProcStateResult};
use bytemuck::{Pod, Zeroable};
use std::marker::PhantomData;
use std::mem;
use std::ptr::addr_of_mut;
use std::sync::atomic::{AtomicI64, Ordering};

/// Longest process name in bytes
pub const MAX_PROCESS_NAME: usize = 50;
/// Longest parameter name in bytes
pub const MAX_PARAM_NAME: usize = 100;
/// Longest parameter value in bytes
pub const MAX_PARAM_LENGTH: usize = 200;
/// Chain terminator / "no parameters yet"
pub const NO_OFFSET: i32 = -1;

/// Written once by the creator of the segment
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ControlBlock {
    pub start_psd: i32,
    pub start_param: i32,
    pub max_psd_blocks: i32,
    pub max_param_blocks: i32,
}

/// Process descriptor block
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct PsdBlock {
    pub used: u8,
    pub name: [u8; MAX_PROCESS_NAME + 1],
    pub pid: i32,
    pub flags: i32,
    pub _pad: [u8; 4],
    /// Registration time, ms since the Unix epoch
    pub start_time_ms: i64,
    /// Only accessed atomically, see [`PsdRef::heartbeat`]
    pub last_heartbeat_ms: i64,
    pub first_parameter: i32,
    pub last_parameter: i32,
}

/// Parameter block, one link of a per-process chain
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct ParamBlock {
    pub used: u8,
    pub name: [u8; MAX_PARAM_NAME + 1],
    pub value: [u8; MAX_PARAM_LENGTH],
    pub _pad: [u8; 2],
    pub value_len: i32,
    pub next_parameter: i32,
}

const _: () = assert!(mem::size_of::<ControlBlock>() == 16);
const _: () = assert!(mem::size_of::<PsdBlock>() == 88);
const _: () = assert!(mem::offset_of!(PsdBlock, last_heartbeat_ms) % 8 == 0);
const _: () = assert!(mem::size_of::<ParamBlock>() == 312);
const _: () = assert!(mem::size_of::<PsdBlock>() % 8 == 0 && mem::size_of::<ParamBlock>() % 8 == 0);

pub const CONTROL_BLOCK_SIZE: usize = mem::size_of::<ControlBlock>();
pub const PSD_BLOCK_SIZE: usize = mem::size_of::<PsdBlock>();
pub const PARAM_BLOCK_SIZE: usize = mem::size_of::<ParamBlock>();

/// Payload partitioning shared by all attachers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub start_psd: usize,
    pub start_param: usize,
    pub max_psd_blocks: usize,
    pub max_param_blocks: usize,
}

impl Layout {
    /// Partition `size` payload bytes. Without an explicit `max_param_blocks`
    /// all space behind the psd array goes to parameter blocks.
    pub fn compute(
        size: usize,
        max_psd_blocks: usize,
        max_param_blocks: Option<usize>,
    ) -> ProcStateResult<Self> {
        let start_psd = CONTROL_BLOCK_SIZE;
        let start_param = start_psd + max_psd_blocks * PSD_BLOCK_SIZE;
        if start_param >= size {
            return Err(ProcStateError::Config(format!(
                "invalid SHM configuration: {} psd blocks need {} bytes, segment has {}",
                max_psd_blocks, start_param, size
            )));
        }

        let fitting = (size - start_param) / PARAM_BLOCK_SIZE;
        let max_param_blocks = match max_param_blocks {
            Some(n) if n > fitting => {
                return Err(ProcStateError::Config(format!(
                    "{} param blocks requested but only {} fit into {} bytes",
                    n, fitting, size
                )))
            }
            Some(n) => n,
            None => fitting,
        };
        if max_param_blocks == 0 {
            return Err(ProcStateError::Config(format!(
                "invalid SHM configuration: no room for parameter blocks in {} bytes",
                size
            )));
        }

        Ok(Self {
            start_psd,
            start_param,
            max_psd_blocks,
            max_param_blocks,
        })
    }

    /// Rebuild from a control block found in shared memory.
    pub fn from_control(control: &ControlBlock, size: usize) -> ProcStateResult<Self> {
        let field = |v: i32, what: &str| {
            usize::try_from(v).map_err(|_| {
                ProcStateError::Corrupted(format!("negative {} in control block: {}", what, v))
            })
        };
        let layout = Self {
            start_psd: field(control.start_psd, "start_psd")?,
            start_param: field(control.start_param, "start_param")?,
            max_psd_blocks: field(control.max_psd_blocks, "max_psd_blocks")?,
            max_param_blocks: field(control.max_param_blocks, "max_param_blocks")?,
        };

        let psd_end = layout.start_psd + layout.max_psd_blocks * PSD_BLOCK_SIZE;
        let param_end = layout.start_param + layout.max_param_blocks * PARAM_BLOCK_SIZE;
        if layout.start_psd < CONTROL_BLOCK_SIZE
            || layout.start_psd % 8 != 0
            || psd_end > layout.start_param
            || param_end > size
        {
            return Err(ProcStateError::Corrupted(format!(
                "control block {:?} does not fit a {} byte segment",
                control, size
            )));
        }
        Ok(layout)
    }

    pub fn to_control(&self) -> ControlBlock {
        ControlBlock {
            start_psd: self.start_psd as i32,
            start_param: self.start_param as i32,
            max_psd_blocks: self.max_psd_blocks as i32,
            max_param_blocks: self.max_param_blocks as i32,
        }
    }

    pub fn psd_offset(&self, index: usize) -> i32 {
        (self.start_psd + index * PSD_BLOCK_SIZE) as i32
    }

    pub fn param_offset(&self, index: usize) -> i32 {
        (self.start_param + index * PARAM_BLOCK_SIZE) as i32
    }

    /// Index of the psd block at `offset`, if it is one
    pub fn psd_index(&self, offset: i32) -> Option<usize> {
        let rel = usize::try_from(offset).ok()?.checked_sub(self.start_psd)?;
        (rel % PSD_BLOCK_SIZE == 0 && rel / PSD_BLOCK_SIZE < self.max_psd_blocks)
            .then_some(rel / PSD_BLOCK_SIZE)
    }

    /// Index of the param block at `offset`, if it is one
    pub fn param_index(&self, offset: i32) -> Option<usize> {
        let rel = usize::try_from(offset).ok()?.checked_sub(self.start_param)?;
        (rel % PARAM_BLOCK_SIZE == 0 && rel / PARAM_BLOCK_SIZE < self.max_param_blocks)
            .then_some(rel / PARAM_BLOCK_SIZE)
    }
}

/// Copy `name` into a NUL-terminated fixed field.
fn write_name<const N: usize>(field: &mut [u8; N], name: &str) {
    let bytes = name.as_bytes();
    let len = bytes.len().min(N - 1);
    field.fill(0);
    field[..len].copy_from_slice(&bytes[..len]);
}

fn read_name(field: &[u8]) -> String {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

fn name_matches(field: &[u8], name: &str) -> bool {
    let end = field.iter().position(|b| *b == 0).unwrap_or(field.len());
    &field[..end] == name.as_bytes()
}

/// Reject names that would not fit a fixed field.
pub fn check_name(kind: &str, name: &str, max: usize) -> ProcStateResult<()> {
    if name.is_empty() {
        return Err(ProcStateError::InvalidInput(format!("{} name must not be empty", kind)));
    }
    if name.len() > max {
        return Err(ProcStateError::InvalidInput(format!(
            "{} name '{}' is {} bytes, limit is {}",
            kind,
            name,
            name.len(),
            max
        )));
    }
    if name.as_bytes().contains(&0) {
        return Err(ProcStateError::InvalidInput(format!(
            "{} name contains a NUL byte",
            kind
        )));
    }
    Ok(())
}

/// Psd block view. Only handed out while the segment lock is held,
/// except for the heartbeat which is atomic.
#[derive(Clone, Copy)]
pub struct PsdRef<'a> {
    ptr: *mut PsdBlock,
    offset: i32,
    _lock: PhantomData<&'a ()>,
}

impl<'a> PsdRef<'a> {
    /// # Safety
    /// `ptr` must point to a psd block inside an attached segment that
    /// outlives `'a`; non-atomic fields may only be accessed under the lock.
    pub(crate) unsafe fn new(ptr: *mut PsdBlock, offset: i32) -> Self {
        Self {
            ptr,
            offset,
            _lock: PhantomData,
        }
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    // SAFETY (all accessors): ptr is valid per the constructor contract and
    // field places are read/written without creating references

    pub fn used(&self) -> bool {
        unsafe { (*self.ptr).used != 0 }
    }

    pub fn set_used(&self, used: bool) {
        unsafe { (*self.ptr).used = used as u8 }
    }

    pub fn name(&self) -> String {
        read_name(&unsafe { (*self.ptr).name })
    }

    pub fn name_is(&self, name: &str) -> bool {
        name_matches(&unsafe { (*self.ptr).name }, name)
    }

    pub fn set_name(&self, name: &str) {
        let mut field = [0u8; MAX_PROCESS_NAME + 1];
        write_name(&mut field, name);
        unsafe { (*self.ptr).name = field }
    }

    pub fn pid(&self) -> i32 {
        unsafe { (*self.ptr).pid }
    }

    pub fn set_pid(&self, pid: i32) {
        unsafe { (*self.ptr).pid = pid }
    }

    pub fn flags(&self) -> i32 {
        unsafe { (*self.ptr).flags }
    }

    pub fn set_flags(&self, flags: i32) {
        unsafe { (*self.ptr).flags = flags }
    }

    pub fn start_time_ms(&self) -> i64 {
        unsafe { (*self.ptr).start_time_ms }
    }

    pub fn set_start_time_ms(&self, ms: i64) {
        unsafe { (*self.ptr).start_time_ms = ms }
    }

    pub fn first_parameter(&self) -> i32 {
        unsafe { (*self.ptr).first_parameter }
    }

    pub fn set_first_parameter(&self, offset: i32) {
        unsafe { (*self.ptr).first_parameter = offset }
    }

    pub fn last_parameter(&self) -> i32 {
        unsafe { (*self.ptr).last_parameter }
    }

    pub fn set_last_parameter(&self, offset: i32) {
        unsafe { (*self.ptr).last_parameter = offset }
    }

    /// Heartbeat word, readable and writable without the lock
    pub fn heartbeat(&self) -> &'a AtomicI64 {
        // SAFETY: the field is 8-aligned (asserted above, blocks start 8-aligned)
        // and only ever accessed atomically
        unsafe { AtomicI64::from_ptr(addr_of_mut!((*self.ptr).last_heartbeat_ms)) }
    }

    pub fn heartbeat_ms(&self) -> i64 {
        self.heartbeat().load(Ordering::Acquire)
    }

    pub fn set_heartbeat_ms(&self, ms: i64) {
        self.heartbeat().store(ms, Ordering::Release)
    }

    /// Reset to an unused, empty block
    pub fn clear(&self) {
        self.set_used(false);
        self.set_name("");
        self.set_pid(0);
        self.set_flags(0);
        self.set_start_time_ms(0);
        self.set_heartbeat_ms(0);
        self.set_first_parameter(NO_OFFSET);
        self.set_last_parameter(NO_OFFSET);
    }
}

/// Param block view, only handed out while the segment lock is held
#[derive(Clone, Copy)]
pub struct ParamRef<'a> {
    ptr: *mut ParamBlock,
    offset: i32,
    _lock: PhantomData<&'a ()>,
}

impl<'a> ParamRef<'a> {
    /// # Safety
    /// `ptr` must point to a param block inside an attached segment that
    /// outlives `'a`, and the segment lock must be held while it is used.
    pub(crate) unsafe fn new(ptr: *mut ParamBlock, offset: i32) -> Self {
        Self {
            ptr,
            offset,
            _lock: PhantomData,
        }
    }

    pub fn offset(&self) -> i32 {
        self.offset
    }

    // SAFETY (all accessors): see PsdRef

    pub fn used(&self) -> bool {
        unsafe { (*self.ptr).used != 0 }
    }

    pub fn set_used(&self, used: bool) {
        unsafe { (*self.ptr).used = used as u8 }
    }

    pub fn name(&self) -> String {
        read_name(&unsafe { (*self.ptr).name })
    }

    pub fn name_is(&self, name: &str) -> bool {
        name_matches(&unsafe { (*self.ptr).name }, name)
    }

    pub fn set_name(&self, name: &str) {
        let mut field = [0u8; MAX_PARAM_NAME + 1];
        write_name(&mut field, name);
        unsafe { (*self.ptr).name = field }
    }

    pub fn value(&self) -> ProcStateResult<Vec<u8>> {
        let len = unsafe { (*self.ptr).value_len };
        let len = usize::try_from(len)
            .ok()
            .filter(|l| *l <= MAX_PARAM_LENGTH)
            .ok_or_else(|| {
                ProcStateError::Corrupted(format!(
                    "parameter block {} has value length {}",
                    self.offset, len
                ))
            })?;
        let value = unsafe { (*self.ptr).value };
        Ok(value[..len].to_vec())
    }

    /// Store `value`, which the caller has checked against [`MAX_PARAM_LENGTH`].
    pub fn set_value(&self, value: &[u8]) {
        debug_assert!(value.len() <= MAX_PARAM_LENGTH);
        let len = value.len().min(MAX_PARAM_LENGTH);
        let mut field = [0u8; MAX_PARAM_LENGTH];
        field[..len].copy_from_slice(&value[..len]);
        unsafe {
            (*self.ptr).value = field;
            (*self.ptr).value_len = len as i32;
        }
    }

    pub fn next_parameter(&self) -> i32 {
        unsafe { (*self.ptr).next_parameter }
    }

    pub fn set_next_parameter(&self, offset: i32) {
        unsafe { (*self.ptr).next_parameter = offset }
    }

    /// Reset to an unused, empty block
    pub fn clear(&self) {
        self.set_used(false);
        self.set_name("");
        self.set_value(&[]);
        self.set_next_parameter(NO_OFFSET);
    }
}
