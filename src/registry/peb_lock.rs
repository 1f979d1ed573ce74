//! Scoped acquisition of the foreign process's PEB lock.

use crate::{
    process::{FunctionId, ProcessContext},
    stub::CallingConvention,
    Result,
};

/// Holds the foreign PEB lock for the lifetime of the guard.
///
/// Acquisition runs `RtlAcquirePebLock` in the foreign process; dropping the guard
/// runs `RtlReleasePebLock`. A failed release cannot be reported from `Drop` and is
/// logged instead.
pub(crate) struct PebLockGuard<'a> {
    context: &'a ProcessContext,
    release_routine: u64,
}

impl<'a> PebLockGuard<'a> {
    /// Acquires the lock.
    ///
    /// # Errors
    ///
    /// Returns an error when either routine cannot be resolved or the acquire call
    /// fails. Nothing is held on error.
    pub(crate) fn acquire(context: &'a ProcessContext) -> Result<PebLockGuard<'a>> {
        let acquire_routine =
            context.get_function_address("ntdll.dll", FunctionId::Name("RtlAcquirePebLock"))?;
        let release_routine =
            context.get_function_address("ntdll.dll", FunctionId::Name("RtlReleasePebLock"))?;

        context.call_routine(CallingConvention::StdCall, acquire_routine, &[])?;

        Ok(PebLockGuard {
            context,
            release_routine,
        })
    }
}

impl Drop for PebLockGuard<'_> {
    fn drop(&mut self) {
        if let Err(error) =
            self.context
                .call_routine(CallingConvention::StdCall, self.release_routine, &[])
        {
            log::warn!("Failed to release the foreign PEB lock: {error}");
        }
    }
}
