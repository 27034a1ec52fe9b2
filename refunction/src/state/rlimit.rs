use std::{mem::MaybeUninit, ptr};

use refunction_common::{
    anyhow::{Context, Result},
    libc,
    nix::{errno::Errno, unistd::Pid},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limit {
    pub soft: u64,
    pub hard: u64,
}

/// The limits that bound how far the traced process may grow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    pub address_space: Limit,
    pub data: Limit,
    pub stack: Limit,
}

pub(crate) fn read_rlimits(pid: Pid) -> Result<ResourceLimits> {
    let read = |resource, name: &str| -> Result<Limit> {
        let mut limit = MaybeUninit::<libc::rlimit>::uninit();
        let res = unsafe { libc::prlimit(pid.as_raw(), resource, ptr::null(), limit.as_mut_ptr()) };
        Errno::result(res).with_context(|| format!("could not read {name} of {pid}"))?;
        let limit = unsafe { limit.assume_init() };
        Ok(Limit {
            soft: limit.rlim_cur,
            hard: limit.rlim_max,
        })
    };

    Ok(ResourceLimits {
        address_space: read(libc::RLIMIT_AS, "RLIMIT_AS")?,
        data: read(libc::RLIMIT_DATA, "RLIMIT_DATA")?,
        stack: read(libc::RLIMIT_STACK, "RLIMIT_STACK")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_own_rlimits() {
        let limits = read_rlimits(Pid::this()).unwrap();

        let mut stack = MaybeUninit::<libc::rlimit>::uninit();
        assert_eq!(unsafe { libc::getrlimit(libc::RLIMIT_STACK, stack.as_mut_ptr()) }, 0);
        let stack = unsafe { stack.assume_init() };

        assert_eq!(limits.stack.soft, stack.rlim_cur);
        assert_eq!(limits.stack.hard, stack.rlim_max);
        assert!(limits.address_space.soft <= limits.address_space.hard);
    }
}
