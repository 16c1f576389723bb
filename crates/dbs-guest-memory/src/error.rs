// Copyright (C) 2023 Alibaba Cloud. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

use dbs_hypercall::{ErrorClass, HypError};

use crate::rm::RmError;

/// Errors associated with guest memory management.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Malformed request.
    #[error("invalid argument")]
    InvalidArgument,

    /// Misaligned, empty or out of bounds range.
    #[error("invalid memory range")]
    InvalidRange,

    /// The request overlaps an existing binding or donation.
    #[error("range conflicts with an existing binding or donation")]
    Conflict,

    /// Access flags forbid the operation.
    #[error("permission denied")]
    PermissionDenied,

    /// No binding, donation or parcel found for the request.
    #[error("no such binding or donation")]
    NotFound,

    /// A memory extent capability has not been assigned to the VM.
    #[error("memory extent capability missing")]
    NoDevice,

    /// Failed to allocate memory.
    #[error("out of memory")]
    ResourceExhausted,

    /// The hypervisor or resource manager is busy.
    #[error("resource busy")]
    Busy,

    /// Transient state, the request may be reissued.
    #[error("try again")]
    Retry,

    /// Unsupported mode or operation.
    #[error("operation not supported")]
    Unsupported,

    /// The operation was cancelled before completion.
    #[error("interrupted")]
    Interrupted,

    /// The hypervisor or resource manager returned a status which can't be classified.
    #[error("protocol failure, status {0}")]
    ProtocolFailure(i64),
}

impl Error {
    /// Get the Linux errno reported for the error.
    pub fn errno(&self) -> i32 {
        match self {
            Error::InvalidArgument | Error::InvalidRange => libc::EINVAL,
            Error::Conflict => libc::EEXIST,
            Error::PermissionDenied => libc::EACCES,
            Error::NotFound => libc::ENOENT,
            Error::NoDevice => libc::ENODEV,
            Error::ResourceExhausted => libc::ENOMEM,
            Error::Busy => libc::EBUSY,
            Error::Retry => libc::EAGAIN,
            Error::Unsupported => libc::EOPNOTSUPP,
            Error::Interrupted => libc::EINTR,
            Error::ProtocolFailure(_) => libc::EIO,
        }
    }
}

impl From<HypError> for Error {
    fn from(e: HypError) -> Self {
        match e.remap() {
            ErrorClass::InvalidArgument => Error::InvalidArgument,
            ErrorClass::ResourceExhausted => Error::ResourceExhausted,
            ErrorClass::PermissionDenied => Error::PermissionDenied,
            ErrorClass::Busy => Error::Busy,
            ErrorClass::Retry => Error::Retry,
            ErrorClass::Unsupported => Error::Unsupported,
            ErrorClass::ProtocolFailure => Error::ProtocolFailure(e.raw()),
        }
    }
}

impl From<RmError> for Error {
    fn from(e: RmError) -> Self {
        match e {
            RmError::Busy => Error::Busy,
            RmError::Retry => Error::Retry,
            RmError::Denied => Error::PermissionDenied,
            RmError::NoMemory => Error::ResourceExhausted,
            RmError::InvalidHandle => Error::InvalidArgument,
            RmError::Other(code) => Error::ProtocolFailure(code as i64),
        }
    }
}

/// Specialized std::result::Result for guest memory operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno() {
        assert_eq!(Error::InvalidRange.errno(), libc::EINVAL);
        assert_eq!(Error::Conflict.errno(), libc::EEXIST);
        assert_eq!(Error::NoDevice.errno(), libc::ENODEV);
        assert_eq!(Error::Retry.errno(), libc::EAGAIN);
        assert_eq!(Error::Interrupted.errno(), libc::EINTR);
        assert_eq!(Error::ProtocolFailure(7).errno(), libc::EIO);
    }

    #[test]
    fn test_hyp_error_remap() {
        assert_eq!(Error::from(HypError::NoMem), Error::ResourceExhausted);
        assert_eq!(Error::from(HypError::Denied), Error::PermissionDenied);
        assert_eq!(
            Error::from(HypError::CapInsufRights),
            Error::PermissionDenied
        );
        assert_eq!(Error::from(HypError::CapSpaceFull), Error::Busy);
        assert_eq!(Error::from(HypError::Retry), Error::Retry);
        assert_eq!(Error::from(HypError::Unimplemented), Error::Unsupported);
        assert_eq!(Error::from(HypError::ArgAlign), Error::InvalidArgument);
        assert_eq!(
            Error::from(HypError::MsgQueueEmpty),
            Error::ProtocolFailure(60)
        );
        assert_eq!(Error::from(HypError::MsgQueueEmpty).errno(), libc::EIO);
    }

    #[test]
    fn test_rm_error_remap() {
        assert_eq!(Error::from(RmError::Busy), Error::Busy);
        assert_eq!(Error::from(RmError::Denied), Error::PermissionDenied);
        assert_eq!(Error::from(RmError::NoMemory).errno(), libc::ENOMEM);
        assert_eq!(Error::from(RmError::Other(3)), Error::ProtocolFailure(3));
    }
}
