use std::ffi::c_int;

use thiserror::Error;
use tether_gc::RootsError;

/// Result handed to host code by every operation and every event callback.
pub type LoopResult<T> = Result<T, ErrorCode>;

macro_rules! error_codes {
    ($( $name:ident = $native:expr, $message:literal; )*) => {
        /// Status codes a native loop can report, plus `ECHARSET`, which is
        /// only ever produced by argument validation.
        #[allow(non_camel_case_types, clippy::upper_case_acronyms)]
        #[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum ErrorCode {
            $(
                #[error($message)]
                $name,
            )*
        }

        impl ErrorCode {
            /// Every code, in declaration order.
            pub const ALL: &'static [ErrorCode] = &[$(ErrorCode::$name,)*];

            /// The (negative) status the native loop uses for this code.
            pub fn native(self) -> c_int {
                match self {
                    $(ErrorCode::$name => $native,)*
                }
            }

            /// Symbolic name, e.g. `"ENOENT"`.
            pub fn name(self) -> &'static str {
                match self {
                    $(ErrorCode::$name => stringify!($name),)*
                }
            }

            /// Maps a native status to its code. Statuses outside the table
            /// become [`ErrorCode::UNKNOWN`].
            pub fn from_native(status: c_int) -> ErrorCode {
                $(
                    if status == $native {
                        return ErrorCode::$name;
                    }
                )*
                log::debug!("Unmapped native status {} reported as UNKNOWN.", status);
                ErrorCode::UNKNOWN
            }
        }
    };
}

error_codes! {
    E2BIG = -libc::E2BIG, "argument list too long";
    EACCES = -libc::EACCES, "permission denied";
    EADDRINUSE = -libc::EADDRINUSE, "address already in use";
    EADDRNOTAVAIL = -libc::EADDRNOTAVAIL, "address not available";
    EAFNOSUPPORT = -libc::EAFNOSUPPORT, "address family not supported";
    EAGAIN = -libc::EAGAIN, "resource temporarily unavailable";
    EAI_ADDRFAMILY = -3000, "address family not supported";
    EAI_AGAIN = -3001, "temporary failure";
    EAI_BADFLAGS = -3002, "bad ai_flags value";
    EAI_CANCELED = -3003, "request canceled";
    EAI_FAIL = -3004, "permanent failure";
    EAI_FAMILY = -3005, "ai_family not supported";
    EAI_MEMORY = -3006, "out of memory";
    EAI_NODATA = -3007, "no address";
    EAI_NONAME = -3008, "unknown node or service";
    EAI_OVERFLOW = -3009, "argument buffer overflow";
    EAI_SERVICE = -3010, "service not available for socket type";
    EAI_SOCKTYPE = -3011, "socket type not supported";
    EAI_BADHINTS = -3013, "invalid value for hints";
    EAI_PROTOCOL = -3014, "resolved protocol is unknown";
    EALREADY = -libc::EALREADY, "connection already in progress";
    EBADF = -libc::EBADF, "bad file descriptor";
    EBUSY = -libc::EBUSY, "resource busy or locked";
    ECANCELED = -libc::ECANCELED, "operation canceled";
    ECHARSET = -4080, "invalid Unicode character";
    ECONNABORTED = -libc::ECONNABORTED, "software caused connection abort";
    ECONNREFUSED = -libc::ECONNREFUSED, "connection refused";
    ECONNRESET = -libc::ECONNRESET, "connection reset by peer";
    EDESTADDRREQ = -libc::EDESTADDRREQ, "destination address required";
    EEXIST = -libc::EEXIST, "file already exists";
    EFAULT = -libc::EFAULT, "bad address in system call argument";
    EFBIG = -libc::EFBIG, "file too large";
    EHOSTDOWN = -libc::EHOSTDOWN, "host is down";
    EHOSTUNREACH = -libc::EHOSTUNREACH, "host is unreachable";
    EILSEQ = -libc::EILSEQ, "illegal byte sequence";
    EINTR = -libc::EINTR, "interrupted system call";
    EINVAL = -libc::EINVAL, "invalid argument";
    EIO = -libc::EIO, "i/o error";
    EISCONN = -libc::EISCONN, "socket is already connected";
    EISDIR = -libc::EISDIR, "illegal operation on a directory";
    ELOOP = -libc::ELOOP, "too many symbolic links encountered";
    EMFILE = -libc::EMFILE, "too many open files";
    EMLINK = -libc::EMLINK, "too many links";
    EMSGSIZE = -libc::EMSGSIZE, "message too long";
    ENAMETOOLONG = -libc::ENAMETOOLONG, "name too long";
    ENETDOWN = -libc::ENETDOWN, "network is down";
    ENETUNREACH = -libc::ENETUNREACH, "network is unreachable";
    ENFILE = -libc::ENFILE, "file table overflow";
    ENOBUFS = -libc::ENOBUFS, "no buffer space available";
    ENODEV = -libc::ENODEV, "no such device";
    ENOENT = -libc::ENOENT, "no such file or directory";
    ENOMEM = -libc::ENOMEM, "not enough memory";
    ENOPROTOOPT = -libc::ENOPROTOOPT, "protocol not available";
    ENOSPC = -libc::ENOSPC, "no space left on device";
    ENOSYS = -libc::ENOSYS, "function not implemented";
    ENOTCONN = -libc::ENOTCONN, "socket is not connected";
    ENOTDIR = -libc::ENOTDIR, "not a directory";
    ENOTEMPTY = -libc::ENOTEMPTY, "directory not empty";
    ENOTSOCK = -libc::ENOTSOCK, "socket operation on non-socket";
    ENOTSUP = -libc::ENOTSUP, "operation not supported on socket";
    ENOTTY = -libc::ENOTTY, "inappropriate ioctl for device";
    ENXIO = -libc::ENXIO, "no such device or address";
    EOF = -4095, "end of file";
    EPERM = -libc::EPERM, "operation not permitted";
    EPIPE = -libc::EPIPE, "broken pipe";
    EPROTO = -libc::EPROTO, "protocol error";
    EPROTONOSUPPORT = -libc::EPROTONOSUPPORT, "protocol not supported";
    EPROTOTYPE = -libc::EPROTOTYPE, "protocol wrong type for socket";
    ERANGE = -libc::ERANGE, "result too large";
    EROFS = -libc::EROFS, "read-only file system";
    ESHUTDOWN = -libc::ESHUTDOWN, "cannot send after transport endpoint shutdown";
    ESPIPE = -libc::ESPIPE, "invalid seek";
    ESRCH = -libc::ESRCH, "no such process";
    ETIMEDOUT = -libc::ETIMEDOUT, "connection timed out";
    ETXTBSY = -libc::ETXTBSY, "text file is busy";
    EXDEV = -libc::EXDEV, "cross-device link not permitted";
    UNKNOWN = -4094, "unknown error";
}

impl From<RootsError> for ErrorCode {
    fn from(err: RootsError) -> Self {
        match err {
            RootsError::Exhausted { .. } => ErrorCode::ENOMEM,
            RootsError::StaleSlot(_) => ErrorCode::EBADF,
            RootsError::TypeMismatch { .. } => ErrorCode::EINVAL,
        }
    }
}

/// Builds a result from a native status. `payload` only runs on success.
pub fn translate<T>(status: c_int, payload: impl FnOnce() -> T) -> LoopResult<T> {
    if status < 0 {
        Err(ErrorCode::from_native(status))
    } else {
        Ok(payload())
    }
}

pub fn unit_result(status: c_int) -> LoopResult<()> {
    translate(status, || ())
}

/// Failure raised by a host callback. Delivered to the loop's exception
/// hook; the handle whose callback failed is closed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HostError {
    #[error("Host callback raised: {0}")]
    Raised(String),

    #[error("Host callback panicked: {0}")]
    Panicked(String),
}

impl HostError {
    pub fn raised(message: impl Into<String>) -> Self {
        HostError::Raised(message.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn every_code_round_trips() {
        for &code in ErrorCode::ALL {
            assert_eq!(ErrorCode::from_native(code.native()), code, "{}", code.name());
        }
    }

    #[test]
    fn native_values_are_distinct_and_negative() {
        let mut seen = HashSet::new();
        for &code in ErrorCode::ALL {
            assert!(code.native() < 0, "{} is not negative", code.name());
            assert!(seen.insert(code.native()), "{} shares its value", code.name());
        }
    }

    #[test]
    fn unmapped_status_is_unknown() {
        assert_eq!(ErrorCode::from_native(-99_999), ErrorCode::UNKNOWN);
    }

    #[test]
    fn translate_skips_payload_on_error() {
        let mut built = false;
        let result = translate(-libc::ENOENT, || {
            built = true;
            1
        });
        assert_eq!(result, Err(ErrorCode::ENOENT));
        assert!(!built);

        assert_eq!(translate(0, || "ok"), Ok("ok"));
        assert_eq!(unit_result(3), Ok(()));
    }

    #[test]
    fn names_and_messages() {
        assert_eq!(ErrorCode::ENOENT.name(), "ENOENT");
        assert_eq!(ErrorCode::EAI_AGAIN.name(), "EAI_AGAIN");
        assert_eq!(ErrorCode::ECHARSET.to_string(), "invalid Unicode character");
    }

    #[test]
    fn registry_errors_map_to_codes() {
        assert_eq!(
            ErrorCode::from(RootsError::Exhausted { limit: 2 }),
            ErrorCode::ENOMEM
        );
    }
}
