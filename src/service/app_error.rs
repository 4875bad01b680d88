// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::io::{self, ErrorKind};

pub type AppResult<T> = Result<T, AppError>;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    /// connection errors
    #[error("connection error: {0}")]
    ConnectionError(String),

    #[error("connection reset by peer: {0}")]
    ConnectionResetByPeer(String),

    #[error("connection shutdown: {0}")]
    ConnectionShutdown(String),

    #[error("system error in {call}: {}", describe_os_error(.code))]
    SystemError { call: &'static str, code: i32 },

    #[error("address resolution error: {0}")]
    AddressResolution(String),

    /// general errors
    #[error("illegal state: {0}")]
    IllegalState(String),

    #[error("malformed protocol: {0}")]
    MalformedProtocol(String),

    #[error("invalid value: {0}")]
    InvalidValue(String),

    #[error("io error: {0}")]
    IoError(#[from] io::Error),

    #[error("config file error: {0}")]
    ConfigFileError(#[from] config::ConfigError),

    #[error("tracing setup error: {0}")]
    TracingError(String),
}

impl AppError {
    /// Maps a failed system call onto the connection error taxonomy.
    ///
    /// Callers must have already folded `WouldBlock` and `Interrupted` into their
    /// own no-progress result; those never reach here.
    pub fn from_io(call: &'static str, err: io::Error) -> AppError {
        match err.kind() {
            ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted => {
                AppError::ConnectionResetByPeer(format!("{} error", call))
            }
            ErrorKind::BrokenPipe => AppError::ConnectionShutdown(format!("{} shutdown", call)),
            _ => match err.raw_os_error() {
                Some(code) => AppError::SystemError { call, code },
                None => AppError::IoError(err),
            },
        }
    }

    /// The last OS error of the calling thread, classified for `call`.
    pub fn last_os_error(call: &'static str) -> AppError {
        AppError::from_io(call, io::Error::last_os_error())
    }

    /// True when the peer went away, orderly or not.
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            AppError::ConnectionResetByPeer(_) | AppError::ConnectionShutdown(_)
        )
    }

    pub fn os_code(&self) -> Option<i32> {
        match self {
            AppError::SystemError { code, .. } => Some(*code),
            AppError::IoError(err) => err.raw_os_error(),
            _ => None,
        }
    }
}

fn describe_os_error(code: &i32) -> String {
    io::Error::from_raw_os_error(*code).to_string()
}

/// Treats `WouldBlock` and `Interrupted` as "no progress this time".
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(err.kind(), ErrorKind::WouldBlock | ErrorKind::Interrupted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reset_is_classified_as_reset_by_peer() {
        let err = AppError::from_io("recv", io::Error::from_raw_os_error(libc::ECONNRESET));
        assert!(matches!(err, AppError::ConnectionResetByPeer(_)));
        assert!(err.is_disconnect());
    }

    #[test]
    fn test_broken_pipe_is_classified_as_shutdown() {
        let err = AppError::from_io("send", io::Error::from_raw_os_error(libc::EPIPE));
        assert!(matches!(err, AppError::ConnectionShutdown(_)));
    }

    #[test]
    fn test_other_failures_keep_call_and_code() {
        let err = AppError::from_io("bind", io::Error::from_raw_os_error(libc::EADDRINUSE));
        match err {
            AppError::SystemError { call, code } => {
                assert_eq!(call, "bind");
                assert_eq!(code, libc::EADDRINUSE);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!AppError::from_io("bind", io::Error::from_raw_os_error(libc::EADDRINUSE))
            .is_disconnect());
    }

    #[test]
    fn test_transient_errors() {
        assert!(is_transient(&io::Error::from(ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(ErrorKind::ConnectionReset)));
    }
}
