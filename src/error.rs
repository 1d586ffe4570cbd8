//
// Copyright 2018 yvt, all rights reserved.
//
// This source code is a part of Nightingales.
//
//! Error types reported by the dispatcher.
use std::error;
use std::fmt;

/// Categories of errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The operation was supplied parameters that violate its usage
    /// contract.
    InvalidUsage,

    /// Other errors, e.g. ones reported by the operating system.
    Other,
}

/// The error type used by the dispatcher.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    error: Option<Box<dyn error::Error + Send + Sync>>,
}

impl Error {
    /// Construct an `Error` from an `ErrorKind`.
    pub fn new(kind: ErrorKind) -> Self {
        Self { kind, error: None }
    }

    /// Construct an `Error` from an `ErrorKind` and a detail object.
    pub fn with_detail<T>(kind: ErrorKind, error: T) -> Self
    where
        T: Into<Box<dyn error::Error + Send + Sync>>,
    {
        Self {
            kind,
            error: Some(error.into()),
        }
    }

    /// Get the kind of the error.
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.error
            .as_ref()
            .map(|e| &**e as &(dyn error::Error + 'static))
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(ref error) = self.error {
            write!(f, "{:?}: {}", self.kind, error)
        } else {
            write!(f, "{:?}", self.kind)
        }
    }
}

/// The result type used by the dispatcher.
pub type Result<T> = std::result::Result<T, Error>;
