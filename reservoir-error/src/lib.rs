// Copyright 2024 The Reservoir Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

#![warn(clippy::all)]
//! The error type shared by the reservoir pool crates.
//!
//! Errors are passed around boxed ([BError]). Each error carries an [ErrorType] describing what
//! went wrong, an [ErrorSource] telling whether the backend, the pool or the caller is to blame,
//! and optionally a context string and the error that caused it.

pub use std::error::Error as ErrorTrait;
use std::borrow::Cow;
use std::fmt;
use std::result::Result as StdResult;

/// The boxed [Error], the desired way to pass [Error]
pub type BError = Box<Error>;
/// Syntax sugar for `std::Result<T, BError>`
pub type Result<T, E = BError> = StdResult<T, E>;

/// The context string attached to an [Error]. Static strings are not allocated.
pub type ErrorContext = Cow<'static, str>;

type Cause = Box<dyn ErrorTrait + Send + Sync>;

/// The struct that represents an error
#[derive(Debug)]
pub struct Error {
    /// the type of error
    pub etype: ErrorType,
    /// the party responsible for the error
    pub esource: ErrorSource,
    /// chain to the cause of this error
    pub cause: Option<Cause>,
    /// an arbitrary string that explains the context when the error happens
    pub context: Option<ErrorContext>,
}

/// The source of the error
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ErrorSource {
    /// The backend the connections talk to, i.e. the connection or its factory
    Backend,
    /// The pool itself: admission control, shutdown, timeouts
    Pool,
    /// The caller of the pool, e.g. a cancelled acquisition
    Caller,
    /// Error source unknown or to be set
    Unset,
}

impl ErrorSource {
    /// for displaying the error source
    pub fn as_str(&self) -> &str {
        match self {
            Self::Backend => "Backend",
            Self::Pool => "Pool",
            Self::Caller => "Caller",
            Self::Unset => "",
        }
    }
}

/// Predefined type of errors
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorType {
    // pool errors
    /// The pool is closed or draining, no more connections are handed out
    PoolClosed,
    /// The wait queue is at its configured capacity
    QueueOverflow,
    /// A queued acquisition waited longer than the configured wait timeout
    WaitTimeout,
    /// A queued acquisition was abandoned by its caller
    Cancelled,
    // connection errors
    /// Catch all for failures of `create`, `ping`, `quit` or `close`
    ConnectionFailure,
    ConnectTimedout,
    ConnectRefused,
    ConnectionClosed,
    /// The liveness probe of an idle connection failed
    PingFailure,
    // configuration errors
    InvalidConfig,
    ReadError,
    // other errors
    InternalError,
    /// Custom error with static string.
    /// this field is to allow users to extend the types of errors. If runtime generated string
    /// is needed, it is more likely to be treated as "context" rather than "type".
    Custom(&'static str),
}

impl ErrorType {
    /// create a new type of error. Users should try to make `name` unique.
    pub const fn new(name: &'static str) -> Self {
        ErrorType::Custom(name)
    }

    /// for displaying the error type
    pub fn as_str(&self) -> &str {
        match self {
            ErrorType::PoolClosed => "PoolClosed",
            ErrorType::QueueOverflow => "QueueOverflow",
            ErrorType::WaitTimeout => "WaitTimeout",
            ErrorType::Cancelled => "Cancelled",
            ErrorType::ConnectionFailure => "ConnectionFailure",
            ErrorType::ConnectTimedout => "ConnectTimedout",
            ErrorType::ConnectRefused => "ConnectRefused",
            ErrorType::ConnectionClosed => "ConnectionClosed",
            ErrorType::PingFailure => "PingFailure",
            ErrorType::InvalidConfig => "InvalidConfig",
            ErrorType::ReadError => "ReadError",
            ErrorType::InternalError => "InternalError",
            ErrorType::Custom(s) => s,
        }
    }

    /// Whether the error is raised by the pool's own admission or wait logic rather than by a
    /// connection.
    pub fn is_pool_error(&self) -> bool {
        matches!(
            self,
            ErrorType::PoolClosed
                | ErrorType::QueueOverflow
                | ErrorType::WaitTimeout
                | ErrorType::Cancelled
        )
    }
}

impl Error {
    /// Simply create the error. See other functions that provide less verbose interfaces.
    #[inline]
    pub fn create(
        etype: ErrorType,
        esource: ErrorSource,
        context: Option<ErrorContext>,
        cause: Option<Cause>,
    ) -> BError {
        Box::new(Error {
            etype,
            esource,
            cause,
            context,
        })
    }

    #[inline]
    fn do_new(e: ErrorType, s: ErrorSource) -> BError {
        Self::create(e, s, None, None)
    }

    /// Create an error with the given type
    #[inline]
    pub fn new(e: ErrorType) -> BError {
        Self::do_new(e, ErrorSource::Unset)
    }

    /// Create an error with the given type, a context string and the causing error.
    /// ```
    /// use reservoir_error::{Error, ErrorType, Result};
    ///
    /// fn connect() -> Result<()> {
    ///     Err(Error::new(ErrorType::ConnectRefused))
    /// }
    /// fn warm_up() -> Result<()> {
    ///     connect().map_err(|e| Error::because(ErrorType::ConnectionFailure, "warm up", e))
    /// }
    /// assert!(warm_up().is_err());
    /// ```
    /// Only use because() when there is extra context that is not captured by the causing error
    /// itself.
    #[inline]
    pub fn because<S: Into<ErrorContext>, E: Into<Cause>>(
        e: ErrorType,
        context: S,
        cause: E,
    ) -> BError {
        Self::create(
            e,
            ErrorSource::Unset,
            Some(context.into()),
            Some(cause.into()),
        )
    }

    /// Short for Err(Self::because)
    #[inline]
    pub fn e_because<T, S: Into<ErrorContext>, E: Into<Cause>>(
        e: ErrorType,
        context: S,
        cause: E,
    ) -> Result<T> {
        Err(Self::because(e, context, cause))
    }

    /// Create an error with context but no direct causing error
    #[inline]
    pub fn explain<S: Into<ErrorContext>>(e: ErrorType, context: S) -> BError {
        Self::create(e, ErrorSource::Unset, Some(context.into()), None)
    }

    /// Short for Err(Self::explain)
    #[inline]
    pub fn e_explain<T, S: Into<ErrorContext>>(e: ErrorType, context: S) -> Result<T> {
        Err(Self::explain(e, context))
    }

    /// The new_{backend, pool, caller} functions create new errors with the given source
    #[inline]
    pub fn new_backend(e: ErrorType) -> BError {
        Self::do_new(e, ErrorSource::Backend)
    }

    #[inline]
    pub fn new_pool(e: ErrorType) -> BError {
        Self::do_new(e, ErrorSource::Pool)
    }

    #[inline]
    pub fn new_caller(e: ErrorType) -> BError {
        Self::do_new(e, ErrorSource::Caller)
    }

    pub fn etype(&self) -> &ErrorType {
        &self.etype
    }

    pub fn esource(&self) -> &ErrorSource {
        &self.esource
    }

    pub fn reason_str(&self) -> &str {
        self.etype.as_str()
    }

    pub fn source_str(&self) -> &str {
        self.esource.as_str()
    }

    pub fn into_backend(mut self: BError) -> BError {
        self.esource = ErrorSource::Backend;
        self
    }

    pub fn into_pool(mut self: BError) -> BError {
        self.esource = ErrorSource::Pool;
        self
    }

    pub fn into_caller(mut self: BError) -> BError {
        self.esource = ErrorSource::Caller;
        self
    }

    pub fn set_cause<C: Into<Cause>>(&mut self, cause: C) {
        self.cause = Some(cause.into());
    }

    pub fn set_context<T: Into<ErrorContext>>(&mut self, context: T) {
        self.context = Some(context.into());
    }

    /// Create a new error from self, with the same type and source and put self as the cause
    /// ```
    /// use reservoir_error::{Error, ErrorType, Result};
    ///
    /// fn ping() -> Result<()> {
    ///     Err(Error::new(ErrorType::PingFailure))
    /// }
    /// let e = ping().map_err(|e| e.more_context("conn 7")).unwrap_err();
    /// assert_eq!(e.root_etype(), &ErrorType::PingFailure);
    /// ```
    pub fn more_context<T: Into<ErrorContext>>(self: BError, context: T) -> BError {
        let esource = self.esource;
        let mut e = Self::because(self.etype.clone(), context, self);
        e.esource = esource;
        e
    }

    // Display error but skip the duplicate elements from the error in previous hop
    fn chain_display(&self, previous: Option<&Error>, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if previous.map(|p| p.esource != self.esource).unwrap_or(true) {
            write!(f, "{}", self.esource.as_str())?
        }
        if previous.map(|p| p.etype != self.etype).unwrap_or(true) {
            write!(f, " {}", self.etype.as_str())?
        }

        if let Some(c) = self.context.as_ref() {
            write!(f, " context: {}", c)?;
        }
        if let Some(c) = self.cause.as_ref() {
            if let Some(e) = c.downcast_ref::<BError>() {
                write!(f, " cause: ")?;
                e.chain_display(Some(self), f)
            } else {
                write!(f, " cause: {}", c)
            }
        } else {
            Ok(())
        }
    }

    /// Return the ErrorType of the root Error
    pub fn root_etype(&self) -> &ErrorType {
        self.cause.as_ref().map_or(&self.etype, |c| {
            // Stop the recursion if the cause is not Error
            c.downcast_ref::<BError>()
                .map_or(&self.etype, |e| e.root_etype())
        })
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.chain_display(None, f)
    }
}

impl ErrorTrait for Error {}

/// Helper trait to chain errors with context
pub trait OrErr<T, E> {
    /// Wrap the E in [Result] with new [ErrorType] and context, the existing E will be the cause.
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError>
    where
        E: Into<Cause>;

    /// Similar to or_err(), but takes a closure, which is useful for constructing String.
    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>
    where
        E: Into<Cause>;
}

impl<T, E> OrErr<T, E> for Result<T, E> {
    fn or_err(self, et: ErrorType, context: &'static str) -> Result<T, BError>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(et, context, e))
    }

    fn or_err_with<C: Into<ErrorContext>, F: FnOnce() -> C>(
        self,
        et: ErrorType,
        context: F,
    ) -> Result<T, BError>
    where
        E: Into<Cause>,
    {
        self.map_err(|e| Error::because(et, context(), e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chain_of_error() {
        let e1 = Error::new(ErrorType::ConnectRefused);
        let mut e2 = Error::new(ErrorType::ConnectionFailure);
        e2.set_cause(e1);
        assert_eq!(format!("{}", e2), " ConnectionFailure cause:  ConnectRefused");
        assert_eq!(e2.root_etype().as_str(), "ConnectRefused");

        let e3 = Error::new_backend(ErrorType::PingFailure);
        let e4 = Error::because(ErrorType::ConnectionFailure, "health check", e3);
        assert_eq!(
            format!("{}", e4),
            " ConnectionFailure context: health check cause: Backend PingFailure"
        );
        assert_eq!(e4.root_etype(), &ErrorType::PingFailure);
    }

    #[test]
    fn test_pool_source() {
        let e = Error::new_pool(ErrorType::QueueOverflow);
        assert_eq!(format!("{}", e), "Pool QueueOverflow");
        assert_eq!(e.source_str(), "Pool");
        assert!(e.etype().is_pool_error());
        assert!(!ErrorType::ConnectionFailure.is_pool_error());
    }

    #[test]
    fn test_error_context() {
        let mut e1 = Error::new(ErrorType::WaitTimeout);
        e1.set_context(format!("waited {}ms", 50));
        assert_eq!(format!("{}", e1), " WaitTimeout context: waited 50ms");
    }

    #[test]
    fn test_cause_trait() {
        let e1: Result<(), &'static str> = Err("broken pipe");
        let e2 = e1.or_err(ErrorType::ConnectionClosed, "quit");
        assert_eq!(
            format!("{}", e2.unwrap_err()),
            " ConnectionClosed context: quit cause: broken pipe"
        );
    }

    #[test]
    fn test_custom_type() {
        const MY_ERROR: ErrorType = ErrorType::new("MyError");
        let e = Error::explain(MY_ERROR, String::from("dynamic"));
        assert_eq!(e.reason_str(), "MyError");
        assert_eq!(format!("{}", e), " MyError context: dynamic");
    }
}
