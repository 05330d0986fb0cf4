// This file is part of cfxmpp.
// Copyright (c) 2019, Cloudflare. All rights reserved.
// See LICENSE for licensing information.

//! Traits for working with errors.

use std::error::Error;

/// `WrapError` lets a result carrying any foreign error type be wrapped in the error type a
/// boundary wants to surface. The configuration parser and the socket layer both consume it.
pub trait WrapError<T: Error> {
    /// The returned type in case that the result has no error.
    type Item;

    /// Wrapping an error in the error type `T`.
    fn wrap_err(self) -> Result<Self::Item, T>;
}

// The 'static bound means T either contains no lifetime parameter or only 'static ones, which is
// what boxing into a trait object requires.
impl<S, T> WrapError<config::ConfigError> for Result<S, T>
where
    T: 'static + Error + Send + Sync,
{
    type Item = S;

    /// Wrap a foreign error into `config::ConfigError` at the config-parsing boundary.
    fn wrap_err(self) -> Result<S, config::ConfigError> {
        self.map_err(|error| config::ConfigError::Foreign(Box::new(error)))
    }
}

impl<S, T> WrapError<std::io::Error> for Result<S, T>
where
    T: 'static + Error + Send + Sync,
{
    type Item = S;

    /// Wrap a foreign error into `std::io::Error` at the syscall boundary.
    fn wrap_err(self) -> Result<S, std::io::Error> {
        self.map_err(|error| std::io::Error::new(std::io::ErrorKind::Other, error))
    }
}
