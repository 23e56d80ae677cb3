// SPDX-License-Identifier: LGPL-2.1-or-later
// Copyright (C) 2025 Shahzad A. Bhatti <bhatti@plexobject.com>
//
// This file is part of PlexSpaces.
//
// PlexSpaces is free software: you can redistribute it and/or modify
// it under the terms of the GNU Lesser General Public License as published by
// the Free Software Foundation, either version 2.1 of the License, or
// (at your option) any later version.
//
// PlexSpaces is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Lesser General Public License for more details.
//
// You should have received a copy of the GNU Lesser General Public License
// along with PlexSpaces. If not, see <https://www.gnu.org/licenses/>.

//! # Tracing setup
//!
//! Lock and saga code logs through `tracing`; nothing is printed until a
//! subscriber is installed.

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Install a `fmt` subscriber filtered by `RUST_LOG` (default `info`).
///
/// ## Configuration
/// - `RUST_LOG`: filter directives, e.g. `info,plexspaces_locks=debug`
///
/// Returns an error when a global subscriber is already set.
///
/// ## Examples
/// ```rust,ignore
/// std::env::set_var("RUST_LOG", "plexspaces_saga=debug");
/// plexspaces::init_tracing()?;
/// ```
pub fn init_tracing() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(true))
        .try_init()?;

    tracing::info!("Tracing initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_an_error() {
        let _ = init_tracing();
        assert!(init_tracing().is_err());
    }
}
