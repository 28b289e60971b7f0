/*
 * linpama - Package transaction engine for Arch Linux front ends.
 * Copyright (C) 2025  linpama contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */

//! Package transaction engine for Arch Linux front ends.
//!
//! A front end submits intents (search, install, remove, AUR build) and
//! renders the [`Event`]s the engine emits. The engine:
//! - aggregates `pacman -Ss` and AUR RPC searches, honouring only the latest request
//! - supervises exactly one pacman/makepkg transaction at a time
//! - caches the session credential and hands it to sudo through a transient askpass helper
//! - gates every AUR build behind a mandatory human review of the PKGBUILD

pub mod aur;
pub mod config;
pub mod error;
pub mod events;
pub mod logging;
pub mod privilege;
pub mod search;
pub mod transaction;

pub use config::{Config, Preferences};
pub use error::{ErrorKind, LinpamaError, LinpamaResult};
pub use events::Event;
pub use privilege::{Credential, CredentialStore, Session};
pub use search::{PackageRecord, Repository, SearchAggregator, SearchRequest, SearchSession};
pub use transaction::{
    CredentialResponse, LogBuffer, ReviewDecision, Supervisor, TransactionIntent,
    TransactionKind, TransactionSnapshot, TransactionState,
};
