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

//! Events delivered to the front end.

use crate::aur::BuildRecipe;
use crate::search::SearchOutcome;
use crate::transaction::TransactionSnapshot;

/// Everything a front end needs to render, in the order it happened
#[derive(Debug, Clone)]
pub enum Event {
    /// Results for the latest issued search request
    SearchCompleted(SearchOutcome),
    /// The latest search could not produce any results
    SearchFailed {
        request_id: u64,
        query: String,
        reason: String,
    },
    /// Supervisor state projection after a transition
    TransactionStateChanged(TransactionSnapshot),
    /// One line of child-process output (or a supervisor note)
    LogAppended(String),
    /// Terminal outcome of a transaction
    TransactionCompleted { success: bool, package: String },
    /// The pending intent needs the session credential
    CredentialRequested { package: String },
    /// A fetched build recipe awaits the operator's decision
    ReviewRequested { recipe: BuildRecipe },
    /// Indeterminate progress pulse while a child runs
    ProgressTick,
}

impl Event {
    /// Whether this event ends a transaction
    pub fn is_terminal(&self) -> bool {
        matches!(self, Event::TransactionCompleted { .. })
    }
}
