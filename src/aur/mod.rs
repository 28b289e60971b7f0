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

//! AUR (Arch User Repository) support module.
//!
//! - RPC search client with caching
//! - Per-transaction checkouts of recipe repositories
//! - Build recipe capture with advisory scanning for review

pub mod builder;
pub mod client;
pub mod recipe;

pub use builder::{AurCheckout, ReviewedCheckout};
pub use client::{AurClient, AurPackageInfo};
pub use recipe::{BuildRecipe, Finding, RecipeScanner, Severity};

use serde::Deserialize;

/// AUR RPC API response wrapper
#[derive(Debug, Clone, Deserialize)]
pub struct AurRpcResponse {
    #[serde(default)]
    pub version: u32,
    #[serde(rename = "type")]
    pub response_type: String,
    #[serde(default)]
    pub resultcount: usize,
    #[serde(default)]
    pub results: Vec<AurPackageInfo>,
    #[serde(default)]
    pub error: Option<String>,
}
