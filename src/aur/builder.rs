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

//! Per-transaction AUR checkouts.
//!
//! An [`AurCheckout`] owns a private temporary directory that disappears when
//! the checkout is dropped, whichever way the transaction ends. Building needs
//! a [`ReviewedCheckout`], which only the supervisor can mint once the
//! operator has approved the recipe.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, warn};

use super::recipe::BuildRecipe;
use crate::error::{LinpamaError, LinpamaResult};
use crate::transaction::ProcessSpec;

const SOURCE_DIR: &str = "source";
const RECIPE_FILE: &str = "PKGBUILD";

/// Fetched (or about to be fetched) recipe repository for one package
pub struct AurCheckout {
    package: String,
    workspace: TempDir,
}

impl AurCheckout {
    /// Create the private workspace, under `build_root` when given
    pub fn create(package: &str, build_root: Option<&Path>) -> LinpamaResult<Self> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("linpama_aur_");

        let workspace = match build_root {
            Some(root) => {
                fs::create_dir_all(root).map_err(|e| {
                    LinpamaError::filesystem(root.display().to_string(), "cannot create build root", e)
                })?;
                builder.tempdir_in(root)
            }
            None => builder.tempdir(),
        }
        .map_err(|e| LinpamaError::SourceFetchFailed {
            package: package.to_string(),
            reason: format!("cannot create build directory: {}", e),
        })?;

        fs::set_permissions(workspace.path(), fs::Permissions::from_mode(0o700)).map_err(|e| {
            LinpamaError::filesystem(
                workspace.path().display().to_string(),
                "cannot restrict build directory",
                e,
            )
        })?;

        debug!("checkout for {} at {}", package, workspace.path().display());

        Ok(Self {
            package: package.to_string(),
            workspace,
        })
    }

    pub fn package(&self) -> &str {
        &self.package
    }

    pub fn workspace(&self) -> &Path {
        self.workspace.path()
    }

    /// Directory the recipe repository is cloned into
    pub fn source_dir(&self) -> PathBuf {
        self.workspace.path().join(SOURCE_DIR)
    }

    /// `git clone <url> source`, run inside the workspace
    pub fn clone_spec(&self, git: &[String], url: &str) -> ProcessSpec {
        ProcessSpec::from_prefix(git, ["clone", "--", url, SOURCE_DIR])
            .current_dir(self.workspace.path())
    }

    /// Read the fetched recipe. A clone without a PKGBUILD is a fetch failure.
    pub fn load_recipe(&self) -> LinpamaResult<BuildRecipe> {
        let text = self.read_recipe_text()?;
        Ok(BuildRecipe::new(self.package.clone(), text))
    }

    fn read_recipe_text(&self) -> LinpamaResult<String> {
        let path = self.source_dir().join(RECIPE_FILE);
        fs::read_to_string(&path).map_err(|e| LinpamaError::SourceFetchFailed {
            package: self.package.clone(),
            reason: format!("no readable {} ({})", RECIPE_FILE, e),
        })
    }

    /// Turn an approved checkout into a buildable one.
    ///
    /// The recipe on disk must still match what the operator saw.
    pub(crate) fn approve(self, recipe: &BuildRecipe) -> LinpamaResult<ReviewedCheckout> {
        let current = BuildRecipe::new(self.package.clone(), self.read_recipe_text()?);
        if current.digest() != recipe.digest() {
            warn!("{} changed after review, refusing to build", RECIPE_FILE);
            return Err(LinpamaError::ReviewRejected {
                package: self.package.clone(),
            });
        }

        Ok(ReviewedCheckout {
            digest: recipe.digest().to_string(),
            checkout: self,
        })
    }

    /// Remove the workspace now instead of on drop
    pub fn close(self) -> LinpamaResult<()> {
        let path = self.workspace.path().display().to_string();
        self.workspace
            .close()
            .map_err(|e| LinpamaError::filesystem(path, "cannot remove build directory", e))
    }
}

impl std::fmt::Debug for AurCheckout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AurCheckout")
            .field("package", &self.package)
            .field("workspace", &self.workspace.path())
            .finish()
    }
}

/// A checkout whose recipe the operator approved
#[derive(Debug)]
pub struct ReviewedCheckout {
    checkout: AurCheckout,
    digest: String,
}

impl ReviewedCheckout {
    pub fn package(&self) -> &str {
        self.checkout.package()
    }

    pub fn workspace(&self) -> &Path {
        self.checkout.workspace()
    }

    /// Digest of the approved recipe
    pub fn digest(&self) -> &str {
        &self.digest
    }

    /// `makepkg <args>` inside the cloned sources
    pub fn build_spec(&self, makepkg: &[String], args: &[String]) -> ProcessSpec {
        ProcessSpec::from_prefix(makepkg, args.iter().cloned())
            .current_dir(self.checkout.source_dir())
    }
}
