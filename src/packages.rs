use crate::errors::{Result, SandboxError};
use crate::hostfs;
use crate::policy::normalize_package;
use crate::runtime::{ContainerRef, ContainerRuntime, ExecControl, ExecInvocation, ExecOutcome};
use crate::security::SecurityValidator;
use crate::session::SessionState;
use crate::vfs::RESERVED_DIR;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const SITE_PACKAGES: &str = "site-packages";
const MAX_RECORD_BYTES: u64 = 16 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PackageReport {
    /// Newly installed or removed, depending on the operation
    pub changed: Vec<String>,
    /// Already in the requested state
    pub unchanged: Vec<String>,
    pub installed_packages: Vec<String>,
}

/// Installs packages into a session's `.sandbox/site-packages` with pip
/// running inside the session container.
pub struct PackageManager {
    runtime: Arc<dyn ContainerRuntime>,
    validator: Arc<SecurityValidator>,
    allowed: Option<HashSet<String>>,
    timeout: Duration,
}

impl PackageManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        validator: Arc<SecurityValidator>,
        allowed: Option<Vec<String>>,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            validator,
            allowed: allowed.map(|names| names.iter().map(|n| normalize_package(n)).collect()),
            timeout,
        }
    }

    /// Check specifiers against the blocked tier and the allow-list.
    pub fn check(&self, packages: &[String]) -> Result<()> {
        if packages.is_empty() {
            return Err(SandboxError::InvalidRequest("no packages given".into()));
        }
        self.validator.validate_packages(packages)?;
        if let Some(allowed) = &self.allowed {
            let refused: Vec<String> = packages
                .iter()
                .filter(|p| !allowed.contains(&normalize_package(p)))
                .cloned()
                .collect();
            if !refused.is_empty() {
                return Err(SandboxError::PackageBlocked(refused));
            }
        }
        Ok(())
    }

    /// Install what is not installed yet. Either every requested package
    /// lands in site-packages or nothing changes.
    ///
    /// The caller holds the session's execution permit and passes its
    /// locked state and running container.
    pub async fn install(
        &self,
        state: &mut SessionState,
        container: &ContainerRef,
        packages: &[String],
    ) -> Result<PackageReport> {
        self.check(packages)?;

        let (pending, unchanged): (Vec<String>, Vec<String>) = packages
            .iter()
            .cloned()
            .partition(|p| !state.installed_packages.contains(&normalize_package(p)));
        if pending.is_empty() {
            return Ok(PackageReport {
                changed: Vec::new(),
                unchanged,
                installed_packages: state.installed_packages.clone(),
            });
        }

        let workspace = state.workspace_path()?;
        let staging_name = format!("staging-{}", uuid::Uuid::new_v4());
        let staging = hostfs::ensure_dir(&workspace, &Path::new(RESERVED_DIR).join(&staging_name))?;
        let guest_staging = format!(
            "{}/{}/{}",
            container.guest_workspace.trim_end_matches('/'),
            RESERVED_DIR,
            staging_name
        );

        let outcome = self.run_pip(container, &guest_staging, &pending).await;
        let promoted = match outcome {
            Ok(()) => hostfs::ensure_dir(&workspace, &Path::new(RESERVED_DIR).join(SITE_PACKAGES))
                .map_err(SandboxError::from)
                .and_then(|site| promote(&staging, &site)),
            Err(e) => Err(e),
        };
        if let Err(e) = std::fs::remove_dir_all(&staging) {
            warn!("[PACKAGES] Failed to remove staging dir {:?}: {}", staging, e);
        }
        promoted?;

        let mut changed = Vec::new();
        for package in &pending {
            let name = normalize_package(package);
            if !state.installed_packages.contains(&name) {
                state.installed_packages.push(name.clone());
            }
            changed.push(name);
        }
        state.installed_packages.sort();
        info!("[PACKAGES] Installed {:?} into {}", changed, container.name);

        Ok(PackageReport {
            changed,
            unchanged,
            installed_packages: state.installed_packages.clone(),
        })
    }

    async fn run_pip(
        &self,
        container: &ContainerRef,
        guest_target: &str,
        packages: &[String],
    ) -> Result<()> {
        let mut argv = vec![
            self.runtime.interpreter(),
            "-m".to_string(),
            "pip".to_string(),
            "install".to_string(),
            "--no-input".to_string(),
            "--disable-pip-version-check".to_string(),
            "--no-warn-script-location".to_string(),
            "--target".to_string(),
            guest_target.to_string(),
        ];
        argv.extend(packages.iter().cloned());

        let invocation = ExecInvocation {
            id: uuid::Uuid::new_v4().to_string(),
            argv,
            env: vec![("PIP_NO_CACHE_DIR".to_string(), "1".to_string())],
            workdir: container.guest_workspace.clone(),
        };
        match self
            .runtime
            .exec(container, invocation, ExecControl::with_timeout(self.timeout))
            .await?
        {
            ExecOutcome::Completed(output) if output.exit_code == 0 => Ok(()),
            ExecOutcome::Completed(output) => {
                let tail: String = output
                    .stderr
                    .lines()
                    .rev()
                    .take(5)
                    .collect::<Vec<_>>()
                    .into_iter()
                    .rev()
                    .collect::<Vec<_>>()
                    .join("\n");
                Err(SandboxError::PackageInstallError(format!(
                    "pip exited with {}: {}",
                    output.exit_code, tail
                )))
            }
            ExecOutcome::TimedOut => Err(SandboxError::PackageInstallError(format!(
                "pip timed out after {}s",
                self.timeout.as_secs()
            ))),
            ExecOutcome::Cancelled => {
                Err(SandboxError::PackageInstallError("pip was cancelled".into()))
            }
        }
    }

    /// Remove installed packages. Files are taken from each distribution's
    /// RECORD when present.
    pub fn uninstall(&self, state: &mut SessionState, packages: &[String]) -> Result<PackageReport> {
        if packages.is_empty() {
            return Err(SandboxError::InvalidRequest("no packages given".into()));
        }
        let site = hostfs::existing_dir(
            &state.workspace_path()?,
            &Path::new(RESERVED_DIR).join(SITE_PACKAGES),
        )?;

        let mut changed = Vec::new();
        let mut unchanged = Vec::new();
        for package in packages {
            let name = normalize_package(package);
            if !state.installed_packages.contains(&name) {
                unchanged.push(name);
                continue;
            }
            if let Some(site) = &site {
                remove_distribution(site, &name)?;
            }
            state.installed_packages.retain(|p| p != &name);
            changed.push(name);
        }
        if !changed.is_empty() {
            info!("[PACKAGES] Removed {:?}", changed);
        }
        Ok(PackageReport {
            changed,
            unchanged,
            installed_packages: state.installed_packages.clone(),
        })
    }
}

/// Move every top-level entry of `staging` into `site`, replacing older copies.
fn promote(staging: &Path, site: &Path) -> Result<()> {
    for entry in std::fs::read_dir(staging)? {
        let entry = entry?;
        let name = PathBuf::from(entry.file_name());
        hostfs::remove_all(site, &name)?;
        std::fs::rename(entry.path(), site.join(&name))?;
    }
    Ok(())
}

/// `*.dist-info` directories of `name`. Symlinked entries are ignored.
fn dist_info_dirs(site: &Path, name: &str) -> Result<Vec<String>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(site)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let file_name = entry.file_name();
        let Some(file_name) = file_name.to_str() else {
            continue;
        };
        let Some(stem) = file_name.strip_suffix(".dist-info") else {
            continue;
        };
        let dist = stem.rsplit_once('-').map(|(d, _)| d).unwrap_or(stem);
        if normalize_package(dist) == name {
            found.push(file_name.to_string());
        }
    }
    Ok(found)
}

fn remove_distribution(site: &Path, name: &str) -> Result<()> {
    let dist_infos = dist_info_dirs(site, name)?;
    let mut touched_dirs = HashSet::new();

    for dist_info in &dist_infos {
        let record_path = Path::new(dist_info).join("RECORD");
        let record = hostfs::read_capped(site, &record_path, MAX_RECORD_BYTES)?
            .and_then(|bytes| String::from_utf8(bytes).ok())
            .unwrap_or_default();
        for line in record.lines() {
            let Some(relative) = line.split(',').next().filter(|r| !r.is_empty()) else {
                continue;
            };
            // RECORD paths are relative to site-packages; never follow one out of it.
            let relative = Path::new(relative);
            if !relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)))
            {
                continue;
            }
            hostfs::remove_file(site, relative)?;
            if let Some(parent) = relative.parent().filter(|p| !p.as_os_str().is_empty()) {
                touched_dirs.insert(parent.to_path_buf());
            }
        }
        hostfs::remove_all(site, Path::new(dist_info))?;
    }

    // Without a RECORD, fall back to the conventional import name.
    if dist_infos.is_empty() {
        hostfs::remove_all(site, Path::new(&name.replace('-', "_")))?;
    }

    let mut dirs: Vec<PathBuf> = touched_dirs.into_iter().collect();
    dirs.sort_by_key(|d| std::cmp::Reverse(d.components().count()));
    for dir in dirs {
        let mut current = Some(dir.as_path());
        while let Some(relative) = current.filter(|d| !d.as_os_str().is_empty()) {
            let Some(real) = hostfs::existing_dir(site, relative)? else {
                break;
            };
            if std::fs::remove_dir(real).is_err() {
                break;
            }
            current = relative.parent();
        }
    }
    Ok(())
}
