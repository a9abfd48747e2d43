use std::path::{Path, PathBuf};

use crate::error::ConfigError;

use super::types::Firmware;

struct Candidates {
    rom: &'static [&'static str],
    vars: &'static [&'static str],
}

/// Built-in candidate path lists per firmware variant. The first existing
/// path wins.
fn candidates(firmware: Firmware) -> Candidates {
    match firmware {
        Firmware::Bios => Candidates {
            rom: &["/usr/share/seabios/bios-256k.bin", "/usr/share/qemu/bios-256k.bin"],
            vars: &[],
        },
        Firmware::Uefi => Candidates {
            rom: &[
                "/usr/share/OVMF/OVMF_CODE.fd",
                "/usr/share/edk2/ovmf/OVMF_CODE.fd",
            ],
            vars: &[
                "/usr/share/OVMF/OVMF_VARS.fd",
                "/usr/share/edk2/ovmf/OVMF_VARS.fd",
            ],
        },
        Firmware::Uefi4m => Candidates {
            rom: &[
                "/usr/share/OVMF/OVMF_CODE_4M.fd",
                "/usr/share/edk2/ovmf/OVMF_CODE_4M.fd",
            ],
            vars: &[
                "/usr/share/OVMF/OVMF_VARS_4M.fd",
                "/usr/share/edk2/ovmf/OVMF_VARS_4M.fd",
            ],
        },
        Firmware::Secure => Candidates {
            rom: &[
                "/usr/share/OVMF/OVMF_CODE.secboot.fd",
                "/usr/share/edk2/ovmf/OVMF_CODE.secboot.fd",
            ],
            vars: &[
                "/usr/share/OVMF/OVMF_VARS.secboot.fd",
                "/usr/share/edk2/ovmf/OVMF_VARS.secboot.fd",
            ],
        },
        Firmware::Secure4m => Candidates {
            rom: &[
                "/usr/share/OVMF/OVMF_CODE_4M.secboot.fd",
                "/usr/share/edk2/ovmf/OVMF_CODE_4M.secboot.fd",
            ],
            vars: &[
                "/usr/share/OVMF/OVMF_VARS_4M.secboot.fd",
                "/usr/share/edk2/ovmf/OVMF_VARS_4M.secboot.fd",
            ],
        },
    }
}

#[derive(Debug, Clone)]
pub struct ResolvedFirmware {
    pub rom_path: PathBuf,
    /// `None` for BIOS, which has no per-VM mutable vars file.
    pub vars_template: Option<PathBuf>,
}

/// Resolve a firmware variant to a concrete ROM path (and VARS template, if
/// any) by probing the candidate lists in order. `exists` is injected so
/// tests can stub the filesystem.
pub fn resolve(
    firmware: Firmware,
    exists: impl Fn(&Path) -> bool,
) -> Result<ResolvedFirmware, ConfigError> {
    let c = candidates(firmware);

    let rom_path = c
        .rom
        .iter()
        .map(PathBuf::from)
        .find(|p| exists(p))
        .ok_or_else(|| ConfigError::FirmwareNotFound {
            variant: format!("{firmware:?}"),
            tried: c.rom.iter().map(PathBuf::from).collect(),
        })?;

    let vars_template = if c.vars.is_empty() {
        None
    } else {
        Some(
            c.vars
                .iter()
                .map(PathBuf::from)
                .find(|p| exists(p))
                .ok_or_else(|| ConfigError::FirmwareNotFound {
                    variant: format!("{firmware:?}"),
                    tried: c.vars.iter().map(PathBuf::from).collect(),
                })?,
        )
    };

    Ok(ResolvedFirmware {
        rom_path,
        vars_template,
    })
}

/// Ensure the per-VM firmware vars file exists in `data_dir`, copying the
/// resolved template on first use; the copy is reused thereafter.
pub fn ensure_vars_file(resolved: &ResolvedFirmware, dest: &Path) -> Result<(), ConfigError> {
    if dest.exists() {
        return Ok(());
    }
    let Some(ref template) = resolved.vars_template else {
        return Ok(());
    };
    std::fs::copy(template, dest).map_err(|source| ConfigError::CreateDir {
        path: dest.to_path_buf(),
        source,
    })?;
    Ok(())
}

/// The final, per-VM firmware paths fed to the QEMU command-line template.
#[derive(Debug, Clone)]
pub struct FirmwarePaths {
    pub rom_path: PathBuf,
    pub vars_path: Option<PathBuf>,
}

/// Resolve a firmware variant against the real filesystem and materialize its
/// per-VM vars file at `dest`, if the variant has one. Kept separate from
/// config loading so that probing `/usr/share/...` stays out of the config
/// parse/validate path; callers invoke this once, after a config is loaded
/// and its data directory exists.
pub fn resolve_and_materialize(
    firmware: Firmware,
    dest: &Path,
) -> Result<FirmwarePaths, ConfigError> {
    let resolved = resolve(firmware, |p| p.exists())?;
    let vars_path = if resolved.vars_template.is_some() {
        ensure_vars_file(&resolved, dest)?;
        Some(dest.to_path_buf())
    } else {
        None
    };
    Ok(FirmwarePaths {
        rom_path: resolved.rom_path,
        vars_path,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bios_has_no_vars() {
        let resolved = resolve(Firmware::Bios, |p| {
            p == Path::new("/usr/share/seabios/bios-256k.bin")
        })
        .unwrap();
        assert!(resolved.vars_template.is_none());
    }

    #[test]
    fn uefi_picks_first_existing_candidate() {
        let resolved = resolve(Firmware::Uefi, |p| {
            p == Path::new("/usr/share/edk2/ovmf/OVMF_CODE.fd")
                || p == Path::new("/usr/share/edk2/ovmf/OVMF_VARS.fd")
        })
        .unwrap();
        assert_eq!(
            resolved.rom_path,
            PathBuf::from("/usr/share/edk2/ovmf/OVMF_CODE.fd")
        );
    }

    #[test]
    fn missing_candidates_error() {
        let err = resolve(Firmware::Uefi, |_| false).unwrap_err();
        assert!(matches!(err, ConfigError::FirmwareNotFound { .. }));
    }
}
