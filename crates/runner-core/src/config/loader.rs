use std::path::{Path, PathBuf};

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::ConfigError;

use super::types::{Config, Paths, RawConfigFile};

/// Reads and validates the YAML config file, merging in generated values
/// (UUID) and computed paths. Returns the immutable snapshot described in
/// plus the source file's mtime as `as_of`.
pub fn load(path: &Path) -> Result<Config, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound {
            path: path.to_path_buf(),
        });
    }

    let raw_text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let raw: RawConfigFile =
        serde_yaml::from_str(&raw_text).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;

    let section = raw.runner;

    if section.vm.name.trim().is_empty() {
        return Err(ConfigError::MissingField { field: "vm.name" });
    }

    std::fs::create_dir_all(&section.data_dir).map_err(|source| ConfigError::CreateDir {
        path: section.data_dir.clone(),
        source,
    })?;
    std::fs::create_dir_all(&section.runtime_dir).map_err(|source| ConfigError::CreateDir {
        path: section.runtime_dir.clone(),
        source,
    })?;

    let paths = Paths {
        monitor_socket: section
            .monitor_socket
            .clone()
            .unwrap_or_else(|| section.runtime_dir.join("monitor.sock")),
        swtpm_socket: section
            .swtpm_socket
            .clone()
            .unwrap_or_else(|| section.runtime_dir.join("swtpm-sock")),
        guest_agent_socket: section.runtime_dir.join("guest-agent.sock"),
        vmop_agent_socket: section.runtime_dir.join("vmop-agent.sock"),
        data_dir: section.data_dir.clone(),
        runtime_dir: section.runtime_dir.clone(),
    };

    let mut vm = section.vm;
    vm.uuid = Some(ensure_uuid(vm.uuid, &paths.uuid_file())?);

    let as_of = std::fs::metadata(path)
        .and_then(|m| m.modified())
        .map(chrono::DateTime::<chrono::Utc>::from)
        .unwrap_or_else(|_| chrono::Utc::now());

    let has_display_password = paths.display_password_file().exists();

    info!(
        name = %vm.name,
        uuid = %vm.uuid.unwrap(),
        cpus = vm.current_cpus,
        "loaded configuration"
    );

    Ok(Config {
        vm,
        paths,
        cloud_init: section.cloud_init,
        template_override: section.template,
        update_template: section.update_template,
        as_of,
        has_display_password,
        namespace: section.namespace,
        vm_object_name: section.vm_object_name,
        operator_name: section
            .operator_name
            .unwrap_or_else(|| "vmoperator".to_string()),
        generation: section.generation,
    })
}

/// Generate and persist a UUID at `uuid_file` if one isn't already present
/// on disk or in the config. Once generated, it is never regenerated:
/// reloading a config file must not change the VM's identity.
fn ensure_uuid(configured: Option<Uuid>, uuid_file: &Path) -> Result<Uuid, ConfigError> {
    if let Some(uuid) = configured {
        return Ok(uuid);
    }

    if let Ok(existing) = std::fs::read_to_string(uuid_file) {
        if let Ok(uuid) = Uuid::parse_str(existing.trim()) {
            debug!(%uuid, path = %uuid_file.display(), "reusing persisted VM UUID");
            return Ok(uuid);
        }
    }

    let generated = Uuid::new_v4();
    std::fs::write(uuid_file, generated.to_string()).map_err(|source| ConfigError::PersistUuid {
        path: uuid_file.to_path_buf(),
        source,
    })?;
    info!(uuid = %generated, path = %uuid_file.display(), "generated new VM UUID");
    Ok(generated)
}

/// Materialize the QEMU command-line template into `dataDir/VM.ftl.yaml`,
/// copying from the override path or the embedded default on first use, or
/// whenever `updateTemplate` is set ("Persisted state under
/// dataDir" / §4.11).
pub fn load_template_text(config: &Config) -> Result<String, ConfigError> {
    let dest = config.paths.template_file();

    if !dest.exists() || config.update_template {
        let source_text = match &config.template_override {
            Some(path) => std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                path: path.clone(),
                source,
            })?,
            None => super::template::default_template().to_string(),
        };
        std::fs::write(&dest, &source_text).map_err(|source| ConfigError::CreateDir {
            path: dest.clone(),
            source,
        })?;
        return Ok(source_text);
    }

    std::fs::read_to_string(&dest).map_err(|source| ConfigError::Read {
        path: dest,
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_yaml(dir: &Path) -> String {
        format!(
            r#"
/Runner:
  dataDir: {data}
  runtimeDir: {runtime}
  vm:
    name: test-vm
    maximumCpus: 4
    currentCpus: 2
    maximumRam: "4 GiB"
    currentRam: "2 GiB"
"#,
            data = dir.join("data").display(),
            runtime = dir.join("runtime").display(),
        )
    }

    #[test]
    fn loads_minimal_config_and_generates_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, minimal_yaml(dir.path())).unwrap();

        let config = load(&config_path).unwrap();
        assert_eq!(config.vm.name, "test-vm");
        assert_eq!(config.vm.current_cpus, 2);
        assert_eq!(config.vm.current_ram, 2 * (1u64 << 30));
        assert!(config.vm.uuid.is_some());

        let uuid_file = config.paths.uuid_file();
        assert!(uuid_file.exists());
        let persisted: Uuid = std::fs::read_to_string(&uuid_file)
            .unwrap()
            .trim()
            .parse()
            .unwrap();
        assert_eq!(persisted, config.vm.uuid.unwrap());
    }

    #[test]
    fn reload_keeps_same_uuid() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(&config_path, minimal_yaml(dir.path())).unwrap();

        let first = load(&config_path).unwrap();
        let second = load(&config_path).unwrap();
        assert_eq!(first.vm.uuid, second.vm.uuid);
    }

    #[test]
    fn missing_name_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let yaml = format!(
            r#"
/Runner:
  dataDir: {data}
  runtimeDir: {runtime}
  vm:
    name: ""
    maximumCpus: 1
    currentCpus: 1
    maximumRam: "1 GiB"
    currentRam: "1 GiB"
"#,
            data = dir.path().join("data").display(),
            runtime = dir.path().join("runtime").display(),
        );
        std::fs::write(&config_path, yaml).unwrap();

        let err = load(&config_path).unwrap_err();
        assert!(matches!(err, ConfigError::MissingField { field: "vm.name" }));
    }

    #[test]
    fn missing_file_is_reported() {
        let err = load(Path::new("/nonexistent/config.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::NotFound { .. }));
    }
}
