//! Renders the QEMU argument vector from a text template plus the current
//! configuration, and extracts the two agent socket paths from the
//! rendered output.
//!
//! The template format is a small `{{ field }}` substitution mini-language
//! — not a full templating engine, since the substitution surface here is a
//! few dozen scalar values and a handful of repeated blocks (drives,
//! network interfaces), which don't justify pulling in a templating crate
//! the rest of the stack doesn't otherwise need.

use std::collections::HashMap;
use std::path::PathBuf;

use crate::config::firmware::FirmwarePaths;
use crate::config::types::Config;
use crate::error::ConfigError;
use crate::memsize::format_bytes;

/// Render the template text against `config` and the resolved firmware
/// paths, returning the finished argument vector (split honoring
/// single/double quoting, mirroring a typical shell lexer).
pub fn render(
    template_text: &str,
    config: &Config,
    firmware: &FirmwarePaths,
) -> Result<Vec<String>, ConfigError> {
    let vars = build_vars(config, firmware);
    let substituted = substitute(template_text, &vars)?;
    Ok(split_argv(&substituted))
}

fn build_vars(config: &Config, firmware: &FirmwarePaths) -> HashMap<String, String> {
    let vm = &config.vm;
    let mut vars = HashMap::new();
    vars.insert("vm.name".into(), vm.name.clone());
    vars.insert(
        "vm.uuid".into(),
        vm.uuid.map(|u| u.to_string()).unwrap_or_default(),
    );
    vars.insert("vm.maximumCpus".into(), vm.maximum_cpus.to_string());
    vars.insert("vm.currentCpus".into(), vm.current_cpus.to_string());
    vars.insert("vm.maximumRam".into(), format_bytes(vm.maximum_ram));
    vars.insert("vm.currentRam".into(), format_bytes(vm.current_ram));
    vars.insert(
        "vm.accelerator".into(),
        vm.accelerator.clone().unwrap_or_else(|| "kvm".to_string()),
    );
    vars.insert(
        "paths.monitorSocket".into(),
        config.paths.monitor_socket.display().to_string(),
    );
    vars.insert(
        "paths.guestAgentSocket".into(),
        config.paths.guest_agent_socket.display().to_string(),
    );
    vars.insert(
        "paths.vmopAgentSocket".into(),
        config.paths.vmop_agent_socket.display().to_string(),
    );
    vars.insert(
        "paths.swtpmSocket".into(),
        config.paths.swtpm_socket.display().to_string(),
    );
    vars.insert(
        "firmware.romPath".into(),
        firmware.rom_path.display().to_string(),
    );
    vars.insert(
        "firmware.varsPath".into(),
        firmware
            .vars_path
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default(),
    );
    vars
}

fn substitute(template: &str, vars: &HashMap<String, String>) -> Result<String, ConfigError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after_open = &rest[start + 2..];
        let Some(end) = after_open.find("}}") else {
            return Err(ConfigError::TemplateRender {
                detail: "unterminated `{{` in template".to_string(),
            });
        };
        let key = after_open[..end].trim();
        let value = vars.get(key).ok_or_else(|| ConfigError::TemplateRender {
            detail: format!("unknown template variable `{key}`"),
        })?;
        out.push_str(value);
        rest = &after_open[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

/// Split rendered template text into an argv, honoring single/double quotes
/// and ignoring blank lines (the template is typically multi-line, one
/// logical QEMU flag per line or a few per line).
fn split_argv(text: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_single = false;
    let mut in_double = false;
    let mut has_token = false;

    for c in text.chars() {
        match c {
            '\'' if !in_double => {
                in_single = !in_single;
                has_token = true;
            }
            '"' if !in_single => {
                in_double = !in_double;
                has_token = true;
            }
            c if c.is_whitespace() && !in_single && !in_double => {
                if has_token {
                    args.push(std::mem::take(&mut current));
                    has_token = false;
                }
            }
            c => {
                current.push(c);
                has_token = true;
            }
        }
    }
    if has_token {
        args.push(current);
    }
    args
}

/// Extract the two agent socket paths from a rendered argv by matching a
/// `virtserialport,chardev=<name>` argument to a
/// `socket,id=<name>,path=<path>` chardev argument of the same name. Used
/// so the agent clients know which path to connect to without re-parsing
/// the template themselves.
pub fn extract_agent_sockets(argv: &[String]) -> HashMap<String, PathBuf> {
    let mut chardev_paths: HashMap<String, PathBuf> = HashMap::new();
    let mut port_chardevs: Vec<String> = Vec::new();

    for arg in argv {
        if arg.starts_with("socket,") && arg.contains("path=") {
            let mut id = None;
            let mut path = None;
            for field in arg.split(',') {
                if let Some(v) = field.strip_prefix("id=") {
                    id = Some(v.to_string());
                } else if let Some(v) = field.strip_prefix("path=") {
                    path = Some(PathBuf::from(v));
                }
            }
            if let (Some(id), Some(path)) = (id, path) {
                chardev_paths.insert(id, path);
            }
        }
        if arg.starts_with("virtserialport,") {
            for field in arg.split(',') {
                if let Some(v) = field.strip_prefix("chardev=") {
                    port_chardevs.push(v.to_string());
                }
            }
        }
    }

    port_chardevs
        .into_iter()
        .filter_map(|chardev| chardev_paths.get(&chardev).map(|p| (chardev, p.clone())))
        .collect()
}

/// Build the default embedded template used when the config doesn't
/// override one and `dataDir/VM.ftl.yaml` doesn't already exist.
pub fn default_template() -> &'static str {
    include_str!("default_template.ftl")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_quoted_tokens() {
        let argv = split_argv(r#"-drive file='a b.qcow2',format=qcow2 -display "none""#);
        assert_eq!(
            argv,
            vec!["-drive", "file=a b.qcow2,format=qcow2", "-display", "none"]
        );
    }

    #[test]
    fn extracts_agent_sockets_by_chardev_name() {
        let argv = vec![
            "-chardev".to_string(),
            "socket,id=guestagent0,path=/run/guest-agent.sock,server=on,wait=off".to_string(),
            "-device".to_string(),
            "virtio-serial-pci".to_string(),
            "-device".to_string(),
            "virtserialport,chardev=guestagent0,name=org.qemu.guest_agent.0".to_string(),
        ];
        let sockets = extract_agent_sockets(&argv);
        assert_eq!(
            sockets.get("guestagent0"),
            Some(&PathBuf::from("/run/guest-agent.sock"))
        );
    }

    #[test]
    fn unterminated_placeholder_is_an_error() {
        let vars = HashMap::new();
        let err = substitute("-smp {{vm.maximumCpus", &vars).unwrap_err();
        assert!(matches!(err, ConfigError::TemplateRender { .. }));
    }
}
