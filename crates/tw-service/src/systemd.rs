//! systemd Service Control Manager
//!
//! Registrations are unit files in a unit directory, driven with
//! `systemctl`. Start and stop are queued (`--no-block`) and observed
//! through [`ServiceControlManager::status`]. A deleted unit that is still
//! winding down keeps reporting its state until it goes inactive.

use crate::scm::{ScmConnector, ScmError, ServiceControlManager, ServiceSpec, ServiceStatus};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use tracing::{debug, info, warn};

const SYSTEMCTL: &str = "systemctl";

/// Unit name for a service name, escaped the way `systemd-escape` does
pub fn unit_name(service_name: &str) -> String {
    let mut unit = String::with_capacity(service_name.len() + 8);
    for (i, b) in service_name.bytes().enumerate() {
        match b {
            b'/' => unit.push('-'),
            b'.' if i == 0 => {
                let _ = write!(unit, "\\x{:02x}", b);
            }
            b if b.is_ascii_alphanumeric() || b == b'_' || b == b'.' => unit.push(b as char),
            b => {
                let _ = write!(unit, "\\x{:02x}", b);
            }
        }
    }
    unit.push_str(".service");
    unit
}

/// Quote one `ExecStart=` word
fn quote_exec_arg(arg: &str) -> String {
    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        match c {
            '"' | '\\' => {
                quoted.push('\\');
                quoted.push(c);
            }
            // Specifier and variable expansion
            '%' => quoted.push_str("%%"),
            '$' => quoted.push_str("$$"),
            c => quoted.push(c),
        }
    }
    quoted.push('"');
    quoted
}

/// Unit file text for a registration
pub fn render_unit(spec: &ServiceSpec) -> String {
    let mut exec = quote_exec_arg(&spec.executable.display().to_string());
    for arg in &spec.args {
        exec.push(' ');
        exec.push_str(&quote_exec_arg(arg));
    }

    let mut unit = String::new();
    unit.push_str("[Unit]\n");
    let _ = writeln!(unit, "Description={}", spec.name);
    unit.push_str("Wants=network-online.target\n");
    unit.push_str("After=network-online.target\n\n");
    unit.push_str("[Service]\n");
    unit.push_str("Type=simple\n");
    let _ = writeln!(unit, "ExecStart={}", exec);
    unit.push_str("Restart=on-failure\n");
    if spec.auto_start {
        unit.push_str("\n[Install]\nWantedBy=multi-user.target\n");
    }
    unit
}

/// Map `systemctl show` properties to a run state
fn parse_status(show: &str) -> Option<ServiceStatus> {
    let props: HashMap<&str, &str> = show
        .lines()
        .filter_map(|line| line.split_once('='))
        .collect();
    let load = props.get("LoadState").copied().unwrap_or("not-found");
    let active = props.get("ActiveState").copied().unwrap_or("inactive");

    let status = match active {
        "active" | "reloading" => ServiceStatus::Running,
        "activating" => ServiceStatus::StartPending,
        "deactivating" => ServiceStatus::StopPending,
        _ => ServiceStatus::Stopped,
    };
    // A removed unit lingers while it still has processes
    if load == "not-found" && status == ServiceStatus::Stopped {
        return None;
    }
    Some(status)
}

fn classify(unit: &str, stderr: &str) -> ScmError {
    if stderr.contains("not loaded") || stderr.contains("does not exist") || stderr.contains("not found") {
        ScmError::NotFound(unit.to_string())
    } else if stderr.contains("Failed to connect to bus") {
        ScmError::Connection(stderr.to_string())
    } else {
        ScmError::Backend(stderr.to_string())
    }
}

fn systemctl(args: &[&str]) -> Result<String, ScmError> {
    debug!("{} {}", SYSTEMCTL, args.join(" "));
    let output = Command::new(SYSTEMCTL)
        .args(args)
        .stdin(Stdio::null())
        .output()
        .map_err(|e| ScmError::Connection(format!("{}: {}", SYSTEMCTL, e)))?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let unit = args.last().copied().unwrap_or_default();
        return Err(classify(unit, stderr.trim()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

/// systemd-backed service manager
#[derive(Debug, Clone)]
pub struct SystemdScm {
    unit_dir: PathBuf,
}

impl SystemdScm {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    pub fn unit_path(&self, service_name: &str) -> PathBuf {
        self.unit_dir.join(unit_name(service_name))
    }

    /// Write the unit file without telling systemd
    pub fn write_unit(&self, spec: &ServiceSpec) -> Result<PathBuf, ScmError> {
        let path = self.unit_path(&spec.name);
        if path.exists() {
            return Err(ScmError::AlreadyExists(spec.name.clone()));
        }
        fs::create_dir_all(&self.unit_dir).map_err(|e| backend(&self.unit_dir, e))?;
        fs::write(&path, render_unit(spec)).map_err(|e| backend(&path, e))?;
        Ok(path)
    }

    fn daemon_reload(&self) -> Result<(), ScmError> {
        systemctl(&["daemon-reload"]).map(|_| ())
    }
}

fn backend(path: &Path, e: io::Error) -> ScmError {
    ScmError::Backend(format!("{}: {}", path.display(), e))
}

impl ServiceControlManager for SystemdScm {
    fn status(&self, name: &str) -> Result<Option<ServiceStatus>, ScmError> {
        let unit = unit_name(name);
        let show = systemctl(&["show", "--property=LoadState", "--property=ActiveState", &unit])?;
        Ok(parse_status(&show))
    }

    fn create(&self, spec: &ServiceSpec) -> Result<(), ScmError> {
        let path = self.write_unit(spec)?;
        self.daemon_reload()?;
        if spec.auto_start {
            systemctl(&["enable", &unit_name(&spec.name)])?;
        }
        info!("Registered {} as {}", spec.name, path.display());
        Ok(())
    }

    fn start(&self, name: &str) -> Result<(), ScmError> {
        systemctl(&["start", "--no-block", &unit_name(name)]).map(|_| ())
    }

    fn stop(&self, name: &str) -> Result<(), ScmError> {
        systemctl(&["stop", "--no-block", &unit_name(name)]).map(|_| ())
    }

    fn delete(&self, name: &str) -> Result<(), ScmError> {
        let unit = unit_name(name);
        if let Err(e) = systemctl(&["disable", &unit]) {
            warn!("Failed to disable {}: {}", unit, e);
        }
        let path = self.unit_path(name);
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(ScmError::NotFound(name.to_string()));
            }
            Err(e) => return Err(backend(&path, e)),
        }
        self.daemon_reload()?;
        info!("Removed {}", path.display());
        Ok(())
    }
}

/// Connects to the host's systemd
#[derive(Debug, Clone)]
pub struct SystemdConnector {
    unit_dir: PathBuf,
}

impl SystemdConnector {
    pub fn new(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }
}

impl ScmConnector for SystemdConnector {
    fn connect(&self) -> Result<Arc<dyn ServiceControlManager>, ScmError> {
        systemctl(&["--version"])?;
        Ok(Arc::new(SystemdScm::new(self.unit_dir.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ServiceSpec {
        ServiceSpec {
            name: "Tunwarden Tunnel: office".to_string(),
            executable: PathBuf::from("/usr/bin/tunwarden"),
            args: vec![
                "tunnel-service".to_string(),
                "/etc/tunwarden/office.toml".to_string(),
            ],
            auto_start: true,
        }
    }

    #[test]
    fn test_unit_name_escaping() {
        assert_eq!(
            unit_name("Tunwarden Tunnel: office"),
            "Tunwarden\\x20Tunnel\\x3a\\x20office.service"
        );
        assert_eq!(unit_name("Tunwarden Manager"), "Tunwarden\\x20Manager.service");
        // Distinct names stay distinct
        assert_ne!(unit_name("a-b"), unit_name("a b"));
        assert_ne!(unit_name("Office"), unit_name("office"));
    }

    #[test]
    fn test_render_unit() {
        let unit = render_unit(&spec());
        assert!(unit.contains("Description=Tunwarden Tunnel: office\n"));
        assert!(unit.contains(
            "ExecStart=\"/usr/bin/tunwarden\" \"tunnel-service\" \"/etc/tunwarden/office.toml\"\n"
        ));
        assert!(unit.contains("WantedBy=multi-user.target"));

        let mut manual = spec();
        manual.auto_start = false;
        assert!(!render_unit(&manual).contains("[Install]"));
    }

    #[test]
    fn test_exec_args_are_escaped() {
        assert_eq!(quote_exec_arg("50%"), "\"50%%\"");
        assert_eq!(quote_exec_arg("a\"b"), "\"a\\\"b\"");
        assert_eq!(quote_exec_arg("$HOME"), "\"$$HOME\"");
    }

    #[test]
    fn test_write_unit_refuses_existing() {
        let dir = tempfile::tempdir().unwrap();
        let scm = SystemdScm::new(dir.path());
        let path = scm.write_unit(&spec()).unwrap();
        assert!(fs::read_to_string(path).unwrap().starts_with("[Unit]"));
        assert!(matches!(scm.write_unit(&spec()), Err(ScmError::AlreadyExists(_))));
    }

    #[test]
    fn test_parse_status() {
        assert_eq!(
            parse_status("LoadState=loaded\nActiveState=active\n"),
            Some(ServiceStatus::Running)
        );
        assert_eq!(
            parse_status("ActiveState=activating\nLoadState=loaded\n"),
            Some(ServiceStatus::StartPending)
        );
        assert_eq!(
            parse_status("LoadState=loaded\nActiveState=failed\n"),
            Some(ServiceStatus::Stopped)
        );
        assert_eq!(parse_status("LoadState=not-found\nActiveState=inactive\n"), None);
        // Deleted but still shutting down
        assert_eq!(
            parse_status("LoadState=not-found\nActiveState=deactivating\n"),
            Some(ServiceStatus::StopPending)
        );
    }

    #[test]
    fn test_classify_errors() {
        assert_eq!(
            classify("x.service", "Failed to stop x.service: Unit x.service not loaded."),
            ScmError::NotFound("x.service".into())
        );
        assert!(classify("x", "Failed to connect to bus: No such file or directory").is_connection());
        assert!(matches!(classify("x", "Access denied"), ScmError::Backend(_)));
    }
}
