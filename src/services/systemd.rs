//! systemd service manager
//!
//! Writes unit files under `/etc/systemd/system` and drives them with
//! `systemctl`.

use super::{ServiceDefinition, ServiceManager, ServiceState};
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command;
use tracing::{debug, info};

pub struct SystemdManager {
    unit_dir: PathBuf,
}

impl Default for SystemdManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SystemdManager {
    pub fn new() -> Self {
        Self::with_unit_dir("/etc/systemd/system")
    }

    pub fn with_unit_dir(unit_dir: impl Into<PathBuf>) -> Self {
        Self {
            unit_dir: unit_dir.into(),
        }
    }

    pub fn unit_path(&self, name: &str) -> PathBuf {
        self.unit_dir.join(format!("{}.service", name))
    }

    /// Render the unit file for a service definition
    pub fn render_unit(definition: &ServiceDefinition) -> Result<String> {
        let mut command = vec![definition.executable.to_string_lossy().into_owned()];
        command.extend(definition.args.iter().cloned());
        let exec_start = shlex::try_join(command.iter().map(String::as_str))
            .context("Service command line cannot be quoted")?;
        let restart = if definition.restart_on_failure {
            "Restart=on-failure\nRestartSec=10"
        } else {
            "Restart=no"
        };

        Ok(format!(
            "[Unit]\n\
             Description={description}\n\
             After=network-online.target\n\
             Wants=network-online.target\n\
             \n\
             [Service]\n\
             Type=simple\n\
             ExecStart={exec_start}\n\
             {restart}\n\
             KillMode=control-group\n\
             \n\
             [Install]\n\
             WantedBy=multi-user.target\n",
            description = definition.description,
            exec_start = exec_start,
            restart = restart,
        ))
    }
}

#[async_trait]
impl ServiceManager for SystemdManager {
    async fn install(&self, definition: &ServiceDefinition) -> Result<()> {
        let unit = Self::render_unit(definition)?;
        let path = self.unit_path(&definition.name);

        let current = tokio::fs::read_to_string(&path).await.ok();
        if current.as_deref() == Some(unit.as_str()) {
            debug!("Service {} is up to date", definition.name);
            return Ok(());
        }

        tokio::fs::create_dir_all(&self.unit_dir)
            .await
            .with_context(|| format!("Failed to create {}", self.unit_dir.display()))?;
        tokio::fs::write(&path, unit)
            .await
            .with_context(|| format!("Failed to write unit file {}", path.display()))?;
        info!("Installed service {} ({})", definition.name, path.display());

        run_command(&get_daemon_reload_command()).await?;
        run_command(&get_enable_command(&definition.name)).await
    }

    async fn uninstall(&self, name: &str) -> Result<()> {
        let path = self.unit_path(name);
        if !path.exists() {
            return Ok(());
        }

        // A service that is already stopped or disabled is fine here
        let _ = run_command(&get_stop_command(name)).await;
        let _ = run_command(&get_disable_command(name)).await;

        tokio::fs::remove_file(&path)
            .await
            .with_context(|| format!("Failed to remove unit file {}", path.display()))?;
        info!("Removed service {}", name);

        run_command(&get_daemon_reload_command()).await
    }

    async fn query(&self, name: &str) -> Result<ServiceState> {
        if !self.unit_path(name).exists() {
            return Ok(ServiceState::NotInstalled);
        }

        let cmd = get_status_command(name);
        let output = Command::new(&cmd[0])
            .args(&cmd[1..])
            .output()
            .await
            .with_context(|| format!("Failed to execute command: {}", cmd.join(" ")))?;

        Ok(parse_active_state(&String::from_utf8_lossy(&output.stdout)))
    }

    async fn start(&self, name: &str) -> Result<()> {
        run_command(&get_start_command(name)).await
    }

    async fn stop(&self, name: &str) -> Result<()> {
        run_command(&get_stop_command(name)).await
    }
}

/// Map `systemctl is-active` output to a service state
fn parse_active_state(output: &str) -> ServiceState {
    match output.trim() {
        "active" => ServiceState::Running,
        "activating" | "deactivating" | "reloading" | "refreshing" => ServiceState::Pending,
        _ => ServiceState::Stopped,
    }
}

fn systemctl(args: &[&str]) -> Vec<String> {
    std::iter::once("systemctl")
        .chain(args.iter().copied())
        .map(str::to_string)
        .collect()
}

fn get_start_command(service: &str) -> Vec<String> {
    systemctl(&["start", service])
}

fn get_stop_command(service: &str) -> Vec<String> {
    systemctl(&["stop", service])
}

fn get_enable_command(service: &str) -> Vec<String> {
    systemctl(&["enable", service])
}

fn get_disable_command(service: &str) -> Vec<String> {
    systemctl(&["disable", service])
}

fn get_status_command(service: &str) -> Vec<String> {
    systemctl(&["is-active", service])
}

fn get_daemon_reload_command() -> Vec<String> {
    systemctl(&["daemon-reload"])
}

/// Run a command and return the result
async fn run_command(cmd: &[String]) -> Result<()> {
    if cmd.is_empty() {
        return Ok(());
    }

    let status = Command::new(&cmd[0])
        .args(&cmd[1..])
        .status()
        .await
        .with_context(|| format!("Failed to execute command: {}", cmd.join(" ")))?;

    if status.success() {
        Ok(())
    } else {
        Err(anyhow::anyhow!(
            "Command '{}' failed with exit code: {}",
            cmd.join(" "),
            status.code().unwrap_or(-1)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn definition() -> ServiceDefinition {
        ServiceDefinition {
            name: "sidecar-collector-filebeat".to_string(),
            display_name: "filebeat".to_string(),
            description: "Collector filebeat managed by sidecar".to_string(),
            executable: PathBuf::from("/usr/share/filebeat/bin/filebeat"),
            args: vec![
                "-c".to_string(),
                "/var/lib/sidecar/generated/my beat.yml".to_string(),
            ],
            restart_on_failure: false,
        }
    }

    #[test]
    fn test_get_start_command() {
        let cmd = get_start_command("nginx");
        assert_eq!(cmd, vec!["systemctl", "start", "nginx"]);
    }

    #[test]
    fn test_get_stop_command() {
        let cmd = get_stop_command("nginx");
        assert_eq!(cmd, vec!["systemctl", "stop", "nginx"]);
    }

    #[test]
    fn test_render_unit_quotes_arguments() {
        let unit = SystemdManager::render_unit(&definition()).unwrap();
        let exec_start = unit
            .lines()
            .find_map(|line| line.strip_prefix("ExecStart="))
            .unwrap();
        assert_eq!(
            shlex::split(exec_start).unwrap(),
            vec![
                "/usr/share/filebeat/bin/filebeat",
                "-c",
                "/var/lib/sidecar/generated/my beat.yml"
            ]
        );
        assert!(unit.contains("Description=Collector filebeat managed by sidecar"));
        assert!(unit.contains("KillMode=control-group"));
    }

    #[test]
    fn test_collector_unit_leaves_restarts_to_sidecar() {
        let unit = SystemdManager::render_unit(&definition()).unwrap();
        assert!(unit.contains("\nRestart=no\n"));
        assert!(!unit.contains("Restart=on-failure"));
        assert!(!unit.contains("RestartSec"));

        let mut agent = definition();
        agent.restart_on_failure = true;
        let unit = SystemdManager::render_unit(&agent).unwrap();
        assert!(unit.contains("\nRestart=on-failure\nRestartSec=10\n"));
    }

    #[test]
    fn test_parse_active_state() {
        assert_eq!(parse_active_state("active\n"), ServiceState::Running);
        assert_eq!(parse_active_state("activating"), ServiceState::Pending);
        assert_eq!(parse_active_state("inactive"), ServiceState::Stopped);
        assert_eq!(parse_active_state("failed"), ServiceState::Stopped);
    }

    #[tokio::test]
    async fn test_query_missing_unit() {
        let temp_dir = TempDir::new().unwrap();
        let manager = SystemdManager::with_unit_dir(temp_dir.path());
        assert_eq!(
            manager.query("not-there").await.unwrap(),
            ServiceState::NotInstalled
        );
        assert!(manager.uninstall("not-there").await.is_ok());
    }
}
