//! System-wide proxy toggling. Only macOS is supported; other platforms are
//! no-ops so callers need not guard.

#[cfg(target_os = "macos")]
mod macos {
    use std::io;
    use std::process::Command;
    use tracing::debug;

    /// Point every network service's HTTP and HTTPS proxy at `host:port`.
    pub fn enable(host: &str, port: u16) -> io::Result<()> {
        let port = port.to_string();
        for service in network_services()? {
            debug!("enabling system proxy for {:?}", service);
            let service = service.as_str();
            for args in [
                vec!["-setwebproxy", service, host, port.as_str()],
                vec!["-setsecurewebproxy", service, host, port.as_str()],
                vec!["-setwebproxystate", service, "on"],
                vec!["-setsecurewebproxystate", service, "on"],
            ] {
                let output = Command::new("networksetup").args(&args).output()?;
                if !output.status.success() {
                    return Err(io::Error::other(format!(
                        "networksetup {:?}: {}",
                        args,
                        String::from_utf8_lossy(&output.stderr).trim()
                    )));
                }
            }
        }
        Ok(())
    }

    /// Turn the system proxies back off, ignoring individual failures.
    pub fn disable() {
        let Ok(services) = network_services() else {
            return;
        };
        for service in services {
            debug!("disabling system proxy for {:?}", service);
            let service = service.as_str();
            let _ = Command::new("networksetup")
                .args(["-setwebproxystate", service, "off"])
                .status();
            let _ = Command::new("networksetup")
                .args(["-setsecurewebproxystate", service, "off"])
                .status();
        }
    }

    fn network_services() -> io::Result<Vec<String>> {
        let output = Command::new("networksetup")
            .arg("-listallnetworkservices")
            .output()?;
        if !output.status.success() {
            return Err(io::Error::other("networksetup -listallnetworkservices failed"));
        }
        Ok(String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with("An asterisk"))
            .map(|line| line.trim_start_matches("* ").to_string())
            .collect())
    }
}

#[cfg(target_os = "macos")]
pub use macos::{disable, enable};

#[cfg(not(target_os = "macos"))]
pub fn enable(_host: &str, _port: u16) -> std::io::Result<()> {
    tracing::warn!("system proxy control is only supported on macOS");
    Ok(())
}

#[cfg(not(target_os = "macos"))]
pub fn disable() {}
