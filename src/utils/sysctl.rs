use std::io;
use std::process::Command;

/// Set a kernel parameter. Errors carry the tool's diagnostics.
pub fn set(key: &str, value: &str) -> io::Result<()> {
    let output = Command::new("sysctl")
        .arg("-w")
        .arg(format!("{}={}", key, value))
        .output()?;

    if !output.status.success() {
        return Err(io::Error::other(format!(
            "sysctl {}={} failed: {}",
            key,
            value,
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    Ok(())
}

/// Enable the packet forwarding switches instance traffic depends on.
pub fn enable_forwarding() -> io::Result<()> {
    set("net.ipv4.ip_forward", "1")?;
    set("net.ipv6.conf.all.forwarding", "1")?;
    Ok(())
}
