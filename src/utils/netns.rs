use std::io;
use std::process::Command;

/// List the named network namespaces present on the node. Output lines
/// look like "n4a3f29c1d8e0 (id: 3)"; only the name matters here.
pub fn list() -> io::Result<Vec<String>> {
    let output = Command::new("ip").args(["netns", "list"]).output()?;
    if !output.status.success() {
        return Err(io::Error::other(format!(
            "ip netns list failed: {}",
            String::from_utf8_lossy(&output.stderr)
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let namespaces = stdout
        .lines()
        .filter_map(|line| line.split_whitespace().next())
        .map(|name| name.to_string())
        .collect();

    Ok(namespaces)
}
