pub mod shutdown;

/// One-time process setup shared by every binary in the workspace.
pub fn init() {
    let disable_colors = ["1", "true"].contains(
        &std::env::var("DISABLE_COLORS")
            .unwrap_or_else(|_| String::new())
            .to_lowercase()
            .as_str(),
    );
    owo_colors::set_override(!disable_colors);
}

/// Marks the container ready for a file-based readiness probe.
pub fn signal_ready() {
    if let Err(err) = std::fs::write("/etc/ready", "ready") {
        eprintln!("failed to write readiness file: {err}");
    }
}
