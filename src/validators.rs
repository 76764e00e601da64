//! Input validation and sanitization functions for netrecon
//!
//! Everything that ends up as an argument to `ip` or `iptables` passes through
//! here first. Commands are never run through a shell, but a namespace name
//! still becomes a path under `/var/run/netns` and an interface name is
//! bounded by the kernel.

/// Maximum length of a namespace identifier
pub const MAX_NAMESPACE_LEN: usize = 64;

/// Sanitizes a label for use in an iptables `--comment`.
///
/// Removes control characters, quotes, and shell metacharacters.
/// Limits length to 64 bytes (ASCII characters only).
///
/// # Examples
///
/// ```
/// use netrecon::validators::sanitize_label;
///
/// let safe = sanitize_label("inst-42 web");
/// assert_eq!(safe, "inst-42 web");
///
/// let unsafe_label = "Test\nNewline\"Quote";
/// let safe = sanitize_label(unsafe_label);
/// assert!(!safe.contains('\n'));
/// assert!(!safe.contains('"'));
/// ```
pub fn sanitize_label(input: &str) -> String {
    input
        .chars()
        .filter(|c| {
            // SECURITY: ASCII only, no multi-byte surprises in kernel comments
            c.is_ascii_alphanumeric() || matches!(c, ' ' | '-' | '_' | '.' | ':')
        })
        .take(64)
        .collect()
}

/// Validates a network namespace identifier.
///
/// Rules:
/// - Non-empty, max 64 characters
/// - ASCII alphanumeric, dash, underscore only (no path separators or dots)
///
/// # Errors
///
/// Returns `Err` with a human-readable reason.
pub fn validate_namespace(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Namespace must not be empty".to_string());
    }

    if name.len() > MAX_NAMESPACE_LEN {
        return Err(format!(
            "Namespace too long (max {MAX_NAMESPACE_LEN} characters)"
        ));
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_'))
    {
        return Err("Namespace contains invalid characters".to_string());
    }

    Ok(name)
}

/// Validates a single port number.
///
/// # Errors
///
/// Returns `Err` if port is 0 (reserved).
pub fn validate_port(port: u16) -> Result<u16, String> {
    if port == 0 {
        Err("Port must be between 1 and 65535".to_string())
    } else {
        Ok(port)
    }
}

/// Validates a port range.
///
/// # Errors
///
/// Returns `Err` if:
/// - Either port is 0
/// - Start port is greater than end port
pub fn validate_port_range(start: u16, end: u16) -> Result<(u16, u16), String> {
    validate_port(start)?;
    validate_port(end)?;

    if start > end {
        Err("Start port must be less than or equal to end port".to_string())
    } else {
        Ok((start, end))
    }
}

/// Validates a network interface name.
///
/// Linux kernel interface name rules:
/// - Non-empty, max 15 characters (IFNAMSIZ - 1)
/// - Alphanumeric, dot, dash, underscore only
/// - Cannot be "." or ".."
///
/// # Errors
///
/// Returns `Err` if interface name violates kernel constraints.
pub fn validate_interface(name: &str) -> Result<&str, String> {
    if name.is_empty() {
        return Err("Interface name must not be empty".to_string());
    }

    if name.len() > 15 {
        return Err("Interface name too long (max 15 characters)".to_string());
    }

    if name == "." || name == ".." {
        return Err("Invalid interface name".to_string());
    }

    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_'))
    {
        return Err("Interface name contains invalid characters".to_string());
    }

    Ok(name)
}
