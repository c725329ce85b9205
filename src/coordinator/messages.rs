//! User-safe status text.
//!
//! Technical reason codes never reach the user directly; they are mapped here
//! and the raw detail is kept only as an optional tooltip.

pub const MSG_IDLE: &str = "Select an EMR export (.sqlite, .db) to begin.";
pub const MSG_PROCESSING: &str = "Analyzing export on this device...";
pub const MSG_VALID: &str = "Analysis complete. Only aggregate counts are shown.";
pub const MSG_EMPTY_FILE: &str = "The selected file is empty.";
pub const MSG_NOT_EMR_EXPORT: &str =
    "Not a valid EMR export. No visit, event or patient table was found.";
pub const MSG_BUSY: &str = "An analysis is already running. Wait for it to finish.";
pub const MSG_ENGINE_UNAVAILABLE: &str =
    "The analysis engine is not ready. It is being restarted; select the file again shortly.";
pub const MSG_ENGINE_RESTARTED: &str =
    "The analysis engine stopped and was restarted. Select the file again.";
pub const MSG_FATAL: &str =
    "The analysis engine failed repeatedly. Restart the application to continue.";
pub const MSG_PAYLOAD_INVALID: &str =
    "The analysis produced an unreadable result. Try a different export.";
pub const MSG_READ_FAILED: &str = "The selected file could not be read.";
pub const MSG_CAPACITY: &str = "The file is too large to analyze. Export a smaller date range.";
pub const MSG_GENERIC: &str = "Processing error. Try a different export.";

/// Message for a file rejected before reading.
#[must_use]
pub fn oversized(len: u64, cap: u64) -> String {
    format!(
        "File is {} but the limit is {}. Export a smaller date range.",
        human_bytes(len),
        human_bytes(cap)
    )
}

/// Message shown while the file is read into memory.
#[must_use]
pub fn received(len: u64) -> String {
    format!("File received ({}). Preparing analysis...", human_bytes(len))
}

/// Map an engine reason code to user text. Unknown codes get the generic message.
#[must_use]
pub fn for_reason(reason: &str) -> &'static str {
    match reason {
        "FILE EXCEEDS CAPACITY" => MSG_CAPACITY,
        "EMPTY FILE" => MSG_EMPTY_FILE,
        "NO TABLES FOUND" | "INVALID SCHEMA" => MSG_NOT_EMR_EXPORT,
        "WORKER BUSY" => MSG_BUSY,
        "WORKER NOT READY" | "INIT FAILED" => MSG_ENGINE_UNAVAILABLE,
        _ => MSG_GENERIC,
    }
}

#[allow(clippy::cast_precision_loss)]
fn human_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{value:.1} {}", UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_failures_share_one_message() {
        assert_eq!(for_reason("NO TABLES FOUND"), MSG_NOT_EMR_EXPORT);
        assert_eq!(for_reason("INVALID SCHEMA"), MSG_NOT_EMR_EXPORT);
        assert!(MSG_NOT_EMR_EXPORT.starts_with("Not a valid EMR export"));
    }

    #[test]
    fn unknown_reasons_fall_back_to_generic() {
        assert_eq!(for_reason("PROCESSING FAILED"), MSG_GENERIC);
        assert_eq!(for_reason("near \"FROM\": syntax error"), MSG_GENERIC);
        assert_eq!(for_reason(""), MSG_GENERIC);
    }

    #[test]
    fn every_protocol_reason_is_mapped() {
        for reason in [
            "FILE EXCEEDS CAPACITY",
            "EMPTY FILE",
            "WORKER BUSY",
            "WORKER NOT READY",
            "INIT FAILED",
        ] {
            assert_ne!(for_reason(reason), MSG_GENERIC, "{reason}");
        }
    }

    #[test]
    fn sizes_render_human_readable() {
        assert_eq!(human_bytes(512), "512 B");
        assert_eq!(human_bytes(100 * 1024 * 1024), "100.0 MB");
        let msg = oversized(150 * 1024 * 1024, 100 * 1024 * 1024);
        assert!(msg.contains("150.0 MB"));
        assert!(msg.contains("100.0 MB"));
    }
}
