// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Topology snapshot scanning.
//!
//! The host can dump its entire discovered topology as a structured text
//! document. The orchestrator polls that dump for progress decisions, but
//! it deliberately does not parse the document - it scans for three
//! substrings whose shapes are stable across host versions:
//!
//! - `<device ` opens a device element
//! - `classname="..."` classifies it ("Unrecognized Device" means the
//!   address answered but the product is unknown; "Workstation" is the
//!   host itself)
//! - `<address type="..." value="...">` wraps the devices reachable at one
//!   probe address
//!
//! Everything else in the document is opaque and stays that way.

use std::fmt;

/// Classname the host assigns to devices it could not identify.
pub const CLASS_UNRECOGNIZED: &str = "Unrecognized Device";

/// Classname of the host's own workstation node.
pub const CLASS_WORKSTATION: &str = "Workstation";

// How far past an address marker a device element may sit and still be
// attributed to that address. Matches the host's observed nesting depth.
const ADDRESS_SCAN_WINDOW: usize = 2000;

// A classname attribute further than this from its `<device ` opener
// belongs to some other element.
const CLASSNAME_SCAN_WINDOW: usize = 300;

/// Point-in-time aggregate over one snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TopologyCounts {
    /// Device elements in the document (workstation included).
    pub total_devices: u32,
    /// Devices with a concrete product classname.
    pub identified_devices: u32,
}

impl fmt::Display for TopologyCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} devices, {} identified",
            self.total_devices, self.identified_devices
        )
    }
}

/// Attribute value following `name=` at or after `from`, if the attribute
/// begins within `window` bytes.
///
/// The marker is space-anchored so that e.g. a `name` lookup cannot match
/// the tail of `classname`.
fn attr_value<'a>(doc: &'a str, from: usize, name: &str, window: usize) -> Option<&'a str> {
    let marker = format!(" {}=\"", name);
    let region_end = doc.len().min(from + window);
    let region = &doc[from..region_end];
    let start = from + region.find(&marker)? + marker.len();
    let rest = &doc[start..];
    let end = rest.find('"')?;
    Some(&rest[..end])
}

fn is_identified_classname(classname: &str) -> bool {
    !classname.is_empty() && classname != CLASS_UNRECOGNIZED && classname != CLASS_WORKSTATION
}

/// Count devices and identified devices in a snapshot document.
pub fn count_devices(doc: &str) -> TopologyCounts {
    let mut counts = TopologyCounts::default();
    let mut at = 0;
    while let Some(found) = doc[at..].find("<device ") {
        let pos = at + found;
        counts.total_devices += 1;
        if let Some(classname) = attr_value(doc, pos, "classname", CLASSNAME_SCAN_WINDOW) {
            if is_identified_classname(classname) {
                counts.identified_devices += 1;
            }
        }
        at = pos + 1;
    }
    counts
}

/// Is there an identified device element attributed to `target`'s address
/// in this snapshot?
fn target_identified_at(doc: &str, target: &str) -> bool {
    let pattern = format!("value=\"{}\"", target);
    let Some(addr_pos) = doc.find(&pattern) else {
        return false;
    };

    let window_end = doc.len().min(addr_pos + ADDRESS_SCAN_WINDOW);
    let mut at = addr_pos;
    while at < window_end {
        let Some(found) = doc[at..window_end].find("<device ") else {
            break;
        };
        let pos = at + found;
        if let Some(classname) = attr_value(doc, pos, "classname", CLASSNAME_SCAN_WINDOW) {
            if is_identified_classname(classname) {
                return true;
            }
        }
        at = pos + 1;
    }
    false
}

/// Has *every* one of `targets` been identified in this snapshot?
///
/// Vacuously true on an empty target list; callers gate on non-empty when
/// they use this as an early-exit condition.
pub fn is_target_identified(doc: &str, targets: &[String]) -> bool {
    targets
        .iter()
        .all(|target| target_identified_at(doc, target))
}

/// Harvest `(device name, string address)` pairs from a snapshot.
///
/// For each string-form address marker, the nearest following named device
/// element within the scan window is taken as the device answering there.
/// Reference elements (`<device reference=...>`) carry no name and are
/// skipped.
pub fn device_addresses(doc: &str) -> Vec<(String, String)> {
    const ADDR_MARKER: &str = "<address type=\"String\" value=\"";

    let mut pairs = Vec::new();
    let mut at = 0;
    while let Some(found) = doc[at..].find(ADDR_MARKER) {
        let value_start = at + found + ADDR_MARKER.len();
        let Some(value_len) = doc[value_start..].find('"') else {
            break;
        };
        let address = &doc[value_start..value_start + value_len];
        at = value_start + value_len;

        let window_end = doc.len().min(at + ADDRESS_SCAN_WINDOW);
        if let Some(dev_off) = doc[at..window_end].find("<device ") {
            let dev_pos = at + dev_off;
            if doc[dev_pos + 8..].starts_with("reference") {
                continue;
            }
            if let Some(name) = attr_value(doc, dev_pos, "name", CLASSNAME_SCAN_WINDOW) {
                pairs.push((name.to_string(), address.to_string()));
            }
        }
    }
    pairs
}

#[cfg(test)]
mod tests {
    use super::*;

    const IDENTIFIED_DOC: &str = r#"<topology>
  <device classname="Workstation" name="THIS-WS">
    <bus name="AB_ETH-1">
      <address type="String" value="10.0.0.5">
        <device classname="LogixController" name="1756-L85E"/>
      </address>
      <address type="String" value="10.0.0.9">
        <device classname="Unrecognized Device" name="10.0.0.9"/>
      </address>
    </bus>
  </device>
</topology>"#;

    const UNRECOGNIZED_DOC: &str = r#"<topology>
  <device classname="Workstation" name="THIS-WS">
    <bus name="AB_ETH-1">
      <address type="String" value="10.0.0.5">
        <device classname="Unrecognized Device" name="10.0.0.5"/>
      </address>
    </bus>
  </device>
</topology>"#;

    #[test]
    fn test_counts() {
        let counts = count_devices(IDENTIFIED_DOC);
        assert_eq!(counts.total_devices, 3);
        // Workstation and the unrecognized device are not identified.
        assert_eq!(counts.identified_devices, 1);
    }

    #[test]
    fn test_counts_empty_doc() {
        assert_eq!(count_devices(""), TopologyCounts::default());
        assert_eq!(count_devices("<topology/>"), TopologyCounts::default());
    }

    #[test]
    fn test_target_identified() {
        let targets = vec!["10.0.0.5".to_string()];
        assert!(is_target_identified(IDENTIFIED_DOC, &targets));
    }

    #[test]
    fn test_target_unrecognized_not_identified() {
        let targets = vec!["10.0.0.5".to_string()];
        assert!(!is_target_identified(UNRECOGNIZED_DOC, &targets));
    }

    #[test]
    fn test_target_absent_not_identified() {
        let targets = vec!["192.168.1.1".to_string()];
        assert!(!is_target_identified(IDENTIFIED_DOC, &targets));
    }

    #[test]
    fn test_all_targets_required() {
        // One identified target is not enough when another is missing.
        let targets = vec!["192.168.1.1".to_string(), "10.0.0.5".to_string()];
        assert!(!is_target_identified(IDENTIFIED_DOC, &targets));
    }

    #[test]
    fn test_all_targets_identified() {
        let doc = r#"
          <address type="String" value="10.0.0.5">
            <device classname="LogixController" name="a"/></address>
          <address type="String" value="10.0.0.9">
            <device classname="FlexAdapter" name="b"/></address>"#;
        let targets = vec!["10.0.0.5".to_string(), "10.0.0.9".to_string()];
        assert!(is_target_identified(doc, &targets));
    }

    #[test]
    fn test_device_outside_window_not_attributed() {
        let padding = " ".repeat(ADDRESS_SCAN_WINDOW + 100);
        let doc = format!(
            r#"<address type="String" value="10.0.0.5">{}<device classname="LogixController" name="far"/>"#,
            padding
        );
        assert!(!is_target_identified(&doc, &["10.0.0.5".to_string()]));
    }

    #[test]
    fn test_device_addresses() {
        let pairs = device_addresses(IDENTIFIED_DOC);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&("1756-L85E".to_string(), "10.0.0.5".to_string())));
        assert!(pairs.contains(&("10.0.0.9".to_string(), "10.0.0.9".to_string())));
    }

    #[test]
    fn test_device_addresses_skips_references() {
        let doc = r#"<address type="String" value="10.0.0.7">
          <device reference="elsewhere"/>
        </address>"#;
        assert!(device_addresses(doc).is_empty());
    }

    #[test]
    fn test_counts_display() {
        let counts = count_devices(IDENTIFIED_DOC);
        assert_eq!(counts.to_string(), "3 devices, 1 identified");
    }
}
