//! Static table of CIP services and classes, keyed by `domain.name`.
//!
//! A static, lazily-validated lookup table rather than a runtime-loaded
//! config: the catalog is part of the binary, not a file an operator
//! edits.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Debug, Clone)]
pub struct CatalogEntry {
    pub key: &'static str,
    pub human_name: &'static str,
    pub service_code: u8,
    pub object_class: u32,
    pub epath_template: &'static str,
    pub required_inputs: &'static [&'static str],
    pub doc: &'static str,
}

pub fn table() -> &'static HashMap<&'static str, CatalogEntry> {
    static TABLE: OnceLock<HashMap<&'static str, CatalogEntry>> = OnceLock::new();
    TABLE.get_or_init(|| {
        let entries = [
            CatalogEntry {
                key: "identity.get_attribute_single",
                human_name: "Get_Attribute_Single (Identity)",
                service_code: 0x0E,
                object_class: 0x01,
                epath_template: "20 01 24 {instance} 30 {attribute}",
                required_inputs: &["instance", "attribute"],
                doc: "Reads a single attribute of the Identity object.",
            },
            CatalogEntry {
                key: "assembly.get_attribute_single",
                human_name: "Get_Attribute_Single (Assembly)",
                service_code: 0x0E,
                object_class: 0x04,
                epath_template: "20 04 24 {instance} 30 03",
                required_inputs: &["instance"],
                doc: "Reads assembly data, the common explicit read for an adapter personality.",
            },
            CatalogEntry {
                key: "assembly.set_attribute_single",
                human_name: "Set_Attribute_Single (Assembly)",
                service_code: 0x10,
                object_class: 0x04,
                epath_template: "20 04 24 {instance} 30 03",
                required_inputs: &["instance", "value"],
                doc: "Writes assembly data.",
            },
            CatalogEntry {
                key: "connection_manager.forward_open",
                human_name: "Forward_Open",
                service_code: 0x54,
                object_class: 0x06,
                epath_template: "20 06 24 01",
                required_inputs: &["rpi_us", "connection_serial"],
                doc: "Opens a Class-1 implicit I/O connection.",
            },
            CatalogEntry {
                key: "connection_manager.forward_close",
                human_name: "Forward_Close",
                service_code: 0x4E,
                object_class: 0x06,
                epath_template: "20 06 24 01",
                required_inputs: &["connection_serial"],
                doc: "Closes a previously opened Class-1 connection.",
            },
            CatalogEntry {
                key: "connection_manager.unconnected_send",
                human_name: "Unconnected_Send",
                service_code: 0x52,
                object_class: 0x06,
                epath_template: "20 06 24 01",
                required_inputs: &["embedded_request"],
                doc: "Routes an embedded unconnected message, typically across a bridge.",
            },
            CatalogEntry {
                key: "symbol.read_tag",
                human_name: "Read_Tag",
                service_code: 0x4C,
                object_class: 0x6B,
                epath_template: "91 {tag_name}",
                required_inputs: &["tag_name"],
                doc: "Reads a Logix tag by symbolic name (Rockwell custom service).",
            },
            CatalogEntry {
                key: "symbol.write_tag",
                human_name: "Write_Tag",
                service_code: 0x4D,
                object_class: 0x6B,
                epath_template: "91 {tag_name}",
                required_inputs: &["tag_name", "datatype", "write_value"],
                doc: "Writes a Logix tag by symbolic name (Rockwell custom service).",
            },
            CatalogEntry {
                key: "symbol.read_tag_fragmented",
                human_name: "Read_Tag_Fragmented",
                service_code: 0x52,
                object_class: 0x6B,
                epath_template: "91 {tag_name}",
                required_inputs: &["tag_name"],
                doc: "Reads a Logix tag in fragments for payloads larger than one MTU.",
            },
            CatalogEntry {
                key: "template.get_attribute_list",
                human_name: "Get_Attributes_All (Template)",
                service_code: 0x03,
                object_class: 0x6C,
                epath_template: "20 6C 24 {instance}",
                required_inputs: &["instance"],
                doc: "Fetches a UDT template definition (Rockwell custom object).",
            },
            CatalogEntry {
                key: "pccc.execute",
                human_name: "PCCC_Execute",
                service_code: 0x4B,
                object_class: 0x67,
                epath_template: "20 67 24 01",
                required_inputs: &["pccc_bytes"],
                doc: "Tunnels a PCCC command inside a CIP request (Rockwell legacy bridge).",
            },
            CatalogEntry {
                key: "file.initiate_upload",
                human_name: "Initiate_Upload",
                service_code: 0x4B,
                object_class: 0x37,
                epath_template: "20 37 24 {instance}",
                required_inputs: &["instance"],
                doc: "Starts a File object upload transfer.",
            },
            CatalogEntry {
                key: "modbus.passthrough",
                human_name: "Modbus_Pass_Through",
                service_code: 0x4B,
                object_class: 0x44,
                epath_template: "20 44 24 01",
                required_inputs: &["modbus_bytes"],
                doc: "Tunnels a Modbus PDU through the Modbus object (gateway scenarios).",
            },
            CatalogEntry {
                key: "safety.reset",
                human_name: "Safety_Reset",
                service_code: 0x4C,
                object_class: 0x39,
                epath_template: "20 39 24 01",
                required_inputs: &["reset_bytes"],
                doc: "Resets a CIP Safety device; present for completeness, not safety-rated use.",
            },
        ];
        entries.into_iter().map(|e| (e.key, e)).collect()
    })
}

pub fn lookup(key: &str) -> Option<&'static CatalogEntry> {
    table().get(key)
}

pub fn list_by_domain(domain: &str) -> Vec<&'static CatalogEntry> {
    table()
        .values()
        .filter(|e| e.key.starts_with(domain) && e.key.as_bytes().get(domain.len()) == Some(&b'.'))
        .collect()
}

pub fn search(query: &str) -> Vec<&'static CatalogEntry> {
    let q = query.to_lowercase();
    table()
        .values()
        .filter(|e| e.key.to_lowercase().contains(&q) || e.human_name.to_lowercase().contains(&q))
        .collect()
}

/// Sanity-checks the catalog against structural expectations. Returns
/// (errors, warnings): missing required-input names or a reused service
/// code across unrelated classes are warnings, not hard errors, since CIP
/// service codes are genuinely context-dependent.
pub fn validate_against_spec() -> (Vec<String>, Vec<String>) {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let mut seen_service_class: HashMap<(u8, u32), &'static str> = HashMap::new();
    for entry in table().values() {
        if entry.required_inputs.is_empty() && entry.epath_template.contains('{') {
            errors.push(format!(
                "{}: template references a param but required_inputs is empty",
                entry.key
            ));
        }
        if let Some(prior) = seen_service_class.insert((entry.service_code, entry.object_class), entry.key) {
            warnings.push(format!(
                "service 0x{:02x} class 0x{:02x} used by both {} and {}",
                entry.service_code, entry.object_class, prior, entry.key
            ));
        }
    }
    (errors, warnings)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_finds_known_key() {
        assert!(lookup("connection_manager.forward_open").is_some());
        assert!(lookup("nonexistent.key").is_none());
    }

    #[test]
    fn list_by_domain_filters_prefix() {
        let symbol_entries = list_by_domain("symbol");
        assert!(symbol_entries.iter().all(|e| e.key.starts_with("symbol.")));
        assert!(symbol_entries.len() >= 3);
    }

    #[test]
    fn catalog_validates_clean() {
        let (errors, _warnings) = validate_against_spec();
        assert!(errors.is_empty(), "{errors:?}");
    }
}
