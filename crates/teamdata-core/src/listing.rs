//! XML codec for collection listings.
//!
//! ```xml
//! <resourceList>
//!   <resource name="state" mod="1700000000000" sum="123456"/>
//! </resourceList>
//! ```

use crate::collection::ResourceCollectionInfo;
use crate::error::{Result, SyncError};

const ROOT_TAG: &str = "resourceList";
const RESOURCE_TAG: &str = "resource";
const NAME_ATTR: &str = "name";
const MOD_ATTR: &str = "mod";
const SUM_ATTR: &str = "sum";

/// Parse a listing document. Resources without a name are skipped.
pub fn parse_listing(xml: &str) -> Result<ResourceCollectionInfo> {
    let doc = roxmltree::Document::parse(xml)
        .map_err(|e| SyncError::Protocol(format!("Malformed resource listing: {}", e)))?;

    let root = doc.root_element();
    if root.tag_name().name() != ROOT_TAG {
        return Err(SyncError::Protocol(format!(
            "Unexpected listing root element <{}>",
            root.tag_name().name()
        )));
    }

    let mut info = ResourceCollectionInfo::new();
    for node in root
        .descendants()
        .filter(|n| n.has_tag_name(RESOURCE_TAG))
    {
        let Some(name) = node.attribute(NAME_ATTR).filter(|n| !n.is_empty()) else {
            continue;
        };
        let modified = node
            .attribute(MOD_ATTR)
            .and_then(|v| v.parse::<i64>().ok())
            .unwrap_or(0);
        let checksum = node.attribute(SUM_ATTR).and_then(|v| v.parse::<u64>().ok());
        info.insert(name, checksum, modified);
    }
    Ok(info)
}

/// Serialize a listing document.
pub fn write_listing(info: &ResourceCollectionInfo) -> String {
    let mut out = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
    out.push_str(&format!("<{}>\n", ROOT_TAG));
    for (name, entry) in info.iter() {
        out.push_str(&format!(
            "  <{} {}=\"{}\" {}=\"{}\"",
            RESOURCE_TAG,
            NAME_ATTR,
            escape_attr(name),
            MOD_ATTR,
            entry.last_modified
        ));
        if let Some(sum) = entry.checksum {
            out.push_str(&format!(" {}=\"{}\"", SUM_ATTR, sum));
        }
        out.push_str("/>\n");
    }
    out.push_str(&format!("</{}>\n", ROOT_TAG));
    out
}

fn escape_attr(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&apos;"),
            _ => escaped.push(c),
        }
    }
    escaped
}
