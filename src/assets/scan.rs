use std::collections::HashSet;

use uuid::Uuid;

/// Extract the unique set of asset ids referenced from a content blob.
///
/// References look like `asset://<uuid>`. Two corruption patterns observed in
/// real content are tolerated: a doubled scheme (`asset://asset://<uuid>`)
/// and a doubled id segment (`asset://<uuid>/<uuid>`).
pub fn extract_asset_refs(content: &str, scheme: &str) -> Vec<Uuid> {
    let prefix = format!("{}://", scheme);
    let mut seen = HashSet::new();
    let mut refs = Vec::new();

    let mut rest = content;
    while let Some(pos) = rest.find(&prefix) {
        let mut tail = &rest[pos + prefix.len()..];
        // Doubled scheme corruption: strip repeated prefixes.
        while tail.starts_with(&prefix) {
            tail = &tail[prefix.len()..];
        }
        // A canonical uuid is exactly 36 ASCII chars; taking that slice also
        // drops any doubled `<uuid>/<uuid>` suffix.
        if let Some(candidate) = tail.get(..36) {
            if let Ok(id) = Uuid::parse_str(candidate) {
                if seen.insert(id) {
                    refs.push(id);
                }
            }
        }
        rest = &rest[pos + prefix.len()..];
    }
    refs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_unique_ids() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let content = format!(
            r#"<img src="asset://{a}"/> <img src="asset://{b}"/> <audio src="asset://{a}"/>"#
        );
        assert_eq!(extract_asset_refs(&content, "asset"), vec![a, b]);
    }

    #[test]
    fn tolerates_doubled_scheme_and_segment() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let content = format!(r#"asset://asset://{a} and asset://{b}/{b}"#);
        assert_eq!(extract_asset_refs(&content, "asset"), vec![a, b]);
    }

    #[test]
    fn ignores_garbage_references() {
        let content = "asset://not-a-uuid asset:// asset://123";
        assert!(extract_asset_refs(content, "asset").is_empty());
    }

    #[test]
    fn respects_configured_scheme() {
        let a = Uuid::new_v4();
        let content = format!("media://{a} asset://{a}");
        assert_eq!(extract_asset_refs(&content, "media"), vec![a]);
        assert_eq!(extract_asset_refs(&content, "asset"), vec![a]);
    }
}
