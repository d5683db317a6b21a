/// A literal deny-list marker found in an artifact payload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContentHit {
    pub file: String,
    pub marker: String,
    pub offset: usize,
}

/// Scan one payload file for every deny-list marker.
///
/// Empty markers are ignored; they would otherwise match everything.
pub fn scan_bytes(file: &str, bytes: &[u8], markers: &[String]) -> Vec<ContentHit> {
    let mut hits = Vec::new();
    for marker in markers {
        let needle = marker.as_bytes();
        if needle.is_empty() || needle.len() > bytes.len() {
            continue;
        }
        if let Some(offset) = bytes.windows(needle.len()).position(|w| w == needle) {
            hits.push(ContentHit {
                file: file.to_string(),
                marker: marker.clone(),
                offset,
            });
        }
    }
    hits
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finds_literal_marker() {
        let markers = vec!["legacyCheckoutFlow".to_string()];
        let hits = scan_bytes("app.js", b"var x=1;function legacyCheckoutFlow(){}", &markers);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].offset, 17);
        assert_eq!(hits[0].file, "app.js");
    }

    #[test]
    fn clean_payload_has_no_hits() {
        let markers = vec!["legacyCheckoutFlow".to_string(), String::new()];
        assert!(scan_bytes("app.js", b"function checkout(){}", &markers).is_empty());
    }

    #[test]
    fn marker_longer_than_payload_is_skipped() {
        let markers = vec!["a-very-long-marker".to_string()];
        assert!(scan_bytes("x", b"short", &markers).is_empty());
    }
}
