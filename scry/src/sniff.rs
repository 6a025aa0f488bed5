//! Content-type detection from leading bytes.
//!
//! Signatures live in a small prefix trie built once per process. Edges match
//! an exact byte or any byte, which covers container formats like WebP where
//! a length field sits inside the signature. The longest matching signature
//! wins.

use std::collections::HashMap;
use std::sync::OnceLock;

#[derive(Default)]
struct TrieNode {
    exact: HashMap<u8, TrieNode>,
    any: Option<Box<TrieNode>>,
    content_type: Option<&'static str>,
}

#[derive(Default)]
struct SignatureTrie {
    root: TrieNode,
}

impl SignatureTrie {
    /// Register a signature where `None` steps match any single byte.
    fn register(&mut self, pattern: &[Option<u8>], content_type: &'static str) {
        let mut node = &mut self.root;
        for step in pattern {
            node = match step {
                Some(byte) => node.exact.entry(*byte).or_default(),
                None => node.any.get_or_insert_with(Box::default),
            };
        }
        node.content_type = Some(content_type);
    }

    fn register_prefix(&mut self, prefix: &[u8], content_type: &'static str) {
        let pattern: Vec<Option<u8>> = prefix.iter().copied().map(Some).collect();
        self.register(&pattern, content_type);
    }

    fn lookup(&self, bytes: &[u8]) -> Option<&'static str> {
        lookup_from(&self.root, bytes, 0).map(|(_, content_type)| content_type)
    }
}

fn lookup_from(node: &TrieNode, bytes: &[u8], depth: usize) -> Option<(usize, &'static str)> {
    let mut best = node.content_type.map(|content_type| (depth, content_type));
    if let Some((first, rest)) = bytes.split_first() {
        let branches = [node.exact.get(first), node.any.as_deref()];
        for next in branches.into_iter().flatten() {
            if let Some(found) = lookup_from(next, rest, depth + 1) {
                if best.map_or(true, |(best_depth, _)| found.0 > best_depth) {
                    best = Some(found);
                }
            }
        }
    }
    best
}

fn signature_table() -> &'static SignatureTrie {
    static TABLE: OnceLock<SignatureTrie> = OnceLock::new();
    TABLE.get_or_init(|| {
        let mut trie = SignatureTrie::default();

        // PNG: 89 50 4E 47 0D 0A 1A 0A
        trie.register_prefix(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A], "image/png");
        // JPEG: FF D8 FF
        trie.register_prefix(&[0xFF, 0xD8, 0xFF], "image/jpeg");
        // GIF: "GIF87a" / "GIF89a"
        trie.register_prefix(b"GIF87a", "image/gif");
        trie.register_prefix(b"GIF89a", "image/gif");
        // BMP: "BM"
        trie.register_prefix(&[0x42, 0x4D], "image/bmp");
        // TIFF: 49 49 2A 00 (little-endian) / 4D 4D 00 2A (big-endian)
        trie.register_prefix(&[0x49, 0x49, 0x2A, 0x00], "image/tiff");
        trie.register_prefix(&[0x4D, 0x4D, 0x00, 0x2A], "image/tiff");
        // WebP: "RIFF" <4-byte size> "WEBP"
        trie.register(
            &[
                Some(0x52),
                Some(0x49),
                Some(0x46),
                Some(0x46),
                None,
                None,
                None,
                None,
                Some(0x57),
                Some(0x45),
                Some(0x42),
                Some(0x50),
            ],
            "image/webp",
        );
        // PDF: "%PDF"
        trie.register_prefix(b"%PDF", "application/pdf");

        trie
    })
}

/// Detect a content type from the leading bytes of a payload.
///
/// Pure lookup against the static signature table. Returns `None` when no
/// registered signature matches, including for inputs shorter than every
/// signature.
pub fn sniff_content_type(bytes: &[u8]) -> Option<&'static str> {
    signature_table().lookup(bytes)
}
