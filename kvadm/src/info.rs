//! Wire codec for the info protocol.
//!
//! Requests and replies are framed with an 8-byte header: a version byte,
//! a type byte and a 48-bit big-endian payload length. The request payload
//! is `<command>\n`; the reply payload echoes the command followed by a TAB
//! and the value. Everything after the frame is plain text, parsed by the
//! helpers at the bottom of this module.

use std::collections::BTreeMap;
use std::io;

use crate::error::Error;

/// Protocol version understood by this codec.
pub const VERSION: u8 = 2;
/// Message type of an info request/reply.
pub const MSG_TYPE: u8 = 1;

/// Frame header length in bytes.
const HEADER_LEN: usize = 8;
/// Upper bound on a reply payload. Replies larger than this are treated as
/// malformed rather than buffered.
const MAX_PAYLOAD: u64 = 1 << 27;

/// Frame a command for the wire.
pub fn encode(command: &str) -> Vec<u8> {
    let payload = (command.len() + 1) as u64;
    let len = payload.to_be_bytes();
    let mut buf = Vec::with_capacity(HEADER_LEN + command.len() + 1);

    buf.push(VERSION);
    buf.push(MSG_TYPE);
    buf.extend_from_slice(&len[2..8]);
    buf.extend_from_slice(command.as_bytes());
    buf.push(b'\n');
    buf
}

/// Read one complete reply payload off the wire.
pub fn decode<R: io::Read + ?Sized>(reader: &mut R) -> Result<String, Error> {
    let mut header = [0u8; HEADER_LEN];
    reader.read_exact(&mut header).map_err(Error::from_io)?;

    if header[0] != VERSION {
        return Err(Error::InvalidResponse(format!(
            "unknown protocol version {}",
            header[0]
        )));
    }
    let mut len = [0u8; 8];
    len[2..8].copy_from_slice(&header[2..8]);
    let len = u64::from_be_bytes(len);

    if len > MAX_PAYLOAD {
        return Err(Error::InvalidResponse(format!(
            "reply of {len} bytes exceeds maximum frame size"
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload).map_err(Error::from_io)?;

    String::from_utf8(payload)
        .map_err(|e| Error::InvalidResponse(format!("reply is not valid UTF-8: {e}")))
}

/// Remove the echoed `<command>\t` prefix and the trailing newline from a
/// reply payload.
pub fn strip_echo<'a>(command: &str, payload: &'a str) -> &'a str {
    let payload = payload.strip_suffix('\n').unwrap_or(payload);

    match payload.split_once('\t') {
        Some((echo, value)) if echo == command => value,
        _ => payload,
    }
}

/// Split on a separator, trimming whitespace and dropping empty items.
pub fn to_list(s: &str, sep: char) -> Vec<String> {
    s.split(sep)
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(str::to_owned)
        .collect()
}

/// Parse a semicolon-delimited `k=v` list. Duplicate keys are last-wins;
/// values stay strings, numeric interpretation is the caller's business.
pub fn to_dict(s: &str) -> BTreeMap<String, String> {
    kv_pairs(s, ';')
}

/// Parse a colon-delimited `k=v` list.
pub fn colon_to_dict(s: &str) -> BTreeMap<String, String> {
    kv_pairs(s, ':')
}

fn kv_pairs(s: &str, sep: char) -> BTreeMap<String, String> {
    let mut map = BTreeMap::new();

    for item in to_list(s, sep) {
        if let Some((k, v)) = item.split_once('=') {
            map.insert(k.to_owned(), v.to_owned());
        }
    }
    map
}

/// Parse a semicolon-delimited list of records, each a `field_sep`-delimited
/// `k=v` list, keyed by the first of `outer_keys` present in the record.
/// A duplicate outer key keeps the record seen first; records missing every
/// outer key are dropped.
pub fn to_dict_multi_level(
    s: &str,
    outer_keys: &[&str],
    field_sep: char,
) -> BTreeMap<String, BTreeMap<String, String>> {
    let mut map = BTreeMap::new();

    for record in to_list(s, ';') {
        let fields = kv_pairs(&record, field_sep);
        let Some(outer) = outer_keys.iter().find_map(|k| fields.get(*k)) else {
            continue;
        };
        map.entry(outer.clone()).or_insert(fields);
    }
    map
}

/// Split at top level on `delim`, ignoring separators nested inside `[]` or
/// `()` groups, and strip one enclosing bracket layer from each segment.
/// Empty segments are kept: field positions are significant in the
/// `peers-*` replies (`<gen>,<port>,[(<name>,<tls>,[<endpoints>]),…]`).
pub fn split_nested(s: &str, delim: char) -> Vec<String> {
    let mut out = Vec::new();
    let mut depth = 0usize;
    let mut start = 0;

    for (i, c) in s.char_indices() {
        match c {
            '[' | '(' => depth += 1,
            ']' | ')' => depth = depth.saturating_sub(1),
            c if c == delim && depth == 0 => {
                out.push(unwrap_group(&s[start..i]));
                start = i + 1;
            }
            _ => {}
        }
    }
    out.push(unwrap_group(&s[start..]));
    out
}

fn unwrap_group(s: &str) -> String {
    let s = s.trim();
    let stripped = s
        .strip_prefix('[')
        .and_then(|s| s.strip_suffix(']'))
        .or_else(|| s.strip_prefix('(').and_then(|s| s.strip_suffix(')')));

    stripped.unwrap_or(s).to_owned()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_encode() {
        let buf = encode("node");
        assert_eq!(&buf[..2], &[VERSION, MSG_TYPE]);
        assert_eq!(&buf[2..8], &[0, 0, 0, 0, 0, 5]);
        assert_eq!(&buf[8..], b"node\n");
    }

    #[test]
    fn test_decode_round_trip() {
        let mut frame = encode("statistics;with;semicolons");
        // Re-frame as a reply by reading our own encoding back.
        let decoded = decode(&mut frame.as_slice()).unwrap();
        assert_eq!(decoded, "statistics;with;semicolons\n");
    }

    #[test]
    fn test_decode_bad_version() {
        let mut frame = encode("node");
        frame[0] = 9;
        assert!(matches!(
            decode(&mut frame.as_slice()),
            Err(Error::InvalidResponse(_))
        ));
    }

    #[test]
    fn test_decode_truncated() {
        let frame = encode("node");
        let mut truncated = &frame[..frame.len() - 2];
        assert!(decode(&mut truncated).is_err());
    }

    #[test]
    fn test_strip_echo() {
        assert_eq!(strip_echo("node", "node\tBB9040011AC4202\n"), "BB9040011AC4202");
        assert_eq!(strip_echo("node", "BB9040011AC4202\n"), "BB9040011AC4202");
        assert_eq!(strip_echo("build", "node\t123\n"), "node\t123");
    }

    #[test]
    fn test_to_dict() {
        let map = to_dict("a=1;b=2;a=3;;junk");
        assert_eq!(map.get("a").map(String::as_str), Some("3"));
        assert_eq!(map.get("b").map(String::as_str), Some("2"));
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn test_to_list() {
        assert_eq!(to_list("a;b;;c;", ';'), vec!["a", "b", "c"]);
        assert_eq!(to_list("", ';'), Vec::<String>::new());
    }

    #[test]
    fn test_colon_to_dict() {
        let map = colon_to_dict("ns=test:set=demo:objects=42");
        assert_eq!(map.get("ns").map(String::as_str), Some("test"));
        assert_eq!(map.get("objects").map(String::as_str), Some("42"));
    }

    #[test]
    fn test_multi_level_first_wins() {
        let map = to_dict_multi_level(
            "filename=a.lua,hash=1;filename=b.lua,hash=2;filename=a.lua,hash=9",
            &["filename"],
            ',',
        );
        assert_eq!(map.len(), 2);
        assert_eq!(map["a.lua"].get("hash").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_multi_level_key_aliases() {
        let map = to_dict_multi_level(
            "dc-name=REMOTE:dc-type=native;DC_Name=OTHER:dc-type=http",
            &["dc-name", "DC_Name"],
            ':',
        );
        assert_eq!(map.len(), 2);
        assert!(map.contains_key("REMOTE") && map.contains_key("OTHER"));
    }

    #[test]
    fn test_split_nested() {
        let parts = split_nested("7,3000,[(B,,[10.0.0.2:3000]),(C,tls-c,[10.0.0.3])]", ',');
        assert_eq!(parts[0], "7");
        assert_eq!(parts[1], "3000");
        assert_eq!(parts[2], "(B,,[10.0.0.2:3000]),(C,tls-c,[10.0.0.3])");

        let peers = split_nested(&parts[2], ',');
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0], "B,,[10.0.0.2:3000]");

        // Field positions are significant: empties survive.
        let fields = split_nested(&peers[0], ',');
        assert_eq!(fields, vec!["B", "", "10.0.0.2:3000"]);
    }
}
