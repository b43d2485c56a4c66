//! Opaque pagination cursors.
//!
//! A cursor encodes the last row id of the previous page; queries resume
//! with `id > last_id` under the stable `ORDER BY id`.

use base64::Engine;

pub fn encode_cursor(last_id: i64) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(last_id.to_string())
}

pub fn decode_cursor(cursor: &str) -> Result<i64, String> {
    let bytes = base64::engine::general_purpose::URL_SAFE_NO_PAD
        .decode(cursor)
        .map_err(|_| format!("invalid cursor {cursor:?}"))?;
    let text = String::from_utf8(bytes).map_err(|_| format!("invalid cursor {cursor:?}"))?;
    text.parse()
        .map_err(|_| format!("invalid cursor {cursor:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        for id in [0, 1, 42, i64::MAX] {
            assert_eq!(decode_cursor(&encode_cursor(id)).unwrap(), id);
        }
    }

    #[test]
    fn test_garbage_is_rejected() {
        assert!(decode_cursor("!!!").is_err());
        assert!(decode_cursor(&base64::engine::general_purpose::URL_SAFE_NO_PAD.encode("abc")).is_err());
    }
}
