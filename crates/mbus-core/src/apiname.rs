//! API naming rules.

/// Bytes forbidden anywhere in an API name.
const FORBIDDEN: &[u8] = b"\"#%&'/?`\\";

/// Check an API name: non-empty, starts with a visible ASCII character,
/// and contains no control character, no DEL, and none of
/// `"` `#` `%` `&` `'` `/` `?` `` ` `` `\`.
pub fn is_valid_api_name(name: &str) -> bool {
    let bytes = name.as_bytes();
    match bytes.first() {
        None => return false,
        Some(&first) if !(0x21..=0x7e).contains(&first) => return false,
        Some(_) => {}
    }
    bytes
        .iter()
        .all(|&b| b > 0x1f && b != 0x7f && !FORBIDDEN.contains(&b))
}
