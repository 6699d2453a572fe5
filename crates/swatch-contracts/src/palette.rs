/// Lowercase `#rrggbb` encoding, two zero-padded hex digits per channel.
pub fn hex_from_rgb(rgb: [u8; 3]) -> String {
    format!("#{:02x}{:02x}{:02x}", rgb[0], rgb[1], rgb[2])
}

/// Inverse of [`hex_from_rgb`]. Accepts an optional leading `#` and mixed
/// case; anything that is not exactly six hex digits is rejected.
pub fn parse_hex(value: &str) -> Option<[u8; 3]> {
    let digits = value.trim().trim_start_matches('#');
    if digits.len() != 6 {
        return None;
    }
    let bytes = hex::decode(digits).ok()?;
    Some([bytes[0], bytes[1], bytes[2]])
}
