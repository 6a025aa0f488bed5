use base64::{engine::general_purpose, Engine as _};

/// A minimal PNG payload: the eight signature bytes plus filler.
pub fn png_bytes() -> Vec<u8> {
    vec![0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00, 0x01, 0x02, 0x03]
}

/// A minimal JPEG payload.
pub fn jpeg_bytes() -> Vec<u8> {
    vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46, 0x49, 0x46]
}

/// A PNG data URL whose payload encodes `label`, so engines and assertions
/// can tell submitted inputs apart.
pub fn png_data_url(label: &str) -> String {
    format!(
        "data:image/png;base64,{}",
        general_purpose::STANDARD.encode(label)
    )
}
