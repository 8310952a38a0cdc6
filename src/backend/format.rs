// SPDX-License-Identifier: GPL-3.0-only

use smithay::backend::allocator::Fourcc;

use super::error::{Error, Result};

/// Formats a software scanout can present without conversion.
pub const SOFTWARE_FORMATS: &[Fourcc] = &[
    Fourcc::Xrgb8888,
    Fourcc::Argb8888,
    Fourcc::Xbgr8888,
    Fourcc::Abgr8888,
    Fourcc::Rgb888,
    Fourcc::Rgb565,
];

pub fn bits_per_pixel(format: Fourcc) -> Option<u32> {
    match format {
        Fourcc::Xrgb8888 | Fourcc::Argb8888 | Fourcc::Xbgr8888 | Fourcc::Abgr8888 => Some(32),
        Fourcc::Rgb888 | Fourcc::Bgr888 => Some(24),
        Fourcc::Rgb565 | Fourcc::Bgr565 => Some(16),
        _ => None,
    }
}

/// Resolve a raw fourcc code against the formats a backend supports.
pub fn validate(code: u32, supported: &[Fourcc]) -> Result<Fourcc> {
    Fourcc::try_from(code)
        .ok()
        .filter(|format| supported.contains(format))
        .ok_or(Error::UnsupportedFormat(code))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_codes_resolve() {
        assert_eq!(
            validate(Fourcc::Xrgb8888 as u32, SOFTWARE_FORMATS).unwrap(),
            Fourcc::Xrgb8888
        );
        assert_eq!(bits_per_pixel(Fourcc::Rgb565), Some(16));
    }

    #[test]
    fn unknown_and_unsupported_codes_fail() {
        assert!(matches!(
            validate(0xdead_beef, SOFTWARE_FORMATS),
            Err(Error::UnsupportedFormat(0xdead_beef))
        ));
        assert!(validate(Fourcc::Nv12 as u32, SOFTWARE_FORMATS).is_err());
    }
}
