//! Device ID and token generation.
use rand::{thread_rng, Rng};

/// Source of unique strings for the device ID and purchase-session tokens.
pub trait IdGenerator: Send + Sync {
    /// Produce a random UUID-v4-shaped token.
    fn new_unique_token(&self) -> String;

    /// Produce a 6-character uppercase hex device ID derived from a fresh token.
    fn new_short_device_id(&self) -> String {
        short_device_id(&self.new_unique_token())
    }
}

/// The default generator, backed by the thread-local RNG.
pub struct RandomIdGenerator;

impl IdGenerator for RandomIdGenerator {
    fn new_unique_token(&self) -> String {
        generate_uuid()
    }
}

impl<T: IdGenerator + ?Sized> IdGenerator for std::sync::Arc<T> {
    fn new_unique_token(&self) -> String {
        (**self).new_unique_token()
    }

    fn new_short_device_id(&self) -> String {
        (**self).new_short_device_id()
    }
}

/// Generate a token in the `xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx` format, where `x` is a random hex
/// digit and `y` is one of `8`, `9`, `a`, `b`.
pub fn generate_uuid() -> String {
    let mut rng = thread_rng();
    "xxxxxxxx-xxxx-4xxx-yxxx-xxxxxxxxxxxx"
        .chars()
        .map(|c| {
            let r: u32 = rng.gen_range(0..16);
            match c {
                'x' => hex_digit(r),
                'y' => hex_digit((r & 0x3) | 0x8),
                other => other,
            }
        })
        .collect()
}

fn hex_digit(value: u32) -> char {
    // `value` is always below 16.
    char::from_digit(value, 16).unwrap_or('0')
}

/// 32-bit string hash: `hash = hash * 31 + unit` over UTF-16 code units, wrapping on overflow.
pub fn hash32(s: &str) -> i32 {
    s.encode_utf16()
        .fold(0i32, |hash, unit| hash.wrapping_mul(31).wrapping_add(i32::from(unit)))
}

/// Reduce `token` to a 24-bit value rendered as 6 uppercase hex digits.
pub fn short_device_id(token: &str) -> String {
    let reduced = hash32(token).unsigned_abs() % 0xFF_FFFF;
    format!("{:06X}", reduced)
}
